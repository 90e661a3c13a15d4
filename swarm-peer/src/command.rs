//! Line commands for the interactive peer.

use std::path::PathBuf;
use std::str::FromStr;

use swarm_core::{FileId, GroupId, PeerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register { username: String, secret: String },
    Login { peer_id: PeerId, secret: String },
    Logout,
    CreateGroup,
    ListGroups,
    JoinGroup(GroupId),
    ListRequests(GroupId),
    AcceptRequest(GroupId, PeerId),
    RejectRequest(GroupId, PeerId),
    LeaveGroup(GroupId),
    UploadFile(PathBuf),
    ListFiles(GroupId),
    DownloadFile(FileId),
    ShowDownloads,
    Help,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("unknown command `{0}` (try `help`)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

pub const HELP: &str = "\
register <username> <secret>
login <peer_id> <secret>
logout
create_group
list_groups
join_group <group_id>
list_requests <group_id>
accept_request <group_id> <peer_id>
reject_request <group_id> <peer_id>
leave_group <group_id>
upload_file <path>
list_files <group_id>
download_file <file_id>
show_downloads
exit";

fn arg<T: FromStr>(v: Option<&str>, usage: &'static str) -> Result<T, ParseError> {
    v.and_then(|s| s.parse().ok()).ok_or(ParseError::Usage(usage))
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(ParseError::Empty)?;
        let a = words.next();
        let b = words.next();
        let cmd = match verb {
            "register" => {
                let usage = "register <username> <secret>";
                Command::Register {
                    username: arg(a, usage)?,
                    secret: arg(b, usage)?,
                }
            }
            "login" => {
                let usage = "login <peer_id> <secret>";
                Command::Login {
                    peer_id: PeerId(arg(a, usage)?),
                    secret: arg(b, usage)?,
                }
            }
            "logout" => Command::Logout,
            "create_group" => Command::CreateGroup,
            "list_groups" => Command::ListGroups,
            "join_group" => Command::JoinGroup(GroupId(arg(a, "join_group <group_id>")?)),
            "list_requests" => Command::ListRequests(GroupId(arg(a, "list_requests <group_id>")?)),
            "accept_request" | "reject_request" => {
                let usage = if verb == "accept_request" {
                    "accept_request <group_id> <peer_id>"
                } else {
                    "reject_request <group_id> <peer_id>"
                };
                let group = GroupId(arg(a, usage)?);
                let peer = PeerId(arg(b, usage)?);
                if verb == "accept_request" {
                    Command::AcceptRequest(group, peer)
                } else {
                    Command::RejectRequest(group, peer)
                }
            }
            "leave_group" => Command::LeaveGroup(GroupId(arg(a, "leave_group <group_id>")?)),
            "upload_file" => Command::UploadFile(arg(a, "upload_file <path>")?),
            "list_files" => Command::ListFiles(GroupId(arg(a, "list_files <group_id>")?)),
            "download_file" => Command::DownloadFile(FileId(arg(a, "download_file <file_id>")?)),
            "show_downloads" => Command::ShowDownloads,
            "help" => Command::Help,
            "exit" | "quit" => Command::Exit,
            other => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("register alice pw", Command::Register { username: "alice".into(), secret: "pw".into() })]
    #[case("login 3 pw", Command::Login { peer_id: PeerId(3), secret: "pw".into() })]
    #[case("  list_groups  ", Command::ListGroups)]
    #[case("accept_request 1 2", Command::AcceptRequest(GroupId(1), PeerId(2)))]
    #[case("reject_request 1 2", Command::RejectRequest(GroupId(1), PeerId(2)))]
    #[case("upload_file /tmp/a.bin", Command::UploadFile(PathBuf::from("/tmp/a.bin")))]
    #[case("download_file 9", Command::DownloadFile(FileId(9)))]
    #[case("quit", Command::Exit)]
    fn parses(#[case] line: &str, #[case] expected: Command) {
        assert_eq!(line.parse::<Command>().unwrap(), expected);
    }

    #[rstest]
    #[case("", ParseError::Empty)]
    #[case("frobnicate", ParseError::Unknown("frobnicate".into()))]
    #[case("join_group x", ParseError::Usage("join_group <group_id>"))]
    #[case("login 1", ParseError::Usage("login <peer_id> <secret>"))]
    fn rejects(#[case] line: &str, #[case] expected: ParseError) {
        assert_eq!(line.parse::<Command>().unwrap_err(), expected);
    }
}
