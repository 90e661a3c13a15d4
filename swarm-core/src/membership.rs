//! Join-request workflow for one (peer, group) pair.
//!
//! ```text
//! NonMember --request--> Pending --approve--> Member
//!                        Pending --reject---> NonMember
//! Member ----leave----> NonMember
//! ```

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::ids::{GroupId, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinState {
    NonMember,
    Pending,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinEvent {
    Request,
    Approve,
    Reject,
    Leave,
}

impl JoinState {
    /// Apply `event`, returning the next state or the rejection for an illegal move.
    pub fn transition(
        self,
        event: JoinEvent,
        peer: PeerId,
        group: GroupId,
    ) -> Result<JoinState, RegistryError> {
        match (self, event) {
            (JoinState::NonMember, JoinEvent::Request) => Ok(JoinState::Pending),
            (JoinState::Pending, JoinEvent::Approve) => Ok(JoinState::Member),
            (JoinState::Pending, JoinEvent::Reject) => Ok(JoinState::NonMember),
            (JoinState::Member, JoinEvent::Leave) => Ok(JoinState::NonMember),
            (JoinState::Pending, JoinEvent::Request) => {
                Err(RegistryError::AlreadyPending { peer, group })
            }
            (JoinState::Member, JoinEvent::Request) => {
                Err(RegistryError::AlreadyMember { peer, group })
            }
            (JoinState::NonMember | JoinState::Member, JoinEvent::Approve | JoinEvent::Reject) => {
                Err(RegistryError::NoSuchRequest { peer, group })
            }
            (from, _) => Err(RegistryError::InvalidTransition { peer, group, from }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const P: PeerId = PeerId(1);
    const G: GroupId = GroupId(1);

    #[test]
    fn happy_path() {
        let s = JoinState::NonMember;
        let s = s.transition(JoinEvent::Request, P, G).unwrap();
        assert_eq!(s, JoinState::Pending);
        let s = s.transition(JoinEvent::Approve, P, G).unwrap();
        assert_eq!(s, JoinState::Member);
        let s = s.transition(JoinEvent::Leave, P, G).unwrap();
        assert_eq!(s, JoinState::NonMember);
    }

    #[test]
    fn rejection_returns_to_non_member() {
        let s = JoinState::Pending.transition(JoinEvent::Reject, P, G).unwrap();
        assert_eq!(s, JoinState::NonMember);
    }

    #[test]
    fn illegal_moves_are_rejected() {
        let err = JoinState::Pending
            .transition(JoinEvent::Request, P, G)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let err = JoinState::NonMember
            .transition(JoinEvent::Leave, P, G)
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InvalidTransition {
                from: JoinState::NonMember,
                ..
            }
        ));

        let err = JoinState::Pending.transition(JoinEvent::Leave, P, G).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));

        let err = JoinState::Member
            .transition(JoinEvent::Approve, P, G)
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoSuchRequest { .. }));
    }
}
