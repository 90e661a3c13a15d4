//! Tracker TCP server: one task per connection, each running its own `Session`.
//!
//! Connections without a logged-in peer are closed after the idle timeout. A logged-in
//! session stays open while its socket does, so an otherwise quiet seeder stays listed.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use swarm_core::protocol::{TrackerRequest, TrackerResponse};
use swarm_core::transport::{read_frame, read_frame_within, write_frame, TransportError};
use swarm_core::Registry;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, Session};

pub struct TrackerServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    idle_timeout: Duration,
}

impl TrackerServer {
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<Registry>,
        idle_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dispatcher: Arc::new(Dispatcher::new(registry)),
            idle_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept forever. Only the accept call suspends indefinitely.
    pub async fn run(self) -> io::Result<()> {
        info!(addr = %self.listener.local_addr()?, "tracker listening");
        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let dispatcher = self.dispatcher.clone();
            let idle = self.idle_timeout;
            tokio::spawn(async move {
                debug!(%remote, "connection established");
                match run_connection(stream, remote, dispatcher, idle).await {
                    Ok(()) => debug!(%remote, "connection closed"),
                    Err(e) => debug!(%remote, error = %e, "connection dropped"),
                }
            });
        }
    }
}

async fn run_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    idle: Duration,
) -> Result<(), TransportError> {
    let mut session = Session::new(remote);
    let result = serve(&mut stream, &mut session, &dispatcher, idle).await;
    dispatcher.disconnect(&mut session);
    result
}

async fn serve(
    stream: &mut TcpStream,
    session: &mut Session,
    dispatcher: &Dispatcher,
    idle: Duration,
) -> Result<(), TransportError> {
    loop {
        let next = if session.peer().is_some() {
            read_frame(stream).await
        } else {
            read_frame_within(stream, idle).await
        };
        let request: TrackerRequest = match next {
            Ok(Some(req)) => req,
            Ok(None) => return Ok(()),
            Err(e) if e.is_recoverable() => {
                let reply = TrackerResponse::Malformed {
                    reason: e.to_string(),
                };
                write_frame(stream, &reply).await?;
                continue;
            }
            Err(e) => return Err(e),
        };
        let response = dispatcher.handle(session, request);
        let goodbye = matches!(response, TrackerResponse::Goodbye);
        write_frame(stream, &response).await?;
        if goodbye {
            return Ok(());
        }
    }
}
