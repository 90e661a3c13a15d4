//! Swarm tracker: registry service behind a framed TCP command protocol.

pub mod config;
pub mod dispatcher;
pub mod server;

pub use dispatcher::{Dispatcher, Session};
pub use server::TrackerServer;
