//! mudbroker: a session broker gateway between browser-style frame
//! transports and a line-oriented MUD upstream.
//!
//! [`session::Session`] owns the single upstream connection for one user
//! and fans its lines out to however many transports are attached;
//! [`manager::SessionManager`] owns the `publicId -> Session` map and the
//! identity rules that decide whether an `init` creates, recovers, or is
//! rejected.

pub mod config;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod history;
pub mod id;
pub mod manager;
pub mod rate_limit;
pub mod session;
pub mod sound;
pub mod transport;
pub mod upstream;
