/// TCP/TLS server for the Celerix Store daemon.
///
/// This module provides the [`Router`] which accepts connections, applies
/// per-connection deadlines, and dispatches line-protocol commands to the
/// underlying store.
pub mod router;

pub use router::Router;
