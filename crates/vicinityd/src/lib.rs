//! vicinityd — the profile server's neighborhood synchronization daemon:
//! framed LBN transport and the session engine that drives the
//! reconciler. The binary in `main.rs` wires these to configuration,
//! identity keys, and the shutdown signal.

pub mod session;
pub mod transport;

pub use session::LbnSession;
