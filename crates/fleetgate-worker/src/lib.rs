//! Device worker: serves one device socket and reports its state to the
//! supervisor over the control channel.

pub mod classify;
pub mod control;
pub mod persist;
pub mod server;
pub mod session;
