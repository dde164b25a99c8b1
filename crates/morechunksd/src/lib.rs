//! morechunksd: chunk sharing daemon.
//!
//! One task per TCP client. See [`connection`] for the per-client protocol,
//! [`listener`] for the accept loop and [`status`] for the HTTP endpoint.

pub mod connection;
pub mod listener;
pub mod status;
