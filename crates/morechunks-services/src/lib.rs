//! morechunks-services: the pieces a connection handler leans on:
//! chunk storage, negotiation policy, send pacing, live limits and the
//! table of connection snapshots.

pub mod connection_table;
pub mod limits;
pub mod policy;
pub mod rate;
pub mod store;

pub use connection_table::{
    new_connection_table, ConnectionId, ConnectionSnapshot, ConnectionTable, PendingQueue, Phase,
};
pub use limits::LiveLimits;
pub use policy::{Decision, DisconnectReason, Ignored, Kick};
pub use store::{ChunkStore, DiskStore, MemoryStore, SharedStore, StoreError};
