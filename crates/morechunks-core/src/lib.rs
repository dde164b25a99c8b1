//! morechunks-core: wire format and configuration shared by every
//! MoreChunks crate.

pub mod config;
pub mod wire;

pub use wire::{ChunkPosition, InboundPacket, InfoMessage};
