//! Shared-memory IPC primitives layered over the mapped CnC file.

pub mod broadcast;
pub mod counters;
pub mod region;
pub mod ring;

pub use broadcast::{BroadcastReceiver, BroadcastTransmitter, CopyBroadcastReceiver};
pub use counters::CountersReader;
pub use region::Region;
pub use ring::CommandRing;
