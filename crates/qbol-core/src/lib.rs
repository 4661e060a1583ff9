//! qbol-core — wire format, frame builder, and configuration.
//! Every other QBol crate depends on this one.

pub mod builder;
pub mod config;
pub mod mac;
pub mod wire;

pub use builder::FrameBuilder;
pub use config::EngineConfig;
pub use mac::MacAddr;
pub use wire::{Frame, FrameFlags, FrameKind, WireError, ETHERTYPE};
