//! Engine error types.
//!
//! Only `InterfaceUnavailable` and `PermissionDenied` can unwind out of
//! engine creation; everything that happens after startup is swallowed by
//! the owning subsystem and surfaced on the event sink instead.

use qbol_core::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("interface unavailable: {0}")]
    InterfaceUnavailable(String),

    #[error("permission denied opening raw socket on {0} (CAP_NET_RAW required)")]
    PermissionDenied(String),

    #[error("payload of {len} bytes exceeds the {mtu}-byte frame limit")]
    PayloadTooLarge { len: usize, mtu: usize },

    #[error("engine is shut down")]
    ShutDown,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
