use hearth_core::DeviceId;
use hearth_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("no events recorded for device {0}")]
    NotFound(DeviceId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Stable domain-level outcomes exposed to the transport layer. Raw storage
/// detail is logged at the mapping site, never surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("not found")]
    NotFound,

    #[error("deadline exceeded")]
    Timeout,

    #[error("storage unavailable")]
    Unavailable,
}
