pub mod error;
pub mod reconciler;
pub mod service;

pub use error::{ReconcileError, ServiceError};
pub use reconciler::{ReconcilerConfig, StateReconciler};
pub use service::{HistoryQuery, QueryService};
