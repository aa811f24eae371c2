pub mod context;
pub mod error;
pub mod reconciler;
pub mod spec;

pub use context::{Context, OperatorConfig};
pub use error::{Error, Result, RetryTracker};
pub use reconciler::{error_policy, reconcile};
