pub mod observer;
pub mod reconciler;

pub use observer::{ClusterGauges, ClusterLabels, Observer, ObserverRegistry};
pub use reconciler::{reconcile, run_metrics_controller, MetricsContext};
