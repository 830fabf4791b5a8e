pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::commands::{
    complete_instance_impl, list_instances_impl, reconcile_targets_impl, target_history_impl,
    AppState, ReconcileResponse, TargetHistoryItem, TargetHistoryResponse,
};
pub use application::completion::CompletionHandler;
pub use application::reconciler::{
    InstanceReconciler, NowProvider, ReconcileOutcome, RetryPolicy, SkippedTarget,
};
pub use domain::models::{InstanceEvent, InstanceStatus, Target, TargetInstance, WindowType};
pub use domain::window::Window;
pub use infrastructure::error::EngineError;
pub use infrastructure::instance_repository::{
    CreateOutcome, InMemoryTargetInstanceRepository, SqliteTargetInstanceRepository,
    TargetInstanceRepository,
};
