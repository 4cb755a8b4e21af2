//! Analysis: prompt construction, parallel backend dispatch, per-backend
//! lifecycles and the cycle runner that ties them to history and the stream.

pub mod dispatcher;
pub mod lifecycle;
mod orchestrator;
mod prompt;

pub use dispatcher::{AnalysisDispatcher, AnalysisJob, ScheduleError, TriggerSink};
pub use lifecycle::{
    BackendLifecycle, LifecycleError, LifecycleHandle, LifecycleSet, LifecycleSnapshot,
    LifecycleState,
};
pub use orchestrator::{call_backend, call_isolated, dispatch, AnalysisRequest};
pub use prompt::PromptBuilder;
