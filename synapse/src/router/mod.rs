//! Request routing: mode → engine selection, then orchestrated invocation.

pub mod orchestrator;
pub mod policy;

pub use orchestrator::{
    CallRequest, CallResult, EngineSelection, Orchestrator, COGNITION_EVENT, ERROR_RECOVERY_ENGINE,
    SYSTEM_ERROR_PREFIX,
};
pub use policy::{EngineId, EngineProfile, Mode, RouterConfig, RouterPolicy, RoutingDecision};
