pub mod error;
pub mod event;
pub mod persona;
pub mod probe;
pub mod stream;
pub mod supervisor;
pub mod workspace;

// Re-export key types
pub use error::{SupervisorError, WorkspaceError};
pub use event::{
    AgentEvent, AgentStatus, ErrorEvent, ErrorSubtype, EventBus, OutputEvent, OutputKind,
    StatusEvent,
};
pub use persona::PersonaStore;
pub use probe::CapabilityProbe;
pub use supervisor::{
    parse_directives, AgentSnapshot, AgentSupervisor, Diagnostics, Directive, OrchestrateResult,
    SpawnResult, SupervisorOptions,
};
pub use workspace::{LeaseKind, WorkspaceLease, WorkspacePool};
