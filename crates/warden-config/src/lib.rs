pub mod loader;
pub mod schema;

pub use loader::{apply_env_overrides, find_config_path, load_config, resolve_path, save_config};
pub use schema::{AgentsConfig, Config, OrchestrationConfig, WorkerConfig, WorkspaceConfig};
