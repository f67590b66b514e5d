pub mod loader;
pub mod schema;

pub use loader::{get_config_path, load_config};
pub use schema::{
    AgentConfig, ApprovalConfig, ChannelConfig, Config, ContextPolicy, ControlPlaneConfig,
    ControlTokenConfig, GuardrailConfig, HookMapping, HooksConfig, JsonPredicate, PairingConfig,
    ProviderConfig, SandboxConfig, SecurityMode,
};
