use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[cfg(test)]
mod tests;

fn default_true() -> bool {
    true
}

/// Root configuration, loaded from `~/.cowork/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub agent: AgentConfig,
    pub provider: ProviderConfig,
    pub sandbox: SandboxConfig,
    pub guardrails: GuardrailConfig,
    pub approvals: ApprovalConfig,
    pub control: ControlPlaneConfig,
    pub hooks: HooksConfig,
    pub pairing: PairingConfig,
    pub channels: HashMap<String, ChannelConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.agent.max_iterations == 0 {
            anyhow::bail!("agent.maxIterations must be > 0");
        }
        if self.agent.max_tokens == 0 {
            anyhow::bail!("agent.maxTokens must be > 0");
        }
        if self.control.enabled && self.control.tokens.is_empty() {
            anyhow::bail!("control plane is enabled but no auth tokens are configured");
        }
        if self.hooks.enabled && self.hooks.token.is_empty() {
            anyhow::bail!("hooks server is enabled but no token is configured");
        }
        if !self.hooks.base_path.starts_with('/') {
            anyhow::bail!("hooks.basePath must start with '/'");
        }
        for mapping in &self.hooks.mappings {
            if !mapping.path.starts_with('/') {
                anyhow::bail!("hook mapping path must start with '/': {}", mapping.path);
            }
            if mapping.action != "wake" && mapping.action != "agent" {
                anyhow::bail!("hook mapping action must be 'wake' or 'agent'");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    /// Iteration cap for the plan-execute-observe loop.
    pub max_iterations: usize,
    /// Max tokens per LLM response.
    pub max_tokens: u32,
    /// Wall-clock timeout for a single LLM call.
    pub llm_timeout_secs: u64,
    /// Wall-clock timeout for a single tool execution.
    pub tool_timeout_secs: u64,
    /// Maximum sub-agent nesting depth.
    pub max_task_depth: u32,
    /// `bulk_rename` target count above which approval is required.
    pub bulk_rename_threshold: usize,
    /// Auto-switch ambiguous tasks to the most recently used workspace.
    pub auto_switch_workspace: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            max_tokens: 8192,
            llm_timeout_secs: 120,
            tool_timeout_secs: 120,
            max_task_depth: 3,
            bulk_rename_threshold: 10,
            auto_switch_workspace: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-5".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxConfig {
    /// `auto`, `sandbox-exec`, `docker`, or `none`.
    pub mode: String,
    pub docker_image: String,
    pub docker_memory_mb: u32,
    pub docker_cpus: f32,
    pub additional_read_paths: Vec<String>,
    pub additional_write_paths: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: "auto".to_string(),
            docker_image: "debian:bookworm-slim".to_string(),
            docker_memory_mb: 512,
            docker_cpus: 1.0,
            additional_read_paths: Vec::new(),
            additional_write_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GuardrailConfig {
    /// Extra regex deny patterns. Built-ins cannot be removed.
    pub additional_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApprovalConfig {
    /// Pending approvals expire to `timed_out` after this many seconds.
    pub ttl_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControlTokenConfig {
    pub token: String,
    pub scopes: Vec<String>,
}

impl Default for ControlTokenConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            scopes: vec!["admin".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub tokens: Vec<ControlTokenConfig>,
    pub max_frame_bytes: usize,
    pub handshake_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub max_auth_failures: usize,
    pub auth_ban_secs: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 4520,
            tokens: Vec::new(),
            max_frame_bytes: 10 * 1024 * 1024,
            handshake_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            inactivity_timeout_secs: 120,
            max_auth_failures: 5,
            auth_ban_secs: 300,
        }
    }
}

/// Declarative webhook mapping: path + exact header values + JSON-pointer
/// equality checks. No expression evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HookMapping {
    pub path: String,
    pub headers: HashMap<String, String>,
    /// Pairs of (RFC 6901 JSON pointer, expected value).
    pub json_equals: Vec<JsonPredicate>,
    /// `wake` or `agent`.
    pub action: String,
    /// Prompt template; `{{body}}` is replaced with the raw body.
    pub template: String,
    /// When non-empty, the request must carry a valid HMAC-SHA256 body
    /// signature (GitHub-style `X-Signature-256` header).
    pub signature_secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JsonPredicate {
    pub pointer: String,
    pub equals: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HooksConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub base_path: String,
    pub token: String,
    pub max_body_bytes: usize,
    pub read_timeout_secs: u64,
    pub mappings: Vec<HookMapping>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 4521,
            base_path: "/hooks".to_string(),
            token: String::new(),
            max_body_bytes: 256 * 1024,
            read_timeout_secs: 10,
            mappings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PairingConfig {
    pub code_ttl_secs: u64,
    pub max_attempts: u32,
    pub ban_secs: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code_ttl_secs: 300,
            max_attempts: 5,
            ban_secs: 900,
        }
    }
}

/// How an external channel authenticates unknown senders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    Open,
    #[default]
    Pairing,
    Allowlist,
}

/// Capability attenuation for one message context (private/group/public).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContextPolicy {
    /// Tool names denied in this context.
    pub blocked_tools: Vec<String>,
    /// Deny destructive tools outright (no approval path) in this context.
    pub block_destructive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Secret values; persisted with the `encrypted:` envelope.
    pub secrets: HashMap<String, String>,
    pub security_mode: SecurityMode,
    /// Per-context capability subsets, keyed by `private`/`group`/`public`.
    pub context_policy: HashMap<String, ContextPolicy>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            channel_type: String::new(),
            name: String::new(),
            enabled: true,
            secrets: HashMap::new(),
            security_mode: SecurityMode::default(),
            context_policy: HashMap::new(),
        }
    }
}
