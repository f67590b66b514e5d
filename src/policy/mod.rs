use crate::config::ContextPolicy;
use crate::errors::CoworkError;
use crate::safety::guardrails::GuardrailEngine;
use crate::safety::paths;
use crate::workspace::Workspace;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};


/// Per-tool risk classification consumed by policy layer 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Read,
    Write,
    Destructive,
    System,
    Network,
}

/// Where a request originated, as tagged by the channel adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageContext {
    #[default]
    Private,
    Group,
    Public,
}

impl MessageContext {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageContext::Private => "private",
            MessageContext::Group => "group",
            MessageContext::Public => "public",
        }
    }
}

/// Outcome of a policy decision. Any deny short-circuits; an
/// approval requirement wins over a plain allow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    RequireApproval { reason: String },
    Deny { reason: String },
}

impl Decision {
    pub fn is_deny(&self) -> bool {
        matches!(self, Decision::Deny { .. })
    }
}

/// Ambient facts about the request being decided.
#[derive(Clone)]
pub struct PolicyContext {
    pub workspace: Arc<Workspace>,
    pub origin: MessageContext,
    /// Attenuation for the originating channel context, if any.
    pub context_policy: Option<ContextPolicy>,
}

/// Tunables for the tool-specific rules layer.
#[derive(Debug, Clone)]
pub struct PolicyRules {
    pub bulk_rename_threshold: usize,
}

impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            bulk_rename_threshold: 10,
        }
    }
}

/// Input fields treated as filesystem paths during containment checks.
const PATH_FIELDS: &[&str] = &["path", "source", "destination", "from", "to", "dir"];

/// Four-layer deny-wins authorization pipeline gating every tool call.
pub struct PolicyManager {
    guardrails: Arc<GuardrailEngine>,
    rules: PolicyRules,
}

impl PolicyManager {
    pub fn new(guardrails: Arc<GuardrailEngine>, rules: PolicyRules) -> Self {
        Self { guardrails, rules }
    }

    /// Decide whether a tool call may proceed. Layers evaluate in order and
    /// any deny short-circuits. Only the decision, tool name, and reason
    /// code are logged, never the inputs.
    pub fn decide(
        &self,
        tool: &str,
        risk: RiskLevel,
        input: &Value,
        ctx: &PolicyContext,
    ) -> Decision {
        let decision = self.decide_inner(tool, risk, input, ctx);
        match &decision {
            Decision::Allow => debug!(tool, decision = "allow", "policy decision"),
            Decision::RequireApproval { reason } => {
                info!(tool, decision = "require_approval", reason, "policy decision");
            }
            Decision::Deny { reason } => {
                info!(tool, decision = "deny", reason, "policy decision");
            }
        }
        decision
    }

    fn decide_inner(
        &self,
        tool: &str,
        risk: RiskLevel,
        input: &Value,
        ctx: &PolicyContext,
    ) -> Decision {
        // Layer 1: global guardrails
        if let Some(command) = input.get("command").and_then(Value::as_str)
            && let Err(e) = self.guardrails.inspect(command)
        {
            return Decision::Deny {
                reason: e.to_string(),
            };
        }

        // Layer 2: workspace permission flags + path containment
        if let Some(reason) = Self::check_workspace(risk, input, ctx) {
            return Decision::Deny { reason };
        }

        // Layer 3: context restrictions for external origins
        if ctx.origin != MessageContext::Private
            && let Some(policy) = &ctx.context_policy
        {
            if policy.blocked_tools.iter().any(|t| t == tool) {
                return Decision::Deny {
                    reason: format!("tool not available in {} context", ctx.origin.as_str()),
                };
            }
            if policy.block_destructive && risk == RiskLevel::Destructive {
                return Decision::Deny {
                    reason: format!(
                        "destructive tools not available in {} context",
                        ctx.origin.as_str()
                    ),
                };
            }
        }

        // Layer 4: tool-specific rules, then risk-level defaults
        if tool == "bulk_rename" {
            let count = input
                .get("renames")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            if count > self.rules.bulk_rename_threshold {
                return Decision::RequireApproval {
                    reason: format!(
                        "renaming {count} files exceeds the threshold of {}",
                        self.rules.bulk_rename_threshold
                    ),
                };
            }
            return Decision::Allow;
        }

        match risk {
            RiskLevel::Read | RiskLevel::Write => Decision::Allow,
            RiskLevel::Destructive => Decision::RequireApproval {
                reason: "destructive operation".to_string(),
            },
            RiskLevel::System => Decision::RequireApproval {
                reason: "system-level operation".to_string(),
            },
            RiskLevel::Network => {
                if ctx.origin == MessageContext::Private {
                    Decision::Allow
                } else {
                    Decision::RequireApproval {
                        reason: format!("network access from {} context", ctx.origin.as_str()),
                    }
                }
            }
        }
    }

    /// Layer 2: capability flags and path containment.
    fn check_workspace(risk: RiskLevel, input: &Value, ctx: &PolicyContext) -> Option<String> {
        let perms = &ctx.workspace.permissions;
        let is_shell = input.get("command").and_then(Value::as_str).is_some();

        let allowed = if is_shell {
            perms.shell
        } else {
            match risk {
                RiskLevel::Read => perms.read,
                RiskLevel::Write => perms.write,
                RiskLevel::Destructive => perms.delete,
                RiskLevel::System => perms.shell,
                RiskLevel::Network => perms.network,
            }
        };
        if !allowed {
            return Some(format!(
                "workspace '{}' does not grant the {} capability",
                ctx.workspace.name,
                if is_shell { "shell" } else { risk_flag_name(risk) }
            ));
        }

        // Resolve and contain every path-like input
        let for_write = !is_shell && !matches!(risk, RiskLevel::Read);
        for path in collect_paths(input) {
            let result = if for_write {
                paths::resolve_for_write(&ctx.workspace, Path::new(&path))
            } else {
                paths::resolve_within(&ctx.workspace, Path::new(&path))
            };
            if let Err(e) = result {
                return Some(e.to_string());
            }
        }
        None
    }
}

fn risk_flag_name(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Read => "read",
        RiskLevel::Write => "write",
        RiskLevel::Destructive => "delete",
        RiskLevel::System => "shell",
        RiskLevel::Network => "network",
    }
}

/// Collect path-like string fields from a tool input object, including the
/// `paths` array and `renames: [{from, to}]` entries.
fn collect_paths(input: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let Some(obj) = input.as_object() else {
        return out;
    };
    for &field in PATH_FIELDS {
        if let Some(s) = obj.get(field).and_then(Value::as_str) {
            out.push(s.to_string());
        }
    }
    if let Some(items) = obj.get("paths").and_then(Value::as_array) {
        out.extend(items.iter().filter_map(Value::as_str).map(String::from));
    }
    if let Some(renames) = obj.get("renames").and_then(Value::as_array) {
        for entry in renames {
            for key in ["from", "to"] {
                if let Some(s) = entry.get(key).and_then(Value::as_str) {
                    out.push(s.to_string());
                }
            }
        }
    }
    out
}

/// Convert a denial into the typed error the registry turns into an
/// `is_error` tool result. Non-denials map to `None`.
pub fn deny_to_error(tool: &str, decision: &Decision) -> Option<CoworkError> {
    match decision {
        Decision::Deny { reason } => Some(CoworkError::PolicyDeny {
            tool: tool.to_string(),
            reason: reason.clone(),
        }),
        _ => None,
    }
}
