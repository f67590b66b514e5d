use crate::policy::RiskLevel;
use crate::tools::base::{ExecutionContext, Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillKind {
    /// Invocable by the model as a tool.
    #[default]
    Task,
    /// Concatenated into the system prompt.
    Guideline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillParameter {
    pub name: String,
    /// `string`, `number`, `boolean`, or `select`.
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    /// Choices for `select` parameters.
    #[serde(default)]
    pub options: Option<Vec<String>>,
}

/// A user-defined skill loaded from the app-data `skills/` directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub category: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub parameters: Vec<SkillParameter>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub kind: SkillKind,
    #[serde(default)]
    pub priority: Option<i64>,
}

fn enabled_default() -> bool {
    true
}

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("placeholder regex"));

impl Skill {
    /// Substitute `{{param}}` placeholders with supplied arguments, falling
    /// back to parameter defaults. Unresolved placeholders are removed.
    pub fn render_prompt(&self, args: &Value) -> String {
        PLACEHOLDER_RE
            .replace_all(&self.prompt, |caps: &regex::Captures| {
                let key = &caps[1];
                if let Some(value) = args.get(key) {
                    return value_to_text(value);
                }
                if let Some(param) = self.parameters.iter().find(|p| p.name == key)
                    && let Some(default) = &param.default
                {
                    return value_to_text(default);
                }
                String::new()
            })
            .to_string()
    }

    fn input_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let json_type = match param.param_type.as_str() {
                "number" => "number",
                "boolean" => "boolean",
                _ => "string",
            };
            let mut schema = json!({"type": json_type});
            if let Some(options) = &param.options {
                schema["enum"] = json!(options);
            }
            properties.insert(param.name.clone(), schema);
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required
        })
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Catalog of skills, separated at read time into guideline skills (prompt
/// material) and task skills (published as tools).
pub struct SkillsCatalog {
    skills: Vec<Skill>,
}

impl SkillsCatalog {
    pub fn empty() -> Self {
        Self { skills: Vec::new() }
    }

    /// Load every `*.json` skill description under `dir`. Malformed files
    /// are skipped with a warning rather than failing the catalog.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut skills = Vec::new();
        if dir.is_dir() {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match std::fs::read_to_string(&path)
                    .map_err(anyhow::Error::from)
                    .and_then(|content| serde_json::from_str::<Skill>(&content).map_err(Into::into))
                {
                    Ok(skill) => {
                        debug!("loaded skill '{}' from {}", skill.name, path.display());
                        skills.push(skill);
                    }
                    Err(e) => warn!("skipping malformed skill {}: {}", path.display(), e),
                }
            }
        }
        // Priority order: higher first, then name for determinism
        skills.sort_by(|a, b| {
            b.priority
                .unwrap_or(0)
                .cmp(&a.priority.unwrap_or(0))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(Self { skills })
    }

    pub fn all(&self) -> &[Skill] {
        &self.skills
    }

    /// Guideline skills rendered into one system-prompt block.
    pub fn guideline_block(&self) -> String {
        let parts: Vec<String> = self
            .skills
            .iter()
            .filter(|s| s.enabled && s.kind == SkillKind::Guideline)
            .map(|s| s.render_prompt(&json!({})))
            .filter(|rendered| !rendered.trim().is_empty())
            .collect();
        parts.join("\n\n")
    }

    /// Task skills wrapped as invocable tools.
    pub fn task_tools(&self) -> Vec<SkillTool> {
        self.skills
            .iter()
            .filter(|s| s.enabled && s.kind == SkillKind::Task)
            .map(|s| SkillTool { skill: s.clone() })
            .collect()
    }
}

/// Adapter publishing a task skill through the tool registry. Invoking it
/// returns the rendered prompt for the model to follow.
pub struct SkillTool {
    skill: Skill,
}

impl SkillTool {
    pub fn skill(&self) -> &Skill {
        &self.skill
    }
}

#[async_trait]
impl Tool for SkillTool {
    fn name(&self) -> &str {
        &self.skill.id
    }

    fn description(&self) -> &str {
        &self.skill.description
    }

    fn parameters(&self) -> Value {
        self.skill.input_schema()
    }

    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Read
    }

    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> Result<ToolResult> {
        for param in &self.skill.parameters {
            if param.required && params.get(&param.name).is_none() && param.default.is_none() {
                return Ok(ToolResult::error(format!(
                    "skill '{}' requires parameter '{}'",
                    self.skill.name, param.name
                )));
            }
        }
        Ok(ToolResult::new(self.skill.render_prompt(&params)))
    }
}

/// Default location of user-defined skills under the app-data directory.
pub fn skills_dir() -> Result<PathBuf> {
    Ok(crate::utils::get_cowork_home()?.join("skills"))
}
