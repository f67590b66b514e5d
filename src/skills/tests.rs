use super::*;

fn skill_json(id: &str, kind: &str, priority: i64) -> String {
    format!(
        r#"{{
            "id": "{id}",
            "name": "{id}",
            "description": "test skill",
            "prompt": "Do the thing for {{{{target}}}} with {{{{mode}}}}",
            "parameters": [
                {{"name": "target", "type": "string", "required": true}},
                {{"name": "mode", "type": "select", "required": false,
                  "default": "fast", "options": ["fast", "careful"]}}
            ],
            "enabled": true,
            "type": "{kind}",
            "priority": {priority}
        }}"#
    )
}

fn sample_skill() -> Skill {
    serde_json::from_str(&skill_json("organize", "task", 0)).unwrap()
}

#[test]
fn render_substitutes_and_uses_defaults() {
    let skill = sample_skill();
    let rendered = skill.render_prompt(&serde_json::json!({"target": "logs"}));
    assert_eq!(rendered, "Do the thing for logs with fast");
}

#[test]
fn render_removes_unresolved_placeholders() {
    let skill: Skill = serde_json::from_str(
        r#"{"id": "x", "name": "x", "description": "", "prompt": "A {{missing}} B"}"#,
    )
    .unwrap();
    assert_eq!(skill.render_prompt(&serde_json::json!({})), "A  B");
}

#[test]
fn render_stringifies_non_string_args() {
    let skill: Skill = serde_json::from_str(
        r#"{"id": "x", "name": "x", "description": "", "prompt": "n={{n}}"}"#,
    )
    .unwrap();
    assert_eq!(skill.render_prompt(&serde_json::json!({"n": 3})), "n=3");
}

#[test]
fn catalog_loads_and_orders_by_priority() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.json"), skill_json("low", "task", 1)).unwrap();
    std::fs::write(dir.path().join("b.json"), skill_json("high", "task", 9)).unwrap();
    std::fs::write(dir.path().join("junk.json"), "{not json").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let catalog = SkillsCatalog::load(dir.path()).unwrap();
    let ids: Vec<&str> = catalog.all().iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["high", "low"], "malformed/non-json files skipped");
}

#[test]
fn guideline_skills_are_separated_from_task_skills() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("g.json"),
        r#"{"id": "style", "name": "style", "description": "",
            "prompt": "Always write terse commit messages.", "type": "guideline"}"#,
    )
    .unwrap();
    std::fs::write(dir.path().join("t.json"), skill_json("organize", "task", 0)).unwrap();

    let catalog = SkillsCatalog::load(dir.path()).unwrap();
    let block = catalog.guideline_block();
    assert!(block.contains("terse commit messages"));
    assert!(!block.contains("Do the thing"));

    let tools = catalog.task_tools();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].skill().id, "organize");
}

#[test]
fn disabled_skills_are_excluded() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("off.json"),
        r#"{"id": "off", "name": "off", "description": "", "prompt": "hidden",
            "enabled": false, "type": "guideline"}"#,
    )
    .unwrap();
    let catalog = SkillsCatalog::load(dir.path()).unwrap();
    assert!(catalog.guideline_block().is_empty());
    assert!(catalog.task_tools().is_empty());
}

#[tokio::test]
async fn skill_tool_executes_with_rendered_prompt() {
    let tool = SkillTool {
        skill: sample_skill(),
    };
    let dir = tempfile::tempdir().unwrap();
    let ws = std::sync::Arc::new(crate::workspace::Workspace::new("w", dir.path()));
    let ctx = ExecutionContext::for_tests(ws);
    let result = tool
        .execute(serde_json::json!({"target": "inbox"}), &ctx)
        .await
        .unwrap();
    assert_eq!(result.content, "Do the thing for inbox with fast");
}

#[tokio::test]
async fn skill_tool_enforces_required_params() {
    let tool = SkillTool {
        skill: sample_skill(),
    };
    let dir = tempfile::tempdir().unwrap();
    let ws = std::sync::Arc::new(crate::workspace::Workspace::new("w", dir.path()));
    let ctx = ExecutionContext::for_tests(ws);
    let result = tool.execute(serde_json::json!({}), &ctx).await.unwrap();
    assert!(result.is_error);
    assert!(result.content.contains("target"));
}

#[test]
fn skill_tool_schema_exposes_select_options() {
    let tool = SkillTool {
        skill: sample_skill(),
    };
    let schema = tool.parameters();
    assert_eq!(schema["properties"]["mode"]["enum"][0], "fast");
    assert_eq!(schema["required"][0], "target");
}

#[test]
fn missing_directory_loads_empty_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = SkillsCatalog::load(&dir.path().join("nope")).unwrap();
    assert!(catalog.all().is_empty());
}
