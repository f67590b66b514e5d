use super::*;

#[test]
fn default_config_validates() {
    Config::default().validate().unwrap();
}

#[test]
fn empty_json_deserializes_to_defaults() {
    let config: Config = serde_json::from_str("{}").unwrap();
    assert_eq!(config.agent.max_iterations, 30);
    assert_eq!(config.approvals.ttl_secs, 300);
    assert_eq!(config.control.max_frame_bytes, 10 * 1024 * 1024);
    assert_eq!(config.pairing.max_attempts, 5);
    assert_eq!(config.pairing.ban_secs, 900);
}

#[test]
fn control_enabled_without_tokens_fails_validation() {
    let mut config = Config::default();
    config.control.enabled = true;
    assert!(config.validate().is_err());
    config.control.tokens.push(ControlTokenConfig {
        token: "secret".into(),
        scopes: vec!["admin".into()],
    });
    config.validate().unwrap();
}

#[test]
fn hooks_enabled_without_token_fails_validation() {
    let mut config = Config::default();
    config.hooks.enabled = true;
    assert!(config.validate().is_err());
    config.hooks.token = "hook-token".into();
    config.validate().unwrap();
}

#[test]
fn hook_mapping_action_is_checked() {
    let mut config = Config::default();
    config.hooks.mappings.push(HookMapping {
        path: "/ci".into(),
        action: "eval".into(),
        ..HookMapping::default()
    });
    assert!(config.validate().is_err());
}

#[test]
fn camel_case_keys_are_honored() {
    let json = r#"{
        "agent": {"maxIterations": 5, "bulkRenameThreshold": 3},
        "control": {"maxFrameBytes": 1024}
    }"#;
    let config: Config = serde_json::from_str(json).unwrap();
    assert_eq!(config.agent.max_iterations, 5);
    assert_eq!(config.agent.bulk_rename_threshold, 3);
    assert_eq!(config.control.max_frame_bytes, 1024);
}

#[test]
fn security_mode_defaults_to_pairing() {
    let channel: ChannelConfig = serde_json::from_str(r#"{"id":"tg","type":"telegram"}"#).unwrap();
    assert_eq!(channel.security_mode, SecurityMode::Pairing);
    assert!(channel.enabled);
}

#[test]
fn context_policy_roundtrips() {
    let json = r#"{
        "id": "tg", "type": "telegram",
        "contextPolicy": {
            "group": {"blockedTools": ["memory_search"], "blockDestructive": true}
        }
    }"#;
    let channel: ChannelConfig = serde_json::from_str(json).unwrap();
    let group = channel.context_policy.get("group").unwrap();
    assert_eq!(group.blocked_tools, vec!["memory_search"]);
    assert!(group.block_destructive);
}
