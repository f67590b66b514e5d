use super::*;
use crate::approval::ApprovalGate;
use crate::config::{Config, JsonPredicate};
use crate::daemon::bus::EventBus;
use crate::policy::{PolicyManager, PolicyRules};
use crate::providers::testing::{Script, ScriptedProvider};
use crate::safety::guardrails::GuardrailEngine;
use crate::skills::SkillsCatalog;
use crate::store::TaskDb;
use crate::tools::registry::ToolRegistry;
use axum::http::Request;
use tower::ServiceExt;

fn hooks_config() -> HooksConfig {
    HooksConfig {
        enabled: true,
        token: "hook-token".into(),
        max_body_bytes: 1024,
        read_timeout_secs: 1,
        ..HooksConfig::default()
    }
}

fn make_app(config: HooksConfig) -> (Router, Arc<HooksState>) {
    let db = Arc::new(TaskDb::in_memory().unwrap());
    let bus = Arc::new(EventBus::default());
    let policy = Arc::new(PolicyManager::new(
        Arc::new(GuardrailEngine::new(&[]).unwrap()),
        PolicyRules::default(),
    ));
    let approvals = Arc::new(ApprovalGate::new(db.clone(), Duration::from_secs(300)));
    let registry = ToolRegistry::new(policy, approvals.clone());
    let daemon = AgentDaemon::new(
        db,
        bus,
        Arc::new(ScriptedProvider::new(vec![
            Script::Text("ok".into()),
            Script::Text("ok".into()),
        ])),
        Arc::new(registry),
        approvals,
        Config::default(),
        &SkillsCatalog::empty(),
    )
    .unwrap();
    let state = HooksState::new(daemon, config);
    (build_router(state.clone()), state)
}

fn post(path: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(path);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_open() {
    let (app, _) = make_app(hooks_config());
    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn wake_requires_a_token() {
    let (app, _) = make_app(hooks_config());
    let response = app
        .oneshot(post("/hooks/wake", None, r#"{"message": "hi"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let (app, _) = make_app(hooks_config());
    let response = app
        .oneshot(post("/hooks/wake", Some("nope"), r#"{"message": "hi"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wake_now_returns_task_id() {
    let (app, _) = make_app(hooks_config());
    let response = app
        .oneshot(post(
            "/hooks/wake",
            Some("hook-token"),
            r#"{"message": "check ci", "mode": "now"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "queued");
    assert!(json["taskId"].is_string());
}

#[tokio::test]
async fn wake_next_heartbeat_defers() {
    let (app, state) = make_app(hooks_config());
    let response = app
        .oneshot(post(
            "/hooks/wake",
            Some("hook-token"),
            r#"{"message": "later", "mode": "next-heartbeat"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json.get("taskId").is_none());
    assert!(state.daemon.list_tasks().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_wake_mode_is_rejected() {
    let (app, _) = make_app(hooks_config());
    let response = app
        .oneshot(post(
            "/hooks/wake",
            Some("hook-token"),
            r#"{"message": "x", "mode": "sometime"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn agent_returns_202_with_task_id() {
    let (app, _) = make_app(hooks_config());
    let response = app
        .oneshot(post(
            "/hooks/agent",
            Some("hook-token"),
            r#"{"message": "summarize inbox"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert!(json["taskId"].is_string());
}

#[tokio::test]
async fn x_cowork_token_header_works() {
    let (app, _) = make_app(hooks_config());
    let request = Request::builder()
        .method("POST")
        .uri("/hooks/agent")
        .header("X-CoWork-Token", "hook-token")
        .body(Body::from(r#"{"message": "go"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn query_token_is_accepted_but_deprecated() {
    let (app, _) = make_app(hooks_config());
    let response = app
        .oneshot(post(
            "/hooks/agent?token=hook-token",
            None,
            r#"{"message": "go"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn non_post_is_rejected() {
    let (app, _) = make_app(hooks_config());
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/hooks/wake")
                .header("Authorization", "Bearer hook-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn cors_preflight_is_permissive() {
    let (app, _) = make_app(hooks_config());
    let response = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/hooks/wake")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let (app, _) = make_app(hooks_config());
    let big = "x".repeat(2048);
    let response = app
        .oneshot(post(
            "/hooks/wake",
            Some("hook-token"),
            &format!(r#"{{"message": "{big}"}}"#),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn unknown_path_is_404() {
    let (app, _) = make_app(hooks_config());
    let response = app
        .oneshot(post("/hooks/nope", Some("hook-token"), "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn mapping_matches_path_headers_and_json_pointer() {
    let mut config = hooks_config();
    config.mappings.push(HookMapping {
        path: "/ci".into(),
        headers: [("X-Event".to_string(), "push".to_string())].into(),
        json_equals: vec![JsonPredicate {
            pointer: "/branch".into(),
            equals: json!("main"),
        }],
        action: "agent".into(),
        template: "CI push on {{branch}}: {{body}}".into(),
        signature_secret: String::new(),
    });
    let (app, _) = make_app(config);

    // All predicates satisfied
    let request = Request::builder()
        .method("POST")
        .uri("/hooks/ci")
        .header("Authorization", "Bearer hook-token")
        .header("X-Event", "push")
        .body(Body::from(r#"{"branch": "main"}"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Wrong branch: predicate fails, no handler matched
    let request = Request::builder()
        .method("POST")
        .uri("/hooks/ci")
        .header("Authorization", "Bearer hook-token")
        .header("X-Event", "push")
        .body(Body::from(r#"{"branch": "dev"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn signed_mapping_rejects_bad_signatures() {
    let mut config = hooks_config();
    config.mappings.push(HookMapping {
        path: "/deploy".into(),
        action: "wake".into(),
        template: "deploy: {{body}}".into(),
        signature_secret: "deploy-secret".into(),
        ..HookMapping::default()
    });
    let (app, _) = make_app(config);

    let body = br#"{"version": "2.0"}"#;
    let mut mac = HmacSha256::new_from_slice(b"deploy-secret").unwrap();
    mac.update(body);
    let good_sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

    let request = Request::builder()
        .method("POST")
        .uri("/hooks/deploy")
        .header("Authorization", "Bearer hook-token")
        .header("X-Signature-256", &good_sig)
        .body(Body::from(&body[..]))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .method("POST")
        .uri("/hooks/deploy")
        .header("Authorization", "Bearer hook-token")
        .header("X-Signature-256", "sha256=deadbeef")
        .body(Body::from(&body[..]))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[test]
fn signature_validation_accepts_both_forms() {
    let body = b"payload";
    let mut mac = HmacSha256::new_from_slice(b"s3cret").unwrap();
    mac.update(body);
    let sig = hex::encode(mac.finalize().into_bytes());
    assert!(validate_signature("s3cret", &sig, body));
    assert!(validate_signature("s3cret", &format!("sha256={sig}"), body));
    assert!(!validate_signature("s3cret", "bad", body));
    assert!(!validate_signature("other", &sig, body));
}

#[test]
fn template_substitutes_body_and_keys() {
    let json = json!({"repo": "cowork", "count": 3});
    let out = apply_template("{{count}} pushes to {{repo}}: {{body}}", "raw", Some(&json));
    assert_eq!(out, "3 pushes to cowork: raw");
}

#[test]
fn template_preserves_unknown_keys() {
    let json = json!({"a": "x"});
    let out = apply_template("{{a}} {{missing}}", "", Some(&json));
    assert_eq!(out, "x {{missing}}");
}

#[test]
fn mapping_predicate_requires_body_for_json_checks() {
    let mapping = HookMapping {
        path: "/ci".into(),
        json_equals: vec![JsonPredicate {
            pointer: "/x".into(),
            equals: json!(1),
        }],
        ..HookMapping::default()
    };
    assert!(!mapping_matches(&mapping, "/ci", &HeaderMap::new(), None));
    assert!(mapping_matches(
        &mapping,
        "/ci",
        &HeaderMap::new(),
        Some(&json!({"x": 1}))
    ));
}
