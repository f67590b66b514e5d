use crate::config::ControlPlaneConfig;
use crate::daemon::bus::BusMessage;
use crate::daemon::{AgentDaemon, CreateTaskRequest};
use crate::errors::CoworkError;
use crate::store::TaskBudget;
use crate::workspace::{Workspace, WorkspacePermissions};
use anyhow::Result;
use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};


/// Close codes: auth failure that triggered a ban, rate-limited while
/// banned, handshake timeout, inactivity.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
pub const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4002;
pub const CLOSE_INACTIVE: u16 = 4008;
pub const CLOSE_RATE_LIMITED: u16 = 4029;

/// Per-address authentication failure tracking with ban windows.
pub struct AuthTracker {
    failures: HashMap<IpAddr, u32>,
    bans: HashMap<IpAddr, Instant>,
    max_failures: usize,
    ban_duration: Duration,
}

impl AuthTracker {
    pub fn new(max_failures: usize, ban_duration: Duration) -> Self {
        Self {
            failures: HashMap::new(),
            bans: HashMap::new(),
            max_failures: max_failures.max(1),
            ban_duration,
        }
    }

    pub fn is_banned(&mut self, addr: IpAddr) -> bool {
        match self.bans.get(&addr) {
            Some(&until) if until > Instant::now() => true,
            Some(_) => {
                self.bans.remove(&addr);
                self.failures.remove(&addr);
                false
            }
            None => false,
        }
    }

    /// Record a failure. Returns true when this failure triggered a ban.
    pub fn record_failure(&mut self, addr: IpAddr) -> bool {
        let count = self.failures.entry(addr).or_insert(0);
        *count += 1;
        if *count as usize >= self.max_failures {
            self.bans.insert(addr, Instant::now() + self.ban_duration);
            warn!("control plane: {addr} banned after {count} auth failures");
            return true;
        }
        false
    }

    pub fn record_success(&mut self, addr: IpAddr) {
        self.failures.remove(&addr);
    }

    /// Drop expired bans. Returns how many were removed.
    pub fn cleanup(&mut self) -> usize {
        let now = Instant::now();
        let before = self.bans.len();
        self.bans.retain(|_, &mut until| until > now);
        before - self.bans.len()
    }
}

#[allow(dead_code)] // addr/connected_at kept for operator debugging
struct ClientInfo {
    addr: SocketAddr,
    authenticated: bool,
    connected_at: Instant,
}

/// Shared state behind the WebSocket endpoint.
pub struct ControlState {
    daemon: Arc<AgentDaemon>,
    config: ControlPlaneConfig,
    auth: std::sync::Mutex<AuthTracker>,
    clients: std::sync::Mutex<HashMap<u64, ClientInfo>>,
    next_client_id: AtomicU64,
}

impl ControlState {
    pub fn new(daemon: Arc<AgentDaemon>, config: ControlPlaneConfig) -> Arc<Self> {
        let auth = AuthTracker::new(
            config.max_auth_failures,
            Duration::from_secs(config.auth_ban_secs),
        );
        Arc::new(Self {
            daemon,
            config,
            auth: std::sync::Mutex::new(auth),
            clients: std::sync::Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        })
    }

    fn lock_auth(&self) -> std::sync::MutexGuard<'_, AuthTracker> {
        self.auth
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ClientInfo>> {
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn client_count(&self) -> usize {
        self.lock_clients().len()
    }

    /// Constant-time token verification. Returns the granted scope set.
    pub fn verify_token(&self, token: &str) -> Option<Vec<String>> {
        let mut granted = None;
        for configured in &self.config.tokens {
            let matches: bool = configured
                .token
                .as_bytes()
                .ct_eq(token.as_bytes())
                .into();
            if matches && !configured.token.is_empty() && granted.is_none() {
                granted = Some(configured.scopes.clone());
            }
        }
        granted
    }

    /// Spawn the cleanup pass removing disconnected clients and expired bans.
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let state = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(state) = state.upgrade() else { break };
                let removed = state.lock_auth().cleanup();
                if removed > 0 {
                    debug!("control plane: {removed} auth ban(s) expired");
                }
            }
        })
    }
}

fn has_scope(scopes: &[String], needed: &str) -> bool {
    scopes.iter().any(|s| s == "admin" || s == needed)
}

/// Scope required for a method; `None` means any authenticated client.
fn required_scope(method: &str) -> Option<&'static str> {
    if method.starts_with("task.") {
        Some("tasks")
    } else if method.starts_with("approval.") {
        Some("approvals")
    } else if method.starts_with("workspace.") {
        Some("workspaces")
    } else if method.starts_with("channel.") {
        Some("channels")
    } else if method == "config.get" {
        Some("config")
    } else {
        None
    }
}

/// Wire-level error: one of the fixed codes plus a message.
#[derive(Debug)]
pub struct ControlError {
    pub code: &'static str,
    pub message: String,
}

impl ControlError {
    fn unknown_method(method: &str) -> Self {
        Self {
            code: "UNKNOWN_METHOD",
            message: format!("unknown method: {method}"),
        }
    }
}

impl From<CoworkError> for ControlError {
    fn from(err: CoworkError) -> Self {
        Self {
            code: err.wire_code(),
            message: err.to_string(),
        }
    }
}

fn error_frame(id: &Value, err: &ControlError) -> String {
    json!({
        "type": "res",
        "id": id,
        "ok": false,
        "error": {"code": err.code, "message": err.message},
    })
    .to_string()
}

fn ok_frame(id: &Value, payload: Value) -> String {
    json!({"type": "res", "id": id, "ok": true, "payload": payload}).to_string()
}

fn event_frame(seq: u64, event: &str, payload: Value) -> String {
    json!({
        "type": "event",
        "event": event,
        "seq": seq,
        "ts": chrono::Utc::now().to_rfc3339(),
        "payload": payload,
    })
    .to_string()
}

/// Start the control plane server. Returns the join handle and the bound
/// address.
pub async fn start(state: Arc<ControlState>) -> Result<(tokio::task::JoinHandle<()>, SocketAddr)> {
    let app = Router::new()
        .route("/ws", any(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state.clone());
    let bind = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    let addr = listener.local_addr()?;
    info!("control plane listening on {addr}");
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            warn!("control plane server error: {e}");
        }
    });
    Ok((handle, addr))
}

/// GET /health returns `{status, timestamp, clients}`.
async fn health_handler(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "clients": state.client_count(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<ControlState>>,
) -> impl IntoResponse {
    let max = state.config.max_frame_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn handle_socket(mut socket: WebSocket, addr: SocketAddr, state: Arc<ControlState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::SeqCst);
    state.lock_clients().insert(
        client_id,
        ClientInfo {
            addr,
            authenticated: false,
            connected_at: Instant::now(),
        },
    );
    debug!("control client {client_id} connected from {addr}");

    let mut seq: u64 = 0;
    let mut next_seq = || {
        let s = seq;
        seq += 1;
        s
    };

    // Challenge first; the client must answer with `connect` before the
    // handshake timer fires
    let nonce = uuid::Uuid::new_v4().to_string();
    let challenge = event_frame(next_seq(), "connect.challenge", json!({"nonce": nonce}));
    if socket.send(Message::Text(challenge.into())).await.is_err() {
        state.lock_clients().remove(&client_id);
        return;
    }

    let handshake_deadline =
        tokio::time::Instant::now() + Duration::from_secs(state.config.handshake_timeout_secs);
    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(state.config.heartbeat_interval_secs.max(1)));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let inactivity_limit = Duration::from_secs(state.config.inactivity_timeout_secs);
    let mut last_activity = Instant::now();

    let mut authenticated = false;
    let mut scopes: Vec<String> = Vec::new();
    let mut subscription: Option<crate::daemon::bus::Subscription> = None;

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(handshake_deadline), if !authenticated => {
                debug!("control client {client_id}: handshake timeout");
                close_with(&mut socket, CLOSE_HANDSHAKE_TIMEOUT, "handshake timeout").await;
                break;
            }

            _ = heartbeat.tick(), if authenticated => {
                if last_activity.elapsed() > inactivity_limit {
                    debug!("control client {client_id}: inactive, disconnecting");
                    close_with(&mut socket, CLOSE_INACTIVE, "inactive").await;
                    break;
                }
                let frame = event_frame(next_seq(), "heartbeat", json!({"clientId": client_id}));
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }

            bus_event = async {
                match subscription.as_mut() {
                    Some(sub) => sub.rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                let Some(delivery) = bus_event else { break };
                // Unauthenticated sockets never receive task events: the
                // subscription only exists after auth
                let frame = match delivery.message {
                    BusMessage::Event(event) => event_frame(
                        next_seq(),
                        "task.event",
                        serde_json::to_value(&event).unwrap_or(Value::Null),
                    ),
                    BusMessage::Gap { dropped } => {
                        event_frame(next_seq(), "gap", json!({"dropped": dropped}))
                    }
                };
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }

            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    // Closed or oversized frame: either way the socket is done
                    break;
                };
                last_activity = Instant::now();
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                if text.len() > state.config.max_frame_bytes {
                    close_with(&mut socket, 1009, "frame too large").await;
                    break;
                }

                let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                    let err = CoworkError::Validation("malformed frame".into()).into();
                    let _ = socket.send(Message::Text(error_frame(&Value::Null, &err).into())).await;
                    continue;
                };
                if frame["type"] != "req" {
                    continue;
                }
                let id = frame.get("id").cloned().unwrap_or(Value::Null);
                let method = frame["method"].as_str().unwrap_or("").to_string();
                let params = frame.get("params").cloned().unwrap_or(json!({}));

                if method == "connect" {
                    match handle_connect(&state, addr, client_id, &params) {
                        ConnectResult::Ok(granted) => {
                            authenticated = true;
                            scopes = granted.clone();
                            if let Some(info) = state.lock_clients().get_mut(&client_id) {
                                info.authenticated = true;
                            }
                            subscription = Some(self::subscribe(&state));
                            let _ = socket
                                .send(Message::Text(
                                    ok_frame(&id, json!({"clientId": client_id, "scopes": granted}))
                                        .into(),
                                ))
                                .await;
                        }
                        ConnectResult::Banned => {
                            let err = CoworkError::RateLimit { retry_after: None }.into();
                            let _ = socket
                                .send(Message::Text(error_frame(&id, &err).into()))
                                .await;
                            close_with(&mut socket, CLOSE_RATE_LIMITED, "rate limited").await;
                            break;
                        }
                        ConnectResult::BadToken { ban_triggered } => {
                            let err = CoworkError::Auth("invalid token".into()).into();
                            let _ = socket
                                .send(Message::Text(error_frame(&id, &err).into()))
                                .await;
                            if ban_triggered {
                                close_with(&mut socket, CLOSE_AUTH_FAILED, "too many auth failures")
                                    .await;
                                break;
                            }
                        }
                    }
                    continue;
                }

                if !authenticated {
                    let err = CoworkError::Auth("not authenticated".into()).into();
                    let _ = socket.send(Message::Text(error_frame(&id, &err).into())).await;
                    continue;
                }

                if let Some(needed) = required_scope(&method)
                    && !has_scope(&scopes, needed)
                {
                    let err = CoworkError::Forbidden(format!("missing scope: {needed}")).into();
                    let _ = socket.send(Message::Text(error_frame(&id, &err).into())).await;
                    continue;
                }

                let reply = match dispatch(&state, &method, params).await {
                    Ok(payload) => ok_frame(&id, payload),
                    Err(err) => error_frame(&id, &err),
                };
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(sub) = subscription {
        state.daemon.unsubscribe(sub.id);
    }
    state.lock_clients().remove(&client_id);
    debug!("control client {client_id} disconnected");
}

fn subscribe(state: &Arc<ControlState>) -> crate::daemon::bus::Subscription {
    state.daemon.subscribe()
}

enum ConnectResult {
    Ok(Vec<String>),
    Banned,
    BadToken { ban_triggered: bool },
}

fn handle_connect(
    state: &Arc<ControlState>,
    addr: SocketAddr,
    client_id: u64,
    params: &Value,
) -> ConnectResult {
    let ip = addr.ip();
    {
        let mut auth = state.lock_auth();
        if auth.is_banned(ip) {
            return ConnectResult::Banned;
        }
    }
    let token = params["token"].as_str().unwrap_or("");
    match state.verify_token(token) {
        Some(scopes) => {
            state.lock_auth().record_success(ip);
            let device = params["deviceName"].as_str().unwrap_or("unknown");
            info!("control client {client_id} authenticated ({device})");
            ConnectResult::Ok(scopes)
        }
        None => {
            let ban_triggered = state.lock_auth().record_failure(ip);
            ConnectResult::BadToken { ban_triggered }
        }
    }
}

/// Method dispatch for authenticated, scope-checked requests.
async fn dispatch(
    state: &Arc<ControlState>,
    method: &str,
    params: Value,
) -> Result<Value, ControlError> {
    let daemon = &state.daemon;
    match method {
        "ping" => Ok(json!({"pong": true})),
        "health" => Ok(json!({
            "status": "ok",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "clients": state.client_count(),
        })),
        "status" => {
            let tasks = daemon.list_tasks().map_err(CoworkError::Internal)?;
            let running = tasks.iter().filter(|t| !t.status.is_terminal()).count();
            Ok(json!({
                "version": crate::VERSION,
                "tasks": {"total": tasks.len(), "active": running},
                "clients": state.client_count(),
            }))
        }
        "config.get" => {
            // Secrets never cross this boundary in plaintext
            Ok(json!({
                "agent": {
                    "maxIterations": state.daemon_config().agent.max_iterations,
                    "maxTokens": state.daemon_config().agent.max_tokens,
                },
                "provider": {
                    "model": state.daemon_config().provider.model,
                    "apiKey": crate::store::settings::MASKED_VALUE,
                },
            }))
        }
        "workspace.list" => {
            let workspaces = daemon.list_workspaces().map_err(CoworkError::Internal)?;
            Ok(serde_json::to_value(workspaces).map_err(|e| CoworkError::Internal(e.into()))?)
        }
        "workspace.create" => {
            let name = required_str(&params, "name")?;
            let path = required_str(&params, "path")?;
            let mut workspace = Workspace::new(name, path);
            if let Some(perms) = params.get("permissions") {
                workspace.permissions = serde_json::from_value(perms.clone())
                    .map_err(|e| CoworkError::Validation(format!("bad permissions: {e}")))?;
            } else {
                workspace.permissions = WorkspacePermissions::read_write();
            }
            daemon
                .create_workspace(&workspace)
                .map_err(CoworkError::Internal)?;
            Ok(serde_json::to_value(workspace).map_err(|e| CoworkError::Internal(e.into()))?)
        }
        "task.create" => {
            let prompt = required_str(&params, "prompt")?.to_string();
            let budget = params
                .get("budget")
                .map(|b| serde_json::from_value::<TaskBudget>(b.clone()))
                .transpose()
                .map_err(|e| CoworkError::Validation(format!("bad budget: {e}")))?
                .unwrap_or_default();
            let task = daemon
                .create_task(CreateTaskRequest {
                    title: params["title"].as_str().map(ToString::to_string),
                    prompt,
                    workspace_id: params["workspaceId"].as_str().map(ToString::to_string),
                    budget,
                    ..CreateTaskRequest::default()
                })
                .await?;
            Ok(serde_json::to_value(task).map_err(|e| CoworkError::Internal(e.into()))?)
        }
        "task.list" => {
            let tasks = daemon.list_tasks().map_err(CoworkError::Internal)?;
            Ok(serde_json::to_value(tasks).map_err(|e| CoworkError::Internal(e.into()))?)
        }
        "task.events" => {
            let task_id = required_str(&params, "taskId")?;
            let events = daemon
                .task_events(task_id)
                .map_err(CoworkError::Internal)?;
            Ok(serde_json::to_value(events).map_err(|e| CoworkError::Internal(e.into()))?)
        }
        "task.cancel" => {
            let task_id = required_str(&params, "taskId")?;
            daemon.cancel_task(task_id).await?;
            Ok(json!({"cancelled": true}))
        }
        "task.sendMessage" => {
            let task_id = required_str(&params, "taskId")?;
            let message = required_str(&params, "message")?;
            daemon.send_message(task_id, message).await?;
            Ok(json!({"delivered": true}))
        }
        "channel.list" => {
            // Channel secrets never leave in plaintext
            let channels: Vec<Value> = state
                .daemon_config()
                .channels
                .values()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": c.channel_type,
                        "name": c.name,
                        "enabled": c.enabled,
                        "securityMode": c.security_mode,
                        "secrets": c.secrets.keys().map(|k| {
                            (k.clone(), crate::store::settings::MASKED_VALUE)
                        }).collect::<std::collections::HashMap<_, _>>(),
                    })
                })
                .collect();
            Ok(Value::Array(channels))
        }
        "approval.list" => {
            let approvals = daemon
                .approvals()
                .list_pending()
                .map_err(CoworkError::Internal)?;
            Ok(serde_json::to_value(approvals).map_err(|e| CoworkError::Internal(e.into()))?)
        }
        "approval.respond" => {
            let approval_id = required_str(&params, "approvalId")?;
            let approved = params["approved"]
                .as_bool()
                .ok_or_else(|| CoworkError::Validation("missing 'approved' flag".into()))?;
            let outcome = daemon.approvals().respond(approval_id, approved).await?;
            Ok(json!({"status": outcome.status().as_str()}))
        }
        _ => Err(ControlError::unknown_method(method)),
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, CoworkError> {
    params[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoworkError::Validation(format!("missing '{key}' parameter")))
}

impl ControlState {
    fn daemon_config(&self) -> &crate::config::Config {
        self.daemon.config()
    }
}
