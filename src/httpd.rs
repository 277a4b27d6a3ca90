// HTTP Server Module - Settings, rule editing, bridge commands and status events
use anyhow::Result;
use async_stream::stream;
use axum::{
    extract::{Json, Request, State},
    http::{StatusCode, header::{AUTHORIZATION, WWW_AUTHENTICATE}, HeaderValue},
    middleware::{self, Next},
    response::{IntoResponse, Response, sse::{Event as SseEvent, Sse}},
    routing::{get, post},
    Router,
};
use base64::{Engine as _, engine::general_purpose};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use crate::bridge::{BridgeTarget, HueBridge, LampInfo};
use crate::config::HueConfig;
use crate::discovery::{self, BridgeSession, DiscoveryObserver, DiscoveryState};
use crate::error::HueError;
use crate::lights::LightController;
use crate::pairing::{Pairer, PairingObserver, PairingState, Transition};
use crate::status::{BoundRule, RuleId, RuleList, StatusRule, AVAILABLE_EVENTS};

/// Pushed to every connected SSE client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    ConfigChanged,
    Discovery { state: DiscoveryState, text: String },
    Pairing { state: PairingState, text: String },
    Lamps { lamps: Vec<LampInfo> },
}

impl StatusEvent {
    fn name(&self) -> &'static str {
        match self {
            StatusEvent::ConfigChanged => "config-changed",
            StatusEvent::Discovery { .. } => "discovery",
            StatusEvent::Pairing { .. } => "pairing",
            StatusEvent::Lamps { .. } => "lamps",
        }
    }
}

fn discovery_text(state: &DiscoveryState) -> String {
    match state {
        DiscoveryState::Idle => "No bridge found".to_string(),
        DiscoveryState::Discovering => "Searching for a bridge".to_string(),
        DiscoveryState::Discovered { target } => format!("Bridge found at {}", target.host()),
    }
}

/// Turns discovery and pairing callbacks into status text for the panel
pub struct StatusBroadcaster {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBroadcaster {
    pub fn new(tx: broadcast::Sender<StatusEvent>) -> Self {
        StatusBroadcaster { tx }
    }

    pub fn send(&self, event: StatusEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

impl DiscoveryObserver for StatusBroadcaster {
    fn on_discovery(&self, state: &DiscoveryState) {
        self.send(StatusEvent::Discovery { state: state.clone(), text: discovery_text(state) });
    }
}

impl PairingObserver for StatusBroadcaster {
    fn on_transition(&self, transition: &Transition) {
        self.send(StatusEvent::Pairing {
            state: transition.to.clone(),
            text: transition.to.status_text(),
        });
    }
}

pub struct AppState {
    config: Mutex<HueConfig>,
    lights: Arc<LightController>,
    bridge: Arc<dyn HueBridge>,
    session: Mutex<BridgeSession>,
    pairer: Pairer,
    editor: Mutex<RuleList<BoundRule>>,
    lamps: Mutex<Vec<LampInfo>>,
    status: Arc<StatusBroadcaster>,
}

pub type SharedState = Arc<AppState>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl AppState {
    pub fn new(
        config: HueConfig,
        bridge: Arc<dyn HueBridge>,
        lights: Arc<LightController>,
        events_tx: broadcast::Sender<StatusEvent>,
    ) -> Self {
        let status = Arc::new(StatusBroadcaster::new(events_tx));
        let pairer = Pairer::new(
            Arc::clone(&bridge),
            Arc::clone(&status) as Arc<dyn PairingObserver>,
            config.pair_attempts,
            config.pair_interval(),
        );
        AppState {
            session: Mutex::new(BridgeSession::new(config.bridge_target())),
            editor: Mutex::new(RuleList::bound_from_map(&config.status_dict)),
            config: Mutex::new(config),
            lights,
            bridge,
            pairer,
            lamps: Mutex::new(Vec::new()),
            status,
        }
    }

    pub fn config(&self) -> HueConfig {
        lock(&self.config).clone()
    }

    /// Adopt a config re-read from disk
    pub fn reload(&self, config: HueConfig) {
        self.lights.update(config.light_settings());
        if let Some(target) = config.bridge_target() {
            lock(&self.session).set_target(target);
        }
        *lock(&self.editor) = RuleList::bound_from_map(&config.status_dict);
        *lock(&self.config) = config;
        self.status.send(StatusEvent::ConfigChanged);
    }

    /// Save, push the rules to the light controller and tell the panel
    fn persist(&self, config: HueConfig) -> Result<()> {
        config.save()?;
        self.lights.update(config.light_settings());
        *lock(&self.config) = config;
        self.status.send(StatusEvent::ConfigChanged);
        Ok(())
    }

    /// Store the credentials a successful pairing handed out, then fetch the lamp list
    async fn finish_pairing(&self, target: BridgeTarget, username: String) {
        let mut config = self.config();
        config.bridge_addr = target.host();
        config.husername = username.clone();
        if let Err(e) = self.persist(config) {
            log::error!("Failed to save bridge credentials: {}", e);
            return;
        }
        println!("✓ Paired with bridge at {}", target.host());

        match self.bridge.list_lamps(&target.host(), &username).await {
            Ok(lamps) => {
                log::info!("Bridge reports {} lights and groups", lamps.len());
                *lock(&self.lamps) = lamps.clone();
                self.status.send(StatusEvent::Lamps { lamps });
            }
            Err(e) => log::warn!("Failed to list lamps: {}", e),
        }
    }
}

impl IntoResponse for HueError {
    fn into_response(self) -> Response {
        let status = match self {
            HueError::NoBridgeTarget | HueError::AlreadyPairing | HueError::NotPaired | HueError::NoLamp => {
                StatusCode::CONFLICT
            }
            HueError::InvalidColour(_) => StatusCode::BAD_REQUEST,
            HueError::Http(_) | HueError::Bridge { .. } | HueError::UnexpectedResponse(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn internal_error(e: anyhow::Error) -> Response {
    log::error!("Failed to save config: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

// Settings as the panel sees them; credentials stay server side
#[derive(Serialize)]
struct SettingsView {
    rules: Vec<StatusRule>,
    available_events: &'static [&'static str],
    configured_events: Vec<String>,
    available_lamps: Vec<LampInfo>,
    bridge_addr: String,
    paired: bool,
    lamp_id: String,
    lamp_is_group: bool,
    default_bri: u8,
    on_on_startup: bool,
    on_on_startup_event: String,
    off_on_shutdown: bool,
    show_hue_toggle: bool,
    discovery: DiscoveryState,
    pairing: PairingState,
}

fn settings_view(state: &AppState, config: &HueConfig) -> SettingsView {
    SettingsView {
        rules: lock(&state.editor).snapshot(),
        available_events: AVAILABLE_EVENTS,
        configured_events: config.status_dict.events(),
        available_lamps: lock(&state.lamps).clone(),
        bridge_addr: config.bridge_addr.clone(),
        paired: !config.husername.is_empty(),
        lamp_id: config.lamp_id.clone(),
        lamp_is_group: config.lamp_is_group,
        default_bri: config.default_bri,
        on_on_startup: config.on_on_startup,
        on_on_startup_event: config.on_on_startup_event.clone(),
        off_on_shutdown: config.off_on_shutdown,
        show_hue_toggle: config.show_hue_toggle,
        discovery: lock(&state.session).discovery_state().clone(),
        pairing: state.pairer.state(),
    }
}

// Opening the settings starts a fresh editing session from the saved rules
async fn get_settings(State(state): State<SharedState>) -> impl IntoResponse {
    let config = state.config();
    *lock(&state.editor) = RuleList::bound_from_map(&config.status_dict);
    Json(settings_view(&state, &config))
}

#[derive(Deserialize, Default)]
struct SettingsUpdate {
    rules: Option<Vec<StatusRule>>,
    bridge_addr: Option<String>,
    lamp_id: Option<String>,
    lamp_is_group: Option<bool>,
    default_bri: Option<u8>,
    on_on_startup: Option<bool>,
    on_on_startup_event: Option<String>,
    off_on_shutdown: Option<bool>,
    show_hue_toggle: Option<bool>,
}

async fn save_settings(
    State(state): State<SharedState>,
    Json(payload): Json<SettingsUpdate>,
) -> Response {
    let mut config = state.config();

    if let Some(ref address) = payload.bridge_addr {
        config.bridge_addr = address.trim().to_string();
        if let Some(target) = config.bridge_target() {
            lock(&state.session).set_target(target);
        }
    }
    if let Some(ref lamp_id) = payload.lamp_id {
        config.lamp_id = lamp_id.trim().to_string();
    }
    if let Some(v) = payload.lamp_is_group {
        config.lamp_is_group = v;
    }
    if let Some(v) = payload.default_bri {
        config.default_bri = v;
    }
    if let Some(v) = payload.on_on_startup {
        config.on_on_startup = v;
    }
    if let Some(ref v) = payload.on_on_startup_event {
        config.on_on_startup_event = v.trim().to_string();
    }
    if let Some(v) = payload.off_on_shutdown {
        config.off_on_shutdown = v;
    }
    if let Some(v) = payload.show_hue_toggle {
        config.show_hue_toggle = v;
    }

    config.status_dict = {
        let mut editor = lock(&state.editor);
        if let Some(rules) = payload.rules {
            // Posted rules get fresh identities in list order
            let bound = rules
                .into_iter()
                .zip(1..)
                .map(|(rule, id)| BoundRule::bind(&StatusRule { id, ..rule }))
                .collect();
            *editor = RuleList::new(bound);
        }
        editor.collapse()
    };

    let rule_count = config.status_dict.len();
    match state.persist(config.clone()) {
        Ok(_) => {
            println!("✓ Settings saved ({} rules)", rule_count);
            // Re-expand so ids and the list match what was stored
            *lock(&state.editor) = RuleList::bound_from_map(&config.status_dict);
            Json(settings_view(&state, &config)).into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct RuleRequest {
    id: RuleId,
}

#[derive(Deserialize)]
struct UpdateRuleRequest {
    id: RuleId,
    field: String,
    value: serde_json::Value,
}

fn rule_not_found(id: RuleId) -> Response {
    (StatusCode::NOT_FOUND, format!("No rule with id {}", id)).into_response()
}

async fn add_rule(State(state): State<SharedState>) -> impl IntoResponse {
    let mut editor = lock(&state.editor);
    let id = editor.add_default_rule();
    Json(json!({ "id": id, "rules": editor.snapshot() }))
}

async fn remove_rule(
    State(state): State<SharedState>,
    Json(payload): Json<RuleRequest>,
) -> impl IntoResponse {
    let mut editor = lock(&state.editor);
    let removed = editor.remove_rule(payload.id);
    Json(json!({ "removed": removed, "rules": editor.snapshot() }))
}

async fn toggle_rule_turnoff(
    State(state): State<SharedState>,
    Json(payload): Json<RuleRequest>,
) -> Response {
    let mut editor = lock(&state.editor);
    match editor.toggle_turnoff(payload.id) {
        Some(turnoff) => Json(json!({ "id": payload.id, "turnoff": turnoff })).into_response(),
        None => rule_not_found(payload.id),
    }
}

async fn update_rule_field(
    State(state): State<SharedState>,
    Json(payload): Json<UpdateRuleRequest>,
) -> Response {
    let editor = lock(&state.editor);
    let rule = match editor.get(payload.id) {
        Some(rule) => rule,
        None => return rule_not_found(payload.id),
    };

    match rule.set_field(&payload.field, &payload.value) {
        Ok(_) => Json(rule.snapshot()).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e).into_response(),
    }
}

#[derive(Deserialize)]
struct CommandRequest {
    command: String,
    #[serde(default)]
    address: Option<String>,
}

async fn plugin_command(
    State(state): State<SharedState>,
    Json(payload): Json<CommandRequest>,
) -> Response {
    log::debug!("Received API command: {}", payload.command);
    match payload.command.as_str() {
        "togglehue" => match state.lights.toggle().await {
            Ok(on) => Json(json!({ "on": on })).into_response(),
            Err(e) => {
                log::warn!("Toggle failed: {}", e);
                e.into_response()
            }
        },
        "getstate" => match state.lights.is_on().await {
            Ok(on) => Json(json!({ "on": on })).into_response(),
            Err(e) => e.into_response(),
        },
        "bridge:getstatus" => bridge_status(&state).into_response(),
        "bridge:discover" => {
            let outcome = discovery::discover(state.bridge.as_ref(), &state.session, state.status.as_ref()).await;
            let target = lock(&state.session).target().cloned();
            Json(json!({
                "found": target.is_some() && matches!(outcome, discovery::DiscoveryOutcome::Found(_)),
                "target": target,
                "status": outcome.status_text(),
            }))
            .into_response()
        }
        "bridge:pair" => match start_pairing(&state, payload.address) {
            Ok(pairing) => (
                StatusCode::ACCEPTED,
                Json(json!({ "status": pairing.status_text(), "pairing": pairing })),
            )
                .into_response(),
            Err(e) => e.into_response(),
        },
        other => (StatusCode::BAD_REQUEST, format!("Unknown command: {}", other)).into_response(),
    }
}

fn bridge_status(state: &AppState) -> Json<serde_json::Value> {
    let session = lock(&state.session).clone();
    let pairing = state.pairer.state();
    let paired = !lock(&state.config).husername.is_empty();
    let text = if pairing.is_active() || pairing.is_terminal() {
        pairing.status_text()
    } else {
        discovery_text(session.discovery_state())
    };
    Json(json!({
        "target": session.target(),
        "discovery": session.discovery_state(),
        "pairing": pairing,
        "paired": paired,
        "status": text,
    }))
}

/// Kick off the pairing loop; credentials are stored once it reports success
fn start_pairing(state: &SharedState, address: Option<String>) -> Result<PairingState, HueError> {
    if state.pairer.state().is_active() {
        return Err(HueError::AlreadyPairing);
    }

    let target = {
        let mut session = lock(&state.session);
        if let Some(address) = address.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()) {
            session.set_target(BridgeTarget::new(address));
        }
        session.target().cloned()
    };

    let handle = state.pairer.start(target.clone())?;
    let follow_up = Arc::clone(state);
    tokio::spawn(async move {
        match (handle.await, target) {
            (Ok(PairingState::Paired { username }), Some(target)) => {
                follow_up.finish_pairing(target, username).await;
            }
            (Ok(other), _) => log::info!("Pairing finished: {}", other.status_text()),
            (Err(e), _) => log::error!("Pairing task failed: {}", e),
        }
    });

    Ok(state.pairer.state())
}

#[derive(Deserialize)]
struct PrinterEvent {
    event: String,
}

async fn printer_event(
    State(state): State<SharedState>,
    Json(payload): Json<PrinterEvent>,
) -> impl IntoResponse {
    let scheduled = state.lights.on_event(payload.event.trim());
    Json(json!({ "matched": scheduled.is_some(), "state": scheduled }))
}

// SSE handler - streams status text and config change events to connected clients
async fn status_events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = state.status.subscribe();

    let event_stream = stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(SseEvent::default().event(event.name()).data(data));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Missed some events, have the client re-read everything
                    yield Ok(SseEvent::default().event("config-changed").data("reload"));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(event_stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive")
    )
}

// HTTP access logging middleware
async fn logging_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let response = next.run(req).await;
    log::debug!("{} {} -> {}", method, uri, response.status());
    response
}

async fn basic_auth_middleware(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (enabled, user, pass) = {
        let config = lock(&state.config);
        (config.httpd_auth_enabled, config.httpd_auth_user.clone(), config.httpd_auth_pass.clone())
    };

    // If auth is disabled, pass through
    if !enabled || user.is_empty() || pass.is_empty() {
        return Ok(next.run(req).await);
    }

    let auth_header = req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if let Some(auth) = auth_header {
        // Parse "Basic base64(user:pass)"
        if let Some(encoded) = auth.strip_prefix("Basic ") {
            if let Ok(decoded) = general_purpose::STANDARD.decode(encoded) {
                if let Ok(credentials) = String::from_utf8(decoded) {
                    if let Some((u, p)) = credentials.split_once(':') {
                        if u == user && p == pass {
                            return Ok(next.run(req).await);
                        }
                    }
                }
            }
        }
    }

    let mut response = Response::new(String::from("Unauthorized").into());
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"printhue\""),
    );
    Ok(response)
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/settings", get(get_settings).post(save_settings))
        .route("/api/settings/rules/add", post(add_rule))
        .route("/api/settings/rules/remove", post(remove_rule))
        .route("/api/settings/rules/toggle_turnoff", post(toggle_rule_turnoff))
        .route("/api/settings/rules/update", post(update_rule_field))
        .route("/api/plugin/printhue", post(plugin_command))
        .route("/api/event", post(printer_event))
        .route("/api/status/events", get(status_events))
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth_middleware))
        .layer(middleware::from_fn(logging_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_http_server(
    ip: String,
    port: u16,
    state: SharedState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state);
    let addr = format!("{}:{}", ip, port);

    println!("🌐 HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::MockBridge;
    use crate::bridge::DiscoveredBridge;
    use crate::config::example_rules;
    use axum::body::Body;
    use tower::ServiceExt;

    struct Harness {
        state: SharedState,
        bridge: Arc<MockBridge>,
        _dir: tempfile::TempDir,
    }

    fn harness_with(bridge: MockBridge, edit: impl FnOnce(&mut HueConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HueConfig::default();
        config.config_path = Some(dir.path().join("test.conf"));
        config.status_dict = example_rules();
        config.settings_version = crate::config::SETTINGS_VERSION;
        config.bridge_addr = "10.0.0.5".to_string();
        config.husername = "secret-user".to_string();
        config.lamp_id = "1".to_string();
        edit(&mut config);

        let bridge = Arc::new(bridge);
        let lights = Arc::new(LightController::new(bridge.clone(), config.light_settings()));
        let (tx, _) = broadcast::channel(32);
        let state = Arc::new(AppState::new(config, bridge.clone(), lights, tx));
        Harness { state, bridge, _dir: dir }
    }

    fn harness() -> Harness {
        harness_with(MockBridge::default(), |_| {})
    }

    async fn send(state: &SharedState, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    async fn command(state: &SharedState, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        send(state, "POST", "/api/plugin/printhue", Some(body)).await
    }

    #[tokio::test]
    async fn test_get_settings_hides_credentials() {
        let h = harness();
        let (status, body) = send(&h.state, "GET", "/api/settings", None).await;
        assert_eq!(status, StatusCode::OK);

        let rules = body["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 6);
        assert_eq!(rules[0]["id"], 1);
        assert_eq!(rules[0]["event"], "Connected");
        assert_eq!(rules[1]["turnoff"], true);
        assert_eq!(body["configured_events"].as_array().unwrap().len(), 6);
        assert!(body["available_events"].as_array().unwrap().iter().any(|e| e == "PrintDone"));
        assert_eq!(body["paired"], true);
        assert!(!body.to_string().contains("secret-user"));
    }

    #[tokio::test]
    async fn test_edit_session_saves_collapsed_rules() {
        let h = harness();
        send(&h.state, "GET", "/api/settings", None).await;

        let (_, added) = send(&h.state, "POST", "/api/settings/rules/add", None).await;
        let new_id = added["id"].as_u64().unwrap();
        assert_eq!(new_id, 7);
        let new_rule = &added["rules"][6];
        assert_eq!(new_rule["event"], "");
        assert_eq!(new_rule["brightness"], 255);
        assert_eq!(new_rule["delay"], 0);
        assert_eq!(new_rule["turnoff"], false);

        let (status, _) = send(
            &h.state,
            "POST",
            "/api/settings/rules/update",
            Some(json!({"id": new_id, "field": "event", "value": "Home"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        send(
            &h.state,
            "POST",
            "/api/settings/rules/update",
            Some(json!({"id": new_id, "field": "colour", "value": "#0000FF"})),
        )
        .await;

        let (_, removed) = send(&h.state, "POST", "/api/settings/rules/remove", Some(json!({"id": 2}))).await;
        assert_eq!(removed["removed"], true);

        let (status, saved) = send(&h.state, "POST", "/api/settings", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            saved["configured_events"],
            json!(["Connected", "PrintStarted", "PrintResumed", "PrintDone", "PrintFailed", "Home"])
        );

        let stored = h.state.config();
        assert_eq!(stored.status_dict.get("Home").unwrap().colour, "#0000FF");
        assert!(stored.status_dict.get("Disconnected").is_none());

        let on_disk = HueConfig::load_with_path(stored.config_path.as_ref().unwrap().to_str()).unwrap();
        assert_eq!(on_disk.status_dict, stored.status_dict);
        assert_eq!(on_disk.husername, "secret-user");
    }

    #[tokio::test]
    async fn test_saving_blank_rule_drops_it() {
        let h = harness();
        send(&h.state, "GET", "/api/settings", None).await;
        send(&h.state, "POST", "/api/settings/rules/add", None).await;
        send(&h.state, "POST", "/api/settings", Some(json!({}))).await;
        assert_eq!(h.state.config().status_dict.len(), 6);
    }

    #[tokio::test]
    async fn test_posted_rules_last_write_wins() {
        let h = harness();
        let rules = json!([
            {"event": "PrintDone", "colour": "#FFFFFF", "brightness": 255, "delay": 0, "turnoff": false},
            {"event": "PrintDone", "colour": "#00FF00", "brightness": 100, "delay": 2, "turnoff": false}
        ]);
        let (status, _) = send(&h.state, "POST", "/api/settings", Some(json!({"rules": rules, "default_bri": 90}))).await;
        assert_eq!(status, StatusCode::OK);

        let config = h.state.config();
        assert_eq!(config.status_dict.len(), 1);
        assert_eq!(config.status_dict.get("PrintDone").unwrap().colour, "#00FF00");
        assert_eq!(config.default_bri, 90);
    }

    #[tokio::test]
    async fn test_toggle_turnoff_and_unknown_ids() {
        let h = harness();
        send(&h.state, "GET", "/api/settings", None).await;

        let (status, body) = send(&h.state, "POST", "/api/settings/rules/toggle_turnoff", Some(json!({"id": 1}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["turnoff"], true);

        let (status, _) = send(&h.state, "POST", "/api/settings/rules/toggle_turnoff", Some(json!({"id": 99}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = send(&h.state, "POST", "/api/settings/rules/remove", Some(json!({"id": 99}))).await;
        assert_eq!(body["removed"], false);
        assert_eq!(body["rules"].as_array().unwrap().len(), 6);

        let (status, _) = send(
            &h.state,
            "POST",
            "/api/settings/rules/update",
            Some(json!({"id": 1, "field": "sparkle", "value": true})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_discover_command_captures_target() {
        let found = DiscoveredBridge { address: Some("10.0.0.5".to_string()), port: Some(80), id: None };
        let h = harness_with(MockBridge::with_discovery(vec![found]), |_| {});
        let mut events = h.state.status.subscribe();

        let (status, body) = command(&h.state, json!({"command": "bridge:discover"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["found"], true);
        assert_eq!(body["target"], json!({"address": "10.0.0.5", "port": 80}));

        assert!(matches!(events.recv().await.unwrap(), StatusEvent::Discovery { state: DiscoveryState::Discovering, .. }));
        match events.recv().await.unwrap() {
            StatusEvent::Discovery { text, .. } => assert_eq!(text, "Bridge found at 10.0.0.5"),
            other => panic!("unexpected event {:?}", other),
        }

        let (_, status_body) = command(&h.state, json!({"command": "bridge:getstatus"})).await;
        assert_eq!(status_body["target"]["address"], "10.0.0.5");
        assert_eq!(status_body["status"], "Bridge found at 10.0.0.5");
    }

    #[tokio::test]
    async fn test_pair_without_target_is_conflict() {
        let h = harness_with(MockBridge::default(), |c| c.bridge_addr.clear());
        let (status, body) = command(&h.state, json!({"command": "bridge:pair"})).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("no bridge address"));
        assert_eq!(h.bridge.pair_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_command_stores_credentials() {
        let mut bridge = MockBridge::pairing_on(3);
        bridge.lamps = vec![LampInfo { id: "1".to_string(), name: "Desk".to_string(), is_group: false }];
        let h = harness_with(bridge, |c| c.husername.clear());

        let (status, body) = command(&h.state, json!({"command": "bridge:pair", "address": "10.0.0.9"})).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["pairing"]["state"], "pairing");

        let (status, _) = command(&h.state, json!({"command": "bridge:pair"})).await;
        assert_eq!(status, StatusCode::CONFLICT);

        for _ in 0..100 {
            if !lock(&h.state.lamps).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let config = h.state.config();
        assert_eq!(config.husername, "new-user");
        assert_eq!(config.bridge_addr, "10.0.0.9");
        assert_eq!(h.bridge.pair_count(), 3);
        assert_eq!(lock(&h.state.lamps).len(), 1);

        let (_, settings) = send(&h.state, "GET", "/api/settings", None).await;
        assert_eq!(settings["available_lamps"][0]["name"], "Desk");
        assert_eq!(settings["pairing"]["state"], "paired");
        assert!(!settings.to_string().contains("new-user"));
    }

    #[tokio::test]
    async fn test_togglehue_command() {
        let h = harness();
        h.bridge.on_replies.lock().unwrap().push_back(true);

        let (status, body) = command(&h.state, json!({"command": "togglehue"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["on"], false);

        h.bridge.on_replies.lock().unwrap().push_back(false);
        let (_, body) = command(&h.state, json!({"command": "getstate"})).await;
        assert_eq!(body["on"], false);

        let h = harness_with(MockBridge::default(), |c| c.lamp_id.clear());
        let (status, _) = command(&h.state, json!({"command": "togglehue"})).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let h = harness();
        let (status, _) = command(&h.state, json!({"command": "bridge:reset"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_printer_event_sets_lamp() {
        let h = harness();
        let (status, body) = send(&h.state, "POST", "/api/event", Some(json!({"event": "PrintDone"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matched"], true);
        assert_eq!(body["state"]["on"], true);
        h.state.lights.settle().await;
        assert_eq!(h.bridge.sent_states().len(), 1);

        let (_, body) = send(&h.state, "POST", "/api/event", Some(json!({"event": "Home"}))).await;
        assert_eq!(body["matched"], false);
    }

    #[tokio::test]
    async fn test_basic_auth() {
        let h = harness_with(MockBridge::default(), |c| {
            c.httpd_auth_enabled = true;
            c.httpd_auth_user = "admin".to_string();
            c.httpd_auth_pass = "hunter2".to_string();
        });

        let (status, _) = send(&h.state, "GET", "/api/settings", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/api/settings")
            .header(AUTHORIZATION, format!("Basic {}", general_purpose::STANDARD.encode("admin:hunter2")))
            .body(Body::empty())
            .unwrap();
        let response = router(h.state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_reload_updates_rules_and_notifies() {
        let h = harness();
        let mut events = h.state.status.subscribe();
        let mut config = h.state.config();
        config.status_dict = crate::status::StatusMap::new();
        h.state.reload(config);

        assert!(matches!(events.recv().await.unwrap(), StatusEvent::ConfigChanged));
        assert!(h.state.lights.on_event("PrintDone").is_none());
    }

    #[tokio::test]
    async fn test_settings_save_keeps_reloaded_rules() {
        let h = harness();
        let mut config = h.state.config();
        config.status_dict.insert(
            "Home".to_string(),
            crate::status::StatusRecord { colour: "#0000FF".to_string(), brightness: Some(50), delay: Some(0), turnoff: Some(false) },
        );
        h.state.reload(config);

        let (status, _) = send(&h.state, "POST", "/api/settings", Some(json!({"default_bri": 90}))).await;
        assert_eq!(status, StatusCode::OK);

        let config = h.state.config();
        assert_eq!(config.default_bri, 90);
        assert_eq!(config.status_dict.get("Home").map(|r| r.colour.as_str()), Some("#0000FF"));
        assert!(h.state.lights.on_event("Home").is_some());

        let (_, body) = send(&h.state, "GET", "/api/settings", None).await;
        let rules = body["rules"].as_array().unwrap();
        assert!(rules.iter().any(|r| r["event"] == "Home"));
    }
}
