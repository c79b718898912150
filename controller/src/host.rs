use std::{
    fs,
    io::{ErrorKind, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Form, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{Mutex, Notify},
    task::JoinHandle,
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use wordclock_common::{
    config::{PROVISIONING_AP_IP, PROVISIONING_AP_NETMASK, PROVISIONING_AP_SSID},
    BlobStorage, ClockError, ColorUpdate, ConfigStore, ConfigUpdate, ControllerTiming, Mode,
    ModeController, MutationReport, NetworkIndicator, ProvisioningRequest, RawTime,
    RenderInstruction, RenderSink, StorageError, TimeSource,
};

const PROVISIONING_INDEX_HTML: &str = include_str!("../web/provisioning.html");
const PROVISIONING_CONFIRM_HTML: &str =
    "<!doctype html><html><body><p>WiFi settings saved. The clock restarts now.</p></body></html>";
const PROVISIONING_REJECT_HTML: &str =
    "<!doctype html><html><body><p>No SSID given. <a href=\"/\">Try again</a>.</p></body></html>";

#[derive(Clone)]
struct AppState {
    controller: Arc<Mutex<ModeController<FileStorage>>>,
    restart: Arc<Notify>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
struct HostSettings {
    data_dir: PathBuf,
    http_port: u16,
    timing: ControllerTiming,
}

enum Exit {
    Restart,
    Shutdown,
}

/// Config blob on the local filesystem, committed by write-then-rename.
#[derive(Debug)]
struct FileStorage {
    path: PathBuf,
}

/// Wall clock of the host; always synchronized.
struct SystemClock;

/// Stands in for the LED fixture by logging what it would show.
#[derive(Debug, Default)]
struct LogSink;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env();
    loop {
        match run_once(&settings).await? {
            Exit::Restart => info!("restarting controller"),
            Exit::Shutdown => return Ok(()),
        }
    }
}

async fn run_once(settings: &HostSettings) -> anyhow::Result<Exit> {
    let storage = FileStorage::new(settings.data_dir.join("config.json"));
    let mut store = ConfigStore::new(storage);
    if let Err(err) = store.load() {
        warn!(
            "failed to load configuration from {}, using defaults: {:#}",
            store.storage().path.display(),
            anyhow::Error::new(err)
        );
    }

    let controller = ModeController::new(store, settings.timing.clone());
    let mode = controller.mode();
    info!("starting in {} mode", mode.as_str());

    let app_state = AppState {
        controller: Arc::new(Mutex::new(controller)),
        restart: Arc::new(Notify::new()),
    };

    let mut sink = LogSink;
    sink.indicate(NetworkIndicator::NotConnected);

    let (app, control_loop) = match mode {
        Mode::Provisioning => {
            bring_up_access_point();
            (provisioning_router(app_state.clone()), None)
        }
        Mode::Normal => {
            associate_station(&app_state).await;
            sink.indicate(NetworkIndicator::Connected);
            (
                normal_router(app_state.clone()),
                Some(spawn_control_loop(app_state.clone(), sink)),
            )
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;
    info!("controller listening on http://{addr}");

    let restart = app_state.restart.clone();
    let (exit_tx, mut exit_rx) = tokio::sync::oneshot::channel();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let exit = tokio::select! {
                _ = restart.notified() => Exit::Restart,
                _ = tokio::signal::ctrl_c() => Exit::Shutdown,
            };
            let _ = exit_tx.send(exit);
        })
        .await
        .context("controller server failed")?;

    if let Some(handle) = control_loop {
        handle.abort();
    }

    Ok(exit_rx.try_recv().unwrap_or(Exit::Shutdown))
}

fn normal_router(app_state: AppState) -> Router {
    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    Router::new()
        .route("/config", get(handle_get_config).post(handle_post_config))
        .route("/color", post(handle_post_color))
        .route("/api/status", get(handle_get_status))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state)
}

fn provisioning_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_provisioning_page).post(handle_provision))
        .route("/api/status", get(handle_get_status))
        .fallback(handle_provisioning_page)
        .with_state(app_state)
}

fn bring_up_access_point() {
    let [a, b, c, d] = PROVISIONING_AP_IP;
    let [m1, m2, m3, m4] = PROVISIONING_AP_NETMASK;
    info!(
        "provisioning AP `{PROVISIONING_AP_SSID}` stands in at {a}.{b}.{c}.{d}/{m1}.{m2}.{m3}.{m4}"
    );
}

async fn associate_station(app_state: &AppState) {
    let controller = app_state.controller.lock().await;
    let config = controller.config();
    info!(
        "host network in use for ssid `{}` (hostname `{}`)",
        config.ssid, config.hostname
    );
}

fn spawn_control_loop(app_state: AppState, mut sink: LogSink) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tick_ms = app_state.controller.lock().await.timing.tick_interval_ms;
        let mut interval = tokio::time::interval(Duration::from_millis(tick_ms.max(1)));
        let mut clock = SystemClock;
        let mut time_synced = None;

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let outcome = {
                let mut controller = app_state.controller.lock().await;
                controller.tick(now_ms, &mut clock, &mut sink)
            };

            if let Some(err) = outcome.persist_error {
                warn!("configuration persist retry failed: {err}");
            }
            if time_synced != Some(outcome.time_synced) {
                if outcome.time_synced {
                    info!("time source synchronized");
                } else {
                    warn!("time source not synchronized; display blanked");
                }
                time_synced = Some(outcome.time_synced);
            }
        }
    })
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    let document = state.controller.lock().await.document();
    Json(document)
}

async fn handle_post_config(
    State(state): State<AppState>,
    payload: Result<Json<ConfigUpdate>, JsonRejection>,
) -> Response {
    let Json(update) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return json_rejection_response(rejection),
    };
    info!("configuration received");
    let result = {
        let mut controller = state.controller.lock().await;
        controller.replace_config(&update, monotonic_ms())
    };
    mutation_response(result)
}

async fn handle_post_color(
    State(state): State<AppState>,
    payload: Result<Json<ColorUpdate>, JsonRejection>,
) -> Response {
    let Json(update) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return json_rejection_response(rejection),
    };
    info!("color received");
    let result = {
        let mut controller = state.controller.lock().await;
        controller.replace_color(&update, monotonic_ms())
    };
    mutation_response(result)
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.controller.lock().await.status();
    Json(status)
}

async fn handle_provisioning_page() -> Html<&'static str> {
    Html(PROVISIONING_INDEX_HTML)
}

async fn handle_provision(
    State(state): State<AppState>,
    Form(request): Form<ProvisioningRequest>,
) -> Response {
    let (result, restart_delay_ms) = {
        let mut controller = state.controller.lock().await;
        let result = controller.provision(&request);
        (result, controller.timing.restart_delay_ms)
    };

    match result {
        Ok(()) => {
            info!(
                "wifi credentials stored for ssid `{}`; restarting in {restart_delay_ms}ms",
                request.ssid.as_deref().unwrap_or_default().trim()
            );
            schedule_restart(&state, restart_delay_ms);
            Html(PROVISIONING_CONFIRM_HTML).into_response()
        }
        Err(err) if err.is_validation() => {
            warn!("provisioning rejected: {err}");
            (StatusCode::BAD_REQUEST, Html(PROVISIONING_REJECT_HTML)).into_response()
        }
        Err(err) => {
            warn!("provisioning failed: {:#}", anyhow::Error::new(err));
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist wifi settings",
            )
        }
    }
}

fn schedule_restart(state: &AppState, delay_ms: u64) {
    let restart = state.restart.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        restart.notify_one();
    });
}

fn mutation_response(result: Result<MutationReport, ClockError>) -> Response {
    match result {
        Ok(report) => {
            for rejected in &report.rejected {
                warn!(
                    "rejected {:?} update, `{}`: {}",
                    rejected.group, rejected.field, rejected.reason
                );
            }
            if let Some(err) = &report.persist_error {
                warn!("configuration kept in memory only: {err}");
            }
            if report.is_rejected() {
                (StatusCode::BAD_REQUEST, Json(report)).into_response()
            } else {
                Json(report).into_response()
            }
        }
        Err(err) => clock_error_response(&err),
    }
}

fn json_rejection_response(rejection: JsonRejection) -> Response {
    let message = rejection.body_text();
    warn!("unreadable request body: {message}");
    error_response(StatusCode::BAD_REQUEST, &message)
}

fn clock_error_response(err: &ClockError) -> Response {
    let status = match err {
        ClockError::Validation { .. } => StatusCode::BAD_REQUEST,
        ClockError::ModeMismatch { .. } => StatusCode::CONFLICT,
        ClockError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ClockError::TimeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

impl HostSettings {
    fn from_env() -> Self {
        let data_dir = std::env::var("CLOCK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.wordclock"));
        let http_port = std::env::var("CLOCK_HTTP_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(8080);

        let mut timing = ControllerTiming::default();
        if let Some(tick_ms) = std::env::var("CLOCK_TICK_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
        {
            timing.tick_interval_ms = tick_ms;
        }

        Self {
            data_dir,
            http_port,
            timing,
        }
    }
}

impl FileStorage {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl BlobStorage for FileStorage {
    fn read_blob(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Backend(format!(
                "reading {}: {err}",
                self.path.display()
            ))),
        }
    }

    fn write_blob(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        write_atomically(&self.path, bytes)
            .map_err(|err| StorageError::Backend(format!("{err:#}")))
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("creating {}", tmp_path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("renaming onto {}", path.display()))?;
    Ok(())
}

impl TimeSource for SystemClock {
    fn raw_time(&mut self) -> RawTime {
        RawTime::from_time(&Utc::now())
    }
}

impl RenderSink for LogSink {
    fn apply(&mut self, instruction: &RenderInstruction) {
        if !instruction.visible {
            info!("display off");
            return;
        }
        let color = instruction.output_color();
        info!(
            "display {:02}:{:02} rgb({}, {}, {})",
            instruction.hour, instruction.minute, color.red, color.green, color.blue
        );
        debug!("render instruction: {instruction:?}");
    }

    fn indicate(&mut self, indicator: NetworkIndicator) {
        match indicator {
            NetworkIndicator::NotConnected => info!("indicator: no network"),
            NetworkIndicator::Connected => info!("indicator: network connected"),
        }
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
