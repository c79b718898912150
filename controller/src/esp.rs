use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{
        Configuration as IpConfiguration, Mask, RouterConfiguration as IpRouterConfiguration,
        Subnet,
    },
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use wordclock_common::{
    config::{
        PROVISIONING_AP_GATEWAY, PROVISIONING_AP_IP, PROVISIONING_AP_NETMASK,
        PROVISIONING_AP_SSID,
    },
    BlobStorage, ClockError, ColorUpdate, ConfigStore, ConfigUpdate, ControllerTiming, Mode,
    ModeController, MutationReport, NetworkIndicator, ProvisioningRequest, RawTime, RenderSink,
    StorageError, TimeSource, MAX_CONFIG_BLOB_BYTES,
};

use crate::led::LedRing;

const NVS_NAMESPACE: &str = "wordclock";
const NVS_CONFIG_KEY: &str = "config";
const MAX_HTTP_BODY: usize = 1024;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

const INDEX_HTML: &str = include_str!("../web/index.html");
const PROVISIONING_INDEX_HTML: &str = include_str!("../web/provisioning.html");
const PROVISIONING_CONFIRM_HTML: &str =
    "<!doctype html><html><body><p>WiFi settings saved. The clock restarts now.</p></body></html>";
const PROVISIONING_REJECT_HTML: &str =
    "<!doctype html><html><body><p>No SSID given. <a href=\"/\">Try again</a>.</p></body></html>";

type SharedController = Arc<Mutex<ModeController<NvsStorage>>>;

/// Config blob kept under one NVS key.
struct NvsStorage {
    nvs: EspNvs<NvsDefault>,
}

/// SNTP-backed clock; reports [`RawTime::UNSYNCED`] until the first sync
/// completes.
struct SntpClock {
    sntp: EspSntp<'static>,
    synced: bool,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let storage = NvsStorage::new(nvs_partition.clone())?;

    let mut store = ConfigStore::new(storage);
    if let Err(err) = store.load() {
        warn!(
            "failed to load configuration from NVS, using defaults: {:#}",
            anyhow::Error::new(err)
        );
    }
    ensure_wifi_defaults(&mut store);

    let config = store.current().clone();
    info!(
        "NVS config loaded: hostname=`{}`, ssid=`{}`",
        config.hostname, config.ssid
    );

    let Peripherals {
        modem, rmt, pins, ..
    } = Peripherals::take()?;
    let mut ring = LedRing::new(rmt.channel0, pins.gpio13)?;
    ring.indicate(NetworkIndicator::NotConnected);

    let controller = ModeController::new(store, ControllerTiming::default());
    let mode = controller.mode();
    info!("starting in {} mode", mode.as_str());
    let state: SharedController = Arc::new(Mutex::new(controller));

    match mode {
        Mode::Provisioning => {
            let wifi = start_provisioning_ap(modem, sys_loop, nvs_partition)
                .context("provisioning AP startup failed")?;
            let server = create_provisioning_http_server(state)?;

            let _ring = ring;
            let _wifi = wifi;
            let _server = server;
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
        Mode::Normal => {
            let wifi = connect_wifi(modem, sys_loop, nvs_partition, &config)
                .context("wifi startup failed")?;
            ring.indicate(NetworkIndicator::Connected);

            let sntp = EspSntp::new_default().context("failed to start SNTP")?;
            info!("SNTP initialized");
            let clock = SntpClock { sntp, synced: false };

            spawn_control_loop(state.clone(), clock, ring);
            let server = create_http_server(state)?;

            let _wifi = wifi;
            let _server = server;
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
    }
}

/// Fills missing station credentials from build-time `WIFI_SSID`/`WIFI_PASS`
/// and writes them to NVS right away, so later boots find them stored.
fn ensure_wifi_defaults(store: &mut ConfigStore<NvsStorage>) {
    let Some(ssid) = option_env!("WIFI_SSID") else {
        return;
    };
    match store.seed_credentials(ssid, option_env!("WIFI_PASS")) {
        Ok(true) => info!("stored build-time wifi credentials for ssid `{ssid}`"),
        Ok(false) => {}
        Err(err) if err.is_validation() => {
            warn!("ignoring build-time wifi credentials: {err}");
        }
        Err(err) => warn!(
            "build-time wifi credentials kept in memory only: {:#}",
            anyhow::Error::new(err)
        ),
    }
}

fn create_http_server(state: SharedController) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/config", Method::Get, move |req| {
            let document = lock(&state).document();
            write_json(req, &document)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/config", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: ConfigUpdate = match serde_json::from_slice(&body) {
                Ok(update) => update,
                Err(err) => {
                    return write_error(req, 400, &format!("invalid config payload: {err}"));
                }
            };
            info!("configuration received");

            let result = lock(&state).replace_config(&update, monotonic_ms());
            write_mutation(req, result)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/color", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: ColorUpdate = match serde_json::from_slice(&body) {
                Ok(update) => update,
                Err(err) => {
                    return write_error(req, 400, &format!("invalid color payload: {err}"));
                }
            };
            info!("color received");

            let result = lock(&state).replace_color(&update, monotonic_ms());
            write_mutation(req, result)
        })?;
    }

    server.fn_handler("/api/status", Method::Get, move |req| {
        let status = lock(&state).status();
        write_json(req, &status)
    })?;

    Ok(server)
}

fn create_provisioning_http_server(
    state: SharedController,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_ok_response()?
                .write_all(PROVISIONING_INDEX_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let request: ProvisioningRequest = match serde_urlencoded::from_bytes(&body) {
                Ok(request) => request,
                Err(err) => {
                    warn!("unreadable provisioning form: {err}");
                    return write_error(req, 400, &format!("invalid form body: {err}"));
                }
            };

            let (result, restart_delay_ms) = {
                let mut controller = lock(&state);
                let result = controller.provision(&request);
                (result, controller.timing.restart_delay_ms)
            };

            match result {
                Ok(()) => {
                    info!(
                        "wifi credentials stored for ssid `{}`; restarting in {restart_delay_ms}ms",
                        request.ssid.as_deref().unwrap_or_default().trim()
                    );
                    thread::Builder::new()
                        .name("prov-restart".into())
                        .spawn(move || {
                            thread::sleep(Duration::from_millis(restart_delay_ms));
                            unsafe { esp_idf_svc::sys::esp_restart() };
                        })
                        .context("failed to spawn restart thread")?;
                    write_html(req, 200, PROVISIONING_CONFIRM_HTML)
                }
                Err(err) if err.is_validation() => {
                    warn!("provisioning rejected: {err}");
                    write_html(req, 400, PROVISIONING_REJECT_HTML)
                }
                Err(err) => {
                    warn!("provisioning failed: {:#}", anyhow::Error::new(err));
                    write_error(req, 500, "Failed to persist wifi settings")
                }
            }
        })?;
    }

    server.fn_handler("/api/status", Method::Get, move |req| {
        let status = lock(&state).status();
        write_json(req, &status)
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_mutation(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    result: Result<MutationReport, ClockError>,
) -> anyhow::Result<()> {
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
            let status = if report.is_rejected() { 400 } else { 200 };
            write_json_status(req, status, &report)
        }
        Err(err) => {
            let status = match err {
                ClockError::Validation { .. } => 400,
                ClockError::ModeMismatch { .. } => 409,
                ClockError::Persistence(_) => 500,
                ClockError::TimeUnavailable => 503,
            };
            write_error(req, status, &err.to_string())
        }
    }
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    write_json_status(req, 200, payload)
}

fn write_json_status<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    write_json_status(req, status_code, &payload)
}

fn write_html(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    html: &str,
) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/html; charset=utf-8")],
    )?
    .write_all(html.as_bytes())?;
    Ok(())
}

fn ipv4_from_octets(ip: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])
}

fn netmask_bits(netmask: [u8; 4]) -> u8 {
    u32::from_be_bytes(netmask).count_ones() as u8
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    config: &wordclock_common::Configuration,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    if let Err(err) = esp_wifi.sta_netif_mut().set_hostname(&config.hostname) {
        warn!("failed to set hostname `{}`: {err}", config.hostname);
    }

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if config.wifi_password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: config
            .wifi_password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", config.ssid);

    let mut attempt = 1_u32;
    loop {
        info!("wifi connect attempt {attempt}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                break;
            }
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }
        let _ = wifi.disconnect();
        thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        attempt = attempt.saturating_add(1);
    }

    Ok(esp_wifi)
}

fn start_provisioning_ap(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    let gateway = ipv4_from_octets(PROVISIONING_AP_GATEWAY);
    let netif_conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Router(IpRouterConfiguration {
            subnet: Subnet {
                gateway,
                mask: Mask(netmask_bits(PROVISIONING_AP_NETMASK)),
            },
            dhcp_enabled: true,
            dns: Some(gateway),
            secondary_dns: None,
        })),
        ..NetifConfiguration::wifi_default_router()
    };
    esp_wifi
        .swap_netif_ap(EspNetif::new_with_conf(&netif_conf)?)
        .context("failed to apply provisioning AP address")?;

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        auth_method: AuthMethod::None,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!(
        "provisioning AP started on `{}` at {}",
        PROVISIONING_AP_SSID,
        ipv4_from_octets(PROVISIONING_AP_IP)
    );

    Ok(esp_wifi)
}

fn spawn_control_loop(state: SharedController, mut clock: SntpClock, mut ring: LedRing) {
    let spawned = thread::Builder::new()
        .name("control-loop".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let tick_ms = lock(&state).timing.tick_interval_ms.max(1);
            let mut time_synced = None;

            loop {
                let now_ms = monotonic_ms();
                let outcome = lock(&state).tick(now_ms, &mut clock, &mut ring);

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

                thread::sleep(Duration::from_millis(tick_ms));
            }
        });

    if let Err(err) = spawned {
        warn!("failed to spawn control loop thread: {err}");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NvsStorage {
    fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .with_context(|| format!("failed to open NVS namespace `{NVS_NAMESPACE}`"))?;
        Ok(Self { nvs })
    }
}

impl BlobStorage for NvsStorage {
    fn read_blob(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let mut buffer = [0_u8; MAX_CONFIG_BLOB_BYTES];
        self.nvs
            .get_blob(NVS_CONFIG_KEY, &mut buffer)
            .map(|blob| blob.map(<[u8]>::to_vec))
            .map_err(|err| StorageError::Backend(format!("NVS read failed: {err}")))
    }

    fn write_blob(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.nvs
            .set_blob(NVS_CONFIG_KEY, bytes)
            .map_err(|err| StorageError::Backend(format!("NVS write failed: {err}")))
    }
}

impl TimeSource for SntpClock {
    fn raw_time(&mut self) -> RawTime {
        if !self.synced {
            self.synced = self.sntp.get_sync_status() == SyncStatus::Completed;
        }
        if self.synced {
            RawTime::from_time(&Utc::now())
        } else {
            RawTime::UNSYNCED
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
