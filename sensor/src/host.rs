use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method as HttpMethod, StatusCode, Uri},
    response::{Html, IntoResponse, Redirect, Response},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, UdpSocket},
    runtime::Handle,
    sync::{Mutex, Notify},
};
use tracing::{debug, info, trace, warn};

use enviro_common::{
    device::{
        Board, Button, DeviceError, DeviceResult, DiskStats, NetworkScanner, PowerHal,
        Provisioner, ResetRequested, Rtc, SensorSource, StatusLed, TimeSource, Uploader,
        WifiStation,
    },
    dns::{catch_all_response, question_name},
    provisioning::{content_type_for, Method, PortalRequest, PortalResponse},
    storage::{write_atomically, DiskUsage},
    ActivityIndicator, Destination, Device, LifecycleConfig, LifecycleController,
    PowerController, ProvisioningController, Reading, SleepOutcome, Storage, SystemClock,
};

const MAX_FORM_BODY: usize = 4096;

/// Host harness knobs, read from `ENVIRO_*` environment variables.
#[derive(Debug, Clone)]
struct HostSettings {
    data_dir: PathBuf,
    board: String,
    portal_addr: SocketAddr,
    dns_addr: SocketAddr,
    button_held_ms: u64,
    networks: Vec<String>,
    wifi_fail: bool,
    ntp_fail: bool,
    lifecycle: LifecycleConfig,
}

impl HostSettings {
    fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::var("ENVIRO_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.enviro"));

        let mut lifecycle = load_lifecycle_config(&data_dir.join("lifecycle.json"))?;
        if let Ok(domain) = std::env::var("ENVIRO_PORTAL_DOMAIN") {
            lifecycle.portal_domain = domain;
        }
        if let Some(wait_ms) = env_parse::<u64>("ENVIRO_POWER_WAIT_MS") {
            lifecycle.power_wait_limit_ms = Some(wait_ms);
        }

        let portal_addr = std::env::var("ENVIRO_PORTAL_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let dns_addr =
            std::env::var("ENVIRO_DNS_ADDR").unwrap_or_else(|_| "127.0.0.1:5353".to_string());

        Ok(Self {
            data_dir,
            board: std::env::var("ENVIRO_BOARD").unwrap_or_else(|_| "urban".to_string()),
            portal_addr: portal_addr
                .parse()
                .with_context(|| format!("invalid ENVIRO_PORTAL_ADDR `{portal_addr}`"))?,
            dns_addr: dns_addr
                .parse()
                .with_context(|| format!("invalid ENVIRO_DNS_ADDR `{dns_addr}`"))?,
            button_held_ms: env_parse("ENVIRO_BUTTON_HELD_MS").unwrap_or(0),
            networks: std::env::var("ENVIRO_SCAN_NETWORKS")
                .map(|raw| raw.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            wifi_fail: env_flag("ENVIRO_WIFI_FAIL"),
            ntp_fail: env_flag("ENVIRO_NTP_FAIL"),
            lifecycle,
        })
    }

    /// External power is simulated only when a wait limit is configured;
    /// otherwise the harness behaves like a remote mount and exits on sleep.
    fn simulates_power(&self) -> bool {
        self.lifecycle.power_wait_limit_ms.is_some()
    }

    fn device(&self, handle: &Handle, first_boot: bool) -> Device {
        let clock = Arc::new(SystemClock);
        let button = HostButton::new(if first_boot { self.button_held_ms } else { 0 });
        let power = PowerController::new(
            Box::new(HostPower::new(!self.simulates_power())),
            Box::new(button),
            clock,
            ActivityIndicator::new(Box::new(HostLed)),
        )
        .with_settings(&self.lifecycle);

        Device {
            board: Box::new(HostBoard {
                model: self.board.clone(),
            }),
            rtc: Box::new(HostRtc::new(self.data_dir.join("rtc.json"))),
            wifi: Box::new(HostWifi {
                connected: false,
                fail: self.wifi_fail,
            }),
            time_source: Box::new(HostTimeSource {
                fail: self.ntp_fail,
            }),
            sensors: Box::new(HostSensors),
            uploader: Box::new(HttpUploader::new(handle.clone())),
            disk: Box::new(HostDisk),
            provisioner: Box::new(HostPortal {
                handle: handle.clone(),
                portal_addr: self.portal_addr,
                dns_addr: self.dns_addr,
                scanner: Arc::new(HostScanner {
                    networks: self.networks.clone(),
                }),
            }),
            power,
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env()?;
    std::fs::create_dir_all(&settings.data_dir).with_context(|| {
        format!(
            "failed to create data directory {}",
            settings.data_dir.display()
        )
    })?;
    info!(
        "enviro {} harness using {}",
        settings.board,
        settings.data_dir.display()
    );

    let handle = Handle::current();
    tokio::task::spawn_blocking(move || boot_loop(&handle, &settings))
        .await
        .context("boot loop panicked")
}

/// Runs boot cycles until the device exits. A reset boots again in-process.
fn boot_loop(handle: &Handle, settings: &HostSettings) {
    let mut boot: u64 = 0;
    loop {
        boot += 1;
        info!("boot #{boot}");

        let device = settings.device(handle, boot == 1);
        let storage = Storage::in_dir(&settings.data_dir);
        let mut lifecycle = LifecycleController::new(device, storage, settings.lifecycle.clone());

        match lifecycle.run() {
            SleepOutcome::Exited => {
                info!("device exited after boot #{boot}");
                return;
            }
            SleepOutcome::Reset(reason) => info!("reset ({reason:?}), booting again"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn load_lifecycle_config(path: &Path) -> anyhow::Result<LifecycleConfig> {
    match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw)
            .with_context(|| format!("invalid lifecycle settings in {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(LifecycleConfig::default()),
        Err(err) => Err(err.into()),
    }
}

struct HostBoard {
    model: String,
}

impl Board for HostBoard {
    fn model(&self) -> &str {
        &self.model
    }

    fn startup(&mut self) -> DeviceResult<()> {
        debug!("{} board startup", self.model);
        Ok(())
    }
}

/// Reports pressed until `held_ms` has passed since the first sample.
struct HostButton {
    held_ms: u64,
    first_sample: Option<Instant>,
}

impl HostButton {
    fn new(held_ms: u64) -> Self {
        Self {
            held_ms,
            first_sample: None,
        }
    }
}

impl Button for HostButton {
    fn is_pressed(&mut self) -> bool {
        if self.held_ms == 0 {
            return false;
        }
        let first = *self.first_sample.get_or_insert_with(Instant::now);
        first.elapsed() < Duration::from_millis(self.held_ms)
    }
}

struct HostLed;

impl StatusLed for HostLed {
    fn set(&mut self, lit: bool) {
        trace!("activity led {}", if lit { "on" } else { "off" });
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RtcState {
    set_to: NaiveDateTime,
    set_at: DateTime<Utc>,
}

/// Simulated battery-backed clock: remembers the last time it was set and
/// runs forward from there. Reads as January 2000 until first set.
struct HostRtc {
    path: PathBuf,
}

impl HostRtc {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn unset() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2000, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .unwrap_or_default()
    }
}

impl Rtc for HostRtc {
    fn now(&self) -> NaiveDateTime {
        let state = std::fs::read(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_slice::<RtcState>(&raw).ok());
        match state {
            Some(state) => state.set_to + (Utc::now() - state.set_at),
            None => Self::unset(),
        }
    }

    fn set(&mut self, utc: NaiveDateTime) -> DeviceResult<()> {
        let state = RtcState {
            set_to: utc,
            set_at: Utc::now(),
        };
        let raw = serde_json::to_vec_pretty(&state)
            .map_err(|err| DeviceError::new(format!("failed to encode rtc state: {err}")))?;
        write_atomically(&self.path, &raw)
            .map_err(|err| DeviceError::new(format!("failed to write rtc state: {err}")))
    }
}

struct HostWifi {
    connected: bool,
    fail: bool,
}

impl WifiStation for HostWifi {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connect(
        &mut self,
        ssid: &str,
        _password: &str,
        timeout: Duration,
    ) -> DeviceResult<Ipv4Addr> {
        if self.fail || ssid.is_empty() {
            return Err(DeviceError::new(format!(
                "no response from `{ssid}` within {}s",
                timeout.as_secs()
            )));
        }
        self.connected = true;
        Ok(Ipv4Addr::LOCALHOST)
    }
}

/// The host's own clock stands in for NTP.
struct HostTimeSource {
    fail: bool,
}

impl TimeSource for HostTimeSource {
    fn fetch(&mut self) -> DeviceResult<NaiveDateTime> {
        if self.fail {
            return Err(DeviceError::new("ntp server did not answer"));
        }
        Ok(Utc::now().naive_utc())
    }
}

struct HostSensors;

impl SensorSource for HostSensors {
    fn read(&mut self) -> DeviceResult<Vec<(String, f64)>> {
        // Simulated values that drift slowly with wall-clock time.
        let tick = Utc::now().timestamp().rem_euclid(3600) as f64 / 3600.0;
        Ok(vec![
            ("temperature".to_string(), 19.5 + tick * 3.0),
            ("humidity".to_string(), 45.0 + tick * 10.0),
            ("pressure".to_string(), 1013.0 - tick * 4.0),
        ])
    }
}

/// Development mounts cannot answer space queries.
struct HostDisk;

impl DiskStats for HostDisk {
    fn usage(&self) -> Option<DiskUsage> {
        None
    }
}

struct HostPower {
    remote: bool,
    wake_at: Option<Instant>,
}

impl HostPower {
    fn new(remote: bool) -> Self {
        Self {
            remote,
            wake_at: None,
        }
    }
}

impl PowerHal for HostPower {
    fn on_remote_harness(&self) -> bool {
        self.remote
    }

    fn schedule_wake(&mut self, after: Duration) -> DeviceResult<()> {
        self.wake_at = Some(Instant::now() + after);
        Ok(())
    }

    fn release_power_hold(&mut self) {
        debug!("power hold released (ignored on external power)");
    }

    fn wake_alarm_fired(&mut self) -> bool {
        self.wake_at.is_some_and(|at| Instant::now() >= at)
    }

    fn reset(&mut self) {
        info!("board reset");
    }
}

/// Posts each reading as JSON and treats any 2xx as confirmation.
struct HttpUploader {
    handle: Handle,
    client: reqwest::Client,
}

impl HttpUploader {
    fn new(handle: Handle) -> Self {
        Self {
            handle,
            client: reqwest::Client::new(),
        }
    }
}

impl Uploader for HttpUploader {
    fn upload(&mut self, destination: &Destination, reading: &Reading) -> DeviceResult<()> {
        let request = self
            .client
            .post(destination.as_str())
            .timeout(Duration::from_secs(30))
            .json(reading);

        self.handle
            .block_on(async move { request.send().await?.error_for_status() })
            .map(|_| ())
            .map_err(|err| DeviceError::new(format!("upload to {destination} failed: {err}")))
    }
}

struct HostScanner {
    networks: Vec<String>,
}

impl NetworkScanner for HostScanner {
    fn scan(&self) -> DeviceResult<Vec<Vec<u8>>> {
        Ok(self
            .networks
            .iter()
            .map(|name| name.as_bytes().to_vec())
            .collect())
    }
}

/// Serves the wizard over axum and answers DNS on a UDP socket until the
/// final step asks for a reset.
struct HostPortal {
    handle: Handle,
    portal_addr: SocketAddr,
    dns_addr: SocketAddr,
    scanner: Arc<dyn NetworkScanner>,
}

#[derive(Clone)]
struct PortalState {
    controller: Arc<Mutex<ProvisioningController>>,
    scanner: Arc<dyn NetworkScanner>,
    finished: Arc<Notify>,
}

impl Provisioner for HostPortal {
    fn provision(
        &mut self,
        controller: ProvisioningController,
        activity: &mut ActivityIndicator,
    ) -> DeviceResult<ResetRequested> {
        info!(
            "access point `{}` up, open http://{}{} (served on {})",
            controller.access_point_name(),
            controller.domain(),
            enviro_common::provisioning::ROUTE_WELCOME,
            self.portal_addr
        );

        let result = self.handle.block_on(serve_portal(
            controller,
            Arc::clone(&self.scanner),
            self.portal_addr,
            self.dns_addr,
        ));
        activity.stop();

        result
            .map(|()| ResetRequested)
            .map_err(|err| DeviceError::new(format!("{err:#}")))
    }
}

async fn serve_portal(
    controller: ProvisioningController,
    scanner: Arc<dyn NetworkScanner>,
    portal_addr: SocketAddr,
    dns_addr: SocketAddr,
) -> anyhow::Result<()> {
    let answer_ip = match portal_addr.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => ip,
        _ => Ipv4Addr::LOCALHOST,
    };
    let dns_socket = UdpSocket::bind(dns_addr)
        .await
        .with_context(|| format!("failed to bind dns responder at {dns_addr}"))?;
    let dns = tokio::spawn(dns_responder(dns_socket, answer_ip));

    let state = PortalState {
        controller: Arc::new(Mutex::new(controller)),
        scanner,
        finished: Arc::new(Notify::new()),
    };
    let finished = Arc::clone(&state.finished);

    let app = Router::new().fallback(handle_portal).with_state(state);
    let listener = TcpListener::bind(portal_addr)
        .await
        .with_context(|| format!("failed to bind provisioning server at {portal_addr}"))?;

    info!("provisioning server listening on http://{portal_addr}");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { finished.notified().await })
        .await;
    dns.abort();
    served.context("provisioning server failed")
}

async fn dns_responder(socket: UdpSocket, answer_ip: Ipv4Addr) {
    let mut buf = [0_u8; 512];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("dns receive error: {err}");
                continue;
            }
        };

        let query = &buf[..len];
        let Some(reply) = catch_all_response(query, answer_ip) else {
            debug!("ignoring malformed dns packet from {peer}");
            continue;
        };
        trace!(
            "dns {} -> {answer_ip}",
            question_name(query).unwrap_or_default()
        );
        if let Err(err) = socket.send_to(&reply, peer).await {
            warn!("dns send error to {peer}: {err}");
        }
    }
}

async fn handle_portal(
    State(state): State<PortalState>,
    method: HttpMethod,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    if body.len() > MAX_FORM_BODY {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    // Drop any port so `pico.wireless:8080` still matches the portal domain.
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| host.split(':').next().unwrap_or(host));
    let method = match method {
        HttpMethod::GET => Method::Get,
        HttpMethod::POST => Method::Post,
        _ => Method::Other,
    };
    let request = PortalRequest {
        method,
        host,
        path: uri.path(),
        body: &body,
    };

    let response = state.controller.lock().await.handle(&request);
    match response {
        PortalResponse::Html { status, body } => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            Html(body),
        )
            .into_response(),
        PortalResponse::Redirect(location) => Redirect::to(&location).into_response(),
        PortalResponse::Networks => match state.scanner.scan() {
            Ok(scanned) => Json(enviro_common::network_names(scanned)).into_response(),
            Err(err) => {
                warn!("network scan failed: {err}");
                Json(Vec::<String>::new()).into_response()
            }
        },
        PortalResponse::Asset(path) => match tokio::fs::read(&path).await {
            Ok(contents) => (
                [(header::CONTENT_TYPE, content_type_for(&path))],
                contents,
            )
                .into_response(),
            Err(err) => {
                warn!("failed to read asset {}: {err}", path.display());
                StatusCode::NOT_FOUND.into_response()
            }
        },
        PortalResponse::NotFound => StatusCode::NOT_FOUND.into_response(),
        PortalResponse::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        PortalResponse::Reset => {
            state.finished.notify_one();
            Html("<p>Restarting&hellip;</p>").into_response()
        }
    }
}
