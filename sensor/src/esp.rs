use core::convert::TryInto;
use std::{
    ffi::CStr,
    net::{Ipv4Addr, UdpSocket},
    path::Path,
    sync::{
        mpsc::{self, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{NaiveDateTime, Utc};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method as HttpMethod, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyInputPin, AnyOutputPin, Input, InputPin, Output, OutputPin, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    sntp::{EspSntp, SyncStatus},
    sys::{esp, ESP_OK},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use enviro_common::{
    device::{
        Board, Button, DeviceError, DeviceResult, DiskStats, NetworkScanner, PowerHal,
        Provisioner, ResetRequested, Rtc, SensorSource, StatusLed, TimeSource, Uploader,
        WifiStation,
    },
    dns::catch_all_response,
    network_names,
    provisioning::{content_type_for, Method, PortalRequest, PortalResponse},
    storage::DiskUsage,
    ActivityIndicator, Destination, Device, LifecycleConfig, LifecycleController,
    PowerController, ProvisioningController, Reading, Storage, SystemClock,
};

const BOARD_MODEL: &str = match option_env!("ENVIRO_BOARD") {
    Some(model) => model,
    None => "urban",
};

const DATA_MOUNT: &str = "/data";
const DATA_MOUNT_C: &CStr = c"/data";
const DATA_PARTITION_C: &CStr = c"storage";

const DNS_PORT: u16 = 53;
const MAX_HTTP_BODY: usize = 4096;
const NTP_SYNC_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

type SharedWifi = Arc<Mutex<BlockingWifi<EspWifi<'static>>>>;
type HttpRequest<'r, 'c> =
    esp_idf_svc::http::server::Request<&'r mut esp_idf_svc::http::server::EspHttpConnection<'c>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    // Hold our own power on until the cycle is finished.
    let mut power_hold = PinDriver::output(pins.gpio4.downgrade_output())?;
    power_hold.set_high()?;

    let mut button = PinDriver::input(pins.gpio0.downgrade_input())?;
    button.set_pull(Pull::Up)?;
    let led = PinDriver::output(pins.gpio2.downgrade_output())?;

    mount_data_partition().context("failed to mount data partition")?;

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let wifi: SharedWifi = Arc::new(Mutex::new(BlockingWifi::wrap(esp_wifi, sys_loop)?));

    let settings = LifecycleConfig::default();
    let power = PowerController::new(
        Box::new(EspPower {
            hold: power_hold,
            wake_at: None,
        }),
        Box::new(EspButton(button)),
        Arc::new(SystemClock),
        ActivityIndicator::new(Box::new(EspLed(led))),
    )
    .with_settings(&settings);

    let device = Device {
        board: Box::new(EspBoard),
        rtc: Box::new(SystemRtc),
        wifi: Box::new(EspStation {
            wifi: Arc::clone(&wifi),
        }),
        time_source: Box::new(SntpTimeSource),
        sensors: Box::new(ChipSensors),
        uploader: Box::new(HttpUploader),
        disk: Box::new(FatUsage),
        provisioner: Box::new(EspPortal { wifi }),
        power,
    };

    let storage = Storage::in_dir(Path::new(DATA_MOUNT));
    let outcome = LifecycleController::new(device, storage, settings).run();

    // Every path ends in a reset or power-off; getting here means neither took.
    warn!("boot cycle returned {outcome:?}, restarting");
    restart()
}

fn restart() -> ! {
    unsafe { esp_idf_svc::sys::esp_restart() };
    #[allow(unreachable_code)]
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

fn mount_data_partition() -> anyhow::Result<()> {
    let conf = esp_idf_svc::sys::esp_vfs_fat_mount_config_t {
        format_if_mount_failed: true,
        max_files: 8,
        allocation_unit_size: 4096,
        ..Default::default()
    };
    let mut handle: esp_idf_svc::sys::wl_handle_t = esp_idf_svc::sys::WL_INVALID_HANDLE as _;
    esp!(unsafe {
        esp_idf_svc::sys::esp_vfs_fat_spiflash_mount_rw_wl(
            DATA_MOUNT_C.as_ptr(),
            DATA_PARTITION_C.as_ptr(),
            &conf,
            &mut handle,
        )
    })?;
    info!("data partition mounted at {DATA_MOUNT}");
    Ok(())
}

struct EspBoard;

impl Board for EspBoard {
    fn model(&self) -> &str {
        BOARD_MODEL
    }

    fn startup(&mut self) -> DeviceResult<()> {
        let reason = unsafe { esp_idf_svc::sys::esp_reset_reason() };
        info!("enviro {BOARD_MODEL} starting (reset reason {reason})");
        Ok(())
    }
}

/// Standby button, active low.
struct EspButton(PinDriver<'static, AnyInputPin, Input>);

impl Button for EspButton {
    fn is_pressed(&mut self) -> bool {
        self.0.is_low()
    }
}

struct EspLed(PinDriver<'static, AnyOutputPin, Output>);

impl StatusLed for EspLed {
    fn set(&mut self, lit: bool) {
        if let Err(err) = self.0.set_level(lit.into()) {
            debug!("failed to drive activity led: {err:?}");
        }
    }
}

/// The system clock survives deep sleep on the RTC timer; an unset clock
/// reads as 1970.
struct SystemRtc;

impl Rtc for SystemRtc {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }

    fn set(&mut self, utc: NaiveDateTime) -> DeviceResult<()> {
        let tv = esp_idf_svc::sys::timeval {
            tv_sec: utc.and_utc().timestamp() as _,
            tv_usec: 0,
        };
        let rc = unsafe { esp_idf_svc::sys::settimeofday(&tv, core::ptr::null()) };
        if rc != 0 {
            return Err(DeviceError::new(format!("settimeofday failed ({rc})")));
        }
        Ok(())
    }
}

struct SntpTimeSource;

impl TimeSource for SntpTimeSource {
    fn fetch(&mut self) -> DeviceResult<NaiveDateTime> {
        let sntp = EspSntp::new_default()
            .map_err(|err| DeviceError::new(format!("failed to start sntp: {err}")))?;

        let started = Instant::now();
        while sntp.get_sync_status() != SyncStatus::Completed {
            if started.elapsed() >= NTP_SYNC_TIMEOUT {
                return Err(DeviceError::new(format!(
                    "no ntp response within {}s",
                    NTP_SYNC_TIMEOUT.as_secs()
                )));
            }
            thread::sleep(Duration::from_millis(100));
        }
        Ok(Utc::now().naive_utc())
    }
}

/// Chip-level health values. Board sensor drivers report through the same
/// trait.
struct ChipSensors;

impl SensorSource for ChipSensors {
    fn read(&mut self) -> DeviceResult<Vec<(String, f64)>> {
        let free_heap = unsafe { esp_idf_svc::sys::esp_get_free_heap_size() };
        let uptime_us = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        Ok(vec![
            ("free_heap_bytes".to_string(), f64::from(free_heap)),
            ("uptime_s".to_string(), uptime_us as f64 / 1_000_000.0),
        ])
    }
}

struct FatUsage;

impl DiskStats for FatUsage {
    fn usage(&self) -> Option<DiskUsage> {
        let mut total: u64 = 0;
        let mut free: u64 = 0;
        let rc = unsafe {
            esp_idf_svc::sys::esp_vfs_fat_info(DATA_MOUNT_C.as_ptr(), &mut total, &mut free)
        };
        if rc != ESP_OK {
            warn!("failed to query data partition usage: esp_err_t={rc}");
            return None;
        }
        Some(DiskUsage {
            free_blocks: free,
            total_blocks: total,
        })
    }
}

struct EspPower {
    hold: PinDriver<'static, AnyOutputPin, Output>,
    wake_at: Option<Instant>,
}

impl PowerHal for EspPower {
    fn on_remote_harness(&self) -> bool {
        false
    }

    fn schedule_wake(&mut self, after: Duration) -> DeviceResult<()> {
        let micros = u64::try_from(after.as_micros()).unwrap_or(u64::MAX);
        esp!(unsafe { esp_idf_svc::sys::esp_sleep_enable_timer_wakeup(micros) })
            .map_err(|err| DeviceError::new(format!("failed to arm wake timer: {err}")))?;
        self.wake_at = Some(Instant::now() + after);
        Ok(())
    }

    fn release_power_hold(&mut self) {
        if let Err(err) = self.hold.set_low() {
            warn!("failed to release power hold: {err:?}");
        }
    }

    fn wake_alarm_fired(&mut self) -> bool {
        self.wake_at.is_some_and(|at| Instant::now() >= at)
    }

    fn reset(&mut self) {
        thread::sleep(Duration::from_millis(100));
        restart();
    }
}

struct EspStation {
    wifi: SharedWifi,
}

impl WifiStation for EspStation {
    fn is_connected(&self) -> bool {
        self.wifi
            .lock()
            .map(|wifi| wifi.is_up().unwrap_or(false))
            .unwrap_or(false)
    }

    fn connect(
        &mut self,
        ssid: &str,
        password: &str,
        timeout: Duration,
    ) -> DeviceResult<Ipv4Addr> {
        let mut wifi = self
            .wifi
            .lock()
            .map_err(|_| DeviceError::new("wifi driver lock poisoned"))?;
        connect_station(&mut wifi, ssid, password, timeout)
            .map_err(|err| DeviceError::new(format!("{err:#}")))
    }
}

fn connect_station(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    ssid: &str,
    password: &str,
    timeout: Duration,
) -> anyhow::Result<Ipv4Addr> {
    let auth_method = if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: password
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    if !wifi.is_started()? {
        wifi.start()?;
    }
    info!("wifi started, connecting to `{ssid}`");
    wifi.wifi_mut().connect()?;

    let started = Instant::now();
    while !wifi.is_up()? {
        if started.elapsed() >= timeout {
            let _ = wifi.disconnect();
            return Err(anyhow!(
                "timed out after {}s joining `{ssid}`",
                timeout.as_secs()
            ));
        }
        thread::sleep(Duration::from_millis(250));
    }

    let ip_info = wifi.wifi().sta_netif().get_ip_info()?;
    Ok(ip_info.ip)
}

struct HttpUploader;

impl Uploader for HttpUploader {
    fn upload(&mut self, destination: &Destination, reading: &Reading) -> DeviceResult<()> {
        post_reading(destination.as_str(), reading)
            .map_err(|err| DeviceError::new(format!("upload to {destination} failed: {err:#}")))
    }
}

fn post_reading(url: &str, reading: &Reading) -> anyhow::Result<()> {
    let body = serde_json::to_vec(reading)?;
    let http_conf = HttpClientConfiguration {
        timeout: Some(UPLOAD_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);

    let content_length = body.len().to_string();
    let headers = [
        ("Content-Type", "application/json"),
        ("Content-Length", content_length.as_str()),
    ];
    let mut request = client.request(HttpMethod::Post, url, &headers)?;
    request.write_all(&body).map_err(|e| anyhow!("{e:?}"))?;
    request.flush().map_err(|e| anyhow!("{e:?}"))?;
    let response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("destination answered HTTP {status}"));
    }
    Ok(())
}

struct EspScanner {
    wifi: SharedWifi,
}

impl NetworkScanner for EspScanner {
    fn scan(&self) -> DeviceResult<Vec<Vec<u8>>> {
        let mut wifi = self
            .wifi
            .lock()
            .map_err(|_| DeviceError::new("wifi driver lock poisoned"))?;
        let found = wifi
            .scan()
            .map_err(|err| DeviceError::new(format!("wifi scan failed: {err}")))?;
        Ok(found
            .into_iter()
            .map(|ap| ap.ssid.as_bytes().to_vec())
            .collect())
    }
}

struct EspPortal {
    wifi: SharedWifi,
}

struct PortalShared {
    controller: Mutex<ProvisioningController>,
    scanner: EspScanner,
    finished: Mutex<Sender<()>>,
}

impl Provisioner for EspPortal {
    fn provision(
        &mut self,
        controller: ProvisioningController,
        activity: &mut ActivityIndicator,
    ) -> DeviceResult<ResetRequested> {
        serve_portal(&self.wifi, controller, activity)
            .map_err(|err| DeviceError::new(format!("{err:#}")))
    }
}

/// Access point, captive DNS and wizard server. Blocks until the final step
/// has been submitted.
fn serve_portal(
    wifi: &SharedWifi,
    controller: ProvisioningController,
    activity: &mut ActivityIndicator,
) -> anyhow::Result<ResetRequested> {
    let ap_ip = start_access_point(wifi, controller.access_point_name())?;
    info!(
        "access point `{}` up at {ap_ip}, wizard at http://{}",
        controller.access_point_name(),
        controller.domain()
    );

    let dns_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, DNS_PORT))
        .context("failed to bind captive dns socket")?;
    thread::Builder::new()
        .name("captive-dns".to_string())
        .stack_size(6 * 1024)
        .spawn(move || dns_loop(dns_socket, ap_ip))
        .context("failed to spawn captive dns thread")?;

    let (finished, done) = mpsc::channel::<()>();
    let shared = Arc::new(PortalShared {
        controller: Mutex::new(controller),
        scanner: EspScanner {
            wifi: Arc::clone(wifi),
        },
        finished: Mutex::new(finished),
    });
    let _server = create_portal_server(shared)?;

    let mut client_seen = false;
    loop {
        match done.recv_timeout(Duration::from_millis(250)) {
            Ok(()) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("provisioning server stopped unexpectedly"))
            }
        }

        if !client_seen && connected_stations() > 0 {
            client_seen = true;
            info!("client joined the access point");
            activity.start(0.0);
        }
    }

    // Give the last response time to reach the browser.
    thread::sleep(Duration::from_millis(500));
    Ok(ResetRequested)
}

fn start_access_point(wifi: &SharedWifi, ssid: &str) -> anyhow::Result<Ipv4Addr> {
    let mut wifi = wifi
        .lock()
        .map_err(|_| anyhow!("wifi driver lock poisoned"))?;

    if wifi.is_started()? {
        let _ = wifi.disconnect();
        wifi.stop()?;
    }

    // Mixed mode keeps the station side available for network scans.
    wifi.set_configuration(&Configuration::Mixed(
        ClientConfiguration::default(),
        AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| anyhow!("access point name too long"))?,
            auth_method: AuthMethod::None,
            channel: 1,
            ..Default::default()
        },
    ))?;
    wifi.start()?;

    let ip_info = wifi.wifi().ap_netif().get_ip_info()?;
    Ok(ip_info.ip)
}

fn connected_stations() -> usize {
    let mut list = esp_idf_svc::sys::wifi_sta_list_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_ap_get_sta_list(&mut list) };
    if rc == ESP_OK {
        usize::try_from(list.num).unwrap_or(0)
    } else {
        0
    }
}

fn dns_loop(socket: UdpSocket, answer_ip: Ipv4Addr) {
    let mut buf = [0_u8; 512];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err) => {
                warn!("captive dns receive error: {err}");
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        if let Some(reply) = catch_all_response(&buf[..len], answer_ip) {
            if let Err(err) = socket.send_to(&reply, peer) {
                debug!("captive dns send error to {peer}: {err}");
            }
        }
    }
}

fn create_portal_server(shared: Arc<PortalShared>) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for (http_method, method) in [(HttpMethod::Get, Method::Get), (HttpMethod::Post, Method::Post)] {
        let shared = Arc::clone(&shared);
        server.fn_handler::<anyhow::Error, _>("/*", http_method, move |mut req| {
            let host = req
                .header("Host")
                .map(|host| host.split(':').next().unwrap_or(host).to_string());
            let path = req.uri().split('?').next().unwrap_or("/").to_string();
            let body = read_request_body(&mut req)?;

            let response = shared
                .controller
                .lock()
                .map_err(|_| anyhow!("portal state lock poisoned"))?
                .handle(&PortalRequest {
                    method,
                    host: host.as_deref(),
                    path: &path,
                    body: &body,
                });
            respond(req, &shared, response)
        })?;
    }

    Ok(server)
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
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

fn respond(
    req: HttpRequest<'_, '_>,
    shared: &PortalShared,
    response: PortalResponse,
) -> anyhow::Result<()> {
    match response {
        PortalResponse::Html { status, body } => {
            req.into_response(status, None, &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(body.as_bytes())?;
        }
        PortalResponse::Redirect(location) => {
            req.into_response(303, Some("See Other"), &[("Location", location.as_str())])?;
        }
        PortalResponse::Networks => {
            let names = match shared.scanner.scan() {
                Ok(scanned) => network_names(scanned),
                Err(err) => {
                    warn!("network scan failed: {err}");
                    Vec::new()
                }
            };
            let body = serde_json::to_vec(&names)?;
            req.into_response(200, Some("OK"), &[("Content-Type", "application/json")])?
                .write_all(&body)?;
        }
        PortalResponse::Asset(path) => {
            let contents = std::fs::read(&path)
                .with_context(|| format!("failed to read asset {}", path.display()))?;
            req.into_response(200, Some("OK"), &[("Content-Type", content_type_for(&path))])?
                .write_all(&contents)?;
        }
        PortalResponse::NotFound => {
            req.into_status_response(404)?;
        }
        PortalResponse::MethodNotAllowed => {
            req.into_status_response(405)?;
        }
        PortalResponse::Reset => {
            req.into_ok_response()?
                .write_all(b"<p>Restarting&hellip;</p>")?;
            if let Ok(finished) = shared.finished.lock() {
                let _ = finished.send(());
            }
        }
    }
    Ok(())
}
