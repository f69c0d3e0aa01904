//! In-memory collaborators for unit and scenario tests. Handles are cheap to
//! clone and share state, so a test can keep one and hand the other to the
//! code under test.

use std::{
    net::Ipv4Addr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{NaiveDate, NaiveDateTime};

use crate::{
    activity::ActivityIndicator,
    config::Destination,
    device::{
        Board, Button, Clock, DeviceError, DeviceResult, DiskStats, PowerHal, Provisioner,
        ResetRequested, Rtc, SensorSource, StatusLed, TimeSource, Uploader, WifiStation,
    },
    provisioning::{Method, PortalRequest, PortalResponse, ProvisioningController},
    reading::Reading,
    storage::DiskUsage,
};

/// Fresh, empty directory unique to this test run.
pub fn scratch_dir(name: &str) -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let unique = NEXT.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "enviro-test-{name}-{}-{unique}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

/// Time only moves when something sleeps.
#[derive(Debug, Clone, Default)]
pub struct FakeClock {
    now_ms: Arc<AtomicU64>,
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap();
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
enum Press {
    Never,
    For(usize),
    After(usize),
}

/// Button whose state is a function of how many times it has been sampled.
#[derive(Debug)]
pub struct ScriptedButton {
    press: Press,
    samples: usize,
}

impl ScriptedButton {
    pub fn never_pressed() -> Self {
        Self {
            press: Press::Never,
            samples: 0,
        }
    }

    /// Pressed for the first `samples` reads, released afterwards.
    pub fn pressed_for(samples: usize) -> Self {
        Self {
            press: Press::For(samples),
            samples: 0,
        }
    }

    /// Released for the first `samples` reads, pressed afterwards.
    pub fn pressed_after(samples: usize) -> Self {
        Self {
            press: Press::After(samples),
            samples: 0,
        }
    }
}

impl Button for ScriptedButton {
    fn is_pressed(&mut self) -> bool {
        let sample = self.samples;
        self.samples += 1;
        match self.press {
            Press::Never => false,
            Press::For(n) => sample < n,
            Press::After(n) => sample >= n,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingLed {
    history: Arc<Mutex<Vec<bool>>>,
}

impl RecordingLed {
    pub fn history(&self) -> Vec<bool> {
        self.history.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<bool> {
        self.history.lock().unwrap().last().copied()
    }
}

impl StatusLed for RecordingLed {
    fn set(&mut self, lit: bool) {
        self.history.lock().unwrap().push(lit);
    }
}

#[derive(Debug, Clone)]
pub struct FakeRtc {
    now: Arc<Mutex<NaiveDateTime>>,
    fail_writes: bool,
}

impl FakeRtc {
    /// Power-on default of a clock that was never set.
    pub fn unset() -> Self {
        Self::set_to(at(2000, 1, 1, 0, 0))
    }

    pub fn set_to(now: NaiveDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            fail_writes: false,
        }
    }

    pub fn read_only(self) -> Self {
        Self {
            fail_writes: true,
            ..self
        }
    }

    pub fn current(&self) -> NaiveDateTime {
        *self.now.lock().unwrap()
    }
}

impl Rtc for FakeRtc {
    fn now(&self) -> NaiveDateTime {
        self.current()
    }

    fn set(&mut self, utc: NaiveDateTime) -> DeviceResult<()> {
        if self.fail_writes {
            return Err(DeviceError::new("rtc write rejected"));
        }
        *self.now.lock().unwrap() = utc;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FakeWifi {
    connected: bool,
    reachable: bool,
    attempts: Arc<AtomicUsize>,
}

impl FakeWifi {
    pub fn reachable() -> Self {
        Self {
            connected: false,
            reachable: true,
            attempts: Arc::default(),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::reachable()
        }
    }

    pub fn already_connected() -> Self {
        Self {
            connected: true,
            ..Self::reachable()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl WifiStation for FakeWifi {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connect(
        &mut self,
        ssid: &str,
        _password: &str,
        timeout: Duration,
    ) -> DeviceResult<Ipv4Addr> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.reachable {
            return Err(DeviceError::new(format!(
                "no response from {ssid} within {}s",
                timeout.as_secs()
            )));
        }
        self.connected = true;
        Ok(Ipv4Addr::new(192, 168, 1, 50))
    }
}

#[derive(Debug)]
pub struct FakeTimeSource {
    time: Option<NaiveDateTime>,
}

impl FakeTimeSource {
    pub fn returning(time: NaiveDateTime) -> Self {
        Self { time: Some(time) }
    }

    pub fn failing() -> Self {
        Self { time: None }
    }
}

impl TimeSource for FakeTimeSource {
    fn fetch(&mut self) -> DeviceResult<NaiveDateTime> {
        self.time.ok_or_else(|| DeviceError::new("ntp request timed out"))
    }
}

#[derive(Debug)]
pub struct FakeSensors {
    values: Option<Vec<(String, f64)>>,
}

impl FakeSensors {
    pub fn fixed(values: &[(&str, f64)]) -> Self {
        Self {
            values: Some(
                values
                    .iter()
                    .map(|(name, value)| (name.to_string(), *value))
                    .collect(),
            ),
        }
    }

    pub fn failing() -> Self {
        Self { values: None }
    }
}

impl SensorSource for FakeSensors {
    fn read(&mut self) -> DeviceResult<Vec<(String, f64)>> {
        self.values
            .clone()
            .ok_or_else(|| DeviceError::new("sensor bus not responding"))
    }
}

/// Records what it delivers. Fails every upload once `succeed` successes
/// have been used up.
#[derive(Debug, Default)]
pub struct FakeUploader {
    succeed: Option<usize>,
    delivered: Vec<Reading>,
}

impl FakeUploader {
    pub fn failing() -> Self {
        Self::failing_after(0)
    }

    pub fn failing_after(successes: usize) -> Self {
        Self {
            succeed: Some(successes),
            delivered: Vec::new(),
        }
    }

    pub fn delivered(&self) -> &[Reading] {
        &self.delivered
    }
}

impl Uploader for FakeUploader {
    fn upload(&mut self, _destination: &Destination, reading: &Reading) -> DeviceResult<()> {
        if let Some(remaining) = self.succeed.as_mut() {
            if *remaining == 0 {
                return Err(DeviceError::new("destination unreachable"));
            }
            *remaining -= 1;
        }
        self.delivered.push(reading.clone());
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeDisk(pub Option<DiskUsage>);

impl FakeDisk {
    pub fn remote() -> Self {
        Self(None)
    }

    pub fn with_free(free_blocks: u64, total_blocks: u64) -> Self {
        Self(Some(DiskUsage {
            free_blocks,
            total_blocks,
        }))
    }
}

impl DiskStats for FakeDisk {
    fn usage(&self) -> Option<DiskUsage> {
        self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PowerState {
    pub hold_released: bool,
    pub scheduled_wake: Option<Duration>,
    pub resets: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakePowerHal {
    remote: bool,
    alarm_after: Option<usize>,
    alarm_checks: Arc<AtomicUsize>,
    state: Arc<Mutex<PowerState>>,
}

impl FakePowerHal {
    pub fn remote() -> Self {
        Self {
            remote: true,
            ..Self::default()
        }
    }

    /// The wake alarm reports fired after `checks` negative polls.
    pub fn alarm_after(checks: usize) -> Self {
        Self {
            alarm_after: Some(checks),
            ..Self::default()
        }
    }

    pub fn state(&self) -> PowerState {
        self.state.lock().unwrap().clone()
    }
}

impl PowerHal for FakePowerHal {
    fn on_remote_harness(&self) -> bool {
        self.remote
    }

    fn schedule_wake(&mut self, after: Duration) -> DeviceResult<()> {
        self.state.lock().unwrap().scheduled_wake = Some(after);
        Ok(())
    }

    fn release_power_hold(&mut self) {
        self.state.lock().unwrap().hold_released = true;
    }

    fn wake_alarm_fired(&mut self) -> bool {
        let checks = self.alarm_checks.fetch_add(1, Ordering::SeqCst);
        self.alarm_after.is_some_and(|after| checks >= after)
    }

    fn reset(&mut self) {
        self.state.lock().unwrap().resets += 1;
    }
}

#[derive(Debug)]
pub struct FakeBoard {
    model: String,
    startup_fails: bool,
}

impl FakeBoard {
    pub fn urban() -> Self {
        Self {
            model: "urban".to_string(),
            startup_fails: false,
        }
    }

    pub fn broken() -> Self {
        Self {
            startup_fails: true,
            ..Self::urban()
        }
    }
}

impl Board for FakeBoard {
    fn model(&self) -> &str {
        &self.model
    }

    fn startup(&mut self) -> DeviceResult<()> {
        if self.startup_fails {
            return Err(DeviceError::new("sensor power rail did not come up"));
        }
        Ok(())
    }
}

/// Plays a fixed sequence of browser requests against the wizard.
#[derive(Debug, Clone, Default)]
pub struct FakeProvisioner {
    script: Vec<(Method, &'static str, &'static str)>,
    host: Option<&'static str>,
    entered: Arc<AtomicUsize>,
    responses: Arc<Mutex<Vec<PortalResponse>>>,
}

impl FakeProvisioner {
    pub fn replaying(
        host: &'static str,
        script: Vec<(Method, &'static str, &'static str)>,
    ) -> Self {
        Self {
            script,
            host: Some(host),
            ..Self::default()
        }
    }

    /// Never completes the wizard; tests assert it was not entered.
    pub fn unexpected() -> Self {
        Self::default()
    }

    pub fn times_entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn responses(&self) -> Vec<PortalResponse> {
        self.responses.lock().unwrap().clone()
    }
}

impl Provisioner for FakeProvisioner {
    fn provision(
        &mut self,
        mut controller: ProvisioningController,
        _activity: &mut ActivityIndicator,
    ) -> DeviceResult<ResetRequested> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        for &(method, path, body) in &self.script {
            let response = controller.handle(&PortalRequest {
                method,
                host: self.host,
                path,
                body: body.as_bytes(),
            });
            let finished = response == PortalResponse::Reset;
            self.responses.lock().unwrap().push(response);
            if finished {
                return Ok(ResetRequested);
            }
        }
        Err(DeviceError::new("wizard was not completed"))
    }
}
