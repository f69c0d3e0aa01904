//! Narrow contracts for the hardware and network collaborators the boot
//! lifecycle depends on. Each target (host harness, ESP32) supplies its own
//! implementations; tests use the fakes in `testing`.

use std::{
    net::Ipv4Addr,
    sync::OnceLock,
    time::{Duration, Instant},
};

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::{
    activity::ActivityIndicator, config::Destination, provisioning::ProvisioningController,
    reading::Reading, storage::DiskUsage,
};

/// Failure reported by a collaborator. The core only needs the message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DeviceError {
    message: String,
}

impl DeviceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Monotonic milliseconds plus a blocking sleep, so polling loops can be
/// driven by a fake clock in tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        START
            .get_or_init(Instant::now)
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// The standby button. `true` while held down.
pub trait Button: Send {
    fn is_pressed(&mut self) -> bool;
}

pub trait StatusLed: Send {
    fn set(&mut self, lit: bool);
}

/// Real-time clock. An unset clock reports an implausible (early) year.
pub trait Rtc: Send {
    fn now(&self) -> NaiveDateTime;
    fn set(&mut self, utc: NaiveDateTime) -> DeviceResult<()>;
}

pub trait WifiStation: Send {
    fn is_connected(&self) -> bool;

    /// Joins `ssid`, giving up after `timeout`. Returns the leased address.
    fn connect(&mut self, ssid: &str, password: &str, timeout: Duration)
        -> DeviceResult<Ipv4Addr>;
}

/// Network time source (NTP on hardware).
pub trait TimeSource: Send {
    fn fetch(&mut self) -> DeviceResult<NaiveDateTime>;
}

pub trait SensorSource: Send {
    fn read(&mut self) -> DeviceResult<Vec<(String, f64)>>;
}

/// Delivers one reading to the configured destination. `Ok` means the
/// destination confirmed receipt.
pub trait Uploader: Send {
    fn upload(&mut self, destination: &Destination, reading: &Reading) -> DeviceResult<()>;
}

/// Filesystem space query. `None` means the storage is a remote or
/// development mount that cannot answer.
pub trait DiskStats: Send {
    fn usage(&self) -> Option<DiskUsage>;
}

pub trait PowerHal: Send {
    /// True when running under a development harness without power control.
    fn on_remote_harness(&self) -> bool;

    /// Arms the hardware wake alarm.
    fn schedule_wake(&mut self, after: Duration) -> DeviceResult<()>;

    /// Drops the power-hold line. Has no effect while on external power.
    fn release_power_hold(&mut self);

    fn wake_alarm_fired(&mut self) -> bool;

    /// Resets the board. Does not return on hardware.
    fn reset(&mut self);
}

pub trait Board: Send {
    /// Lower-case hardware variant name, e.g. `"urban"`.
    fn model(&self) -> &str;

    fn startup(&mut self) -> DeviceResult<()> {
        Ok(())
    }
}

/// Wireless scan results: raw network names as broadcast.
pub trait NetworkScanner: Send + Sync {
    fn scan(&self) -> DeviceResult<Vec<Vec<u8>>>;
}

/// Marker returned by a [`Provisioner`] once the wizard has been completed
/// and the board must be reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetRequested;

/// Brings up the access point, captive DNS and web server, then serves the
/// wizard until the final step is submitted. Returning `Ok` is the only way
/// out of provisioning and always leads to a reset; `Err` means the access
/// point or server could not be started.
pub trait Provisioner: Send {
    fn provision(
        &mut self,
        controller: ProvisioningController,
        activity: &mut ActivityIndicator,
    ) -> DeviceResult<ResetRequested>;
}
