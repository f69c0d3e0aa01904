//! One boot cycle: startup, provisioning check, clock sync, health check,
//! measure, store or upload, sleep. Every failure ends in [`LifecycleController::halt`],
//! which logs and goes back to sleep so the next scheduled wake retries.

use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::Datelike;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    config::{Config, ConfigError, ConfigStore, Destination, LifecycleConfig},
    device::{
        Board, DeviceError, DiskStats, Provisioner, Rtc, SensorSource, TimeSource, Uploader,
        WifiStation,
    },
    health::{is_clock_set, is_disk_low, needs_provisioning},
    power::{PowerController, SleepOutcome, WakeReason},
    provisioning::ProvisioningController,
    reading::{Reading, ReadingStore, ReadingStoreError},
    upload::{UploadCache, UploadCacheError},
};

#[derive(Debug, Error)]
pub enum ClockSyncError {
    #[error("failed to connect to wifi network {ssid}: {source}")]
    WifiConnectFailed {
        ssid: String,
        #[source]
        source: DeviceError,
    },
    #[error("failed to fetch network time: {0}")]
    NtpFetchFailed(#[source] DeviceError),
    #[error("failed to set rtc: {0}")]
    RtcWriteFailed(#[source] DeviceError),
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("startup hook failed: {0}")]
    StartupFailed(#[source] DeviceError),
    #[error("could not open config for provisioning: {0}")]
    ProvisioningUnavailable(#[source] ConfigError),
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(#[source] DeviceError),
    #[error("config missing or corrupt: {0}")]
    ConfigMissingOrCorrupt(#[from] ConfigError),
    #[error("clock sync failed: {0}")]
    ClockSyncFailed(#[from] ClockSyncError),
    #[error("disk space low, cached readings are not being uploaded")]
    DiskSpaceLow,
    #[error("failed to take reading: {0}")]
    ReadingFailed(#[source] DeviceError),
    #[error("failed to store reading: {0}")]
    StoreFailed(#[from] ReadingStoreError),
    #[error("upload cache error: {0}")]
    CacheFailed(#[source] UploadCacheError),
    #[error("upload failed after {uploaded} readings, {remaining} still cached: {source}")]
    UploadFailed {
        uploaded: usize,
        remaining: usize,
        #[source]
        source: DeviceError,
    },
}

/// Hardware and network collaborators for one boot.
pub struct Device {
    pub board: Box<dyn Board>,
    pub rtc: Box<dyn Rtc>,
    pub wifi: Box<dyn WifiStation>,
    pub time_source: Box<dyn TimeSource>,
    pub sensors: Box<dyn SensorSource>,
    pub uploader: Box<dyn Uploader>,
    pub disk: Box<dyn DiskStats>,
    pub provisioner: Box<dyn Provisioner>,
    pub power: PowerController,
}

/// Everything the device keeps on its filesystem.
#[derive(Debug, Clone)]
pub struct Storage {
    pub config: ConfigStore,
    pub readings: ReadingStore,
    pub cache: UploadCache,
    pub asset_root: PathBuf,
}

impl Storage {
    pub fn in_dir(root: &Path) -> Self {
        Self {
            config: ConfigStore::new(root.join("config.txt")),
            readings: ReadingStore::new(root.join("readings")),
            cache: UploadCache::new(root.join("uploads")),
            asset_root: root.join("html"),
        }
    }
}

pub struct LifecycleController {
    device: Device,
    storage: Storage,
    settings: LifecycleConfig,
    wake_after: Duration,
}

impl LifecycleController {
    pub fn new(device: Device, storage: Storage, settings: LifecycleConfig) -> Self {
        Self {
            device,
            storage,
            settings,
            wake_after: reading_interval(&Config::default()),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Runs a single boot cycle. On hardware this never returns because every
    /// path ends in a power-off or reset.
    pub fn run(&mut self) -> SleepOutcome {
        info!("> performing startup");
        if let Err(err) = self.device.board.startup() {
            return self.halt(CycleError::StartupFailed(err));
        }
        self.device.power.pulse_activity(self.settings.boot_activity_hz);

        let hold_threshold = Duration::from_millis(self.settings.button_hold_ms);
        let held = self.device.power.measure_button_hold(
            hold_threshold,
            Duration::from_millis(self.settings.button_poll_ms),
        );

        let loaded = self.storage.config.load();
        if let Err(err) = &loaded {
            warn!("> config unusable: {err}");
        }
        if needs_provisioning(&loaded, held, hold_threshold) {
            if held >= hold_threshold {
                info!("> button held for {}ms", held.as_millis());
            }
            return self.provision();
        }

        let config = match self.storage.config.load() {
            Ok(config) => config,
            Err(err) => return self.halt(err.into()),
        };
        self.wake_after = reading_interval(&config);

        match self.duty_cycle(&config) {
            Ok(()) => self.device.power.sleep(Some(self.wake_after)),
            Err(err) => self.halt(err),
        }
    }

    /// Logs the failure and sleeps until the next scheduled wake.
    pub fn halt(&mut self, err: CycleError) -> SleepOutcome {
        error!("! {err}");
        self.device.power.stop_activity();
        self.device.power.sleep(Some(self.wake_after))
    }

    fn provision(&mut self) -> SleepOutcome {
        info!("> entering provisioning mode");
        let controller = match ProvisioningController::start(
            self.storage.config.clone(),
            self.device.board.model(),
            self.settings.portal_domain.clone(),
            self.storage.asset_root.clone(),
        ) {
            Ok(controller) => controller,
            Err(err) => return self.halt(CycleError::ProvisioningUnavailable(err)),
        };

        info!("  - access point: {}", controller.access_point_name());
        self.device.power.pulse_activity(self.settings.portal_activity_hz);

        match self
            .device
            .provisioner
            .provision(controller, self.device.power.activity_mut())
        {
            Ok(_) => self.device.power.reset(WakeReason::Provisioned),
            Err(err) => self.halt(CycleError::ProvisioningFailed(err)),
        }
    }

    fn duty_cycle(&mut self, config: &Config) -> Result<(), CycleError> {
        self.sync_clock(config)?;

        if is_disk_low(self.device.disk.usage(), self.settings.min_free_fraction) {
            return Err(CycleError::DiskSpaceLow);
        }

        info!("> taking reading");
        let values = self
            .device
            .sensors
            .read()
            .map_err(CycleError::ReadingFailed)?;
        let reading = Reading::new(self.device.rtc.now(), values);
        debug!("  - {} values at {}", reading.values.len(), reading.timestamp);

        match &config.destination {
            Some(destination) => {
                self.storage
                    .cache
                    .append(&reading)
                    .map_err(CycleError::CacheFailed)?;
                let ready = self
                    .storage
                    .cache
                    .batch_ready(config.upload_batch_size)
                    .map_err(CycleError::CacheFailed)?;
                if ready {
                    self.upload(config, destination)?;
                }
            }
            None => {
                let path = self.storage.readings.append(&reading)?;
                info!("  - saved reading to {}", path.display());
            }
        }

        Ok(())
    }

    fn sync_clock(&mut self, config: &Config) -> Result<(), ClockSyncError> {
        let year = self.device.rtc.now().year();
        if is_clock_set(year, self.settings.clock_epoch_year) {
            debug!("> rtc is set ({year})");
            return Ok(());
        }

        info!("> rtc not set, synchronising with network time");
        self.connect_wifi(config)
            .map_err(|source| ClockSyncError::WifiConnectFailed {
                ssid: config.wifi_ssid.clone(),
                source,
            })?;
        let now = self
            .device
            .time_source
            .fetch()
            .map_err(ClockSyncError::NtpFetchFailed)?;
        self.device
            .rtc
            .set(now)
            .map_err(ClockSyncError::RtcWriteFailed)?;
        info!("  - rtc set to {now}");
        Ok(())
    }

    fn upload(&mut self, config: &Config, destination: &Destination) -> Result<(), CycleError> {
        let pending = self
            .storage
            .cache
            .pending_count()
            .map_err(CycleError::CacheFailed)?;
        info!("> {pending} cached readings, uploading");

        if let Err(source) = self.connect_wifi(config) {
            return Err(CycleError::UploadFailed {
                uploaded: 0,
                remaining: pending,
                source,
            });
        }

        match self
            .storage
            .cache
            .upload_all(self.device.uploader.as_mut(), destination)
        {
            Ok(uploaded) => {
                info!("  - uploaded {uploaded} readings");
                Ok(())
            }
            Err(UploadCacheError::UploadFailed {
                uploaded,
                remaining,
                source,
            }) => Err(CycleError::UploadFailed {
                uploaded,
                remaining,
                source,
            }),
            Err(err) => Err(CycleError::CacheFailed(err)),
        }
    }

    fn connect_wifi(&mut self, config: &Config) -> Result<Option<Ipv4Addr>, DeviceError> {
        if self.device.wifi.is_connected() {
            debug!("  - wifi already connected");
            return Ok(None);
        }

        info!("  - connecting to wifi network '{}'", config.wifi_ssid);
        let timeout = Duration::from_millis(self.settings.wifi_connect_timeout_ms);
        let ip = self
            .device
            .wifi
            .connect(&config.wifi_ssid, &config.wifi_password, timeout)?;
        info!("  - ip address: {ip}");
        Ok(Some(ip))
    }
}

fn reading_interval(config: &Config) -> Duration {
    Duration::from_secs(u64::from(config.reading_frequency_min.max(1)) * 60)
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        activity::ActivityIndicator,
        provisioning::{
            Method, PortalResponse, DEFAULT_PORTAL_DOMAIN, ROUTE_DONE, ROUTE_NICKNAME,
            ROUTE_WELCOME, ROUTE_WIFI,
        },
        testing::{
            at, scratch_dir, FakeBoard, FakeClock, FakeDisk, FakePowerHal, FakeProvisioner,
            FakeRtc, FakeSensors, FakeTimeSource, FakeUploader, FakeWifi, RecordingLed,
            ScriptedButton,
        },
    };

    struct Probes {
        hal: FakePowerHal,
        wifi: FakeWifi,
        provisioner: FakeProvisioner,
    }

    fn power(hal: FakePowerHal, button: ScriptedButton) -> PowerController {
        PowerController::new(
            Box::new(hal),
            Box::new(button),
            Arc::new(FakeClock::default()),
            ActivityIndicator::new(Box::new(RecordingLed::default())),
        )
    }

    /// A healthy, already-timed device whose wake alarm fires immediately.
    fn rig() -> (Device, Probes) {
        let rtc = FakeRtc::set_to(at(2024, 5, 1, 8, 0));
        let hal = FakePowerHal::alarm_after(0);
        let wifi = FakeWifi::reachable();
        let provisioner = FakeProvisioner::unexpected();

        let device = Device {
            board: Box::new(FakeBoard::urban()),
            rtc: Box::new(rtc.clone()),
            wifi: Box::new(wifi.clone()),
            time_source: Box::new(FakeTimeSource::returning(at(2024, 5, 1, 8, 0))),
            sensors: Box::new(FakeSensors::fixed(&[("temperature", 21.5), ("humidity", 48.0)])),
            uploader: Box::new(FakeUploader::default()),
            disk: Box::new(FakeDisk::with_free(500, 1000)),
            provisioner: Box::new(provisioner.clone()),
            power: power(hal.clone(), ScriptedButton::never_pressed()),
        };
        let probes = Probes {
            hal,
            wifi,
            provisioner,
        };
        (device, probes)
    }

    fn provisioned(destination: Option<&str>, batch: u32) -> Config {
        Config {
            nickname: "Kitchen".to_string(),
            wifi_ssid: "home".to_string(),
            wifi_password: "hunter22".to_string(),
            destination: destination.and_then(Destination::parse),
            provisioned: true,
            upload_batch_size: batch,
            ..Config::default()
        }
    }

    fn run(device: Device, storage: &Storage) -> SleepOutcome {
        LifecycleController::new(device, storage.clone(), LifecycleConfig::default()).run()
    }

    #[test]
    fn fresh_device_is_provisioned_then_boots_normally() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-fresh"));

        let (mut device, probes) = rig();
        let wizard = FakeProvisioner::replaying(
            DEFAULT_PORTAL_DOMAIN,
            vec![
                (Method::Get, ROUTE_WELCOME, ""),
                (Method::Post, ROUTE_NICKNAME, "nickname=Kitchen"),
                (Method::Post, ROUTE_WIFI, "wifi_ssid=home&wifi_password=hunter22"),
                (Method::Post, ROUTE_DONE, ""),
            ],
        );
        device.provisioner = Box::new(wizard.clone());

        assert_eq!(
            run(device, &storage),
            SleepOutcome::Reset(WakeReason::Provisioned)
        );
        assert_eq!(wizard.times_entered(), 1);
        assert_eq!(wizard.responses().last(), Some(&PortalResponse::Reset));
        assert_eq!(probes.hal.state().resets, 1);
        let saved = storage.config.load().unwrap();
        assert!(saved.provisioned);
        assert_eq!(saved.nickname, "Kitchen");

        let (device, probes) = rig();
        assert_eq!(run(device, &storage), SleepOutcome::Reset(WakeReason::Alarm));
        assert_eq!(probes.provisioner.times_entered(), 0);
        assert_eq!(storage.readings.read_all().unwrap().len(), 1);
    }

    #[test]
    fn unset_clock_is_synced_and_reading_stored_locally() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-ntp"));
        storage.config.persist(&provisioned(None, 5)).unwrap();

        let (mut device, probes) = rig();
        let rtc = FakeRtc::unset();
        device.rtc = Box::new(rtc.clone());
        device.time_source = Box::new(FakeTimeSource::returning(at(2024, 6, 2, 9, 30)));

        let outcome = run(device, &storage);

        assert_eq!(outcome, SleepOutcome::Reset(WakeReason::Alarm));
        assert_eq!(rtc.current(), at(2024, 6, 2, 9, 30));
        assert_eq!(probes.wifi.attempts(), 1);
        let readings = storage.readings.read_all().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].timestamp, at(2024, 6, 2, 9, 30));
        assert_eq!(storage.cache.pending_count().unwrap(), 0);

        let power = probes.hal.state();
        assert!(power.hold_released);
        assert_eq!(power.scheduled_wake, Some(Duration::from_secs(15 * 60)));
    }

    #[test]
    fn failed_upload_keeps_batch_for_next_cycle() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-upload"));
        storage
            .config
            .persist(&provisioned(Some("https://example.com/ingest"), 4))
            .unwrap();
        for minute in 0..3 {
            let prior = Reading::new(at(2024, 5, 1, 7, minute), [("temperature".to_string(), 20.0)]);
            storage.cache.append(&prior).unwrap();
        }

        let (mut device, probes) = rig();
        device.uploader = Box::new(FakeUploader::failing());

        assert_eq!(run(device, &storage), SleepOutcome::Reset(WakeReason::Alarm));
        assert_eq!(storage.cache.pending_count().unwrap(), 4);
        assert_eq!(probes.hal.state().resets, 1);
        assert!(storage.readings.read_all().unwrap().is_empty());

        // The next wake reads the same rtc time; both readings stay queued.
        let (device, _) = rig();
        assert_eq!(run(device, &storage), SleepOutcome::Reset(WakeReason::Alarm));
        assert_eq!(storage.cache.pending_count().unwrap(), 0);
    }

    #[test]
    fn below_batch_threshold_only_caches() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-cache"));
        storage
            .config
            .persist(&provisioned(Some("https://example.com/ingest"), 4))
            .unwrap();

        let (device, probes) = rig();

        run(device, &storage);

        assert_eq!(storage.cache.pending_count().unwrap(), 1);
        assert_eq!(probes.wifi.attempts(), 0);
    }

    #[test]
    fn held_button_forces_provisioning_of_configured_device() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-button"));
        storage.config.persist(&provisioned(None, 5)).unwrap();

        let (mut device, probes) = rig();
        device.power = power(probes.hal.clone(), ScriptedButton::pressed_for(300));

        let outcome = run(device, &storage);

        // The scripted wizard is empty, so provisioning fails and halts.
        assert_eq!(outcome, SleepOutcome::Reset(WakeReason::Alarm));
        assert_eq!(probes.provisioner.times_entered(), 1);
        assert!(storage.readings.read_all().unwrap().is_empty());
        assert!(storage.config.load().unwrap().provisioned);
    }

    #[test]
    fn short_press_does_not_force_provisioning() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-short-press"));
        storage.config.persist(&provisioned(None, 5)).unwrap();

        let (mut device, probes) = rig();
        device.power = power(probes.hal.clone(), ScriptedButton::pressed_for(100));

        run(device, &storage);

        assert_eq!(probes.provisioner.times_entered(), 0);
        assert_eq!(storage.readings.read_all().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_config_enters_provisioning_with_template() {
        let dir = scratch_dir("lifecycle-corrupt");
        let storage = Storage::in_dir(&dir);
        fs::write(storage.config.path(), "provisioned = maybe\n").unwrap();

        let (device, probes) = rig();
        run(device, &storage);

        assert_eq!(probes.provisioner.times_entered(), 1);
        assert!(dir.join("config.txt.corrupt").exists());
        assert_eq!(storage.config.load().unwrap(), Config::default());
    }

    #[test]
    fn unreachable_wifi_halts_before_reading() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-no-wifi"));
        storage.config.persist(&provisioned(None, 5)).unwrap();

        let (mut device, probes) = rig();
        let rtc = FakeRtc::unset();
        device.rtc = Box::new(rtc.clone());
        device.wifi = Box::new(FakeWifi::unreachable());

        assert_eq!(run(device, &storage), SleepOutcome::Reset(WakeReason::Alarm));
        assert_eq!(rtc.current().year(), 2000);
        assert!(storage.readings.read_all().unwrap().is_empty());
        assert!(probes.hal.state().hold_released);
    }

    #[test]
    fn ntp_failure_leaves_clock_unset() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-no-ntp"));
        storage.config.persist(&provisioned(None, 5)).unwrap();

        let (mut device, _) = rig();
        let rtc = FakeRtc::unset();
        device.rtc = Box::new(rtc.clone());
        device.time_source = Box::new(FakeTimeSource::failing());

        run(device, &storage);

        assert_eq!(rtc.current().year(), 2000);
        assert!(storage.readings.read_all().unwrap().is_empty());
    }

    #[test]
    fn rtc_write_failure_halts_before_reading() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-rtc-write"));
        storage.config.persist(&provisioned(None, 5)).unwrap();

        let (mut device, probes) = rig();
        let rtc = FakeRtc::unset().read_only();
        device.rtc = Box::new(rtc.clone());

        assert_eq!(run(device, &storage), SleepOutcome::Reset(WakeReason::Alarm));
        assert_eq!(probes.wifi.attempts(), 1);
        assert_eq!(rtc.current().year(), 2000);
        assert!(storage.readings.read_all().unwrap().is_empty());
    }

    #[test]
    fn connected_wifi_is_reused_for_clock_sync() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-connected"));
        storage.config.persist(&provisioned(None, 5)).unwrap();

        let (mut device, _) = rig();
        let wifi = FakeWifi::already_connected();
        device.wifi = Box::new(wifi.clone());
        device.rtc = Box::new(FakeRtc::unset());

        run(device, &storage);

        assert_eq!(wifi.attempts(), 0);
        assert_eq!(storage.readings.read_all().unwrap().len(), 1);
    }

    #[test]
    fn low_disk_halts_without_reading() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-disk"));
        storage.config.persist(&provisioned(None, 5)).unwrap();

        let (mut device, _) = rig();
        device.disk = Box::new(FakeDisk::with_free(99, 1000));

        run(device, &storage);

        assert!(storage.readings.read_all().unwrap().is_empty());
    }

    #[test]
    fn remote_harness_exits_after_cycle() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-remote"));
        storage.config.persist(&provisioned(None, 5)).unwrap();

        let (mut device, _) = rig();
        let hal = FakePowerHal::remote();
        device.power = power(hal.clone(), ScriptedButton::never_pressed());
        device.disk = Box::new(FakeDisk::remote());

        assert_eq!(run(device, &storage), SleepOutcome::Exited);
        assert_eq!(hal.state().resets, 0);
        assert_eq!(storage.readings.read_all().unwrap().len(), 1);
    }

    #[test]
    fn startup_and_sensor_failures_halt() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-startup"));
        storage.config.persist(&provisioned(None, 5)).unwrap();

        let (mut device, probes) = rig();
        device.board = Box::new(FakeBoard::broken());
        assert_eq!(run(device, &storage), SleepOutcome::Reset(WakeReason::Alarm));
        assert_eq!(probes.provisioner.times_entered(), 0);

        let (mut device, _) = rig();
        device.sensors = Box::new(FakeSensors::failing());
        run(device, &storage);

        assert!(storage.readings.read_all().unwrap().is_empty());
    }

    #[test]
    fn reading_frequency_sets_wake_interval() {
        let storage = Storage::in_dir(&scratch_dir("lifecycle-frequency"));
        let config = Config {
            reading_frequency_min: 5,
            ..provisioned(None, 5)
        };
        storage.config.persist(&config).unwrap();

        let (device, probes) = rig();
        run(device, &storage);

        assert_eq!(
            probes.hal.state().scheduled_wake,
            Some(Duration::from_secs(5 * 60))
        );
    }
}
