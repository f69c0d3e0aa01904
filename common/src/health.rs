//! Boot-time health decisions. Everything here is a pure function of its
//! inputs except [`measure_button_hold`], which polls the button.

use std::time::Duration;

use crate::{
    config::{Config, ConfigError},
    device::{Button, Clock},
    storage::DiskUsage,
};

pub const PROVISIONING_HOLD: Duration = Duration::from_secs(3);
pub const CLOCK_EPOCH_YEAR: i32 = 2020;
pub const MIN_FREE_FRACTION: f64 = 0.10;

/// Any one of: config missing or corrupt, config not yet provisioned, or the
/// standby button held for at least `hold_threshold` during boot.
pub fn needs_provisioning(
    config: &Result<Config, ConfigError>,
    button_held: Duration,
    hold_threshold: Duration,
) -> bool {
    let config_unusable = match config {
        Ok(config) => !config.provisioned,
        Err(_) => true,
    };
    config_unusable || button_held >= hold_threshold
}

/// An unset RTC reports a year at or before the epoch sentinel.
pub fn is_clock_set(current_year: i32, epoch_year: i32) -> bool {
    current_year > epoch_year
}

/// `None` usage means a remote mount, which never counts as low.
pub fn is_disk_low(usage: Option<DiskUsage>, min_free_fraction: f64) -> bool {
    usage
        .and_then(|usage| usage.free_fraction())
        .is_some_and(|free| free < min_free_fraction)
}

/// Samples the button until it is released or `limit` is reached and returns
/// how long it was held. Returns zero if it was not pressed at all.
pub fn measure_button_hold(
    button: &mut dyn Button,
    clock: &dyn Clock,
    limit: Duration,
    poll_interval: Duration,
) -> Duration {
    let limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
    let start = clock.now_ms();

    loop {
        let held_ms = clock.now_ms().saturating_sub(start);
        if held_ms >= limit_ms {
            return limit;
        }
        if !button.is_pressed() {
            return Duration::from_millis(held_ms);
        }
        clock.sleep(poll_interval);
    }
}
