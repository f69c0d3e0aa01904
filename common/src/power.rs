use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};

use crate::{
    activity::ActivityIndicator,
    config::LifecycleConfig,
    device::{Button, Clock, PowerHal},
    health,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Button,
    Alarm,
    WaitLimit,
    Provisioned,
}

/// How a boot cycle ended. On hardware a reset never actually returns, so
/// callers only observe these values on a host harness or in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// No power control available; the process should exit.
    Exited,
    /// The board was reset and will boot again.
    Reset(WakeReason),
}

/// "Stay awake" versus "cut power until the next scheduled wake", plus the
/// activity LED and the standby button that both sides of the boot share.
pub struct PowerController {
    hal: Box<dyn PowerHal>,
    button: Box<dyn Button>,
    clock: Arc<dyn Clock>,
    activity: ActivityIndicator,
    poll_interval: Duration,
    wait_limit: Option<Duration>,
}

impl PowerController {
    pub fn new(
        hal: Box<dyn PowerHal>,
        button: Box<dyn Button>,
        clock: Arc<dyn Clock>,
        activity: ActivityIndicator,
    ) -> Self {
        Self {
            hal,
            button,
            clock,
            activity,
            poll_interval: Duration::from_millis(250),
            wait_limit: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Bounds the external-power wait loop. `None` waits for the alarm or
    /// the button indefinitely.
    pub fn with_wait_limit(mut self, wait_limit: Option<Duration>) -> Self {
        self.wait_limit = wait_limit;
        self
    }

    pub fn with_settings(self, settings: &LifecycleConfig) -> Self {
        self.with_poll_interval(Duration::from_millis(settings.power_poll_ms))
            .with_wait_limit(settings.power_wait_limit_ms.map(Duration::from_millis))
    }

    pub fn pulse_activity(&mut self, rate_hz: f32) {
        self.activity.start(rate_hz);
    }

    pub fn stop_activity(&mut self) {
        self.activity.stop();
    }

    pub fn activity_mut(&mut self) -> &mut ActivityIndicator {
        &mut self.activity
    }

    /// Samples the standby button at boot. See [`health::measure_button_hold`].
    pub fn measure_button_hold(&mut self, limit: Duration, poll_interval: Duration) -> Duration {
        health::measure_button_hold(
            self.button.as_mut(),
            self.clock.as_ref(),
            limit,
            poll_interval,
        )
    }

    /// Powers the board off until `wake_after` has elapsed. When external
    /// power keeps the board alive, waits for the wake alarm or a button press
    /// and resets instead.
    pub fn sleep(&mut self, wake_after: Option<Duration>) -> SleepOutcome {
        info!("> going to sleep");
        self.activity.stop();

        if self.hal.on_remote_harness() {
            info!("  - no power control under remote harness, exiting");
            return SleepOutcome::Exited;
        }

        if let Some(after) = wake_after {
            debug!("  - scheduling wake in {}s", after.as_secs());
            if let Err(err) = self.hal.schedule_wake(after) {
                warn!("  - failed to arm wake alarm: {err}");
            }
        }

        info!("  - shutting down");
        self.hal.release_power_hold();

        debug!("  - still awake on external power, waiting for alarm or button");
        let reason = self.wait_for_wake();
        self.reset(reason)
    }

    pub fn reset(&mut self, reason: WakeReason) -> SleepOutcome {
        debug!("  - reset ({reason:?})");
        self.hal.reset();
        SleepOutcome::Reset(reason)
    }

    fn wait_for_wake(&mut self) -> WakeReason {
        let start = self.clock.now_ms();
        let limit_ms = self
            .wait_limit
            .map(|limit| u64::try_from(limit.as_millis()).unwrap_or(u64::MAX));

        loop {
            self.clock.sleep(self.poll_interval);

            if self.button.is_pressed() {
                return WakeReason::Button;
            }
            if self.hal.wake_alarm_fired() {
                return WakeReason::Alarm;
            }
            if let Some(limit_ms) = limit_ms {
                if self.clock.now_ms().saturating_sub(start) >= limit_ms {
                    return WakeReason::WaitLimit;
                }
            }
        }
    }
}
