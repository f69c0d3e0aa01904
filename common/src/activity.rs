use std::{
    sync::{
        mpsc::{self, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::warn;

use crate::device::StatusLed;

struct Pulse {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the status LED and at most one running blink animation.
pub struct ActivityIndicator {
    led: Arc<Mutex<Box<dyn StatusLed>>>,
    pulse: Option<Pulse>,
}

impl ActivityIndicator {
    pub fn new(led: Box<dyn StatusLed>) -> Self {
        Self {
            led: Arc::new(Mutex::new(led)),
            pulse: None,
        }
    }

    /// Toggles the LED every `1 / rate_hz` seconds, replacing any running
    /// pulse. A non-positive rate leaves the LED steadily lit.
    pub fn start(&mut self, rate_hz: f32) {
        self.cancel_pulse();

        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            set_led(&self.led, true);
            return;
        }

        let period = Duration::from_secs_f32(1.0 / rate_hz);
        let led = Arc::clone(&self.led);
        let (cancel, cancelled) = mpsc::channel::<()>();

        let spawned = thread::Builder::new()
            .name("activity-led".to_string())
            .spawn(move || {
                let mut lit = true;
                loop {
                    set_led(&led, lit);
                    lit = !lit;
                    match cancelled.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });

        match spawned {
            Ok(handle) => self.pulse = Some(Pulse { cancel, handle }),
            Err(err) => {
                warn!("failed to start activity pulse: {err}");
                set_led(&self.led, true);
            }
        }
    }

    /// Cancels any pulse and turns the LED off.
    pub fn stop(&mut self) {
        self.cancel_pulse();
        set_led(&self.led, false);
    }

    pub fn is_pulsing(&self) -> bool {
        self.pulse.is_some()
    }

    fn cancel_pulse(&mut self) {
        if let Some(pulse) = self.pulse.take() {
            let _ = pulse.cancel.send(());
            if pulse.handle.join().is_err() {
                warn!("activity pulse thread panicked");
            }
        }
    }
}

impl Drop for ActivityIndicator {
    fn drop(&mut self) {
        self.cancel_pulse();
    }
}

fn set_led(led: &Mutex<Box<dyn StatusLed>>, lit: bool) {
    match led.lock() {
        Ok(mut led) => led.set(lit),
        Err(poisoned) => poisoned.into_inner().set(lit),
    }
}
