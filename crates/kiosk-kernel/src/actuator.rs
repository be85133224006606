//! [`PowerActuator`] – verified power control of the managed output.
//!
//! Wraps a raw [`DisplayPower`] driver.  Every command is followed by a
//! settle delay and a fresh probe, and the *probed* state is what callers get
//! back.  A mismatch between requested and verified state is logged and left
//! for the reconciliation loop; it is never retried inline.

use std::time::Duration;

use kiosk_hal::DisplayPower;
use kiosk_types::{KioskError, PowerState};
use tracing::{debug, info, warn};

/// Time given to the output after a command before it is re-probed.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(1);

pub struct PowerActuator {
    driver: Box<dyn DisplayPower>,
    settle: Duration,
}

impl PowerActuator {
    pub fn new(driver: Box<dyn DisplayPower>) -> Self {
        Self {
            driver,
            settle: DEFAULT_SETTLE,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn output(&self) -> &str {
        self.driver.output()
    }

    /// Switch the output and return the state verified afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Actuator`] only when the command itself failed.
    /// A failed verification probe yields `Ok(PowerState::Unknown)`.
    pub async fn set_power(&self, on: bool) -> Result<PowerState, KioskError> {
        self.driver.command(on).await?;
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        let verified = match self.probe().await {
            Ok(state) => state,
            Err(e) => {
                warn!(output = %self.output(), error = %e, "could not verify power command");
                PowerState::Unknown
            }
        };

        if verified == PowerState::from_bool(on) {
            info!(output = %self.output(), state = %verified, "power state verified");
        } else {
            warn!(
                output = %self.output(),
                requested = %PowerState::from_bool(on),
                verified = %verified,
                "power state mismatch"
            );
        }
        Ok(verified)
    }

    /// Read the output's current state.
    ///
    /// `Ok(PowerState::Unknown)` when the output is not listed.
    pub async fn probe(&self) -> Result<PowerState, KioskError> {
        let state = self.driver.status().await?;
        debug!(output = %self.output(), %state, "probed");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiosk_hal::sim::{Call, CallLog, SimDisplay};

    fn actuator(display: &SimDisplay) -> PowerActuator {
        PowerActuator::new(Box::new(display.clone())).with_settle(Duration::ZERO)
    }

    #[tokio::test]
    async fn set_power_returns_verified_state() {
        let log = CallLog::default();
        let display = SimDisplay::new("HDMI-A-2", log.clone());
        let actuator = actuator(&display);

        assert_eq!(actuator.set_power(true).await, Ok(PowerState::On));
        assert_eq!(log.calls(), vec![Call::PowerCommand(true), Call::PowerStatus]);
    }

    #[tokio::test]
    async fn mismatch_is_reported_not_retried() {
        let log = CallLog::default();
        let display = SimDisplay::new("HDMI-A-2", log.clone());
        display.stick(true);
        let actuator = actuator(&display);

        assert_eq!(actuator.set_power(true).await, Ok(PowerState::Off));
        assert_eq!(log.count(Call::PowerCommand(true)), 1);
    }

    #[tokio::test]
    async fn failed_verification_is_unknown() {
        let display = SimDisplay::new("HDMI-A-2", CallLog::default());
        display.fail_status(true);
        let actuator = actuator(&display);

        assert_eq!(actuator.set_power(false).await, Ok(PowerState::Unknown));
        assert!(actuator.probe().await.is_err());
    }

    #[tokio::test]
    async fn failed_command_skips_verification() {
        let log = CallLog::default();
        let display = SimDisplay::new("HDMI-A-2", log.clone());
        display.fail_commands(true);
        let actuator = actuator(&display);

        assert!(matches!(
            actuator.set_power(true).await,
            Err(KioskError::Actuator { .. })
        ));
        assert_eq!(log.count(Call::PowerStatus), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delay_precedes_probe() {
        let display = SimDisplay::new("HDMI-A-2", CallLog::default());
        let actuator = PowerActuator::new(Box::new(display.clone()));

        let began = tokio::time::Instant::now();
        actuator.set_power(true).await.unwrap();
        assert!(began.elapsed() >= DEFAULT_SETTLE);
    }
}
