//! Display output power control.
//!
//! [`DisplayPower`] is the raw driver interface: issue an on/off command to
//! one named output and read back its status.  Verification and mismatch
//! handling sit one layer up in the kernel's `PowerActuator`; drivers only
//! report what the hardware says.
//!
//! [`WlrRandr`] drives wlroots compositors through the `wlr-randr` CLI.
//! Status is read from `wlr-randr --json` when the installed version supports
//! it, otherwise from the human-readable listing.

use std::time::Duration;

use async_trait::async_trait;
use kiosk_types::{KioskError, PowerState};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::session::SessionConfig;

/// Upper bound for a single `wlr-randr` invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// A single display output that can be switched on and off.
#[async_trait]
pub trait DisplayPower: Send + Sync {
    /// Connector name of the managed output, e.g. `"HDMI-A-2"`.
    fn output(&self) -> &str;

    /// Ask the output to switch power state.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Actuator`] if the command could not be run or
    /// reported failure.
    async fn command(&self, on: bool) -> Result<(), KioskError>;

    /// Read the output's current power state.
    ///
    /// `Ok(PowerState::Unknown)` means the status was readable but the output
    /// was not listed in it.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Actuator`] if the status command failed or its
    /// output could not be parsed.
    async fn status(&self) -> Result<PowerState, KioskError>;
}

// ────────────────────────────────────────────────────────────────────────────
// wlr-randr driver
// ────────────────────────────────────────────────────────────────────────────

/// `wlr-randr` backed [`DisplayPower`] driver.
pub struct WlrRandr {
    output: String,
    program: String,
    session: SessionConfig,
}

impl WlrRandr {
    pub fn new(output: impl Into<String>, session: SessionConfig) -> Self {
        Self {
            output: output.into(),
            program: "wlr-randr".to_string(),
            session,
        }
    }

    /// Override the executable (builder-style), e.g. an absolute path.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        self.session.resolve().apply(&mut cmd);
        cmd.kill_on_drop(true);
        cmd
    }

    fn fault(&self, details: impl Into<String>) -> KioskError {
        KioskError::Actuator {
            output: self.output.clone(),
            details: details.into(),
        }
    }

    async fn capture(&self, args: &[&str]) -> Result<String, KioskError> {
        let mut cmd = self.base_command();
        cmd.args(args);
        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| self.fault(format!("{} {} timed out", self.program, args.join(" "))))?
            .map_err(|e| self.fault(format!("failed to run {}: {e}", self.program)))?;
        if !output.status.success() {
            return Err(self.fault(format!(
                "{} {} exited with {}",
                self.program,
                args.join(" "),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DisplayPower for WlrRandr {
    fn output(&self) -> &str {
        &self.output
    }

    async fn command(&self, on: bool) -> Result<(), KioskError> {
        let flag = if on { "--on" } else { "--off" };
        let mut cmd = self.base_command();
        cmd.arg("--output").arg(&self.output).arg(flag);
        let status = tokio::time::timeout(COMMAND_TIMEOUT, cmd.status())
            .await
            .map_err(|_| self.fault(format!("{} {flag} timed out", self.program)))?
            .map_err(|e| self.fault(format!("failed to run {}: {e}", self.program)))?;
        if status.success() {
            debug!(output = %self.output, flag, "power command issued");
            Ok(())
        } else {
            Err(self.fault(format!("{} {flag} exited with {status}", self.program)))
        }
    }

    async fn status(&self) -> Result<PowerState, KioskError> {
        match self.capture(&["--json"]).await {
            Ok(json) => match parse_json_status(&json, &self.output) {
                Ok(state) => return Ok(state),
                Err(e) => debug!(output = %self.output, error = %e, "unparsable JSON status"),
            },
            Err(e) => debug!(output = %self.output, error = %e, "JSON status unavailable"),
        }

        let text = self.capture(&[]).await?;
        let state = parse_text_status(&text, &self.output);
        if state == PowerState::Unknown {
            warn!(output = %self.output, "output not found in wlr-randr listing");
        }
        Ok(state)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Status parsing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonOutput {
    name: String,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    dpms: Option<bool>,
}

/// Parse `wlr-randr --json` output.
///
/// Returns `Ok(PowerState::Unknown)` when `output` is missing from an
/// otherwise valid document, and an error when the document is malformed.
pub fn parse_json_status(json: &str, output: &str) -> Result<PowerState, String> {
    let outputs: Vec<JsonOutput> =
        serde_json::from_str(json).map_err(|e| format!("invalid wlr-randr JSON: {e}"))?;
    let Some(entry) = outputs.into_iter().find(|o| o.name == output) else {
        return Ok(PowerState::Unknown);
    };
    // A DPMS-off output is still "enabled" in the layout; both must be on.
    let state = match (entry.enabled, entry.dpms) {
        (Some(false), _) | (_, Some(false)) => PowerState::Off,
        (Some(true), _) | (None, Some(true)) => PowerState::On,
        (None, None) => PowerState::Unknown,
    };
    Ok(state)
}

/// Scan the human-readable `wlr-randr` listing for `output`'s block and its
/// `Enabled:` / `DPMS:` flags.
pub fn parse_text_status(text: &str, output: &str) -> PowerState {
    let mut in_block = false;
    let mut enabled = None;
    let mut dpms = None;

    for line in text.lines() {
        let is_header = !line.starts_with(char::is_whitespace) && !line.trim().is_empty();
        if is_header {
            if in_block {
                break;
            }
            in_block = line.split_whitespace().next() == Some(output);
            continue;
        }
        if !in_block {
            continue;
        }
        if let Some((key, value)) = line.trim().split_once(':') {
            let flag = parse_flag(value.trim());
            match key.trim() {
                "Enabled" => enabled = flag,
                "DPMS" => dpms = flag,
                _ => {}
            }
        }
    }

    match (enabled, dpms) {
        (Some(false), _) | (_, Some(false)) => PowerState::Off,
        (Some(true), _) | (None, Some(true)) => PowerState::On,
        (None, None) => PowerState::Unknown,
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "on" | "true" | "enabled" => Some(true),
        "no" | "off" | "false" | "disabled" => Some(false),
        _ => None,
    }
}
