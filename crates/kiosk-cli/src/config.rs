//! Daemon configuration – reads `~/.kioskd/config.toml`.
//!
//! Every section and every field is optional; anything left out takes the
//! default below.  A missing file is not an error.
//!
//! ```toml
//! [display]
//! output = "HDMI-A-2"
//!
//! [process]
//! start_script = "/home/kiosk/start-browser.sh"
//! stop_script = "/home/kiosk/stop-browser.sh"
//! process_name = "chromium"
//!
//! [presence]
//! capability = "absolute_axes"
//!
//! [adapters]
//! name = "-lobby"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiosk_cockpit::AdapterPorts;
use kiosk_hal::{DeviceCapability, SessionConfig, session::DEFAULT_RUNTIME_DIR};
use kiosk_runtime::{LoadSettings, PresenceSettings, SupervisorConfig};
use kiosk_types::KioskError;
use serde::{Deserialize, Serialize};

/// Variable naming an alternative config file.
pub const CONFIG_ENV: &str = "KIOSKD_CONFIG";

/// Base port when neither the file nor the command line sets one.
pub const DEFAULT_BASE_PORT: u16 = 8090;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub display: DisplaySection,
    pub session: SessionSection,
    pub process: ProcessSection,
    pub timing: TimingSection,
    pub presence: PresenceSection,
    pub load: LoadSection,
    pub adapters: AdapterSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySection {
    pub output: String,
    pub program: String,
    pub settle_ms: u64,
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            output: "HDMI-A-2".to_string(),
            program: "wlr-randr".to_string(),
            settle_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub runtime_dir: PathBuf,
    /// Compositor sockets in preference order.
    pub sockets: Vec<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            runtime_dir: PathBuf::from(DEFAULT_RUNTIME_DIR),
            sockets: session.sockets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSection {
    pub start_script: Option<PathBuf>,
    pub stop_script: Option<PathBuf>,
    /// Name in the process table; enables liveness checks for launchers
    /// that detach.
    pub process_name: Option<String>,
    pub teardown_timeout_secs: u64,
    /// Seconds after a launch before a missing process is relaunched.
    pub startup_grace_secs: u64,
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            start_script: None,
            stop_script: None,
            process_name: None,
            teardown_timeout_secs: kiosk_hal::launcher::DEFAULT_TEARDOWN_TIMEOUT.as_secs(),
            startup_grace_secs: SupervisorConfig::default().startup_grace.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub boot_grace_secs: u64,
    pub activate_on_boot: bool,
    pub reconcile_secs: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        let defaults = SupervisorConfig::default();
        Self {
            boot_grace_secs: defaults.boot_grace.as_secs(),
            activate_on_boot: defaults.activate_on_boot,
            reconcile_secs: defaults.reconcile_period.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSection {
    pub enabled: bool,
    pub quiet_secs: u64,
    pub rediscover_secs: u64,
    pub capability: DeviceCapability,
}

impl Default for PresenceSection {
    fn default() -> Self {
        let defaults = PresenceSettings::default();
        Self {
            enabled: true,
            quiet_secs: defaults.quiet.as_secs(),
            rediscover_secs: defaults.rediscover.as_secs(),
            capability: DeviceCapability::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadSection {
    pub enabled: bool,
    pub max_cpu_percent: f32,
    pub interval_secs: u64,
    pub cooldown_secs: u64,
    pub restart_pause_secs: u64,
}

impl Default for LoadSection {
    fn default() -> Self {
        let defaults = LoadSettings::default();
        Self {
            enabled: true,
            max_cpu_percent: defaults.max_cpu_percent,
            interval_secs: defaults.interval.as_secs(),
            cooldown_secs: defaults.cooldown.as_secs(),
            restart_pause_secs: defaults.restart_pause.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSection {
    /// Appended to the thing title and advertised by the MCP server.
    pub name: String,
    pub thing_port: u16,
    pub http_port: u16,
    pub mcp_port: u16,
}

impl Default for AdapterSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            thing_port: DEFAULT_BASE_PORT,
            http_port: DEFAULT_BASE_PORT + 1,
            mcp_port: DEFAULT_BASE_PORT + 2,
        }
    }
}

impl Config {
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            runtime_dir: self.session.runtime_dir.clone(),
            sockets: self.session.sockets.clone(),
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            boot_grace: Duration::from_secs(self.timing.boot_grace_secs),
            activate_on_boot: self.timing.activate_on_boot,
            reconcile_period: Duration::from_secs(self.timing.reconcile_secs),
            settle: Duration::from_millis(self.display.settle_ms),
            startup_grace: Duration::from_secs(self.process.startup_grace_secs),
            presence: PresenceSettings {
                quiet: Duration::from_secs(self.presence.quiet_secs),
                rediscover: Duration::from_secs(self.presence.rediscover_secs),
            },
            load: LoadSettings {
                max_cpu_percent: self.load.max_cpu_percent,
                interval: Duration::from_secs(self.load.interval_secs),
                cooldown: Duration::from_secs(self.load.cooldown_secs),
                restart_pause: Duration::from_secs(self.load.restart_pause_secs),
            },
        }
    }

    pub fn adapter_ports(&self) -> AdapterPorts {
        AdapterPorts {
            name: self.adapters.name.clone(),
            thing_port: self.adapters.thing_port,
            http_port: self.adapters.http_port,
            mcp_port: self.adapters.mcp_port,
        }
    }

    /// Reject values the workers cannot run with.
    pub fn validate(&self) -> Result<(), KioskError> {
        if self.display.output.trim().is_empty() {
            return Err(KioskError::Config("display.output must not be empty".into()));
        }
        if self.session.sockets.is_empty() {
            return Err(KioskError::Config("session.sockets must not be empty".into()));
        }
        if self.timing.reconcile_secs == 0 {
            return Err(KioskError::Config("timing.reconcile_secs must be positive".into()));
        }
        if self.process.teardown_timeout_secs == 0 {
            return Err(KioskError::Config(
                "process.teardown_timeout_secs must be positive".into(),
            ));
        }
        if self.presence.enabled && self.presence.rediscover_secs == 0 {
            return Err(KioskError::Config(
                "presence.rediscover_secs must be positive".into(),
            ));
        }
        if self.load.enabled {
            if !(self.load.max_cpu_percent > 0.0 && self.load.max_cpu_percent <= 100.0) {
                return Err(KioskError::Config(format!(
                    "load.max_cpu_percent must be in (0, 100], got {}",
                    self.load.max_cpu_percent
                )));
            }
            if self.load.interval_secs == 0 {
                return Err(KioskError::Config("load.interval_secs must be positive".into()));
            }
            if self.load.cooldown_secs == 0 {
                return Err(KioskError::Config("load.cooldown_secs must be positive".into()));
            }
        }
        Ok(())
    }

    /// Configured scripts that do not exist on disk.
    pub fn missing_scripts(&self) -> Vec<&Path> {
        [&self.process.start_script, &self.process.stop_script]
            .into_iter()
            .flatten()
            .map(PathBuf::as_path)
            .filter(|path| !path.exists())
            .collect()
    }
}

/// Return `$KIOSKD_CONFIG`, or `~/.kioskd/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".kioskd").join("config.toml")
}

/// Load from [`config_path`], apply `KIOSKD_*` overrides and validate.
pub fn load() -> Result<Config, KioskError> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Parse the file at `path`.  Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, KioskError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| KioskError::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| KioskError::Config(format!("failed to parse {}: {e}", path.display())))
}

/// Apply `KIOSKD_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `KIOSKD_OUTPUT` | `display.output` |
/// | `KIOSKD_START_SCRIPT` | `process.start_script` |
/// | `KIOSKD_STOP_SCRIPT` | `process.stop_script` |
/// | `KIOSKD_THING_PORT` | `adapters.thing_port` |
/// | `KIOSKD_HTTP_PORT` | `adapters.http_port` |
/// | `KIOSKD_MCP_PORT` | `adapters.mcp_port` |
/// | `KIOSKD_MAX_CPU` | `load.max_cpu_percent` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

pub(crate) fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("KIOSKD_OUTPUT") {
        cfg.display.output = v;
    }
    if let Some(v) = var("KIOSKD_START_SCRIPT") {
        cfg.process.start_script = Some(PathBuf::from(v));
    }
    if let Some(v) = var("KIOSKD_STOP_SCRIPT") {
        cfg.process.stop_script = Some(PathBuf::from(v));
    }
    let port = |name| var(name).and_then(|v| v.trim().parse::<u16>().ok());
    if let Some(p) = port("KIOSKD_THING_PORT") {
        cfg.adapters.thing_port = p;
    }
    if let Some(p) = port("KIOSKD_HTTP_PORT") {
        cfg.adapters.http_port = p;
    }
    if let Some(p) = port("KIOSKD_MCP_PORT") {
        cfg.adapters.mcp_port = p;
    }
    if let Some(max) = var("KIOSKD_MAX_CPU").and_then(|v| v.trim().parse::<f32>().ok()) {
        cfg.load.max_cpu_percent = max;
    }
}

/// Apply the positional `[PORT] [NAME]` arguments (program name excluded).
/// `PORT` is the thing port; http and mcp follow it.
pub fn apply_args(cfg: &mut Config, args: &[String]) -> Result<(), KioskError> {
    let mut args = args.iter();
    if let Some(port) = args.next() {
        let base = port
            .parse::<u16>()
            .map_err(|e| KioskError::Config(format!("invalid port {port:?}: {e}")))?;
        let ports = AdapterPorts::from_base(base, cfg.adapters.name.clone()).ok_or_else(|| {
            KioskError::Config(format!("port {base} leaves no room for the http and mcp ports"))
        })?;
        cfg.adapters.thing_port = ports.thing_port;
        cfg.adapters.http_port = ports.http_port;
        cfg.adapters.mcp_port = ports.mcp_port;
    }
    if let Some(name) = args.next() {
        cfg.adapters.name = name.clone();
    }
    if let Some(extra) = args.next() {
        return Err(KioskError::Config(format!("unexpected argument {extra:?}")));
    }
    Ok(())
}
