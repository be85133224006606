//! `kioskd` – kiosk display and browser supervisor
//!
//! 1. Installs logging (see [`kiosk_runtime::telemetry`]).
//! 2. Loads `~/.kioskd/config.toml` (or `$KIOSKD_CONFIG`), applies
//!    `KIOSKD_*` overrides and the positional `[PORT] [NAME]` arguments.
//! 3. Starts the supervisor workers over the real backends (`wlr-randr`,
//!    the start/stop scripts, evdev touch input, sysinfo CPU load).
//! 4. Serves the thing, HTTP and MCP adapters until Ctrl-C or SIGTERM.
//!
//! Exits non-zero if the configuration is rejected or an adapter port
//! cannot be bound.

mod config;

use std::process::ExitCode;
use std::time::Duration;

use kiosk_cockpit::serve_all;
use kiosk_hal::{
    AppLauncher, DisplayPower, EvdevPresence, LoadProbe, PresenceSource, ScriptLauncher,
    SysinfoLoad, WlrRandr,
};
use kiosk_middleware::EventBus;
use kiosk_runtime::{Backends, Supervisor, init_tracing};
use kiosk_types::KioskError;
use tracing::{error, info, warn};

use crate::config::Config;

fn main() -> ExitCode {
    let _telemetry = init_tracing("kioskd");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = match config::load().and_then(|mut cfg| {
        config::apply_args(&mut cfg, &args)?;
        Ok(cfg)
    }) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %config::config_path().display(), error = %e, "configuration rejected");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "kioskd stopped on a fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config) -> Result<(), KioskError> {
    for script in cfg.missing_scripts() {
        error!(path = %script.display(), "configured script does not exist; it will be skipped");
    }

    let ports = cfg.adapter_ports();
    info!(
        output = %cfg.display.output,
        thing_port = ports.thing_port,
        http_port = ports.http_port,
        mcp_port = ports.mcp_port,
        name = %ports.name,
        "kioskd starting"
    );

    let supervisor = Supervisor::start(cfg.supervisor(), backends(&cfg), EventBus::default());
    let token = supervisor.token();

    let on_signal = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("termination requested");
        on_signal.cancel();
    }) {
        warn!(error = %e, "failed to install signal handler; only a kill will stop kioskd");
    }

    let served = serve_all(supervisor.store(), ports, token).await;
    supervisor.shutdown().await;
    info!("kioskd stopped");
    served
}

fn backends(cfg: &Config) -> Backends {
    let session = cfg.session();

    let display: Box<dyn DisplayPower> = Box::new(
        WlrRandr::new(cfg.display.output.clone(), session.clone())
            .with_program(cfg.display.program.clone()),
    );

    let mut launcher = ScriptLauncher::new(
        cfg.process.start_script.clone(),
        cfg.process.stop_script.clone(),
        session,
    )
    .with_teardown_timeout(Duration::from_secs(cfg.process.teardown_timeout_secs));
    if let Some(name) = &cfg.process.process_name {
        launcher = launcher.with_process_name(name.clone());
    }
    let launcher: Box<dyn AppLauncher> = Box::new(launcher);

    let presence = cfg.presence.enabled.then(|| {
        Box::new(EvdevPresence::new(cfg.presence.capability)) as Box<dyn PresenceSource>
    });
    let load = cfg
        .load
        .enabled
        .then(|| Box::new(SysinfoLoad::new()) as Box<dyn LoadProbe>);

    Backends {
        display,
        launcher,
        presence,
        load,
    }
}
