//! Launch and teardown of the supervised foreground application.
//!
//! [`AppLauncher`] is deliberately thin: it runs commands and answers
//! liveness questions.  Bookkeeping (`observed_running`, start timestamps,
//! the "already running" shortcut) belongs to the kernel's
//! `ProcessSupervisor`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use kiosk_types::KioskError;
use sysinfo::{ProcessRefreshKind, System, UpdateKind};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::session::SessionConfig;

/// Default bound on how long the teardown command may run.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Linux keeps at most this many bytes of a process name in `comm`.
const COMM_LEN: usize = 15;

/// Starts and stops one external application.
#[async_trait]
pub trait AppLauncher: Send + Sync {
    /// Start the application without waiting for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Supervisor`] if the launch command could not be
    /// spawned.
    async fn launch(&self) -> Result<(), KioskError>;

    /// Run the teardown command and wait for it, bounded by a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Supervisor`] if the command failed, exited
    /// non-zero or overran its timeout.
    async fn teardown(&self) -> Result<(), KioskError>;

    /// Live presence check.
    ///
    /// `None` means liveness cannot be determined by this backend right now,
    /// in which case callers fall back to their own bookkeeping.
    async fn is_alive(&self) -> Option<bool>;
}

/// Runs a start script and a stop script through a shell.
///
/// Either script may be absent; the corresponding operation then succeeds
/// without running anything.
pub struct ScriptLauncher {
    start_script: Option<PathBuf>,
    stop_script: Option<PathBuf>,
    shell: String,
    process_name: Option<String>,
    teardown_timeout: Duration,
    session: SessionConfig,
    child: Mutex<Option<Child>>,
    system: Mutex<System>,
}

impl ScriptLauncher {
    pub fn new(
        start_script: Option<PathBuf>,
        stop_script: Option<PathBuf>,
        session: SessionConfig,
    ) -> Self {
        Self {
            start_script,
            stop_script,
            shell: "/bin/bash".to_string(),
            process_name: None,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
            session,
            child: Mutex::new(None),
            system: Mutex::new(System::new()),
        }
    }

    /// Interpreter used to run both scripts.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Name of the long-lived application process (e.g. `"chromium"`).
    ///
    /// When set, liveness is answered from the system process table instead
    /// of the spawned launcher child.
    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = Some(name.into());
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn start_script(&self) -> Option<&Path> {
        self.start_script.as_deref()
    }

    pub fn stop_script(&self) -> Option<&Path> {
        self.stop_script.as_deref()
    }

    fn script_command(&self, script: &Path) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg(script).stdin(Stdio::null());
        self.session.resolve().apply(&mut cmd);
        cmd
    }

    fn child_slot(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn process_table_alive(&self, name: &str) -> bool {
        let mut system = self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_processes_specifics(
            ProcessRefreshKind::new()
                .with_exe(UpdateKind::OnlyIfNotSet)
                .with_cmd(UpdateKind::OnlyIfNotSet),
        );
        system.processes().values().any(|process| {
            process_matches(
                name,
                process.name(),
                process.exe(),
                process.cmd().first().map(String::as_str),
            )
        })
    }

    fn child_alive(&self) -> Option<bool> {
        let mut slot = self.child_slot();
        let child = slot.as_mut()?;
        match child.try_wait() {
            Ok(None) => Some(true),
            Ok(Some(status)) => {
                *slot = None;
                // A clean exit usually means the script handed off to a
                // detached browser, which this backend cannot see.
                if status.success() { None } else { Some(false) }
            }
            Err(e) => {
                debug!(error = %e, "could not poll launcher child");
                None
            }
        }
    }
}

/// Whether a process table entry is the application called `name`.
///
/// `comm` is truncated, so the executable's file name and `argv[0]` are
/// checked as well, and a full-length `comm` may match as a prefix.
pub(crate) fn process_matches(
    name: &str,
    comm: &str,
    exe: Option<&Path>,
    argv0: Option<&str>,
) -> bool {
    let file_is = |path: &Path| path.file_name().is_some_and(|file| file == name);
    comm == name
        || exe.is_some_and(file_is)
        || argv0.is_some_and(|arg| file_is(Path::new(arg)))
        || (comm.len() == COMM_LEN && name.len() > COMM_LEN && name.starts_with(comm))
}

#[async_trait]
impl AppLauncher for ScriptLauncher {
    async fn launch(&self) -> Result<(), KioskError> {
        let Some(script) = &self.start_script else {
            debug!("no start script configured");
            return Ok(());
        };
        let child = self.script_command(script).spawn().map_err(|e| {
            KioskError::Supervisor(format!("failed to launch {}: {e}", script.display()))
        })?;
        info!(script = %script.display(), pid = ?child.id(), "application launched");
        *self.child_slot() = Some(child);
        Ok(())
    }

    async fn teardown(&self) -> Result<(), KioskError> {
        // The stop script owns the actual termination; the handle is stale.
        self.child_slot().take();

        let Some(script) = &self.stop_script else {
            debug!("no stop script configured");
            return Ok(());
        };
        let mut cmd = self.script_command(script);
        cmd.kill_on_drop(true);
        let status = tokio::time::timeout(self.teardown_timeout, cmd.status())
            .await
            .map_err(|_| {
                warn!(
                    script = %script.display(),
                    timeout = ?self.teardown_timeout,
                    "teardown overran its timeout; killed"
                );
                KioskError::Supervisor(format!(
                    "{} timed out after {:?}",
                    script.display(),
                    self.teardown_timeout
                ))
            })?
            .map_err(|e| {
                KioskError::Supervisor(format!(
                    "failed to run {}: {e}",
                    script.display()
                ))
            })?;

        if status.success() {
            info!(script = %script.display(), "application stopped");
            Ok(())
        } else {
            Err(KioskError::Supervisor(format!(
                "{} exited with {status}",
                script.display()
            )))
        }
    }

    async fn is_alive(&self) -> Option<bool> {
        match &self.process_name {
            Some(name) => Some(self.process_table_alive(name)),
            None => self.child_alive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).expect("write script");
        path
    }

    fn launcher(start: PathBuf, stop: PathBuf) -> ScriptLauncher {
        ScriptLauncher::new(Some(start), Some(stop), SessionConfig::default())
            .with_shell("/bin/sh")
    }

    #[tokio::test]
    async fn running_child_is_alive_until_it_fails() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let start = script(dir.path(), "start.sh", "sleep 0.3\nexit 3\n");
        let stop = script(dir.path(), "stop.sh", "exit 0\n");
        let launcher = launcher(start, stop);

        assert_eq!(launcher.is_alive().await, None, "nothing launched yet");
        launcher.launch().await.expect("launch");
        assert_eq!(launcher.is_alive().await, Some(true));

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(launcher.is_alive().await, Some(false));
    }

    #[tokio::test]
    async fn clean_exit_leaves_liveness_undetermined() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let start = script(dir.path(), "start.sh", "exit 0\n");
        let stop = script(dir.path(), "stop.sh", "exit 0\n");
        let launcher = launcher(start, stop);

        launcher.launch().await.expect("launch");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(launcher.is_alive().await, None);
    }

    #[tokio::test]
    async fn missing_shell_is_a_launch_error() {
        let launcher = ScriptLauncher::new(Some("/tmp/a.sh".into()), None, SessionConfig::default())
            .with_shell("/nonexistent/shell");
        assert!(matches!(
            launcher.launch().await,
            Err(KioskError::Supervisor(_))
        ));
    }

    #[tokio::test]
    async fn absent_scripts_are_no_ops() {
        let launcher = ScriptLauncher::new(None, None, SessionConfig::default());
        launcher.launch().await.expect("launch");
        launcher.teardown().await.expect("teardown");
        assert_eq!(launcher.is_alive().await, None);
    }

    #[tokio::test]
    async fn teardown_reports_non_zero_exit() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let start = script(dir.path(), "start.sh", "exit 0\n");
        let stop = script(dir.path(), "stop.sh", "exit 1\n");
        let err = launcher(start, stop).teardown().await.unwrap_err();
        assert!(err.to_string().contains("stop.sh"));
    }

    #[tokio::test]
    async fn teardown_is_bounded() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let start = script(dir.path(), "start.sh", "exit 0\n");
        let stop = script(dir.path(), "stop.sh", "sleep 5\n");
        let launcher =
            launcher(start, stop).with_teardown_timeout(Duration::from_millis(100));

        let began = std::time::Instant::now();
        let err = launcher.teardown().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(began.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn teardown_success_forgets_child() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let start = script(dir.path(), "start.sh", "sleep 2\n");
        let stop = script(dir.path(), "stop.sh", "exit 0\n");
        let launcher = launcher(start, stop);

        launcher.launch().await.expect("launch");
        launcher.teardown().await.expect("teardown");
        assert_eq!(launcher.is_alive().await, None);
    }

    #[test]
    fn long_names_match_past_the_comm_limit() {
        let name = "chromium-browser";
        assert!(process_matches(name, "chromium-browse", None, None));
        assert!(process_matches(
            name,
            "chromium",
            Some(Path::new("/usr/lib/chromium/chromium-browser")),
            None
        ));
        assert!(process_matches(name, "x", None, Some("/usr/bin/chromium-browser")));
        assert!(process_matches("chromium", "chromium", None, None));

        assert!(!process_matches("chromium", "chromium-browse", None, None));
        assert!(!process_matches(name, "chromium-b", None, None));
        assert!(!process_matches(name, "firefox", Some(Path::new("/usr/bin/firefox")), None));
    }

    #[tokio::test]
    async fn running_process_with_long_name_is_alive() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let binary = dir.path().join("kiosk-browser-long");
        std::fs::copy("/bin/sleep", &binary).expect("copy sleep");
        let mut child = std::process::Command::new(&binary)
            .arg("30")
            .spawn()
            .expect("spawn");

        let launcher = ScriptLauncher::new(None, None, SessionConfig::default())
            .with_process_name("kiosk-browser-long");
        let alive = launcher.is_alive().await;

        let _ = child.kill();
        let _ = child.wait();
        assert_eq!(alive, Some(true));
    }

    #[tokio::test]
    async fn process_table_lookup_for_unknown_name_is_not_alive() {
        let launcher = ScriptLauncher::new(Some("/tmp/a.sh".into()), None, SessionConfig::default())
            .with_process_name("no-such-process-kioskd-test");
        assert_eq!(launcher.is_alive().await, Some(false));
    }
}
