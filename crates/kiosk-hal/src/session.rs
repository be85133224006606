//! Wayland session environment for spawned commands.
//!
//! `wlr-randr` and the browser scripts must talk to the compositor, which
//! means they need `XDG_RUNTIME_DIR` and `WAYLAND_DISPLAY`.  The daemon
//! itself usually runs outside the session (system service), so the values
//! are derived from configuration instead of inherited.
//!
//! The compositor may create its socket only after the daemon has started,
//! so [`SessionConfig::resolve`] is evaluated per command rather than once.
//! Resolution only checks for file existence and produces a fresh
//! [`SessionEnv`] value; the process environment is never mutated.

use std::path::{Path, PathBuf};

use tokio::process::Command;

/// Default runtime directory of the kiosk user (uid 1000).
pub const DEFAULT_RUNTIME_DIR: &str = "/run/user/1000";

/// How to find the compositor socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub runtime_dir: PathBuf,
    /// Socket names in preference order.  The first one that exists under
    /// `runtime_dir` wins; the last one is the fallback when none exists.
    pub sockets: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from(DEFAULT_RUNTIME_DIR),
            sockets: vec!["wayland-1".to_string(), "wayland-0".to_string()],
        }
    }
}

impl SessionConfig {
    /// Pick the socket to use right now.
    pub fn resolve(&self) -> SessionEnv {
        let socket = self
            .sockets
            .iter()
            .find(|name| self.runtime_dir.join(name.as_str()).exists())
            .or_else(|| self.sockets.last())
            .cloned()
            .unwrap_or_else(|| "wayland-0".to_string());
        SessionEnv {
            runtime_dir: self.runtime_dir.clone(),
            display_socket: socket,
        }
    }
}

/// A resolved session environment, passed by value to each command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnv {
    runtime_dir: PathBuf,
    display_socket: String,
}

impl SessionEnv {
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn display_socket(&self) -> &str {
        &self.display_socket
    }

    /// Inject the session variables into `cmd`.
    pub fn apply(&self, cmd: &mut Command) {
        cmd.env("XDG_RUNTIME_DIR", &self.runtime_dir)
            .env("WAYLAND_DISPLAY", &self.display_socket);
    }
}
