//! Configuration: tool settings via `ortho-config` and per-instance files.
//!
//! [`JetskiConfig`] carries host-side settings (binaries, retry budgets) and
//! merges defaults, `jetski.toml`, and `JETSKI_*` environment variables.
//! [`InstanceConfig`] describes one node and is read from the path passed on
//! the command line.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::wait::PollPolicy;

mod instance;

pub use instance::{
    DisableComponents, InstanceConfig, InstanceIdentity, KeepalivedConfig, KeepalivedState,
    KubeletConfig, NetworkConfig, NodeRole,
};

/// Host-side settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "JETSKI",
    discovery(
        app_name = "jetski",
        env_var = "JETSKI_CONFIG_PATH",
        config_file_name = "jetski.toml",
        dotfile_name = ".jetski.toml",
        project_file_name = "jetski.toml"
    )
)]
pub struct JetskiConfig {
    /// Explicit Multipass binary. When unset, `multipass.exe` and then
    /// `multipass` are looked up on `PATH`.
    pub multipass_bin: Option<String>,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Guest login user, unless the instance sets `user_name`.
    #[ortho_config(default = "ubuntu".to_owned())]
    pub ssh_user: String,
    /// Path to the `kubectl` executable used to merge kubeconfigs.
    #[ortho_config(default = "kubectl".to_owned())]
    pub kubectl_bin: String,
    /// Directory holding the kubeconfig to merge into; `~/.kube` when unset.
    pub kube_dir: Option<String>,
    /// Pause between polling attempts, in milliseconds.
    #[ortho_config(default = 1000)]
    pub poll_interval_ms: u64,
    /// Queries issued while waiting for an instance IP.
    #[ortho_config(default = 30)]
    pub ip_resolve_attempts: u32,
    /// Probes issued while waiting for SSH.
    #[ortho_config(default = 30)]
    pub ssh_probe_attempts: u32,
    /// Per-probe SSH bound, in seconds.
    #[ortho_config(default = 2)]
    pub ssh_probe_timeout_secs: u64,
    /// Bound on a one-off `multipass info`, in seconds.
    #[ortho_config(default = 3)]
    pub info_timeout_secs: u64,
    /// Bound on each `multipass info` while waiting for a state, in seconds.
    #[ortho_config(default = 30)]
    pub state_wait_info_timeout_secs: u64,
}

/// Retry budgets and bounds used by the orchestrator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timings {
    /// Pause between state polls and interface checks.
    pub poll_interval: Duration,
    /// IP resolution schedule.
    pub ip_resolve: PollPolicy,
    /// SSH readiness schedule.
    pub ssh_probe: PollPolicy,
    /// Per-probe SSH bound.
    pub ssh_probe_timeout: Duration,
    /// Bound on a one-off `multipass info`.
    pub info_timeout: Duration,
    /// Bound on each `multipass info` inside the state waiter.
    pub state_wait_info_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            ip_resolve: PollPolicy::default(),
            ssh_probe: PollPolicy::default(),
            ssh_probe_timeout: crate::wait::SSH_CONNECT_TIMEOUT,
            info_timeout: crate::multipass::DEFAULT_INFO_TIMEOUT,
            state_wait_info_timeout: crate::wait::STATE_WAIT_INFO_TIMEOUT,
        }
    }
}

impl JetskiConfig {
    /// Loads settings from defaults, configuration files, and environment
    /// variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Settings`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("jetski")])
            .map_err(|err| ConfigError::Settings(err.to_string()))
    }

    /// Rejects blank binaries and zero budgets.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the offending field and
    /// the environment variable that sets it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("ssh_bin", self.ssh_bin.as_str()),
            ("ssh_user", self.ssh_user.as_str()),
            ("kubectl_bin", self.kubectl_bin.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(settings_error(field, "must not be empty"));
            }
        }
        if let Some(bin) = &self.multipass_bin
            && bin.trim().is_empty()
        {
            return Err(settings_error("multipass_bin", "must not be empty when set"));
        }
        for (field, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("ip_resolve_attempts", u64::from(self.ip_resolve_attempts)),
            ("ssh_probe_attempts", u64::from(self.ssh_probe_attempts)),
            ("ssh_probe_timeout_secs", self.ssh_probe_timeout_secs),
            ("info_timeout_secs", self.info_timeout_secs),
            ("state_wait_info_timeout_secs", self.state_wait_info_timeout_secs),
        ] {
            if value == 0 {
                return Err(settings_error(field, "must be greater than zero"));
            }
        }
        Ok(())
    }

    /// Converts the raw settings into orchestrator timings.
    #[must_use]
    pub const fn timings(&self) -> Timings {
        let interval = Duration::from_millis(self.poll_interval_ms);
        Timings {
            poll_interval: interval,
            ip_resolve: PollPolicy {
                attempts: self.ip_resolve_attempts,
                interval,
            },
            ssh_probe: PollPolicy {
                attempts: self.ssh_probe_attempts,
                interval,
            },
            ssh_probe_timeout: Duration::from_secs(self.ssh_probe_timeout_secs),
            info_timeout: Duration::from_secs(self.info_timeout_secs),
            state_wait_info_timeout: Duration::from_secs(self.state_wait_info_timeout_secs),
        }
    }
}

fn settings_error(field: &str, problem: &str) -> ConfigError {
    ConfigError::Validation {
        field: field.to_owned(),
        message: format!(
            "{problem}: set JETSKI_{} or add {field} to jetski.toml",
            field.to_ascii_uppercase()
        ),
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when the instance configuration file cannot be read.
    #[error("failed to read instance config `{path}`: {message}")]
    Read {
        /// Path that was read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the instance configuration is not valid YAML/JSON or
    /// does not match the schema.
    #[error("failed to parse instance config `{path}`: {message}")]
    Parse {
        /// Path that was parsed.
        path: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when a value is present but unacceptable.
    #[error("invalid configuration value for {field}: {message}")]
    Validation {
        /// Offending field.
        field: String,
        /// What is wrong and how to fix it.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("settings parsing failed: {0}")]
    Settings(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Settings(value.to_string())
    }
}

#[cfg(test)]
mod tests;
