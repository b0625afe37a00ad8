//! Errors surfaced by provisioning workflows.

use thiserror::Error;

use crate::cloud_init::CloudInitError;
use crate::config::ConfigError;
use crate::join::JoinError;
use crate::kubeconfig::KubeconfigError;
use crate::multipass::{InstanceState, MultipassError};
use crate::network::NetworkError;
use crate::ssh::SshError;
use crate::ssh::keys::KeyError;
use crate::wait::WaitError;

/// Errors raised while driving an instance through its lifecycle.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// Raised when the instance configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when the request does not apply to this instance.
    #[error("{message}")]
    Validation {
        /// What is wrong.
        message: String,
    },
    /// Raised when the instance is not in a state the operation accepts.
    #[error("instance '{name}' is not in {expected} state; current state is '{actual}'")]
    StateMismatch {
        /// Instance name.
        name: String,
        /// Accepted states, human readable.
        expected: String,
        /// State reported by the hypervisor.
        actual: InstanceState,
    },
    /// Raised when a Multipass command fails or times out.
    #[error(transparent)]
    Hypervisor(#[from] MultipassError),
    /// Raised when a polling loop gives up or is cancelled.
    #[error(transparent)]
    Wait(#[from] WaitError),
    /// Raised when a guest command fails.
    #[error(transparent)]
    Ssh(#[from] SshError),
    /// Raised when the SSH key pair cannot be prepared.
    #[error(transparent)]
    Keys(#[from] KeyError),
    /// Raised when join metadata is missing or unreadable.
    #[error(transparent)]
    Join(#[from] JoinError),
    /// Raised when the cloud-init document cannot be produced.
    #[error(transparent)]
    CloudInit(#[from] CloudInitError),
    /// Raised when the kubeconfig merge fails.
    #[error(transparent)]
    Kubeconfig(#[from] KubeconfigError),
    /// Raised when host routes cannot be added.
    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl ProvisionError {
    /// Returns `true` when the failure stems from operator cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Hypervisor(err) => err.is_cancelled(),
            Self::Wait(WaitError::Cancelled { .. }) => true,
            Self::Wait(WaitError::Ssh(SshError::Process(err))) | Self::Ssh(SshError::Process(err)) => {
                err.is_cancelled()
            }
            _ => false,
        }
    }
}
