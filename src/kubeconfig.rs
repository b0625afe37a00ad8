//! Merges a bootstrap server's kubeconfig into the operator's.

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde_yaml::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::files::{self, FileError};
use crate::join::K3S_API_PORT;
use crate::process::{CommandRunner, CommandSpec, ProcessError};
use crate::ssh::{SshChannel, SshError};

/// Location of the admin kubeconfig k3s writes on servers.
pub const K3S_KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

/// Default kubeconfig directory.
pub const DEFAULT_KUBE_DIR: &str = "~/.kube";

/// Errors raised while merging kubeconfigs.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum KubeconfigError {
    /// Raised when the guest kubeconfig cannot be read over SSH.
    #[error("failed to fetch kubeconfig from the instance: {0}")]
    Fetch(#[from] SshError),
    /// Raised when the guest kubeconfig lacks an expected entry.
    #[error("unexpected kubeconfig layout: {message}")]
    Malformed {
        /// What was missing.
        message: String,
    },
    /// Raised when local files cannot be read or written.
    #[error("failed to update local kubeconfig: {0}")]
    File(#[from] FileError),
    /// Raised when the scratch directory cannot be created.
    #[error("failed to create a temporary directory: {message}")]
    TempDir {
        /// Underlying error message.
        message: String,
    },
    /// Raised when `kubectl config view --flatten` fails.
    #[error("kubectl exited with status {status_text}: {stderr}")]
    Kubectl {
        /// Human readable representation of the exit status.
        status_text: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Raised when `kubectl` cannot be run.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

fn malformed(message: impl Into<String>) -> KubeconfigError {
    KubeconfigError::Malformed {
        message: message.into(),
    }
}

fn first_mut<'a>(doc: &'a mut Value, key: &str) -> Result<&'a mut Value, KubeconfigError> {
    doc.get_mut(key)
        .and_then(|list| list.get_mut(0))
        .ok_or_else(|| malformed(format!("missing {key}[0]")))
}

fn set(target: &mut Value, key: &str, value: &str) -> Result<(), KubeconfigError> {
    let mapping = target
        .as_mapping_mut()
        .ok_or_else(|| malformed(format!("cannot set {key} on a non-mapping")))?;
    mapping.insert(Value::from(key), Value::from(value));
    Ok(())
}

/// Points the kubeconfig at `https://<server_ip>:6443` and renames its
/// cluster, context, and user entries to `context`.
///
/// # Errors
///
/// Returns [`KubeconfigError::Malformed`] when the document is not a k3s
/// kubeconfig.
pub fn rewrite(raw: &str, server_ip: Ipv4Addr, context: &str) -> Result<String, KubeconfigError> {
    let mut doc: Value =
        serde_yaml::from_str(raw).map_err(|err| malformed(err.to_string()))?;

    let cluster = first_mut(&mut doc, "clusters")?;
    set(cluster, "name", context)?;
    let server = format!("https://{server_ip}:{K3S_API_PORT}");
    set(
        cluster
            .get_mut("cluster")
            .ok_or_else(|| malformed("missing clusters[0].cluster"))?,
        "server",
        &server,
    )?;

    let entry = first_mut(&mut doc, "contexts")?;
    set(entry, "name", context)?;
    let inner = entry
        .get_mut("context")
        .ok_or_else(|| malformed("missing contexts[0].context"))?;
    set(inner, "cluster", context)?;
    set(inner, "user", context)?;

    set(first_mut(&mut doc, "users")?, "name", context)?;
    set(&mut doc, "current-context", context)?;

    serde_yaml::to_string(&doc).map_err(|err| malformed(err.to_string()))
}

/// Fetches, rewrites, backs up, and merges kubeconfigs.
#[derive(Clone, Debug)]
pub struct KubeconfigMerger<R: CommandRunner> {
    runner: R,
    kubectl_bin: String,
    kube_dir: Utf8PathBuf,
}

impl<R: CommandRunner> KubeconfigMerger<R> {
    /// Creates a merger writing into `kube_dir` (tilde expanded).
    #[must_use]
    pub fn new(runner: R, kubectl_bin: impl Into<String>, kube_dir: &str) -> Self {
        Self {
            runner,
            kubectl_bin: kubectl_bin.into(),
            kube_dir: Utf8PathBuf::from(files::expand_tilde(kube_dir)),
        }
    }

    /// The merged kubeconfig file.
    #[must_use]
    pub fn config_path(&self) -> Utf8PathBuf {
        self.kube_dir.join("config")
    }

    /// Reads the guest's admin kubeconfig over SSH and merges it under
    /// `context`, with the API server at `cluster_ip`.
    ///
    /// # Errors
    ///
    /// Returns [`KubeconfigError`] when fetching, rewriting, or merging
    /// fails.
    pub async fn update<C: CommandRunner>(
        &self,
        channel: &SshChannel<C>,
        instance_ip: Ipv4Addr,
        cluster_ip: Ipv4Addr,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<Utf8PathBuf, KubeconfigError> {
        info!(path = K3S_KUBECONFIG_PATH, "fetching instance kubeconfig over SSH");
        let raw = channel
            .read(instance_ip, &["sudo", "cat", K3S_KUBECONFIG_PATH], cancel)
            .await?;
        let rewritten = rewrite(&raw, cluster_ip, context)?;
        self.merge(&rewritten, context).await
    }

    /// Backs up the current kubeconfig and merges `kubeconfig` into it.
    /// Entries from `kubeconfig` win on name clashes.
    ///
    /// # Errors
    ///
    /// Returns [`KubeconfigError`] when files cannot be written or
    /// `kubectl` fails.
    pub async fn merge(&self, kubeconfig: &str, context: &str) -> Result<Utf8PathBuf, KubeconfigError> {
        let scratch = tempfile::Builder::new()
            .prefix("jetski-kube-")
            .tempdir()
            .map_err(|err| KubeconfigError::TempDir {
                message: err.to_string(),
            })?;
        let scratch_root = Utf8Path::from_path(scratch.path()).ok_or_else(|| {
            KubeconfigError::TempDir {
                message: format!("{} is not valid UTF-8", scratch.path().display()),
            }
        })?;
        let incoming = scratch_root.join("kubeconfig.yaml");
        files::write(&incoming, kubeconfig)?;

        let config = self.config_path();
        let backup_dir = self.kube_dir.join("backup");
        files::create_dir_all(&backup_dir)?;
        if files::exists(&config)? {
            let backup = backup_dir.join(format!("config-{}", backup_stamp()));
            info!(path = %backup, "backing up existing kubeconfig");
            files::write(&backup, &files::read_to_string(&config)?)?;
        }

        info!(path = %config, "merging instance kubeconfig");
        let separator = if cfg!(windows) { ";" } else { ":" };
        let spec = CommandSpec::new(self.kubectl_bin.clone())
            .args(["config", "view", "--flatten"])
            .env("KUBECONFIG", format!("{incoming}{separator}{config}"));
        let output = self.runner.capture(&spec, &CancellationToken::new()).await?;
        if !output.is_success() {
            return Err(KubeconfigError::Kubectl {
                status_text: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            });
        }
        files::write(&config, &output.stdout)?;

        info!(context, "kubeconfig updated; current context switched");
        Ok(config)
    }
}

fn backup_stamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}
