//! Per-instance SSH key pair management.

use camino::Utf8Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::files::{self, FileError};
use crate::process::{CommandRunner, CommandSpec, ProcessError};

/// Private key file name inside the instance SSH directory.
pub const PRIVATE_KEY_FILE: &str = "id_ed25519";

/// Public key file name inside the instance SSH directory.
pub const PUBLIC_KEY_FILE: &str = "id_ed25519.pub";

/// Errors raised while preparing the instance key pair.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum KeyError {
    /// Raised when the SSH directory or key files cannot be accessed.
    #[error("failed to access SSH key material: {0}")]
    File(#[from] FileError),
    /// Raised when `ssh-keygen` exits unsuccessfully.
    #[error("ssh-keygen exited with status {status_text}: {stderr}")]
    Keygen {
        /// Human readable representation of the exit status.
        status_text: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Raised when `ssh-keygen` cannot be run.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Generates an ed25519 key pair in `ssh_dir` unless one already exists,
/// then returns the public key text.
///
/// # Errors
///
/// Returns [`KeyError`] when the directory cannot be created, `ssh-keygen`
/// fails, or the public key cannot be read.
pub async fn ensure_key_pair<R: CommandRunner>(
    runner: &R,
    ssh_dir: &Utf8Path,
    comment: &str,
) -> Result<String, KeyError> {
    files::create_dir_all(ssh_dir)?;
    let private_key = ssh_dir.join(PRIVATE_KEY_FILE);

    if !files::exists(&private_key)? {
        info!(path = %private_key, "generating SSH key pair");
        let spec = CommandSpec::new("ssh-keygen").args([
            "-t",
            "ed25519",
            "-C",
            comment,
            "-f",
            private_key.as_str(),
            "-P",
            "",
        ]);
        let output = runner.capture(&spec, &CancellationToken::new()).await?;
        if !output.is_success() {
            return Err(KeyError::Keygen {
                status_text: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            });
        }
    }

    let public_key = files::read_to_string(&ssh_dir.join(PUBLIC_KEY_FILE))?;
    Ok(public_key.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Reply, ScriptedHost};
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non UTF-8 temp path {}", path.display()));
        (dir, root)
    }

    #[rstest]
    #[tokio::test]
    async fn existing_key_is_reused() {
        let (_guard, root) = scratch();
        files::write(&root.join(PRIVATE_KEY_FILE), "private").unwrap_or_else(|err| panic!("{err}"));
        files::write(&root.join(PUBLIC_KEY_FILE), "ssh-ed25519 AAAA node-1\n")
            .unwrap_or_else(|err| panic!("{err}"));
        let host = ScriptedHost::new();

        let key = ensure_key_pair(&host, &root, "node-1")
            .await
            .unwrap_or_else(|err| panic!("ensure: {err}"));

        assert_eq!(key, "ssh-ed25519 AAAA node-1");
        assert_eq!(host.count("ssh-keygen"), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn missing_key_runs_keygen() {
        let (_guard, root) = scratch();
        let ssh_dir = root.join("node-1");
        // ssh-keygen is scripted, so seed the public half it would produce.
        files::write(&ssh_dir.join(PUBLIC_KEY_FILE), "ssh-ed25519 BBBB node-1")
            .unwrap_or_else(|err| panic!("{err}"));
        let host = ScriptedHost::new();

        ensure_key_pair(&host, &ssh_dir, "node-1")
            .await
            .unwrap_or_else(|err| panic!("ensure: {err}"));

        let expected = format!(
            "ssh-keygen -t ed25519 -C node-1 -f {}/id_ed25519 -P ",
            ssh_dir
        );
        assert_eq!(host.commands(), [expected]);
    }

    #[rstest]
    #[tokio::test]
    async fn keygen_failure_is_reported() {
        let (_guard, root) = scratch();
        let host = ScriptedHost::new();
        host.once("ssh-keygen", Reply::failure(1, "Saving key failed"));

        let err = ensure_key_pair(&host, &root, "node-1")
            .await
            .expect_err("keygen should fail");

        assert!(matches!(err, KeyError::Keygen { .. }));
    }
}
