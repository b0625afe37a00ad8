//! Command-line interface definitions for the `jetski` binary.
//!
//! The parser lives apart from `main.rs` so the build script can reuse it
//! when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `jetski` binary.
#[derive(Debug, Parser)]
#[command(
    name = "jetski",
    about = "Provision local Multipass VMs running k3s cluster nodes",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Launch an instance and bring its k3s node up.
    #[command(name = "create")]
    Create(InstanceArgs),
    /// Start a stopped or suspended instance.
    #[command(name = "start")]
    Start(InstanceArgs),
    /// Stop a running instance.
    #[command(name = "stop")]
    Stop(InstanceArgs),
    /// Suspend a running instance.
    #[command(name = "suspend")]
    Suspend(InstanceArgs),
    /// Delete and purge an instance.
    #[command(name = "destroy")]
    Destroy(ConfirmArgs),
    /// Destroy an instance and create it again.
    #[command(name = "reset")]
    Reset(ConfirmArgs),
    /// Re-apply routes, guest DNS, and kubeconfig for a running server.
    #[command(name = "refresh")]
    Refresh(InstanceArgs),
    /// Apply the configured CPU, memory, and disk to a stopped instance.
    #[command(name = "resize")]
    Resize(InstanceArgs),
    /// Open a shell on, or run a command in, a running instance.
    #[command(name = "ssh")]
    Ssh(SshArgs),
    /// Print the jetski version.
    #[command(name = "version")]
    Version,
}

/// Selects the instance configuration file.
#[derive(Debug, Args)]
pub(crate) struct InstanceArgs {
    /// Instance configuration file (YAML or JSON).
    #[arg(short, long, value_name = "PATH")]
    pub(crate) config: String,
}

/// Arguments for destructive subcommands.
#[derive(Debug, Args)]
pub(crate) struct ConfirmArgs {
    #[command(flatten)]
    pub(crate) instance: InstanceArgs,
    /// Do not ask for confirmation.
    #[arg(short = 'y', long)]
    pub(crate) skip_confirm: bool,
}

/// Arguments for `jetski ssh`.
#[derive(Debug, Args)]
pub(crate) struct SshArgs {
    #[command(flatten)]
    pub(crate) instance: InstanceArgs,
    /// Command to run instead of an interactive shell (use -- to separate
    /// flags).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) command: Vec<String>,
}
