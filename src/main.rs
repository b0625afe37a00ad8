//! Binary entry point for the jetski CLI.

use std::io::{self, BufRead, Write};
use std::process;

use camino::Utf8Path;
use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use jetski::config::{ConfigError, InstanceConfig, JetskiConfig};
use jetski::logging;
use jetski::multipass::{Multipass, MultipassError};
use jetski::network::{HostBinder, HostPlatform};
use jetski::process::{ConsoleSink, ProcessCommandRunner};
use jetski::provision::{ProvisionError, ProvisionSettings, Provisioner};

mod cli;

use cli::{Cli, ConfirmArgs, InstanceArgs, SshArgs};

type HostProvisioner = Provisioner<ProcessCommandRunner, HostBinder<ProcessCommandRunner>>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Hypervisor(#[from] MultipassError),
    #[error("{0}")]
    Provision(#[from] ProvisionError),
    #[error("could not read confirmation: {0}")]
    Prompt(String),
    #[error("aborted; instance '{0}' was left untouched")]
    Declined(String),
    #[error("remote command terminated without an exit status")]
    MissingExitCode,
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let cancel = CancellationToken::new();
    forward_interrupts(cancel.clone());

    match cli {
        Cli::Version => {
            writeln!(io::stdout(), "jetski {}", env!("CARGO_PKG_VERSION")).ok();
            Ok(0)
        }
        Cli::Create(args) => {
            let (provisioner, instance) = open(&args).await?;
            provisioner.create(&instance, &cancel).await?;
            Ok(0)
        }
        Cli::Start(args) => {
            let (provisioner, instance) = open(&args).await?;
            provisioner.start(&instance, &cancel).await?;
            Ok(0)
        }
        Cli::Stop(args) => {
            let (provisioner, instance) = open(&args).await?;
            provisioner.stop(&instance, &cancel).await?;
            Ok(0)
        }
        Cli::Suspend(args) => {
            let (provisioner, instance) = open(&args).await?;
            provisioner.suspend(&instance, &cancel).await?;
            Ok(0)
        }
        Cli::Destroy(args) => {
            let (provisioner, instance) = open_confirmed(&args, "destroy").await?;
            provisioner.destroy(&instance, &cancel).await?;
            Ok(0)
        }
        Cli::Reset(args) => {
            let (provisioner, instance) = open_confirmed(&args, "reset").await?;
            provisioner.reset(&instance, &cancel).await?;
            Ok(0)
        }
        Cli::Refresh(args) => {
            let (provisioner, instance) = open(&args).await?;
            provisioner.refresh(&instance, &cancel).await?;
            Ok(0)
        }
        Cli::Resize(args) => {
            let (provisioner, instance) = open(&args).await?;
            provisioner.resize(&instance, &cancel).await?;
            Ok(0)
        }
        Cli::Ssh(SshArgs { instance, command }) => {
            let (provisioner, config) = open(&instance).await?;
            provisioner
                .ssh(&config, &command, &cancel)
                .await?
                .ok_or(CliError::MissingExitCode)
        }
    }
}

/// Cancels `cancel` on the first Ctrl-C so in-flight waits and commands
/// unwind instead of the process dying mid-way.
fn forward_interrupts(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            cancel.cancel();
        }
    });
}

async fn open(args: &InstanceArgs) -> Result<(HostProvisioner, InstanceConfig), CliError> {
    let settings = JetskiConfig::load_without_cli_args()?;
    settings.validate()?;
    let instance = InstanceConfig::load(Utf8Path::new(&args.config))?;

    let runner = ProcessCommandRunner;
    let multipass = Multipass::new(runner.clone(), settings.multipass_bin.clone())
        .with_info_timeout(settings.timings().info_timeout);
    let platform = HostPlatform::from_multipass_binary(&multipass.binary().await?);
    info!(instance = instance.name(), ?platform, "using host network binder");
    let binder = HostBinder::for_platform(platform, runner);

    let provisioner = Provisioner::new(
        multipass,
        binder,
        ProvisionSettings::from(&settings),
        Box::new(ConsoleSink),
    );
    Ok((provisioner, instance))
}

async fn open_confirmed(
    args: &ConfirmArgs,
    action: &str,
) -> Result<(HostProvisioner, InstanceConfig), CliError> {
    let (provisioner, instance) = open(&args.instance).await?;
    if !args.skip_confirm {
        let question = format!("{action} instance '{}'?", instance.name());
        let accepted = confirm(&question, io::stdin().lock(), io::stderr())
            .map_err(|err| CliError::Prompt(err.to_string()))?;
        if !accepted {
            return Err(CliError::Declined(instance.name().to_owned()));
        }
    }
    Ok((provisioner, instance))
}

/// Asks `question` on `output` and reads a yes/no answer from `input`.
/// Anything but `y` or `yes` declines.
fn confirm(question: &str, mut input: impl BufRead, mut output: impl Write) -> io::Result<bool> {
    write!(output, "{question} [y/N] ")?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
