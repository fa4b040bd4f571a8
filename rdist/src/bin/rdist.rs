use anyhow::{Context, Result, anyhow};
use clap::Parser;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::instrument;

use rdist_tools_rdist::config::{self, FileConfig, Settings};
use rdist_tools_rdist::redrive::{FixedPrompt, Prompt, StdinPrompt};
use rdist_tools_rdist::{BatchPlan, CancellationManager, DispatchSummary, Dispatcher, RetryPolicy};

#[derive(clap::ValueEnum, Copy, Clone, Debug)]
enum AuthArg {
    Key,
    Password,
}

impl From<AuthArg> for remote::AuthMethod {
    fn from(value: AuthArg) -> Self {
        match value {
            AuthArg::Key => remote::AuthMethod::Key,
            AuthArg::Password => remote::AuthMethod::Password,
        }
    }
}

#[derive(clap::ValueEnum, Copy, Clone, Debug)]
enum PasswordArg {
    File,
    Env,
    Interactive,
    Inline,
}

impl From<PasswordArg> for remote::PasswordMethod {
    fn from(value: PasswordArg) -> Self {
        match value {
            PasswordArg::File => remote::PasswordMethod::File,
            PasswordArg::Env => remote::PasswordMethod::Env,
            PasswordArg::Interactive => remote::PasswordMethod::Interactive,
            PasswordArg::Inline => remote::PasswordMethod::Inline,
        }
    }
}

/// Secret command line value; clap stores values that are `Clone`, which `SecretString` is not
#[derive(Clone, Debug)]
struct SecretArg(Arc<secrecy::SecretString>);

fn parse_secret(value: &str) -> Result<SecretArg, std::convert::Infallible> {
    Ok(SecretArg(Arc::new(secrecy::SecretString::new(value.to_string()))))
}

#[derive(Parser, Debug)]
#[command(
    name = "rdist",
    version,
    about = "Push a file or directory tree to many hosts at once over rsync/ssh",
    long_about = "`rdist` pushes one source path to the same destination on many hosts, running a bounded number of transfers at a time, retrying failed ones and offering to redrive the targets that still failed.

Settings are read from the configuration file ($XDG_CONFIG_HOME/rdist/config.toml unless --config is given) and can be overridden on the command line.

EXAMPLES:
    # Push a release directory to two hosts, 8 at a time, with progress
    rdist -H web1 -H deploy@web2:2222 /srv/release/ /opt/app --concurrency 8 --progress

    # Run a transfer defined as [tasks.app] in the configuration file
    rdist --task app --summary

    # Check that authentication works everywhere, without transferring anything
    rdist --hosts-file hosts.txt --test-auth

    # Write a commented configuration template
    rdist --init-config

Exit status is 0 when every target succeeded (after any redrive passes) and 1 otherwise."
)]
struct Args {
    // Targets
    /// Target as [user@]host[:port] (can be specified multiple times)
    #[arg(short = 'H', long = "host", value_name = "TARGET", action = clap::ArgAction::Append, help_heading = "Targets")]
    hosts: Vec<String>,

    /// Read targets from a file, one per line (blank lines and # comments are ignored)
    #[arg(long, value_name = "PATH", help_heading = "Targets")]
    hosts_file: Option<std::path::PathBuf>,

    /// Run the transfer defined as [tasks.NAME] in the configuration file
    #[arg(long, value_name = "NAME", help_heading = "Targets")]
    task: Option<String>,

    /// User for targets that don't specify one (default: $USER)
    #[arg(long, value_name = "USER", help_heading = "Targets")]
    default_user: Option<String>,

    /// Port for targets that don't specify one (default: 22)
    #[arg(long, value_name = "PORT", value_parser = clap::value_parser!(u16).range(1..), help_heading = "Targets")]
    default_port: Option<u16>,

    // Authentication
    /// Authentication method (default: key)
    #[arg(long, value_name = "METHOD", help_heading = "Authentication")]
    auth_method: Option<AuthArg>,

    /// Private key used with --auth-method key
    #[arg(long, value_name = "PATH", help_heading = "Authentication")]
    key_file: Option<std::path::PathBuf>,

    /// How the password is obtained with --auth-method password (default: interactive)
    #[arg(long, value_name = "METHOD", help_heading = "Authentication")]
    password_method: Option<PasswordArg>,

    /// Password file path (file), variable name (env) or the password itself (inline)
    ///
    /// Inline passwords given on the command line are visible to other users in the process list,
    /// prefer `file` or `env`.
    #[arg(long, value_name = "SOURCE", value_parser = parse_secret, help_heading = "Authentication")]
    password_source: Option<SecretArg>,

    // Transfer options
    /// Remove files on the targets that don't exist in the source (rsync --delete)
    #[arg(long, help_heading = "Transfer options")]
    delete_extraneous: bool,

    /// Compress data during the transfer
    #[arg(short = 'z', long, help_heading = "Transfer options")]
    compress: bool,

    /// Maximum number of transfers running at the same time (default: 4)
    #[arg(long, value_name = "N", value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..), help_heading = "Transfer options")]
    concurrency: Option<usize>,

    /// SSH connect timeout in seconds (default: 10)
    #[arg(long, value_name = "SECONDS", help_heading = "Transfer options")]
    connect_timeout_sec: Option<u64>,

    /// Time limit for one transfer attempt in seconds (default: 300)
    #[arg(long, value_name = "SECONDS", help_heading = "Transfer options")]
    transfer_timeout_sec: Option<u64>,

    /// Attempts per target before it is reported as failed (default: 3)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..), help_heading = "Transfer options")]
    max_attempts: Option<u32>,

    /// Delay between attempts in seconds (default: 5)
    #[arg(long, value_name = "SECONDS", help_heading = "Transfer options")]
    retry_delay_sec: Option<u64>,

    /// On interrupt, time given to running transfers to stop before they are killed (default: 3)
    #[arg(long, value_name = "SECONDS", help_heading = "Transfer options")]
    cancel_grace_sec: Option<u64>,

    // Redrive
    /// Redrive failed targets without asking
    #[arg(long, conflicts_with = "no_redrive", help_heading = "Redrive")]
    redrive: bool,

    /// Never offer to redrive failed targets
    ///
    /// Also the behavior when stdin is not a terminal.
    #[arg(long, help_heading = "Redrive")]
    no_redrive: bool,

    /// Seconds to wait for an answer to the redrive question, no answer means no redrive
    #[arg(
        long,
        default_value = "30",
        value_name = "SECONDS",
        help_heading = "Redrive"
    )]
    redrive_timeout_sec: u64,

    /// Maximum number of redrive passes (default: unlimited)
    #[arg(long, value_name = "N", help_heading = "Redrive")]
    max_redrive_passes: Option<u32>,

    // Modes
    /// Configuration file to use instead of the default location
    #[arg(long, value_name = "PATH", help_heading = "Configuration")]
    config: Option<std::path::PathBuf>,

    /// Write a commented configuration template and exit
    #[arg(long, help_heading = "Configuration")]
    init_config: bool,

    /// Overwrite an existing file with --init-config
    #[arg(long, requires = "init_config", help_heading = "Configuration")]
    force: bool,

    /// Only check that authentication works on every target, transfer nothing
    #[arg(long, help_heading = "Configuration")]
    test_auth: bool,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Write the final report as JSON to this file
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    report_file: Option<std::path::PathBuf>,

    /// Also write DEBUG level logs to <PREFIX>-<timestamp>-<pid>
    #[arg(long, value_name = "PREFIX", help_heading = "Progress & output")]
    debug_log_prefix: Option<String>,

    // Performance & throttling
    /// Maximum number of transfers started per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Local file or directory to push (rsync semantics: a trailing / copies the contents)
    #[arg()]
    source: Option<String>,

    /// Destination path on every target
    #[arg()]
    destination: Option<String>,
}

impl Args {
    /// Command line values as the top configuration layer
    fn overrides(&self, targets: Vec<String>) -> FileConfig {
        FileConfig {
            auth_method: self.auth_method.map(Into::into),
            key_file: self.key_file.clone(),
            password_method: self.password_method.map(Into::into),
            password_source: self
                .password_source
                .as_ref()
                .map(|source| secrecy::SecretString::new(source.0.expose_secret().clone())),
            default_user: self.default_user.clone(),
            default_port: self.default_port,
            concurrency: self.concurrency,
            connect_timeout_sec: self.connect_timeout_sec,
            transfer_timeout_sec: self.transfer_timeout_sec,
            max_attempts: self.max_attempts,
            retry_delay_sec: self.retry_delay_sec,
            delete_extraneous: self.delete_extraneous.then_some(true),
            compress: self.compress.then_some(true),
            cancel_grace_sec: self.cancel_grace_sec,
            source: self.source.clone(),
            destination: self.destination.clone(),
            targets,
            tasks: Default::default(),
        }
    }

    fn prompt(&self) -> Box<dyn Prompt> {
        use std::io::IsTerminal;
        if self.redrive {
            Box::new(FixedPrompt(true))
        } else if self.no_redrive || self.test_auth || !std::io::stdin().is_terminal() {
            Box::new(FixedPrompt(false))
        } else {
            Box::new(StdinPrompt::stdin(std::time::Duration::from_secs(
                self.redrive_timeout_sec,
            )))
        }
    }
}

fn write_report(path: &std::path::Path, summary: &DispatchSummary) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed creating report file {}", path.display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), summary)
        .with_context(|| format!("failed writing report file {}", path.display()))?;
    tracing::info!("Report written to {}", path.display());
    Ok(())
}

#[instrument(skip_all)]
async fn async_main(args: Args) -> Result<DispatchSummary> {
    let file_config = FileConfig::load(args.config.as_deref())?;
    let file_config = match &args.task {
        Some(task) => file_config.with_task(task)?,
        None => file_config,
    };
    let mut cli_targets = args.hosts.clone();
    if let Some(path) = &args.hosts_file {
        cli_targets.extend(remote::target::read_targets_file(path)?);
    }
    let settings = Settings::resolve(
        file_config.merge(args.overrides(cli_targets)),
        !args.test_auth,
    )?;
    let (targets, malformed) =
        remote::parse_targets(&settings.target_descriptors, &settings.defaults);
    for error in &malformed {
        tracing::error!("Skipping target: {}", error);
    }
    if targets.is_empty() {
        return Err(anyhow!("none of the given targets could be parsed"));
    }
    let provider = remote::CredentialProvider::new(settings.credentials);
    // password prompts block on the terminal
    let credentials = tokio::task::spawn_blocking(move || provider.resolve())
        .await
        .context("credential resolution task failed")?
        .context("unusable credentials, no transfer was attempted")?;
    let executor_settings = remote::ExecutorSettings {
        connect_timeout: settings.connect_timeout,
        grace_period: settings.cancel_grace,
        ..Default::default()
    };
    let executor: Arc<dyn remote::Executor>;
    let (spec, policy, timeout) = if args.test_auth {
        executor = Arc::new(remote::ProbeExecutor::new(executor_settings));
        let spec = remote::TransferSpec {
            source_path: String::new(),
            destination_path: String::new(),
            delete_extraneous: false,
            compress: false,
        };
        (
            spec,
            RetryPolicy::new(1, std::time::Duration::ZERO)?,
            settings.connect_timeout.saturating_mul(2),
        )
    } else {
        executor = Arc::new(remote::RsyncExecutor::new(executor_settings));
        let spec = settings
            .transfer
            .ok_or(config::ConfigError::MissingTransferPaths)?;
        if spec.delete_extraneous {
            tracing::warn!(
                "--delete-extraneous is set: files under {} that are not in {} will be removed on every target",
                spec.destination_path,
                spec.source_path
            );
        }
        (
            spec,
            RetryPolicy::new(settings.max_attempts, settings.retry_delay)?,
            settings.transfer_timeout,
        )
    };
    let plan = BatchPlan::new(
        executor,
        Arc::new(spec),
        Arc::new(credentials),
        policy,
        settings.concurrency,
        timeout,
    )?;
    let cancel = CancellationManager::new(settings.cancel_grace);
    cancel.listen()?;
    let prompt = args.prompt();
    let summary = Dispatcher::new(plan, cancel)
        .run(
            &targets,
            prompt.as_ref(),
            args.max_redrive_passes.unwrap_or(u32::MAX),
        )
        .await;
    if let Some(path) = &args.report_file {
        write_report(path, &summary)?;
    }
    if summary.is_success() && malformed.is_empty() {
        return Ok(summary);
    }
    let mut problems = Vec::new();
    if !summary.is_success() {
        problems.push(format!(
            "{} of {} target(s) failed",
            summary.report.failed.len(),
            summary.report.total
        ));
    }
    if !malformed.is_empty() {
        problems.push(format!(
            "{} target descriptor(s) could not be parsed",
            malformed.len()
        ));
    }
    Err(anyhow!("rdist: {}\n\n{}", problems.join(", "), &summary))
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.init_config {
        let path = match &args.config {
            Some(path) => path.clone(),
            None => config::default_path()?,
        };
        config::write_template(&path, args.force)?;
        println!("Wrote configuration template to {}", path.display());
        return Ok(());
    }
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        launch_throttle: args.ops_throttle,
    };
    let tracing = common::TracingConfig {
        debug_log_file: args
            .debug_log_prefix
            .as_deref()
            .map(common::generate_debug_log_filename),
    };
    let progress =
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay.clone(),
            })
        } else {
            None
        };
    let func = || async_main(args);
    let res = common::run(
        progress,
        output,
        runtime,
        throttle,
        tracing,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
