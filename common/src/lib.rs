//! Shared plumbing for the rdist tools
//!
//! - [`run`] builds the tokio runtime, installs the tracing subscriber, drives optional progress
//!   reporting and prints the final summary.
//! - [`progress`] holds the process wide counters that the progress display reads.
//! - [`config`] groups the settings `run` consumes.

use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod config;
pub mod progress;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig, TracingConfig};

static PROGRESS: progress::Progress = progress::Progress::new();

pub fn get_progress() -> &'static progress::Progress {
    &PROGRESS
}

#[derive(Copy, Clone, Debug, Default, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar when stderr is a terminal, text updates otherwise
    #[default]
    #[value(alias = "Auto")]
    Auto,
    /// Animated progress bar
    #[value(alias = "ProgressBar")]
    ProgressBar,
    /// Periodic text updates, appropriate for logging
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

#[derive(Debug, Clone)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    fn resolve(&self) -> anyhow::Result<(bool, std::time::Duration)> {
        use std::io::IsTerminal;
        let bar = match self.progress_type {
            ProgressType::Auto => std::io::stderr().is_terminal(),
            ProgressType::ProgressBar => true,
            ProgressType::TextUpdates => false,
        };
        let delay = match &self.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .map_err(|err| anyhow::anyhow!("invalid --progress-delay {delay:?}: {err}"))?,
            None if bar => std::time::Duration::from_millis(200),
            None => std::time::Duration::from_secs(10),
        };
        Ok((bar, delay))
    }
}

async fn show_progress(bar: bool, delay: std::time::Duration) {
    let progress = get_progress();
    if bar {
        let pbar = indicatif::ProgressBar::new(0);
        pbar.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar()),
        );
        loop {
            pbar.set_length(progress.submitted.get());
            pbar.set_position(progress.resolved());
            pbar.set_message(progress.short_status());
            pbar.tick();
            tokio::time::sleep(delay).await;
        }
    } else {
        let mut printer = progress::ProgressPrinter::new(progress);
        loop {
            tokio::time::sleep(delay).await;
            eprintln!("{}", printer.print());
        }
    }
}

/// Debug log file name: `<prefix>-<timestamp>-<pid>`
pub fn generate_debug_log_filename(prefix: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    format!("{}-{}-{}", prefix, timestamp, std::process::id())
}

fn init_tracing(output: &OutputConfig, tracing_config: &TracingConfig) -> anyhow::Result<()> {
    let stderr_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.log_level()));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);
    let file_layer = match &tracing_config.debug_log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| anyhow::anyhow!("failed to open debug log file {path:?}: {err}"))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

/// Runs `func` on a fresh tokio runtime.
///
/// Returns `None` on failure after logging the error; callers map that to a non-zero exit code.
pub fn run<Fut, Summary>(
    progress_settings: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle: ThrottleConfig,
    tracing_config: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    if let Err(error) = init_tracing(&output, &tracing_config) {
        eprintln!("Failed to initialize logging: {error:#}");
        return None;
    }
    let progress = match progress_settings.as_ref().map(ProgressSettings::resolve) {
        Some(Ok(resolved)) => Some(resolved),
        Some(Err(error)) => {
            tracing::error!("{:#}", error);
            return None;
        }
        None => None,
    };
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            tracing::error!("Failed to build tokio runtime: {:#}", error);
            return None;
        }
    };
    let res = tokio_runtime.block_on(async move {
        // make elapsed time relative to the start of the run
        get_progress().get_duration();
        if throttle.launch_throttle > 0 {
            throttle::init_launch_tokens(throttle.launch_throttle);
            tokio::spawn(throttle::run_launch_replenish_thread(
                throttle.launch_throttle,
                std::time::Duration::from_secs(1),
            ));
        }
        let progress_task = progress.map(|(bar, delay)| tokio::spawn(show_progress(bar, delay)));
        let res = func().await;
        if let Some(task) = progress_task {
            task.abort();
        }
        res
    });
    // a pending operator prompt may still hold a blocking stdin read, don't wait for it
    tokio_runtime.shutdown_background();
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", error);
            None
        }
    }
}
