mod config;
mod job;
mod monitor;
mod procstat;
mod progress;
mod ratelimit;
mod render;
mod session;
mod signals;
mod slack;

use clap::Parser;
use config::{ConfigError, Credentials, MonitorConfig, CONFIG_PATH_VAR};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit code for startup failures (bad config, missing credentials).
const STARTUP_ERROR_EXIT_CODE: u8 = 2;

/// Run a command and keep a single Slack message updated with its progress,
/// then ping the invoking user when it ends.
#[derive(Parser, Debug)]
#[command(name = "slack-notify", version, about)]
pub struct Cli {
    /// Config file path (default: $SLACK_JOB_MONITOR_CONFIG, else built-in defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Command to run, split with shell quoting rules
    #[arg(value_name = "COMMAND")]
    command: String,

    /// Arguments; the command runs once per argument
    #[arg(value_name = "ARGUMENT", trailing_var_arg = true, allow_hyphen_values = true)]
    arguments: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            i32::from(STARTUP_ERROR_EXIT_CODE)
        }
    };
    ExitCode::from(u8::try_from(code.clamp(0, 255)).unwrap_or(1))
}

/// Load configuration, then monitor the command. Only startup failures are
/// errors; everything after that is reported through the exit code.
async fn run(cli: Cli) -> Result<i32, StartupError> {
    let shutdown = signals::ShutdownSignals::install();
    let config_path = cli
        .config
        .or_else(|| std::env::var_os(CONFIG_PATH_VAR).map(PathBuf::from));
    let config = MonitorConfig::load(config_path.as_deref())?;
    let credentials = Credentials::from_env()?;
    let command = job::JobCommand::parse(&cli.command)?;

    let settings = config.monitor.settings();
    let client = slack::SlackClient::new(&credentials, &config.slack)?;
    tracing::info!(
        program = command.program(),
        command = %cli.command,
        jobs = cli.arguments.len().max(1),
        poll_interval_secs = settings.poll_interval.as_secs(),
        "slack-notify starting"
    );

    let reporter = monitor::Reporter::new(
        &settings,
        &client,
        procstat::default_probe(),
        render::Identity::current(),
        command.display(&cli.arguments),
        cli.arguments.len(),
    );
    let report = reporter
        .run(&command, &cli.arguments, shutdown.recv())
        .await;
    Ok(report.exit_code)
}

/// Fatal errors raised before monitoring starts.
#[derive(Debug)]
enum StartupError {
    Config(ConfigError),
    Command(job::SpawnError),
    Client(slack::ChatError),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "{e}"),
            StartupError::Command(e) => write!(f, "{e}"),
            StartupError::Client(e) => write!(f, "failed to build slack client: {e}"),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartupError::Config(e) => Some(e),
            StartupError::Command(e) => Some(e),
            StartupError::Client(e) => Some(e),
        }
    }
}

impl From<ConfigError> for StartupError {
    fn from(e: ConfigError) -> Self {
        StartupError::Config(e)
    }
}

impl From<job::SpawnError> for StartupError {
    fn from(e: job::SpawnError) -> Self {
        StartupError::Command(e)
    }
}

impl From<slack::ChatError> for StartupError {
    fn from(e: slack::ChatError) -> Self {
        StartupError::Client(e)
    }
}
