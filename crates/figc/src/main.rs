//! figc - local package cache for FHIR IG tarballs
//!
//! This is a thin CLI over the figc agent. `ensure` streams the job's
//! events as JSON lines on stdout and ends with `{"path":"..."}`; `--agent`
//! runs only the service until its idle shutdown.

use std::io::Write;
use std::time::Duration;

use clap::{Parser, Subcommand};
use figc_agent::{client, run_service, AgentConfig};
use figc_io::paths::normalize_root;
use tracing_subscriber::EnvFilter;

const DEFAULT_ROOT: &str = "~/.fhir";

/// Local package cache for FHIR IG tarballs
#[derive(Parser, Debug)]
#[command(name = "figc", version)]
struct Cli {
    /// Run only the agent service, blocking until idle shutdown
    #[arg(long)]
    agent: bool,

    /// Cache root directory
    #[arg(long, value_name = "PATH")]
    root: Option<String>,

    /// Base name for the IPC endpoints
    #[arg(long, value_name = "NAME")]
    pipe: Option<String>,

    /// Maximum concurrent downloads
    #[arg(long, value_name = "N")]
    max: Option<usize>,

    /// Ordered, comma-separated registry URLs
    #[arg(long, value_name = "CSV")]
    registries: Option<String>,

    /// Keep package.tgz in the final directory
    #[arg(long)]
    preserve_tar: bool,

    /// HTTP request ceiling in seconds
    #[arg(long, value_name = "SEC")]
    http_timeout: Option<u64>,

    /// Additional resolution attempts on failure
    #[arg(long, value_name = "N")]
    max_retries: Option<u32>,

    /// Base retry delay in seconds
    #[arg(long, value_name = "SEC")]
    retry_delay: Option<f64>,

    /// Log threshold: Debug, Info, Warning, or Error
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ensure an extracted, verified package and print its path
    Ensure { id: String, version: String },
}

enum ConfigError {
    /// Bad flag/environment values; exit 2.
    Usage(String),
    /// Filesystem problems preparing the root; exit 1.
    Root(figc_io::paths::PathError),
}

fn init_tracing(level: &str) {
    // RUST_LOG overrides --log-level; logs go to stderr so stdout stays
    // pure JSON for `ensure`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,figc={level},figc_agent={level},figc_io={level},figc_tarball={level}"
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn tracing_level(cli: &Cli) -> Result<&'static str, String> {
    match cli.log_level.as_deref().map(str::to_ascii_lowercase) {
        None => Ok("info"),
        Some(level) => match level.as_str() {
            "debug" => Ok("debug"),
            "info" => Ok("info"),
            "warning" => Ok("warn"),
            "error" => Ok("error"),
            other => Err(format!(
                "invalid --log-level {other:?}; expected Debug, Info, Warning, or Error"
            )),
        },
    }
}

fn build_config(cli: &Cli) -> Result<AgentConfig, ConfigError> {
    let raw_root = cli
        .root
        .clone()
        .or_else(|| std::env::var("FIGC_ROOT").ok())
        .unwrap_or_else(|| DEFAULT_ROOT.to_string());
    let root = normalize_root(&raw_root).map_err(ConfigError::Root)?;
    let mut config = AgentConfig::for_root(root);

    if let Some(pipe) = cli.pipe.clone().or_else(|| std::env::var("FIGC_PIPE").ok()) {
        config.pipe_base = pipe;
    }

    let registries_csv = cli
        .registries
        .clone()
        .or_else(|| std::env::var("FIGC_REGISTRIES").ok());
    if let Some(csv) = registries_csv {
        let registries: Vec<String> = csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if registries.is_empty() {
            return Err(ConfigError::Usage(
                "--registries must name at least one registry URL".to_string(),
            ));
        }
        config.registries = registries;
    }

    if let Some(max) = cli.max {
        if max == 0 {
            return Err(ConfigError::Usage(
                "--max must be at least 1".to_string(),
            ));
        }
        config.max_concurrent_downloads = max;
    } else if let Ok(value) = std::env::var("FIGC_MAX_DOWNLOADS") {
        config.max_concurrent_downloads = value.parse().map_err(|_| {
            ConfigError::Usage(format!("FIGC_MAX_DOWNLOADS is not a number: {value:?}"))
        })?;
    }

    config.preserve_tarballs = cli.preserve_tar;
    if let Some(secs) = cli.http_timeout {
        config.http_timeout = Duration::from_secs(secs);
    }
    if let Some(retries) = cli.max_retries {
        config.max_retries = retries;
    }
    if let Some(secs) = cli.retry_delay {
        if !secs.is_finite() || secs < 0.0 {
            return Err(ConfigError::Usage(
                "--retry-delay must be a non-negative number of seconds".to_string(),
            ));
        }
        config.retry_delay = Duration::from_secs_f64(secs);
    }

    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let level = match tracing_level(&cli) {
        Ok(level) => level,
        Err(message) => {
            eprintln!("error: {message}");
            return 2;
        }
    };
    init_tracing(level);

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(ConfigError::Usage(message)) => {
            eprintln!("error: {message}");
            return 2;
        }
        Err(ConfigError::Root(err)) => {
            tracing::error!(error = %err, "failed to prepare cache root");
            return 1;
        }
    };

    if cli.agent {
        return match run_service(config).await {
            Ok(true) => 0,
            Ok(false) => 1,
            Err(err) => {
                tracing::error!(error = %err, "agent failed");
                1
            }
        };
    }

    match cli.command {
        Some(Command::Ensure { id, version }) => {
            let mut stdout = std::io::stdout();
            let result = client::ensure_with(config, &id, &version, |event| {
                let _ = stdout.write_all(event.to_line().as_bytes());
                let _ = stdout.flush();
            })
            .await;

            match result {
                Ok(path) => {
                    println!("{}", serde_json::json!({ "path": path }));
                    0
                }
                Err(err) => {
                    tracing::error!(error = %err, "ensure failed");
                    1
                }
            }
        }
        None => {
            eprintln!("error: missing command; try `figc ensure <id> <version>` or `figc --agent`");
            2
        }
    }
}
