//! OMOPSync CLI: serve the clinical ETL pipeline to an MCP client over stdio,
//! or drive it directly from the terminal.

mod commands;

use clap::Parser;
use omopsync_core::config::LoggingConfig;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// OMOPSync: orchestrate an OMOP CDM ETL pipeline from an MCP client
#[derive(Parser, Debug)]
#[command(name = "omopsync", version, about, long_about = None)]
struct Cli {
    /// Workspace directory; relative paths in the configuration resolve here
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand (defaults to `serve`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve the pipeline tools over MCP on stdin/stdout
    Serve,
    /// Invoke one tool and print its response blocks as JSON
    Call {
        /// Tool name, e.g. `run_etl` or `query_database`
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },
    /// Create the namespaces and run every stage to completion
    Run,
    /// List the available tools
    Tools,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default omopsync.toml into the workspace
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    if let Some(Commands::Config {
        action: ConfigAction::Init,
    }) = &cli.command
    {
        return commands::init_config(&workspace);
    }

    let config = omopsync_core::load_config(Some(&workspace), cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let _guard = init_logging(&config.logging, cli.verbose, cli.quiet);

    // Nothing is served until the configuration is usable.
    if let Err(e) = config.ensure_startable() {
        tracing::error!(error = %e, "Refusing to start");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => commands::serve(config).await,
        Commands::Call { tool, args } => commands::call(config, &tool, args.as_deref()).await,
        Commands::Run => commands::run(config).await,
        Commands::Tools => commands::list_tools(config),
        Commands::Config { action } => match action {
            ConfigAction::Init => commands::init_config(&workspace),
            ConfigAction::Show => commands::show_config(&config),
        },
    }
}

/// Human-readable stderr logging plus a daily JSON log file.
///
/// stdout is reserved for the MCP protocol and tool output.
fn init_logging(logging: &LoggingConfig, verbose: u8, quiet: bool) -> Option<WorkerGuard> {
    let level = match verbose {
        0 if quiet => "error".to_string(),
        0 => logging.level.clone().unwrap_or_else(|| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = if verbose == 0 && !quiet {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level))
    } else {
        EnvFilter::new(&level)
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let log_dir = logging.log_dir.clone().unwrap_or_else(default_log_dir);
    let (json_layer, guard) = match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::daily(&log_dir, "omopsync.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!(
                "Warning: file logging disabled, cannot create {}: {}",
                log_dir.display(),
                e
            );
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

fn default_log_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "omopsync", "omopsync")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| Path::new(".").join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_is_the_default() {
        let cli = Cli::try_parse_from(["omopsync"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.workspace, PathBuf::from("."));
    }

    #[test]
    fn test_call_parses_tool_and_args() {
        let cli = Cli::try_parse_from([
            "omopsync",
            "-vv",
            "call",
            "query_database",
            "--args",
            r#"{"sql":"SELECT 1"}"#,
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Commands::Call { tool, args }) => {
                assert_eq!(tool, "query_database");
                assert_eq!(args.as_deref(), Some(r#"{"sql":"SELECT 1"}"#));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_config_requires_an_action() {
        assert!(Cli::try_parse_from(["omopsync", "config"]).is_err());
        let cli = Cli::try_parse_from(["omopsync", "config", "show"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Config {
                action: ConfigAction::Show
            })
        ));
    }
}
