//! Drawlatch command line entrypoint.
//!
//! Exit codes: 0 success, 1 bad config, 2 missing keys, 3 port bind failure.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{run_bootstrap, run_generate_keys, run_serve};

const CONFIG_DIR_ENV: &str = "MCP_SECURE_PROXY_CONFIG_DIR";
const DEFAULT_CONFIG_DIR: &str = ".drawlatch";

#[derive(Debug, Parser)]
#[command(
    name = "drawlatch",
    about = "Secure MCP proxy: encrypted sessions, endpoint allowlists, event ingestors",
    version
)]
enum Cli {
    /// Create the config directory, key directories, and a default config.
    Bootstrap {
        /// Config directory (overrides MCP_SECURE_PROXY_CONFIG_DIR).
        #[arg(long)]
        config_dir: Option<std::path::PathBuf>,
        /// Also generate the remote server's key bundle.
        #[arg(long)]
        include_remote_keys: bool,
    },
    /// Generate an identity key bundle into a directory.
    GenerateKeys {
        dir: std::path::PathBuf,
    },
    /// Run the remote proxy server.
    Serve {
        /// Path to remote.config.json (defaults to <config-dir>/remote.config.json).
        #[arg(long)]
        config: Option<std::path::PathBuf>,
        /// Config directory (overrides MCP_SECURE_PROXY_CONFIG_DIR).
        #[arg(long)]
        config_dir: Option<std::path::PathBuf>,
    },
}

fn resolve_config_dir(flag: Option<std::path::PathBuf>) -> std::path::PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.trim().is_empty() {
            return std::path::PathBuf::from(dir);
        }
    }
    std::path::PathBuf::from(DEFAULT_CONFIG_DIR)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let result = match Cli::parse() {
        Cli::Bootstrap {
            config_dir,
            include_remote_keys,
        } => run_bootstrap(&resolve_config_dir(config_dir), include_remote_keys),
        Cli::GenerateKeys { dir } => run_generate_keys(&dir),
        Cli::Serve { config, config_dir } => {
            let config_path =
                config.unwrap_or_else(|| resolve_config_dir(config_dir).join("remote.config.json"));
            run_serve(&config_path).await
        }
    };

    if let Err(failure) = result {
        eprintln!("drawlatch: {:#}", failure.error);
        std::process::exit(failure.code);
    }
}
