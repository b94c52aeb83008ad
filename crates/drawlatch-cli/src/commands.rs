//! Command implementations and exit-code mapping.

use std::path::Path;

use anyhow::Context;
use serde_json::json;

use drawlatch_config::load_remote_config;
use drawlatch_core::{write_text_atomic, write_text_atomic_with_mode};
use drawlatch_crypto::{generate_key_bundle, load_key_bundle, save_key_bundle};
use drawlatch_server::{run_remote_server, ServerPaths};

pub const EXIT_BAD_CONFIG: i32 = 1;
pub const EXIT_MISSING_KEYS: i32 = 2;
pub const EXIT_PORT_BIND: i32 = 3;

const ENV_FILE_MODE: u32 = 0o600;

pub struct CliFailure {
    pub code: i32,
    pub error: anyhow::Error,
}

impl CliFailure {
    fn new(code: i32, error: anyhow::Error) -> Self {
        Self { code, error }
    }
}

pub fn run_bootstrap(config_dir: &Path, include_remote_keys: bool) -> Result<(), CliFailure> {
    bootstrap_inner(config_dir, include_remote_keys)
        .map_err(|error| CliFailure::new(EXIT_BAD_CONFIG, error))
}

fn bootstrap_inner(config_dir: &Path, include_remote_keys: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("failed to create {}", config_dir.display()))?;
    let keys_dir = config_dir.join("keys");
    let server_keys_dir = keys_dir.join("server");
    let peers_dir = keys_dir.join("callers");
    std::fs::create_dir_all(&peers_dir)
        .with_context(|| format!("failed to create {}", peers_dir.display()))?;

    if include_remote_keys {
        if server_keys_dir.join("signing.key").exists() {
            println!("bootstrap: server keys already present, leaving them untouched");
        } else {
            let bundle = generate_key_bundle();
            save_key_bundle(&bundle, &server_keys_dir)?;
            println!("bootstrap: generated server keys fingerprint={}", bundle.fingerprint());
        }
    }

    let config_path = config_dir.join("remote.config.json");
    if config_path.exists() {
        println!(
            "bootstrap: {} already exists, leaving it untouched",
            config_path.display()
        );
    } else {
        let default_config = json!({
            "host": "127.0.0.1",
            "port": 8787,
            "localKeysDir": server_keys_dir,
            "callers": {},
            "connectors": [],
            "rateLimitPerMinute": 60,
        });
        let mut payload = serde_json::to_string_pretty(&default_config)
            .context("failed to encode default config")?;
        payload.push('\n');
        write_text_atomic(&config_path, &payload)?;
        println!("bootstrap: wrote {}", config_path.display());
    }

    let env_path = config_dir.join(".env");
    if !env_path.exists() {
        write_text_atomic_with_mode(&env_path, "", ENV_FILE_MODE)?;
        println!("bootstrap: wrote {}", env_path.display());
    }
    Ok(())
}

pub fn run_generate_keys(dir: &Path) -> Result<(), CliFailure> {
    let bundle = generate_key_bundle();
    save_key_bundle(&bundle, dir).map_err(|error| CliFailure::new(EXIT_MISSING_KEYS, error))?;
    println!(
        "generated key bundle: dir={} fingerprint={}",
        dir.display(),
        bundle.fingerprint()
    );
    Ok(())
}

pub async fn run_serve(config_path: &Path) -> Result<(), CliFailure> {
    let config = load_remote_config(config_path)
        .map_err(|error| CliFailure::new(EXIT_BAD_CONFIG, error))?;

    // Surface missing keys as their own exit code before binding anything.
    load_key_bundle(&config.local_keys_dir).map_err(|error| {
        CliFailure::new(
            EXIT_MISSING_KEYS,
            error.context(format!(
                "server keys missing under {} (run `drawlatch generate-keys`)",
                config.local_keys_dir.display()
            )),
        )
    })?;

    let config_dir = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let paths = ServerPaths {
        config_path: config_path.to_path_buf(),
        env_path: config_dir.join(".env"),
    };

    run_remote_server(config, paths).await.map_err(|error| {
        let code = if format!("{:#}", error).contains("failed to bind") {
            EXIT_PORT_BIND
        } else {
            EXIT_BAD_CONFIG
        };
        CliFailure::new(code, error)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn functional_bootstrap_lays_out_config_dir() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let config_dir = tempdir.path().join("proxy-home");
        run_bootstrap(&config_dir, true).unwrap_or_else(|failure| panic!("{:#}", failure.error));

        assert!(config_dir.join("remote.config.json").is_file());
        assert!(config_dir.join(".env").is_file());
        assert!(config_dir.join("keys/server/signing.key").is_file());
        assert!(config_dir.join("keys/callers").is_dir());

        let config =
            load_remote_config(&config_dir.join("remote.config.json")).expect("valid default");
        assert_eq!(config.port, 8787);
        assert!(config.callers.is_empty());

        // A second bootstrap leaves everything in place.
        run_bootstrap(&config_dir, true).unwrap_or_else(|failure| panic!("{:#}", failure.error));
    }

    #[test]
    fn unit_generate_keys_round_trips() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let dir = tempdir.path().join("keys/agent");
        run_generate_keys(&dir).unwrap_or_else(|failure| panic!("{:#}", failure.error));
        load_key_bundle(&dir).expect("generated bundle loads");
    }

    #[tokio::test]
    async fn regression_serve_exit_codes_distinguish_failures() {
        let tempdir = tempfile::tempdir().expect("tempdir");

        // Missing config file is a config failure.
        let missing_config = run_serve(&tempdir.path().join("absent.json")).await;
        assert_eq!(missing_config.err().map(|failure| failure.code), Some(EXIT_BAD_CONFIG));

        // Valid config without keys is a key failure.
        let config_path = tempdir.path().join("remote.config.json");
        let config = json!({
            "host": "127.0.0.1",
            "port": 8788,
            "localKeysDir": tempdir.path().join("keys/none"),
        });
        write_text_atomic(&config_path, &config.to_string()).expect("write");
        let missing_keys = run_serve(&config_path).await;
        assert_eq!(missing_keys.err().map(|failure| failure.code), Some(EXIT_MISSING_KEYS));
    }
}
