//! keyring-proxy bootstrap
//!
//! Loads configuration and secrets, hardens the process, provisions the
//! wallet when none exists and reports its address. Serving requests is up
//! to the transport embedding [`SigningProxy`].
//!
//! # Usage
//!
//! ```bash
//! KEYSTORE_PASSWORD=... KEYRING_PROXY_SECRET=... keyring-proxy
//!
//! # Or with a config file
//! keyring-proxy --config /etc/keyring-proxy/config.toml
//! ```

use keyring_proxy::config::{
    secret_from_env, Config, ADMIN_SECRET_ENV, KEYSTORE_PASSWORD_ENV, PROXY_SECRET_ENV,
};
use keyring_proxy::errors::{ProxyError, Result};
use keyring_proxy::security::setup_memory_protection;
use keyring_proxy::SigningProxy;
use secrecy::SecretString;
use std::env;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> ExitCode {
    let config_path = config_path_arg();
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("keyring-proxy: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config);

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config) -> Result<()> {
    info!("Starting keyring-proxy v{}", VERSION);

    if let Err(e) = setup_memory_protection(config.security.disable_core_dumps) {
        warn!("Could not set up memory protection: {}", e);
    }

    config.validate()?;
    info!("Configuration loaded");

    let password = required_secret(KEYSTORE_PASSWORD_ENV)?;
    let operational = required_secret(PROXY_SECRET_ENV)?;
    let admin = secret_from_env(ADMIN_SECRET_ENV);
    if admin.is_none() {
        warn!(
            "{} not set, policy administration accepts the operational secret",
            ADMIN_SECRET_ENV
        );
    }

    let proxy = SigningProxy::from_config(config, password, operational, admin)?;

    let custodian = proxy.custodian();
    if !custodian.has_account() {
        info!("No keystore at {:?}, creating wallet", config.storage.keystore_path);
        custodian.create_account()?;
    }

    let address = custodian.get_address()?;
    let bound = proxy.policies().policies_for(&address)?.len();
    info!("Wallet {} ready with {} bound policies", address, bound);
    if bound == 0 {
        warn!("No policies bound to {}, every signing request will be denied", address);
    }

    Ok(())
}

/// `--config <path>` or `--config=<path>`
fn config_path_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

fn required_secret(name: &str) -> Result<SecretString> {
    secret_from_env(name)
        .ok_or_else(|| ProxyError::ConfigError(format!("{} environment variable not set", name)))
}

/// Initialize logging
fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
