//! SignCTRL daemon binary.

use clap::{Parser, Subcommand};
use signctrl::config::{self, Config};
use signctrl::{BackendClient, ConnKey, RankCounter, RankedHandler, ServiceSettings, SignCtrl};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// High-availability signing controller for validators.
#[derive(Parser, Debug)]
#[command(name = "signctrl")]
#[command(version)]
struct Args {
    /// Configuration directory (or use SIGNCTRL_CONFIG_DIR env var)
    #[arg(long, global = true, env = config::CONFIG_DIR_ENV)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a default config.toml and a fresh conn.key
    Init,
    /// Run SignCTRL until it has to shut down
    Start,
}

fn main() {
    let args = Args::parse();
    let config_dir = args.config_dir.unwrap_or_else(config::config_dir);

    match args.command {
        Command::Init => {
            init_logging("info");
            if let Err(e) = init(&config_dir) {
                error!("Failed to initialize {:?}: {}", config_dir, e);
                std::process::exit(1);
            }
        }
        Command::Start => start(&config_dir),
    }
}

fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn init(config_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if Config::path(config_dir).exists() {
        info!("Keeping existing {:?}", Config::path(config_dir));
    } else {
        Config::default().save(config_dir)?;
        info!("Wrote default config to {:?}", Config::path(config_dir));
    }

    if ConnKey::path(config_dir).exists() {
        info!("Keeping existing {:?}", ConnKey::path(config_dir));
    } else {
        let key = ConnKey::generate();
        key.save(config_dir)?;
        info!(
            "Generated connection key {} at {:?}",
            key.fingerprint(),
            ConnKey::path(config_dir)
        );
    }

    Ok(())
}

fn start(config_dir: &Path) {
    let config = match Config::load(config_dir) {
        Ok(config) => config,
        Err(e) => {
            init_logging("info");
            error!("Failed to load config from {:?}: {}", config_dir, e);
            std::process::exit(1);
        }
    };
    init_logging(&config.init.log_level);

    info!("Config directory: {:?}", config_dir);
    info!("Validator: {}", config.init.validator_laddr);
    info!("Backend socket: {:?}", config.backend.socket_path);
    info!(
        "Threshold: {}, retry dial after: {}",
        config.init.threshold,
        humantime::format_duration(config.init.retry_dial_after)
    );

    let counter = match RankCounter::new(config.init.threshold, config.init.rank) {
        Ok(counter) => counter,
        Err(e) => {
            error!("Invalid rank settings: {}", e);
            std::process::exit(1);
        }
    };

    let settings = match ServiceSettings::from_config(&config, config_dir) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid config: {}", e);
            std::process::exit(1);
        }
    };

    let backend = BackendClient::new(&config.backend.socket_path);
    if let Err(e) = backend.ping() {
        error!(
            "Backend at {:?} is not reachable yet: {}",
            backend.socket_path(),
            e
        );
    }

    let service = SignCtrl::new(settings, counter, RankedHandler::new(backend.clone(), backend));
    if let Err(e) = service.start() {
        error!("Failed to start SignCTRL: {}", e);
        std::process::exit(1);
    }

    service.wait();

    if service.stopped_on_fatal() {
        error!(
            "SignCTRL shut down at height {} (rank: {})",
            service.current_height(),
            service.rank()
        );
        std::process::exit(1);
    }
    info!("SignCTRL stopped");
}
