pub mod models {
    pub mod c8y;
    pub mod weather;
}

pub mod client {
    pub mod cumulocity;
    pub mod openweather;
    pub mod rest;
}
pub mod config;
pub mod services {
    #[cfg(test)]
    pub mod fakes;
    pub mod platform;
    pub mod resolver;
    pub mod scheduler;
    pub mod sync;
}

use crate::client::cumulocity::CumulocityClient;
use crate::client::openweather::OpenWeatherClient;
use crate::config::{Config, EnvSource};
use crate::services::platform::{Platform, SubscriptionRegistry, WeatherProvider};
use crate::services::scheduler::{Cadence, Fanout, Scheduler};
use crate::services::sync::SyncJob;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;

pub fn run(cfg: Config) -> Result<(), String> {
    info!(
        "Config loaded (c8y={}, bootstrap_tenant={}, interval={}s, initial_delay={}s, cycle_timeout={}s, request_timeout={}s)",
        cfg.c8y_base_url,
        cfg.bootstrap.tenant,
        cfg.interval.as_secs(),
        cfg.initial_delay.as_secs(),
        cfg.cycle_timeout.as_secs(),
        cfg.request_timeout.as_secs()
    );

    let c8y = Arc::new(CumulocityClient::new(
        &cfg.c8y_base_url,
        cfg.bootstrap.clone(),
        cfg.request_timeout,
    ));
    let weather = Arc::new(OpenWeatherClient::new(&cfg.openweather_base_url, cfg.request_timeout));

    let job = SyncJob::new(
        Arc::clone(&c8y) as Arc<dyn Platform>,
        weather as Arc<dyn WeatherProvider>,
    );
    let cadence = Cadence {
        initial_delay: cfg.initial_delay,
        interval: cfg.interval,
        cycle_timeout: cfg.cycle_timeout,
    };
    let fanout = Fanout::new(Arc::new(job), c8y as Arc<dyn SubscriptionRegistry>, cadence);

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping scheduler");
        let _ = shutdown_tx.send(());
    })
    .map_err(|e| format!("installing signal handler failed: {}", e))?;

    let scheduler = Scheduler::start(fanout).map_err(|e| format!("starting scheduler failed: {}", e))?;

    // Block until a signal arrives; a dropped sender also means shutdown.
    let _ = shutdown_rx.recv();
    scheduler.stop();
    Ok(())
}

fn env_file_from_cli() -> Result<Option<PathBuf>, String> {
    let mut args = std::env::args().skip(1);
    let mut env_file = None;
    while let Some(arg) = args.next() {
        let path = if arg == "--env-file" {
            args.next()
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?
        } else if let Some(p) = arg.strip_prefix("--env-file=") {
            p.to_string()
        } else {
            return Err(format!("unrecognised argument: {}", arg));
        };
        if path.is_empty() {
            return Err("`--env-file` requires a path argument".to_string());
        }
        if env_file.replace(PathBuf::from(path)).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(env_file)
}

fn load_env() -> Result<(EnvSource, Option<PathBuf>), String> {
    if let Some(path) = env_file_from_cli()? {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        return Ok((EnvSource::with_file(&path)?, Some(path)));
    }
    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if default_path.is_file() {
        Ok((EnvSource::with_file(&default_path)?, Some(default_path)))
    } else {
        Ok((EnvSource::process_only(), None))
    }
}

fn main() {
    let (env, env_path) = match load_env() {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after the env file so RUST_LOG from .env is respected.
    let filter = env.get("RUST_LOG").unwrap_or_else(|| "info".to_string());
    env_logger::Builder::new()
        .parse_filters(&filter)
        .format_timestamp_secs()
        .init();

    if let Some(path) = env_path {
        info!("Environment loaded from {}", path.display());
    }
    info!(
        "weather-device-sync {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );

    let result = Config::from_env(&env).and_then(run);
    if let Err(e) = result {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
