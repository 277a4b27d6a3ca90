// PrintHue - Drives a Philips Hue lamp from 3D printer events
// Maps printer lifecycle events to light scenes, with bridge discovery and pairing over a JSON API
use anyhow::Result;
use clap::Parser;
use notify::{Config, Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::{mpsc, Arc};
use tokio::sync::broadcast;

mod bridge;
mod config;
mod discovery;
mod error;
mod httpd;
mod lights;
mod pairing;
mod status;
mod types;

use bridge::{HttpBridge, HueBridge};
use config::{Args, HueConfig};
use httpd::{AppState, SharedState};
use lights::LightController;

/// Watch the config file and push edited rules into the running service
fn spawn_config_watcher(state: SharedState) -> Result<()> {
    let config_path = HueConfig::config_path(None)?;

    std::thread::spawn(move || -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = match RecommendedWatcher::new(tx, Config::default()) {
            Ok(w) => w,
            Err(e) => {
                log::warn!("Config watcher unavailable: {}", e);
                return Ok(());
            }
        };

        if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
            log::warn!("Cannot watch {}: {}", config_path.display(), e);
            return Ok(());
        }

        loop {
            match rx.recv() {
                Ok(Ok(NotifyEvent { kind, .. })) => {
                    if matches!(kind, notify::EventKind::Modify(_)) {
                        match HueConfig::load() {
                            Ok(config) => {
                                log::info!("Config file changed, reloading rules");
                                state.reload(config);
                            }
                            // Editors often write in several steps, the next event will catch up
                            Err(e) => log::debug!("Ignoring unreadable config: {}", e),
                        }
                    }
                }
                Err(_) => break,
                _ => {}
            }
        }
        Ok(())
    });

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    println!("\n🛑 Shutting down...");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    // Set global config path immediately (before any config loads)
    HueConfig::set_config_path(args.cfg.clone());

    let config_path = HueConfig::config_path(None)?;
    let config_file_exists = config_path.exists();

    let mut config = if config_file_exists {
        match HueConfig::load() {
            Ok(c) => c,
            Err(e) => {
                eprintln!("\n❌ Failed to load config file: {}", e);
                eprintln!("Config file: {}", config_path.display());
                eprintln!("\nPlease fix the config file or delete it to regenerate with defaults.");
                return Err(e);
            }
        }
    } else {
        // First run: defaults plus the example rules
        let mut default_config = HueConfig::default();
        default_config.config_path = Some(config_path.clone());
        default_config.migrate();
        default_config
    };

    let args_provided = config.merge_with_args(&args);
    config.sanitize();

    // Save config ONLY if it is new or command-line args changed it
    if !config_file_exists || args_provided {
        config.save()?;
    }

    println!("Using config file: {}", config_path.display());
    if config.bridge_addr.is_empty() {
        println!("No bridge configured yet, discover and pair one through the API");
    } else if config.husername.is_empty() {
        println!("Bridge {} is not paired yet, press its link button and pair through the API", config.bridge_addr);
    } else {
        println!("✓ Bridge: {}", config.bridge_addr);
    }
    println!("✓ Rules: {}", config.status_dict.events().join(", "));

    let bridge: Arc<dyn HueBridge> = Arc::new(HttpBridge::new(&config.discovery_url, &config.device_type)?);
    let lights = Arc::new(LightController::new(Arc::clone(&bridge), config.light_settings()));

    let (events_tx, _events_rx) = broadcast::channel(100);
    let state: SharedState = Arc::new(AppState::new(config.clone(), bridge, Arc::clone(&lights), events_tx));

    spawn_config_watcher(Arc::clone(&state))?;

    lights.on_startup(config.on_on_startup, &config.on_on_startup_event);

    httpd::run_http_server(config.httpd_ip.clone(), config.httpd_port, Arc::clone(&state), shutdown_signal()).await?;

    // Use the settings as they are now, the file may have changed since startup
    let config = state.config();
    if let Err(e) = lights.on_shutdown(config.off_on_shutdown).await {
        log::warn!("Could not switch the lamp off: {}", e);
    }
    println!("Goodbye!");

    Ok(())
}
