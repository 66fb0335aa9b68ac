use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

mod actuators;
mod config;
mod device_session;
mod sensor_sample;
mod serial_link;
mod session_metrics;
mod web;

use config::Config;
use device_session::DeviceSession;

const CONFIG_PATH: &str = "config.json";

// ========== Logging Setup ==========

fn init_logging(log_config: &config::LogConfig) -> Result<(), Box<dyn Error>> {
    use tracing_appender::rolling;
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    // Create log directory if it doesn't exist
    std::fs::create_dir_all(&log_config.directory)?;

    // Create daily rolling file appender
    let file_appender = rolling::daily(&log_config.directory, &log_config.file_prefix);

    // Build subscriber with both console and file output
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_timer(fmt::time::OffsetTime::local_rfc_3339().unwrap_or_else(|_| {
            fmt::time::OffsetTime::new(
                time::UtcOffset::UTC,
                time::format_description::well_known::Rfc3339,
            )
        }));

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_timer(fmt::time::OffsetTime::local_rfc_3339().unwrap_or_else(|_| {
            fmt::time::OffsetTime::new(
                time::UtcOffset::UTC,
                time::format_description::well_known::Rfc3339,
            )
        }));

    // Parse log level from config
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_config.level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}

// ========== Main Application ==========

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Check for command-line arguments
    let args: Vec<String> = std::env::args().collect();

    // Check for help flag
    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        println!("Greenhouse Bridge");
        println!();
        println!("USAGE:");
        println!("    greenhouse_bridge [OPTIONS]");
        println!();
        println!("OPTIONS:");
        println!("    --validate-config, --validate, -v    Validate configuration and exit");
        println!("    --help, -h                           Show this help message");
        println!();
        println!("Configuration file: config.json (in current directory)");
        std::process::exit(0);
    }

    let validate_only = args.contains(&"--validate-config".to_string())
        || args.contains(&"--validate".to_string())
        || args.contains(&"-v".to_string());

    // Load configuration, creating the default file on first run
    let config = match Config::load_or_create(CONFIG_PATH) {
        Ok(cfg) => {
            if validate_only {
                println!("✓ Configuration validation successful");
                println!("  Serial port: {} @ {} baud", cfg.serial.port, cfg.serial.baud_rate);
                println!("  Mock mode: {}", cfg.mock.enabled);
                println!("  Web server port: {}", cfg.server.port);
                println!("  Log directory: {}", cfg.logging.directory);
                std::process::exit(0);
            }
            cfg
        }
        Err(e) => {
            if validate_only {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
            eprintln!("Warning: Could not load {}: {}", CONFIG_PATH, e);
            eprintln!("Using default configuration");
            Config::default()
        }
    };

    // Initialize logging
    init_logging(&config.logging)?;
    info!("Greenhouse bridge starting...");
    info!(
        "Device configured on {} at {} baud",
        config.serial.port, config.serial.baud_rate
    );

    // The session is constructed once here and shared with the web
    // layer; requests connect it on demand.
    let session = Arc::new(DeviceSession::new(config.serial.baud_rate));

    web::server::start_web_server(
        Arc::clone(&session),
        PathBuf::from(CONFIG_PATH),
        config.server.port,
    )
    .await?;

    // Graceful shutdown: close the serial session before exiting.
    // disconnect() blocks while joining the poll thread, so it runs on
    // the blocking pool.
    let cleanup = Arc::clone(&session);
    tokio::task::spawn_blocking(move || cleanup.disconnect()).await?;
    info!("Greenhouse bridge stopped");
    Ok(())
}
