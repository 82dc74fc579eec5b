use clap::{Arg, ArgMatches, Command};
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use test_tracking_system_rs::server::{routes, AppContext};
use test_tracking_system_rs::store::{MemoryStore, TestDataStore};
use test_tracking_system_rs::types::ServerConfig;
use test_tracking_system_rs::{NotificationHub, TaskQueue};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application configuration that can be loaded from file or CLI args
#[derive(Debug, Deserialize)]
struct AppConfig {
    #[serde(flatten)]
    server: ServerConfig,

    #[serde(default = "default_log_level")]
    log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = create_cli().get_matches();
    let config = load_configuration(&matches)?;
    setup_logging(&config.log_level)?;
    print_system_info(&config);

    // Composition root: every service is constructed here and handed down
    // by reference; nothing lives in a global.
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(NotificationHub::new());
    let queue = Arc::new(TaskQueue::new());
    queue.start(config.server.num_workers).await?;

    let store_handle: Arc<dyn TestDataStore> = store;
    let ctx = AppContext {
        queue: Arc::clone(&queue),
        hub,
        store: store_handle,
    };

    let addr: SocketAddr = ([127, 0, 0, 1], config.server.port).into();
    let (bound, server) =
        warp::serve(routes(ctx)).bind_with_graceful_shutdown(addr, wait_for_shutdown_signal());

    info!(
        "Test tracking system listening on {} with {} workers",
        bound, config.server.num_workers
    );
    print_usage_instructions(&config);

    server.await;

    info!("Shutdown signal received, stopping workers...");
    queue.stop().await;
    info!("Test tracking system shutdown complete");

    Ok(())
}

/// Create command line interface
fn create_cli() -> Command {
    Command::new("test-tracker")
        .about("QA test tracking backend with background import processing")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("NUM")
                .help("Number of import workers (default: 3, max: 50)")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("NUM")
                .help("HTTP port (default: 8000)")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (JSON/TOML)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (error, warn, info, debug, trace)")
                .default_value("info"),
        )
}

/// Load configuration from file and CLI arguments
fn load_configuration(matches: &ArgMatches) -> Result<AppConfig, ConfigError> {
    let mut config_builder = Config::builder();

    if let Some(config_path) = matches.get_one::<String>("config") {
        let path = PathBuf::from(config_path);
        if path.exists() {
            config_builder = config_builder.add_source(File::from(path));
        } else {
            warn!("Config file not found: {}", config_path);
        }
    } else {
        for config_file in &["config.toml", "config.json"] {
            let path = PathBuf::from(config_file);
            if path.exists() {
                config_builder = config_builder.add_source(File::from(path));
                break;
            }
        }
    }

    // Override with command line arguments
    if let Some(&workers) = matches.get_one::<usize>("workers") {
        config_builder = config_builder.set_override("num_workers", workers as i64)?;
    }

    if let Some(&port) = matches.get_one::<u16>("port") {
        config_builder = config_builder.set_override("port", port as i64)?;
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config_builder = config_builder.set_override("log_level", log_level.as_str())?;
    }

    let config = config_builder.build()?.try_deserialize::<AppConfig>()?;

    config.server.validate().map_err(|e| {
        ConfigError::Message(format!("Configuration validation failed: {}", e))
    })?;

    Ok(config)
}

/// Setup logging based on configuration
fn setup_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("test_tracking_system_rs={},warp=info", level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    Ok(())
}

/// Print system information and configuration
fn print_system_info(config: &AppConfig) {
    println!("=== Test Tracking System ===");
    println!("Configuration:");
    println!("  Import workers: {}", config.server.num_workers);
    println!("  HTTP port: {}", config.server.port);
    println!("  Log level: {}", config.log_level);
    println!();

    println!("Endpoints:");
    println!("  API Base: http://127.0.0.1:{}", config.server.port);
    println!("  Health: GET /health");
    println!("  Upload results: POST /api/runs/upload?filename=<name>.json&client_id=<id>");
    println!("  Get run: GET /api/runs/{{id}}");
    println!("  Task status: GET /api/tasks/{{id}}");
    println!("  List tasks: GET /api/tasks");
    println!("  Notifications: GET /api/notifications?client_id=<id>");
    println!("  Mark read: POST /api/notifications/{{id}}/read?client_id=<id>");
    println!("  Live events: ws://127.0.0.1:{}/api/ws/{{client_id}}", config.server.port);
    println!();
}

/// Print usage instructions after startup
fn print_usage_instructions(config: &AppConfig) {
    println!("Upload workflow:");
    println!("  1. POST a JSON result file -> task id, STATUS: pending");
    println!("  2. A worker imports suites, cases and results -> STATUS: running");
    println!("  3. Poll the task or listen on the WebSocket -> STATUS: completed|failed");
    println!();

    println!("Quick Test Commands:");
    println!("# 1. Upload a result file");
    println!(
        r#"curl -X POST "http://localhost:{}/api/runs/upload?filename=results.json&client_id=demo" \
  -H "Content-Type: application/json" \
  --data-binary @results.json"#,
        config.server.port
    );
    println!();

    println!("# 2. Check task status (use the returned task_id)");
    println!(
        "curl http://localhost:{}/api/tasks/<task_id>",
        config.server.port
    );
    println!();

    println!("# 3. Fetch notifications");
    println!(
        "curl \"http://localhost:{}/api/notifications?client_id=demo\"",
        config.server.port
    );
    println!();

    println!("Press Ctrl+C to stop the system");
}

/// Wait for shutdown signals
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.num_workers, 3);
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_cli_creation() {
        let cli = create_cli();
        assert_eq!(cli.get_name(), "test-tracker");

        let args: Vec<_> = cli.get_arguments().map(|a| a.get_id()).collect();
        assert!(args.contains(&&clap::Id::from("workers")));
        assert!(args.contains(&&clap::Id::from("port")));
        assert!(args.contains(&&clap::Id::from("config")));
        assert!(args.contains(&&clap::Id::from("log-level")));
    }
}
