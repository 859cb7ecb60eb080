use order_bridge::{Bridge, BridgeError, Config, FeedError, init_logger, load_dotenv, print_banner};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Process-wide TLS provider for the websocket
    let _ = rustls::crypto::ring::default_provider().install_default();

    let env_file = load_dotenv();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logger(&config.log_level, config.log_json, config.log_dir.as_deref()) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    print_banner();
    if let Some(path) = env_file {
        tracing::info!(path = %path.display(), "Loaded environment file");
    }

    let bridge = match Bridge::start(config).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    match bridge.run_until_shutdown().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(BridgeError::Feed(e @ FeedError::Auth(_))) => {
            order_bridge::alert!(error = %e, "Credentials rejected, check STORE_API_KEY");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "Order bridge failed");
            ExitCode::FAILURE
        }
    }
}
