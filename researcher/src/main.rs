use researcher::{
    assistant::configuration::ChatTransport, init, server::run_server, telegram::run_telegram,
    Configuration,
};

#[tokio::main]
async fn main() {
    init();
    tracing::info!("Starting application...");

    let config = match Configuration::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(transport = ?config.transport, mode = ?config.research_mode, "Successfully loaded configuration");

    let result = match config.transport {
        ChatTransport::Telegram => run_telegram(config).await,
        ChatTransport::Http => run_server(config).await,
    };

    if let Err(e) = result {
        tracing::error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}
