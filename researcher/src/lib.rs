pub mod assistant;
pub mod server;
pub mod telegram;

pub use assistant::configuration::Configuration;
pub use assistant::controller::{ChatSink, ConversationController};
pub use assistant::graph::ResearchGraph;
pub use assistant::state::{Session, State, UserId};

use std::sync::Arc;
use std::time::Duration;

use assistant::email::PostmarkMailer;
use assistant::llm::Generators;
use assistant::search::{EvidenceFetcher, SearchProvider, SerpProvider, TavilyProvider};
use assistant::store::InMemorySessionStore;
use dotenv::dotenv;
use tracing_subscriber::EnvFilter;

/// How often idle sessions are swept from the store.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Loads `.env` and installs the log subscriber (`RUST_LOG`, default `info`).
pub fn init() {
    dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Wires providers, model clients, mailer and session store into a controller
/// that replies through `sink`.
pub fn build_controller(
    config: &Configuration,
    sink: Arc<dyn ChatSink>,
) -> anyhow::Result<Arc<ConversationController>> {
    let client = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()?;

    let generators = Generators::from_config(config, client.clone())?;

    let providers: Vec<Arc<dyn SearchProvider>> = vec![
        Arc::new(TavilyProvider::new(
            client.clone(),
            config.tavily_api_key.clone(),
            config.tavily_url.clone(),
            config.results_per_provider,
        )),
        Arc::new(SerpProvider::new(
            client.clone(),
            config.serp_api_key.clone(),
            config.serp_url.clone(),
            config.results_per_provider,
        )),
    ];
    let fetcher = Arc::new(EvidenceFetcher::new(providers, config.max_chars_per_source));
    let graph = Arc::new(ResearchGraph::new(generators, fetcher, config.max_searches));

    let mailer = Arc::new(PostmarkMailer::new(
        client,
        config.postmark_token.clone(),
        config.email_from.clone(),
        &config.postmark_url,
    )?);

    Ok(Arc::new(ConversationController::new(
        Arc::new(InMemorySessionStore::new()),
        graph,
        mailer,
        sink,
        config.session_idle_timeout(),
    )))
}
