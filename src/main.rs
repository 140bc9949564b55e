use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use research_crew::api::{self, AppState};
use research_crew::config::{Config, ModelType};
use research_crew::llm::{LlmClient, OpenAiCompatibleClient, ScriptedClient};
use research_crew::store::TaskStore;

fn init_tracing() {
    // RUST_LOG wins; LOG_LEVEL is the simpler knob.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(format!("research_crew={level},tower_http={level},warn"))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_gateway(config: &Config) -> anyhow::Result<Arc<dyn LlmClient>> {
    let client: Arc<dyn LlmClient> = match config.model_type {
        ModelType::Ollama => Arc::new(OpenAiCompatibleClient::new(
            "ollama",
            &config.ollama_base_url,
            None,
        )?),
        ModelType::OpenAi => Arc::new(OpenAiCompatibleClient::new(
            "openai",
            &config.openai_base_url,
            config.openai_api_key.clone(),
        )?),
        ModelType::Scripted => Arc::new(ScriptedClient::demo()),
    };
    Ok(client)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env().context("invalid configuration")?;
    let addr = config.bind_addr()?;

    let store = TaskStore::open(&config.database_path).with_context(|| {
        format!("failed to open database {}", config.database_path.display())
    })?;
    let llm = build_gateway(&config)?;

    tracing::info!(
        model_type = ?config.model_type,
        model = %config.model_name,
        gateway = config.gateway_url().unwrap_or("offline"),
        cache = ?config.cache_backend,
        workers = config.queue_workers,
        "Starting research-crew"
    );

    let state = Arc::new(AppState::new(config, store, llm));
    let queue = Arc::clone(&state.queue);
    queue.recover().await.context("startup recovery failed")?;
    queue.start();

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown requested");
        signal.cancel();
    });

    api::serve(state, addr, shutdown).await?;
    queue.shutdown().await;
    Ok(())
}
