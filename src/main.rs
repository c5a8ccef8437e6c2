use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use task_allocator::clock::SystemClock;
use task_allocator::config::AllocatorConfig;
use task_allocator::dispatch::{Advisor, Dispatcher};
use task_allocator::history::StoreHistory;
use task_allocator::llm::{LlmConfig, create_provider};
use task_allocator::store::{LibSqlStore, Store};
use task_allocator::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing, optionally mirrored to a daily rolling file
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match std::env::var("ALLOCATOR_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "allocator.log");
            let (file, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_writer(std::io::stderr.and(file))
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .init();
            None
        }
    };

    let config = AllocatorConfig::from_env().context("invalid allocator configuration")?;

    eprintln!("Task allocator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Advisor: {:?}", config.advisor.strategy);
    eprintln!(
        "   Sweep: every {}s, at-risk horizon {}h, cooldown {}h, overdue grace {}h",
        config.supervisor.interval.as_secs(),
        config.supervisor.at_risk_horizon.num_hours(),
        config.supervisor.reassign_cooldown.num_hours(),
        config.supervisor.overdue_grace.num_hours(),
    );

    // ── LLM provider (optional) ─────────────────────────────────────────
    let llm = match LlmConfig::from_env().context("invalid LLM configuration")? {
        Some(llm_config) => {
            let provider = create_provider(&llm_config)?;
            info!(model = %provider.model_name(), "LLM provider ready");
            Some(provider)
        }
        None => {
            warn!("No LLM API key set, generative advisor unavailable");
            None
        }
    };

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Dispatcher + supervisor ──────────────────────────────────────────
    let dispatcher = Dispatcher::new(Arc::clone(&store))
        .with_advisor(Advisor::from_config(&config.advisor, llm))
        .with_history(
            Arc::new(StoreHistory::new(Arc::clone(&store))),
            config.advisor.history_top_k,
        )
        .with_clock(Arc::new(SystemClock));

    let supervisor = Arc::new(Supervisor::new(Arc::new(dispatcher), config.supervisor));
    let handle = supervisor.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested");
    handle.stop().await;

    Ok(())
}
