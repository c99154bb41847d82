use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

use receptionist::config::{AppConfig, IoMode};
use receptionist::console;
use receptionist::db;
use receptionist::handlers;
use receptionist::models::BusinessProfile;
use receptionist::services::ai::groq::GroqProvider;
use receptionist::services::ai::interpret::LlmInterpreter;
use receptionist::services::ai::ollama::OllamaProvider;
use receptionist::services::ai::{Interpreter, LlmProvider};
use receptionist::services::audit::SqliteAuditLog;
use receptionist::services::calendar_store::IcsCalendarStore;
use receptionist::services::clock::SystemClock;
use receptionist::services::conversation::BookingEngine;
use receptionist::services::sessions::SessionRegistry;
use receptionist::services::usage::{LedgerUsageGuard, Unmetered, UsageGuard};
use receptionist::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    let conn = db::init_db(&config.database_url)?;
    let db = Arc::new(Mutex::new(conn));

    let profile = Arc::new(BusinessProfile::load(&config.business_config)?);
    let store = Arc::new(IcsCalendarStore::open(&config.calendar_path, &profile)?);
    tracing::info!(
        shop = %profile.shop_name,
        calendar = %store.path().display(),
        "business profile loaded"
    );

    let clock = Arc::new(SystemClock::new(profile.offset()));

    let llm: Option<Arc<dyn LlmProvider>> = match config.llm_provider.as_str() {
        "groq" => {
            anyhow::ensure!(
                !config.groq_api_key.is_empty(),
                "GROQ_API_KEY must be set when LLM_PROVIDER=groq"
            );
            tracing::info!("using Groq interpreter (model: {})", config.groq_model);
            let provider: Arc<dyn LlmProvider> = Arc::new(GroqProvider::new(
                config.groq_api_key.clone(),
                config.groq_model.clone(),
            ));
            Some(provider)
        }
        "none" => {
            tracing::info!("no interpreter configured, deterministic extraction only");
            None
        }
        _ => {
            tracing::info!("using Ollama interpreter (url: {})", config.ollama_url);
            let provider: Arc<dyn LlmProvider> = Arc::new(OllamaProvider::new(
                config.ollama_url.clone(),
                config.ollama_model.clone(),
            ));
            Some(provider)
        }
    };

    let guard: Arc<dyn UsageGuard> = match llm {
        Some(_) => Arc::new(LedgerUsageGuard::new(
            db.clone(),
            clock.clone(),
            config.usage_limit_dollars,
            config.cost_per_1k_tokens,
        )),
        None => Arc::new(Unmetered),
    };
    let interpreter = llm.map(|llm| Arc::new(LlmInterpreter::new(llm)) as Arc<dyn Interpreter>);

    let engine = Arc::new(BookingEngine::new(
        profile.clone(),
        store.clone(),
        interpreter,
        guard,
        Arc::new(SqliteAuditLog::new(db.clone())),
        clock,
        config.interpret_timeout,
    ));
    let registry = Arc::new(SessionRegistry::new(engine));

    if config.io_mode == IoMode::Console {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        return console::run(registry, stdin, tokio::io::stdout()).await;
    }

    let state = Arc::new(AppState {
        db,
        config: config.clone(),
        profile,
        store,
        registry,
    });
    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
