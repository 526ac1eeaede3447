use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voice_banking_orchestrator::{
    accounts::{populate_demo_data, AccountStore, InMemoryAccountStore, PostgresAccountStore},
    api::{start_server, ApiState},
    config::OrchestratorConfig,
    intent::{GeminiResolver, IntentResolver, KeywordResolver},
    notify::{LogNotifier, MailApiNotifier, OtpNotifier},
    orchestrator::DialogueOrchestrator,
    renderer::{GeminiRenderer, ResponseRenderer, TemplateRenderer},
    session::{InMemorySessionStore, PostgresSessionStore, SessionStore},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = OrchestratorConfig::from_env();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "3000".to_string())
        .parse()?;

    info!("🚀 Voice Banking Orchestrator - API Server");
    info!("📍 Port: {}", api_port);

    // Stores: Postgres when a database is configured, in-memory otherwise.
    // A configured database that cannot be reached fails startup.
    let database_url = std::env::var("DATABASE_URL")
        .or_else(|_| std::env::var("POSTGRES_URL"))
        .ok();
    let (sessions, accounts): (Arc<dyn SessionStore>, Arc<dyn AccountStore>) = match database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(5).connect(&url).await?;
            info!("✅ Connected to Postgres");
            (
                Arc::new(PostgresSessionStore::new(pool.clone())),
                Arc::new(PostgresAccountStore::new(pool)),
            )
        }
        None => {
            warn!("⚠️  DATABASE_URL not set, using in-memory stores");
            let accounts = Arc::new(InMemoryAccountStore::new());
            populate_demo_data(accounts.as_ref(), &config.user_id, &config.currency, 10).await?;
            (Arc::new(InMemorySessionStore::new()), accounts)
        }
    };

    // NLU and speech: Gemini when a key is present, deterministic fallbacks
    // otherwise.
    let gemini_api_key = std::env::var("GEMINI_API_KEY")
        .ok()
        .filter(|key| !key.trim().is_empty());
    let (resolver, renderer): (Arc<dyn IntentResolver>, Arc<dyn ResponseRenderer>) =
        match gemini_api_key {
            Some(key) => {
                info!("✅ Gemini NLU and response renderer configured");
                (
                    Arc::new(GeminiResolver::new(key.clone())),
                    Arc::new(GeminiRenderer::new(key)),
                )
            }
            None => {
                warn!("⚠️  GEMINI_API_KEY not set, using keyword NLU and template responses");
                (Arc::new(KeywordResolver), Arc::new(TemplateRenderer))
            }
        };

    let notifier: Arc<dyn OtpNotifier> = match MailApiNotifier::from_env() {
        Some(mailer) => {
            info!("✅ Mail relay configured for OTP delivery");
            Arc::new(mailer)
        }
        None => {
            warn!("⚠️  MAIL_API_URL not set, OTP codes go to the log only");
            Arc::new(LogNotifier)
        }
    };

    // Create orchestrator
    let orchestrator = Arc::new(DialogueOrchestrator::new(
        sessions,
        accounts.clone(),
        resolver,
        renderer,
        notifier,
        config.clone(),
    ));

    info!("✅ Orchestrator initialized");
    info!("📡 Starting API server...");

    // Start API server
    let state = ApiState {
        orchestrator,
        accounts,
        config,
    };
    start_server(state, api_port).await?;

    Ok(())
}
