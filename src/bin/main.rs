use std::sync::Arc;
use tracing::info;
use voice_banking_orchestrator::{
    accounts::{populate_demo_data, AccountStore, InMemoryAccountStore},
    config::OrchestratorConfig,
    intent::KeywordResolver,
    models::{PendingAction, TurnRequest},
    notify::LogNotifier,
    orchestrator::DialogueOrchestrator,
    renderer::TemplateRenderer,
    session::{InMemorySessionStore, SessionStore},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Voice Banking Orchestrator starting");

    // Create components
    let config = OrchestratorConfig::default();
    let sessions = Arc::new(InMemorySessionStore::new());
    let accounts = Arc::new(InMemoryAccountStore::new());
    populate_demo_data(accounts.as_ref(), &config.user_id, &config.currency, 10).await?;

    // Offline wiring: keyword NLU, template speech, codes in the log.
    let orchestrator = DialogueOrchestrator::new(
        sessions.clone(),
        accounts.clone(),
        Arc::new(KeywordResolver),
        Arc::new(TemplateRenderer),
        Arc::new(LogNotifier),
        config.clone(),
    );

    let session_id = "demo-session";
    println!("\n=== DEMO CONVERSATION ===");

    for utterance in [
        "Hello",
        "What is my balance?",
        "Show my last 5 transactions",
        "Transfer 500 rupees to Vickey",
        "Yes, confirm",
    ] {
        speak(&orchestrator, &config, session_id, utterance).await?;
    }

    // The demo plays the user too: read the delivered code straight out of
    // the staged session and speak it back.
    let session = sessions.get(session_id, &config.user_id).await?;
    let Some(PendingAction::OtpVerification { otp_code, .. }) = session.pending_action else {
        eprintln!("Demo did not reach the OTP stage");
        return Ok(());
    };
    let readback = format!("The code is {}", otp_code);
    speak(&orchestrator, &config, session_id, &readback).await?;

    println!("\n=== CLOSING BALANCES ===");
    for summary in accounts.list_account_summaries(&config.user_id).await? {
        println!(
            "  {} ({}): {} {}",
            summary.account_number, summary.account_type, summary.balance, config.currency
        );
    }

    Ok(())
}

async fn speak(
    orchestrator: &DialogueOrchestrator,
    config: &OrchestratorConfig,
    session_id: &str,
    utterance: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = TurnRequest {
        session_id: session_id.to_string(),
        user_id: config.user_id.clone(),
        utterance: utterance.to_string(),
        language: "en".to_string(),
    };

    println!("\nYou:  {}", utterance);
    match orchestrator.handle_turn(&request).await {
        Ok(reply) => {
            println!("Riya: {}", reply.response_text);
            Ok(())
        }
        Err(e) => {
            eprintln!("Turn failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
