//! Gemini-backed response rendering
//!
//! Gives the dialogue its voice persona. The model only words the outcome;
//! every fact it may state arrives pre-decided in the situation context.

use super::{ResponseRenderer, Situation};
use crate::error::Result;
use crate::gemini::GeminiClient;
use crate::models::TurnMessage;
use async_trait::async_trait;
use serde_json::Value;

/// Messages of history included in the wording prompt.
const HISTORY_WINDOW: usize = 5;

const PERSONA_SYSTEM_PROMPT: &str = r#"You are Riya, the voice assistant of a retail bank, speaking with a customer over audio.

Style rules:
- Reply in the language named in the prompt.
- One or two short sentences. This is read aloud, so no lists, no markdown, no emoji.
- Read amounts naturally (say "five hundred rupees", not "INR 500.00").
- Warm and professional. Never mention being an AI or a language model.

Accuracy rules:
- State only the facts given in the prompt. Never invent balances, names or numbers.
- Never reveal or guess a verification code.
- Follow the situation instruction exactly; it tells you what this reply must accomplish."#;

/// Response renderer backed by the Gemini API.
pub struct GeminiRenderer {
    client: GeminiClient,
}

impl GeminiRenderer {
    pub fn new(api_key: String) -> Self {
        Self {
            client: GeminiClient::new(api_key),
        }
    }
}

#[async_trait]
impl ResponseRenderer for GeminiRenderer {
    async fn render(
        &self,
        situation: Situation,
        language: &str,
        utterance: &str,
        history: &[TurnMessage],
        context: Option<&Value>,
    ) -> Result<String> {
        let prompt = build_prompt(situation, language, utterance, history, context);
        let text = self
            .client
            .generate(PERSONA_SYSTEM_PROMPT, &prompt, 0.7)
            .await?;
        Ok(text.trim().to_string())
    }
}

fn build_prompt(
    situation: Situation,
    language: &str,
    utterance: &str,
    history: &[TurnMessage],
    context: Option<&Value>,
) -> String {
    let facts = context
        .map(|c| c.to_string())
        .unwrap_or_else(|| "{}".to_string());

    format!(
        "Conversation so far:\n{}\n\nLanguage for the reply: {}\nSituation: {}\nInstruction: {}\nFacts (state these accurately): {}\nUser just said: \"{}\"\n\nYour spoken reply:",
        format_history(history),
        language,
        situation.as_tag(),
        situation_guidance(situation),
        facts,
        utterance
    )
}

/// Last few messages as "role: content" lines, oldest first.
fn format_history(history: &[TurnMessage]) -> String {
    if history.is_empty() {
        return "(start of conversation)".to_string();
    }
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    history[start..]
        .iter()
        .map(|message| format!("{}: {}", message.role, message.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn situation_guidance(situation: Situation) -> &'static str {
    match situation {
        Situation::ConfirmTransfer => {
            "Restate the amount, the recipient and the source account, then ask the user to say confirm or cancel."
        }
        Situation::RequestOtp => {
            "Tell the user a six digit code was emailed to them and ask them to read it back. If the facts say delivered is false, apologize that the code could not be sent and ask them to wait a moment for it."
        }
        Situation::ErrorOtpIncorrect => {
            "Tell the user the code did not match and ask them to read it once more."
        }
        Situation::TransferSuccess => {
            "Confirm the transfer completed, restating the amount and the recipient, then offer further help."
        }
        Situation::ErrorInsufficientFunds => {
            "Explain the balance is not sufficient and that the transfer has been cancelled."
        }
        Situation::ActionCancelled => {
            "Acknowledge the cancellation and offer further help."
        }
        Situation::ActionInProgress => {
            "Remind the user an action is waiting on their answer and ask them to respond to it."
        }
        Situation::MissingTransferDetails => {
            "Ask for the missing amount or recipient, giving one short example of a complete request."
        }
        Situation::ErrorNoSavingsAccount => {
            "Explain that no savings account was found to transfer from."
        }
        Situation::ErrorNoAccount => {
            "Explain that no account was found for the user's profile."
        }
        Situation::Greeting => {
            "Greet the user and briefly mention you can check balances, list transactions and transfer money."
        }
        Situation::Fallback => {
            "Say you did not catch a banking request and mention what you can help with."
        }
        Situation::BalanceReport => {
            "State the account's balance from the facts, reading the amount naturally."
        }
        Situation::TransactionsReport => {
            "Summarize the most recent two or three transactions from the facts and say the full list is on screen."
        }
        Situation::ErrorNoTransactions => {
            "Say there are no transactions recorded on that account yet."
        }
        Situation::ClarifyAccount => {
            "Ask which of the user's accounts to use, naming the account types from the facts."
        }
    }
}
