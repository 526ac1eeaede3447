//! Response rendering
//!
//! Turns a dialogue outcome into the sentence spoken back to the user. The
//! orchestrator decides WHAT happened (a situation tag plus structured
//! context); renderers only decide how to say it, so a renderer can never
//! change the state machine's course.

use crate::error::Result;
use crate::models::TurnMessage;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

pub mod gemini;

pub use gemini::GeminiRenderer;

//
// ================= Situations =================
//

/// Outcome tags the orchestrator can ask a renderer to voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Situation {
    ConfirmTransfer,
    RequestOtp,
    ErrorOtpIncorrect,
    TransferSuccess,
    ErrorInsufficientFunds,
    ActionCancelled,
    ActionInProgress,
    MissingTransferDetails,
    ErrorNoSavingsAccount,
    ErrorNoAccount,
    Greeting,
    Fallback,
    BalanceReport,
    TransactionsReport,
    ErrorNoTransactions,
    ClarifyAccount,
}

impl Situation {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Situation::ConfirmTransfer => "confirm_transfer",
            Situation::RequestOtp => "request_otp",
            Situation::ErrorOtpIncorrect => "error_otp_incorrect",
            Situation::TransferSuccess => "transfer_success",
            Situation::ErrorInsufficientFunds => "error_insufficient_funds",
            Situation::ActionCancelled => "action_cancelled",
            Situation::ActionInProgress => "action_in_progress",
            Situation::MissingTransferDetails => "missing_transfer_details",
            Situation::ErrorNoSavingsAccount => "error_no_savings_account",
            Situation::ErrorNoAccount => "error_no_account",
            Situation::Greeting => "greeting",
            Situation::Fallback => "fallback",
            Situation::BalanceReport => "balance_report",
            Situation::TransactionsReport => "transactions_report",
            Situation::ErrorNoTransactions => "error_no_transactions",
            Situation::ClarifyAccount => "clarify_account",
        }
    }
}

impl fmt::Display for Situation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_tag())
    }
}

/// Seam for turning an outcome into user-facing text.
#[async_trait]
pub trait ResponseRenderer: Send + Sync {
    /// Produce the reply for one turn. `history` is the session's message
    /// log before this turn; `context` carries the structured facts the
    /// wording must include (amounts, names, balances).
    async fn render(
        &self,
        situation: Situation,
        language: &str,
        utterance: &str,
        history: &[TurnMessage],
        context: Option<&Value>,
    ) -> Result<String>;
}

//
// ================= Template Renderer =================
//

/// Deterministic English renderer used by the demo binary and tests, and as
/// the offline fallback when no LLM is configured. Ignores `language`.
pub struct TemplateRenderer;

#[async_trait]
impl ResponseRenderer for TemplateRenderer {
    async fn render(
        &self,
        situation: Situation,
        _language: &str,
        _utterance: &str,
        _history: &[TurnMessage],
        context: Option<&Value>,
    ) -> Result<String> {
        Ok(render_template(situation, context))
    }
}

fn render_template(situation: Situation, context: Option<&Value>) -> String {
    match situation {
        Situation::ConfirmTransfer => {
            let amount = ctx_str(context, "amount").unwrap_or("the amount");
            let recipient = ctx_str(context, "recipient").unwrap_or("the recipient");
            match ctx_str(context, "source_account_number") {
                Some(number) => format!(
                    "You are about to transfer {} to {} from your account ending {}. Say confirm to proceed, or cancel to stop.",
                    amount,
                    recipient,
                    last_digits(number)
                ),
                None => format!(
                    "You are about to transfer {} to {}. Say confirm to proceed, or cancel to stop.",
                    amount, recipient
                ),
            }
        }
        Situation::RequestOtp => {
            if ctx_bool(context, "delivered").unwrap_or(true) {
                "I have sent a six digit verification code to your registered email. Please read it out to complete the transfer.".to_string()
            } else {
                "I generated a verification code but could not deliver it to your email just now. Give it a moment and read the code out once it arrives.".to_string()
            }
        }
        Situation::ErrorOtpIncorrect => {
            "That code does not match. Please check your email and read the code again.".to_string()
        }
        Situation::TransferSuccess => {
            let amount = ctx_str(context, "amount").unwrap_or("the amount");
            let recipient = ctx_str(context, "recipient").unwrap_or("the recipient");
            let mut text = format!("Done. {} has been transferred to {}.", amount, recipient);
            if let Some(balance) = ctx_str(context, "new_balance") {
                text.push_str(&format!(" Your new balance is {}.", balance));
            }
            text.push_str(" Anything else I can help you with?");
            text
        }
        Situation::ErrorInsufficientFunds => {
            let mut text =
                "Your balance is not enough for this transfer, so I have cancelled it.".to_string();
            if let Some(balance) = ctx_str(context, "balance") {
                text.push_str(&format!(" The available balance is {}.", balance));
            }
            text
        }
        Situation::ActionCancelled => {
            "Okay, I have cancelled that. Is there anything else I can help you with?".to_string()
        }
        Situation::ActionInProgress => {
            "We have an action in progress. Please answer the pending request first.".to_string()
        }
        Situation::MissingTransferDetails => {
            "I need an amount and a recipient for a transfer. For example, say transfer five hundred to Vickey.".to_string()
        }
        Situation::ErrorNoSavingsAccount => {
            "I could not find a savings account to transfer from, so I cannot start this transfer.".to_string()
        }
        Situation::ErrorNoAccount => {
            "I could not find an account for your profile.".to_string()
        }
        Situation::Greeting => {
            "Hello! I can check balances, list recent transactions, or transfer money. What would you like to do?".to_string()
        }
        Situation::Fallback => {
            "I can help with balances, transactions, and money transfers. Could you rephrase what you need?".to_string()
        }
        Situation::BalanceReport => {
            let account = context.and_then(|c| c.get("account"));
            let kind = account
                .and_then(|a| a.get("account_type"))
                .and_then(Value::as_str)
                .unwrap_or("bank");
            let number = account
                .and_then(|a| a.get("account_number"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let balance = account
                .and_then(|a| a.get("balance"))
                .and_then(Value::as_str)
                .unwrap_or("unavailable");
            let currency = account
                .and_then(|a| a.get("currency"))
                .and_then(Value::as_str)
                .unwrap_or("");
            format!(
                "Your {} account ending {} has a balance of {} {}.",
                kind,
                last_digits(number),
                balance,
                currency
            )
            .trim_end()
            .to_string()
        }
        Situation::TransactionsReport => {
            let count = context
                .and_then(|c| c.get("transactions"))
                .and_then(Value::as_array)
                .map(|list| list.len())
                .unwrap_or(0);
            let kind = context
                .and_then(|c| c.get("account"))
                .and_then(|a| a.get("account_type"))
                .and_then(Value::as_str)
                .unwrap_or("bank");
            format!(
                "Here are the latest {} transactions on your {} account. The details are on your screen.",
                count, kind
            )
        }
        Situation::ErrorNoTransactions => {
            "There are no transactions on that account yet.".to_string()
        }
        Situation::ClarifyAccount => match account_type_choices(context) {
            Some(choices) => format!(
                "You have more than one account. Should I use the {} account?",
                choices
            ),
            None => "You have more than one account. Which one should I use?".to_string(),
        },
    }
}

fn ctx_str<'a>(context: Option<&'a Value>, key: &str) -> Option<&'a str> {
    context?.get(key)?.as_str()
}

fn ctx_bool(context: Option<&Value>, key: &str) -> Option<bool> {
    context?.get(key)?.as_bool()
}

/// "savings or the current" from the distinct account types in context.
fn account_type_choices(context: Option<&Value>) -> Option<String> {
    let accounts = context?.get("accounts")?.as_array()?;
    let mut kinds: Vec<&str> = accounts
        .iter()
        .filter_map(|a| a.get("account_type").and_then(Value::as_str))
        .collect();
    kinds.dedup();
    if kinds.is_empty() {
        return None;
    }
    Some(kinds.join(" or the "))
}

fn last_digits(number: &str) -> &str {
    let tail = number.len().saturating_sub(4);
    number.get(tail..).unwrap_or(number)
}
