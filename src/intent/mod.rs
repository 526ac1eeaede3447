//! Intent resolution
//!
//! Maps one raw utterance to an intent label plus extracted entities. The
//! seam fails closed: implementations never error, anything they cannot
//! classify (including their own internal failures) comes back as
//! `Intent::Unknown` so the dialogue always has a route to a safe reply.

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod gemini;

pub use gemini::GeminiResolver;

//
// ================= Intents =================
//

/// Classification labels for what the user wants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    CheckBalance,
    ListTransactions,
    TransferMoney,
    InformOtp,
    GetLoanInfo,
    Help,
    ConfirmAction,
    CancelAction,
    Greeting,
    Goodbye,
    Unknown,
}

impl Intent {
    /// Parse an NLU label, collapsing anything unrecognized to `Unknown`.
    pub fn parse(label: &str) -> Intent {
        match label.trim() {
            "check_balance" => Intent::CheckBalance,
            "list_transactions" => Intent::ListTransactions,
            "transfer_money" => Intent::TransferMoney,
            "inform_otp" => Intent::InformOtp,
            "get_loan_info" => Intent::GetLoanInfo,
            "help" => Intent::Help,
            "confirm_action" => Intent::ConfirmAction,
            "cancel_action" => Intent::CancelAction,
            "greeting" => Intent::Greeting,
            "goodbye" => Intent::Goodbye,
            _ => Intent::Unknown,
        }
    }
}

//
// ================= Entities =================
//

/// Named values extracted alongside an intent. Kept as a loose JSON map so
/// resolvers can pass through whatever the NLU model produced; the typed
/// accessors below convert at the point of use and treat bad shapes as absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Entities(Map<String, Value>);

impl Entities {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Monetary amount, accepted as a JSON number or numeric string.
    pub fn amount(&self) -> Option<Decimal> {
        decimal_from_value(self.0.get("amount")?)
    }

    pub fn recipient(&self) -> Option<&str> {
        self.0.get("recipient").and_then(Value::as_str)
    }

    /// OTP digits, accepted as a string or (best effort) a bare number.
    pub fn otp_code(&self) -> Option<String> {
        match self.0.get("otp_code")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Raw spoken account type ("savings", "current"); the orchestrator owns
    /// the mapping onto a stored account.
    pub fn account_type(&self) -> Option<&str> {
        self.0.get("account_type").and_then(Value::as_str)
    }

    pub fn limit(&self) -> Option<usize> {
        match self.0.get("limit")? {
            Value::Number(n) => n.as_u64().map(|v| v as usize),
            Value::String(s) => s.trim().parse::<usize>().ok(),
            _ => None,
        }
    }
}

fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else {
                n.as_f64().and_then(Decimal::from_f64)
            }
        }
        Value::String(s) => s.trim().replace(',', "").parse::<Decimal>().ok(),
        _ => None,
    }
}

/// A classified utterance.
#[derive(Debug, Clone)]
pub struct ResolvedIntent {
    pub intent: Intent,
    pub entities: Entities,
}

impl ResolvedIntent {
    pub fn unknown() -> Self {
        Self {
            intent: Intent::Unknown,
            entities: Entities::new(),
        }
    }
}

/// Seam for natural-language understanding.
#[async_trait]
pub trait IntentResolver: Send + Sync {
    /// Classify one utterance. Infallible by contract: resolution trouble
    /// collapses to `Intent::Unknown` rather than an error.
    async fn resolve(&self, utterance: &str) -> ResolvedIntent;
}

//
// ================= Keyword Resolver =================
//

const OTP_WORDS: &[&str] = &["otp", "code", "pin"];
const CANCEL_WORDS: &[&str] = &["cancel", "abort", "stop", "no", "nevermind"];
const CONFIRM_WORDS: &[&str] = &["yes", "yeah", "confirm", "sure", "correct", "proceed", "ok", "okay"];
const TRANSFER_WORDS: &[&str] = &["transfer", "send", "pay"];
const BALANCE_WORDS: &[&str] = &["balance"];
const TRANSACTION_WORDS: &[&str] = &["transaction", "transactions", "statement", "history"];
const LOAN_WORDS: &[&str] = &["loan", "loans"];
const GREETING_WORDS: &[&str] = &["hello", "hi", "hey", "namaste"];
const GOODBYE_WORDS: &[&str] = &["bye", "goodbye"];
const HELP_WORDS: &[&str] = &["help"];

/// Deterministic keyword resolver used by the demo binary and tests, and as
/// the offline fallback when no NLU model is configured.
pub struct KeywordResolver;

#[async_trait]
impl IntentResolver for KeywordResolver {
    async fn resolve(&self, utterance: &str) -> ResolvedIntent {
        let tokens = words(utterance);
        if tokens.is_empty() {
            return ResolvedIntent::unknown();
        }

        let digits = concatenated_digits(utterance);
        let all_numeric = tokens.iter().all(|w| w.chars().all(|c| c.is_ascii_digit()));

        if contains_any(&tokens, OTP_WORDS) || (all_numeric && digits.len() >= 4) {
            let mut entities = Entities::new();
            if digits.len() >= 4 {
                entities.insert("otp_code", Value::String(digits));
            }
            return ResolvedIntent {
                intent: Intent::InformOtp,
                entities,
            };
        }

        if contains_any(&tokens, CANCEL_WORDS) {
            return ResolvedIntent {
                intent: Intent::CancelAction,
                entities: Entities::new(),
            };
        }

        if contains_any(&tokens, CONFIRM_WORDS) {
            return ResolvedIntent {
                intent: Intent::ConfirmAction,
                entities: Entities::new(),
            };
        }

        if contains_any(&tokens, TRANSFER_WORDS) {
            let mut entities = Entities::new();
            if let Some(amount) = first_amount(utterance) {
                entities.insert("amount", Value::String(amount.to_string()));
            }
            if let Some(recipient) = recipient_after_to(utterance) {
                entities.insert("recipient", Value::String(recipient));
            }
            return ResolvedIntent {
                intent: Intent::TransferMoney,
                entities,
            };
        }

        if contains_any(&tokens, BALANCE_WORDS) {
            return ResolvedIntent {
                intent: Intent::CheckBalance,
                entities: account_type_entities(&tokens),
            };
        }

        if contains_any(&tokens, TRANSACTION_WORDS) {
            let mut entities = account_type_entities(&tokens);
            if let Some(limit) = first_integer(utterance) {
                entities.insert("limit", Value::from(limit as u64));
            } else if tokens.iter().any(|w| w == "last" || w == "recent") {
                entities.insert("limit", Value::from(5u64));
            }
            return ResolvedIntent {
                intent: Intent::ListTransactions,
                entities,
            };
        }

        if contains_any(&tokens, LOAN_WORDS) {
            let mut entities = Entities::new();
            for kind in ["home", "personal", "car", "education"] {
                if tokens.iter().any(|w| w == kind) {
                    entities.insert("loan_type", Value::String(kind.to_string()));
                    break;
                }
            }
            return ResolvedIntent {
                intent: Intent::GetLoanInfo,
                entities,
            };
        }

        if contains_any(&tokens, GREETING_WORDS) {
            return ResolvedIntent {
                intent: Intent::Greeting,
                entities: Entities::new(),
            };
        }

        if contains_any(&tokens, GOODBYE_WORDS) {
            return ResolvedIntent {
                intent: Intent::Goodbye,
                entities: Entities::new(),
            };
        }

        if contains_any(&tokens, HELP_WORDS) {
            return ResolvedIntent {
                intent: Intent::Help,
                entities: Entities::new(),
            };
        }

        ResolvedIntent::unknown()
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn contains_any(tokens: &[String], candidates: &[&str]) -> bool {
    tokens.iter().any(|w| candidates.contains(&w.as_str()))
}

fn concatenated_digits(text: &str) -> String {
    text.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// First numeric token, commas stripped ("1,500.50" parses as 1500.50).
fn first_amount(text: &str) -> Option<Decimal> {
    for token in text.split_whitespace() {
        let cleaned: String = token
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if cleaned.is_empty() || cleaned == "." {
            continue;
        }
        if let Ok(value) = cleaned.parse::<Decimal>() {
            return Some(value);
        }
    }
    None
}

fn first_integer(text: &str) -> Option<usize> {
    text.split_whitespace()
        .filter_map(|t| {
            t.trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<usize>()
                .ok()
        })
        .next()
}

/// The word after "to", skipping possessives. Keeps the utterance's casing
/// so "Vickey" stays "Vickey".
fn recipient_after_to(text: &str) -> Option<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let position = tokens.iter().position(|t| t.eq_ignore_ascii_case("to"))?;
    tokens[position + 1..]
        .iter()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .find(|t| !t.is_empty() && !is_filler(t))
        .map(|t| t.to_string())
}

fn is_filler(word: &str) -> bool {
    matches!(
        word.to_lowercase().as_str(),
        "my" | "the" | "a" | "an" | "mr" | "mrs" | "ms" | "account"
    )
}

fn account_type_entities(tokens: &[String]) -> Entities {
    let mut entities = Entities::new();
    if tokens.iter().any(|w| w.starts_with("saving")) {
        entities.insert("account_type", Value::String("savings".to_string()));
    } else if tokens.iter().any(|w| w == "current" || w == "checking") {
        entities.insert("account_type", Value::String("current".to_string()));
    }
    entities
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn resolve(text: &str) -> ResolvedIntent {
        KeywordResolver.resolve(text).await
    }

    #[tokio::test]
    async fn transfer_with_amount_and_recipient() {
        let resolved = resolve("Can you transfer 500 rupees to Vickey").await;
        assert_eq!(resolved.intent, Intent::TransferMoney);
        assert_eq!(resolved.entities.amount(), Some(Decimal::from(500)));
        assert_eq!(resolved.entities.recipient(), Some("Vickey"));
    }

    #[tokio::test]
    async fn transfer_without_amount_still_classifies() {
        let resolved = resolve("transfer money to Vickey").await;
        assert_eq!(resolved.intent, Intent::TransferMoney);
        assert_eq!(resolved.entities.amount(), None);
        assert_eq!(resolved.entities.recipient(), Some("Vickey"));
    }

    #[tokio::test]
    async fn otp_from_spoken_digits() {
        let resolved = resolve("the code is 1 2 3 4 5 6").await;
        assert_eq!(resolved.intent, Intent::InformOtp);
        assert_eq!(resolved.entities.otp_code().as_deref(), Some("123456"));
    }

    #[tokio::test]
    async fn bare_digits_are_an_otp() {
        let resolved = resolve("482917").await;
        assert_eq!(resolved.intent, Intent::InformOtp);
        assert_eq!(resolved.entities.otp_code().as_deref(), Some("482917"));
    }

    #[tokio::test]
    async fn balance_with_account_type() {
        let resolved = resolve("Show me my savings account balance").await;
        assert_eq!(resolved.intent, Intent::CheckBalance);
        assert_eq!(resolved.entities.account_type(), Some("savings"));
    }

    #[tokio::test]
    async fn transactions_with_limit() {
        let resolved = resolve("What are my last 5 transactions?").await;
        assert_eq!(resolved.intent, Intent::ListTransactions);
        assert_eq!(resolved.entities.limit(), Some(5));
    }

    #[tokio::test]
    async fn confirm_and_cancel_words() {
        assert_eq!(resolve("yes, go ahead").await.intent, Intent::ConfirmAction);
        assert_eq!(resolve("cancel that").await.intent, Intent::CancelAction);
        assert_eq!(
            resolve("no, cancel the transfer").await.intent,
            Intent::CancelAction
        );
    }

    #[tokio::test]
    async fn unrelated_text_is_unknown() {
        assert_eq!(resolve("I want a pizza").await.intent, Intent::Unknown);
        assert_eq!(resolve("").await.intent, Intent::Unknown);
    }

    #[test]
    fn amount_accepts_numbers_and_strings() {
        let mut entities = Entities::new();
        entities.insert("amount", Value::from(750));
        assert_eq!(entities.amount(), Some(Decimal::from(750)));

        let mut entities = Entities::new();
        entities.insert("amount", Value::String("1,500.50".to_string()));
        assert_eq!(entities.amount(), Some(Decimal::new(150050, 2)));
    }

    #[test]
    fn intent_labels_round_trip() {
        assert_eq!(Intent::parse("transfer_money"), Intent::TransferMoney);
        assert_eq!(Intent::parse("inform_otp"), Intent::InformOtp);
        assert_eq!(Intent::parse("made_up_label"), Intent::Unknown);
    }
}
