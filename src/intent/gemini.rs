//! Gemini-backed intent resolution
//!
//! Prompts the model for a strict JSON classification. Any failure along
//! the way (API, fence noise, bad JSON, unknown label) resolves to
//! `Intent::Unknown` rather than an error.

use super::{Entities, Intent, IntentResolver, ResolvedIntent};
use crate::gemini::GeminiClient;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

const NLU_SYSTEM_PROMPT: &str = r#"You are the NLU component of a voice banking assistant. Analyze the user's text and return a single JSON object with exactly two keys: "intent" and "entities".

Possible intents:
- check_balance: the user asks for an account balance
- list_transactions: the user asks for recent transactions or a statement
- transfer_money: the user wants to send money to someone
- inform_otp: the user is reading back a numeric verification code
- get_loan_info: the user asks about loan products or rates
- help: the user asks what you can do
- confirm_action: the user agrees to proceed (yes, confirm, go ahead)
- cancel_action: the user wants to stop or abandon the current action
- greeting: a salutation with no banking request
- goodbye: the user is ending the conversation
- unknown: anything else

Entity keys (include only the ones present in the text):
- account_type: "savings" or "current"
- limit: integer count of transactions requested
- amount: numeric amount of money, without currency symbols
- currency: currency mentioned, e.g. "INR"
- recipient: the name money should go to
- loan_type: e.g. "home", "personal"
- otp_code: the digits of a verification code as one string, spaces removed

Rules:
- Spoken codes often arrive with spaces ("1 2 3 4 5 6"); join them.
- Never invent entities that are not in the text.
- Respond with ONLY the JSON object, no prose and no code fences.

Examples:
Text: "Can you transfer 500 rupees to Vickey"
JSON: {"intent": "transfer_money", "entities": {"amount": 500, "currency": "INR", "recipient": "Vickey"}}

Text: "what is my savings account balance"
JSON: {"intent": "check_balance", "entities": {"account_type": "savings"}}

Text: "the code is 4 8 2 9 1 7"
JSON: {"intent": "inform_otp", "entities": {"otp_code": "482917"}}

Text: "show my last 5 transactions"
JSON: {"intent": "list_transactions", "entities": {"limit": 5}}

Text: "yes, go ahead"
JSON: {"intent": "confirm_action", "entities": {}}"#;

/// Intent resolver backed by the Gemini API.
pub struct GeminiResolver {
    client: GeminiClient,
}

impl GeminiResolver {
    pub fn new(api_key: String) -> Self {
        Self {
            client: GeminiClient::new(api_key),
        }
    }
}

#[async_trait]
impl IntentResolver for GeminiResolver {
    async fn resolve(&self, utterance: &str) -> ResolvedIntent {
        let prompt = format!("Text: \"{}\"\nJSON:", utterance);

        let raw = match self.client.generate(NLU_SYSTEM_PROMPT, &prompt, 0.1).await {
            Ok(raw) => raw,
            Err(error) => {
                warn!(%error, "NLU call failed, resolving as unknown");
                return ResolvedIntent::unknown();
            }
        };

        debug!(raw = %raw.trim(), "NLU raw response");
        parse_nlu_response(&raw)
    }
}

/// Parse the model's JSON, tolerating markdown code fences.
fn parse_nlu_response(raw: &str) -> ResolvedIntent {
    let cleaned = raw.trim();
    let cleaned = cleaned.strip_prefix("```json").unwrap_or(cleaned);
    let cleaned = cleaned.strip_prefix("```").unwrap_or(cleaned);
    let cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned);
    let cleaned = cleaned.trim();

    let parsed: Value = match serde_json::from_str(cleaned) {
        Ok(value) => value,
        Err(error) => {
            warn!(%error, "NLU returned invalid JSON, resolving as unknown");
            return ResolvedIntent::unknown();
        }
    };

    let intent = parsed
        .get("intent")
        .and_then(Value::as_str)
        .map(Intent::parse)
        .unwrap_or(Intent::Unknown);

    let entities = parsed
        .get("entities")
        .and_then(Value::as_object)
        .cloned()
        .map(Entities::from_map)
        .unwrap_or_default();

    ResolvedIntent { intent, entities }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn parses_plain_json() {
        let resolved = parse_nlu_response(
            r#"{"intent": "transfer_money", "entities": {"amount": 500, "recipient": "Vickey"}}"#,
        );
        assert_eq!(resolved.intent, Intent::TransferMoney);
        assert_eq!(resolved.entities.amount(), Some(Decimal::from(500)));
        assert_eq!(resolved.entities.recipient(), Some("Vickey"));
    }

    #[test]
    fn strips_code_fences() {
        let resolved = parse_nlu_response(
            "```json\n{\"intent\": \"check_balance\", \"entities\": {\"account_type\": \"savings\"}}\n```",
        );
        assert_eq!(resolved.intent, Intent::CheckBalance);
        assert_eq!(resolved.entities.account_type(), Some("savings"));
    }

    #[test]
    fn invalid_json_fails_closed() {
        let resolved = parse_nlu_response("I think the user wants a transfer");
        assert_eq!(resolved.intent, Intent::Unknown);
        assert!(resolved.entities.is_empty());
    }

    #[test]
    fn unrecognized_label_fails_closed() {
        let resolved = parse_nlu_response(r#"{"intent": "buy_stocks", "entities": {}}"#);
        assert_eq!(resolved.intent, Intent::Unknown);
    }

    #[test]
    fn missing_entities_defaults_to_empty() {
        let resolved = parse_nlu_response(r#"{"intent": "greeting"}"#);
        assert_eq!(resolved.intent, Intent::Greeting);
        assert!(resolved.entities.is_empty());
    }
}
