//! Core data models for the voice banking dialogue

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Savings,
    Current,
}

impl AccountType {
    /// Lenient parse for values coming out of NLU entities or utterances.
    pub fn parse(value: &str) -> Option<Self> {
        let lowered = value.trim().to_lowercase();
        if lowered.starts_with("saving") {
            Some(AccountType::Savings)
        } else if lowered.starts_with("current") || lowered.starts_with("checking") {
            Some(AccountType::Current)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Debit,
    Credit,
}

//
// ================= Session =================
//

/// One message of a turn. Both messages of an exchange carry the same
/// `turn_id` so the pair can be correlated after the fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnMessage {
    pub turn_id: Uuid,
    pub role: TurnRole,
    pub content: String,
}

/// Per-conversation state. Holds the full message history and at most one
/// in-flight multi-step operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub messages: Vec<TurnMessage>,
    pub pending_action: Option<PendingAction>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Session {
    /// Well-formed session for ids that have no stored record yet.
    pub fn empty(session_id: &str, user_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            messages: Vec::new(),
            pending_action: None,
            last_updated: None,
        }
    }

    /// Tail of the message history, newest last.
    pub fn recent_messages(&self, count: usize) -> &[TurnMessage] {
        let start = self.messages.len().saturating_sub(count);
        &self.messages[start..]
    }
}

//
// ================= Pending Action =================
//

/// The single in-flight operation a session may carry. Which variant is
/// present (or none) is the session's dialogue state: no pending action is
/// idle, `TransferConfirmation` awaits a yes/no, `OtpVerification` awaits
/// the code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingAction {
    TransferConfirmation {
        amount: Decimal,
        recipient: String,
        source_account_number: String,
    },
    OtpVerification {
        amount: Decimal,
        recipient: String,
        source_account_number: String,
        otp_code: String,
    },
}

//
// ================= Accounts =================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub account_number: String,
    pub account_type: AccountType,
    pub balance: Decimal,
    pub currency: String,
}

impl Account {
    pub fn summary(&self) -> AccountSummary {
        AccountSummary {
            account_number: self.account_number.clone(),
            account_type: self.account_type,
            balance: self.balance,
        }
    }
}

/// Slim account view used for listing and disambiguation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSummary {
    pub account_number: String,
    pub account_type: AccountType,
    pub balance: Decimal,
}

/// One ledger entry. `amount` is signed: debits are negative, credits
/// positive, so a statement sums to the balance delta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub category: String,
}

//
// ================= Turn I/O =================
//

/// One inbound conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub session_id: String,
    pub user_id: String,
    pub utterance: String,
    pub language: String,
}

/// The orchestrator's answer to one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReply {
    /// Echo of what the system understood the user to have said.
    pub recognized_text: String,
    /// The sentence to speak or display.
    pub response_text: String,
    /// Structured payload for screens (balances, statements).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountType::Savings => "savings",
            AccountType::Current => "current",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionKind::Debit => "debit",
            TransactionKind::Credit => "credit",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        };
        write!(f, "{}", s)
    }
}
