//! Dialogue orchestrator, the per-session banking state machine
//!
//! One call to `handle_turn` runs a whole turn: resolve the intent, read the
//! session, walk the transition table keyed on the pending action, perform
//! the financial side effect at most once, render the outcome and append the
//! exchange. The session's pending action is the state:
//!
//! Idle (none) -> AwaitingConfirmation (TransferConfirmation)
//!             -> AwaitingOtp (OtpVerification) -> Idle
//!
//! Turns of one session are serialized behind a per-session lock; turns of
//! different sessions run in parallel. Every external call is bounded by the
//! configured timeout.

use crate::accounts::{AccountStore, DebitOutcome};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::intent::{Intent, IntentResolver, ResolvedIntent};
use crate::models::{AccountSummary, AccountType, PendingAction, Session, TurnReply, TurnRequest};
use crate::notify::OtpNotifier;
use crate::otp;
use crate::renderer::{ResponseRenderer, Situation};
use crate::session::SessionStore;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Generic reply for turns that die on an infrastructure failure. The
/// caller-facing boundary returns this instead of internal detail.
pub const APOLOGY_TEXT: &str =
    "I am sorry, something went wrong on my side. Please try that again in a moment.";

/// Reply used when a debit committed but the renderer could not word it.
const COMMITTED_FALLBACK_TEXT: &str = "Your transfer went through successfully.";

/// Default statement length when the user does not ask for a count.
const DEFAULT_TRANSACTION_LIMIT: usize = 10;

/// What one turn decided: the outcome to voice, the payloads that go with
/// it, and the pending action the session should hold afterwards.
struct TurnDecision {
    situation: Situation,
    context: Option<Value>,
    data: Option<Value>,
    pending: Option<PendingAction>,
    /// A debit committed in this turn; the reply must survive renderer or
    /// session-write trouble.
    committed: bool,
}

fn simple(situation: Situation) -> TurnDecision {
    TurnDecision {
        situation,
        context: None,
        data: None,
        pending: None,
        committed: false,
    }
}

enum ReadTarget<'a> {
    Account(&'a AccountSummary),
    NoAccounts,
    Ambiguous,
}

pub struct DialogueOrchestrator {
    sessions: Arc<dyn SessionStore>,
    accounts: Arc<dyn AccountStore>,
    resolver: Arc<dyn IntentResolver>,
    renderer: Arc<dyn ResponseRenderer>,
    notifier: Arc<dyn OtpNotifier>,
    config: OrchestratorConfig,
    /// One guard per session id, created on first use and kept for the life
    /// of the process.
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DialogueOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        accounts: Arc<dyn AccountStore>,
        resolver: Arc<dyn IntentResolver>,
        renderer: Arc<dyn ResponseRenderer>,
        notifier: Arc<dyn OtpNotifier>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            sessions,
            accounts,
            resolver,
            renderer,
            notifier,
            config,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one inbound turn end to end.
    pub async fn handle_turn(&self, request: &TurnRequest) -> Result<TurnReply> {
        let turn_id = Uuid::new_v4();
        info!(
            session_id = %request.session_id,
            turn_id = %turn_id,
            "Turn received"
        );

        let guard = self.session_guard(&request.session_id).await;
        let _turn = guard.lock().await;

        let resolved = self
            .bounded("intent resolver", self.resolver.resolve(&request.utterance))
            .await?;
        info!(intent = ?resolved.intent, "Intent resolved");

        let session = self
            .bounded(
                "session store read",
                self.sessions.get(&request.session_id, &request.user_id),
            )
            .await??;

        let decision = self.decide(request, &session, &resolved).await?;

        let response_text = self.render_decision(request, &session, &decision).await?;

        let appended = self
            .bounded(
                "session store write",
                self.sessions.append_turn(
                    &request.session_id,
                    &request.user_id,
                    turn_id,
                    &request.utterance,
                    &response_text,
                    decision.pending.clone(),
                ),
            )
            .await
            .and_then(|inner| inner);

        if let Err(write_error) = appended {
            if decision.committed {
                // The money moved; losing the history write must not turn a
                // completed transfer into an apology. The idempotency key
                // makes a replay of this confirmation harmless.
                error!(
                    session_id = %request.session_id,
                    %write_error,
                    "Session write failed after a committed debit, replying anyway"
                );
            } else {
                return Err(write_error);
            }
        }

        info!(
            session_id = %request.session_id,
            turn_id = %turn_id,
            situation = %decision.situation,
            "Turn complete"
        );

        Ok(TurnReply {
            recognized_text: request.utterance.clone(),
            response_text,
            data: decision.data,
        })
    }

    async fn session_guard(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn bounded<T>(&self, what: &'static str, operation: impl Future<Output = T>) -> Result<T> {
        tokio::time::timeout(self.config.call_timeout, operation)
            .await
            .map_err(|_| OrchestratorError::Timeout(what))
    }

    async fn decide(
        &self,
        request: &TurnRequest,
        session: &Session,
        resolved: &ResolvedIntent,
    ) -> Result<TurnDecision> {
        match &session.pending_action {
            Some(pending) => self.advance_pending(request, pending, resolved).await,
            None => self.start_intent(request, resolved).await,
        }
    }

    /// Transitions out of AwaitingConfirmation and AwaitingOtp.
    async fn advance_pending(
        &self,
        request: &TurnRequest,
        pending: &PendingAction,
        resolved: &ResolvedIntent,
    ) -> Result<TurnDecision> {
        match (pending, resolved.intent) {
            (
                PendingAction::TransferConfirmation {
                    amount,
                    recipient,
                    source_account_number,
                },
                Intent::ConfirmAction,
            ) => {
                let code = otp::generate_code();
                let delivered = self
                    .bounded(
                        "otp notifier",
                        self.notifier.send_code(&self.config.otp_destination, &code),
                    )
                    .await
                    .unwrap_or(false);
                if !delivered {
                    warn!(
                        session_id = %request.session_id,
                        "OTP dispatch failed, transition proceeds"
                    );
                }
                Ok(TurnDecision {
                    situation: Situation::RequestOtp,
                    context: Some(json!({ "delivered": delivered })),
                    data: None,
                    pending: Some(PendingAction::OtpVerification {
                        amount: *amount,
                        recipient: recipient.clone(),
                        source_account_number: source_account_number.clone(),
                        otp_code: code,
                    }),
                    committed: false,
                })
            }
            (PendingAction::TransferConfirmation { .. }, Intent::CancelAction) => {
                info!(session_id = %request.session_id, "Transfer cancelled before confirmation");
                Ok(simple(Situation::ActionCancelled))
            }
            (
                PendingAction::OtpVerification {
                    amount,
                    recipient,
                    source_account_number,
                    otp_code,
                },
                Intent::InformOtp,
            ) => {
                let supplied = resolved.entities.otp_code().unwrap_or_default();
                if !otp::code_matches(&supplied, otp_code) {
                    info!(session_id = %request.session_id, "OTP mismatch");
                    return Ok(TurnDecision {
                        situation: Situation::ErrorOtpIncorrect,
                        context: None,
                        data: None,
                        pending: Some(pending.clone()),
                        committed: false,
                    });
                }
                self.execute_transfer(request, *amount, recipient, source_account_number, otp_code)
                    .await
            }
            // Any other intent leaves the pending action untouched and
            // re-prompts. Cancellation is only honored while the transfer
            // still awaits its confirmation.
            _ => Ok(TurnDecision {
                situation: Situation::ActionInProgress,
                context: None,
                data: None,
                pending: Some(pending.clone()),
                committed: false,
            }),
        }
    }

    /// Commit the debit exactly once and pick the outcome to voice.
    async fn execute_transfer(
        &self,
        request: &TurnRequest,
        amount: Decimal,
        recipient: &str,
        source_account_number: &str,
        otp_code: &str,
    ) -> Result<TurnDecision> {
        let account = self
            .bounded(
                "account store read",
                self.accounts
                    .get_account(&request.user_id, source_account_number),
            )
            .await??;
        let Some(account) = account else {
            warn!(
                account_number = source_account_number,
                "Transfer source account disappeared"
            );
            return Ok(simple(Situation::ErrorNoAccount));
        };
        if account.balance < amount {
            return Ok(TurnDecision {
                situation: Situation::ErrorInsufficientFunds,
                context: Some(json!({
                    "balance": account.balance.to_string(),
                    "amount": amount.to_string(),
                })),
                data: None,
                pending: None,
                committed: false,
            });
        }

        let idempotency_key = transfer_key(
            &request.session_id,
            source_account_number,
            amount,
            recipient,
            otp_code,
        );
        let description = format!("Transfer to {}", recipient);

        let outcome = self
            .bounded(
                "account store write",
                self.accounts.execute_debit(
                    &request.user_id,
                    source_account_number,
                    amount,
                    &description,
                    idempotency_key,
                ),
            )
            .await??;

        match outcome {
            DebitOutcome::Applied {
                new_balance,
                transaction_id,
            }
            | DebitOutcome::AlreadyApplied {
                new_balance,
                transaction_id,
            } => {
                info!(
                    session_id = %request.session_id,
                    transaction_id = %transaction_id,
                    amount = %amount,
                    new_balance = %new_balance,
                    "Transfer committed"
                );
                Ok(TurnDecision {
                    situation: Situation::TransferSuccess,
                    context: Some(json!({
                        "amount": amount.to_string(),
                        "recipient": recipient,
                        "new_balance": new_balance.to_string(),
                    })),
                    data: Some(json!({
                        "transaction_id": transaction_id,
                        "new_balance": new_balance.to_string(),
                    })),
                    pending: None,
                    committed: true,
                })
            }
            DebitOutcome::InsufficientFunds { balance } => Ok(TurnDecision {
                situation: Situation::ErrorInsufficientFunds,
                context: Some(json!({
                    "balance": balance.to_string(),
                    "amount": amount.to_string(),
                })),
                data: None,
                pending: None,
                committed: false,
            }),
            DebitOutcome::AccountMissing => Ok(simple(Situation::ErrorNoAccount)),
        }
    }

    /// Transitions out of Idle.
    async fn start_intent(
        &self,
        request: &TurnRequest,
        resolved: &ResolvedIntent,
    ) -> Result<TurnDecision> {
        match resolved.intent {
            Intent::TransferMoney => self.start_transfer(request, resolved).await,
            Intent::CheckBalance => self.report_balance(request, resolved).await,
            Intent::ListTransactions => self.report_transactions(request, resolved).await,
            Intent::Greeting => Ok(simple(Situation::Greeting)),
            // inform_otp with nothing pending lands here too: the code is
            // stale, nothing may execute.
            _ => Ok(simple(Situation::Fallback)),
        }
    }

    async fn start_transfer(
        &self,
        request: &TurnRequest,
        resolved: &ResolvedIntent,
    ) -> Result<TurnDecision> {
        let (Some(amount), Some(recipient)) =
            (resolved.entities.amount(), resolved.entities.recipient())
        else {
            return Ok(simple(Situation::MissingTransferDetails));
        };
        // Non-positive amounts count as missing input.
        if amount <= Decimal::ZERO {
            return Ok(simple(Situation::MissingTransferDetails));
        }

        let summaries = self
            .bounded(
                "account store read",
                self.accounts.list_account_summaries(&request.user_id),
            )
            .await??;
        let Some(source) = summaries
            .iter()
            .find(|summary| summary.account_type == AccountType::Savings)
        else {
            return Ok(simple(if summaries.is_empty() {
                Situation::ErrorNoAccount
            } else {
                Situation::ErrorNoSavingsAccount
            }));
        };

        info!(
            session_id = %request.session_id,
            amount = %amount,
            recipient = recipient,
            account_number = %source.account_number,
            "Transfer staged for confirmation"
        );
        Ok(TurnDecision {
            situation: Situation::ConfirmTransfer,
            context: Some(json!({
                "amount": amount.to_string(),
                "recipient": recipient,
                "source_account_number": source.account_number,
            })),
            data: None,
            pending: Some(PendingAction::TransferConfirmation {
                amount,
                recipient: recipient.to_string(),
                source_account_number: source.account_number.clone(),
            }),
            committed: false,
        })
    }

    async fn report_balance(
        &self,
        request: &TurnRequest,
        resolved: &ResolvedIntent,
    ) -> Result<TurnDecision> {
        let summaries = self
            .bounded(
                "account store read",
                self.accounts.list_account_summaries(&request.user_id),
            )
            .await??;

        match resolve_read_account(&summaries, resolved.entities.account_type()) {
            ReadTarget::NoAccounts => Ok(simple(Situation::ErrorNoAccount)),
            ReadTarget::Ambiguous => Ok(TurnDecision {
                situation: Situation::ClarifyAccount,
                context: Some(json!({ "accounts": summaries })),
                data: Some(json!({ "accounts": summaries })),
                pending: None,
                committed: false,
            }),
            ReadTarget::Account(summary) => {
                let account = self
                    .bounded(
                        "account store read",
                        self.accounts
                            .get_account(&request.user_id, &summary.account_number),
                    )
                    .await??;
                let Some(account) = account else {
                    return Ok(simple(Situation::ErrorNoAccount));
                };
                Ok(TurnDecision {
                    situation: Situation::BalanceReport,
                    context: Some(json!({ "account": account })),
                    data: Some(json!({ "account": account })),
                    pending: None,
                    committed: false,
                })
            }
        }
    }

    async fn report_transactions(
        &self,
        request: &TurnRequest,
        resolved: &ResolvedIntent,
    ) -> Result<TurnDecision> {
        let summaries = self
            .bounded(
                "account store read",
                self.accounts.list_account_summaries(&request.user_id),
            )
            .await??;

        match resolve_read_account(&summaries, resolved.entities.account_type()) {
            ReadTarget::NoAccounts => Ok(simple(Situation::ErrorNoAccount)),
            ReadTarget::Ambiguous => Ok(TurnDecision {
                situation: Situation::ClarifyAccount,
                context: Some(json!({ "accounts": summaries })),
                data: Some(json!({ "accounts": summaries })),
                pending: None,
                committed: false,
            }),
            ReadTarget::Account(summary) => {
                let limit = resolved
                    .entities
                    .limit()
                    .filter(|limit| *limit > 0)
                    .unwrap_or(DEFAULT_TRANSACTION_LIMIT);
                let transactions = self
                    .bounded(
                        "account store read",
                        self.accounts.list_transactions(
                            &request.user_id,
                            &summary.account_number,
                            limit,
                        ),
                    )
                    .await??;
                if transactions.is_empty() {
                    return Ok(TurnDecision {
                        situation: Situation::ErrorNoTransactions,
                        context: Some(json!({ "account": summary })),
                        data: None,
                        pending: None,
                        committed: false,
                    });
                }
                Ok(TurnDecision {
                    situation: Situation::TransactionsReport,
                    context: Some(json!({
                        "account": summary,
                        "transactions": transactions,
                    })),
                    data: Some(json!({ "transactions": transactions })),
                    pending: None,
                    committed: false,
                })
            }
        }
    }

    /// Word the decision, protecting replies for committed debits.
    async fn render_decision(
        &self,
        request: &TurnRequest,
        session: &Session,
        decision: &TurnDecision,
    ) -> Result<String> {
        let rendered = self
            .bounded(
                "response renderer",
                self.renderer.render(
                    decision.situation,
                    &request.language,
                    &request.utterance,
                    &session.messages,
                    decision.context.as_ref(),
                ),
            )
            .await
            .and_then(|inner| inner);

        match rendered {
            Ok(text) if !text.trim().is_empty() => Ok(text),
            Ok(_) if decision.committed => {
                warn!("Renderer produced empty text after a committed debit");
                Ok(COMMITTED_FALLBACK_TEXT.to_string())
            }
            Ok(_) => Err(OrchestratorError::Renderer(
                "renderer produced empty text".to_string(),
            )),
            Err(render_error) if decision.committed => {
                error!(
                    %render_error,
                    "Renderer failed after a committed debit, using fallback text"
                );
                Ok(COMMITTED_FALLBACK_TEXT.to_string())
            }
            Err(render_error) => Err(render_error),
        }
    }
}

/// Pick the account a read intent refers to. A stated type matches the
/// first account of that type, defaulting to savings when absent or not
/// recognized; a single account wins regardless of type; otherwise the
/// caller must ask for clarification.
fn resolve_read_account<'a>(
    summaries: &'a [AccountSummary],
    stated: Option<&str>,
) -> ReadTarget<'a> {
    if summaries.is_empty() {
        return ReadTarget::NoAccounts;
    }
    if summaries.len() == 1 {
        return ReadTarget::Account(&summaries[0]);
    }
    let wanted = stated
        .and_then(AccountType::parse)
        .unwrap_or(AccountType::Savings);
    match summaries
        .iter()
        .find(|summary| summary.account_type == wanted)
    {
        Some(summary) => ReadTarget::Account(summary),
        None => ReadTarget::Ambiguous,
    }
}

/// Stable idempotency key for one confirmed transfer. The OTP code is fresh
/// per confirmation and acts as the nonce: replaying the same confirmation
/// re-derives the same key, a new confirmation derives a new one.
fn transfer_key(
    session_id: &str,
    account_number: &str,
    amount: Decimal,
    recipient: &str,
    otp_code: &str,
) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(account_number.as_bytes());
    hasher.update(b"\0");
    hasher.update(amount.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(recipient.as_bytes());
    hasher.update(b"\0");
    hasher.update(otp_code.as_bytes());
    let hash = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    // Stamp UUID v4 version and variant bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::InMemoryAccountStore;
    use crate::intent::KeywordResolver;
    use crate::models::{Account, TransactionKind, TurnRole};
    use crate::renderer::TemplateRenderer;
    use crate::session::InMemorySessionStore;
    use async_trait::async_trait;

    const USER: &str = "user-1";
    const SAVINGS: &str = "SB-1001";

    struct RecordingNotifier {
        deliver: bool,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingNotifier {
        fn new(deliver: bool) -> Self {
            Self {
                deliver,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl OtpNotifier for RecordingNotifier {
        async fn send_code(&self, destination: &str, code: &str) -> bool {
            self.sent
                .lock()
                .await
                .push((destination.to_string(), code.to_string()));
            self.deliver
        }
    }

    struct Harness {
        orchestrator: Arc<DialogueOrchestrator>,
        sessions: Arc<InMemorySessionStore>,
        accounts: Arc<InMemoryAccountStore>,
        notifier: Arc<RecordingNotifier>,
    }

    fn account(number: &str, kind: AccountType, balance_paise: i64) -> Account {
        Account {
            account_number: number.to_string(),
            account_type: kind,
            balance: Decimal::new(balance_paise, 2),
            currency: "INR".to_string(),
        }
    }

    fn build(
        sessions: Arc<InMemorySessionStore>,
        accounts: Arc<InMemoryAccountStore>,
        deliver: bool,
    ) -> Harness {
        let notifier = Arc::new(RecordingNotifier::new(deliver));
        let orchestrator = Arc::new(DialogueOrchestrator::new(
            sessions.clone(),
            accounts.clone(),
            Arc::new(KeywordResolver),
            Arc::new(TemplateRenderer),
            notifier.clone(),
            OrchestratorConfig::default(),
        ));
        Harness {
            orchestrator,
            sessions,
            accounts,
            notifier,
        }
    }

    /// One savings account holding 1000.00.
    async fn harness() -> Harness {
        harness_with_balance(100_000).await
    }

    async fn harness_with_balance(balance_paise: i64) -> Harness {
        let sessions = Arc::new(InMemorySessionStore::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts
            .upsert_account(USER, account(SAVINGS, AccountType::Savings, balance_paise))
            .await
            .unwrap();
        build(sessions, accounts, true)
    }

    fn turn(session_id: &str, utterance: &str) -> TurnRequest {
        TurnRequest {
            session_id: session_id.to_string(),
            user_id: USER.to_string(),
            utterance: utterance.to_string(),
            language: "en".to_string(),
        }
    }

    async fn say(h: &Harness, session_id: &str, utterance: &str) -> TurnReply {
        h.orchestrator
            .handle_turn(&turn(session_id, utterance))
            .await
            .unwrap()
    }

    async fn pending_of(h: &Harness, session_id: &str) -> Option<PendingAction> {
        h.sessions
            .get(session_id, USER)
            .await
            .unwrap()
            .pending_action
    }

    async fn stored_otp(h: &Harness, session_id: &str) -> String {
        match pending_of(h, session_id).await {
            Some(PendingAction::OtpVerification { otp_code, .. }) => otp_code,
            other => panic!("expected otp verification pending, got {:?}", other),
        }
    }

    fn wrong_code(stored: &str) -> String {
        if stored == "111111" {
            "222222".to_string()
        } else {
            "111111".to_string()
        }
    }

    async fn balance_of(h: &Harness, number: &str) -> Decimal {
        h.accounts
            .get_account(USER, number)
            .await
            .unwrap()
            .unwrap()
            .balance
    }

    /// Runs request + confirm, returning the stored OTP code.
    async fn stage_to_otp(h: &Harness, session_id: &str) -> String {
        say(h, session_id, "transfer 500 to Vickey").await;
        say(h, session_id, "yes, confirm").await;
        stored_otp(h, session_id).await
    }

    #[tokio::test]
    async fn transfer_request_stages_confirmation() {
        let h = harness().await;
        let reply = say(&h, "s-1", "Can you transfer 500 rupees to Vickey").await;

        assert!(reply.response_text.contains("500"));
        assert!(reply.response_text.contains("Vickey"));
        assert_eq!(
            pending_of(&h, "s-1").await,
            Some(PendingAction::TransferConfirmation {
                amount: Decimal::from(500),
                recipient: "Vickey".to_string(),
                source_account_number: SAVINGS.to_string(),
            })
        );
        assert_eq!(balance_of(&h, SAVINGS).await, Decimal::new(100_000, 2));
    }

    #[tokio::test]
    async fn confirmation_dispatches_code_and_awaits_otp() {
        let h = harness().await;
        say(&h, "s-1", "transfer 500 to Vickey").await;
        let reply = say(&h, "s-1", "yes, confirm").await;

        assert!(reply.response_text.contains("verification code"));
        let stored = stored_otp(&h, "s-1").await;
        assert_eq!(stored.len(), otp::CODE_LENGTH);

        let sent = h.notifier.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "banking-user@example.com");
        assert_eq!(sent[0].1, stored);
    }

    #[tokio::test]
    async fn wrong_code_retains_pending_and_balance() {
        let h = harness().await;
        let stored = stage_to_otp(&h, "s-1").await;

        let reply = say(&h, "s-1", &format!("the code is {}", wrong_code(&stored))).await;
        assert!(reply.response_text.contains("does not match"));

        // Same pending action, same code, nothing moved.
        assert_eq!(stored_otp(&h, "s-1").await, stored);
        assert_eq!(balance_of(&h, SAVINGS).await, Decimal::new(100_000, 2));
        assert!(h
            .accounts
            .list_transactions(USER, SAVINGS, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn correct_code_executes_exactly_once() {
        let h = harness().await;
        let stored = stage_to_otp(&h, "s-1").await;

        let reply = say(&h, "s-1", &format!("the code is {}", stored)).await;
        assert!(reply.response_text.contains("transferred"));
        assert!(reply.data.is_some());

        assert_eq!(balance_of(&h, SAVINGS).await, Decimal::new(50_000, 2));
        let transactions = h.accounts.list_transactions(USER, SAVINGS, 10).await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].amount, Decimal::from(-500));
        assert_eq!(transactions[0].kind, TransactionKind::Debit);
        assert_eq!(transactions[0].description, "Transfer to Vickey");
        assert_eq!(pending_of(&h, "s-1").await, None);
    }

    #[tokio::test]
    async fn spoken_digit_code_is_accepted() {
        let h = harness().await;
        let stored = stage_to_otp(&h, "s-1").await;

        let spaced: String = stored
            .chars()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let reply = say(&h, "s-1", &format!("the code is {}", spaced)).await;

        assert!(reply.response_text.contains("transferred"));
        assert_eq!(pending_of(&h, "s-1").await, None);
    }

    #[tokio::test]
    async fn insufficient_funds_abandons_transfer() {
        let h = harness_with_balance(10_000).await;
        let stored = stage_to_otp(&h, "s-1").await;

        let reply = say(&h, "s-1", &format!("the code is {}", stored)).await;
        assert!(reply.response_text.contains("not enough"));

        assert_eq!(balance_of(&h, SAVINGS).await, Decimal::new(10_000, 2));
        assert!(h
            .accounts
            .list_transactions(USER, SAVINGS, 10)
            .await
            .unwrap()
            .is_empty());
        // Abandoned, not retryable.
        assert_eq!(pending_of(&h, "s-1").await, None);
    }

    #[tokio::test]
    async fn cancel_during_confirmation_goes_idle() {
        let h = harness().await;
        say(&h, "s-1", "transfer 500 to Vickey").await;
        let reply = say(&h, "s-1", "cancel that").await;

        assert!(reply.response_text.contains("cancelled"));
        assert_eq!(pending_of(&h, "s-1").await, None);
        assert_eq!(balance_of(&h, SAVINGS).await, Decimal::new(100_000, 2));
    }

    #[tokio::test]
    async fn other_intents_reprompt_during_confirmation() {
        let h = harness().await;
        say(&h, "s-1", "transfer 500 to Vickey").await;

        let reply = say(&h, "s-1", "what is my balance").await;
        assert!(reply.response_text.contains("action in progress"));

        // A second transfer request must not replace the staged one.
        say(&h, "s-1", "transfer 900 to Bob").await;
        match pending_of(&h, "s-1").await {
            Some(PendingAction::TransferConfirmation {
                amount, recipient, ..
            }) => {
                assert_eq!(amount, Decimal::from(500));
                assert_eq!(recipient, "Vickey");
            }
            other => panic!("expected original confirmation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancel_during_otp_stage_reprompts() {
        let h = harness().await;
        let stored = stage_to_otp(&h, "s-1").await;

        let reply = say(&h, "s-1", "cancel that").await;
        assert!(reply.response_text.contains("action in progress"));
        assert_eq!(stored_otp(&h, "s-1").await, stored);
    }

    #[tokio::test]
    async fn replayed_code_after_completion_does_nothing() {
        let h = harness().await;
        let stored = stage_to_otp(&h, "s-1").await;
        say(&h, "s-1", &format!("the code is {}", stored)).await;

        let reply = say(&h, "s-1", &format!("the code is {}", stored)).await;
        assert!(reply.response_text.contains("Could you rephrase"));

        assert_eq!(balance_of(&h, SAVINGS).await, Decimal::new(50_000, 2));
        assert_eq!(
            h.accounts.list_transactions(USER, SAVINGS, 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn missing_details_ask_for_more_input() {
        let h = harness().await;

        let reply = say(&h, "s-1", "transfer money to Vickey").await;
        assert!(reply.response_text.contains("amount and a recipient"));
        assert_eq!(pending_of(&h, "s-1").await, None);

        let reply = say(&h, "s-1", "send 500").await;
        assert!(reply.response_text.contains("amount and a recipient"));
        assert_eq!(pending_of(&h, "s-1").await, None);
    }

    #[tokio::test]
    async fn transfer_needs_a_savings_account() {
        let sessions = Arc::new(InMemorySessionStore::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts
            .upsert_account(USER, account("CA-2001", AccountType::Current, 100_000))
            .await
            .unwrap();
        let h = build(sessions, accounts, true);

        let reply = say(&h, "s-1", "transfer 500 to Vickey").await;
        assert!(reply.response_text.contains("savings account"));
        assert_eq!(pending_of(&h, "s-1").await, None);
    }

    #[tokio::test]
    async fn balance_report_defaults_to_savings() {
        let h = harness().await;
        h.accounts
            .upsert_account(USER, account("CA-2001", AccountType::Current, 777_700))
            .await
            .unwrap();

        let reply = say(&h, "s-1", "what is my balance").await;
        assert!(reply.response_text.contains("savings"));
        assert!(reply.response_text.contains("1000.00"));
    }

    #[tokio::test]
    async fn single_account_wins_regardless_of_type() {
        let sessions = Arc::new(InMemorySessionStore::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts
            .upsert_account(USER, account("CA-2001", AccountType::Current, 55_500))
            .await
            .unwrap();
        let h = build(sessions, accounts, true);

        let reply = say(&h, "s-1", "what is my balance").await;
        assert!(reply.response_text.contains("current"));
        assert!(reply.response_text.contains("555.00"));
    }

    #[tokio::test]
    async fn unresolvable_accounts_ask_for_clarification() {
        let sessions = Arc::new(InMemorySessionStore::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts
            .upsert_account(USER, account("CA-2001", AccountType::Current, 10_000))
            .await
            .unwrap();
        accounts
            .upsert_account(USER, account("CA-2002", AccountType::Current, 20_000))
            .await
            .unwrap();
        let h = build(sessions, accounts, true);

        // Defaults to savings, which does not exist here.
        let reply = say(&h, "s-1", "what is my balance").await;
        assert!(reply.response_text.contains("more than one account"));
        assert_eq!(pending_of(&h, "s-1").await, None);
    }

    #[tokio::test]
    async fn transactions_default_to_the_savings_account() {
        let h = harness().await;
        h.accounts
            .upsert_account(USER, account("CA-2001", AccountType::Current, 10_000))
            .await
            .unwrap();
        h.accounts
            .append_transaction(
                USER,
                SAVINGS,
                crate::models::Transaction {
                    timestamp: chrono::Utc::now(),
                    description: "Salary credit".to_string(),
                    amount: Decimal::new(4_500_000, 2),
                    kind: TransactionKind::Credit,
                    category: "Income".to_string(),
                },
            )
            .await
            .unwrap();
        h.accounts
            .append_transaction(
                USER,
                "CA-2001",
                crate::models::Transaction {
                    timestamp: chrono::Utc::now(),
                    description: "Vendor payment".to_string(),
                    amount: Decimal::new(-120_000, 2),
                    kind: TransactionKind::Debit,
                    category: "Business".to_string(),
                },
            )
            .await
            .unwrap();

        let reply = say(&h, "s-1", "show my transactions").await;
        let data = reply.data.expect("statement payload");
        let listed = data["transactions"].as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["description"], "Salary credit");
    }

    #[tokio::test]
    async fn empty_statement_is_reported_as_such() {
        let h = harness().await;
        let reply = say(&h, "s-1", "show my transactions").await;
        assert!(reply.response_text.contains("no transactions"));
        assert!(reply.data.is_none());
    }

    #[tokio::test]
    async fn unknown_utterances_fall_back() {
        let h = harness().await;
        let reply = say(&h, "s-1", "tell me a joke").await;
        assert!(reply.response_text.contains("Could you rephrase"));

        let session = h.sessions.get("s-1", USER).await.unwrap();
        assert_eq!(session.messages.len(), 2);
    }

    #[tokio::test]
    async fn exchanges_share_turn_ids_in_order() {
        let h = harness().await;
        say(&h, "s-1", "hello").await;
        say(&h, "s-1", "what is my balance").await;

        let session = h.sessions.get("s-1", USER).await.unwrap();
        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.messages[0].role, TurnRole::User);
        assert_eq!(session.messages[1].role, TurnRole::Assistant);
        assert_eq!(session.messages[0].turn_id, session.messages[1].turn_id);
        assert_eq!(session.messages[2].turn_id, session.messages[3].turn_id);
        assert_ne!(session.messages[0].turn_id, session.messages[2].turn_id);
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_session_serialize() {
        let h = harness().await;
        let first = h.orchestrator.clone();
        let second = h.orchestrator.clone();

        let (a, b) = tokio::join!(
            async move { first.handle_turn(&turn("s-1", "transfer 500 to Vickey")).await },
            async move { second.handle_turn(&turn("s-1", "transfer 900 to Bob")).await },
        );
        let replies = [a.unwrap(), b.unwrap()];

        // One turn staged the confirmation, the other was re-prompted.
        let staged = replies
            .iter()
            .filter(|r| r.response_text.contains("about to transfer"))
            .count();
        let reprompted = replies
            .iter()
            .filter(|r| r.response_text.contains("action in progress"))
            .count();
        assert_eq!(staged, 1);
        assert_eq!(reprompted, 1);

        let session = h.sessions.get("s-1", USER).await.unwrap();
        assert_eq!(session.messages.len(), 4);
        assert!(matches!(
            session.pending_action,
            Some(PendingAction::TransferConfirmation { .. })
        ));
    }

    #[tokio::test]
    async fn racing_sessions_cannot_both_overdraw() {
        let h = harness().await;
        let code_a = stage_to_otp(&h, "s-a").await;
        // Second session stages its own 700.00 transfer.
        say(&h, "s-b", "transfer 700 to Bob").await;
        say(&h, "s-b", "yes, confirm").await;
        let code_b = stored_otp(&h, "s-b").await;
        let first = h.orchestrator.clone();
        let second = h.orchestrator.clone();
        let say_a = format!("the code is {}", code_a);
        let say_b = format!("the code is {}", code_b);

        // s-a transfers 500, s-b transfers 700, from a 1000.00 balance.
        let (a, b) = tokio::join!(
            async move { first.handle_turn(&turn("s-a", &say_a)).await },
            async move { second.handle_turn(&turn("s-b", &say_b)).await },
        );
        let replies = [a.unwrap(), b.unwrap()];

        let succeeded = replies
            .iter()
            .filter(|r| r.response_text.contains("transferred"))
            .count();
        let refused = replies
            .iter()
            .filter(|r| r.response_text.contains("not enough"))
            .count();
        assert_eq!(succeeded, 1);
        assert_eq!(refused, 1);

        let remaining = balance_of(&h, SAVINGS).await;
        assert!(remaining >= Decimal::ZERO);
        assert_eq!(
            h.accounts.list_transactions(USER, SAVINGS, 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_delivery_still_advances_but_tells_the_user() {
        let sessions = Arc::new(InMemorySessionStore::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts
            .upsert_account(USER, account(SAVINGS, AccountType::Savings, 100_000))
            .await
            .unwrap();
        let h = build(sessions, accounts, false);

        say(&h, "s-1", "transfer 500 to Vickey").await;
        let reply = say(&h, "s-1", "yes, confirm").await;

        assert!(reply.response_text.contains("could not deliver"));
        assert!(matches!(
            pending_of(&h, "s-1").await,
            Some(PendingAction::OtpVerification { .. })
        ));
    }

    #[tokio::test]
    async fn store_outage_fails_the_turn() {
        struct OfflineSessionStore;

        #[async_trait]
        impl SessionStore for OfflineSessionStore {
            async fn get(&self, _session_id: &str, _user_id: &str) -> Result<Session> {
                Err(OrchestratorError::SessionStore("store offline".to_string()))
            }

            async fn append_turn(
                &self,
                _session_id: &str,
                _user_id: &str,
                _turn_id: Uuid,
                _user_text: &str,
                _assistant_text: &str,
                _pending: Option<PendingAction>,
            ) -> Result<()> {
                Err(OrchestratorError::SessionStore("store offline".to_string()))
            }
        }

        let accounts = Arc::new(InMemoryAccountStore::new());
        let orchestrator = DialogueOrchestrator::new(
            Arc::new(OfflineSessionStore),
            accounts,
            Arc::new(KeywordResolver),
            Arc::new(TemplateRenderer),
            Arc::new(RecordingNotifier::new(true)),
            OrchestratorConfig::default(),
        );

        let result = orchestrator.handle_turn(&turn("s-1", "hello")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn committed_debit_survives_renderer_failure() {
        struct FlakyRenderer;

        #[async_trait]
        impl ResponseRenderer for FlakyRenderer {
            async fn render(
                &self,
                situation: Situation,
                language: &str,
                utterance: &str,
                history: &[crate::models::TurnMessage],
                context: Option<&Value>,
            ) -> Result<String> {
                if situation == Situation::TransferSuccess {
                    return Err(OrchestratorError::Renderer(
                        "wording model down".to_string(),
                    ));
                }
                TemplateRenderer
                    .render(situation, language, utterance, history, context)
                    .await
            }
        }

        let sessions = Arc::new(InMemorySessionStore::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts
            .upsert_account(USER, account(SAVINGS, AccountType::Savings, 100_000))
            .await
            .unwrap();
        let orchestrator = DialogueOrchestrator::new(
            sessions.clone(),
            accounts.clone(),
            Arc::new(KeywordResolver),
            Arc::new(FlakyRenderer),
            Arc::new(RecordingNotifier::new(true)),
            OrchestratorConfig::default(),
        );

        orchestrator
            .handle_turn(&turn("s-1", "transfer 500 to Vickey"))
            .await
            .unwrap();
        orchestrator
            .handle_turn(&turn("s-1", "yes, confirm"))
            .await
            .unwrap();
        let code = match sessions.get("s-1", USER).await.unwrap().pending_action {
            Some(PendingAction::OtpVerification { otp_code, .. }) => otp_code,
            other => panic!("expected otp stage, got {:?}", other),
        };

        let reply = orchestrator
            .handle_turn(&turn("s-1", &format!("the code is {}", code)))
            .await
            .unwrap();

        // The debit stands and the user still hears a success.
        assert_eq!(reply.response_text, COMMITTED_FALLBACK_TEXT);
        let account = accounts.get_account(USER, SAVINGS).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::new(50_000, 2));
        assert_eq!(
            sessions.get("s-1", USER).await.unwrap().pending_action,
            None
        );
    }

    #[test]
    fn transfer_key_is_stable_per_confirmation() {
        let amount = Decimal::new(50_000, 2);
        let key = transfer_key("s-1", SAVINGS, amount, "Vickey", "482917");
        let replayed = transfer_key("s-1", SAVINGS, amount, "Vickey", "482917");
        let fresh_code = transfer_key("s-1", SAVINGS, amount, "Vickey", "517263");
        let other_session = transfer_key("s-2", SAVINGS, amount, "Vickey", "482917");

        assert_eq!(key, replayed);
        assert_ne!(key, fresh_code);
        assert_ne!(key, other_session);
        assert_eq!(key.get_version_num(), 4);
    }

    #[test]
    fn read_target_defaults_and_disambiguates() {
        let savings = AccountSummary {
            account_number: SAVINGS.to_string(),
            account_type: AccountType::Savings,
            balance: Decimal::new(100_000, 2),
        };
        let current = AccountSummary {
            account_number: "CA-2001".to_string(),
            account_type: AccountType::Current,
            balance: Decimal::new(20_000, 2),
        };

        let both = vec![savings.clone(), current.clone()];
        match resolve_read_account(&both, None) {
            ReadTarget::Account(summary) => assert_eq!(summary.account_number, SAVINGS),
            _ => panic!("expected the savings default"),
        }
        match resolve_read_account(&both, Some("current")) {
            ReadTarget::Account(summary) => assert_eq!(summary.account_number, "CA-2001"),
            _ => panic!("expected the stated type"),
        }

        let only_current = vec![current.clone()];
        match resolve_read_account(&only_current, Some("savings")) {
            ReadTarget::Account(summary) => assert_eq!(summary.account_number, "CA-2001"),
            _ => panic!("expected the single account"),
        }

        let two_current = vec![current.clone(), current];
        assert!(matches!(
            resolve_read_account(&two_current, None),
            ReadTarget::Ambiguous
        ));
        assert!(matches!(resolve_read_account(&[], None), ReadTarget::NoAccounts));
    }
}
