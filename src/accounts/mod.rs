//! Account and transaction persistence
//!
//! Balances and ledger entries for the fixed demo identity. The one write
//! that moves money, `execute_debit`, pairs the balance change with its
//! ledger entry in a single atomic commit and is keyed so a replayed commit
//! cannot debit twice.

use crate::error::Result;
use crate::models::{Account, AccountSummary, AccountType, Transaction, TransactionKind};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub mod postgres;

pub use postgres::PostgresAccountStore;

/// Ledger category stamped on transfer debits.
pub const TRANSFER_CATEGORY: &str = "Transfer";

/// Result of an idempotent debit commit.
#[derive(Debug, Clone, PartialEq)]
pub enum DebitOutcome {
    /// Both writes landed in this call.
    Applied {
        new_balance: Decimal,
        transaction_id: Uuid,
    },
    /// The key was committed by an earlier call; nothing changed now.
    AlreadyApplied {
        new_balance: Decimal,
        transaction_id: Uuid,
    },
    /// Balance below the requested amount; nothing changed.
    InsufficientFunds { balance: Decimal },
    /// No such account for this user; nothing changed.
    AccountMissing,
}

/// Seam for balance and ledger persistence.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, user_id: &str, account_number: &str) -> Result<Option<Account>>;

    /// All accounts of a user, ordered by account number.
    async fn list_accounts(&self, user_id: &str) -> Result<Vec<Account>>;

    async fn list_account_summaries(&self, user_id: &str) -> Result<Vec<AccountSummary>>;

    async fn update_balance(
        &self,
        user_id: &str,
        account_number: &str,
        new_balance: Decimal,
    ) -> Result<()>;

    async fn append_transaction(
        &self,
        user_id: &str,
        account_number: &str,
        transaction: Transaction,
    ) -> Result<Uuid>;

    /// Most recent transactions first, at most `limit`.
    async fn list_transactions(
        &self,
        user_id: &str,
        account_number: &str,
        limit: usize,
    ) -> Result<Vec<Transaction>>;

    /// Debit `amount` and record the matching ledger entry as one unit. The
    /// balance check and the debit are atomic, so concurrent commits cannot
    /// overdraw, and `idempotency_key` makes a replayed commit a no-op that
    /// reports the original result.
    async fn execute_debit(
        &self,
        user_id: &str,
        account_number: &str,
        amount: Decimal,
        description: &str,
        idempotency_key: Uuid,
    ) -> Result<DebitOutcome>;

    async fn upsert_account(&self, user_id: &str, account: Account) -> Result<()>;
}

//
// ================= In-Memory Implementation =================
//

struct StoredTransaction {
    transaction_id: Uuid,
    transaction: Transaction,
}

#[derive(Clone, Copy)]
struct AppliedTransfer {
    new_balance: Decimal,
    transaction_id: Uuid,
}

#[derive(Default)]
struct Ledger {
    accounts: HashMap<(String, String), Account>,
    transactions: HashMap<(String, String), Vec<StoredTransaction>>,
    applied_transfers: HashMap<Uuid, AppliedTransfer>,
}

/// In-memory account store for development and tests. A single lock guards
/// the whole ledger so a debit sees and mutates one consistent snapshot.
pub struct InMemoryAccountStore {
    ledger: Arc<RwLock<Ledger>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(RwLock::new(Ledger::default())),
        }
    }
}

impl Default for InMemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key(user_id: &str, account_number: &str) -> (String, String) {
    (user_id.to_string(), account_number.to_string())
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get_account(&self, user_id: &str, account_number: &str) -> Result<Option<Account>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.accounts.get(&key(user_id, account_number)).cloned())
    }

    async fn list_accounts(&self, user_id: &str) -> Result<Vec<Account>> {
        let ledger = self.ledger.read().await;
        let mut accounts: Vec<Account> = ledger
            .accounts
            .iter()
            .filter(|((owner, _), _)| owner == user_id)
            .map(|(_, account)| account.clone())
            .collect();
        accounts.sort_by(|a, b| a.account_number.cmp(&b.account_number));
        Ok(accounts)
    }

    async fn list_account_summaries(&self, user_id: &str) -> Result<Vec<AccountSummary>> {
        Ok(self
            .list_accounts(user_id)
            .await?
            .iter()
            .map(Account::summary)
            .collect())
    }

    async fn update_balance(
        &self,
        user_id: &str,
        account_number: &str,
        new_balance: Decimal,
    ) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        match ledger.accounts.get_mut(&key(user_id, account_number)) {
            Some(account) => account.balance = new_balance,
            None => warn!(account_number, "Balance update for unknown account ignored"),
        }
        Ok(())
    }

    async fn append_transaction(
        &self,
        user_id: &str,
        account_number: &str,
        transaction: Transaction,
    ) -> Result<Uuid> {
        let mut ledger = self.ledger.write().await;
        let transaction_id = Uuid::new_v4();
        ledger
            .transactions
            .entry(key(user_id, account_number))
            .or_default()
            .push(StoredTransaction {
                transaction_id,
                transaction,
            });
        Ok(transaction_id)
    }

    async fn list_transactions(
        &self,
        user_id: &str,
        account_number: &str,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let ledger = self.ledger.read().await;
        let mut transactions: Vec<Transaction> = ledger
            .transactions
            .get(&key(user_id, account_number))
            .map(|stored| stored.iter().map(|s| s.transaction.clone()).collect())
            .unwrap_or_default();
        transactions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        transactions.truncate(limit);
        Ok(transactions)
    }

    async fn execute_debit(
        &self,
        user_id: &str,
        account_number: &str,
        amount: Decimal,
        description: &str,
        idempotency_key: Uuid,
    ) -> Result<DebitOutcome> {
        let mut guard = self.ledger.write().await;
        let ledger = &mut *guard;

        if let Some(applied) = ledger.applied_transfers.get(&idempotency_key) {
            return Ok(DebitOutcome::AlreadyApplied {
                new_balance: applied.new_balance,
                transaction_id: applied.transaction_id,
            });
        }

        let account_key = key(user_id, account_number);
        let Some(account) = ledger.accounts.get_mut(&account_key) else {
            return Ok(DebitOutcome::AccountMissing);
        };
        if account.balance < amount {
            return Ok(DebitOutcome::InsufficientFunds {
                balance: account.balance,
            });
        }

        account.balance -= amount;
        let new_balance = account.balance;
        let transaction_id = Uuid::new_v4();

        ledger
            .transactions
            .entry(account_key)
            .or_default()
            .push(StoredTransaction {
                transaction_id,
                transaction: Transaction {
                    timestamp: Utc::now(),
                    description: description.to_string(),
                    amount: -amount,
                    kind: TransactionKind::Debit,
                    category: TRANSFER_CATEGORY.to_string(),
                },
            });
        ledger.applied_transfers.insert(
            idempotency_key,
            AppliedTransfer {
                new_balance,
                transaction_id,
            },
        );

        Ok(DebitOutcome::Applied {
            new_balance,
            transaction_id,
        })
    }

    async fn upsert_account(&self, user_id: &str, account: Account) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        ledger
            .accounts
            .insert(key(user_id, &account.account_number), account);
        Ok(())
    }
}

//
// ================= Demo Seeding =================
//

pub const DEMO_SAVINGS_ACCOUNT: &str = "SB-00123456";
pub const DEMO_CURRENT_ACCOUNT: &str = "CA-00784321";

const DEMO_LEDGER: &[(&str, &str, i64)] = &[
    ("Salary credit", "Income", 4_500_000),
    ("Grocery store", "Shopping", -230_050),
    ("Electricity bill", "Utilities", -145_000),
    ("Interest credit", "Income", 35_025),
    ("Restaurant", "Food", -89_900),
    ("Mobile recharge", "Utilities", -39_900),
    ("Refund from store", "Shopping", 120_000),
    ("Fuel station", "Transport", -250_000),
];

/// Seed a savings and a current account with a plausible transaction
/// history. Overwrites balances; safe to call repeatedly.
pub async fn populate_demo_data(
    store: &dyn AccountStore,
    user_id: &str,
    currency: &str,
    num_transactions: usize,
) -> Result<()> {
    store
        .upsert_account(
            user_id,
            Account {
                account_number: DEMO_SAVINGS_ACCOUNT.to_string(),
                account_type: AccountType::Savings,
                balance: Decimal::new(2_500_000, 2),
                currency: currency.to_string(),
            },
        )
        .await?;
    store
        .upsert_account(
            user_id,
            Account {
                account_number: DEMO_CURRENT_ACCOUNT.to_string(),
                account_type: AccountType::Current,
                balance: Decimal::new(6_000_000, 2),
                currency: currency.to_string(),
            },
        )
        .await?;

    let now = Utc::now();
    for i in 0..num_transactions {
        let (description, category, paise) = DEMO_LEDGER[i % DEMO_LEDGER.len()];
        let amount = Decimal::new(paise, 2);
        let account_number = if i % 3 == 2 {
            DEMO_CURRENT_ACCOUNT
        } else {
            DEMO_SAVINGS_ACCOUNT
        };
        store
            .append_transaction(
                user_id,
                account_number,
                Transaction {
                    timestamp: now - Duration::hours((i as i64 + 1) * 6),
                    description: description.to_string(),
                    amount,
                    kind: if paise < 0 {
                        TransactionKind::Debit
                    } else {
                        TransactionKind::Credit
                    },
                    category: category.to_string(),
                },
            )
            .await?;
    }

    info!(user_id, num_transactions, "Demo banking data seeded");
    Ok(())
}
