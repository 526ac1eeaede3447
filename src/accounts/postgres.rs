//! Postgres-backed account store
//!
//! Balances are NUMERIC and the overdraw guard runs inside the debit
//! transaction: the source row is locked, the check and both writes commit
//! or roll back together. Applied idempotency keys live in their own table
//! so a replayed commit is answered from the original result.

use crate::accounts::{AccountStore, DebitOutcome, TRANSFER_CATEGORY};
use crate::error::{OrchestratorError, Result};
use crate::models::{Account, AccountSummary, AccountType, Transaction, TransactionKind};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

static SCHEMA_READY: OnceCell<()> = OnceCell::const_new();

pub struct PostgresAccountStore {
    pool: PgPool,
}

impl PostgresAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<()> {
        SCHEMA_READY
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS accounts (
                        user_id TEXT NOT NULL,
                        account_number TEXT NOT NULL,
                        account_type TEXT NOT NULL,
                        balance NUMERIC(18, 2) NOT NULL,
                        currency TEXT NOT NULL,
                        PRIMARY KEY (user_id, account_number)
                    )
                    "#,
                )
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    OrchestratorError::AccountStore(format!("Failed to create accounts table: {}", e))
                })?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS account_transactions (
                        transaction_id UUID PRIMARY KEY,
                        user_id TEXT NOT NULL,
                        account_number TEXT NOT NULL,
                        occurred_at TIMESTAMPTZ NOT NULL,
                        description TEXT NOT NULL,
                        amount NUMERIC(18, 2) NOT NULL,
                        kind TEXT NOT NULL,
                        category TEXT NOT NULL
                    )
                    "#,
                )
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    OrchestratorError::AccountStore(format!(
                        "Failed to create account_transactions table: {}",
                        e
                    ))
                })?;

                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_account_transactions_recent \
                     ON account_transactions (user_id, account_number, occurred_at DESC)",
                )
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    OrchestratorError::AccountStore(format!("Failed to create index: {}", e))
                })?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS applied_transfers (
                        idempotency_key UUID PRIMARY KEY,
                        user_id TEXT NOT NULL,
                        account_number TEXT NOT NULL,
                        amount NUMERIC(18, 2) NOT NULL,
                        new_balance NUMERIC(18, 2) NOT NULL,
                        transaction_id UUID NOT NULL,
                        applied_at TIMESTAMPTZ NOT NULL
                    )
                    "#,
                )
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    OrchestratorError::AccountStore(format!(
                        "Failed to create applied_transfers table: {}",
                        e
                    ))
                })?;

                info!("Account schema ready");
                Ok::<(), OrchestratorError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    async fn get_account(&self, user_id: &str, account_number: &str) -> Result<Option<Account>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            "SELECT account_number, account_type, balance, currency FROM accounts \
             WHERE user_id = $1 AND account_number = $2",
        )
        .bind(user_id)
        .bind(account_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OrchestratorError::AccountStore(format!("Account read failed: {}", e)))?;

        Ok(row.map(|row| Account {
            account_number: row.get("account_number"),
            account_type: type_from_db(row.get::<String, _>("account_type").as_str()),
            balance: row.get("balance"),
            currency: row.get("currency"),
        }))
    }

    async fn list_accounts(&self, user_id: &str) -> Result<Vec<Account>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT account_number, account_type, balance, currency FROM accounts \
             WHERE user_id = $1 ORDER BY account_number",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrchestratorError::AccountStore(format!("Account list failed: {}", e)))?;

        Ok(rows
            .iter()
            .map(|row| Account {
                account_number: row.get("account_number"),
                account_type: type_from_db(row.get::<String, _>("account_type").as_str()),
                balance: row.get("balance"),
                currency: row.get("currency"),
            })
            .collect())
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
        self.ensure_schema().await?;

        let result = sqlx::query(
            "UPDATE accounts SET balance = $3 WHERE user_id = $1 AND account_number = $2",
        )
        .bind(user_id)
        .bind(account_number)
        .bind(new_balance)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::AccountStore(format!("Balance update failed: {}", e)))?;

        if result.rows_affected() == 0 {
            warn!(account_number, "Balance update for unknown account ignored");
        }
        Ok(())
    }

    async fn append_transaction(
        &self,
        user_id: &str,
        account_number: &str,
        transaction: Transaction,
    ) -> Result<Uuid> {
        self.ensure_schema().await?;

        let transaction_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO account_transactions \
             (transaction_id, user_id, account_number, occurred_at, description, amount, kind, category) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(transaction_id)
        .bind(user_id)
        .bind(account_number)
        .bind(transaction.timestamp)
        .bind(&transaction.description)
        .bind(transaction.amount)
        .bind(transaction.kind.to_string())
        .bind(&transaction.category)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::AccountStore(format!("Transaction insert failed: {}", e)))?;

        Ok(transaction_id)
    }

    async fn list_transactions(
        &self,
        user_id: &str,
        account_number: &str,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            "SELECT occurred_at, description, amount, kind, category FROM account_transactions \
             WHERE user_id = $1 AND account_number = $2 ORDER BY occurred_at DESC LIMIT $3",
        )
        .bind(user_id)
        .bind(account_number)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrchestratorError::AccountStore(format!("Transaction list failed: {}", e)))?;

        Ok(rows
            .iter()
            .map(|row| Transaction {
                timestamp: row.get("occurred_at"),
                description: row.get("description"),
                amount: row.get("amount"),
                kind: kind_from_db(row.get::<String, _>("kind").as_str()),
                category: row.get("category"),
            })
            .collect())
    }

    async fn execute_debit(
        &self,
        user_id: &str,
        account_number: &str,
        amount: Decimal,
        description: &str,
        idempotency_key: Uuid,
    ) -> Result<DebitOutcome> {
        self.ensure_schema().await?;

        let mut tx = self.pool.begin().await.map_err(|e| {
            OrchestratorError::AccountStore(format!("Failed to open transaction: {}", e))
        })?;

        let replay = sqlx::query(
            "SELECT new_balance, transaction_id FROM applied_transfers WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| OrchestratorError::AccountStore(format!("Replay check failed: {}", e)))?;

        if let Some(row) = replay {
            return Ok(DebitOutcome::AlreadyApplied {
                new_balance: row.get("new_balance"),
                transaction_id: row.get("transaction_id"),
            });
        }

        // Row lock: the balance check and debit see one consistent state.
        let balance: Option<Decimal> = sqlx::query_scalar(
            "SELECT balance FROM accounts WHERE user_id = $1 AND account_number = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(account_number)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| OrchestratorError::AccountStore(format!("Balance lock failed: {}", e)))?;

        let Some(balance) = balance else {
            return Ok(DebitOutcome::AccountMissing);
        };
        if balance < amount {
            return Ok(DebitOutcome::InsufficientFunds { balance });
        }

        let new_balance = balance - amount;
        sqlx::query(
            "UPDATE accounts SET balance = $3 WHERE user_id = $1 AND account_number = $2",
        )
        .bind(user_id)
        .bind(account_number)
        .bind(new_balance)
        .execute(&mut *tx)
        .await
        .map_err(|e| OrchestratorError::AccountStore(format!("Debit update failed: {}", e)))?;

        let transaction_id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO account_transactions \
             (transaction_id, user_id, account_number, occurred_at, description, amount, kind, category) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(transaction_id)
        .bind(user_id)
        .bind(account_number)
        .bind(now)
        .bind(description)
        .bind(-amount)
        .bind(TransactionKind::Debit.to_string())
        .bind(TRANSFER_CATEGORY)
        .execute(&mut *tx)
        .await
        .map_err(|e| OrchestratorError::AccountStore(format!("Ledger insert failed: {}", e)))?;

        sqlx::query(
            "INSERT INTO applied_transfers \
             (idempotency_key, user_id, account_number, amount, new_balance, transaction_id, applied_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(idempotency_key)
        .bind(user_id)
        .bind(account_number)
        .bind(amount)
        .bind(new_balance)
        .bind(transaction_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| OrchestratorError::AccountStore(format!("Replay record failed: {}", e)))?;

        tx.commit().await.map_err(|e| {
            OrchestratorError::AccountStore(format!("Failed to commit debit: {}", e))
        })?;

        Ok(DebitOutcome::Applied {
            new_balance,
            transaction_id,
        })
    }

    async fn upsert_account(&self, user_id: &str, account: Account) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            "INSERT INTO accounts (user_id, account_number, account_type, balance, currency) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id, account_number) \
             DO UPDATE SET account_type = EXCLUDED.account_type, \
                           balance = EXCLUDED.balance, currency = EXCLUDED.currency",
        )
        .bind(user_id)
        .bind(&account.account_number)
        .bind(account.account_type.to_string())
        .bind(account.balance)
        .bind(&account.currency)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::AccountStore(format!("Account upsert failed: {}", e)))?;

        Ok(())
    }
}

fn type_from_db(value: &str) -> AccountType {
    match AccountType::parse(value) {
        Some(kind) => kind,
        None => {
            warn!(value, "Unknown account type in database, defaulting to savings");
            AccountType::Savings
        }
    }
}

fn kind_from_db(value: &str) -> TransactionKind {
    match value {
        "credit" => TransactionKind::Credit,
        _ => TransactionKind::Debit,
    }
}
