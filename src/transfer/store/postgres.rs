//! PostgreSQL Transfer Store
//!
//! Row locks are `SELECT ... FOR UPDATE` inside an sqlx transaction; saga
//! state updates are CAS (`WHERE state = expected`). Table layout lives in
//! `sql/schema.sql`.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use super::{LedgerTx, TransferStore};
use crate::db::SafeRow;
use crate::transfer::error::TransferError;
use crate::transfer::state::{SagaState, SagaStep};
use crate::transfer::types::{
    Account, AccountId, Currency, SagaRecord, TransferId, TransferParams, TransferRecord,
    TransferStatus,
};

const SAGA_COLUMNS: &str = "saga_id, sender_id, recipient_id, amount, currency, memo, \
                            state, error_message, retry_count, created_at, updated_at";

/// PostgreSQL-backed store
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// One sqlx transaction plus the set of rows it holds locks on
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
    locked: HashSet<AccountId>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_account(
        &mut self,
        id: &AccountId,
        currency: &Currency,
    ) -> Result<Option<Account>, TransferError> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, balance, currency FROM accounts_tb
            WHERE id = $1 AND currency = $2
            FOR UPDATE
            "#,
        )
        .bind(id.as_str())
        .bind(currency.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => {
                let account = row_to_account(&row)?;
                self.locked.insert(account.id.clone());
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    async fn update_balance(&mut self, id: &AccountId, balance: i64) -> Result<(), TransferError> {
        if !self.locked.contains(id) {
            return Err(TransferError::SystemError(format!(
                "balance update on {} without row lock",
                id
            )));
        }

        sqlx::query("UPDATE accounts_tb SET balance = $1, updated_at = NOW() WHERE id = $2")
            .bind(balance)
            .bind(id.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_transfer(&mut self, record: &TransferRecord) -> Result<(), TransferError> {
        sqlx::query(
            r#"
            INSERT INTO transfers_tb
                (id, sender_id, recipient_id, amount, currency, status, memo, created_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.sender.as_str())
        .bind(record.recipient.as_str())
        .bind(record.amount)
        .bind(record.currency.as_str())
        .bind(record.status.as_str())
        .bind(&record.memo)
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn step_output(
        &mut self,
        saga_id: TransferId,
        step: SagaStep,
    ) -> Result<Option<String>, TransferError> {
        let output = sqlx::query_scalar::<_, String>(
            "SELECT output FROM saga_steps_tb WHERE saga_id = $1 AND step = $2",
        )
        .bind(saga_id.to_string())
        .bind(step.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(output)
    }

    async fn record_step(
        &mut self,
        saga_id: TransferId,
        step: SagaStep,
        output: &str,
    ) -> Result<bool, TransferError> {
        let result = sqlx::query(
            r#"
            INSERT INTO saga_steps_tb (saga_id, step, output, completed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (saga_id, step) DO NOTHING
            "#,
        )
        .bind(saga_id.to_string())
        .bind(step.as_str())
        .bind(output)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<(), TransferError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), TransferError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl TransferStore for PgStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, TransferError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx {
            tx,
            locked: HashSet::new(),
        }))
    }

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, TransferError> {
        let row = sqlx::query("SELECT id, owner_id, balance, currency FROM accounts_tb WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_account(&r)).transpose()
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<TransferRecord>, TransferError> {
        let row = sqlx::query(
            r#"
            SELECT id, sender_id, recipient_id, amount, currency, status, memo, created_at
            FROM transfers_tb
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_transfer(&r)).transpose()
    }

    async fn create_saga(&self, saga: &SagaRecord) -> Result<(), TransferError> {
        sqlx::query(
            r#"
            INSERT INTO transfer_sagas_tb
                (saga_id, sender_id, recipient_id, amount, currency, memo, state,
                 retry_count, created_at, updated_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, 0, $8, $8)
            "#,
        )
        .bind(saga.saga_id.to_string())
        .bind(saga.params.sender.as_str())
        .bind(saga.params.recipient.as_str())
        .bind(saga.params.amount)
        .bind(saga.params.currency.as_str())
        .bind(&saga.params.memo)
        .bind(saga.state.id())
        .bind(saga.created_at)
        .execute(&self.pool)
        .await?;

        debug!(saga_id = %saga.saga_id, "Saga row inserted");
        Ok(())
    }

    async fn get_saga(&self, saga_id: TransferId) -> Result<Option<SagaRecord>, TransferError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transfer_sagas_tb WHERE saga_id = $1",
            SAGA_COLUMNS
        ))
        .bind(saga_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_saga(&r)).transpose()
    }

    async fn update_saga_state_if(
        &self,
        saga_id: TransferId,
        expected: SagaState,
        new_state: SagaState,
        error: Option<&str>,
    ) -> Result<bool, TransferError> {
        let result = sqlx::query(
            r#"
            UPDATE transfer_sagas_tb
            SET state = $1, error_message = COALESCE($2, error_message), updated_at = NOW()
            WHERE saga_id = $3 AND state = $4
            "#,
        )
        .bind(new_state.id())
        .bind(error)
        .bind(saga_id.to_string())
        .bind(expected.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment_saga_retry(&self, saga_id: TransferId) -> Result<(), TransferError> {
        sqlx::query(
            r#"
            UPDATE transfer_sagas_tb
            SET retry_count = retry_count + 1, updated_at = NOW()
            WHERE saga_id = $1
            "#,
        )
        .bind(saga_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_stale_sagas(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<SagaRecord>, TransferError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM transfer_sagas_tb
            WHERE state NOT IN ($1, $2, $3)
              AND updated_at < NOW() - INTERVAL '1 second' * $4
            ORDER BY updated_at ASC
            LIMIT $5
            "#,
            SAGA_COLUMNS
        ))
        .bind(SagaState::Completed.id())
        .bind(SagaState::Failed.id())
        .bind(SagaState::Reversed.id())
        .bind(threshold.as_secs_f64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_saga).collect()
    }

    async fn step_output(
        &self,
        saga_id: TransferId,
        step: SagaStep,
    ) -> Result<Option<String>, TransferError> {
        let output = sqlx::query_scalar::<_, String>(
            "SELECT output FROM saga_steps_tb WHERE saga_id = $1 AND step = $2",
        )
        .bind(saga_id.to_string())
        .bind(step.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(output)
    }

    async fn record_step(
        &self,
        saga_id: TransferId,
        step: SagaStep,
        output: &str,
    ) -> Result<bool, TransferError> {
        let result = sqlx::query(
            r#"
            INSERT INTO saga_steps_tb (saga_id, step, output, completed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (saga_id, step) DO NOTHING
            "#,
        )
        .bind(saga_id.to_string())
        .bind(step.as_str())
        .bind(output)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, TransferError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get_log(name)
        .ok_or_else(|| TransferError::SystemError(format!("column '{}' unreadable", name)))
}

fn parse_transfer_id(raw: &str) -> Result<TransferId, TransferError> {
    raw.parse()
        .map_err(|_| TransferError::SystemError(format!("Invalid transfer id format: {}", raw)))
}

fn row_to_account(row: &PgRow) -> Result<Account, TransferError> {
    let currency: String = column(row, "currency")?;
    Ok(Account {
        id: AccountId::new(column::<String>(row, "id")?),
        owner: column(row, "owner_id")?,
        balance: column(row, "balance")?,
        currency: Currency::parse(&currency)?,
    })
}

fn row_to_transfer(row: &PgRow) -> Result<TransferRecord, TransferError> {
    let id: String = column(row, "id")?;
    let currency: String = column(row, "currency")?;
    let status: String = column(row, "status")?;
    let created_at: DateTime<Utc> = column(row, "created_at")?;

    Ok(TransferRecord {
        id: parse_transfer_id(&id)?,
        sender: AccountId::new(column::<String>(row, "sender_id")?),
        recipient: AccountId::new(column::<String>(row, "recipient_id")?),
        amount: column(row, "amount")?,
        currency: Currency::parse(&currency)?,
        status: status.parse::<TransferStatus>()?,
        memo: column(row, "memo")?,
        created_at,
    })
}

fn row_to_saga(row: &PgRow) -> Result<SagaRecord, TransferError> {
    let saga_id: String = column(row, "saga_id")?;
    let currency: String = column(row, "currency")?;

    let state_id: i16 = column(row, "state")?;
    let state = SagaState::from_id(state_id)
        .ok_or_else(|| TransferError::SystemError(format!("Invalid state ID: {}", state_id)))?;

    Ok(SagaRecord {
        saga_id: parse_transfer_id(&saga_id)?,
        params: TransferParams {
            sender: AccountId::new(column::<String>(row, "sender_id")?),
            recipient: AccountId::new(column::<String>(row, "recipient_id")?),
            amount: column(row, "amount")?,
            currency: Currency::parse(&currency)?,
            memo: column(row, "memo")?,
        },
        state,
        error: column(row, "error_message")?,
        retry_count: column(row, "retry_count")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}
