//! Account Ledger
//!
//! The only component allowed to write balances. Every mutation happens on a
//! row locked through the enclosing [`LedgerTx`].

use tracing::debug;

use super::error::TransferError;
use super::store::{LedgerTx, TransferStore};
use super::types::{Account, AccountId, Currency, TransferParams};

/// Non-locking existence and currency check of both parties.
///
/// Runs before any row lock is taken so unknown accounts and cross-currency
/// requests never queue behind in-flight transfers.
pub async fn precheck_accounts(
    store: &dyn TransferStore,
    params: &TransferParams,
) -> Result<(), TransferError> {
    for id in [&params.sender, &params.recipient] {
        match store.get_account(id).await? {
            None => return Err(TransferError::AccountNotFound(id.to_string())),
            Some(account) if account.currency != params.currency => {
                return Err(TransferError::Validation(format!(
                    "account {} holds {}, request is {}",
                    id, account.currency, params.currency
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Exclusive-locking access to balances inside one transactional scope
pub struct AccountLedger<'t> {
    tx: &'t mut dyn LedgerTx,
}

impl<'t> AccountLedger<'t> {
    pub fn new(tx: &'t mut dyn LedgerTx) -> Self {
        Self { tx }
    }

    /// Lock the row for the lifetime of the scope and return it
    pub async fn lock_and_get(
        &mut self,
        id: &AccountId,
        currency: &Currency,
    ) -> Result<Account, TransferError> {
        self.tx
            .lock_account(id, currency)
            .await?
            .ok_or_else(|| TransferError::AccountNotFound(id.to_string()))
    }

    /// Lock two accounts in ascending id order, whatever their roles.
    ///
    /// Two transfers moving money in opposite directions between the same
    /// pair acquire the locks in the same order and cannot deadlock.
    /// Returns the accounts in argument order.
    pub async fn lock_pair(
        &mut self,
        a: &AccountId,
        b: &AccountId,
        currency: &Currency,
    ) -> Result<(Account, Account), TransferError> {
        if a <= b {
            let first = self.lock_and_get(a, currency).await?;
            let second = self.lock_and_get(b, currency).await?;
            Ok((first, second))
        } else {
            let second = self.lock_and_get(b, currency).await?;
            let first = self.lock_and_get(a, currency).await?;
            Ok((first, second))
        }
    }

    /// Write a balance; the caller must hold the row lock
    pub async fn update_balance(
        &mut self,
        id: &AccountId,
        new_balance: i64,
    ) -> Result<(), TransferError> {
        if new_balance < 0 {
            return Err(TransferError::SystemError(format!(
                "refusing negative balance {} on {}",
                new_balance, id
            )));
        }
        self.tx.update_balance(id, new_balance).await
    }

    /// Lock, check funds, decrement. Returns the account after the write.
    pub async fn debit(
        &mut self,
        id: &AccountId,
        currency: &Currency,
        amount: i64,
    ) -> Result<Account, TransferError> {
        let mut account = self.lock_and_get(id, currency).await?;
        if account.balance < amount {
            debug!(account = %id, balance = account.balance, amount, "Insufficient funds");
            return Err(TransferError::InsufficientFunds);
        }
        account.balance -= amount;
        self.update_balance(id, account.balance).await?;
        Ok(account)
    }

    /// Lock, increment. Returns the account after the write.
    pub async fn credit(
        &mut self,
        id: &AccountId,
        currency: &Currency,
        amount: i64,
    ) -> Result<Account, TransferError> {
        let mut account = self.lock_and_get(id, currency).await?;
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| TransferError::Validation(format!("balance overflow on {}", id)))?;
        self.update_balance(id, account.balance).await?;
        Ok(account)
    }
}
