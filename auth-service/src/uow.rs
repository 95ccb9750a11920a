//! `UnitOfWork`: the transactional scope from spec §4.8.
//!
//! Grounded on `original_source/.../unit_of_work.py`'s commit-on-success /
//! rollback-on-error contract, with one deliberate departure recorded in
//! SPEC_FULL.md §4.8: the original tracks nested-entry via a reference-counted
//! `_transaction_depth` so inner use cases can call outer use cases without
//! opening a second transaction. Rust's ownership model already forbids two live
//! `sqlx::Transaction` values on one connection at compile time (it is neither
//! `Clone` nor `Copy`), so there is nothing to count: a use case that wants to
//! compose with another simply takes `&mut UnitOfWork` instead of owning a fresh
//! one. This file has no counter to get out of sync.

use anyhow::Result;
use sqlx::{PgPool, Postgres, Transaction};

/// The transactional context repositories operate under. A coordinator opens
/// one per top-level request; use cases it calls into receive `&mut UnitOfWork`
/// rather than opening their own.
pub struct UnitOfWork<'a> {
    tx: Option<Transaction<'a, Postgres>>,
}

impl<'a> UnitOfWork<'a> {
    pub async fn begin(pool: &PgPool) -> Result<UnitOfWork<'static>> {
        let tx = pool.begin().await?;
        Ok(UnitOfWork { tx: Some(tx) })
    }

    /// Borrow the live transaction for a repository call. Panics if called after
    /// `commit`/`rollback` consumed `self` — which the type system already
    /// prevents for normal call sites, since those methods take `self` by value.
    pub fn conn(&mut self) -> &mut Transaction<'a, Postgres> {
        self.tx.as_mut().expect("UnitOfWork used after commit/rollback")
    }

    pub async fn commit(mut self) -> Result<()> {
        let tx = self.tx.take().expect("UnitOfWork double-commit");
        tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        let tx = self.tx.take().expect("UnitOfWork double-rollback");
        tx.rollback().await?;
        Ok(())
    }
}

impl<'a> Drop for UnitOfWork<'a> {
    /// Rollback-on-scope-exit-without-commit. `sqlx::Transaction`'s own `Drop`
    /// already issues a ROLLBACK when dropped uncommitted; this impl exists so
    /// that behavior is a documented, intentional part of the UoW contract rather
    /// than an incidental property of the underlying type.
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::debug!("UnitOfWork dropped without commit; transaction will roll back");
        }
    }
}
