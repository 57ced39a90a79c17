//! Repository layer: storage traits and their Postgres / in-memory backends

pub mod books;
pub mod loans;
pub mod memory;
pub mod users;

use std::sync::Arc;

use sqlx::{Pool, Postgres};

use crate::error::AppResult;

pub use books::BookCatalog;
pub use loans::LoanLedger;
pub use users::UserDirectory;

/// Result of a conditional (compare-and-swap) write
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome<T> {
    /// The guard matched and the write was applied
    Applied(T),
    /// The record exists but no longer matches the expected version/status
    Stale,
    /// The record does not exist
    Missing,
}

impl<T> CasOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}

/// Storage handles shared by all services
#[derive(Clone)]
pub struct Repository {
    pub books: Arc<dyn BookCatalog>,
    pub loans: Arc<dyn LoanLedger>,
    pub users: Arc<dyn UserDirectory>,
    pool: Option<Pool<Postgres>>,
}

impl Repository {
    /// Create a repository backed by the given Postgres pool
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            books: Arc::new(books::PgBookCatalog::new(pool.clone())),
            loans: Arc::new(loans::PgLoanLedger::new(pool.clone())),
            users: Arc::new(users::PgUserDirectory::new(pool.clone())),
            pool: Some(pool),
        }
    }

    /// Create a repository that keeps everything in process memory
    pub fn in_memory() -> Self {
        let store = memory::MemoryStore::new();
        Self::from_parts(
            Arc::new(store.book_catalog()),
            Arc::new(store.loan_ledger()),
            Arc::new(store.user_directory()),
        )
    }

    pub fn from_parts(
        books: Arc<dyn BookCatalog>,
        loans: Arc<dyn LoanLedger>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            books,
            loans,
            users,
            pool: None,
        }
    }

    /// Check that the backing store answers
    pub async fn ping(&self) -> AppResult<()> {
        if let Some(pool) = &self.pool {
            sqlx::query("SELECT 1").execute(pool).await?;
        }
        Ok(())
    }
}
