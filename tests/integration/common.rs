//! Shared fixtures

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lending_server::{
    config::{AppConfig, AuthConfig, LendingConfig},
    models::{user::NewUser, Book, CreateBook, Loan, LoanQuery, LoanStatus, NewLoan, Principal, Role},
    repository::{
        memory::{MemoryLoanLedger, MemoryStore},
        CasOutcome, LoanLedger, Repository, UserDirectory,
    },
    services::Services,
    AppResult, AppState,
};
use tokio::sync::Notify;

/// Synthetic admin principal; admin actions never look the caller up
pub const ADMIN: Principal = Principal {
    user_id: 0,
    role: Role::Admin,
};

pub struct Library {
    pub services: Services,
    pub repository: Repository,
}

impl Library {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        Self::with_ledger(&store, Arc::new(store.loan_ledger()))
    }

    /// Library over `store` whose loans go through `loans` instead
    pub fn with_ledger(store: &MemoryStore, loans: Arc<dyn LoanLedger>) -> Self {
        let repository = Repository::from_parts(
            Arc::new(store.book_catalog()),
            loans,
            Arc::new(store.user_directory()),
        );
        let services = Services::new(repository.clone(), AuthConfig::default(), &LendingConfig::default());
        Self { services, repository }
    }

    pub async fn add_book(&self, title: &str) -> Book {
        self.services
            .catalog
            .create_book(
                CreateBook {
                    title: title.to_string(),
                    author: "Test Author".to_string(),
                    genre: "Fiction".to_string(),
                    publication_year: 1949,
                },
                &ADMIN,
            )
            .await
            .expect("book created")
    }

    /// Insert a student directly, skipping password hashing
    pub async fn add_student(&self, email: &str) -> Principal {
        let user = self
            .repository
            .users
            .create(&NewUser {
                firstname: "Test".to_string(),
                lastname: "Student".to_string(),
                email: email.to_string(),
                password_hash: "not-a-real-hash".to_string(),
                role: Role::Student,
            })
            .await
            .expect("student created");
        Principal {
            user_id: user.id,
            role: Role::Student,
        }
    }

    pub async fn book(&self, id: i32) -> Book {
        self.services.catalog.get_book(id, &ADMIN).await.expect("book exists")
    }

    /// Every book satisfies availability == no active loan
    pub async fn assert_consistent(&self) {
        let violations = self.services.lending.audit(&ADMIN).await.expect("audit runs");
        assert!(violations.is_empty(), "inconsistent state: {:?}", violations);
    }
}

/// Ledger that parks every `create` until the test opens the gate
///
/// `entered` fires once a create is parked, before anything is written.
pub struct GatedLedger {
    inner: MemoryLoanLedger,
    pub entered: Notify,
    pub open: Notify,
}

impl GatedLedger {
    pub fn new(inner: MemoryLoanLedger) -> Self {
        Self {
            inner,
            entered: Notify::new(),
            open: Notify::new(),
        }
    }
}

#[async_trait]
impl LoanLedger for GatedLedger {
    async fn find(&self, id: i32) -> AppResult<Option<Loan>> {
        self.inner.find(id).await
    }

    async fn list(&self, query: &LoanQuery) -> AppResult<Vec<Loan>> {
        self.inner.list(query).await
    }

    async fn create(&self, loan: &NewLoan) -> AppResult<Loan> {
        self.entered.notify_one();
        self.open.notified().await;
        self.inner.create(loan).await
    }

    async fn mark_returned_if_active(
        &self,
        id: i32,
        return_date: DateTime<Utc>,
    ) -> AppResult<CasOutcome<Loan>> {
        self.inner.mark_returned_if_active(id, return_date).await
    }

    async fn delete_if_status(&self, id: i32, expected: LoanStatus) -> AppResult<CasOutcome<Loan>> {
        self.inner.delete_if_status(id, expected).await
    }

    async fn active_for_book(&self, book_id: i32) -> AppResult<Vec<Loan>> {
        self.inner.active_for_book(book_id).await
    }

    async fn count_active_for_student(&self, student_id: i32) -> AppResult<i64> {
        self.inner.count_active_for_student(student_id).await
    }
}

/// Application state over a fresh in-memory repository with a bootstrap admin
pub async fn app_state(admin_email: &str, admin_password: &str) -> AppState {
    let mut config = AppConfig::default();
    config.auth.bootstrap_admin = Some(lending_server::config::BootstrapAdmin {
        email: admin_email.to_string(),
        password: admin_password.to_string(),
    });

    let state = AppState::new(config, Repository::in_memory());
    state
        .services
        .users
        .ensure_admin()
        .await
        .expect("bootstrap admin");
    state
}
