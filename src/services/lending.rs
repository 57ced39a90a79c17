//! Lending coordinator
//!
//! Keeps every book's `availability` flag consistent with the loans that
//! reference it: a book is unavailable exactly when one ACTIVE loan points at
//! it. Nothing here holds a lock across storage calls. Each operation composes
//! the catalog's version-guarded writes and the ledger's status-guarded writes
//! into bounded retry loops, so concurrent operations on one book are ordered
//! by the store.
//!
//! `Book.availability` is the admission record: a borrow only proceeds after
//! flipping it with a conditional write, and the ACTIVE loan is appended
//! afterwards. The borrow then re-asserts its claim with a second conditional
//! write, so a reconciliation that saw the book between claim and insert loses
//! its own write, or the borrow withdraws its loan. Returns close the loan
//! first and release the book second. An interruption between the two steps
//! therefore can only leave a book unavailable with no active loan, which
//! `reconcile_book` repairs.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    error::{AppError, AppResult},
    models::{
        book::{Book, BookShort},
        loan::{Loan, LoanDetails, LoanQuery, LoanStatus, NewLoan},
        principal::{Action, Principal},
        user::UserShort,
    },
    repository::{CasOutcome, Repository},
};

use super::retry::RetryPolicy;

/// Outcome of releasing a book after its loan closed
#[derive(Debug, Clone, PartialEq)]
enum Release {
    Restored(Book),
    AlreadyAvailable,
    BookGone,
}

/// What `reconcile_book` found and did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    AlreadyConsistent,
    AvailabilityRestored,
    /// Book marked available while the ledger holds an active loan; left untouched
    ActiveLoanMismatch,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReconcileReport {
    pub book: Book,
    pub action: ReconcileAction,
}

/// A book (or dangling reference) whose availability disagrees with the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct InvariantViolation {
    pub book_id: i32,
    /// `None` when active loans reference a book that no longer exists
    pub availability: Option<bool>,
    pub active_loan_ids: Vec<i32>,
}

#[derive(Clone)]
pub struct LendingService {
    repository: Repository,
    retry: RetryPolicy,
}

impl LendingService {
    pub fn new(repository: Repository, retry: RetryPolicy) -> Self {
        Self { repository, retry }
    }

    /// Borrow a book for a student
    pub async fn borrow(&self, book_id: i32, student_id: i32, principal: &Principal) -> AppResult<Loan> {
        principal.authorize(Action::Borrow { student_id })?;

        self.repository
            .users
            .find(student_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Student with id {} not found", student_id)))?;

        let claimed = self.claim_book(book_id).await?;

        let new_loan = NewLoan {
            book_id,
            student_id,
            loan_date: Utc::now(),
        };

        match self.repository.loans.create(&new_loan).await {
            Ok(loan) => {
                self.confirm_claim(&loan).await?;
                tracing::info!(loan_id = loan.id, book_id, student_id, "Book borrowed");
                Ok(loan)
            }
            Err(AppError::Duplicate(_)) => {
                // The ledger already had an active loan while the book read as
                // available; keeping the claim brings the pair back in line.
                tracing::warn!(book_id, "Active loan already recorded for an available book");
                Err(AppError::AlreadyBorrowed(book_id))
            }
            Err(err) => {
                tracing::warn!(book_id, version = claimed.version, "Loan creation failed, releasing claimed book");
                if let Err(release_err) = self.release_book(book_id).await {
                    tracing::error!(
                        book_id,
                        error = %release_err,
                        "Could not release book after failed borrow; reconcile required"
                    );
                }
                Err(err)
            }
        }
    }

    /// Return a borrowed book
    pub async fn return_loan(&self, loan_id: i32, principal: &Principal) -> AppResult<Loan> {
        let loan = self.find_loan(loan_id).await?;
        principal.authorize(Action::ActOnLoan { owner_id: loan.student_id })?;

        if loan.status == LoanStatus::Returned {
            return Err(AppError::AlreadyReturned(loan_id));
        }

        let returned = match self
            .repository
            .loans
            .mark_returned_if_active(loan_id, Utc::now())
            .await?
        {
            CasOutcome::Applied(loan) => loan,
            CasOutcome::Stale => return Err(AppError::AlreadyReturned(loan_id)),
            CasOutcome::Missing => return Err(loan_not_found(loan_id)),
        };

        let release = self
            .release_book(returned.book_id)
            .await
            .map_err(|err| book_still_held(err, loan_id, "returned", returned.book_id))?;
        if let Release::Restored(book) = release {
            tracing::debug!(book_id = book.id, version = book.version, "Book available again");
        }

        tracing::info!(loan_id, book_id = returned.book_id, "Book returned");
        Ok(returned)
    }

    /// Remove a loan record (administrative correction)
    ///
    /// Removing an ACTIVE loan makes its book available again.
    pub async fn delete_loan(&self, loan_id: i32, principal: &Principal) -> AppResult<()> {
        principal.authorize(Action::Administer)?;

        for attempt in 0..self.retry.max_attempts() {
            let loan = self.find_loan(loan_id).await?;

            match self.repository.loans.delete_if_status(loan_id, loan.status).await? {
                CasOutcome::Applied(removed) => {
                    if removed.is_active() {
                        self.release_book(removed.book_id)
                            .await
                            .map_err(|err| book_still_held(err, loan_id, "deleted", removed.book_id))?;
                    }
                    tracing::info!(loan_id, book_id = removed.book_id, status = %removed.status, "Loan deleted");
                    return Ok(());
                }
                CasOutcome::Missing => return Err(loan_not_found(loan_id)),
                CasOutcome::Stale => {
                    tracing::debug!(loan_id, attempt, "Loan changed while deleting, retrying");
                    self.retry.backoff(attempt).await;
                }
            }
        }

        Err(AppError::Conflict(format!(
            "Loan {} kept changing while being deleted, please retry",
            loan_id
        )))
    }

    /// Delete a book; rejected while it is lent out
    pub async fn delete_book(&self, book_id: i32, principal: &Principal) -> AppResult<()> {
        principal.authorize(Action::Administer)?;

        for attempt in 0..self.retry.max_attempts() {
            let book = self.find_book(book_id).await?;

            if !self.repository.loans.active_for_book(book_id).await?.is_empty() {
                return Err(AppError::Conflict(format!(
                    "Book {} has an active loan; return or delete the loan before deleting the book",
                    book_id
                )));
            }
            if !book.availability {
                return Err(AppError::Conflict(format!(
                    "Book {} is marked unavailable but has no active loan; \
                     reconcile it with POST /api/v1/books/{}/reconcile before deleting",
                    book_id, book_id
                )));
            }

            match self.repository.books.delete_if_version(book_id, book.version).await? {
                CasOutcome::Applied(()) => {
                    tracing::info!(book_id, title = %book.title, "Book deleted");
                    return Ok(());
                }
                CasOutcome::Missing => return Err(book_not_found(book_id)),
                CasOutcome::Stale => {
                    tracing::debug!(book_id, attempt, "Book changed while deleting, retrying");
                    self.retry.backoff(attempt).await;
                }
            }
        }

        Err(AppError::Conflict(format!(
            "Book {} kept changing while being deleted, please retry",
            book_id
        )))
    }

    pub async fn get_loan(&self, loan_id: i32, principal: &Principal) -> AppResult<Loan> {
        let loan = self.find_loan(loan_id).await?;
        principal.authorize(Action::ActOnLoan { owner_id: loan.student_id })?;
        Ok(loan)
    }

    /// List loans with book and student projections
    pub async fn list_loans(&self, query: &LoanQuery, principal: &Principal) -> AppResult<Vec<LoanDetails>> {
        principal.authorize(Action::Read)?;

        let loans = self.repository.loans.list(query).await?;

        let mut books: HashMap<i32, Option<BookShort>> = HashMap::new();
        let mut students: HashMap<i32, Option<UserShort>> = HashMap::new();
        let mut result = Vec::with_capacity(loans.len());

        for loan in loans {
            if !books.contains_key(&loan.book_id) {
                let book = self.repository.books.find(loan.book_id).await?;
                books.insert(loan.book_id, book.as_ref().map(BookShort::from));
            }
            if !students.contains_key(&loan.student_id) {
                let student = self.repository.users.find(loan.student_id).await?;
                students.insert(loan.student_id, student.as_ref().map(UserShort::from));
            }

            result.push(LoanDetails {
                id: loan.id,
                status: loan.status,
                loan_date: loan.loan_date,
                return_date: loan.return_date,
                book_id: loan.book_id,
                student_id: loan.student_id,
                book: books.get(&loan.book_id).cloned().flatten(),
                student: students.get(&loan.student_id).cloned().flatten(),
            });
        }

        Ok(result)
    }

    /// Make an unavailable book available again when no active loan holds it
    pub async fn reconcile_book(&self, book_id: i32, principal: &Principal) -> AppResult<ReconcileReport> {
        principal.authorize(Action::Administer)?;

        for attempt in 0..self.retry.max_attempts() {
            let book = self.find_book(book_id).await?;
            let has_active_loan = !self.repository.loans.active_for_book(book_id).await?.is_empty();

            let action = match (book.availability, has_active_loan) {
                (true, false) | (false, true) => ReconcileAction::AlreadyConsistent,
                (true, true) => ReconcileAction::ActiveLoanMismatch,
                (false, false) => ReconcileAction::AvailabilityRestored,
            };

            if action != ReconcileAction::AvailabilityRestored {
                if action == ReconcileAction::ActiveLoanMismatch {
                    tracing::warn!(book_id, "Book is available but has an active loan");
                }
                return Ok(ReconcileReport { book, action });
            }

            match self
                .repository
                .books
                .set_availability_if_version(book_id, book.version, true)
                .await?
            {
                CasOutcome::Applied(book) => {
                    tracing::warn!(book_id, "Availability restored for book without active loan");
                    return Ok(ReconcileReport { book, action });
                }
                CasOutcome::Missing => return Err(book_not_found(book_id)),
                CasOutcome::Stale => self.retry.backoff(attempt).await,
            }
        }

        Err(AppError::Conflict(format!(
            "Book {} kept changing during reconciliation, please retry",
            book_id
        )))
    }

    /// Report every book whose availability disagrees with its active loans
    pub async fn audit(&self, principal: &Principal) -> AppResult<Vec<InvariantViolation>> {
        principal.authorize(Action::Administer)?;

        let active = self
            .repository
            .loans
            .list(&LoanQuery {
                status: Some(LoanStatus::Active),
                ..Default::default()
            })
            .await?;
        let books = self.repository.books.list().await?;

        let mut active_by_book: BTreeMap<i32, Vec<i32>> = BTreeMap::new();
        for loan in &active {
            active_by_book.entry(loan.book_id).or_default().push(loan.id);
        }

        let mut violations = Vec::new();
        for book in &books {
            let loan_ids = active_by_book.remove(&book.id).unwrap_or_default();
            if loan_ids.len() > 1 || book.availability != loan_ids.is_empty() {
                violations.push(InvariantViolation {
                    book_id: book.id,
                    availability: Some(book.availability),
                    active_loan_ids: loan_ids,
                });
            }
        }
        // Whatever is left points at books that no longer exist
        for (book_id, loan_ids) in active_by_book {
            violations.push(InvariantViolation {
                book_id,
                availability: None,
                active_loan_ids: loan_ids,
            });
        }

        if !violations.is_empty() {
            tracing::warn!(count = violations.len(), "Availability audit found inconsistencies");
        }
        Ok(violations)
    }

    /// AVAILABLE -> BORROWED under the version guard
    async fn claim_book(&self, book_id: i32) -> AppResult<Book> {
        for attempt in 0..self.retry.max_attempts() {
            let book = self.find_book(book_id).await?;
            if !book.availability {
                return Err(AppError::AlreadyBorrowed(book_id));
            }

            match self
                .repository
                .books
                .set_availability_if_version(book_id, book.version, false)
                .await?
            {
                CasOutcome::Applied(claimed) => return Ok(claimed),
                CasOutcome::Missing => return Err(book_not_found(book_id)),
                CasOutcome::Stale => {
                    tracing::debug!(book_id, attempt, version = book.version, "Lost borrow race, retrying");
                    self.retry.backoff(attempt).await;
                }
            }
        }

        tracing::warn!(book_id, "Borrow retries exhausted");
        Err(AppError::Conflict(format!(
            "Book {} is under contention, please retry",
            book_id
        )))
    }

    /// Bump the claimed book's version once its loan is recorded
    ///
    /// If the book was released in the meantime the loan is withdrawn and the
    /// borrow fails; the book is left as whoever released it left it.
    async fn confirm_claim(&self, loan: &Loan) -> AppResult<()> {
        let book_id = loan.book_id;

        for attempt in 0..self.retry.max_attempts() {
            let book = match self.repository.books.find(book_id).await? {
                Some(book) if !book.availability => book,
                Some(_) => {
                    tracing::warn!(book_id, loan_id = loan.id, "Claimed book was released before the loan was confirmed");
                    self.withdraw_loan(loan).await;
                    return Err(AppError::Conflict(format!(
                        "Book {} was released while being borrowed, please retry",
                        book_id
                    )));
                }
                None => {
                    self.withdraw_loan(loan).await;
                    return Err(book_not_found(book_id));
                }
            };

            match self
                .repository
                .books
                .set_availability_if_version(book_id, book.version, false)
                .await?
            {
                CasOutcome::Applied(_) => return Ok(()),
                CasOutcome::Missing => {
                    self.withdraw_loan(loan).await;
                    return Err(book_not_found(book_id));
                }
                CasOutcome::Stale => {
                    tracing::debug!(book_id, attempt, "Book changed while confirming borrow, retrying");
                    self.retry.backoff(attempt).await;
                }
            }
        }

        // Still unavailable, but we cannot tell whose claim that is any more
        self.withdraw_loan(loan).await;
        tracing::error!(book_id, "Could not confirm borrow; book may need reconciling");
        Err(AppError::Conflict(format!(
            "Book {} is under contention, please retry",
            book_id
        )))
    }

    /// Drop a loan whose borrow could not be confirmed
    async fn withdraw_loan(&self, loan: &Loan) {
        match self
            .repository
            .loans
            .delete_if_status(loan.id, LoanStatus::Active)
            .await
        {
            Ok(CasOutcome::Applied(_)) => {
                tracing::debug!(loan_id = loan.id, book_id = loan.book_id, "Unconfirmed loan withdrawn");
            }
            Ok(_) => {
                tracing::warn!(loan_id = loan.id, "Unconfirmed loan changed before it could be withdrawn");
            }
            Err(err) => {
                tracing::error!(loan_id = loan.id, error = %err, "Could not withdraw unconfirmed loan; reconcile required");
            }
        }
    }

    /// BORROWED -> AVAILABLE under the version guard, re-reading the version each attempt
    async fn release_book(&self, book_id: i32) -> AppResult<Release> {
        for attempt in 0..self.retry.max_attempts() {
            let Some(book) = self.repository.books.find(book_id).await? else {
                tracing::debug!(book_id, "Released book no longer exists");
                return Ok(Release::BookGone);
            };
            if book.availability {
                tracing::warn!(book_id, "Released book was already available");
                return Ok(Release::AlreadyAvailable);
            }

            match self
                .repository
                .books
                .set_availability_if_version(book_id, book.version, true)
                .await?
            {
                CasOutcome::Applied(book) => return Ok(Release::Restored(book)),
                CasOutcome::Missing => return Ok(Release::BookGone),
                CasOutcome::Stale => {
                    tracing::debug!(book_id, attempt, "Book changed while releasing, retrying");
                    self.retry.backoff(attempt).await;
                }
            }
        }

        tracing::error!(book_id, "Could not restore availability; reconcile required");
        Err(AppError::Conflict(format!(
            "Availability of book {} could not be restored, please reconcile it",
            book_id
        )))
    }

    async fn find_book(&self, book_id: i32) -> AppResult<Book> {
        self.repository
            .books
            .find(book_id)
            .await?
            .ok_or_else(|| book_not_found(book_id))
    }

    async fn find_loan(&self, loan_id: i32) -> AppResult<Loan> {
        self.repository
            .loans
            .find(loan_id)
            .await?
            .ok_or_else(|| loan_not_found(loan_id))
    }
}

fn book_not_found(book_id: i32) -> AppError {
    AppError::NotFound(format!("Book with id {} not found", book_id))
}

fn loan_not_found(loan_id: i32) -> AppError {
    AppError::NotFound(format!("Loan with id {} not found", loan_id))
}

/// The loan change is committed at this point; only the release is missing
fn book_still_held(err: AppError, loan_id: i32, done: &str, book_id: i32) -> AppError {
    match err {
        AppError::Conflict(_) => AppError::Conflict(format!(
            "Loan {} was {} but book {} is still marked unavailable; reconcile the book",
            loan_id, done, book_id
        )),
        other => other,
    }
}
