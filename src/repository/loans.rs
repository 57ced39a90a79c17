//! Loan ledger storage

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use crate::{
    error::{AppError, AppResult},
    models::loan::{Loan, LoanQuery, LoanStatus, NewLoan},
};

use super::CasOutcome;

/// Storage abstraction over Loan records
///
/// A loan is created ACTIVE and mutated at most once afterwards
/// (ACTIVE -> RETURNED), through a status-guarded primitive.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoanLedger: Send + Sync {
    async fn find(&self, id: i32) -> AppResult<Option<Loan>>;

    /// Loans matching the filter, oldest first
    async fn list(&self, query: &LoanQuery) -> AppResult<Vec<Loan>>;

    /// Append an ACTIVE loan. Fails with `Duplicate` if the book already has one
    /// and with `NotFound` if the student does not exist.
    async fn create(&self, loan: &NewLoan) -> AppResult<Loan>;

    /// ACTIVE -> RETURNED iff the loan is still active
    async fn mark_returned_if_active(
        &self,
        id: i32,
        return_date: DateTime<Utc>,
    ) -> AppResult<CasOutcome<Loan>>;

    /// Remove the loan iff its status equals `expected`
    async fn delete_if_status(&self, id: i32, expected: LoanStatus) -> AppResult<CasOutcome<Loan>>;

    async fn active_for_book(&self, book_id: i32) -> AppResult<Vec<Loan>>;

    async fn count_active_for_student(&self, student_id: i32) -> AppResult<i64>;
}

#[derive(Clone)]
pub struct PgLoanLedger {
    pool: Pool<Postgres>,
}

impl PgLoanLedger {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn exists(&self, id: i32) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM loans WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl LoanLedger for PgLoanLedger {
    async fn find(&self, id: i32) -> AppResult<Option<Loan>> {
        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(loan)
    }

    async fn list(&self, query: &LoanQuery) -> AppResult<Vec<Loan>> {
        let loans = sqlx::query_as::<_, Loan>(
            r#"
            SELECT * FROM loans
            WHERE ($1::INTEGER IS NULL OR book_id = $1)
              AND ($2::INTEGER IS NULL OR student_id = $2)
              AND ($3::TEXT IS NULL OR status = $3)
            ORDER BY loan_date, id
            "#,
        )
        .bind(query.book_id)
        .bind(query.student_id)
        .bind(query.status)
        .fetch_all(&self.pool)
        .await?;
        Ok(loans)
    }

    async fn create(&self, loan: &NewLoan) -> AppResult<Loan> {
        // Inserts nothing when the student is gone; the row lock orders this
        // against a concurrent guarded user delete.
        sqlx::query_as::<_, Loan>(
            r#"
            INSERT INTO loans (book_id, student_id, loan_date, return_date, status)
            SELECT $1, id, $3, NULL, $4 FROM users WHERE id = $2 FOR KEY SHARE
            RETURNING *
            "#,
        )
        .bind(loan.book_id)
        .bind(loan.student_id)
        .bind(loan.loan_date)
        .bind(LoanStatus::Active)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_write(e, "An active loan for this book"))?
        .ok_or_else(|| AppError::NotFound(format!("Student with id {} not found", loan.student_id)))
    }

    async fn mark_returned_if_active(
        &self,
        id: i32,
        return_date: DateTime<Utc>,
    ) -> AppResult<CasOutcome<Loan>> {
        let updated = sqlx::query_as::<_, Loan>(
            r#"
            UPDATE loans SET status = $3, return_date = $2
            WHERE id = $1 AND status = $4
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(return_date)
        .bind(LoanStatus::Returned)
        .bind(LoanStatus::Active)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(loan) => Ok(CasOutcome::Applied(loan)),
            None if self.exists(id).await? => Ok(CasOutcome::Stale),
            None => Ok(CasOutcome::Missing),
        }
    }

    async fn delete_if_status(&self, id: i32, expected: LoanStatus) -> AppResult<CasOutcome<Loan>> {
        let deleted = sqlx::query_as::<_, Loan>(
            "DELETE FROM loans WHERE id = $1 AND status = $2 RETURNING *",
        )
        .bind(id)
        .bind(expected)
        .fetch_optional(&self.pool)
        .await?;

        match deleted {
            Some(loan) => Ok(CasOutcome::Applied(loan)),
            None if self.exists(id).await? => Ok(CasOutcome::Stale),
            None => Ok(CasOutcome::Missing),
        }
    }

    async fn active_for_book(&self, book_id: i32) -> AppResult<Vec<Loan>> {
        let loans = sqlx::query_as::<_, Loan>(
            "SELECT * FROM loans WHERE book_id = $1 AND status = $2 ORDER BY loan_date",
        )
        .bind(book_id)
        .bind(LoanStatus::Active)
        .fetch_all(&self.pool)
        .await?;
        Ok(loans)
    }

    async fn count_active_for_student(&self, student_id: i32) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM loans WHERE student_id = $1 AND status = $2",
        )
        .bind(student_id)
        .bind(LoanStatus::Active)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
