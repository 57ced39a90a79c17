//! User directory storage

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use crate::{
    error::{AppError, AppResult},
    models::{
        loan::LoanStatus,
        user::{NewUser, User, UserChanges},
    },
};

use super::CasOutcome;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find(&self, id: i32) -> AppResult<Option<User>>;

    /// Case-insensitive email lookup
    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>>;

    async fn list(&self) -> AppResult<Vec<User>>;

    /// Fails with `Duplicate` if the email is taken
    async fn create(&self, user: &NewUser) -> AppResult<User>;

    async fn update(&self, id: i32, changes: &UserChanges) -> AppResult<Option<User>>;

    /// Remove the user iff no ACTIVE loan references them.
    /// `Stale` means active loans remain.
    async fn delete_if_no_active_loans(&self, id: i32) -> AppResult<CasOutcome<()>>;
}

#[derive(Clone)]
pub struct PgUserDirectory {
    pool: Pool<Postgres>,
}

impl PgUserDirectory {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find(&self, id: i32) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE LOWER(email) = LOWER($1)")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn list(&self) -> AppResult<Vec<User>> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY lastname, firstname")
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    async fn create(&self, user: &NewUser) -> AppResult<User> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (firstname, lastname, email, password, role)
            VALUES ($1, $2, LOWER($3), $4, $5)
            RETURNING *
            "#,
        )
        .bind(&user.firstname)
        .bind(&user.lastname)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::from_write(e, "A user with this email"))
    }

    async fn update(&self, id: i32, changes: &UserChanges) -> AppResult<Option<User>> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET
                firstname = COALESCE($2, firstname),
                lastname = COALESCE($3, lastname),
                email = COALESCE(LOWER($4), email),
                password = COALESCE($5, password),
                role = COALESCE($6, role),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&changes.firstname)
        .bind(&changes.lastname)
        .bind(&changes.email)
        .bind(&changes.password_hash)
        .bind(changes.role)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_write(e, "A user with this email"))
    }

    async fn delete_if_no_active_loans(&self, id: i32) -> AppResult<CasOutcome<()>> {
        let mut tx = self.pool.begin().await?;

        // Loan inserts take a key-share lock on the student row, so holding
        // this lock keeps new active loans out until the transaction ends.
        let locked: Option<i32> = sqlx::query_scalar("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Ok(CasOutcome::Missing);
        }

        let borrowing: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM loans WHERE student_id = $1 AND status = $2)",
        )
        .bind(id)
        .bind(LoanStatus::Active)
        .fetch_one(&mut *tx)
        .await?;
        if borrowing {
            return Ok(CasOutcome::Stale);
        }

        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(CasOutcome::Applied(()))
    }
}
