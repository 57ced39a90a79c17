//! Book catalog storage

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use crate::{
    error::{AppError, AppResult},
    models::book::{Book, CreateBook, UpdateBook},
};

use super::CasOutcome;

/// Storage abstraction over Book records
///
/// `availability` and `version` can only be written through the
/// version-guarded primitives; every mutation increments `version`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BookCatalog: Send + Sync {
    async fn find(&self, id: i32) -> AppResult<Option<Book>>;

    async fn list(&self) -> AppResult<Vec<Book>>;

    /// Insert a new, available book. Fails with `Duplicate` on a taken title.
    async fn create(&self, book: &CreateBook) -> AppResult<Book>;

    /// Change descriptive fields. Returns `None` if the book does not exist.
    async fn update_details(&self, id: i32, changes: &UpdateBook) -> AppResult<Option<Book>>;

    /// Set availability iff the stored version equals `expected_version`
    async fn set_availability_if_version(
        &self,
        id: i32,
        expected_version: i64,
        available: bool,
    ) -> AppResult<CasOutcome<Book>>;

    /// Delete iff the stored version equals `expected_version`
    async fn delete_if_version(&self, id: i32, expected_version: i64) -> AppResult<CasOutcome<()>>;
}

#[derive(Clone)]
pub struct PgBookCatalog {
    pool: Pool<Postgres>,
}

impl PgBookCatalog {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn exists(&self, id: i32) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM books WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl BookCatalog for PgBookCatalog {
    async fn find(&self, id: i32) -> AppResult<Option<Book>> {
        let book = sqlx::query_as::<_, Book>("SELECT * FROM books WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(book)
    }

    async fn list(&self) -> AppResult<Vec<Book>> {
        let books = sqlx::query_as::<_, Book>("SELECT * FROM books ORDER BY title")
            .fetch_all(&self.pool)
            .await?;
        Ok(books)
    }

    async fn create(&self, book: &CreateBook) -> AppResult<Book> {
        sqlx::query_as::<_, Book>(
            r#"
            INSERT INTO books (title, author, genre, publication_year, availability, version)
            VALUES ($1, $2, $3, $4, TRUE, 0)
            RETURNING *
            "#,
        )
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.genre)
        .bind(book.publication_year)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::from_write(e, "A book with this title"))
    }

    async fn update_details(&self, id: i32, changes: &UpdateBook) -> AppResult<Option<Book>> {
        sqlx::query_as::<_, Book>(
            r#"
            UPDATE books SET
                title = COALESCE($2, title),
                author = COALESCE($3, author),
                genre = COALESCE($4, genre),
                publication_year = COALESCE($5, publication_year),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&changes.title)
        .bind(&changes.author)
        .bind(&changes.genre)
        .bind(changes.publication_year)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_write(e, "A book with this title"))
    }

    async fn set_availability_if_version(
        &self,
        id: i32,
        expected_version: i64,
        available: bool,
    ) -> AppResult<CasOutcome<Book>> {
        let updated = sqlx::query_as::<_, Book>(
            r#"
            UPDATE books
            SET availability = $3, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(available)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(book) => Ok(CasOutcome::Applied(book)),
            None if self.exists(id).await? => Ok(CasOutcome::Stale),
            None => Ok(CasOutcome::Missing),
        }
    }

    async fn delete_if_version(&self, id: i32, expected_version: i64) -> AppResult<CasOutcome<()>> {
        let result = sqlx::query("DELETE FROM books WHERE id = $1 AND version = $2")
            .bind(id)
            .bind(expected_version)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            Ok(CasOutcome::Applied(()))
        } else if self.exists(id).await? {
            Ok(CasOutcome::Stale)
        } else {
            Ok(CasOutcome::Missing)
        }
    }
}
