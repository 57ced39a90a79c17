//! Book model and related types

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use validator::Validate;

use crate::error::{AppError, AppResult};

/// Book record as stored in the catalog
///
/// `availability` and `version` are only ever changed through the catalog's
/// version-guarded primitives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Book {
    pub id: i32,
    pub title: String,
    pub author: String,
    pub genre: String,
    pub publication_year: i32,
    pub availability: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Short book representation embedded in loan listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BookShort {
    pub id: i32,
    pub title: String,
    pub author: String,
}

impl From<&Book> for BookShort {
    fn from(book: &Book) -> Self {
        Self {
            id: book.id,
            title: book.title.clone(),
            author: book.author.clone(),
        }
    }
}

/// A publication year is plausible from year 0 up to next year
pub fn check_publication_year(year: i32) -> AppResult<()> {
    let latest = Utc::now().year() + 1;
    if (0..=latest).contains(&year) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Publication year must be between 0 and {}",
            latest
        )))
    }
}

/// Create book request; new books always start available
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateBook {
    #[validate(length(min = 1, message = "Title is required"))]
    pub title: String,
    #[validate(length(min = 1, message = "Author is required"))]
    pub author: String,
    #[validate(length(min = 1, message = "Genre is required"))]
    pub genre: String,
    pub publication_year: i32,
}

impl CreateBook {
    /// Validate after trimming text fields, so blank strings are rejected
    pub fn checked(self) -> AppResult<Self> {
        let book = self.normalized();
        book.validate()?;
        check_publication_year(book.publication_year)?;
        Ok(book)
    }

    fn normalized(self) -> Self {
        Self {
            title: self.title.trim().to_string(),
            author: self.author.trim().to_string(),
            genre: self.genre.trim().to_string(),
            publication_year: self.publication_year,
        }
    }
}

/// Update book request (descriptive fields only)
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateBook {
    #[validate(length(min = 1, message = "Title cannot be empty"))]
    pub title: Option<String>,
    #[validate(length(min = 1, message = "Author cannot be empty"))]
    pub author: Option<String>,
    #[validate(length(min = 1, message = "Genre cannot be empty"))]
    pub genre: Option<String>,
    pub publication_year: Option<i32>,
}

impl UpdateBook {
    pub fn checked(self) -> AppResult<Self> {
        let update = self.normalized();
        update.validate()?;
        if let Some(year) = update.publication_year {
            check_publication_year(year)?;
        }
        Ok(update)
    }

    fn normalized(self) -> Self {
        let trim = |s: Option<String>| s.map(|s| s.trim().to_string());
        Self {
            title: trim(self.title),
            author: trim(self.author),
            genre: trim(self.genre),
            publication_year: self.publication_year,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.author.is_none()
            && self.genre.is_none()
            && self.publication_year.is_none()
    }
}
