//! Book catalog service

use crate::{
    error::{AppError, AppResult},
    models::{
        book::{Book, CreateBook, UpdateBook},
        principal::{Action, Principal},
    },
    repository::Repository,
};

#[derive(Clone)]
pub struct CatalogService {
    repository: Repository,
}

impl CatalogService {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    pub async fn list_books(&self, principal: &Principal) -> AppResult<Vec<Book>> {
        principal.authorize(Action::Read)?;
        self.repository.books.list().await
    }

    pub async fn get_book(&self, id: i32, principal: &Principal) -> AppResult<Book> {
        principal.authorize(Action::Read)?;
        self.repository
            .books
            .find(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))
    }

    /// Add a book to the catalog; it starts available
    pub async fn create_book(&self, book: CreateBook, principal: &Principal) -> AppResult<Book> {
        principal.authorize(Action::Administer)?;
        let book = book.checked()?;

        let created = self.repository.books.create(&book).await?;
        tracing::info!(book_id = created.id, title = %created.title, "Book created");
        Ok(created)
    }

    /// Edit descriptive fields; availability is never touched here
    pub async fn update_book(&self, id: i32, changes: UpdateBook, principal: &Principal) -> AppResult<Book> {
        principal.authorize(Action::Administer)?;
        let changes = changes.checked()?;
        if changes.is_empty() {
            return Err(AppError::Validation("No fields to update".to_string()));
        }

        self.repository
            .books
            .update_details(id, &changes)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))
    }
}
