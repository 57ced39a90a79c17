//! In-memory storage backend
//!
//! Each primitive takes the table lock for the duration of that single call
//! only, which makes every conditional write atomic in the same way a guarded
//! `UPDATE ... WHERE version = $n` is atomic in Postgres.
//!
//! The ledger and the user directory share their tables through a
//! [`MemoryStore`] so that the two cross-table rules (a loan needs an existing
//! student, a student with active loans cannot be deleted) are checked under
//! both locks. Locks are always taken users first, loans second.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    error::{AppError, AppResult},
    models::{
        book::{Book, CreateBook, UpdateBook},
        loan::{Loan, LoanQuery, LoanStatus, NewLoan},
        user::{NewUser, User, UserChanges},
    },
};

use super::{BookCatalog, CasOutcome, LoanLedger, UserDirectory};

struct Table<T> {
    rows: BTreeMap<i32, T>,
    next_id: i32,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl<T> Table<T> {
    fn allocate_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

type Shared<T> = Arc<RwLock<Table<T>>>;

/// One in-memory database; every handle built from it sees the same rows
#[derive(Clone, Default)]
pub struct MemoryStore {
    books: Shared<Book>,
    loans: Shared<Loan>,
    users: Shared<User>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn book_catalog(&self) -> MemoryBookCatalog {
        MemoryBookCatalog {
            table: self.books.clone(),
        }
    }

    pub fn loan_ledger(&self) -> MemoryLoanLedger {
        MemoryLoanLedger {
            table: self.loans.clone(),
            users: self.users.clone(),
        }
    }

    pub fn user_directory(&self) -> MemoryUserDirectory {
        MemoryUserDirectory {
            table: self.users.clone(),
            loans: self.loans.clone(),
        }
    }
}

pub struct MemoryBookCatalog {
    table: Shared<Book>,
}

impl MemoryBookCatalog {
    fn title_taken(table: &Table<Book>, title: &str, except: Option<i32>) -> bool {
        table
            .rows
            .values()
            .any(|b| b.title == title && Some(b.id) != except)
    }
}

#[async_trait]
impl BookCatalog for MemoryBookCatalog {
    async fn find(&self, id: i32) -> AppResult<Option<Book>> {
        Ok(self.table.read().await.rows.get(&id).cloned())
    }

    async fn list(&self) -> AppResult<Vec<Book>> {
        let mut books: Vec<Book> = self.table.read().await.rows.values().cloned().collect();
        books.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(books)
    }

    async fn create(&self, book: &CreateBook) -> AppResult<Book> {
        let mut table = self.table.write().await;
        if Self::title_taken(&table, &book.title, None) {
            return Err(AppError::Duplicate("A book with this title already exists".to_string()));
        }

        let now = Utc::now();
        let created = Book {
            id: table.allocate_id(),
            title: book.title.clone(),
            author: book.author.clone(),
            genre: book.genre.clone(),
            publication_year: book.publication_year,
            availability: true,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        table.rows.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_details(&self, id: i32, changes: &UpdateBook) -> AppResult<Option<Book>> {
        let mut table = self.table.write().await;
        if let Some(title) = &changes.title {
            if Self::title_taken(&table, title, Some(id)) {
                return Err(AppError::Duplicate("A book with this title already exists".to_string()));
            }
        }

        let Some(book) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(title) = &changes.title {
            book.title = title.clone();
        }
        if let Some(author) = &changes.author {
            book.author = author.clone();
        }
        if let Some(genre) = &changes.genre {
            book.genre = genre.clone();
        }
        if let Some(year) = changes.publication_year {
            book.publication_year = year;
        }
        book.version += 1;
        book.updated_at = Utc::now();
        Ok(Some(book.clone()))
    }

    async fn set_availability_if_version(
        &self,
        id: i32,
        expected_version: i64,
        available: bool,
    ) -> AppResult<CasOutcome<Book>> {
        let mut table = self.table.write().await;
        let Some(book) = table.rows.get_mut(&id) else {
            return Ok(CasOutcome::Missing);
        };
        if book.version != expected_version {
            return Ok(CasOutcome::Stale);
        }

        book.availability = available;
        book.version += 1;
        book.updated_at = Utc::now();
        Ok(CasOutcome::Applied(book.clone()))
    }

    async fn delete_if_version(&self, id: i32, expected_version: i64) -> AppResult<CasOutcome<()>> {
        let mut table = self.table.write().await;
        match table.rows.get(&id) {
            None => Ok(CasOutcome::Missing),
            Some(book) if book.version != expected_version => Ok(CasOutcome::Stale),
            Some(_) => {
                table.rows.remove(&id);
                Ok(CasOutcome::Applied(()))
            }
        }
    }
}

pub struct MemoryLoanLedger {
    table: Shared<Loan>,
    users: Shared<User>,
}

#[async_trait]
impl LoanLedger for MemoryLoanLedger {
    async fn find(&self, id: i32) -> AppResult<Option<Loan>> {
        Ok(self.table.read().await.rows.get(&id).cloned())
    }

    async fn list(&self, query: &LoanQuery) -> AppResult<Vec<Loan>> {
        let table = self.table.read().await;
        let mut loans: Vec<Loan> = table.rows.values().filter(|l| query.matches(l)).cloned().collect();
        loans.sort_by(|a, b| a.loan_date.cmp(&b.loan_date).then(a.id.cmp(&b.id)));
        Ok(loans)
    }

    async fn create(&self, loan: &NewLoan) -> AppResult<Loan> {
        // Held until the loan is in, so the student cannot be deleted meanwhile
        let users = self.users.read().await;
        if !users.rows.contains_key(&loan.student_id) {
            return Err(AppError::NotFound(format!(
                "Student with id {} not found",
                loan.student_id
            )));
        }

        let mut table = self.table.write().await;
        if table
            .rows
            .values()
            .any(|l| l.book_id == loan.book_id && l.is_active())
        {
            return Err(AppError::Duplicate(
                "An active loan for this book already exists".to_string(),
            ));
        }

        let created = Loan {
            id: table.allocate_id(),
            book_id: loan.book_id,
            student_id: loan.student_id,
            loan_date: loan.loan_date,
            return_date: None,
            status: LoanStatus::Active,
        };
        table.rows.insert(created.id, created.clone());
        Ok(created)
    }

    async fn mark_returned_if_active(
        &self,
        id: i32,
        return_date: DateTime<Utc>,
    ) -> AppResult<CasOutcome<Loan>> {
        let mut table = self.table.write().await;
        let Some(loan) = table.rows.get_mut(&id) else {
            return Ok(CasOutcome::Missing);
        };
        if loan.status != LoanStatus::Active {
            return Ok(CasOutcome::Stale);
        }

        loan.status = LoanStatus::Returned;
        loan.return_date = Some(return_date);
        Ok(CasOutcome::Applied(loan.clone()))
    }

    async fn delete_if_status(&self, id: i32, expected: LoanStatus) -> AppResult<CasOutcome<Loan>> {
        let mut table = self.table.write().await;
        match table.rows.get(&id) {
            None => Ok(CasOutcome::Missing),
            Some(loan) if loan.status != expected => Ok(CasOutcome::Stale),
            Some(_) => Ok(table
                .rows
                .remove(&id)
                .map_or(CasOutcome::Missing, CasOutcome::Applied)),
        }
    }

    async fn active_for_book(&self, book_id: i32) -> AppResult<Vec<Loan>> {
        self.list(&LoanQuery {
            book_id: Some(book_id),
            status: Some(LoanStatus::Active),
            ..Default::default()
        })
        .await
    }

    async fn count_active_for_student(&self, student_id: i32) -> AppResult<i64> {
        let table = self.table.read().await;
        let count = table
            .rows
            .values()
            .filter(|l| l.student_id == student_id && l.is_active())
            .count();
        Ok(count as i64)
    }
}

pub struct MemoryUserDirectory {
    table: Shared<User>,
    loans: Shared<Loan>,
}

impl MemoryUserDirectory {
    fn email_taken(table: &Table<User>, email: &str, except: Option<i32>) -> bool {
        table
            .rows
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(email) && Some(u.id) != except)
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find(&self, id: i32) -> AppResult<Option<User>> {
        Ok(self.table.read().await.rows.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let table = self.table.read().await;
        Ok(table
            .rows
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn list(&self) -> AppResult<Vec<User>> {
        let mut users: Vec<User> = self.table.read().await.rows.values().cloned().collect();
        users.sort_by(|a, b| (&a.lastname, &a.firstname).cmp(&(&b.lastname, &b.firstname)));
        Ok(users)
    }

    async fn create(&self, user: &NewUser) -> AppResult<User> {
        let mut table = self.table.write().await;
        if Self::email_taken(&table, &user.email, None) {
            return Err(AppError::Duplicate("A user with this email already exists".to_string()));
        }

        let now = Utc::now();
        let created = User {
            id: table.allocate_id(),
            firstname: user.firstname.clone(),
            lastname: user.lastname.clone(),
            email: user.email.to_lowercase(),
            password: user.password_hash.clone(),
            role: user.role,
            created_at: now,
            updated_at: now,
        };
        table.rows.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update(&self, id: i32, changes: &UserChanges) -> AppResult<Option<User>> {
        let mut table = self.table.write().await;
        if let Some(email) = &changes.email {
            if Self::email_taken(&table, email, Some(id)) {
                return Err(AppError::Duplicate("A user with this email already exists".to_string()));
            }
        }

        let Some(user) = table.rows.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(firstname) = &changes.firstname {
            user.firstname = firstname.clone();
        }
        if let Some(lastname) = &changes.lastname {
            user.lastname = lastname.clone();
        }
        if let Some(email) = &changes.email {
            user.email = email.to_lowercase();
        }
        if let Some(hash) = &changes.password_hash {
            user.password = hash.clone();
        }
        if let Some(role) = changes.role {
            user.role = role;
        }
        user.updated_at = Utc::now();
        Ok(Some(user.clone()))
    }

    async fn delete_if_no_active_loans(&self, id: i32) -> AppResult<CasOutcome<()>> {
        let mut table = self.table.write().await;
        if !table.rows.contains_key(&id) {
            return Ok(CasOutcome::Missing);
        }

        let loans = self.loans.read().await;
        if loans.rows.values().any(|l| l.student_id == id && l.is_active()) {
            return Ok(CasOutcome::Stale);
        }

        table.rows.remove(&id);
        Ok(CasOutcome::Applied(()))
    }
}
