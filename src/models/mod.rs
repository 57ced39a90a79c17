//! Data models for the lending server

pub mod book;
pub mod loan;
pub mod principal;
pub mod user;

// Re-export commonly used types
pub use book::{Book, BookShort, CreateBook, UpdateBook};
pub use loan::{Loan, LoanDetails, LoanQuery, LoanStatus, NewLoan};
pub use principal::{Action, Principal};
pub use user::{Role, User, UserClaims, UserShort};
