//! Resolved principal and the single authorization check

use crate::error::{AppError, AppResult};

use super::user::Role;

/// Authenticated identity for the current operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i32,
    pub role: Role,
}

/// Operation classes subject to access control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Any authenticated principal
    Read,
    /// Borrow on behalf of `student_id`
    Borrow { student_id: i32 },
    /// Act on a loan held by `owner_id` (return, view)
    ActOnLoan { owner_id: i32 },
    /// Read or edit the account `user_id`
    ManageAccount { user_id: i32 },
    /// Catalog edits, loan deletion, user administration
    Administer,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Allow or deny `action` for this principal
    pub fn authorize(&self, action: Action) -> AppResult<()> {
        let allowed = match (self.role, action) {
            (Role::Admin, _) => true,
            (Role::Student, Action::Read) => true,
            (Role::Student, Action::Borrow { student_id }) => student_id == self.user_id,
            (Role::Student, Action::ActOnLoan { owner_id }) => owner_id == self.user_id,
            (Role::Student, Action::ManageAccount { user_id }) => user_id == self.user_id,
            (Role::Student, Action::Administer) => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(AppError::Authorization(denial_message(action).to_string()))
        }
    }
}

fn denial_message(action: Action) -> &'static str {
    match action {
        Action::Read => "Insufficient rights to read",
        Action::Borrow { .. } => "Students may only borrow for themselves",
        Action::ActOnLoan { .. } => "Loan belongs to another user",
        Action::ManageAccount { .. } => "Cannot manage another user's account",
        Action::Administer => "Administrator privileges required",
    }
}
