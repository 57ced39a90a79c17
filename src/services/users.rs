//! Authentication and user management service

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Utc;
use validator::Validate;

use crate::{
    config::AuthConfig,
    error::{AppError, AppResult},
    models::{
        principal::{Action, Principal},
        user::{NewUser, RegisterUser, Role, UpdateUser, User, UserChanges, UserClaims},
    },
    repository::{CasOutcome, Repository},
};

#[derive(Clone)]
pub struct UsersService {
    repository: Repository,
    config: AuthConfig,
}

impl UsersService {
    pub fn new(repository: Repository, config: AuthConfig) -> Self {
        Self { repository, config }
    }

    /// Register a new account
    ///
    /// Self-registration always yields a student; only an admin may create
    /// another admin.
    pub async fn register(&self, request: RegisterUser, principal: Option<&Principal>) -> AppResult<User> {
        request.validate()?;

        let role = request.role.unwrap_or(Role::Student);
        if role == Role::Admin {
            match principal {
                Some(p) => p.authorize(Action::Administer)?,
                None => {
                    return Err(AppError::Authorization(
                        "Administrator privileges required to create an admin".to_string(),
                    ))
                }
            }
        }

        let new_user = NewUser {
            firstname: request.firstname.trim().to_string(),
            lastname: request.lastname.trim().to_string(),
            email: request.email.trim().to_lowercase(),
            password_hash: self.hash_password(&request.password)?,
            role,
        };

        let user = self.repository.users.create(&new_user).await?;
        tracing::info!(user_id = user.id, role = %user.role, "User registered");
        Ok(user)
    }

    /// Create the configured bootstrap admin unless its email is already taken
    pub async fn ensure_admin(&self) -> AppResult<Option<User>> {
        let Some(admin) = &self.config.bootstrap_admin else {
            return Ok(None);
        };

        let email = admin.email.trim().to_lowercase();
        if self.repository.users.find_by_email(&email).await?.is_some() {
            return Ok(None);
        }

        let new_user = NewUser {
            firstname: "Library".to_string(),
            lastname: "Administrator".to_string(),
            email,
            password_hash: self.hash_password(&admin.password)?,
            role: Role::Admin,
        };

        let user = self.repository.users.create(&new_user).await?;
        tracing::info!(user_id = user.id, email = %user.email, "Bootstrap admin created");
        Ok(Some(user))
    }

    /// Authenticate by email and password and return a JWT token
    pub async fn authenticate(&self, email: &str, password: &str) -> AppResult<(String, User)> {
        let user = self
            .repository
            .users
            .find_by_email(email.trim())
            .await?
            .ok_or_else(|| AppError::Authentication("Invalid credentials".to_string()))?;

        if !self.verify_password(&user, password)? {
            return Err(AppError::Authentication("Invalid credentials".to_string()));
        }

        let token = self.create_token_for_user(&user)?;
        Ok((token, user))
    }

    /// Resolve a bearer token to claims
    pub fn verify_token(&self, token: &str) -> AppResult<UserClaims> {
        UserClaims::from_token(token, &self.config.jwt_secret)
            .map_err(|e| AppError::Authentication(e.to_string()))
    }

    pub async fn list_users(&self, principal: &Principal) -> AppResult<Vec<User>> {
        principal.authorize(Action::Administer)?;
        self.repository.users.list().await
    }

    pub async fn get_user(&self, id: i32, principal: &Principal) -> AppResult<User> {
        principal.authorize(Action::ManageAccount { user_id: id })?;
        self.find(id).await
    }

    /// Update an account; role changes are admin only
    pub async fn update_user(&self, id: i32, request: UpdateUser, principal: &Principal) -> AppResult<User> {
        principal.authorize(Action::ManageAccount { user_id: id })?;
        request.validate()?;

        if request.role.is_some() {
            principal.authorize(Action::Administer)?;
        }

        let changes = UserChanges {
            firstname: request.firstname.map(|s| s.trim().to_string()),
            lastname: request.lastname.map(|s| s.trim().to_string()),
            email: request.email.map(|s| s.trim().to_lowercase()),
            password_hash: request
                .password
                .as_deref()
                .map(|p| self.hash_password(p))
                .transpose()?,
            role: request.role,
        };

        self.repository
            .users
            .update(id, &changes)
            .await?
            .ok_or_else(|| user_not_found(id))
    }

    /// Delete an account; refused while the user holds active loans
    pub async fn delete_user(&self, id: i32, principal: &Principal) -> AppResult<()> {
        principal.authorize(Action::Administer)?;

        match self.repository.users.delete_if_no_active_loans(id).await? {
            CasOutcome::Applied(()) => {
                tracing::info!(user_id = id, "User deleted");
                Ok(())
            }
            CasOutcome::Stale => {
                let active = self.repository.loans.count_active_for_student(id).await?;
                Err(AppError::Conflict(format!(
                    "User {} still has {} active loan(s)",
                    id, active
                )))
            }
            CasOutcome::Missing => Err(user_not_found(id)),
        }
    }

    async fn find(&self, id: i32) -> AppResult<User> {
        self.repository
            .users
            .find(id)
            .await?
            .ok_or_else(|| user_not_found(id))
    }

    fn create_token_for_user(&self, user: &User) -> AppResult<String> {
        let now = Utc::now().timestamp();
        let exp = now + (self.config.jwt_expiration_hours as i64 * 3600);

        let claims = UserClaims {
            sub: user.email.clone(),
            user_id: user.id,
            role: user.role,
            exp,
            iat: now,
        };

        claims
            .create_token(&self.config.jwt_secret)
            .map_err(|e| AppError::Internal(format!("Failed to create token: {}", e)))
    }

    fn verify_password(&self, user: &User, password: &str) -> AppResult<bool> {
        let parsed_hash = PasswordHash::new(&user.password)
            .map_err(|_| AppError::Internal("Invalid password hash".to_string()))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }

    /// Hash a password using Argon2
    pub fn hash_password(&self, password: &str) -> AppResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))?;
        Ok(hash.to_string())
    }
}

fn user_not_found(id: i32) -> AppError {
    AppError::NotFound(format!("User with id {} not found", id))
}
