//! Library lending tracker
//!
//! A REST JSON API for a small library: a book catalog, student and admin
//! accounts, and a loan ledger kept consistent with book availability under
//! concurrent borrows and returns.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub services: Arc<services::Services>,
}

impl AppState {
    /// Build services on top of the given repository
    pub fn new(config: AppConfig, repository: repository::Repository) -> Self {
        let services = services::Services::new(repository, config.auth.clone(), &config.lending);
        Self {
            config: Arc::new(config),
            services: Arc::new(services),
        }
    }
}
