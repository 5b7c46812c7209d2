//! Shared handler state

use mailout_storage::MailoutStore;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MailoutStore>,
    /// Where unsubscribing recipients are sent afterwards
    pub redirect_url: Option<String>,
}

impl AppState {
    pub fn new(store: Arc<dyn MailoutStore>, redirect_url: Option<String>) -> Self {
        Self { store, redirect_url }
    }
}
