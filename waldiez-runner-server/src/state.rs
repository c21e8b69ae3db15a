use std::sync::Arc;

use waldiez_runner_core::AppContext;

use crate::auth::TokenVerifier;

/// Shared axum state: the orchestration context plus the token verifier.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AppContext>,
    pub verifier: Arc<TokenVerifier>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(ctx: Arc<AppContext>, verifier: Arc<TokenVerifier>) -> Self {
        Self { ctx, verifier }
    }
}
