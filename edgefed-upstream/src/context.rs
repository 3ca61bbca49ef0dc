//! Ambient principal for the current task.
//!
//! Upstream calls made without an explicit acting principal fall back to the
//! principal installed here. Outside any scope the caller is anonymous.

use edgefed_types::Principal;
use std::future::Future;

tokio::task_local! {
    static CURRENT_PRINCIPAL: Principal;
}

/// Access to the task-local acting principal.
pub struct AuthContext;

impl AuthContext {
    /// Runs `fut` with `principal` as the ambient principal.
    pub async fn scope<F>(principal: Principal, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_PRINCIPAL.scope(principal, fut).await
    }

    /// Runs `fut` as the system principal.
    pub async fn as_system<F>(fut: F) -> F::Output
    where
        F: Future,
    {
        Self::scope(Principal::system(), fut).await
    }

    /// Returns the ambient principal, or anonymous outside any scope.
    pub fn current() -> Principal {
        CURRENT_PRINCIPAL
            .try_with(Clone::clone)
            .unwrap_or_else(|_| Principal::anonymous())
    }
}
