//! `RequestStore` — the engine-owned source of truth for request state.
//!
//! Transition guards read from here, never from the spreadsheet mirror.
//! `update` is compare-and-set on the status field: callers pass the
//! status they read, and a concurrent writer that moved the request first
//! causes a `Conflict`. Together with the engine's per-request locks this
//! makes the single-writer guarantee hold even across worker processes.

use async_trait::async_trait;

use crate::engine::request::{RequestStatus, ReviewRequest};
use crate::error::StoreError;
use crate::submission::SubmissionKey;

/// Backend-agnostic persistence for review requests.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Run any pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    /// Insert a new request. Fails with `AlreadyExists` when the natural
    /// key is taken — the idempotency backstop for replayed webhooks.
    async fn insert(&self, request: &ReviewRequest) -> Result<(), StoreError>;

    /// Fetch by natural key.
    async fn get(&self, key: &SubmissionKey) -> Result<Option<ReviewRequest>, StoreError>;

    /// Fetch by the *current* consent token value. Superseded tokens find
    /// nothing.
    async fn find_by_token(&self, token: &str) -> Result<Option<ReviewRequest>, StoreError>;

    /// Persist a mutated request, compare-and-set against the status the
    /// caller read. `Conflict` means another writer got there first; the
    /// caller must re-read and re-evaluate its guards.
    async fn update(
        &self,
        request: &ReviewRequest,
        expected: RequestStatus,
    ) -> Result<(), StoreError>;

    /// All requests currently in the given status.
    async fn list_by_status(&self, status: RequestStatus)
        -> Result<Vec<ReviewRequest>, StoreError>;
}
