//! In-memory request store — used in tests and single-process deployments
//! without a database file. Honors the same compare-and-set contract as
//! the durable backend.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::engine::request::{RequestStatus, ReviewRequest};
use crate::error::StoreError;
use crate::submission::SubmissionKey;

use super::traits::RequestStore;

/// RwLock-guarded map keyed by the submission's natural key.
#[derive(Default)]
pub struct MemoryStore {
    requests: RwLock<HashMap<SubmissionKey, ReviewRequest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert(&self, request: &ReviewRequest) -> Result<(), StoreError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(request.key()) {
            return Err(StoreError::AlreadyExists {
                key: request.key().clone(),
            });
        }
        requests.insert(request.key().clone(), request.clone());
        Ok(())
    }

    async fn get(&self, key: &SubmissionKey) -> Result<Option<ReviewRequest>, StoreError> {
        Ok(self.requests.read().await.get(key).cloned())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<ReviewRequest>, StoreError> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .find(|r| r.token.as_ref().is_some_and(|t| t.matches(token)))
            .cloned())
    }

    async fn update(
        &self,
        request: &ReviewRequest,
        expected: RequestStatus,
    ) -> Result<(), StoreError> {
        let mut requests = self.requests.write().await;
        let current = requests
            .get(request.key())
            .ok_or_else(|| StoreError::NotFound {
                key: request.key().clone(),
            })?;

        if current.status != expected {
            return Err(StoreError::Conflict {
                key: request.key().clone(),
                expected: expected.to_string(),
            });
        }

        requests.insert(request.key().clone(), request.clone());
        Ok(())
    }

    async fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<ReviewRequest>, StoreError> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }
}
