//! Time-limited compensating actions.

use chrono::{DateTime, Utc};
use cw_client_api::{ClientApiError, RemoteApi};
use cw_sync_contract::{codes, ResourceKey, TaskActionResponse, UndoTaskRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::mutation::OptimisticMutationCoordinator;
use crate::scheduler::Scheduler;
use crate::{Result, SyncError};

/// Server-issued right to reverse one action until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoToken {
    pub token: String,
    pub resource_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UndoToken {
    /// Invalid iff `now >= expires_at`
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.expires_at - now).max(chrono::Duration::zero())
    }
}

struct LedgerEntry {
    token: UndoToken,
    key: ResourceKey,
    redeemed: bool,
}

/// Tracks undo tokens handed out by the server and redeems them.
///
/// Local expiry only drives the affordance; a token the ledger considers
/// valid can still be refused by the server, whose answer wins.
#[derive(Clone)]
pub struct UndoTokenLedger {
    coordinator: OptimisticMutationCoordinator,
    api: Arc<dyn RemoteApi>,
    scheduler: Arc<dyn Scheduler>,
    ttl: chrono::Duration,
    entries: Arc<Mutex<HashMap<String, LedgerEntry>>>,
}

impl UndoTokenLedger {
    pub fn new(
        coordinator: OptimisticMutationCoordinator,
        api: Arc<dyn RemoteApi>,
        scheduler: Arc<dyn Scheduler>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            coordinator,
            api,
            scheduler,
            ttl,
            entries: Arc::default(),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, LedgerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `token` as reversing the last action on `key`
    pub fn issue(&self, key: &ResourceKey, token: impl Into<String>) -> UndoToken {
        let issued_at = self.scheduler.now();
        let token = UndoToken {
            token: token.into(),
            resource_id: key.parts().last().cloned().unwrap_or_default(),
            issued_at,
            expires_at: issued_at
                .checked_add_signed(self.ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        debug!(%key, token = %token.token, expires_at = %token.expires_at, "undo token issued");

        self.entries().insert(
            token.token.clone(),
            LedgerEntry {
                token: token.clone(),
                key: key.clone(),
                redeemed: false,
            },
        );
        token
    }

    /// Pure validity check against `now`
    pub fn is_valid(token: &UndoToken, now: DateTime<Utc>) -> bool {
        token.is_valid(now)
    }

    pub fn get(&self, token: &str) -> Option<UndoToken> {
        self.entries().get(token).map(|e| e.token.clone())
    }

    pub fn is_redeemed(&self, token: &str) -> bool {
        self.entries().get(token).is_some_and(|e| e.redeemed)
    }

    /// Tokens that are neither redeemed nor expired
    pub fn active(&self) -> Vec<UndoToken> {
        let now = self.scheduler.now();
        let mut tokens: Vec<_> = self
            .entries()
            .values()
            .filter(|e| !e.redeemed && e.token.is_valid(now))
            .map(|e| e.token.clone())
            .collect();
        tokens.sort_by_key(|t| t.issued_at);
        tokens
    }

    /// Forget redeemed and expired tokens. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let now = self.scheduler.now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| !e.redeemed && e.token.is_valid(now));
        before - entries.len()
    }

    /// Run the server's compensating action for `token`.
    ///
    /// Fails without a network call if the token was already redeemed here or
    /// has expired locally. Server rejections map to the same errors.
    pub async fn redeem(&self, token: &UndoToken) -> Result<TaskActionResponse> {
        let key = {
            let entries = self.entries();
            let entry = entries
                .get(&token.token)
                .ok_or_else(|| SyncError::validation(format!("Unknown undo token {}", token.token)))?;
            if entry.redeemed {
                return Err(SyncError::UndoAlreadyUsed {
                    token: token.token.clone(),
                });
            }
            entry.key.clone()
        };
        if !token.is_valid(self.scheduler.now()) {
            return Err(SyncError::UndoExpired {
                token: token.token.clone(),
            });
        }

        let request = UndoTaskRequest {
            undo_token: token.token.clone(),
        };
        let api = self.api.clone();
        let result = self
            .coordinator
            .execute(&key, || async move { api.undo_task(&request).await })
            .await;

        match result {
            Ok(response) => {
                self.mark_redeemed(&token.token);
                info!(%key, token = %token.token, "undo redeemed");
                Ok(response)
            }
            Err(SyncError::RemoteCallFailed(err)) => Err(self.map_rejection(&token.token, err)),
            Err(err) => Err(err),
        }
    }

    fn map_rejection(&self, token: &str, err: ClientApiError) -> SyncError {
        match err.code() {
            Some(codes::UNDO_EXPIRED) => SyncError::UndoExpired {
                token: token.to_string(),
            },
            Some(codes::UNDO_ALREADY_USED) => {
                self.mark_redeemed(token);
                SyncError::UndoAlreadyUsed {
                    token: token.to_string(),
                }
            }
            _ => SyncError::RemoteCallFailed(err),
        }
    }

    fn mark_redeemed(&self, token: &str) {
        if let Some(entry) = self.entries().get_mut(token) {
            entry.redeemed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryCache;
    use crate::config::ConflictPolicy;
    use crate::scheduler::ManualScheduler;
    use cw_rest_client_mock::MockBackend;
    use cw_sync_contract::ClaimTaskRequest;
    use serde_json::json;
    use std::time::Duration;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    struct Fixture {
        backend: MockBackend,
        scheduler: ManualScheduler,
        ledger: UndoTokenLedger,
    }

    fn fixture() -> Fixture {
        let backend = MockBackend::new();
        backend.insert_task("c1", "t1", json!({}));
        let scheduler = ManualScheduler::new();
        let api: Arc<dyn RemoteApi> = Arc::new(backend.clone());
        let coordinator =
            OptimisticMutationCoordinator::new(QueryCache::new(), api.clone(), ConflictPolicy::Reject);
        let ledger = UndoTokenLedger::new(
            coordinator,
            api,
            Arc::new(scheduler.clone()),
            chrono::Duration::hours(24),
        );
        Fixture {
            backend,
            scheduler,
            ledger,
        }
    }

    async fn claim(f: &Fixture) -> UndoToken {
        let response = f
            .backend
            .claim_task(&ClaimTaskRequest {
                task_id: "t1".into(),
                note: None,
            })
            .await
            .unwrap();
        f.ledger
            .issue(&ResourceKey::task("c1", "t1"), response.undo_token.unwrap())
    }

    #[test]
    fn test_validity_boundary() {
        let f = fixture();
        let token = f.ledger.issue(&ResourceKey::task("c1", "t1"), "undo-x");
        let now = f.scheduler.now();

        assert_eq!(token.resource_id, "t1");
        assert!(UndoTokenLedger::is_valid(&token, now));
        assert!(UndoTokenLedger::is_valid(
            &token,
            token.expires_at - chrono::Duration::milliseconds(1)
        ));
        assert!(!UndoTokenLedger::is_valid(&token, token.expires_at));
        assert_eq!(token.remaining(token.expires_at + chrono::Duration::hours(1)), chrono::Duration::zero());
    }

    #[test]
    fn test_oversized_ttl_saturates() {
        let scheduler = ManualScheduler::new();
        let api: Arc<dyn RemoteApi> = Arc::new(MockBackend::new());
        let coordinator =
            OptimisticMutationCoordinator::new(QueryCache::new(), api.clone(), ConflictPolicy::Reject);
        let ledger = UndoTokenLedger::new(
            coordinator,
            api,
            Arc::new(scheduler.clone()),
            chrono::Duration::MAX,
        );

        let token = ledger.issue(&ResourceKey::task("c1", "t1"), "undo-1");
        assert_eq!(token.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(UndoTokenLedger::is_valid(&token, scheduler.now()));
    }

    #[tokio::test]
    async fn test_redeem_restores_task() {
        let f = fixture();
        let token = claim(&f).await;
        assert_eq!(f.backend.task("c1", "t1").unwrap()["status"], "in_progress");

        tokio_test::assert_ok!(f.ledger.redeem(&token).await);

        let task = f.backend.task("c1", "t1").unwrap();
        assert_eq!(task["status"], "pending");
        assert!(task["claimed_by"].is_null());
        assert!(f.ledger.is_redeemed(&token.token));
    }

    #[tokio::test]
    async fn test_second_redeem_is_already_used() {
        let f = fixture();
        let token = claim(&f).await;
        f.ledger.redeem(&token).await.unwrap();
        let calls = f.backend.call_count("undo_task");

        let err = f.ledger.redeem(&token).await.unwrap_err();
        assert!(matches!(err, SyncError::UndoAlreadyUsed { .. }));
        assert_eq!(f.backend.call_count("undo_task"), calls);
    }

    #[tokio::test]
    async fn test_locally_expired_token_never_reaches_server() {
        let f = fixture();
        let token = claim(&f).await;
        f.scheduler.advance(DAY + Duration::from_secs(3600));

        let err = f.ledger.redeem(&token).await.unwrap_err();
        assert!(matches!(err, SyncError::UndoExpired { .. }));
        assert_eq!(f.backend.call_count("undo_task"), 0);
        assert_eq!(f.backend.task("c1", "t1").unwrap()["status"], "in_progress");
    }

    #[tokio::test]
    async fn test_server_expiry_is_authoritative() {
        let f = fixture();
        let token = claim(&f).await;
        // Client clock still inside the window, server clock past it
        f.backend.advance(chrono::Duration::hours(25));

        let err = f.ledger.redeem(&token).await.unwrap_err();
        assert!(matches!(err, SyncError::UndoExpired { .. }));
        assert_eq!(f.backend.task("c1", "t1").unwrap()["status"], "in_progress");
    }

    #[tokio::test]
    async fn test_unknown_token_is_validation_error() {
        let f = fixture();
        let token = UndoToken {
            token: "forged".into(),
            resource_id: "t1".into(),
            issued_at: f.scheduler.now(),
            expires_at: f.scheduler.now() + chrono::Duration::hours(1),
        };

        let err = tokio_test::assert_err!(f.ledger.redeem(&token).await);
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_prune_drops_spent_tokens() {
        let f = fixture();
        let token = claim(&f).await;
        f.ledger.issue(&ResourceKey::task("c1", "t2"), "undo-other");
        f.ledger.redeem(&token).await.unwrap();

        assert_eq!(f.ledger.active().len(), 1);
        assert_eq!(f.ledger.prune(), 1);

        f.scheduler.advance(DAY);
        assert_eq!(f.ledger.prune(), 1);
        assert!(f.ledger.get("undo-other").is_none());
    }
}
