//! The sync context object.

use cw_client_api::{ChangeFeed, RemoteApi};
use cw_sync_contract::ResourceKey;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditOutbox, AuditTrail, LocalDbOutbox, MemoryOutbox};
use crate::cache::{QueryCache, QueryState};
use crate::combination::CombinationReviewWorkflow;
use crate::config::SyncConfig;
use crate::mutation::OptimisticMutationCoordinator;
use crate::realtime::{RealtimeChannel, RealtimeHub};
use crate::refetch::Refetcher;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::subscription::ChannelSubscription;
use crate::tasks::TaskActions;
use crate::telemetry::{NoopTelemetry, TelemetrySink};
use crate::undo::UndoTokenLedger;
use crate::{Result, SyncError};

pub struct SyncClientBuilder {
    config: SyncConfig,
    api: Arc<dyn RemoteApi>,
    feed: Arc<dyn ChangeFeed>,
    scheduler: Option<Arc<dyn Scheduler>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    outbox: Option<Arc<dyn AuditOutbox>>,
    background_refetch: bool,
}

impl SyncClientBuilder {
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn outbox(mut self, outbox: Arc<dyn AuditOutbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Leave invalidated entries stale until they are read again
    pub fn without_background_refetch(mut self) -> Self {
        self.background_refetch = false;
        self
    }

    /// Must be called within a Tokio runtime unless background refetching
    /// is disabled.
    pub fn build(self) -> Result<SyncClient> {
        self.config.validate()?;
        let config = self.config;
        let api = self.api;

        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()));
        let telemetry = self.telemetry.unwrap_or_else(|| Arc::new(NoopTelemetry));
        let outbox: Arc<dyn AuditOutbox> = match (self.outbox, &config.audit.outbox_path) {
            (Some(outbox), _) => outbox,
            (None, Some(path)) => Arc::new(LocalDbOutbox::open(path)?),
            (None, None) => Arc::new(MemoryOutbox::new()),
        };

        let cache = QueryCache::new();
        let refetcher = self
            .background_refetch
            .then(|| Refetcher::spawn(cache.clone(), api.clone()));
        let coordinator =
            OptimisticMutationCoordinator::new(cache.clone(), api.clone(), config.conflict_policy);
        let ledger = UndoTokenLedger::new(
            coordinator.clone(),
            api.clone(),
            scheduler.clone(),
            config.undo_ttl(),
        );
        let audit = AuditTrail::new(
            api.clone(),
            outbox,
            scheduler.clone(),
            config.audit.max_attempts,
        )
        .with_actor(config.actor_id.clone())
        .with_company(config.company_id.clone());
        let hub = RealtimeHub::new(
            self.feed,
            cache.clone(),
            telemetry.clone(),
            scheduler.clone(),
            config.polling.clone(),
        );

        info!(
            company_id = config.company_id.as_deref().unwrap_or("-"),
            policy = ?config.conflict_policy,
            "sync client ready"
        );
        Ok(SyncClient {
            config,
            api,
            cache,
            coordinator,
            ledger,
            audit,
            hub,
            telemetry,
            refetcher,
        })
    }
}

/// Everything one signed-in session needs to stay in sync. Create with
/// [`SyncClient::init`], release with [`SyncClient::dispose`].
pub struct SyncClient {
    config: SyncConfig,
    api: Arc<dyn RemoteApi>,
    cache: QueryCache,
    coordinator: OptimisticMutationCoordinator,
    ledger: UndoTokenLedger,
    audit: AuditTrail,
    hub: RealtimeHub,
    telemetry: Arc<dyn TelemetrySink>,
    refetcher: Option<Refetcher>,
}

impl SyncClient {
    pub fn builder(
        config: SyncConfig,
        api: Arc<dyn RemoteApi>,
        feed: Arc<dyn ChangeFeed>,
    ) -> SyncClientBuilder {
        SyncClientBuilder {
            config,
            api,
            feed,
            scheduler: None,
            telemetry: None,
            outbox: None,
            background_refetch: true,
        }
    }

    pub fn init(
        config: SyncConfig,
        api: Arc<dyn RemoteApi>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Result<Self> {
        Self::builder(config, api, feed).build()
    }

    /// Tear down every channel, stop background work and make one last
    /// attempt to deliver queued audit records
    pub async fn dispose(self) {
        self.hub.teardown_all();
        if let Some(refetcher) = self.refetcher {
            refetcher.shutdown().await;
        }
        if let Err(err) = self.audit.flush_outbox().await {
            warn!(error = %err, "audit outbox flush failed on dispose");
        }
        info!("sync client disposed");
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn coordinator(&self) -> &OptimisticMutationCoordinator {
        &self.coordinator
    }

    pub fn ledger(&self) -> &UndoTokenLedger {
        &self.ledger
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn hub(&self) -> &RealtimeHub {
        &self.hub
    }

    pub fn telemetry(&self) -> &Arc<dyn TelemetrySink> {
        &self.telemetry
    }

    fn company_id(&self) -> Result<&str> {
        self.config
            .company_id
            .as_deref()
            .ok_or_else(|| SyncError::config("no company selected"))
    }

    pub fn tasks(&self) -> Result<TaskActions> {
        Ok(TaskActions::new(
            self.company_id()?,
            self.config.actor_id.clone(),
            self.coordinator.clone(),
            self.api.clone(),
            self.ledger.clone(),
            self.audit.clone(),
        ))
    }

    pub fn combinations(&self) -> Result<CombinationReviewWorkflow> {
        Ok(CombinationReviewWorkflow::new(
            self.company_id()?,
            self.coordinator.clone(),
            self.api.clone(),
            self.audit.clone(),
            self.telemetry.clone(),
        ))
    }

    /// Follow changes of `tables` on `company:{company_id}:{resource}`,
    /// keeping the `[resource, company_id]` collection fresh. Inert until a
    /// company is configured.
    pub async fn subscribe_company(
        &self,
        resource: &str,
        tables: &[&str],
    ) -> Result<RealtimeChannel> {
        let company_id = self.config.company_id.as_deref();
        let subscription = ChannelSubscription::company_resource(company_id, resource, tables)?;
        let keys = company_id
            .map(|c| vec![ResourceKey::collection(resource, c)])
            .unwrap_or_default();
        Ok(self.hub.subscribe(subscription, keys, None).await)
    }

    /// Read `key` through the cache
    pub async fn query(&self, key: &ResourceKey) -> Result<QueryState> {
        self.cache.query(self.api.as_ref(), key).await
    }
}
