//! Named change-feed subscriptions.

use cw_client_api::{ChangeFeed, FeedStream};
use cw_sync_contract::validation::{channel_name, validate_change_filter, validate_channel_name};
use cw_sync_contract::{ChangeEvent, ChangeFilter};
use tracing::debug;

use crate::{Result, SyncError};

/// A channel name plus the table filters it listens to.
///
/// A subscription without filters is inert: it never connects. This is the
/// state of company-scoped channels before the company is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    name: String,
    change_filters: Vec<ChangeFilter>,
}

impl ChannelSubscription {
    pub fn new(name: impl Into<String>, change_filters: Vec<ChangeFilter>) -> Result<Self> {
        let name = name.into();
        if !change_filters.is_empty() {
            validate_channel_name(&name)?;
        }
        for filter in &change_filters {
            validate_change_filter(filter)?;
        }
        Ok(Self {
            name,
            change_filters,
        })
    }

    /// `company:{company_id}:{resource}` listening to every change of
    /// `tables` scoped to the company. Inert when `company_id` is `None`.
    pub fn company_resource(
        company_id: Option<&str>,
        resource: &str,
        tables: &[&str],
    ) -> Result<Self> {
        match company_id {
            Some(company_id) => {
                let filters = tables
                    .iter()
                    .map(|table| ChangeFilter::table(*table).for_company(company_id))
                    .collect();
                Self::new(channel_name(company_id, resource), filters)
            }
            None => Self::new(channel_name("", resource), Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn change_filters(&self) -> &[ChangeFilter] {
        &self.change_filters
    }

    pub fn is_inert(&self) -> bool {
        self.change_filters.is_empty()
    }

    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        self.change_filters.iter().any(|f| f.accepts(event))
    }

    /// Open the channel on `feed`. Inert subscriptions return `Ok(None)`
    /// without touching the transport.
    pub async fn open(&self, feed: &dyn ChangeFeed) -> Result<Option<FeedStream>> {
        if self.is_inert() {
            debug!(channel = %self.name, "inert subscription, not connecting");
            return Ok(None);
        }

        feed.open(&self.name, &self.change_filters)
            .await
            .map(Some)
            .map_err(|e| SyncError::SubscriptionFailed {
                channel: self.name.clone(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cw_rest_client_mock::MockChangeFeed;
    use cw_sync_contract::ChangeEventKind;

    #[test]
    fn test_company_resource() {
        let subscription =
            ChannelSubscription::company_resource(Some("c1"), "tasks", &["tasks", "task_notes"])
                .unwrap();

        assert_eq!(subscription.name(), "company:c1:tasks");
        assert_eq!(subscription.change_filters().len(), 2);
        assert_eq!(
            subscription.change_filters()[0].filter.as_deref(),
            Some("company_id=eq.c1")
        );
        assert!(subscription.accepts(&ChangeEvent::new(ChangeEventKind::Insert, "task_notes")));
        assert!(!subscription.accepts(&ChangeEvent::new(ChangeEventKind::Insert, "users")));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let err = ChannelSubscription::new("tasks", vec![ChangeFilter::table("tasks")]).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_inert_subscription_never_connects() {
        let feed = MockChangeFeed::new();
        let subscription = ChannelSubscription::company_resource(None, "tasks", &["tasks"]).unwrap();

        assert!(subscription.is_inert());
        assert!(subscription.open(&feed).await.unwrap().is_none());
        assert_eq!(feed.open_count(subscription.name()), 0);
    }

    #[tokio::test]
    async fn test_open_failure_is_subscription_failed() {
        let feed = MockChangeFeed::new();
        feed.set_fail_open(true);
        let subscription =
            ChannelSubscription::company_resource(Some("c1"), "tasks", &["tasks"]).unwrap();

        let err = subscription.open(&feed).await.unwrap_err();
        assert!(matches!(err, SyncError::SubscriptionFailed { .. }));
        assert!(err.is_transport());
    }
}
