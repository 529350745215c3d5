//! Runs the JSON channel scenarios under `tests/scenarios`.

mod common;

use common::{eventually, settle, Harness};
use cw_sync::{PollingConfig, SyncConfig};
use cw_sync_contract::ResourceKey;
use cw_test_scenarios::{Scenario, Step};
use serde_json::json;
use std::path::Path;
use std::time::Duration;

async fn run(scenario: &Scenario) -> anyhow::Result<()> {
    let mut config = SyncConfig::default().with_company(&scenario.company_id);
    config.polling = PollingConfig {
        enabled: scenario.polling,
        interval_ms: scenario
            .poll_interval_ms
            .unwrap_or(PollingConfig::default().interval_ms),
    };
    let h = Harness::new(config);
    h.backend
        .insert_task(&scenario.company_id, "t1", json!({}));

    // Hydrate the collection so refreshes have something to refetch
    let key = ResourceKey::collection(&scenario.resource, &scenario.company_id);
    h.client.query(&key).await?;
    let baseline = h.backend.fetch_count(&key);

    let name = scenario.channel_name();
    let tables = [scenario.resource.as_str()];
    let channel = h.client.subscribe_company(&scenario.resource, &tables).await?;
    anyhow::ensure!(channel.name() == name, "unexpected channel {}", channel.name());

    for (index, step) in scenario.steps.iter().enumerate() {
        let at = format!("{} step {}", scenario.name, index);
        match step {
            Step::Status { status } => {
                h.feed.push_status(&name, *status).await;
                settle().await;
            }
            Step::Change { event } => {
                h.feed.push_change(&name, event.clone()).await;
                settle().await;
            }
            Step::AdvanceMs { ms } => {
                h.scheduler.advance(Duration::from_millis(*ms));
                settle().await;
            }
            Step::AssertConnection {
                is_connected,
                attempts,
                is_polling,
            } => {
                eventually(&at, || {
                    let state = channel.state();
                    state.is_connected == *is_connected && state.attempts == *attempts
                })
                .await;
                if let Some(is_polling) = is_polling {
                    anyhow::ensure!(
                        channel.state().is_polling == *is_polling,
                        "{}: expected is_polling={}",
                        at,
                        is_polling
                    );
                }
            }
            Step::AssertRefreshes { count } => {
                // Count what the channel triggered; the refetcher may fold
                // several invalidations into one fetch
                let triggered = || (channel.refresh_count() + channel.dispatch_count()) as usize;
                eventually(&at, || triggered() >= *count).await;
                settle().await;
                anyhow::ensure!(
                    triggered() == *count,
                    "{}: expected {} refreshes, saw {}",
                    at,
                    count,
                    triggered()
                );
                if *count > 0 {
                    eventually(&at, || h.backend.fetch_count(&key) > baseline).await;
                }
            }
            Step::Teardown => {
                h.client.hub().teardown(&name);
                settle().await;
            }
        }
    }

    h.client.dispose().await;
    Ok(())
}

#[tokio::test]
async fn test_channel_scenarios() -> anyhow::Result<()> {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/scenarios");
    let scenarios = Scenario::load_dir(&dir)?;
    anyhow::ensure!(!scenarios.is_empty(), "no scenarios in {}", dir.display());

    for scenario in &scenarios {
        run(scenario).await?;
    }
    Ok(())
}
