//! `cw-sync watch`: follow a company channel

use anyhow::Result;
use clap::Args;
use cw_sync::ConnectionState;
use cw_sync_contract::tables;
use tracing::info;

use crate::connect::ConnectArgs;

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Resource segment of the channel name and cache key
    #[arg(long, default_value = tables::TASKS)]
    pub resource: String,

    /// Tables to follow; defaults to the resource itself
    #[arg(long = "table", value_name = "TABLE")]
    pub tables: Vec<String>,

    /// Polling fallback interval while disconnected
    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    /// Never poll, even while the channel is down
    #[arg(long)]
    pub no_polling: bool,
}

impl WatchArgs {
    pub async fn run(self) -> Result<()> {
        let mut config = self.connect.config()?;
        if let Some(ms) = self.poll_interval_ms {
            config.polling.interval_ms = ms;
        }
        if self.no_polling {
            config.polling.enabled = false;
        }
        if config.company_id.is_none() {
            anyhow::bail!("--company (or CW_COMPANY_ID) is required to watch a channel");
        }

        let client = self.connect.connect(config)?;
        let tables: Vec<&str> = if self.tables.is_empty() {
            vec![self.resource.as_str()]
        } else {
            self.tables.iter().map(String::as_str).collect()
        };

        let channel = client.subscribe_company(&self.resource, &tables).await?;
        println!("Watching {} (Ctrl+C to stop)", channel.name());

        let mut states = channel.observe();
        report(&states.borrow_and_update().clone(), None);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = states.borrow_and_update().clone();
                    report(&state, channel.banner());
                }
            }
        }

        info!(
            channel = channel.name(),
            refreshes = channel.refresh_count(),
            dispatches = channel.dispatch_count(),
            "watch stopped"
        );
        println!(
            "{} polling refreshes, {} change events dispatched",
            channel.refresh_count(),
            channel.dispatch_count()
        );
        client.dispose().await;
        Ok(())
    }
}

fn report(state: &ConnectionState, banner: Option<String>) {
    let status = if state.is_connected {
        "connected"
    } else {
        "disconnected"
    };
    let polling = if state.is_polling { ", polling" } else { "" };
    println!("{} (attempts: {}{})", status, state.attempts, polling);
    if let Some(banner) = banner {
        println!("  {}", banner);
    }
}
