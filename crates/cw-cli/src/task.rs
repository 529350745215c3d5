//! Task action commands

use anyhow::Result;
use clap::Args;
use cw_sync::TaskActionOutcome;
use serde_json::json;

use crate::connect::{print_json, ConnectArgs};

#[derive(Args, Debug)]
pub struct ClaimArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    #[arg(value_name = "TASK_ID")]
    pub task_id: String,

    /// Note stored with the claim
    #[arg(long, value_name = "TEXT")]
    pub note: Option<String>,
}

#[derive(Args, Debug)]
pub struct AssignArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    #[arg(value_name = "TASK_ID")]
    pub task_id: String,

    /// Assignee; the task is unassigned when omitted
    #[arg(long = "user", value_name = "USER_ID")]
    pub user_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct CompleteArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    #[arg(value_name = "TASK_ID")]
    pub task_id: String,
}

impl ClaimArgs {
    pub async fn run(self) -> Result<()> {
        let client = self.connect.connect(self.connect.config()?)?;
        let outcome = client.tasks()?.claim(&self.task_id, self.note).await;
        client.dispose().await;
        print_outcome(&outcome?)
    }
}

impl AssignArgs {
    pub async fn run(self) -> Result<()> {
        let client = self.connect.connect(self.connect.config()?)?;
        let outcome = client.tasks()?.assign(&self.task_id, self.user_id).await;
        client.dispose().await;
        print_outcome(&outcome?)
    }
}

impl CompleteArgs {
    pub async fn run(self) -> Result<()> {
        let client = self.connect.connect(self.connect.config()?)?;
        let outcome = client.tasks()?.complete(&self.task_id).await;
        client.dispose().await;
        print_outcome(&outcome?)
    }
}

fn print_outcome(outcome: &TaskActionOutcome) -> Result<()> {
    print_json(&json!({
        "success": outcome.response.success,
        "timestamp": outcome.response.timestamp,
        "undo": outcome.undo,
    }))
}
