//! Combination suggestion review commands

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use cw_sync::{CombinationReviewWorkflow, SyncClient};
use cw_sync_contract::CombinationSuggestion;
use serde_json::json;

use crate::connect::{print_json, ConnectArgs};

#[derive(Subcommand, Debug)]
pub enum SuggestionCommands {
    /// List pending suggestions, most similar first
    List(ListArgs),
    /// Merge the two tasks of a suggestion
    Accept(ReviewArgs),
    /// Dismiss a suggestion
    Reject(ReviewArgs),
    /// Split a previously combined group
    Rollback(RollbackArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ReviewArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    #[arg(value_name = "SUGGESTION_ID")]
    pub suggestion_id: String,
}

#[derive(Args, Debug)]
pub struct RollbackArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    #[arg(value_name = "GROUP_ID")]
    pub combined_group_id: String,
}

impl SuggestionCommands {
    pub async fn run(self) -> Result<()> {
        match self {
            SuggestionCommands::List(args) => args.run().await,
            SuggestionCommands::Accept(args) => args.run(true).await,
            SuggestionCommands::Reject(args) => args.run(false).await,
            SuggestionCommands::Rollback(args) => args.run().await,
        }
    }
}

fn open(connect: &ConnectArgs) -> Result<(SyncClient, CombinationReviewWorkflow)> {
    let client = connect.connect(connect.config()?)?;
    let workflow = client.combinations()?;
    Ok((client, workflow))
}

impl ListArgs {
    pub async fn run(self) -> Result<()> {
        let (client, workflow) = open(&self.connect)?;
        let loaded = workflow.load().await;
        client.dispose().await;
        loaded?;

        let pending = workflow.pending();
        if self.json {
            return print_json(&pending);
        }
        if pending.is_empty() {
            println!("No pending suggestions");
            return Ok(());
        }
        for suggestion in &pending {
            println!(
                "{}  {:>5.1}%  {} + {}",
                suggestion.id,
                suggestion.similarity_score * 100.0,
                suggestion.base_task_id,
                suggestion.suggested_task_id
            );
        }
        Ok(())
    }
}

impl ReviewArgs {
    async fn run(self, accept: bool) -> Result<()> {
        let (client, workflow) = open(&self.connect)?;
        let result = review(&workflow, &self.suggestion_id, accept).await;
        client.dispose().await;
        print_json(&result?)
    }
}

async fn review(
    workflow: &CombinationReviewWorkflow,
    suggestion_id: &str,
    accept: bool,
) -> Result<serde_json::Value> {
    let suggestion = find(workflow.load().await?, suggestion_id)?;
    if accept {
        let response = workflow.accept(&suggestion).await?;
        Ok(json!({
            "suggestion": suggestion.id,
            "status": "accepted",
            "combinedGroupId": response.combined_group_id,
        }))
    } else {
        workflow.reject(&suggestion).await?;
        Ok(json!({ "suggestion": suggestion.id, "status": "rejected" }))
    }
}

fn find(suggestions: Vec<CombinationSuggestion>, id: &str) -> Result<CombinationSuggestion> {
    suggestions
        .into_iter()
        .find(|s| s.id == id)
        .with_context(|| format!("No pending suggestion {}", id))
}

impl RollbackArgs {
    pub async fn run(self) -> Result<()> {
        let (client, workflow) = open(&self.connect)?;
        let result = workflow.rollback(&self.combined_group_id).await;
        client.dispose().await;
        print_json(&result?)
    }
}
