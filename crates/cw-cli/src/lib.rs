//! Catering workflow sync CLI library

pub mod connect;
pub mod suggestions;
pub mod task;
pub mod watch;

// Re-export CLI types for testing
pub use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cw-sync")]
#[command(about = "Catering workflow client sync")]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Follow a company channel and report connection health until Ctrl+C
    Watch(watch::WatchArgs),
    /// Claim a task for the signed-in user
    Claim(task::ClaimArgs),
    /// Assign a task to a user, or unassign it
    Assign(task::AssignArgs),
    /// Mark a task completed
    Complete(task::CompleteArgs),
    /// Review task combination suggestions
    Suggestions {
        #[command(subcommand)]
        subcommand: suggestions::SuggestionCommands,
    },
}
