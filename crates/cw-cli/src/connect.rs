//! Connection arguments shared by every command

use anyhow::{Context, Result};
use clap::Args;
use cw_rest_client::{AuthConfig, RestClient};
use cw_sync::{SyncClient, SyncConfig, TracingTelemetry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

const REMOTE_SERVER_VAR: &str = "CW_REMOTE_SERVER";
const API_KEY_VAR: &str = "CW_API_KEY";
const ACCESS_TOKEN_VAR: &str = "CW_ACCESS_TOKEN";

/// Where to connect and as whom. Unset flags fall back to `CW_*` variables.
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectArgs {
    /// Base URL of the data store
    #[arg(long, value_name = "URL")]
    pub remote_server: Option<String>,

    /// Project API key
    #[arg(long, value_name = "KEY")]
    pub api_key: Option<String>,

    /// Session JWT of the signed-in user (requires an API key)
    #[arg(long, value_name = "JWT")]
    pub access_token: Option<String>,

    /// Company whose data is synchronized
    #[arg(long, value_name = "ID")]
    pub company: Option<String>,

    /// Signed-in user recorded on claims and audit entries
    #[arg(long, value_name = "ID")]
    pub actor: Option<String>,

    /// Persist undelivered audit records in this SQLite file
    #[arg(long, value_name = "FILE")]
    pub audit_outbox: Option<PathBuf>,
}

impl ConnectArgs {
    /// Environment configuration with flag overrides applied
    pub fn config(&self) -> Result<SyncConfig> {
        let mut config = SyncConfig::from_env().context("Invalid CW_* environment")?;
        if let Some(company) = &self.company {
            config.company_id = Some(company.clone());
        }
        if let Some(actor) = &self.actor {
            config.actor_id = Some(actor.clone());
        }
        if let Some(path) = &self.audit_outbox {
            config.audit.outbox_path = Some(path.clone());
        }
        config.validate()?;
        Ok(config)
    }

    fn auth(&self) -> Result<AuthConfig> {
        let api_key = self.api_key.clone().or_else(|| std::env::var(API_KEY_VAR).ok());
        let access_token = self
            .access_token
            .clone()
            .or_else(|| std::env::var(ACCESS_TOKEN_VAR).ok());

        match (api_key, access_token) {
            (Some(key), Some(token)) => Ok(AuthConfig::with_session(key, token)),
            (Some(key), None) => Ok(AuthConfig::with_api_key(key)),
            (None, Some(_)) => anyhow::bail!("--access-token requires --api-key"),
            (None, None) => Ok(AuthConfig::default()),
        }
    }

    /// Build a sync client against the configured server
    pub fn connect(&self, config: SyncConfig) -> Result<SyncClient> {
        let server = self
            .remote_server
            .clone()
            .or_else(|| std::env::var(REMOTE_SERVER_VAR).ok())
            .context("--remote-server (or CW_REMOTE_SERVER) is required")?;

        let mut auth = self.auth()?;
        if let Some(company) = &config.company_id {
            auth = auth.with_company_id(company.clone());
        }

        let rest = RestClient::from_url(&server, auth)
            .with_context(|| format!("Invalid remote server URL {}", server))?;
        let feed = rest.change_feed();
        debug!(server = %rest.base_url(), "connecting");

        let client = SyncClient::builder(config, Arc::new(rest), Arc::new(feed))
            .telemetry(Arc::new(TracingTelemetry))
            .build()?;
        Ok(client)
    }
}

/// Print a serializable value as pretty JSON on stdout
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_environment_config() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = dir.path().join("outbox.db");
        let args = ConnectArgs {
            company: Some("c9".into()),
            actor: Some("u9".into()),
            audit_outbox: Some(outbox.clone()),
            ..Default::default()
        };

        let config = args.config().unwrap();
        assert_eq!(config.company_id.as_deref(), Some("c9"));
        assert_eq!(config.actor_id.as_deref(), Some("u9"));
        assert_eq!(config.audit.outbox_path, Some(outbox));
    }

    #[test]
    fn test_empty_company_flag_is_rejected() {
        let args = ConnectArgs {
            company: Some(String::new()),
            ..Default::default()
        };
        assert!(args.config().is_err());
    }

    #[test]
    fn test_access_token_requires_api_key() {
        if std::env::var(API_KEY_VAR).is_ok() {
            return;
        }
        let args = ConnectArgs {
            access_token: Some("jwt".into()),
            ..Default::default()
        };
        assert!(args.auth().is_err());
    }
}
