//! Data store REST client implementation

use cw_sync_contract::*;
use reqwest::{Client as HttpClient, Method, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;
use url::Url;

use crate::auth::AuthConfig;
use crate::error::{RestClientError, RestClientResult};
use crate::sse::SseChangeFeed;

const REST_PREFIX: &str = "/rest/v1/";

/// REST client for the catering workflow data store
#[derive(Debug, Clone)]
pub struct RestClient {
    http_client: HttpClient,
    base_url: Url,
    auth: AuthConfig,
}

impl RestClient {
    /// Create a new REST client
    pub fn new(base_url: Url, auth: AuthConfig) -> RestClientResult<Self> {
        let http_client = HttpClient::builder().user_agent("cw-sync/1.0").build()?;

        Ok(Self {
            http_client,
            base_url,
            auth,
        })
    }

    /// Create a client from a base URL string
    pub fn from_url(base_url: &str, auth: AuthConfig) -> RestClientResult<Self> {
        let base_url = Url::parse(base_url)?;
        Self::new(base_url, auth)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    /// Change feed sharing this client's endpoint and credentials
    pub fn change_feed(&self) -> SseChangeFeed {
        SseChangeFeed::new(self.base_url.clone(), self.auth.clone())
    }

    /// Read the rows behind a cache key.
    ///
    /// `[resource, company]` keys return the company's rows as an array;
    /// `[resource, company, id]` keys return the single row or `null`.
    pub async fn fetch(&self, key: &ResourceKey) -> RestClientResult<serde_json::Value> {
        let url = self.table_url_for_key(key)?;
        let rows: serde_json::Value = self.request(Method::GET, url, None::<&()>).await?;

        if key.parts().len() > 2 {
            Ok(rows.as_array().and_then(|r| r.first()).cloned().unwrap_or_default())
        } else {
            Ok(rows)
        }
    }

    pub async fn claim_task(
        &self,
        request: &ClaimTaskRequest,
    ) -> RestClientResult<TaskActionResponse> {
        self.rpc("claim_task", request).await
    }

    pub async fn assign_task(
        &self,
        request: &AssignTaskRequest,
    ) -> RestClientResult<TaskActionResponse> {
        self.rpc("assign_task", request).await
    }

    pub async fn complete_task(
        &self,
        request: &CompleteTaskRequest,
    ) -> RestClientResult<TaskActionResponse> {
        self.rpc("complete_task", request).await
    }

    pub async fn undo_task(&self, request: &UndoTaskRequest) -> RestClientResult<TaskActionResponse> {
        self.rpc("undo_task", request).await
    }

    pub async fn combine_tasks(
        &self,
        request: &CombineTasksRequest,
    ) -> RestClientResult<CombineTasksResponse> {
        self.rpc("combine_tasks", request).await
    }

    pub async fn undo_combine(
        &self,
        request: &UndoCombineRequest,
    ) -> RestClientResult<TaskActionResponse> {
        self.rpc("undo_combine", request).await
    }

    /// List pending combination suggestions, most similar first
    pub async fn list_suggestions(
        &self,
        company_id: &str,
    ) -> RestClientResult<Vec<CombinationSuggestion>> {
        let mut url = self.table_url(tables::SUGGESTIONS)?;
        url.query_pairs_mut()
            .append_pair("company_id", &format!("eq.{}", company_id))
            .append_pair("order", "similarity_score.desc");
        self.request(Method::GET, url, None::<&()>).await
    }

    pub async fn delete_suggestion(&self, suggestion_id: &str) -> RestClientResult<()> {
        let mut url = self.table_url(tables::SUGGESTIONS)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{}", suggestion_id));
        self.request(Method::DELETE, url, None::<&()>).await
    }

    pub async fn append_audit(&self, record: &AuditRecord) -> RestClientResult<()> {
        let url = self.table_url(tables::AUDIT_LOG)?;
        self.request(Method::POST, url, Some(record)).await
    }

    // Private helper methods

    async fn rpc<T: DeserializeOwned, B: Serialize>(
        &self,
        name: &str,
        body: &B,
    ) -> RestClientResult<T> {
        let url = self.base_url.join(&format!("{}rpc/{}", REST_PREFIX, name))?;
        debug!(rpc = name, "invoking remote procedure");
        self.request(Method::POST, url, Some(body)).await
    }

    fn table_url(&self, table: &str) -> RestClientResult<Url> {
        Ok(self.base_url.join(&format!("{}{}", REST_PREFIX, table))?)
    }

    fn table_url_for_key(&self, key: &ResourceKey) -> RestClientResult<Url> {
        let (resource, company_id, id) = match key.parts() {
            [resource, company_id] => (resource, company_id, None),
            [resource, company_id, id] => (resource, company_id, Some(id)),
            _ => return Err(RestClientError::UnsupportedKey(key.to_string())),
        };

        let table = match resource.as_str() {
            "suggestions" => tables::SUGGESTIONS,
            other => other,
        };

        let mut url = self.table_url(table)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("company_id", &format!("eq.{}", company_id));
            if let Some(id) = id {
                pairs.append_pair("id", &format!("eq.{}", id));
            }
        }
        Ok(url)
    }

    async fn request<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> RestClientResult<T> {
        let mut request = self.http_client.request(method, url);

        let auth_headers = self.auth.headers().map_err(|e| RestClientError::Auth(e.to_string()))?;
        request = request.headers(auth_headers);

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        self.handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> RestClientResult<T> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            // 204 and `return=minimal` responses carry no body
            let text = if text.trim().is_empty() { "null" } else { text.as_str() };
            serde_json::from_str(text).map_err(RestClientError::from)
        } else {
            match serde_json::from_str::<RpcErrorBody>(&text) {
                Ok(body) => Err(RestClientError::ServerError { status, body }),
                Err(_) => Err(RestClientError::UnexpectedResponse(text)),
            }
        }
    }
}
