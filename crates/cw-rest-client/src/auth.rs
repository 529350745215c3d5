//! Authentication methods for the data store client

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// Authentication methods supported by the data store
#[derive(Debug, Clone, Default)]
pub enum AuthMethod {
    /// Project API key (`apikey: <key>` and `Authorization: Bearer <key>`)
    ApiKey(String),
    /// API key plus a signed-in user's session JWT
    Session { api_key: String, access_token: String },
    /// No authentication
    #[default]
    None,
}

impl AuthMethod {
    /// Apply authentication headers to a request
    pub fn apply_to_headers(
        &self,
        headers: &mut HeaderMap,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match self {
            AuthMethod::ApiKey(key) => {
                headers.insert(HeaderName::from_static("apikey"), HeaderValue::from_str(key)?);
                headers.insert(
                    HeaderName::from_static("authorization"),
                    HeaderValue::from_str(&format!("Bearer {}", key))?,
                );
            }
            AuthMethod::Session {
                api_key,
                access_token,
            } => {
                headers.insert(
                    HeaderName::from_static("apikey"),
                    HeaderValue::from_str(api_key)?,
                );
                headers.insert(
                    HeaderName::from_static("authorization"),
                    HeaderValue::from_str(&format!("Bearer {}", access_token))?,
                );
            }
            AuthMethod::None => {}
        }
        Ok(())
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey(key.into())
    }

    pub fn session(api_key: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self::Session {
            api_key: api_key.into(),
            access_token: access_token.into(),
        }
    }

    /// The key sent as the `apikey` query parameter on realtime connections
    pub fn key(&self) -> Option<&str> {
        match self {
            AuthMethod::ApiKey(key) => Some(key),
            AuthMethod::Session { api_key, .. } => Some(api_key),
            AuthMethod::None => None,
        }
    }
}

/// Authentication configuration for the client
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub method: AuthMethod,
    pub company_id: Option<String>,
}

impl AuthConfig {
    pub fn with_api_key(key: impl Into<String>) -> Self {
        Self {
            method: AuthMethod::api_key(key),
            company_id: None,
        }
    }

    pub fn with_session(api_key: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            method: AuthMethod::session(api_key, access_token),
            company_id: None,
        }
    }

    /// Scope requests to one company
    pub fn with_company_id(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }

    /// Get headers for this authentication configuration
    pub fn headers(&self) -> Result<HeaderMap, Box<dyn std::error::Error + Send + Sync>> {
        let mut headers = HeaderMap::new();
        self.method.apply_to_headers(&mut headers)?;

        if let Some(company_id) = &self.company_id {
            headers.insert(
                HeaderName::from_static("x-company-id"),
                HeaderValue::from_str(company_id)?,
            );
        }

        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_auth_headers() {
        let auth = AuthMethod::api_key("anon-key");
        let mut headers = HeaderMap::new();
        auth.apply_to_headers(&mut headers).unwrap();

        assert_eq!(headers.get("apikey").unwrap(), "anon-key");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer anon-key");
    }

    #[test]
    fn test_session_auth_headers() {
        let auth = AuthMethod::session("anon-key", "user-jwt");
        let mut headers = HeaderMap::new();
        auth.apply_to_headers(&mut headers).unwrap();

        assert_eq!(headers.get("apikey").unwrap(), "anon-key");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer user-jwt");
    }

    #[test]
    fn test_auth_config_with_company() {
        let config = AuthConfig::with_api_key("key").with_company_id("c1");
        let headers = config.headers().unwrap();

        assert_eq!(headers.get("apikey").unwrap(), "key");
        assert_eq!(headers.get("x-company-id").unwrap(), "c1");
    }

    #[test]
    fn test_no_auth_has_no_key() {
        assert!(AuthMethod::None.key().is_none());
        assert_eq!(AuthMethod::session("k", "t").key(), Some("k"));
    }
}
