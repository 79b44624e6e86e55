//! Target-application API.
//!
//! Everything the lifecycle manager needs from the application running on a
//! test instance: log in, adjust the test user's roles and permissions,
//! answer a liveness probe, and run a content item's test query.
//!
//! [`RestApi`] talks to the application's management REST endpoint
//! (port 8089 by default) using `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::Credentials;
use crate::config::ApiConfig;
use crate::content::ContentItem;

/// Result type for application API calls.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors returned by the application API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a response (connection refused, reset,
    /// timed out).
    #[error("Request to {url} failed: {message}")]
    Transport {
        /// Target URL.
        url: String,
        /// Underlying error.
        message: String,
    },

    /// The application answered with an error status.
    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        /// Target URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The response body could not be understood.
    #[error("Unexpected response from {url}: {message}")]
    Decode {
        /// Target URL.
        url: String,
        /// What was wrong.
        message: String,
    },

    /// The HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

impl ApiError {
    /// Returns `true` when the failure says nothing about the content under
    /// test: transport failures, server-side errors, lost authorization,
    /// request timeouts and throttling.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            ApiError::Transport { .. } | ApiError::Client(_) => true,
            ApiError::Status { status, .. } => {
                *status >= 500 || matches!(*status, 401 | 403 | 408 | 429)
            }
            ApiError::Decode { .. } => false,
        }
    }
}

/// An authenticated application session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// `host:port` the session belongs to.
    pub address: String,
    /// Session token.
    pub token: String,
}

/// Structured result of running one content item's test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    /// Whether the test's expectations held.
    pub passed: bool,
    /// Captured output.
    pub output: String,
}

/// Operations the application must support for testing.
#[async_trait]
pub trait ApplicationApi: Send + Sync {
    /// Logs in and returns a session.
    async fn authenticate(&self, address: &str, credentials: &Credentials) -> ApiResult<Session>;

    /// Grants `roles` to the role named after `user`.
    async fn import_roles(&self, session: &Session, user: &str, roles: &[String])
    -> ApiResult<()>;

    /// Sets the indexes the test user may delete events from.
    async fn allow_delete_indexes(&self, session: &Session, indexes: &[String]) -> ApiResult<()>;

    /// Liveness probe. `Ok(false)` means reachable but not healthy.
    async fn is_live(&self, address: &str, credentials: &Credentials) -> ApiResult<bool>;

    /// Runs the test for `item`.
    async fn run_test(&self, session: &Session, item: &ContentItem) -> ApiResult<TestReport>;
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(rename = "sessionKey")]
    session_key: String,
}

#[derive(Deserialize)]
struct HealthResponse {
    #[serde(default)]
    entry: Vec<HealthEntry>,
}

#[derive(Deserialize)]
struct HealthEntry {
    content: HealthContent,
}

#[derive(Deserialize)]
struct HealthContent {
    health: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<serde_json::Value>,
    #[serde(default)]
    messages: Vec<SearchMessage>,
}

#[derive(Deserialize)]
struct SearchMessage {
    #[serde(rename = "type")]
    kind: String,
    text: String,
}

const MAX_BODY_IN_ERROR: usize = 512;

/// [`ApplicationApi`] over the management REST endpoint.
pub struct RestApi {
    client: reqwest::Client,
    scheme: String,
}

impl RestApi {
    /// Builds a client from configuration.
    pub fn new(config: &ApiConfig) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("retest/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;

        Ok(Self {
            client,
            scheme: config.scheme.clone(),
        })
    }

    fn url(&self, address: &str, endpoint: &str) -> String {
        format!(
            "{}://{}/{}",
            self.scheme,
            address,
            endpoint.trim_start_matches('/')
        )
    }

    fn authorized(
        &self,
        builder: reqwest::RequestBuilder,
        session: &Session,
    ) -> reqwest::RequestBuilder {
        builder.header(
            reqwest::header::AUTHORIZATION,
            format!("Splunk {}", session.token),
        )
    }

    async fn send(&self, url: &str, request: reqwest::RequestBuilder) -> ApiResult<String> {
        debug!("API request {}", url);
        let response = request.send().await.map_err(|e| ApiError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| ApiError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(ApiError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: body.chars().take(MAX_BODY_IN_ERROR).collect(),
            });
        }
        Ok(body)
    }

    fn decode<T: serde::de::DeserializeOwned>(url: &str, body: &str) -> ApiResult<T> {
        serde_json::from_str(body).map_err(|e| ApiError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl ApplicationApi for RestApi {
    async fn authenticate(&self, address: &str, credentials: &Credentials) -> ApiResult<Session> {
        let url = self.url(address, "services/auth/login?output_mode=json");
        let request = self.client.post(&url).form(&[
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
        ]);
        let body = self.send(&url, request).await?;
        let login: LoginResponse = Self::decode(&url, &body)?;

        Ok(Session {
            address: address.to_string(),
            token: login.session_key,
        })
    }

    async fn import_roles(
        &self,
        session: &Session,
        user: &str,
        roles: &[String],
    ) -> ApiResult<()> {
        let url = self.url(
            &session.address,
            &format!("services/authorization/roles/{user}?output_mode=json"),
        );
        let form: Vec<(&str, &str)> = roles
            .iter()
            .map(|role| ("imported_roles", role.as_str()))
            .collect();
        let request = self.authorized(self.client.post(&url), session).form(&form);
        self.send(&url, request).await?;
        Ok(())
    }

    async fn allow_delete_indexes(&self, session: &Session, indexes: &[String]) -> ApiResult<()> {
        let url = self.url(
            &session.address,
            "services/properties/authorize/default/deleteIndexesAllowed",
        );
        let value = indexes.join(";");
        let request = self
            .authorized(self.client.post(&url), session)
            .form(&[("value", value.as_str())]);
        self.send(&url, request).await?;
        Ok(())
    }

    async fn is_live(&self, address: &str, credentials: &Credentials) -> ApiResult<bool> {
        let url = self.url(address, "services/server/health/splunkd?output_mode=json");
        let request = self
            .client
            .get(&url)
            .basic_auth(&credentials.username, Some(&credentials.password));
        let body = self.send(&url, request).await?;

        // Any answer other than an explicit red status counts as live.
        let live = match serde_json::from_str::<HealthResponse>(&body) {
            Ok(health) => health
                .entry
                .first()
                .is_none_or(|e| !e.content.health.eq_ignore_ascii_case("red")),
            Err(_) => true,
        };
        Ok(live)
    }

    async fn run_test(&self, session: &Session, item: &ContentItem) -> ApiResult<TestReport> {
        let Some(search) = item.search.as_deref() else {
            return Ok(TestReport {
                passed: false,
                output: format!("{} defines no test search", item.path.display()),
            });
        };

        let query = normalize_search(search);
        let url = self.url(&session.address, "services/search/jobs");
        let request = self.authorized(self.client.post(&url), session).form(&[
            ("search", query.as_str()),
            ("exec_mode", "oneshot"),
            ("output_mode", "json"),
            ("count", "0"),
        ]);
        let body = self.send(&url, request).await?;
        let response: SearchResponse = Self::decode(&url, &body)?;

        let mut output = format!("{} result(s)", response.results.len());
        for message in &response.messages {
            output.push_str(&format!("\n{}: {}", message.kind, message.text));
        }

        Ok(TestReport {
            passed: !response.results.is_empty(),
            output,
        })
    }
}

/// Searches must begin with a command; bare queries get the `search` verb.
fn normalize_search(search: &str) -> String {
    let trimmed = search.trim();
    if trimmed.starts_with('|') || trimmed.starts_with("search ") {
        trimmed.to_string()
    } else {
        format!("search {trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_search() {
        assert_eq!(normalize_search("| tstats count"), "| tstats count");
        assert_eq!(normalize_search("  search index=main "), "search index=main");
        assert_eq!(normalize_search("index=main"), "search index=main");
    }

    #[test]
    fn test_api_error_classification() {
        let transport = ApiError::Transport {
            url: "u".into(),
            message: "connection refused".into(),
        };
        assert!(transport.is_infrastructure());

        let server = ApiError::Status {
            url: "u".into(),
            status: 503,
            body: String::new(),
        };
        assert!(server.is_infrastructure());

        let bad_search = ApiError::Status {
            url: "u".into(),
            status: 400,
            body: "Unknown search command".into(),
        };
        assert!(!bad_search.is_infrastructure());

        let status = |status: u16| ApiError::Status {
            url: "u".into(),
            status,
            body: String::new(),
        };
        for code in [401, 403, 408, 429, 500, 502] {
            assert!(status(code).is_infrastructure(), "HTTP {code}");
        }
        for code in [400, 404, 409, 422] {
            assert!(!status(code).is_infrastructure(), "HTTP {code}");
        }
    }

    #[test]
    fn test_rest_api_url() {
        let api = RestApi::new(&ApiConfig::default()).unwrap();
        assert_eq!(
            api.url("10.0.0.5:8089", "/services/auth/login"),
            "https://10.0.0.5:8089/services/auth/login"
        );
    }

    #[tokio::test]
    async fn test_unreachable_instance_is_transport_error() {
        let config = ApiConfig {
            request_timeout_secs: 2,
            ..ApiConfig::default()
        };
        let api = RestApi::new(&config).unwrap();
        let credentials = Credentials::new("admin", "changeme");

        // Port 9 on localhost is the discard service; nothing listens there.
        let err = api.is_live("127.0.0.1:9", &credentials).await.unwrap_err();
        assert!(err.is_infrastructure());
    }

    #[tokio::test]
    async fn test_missing_search_fails_without_request() {
        let api = RestApi::new(&ApiConfig::default()).unwrap();
        let session = Session {
            address: "127.0.0.1:9".into(),
            token: "t".into(),
        };
        let report = api
            .run_test(&session, &ContentItem::new("d", "/r/detections/d.yml"))
            .await
            .unwrap();
        assert!(!report.passed);
        assert!(report.output.contains("no test search"));
    }
}
