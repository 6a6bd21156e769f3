//! Versioned access to the cloud report table

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::{
    AcceptedResponse, ConflictResponse, DeleteReportRequest, RemoteReport, StoreWrite,
    WriteReportRequest,
};
use crate::payload::Payload;

/// Outcome of a versioned write or delete
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Accepted {
        version: i64,
        updated_at: DateTime<Utc>,
    },
    /// `base_version` did not match the stored version
    Conflict {
        current_version: i64,
        current_payload: Payload,
    },
    NotFound,
    /// Timeout, connection failure or server error; worth retrying
    TransientError(String),
}

impl From<StoreWrite> for WriteOutcome {
    fn from(write: StoreWrite) -> Self {
        match write {
            StoreWrite::Accepted {
                version,
                updated_at,
            } => Self::Accepted {
                version,
                updated_at,
            },
            StoreWrite::Conflict {
                current_version,
                current_payload,
            } => Self::Conflict {
                current_version,
                current_payload,
            },
            StoreWrite::NotFound => Self::NotFound,
            StoreWrite::ReplayMismatch => {
                Self::TransientError("operation id already used for a different write".into())
            }
        }
    }
}

/// Transport to the remote versioned report store
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Create (`base_version = None`) or update a report
    async fn write_versioned(&self, report_id: &str, request: &WriteReportRequest)
    -> WriteOutcome;

    async fn delete_versioned(
        &self,
        report_id: &str,
        request: &DeleteReportRequest,
    ) -> WriteOutcome;

    /// Current cloud copy of a report
    async fn fetch(&self, report_id: &str) -> Result<Option<RemoteReport>>;
}

/// `CloudClient` speaking the certsync server's JSON API
#[derive(Clone)]
pub struct HttpCloudClient {
    endpoint: Url,
    token: Option<String>,
    client: Client,
}

impl std::fmt::Debug for HttpCloudClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpCloudClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl HttpCloudClient {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| Error::InvalidInput(format!("invalid server URL: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::InvalidInput("server URL cannot carry a path".into()));
        }
        let token = token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());

        Ok(Self {
            endpoint,
            token,
            client: Client::builder().timeout(timeout).build()?,
        })
    }

    /// The id is one percent-encoded path segment, whatever it contains
    fn report_url(&self, report_id: &str) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["api", "v1", "reports", report_id]);
        }
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_versioned(&self, request: reqwest::RequestBuilder, op_id: &str) -> WriteOutcome {
        let response = match self
            .authorize(request)
            .header("Idempotency-Key", op_id)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return WriteOutcome::TransientError(describe_transport_error(&e)),
        };

        let status = response.status();
        match status {
            StatusCode::OK | StatusCode::CREATED => match response.json::<AcceptedResponse>().await {
                Ok(accepted) => WriteOutcome::Accepted {
                    version: accepted.version,
                    updated_at: accepted.updated_at,
                },
                Err(e) => WriteOutcome::TransientError(format!("invalid accept body: {e}")),
            },
            StatusCode::CONFLICT => match response.json::<ConflictResponse>().await {
                Ok(conflict) => WriteOutcome::Conflict {
                    current_version: conflict.current_version,
                    current_payload: conflict.current_payload,
                },
                Err(e) => WriteOutcome::TransientError(format!("invalid conflict body: {e}")),
            },
            StatusCode::NOT_FOUND => WriteOutcome::NotFound,
            _ => {
                let body = response.text().await.unwrap_or_default();
                WriteOutcome::TransientError(parse_api_error(status, &body))
            }
        }
    }
}

#[async_trait]
impl CloudClient for HttpCloudClient {
    async fn write_versioned(
        &self,
        report_id: &str,
        request: &WriteReportRequest,
    ) -> WriteOutcome {
        let builder = self.client.put(self.report_url(report_id)).json(request);
        self.send_versioned(builder, &request.op_id).await
    }

    async fn delete_versioned(
        &self,
        report_id: &str,
        request: &DeleteReportRequest,
    ) -> WriteOutcome {
        let builder = self.client.delete(self.report_url(report_id)).json(request);
        self.send_versioned(builder, &request.op_id).await
    }

    async fn fetch(&self, report_id: &str) -> Result<Option<RemoteReport>> {
        let response = self
            .authorize(self.client.get(self.report_url(report_id)))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::Transient(describe_transport_error(&e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transient(parse_api_error(status, &body)));
        }

        Ok(Some(response.json::<RemoteReport>().await?))
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body)
        && let Some(message) = payload.error.or(payload.message)
    {
        return format!("{} ({})", message.trim(), status.as_u16());
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn describe_transport_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    }
}

fn normalize_endpoint(raw: String) -> Result<String> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return Err(Error::InvalidInput("server URL must not be empty".into()));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "server URL must include http:// or https://".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_endpoint_requires_scheme() {
        assert!(normalize_endpoint(String::new()).is_err());
        assert!(normalize_endpoint("sync.example.com".into()).is_err());
        assert_eq!(
            normalize_endpoint(" https://sync.example.com/ ".into()).unwrap(),
            "https://sync.example.com"
        );
    }

    #[test]
    fn api_error_prefers_json_message() {
        assert_eq!(
            parse_api_error(StatusCode::UNAUTHORIZED, r#"{"error":"Invalid API token"}"#),
            "Invalid API token (401)"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, ""), "HTTP 502");
    }

    #[test]
    fn report_ids_are_escaped_into_one_segment() {
        let client =
            HttpCloudClient::new("https://sync.example.com/certs/", None, Duration::from_secs(1))
                .unwrap();

        assert_eq!(
            client.report_url("r1").as_str(),
            "https://sync.example.com/certs/api/v1/reports/r1"
        );
        let url = client.report_url("site?draft#2");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
        assert_eq!(
            url.path_segments().unwrap().last(),
            Some("site%3Fdraft%232")
        );
        assert!(client.report_url("board/1").path().ends_with("/reports/board%2F1"));
    }

    #[test]
    fn debug_redacts_token() {
        let client = HttpCloudClient::new(
            "http://127.0.0.1:3030",
            Some("tks_secret".into()),
            Duration::from_secs(1),
        )
        .unwrap();
        let debug = format!("{client:?}");
        assert!(!debug.contains("tks_secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
