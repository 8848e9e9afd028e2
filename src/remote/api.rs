use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Deserializer, de::DeserializeOwned};

use crate::core::{domain::Language, traits::backend::BackendError};

pub const DEFAULT_REMOTE_URL: &str = "https://api.paiza.io";
pub const DEFAULT_API_KEY: &str = "guest";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    /// Anything else the API reports, `error` included.
    #[serde(other)]
    Unknown,
}

impl SessionStatus {
    /// Only `running` keeps the poll going; every other status has details to fetch.
    pub fn is_running(&self) -> bool {
        matches!(self, SessionStatus::Running)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
struct StatusReply {
    status: SessionStatus,
}

/// Everything the API reports about a finished session. Output fields must
/// be present but may be `null`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct SessionDetails {
    #[serde(deserialize_with = "null_as_empty")]
    pub build_stdout: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub build_stderr: String,
    #[serde(default)]
    pub build_result: Option<String>,
    #[serde(deserialize_with = "null_as_empty")]
    pub stdout: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub stderr: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl SessionDetails {
    pub fn build_failed(&self) -> bool {
        self.build_result.as_deref() == Some("failure")
    }

    pub fn run_failed(&self) -> bool {
        match self.result.as_deref() {
            Some("success") => false,
            Some(_) => true,
            None => self.exit_code.is_some_and(|code| code != 0),
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Remote compile-and-run service. Every call is bounded by `budget`.
#[mockall::automock]
#[async_trait::async_trait]
pub trait RemoteApi: std::fmt::Debug + Send + Sync {
    async fn create(
        &self,
        language: Language,
        source: &str,
        budget: Duration,
    ) -> Result<Session, BackendError>;

    async fn status(&self, id: &str, budget: Duration) -> Result<SessionStatus, BackendError>;

    async fn details(&self, id: &str, budget: Duration) -> Result<SessionDetails, BackendError>;
}

/// reqwest client for a paiza.io-style runners API.
#[derive(Clone, Debug)]
pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpRemoteApi {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, BackendError> {
        let client = Client::builder()
            .build()
            .map_err(|e| BackendError::Init { msg: e.to_string() })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/runners/{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        budget: Duration,
    ) -> Result<T, BackendError> {
        let response = request
            .timeout(budget)
            .send()
            .await
            .map_err(|e| BackendError::Transport { msg: e.to_string() })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Transport { msg: e.to_string() })?;

        if !status.is_success() {
            return Err(BackendError::Transport {
                msg: format!("HTTP {}: {}", status, body.trim()),
            });
        }

        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| BackendError::Malformed { msg: e.to_string() })?;
        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            return Err(BackendError::Transport {
                msg: format!("remote API refused the request: {error}"),
            });
        }
        serde_json::from_value(value).map_err(|e| BackendError::Malformed { msg: e.to_string() })
    }
}

#[async_trait::async_trait]
impl RemoteApi for HttpRemoteApi {
    #[tracing::instrument(skip(self, source))]
    async fn create(
        &self,
        language: Language,
        source: &str,
        budget: Duration,
    ) -> Result<Session, BackendError> {
        let request = self.client.post(self.url("create")).form(&[
            ("source_code", source),
            ("language", language.remote_name()),
            ("api_key", self.api_key.as_str()),
        ]);
        self.send(request, budget).await
    }

    #[tracing::instrument(skip(self))]
    async fn status(&self, id: &str, budget: Duration) -> Result<SessionStatus, BackendError> {
        let request = self
            .client
            .get(self.url("get_status"))
            .query(&[("id", id), ("api_key", self.api_key.as_str())]);
        self.send::<StatusReply>(request, budget)
            .await
            .map(|reply| reply.status)
    }

    #[tracing::instrument(skip(self))]
    async fn details(&self, id: &str, budget: Duration) -> Result<SessionDetails, BackendError> {
        let request = self
            .client
            .get(self.url("get_details"))
            .query(&[("id", id), ("api_key", self.api_key.as_str())]);
        self.send(request, budget).await
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;

    const BUDGET: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_create_posts_source_and_language() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/runners/create")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("language".into(), "cpp".into()),
                Matcher::UrlEncoded("api_key".into(), "guest".into()),
                Matcher::UrlEncoded("source_code".into(), "int main() {}".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"id":"abc","status":"running"}"#)
            .create_async()
            .await;

        let api = HttpRemoteApi::new(server.url(), DEFAULT_API_KEY).unwrap();
        let session = api.create(Language::Cpp, "int main() {}", BUDGET).await.unwrap();

        assert_eq!(
            session,
            Session {
                id: "abc".to_string(),
                status: SessionStatus::Running
            }
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_and_details() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/runners/get_status")
            .match_query(Matcher::UrlEncoded("id".into(), "abc".into()))
            .with_body(r#"{"id":"abc","status":"completed"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/runners/get_details")
            .match_query(Matcher::UrlEncoded("id".into(), "abc".into()))
            .with_body(
                r#"{"id":"abc","build_stdout":null,"build_stderr":"","build_result":"success",
                    "stdout":"7 3\n","stderr":null,"result":"success","exit_code":0}"#,
            )
            .create_async()
            .await;

        let api = HttpRemoteApi::new(server.url(), DEFAULT_API_KEY).unwrap();
        assert_eq!(api.status("abc", BUDGET).await.unwrap(), SessionStatus::Completed);

        let details = api.details("abc", BUDGET).await.unwrap();
        assert_eq!(details.stdout, "7 3\n");
        assert_eq!(details.stderr, "");
        assert!(!details.build_failed());
        assert!(!details.run_failed());
    }

    #[test]
    fn test_unrecognised_status_is_terminal() {
        let status: SessionStatus = serde_json::from_str(r#""error""#).unwrap();
        assert_eq!(status, SessionStatus::Unknown);
        assert!(!status.is_running());
        assert!(!SessionStatus::Completed.is_running());
        assert!(SessionStatus::Running.is_running());
    }

    #[tokio::test]
    async fn test_non_success_status_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/runners/get_status")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("busy")
            .create_async()
            .await;

        let api = HttpRemoteApi::new(server.url(), DEFAULT_API_KEY).unwrap();
        let err = api.status("abc", BUDGET).await.unwrap_err();

        assert!(matches!(&err, BackendError::Transport { msg } if msg.contains("503") && msg.contains("busy")));
    }

    #[tokio::test]
    async fn test_bad_bodies_are_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/runners/get_status")
            .match_query(Matcher::Any)
            .with_body("<html>")
            .create_async()
            .await;
        server
            .mock("GET", "/runners/get_details")
            .match_query(Matcher::Any)
            .with_body(r#"{"id":"abc","result":"success"}"#)
            .create_async()
            .await;

        let api = HttpRemoteApi::new(server.url(), DEFAULT_API_KEY).unwrap();
        assert!(matches!(
            api.status("abc", BUDGET).await,
            Err(BackendError::Malformed { .. })
        ));

        let err = api.details("abc", BUDGET).await.unwrap_err();
        assert!(matches!(&err, BackendError::Malformed { msg } if msg.contains("build_stdout")));
    }

    #[tokio::test]
    async fn test_error_body_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/runners/create")
            .with_body(r#"{"error":"Invalid API key"}"#)
            .create_async()
            .await;

        let api = HttpRemoteApi::new(server.url(), "nope").unwrap();
        let err = api.create(Language::Cpp, "", BUDGET).await.unwrap_err();
        assert!(err.to_string().contains("Invalid API key"));
    }

    #[test]
    fn test_failure_flags() {
        let details = SessionDetails {
            build_result: Some("failure".to_string()),
            ..Default::default()
        };
        assert!(details.build_failed());

        let details = SessionDetails {
            result: Some("failure".to_string()),
            exit_code: Some(1),
            ..Default::default()
        };
        assert!(details.run_failed());

        let details = SessionDetails {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(!details.run_failed());
    }
}
