//! Questionnaire discovery against the Blaise REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;

use crate::questionnaire::Questionnaire;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lists the questionnaires installed in a server park.
#[async_trait]
pub trait QuestionnaireDirectory: Send + Sync {
    async fn list_questionnaires(&self, server_park: &str)
    -> Result<Vec<Questionnaire>, DirectoryError>;
}

/// Discovery failed; the run cannot continue.
#[derive(Debug, thiserror::Error)]
#[error("Error getting questionnaires for server park '{server_park}': {message}")]
pub struct DirectoryError {
    pub server_park: String,
    pub message: String,
    #[source]
    pub source: Option<reqwest::Error>,
}

impl DirectoryError {
    pub fn new(server_park: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            server_park: server_park.into(),
            message: message.into(),
            source: None,
        }
    }

    fn request(server_park: &str, context: &str, err: reqwest::Error) -> Self {
        Self {
            server_park: server_park.to_string(),
            message: format!("{context}: {err}"),
            source: Some(err),
        }
    }
}

/// [`QuestionnaireDirectory`] backed by the Blaise REST API.
#[derive(Clone)]
pub struct BlaiseDirectory {
    base_url: String,
    client: reqwest::Client,
}

impl BlaiseDirectory {
    /// `base_url` may omit the scheme, in which case `http://` is assumed.
    pub fn new(base_url: impl Into<String>) -> reqwest::Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Like [`new`](Self::new) with a per-request `timeout`.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into();
        let base_url = if base_url.contains("://") {
            base_url
        } else {
            format!("http://{base_url}")
        };
        Self { base_url, client }
    }

    fn questionnaires_url(&self, server_park: &str) -> Result<Url, DirectoryError> {
        let mut url = Url::parse(self.base_url.trim_end_matches('/')).map_err(|err| {
            DirectoryError::new(server_park, format!("invalid Blaise API url: {err}"))
        })?;
        url.path_segments_mut()
            .map_err(|()| DirectoryError::new(server_park, "Blaise API url cannot be a base"))?
            .pop_if_empty()
            .extend(["api", "v2", "serverparks", server_park, "questionnaires"]);
        Ok(url)
    }
}

#[async_trait]
impl QuestionnaireDirectory for BlaiseDirectory {
    async fn list_questionnaires(
        &self,
        server_park: &str,
    ) -> Result<Vec<Questionnaire>, DirectoryError> {
        let url = self.questionnaires_url(server_park)?;
        tracing::debug!(%url, "listing questionnaires");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| DirectoryError::request(server_park, "request failed", err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DirectoryError::new(
                server_park,
                format!("unexpected status {status}: {}", body.trim()),
            ));
        }

        let questionnaires = response
            .json::<Vec<Questionnaire>>()
            .await
            .map_err(|err| DirectoryError::request(server_park, "invalid response body", err))?;
        tracing::info!(
            server_park,
            count = questionnaires.len(),
            "listed questionnaires"
        );
        Ok(questionnaires)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use serde_json::json;

    async fn spawn_server(status: StatusCode, body: serde_json::Value) -> String {
        let app = Router::new().route(
            "/api/v2/serverparks/gusty/questionnaires",
            get(move || {
                let body = body.clone();
                async move { (status, axum::Json(body)) }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        format!("{addr}")
    }

    #[tokio::test]
    async fn lists_questionnaires_from_server_park() {
        let addr = spawn_server(
            StatusCode::OK,
            json!([
                { "name": "FRS2504A", "id": "1", "serverParkName": "gusty", "status": "Active" },
                { "name": "LCF2504A", "id": "2", "serverParkName": "gusty", "installDate": "2025-04-01" }
            ]),
        )
        .await;
        // Scheme omitted on purpose.
        let directory = BlaiseDirectory::new(addr).expect("client");

        let questionnaires = directory.list_questionnaires("gusty").await.expect("list");
        let names: Vec<&str> = questionnaires.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, ["FRS2504A", "LCF2504A"]);
        assert_eq!(
            questionnaires[1].metadata.get("installDate"),
            Some(&json!("2025-04-01"))
        );
    }

    #[tokio::test]
    async fn non_success_status_names_the_server_park() {
        let addr = spawn_server(StatusCode::INTERNAL_SERVER_ERROR, json!({ "message": "down" })).await;
        let directory = BlaiseDirectory::new(format!("http://{addr}/")).expect("client");

        let err = directory
            .list_questionnaires("gusty")
            .await
            .expect_err("server error");
        assert_eq!(err.server_park, "gusty");
        assert!(
            err.to_string()
                .starts_with("Error getting questionnaires for server park 'gusty': unexpected status 500"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn undecodable_body_is_a_directory_error() {
        let addr = spawn_server(StatusCode::OK, json!({ "not": "a list" })).await;
        let directory = BlaiseDirectory::new(addr).expect("client");

        let err = directory
            .list_questionnaires("gusty")
            .await
            .expect_err("bad body");
        assert!(err.message.starts_with("invalid response body"), "{err}");
    }

    #[tokio::test]
    async fn slow_server_hits_the_request_timeout() {
        let app = Router::new().route(
            "/api/v2/serverparks/gusty/questionnaires",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                axum::Json(json!([]))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        let directory = BlaiseDirectory::with_timeout(addr.to_string(), Duration::from_millis(100))
            .expect("client");

        let started = std::time::Instant::now();
        let err = directory
            .list_questionnaires("gusty")
            .await
            .expect_err("timed out");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(err.message.starts_with("request failed"), "{err}");
        assert!(err.source.as_ref().is_some_and(reqwest::Error::is_timeout));
    }

    #[test]
    fn builds_questionnaire_url() {
        let directory = BlaiseDirectory::new("blaise-api.internal:90/").expect("client");
        let url = directory.questionnaires_url("gusty").expect("url");
        assert_eq!(
            url.as_str(),
            "http://blaise-api.internal:90/api/v2/serverparks/gusty/questionnaires"
        );
    }
}
