//! reqwest-backed `PlatformApi`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::PlatformConfig;
use crate::error::{EngineError, Result};

use super::{
    Credential, EnvironmentState, PackageRequest, PackageStatus, PlatformApi, PlatformError,
    PlatformResult, SnapshotStatus,
};

#[derive(Deserialize)]
struct StateBody {
    state: EnvironmentState,
}

#[derive(Deserialize)]
struct DeployedBody {
    #[serde(default)]
    package_id: Option<String>,
}

#[derive(Deserialize)]
struct IdBody {
    id: String,
}

#[derive(Deserialize)]
struct StatusBody<T> {
    status: T,
}

pub struct HttpPlatform {
    client: Client,
    base: Url,
}

impl HttpPlatform {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| EngineError::PlatformClient(format!("invalid base url '{base_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(EngineError::PlatformClient(format!(
                "base url '{base_url}' cannot carry a path"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::PlatformClient(e.to_string()))?;
        Ok(Self { client, base })
    }

    pub fn from_config(config: &PlatformConfig) -> Result<Self> {
        Self::new(&config.base_url, config.request_timeout())
    }

    fn url(&self, segments: &[&str]) -> PlatformResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| PlatformError::Transport(format!("bad base url {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        cred: &Credential,
        segments: &[&str],
        body: Option<serde_json::Value>,
    ) -> PlatformResult<reqwest::Response> {
        let url = self.url(segments)?;
        let mut req = self
            .client
            .request(method.clone(), url.clone())
            .bearer_auth(cred.token());
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| PlatformError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        tracing::debug!(%method, %url, status = status.as_u16(), "platform call rejected");
        Err(PlatformError::from_status(status.as_u16(), text))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        cred: &Credential,
        segments: &[&str],
    ) -> PlatformResult<T> {
        let resp = self.send(Method::GET, cred, segments, None).await?;
        resp.json::<T>()
            .await
            .map_err(|e| PlatformError::Decode(e.to_string()))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        cred: &Credential,
        segments: &[&str],
        body: serde_json::Value,
    ) -> PlatformResult<T> {
        let resp = self.send(Method::POST, cred, segments, Some(body)).await?;
        resp.json::<T>()
            .await
            .map_err(|e| PlatformError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PlatformApi for HttpPlatform {
    async fn environment_state(
        &self,
        cred: &Credential,
        app: &str,
        env: &str,
    ) -> PlatformResult<EnvironmentState> {
        let body: StateBody = self
            .get_json(cred, &["applications", app, "environments", env])
            .await?;
        Ok(body.state)
    }

    async fn start_environment(
        &self,
        cred: &Credential,
        app: &str,
        env: &str,
    ) -> PlatformResult<()> {
        self.send(
            Method::POST,
            cred,
            &["applications", app, "environments", env, "start"],
            None,
        )
        .await?;
        Ok(())
    }

    async fn stop_environment(
        &self,
        cred: &Credential,
        app: &str,
        env: &str,
    ) -> PlatformResult<()> {
        self.send(
            Method::POST,
            cred,
            &["applications", app, "environments", env, "stop"],
            None,
        )
        .await?;
        Ok(())
    }

    async fn deployed_package(
        &self,
        cred: &Credential,
        app: &str,
        env: &str,
    ) -> PlatformResult<Option<String>> {
        let body: DeployedBody = self
            .get_json(cred, &["applications", app, "environments", env, "package"])
            .await?;
        Ok(body.package_id)
    }

    async fn create_package(
        &self,
        cred: &Credential,
        app: &str,
        request: &PackageRequest,
    ) -> PlatformResult<String> {
        let body = serde_json::to_value(request)
            .map_err(|e| PlatformError::Decode(e.to_string()))?;
        let created: IdBody = self
            .post_json(cred, &["applications", app, "packages"], body)
            .await?;
        Ok(created.id)
    }

    async fn package_status(
        &self,
        cred: &Credential,
        app: &str,
        package_id: &str,
    ) -> PlatformResult<PackageStatus> {
        let body: StatusBody<PackageStatus> = self
            .get_json(cred, &["applications", app, "packages", package_id])
            .await?;
        Ok(body.status)
    }

    async fn transport_package(
        &self,
        cred: &Credential,
        app: &str,
        package_id: &str,
        env: &str,
    ) -> PlatformResult<()> {
        self.send(
            Method::POST,
            cred,
            &["applications", app, "packages", package_id, "transport"],
            Some(serde_json::json!({ "environment": env })),
        )
        .await?;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        cred: &Credential,
        app: &str,
        env: &str,
        comment: Option<&str>,
    ) -> PlatformResult<String> {
        let created: IdBody = self
            .post_json(
                cred,
                &["applications", app, "environments", env, "snapshots"],
                serde_json::json!({ "comment": comment }),
            )
            .await?;
        Ok(created.id)
    }

    async fn snapshot_status(
        &self,
        cred: &Credential,
        app: &str,
        env: &str,
        snapshot_id: &str,
    ) -> PlatformResult<SnapshotStatus> {
        let body: StatusBody<SnapshotStatus> = self
            .get_json(
                cred,
                &["applications", app, "environments", env, "snapshots", snapshot_id],
            )
            .await?;
        Ok(body.status)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cred() -> Credential {
        Credential::new("tok-1")
    }

    async fn platform(server: &mockito::ServerGuard) -> HttpPlatform {
        HttpPlatform::new(&server.url(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn environment_state_sends_bearer_and_decodes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/applications/shop/environments/prod")
            .match_header("authorization", "Bearer tok-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"state":"starting"}"#)
            .create_async()
            .await;

        let p = platform(&server).await;
        let state = p.environment_state(&cred(), "shop", "prod").await.unwrap();
        assert_eq!(state, EnvironmentState::Starting);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn not_found_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/applications/shop/environments/ghost/stop")
            .with_status(404)
            .with_body("no such environment")
            .create_async()
            .await;

        let p = platform(&server).await;
        let err = p
            .stop_environment(&cred(), "shop", "ghost")
            .await
            .unwrap_err();
        assert_eq!(err, PlatformError::NotFound("no such environment".into()));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn forbidden_is_fatal_and_server_error_is_retryable() {
        let mut server = mockito::Server::new_async().await;
        let _a = server
            .mock("POST", "/applications/shop/environments/prod/start")
            .with_status(403)
            .create_async()
            .await;
        let _b = server
            .mock("GET", "/applications/shop/packages/pkg-1")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let p = platform(&server).await;
        let start = p.start_environment(&cred(), "shop", "prod").await.unwrap_err();
        assert!(matches!(start, PlatformError::Unauthorized(_)));

        let status = p.package_status(&cred(), "shop", "pkg-1").await.unwrap_err();
        assert_eq!(
            status,
            PlatformError::Status {
                status: 503,
                body: "maintenance".into()
            }
        );
        assert!(!status.is_fatal());
    }

    #[tokio::test]
    async fn create_package_posts_request_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/applications/shop/packages")
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({ "branch": "release/1.2", "version": "1.2.0" }),
            ))
            .with_status(201)
            .with_body(r#"{"id":"pkg-42"}"#)
            .create_async()
            .await;

        let p = platform(&server).await;
        let req = PackageRequest {
            branch: "release/1.2".into(),
            revision: None,
            version: Some("1.2.0".into()),
            comment: None,
        };
        let id = p.create_package(&cred(), "shop", &req).await.unwrap();
        assert_eq!(id, "pkg-42");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn undecodable_body_is_retryable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/applications/shop/environments/prod/package")
            .with_status(200)
            .with_body("<html>gateway</html>")
            .create_async()
            .await;

        let p = platform(&server).await;
        let err = p
            .deployed_package(&cred(), "shop", "prod")
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Decode(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn base_path_is_preserved() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/applications/shop/environments/prod/snapshots/snap-9")
            .with_status(200)
            .with_body(r#"{"status":"complete"}"#)
            .create_async()
            .await;

        let p = HttpPlatform::new(&format!("{}/v1/", server.url()), Duration::from_secs(5))
            .unwrap();
        let status = p
            .snapshot_status(&cred(), "shop", "prod", "snap-9")
            .await
            .unwrap();
        assert_eq!(status, SnapshotStatus::Complete);
        mock.assert_async().await;
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(HttpPlatform::new("not a url", Duration::from_secs(1)).is_err());
    }
}
