//! Coordinator transport
//!
//! [`Coordinator`] is the seam between the worker's state machine and the
//! network. [`HttpCoordinator`] speaks the JSON-over-HTTP protocol; tests plug
//! in scripted implementations.

use async_trait::async_trait;
use kiln_core::config::CoordinatorConfig;
use kiln_core::protocol::{
    FIELD_FRAME, FIELD_FRAME_ID, HEADER_IDEMPOTENCY_KEY, HEADER_WORKER_ID, PATH_HEARTBEAT,
    PATH_PROJECT, PATH_TASKS,
};
use kiln_core::{Error, FrameId, LeaseGrant, RegisterRequest, Result, SubmitReceipt, WorkerId};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// One rendered frame on its way to the coordinator
#[derive(Debug, Clone)]
pub struct Submission {
    pub frame_id: FrameId,

    /// Local file holding the rendered frame
    pub artifact: PathBuf,

    /// Identifies this logical submission across retry attempts
    pub idempotency_key: Uuid,
}

impl Submission {
    /// Prepare a submission with a fresh idempotency key
    pub fn new(frame_id: FrameId, artifact: impl Into<PathBuf>) -> Self {
        Self {
            frame_id,
            artifact: artifact.into(),
            idempotency_key: Uuid::new_v4(),
        }
    }
}

/// Calls a worker makes against its coordinator
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Download the project file
    async fn fetch_project(&self) -> Result<Vec<u8>>;

    /// Lease `count` frames and obtain a worker identity.
    ///
    /// `Ok(None)` means the coordinator has no frames left to hand out.
    async fn register(&self, count: u32) -> Result<Option<LeaseGrant>>;

    /// Extend the lease held by `worker_id`
    async fn heartbeat(&self, worker_id: &WorkerId) -> Result<()>;

    /// Upload a rendered frame and receive replacement frames
    async fn submit(&self, worker_id: &WorkerId, submission: &Submission) -> Result<SubmitReceipt>;
}

/// Download the project into `destination`, creating parent directories
pub async fn fetch_project_to(coordinator: &dyn Coordinator, destination: &Path) -> Result<u64> {
    let bytes = coordinator.fetch_project().await?;

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(destination, &bytes).await?;

    info!(
        "Fetched project ({} bytes) into {}",
        bytes.len(),
        destination.display()
    );
    Ok(bytes.len() as u64)
}

/// HTTP implementation of [`Coordinator`]
#[derive(Debug, Clone)]
pub struct HttpCoordinator {
    client: Client,
    base_url: String,
    upload_timeout: Duration,
}

impl HttpCoordinator {
    /// Build a client with the configured timeouts
    pub fn new(config: &CoordinatorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("kiln-worker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            upload_timeout: config.upload_timeout(),
        })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    async fn fetch_project(&self) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.url(PATH_PROJECT))
            .send()
            .await
            .map_err(|e| transport_error("fetch_project", e))?;

        let response = ensure_success("fetch_project", response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error("fetch_project", e))?;

        Ok(bytes.to_vec())
    }

    async fn register(&self, count: u32) -> Result<Option<LeaseGrant>> {
        let response = self
            .client
            .post(self.url(PATH_TASKS))
            .json(&RegisterRequest { count })
            .send()
            .await
            .map_err(|e| transport_error("register", e))?;

        if response.status() == StatusCode::CONFLICT {
            debug!("Coordinator has no frames to lease");
            return Ok(None);
        }

        let response = ensure_success("register", response).await?;
        let grant: LeaseGrant = decode("register", response).await?;
        Ok(Some(grant))
    }

    async fn heartbeat(&self, worker_id: &WorkerId) -> Result<()> {
        let response = self
            .client
            .post(self.url(PATH_HEARTBEAT))
            .header(HEADER_WORKER_ID, worker_id.as_str())
            .send()
            .await
            .map_err(|e| transport_error("heartbeat", e))?;

        ensure_success("heartbeat", response).await?;
        Ok(())
    }

    async fn submit(&self, worker_id: &WorkerId, submission: &Submission) -> Result<SubmitReceipt> {
        let bytes = tokio::fs::read(&submission.artifact).await?;
        let file_name = submission
            .artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| submission.frame_id.to_string());

        let form = Form::new()
            .text(FIELD_FRAME_ID, submission.frame_id.to_string())
            .part(FIELD_FRAME, Part::bytes(bytes).file_name(file_name));

        let response = self
            .client
            .put(self.url(PATH_TASKS))
            .header(HEADER_WORKER_ID, worker_id.as_str())
            .header(
                HEADER_IDEMPOTENCY_KEY,
                submission.idempotency_key.to_string(),
            )
            .timeout(self.upload_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error("submit", e))?;

        // The coordinator answers 409 once it has nothing left to grant.
        if response.status() == StatusCode::CONFLICT {
            return Ok(SubmitReceipt::exhausted(worker_id.clone()));
        }

        let response = ensure_success("submit", response).await?;
        decode("submit", response).await
    }
}

/// Sort a reqwest failure into timeout, connection or generic transport error
fn transport_error(operation: &'static str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{}: {}", operation, err))
    } else if err.is_connect() {
        Error::Connection(format!("{}: {}", operation, err))
    } else if err.is_decode() {
        Error::Deserialization(format!("{}: {}", operation, err))
    } else {
        Error::Transport(format!("{}: {}", operation, err))
    }
}

async fn ensure_success(operation: &'static str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::Status {
        operation,
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: serde::de::DeserializeOwned>(
    operation: &'static str,
    response: Response,
) -> Result<T> {
    let body = response
        .bytes()
        .await
        .map_err(|e| transport_error(operation, e))?;

    serde_json::from_slice(&body).map_err(|e| {
        Error::Deserialization(format!("{}: malformed response: {}", operation, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn coordinator_for(server: &Server) -> HttpCoordinator {
        let config = CoordinatorConfig {
            url: format!("{}/", server.url()),
            request_timeout_secs: 5,
            connect_timeout_secs: 1,
            upload_timeout_secs: 5,
        };
        HttpCoordinator::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_register_parses_grant() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/tasks")
            .match_body(Matcher::Json(serde_json::json!({ "count": 1 })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"worker_id": "w1", "lease_time": 300, "frames": [5]}"#)
            .create_async()
            .await;

        let coordinator = coordinator_for(&server);
        let grant = coordinator.register(1).await.unwrap().unwrap();

        assert_eq!(grant.worker_id, WorkerId::from("w1"));
        assert_eq!(grant.lease_time, 300);
        assert_eq!(grant.frames, vec![FrameId(5)]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_register_conflict_means_no_work() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/tasks")
            .with_status(409)
            .create_async()
            .await;

        let coordinator = coordinator_for(&server);
        assert!(coordinator.register(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_malformed_body_is_not_retryable() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/tasks")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let coordinator = coordinator_for(&server);
        let err = coordinator.register(1).await.unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_heartbeat_sends_worker_id_header() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/workers/alive")
            .match_header(HEADER_WORKER_ID, "w1")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let coordinator = coordinator_for(&server);
        coordinator.heartbeat(&WorkerId::from("w1")).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_heartbeat_server_error_is_retryable() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/workers/alive")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let coordinator = coordinator_for(&server);
        let err = coordinator.heartbeat(&WorkerId::from("w1")).await.unwrap_err();
        assert!(matches!(err, Error::Status { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_submit_uploads_artifact_with_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("frame_00005.png");
        std::fs::write(&artifact, b"PNGDATA").unwrap();

        let submission = Submission::new(FrameId(5), &artifact);
        let key = submission.idempotency_key.to_string();

        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/tasks")
            .match_header(HEADER_WORKER_ID, "w1")
            .match_header(HEADER_IDEMPOTENCY_KEY, key.as_str())
            .match_header(
                "content-type",
                Matcher::Regex("multipart/form-data".to_string()),
            )
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"name="frame_id""#.to_string()),
                Matcher::Regex("PNGDATA".to_string()),
            ]))
            .with_status(200)
            .with_body(r#"{"worker_id": "w1", "frames": [6]}"#)
            .create_async()
            .await;

        let coordinator = coordinator_for(&server);
        let receipt = coordinator
            .submit(&WorkerId::from("w1"), &submission)
            .await
            .unwrap();

        assert_eq!(receipt.worker_id, WorkerId::from("w1"));
        assert_eq!(receipt.frames, vec![FrameId(6)]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_submit_conflict_is_exhausted_receipt() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("frame_00005.png");
        std::fs::write(&artifact, b"PNGDATA").unwrap();

        let mut server = Server::new_async().await;
        let _mock = server
            .mock("PUT", "/tasks")
            .with_status(409)
            .create_async()
            .await;

        let coordinator = coordinator_for(&server);
        let receipt = coordinator
            .submit(&WorkerId::from("w1"), &Submission::new(FrameId(5), &artifact))
            .await
            .unwrap();

        assert!(receipt.is_exhausted());
        assert_eq!(receipt.worker_id, WorkerId::from("w1"));
    }

    #[tokio::test]
    async fn test_submit_rejected_credentials_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("frame_00005.png");
        std::fs::write(&artifact, b"PNGDATA").unwrap();

        let mut server = Server::new_async().await;
        let _mock = server
            .mock("PUT", "/tasks")
            .with_status(401)
            .create_async()
            .await;

        let coordinator = coordinator_for(&server);
        let err = coordinator
            .submit(&WorkerId::from("w1"), &Submission::new(FrameId(5), &artifact))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Status { status: 401, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_project_to_writes_file() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/frames")
            .with_status(200)
            .with_body(b"BLENDER-v400".as_slice())
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("work").join("project.blend");

        let coordinator = coordinator_for(&server);
        let written = fetch_project_to(&coordinator, &destination).await.unwrap();

        assert_eq!(written, 12);
        assert_eq!(std::fs::read(&destination).unwrap(), b"BLENDER-v400");
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_is_connection_error() {
        let config = CoordinatorConfig {
            url: "http://127.0.0.1:1".to_string(),
            request_timeout_secs: 2,
            connect_timeout_secs: 1,
            upload_timeout_secs: 2,
        };
        let coordinator = HttpCoordinator::new(&config).unwrap();

        let err = coordinator.register(1).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {:?}", err);
    }
}
