//! Google Drive backend
//!
//! Authenticates with service-account credentials: an RS256-signed JWT is
//! exchanged for a bearer token, cached until shortly before expiry. Target
//! folders are resolved (and created) under the configured `folder_id` once
//! per call and cached. Uploads use the resumable-upload protocol; listing
//! pages through `files.list` until exhausted or the limit is reached.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;

use super::StorageAdapter;
use crate::error::{Error, Result};
use crate::models::{ArtifactInfo, GoogleDriveConfig, Secrets, StoredArtifact};

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD: &str = "https://www.googleapis.com/upload/drive/v3";
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, serde::Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(rename = "createdTime")]
    created_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug)]
pub struct GoogleDriveBackend {
    cfg: GoogleDriveConfig,
    key: ServiceAccountKey,
    client: reqwest::Client,
    api_base: String,
    upload_base: String,
    token: Mutex<Option<(String, Instant)>>,
    folder_cache: Mutex<HashMap<String, String>>,
}

impl GoogleDriveBackend {
    pub fn new(cfg: GoogleDriveConfig, secrets: Secrets) -> Result<Self> {
        let raw = secrets.service_account_json.ok_or_else(|| {
            Error::Validation(
                "google_drive destination needs a service_account_json secret".into(),
            )
        })?;
        let key: ServiceAccountKey = serde_json::from_str(&raw)
            .map_err(|e| Error::Validation(format!("invalid service account JSON: {}", e)))?;

        Ok(Self {
            cfg,
            key,
            client: reqwest::Client::new(),
            api_base: DRIVE_API.to_string(),
            upload_base: DRIVE_UPLOAD.to_string(),
            token: Mutex::new(None),
            folder_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Point the backend at a stand-in Drive API (tests).
    #[cfg(test)]
    fn with_base_urls(mut self, api_base: &str, upload_base: &str) -> Self {
        self.api_base = api_base.to_string();
        self.upload_base = upload_base.to_string();
        self
    }

    /// Bearer token, refreshed when less than a minute of validity remains.
    async fn token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if *expires_at > Instant::now() + Duration::from_secs(60) {
                return Ok(token.clone());
            }
        }

        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &self.key.client_email,
            scope: DRIVE_SCOPE,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let signing_key = jsonwebtoken::EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| Error::Permanent(format!("service account private key: {}", e)))?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &signing_key,
        )
        .map_err(|e| Error::Permanent(format!("assertion signing failed: {}", e)))?;

        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;
        let response = check_status(response, "token exchange").await?;
        let token: TokenResponse = response.json().await?;

        let expires_at = Instant::now() + Duration::from_secs(token.expires_in);
        *cached = Some((token.access_token.clone(), expires_at));
        Ok(token.access_token)
    }

    /// Resolve (or create) the per-target folder under the configured root.
    async fn ensure_folder(&self, name: &str) -> Result<String> {
        {
            let cache = self.folder_cache.lock().await;
            if let Some(id) = cache.get(name) {
                return Ok(id.clone());
            }
        }

        let token = self.token().await?;
        let query = format!(
            "'{}' in parents and name = '{}' and mimeType = '{}' and trashed = false",
            self.cfg.folder_id, name, FOLDER_MIME
        );
        let response = self
            .client
            .get(format!("{}/files", self.api_base))
            .bearer_auth(&token)
            .query(&[("q", query.as_str()), ("fields", "files(id,name)")])
            .send()
            .await?;
        let listing: FileList = check_status(response, "folder lookup").await?.json().await?;

        let id = match listing.files.into_iter().next() {
            Some(folder) => folder.id,
            None => {
                let response = self
                    .client
                    .post(format!("{}/files", self.api_base))
                    .bearer_auth(&token)
                    .json(&serde_json::json!({
                        "name": name,
                        "mimeType": FOLDER_MIME,
                        "parents": [self.cfg.folder_id],
                    }))
                    .send()
                    .await?;
                let created: DriveFile =
                    check_status(response, "folder create").await?.json().await?;
                created.id
            }
        };

        self.folder_cache
            .lock()
            .await
            .insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn list_folder(
        &self,
        folder_id: &str,
        limit: Option<usize>,
        out: &mut Vec<ArtifactInfo>,
    ) -> Result<()> {
        let token = self.token().await?;
        let query = format!("'{}' in parents and trashed = false", folder_id);
        let page_size = PAGE_SIZE.to_string();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(format!("{}/files", self.api_base))
                .bearer_auth(&token)
                .query(&[
                    ("q", query.as_str()),
                    (
                        "fields",
                        "nextPageToken,files(id,name,size,createdTime,mimeType)",
                    ),
                    ("pageSize", page_size.as_str()),
                ]);
            if let Some(tok) = &page_token {
                request = request.query(&[("pageToken", tok.as_str())]);
            }
            let listing: FileList = check_status(request.send().await?, "list")
                .await?
                .json()
                .await?;

            for file in listing.files {
                out.push(ArtifactInfo {
                    id: file.id,
                    name: file.name,
                    size: file.size.and_then(|s| s.parse().ok()).unwrap_or(0),
                    created_at: file.created_time.unwrap_or_else(Utc::now),
                });
            }
            if let Some(limit) = limit {
                if out.len() >= limit {
                    return Ok(());
                }
            }
            match listing.next_page_token {
                Some(tok) => page_token = Some(tok),
                None => return Ok(()),
            }
        }
    }

    /// Sub-folders of the root (one per target).
    async fn list_subfolders(&self) -> Result<Vec<DriveFile>> {
        let token = self.token().await?;
        let query = format!(
            "'{}' in parents and mimeType = '{}' and trashed = false",
            self.cfg.folder_id, FOLDER_MIME
        );
        let response = self
            .client
            .get(format!("{}/files", self.api_base))
            .bearer_auth(&token)
            .query(&[("q", query.as_str()), ("fields", "files(id,name)")])
            .send()
            .await?;
        let listing: FileList = check_status(response, "folder list").await?.json().await?;
        Ok(listing.files)
    }
}

/// Map Drive HTTP statuses onto the transient/permanent split.
async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let tail: String = body.chars().take(300).collect();
    if status.as_u16() == 429 || status.is_server_error() {
        Err(Error::Transient(format!("drive {}: {} {}", what, status, tail)))
    } else if status.as_u16() == 404 {
        Err(Error::Permanent(format!("drive {}: not found", what)))
    } else {
        Err(Error::Permanent(format!(
            "drive {}: {} {}",
            what, status, tail
        )))
    }
}

#[async_trait]
impl StorageAdapter for GoogleDriveBackend {
    fn kind(&self) -> &'static str {
        "google_drive"
    }

    async fn put(&self, key: &str, source: &Path, size: u64) -> Result<StoredArtifact> {
        let (folder, name) = key
            .split_once('/')
            .ok_or_else(|| Error::Internal(format!("malformed artifact key: {}", key)))?;
        let folder_id = self.ensure_folder(folder).await?;
        let token = self.token().await?;

        // Initiate a resumable session, then stream the body in one shot
        let response = self
            .client
            .post(format!("{}/files?uploadType=resumable", self.upload_base))
            .bearer_auth(&token)
            .header("X-Upload-Content-Length", size)
            .json(&serde_json::json!({
                "name": name,
                "parents": [folder_id],
            }))
            .send()
            .await?;
        let response = check_status(response, "upload init").await?;
        let session_uri = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Transient("upload init returned no session URI".into()))?
            .to_string();

        let file = tokio::fs::File::open(source).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .client
            .put(&session_uri)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await?;
        let uploaded: DriveFile = check_status(response, "upload").await?.json().await?;

        Ok(StoredArtifact {
            created_at: uploaded.created_time.unwrap_or_else(Utc::now),
            backup_id: uploaded.id,
        })
    }

    async fn list(&self, prefix: Option<&str>, limit: Option<usize>) -> Result<Vec<ArtifactInfo>> {
        let mut artifacts = Vec::new();
        match prefix {
            Some(folder) => {
                // A folder that was never created has no artifacts
                let cache_hit = self.folder_cache.lock().await.get(folder).cloned();
                let folder_id = match cache_hit {
                    Some(id) => Some(id),
                    None => self
                        .list_subfolders()
                        .await?
                        .into_iter()
                        .find(|f| f.name == folder)
                        .map(|f| f.id),
                };
                if let Some(folder_id) = folder_id {
                    self.list_folder(&folder_id, limit, &mut artifacts).await?;
                }
            }
            None => {
                for folder in self.list_subfolders().await? {
                    self.list_folder(&folder.id, limit, &mut artifacts).await?;
                    if let Some(limit) = limit {
                        if artifacts.len() >= limit {
                            break;
                        }
                    }
                }
            }
        }

        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.name.cmp(&a.name)));
        if let Some(limit) = limit {
            artifacts.truncate(limit);
        }
        Ok(artifacts)
    }

    async fn get(&self, backup_id: &str, _name: &str, dest: &Path) -> Result<()> {
        let token = self.token().await?;
        let response = self
            .client
            .get(format!("{}/files/{}?alt=media", self.api_base, backup_id))
            .bearer_auth(&token)
            .send()
            .await?;
        let mut response = check_status(response, "download").await?;

        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response.chunk().await? {
            tokio::io::copy(&mut chunk.as_ref(), &mut file).await?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(())
    }

    async fn delete(&self, backup_id: &str, _name: &str) -> Result<()> {
        let token = self.token().await?;
        let response = self
            .client
            .delete(format!("{}/files/{}", self.api_base, backup_id))
            .bearer_auth(&token)
            .send()
            .await?;
        check_status(response, "delete").await?;
        Ok(())
    }

    async fn test_connection(&self) -> Result<String> {
        let token = self.token().await?;
        let response = self
            .client
            .get(format!("{}/files/{}", self.api_base, self.cfg.folder_id))
            .bearer_auth(&token)
            .query(&[("fields", "id,name")])
            .send()
            .await?;
        let folder: DriveFile = check_status(response, "probe").await?.json().await?;
        Ok(format!("connected: folder '{}'", folder.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_service_account_json() {
        let err = GoogleDriveBackend::new(
            GoogleDriveConfig {
                folder_id: "root123".into(),
            },
            Secrets::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind().code(), "VALIDATION");
    }

    #[test]
    fn test_rejects_malformed_credentials() {
        let err = GoogleDriveBackend::new(
            GoogleDriveConfig {
                folder_id: "root123".into(),
            },
            Secrets {
                service_account_json: Some("{not json".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind().code(), "VALIDATION");
    }

    #[test]
    fn test_token_uri_defaults() {
        let key: ServiceAccountKey = serde_json::from_str(
            r#"{"client_email": "svc@project.iam.gserviceaccount.com", "private_key": "pem"}"#,
        )
        .unwrap();
        assert_eq!(key.token_uri, "https://oauth2.googleapis.com/token");
    }

    #[test]
    fn test_drive_size_is_a_string() {
        // files.list serializes sizes as strings
        let file: DriveFile = serde_json::from_str(
            r#"{"id": "f1", "name": "backup_app_20250301_033000.sql", "size": "1048576",
                "createdTime": "2025-03-01T03:30:02.000Z"}"#,
        )
        .unwrap();
        assert_eq!(file.size.as_deref().and_then(|s| s.parse::<u64>().ok()), Some(1048576));
    }

    // ------------------------------------------------------------------
    // Wire-level tests against a stand-in Drive API
    // ------------------------------------------------------------------

    mod wire {
        use super::super::*;
        use crate::models::{GoogleDriveConfig, Secrets};

        use std::collections::HashMap as QueryMap;
        use std::sync::{Arc, Mutex as StdMutex, OnceLock};

        use axum::body::Bytes;
        use axum::extract::{Path as UrlPath, Query, State};
        use axum::http::{header, StatusCode};
        use axum::response::{IntoResponse, Response};
        use axum::routing::{get, post, put};
        use axum::{Json, Router};

        #[derive(Default)]
        struct MockState {
            base: String,
            token_hits: usize,
            token_expires_in: u64,
            /// When set, every Drive endpoint answers with this status.
            fail_with: Option<u16>,
            files_page_hits: usize,
            uploaded: Vec<u8>,
            deleted: Vec<String>,
        }

        type Shared = Arc<StdMutex<MockState>>;

        /// One throwaway RSA key for the whole test binary; generation is the
        /// slow part.
        fn test_key_pem() -> &'static str {
            static PEM: OnceLock<String> = OnceLock::new();
            PEM.get_or_init(|| {
                use rsa::pkcs8::EncodePrivateKey;
                let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
                    .expect("test key generation");
                key.to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
                    .expect("test key encoding")
                    .to_string()
            })
        }

        async fn token_endpoint(State(state): State<Shared>) -> Json<serde_json::Value> {
            let mut state = state.lock().unwrap();
            state.token_hits += 1;
            Json(serde_json::json!({
                "access_token": format!("tok-{}", state.token_hits),
                "expires_in": state.token_expires_in,
            }))
        }

        fn failure(code: u16) -> Response {
            (
                StatusCode::from_u16(code).unwrap(),
                Json(serde_json::json!({"error": {"message": "mock failure"}})),
            )
                .into_response()
        }

        async fn files_list(
            State(state): State<Shared>,
            Query(params): Query<QueryMap<String, String>>,
        ) -> Response {
            let q = params.get("q").cloned().unwrap_or_default();
            let mut state = state.lock().unwrap();
            if let Some(code) = state.fail_with {
                return failure(code);
            }

            // Folder queries carry the folder mime type; artifact listings
            // never do
            if q.contains(FOLDER_MIME) {
                return Json(serde_json::json!({
                    "files": [{"id": "folder-app", "name": "app"}]
                }))
                .into_response();
            }

            if params.contains_key("pageToken") {
                return Json(serde_json::json!({
                    "files": [{
                        "id": "file-3",
                        "name": "backup_app_20250301_033000.sql.gz",
                        "size": "512",
                        "createdTime": "2025-03-01T03:30:05.000Z"
                    }]
                }))
                .into_response();
            }

            state.files_page_hits += 1;
            Json(serde_json::json!({
                "files": [
                    {
                        "id": "file-1",
                        "name": "backup_app_20250303_033000.sql.gz",
                        "size": "2048",
                        "createdTime": "2025-03-03T03:30:05.000Z"
                    },
                    {
                        "id": "file-2",
                        "name": "backup_app_20250302_033000.sql.gz",
                        "size": "1024",
                        "createdTime": "2025-03-02T03:30:05.000Z"
                    }
                ],
                "nextPageToken": "page-2"
            }))
            .into_response()
        }

        async fn files_create(State(_state): State<Shared>) -> Json<serde_json::Value> {
            Json(serde_json::json!({"id": "folder-created", "name": "app"}))
        }

        async fn file_by_id(
            State(state): State<Shared>,
            UrlPath(id): UrlPath<String>,
            Query(params): Query<QueryMap<String, String>>,
        ) -> Response {
            if let Some(code) = state.lock().unwrap().fail_with {
                return failure(code);
            }
            if params.get("alt").map(String::as_str) == Some("media") {
                return Bytes::from_static(b"artifact-bytes").into_response();
            }
            Json(serde_json::json!({"id": id, "name": "Backups"})).into_response()
        }

        async fn file_delete(State(state): State<Shared>, UrlPath(id): UrlPath<String>) -> Response {
            if id == "missing" {
                return failure(404);
            }
            state.lock().unwrap().deleted.push(id);
            StatusCode::NO_CONTENT.into_response()
        }

        async fn upload_init(State(state): State<Shared>) -> Response {
            let base = state.lock().unwrap().base.clone();
            Response::builder()
                .header(header::LOCATION, format!("{}/upload/session", base))
                .body(axum::body::Body::empty())
                .unwrap()
        }

        async fn upload_put(State(state): State<Shared>, body: Bytes) -> Json<serde_json::Value> {
            state.lock().unwrap().uploaded = body.to_vec();
            Json(serde_json::json!({
                "id": "file-up-1",
                "name": "backup_app_20250304_033000.sql.gz",
                "createdTime": "2025-03-04T03:30:05.000Z"
            }))
        }

        /// Serve the stand-in API on a loopback port; returns its base URL.
        async fn spawn_mock(state: Shared) -> String {
            let app = Router::new()
                .route("/token", post(token_endpoint))
                .route("/drive/files", get(files_list).post(files_create))
                .route("/drive/files/:id", get(file_by_id).delete(file_delete))
                .route("/upload/files", post(upload_init))
                .route("/upload/session", put(upload_put))
                .with_state(state.clone());

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            state.lock().unwrap().base = base.clone();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            base
        }

        async fn mock(token_expires_in: u64) -> (Shared, GoogleDriveBackend) {
            let state: Shared = Arc::new(StdMutex::new(MockState {
                token_expires_in,
                ..Default::default()
            }));
            let base = spawn_mock(state.clone()).await;

            let credentials = serde_json::json!({
                "client_email": "svc@test-project.iam.gserviceaccount.com",
                "private_key": test_key_pem(),
                "token_uri": format!("{}/token", base),
            });
            let backend = GoogleDriveBackend::new(
                GoogleDriveConfig {
                    folder_id: "root-1".into(),
                },
                Secrets {
                    service_account_json: Some(credentials.to_string()),
                    ..Default::default()
                },
            )
            .unwrap()
            .with_base_urls(&format!("{}/drive", base), &format!("{}/upload", base));
            (state, backend)
        }

        #[tokio::test]
        async fn test_token_is_cached_across_calls() {
            let (state, backend) = mock(3600).await;

            backend.test_connection().await.unwrap();
            backend.test_connection().await.unwrap();

            assert_eq!(state.lock().unwrap().token_hits, 1);
        }

        #[tokio::test]
        async fn test_token_refreshes_when_expiring() {
            // expires_in under the 60 s refresh margin forces a new exchange
            let (state, backend) = mock(30).await;

            backend.test_connection().await.unwrap();
            backend.test_connection().await.unwrap();

            assert_eq!(state.lock().unwrap().token_hits, 2);
        }

        #[tokio::test]
        async fn test_list_paginates_until_exhausted() {
            let (state, backend) = mock(3600).await;

            let artifacts = backend.list(Some("app"), None).await.unwrap();
            assert_eq!(artifacts.len(), 3);
            // Newest first, page boundary included
            assert_eq!(artifacts[0].id, "file-1");
            assert_eq!(artifacts[2].id, "file-3");
            assert_eq!(artifacts[1].size, 1024);
            assert_eq!(state.lock().unwrap().files_page_hits, 1);
        }

        #[tokio::test]
        async fn test_list_stops_at_limit() {
            let (_state, backend) = mock(3600).await;

            // The first page already satisfies the limit; page 2 never loads
            let artifacts = backend.list(Some("app"), Some(2)).await.unwrap();
            assert_eq!(artifacts.len(), 2);
            assert_eq!(artifacts[0].id, "file-1");
        }

        #[tokio::test]
        async fn test_put_streams_through_resumable_session() {
            let (state, backend) = mock(3600).await;

            let dir = tempfile::tempdir().unwrap();
            let spool = dir.path().join("spool.gz");
            std::fs::write(&spool, b"compressed artifact").unwrap();

            let stored = backend
                .put("app/backup_app_20250304_033000.sql.gz", &spool, 19)
                .await
                .unwrap();
            assert_eq!(stored.backup_id, "file-up-1");
            assert_eq!(state.lock().unwrap().uploaded, b"compressed artifact");
        }

        #[tokio::test]
        async fn test_get_downloads_media() {
            let (_state, backend) = mock(3600).await;

            let dir = tempfile::tempdir().unwrap();
            let dest = dir.path().join("fetched.gz");
            backend
                .get("file-1", "backup_app_20250303_033000.sql.gz", &dest)
                .await
                .unwrap();
            assert_eq!(std::fs::read(&dest).unwrap(), b"artifact-bytes");
        }

        #[tokio::test]
        async fn test_delete_and_missing_file() {
            let (state, backend) = mock(3600).await;

            backend.delete("file-2", "x").await.unwrap();
            assert_eq!(state.lock().unwrap().deleted, vec!["file-2"]);

            let err = backend.delete("missing", "x").await.unwrap_err();
            assert_eq!(err.kind().code(), "PERMANENT");
        }

        #[tokio::test]
        async fn test_server_errors_are_transient() {
            let (state, backend) = mock(3600).await;
            state.lock().unwrap().fail_with = Some(503);

            let err = backend.test_connection().await.unwrap_err();
            assert!(err.is_transient(), "got {:?}", err);
        }

        #[tokio::test]
        async fn test_auth_rejection_is_permanent() {
            let (state, backend) = mock(3600).await;
            state.lock().unwrap().fail_with = Some(403);

            let err = backend.test_connection().await.unwrap_err();
            assert_eq!(err.kind().code(), "PERMANENT");
        }
    }
}
