//! reqwest-backed [`RemoteVault`].

use std::path::Path;

use async_trait::async_trait;
use futures::TryStreamExt;
use keeper_core::config::ClientConfig;
use keeper_core::{KeeperError, KeeperResult, RemoteRow, UploadsPage};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Method, RequestBuilder, Response, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use crate::remote::{BlobReader, RemoteVault, UploadMeta};

/// Safety stop for servers that keep reporting more rows than they return.
const MAX_PAGES: u32 = 10_000;

#[derive(Serialize)]
struct Credentials<'a> {
    username: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    uuid: String,
}

#[derive(Debug)]
pub struct HttpRemote {
    base: String,
    client: Client,
    token: Option<SecretString>,
}

impl HttpRemote {
    pub fn new(config: &ClientConfig) -> KeeperResult<Self> {
        let base = config.server_address.trim().trim_end_matches('/').to_string();
        Url::parse(&base)
            .map_err(|e| KeeperError::Config(format!("server address {base:?}: {e}")))?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(default_headers)
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            base,
            client,
            token: None,
        })
    }

    /// Attach `Authorization: Bearer <token>` to every request.
    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// Absolute URL for an API path such as `/uploads`.
    pub fn endpoint(&self, path: &str) -> KeeperResult<Url> {
        Url::parse(&format!("{}{}", self.base, path))
            .map_err(|e| KeeperError::Config(format!("endpoint {path}: {e}")))
    }

    fn request(&self, method: Method, path: &str) -> KeeperResult<RequestBuilder> {
        let mut req = self.client.request(method, self.endpoint(path)?);
        if let Some(token) = &self.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| KeeperError::Config(format!("token is not a valid header: {e}")))?;
            value.set_sensitive(true);
            req = req.header(AUTHORIZATION, value);
        }
        Ok(req)
    }

    async fn send(&self, req: RequestBuilder) -> KeeperResult<Response> {
        let response = req.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(KeeperError::Remote {
                status: status.as_u16(),
                body: body.trim().to_string(),
            })
        }
    }

    async fn fetch_page(&self, deleted: bool, since: &str, page: u32) -> KeeperResult<UploadsPage> {
        let page = page.to_string();
        let req = self.request(Method::GET, "/uploads")?.query(&[
            ("deleted", if deleted { "true" } else { "false" }),
            ("uploaded_at", since),
            ("page", page.as_str()),
        ]);
        let response = self.send(req).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| KeeperError::Decode(format!("/uploads: {e}")))
    }
}

#[async_trait]
impl RemoteVault for HttpRemote {
    async fn register(
        &self,
        username: &str,
        password: &SecretString,
        email: &str,
    ) -> KeeperResult<()> {
        let req = self.request(Method::POST, "/register")?.json(&Credentials {
            username,
            password: password.expose_secret(),
            email: Some(email),
        });
        self.send(req).await?;
        debug!(username, "registered");
        Ok(())
    }

    async fn login(&self, username: &str, password: &SecretString) -> KeeperResult<SecretString> {
        let req = self.request(Method::POST, "/login")?.json(&Credentials {
            username,
            password: password.expose_secret(),
            email: None,
        });
        let body: LoginResponse = self
            .send(req)
            .await?
            .json()
            .await
            .map_err(|e| KeeperError::Decode(format!("/login: {e}")))?;
        Ok(SecretString::from(body.token))
    }

    async fn upload(&self, path: &Path, name: &str, meta: &UploadMeta) -> KeeperResult<String> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| KeeperError::io("open upload", path, e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| KeeperError::io("stat upload", path, e))?
            .len();

        let part = Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), len)
            .file_name(name.to_string())
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .part("file", part)
            .text("description", meta.description.clone())
            .text("category", meta.category.clone());

        let req = self.request(Method::POST, "/upload")?.multipart(form);
        let body: UploadResponse = self
            .send(req)
            .await?
            .json()
            .await
            .map_err(|e| KeeperError::Decode(format!("/upload: {e}")))?;
        debug!(name, uuid = %body.uuid, bytes = len, "uploaded");
        Ok(body.uuid)
    }

    async fn download(&self, name: &str) -> KeeperResult<BlobReader> {
        let req = self.request(Method::GET, "/file")?.query(&[("name", name)]);
        let response = self.send(req).await?;
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn delete(&self, name: &str) -> KeeperResult<()> {
        let req = self.request(Method::DELETE, "/delete")?.query(&[("name", name)]);
        self.send(req).await?;
        debug!(name, "deleted remotely");
        Ok(())
    }

    async fn list_uploads(&self, deleted: bool, since: &str) -> KeeperResult<Vec<RemoteRow>> {
        let mut rows = Vec::new();
        let mut page = 1;
        loop {
            let batch = self.fetch_page(deleted, since, page).await?;
            let got = batch.rows.len();
            rows.extend(batch.rows);

            let p = batch.pagination;
            let more = got > 0
                && p.total as usize > rows.len()
                && (p.page == 0 || p.page == page)
                && page < MAX_PAGES;
            if !more {
                break;
            }
            page += 1;
        }
        debug!(deleted, since, rows = rows.len(), pages = page, "listed uploads");
        Ok(rows)
    }
}
