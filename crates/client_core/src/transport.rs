//! HTTP side of the compute service: endpoint layout and the reqwest client.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use reqwest::{
    header::CONTENT_DISPOSITION,
    multipart::{Form, Part},
    Client,
};
use shared::{
    error::{ApiException, ErrorBody},
    protocol::{
        HealthResponse, CALCULATE_PATH, DOWNLOAD_PATH, FORM_FIELD_FILE,
        ENGINE_IO_VERSION, FORM_FIELD_TARGET_ADDRESS, HEALTH_PATH, SAMPLE_PATH,
    },
};
use tracing::debug;
use url::Url;

use crate::{config::ClientSettings, types::CalculationUpload};

/// Raw answer of `POST /api/calculate`; interpretation belongs to the controller.
#[derive(Debug, Clone)]
pub struct ComputeReply {
    pub status: u16,
    pub content_disposition: Option<String>,
    pub body: Bytes,
}

impl ComputeReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait ComputeService: Send + Sync {
    async fn calculate(&self, upload: CalculationUpload) -> Result<ComputeReply>;
}

/// URL layout of the compute server.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: Url,
    ws_path: String,
}

impl Endpoints {
    pub fn new(base: Url, ws_path: impl Into<String>) -> Self {
        Self {
            base,
            ws_path: ws_path.into(),
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self> {
        Ok(Self::new(settings.base_url()?, settings.ws_path.clone()))
    }

    fn with_path(&self, path: &str, tail: Option<&str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(path.split('/').filter(|s| !s.is_empty()));
            if let Some(tail) = tail {
                segments.push(tail);
            } else if path.len() > 1 && path.ends_with('/') {
                segments.push("");
            }
        }
        url
    }

    pub fn calculate(&self) -> Url {
        self.with_path(CALCULATE_PATH, None)
    }

    /// `GET /api/download/{filename}`, the filename encoded as a single segment.
    pub fn download(&self, filename: &str) -> Url {
        self.with_path(DOWNLOAD_PATH, Some(filename))
    }

    pub fn sample(&self) -> Url {
        self.with_path(SAMPLE_PATH, None)
    }

    pub fn health(&self) -> Url {
        self.with_path(HEALTH_PATH, None)
    }

    /// Socket.IO endpoint with the websocket transport selected up front.
    pub fn websocket(&self) -> Result<String> {
        let mut url = self.with_path(&self.ws_path, None);
        url.query_pairs_mut()
            .append_pair("EIO", ENGINE_IO_VERSION)
            .append_pair("transport", "websocket");
        let http_url = url.to_string();
        if http_url.starts_with("https://") {
            Ok(http_url.replacen("https://", "wss://", 1))
        } else if http_url.starts_with("http://") {
            Ok(http_url.replacen("http://", "ws://", 1))
        } else {
            Err(anyhow!("server_url must start with http:// or https://"))
        }
    }
}

pub struct HttpComputeService {
    http: Client,
    endpoints: Endpoints,
}

impl HttpComputeService {
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            http: Client::new(),
            endpoints,
        }
    }

    /// Uses a caller-built client, e.g. one with custom proxy or TLS setup.
    pub fn with_client(http: Client, endpoints: Endpoints) -> Self {
        Self { http, endpoints }
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = settings.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("failed to build http client")?;
        Ok(Self {
            http,
            endpoints: Endpoints::from_settings(settings)?,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Fetches any URL the controller navigated to.
    pub async fn fetch(&self, url: &str) -> Result<Bytes> {
        let url = Url::parse(url).with_context(|| format!("invalid url '{url}'"))?;
        self.get_bytes(url).await
    }

    pub async fn download(&self, filename: &str) -> Result<Bytes> {
        self.get_bytes(self.endpoints.download(filename)).await
    }

    pub async fn sample(&self) -> Result<Bytes> {
        self.get_bytes(self.endpoints.sample()).await
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let url = self.endpoints.health();
        self.http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?
            .error_for_status()?
            .json()
            .await
            .context("malformed health response")
    }

    async fn get_bytes(&self, url: Url) -> Result<Bytes> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            let message = ErrorBody::message_from_bytes(&body)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            return Err(ApiException::new(status.as_u16(), message).into());
        }
        Ok(body)
    }
}

#[async_trait]
impl ComputeService for HttpComputeService {
    async fn calculate(&self, upload: CalculationUpload) -> Result<ComputeReply> {
        let CalculationUpload {
            target_address,
            file,
        } = upload;
        let mut part = Part::bytes(file.content.to_vec()).file_name(file.filename.clone());
        if let Some(mime) = &file.mime_type {
            part = part
                .mime_str(mime)
                .with_context(|| format!("invalid mime type '{mime}'"))?;
        }
        let form = Form::new()
            .part(FORM_FIELD_FILE, part)
            .text(FORM_FIELD_TARGET_ADDRESS, target_address);

        let url = self.endpoints.calculate();
        debug!(%url, filename = %file.filename, "posting calculation");
        let response = self
            .http
            .post(url.clone())
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;

        let status = response.status().as_u16();
        let content_disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .context("failed to read compute response body")?;
        Ok(ComputeReply {
            status,
            content_disposition,
            body,
        })
    }
}

/// Extracts the filename of a `content-disposition` header.
///
/// `filename*=UTF-8''...` wins over a plain `filename=`.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    for param in header.split(';').map(str::trim) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        if key == "filename*" {
            let encoded = value
                .split_once("''")
                .map(|(_, rest)| rest)
                .unwrap_or(value);
            if let Ok(decoded) = percent_decode_str(encoded).decode_utf8() {
                let decoded = decoded.trim_matches('"').to_string();
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
        } else if key == "filename" {
            let unquoted = value.trim_matches('"').to_string();
            if !unquoted.is_empty() {
                plain = Some(unquoted);
            }
        }
    }
    plain
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
