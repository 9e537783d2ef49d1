//! Media payload preparation: base64 decoding, remote download, content
//! type detection and file naming.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::debug;

use crate::error::GatewayError;
use crate::Result;

const OCTET_STREAM: &str = "application/octet-stream";

/// Media bytes ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub data: Vec<u8>,
    pub content_type: String,
    pub file_name: String,
}

/// Where media for an outgoing message comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// Base64 text, optionally a `data:` URI.
    Base64(String),
    /// Remote URL fetched over HTTP(S).
    Url(String),
}

/// Decode base64 media. A `data:` URI prefix is stripped and its media type
/// used when `mime_type` is not given; otherwise the type is sniffed.
pub fn decode_base64(input: &str, mime_type: Option<&str>) -> Result<MediaPayload> {
    let mut body = input.trim();
    let mut declared = mime_type.filter(|m| !m.is_empty()).map(str::to_string);

    if let Some(rest) = body.strip_prefix("data:") {
        let (header, data) = rest
            .split_once(',')
            .ok_or_else(|| GatewayError::InvalidMedia("malformed data URI".into()))?;
        if declared.is_none() {
            let media_type = header.split(';').next().unwrap_or_default();
            if !media_type.is_empty() {
                declared = Some(media_type.to_string());
            }
        }
        body = data;
    }

    let cleaned: String = body
        .replace("\\n", "")
        .replace("\\r", "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return Err(GatewayError::InvalidMedia("empty media payload".into()));
    }

    let data = STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| GatewayError::InvalidMedia(format!("invalid base64: {}", e)))?;
    let content_type = declared.unwrap_or_else(|| sniff_content_type(&data).to_string());
    let file_name = file_name(None, &content_type);

    Ok(MediaPayload {
        data,
        content_type,
        file_name,
    })
}

/// Downloads remote media with a size cap and a deadline.
#[derive(Clone)]
pub struct MediaFetcher {
    client: reqwest::Client,
    max_bytes: usize,
    timeout: Duration,
}

impl MediaFetcher {
    pub fn new(max_bytes: usize, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::MediaDownload(e.to_string()))?;
        Ok(Self {
            client,
            max_bytes,
            timeout,
        })
    }

    /// Fetch `url`. The response `Content-Type` wins over sniffing unless
    /// `mime_type` is given.
    pub async fn fetch(&self, url: &str, mime_type: Option<&str>) -> Result<MediaPayload> {
        tokio::time::timeout(self.timeout, self.fetch_inner(url, mime_type))
            .await
            .map_err(|_| GatewayError::MediaDownload(format!("timed out fetching {}", url)))?
    }

    async fn fetch_inner(&self, url: &str, mime_type: Option<&str>) -> Result<MediaPayload> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| GatewayError::InvalidMedia(format!("invalid media URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(GatewayError::InvalidMedia(format!(
                "unsupported URL scheme: {}",
                parsed.scheme()
            )));
        }

        let mut response = self
            .client
            .get(parsed.clone())
            .send()
            .await
            .map_err(|e| GatewayError::MediaDownload(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::MediaDownload(format!("status {}", status)));
        }

        let header_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let mut data = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| GatewayError::MediaDownload(e.to_string()))?
        {
            if data.len() + chunk.len() > self.max_bytes {
                return Err(GatewayError::InvalidMedia(format!(
                    "media exceeds {} bytes",
                    self.max_bytes
                )));
            }
            data.extend_from_slice(&chunk);
        }
        debug!(url, bytes = data.len(), "media downloaded");

        let content_type = mime_type
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .or(header_type)
            .unwrap_or_else(|| sniff_content_type(&data).to_string());
        let file_name = file_name(url_extension(&parsed).as_deref(), &content_type);

        Ok(MediaPayload {
            data,
            content_type,
            file_name,
        })
    }
}

fn url_extension(url: &reqwest::Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let (stem, ext) = last.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 8 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn file_name(extension: Option<&str>, content_type: &str) -> String {
    match extension.or_else(|| extension_for(content_type)) {
        Some(ext) => format!("media.{}", ext),
        None => "media".to_string(),
    }
}

/// Detect a content type from leading magic bytes.
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    match data {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xff, 0xd8, 0xff, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => "audio/wav",
        [_, _, _, _, b'f', b't', b'y', b'p', ..] => "video/mp4",
        [b'O', b'g', b'g', b'S', ..] => "audio/ogg",
        [b'I', b'D', b'3', ..] | [0xff, 0xfb, ..] => "audio/mpeg",
        [b'%', b'P', b'D', b'F', b'-', ..] => "application/pdf",
        [b'P', b'K', 0x03, 0x04, ..] => "application/zip",
        _ if !data.is_empty() && std::str::from_utf8(data).is_ok() => "text/plain",
        _ => OCTET_STREAM,
    }
}

/// Usual file extension for a content type.
pub fn extension_for(content_type: &str) -> Option<&'static str> {
    let ext = match content_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "video/3gpp" => "3gp",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/wav" => "wav",
        "audio/aac" => "aac",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "text/plain" => "txt",
        "text/csv" => "csv",
        _ => return None,
    };
    Some(ext)
}
