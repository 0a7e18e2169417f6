//! HTTP implementations of the remote sources

use super::decompression::{gunzip_file, is_gzip_url};
use super::{BoundarySource, BulkDump, BulkSource, FeedBatch, NoteFeed};
use crate::config::{BulkConfig, FeedConfig, VerifyConfig};
use crate::error::{join_error, status_error, Result, SyncError};
use crate::models::{Coordinates, NoteRecord, RegionBoundary, Watermark};
use crate::retry::partial_path;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use geonotes_common::checksum::{sha256_file, verify_sha256_file};
use reqwest::header::{HeaderMap, LAST_MODIFIED};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Header carrying the dump's snapshot time (RFC 3339)
pub const SNAPSHOT_HEADER: &str = "x-snapshot-time";

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("geonotes-sync/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

#[derive(Deserialize)]
struct FeedResponse {
    notes: Vec<NoteRecord>,
}

pub struct HttpNoteFeed {
    client: reqwest::Client,
    url: String,
}

impl HttpNoteFeed {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.request_timeout())?,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl NoteFeed for HttpNoteFeed {
    async fn fetch_since(&self, since: Option<Watermark>, limit: usize) -> Result<FeedBatch> {
        let mut request = self.client.get(&self.url).query(&[("limit", limit.to_string())]);
        if let Some(since) = since {
            request = request.query(&[("since", since.0.to_rfc3339())]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "notes feed"));
        }

        let body: FeedResponse = response.json().await?;
        for note in &body.notes {
            Coordinates::new(note.location.lat, note.location.lon).map_err(|e| {
                SyncError::DataValidation(format!("feed note {}: {e}", note.id))
            })?;
        }
        debug!(count = body.notes.len(), "Fetched feed batch");
        Ok(FeedBatch::from_notes(body.notes))
    }
}

pub struct HttpBulkSource {
    client: reqwest::Client,
    dump_url: String,
    checksum_url: Option<String>,
}

impl HttpBulkSource {
    pub fn new(config: &BulkConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            dump_url: config.dump_url.clone(),
            checksum_url: config.checksum_url.clone(),
        })
    }

    async fn expected_checksum(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "dump checksum"));
        }
        let body = response.text().await?;
        body.split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| SyncError::DataValidation(format!("empty checksum file at {url}")))
    }

    async fn fetch_into(&self, response: reqwest::Response, raw: &Path, dest: &Path) -> Result<()> {
        let mut file = tokio::fs::File::create(raw).await?;
        let mut stream = response.bytes_stream();
        let mut bytes: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        debug!(path = %raw.display(), bytes, "Dump downloaded");

        if let Some(url) = &self.checksum_url {
            let expected = self.expected_checksum(url).await?;
            let raw_path = raw.to_path_buf();
            tokio::task::spawn_blocking(move || verify_sha256_file(&raw_path, &expected))
                .await
                .map_err(join_error)??;
        }

        if is_gzip_url(&self.dump_url) {
            let partial = partial_path(dest);
            let (src, out) = (raw.to_path_buf(), partial.clone());
            tokio::task::spawn_blocking(move || gunzip_file(&src, &out))
                .await
                .map_err(join_error)??;
            tokio::fs::remove_file(raw).await?;
            tokio::fs::rename(&partial, dest).await?;
        } else {
            tokio::fs::rename(raw, dest).await?;
        }
        Ok(())
    }
}

fn compressed_partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".gz.partial");
    PathBuf::from(name)
}

/// Snapshot time from the explicit header, falling back to `Last-Modified`
fn snapshot_marker(headers: &HeaderMap) -> Option<Watermark> {
    fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        headers.get(name).and_then(|v| v.to_str().ok())
    }
    header(headers, SNAPSHOT_HEADER)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .or_else(|| {
            header(headers, LAST_MODIFIED.as_str())
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        })
        .map(|t| Watermark(t.with_timezone(&Utc)))
}

#[async_trait]
impl BulkSource for HttpBulkSource {
    async fn download(&self, dest: &Path) -> Result<BulkDump> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self.client.get(&self.dump_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "bulk dump"));
        }
        let marker = snapshot_marker(response.headers());

        let raw = if is_gzip_url(&self.dump_url) {
            compressed_partial_path(dest)
        } else {
            partial_path(dest)
        };
        if let Err(e) = self.fetch_into(response, &raw, dest).await {
            let _ = tokio::fs::remove_file(&raw).await;
            return Err(e);
        }

        let path = dest.to_path_buf();
        let sha256 = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(join_error)??;

        info!(path = %dest.display(), sha256 = %sha256, marker = ?marker, "Bulk dump ready");
        Ok(BulkDump {
            path: dest.to_path_buf(),
            marker,
            sha256,
        })
    }
}

pub struct HttpBoundarySource {
    client: reqwest::Client,
    url: String,
}

impl HttpBoundarySource {
    pub fn new(config: &VerifyConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: config.boundaries_url.clone(),
        })
    }
}

#[async_trait]
impl BoundarySource for HttpBoundarySource {
    async fn fetch_boundaries(&self) -> Result<Vec<RegionBoundary>> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "boundary service"));
        }
        Ok(response.json().await?)
    }
}
