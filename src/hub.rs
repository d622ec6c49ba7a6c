//! Hub REST API client: repository file listings and streaming downloads.
//!
//! Talks HTTPS to the hub host. Metadata comes from the tree endpoint
//! (which includes per-file sizes and LFS SHA-256 digests); file bytes
//! come from the resolve endpoint. Redirects are followed manually so the
//! Authorization header survives hops across authorities, and range
//! requests are honored for future resume support.

use crate::error::{FetchError, Result};
use crate::metadata::FileManifestEntry;
use futures_util::StreamExt;
use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default hub endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Environment variable carrying the Bearer token for authenticated
/// repositories.
pub const TOKEN_ENV_VAR: &str = "HUGGINGFACE_TOKEN";

/// Maximum redirect hops followed per request.
const MAX_REDIRECT_HOPS: usize = 5;

/// Progress callbacks fire at least this often by bytes…
const PROGRESS_BYTE_INTERVAL: u64 = 512 * 1024;

/// …or this often by time, whichever comes first.
const PROGRESS_TIME_INTERVAL: Duration = Duration::from_millis(250);

/// Byte-level progress callback: `(fraction, bytes_downloaded, total_bytes)`.
/// `total_bytes` is 0 when the server did not advertise a length.
pub type ByteProgressFn<'a> = dyn Fn(f64, u64, u64) + Send + Sync + 'a;

/// Client for hub metadata and file downloads.
#[derive(Debug, Clone)]
pub struct HubClient {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TreeEntryWire {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    size: Option<u64>,
    lfs: Option<LfsWire>,
}

#[derive(Debug, Deserialize)]
struct LfsWire {
    // For LFS files the oid is the SHA-256 of the actual content; `size`
    // is the unpacked size (the top-level `size` can be the pointer size).
    oid: Option<String>,
    size: Option<u64>,
}

impl HubClient {
    /// Client against the public hub, with the Bearer token taken from
    /// `HUGGINGFACE_TOKEN` when set.
    #[must_use]
    pub fn from_env() -> Self {
        let token = std::env::var(TOKEN_ENV_VAR)
            .ok()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty());
        Self::build(DEFAULT_ENDPOINT.to_owned(), token)
    }

    /// Client against an explicit endpoint (tests, mirrors).
    #[must_use]
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self::build(endpoint.into(), None)
    }

    /// Replace the Bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn build(endpoint: String, token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            // Redirects are followed manually in `get_following_redirects`
            // so authorization is preserved across authority boundaries.
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            token,
        }
    }

    /// List a repository's files with sizes and SHA-256 digests.
    ///
    /// # Errors
    ///
    /// [`FetchError::NotFound`] for unknown repositories,
    /// [`FetchError::PermissionDenied`] for 401/403, and
    /// [`FetchError::Transient`] for timeouts and server errors.
    pub async fn list_files_detailed(&self, hub_id: &str) -> Result<Vec<FileManifestEntry>> {
        let url = format!(
            "{}/api/models/{hub_id}/tree/main?recursive=true",
            self.endpoint
        );
        debug!(hub_id, url = %url, "listing repository files");

        let resp = self.get_following_redirects(&url).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(self.status_error(status, hub_id));
        }

        let entries: Vec<TreeEntryWire> = resp
            .json()
            .await
            .map_err(|e| FetchError::Transient(format!("tree listing decode failed: {e}")))?;

        let manifest: Vec<FileManifestEntry> = entries
            .into_iter()
            .filter(|e| e.kind == "file")
            .map(|e| {
                let lfs_size = e.lfs.as_ref().and_then(|l| l.size);
                let sha256 = e
                    .lfs
                    .and_then(|l| l.oid)
                    .filter(|oid| oid.len() == 64 && oid.chars().all(|c| c.is_ascii_hexdigit()));
                FileManifestEntry {
                    file_name: e.path,
                    size: lfs_size.or(e.size),
                    sha256,
                }
            })
            .collect();

        info!(hub_id, files = manifest.len(), "repository listing fetched");
        Ok(manifest)
    }

    /// Download one file to `dest`, creating parent directories as needed.
    ///
    /// `progress` is invoked at least every 512 KiB or 250 ms, whichever
    /// comes first, and once more at completion. Returns the number of
    /// bytes written.
    ///
    /// # Errors
    ///
    /// Propagates hub status errors like [`list_files_detailed`], plus
    /// [`FetchError::Cancelled`] when the token fires mid-stream (the
    /// partial file is removed best-effort) and [`FetchError::Io`] for
    /// local write failures.
    ///
    /// [`list_files_detailed`]: HubClient::list_files_detailed
    pub async fn download_file(
        &self,
        hub_id: &str,
        file_name: &str,
        dest: &Path,
        progress: Option<&ByteProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.download_file_from(hub_id, file_name, dest, 0, progress, cancel)
            .await
    }

    /// Like [`download_file`], resuming from `offset` bytes via a range
    /// request. With a non-zero offset the destination is appended to
    /// rather than truncated.
    ///
    /// # Errors
    ///
    /// See [`download_file`].
    ///
    /// [`download_file`]: HubClient::download_file
    pub async fn download_file_from(
        &self,
        hub_id: &str,
        file_name: &str,
        dest: &Path,
        offset: u64,
        progress: Option<&ByteProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let url = format!(
            "{}/{hub_id}/resolve/main/{}",
            self.endpoint,
            encode_file_path(file_name)
        );
        debug!(hub_id, file_name, url = %url, offset, "downloading file");

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let range = (offset > 0).then(|| format!("bytes={offset}-"));
        let resp = self.get_with_range(&url, range.as_deref()).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(self.status_error(status, &format!("{hub_id}/{file_name}")));
        }

        let total_bytes = resp.content_length().unwrap_or(0);
        let mut file = if offset > 0 {
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dest)
                .await?
        } else {
            tokio::fs::File::create(dest).await?
        };

        let mut stream = resp.bytes_stream();
        let mut bytes_downloaded: u64 = 0;
        let mut bytes_since_emit: u64 = 0;
        let mut last_emit = Instant::now();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                warn!(hub_id, file_name, "download cancelled; partial file removed");
                return Err(FetchError::Cancelled);
            }

            let chunk =
                chunk.map_err(|e| FetchError::Transient(format!("stream read failed: {e}")))?;
            file.write_all(&chunk).await?;
            bytes_downloaded += chunk.len() as u64;
            bytes_since_emit += chunk.len() as u64;

            let due = bytes_since_emit >= PROGRESS_BYTE_INTERVAL
                || last_emit.elapsed() >= PROGRESS_TIME_INTERVAL;
            if due {
                emit(progress, bytes_downloaded, total_bytes);
                bytes_since_emit = 0;
                last_emit = Instant::now();
            }
        }
        file.flush().await?;

        emit(progress, bytes_downloaded, total_bytes);
        info!(hub_id, file_name, bytes = bytes_downloaded, "file downloaded");
        Ok(bytes_downloaded)
    }

    /// GET with manual redirect following.
    ///
    /// The hub redirects large-file requests to a CDN on another
    /// authority; reqwest's default policy would drop the Authorization
    /// header there, so hops are followed by hand with the token
    /// re-applied each time.
    async fn get_following_redirects(&self, url: &str) -> Result<reqwest::Response> {
        self.get_with_range(url, None).await
    }

    async fn get_with_range(&self, url: &str, range: Option<&str>) -> Result<reqwest::Response> {
        let mut current = url.to_owned();
        for _ in 0..=MAX_REDIRECT_HOPS {
            let mut req = self.http.get(&current);
            if let Some(ref token) = self.token {
                req = req.bearer_auth(token);
            }
            if let Some(range) = range {
                req = req.header(reqwest::header::RANGE, range);
            }
            let resp = req.send().await.map_err(|e| {
                FetchError::Transient(format!("request to {current} failed: {e}"))
            })?;

            if resp.status().is_redirection() {
                let Some(location) = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err(FetchError::Transient(format!(
                        "redirect without Location from {current}"
                    )));
                };
                current = resolve_location(&current, location)?;
                continue;
            }
            return Ok(resp);
        }
        Err(FetchError::Transient(format!("too many redirects for {url}")))
    }

    fn status_error(&self, status: reqwest::StatusCode, what: &str) -> FetchError {
        match status.as_u16() {
            404 => FetchError::NotFound(what.to_owned()),
            401 | 403 => FetchError::PermissionDenied(format!("{what} ({status})")),
            _ => FetchError::Transient(format!("hub returned {status} for {what}")),
        }
    }
}

fn emit(progress: Option<&ByteProgressFn<'_>>, bytes: u64, total: u64) {
    if let Some(cb) = progress {
        let fraction = if total > 0 {
            (bytes as f64 / total as f64).min(1.0)
        } else {
            0.0
        };
        cb(fraction, bytes, total);
    }
}

/// Percent-encode each path segment while keeping `/` separators.
fn encode_file_path(file_name: &str) -> String {
    file_name
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve a possibly-relative Location header against the current URL.
fn resolve_location(current: &str, location: &str) -> Result<String> {
    let base = url::Url::parse(current)
        .map_err(|e| FetchError::Transient(format!("bad URL {current}: {e}")))?;
    let resolved = base
        .join(location)
        .map_err(|e| FetchError::Transient(format!("bad redirect {location}: {e}")))?;
    Ok(resolved.into())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn tree_wire_deserializes_lfs_entries() {
        let body = r#"[
            {"type":"file","path":"config.json","size":512,"oid":"abc"},
            {"type":"file","path":"model.safetensors","size":134,
             "lfs":{"oid":"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa","size":10000000}},
            {"type":"directory","path":"weights"}
        ]"#;
        let entries: Vec<TreeEntryWire> = serde_json::from_str(body).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, "file");
        assert_eq!(entries[1].lfs.as_ref().unwrap().size, Some(10_000_000));
    }

    #[test]
    fn non_hex_lfs_oid_is_dropped() {
        // Mirror of the mapping in list_files_detailed.
        let oid = Some("not-a-sha".to_owned());
        let kept = oid.filter(|o: &String| o.len() == 64 && o.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(kept.is_none());
    }

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let client = HubClient::with_endpoint("http://localhost:9000/");
        assert_eq!(client.endpoint, "http://localhost:9000");
    }

    #[test]
    fn file_paths_are_encoded_per_segment() {
        assert_eq!(encode_file_path("weights/part 1.bin"), "weights/part%201.bin");
        assert_eq!(encode_file_path("config.json"), "config.json");
    }

    #[test]
    fn relative_redirects_resolve_against_current_url() {
        let resolved =
            resolve_location("https://hub.example/a/b/resolve/main/x", "/cdn/blob/123").unwrap();
        assert_eq!(resolved, "https://hub.example/cdn/blob/123");

        let absolute =
            resolve_location("https://hub.example/a", "https://cdn.example/blob/9").unwrap();
        assert_eq!(absolute, "https://cdn.example/blob/9");
    }

    #[test]
    fn status_mapping_matches_taxonomy() {
        let client = HubClient::with_endpoint("http://localhost");
        assert!(matches!(
            client.status_error(reqwest::StatusCode::NOT_FOUND, "a/b"),
            FetchError::NotFound(_)
        ));
        assert!(matches!(
            client.status_error(reqwest::StatusCode::UNAUTHORIZED, "a/b"),
            FetchError::PermissionDenied(_)
        ));
        assert!(matches!(
            client.status_error(reqwest::StatusCode::FORBIDDEN, "a/b"),
            FetchError::PermissionDenied(_)
        ));
        assert!(matches!(
            client.status_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "a/b"),
            FetchError::Transient(_)
        ));
    }
}
