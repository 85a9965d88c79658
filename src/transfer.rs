use anyhow::{Context, Result};
use futures_util::StreamExt;
use humansize::{format_size, DECIMAL};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::sleep;

use crate::cache_key::sha256_hex;

const DOWNLOAD_ATTEMPTS: u32 = 3;
const DOWNLOAD_BACKOFF_BASE: Duration = Duration::from_millis(500);
const DOWNLOAD_BACKOFF_CAP: Duration = Duration::from_secs(2);
const DOWNLOAD_WRITER_CAPACITY: usize = 256 * 1024;

fn download_backoff(attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(16);
    DOWNLOAD_BACKOFF_BASE
        .saturating_mul(1 << doublings)
        .min(DOWNLOAD_BACKOFF_CAP)
}

/// Source hosts answer these while overloaded or throttling.
fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
}

/// GETs a source, repeating connection failures, timeouts and transient
/// statuses. Any other non-2xx answer fails at once.
async fn request_source(client: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let last = attempt >= DOWNLOAD_ATTEMPTS;

        match client.get(url).send().await {
            Ok(response) if is_transient_status(response.status()) && !last => {
                log::debug!(
                    "GET {} returned {}, retrying (attempt {}/{})",
                    url,
                    response.status(),
                    attempt,
                    DOWNLOAD_ATTEMPTS
                );
            }
            Ok(response) => {
                return response
                    .error_for_status()
                    .with_context(|| format!("GET {url} failed after {attempt} attempt(s)"));
            }
            Err(err) if (err.is_timeout() || err.is_connect()) && !last => {
                log::debug!(
                    "GET {} failed ({}), retrying (attempt {}/{})",
                    url,
                    err,
                    attempt,
                    DOWNLOAD_ATTEMPTS
                );
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("GET {url} failed after {attempt} attempt(s)"));
            }
        }

        sleep(download_backoff(attempt)).await;
    }
}

/// Scratch file a source URL is downloaded to. The extension is kept so the
/// cache directory stays readable.
pub fn cache_path_for(cache_dir: &Path, url: &str, extension: &str) -> PathBuf {
    let name = sha256_hex(url.as_bytes());
    if extension.is_empty() {
        cache_dir.join(name)
    } else {
        cache_dir.join(format!("{}.{}", name, extension.trim_start_matches('.')))
    }
}

/// Downloads `url` into the scratch cache unless a non-empty copy is already
/// there. Returns the cached file path.
pub async fn download_to_cache(
    client: &reqwest::Client,
    url: &str,
    cache_dir: &Path,
    extension: &str,
) -> Result<PathBuf> {
    let target = cache_path_for(cache_dir, url, extension);
    if let Ok(meta) = tokio::fs::metadata(&target).await {
        if meta.is_file() && meta.len() > 0 {
            log::debug!("Using cached download for {}", url);
            return Ok(target);
        }
    }

    tokio::fs::create_dir_all(cache_dir)
        .await
        .with_context(|| format!("Failed to create cache dir {}", cache_dir.display()))?;

    let response = request_source(client, url).await?;

    let temp = tempfile::Builder::new()
        .prefix(".download-")
        .tempfile_in(cache_dir)
        .context("Failed to create download file")?;
    let (std_file, temp_path) = temp.into_parts();
    let mut writer = BufWriter::with_capacity(
        DOWNLOAD_WRITER_CAPACITY,
        tokio::fs::File::from_std(std_file),
    );

    let mut bytes_downloaded = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.context("Source download interrupted")?;
        writer.write_all(&chunk).await?;
        bytes_downloaded += chunk.len() as u64;
    }
    writer.flush().await?;
    drop(writer);

    temp_path
        .persist(&target)
        .with_context(|| format!("Failed to move download into {}", target.display()))?;

    log::info!(
        "Downloaded {} ({})",
        url,
        format_size(bytes_downloaded, DECIMAL)
    );
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(download_backoff(1), Duration::from_millis(500));
        assert_eq!(download_backoff(2), Duration::from_millis(1_000));
        assert_eq!(download_backoff(5), Duration::from_secs(2));
        assert_eq!(download_backoff(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn cache_path_is_stable_per_url() {
        let dir = Path::new("/tmp/cache");
        let a = cache_path_for(dir, "http://h/a.zip", "zip");
        assert_eq!(a, cache_path_for(dir, "http://h/a.zip", ".zip"));
        assert_ne!(a, cache_path_for(dir, "http://h/b.zip", "zip"));
        assert_eq!(a.extension().unwrap(), "zip");
    }

    #[tokio::test]
    async fn download_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/a.zip")
            .with_status(200)
            .with_body("payload")
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = reqwest::Client::new();
        let url = format!("{}/a.zip", server.url());

        let first = download_to_cache(&client, &url, dir.path(), "zip")
            .await
            .unwrap();
        let second = download_to_cache(&client, &url, dir.path(), "zip")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"payload");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn transient_status_is_retried_then_reported() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/busy.zip")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/busy.zip", server.url());
        let err = download_to_cache(&reqwest::Client::new(), &url, dir.path(), "zip")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("after 3 attempt(s)"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn download_reports_http_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing.zip")
            .with_status(404)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/missing.zip", server.url());
        let result = download_to_cache(&reqwest::Client::new(), &url, dir.path(), "zip").await;
        assert!(result.is_err());
        assert!(!cache_path_for(dir.path(), &url, "zip").exists());
    }
}
