use anyhow::{Context, Result};
use std::time::Duration;

use crate::commands::{open_store, worker_settings};
use crate::config::Config;
use crate::store::ObjectLocation;
use crate::ui;
use crate::worker::{JobOutcome, PackJob, Worker};

pub async fn execute(
    dest: String,
    domain: Option<String>,
    timeout: Option<u64>,
    source: Option<String>,
    urls: Option<String>,
) -> Result<()> {
    let config = Config::load()?;
    let (store, _signer) = open_store(&config)?;

    let dest: ObjectLocation = dest
        .parse()
        .with_context(|| format!("Invalid destination {dest}"))?;
    let source = source
        .map(|s| s.parse::<ObjectLocation>())
        .transpose()
        .context("Invalid source")?;
    let urls = split_urls(urls.as_deref());

    let job = PackJob {
        dest,
        source,
        domain: domain.filter(|d| !d.is_empty()).or_else(|| config.domain()),
        timeout: timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .or_else(|| config.packer_timeout()),
        urls,
    };

    let worker = Worker::new(store, worker_settings(&config));
    match worker.run(job).await? {
        JobOutcome::Succeeded(summary) => ui::info(&format!(
            "Packed {} sources ({} entries written, {} skipped, {} sources skipped)",
            summary.sources,
            summary.entries.written,
            summary.entries.skipped,
            summary.skipped_sources
        )),
        JobOutcome::Skipped { status } => {
            ui::info(&format!("Skipped: already exists (status={status})"))
        }
        JobOutcome::ClaimLost => ui::info("Skipped: someone else is processing"),
    }
    Ok(())
}

fn split_urls(raw: Option<&str>) -> Vec<String> {
    raw.map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_urls() {
        assert!(split_urls(None).is_empty());
        assert_eq!(
            split_urls(Some("http://h/a.zip,,http://h/b.gml ")),
            vec!["http://h/a.zip", "http://h/b.gml"]
        );
    }
}
