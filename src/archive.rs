//! Merging downloaded CityGML sources into a single zip archive.
//!
//! Two kinds of source are accepted. A document (`.gml`) is stored at its
//! asset-relative path, and the first segment of that path becomes a
//! destination root. An archive (`.zip`) is matched against those roots by
//! the numeric code in its file name and its entries are copied, still
//! compressed, under the matched root. The first entry written to a path
//! wins; later ones are skipped.

use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use url::Url;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::PackError;
use crate::progress::ProgressCounters;
use crate::transfer::download_to_cache;

const ASSET_PREFIX_SEGMENTS: usize = 5;
const MISC_DIR: &str = "misc";
const DOCUMENT_COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Document,
    Archive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub url: String,
    /// Path below the asset prefix, normalized.
    pub relative_path: String,
    /// File name without extension.
    pub base_name: String,
    /// Extension including the leading dot, or empty.
    pub extension: String,
    pub kind: SourceKind,
}

impl SourceFile {
    pub fn parse(raw: &str, domain: Option<&str>) -> Result<Self, PackError> {
        let url = Url::parse(raw).map_err(|_| PackError::invalid_url("invalid url", raw))?;
        if let Some(domain) = domain.filter(|d| !d.is_empty()) {
            if url.host_str() != Some(domain) {
                return Err(PackError::invalid_url("invalid domain", raw));
            }
        }

        let path = urlencoding::decode(url.path())
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| url.path().to_string());
        let relative_path =
            asset_relative_path(&path).ok_or_else(|| PackError::InvalidPath(raw.to_string()))?;

        let file_name = relative_path
            .rsplit('/')
            .next()
            .unwrap_or(relative_path.as_str());
        let (base_name, extension) = match file_name.rfind('.') {
            Some(idx) => (&file_name[..idx], &file_name[idx..]),
            None => (file_name, ""),
        };

        let kind = match extension {
            ".gml" => SourceKind::Document,
            ".zip" => SourceKind::Archive,
            other => return Err(PackError::InvalidExtension(other.to_string())),
        };

        Ok(Self {
            url: raw.to_string(),
            base_name: base_name.to_string(),
            extension: extension.to_string(),
            relative_path,
            kind,
        })
    }

    /// Destination root a document contributes: the first segment of its
    /// relative path, when the document sits inside a directory.
    pub fn document_root(&self) -> Option<&str> {
        if self.kind != SourceKind::Document {
            return None;
        }
        self.relative_path
            .split_once('/')
            .map(|(root, _)| root)
            .filter(|root| !root.is_empty())
    }
}

/// `/assets/<xx>/<id>/a/b.gml` -> `a/b.gml`. `None` when the path is too
/// short to carry the asset prefix or nothing is left after it.
pub fn asset_relative_path(path: &str) -> Option<String> {
    let parts: Vec<&str> = path.splitn(ASSET_PREFIX_SEGMENTS, '/').collect();
    if parts.len() != ASSET_PREFIX_SEGMENTS {
        return None;
    }
    normalize_entry_path(parts[ASSET_PREFIX_SEGMENTS - 1])
}

/// Cleans an archive entry name: backslashes become slashes, empty and `.`
/// segments are dropped and `..` pops the previous segment.
pub fn normalize_entry_path(name: &str) -> Option<String> {
    let unified = name.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Finds the root an archive belongs to from the numeric code that starts
/// its base name (`53394525_bldg_6697_op` -> a root starting `53394525_`).
pub fn find_root<'a>(base_name: &str, roots: &'a BTreeSet<String>) -> Option<&'a str> {
    let (code, _) = base_name.split_once('_')?;
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let prefix = format!("{code}_");
    roots
        .iter()
        .find(|root| root.starts_with(&prefix))
        .map(String::as_str)
}

/// Destination of one archive entry under `root`, or `None` if the entry
/// should not be written.
pub fn resolve_entry_path(entry_name: &str, base_name: &str, root: &str) -> Option<String> {
    let normalized = normalize_entry_path(entry_name)?;
    let mut segments: Vec<&str> = normalized.split('/').collect();

    if segments.first() == Some(&base_name) {
        if segments.len() < 2 {
            return None;
        }
        segments.remove(0);
    }
    if segments.first() == Some(&MISC_DIR) {
        segments.remove(0);
    }
    if segments.is_empty() {
        return None;
    }

    Some(format!("{}/{}", root, segments.join("/")))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub written: u64,
    pub skipped: u64,
}

impl MergeStats {
    fn add(&mut self, other: MergeStats) {
        self.written += other.written;
        self.skipped += other.skipped;
    }
}

/// Output archive plus the set of paths already written to it.
///
/// Copies check `cancel` between entries, so blocking work left running
/// after the job gave up stops at the next entry boundary.
pub struct MergeContext {
    files: HashSet<String>,
    writer: ZipWriter<File>,
    counters: Arc<ProgressCounters>,
    cancel: CancellationToken,
}

impl MergeContext {
    pub fn create(
        output: &Path,
        counters: Arc<ProgressCounters>,
        cancel: CancellationToken,
    ) -> Result<Self, PackError> {
        let file = File::create(output)?;
        Ok(Self {
            files: HashSet::new(),
            writer: ZipWriter::new(file),
            counters,
            cancel,
        })
    }

    fn check_cancelled(&self) -> Result<(), PackError> {
        if self.cancel.is_cancelled() {
            return Err(PackError::Cancelled);
        }
        Ok(())
    }

    pub fn contains(&self, destination: &str) -> bool {
        self.files.contains(destination)
    }

    /// Copies every entry of a downloaded archive without recompressing it.
    pub fn copy_archive(
        &mut self,
        archive_path: &Path,
        source: &SourceFile,
        root: &str,
    ) -> Result<MergeStats, PackError> {
        let archive_error = |err: zip::result::ZipError| PackError::Archive {
            url: source.url.clone(),
            reason: err.to_string(),
        };

        let mut archive = ZipArchive::new(File::open(archive_path)?).map_err(archive_error)?;
        log::info!("Unzipping {} files from {}", archive.len(), source.url);
        self.counters.add_total(archive.len() as u64);

        let mut stats = MergeStats::default();
        for index in 0..archive.len() {
            self.check_cancelled()?;
            let entry = archive.by_index_raw(index).map_err(archive_error)?;
            let original = entry.name().to_string();

            let destination = if entry.is_dir() {
                None
            } else {
                resolve_entry_path(&original, &source.base_name, root)
            };

            match destination {
                Some(destination) if !self.files.contains(&destination) => {
                    log::debug!("{} -> {}", original, destination);
                    self.writer
                        .raw_copy_file_rename(entry, destination.clone())
                        .map_err(archive_error)?;
                    self.files.insert(destination);
                    stats.written += 1;
                }
                Some(destination) => {
                    log::debug!("{} -> {} (skipped)", original, destination);
                    stats.skipped += 1;
                }
                None => {
                    log::debug!("{} -> (skipped)", original);
                    stats.skipped += 1;
                }
            }
            self.counters.record_processed();
        }

        Ok(stats)
    }

    /// Stores a downloaded document as a new deflated entry.
    pub fn write_document(
        &mut self,
        document_path: &Path,
        source: &SourceFile,
    ) -> Result<MergeStats, PackError> {
        let destination = source.relative_path.clone();
        if self.files.contains(&destination) {
            log::debug!("{} -> {} (skipped)", source.url, destination);
            self.counters.record_processed();
            return Ok(MergeStats {
                written: 0,
                skipped: 1,
            });
        }

        self.check_cancelled()?;
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        self.writer
            .start_file(destination.clone(), options)
            .map_err(|err| PackError::Archive {
                url: source.url.clone(),
                reason: err.to_string(),
            })?;

        let mut input = File::open(document_path)?;
        let mut buffer = vec![0u8; DOCUMENT_COPY_CHUNK];
        loop {
            self.check_cancelled()?;
            let read = input.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            self.writer.write_all(&buffer[..read])?;
        }

        log::debug!("{} -> {}", source.url, destination);
        self.files.insert(destination);
        self.counters.record_processed();
        Ok(MergeStats {
            written: 1,
            skipped: 0,
        })
    }

    pub fn finish(self) -> Result<(), PackError> {
        self.writer
            .finish()
            .map(|_| ())
            .map_err(|err| PackError::Io(io::Error::other(err)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackSummary {
    pub sources: usize,
    pub skipped_sources: usize,
    pub entries: MergeStats,
}

/// Downloads sources and merges them into one output archive.
pub struct Packer {
    client: reqwest::Client,
    cache_dir: PathBuf,
    domain: Option<String>,
    counters: Arc<ProgressCounters>,
    cancel: CancellationToken,
}

impl Packer {
    pub fn new(
        client: reqwest::Client,
        cache_dir: PathBuf,
        domain: Option<String>,
        counters: Arc<ProgressCounters>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            cache_dir,
            domain: domain.filter(|d| !d.is_empty()),
            counters,
            cancel,
        }
    }

    pub async fn pack(&self, urls: &[String], output: &Path) -> Result<PackSummary, PackError> {
        // Everything is parsed up front so a bad source fails the job before
        // any download, and so every document root is known before the
        // first archive is matched.
        let sources = urls
            .iter()
            .map(|raw| SourceFile::parse(raw, self.domain.as_deref()))
            .collect::<Result<Vec<_>, _>>()?;
        let roots: BTreeSet<String> = sources
            .iter()
            .filter_map(|source| source.document_root().map(str::to_string))
            .collect();

        let mut summary = PackSummary {
            sources: sources.len(),
            ..PackSummary::default()
        };
        let mut ctx = MergeContext::create(output, self.counters.clone(), self.cancel.clone())?;

        for source in sources {
            if self.cancel.is_cancelled() {
                return Err(PackError::Cancelled);
            }
            match source.kind {
                SourceKind::Archive => {
                    let Some(root) = find_root(&source.base_name, &roots).map(str::to_string)
                    else {
                        log::warn!("Skipped download: {}", source.url);
                        summary.skipped_sources += 1;
                        continue;
                    };

                    log::info!("Downloading {}", source.url);
                    let path = self.download(&source).await?;
                    let (returned, result) = tokio::task::spawn_blocking(move || {
                        let result = ctx.copy_archive(&path, &source, &root);
                        (ctx, result)
                    })
                    .await
                    .map_err(|err| PackError::Io(io::Error::other(err)))?;
                    ctx = returned;
                    summary.entries.add(result?);
                }
                SourceKind::Document => {
                    self.counters.add_total(1);
                    if ctx.contains(&source.relative_path) {
                        log::debug!("{} -> {} (skipped)", source.url, source.relative_path);
                        self.counters.record_processed();
                        summary.entries.skipped += 1;
                        continue;
                    }

                    log::info!("Downloading {}", source.url);
                    let path = self.download(&source).await?;
                    let (returned, result) = tokio::task::spawn_blocking(move || {
                        let result = ctx.write_document(&path, &source);
                        (ctx, result)
                    })
                    .await
                    .map_err(|err| PackError::Io(io::Error::other(err)))?;
                    ctx = returned;
                    summary.entries.add(result?);
                }
            }
        }

        tokio::task::spawn_blocking(move || ctx.finish())
            .await
            .map_err(|err| PackError::Io(io::Error::other(err)))??;

        Ok(summary)
    }

    async fn download(&self, source: &SourceFile) -> Result<PathBuf, PackError> {
        download_to_cache(&self.client, &source.url, &self.cache_dir, &source.extension)
            .await
            .map_err(|err| PackError::Download {
                url: source.url.clone(),
                reason: format!("{:#}", err),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_asset_relative_path() {
        assert_eq!(
            asset_relative_path("/assets/ab/1234/udx/bldg/a.gml").as_deref(),
            Some("udx/bldg/a.gml")
        );
        assert_eq!(
            asset_relative_path("/assets/ab/1234/a.zip").as_deref(),
            Some("a.zip")
        );
        assert_eq!(asset_relative_path("/assets/ab/a.zip"), None);
        assert_eq!(asset_relative_path("/assets/ab/1234/"), None);
    }

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(
            normalize_entry_path("a\\b\\c.gml").as_deref(),
            Some("a/b/c.gml")
        );
        assert_eq!(normalize_entry_path("./a//b/").as_deref(), Some("a/b"));
        assert_eq!(normalize_entry_path("a/../b").as_deref(), Some("b"));
        assert_eq!(normalize_entry_path("../../x").as_deref(), Some("x"));
        assert_eq!(normalize_entry_path("./"), None);
    }

    #[test]
    fn test_find_root() {
        let known = roots(&["53394525_bldg_6697_op", "udx"]);
        assert_eq!(
            find_root("53394525_dem_6697", &known),
            Some("53394525_bldg_6697_op")
        );
        assert_eq!(find_root("53394526_dem_6697", &known), None);
        assert_eq!(find_root("abc_dem", &known), None);
        assert_eq!(find_root("_dem", &known), None);
        assert_eq!(find_root("53394525", &known), None);
    }

    #[test]
    fn test_resolve_entry_path() {
        let base = "53394525_dem_6697";
        let root = "53394525_bldg";
        assert_eq!(
            resolve_entry_path("53394525_dem_6697/misc/dem/a.gml", base, root).as_deref(),
            Some("53394525_bldg/dem/a.gml")
        );
        assert_eq!(
            resolve_entry_path("appearance/t.jpg", base, root).as_deref(),
            Some("53394525_bldg/appearance/t.jpg")
        );
        assert_eq!(resolve_entry_path("53394525_dem_6697", base, root), None);
        assert_eq!(resolve_entry_path("53394525_dem_6697/misc", base, root), None);
        assert_eq!(resolve_entry_path(".", base, root), None);
    }

    #[test]
    fn test_source_parse() {
        let doc = SourceFile::parse(
            "https://example.com/assets/ab/1234/53394525_bldg/b%20c.gml",
            Some("example.com"),
        )
        .unwrap();
        assert_eq!(doc.kind, SourceKind::Document);
        assert_eq!(doc.relative_path, "53394525_bldg/b c.gml");
        assert_eq!(doc.document_root(), Some("53394525_bldg"));

        let zip =
            SourceFile::parse("https://example.com/assets/ab/1234/53394525_dem.zip", None).unwrap();
        assert_eq!(zip.kind, SourceKind::Archive);
        assert_eq!(zip.base_name, "53394525_dem");
        assert_eq!(zip.document_root(), None);

        assert!(matches!(
            SourceFile::parse("https://example.com/assets/ab/1234/a.txt", None),
            Err(PackError::InvalidExtension(ext)) if ext == ".txt"
        ));
        assert!(matches!(
            SourceFile::parse("https://example.com/a.zip", None),
            Err(PackError::InvalidPath(_))
        ));
        assert!(matches!(
            SourceFile::parse("https://other.com/assets/ab/1234/a.zip", Some("example.com")),
            Err(PackError::InvalidRequest { .. })
        ));
    }

    fn build_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, content) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    fn read_entries(path: &Path) -> Vec<(String, String)> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entries = Vec::new();
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).unwrap();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            entries.push((entry.name().to_string(), content));
        }
        entries
    }

    #[test]
    fn test_merge_first_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.zip");
        let second = dir.path().join("second.zip");
        build_zip(
            &first,
            &[
                ("53394525_dem/", ""),
                ("53394525_dem/misc/dem/a.gml", "first"),
                ("53394525_dem/dem/b.gml", "b"),
            ],
        );
        build_zip(&second, &[("dem/a.gml", "second"), ("dem/c.gml", "c")]);

        let counters = Arc::new(ProgressCounters::new());
        let output = dir.path().join("out.zip");
        let mut ctx =
            MergeContext::create(&output, counters.clone(), CancellationToken::new()).unwrap();

        let source = |name: &str| SourceFile {
            url: format!("http://h/{name}.zip"),
            relative_path: format!("{name}.zip"),
            base_name: name.to_string(),
            extension: ".zip".to_string(),
            kind: SourceKind::Archive,
        };

        let stats = ctx
            .copy_archive(&first, &source("53394525_dem"), "53394525_bldg")
            .unwrap();
        assert_eq!(
            stats,
            MergeStats {
                written: 2,
                skipped: 1
            }
        );
        let stats = ctx
            .copy_archive(&second, &source("53394525_tran"), "53394525_bldg")
            .unwrap();
        assert_eq!(
            stats,
            MergeStats {
                written: 1,
                skipped: 1
            }
        );
        ctx.finish().unwrap();

        let snapshot = counters.snapshot();
        assert_eq!((snapshot.processed, snapshot.total), (5, 5));

        let entries = read_entries(&output);
        assert_eq!(
            entries,
            vec![
                ("53394525_bldg/dem/a.gml".to_string(), "first".to_string()),
                ("53394525_bldg/dem/b.gml".to_string(), "b".to_string()),
                ("53394525_bldg/dem/c.gml".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn test_corrupt_archive_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.zip");
        std::fs::write(&broken, b"not a zip").unwrap();

        let output = dir.path().join("out.zip");
        let mut ctx = MergeContext::create(
            &output,
            Arc::new(ProgressCounters::new()),
            CancellationToken::new(),
        )
        .unwrap();
        let source = SourceFile {
            url: "http://h/1_x.zip".to_string(),
            relative_path: "1_x.zip".to_string(),
            base_name: "1_x".to_string(),
            extension: ".zip".to_string(),
            kind: SourceKind::Archive,
        };
        assert!(matches!(
            ctx.copy_archive(&broken, &source, "1_root"),
            Err(PackError::Archive { .. })
        ));
    }

    #[test]
    fn test_cancelled_merge_stops_copying() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.zip");
        build_zip(&input, &[("dem/a.gml", "a"), ("dem/b.gml", "b")]);
        let document = dir.path().join("doc.gml");
        std::fs::write(&document, "<CityModel/>").unwrap();

        let cancel = CancellationToken::new();
        let counters = Arc::new(ProgressCounters::new());
        let output = dir.path().join("out.zip");
        let mut ctx = MergeContext::create(&output, counters.clone(), cancel.clone()).unwrap();
        cancel.cancel();

        let archive = SourceFile {
            url: "http://h/1_dem.zip".to_string(),
            relative_path: "1_dem.zip".to_string(),
            base_name: "1_dem".to_string(),
            extension: ".zip".to_string(),
            kind: SourceKind::Archive,
        };
        assert!(matches!(
            ctx.copy_archive(&input, &archive, "1_bldg"),
            Err(PackError::Cancelled)
        ));
        let doc = SourceFile {
            url: "http://h/1_bldg/doc.gml".to_string(),
            relative_path: "1_bldg/doc.gml".to_string(),
            base_name: "doc".to_string(),
            extension: ".gml".to_string(),
            kind: SourceKind::Document,
        };
        assert!(matches!(
            ctx.write_document(&document, &doc),
            Err(PackError::Cancelled)
        ));

        assert!(!ctx.contains("1_bldg/dem/a.gml"));
        assert!(!ctx.contains("1_bldg/doc.gml"));
        assert_eq!(counters.snapshot().processed, 0);
    }
}
