//! Packaging Unit
//!
//! Builds the downloadable zip for a finished job: one PNG per successful
//! artifact, `metadata.json` covering every artifact, a `summary.txt`, and a
//! `failures.txt` when anything failed.

use crate::{utils, CaptureAction, CaptureError, CaptureMode, CapturedArtifact};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::{Cursor, Write};
use std::time::Duration;
use url::Url;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const METADATA_FILE: &str = "metadata.json";
pub const SUMMARY_FILE: &str = "summary.txt";
pub const FAILURES_FILE: &str = "failures.txt";

/// Archive name of a successful artifact: `NN_<slug>.png`.
pub fn artifact_filename(artifact: &CapturedArtifact) -> Option<String> {
    if !artifact.success {
        return None;
    }
    let slug = match Url::parse(&artifact.url) {
        Ok(url) => utils::url_slug(&url),
        Err(_) => "page".to_string(),
    };
    Some(format!("{:02}_{}.png", artifact.order, slug))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactEntry<'a> {
    order: usize,
    url: &'a str,
    title: &'a str,
    filename: Option<String>,
    success: bool,
    error: Option<&'a str>,
    depth: u32,
    action: CaptureAction,
    triggering_element: Option<&'a str>,
    captured_at: DateTime<Utc>,
    duration_ms: u128,
    image_bytes: usize,
    thumbnail_bytes: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Metadata<'a> {
    job_id: &'a str,
    base_url: &'a str,
    mode: CaptureMode,
    generated_at: DateTime<Utc>,
    total_pages: usize,
    success_count: usize,
    failure_count: usize,
    artifacts: Vec<ArtifactEntry<'a>>,
}

/// Everything needed to describe one job's archive.
pub struct PackageRequest<'a> {
    pub job_id: &'a str,
    pub base_url: &'a Url,
    pub mode: CaptureMode,
    pub artifacts: &'a [CapturedArtifact],
    pub elapsed: Duration,
}

/// Turns a finished job into archive bytes. Any error is fatal to the job.
pub trait ArchiveBuilder: Send + Sync {
    fn build(&self, request: &PackageRequest<'_>) -> Result<Vec<u8>, CaptureError>;
}

#[derive(Debug, Clone)]
pub struct Packager {
    compression_level: u8,
}

impl Packager {
    pub fn new(compression_level: u8) -> Self {
        Self {
            compression_level: compression_level.clamp(1, 9),
        }
    }

    /// Builds the zip. Every failure is reported as
    /// [`CaptureError::PackagingFailure`].
    pub fn package(&self, request: &PackageRequest<'_>) -> Result<Vec<u8>, CaptureError> {
        self.write_zip(request).map_err(packaging_failure)
    }

    fn write_zip(&self, request: &PackageRequest<'_>) -> Result<Vec<u8>, CaptureError> {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(self.compression_level as i64));
        // PNG data is already compressed.
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let mut entries = Vec::with_capacity(request.artifacts.len());

        for artifact in request.artifacts {
            let filename = artifact_filename(artifact);
            if let Some(name) = &filename {
                zip.start_file(name.as_str(), stored)?;
                zip.write_all(&artifact.full_image)?;
            }
            entries.push(ArtifactEntry {
                order: artifact.order,
                url: &artifact.url,
                title: &artifact.title,
                filename,
                success: artifact.success,
                error: artifact.error.as_deref(),
                depth: artifact.depth,
                action: artifact.action,
                triggering_element: artifact.triggering_element.as_deref(),
                captured_at: artifact.captured_at,
                duration_ms: artifact.duration.as_millis(),
                image_bytes: artifact.full_image.len(),
                thumbnail_bytes: artifact.thumbnail.len(),
            });
        }

        let success_count = request.artifacts.iter().filter(|a| a.success).count();
        let failure_count = request.artifacts.len() - success_count;
        let metadata = Metadata {
            job_id: request.job_id,
            base_url: request.base_url.as_str(),
            mode: request.mode,
            generated_at: Utc::now(),
            total_pages: request.artifacts.len(),
            success_count,
            failure_count,
            artifacts: entries,
        };

        zip.start_file(METADATA_FILE, options)?;
        zip.write_all(&serde_json::to_vec_pretty(&metadata)?)?;

        zip.start_file(SUMMARY_FILE, options)?;
        zip.write_all(summary_text(request, success_count, failure_count).as_bytes())?;

        if failure_count > 0 {
            zip.start_file(FAILURES_FILE, options)?;
            zip.write_all(failures_text(request.artifacts).as_bytes())?;
        }

        let cursor = zip.finish()?;
        Ok(cursor.into_inner())
    }
}

impl Default for Packager {
    fn default() -> Self {
        Self::new(6)
    }
}

impl ArchiveBuilder for Packager {
    fn build(&self, request: &PackageRequest<'_>) -> Result<Vec<u8>, CaptureError> {
        self.package(request)
    }
}

fn packaging_failure(err: CaptureError) -> CaptureError {
    match err {
        CaptureError::PackagingFailure(_) => err,
        other => CaptureError::PackagingFailure(other.to_string()),
    }
}

fn summary_text(request: &PackageRequest<'_>, successes: usize, failures: usize) -> String {
    let image_bytes: usize = request.artifacts.iter().map(|a| a.full_image.len()).sum();
    let mut out = String::new();
    out.push_str(&format!("Capture {}\n", request.job_id));
    out.push_str(&format!("Base URL:   {}\n", request.base_url));
    out.push_str(&format!(
        "Mode:       {}\n",
        match request.mode {
            CaptureMode::Links => "links",
            CaptureMode::Interactive => "interactive",
        }
    ));
    out.push_str(&format!("Pages:      {}\n", request.artifacts.len()));
    out.push_str(&format!("Succeeded:  {successes}\n"));
    out.push_str(&format!("Failed:     {failures}\n"));
    out.push_str(&format!("Images:     {}\n", utils::format_bytes(image_bytes)));
    out.push_str(&format!(
        "Duration:   {}\n\n",
        utils::format_duration(request.elapsed)
    ));

    for artifact in request.artifacts {
        let status = if artifact.success { "ok" } else { "FAILED" };
        out.push_str(&format!(
            "{:02}. [{}] {} ({})\n",
            artifact.order, status, artifact.url, artifact.title
        ));
        if let Some(element) = &artifact.triggering_element {
            out.push_str(&format!("    clicked: {element}\n"));
        }
    }
    out
}

fn failures_text(artifacts: &[CapturedArtifact]) -> String {
    artifacts
        .iter()
        .filter(|a| !a.success)
        .map(|a| {
            format!(
                "{:02}\t{}\t{}\t{}\n",
                a.order,
                a.captured_at.to_rfc3339(),
                a.url,
                a.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::io::Read;
    use std::sync::Arc;

    fn artifact(order: usize, url: &str, success: bool) -> CapturedArtifact {
        CapturedArtifact {
            order,
            url: url.into(),
            title: format!("Page {order}"),
            full_image: Arc::new(if success { vec![0x89, b'P', b'N', b'G'] } else { vec![] }),
            thumbnail: Arc::new(vec![1, 2]),
            success,
            error: (!success).then(|| "Could not reach the page".to_string()),
            captured_at: Utc::now(),
            depth: 0,
            action: CaptureAction::Page,
            triggering_element: None,
            duration: Duration::from_millis(1200),
        }
    }

    fn unpack(bytes: &[u8]) -> zip::ZipArchive<Cursor<&[u8]>> {
        zip::ZipArchive::new(Cursor::new(bytes)).unwrap()
    }

    fn read(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> String {
        let mut out = String::new();
        archive.by_name(name).unwrap().read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn filenames_are_zero_padded_slugs() {
        let a = artifact(3, "https://example.com/Docs/Getting Started", true);
        assert_eq!(
            artifact_filename(&a).as_deref(),
            Some("03_docs_getting_20started.png")
        );
        let home = artifact(1, "https://example.com/", true);
        assert_eq!(artifact_filename(&home).as_deref(), Some("01_example_com.png"));
        assert_eq!(artifact_filename(&artifact(2, "https://example.com/x", false)), None);
    }

    #[test]
    fn unpacking_yields_exactly_the_successful_files() {
        let base = Url::parse("https://example.com/").unwrap();
        let artifacts = vec![
            artifact(1, "https://example.com/", true),
            artifact(2, "https://example.com/about", false),
            artifact(3, "https://example.com/blog", true),
        ];
        let bytes = Packager::new(9)
            .package(&PackageRequest {
                job_id: "job-1",
                base_url: &base,
                mode: CaptureMode::Links,
                artifacts: &artifacts,
                elapsed: Duration::from_secs(4),
            })
            .unwrap();

        let mut archive = unpack(&bytes);
        let images: BTreeSet<String> = archive
            .file_names()
            .filter(|n| n.ends_with(".png"))
            .map(str::to_string)
            .collect();

        let metadata: serde_json::Value =
            serde_json::from_str(&read(&mut archive, METADATA_FILE)).unwrap();
        let listed: BTreeSet<String> = metadata["artifacts"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|a| a["filename"].as_str().map(str::to_string))
            .collect();

        assert_eq!(images, listed);
        assert_eq!(images.len(), 2);
        assert_eq!(metadata["artifacts"].as_array().unwrap().len(), 3);
        assert_eq!(metadata["failureCount"], 1);

        let failures = read(&mut archive, FAILURES_FILE);
        assert!(failures.contains("https://example.com/about"));
        let summary = read(&mut archive, SUMMARY_FILE);
        assert!(summary.contains("Failed:     1"));
    }

    #[test]
    fn write_errors_surface_as_packaging_failures() {
        let io = packaging_failure(std::io::Error::other("disk full").into());
        assert!(matches!(io, CaptureError::PackagingFailure(_)));
        assert_eq!(io.user_message(), "Failed to build the capture archive");

        let json = packaging_failure(CaptureError::Serialization("bad float".into()));
        assert!(matches!(json, CaptureError::PackagingFailure(ref m) if m.contains("bad float")));
    }

    #[test]
    fn no_failures_file_when_everything_succeeded() {
        let base = Url::parse("https://example.com/").unwrap();
        let artifacts = vec![artifact(1, "https://example.com/", true)];
        let bytes = Packager::default()
            .package(&PackageRequest {
                job_id: "job-2",
                base_url: &base,
                mode: CaptureMode::Interactive,
                artifacts: &artifacts,
                elapsed: Duration::from_millis(900),
            })
            .unwrap();

        let archive = unpack(&bytes);
        assert!(!archive.file_names().any(|n| n == FAILURES_FILE));
        assert!(archive.file_names().any(|n| n == SUMMARY_FILE));
    }
}
