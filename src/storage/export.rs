//! Batch archive export.
//!
//! Bundles every member capture of a batch into one ZIP, each under
//! `<hostname>-<jobPrefix>/`, with a top-level `manifest.json` carrying the
//! batch summary.

use std::io::Cursor;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::warn;
use url::Url;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::jobs::BatchJob;

/// One completed member of a batch, with its capture directory.
#[derive(Debug, Clone)]
pub struct BatchExportMember {
    pub job_id: String,
    pub url: String,
    pub capture_dir: PathBuf,
}

/// Build the batch ZIP in memory.
///
/// Members whose directory is unreadable are skipped and noted in the
/// manifest rather than failing the export.
pub async fn export_batch(batch: &BatchJob, members: Vec<BatchExportMember>) -> Result<Vec<u8>> {
    let batch_json = serde_json::to_value(batch).context("Failed to serialize batch")?;

    // ZIP assembly is CPU- and file-bound; keep it off the async runtime.
    tokio::task::spawn_blocking(move || {
        let mut zip_buffer = Vec::new();
        let cursor = Cursor::new(&mut zip_buffer);
        let mut zip = ZipWriter::new(cursor);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        let mut manifest_members = Vec::new();

        for member in members {
            let dir_name = member_dir_name(&member);

            let files = match collect_files(&member.capture_dir) {
                Ok(files) => files,
                Err(e) => {
                    warn!(job_id = %member.job_id, error = %e, "Skipping unreadable capture in export");
                    manifest_members.push(json!({
                        "jobId": member.job_id,
                        "url": member.url,
                        "skipped": true,
                        "reason": e.to_string(),
                    }));
                    continue;
                }
            };

            for relative in &files {
                let source = member.capture_dir.join(relative);
                let data = std::fs::read(&source)
                    .with_context(|| format!("Failed to read {}", source.display()))?;
                let zip_path = format!("{dir_name}/{}", relative.to_string_lossy());
                zip.start_file(&zip_path, options)
                    .context("Failed to start ZIP entry")?;
                std::io::Write::write_all(&mut zip, &data)
                    .context("Failed to write file data to ZIP")?;
            }

            manifest_members.push(json!({
                "jobId": member.job_id,
                "url": member.url,
                "path": dir_name,
                "files": files.len(),
            }));
        }

        let manifest = json!({
            "batch": batch_json,
            "members": manifest_members,
            "exportedAt": Utc::now().to_rfc3339(),
        });
        let manifest_json = serde_json::to_string_pretty(&manifest)?;
        zip.start_file("manifest.json", options)
            .context("Failed to start manifest entry")?;
        std::io::Write::write_all(&mut zip, manifest_json.as_bytes())
            .context("Failed to write manifest")?;

        zip.finish().context("Failed to finish ZIP file")?;
        Ok(zip_buffer)
    })
    .await
    .context("ZIP export task panicked")?
}

/// `<hostname>-<jobPrefix>` directory name for a member.
fn member_dir_name(member: &BatchExportMember) -> String {
    let hostname = Url::parse(&member.url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    let prefix: String = member.job_id.chars().take(8).collect();
    format!("{hostname}-{prefix}")
}

/// All regular files under `dir`, as paths relative to it.
fn collect_files(dir: &std::path::Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)
            .with_context(|| format!("Failed to read directory: {}", current.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                if let Ok(relative) = path.strip_prefix(dir) {
                    files.push(relative.to_path_buf());
                }
            }
        }
    }

    files.sort();
    Ok(files)
}
