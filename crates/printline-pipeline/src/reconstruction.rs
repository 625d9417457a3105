// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Reconstruction service client.
//
// Flow: check the token, zip the images, split the zip into parts no larger
// than the service accepts, create the project (which hands back one upload
// link per part), upload, start, poll until `done`, then download the result.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use printline_core::PipelineConfig;
use printline_core::error::{PrintlineError, Result};

/// Largest part the service accepts.
pub const MAX_PART_SIZE: u64 = 200_000_000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Deserialize)]
pub struct TokenInfo {
    #[serde(default)]
    pub credit: Option<Value>,
    #[serde(default = "default_limit_photos")]
    pub limit_photos: u64,
    #[serde(default = "default_limit_filesize")]
    pub limit_filesize: u64,
}

fn default_limit_photos() -> u64 {
    999
}

fn default_limit_filesize() -> u64 {
    2_000_000_000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectInfo {
    #[serde(default = "unknown_status")]
    pub status: String,
    #[serde(default)]
    pub dlink: String,
}

fn unknown_status() -> String {
    "unknown".to_owned()
}

/// The service's HTTP surface.
#[async_trait]
pub trait ReconstructionApi: Send + Sync {
    async fn token_info(&self) -> Result<TokenInfo>;

    /// Returns one upload link per part.
    async fn create_project(&self, project: &str, photos: usize, parts: usize, filesize: u64) -> Result<Vec<String>>;

    async fn upload_part(&self, link: &str, part: &Path) -> Result<()>;

    async fn start_project(&self, project: &str) -> Result<()>;

    async fn project_info(&self, project: &str) -> Result<ProjectInfo>;

    /// Informational; `None` on any failure.
    async fn queue_estimate(&self) -> Option<Value>;

    /// Fetch `link` into `dest`, returning the byte count.
    async fn download(&self, link: &str, dest: &Path) -> Result<u64>;
}

/// `reqwest` implementation.  Every call carries the token as a query
/// parameter and basic credentials.
pub struct CloudClient {
    http: reqwest::Client,
    server: String,
    token: String,
    user: String,
    pass: String,
}

impl CloudClient {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        if config.cloud_token.is_empty() {
            return Err(PrintlineError::Config("OSC_TOKEN not set".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(TRANSFER_TIMEOUT)
            .build()
            .map_err(|e| PrintlineError::Reconstruction(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            server: format!("{}/", config.cloud_server.trim_end_matches('/')),
            token: config.cloud_token.clone(),
            user: config.cloud_user.clone(),
            pass: config.cloud_pass.clone(),
        })
    }

    async fn get(&self, endpoint: &str, params: &[(&str, String)], timeout: Duration) -> Result<reqwest::Response> {
        let mut query: Vec<(&str, String)> = params.to_vec();
        query.push(("token", self.token.clone()));
        self.http
            .get(format!("{}{endpoint}", self.server))
            .basic_auth(&self.user, Some(&self.pass))
            .query(&query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| PrintlineError::Reconstruction(format!("{endpoint}: {e}")))
    }

    async fn get_ok(&self, endpoint: &str, params: &[(&str, String)], timeout: Duration) -> Result<reqwest::Response> {
        let resp = self.get(endpoint, params, timeout).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PrintlineError::Reconstruction(format!(
                "{endpoint} failed: HTTP {} {}",
                status.as_u16(),
                body.trim()
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ReconstructionApi for CloudClient {
    async fn token_info(&self) -> Result<TokenInfo> {
        let resp = self.get("getTokenInfo", &[], REQUEST_TIMEOUT).await?;
        if !resp.status().is_success() {
            return Err(PrintlineError::Reconstruction(format!(
                "invalid token: HTTP {}",
                resp.status().as_u16()
            )));
        }
        resp.json()
            .await
            .map_err(|e| PrintlineError::Protocol(format!("getTokenInfo reply: {e}")))
    }

    async fn create_project(&self, project: &str, photos: usize, parts: usize, filesize: u64) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Created {
            #[serde(default)]
            ulink: Vec<String>,
        }
        let params = [
            ("project", project.to_owned()),
            ("photos", photos.to_string()),
            ("parts", parts.to_string()),
            ("filesize", filesize.to_string()),
        ];
        let created: Created = self
            .get_ok("createProject", &params, REQUEST_TIMEOUT)
            .await?
            .json()
            .await
            .map_err(|e| PrintlineError::Protocol(format!("createProject reply: {e}")))?;
        Ok(created.ulink)
    }

    async fn upload_part(&self, link: &str, part: &Path) -> Result<()> {
        let body = tokio::fs::read(part).await?;
        let resp = self
            .http
            .post(link)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| PrintlineError::Reconstruction(format!("upload {}: {e}", part.display())))?;
        if !resp.status().is_success() {
            return Err(PrintlineError::Reconstruction(format!(
                "upload failed: HTTP {}",
                resp.status().as_u16()
            )));
        }
        Ok(())
    }

    async fn start_project(&self, project: &str) -> Result<()> {
        // Slow after large uploads.
        self.get_ok("startProject", &[("project", project.to_owned())], TRANSFER_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn project_info(&self, project: &str) -> Result<ProjectInfo> {
        self.get_ok("getProjectInfo", &[("project", project.to_owned())], REQUEST_TIMEOUT)
            .await?
            .json()
            .await
            .map_err(|e| PrintlineError::Protocol(format!("getProjectInfo reply: {e}")))
    }

    async fn queue_estimate(&self) -> Option<Value> {
        let resp = self.get("getQueueEstimate", &[], REQUEST_TIMEOUT).await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json().await.ok()
    }

    async fn download(&self, link: &str, dest: &Path) -> Result<u64> {
        let mut resp = self
            .http
            .get(link)
            .send()
            .await
            .map_err(|e| PrintlineError::Reconstruction(format!("download: {e}")))?;
        if !resp.status().is_success() {
            return Err(PrintlineError::Reconstruction(format!(
                "download failed: HTTP {}",
                resp.status().as_u16()
            )));
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| PrintlineError::Reconstruction(format!("download body: {e}")))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(bytes = written, dest = %dest.display(), "download complete");
        Ok(written)
    }
}

/// `<centiseconds>-<label>-OSC.zip`, label reduced to `[A-Za-z0-9_-]`.
pub fn project_name(label: Option<&str>, unix_centis: u128) -> String {
    let label = match label.map(|l| l.replace(".zip", "")) {
        Some(l) if !l.is_empty() => l
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect(),
        _ => "scan".to_owned(),
    };
    format!("{unix_centis}-{label}-OSC.zip")
}

/// `<project without .zip>_result<ext>`, the extension taken from the last
/// path segment of the download link.
pub fn result_file_name(project: &str, dlink: &str) -> String {
    let last = dlink
        .split(['?', '#'])
        .next()
        .unwrap_or("")
        .rsplit('/')
        .next()
        .unwrap_or("");
    let ext = match last.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => format!(".{ext}"),
        _ => ".zip".to_owned(),
    };
    format!("{}_result{ext}", project.trim_end_matches(".zip"))
}

/// Zip `images` into `dest`, entries named by file name in the given order,
/// with fixed timestamps so identical inputs give identical bytes.
pub fn zip_images(images: &[PathBuf], dest: &Path) -> Result<u64> {
    let file = std::fs::File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    for image in images {
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PrintlineError::Reconstruction(format!("{} has no file name", image.display())))?;
        zip.start_file(name, options)
            .map_err(|e| PrintlineError::Reconstruction(format!("zip: {e}")))?;
        let mut src = std::fs::File::open(image)?;
        std::io::copy(&mut src, &mut zip)?;
    }
    zip.finish()
        .map_err(|e| PrintlineError::Reconstruction(format!("zip: {e}")))?;
    Ok(std::fs::metadata(dest)?.len())
}

/// Split `path` into `<path>_partN` files of at most `max` bytes.  A file
/// that already fits is returned as-is.
pub fn split_parts(path: &Path, max: u64) -> Result<Vec<PathBuf>> {
    let size = std::fs::metadata(path)?.len();
    if size <= max {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut src = std::fs::File::open(path)?;
    let mut parts = Vec::new();
    loop {
        let part = PathBuf::from(format!("{}_part{}", path.display(), parts.len() + 1));
        let mut out = std::fs::File::create(&part)?;
        let copied = std::io::copy(&mut (&mut src).take(max), &mut out)?;
        out.flush()?;
        if copied == 0 {
            drop(out);
            std::fs::remove_file(&part)?;
            break;
        }
        parts.push(part);
        if copied < max {
            break;
        }
    }
    std::fs::remove_file(path)?;
    Ok(parts)
}

/// Poll `project` until the service reports `done`.  Returns the download
/// link.  Never waits past `max_wait`.
#[instrument(skip(api))]
pub async fn poll_until_done(
    api: &dyn ReconstructionApi,
    project: &str,
    interval: Duration,
    max_wait: Duration,
) -> Result<String> {
    let started = Instant::now();
    loop {
        let Some(left) = max_wait.checked_sub(started.elapsed()).filter(|d| !d.is_zero()) else {
            break;
        };
        tokio::time::sleep(interval.min(left)).await;

        let info = api.project_info(project).await?;
        info!(status = %info.status, elapsed = started.elapsed().as_secs(), "reconstruction status");

        if info.status == "done" {
            if info.dlink.is_empty() {
                return Err(PrintlineError::Protocol(
                    "processing done but no download link".into(),
                ));
            }
            return Ok(info.dlink);
        }
        let lowered = info.status.to_ascii_lowercase();
        if lowered.contains("failed") || lowered.contains("error") {
            return Err(PrintlineError::Reconstruction(format!(
                "processing failed: status {}",
                info.status
            )));
        }
    }
    Err(PrintlineError::Transport(format!(
        "timed out after {}s waiting for reconstruction",
        max_wait.as_secs()
    )))
}

/// Where one reconstruction reads and writes.
#[derive(Debug, Clone)]
pub struct ReconstructionSettings {
    pub results_dir: PathBuf,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub max_part_size: u64,
}

impl ReconstructionSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            results_dir: config.scandata_dir.join("results"),
            poll_interval: config.cloud_poll_interval,
            max_wait: config.cloud_max_wait,
            max_part_size: MAX_PART_SIZE,
        }
    }
}

/// Submit `images`, wait for the mesh and download it.  Returns the local
/// result path.
#[instrument(skip(api, images, settings), fields(images = images.len()))]
pub async fn reconstruct(
    api: &dyn ReconstructionApi,
    images: &[PathBuf],
    label: Option<&str>,
    settings: &ReconstructionSettings,
) -> Result<PathBuf> {
    if images.is_empty() {
        return Err(PrintlineError::Reconstruction("no images to upload".into()));
    }
    let token = api.token_info().await?;
    info!(credit = ?token.credit, limit_photos = token.limit_photos, "token accepted");
    if images.len() as u64 > token.limit_photos {
        return Err(PrintlineError::Reconstruction(format!(
            "too many photos: {} > limit {}",
            images.len(),
            token.limit_photos
        )));
    }

    let centis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        / 10;
    let project = project_name(label, centis);

    let temp_dir = settings.results_dir.join("temp");
    tokio::fs::create_dir_all(&temp_dir).await?;
    let zip_path = temp_dir.join(&project);
    let sorted = {
        let mut v = images.to_vec();
        v.sort();
        v
    };
    let max_part = settings.max_part_size;
    let (filesize, parts) = tokio::task::spawn_blocking(move || {
        let size = zip_images(&sorted, &zip_path)?;
        Ok::<_, PrintlineError>((size, split_parts(&zip_path, max_part)?))
    })
    .await
    .map_err(|e| PrintlineError::Reconstruction(format!("zip task failed: {e}")))??;
    info!(%project, bytes = filesize, parts = parts.len(), "images packed");

    if filesize > token.limit_filesize {
        return Err(PrintlineError::Reconstruction(format!(
            "file too large: {filesize} > limit {}",
            token.limit_filesize
        )));
    }

    let links = api
        .create_project(&project, images.len(), parts.len(), filesize)
        .await?;
    if links.len() < parts.len() {
        return Err(PrintlineError::Protocol(format!(
            "expected {} upload links, got {}",
            parts.len(),
            links.len()
        )));
    }
    for (i, (part, link)) in parts.iter().zip(&links).enumerate() {
        info!(part = i + 1, of = parts.len(), "uploading");
        api.upload_part(link, part).await?;
    }
    api.start_project(&project).await?;
    if let Some(queue) = api.queue_estimate().await {
        info!(%queue, "queue estimate");
    }

    let dlink = poll_until_done(api, &project, settings.poll_interval, settings.max_wait).await?;
    let result = settings.results_dir.join(result_file_name(&project, &dlink));
    let bytes = api.download(&dlink, &result).await?;
    info!(result = %result.display(), bytes, "result downloaded");

    for part in &parts {
        if let Err(e) = tokio::fs::remove_file(part).await {
            debug!(part = %part.display(), error = %e, "cannot remove part");
        }
    }
    if bytes == 0 {
        warn!("downloaded result is empty");
    }
    Ok(result)
}
