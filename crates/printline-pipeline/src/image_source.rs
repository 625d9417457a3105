// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Image source: the scanner's SMB share, reached through `smbclient`.
//
// Each scan is either a directory of images or a single `.zip` archive under
// the configured scan path.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tracing::{debug, info, instrument, warn};

use printline_core::PipelineConfig;
use printline_core::error::{PrintlineError, Result};

use crate::stage::StageOutput;
use crate::transport::{Transport, run_collect, shell_quote};

/// Image extensions accepted by the reconstruction service.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const FETCH_TIMEOUT: Duration = Duration::from_secs(600);

/// One scan on the share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub name: String,
    pub is_dir: bool,
    pub modified: Option<NaiveDateTime>,
}

impl ScanEntry {
    pub fn is_archive(&self) -> bool {
        !self.is_dir && self.name.to_ascii_lowercase().ends_with(".zip")
    }
}

/// Images of one scan, on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedScan {
    pub label: String,
    pub image_dir: PathBuf,
    pub images: Vec<PathBuf>,
}

impl StageOutput for FetchedScan {
    fn describe(&self) -> Option<String> {
        Some(format!("{} ({} images)", self.image_dir.display(), self.images.len()))
    }
}

/// Parse `smbclient ls` output.
///
/// Entry lines look like
/// `  scan_01        D        0  Mon Jan  8 10:00:00 2024`; the name may
/// contain spaces, so fields are taken from the right.  Anything else
/// (headers, the trailing "blocks available" line) is skipped.
pub fn parse_listing(output: &str) -> Vec<ScanEntry> {
    output.lines().filter_map(parse_entry).collect()
}

fn parse_entry(line: &str) -> Option<ScanEntry> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 8 {
        return None;
    }
    let (head, date) = tokens.split_at(tokens.len() - 5);
    let (name, meta) = head.split_at(head.len() - 2);
    let &[attrs, size] = meta else {
        return None;
    };
    if size.parse::<u64>().is_err()
        || attrs.is_empty()
        || !attrs.chars().all(|c| "DAHSRN".contains(c))
    {
        return None;
    }

    let name = name.join(" ");
    if name == "." || name == ".." {
        return None;
    }
    let is_dir = attrs.contains('D');
    let entry = ScanEntry {
        modified: NaiveDateTime::parse_from_str(&date.join(" "), "%a %b %d %H:%M:%S %Y").ok(),
        name,
        is_dir,
    };
    (entry.is_dir || entry.is_archive()).then_some(entry)
}

/// Most recent scan: greatest modification time, ties and missing times
/// resolved in favour of the later listing position.
pub fn latest(entries: &[ScanEntry]) -> Option<&ScanEntry> {
    entries.iter().max_by_key(|e| e.modified)
}

/// Local directory name for a scan label.
pub fn scan_dir_name(label: &str) -> &str {
    label
        .strip_suffix(".zip")
        .or_else(|| label.strip_suffix(".ZIP"))
        .unwrap_or(label)
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Images directly inside `dir`, sorted by name.
pub fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    images.sort();
    Ok(images)
}

/// Unpack `archive` into `dest`, flattening any directories, keeping images.
pub fn extract_images(archive: &Path, dest: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| {
        PrintlineError::ImageSource(format!("{} is not a zip archive: {e}", archive.display()))
    })?;
    std::fs::create_dir_all(dest)?;

    let mut count = 0;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| PrintlineError::ImageSource(format!("corrupt archive entry {i}: {e}")))?;
        let Some(name) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(PathBuf::from))
        else {
            continue;
        };
        if entry.is_dir() || !is_image(&name) {
            continue;
        }
        let mut out = std::fs::File::create(dest.join(&name))?;
        std::io::copy(&mut entry, &mut out)?;
        count += 1;
    }
    Ok(count)
}

/// Listing and retrieval of scans.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn list_scans(&self, host: IpAddr) -> Result<Vec<ScanEntry>>;

    /// Download `label` below `scans_dir`.
    async fn fetch(&self, host: IpAddr, label: &str, scans_dir: &Path) -> Result<FetchedScan>;
}

/// `smbclient` driven through a transport (normally the local host).
pub struct SmbImageSource {
    transport: Arc<dyn Transport>,
    user: String,
    pass: String,
    share: String,
    scan_path: String,
}

impl SmbImageSource {
    pub fn new(transport: Arc<dyn Transport>, config: &PipelineConfig) -> Self {
        Self {
            transport,
            user: config.smb_user.clone(),
            pass: config.smb_pass.clone(),
            share: config.smb_share.clone(),
            scan_path: config.scan_path.trim_end_matches('/').to_owned(),
        }
    }

    fn command(&self, host: IpAddr, script: &str) -> String {
        format!(
            "smbclient {} -U {} -c {}",
            shell_quote(&format!("//{host}/{}", self.share)),
            shell_quote(&format!("{}%{}", self.user, self.pass)),
            shell_quote(script)
        )
    }

    async fn smb(&self, host: IpAddr, script: &str, timeout: Duration) -> Result<Vec<String>> {
        let (code, lines) = run_collect(self.transport.as_ref(), &self.command(host, script), timeout).await?;
        if code != 0 {
            let tail = lines.last().map(String::as_str).unwrap_or("");
            return Err(PrintlineError::ImageSource(format!(
                "smbclient exited with code {code}: {tail}"
            )));
        }
        Ok(lines)
    }
}

#[async_trait]
impl ImageSource for SmbImageSource {
    #[instrument(skip(self))]
    async fn list_scans(&self, host: IpAddr) -> Result<Vec<ScanEntry>> {
        let lines = self
            .smb(host, &format!("ls \"{}/*\"", self.scan_path), LIST_TIMEOUT)
            .await?;
        let entries = parse_listing(&lines.join("\n"));
        debug!(count = entries.len(), "scans listed");
        Ok(entries)
    }

    #[instrument(skip(self, scans_dir))]
    async fn fetch(&self, host: IpAddr, label: &str, scans_dir: &Path) -> Result<FetchedScan> {
        let image_dir = scans_dir.join(scan_dir_name(label));
        tokio::fs::create_dir_all(&image_dir).await?;

        if label.to_ascii_lowercase().ends_with(".zip") {
            let script = format!(
                "prompt; lcd \"{}\"; cd \"{}\"; get \"{label}\"",
                scans_dir.display(),
                self.scan_path
            );
            self.smb(host, &script, FETCH_TIMEOUT).await?;
            let archive = scans_dir.join(label);
            let dest = image_dir.clone();
            let count = tokio::task::spawn_blocking(move || {
                let n = extract_images(&archive, &dest)?;
                if let Err(e) = std::fs::remove_file(&archive) {
                    warn!(archive = %archive.display(), error = %e, "cannot remove fetched archive");
                }
                Ok::<_, PrintlineError>(n)
            })
            .await
            .map_err(|e| PrintlineError::ImageSource(format!("extraction task failed: {e}")))??;
            debug!(count, "images extracted");
        } else {
            let script = format!(
                "recurse; prompt; lcd \"{}\"; cd \"{}/{label}\"; mget *",
                image_dir.display(),
                self.scan_path
            );
            self.smb(host, &script, FETCH_TIMEOUT).await?;
        }

        let images = collect_images(&image_dir)?;
        if images.is_empty() {
            return Err(PrintlineError::ImageSource(format!(
                "no images downloaded for scan {label}"
            )));
        }
        info!(count = images.len(), dir = %image_dir.display(), "scan fetched");
        Ok(FetchedScan {
            label: label.to_owned(),
            image_dir,
            images,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LISTING: &str = "\
  .                                   D        0  Tue Jan  9 11:00:00 2024
  ..                                  D        0  Mon Jan  8 09:00:00 2024
  scan_A                              D        0  Mon Jan  8 10:00:00 2024
  scan B                              D        0  Tue Jan  9 11:00:00 2024
  notes.txt                           A      120  Tue Jan  9 12:00:00 2024
  scan_C.zip                          A  5242880  Mon Jan  1 08:30:00 2024

\t\t61202244 blocks of size 1024. 41051120 blocks available
";

    #[test]
    fn listing_keeps_directories_and_archives() {
        let entries = parse_listing(LISTING);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["scan_A", "scan B", "scan_C.zip"]);
        assert!(entries[0].is_dir);
        assert!(entries[2].is_archive());
        assert!(entries.iter().all(|e| e.modified.is_some()));
    }

    #[test]
    fn latest_is_newest_by_time() {
        let entries = parse_listing(LISTING);
        assert_eq!(latest(&entries).unwrap().name, "scan B");
    }

    #[test]
    fn latest_without_times_is_last_listed() {
        let entries = vec![
            ScanEntry { name: "A".into(), is_dir: true, modified: None },
            ScanEntry { name: "B".into(), is_dir: true, modified: None },
        ];
        assert_eq!(latest(&entries).unwrap().name, "B");
        assert!(latest(&[]).is_none());
    }

    #[test]
    fn dir_names_strip_archive_suffix() {
        assert_eq!(scan_dir_name("scan_C.zip"), "scan_C");
        assert_eq!(scan_dir_name("scan_A"), "scan_A");
    }

    #[test]
    fn archive_images_are_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("scan.zip");
        {
            let mut zip = zip::ZipWriter::new(std::fs::File::create(&archive).unwrap());
            let opts = zip::write::SimpleFileOptions::default();
            zip.start_file("photos/IMG_0001.JPG", opts).unwrap();
            zip.write_all(b"jpeg").unwrap();
            zip.start_file("photos/readme.txt", opts).unwrap();
            zip.write_all(b"text").unwrap();
            zip.finish().unwrap();
        }
        let dest = dir.path().join("out");
        assert_eq!(extract_images(&archive, &dest).unwrap(), 1);
        assert_eq!(
            collect_images(&dest).unwrap(),
            vec![dest.join("IMG_0001.JPG")]
        );
    }
}
