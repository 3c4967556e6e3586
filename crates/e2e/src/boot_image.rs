//! Boot image (updates.img) patching
//!
//! The installer loads `updates.img`, a gzip-compressed cpio archive, at
//! early boot. Patching unpacks it into a fresh temporary directory, drops a
//! kickstart snippet pointing at the payload URL into it and repacks the tree
//! into a per-session image. The source archive is only ever read.

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::command::HostCommand;
use crate::error::{E2eError, E2eResult};

/// Location of the injected directive inside the unpacked image
pub const INTERACTIVE_DEFAULTS_PATH: &str = "usr/share/anaconda/interactive-defaults.ks";

/// Kickstart directive installing from the served payload
pub fn interactive_defaults(payload_url: &str) -> String {
    format!("liveimg --url=\"{}\"", payload_url)
}

/// A boot image with the payload directive injected
#[derive(Debug, Clone)]
pub struct PatchedImage {
    pub path: PathBuf,
    pub payload_url: String,
    /// SHA-256 of the written archive
    pub digest: String,
}

/// Produces per-session boot images
#[async_trait]
pub trait ImagePatcher: Send + Sync {
    async fn patch(&self, source: &Path, dest: &Path, payload_url: &str) -> E2eResult<PatchedImage>;
}

/// Patches images with flate2 for the gzip layer and `cpio` for the archive
#[derive(Debug, Clone)]
pub struct CpioPatcher {
    cpio: String,
}

impl Default for CpioPatcher {
    fn default() -> Self {
        Self {
            cpio: "cpio".to_string(),
        }
    }
}

impl CpioPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unpack the gzip-compressed cpio `archive` into `dir`
    pub async fn unpack(&self, archive: &Path, dir: &Path) -> E2eResult<()> {
        let compressed = tokio::fs::read(archive).await?;
        let data = tokio::task::spawn_blocking(move || gunzip(&compressed))
            .await
            .map_err(|e| E2eError::Patch(format!("decompression task failed: {}", e)))??;

        let cmd = HostCommand::new(&self.cpio).arg("-idu").current_dir(dir);
        self.pipe(&cmd, data).await?;
        Ok(())
    }

    /// Pack `dir` into a gzip-compressed newc cpio archive at `dest`
    pub async fn pack_tree(&self, dir: &Path, dest: &Path) -> E2eResult<()> {
        let list = file_list(dir)?;
        let cmd = HostCommand::new(&self.cpio)
            .args(["-o", "-H", "newc"])
            .current_dir(dir);
        let archive = self.pipe(&cmd, list.into_bytes()).await?;

        let compressed = tokio::task::spawn_blocking(move || gzip(&archive))
            .await
            .map_err(|e| E2eError::Patch(format!("compression task failed: {}", e)))??;
        tokio::fs::write(dest, compressed).await?;
        Ok(())
    }

    /// Feed `input` to `cmd` on stdin and collect its stdout
    async fn pipe(&self, cmd: &HostCommand, input: Vec<u8>) -> E2eResult<Vec<u8>> {
        debug!("exec: {}", cmd);
        let mut child = cmd
            .to_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| E2eError::Patch(format!("failed to run {}: {}", cmd, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| E2eError::Patch(format!("no stdin for {}", cmd)))?;
        // Written concurrently: cpio -o fills stdout while still reading names
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let output = child.wait_with_output().await?;
        let written = writer
            .await
            .map_err(|e| E2eError::Patch(format!("stdin writer failed: {}", e)))?;

        if !output.status.success() {
            return Err(E2eError::CommandFailed {
                command: cmd.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        written?;

        Ok(output.stdout)
    }
}

#[async_trait]
impl ImagePatcher for CpioPatcher {
    async fn patch(&self, source: &Path, dest: &Path, payload_url: &str) -> E2eResult<PatchedImage> {
        if source == dest {
            return Err(E2eError::Patch(format!(
                "refusing to patch {} in place",
                source.display()
            )));
        }
        if !source.exists() {
            return Err(E2eError::missing_file(source, "build the installer updates.img first"));
        }

        info!("Adding interactive defaults to {}", dest.display());
        let tmp = tempfile::Builder::new().prefix("updates-img").tempdir()?;
        self.unpack(source, tmp.path()).await?;

        let ks_path = tmp.path().join(INTERACTIVE_DEFAULTS_PATH);
        if let Some(parent) = ks_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&ks_path, interactive_defaults(payload_url)).await?;

        self.pack_tree(tmp.path(), dest).await?;
        if !dest.exists() {
            return Err(E2eError::Patch(format!("{} was not written", dest.display())));
        }

        let digest = sha256_file(dest).await?;
        debug!("Patched image {} sha256:{}", dest.display(), digest);

        Ok(PatchedImage {
            path: dest.to_path_buf(),
            payload_url: payload_url.to_string(),
            digest,
        })
    }
}

/// Relative paths under `dir` in `find .` form, one per line
fn file_list(dir: &Path) -> E2eResult<String> {
    let mut list = String::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| E2eError::Patch(format!("walking {}: {}", dir.display(), e)))?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| E2eError::Patch(e.to_string()))?;
        if relative.as_os_str().is_empty() {
            list.push('.');
        } else {
            list.push_str("./");
            list.push_str(&relative.to_string_lossy());
        }
        list.push('\n');
    }
    Ok(list)
}

fn gunzip(data: &[u8]) -> E2eResult<Vec<u8>> {
    let mut out = Vec::new();
    MultiGzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn gzip(data: &[u8]) -> E2eResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub async fn sha256_file(path: &Path) -> E2eResult<String> {
    let bytes = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
