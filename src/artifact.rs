//! Zip bundles attached to urgent alerts
//!
//! A log bundle carries the last `tail_bytes` of every file that produced an
//! urgent hit plus `hits.json`; a metrics bundle carries the snapshot that
//! triggered a critical breach plus `breaches.json`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::SystemSnapshot;
use crate::error::AgentResult;
use crate::monitors::resources::Breach;

pub struct ArtifactBuilder {
    dir: PathBuf,
}

impl ArtifactBuilder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn log_bundle<H: Serialize>(
        &self,
        files: &[PathBuf],
        tail_bytes: u64,
        hits: &H,
    ) -> AgentResult<PathBuf> {
        let path = self.next_path("log")?;
        let mut zip = ZipWriter::new(File::create(&path)?);

        for (idx, file) in files.iter().enumerate() {
            let tail = match read_tail(file, tail_bytes) {
                Ok(tail) => tail,
                Err(e) => {
                    warn!("could not read {} for artifact: {e}", file.display());
                    continue;
                }
            };
            let name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "log".to_string());
            zip.start_file(format!("logs/{idx}_{name}"), options())?;
            zip.write_all(&tail)?;
        }

        zip.start_file("hits.json", options())?;
        zip.write_all(&serde_json::to_vec_pretty(hits)?)?;
        zip.finish()?;

        debug!("wrote log artifact {}", path.display());
        Ok(path)
    }

    pub fn metrics_bundle(
        &self,
        snapshot: &SystemSnapshot,
        breaches: &[Breach],
    ) -> AgentResult<PathBuf> {
        let path = self.next_path("metrics")?;
        let mut zip = ZipWriter::new(File::create(&path)?);

        zip.start_file("snapshot.json", options())?;
        zip.write_all(&serde_json::to_vec_pretty(snapshot)?)?;
        zip.start_file("breaches.json", options())?;
        zip.write_all(&serde_json::to_vec_pretty(breaches)?)?;
        zip.finish()?;

        debug!("wrote metrics artifact {}", path.display());
        Ok(path)
    }

    fn next_path(&self, kind: &str) -> AgentResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Ok(self.dir.join(format!("{kind}_{nanos}.zip")))
    }
}

fn options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated)
}

/// Last `max_bytes` of a file.
pub fn read_tail(path: &Path, max_bytes: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(max_bytes)))?;

    let mut buffer = Vec::new();
    file.take(max_bytes).read_to_end(&mut buffer)?;
    Ok(buffer)
}
