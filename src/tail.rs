//! Incremental log file reading with persisted offsets
//!
//! Every monitored file gets a small JSON state file named after a hash of its
//! absolute path. The state survives restarts, so the agent resumes where it
//! stopped instead of re-alerting on old lines.
//!
//! ## Rotation
//!
//! ```text
//! size < stored offset     → truncated, restart at 0
//! inode changed (unix)     → replaced by rename, restart at 0
//! file missing             → skip, keep offset for when it reappears
//! ```
//!
//! Records of files that disappear for good are never removed.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::Encoding;
use crate::error::AgentResult;
use crate::util::sha256_hex;

/// Persisted position of one monitored file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailRecord {
    /// Byte offset of the next unread byte
    pub pos: u64,

    /// Lines consumed so far, used for hit line numbers
    #[serde(default)]
    pub lines: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Inode at the time of the last read (unix only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inode: Option<u64>,

    /// Modification time (unix seconds) at the time of the last read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<i64>,
}

/// Result of one incremental read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailChunk {
    pub lines: Vec<String>,
    pub new_offset: u64,
    /// The file shrank below the given offset and was read from the start
    pub reset: bool,
}

/// Read complete lines from `offset` to the end of `path`, at most `max_bytes`.
///
/// A missing file yields an empty chunk at the unchanged offset. When the cap
/// cuts a line in half, the partial line is left for the next call, unless it
/// is the only line in the chunk.
pub fn tail_new_lines(
    path: &Path,
    offset: u64,
    encoding: Encoding,
    max_bytes: u64,
) -> io::Result<TailChunk> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            trace!("{}: not found, keeping offset {offset}", path.display());
            return Ok(TailChunk {
                lines: vec![],
                new_offset: offset,
                reset: false,
            });
        }
        Err(e) => return Err(e),
    };

    let len = file.metadata()?.len();

    let (offset, reset) = if len < offset {
        debug!(
            "{}: size {len} below offset {offset}, file was truncated",
            path.display()
        );
        (0, true)
    } else {
        (offset, false)
    };

    if len == offset {
        return Ok(TailChunk {
            lines: vec![],
            new_offset: offset,
            reset,
        });
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut buffer = Vec::new();
    file.take(max_bytes).read_to_end(&mut buffer)?;

    let capped = buffer.len() as u64 == max_bytes && offset + max_bytes < len;
    let consumed = if capped {
        match buffer.iter().rposition(|&b| b == b'\n') {
            Some(idx) => idx + 1,
            None => buffer.len(),
        }
    } else {
        buffer.len()
    };
    buffer.truncate(consumed);

    Ok(TailChunk {
        lines: split_lines(&buffer, encoding),
        new_offset: offset + consumed as u64,
        reset,
    })
}

fn split_lines(buffer: &[u8], encoding: Encoding) -> Vec<String> {
    let body = buffer.strip_suffix(b"\n").unwrap_or(buffer);
    if body.is_empty() && buffer.is_empty() {
        return vec![];
    }

    body.split(|&b| b == b'\n')
        .map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            decode(line, encoding)
        })
        .collect()
}

fn decode(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// New lines of one file plus the line number of the first of them.
#[derive(Debug, Clone, Default)]
pub struct TailRead {
    pub chunk: TailChunk,
    pub first_line: u64,
}

/// Offsets of all monitored files, backed by one state file per file
#[derive(Debug)]
pub struct TailState {
    dir: PathBuf,
    records: HashMap<PathBuf, TailRecord>,
}

impl TailState {
    pub fn open(dir: impl Into<PathBuf>) -> AgentResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            records: HashMap::new(),
        })
    }

    fn state_file(&self, path: &Path) -> PathBuf {
        let key = absolute(path);
        let digest = sha256_hex(key.to_string_lossy().as_bytes());
        self.dir.join(format!("{}.json", &digest[..32]))
    }

    /// Stored record for `path`, or a fresh one at offset 0 when none exists.
    ///
    /// A state file that exists but cannot be read is an error, so the log is
    /// not re-read from the start and its old hits raised again.
    pub fn load(&mut self, path: &Path) -> AgentResult<TailRecord> {
        let key = absolute(path);
        if let Some(record) = self.records.get(&key) {
            return Ok(record.clone());
        }

        let state_file = self.state_file(path);
        let record = match fs::read_to_string(&state_file) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("{}: unreadable tail state, starting over: {e}", state_file.display());
                TailRecord::default()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => TailRecord::default(),
            Err(e) => {
                warn!("{}: cannot read tail state: {e}", state_file.display());
                return Err(e.into());
            }
        };

        self.records.insert(key, record.clone());
        Ok(record)
    }

    pub fn save(&mut self, path: &Path, record: TailRecord) -> AgentResult<()> {
        let state_file = self.state_file(path);
        let tmp = state_file.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&record)?)?;
        fs::rename(&tmp, &state_file)?;

        self.records.insert(absolute(path), record);
        Ok(())
    }

    /// Read everything new in `path` and persist the advanced offset.
    pub fn read_new(
        &mut self,
        path: &Path,
        encoding: Encoding,
        max_bytes: u64,
    ) -> AgentResult<TailRead> {
        let mut record = self.load(path)?;

        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(TailRead {
                    chunk: TailChunk {
                        lines: vec![],
                        new_offset: record.pos,
                        reset: false,
                    },
                    first_line: record.lines + 1,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let inode = inode_of(&metadata);
        if let (Some(previous), Some(current)) = (record.inode, inode)
            && previous != current
        {
            debug!("{}: inode changed, file was rotated", path.display());
            record.pos = 0;
            record.lines = 0;
        }

        let chunk = tail_new_lines(path, record.pos, encoding, max_bytes)?;
        if chunk.reset {
            record.lines = 0;
        }
        let first_line = record.lines + 1;

        record.pos = chunk.new_offset;
        record.lines += chunk.lines.len() as u64;
        record.path = Some(absolute(path).to_string_lossy().into_owned());
        record.inode = inode;
        record.modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|since| since.as_secs() as i64);

        self.save(path, record)?;

        Ok(TailRead { chunk, first_line })
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(unix)]
fn inode_of(metadata: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn inode_of(_metadata: &fs::Metadata) -> Option<u64> {
    None
}
