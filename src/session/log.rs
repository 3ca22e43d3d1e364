//! Append-only JSONL persistence for session trees.
//!
//! Layout: one header line followed by one line per entry.
//!
//! ```text
//! {"type":"session","version":2,"id":"…","timestamp":"…","cwd":"/repo"}
//! {"type":"message","id":"3f2a9c1e","parentId":null,"timestamp":"…","message":{…}}
//! ```
//!
//! Version 1 logs predate branching: records carried no `id`/`parentId` and
//! formed a single linear history, and compaction records pointed at the first
//! kept record by position (`first_kept_index`). Loading a version 1 log chains
//! the records, assigns ids, and rewrites the file at the current version.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entry::{generate_entry_id, EntryId, EntryPayload, SessionEntry, KNOWN_RECORD_TYPES};
use crate::error::SessionError;

/// Log format version written by this build.
pub const CURRENT_SESSION_VERSION: u32 = 2;

const HEADER_RECORD_TYPE: &str = "session";

/// First line of every session log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionHeader {
    #[serde(rename = "type")]
    pub record_type: String,
    pub version: u32,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl SessionHeader {
    pub fn new(id: impl Into<String>, cwd: Option<&Path>) -> Self {
        Self {
            record_type: HEADER_RECORD_TYPE.to_string(),
            version: CURRENT_SESSION_VERSION,
            id: id.into(),
            timestamp: Utc::now(),
            cwd: cwd.map(|p| p.display().to_string()),
        }
    }
}

#[derive(Deserialize)]
struct RecordBase {
    id: EntryId,
    #[serde(rename = "parentId", default)]
    parent_id: Option<EntryId>,
    timestamp: DateTime<Utc>,
}

/// An open session log positioned for appends.
#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
    file: File,
    header: SessionHeader,
}

/// Result of [`SessionLog::load`].
#[derive(Debug)]
pub struct LoadedLog {
    pub log: SessionLog,
    pub entries: Vec<SessionEntry>,
    /// Source version when the file was migrated during load.
    pub migrated_from: Option<u32>,
}

impl SessionLog {
    /// Create a new log file containing only `header`.
    pub fn create(path: impl Into<PathBuf>, header: SessionHeader) -> Result<Self, SessionError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| io_error(&path, source))?;
        }
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|source| io_error(&path, source))?;
        let line = serde_json::to_string(&header).map_err(|source| SessionError::Encode {
            id: header.id.clone(),
            source,
        })?;
        writeln!(file, "{line}")
            .and_then(|()| file.flush())
            .map_err(|source| io_error(&path, source))?;
        Ok(Self { path, file, header })
    }

    /// Load an existing log, migrating older versions forward.
    pub fn load(path: impl Into<PathBuf>) -> Result<LoadedLog, SessionError> {
        let path = path.into();
        let raw = fs::read_to_string(&path).map_err(|source| io_error(&path, source))?;

        let mut lines = Vec::new();
        let mut good_len = 0usize;
        let mut offset = 0usize;
        let mut torn_tail = false;
        let raw_lines: Vec<&str> = raw.split_inclusive('\n').collect();
        for (index, chunk) in raw_lines.iter().enumerate() {
            let line_number = index + 1;
            offset += chunk.len();
            let text = chunk.trim();
            if text.is_empty() {
                good_len = offset;
                continue;
            }
            match serde_json::from_str::<Value>(text) {
                Ok(value) => {
                    lines.push((line_number, value));
                    good_len = offset;
                }
                // A crash mid-append leaves a partial last line without a newline.
                Err(_) if index + 1 == raw_lines.len() && !chunk.ends_with('\n') && index > 0 => {
                    tracing::warn!(
                        path = %path.display(),
                        line = line_number,
                        "dropping torn final session record"
                    );
                    torn_tail = true;
                }
                Err(source) => {
                    return Err(SessionError::JsonLineParse {
                        path,
                        line: line_number,
                        source,
                    })
                }
            }
        }

        let mut records = lines.into_iter();
        let (header_line, header_value) = records
            .next()
            .ok_or_else(|| SessionError::MissingHeader { path: path.clone() })?;
        if header_value.get("type").and_then(Value::as_str) != Some(HEADER_RECORD_TYPE) {
            return Err(SessionError::InvalidHeader {
                path,
                line: header_line,
            });
        }
        let mut header: SessionHeader =
            serde_json::from_value(header_value).map_err(|source| SessionError::JsonLineParse {
                path: path.clone(),
                line: header_line,
                source,
            })?;
        if header.version == 0 || header.version > CURRENT_SESSION_VERSION {
            return Err(SessionError::UnsupportedVersion {
                path,
                found: header.version,
                supported: CURRENT_SESSION_VERSION,
            });
        }

        let mut records: Vec<(usize, Value)> = records.collect();
        let migrated_from = (header.version < CURRENT_SESSION_VERSION).then_some(header.version);
        if header.version == 1 {
            migrate_v1_records(&mut records);
        }

        let mut entries = Vec::with_capacity(records.len());
        let mut seen: HashSet<EntryId> = HashSet::new();
        for (line, value) in records {
            let entry = decode_record(&path, line, value)?;
            if seen.contains(&entry.id) {
                return Err(SessionError::DuplicateEntryId {
                    path,
                    line,
                    id: entry.id,
                });
            }
            if let Some(parent_id) = &entry.parent_id {
                if !seen.contains(parent_id) {
                    return Err(SessionError::DanglingParentId {
                        path,
                        line,
                        id: entry.id.clone(),
                        parent_id: parent_id.clone(),
                    });
                }
            }
            seen.insert(entry.id.clone());
            entries.push(entry);
        }

        if migrated_from.is_some() {
            header.version = CURRENT_SESSION_VERSION;
            rewrite_log(&path, &header, &entries)?;
            tracing::info!(
                path = %path.display(),
                from = ?migrated_from,
                to = CURRENT_SESSION_VERSION,
                entries = entries.len(),
                "migrated session log"
            );
        } else if torn_tail {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|source| io_error(&path, source))?;
            file.set_len(good_len as u64)
                .map_err(|source| io_error(&path, source))?;
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|source| io_error(&path, source))?;
        // A crash between a record and its newline leaves a complete last line
        // with no terminator; the next append must start on a fresh line.
        if migrated_from.is_none() && good_len > 0 && !raw[..good_len].ends_with('\n') {
            tracing::warn!(
                path = %path.display(),
                "terminating unterminated final session record"
            );
            file.write_all(b"\n")
                .and_then(|()| file.flush())
                .map_err(|source| io_error(&path, source))?;
        }

        Ok(LoadedLog {
            log: Self { path, file, header },
            entries,
            migrated_from,
        })
    }

    /// Append one entry and flush it to the OS before returning.
    pub fn append(&mut self, entry: &SessionEntry) -> Result<(), SessionError> {
        let line = encode_entry(entry)?;
        writeln!(self.file, "{line}")
            .and_then(|()| self.file.flush())
            .map_err(|source| io_error(&self.path, source))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }
}

fn io_error(path: &Path, source: std::io::Error) -> SessionError {
    SessionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn encode_entry(entry: &SessionEntry) -> Result<String, SessionError> {
    let encoded = match &entry.payload {
        EntryPayload::Unknown { data, .. } => serde_json::to_string(data),
        _ => serde_json::to_string(entry),
    };
    encoded.map_err(|source| SessionError::Encode {
        id: entry.id.clone(),
        source,
    })
}

fn decode_record(path: &Path, line: usize, value: Value) -> Result<SessionEntry, SessionError> {
    let parse_error = |source| SessionError::JsonLineParse {
        path: path.to_path_buf(),
        line,
        source,
    };
    let record_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if KNOWN_RECORD_TYPES.contains(&record_type.as_str()) {
        return serde_json::from_value(value).map_err(parse_error);
    }

    let base: RecordBase = serde_json::from_value(value.clone()).map_err(parse_error)?;
    tracing::debug!(
        path = %path.display(),
        line,
        record_type = %record_type,
        "keeping unknown session record"
    );
    Ok(SessionEntry {
        id: base.id,
        parent_id: base.parent_id,
        timestamp: base.timestamp,
        payload: EntryPayload::Unknown {
            record_type,
            data: value,
        },
    })
}

fn migrate_v1_records(records: &mut [(usize, Value)]) {
    let mut assigned: HashSet<EntryId> = HashSet::new();
    let mut ids = Vec::with_capacity(records.len());
    for _ in 0..records.len() {
        let id = generate_entry_id(|candidate| assigned.contains(candidate));
        assigned.insert(id.clone());
        ids.push(id);
    }

    for (index, (_, value)) in records.iter_mut().enumerate() {
        let Some(object) = value.as_object_mut() else {
            continue;
        };
        object.insert("id".into(), Value::String(ids[index].clone()));
        let parent = index
            .checked_sub(1)
            .map(|prev| Value::String(ids[prev].clone()))
            .unwrap_or(Value::Null);
        object.insert("parentId".into(), parent);

        if let Some(kept_index) = object
            .remove("first_kept_index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
        {
            let kept_id = ids.get(kept_index).unwrap_or(&ids[index]).clone();
            object.insert("first_kept_entry_id".into(), Value::String(kept_id));
            object
                .entry("tokens_after")
                .or_insert_with(|| Value::from(0u64));
        }
    }
}

fn rewrite_log(
    path: &Path,
    header: &SessionHeader,
    entries: &[SessionEntry],
) -> Result<(), SessionError> {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".migrating");
    let tmp_path = path.with_file_name(tmp_name);

    let mut out = String::new();
    let header_line = serde_json::to_string(header).map_err(|source| SessionError::Encode {
        id: header.id.clone(),
        source,
    })?;
    out.push_str(&header_line);
    out.push('\n');
    for entry in entries {
        out.push_str(&encode_entry(entry)?);
        out.push('\n');
    }

    let mut file = File::create(&tmp_path).map_err(|source| io_error(&tmp_path, source))?;
    file.write_all(out.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|source| io_error(&tmp_path, source))?;
    fs::rename(&tmp_path, path).map_err(|source| io_error(path, source))
}
