use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

pub const SESSION_DIR: [&str; 2] = [".strand", "sessions"];

/// Project-local session directory under `cwd`.
#[must_use]
pub fn session_root(cwd: &Path) -> PathBuf {
    cwd.join(SESSION_DIR[0]).join(SESSION_DIR[1])
}

/// Per-user session directory for `cwd`, under the platform data dir.
#[must_use]
pub fn default_session_root(cwd: &Path) -> Option<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "strand")?;
    Some(dirs.data_dir().join("sessions").join(encode_cwd(cwd)))
}

/// Flatten a working directory into a single path component.
#[must_use]
pub fn encode_cwd(path: &Path) -> String {
    let s = path.display().to_string();
    let s = s.trim_start_matches(['/', '\\']);
    let s = s.replace(['/', '\\', ':'], "-");
    format!("--{s}--")
}

#[must_use]
pub fn session_file_name(created_at: DateTime<Utc>, session_id: &str) -> String {
    format!(
        "{}_{}.jsonl",
        created_at.format("%Y-%m-%dT%H-%M-%S%.3fZ"),
        session_id
    )
}

/// Session logs in `dir`, newest first. A missing directory yields an empty list.
pub fn list_sessions(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut paths = Vec::new();
    for entry in read_dir {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "jsonl") {
            paths.push(path);
        }
    }
    // File names start with the creation timestamp.
    paths.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    Ok(paths)
}
