use std::collections::BTreeSet;

use crate::session::CompactionDetails;
use crate::types::Message;

/// Files read and modified by tool calls in a stretch of history.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileOperationSet {
    pub read_files: BTreeSet<String>,
    pub modified_files: BTreeSet<String>,
}

impl FileOperationSet {
    /// Seed from the manifest carried by an earlier compaction.
    pub fn from_details(details: &CompactionDetails) -> Self {
        Self {
            read_files: details.read_files.iter().cloned().collect(),
            modified_files: details.modified_files.iter().cloned().collect(),
        }
    }

    pub fn extend(&mut self, other: FileOperationSet) {
        self.read_files.extend(other.read_files);
        self.modified_files.extend(other.modified_files);
    }

    pub fn is_empty(&self) -> bool {
        self.read_files.is_empty() && self.modified_files.is_empty()
    }

    /// Files only read; anything also modified is listed as modified.
    pub fn read_only(&self) -> impl Iterator<Item = &String> {
        self.read_files
            .iter()
            .filter(|path| !self.modified_files.contains(*path))
    }

    pub fn to_details(&self) -> CompactionDetails {
        CompactionDetails {
            read_files: self.read_only().cloned().collect(),
            modified_files: self.modified_files.iter().cloned().collect(),
        }
    }
}

pub fn extract_file_operations(messages: &[Message]) -> FileOperationSet {
    let mut file_ops = FileOperationSet::default();

    for call in messages
        .iter()
        .filter_map(Message::as_assistant)
        .flat_map(|assistant| assistant.tool_calls())
    {
        match call.name.as_str() {
            "read" | "read_file" | "view" | "open_file" | "cat" => {
                if let Some(path) = extract_path_argument(&call.arguments) {
                    file_ops.read_files.insert(path);
                }
            }
            "write" | "edit" | "write_file" | "edit_file" | "replace_in_file" | "create_file"
            | "delete_file" => {
                if let Some(path) = extract_path_argument(&call.arguments) {
                    file_ops.modified_files.insert(path);
                }
            }
            "apply_patch" => {
                let Some(patch) = call
                    .arguments
                    .get("patch")
                    .and_then(serde_json::Value::as_str)
                else {
                    continue;
                };
                for line in patch.lines() {
                    let path = [
                        "*** Update File: ",
                        "*** Add File: ",
                        "*** Delete File: ",
                        "*** Move to: ",
                    ]
                    .iter()
                    .find_map(|prefix| line.strip_prefix(prefix));
                    if let Some(path) = path {
                        file_ops.modified_files.insert(path.trim().to_string());
                    }
                }
            }
            _ => {}
        }
    }

    file_ops
}

fn extract_path_argument(arguments: &serde_json::Value) -> Option<String> {
    ["path", "file_path", "filepath", "file", "target_file"]
        .iter()
        .filter_map(|key| arguments.get(*key).and_then(serde_json::Value::as_str))
        .find(|path| !path.trim().is_empty())
        .map(str::to_string)
}
