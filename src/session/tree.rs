use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::Utc;

use super::context::{materialize, SessionContext};
use super::entry::{generate_entry_id, EntryId, EntryPayload, SessionEntry};
use super::log::{SessionHeader, SessionLog};
use super::paths::session_file_name;
use crate::error::SessionError;

/// Append-only tree of session entries with a movable leaf pointer.
///
/// Entries are never modified or removed. Appends go to the log (when there is
/// one) before the in-memory tree changes, so a failed write leaves the tree
/// exactly as it was.
#[derive(Debug)]
pub struct SessionTree {
    id: String,
    entries: Vec<SessionEntry>,
    index: HashMap<EntryId, usize>,
    children: HashMap<EntryId, Vec<EntryId>>,
    leaf: Option<EntryId>,
    log: Option<SessionLog>,
}

impl SessionTree {
    /// A tree without persistence.
    pub fn in_memory() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entries: Vec::new(),
            index: HashMap::new(),
            children: HashMap::new(),
            leaf: None,
            log: None,
        }
    }

    /// Start a new persisted session in `dir`.
    pub fn create(dir: &Path, cwd: Option<&Path>) -> Result<Self, SessionError> {
        let id = uuid::Uuid::new_v4().to_string();
        let header = SessionHeader::new(id.clone(), cwd);
        let path = dir.join(session_file_name(header.timestamp, &id));
        let log = SessionLog::create(path, header)?;
        Ok(Self {
            log: Some(log),
            id,
            ..Self::in_memory()
        })
    }

    /// Open a persisted session. The leaf is the last entry in the log.
    pub fn open(path: &Path) -> Result<Self, SessionError> {
        let loaded = SessionLog::load(path)?;
        let mut tree = Self {
            id: loaded.log.header().id.clone(),
            log: Some(loaded.log),
            ..Self::in_memory()
        };
        for entry in loaded.entries {
            tree.insert_loaded(entry);
        }
        Ok(tree)
    }

    /// Build an in-memory tree from entries that are already parent-ordered.
    pub fn from_entries(entries: Vec<SessionEntry>) -> Result<Self, SessionError> {
        let mut tree = Self::in_memory();
        for entry in entries {
            if let Some(parent_id) = &entry.parent_id {
                if !tree.index.contains_key(parent_id) {
                    return Err(SessionError::UnknownEntryId(parent_id.clone()));
                }
            }
            tree.insert_loaded(entry);
        }
        Ok(tree)
    }

    fn insert_loaded(&mut self, entry: SessionEntry) {
        let id = entry.id.clone();
        if let Some(parent_id) = &entry.parent_id {
            self.children
                .entry(parent_id.clone())
                .or_default()
                .push(id.clone());
        }
        self.index.insert(id.clone(), self.entries.len());
        self.entries.push(entry);
        self.leaf = Some(id);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> Option<&Path> {
        self.log.as_ref().map(SessionLog::path)
    }

    pub fn leaf_id(&self) -> Option<&str> {
        self.leaf.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&SessionEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// All entries in append order.
    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    pub fn children(&self, id: &str) -> &[EntryId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Append under the current leaf and advance the leaf to the new entry.
    pub fn append(&mut self, payload: EntryPayload) -> Result<EntryId, SessionError> {
        let parent = self.leaf.clone();
        self.insert(parent, payload)
    }

    /// Append under an explicit parent (`None` starts a new root).
    pub fn append_with_parent(
        &mut self,
        payload: EntryPayload,
        parent_id: Option<&str>,
    ) -> Result<EntryId, SessionError> {
        if let Some(parent_id) = parent_id {
            if !self.contains(parent_id) {
                return Err(SessionError::UnknownEntryId(parent_id.to_string()));
            }
        }
        self.insert(parent_id.map(str::to_string), payload)
    }

    fn insert(
        &mut self,
        parent_id: Option<EntryId>,
        payload: EntryPayload,
    ) -> Result<EntryId, SessionError> {
        let entry = SessionEntry {
            id: generate_entry_id(|id| self.index.contains_key(id)),
            parent_id,
            timestamp: Utc::now(),
            payload,
        };
        if let Some(log) = self.log.as_mut() {
            log.append(&entry)?;
        }
        let id = entry.id.clone();
        self.insert_loaded(entry);
        Ok(id)
    }

    /// Move the leaf. History is untouched.
    pub fn set_leaf(&mut self, id: &str) -> Result<(), SessionError> {
        if !self.contains(id) {
            return Err(SessionError::UnknownEntryId(id.to_string()));
        }
        self.leaf = Some(id.to_string());
        Ok(())
    }

    /// Alias for [`set_leaf`](Self::set_leaf).
    pub fn branch(&mut self, id: &str) -> Result<(), SessionError> {
        self.set_leaf(id)
    }

    /// Clear the leaf so the next append starts a new root.
    pub fn reset_leaf(&mut self) {
        self.leaf = None;
    }

    /// Branch to `target_id`, recording a marker that remembers the abandoned leaf
    /// and, optionally, a summary of what happened on it.
    pub fn branch_with_summary(
        &mut self,
        target_id: &str,
        summary: Option<String>,
    ) -> Result<EntryId, SessionError> {
        if !self.contains(target_id) {
            return Err(SessionError::UnknownEntryId(target_id.to_string()));
        }
        let from_id = self.leaf.clone().unwrap_or_else(|| target_id.to_string());
        self.insert(
            Some(target_id.to_string()),
            EntryPayload::BranchMarker { from_id, summary },
        )
    }

    /// Attach (or clear, with `None`) a label on an existing entry.
    pub fn append_label(
        &mut self,
        target_id: &str,
        label: Option<String>,
    ) -> Result<EntryId, SessionError> {
        if !self.contains(target_id) {
            return Err(SessionError::UnknownEntryId(target_id.to_string()));
        }
        self.append(EntryPayload::Label {
            target_id: target_id.to_string(),
            label,
        })
    }

    /// Latest label attached to `id`.
    pub fn label_for(&self, id: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find_map(|entry| match &entry.payload {
                EntryPayload::Label { target_id, label } if target_id == id => Some(label),
                _ => None,
            })
            .and_then(|label| label.as_deref())
    }

    /// Entries from the root down to `leaf_id`, inclusive.
    pub fn path_to_leaf(&self, leaf_id: &str) -> Result<Vec<&SessionEntry>, SessionError> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(leaf_id.to_string());
        while let Some(id) = cursor {
            if !visited.insert(id.clone()) {
                return Err(SessionError::Cycle(leaf_id.to_string()));
            }
            let entry = self
                .get(&id)
                .ok_or_else(|| SessionError::UnknownEntryId(id.clone()))?;
            path.push(entry);
            cursor = entry.parent_id.clone();
        }
        path.reverse();
        Ok(path)
    }

    /// Path to the current leaf; empty when there is no leaf.
    pub fn current_path(&self) -> Result<Vec<&SessionEntry>, SessionError> {
        match self.leaf.as_deref() {
            Some(leaf) => self.path_to_leaf(leaf),
            None => Ok(Vec::new()),
        }
    }

    /// Materialize the message sequence for `leaf_id` (the current leaf when `None`).
    pub fn build_context(&self, leaf_id: Option<&str>) -> Result<SessionContext, SessionError> {
        let path = match leaf_id.or(self.leaf.as_deref()) {
            Some(leaf) => self.path_to_leaf(leaf)?,
            None => Vec::new(),
        };
        Ok(materialize(&path))
    }
}
