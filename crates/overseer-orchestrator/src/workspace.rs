//! Pool of numbered workspace directories (`ws0`, `ws1`, ...) under one root.
//!
//! A workspace is held by exactly one task while that task is processing. When no
//! free slot exists an allocation grows the pool by one directory.

use crate::types::WorkspaceInfo;
use overseer_core::{OverseerError, OverseerResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

const DIR_PREFIX: &str = "ws";

#[derive(Debug, Clone)]
struct Slot {
    id: u32,
    task_id: Option<Uuid>,
}

/// Tracks workspace directories and which task occupies each one.
pub struct WorkspaceManager {
    root: PathBuf,
    slots: Vec<Slot>,
}

impl WorkspaceManager {
    /// Open the pool rooted at `root`, creating the directory if needed and
    /// adopting any existing `ws<N>` subdirectories.
    pub fn open(root: impl Into<PathBuf>) -> OverseerResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            OverseerError::Workspace(format!(
                "Failed to create workspace root '{}': {e}",
                root.display()
            ))
        })?;

        let mut slots = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix(DIR_PREFIX))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            slots.push(Slot { id, task_id: None });
        }
        slots.sort_by_key(|s| s.id);

        info!(root = %root.display(), count = slots.len(), "Workspace pool opened");
        Ok(Self { root, slots })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of workspace `id`.
    pub fn path(&self, id: u32) -> PathBuf {
        self.root.join(format!("{DIR_PREFIX}{id}"))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of workspaces not held by any task.
    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| s.task_id.is_none()).count()
    }

    /// The task occupying workspace `id`, if any.
    pub fn owner(&self, id: u32) -> Option<Uuid> {
        self.slots.iter().find(|s| s.id == id).and_then(|s| s.task_id)
    }

    /// Hand a free workspace to `task_id`, growing the pool when none is free.
    pub fn alloc(&mut self, task_id: Uuid) -> OverseerResult<u32> {
        let id = match self.slots.iter().find(|s| s.task_id.is_none()) {
            Some(slot) => slot.id,
            None => self.create()?,
        };
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == id) {
            slot.task_id = Some(task_id);
        }
        debug!(workspace = id, task_id = %task_id, "Workspace allocated");
        Ok(id)
    }

    /// Release workspace `id`. Returns false if it was not occupied.
    pub fn free(&mut self, id: u32) -> bool {
        match self.slots.iter_mut().find(|s| s.id == id) {
            Some(slot) if slot.task_id.is_some() => {
                slot.task_id = None;
                debug!(workspace = id, "Workspace released");
                true
            }
            _ => false,
        }
    }

    /// Create a new workspace with the smallest unused number.
    pub fn create(&mut self) -> OverseerResult<u32> {
        let mut id = 0;
        while self.slots.iter().any(|s| s.id == id) {
            id += 1;
        }
        let path = self.path(id);
        std::fs::create_dir_all(&path).map_err(|e| {
            OverseerError::Workspace(format!(
                "Failed to create workspace '{}': {e}",
                path.display()
            ))
        })?;
        self.slots.push(Slot { id, task_id: None });
        self.slots.sort_by_key(|s| s.id);
        info!(workspace = id, "Workspace created");
        Ok(id)
    }

    /// Whether workspace `id` has nothing in its directory. A missing directory counts as empty.
    fn is_vacant(&self, id: u32) -> OverseerResult<bool> {
        match std::fs::read_dir(self.path(id)) {
            Ok(mut entries) => Ok(entries.next().is_none()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(OverseerError::Workspace(format!(
                "Failed to read workspace '{}': {e}",
                self.path(id).display()
            ))),
        }
    }

    /// Delete a free, empty workspace and its directory.
    ///
    /// A workspace that still holds files is refused and left untouched.
    pub fn delete(&mut self, id: u32) -> OverseerResult<()> {
        let slot = self
            .slots
            .iter()
            .find(|s| s.id == id)
            .ok_or(OverseerError::UnknownWorkspace(id))?;
        if let Some(task_id) = slot.task_id {
            return Err(OverseerError::invalid_state(
                "workspace",
                id,
                format!("occupied by task {task_id}"),
                "delete",
            ));
        }
        if !self.is_vacant(id)? {
            return Err(OverseerError::invalid_state(
                "workspace",
                id,
                "not empty",
                "delete",
            ));
        }
        let path = self.path(id);
        match std::fs::remove_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(OverseerError::Workspace(format!(
                    "Failed to remove workspace '{}': {e}",
                    path.display()
                )))
            }
        }
        self.slots.retain(|s| s.id != id);
        info!(workspace = id, "Workspace deleted");
        Ok(())
    }

    /// Grow or shrink the pool to exactly `count` workspaces.
    ///
    /// Shrinking removes the highest-numbered workspaces that are free and empty.
    /// When there are not enough of those it fails without touching anything.
    pub fn set_count(&mut self, count: usize) -> OverseerResult<()> {
        let current = self.slots.len();
        if count < current {
            let excess = current - count;
            let mut removable = Vec::new();
            for slot in self.slots.iter().rev() {
                if removable.len() == excess {
                    break;
                }
                if slot.task_id.is_none() && self.is_vacant(slot.id)? {
                    removable.push(slot.id);
                }
            }
            if removable.len() < excess {
                return Err(OverseerError::invalid_state(
                    "workspace pool",
                    format!("to {count}"),
                    format!(
                        "only {} of {current} free and empty",
                        removable.len()
                    ),
                    "shrink",
                ));
            }
            for id in removable {
                self.delete(id)?;
            }
        }
        while self.slots.len() < count {
            self.create()?;
        }
        Ok(())
    }

    /// Snapshot of every workspace in number order.
    pub fn list(&self) -> Vec<WorkspaceInfo> {
        self.slots
            .iter()
            .map(|s| WorkspaceInfo {
                id: s.id,
                path: self.path(s.id),
                is_occupied: s.task_id.is_some(),
                task_id: s.task_id,
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn dir_names(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_set_count_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = WorkspaceManager::open(tmp.path()).unwrap();
        pool.set_count(3).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(dir_names(tmp.path()), vec!["ws0", "ws1", "ws2"]);
    }

    #[test]
    fn test_open_adopts_existing_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("ws4")).unwrap();
        std::fs::create_dir(tmp.path().join("ws1")).unwrap();
        std::fs::create_dir(tmp.path().join("scratch")).unwrap();
        std::fs::write(tmp.path().join("ws9"), "not a dir").unwrap();

        let pool = WorkspaceManager::open(tmp.path()).unwrap();
        let ids: Vec<u32> = pool.list().iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[test]
    fn test_alloc_and_free() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = WorkspaceManager::open(tmp.path()).unwrap();
        pool.set_count(2).unwrap();

        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let w1 = pool.alloc(t1).unwrap();
        let w2 = pool.alloc(t2).unwrap();
        assert_ne!(w1, w2);
        assert_eq!(pool.owner(w1), Some(t1));
        assert_eq!(pool.free_count(), 0);

        assert!(pool.free(w1));
        assert!(!pool.free(w1));
        assert_eq!(pool.owner(w1), None);

        let w3 = pool.alloc(Uuid::new_v4()).unwrap();
        assert_eq!(w3, w1);
    }

    #[test]
    fn test_alloc_grows_when_exhausted() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = WorkspaceManager::open(tmp.path()).unwrap();
        assert!(pool.is_empty());

        let w = pool.alloc(Uuid::new_v4()).unwrap();
        assert_eq!(w, 0);
        assert_eq!(pool.len(), 1);
        assert!(pool.path(0).is_dir());
    }

    #[test]
    fn test_shrink_respects_occupied() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = WorkspaceManager::open(tmp.path()).unwrap();
        pool.set_count(3).unwrap();
        let held = pool.alloc(Uuid::new_v4()).unwrap();

        pool.set_count(2).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool.list().iter().any(|w| w.id == held && w.is_occupied));

        assert!(pool.set_count(0).is_err());
        assert_eq!(pool.len(), 2);

        pool.set_count(4).unwrap();
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_delete_keeps_workspace_with_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = WorkspaceManager::open(tmp.path()).unwrap();
        pool.set_count(1).unwrap();
        std::fs::write(pool.path(0).join("work.rs"), "fn main() {}").unwrap();

        let err = pool.delete(0).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(pool.len(), 1);
        assert!(pool.path(0).join("work.rs").is_file());

        std::fs::remove_file(pool.path(0).join("work.rs")).unwrap();
        pool.delete(0).unwrap();
        assert!(!pool.path(0).exists());
    }

    #[test]
    fn test_shrink_skips_workspaces_with_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = WorkspaceManager::open(tmp.path()).unwrap();
        pool.set_count(3).unwrap();
        std::fs::write(pool.path(2).join("work.rs"), "fn main() {}").unwrap();

        // ws2 holds files, so ws1 goes instead.
        pool.set_count(2).unwrap();
        let ids: Vec<u32> = pool.list().iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![0, 2]);
        assert!(pool.path(2).join("work.rs").is_file());

        // Too few removable workspaces: nothing changes.
        std::fs::write(pool.path(0).join("notes.md"), "keep").unwrap();
        assert!(pool.set_count(1).is_err());
        assert_eq!(pool.len(), 2);
        assert!(pool.path(0).is_dir());
        assert!(pool.path(2).join("work.rs").is_file());
    }

    #[test]
    fn test_delete_occupied_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pool = WorkspaceManager::open(tmp.path()).unwrap();
        pool.set_count(1).unwrap();
        let id = pool.alloc(Uuid::new_v4()).unwrap();

        let err = pool.delete(id).unwrap_err();
        assert!(err.is_validation());
        assert!(matches!(
            pool.delete(42),
            Err(OverseerError::UnknownWorkspace(42))
        ));

        pool.free(id);
        pool.delete(id).unwrap();
        assert!(pool.is_empty());
        assert!(!pool.path(id).exists());
    }
}
