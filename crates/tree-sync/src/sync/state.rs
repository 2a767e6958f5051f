//! Per-file edit state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Local edits are kept; a disk change under pending edits is a conflict.
    #[default]
    Tracked,
    /// Disk always wins. Local edits are dropped on any external change.
    Reactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    LocalChanges,
    ExternalChanges,
    Conflict,
}

/// What a disk observation did to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskUpdate {
    /// Same content as the last disk snapshot.
    Unchanged,
    /// Disk changed with no local edits pending.
    ExternalChange,
    /// Disk changed to exactly the pending local content; the tracker rebased onto it.
    Converged,
    /// Disk changed under pending local edits.
    Conflict,
    /// Reactive mode reloaded the disk content.
    Reloaded { discarded_local_changes: bool },
}

#[derive(Debug, Clone)]
pub struct FileStateTracker {
    path: String,
    mode: SyncMode,
    base_content: String,
    local_content: String,
    disk_content: String,
    disk_mtime: i64,
    sync_state: SyncState,
}

impl FileStateTracker {
    pub fn new(path: &str, mode: SyncMode, content: String, mtime: i64) -> Self {
        Self {
            path: path.to_string(),
            mode,
            base_content: content.clone(),
            local_content: content.clone(),
            disk_content: content,
            disk_mtime: mtime,
            sync_state: SyncState::Synced,
        }
    }

    /// Records what's on disk now.
    pub fn update_disk_state(&mut self, content: String, mtime: i64) -> DiskUpdate {
        let reload_edits = self.mode == SyncMode::Reactive && self.has_local_changes();
        if content == self.disk_content && !reload_edits {
            self.disk_mtime = mtime;
            return DiskUpdate::Unchanged;
        }

        match self.mode {
            SyncMode::Reactive => {
                let discarded_local_changes = self.has_local_changes();
                self.rebase(content, mtime);
                DiskUpdate::Reloaded {
                    discarded_local_changes,
                }
            }
            SyncMode::Tracked if !self.has_local_changes() => {
                self.disk_content = content;
                self.disk_mtime = mtime;
                self.sync_state = SyncState::ExternalChanges;
                DiskUpdate::ExternalChange
            }
            SyncMode::Tracked if content == self.local_content => {
                self.rebase(content, mtime);
                DiskUpdate::Converged
            }
            SyncMode::Tracked => {
                self.disk_content = content;
                self.disk_mtime = mtime;
                self.sync_state = SyncState::Conflict;
                DiskUpdate::Conflict
            }
        }
    }

    /// Records an edit made by the caller. A pending conflict or external change stays until
    /// [`Self::mark_synced`].
    pub fn set_local_content(&mut self, content: String) {
        self.local_content = content;
        self.sync_state = match self.sync_state {
            sticky @ (SyncState::Conflict | SyncState::ExternalChanges) => sticky,
            _ if self.local_content == self.base_content => SyncState::Synced,
            _ => SyncState::LocalChanges,
        };
    }

    /// Everything agrees on `content` again: after our own write, a reload, or a resolved
    /// conflict.
    pub fn mark_synced(&mut self, content: String, mtime: i64) {
        self.rebase(content, mtime);
    }

    fn rebase(&mut self, content: String, mtime: i64) {
        self.base_content = content.clone();
        self.local_content = content.clone();
        self.disk_content = content;
        self.disk_mtime = mtime;
        self.sync_state = SyncState::Synced;
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn base_content(&self) -> &str {
        &self.base_content
    }

    pub fn local_content(&self) -> &str {
        &self.local_content
    }

    pub fn disk_content(&self) -> &str {
        &self.disk_content
    }

    pub fn disk_mtime(&self) -> i64 {
        self.disk_mtime
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    pub fn has_local_changes(&self) -> bool {
        self.local_content != self.base_content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked() -> FileStateTracker {
        FileStateTracker::new("/a.txt", SyncMode::Tracked, "v0".to_string(), 1)
    }

    #[test]
    fn local_edit_and_revert() {
        let mut tracker = tracked();
        tracker.set_local_content("v1".to_string());
        assert_eq!(tracker.sync_state(), SyncState::LocalChanges);
        assert!(tracker.has_local_changes());

        tracker.set_local_content("v0".to_string());
        assert_eq!(tracker.sync_state(), SyncState::Synced);
    }

    #[test]
    fn external_change_without_local_edits() {
        let mut tracker = tracked();
        assert_eq!(tracker.update_disk_state("ext".to_string(), 2), DiskUpdate::ExternalChange);
        assert_eq!(tracker.sync_state(), SyncState::ExternalChanges);
        assert_eq!(tracker.disk_content(), "ext");
        assert_eq!(tracker.local_content(), "v0");
        assert_eq!(tracker.disk_mtime(), 2);
    }

    #[test]
    fn disk_change_under_local_edits_conflicts() {
        let mut tracker = tracked();
        tracker.set_local_content("mine".to_string());
        assert_eq!(tracker.update_disk_state("theirs".to_string(), 2), DiskUpdate::Conflict);
        assert_eq!(tracker.sync_state(), SyncState::Conflict);
        assert_eq!(tracker.base_content(), "v0");
        assert_eq!(tracker.local_content(), "mine");
        assert_eq!(tracker.disk_content(), "theirs");

        // Further local edits don't hide the conflict
        tracker.set_local_content("v0".to_string());
        assert_eq!(tracker.sync_state(), SyncState::Conflict);

        tracker.mark_synced("merged".to_string(), 3);
        assert_eq!(tracker.sync_state(), SyncState::Synced);
        assert_eq!(tracker.base_content(), "merged");
    }

    #[test]
    fn identical_edits_converge() {
        let mut tracker = tracked();
        tracker.set_local_content("same".to_string());
        assert_eq!(tracker.update_disk_state("same".to_string(), 2), DiskUpdate::Converged);
        assert_eq!(tracker.sync_state(), SyncState::Synced);
        assert_eq!(tracker.base_content(), "same");
    }

    #[test]
    fn unchanged_disk_content_is_a_no_op() {
        let mut tracker = tracked();
        tracker.set_local_content("mine".to_string());
        assert_eq!(tracker.update_disk_state("v0".to_string(), 5), DiskUpdate::Unchanged);
        assert_eq!(tracker.sync_state(), SyncState::LocalChanges);
    }

    #[test]
    fn local_edits_keep_a_pending_external_change() {
        let mut tracker = tracked();
        tracker.update_disk_state("ext".to_string(), 2);

        tracker.set_local_content("x".to_string());
        assert_eq!(tracker.sync_state(), SyncState::ExternalChanges);

        // Back to the base content, but disk still differs
        tracker.set_local_content("v0".to_string());
        assert_eq!(tracker.sync_state(), SyncState::ExternalChanges);
        assert_eq!(tracker.disk_content(), "ext");

        tracker.mark_synced("ext".to_string(), 3);
        assert_eq!(tracker.sync_state(), SyncState::Synced);
        tracker.set_local_content("y".to_string());
        assert_eq!(tracker.sync_state(), SyncState::LocalChanges);
    }

    #[test]
    fn edits_after_an_external_change_conflict_with_the_next_one() {
        let mut tracker = tracked();
        tracker.update_disk_state("ext".to_string(), 2);
        tracker.set_local_content("mine".to_string());
        assert_eq!(tracker.update_disk_state("ext2".to_string(), 3), DiskUpdate::Conflict);
        assert_eq!(tracker.sync_state(), SyncState::Conflict);
    }

    #[test]
    fn reactive_mode_drops_edits_even_when_disk_is_unchanged() {
        let mut tracker = FileStateTracker::new("/log.txt", SyncMode::Reactive, "v0".to_string(), 1);
        tracker.set_local_content("mine".to_string());

        assert_eq!(
            tracker.update_disk_state("v0".to_string(), 2),
            DiskUpdate::Reloaded {
                discarded_local_changes: true
            }
        );
        assert_eq!(tracker.sync_state(), SyncState::Synced);
        assert_eq!(tracker.local_content(), "v0");
        assert_eq!(tracker.disk_mtime(), 2);

        // Nothing left to discard
        assert_eq!(tracker.update_disk_state("v0".to_string(), 3), DiskUpdate::Unchanged);
    }

    #[test]
    fn reactive_mode_reloads_and_reports_discarded_edits() {
        let mut tracker = FileStateTracker::new("/log.txt", SyncMode::Reactive, "a".to_string(), 1);
        assert_eq!(
            tracker.update_disk_state("b".to_string(), 2),
            DiskUpdate::Reloaded {
                discarded_local_changes: false
            }
        );

        tracker.set_local_content("mine".to_string());
        assert_eq!(
            tracker.update_disk_state("c".to_string(), 3),
            DiskUpdate::Reloaded {
                discarded_local_changes: true
            }
        );
        assert_eq!(tracker.sync_state(), SyncState::Synced);
        assert_eq!(tracker.local_content(), "c");
        assert_eq!(tracker.mode(), SyncMode::Reactive);
    }
}
