//! What a session does with a remote content update.
//!
//! The shipped policy is last-writer-wins: the incoming snapshot replaces the
//! whole local document, including edits that have not been saved yet. Two
//! receivers that get concurrent updates in different orders can end up on
//! different snapshots until the next update reaches both.

use uuid::Uuid;

use quire_core::{Content, PageId};

use crate::protocol::BroadcastMessage;

/// In-memory document of one displayed page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorState {
    page_id: PageId,
    /// Origin marker of the session owning this state.
    origin: Uuid,
    content: Content,
    /// Local edits that have not been handed to the gateway yet.
    unsaved: bool,
}

impl EditorState {
    pub fn new(page_id: PageId, origin: Uuid, content: Content) -> Self {
        Self {
            page_id,
            origin,
            content,
            unsaved: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn has_unsaved_edits(&self) -> bool {
        self.unsaved
    }

    /// Apply a local mutation.
    pub fn edit(&mut self, content: Content) {
        self.content = content;
        self.unsaved = true;
    }

    /// The current snapshot was handed off for saving.
    pub fn mark_saved(&mut self) {
        self.unsaved = false;
    }

    /// Replace everything with `content`, dropping unsaved edits.
    ///
    /// Returns whether unsaved edits were lost.
    pub fn overwrite(&mut self, content: Content) -> bool {
        let discarded = self.unsaved;
        self.content = content;
        self.unsaved = false;
        discarded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The local document now equals the incoming snapshot.
    Applied { discarded_local_edits: bool },
    /// The update is for a page this session is not showing.
    StaleTopic,
    /// The update is this session's own publish coming back.
    OwnEcho,
}

impl Reconciliation {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

pub trait ReconciliationPolicy: Send + Sync + 'static {
    fn reconcile(&self, state: &mut EditorState, update: &BroadcastMessage) -> Reconciliation;
}

/// Unconditional overwrite. No merge, no conflict surfaced.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl ReconciliationPolicy for LastWriterWins {
    fn reconcile(&self, state: &mut EditorState, update: &BroadcastMessage) -> Reconciliation {
        if update.page_id != state.page_id {
            log::debug!(
                "Ignoring update for page {} while showing {}",
                update.page_id,
                state.page_id
            );
            return Reconciliation::StaleTopic;
        }
        if update.origin == state.origin {
            return Reconciliation::OwnEcho;
        }
        let discarded_local_edits = state.overwrite(update.content.clone());
        if discarded_local_edits {
            log::debug!("Remote update on page {} replaced unsaved local edits", state.page_id);
        }
        Reconciliation::Applied { discarded_local_edits }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(page_id: PageId, text: &str) -> BroadcastMessage {
        BroadcastMessage {
            page_id,
            content: Content::new(text),
            origin: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_remote_update_overwrites() {
        let page = PageId::new();
        let mut state = EditorState::new(page, Uuid::new_v4(), Content::new("\"X\""));

        let outcome = LastWriterWins.reconcile(&mut state, &remote(page, "\"Y\""));
        assert_eq!(outcome, Reconciliation::Applied { discarded_local_edits: false });
        assert_eq!(state.content(), &Content::new("\"Y\""));
    }

    #[test]
    fn test_unsaved_edits_are_discarded() {
        let page = PageId::new();
        let mut state = EditorState::new(page, Uuid::new_v4(), Content::new("\"X\""));
        state.edit(Content::new("\"mine\""));
        assert!(state.has_unsaved_edits());

        let outcome = LastWriterWins.reconcile(&mut state, &remote(page, "\"theirs\""));
        assert_eq!(outcome, Reconciliation::Applied { discarded_local_edits: true });
        assert_eq!(state.content(), &Content::new("\"theirs\""));
        assert!(!state.has_unsaved_edits());
    }

    #[test]
    fn test_applying_twice_is_idempotent() {
        let page = PageId::new();
        let mut state = EditorState::new(page, Uuid::new_v4(), Content::null());
        let update = remote(page, "[1,2]");

        LastWriterWins.reconcile(&mut state, &update);
        let once = state.clone();
        LastWriterWins.reconcile(&mut state, &update);
        assert_eq!(state, once);
    }

    #[test]
    fn test_stale_topic_is_ignored() {
        let p1 = PageId::new();
        let p2 = PageId::new();
        let mut state = EditorState::new(p1, Uuid::new_v4(), Content::new("[]"));
        state.edit(Content::new("[0]"));
        let before = state.clone();

        let outcome = LastWriterWins.reconcile(&mut state, &remote(p2, "[9]"));
        assert_eq!(outcome, Reconciliation::StaleTopic);
        assert!(!outcome.is_applied());
        assert_eq!(state, before);
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let page = PageId::new();
        let me = Uuid::new_v4();
        let mut state = EditorState::new(page, me, Content::new("[]"));
        state.edit(Content::new("[1]"));
        let before = state.clone();

        let echo = BroadcastMessage {
            page_id: page,
            content: Content::new("[1]"),
            origin: me,
        };
        assert_eq!(LastWriterWins.reconcile(&mut state, &echo), Reconciliation::OwnEcho);
        assert_eq!(state, before);
    }

    #[test]
    fn test_null_content_applies() {
        let page = PageId::new();
        let mut state = EditorState::new(page, Uuid::new_v4(), Content::new("[]"));
        let update = BroadcastMessage {
            page_id: page,
            content: Content::null(),
            origin: Uuid::new_v4(),
        };
        assert!(LastWriterWins.reconcile(&mut state, &update).is_applied());
        assert!(state.content().is_null());
    }
}
