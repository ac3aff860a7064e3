//! In-memory data store for pages and folders.
//!
//! Every entity is scoped by its owner. Deleting a folder removes its
//! sub-folders and all pages below them; deleting a user's data removes every
//! folder and page that user owns.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Content, Folder, FolderId, Page, PageId, Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataStoreError {
    #[error("page not found: {0}")]
    PageNotFound(PageId),
    #[error("folder not found: {0}")]
    FolderNotFound(FolderId),
    #[error("user {actor} is not allowed to modify this entity")]
    Unauthorized { actor: UserId },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Default)]
struct Tables {
    pages: HashMap<PageId, Page>,
    folders: HashMap<FolderId, Folder>,
}

impl Tables {
    fn siblings_of(&self, owner: UserId, parent: Option<FolderId>) -> usize {
        self.pages
            .values()
            .filter(|p| p.owner == owner && p.parent == parent)
            .count()
    }

    fn owned_folder(&self, actor: UserId, id: FolderId) -> Result<&Folder, DataStoreError> {
        let folder = self.folders.get(&id).ok_or(DataStoreError::FolderNotFound(id))?;
        if folder.owner != actor {
            return Err(DataStoreError::Unauthorized { actor });
        }
        Ok(folder)
    }

    fn owned_page_mut(&mut self, actor: UserId, id: PageId) -> Result<&mut Page, DataStoreError> {
        let page = self.pages.get_mut(&id).ok_or(DataStoreError::PageNotFound(id))?;
        if page.owner != actor {
            return Err(DataStoreError::Unauthorized { actor });
        }
        Ok(page)
    }

    /// Rewrite sibling positions as 0..n keeping their relative order.
    fn densify(&mut self, owner: UserId, parent: Option<FolderId>) {
        let mut siblings: Vec<(u32, PageId)> = self
            .pages
            .values()
            .filter(|p| p.owner == owner && p.parent == parent)
            .map(|p| (p.position, p.id))
            .collect();
        siblings.sort();
        for (index, (_, id)) in siblings.into_iter().enumerate() {
            if let Some(page) = self.pages.get_mut(&id) {
                page.position = index as u32;
            }
        }
    }
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, DataStoreError> {
        self.tables.read().map_err(|_| DataStoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, DataStoreError> {
        self.tables.write().map_err(|_| DataStoreError::Poisoned)
    }

    pub fn create_folder(
        &self,
        owner: UserId,
        name: impl Into<String>,
        parent: Option<FolderId>,
    ) -> Result<Folder, DataStoreError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DataStoreError::Validation("folder name must not be empty".into()));
        }
        let mut tables = self.write()?;
        if let Some(parent_id) = parent {
            tables.owned_folder(owner, parent_id)?;
        }
        let position = tables
            .folders
            .values()
            .filter(|f| f.owner == owner && f.parent == parent)
            .count() as u32;
        let folder = Folder {
            parent,
            position,
            ..Folder::new(owner, name)
        };
        tables.folders.insert(folder.id, folder.clone());
        log::debug!("Created folder {} for {owner}", folder.id);
        Ok(folder)
    }

    pub fn create_page(
        &self,
        owner: UserId,
        title: impl Into<String>,
        parent: Option<FolderId>,
    ) -> Result<Page, DataStoreError> {
        let mut tables = self.write()?;
        if let Some(parent_id) = parent {
            tables.owned_folder(owner, parent_id)?;
        }
        let position = tables.siblings_of(owner, parent) as u32;
        let page = Page {
            parent,
            position,
            ..Page::new(owner, title)
        };
        tables.pages.insert(page.id, page.clone());
        log::debug!("Created page {} for {owner}", page.id);
        Ok(page)
    }

    pub fn get_page(&self, id: PageId) -> Result<Page, DataStoreError> {
        self.read()?
            .pages
            .get(&id)
            .cloned()
            .ok_or(DataStoreError::PageNotFound(id))
    }

    pub fn get_folder(&self, id: FolderId) -> Result<Folder, DataStoreError> {
        self.read()?
            .folders
            .get(&id)
            .cloned()
            .ok_or(DataStoreError::FolderNotFound(id))
    }

    /// Pages of `owner` directly under `parent`, in position order.
    pub fn list_pages(
        &self,
        owner: UserId,
        parent: Option<FolderId>,
    ) -> Result<Vec<Page>, DataStoreError> {
        let tables = self.read()?;
        let mut pages: Vec<Page> = tables
            .pages
            .values()
            .filter(|p| p.owner == owner && p.parent == parent)
            .cloned()
            .collect();
        pages.sort_by_key(|p| p.position);
        Ok(pages)
    }

    pub fn rename_page(
        &self,
        actor: UserId,
        id: PageId,
        title: impl Into<String>,
    ) -> Result<Page, DataStoreError> {
        let mut tables = self.write()?;
        let page = tables.owned_page_mut(actor, id)?;
        page.title = title.into();
        page.updated_at = Timestamp::after(page.updated_at);
        Ok(page.clone())
    }

    pub fn set_tags(
        &self,
        actor: UserId,
        id: PageId,
        tags: impl IntoIterator<Item = String>,
    ) -> Result<Page, DataStoreError> {
        let mut tables = self.write()?;
        let page = tables.owned_page_mut(actor, id)?;
        page.tags = tags.into_iter().collect::<BTreeSet<_>>();
        page.updated_at = Timestamp::after(page.updated_at);
        Ok(page.clone())
    }

    /// Move a page under `parent` at `position` (clamped to the sibling count).
    pub fn move_page(
        &self,
        actor: UserId,
        id: PageId,
        parent: Option<FolderId>,
        position: u32,
    ) -> Result<Page, DataStoreError> {
        let mut tables = self.write()?;
        if let Some(parent_id) = parent {
            tables.owned_folder(actor, parent_id)?;
        }
        let old_parent = tables.owned_page_mut(actor, id)?.parent;

        // Park the page out of both sibling lists while positions are rebuilt.
        let mut page = tables.pages.remove(&id).ok_or(DataStoreError::PageNotFound(id))?;
        tables.densify(actor, old_parent);
        let target = position.min(tables.siblings_of(actor, parent) as u32);
        for sibling in tables
            .pages
            .values_mut()
            .filter(|p| p.owner == actor && p.parent == parent && p.position >= target)
        {
            sibling.position += 1;
        }

        page.parent = parent;
        page.position = target;
        page.updated_at = Timestamp::after(page.updated_at);
        tables.pages.insert(id, page.clone());
        Ok(page)
    }

    /// Replace a page's content.
    ///
    /// `updated_at` strictly increases with every accepted write.
    pub fn write_content(
        &self,
        actor: UserId,
        id: PageId,
        content: Content,
    ) -> Result<Page, DataStoreError> {
        content.validate().map_err(DataStoreError::Validation)?;
        let mut tables = self.write()?;
        let page = tables.owned_page_mut(actor, id)?;
        page.content = content;
        page.updated_at = Timestamp::after(page.updated_at);
        log::trace!("Stored {} bytes of content for page {id}", page.content.len());
        Ok(page.clone())
    }

    pub fn delete_page(&self, actor: UserId, id: PageId) -> Result<(), DataStoreError> {
        let mut tables = self.write()?;
        let parent = tables.owned_page_mut(actor, id)?.parent;
        tables.pages.remove(&id);
        tables.densify(actor, parent);
        Ok(())
    }

    /// Delete a folder, its sub-folders, and every page below them.
    ///
    /// Returns the number of pages removed.
    pub fn delete_folder(&self, actor: UserId, id: FolderId) -> Result<usize, DataStoreError> {
        let mut tables = self.write()?;
        tables.owned_folder(actor, id)?;

        let mut doomed = vec![id];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let current = doomed[cursor];
            doomed.extend(
                tables
                    .folders
                    .values()
                    .filter(|f| f.parent == Some(current))
                    .map(|f| f.id),
            );
            cursor += 1;
        }

        for folder_id in &doomed {
            tables.folders.remove(folder_id);
        }
        let before = tables.pages.len();
        tables
            .pages
            .retain(|_, p| p.parent.map_or(true, |parent| !doomed.contains(&parent)));
        let removed = before - tables.pages.len();

        log::info!("Deleted folder {id} ({} folders, {removed} pages)", doomed.len());
        Ok(removed)
    }

    /// Remove every folder and page owned by `owner`.
    pub fn delete_user_data(&self, owner: UserId) -> Result<(usize, usize), DataStoreError> {
        let mut tables = self.write()?;
        let folders_before = tables.folders.len();
        let pages_before = tables.pages.len();
        tables.folders.retain(|_, f| f.owner != owner);
        tables.pages.retain(|_, p| p.owner != owner);
        let removed = (
            folders_before - tables.folders.len(),
            pages_before - tables.pages.len(),
        );
        log::info!("Deleted data of user {owner}: {} folders, {} pages", removed.0, removed.1);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_get_page() {
        let store = MemoryStore::new();
        let owner = UserId::new();
        let page = store.create_page(owner, "Notes", None).unwrap();

        let loaded = store.get_page(page.id).unwrap();
        assert_eq!(loaded, page);
        assert_eq!(loaded.position, 0);
    }

    #[test]
    fn test_positions_follow_creation_order() {
        let store = MemoryStore::new();
        let owner = UserId::new();
        let a = store.create_page(owner, "a", None).unwrap();
        let b = store.create_page(owner, "b", None).unwrap();
        let c = store.create_page(owner, "c", None).unwrap();

        let listed: Vec<PageId> = store.list_pages(owner, None).unwrap().iter().map(|p| p.id).collect();
        assert_eq!(listed, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn test_write_content_bumps_updated_at() {
        let store = MemoryStore::new();
        let owner = UserId::new();
        let page = store.create_page(owner, "Draft", None).unwrap();

        let first = store.write_content(owner, page.id, Content::new("[]")).unwrap();
        let second = store.write_content(owner, page.id, Content::new("[]")).unwrap();
        assert!(first.updated_at > page.updated_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[test]
    fn test_write_content_errors() {
        let store = MemoryStore::new();
        let owner = UserId::new();
        let stranger = UserId::new();
        let page = store.create_page(owner, "Private", None).unwrap();

        let missing = PageId::new();
        assert_eq!(
            store.write_content(owner, missing, Content::null()).unwrap_err(),
            DataStoreError::PageNotFound(missing)
        );
        assert!(matches!(
            store.write_content(stranger, page.id, Content::null()),
            Err(DataStoreError::Unauthorized { .. })
        ));
        assert!(matches!(
            store.write_content(owner, page.id, Content::new("{oops")),
            Err(DataStoreError::Validation(_))
        ));
        // Failed writes leave the stored content alone.
        assert!(store.get_page(page.id).unwrap().content.is_null());
    }

    #[test]
    fn test_folder_requires_owned_parent() {
        let store = MemoryStore::new();
        let owner = UserId::new();
        let other = UserId::new();
        let root = store.create_folder(owner, "Root", None).unwrap();

        assert!(store.create_folder(owner, "Child", Some(root.id)).is_ok());
        assert!(matches!(
            store.create_page(other, "Sneaky", Some(root.id)),
            Err(DataStoreError::Unauthorized { .. })
        ));
        assert!(matches!(
            store.create_folder(owner, "  ", None),
            Err(DataStoreError::Validation(_))
        ));
    }

    #[test]
    fn test_delete_folder_cascades() {
        let store = MemoryStore::new();
        let owner = UserId::new();
        let root = store.create_folder(owner, "Root", None).unwrap();
        let child = store.create_folder(owner, "Child", Some(root.id)).unwrap();
        let sibling = store.create_folder(owner, "Sibling", None).unwrap();

        let p1 = store.create_page(owner, "in root", Some(root.id)).unwrap();
        let p2 = store.create_page(owner, "in child", Some(child.id)).unwrap();
        let kept = store.create_page(owner, "elsewhere", Some(sibling.id)).unwrap();

        let removed = store.delete_folder(owner, root.id).unwrap();
        assert_eq!(removed, 2);
        assert!(store.get_folder(child.id).is_err());
        assert!(store.get_page(p1.id).is_err());
        assert!(store.get_page(p2.id).is_err());
        assert!(store.get_page(kept.id).is_ok());
        assert!(store.get_folder(sibling.id).is_ok());
    }

    #[test]
    fn test_delete_user_data_only_touches_owner() {
        let store = MemoryStore::new();
        let alice = UserId::new();
        let bob = UserId::new();
        let folder = store.create_folder(alice, "Work", None).unwrap();
        store.create_page(alice, "a1", Some(folder.id)).unwrap();
        store.create_page(alice, "a2", None).unwrap();
        let bobs = store.create_page(bob, "b1", None).unwrap();

        assert_eq!(store.delete_user_data(alice).unwrap(), (1, 2));
        assert!(store.list_pages(alice, None).unwrap().is_empty());
        assert!(store.get_page(bobs.id).is_ok());
    }

    #[test]
    fn test_move_page_reorders_siblings() {
        let store = MemoryStore::new();
        let owner = UserId::new();
        let folder = store.create_folder(owner, "Target", None).unwrap();
        let a = store.create_page(owner, "a", None).unwrap();
        let b = store.create_page(owner, "b", None).unwrap();
        let c = store.create_page(owner, "c", None).unwrap();
        let x = store.create_page(owner, "x", Some(folder.id)).unwrap();

        // Move `c` to the front of the root list.
        store.move_page(owner, c.id, None, 0).unwrap();
        let root: Vec<PageId> = store.list_pages(owner, None).unwrap().iter().map(|p| p.id).collect();
        assert_eq!(root, vec![c.id, a.id, b.id]);

        // Move `a` into the folder, past the end.
        let moved = store.move_page(owner, a.id, Some(folder.id), 99).unwrap();
        assert_eq!(moved.position, 1);
        let root: Vec<u32> = store.list_pages(owner, None).unwrap().iter().map(|p| p.position).collect();
        assert_eq!(root, vec![0, 1]);
        let inside: Vec<PageId> = store
            .list_pages(owner, Some(folder.id))
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(inside, vec![x.id, a.id]);
    }

    #[test]
    fn test_rename_and_tags() {
        let store = MemoryStore::new();
        let owner = UserId::new();
        let page = store.create_page(owner, "old", None).unwrap();

        let renamed = store.rename_page(owner, page.id, "new").unwrap();
        assert_eq!(renamed.title, "new");

        let tagged = store
            .set_tags(owner, page.id, vec!["work".to_string(), "todo".to_string(), "work".to_string()])
            .unwrap();
        assert_eq!(tagged.tags.len(), 2);
        assert!(tagged.updated_at > renamed.updated_at);
    }
}
