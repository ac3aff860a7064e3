use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

pub mod store;

pub use store::{DataStoreError, MemoryStore};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn nil() -> Self {
                Self(Uuid::nil())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// Identifier of a page; also the broadcast topic for its content.
    PageId
);
id_type!(FolderId);
id_type!(UserId);

/// Serialized rich-text block tree of a page, or null.
///
/// The transport treats the text as opaque. Only the data store checks that
/// it is syntactically valid (see [`Content::validate`]).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Content(Option<String>);

impl Content {
    pub fn null() -> Self {
        Self(None)
    }

    pub fn new(serialized: impl Into<String>) -> Self {
        Self(Some(serialized.into()))
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Length in bytes of the serialized form (0 for null).
    pub fn len(&self) -> usize {
        self.0.as_ref().map_or(0, String::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Syntactic check of the serialized block tree.
    ///
    /// Null and the empty string (the empty document) are valid; anything
    /// else must parse as JSON.
    pub fn validate(&self) -> Result<(), String> {
        match self.0.as_deref() {
            None | Some("") => Ok(()),
            Some(text) => serde_json::from_str::<serde::de::IgnoredAny>(text)
                .map(|_| ())
                .map_err(|e| format!("content is not a valid block tree: {e}")),
        }
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// Milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(millis as u64)
    }

    /// Current time, but never earlier than one tick past `prev`.
    pub fn after(prev: Timestamp) -> Self {
        Self::now().max(Timestamp(prev.0 + 1))
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Page {
    pub id: PageId,
    pub title: String,
    pub content: Content,
    /// Owning folder; `None` means the page sits at the root.
    pub parent: Option<FolderId>,
    pub owner: UserId,
    /// Sort order among siblings.
    pub position: u32,
    pub tags: BTreeSet<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Page {
    pub fn new(owner: UserId, title: impl Into<String>) -> Self {
        let now = Timestamp::now();
        Self {
            id: PageId::new(),
            title: title.into(),
            content: Content::null(),
            parent: None,
            owner,
            position: 0,
            tags: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
    pub parent: Option<FolderId>,
    pub owner: UserId,
    pub position: u32,
    pub created_at: Timestamp,
}

impl Folder {
    pub fn new(owner: UserId, name: impl Into<String>) -> Self {
        Self {
            id: FolderId::new(),
            name: name.into(),
            parent: None,
            owner,
            position: 0,
            created_at: Timestamp::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_creation() {
        let owner = UserId::new();
        let page = Page::new(owner, "Inbox");
        assert_eq!(page.title, "Inbox");
        assert_eq!(page.owner, owner);
        assert!(page.content.is_null());
        assert!(page.parent.is_none());
        assert_eq!(page.created_at, page.updated_at);
    }

    #[test]
    fn test_content_validation() {
        assert!(Content::null().validate().is_ok());
        assert!(Content::new("").validate().is_ok());
        assert!(Content::new(r#"[{"type":"paragraph","content":"hi"}]"#).validate().is_ok());
        assert!(Content::new("[{\"type\":").validate().is_err());
        assert!(Content::new("not json").validate().is_err());
    }

    #[test]
    fn test_empty_content_is_not_null() {
        let empty = Content::new("");
        assert!(empty.is_empty());
        assert!(!empty.is_null());
        assert_ne!(empty, Content::null());
    }

    #[test]
    fn test_timestamp_after_is_strictly_greater() {
        let future = Timestamp(Timestamp::now().0 + 60_000);
        let next = Timestamp::after(future);
        assert_eq!(next, Timestamp(future.0 + 1));
        assert!(Timestamp::after(Timestamp(0)) > Timestamp(0));
    }

    #[test]
    fn test_ids_are_distinct_and_display_as_uuid() {
        let a = PageId::new();
        let b = PageId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
        assert_eq!(PageId::nil().0, Uuid::nil());
    }
}
