//! Domain entities mirrored from the remote service.
//!
//! These are the row shapes the workflows cache. Patches apply
//! copy-on-write: they build a new value and never touch the original.

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Primary key of a post row.
pub type PostId = i64;

/// A post in the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub content: String,
    /// Public URLs of uploaded images, in upload order.
    #[serde(default)]
    pub image_urls: Vec<String>,
    pub author_id: String,
    pub created_at: Timestamp,
}

impl Post {
    pub fn has_images(&self) -> bool {
        !self.image_urls.is_empty()
    }

    /// Storage folder holding this post's assets: `{author_id}/{post_id}`.
    pub fn asset_folder(&self) -> String {
        format!("{}/{}", self.author_id, self.id)
    }
}

/// Values for a new post. The remote assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDraft {
    pub author_id: String,
    pub content: String,
}

/// Partial update of a post. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_urls: Option<Vec<String>>,
}

impl PostPatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn image_urls(urls: Vec<String>) -> Self {
        Self {
            image_urls: Some(urls),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.image_urls.is_none()
    }

    pub fn apply(&self, post: &Post) -> Post {
        Post {
            content: self.content.clone().unwrap_or_else(|| post.content.clone()),
            image_urls: self
                .image_urls
                .clone()
                .unwrap_or_else(|| post.image_urls.clone()),
            ..post.clone()
        }
    }
}

/// A todo item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub content: String,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoDraft {
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

impl TodoPatch {
    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
            ..Self::default()
        }
    }

    pub fn apply(&self, todo: &Todo) -> Todo {
        Todo {
            id: todo.id.clone(),
            content: self.content.clone().unwrap_or_else(|| todo.content.clone()),
            completed: self.completed.unwrap_or(todo.completed),
        }
    }
}

/// A user profile row. `id` is the auth user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub nickname: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Profile {
    /// A freshly created profile with only a nickname.
    pub fn new(id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nickname: nickname.into(),
            bio: None,
            avatar_url: None,
        }
    }
}

/// A file to upload to object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Asset {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    /// File extension without the dot, if the name has one.
    pub fn extension(&self) -> Option<&str> {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
    }
}

/// An asset that has been stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadedAsset {
    /// Object path inside the bucket.
    pub path: String,
    pub public_url: String,
}

// =============================================================================
// TESTS
// =============================================================================
