//! Query-key factory.
//!
//! Every workflow builds its keys here so prefixes line up: invalidating
//! `posts::all()` reaches the feed and every detail record.

use crate::cache_key;
use crate::{CacheKey, PostId};

pub mod posts {
    use super::*;

    pub fn all() -> CacheKey {
        cache_key!["posts"]
    }

    /// The paginated feed.
    pub fn list() -> CacheKey {
        all().child("list")
    }

    /// Normalized per-post record.
    pub fn by_id(id: PostId) -> CacheKey {
        all().child("byId").child(id)
    }
}

pub mod todos {
    use super::*;

    pub fn all() -> CacheKey {
        cache_key!["todos"]
    }

    pub fn list() -> CacheKey {
        all().child("list")
    }

    pub fn detail(id: &str) -> CacheKey {
        all().child("detail").child(id)
    }
}

pub mod profiles {
    use super::*;

    pub fn all() -> CacheKey {
        cache_key!["profile"]
    }

    pub fn list() -> CacheKey {
        all().child("list")
    }

    pub fn by_id(user_id: &str) -> CacheKey {
        all().child("byId").child(user_id)
    }
}
