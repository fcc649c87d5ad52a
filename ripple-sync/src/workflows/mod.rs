//! Application workflows.
//!
//! Each function wires one remote operation into the cache: which keys it
//! reads, which it writes, and what it invalidates. Keys come from
//! [`ripple_core::keys`] so prefixes line up across workflows.

pub mod media;
pub mod posts;
pub mod profiles;
pub mod todos;

pub use media::{create_post_with_media, MediaPostState};
pub use posts::{delete_post, post_by_id, post_feed, update_post, PostView, PAGE_SIZE};
pub use profiles::{profile_by_id, random_nickname};
pub use todos::{create_todo, todo_detail, todo_items, todo_list, toggle_todo, update_todo};
