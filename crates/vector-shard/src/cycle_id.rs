//! Hierarchical callback ids.
//!
//! Ids follow the physical layout of the data so concurrent instances can
//! be told apart in logs and controlled one by one.

use std::path::{Component, Path};

pub const COMPACTION: &str = "compaction";
pub const FLUSH: &str = "flush";
pub const VECTOR_COMMIT_LOGGER: &str = "vector_commit_logger";
pub const VECTOR_TOMBSTONE_CLEANUP: &str = "vector_tombstone_cleanup";

/// `store/<kind>/<dir relative to root>`.
///
/// A `dir` outside `root` is used as given, minus its root and prefix.
pub fn store(dir: &Path, root: &Path, kind: &str) -> String {
    let relative = dir.strip_prefix(root).unwrap_or(dir);
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        format!("store/{kind}")
    } else {
        format!("store/{kind}/{}", parts.join("/"))
    }
}

/// `shard/<index>/<shard>/<elems...>`.
pub fn shard(index: &str, shard: &str, elems: &[&str]) -> String {
    let mut id = format!("shard/{index}/{shard}");
    for elem in elems {
        id.push('/');
        id.push_str(elem);
    }
    id
}
