//! Extracts tags embedded in file and directory names.
//!
//! A component like `Recipes #food/tart #baking.pdf` contributes the tags
//! `food` and `baking`: every whitespace-separated token starting with `#`
//! counts, with the extension stripped from the component first.

use crate::models::Tag;
use std::collections::BTreeSet;
use std::path::Path;

/// Collects filename tags from every component of `path`.
pub fn tags(path: &Path) -> BTreeSet<Tag> {
    let mut tags = BTreeSet::new();
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(&name);
        for token in stem.split_whitespace() {
            if let Some(tag) = token.strip_prefix('#') {
                if !tag.is_empty() {
                    tags.insert(Tag::filename(tag));
                }
            }
        }
    }
    tags
}
