//! Composable filters and sorts over catalogued files.
//!
//! Every filter has two total interpretations derived from the same variant
//! list: a parameterized SQL fragment for querying the store, and an
//! in-memory predicate for re-evaluating live notifications. Keeping both in
//! a single `match` per function keeps the two representations in lockstep:
//! adding a variant without covering both is a compile error.

use crate::models::{FileKind, FileRecord};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// A parameterized SQL fragment plus its bound values, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFragment {
    pub sql: String,
    pub bindings: Vec<String>,
}

/// An immutable predicate over [`FileRecord`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    True,
    False,
    /// Matches records whose kind is any of the given kinds.
    KindIn(Vec<FileKind>),
    /// Matches records strictly below the given directory.
    Parent(PathBuf),
    /// Matches records discovered under the given root.
    Owner(PathBuf),
    /// Matches the single record at the given path.
    PathIs(PathBuf),
    /// Matches records carrying a tag with the given name, from any source.
    Tagged(String),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn owner(owner: impl Into<PathBuf>) -> Filter {
        Filter::Owner(owner.into())
    }

    pub fn parent(parent: impl Into<PathBuf>) -> Filter {
        Filter::Parent(parent.into())
    }

    pub fn path(path: impl Into<PathBuf>) -> Filter {
        Filter::PathIs(path.into())
    }

    pub fn tagged(name: impl Into<String>) -> Filter {
        Filter::Tagged(name.into())
    }

    pub fn kind_in(kinds: impl IntoIterator<Item = FileKind>) -> Filter {
        Filter::KindIn(kinds.into_iter().collect())
    }

    pub fn and(self, other: Filter) -> Filter {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Filter {
        Filter::Or(Box::new(self), Box::new(other))
    }

    /// Folds filters with OR; the empty list is `False`.
    pub fn any_of(filters: impl IntoIterator<Item = Filter>) -> Filter {
        filters
            .into_iter()
            .fold(Filter::False, |acc, filter| acc.or(filter))
    }

    /// Folds filters with AND; the empty list is `True`.
    pub fn all_of(filters: impl IntoIterator<Item = Filter>) -> Filter {
        filters
            .into_iter()
            .fold(Filter::True, |acc, filter| acc.and(filter))
    }

    /// Compiles the filter to a WHERE fragment. Values are always bound,
    /// never interpolated.
    pub fn to_sql(&self) -> QueryFragment {
        match self {
            Filter::True => QueryFragment {
                sql: "1 = 1".into(),
                bindings: vec![],
            },
            Filter::False => QueryFragment {
                sql: "1 = 0".into(),
                bindings: vec![],
            },
            Filter::KindIn(kinds) => {
                if kinds.is_empty() {
                    return QueryFragment {
                        sql: "1 = 0".into(),
                        bindings: vec![],
                    };
                }
                let placeholders = vec!["?"; kinds.len()].join(", ");
                QueryFragment {
                    sql: format!("kind IN ({placeholders})"),
                    bindings: kinds.iter().map(|k| k.as_str().to_string()).collect(),
                }
            }
            Filter::Parent(parent) => QueryFragment {
                sql: "path LIKE ? ESCAPE '\\'".into(),
                bindings: vec![format!("{}/%", escape_like(&path_str(parent)))],
            },
            Filter::Owner(owner) => QueryFragment {
                sql: "owner = ?".into(),
                bindings: vec![path_str(owner)],
            },
            Filter::PathIs(path) => QueryFragment {
                sql: "path = ?".into(),
                bindings: vec![path_str(path)],
            },
            Filter::Tagged(name) => QueryFragment {
                sql: "files.id IN (SELECT file_id FROM file_tags \
                      JOIN tags ON file_tags.tag_id = tags.id WHERE tags.name = ?)"
                    .into(),
                bindings: vec![name.clone()],
            },
            Filter::And(lhs, rhs) => combine(lhs.to_sql(), "AND", rhs.to_sql()),
            Filter::Or(lhs, rhs) => combine(lhs.to_sql(), "OR", rhs.to_sql()),
        }
    }

    /// Evaluates the filter against an in-memory record. Must agree with
    /// [`Filter::to_sql`]; both are one `match` over the same variants.
    pub fn matches(&self, record: &FileRecord) -> bool {
        match self {
            Filter::True => true,
            Filter::False => false,
            Filter::KindIn(kinds) => kinds.contains(&record.kind),
            Filter::Parent(parent) => {
                record.path != *parent && record.path.starts_with(parent)
            }
            Filter::Owner(owner) => record.owner == *owner,
            Filter::PathIs(path) => record.path == *path,
            Filter::Tagged(name) => record
                .tags
                .as_ref()
                .map(|tags| tags.iter().any(|tag| tag.name == *name))
                .unwrap_or(false),
            Filter::And(lhs, rhs) => {
                // Strict boolean algebra, mirroring the SQL evaluation.
                let left = lhs.matches(record);
                let right = rhs.matches(record);
                left && right
            }
            Filter::Or(lhs, rhs) => {
                let left = lhs.matches(record);
                let right = rhs.matches(record);
                left || right
            }
        }
    }
}

fn combine(lhs: QueryFragment, op: &str, rhs: QueryFragment) -> QueryFragment {
    let mut bindings = lhs.bindings;
    bindings.extend(rhs.bindings);
    QueryFragment {
        sql: format!("({}) {} ({})", lhs.sql, op, rhs.sql),
        bindings,
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Escapes `LIKE` metacharacters so path text only ever matches literally.
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// A total order over records, expressible both as an ORDER BY fragment and
/// as an in-memory comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sort {
    DisplayNameAscending,
    DisplayNameDescending,
}

impl Sort {
    /// Display names compare case-insensitively; the path breaks ties so the
    /// order is total.
    pub fn to_sql(self) -> &'static str {
        match self {
            Sort::DisplayNameAscending => "name COLLATE NOCASE ASC, path ASC",
            Sort::DisplayNameDescending => "name COLLATE NOCASE DESC, path DESC",
        }
    }

    /// ASCII-only folding: NOCASE folds A-Z only, and the comparator must
    /// order exactly as the ORDER BY fragment does.
    pub fn cmp(self, lhs: &FileRecord, rhs: &FileRecord) -> Ordering {
        let by_name = lhs
            .name
            .to_ascii_lowercase()
            .cmp(&rhs.name.to_ascii_lowercase())
            .then_with(|| lhs.path.cmp(&rhs.path));
        match self {
            Sort::DisplayNameAscending => by_name,
            Sort::DisplayNameDescending => by_name.reverse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileKind;

    fn record(path: &str, kind: FileKind) -> FileRecord {
        FileRecord::new("/library", path, kind, 0)
    }

    #[test]
    fn leaves_compile_to_bound_fragments() {
        let fragment = Filter::owner("/library").to_sql();
        assert_eq!(fragment.sql, "owner = ?");
        assert_eq!(fragment.bindings, vec!["/library".to_string()]);

        let fragment = Filter::parent("/library/comics").to_sql();
        assert_eq!(fragment.sql, "path LIKE ? ESCAPE '\\'");
        assert_eq!(fragment.bindings, vec!["/library/comics/%".to_string()]);

        let fragment = Filter::kind_in([FileKind::Image, FileKind::Video]).to_sql();
        assert_eq!(fragment.sql, "kind IN (?, ?)");
        assert_eq!(
            fragment.bindings,
            vec!["image".to_string(), "video".to_string()]
        );
    }

    #[test]
    fn combinators_parenthesize_and_order_bindings() {
        let filter = Filter::owner("/a").and(Filter::parent("/a/b").or(Filter::path("/a/c")));
        let fragment = filter.to_sql();
        assert_eq!(fragment.sql, "(owner = ?) AND ((path LIKE ?) OR (path = ?))");
        assert_eq!(
            fragment.bindings,
            vec!["/a".to_string(), "/a/b/%".to_string(), "/a/c".to_string()]
        );
    }

    #[test]
    fn empty_kind_set_matches_nothing() {
        let filter = Filter::kind_in([]);
        assert_eq!(filter.to_sql().sql, "1 = 0");
        assert!(!filter.matches(&record("/library/a.txt", FileKind::Text)));
    }

    #[test]
    fn fold_identities() {
        assert_eq!(Filter::any_of([]), Filter::False);
        assert_eq!(Filter::all_of([]), Filter::True);

        let one = Filter::any_of([Filter::owner("/a")]);
        assert!(one.matches(&record("/library/x", FileKind::Other)) == false);
    }

    #[test]
    fn parent_paths_with_like_metacharacters_bind_literally() {
        let fragment = Filter::parent("/r/my_dir").to_sql();
        assert_eq!(fragment.bindings, vec![r"/r/my\_dir/%".to_string()]);

        let fragment = Filter::parent(r"/r/100% #done\backup").to_sql();
        assert_eq!(fragment.bindings, vec![r"/r/100\% #done\\backup/%".to_string()]);
    }

    #[test]
    fn sort_folds_ascii_case_only() {
        // NOCASE folds A-Z and nothing else; the comparator must agree.
        let dotted = record("/library/İstanbul.txt", FileKind::Text);
        let plain = record("/library/jam.txt", FileKind::Text);
        assert_eq!(Sort::DisplayNameAscending.cmp(&plain, &dotted), Ordering::Less);
        assert_eq!(Sort::DisplayNameDescending.cmp(&plain, &dotted), Ordering::Greater);
    }

    #[test]
    fn parent_excludes_itself_and_unrelated_siblings() {
        let filter = Filter::parent("/library/comics");
        assert!(filter.matches(&record("/library/comics/one.cbz", FileKind::Comic)));
        assert!(!filter.matches(&record("/library/comics", FileKind::Directory)));
        assert!(!filter.matches(&record("/library/music/one.mp3", FileKind::Audio)));
    }

    #[test]
    fn tagged_requires_loaded_tags() {
        let plain = record("/library/a.txt", FileKind::Text);
        assert!(!Filter::tagged("draft").matches(&plain));

        let tagged = plain.with_tags([crate::models::Tag::filename("draft")].into());
        assert!(Filter::tagged("draft").matches(&tagged));
        assert!(!Filter::tagged("final").matches(&tagged));
    }

    #[test]
    fn sort_is_case_insensitive_and_total() {
        let a = record("/library/Apple.txt", FileKind::Text);
        let b = record("/library/banana.txt", FileKind::Text);
        assert_eq!(Sort::DisplayNameAscending.cmp(&a, &b), Ordering::Less);
        assert_eq!(Sort::DisplayNameDescending.cmp(&a, &b), Ordering::Greater);

        // Same display name in different directories still orders totally.
        let c = record("/library/one/note.txt", FileKind::Text);
        let d = record("/library/two/note.txt", FileKind::Text);
        assert_eq!(Sort::DisplayNameAscending.cmp(&c, &d), Ordering::Less);
        assert_eq!(Sort::DisplayNameAscending.cmp(&c, &c), Ordering::Equal);
    }
}
