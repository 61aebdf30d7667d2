use crate::view::DEFAULT_THRESHOLD;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub view: ViewConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryConfig {
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl LibraryConfig {
    /// Returns the root set with `root` added. Already-present roots are
    /// left alone, so applying the same addition twice is harmless.
    pub fn add_root(&self, root: impl Into<PathBuf>) -> LibraryConfig {
        let root = root.into();
        let mut next = self.clone();
        if !next.roots.contains(&root) {
            next.roots.push(root);
        }
        next
    }

    /// Returns the root set with `root` removed.
    pub fn remove_root(&self, root: &Path) -> LibraryConfig {
        let mut next = self.clone();
        next.roots.retain(|r| r != root);
        next
    }

    pub fn excludes(&self) -> anyhow::Result<GlobSet> {
        build_excludes(&self.exclude)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewConfig {
    #[serde(default = "default_threshold")]
    pub threshold: usize,
}

impl Default for ViewConfig {
    fn default() -> Self {
        ViewConfig {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

fn default_threshold() -> usize {
    DEFAULT_THRESHOLD
}

pub fn build_excludes(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        settings = settings.add_source(config::File::with_name("config/default").required(false));
    }
    let cfg = settings.build()?;
    Ok(cfg.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_root_is_idempotent() {
        let library = LibraryConfig::default()
            .add_root("/tmp/a")
            .add_root("/tmp/b")
            .add_root("/tmp/a");
        assert_eq!(
            library.roots,
            vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")]
        );
    }

    #[test]
    fn remove_root_leaves_others() {
        let library = LibraryConfig::default()
            .add_root("/tmp/a")
            .add_root("/tmp/b");
        let library = library.remove_root(Path::new("/tmp/a"));
        assert_eq!(library.roots, vec![PathBuf::from("/tmp/b")]);
    }

    #[test]
    fn excludes_match_patterns() {
        let library = LibraryConfig {
            roots: Vec::new(),
            exclude: vec!["**/node_modules/**".into(), "**/*.tmp".into()],
        };
        let excludes = library.excludes().unwrap();
        assert!(excludes.is_match("/home/x/node_modules/y/z.js"));
        assert!(excludes.is_match("/home/x/scratch.tmp"));
        assert!(!excludes.is_match("/home/x/notes.txt"));
    }
}
