//! Shared entity types: records, identifiers, tags, and content kinds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// The `(owner, path)` pair uniquely naming one indexed entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    pub owner: PathBuf,
    pub path: PathBuf,
}

impl Identifier {
    pub fn new(owner: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            owner: owner.into(),
            path: path.into(),
        }
    }

    /// The identifier of this entry's containing directory.
    pub fn parent(&self) -> Identifier {
        let parent = self.path.parent().unwrap_or(&self.path).to_path_buf();
        Identifier {
            owner: self.owner.clone(),
            path: parent,
        }
    }
}

/// Where a tag came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TagSource {
    Filename,
    External,
}

impl TagSource {
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(TagSource::Filename),
            1 => Some(TagSource::External),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i64 {
        match self {
            TagSource::Filename => 0,
            TagSource::External => 1,
        }
    }
}

/// A `(source, name)` tag. Tags are many-to-many with records and are pruned
/// as soon as their last association goes away.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub source: TagSource,
    pub name: String,
}

impl Tag {
    pub fn filename(name: impl Into<String>) -> Self {
        Self {
            source: TagSource::Filename,
            name: name.into(),
        }
    }

    pub fn external(name: impl Into<String>) -> Self {
        Self {
            source: TagSource::External,
            name: name.into(),
        }
    }
}

/// Coarse content-type classification. Directories are a distinguished kind;
/// everything else is derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Directory,
    Image,
    Video,
    Audio,
    Document,
    Text,
    Comic,
    Model,
    Other,
}

impl FileKind {
    pub fn for_path(path: &Path, is_dir: bool) -> FileKind {
        if is_dir {
            return FileKind::Directory;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some(
                "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "ico" | "tiff" | "tif" | "pbm"
                | "heic",
            ) => FileKind::Image,
            Some("mp4" | "m4v" | "mkv" | "avi" | "mov" | "mpeg" | "mpg" | "webm") => {
                FileKind::Video
            }
            Some("mp3" | "m4a" | "flac" | "ogg" | "wav" | "aac") => FileKind::Audio,
            Some("pdf") => FileKind::Document,
            Some("txt" | "md") => FileKind::Text,
            Some("cbr" | "cbz") => FileKind::Comic,
            Some("stl") => FileKind::Model,
            _ => FileKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Directory => "directory",
            FileKind::Image => "image",
            FileKind::Video => "video",
            FileKind::Audio => "audio",
            FileKind::Document => "document",
            FileKind::Text => "text",
            FileKind::Comic => "comic",
            FileKind::Model => "model",
            FileKind::Other => "other",
        }
    }

    /// Unknown kind strings decode as [`FileKind::Other`] so that newer
    /// catalogues remain readable.
    pub fn from_str_lossy(value: &str) -> FileKind {
        match value {
            "directory" => FileKind::Directory,
            "image" => FileKind::Image,
            "video" => FileKind::Video,
            "audio" => FileKind::Audio,
            "document" => FileKind::Document,
            "text" => FileKind::Text,
            "comic" => FileKind::Comic,
            "model" => FileKind::Model,
            _ => FileKind::Other,
        }
    }
}

/// One filesystem entry known to the catalogue.
///
/// `tags` is `None` when tags have not been loaded (store queries do not
/// inflate them) and `Some`, possibly empty, when they are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub uuid: Uuid,
    pub owner: PathBuf,
    pub path: PathBuf,
    pub name: String,
    pub kind: FileKind,
    /// Milliseconds since the Unix epoch. Stored integral rather than as a
    /// float so a round-trip through SQLite cannot shift the value and fake a
    /// change.
    pub modified_at: i64,
    pub tags: Option<BTreeSet<Tag>>,
}

impl FileRecord {
    pub fn new(
        owner: impl Into<PathBuf>,
        path: impl Into<PathBuf>,
        kind: FileKind,
        modified_at: i64,
    ) -> Self {
        let path = path.into();
        let name = display_name(&path);
        Self {
            uuid: Uuid::new_v4(),
            owner: owner.into(),
            path,
            name,
            kind,
            modified_at,
            tags: None,
        }
    }

    pub fn with_tags(mut self, tags: BTreeSet<Tag>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn identifier(&self) -> Identifier {
        Identifier {
            owner: self.owner.clone(),
            path: self.path.clone(),
        }
    }

    /// True when the observable filesystem state matches: same location, kind
    /// and modification time. The uuid and tag load state are ignored.
    pub fn equivalent(&self, other: &FileRecord) -> bool {
        self.owner == other.owner
            && self.path == other.path
            && self.kind == other.kind
            && self.modified_at == other.modified_at
    }
}

/// The display name of a path: its final component.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Converts a filesystem modification time to integral epoch milliseconds.
pub fn modified_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as i64,
        Err(before_epoch) => -(before_epoch.duration().as_millis() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_identifier() {
        let identifier = Identifier::new("/library", "/library/comics/issue-1.cbz");
        assert_eq!(
            identifier.parent(),
            Identifier::new("/library", "/library/comics")
        );
    }

    #[test]
    fn kind_classification() {
        assert_eq!(
            FileKind::for_path(Path::new("/a/b"), true),
            FileKind::Directory
        );
        assert_eq!(
            FileKind::for_path(Path::new("/a/photo.JPG"), false),
            FileKind::Image
        );
        assert_eq!(
            FileKind::for_path(Path::new("/a/notes.txt"), false),
            FileKind::Text
        );
        assert_eq!(
            FileKind::for_path(Path::new("/a/unknown.xyz"), false),
            FileKind::Other
        );
    }

    #[test]
    fn kind_string_roundtrip() {
        for kind in [
            FileKind::Directory,
            FileKind::Image,
            FileKind::Video,
            FileKind::Audio,
            FileKind::Document,
            FileKind::Text,
            FileKind::Comic,
            FileKind::Model,
            FileKind::Other,
        ] {
            assert_eq!(FileKind::from_str_lossy(kind.as_str()), kind);
        }
        assert_eq!(FileKind::from_str_lossy("hologram"), FileKind::Other);
    }
}
