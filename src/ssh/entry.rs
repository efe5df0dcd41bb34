use serde::{Deserialize, Serialize};

use super::transport::FileAttributes;

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;

/// File type derived from the `st_mode` type bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Socket,
    CharSpecial,
    BlockSpecial,
    Unknown,
}

impl FileKind {
    /// Never fails: anything outside the known type bits is `Unknown`.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => FileKind::Regular,
            S_IFDIR => FileKind::Directory,
            S_IFLNK => FileKind::Symlink,
            S_IFSOCK => FileKind::Socket,
            S_IFCHR => FileKind::CharSpecial,
            S_IFBLK => FileKind::BlockSpecial,
            _ => FileKind::Unknown,
        }
    }

    pub fn from_attributes(attrs: &FileAttributes) -> Self {
        attrs.permissions.map(FileKind::from_mode).unwrap_or(FileKind::Unknown)
    }

    pub fn is_dir(self) -> bool {
        self == FileKind::Directory
    }
}

/// Represents a remote directory entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileEntry {
    name: String,
    kind: FileKind,
    size: Option<u64>,
    permissions: Option<u32>,
    modified: Option<u32>,
    long_entry: Option<String>,
}

impl RemoteFileEntry {
    /// Build an entry from one directory record.
    ///
    /// The slices must already be cut to the lengths the transport reported;
    /// nothing here looks for a terminator. Returns `None` for `.`, `..` and
    /// empty names.
    pub fn parse(name: &[u8], attrs: &FileAttributes, long_entry: Option<&[u8]>) -> Option<Self> {
        let name = String::from_utf8_lossy(name);
        if name.is_empty() || name == "." || name == ".." {
            return None;
        }
        let long_entry = long_entry
            .filter(|raw| !raw.is_empty())
            .map(|raw| String::from_utf8_lossy(raw).into_owned());

        Some(Self {
            name: name.into_owned(),
            kind: FileKind::from_attributes(attrs),
            size: attrs.size,
            permissions: attrs.permissions,
            modified: attrs.mtime,
            long_entry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Permission bits without the file type.
    pub fn permissions(&self) -> Option<u32> {
        self.permissions.map(|mode| mode & 0o7777)
    }

    /// Modification time as a unix timestamp.
    pub fn modified(&self) -> Option<u32> {
        self.modified
    }

    /// `ls -l` style line, when the server sent one.
    pub fn long_entry(&self) -> Option<&str> {
        self.long_entry.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(mode: u32) -> FileAttributes {
        FileAttributes {
            permissions: Some(mode),
            size: Some(42),
            mtime: Some(1_700_000_000),
            ..Default::default()
        }
    }

    #[test]
    fn test_dot_entries_filtered() {
        for mode in [0o040755, 0o100644, 0, 0o170000] {
            assert!(RemoteFileEntry::parse(b".", &attrs(mode), None).is_none());
            assert!(RemoteFileEntry::parse(b"..", &attrs(mode), None).is_none());
        }
        assert!(RemoteFileEntry::parse(b"..", &FileAttributes::default(), Some(b"x")).is_none());
        assert!(RemoteFileEntry::parse(b"", &attrs(0o100644), None).is_none());
        assert!(RemoteFileEntry::parse(b"...", &attrs(0o100644), None).is_some());
    }

    #[test]
    fn test_classification_named_kinds() {
        assert_eq!(FileKind::from_mode(0o100644), FileKind::Regular);
        assert_eq!(FileKind::from_mode(0o040755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(0o120777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(0o140755), FileKind::Socket);
        assert_eq!(FileKind::from_mode(0o020620), FileKind::CharSpecial);
        assert_eq!(FileKind::from_mode(0o060660), FileKind::BlockSpecial);
        // FIFO has no dedicated kind
        assert_eq!(FileKind::from_mode(0o010644), FileKind::Unknown);
    }

    #[test]
    fn test_classification_is_total() {
        let mut seen = std::collections::HashSet::new();
        for nibble in 0u32..16 {
            let kind = FileKind::from_mode(nibble << 12 | 0o644);
            seen.insert(kind);
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(FileKind::from_attributes(&FileAttributes::default()), FileKind::Unknown);
    }

    #[test]
    fn test_parse_entry_fields() {
        let entry = RemoteFileEntry::parse(
            b"file.txt",
            &attrs(0o100640),
            Some(b"-rw-r----- 1 u g 42 Nov 14 file.txt"),
        )
        .unwrap();
        assert_eq!(entry.name(), "file.txt");
        assert_eq!(entry.kind(), FileKind::Regular);
        assert_eq!(entry.size(), Some(42));
        assert_eq!(entry.permissions(), Some(0o640));
        assert_eq!(entry.modified(), Some(1_700_000_000));
        assert!(entry.long_entry().unwrap().ends_with("file.txt"));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let entry = RemoteFileEntry::parse(b"bad\xffname", &attrs(0o100644), Some(b"")).unwrap();
        assert_eq!(entry.name(), "bad\u{fffd}name");
        assert_eq!(entry.long_entry(), None);
    }

    #[test]
    fn test_entry_json() {
        let entry = RemoteFileEntry::parse(b"sub", &attrs(0o040755), None).unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"kind\":\"directory\""));
        assert!(json.contains("\"name\":\"sub\""));
    }
}
