use std::fmt;

use anyhow::{Result, ensure};

/// Type of a filesystem object, as reported by the first character of an `ls -l` mode string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    RegularFile,
    Directory,
    SymbolicLink,
    NamedPipe,
    Socket,
    BlockDevice,
    CharDevice,
}

impl FileType {
    pub fn from_mode_char(c: char) -> Self {
        match c {
            'd' => Self::Directory,
            'l' => Self::SymbolicLink,
            'p' => Self::NamedPipe,
            's' => Self::Socket,
            'b' => Self::BlockDevice,
            'c' => Self::CharDevice,
            _ => Self::RegularFile,
        }
    }

    pub fn is_device(self) -> bool {
        matches!(self, Self::BlockDevice | Self::CharDevice)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RegularFile => "regular file",
            Self::Directory => "directory",
            Self::SymbolicLink => "symbolic link",
            Self::NamedPipe => "named pipe",
            Self::Socket => "socket",
            Self::BlockDevice => "block device",
            Self::CharDevice => "character device",
        };
        f.write_str(name)
    }
}

/// Size, permission bits and modification time as printed by `ls -l`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    pub size: u64,
    pub mode: u32,
    /// Seconds since the epoch, minute precision
    pub modified: i64,
}

/// One filesystem object found by [`DirectoryEnumerator`](super::DirectoryEnumerator)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    relative_path: String,
    absolute_path: String,
    file_type: FileType,
    link_target: Option<String>,
    metadata: EntryMetadata,
}

impl FileEntry {
    /// Fails if `relative_path` is empty or absolute, or if `link_target` is given
    /// for anything but a symbolic link (or missing for one).
    pub fn new(
        relative_path: impl Into<String>,
        absolute_path: impl Into<String>,
        file_type: FileType,
        link_target: Option<String>,
    ) -> Result<Self> {
        let relative_path = relative_path.into();
        ensure!(!relative_path.is_empty(), "Relative path must not be empty");
        ensure!(
            !relative_path.starts_with('/'),
            "Relative path must not start with '/': {relative_path}"
        );
        ensure!(
            link_target.is_some() == (file_type == FileType::SymbolicLink),
            "Link target must be set exactly for symbolic links: {relative_path}"
        );
        Ok(Self {
            relative_path,
            absolute_path: absolute_path.into(),
            file_type,
            link_target,
            metadata: EntryMetadata::default(),
        })
    }

    pub fn with_metadata(mut self, metadata: EntryMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Path relative to the enumeration root; used as the archive entry name
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Path on the device the entry is read from
    pub fn absolute_path(&self) -> &str {
        &self.absolute_path
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn link_target(&self) -> Option<&str> {
        self.link_target.as_deref()
    }

    pub fn metadata(&self) -> &EntryMetadata {
        &self.metadata
    }

    /// Last path component
    pub fn name(&self) -> &str {
        self.relative_path.rsplit('/').next().unwrap_or(&self.relative_path)
    }

    /// True for entries directly under the enumeration root
    pub fn is_top_level(&self) -> bool {
        !self.relative_path.contains('/')
    }
}
