mod entry;
mod listing;

pub use entry::{EntryMetadata, FileEntry, FileType};
pub use listing::DirectoryEnumerator;
