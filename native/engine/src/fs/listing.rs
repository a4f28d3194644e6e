use anyhow::{Context, Result};
use futures::future::BoxFuture;
use time::{PrimitiveDateTime, macros::format_description};
use tracing::{debug, instrument, warn};

use super::{EntryMetadata, FileEntry, FileType};
use crate::shell::{Privilege, PrivilegedExecutor, quote};

const NOT_FOUND_MARKER: &str = "No such file or directory";

/// Splits `line` into `count` whitespace-separated fields plus the untouched remainder
fn split_fields(line: &str, count: usize) -> Option<(Vec<&str>, &str)> {
    let mut rest = line.trim_start();
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    (!rest.is_empty()).then_some((fields, rest))
}

/// One parsed `ls -l` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LsLine {
    pub file_type: FileType,
    pub name: String,
    pub link_target: Option<String>,
    pub metadata: EntryMetadata,
}

/// Permission bits of a mode string such as `drwxr-s--T`. Trailing ACL/SELinux markers are ignored.
fn parse_mode(mode: &str) -> u32 {
    let mut bits = 0;
    for (i, c) in mode.chars().skip(1).take(9).enumerate() {
        let shift = 8 - i as u32;
        if matches!(c, 'r' | 'w' | 'x' | 's' | 't') {
            bits |= 1 << shift;
        }
        let special = match (i, c) {
            (2, 's' | 'S') => 0o4000,
            (5, 's' | 'S') => 0o2000,
            (8, 't' | 'T') => 0o1000,
            _ => 0,
        };
        bits |= special;
    }
    bits
}

fn parse_modified(date: &str, time: &str) -> i64 {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]");
    // Full-precision timestamps are cut down to minutes
    let time = time.get(..5).unwrap_or(time);
    match PrimitiveDateTime::parse(&format!("{date} {time}"), &format) {
        Ok(t) => t.assume_utc().unix_timestamp(),
        Err(e) => {
            debug!(date, time, error = %e, "Unrecognized ls timestamp, using 0");
            0
        }
    }
}

/// Parses one line of `ls -Al` output.
///
/// Fields are mode, link count, owner, group, size, date, time, name. The name keeps
/// any embedded spaces. Device nodes print `major, minor` in place of the size.
pub(crate) fn parse_ls_line(line: &str) -> Option<LsLine> {
    let file_type = FileType::from_mode_char(line.trim_start().chars().next()?);
    let (mut fields, mut name) = split_fields(line, 7)?;
    let mut size = fields[4].parse().unwrap_or(0);
    if file_type.is_device() && fields[4].ends_with(',') {
        (fields, name) = split_fields(line, 8)?;
        fields.remove(5);
        size = 0;
    }

    let (name, link_target) = match file_type {
        FileType::SymbolicLink => {
            let (name, target) = name.split_once(" -> ")?;
            (name, Some(target.to_string()))
        }
        _ => (name, None),
    };
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    let metadata = EntryMetadata {
        size,
        mode: parse_mode(fields[0]),
        modified: parse_modified(fields[5], fields[6]),
    };
    Some(LsLine { file_type, name: name.to_string(), link_target, metadata })
}

/// Parses full `ls -Al` output, dropping the `total N` summary, blank and malformed lines
pub(crate) fn parse_ls_output(lines: &[String]) -> Vec<LsLine> {
    let mut lines = lines.iter().map(String::as_str).peekable();
    if lines.peek().is_some_and(|first| first.starts_with("total ")) {
        lines.next();
    }
    lines
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parsed = parse_ls_line(line);
            if parsed.is_none() {
                warn!(line, "Skipping unparseable ls line");
            }
            parsed
        })
        .collect()
}

/// Lists directories through the privileged toolbox `ls`
#[derive(Debug, Clone)]
pub struct DirectoryEnumerator {
    executor: PrivilegedExecutor,
}

impl DirectoryEnumerator {
    pub fn new(executor: PrivilegedExecutor) -> Self {
        Self { executor }
    }

    /// Names directly under `path`, or `None` if it doesn't exist
    #[instrument(level = "debug", skip(self), err)]
    pub async fn list_shallow(&self, path: &str) -> Result<Option<Vec<String>>> {
        let command = self.executor.toolbox_cmd(format_args!("ls {}", quote(path)));
        let result = self.executor.run(Privilege::Root, &[&command]).await?;
        if !result.is_success() {
            if result.stderr_contains(NOT_FOUND_MARKER) {
                debug!(path, "Directory does not exist");
                return Ok(None);
            }
            return Err(result.into_failure(command).into());
        }
        Ok(Some(result.stdout.into_iter().filter(|line| !line.is_empty()).collect()))
    }

    /// Entries under `path`, or `None` if it doesn't exist.
    ///
    /// With `recursive`, each directory's own listing follows the whole level it was found in.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn list_detailed(&self, path: &str, recursive: bool) -> Result<Option<Vec<FileEntry>>> {
        let Some(level) = self.list_level(path, None).await? else {
            debug!(path, "Directory does not exist");
            return Ok(None);
        };
        if !recursive {
            return Ok(Some(level));
        }
        let mut entries = Vec::with_capacity(level.len());
        self.descend(level, &mut entries).await?;
        debug!(path, count = entries.len(), "Listed directory recursively");
        Ok(Some(entries))
    }

    /// Recursively lists the given entries' directories, keeping `entries` as the first level.
    ///
    /// Used when the caller filters the top level before descending.
    #[instrument(level = "debug", skip(self, level), fields(count = level.len()), err)]
    pub async fn expand(&self, level: Vec<FileEntry>) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::with_capacity(level.len());
        self.descend(level, &mut entries).await?;
        Ok(entries)
    }

    fn descend<'a>(
        &'a self,
        level: Vec<FileEntry>,
        out: &'a mut Vec<FileEntry>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let directories: Vec<FileEntry> =
                level.iter().filter(|e| e.file_type() == FileType::Directory).cloned().collect();
            out.extend(level);
            for dir in directories {
                // A directory removed mid-walk simply has no children
                let children = self
                    .list_level(dir.absolute_path(), Some(dir.relative_path()))
                    .await?
                    .unwrap_or_default();
                self.descend(children, out).await?;
            }
            Ok(())
        })
    }

    async fn list_level(&self, dir: &str, prefix: Option<&str>) -> Result<Option<Vec<FileEntry>>> {
        let command = self.executor.toolbox_cmd(format_args!("ls -Al {}", quote(dir)));
        let result = self.executor.run(Privilege::Root, &[&command]).await?;
        if !result.is_success() {
            if result.stderr_contains(NOT_FOUND_MARKER) {
                return Ok(None);
            }
            return Err(result.into_failure(command).into());
        }

        let dir = dir.trim_end_matches('/');
        parse_ls_output(&result.stdout)
            .into_iter()
            .map(|line| {
                let relative = match prefix {
                    Some(prefix) => format!("{prefix}/{}", line.name),
                    None => line.name.clone(),
                };
                let absolute = format!("{dir}/{}", line.name);
                FileEntry::new(relative, absolute, line.file_type, line.link_target)
                    .map(|entry| entry.with_metadata(line.metadata))
                    .with_context(|| format!("Invalid entry in listing of {dir}"))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}
