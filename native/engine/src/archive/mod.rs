mod cipher;

use std::path::{Component, Path};

use anyhow::{Context, Result, bail, ensure};
use async_compression::tokio::{bufread::GzipDecoder, write::GzipEncoder};
use async_tar::{Archive, Builder, EntryType, Header};
#[cfg(test)]
pub(crate) use cipher::xor::XorCipher;
pub use cipher::{Encryption, StreamCipher};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, trace, warn};

use crate::{
    fs::{FileEntry, FileType},
    transport::{FileTransport, ReadStream, WriteStream, join},
};

/// Longest link name that fits a plain tar header
const MAX_HEADER_LINK_LEN: usize = 100;
const GNU_LONG_LINK_NAME: &[u8] = b"././@LongLink";

/// Stream layers wrapped around the tar stream
#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    /// Gzip the tar stream
    pub compress: bool,
    /// Encrypt the (compressed) stream
    pub encryption: Option<Encryption>,
}

impl ArchiveOptions {
    pub fn new(compress: bool, encryption: Option<Encryption>) -> Self {
        Self { compress, encryption }
    }
}

/// Counts reported after building or extracting an archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub entries: usize,
    pub bytes: u64,
}

/// Converts between enumerated entries and tar streams
#[derive(Debug, Clone, Default)]
pub struct ArchiveCodec {
    options: ArchiveOptions,
}

impl ArchiveCodec {
    pub fn new(options: ArchiveOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ArchiveOptions {
        &self.options
    }

    /// Writes `entries` as a tar stream into `sink`, reading file contents from `source`.
    ///
    /// The sink is wrapped in gzip and then in the cipher, as configured, and is shut down
    /// on success. Devices and sockets are rejected.
    #[instrument(level = "debug", skip_all, fields(count = entries.len()), err)]
    pub async fn build_archive(
        &self,
        entries: &[FileEntry],
        source: &dyn FileTransport,
        sink: WriteStream,
    ) -> Result<ArchiveStats> {
        let sink = match &self.options.encryption {
            Some(encryption) => encryption.encrypt(sink).context("Failed to set up encryption")?,
            None => sink,
        };
        let sink: WriteStream =
            if self.options.compress { Box::new(GzipEncoder::new(sink)) } else { sink };

        let mut builder = Builder::new(sink);
        let mut stats = ArchiveStats::default();
        for entry in entries {
            stats.bytes += append_entry(&mut builder, entry, source)
                .await
                .with_context(|| format!("Failed to archive {}", entry.absolute_path()))?;
            stats.entries += 1;
        }

        let mut sink = builder.into_inner().await.context("Failed to finish tar stream")?;
        sink.shutdown().await.context("Failed to finish archive")?;
        debug!(entries = stats.entries, bytes = stats.bytes, "Built archive");
        Ok(stats)
    }

    /// Unpacks a tar stream into `target_dir` through `transport`.
    ///
    /// Entries land at `target_dir/<entry name>` in stream order, so parents are created
    /// before their children.
    #[instrument(level = "debug", skip(self, source, transport), err)]
    pub async fn extract_archive(
        &self,
        source: ReadStream,
        target_dir: &str,
        transport: &dyn FileTransport,
    ) -> Result<ArchiveStats> {
        let source = match &self.options.encryption {
            Some(encryption) => encryption.decrypt(source).context("Failed to set up decryption")?,
            None => source,
        };
        let source: ReadStream = if self.options.compress {
            Box::new(GzipDecoder::new(BufReader::new(source)))
        } else {
            source
        };

        transport.create_dir_all(target_dir).await?;
        let mut entries = Archive::new(source).entries().context("Failed to read archive")?;
        let mut stats = ArchiveStats::default();
        while let Some(entry) = entries.next().await {
            let mut entry = entry.context("Failed to read archive entry")?;
            let name = entry_name(&entry.path().context("Invalid entry path")?)?;
            let target = join(target_dir, &name);
            let entry_type = entry.header().entry_type();
            trace!(name = %name, ?entry_type, "Extracting entry");

            match entry_type {
                EntryType::Directory => transport.create_dir(&target).await?,
                EntryType::Regular | EntryType::Continuous => {
                    let mut writer = transport.open_write(&target).await?;
                    stats.bytes += tokio::io::copy(&mut entry, &mut writer)
                        .await
                        .with_context(|| format!("Failed to extract {name}"))?;
                    writer.shutdown().await.with_context(|| format!("Failed to write {target}"))?;
                }
                EntryType::Symlink => {
                    let link = entry
                        .link_name()
                        .context("Invalid link name")?
                        .with_context(|| format!("Symlink {name} has no target"))?;
                    let link = link.to_str().context("Link target is not valid UTF-8")?.to_string();
                    transport.symlink(target_dir, &link, &name).await?;
                }
                EntryType::Fifo => transport.mkfifo(target_dir, &name).await?,
                other => bail!("Cannot restore file type {other:?}: {name}"),
            }
            stats.entries += 1;
        }
        debug!(entries = stats.entries, bytes = stats.bytes, "Extracted archive");
        Ok(stats)
    }
}

/// Validated, slash-trimmed entry name that stays inside the target directory
fn entry_name(path: &Path) -> Result<String> {
    let name = path.to_str().context("Entry name is not valid UTF-8")?;
    let name = name.strip_prefix("./").unwrap_or(name).trim_end_matches('/');
    ensure!(!name.is_empty(), "Empty entry name");
    ensure!(
        Path::new(name).components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)),
        "Entry escapes the target directory: {name}"
    );
    Ok(name.to_string())
}

/// Builds a GNU header for `entry`.
///
/// Names and link targets over 100 bytes go into GNU `././@LongLink` records rather than
/// POSIX PAX `path`/`linkpath` records: async-tar writes the former for names on its own
/// and reads both, and GNU tar, bsdtar and toybox all extract them.
fn header_for(entry: &FileEntry, entry_type: EntryType, default_mode: u32) -> Header {
    let metadata = entry.metadata();
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(if metadata.mode == 0 { default_mode } else { metadata.mode });
    header.set_mtime(metadata.modified.max(0) as u64);
    header.set_size(0);
    header
}

/// Emits the GNU `K` record carrying a link target too long for the header
async fn append_long_link(builder: &mut Builder<WriteStream>, target: &str) -> Result<()> {
    let mut data = target.as_bytes().to_vec();
    data.push(0);

    let mut header = Header::new_gnu();
    let gnu = header.as_gnu_mut().context("GNU header expected")?;
    gnu.name[..GNU_LONG_LINK_NAME.len()].copy_from_slice(GNU_LONG_LINK_NAME);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(data.len() as u64);
    header.set_entry_type(EntryType::GNULongLink);
    header.set_cksum();
    builder.append(&header, &data[..]).await?;
    Ok(())
}

/// Appends one entry and returns the number of content bytes written
async fn append_entry(
    builder: &mut Builder<WriteStream>,
    entry: &FileEntry,
    source: &dyn FileTransport,
) -> Result<u64> {
    let path = entry.relative_path();
    match entry.file_type() {
        FileType::RegularFile => {
            let size = entry.metadata().size;
            let mut header = header_for(entry, EntryType::Regular, 0o644);
            header.set_size(size);
            let mut reader = source.open_read(entry.absolute_path()).await?;
            // The header size is fixed up front, so pad or cut a file that changed since listing
            let mut data = (&mut reader).take(size).chain(tokio::io::repeat(0)).take(size);
            builder.append_data(&mut header, path, &mut data).await?;

            let (file_part, _) = data.into_inner().into_inner();
            let read = size - file_part.limit();
            let grew = read == size && reader.read(&mut [0u8; 1]).await.is_ok_and(|n| n > 0);
            if read < size {
                warn!(path = entry.absolute_path(), listed = size, read, "File shrank since listing, padded with zeros");
            } else if grew {
                warn!(path = entry.absolute_path(), listed = size, "File grew since listing, truncated");
            }
            Ok(size)
        }
        FileType::Directory => {
            let mut header = header_for(entry, EntryType::Directory, 0o755);
            builder.append_data(&mut header, path, tokio::io::empty()).await?;
            Ok(0)
        }
        FileType::SymbolicLink => {
            let target = entry.link_target().context("Symlink without target")?;
            let mut header = header_for(entry, EntryType::Symlink, 0o777);
            if target.len() > MAX_HEADER_LINK_LEN {
                append_long_link(builder, target).await?;
            } else {
                header.set_link_name(target)?;
            }
            builder.append_data(&mut header, path, tokio::io::empty()).await?;
            Ok(0)
        }
        FileType::NamedPipe => {
            let mut header = header_for(entry, EntryType::Fifo, 0o644);
            builder.append_data(&mut header, path, tokio::io::empty()).await?;
            Ok(0)
        }
        other @ (FileType::Socket | FileType::BlockDevice | FileType::CharDevice) => {
            bail!("Unsupported file type {other}: {}", entry.absolute_path())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{os::unix::fs::FileTypeExt, sync::Arc};

    use super::*;
    use crate::{
        fs::{DirectoryEnumerator, EntryMetadata},
        test_support::{TestEnv, path_str},
        transport::{LocalTransport, ShellTransport},
    };

    /// Relative path, type and link target of every entry under `path`
    async fn snapshot(path: &str) -> Vec<(String, FileType, Option<String>)> {
        LocalTransport
            .walk(path, &[])
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|e| (e.relative_path().to_string(), e.file_type(), e.link_target().map(String::from)))
            .collect()
    }

    fn build_tree(env: &TestEnv) -> String {
        let long_dir = "d".repeat(60);
        env.write("app/files/settings.xml", b"<map/>");
        env.write("app/files/with space/save 1.dat", &[7u8; 10_000]);
        env.write(&format!("app/{long_dir}/{long_dir}/nested.bin"), b"deep");
        env.write("app/empty.txt", b"");
        env.mkdir("app/empty_dir");
        let app = env.root().join("app");
        std::os::unix::fs::symlink("/data/app/com.example-1/lib/arm64", app.join("lib")).unwrap();
        std::os::unix::fs::symlink("x".repeat(150), app.join("long_link")).unwrap();
        let status = std::process::Command::new("mkfifo").arg(app.join("pipe")).status().unwrap();
        assert!(status.success());
        path_str(&app)
    }

    async fn round_trip(options: ArchiveOptions) {
        let env = TestEnv::new();
        let app = build_tree(&env);
        let transport = ShellTransport::new(env.executor().await);
        let entries =
            DirectoryEnumerator::new(env.executor().await).list_detailed(&app, true).await.unwrap().unwrap();

        let codec = ArchiveCodec::new(options);
        let archive = path_str(&env.root().join("data.tar.gz"));
        let sink = transport.open_write(&archive).await.unwrap();
        let built = codec.build_archive(&entries, &transport, sink).await.unwrap();
        assert_eq!(built.entries, entries.len());

        // Privileged extraction
        let restored = path_str(&env.root().join("restored"));
        let source = transport.open_read(&archive).await.unwrap();
        codec.extract_archive(source, &restored, &transport).await.unwrap();
        assert_eq!(snapshot(&restored).await, snapshot(&app).await);

        // Plain filesystem extraction produces the same tree
        let local = path_str(&env.root().join("local"));
        let source = LocalTransport.open_read(&archive).await.unwrap();
        codec.extract_archive(source, &local, &LocalTransport).await.unwrap();
        assert_eq!(snapshot(&local).await, snapshot(&app).await);
        assert_eq!(
            fs_err::read(env.root().join("local/files/with space/save 1.dat")).unwrap(),
            vec![7u8; 10_000]
        );
        let pipe = fs_err::symlink_metadata(env.root().join("local/pipe")).unwrap();
        assert!(pipe.file_type().is_fifo());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn round_trip_plain() {
        round_trip(ArchiveOptions::new(false, None)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn round_trip_compressed() {
        round_trip(ArchiveOptions::new(true, None)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn round_trip_compressed_and_encrypted() {
        let encryption = Encryption::new(Arc::new(XorCipher), "secret", b"salt".to_vec());
        round_trip(ArchiveOptions::new(true, Some(encryption))).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn encrypted_archive_is_not_plain_gzip() {
        let env = TestEnv::new();
        env.write("app/file", b"content");
        let entries = LocalTransport.walk(&path_str(&env.root().join("app")), &[]).await.unwrap().unwrap();
        let encryption = Encryption::new(Arc::new(XorCipher), "secret", Vec::new());

        let mut plain = Vec::new();
        let mut encrypted = Vec::new();
        for (options, out) in [
            (ArchiveOptions::new(true, None), &mut plain),
            (ArchiveOptions::new(true, Some(encryption)), &mut encrypted),
        ] {
            let path = path_str(&env.root().join("out"));
            let sink = LocalTransport.open_write(&path).await.unwrap();
            ArchiveCodec::new(options).build_archive(&entries, &LocalTransport, sink).await.unwrap();
            *out = fs_err::read(&path).unwrap();
        }
        assert_eq!(&plain[..2], &[0x1f, 0x8b]);
        assert_ne!(&encrypted[..2], &[0x1f, 0x8b]);
        assert_eq!(plain.len(), encrypted.len());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_entries_build_same_bytes() {
        let env = TestEnv::new();
        let app = build_tree(&env);
        let entries = LocalTransport.walk(&app, &[]).await.unwrap().unwrap();
        let codec = ArchiveCodec::new(ArchiveOptions::new(true, None));

        let mut outputs = Vec::new();
        for name in ["one.tar.gz", "two.tar.gz"] {
            let path = path_str(&env.root().join(name));
            let sink = LocalTransport.open_write(&path).await.unwrap();
            codec.build_archive(&entries, &LocalTransport, sink).await.unwrap();
            outputs.push(fs_err::read(&path).unwrap());
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_devices_and_sockets() {
        let env = TestEnv::new();
        let codec = ArchiveCodec::default();
        for file_type in [FileType::Socket, FileType::BlockDevice, FileType::CharDevice] {
            let entry = FileEntry::new("dev", "/dev/null", file_type, None)
                .unwrap()
                .with_metadata(EntryMetadata::default());
            let sink = LocalTransport.open_write(&path_str(&env.root().join("x.tar"))).await.unwrap();
            let err = codec.build_archive(&[entry], &LocalTransport, sink).await.unwrap_err();
            assert!(format!("{err:#}").contains("Unsupported file type"), "{err:#}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn changed_files_keep_listed_size() {
        let env = TestEnv::new();
        let grown = path_str(&env.write("app/grown.bin", b"0123456789"));
        let shrunk = path_str(&env.write("app/shrunk.bin", b"abc"));
        let listed = |rel: &str, abs: &str, size| {
            FileEntry::new(rel, abs, FileType::RegularFile, None)
                .unwrap()
                .with_metadata(EntryMetadata { size, mode: 0o600, modified: 0 })
        };
        let entries = [listed("grown.bin", &grown, 4), listed("shrunk.bin", &shrunk, 6)];

        let codec = ArchiveCodec::default();
        let archive = path_str(&env.root().join("app.tar"));
        let sink = LocalTransport.open_write(&archive).await.unwrap();
        let stats = codec.build_archive(&entries, &LocalTransport, sink).await.unwrap();
        assert_eq!(stats, ArchiveStats { entries: 2, bytes: 10 });

        let out = path_str(&env.root().join("out"));
        let source = LocalTransport.open_read(&archive).await.unwrap();
        codec.extract_archive(source, &out, &LocalTransport).await.unwrap();
        assert_eq!(fs_err::read(env.root().join("out/grown.bin")).unwrap(), b"0123");
        assert_eq!(fs_err::read(env.root().join("out/shrunk.bin")).unwrap(), b"abc\0\0\0");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn long_link_targets_use_gnu_records() {
        let env = TestEnv::new();
        let target = format!("/data/app/{}/lib/arm64", "x".repeat(120));
        let entry = FileEntry::new("lib", "/unused", FileType::SymbolicLink, Some(target.clone()))
            .unwrap()
            .with_metadata(EntryMetadata::default());

        let codec = ArchiveCodec::default();
        let archive = path_str(&env.root().join("link.tar"));
        let sink = LocalTransport.open_write(&archive).await.unwrap();
        codec.build_archive(&[entry], &LocalTransport, sink).await.unwrap();
        let bytes = fs_err::read(&archive).unwrap();
        assert!(bytes.windows(GNU_LONG_LINK_NAME.len()).any(|w| w == GNU_LONG_LINK_NAME));

        let out = path_str(&env.root().join("out"));
        let source = LocalTransport.open_read(&archive).await.unwrap();
        codec.extract_archive(source, &out, &LocalTransport).await.unwrap();
        assert_eq!(fs_err::read_link(env.root().join("out/lib")).unwrap(), Path::new(&target));
    }

    #[test]
    fn entry_names_stay_inside_target() {
        assert_eq!(entry_name(Path::new("files/a.txt")).unwrap(), "files/a.txt");
        assert_eq!(entry_name(Path::new("./files/")).unwrap(), "files");
        assert!(entry_name(Path::new("../escape")).is_err());
        assert!(entry_name(Path::new("/abs/path")).is_err());
        assert!(entry_name(Path::new("a/../../b")).is_err());
    }
}
