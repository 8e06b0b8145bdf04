use super::{ArchiveDescriptor, ArchiveEntry, ArchiveError, Archiver};
use async_trait::async_trait;
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const PACK_MAGIC: &[u8; 4] = b"BPK1";
const ARCHIVE_EXTENSION: &str = "car";

/// Content id prefix for blake3-addressed payloads.
const CONTENT_ID_PREFIX: &str = "b3";
const PIECE_ID_PREFIX: &str = "sha256";

pub fn content_id_of(digest: &blake3::Hash) -> String {
    format!("{}:{}", CONTENT_ID_PREFIX, digest.to_hex())
}

/// Every byte written to the archive also feeds the three digests.
struct HashingWriter<W: Write> {
    inner: W,
    blake: blake3::Hasher,
    sha: Sha256,
    md5: md5::Context,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            blake: blake3::Hasher::new(),
            sha: Sha256::new(),
            md5: md5::Context::new(),
            written: 0,
        }
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.blake.update(&buf[..n]);
        self.sha.update(&buf[..n]);
        self.md5.consume(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Packs a directory into one length-prefixed archive file.
///
/// Entries are written in file-name order so the same input always yields
/// the same content id.
#[derive(Debug, Clone, Default)]
pub struct PackArchiver;

impl PackArchiver {
    pub fn new() -> Self {
        Self
    }

    fn list_files(source_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(source_dir).map_err(|e| ArchiveError::io(source_dir, e))? {
            let entry = entry.map_err(|e| ArchiveError::io(source_dir, e))?;
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn pack(source_dir: &Path, out_dir: &Path) -> Result<ArchiveDescriptor, ArchiveError> {
        let files = Self::list_files(source_dir)?;
        if files.is_empty() {
            return Err(ArchiveError::EmptySource(source_dir.to_path_buf()));
        }

        fs::create_dir_all(out_dir).map_err(|e| ArchiveError::io(out_dir, e))?;
        let tmp_path = out_dir.join(format!(".pack-{}.tmp", std::process::id()));
        let tmp_file = File::create(&tmp_path).map_err(|e| ArchiveError::io(&tmp_path, e))?;
        let mut writer = HashingWriter::new(BufWriter::new(tmp_file));

        writer.write_all(PACK_MAGIC).map_err(|e| ArchiveError::io(&tmp_path, e))?;
        writer
            .write_all(&(files.len() as u32).to_be_bytes())
            .map_err(|e| ArchiveError::io(&tmp_path, e))?;

        let mut entries = Vec::with_capacity(files.len());
        let mut buf = vec![0u8; 64 * 1024];
        for path in &files {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let size = fs::metadata(path).map_err(|e| ArchiveError::io(path, e))?.len();

            writer
                .write_all(&(file_name.len() as u32).to_be_bytes())
                .and_then(|_| writer.write_all(file_name.as_bytes()))
                .and_then(|_| writer.write_all(&size.to_be_bytes()))
                .map_err(|e| ArchiveError::io(&tmp_path, e))?;

            let mut input = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
            let mut file_hasher = blake3::Hasher::new();
            loop {
                let n = input.read(&mut buf).map_err(|e| ArchiveError::io(path, e))?;
                if n == 0 {
                    break;
                }
                file_hasher.update(&buf[..n]);
                writer.write_all(&buf[..n]).map_err(|e| ArchiveError::io(&tmp_path, e))?;
            }

            entries.push(ArchiveEntry {
                file_name,
                size,
                content_id: content_id_of(&file_hasher.finalize()),
            });
        }
        writer.flush().map_err(|e| ArchiveError::io(&tmp_path, e))?;

        let HashingWriter {
            inner,
            blake,
            sha,
            md5: md5_context,
            written: archive_size,
        } = writer;
        drop(inner);

        let content_digest = blake.finalize();
        let piece_id = format!("{}:{}", PIECE_ID_PREFIX, hex::encode(sha.finalize()));
        let checksum = format!("{:x}", md5_context.compute());

        let archive_name = format!("{}.{}", content_digest.to_hex(), ARCHIVE_EXTENSION);
        let archive_path = out_dir.join(&archive_name);
        fs::rename(&tmp_path, &archive_path).map_err(|e| ArchiveError::io(&archive_path, e))?;

        Ok(ArchiveDescriptor {
            archive_name,
            archive_path,
            archive_size,
            checksum,
            content_id: content_id_of(&content_digest),
            piece_id,
            entries,
        })
    }
}

#[async_trait]
impl Archiver for PackArchiver {
    async fn bundle(&self, source_dir: &Path, out_dir: &Path) -> Result<ArchiveDescriptor, ArchiveError> {
        let source = source_dir.to_path_buf();
        let out = out_dir.to_path_buf();
        debug!("Packing {:?} into {:?}", source, out);

        let descriptor = tokio::task::spawn_blocking(move || Self::pack(&source, &out))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))??;

        info!(
            "Archive created in {:?}, content_id={}, size={}",
            out_dir, descriptor.content_id, descriptor.archive_size
        );
        Ok(descriptor)
    }
}
