// dbsnapshot/src/backup/archive.rs
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::errors::BackupError;
use crate::utils::interrupt::Interrupt;

const CHUNK_SIZE: usize = 64 * 1024;

/// A fully written, compressed dump waiting to be put in place.
///
/// Dropping it without persisting deletes the staging file.
#[derive(Debug)]
pub struct StagedArtifact {
    pub file: NamedTempFile,
    /// Compressed size in bytes.
    pub size: u64,
    /// Size of the uncompressed dump.
    pub raw_size: u64,
    /// Hex SHA-256 of the compressed bytes.
    pub sha256: String,
}

/// Write adapter that hashes and counts everything passing through it.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streams `reader` through gzip into a temp file inside `staging_dir`.
///
/// The dump is never held in memory; the digest and size of the compressed output are
/// computed while writing. Read errors are attributed to the snapshot source, write
/// errors to local storage.
pub async fn compress_stream(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    staging_dir: &Path,
    interrupt: &Interrupt,
) -> Result<StagedArtifact, BackupError> {
    std::fs::create_dir_all(staging_dir).map_err(BackupError::local_write(staging_dir))?;

    let mut staged = tempfile::Builder::new()
        .prefix(".staging-")
        .suffix(".partial")
        .tempfile_in(staging_dir)
        .map_err(BackupError::local_write(staging_dir))?;
    let staged_path = staged.path().to_path_buf();

    let (size, sha256, raw_size) = {
        let sink = DigestWriter::new(BufWriter::new(staged.as_file_mut()));
        let mut encoder = GzEncoder::new(sink, Compression::default());
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut raw_size = 0u64;

        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf) => read.map_err(|e| {
                    BackupError::SnapshotUnavailable(format!("reading dump stream: {}", e))
                })?,
                stop = interrupt.triggered() => return Err(stop),
            };
            if n == 0 {
                break;
            }
            encoder
                .write_all(&buf[..n])
                .map_err(BackupError::local_write(&staged_path))?;
            raw_size += n as u64;
        }

        let sink = encoder
            .finish()
            .map_err(BackupError::local_write(&staged_path))?;
        let (buffered, sha256, size) = sink.finish();
        let file = buffered
            .into_inner()
            .map_err(|e| BackupError::local_write(&staged_path)(e.into_error()))?;
        file.sync_all().map_err(BackupError::local_write(&staged_path))?;
        (size, sha256, raw_size)
    };

    tracing::debug!(
        "🗜 Compressed {} dump bytes into {} bytes at {}",
        raw_size,
        size,
        staged_path.display()
    );

    Ok(StagedArtifact {
        file: staged,
        size,
        raw_size,
        sha256,
    })
}

/// Decompresses a gzip artifact into `sink`, returning the number of plain bytes written.
pub fn decompress_to<W: Write>(archive_path: &Path, sink: &mut W) -> io::Result<u64> {
    let archive_file = File::open(archive_path)?;
    let mut decoder = GzDecoder::new(BufReader::new(archive_file));
    io::copy(&mut decoder, sink)
}

/// Forwards writes to an async consumer from a blocking thread.
struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "decompressed stream consumer went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decompresses a gzip artifact into an async sink, stopping when `interrupt` fires.
///
/// Decoding runs on a blocking thread; the sink sees the plain bytes in order.
pub async fn decompress_stream<W>(
    archive_path: &Path,
    sink: &mut W,
    interrupt: &Interrupt,
) -> Result<u64, BackupError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(4);
    let path = archive_path.to_path_buf();
    let decoder = tokio::task::spawn_blocking(move || {
        let mut writer = BufWriter::with_capacity(CHUNK_SIZE, ChannelWriter { tx });
        let written = decompress_to(&path, &mut writer)?;
        writer.flush()?;
        Ok::<u64, io::Error>(written)
    });

    let mut forwarded = 0u64;
    loop {
        let chunk = tokio::select! {
            chunk = rx.recv() => chunk,
            stop = interrupt.triggered() => return Err(stop),
        };
        let Some(chunk) = chunk else {
            break;
        };
        sink.write_all(&chunk).await.map_err(|e| {
            BackupError::Unexpected(anyhow::Error::new(e).context("Failed to feed the restore client"))
        })?;
        forwarded += chunk.len() as u64;
    }
    sink.flush().await.map_err(|e| {
        BackupError::Unexpected(anyhow::Error::new(e).context("Failed to feed the restore client"))
    })?;

    decoder
        .await
        .map_err(|e| BackupError::Unexpected(anyhow::Error::new(e).context("decompression task panicked")))?
        .map_err(|e| {
            BackupError::Unexpected(anyhow::Error::new(e).context(format!(
                "Failed to decompress {}",
                archive_path.display()
            )))
        })?;
    Ok(forwarded)
}

/// Hex SHA-256 of a file, read in chunks.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
