//! Streaming, fixed-size file chunking with O(chunk_size) memory.
//!
//! Mirrors the shape of a `Manifest::from_file` pass (one sequential pass
//! computing per-block and whole-file digests) but generalized from
//! "produce a manifest of chunk hashes" to "stream chunks lazily for the
//! transport session to encrypt and send one at a time".

use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

#[derive(Debug, Error)]
pub enum ChunkerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Immutable per-transfer file metadata computed at offer time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePrep {
    pub filename: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub checksum: [u8; 32],
}

/// One block produced by `stream_chunks`.
pub struct Chunk {
    pub index: u32,
    pub data: Vec<u8>,
    pub sha256: [u8; 32],
}

fn chunk_count_for(file_size: u64, chunk_size: u32) -> u32 {
    if file_size == 0 {
        return 1;
    }
    ((file_size + chunk_size as u64 - 1) / chunk_size as u64) as u32
}

/// Compute size, chunk count, and whole-file SHA-256 in one sequential pass.
pub async fn prepare(path: &Path, chunk_size: u32) -> Result<FilePrep, ChunkerError> {
    let mut file = File::open(path).await?;
    let file_size = file.metadata().await?.len();

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size as usize];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string();

    let digest = hasher.finalize();
    let mut checksum = [0u8; 32];
    checksum.copy_from_slice(&digest);

    Ok(FilePrep {
        filename,
        file_size,
        chunk_size,
        chunk_count: chunk_count_for(file_size, chunk_size),
        checksum,
    })
}

/// Read chunks sequentially, one block at a time; the final block may be
/// short. No chunk is buffered beyond the one currently yielded.
pub struct ChunkStream {
    file: File,
    chunk_size: u32,
    next_index: u32,
    done: bool,
}

impl ChunkStream {
    pub async fn open(path: &Path, chunk_size: u32) -> Result<Self, ChunkerError> {
        let file = File::open(path).await?;
        Ok(Self {
            file,
            chunk_size,
            next_index: 0,
            done: false,
        })
    }

    /// Read the next chunk, or `None` once the file is exhausted. A 0-byte
    /// file yields exactly one empty chunk (index 0) before finishing.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, ChunkerError> {
        if self.done {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        let is_first = self.next_index == 0;
        if filled == 0 && !is_first {
            self.done = true;
            return Ok(None);
        }
        buf.truncate(filled);
        if filled < self.chunk_size as usize {
            self.done = true;
        }

        let mut hasher = Sha256::new();
        hasher.update(&buf);
        let digest = hasher.finalize();
        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&digest);

        let index = self.next_index;
        self.next_index += 1;

        Ok(Some(Chunk {
            index,
            data: buf,
            sha256,
        }))
    }
}

/// Random-access reader used for NACK retransmission.
pub async fn read_chunk(path: &Path, index: u32, chunk_size: u32) -> Result<Vec<u8>, ChunkerError> {
    let mut file = File::open(path).await?;
    let offset = index as u64 * chunk_size as u64;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buf = vec![0u8; chunk_size as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

pub fn verify_chunk(data: &[u8], digest: &[u8; 32]) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().as_slice() == digest
}

pub async fn verify_file(path: &Path, digest: &[u8; 32]) -> Result<bool, ChunkerError> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().as_slice() == digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use std::io::Write;

    async fn write_temp(bytes: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn empty_file_has_one_chunk() {
        let f = write_temp(b"").await;
        let prep = prepare(f.path(), 64).await.unwrap();
        assert_eq!(prep.chunk_count, 1);
        assert_eq!(prep.file_size, 0);

        let mut stream = ChunkStream::open(f.path(), 64).await.unwrap();
        let chunk = stream.next_chunk().await.unwrap().expect("one chunk");
        assert_eq!(chunk.index, 0);
        assert!(chunk.data.is_empty());
        assert!(stream.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn binary_completeness_256_bytes_chunk_100() {
        let data: Vec<u8> = (0..=255u8).collect();
        let f = write_temp(&data).await;
        let prep = prepare(f.path(), 100).await.unwrap();
        assert_eq!(prep.chunk_count, 3);

        let mut stream = ChunkStream::open(f.path(), 100).await.unwrap();
        let mut lens = Vec::new();
        let mut reassembled = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            lens.push(chunk.data.len());
            assert!(verify_chunk(&chunk.data, &chunk.sha256));
            reassembled.extend_from_slice(&chunk.data);
        }
        assert_eq!(lens, vec![100, 100, 56]);
        assert_eq!(reassembled, data);
        assert!(verify_file(f.path(), &prep.checksum).await.unwrap());
    }

    #[tokio::test]
    async fn read_chunk_matches_stream() {
        let data: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
        let f = write_temp(&data).await;
        let chunk_size = 64;

        let mut stream = ChunkStream::open(f.path(), chunk_size).await.unwrap();
        let mut index = 0;
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            let reread = read_chunk(f.path(), index, chunk_size).await.unwrap();
            assert_eq!(reread, chunk.data);
            index += 1;
        }
    }
}
