//! The writable-sink and offer-acceptance collaborator contracts the core
//! consumes from its host application.
//!
//! The core only depends on the trait; `LocalFileSink` is a reference
//! implementation good enough for the CLI demo and for tests, not a
//! persistence layer the core itself owns.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use uuid::Uuid;

use crate::chunker::FilePrep;

/// A seekable, writable destination for an incoming transfer's plaintext.
#[async_trait]
pub trait FileSink: Send {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()>;
    async fn flush(&mut self) -> std::io::Result<()>;
    async fn close(&mut self) -> std::io::Result<()>;
}

/// Local-filesystem sink: writes at `offset`, growing the file as needed.
pub struct LocalFileSink {
    file: File,
    path: PathBuf,
}

impl LocalFileSink {
    pub async fn create(path: PathBuf) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FileSink for LocalFileSink {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush().await
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }
}

/// What the receiver offers its host application when `FILE_META` arrives.
#[derive(Debug, Clone)]
pub struct IncomingOffer {
    pub filename: String,
    pub size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub checksum: [u8; 32],
}

impl From<&FilePrep> for IncomingOffer {
    fn from(p: &FilePrep) -> Self {
        Self {
            filename: p.filename.clone(),
            size: p.file_size,
            chunk_size: p.chunk_size,
            chunk_count: p.chunk_count,
            checksum: p.checksum,
        }
    }
}

/// Accept, supplying a sink to write into, or reject with a human-readable
/// reason that is sent back to the sender verbatim.
pub enum OfferDecision {
    Accept(Box<dyn FileSink>),
    Reject(String),
}

/// Invoked exactly once per inbound transfer, at the `awaitingAccept`
/// transition. Implementations may be backed by a UI prompt, a policy
/// engine, or, for tests and the CLI demo, an unconditional accept.
#[async_trait]
pub trait OfferCallback: Send + Sync {
    async fn on_incoming_offer(&self, transfer_id: Uuid, offer: &IncomingOffer) -> OfferDecision;
}

/// Accepts every offer into `dir/<filename>`. Used by the CLI demo.
pub struct AcceptIntoDirectory {
    pub dir: PathBuf,
}

#[async_trait]
impl OfferCallback for AcceptIntoDirectory {
    async fn on_incoming_offer(&self, _transfer_id: Uuid, offer: &IncomingOffer) -> OfferDecision {
        match LocalFileSink::create(self.dir.join(&offer.filename)).await {
            Ok(sink) => OfferDecision::Accept(Box::new(sink)),
            Err(e) => OfferDecision::Reject(format!("could not open destination file: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_sink_writes_out_of_order_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut sink = LocalFileSink::create(path.clone()).await.unwrap();

        sink.write_at(4, b"world").await.unwrap();
        sink.write_at(0, b"hi, ").await.unwrap();
        sink.close().await.unwrap();

        let data = tokio::fs::read(&path).await.unwrap();
        assert_eq!(&data, b"hi, world");
    }
}
