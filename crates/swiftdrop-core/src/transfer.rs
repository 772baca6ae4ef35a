//! The transfer record: one process-local transfer, its state machine
//! snapshot, and progress counters.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Handshaking,
    AwaitingAccept,
    Transferring,
    Verifying,
    Completed,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub direction: Direction,
    pub peer_short_id: String,
    pub filename: String,
    pub file_size: u64,
    pub source_path: Option<PathBuf>,
    pub sink_path: Option<PathBuf>,
    pub state: TransferState,
    pub chunks_total: u32,
    pub chunks_completed: u32,
    pub bytes_transferred: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PartialEq for TransferRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for TransferRecord {}

impl TransferRecord {
    pub fn new_outgoing(peer_short_id: String, filename: String, file_size: u64, source_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction: Direction::Outgoing,
            peer_short_id,
            filename,
            file_size,
            source_path: Some(source_path),
            sink_path: None,
            state: TransferState::Handshaking,
            chunks_total: 0,
            chunks_completed: 0,
            bytes_transferred: 0,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn new_incoming(peer_short_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction: Direction::Incoming,
            peer_short_id,
            filename: String::new(),
            file_size: 0,
            source_path: None,
            sink_path: None,
            state: TransferState::Handshaking,
            chunks_total: 0,
            chunks_completed: 0,
            bytes_transferred: 0,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    /// Move to a non-terminal state. No-op once terminal (absorbing states).
    pub fn transition(&mut self, next: TransferState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = next;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.error_message = Some(message.into());
        self.state = TransferState::Failed;
    }

    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TransferState::Cancelled;
    }

    pub fn complete(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TransferState::Completed;
    }

    pub fn record_chunk_ack(&mut self, chunk_len: u64) {
        self.chunks_completed = (self.chunks_completed + 1).min(self.chunks_total);
        self.bytes_transferred = (self.bytes_transferred + chunk_len).min(self.file_size);
    }
}
