//! A framing-aware adapter over any ordered byte stream.
//!
//! Generalizes a `StreamTrait`/`DynStream`-style placeholder into a
//! concrete buffer-and-extract pump: bytes arrive,
//! complete frames are pulled out greedily, and callers block on
//! `wait_for` for the next message matching a predicate.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{self, CodecError, Message};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("timed out waiting for a message")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
}

/// Wraps a connected, ordered byte stream and speaks [`Message`] framing
/// over it. Partial frames stay buffered across reads; a single read may
/// surface zero, one, or many messages.
pub struct PeerConnection<T> {
    stream: T,
    recv_buf: BytesMut,
    queue: VecDeque<Message>,
    send_seq: u32,
    closed: bool,
}

impl<T> PeerConnection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            recv_buf: BytesMut::with_capacity(READ_CHUNK),
            queue: VecDeque::new(),
            send_seq: 0,
            closed: false,
        }
    }

    /// Encode and send `msg` with the next sequence number in send order.
    pub async fn send(&mut self, msg: &Message) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::ConnectionClosed);
        }
        let frame = codec::encode(msg, self.send_seq);
        self.send_seq = self.send_seq.wrapping_add(1);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Block until a message matching `predicate` arrives, or `timeout`
    /// elapses. Messages that don't match remain queued for a later call.
    pub async fn wait_for<F>(&mut self, timeout: Duration, predicate: F) -> Result<Message, ConnectionError>
    where
        F: Fn(&Message) -> bool,
    {
        tokio::time::timeout(timeout, self.wait_for_inner(predicate))
            .await
            .map_err(|_| ConnectionError::Timeout)?
    }

    async fn wait_for_inner<F>(&mut self, predicate: F) -> Result<Message, ConnectionError>
    where
        F: Fn(&Message) -> bool,
    {
        loop {
            if let Some(pos) = self.queue.iter().position(|m| predicate(m)) {
                return Ok(self.queue.remove(pos).unwrap());
            }
            if self.closed {
                return Err(ConnectionError::ConnectionClosed);
            }
            self.read_more().await?;
        }
    }

    async fn read_more(&mut self) -> Result<(), ConnectionError> {
        let mut tmp = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut tmp).await?;
        if n == 0 {
            self.closed = true;
            return Ok(());
        }
        self.recv_buf.put_slice(&tmp[..n]);
        self.extract_frames()
    }

    fn extract_frames(&mut self) -> Result<(), ConnectionError> {
        loop {
            match codec::decode(&self.recv_buf)? {
                Some((msg, _seq, consumed)) => {
                    self.recv_buf.advance(consumed);
                    self.queue.push_back(msg);
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Local close: finishes any in-flight write, shuts the stream down, and
    /// fails subsequent `wait_for` calls with `ConnectionClosed`.
    pub async fn dispose(&mut self) {
        self.closed = true;
        let _ = self.stream.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Message;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn send_and_receive_round_trip() {
        let (a, b) = duplex(4096);
        let mut conn_a = PeerConnection::new(a);
        let mut conn_b = PeerConnection::new(b);

        conn_a.send(&Message::Cancel).await.unwrap();
        let msg = conn_b
            .wait_for(Duration::from_secs(1), |m| matches!(m, Message::Cancel))
            .await
            .unwrap();
        assert_eq!(msg, Message::Cancel);
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let (_a, b) = duplex(4096);
        let mut conn_b: PeerConnection<_> = PeerConnection::new(b);
        let result = conn_b
            .wait_for(Duration::from_millis(50), |m| matches!(m, Message::Cancel))
            .await;
        assert!(matches!(result, Err(ConnectionError::Timeout)));
    }

    #[tokio::test]
    async fn non_matching_messages_stay_queued() {
        let (a, b) = duplex(4096);
        let mut conn_a = PeerConnection::new(a);
        let mut conn_b = PeerConnection::new(b);

        conn_a.send(&Message::FileAccept).await.unwrap();
        conn_a.send(&Message::Cancel).await.unwrap();

        let cancel = conn_b
            .wait_for(Duration::from_secs(1), |m| matches!(m, Message::Cancel))
            .await
            .unwrap();
        assert_eq!(cancel, Message::Cancel);

        let accept = conn_b
            .wait_for(Duration::from_secs(1), |m| matches!(m, Message::FileAccept))
            .await
            .unwrap();
        assert_eq!(accept, Message::FileAccept);
    }

    #[tokio::test]
    async fn closed_connection_fails_wait_for() {
        let (a, b) = duplex(4096);
        let mut conn_a = PeerConnection::new(a);
        let mut conn_b = PeerConnection::new(b);

        conn_a.dispose().await;
        let result = conn_b
            .wait_for(Duration::from_secs(1), |m| matches!(m, Message::Cancel))
            .await;
        assert!(matches!(result, Err(ConnectionError::ConnectionClosed)));
    }
}
