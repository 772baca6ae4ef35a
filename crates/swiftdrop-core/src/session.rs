//! The sender and receiver transport-session state machines.
//!
//! Each is one long-running async task driven entirely by `wait_for` calls
//! on a [`PeerConnection`] plus the crypto and chunker primitives. Nothing
//! here ever panics or propagates past `run_sender`/`run_receiver`: every
//! failure becomes a `SessionOutcome::Failed` carrying a diagnostic message,
//! so local failures are always caught at the session boundary.

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::chunker::{self, ChunkStream};
use crate::codec::{pack_device_id, unpack_device_id, HandshakePayload, Message, NackCode, ProtoErrorCode};
use crate::config::Config;
use crate::connection::{ConnectionError, PeerConnection};
use crate::sink::{FileSink, IncomingOffer, OfferCallback, OfferDecision};
use crate::transfer::TransferRecord;
use swiftdrop_crypto::{self as crypto, CryptoError, KeyPair, SessionKeys};

/// Local device identity presented during the handshake. Session-scoped,
/// never persisted by this crate.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub short_id: String,
    pub display_name: String,
}

#[derive(Debug)]
pub enum SessionOutcome {
    Completed,
    Cancelled(String),
    Failed(String),
}

#[derive(Debug, Error)]
enum SessionError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("chunker error: {0}")]
    Chunker(#[from] chunker::ChunkerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("cancelled locally")]
    CancelledLocally,
}

enum Step {
    Msg(Message),
    Early(SessionOutcome),
}

async fn wait_with_cancel<T>(
    conn: &mut PeerConnection<T>,
    cancel: &CancelToken,
    timeout: std::time::Duration,
    pred: impl Fn(&Message) -> bool,
) -> Result<Message, SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::CancelledLocally),
        res = conn.wait_for(timeout, pred) => Ok(res?),
    }
}

/// Waits for a message matching `pred`, transparently handling local
/// cancellation, peer `CANCEL`, and timeout as early-exit outcomes.
async fn step<T>(
    conn: &mut PeerConnection<T>,
    cancel: &CancelToken,
    timeout: std::time::Duration,
    pred: impl Fn(&Message) -> bool,
) -> Result<Step, SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let full_pred = |m: &Message| pred(m) || matches!(m, Message::Cancel);
    match wait_with_cancel(conn, cancel, timeout, full_pred).await {
        Ok(Message::Cancel) => {
            let _ = conn.send(&Message::Cancel).await;
            conn.dispose().await;
            Ok(Step::Early(SessionOutcome::Cancelled("peer cancelled".into())))
        }
        Ok(msg) => Ok(Step::Msg(msg)),
        Err(SessionError::CancelledLocally) => {
            let _ = conn.send(&Message::Cancel).await;
            conn.dispose().await;
            Ok(Step::Early(SessionOutcome::Cancelled(
                "cancelled by local request".into(),
            )))
        }
        Err(SessionError::Connection(ConnectionError::Timeout)) => {
            conn.dispose().await;
            Ok(Step::Early(SessionOutcome::Failed("Transfer timed out".into())))
        }
        Err(e) => Err(e),
    }
}

macro_rules! early_return {
    ($step:expr) => {
        match $step {
            Step::Msg(m) => m,
            Step::Early(outcome) => return Ok(outcome),
        }
    };
}

async fn send_protocol_error<T>(conn: &mut PeerConnection<T>, code: ProtoErrorCode, message: impl Into<String>)
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let _ = conn
        .send(&Message::Error {
            code,
            message: message.into(),
        })
        .await;
}

// ---------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------

/// Drive the full sender flow for `record`, which must already have
/// `source_path` set. `on_progress` is called after every meaningful
/// mutation of `record`.
#[instrument(skip_all, fields(transfer = %record.id))]
pub async fn run_sender<T>(
    conn: &mut PeerConnection<T>,
    identity: &PeerIdentity,
    config: &Config,
    record: &mut TransferRecord,
    cancel: &CancelToken,
    mut on_progress: impl FnMut(&TransferRecord),
) -> SessionOutcome
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    match run_sender_inner(conn, identity, config, record, cancel, &mut on_progress).await {
        Ok(outcome) => {
            apply_outcome(record, &outcome);
            on_progress(record);
            outcome
        }
        Err(e) => {
            conn.dispose().await;
            record.fail(e.to_string());
            on_progress(record);
            SessionOutcome::Failed(e.to_string())
        }
    }
}

fn apply_outcome(record: &mut TransferRecord, outcome: &SessionOutcome) {
    match outcome {
        SessionOutcome::Completed => record.complete(),
        SessionOutcome::Cancelled(reason) => {
            record.cancel();
            record.error_message = Some(reason.clone());
        }
        SessionOutcome::Failed(msg) => record.fail(msg.clone()),
    }
}

async fn run_sender_inner<T>(
    conn: &mut PeerConnection<T>,
    identity: &PeerIdentity,
    config: &Config,
    record: &mut TransferRecord,
    cancel: &CancelToken,
    on_progress: &mut impl FnMut(&TransferRecord),
) -> Result<SessionOutcome, SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let source_path = record
        .source_path
        .clone()
        .ok_or_else(|| SessionError::Protocol("outgoing transfer missing source_path".into()))?;

    // 1. HANDSHAKE_INIT
    let keypair = KeyPair::generate();
    conn.send(&Message::HandshakeInit(HandshakePayload {
        version: config.protocol_version,
        public_key: keypair.public_bytes().to_vec(),
        name: identity.display_name.clone(),
        device_id: pack_device_id(&identity.short_id),
    }))
    .await?;
    debug!("sent HANDSHAKE_INIT");

    // 2. Await HANDSHAKE_REPLY or ERROR.
    let msg = early_return!(
        step(conn, cancel, config.handshake_reply_timeout, |m| {
            matches!(m, Message::HandshakeReply(_)) || matches!(m, Message::Error { .. })
        })
        .await?
    );
    let reply = match msg {
        Message::Error { code, message } => {
            conn.dispose().await;
            return Ok(SessionOutcome::Failed(format!("peer error {code:?}: {message}")));
        }
        Message::HandshakeReply(p) => p,
        _ => unreachable!(),
    };
    if !config.version_in_range(reply.version) {
        send_protocol_error(
            conn,
            ProtoErrorCode::VersionMismatch,
            format!("unsupported protocol version {}", reply.version),
        )
        .await;
        conn.dispose().await;
        return Ok(SessionOutcome::Failed(format!(
            "peer advertised unsupported version {}",
            reply.version
        )));
    }

    // 3. Derive session key, send HANDSHAKE_CONFIRM.
    let shared_secret = keypair.shared_secret(&reply.public_key)?;
    let session_keys = SessionKeys::derive(&shared_secret)?;
    conn.send(&Message::HandshakeConfirm {
        hash: session_keys.secret_digest,
    })
    .await?;
    debug!(peer = %unpack_device_id(&reply.device_id), "handshake confirmed");

    // 4. Await any HANDSHAKE_CONFIRM (sender does not byte-compare; the
    //    receiver is authoritative).
    let _ = early_return!(
        step(conn, cancel, config.handshake_confirm_timeout, |m| {
            matches!(m, Message::HandshakeConfirm { .. })
        })
        .await?
    );

    record.transition(crate::transfer::TransferState::AwaitingAccept);
    on_progress(record);

    // 5. Prepare and offer the file.
    let prep = chunker::prepare(&source_path, config.chunk_size).await?;
    record.filename = prep.filename.clone();
    record.file_size = prep.file_size;
    record.chunks_total = prep.chunk_count;
    conn.send(&Message::FileMeta {
        name: prep.filename.clone(),
        size: prep.file_size,
        chunk_size: prep.chunk_size,
        chunk_count: prep.chunk_count,
        checksum: prep.checksum,
    })
    .await?;
    info!(chunks = prep.chunk_count, "sent FILE_META");

    let msg = early_return!(
        step(conn, cancel, config.file_meta_response_timeout, |m| {
            matches!(m, Message::FileAccept) || matches!(m, Message::FileReject { .. })
        })
        .await?
    );
    match msg {
        Message::FileReject { reason } => {
            conn.dispose().await;
            return Ok(SessionOutcome::Cancelled(format!("receiver rejected transfer: {reason}")));
        }
        Message::FileAccept => {}
        _ => unreachable!(),
    }

    record.transition(crate::transfer::TransferState::Transferring);
    on_progress(record);

    // 6. Stream chunks with per-chunk retry on NACK.
    let mut stream = ChunkStream::open(&source_path, prep.chunk_size).await?;
    while let Some(chunk) = stream.next_chunk().await? {
        let mut attempt = 0u32;
        loop {
            let aad = chunk.index.to_be_bytes();
            let enc = crypto::encrypt_chunk(&session_keys.aead_key, &chunk.data, &aad)?;
            conn.send(&Message::ChunkData {
                index: chunk.index,
                iv: enc.iv,
                ciphertext: enc.ciphertext,
                tag: enc.tag,
                plaintext_sha256: chunk.sha256,
            })
            .await?;

            let resp = early_return!(
                step(conn, cancel, config.chunk_ack_timeout, |m| matches!(
                    m,
                    Message::ChunkAck { index } | Message::ChunkNack { index, .. } if *index == chunk.index
                ))
                .await?
            );
            match resp {
                Message::ChunkAck { .. } => {
                    record.record_chunk_ack(chunk.data.len() as u64);
                    on_progress(record);
                    break;
                }
                Message::ChunkNack { code, .. } => {
                    attempt += 1;
                    warn!(index = chunk.index, ?code, attempt, "chunk NACKed, retrying");
                    if attempt > config.max_chunk_retries {
                        conn.dispose().await;
                        return Ok(SessionOutcome::Failed(format!(
                            "chunk {} exhausted retries",
                            chunk.index
                        )));
                    }
                    // Resend the same buffered plaintext, re-encrypted with a fresh IV.
                    continue;
                }
                _ => unreachable!(),
            }
        }
    }

    // 7. Complete and await verification.
    conn.send(&Message::TransferComplete {
        total_chunks: prep.chunk_count,
    })
    .await?;
    record.transition(crate::transfer::TransferState::Verifying);
    on_progress(record);

    let _ = early_return!(
        step(conn, cancel, config.transfer_verified_timeout, |m| {
            matches!(m, Message::TransferVerified)
        })
        .await?
    );

    conn.dispose().await;
    Ok(SessionOutcome::Completed)
}

// ---------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------

/// Drive the full receiver flow for `record`. `offer_cb` is invoked exactly
/// once, at the `awaitingAccept` transition.
#[instrument(skip_all, fields(transfer = %record.id))]
pub async fn run_receiver<T>(
    conn: &mut PeerConnection<T>,
    identity: &PeerIdentity,
    config: &Config,
    record: &mut TransferRecord,
    cancel: &CancelToken,
    offer_cb: &dyn OfferCallback,
    mut on_progress: impl FnMut(&TransferRecord),
) -> SessionOutcome
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    match run_receiver_inner(conn, identity, config, record, cancel, offer_cb, &mut on_progress).await {
        Ok(outcome) => {
            apply_outcome(record, &outcome);
            on_progress(record);
            outcome
        }
        Err(e) => {
            conn.dispose().await;
            record.fail(e.to_string());
            on_progress(record);
            SessionOutcome::Failed(e.to_string())
        }
    }
}

async fn run_receiver_inner<T>(
    conn: &mut PeerConnection<T>,
    identity: &PeerIdentity,
    config: &Config,
    record: &mut TransferRecord,
    cancel: &CancelToken,
    offer_cb: &dyn OfferCallback,
    on_progress: &mut impl FnMut(&TransferRecord),
) -> Result<SessionOutcome, SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    // 1. Await HANDSHAKE_INIT.
    let msg = early_return!(
        step(conn, cancel, config.handshake_reply_timeout, |m| matches!(
            m,
            Message::HandshakeInit(_)
        ))
        .await?
    );
    let init = match msg {
        Message::HandshakeInit(p) => p,
        _ => unreachable!(),
    };
    if !config.version_in_range(init.version) {
        send_protocol_error(
            conn,
            ProtoErrorCode::VersionMismatch,
            format!("unsupported protocol version {}", init.version),
        )
        .await;
        conn.dispose().await;
        return Ok(SessionOutcome::Failed(format!(
            "peer advertised unsupported version {}",
            init.version
        )));
    }
    record.peer_short_id = unpack_device_id(&init.device_id);

    // 2. Generate our own keys, derive the shared secret, reply.
    let keypair = KeyPair::generate();
    let shared_secret = keypair.shared_secret(&init.public_key)?;
    let session_keys = SessionKeys::derive(&shared_secret)?;
    conn.send(&Message::HandshakeReply(HandshakePayload {
        version: config.protocol_version,
        public_key: keypair.public_bytes().to_vec(),
        name: identity.display_name.clone(),
        device_id: pack_device_id(&identity.short_id),
    }))
    .await?;

    // 3. Await peer confirm, compare hashes constant-time, reply in kind.
    let msg = early_return!(
        step(conn, cancel, config.handshake_confirm_timeout, |m| matches!(
            m,
            Message::HandshakeConfirm { .. }
        ))
        .await?
    );
    let peer_hash = match msg {
        Message::HandshakeConfirm { hash } => hash,
        _ => unreachable!(),
    };
    if !crypto::pairing_hash_eq(&peer_hash, &session_keys.secret_digest) {
        send_protocol_error(conn, ProtoErrorCode::PairingRejected, "pairing hash mismatch").await;
        conn.dispose().await;
        return Ok(SessionOutcome::Failed("pairing hash mismatch".into()));
    }
    conn.send(&Message::HandshakeConfirm {
        hash: session_keys.secret_digest,
    })
    .await?;

    record.transition(crate::transfer::TransferState::AwaitingAccept);
    on_progress(record);

    // 4. Await FILE_META, invoke the offer callback.
    let msg = early_return!(
        step(conn, cancel, config.file_meta_response_timeout, |m| matches!(
            m,
            Message::FileMeta { .. }
        ))
        .await?
    );
    let (name, size, chunk_size, chunk_count, checksum) = match msg {
        Message::FileMeta {
            name,
            size,
            chunk_size,
            chunk_count,
            checksum,
        } => (name, size, chunk_size, chunk_count, checksum),
        _ => unreachable!(),
    };
    record.filename = name.clone();
    record.file_size = size;
    record.chunks_total = chunk_count;
    on_progress(record);

    let offer = IncomingOffer {
        filename: name,
        size,
        chunk_size,
        chunk_count,
        checksum,
    };
    let mut sink: Box<dyn FileSink> = match offer_cb.on_incoming_offer(record.id, &offer).await {
        OfferDecision::Reject(reason) => {
            conn.send(&Message::FileReject {
                reason: reason.clone(),
            })
            .await?;
            conn.dispose().await;
            return Ok(SessionOutcome::Cancelled(format!("rejected: {reason}")));
        }
        OfferDecision::Accept(sink) => {
            conn.send(&Message::FileAccept).await?;
            sink
        }
    };

    record.transition(crate::transfer::TransferState::Transferring);
    on_progress(record);

    // 5. Receive chunks in strict order, hashing plaintext as it arrives so
    //    the whole-file digest never requires a second pass over the sink.
    let mut expected_index = 0u32;
    let mut whole_file_hasher = Sha256::new();
    loop {
        if expected_index >= chunk_count {
            break;
        }
        let msg = early_return!(
            step(conn, cancel, config.chunk_ack_timeout, |m| matches!(
                m,
                Message::ChunkData { .. } | Message::TransferComplete { .. }
            ))
            .await?
        );
        match msg {
            Message::TransferComplete { .. } => break,
            Message::ChunkData {
                index,
                iv,
                ciphertext,
                tag,
                plaintext_sha256,
            } => {
                if index != expected_index {
                    send_protocol_error(
                        conn,
                        ProtoErrorCode::InternalError,
                        format!("out-of-sequence chunk: expected {expected_index}, got {index}"),
                    )
                    .await;
                    conn.dispose().await;
                    return Ok(SessionOutcome::Failed(format!(
                        "out-of-sequence chunk: expected {expected_index}, got {index}"
                    )));
                }
                let aad = index.to_be_bytes();
                let plaintext = match crypto::decrypt_chunk(&session_keys.aead_key, &iv, &ciphertext, &tag, &aad) {
                    Ok(p) => p,
                    Err(_) => {
                        conn.send(&Message::ChunkNack {
                            index,
                            code: NackCode::Decryption,
                        })
                        .await?;
                        continue;
                    }
                };
                if !chunker::verify_chunk(&plaintext, &plaintext_sha256) {
                    conn.send(&Message::ChunkNack {
                        index,
                        code: NackCode::Checksum,
                    })
                    .await?;
                    continue;
                }
                let offset = index as u64 * chunk_size as u64;
                sink.write_at(offset, &plaintext).await?;
                whole_file_hasher.update(&plaintext);
                conn.send(&Message::ChunkAck { index }).await?;
                record.record_chunk_ack(plaintext.len() as u64);
                on_progress(record);
                expected_index += 1;
            }
            _ => unreachable!(),
        }
    }

    // 6. Verify whole-file checksum against the offer's.
    sink.flush().await?;
    sink.close().await?;
    record.transition(crate::transfer::TransferState::Verifying);
    on_progress(record);

    let digest: [u8; 32] = whole_file_hasher.finalize().into();
    if digest == checksum {
        conn.send(&Message::TransferVerified).await?;
        conn.dispose().await;
        Ok(SessionOutcome::Completed)
    } else {
        send_protocol_error(conn, ProtoErrorCode::InternalError, "File checksum mismatch").await;
        conn.dispose().await;
        Ok(SessionOutcome::Failed("File checksum mismatch".into()))
    }
}
