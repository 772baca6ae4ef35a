//! End-to-end sender/receiver scenarios, driven over an in-memory duplex
//! stream instead of a real socket.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::duplex;
use uuid::Uuid;

use swiftdrop_core::cancel::CancelToken;
use swiftdrop_core::codec::{pack_device_id, HandshakePayload, Message, NackCode, ProtoErrorCode};
use swiftdrop_core::config::Config;
use swiftdrop_core::connection::PeerConnection;
use swiftdrop_core::session::{run_receiver, run_sender, PeerIdentity, SessionOutcome};
use swiftdrop_core::sink::{FileSink, IncomingOffer, LocalFileSink, OfferCallback, OfferDecision};
use swiftdrop_core::transfer::{Direction, TransferRecord, TransferState};
use swiftdrop_crypto::{self as crypto, KeyPair, SessionKeys};

fn identity(short_id: &str) -> PeerIdentity {
    PeerIdentity {
        short_id: short_id.to_string(),
        display_name: format!("Test {short_id}"),
    }
}

fn write_temp(bytes: &[u8]) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(bytes).unwrap();
    f.flush().unwrap();
    f
}

struct AlwaysAccept {
    dir: std::path::PathBuf,
}

#[async_trait]
impl OfferCallback for AlwaysAccept {
    async fn on_incoming_offer(&self, _id: Uuid, offer: &IncomingOffer) -> OfferDecision {
        match LocalFileSink::create(self.dir.join(&offer.filename)).await {
            Ok(sink) => OfferDecision::Accept(Box::new(sink)),
            Err(e) => OfferDecision::Reject(format!("could not open sink: {e}")),
        }
    }
}

struct AlwaysReject;

#[async_trait]
impl OfferCallback for AlwaysReject {
    async fn on_incoming_offer(&self, _id: Uuid, _offer: &IncomingOffer) -> OfferDecision {
        OfferDecision::Reject("no room".to_string())
    }
}

#[tokio::test]
async fn s1_happy_path_256kib_file() {
    let data: Vec<u8> = (0..256 * 1024u32).map(|i| ((i * 13 + 7) % 256) as u8).collect();
    let src = write_temp(&data);
    let out_dir = tempfile::tempdir().unwrap();

    let config = {
        let mut c = Config::default();
        c.chunk_size = 64 * 1024;
        c
    };

    let (a, b) = duplex(1 << 20);
    let mut sender_conn = PeerConnection::new(a);
    let mut receiver_conn = PeerConnection::new(b);

    let mut sender_record = TransferRecord::new_outgoing("receiver".to_string(), String::new(), 0, src.path().to_path_buf());
    let mut receiver_record = TransferRecord::new_incoming("sender".to_string());

    let sender_cancel = CancelToken::new();
    let receiver_cancel = CancelToken::new();
    let offer_cb = AlwaysAccept { dir: out_dir.path().to_path_buf() };

    let mut sender_states = Vec::new();
    let mut receiver_states = Vec::new();

    let (sender_outcome, receiver_outcome) = tokio::join!(
        run_sender(
            &mut sender_conn,
            &identity("sender"),
            &config,
            &mut sender_record,
            &sender_cancel,
            |r| sender_states.push(r.state),
        ),
        run_receiver(
            &mut receiver_conn,
            &identity("receiver"),
            &config,
            &mut receiver_record,
            &receiver_cancel,
            &offer_cb,
            |r| receiver_states.push(r.state),
        ),
    );

    assert!(matches!(sender_outcome, SessionOutcome::Completed));
    assert!(matches!(receiver_outcome, SessionOutcome::Completed));
    assert_eq!(sender_record.chunks_completed, 4);
    assert_eq!(sender_record.state, TransferState::Completed);

    assert!(sender_states.contains(&TransferState::Handshaking) || sender_states.first() == Some(&TransferState::AwaitingAccept));
    assert!(sender_states.contains(&TransferState::AwaitingAccept));
    assert!(sender_states.contains(&TransferState::Transferring));
    assert!(sender_states.contains(&TransferState::Verifying));
    assert!(sender_states.contains(&TransferState::Completed));

    let received = std::fs::read(out_dir.path().join(src.path().file_name().unwrap())).unwrap();
    assert_eq!(received, data);
}

#[tokio::test]
async fn s2_receiver_declines() {
    let data = vec![1u8, 2, 3, 4, 5];
    let src = write_temp(&data);
    let config = Config::default();

    let (a, b) = duplex(1 << 16);
    let mut sender_conn = PeerConnection::new(a);
    let mut receiver_conn = PeerConnection::new(b);

    let mut sender_record = TransferRecord::new_outgoing("receiver".to_string(), String::new(), 0, src.path().to_path_buf());
    let mut receiver_record = TransferRecord::new_incoming("sender".to_string());

    let sender_cancel = CancelToken::new();
    let receiver_cancel = CancelToken::new();
    let offer_cb = AlwaysReject;

    let (sender_outcome, receiver_outcome) = tokio::join!(
        run_sender(&mut sender_conn, &identity("sender"), &config, &mut sender_record, &sender_cancel, |_| {}),
        run_receiver(
            &mut receiver_conn,
            &identity("receiver"),
            &config,
            &mut receiver_record,
            &receiver_cancel,
            &offer_cb,
            |_| {},
        ),
    );

    match sender_outcome {
        SessionOutcome::Cancelled(msg) => assert!(msg.contains("rejected")),
        other => panic!("expected sender Cancelled, got {other:?}"),
    }
    assert_eq!(sender_record.direction, Direction::Outgoing);
    assert_eq!(sender_record.state, TransferState::Cancelled);
    assert!(matches!(receiver_outcome, SessionOutcome::Cancelled(_)));
}

#[tokio::test]
async fn s3_version_mismatch_reported_to_mock_receiver() {
    let data = vec![9u8; 16];
    let src = write_temp(&data);
    let config = Config::default();

    let (a, b) = duplex(1 << 16);
    let mut sender_conn = PeerConnection::new(a);
    let mut mock_conn = PeerConnection::new(b);

    let mut sender_record = TransferRecord::new_outgoing("mock".to_string(), String::new(), 0, src.path().to_path_buf());
    let sender_cancel = CancelToken::new();

    let mock = async {
        let init = mock_conn
            .wait_for(Duration::from_secs(5), |m| matches!(m, Message::HandshakeInit(_)))
            .await
            .unwrap();
        assert!(matches!(init, Message::HandshakeInit(_)));

        mock_conn
            .send(&Message::HandshakeReply(HandshakePayload {
                version: 999,
                public_key: vec![0u8; 65],
                name: "mock".to_string(),
                device_id: pack_device_id("mockrecv"),
            }))
            .await
            .unwrap();

        let err = mock_conn
            .wait_for(Duration::from_secs(5), |m| matches!(m, Message::Error { .. }))
            .await
            .unwrap();
        match err {
            Message::Error { code, message } => {
                assert_eq!(code, ProtoErrorCode::VersionMismatch);
                assert!(message.contains("999"));
            }
            _ => unreachable!(),
        }
    };

    let (sender_outcome, _) = tokio::join!(
        run_sender(&mut sender_conn, &identity("sender"), &config, &mut sender_record, &sender_cancel, |_| {}),
        mock,
    );

    match sender_outcome {
        SessionOutcome::Failed(msg) => assert!(msg.contains("999")),
        other => panic!("expected sender Failed, got {other:?}"),
    }
}

/// Replays the receiver side of the protocol by hand so it can deliberately
/// NACK chunk 2 once before accepting its retransmission.
async fn flaky_receiver<T>(conn: &mut PeerConnection<T>, config: &Config) -> Vec<u8>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    let timeout = Duration::from_secs(5);

    let init = match conn.wait_for(timeout, |m| matches!(m, Message::HandshakeInit(_))).await.unwrap() {
        Message::HandshakeInit(p) => p,
        _ => unreachable!(),
    };
    let keypair = KeyPair::generate();
    let shared_secret = keypair.shared_secret(&init.public_key).unwrap();
    let session_keys = SessionKeys::derive(&shared_secret).unwrap();

    conn.send(&Message::HandshakeReply(HandshakePayload {
        version: config.protocol_version,
        public_key: keypair.public_bytes().to_vec(),
        name: "flaky".to_string(),
        device_id: pack_device_id("flaky"),
    }))
    .await
    .unwrap();

    conn.wait_for(timeout, |m| matches!(m, Message::HandshakeConfirm { .. })).await.unwrap();
    conn.send(&Message::HandshakeConfirm { hash: session_keys.secret_digest }).await.unwrap();

    let (chunk_size, chunk_count) = match conn.wait_for(timeout, |m| matches!(m, Message::FileMeta { .. })).await.unwrap() {
        Message::FileMeta { chunk_size, chunk_count, .. } => (chunk_size, chunk_count),
        _ => unreachable!(),
    };
    conn.send(&Message::FileAccept).await.unwrap();

    let mut out = Vec::new();
    let mut expected_index = 0u32;
    let mut nacked_chunk_2 = false;
    while expected_index < chunk_count {
        let msg = conn
            .wait_for(timeout, |m| matches!(m, Message::ChunkData { .. }))
            .await
            .unwrap();
        let (index, iv, ciphertext, tag) = match msg {
            Message::ChunkData { index, iv, ciphertext, tag, .. } => (index, iv, ciphertext, tag),
            _ => unreachable!(),
        };
        if index == 2 && !nacked_chunk_2 {
            nacked_chunk_2 = true;
            conn.send(&Message::ChunkNack { index, code: NackCode::Checksum }).await.unwrap();
            continue;
        }
        let aad = index.to_be_bytes();
        let plaintext = crypto::decrypt_chunk(&session_keys.aead_key, &iv, &ciphertext, &tag, &aad).unwrap();
        out.extend_from_slice(&plaintext);
        conn.send(&Message::ChunkAck { index }).await.unwrap();
        expected_index += 1;
    }
    let _ = chunk_size;

    conn.wait_for(timeout, |m| matches!(m, Message::TransferComplete { .. })).await.unwrap();
    conn.send(&Message::TransferVerified).await.unwrap();
    out
}

#[tokio::test]
async fn s4_nack_recovery() {
    let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
    let src = write_temp(&data);
    let config = {
        let mut c = Config::default();
        c.chunk_size = 50;
        c
    };

    let (a, b) = duplex(1 << 16);
    let mut sender_conn = PeerConnection::new(a);
    let mut mock_conn = PeerConnection::new(b);

    let mut sender_record = TransferRecord::new_outgoing("mock".to_string(), String::new(), 0, src.path().to_path_buf());
    let sender_cancel = CancelToken::new();

    let (sender_outcome, received) = tokio::join!(
        run_sender(&mut sender_conn, &identity("sender"), &config, &mut sender_record, &sender_cancel, |_| {}),
        flaky_receiver(&mut mock_conn, &config),
    );

    assert!(matches!(sender_outcome, SessionOutcome::Completed));
    assert_eq!(received, data);
    assert_eq!(sender_record.chunks_completed, 4);
}

#[tokio::test]
async fn s5_empty_file_round_trip() {
    let src = write_temp(b"");
    let out_dir = tempfile::tempdir().unwrap();
    let config = Config::default();

    let (a, b) = duplex(1 << 16);
    let mut sender_conn = PeerConnection::new(a);
    let mut receiver_conn = PeerConnection::new(b);

    let mut sender_record = TransferRecord::new_outgoing("receiver".to_string(), String::new(), 0, src.path().to_path_buf());
    let mut receiver_record = TransferRecord::new_incoming("sender".to_string());
    let sender_cancel = CancelToken::new();
    let receiver_cancel = CancelToken::new();
    let offer_cb = AlwaysAccept { dir: out_dir.path().to_path_buf() };

    let (sender_outcome, receiver_outcome) = tokio::join!(
        run_sender(&mut sender_conn, &identity("sender"), &config, &mut sender_record, &sender_cancel, |_| {}),
        run_receiver(
            &mut receiver_conn,
            &identity("receiver"),
            &config,
            &mut receiver_record,
            &receiver_cancel,
            &offer_cb,
            |_| {},
        ),
    );

    assert!(matches!(sender_outcome, SessionOutcome::Completed));
    assert!(matches!(receiver_outcome, SessionOutcome::Completed));
    assert_eq!(sender_record.chunks_total, 1);
    assert_eq!(sender_record.chunks_completed, 1);

    let received = std::fs::read(out_dir.path().join(src.path().file_name().unwrap())).unwrap();
    assert!(received.is_empty());
}

#[tokio::test]
async fn s6_binary_completeness_256_bytes_chunk_100() {
    let data: Vec<u8> = (0..=255u8).collect();
    let src = write_temp(&data);
    let out_dir = tempfile::tempdir().unwrap();
    let config = {
        let mut c = Config::default();
        c.chunk_size = 100;
        c
    };

    let (a, b) = duplex(1 << 16);
    let mut sender_conn = PeerConnection::new(a);
    let mut receiver_conn = PeerConnection::new(b);

    let mut sender_record = TransferRecord::new_outgoing("receiver".to_string(), String::new(), 0, src.path().to_path_buf());
    let mut receiver_record = TransferRecord::new_incoming("sender".to_string());
    let sender_cancel = CancelToken::new();
    let receiver_cancel = CancelToken::new();
    let offer_cb = AlwaysAccept { dir: out_dir.path().to_path_buf() };

    let (sender_outcome, receiver_outcome) = tokio::join!(
        run_sender(&mut sender_conn, &identity("sender"), &config, &mut sender_record, &sender_cancel, |_| {}),
        run_receiver(
            &mut receiver_conn,
            &identity("receiver"),
            &config,
            &mut receiver_record,
            &receiver_cancel,
            &offer_cb,
            |_| {},
        ),
    );

    assert!(matches!(sender_outcome, SessionOutcome::Completed));
    assert!(matches!(receiver_outcome, SessionOutcome::Completed));
    assert_eq!(sender_record.chunks_total, 3);

    let received = std::fs::read(out_dir.path().join(src.path().file_name().unwrap())).unwrap();
    assert_eq!(received, data);
}

#[tokio::test]
async fn cancellation_reaches_terminal_state_on_both_sides() {
    let data = vec![7u8; 4096];
    let src = write_temp(&data);
    let out_dir = tempfile::tempdir().unwrap();
    let config = Config::default();

    let (a, b) = duplex(1 << 16);
    let mut sender_conn = PeerConnection::new(a);
    let mut receiver_conn = PeerConnection::new(b);

    let mut sender_record = TransferRecord::new_outgoing("receiver".to_string(), String::new(), 0, src.path().to_path_buf());
    let mut receiver_record = TransferRecord::new_incoming("sender".to_string());
    let sender_cancel = CancelToken::new();
    let receiver_cancel = CancelToken::new();
    let offer_cb = AlwaysAccept { dir: out_dir.path().to_path_buf() };

    sender_cancel.cancel();

    let (sender_outcome, receiver_outcome) = tokio::join!(
        run_sender(&mut sender_conn, &identity("sender"), &config, &mut sender_record, &sender_cancel, |_| {}),
        run_receiver(
            &mut receiver_conn,
            &identity("receiver"),
            &config,
            &mut receiver_record,
            &receiver_cancel,
            &offer_cb,
            |_| {},
        ),
    );

    assert!(matches!(sender_outcome, SessionOutcome::Cancelled(_)));
    assert!(sender_record.state.is_terminal());
    assert!(receiver_record.state.is_terminal());
    let _ = receiver_outcome;
}
