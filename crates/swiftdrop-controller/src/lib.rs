//! The controller: a registry of transfers, per-direction concurrency
//! limiting, and the event streams external consumers watch.
//!
//! The controller owns sessions; sessions never hold a back-pointer to it,
//! only an `on_progress` closure and, for incoming transfers, the shared
//! offer callback. No cyclic references required.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use swiftdrop_core::codec::{Message, ProtoErrorCode};
use swiftdrop_core::device::Device;
use swiftdrop_core::sink::{OfferCallback, OfferDecision};
use swiftdrop_core::transfer::TransferRecord;
use swiftdrop_core::{CancelToken, Config, PeerIdentity, SessionOutcome};
use swiftdrop_transport::{connect, TransportListener};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller is at its concurrency limit for this direction")]
    AtCapacity,
    #[error("no transfer with id {0}")]
    NotFound(Uuid),
    #[error("transport error: {0}")]
    Transport(#[from] swiftdrop_transport::TransportError),
}

struct Registry {
    records: HashMap<Uuid, TransferRecord>,
    active: HashSet<Uuid>,
}

/// Owns every in-flight transfer, the two event-broadcast channels, and the
/// send/receive concurrency semaphores. Clone freely: internals are `Arc`'d.
#[derive(Clone)]
pub struct Controller {
    identity: PeerIdentity,
    config: Config,
    registry: Arc<Mutex<Registry>>,
    cancel_tokens: Arc<Mutex<HashMap<Uuid, CancelToken>>>,
    list_tx: broadcast::Sender<Vec<TransferRecord>>,
    record_tx: broadcast::Sender<TransferRecord>,
    send_semaphore: Arc<Semaphore>,
    recv_semaphore: Arc<Semaphore>,
    offer_cb: Arc<dyn OfferCallback>,
    listener: Arc<Mutex<Option<ListenerHandle>>>,
}

struct ListenerHandle {
    port: u16,
    accept_task: tokio::task::JoinHandle<()>,
}

impl Controller {
    pub fn new(identity: PeerIdentity, config: Config, offer_cb: Arc<dyn OfferCallback>) -> Self {
        let (list_tx, _) = broadcast::channel(32);
        let (record_tx, _) = broadcast::channel(256);
        let max = config.max_concurrent_transfers;
        Self {
            identity,
            config,
            registry: Arc::new(Mutex::new(Registry {
                records: HashMap::new(),
                active: HashSet::new(),
            })),
            cancel_tokens: Arc::new(Mutex::new(HashMap::new())),
            list_tx,
            record_tx,
            send_semaphore: Arc::new(Semaphore::new(max)),
            recv_semaphore: Arc::new(Semaphore::new(max)),
            offer_cb,
            listener: Arc::new(Mutex::new(None)),
        }
    }

    pub fn record_updates(&self) -> broadcast::Receiver<TransferRecord> {
        self.record_tx.subscribe()
    }

    pub fn list_updates(&self) -> broadcast::Receiver<Vec<TransferRecord>> {
        self.list_tx.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<TransferRecord> {
        self.registry.lock().await.records.values().cloned().collect()
    }

    /// Begin accepting inbound transfers. Idempotent: calling this while
    /// already listening returns the existing port.
    pub async fn start_receiving(&self, bind_addr: SocketAddr) -> Result<u16, ControllerError> {
        let mut guard = self.listener.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.port);
        }

        let listener = TransportListener::bind(bind_addr).await?;
        let port = listener.port();
        let controller = self.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((conn, peer_addr)) => {
                        let controller = controller.clone();
                        tokio::spawn(async move {
                            controller.handle_incoming(conn, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept loop stopped");
                        break;
                    }
                }
            }
        });

        *guard = Some(ListenerHandle { port, accept_task });
        info!(port, "receiving started");
        Ok(port)
    }

    /// Stop accepting new inbound connections. Idempotent. In-flight
    /// sessions are left to finish on their own.
    pub async fn stop_receiving(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.accept_task.abort();
            info!("receiving stopped");
        }
    }

    async fn handle_incoming<T>(&self, mut conn: swiftdrop_core::PeerConnection<T>, peer_addr: SocketAddr)
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let permit = match self.recv_semaphore.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                warn!(%peer_addr, "rejecting inbound connection: receiver at capacity");
                let _ = conn
                    .send(&Message::Error {
                        code: ProtoErrorCode::InternalError,
                        message: "Receiver busy".to_string(),
                    })
                    .await;
                conn.dispose().await;
                return;
            }
        };

        let mut record = TransferRecord::new_incoming(String::new());
        let id = record.id;
        self.insert_active(record.clone()).await;

        let cancel = CancelToken::new();
        self.cancel_tokens.lock().await.insert(id, cancel.clone());

        let controller = self.clone();
        let offer_cb = self.offer_cb.clone();
        let outcome = swiftdrop_core::run_receiver(
            &mut conn,
            &self.identity,
            &self.config,
            &mut record,
            &cancel,
            offer_cb.as_ref(),
            |r| controller.emit_blocking(r),
        )
        .await;

        self.finish(id, record, &outcome, permit).await;
    }

    /// Initiate an outgoing transfer to `device`. Synchronous failure with
    /// no record created when the controller is at its send-direction
    /// concurrency limit.
    pub async fn send_file(&self, device: &Device, source_path: PathBuf) -> Result<Uuid, ControllerError> {
        let permit = self
            .send_semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| ControllerError::AtCapacity)?;

        let filename = source_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let mut record = TransferRecord::new_outgoing(device.short_id.clone(), filename, 0, source_path);
        let id = record.id;
        self.insert_active(record.clone()).await;

        let cancel = CancelToken::new();
        self.cancel_tokens.lock().await.insert(id, cancel.clone());

        let controller = self.clone();
        let identity = self.identity.clone();
        let config = self.config.clone();
        let addr = device.address;

        tokio::spawn(async move {
            let mut conn = match tokio::time::timeout(config.accept_connection_timeout, connect(addr)).await {
                Ok(Ok(c)) => c,
                Ok(Err(e)) => {
                    record.fail(format!("could not connect to peer: {e}"));
                    controller.finish(id, record, &SessionOutcome::Failed(e.to_string()), permit).await;
                    return;
                }
                Err(_) => {
                    let msg = "timed out connecting to peer".to_string();
                    record.fail(msg.clone());
                    controller.finish(id, record, &SessionOutcome::Failed(msg), permit).await;
                    return;
                }
            };
            let controller2 = controller.clone();
            let outcome = swiftdrop_core::run_sender(&mut conn, &identity, &config, &mut record, &cancel, |r| {
                controller2.emit_blocking(r)
            })
            .await;
            controller.finish(id, record, &outcome, permit).await;
        });

        Ok(id)
    }

    /// Best-effort cancellation: the session observes it at its next
    /// suspension point.
    pub async fn cancel(&self, id: Uuid) -> Result<(), ControllerError> {
        let tokens = self.cancel_tokens.lock().await;
        match tokens.get(&id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(ControllerError::NotFound(id)),
        }
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), ControllerError> {
        let mut registry = self.registry.lock().await;
        if registry.records.remove(&id).is_none() {
            return Err(ControllerError::NotFound(id));
        }
        registry.active.remove(&id);
        self.emit_list(&registry);
        Ok(())
    }

    pub async fn clear_finished(&self) {
        let mut registry = self.registry.lock().await;
        registry.records.retain(|_, r| !r.state.is_terminal());
        let remaining: HashSet<Uuid> = registry.records.keys().copied().collect();
        registry.active.retain(|id| remaining.contains(id));
        self.emit_list(&registry);
    }

    async fn insert_active(&self, record: TransferRecord) {
        let mut registry = self.registry.lock().await;
        registry.active.insert(record.id);
        registry.records.insert(record.id, record.clone());
        self.record_tx.send(record).ok();
        self.emit_list(&registry);
    }

    /// Synchronous progress hook passed into `run_sender`/`run_receiver`:
    /// those functions are generic over any `FnMut`, so this spawns the
    /// actual async registry update rather than block the session loop.
    fn emit_blocking(&self, record: &TransferRecord) {
        let controller = self.clone();
        let record = record.clone();
        tokio::spawn(async move {
            let mut registry = controller.registry.lock().await;
            registry.records.insert(record.id, record.clone());
            controller.record_tx.send(record).ok();
            controller.emit_list(&registry);
        });
    }

    async fn finish(
        &self,
        id: Uuid,
        record: TransferRecord,
        _outcome: &SessionOutcome,
        _permit: OwnedSemaphorePermit,
    ) {
        let mut registry = self.registry.lock().await;
        registry.records.insert(id, record.clone());
        registry.active.remove(&id);
        self.record_tx.send(record).ok();
        self.emit_list(&registry);
        self.cancel_tokens.lock().await.remove(&id);
        // `_permit` is dropped here, releasing the concurrency slot.
    }

    fn emit_list(&self, registry: &Registry) {
        let list = registry.records.values().cloned().collect();
        self.list_tx.send(list).ok();
    }
}

/// Accept every offer unconditionally into a fixed directory. A reference
/// implementation for tests and the CLI demo.
pub use swiftdrop_core::sink::AcceptIntoDirectory;
