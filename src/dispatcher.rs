use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::error::TftpError;
use crate::packet::{ErrorCode, Packet};
use crate::session::{next_session_id, Direction, TransferSession, TransferSummary};
use crate::storage::Storage;
use crate::transport::{Endpoint, Transport};
use crate::MAX_PACKET_SIZE;

pub type SessionHandle = JoinHandle<Result<TransferSummary, TftpError>>;

// A retransmitted request carries the same client endpoint, file and direction.
type TransferKey = (SocketAddr, String, Direction);
type Active = Arc<Mutex<HashSet<TransferKey>>>;

/// Marks a transfer as running until the session task drops it.
struct ActiveTransfer {
    active: Active,
    key: TransferKey,
}

impl ActiveTransfer {
    fn register(active: &Active, key: TransferKey) -> Option<Self> {
        let inserted = active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        inserted.then(|| Self {
            active: Arc::clone(active),
            key,
        })
    }
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Accepts requests on the well-known endpoint and runs each transfer as its
/// own task on a fresh endpoint.
pub struct Dispatcher<T: Transport, S: Storage> {
    listener: T::Endpoint,
    transport: Arc<T>,
    storage: Arc<S>,
    config: Config,
    active: Active,
}

impl<T: Transport, S: Storage> Dispatcher<T, S> {
    pub fn new(listener: T::Endpoint, transport: T, storage: S, config: Config) -> Self {
        Self {
            listener,
            transport: Arc::new(transport),
            storage: Arc::new(storage),
            config,
            active: Active::default(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(&self) -> Result<(), TftpError> {
        loop {
            self.accept().await?;
        }
    }

    /// Handles one inbound datagram. Returns the spawned session, if any.
    /// Only a failure of the listening endpoint itself is returned as an error.
    pub async fn accept(&self) -> Result<Option<SessionHandle>, TftpError> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (num, addr) = self.listener.recv_from(&mut buf).await?;

        let (filename, mode, direction) = match Packet::decode(&buf[..num]) {
            Ok(Packet::RRQ { filename, mode }) => (filename, mode, Direction::Read),
            Ok(Packet::WRQ { filename, mode }) => (filename, mode, Direction::Write),
            Ok(other) => {
                debug!(%addr, packet = %other, "not a request");
                self.refuse(addr, format!("expected RRQ or WRQ, got {other}"))
                    .await;
                return Ok(None);
            }
            Err(e) => {
                debug!(%addr, error = %e, "undecodable request");
                self.refuse(addr, e.to_string()).await;
                return Ok(None);
            }
        };

        let key = (addr, filename.clone(), direction);
        let Some(guard) = ActiveTransfer::register(&self.active, key) else {
            debug!(%addr, ?direction, %filename, "duplicate request for a running transfer");
            return Ok(None);
        };

        let id = next_session_id();
        info!(id, %addr, ?direction, %filename, %mode, "request received");

        let endpoint = match self.transport.open().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(id, %addr, error = %e, "could not open transfer endpoint");
                self.reply_error(addr, ErrorCode::NotDefined, "server busy".into())
                    .await;
                return Ok(None);
            }
        };

        let storage = Arc::clone(&self.storage);
        let config = self.config.clone();
        let span = info_span!("session", id, peer = %addr);
        let handle = task::spawn(
            async move {
                let _guard = guard;
                let mut session =
                    TransferSession::server(id, endpoint, addr, direction, mode, config);
                session.serve(&*storage, &filename).await
            }
            .instrument(span),
        );
        Ok(Some(handle))
    }

    async fn refuse(&self, addr: SocketAddr, msg: String) {
        self.reply_error(addr, ErrorCode::IllegalOperation, msg).await;
    }

    async fn reply_error(&self, addr: SocketAddr, code: ErrorCode, msg: String) {
        let reply = Packet::ERROR { code, msg };
        if let Err(e) = self.listener.send_to(&reply.encode(), addr).await {
            warn!(%addr, error = %e, "could not send error reply");
        }
    }
}
