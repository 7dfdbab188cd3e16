//! The per-transfer state machine.
//!
//! A session owns one endpoint and runs one transfer, block by block, with a
//! single packet outstanding. The side that sends DATA ("sender": server read,
//! client write) retransmits its last packet on timeout. The side that sends
//! ACKs ("receiver": server write, client read) answers duplicate DATA with
//! its last ACK and otherwise relies on the sender's retransmissions.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::TftpError;
use crate::packet::{Mode, Packet};
use crate::storage::{ReadHandle, Storage, WriteHandle};
use crate::timer::{Expiry, RetransmissionTimer};
use crate::transport::{self, Endpoint};
use crate::{BLOCK_SIZE, MAX_PACKET_SIZE};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// File flows from server to client.
    Read,
    /// File flows from client to server.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Sending,
    AwaitData,
    AwaitAck,
    Complete,
    Errored,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Complete | State::Errored)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub id: u64,
    pub direction: Direction,
    pub role: Role,
    /// DATA blocks transferred, counting the final short block.
    pub blocks: u64,
    pub bytes: u64,
    pub retransmits: u32,
    pub elapsed: Duration,
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed.as_secs_f64();
        let speed = if secs > 0.0 {
            self.bytes as f64 / secs / 1024.0 / 1024.0
        } else {
            0.0
        };
        write!(
            f,
            "{} bytes in {} blocks, cost: {:.3}s, speed: {:.2} MB/s",
            self.bytes, self.blocks, secs, speed
        )
    }
}

enum Inbound {
    Packet(Packet),
    Expired,
}

pub struct TransferSession<E: Endpoint> {
    id: u64,
    endpoint: E,
    peer: SocketAddr,
    // Set once the peer's transfer id is known; a client learns it from the first reply.
    peer_locked: bool,
    direction: Direction,
    role: Role,
    mode: Mode,
    block: u16,
    state: State,
    timer: RetransmissionTimer,
    last_ack: Option<Vec<u8>>,
    config: Config,
    blocks: u64,
    bytes: u64,
    retransmits: u32,
    started: Instant,
}

impl<E: Endpoint> TransferSession<E> {
    /// Server side of a request received from `peer`.
    pub fn server(
        id: u64,
        endpoint: E,
        peer: SocketAddr,
        direction: Direction,
        mode: Mode,
        config: Config,
    ) -> Self {
        Self::new(id, endpoint, peer, true, direction, Role::Server, mode, config)
    }

    /// Client side; `server` is the well-known request endpoint.
    pub fn client(
        endpoint: E,
        server: SocketAddr,
        direction: Direction,
        mode: Mode,
        config: Config,
    ) -> Self {
        let id = next_session_id();
        Self::new(id, endpoint, server, false, direction, Role::Client, mode, config)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        id: u64,
        endpoint: E,
        peer: SocketAddr,
        peer_locked: bool,
        direction: Direction,
        role: Role,
        mode: Mode,
        config: Config,
    ) -> Self {
        Self {
            id,
            endpoint,
            peer,
            peer_locked,
            direction,
            role,
            mode,
            block: 0,
            state: State::Init,
            timer: RetransmissionTimer::new(config.timeout, config.max_retries),
            last_ack: None,
            config,
            blocks: 0,
            bytes: 0,
            retransmits: 0,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Runs the server side of a request for `filename` against `storage`.
    pub async fn serve<S: Storage>(
        &mut self,
        storage: &S,
        filename: &str,
    ) -> Result<TransferSummary, TftpError> {
        let outcome = match (self.role, self.direction) {
            (Role::Server, Direction::Read) => self.serve_read(storage, filename).await,
            (Role::Server, Direction::Write) => self.serve_write(storage, filename).await,
            (Role::Client, _) => Err(TftpError::IllegalOperation(
                "serve called on a client session".into(),
            )),
        };
        self.conclude(outcome).await
    }

    /// Client read: request `filename` and store it through `writer`.
    pub async fn fetch<W: WriteHandle>(
        &mut self,
        filename: &str,
        mut writer: W,
    ) -> Result<TransferSummary, TftpError> {
        let outcome = match (self.role, self.direction) {
            (Role::Client, Direction::Read) => self.client_read(filename, &mut writer).await,
            _ => Err(TftpError::IllegalOperation(
                "fetch needs a client read session".into(),
            )),
        };
        self.conclude(outcome).await
    }

    /// Client write: send the contents of `reader` as `filename`.
    pub async fn push<R: ReadHandle>(
        &mut self,
        filename: &str,
        mut reader: R,
    ) -> Result<TransferSummary, TftpError> {
        let outcome = match (self.role, self.direction) {
            (Role::Client, Direction::Write) => self.client_write(filename, &mut reader).await,
            _ => Err(TftpError::IllegalOperation(
                "push needs a client write session".into(),
            )),
        };
        self.conclude(outcome).await
    }

    async fn serve_read<S: Storage>(
        &mut self,
        storage: &S,
        filename: &str,
    ) -> Result<(), TftpError> {
        let mut reader = storage.open_read(filename, self.mode).await?;
        let last = self.send_next_block(&mut reader).await?;
        self.send_file(&mut reader, last).await
    }

    async fn serve_write<S: Storage>(
        &mut self,
        storage: &S,
        filename: &str,
    ) -> Result<(), TftpError> {
        let mut writer = storage.open_write(filename, self.mode).await?;
        self.state = State::Sending;
        let ack = self.transmit(&Packet::ACK(0)).await?;
        self.last_ack = Some(ack);
        self.timer.arm(None);
        self.receive_file(&mut writer).await
    }

    async fn client_read<W: WriteHandle>(
        &mut self,
        filename: &str,
        writer: &mut W,
    ) -> Result<(), TftpError> {
        self.state = State::Sending;
        let request = Packet::RRQ {
            filename: filename.to_string(),
            mode: self.mode,
        };
        let bytes = self.transmit(&request).await?;
        self.timer.arm(Some(bytes));
        self.receive_file(writer).await
    }

    async fn client_write<R: ReadHandle>(
        &mut self,
        filename: &str,
        reader: &mut R,
    ) -> Result<(), TftpError> {
        self.state = State::Sending;
        let request = Packet::WRQ {
            filename: filename.to_string(),
            mode: self.mode,
        };
        let bytes = self.transmit(&request).await?;
        self.timer.arm(Some(bytes));
        // ACK 0 answers the request; nothing has been sent that could end the transfer.
        self.send_file(reader, false).await
    }

    /// Drives the DATA-sending side until the block flagged `last` is acknowledged.
    async fn send_file<R: ReadHandle>(
        &mut self,
        reader: &mut R,
        mut last: bool,
    ) -> Result<(), TftpError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            self.state = State::AwaitAck;
            match self.next_inbound(&mut buf).await? {
                Inbound::Expired => self.on_expiry().await?,
                Inbound::Packet(Packet::ACK(block)) if block == self.block => {
                    self.timer.cancel();
                    if last {
                        return Ok(());
                    }
                    last = self.send_next_block(reader).await?;
                }
                Inbound::Packet(Packet::ACK(block)) => {
                    debug!(block, expected = self.block, "discarding stale ack");
                }
                Inbound::Packet(Packet::ERROR { code, msg }) => {
                    return Err(TftpError::PeerError { code, message: msg });
                }
                Inbound::Packet(other) => {
                    debug!(packet = %other, "discarding unexpected packet");
                }
            }
        }
    }

    /// Reads the next chunk, sends it as the next block and arms the timer with it.
    /// Returns whether this was the final (short) block.
    async fn send_next_block<R: ReadHandle>(&mut self, reader: &mut R) -> Result<bool, TftpError> {
        self.state = State::Sending;
        let data = reader.read_chunk(BLOCK_SIZE).await?;
        let last = data.len() < BLOCK_SIZE;
        self.block = self.block.wrapping_add(1);
        self.blocks += 1;
        self.bytes += data.len() as u64;
        let packet = Packet::DATA {
            block: self.block,
            data,
        };
        let bytes = self.transmit(&packet).await?;
        self.timer.arm(Some(bytes));
        Ok(last)
    }

    /// Drives the ACK-sending side until a short DATA block has been stored.
    async fn receive_file<W: WriteHandle>(&mut self, writer: &mut W) -> Result<(), TftpError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            self.state = State::AwaitData;
            match self.next_inbound(&mut buf).await? {
                Inbound::Expired => self.on_expiry().await?,
                Inbound::Packet(Packet::DATA { block, data })
                    if block == self.block.wrapping_add(1) =>
                {
                    self.timer.cancel();
                    self.state = State::Sending;
                    let last = data.len() < BLOCK_SIZE;
                    writer.write_chunk(&data).await?;
                    // Only a flushed file gets its final ACK.
                    if last {
                        writer.close().await?;
                    }
                    self.block = block;
                    self.blocks += 1;
                    self.bytes += data.len() as u64;
                    let ack = self.transmit(&Packet::ACK(block)).await?;
                    self.last_ack = Some(ack);
                    if last {
                        return Ok(());
                    }
                    self.timer.arm(None);
                }
                Inbound::Packet(Packet::DATA { block, .. }) => {
                    debug!(
                        block,
                        expected = self.block.wrapping_add(1),
                        "discarding duplicate data"
                    );
                    self.resend_last_ack().await?;
                }
                Inbound::Packet(Packet::ERROR { code, msg }) => {
                    return Err(TftpError::PeerError { code, message: msg });
                }
                Inbound::Packet(other) => {
                    debug!(packet = %other, "discarding unexpected packet");
                }
            }
        }
    }

    async fn resend_last_ack(&self) -> Result<(), TftpError> {
        if let Some(ack) = &self.last_ack {
            self.endpoint.send_to(ack, self.peer).await?;
            debug!(block = self.block, "resent last ack");
        }
        Ok(())
    }

    async fn on_expiry(&mut self) -> Result<(), TftpError> {
        match self.timer.expire() {
            Some(Expiry::Retransmit(bytes)) => {
                warn!(
                    block = self.block,
                    retry = self.timer.retries(),
                    "timeout, retransmitting"
                );
                self.endpoint.send_to(&bytes, self.peer).await?;
                self.retransmits += 1;
                Ok(())
            }
            Some(Expiry::Idle) => {
                debug!(
                    block = self.block,
                    retry = self.timer.retries(),
                    "timeout, still waiting for data"
                );
                Ok(())
            }
            Some(Expiry::Exhausted) => {
                Err(TftpError::MaxRetriesExceeded(self.config.max_retries))
            }
            None => Ok(()),
        }
    }

    /// Waits for the next decodable packet from the peer or the timer deadline.
    async fn next_inbound(&mut self, buf: &mut [u8]) -> Result<Inbound, TftpError> {
        loop {
            let received = match self.timer.deadline() {
                Some(deadline) => transport::receive(&self.endpoint, buf, deadline).await,
                None => self.endpoint.recv_from(buf).await.map_err(TftpError::from),
            };
            let (len, from) = match received {
                Ok(received) => received,
                Err(TftpError::Timeout) => return Ok(Inbound::Expired),
                Err(e) => return Err(e),
            };
            if self.peer_locked && from != self.peer {
                self.reject_stranger(from).await;
                continue;
            }
            let packet = match Packet::decode(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(%from, error = %e, "discarding undecodable datagram");
                    continue;
                }
            };
            if from != self.peer {
                debug!(%from, "peer transfer id learned");
                self.peer = from;
            }
            self.peer_locked = true;
            debug!(%from, packet = %packet, "received");
            return Ok(Inbound::Packet(packet));
        }
    }

    async fn reject_stranger(&self, from: SocketAddr) {
        let err = TftpError::UnknownTransferId(from);
        warn!(%from, "packet from unknown transfer id");
        if let Some(code) = err.reply_code() {
            let reply = Packet::ERROR {
                code,
                msg: err.to_string(),
            };
            if let Err(e) = self.endpoint.send_to(&reply.encode(), from).await {
                debug!(%from, error = %e, "could not answer unknown transfer id");
            }
        }
    }

    async fn transmit(&self, packet: &Packet) -> Result<Vec<u8>, TftpError> {
        let bytes = packet.encode();
        self.endpoint.send_to(&bytes, self.peer).await?;
        debug!(peer = %self.peer, packet = %packet, "sent");
        Ok(bytes)
    }

    async fn conclude(
        &mut self,
        outcome: Result<(), TftpError>,
    ) -> Result<TransferSummary, TftpError> {
        self.timer.cancel();
        match outcome {
            Ok(()) => {
                self.state = State::Complete;
                let summary = self.summary();
                info!(peer = %self.peer, "transfer complete: {summary}");
                if self.config.dally && self.last_ack.is_some() {
                    self.dally().await;
                }
                Ok(summary)
            }
            Err(err) => {
                if let Some(code) = err.reply_code() {
                    let reply = Packet::ERROR {
                        code,
                        msg: err.to_string(),
                    };
                    if let Err(e) = self.transmit(&reply).await {
                        debug!(error = %e, "could not report failure to peer");
                    }
                }
                self.state = State::Errored;
                warn!(peer = %self.peer, error = %err, "transfer failed");
                Err(err)
            }
        }
    }

    /// Lingers one timeout after the final ACK, re-acknowledging a repeated final block.
    async fn dally(&mut self) {
        let deadline = Instant::now() + self.config.timeout;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        while let Ok((len, from)) = transport::receive(&self.endpoint, &mut buf, deadline).await {
            if from != self.peer {
                continue;
            }
            if let Ok(Packet::DATA { block, .. }) = Packet::decode(&buf[..len]) {
                if block == self.block {
                    if let Err(e) = self.resend_last_ack().await {
                        debug!(error = %e, "could not resend final ack");
                        return;
                    }
                }
            }
        }
    }

    fn summary(&self) -> TransferSummary {
        TransferSummary {
            id: self.id,
            direction: self.direction,
            role: self.role,
            blocks: self.blocks,
            bytes: self.bytes,
            retransmits: self.retransmits,
            elapsed: self.started.elapsed(),
        }
    }
}
