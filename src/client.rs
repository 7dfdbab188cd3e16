//! Client-role transfers against a server's well-known endpoint.

use std::net::SocketAddr;

use tracing::{info_span, Instrument};

use crate::config::Config;
use crate::error::TftpError;
use crate::packet::Mode;
use crate::session::{Direction, TransferSession, TransferSummary};
use crate::storage::{ReadHandle, WriteHandle};
use crate::transport::Transport;

/// Downloads `filename` from `server` into `writer`.
pub async fn get<T: Transport, W: WriteHandle>(
    transport: &T,
    server: SocketAddr,
    filename: &str,
    mode: Mode,
    writer: W,
    config: &Config,
) -> Result<TransferSummary, TftpError> {
    let endpoint = transport.open().await?;
    let mut session =
        TransferSession::client(endpoint, server, Direction::Read, mode, config.clone());
    let span = info_span!("get", id = session.id(), %server, %filename);
    session.fetch(filename, writer).instrument(span).await
}

/// Uploads the contents of `reader` to `server` as `filename`.
pub async fn put<T: Transport, R: ReadHandle>(
    transport: &T,
    server: SocketAddr,
    filename: &str,
    mode: Mode,
    reader: R,
    config: &Config,
) -> Result<TransferSummary, TftpError> {
    let endpoint = transport.open().await?;
    let mut session =
        TransferSession::client(endpoint, server, Direction::Write, mode, config.clone());
    let span = info_span!("put", id = session.id(), %server, %filename);
    session.push(filename, reader).instrument(span).await
}
