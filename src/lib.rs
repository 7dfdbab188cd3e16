pub mod client;
mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod netascii;
pub mod packet;
pub mod session;
pub mod storage;
pub mod timer;
pub mod transport;

pub use crate::cli::{Cli, Command, TransferArgs};
pub use crate::config::Config;
pub use crate::dispatcher::Dispatcher;
pub use crate::error::TftpError;
pub use crate::packet::{ErrorCode, Mode, Packet};
pub use crate::session::{Direction, Role, State, TransferSession, TransferSummary};
pub use crate::storage::{
    DeferredWriter, FsStorage, MemoryStorage, ReadHandle, Storage, WriteHandle,
};
pub use crate::timer::{Expiry, RetransmissionTimer};
pub use crate::transport::{Endpoint, Transport, UdpTransport};

pub const BLOCK_SIZE: usize = 512; // RFC 1350
pub const MAX_PACKET_SIZE: usize = 4 + BLOCK_SIZE;
pub const DEF_PORT: u16 = 69;

pub const DEF_TIMEOUT_SEC: u64 = 1;
pub const MAX_RETRY_COUNT: u8 = 3;
