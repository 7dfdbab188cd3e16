use anstyle::AnsiColor;
use clap::builder::styling::Styles;
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::packet::Mode;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default())
    .usage(AnsiColor::Green.on_default())
    .literal(AnsiColor::Cyan.on_default())
    .placeholder(AnsiColor::Red.on_default());

#[derive(Parser, Debug)]
#[command(name = "tftp")]
#[command(about = "A simple TFTP client/server", long_about = None)]
#[command(styles = STYLES)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve files from a directory
    Serve {
        /// Listen ip
        #[arg(short, long, default_value = "0.0.0.0")]
        ip: IpAddr,

        /// Listen Port
        #[arg(short, long, default_value_t = crate::DEF_PORT)]
        port: u16,

        /// Work directory
        #[arg(short, long, default_value = ".")]
        directory: PathBuf,

        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Download a file
    Get {
        /// Server address, e.g. 192.168.1.10:69
        server: SocketAddr,

        /// Remote file name
        remote: String,

        /// Local file (defaults to the remote file name)
        local: Option<PathBuf>,

        /// Transfer mode
        #[arg(short, long, default_value = "octet")]
        mode: Mode,

        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Upload a file
    Put {
        /// Server address, e.g. 192.168.1.10:69
        server: SocketAddr,

        /// Local file
        local: PathBuf,

        /// Remote file name (defaults to the local file name)
        remote: Option<String>,

        /// Transfer mode
        #[arg(short, long, default_value = "octet")]
        mode: Mode,

        #[command(flatten)]
        transfer: TransferArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct TransferArgs {
    /// Timeout (ms)
    #[arg(short, long, default_value_t = crate::DEF_TIMEOUT_SEC * 1000)]
    pub timeout: u64,

    /// Max retries
    #[arg(short, long, default_value_t = crate::MAX_RETRY_COUNT)]
    pub retry: u8,

    /// Linger after the final ACK to answer a retransmitted last block
    #[arg(long)]
    pub dally: bool,
}

impl TransferArgs {
    pub fn config(&self) -> Config {
        Config {
            timeout: Duration::from_millis(self.timeout),
            max_retries: self.retry,
            dally: self.dally,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let cli = Cli::parse_from(["tftp", "serve"]);
        let Command::Serve {
            port, transfer, ..
        } = cli.command
        else {
            panic!("expected serve");
        };
        assert_eq!(port, 69);
        assert_eq!(transfer.config(), Config::default());
    }

    #[test]
    fn get_requires_server() {
        assert!(Cli::try_parse_from(["tftp", "get", "boot.img"]).is_err());
        let cli = Cli::parse_from([
            "tftp", "get", "10.0.0.1:69", "boot.img", "-m", "NETASCII", "-t", "250",
        ]);
        let Command::Get {
            server,
            mode,
            transfer,
            local,
            ..
        } = cli.command
        else {
            panic!("expected get");
        };
        assert_eq!(server, "10.0.0.1:69".parse::<SocketAddr>().unwrap());
        assert_eq!(mode, Mode::NetAscii);
        assert_eq!(local, None);
        assert_eq!(transfer.config().timeout, Duration::from_millis(250));
    }
}
