use anyhow::{anyhow, Context};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::net::UdpSocket;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tftp_engine::client;
use tftp_engine::{Cli, Command, DeferredWriter, Dispatcher, FsStorage, Storage, UdpTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tftp_engine=info,tftp=info".into()),
        )
        .init();

    let args = Cli::parse();
    match args.command {
        Command::Serve {
            ip,
            port,
            directory,
            transfer,
        } => {
            let socket = UdpSocket::bind(SocketAddr::new(ip, port)).await?;
            let workdir = std::fs::canonicalize(&directory)
                .with_context(|| format!("work directory {}", directory.display()))?;
            let config = transfer.config();

            info!(
                "TFTP server listen on {}, workdir: {}, timeout: {} ms, retry: {}, dally: {}",
                socket.local_addr()?,
                workdir.display(),
                transfer.timeout,
                config.max_retries,
                config.dally
            );

            let dispatcher = Dispatcher::new(
                socket,
                UdpTransport::new(ip),
                FsStorage::new(workdir),
                config,
            );
            dispatcher.run().await?;
        }
        Command::Get {
            server,
            remote,
            local,
            mode,
            transfer,
        } => {
            let local = match local {
                Some(local) => local,
                None => PathBuf::from(file_name(Path::new(&remote))?),
            };
            let (storage, name) = local_storage(&local)?;
            let writer = DeferredWriter::new(storage, &name, mode);
            let summary = client::get(
                &UdpTransport::new(unspecified(server)),
                server,
                &remote,
                mode,
                writer,
                &transfer.config(),
            )
            .await?;
            info!("{remote} -> {}: {summary}", local.display());
        }
        Command::Put {
            server,
            local,
            remote,
            mode,
            transfer,
        } => {
            let remote = match remote {
                Some(remote) => remote,
                None => file_name(&local)?,
            };
            let (storage, name) = local_storage(&local)?;
            let reader = storage.open_read(&name, mode).await?;
            let summary = client::put(
                &UdpTransport::new(unspecified(server)),
                server,
                &remote,
                mode,
                reader,
                &transfer.config(),
            )
            .await?;
            info!("{} -> {remote}: {summary}", local.display());
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .ok_or(anyhow!("{:?}", path))?
        .to_str()
        .ok_or(anyhow!("Illegal characters"))
        .map(str::to_string)
}

// Local files are accessed through a storage rooted at their parent directory.
fn local_storage(path: &Path) -> anyhow::Result<(FsStorage, String)> {
    let name = file_name(path)?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((FsStorage::new(parent), name))
}

fn unspecified(server: SocketAddr) -> IpAddr {
    match server {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
