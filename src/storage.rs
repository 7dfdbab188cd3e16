//! Byte-stream storage that sessions read files from and write files to.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::TftpError;
use crate::netascii::{self, Decoder};
use crate::packet::Mode;

pub trait Storage: Send + Sync + 'static {
    type Reader: ReadHandle;
    type Writer: WriteHandle;

    fn open_read(
        &self,
        name: &str,
        mode: Mode,
    ) -> impl Future<Output = Result<Self::Reader, TftpError>> + Send;

    fn open_write(
        &self,
        name: &str,
        mode: Mode,
    ) -> impl Future<Output = Result<Self::Writer, TftpError>> + Send;
}

pub trait ReadHandle: Send {
    /// Returns up to `max` bytes; fewer only at the end of the resource.
    fn read_chunk(&mut self, max: usize) -> impl Future<Output = Result<Vec<u8>, TftpError>> + Send;
}

pub trait WriteHandle: Send {
    fn write_chunk(&mut self, data: &[u8]) -> impl Future<Output = Result<(), TftpError>> + Send;

    /// Flushes buffered bytes. Data already written stays if this is never called.
    fn close(&mut self) -> impl Future<Output = Result<(), TftpError>> + Send;
}

/// Files under a root directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `name` below the root, refusing anything that could escape it.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, TftpError> {
        let mut path = self.root.clone();
        let mut depth = 0;
        for component in Path::new(name).components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    depth += 1;
                }
                Component::CurDir => (),
                _ => return Err(TftpError::AccessDenied(name.to_string())),
            }
        }
        if depth == 0 {
            return Err(TftpError::AccessDenied(name.to_string()));
        }
        Ok(path)
    }
}

impl Storage for FsStorage {
    type Reader = FileReader;
    type Writer = FileWriter;

    async fn open_read(&self, name: &str, mode: Mode) -> Result<FileReader, TftpError> {
        let path = self.resolve(name)?;
        let file = File::open(&path)
            .await
            .map_err(|e| TftpError::from_storage(e, name))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| TftpError::from_storage(e, name))?;
        if !metadata.is_file() {
            return Err(TftpError::AccessDenied(name.to_string()));
        }
        Ok(FileReader {
            name: name.to_string(),
            file,
            mode,
            pending: VecDeque::new(),
            eof: false,
        })
    }

    async fn open_write(&self, name: &str, mode: Mode) -> Result<FileWriter, TftpError> {
        let path = self.resolve(name)?;
        let file = File::create(&path)
            .await
            .map_err(|e| TftpError::from_storage(e, name))?;
        Ok(FileWriter {
            name: name.to_string(),
            file,
            decoder: (mode == Mode::NetAscii).then(Decoder::new),
        })
    }
}

pub struct FileReader {
    name: String,
    file: File,
    mode: Mode,
    pending: VecDeque<u8>,
    eof: bool,
}

impl ReadHandle for FileReader {
    async fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>, TftpError> {
        let mut out = Vec::with_capacity(max);
        let mut raw = vec![0u8; max];
        while out.len() < max {
            if !self.pending.is_empty() {
                let take = self.pending.len().min(max - out.len());
                out.extend(self.pending.drain(..take));
                continue;
            }
            if self.eof {
                break;
            }
            let n = self
                .file
                .read(&mut raw)
                .await
                .map_err(|e| TftpError::from_storage(e, &self.name))?;
            match (n, self.mode) {
                (0, _) => self.eof = true,
                (_, Mode::Octet) => self.pending.extend(&raw[..n]),
                (_, Mode::NetAscii) => netascii::encode_into(&raw[..n], &mut self.pending),
            }
        }
        Ok(out)
    }
}

pub struct FileWriter {
    name: String,
    file: File,
    decoder: Option<Decoder>,
}

impl WriteHandle for FileWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TftpError> {
        let result = match self.decoder.as_mut() {
            Some(decoder) => self.file.write_all(&decoder.decode(data)).await,
            None => self.file.write_all(data).await,
        };
        result.map_err(|e| TftpError::from_storage(e, &self.name))
    }

    async fn close(&mut self) -> Result<(), TftpError> {
        if let Some(decoder) = self.decoder.as_mut() {
            let tail = decoder.finish();
            self.file
                .write_all(&tail)
                .await
                .map_err(|e| TftpError::from_storage(e, &self.name))?;
        }
        self.file
            .flush()
            .await
            .map_err(|e| TftpError::from_storage(e, &self.name))
    }
}

/// Opens its target only when the first bytes (or the close) arrive, so a
/// transfer refused up front leaves nothing behind.
pub struct DeferredWriter<S: Storage> {
    storage: S,
    name: String,
    mode: Mode,
    writer: Option<S::Writer>,
}

impl<S: Storage> DeferredWriter<S> {
    pub fn new(storage: S, name: &str, mode: Mode) -> Self {
        Self {
            storage,
            name: name.to_string(),
            mode,
            writer: None,
        }
    }

    async fn writer(&mut self) -> Result<&mut S::Writer, TftpError> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => self.storage.open_write(&self.name, self.mode).await?,
        };
        Ok(self.writer.insert(writer))
    }
}

impl<S: Storage> WriteHandle for DeferredWriter<S> {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TftpError> {
        self.writer().await?.write_chunk(data).await
    }

    async fn close(&mut self) -> Result<(), TftpError> {
        self.writer().await?.close().await
    }
}

type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// In-memory storage, optionally capped to emulate a full disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: Files,
    capacity: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the total bytes held across all files.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            files: Files::default(),
            capacity: Some(capacity),
        }
    }

    pub fn insert(&self, name: &str, data: Vec<u8>) {
        lock(&self.files).insert(name.to_string(), data);
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.files).get(name).cloned()
    }
}

fn lock(files: &Files) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
    files.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Storage for MemoryStorage {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    async fn open_read(&self, name: &str, mode: Mode) -> Result<MemoryReader, TftpError> {
        let raw = self
            .get(name)
            .ok_or_else(|| TftpError::NotFound(name.to_string()))?;
        let data = match mode {
            Mode::Octet => raw,
            Mode::NetAscii => {
                let mut encoded = Vec::with_capacity(raw.len());
                netascii::encode_into(&raw, &mut encoded);
                encoded
            }
        };
        Ok(MemoryReader { data, pos: 0 })
    }

    async fn open_write(&self, name: &str, mode: Mode) -> Result<MemoryWriter, TftpError> {
        let mut files = lock(&self.files);
        files.insert(name.to_string(), Vec::new());
        if let Some(capacity) = self.capacity {
            if files.values().map(Vec::len).sum::<usize>() >= capacity {
                files.remove(name);
                return Err(TftpError::DiskFull(name.to_string()));
            }
        }
        Ok(MemoryWriter {
            files: self.files.clone(),
            name: name.to_string(),
            capacity: self.capacity,
            decoder: (mode == Mode::NetAscii).then(Decoder::new),
        })
    }
}

pub struct MemoryReader {
    data: Vec<u8>,
    pos: usize,
}

impl ReadHandle for MemoryReader {
    async fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>, TftpError> {
        let end = self.data.len().min(self.pos + max);
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(chunk)
    }
}

pub struct MemoryWriter {
    files: Files,
    name: String,
    capacity: Option<usize>,
    decoder: Option<Decoder>,
}

impl MemoryWriter {
    fn append(&self, bytes: &[u8]) -> Result<(), TftpError> {
        let mut files = lock(&self.files);
        if let Some(capacity) = self.capacity {
            let used: usize = files.values().map(Vec::len).sum();
            if used + bytes.len() > capacity {
                return Err(TftpError::DiskFull(self.name.clone()));
            }
        }
        files
            .entry(self.name.clone())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }
}

impl WriteHandle for MemoryWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TftpError> {
        match self.decoder.as_mut() {
            Some(decoder) => {
                let host = decoder.decode(data);
                self.append(&host)
            }
            None => self.append(data),
        }
    }

    async fn close(&mut self) -> Result<(), TftpError> {
        match self.decoder.as_mut() {
            Some(decoder) => {
                let tail = decoder.finish();
                self.append(&tail)
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_stays_under_root() {
        let storage = FsStorage::new("/srv/tftp");
        assert_eq!(
            storage.resolve("boot/kernel").unwrap(),
            PathBuf::from("/srv/tftp/boot/kernel")
        );
        assert_eq!(
            storage.resolve("./a.bin").unwrap(),
            PathBuf::from("/srv/tftp/a.bin")
        );
        for name in ["../etc/passwd", "/etc/passwd", "a/../../b", ".", ""] {
            assert!(
                matches!(storage.resolve(name), Err(TftpError::AccessDenied(_))),
                "{name} should be refused"
            );
        }
    }

    #[tokio::test]
    async fn fs_reads_in_chunks_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("five.bin"), b"12345").unwrap();
        let storage = FsStorage::new(dir.path());

        let mut reader = storage.open_read("five.bin", Mode::Octet).await.unwrap();
        assert_eq!(reader.read_chunk(2).await.unwrap(), b"12");
        assert_eq!(reader.read_chunk(2).await.unwrap(), b"34");
        assert_eq!(reader.read_chunk(2).await.unwrap(), b"5");
        assert!(reader.read_chunk(2).await.unwrap().is_empty());

        assert!(matches!(
            storage.open_read("missing.bin", Mode::Octet).await,
            Err(TftpError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn fs_netascii_round_trips_line_endings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("in.txt"), b"one\ntwo\r\n").unwrap();
        let storage = FsStorage::new(dir.path());

        let mut reader = storage.open_read("in.txt", Mode::NetAscii).await.unwrap();
        let wire = reader.read_chunk(512).await.unwrap();
        assert_eq!(wire, b"one\r\ntwo\r\0\r\n");

        let mut writer = storage.open_write("out.txt", Mode::NetAscii).await.unwrap();
        writer.write_chunk(&wire[..4]).await.unwrap();
        writer.write_chunk(&wire[4..]).await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("out.txt")).unwrap(),
            b"one\ntwo\r\n"
        );
    }

    #[tokio::test]
    async fn memory_capacity_reports_disk_full() {
        let storage = MemoryStorage::with_capacity(4);
        let mut writer = storage.open_write("f", Mode::Octet).await.unwrap();
        writer.write_chunk(b"abc").await.unwrap();
        assert!(matches!(
            writer.write_chunk(b"de").await,
            Err(TftpError::DiskFull(_))
        ));
        assert_eq!(storage.get("f").unwrap(), b"abc");
    }

    #[tokio::test]
    async fn deferred_writer_opens_on_first_use() {
        let storage = MemoryStorage::new();
        let mut writer = DeferredWriter::new(storage.clone(), "late.bin", Mode::Octet);
        assert!(storage.get("late.bin").is_none());
        writer.write_chunk(b"abc").await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(storage.get("late.bin").unwrap(), b"abc");

        let mut empty = DeferredWriter::new(storage.clone(), "empty.bin", Mode::Octet);
        empty.close().await.unwrap();
        assert_eq!(storage.get("empty.bin").unwrap(), b"");
    }
}
