// src/dex2oat.rs

//! Broker handing out descriptors of the stock dex2oat binaries.
//!
//! The wrapped compiler runs in a domain that may not open the stock
//! binary itself, so it asks this daemon for an already opened descriptor.
//! One worker per word width listens on `<dev_path>/dex2oat<32|64>.sock` and
//! answers every connection with the pooled descriptor plus a single `0x01`
//! byte.

use crate::constants::{
    DEX2OAT_FILE_CONTEXT, DEX2OAT_SOCKET_CONTEXT, STOCK_DEX2OAT_DIR,
};
use crate::utils::{
    lock, peer_identity, recv_fd_with_byte, send_fd_with_byte, set_socket_create_context,
    unix_listener_from_path,
};
use anyhow::{Context, Result, bail};
use log::{debug, error, info, warn};
use std::fs::{self, File};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

/// Word width of a compiler binary.
#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
#[repr(u8)]
pub enum Bitness {
    Lp32 = 32,
    Lp64 = 64,
}

impl TryFrom<u8> for Bitness {
    type Error = anyhow::Error;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            32 => Ok(Bitness::Lp32),
            64 => Ok(Bitness::Lp64),
            _ => bail!("Invalid word width: {}", value),
        }
    }
}

impl Bitness {
    /// Widths served on this platform.
    pub fn supported() -> &'static [Bitness] {
        crate::lp_select!(&[Bitness::Lp32], &[Bitness::Lp32, Bitness::Lp64])
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Bitness::Lp32 => "32",
            Bitness::Lp64 => "64",
        }
    }
}

/// Descriptors of the stock binaries, each opened at most once.
#[derive(Default)]
pub struct CompilerFdPool {
    lp32_fd: OnceLock<OwnedFd>,
    lp64_fd: OnceLock<OwnedFd>,
}

impl CompilerFdPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn storage(&self, bitness: Bitness) -> &OnceLock<OwnedFd> {
        match bitness {
            Bitness::Lp32 => &self.lp32_fd,
            Bitness::Lp64 => &self.lp64_fd,
        }
    }

    pub fn get(&self, bitness: Bitness) -> Option<BorrowedFd<'_>> {
        self.storage(bitness).get().map(AsFd::as_fd)
    }

    /// Returns the pooled descriptor, opening `path` read-only on first use.
    pub fn get_or_open(&self, bitness: Bitness, path: &Path) -> Result<BorrowedFd<'_>> {
        let storage = self.storage(bitness);
        if let Some(fd) = storage.get() {
            return Ok(fd.as_fd());
        }
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        debug!("Opened stock compiler {}", path.display());
        // A racing opener may have won; its descriptor is kept.
        let _ = storage.set(OwnedFd::from(file));
        storage
            .get()
            .map(AsFd::as_fd)
            .context("compiler descriptor vanished from the pool")
    }
}

/// Where the broker listens and what it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub dev_path: PathBuf,
    pub stock_binary_dir: PathBuf,
    /// Label for sockets created by the workers.
    pub socket_context: Option<String>,
    /// Label applied to the bound socket files.
    pub file_context: Option<String>,
}

impl BrokerConfig {
    pub fn new(dev_path: impl Into<PathBuf>) -> Self {
        Self {
            dev_path: dev_path.into(),
            stock_binary_dir: PathBuf::from(STOCK_DEX2OAT_DIR),
            socket_context: Some(DEX2OAT_SOCKET_CONTEXT.to_string()),
            file_context: Some(DEX2OAT_FILE_CONTEXT.to_string()),
        }
    }

    /// Reads the device path from the first line of `path`.
    pub fn from_dev_path_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let dev_path = content.lines().next().map(str::trim).unwrap_or_default();
        if dev_path.is_empty() {
            bail!("{} does not name a device path", path.display());
        }
        debug!("dev path: {}", dev_path);
        Ok(Self::new(dev_path))
    }

    pub fn socket_path(&self, bitness: Bitness) -> PathBuf {
        self.dev_path.join(format!("dex2oat{}.sock", bitness.suffix()))
    }

    pub fn stock_binary(&self, bitness: Bitness) -> PathBuf {
        self.stock_binary_dir
            .join(format!("dex2oat{}", bitness.suffix()))
    }
}

pub struct Dex2OatService {
    config: Arc<BrokerConfig>,
    pool: Arc<CompilerFdPool>,
    workers: Mutex<Vec<(Bitness, JoinHandle<()>)>>,
}

impl Dex2OatService {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config: Arc::new(config),
            pool: Arc::new(CompilerFdPool::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn pool(&self) -> &CompilerFdPool {
        &self.pool
    }

    /// Spawns one worker per supported word width.
    pub fn start(&self) -> Result<()> {
        let mut workers = lock(&self.workers);
        for &bitness in Bitness::supported() {
            workers.push((bitness, self.spawn(bitness)?));
        }
        Ok(())
    }

    fn spawn(&self, bitness: Bitness) -> Result<JoinHandle<()>> {
        let config = Arc::clone(&self.config);
        let pool = Arc::clone(&self.pool);
        thread::Builder::new()
            .name(format!("dex2oat{}", bitness.suffix()))
            .spawn(move || {
                if let Err(e) = worker(bitness, &config, &pool) {
                    error!("dex2oat{} daemon crashed: {:?}", bitness.suffix(), e);
                }
            })
            .with_context(|| format!("Failed to spawn dex2oat{} worker", bitness.suffix()))
    }

    /// True iff every spawned worker is still running.
    pub fn is_alive(&self) -> bool {
        lock(&self.workers)
            .iter()
            .all(|(_, handle)| !handle.is_finished())
    }

    /// Respawns finished workers; returns how many were restarted.
    pub fn restart_dead(&self) -> Result<usize> {
        let mut workers = lock(&self.workers);
        let mut restarted = 0;
        for (bitness, handle) in workers.iter_mut() {
            if !handle.is_finished() {
                continue;
            }
            warn!("dex2oat{} worker is dead, restarting", bitness.suffix());
            let dead = std::mem::replace(handle, self.spawn(*bitness)?);
            let _ = dead.join();
            restarted += 1;
        }
        Ok(restarted)
    }
}

fn worker(bitness: Bitness, config: &BrokerConfig, pool: &CompilerFdPool) -> Result<()> {
    info!("dex2oat{} daemon start", bitness.suffix());
    if let Some(context) = &config.socket_context {
        match set_socket_create_context(context) {
            Ok(()) => debug!("Set socket context to {}", context),
            Err(e) => error!("Failed to set socket context: {}", e),
        }
    }

    let socket_path = config.socket_path(bitness);
    let socket_path = socket_path
        .to_str()
        .context("Socket path is not valid UTF-8")?;
    let listener = unix_listener_from_path(socket_path, config.file_context.as_deref())
        .with_context(|| format!("Failed to bind {}", socket_path))?;
    let stock = pool.get_or_open(bitness, &config.stock_binary(bitness))?;
    info!("dex2oat{} daemon listening on {}", bitness.suffix(), socket_path);

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };
        if let Err(e) = serve(&stream, stock) {
            warn!("Error serving dex2oat{} client: {:?}", bitness.suffix(), e);
        }
    }
    Ok(())
}

/// Sends the descriptor to one client; the connection closes when `stream` drops.
fn serve(stream: &UnixStream, stock: BorrowedFd<'_>) -> Result<()> {
    match peer_identity(stream) {
        Ok(peer) => debug!("Compiler client {}", peer),
        Err(e) => debug!("Compiler client with unknown credentials: {}", e),
    }
    send_fd_with_byte(stream, stock, 1)?;
    debug!("Sent fd");
    Ok(())
}

/// Client side of the handshake: connects to the worker for `bitness` and
/// returns the descriptor it hands out.
pub fn request_compiler_fd(config: &BrokerConfig, bitness: Bitness) -> Result<OwnedFd> {
    let path = config.socket_path(bitness);
    let stream = UnixStream::connect(&path)
        .with_context(|| format!("Failed to connect to {}", path.display()))?;
    let (byte, fd) = recv_fd_with_byte(&stream)?;
    if byte != 1 {
        bail!("Unexpected handshake byte {:#x}", byte);
    }
    Ok(fd)
}
