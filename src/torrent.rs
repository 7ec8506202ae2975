//! The per-torrent actor: owns a torrent's disk, piece manager, peer
//! directory and announce schedulers, and drives the downloader worker
//! pool and seeder listener that share them. [`Engine`](crate::engine::Engine)
//! is a thin registry of these.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::delay_for;

use crate::announce::{Announcer, AnnouncerConf, Role};
use crate::conf::TorrentConf;
use crate::counter::{ThroughputCounter, SAMPLE_PERIOD};
use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use crate::peer::{DownloadSession, SeedSession, UploadObserver};
use crate::piece_manager::{PieceManager, PieceObserver};
use crate::resume::{self, ResumeBitmap};
use crate::storage_info::StorageInfo;
use crate::{PeerId, PieceIndex, Sha1Hash};

/// How often a downloader worker with no usable peer to try retries the
/// peer directory.
const PEER_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);
/// A peer is skipped by [`PeerDirectory::next_candidate`] once its failure
/// count reaches this.
const MAX_PEER_FAILURES: u32 = 3;
/// Bounded number of successive ports tried if `base_listen_port` (or
/// `base_listen_port + n`) is already taken (spec §9 open question).
const PORT_PROBE_ATTEMPTS: u16 = 32;

/// The observability callback set (spec §6). All methods are no-ops by
/// default so an embedder only overrides what it renders.
pub trait TorrentCallbacks: Send + Sync {
    fn download_started(&self) {}
    fn piece_completed(&self, _index: PieceIndex) {}
    fn download_completed(&self) {}
    fn download_failed(&self, _reason: String) {}
    fn progress_update(&self, _downloaded: u64, _total: u64) {}
    fn seeding_started(&self) {}
    fn peer_connected(&self, _addr: SocketAddr) {}
    fn peer_disconnected(&self, _addr: SocketAddr) {}
    fn piece_uploaded(&self, _addr: SocketAddr, _len: u32) {}
    fn seeding_progress(&self, _uploaded: u64) {}
    fn seeding_stopped(&self) {}
    fn seeding_error(&self, _reason: String) {}
}

/// The torrent's known peers (spec §3 "Peer"): addresses discovered by
/// tracker announces, each with its own connect-failure counter. Equality
/// is by (host, port) only, per spec.
pub(crate) struct PeerDirectory {
    inner: Mutex<PeerDirectoryInner>,
}

struct PeerDirectoryInner {
    peers: Vec<PeerEntry>,
    cursor: usize,
}

struct PeerEntry {
    addr: SocketAddr,
    failures: u32,
}

impl PeerDirectory {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(PeerDirectoryInner {
                peers: Vec::new(),
                cursor: 0,
            }),
        }
    }

    /// Adds newly discovered peers, deduplicated by address against both
    /// each other and the existing directory.
    pub(crate) fn merge(&self, addrs: Vec<SocketAddr>) {
        let mut inner = self.inner.lock().expect("peer directory poisoned");
        let existing: HashSet<SocketAddr> =
            inner.peers.iter().map(|p| p.addr).collect();
        for addr in addrs {
            if !existing.contains(&addr)
                && !inner.peers.iter().any(|p| p.addr == addr)
            {
                inner.peers.push(PeerEntry { addr, failures: 0 });
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().expect("peer directory poisoned").peers.is_empty()
    }

    /// Picks a not-yet-exhausted peer, round robin. Fairness among peers is
    /// unspecified by the engine's contract; round robin merely avoids
    /// always retrying the same address first.
    pub(crate) fn next_candidate(&self) -> Option<SocketAddr> {
        let mut inner = self.inner.lock().expect("peer directory poisoned");
        let n = inner.peers.len();
        if n == 0 {
            return None;
        }
        for _ in 0..n {
            let i = inner.cursor % n;
            inner.cursor = inner.cursor.wrapping_add(1);
            if inner.peers[i].failures < MAX_PEER_FAILURES {
                return Some(inner.peers[i].addr);
            }
        }
        None
    }

    pub(crate) fn record_failure(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().expect("peer directory poisoned");
        if let Some(entry) = inner.peers.iter_mut().find(|p| p.addr == addr) {
            entry.failures += 1;
        }
    }
}

/// Forwards [`PieceManager`] completions to the torrent's callback set.
struct PieceCompletionObserver {
    callbacks: Arc<dyn TorrentCallbacks>,
}

impl PieceObserver for PieceCompletionObserver {
    fn on_piece_present(&self, index: PieceIndex) {
        self.callbacks.piece_completed(index);
    }
}

/// Forwards served block uploads to the torrent's callback set.
struct UploadCallbackBridge {
    callbacks: Arc<dyn TorrentCallbacks>,
}

impl UploadObserver for UploadCallbackBridge {
    fn on_block_uploaded(&self, addr: SocketAddr, len: u32) {
        self.callbacks.piece_uploaded(addr, len);
    }
}

/// A live torrent: every task spawned for it, plus the shared state an
/// owner (the engine) needs to query progress or drive shutdown.
pub(crate) struct TorrentHandle {
    piece_manager: Arc<PieceManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl TorrentHandle {
    pub(crate) fn is_complete(&self) -> bool {
        self.piece_manager.is_complete()
    }

    pub(crate) fn present_count(&self) -> usize {
        self.piece_manager.present_count()
    }

    pub(crate) fn piece_count(&self) -> usize {
        self.piece_manager.piece_count()
    }

    /// Cooperative shutdown (spec §5/§6): signal every task, wait for them
    /// all to return, then flush the resume bitmap one last time.
    pub(crate) async fn shutdown(self) -> Result<()> {
        self.piece_manager.shutdown();
        for task in self.tasks {
            let _ = task.await;
        }
        if !self.piece_manager.is_complete() {
            self.piece_manager.flush()?;
        }
        Ok(())
    }
}

/// Starts a torrent: verifies (or resumes) existing content, then spawns
/// the download announcer, the seeding announcer (once any piece is
/// present), the downloader worker pool, the seeder listener, and a
/// periodic progress reporter.
pub(crate) async fn start(
    metainfo: Metainfo,
    info_hash: Sha1Hash,
    conf: TorrentConf,
    client_id: PeerId,
    base_listen_port: u16,
    callbacks: Arc<dyn TorrentCallbacks>,
) -> Result<TorrentHandle> {
    let storage = StorageInfo::new(&metainfo, conf.download_dir.clone());
    let name = metainfo.info.name.clone();
    // Sibling of the torrent's content root (which for multi-file torrents
    // is itself `conf.download_dir/<name>`), not nested inside it.
    let resume_path = resume::resume_file_path(&conf.download_dir, &name);
    let piece_count = metainfo.piece_count();

    let files_already_correct_length = storage
        .files()
        .iter()
        .all(|file| match std::fs::metadata(&storage.download_dir.join(&file.path)) {
            Ok(meta) => meta.len() == file.len,
            Err(_) => false,
        });

    let disk = Disk::allocate(storage, metainfo.info.pieces.clone()).await?;

    let present = if files_already_correct_length {
        log::info!("All files for {:?} exist at full length, verifying", name);
        verify_all(Arc::clone(&disk), piece_count).await
    } else {
        match ResumeBitmap::load(&resume_path, piece_count)? {
            Some(bitmap) => verify_bits(Arc::clone(&disk), bitmap).await,
            None => Vec::new(),
        }
    };
    log::info!(
        "{:?} ({}): {} of {} pieces present at startup",
        name,
        hex::encode(info_hash),
        present.len(),
        piece_count
    );

    let piece_manager = Arc::new(PieceManager::new(piece_count, present, resume_path));
    piece_manager.set_observer(Arc::new(PieceCompletionObserver {
        callbacks: Arc::clone(&callbacks),
    }));

    let meter = Arc::new(Mutex::new(ThroughputCounter::new()));
    let peers = Arc::new(PeerDirectory::new());

    let tracker_urls = metainfo.announce_urls();
    let announcer_conf = AnnouncerConf {
        info_hash,
        client_id,
        listen_port: base_listen_port,
        tracker_urls,
        interval: conf.announce_interval,
        num_want: Some(conf.min_requested_peer_count as u32),
    };

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn({
        let announcer = Announcer::new(
            Role::Download,
            clone_announcer_conf(&announcer_conf),
            Arc::clone(&piece_manager),
            Arc::clone(&disk),
            Arc::clone(&meter),
            Arc::clone(&peers),
            Arc::clone(&callbacks),
        );
        announcer.run_until_complete()
    }));

    tasks.push(tokio::spawn(run_seed_announcer_when_seeding(
        announcer_conf,
        Arc::clone(&piece_manager),
        Arc::clone(&disk),
        Arc::clone(&meter),
        Arc::clone(&peers),
        Arc::clone(&callbacks),
    )));

    for _ in 0..conf.max_concurrent_downloads {
        tasks.push(tokio::spawn(downloader_worker(
            info_hash,
            client_id,
            Arc::clone(&piece_manager),
            Arc::clone(&disk),
            Arc::clone(&meter),
            Arc::clone(&peers),
            Arc::clone(&callbacks),
        )));
    }

    tasks.push(tokio::spawn(seeder_listener(
        base_listen_port,
        info_hash,
        client_id,
        Arc::clone(&piece_manager),
        Arc::clone(&disk),
        Arc::clone(&meter),
        conf.max_concurrent_uploads,
        Arc::clone(&callbacks),
    )));

    tasks.push(tokio::spawn(progress_reporter(
        Arc::clone(&piece_manager),
        Arc::clone(&meter),
        disk.storage_info().download_len,
        Arc::clone(&callbacks),
    )));

    callbacks.download_started();

    Ok(TorrentHandle {
        piece_manager,
        tasks,
    })
}

fn clone_announcer_conf(conf: &AnnouncerConf) -> AnnouncerConf {
    AnnouncerConf {
        info_hash: conf.info_hash,
        client_id: conf.client_id,
        listen_port: conf.listen_port,
        tracker_urls: conf.tracker_urls.clone(),
        interval: conf.interval,
        num_want: conf.num_want,
    }
}

async fn verify_all(disk: Arc<Disk>, piece_count: usize) -> Vec<PieceIndex> {
    let mut present = Vec::with_capacity(piece_count);
    for index in 0..piece_count {
        if Arc::clone(&disk).verify_piece(index).await {
            present.push(index);
        }
    }
    present
}

async fn verify_bits(disk: Arc<Disk>, bitmap: ResumeBitmap) -> Vec<PieceIndex> {
    let mut present = Vec::new();
    for index in bitmap.iter_set() {
        if Arc::clone(&disk).verify_piece(index).await {
            present.push(index);
        }
    }
    present
}

/// Waits until the torrent has at least one present piece (spec §4.5: the
/// seeding announcer is "active from first piece present"), then runs it
/// until shutdown. Exits immediately without announcing if shut down
/// first.
async fn run_seed_announcer_when_seeding(
    conf: AnnouncerConf,
    piece_manager: Arc<PieceManager>,
    disk: Arc<Disk>,
    meter: Arc<Mutex<ThroughputCounter>>,
    peers: Arc<PeerDirectory>,
    callbacks: Arc<dyn TorrentCallbacks>,
) {
    while piece_manager.present_count() == 0 {
        if piece_manager.is_shutdown() {
            return;
        }
        delay_for(PEER_POLL_INTERVAL).await;
    }
    let announcer = Announcer::new(
        Role::Seed,
        conf,
        piece_manager,
        disk,
        meter,
        peers,
        callbacks,
    );
    announcer.run_until_shutdown().await;
}

/// One downloader worker's whole lifetime: pick a peer, run a full
/// download session against it, repeat until the torrent completes, is
/// shut down, or a fatal per-torrent error (retry exhaustion) occurs.
async fn downloader_worker(
    info_hash: Sha1Hash,
    client_id: PeerId,
    piece_manager: Arc<PieceManager>,
    disk: Arc<Disk>,
    meter: Arc<Mutex<ThroughputCounter>>,
    peers: Arc<PeerDirectory>,
    callbacks: Arc<dyn TorrentCallbacks>,
) {
    loop {
        if piece_manager.is_complete() || piece_manager.is_shutdown() {
            return;
        }
        let addr = match peers.next_candidate() {
            Some(addr) => addr,
            None => {
                delay_for(PEER_POLL_INTERVAL).await;
                continue;
            }
        };

        callbacks.peer_connected(addr);
        let result = DownloadSession::run(
            addr,
            info_hash,
            client_id,
            Arc::clone(&piece_manager),
            Arc::clone(&disk),
            Arc::clone(&meter),
        )
        .await;
        callbacks.peer_disconnected(addr);

        match result {
            Ok(()) => {}
            Err(Error::ShutdownRequested) => return,
            Err(Error::RetryExhausted(index)) => {
                log::error!(
                    "piece {} exhausted its retry budget, failing torrent",
                    index
                );
                piece_manager.shutdown();
                callbacks.download_failed(format!(
                    "piece {} exhausted its retry budget",
                    index
                ));
                return;
            }
            Err(e) => {
                log::debug!("peer {} session ended: {}", addr, e);
                peers.record_failure(addr);
            }
        }
    }
}

/// Accepts inbound connections up to `cap`, spawning a seeding session per
/// accepted socket; connections beyond the cap are closed immediately.
async fn seeder_listener(
    base_port: u16,
    info_hash: Sha1Hash,
    client_id: PeerId,
    piece_manager: Arc<PieceManager>,
    disk: Arc<Disk>,
    meter: Arc<Mutex<ThroughputCounter>>,
    cap: usize,
    callbacks: Arc<dyn TorrentCallbacks>,
) {
    let mut listener = match bind_with_probe(base_port).await {
        Ok((listener, port)) => {
            log::info!("Seeding listener bound to port {}", port);
            listener
        }
        Err(e) => {
            log::error!("could not bind seeding listener: {}", e);
            callbacks.seeding_error(format!("could not bind listener: {}", e));
            return;
        }
    };

    let active = Arc::new(AtomicUsize::new(0));
    loop {
        if piece_manager.is_shutdown() {
            return;
        }
        let accepted =
            tokio::time::timeout(PEER_POLL_INTERVAL, listener.accept()).await;
        let (stream, addr) = match accepted {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                log::warn!("seeder listener accept error: {}", e);
                continue;
            }
            Err(_) => continue,
        };

        if active.load(Ordering::SeqCst) >= cap {
            log::debug!("over capacity, dropping inbound peer {}", addr);
            drop(stream);
            continue;
        }

        active.fetch_add(1, Ordering::SeqCst);
        callbacks.peer_connected(addr);
        tokio::spawn(run_seed_session(
            stream,
            addr,
            info_hash,
            client_id,
            Arc::clone(&piece_manager),
            Arc::clone(&disk),
            Arc::clone(&meter),
            Arc::clone(&active),
            Arc::clone(&callbacks),
        ));
    }
}

async fn run_seed_session(
    stream: TcpStream,
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    piece_manager: Arc<PieceManager>,
    disk: Arc<Disk>,
    meter: Arc<Mutex<ThroughputCounter>>,
    active: Arc<AtomicUsize>,
    callbacks: Arc<dyn TorrentCallbacks>,
) {
    let observer: Arc<dyn UploadObserver> =
        Arc::new(UploadCallbackBridge { callbacks: Arc::clone(&callbacks) });
    if let Err(e) = SeedSession::run(
        stream,
        info_hash,
        client_id,
        piece_manager,
        disk,
        meter,
        observer,
    )
    .await
    {
        log::debug!("seeding session with {} ended: {}", addr, e);
    }
    active.fetch_sub(1, Ordering::SeqCst);
    callbacks.peer_disconnected(addr);
}

/// Binds a `TcpListener`, probing successive ports if `base_port` is
/// already taken (spec §9 open question: a robust implementation should
/// fall back rather than assume availability).
async fn bind_with_probe(base_port: u16) -> std::io::Result<(TcpListener, u16)> {
    let mut last_err = None;
    for offset in 0..PORT_PROBE_ATTEMPTS {
        let port = base_port.wrapping_add(offset);
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.expect("at least one bind attempt was made"))
}

/// Periodically forces the meter's rate estimator to resample (spec §4.9)
/// and reports progress through the callback set, independent of whether
/// any bytes arrived this period.
async fn progress_reporter(
    piece_manager: Arc<PieceManager>,
    meter: Arc<Mutex<ThroughputCounter>>,
    total_len: u64,
    callbacks: Arc<dyn TorrentCallbacks>,
) {
    loop {
        delay_for(SAMPLE_PERIOD).await;
        if piece_manager.is_shutdown() {
            return;
        }

        let (downloaded, uploaded) = {
            let mut meter = meter.lock().expect("meter mutex poisoned");
            meter.downloaded.update(0);
            meter.uploaded.update(0);
            (meter.downloaded.total(), meter.uploaded.total())
        };
        callbacks.progress_update(downloaded, total_len);
        if piece_manager.present_count() > 0 {
            callbacks.seeding_progress(uploaded);
        }
    }
}
