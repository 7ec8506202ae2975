//! The engine: the embedder-facing API. Owns the set of active torrents and
//! the configuration they inherit, and is the only public entry point for
//! adding torrents and shutting the whole thing down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::conf::Conf;
use crate::error::Result;
use crate::metainfo::Metainfo;
use crate::torrent::{self, TorrentHandle};
use crate::TorrentId;

pub use crate::torrent::TorrentCallbacks;

/// Owns every torrent added to it and the configuration new torrents
/// inherit. Cloneable only via `Arc`: construct one `Engine`, share it with
/// however many callers need to add or query torrents.
pub struct Engine {
    conf: Conf,
    torrents: Mutex<HashMap<TorrentId, TorrentHandle>>,
    next_id: AtomicU32,
}

impl Engine {
    pub fn new(conf: Conf) -> Self {
        Self {
            conf,
            torrents: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Parses `metainfo_bytes`, starts the torrent it describes and returns
    /// the id it was assigned. The nth torrent ever added to this engine
    /// listens on `base_listen_port + n - 1` (or a nearby free port, see
    /// [`torrent::start`]'s fallback).
    pub async fn add_torrent(
        &self,
        metainfo_bytes: &[u8],
        callbacks: Arc<dyn TorrentCallbacks>,
    ) -> Result<TorrentId> {
        let metainfo = Metainfo::from_bytes(metainfo_bytes)?;
        let info_hash = Metainfo::create_info_hash(metainfo_bytes)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let listen_port = self
            .conf
            .engine
            .base_listen_port
            .wrapping_add((id - 1) as u16);

        let torrent_conf = self.conf.torrent.clone();

        let handle = torrent::start(
            metainfo,
            info_hash,
            torrent_conf,
            self.conf.engine.client_id,
            listen_port,
            callbacks,
        )
        .await?;

        self.torrents.lock().await.insert(id, handle);
        Ok(id)
    }

    /// Returns `(present, total)` piece counts for a torrent, if it exists.
    pub async fn torrent_progress(&self, id: TorrentId) -> Option<(usize, usize)> {
        let torrents = self.torrents.lock().await;
        torrents
            .get(&id)
            .map(|handle| (handle.present_count(), handle.piece_count()))
    }

    /// Shuts a single torrent down: stops its workers, closes its listener,
    /// informs its trackers and flushes its resume bitmap, then drops it
    /// from the engine.
    pub async fn remove_torrent(&self, id: TorrentId) -> Result<()> {
        let handle = self.torrents.lock().await.remove(&id);
        if let Some(handle) = handle {
            handle.shutdown().await?;
        }
        Ok(())
    }

    /// Shuts every torrent down in turn (spec §6 exit behavior) and drops
    /// them all from the engine.
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<TorrentHandle> =
            self.torrents.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.shutdown().await?;
        }
        Ok(())
    }
}
