//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use rand::Rng;

use crate::PeerId;

/// The 8-byte Azureus-style client identifier prefixed to every generated
/// peer id, per BEP 20.
pub const PEER_ID_PREFIX: &[u8; 8] = b"-BT0001-";

/// Generates a fresh 20-byte peer id: [`PEER_ID_PREFIX`] followed by 12
/// random alphanumeric bytes.
pub fn generate_peer_id() -> PeerId {
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut id = [0; 20];
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in &mut id[8..] {
        *byte = ALPHABET[rng.gen_range(0..ALPHABET.len())];
    }
    id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. Generates a fresh random peer id for the engine's client id.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: generate_peer_id(),
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,

    /// The listening port for the first torrent added to the engine. The
    /// nth torrent started listens on `base_listen_port + n - 1`.
    pub base_listen_port: u16,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            client_id: generate_peer_id(),
            base_listen_port: 6881,
        }
    }
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The number of downloader workers (W) kept active per torrent.
    pub max_concurrent_downloads: usize,

    /// The cap (U) on concurrently served inbound seeding connections.
    pub max_concurrent_uploads: usize,

    /// How often the announce schedulers re-announce to trackers absent a
    /// tracker-provided minimum interval.
    pub announce_interval: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            max_concurrent_downloads: 48,
            max_concurrent_uploads: 10,
            announce_interval: Duration::from_secs(60),
        }
    }
}
