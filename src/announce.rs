//! Announce schedulers: two long-running tasks per torrent (a download
//! announcer and a seeding announcer, see spec §4.5) that keep a torrent's
//! tracker(s) informed and its peer directory topped up.
//!
//! Both announcers share the same shape and differ only in when they stop:
//! the download announcer exits once the torrent is complete (firing a
//! final `completed` event), the seeding announcer runs until shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::delay_for;

use crate::counter::ThroughputCounter;
use crate::disk::Disk;
use crate::piece_manager::PieceManager;
use crate::torrent::{PeerDirectory, TorrentCallbacks};
use crate::tracker::{self, AnnounceRequest, Event};
use crate::{PeerId, Sha1Hash};

/// Distinguishes the two schedulers purely for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Download,
    Seed,
}

/// Collaborators an announcer needs, grouped so `Torrent` can build both
/// schedulers from one set of shared handles.
pub(crate) struct AnnouncerConf {
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub listen_port: u16,
    pub tracker_urls: Vec<String>,
    pub interval: Duration,
    pub num_want: Option<u32>,
}

pub(crate) struct Announcer {
    role: Role,
    conf: AnnouncerConf,
    piece_manager: Arc<PieceManager>,
    disk: Arc<Disk>,
    meter: Arc<Mutex<ThroughputCounter>>,
    peers: Arc<PeerDirectory>,
    callbacks: Arc<dyn TorrentCallbacks>,
    /// Consecutive rounds (across all configured trackers) in which every
    /// tracker failed; reset on any success.
    consecutive_failures: AtomicU32,
}

/// Beyond this many fully-failed announce rounds with an empty peer
/// directory, the torrent is considered to have lost its tracker.
const TRACKER_FAILURE_THRESHOLD: u32 = 3;

impl Announcer {
    pub(crate) fn new(
        role: Role,
        conf: AnnouncerConf,
        piece_manager: Arc<PieceManager>,
        disk: Arc<Disk>,
        meter: Arc<Mutex<ThroughputCounter>>,
        peers: Arc<PeerDirectory>,
        callbacks: Arc<dyn TorrentCallbacks>,
    ) -> Self {
        Self {
            role,
            conf,
            piece_manager,
            disk,
            meter,
            peers,
            callbacks,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Runs the download announcer: `started`, then periodic `none`
    /// announcements, until the torrent completes (fires `completed`) or
    /// the torrent is shut down first (fires `stopped`).
    pub(crate) async fn run_until_complete(mut self) {
        self.announce_round(Event::Started).await;
        let mut wait = self.conf.interval;

        loop {
            if self.piece_manager.is_complete() {
                self.announce_round(Event::Completed).await;
                self.callbacks.download_completed();
                return;
            }
            if self.piece_manager.is_shutdown() {
                self.announce_round(Event::Stopped).await;
                return;
            }

            delay_for(wait).await;

            if self.piece_manager.is_shutdown() {
                self.announce_round(Event::Stopped).await;
                return;
            }
            if self.piece_manager.is_complete() {
                self.announce_round(Event::Completed).await;
                self.callbacks.download_completed();
                return;
            }

            wait = self.announce_round(Event::None).await;
        }
    }

    /// Runs the seeding announcer: `started` (fired once the caller decides
    /// seeding has begun, i.e. the first piece is present), then periodic
    /// `none` announcements, until shutdown (`stopped`).
    pub(crate) async fn run_until_shutdown(mut self) {
        self.announce_round(Event::Started).await;
        self.callbacks.seeding_started();
        let mut wait = self.conf.interval;

        loop {
            delay_for(wait).await;
            if self.piece_manager.is_shutdown() {
                self.announce_round(Event::Stopped).await;
                self.callbacks.seeding_stopped();
                return;
            }
            wait = self.announce_round(Event::None).await;
        }
    }

    /// Announces `event` to every configured tracker in list order,
    /// regardless of whether earlier ones failed, merging any peers
    /// returned into the shared directory. Returns the wait duration to
    /// honor before the next announcement: `min(I, R)` over the successful
    /// responses this round, or `I` if every tracker failed.
    async fn announce_round(&mut self, event: Event) -> Duration {
        let request = AnnounceRequest {
            info_hash: self.conf.info_hash,
            peer_id: self.conf.client_id,
            port: self.conf.listen_port,
            uploaded: self.meter.lock().expect("meter mutex poisoned").uploaded.total(),
            downloaded: self
                .meter
                .lock()
                .expect("meter mutex poisoned")
                .downloaded
                .total(),
            left: self.compute_left(),
            event,
            num_want: self.conf.num_want,
        };

        let mut next_wait: Option<Duration> = None;
        let mut any_succeeded = false;
        for url in &self.conf.tracker_urls {
            match tracker::announce(url, &request).await {
                Ok(response) => {
                    any_succeeded = true;
                    self.peers.merge(response.peers);
                    let interval =
                        response.min_interval.unwrap_or(response.interval);
                    next_wait = Some(match next_wait {
                        Some(current) => current.min(interval),
                        None => interval,
                    });
                }
                Err(e) => {
                    log::warn!(
                        "{:?} announcer: tracker {} failed: {}",
                        self.role,
                        url,
                        e
                    );
                }
            }
        }

        if any_succeeded {
            self.consecutive_failures.store(0, Ordering::SeqCst);
        } else {
            let failures =
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= TRACKER_FAILURE_THRESHOLD && self.peers.is_empty() {
                self.callbacks.download_failed(format!(
                    "{:?} announcer: every tracker failed {} times with no known peers",
                    self.role, failures
                ));
            }
        }

        next_wait.unwrap_or(self.conf.interval).min(self.conf.interval)
    }

    /// `total length - (present pieces' lengths)`, per spec §4.5.
    fn compute_left(&self) -> u64 {
        if self.piece_manager.is_complete() {
            return 0;
        }
        let storage = self.disk.storage_info();
        let mut left = storage.download_len;
        for index in 0..self.piece_manager.piece_count() {
            if self.piece_manager.has_piece(index) {
                left -= storage.piece_len(index).unwrap_or(0) as u64;
            }
        }
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Metainfo;
    use crate::torrent::TorrentCallbacks;
    use std::path::PathBuf;

    struct NoopCallbacks;
    impl TorrentCallbacks for NoopCallbacks {}

    fn single_file_metainfo() -> Vec<u8> {
        let pieces = vec![0u8; 40];
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce17:http://tracker/4:infod6:lengthi40000e4:name5:a.bin12:piece lengthi16384e6:pieces");
        buf.extend_from_slice(format!("{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");
        buf
    }

    async fn test_announcer(scratch: &str, present: Vec<usize>) -> Announcer {
        let bytes = single_file_metainfo();
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        let info_hash = Metainfo::create_info_hash(&bytes).unwrap();

        let download_dir =
            std::env::temp_dir().join(format!("torrentwire-announce-test-{}", scratch));
        let _ = std::fs::remove_dir_all(&download_dir);
        let storage = crate::storage_info::StorageInfo::new(&metainfo, download_dir.clone());
        let disk = Disk::allocate(storage, vec![0u8; 60]).await.unwrap();

        let resume_path = PathBuf::from(&download_dir).join("a.bin.state");
        let piece_manager =
            Arc::new(PieceManager::new(metainfo.piece_count(), present, resume_path));

        Announcer::new(
            Role::Download,
            AnnouncerConf {
                info_hash,
                client_id: [1u8; 20],
                listen_port: 6881,
                tracker_urls: Vec::new(),
                interval: Duration::from_secs(1800),
                num_want: None,
            },
            piece_manager,
            disk,
            Arc::new(Mutex::new(ThroughputCounter::new())),
            Arc::new(crate::torrent::PeerDirectory::new()),
            Arc::new(NoopCallbacks),
        )
    }

    #[tokio::test]
    async fn compute_left_accounts_for_present_pieces() {
        let announcer = test_announcer("compute-left", vec![0]).await;
        // total 40000, piece 0 (16384 bytes) present, pieces 1-2 absent
        assert_eq!(announcer.compute_left(), 40000 - 16384);
    }

    #[tokio::test]
    async fn compute_left_is_zero_once_complete() {
        let announcer = test_announcer("compute-left-complete", vec![0, 1, 2]).await;
        assert_eq!(announcer.compute_left(), 0);
    }

    #[tokio::test]
    async fn announce_round_with_no_trackers_falls_back_to_configured_interval() {
        let mut announcer = test_announcer("no-trackers", vec![]).await;
        let wait = announcer.announce_round(Event::Started).await;
        assert_eq!(wait, Duration::from_secs(1800));
    }
}
