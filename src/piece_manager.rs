//! The piece manager: the single source of truth for per-piece state.
//!
//! A piece is always in exactly one of [`PieceState::Absent`],
//! [`PieceState::InFlight`] or [`PieceState::Present`], and may only move
//! absent → in-flight → {absent, present}. Once present, a piece never
//! regresses. All mutating methods take `&self` and lock internally so the
//! manager can be shared across downloader workers and the seeder listener
//! via a single `Arc`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::resume::ResumeBitmap;
use crate::PieceIndex;

/// Notified when a piece transitions to present, so the owning torrent can
/// surface the "piece completed" observability callback without every
/// caller of [`PieceManager::mark_present`] having to know about callbacks.
pub(crate) trait PieceObserver: Send + Sync {
    fn on_piece_present(&self, index: PieceIndex);
}

/// A piece may be retried this many times before the torrent is failed.
pub const MAX_RETRIES: u32 = 5;
/// Minimum time a piece must sit before it's eligible to be reclaimed after
/// a failed attempt.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);
/// The resume bitmap is flushed to disk every this many completions.
const FLUSH_INTERVAL: usize = 10;
/// How long a single `next_piece` poll waits before giving up.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceState {
    Absent,
    InFlight,
    Present,
}

#[derive(Debug)]
struct PieceEntry {
    state: PieceState,
    retries: u32,
    last_attempt: Option<Instant>,
}

struct Inner {
    pieces: Vec<PieceEntry>,
    present_count: usize,
    bitmap: ResumeBitmap,
    completions_since_flush: usize,
}

/// Owns the piece-state vector, the download queue implied by it, and the
/// resume bitmap's persistence schedule.
pub struct PieceManager {
    inner: Mutex<Inner>,
    piece_count: usize,
    resume_path: PathBuf,
    is_shutdown: AtomicBool,
    // exposed for the seeder listener's lock-free presence probe
    present_count_hint: AtomicUsize,
    observer: Mutex<Option<Arc<dyn PieceObserver>>>,
}

impl PieceManager {
    /// Creates a manager for `piece_count` pieces, with `present` marking
    /// the indices already verified present on disk (from the
    /// initialization algorithm run by the torrent actor before this
    /// manager is constructed).
    pub fn new(
        piece_count: usize,
        present: impl IntoIterator<Item = PieceIndex>,
        resume_path: PathBuf,
    ) -> Self {
        let mut pieces: Vec<PieceEntry> = (0..piece_count)
            .map(|_| PieceEntry {
                state: PieceState::Absent,
                retries: 0,
                last_attempt: None,
            })
            .collect();
        let mut bitmap = ResumeBitmap::new(piece_count);
        let mut present_count = 0;
        for index in present {
            pieces[index].state = PieceState::Present;
            bitmap.set(index);
            present_count += 1;
        }

        Self {
            inner: Mutex::new(Inner {
                pieces,
                present_count,
                bitmap,
                completions_since_flush: 0,
            }),
            piece_count,
            resume_path,
            is_shutdown: AtomicBool::new(false),
            present_count_hint: AtomicUsize::new(present_count),
            observer: Mutex::new(None),
        }
    }

    /// Registers a callback fired after a piece genuinely transitions to
    /// present (not on the idempotent no-op second call). At most one
    /// observer is supported, which is all a single owning torrent needs.
    pub fn set_observer(&self, observer: Arc<dyn PieceObserver>) {
        *self.observer.lock().expect("observer mutex poisoned") = Some(observer);
    }

    /// Loads a previously persisted resume bitmap, verifying against
    /// `verify` (typically a disk-hash check) each bit the bitmap claims is
    /// set; only bits that verify are carried over as present.
    pub fn from_resume_file(
        piece_count: usize,
        resume_path: PathBuf,
        mut verify: impl FnMut(PieceIndex) -> bool,
    ) -> Result<Self> {
        let present: Vec<PieceIndex> =
            match ResumeBitmap::load(&resume_path, piece_count)? {
                Some(bitmap) => bitmap.iter_set().filter(|&i| verify(i)).collect(),
                None => Vec::new(),
            };
        Ok(Self::new(piece_count, present, resume_path))
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.pieces[index].state == PieceState::Present
    }

    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.present_count == self.piece_count
    }

    pub fn present_count(&self) -> usize {
        self.present_count_hint.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.is_shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    fn try_claim(&self) -> Option<PieceIndex> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let claim = inner.pieces.iter().enumerate().find(|(_, entry)| {
            entry.state == PieceState::Absent
                && entry
                    .last_attempt
                    .map(|at| now.duration_since(at) >= RETRY_DELAY)
                    .unwrap_or(true)
        });
        let index = claim.map(|(index, _)| index)?;
        let entry = &mut inner.pieces[index];
        entry.state = PieceState::InFlight;
        Some(index)
    }

    /// Atomically claims some absent piece eligible for (re)download,
    /// polling for a small bounded interval if none is immediately
    /// available. Returns `None` once the torrent is complete, the manager
    /// has been shut down, or the poll interval elapses without success.
    pub async fn next_piece(&self) -> Option<PieceIndex> {
        if let Some(index) = self.try_claim() {
            return Some(index);
        }
        if self.is_complete() || self.is_shutdown() {
            return None;
        }
        tokio::time::delay_for(CLAIM_POLL_INTERVAL).await;
        if self.is_shutdown() {
            return None;
        }
        self.try_claim()
    }

    /// Marks piece `index` present. Requires the piece to currently be
    /// in-flight; a second call is a no-op (logged) rather than an error,
    /// since a retried piece may complete twice in a race between two
    /// workers.
    pub fn mark_present(&self, index: PieceIndex) -> Result<()> {
        let mut should_flush = false;
        let mut should_remove_resume = false;
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.pieces[index].state {
                PieceState::Present => {
                    log::debug!("piece {} already marked present", index);
                    return Ok(());
                }
                PieceState::Absent => {
                    log::warn!(
                        "mark_present({}) called on absent piece",
                        index
                    );
                }
                PieceState::InFlight => {}
            }
            inner.pieces[index].state = PieceState::Present;
            inner.present_count += 1;
            inner.bitmap.set(index);
            inner.completions_since_flush += 1;
            self.present_count_hint
                .store(inner.present_count, Ordering::Relaxed);

            if inner.completions_since_flush >= FLUSH_INTERVAL {
                inner.completions_since_flush = 0;
                should_flush = true;
            }
            if inner.present_count == self.piece_count {
                should_remove_resume = true;
            }
        }

        if should_remove_resume {
            ResumeBitmap::remove(&self.resume_path)?;
        } else if should_flush {
            self.flush()?;
        }

        if let Some(observer) = self
            .observer
            .lock()
            .expect("observer mutex poisoned")
            .as_ref()
        {
            observer.on_piece_present(index);
        }

        Ok(())
    }

    /// Flushes the resume bitmap unconditionally; called on every
    /// `FLUSH_INTERVAL`th completion and on cooperative shutdown.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.bitmap.flush(&self.resume_path)
    }

    /// Returns an in-flight piece to the download queue after a failed or
    /// abandoned attempt. Errs with [`Error::RetryExhausted`] once the
    /// piece's retry budget is spent; the torrent must then be failed.
    pub fn return_for_retry(&self, index: PieceIndex) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = &mut inner.pieces[index];
        if entry.state != PieceState::InFlight {
            return Ok(());
        }
        if entry.retries >= MAX_RETRIES {
            return Err(Error::RetryExhausted(index));
        }
        entry.state = PieceState::Absent;
        entry.retries += 1;
        entry.last_attempt = Some(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(suffix: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("torrentwire-piece-manager-test-{}", suffix))
    }

    #[tokio::test]
    async fn claims_and_completes_pieces() {
        let path = scratch_path("claim-complete");
        let _ = std::fs::remove_file(&path);
        let manager = PieceManager::new(3, Vec::new(), path.clone());

        assert!(!manager.is_complete());
        let a = manager.next_piece().await.unwrap();
        let b = manager.next_piece().await.unwrap();
        let c = manager.next_piece().await.unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);

        manager.mark_present(a).unwrap();
        manager.mark_present(b).unwrap();
        assert!(!manager.is_complete());
        manager.mark_present(c).unwrap();
        assert!(manager.is_complete());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn mark_present_is_idempotent() {
        let path = scratch_path("idempotent");
        let _ = std::fs::remove_file(&path);
        let manager = PieceManager::new(1, Vec::new(), path);
        let index = manager.next_piece().await.unwrap();
        manager.mark_present(index).unwrap();
        manager.mark_present(index).unwrap();
        assert!(manager.has_piece(index));
    }

    #[tokio::test]
    async fn retry_budget_is_enforced() {
        let path = scratch_path("retry-budget");
        let _ = std::fs::remove_file(&path);
        let manager = PieceManager::new(1, Vec::new(), path);

        for _ in 0..MAX_RETRIES {
            let index = manager.next_piece().await.unwrap();
            manager.return_for_retry(index).unwrap();
            // allow the retry delay to elapse so the piece is reclaimable
            tokio::time::delay_for(RETRY_DELAY).await;
        }

        let index = manager.next_piece().await.unwrap();
        match manager.return_for_retry(index) {
            Err(Error::RetryExhausted(i)) => assert_eq!(i, index),
            other => panic!("expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn next_piece_returns_none_when_complete() {
        let path = scratch_path("none-when-complete");
        let _ = std::fs::remove_file(&path);
        let manager = PieceManager::new(1, vec![0], path);
        assert!(manager.is_complete());
        assert_eq!(manager.next_piece().await, None);
    }

    #[test]
    fn resumes_from_verified_bitmap() {
        let path = scratch_path("resume-verify");
        let _ = std::fs::remove_file(&path);

        let mut bitmap = ResumeBitmap::new(3);
        bitmap.set(0);
        bitmap.set(2);
        bitmap.flush(&path).unwrap();

        // piece 2 fails verification (e.g. file truncated since last run)
        let manager = PieceManager::from_resume_file(3, path.clone(), |i| i != 2)
            .unwrap();
        assert!(manager.has_piece(0));
        assert!(!manager.has_piece(2));
        let _ = std::fs::remove_file(&path);
    }
}
