//! The error taxonomy for the torrent engine.
//!
//! Every subsystem (disk IO, tracker clients, peer wire, piece manager)
//! raises into this single enum so that callers outside the engine (the
//! process lifecycle, progress rendering) only ever have to match on one
//! type. Recovery policy is documented on each variant: some are fatal for
//! a single torrent, some are absorbed by the caller and merely logged.

use std::fmt;
use std::io;

use crate::PieceIndex;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// The metainfo file is structurally invalid (missing required keys,
    /// zero-length `pieces`, a path escaping the download directory, etc).
    /// Fatal for the torrent the metainfo belongs to.
    MalformedMetainfo(String),
    /// Neither `announce` nor `announce-list` named a tracker URL.
    EmptyAnnounceList,
    /// An allocation, read, or write against the on-disk files failed.
    /// Fatal for the torrent, since further progress cannot be safely made.
    FileSystem(io::Error),
    /// Fewer bytes were available than requested from a read.
    ShortRead { expected: usize, got: usize },
    /// A tracker announce failed, either because the tracker reported a
    /// failure reason or the transport itself errored. Logged and retried
    /// at the next scheduled announce; not immediately fatal.
    TrackerFailure(String),
    /// A tracker response could not be parsed into peers/interval.
    MalformedTrackerResponse(String),
    /// A peer violated the wire protocol (bad handshake, oversize frame,
    /// out-of-order piece message, wrong info hash). The offending peer is
    /// dropped; the owning worker continues with another peer.
    PeerProtocol(String),
    /// A fully received piece's SHA-1 did not match the expected hash.
    /// The piece is returned to the download queue for a retry.
    PieceVerification(PieceIndex),
    /// A piece exhausted its retry budget without a single peer providing
    /// a valid copy. Fatal for the torrent.
    RetryExhausted(PieceIndex),
    /// Cooperative shutdown is in progress; propagated so each component
    /// can release its resources and return.
    ShutdownRequested,
    /// The caller referred to a torrent id the engine does not know about.
    InvalidTorrentId,
    /// The caller referred to a piece index outside of `0..piece_count`.
    InvalidPieceIndex,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedMetainfo(reason) => {
                write!(f, "malformed metainfo: {}", reason)
            }
            Error::EmptyAnnounceList => {
                write!(f, "metainfo has no announce URL")
            }
            Error::FileSystem(e) => write!(f, "file system error: {}", e),
            Error::ShortRead { expected, got } => write!(
                f,
                "short read: expected {} bytes, got {}",
                expected, got
            ),
            Error::TrackerFailure(reason) => {
                write!(f, "tracker failure: {}", reason)
            }
            Error::MalformedTrackerResponse(reason) => {
                write!(f, "malformed tracker response: {}", reason)
            }
            Error::PeerProtocol(reason) => {
                write!(f, "peer protocol error: {}", reason)
            }
            Error::PieceVerification(index) => {
                write!(f, "piece {} failed hash verification", index)
            }
            Error::RetryExhausted(index) => {
                write!(f, "piece {} exhausted its retry budget", index)
            }
            Error::ShutdownRequested => write!(f, "shutdown requested"),
            Error::InvalidTorrentId => write!(f, "invalid torrent id"),
            Error::InvalidPieceIndex => write!(f, "invalid piece index"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::FileSystem(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::MalformedMetainfo(e.to_string())
    }
}
