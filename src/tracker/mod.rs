//! Tracker clients.
//!
//! A tracker is addressed by a URL; the scheme selects the transport (HTTP
//! or UDP) but both transports answer the same `announce` contract, so
//! callers never need to know which one they're talking to.

mod http;
mod udp;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::{PeerId, Sha1Hash};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    None,
    Started,
    Completed,
    Stopped,
}

impl Event {
    fn as_http_str(self) -> Option<&'static str> {
        match self {
            Event::None => None,
            Event::Started => Some("started"),
            Event::Completed => Some("completed"),
            Event::Stopped => Some("stopped"),
        }
    }

    fn as_udp_code(self) -> u32 {
        match self {
            Event::None => 0,
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AnnounceRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
    pub num_want: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

/// Announces to `url`, dispatching to the transport implied by its scheme.
pub async fn announce(
    url: &str,
    request: &AnnounceRequest,
) -> Result<AnnounceResponse> {
    if url.starts_with("http://") || url.starts_with("https://") {
        http::announce(url, request).await
    } else if url.starts_with("udp://") {
        udp::announce(url, request).await
    } else {
        Err(Error::TrackerFailure(format!(
            "unsupported tracker url scheme: {}",
            url
        )))
    }
}

/// Parses a compact peer list (BEP 23): 6 bytes per peer, a 4-byte IPv4
/// address followed by a 2-byte big-endian port.
fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    if bytes.len() % 6 != 0 {
        return Err(Error::MalformedTrackerResponse(format!(
            "compact peer list length {} is not a multiple of 6",
            bytes.len()
        )));
    }
    let peers = bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip =
                std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect();
    Ok(dedup_peers(peers))
}

/// Drops the `0.0.0.0:0` sentinel some trackers pad compact lists with and
/// deduplicates the remaining peers by (ip, port).
fn dedup_peers(peers: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let mut seen = HashSet::new();
    peers
        .into_iter()
        .filter(|addr| {
            addr.port() != 0 && !addr.ip().is_unspecified() && seen.insert(*addr)
        })
        .collect()
}
