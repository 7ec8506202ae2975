use std::net::SocketAddr;
use std::time::Duration;

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_bytes::ByteBuf;

use crate::error::{Error, Result};

use super::{dedup_peers, parse_compact_peers, AnnounceRequest, AnnounceResponse};

/// RFC 3986 unreserved characters: everything else gets percent-encoded.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// The tracker's recommended re-announce interval when a response omits
/// `interval`, which BEP 3 requires but some trackers skip anyway.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,
    complete: Option<u32>,
    incomplete: Option<u32>,
    #[serde(default)]
    peers: Option<RawPeers>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPeers {
    Compact(ByteBuf),
    Dict(Vec<RawPeerDict>),
}

#[derive(Debug, Deserialize)]
struct RawPeerDict {
    ip: String,
    port: u16,
}

pub(super) async fn announce(
    url: &str,
    request: &AnnounceRequest,
) -> Result<AnnounceResponse> {
    let mut query_url =
        url::Url::parse(url).map_err(|e| Error::TrackerFailure(e.to_string()))?;
    {
        let mut pairs = query_url.query_pairs_mut();
        pairs
            .append_pair("port", &request.port.to_string())
            .append_pair("uploaded", &request.uploaded.to_string())
            .append_pair("downloaded", &request.downloaded.to_string())
            .append_pair("left", &request.left.to_string())
            .append_pair("compact", "1");
        if let Some(event) = request.event.as_http_str() {
            pairs.append_pair("event", event);
        }
        if let Some(num_want) = request.num_want {
            pairs.append_pair("numwant", &num_want.to_string());
        }
    }

    // info_hash and peer_id are raw bytes, not UTF-8 text, so `Url`'s own
    // query encoder (which is meant for text form fields) would mangle
    // them; percent-encode them ourselves and append by hand instead.
    let info_hash = percent_encode(&request.info_hash, UNRESERVED);
    let peer_id = percent_encode(&request.peer_id, UNRESERVED);
    let full_url =
        format!("{}&info_hash={}&peer_id={}", query_url, info_hash, peer_id);

    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Error::TrackerFailure(e.to_string()))?;
    let bytes = client
        .get(&full_url)
        .send()
        .await
        .map_err(|e| Error::TrackerFailure(e.to_string()))?
        .bytes()
        .await
        .map_err(|e| Error::TrackerFailure(e.to_string()))?;

    let raw: RawResponse = serde_bencode::from_bytes(&bytes)
        .map_err(|e| Error::MalformedTrackerResponse(e.to_string()))?;

    if let Some(reason) = raw.failure_reason {
        return Err(Error::TrackerFailure(reason));
    }

    let peers = match raw.peers {
        Some(RawPeers::Compact(bytes)) => parse_compact_peers(&bytes)?,
        Some(RawPeers::Dict(dicts)) => {
            let peers = dicts
                .into_iter()
                .filter_map(|peer| {
                    peer.ip
                        .parse::<std::net::Ipv4Addr>()
                        .ok()
                        .map(|ip| SocketAddr::from((ip, peer.port)))
                })
                .collect();
            dedup_peers(peers)
        }
        None => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval: raw
            .interval
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_INTERVAL),
        min_interval: raw.min_interval.map(Duration::from_secs),
        complete: raw.complete,
        incomplete: raw.incomplete,
        peers,
    })
}
