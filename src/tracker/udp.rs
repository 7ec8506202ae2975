//! UDP tracker transport (BEP 15): a connect/announce handshake over a
//! single unconnected socket.

use std::convert::TryInto;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::{Error, Result};

use super::{parse_compact_peers, AnnounceRequest, AnnounceResponse};

/// The magic connection ID used to request a real one, per BEP 15.
const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(15);

pub(super) async fn announce(
    url: &str,
    request: &AnnounceRequest,
) -> Result<AnnounceResponse> {
    let parsed =
        url::Url::parse(url).map_err(|e| Error::TrackerFailure(e.to_string()))?;
    let host = parsed.host_str().ok_or_else(|| {
        Error::TrackerFailure(format!("udp tracker url has no host: {}", url))
    })?;
    let port = parsed.port().ok_or_else(|| {
        Error::TrackerFailure(format!("udp tracker url has no port: {}", url))
    })?;
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::TrackerFailure(e.to_string()))?
        .next()
        .ok_or_else(|| {
            Error::TrackerFailure(format!("could not resolve tracker host {}", host))
        })?;

    let mut socket = UdpSocket::bind("0.0.0.0:0").await?;
    let connection_id = connect(&mut socket, addr).await?;
    do_announce(&mut socket, addr, connection_id, request).await
}

async fn connect(socket: &mut UdpSocket, addr: SocketAddr) -> Result<u64> {
    let transaction_id: u32 = rand::thread_rng().gen();
    let mut req = Vec::with_capacity(16);
    req.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    req.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    req.extend_from_slice(&transaction_id.to_be_bytes());
    socket.send_to(&req, addr).await?;

    let mut buf = [0u8; 16];
    let (len, from) = timeout(SOCKET_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| Error::TrackerFailure("udp tracker connect timed out".into()))??;
    if from != addr || len < 16 {
        return Err(Error::MalformedTrackerResponse(
            "udp connect response too short or from unexpected peer".into(),
        ));
    }

    let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let got_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if action != ACTION_CONNECT || got_transaction_id != transaction_id {
        return Err(Error::MalformedTrackerResponse(
            "udp connect response action or transaction id mismatch".into(),
        ));
    }
    Ok(u64::from_be_bytes(buf[8..16].try_into().unwrap()))
}

async fn do_announce(
    socket: &mut UdpSocket,
    addr: SocketAddr,
    connection_id: u64,
    request: &AnnounceRequest,
) -> Result<AnnounceResponse> {
    let transaction_id: u32 = rand::thread_rng().gen();
    let key: u32 = rand::thread_rng().gen();
    let num_want: i32 = request.num_want.map(|n| n as i32).unwrap_or(-1);

    let mut req = Vec::with_capacity(98);
    req.extend_from_slice(&connection_id.to_be_bytes());
    req.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    req.extend_from_slice(&transaction_id.to_be_bytes());
    req.extend_from_slice(&request.info_hash);
    req.extend_from_slice(&request.peer_id);
    req.extend_from_slice(&request.downloaded.to_be_bytes());
    req.extend_from_slice(&request.left.to_be_bytes());
    req.extend_from_slice(&request.uploaded.to_be_bytes());
    req.extend_from_slice(&request.event.as_udp_code().to_be_bytes());
    req.extend_from_slice(&0u32.to_be_bytes()); // IP: 0 means "use sender's"
    req.extend_from_slice(&key.to_be_bytes());
    req.extend_from_slice(&num_want.to_be_bytes());
    req.extend_from_slice(&request.port.to_be_bytes());
    debug_assert_eq!(req.len(), 98);

    socket.send_to(&req, addr).await?;

    let mut buf = [0u8; 2048];
    let (len, from) = timeout(SOCKET_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| Error::TrackerFailure("udp tracker announce timed out".into()))??;
    if from != addr || len < 20 {
        return Err(Error::MalformedTrackerResponse(
            "udp announce response too short or from unexpected peer".into(),
        ));
    }
    let buf = &buf[..len];

    let action = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let got_transaction_id = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if action != ACTION_ANNOUNCE || got_transaction_id != transaction_id {
        return Err(Error::MalformedTrackerResponse(
            "udp announce response action or transaction id mismatch".into(),
        ));
    }

    let interval = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    let leechers = u32::from_be_bytes(buf[12..16].try_into().unwrap());
    let seeders = u32::from_be_bytes(buf[16..20].try_into().unwrap());
    let peers = parse_compact_peers(&buf[20..])?;

    Ok(AnnounceResponse {
        interval: Duration::from_secs(interval as u64),
        min_interval: None,
        complete: Some(seeders),
        incomplete: Some(leechers),
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_has_expected_layout() {
        let transaction_id: u32 = 0x1234_5678;
        let mut req = Vec::with_capacity(16);
        req.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        req.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        req.extend_from_slice(&transaction_id.to_be_bytes());
        assert_eq!(req.len(), 16);
        assert_eq!(&req[0..8], &PROTOCOL_ID.to_be_bytes());
        assert_eq!(&req[8..12], &0u32.to_be_bytes());
    }

    #[test]
    fn announce_request_has_expected_layout() {
        let request = AnnounceRequest {
            info_hash: [7u8; 20],
            peer_id: [9u8; 20],
            port: 6881,
            uploaded: 10,
            downloaded: 20,
            left: 30,
            event: super::super::Event::Started,
            num_want: None,
        };
        let connection_id = 0xAABB_CCDD_EEFF_0011u64;
        let transaction_id = 0x1111_2222u32;
        let key = 0x3333_4444u32;

        let mut req = Vec::with_capacity(98);
        req.extend_from_slice(&connection_id.to_be_bytes());
        req.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        req.extend_from_slice(&transaction_id.to_be_bytes());
        req.extend_from_slice(&request.info_hash);
        req.extend_from_slice(&request.peer_id);
        req.extend_from_slice(&request.downloaded.to_be_bytes());
        req.extend_from_slice(&request.left.to_be_bytes());
        req.extend_from_slice(&request.uploaded.to_be_bytes());
        req.extend_from_slice(&request.event.as_udp_code().to_be_bytes());
        req.extend_from_slice(&0u32.to_be_bytes());
        req.extend_from_slice(&key.to_be_bytes());
        req.extend_from_slice(&(-1i32).to_be_bytes());
        req.extend_from_slice(&request.port.to_be_bytes());

        assert_eq!(req.len(), 98);
        assert_eq!(&req[8..12], &ACTION_ANNOUNCE.to_be_bytes());
        assert_eq!(&req[16..36], &request.info_hash);
        assert_eq!(&req[36..56], &request.peer_id);
        assert_eq!(&req[96..98], &request.port.to_be_bytes());
    }

    /// Stands in for a tracker: answers one connect request and one
    /// announce request on a loopback socket, then returns.
    async fn fake_tracker(mut socket: UdpSocket) {
        let mut buf = [0u8; 2048];

        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 16);
        assert_eq!(&buf[0..8], &PROTOCOL_ID.to_be_bytes());
        let transaction_id = &buf[12..16];
        let connection_id = 0xdead_beef_0011_2233u64;
        let mut resp = Vec::with_capacity(16);
        resp.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        resp.extend_from_slice(transaction_id);
        resp.extend_from_slice(&connection_id.to_be_bytes());
        socket.send_to(&resp, from).await.unwrap();

        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 98);
        assert_eq!(&buf[0..8], &connection_id.to_be_bytes());
        let transaction_id = buf[12..16].to_vec();

        let mut resp = Vec::with_capacity(26);
        resp.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        resp.extend_from_slice(&transaction_id);
        resp.extend_from_slice(&1800u32.to_be_bytes()); // interval
        resp.extend_from_slice(&3u32.to_be_bytes()); // leechers
        resp.extend_from_slice(&7u32.to_be_bytes()); // seeders
        resp.extend_from_slice(&[127, 0, 0, 1]);
        resp.extend_from_slice(&6881u16.to_be_bytes());
        socket.send_to(&resp, from).await.unwrap();
    }

    #[tokio::test]
    async fn connect_and_announce_round_trip_over_loopback() {
        let tracker_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_addr = tracker_socket.local_addr().unwrap();
        tokio::spawn(fake_tracker(tracker_socket));

        let mut client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connection_id = connect(&mut client_socket, tracker_addr).await.unwrap();
        assert_eq!(connection_id, 0xdead_beef_0011_2233u64);

        let request = AnnounceRequest {
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: super::super::Event::Started,
            num_want: None,
        };
        let response =
            do_announce(&mut client_socket, tracker_addr, connection_id, &request)
                .await
                .unwrap();

        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.complete, Some(7));
        assert_eq!(response.incomplete, Some(3));
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].port(), 6881);
    }
}
