//! Peer-wire sessions: the handshake shared by both the downloader and the
//! seeder, plus the two session types built on top of it.

pub(crate) mod codec;
mod download;
mod seed;

pub(crate) use download::DownloadSession;
pub(crate) use seed::{SeedSession, UploadObserver};

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedParts};

use crate::error::{Error, Result};
use crate::{PeerId, Sha1Hash};
use codec::{Handshake, HandshakeCodec, PeerCodec};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A framed socket past the handshake, ready to exchange [`codec::Message`]
/// values.
pub(crate) type PeerSocket = Framed<TcpStream, PeerCodec>;

/// Dials `addr`, performs the handshake for `info_hash` and drops the
/// connection on a mismatched info hash. Returns the framed socket, swapped
/// from the handshake codec to the steady-state message codec, along with
/// the remote's self-reported peer id.
pub(crate) async fn connect_and_handshake(
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
) -> Result<(PeerSocket, PeerId)> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::PeerProtocol(format!("connect to {} timed out", addr)))??;
    let mut socket = Framed::new(stream, HandshakeCodec);

    socket.send(Handshake::new(info_hash, client_id)).await?;
    let handshake = socket
        .next()
        .await
        .ok_or_else(|| Error::PeerProtocol(format!("{} closed before handshake", addr)))??;
    if handshake.info_hash != info_hash {
        return Err(Error::PeerProtocol(format!(
            "{} sent handshake with mismatched info hash",
            addr
        )));
    }

    Ok((swap_to_peer_codec(socket), handshake.peer_id))
}

/// Accepts an inbound peer already past the TCP handshake: reads its
/// handshake first, validates the info hash against `info_hash`, then
/// replies with ours.
pub(crate) async fn accept_handshake(
    stream: TcpStream,
    info_hash: Sha1Hash,
    client_id: PeerId,
) -> Result<(PeerSocket, PeerId)> {
    let mut socket = Framed::new(stream, HandshakeCodec);
    let handshake = socket
        .next()
        .await
        .ok_or_else(|| Error::PeerProtocol("peer closed before handshake".into()))??;
    if handshake.info_hash != info_hash {
        return Err(Error::PeerProtocol(
            "inbound handshake has mismatched info hash".into(),
        ));
    }
    socket.send(Handshake::new(info_hash, client_id)).await?;

    Ok((swap_to_peer_codec(socket), handshake.peer_id))
}

/// Swaps a socket's codec from [`HandshakeCodec`] to [`PeerCodec`] without
/// losing any bytes already buffered by the former.
fn swap_to_peer_codec(socket: Framed<TcpStream, HandshakeCodec>) -> PeerSocket {
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}
