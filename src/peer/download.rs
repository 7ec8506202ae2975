//! The downloader's per-peer session: one connection's full lifecycle,
//! from handshake through the `Downloading` loop, per the worker state
//! machine `Connect -> Handshake -> AwaitBitfield -> SendInterested ->
//! AwaitUnchoke -> Downloading`.
//!
//! Rotating through known peers and counting per-peer connect failures is
//! the calling worker's responsibility; a session represents a single
//! attempt against a single address.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::time::timeout;

use crate::counter::ThroughputCounter;
use crate::disk::Disk;
use crate::error::{Error, Result};
use crate::piece_manager::PieceManager;
use crate::{block_count, block_len, BlockInfo, PeerId, PieceIndex, Sha1Hash, BLOCK_LEN};

use super::codec::Message;
use super::{connect_and_handshake, PeerSocket};

/// How long a message read waits before re-checking whether the torrent has
/// been shut down.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

enum PieceOutcome {
    Verified,
    Mismatched,
    /// The peer choked us mid-piece; the block requests already sent are
    /// abandoned and the piece is returned for retry by the caller.
    Choked,
}

/// A single connect-handshake-download attempt against one peer address.
pub(crate) struct DownloadSession;

impl DownloadSession {
    /// Runs the full per-peer download lifecycle. Returns once the torrent
    /// is complete, the piece manager is shut down, or a protocol error
    /// makes this peer unusable.
    pub(crate) async fn run(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
        piece_manager: Arc<PieceManager>,
        disk: Arc<Disk>,
        meter: Arc<Mutex<ThroughputCounter>>,
    ) -> Result<()> {
        let (socket, _peer_id) =
            connect_and_handshake(addr, info_hash, client_id).await?;
        let (mut sink, mut stream) = socket.split();

        await_availability(&mut stream, &piece_manager, addr).await?;
        sink.send(Message::Interested).await?;
        await_unchoke(&mut stream, &piece_manager, addr).await?;

        loop {
            let index = match piece_manager.next_piece().await {
                Some(index) => index,
                None => break,
            };

            let outcome = download_piece(
                &mut sink,
                &mut stream,
                &disk,
                index,
                &meter,
                &piece_manager,
                addr,
            )
            .await;

            match outcome {
                Ok(PieceOutcome::Verified) => piece_manager.mark_present(index)?,
                Ok(PieceOutcome::Mismatched) => {
                    log::warn!(
                        "piece {} from {} failed hash verification",
                        index,
                        addr
                    );
                    piece_manager.return_for_retry(index)?;
                }
                Ok(PieceOutcome::Choked) => {
                    piece_manager.return_for_retry(index)?;
                    await_unchoke(&mut stream, &piece_manager, addr).await?;
                }
                Err(e) => {
                    let _ = piece_manager.return_for_retry(index);
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

/// Reads messages until a bitfield, have-all or have-none arrives. Other
/// messages received in the meantime are simply not acted upon here, since
/// the only thing gating progress to the next state is an availability
/// message.
async fn await_availability(
    stream: &mut SplitStream<PeerSocket>,
    piece_manager: &PieceManager,
    addr: SocketAddr,
) -> Result<()> {
    loop {
        match next_message(stream, piece_manager, addr).await? {
            Message::Bitfield(bits) => {
                let expected_bytes = (piece_manager.piece_count() + 7) / 8;
                let got_bytes = bits.as_slice().len();
                if got_bytes < expected_bytes {
                    return Err(Error::PeerProtocol(format!(
                        "{} sent a bitfield of {} bytes, expected at least {}",
                        addr, got_bytes, expected_bytes
                    )));
                }
                return Ok(());
            }
            Message::HaveAll | Message::HaveNone => return Ok(()),
            _ => continue,
        }
    }
}

async fn await_unchoke(
    stream: &mut SplitStream<PeerSocket>,
    piece_manager: &PieceManager,
    addr: SocketAddr,
) -> Result<()> {
    loop {
        match next_message(stream, piece_manager, addr).await? {
            Message::Unchoke => return Ok(()),
            _ => continue,
        }
    }
}

/// Requests every block of piece `index` and assembles the replies. A
/// choke seen while blocks are outstanding ends the attempt early; any
/// protocol violation (out-of-order or mis-sized block) is a fatal error
/// for this peer.
async fn download_piece(
    sink: &mut SplitSink<PeerSocket, Message>,
    stream: &mut SplitStream<PeerSocket>,
    disk: &Arc<Disk>,
    index: PieceIndex,
    meter: &Mutex<ThroughputCounter>,
    piece_manager: &PieceManager,
    addr: SocketAddr,
) -> Result<PieceOutcome> {
    let piece_len = disk.storage_info().piece_len(index)?;
    let block_count = block_count(piece_len);

    for block_index in 0..block_count {
        let offset = block_index as u32 * BLOCK_LEN;
        let len = block_len(piece_len, block_index);
        sink.send(Message::Request(BlockInfo {
            piece_index: index,
            offset,
            len,
        }))
        .await?;
    }

    let mut data = vec![0u8; piece_len as usize];
    let mut next_block = 0usize;
    while next_block < block_count {
        match next_message(stream, piece_manager, addr).await? {
            Message::Block {
                piece_index,
                offset,
                data: block,
            } => {
                let expected_offset = next_block as u32 * BLOCK_LEN;
                let expected_len = block_len(piece_len, next_block) as usize;
                if piece_index != index || offset != expected_offset {
                    return Err(Error::PeerProtocol(format!(
                        "received block ({}, {}) but expected ({}, {})",
                        piece_index, offset, index, expected_offset
                    )));
                }
                if block.len() != expected_len {
                    return Err(Error::PeerProtocol(format!(
                        "block length {} does not match expected {}",
                        block.len(),
                        expected_len
                    )));
                }
                let start = expected_offset as usize;
                data[start..start + expected_len].copy_from_slice(&block);
                next_block += 1;
                meter
                    .lock()
                    .expect("meter mutex poisoned")
                    .downloaded
                    .update(expected_len as u64);
            }
            Message::Choke => return Ok(PieceOutcome::Choked),
            _ => continue,
        }
    }

    let expected_hash = disk.expected_piece_hash(index);
    let digest = Sha1::digest(&data);
    if &digest[..] == &expected_hash[..] {
        Arc::clone(disk).write_piece(index, data).await?;
        Ok(PieceOutcome::Verified)
    } else {
        Ok(PieceOutcome::Mismatched)
    }
}

/// Waits for the next message, waking up periodically to check whether the
/// torrent has been shut down so a session never blocks past that point.
async fn next_message(
    stream: &mut SplitStream<PeerSocket>,
    piece_manager: &PieceManager,
    addr: SocketAddr,
) -> Result<Message> {
    loop {
        match timeout(IDLE_POLL_INTERVAL, stream.next()).await {
            Ok(Some(Ok(msg))) => return Ok(msg),
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => {
                return Err(Error::PeerProtocol(format!(
                    "{} closed the connection",
                    addr
                )))
            }
            Err(_) => {
                if piece_manager.is_shutdown() {
                    return Err(Error::ShutdownRequested);
                }
            }
        }
    }
}
