//! The seeder's per-connection session: the inbound half of the peer-wire
//! state machine, `AwaitHandshake -> SendHandshake -> SendBitfield -> Idle`,
//! cycling between `Idle` and `Unchoked` as the remote toggles interest.
//!
//! Unlike [`super::DownloadSession`] this session never claims pieces of
//! its own; it only answers requests against pieces the piece manager
//! already reports present.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::counter::ThroughputCounter;
use crate::disk::Disk;
use crate::error::Result;
use crate::piece_manager::PieceManager;
use crate::{Bitfield, PeerId, Sha1Hash, BLOCK_LEN};

use super::codec::Message;
use super::{accept_handshake, PeerSocket};

/// How long a message read waits before re-checking whether the torrent has
/// been shut down, so an idle inbound connection still notices shutdown
/// promptly (spec §5 cancellation contract).
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Observability callback invoked whenever a request is served, so the
/// engine can report "piece uploaded" and feed the upload counter into
/// both announce schedulers.
pub(crate) trait UploadObserver: Send + Sync {
    fn on_block_uploaded(&self, addr: SocketAddr, len: u32);
}

/// A single inbound peer's full lifecycle, from accepted socket to
/// disconnection. Runs until the remote closes the connection, the torrent
/// shuts down, or a protocol error occurs.
pub(crate) struct SeedSession;

impl SeedSession {
    pub(crate) async fn run(
        stream: TcpStream,
        info_hash: Sha1Hash,
        client_id: PeerId,
        piece_manager: Arc<PieceManager>,
        disk: Arc<Disk>,
        meter: Arc<Mutex<ThroughputCounter>>,
        on_upload: Arc<dyn UploadObserver>,
    ) -> Result<()> {
        let addr = stream.peer_addr()?;
        let (socket, _peer_id) =
            accept_handshake(stream, info_hash, client_id).await?;
        let (mut sink, mut stream) = socket.split();

        sink.send(Message::Bitfield(snapshot_bitfield(&piece_manager)))
            .await?;

        let mut is_interested = false;
        let mut is_unchoked = false;

        while let Some(msg) = next_message(&mut stream, &piece_manager).await? {
            match msg {
                Message::Interested => {
                    is_interested = true;
                    if !is_unchoked {
                        is_unchoked = true;
                        sink.send(Message::Unchoke).await?;
                    }
                }
                Message::NotInterested => {
                    is_interested = false;
                }
                Message::Request(block) => {
                    if !is_interested || !is_unchoked {
                        log::debug!(
                            "{} requested block while not eligible, ignoring",
                            addr
                        );
                        continue;
                    }
                    if block.len > BLOCK_LEN
                        || !piece_manager.has_piece(block.piece_index)
                    {
                        log::warn!(
                            "{} sent invalid request {:?}, ignoring",
                            addr,
                            block
                        );
                        continue;
                    }
                    let data = match Arc::clone(&disk)
                        .read_block(block.piece_index, block.offset, block.len)
                        .await
                    {
                        Ok(data) => data,
                        Err(e) => {
                            log::warn!(
                                "failed to read block for {}: {}",
                                addr,
                                e
                            );
                            continue;
                        }
                    };
                    let len = data.len() as u32;
                    sink.send(Message::Block {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data,
                    })
                    .await?;
                    meter
                        .lock()
                        .expect("meter mutex poisoned")
                        .uploaded
                        .update(len as u64);
                    on_upload.on_block_uploaded(addr, len);
                }
                Message::Cancel(_) => {
                    // requests are served synchronously and in full before
                    // moving on to the next message, so a cancel can only
                    // ever race with a request that's already been served
                }
                Message::Choke | Message::Unchoke => {
                    // we drive choke state unilaterally in this permissive
                    // default; a remote choke/unchoke of us is meaningless
                    // on the seeding side and is ignored
                }
                _ => {}
            }

            if piece_manager.is_shutdown() {
                return Ok(());
            }
        }

        Ok(())
    }
}

/// Waits for the next message, waking up periodically to check whether the
/// torrent has been shut down so an idle inbound peer never keeps this
/// session alive past shutdown. Returns `Ok(None)` on a clean close or on
/// noticing shutdown while idle.
async fn next_message(
    stream: &mut SplitStream<PeerSocket>,
    piece_manager: &PieceManager,
) -> Result<Option<Message>> {
    loop {
        match timeout(IDLE_POLL_INTERVAL, stream.next()).await {
            Ok(Some(Ok(msg))) => return Ok(Some(msg)),
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => return Ok(None),
            Err(_) => {
                if piece_manager.is_shutdown() {
                    return Ok(None);
                }
            }
        }
    }
}

/// Builds a bitfield snapshot of the present set at this instant. The
/// listener never pushes `have` messages afterwards (see spec §4.8 / §4.9
/// design notes): a peer wanting a fresher view reconnects.
fn snapshot_bitfield(piece_manager: &PieceManager) -> Bitfield {
    let piece_count = piece_manager.piece_count();
    let byte_len = (piece_count + 7) / 8;
    let mut bytes = vec![0u8; byte_len];
    for index in 0..piece_count {
        if piece_manager.has_piece(index) {
            bytes[index / 8] |= 0x80 >> (index % 8);
        }
    }
    Bitfield::from_vec(bytes)
}
