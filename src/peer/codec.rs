//! The peer-wire codec: framing for the handshake and for length-prefixed
//! typed messages, as two [`tokio_util::codec`] implementations so a single
//! socket can be decoded with one and then, after the handshake, the other
//! (buffers carried over via `FramedParts`, see `peer::session`).

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::{Bitfield, BlockInfo, PeerId, Sha1Hash};

pub const PROTOCOL_STRING: &str = "BitTorrent protocol";
const HANDSHAKE_LEN: usize = 68;
/// No single message frame may exceed this length.
const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub struct HandshakeCodec;

impl Encoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let prot_len = buf[0] as usize;
        if prot_len != 19 {
            return Err(Error::PeerProtocol(format!(
                "invalid handshake protocol string length: {}",
                prot_len
            )));
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::PeerProtocol(
                "invalid handshake protocol string".into(),
            ));
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    HaveAll = 14,
    HaveNone = 15,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: usize,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    HaveAll,
    HaveNone,
}

impl Message {
    pub fn id(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not-interested",
            Message::Have { .. } => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request(_) => "request",
            Message::Block { .. } => "piece",
            Message::Cancel(_) => "cancel",
            Message::HaveAll => "have-all",
            Message::HaveNone => "have-none",
        }
    }
}

pub struct PeerCodec;

impl Encoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::HaveAll => {
                buf.put_u32(1);
                buf.put_u8(MessageId::HaveAll as u8);
            }
            Message::HaveNone => {
                buf.put_u32(1);
                buf.put_u8(MessageId::HaveNone as u8);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if len > MAX_FRAME_LEN {
            return Err(Error::PeerProtocol(format!(
                "frame length {} exceeds maximum {}",
                len, MAX_FRAME_LEN
            )));
        }
        if buf.len() < 4 + len {
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let id = buf[0];
        let payload_len = len - 1;

        let msg = match id {
            x if x == MessageId::Choke as u8 => {
                expect_payload_len(payload_len, 0)?;
                buf.advance(1);
                Message::Choke
            }
            x if x == MessageId::Unchoke as u8 => {
                expect_payload_len(payload_len, 0)?;
                buf.advance(1);
                Message::Unchoke
            }
            x if x == MessageId::Interested as u8 => {
                expect_payload_len(payload_len, 0)?;
                buf.advance(1);
                Message::Interested
            }
            x if x == MessageId::NotInterested as u8 => {
                expect_payload_len(payload_len, 0)?;
                buf.advance(1);
                Message::NotInterested
            }
            x if x == MessageId::Have as u8 => {
                expect_payload_len(payload_len, 4)?;
                buf.advance(1);
                let piece_index = buf.get_u32();
                Message::Have { piece_index }
            }
            x if x == MessageId::Bitfield as u8 => {
                buf.advance(1);
                let mut bytes = vec![0; payload_len];
                buf.copy_to_slice(&mut bytes);
                Message::Bitfield(Bitfield::from_vec(bytes))
            }
            x if x == MessageId::Request as u8 => {
                expect_payload_len(payload_len, 12)?;
                buf.advance(1);
                let piece_index = buf.get_u32() as usize;
                let offset = buf.get_u32();
                let block_len = buf.get_u32();
                Message::Request(BlockInfo {
                    piece_index,
                    offset,
                    len: block_len,
                })
            }
            x if x == MessageId::Piece as u8 => {
                if payload_len < 8 {
                    return Err(Error::PeerProtocol(
                        "piece message shorter than header".into(),
                    ));
                }
                buf.advance(1);
                let piece_index = buf.get_u32() as usize;
                let offset = buf.get_u32();
                let mut data = vec![0; payload_len - 8];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            x if x == MessageId::Cancel as u8 => {
                expect_payload_len(payload_len, 12)?;
                buf.advance(1);
                let piece_index = buf.get_u32() as usize;
                let offset = buf.get_u32();
                let block_len = buf.get_u32();
                Message::Cancel(BlockInfo {
                    piece_index,
                    offset,
                    len: block_len,
                })
            }
            x if x == MessageId::HaveAll as u8 => {
                expect_payload_len(payload_len, 0)?;
                buf.advance(1);
                Message::HaveAll
            }
            x if x == MessageId::HaveNone as u8 => {
                expect_payload_len(payload_len, 0)?;
                buf.advance(1);
                Message::HaveNone
            }
            // reserved/unknown message ids (9, 13, 16, 17, extension id 20,
            // and anything else) are tolerated by skipping the payload.
            _ => {
                buf.advance(1 + payload_len);
                return self.decode(buf);
            }
        };

        Ok(Some(msg))
    }
}

fn expect_payload_len(got: usize, expected: usize) -> Result<(), Error> {
    if got != expected {
        return Err(Error::PeerProtocol(format!(
            "expected payload length {}, got {}",
            expected, got
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let mut buf = BytesMut::new();
        let handshake = Handshake::new([1; 20], [2; 20]);
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, [1; 20]);
        assert_eq!(decoded.peer_id, [2; 20]);
    }

    #[test]
    fn request_round_trips() {
        let mut buf = BytesMut::new();
        let block = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Request(block));
    }

    #[test]
    fn piece_round_trips() {
        let mut buf = BytesMut::new();
        let data = vec![7; 100];
        PeerCodec
            .encode(
                Message::Block {
                    piece_index: 1,
                    offset: 0,
                    data: data.clone(),
                },
                &mut buf,
            )
            .unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Message::Block {
                piece_index,
                offset,
                data: got,
            } => {
                assert_eq!(piece_index, 1);
                assert_eq!(offset, 0);
                assert_eq!(got, data);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn rejects_oversize_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(2 * 1024 * 1024);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn keep_alive_round_trips() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn unknown_message_id_is_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u8(20); // reserved extension id
        buf.put_slice(&[0, 0, 0]);
        // followed by a real message
        PeerCodec.encode(Message::Unchoke, &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Unchoke);
    }
}
