//! The peer wire protocol: handshake and framed message codecs.
//!
//! The handshake has its own codec because its layout differs from every
//! other message and it is only ever exchanged once, at the start of a
//! connection. After the exchange the connection switches to
//! [`MessageCodec`] while keeping the underlying read and write buffers.

use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, metainfo::InfoHash, peer::PeerId};

/// The block length nearly all clients use; the last block of a piece may
/// be smaller.
pub const BLOCK_LEN: u32 = 1 << 14;

/// Frames declaring a payload longer than this are rejected outright.
pub const MAX_PAYLOAD_LEN: usize = 100_000_000;

/// String identifier of the protocol, "BitTorrent protocol".
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// A block of data carried by a Piece message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    /// The piece this block belongs to.
    pub index: usize,
    /// Zero-based byte offset into the piece.
    pub begin: u32,
    /// The data itself.
    pub data: Vec<u8>,
}

/// The coordinates of a block, as carried by Request and Cancel messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub index: u32,
    pub begin: u32,
    pub len: u32,
}

impl BlockInfo {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }
}

/// The first message exchanged on a connection, in both directions. A
/// mismatched protocol string or info hash severs the connection.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];

        // advertise the extension protocol (BEP10)
        reserved[5] |= 0x10;

        Self { reserved, info_hash, peer_id }
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }
}

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.put_u8(PSTR.len() as u8);
        buf.extend_from_slice(&PSTR);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(&handshake.info_hash.0);
        buf.extend_from_slice(&handshake.peer_id.0);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Handshake>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek the length prefix without consuming it, the rest of the
        // handshake may not have arrived yet
        if buf[0] as usize != PSTR.len() {
            return Err(Error::HandshakeInvalid);
        }
        if buf.len() < 1 + PSTR.len() + 8 + 20 + 20 {
            return Ok(None);
        }

        buf.advance(1);

        let mut pstr = [0u8; 19];
        buf.copy_to_slice(&mut pstr);
        if pstr != PSTR {
            return Err(Error::HandshakeInvalid);
        }

        let mut reserved = [0u8; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0u8; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}

/// Messages exchanged after the handshake. On the wire each one is
/// `length: u32 big-endian || id: u8 || payload`; a zero length is a
/// keep-alive.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    /// Raw bitfield bytes; the receiver sizes it with the known piece
    /// count.
    Bitfield(Vec<u8>),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    /// BEP10 envelope: connection-local extension id plus payload.
    Extended(u8, Vec<u8>),
}

/// The wire ids of the [`Message`] kinds.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
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
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self, Error> {
        use MessageId::*;
        match id {
            id if id == Choke as u8 => Ok(Choke),
            id if id == Unchoke as u8 => Ok(Unchoke),
            id if id == Interested as u8 => Ok(Interested),
            id if id == NotInterested as u8 => Ok(NotInterested),
            id if id == Have as u8 => Ok(Have),
            id if id == Bitfield as u8 => Ok(Bitfield),
            id if id == Request as u8 => Ok(Request),
            id if id == Piece as u8 => Ok(Piece),
            id if id == Cancel as u8 => Ok(Cancel),
            id if id == Extended as u8 => Ok(Extended),
            id => Err(Error::MessageId(id)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
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
            // <len=0005><id=4><piece index>
            Message::Have(piece) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece);
            }
            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bytes) => {
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&bytes);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Request as u8);
                block.encode(buf);
            }
            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                buf.put_u32(1 + 4 + 4 + block.data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(block.index as u32);
                buf.put_u32(block.begin);
                buf.extend_from_slice(&block.data);
            }
            // <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Cancel as u8);
                block.encode(buf);
            }
            // <len=0002+X><id=20><ext id><payload>
            Message::Extended(ext_id, payload) => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(ext_id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Message>, Error> {
        // the length header must be present to know the message size
        if buf.remaining() < 4 {
            return Ok(None);
        }

        // peek the length without advancing, the full message may not be
        // buffered yet
        let mut peek = Cursor::new(&buf);
        let msg_len = peek.get_u32() as usize;

        if msg_len > MAX_PAYLOAD_LEN {
            return Err(Error::FrameTooLarge(msg_len));
        }
        if buf.remaining() < 4 + msg_len {
            return Ok(None);
        }

        buf.advance(4);
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = buf.get_u8();
        let msg_id = MessageId::try_from(id)?;
        let bad_len = || Error::InvalidMessageLength { id, len: msg_len };

        let msg = match msg_id {
            MessageId::Choke if msg_len == 1 => Message::Choke,
            MessageId::Unchoke if msg_len == 1 => Message::Unchoke,
            MessageId::Interested if msg_len == 1 => Message::Interested,
            MessageId::NotInterested if msg_len == 1 => {
                Message::NotInterested
            }
            MessageId::Have if msg_len == 5 => Message::Have(buf.get_u32()),
            MessageId::Bitfield => {
                let mut bytes = vec![0; msg_len - 1];
                buf.copy_to_slice(&mut bytes);
                Message::Bitfield(bytes)
            }
            MessageId::Request if msg_len == 13 => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Request(BlockInfo { index, begin, len })
            }
            MessageId::Piece if msg_len >= 9 => {
                let index = buf.get_u32() as usize;
                let begin = buf.get_u32();
                let mut data = vec![0; msg_len - 9];
                buf.copy_to_slice(&mut data);
                Message::Piece(Block { index, begin, data })
            }
            MessageId::Cancel if msg_len == 13 => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Cancel(BlockInfo { index, begin, len })
            }
            MessageId::Extended if msg_len >= 2 => {
                let ext_id = buf.get_u8();
                let mut payload = vec![0; msg_len - 2];
                buf.copy_to_slice(&mut payload);
                Message::Extended(ext_id, payload)
            }
            _ => return Err(bad_len()),
        };

        Ok(Some(msg))
    }
}
