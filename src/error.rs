use std::{io, path::PathBuf};

use thiserror::Error;

impl From<bendy::decoding::Error> for Error {
    fn from(_value: bendy::decoding::Error) -> Self {
        Self::Bencode
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(_value: bendy::encoding::Error) -> Self {
        Self::Bencode
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to decode or encode a bencode buffer")]
    Bencode,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Could not access {path:?}: {source}")]
    FileIo { path: PathBuf, source: io::Error },

    #[error("Error when serializing/deserializing: {0}")]
    Speedy(#[from] speedy::Error),

    #[error("Error while trying to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("The metainfo file is malformed: {0}")]
    MetainfoInvalid(String),

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The info hash received in the handshake does not match ours")]
    InfoHashMismatch,

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("The peer took too long to accept the connection")]
    ConnectTimeout,

    #[error("Unknown message id {0}")]
    MessageId(u8),

    #[error("Message with id {id} has an invalid length of {len}")]
    InvalidMessageLength { id: u8, len: usize },

    #[error("Frame declares a payload of {0} bytes, which is above the limit")]
    FrameTooLarge(usize),

    #[error("Piece {piece} is out of range for a bitfield of {count} pieces")]
    PieceOutOfRange { piece: usize, count: usize },

    #[error("Bitfield has {got} bytes but {expected} were expected")]
    BitfieldLength { got: usize, expected: usize },

    #[error("Received a block for piece {0} which is not pending")]
    UnexpectedPiece(usize),

    #[error(
        "Received an unknown block for piece {piece} with offset {offset} \
         and length {len}"
    )]
    UnknownBlock { piece: usize, offset: u32, len: u32 },

    #[error("Conflicting extensions discovered: {0}")]
    ExtensionConflict(String),

    #[error(
        "Peer requested bytes outside of piece {piece}: offset {offset}, \
         length {len}"
    )]
    RequestOutOfBounds { piece: usize, offset: u32, len: u32 },

    #[error("Malformed BT-SEARCH message: {0}")]
    LsdMessage(String),

    #[error("Unsupported tracker scheme: {0}")]
    TrackerScheme(String),

    #[error("The tracker URL has no usable host")]
    TrackerNoHost,

    #[error("The response received from the tracker is not valid")]
    TrackerResponse,

    #[error("The tracker took too long to respond")]
    TrackerTimeout,

    #[error("Tracker URL data is {0} bytes long, the maximum is 255")]
    UrlDataTooLong(usize),

    #[error("Could not bind a listening socket on any port in the configured range")]
    NoListenPort,

    #[error("A peer task failed: {0}")]
    TaskFailed(String),
}
