//! Metainfo (.torrent) decoding and canonical re-encoding.
//!
//! The info hash is the SHA-1 of the canonical bencoding of the `info`
//! dictionary, so the raw dictionary bytes are captured during decode and
//! hashed before the fields are pulled apart.

use std::fmt::{self, Display};

use bendy::{
    decoding::{self, Decoder, FromBencode, Object, ResultExt},
    encoding::{self, AsString, SingleItemEncoder, ToBencode},
};
use sha1::{Digest, Sha1};
use speedy::{Readable, Writable};

use crate::error::Error;

/// SHA-1 of the canonical bencoding of the metainfo `info` dictionary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({self})")
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// A decoded .torrent file.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct MetaInfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub info: Info,
}

impl MetaInfo {
    /// Every announce URL of the torrent: `announce` followed by the
    /// flattened `announce-list`, deduplicated in order.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls = vec![self.announce.clone()];

        if let Some(list) = &self.announce_list {
            for url in list.iter().flatten() {
                if !urls.contains(url) {
                    urls.push(url.clone());
                }
            }
        }

        urls
    }

    /// Check the structural invariants the rest of the engine relies on.
    pub fn validate(&self) -> Result<(), Error> {
        let info = &self.info;

        if info.piece_length == 0 {
            return Err(Error::MetainfoInvalid("piece length is zero".into()));
        }
        if info.pieces.len() % 20 != 0 {
            return Err(Error::MetainfoInvalid(format!(
                "pieces length {} is not a multiple of 20",
                info.pieces.len()
            )));
        }
        if info.file_length.is_none() && info.files.is_none() {
            return Err(Error::MetainfoInvalid(
                "neither length nor files is present".into(),
            ));
        }

        let expected = info.total_length().div_ceil(info.piece_length) as usize;
        if info.piece_count() != expected {
            return Err(Error::MetainfoInvalid(format!(
                "{} piece hashes for a torrent of {} pieces",
                info.piece_count(),
                expected
            )));
        }

        Ok(())
    }
}

/// The `info` dictionary of a torrent.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    /// Name of the file (single-file) or of the root directory (multi-file).
    pub name: String,

    /// Length in bytes of each piece, the last piece may be smaller.
    pub piece_length: u64,

    /// Concatenation of all 20-byte SHA-1 piece hashes.
    pub pieces: Vec<u8>,

    /// Set iff the torrent has a single file.
    pub file_length: Option<u64>,

    /// Set iff the torrent has many files.
    pub files: Option<Vec<File>>,

    /// Computed during decode, not part of the real `info` dictionary.
    pub info_hash: InfoHash,
}

impl Info {
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    pub fn piece_hash(&self, piece: usize) -> [u8; 20] {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&self.pieces[piece * 20..piece * 20 + 20]);
        hash
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        (0..self.piece_count()).map(|p| self.piece_hash(p)).collect()
    }

    pub fn total_length(&self) -> u64 {
        match &self.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.file_length.unwrap_or(0),
        }
    }

    /// Size in bytes of the given piece; only the last one may be short.
    pub fn piece_size(&self, piece: usize) -> u64 {
        let offset = piece as u64 * self.piece_length;
        self.piece_length.min(self.total_length() - offset)
    }

    /// The file list, normalized so that a single-file torrent carries
    /// exactly one entry of the total length with no path segments.
    pub fn output_files(&self) -> Vec<File> {
        match &self.files {
            Some(files) => files.clone(),
            None => vec![File {
                length: self.file_length.unwrap_or(0),
                path: Vec::new(),
            }],
        }
    }

    fn hash(raw: &[u8]) -> InfoHash {
        InfoHash(Sha1::digest(raw).into())
    }
}

/// One file entry of a multi-file torrent, relative to the torrent name.
#[derive(Debug, PartialEq, Eq, Clone, Default, Hash)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

impl ToBencode for File {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", self.length)?;
            e.emit_pair(b"path", &self.path)
        })?;
        Ok(())
    }
}

impl FromBencode for File {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;
        let mut length = 0;
        let mut path: Vec<String> = vec![];

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"length", value) => {
                    length =
                        u64::decode_bencode_object(value).context("length")?;
                }
                (b"path", value) => {
                    path = Vec::<String>::decode_bencode_object(value)
                        .context("path")?;
                }
                _ => {}
            }
        }

        Ok(Self { length, path })
    }
}

impl ToBencode for MetaInfo {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"announce", &self.announce)?;

            if let Some(announce_list) = &self.announce_list {
                e.emit_pair(b"announce-list", announce_list)?;
            }

            e.emit_pair(b"info", &self.info)
        })?;

        Ok(())
    }
}

impl ToBencode for Info {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(files) = &self.files {
                e.emit_pair(b"files", files)?;
            }
            if let Some(file_length) = &self.file_length {
                e.emit_pair(b"length", file_length)?;
            }
            e.emit_pair(b"name", &self.name)?;
            e.emit_pair(b"piece length", self.piece_length)?;
            e.emit_pair(b"pieces", AsString(&self.pieces))
        })?;
        Ok(())
    }
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut announce = None;
        let mut announce_list = None;
        let mut info = None;

        let mut dict = object.try_into_dictionary()?;
        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"announce", value) => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?;
                }
                (b"announce-list", value) => {
                    announce_list = Vec::decode_bencode_object(value)
                        .context("announce-list")
                        .map(Some)?;
                }
                (b"info", value) => {
                    info = Info::decode_bencode_object(value)
                        .context("info")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let announce = announce
            .ok_or_else(|| decoding::Error::missing_field("announce"))?;
        let info =
            info.ok_or_else(|| decoding::Error::missing_field("info"))?;

        Ok(MetaInfo { announce, announce_list, info })
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;
        let mut file_length = None;
        let mut files = None;

        // hash the raw dictionary before consuming it, the canonical
        // re-encoding is exactly these bytes
        let dict = object.try_into_dictionary()?;
        let raw = dict.into_raw()?;
        let info_hash = Info::hash(raw);

        let mut decoder = Decoder::new(raw);
        let mut dict = decoder
            .next_object()?
            .ok_or_else(|| decoding::Error::missing_field("info"))?
            .try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"files", value) => {
                    files = Vec::<File>::decode_bencode_object(value)
                        .context("files")
                        .map(Some)?;
                }
                (b"length", value) => {
                    file_length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value)
                        .context("name")
                        .map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length = u64::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = AsString::decode_bencode_object(value)
                        .context("pieces")
                        .map(|bytes| Some(bytes.0))?;
                }
                _ => {}
            }
        }

        let name =
            name.ok_or_else(|| decoding::Error::missing_field("name"))?;
        let piece_length = piece_length
            .ok_or_else(|| decoding::Error::missing_field("piece length"))?;
        let pieces =
            pieces.ok_or_else(|| decoding::Error::missing_field("pieces"))?;

        Ok(Info { name, piece_length, pieces, file_length, files, info_hash })
    }
}
