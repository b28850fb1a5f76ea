//! The extension protocol (BEP10): the per-connection extension registry
//! and the bencoded extended-handshake payload.
//! <http://www.bittorrent.org/beps/bep_0010.html>

use std::collections::BTreeMap;

use bendy::{
    decoding::{self, FromBencode, Object, ResultExt},
    encoding::{self, SingleItemEncoder, ToBencode},
};
use hashbrown::HashMap;

use crate::error::Error;

/// Client name and version advertised in our extended handshake.
pub const CLIENT_NAME: &str = "corrente 0.1";

/// Symmetric registry of extension name <-> numeric id, local to one
/// connection and populated from the peer's `m` dictionary.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Extensions {
    by_name: HashMap<String, u8>,
}

impl Extensions {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register `name` under `id`. An id of 0 means the peer dropped
    /// support, which removes the mapping. Re-registering a name under a
    /// different id, or an id under a different name, is an error.
    pub fn insert(&mut self, name: &str, id: u8) -> Result<(), Error> {
        if id == 0 {
            self.by_name.remove(name);
            return Ok(());
        }

        if let Some(present) = self.by_name.get(name) {
            if *present != id {
                return Err(Error::ExtensionConflict(format!(
                    "extension '{name}' maps to message ids {present} and {id}"
                )));
            }
        }

        for (key, value) in &self.by_name {
            if *value == id && key != name {
                return Err(Error::ExtensionConflict(format!(
                    "message id {id} maps to extensions '{key}' and '{name}'"
                )));
            }
        }

        self.by_name.insert(name.to_owned(), id);
        Ok(())
    }

    pub fn id_of(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: u8) -> Option<&str> {
        self.by_name
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(k, _)| k.as_str())
    }

    /// The `m` dictionary for an extended handshake.
    pub fn mapping(&self) -> BTreeMap<String, u8> {
        self.by_name
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

/// Payload of the first extended message (ext id 0).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtendedHandshake {
    /// Supported extensions: name -> connection-local message id.
    pub m: BTreeMap<String, u8>,
    /// Client name and version.
    pub v: Option<String>,
    /// BEP9: size of the metainfo `info` dictionary in bytes.
    pub metadata_size: Option<u64>,
}

impl ExtendedHandshake {
    /// The handshake we send: the extension protocol itself plus whatever
    /// the local registry advertises.
    pub fn ours() -> Self {
        Self {
            m: Extensions::empty().mapping(),
            v: Some(CLIENT_NAME.to_owned()),
            metadata_size: None,
        }
    }
}

/// The `m` dictionary, kept generic over extension names.
struct ExtensionMap(BTreeMap<String, u8>);

impl ToBencode for ExtensionMap {
    const MAX_DEPTH: usize = 2;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            for (name, id) in &self.0 {
                e.emit_pair(name.as_bytes(), id)?;
            }
            Ok(())
        })
    }
}

impl FromBencode for ExtensionMap {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;
        let mut map = BTreeMap::new();

        while let Some((key, value)) = dict.next_pair()? {
            let name = String::from_utf8_lossy(key).into_owned();
            let id = u8::decode_bencode_object(value).context("m")?;
            map.insert(name, id);
        }

        Ok(Self(map))
    }
}

impl ToBencode for ExtendedHandshake {
    const MAX_DEPTH: usize = 3;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"m", ExtensionMap(self.m.clone()))?;
            if let Some(metadata_size) = self.metadata_size {
                e.emit_pair(b"metadata_size", metadata_size)?;
            }
            if let Some(v) = &self.v {
                e.emit_pair(b"v", v)?;
            }
            Ok(())
        })
    }
}

impl FromBencode for ExtendedHandshake {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;
        let mut m = BTreeMap::new();
        let mut v = None;
        let mut metadata_size = None;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"m", value) => {
                    m = ExtensionMap::decode_bencode_object(value)
                        .context("m")?
                        .0;
                }
                (b"metadata_size", value) => {
                    metadata_size = u64::decode_bencode_object(value)
                        .context("metadata_size")
                        .map(Some)?;
                }
                (b"v", value) => {
                    v = String::decode_bencode_object(value)
                        .context("v")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        Ok(Self { m, v, metadata_size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_insert_and_lookup() {
        let mut extensions = Extensions::empty();
        extensions.insert("ut_metadata", 3).unwrap();
        extensions.insert("ut_pex", 1).unwrap();

        assert_eq!(extensions.id_of("ut_metadata"), Some(3));
        assert_eq!(extensions.name_of(1), Some("ut_pex"));
        assert_eq!(extensions.id_of("ut_holepunch"), None);
        assert_eq!(extensions.name_of(9), None);

        // re-inserting the same pair is fine
        extensions.insert("ut_pex", 1).unwrap();
    }

    #[test]
    fn id_zero_removes_the_mapping() {
        let mut extensions = Extensions::empty();
        extensions.insert("ut_metadata", 3).unwrap();
        extensions.insert("ut_metadata", 0).unwrap();
        assert_eq!(extensions.id_of("ut_metadata"), None);
    }

    #[test]
    fn conflicts_are_rejected() {
        let mut extensions = Extensions::empty();
        extensions.insert("ut_metadata", 3).unwrap();

        assert!(extensions.insert("ut_metadata", 4).is_err());
        assert!(extensions.insert("ut_pex", 3).is_err());
    }

    #[test]
    fn decode_real_world_handshake() {
        // Transmission's extended handshake, including keys we ignore
        let bytes = b"d1:ei1e1:md11:ut_metadatai3e6:ut_pexi1ee13:metadata_size\
                      i5205e1:pi51413e4:reqqi512e11:upload_onlyi1e1:v17:Trans\
                      mission 2.94e";

        let handshake = ExtendedHandshake::from_bencode(&bytes[..]).unwrap();

        assert_eq!(handshake.m.get("ut_metadata"), Some(&3));
        assert_eq!(handshake.m.get("ut_pex"), Some(&1));
        assert_eq!(handshake.v.as_deref(), Some("Transmission 2.94"));
        assert_eq!(handshake.metadata_size, Some(5205));
    }

    #[test]
    fn handshake_round_trip() {
        let mut m = BTreeMap::new();
        m.insert("ut_metadata".to_owned(), 2);

        let handshake = ExtendedHandshake {
            m,
            v: Some(CLIENT_NAME.to_owned()),
            metadata_size: Some(321),
        };

        let bytes = handshake.to_bencode().unwrap();
        let decoded = ExtendedHandshake::from_bencode(&bytes).unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn ours_advertises_no_optional_extensions() {
        let ours = ExtendedHandshake::ours();
        assert!(ours.m.is_empty());
        assert_eq!(ours.v.as_deref(), Some(CLIENT_NAME));

        // "d1:mdee..." with an empty m dictionary still bencodes cleanly
        let bytes = ours.to_bencode().unwrap();
        assert!(bytes.starts_with(b"d1:mde"));
    }
}
