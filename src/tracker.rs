//! Tracker announce clients.
//!
//! A tracker is a server that hands out peers for a torrent. Both
//! transports are supported: plain HTTP GET announces with a bencoded
//! response, and the BEP15 UDP protocol (connect then announce, with
//! BEP41 URL-data option bytes when the announce URL carries a path or
//! query).

use std::{
    fmt::{self, Display},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use bendy::decoding::{self, FromBencode, Object, ResultExt};
use rand::Rng;
use speedy::{BigEndian, Readable, Writable};
use tokio::{net::UdpSocket, select, sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::{config::CONFIG, error::Error, torrent::TorrentCtx};

/// A tracker must not be asked again sooner than this, whatever interval
/// it returned and whether the announce failed.
pub const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10);

const UDP_READ_TIMEOUT: Duration = Duration::from_secs(20);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const ANNOUNCE_RES_BUF_LEN: usize = 8192;

const CONNECT_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

const URL_DATA_OPTION: u8 = 0x2;
const END_OF_OPTIONS: u8 = 0x0;

/// A peer endpoint discovered by a tracker, LSD, or the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerInfo {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// What an announce produced: the re-announce interval and the peer list.
#[derive(Debug, PartialEq)]
pub struct AnnounceResult {
    pub interval: u32,
    pub peers: Vec<PeerInfo>,
}

/// One announce client bound to one announce URL.
pub struct Tracker {
    url: Url,
    ctx: Arc<TorrentCtx>,
    client: reqwest::Client,
    interval: Duration,
}

impl Tracker {
    pub fn new(url: Url, ctx: Arc<TorrentCtx>) -> Self {
        Self {
            url,
            ctx,
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("HTTP client construction does not fail"),
            interval: Duration::ZERO,
        }
    }

    /// Announce forever, feeding discovered peers into `tx`, until the
    /// token is cancelled. Failures back off to at least
    /// [`MIN_ANNOUNCE_INTERVAL`].
    pub async fn listen_for_peers(
        mut self,
        listen_port: u16,
        tx: mpsc::Sender<PeerInfo>,
        token: CancellationToken,
    ) {
        loop {
            select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let result = match self.announce(listen_port).await {
                Ok(result) => result,
                Err(e) => {
                    warn!("announce to {} failed: {e}", self.url);
                    self.interval = self.interval.max(MIN_ANNOUNCE_INTERVAL);
                    continue;
                }
            };

            debug!("{} returned {} peers", self.url, result.peers.len());
            self.interval = Duration::from_secs(result.interval as u64)
                .max(MIN_ANNOUNCE_INTERVAL);

            for peer in result.peers {
                select! {
                    _ = token.cancelled() => return,
                    _ = tx.send(peer) => {}
                }
            }
        }
    }

    async fn announce(&self, port: u16) -> Result<AnnounceResult, Error> {
        match self.url.scheme() {
            "http" | "https" => self.announce_http(port).await,
            "udp" => self.announce_udp(port).await,
            scheme => Err(Error::TrackerScheme(scheme.to_owned())),
        }
    }

    async fn announce_http(&self, port: u16) -> Result<AnnounceResult, Error> {
        let mut url = self.url.clone();
        if url.scheme() == "https" {
            // announces are queried over plain http
            let _ = url.set_scheme("http");
        }

        let downloaded = self.ctx.downloaded.load(Ordering::Relaxed);
        let uploaded = self.ctx.uploaded.load(Ordering::Relaxed);

        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}\
             &left={}&compact=1",
            urlencoding::encode_binary(&self.ctx.info_hash.0),
            urlencoding::encode_binary(&self.ctx.peer_id.0),
            port,
            uploaded,
            downloaded,
            self.ctx.left(),
        );
        url.set_query(Some(&query));

        let body = self.client.get(url).send().await?.bytes().await?;
        let response = HttpAnnounceResponse::from_bencode(&body)?;
        let peers = parse_compact_peer_list(&response.peers)?;

        Ok(AnnounceResult { interval: response.interval, peers })
    }

    async fn announce_udp(&self, port: u16) -> Result<AnnounceResult, Error> {
        let host = self.url.host_str().ok_or(Error::TrackerNoHost)?;
        let tracker_port = self.url.port().ok_or(Error::TrackerNoHost)?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host, tracker_port)).await?;

        let transaction_id: u32 = rand::thread_rng().gen();

        // step one: obtain a connection id
        let connect = ConnectRequest::new(transaction_id);
        socket
            .send(&connect.write_to_vec_with_ctx(BigEndian {})?)
            .await?;

        let mut buf = [0u8; ConnectResponse::LENGTH];
        let len = timeout(UDP_READ_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::TrackerTimeout)??;
        if len < ConnectResponse::LENGTH {
            return Err(Error::TrackerResponse);
        }

        let response =
            ConnectResponse::read_from_buffer_with_ctx(BigEndian {}, &buf)?;
        response.validate(transaction_id)?;

        // step two: the announce proper
        let request = AnnounceRequest {
            connection_id: response.connection_id,
            action: ACTION_ANNOUNCE,
            transaction_id,
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.peer_id,
            downloaded: self.ctx.downloaded.load(Ordering::Relaxed),
            left: self.ctx.left(),
            uploaded: self.ctx.uploaded.load(Ordering::Relaxed),
            event: 0,
            ip_address: 0,
            key: CONFIG.key,
            num_want: -1,
            port,
        };

        let mut packet = request.write_to_vec_with_ctx(BigEndian {})?;
        packet.extend_from_slice(&encode_url_data(&url_data(&self.url))?);
        socket.send(&packet).await?;

        let mut buf = [0u8; ANNOUNCE_RES_BUF_LEN];
        let len = timeout(UDP_READ_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::TrackerTimeout)??;

        if len < AnnounceResponseHeader::LENGTH
            || (len - AnnounceResponseHeader::LENGTH) % 6 != 0
        {
            return Err(Error::TrackerResponse);
        }

        let header = AnnounceResponseHeader::read_from_buffer_with_ctx(
            BigEndian {},
            &buf[..AnnounceResponseHeader::LENGTH],
        )?;
        header.validate(transaction_id)?;

        let peers = parse_compact_peer_list(
            &buf[AnnounceResponseHeader::LENGTH..len],
        )?;

        Ok(AnnounceResult { interval: header.interval, peers })
    }
}

#[derive(Debug, PartialEq, Readable, Writable)]
struct ConnectRequest {
    protocol_id: u64,
    action: u32,
    transaction_id: u32,
}

impl ConnectRequest {
    fn new(transaction_id: u32) -> Self {
        Self {
            protocol_id: CONNECT_MAGIC,
            action: ACTION_CONNECT,
            transaction_id,
        }
    }
}

#[derive(Debug, PartialEq, Readable, Writable)]
struct ConnectResponse {
    action: u32,
    transaction_id: u32,
    connection_id: u64,
}

impl ConnectResponse {
    const LENGTH: usize = 16;

    fn validate(&self, transaction_id: u32) -> Result<(), Error> {
        if self.action != ACTION_CONNECT
            || self.transaction_id != transaction_id
        {
            return Err(Error::TrackerResponse);
        }
        Ok(())
    }
}

/// The fixed 98-byte BEP15 announce request; URL-data option bytes follow
/// separately.
#[derive(Debug, PartialEq, Readable, Writable)]
struct AnnounceRequest {
    connection_id: u64,
    action: u32,
    transaction_id: u32,
    info_hash: crate::metainfo::InfoHash,
    peer_id: crate::peer::PeerId,
    downloaded: u64,
    left: u64,
    uploaded: u64,
    event: u32,
    ip_address: u32,
    key: u32,
    num_want: i32,
    port: u16,
}

#[derive(Debug, PartialEq, Readable, Writable)]
struct AnnounceResponseHeader {
    action: u32,
    transaction_id: u32,
    interval: u32,
    leechers: u32,
    seeders: u32,
}

impl AnnounceResponseHeader {
    const LENGTH: usize = 20;

    fn validate(&self, transaction_id: u32) -> Result<(), Error> {
        if self.action != ACTION_ANNOUNCE
            || self.transaction_id != transaction_id
        {
            return Err(Error::TrackerResponse);
        }
        Ok(())
    }
}

/// The path-and-query part of the announce URL, as carried by the BEP41
/// URL-data option.
fn url_data(url: &Url) -> String {
    let mut data = url.path().to_owned();
    if let Some(query) = url.query() {
        data.push('?');
        data.push_str(query);
    }
    data
}

/// `0x02 || len || path_and_query || 0x00`, or nothing when there is no
/// path or query.
fn encode_url_data(data: &str) -> Result<Vec<u8>, Error> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.len() > 255 {
        return Err(Error::UrlDataTooLong(data.len()));
    }

    let mut bytes = Vec::with_capacity(data.len() + 3);
    bytes.push(URL_DATA_OPTION);
    bytes.push(data.len() as u8);
    bytes.extend_from_slice(data.as_bytes());
    bytes.push(END_OF_OPTIONS);
    Ok(bytes)
}

/// BEP23 compact peer entries: 4 IPv4 bytes plus a big-endian port each.
fn parse_compact_peer_list(buf: &[u8]) -> Result<Vec<PeerInfo>, Error> {
    let chunks = buf.chunks_exact(6);
    if !chunks.remainder().is_empty() {
        return Err(Error::TrackerResponse);
    }

    Ok(chunks
        .map(|entry| PeerInfo {
            ip: IpAddr::V4(Ipv4Addr::new(
                entry[0], entry[1], entry[2], entry[3],
            )),
            port: u16::from_be_bytes([entry[4], entry[5]]),
        })
        .collect())
}

/// The bencoded body of an HTTP announce response.
#[derive(Debug, Default, PartialEq)]
struct HttpAnnounceResponse {
    interval: u32,
    peers: Vec<u8>,
}

impl FromBencode for HttpAnnounceResponse {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut interval = None;
        let mut peers = None;

        let mut dict = object.try_into_dictionary()?;
        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"interval", value) => {
                    interval = u32::decode_bencode_object(value)
                        .context("interval")
                        .map(Some)?;
                }
                (b"peers", value) => {
                    peers = bendy::encoding::AsString::decode_bencode_object(
                        value,
                    )
                    .context("peers")
                    .map(|bytes| Some(bytes.0))?;
                }
                _ => {}
            }
        }

        Ok(Self {
            interval: interval
                .ok_or_else(|| decoding::Error::missing_field("interval"))?,
            peers: peers
                .ok_or_else(|| decoding::Error::missing_field("peers"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_layout() {
        let request = ConnectRequest::new(0xDEADBEEF);
        let bytes = request.write_to_vec_with_ctx(BigEndian {}).unwrap();

        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..8], 0x41727101980u64.to_be_bytes());
        assert_eq!(&bytes[8..12], [0, 0, 0, 0]);
        assert_eq!(&bytes[12..], 0xDEADBEEFu32.to_be_bytes());
    }

    #[test]
    fn connect_response_transaction_id_must_match() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        raw.extend_from_slice(&0x1234u32.to_be_bytes());
        raw.extend_from_slice(&99u64.to_be_bytes());

        let response =
            ConnectResponse::read_from_buffer_with_ctx(BigEndian {}, &raw)
                .unwrap();
        assert_eq!(response.connection_id, 99);

        response.validate(0x1234).unwrap();
        assert!(response.validate(0x4321).is_err());
    }

    #[test]
    fn announce_request_is_98_bytes() {
        let request = AnnounceRequest {
            connection_id: 7,
            action: ACTION_ANNOUNCE,
            transaction_id: 0xAABBCCDD,
            info_hash: crate::metainfo::InfoHash([1; 20]),
            peer_id: crate::peer::PeerId([2; 20]),
            downloaded: 0,
            left: 1000,
            uploaded: 0,
            event: 0,
            ip_address: 0,
            key: 5,
            num_want: -1,
            port: 6881,
        };

        let bytes = request.write_to_vec_with_ctx(BigEndian {}).unwrap();
        assert_eq!(bytes.len(), 98);
        assert_eq!(&bytes[8..12], [0, 0, 0, 1]); // action: announce
        assert_eq!(&bytes[16..36], [1; 20]);
        assert_eq!(&bytes[36..56], [2; 20]);
        assert_eq!(&bytes[92..96], [0xFF, 0xFF, 0xFF, 0xFF]); // num_want: -1
        assert_eq!(&bytes[96..98], 6881u16.to_be_bytes());
    }

    #[test]
    fn announce_response_transaction_id_must_match() {
        let header = AnnounceResponseHeader {
            action: ACTION_ANNOUNCE,
            transaction_id: 10,
            interval: 1800,
            leechers: 3,
            seeders: 4,
        };

        header.validate(10).unwrap();
        assert!(header.validate(11).is_err());
        assert!(AnnounceResponseHeader { action: 0, ..header }
            .validate(10)
            .is_err());
    }

    #[test]
    fn url_data_bytes() {
        let url = Url::parse("udp://tracker.example:1337/announce").unwrap();
        let encoded = encode_url_data(&url_data(&url)).unwrap();

        let mut expected = vec![URL_DATA_OPTION, 9];
        expected.extend_from_slice(b"/announce");
        expected.push(END_OF_OPTIONS);
        assert_eq!(encoded, expected);
    }

    #[test]
    fn url_data_includes_query() {
        let url =
            Url::parse("udp://tracker.example:1337/announce?key=v").unwrap();
        assert_eq!(url_data(&url), "/announce?key=v");

        let encoded = encode_url_data(&url_data(&url)).unwrap();
        assert_eq!(encoded[1], 15);
        assert_eq!(encoded.last(), Some(&END_OF_OPTIONS));
    }

    #[test]
    fn empty_url_data_emits_no_option() {
        let url = Url::parse("udp://tracker.example:1337").unwrap();
        assert!(encode_url_data(&url_data(&url)).unwrap().is_empty());
    }

    #[test]
    fn oversized_url_data_is_rejected() {
        let data = "a".repeat(256);
        assert!(matches!(
            encode_url_data(&data),
            Err(Error::UrlDataTooLong(256))
        ));
    }

    #[test]
    fn compact_peer_list() {
        let raw = [127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x00, 0x50];
        let peers = parse_compact_peer_list(&raw).unwrap();

        assert_eq!(
            peers,
            vec![
                PeerInfo { ip: "127.0.0.1".parse().unwrap(), port: 6881 },
                PeerInfo { ip: "10.0.0.2".parse().unwrap(), port: 80 },
            ]
        );

        assert!(parse_compact_peer_list(&raw[..5]).is_err());
    }

    #[test]
    fn http_response_decoding() {
        let raw = b"d8:completei5e8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let response = HttpAnnounceResponse::from_bencode(&raw[..]).unwrap();

        assert_eq!(response.interval, 1800);
        let peers = parse_compact_peer_list(&response.peers).unwrap();
        assert_eq!(peers[0].port, 6881);

        // a response without an interval is invalid
        assert!(HttpAnnounceResponse::from_bencode(b"d5:peers0:e").is_err());
    }
}
