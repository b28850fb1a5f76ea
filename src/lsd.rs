//! Local Service Discovery (BEP14).
//!
//! Peers on the same link announce the torrents they serve with a
//! `BT-SEARCH` datagram on a well-known multicast group, and learn about
//! each other by listening on the same group. A per-process cookie filters
//! out our own announcements.

use std::net::{Ipv4Addr, SocketAddrV4};

use rand::Rng;
use tokio::{net::UdpSocket, select, sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{error::Error, metainfo::InfoHash, tracker::PeerInfo};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 152, 143);
const MULTICAST_PORT: u16 = 6771;

const ANNOUNCE_INTERVAL: std::time::Duration =
    std::time::Duration::from_secs(5);
const READ_BUFFER_SIZE: usize = 2048;

const HOST_HEADER: &str = "Host: ";
const PORT_HEADER: &str = "Port: ";
const INFOHASH_HEADER: &str = "Infohash: ";
const COOKIE_HEADER: &str = "cookie: ";

fn multicast_addr() -> SocketAddrV4 {
    SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT)
}

/// Announce `info_hash` on the local link and emit every peer that
/// announces it back, until cancelled.
pub async fn start_discovery(
    info_hash: InfoHash,
    listen_port: u16,
    tx: mpsc::Sender<PeerInfo>,
    token: CancellationToken,
) -> Result<(), Error> {
    let cookie = format!("{:x}", rand::thread_rng().gen::<u64>());

    let listener =
        UdpSocket::bind((Ipv4Addr::UNSPECIFIED, MULTICAST_PORT)).await?;
    listener.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;

    let announcer = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    announcer.connect(multicast_addr()).await?;

    let message = BtSearch {
        host: multicast_addr().to_string(),
        port: listen_port,
        info_hashes: vec![info_hash],
        cookie: cookie.clone(),
    }
    .format();

    select! {
        _ = token.cancelled() => Ok(()),
        result = announce_loop(announcer, message) => result,
        result = listen_loop(listener, info_hash, cookie, tx) => result,
    }
}

async fn announce_loop(
    socket: UdpSocket,
    message: String,
) -> Result<(), Error> {
    loop {
        sleep(ANNOUNCE_INTERVAL).await;
        socket.send(message.as_bytes()).await?;
        debug!("sent lsd announce");
    }
}

async fn listen_loop(
    socket: UdpSocket,
    info_hash: InfoHash,
    cookie: String,
    tx: mpsc::Sender<PeerInfo>,
) -> Result<(), Error> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let (len, source) = socket.recv_from(&mut buf).await?;

        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
            continue;
        };
        let message = match BtSearch::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("malformed bt-search message from {source}: {e}");
                continue;
            }
        };

        // our own announcement reflected back
        if message.cookie == cookie {
            continue;
        }
        if !message.info_hashes.contains(&info_hash) {
            continue;
        }

        let peer = PeerInfo { ip: source.ip(), port: message.port };
        debug!("discovered {peer} via lsd");

        if tx.send(peer).await.is_err() {
            return Ok(());
        }
    }
}

/// A `BT-SEARCH * HTTP/1.1` announcement.
#[derive(Debug, PartialEq)]
struct BtSearch {
    host: String,
    port: u16,
    info_hashes: Vec<InfoHash>,
    cookie: String,
}

impl BtSearch {
    fn format(&self) -> String {
        let mut message = String::from("BT-SEARCH * HTTP/1.1\r\n");
        message.push_str(&format!("{HOST_HEADER}{}\r\n", self.host));
        message.push_str(&format!("{PORT_HEADER}{}\r\n", self.port));
        for info_hash in &self.info_hashes {
            message.push_str(&format!("{INFOHASH_HEADER}{info_hash}\r\n"));
        }
        message.push_str(&format!("{COOKIE_HEADER}{}\r\n", self.cookie));
        message.push_str("\r\n\r\n");
        message
    }

    fn parse(text: &str) -> Result<Self, Error> {
        let mut host = String::new();
        let mut port = None;
        let mut info_hashes = Vec::new();
        let mut cookie = String::new();

        let malformed = |what: &str| Error::LsdMessage(what.to_owned());

        for line in text.split("\r\n") {
            if let Some(value) = line.strip_prefix(PORT_HEADER) {
                port = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| malformed("invalid port"))?,
                );
            } else if let Some(value) = line.strip_prefix(COOKIE_HEADER) {
                cookie = value.to_owned();
            } else if let Some(value) = line.strip_prefix(INFOHASH_HEADER) {
                let hash = decode_hex_20(value)
                    .ok_or_else(|| malformed("invalid infohash"))?;
                info_hashes.push(InfoHash(hash));
            } else if let Some(value) = line.strip_prefix(HOST_HEADER) {
                host = value.to_owned();
            }
        }

        let port = port.ok_or_else(|| malformed("missing port"))?;

        Ok(Self { host, port, info_hashes, cookie })
    }
}

fn decode_hex_20(value: &str) -> Option<[u8; 20]> {
    let bytes = value.as_bytes();
    if bytes.len() != 40 {
        return None;
    }

    let mut out = [0u8; 20];
    for (i, chunk) in bytes.chunks_exact(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)? as u8;
        let lo = (chunk[1] as char).to_digit(16)? as u8;
        out[i] = (hi << 4) | lo;
    }
    Some(out)
}
