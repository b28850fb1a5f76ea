//! The engine of one torrent: loads the metainfo, prepares the store,
//! listens for inbound peers, aggregates discovered endpoints and runs a
//! peer session per endpoint.

use std::{
    net::{IpAddr, Ipv4Addr},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use bendy::decoding::FromBencode;
use hashbrown::HashMap;
use rand::Rng;
use tokio::{
    net::{TcpListener, TcpStream},
    select, spawn,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    bitfield::Bitfield,
    config::CONFIG,
    error::Error,
    lsd,
    metainfo::{InfoHash, MetaInfo},
    peer::{PeerId, PeerSession, SessionError},
    piece_table::PieceTable,
    store::{PieceStore, StoreState},
    tracker::{PeerInfo, Tracker},
};

const DISCOVERED_PEERS_QUEUE: usize = 16;
const CONNECTED_PEERS_QUEUE: usize = 16;
const PAUSE_QUEUE: usize = 8;
const LISTEN_RETRIES: usize = 16;

/// Shared, immutable-after-start context of one torrent, handed to every
/// session, tracker and discovery task.
#[derive(Debug)]
pub struct TorrentCtx {
    pub name: String,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub piece_length: u64,
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub trackers: Vec<Url>,
    pub table: Arc<PieceTable>,
    pub store: Arc<PieceStore>,
    /// Payload bytes received from peers, reported to trackers.
    pub downloaded: AtomicU64,
    /// Payload bytes served to peers, reported to trackers.
    pub uploaded: AtomicU64,
}

impl TorrentCtx {
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size in bytes of the given piece; only the last one may be short.
    pub fn piece_size(&self, piece: usize) -> u64 {
        self.piece_length
            .min(self.total_length - piece as u64 * self.piece_length)
    }

    /// Bytes still missing, as reported to trackers.
    pub fn left(&self) -> u64 {
        self.total_length
            .saturating_sub(self.downloaded.load(Ordering::Relaxed))
    }
}

/// Engine-level state, the store's lifecycle plus pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    PreparingFiles,
    CheckingHashes,
    Downloading,
    Ready,
    Paused,
}

impl From<StoreState> for TorrentState {
    fn from(state: StoreState) -> Self {
        match state {
            StoreState::PreparingFiles => Self::PreparingFiles,
            StoreState::CheckingHashes => Self::CheckingHashes,
            StoreState::Downloading => Self::Downloading,
            StoreState::Ready => Self::Ready,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TorrentStatus {
    pub state: TorrentState,
    pub progress: Bitfield,
}

/// One torrent being downloaded and seeded.
pub struct Torrent {
    ctx: Arc<TorrentCtx>,
    paused: AtomicBool,
    pause_tx: mpsc::Sender<bool>,
    pause_rx: StdMutex<Option<mpsc::Receiver<bool>>>,
    token: CancellationToken,
}

impl Torrent {
    /// Load and validate the metainfo; nothing is touched on disk or on
    /// the network yet.
    pub fn new(
        torrent_path: &Path,
        download_dir: &Path,
    ) -> Result<Self, Error> {
        let raw = std::fs::read(torrent_path).map_err(|source| {
            Error::FileIo { path: torrent_path.to_owned(), source }
        })?;

        let meta = MetaInfo::from_bencode(&raw)?;
        meta.validate()?;

        let trackers = meta
            .trackers()
            .iter()
            .map(|url| Url::parse(url))
            .collect::<Result<Vec<_>, _>>()?;

        let table = Arc::new(PieceTable::new(meta.info.piece_count()));
        let store = Arc::new(PieceStore::new(&meta, download_dir));

        let ctx = Arc::new(TorrentCtx {
            name: meta.info.name.clone(),
            info_hash: meta.info.info_hash,
            peer_id: PeerId::gen(),
            piece_length: meta.info.piece_length,
            total_length: meta.info.total_length(),
            piece_hashes: meta.info.piece_hashes(),
            trackers,
            table,
            store,
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
        });

        let (pause_tx, pause_rx) = mpsc::channel(PAUSE_QUEUE);

        Ok(Self {
            ctx,
            paused: AtomicBool::new(false),
            pause_tx,
            pause_rx: StdMutex::new(Some(pause_rx)),
            token: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn ctx(&self) -> &Arc<TorrentCtx> {
        &self.ctx
    }

    /// Prepare the files (blocking until the hash scan finishes), open
    /// the listener, and launch discovery plus the peer aggregator.
    pub async fn start(&self) -> Result<(), Error> {
        info!("starting torrent {}", self.ctx.name);

        self.ctx.store.clone().prepare(self.ctx.table.clone()).await?;

        let Some(pause_rx) = self.pause_rx.lock().unwrap().take() else {
            warn!("torrent {} was already started", self.ctx.name);
            return Ok(());
        };

        let (listener, listen_port) = create_tcp_listener().await?;
        info!("listening for peers on port {listen_port}");

        let (discovered_tx, discovered_rx) =
            mpsc::channel(DISCOVERED_PEERS_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(CONNECTED_PEERS_QUEUE);

        for url in &self.ctx.trackers {
            let tracker = Tracker::new(url.clone(), self.ctx.clone());
            spawn(tracker.listen_for_peers(
                listen_port,
                discovered_tx.clone(),
                self.token.child_token(),
            ));
        }

        {
            let info_hash = self.ctx.info_hash;
            let tx = discovered_tx.clone();
            let token = self.token.child_token();
            spawn(async move {
                let lsd =
                    lsd::start_discovery(info_hash, listen_port, tx, token);
                if let Err(e) = lsd.await {
                    warn!("local service discovery stopped: {e}");
                }
            });
        }

        spawn(accept_connections(
            listener,
            inbound_tx,
            self.token.child_token(),
        ));

        spawn(aggregate_peers(
            self.ctx.clone(),
            discovered_rx,
            inbound_rx,
            pause_rx,
            self.token.clone(),
        ));

        Ok(())
    }

    /// Cancel every task of this torrent and close the store.
    pub fn stop(&self) {
        info!("stopping torrent {}", self.ctx.name);
        self.token.cancel();
        self.ctx.store.finalize();
    }

    /// Pause disconnects every peer; resume reconnects to the known ones.
    pub fn toggle_pause(&self) {
        let paused = !self.paused.load(Ordering::Relaxed);
        self.paused.store(paused, Ordering::Relaxed);
        let _ = self.pause_tx.try_send(paused);
    }

    pub fn status(&self) -> TorrentStatus {
        let store_status = self.ctx.store.status();
        let state = if self.paused.load(Ordering::Relaxed) {
            TorrentState::Paused
        } else {
            store_status.state.into()
        };

        TorrentStatus { state, progress: store_status.progress }
    }
}

/// Bind a listener on a random port of the configured range, retrying a
/// bounded number of times and returning the first one that binds.
async fn create_tcp_listener() -> Result<(TcpListener, u16), Error> {
    for _ in 0..LISTEN_RETRIES {
        let port = rand::thread_rng()
            .gen_range(CONFIG.listen_port_min..=CONFIG.listen_port_max);

        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => {
                debug!("failed to bind listener on port {port}: {e}");
            }
        }
    }

    Err(Error::NoListenPort)
}

async fn accept_connections(
    listener: TcpListener,
    inbound_tx: mpsc::Sender<(PeerInfo, TcpStream)>,
    token: CancellationToken,
) {
    loop {
        let accepted = select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, addr)) => {
                let info = PeerInfo { ip: addr.ip(), port: addr.port() };
                info!("accepted connection from {info}");
                if inbound_tx.send((info, socket)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("failed to accept connection: {e}");
            }
        }
    }
}

/// Deduplicate endpoints by IP and keep one session supervisor per peer.
/// Pause cancels every session; resume respawns them against the known
/// set.
async fn aggregate_peers(
    ctx: Arc<TorrentCtx>,
    mut discovered_rx: mpsc::Receiver<PeerInfo>,
    mut inbound_rx: mpsc::Receiver<(PeerInfo, TcpStream)>,
    mut pause_rx: mpsc::Receiver<bool>,
    token: CancellationToken,
) {
    let mut sessions = token.child_token();
    let mut known: HashMap<IpAddr, PeerInfo> = HashMap::new();

    loop {
        select! {
            _ = token.cancelled() => {
                sessions.cancel();
                return;
            }
            Some(paused) = pause_rx.recv() => {
                if paused {
                    info!("pausing, disconnecting {} peers", known.len());
                    sessions.cancel();
                } else {
                    info!("resuming with {} known peers", known.len());
                    sessions = token.child_token();
                    for info in known.values() {
                        spawn_session(ctx.clone(), *info, None, sessions.clone());
                    }
                }
            }
            Some(info) = discovered_rx.recv() => {
                if !known.contains_key(&info.ip) {
                    known.insert(info.ip, info);
                    spawn_session(ctx.clone(), info, None, sessions.clone());
                }
            }
            Some((info, socket)) = inbound_rx.recv() => {
                if !known.contains_key(&info.ip) {
                    known.insert(info.ip, info);
                    spawn_session(ctx.clone(), info, Some(socket), sessions.clone());
                }
            }
            else => {
                sessions.cancel();
                return;
            }
        }
    }
}

/// Keep one peer connected: reconnect after exchange failures, give up on
/// peers that cannot be reached at all.
fn spawn_session(
    ctx: Arc<TorrentCtx>,
    info: PeerInfo,
    socket: Option<TcpStream>,
    token: CancellationToken,
) {
    spawn(async move {
        let mut socket = socket;

        loop {
            if token.is_cancelled() {
                return;
            }

            let session = PeerSession::new(info, ctx.clone());
            match session.run(socket.take(), token.clone()).await {
                Ok(()) => return,
                Err(SessionError::Connect(e)) => {
                    debug!("could not reach peer {info}: {e}");
                    return;
                }
                Err(SessionError::Exchange(e)) => {
                    warn!("peer {info} failed: {e}, reconnecting");
                }
            }
        }
    });
}
