//! A remote peer: connect, handshake, and the exchange loops that
//! download from and upload to it.

pub mod extensions;
pub mod pending;
pub mod requested;

use std::{
    fmt::{self, Display},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use hashbrown::HashSet;
use rand::{distributions::Alphanumeric, Rng};
use sha1::{Digest, Sha1};
use speedy::{Readable, Writable};
use tokio::{
    net::TcpStream,
    select,
    sync::Mutex,
    task::JoinSet,
    time::{interval_at, sleep, timeout, Instant},
};
use tokio_util::{
    codec::{Framed, FramedParts},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, ConcurrentBitfield},
    error::Error,
    peer::{
        extensions::{ExtendedHandshake, Extensions},
        pending::PendingPieces,
        requested::RequestedPieces,
    },
    piece_table::PieceState,
    torrent::TorrentCtx,
    tracker::PeerInfo,
    wire::{
        Block, BlockInfo, Handshake, HandshakeCodec, Message, MessageCodec,
    },
};

use bendy::{decoding::FromBencode, encoding::ToBencode};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);
pub const PIECE_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// How many pieces one session keeps in flight at most.
pub const PENDING_PIECES_QUEUE_LEN: usize = 5;

/// Pacing of the polling loops (choke wait, upload queue, have scan).
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Our peer id, Azureus style: client tag plus random alphanumeric tail.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn gen() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-CO0100-");
        for byte in id[8..].iter_mut() {
            *byte = rand::thread_rng().sample(Alphanumeric);
        }
        PeerId(id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::gen()
    }
}

/// Which lifecycle phase a session died in; the spawner reconnects only
/// after exchange failures.
#[derive(Debug)]
pub enum SessionError {
    /// Dial or handshake failed; the peer is unreachable or not on our
    /// torrent.
    Connect(Error),
    /// The exchange broke down after a successful handshake.
    Exchange(Error),
}

impl Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "connect: {e}"),
            Self::Exchange(e) => write!(f, "exchange: {e}"),
        }
    }
}

type WireSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;
type WireStream = SplitStream<Framed<TcpStream, MessageCodec>>;

/// The socket's write half; every loop writes through this mutex so frames
/// never interleave.
type SharedSink = Arc<Mutex<WireSink>>;

/// State shared between the exchange loops of one session.
#[derive(Debug)]
struct Shared {
    /// Whether the remote peer currently chokes us.
    choked: AtomicBool,
    /// Set when a full scan claimed nothing fresh; cleared on a fresh
    /// claim.
    endgame: AtomicBool,
    /// Pieces the remote peer advertises.
    available: ConcurrentBitfield,
    extensions: StdMutex<Extensions>,
    client_name: StdMutex<Option<String>>,
    pending: PendingPieces,
    requested: RequestedPieces,
    /// Pieces whose Pending state in the piece table this session set
    /// itself. Endgame duplicates are tracked in `pending` but not here:
    /// their table claim belongs to another session and must survive this
    /// one.
    claims: StdMutex<HashSet<usize>>,
}

impl Shared {
    fn new(piece_count: usize) -> Self {
        Self {
            choked: AtomicBool::new(true),
            endgame: AtomicBool::new(false),
            available: ConcurrentBitfield::new(piece_count),
            extensions: StdMutex::new(Extensions::empty()),
            client_name: StdMutex::new(None),
            pending: PendingPieces::new(PIECE_REQUEST_TIMEOUT),
            requested: RequestedPieces::new(),
            claims: StdMutex::new(HashSet::new()),
        }
    }

    fn record_claim(&self, piece: usize) {
        self.claims.lock().unwrap().insert(piece);
    }

    /// Forget the claim on `piece`, returning whether this session owned
    /// it.
    fn release_claim(&self, piece: usize) -> bool {
        self.claims.lock().unwrap().remove(&piece)
    }

    fn owned_claims(&self) -> Vec<usize> {
        self.claims.lock().unwrap().iter().copied().collect()
    }
}

/// One connection to one remote peer.
pub struct PeerSession {
    info: PeerInfo,
    ctx: Arc<TorrentCtx>,
}

impl PeerSession {
    pub fn new(info: PeerInfo, ctx: Arc<TorrentCtx>) -> Self {
        Self { info, ctx }
    }

    /// Drive the session to completion: adopt or dial the socket,
    /// handshake, then run the exchange loops until the first error or
    /// until `token` is cancelled (which returns cleanly).
    pub async fn run(
        &self,
        socket: Option<TcpStream>,
        token: CancellationToken,
    ) -> Result<(), SessionError> {
        let socket = match socket {
            Some(socket) => socket,
            None => timeout(CONNECT_TIMEOUT, TcpStream::connect(self.info.addr()))
                .await
                .map_err(|_| SessionError::Connect(Error::ConnectTimeout))?
                .map_err(|e| SessionError::Connect(e.into()))?,
        };

        let (sink, stream) =
            self.handshake(socket).await.map_err(SessionError::Connect)?;

        info!("handshaked with {}", self.info);

        self.exchange(sink, stream, token)
            .await
            .map_err(SessionError::Exchange)
    }

    /// Exchange handshakes, verify the info hash, switch the connection to
    /// the message codec and send our extended handshake.
    async fn handshake(
        &self,
        socket: TcpStream,
    ) -> Result<(WireSink, WireStream), Error> {
        let mut socket = Framed::new(socket, HandshakeCodec);

        socket
            .send(Handshake::new(self.ctx.info_hash, self.ctx.peer_id))
            .await?;

        let theirs = match socket.next().await {
            Some(Ok(handshake)) => handshake,
            Some(Err(e)) => return Err(e),
            None => return Err(Error::HandshakeInvalid),
        };

        if theirs.info_hash != self.ctx.info_hash {
            return Err(Error::InfoHashMismatch);
        }
        if !theirs.supports_extended() {
            debug!("{} does not support the extension protocol", self.info);
        }

        // switch codecs without discarding buffered bytes
        let parts = socket.into_parts();
        let mut new_parts = FramedParts::new(parts.io, MessageCodec);
        new_parts.read_buf = parts.read_buf;
        new_parts.write_buf = parts.write_buf;
        let (mut sink, stream) = Framed::from_parts(new_parts).split();

        let payload = ExtendedHandshake::ours().to_bencode()?;
        sink.send(Message::Extended(0, payload)).await?;

        Ok((sink, stream))
    }

    /// Run the concurrent exchange activities, first error wins. On the
    /// way out every piece still pending for this session goes back to
    /// NotDownloaded.
    async fn exchange(
        &self,
        sink: WireSink,
        stream: WireStream,
        token: CancellationToken,
    ) -> Result<(), Error> {
        let ctx = self.ctx.clone();
        let shared = Arc::new(Shared::new(ctx.piece_count()));
        let sink: SharedSink = Arc::new(Mutex::new(sink));
        let remote = self.info.addr();

        send_initial_messages(&ctx, &sink).await?;

        let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();
        tasks.spawn(reader(
            ctx.clone(),
            shared.clone(),
            stream,
            token.clone(),
            remote,
        ));
        tasks.spawn(requester(
            ctx.clone(),
            shared.clone(),
            sink.clone(),
            token.clone(),
        ));
        tasks.spawn(uploader(
            ctx.clone(),
            shared.clone(),
            sink.clone(),
            token.clone(),
        ));
        tasks.spawn(broadcast_haves(ctx.clone(), sink.clone(), token.clone()));
        tasks.spawn(cancel_complete_requests(
            ctx.clone(),
            shared.clone(),
            sink.clone(),
            token.clone(),
        ));
        tasks.spawn(keep_alive(sink.clone(), token.clone()));
        tasks.spawn(sweep_stale(ctx.clone(), shared.clone(), token.clone()));

        let result = loop {
            select! {
                _ = token.cancelled() => break Ok(()),
                joined = tasks.join_next() => match joined {
                    Some(Ok(Ok(()))) => continue,
                    Some(Ok(Err(e))) => break Err(e),
                    Some(Err(e)) if e.is_cancelled() => continue,
                    Some(Err(e)) => break Err(Error::TaskFailed(e.to_string())),
                    None => break Ok(()),
                }
            }
        };

        // aborts the remaining tasks, which also drops the socket halves
        tasks.shutdown().await;

        // release only the claims this session made itself; an endgame
        // duplicate still belongs to the session that claimed it first
        for piece in shared.owned_claims() {
            self.ctx.table.cas(
                piece,
                PieceState::Pending,
                PieceState::NotDownloaded,
            );
        }

        result
    }
}

/// Bitfield (when we have pieces), then Interested and Unchoke. We run an
/// unchoke-all policy.
async fn send_initial_messages(
    ctx: &Arc<TorrentCtx>,
    sink: &SharedSink,
) -> Result<(), Error> {
    let present = ctx.table.bitfield();
    if !present.is_empty() {
        send(sink, Message::Bitfield(present.to_bytes())).await?;
    }

    send(sink, Message::Interested).await?;
    send(sink, Message::Unchoke).await?;

    Ok(())
}

async fn send(sink: &SharedSink, msg: Message) -> Result<(), Error> {
    sink.lock().await.send(msg).await
}

/// Sleep for `duration`, returning true when the session was cancelled
/// instead.
async fn idle(duration: Duration, token: &CancellationToken) -> bool {
    select! {
        _ = token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

/// The only reader of the socket: decode and dispatch incoming messages.
async fn reader(
    ctx: Arc<TorrentCtx>,
    shared: Arc<Shared>,
    mut stream: WireStream,
    token: CancellationToken,
    remote: SocketAddr,
) -> Result<(), Error> {
    loop {
        let msg = select! {
            _ = token.cancelled() => return Ok(()),
            msg = stream.next() => match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(e),
                None => return Err(Error::PeerClosedSocket),
            },
        };

        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                debug!("{remote} choked us");
                shared.choked.store(true, Ordering::Relaxed);
            }
            Message::Unchoke => {
                debug!("{remote} unchoked us");
                shared.choked.store(false, Ordering::Relaxed);
            }
            // everyone stays unchoked, nothing to track
            Message::Interested | Message::NotInterested => {}
            Message::Have(piece) => {
                if shared.available.add(piece as usize).is_err() {
                    warn!("{remote} sent Have for out-of-range piece {piece}");
                }
            }
            Message::Bitfield(bytes) => {
                debug!("{remote} sent its bitfield");
                let bitfield =
                    Bitfield::from_bytes(&bytes, ctx.piece_count())?;
                shared.available.replace(bitfield);
            }
            Message::Request(request) => {
                shared.requested.add(request);
            }
            Message::Piece(block) => {
                handle_piece(&ctx, &shared, block, remote).await?;
            }
            Message::Cancel(request) => {
                shared.requested.cancel(&request);
            }
            Message::Extended(0, payload) => {
                let handshake = ExtendedHandshake::from_bencode(&payload)?;

                {
                    let mut extensions = shared.extensions.lock().unwrap();
                    for (name, id) in &handshake.m {
                        extensions.insert(name, *id)?;
                    }
                }

                if let Some(v) = handshake.v {
                    debug!("{remote} runs {v}");
                    *shared.client_name.lock().unwrap() = Some(v);
                }
            }
            Message::Extended(ext_id, _) => {
                match shared.extensions.lock().unwrap().name_of(ext_id) {
                    Some(name) => debug!(
                        "{remote} sent unsupported extension message '{name}'"
                    ),
                    None => warn!(
                        "{remote} sent message with unknown extension id \
                         {ext_id}"
                    ),
                }
            }
        }
    }
}

/// One received block: feed the assembler, and on a complete piece verify
/// the hash, persist, and settle the piece table.
async fn handle_piece(
    ctx: &Arc<TorrentCtx>,
    shared: &Arc<Shared>,
    block: Block,
    remote: SocketAddr,
) -> Result<(), Error> {
    ctx.downloaded
        .fetch_add(block.data.len() as u64, Ordering::Relaxed);

    let done = match shared.pending.insert_data(
        block.index,
        block.begin,
        &block.data,
    ) {
        Ok(done) => done,
        Err(e) => {
            // late blocks of cancelled or timed-out pieces end up here
            debug!("{remote}: dropping block: {e}");
            return Ok(());
        }
    };

    let Some(done) = done else { return Ok(()) };
    debug!("{remote} completed piece {}", done.index);

    let digest: [u8; 20] = Sha1::digest(&done.data).into();
    if digest != ctx.piece_hashes[done.index] {
        warn!("{remote} sent piece {} with an invalid hash", done.index);
        shared.release_claim(done.index);
        ctx.table.cas(
            done.index,
            PieceState::Pending,
            PieceState::NotDownloaded,
        );
        return Ok(());
    }

    let offset = done.index as u64 * ctx.piece_length;
    ctx.store.clone().write_piece(offset, done.data).await?;

    shared.release_claim(done.index);
    if !ctx.table.cas(done.index, PieceState::Pending, PieceState::Downloaded)
        && ctx.table.get(done.index) != PieceState::Downloaded
    {
        // only an endgame duplicate may find the piece already settled
        warn!(
            "piece {} was neither pending nor downloaded after assembly",
            done.index
        );
    }

    Ok(())
}

/// Claim pieces the peer has and request their blocks, entering endgame
/// when a full scan claims nothing fresh.
async fn requester(
    ctx: Arc<TorrentCtx>,
    shared: Arc<Shared>,
    sink: SharedSink,
    token: CancellationToken,
) -> Result<(), Error> {
    loop {
        if shared.choked.load(Ordering::Relaxed) {
            if idle(POLL_INTERVAL, &token).await {
                return Ok(());
            }
            continue;
        }

        let mut claimed_none = true;

        for piece in 0..ctx.piece_count() {
            if token.is_cancelled() {
                return Ok(());
            }
            if !shared.available.contains(piece) {
                continue;
            }

            while shared.pending.len() >= PENDING_PIECES_QUEUE_LEN {
                if idle(POLL_INTERVAL, &token).await {
                    return Ok(());
                }
            }

            let claimed = if ctx.table.cas(
                piece,
                PieceState::NotDownloaded,
                PieceState::Pending,
            ) {
                claimed_none = false;
                shared.record_claim(piece);
                true
            } else {
                // in endgame, pieces pending on other peers are fair game
                shared.endgame.load(Ordering::Relaxed)
                    && ctx.table.get(piece) == PieceState::Pending
                    && !shared.pending.contains(piece)
            };

            if !claimed {
                continue;
            }

            debug!("requesting piece {piece}");
            shared.pending.insert(piece, ctx.piece_size(piece));

            for block in shared.pending.pending_blocks(piece) {
                let request = Message::Request(BlockInfo {
                    index: piece as u32,
                    begin: block.offset,
                    len: block.length,
                });

                if let Err(e) = send(&sink, request).await {
                    shared.pending.remove(piece);
                    return Err(e);
                }
            }
        }

        let endgame = shared.endgame.load(Ordering::Relaxed);
        if !endgame && claimed_none {
            info!("entered endgame mode");
        } else if endgame && !claimed_none {
            info!("exited endgame mode");
        }
        shared.endgame.store(claimed_none, Ordering::Relaxed);

        if idle(POLL_INTERVAL, &token).await {
            return Ok(());
        }
    }
}

/// Serve queued Request messages from the store.
async fn uploader(
    ctx: Arc<TorrentCtx>,
    shared: Arc<Shared>,
    sink: SharedSink,
    token: CancellationToken,
) -> Result<(), Error> {
    loop {
        let Some(request) = shared.requested.pop() else {
            if idle(POLL_INTERVAL, &token).await {
                return Ok(());
            }
            continue;
        };

        let piece = request.index as usize;
        if piece >= ctx.piece_count() {
            return Err(Error::RequestOutOfBounds {
                piece,
                offset: request.begin,
                len: request.len,
            });
        }

        let data = ctx.store.clone().read_piece(piece).await?;

        let begin = request.begin as usize;
        let end = begin + request.len as usize;
        if end > data.len() {
            return Err(Error::RequestOutOfBounds {
                piece,
                offset: request.begin,
                len: request.len,
            });
        }

        let block = Block {
            index: piece,
            begin: request.begin,
            data: data[begin..end].to_vec(),
        };
        send(&sink, Message::Piece(block)).await?;

        ctx.uploaded.fetch_add(request.len as u64, Ordering::Relaxed);
        debug!("served piece {piece} to peer");
    }
}

/// Tell the peer about every piece we finish after the initial bitfield.
async fn broadcast_haves(
    ctx: Arc<TorrentCtx>,
    sink: SharedSink,
    token: CancellationToken,
) -> Result<(), Error> {
    let mut snapshot = ctx.table.bitfield();

    loop {
        if idle(POLL_INTERVAL, &token).await {
            return Ok(());
        }

        let current = ctx.table.bitfield();
        let fresh = current.subtract(&snapshot);
        if fresh.is_empty() {
            continue;
        }
        snapshot = current;

        for piece in 0..fresh.piece_count() {
            if fresh.contains(piece) {
                send(&sink, Message::Have(piece as u32)).await?;
            }
        }
    }
}

/// While in endgame: when another peer wins a piece we still have in
/// flight, drop it and cancel its outstanding blocks.
async fn cancel_complete_requests(
    ctx: Arc<TorrentCtx>,
    shared: Arc<Shared>,
    sink: SharedSink,
    token: CancellationToken,
) -> Result<(), Error> {
    while !shared.endgame.load(Ordering::Relaxed) {
        if idle(POLL_INTERVAL, &token).await {
            return Ok(());
        }
    }

    loop {
        for piece in shared.pending.indexes() {
            if ctx.table.get(piece) != PieceState::Downloaded {
                continue;
            }

            let blocks = shared.pending.pending_blocks(piece);
            shared.pending.remove(piece);
            shared.release_claim(piece);

            debug!(
                "sending {} cancel messages for piece {piece}",
                blocks.len()
            );

            for block in blocks {
                let cancel = Message::Cancel(BlockInfo {
                    index: piece as u32,
                    begin: block.offset,
                    len: block.length,
                });
                send(&sink, cancel).await?;
            }
        }

        if idle(POLL_INTERVAL, &token).await {
            return Ok(());
        }
    }
}

/// A zero-length frame on a fixed cadence so the peer keeps the
/// connection open.
async fn keep_alive(
    sink: SharedSink,
    token: CancellationToken,
) -> Result<(), Error> {
    let mut ticks = interval_at(
        Instant::now() + KEEP_ALIVE_INTERVAL,
        KEEP_ALIVE_INTERVAL,
    );

    loop {
        select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticks.tick() => {
                send(&sink, Message::KeepAlive).await?;
                debug!("sent keep-alive");
            }
        }
    }
}

/// Requests the peer never answered go back to NotDownloaded so another
/// session can pick them up.
async fn sweep_stale(
    ctx: Arc<TorrentCtx>,
    shared: Arc<Shared>,
    token: CancellationToken,
) -> Result<(), Error> {
    let period = PIECE_REQUEST_TIMEOUT / 10;
    let mut ticks = interval_at(Instant::now() + period, period);

    loop {
        select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticks.tick() => {
                for piece in shared.pending.remove_stale() {
                    warn!("piece {piece} timed out, dropping the request");
                    // a stale endgame duplicate leaves the owner's table
                    // claim in place
                    if shared.release_claim(piece) {
                        ctx.table.cas(
                            piece,
                            PieceState::Pending,
                            PieceState::NotDownloaded,
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_tag_and_random_tail() {
        let id = PeerId::gen();
        assert_eq!(&id.0[..8], b"-CO0100-");
        assert!(id.0[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(PeerId::gen(), PeerId::gen());
    }

    #[test]
    fn shared_state_starts_choked_and_empty() {
        let shared = Shared::new(8);
        assert!(shared.choked.load(Ordering::Relaxed));
        assert!(!shared.endgame.load(Ordering::Relaxed));
        assert!(shared.available.is_empty());
        assert!(shared.pending.is_empty());
        assert!(shared.requested.is_empty());
        assert!(shared.owned_claims().is_empty());
    }

    #[test]
    fn claims_track_only_what_this_session_took() {
        let shared = Shared::new(8);
        shared.record_claim(0);
        shared.record_claim(2);

        let mut owned = shared.owned_claims();
        owned.sort_unstable();
        assert_eq!(owned, vec![0, 2]);

        // releasing reports ownership exactly once
        assert!(shared.release_claim(2));
        assert!(!shared.release_claim(2));
        // an endgame duplicate was never recorded, so it is not owned
        assert!(!shared.release_claim(5));

        assert_eq!(shared.owned_claims(), vec![0]);
    }
}
