use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::Instrument;
use url::Url;
use crate::block::BlockInfo;
use crate::config::Config;
use crate::event::{Event, EventTx};
use crate::metainfo::MetaInfo;
use crate::p2p::handshake::{self, Handshake};
use crate::p2p::session::PeerSession;
use crate::p2p::{lock_state, PeerCommand, PeerHandle, PeerState};
use crate::rate::WINDOW;
use crate::stats::{PeerStats, SwarmStats};
use crate::store::Package;
use crate::tracker::{
    AnnounceParams, AnnounceResponse, Backoff, TrackerConnection, TrackerError, TrackerEvent,
    NUMWANT_STEP,
};
use crate::{Bitfield, ID, BLOCK_SIZE};

// All time-based policy hangs off this tick.
pub const HEARTBEAT: Duration = Duration::from_secs(5);

const POP_RECALC_THRESH: u32 = 20;
const POP_RECALC_LIMIT: Duration = Duration::from_secs(30);

const CALC_FRIENDS_INTERVAL: Duration = Duration::from_secs(10);
const NUM_FRIENDS: usize = 4;

const CALC_OPTUNCHOKES_INTERVAL: Duration = Duration::from_secs(30);
const NUM_OPTUNCHOKES: i32 = 1;
const NEW_OPTUNCHOKE_PROB: f64 = 0.5;

const ANTISNUB_INTERVAL: Duration = Duration::from_secs(60);
const ANTISNUB_RATE: f64 = 1024.0;

const MAX_PEERS: usize = 15;
const ADD_PEER_TRIES: usize = 3;
const DIAL_JITTER_MAX_MS: u64 = 10_000;

const SILENT_DEATH_INTERVAL: Duration = Duration::from_secs(240);
const BOREDOM_DEATH_INTERVAL: Duration = Duration::from_secs(120);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

const ENDGAME_PIECES: u32 = 5;
const FUSEKI_PIECES: u32 = 2;

pub(crate) type ControllerTx = mpsc::UnboundedSender<ControllerCommand>;
pub(crate) type ControllerRx = mpsc::UnboundedReceiver<ControllerCommand>;

/// Commands into the controller task from sessions, dial tasks, tracker
/// tasks and the server.
pub(crate) enum ControllerCommand {

    /// A handshaken socket, dialed by us or accepted by the listener.
    PeerStream {
        addr: SocketAddr,
        stream: TcpStream,
        handshake: Handshake,
        inbound: bool,
    },

    /// A session persisted a block.
    BlockReceived {
        addr: SocketAddr,
        info: BlockInfo,
        piece_complete: bool,
    },

    /// A session ended; its claims are already back in the pool.
    PeerClosed { addr: SocketAddr },

    /// An announce task finished.
    TrackerDone {
        tracker: Box<TrackerConnection>,
        result: Result<AnnounceResponse, TrackerError>,
    },

    /// Host asked for a swarm snapshot.
    Stats { reply: oneshot::Sender<SwarmStats> },

    Shutdown,

}

/// Verdict a claimant returns for each offered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    Accept,
    Skip,
    Done,
}

/// Piece-ordering state: popularity counts, fixed jitter tie-breakers and
/// the cached order, plus the three policy mode flags.
#[derive(Debug)]
pub(crate) struct Picker {

    // Piece indices in ascending score order.
    order: Vec<u32>,

    // How many connected peers hold each piece.
    popularity: Vec<u32>,

    // Uniform [0,1) tie-breakers, fixed at startup.
    jitter: Vec<f64>,

    changes: u32,

    last_recalc: Instant,

    num_peers: usize,

    pub endgame: bool,

    pub fuseki: bool,

    pub antisnub: bool,

}

impl Picker {

    pub(crate) fn new(num_pieces: u32) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            order: (0..num_pieces).collect(),
            popularity: vec![0; num_pieces as usize],
            jitter: (0..num_pieces).map(|_| rng.gen::<f64>()).collect(),
            // Force a recalc on first use.
            changes: POP_RECALC_THRESH,
            last_recalc: Instant::now(),
            num_peers: 0,
            endgame: false,
            fuseki: true,
            antisnub: false,
        }
    }

    pub(crate) fn piece_gained(&mut self, idx: u32) {
        if let Some(p) = self.popularity.get_mut(idx as usize) {
            *p += 1;
            self.changes += 1;
        }
    }

    pub(crate) fn peer_joined(&mut self) {
        self.num_peers += 1;
    }

    pub(crate) fn bitfield_gained(&mut self, bf: &Bitfield) {
        for (idx, bit) in bf.iter().enumerate() {
            if *bit {
                if let Some(p) = self.popularity.get_mut(idx) {
                    *p += 1;
                    self.changes += 1;
                }
            }
        }
    }

    // A departing peer takes its declared pieces out of the counts.
    pub(crate) fn peer_left(&mut self, bf: &Bitfield) {
        for (idx, bit) in bf.iter().enumerate() {
            if *bit {
                if let Some(p) = self.popularity.get_mut(idx) {
                    *p = p.saturating_sub(1);
                    self.changes += 1;
                }
            }
        }
        self.num_peers = self.num_peers.saturating_sub(1);
    }

    fn should_recalc(&self, now: Instant) -> bool {
        self.changes >= POP_RECALC_THRESH
            || (now.duration_since(self.last_recalc) >= POP_RECALC_LIMIT
                && (self.changes > 0 || self.fuseki))
    }

    fn recalc(&mut self, package: &Package, now: Instant) {
        let mut order: Vec<u32> = (0..package.num_pieces()).collect();
        let scores: Vec<f64> = order.iter().map(|&idx| self.score(package, idx)).collect();
        order.sort_by(|&a, &b| {
            scores[a as usize]
                .partial_cmp(&scores[b as usize])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.order = order;
        self.changes = 0;
        self.last_recalc = now;
        tracing::trace!("piece order recalculated");
    }

    // Started pieces come first (the more of them claimed, the sooner),
    // complete pieces effectively last; otherwise rarest-first, except in
    // fuseki where mid-popularity pieces win.
    fn score(&self, package: &Package, idx: u32) -> f64 {
        let jitter = self.jitter[idx as usize];
        let piece = match package.piece(idx) {
            Ok(p) => p,
            Err(_) => return f64::MAX,
        };
        if piece.is_complete() {
            return jitter + package.num_pieces() as f64;
        }
        if piece.is_started() {
            return jitter - 1.0 + piece.unclaimed_bytes() as f64 / piece.len as f64;
        }
        let popularity = self.popularity[idx as usize] as f64;
        if self.fuseki {
            jitter + (popularity - self.num_peers as f64 / 2.0).abs()
        } else {
            jitter + popularity
        }
    }
}

/// State shared between the controller task and its peer sessions: the
/// package, the picker, configuration and the event channel back into the
/// controller. This is the narrow surface sessions see; no session owns
/// the controller.
pub(crate) struct SwarmCtx {

    pub package: Arc<Package>,

    pub picker: Mutex<Picker>,

    pub config: Config,

    pub info_hash: ID,

    pub client_id: ID,

    pub controller_tx: ControllerTx,

    pub downloaded: AtomicU64,

    pub uploaded: AtomicU64,

}

impl SwarmCtx {

    pub(crate) fn picker(&self) -> MutexGuard<'_, Picker> {
        self.picker.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn rate_limited(&self) -> bool {
        self.config.download_limit.is_some() || self.config.upload_limit.is_some()
    }

    /// Walk claimable blocks in policy order, marking accepted ones
    /// claimed. End-game offers every empty block even when claimed
    /// elsewhere; fuseki stops after the first acceptance to force
    /// round-robin across peers.
    pub(crate) fn claim_blocks(&self, mut f: impl FnMut(&BlockInfo) -> Claim) {
        let now = Instant::now();
        let mut picker = self.picker();
        if picker.should_recalc(now) {
            picker.recalc(&self.package, now);
        }
        let endgame = picker.endgame;
        let fuseki = picker.fuseki;

        for &idx in &picker.order {
            let piece = match self.package.piece(idx) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if piece.is_complete() {
                continue;
            }
            let candidates = if endgame {
                piece.empty_blocks(BLOCK_SIZE)
            } else {
                piece.unclaimed_blocks(BLOCK_SIZE)
            };
            for info in candidates {
                match f(&info) {
                    Claim::Accept => {
                        if let Err(e) = piece.claim_block(&info) {
                            tracing::error!("claim failed: {}", e);
                        }
                        if fuseki {
                            return;
                        }
                    }
                    Claim::Skip => {}
                    Claim::Done => return,
                }
            }
        }
    }

    /// Return a claimed block to the pool.
    pub(crate) fn forget_block(&self, info: &BlockInfo) {
        if let Err(e) = self.package.unclaim_block(info) {
            tracing::error!("unclaim failed: {}", e);
        }
    }

    pub(crate) fn peer_has_piece(&self, idx: u32) {
        self.picker().piece_gained(idx);
    }

    pub(crate) fn peer_joined(&self) {
        self.picker().peer_joined();
    }

    pub(crate) fn peer_has_bitfield(&self, bf: &Bitfield) {
        self.picker().bitfield_gained(bf);
    }

    pub(crate) fn peer_left(&self, bf: &Bitfield) {
        self.picker().peer_left(bf);
    }
}

/// Handle for a spawned controller.
pub struct ControllerHandle {

    pub info_hash: ID,

    tx: ControllerTx,

    join: JoinHandle<()>,

}

impl ControllerHandle {

    pub fn shutdown(&self) {
        self.tx.send(ControllerCommand::Shutdown).ok();
    }

    pub async fn join(self) {
        self.join.await.ok();
    }

    /// Swarm snapshot, or `None` once the controller is gone.
    pub async fn stats(&self) -> Option<SwarmStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ControllerCommand::Stats { reply }).ok()?;
        rx.await.ok()
    }

    pub(crate) fn tx(&self) -> ControllerTx {
        self.tx.clone()
    }
}

/// The cross-peer policy engine for exactly one package.
pub struct Controller {

    ctx: Arc<SwarmCtx>,

    rx: ControllerRx,

    peers: HashMap<SocketAddr, PeerHandle>,

    // Addresses currently holding an optimistic unchoke; exempt from the
    // periodic choke ranking until the next optimistic pass.
    optimistic: HashSet<SocketAddr>,

    // At most one active tracker, drawn from the shuffled tiers.
    tracker: Option<TrackerConnection>,

    tracker_urls: Vec<Url>,

    next_tracker: usize,

    backoff: Backoff,

    retry_at: Option<Instant>,

    announce_inflight: bool,

    sent_completed: bool,

    running: bool,

    listen_port: u16,

    event_tx: EventTx,

    last_friends_calc: Instant,

    last_optunchokes_calc: Instant,

}

impl Controller {

    pub fn new(
        metainfo: &MetaInfo,
        package: Arc<Package>,
        config: Config,
        client_id: ID,
        listen_port: u16,
        event_tx: EventTx,
    ) -> Controller {

        let (tx, rx) = mpsc::unbounded_channel();
        let tracker_urls: Vec<Url> = metainfo.trackers().into_iter().flatten().collect();
        let num_pieces = package.num_pieces();
        let info_hash = metainfo.info_hash();

        let ctx = Arc::new(SwarmCtx {
            package,
            picker: Mutex::new(Picker::new(num_pieces)),
            config,
            info_hash,
            client_id,
            controller_tx: tx.clone(),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
        });

        let now = Instant::now();
        Controller {
            ctx,
            rx,
            peers: HashMap::new(),
            optimistic: HashSet::new(),
            tracker: None,
            tracker_urls,
            next_tracker: 0,
            backoff: Backoff::new(),
            retry_at: None,
            announce_inflight: false,
            sent_completed: false,
            running: false,
            listen_port,
            event_tx,
            last_friends_calc: now,
            last_optunchokes_calc: now,
        }
    }

    /// Spawn the heartbeat/event loop; the returned handle shuts it down.
    pub fn spawn(mut self) -> ControllerHandle {
        let info_hash = self.ctx.info_hash;
        let tx = self.ctx.controller_tx.clone();
        let join = tokio::spawn(
            async move { self.run().await }
                .instrument(tracing::info_span!("controller", hash = %hex::encode(info_hash))),
        );
        ControllerHandle { info_hash, tx, join }
    }

    pub(crate) fn ctx(&self) -> Arc<SwarmCtx> {
        self.ctx.clone()
    }

    pub async fn run(&mut self) {
        tracing::info!("controller starting");
        self.running = true;
        let mut heartbeat = time::interval(HEARTBEAT);
        heartbeat.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        while self.running {
            tokio::select! {
                _ = heartbeat.tick() => self.heartbeat().await,
                Some(cmd) = self.rx.recv() => match cmd {
                    ControllerCommand::PeerStream { addr, stream, handshake, inbound } => {
                        self.add_peer_stream(addr, stream, handshake, inbound);
                    }
                    ControllerCommand::BlockReceived { addr, info, piece_complete } => {
                        self.handle_block_received(addr, info, piece_complete);
                    }
                    ControllerCommand::PeerClosed { addr } => self.handle_peer_closed(addr),
                    ControllerCommand::TrackerDone { tracker, result } => {
                        self.handle_tracker_done(*tracker, result);
                    }
                    ControllerCommand::Stats { reply } => {
                        reply.send(self.collect_stats()).ok();
                    }
                    ControllerCommand::Shutdown => {
                        self.shutdown().await;
                    }
                },
            }
        }
        tracing::info!("controller stopped");
    }

    async fn heartbeat(&mut self) {
        let now = Instant::now();

        self.reap_peers(now);
        self.update_modes();

        {
            let mut picker = self.ctx.picker();
            if picker.should_recalc(now) {
                picker.recalc(&self.ctx.package, now);
            }
        }

        if now.duration_since(self.last_friends_calc) >= CALC_FRIENDS_INTERVAL {
            self.last_friends_calc = now;
            self.calc_friends(now);
        }
        if now.duration_since(self.last_optunchokes_calc) >= CALC_OPTUNCHOKES_INTERVAL {
            self.last_optunchokes_calc = now;
            self.calc_optunchokes(now);
        }

        self.send_keepalives(now);
        self.maintain_tracker(now);

        for _ in 0..ADD_PEER_TRIES {
            if !self.add_a_peer() {
                break;
            }
        }

        self.apportion_bandwidth().await;
    }

    // ---- peers ----

    /// Insert-then-start happens atomically within the controller task, so
    /// the reaper can never see a not-yet-started session.
    fn add_peer_stream(
        &mut self,
        addr: SocketAddr,
        stream: TcpStream,
        handshake: Handshake,
        inbound: bool,
    ) {
        if self.peers.contains_key(&addr) {
            tracing::debug!(%addr, "duplicate connection dropped");
            return;
        }
        if self.peers.len() >= MAX_PEERS {
            if !(inbound && self.evict_one()) {
                tracing::info!(%addr, "at capacity, rejecting peer");
                return;
            }
        }

        let handle = PeerSession::spawn(addr, self.ctx.clone(), stream, handshake);
        self.peers.insert(addr, handle);
        self.event(Event::PeerConnected(addr));
    }

    /// To admit an incoming peer at capacity, evict the oldest peer that
    /// is dead, else the oldest that has delivered nothing lately. A dead
    /// session frees the slot at zero cost, so it goes first.
    fn evict_one(&mut self) -> bool {
        let now = Instant::now();
        let mut dead: Option<(SocketAddr, Instant)> = None;
        let mut bored: Option<(SocketAddr, Instant)> = None;

        for (addr, peer) in &self.peers {
            let state = lock_state(&peer.state);
            if !state.running {
                if dead.map_or(true, |(_, at)| peer.started_at < at) {
                    dead = Some((*addr, peer.started_at));
                }
            } else {
                let last = state.last_block_recv.unwrap_or(peer.started_at);
                if now.duration_since(last) >= BOREDOM_DEATH_INTERVAL
                    && bored.map_or(true, |(_, at)| peer.started_at < at)
                {
                    bored = Some((*addr, peer.started_at));
                }
            }
        }

        let victim = dead.or(bored).map(|(addr, _)| addr);
        match victim {
            Some(addr) => {
                tracing::info!(%addr, "evicting peer for an incoming connection");
                self.remove_peer(addr);
                true
            }
            None => false,
        }
    }

    fn remove_peer(&mut self, addr: SocketAddr) {
        if let Some(peer) = self.peers.remove(&addr) {
            peer.shutdown();
            self.optimistic.remove(&addr);
            self.event(Event::PeerDisconnected(addr));
        }
    }

    fn handle_peer_closed(&mut self, addr: SocketAddr) {
        if self.peers.remove(&addr).is_some() {
            self.optimistic.remove(&addr);
            self.event(Event::PeerDisconnected(addr));
            tracing::debug!(%addr, "peer closed");
        }
    }

    fn reap_peers(&mut self, now: Instant) {
        let mut victims = Vec::new();
        for (addr, peer) in &self.peers {
            let state = lock_state(&peer.state);
            if !state.running {
                victims.push(*addr);
                continue;
            }
            let last_send = state.last_send.unwrap_or(peer.started_at);
            if now.duration_since(last_send) >= SILENT_DEATH_INTERVAL {
                tracing::info!(%addr, "silent death");
                victims.push(*addr);
            }
        }
        for addr in victims {
            self.remove_peer(addr);
        }
    }

    fn send_keepalives(&self, now: Instant) {
        for peer in self.peers.values() {
            let state = lock_state(&peer.state);
            let last_send = state.last_send.unwrap_or(peer.started_at);
            if state.running && now.duration_since(last_send) >= KEEPALIVE_INTERVAL {
                peer.peer_tx.send(PeerCommand::KeepAlive).ok();
            }
        }
    }

    fn num_friends(&self) -> usize {
        self.peers
            .values()
            .filter(|p| {
                let state = lock_state(&p.state);
                state.running && !state.am_choking
            })
            .count()
    }

    fn aggregate_rates(&self) -> (f64, f64) {
        let mut down = 0.0;
        let mut up = 0.0;
        for peer in self.peers.values() {
            let mut state = lock_state(&peer.state);
            down += state.download.rate();
            up += state.upload.rate();
        }
        (down, up)
    }

    // ---- modes ----

    fn update_modes(&mut self) {
        let complete = self.ctx.package.num_complete();
        let total = self.ctx.package.num_pieces();
        let (down, _) = self.aggregate_rates();
        let (fuseki, antisnub, endgame) = modes_for(complete, total, down);

        let mut picker = self.ctx.picker();
        if picker.fuseki != fuseki || picker.antisnub != antisnub || picker.endgame != endgame {
            tracing::debug!(fuseki, antisnub, endgame, "mode change");
        }
        picker.fuseki = fuseki;
        picker.antisnub = antisnub;
        picker.endgame = endgame;
    }

    // ---- choking ----

    /// Rank running, non-snubbing, interested peers by what they give us
    /// (or take, when seeding) and unchoke the best few. Optimistic
    /// unchokes keep their slot.
    fn calc_friends(&mut self, now: Instant) {
        let seeding = self.ctx.package.is_complete();

        let mut ranked: Vec<(SocketAddr, f64)> = Vec::new();
        for (addr, peer) in &self.peers {
            let mut state = lock_state(&peer.state);
            if !state.running {
                continue;
            }
            if !state.peer_interested || is_snubbing(&mut state, now) {
                continue;
            }
            let rate = if seeding {
                state.upload.rate()
            } else {
                state.download.rate()
            };
            ranked.push((*addr, rate));
        }
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let friends: HashSet<SocketAddr> =
            ranked.iter().take(NUM_FRIENDS).map(|(a, _)| *a).collect();

        for (addr, peer) in &self.peers {
            if friends.contains(addr) {
                peer.peer_tx.send(PeerCommand::Choke(false)).ok();
            } else if !self.optimistic.contains(addr) {
                peer.peer_tx.send(PeerCommand::Choke(true)).ok();
            }
        }
    }

    /// Hand out optimistic unchokes, youngest peer first, each candidate
    /// winning a slot on a coin flip. Antisnub opens an extra slot per
    /// snubbing unchoked peer, bounded by the friend count.
    fn calc_optunchokes(&mut self, now: Instant) {
        let antisnub = self.ctx.picker().antisnub;

        let snubbers = self
            .peers
            .values()
            .filter(|p| {
                let mut state = lock_state(&p.state);
                state.running
                    && !state.am_choking
                    && state.peer_interested
                    && is_snubbing(&mut state, now)
            })
            .count();
        let mut slots = optunchoke_slots(antisnub, snubbers);

        self.optimistic.clear();

        let mut by_age: Vec<(&SocketAddr, &PeerHandle)> = self.peers.iter().collect();
        by_age.sort_by_key(|(_, p)| std::cmp::Reverse(p.started_at));

        let mut rng = rand::thread_rng();
        for (addr, peer) in by_age {
            if slots <= 0 {
                break;
            }
            {
                let mut state = lock_state(&peer.state);
                if !state.running || !state.peer_interested || is_snubbing(&mut state, now) {
                    continue;
                }
            }
            if rng.gen_bool(NEW_OPTUNCHOKE_PROB) {
                peer.peer_tx.send(PeerCommand::Choke(false)).ok();
                self.optimistic.insert(*addr);
                slots -= 1;
            }
        }
    }

    // ---- bandwidth ----

    /// Spend the window budgets across peers in random order, subtracting
    /// what each actually moved. Without limits, sessions drive
    /// themselves from their input loops.
    async fn apportion_bandwidth(&mut self) {
        if !self.ctx.rate_limited() {
            return;
        }
        let (down, up) = self.aggregate_rates();
        let mut dl_budget = window_budget(self.ctx.config.download_limit, down);
        let mut ul_budget = window_budget(self.ctx.config.upload_limit, up);

        let mut order: Vec<SocketAddr> = self.peers.keys().copied().collect();
        order.shuffle(&mut rand::thread_rng());

        for addr in order {
            if dl_budget == 0 || ul_budget == 0 {
                break;
            }
            let Some(peer) = self.peers.get(&addr) else { continue };
            let (reply_tx, reply_rx) = oneshot::channel();
            if peer
                .peer_tx
                .send(PeerCommand::Dispatch {
                    dl_budget,
                    ul_budget,
                    reply: reply_tx,
                })
                .is_err()
            {
                continue;
            }
            match time::timeout(Duration::from_secs(1), reply_rx).await {
                Ok(Ok((requested, sent))) => {
                    dl_budget = dl_budget.saturating_sub(requested);
                    ul_budget = ul_budget.saturating_sub(sent);
                }
                _ => tracing::debug!(%addr, "dispatch reply lost"),
            }
        }
    }

    // ---- blocks and pieces ----

    fn handle_block_received(&mut self, addr: SocketAddr, info: BlockInfo, piece_complete: bool) {
        self.ctx
            .downloaded
            .fetch_add(info.len as u64, Ordering::Relaxed);

        // In end-game the same block is in flight on several peers; the
        // redundant copies get cancelled the moment one lands.
        if self.ctx.picker().endgame {
            for (peer_addr, peer) in &self.peers {
                if *peer_addr != addr {
                    peer.peer_tx.send(PeerCommand::Cancel(info)).ok();
                }
            }
        }

        if !piece_complete {
            return;
        }
        // End-game duplicates can report the same completion twice; only
        // the first copy validates and announces. A discarded piece shows
        // up here as incomplete again.
        let fresh = self
            .ctx
            .package
            .piece(info.piece_idx)
            .map(|p| p.is_complete() && p.cached_valid() != Some(true))
            .unwrap_or(false);
        if !fresh {
            return;
        }
        match self.ctx.package.validate_piece(info.piece_idx) {
            Ok(true) => {
                tracing::info!(piece = info.piece_idx, "piece complete");
                for peer in self.peers.values() {
                    peer.peer_tx.send(PeerCommand::HavePiece(info.piece_idx)).ok();
                }
                self.event(Event::PieceComplete(info.piece_idx));
                if self.ctx.package.is_complete() {
                    self.handle_package_complete();
                }
            }
            Ok(false) => {
                tracing::warn!(piece = info.piece_idx, "piece failed validation, discarding");
                if let Err(e) = self.ctx.package.discard_piece(info.piece_idx) {
                    tracing::error!("discard failed: {}", e);
                }
                self.event(Event::PieceDiscarded(info.piece_idx));
            }
            Err(e) => tracing::error!("piece validation failed: {}", e),
        }
    }

    fn handle_package_complete(&mut self) {
        tracing::info!("package complete");
        self.event(Event::Complete);
        if let Err(e) = self.ctx.package.reopen_read_only() {
            tracing::error!("read-only reopen failed: {}", e);
        }
        if !self.sent_completed && self.tracker.is_some() && !self.announce_inflight {
            self.sent_completed = true;
            self.start_announce(Some(TrackerEvent::Completed));
        }
    }

    // ---- tracker ----

    fn next_tracker_connection(&mut self, numwant: u32) -> Option<TrackerConnection> {
        if self.tracker_urls.is_empty() {
            return None;
        }
        let url = self.tracker_urls[self.next_tracker % self.tracker_urls.len()].clone();
        self.next_tracker += 1;
        Some(TrackerConnection::new(url, numwant))
    }

    fn maintain_tracker(&mut self, now: Instant) {
        if self.announce_inflight {
            return;
        }

        let retry_due = self.retry_at.map_or(true, |at| now >= at);
        if self.tracker.is_none() && retry_due {
            let numwant = self.ctx.config.numwant;
            self.tracker = self.next_tracker_connection(numwant);
        }

        let (fresh, refresh) = match &mut self.tracker {
            Some(tracker) if tracker.last_announce.is_none() => (retry_due, false),
            Some(tracker) => {
                let mut force = false;
                if tracker.exhausted() && tracker.numwant as usize <= tracker.peers.len() {
                    tracker.numwant += NUMWANT_STEP;
                    tracing::debug!(numwant = tracker.numwant, "peer list exhausted, widening ask");
                    force = true;
                }
                (false, force || tracker.due_for_refresh(now))
            }
            None => (false, false),
        };

        if fresh {
            // Fresh connection; open with the started event.
            self.start_announce(Some(TrackerEvent::Started));
        } else if refresh {
            self.start_announce(None);
        }
    }

    /// Announces run in short-lived tasks so the heartbeat never blocks
    /// on HTTP; the connection comes back with the result.
    fn start_announce(&mut self, event: Option<TrackerEvent>) {
        let Some(mut tracker) = self.tracker.take() else { return };
        let params = self.announce_params(&tracker, event);
        let tx = self.ctx.controller_tx.clone();
        self.announce_inflight = true;

        let span = tracing::info_span!("tracker", url = %tracker.url);
        tokio::spawn(
            async move {
                let result = tracker.announce(&params).await;
                tx.send(ControllerCommand::TrackerDone {
                    tracker: Box::new(tracker),
                    result,
                })
                .ok();
            }
            .instrument(span),
        );
    }

    fn announce_params(&self, tracker: &TrackerConnection, event: Option<TrackerEvent>) -> AnnounceParams {
        AnnounceParams {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            port: self.listen_port,
            uploaded: self.ctx.uploaded.load(Ordering::Relaxed),
            downloaded: self.ctx.downloaded.load(Ordering::Relaxed),
            left: self.ctx.package.bytes_left(),
            event,
            numwant: tracker.numwant,
            ip: None,
        }
    }

    fn handle_tracker_done(
        &mut self,
        tracker: TrackerConnection,
        result: Result<AnnounceResponse, TrackerError>,
    ) {
        self.announce_inflight = false;
        let url = tracker.url.to_string();
        match result {
            Ok(_) => {
                self.backoff.reset();
                self.retry_at = None;
                self.tracker = Some(tracker);
                self.event(Event::TrackerOk(url));
            }
            Err(e) => {
                tracing::warn!(url = %url, "tracker lost: {}", e);
                self.tracker = None;
                let delay = self.backoff.next();
                self.retry_at = Some(Instant::now() + delay);
                self.event(Event::TrackerLost(url));
            }
        }
    }

    // ---- peer acquisition ----

    fn add_a_peer(&mut self) -> bool {
        if self.peers.len() >= MAX_PEERS
            || self.ctx.package.is_complete()
            || self.num_friends() >= NUM_FRIENDS
        {
            return false;
        }
        if let Some(limit) = self.ctx.config.download_limit {
            let (down, _) = self.aggregate_rates();
            if down >= limit as f64 * 0.75 {
                return false;
            }
        }
        let listen_port = self.listen_port;
        let connected: HashSet<SocketAddr> = self.peers.keys().copied().collect();

        let mut chosen = None;
        {
            let Some(tracker) = &mut self.tracker else { return false };
            let mut candidates = tracker.peers.clone();
            candidates.shuffle(&mut rand::thread_rng());

            for addr in candidates {
                if tracker.tried.contains(&addr) || connected.contains(&addr) {
                    continue;
                }
                if addr.port() == listen_port
                    && (addr.ip().is_loopback() || addr.ip().is_unspecified())
                {
                    // Probably our own listener.
                    tracker.mark_tried(addr);
                    continue;
                }
                // Tried regardless of how the dial goes.
                tracker.mark_tried(addr);
                chosen = Some(addr);
                break;
            }
        }

        match chosen {
            Some(addr) => {
                self.dial(addr);
                true
            }
            None => false,
        }
    }

    /// Dial with a small jitter so announce bursts don't stampede.
    fn dial(&self, addr: SocketAddr) {
        let ctx = self.ctx.clone();
        let span = tracing::info_span!("dial", %addr);
        tokio::spawn(
            async move {
                let jitter = rand::thread_rng().gen_range(0..DIAL_JITTER_MAX_MS);
                time::sleep(Duration::from_millis(jitter)).await;

                match TcpStream::connect(addr).await {
                    Ok(mut stream) => {
                        match handshake::handshake_outgoing(&mut stream, ctx.info_hash, ctx.client_id)
                            .await
                        {
                            Ok(handshake) => {
                                ctx.controller_tx
                                    .send(ControllerCommand::PeerStream {
                                        addr,
                                        stream,
                                        handshake,
                                        inbound: false,
                                    })
                                    .ok();
                            }
                            Err(e) => tracing::debug!("handshake failed: {}", e),
                        }
                    }
                    Err(e) => tracing::debug!("dial failed: {}", e),
                }
            }
            .instrument(span),
        );
    }

    // ---- shutdown ----

    async fn shutdown(&mut self) {
        tracing::info!("controller shutting down");
        self.running = false;

        // Stopped announce, best-effort with a short bound.
        if let Some(mut tracker) = self.tracker.take() {
            if tracker.last_announce.is_some() {
                let params = self.announce_params(&tracker, Some(TrackerEvent::Stopped));
                let _ = time::timeout(Duration::from_millis(200), tracker.announce(&params)).await;
            }
        }

        for peer in self.peers.values() {
            peer.shutdown();
        }
        for (_, peer) in self.peers.drain() {
            let _ = time::timeout(Duration::from_secs(1), peer.join).await;
        }
    }

    fn event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    fn collect_stats(&self) -> SwarmStats {
        let (download_rate, upload_rate) = self.aggregate_rates();
        let peers = self
            .peers
            .iter()
            .map(|(addr, peer)| {
                let mut state = lock_state(&peer.state);
                PeerStats {
                    addr: *addr,
                    peer_id: state.peer_id,
                    am_choking: state.am_choking,
                    am_interested: state.am_interested,
                    peer_choking: state.peer_choking,
                    peer_interested: state.peer_interested,
                    download_rate: state.download.rate(),
                    upload_rate: state.upload.rate(),
                }
            })
            .collect();

        SwarmStats {
            num_peers: self.peers.len(),
            num_pieces: self.ctx.package.num_pieces(),
            num_complete_pieces: self.ctx.package.num_complete(),
            bytes_left: self.ctx.package.bytes_left(),
            total_downloaded: self.ctx.downloaded.load(Ordering::Relaxed),
            total_uploaded: self.ctx.uploaded.load(Ordering::Relaxed),
            download_rate,
            upload_rate,
            endgame: self.ctx.picker().endgame,
            peers,
        }
    }
}

/// A peer is snubbing us when we want its blocks but nothing has arrived
/// for a whole timeout window.
fn is_snubbing(state: &mut PeerState, now: Instant) -> bool {
    if !state.am_interested {
        return false;
    }
    let last = state
        .last_block_recv
        .or(state.connected_at)
        .unwrap_or(now);
    now.duration_since(last) >= ANTISNUB_INTERVAL
}

/// Mode flags (fuseki, antisnub, endgame) for the given progress.
fn modes_for(complete: u32, total: u32, download_rate: f64) -> (bool, bool, bool) {
    let incomplete = complete < total;
    (
        incomplete && complete < FUSEKI_PIECES,
        incomplete && download_rate < ANTISNUB_RATE,
        incomplete && total - complete <= ENDGAME_PIECES,
    )
}

/// Optimistic unchoke slots: one, plus (in antisnub) one per snubbing
/// unchoked peer, never more than the friend count extra.
fn optunchoke_slots(antisnub: bool, snubbers: usize) -> i32 {
    let mut slots = NUM_OPTUNCHOKES;
    if antisnub {
        let adjustment = (-(snubbers as i32)).max(-(NUM_FRIENDS as i32));
        slots -= adjustment;
    }
    slots
}

/// Budget for one heartbeat of transfer: `limit × (window + heartbeat) −
/// current × window`, clamped at zero.
fn window_budget(limit: Option<u64>, current_rate: f64) -> u64 {
    match limit {
        Some(limit) => {
            let budget = limit as f64 * (WINDOW + HEARTBEAT).as_secs_f64()
                - current_rate * WINDOW.as_secs_f64();
            budget.max(0.0) as u64
        }
        None => u64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{piece_hashes, single_file_torrent};
    use super::*;

    fn test_package(num_pieces: u32, piece_len: u32) -> (Arc<Package>, tempfile::TempDir) {
        let data: Vec<u8> = (0..num_pieces as usize * piece_len as usize)
            .map(|i| (i % 241) as u8)
            .collect();
        let hashes = piece_hashes(&data, piece_len);
        let raw = single_file_torrent("t.bin", data.len() as u64, piece_len, &hashes);
        let mi = MetaInfo::from_bytes(&raw).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let package = Package::bind(&mi, &dir.path().join("t.bin"), true).unwrap();
        (Arc::new(package), dir)
    }

    fn quiet_picker(num_pieces: u32) -> Picker {
        let mut picker = Picker::new(num_pieces);
        picker.fuseki = false;
        // Zero jitter makes ordering deterministic for assertions.
        picker.jitter = vec![0.0; num_pieces as usize];
        picker
    }

    #[test]
    fn rarest_pieces_order_first() {
        // Fewer holders, lower score.
        let (package, _dir) = test_package(4, 32);
        let mut picker = quiet_picker(4);
        picker.popularity = vec![3, 1, 2, 5];
        picker.recalc(&package, Instant::now());
        assert_eq!(picker.order, vec![1, 2, 0, 3]);
    }

    #[test]
    fn started_pieces_order_before_rare_ones() {
        let (package, _dir) = test_package(3, 32);
        package
            .claim_block(&BlockInfo { piece_idx: 2, offset: 0, len: 16 })
            .unwrap();

        let mut picker = quiet_picker(3);
        picker.popularity = vec![1, 2, 9];
        picker.recalc(&package, Instant::now());
        // Piece 2 is started, so it outranks even the rarest fresh piece.
        assert_eq!(picker.order[0], 2);
    }

    #[test]
    fn complete_pieces_order_last() {
        let (package, _dir) = test_package(2, 32);
        let data: Vec<u8> = (0..32).map(|i| (i % 241) as u8).collect();
        package
            .add_block(&crate::block::Block::with_data(
                BlockInfo { piece_idx: 0, offset: 0, len: 32 },
                data,
            ))
            .unwrap();

        let mut picker = quiet_picker(2);
        picker.popularity = vec![0, 1];
        picker.recalc(&package, Instant::now());
        assert_eq!(picker.order, vec![1, 0]);
    }

    #[test]
    fn fuseki_prefers_median_popularity() {
        let (package, _dir) = test_package(3, 32);
        let mut picker = quiet_picker(3);
        picker.fuseki = true;
        picker.num_peers = 4;
        // Popularity 2 is the median of 4 peers; 0 and 4 sit at the edges.
        picker.popularity = vec![0, 2, 4];
        picker.recalc(&package, Instant::now());
        assert_eq!(picker.order[0], 1);
    }

    fn test_ctx(num_pieces: u32, piece_len: u32) -> (Arc<SwarmCtx>, ControllerRx, tempfile::TempDir) {
        let (package, dir) = test_package(num_pieces, piece_len);
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(SwarmCtx {
            picker: Mutex::new(quiet_picker(num_pieces)),
            package,
            config: Config::default(),
            info_hash: [1; 20],
            client_id: [2; 20],
            controller_tx: tx,
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
        });
        (ctx, rx, dir)
    }

    #[test]
    fn claim_blocks_marks_accepted_claims() {
        let (ctx, _rx, _dir) = test_ctx(4, 64);
        let mut claimed = Vec::new();
        ctx.claim_blocks(|info| {
            if claimed.len() < 3 {
                claimed.push(*info);
                Claim::Accept
            } else {
                Claim::Done
            }
        });
        assert_eq!(claimed.len(), 3);

        // The accepted blocks are no longer offered.
        let mut second = Vec::new();
        ctx.claim_blocks(|info| {
            second.push(*info);
            Claim::Skip
        });
        for info in &claimed {
            assert!(!second.contains(info), "{} offered twice", info);
        }

        // Forgetting one puts it back in the pool.
        ctx.forget_block(&claimed[0]);
        let mut third = Vec::new();
        ctx.claim_blocks(|info| {
            third.push(*info);
            Claim::Skip
        });
        assert!(third.contains(&claimed[0]));
    }

    #[test]
    fn fuseki_claims_stop_after_first_accept() {
        let (ctx, _rx, _dir) = test_ctx(4, 64);
        ctx.picker().fuseki = true;
        let mut offered = 0;
        ctx.claim_blocks(|_| {
            offered += 1;
            Claim::Accept
        });
        assert_eq!(offered, 1);
    }

    #[test]
    fn endgame_reoffers_claimed_blocks() {
        let (ctx, _rx, _dir) = test_ctx(1, 64);
        let mut first = Vec::new();
        ctx.claim_blocks(|info| {
            first.push(*info);
            Claim::Accept
        });
        assert!(!first.is_empty());

        // Claimed everywhere, but end-game hands them out again.
        ctx.picker().endgame = true;
        let mut second = Vec::new();
        ctx.claim_blocks(|info| {
            second.push(*info);
            Claim::Skip
        });
        assert_eq!(first, second);
    }

    #[test]
    fn mode_thresholds() {
        // Fuseki until two pieces, endgame within five of the end,
        // antisnub under 1 KiB/s, everything off when complete.
        assert_eq!(modes_for(0, 100, 0.0), (true, true, false));
        assert_eq!(modes_for(1, 100, 2048.0), (true, false, false));
        assert_eq!(modes_for(2, 100, 500.0), (false, true, false));
        assert_eq!(modes_for(95, 100, 2048.0), (false, false, true));
        assert_eq!(modes_for(96, 100, 0.0), (false, true, true));
        assert_eq!(modes_for(100, 100, 0.0), (false, false, false));
    }

    #[test]
    fn optimistic_slot_math() {
        assert_eq!(optunchoke_slots(false, 0), 1);
        assert_eq!(optunchoke_slots(false, 7), 1);
        assert_eq!(optunchoke_slots(true, 0), 1);
        assert_eq!(optunchoke_slots(true, 2), 3);
        // Bounded by the friend count.
        assert_eq!(optunchoke_slots(true, 9), 1 + NUM_FRIENDS as i32);
    }

    #[test]
    fn budget_formula_clamps_at_zero() {
        // limit × (window + heartbeat) − current × window.
        assert_eq!(window_budget(Some(1000), 0.0), 25_000);
        assert_eq!(window_budget(Some(1000), 1000.0), 5_000);
        assert_eq!(window_budget(Some(1000), 10_000.0), 0);
        assert_eq!(window_budget(None, 123.0), u64::MAX);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_file_download_from_seed() {
        // One seed, one leecher, three pieces of 16384; the leecher
        // ends bit-identical to the source. Completion waits on the
        // seed's periodic choke pass, so this runs for a few heartbeats.
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let piece_len = 16_384u32;
        let data: Vec<u8> = (0..3 * piece_len as usize)
            .map(|i| (i * 31 % 251) as u8)
            .collect();
        let hashes = piece_hashes(&data, piece_len);
        let raw = single_file_torrent("transfer.bin", data.len() as u64, piece_len, &hashes);
        let mi = MetaInfo::from_bytes(&raw).unwrap();
        let info_hash = mi.info_hash();

        let seed_dir = tempfile::tempdir().unwrap();
        let seed_path = seed_dir.path().join("transfer.bin");
        std::fs::write(&seed_path, &data).unwrap();
        let seed_package = Arc::new(Package::bind(&mi, &seed_path, true).unwrap());
        assert!(seed_package.is_complete());
        assert_eq!(seed_package.bitfield().as_raw_slice(), &[0b1110_0000]);

        let leech_dir = tempfile::tempdir().unwrap();
        let leech_path = leech_dir.path().join("transfer.bin");
        let leech_package = Arc::new(Package::bind(&mi, &leech_path, true).unwrap());

        let seed_id = [3u8; 20];
        let leech_id = [4u8; 20];
        let (seed_events_tx, _seed_events) = mpsc::unbounded_channel();
        let (leech_events_tx, mut leech_events) = mpsc::unbounded_channel();

        let seed_handle = Controller::new(
            &mi,
            seed_package,
            Config::default(),
            seed_id,
            6999,
            seed_events_tx,
        )
        .spawn();
        let leech_handle = Controller::new(
            &mi,
            leech_package.clone(),
            Config::default(),
            leech_id,
            6998,
            leech_events_tx,
        )
        .spawn();

        // Wire the two controllers together over localhost.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seed_listen_addr = listener.local_addr().unwrap();
        let dialer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(seed_listen_addr).await.unwrap();
            let hs = handshake::handshake_outgoing(&mut stream, info_hash, leech_id)
                .await
                .unwrap();
            (stream, hs)
        });
        let (mut seed_stream, leech_addr) = listener.accept().await.unwrap();
        let seed_hs = handshake::handshake_incoming(&mut seed_stream, seed_id, |h| *h == info_hash)
            .await
            .unwrap();
        let (leech_stream, leech_hs) = dialer.await.unwrap();

        seed_handle
            .tx()
            .send(ControllerCommand::PeerStream {
                addr: leech_addr,
                stream: seed_stream,
                handshake: seed_hs,
                inbound: true,
            })
            .unwrap();
        leech_handle
            .tx()
            .send(ControllerCommand::PeerStream {
                addr: seed_listen_addr,
                stream: leech_stream,
                handshake: leech_hs,
                inbound: false,
            })
            .unwrap();

        let wait = async {
            let mut pieces_done = 0;
            loop {
                match leech_events.recv().await {
                    Some(Event::PieceComplete(_)) => pieces_done += 1,
                    Some(Event::Complete) => break pieces_done,
                    Some(_) => {}
                    None => panic!("event channel closed early"),
                }
            }
        };
        let pieces_done = time::timeout(Duration::from_secs(60), wait)
            .await
            .expect("download did not complete");

        assert_eq!(pieces_done, 3);
        assert!(leech_package.is_complete());
        assert_eq!(std::fs::read(&leech_path).unwrap(), data);

        leech_handle.shutdown();
        seed_handle.shutdown();
    }
}
