use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::Framed;
use tracing::Instrument;
use crate::block::{Block, BlockInfo};
use crate::controller::{Claim, ControllerCommand, SwarmCtx};
use crate::store::StoreError;
use crate::Bitfield;
use super::handshake::Handshake;
use super::message::{Message, MessageCodec};
use super::{
    lock_state, PeerCommand, PeerError, PeerHandle, PeerRx, PeerState, Result, SharedPeerState,
    MAX_REQUESTS, MIN_REQUESTS, REQUEST_TIMEOUT,
};

type MessageSink<S> = SplitSink<Framed<S, MessageCodec>, Message>;

/// One duplex peer connection: framing, request pipelining, rate metering
/// and the per-peer protocol state machine. The session is one task
/// selecting over the socket and the controller's command queue; either
/// side failing tears the whole connection down and returns every claimed
/// block to the pool exactly once.
pub struct PeerSession {

    addr: SocketAddr,

    ctx: Arc<SwarmCtx>,

    cmd_rx: PeerRx,

    state: SharedPeerState,

    // Pieces the peer has declared. Stays all-zero for virgin peers.
    bitfield: Bitfield,

    // Blocks we claimed from the controller, requested or about to be.
    want_blocks: Vec<Block>,

    // Blocks the peer asked of us, still to send.
    peer_wants: VecDeque<BlockInfo>,

    // A bitfield is only legal as the very first message.
    received_any: bool,

}

impl PeerSession {

    /// Spawn a session over an already-handshaken stream.
    pub(crate) fn spawn<S>(
        addr: SocketAddr,
        ctx: Arc<SwarmCtx>,
        stream: S,
        handshake: Handshake,
    ) -> PeerHandle
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (peer_tx, cmd_rx) = mpsc::unbounded_channel();
        let state: SharedPeerState = Arc::new(std::sync::Mutex::new(PeerState::default()));
        {
            let mut st = lock_state(&state);
            st.running = true;
            st.peer_id = Some(handshake.peer_id);
            st.connected_at = Some(Instant::now());
        }
        ctx.peer_joined();

        let num_pieces = ctx.package.num_pieces() as usize;
        let mut session = PeerSession {
            addr,
            ctx,
            cmd_rx,
            state: state.clone(),
            bitfield: Bitfield::repeat(false, num_pieces),
            want_blocks: Vec::new(),
            peer_wants: VecDeque::new(),
            received_any: false,
        };

        let join = tokio::spawn(
            async move {
                if let Err(e) = session.run(stream).await {
                    tracing::info!("session ended: {}", e);
                }
                session.disconnect();
            }
            .instrument(tracing::info_span!("peer", %addr)),
        );

        PeerHandle {
            addr,
            peer_tx,
            join,
            state,
            started_at: Instant::now(),
        }
    }

    async fn run<S>(&mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let framed = Framed::new(stream, MessageCodec);
        let (mut sink, mut stream) = framed.split();

        // Lead with what we have; the peer does the same or stays silent.
        self.send(&mut sink, Message::Bitfield(self.ctx.package.bitfield())).await?;

        let mut ticker = time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {

                msg = stream.next() => match msg {
                    Some(Ok(msg)) => {
                        lock_state(&self.state).last_recv = Some(Instant::now());
                        self.handle_msg(&mut sink, msg).await?;
                        // With no rate limits configured the input loop
                        // drives itself; otherwise the controller's
                        // heartbeat hands out budgets.
                        if !self.ctx.rate_limited() {
                            self.dispatch(&mut sink, u64::MAX, u64::MAX).await?;
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    // Zero-byte read: the peer hung up.
                    None => return Err(PeerError::Io(std::io::ErrorKind::UnexpectedEof.into())),
                },

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(PeerCommand::Shutdown) | None => {
                        tracing::debug!("session shutdown");
                        return Ok(());
                    }
                    Some(cmd) => self.handle_cmd(&mut sink, cmd).await?,
                },

                _ = ticker.tick() => {
                    if self.ctx.rate_limited() {
                        self.expire_requests();
                    } else {
                        self.dispatch(&mut sink, u64::MAX, u64::MAX).await?;
                    }
                }
            }
        }
    }

    async fn handle_msg<S>(&mut self, sink: &mut MessageSink<S>, msg: Message) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::trace!("read: {}", msg);
        let first = !self.received_any;
        self.received_any = true;

        match msg {

            Message::KeepAlive => {}

            Message::Bitfield(bf) => {
                if !first {
                    return Err(PeerError::UnexpectedBitfield);
                }
                self.handle_bitfield(sink, bf).await?;
            }

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Choke => {
                let transition = {
                    let mut st = lock_state(&self.state);
                    let t = !st.peer_choking;
                    st.peer_choking = true;
                    t
                };
                if transition {
                    // Whatever was in flight is dead; free it for others.
                    self.release_claims();
                }
            }

            Message::Unchoke => lock_state(&self.state).peer_choking = false,

            Message::Interested => lock_state(&self.state).peer_interested = true,

            Message::NotInterested => lock_state(&self.state).peer_interested = false,

            Message::Request(info) => self.handle_request(info),

            Message::Piece { idx, begin, data } => self.handle_block(idx, begin, data)?,

            Message::Cancel(info) => self.peer_wants.retain(|b| *b != info),

        }

        Ok(())
    }

    async fn handle_bitfield<S>(&mut self, sink: &mut MessageSink<S>, mut bf: Bitfield) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let num_pieces = self.ctx.package.num_pieces() as usize;
        let expected = (num_pieces + 7) / 8 * 8;
        if bf.len() != expected {
            return Err(PeerError::BitfieldSize { got: bf.len(), expected });
        }
        // Drop the padding bits.
        bf.resize(num_pieces, false);
        tracing::debug!("peer has {}/{} pieces", bf.count_ones(), num_pieces);

        self.ctx.peer_has_bitfield(&bf);
        self.bitfield = bf;
        self.update_interest(sink).await
    }

    async fn handle_have<S>(&mut self, sink: &mut MessageSink<S>, idx: u32) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if idx >= self.ctx.package.num_pieces() {
            return Err(PeerError::BadPieceIndex(idx));
        }
        if self.bitfield[idx as usize] {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.ctx.peer_has_piece(idx);
        self.update_interest(sink).await
    }

    /// Interested iff the peer has a piece we lack; a message goes out
    /// only on transition, and losing interest releases every claim.
    async fn update_interest<S>(&mut self, sink: &mut MessageSink<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ours = self.ctx.package.bitfield();
        let interested = self
            .bitfield
            .iter()
            .enumerate()
            .any(|(idx, bit)| *bit && !ours[idx]);

        let transition = {
            let mut st = lock_state(&self.state);
            let t = st.am_interested != interested;
            st.am_interested = interested;
            t
        };
        if !transition {
            return Ok(());
        }

        if interested {
            self.send(sink, Message::Interested).await
        } else {
            self.release_claims();
            self.send(sink, Message::NotInterested).await
        }
    }

    // Bad requests are logged and dropped, not fatal: a slow choke
    // message crossing a request on the wire is normal.
    fn handle_request(&mut self, info: BlockInfo) {
        {
            let st = lock_state(&self.state);
            if st.am_choking {
                tracing::warn!("request whilst we are choking: {}", info);
                return;
            }
            if !st.peer_interested {
                tracing::warn!("request from uninterested peer: {}", info);
                return;
            }
        }
        let have = self
            .ctx
            .package
            .piece(info.piece_idx)
            .map(|p| {
                p.is_complete()
                    && info.len > 0
                    && info.offset as u64 + info.len as u64 <= p.len as u64
            })
            .unwrap_or(false);
        if !have {
            tracing::warn!("request for piece we don't hold: {}", info);
            return;
        }
        if !self.peer_wants.contains(&info) {
            self.peer_wants.push_back(info);
        }
    }

    fn handle_block(&mut self, idx: u32, begin: u32, data: Vec<u8>) -> Result<()> {
        let pos = self.want_blocks.iter().position(|b| {
            b.info.piece_idx == idx && b.info.offset == begin && b.info.len as usize == data.len()
        });
        let Some(pos) = pos else {
            // Routine in end-game, where cancels race the data.
            tracing::debug!(
                "unsolicited or duplicate block: piece {} offset {} len {}",
                idx,
                begin,
                data.len(),
            );
            return Ok(());
        };

        let mut block = self.want_blocks.remove(pos);
        block.add_chunk(&data);
        {
            let mut st = lock_state(&self.state);
            st.download.add(block.info.len as u64);
            st.last_block_recv = Some(Instant::now());
        }

        // A copy that lost the end-game race to another peer.
        let already_complete = self
            .ctx
            .package
            .piece(idx)
            .map(|p| p.is_complete())
            .unwrap_or(false);
        if already_complete {
            tracing::debug!("late duplicate for finished piece dropped: {}", block.info);
            return Ok(());
        }

        match self.ctx.package.add_block(&block) {
            Ok(piece_complete) => {
                self.ctx
                    .controller_tx
                    .send(ControllerCommand::BlockReceived {
                        addr: self.addr,
                        info: block.info,
                        piece_complete,
                    })
                    .ok();
                Ok(())
            }
            // The package finished under us; a late end-game duplicate.
            Err(StoreError::ReadOnly) => {
                tracing::debug!("block after completion dropped: {}", block.info);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_cmd<S>(&mut self, sink: &mut MessageSink<S>, cmd: PeerCommand) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match cmd {

            PeerCommand::Choke(choke) => {
                let transition = {
                    let mut st = lock_state(&self.state);
                    let t = st.am_choking != choke;
                    st.am_choking = choke;
                    t
                };
                if transition {
                    if choke {
                        self.peer_wants.clear();
                        self.send(sink, Message::Choke).await?;
                    } else {
                        self.send(sink, Message::Unchoke).await?;
                    }
                }
            }

            PeerCommand::HavePiece(idx) => {
                // Requests for a piece we just finished are moot.
                let mut cancels = Vec::new();
                self.want_blocks.retain(|b| {
                    if b.info.piece_idx == idx {
                        if b.requested {
                            cancels.push(b.info);
                        }
                        false
                    } else {
                        true
                    }
                });
                for info in cancels {
                    self.send(sink, Message::Cancel(info)).await?;
                }
                self.send(sink, Message::Have { idx }).await?;
            }

            PeerCommand::Cancel(info) => {
                if let Some(pos) = self.want_blocks.iter().position(|b| b.info == info) {
                    let block = self.want_blocks.remove(pos);
                    if block.requested {
                        self.send(sink, Message::Cancel(info)).await?;
                    }
                }
            }

            PeerCommand::KeepAlive => self.send(sink, Message::KeepAlive).await?,

            PeerCommand::Dispatch { dl_budget, ul_budget, reply } => {
                let moved = self.dispatch(sink, dl_budget, ul_budget).await?;
                reply.send(moved).ok();
            }

            // Handled in the run loop.
            PeerCommand::Shutdown => {}

        }

        Ok(())
    }

    /// One dispatch pass: expire stale requests, put requests and blocks
    /// on the wire within the given budgets, then top the claim queue
    /// back up. Returns (bytes requested, bytes sent).
    async fn dispatch<S>(
        &mut self,
        sink: &mut MessageSink<S>,
        dl_budget: u64,
        ul_budget: u64,
    ) -> Result<(u64, u64)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.expire_requests();
        let mut requested = self.send_requests(sink, dl_budget).await?;
        let sent = self.send_blocks(sink, ul_budget).await?;
        self.refill_claims();
        // Fresh claims go out immediately if budget remains.
        requested += self
            .send_requests(sink, dl_budget.saturating_sub(requested))
            .await?;
        Ok((requested, sent))
    }

    fn expire_requests(&mut self) {
        let now = Instant::now();
        let ctx = self.ctx.clone();
        self.want_blocks.retain(|b| {
            let expired = b.requested
                && b.requested_at
                    .map_or(false, |at| now.duration_since(at) >= REQUEST_TIMEOUT);
            if expired {
                tracing::debug!("request timed out: {}", b.info);
                ctx.forget_block(&b.info);
            }
            !expired
        });
    }

    async fn send_requests<S>(&mut self, sink: &mut MessageSink<S>, budget: u64) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        {
            let st = lock_state(&self.state);
            if st.peer_choking || !st.am_interested {
                return Ok(0);
            }
        }

        let now = Instant::now();
        let mut bytes = 0u64;
        let mut outgoing = Vec::new();
        for block in self.want_blocks.iter_mut() {
            if block.requested {
                continue;
            }
            if bytes + block.info.len as u64 > budget {
                break;
            }
            block.mark_requested(now);
            bytes += block.info.len as u64;
            outgoing.push(block.info);
        }
        for info in outgoing {
            self.send(sink, Message::Request(info)).await?;
        }
        Ok(bytes)
    }

    async fn send_blocks<S>(&mut self, sink: &mut MessageSink<S>, budget: u64) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        {
            let st = lock_state(&self.state);
            if st.am_choking || !st.peer_interested {
                return Ok(0);
            }
        }

        let mut bytes = 0u64;
        while let Some(info) = self.peer_wants.front().copied() {
            if bytes + info.len as u64 > budget {
                break;
            }
            self.peer_wants.pop_front();
            match self.ctx.package.read_block(&info) {
                Ok(block) => {
                    self.send(sink, Message::Piece {
                        idx: info.piece_idx,
                        begin: info.offset,
                        data: block.data,
                    })
                    .await?;
                    bytes += info.len as u64;
                    {
                        let mut st = lock_state(&self.state);
                        st.upload.add(info.len as u64);
                        st.last_block_send = Some(Instant::now());
                    }
                    self.ctx.uploaded.fetch_add(info.len as u64, Ordering::Relaxed);
                }
                Err(e) => tracing::warn!("block read failed: {}", e),
            }
        }
        Ok(bytes)
    }

    /// Top the want queue back up from the controller's pool. Only blocks
    /// the peer actually holds are accepted, and never one we already
    /// want.
    fn refill_claims(&mut self) {
        {
            let st = lock_state(&self.state);
            if st.peer_choking || !st.am_interested {
                return;
            }
        }
        if self.want_blocks.len() >= MIN_REQUESTS {
            return;
        }

        let ctx = self.ctx.clone();
        let bitfield = &self.bitfield;
        let want = &mut self.want_blocks;
        ctx.claim_blocks(|info| {
            if want.len() >= MAX_REQUESTS {
                return Claim::Done;
            }
            let peer_has = bitfield
                .get(info.piece_idx as usize)
                .map(|b| *b)
                .unwrap_or(false);
            if !peer_has {
                return Claim::Skip;
            }
            if want.iter().any(|b| b.info == *info) {
                return Claim::Skip;
            }
            want.push(Block::new(*info));
            Claim::Accept
        });
    }

    fn release_claims(&mut self) {
        for block in self.want_blocks.drain(..) {
            self.ctx.forget_block(&block.info);
        }
    }

    async fn send<S>(&self, sink: &mut MessageSink<S>, msg: Message) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::trace!("send: {}", msg);
        sink.send(msg).await?;
        lock_state(&self.state).last_send = Some(Instant::now());
        Ok(())
    }

    fn disconnect(&mut self) {
        self.release_claims();
        lock_state(&self.state).running = false;
        self.ctx.peer_left(&self.bitfield);
        self.ctx
            .controller_tx
            .send(ControllerCommand::PeerClosed { addr: self.addr })
            .ok();
    }
}
