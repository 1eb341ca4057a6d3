//! The per-thread RPC endpoint.
//!
//! An `Rpc` owns a transport instance, a session table, a buffer pool, the
//! unexpected-packet window, and the event loop that drives all of them. A
//! given endpoint belongs to exactly one thread; every callback runs inline
//! on that thread. Interior mutability is `RefCell`/`Cell` so that public
//! methods take `&self` and stay re-entrant from callbacks; no engine
//! method invokes the event loop recursively.

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::{HashMap, VecDeque};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::buffer::{self, BufferPool, MsgBuffer, MsgBufferDesc};
use crate::config::{MAX_PKTS_PER_MSG, RpcConfig, UNEXP_PKT_WINDOW};
use crate::error::{Error, Result};
use crate::nexus::{BgResp, BgWork, Nexus, Ops};
use crate::packet::{PKT_HDR_SIZE, PktHdr, PktType};
use crate::session::{SSlotState, Session, SessionRole, SessionState};
use crate::sm::{SmEndpoint, SmErrType, SmEventType, SmPkt, SmPktType};
use crate::spsc;
use crate::timing::{self, TimerEntry, TimingWheel};
use crate::transport::{RoutingInfo, RxView, SendCompletion, Transport, TxPkt};

/// Session management callback: `(session_num, event, error, context)`.
pub type SmHandler = fn(i32, SmEventType, SmErrType, &mut dyn Any);

/// Packet drop and bookkeeping counters. Protocol violations drop the
/// packet and bump a counter; the session is never torn down for them.
#[derive(Debug, Default, Clone, Copy)]
pub struct PktStats {
    pub bad_magic: u64,
    pub bad_pkt_type: u64,
    pub bad_pkt_num: u64,
    pub bad_msg_size: u64,
    pub unknown_session: u64,
    pub not_connected: u64,
    pub stale: u64,
    pub window_full: u64,
    pub unknown_req_type: u64,
    pub retransmits: u64,
}

/// Response staging handed to request handlers. The handler either fills
/// the preallocated single-packet buffer (fast path) or attaches a
/// dynamically allocated buffer.
pub struct AppResp {
    prealloc: Option<MsgBuffer>,
    dyn_resp: Option<MsgBuffer>,
    /// True once the handler committed to the preallocated buffer.
    pub prealloc_used: bool,
    max_data_per_pkt: usize,
}

pub(crate) struct TakenResp {
    pub resp: Option<MsgBuffer>,
    pub is_prealloc: bool,
    pub leftover_prealloc: Option<MsgBuffer>,
    pub leftover_dyn: Option<MsgBuffer>,
}

impl AppResp {
    pub(crate) fn foreground(prealloc: Option<MsgBuffer>, max_data_per_pkt: usize) -> Self {
        Self {
            prealloc,
            dyn_resp: None,
            prealloc_used: false,
            max_data_per_pkt,
        }
    }

    /// Background handlers get no preallocated buffer; they must allocate
    /// dynamically.
    pub(crate) fn background(max_data_per_pkt: usize) -> Self {
        Self::foreground(None, max_data_per_pkt)
    }

    /// Claim the preallocated buffer for a response of `data_size` bytes.
    /// Returns `None` if no preallocated buffer exists or the response
    /// does not fit in a single packet.
    pub fn prealloc_mut(&mut self, data_size: usize) -> Option<&mut MsgBuffer> {
        if data_size > self.max_data_per_pkt {
            return None;
        }
        let buf = self.prealloc.as_mut()?;
        if data_size > buf.max_data_size() {
            return None;
        }
        buf.resize(data_size, 1);
        self.prealloc_used = true;
        Some(buf)
    }

    /// Attach a dynamically allocated response buffer of `data_size`
    /// bytes and return it for filling.
    pub fn alloc_dyn(&mut self, data_size: usize) -> Result<&mut MsgBuffer> {
        let mb = buffer::alloc_standalone(data_size, self.max_data_per_pkt)?;
        self.prealloc_used = false;
        self.dyn_resp = Some(mb);
        Ok(self.dyn_resp.as_mut().unwrap())
    }

    pub(crate) fn take_response(self) -> TakenResp {
        if self.prealloc_used {
            TakenResp {
                resp: self.prealloc,
                is_prealloc: true,
                leftover_prealloc: None,
                leftover_dyn: self.dyn_resp,
            }
        } else if self.dyn_resp.is_some() {
            TakenResp {
                resp: self.dyn_resp,
                is_prealloc: false,
                leftover_prealloc: self.prealloc,
                leftover_dyn: None,
            }
        } else {
            TakenResp {
                resp: None,
                is_prealloc: false,
                leftover_prealloc: self.prealloc,
                leftover_dyn: None,
            }
        }
    }
}

// Completion token kinds. Application-owned request packets need no action
// on completion; retained responses are freed on slot reuse; control
// packets own a scratch buffer freed on completion.
const TOKEN_KIND_APP: u64 = 0;
const TOKEN_KIND_RESP: u64 = 1;
const TOKEN_KIND_CTRL: u64 = 2;
const TOKEN_KIND_SHIFT: u64 = 56;

#[inline]
fn token_kind(token: u64) -> u64 {
    token >> TOKEN_KIND_SHIFT
}

/// A staged outbound packet awaiting transport acceptance.
struct PendingPkt<R> {
    route: R,
    session_num: u16,
    hdr: *const u8,
    payload: *const u8,
    payload_len: usize,
    token: u64,
}

/// An in-progress multi-packet reassembly in the unexpected window.
struct Reassembly {
    buf: MsgBuffer,
    rcvd: Vec<bool>,
    rcvd_cnt: u16,
}

enum ReqBuf {
    /// Aliases a packet in the transport receive ring; valid only within
    /// the current event-loop iteration.
    Borrowed { hdr: *mut u8, data_len: usize },
    /// Fully reassembled, engine-owned buffer.
    Owned(MsgBuffer),
}

enum RxAction {
    DispatchReq {
        session_num: u16,
        slot_idx: usize,
        req_num: u64,
        req_type: u8,
        req: ReqBuf,
    },
    RespDone {
        req_type: u8,
        req_desc: MsgBufferDesc,
        resp: ReqBuf,
    },
}

type SmEvent = (i32, SmEventType, SmErrType);

/// Per-thread RPC endpoint bound to a transport instance.
pub struct Rpc<T: Transport> {
    nexus: Arc<Nexus>,
    context: RefCell<Box<dyn Any>>,
    sm_handler: SmHandler,
    app_tid: u32,
    phy_port: u8,
    config: RpcConfig,
    hostname: String,
    max_data_per_pkt: usize,

    transport: RefCell<T>,
    sm_sock: UdpSocket,
    sm_rx: RefCell<spsc::Consumer<SmPkt>>,
    bg_resp_tx: crossbeam_channel::Sender<BgResp>,
    bg_resp_rx: crossbeam_channel::Receiver<BgResp>,

    sessions: RefCell<Vec<Option<Session<T::Route>>>>,
    pool: RefCell<BufferPool>,
    window: RefCell<HashMap<(u16, u64), Reassembly>>,
    pending_tx: RefCell<VecDeque<PendingPkt<T::Route>>>,
    wheel: RefCell<TimingWheel>,
    ctrl_bufs: RefCell<HashMap<u64, (usize, usize)>>,
    ctrl_next_id: Cell<u64>,

    ops: HashMap<u8, Ops>,
    stats: RefCell<PktStats>,
    /// Fault injection: force client-side routing resolution to fail.
    fault_fail_resolve_routing: Cell<bool>,
}

impl<T: Transport> Rpc<T> {
    /// Create an endpoint on `nexus` with identifier `app_tid`, bound to a
    /// fresh transport instance on `phy_port`.
    pub fn new(
        nexus: &Arc<Nexus>,
        context: Box<dyn Any>,
        app_tid: u32,
        sm_handler: SmHandler,
        phy_port: u8,
        numa_node: usize,
    ) -> Result<Self> {
        Self::new_with_config(
            nexus,
            context,
            app_tid,
            sm_handler,
            phy_port,
            numa_node,
            RpcConfig::default(),
        )
    }

    /// Create an endpoint with an explicit configuration.
    pub fn new_with_config(
        nexus: &Arc<Nexus>,
        context: Box<dyn Any>,
        app_tid: u32,
        sm_handler: SmHandler,
        phy_port: u8,
        numa_node: usize,
        config: RpcConfig,
    ) -> Result<Self> {
        let transport = T::open(phy_port, numa_node, &config)?;
        let max_data_per_pkt = transport.max_data_per_pkt();

        let sm_rx = nexus.register_hook(app_tid)?;
        let ops = nexus.ops_snapshot();

        let sm_sock = match UdpSocket::bind(("0.0.0.0", 0)) {
            Ok(sock) => sock,
            Err(e) => {
                nexus.unregister_hook(app_tid);
                return Err(Error::Io(e));
            }
        };

        let wheel = TimingWheel::default_for_rpc(timing::current_time_us());

        let (bg_resp_tx, bg_resp_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            nexus: Arc::clone(nexus),
            context: RefCell::new(context),
            sm_handler,
            app_tid,
            phy_port,
            config,
            hostname: nexus.hostname().to_string(),
            max_data_per_pkt,
            transport: RefCell::new(transport),
            sm_sock,
            sm_rx: RefCell::new(sm_rx),
            bg_resp_tx,
            bg_resp_rx,
            sessions: RefCell::new(Vec::new()),
            pool: RefCell::new(BufferPool::new()),
            window: RefCell::new(HashMap::new()),
            pending_tx: RefCell::new(VecDeque::new()),
            wheel: RefCell::new(wheel),
            ctrl_bufs: RefCell::new(HashMap::new()),
            ctrl_next_id: Cell::new(0),
            ops,
            stats: RefCell::new(PktStats::default()),
            fault_fail_resolve_routing: Cell::new(false),
        })
    }

    /// This endpoint's identifier within the host.
    pub fn app_tid(&self) -> u32 {
        self.app_tid
    }

    /// Maximum data bytes per packet for this endpoint's transport.
    pub fn max_data_per_pkt(&self) -> usize {
        self.max_data_per_pkt
    }

    /// Maximum message size this endpoint accepts.
    pub fn max_msg_size(&self) -> usize {
        MAX_PKTS_PER_MSG * self.max_data_per_pkt
    }

    /// Borrow the application context, downcast to its concrete type.
    ///
    /// # Panics
    /// Panics if the context is currently borrowed by a running callback
    /// or the type does not match.
    pub fn context_ref<C: 'static>(&self) -> Ref<'_, C> {
        Ref::map(self.context.borrow(), |c| {
            c.downcast_ref::<C>().expect("context type mismatch")
        })
    }

    /// Mutably borrow the application context.
    pub fn context_mut<C: 'static>(&self) -> RefMut<'_, C> {
        RefMut::map(self.context.borrow_mut(), |c| {
            c.downcast_mut::<C>().expect("context type mismatch")
        })
    }

    /// Snapshot of the drop counters.
    pub fn pkt_stats(&self) -> PktStats {
        *self.stats.borrow()
    }

    /// Fault injection: make the next connect responses fail client-side
    /// routing resolution.
    pub fn set_fault_fail_resolve_routing(&self, enable: bool) {
        self.fault_fail_resolve_routing.set(enable);
    }

    /// State of a session, if the handle refers to a live one.
    pub fn session_state(&self, session_num: i32) -> Option<SessionState> {
        if session_num < 0 {
            return None;
        }
        self.sessions
            .borrow()
            .get(session_num as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.state)
    }

    /// Credits currently available on a session.
    pub fn available_credits(&self, session_num: i32) -> Option<usize> {
        if session_num < 0 {
            return None;
        }
        self.sessions
            .borrow()
            .get(session_num as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.available_credits())
    }

    /// Number of sessions not in the Disconnected state.
    pub fn num_active_sessions(&self) -> usize {
        self.sessions
            .borrow()
            .iter()
            .filter(|s| {
                s.as_ref()
                    .is_some_and(|s| s.state != SessionState::Disconnected)
            })
            .count()
    }

    // ------------------------------------------------------------------
    // MsgBuffer management
    // ------------------------------------------------------------------

    /// Allocate a MsgBuffer for `data_size` bytes plus the headers its
    /// packets need.
    pub fn alloc_msg_buffer(&self, data_size: usize) -> Result<MsgBuffer> {
        if data_size > self.max_msg_size() {
            return Err(Error::InvalidMsgSize {
                size: data_size,
                max: self.max_msg_size(),
            });
        }
        self.alloc_internal(data_size)
    }

    /// Shrink (or re-grow, up to the original allocation) a MsgBuffer.
    pub fn resize_msg_buffer(&self, buf: &mut MsgBuffer, new_size: usize) -> Result<()> {
        if !buf.is_valid() {
            return Err(Error::InvalidMsgBuffer);
        }
        if new_size > buf.max_data_size() {
            return Err(Error::InvalidMsgSize {
                size: new_size,
                max: buf.max_data_size(),
            });
        }
        let num_pkts = PktHdr::calc_num_pkts(new_size, self.max_data_per_pkt);
        if num_pkts > buf.max_num_pkts() {
            return Err(Error::InvalidMsgSize {
                size: new_size,
                max: buf.max_data_size(),
            });
        }
        buf.resize(new_size, num_pkts);
        Ok(())
    }

    /// Return a MsgBuffer's backing to the pool. Subsequent use of the
    /// buffer is invalid. A no-op for fake buffers.
    pub fn free_msg_buffer(&self, buf: MsgBuffer) {
        self.free_internal(buf);
    }

    fn alloc_internal(&self, data_size: usize) -> Result<MsgBuffer> {
        let num_pkts = PktHdr::calc_num_pkts(data_size, self.max_data_per_pkt);
        let needed = MsgBuffer::required_capacity(data_size, num_pkts);
        let slab = self.pool.borrow_mut().alloc(needed)?;
        if slab.fresh {
            self.transport
                .borrow_mut()
                .register_memory(slab.base, slab.capacity)?;
        }
        Ok(unsafe { MsgBuffer::owned(slab.base, slab.capacity, data_size, num_pkts) })
    }

    fn free_internal(&self, mut buf: MsgBuffer) {
        if let Some((base, capacity)) = buf.take_backing() {
            self.pool.borrow_mut().free(base, capacity);
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Create a session to `(remote_host, remote_app_tid, remote_port)`.
    /// Returns the local session handle; the `Connected` or
    /// `ConnectFailed` event arrives via the session management callback.
    pub fn create_session(
        &self,
        remote_host: &str,
        remote_app_tid: u32,
        remote_port: u8,
    ) -> Result<i32> {
        let mut sessions = self.sessions.borrow_mut();

        let idx = match sessions.iter().position(|s| s.is_none()) {
            Some(idx) => idx,
            None => {
                if sessions.len() >= self.config.max_sessions {
                    return Err(Error::TooManySessions);
                }
                sessions.push(None);
                sessions.len() - 1
            }
        };
        let session_num = idx as u16;

        let client_ep = SmEndpoint::new(&self.hostname, self.app_tid, session_num as u32, self.phy_port);
        let server_ep = SmEndpoint::new(remote_host, remote_app_tid, 0, remote_port);

        let mut sess = Session::new(
            session_num,
            SessionRole::Client,
            SessionState::ConnectInProgress,
            client_ep,
            server_ep,
        );

        let pkt = SmPkt {
            pkt_type: SmPktType::ConnectReq,
            err: SmErrType::NoError,
            client: client_ep,
            server: server_ep,
            client_routing: self.transport.borrow().routing_info(),
            server_routing: RoutingInfo::empty(),
        };
        sess.arm_sm_timer(SmPktType::ConnectReq, self.config.sm_rto_ms);
        sessions[idx] = Some(sess);
        drop(sessions);

        self.send_sm_pkt(&pkt)?;
        debug!(session_num, remote_host, remote_app_tid, "connect requested");
        Ok(session_num as i32)
    }

    /// Request disconnection of a session. Accepted only in the Connected
    /// state; the `Disconnected` event arrives via the callback once the
    /// peer acknowledges. Outstanding requests complete with no
    /// response-handler call.
    pub fn destroy_session(&self, session_num: i32) -> Result<()> {
        if session_num < 0 {
            return Err(Error::InvalidSessionHandle(session_num));
        }
        let mut sessions = self.sessions.borrow_mut();
        let sess = sessions
            .get_mut(session_num as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::InvalidSessionHandle(session_num))?;

        match sess.state {
            SessionState::Connected => {
                if sess.in_flight() > 0 {
                    // In-flight requests are torn down on the next event
                    // loop iteration, then the disconnect handshake starts.
                    sess.state = SessionState::ResetInProgress;
                    Ok(())
                } else {
                    let pkt = Self::build_disconnect_req(sess);
                    sess.state = SessionState::DisconnectInProgress;
                    sess.arm_sm_timer(SmPktType::DisconnectReq, self.config.sm_rto_ms);
                    drop(sessions);
                    self.send_sm_pkt(&pkt)?;
                    Ok(())
                }
            }
            _ => Err(Error::InvalidSessionState(session_num as u16)),
        }
    }

    // ------------------------------------------------------------------
    // Datapath: request enqueue
    // ------------------------------------------------------------------

    /// Enqueue a request on a connected session. On acceptance the request
    /// buffer is borrowed by the engine until the response handler fires;
    /// the application must not modify or free it before then.
    pub fn enqueue_request(
        &self,
        session_num: i32,
        req_type: u8,
        req_buf: &MsgBuffer,
    ) -> Result<()> {
        if !self.ops.contains_key(&req_type) {
            return Err(Error::UnknownReqType(req_type));
        }
        if !req_buf.is_valid() {
            return Err(Error::InvalidMsgBuffer);
        }
        let msg_size = req_buf.data_size();
        if msg_size == 0 || msg_size > self.max_msg_size() {
            return Err(Error::InvalidMsgSize {
                size: msg_size,
                max: self.max_msg_size(),
            });
        }
        if session_num < 0 {
            return Err(Error::InvalidSessionHandle(session_num));
        }

        let sessions = self.sessions.borrow();
        let sess = sessions
            .get(session_num as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Error::InvalidSessionHandle(session_num))?;

        if !sess.is_connected() || sess.role != SessionRole::Client {
            return Err(Error::SessionNotConnected(session_num as u16));
        }
        if !sess.has_credits() {
            return Err(Error::NoCredits);
        }

        let req_num = sess.peek_req_num();
        let slot_idx = Session::<T::Route>::slot_idx(req_num);
        if !sess.slots[slot_idx].is_free() {
            return Err(Error::NoAvailableSlots);
        }
        drop(sessions);

        let num_pkts = PktHdr::calc_num_pkts(msg_size, self.max_data_per_pkt);
        debug_assert_eq!(num_pkts, req_buf.num_pkts());

        let mut sessions = self.sessions.borrow_mut();
        let sess = sessions[session_num as usize].as_mut().unwrap();
        let taken = sess.alloc_req_num();
        debug_assert_eq!(taken, req_num);
        sess.consume_credit();

        // Write the dispatch-dependent header fields in place. Header n
        // pairs with data fragment n on the wire.
        let dst = sess.remote_session_num;
        for n in 0..num_pkts {
            let hdr = PktHdr::new(req_type, msg_size, dst, PktType::Req, n, req_num);
            unsafe { hdr.write_to(req_buf.pkthdr(n) as *mut u8) };
        }

        let slot = &mut sess.slots[slot_idx];
        slot.req_num = req_num;
        slot.req_type = req_type;
        slot.state = SSlotState::Outstanding;
        slot.req_desc = Some(req_buf.desc());
        slot.retries = 0;

        let route = sess.route.expect("connected session has a route");
        drop(sessions);

        let view = req_buf.desc().as_view();
        self.stage_msg_pkts(route, session_num as u16, &view, TOKEN_KIND_APP << TOKEN_KIND_SHIFT);

        self.wheel.borrow_mut().insert(TimerEntry {
            session_num: session_num as u16,
            sslot_idx: slot_idx,
            req_num,
            expires_at: timing::current_time_us() + self.config.dp_rto_us,
        });

        self.flush_tx();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Run exactly one event-loop iteration.
    pub fn run_event_loop_one(&self) {
        self.process_sm_queue();
        self.process_bg_resps();
        self.process_send_completions();
        self.process_rx();
        self.process_timers();
        self.flush_tx();
    }

    /// Run the event loop until `ms` milliseconds have elapsed.
    pub fn run_event_loop_timeout(&self, ms: u64) {
        let deadline = Instant::now() + Duration::from_millis(ms);
        loop {
            self.run_event_loop_one();
            if Instant::now() >= deadline {
                break;
            }
            std::thread::yield_now();
        }
    }

    // ------------------------------------------------------------------
    // Session management processing
    // ------------------------------------------------------------------

    fn process_sm_queue(&self) {
        let mut events: Vec<SmEvent> = Vec::new();
        let mut replies: Vec<SmPkt> = Vec::new();

        loop {
            let pkt = match self.sm_rx.borrow_mut().try_recv() {
                Some(pkt) => pkt,
                None => break,
            };
            trace!(pkt_type = ?pkt.pkt_type, "management datagram");
            match pkt.pkt_type {
                SmPktType::ConnectReq => self.handle_connect_req(&pkt, &mut replies),
                SmPktType::ConnectResp => {
                    self.handle_connect_resp(&pkt, &mut events, &mut replies)
                }
                SmPktType::DisconnectReq => self.handle_disconnect_req(&pkt, &mut replies),
                SmPktType::DisconnectResp => self.handle_disconnect_resp(&pkt, &mut events),
            }
        }

        for reply in &replies {
            let _ = self.send_sm_pkt(reply);
        }
        self.fire_sm_events(events);
    }

    /// Server side: validate and mirror a connect request.
    fn handle_connect_req(&self, pkt: &SmPkt, replies: &mut Vec<SmPkt>) {
        let mut sessions = self.sessions.borrow_mut();

        // Duplicate connect requests are idempotent: re-reply from the
        // existing mirror session.
        for entry in sessions.iter().flatten() {
            if entry.role == SessionRole::Server && entry.client_ep.same_session(&pkt.client) {
                replies.push(SmPkt {
                    pkt_type: SmPktType::ConnectResp,
                    err: SmErrType::NoError,
                    client: entry.client_ep,
                    server: entry.server_ep,
                    client_routing: pkt.client_routing,
                    server_routing: self.transport.borrow().routing_info(),
                });
                return;
            }
        }

        let refuse = |err: SmErrType, replies: &mut Vec<SmPkt>| {
            replies.push(SmPkt {
                pkt_type: SmPktType::ConnectResp,
                err,
                client: pkt.client,
                server: pkt.server,
                client_routing: pkt.client_routing,
                server_routing: RoutingInfo::empty(),
            });
        };

        if pkt.server.phy_port != self.phy_port {
            debug!(
                requested = pkt.server.phy_port,
                local = self.phy_port,
                "connect request for invalid port"
            );
            refuse(SmErrType::InvalidRemotePort, replies);
            return;
        }

        let idx = match sessions.iter().position(|s| s.is_none()) {
            Some(idx) => Some(idx),
            None if sessions.len() < self.config.max_sessions => {
                sessions.push(None);
                Some(sessions.len() - 1)
            }
            None => None,
        };
        let Some(idx) = idx else {
            refuse(SmErrType::TooManySessions, replies);
            return;
        };

        let peer_host = self.peer_host(pkt.client.hostname_str()).to_string();
        let route = match self
            .transport
            .borrow()
            .resolve_routing_info(&pkt.client_routing, &peer_host)
        {
            Ok(route) => route,
            Err(e) => {
                warn!(error = %e, "failed to resolve client routing info");
                refuse(SmErrType::OutOfMemory, replies);
                return;
            }
        };

        let session_num = idx as u16;
        let server_ep =
            SmEndpoint::new(&self.hostname, self.app_tid, session_num as u32, self.phy_port);
        let mut sess = Session::new(
            session_num,
            SessionRole::Server,
            SessionState::Connected,
            pkt.client,
            server_ep,
        );
        sess.remote_session_num = pkt.client.session_num as u16;
        sess.remote_routing = pkt.client_routing;
        sess.route = Some(route);
        sessions[idx] = Some(sess);

        replies.push(SmPkt {
            pkt_type: SmPktType::ConnectResp,
            err: SmErrType::NoError,
            client: pkt.client,
            server: server_ep,
            client_routing: pkt.client_routing,
            server_routing: self.transport.borrow().routing_info(),
        });
        debug!(session_num, client = ?pkt.client, "server session connected");
    }

    /// Client side: complete or fail the connect handshake.
    fn handle_connect_resp(
        &self,
        pkt: &SmPkt,
        events: &mut Vec<SmEvent>,
        replies: &mut Vec<SmPkt>,
    ) {
        let mut sessions = self.sessions.borrow_mut();
        let idx = pkt.client.session_num as usize;
        let Some(Some(sess)) = sessions.get_mut(idx) else {
            debug!(session = idx, "connect response for unknown session");
            return;
        };
        if sess.role != SessionRole::Client || sess.state != SessionState::ConnectInProgress {
            debug!(session = idx, state = ?sess.state, "stale connect response");
            return;
        }
        sess.disarm_sm_timer();
        let session_num = sess.local_session_num as i32;

        if pkt.err != SmErrType::NoError {
            // No server resources exist; bury the slot immediately.
            events.push((session_num, SmEventType::ConnectFailed, pkt.err));
            sessions[idx] = None;
            return;
        }

        let resolved = if self.fault_fail_resolve_routing.get() {
            Err(Error::RoutingResolution("fault injection".into()))
        } else {
            let peer_host = self.peer_host(pkt.server.hostname_str()).to_string();
            self.transport
                .borrow()
                .resolve_routing_info(&pkt.server_routing, &peer_host)
        };

        match resolved {
            Ok(route) => {
                sess.server_ep = pkt.server;
                sess.remote_session_num = pkt.server.session_num as u16;
                sess.remote_routing = pkt.server_routing;
                sess.route = Some(route);
                sess.state = SessionState::Connected;
                events.push((session_num, SmEventType::Connected, SmErrType::NoError));
            }
            Err(e) => {
                // The server allocated a mirror session; release it with a
                // disconnect that completes without a callback.
                debug!(error = %e, session = idx, "routing resolution failed");
                sess.server_ep = pkt.server;
                sess.remote_session_num = pkt.server.session_num as u16;
                sess.state = SessionState::DisconnectInProgress;
                sess.no_disconnect_callback = true;
                let req = Self::build_disconnect_req(sess);
                sess.arm_sm_timer(SmPktType::DisconnectReq, self.config.sm_rto_ms);
                replies.push(req);
                events.push((
                    session_num,
                    SmEventType::ConnectFailed,
                    SmErrType::RoutingResolutionFailure,
                ));
            }
        }
    }

    /// Server side: release the mirror session.
    fn handle_disconnect_req(&self, pkt: &SmPkt, replies: &mut Vec<SmPkt>) {
        let mut sessions = self.sessions.borrow_mut();

        let found = sessions.iter().position(|s| {
            s.as_ref().is_some_and(|s| {
                s.role == SessionRole::Server && s.client_ep.same_session(&pkt.client)
            })
        });

        let server_ep = match found {
            Some(idx) => {
                let mut sess = sessions[idx].take().unwrap();
                let server_ep = sess.server_ep;
                drop(sessions);
                // Purge staged packets before their backing buffers go.
                self.purge_session(idx as u16);
                self.release_server_resources(&mut sess);
                debug!(session = idx, "server session disconnected");
                server_ep
            }
            None => {
                // Duplicate disconnect; reply idempotently.
                pkt.server
            }
        };

        replies.push(SmPkt {
            pkt_type: SmPktType::DisconnectResp,
            err: SmErrType::NoError,
            client: pkt.client,
            server: server_ep,
            client_routing: pkt.client_routing,
            server_routing: pkt.server_routing,
        });
    }

    /// Client side: the peer acknowledged the disconnect.
    fn handle_disconnect_resp(&self, pkt: &SmPkt, events: &mut Vec<SmEvent>) {
        let mut sessions = self.sessions.borrow_mut();
        let idx = pkt.client.session_num as usize;
        let Some(Some(sess)) = sessions.get_mut(idx) else {
            return;
        };
        if sess.state != SessionState::DisconnectInProgress {
            debug!(session = idx, state = ?sess.state, "stale disconnect response");
            return;
        }
        sess.disarm_sm_timer();
        sess.state = SessionState::Disconnected;
        let fire = !sess.no_disconnect_callback;
        let session_num = sess.local_session_num as i32;
        sessions[idx] = None;
        drop(sessions);

        self.purge_session(idx as u16);
        if fire {
            events.push((session_num, SmEventType::Disconnected, SmErrType::NoError));
        }
    }

    fn fire_sm_events(&self, events: Vec<SmEvent>) {
        for (session_num, event, err) in events {
            let mut ctx = self.context.borrow_mut();
            (self.sm_handler)(session_num, event, err, ctx.as_mut());
        }
    }

    fn build_disconnect_req<R>(sess: &Session<R>) -> SmPkt {
        SmPkt {
            pkt_type: SmPktType::DisconnectReq,
            err: SmErrType::NoError,
            client: sess.client_ep,
            server: sess.server_ep,
            client_routing: RoutingInfo::empty(),
            server_routing: RoutingInfo::empty(),
        }
    }

    fn send_sm_pkt(&self, pkt: &SmPkt) -> Result<()> {
        let dst = self.nexus.resolve_mgmt_addr(pkt.dst_hostname())?;
        self.sm_sock.send_to(&pkt.serialize(), dst)?;
        Ok(())
    }

    /// Substitute loopback for our own hostname when resolving a peer.
    fn peer_host<'a>(&self, host: &'a str) -> &'a str {
        if host == self.hostname { "127.0.0.1" } else { host }
    }

    // ------------------------------------------------------------------
    // Background responses
    // ------------------------------------------------------------------

    fn process_bg_resps(&self) {
        while let Ok(bg) = self.bg_resp_rx.try_recv() {
            self.free_internal(bg.req);

            let live = {
                let sessions = self.sessions.borrow();
                sessions
                    .get(bg.session_num as usize)
                    .and_then(|s| s.as_ref())
                    .is_some_and(|s| {
                        let slot = &s.slots[Session::<T::Route>::slot_idx(bg.req_num)];
                        s.is_connected()
                            && slot.req_num == bg.req_num
                            && slot.state == SSlotState::Handling
                    })
            };
            if live {
                self.finish_response(
                    bg.session_num,
                    Session::<T::Route>::slot_idx(bg.req_num),
                    bg.req_num,
                    bg.resp,
                );
            } else {
                self.discard_taken(bg.resp.take_response());
            }
        }
    }

    // ------------------------------------------------------------------
    // Transmit path
    // ------------------------------------------------------------------

    fn stage_msg_pkts(&self, route: T::Route, session_num: u16, mb: &MsgBuffer, token: u64) {
        let mut pending = self.pending_tx.borrow_mut();
        let msg_size = mb.data_size();
        for n in 0..mb.num_pkts() {
            pending.push_back(PendingPkt {
                route,
                session_num,
                hdr: mb.pkthdr(n) as *const u8,
                payload: unsafe { mb.as_ptr().add(n as usize * self.max_data_per_pkt) },
                payload_len: PktHdr::pkt_data_len(msg_size, self.max_data_per_pkt, n),
                token,
            });
        }
    }

    fn stage_explicit_credit(&self, route: T::Route, session_num: u16, dst: u16, req_num: u64) {
        let slab = match self.pool.borrow_mut().alloc(PKT_HDR_SIZE) {
            Ok(slab) => slab,
            Err(_) => return,
        };
        if slab.fresh
            && self
                .transport
                .borrow_mut()
                .register_memory(slab.base, slab.capacity)
                .is_err()
        {
            self.pool.borrow_mut().free(slab.base, slab.capacity);
            return;
        }
        let hdr = PktHdr::new(0, 0, dst, PktType::ExplicitCredit, 0, req_num);
        unsafe { hdr.write_to(slab.base) };

        let id = self.ctrl_next_id.get();
        self.ctrl_next_id.set(id + 1);
        let token = (TOKEN_KIND_CTRL << TOKEN_KIND_SHIFT) | id;
        self.ctrl_bufs
            .borrow_mut()
            .insert(token, (slab.base as usize, slab.capacity));

        self.pending_tx.borrow_mut().push_back(PendingPkt {
            route,
            session_num,
            hdr: slab.base,
            payload: slab.base,
            payload_len: 0,
            token,
        });
    }

    fn flush_tx(&self) {
        loop {
            let mut batch: Vec<TxPkt<T::Route>> = Vec::new();
            {
                let pending = self.pending_tx.borrow();
                for pkt in pending.iter().take(self.config.tx_burst) {
                    batch.push(TxPkt {
                        route: pkt.route,
                        hdr: pkt.hdr,
                        payload: pkt.payload,
                        payload_len: pkt.payload_len,
                        token: pkt.token,
                    });
                }
            }
            if batch.is_empty() {
                return;
            }
            let batch_len = batch.len();
            let accepted = self.transport.borrow_mut().post_send(&batch);
            {
                let mut pending = self.pending_tx.borrow_mut();
                for _ in 0..accepted {
                    pending.pop_front();
                }
            }
            if accepted < batch_len {
                // Transport backlogged; the rest drains next iteration.
                return;
            }
        }
    }

    fn process_send_completions(&self) {
        let mut comps: Vec<SendCompletion> = Vec::new();
        self.transport.borrow_mut().poll_send_cq(&mut comps);
        for comp in comps {
            if token_kind(comp.token) == TOKEN_KIND_CTRL
                && let Some((base, capacity)) = self.ctrl_bufs.borrow_mut().remove(&comp.token)
            {
                self.pool.borrow_mut().free(base as *mut u8, capacity);
            }
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    fn process_rx(&self) {
        let mut views: Vec<RxView> = Vec::new();
        self.transport.borrow_mut().poll_recv_cq(&mut views);
        if views.is_empty() {
            return;
        }

        let mut actions: Vec<RxAction> = Vec::new();
        for view in views {
            self.handle_data_pkt(view, &mut actions);
        }

        // Handlers run after all session borrows are dropped. Borrowed
        // buffers alias the receive ring and stay valid until the next
        // poll, which happens no earlier than the next iteration.
        for action in actions {
            match action {
                RxAction::DispatchReq {
                    session_num,
                    slot_idx,
                    req_num,
                    req_type,
                    req,
                } => self.dispatch_request(session_num, slot_idx, req_num, req_type, req),
                RxAction::RespDone {
                    req_type,
                    req_desc,
                    resp,
                } => self.complete_response(req_type, req_desc, resp),
            }
        }
    }

    fn handle_data_pkt(&self, view: RxView, actions: &mut Vec<RxAction>) {
        let bytes = unsafe { std::slice::from_raw_parts(view.ptr, view.len) };
        let hdr = match PktHdr::from_bytes(bytes) {
            Ok(hdr) => hdr,
            Err(_) => {
                self.stats.borrow_mut().bad_magic += 1;
                return;
            }
        };
        let Ok(pkt_type) = hdr.pkt_type() else {
            self.stats.borrow_mut().bad_pkt_type += 1;
            return;
        };

        let msg_size = { hdr.msg_size } as usize;
        if msg_size > self.max_msg_size() {
            self.stats.borrow_mut().bad_msg_size += 1;
            return;
        }
        let num_pkts = PktHdr::calc_num_pkts(msg_size, self.max_data_per_pkt);
        let pkt_num = { hdr.pkt_num };
        if pkt_num >= num_pkts {
            self.stats.borrow_mut().bad_pkt_num += 1;
            return;
        }
        let payload_len = view.len - PKT_HDR_SIZE;
        if pkt_type != PktType::ExplicitCredit
            && payload_len != PktHdr::pkt_data_len(msg_size, self.max_data_per_pkt, pkt_num)
        {
            self.stats.borrow_mut().bad_msg_size += 1;
            return;
        }

        let session_idx = { hdr.dst_session_num } as usize;
        let req_num = { hdr.req_num };

        let mut sessions = self.sessions.borrow_mut();
        let Some(Some(sess)) = sessions.get_mut(session_idx) else {
            self.stats.borrow_mut().unknown_session += 1;
            return;
        };
        if !sess.is_connected() {
            self.stats.borrow_mut().not_connected += 1;
            return;
        }

        match (pkt_type, sess.role) {
            (PktType::Req | PktType::ReqForResp, SessionRole::Server) => {
                self.handle_req_pkt(sess, &hdr, pkt_type, view, actions);
            }
            (PktType::Resp, SessionRole::Client) => {
                self.handle_resp_pkt(sess, &hdr, view, actions);
            }
            (PktType::ExplicitCredit, SessionRole::Client) => {
                // The server has the request but nothing to send yet;
                // push the retransmit deadline out.
                let slot_idx = Session::<T::Route>::slot_idx(req_num);
                let slot = &mut sess.slots[slot_idx];
                if slot.state == SSlotState::Outstanding && slot.req_num == req_num {
                    slot.retries = 0;
                    let session_num = sess.local_session_num;
                    let mut wheel = self.wheel.borrow_mut();
                    wheel.cancel(session_num, slot_idx, req_num);
                    wheel.insert(TimerEntry {
                        session_num,
                        sslot_idx: slot_idx,
                        req_num,
                        expires_at: timing::current_time_us() + self.config.dp_rto_us,
                    });
                }
            }
            _ => {
                self.stats.borrow_mut().bad_pkt_type += 1;
            }
        }
    }

    /// Server side: feed one request packet into the slot state machine.
    fn handle_req_pkt(
        &self,
        sess: &mut Session<T::Route>,
        hdr: &PktHdr,
        pkt_type: PktType,
        view: RxView,
        actions: &mut Vec<RxAction>,
    ) {
        let req_num = { hdr.req_num };
        let msg_size = { hdr.msg_size } as usize;
        let num_pkts = PktHdr::calc_num_pkts(msg_size, self.max_data_per_pkt);
        let pkt_num = { hdr.pkt_num };
        let slot_idx = Session::<T::Route>::slot_idx(req_num);
        let session_num = sess.local_session_num;
        let route = sess.route.expect("connected session has a route");
        let slot = &mut sess.slots[slot_idx];

        let is_new = slot.state == SSlotState::Idle || req_num > slot.req_num;
        if is_new {
            // Slot reuse: the client saw the previous response, so the
            // retained copy can finally go.
            if slot.state == SSlotState::Reassembling {
                let key = (session_num, slot.req_num);
                if let Some(stale) = self.window.borrow_mut().remove(&key) {
                    self.free_internal(stale.buf);
                }
            }
            if let Some(resp) = slot.resp.take() {
                if slot.resp_is_prealloc {
                    slot.prealloc = Some(resp);
                } else {
                    self.free_internal(resp);
                }
            }
            slot.resp_is_prealloc = false;

            if num_pkts == 1 {
                slot.req_num = req_num;
                slot.req_type = hdr.req_type;
                slot.state = SSlotState::Handling;
                actions.push(RxAction::DispatchReq {
                    session_num,
                    slot_idx,
                    req_num,
                    req_type: hdr.req_type,
                    req: ReqBuf::Borrowed {
                        hdr: view.ptr,
                        data_len: msg_size,
                    },
                });
                return;
            }

            // Multi-packet: admit into the unexpected window.
            let mut window = self.window.borrow_mut();
            if window.len() >= UNEXP_PKT_WINDOW {
                // Back-pressure: the sender's retransmit timer re-offers
                // the message once the window drains.
                self.stats.borrow_mut().window_full += 1;
                return;
            }
            drop(window);
            let buf = match self.alloc_internal(msg_size) {
                Ok(buf) => buf,
                Err(e) => {
                    warn!(error = %e, "reassembly allocation failed");
                    return;
                }
            };
            slot.req_num = req_num;
            slot.req_type = hdr.req_type;
            slot.state = SSlotState::Reassembling;
            let mut entry = Reassembly {
                buf,
                rcvd: vec![false; num_pkts as usize],
                rcvd_cnt: 0,
            };
            Self::copy_fragment(&mut entry, hdr, view, self.max_data_per_pkt);
            self.window
                .borrow_mut()
                .insert((session_num, req_num), entry);
            return;
        }

        if req_num < slot.req_num {
            self.stats.borrow_mut().stale += 1;
            return;
        }

        // req_num matches the slot's current request.
        match slot.state {
            SSlotState::Reassembling => {
                let key = (session_num, req_num);
                let mut window = self.window.borrow_mut();
                let Some(entry) = window.get_mut(&key) else {
                    return;
                };
                Self::copy_fragment(entry, hdr, view, self.max_data_per_pkt);
                if entry.rcvd_cnt as usize == entry.rcvd.len() {
                    let entry = window.remove(&key).unwrap();
                    drop(window);
                    slot.state = SSlotState::Handling;
                    actions.push(RxAction::DispatchReq {
                        session_num,
                        slot_idx,
                        req_num,
                        req_type: slot.req_type,
                        req: ReqBuf::Owned(entry.buf),
                    });
                }
            }
            SSlotState::Handling => {
                // Nothing to send yet; tell the client we have the request
                // so it backs off.
                if pkt_num == 0 && pkt_type == PktType::ReqForResp {
                    let dst = sess.remote_session_num;
                    self.stage_explicit_credit(route, session_num, dst, req_num);
                }
            }
            SSlotState::Responded => {
                // The response (or part of it) was lost; send it again.
                if pkt_num == 0 {
                    self.stats.borrow_mut().retransmits += 1;
                    let token = TOKEN_KIND_RESP << TOKEN_KIND_SHIFT;
                    let resp = slot.resp.as_ref().expect("responded slot retains response");
                    self.stage_msg_pkts(route, session_num, resp, token);
                }
            }
            _ => {
                self.stats.borrow_mut().stale += 1;
            }
        }
    }

    /// Client side: feed one response packet into the slot state machine.
    fn handle_resp_pkt(
        &self,
        sess: &mut Session<T::Route>,
        hdr: &PktHdr,
        view: RxView,
        actions: &mut Vec<RxAction>,
    ) {
        let req_num = { hdr.req_num };
        let msg_size = { hdr.msg_size } as usize;
        let num_pkts = PktHdr::calc_num_pkts(msg_size, self.max_data_per_pkt);
        let slot_idx = Session::<T::Route>::slot_idx(req_num);
        let session_num = sess.local_session_num;
        let slot = &mut sess.slots[slot_idx];

        if slot.state != SSlotState::Outstanding || slot.req_num != req_num {
            self.stats.borrow_mut().stale += 1;
            return;
        }

        if num_pkts == 1 {
            let req_desc = slot.req_desc.take().expect("outstanding slot has a request");
            let req_type = slot.req_type;
            slot.state = SSlotState::Free;
            sess.return_credit();
            self.wheel.borrow_mut().cancel(session_num, slot_idx, req_num);
            actions.push(RxAction::RespDone {
                req_type,
                req_desc,
                resp: ReqBuf::Borrowed {
                    hdr: view.ptr,
                    data_len: msg_size,
                },
            });
            return;
        }

        let key = (session_num, req_num);
        let mut window = self.window.borrow_mut();
        if !window.contains_key(&key) {
            if window.len() >= UNEXP_PKT_WINDOW {
                self.stats.borrow_mut().window_full += 1;
                return;
            }
            drop(window);
            let buf = match self.alloc_internal(msg_size) {
                Ok(buf) => buf,
                Err(e) => {
                    warn!(error = %e, "reassembly allocation failed");
                    return;
                }
            };
            window = self.window.borrow_mut();
            window.insert(
                key,
                Reassembly {
                    buf,
                    rcvd: vec![false; num_pkts as usize],
                    rcvd_cnt: 0,
                },
            );
        }

        let entry = window.get_mut(&key).unwrap();
        Self::copy_fragment(entry, hdr, view, self.max_data_per_pkt);
        if entry.rcvd_cnt as usize == entry.rcvd.len() {
            let entry = window.remove(&key).unwrap();
            drop(window);

            let req_desc = slot.req_desc.take().expect("outstanding slot has a request");
            let req_type = slot.req_type;
            slot.state = SSlotState::Free;
            sess.return_credit();
            self.wheel.borrow_mut().cancel(session_num, slot_idx, req_num);
            actions.push(RxAction::RespDone {
                req_type,
                req_desc,
                resp: ReqBuf::Owned(entry.buf),
            });
        }
    }

    /// Copy one fragment into its reassembly buffer at the packet's final
    /// offset. Duplicates are idempotent; fragments whose header disagrees
    /// with the entry's geometry are dropped.
    fn copy_fragment(entry: &mut Reassembly, hdr: &PktHdr, view: RxView, max_data_per_pkt: usize) {
        let pkt_num = { hdr.pkt_num } as usize;
        if pkt_num >= entry.rcvd.len() || entry.rcvd[pkt_num] {
            return;
        }
        let msg_size = { hdr.msg_size } as usize;
        let offset = pkt_num * max_data_per_pkt;
        let len = PktHdr::pkt_data_len(msg_size, max_data_per_pkt, pkt_num as u16);
        if offset + len > entry.buf.data_size() {
            return;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                view.ptr.add(PKT_HDR_SIZE),
                entry.buf.as_mut_ptr().add(offset),
                len,
            );
        }
        entry.rcvd[pkt_num] = true;
        entry.rcvd_cnt += 1;
    }

    // ------------------------------------------------------------------
    // Request dispatch and response transmission (server side)
    // ------------------------------------------------------------------

    fn dispatch_request(
        &self,
        session_num: u16,
        slot_idx: usize,
        req_num: u64,
        req_type: u8,
        req: ReqBuf,
    ) {
        let Some(ops) = self.ops.get(&req_type).copied() else {
            self.stats.borrow_mut().unknown_req_type += 1;
            if let ReqBuf::Owned(mb) = req {
                self.free_internal(mb);
            }
            self.reset_server_slot(session_num, slot_idx, req_num);
            return;
        };

        if ops.run_in_background && self.nexus.has_bg_threads() {
            let req_owned = match req {
                ReqBuf::Owned(mb) => mb,
                ReqBuf::Borrowed { hdr, data_len } => {
                    // The ring buffer cannot leave this thread; copy out.
                    match self.alloc_internal(data_len) {
                        Ok(mut mb) => {
                            unsafe {
                                std::ptr::copy_nonoverlapping(
                                    hdr.add(PKT_HDR_SIZE),
                                    mb.as_mut_ptr(),
                                    data_len,
                                );
                            }
                            mb
                        }
                        Err(e) => {
                            warn!(error = %e, "background request copy failed");
                            self.reset_server_slot(session_num, slot_idx, req_num);
                            return;
                        }
                    }
                }
            };
            let submitted = self.nexus.submit_bg(BgWork {
                req: req_owned,
                ops,
                session_num,
                req_num,
                max_data_per_pkt: self.max_data_per_pkt,
                resp_tx: self.bg_resp_tx.clone(),
            });
            debug_assert!(submitted);
            return;
        }

        // Foreground: run the handler inline on the event-loop thread.
        let prealloc = {
            let mut sessions = self.sessions.borrow_mut();
            match sessions.get_mut(session_num as usize).and_then(|s| s.as_mut()) {
                Some(sess) => sess.slots[slot_idx].prealloc.take(),
                None => None,
            }
        };
        let prealloc = match prealloc {
            Some(p) => Some(p),
            None => self.alloc_internal(self.max_data_per_pkt).ok(),
        };

        let mut app_resp = AppResp::foreground(prealloc, self.max_data_per_pkt);
        match req {
            ReqBuf::Borrowed { hdr, data_len } => {
                let req_view = unsafe { MsgBuffer::fake_from_pkt(hdr, data_len) };
                let mut ctx = self.context.borrow_mut();
                (ops.req_handler)(&req_view, &mut app_resp, ctx.as_mut());
            }
            ReqBuf::Owned(mb) => {
                {
                    let mut ctx = self.context.borrow_mut();
                    (ops.req_handler)(&mb, &mut app_resp, ctx.as_mut());
                }
                self.free_internal(mb);
            }
        }

        self.finish_response(session_num, slot_idx, req_num, app_resp);
    }

    fn reset_server_slot(&self, session_num: u16, slot_idx: usize, req_num: u64) {
        let mut sessions = self.sessions.borrow_mut();
        if let Some(Some(sess)) = sessions.get_mut(session_num as usize) {
            let slot = &mut sess.slots[slot_idx];
            if slot.req_num == req_num {
                slot.state = SSlotState::Idle;
            }
        }
    }

    /// Stamp headers on the chosen response buffer, retain it on the slot,
    /// and stage its packets.
    fn finish_response(&self, session_num: u16, slot_idx: usize, req_num: u64, resp: AppResp) {
        let taken = resp.take_response();

        let mut sessions = self.sessions.borrow_mut();
        let Some(Some(sess)) = sessions.get_mut(session_num as usize) else {
            drop(sessions);
            self.discard_taken(taken);
            return;
        };
        let valid = sess.is_connected()
            && sess.slots[slot_idx].req_num == req_num
            && sess.slots[slot_idx].state == SSlotState::Handling;
        if !valid {
            drop(sessions);
            self.discard_taken(taken);
            return;
        }

        let route = sess.route.expect("connected session has a route");
        let dst = sess.remote_session_num;
        let req_type = sess.slots[slot_idx].req_type;
        let slot = &mut sess.slots[slot_idx];

        if let Some(p) = taken.leftover_prealloc {
            slot.prealloc = Some(p);
        }
        if let Some(d) = taken.leftover_dyn {
            self.free_internal(d);
        }

        let Some(mut resp) = taken.resp else {
            warn!(req_num, "request handler produced no response");
            slot.state = SSlotState::Idle;
            return;
        };

        let msg_size = resp.data_size();
        let num_pkts = resp.num_pkts();
        debug_assert_eq!(num_pkts, PktHdr::calc_num_pkts(msg_size, self.max_data_per_pkt));
        for n in 0..num_pkts {
            let hdr = PktHdr::new(req_type, msg_size, dst, PktType::Resp, n, req_num);
            unsafe { hdr.write_to(resp.pkthdr_mut(n) as *mut u8) };
        }

        slot.resp = Some(resp);
        slot.resp_is_prealloc = taken.is_prealloc;
        slot.state = SSlotState::Responded;

        let token = TOKEN_KIND_RESP << TOKEN_KIND_SHIFT;
        let resp_ref = slot.resp.as_ref().unwrap();
        self.stage_msg_pkts(route, session_num, resp_ref, token);
    }

    fn discard_taken(&self, taken: TakenResp) {
        if let Some(r) = taken.resp {
            self.free_internal(r);
        }
        if let Some(p) = taken.leftover_prealloc {
            self.free_internal(p);
        }
        if let Some(d) = taken.leftover_dyn {
            self.free_internal(d);
        }
    }

    // ------------------------------------------------------------------
    // Client response completion
    // ------------------------------------------------------------------

    fn complete_response(&self, req_type: u8, req_desc: MsgBufferDesc, resp: ReqBuf) {
        let ops = self
            .ops
            .get(&req_type)
            .copied()
            .expect("accepted request had registered ops");

        let req_view = req_desc.as_view();
        match resp {
            ReqBuf::Borrowed { hdr, data_len } => {
                let resp_view = unsafe { MsgBuffer::fake_from_pkt(hdr, data_len) };
                let mut ctx = self.context.borrow_mut();
                (ops.resp_handler)(&req_view, &resp_view, ctx.as_mut());
            }
            ReqBuf::Owned(mb) => {
                {
                    let mut ctx = self.context.borrow_mut();
                    (ops.resp_handler)(&req_view, &mb, ctx.as_mut());
                }
                self.free_internal(mb);
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn process_timers(&self) {
        let mut events: Vec<SmEvent> = Vec::new();
        self.process_sm_timers(&mut events);
        self.process_dp_timers(&mut events);
        self.fire_sm_events(events);
    }

    fn process_sm_timers(&self, events: &mut Vec<SmEvent>) {
        let now = Instant::now();
        let rto = Duration::from_millis(self.config.sm_rto_ms);
        let mut to_send: Vec<SmPkt> = Vec::new();
        let mut to_bury: Vec<usize> = Vec::new();

        {
            let mut sessions = self.sessions.borrow_mut();
            for idx in 0..sessions.len() {
                let Some(sess) = sessions[idx].as_mut() else {
                    continue;
                };

                if sess.state == SessionState::ResetInProgress {
                    // Outstanding requests complete with no response
                    // handler call; the session callback is the sole
                    // completion signal.
                    Self::abort_in_flight(sess);
                    self.purge_session(sess.local_session_num);
                    sess.state = SessionState::DisconnectInProgress;
                    let pkt = Self::build_disconnect_req(sess);
                    sess.arm_sm_timer(SmPktType::DisconnectReq, self.config.sm_rto_ms);
                    to_send.push(pkt);
                    continue;
                }

                let Some(pending) = sess.sm_pending else {
                    continue;
                };
                if sess.sm_deadline > now {
                    continue;
                }
                sess.sm_retries += 1;
                if sess.sm_retries > self.config.sm_max_retries {
                    let session_num = sess.local_session_num as i32;
                    match sess.state {
                        SessionState::ConnectInProgress => {
                            events.push((
                                session_num,
                                SmEventType::ConnectFailed,
                                SmErrType::Timeout,
                            ));
                            to_bury.push(idx);
                        }
                        SessionState::DisconnectInProgress => {
                            if !sess.no_disconnect_callback {
                                events.push((
                                    session_num,
                                    SmEventType::DisconnectFailed,
                                    SmErrType::Timeout,
                                ));
                            }
                            to_bury.push(idx);
                        }
                        _ => sess.disarm_sm_timer(),
                    }
                    continue;
                }

                trace!(session = idx, ?pending, "management retransmission");
                let pkt = match pending {
                    SmPktType::ConnectReq => SmPkt {
                        pkt_type: SmPktType::ConnectReq,
                        err: SmErrType::NoError,
                        client: sess.client_ep,
                        server: sess.server_ep,
                        client_routing: self.transport.borrow().routing_info(),
                        server_routing: RoutingInfo::empty(),
                    },
                    _ => Self::build_disconnect_req(sess),
                };
                sess.sm_deadline = now + rto;
                to_send.push(pkt);
            }

            for idx in to_bury {
                if let Some(sess) = sessions[idx].take() {
                    self.purge_session(sess.local_session_num);
                }
            }
        }

        for pkt in &to_send {
            let _ = self.send_sm_pkt(pkt);
        }
    }

    fn process_dp_timers(&self, events: &mut Vec<SmEvent>) {
        let mut expired: Vec<TimerEntry> = Vec::new();
        self.wheel
            .borrow_mut()
            .advance_into(timing::current_time_us(), &mut expired);

        for entry in expired {
            let mut lost_session: Option<u16> = None;
            let retransmit = {
                let mut sessions = self.sessions.borrow_mut();
                let Some(Some(sess)) = sessions.get_mut(entry.session_num as usize) else {
                    continue;
                };
                if sess.state != SessionState::Connected {
                    continue;
                }
                let route = sess.route;
                let slot = &mut sess.slots[entry.sslot_idx];
                if !(slot.state == SSlotState::Outstanding && slot.req_num == entry.req_num) {
                    continue;
                }
                slot.retries += 1;
                if slot.retries > self.config.dp_max_retries {
                    lost_session = Some(entry.session_num);
                    None
                } else {
                    let desc = slot.req_desc;
                    desc.map(|desc| (desc, route.unwrap()))
                }
            };

            if let Some(session_num) = lost_session {
                self.declare_peer_lost(session_num, events);
                continue;
            }

            if let Some((desc, route)) = retransmit {
                self.stats.borrow_mut().retransmits += 1;
                let view = desc.as_view();
                // Re-sent packets solicit the retained response.
                for n in 0..view.num_pkts() {
                    unsafe {
                        (*(view.pkthdr(n) as *mut PktHdr)).set_pkt_type(PktType::ReqForResp);
                    }
                }
                self.stage_msg_pkts(
                    route,
                    entry.session_num,
                    &view,
                    TOKEN_KIND_APP << TOKEN_KIND_SHIFT,
                );
                self.wheel.borrow_mut().insert(TimerEntry {
                    expires_at: timing::current_time_us() + self.config.dp_rto_us,
                    ..entry
                });
            }
        }
    }

    /// The datapath retransmission cap was reached: treat the peer as
    /// lost. Outstanding requests complete without their response
    /// handlers; the session callback is the completion signal.
    fn declare_peer_lost(&self, session_num: u16, events: &mut Vec<SmEvent>) {
        let mut sessions = self.sessions.borrow_mut();
        let Some(entry) = sessions.get_mut(session_num as usize) else {
            return;
        };
        let Some(sess) = entry.as_mut() else {
            return;
        };
        warn!(session = session_num, "datapath retries exhausted, peer lost");
        Self::abort_in_flight(sess);
        sess.state = SessionState::Disconnected;
        *entry = None;
        drop(sessions);

        self.purge_session(session_num);
        events.push((
            session_num as i32,
            SmEventType::DisconnectFailed,
            SmErrType::Timeout,
        ));
    }

    // ------------------------------------------------------------------
    // Teardown helpers
    // ------------------------------------------------------------------

    fn abort_in_flight(sess: &mut Session<T::Route>) {
        let mut aborted = 0;
        for slot in sess.slots.iter_mut() {
            if slot.state == SSlotState::Outstanding {
                slot.state = SSlotState::Free;
                slot.req_desc = None;
                aborted += 1;
            }
        }
        for _ in 0..aborted {
            sess.return_credit();
        }
    }

    fn release_server_resources(&self, sess: &mut Session<T::Route>) {
        for slot in sess.slots.iter_mut() {
            if let Some(resp) = slot.resp.take() {
                self.free_internal(resp);
            }
            if let Some(prealloc) = slot.prealloc.take() {
                self.free_internal(prealloc);
            }
        }
    }

    /// Remove every staged packet and reassembly owned by a session.
    fn purge_session(&self, session_num: u16) {
        {
            let mut pending = self.pending_tx.borrow_mut();
            let old = std::mem::take(&mut *pending);
            for pkt in old {
                if pkt.session_num == session_num {
                    if token_kind(pkt.token) == TOKEN_KIND_CTRL
                        && let Some((base, capacity)) =
                            self.ctrl_bufs.borrow_mut().remove(&pkt.token)
                    {
                        self.pool.borrow_mut().free(base as *mut u8, capacity);
                    }
                } else {
                    pending.push_back(pkt);
                }
            }
        }

        let keys: Vec<(u16, u64)> = self
            .window
            .borrow()
            .keys()
            .filter(|(s, _)| *s == session_num)
            .copied()
            .collect();
        for key in keys {
            if let Some(entry) = self.window.borrow_mut().remove(&key) {
                self.free_internal(entry.buf);
            }
        }
    }
}

impl<T: Transport> Drop for Rpc<T> {
    fn drop(&mut self) {
        self.nexus.unregister_hook(self.app_tid);
        // Free retained server-side buffers so the pool balances.
        let mut sessions = std::mem::take(&mut *self.sessions.borrow_mut());
        for sess in sessions.iter_mut().flatten() {
            self.release_server_resources(sess);
        }
        for key in self
            .window
            .borrow()
            .keys()
            .copied()
            .collect::<Vec<(u16, u64)>>()
        {
            if let Some(entry) = self.window.borrow_mut().remove(&key) {
                self.free_internal(entry.buf);
            }
        }
        for (_, (base, capacity)) in self.ctrl_bufs.borrow_mut().drain() {
            self.pool.borrow_mut().free(base as *mut u8, capacity);
        }
    }
}
