//! Sessions and request slots.
//!
//! A session is connected state with a single peer endpoint. Each session
//! owns a fixed table of `SESSION_CREDITS` request slots; a slot doubles as
//! the credit to have one request outstanding. Slot assignment is fixed:
//! `sslot_idx = req_num % SESSION_CREDITS`, giving O(1) lookup by request
//! number.

use std::cell::Cell;
use std::time::Instant;

use crate::buffer::{MsgBuffer, MsgBufferDesc};
use crate::config::SESSION_CREDITS;
use crate::sm::{SmEndpoint, SmPktType};
use crate::transport::RoutingInfo;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connect request sent, waiting for the response.
    ConnectInProgress,
    /// Connected and ready for requests.
    Connected,
    /// Disconnect requested, waiting for the peer's acknowledgement.
    DisconnectInProgress,
    /// Local teardown of in-flight requests before the disconnect
    /// handshake starts.
    ResetInProgress,
    /// Fully disconnected; the session is destroyable.
    Disconnected,
}

/// Which side of the session this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// Request slot state. Client sessions use `Free`/`Outstanding`; server
/// sessions use the remaining states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SSlotState {
    /// Client: no request in flight on this slot.
    Free,
    /// Client: request sent, waiting for the response.
    Outstanding,
    /// Server: slot has never carried a request.
    Idle,
    /// Server: collecting fragments of a multi-packet request.
    Reassembling,
    /// Server: request handed to a handler, response not yet available.
    Handling,
    /// Server: response transmitted and retained for retransmission.
    Responded,
}

/// One request slot.
pub(crate) struct SSlot {
    /// Request number currently (or last) carried by this slot.
    pub req_num: u64,
    pub state: SSlotState,
    pub req_type: u8,
    /// Client: shallow borrow of the application's request buffer, held
    /// from `enqueue_request` until the response handler returns.
    pub req_desc: Option<MsgBufferDesc>,
    /// Client: datapath retransmissions for the current request.
    pub retries: u32,
    /// Server: retained response, answered again on `ReqForResp`.
    pub resp: Option<MsgBuffer>,
    /// Server: true if `resp` is the slot's preallocated buffer and must
    /// return to `prealloc` on slot reuse rather than to the pool.
    pub resp_is_prealloc: bool,
    /// Server: preallocated single-packet response buffer (fast path).
    pub prealloc: Option<MsgBuffer>,
}

impl SSlot {
    pub fn new(role: SessionRole) -> Self {
        Self {
            req_num: 0,
            state: match role {
                SessionRole::Client => SSlotState::Free,
                SessionRole::Server => SSlotState::Idle,
            },
            req_type: 0,
            req_desc: None,
            retries: 0,
            resp: None,
            resp_is_prealloc: false,
            prealloc: None,
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == SSlotState::Free
    }
}

/// A session: per-peer state within an endpoint.
pub(crate) struct Session<R> {
    /// Session number local to this endpoint; the wire `dst_session_num`
    /// of packets we receive.
    pub local_session_num: u16,
    /// The peer's session number; the wire `dst_session_num` of packets
    /// we send.
    pub remote_session_num: u16,
    pub state: SessionState,
    pub role: SessionRole,
    /// Client-side endpoint identity of this session.
    pub client_ep: SmEndpoint,
    /// Server-side endpoint identity of this session.
    pub server_ep: SmEndpoint,
    /// The peer's opaque routing info from the handshake.
    pub remote_routing: RoutingInfo,
    /// The peer's resolved transport address.
    pub route: Option<R>,
    pub slots: Vec<SSlot>,
    /// Credits remaining; one request in flight per credit.
    credits: Cell<usize>,
    next_req_num: Cell<u64>,
    /// Management request awaiting acknowledgement, retransmitted on a
    /// timer.
    pub sm_pending: Option<SmPktType>,
    pub sm_deadline: Instant,
    pub sm_retries: u32,
    /// Set on the routing-resolution-failure path: the disconnect that
    /// releases server resources completes without a callback.
    pub no_disconnect_callback: bool,
}

impl<R> Session<R> {
    pub fn new(
        local_session_num: u16,
        role: SessionRole,
        state: SessionState,
        client_ep: SmEndpoint,
        server_ep: SmEndpoint,
    ) -> Self {
        Self {
            local_session_num,
            remote_session_num: 0,
            state,
            role,
            client_ep,
            server_ep,
            remote_routing: RoutingInfo::empty(),
            route: None,
            slots: (0..SESSION_CREDITS).map(|_| SSlot::new(role)).collect(),
            credits: Cell::new(SESSION_CREDITS),
            next_req_num: Cell::new(0),
            sm_pending: None,
            sm_deadline: Instant::now(),
            sm_retries: 0,
            no_disconnect_callback: false,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// A session may be destroyed only once it reaches Disconnected.
    #[inline]
    pub fn is_destroyable(&self) -> bool {
        self.state == SessionState::Disconnected
    }

    /// Allocate the next request number. Unique over the session lifetime.
    pub fn alloc_req_num(&self) -> u64 {
        let num = self.next_req_num.get();
        self.next_req_num.set(num + 1);
        num
    }

    /// The request number the next `alloc_req_num` will return.
    #[inline]
    pub fn peek_req_num(&self) -> u64 {
        self.next_req_num.get()
    }

    /// Fixed slot assignment by request number.
    #[inline]
    pub fn slot_idx(req_num: u64) -> usize {
        (req_num % SESSION_CREDITS as u64) as usize
    }

    #[inline]
    pub fn has_credits(&self) -> bool {
        self.credits.get() > 0
    }

    pub fn consume_credit(&self) {
        let credits = self.credits.get();
        debug_assert!(credits > 0);
        self.credits.set(credits - 1);
    }

    pub fn return_credit(&self) {
        let credits = self.credits.get();
        debug_assert!(credits < SESSION_CREDITS);
        self.credits.set(credits + 1);
    }

    #[inline]
    pub fn available_credits(&self) -> usize {
        self.credits.get()
    }

    /// Number of client requests currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SSlotState::Outstanding)
            .count()
    }

    /// Arm the management retransmission timer for `pkt_type`.
    pub fn arm_sm_timer(&mut self, pkt_type: SmPktType, rto_ms: u64) {
        self.sm_pending = Some(pkt_type);
        self.sm_retries = 0;
        self.sm_deadline = Instant::now() + std::time::Duration::from_millis(rto_ms);
    }

    /// Disarm the management retransmission timer.
    pub fn disarm_sm_timer(&mut self) {
        self.sm_pending = None;
        self.sm_retries = 0;
    }
}
