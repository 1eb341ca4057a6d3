//! Process-wide Nexus: endpoint registry, handler registry, and the
//! management channel listener.
//!
//! The Nexus owns the management UDP socket. A background thread receives
//! management datagrams and demultiplexes them by destination app TID into
//! per-endpoint SPSC hooks, drained by each endpoint's event loop. An
//! optional worker pool runs request handlers registered with
//! `run_in_background`.

use std::any::Any;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::buffer::MsgBuffer;
use crate::error::{Error, Result};
use crate::rpc::AppResp;
use crate::sm::{SM_PKT_SIZE, SmPkt};
use crate::spsc;
use crate::timing;

/// Server-side request handler: reads the request buffer and produces a
/// response through `AppResp`.
pub type ReqHandler = fn(&MsgBuffer, &mut AppResp, &mut dyn Any);

/// Client-side response handler: receives the request and response
/// buffers. Fires exactly once per accepted request.
pub type RespHandler = fn(&MsgBuffer, &MsgBuffer, &mut dyn Any);

/// Handler registration for one request type.
#[derive(Clone, Copy)]
pub struct Ops {
    pub req_handler: ReqHandler,
    pub resp_handler: RespHandler,
    /// Run the request handler on the Nexus worker pool instead of the
    /// endpoint's event-loop thread. Background handlers receive a unit
    /// context and must be self-contained.
    pub run_in_background: bool,
}

impl Ops {
    pub fn new(req_handler: ReqHandler, resp_handler: RespHandler) -> Self {
        Self {
            req_handler,
            resp_handler,
            run_in_background: false,
        }
    }

    pub fn new_background(req_handler: ReqHandler, resp_handler: RespHandler) -> Self {
        Self {
            req_handler,
            resp_handler,
            run_in_background: true,
        }
    }
}

/// A request moved to the worker pool.
pub(crate) struct BgWork {
    pub req: MsgBuffer,
    pub ops: Ops,
    pub session_num: u16,
    pub req_num: u64,
    pub max_data_per_pkt: usize,
    pub resp_tx: crossbeam_channel::Sender<BgResp>,
}

/// A finished background response, posted back to the owning endpoint.
pub(crate) struct BgResp {
    pub session_num: u16,
    pub req_num: u64,
    /// The request buffer, returned so the endpoint can recycle it.
    pub req: MsgBuffer,
    pub resp: AppResp,
}

/// Capacity of each endpoint's management hook queue.
const SM_HOOK_CAPACITY: usize = 64;

/// Process-wide Nexus.
pub struct Nexus {
    mgmt_port: u16,
    hostname: String,
    freq_ghz: f64,
    hooks: Arc<Mutex<HashMap<u32, spsc::Producer<SmPkt>>>>,
    ops: Mutex<HashMap<u8, Ops>>,
    /// Set once the first endpoint is created; registration is then closed.
    ops_frozen: AtomicBool,
    shutdown: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    bg_tx: Option<crossbeam_channel::Sender<BgWork>>,
    workers: Vec<JoinHandle<()>>,
}

impl Nexus {
    /// Create a Nexus listening for management datagrams on
    /// `mgmt_udp_port`, with `num_bg_threads` background workers.
    /// `pkt_drop_prob` drops that fraction of received management packets,
    /// for exercising retransmission in tests.
    pub fn new(mgmt_udp_port: u16, num_bg_threads: usize, pkt_drop_prob: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&pkt_drop_prob) {
            return Err(Error::InvalidConfig(format!(
                "pkt_drop_prob {} out of range",
                pkt_drop_prob
            )));
        }

        let sock = UdpSocket::bind(("0.0.0.0", mgmt_udp_port))?;
        sock.set_read_timeout(Some(Duration::from_millis(50)))?;
        let mgmt_port = sock.local_addr()?.port();

        let hooks: Arc<Mutex<HashMap<u32, spsc::Producer<SmPkt>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let listener = {
            let hooks = Arc::clone(&hooks);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("udrpc-sm".into())
                .spawn(move || listener_loop(sock, hooks, shutdown, pkt_drop_prob))
                .map_err(Error::Io)?
        };

        let (bg_tx, workers) = if num_bg_threads > 0 {
            let (tx, rx) = crossbeam_channel::unbounded::<BgWork>();
            let workers = (0..num_bg_threads)
                .map(|i| {
                    let rx = rx.clone();
                    std::thread::Builder::new()
                        .name(format!("udrpc-bg-{}", i))
                        .spawn(move || worker_loop(rx))
                        .map_err(Error::Io)
                })
                .collect::<Result<Vec<_>>>()?;
            (Some(tx), workers)
        } else {
            (None, Vec::new())
        };

        Ok(Self {
            mgmt_port,
            hostname: Self::get_hostname(),
            freq_ghz: timing::measure_freq_ghz(),
            hooks,
            ops: Mutex::new(HashMap::new()),
            ops_frozen: AtomicBool::new(false),
            shutdown,
            listener: Some(listener),
            bg_tx,
            workers,
        })
    }

    /// The canonical local hostname used as session endpoint address.
    pub fn get_hostname() -> String {
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// This Nexus's hostname.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The management UDP port.
    pub fn mgmt_port(&self) -> u16 {
        self.mgmt_port
    }

    /// Calibrated TSC frequency in GHz.
    pub fn freq_ghz(&self) -> f64 {
        self.freq_ghz
    }

    /// Register handlers for a request type. Must be called before any
    /// endpoint is created; re-registration is an error.
    pub fn register_ops(&self, req_type: u8, ops: Ops) -> Result<()> {
        if self.ops_frozen.load(Ordering::Acquire) {
            return Err(Error::OpsFrozen);
        }
        let mut map = self.ops.lock().unwrap();
        if map.contains_key(&req_type) {
            return Err(Error::AlreadyRegistered(req_type));
        }
        map.insert(req_type, ops);
        Ok(())
    }

    /// Snapshot of the handler registry, taken by each endpoint at
    /// construction. Freezes registration.
    pub(crate) fn ops_snapshot(&self) -> HashMap<u8, Ops> {
        self.ops_frozen.store(true, Ordering::Release);
        self.ops.lock().unwrap().clone()
    }

    /// Attach a management hook for `app_tid`, delivering that endpoint's
    /// management datagrams.
    pub(crate) fn register_hook(&self, app_tid: u32) -> Result<spsc::Consumer<SmPkt>> {
        let mut hooks = self.hooks.lock().unwrap();
        if hooks.contains_key(&app_tid) {
            return Err(Error::DuplicateAppTid(app_tid));
        }
        let (tx, rx) = spsc::channel(SM_HOOK_CAPACITY);
        hooks.insert(app_tid, tx);
        Ok(rx)
    }

    /// Detach the management hook for `app_tid`.
    pub(crate) fn unregister_hook(&self, app_tid: u32) {
        self.hooks.lock().unwrap().remove(&app_tid);
    }

    /// True if a worker pool exists.
    pub fn has_bg_threads(&self) -> bool {
        self.bg_tx.is_some()
    }

    /// Hand a request to the worker pool. Returns false if no pool exists.
    pub(crate) fn submit_bg(&self, work: BgWork) -> bool {
        match &self.bg_tx {
            Some(tx) => tx.send(work).is_ok(),
            None => false,
        }
    }

    /// Resolve a peer hostname to its management socket address. The local
    /// hostname short-circuits to loopback.
    pub(crate) fn resolve_mgmt_addr(&self, host: &str) -> Result<SocketAddr> {
        let host = if host == self.hostname { "127.0.0.1" } else { host };
        (host, self.mgmt_port)
            .to_socket_addrs()
            .map_err(|e| Error::RoutingResolution(format!("{}: {}", host, e)))?
            .next()
            .ok_or_else(|| Error::RoutingResolution(format!("no address for {}", host)))
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        // The listener must stop before the hook queues are destroyed.
        self.shutdown.store(true, Ordering::Release);
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
        self.bg_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn listener_loop(
    sock: UdpSocket,
    hooks: Arc<Mutex<HashMap<u32, spsc::Producer<SmPkt>>>>,
    shutdown: Arc<AtomicBool>,
    pkt_drop_prob: f64,
) {
    let mut buf = [0u8; 2 * SM_PKT_SIZE];
    let mut rng = rand::rng();

    while !shutdown.load(Ordering::Acquire) {
        let n = match sock.recv_from(&mut buf) {
            Ok((n, _src)) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "management socket error");
                continue;
            }
        };

        let pkt = match SmPkt::deserialize(&buf[..n]) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!(error = %e, len = n, "dropping malformed management datagram");
                continue;
            }
        };

        if pkt_drop_prob > 0.0 && rng.random::<f64>() < pkt_drop_prob {
            trace!(?pkt, "dropping management datagram (fault injection)");
            continue;
        }

        let mut hooks = hooks.lock().unwrap();
        match hooks.get_mut(&pkt.dst_app_tid()) {
            Some(hook) => {
                if hook.try_send(pkt).is_err() {
                    warn!(
                        dst_app_tid = pkt.dst_app_tid(),
                        "management hook full, dropping datagram"
                    );
                }
            }
            None => {
                debug!(
                    dst_app_tid = pkt.dst_app_tid(),
                    "no endpoint for management datagram"
                );
            }
        }
    }
}

fn worker_loop(rx: crossbeam_channel::Receiver<BgWork>) {
    // The channel closing is the shutdown signal.
    while let Ok(work) = rx.recv() {
        let mut app_resp = AppResp::background(work.max_data_per_pkt);
        let mut unit_ctx = ();
        (work.ops.req_handler)(&work.req, &mut app_resp, &mut unit_ctx);
        let resp = BgResp {
            session_num: work.session_num,
            req_num: work.req_num,
            req: work.req,
            resp: app_resp,
        };
        if work.resp_tx.send(resp).is_err() {
            debug!("endpoint gone before background response delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::{SmEndpoint, SmErrType, SmPktType};
    use crate::transport::RoutingInfo;

    fn test_req_handler(_req: &MsgBuffer, _resp: &mut AppResp, _ctx: &mut dyn Any) {}
    fn test_resp_handler(_req: &MsgBuffer, _resp: &MsgBuffer, _ctx: &mut dyn Any) {}

    #[test]
    fn test_register_ops_rules() {
        let nexus = Nexus::new(0, 0, 0.0).unwrap();
        let ops = Ops::new(test_req_handler, test_resp_handler);

        nexus.register_ops(3, ops).unwrap();
        assert!(matches!(
            nexus.register_ops(3, ops),
            Err(Error::AlreadyRegistered(3))
        ));

        // Creating an endpoint snapshot freezes registration.
        let snapshot = nexus.ops_snapshot();
        assert!(snapshot.contains_key(&3));
        assert!(matches!(nexus.register_ops(4, ops), Err(Error::OpsFrozen)));
    }

    #[test]
    fn test_hook_registration() {
        let nexus = Nexus::new(0, 0, 0.0).unwrap();
        let _rx = nexus.register_hook(7).unwrap();
        assert!(matches!(
            nexus.register_hook(7),
            Err(Error::DuplicateAppTid(7))
        ));
        nexus.unregister_hook(7);
        let _rx2 = nexus.register_hook(7).unwrap();
    }

    #[test]
    fn test_hostname_and_freq() {
        let nexus = Nexus::new(0, 0, 0.0).unwrap();
        assert!(!nexus.hostname().is_empty());
        assert!(nexus.freq_ghz() > 0.0);
        assert!(nexus.resolve_mgmt_addr(nexus.hostname()).is_ok());
    }

    #[test]
    fn test_mgmt_demux() {
        let nexus = Nexus::new(0, 0, 0.0).unwrap();
        let mut rx = nexus.register_hook(42).unwrap();

        let pkt = SmPkt {
            pkt_type: SmPktType::ConnectReq,
            err: SmErrType::NoError,
            client: SmEndpoint::new("client", 1, 0, 0),
            server: SmEndpoint::new("server", 42, 0, 0),
            client_routing: RoutingInfo::empty(),
            server_routing: RoutingInfo::empty(),
        };

        let sock = UdpSocket::bind(("0.0.0.0", 0)).unwrap();
        sock.send_to(&pkt.serialize(), ("127.0.0.1", nexus.mgmt_port()))
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let got = loop {
            if let Some(pkt) = rx.try_recv() {
                break pkt;
            }
            assert!(std::time::Instant::now() < deadline, "demux timed out");
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(got.pkt_type, SmPktType::ConnectReq);
        assert_eq!(got.server.app_tid, 42);
    }
}
