//! Session lifecycle tests: connect, disconnect, and the failure paths.
//!
//! Each test launches a server endpoint on its own thread and drives a
//! client endpoint through the session management state machine, checking
//! the events delivered to the management callback.

mod common;

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::*;
use udrpc::{Nexus, Rpc, SessionState, SmErrType, SmEventType};

/// Expected values for the next session management callback.
#[derive(Default)]
struct AppContext {
    exp_event: Option<SmEventType>,
    exp_err: Option<SmErrType>,
    exp_session_num: i32,
    num_sm_events: usize,
}

impl AppContext {
    fn arm(&mut self, event: SmEventType, err: SmErrType, session_num: i32) {
        self.num_sm_events = 0;
        self.exp_event = Some(event);
        self.exp_err = Some(err);
        self.exp_session_num = session_num;
    }
}

fn sm_handler(session_num: i32, event: SmEventType, err: SmErrType, ctx: &mut dyn Any) {
    let ctx = ctx.downcast_mut::<AppContext>().unwrap();
    ctx.num_sm_events += 1;
    assert_eq!(Some(event), ctx.exp_event);
    assert_eq!(Some(err), ctx.exp_err);
    assert_eq!(session_num, ctx.exp_session_num);
}

fn server_sm_handler(_session_num: i32, _event: SmEventType, _err: SmErrType, _ctx: &mut dyn Any) {
    panic!("server endpoint must not receive session management events");
}

fn server_thread(nexus: Arc<Nexus>, flags: Arc<Flags>) {
    let rpc: TestRpc = Rpc::new(
        &nexus,
        Box::new(()),
        SERVER_APP_TID,
        server_sm_handler,
        PHY_PORT,
        NUMA_NODE,
    )
    .unwrap();
    flags.ready_servers.fetch_add(1, Ordering::Release);

    while !flags.client_done.load(Ordering::Acquire) {
        rpc.run_event_loop_timeout(EVENT_LOOP_MS);
    }
    assert_eq!(rpc.num_active_sessions(), 0);
}

fn launch(mgmt_port: u16, client_fn: fn(Arc<Nexus>, Arc<Flags>)) {
    init_tracing();
    let nexus = Arc::new(Nexus::new(mgmt_port, 0, 0.0).unwrap());
    let flags = Arc::new(Flags::default());

    let server = {
        let nexus = Arc::clone(&nexus);
        let flags = Arc::clone(&flags);
        std::thread::spawn(move || server_thread(nexus, flags))
    };
    flags.wait_servers_ready(1);

    let client = {
        let nexus = Arc::clone(&nexus);
        let flags = Arc::clone(&flags);
        std::thread::spawn(move || client_fn(nexus, flags))
    };

    client.join().expect("client thread failed");
    server.join().expect("server thread failed");
}

fn make_client(nexus: &Arc<Nexus>) -> TestRpc {
    Rpc::new(
        nexus,
        Box::new(AppContext::default()),
        CLIENT_APP_TID,
        sm_handler,
        PHY_PORT,
        NUMA_NODE,
    )
    .unwrap()
}

fn wait_for_sm_events(rpc: &TestRpc, freq_ghz: f64, n: usize) {
    wait_for(rpc, freq_ghz, || {
        rpc.context_ref::<AppContext>().num_sm_events >= n
    });
}

/// Simple successful disconnection of one session, and other simple tests.
fn simple_disconnect(nexus: Arc<Nexus>, flags: Arc<Flags>) {
    let _done = DoneGuard(Arc::clone(&flags));
    let rpc = make_client(&nexus);

    let session_num = rpc
        .create_session(nexus.hostname(), SERVER_APP_TID, PHY_PORT)
        .unwrap();
    assert!(session_num >= 0);

    // Early disconnect while the connect is in flight is rejected.
    assert!(rpc.destroy_session(session_num).is_err());

    rpc.context_mut::<AppContext>()
        .arm(SmEventType::Connected, SmErrType::NoError, session_num);
    wait_for_sm_events(&rpc, nexus.freq_ghz(), 1);
    assert_eq!(rpc.context_ref::<AppContext>().num_sm_events, 1);
    assert_eq!(rpc.session_state(session_num), Some(SessionState::Connected));
    assert_eq!(rpc.num_active_sessions(), 1);

    rpc.context_mut::<AppContext>()
        .arm(SmEventType::Disconnected, SmErrType::NoError, session_num);
    rpc.destroy_session(session_num).unwrap();
    wait_for_sm_events(&rpc, nexus.freq_ghz(), 1);
    assert_eq!(rpc.context_ref::<AppContext>().num_sm_events, 1);
    assert_eq!(rpc.num_active_sessions(), 0);

    // Disconnecting again fails, as does an invalid handle.
    assert!(rpc.destroy_session(session_num).is_err());
    assert!(rpc.destroy_session(-1).is_err());
}

#[test]
fn test_simple_disconnect() {
    launch(31851, simple_disconnect);
}

/// Repeat: create a session to the server and disconnect it.
fn disconnect_multi(nexus: Arc<Nexus>, flags: Arc<Flags>) {
    let _done = DoneGuard(Arc::clone(&flags));
    let rpc = make_client(&nexus);

    for _ in 0..3 {
        let session_num = rpc
            .create_session(nexus.hostname(), SERVER_APP_TID, PHY_PORT)
            .unwrap();
        assert!(session_num >= 0);

        rpc.context_mut::<AppContext>()
            .arm(SmEventType::Connected, SmErrType::NoError, session_num);
        wait_for_sm_events(&rpc, nexus.freq_ghz(), 1);
        assert_eq!(rpc.context_ref::<AppContext>().num_sm_events, 1);

        rpc.context_mut::<AppContext>()
            .arm(SmEventType::Disconnected, SmErrType::NoError, session_num);
        rpc.destroy_session(session_num).unwrap();
        wait_for_sm_events(&rpc, nexus.freq_ghz(), 1);
        assert_eq!(rpc.context_ref::<AppContext>().num_sm_events, 1);

        assert_eq!(rpc.num_active_sessions(), 0);
    }
}

#[test]
fn test_disconnect_multi() {
    launch(31852, disconnect_multi);
}

/// Disconnect a session that encountered a remote error. The server has no
/// resources for it, so the slot is buried immediately.
fn disconnect_remote_error(nexus: Arc<Nexus>, flags: Arc<Flags>) {
    let _done = DoneGuard(Arc::clone(&flags));
    let rpc = make_client(&nexus);

    // An invalid remote port is refused by the server.
    let session_num = rpc
        .create_session(nexus.hostname(), SERVER_APP_TID, PHY_PORT + 1)
        .unwrap();
    assert!(session_num >= 0);

    rpc.context_mut::<AppContext>().arm(
        SmEventType::ConnectFailed,
        SmErrType::InvalidRemotePort,
        session_num,
    );
    wait_for_sm_events(&rpc, nexus.freq_ghz(), 1);
    assert_eq!(rpc.context_ref::<AppContext>().num_sm_events, 1);

    assert_eq!(rpc.num_active_sessions(), 0);
    assert_eq!(rpc.session_state(session_num), None);
}

#[test]
fn test_disconnect_remote_error() {
    launch(31853, disconnect_remote_error);
}

/// The client fails to resolve the server's routing info while processing
/// the connect response. The engine then frees the server's mirror session
/// with a callback-less disconnect.
fn disconnect_local_error(nexus: Arc<Nexus>, flags: Arc<Flags>) {
    let _done = DoneGuard(Arc::clone(&flags));
    let rpc = make_client(&nexus);

    rpc.set_fault_fail_resolve_routing(true);

    let session_num = rpc
        .create_session(nexus.hostname(), SERVER_APP_TID, PHY_PORT)
        .unwrap();
    rpc.context_mut::<AppContext>().arm(
        SmEventType::ConnectFailed,
        SmErrType::RoutingResolutionFailure,
        session_num,
    );
    wait_for_sm_events(&rpc, nexus.freq_ghz(), 1);
    assert_eq!(rpc.context_ref::<AppContext>().num_sm_events, 1);

    // The session lingers in DisconnectInProgress until the server
    // acknowledges the resource release; no further callback fires.
    if let Some(state) = rpc.session_state(session_num) {
        assert_eq!(state, SessionState::DisconnectInProgress);
    }
    rpc.run_event_loop_timeout(EVENT_LOOP_MS);
    assert_eq!(rpc.num_active_sessions(), 0);
}

#[test]
fn test_disconnect_local_error() {
    launch(31854, disconnect_local_error);
}
