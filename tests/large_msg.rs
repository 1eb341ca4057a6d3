//! Multi-packet RPC tests: round-trip identity for large messages,
//! pipeline saturation, and fanout past the unexpected-packet window.

mod common;

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use rand::Rng;

use common::*;
use udrpc::{
    AppResp, MsgBuffer, Nexus, Ops, Rpc, SESSION_CREDITS, SessionState, SmErrType, SmEventType,
    UNEXP_PKT_WINDOW,
};

const REQ_TYPE: u8 = 3;

#[derive(Default)]
struct ClientContext {
    num_sm_connect_resps: usize,
    num_rpc_resps: usize,
}

/// Copies the request bytes into the response: the preallocated buffer
/// when the response fits in one packet, a dynamic buffer otherwise.
fn req_handler(req: &MsgBuffer, resp: &mut AppResp, _ctx: &mut dyn Any) {
    let data = req.data();
    if let Some(pre) = resp.prealloc_mut(data.len()) {
        pre.data_mut().copy_from_slice(data);
    } else {
        let dyn_buf = resp.alloc_dyn(data.len()).unwrap();
        dyn_buf.data_mut().copy_from_slice(data);
    }
}

/// Checks round-trip identity and counts the response.
fn resp_handler(req: &MsgBuffer, resp: &MsgBuffer, ctx: &mut dyn Any) {
    let ctx = ctx.downcast_mut::<ClientContext>().unwrap();
    assert_eq!(req.data_size(), resp.data_size());
    assert_eq!(req.data(), resp.data());
    ctx.num_rpc_resps += 1;
}

fn sm_handler(_session_num: i32, event: SmEventType, err: SmErrType, ctx: &mut dyn Any) {
    let ctx = ctx.downcast_mut::<ClientContext>().unwrap();
    ctx.num_sm_connect_resps += 1;
    assert_eq!(err, SmErrType::NoError);
    assert!(matches!(
        event,
        SmEventType::Connected | SmEventType::Disconnected
    ));
}

fn server_sm_handler(_session_num: i32, _event: SmEventType, _err: SmErrType, _ctx: &mut dyn Any) {
    panic!("server endpoint must not receive session management events");
}

fn server_thread(nexus: Arc<Nexus>, app_tid: u32, flags: Arc<Flags>) {
    let rpc: TestRpc = Rpc::new(
        &nexus,
        Box::new(()),
        app_tid,
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

/// Launch one server endpoint per client session plus the client, with
/// `num_bg_threads` Nexus workers (handlers run in the background when
/// nonzero).
fn launch(
    mgmt_port: u16,
    num_sessions: usize,
    num_bg_threads: usize,
    client_fn: fn(&TestRpc, &Nexus, &[i32]),
) {
    init_tracing();
    let nexus = Arc::new(Nexus::new(mgmt_port, num_bg_threads, 0.0).unwrap());
    let ops = if num_bg_threads == 0 {
        Ops::new(req_handler, resp_handler)
    } else {
        Ops::new_background(req_handler, resp_handler)
    };
    nexus.register_ops(REQ_TYPE, ops).unwrap();

    let flags = Arc::new(Flags::default());
    let servers: Vec<_> = (0..num_sessions)
        .map(|i| {
            let nexus = Arc::clone(&nexus);
            let flags = Arc::clone(&flags);
            std::thread::spawn(move || server_thread(nexus, SERVER_APP_TID + i as u32, flags))
        })
        .collect();
    flags.wait_servers_ready(num_sessions);

    let client = {
        let nexus = Arc::clone(&nexus);
        let flags = Arc::clone(&flags);
        std::thread::spawn(move || {
            let _done = DoneGuard(Arc::clone(&flags));
            let rpc: TestRpc = Rpc::new(
                &nexus,
                Box::new(ClientContext::default()),
                CLIENT_APP_TID,
                sm_handler,
                PHY_PORT,
                NUMA_NODE,
            )
            .unwrap();

            let sessions = connect_sessions(&rpc, &nexus, num_sessions);
            client_fn(&rpc, &nexus, &sessions);

            for &session in &sessions {
                let _ = rpc.destroy_session(session);
            }
            rpc.run_event_loop_timeout(EVENT_LOOP_MS);
        })
    };

    client.join().expect("client thread failed");
    for server in servers {
        server.join().expect("server thread failed");
    }
}

fn connect_sessions(rpc: &TestRpc, nexus: &Nexus, num_sessions: usize) -> Vec<i32> {
    let sessions: Vec<i32> = (0..num_sessions)
        .map(|i| {
            rpc.create_session(nexus.hostname(), SERVER_APP_TID + i as u32, PHY_PORT)
                .unwrap()
        })
        .collect();

    wait_for(rpc, nexus.freq_ghz(), || {
        rpc.context_ref::<ClientContext>().num_sm_connect_resps >= num_sessions
    });
    assert_eq!(
        rpc.context_ref::<ClientContext>().num_sm_connect_resps,
        num_sessions
    );
    for &session in &sessions {
        assert_eq!(rpc.session_state(session), Some(SessionState::Connected));
    }
    sessions
}

/// A message size needing at least two packets.
fn pick_large_msg_size(rpc: &TestRpc, rng: &mut impl Rng) -> usize {
    let min = rpc.max_data_per_pkt() + 1;
    rng.random_range(min..=rpc.max_msg_size())
}

/// Send one large request and check the response matches byte for byte.
fn one_large_rpc(rpc: &TestRpc, nexus: &Nexus, sessions: &[i32]) {
    let session = sessions[0];
    let req_size = rpc.max_data_per_pkt() + 1;
    let mut req = rpc.alloc_msg_buffer(req_size).unwrap();

    let data = req.data_mut();
    data.fill(b'a');
    data[req_size - 1] = 0;

    rpc.enqueue_request(session, REQ_TYPE, &req).unwrap();
    wait_for(rpc, nexus.freq_ghz(), || {
        rpc.context_ref::<ClientContext>().num_rpc_resps >= 1
    });
    assert_eq!(rpc.context_ref::<ClientContext>().num_rpc_resps, 1);

    rpc.free_msg_buffer(req);
}

#[test]
fn test_one_large_rpc() {
    launch(31861, 1, 0, one_large_rpc);
}

#[test]
fn test_one_large_rpc_bg() {
    launch(31862, 1, 1, one_large_rpc);
}

/// Saturate one session: exactly `SESSION_CREDITS` random-size large
/// requests, the next enqueue rejected, all responses matching.
fn multi_large_rpc_one_session(rpc: &TestRpc, nexus: &Nexus, sessions: &[i32]) {
    let session = sessions[0];
    let mut rng = rand::rng();

    // Pre-create the request buffers to exercise reuse and resizing.
    let mut bufs: Vec<MsgBuffer> = (0..SESSION_CREDITS)
        .map(|_| rpc.alloc_msg_buffer(rpc.max_msg_size()).unwrap())
        .collect();

    for _iter in 0..2 {
        rpc.context_mut::<ClientContext>().num_rpc_resps = 0;

        for i in 0..SESSION_CREDITS {
            let req_len = pick_large_msg_size(rpc, &mut rng);
            rpc.resize_msg_buffer(&mut bufs[i], req_len).unwrap();

            let data = bufs[i].data_mut();
            for (j, byte) in data.iter_mut().enumerate() {
                *byte = b'a' + ((i + j) % 26) as u8;
            }
            data[req_len - 1] = 0;

            rpc.enqueue_request(session, REQ_TYPE, &bufs[i]).unwrap();
        }

        // The session's credits are exhausted now.
        assert!(rpc.enqueue_request(session, REQ_TYPE, &bufs[0]).is_err());

        wait_for(rpc, nexus.freq_ghz(), || {
            rpc.context_ref::<ClientContext>().num_rpc_resps >= SESSION_CREDITS
        });
        assert_eq!(
            rpc.context_ref::<ClientContext>().num_rpc_resps,
            SESSION_CREDITS
        );
    }

    for buf in bufs {
        rpc.free_msg_buffer(buf);
    }
}

#[test]
fn test_multi_large_rpc_one_session() {
    launch(31863, 1, 0, multi_large_rpc_one_session);
}

/// Fanout across enough sessions to exceed the unexpected-packet window,
/// reusing the same buffers every iteration.
fn multi_large_rpc_multi_session(rpc: &TestRpc, nexus: &Nexus, sessions: &[i32]) {
    let mut rng = rand::rng();
    let tot_reqs_per_iter = sessions.len() * SESSION_CREDITS;

    let mut bufs: Vec<MsgBuffer> = (0..tot_reqs_per_iter)
        .map(|_| rpc.alloc_msg_buffer(rpc.max_msg_size()).unwrap())
        .collect();

    for _iter in 0..5 {
        rpc.context_mut::<ClientContext>().num_rpc_resps = 0;

        for (sess_i, &session) in sessions.iter().enumerate() {
            for crd_i in 0..SESSION_CREDITS {
                let req_i = sess_i * SESSION_CREDITS + crd_i;
                let req_len = pick_large_msg_size(rpc, &mut rng);
                rpc.resize_msg_buffer(&mut bufs[req_i], req_len).unwrap();

                let data = bufs[req_i].data_mut();
                for (j, byte) in data.iter_mut().enumerate() {
                    *byte = b'a' + ((req_i + j) % 26) as u8;
                }
                data[req_len - 1] = 0;

                rpc.enqueue_request(session, REQ_TYPE, &bufs[req_i]).unwrap();
            }
        }

        wait_for(rpc, nexus.freq_ghz(), || {
            rpc.context_ref::<ClientContext>().num_rpc_resps >= tot_reqs_per_iter
        });
        assert_eq!(
            rpc.context_ref::<ClientContext>().num_rpc_resps,
            tot_reqs_per_iter
        );
    }

    for buf in bufs {
        rpc.free_msg_buffer(buf);
    }
}

#[test]
fn test_multi_large_rpc_multi_session() {
    // Enough sessions to exceed the client's unexpected-packet window.
    let num_sessions = (UNEXP_PKT_WINDOW / SESSION_CREDITS) + 2;
    launch(31864, num_sessions, 0, multi_large_rpc_multi_session);
}
