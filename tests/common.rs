//! Common utilities for udrpc integration tests.

#![allow(dead_code)]

use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use udrpc::timing;
use udrpc::{Rpc, UdpTransport};

pub type TestRpc = Rpc<UdpTransport>;

/// Event loop slice used by all tests, milliseconds.
pub const EVENT_LOOP_MS: u64 = 100;

/// Overall per-wait cap, milliseconds.
pub const MAX_EVENT_LOOP_MS: u64 = 10_000;

pub const PHY_PORT: u8 = 0;
pub const NUMA_NODE: usize = 0;
pub const CLIENT_APP_TID: u32 = 100;
pub const SERVER_APP_TID: u32 = 200;

/// Client/server thread synchronization.
#[derive(Default)]
pub struct Flags {
    pub ready_servers: AtomicUsize,
    pub client_done: AtomicBool,
}

impl Flags {
    pub fn wait_servers_ready(&self, n: usize) {
        while self.ready_servers.load(Ordering::Acquire) < n {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

/// Marks the client done even if the client thread panics, so server
/// threads always terminate.
pub struct DoneGuard(pub Arc<Flags>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.client_done.store(true, Ordering::Release);
    }
}

/// Run the event loop until `cond` holds or the cap elapses.
pub fn wait_for<F: FnMut() -> bool>(rpc: &TestRpc, freq_ghz: f64, mut cond: F) {
    let start = timing::rdtsc();
    while !cond() {
        rpc.run_event_loop_timeout(EVENT_LOOP_MS);
        if timing::to_msec(timing::rdtsc() - start, freq_ghz) > MAX_EVENT_LOOP_MS as f64 {
            break;
        }
    }
}

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
