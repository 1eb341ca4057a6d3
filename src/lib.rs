//! # udrpc - RPC over unreliable datagrams
//!
//! This crate implements a user-space, per-thread RPC engine over
//! unreliable datagram transports: request/response messaging with
//! credit-based flow control, multi-packet fragmentation and reassembly,
//! sessions negotiated over an out-of-band UDP management channel, and a
//! cooperative single-threaded event loop per endpoint.
//!
//! ## Features
//!
//! - **Abstract transport**: the engine is parameterized over a small
//!   capability set; `UdpTransport` is the in-tree implementation
//! - **Credit-based flow control**: one credit per in-flight request,
//!   at most `SESSION_CREDITS` per session
//! - **Multi-packet messages**: zero-copy packetization from buffers with
//!   inline headers, in-place reassembly against a bounded
//!   unexpected-packet window
//! - **Out-of-band session management**: connect/disconnect over the
//!   Nexus's UDP channel, with retransmission and idempotent handling
//! - **Background handlers**: optional Nexus worker pool for request
//!   types registered with `run_in_background`
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use udrpc::{Nexus, Ops, Rpc, UdpTransport};
//!
//! let nexus = Arc::new(Nexus::new(31850, 0, 0.0)?);
//! nexus.register_ops(1, Ops::new(req_handler, resp_handler))?;
//!
//! let rpc: Rpc<UdpTransport> =
//!     Rpc::new(&nexus, Box::new(MyContext::default()), 100, sm_handler, 0, 0)?;
//!
//! let session = rpc.create_session(nexus.hostname(), 200, 0)?;
//! // ... run_event_loop_timeout() until the Connected event fires ...
//!
//! let req = rpc.alloc_msg_buffer(4096)?;
//! rpc.enqueue_request(session, 1, &req)?;
//! rpc.run_event_loop_timeout(200);
//! ```
//!
//! ## Architecture
//!
//! - [`packet`]: data packet header (`PktHdr`)
//! - [`sm`]: management wire format and event/error taxonomies
//! - [`buffer`]: message buffers with inline headers (`MsgBuffer`)
//! - [`transport`]: transport capability set and `UdpTransport`
//! - [`session`]: session state and request slots
//! - [`spsc`]: the Nexus-to-endpoint management hook queue
//! - [`timing`]: retransmission timing wheel, TSC calibration
//! - [`nexus`]: process-wide registry and management listener
//! - [`rpc`]: the endpoint engine and event loop

pub mod buffer;
pub mod config;
pub mod error;
pub mod nexus;
pub mod packet;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod spsc;
pub mod timing;
pub mod transport;

pub use buffer::MsgBuffer;
pub use config::{MAX_PKTS_PER_MSG, RpcConfig, SESSION_CREDITS, UNEXP_PKT_WINDOW};
pub use error::{Error, Result};
pub use nexus::{Nexus, Ops, ReqHandler, RespHandler};
pub use packet::{PKT_HDR_SIZE, PktHdr, PktType};
pub use rpc::{AppResp, PktStats, Rpc, SmHandler};
pub use session::SessionState;
pub use sm::{SmErrType, SmEventType};
pub use transport::{RoutingInfo, Transport, UdpTransport};
