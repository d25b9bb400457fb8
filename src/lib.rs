//! # udrpc - RPC over unreliable datagrams
//!
//! This crate implements a low-latency, user-space RPC engine in the style
//! of eRPC (NSDI 2019): request/response multiplexing over an unreliable
//! datagram transport such as an RDMA UD queue pair or a raw Ethernet/UDP
//! socket.
//!
//! ## Features
//!
//! - **Transport-generic datapath**: the engine is parameterized over a
//!   [`Transport`] capability trait; an in-process [`Fabric`] transport is
//!   included for tests and co-located endpoints
//! - **Credit-based flow control**: per-session credits bound the packets
//!   a client keeps in flight
//! - **Multi-packet messages**: fragmentation with explicit credit
//!   returns on the request path and request-for-response pacing on the
//!   response path
//! - **Huge-page message buffers**: a buddy allocator over
//!   `mmap(MAP_HUGETLB)` regions backs all message buffers
//! - **Packet-loss recovery**: an epoch scanner retransmits unacknowledged
//!   packets and fails the session after repeated timeouts
//! - **Background handlers**: long request handlers run on a registry-wide
//!   worker pool without blocking the datapath
//!
//! ## Usage
//!
//! ```no_run
//! use udrpc::{Fabric, Nexus, Rpc, RpcConfig};
//!
//! let nexus = Nexus::new("proc://local");
//! let fabric = Fabric::new();
//!
//! // Server endpoint: echo request type 1.
//! let server = Rpc::new(&nexus, 1, 0, fabric.new_transport(), |_ev| {}, RpcConfig::default())
//!     .unwrap();
//! server.register_req_handler(1, |req| {
//!     let data = req.copy_req_data();
//!     let mut resp = req.alloc_msg_buffer(data.len());
//!     resp.copy_in_data(&data).unwrap();
//!     req.enqueue_response(resp).unwrap();
//! });
//!
//! // Client endpoint.
//! let client = Rpc::new(&nexus, 2, 0, fabric.new_transport(), |_ev| {}, RpcConfig::default())
//!     .unwrap();
//! let session = client.create_session("proc://local", 1, 0).unwrap();
//!
//! // Drive both endpoints until the connect handshake completes.
//! server.run_event_loop_one();
//! client.run_event_loop_one();
//!
//! let mut req = client.alloc_msg_buffer(64);
//! req.copy_in_data(&[0xAB; 64]).unwrap();
//! client
//!     .enqueue_request(session, 1, &req, |resp, _tag| { let _ = resp.copy_data(); }, 0)
//!     .unwrap();
//!
//! loop {
//!     client.run_event_loop_one();
//!     server.run_event_loop_one();
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`packet`]: the 16-byte packet header and packet kinds
//! - [`buffer`]: message buffers with interleaved per-packet header slots
//! - [`alloc`]: the huge-page buddy allocator
//! - [`transport`]: the transport capability trait and the fabric transport
//! - [`session`]: sessions and session slots
//! - [`sm`]: the session-management sub-protocol
//! - [`nexus`]: the per-process registry (inboxes, tiny thread IDs,
//!   background workers)
//! - [`timing`]: cycle-counter timing
//! - [`rpc`]: the endpoint (`Rpc`), event loop and datapath pipelines
//!
//! ## References
//!
//! - [eRPC: Datacenter RPCs can be General and Fast (NSDI 2019)](https://www.usenix.org/conference/nsdi19/presentation/kalia)

pub mod alloc;
pub mod buffer;
pub mod config;
pub mod error;
pub mod nexus;
pub mod packet;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod timing;
pub mod transport;

// Re-export main types
pub use buffer::MsgBuffer;
pub use config::RpcConfig;
pub use error::{Error, Result};
pub use nexus::Nexus;
pub use packet::{PktHdr, PktType, PKT_HDR_SIZE};
pub use rpc::{BgReqHandle, Continuation, ReqHandle, RespHandle, Rpc, MAX_REQ_TYPES};
pub use session::{SessionRole, SessionState, SESSION_REQ_WINDOW};
pub use sm::{SmErrType, SmEvent, SmEventType, SmPkt, SmPktType};
pub use transport::{
    Fabric, FabricStats, FabricTransport, RoutingInfo, RxDesc, Transport, TxBurstItem,
    MAX_ROUTING_INFO_SIZE,
};
