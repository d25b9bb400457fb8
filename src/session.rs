//! Sessions and session slots.
//!
//! A session is a connected channel between two endpoints. Each session
//! carries a fixed window of [`SSlot`]s, one per concurrent
//! request/response exchange; the low bits of a request number are the
//! slot index, the high bits count wrap epochs.

use std::sync::Mutex;

use crate::buffer::MsgBuffer;
use crate::rpc::Continuation;
use crate::transport::RoutingInfo;

/// Concurrent requests per session. A power of two, so request-number low
/// bits index a slot directly.
pub const SESSION_REQ_WINDOW: usize = 8;

/// Session role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    ConnectInProgress,
    Connected,
    DisconnectInProgress,
    Disconnected,
}

/// One endpoint of a session, as carried in session-management packets.
#[derive(Debug, Clone)]
pub struct SessionEndpoint {
    pub hostname: String,
    pub rpc_id: u8,
    pub phy_port: u8,
    pub session_num: u16,
    pub routing_info: RoutingInfo,
}

/// Bitmap over the packets of one message, sized on demand.
#[derive(Debug, Default)]
pub(crate) struct PktBitmap {
    words: Vec<u64>,
}

impl PktBitmap {
    pub fn reset(&mut self, num_pkts: usize) {
        self.words.clear();
        self.words.resize(num_pkts.div_ceil(64), 0);
    }

    /// Mark packet `i`; returns false if it was already marked.
    pub fn mark(&mut self, i: usize) -> bool {
        let (w, b) = (i / 64, i % 64);
        if w >= self.words.len() {
            return false;
        }
        let mask = 1u64 << b;
        if self.words[w] & mask != 0 {
            return false;
        }
        self.words[w] |= mask;
        true
    }

    pub fn get(&self, i: usize) -> bool {
        let (w, b) = (i / 64, i % 64);
        w < self.words.len() && self.words[w] & (1 << b) != 0
    }

    pub fn mark_all(&mut self) {
        for w in &mut self.words {
            *w = u64::MAX;
        }
    }
}

/// One in-flight request/response exchange.
pub(crate) struct SSlot {
    /// Position in the session's slot array.
    pub index: usize,
    /// Current request number; low bits equal `index`.
    pub req_num: u64,
    pub req_type: u8,
    /// Transmit buffer: the client's request view, or the server's
    /// enqueued response. None once buried.
    pub tx_msgbuf: Option<MsgBuffer>,
    /// Receive side: reassembly buffer for multi-packet messages.
    pub rx_msgbuf: MsgBuffer,
    /// Client continuation, taken when the response completes.
    pub cont: Option<Continuation>,
    pub tag: usize,
    /// Request packets handed to the transport so far (client).
    pub pkts_queued: usize,
    /// Fragments expected for the in-progress incoming message.
    pub expected_pkts: usize,
    /// Fragments received toward `expected_pkts`.
    pub pkts_rx: usize,
    /// Client: request packets acknowledged (credit returns / response).
    /// Server: request fragments seen, for duplicate detection.
    pub acked: PktBitmap,
    /// First-send timestamp in cycles; 0 until the first packet leaves.
    pub tx_ts: u64,
    pub retries: u32,
    /// Server: a response for `req_num` is enqueued in `tx_msgbuf`.
    pub finished: bool,
}

impl SSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            req_num: index as u64,
            req_type: 0,
            tx_msgbuf: None,
            rx_msgbuf: MsgBuffer::invalid(),
            cont: None,
            tag: 0,
            pkts_queued: 0,
            expected_pkts: 0,
            pkts_rx: 0,
            acked: PktBitmap::default(),
            tx_ts: 0,
            retries: 0,
            finished: false,
        }
    }

    /// Reset per-exchange progress, keeping `req_num` and buffers.
    pub fn reset_progress(&mut self) {
        self.pkts_queued = 0;
        self.expected_pkts = 0;
        self.pkts_rx = 0;
        self.tx_ts = 0;
        self.retries = 0;
        self.finished = false;
    }
}

/// Per-peer session state.
pub(crate) struct Session {
    pub role: SessionRole,
    pub state: SessionState,
    pub local: SessionEndpoint,
    pub remote: SessionEndpoint,
    /// Client-side credit counter, bounded by the configured credits.
    pub credits: usize,
    pub sslots: Vec<SSlot>,
    /// Free slot indices. Locked because a continuation running on a
    /// background worker may release a slot while the creator enqueues.
    pub free_stack: Mutex<Vec<usize>>,
}

impl Session {
    pub fn new(
        role: SessionRole,
        local: SessionEndpoint,
        remote: SessionEndpoint,
        credits: usize,
    ) -> Self {
        let sslots = (0..SESSION_REQ_WINDOW).map(SSlot::new).collect();
        let free = if role == SessionRole::Client {
            (0..SESSION_REQ_WINDOW).rev().collect()
        } else {
            Vec::new()
        };
        Self {
            role,
            state: SessionState::ConnectInProgress,
            local,
            remote,
            credits,
            sslots,
            free_stack: Mutex::new(free),
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    /// Slot index for a request number.
    #[inline]
    pub fn slot_of(req_num: u64) -> usize {
        (req_num & (SESSION_REQ_WINDOW as u64 - 1)) as usize
    }

    pub fn free_slots(&self) -> usize {
        self.free_stack.lock().unwrap().len()
    }

    pub fn in_flight(&self) -> usize {
        SESSION_REQ_WINDOW - self.free_slots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(n: u16) -> SessionEndpoint {
        SessionEndpoint {
            hostname: "proc://test".to_string(),
            rpc_id: 1,
            phy_port: 0,
            session_num: n,
            routing_info: RoutingInfo::default(),
        }
    }

    #[test]
    fn test_slot_conservation_at_rest() {
        let s = Session::new(SessionRole::Client, endpoint(0), endpoint(1), 8);
        assert_eq!(s.free_slots() + s.in_flight(), SESSION_REQ_WINDOW);
        assert_eq!(s.in_flight(), 0);
    }

    #[test]
    fn test_req_num_low_bits_are_slot_index() {
        let mut s = Session::new(SessionRole::Client, endpoint(0), endpoint(1), 8);
        for idx in 0..SESSION_REQ_WINDOW {
            let prev = s.sslots[idx].req_num;
            s.sslots[idx].req_num += SESSION_REQ_WINDOW as u64;
            let next = s.sslots[idx].req_num;
            assert_eq!(next, prev + SESSION_REQ_WINDOW as u64);
            assert_eq!(Session::slot_of(next), idx);
            assert_eq!(Session::slot_of(prev), idx);
        }
    }

    #[test]
    fn test_window_is_power_of_two() {
        assert!(SESSION_REQ_WINDOW.is_power_of_two());
    }

    #[test]
    fn test_pkt_bitmap() {
        let mut bm = PktBitmap::default();
        bm.reset(130);
        assert!(!bm.get(0));
        assert!(bm.mark(0));
        assert!(!bm.mark(0));
        assert!(bm.mark(129));
        assert!(bm.get(129));
        assert!(!bm.get(128));
        bm.mark_all();
        assert!(bm.get(64));
        bm.reset(4);
        assert!(!bm.get(0));
    }

    #[test]
    fn test_server_session_has_no_free_stack() {
        let s = Session::new(SessionRole::Server, endpoint(0), endpoint(1), 8);
        assert_eq!(s.free_slots(), 0);
    }
}
