//! The transport capability interface and the in-process fabric transport.
//!
//! The engine consumes an unreliable datagram transport through the
//! [`Transport`] trait: a per-packet payload limit, a post-list depth, a
//! receive-ring depth, burst-mode transmit and receive, receive
//! replenishment, and a routing-info codec. NIC-backed implementations
//! (RDMA UD, raw Ethernet) live outside this crate; [`FabricTransport`]
//! provides an in-process datagram fabric for tests, benches and
//! co-located endpoints.

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::packet::{PktHdr, PktType, PKT_HDR_SIZE};

/// Serialized routing-info size. Routing blobs travel inside
/// session-management packets, so they are fixed-size and opaque.
pub const MAX_ROUTING_INFO_SIZE: usize = 32;

/// Opaque, wire-serializable routing information for one endpoint.
#[derive(Clone, Copy)]
pub struct RoutingInfo {
    pub buf: [u8; MAX_ROUTING_INFO_SIZE],
}

impl Default for RoutingInfo {
    fn default() -> Self {
        Self {
            buf: [0; MAX_ROUTING_INFO_SIZE],
        }
    }
}

impl std::fmt::Debug for RoutingInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoutingInfo({:02x?}...)", &self.buf[..6])
    }
}

/// One transmit descriptor: a single packet's wire region plus routing.
///
/// `pkt` points at the packet header; payload follows contiguously. The
/// region stays valid for the duration of the `tx_burst` call. A `drop`
/// descriptor must be consumed without transmitting (fault injection).
#[derive(Debug, Clone, Copy)]
pub struct TxBurstItem {
    pub routing_info: RoutingInfo,
    pub pkt: *const u8,
    pub len: usize,
    pub drop: bool,
}

/// One received packet, borrowed from the transport's receive ring.
///
/// The pointed-to bytes are owned by the ring and must not be touched
/// after the corresponding `post_recvs` call reposts the slot.
#[derive(Debug, Clone, Copy)]
pub struct RxDesc {
    pub pkt: NonNull<u8>,
    pub len: usize,
}

/// Capability interface of an unreliable datagram transport.
pub trait Transport {
    /// Maximum payload bytes per packet, excluding the packet header.
    const MAX_DATA_PER_PKT: usize;
    /// Transmit/receive burst depth.
    const POSTLIST: usize;
    /// Receive-ring depth.
    const RECV_QUEUE_DEPTH: usize;

    /// Serialized routing info of this endpoint.
    fn routing_info(&self) -> RoutingInfo;

    /// Validate and localize a peer's serialized routing info.
    fn resolve_routing(&self, remote: &RoutingInfo) -> Result<RoutingInfo>;

    /// Transmit a burst of packets. Descriptors flagged `drop` are
    /// consumed without hitting the wire.
    fn tx_burst(&mut self, items: &[TxBurstItem]);

    /// Poll up to [`POSTLIST`](Self::POSTLIST) received packets into `out`.
    /// Returns the number of descriptors appended.
    fn rx_burst(&mut self, out: &mut Vec<RxDesc>) -> usize;

    /// Repost `n` consumed receive-ring slots.
    fn post_recvs(&mut self, n: usize);
}

/// Datapath packet counters of a [`Fabric`], by packet kind.
#[derive(Debug, Default, Clone)]
pub struct FabricStats {
    pub req_pkts: u64,
    pub resp_pkts: u64,
    pub credit_return_pkts: u64,
    pub req_for_resp_pkts: u64,
    pub dropped_pkts: u64,
}

struct FabricInner {
    endpoints: HashMap<u32, VecDeque<Vec<u8>>>,
    next_id: u32,
    stats: FabricStats,
}

/// An in-process datagram fabric connecting [`FabricTransport`] endpoints.
///
/// Delivery copies each packet into the destination queue; ordering is
/// FIFO per destination, and packets flagged `drop` never arrive, which
/// makes loss deterministic for tests.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<Mutex<FabricInner>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FabricInner {
                endpoints: HashMap::new(),
                next_id: 1,
                stats: FabricStats::default(),
            })),
        }
    }

    /// Register a new endpoint on this fabric.
    pub fn new_transport(&self) -> FabricTransport {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.endpoints.insert(id, VecDeque::new());
            id
        };
        let slot = PKT_HDR_SIZE + FabricTransport::MAX_DATA_PER_PKT;
        FabricTransport {
            inner: self.inner.clone(),
            id,
            ring: (0..FabricTransport::RECV_QUEUE_DEPTH)
                .map(|_| vec![0u8; slot].into_boxed_slice())
                .collect(),
            ring_head: 0,
            ring_avail: FabricTransport::RECV_QUEUE_DEPTH,
        }
    }

    /// Snapshot the datapath packet counters.
    pub fn stats(&self) -> FabricStats {
        self.inner.lock().unwrap().stats.clone()
    }

    /// Number of packets queued toward endpoint `id` and not yet polled.
    pub fn pending_for(&self, id: u32) -> usize {
        self.inner
            .lock()
            .unwrap()
            .endpoints
            .get(&id)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

const FABRIC_RI_TAG: u8 = 0xFB;

/// One endpoint of an in-process [`Fabric`].
pub struct FabricTransport {
    inner: Arc<Mutex<FabricInner>>,
    id: u32,
    ring: Vec<Box<[u8]>>,
    ring_head: usize,
    ring_avail: usize,
}

impl FabricTransport {
    /// Fabric-local endpoint ID (also encoded in the routing info).
    pub fn id(&self) -> u32 {
        self.id
    }

    fn dst_of(routing: &RoutingInfo) -> Option<u32> {
        if routing.buf[0] != FABRIC_RI_TAG {
            return None;
        }
        Some(u32::from_le_bytes([
            routing.buf[1],
            routing.buf[2],
            routing.buf[3],
            routing.buf[4],
        ]))
    }
}

impl Transport for FabricTransport {
    const MAX_DATA_PER_PKT: usize = 1024;
    const POSTLIST: usize = 16;
    const RECV_QUEUE_DEPTH: usize = 128;

    fn routing_info(&self) -> RoutingInfo {
        let mut ri = RoutingInfo::default();
        ri.buf[0] = FABRIC_RI_TAG;
        ri.buf[1..5].copy_from_slice(&self.id.to_le_bytes());
        ri
    }

    fn resolve_routing(&self, remote: &RoutingInfo) -> Result<RoutingInfo> {
        match Self::dst_of(remote) {
            Some(_) => Ok(*remote),
            None => Err(Error::RoutingResolution),
        }
    }

    fn tx_burst(&mut self, items: &[TxBurstItem]) {
        let mut inner = self.inner.lock().unwrap();
        for item in items {
            debug_assert!(item.len >= PKT_HDR_SIZE);
            // The fabric is layout-aware for its per-kind counters.
            let hdr = unsafe { PktHdr::read_from(item.pkt) };
            if item.drop {
                inner.stats.dropped_pkts += 1;
                continue;
            }
            match hdr.pkt_type() {
                PktType::Req => inner.stats.req_pkts += 1,
                PktType::Resp => inner.stats.resp_pkts += 1,
                PktType::ExplCreditReturn => inner.stats.credit_return_pkts += 1,
                PktType::ReqForResp => inner.stats.req_for_resp_pkts += 1,
            }
            let dst = match Self::dst_of(&item.routing_info) {
                Some(dst) => dst,
                None => {
                    log::warn!("fabric: unroutable TX descriptor, dropping");
                    continue;
                }
            };
            let pkt = unsafe { std::slice::from_raw_parts(item.pkt, item.len) }.to_vec();
            match inner.endpoints.get_mut(&dst) {
                Some(q) => q.push_back(pkt),
                None => log::debug!("fabric: endpoint {} is gone, dropping packet", dst),
            }
        }
    }

    fn rx_burst(&mut self, out: &mut Vec<RxDesc>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let q = match inner.endpoints.get_mut(&self.id) {
            Some(q) => q,
            None => return 0,
        };
        let mut n = 0;
        while n < Self::POSTLIST && self.ring_avail > 0 {
            let pkt = match q.pop_front() {
                Some(p) => p,
                None => break,
            };
            let slot = &mut self.ring[self.ring_head];
            let len = pkt.len().min(slot.len());
            slot[..len].copy_from_slice(&pkt[..len]);
            out.push(RxDesc {
                pkt: NonNull::new(slot.as_mut_ptr()).unwrap(),
                len,
            });
            self.ring_head = (self.ring_head + 1) % Self::RECV_QUEUE_DEPTH;
            self.ring_avail -= 1;
            n += 1;
        }
        n
    }

    fn post_recvs(&mut self, n: usize) {
        self.ring_avail += n;
        debug_assert!(self.ring_avail <= Self::RECV_QUEUE_DEPTH);
    }
}

impl Drop for FabricTransport {
    fn drop(&mut self) {
        self.inner.lock().unwrap().endpoints.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_pkt(ty: PktType, payload: &[u8]) -> Vec<u8> {
        let hdr = PktHdr::new(1, payload.len(), 0, ty, 0, 8);
        let mut buf = vec![0u8; PKT_HDR_SIZE + payload.len()];
        unsafe { hdr.write_to(buf.as_mut_ptr()) };
        buf[PKT_HDR_SIZE..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn test_fabric_delivery() {
        let fabric = Fabric::new();
        let mut a = fabric.new_transport();
        let mut b = fabric.new_transport();

        let pkt = mk_pkt(PktType::Req, b"hello");
        let item = TxBurstItem {
            routing_info: b.routing_info(),
            pkt: pkt.as_ptr(),
            len: pkt.len(),
            drop: false,
        };
        a.tx_burst(&[item]);

        let mut out = Vec::new();
        assert_eq!(b.rx_burst(&mut out), 1);
        assert_eq!(out[0].len, pkt.len());
        let got = unsafe { std::slice::from_raw_parts(out[0].pkt.as_ptr(), out[0].len) };
        assert_eq!(&got[PKT_HDR_SIZE..], b"hello");
        assert_eq!(fabric.stats().req_pkts, 1);
        b.post_recvs(1);
    }

    #[test]
    fn test_drop_flag_honored() {
        let fabric = Fabric::new();
        let mut a = fabric.new_transport();
        let mut b = fabric.new_transport();

        let pkt = mk_pkt(PktType::Req, b"x");
        let item = TxBurstItem {
            routing_info: b.routing_info(),
            pkt: pkt.as_ptr(),
            len: pkt.len(),
            drop: true,
        };
        a.tx_burst(&[item]);

        let mut out = Vec::new();
        assert_eq!(b.rx_burst(&mut out), 0);
        assert_eq!(fabric.stats().dropped_pkts, 1);
    }

    #[test]
    fn test_routing_codec() {
        let fabric = Fabric::new();
        let a = fabric.new_transport();
        let ri = a.routing_info();
        assert!(a.resolve_routing(&ri).is_ok());
        assert!(a.resolve_routing(&RoutingInfo::default()).is_err());
    }

    #[test]
    fn test_ring_backpressure() {
        let fabric = Fabric::new();
        let mut a = fabric.new_transport();
        let mut b = fabric.new_transport();

        let pkt = mk_pkt(PktType::Req, b"y");
        let ri = b.routing_info();
        for _ in 0..FabricTransport::RECV_QUEUE_DEPTH + 4 {
            a.tx_burst(&[TxBurstItem {
                routing_info: ri,
                pkt: pkt.as_ptr(),
                len: pkt.len(),
                drop: false,
            }]);
        }

        // Without reposting, the ring caps what rx_burst may hand out.
        let mut out = Vec::new();
        let mut total = 0;
        loop {
            let n = b.rx_burst(&mut out);
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, FabricTransport::RECV_QUEUE_DEPTH);
        b.post_recvs(4);
        let mut out2 = Vec::new();
        assert_eq!(b.rx_burst(&mut out2), 4);
    }
}
