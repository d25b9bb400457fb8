//! The RPC endpoint.
//!
//! One `Rpc` exists per worker thread. The thread that constructs it (the
//! creator) owns the datapath: session creation, the event loop, the TX
//! and RX pipelines, packet-loss scanning and fault-injection arming all
//! check the creator's tiny thread ID. Background workers interact with
//! an endpoint only through the allocator lock, the background-response
//! TX queue and [`BgReqHandle::enqueue_response`].
//!
//! The public methods take `&self`: state lives behind interior
//! mutability so request handlers and continuations, which the event loop
//! invokes with no internal borrows held, can call back into the endpoint
//! (`enqueue_response`, `release_response`, `enqueue_request`).

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use crate::alloc::{HugeAlloc, MAX_CLASS_SIZE};
use crate::buffer::MsgBuffer;
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::nexus::{Nexus, SmInbox};
use crate::packet::{
    PktHdr, PktType, MAX_ENC_MSG_SIZE, PKT_HDR_SIZE, PKT_NUM_BITS,
};
use crate::session::{
    Session, SessionEndpoint, SessionRole, SessionState, SESSION_REQ_WINDOW,
};
use crate::sm::{SmErrType, SmEvent, SmEventType, SmHandler, SmPkt, SmPktType, SmWorkItem};
use crate::timing::{ms_to_cycles, rdtsc};
use crate::transport::{RoutingInfo, RxDesc, Transport, TxBurstItem};

/// Request types are a `u8`, so the handler table is fixed-size.
pub const MAX_REQ_TYPES: usize = 256;

/// Client continuation: invoked once with the completed response and the
/// tag passed to `enqueue_request`. The response slot stays occupied until
/// the handle is passed to [`Rpc::release_response`].
pub type Continuation = Box<dyn FnOnce(RespHandle, usize)>;

/// A completed response, owned by the continuation.
pub struct RespHandle {
    pub(crate) msgbuf: MsgBuffer,
    pub(crate) session_num: u16,
    pub(crate) sslot_idx: usize,
    pub(crate) req_num: u64,
}

impl RespHandle {
    #[inline]
    pub fn data_size(&self) -> usize {
        self.msgbuf.data_size()
    }

    /// Gather the response payload into one `Vec`.
    pub fn copy_data(&self) -> Vec<u8> {
        self.msgbuf.copy_out_data()
    }

    /// The payload, when it fits in a single packet.
    pub fn contiguous_data(&self) -> Option<&[u8]> {
        self.msgbuf.contiguous_data()
    }

    #[inline]
    pub fn session_num(&self) -> u16 {
        self.session_num
    }
}

/// Where an incoming request's payload lives while its handler runs.
enum ReqData {
    /// Zero-copy view into the transport receive ring; valid only until
    /// the RX tick replenishes the ring.
    Ring { payload: *const u8, len: usize },
    /// Reassembled multi-packet request in a dynamic buffer.
    Dyn(MsgBuffer),
}

/// An incoming request, handed to a foreground request handler.
///
/// The handler either answers with [`enqueue_response`](Self::enqueue_response)
/// or drops the handle; a dropped request is answered never, and the
/// client's loss machinery will eventually retry or give up.
pub struct ReqHandle<'r, Tr: Transport> {
    rpc: &'r Rpc<Tr>,
    session_num: u16,
    sslot_idx: usize,
    req_num: u64,
    req_type: u8,
    data: Option<ReqData>,
}

impl<'r, Tr: Transport> ReqHandle<'r, Tr> {
    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    #[inline]
    pub fn session_num(&self) -> u16 {
        self.session_num
    }

    pub fn data_size(&self) -> usize {
        match self.data.as_ref() {
            Some(ReqData::Ring { len, .. }) => *len,
            Some(ReqData::Dyn(b)) => b.data_size(),
            None => 0,
        }
    }

    /// Gather the request payload into one `Vec`.
    pub fn copy_req_data(&self) -> Vec<u8> {
        match self.data.as_ref() {
            Some(ReqData::Ring { payload, len }) => {
                unsafe { std::slice::from_raw_parts(*payload, *len) }.to_vec()
            }
            Some(ReqData::Dyn(b)) => b.copy_out_data(),
            None => Vec::new(),
        }
    }

    /// The request payload, when it is contiguous (always true for
    /// single-packet requests).
    pub fn contiguous_req_data(&self) -> Option<&[u8]> {
        match self.data.as_ref() {
            Some(ReqData::Ring { payload, len }) => {
                Some(unsafe { std::slice::from_raw_parts(*payload, *len) })
            }
            Some(ReqData::Dyn(b)) => b.contiguous_data(),
            None => None,
        }
    }

    /// Allocate a message buffer from the owning endpoint's allocator,
    /// typically for the response.
    pub fn alloc_msg_buffer(&self, max_data_size: usize) -> MsgBuffer {
        self.rpc.alloc_msg_buffer(max_data_size)
    }

    /// Free a buffer allocated on the owning endpoint.
    pub fn free_msg_buffer(&self, buf: MsgBuffer) -> Result<()> {
        self.rpc.free_msg_buffer(buf)
    }

    /// Enqueue `resp` as the response to this request. Ownership of the
    /// response buffer passes to the engine, which frees it when the slot
    /// is reused or the session is buried.
    pub fn enqueue_response(mut self, resp: MsgBuffer) -> Result<()> {
        if let Some(ReqData::Dyn(buf)) = self.data.take() {
            self.rpc.free_internal(buf);
        }
        self.rpc.enqueue_response_inner(
            self.session_num,
            self.sslot_idx,
            self.req_num,
            self.req_type,
            resp,
        )
    }
}

impl<Tr: Transport> Drop for ReqHandle<'_, Tr> {
    fn drop(&mut self) {
        if let Some(ReqData::Dyn(buf)) = self.data.take() {
            self.rpc.free_internal(buf);
        }
    }
}

/// An incoming request dispatched to a background worker.
///
/// The handle owns a copy of the request payload and the shared pieces a
/// worker may touch: the allocator and the background-response TX queue.
pub struct BgReqHandle {
    req_type: u8,
    session_num: u16,
    sslot_idx: usize,
    req_num: u64,
    req: Option<MsgBuffer>,
    alloc: Arc<Mutex<HugeAlloc>>,
    bg_resp_txq: Arc<Mutex<Vec<BgRespItem>>>,
    max_data_per_pkt: usize,
    max_msg_size: usize,
}

impl BgReqHandle {
    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    #[inline]
    pub fn session_num(&self) -> u16 {
        self.session_num
    }

    pub fn data_size(&self) -> usize {
        self.req.as_ref().map(|b| b.data_size()).unwrap_or(0)
    }

    pub fn copy_req_data(&self) -> Vec<u8> {
        self.req
            .as_ref()
            .map(|b| b.copy_out_data())
            .unwrap_or_default()
    }

    /// Allocate a message buffer from the owning endpoint's allocator.
    pub fn alloc_msg_buffer(&self, max_data_size: usize) -> MsgBuffer {
        alloc_msg_buffer_shared(
            &self.alloc,
            max_data_size,
            self.max_data_per_pkt,
            self.max_msg_size,
        )
    }

    /// Free a buffer allocated through this handle.
    pub fn free_msg_buffer(&self, buf: MsgBuffer) -> Result<()> {
        if !buf.is_valid() || !buf.is_dynamic() || !buf.check_magic() {
            return Err(Error::InvalidMsgBuffer);
        }
        self.alloc
            .lock()
            .unwrap()
            .free(buf.base_ptr(), buf.alloc_bytes());
        Ok(())
    }

    /// Push the response onto the background-response TX queue; the
    /// creator thread drains it on its next event-loop tick.
    pub fn enqueue_response(mut self, resp: MsgBuffer) -> Result<()> {
        if !resp.is_valid() || !resp.check_magic() || !resp.is_dynamic() {
            return Err(Error::InvalidMsgBuffer);
        }
        if let Some(req) = self.req.take() {
            self.alloc
                .lock()
                .unwrap()
                .free(req.base_ptr(), req.alloc_bytes());
        }
        self.bg_resp_txq.lock().unwrap().push(BgRespItem {
            session_num: self.session_num,
            sslot_idx: self.sslot_idx,
            req_num: self.req_num,
            req_type: self.req_type,
            resp,
        });
        Ok(())
    }
}

impl Drop for BgReqHandle {
    fn drop(&mut self) {
        if let Some(req) = self.req.take() {
            self.alloc
                .lock()
                .unwrap()
                .free(req.base_ptr(), req.alloc_bytes());
        }
    }
}

/// A response produced by a background handler, awaiting the creator.
pub(crate) struct BgRespItem {
    session_num: u16,
    sslot_idx: usize,
    req_num: u64,
    req_type: u8,
    resp: MsgBuffer,
}

/// A registered request handler.
enum ReqFunc<Tr: Transport> {
    /// Runs inline on the creator thread during the RX pump.
    Foreground(Box<dyn Fn(ReqHandle<'_, Tr>)>),
    /// Runs on the registry's background pool.
    Background(Arc<dyn Fn(BgReqHandle) + Send + Sync>),
}

/// Armed fault-injection state.
#[derive(Default)]
struct Faults {
    resolve_server_rinfo: bool,
    drop_tx_local: bool,
    drop_tx_local_countdown: usize,
}

/// Creator-owned datapath state: the transport and the TX batcher.
struct Dpath<Tr: Transport> {
    transport: Tr,
    tx_batch: Vec<TxBurstItem>,
    /// Header-only buffers for credit returns and request-for-response
    /// packets; recycled round-robin, safe because send-now flushes before
    /// reuse.
    ctrl_bufs: Vec<MsgBuffer>,
    ctrl_head: usize,
    rx_scratch: Vec<RxDesc>,
    pkts_tx: u64,
    pkts_rx: u64,
    retransmissions: u64,
}

impl<Tr: Transport> Dpath<Tr> {
    /// Append one descriptor; flush when the post list fills.
    fn push_tx(&mut self, routing_info: RoutingInfo, pkt: *const u8, len: usize, drop: bool) {
        self.tx_batch.push(TxBurstItem {
            routing_info,
            pkt,
            len,
            drop,
        });
        self.pkts_tx += 1;
        if self.tx_batch.len() >= Tr::POSTLIST {
            self.flush_tx();
        }
    }

    fn flush_tx(&mut self) {
        if !self.tx_batch.is_empty() {
            self.transport.tx_burst(&self.tx_batch);
            self.tx_batch.clear();
        }
    }

    /// Transmit a header-only packet immediately, bypassing batching.
    fn tx_ctrl_now(&mut self, routing_info: RoutingInfo, hdr: PktHdr, drop: bool) {
        let head = self.ctrl_head;
        self.ctrl_head = (head + 1) % self.ctrl_bufs.len();
        let (pkt, len) = {
            let buf = &mut self.ctrl_bufs[head];
            buf.set_hdr(0, &hdr);
            buf.pkt_region(0)
        };
        self.push_tx(routing_info, pkt, len, drop);
        self.flush_tx();
    }
}

/// A foreground request waiting for its handler call after the RX borrow
/// is dropped.
struct PendingReq {
    session_num: u16,
    sslot_idx: usize,
    req_num: u64,
    req_type: u8,
    data: ReqData,
}

/// A completed response waiting for its continuation call.
struct PendingCont {
    cont: Continuation,
    resp: RespHandle,
    tag: usize,
}

/// The RPC endpoint.
pub struct Rpc<Tr: Transport> {
    nexus: Arc<Nexus>,
    rpc_id: u8,
    phy_port: u8,
    creator_tid: usize,
    config: RpcConfig,
    max_msg_size: usize,
    huge_alloc: Arc<Mutex<HugeAlloc>>,
    handlers: RefCell<Box<[Option<ReqFunc<Tr>>; MAX_REQ_TYPES]>>,
    sm_handler: RefCell<SmHandler>,
    sm_inbox: SmInbox,
    bg_resp_txq: Arc<Mutex<Vec<BgRespItem>>>,
    sessions: RefCell<Vec<Option<Session>>>,
    req_txq: RefCell<Vec<(u16, usize)>>,
    dpath: RefCell<Dpath<Tr>>,
    faults: RefCell<Faults>,
    epoch_cycles: u64,
    timeout_cycles: u64,
    prev_epoch_ts: Cell<u64>,
    ev_loop_calls: Cell<u64>,
}

impl<Tr: Transport> Rpc<Tr> {
    /// Construct an endpoint on the calling thread, which becomes its
    /// creator. Fails if the huge-page reservation or registry
    /// registration fails; these are the only fatal conditions.
    pub fn new(
        nexus: &Arc<Nexus>,
        rpc_id: u8,
        phy_port: u8,
        transport: Tr,
        sm_handler: impl FnMut(SmEvent) + 'static,
        config: RpcConfig,
    ) -> Result<Self> {
        if Tr::MAX_DATA_PER_PKT == 0 || Tr::POSTLIST == 0 {
            return Err(Error::InvalidConfig(
                "transport reports zero payload or post-list depth".into(),
            ));
        }
        if Tr::RECV_QUEUE_DEPTH < Tr::POSTLIST {
            return Err(Error::InvalidConfig(
                "receive ring shallower than the post list".into(),
            ));
        }

        // Header-width invariants for this transport.
        let max_msg_size = Self::compute_max_msg_size();
        if max_msg_size == 0 {
            return Err(Error::InvalidConfig("unusable maximum message size".into()));
        }

        let mut alloc = HugeAlloc::new(config.initial_alloc_bytes)?;

        // Control buffers for send-now packets. Two post lists deep so a
        // full batch of credit returns never recycles a buffer in flight.
        let mut ctrl_bufs = Vec::with_capacity(2 * Tr::POSTLIST);
        for _ in 0..2 * Tr::POSTLIST {
            let (ptr, class_bytes) = alloc
                .alloc_raw(PKT_HDR_SIZE)
                .ok_or_else(|| Error::InvalidConfig("control buffer reservation failed".into()))?;
            ctrl_bufs.push(MsgBuffer::dynamic(
                ptr,
                class_bytes,
                0,
                1,
                Tr::MAX_DATA_PER_PKT,
            ));
        }

        let sm_inbox = nexus.register_hook(rpc_id)?;
        let creator_tid = nexus.get_tiny_tid();

        let epoch_cycles = ms_to_cycles(config.pkt_loss_epoch_ms);
        let timeout_cycles = ms_to_cycles(config.pkt_loss_timeout_ms);

        Ok(Self {
            nexus: nexus.clone(),
            rpc_id,
            phy_port,
            creator_tid,
            config,
            max_msg_size,
            huge_alloc: Arc::new(Mutex::new(alloc)),
            handlers: RefCell::new(Box::new(std::array::from_fn(|_| None))),
            sm_handler: RefCell::new(Box::new(sm_handler)),
            sm_inbox,
            bg_resp_txq: Arc::new(Mutex::new(Vec::new())),
            sessions: RefCell::new(Vec::new()),
            req_txq: RefCell::new(Vec::new()),
            dpath: RefCell::new(Dpath {
                transport,
                tx_batch: Vec::with_capacity(Tr::POSTLIST),
                ctrl_bufs,
                ctrl_head: 0,
                rx_scratch: Vec::with_capacity(Tr::POSTLIST),
                pkts_tx: 0,
                pkts_rx: 0,
                retransmissions: 0,
            }),
            faults: RefCell::new(Faults::default()),
            epoch_cycles,
            timeout_cycles,
            prev_epoch_ts: Cell::new(rdtsc()),
            ev_loop_calls: Cell::new(0),
        })
    }

    fn compute_max_msg_size() -> usize {
        let mdp = Tr::MAX_DATA_PER_PKT;
        let by_alloc = MAX_CLASS_SIZE - (MAX_CLASS_SIZE / mdp) * PKT_HDR_SIZE;
        let by_pkt_num = (1usize << PKT_NUM_BITS) * mdp;
        by_alloc.min(by_pkt_num).min(MAX_ENC_MSG_SIZE)
    }

    #[inline]
    fn in_creator(&self) -> bool {
        self.nexus.get_tiny_tid() == self.creator_tid
    }

    #[inline]
    fn assert_creator(&self) -> Result<()> {
        if !self.in_creator() {
            return Err(Error::WrongThread);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Handler registration
    // ------------------------------------------------------------------

    /// Register a foreground handler for `req_type`. Foreground handlers
    /// run inline on the creator thread during the RX pump and should
    /// finish quickly.
    pub fn register_req_handler<F>(&self, req_type: u8, f: F)
    where
        F: Fn(ReqHandle<'_, Tr>) + 'static,
    {
        self.handlers.borrow_mut()[req_type as usize] = Some(ReqFunc::Foreground(Box::new(f)));
    }

    /// Register a background handler for `req_type`, run on the
    /// registry's worker pool. Fails if the registry has no workers.
    pub fn register_bg_req_handler<F>(&self, req_type: u8, f: F) -> Result<()>
    where
        F: Fn(BgReqHandle) + Send + Sync + 'static,
    {
        if self.nexus.num_bg_threads() == 0 {
            return Err(Error::NoBgThreads);
        }
        self.handlers.borrow_mut()[req_type as usize] = Some(ReqFunc::Background(Arc::new(f)));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Message buffers
    // ------------------------------------------------------------------

    /// Allocate a huge-page-backed message buffer with `max_data_size`
    /// payload capacity. Returns the invalid buffer on out-of-memory.
    pub fn alloc_msg_buffer(&self, max_data_size: usize) -> MsgBuffer {
        alloc_msg_buffer_shared(
            &self.huge_alloc,
            max_data_size,
            Tr::MAX_DATA_PER_PKT,
            self.max_msg_size,
        )
    }

    /// Shrink `buf`'s logical size; never reallocates.
    pub fn resize_msg_buffer(&self, buf: &mut MsgBuffer, new_data_size: usize) -> Result<()> {
        buf.resize(new_data_size)
    }

    /// Free a buffer obtained from [`alloc_msg_buffer`](Self::alloc_msg_buffer).
    pub fn free_msg_buffer(&self, buf: MsgBuffer) -> Result<()> {
        if !buf.is_valid() || !buf.is_dynamic() || !buf.check_magic() {
            return Err(Error::InvalidMsgBuffer);
        }
        self.huge_alloc
            .lock()
            .unwrap()
            .free(buf.base_ptr(), buf.alloc_bytes());
        Ok(())
    }

    fn free_internal(&self, buf: MsgBuffer) {
        if buf.is_valid() && buf.is_dynamic() {
            self.huge_alloc
                .lock()
                .unwrap()
                .free(buf.base_ptr(), buf.alloc_bytes());
        }
    }

    // ------------------------------------------------------------------
    // Session management API
    // ------------------------------------------------------------------

    /// Create a client session toward `(host, remote_rpc_id)` and start
    /// the connect handshake. Returns the local session number; the
    /// outcome arrives later as a `Connected` or `ConnectFailed` event.
    pub fn create_session(
        &self,
        host: &str,
        remote_rpc_id: u8,
        remote_phy_port: u8,
    ) -> Result<u16> {
        self.assert_creator()?;
        let (idx, local_ep, remote_ep) = {
            let mut sessions = self.sessions.borrow_mut();
            let active = sessions.iter().filter(|s| s.is_some()).count();
            if active >= self.config.max_sessions {
                return Err(Error::NoFreeSessions);
            }
            let idx = match sessions.iter().position(|s| s.is_none()) {
                Some(i) => i,
                None => {
                    sessions.push(None);
                    sessions.len() - 1
                }
            };
            if idx > u16::MAX as usize {
                return Err(Error::NoFreeSessions);
            }
            let local_ep = SessionEndpoint {
                hostname: self.nexus.uri().to_string(),
                rpc_id: self.rpc_id,
                phy_port: self.phy_port,
                session_num: idx as u16,
                routing_info: self.dpath.borrow().transport.routing_info(),
            };
            let remote_ep = SessionEndpoint {
                hostname: host.to_string(),
                rpc_id: remote_rpc_id,
                phy_port: remote_phy_port,
                session_num: u16::MAX,
                routing_info: RoutingInfo::default(),
            };
            sessions[idx] = Some(Session::new(
                SessionRole::Client,
                local_ep.clone(),
                remote_ep.clone(),
                self.config.session_credits,
            ));
            (idx, local_ep, remote_ep)
        };

        let pkt = SmPkt {
            pkt_type: SmPktType::ConnectReq,
            err_type: SmErrType::NoError,
            client: local_ep,
            server: remote_ep,
            gen_data: 0,
        };
        match self.nexus.send_sm(host, remote_rpc_id, pkt) {
            Ok(()) => Ok(idx as u16),
            Err(e) => {
                self.sessions.borrow_mut()[idx] = None;
                Err(e)
            }
        }
    }

    /// Disconnect and destroy a connected, idle client session. The
    /// `Disconnected` event fires when the peer acknowledges.
    pub fn destroy_session(&self, session_num: u16) -> Result<()> {
        self.assert_creator()?;
        let pkt = {
            let mut sessions = self.sessions.borrow_mut();
            let sess = sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
                .ok_or(Error::InvalidSessionNum(session_num))?;
            if !sess.is_client() {
                return Err(Error::InvalidSessionRole(session_num));
            }
            if !sess.is_connected() {
                return Err(Error::SessionNotConnected(session_num));
            }
            if sess.in_flight() != 0 {
                return Err(Error::SessionBusy(session_num));
            }
            sess.state = SessionState::DisconnectInProgress;
            SmPkt {
                pkt_type: SmPktType::DisconnectReq,
                err_type: SmErrType::NoError,
                client: sess.local.clone(),
                server: sess.remote.clone(),
                gen_data: 0,
            }
        };
        let (host, rid) = (pkt.server.hostname.clone(), pkt.server.rpc_id);
        match self.nexus.send_sm(&host, rid, pkt) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(sess) = self.sessions.borrow_mut()[session_num as usize].as_mut() {
                    sess.state = SessionState::Connected;
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Datapath API
    // ------------------------------------------------------------------

    /// Enqueue a request on a connected client session. On success the
    /// engine owns `req_msgbuf`'s contents until the continuation fires;
    /// the caller must neither free nor resize it before then.
    pub fn enqueue_request<F>(
        &self,
        session_num: u16,
        req_type: u8,
        req_msgbuf: &MsgBuffer,
        cont: F,
        tag: usize,
    ) -> Result<()>
    where
        F: FnOnce(RespHandle, usize) + 'static,
    {
        self.assert_creator()?;
        if !req_msgbuf.is_valid() || !req_msgbuf.check_magic() || !req_msgbuf.is_dynamic() {
            return Err(Error::InvalidMsgBuffer);
        }
        if req_msgbuf.data_size() > self.max_msg_size {
            return Err(Error::MessageTooLarge {
                size: req_msgbuf.data_size(),
                max: self.max_msg_size,
            });
        }

        let idx;
        {
            let mut sessions = self.sessions.borrow_mut();
            let sess = sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
                .ok_or(Error::InvalidSessionNum(session_num))?;
            if !sess.is_client() {
                return Err(Error::InvalidSessionRole(session_num));
            }
            if !sess.is_connected() {
                return Err(Error::SessionNotConnected(session_num));
            }
            idx = {
                let mut free = sess.free_stack.lock().unwrap();
                free.pop().ok_or(Error::NoFreeSlots(session_num))?
            };
            let remote_sn = sess.remote.session_num;

            let slot = &mut sess.sslots[idx];
            slot.req_num += SESSION_REQ_WINDOW as u64;
            slot.req_type = req_type;
            slot.reset_progress();
            debug_assert!(!slot.rx_msgbuf.is_valid());

            let mut view = req_msgbuf.clone_view();
            let np = view.num_pkts();
            slot.acked.reset(np);
            for i in 0..np {
                view.set_hdr(
                    i,
                    &PktHdr::new(
                        req_type,
                        view.data_size(),
                        remote_sn,
                        PktType::Req,
                        i as u16,
                        slot.req_num,
                    ),
                );
            }
            slot.tx_msgbuf = Some(view);
            slot.cont = Some(Box::new(cont));
            slot.tag = tag;
        }

        self.req_txq.borrow_mut().push((session_num, idx));
        Ok(())
    }

    /// Bury a completed response and return its slot to the session's
    /// free stack. Every `RespHandle` must eventually come back here.
    pub fn release_response(&self, resp: RespHandle) -> Result<()> {
        self.assert_creator()?;
        let RespHandle {
            msgbuf,
            session_num,
            sslot_idx,
            req_num,
        } = resp;
        {
            let sessions = self.sessions.borrow();
            if let Some(sess) = sessions.get(session_num as usize).and_then(|s| s.as_ref()) {
                let slot = &sess.sslots[sslot_idx];
                if slot.req_num == req_num && slot.cont.is_none() && slot.tx_msgbuf.is_none() {
                    sess.free_stack.lock().unwrap().push(sslot_idx);
                } else {
                    log::debug!(
                        "RPC {}: release_response for stale slot ({}, {})",
                        self.rpc_id,
                        session_num,
                        sslot_idx
                    );
                }
            }
        }
        self.free_internal(msgbuf);
        Ok(())
    }

    /// Respond to a request from the creator thread; used by
    /// [`ReqHandle::enqueue_response`] and the background-response drain.
    fn enqueue_response_inner(
        &self,
        session_num: u16,
        sslot_idx: usize,
        req_num: u64,
        req_type: u8,
        resp: MsgBuffer,
    ) -> Result<()> {
        if !resp.is_valid() || !resp.check_magic() || !resp.is_dynamic() {
            return Err(Error::InvalidMsgBuffer);
        }
        if resp.data_size() > self.max_msg_size {
            let size = resp.data_size();
            self.free_internal(resp);
            return Err(Error::MessageTooLarge {
                size,
                max: self.max_msg_size,
            });
        }

        let (routing, region) = {
            let mut sessions = self.sessions.borrow_mut();
            let sess = match sessions
                .get_mut(session_num as usize)
                .and_then(|s| s.as_mut())
            {
                Some(s) if s.is_connected() && !s.is_client() => s,
                _ => {
                    self.free_internal(resp);
                    return Err(Error::InvalidSessionNum(session_num));
                }
            };
            let remote_sn = sess.remote.session_num;
            let routing = sess.remote.routing_info;
            let slot = &mut sess.sslots[sslot_idx];
            if slot.req_num != req_num {
                // The client re-sent and moved this slot past us.
                log::debug!(
                    "RPC {}: dropping response for superseded request {}",
                    self.rpc_id,
                    req_num
                );
                self.free_internal(resp);
                return Ok(());
            }
            let mut resp = resp;
            let np = resp.num_pkts();
            for i in 0..np {
                resp.set_hdr(
                    i,
                    &PktHdr::new(
                        req_type,
                        resp.data_size(),
                        remote_sn,
                        PktType::Resp,
                        i as u16,
                        req_num,
                    ),
                );
            }
            slot.tx_msgbuf = Some(resp);
            slot.finished = true;
            // Only packet zero goes out unsolicited; the client pulls the
            // rest with request-for-response packets.
            let region = slot.tx_msgbuf.as_ref().unwrap().pkt_region(0);
            (routing, region)
        };

        let drop = self.take_drop_flag();
        self.dpath
            .borrow_mut()
            .push_tx(routing, region.0, region.1, drop);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Run one event-loop iteration: drain the session-management inbox,
    /// pump receives, drain the transmit queues, scan for packet loss.
    pub fn run_event_loop_one(&self) {
        debug_assert!(self.in_creator(), "event loop entered off-creator");
        self.ev_loop_calls.set(self.ev_loop_calls.get() + 1);
        self.process_sm_queue();
        self.process_comps();
        self.process_req_txq();
        self.process_bg_resp_txq();
        self.pkt_loss_scan();
        self.dpath.borrow_mut().flush_tx();
    }

    /// Run the event loop until `timeout_ms` elapses on the cycle counter.
    pub fn run_event_loop_timeout(&self, timeout_ms: u64) {
        let deadline = rdtsc().wrapping_add(ms_to_cycles(timeout_ms));
        while rdtsc() < deadline {
            self.run_event_loop_one();
        }
    }

    /// Run the event loop forever.
    pub fn run_event_loop(&self) {
        loop {
            self.run_event_loop_one();
        }
    }

    // ------------------------------------------------------------------
    // Session-management processing (creator thread only)
    // ------------------------------------------------------------------

    fn process_sm_queue(&self) {
        let items: Vec<SmWorkItem> = {
            let mut inbox = self.sm_inbox.lock().unwrap();
            if inbox.is_empty() {
                return;
            }
            inbox.drain(..).collect()
        };

        let mut events: Vec<SmEvent> = Vec::new();
        for item in items {
            match item {
                SmWorkItem::Pkt(pkt) => match pkt.pkt_type {
                    SmPktType::ConnectReq => self.handle_connect_req(pkt),
                    SmPktType::ConnectResp => {
                        if let Some(ev) = self.handle_connect_resp(pkt) {
                            events.push(ev);
                        }
                    }
                    SmPktType::DisconnectReq => self.handle_disconnect_req(pkt),
                    SmPktType::DisconnectResp => {
                        if let Some(ev) = self.handle_disconnect_resp(pkt) {
                            events.push(ev);
                        }
                    }
                    SmPktType::FaultDropTxRemote => {
                        log::debug!(
                            "RPC {}: arming drop-tx-local (countdown {}) on peer request",
                            self.rpc_id,
                            pkt.gen_data
                        );
                        let mut faults = self.faults.borrow_mut();
                        faults.drop_tx_local = true;
                        faults.drop_tx_local_countdown = pkt.gen_data as usize;
                    }
                },
                SmWorkItem::ResetPeer(host) => self.handle_reset_peer(&host, &mut events),
            }
        }

        if !events.is_empty() {
            let mut handler = self.sm_handler.borrow_mut();
            for ev in events {
                (handler)(ev);
            }
        }
    }

    fn handle_connect_req(&self, pkt: SmPkt) {
        let resolved = self
            .dpath
            .borrow()
            .transport
            .resolve_routing(&pkt.client.routing_info);

        let resp = match resolved {
            Err(_) => pkt
                .clone()
                .response_of(SmPktType::ConnectResp, SmErrType::RoutingResolutionFailure),
            Ok(client_ri) => {
                let mut sessions = self.sessions.borrow_mut();
                let active = sessions.iter().filter(|s| s.is_some()).count();
                if active >= self.config.max_sessions {
                    pkt.clone()
                        .response_of(SmPktType::ConnectResp, SmErrType::NoFreeSessions)
                } else {
                    let idx = match sessions.iter().position(|s| s.is_none()) {
                        Some(i) => i,
                        None => {
                            sessions.push(None);
                            sessions.len() - 1
                        }
                    };
                    let local_ep = SessionEndpoint {
                        hostname: self.nexus.uri().to_string(),
                        rpc_id: self.rpc_id,
                        phy_port: self.phy_port,
                        session_num: idx as u16,
                        routing_info: self.dpath.borrow().transport.routing_info(),
                    };
                    let mut remote = pkt.client.clone();
                    remote.routing_info = client_ri;
                    let mut sess = Session::new(
                        SessionRole::Server,
                        local_ep.clone(),
                        remote,
                        self.config.session_credits,
                    );
                    sess.state = SessionState::Connected;
                    sessions[idx] = Some(sess);
                    log::info!(
                        "RPC {}: accepted session {} from {}:{}",
                        self.rpc_id,
                        idx,
                        pkt.client.hostname,
                        pkt.client.rpc_id
                    );
                    SmPkt {
                        pkt_type: SmPktType::ConnectResp,
                        err_type: SmErrType::NoError,
                        client: pkt.client.clone(),
                        server: local_ep,
                        gen_data: 0,
                    }
                }
            }
        };

        let (host, rid) = (resp.client.hostname.clone(), resp.client.rpc_id);
        if let Err(e) = self.nexus.send_sm(&host, rid, resp) {
            log::warn!("RPC {}: failed to send connect response: {}", self.rpc_id, e);
        }
    }

    fn handle_connect_resp(&self, pkt: SmPkt) -> Option<SmEvent> {
        let idx = pkt.client.session_num;

        enum Act {
            Ignore,
            Fail(SmErrType),
            Connect(SessionEndpoint),
        }

        let act = {
            let sessions = self.sessions.borrow();
            let sess = match sessions.get(idx as usize).and_then(|s| s.as_ref()) {
                Some(s) => s,
                None => {
                    log::debug!("RPC {}: connect response for dead session {}", self.rpc_id, idx);
                    return None;
                }
            };
            if !sess.is_client() || sess.state != SessionState::ConnectInProgress {
                log::debug!(
                    "RPC {}: unexpected connect response for session {}",
                    self.rpc_id,
                    idx
                );
                Act::Ignore
            } else if pkt.err_type != SmErrType::NoError {
                Act::Fail(pkt.err_type)
            } else {
                let fail_rinfo = self.faults.borrow().resolve_server_rinfo;
                let resolved = if fail_rinfo {
                    Err(Error::RoutingResolution)
                } else {
                    self.dpath
                        .borrow()
                        .transport
                        .resolve_routing(&pkt.server.routing_info)
                };
                match resolved {
                    Err(_) => Act::Fail(SmErrType::RoutingResolutionFailure),
                    Ok(ri) => {
                        let mut remote = pkt.server.clone();
                        remote.routing_info = ri;
                        Act::Connect(remote)
                    }
                }
            }
        };

        match act {
            Act::Ignore => None,
            Act::Fail(err) => {
                self.bury_session(idx);
                Some(SmEvent {
                    event_type: SmEventType::ConnectFailed,
                    session_num: idx,
                    err,
                })
            }
            Act::Connect(remote) => {
                let mut sessions = self.sessions.borrow_mut();
                let sess = sessions[idx as usize].as_mut().unwrap();
                sess.remote = remote;
                sess.state = SessionState::Connected;
                Some(SmEvent {
                    event_type: SmEventType::Connected,
                    session_num: idx,
                    err: SmErrType::NoError,
                })
            }
        }
    }

    fn handle_disconnect_req(&self, pkt: SmPkt) {
        let idx = pkt.server.session_num;
        let known = {
            let sessions = self.sessions.borrow();
            matches!(
                sessions.get(idx as usize).and_then(|s| s.as_ref()),
                Some(s) if !s.is_client()
            )
        };
        if known {
            self.bury_session(idx);
            log::info!("RPC {}: disconnected server session {}", self.rpc_id, idx);
        } else {
            log::debug!(
                "RPC {}: disconnect request for unknown session {}",
                self.rpc_id,
                idx
            );
        }
        let resp = pkt.response_of(SmPktType::DisconnectResp, SmErrType::NoError);
        let (host, rid) = (resp.client.hostname.clone(), resp.client.rpc_id);
        if let Err(e) = self.nexus.send_sm(&host, rid, resp) {
            log::warn!(
                "RPC {}: failed to send disconnect response: {}",
                self.rpc_id,
                e
            );
        }
    }

    fn handle_disconnect_resp(&self, pkt: SmPkt) -> Option<SmEvent> {
        let idx = pkt.client.session_num;
        let ok = {
            let sessions = self.sessions.borrow();
            matches!(
                sessions.get(idx as usize).and_then(|s| s.as_ref()),
                Some(s) if s.is_client() && s.state == SessionState::DisconnectInProgress
            )
        };
        if !ok {
            log::debug!(
                "RPC {}: unexpected disconnect response for session {}",
                self.rpc_id,
                idx
            );
            return None;
        }
        self.bury_session(idx);
        Some(SmEvent {
            event_type: SmEventType::Disconnected,
            session_num: idx,
            err: SmErrType::NoError,
        })
    }

    fn handle_reset_peer(&self, host: &str, events: &mut Vec<SmEvent>) {
        let victims: Vec<u16> = {
            let sessions = self.sessions.borrow();
            sessions
                .iter()
                .enumerate()
                .filter_map(|(i, s)| {
                    s.as_ref()
                        .filter(|s| s.remote.hostname == host)
                        .map(|_| i as u16)
                })
                .collect()
        };
        for idx in victims {
            log::warn!(
                "RPC {}: peer {} reset, failing session {}",
                self.rpc_id,
                host,
                idx
            );
            self.bury_session(idx);
            events.push(SmEvent {
                event_type: SmEventType::SessionReset,
                session_num: idx,
                err: SmErrType::NoError,
            });
        }
    }

    /// Free a session's engine-owned resources and tombstone its slot.
    /// Caller-owned request payloads are left untouched.
    fn bury_session(&self, session_num: u16) {
        let sess = {
            let mut sessions = self.sessions.borrow_mut();
            match sessions.get_mut(session_num as usize) {
                Some(s) => s.take(),
                None => None,
            }
        };
        let Some(mut sess) = sess else { return };

        for slot in &mut sess.sslots {
            if let Some(tx) = slot.tx_msgbuf.take() {
                if sess.role == SessionRole::Server {
                    // Responses became engine-owned at enqueue_response.
                    self.free_internal(tx);
                }
            }
            let rx = std::mem::replace(&mut slot.rx_msgbuf, MsgBuffer::invalid());
            self.free_internal(rx);
            slot.cont = None;
        }

        self.req_txq
            .borrow_mut()
            .retain(|(s, _)| *s != session_num);
    }

    // ------------------------------------------------------------------
    // RX pipeline
    // ------------------------------------------------------------------

    fn process_comps(&self) {
        let mut pending_reqs: Vec<PendingReq> = Vec::new();
        let mut pending_conts: Vec<PendingCont> = Vec::new();

        let n;
        {
            let mut dpath_g = self.dpath.borrow_mut();
            let dpath = &mut *dpath_g;
            let mut sessions_g = self.sessions.borrow_mut();
            let sessions = &mut *sessions_g;

            dpath.rx_scratch.clear();
            {
                let Dpath {
                    transport,
                    rx_scratch,
                    ..
                } = dpath;
                transport.rx_burst(rx_scratch);
            }
            n = dpath.rx_scratch.len();
            dpath.pkts_rx += n as u64;

            for i in 0..n {
                let desc = dpath.rx_scratch[i];
                if desc.len < PKT_HDR_SIZE {
                    log::warn!("RPC {}: runt packet ({} bytes), dropping", self.rpc_id, desc.len);
                    continue;
                }
                let hdr = unsafe { PktHdr::read_from(desc.pkt.as_ptr()) };
                if hdr.validate().is_err() {
                    log::warn!("RPC {}: bad magic in received packet, dropping", self.rpc_id);
                    continue;
                }
                let snum = hdr.dest_session_num();
                let sess = match sessions.get_mut(snum as usize).and_then(|s| s.as_mut()) {
                    Some(s) if s.is_connected() => s,
                    _ => {
                        log::debug!(
                            "RPC {}: packet for missing or unconnected session {}, dropping",
                            self.rpc_id,
                            snum
                        );
                        continue;
                    }
                };
                let payload = unsafe { desc.pkt.as_ptr().add(PKT_HDR_SIZE) } as *const u8;
                let payload_len = desc.len - PKT_HDR_SIZE;

                match hdr.pkt_type() {
                    PktType::ExplCreditReturn => self.process_credit_return(sess, &hdr),
                    PktType::ReqForResp => self.process_rfr(dpath, sess, &hdr),
                    PktType::Req => self.process_req_pkt(
                        dpath,
                        sess,
                        snum,
                        &hdr,
                        payload,
                        payload_len,
                        &mut pending_reqs,
                    ),
                    PktType::Resp => self.process_resp_pkt(
                        dpath,
                        sess,
                        snum,
                        &hdr,
                        payload,
                        payload_len,
                        &mut pending_conts,
                    ),
                }
            }
        }

        // Handlers and continuations run with no internal borrows held,
        // so they can call back into the endpoint.
        if !pending_reqs.is_empty() {
            let handlers = self.handlers.borrow();
            for pr in pending_reqs {
                match &handlers[pr.req_type as usize] {
                    Some(ReqFunc::Foreground(f)) => {
                        f(ReqHandle {
                            rpc: self,
                            session_num: pr.session_num,
                            sslot_idx: pr.sslot_idx,
                            req_num: pr.req_num,
                            req_type: pr.req_type,
                            data: Some(pr.data),
                        });
                    }
                    _ => {
                        if let ReqData::Dyn(buf) = pr.data {
                            self.free_internal(buf);
                        }
                    }
                }
            }
        }
        for pc in pending_conts {
            (pc.cont)(pc.resp, pc.tag);
        }

        // The ring buffers polled above must not be used past this point.
        if n > 0 {
            self.dpath.borrow_mut().transport.post_recvs(n);
        }
    }

    fn process_credit_return(&self, sess: &mut Session, hdr: &PktHdr) {
        if !sess.is_client() {
            log::debug!("RPC {}: credit return on server session, dropping", self.rpc_id);
            return;
        }
        let idx = Session::slot_of(hdr.req_num());
        let newly_acked = {
            let slot = &mut sess.sslots[idx];
            if slot.req_num != hdr.req_num() || slot.tx_msgbuf.is_none() {
                log::debug!("RPC {}: stale credit return, dropping", self.rpc_id);
                return;
            }
            slot.tx_ts = rdtsc();
            slot.acked.mark(hdr.pkt_num() as usize)
        };
        // A duplicate credit return refunds nothing.
        if newly_acked && sess.credits < self.config.session_credits {
            sess.credits += 1;
        }
    }

    fn process_rfr(&self, dpath: &mut Dpath<Tr>, sess: &mut Session, hdr: &PktHdr) {
        if sess.is_client() {
            log::debug!("RPC {}: request-for-response on client session", self.rpc_id);
            return;
        }
        let routing = sess.remote.routing_info;
        let region = {
            let slot = &sess.sslots[Session::slot_of(hdr.req_num())];
            if slot.req_num != hdr.req_num() || !slot.finished {
                log::debug!("RPC {}: request-for-response for inactive request", self.rpc_id);
                None
            } else {
                match slot.tx_msgbuf.as_ref() {
                    Some(resp) if (hdr.pkt_num() as usize) < resp.num_pkts() => {
                        Some(resp.pkt_region(hdr.pkt_num() as usize))
                    }
                    _ => {
                        log::debug!(
                            "RPC {}: request-for-response past the response end",
                            self.rpc_id
                        );
                        None
                    }
                }
            }
        };
        if let Some((pkt, len)) = region {
            let drop = self.take_drop_flag();
            dpath.push_tx(routing, pkt, len, drop);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_req_pkt(
        &self,
        dpath: &mut Dpath<Tr>,
        sess: &mut Session,
        snum: u16,
        hdr: &PktHdr,
        payload: *const u8,
        payload_len: usize,
        pending_reqs: &mut Vec<PendingReq>,
    ) {
        if sess.is_client() {
            log::debug!("RPC {}: request packet on client session, dropping", self.rpc_id);
            return;
        }
        let routing = sess.remote.routing_info;
        let remote_sn = sess.remote.session_num;
        let idx = Session::slot_of(hdr.req_num());
        let slot = &mut sess.sslots[idx];
        let payload_slice = unsafe { std::slice::from_raw_parts(payload, payload_len) };

        match hdr.req_num().cmp(&slot.req_num) {
            Ordering::Less => {
                // The slot moved past this request; drop the stale packet.
                log::debug!(
                    "RPC {}: stale request packet (num {}, current {})",
                    self.rpc_id,
                    hdr.req_num(),
                    slot.req_num
                );
            }
            Ordering::Equal => {
                let k = hdr.pkt_num() as usize;
                if slot.rx_msgbuf.is_valid() && slot.pkts_rx < slot.expected_pkts {
                    // Mid-reassembly fragment.
                    if k >= slot.expected_pkts {
                        log::debug!("RPC {}: fragment index out of range", self.rpc_id);
                        return;
                    }
                    if !slot.acked.mark(k) {
                        // Duplicate fragment: re-ack so the client settles
                        // its credits.
                        if k >= 1 {
                            let cr = PktHdr::new(
                                hdr.req_type(),
                                hdr.msg_size(),
                                remote_sn,
                                PktType::ExplCreditReturn,
                                k as u16,
                                hdr.req_num(),
                            );
                            dpath.tx_ctrl_now(routing, cr, self.take_drop_flag());
                        }
                        return;
                    }
                    slot.rx_msgbuf.copy_in_chunk(k, payload_slice);
                    slot.pkts_rx += 1;
                    if k >= 1 {
                        let cr = PktHdr::new(
                            hdr.req_type(),
                            hdr.msg_size(),
                            remote_sn,
                            PktType::ExplCreditReturn,
                            k as u16,
                            hdr.req_num(),
                        );
                        dpath.tx_ctrl_now(routing, cr, self.take_drop_flag());
                    }
                    if slot.pkts_rx == slot.expected_pkts {
                        let data =
                            std::mem::replace(&mut slot.rx_msgbuf, MsgBuffer::invalid());
                        let (req_num, req_type) = (slot.req_num, slot.req_type);
                        self.dispatch_request(
                            pending_reqs,
                            snum,
                            idx,
                            req_num,
                            req_type,
                            ReqData::Dyn(data),
                        );
                    }
                } else if slot.finished {
                    // The response is enqueued; the client must have lost
                    // it. Retransmit packet zero.
                    log::debug!(
                        "RPC {}: retransmitting response for request {}",
                        self.rpc_id,
                        hdr.req_num()
                    );
                    if let Some(resp) = slot.tx_msgbuf.as_ref() {
                        let (pkt, len) = resp.pkt_region(0);
                        let drop = self.take_drop_flag();
                        dpath.push_tx(routing, pkt, len, drop);
                        dpath.retransmissions += 1;
                    }
                } else {
                    // Handler still outstanding; let the client wait.
                    log::debug!(
                        "RPC {}: duplicate request {} while handler runs",
                        self.rpc_id,
                        hdr.req_num()
                    );
                }
            }
            Ordering::Greater => {
                // A new request claims this slot; stale state of the
                // previous request is dropped.
                if let Some(old_resp) = slot.tx_msgbuf.take() {
                    self.free_internal(old_resp);
                }
                let old_rx = std::mem::replace(&mut slot.rx_msgbuf, MsgBuffer::invalid());
                self.free_internal(old_rx);

                slot.req_num = hdr.req_num();
                slot.req_type = hdr.req_type();
                slot.reset_progress();

                let msg_size = hdr.msg_size();
                if msg_size > self.max_msg_size {
                    log::warn!(
                        "RPC {}: request of {} bytes exceeds the message limit, dropping",
                        self.rpc_id,
                        msg_size
                    );
                    return;
                }
                let num_pkts = PktHdr::calc_num_pkts(msg_size, Tr::MAX_DATA_PER_PKT);
                let k = hdr.pkt_num() as usize;
                if k >= num_pkts {
                    log::debug!("RPC {}: fragment index out of range", self.rpc_id);
                    return;
                }
                slot.expected_pkts = num_pkts;
                slot.acked.reset(num_pkts);
                slot.acked.mark(k);
                slot.pkts_rx = 1;

                if num_pkts == 1 {
                    let (req_num, req_type) = (slot.req_num, slot.req_type);
                    self.dispatch_request(
                        pending_reqs,
                        snum,
                        idx,
                        req_num,
                        req_type,
                        ReqData::Ring {
                            payload,
                            len: payload_len.min(msg_size),
                        },
                    );
                } else {
                    let buf = self.alloc_msg_buffer(msg_size);
                    if !buf.is_valid() {
                        log::error!(
                            "RPC {}: reassembly allocation failed, dropping request",
                            self.rpc_id
                        );
                        slot.expected_pkts = 0;
                        return;
                    }
                    slot.rx_msgbuf = buf;
                    slot.rx_msgbuf.copy_in_chunk(k, payload_slice);
                    if k >= 1 {
                        let cr = PktHdr::new(
                            hdr.req_type(),
                            msg_size,
                            remote_sn,
                            PktType::ExplCreditReturn,
                            k as u16,
                            hdr.req_num(),
                        );
                        dpath.tx_ctrl_now(routing, cr, self.take_drop_flag());
                    }
                }
            }
        }
    }

    /// Route a complete request to its handler: foreground handlers run
    /// after the RX borrow drops, background handlers go to the registry
    /// pool with an owned copy of the payload.
    fn dispatch_request(
        &self,
        pending_reqs: &mut Vec<PendingReq>,
        session_num: u16,
        sslot_idx: usize,
        req_num: u64,
        req_type: u8,
        data: ReqData,
    ) {
        let handlers = self.handlers.borrow();
        match &handlers[req_type as usize] {
            None => {
                log::debug!(
                    "RPC {}: no handler for request type {}, dropping",
                    self.rpc_id,
                    req_type
                );
                drop(handlers);
                if let ReqData::Dyn(buf) = data {
                    self.free_internal(buf);
                }
            }
            Some(ReqFunc::Foreground(_)) => {
                pending_reqs.push(PendingReq {
                    session_num,
                    sslot_idx,
                    req_num,
                    req_type,
                    data,
                });
            }
            Some(ReqFunc::Background(f)) => {
                let f = f.clone();
                drop(handlers);
                // Ring contents die with this tick; background work gets
                // an owned copy.
                let req_buf = match data {
                    ReqData::Dyn(buf) => buf,
                    ReqData::Ring { payload, len } => {
                        let mut buf = self.alloc_msg_buffer(len);
                        if !buf.is_valid() {
                            log::error!(
                                "RPC {}: allocation for background dispatch failed",
                                self.rpc_id
                            );
                            return;
                        }
                        let src = unsafe { std::slice::from_raw_parts(payload, len) };
                        buf.copy_in_chunk(0, src);
                        buf
                    }
                };
                let handle = BgReqHandle {
                    req_type,
                    session_num,
                    sslot_idx,
                    req_num,
                    req: Some(req_buf),
                    alloc: self.huge_alloc.clone(),
                    bg_resp_txq: self.bg_resp_txq.clone(),
                    max_data_per_pkt: Tr::MAX_DATA_PER_PKT,
                    max_msg_size: self.max_msg_size,
                };
                if let Err(e) = self.nexus.submit_bg(Box::new(move || f(handle))) {
                    log::error!("RPC {}: background dispatch failed: {}", self.rpc_id, e);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_resp_pkt(
        &self,
        dpath: &mut Dpath<Tr>,
        sess: &mut Session,
        snum: u16,
        hdr: &PktHdr,
        payload: *const u8,
        payload_len: usize,
        pending_conts: &mut Vec<PendingCont>,
    ) {
        if !sess.is_client() {
            log::debug!("RPC {}: response packet on server session, dropping", self.rpc_id);
            return;
        }
        let routing = sess.remote.routing_info;
        let remote_sn = sess.remote.session_num;
        let idx = Session::slot_of(hdr.req_num());
        let payload_slice = unsafe { std::slice::from_raw_parts(payload, payload_len) };

        let mut credit_bump = false;
        let mut rfr_next: Option<(u16, u8)> = None;
        let mut completed: Option<(Continuation, MsgBuffer, usize)> = None;
        let req_num = hdr.req_num();

        {
            let slot = &mut sess.sslots[idx];
            if slot.req_num != req_num || slot.cont.is_none() {
                log::debug!(
                    "RPC {}: stale or duplicate response (num {}), dropping",
                    self.rpc_id,
                    req_num
                );
                return;
            }
            let msg_size = hdr.msg_size();
            let num_resp = PktHdr::calc_num_pkts(msg_size, Tr::MAX_DATA_PER_PKT);
            // Any response packet proves the request fully arrived.
            slot.acked.mark_all();
            slot.tx_ts = rdtsc();

            if num_resp == 1 {
                if hdr.pkt_num() != 0 {
                    log::debug!("RPC {}: bad packet number in response", self.rpc_id);
                    return;
                }
                credit_bump = true;
                let mut buf = self.alloc_msg_buffer(msg_size);
                if !buf.is_valid() {
                    log::error!(
                        "RPC {}: response allocation failed, dropping packet",
                        self.rpc_id
                    );
                    return;
                }
                buf.copy_in_chunk(0, &payload_slice[..payload_len.min(msg_size)]);
                slot.tx_msgbuf = None; // request storage returns to the caller
                let cont = slot.cont.take().unwrap();
                completed = Some((cont, buf, slot.tag));
            } else {
                if !slot.rx_msgbuf.is_valid() {
                    let buf = self.alloc_msg_buffer(msg_size);
                    if !buf.is_valid() {
                        log::error!(
                            "RPC {}: reassembly allocation failed, dropping packet",
                            self.rpc_id
                        );
                        return;
                    }
                    slot.rx_msgbuf = buf;
                    slot.expected_pkts = num_resp;
                    slot.pkts_rx = 0;
                }
                // Response packets are pulled in order by request-for-
                // response pacing; anything else is a duplicate.
                if hdr.pkt_num() as usize != slot.pkts_rx {
                    log::debug!(
                        "RPC {}: out-of-order response fragment {}, expected {}",
                        self.rpc_id,
                        hdr.pkt_num(),
                        slot.pkts_rx
                    );
                    return;
                }
                credit_bump = true;
                slot.rx_msgbuf.copy_in_chunk(slot.pkts_rx, payload_slice);
                slot.pkts_rx += 1;
                if slot.pkts_rx == slot.expected_pkts {
                    let buf = std::mem::replace(&mut slot.rx_msgbuf, MsgBuffer::invalid());
                    slot.tx_msgbuf = None;
                    let cont = slot.cont.take().unwrap();
                    completed = Some((cont, buf, slot.tag));
                } else {
                    rfr_next = Some((slot.pkts_rx as u16, slot.req_type));
                }
            }
        }

        if credit_bump && sess.credits < self.config.session_credits {
            sess.credits += 1;
        }
        if let Some((next_pkt, req_type)) = rfr_next {
            // The packet we just received returned a credit, so one is
            // available to spend on the pull.
            if sess.credits > 0 {
                sess.credits -= 1;
                let rfr = PktHdr::new(
                    req_type,
                    0,
                    remote_sn,
                    PktType::ReqForResp,
                    next_pkt,
                    req_num,
                );
                dpath.tx_ctrl_now(routing, rfr, self.take_drop_flag());
            } else {
                log::debug!("RPC {}: deferring request-for-response, no credits", self.rpc_id);
            }
        }
        if let Some((cont, buf, tag)) = completed {
            pending_conts.push(PendingCont {
                cont,
                resp: RespHandle {
                    msgbuf: buf,
                    session_num: snum,
                    sslot_idx: idx,
                    req_num,
                },
                tag,
            });
        }
    }

    // ------------------------------------------------------------------
    // TX pipeline
    // ------------------------------------------------------------------

    /// Drain the request TX queue, sending as many packets per slot as
    /// session credits allow. Fully-queued slots leave the queue; the
    /// rest retry next tick.
    fn process_req_txq(&self) {
        let mut txq = self.req_txq.borrow_mut();
        if txq.is_empty() {
            return;
        }
        let mut sessions = self.sessions.borrow_mut();
        let mut dpath_g = self.dpath.borrow_mut();
        let dpath = &mut *dpath_g;

        let mut i = 0;
        while i < txq.len() {
            let (snum, idx) = txq[i];
            let sess = match sessions.get_mut(snum as usize).and_then(|s| s.as_mut()) {
                Some(s) if s.is_connected() => s,
                _ => {
                    txq.swap_remove(i);
                    continue;
                }
            };
            let routing = sess.remote.routing_info;
            let mut credits = sess.credits;

            let done = {
                let slot = &mut sess.sslots[idx];
                match slot.tx_msgbuf.as_ref().map(|b| b.clone_view()) {
                    None => true, // buried under us
                    Some(tx) => {
                        let np = tx.num_pkts();
                        while slot.pkts_queued < np && credits > 0 {
                            let k = slot.pkts_queued;
                            let (pkt, len) = tx.pkt_region(k);
                            credits -= 1;
                            let drop = self.take_drop_flag();
                            dpath.push_tx(routing, pkt, len, drop);
                            slot.pkts_queued += 1;
                        }
                        // A credit-starved slot that never sent anything
                        // has no unacknowledged packet to time out on.
                        if slot.tx_ts == 0 && slot.pkts_queued > 0 {
                            slot.tx_ts = rdtsc();
                        }
                        slot.pkts_queued == np
                    }
                }
            };
            sess.credits = credits;

            if done {
                txq.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Drain responses produced by background handlers; they enter the TX
    /// path exactly like foreground responses.
    fn process_bg_resp_txq(&self) {
        let items: Vec<BgRespItem> = {
            let mut q = self.bg_resp_txq.lock().unwrap();
            if q.is_empty() {
                return;
            }
            std::mem::take(&mut *q)
        };
        for item in items {
            if let Err(e) = self.enqueue_response_inner(
                item.session_num,
                item.sslot_idx,
                item.req_num,
                item.req_type,
                item.resp,
            ) {
                log::debug!(
                    "RPC {}: dropping background response: {}",
                    self.rpc_id,
                    e
                );
            }
        }
    }

    /// Resolve the one-shot drop-tx-local fault for the next descriptor.
    fn take_drop_flag(&self) -> bool {
        let mut faults = self.faults.borrow_mut();
        if !faults.drop_tx_local {
            return false;
        }
        if faults.drop_tx_local_countdown == 0 {
            faults.drop_tx_local = false;
            log::debug!("RPC {}: dropping TX packet by fault injection", self.rpc_id);
            true
        } else {
            faults.drop_tx_local_countdown -= 1;
            false
        }
    }

    // ------------------------------------------------------------------
    // Packet-loss detection
    // ------------------------------------------------------------------

    /// Walk client-side in-flight slots once per epoch. Timed-out slots
    /// retransmit their unacknowledged packets from the retained buffer;
    /// after `max_retries` consecutive timeouts the session is failed.
    fn pkt_loss_scan(&self) {
        let now = rdtsc();
        if now.wrapping_sub(self.prev_epoch_ts.get()) < self.epoch_cycles {
            return;
        }
        self.prev_epoch_ts.set(now);

        let mut failed: Vec<u16> = Vec::new();
        {
            let mut sessions = self.sessions.borrow_mut();
            let mut dpath_g = self.dpath.borrow_mut();
            let dpath = &mut *dpath_g;

            for (snum, sess_opt) in sessions.iter_mut().enumerate() {
                let sess = match sess_opt {
                    Some(s) if s.is_client() && s.is_connected() => s,
                    _ => continue,
                };
                let routing = sess.remote.routing_info;
                let remote_sn = sess.remote.session_num;
                let mut give_up = false;

                for idx in 0..SESSION_REQ_WINDOW {
                    let slot = &mut sess.sslots[idx];
                    if slot.cont.is_none() || slot.tx_msgbuf.is_none() || slot.tx_ts == 0 {
                        continue;
                    }
                    if now.wrapping_sub(slot.tx_ts) <= self.timeout_cycles {
                        continue;
                    }
                    slot.retries += 1;
                    if slot.retries > self.config.max_retries {
                        give_up = true;
                        break;
                    }

                    let tx = slot.tx_msgbuf.as_ref().unwrap().clone_view();
                    if slot.rx_msgbuf.is_valid() && slot.pkts_rx < slot.expected_pkts {
                        // Mid multi-packet response: pull again.
                        let rfr = PktHdr::new(
                            slot.req_type,
                            0,
                            remote_sn,
                            PktType::ReqForResp,
                            slot.pkts_rx as u16,
                            slot.req_num,
                        );
                        dpath.tx_ctrl_now(routing, rfr, self.take_drop_flag());
                    } else {
                        // Retransmissions replay credits already spent;
                        // they are not charged again.
                        let mut sent_any = false;
                        for k in 0..slot.pkts_queued {
                            if !slot.acked.get(k) {
                                let (pkt, len) = tx.pkt_region(k);
                                dpath.push_tx(routing, pkt, len, self.take_drop_flag());
                                sent_any = true;
                            }
                        }
                        if !sent_any && slot.pkts_queued > 0 {
                            // Fully acknowledged but no response: poke the
                            // server into retransmitting it.
                            let k = slot.pkts_queued - 1;
                            let (pkt, len) = tx.pkt_region(k);
                            dpath.push_tx(routing, pkt, len, self.take_drop_flag());
                        }
                    }
                    dpath.retransmissions += 1;
                    slot.tx_ts = now;
                }

                if give_up {
                    failed.push(snum as u16);
                }
            }
        }

        if !failed.is_empty() {
            let mut events = Vec::with_capacity(failed.len());
            for snum in failed {
                log::warn!(
                    "RPC {}: giving up on session {} after repeated packet loss",
                    self.rpc_id,
                    snum
                );
                self.bury_session(snum);
                events.push(SmEvent {
                    event_type: SmEventType::SessionReset,
                    session_num: snum,
                    err: SmErrType::NoError,
                });
            }
            let mut handler = self.sm_handler.borrow_mut();
            for ev in events {
                (handler)(ev);
            }
        }
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Make server routing-info resolution fail at all client sessions of
    /// this endpoint.
    pub fn fault_inject_resolve_server_rinfo(&self) -> Result<()> {
        self.assert_creator()?;
        self.faults.borrow_mut().resolve_server_rinfo = true;
        Ok(())
    }

    /// Drop the `pkt_countdown`-th upcoming locally transmitted packet.
    /// One-shot.
    pub fn fault_inject_drop_tx_local(&self, pkt_countdown: usize) -> Result<()> {
        self.assert_creator()?;
        let mut faults = self.faults.borrow_mut();
        faults.drop_tx_local = true;
        faults.drop_tx_local_countdown = pkt_countdown;
        Ok(())
    }

    /// Emulate a crash of the remote side-channel peer of `session_num`.
    /// Every local endpoint with sessions to that host observes the reset
    /// at its next inbox drain.
    pub fn fault_inject_reset_remote_epeer(&self, session_num: u16) -> Result<()> {
        self.assert_creator()?;
        let host = {
            let sessions = self.sessions.borrow();
            let sess = sessions
                .get(session_num as usize)
                .and_then(|s| s.as_ref())
                .ok_or(Error::InvalidSessionNum(session_num))?;
            if !sess.is_connected() {
                return Err(Error::SessionNotConnected(session_num));
            }
            sess.remote.hostname.clone()
        };
        self.nexus.reset_peer(&host);
        Ok(())
    }

    /// Arm a drop-tx-local fault at the remote endpoint of a client
    /// session, delivered as a control message.
    pub fn fault_inject_drop_tx_remote(
        &self,
        session_num: u16,
        pkt_countdown: usize,
    ) -> Result<()> {
        self.assert_creator()?;
        let pkt = {
            let sessions = self.sessions.borrow();
            let sess = sessions
                .get(session_num as usize)
                .and_then(|s| s.as_ref())
                .ok_or(Error::InvalidSessionNum(session_num))?;
            if !sess.is_client() {
                return Err(Error::InvalidSessionRole(session_num));
            }
            if !sess.is_connected() {
                return Err(Error::SessionNotConnected(session_num));
            }
            SmPkt {
                pkt_type: SmPktType::FaultDropTxRemote,
                err_type: SmErrType::NoError,
                client: sess.local.clone(),
                server: sess.remote.clone(),
                gen_data: pkt_countdown as u64,
            }
        };
        let (host, rid) = (pkt.server.hostname.clone(), pkt.server.rpc_id);
        self.nexus.send_sm(&host, rid, pkt)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Maximum payload bytes in one packet.
    pub fn get_max_data_per_pkt(&self) -> usize {
        Tr::MAX_DATA_PER_PKT
    }

    /// Maximum message payload size.
    pub fn get_max_msg_size(&self) -> usize {
        self.max_msg_size
    }

    /// This endpoint's RPC ID.
    pub fn get_rpc_id(&self) -> u8 {
        self.rpc_id
    }

    /// Total user bytes outstanding in the allocator, in size-class units.
    pub fn get_stat_user_alloc_tot(&self) -> usize {
        self.huge_alloc.lock().unwrap().stat_user_alloc_tot()
    }

    /// Number of live (non-tombstoned) sessions.
    pub fn num_active_sessions(&self) -> usize {
        self.sessions
            .borrow()
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    /// Available credits of a session.
    pub fn session_credits_available(&self, session_num: u16) -> Result<usize> {
        let sessions = self.sessions.borrow();
        sessions
            .get(session_num as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.credits)
            .ok_or(Error::InvalidSessionNum(session_num))
    }

    /// Free request slots of a session.
    pub fn session_free_slots(&self, session_num: u16) -> Result<usize> {
        let sessions = self.sessions.borrow();
        sessions
            .get(session_num as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.free_slots())
            .ok_or(Error::InvalidSessionNum(session_num))
    }

    /// Event-loop iterations so far.
    pub fn get_ev_loop_calls(&self) -> u64 {
        self.ev_loop_calls.get()
    }

    /// Datapath packets transmitted (including dropped-by-fault ones).
    pub fn get_pkts_tx(&self) -> u64 {
        self.dpath.borrow().pkts_tx
    }

    /// Datapath packets received.
    pub fn get_pkts_rx(&self) -> u64 {
        self.dpath.borrow().pkts_rx
    }

    /// Retransmission events (loss scan and duplicate-request resends).
    pub fn get_retransmissions(&self) -> u64 {
        self.dpath.borrow().retransmissions
    }
}

impl<Tr: Transport> Drop for Rpc<Tr> {
    fn drop(&mut self) {
        self.nexus.unregister_hook(self.rpc_id);
        // Hand the control buffers back; the allocator unmaps its regions
        // wholesale, so this keeps only the books straight.
        let mut dpath = self.dpath.borrow_mut();
        let mut alloc = self.huge_alloc.lock().unwrap();
        for buf in dpath.ctrl_bufs.drain(..) {
            alloc.free_raw(buf.base_ptr(), buf.alloc_bytes());
        }
    }
}

/// Allocate a message buffer from a shared allocator handle; used by both
/// the endpoint and background-handler handles.
fn alloc_msg_buffer_shared(
    alloc: &Arc<Mutex<HugeAlloc>>,
    max_data_size: usize,
    max_data_per_pkt: usize,
    max_msg_size: usize,
) -> MsgBuffer {
    if max_data_size > max_msg_size {
        log::warn!(
            "message buffer of {} bytes exceeds the message limit {}",
            max_data_size,
            max_msg_size
        );
        return MsgBuffer::invalid();
    }
    let num_pkts = PktHdr::calc_num_pkts(max_data_size, max_data_per_pkt);
    let bytes = max_data_size + num_pkts * PKT_HDR_SIZE;
    match alloc.lock().unwrap().alloc(bytes) {
        Some((ptr, class_bytes)) => {
            MsgBuffer::dynamic(ptr, class_bytes, max_data_size, num_pkts, max_data_per_pkt)
        }
        None => MsgBuffer::invalid(),
    }
}
