//! The per-process registry.
//!
//! Endpoints sharing a process meet at a [`Nexus`]: it hands out tiny
//! thread IDs (used to pin each endpoint's datapath to its creator
//! thread), routes session-management packets into per-endpoint inboxes,
//! runs the optional background worker pool for long request handlers,
//! and fans peer resets out to every endpoint. Cross-host side channels
//! are external collaborators; this registry covers co-located endpoints.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{Error, Result};
use crate::sm::{SmErrType, SmPkt, SmPktType, SmWorkItem};

static TINY_TID_COUNTER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static TINY_TID: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

pub(crate) type SmInbox = Arc<Mutex<VecDeque<SmWorkItem>>>;

/// A unit of background work: a request handler invocation packaged with
/// everything it owns.
pub(crate) type BgWork = Box<dyn FnOnce() + Send>;

struct BgQueueState {
    items: VecDeque<BgWork>,
    shutdown: bool,
}

struct BgQueue {
    state: Mutex<BgQueueState>,
    cv: Condvar,
}

struct BgPool {
    queue: Arc<BgQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// The process-wide registry.
pub struct Nexus {
    uri: String,
    inboxes: Mutex<HashMap<u8, SmInbox>>,
    bg: Option<BgPool>,
}

impl Nexus {
    /// Create a registry with no background threads.
    pub fn new(uri: &str) -> Arc<Self> {
        Self::with_bg_threads(uri, 0)
    }

    /// Create a registry with `num_bg_threads` background workers for
    /// handlers registered as background.
    pub fn with_bg_threads(uri: &str, num_bg_threads: usize) -> Arc<Self> {
        let bg = if num_bg_threads > 0 {
            let queue = Arc::new(BgQueue {
                state: Mutex::new(BgQueueState {
                    items: VecDeque::new(),
                    shutdown: false,
                }),
                cv: Condvar::new(),
            });
            let workers = (0..num_bg_threads)
                .map(|i| {
                    let q = queue.clone();
                    std::thread::Builder::new()
                        .name(format!("udrpc-bg-{}", i))
                        .spawn(move || bg_worker_loop(q))
                        .expect("failed to spawn background worker")
                })
                .collect();
            Some(BgPool {
                queue,
                workers: Mutex::new(workers),
            })
        } else {
            None
        };

        Arc::new(Self {
            uri: uri.to_string(),
            inboxes: Mutex::new(HashMap::new()),
            bg,
        })
    }

    /// The local side-channel URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Tiny thread ID of the calling thread, assigned on first use.
    pub fn get_tiny_tid(&self) -> usize {
        TINY_TID.with(|cell| match cell.get() {
            Some(tid) => tid,
            None => {
                let tid = TINY_TID_COUNTER.fetch_add(1, Ordering::Relaxed);
                cell.set(Some(tid));
                tid
            }
        })
    }

    pub fn num_bg_threads(&self) -> usize {
        self.bg
            .as_ref()
            .map(|p| p.workers.lock().unwrap().len())
            .unwrap_or(0)
    }

    /// Register an endpoint's inbox under its RPC ID.
    pub(crate) fn register_hook(&self, rpc_id: u8) -> Result<SmInbox> {
        let mut inboxes = self.inboxes.lock().unwrap();
        if inboxes.contains_key(&rpc_id) {
            return Err(Error::DuplicateRpcId(rpc_id));
        }
        let inbox: SmInbox = Arc::new(Mutex::new(VecDeque::new()));
        inboxes.insert(rpc_id, inbox.clone());
        Ok(inbox)
    }

    pub(crate) fn unregister_hook(&self, rpc_id: u8) {
        self.inboxes.lock().unwrap().remove(&rpc_id);
    }

    /// Dispatch a session-management packet toward `(dst_hostname, dst_rpc_id)`.
    ///
    /// An unknown host fails synchronously. A known host with no endpoint
    /// under `dst_rpc_id` answers a connect request with a
    /// `ConnectResp(InvalidRemoteRpcId)` bounced into the requester's
    /// inbox, matching what a remote side-channel peer would send back.
    pub(crate) fn send_sm(&self, dst_hostname: &str, dst_rpc_id: u8, pkt: SmPkt) -> Result<()> {
        if dst_hostname != self.uri {
            return Err(Error::NoSuchRemote(dst_hostname.to_string()));
        }
        let inboxes = self.inboxes.lock().unwrap();
        match inboxes.get(&dst_rpc_id) {
            Some(inbox) => {
                inbox.lock().unwrap().push_back(SmWorkItem::Pkt(pkt));
                Ok(())
            }
            None => {
                if pkt.pkt_type == SmPktType::ConnectReq {
                    if let Some(src) = inboxes.get(&pkt.client.rpc_id) {
                        let resp = pkt
                            .response_of(SmPktType::ConnectResp, SmErrType::InvalidRemoteRpcId);
                        src.lock().unwrap().push_back(SmWorkItem::Pkt(resp));
                        return Ok(());
                    }
                }
                Err(Error::NoSuchRemote(format!(
                    "{}:{}",
                    dst_hostname, dst_rpc_id
                )))
            }
        }
    }

    /// Emulate a reset of the side-channel peer for `hostname`: every
    /// registered endpoint learns about it at its next inbox drain, so the
    /// reset is observed atomically per endpoint.
    pub(crate) fn reset_peer(&self, hostname: &str) {
        let inboxes = self.inboxes.lock().unwrap();
        for inbox in inboxes.values() {
            inbox
                .lock()
                .unwrap()
                .push_back(SmWorkItem::ResetPeer(hostname.to_string()));
        }
    }

    /// Submit work to the background pool.
    pub(crate) fn submit_bg(&self, work: BgWork) -> Result<()> {
        let pool = self.bg.as_ref().ok_or(Error::NoBgThreads)?;
        let mut state = pool.queue.state.lock().unwrap();
        state.items.push_back(work);
        drop(state);
        pool.queue.cv.notify_one();
        Ok(())
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        if let Some(pool) = &self.bg {
            {
                let mut state = pool.queue.state.lock().unwrap();
                state.shutdown = true;
            }
            pool.queue.cv.notify_all();
            for handle in pool.workers.lock().unwrap().drain(..) {
                let _ = handle.join();
            }
        }
    }
}

fn bg_worker_loop(queue: Arc<BgQueue>) {
    loop {
        let work = {
            let mut state = queue.state.lock().unwrap();
            loop {
                if let Some(work) = state.items.pop_front() {
                    break Some(work);
                }
                if state.shutdown {
                    break None;
                }
                state = queue.cv.wait(state).unwrap();
            }
        };
        match work {
            Some(work) => work(),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEndpoint;
    use crate::sm::{SmErrType, SmPktType};
    use crate::transport::RoutingInfo;

    fn endpoint() -> SessionEndpoint {
        SessionEndpoint {
            hostname: "proc://test".to_string(),
            rpc_id: 1,
            phy_port: 0,
            session_num: 0,
            routing_info: RoutingInfo::default(),
        }
    }

    #[test]
    fn test_tiny_tid_stable_per_thread() {
        let nexus = Nexus::new("proc://test");
        let a = nexus.get_tiny_tid();
        let b = nexus.get_tiny_tid();
        assert_eq!(a, b);

        let nexus2 = nexus.clone();
        let other = std::thread::spawn(move || nexus2.get_tiny_tid())
            .join()
            .unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_sm_routing() {
        let nexus = Nexus::new("proc://test");
        let inbox = nexus.register_hook(7).unwrap();
        assert!(nexus.register_hook(7).is_err());

        let pkt = SmPkt {
            pkt_type: SmPktType::ConnectReq,
            err_type: SmErrType::NoError,
            client: endpoint(),
            server: endpoint(),
            gen_data: 0,
        };
        nexus.send_sm("proc://test", 7, pkt.clone()).unwrap();
        assert!(nexus.send_sm("proc://other", 7, pkt.clone()).is_err());
        assert!(nexus.send_sm("proc://test", 9, pkt).is_err());

        assert_eq!(inbox.lock().unwrap().len(), 1);
        nexus.unregister_hook(7);
    }

    #[test]
    fn test_unknown_rpc_id_bounces_connect() {
        let nexus = Nexus::new("proc://test");
        let inbox = nexus.register_hook(7).unwrap();

        let mut client_ep = endpoint();
        client_ep.rpc_id = 7;
        let pkt = SmPkt {
            pkt_type: SmPktType::ConnectReq,
            err_type: SmErrType::NoError,
            client: client_ep,
            server: endpoint(),
            gen_data: 0,
        };
        nexus.send_sm("proc://test", 9, pkt).unwrap();

        let item = inbox.lock().unwrap().pop_front().unwrap();
        match item {
            SmWorkItem::Pkt(p) => {
                assert_eq!(p.pkt_type, SmPktType::ConnectResp);
                assert_eq!(p.err_type, SmErrType::InvalidRemoteRpcId);
            }
            other => panic!("unexpected work item {:?}", other),
        }

        // Non-connect packets to a missing endpoint still fail in place.
        let pkt = SmPkt {
            pkt_type: SmPktType::DisconnectReq,
            err_type: SmErrType::NoError,
            client: endpoint(),
            server: endpoint(),
            gen_data: 0,
        };
        assert!(nexus.send_sm("proc://test", 9, pkt).is_err());
    }

    #[test]
    fn test_bg_pool_runs_work() {
        let nexus = Nexus::with_bg_threads("proc://test", 2);
        assert_eq!(nexus.num_bg_threads(), 2);

        let (tx, rx) = std::sync::mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            nexus
                .submit_bg(Box::new(move || {
                    tx.send(i).unwrap();
                }))
                .unwrap();
        }
        let mut got: Vec<i32> = (0..8).map(|_| rx.recv().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_no_bg_pool_refused() {
        let nexus = Nexus::new("proc://test");
        assert!(nexus.submit_bg(Box::new(|| {})).is_err());
    }
}
