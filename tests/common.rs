//! Common test utilities: a loopback client/server pair on one thread.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use udrpc::{Fabric, FabricTransport, Nexus, Rpc, RpcConfig, SmEvent, SmEventType};

pub const SERVER_RPC_ID: u8 = 1;
pub const CLIENT_RPC_ID: u8 = 2;

/// Two endpoints on a shared fabric and registry, polled from the test
/// thread.
pub struct TestPair {
    pub fabric: Fabric,
    pub nexus: Arc<Nexus>,
    pub server: Rpc<FabricTransport>,
    pub client: Rpc<FabricTransport>,
    /// Fabric endpoint ID of the server transport, for queue-depth probes.
    pub server_fabric_id: u32,
    pub client_events: Rc<RefCell<Vec<SmEvent>>>,
    pub server_events: Rc<RefCell<Vec<SmEvent>>>,
}

impl TestPair {
    pub fn new(config: RpcConfig) -> Self {
        Self::with_nexus(Nexus::new("proc://test"), config.clone(), config)
    }

    pub fn with_configs(server_cfg: RpcConfig, client_cfg: RpcConfig) -> Self {
        Self::with_nexus(Nexus::new("proc://test"), server_cfg, client_cfg)
    }

    pub fn with_nexus(nexus: Arc<Nexus>, server_cfg: RpcConfig, client_cfg: RpcConfig) -> Self {
        let fabric = Fabric::new();

        let server_transport = fabric.new_transport();
        let server_fabric_id = server_transport.id();
        let server_events = Rc::new(RefCell::new(Vec::new()));
        let ev = server_events.clone();
        let server = Rpc::new(
            &nexus,
            SERVER_RPC_ID,
            0,
            server_transport,
            move |e| ev.borrow_mut().push(e),
            server_cfg,
        )
        .expect("server endpoint construction failed");

        let client_events = Rc::new(RefCell::new(Vec::new()));
        let ev = client_events.clone();
        let client = Rpc::new(
            &nexus,
            CLIENT_RPC_ID,
            0,
            fabric.new_transport(),
            move |e| ev.borrow_mut().push(e),
            client_cfg,
        )
        .expect("client endpoint construction failed");

        Self {
            fabric,
            nexus,
            server,
            client,
            server_fabric_id,
            client_events,
            server_events,
        }
    }

    /// Tick both endpoints once.
    pub fn poll(&self) {
        self.client.run_event_loop_one();
        self.server.run_event_loop_one();
    }

    /// Tick only the client.
    pub fn poll_client(&self) {
        self.client.run_event_loop_one();
    }

    /// Tick both endpoints until `pred` holds. Panics after two seconds.
    pub fn poll_until(&self, mut pred: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            self.poll();
            if pred() {
                return;
            }
            assert!(Instant::now() < deadline, "poll_until timed out");
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    /// Create a client session to the server and wait for `Connected`.
    pub fn connect(&self) -> u16 {
        let sn = self
            .client
            .create_session(self.nexus.uri(), SERVER_RPC_ID, 0)
            .expect("create_session failed");
        self.poll_until(|| self.client_saw(sn, SmEventType::Connected));
        sn
    }

    pub fn client_saw(&self, session_num: u16, ev: SmEventType) -> bool {
        self.client_events
            .borrow()
            .iter()
            .any(|e| e.session_num == session_num && e.event_type == ev)
    }
}

/// Register a foreground echo handler for `req_type` on `rpc`.
pub fn register_echo(rpc: &Rpc<FabricTransport>, req_type: u8) {
    rpc.register_req_handler(req_type, |req| {
        let data = req.copy_req_data();
        let mut resp = req.alloc_msg_buffer(data.len());
        assert!(resp.is_valid(), "echo handler out of buffers");
        resp.copy_in_data(&data).unwrap();
        req.enqueue_response(resp).unwrap();
    });
}

/// A deterministic byte pattern for integrity checks.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 % 251) as u8).collect()
}
