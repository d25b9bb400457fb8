//! Session-management sub-protocol.
//!
//! Control packets travel over the registry side channel, never the
//! datapath. Handlers run only on the creator thread while it drains the
//! endpoint's inbox, so state transitions for one session are serialized.

use crate::session::SessionEndpoint;

/// Session-management packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmPktType {
    ConnectReq,
    ConnectResp,
    DisconnectReq,
    DisconnectResp,
    /// Arm a drop-tx-local fault at the receiving endpoint.
    FaultDropTxRemote,
}

/// Session-management error carried in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmErrType {
    NoError,
    RoutingResolutionFailure,
    NoFreeSessions,
    InvalidRemoteRpcId,
}

/// A session-management packet.
#[derive(Debug, Clone)]
pub struct SmPkt {
    pub pkt_type: SmPktType,
    pub err_type: SmErrType,
    /// Client-side endpoint of the session under negotiation.
    pub client: SessionEndpoint,
    /// Server-side endpoint; partially filled in requests.
    pub server: SessionEndpoint,
    /// Packet-type-specific payload (the drop countdown for
    /// [`SmPktType::FaultDropTxRemote`]).
    pub gen_data: u64,
}

impl SmPkt {
    /// Build the response twin of a request packet.
    pub fn response_of(mut self, pkt_type: SmPktType, err_type: SmErrType) -> Self {
        self.pkt_type = pkt_type;
        self.err_type = err_type;
        self
    }
}

/// Asynchronous protocol event delivered to the application callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventType {
    /// The session completed its connect handshake.
    Connected,
    /// The connect handshake failed; the session is buried.
    ConnectFailed,
    /// A requested disconnect completed; the session is buried.
    Disconnected,
    /// The session failed (peer reset or packet-loss give-up).
    SessionReset,
}

/// One session-management event.
#[derive(Debug, Clone, Copy)]
pub struct SmEvent {
    pub event_type: SmEventType,
    pub session_num: u16,
    pub err: SmErrType,
}

/// The application's session-management callback.
pub type SmHandler = Box<dyn FnMut(SmEvent)>;

/// Work delivered into an endpoint's inbox by the registry.
#[derive(Debug)]
pub(crate) enum SmWorkItem {
    Pkt(SmPkt),
    /// The side-channel peer for this host reset; fail all sessions to it.
    ResetPeer(String),
}
