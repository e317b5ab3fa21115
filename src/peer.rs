//! Peer connection state machine
//!
//! A connection moves through capabilities exchange before any traffic
//! flows: the initiator drives [`establish`] (CER out, CEA in, with bounded
//! retransmission), the responder drives [`accept_peer`] (CER in, validated,
//! CEA out). Both return the transport plus the peer's negotiated
//! capabilities.
//!
//! [`spawn_peer`] then hands the transport to a single task that owns all
//! connection state: outstanding requests keyed by Hop-by-Hop id, the
//! watchdog probe counter, and the disconnect handshake. Callers talk to the
//! task through the cloneable [`Connection`] handle; the task reports its
//! end through a [`ConnectionEvent`] channel, exactly once.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::NodeConfig;
use crate::datatype::Identity;
use crate::dict::Dictionary;
use crate::error::{is_success_code, DiameterError, DiameterResult, ResultCode};
use crate::handshake::{
    common_applications, failure_answer, Cea, Cer, Dpa, Dpr, Dwa, Dwr,
};
use crate::marshal::DiameterStruct;
use crate::message::{base_cmd, cmd_flags, DiameterMessage};
use crate::transport::DiameterTransport;

/// Connection task states.
///
/// The handshake phases run to completion inside [`establish`] and
/// [`accept_peer`] before a task exists, and a closed connection is a task
/// that has ended, so the running task only distinguishes these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Open,
    /// DPR sent, waiting for DPA
    Closing,
}

/// What the peer told us during the capabilities exchange
#[derive(Debug, Clone, PartialEq)]
pub struct PeerCapabilities {
    pub origin_host: Identity,
    pub origin_realm: Identity,
    pub host_ip_addresses: Vec<IpAddr>,
    pub vendor_id: u32,
    pub product_name: String,
    pub origin_state_id: Option<u32>,
    /// Applications both sides agreed on, in the peer's advertised order
    pub common_applications: Vec<u32>,
}

impl PeerCapabilities {
    fn from_cer(cer: &Cer, common: Vec<u32>) -> Self {
        Self {
            origin_host: cer.origin_host.clone(),
            origin_realm: cer.origin_realm.clone(),
            host_ip_addresses: cer.host_ip_address.clone(),
            vendor_id: cer.vendor_id,
            product_name: cer.product_name.clone(),
            origin_state_id: cer.origin_state_id,
            common_applications: common,
        }
    }

    fn from_cea(cea: &Cea, common: Vec<u32>) -> Self {
        Self {
            origin_host: cea.origin_host.clone(),
            origin_realm: cea.origin_realm.clone(),
            host_ip_addresses: cea.host_ip_address.clone(),
            vendor_id: cea.vendor_id,
            product_name: cea.product_name.clone(),
            origin_state_id: cea.origin_state_id,
            common_applications: common,
        }
    }

    pub fn supports(&self, app_id: u32) -> bool {
        self.common_applications.contains(&app_id)
    }
}

fn local_applications(config: &NodeConfig) -> Vec<u32> {
    let mut apps = config.auth_application_ids.clone();
    for &id in &config.acct_application_ids {
        if !apps.contains(&id) {
            apps.push(id);
        }
    }
    apps
}

fn build_cer(config: &NodeConfig) -> Cer {
    Cer {
        origin_host: config.origin_host.clone(),
        origin_realm: config.origin_realm.clone(),
        host_ip_address: config.host_ip_addresses.clone(),
        vendor_id: config.vendor_id,
        product_name: config.product_name.clone(),
        origin_state_id: config.origin_state_id,
        supported_vendor_id: config.supported_vendor_ids.clone(),
        auth_application_id: config.auth_application_ids.clone(),
        acct_application_id: config.acct_application_ids.clone(),
        firmware_revision: config.firmware_revision,
        ..Default::default()
    }
}

fn build_cea(config: &NodeConfig) -> Cea {
    Cea {
        result_code: ResultCode::Success as u32,
        origin_host: config.origin_host.clone(),
        origin_realm: config.origin_realm.clone(),
        host_ip_address: config.host_ip_addresses.clone(),
        vendor_id: config.vendor_id,
        product_name: config.product_name.clone(),
        origin_state_id: config.origin_state_id,
        supported_vendor_id: config.supported_vendor_ids.clone(),
        auth_application_id: config.auth_application_ids.clone(),
        acct_application_id: config.acct_application_ids.clone(),
        firmware_revision: config.firmware_revision,
        ..Default::default()
    }
}

fn seed_end_to_end_id() -> u32 {
    // High bits from the clock per RFC 6733 so ids stay unique across
    // restarts.
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    ((now.as_secs() as u32) << 20) | (now.subsec_nanos() & 0xF_FFFF)
}

/// Drive the initiator side of the capabilities exchange.
///
/// The CER is retransmitted with the T flag when no CEA arrives within the
/// handshake timeout, up to `max_retransmits` times. Messages other than a
/// CEA received while waiting are dropped.
pub async fn establish(
    mut transport: DiameterTransport,
    config: &NodeConfig,
) -> DiameterResult<(DiameterTransport, PeerCapabilities)> {
    let dict = transport.dictionary().clone();
    let mut msg = DiameterMessage::new_request(base_cmd::CAPABILITIES_EXCHANGE, 0);
    msg.header.flags = cmd_flags::REQUEST;
    msg.header.hop_by_hop_id = 1;
    msg.header.end_to_end_id = seed_end_to_end_id();
    build_cer(config).marshal(&mut msg, &dict)?;

    let mut attempts = 0u32;
    loop {
        transport.send(&msg).await?;
        let deadline = Instant::now() + config.handshake_timeout;
        let answer = loop {
            match tokio::time::timeout_at(deadline, transport.recv()).await {
                Ok(Ok(incoming))
                    if incoming.header.is_answer()
                        && incoming.header.command_code == base_cmd::CAPABILITIES_EXCHANGE =>
                {
                    break Some(incoming)
                }
                Ok(Ok(incoming)) => {
                    debug!(
                        "ignoring command {} while waiting for CEA",
                        incoming.header.command_code
                    );
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => break None,
            }
        };
        match answer {
            Some(answer) => {
                let cea = Cea::parse(&answer, &dict)?;
                let common = common_applications(
                    &cea.advertised_applications(),
                    &local_applications(config),
                    &dict,
                )?;
                info!(
                    "capabilities exchange with {} complete ({} common applications)",
                    cea.origin_host,
                    common.len()
                );
                return Ok((transport, PeerCapabilities::from_cea(&cea, common)));
            }
            None if attempts >= config.max_retransmits => {
                return Err(DiameterError::HandshakeTimeout(attempts));
            }
            None => {
                attempts += 1;
                msg.header.set_retransmit();
                debug!("CEA timeout, retransmitting CER (attempt {attempts})");
            }
        }
    }
}

/// Drive the responder side of the capabilities exchange.
///
/// A CER that fails validation is answered with the matching failure CEA
/// (DIAMETER_NO_COMMON_SECURITY, or DIAMETER_NO_COMMON_APPLICATION carrying
/// a Failed-AVP) before the error is returned.
pub async fn accept_peer(
    mut transport: DiameterTransport,
    config: &NodeConfig,
) -> DiameterResult<(DiameterTransport, PeerCapabilities)> {
    let dict = transport.dictionary().clone();
    let msg = tokio::time::timeout(config.handshake_timeout, transport.recv())
        .await
        .map_err(|_| DiameterError::HandshakeTimeout(0))??;
    if !msg.header.is_request() || msg.header.command_code != base_cmd::CAPABILITIES_EXCHANGE {
        return Err(DiameterError::Protocol(format!(
            "expected CER, got command {} ({})",
            msg.header.command_code,
            if msg.header.is_request() {
                "request"
            } else {
                "answer"
            }
        )));
    }

    let cer = Cer::parse(&msg, &dict)?;

    if let Err(e) = cer.validate_security() {
        let answer = failure_answer(
            &msg,
            ResultCode::NoCommonSecurity,
            &config.origin_host,
            &config.origin_realm,
            None,
        );
        transport.send(&answer).await?;
        return Err(e);
    }

    let common = match common_applications(
        &cer.advertised_applications(),
        &local_applications(config),
        &dict,
    ) {
        Ok(common) => common,
        Err(e) => {
            let failed_avp = match &e {
                DiameterError::NoCommonApplication { failed_avp } => Some(failed_avp.clone()),
                _ => None,
            };
            let answer = failure_answer(
                &msg,
                ResultCode::NoCommonApplication,
                &config.origin_host,
                &config.origin_realm,
                failed_avp,
            );
            transport.send(&answer).await?;
            return Err(e);
        }
    };

    let mut answer = DiameterMessage::new_answer(&msg);
    build_cea(config).marshal(&mut answer, &dict)?;
    transport.send(&answer).await?;
    info!(
        "accepted peer {} ({} common applications)",
        cer.origin_host,
        common.len()
    );
    Ok((transport, PeerCapabilities::from_cer(&cer, common)))
}

/// Handles application requests arriving from the peer.
///
/// Returning `None` makes the connection answer with
/// DIAMETER_COMMAND_UNSUPPORTED. Watchdog and disconnect requests never
/// reach the dispatcher.
pub trait Dispatcher: Send + Sync + 'static {
    fn handle(
        &self,
        request: &DiameterMessage,
        peer: &PeerCapabilities,
        dict: &Dictionary,
    ) -> Option<DiameterMessage>;
}

type Handler = Box<
    dyn Fn(&DiameterMessage, &PeerCapabilities, &Dictionary) -> Option<DiameterMessage>
        + Send
        + Sync,
>;

/// A [`Dispatcher`] routing requests by command code
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<u32, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one command code, replacing any previous one
    pub fn register<F>(&mut self, command_code: u32, handler: F)
    where
        F: Fn(&DiameterMessage, &PeerCapabilities, &Dictionary) -> Option<DiameterMessage>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(command_code, Box::new(handler));
    }
}

impl Dispatcher for HandlerRegistry {
    fn handle(
        &self,
        request: &DiameterMessage,
        peer: &PeerCapabilities,
        dict: &Dictionary,
    ) -> Option<DiameterMessage> {
        self.handlers
            .get(&request.header.command_code)
            .and_then(|handler| handler(request, peer, dict))
    }
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The watchdog probe budget was exhausted
    WatchdogExpired,
    /// The peer sent DPR with this Disconnect-Cause
    DisconnectedByPeer(i32),
    /// Our own DPR/DPA exchange completed
    Disconnected,
    /// The peer closed the transport
    PeerClosed,
    TransportError(String),
}

/// Events reported by a running connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Closed(CloseReason),
}

enum PeerCommand {
    Request {
        msg: DiameterMessage,
        reply: oneshot::Sender<DiameterMessage>,
    },
    Send(DiameterMessage),
    Disconnect { cause: i32 },
}

/// Cloneable handle to a running peer connection
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::Sender<PeerCommand>,
    caps: Arc<PeerCapabilities>,
    request_timeout: Duration,
}

impl Connection {
    pub fn capabilities(&self) -> &PeerCapabilities {
        &self.caps
    }

    /// Send a request and wait for the matching answer.
    ///
    /// The Hop-by-Hop id is assigned by the connection; any value in the
    /// header is overwritten.
    pub async fn request(&self, msg: DiameterMessage) -> DiameterResult<DiameterMessage> {
        let command = msg.header.command_code;
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PeerCommand::Request { msg, reply })
            .await
            .map_err(|_| DiameterError::ConnectionClosed)?;
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(DiameterError::ConnectionClosed),
            Err(_) => Err(DiameterError::Protocol(format!(
                "request for command {command} timed out"
            ))),
        }
    }

    /// Send a message without waiting for anything
    pub async fn send(&self, msg: DiameterMessage) -> DiameterResult<()> {
        self.cmd_tx
            .send(PeerCommand::Send(msg))
            .await
            .map_err(|_| DiameterError::ConnectionClosed)
    }

    /// Start the disconnect handshake with the given Disconnect-Cause.
    /// Completion is reported as `Closed(Disconnected)` on the event channel.
    pub async fn disconnect(&self, cause: i32) -> DiameterResult<()> {
        self.cmd_tx
            .send(PeerCommand::Disconnect { cause })
            .await
            .map_err(|_| DiameterError::ConnectionClosed)
    }
}

/// Spawn the connection task for an established transport.
pub fn spawn_peer(
    transport: DiameterTransport,
    config: Arc<NodeConfig>,
    caps: PeerCapabilities,
    dispatcher: Arc<dyn Dispatcher>,
) -> (Connection, mpsc::Receiver<ConnectionEvent>) {
    let caps = Arc::new(caps);
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(8);
    let connection = Connection {
        cmd_tx,
        caps: caps.clone(),
        request_timeout: config.request_timeout,
    };
    tokio::spawn(run_peer(
        transport, config, caps, dispatcher, cmd_rx, event_tx,
    ));
    (connection, event_rx)
}

async fn run_peer(
    mut transport: DiameterTransport,
    config: Arc<NodeConfig>,
    caps: Arc<PeerCapabilities>,
    dispatcher: Arc<dyn Dispatcher>,
    mut cmd_rx: mpsc::Receiver<PeerCommand>,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let dict = transport.dictionary().clone();
    let mut pending: HashMap<u32, oneshot::Sender<DiameterMessage>> = HashMap::new();
    let mut next_hop_by_hop: u32 = 1;
    let mut missed_watchdogs: u32 = 0;
    let mut state = PeerState::Open;
    // Armed when the DPR goes out; a peer that never answers it must not
    // keep the task alive forever.
    let mut dpa_deadline: Option<Instant> = None;

    let mut watchdog = tokio::time::interval_at(
        Instant::now() + config.watchdog.interval,
        config.watchdog.interval,
    );
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => break CloseReason::Disconnected,
                Some(PeerCommand::Request { mut msg, reply }) => {
                    msg.header.hop_by_hop_id = next_hop_by_hop;
                    next_hop_by_hop = next_hop_by_hop.wrapping_add(1);
                    if let Err(e) = transport.send(&msg).await {
                        break CloseReason::TransportError(e.to_string());
                    }
                    pending.insert(msg.header.hop_by_hop_id, reply);
                }
                Some(PeerCommand::Send(msg)) => {
                    if let Err(e) = transport.send(&msg).await {
                        break CloseReason::TransportError(e.to_string());
                    }
                }
                Some(PeerCommand::Disconnect { cause }) => {
                    let mut msg = DiameterMessage::new_request(base_cmd::DISCONNECT_PEER, 0);
                    msg.header.flags = cmd_flags::REQUEST;
                    msg.header.hop_by_hop_id = next_hop_by_hop;
                    next_hop_by_hop = next_hop_by_hop.wrapping_add(1);
                    let dpr = Dpr {
                        origin_host: config.origin_host.clone(),
                        origin_realm: config.origin_realm.clone(),
                        disconnect_cause: cause,
                    };
                    if let Err(e) = dpr.marshal(&mut msg, &dict) {
                        break CloseReason::TransportError(e.to_string());
                    }
                    if let Err(e) = transport.send(&msg).await {
                        break CloseReason::TransportError(e.to_string());
                    }
                    state = PeerState::Closing;
                    dpa_deadline = Some(Instant::now() + config.request_timeout);
                    debug!("sent DPR with cause {cause} to {}", caps.origin_host);
                }
            },

            incoming = transport.recv() => match incoming {
                Err(DiameterError::ConnectionClosed) => break CloseReason::PeerClosed,
                Err(e) => break CloseReason::TransportError(e.to_string()),
                Ok(msg) if msg.header.is_answer() => match msg.header.command_code {
                    base_cmd::DEVICE_WATCHDOG => {
                        // A DWA with a failure Result-Code does not prove
                        // the peer is healthy.
                        if msg.result_code().map(is_success_code).unwrap_or(false) {
                            missed_watchdogs = 0;
                        }
                        pending.remove(&msg.header.hop_by_hop_id);
                    }
                    base_cmd::DISCONNECT_PEER if state == PeerState::Closing => {
                        break CloseReason::Disconnected;
                    }
                    _ => match pending.remove(&msg.header.hop_by_hop_id) {
                        Some(reply) => {
                            let _ = reply.send(msg);
                        }
                        None => warn!(
                            "unmatched answer for command {} (hop-by-hop {:#x}) from {}",
                            msg.header.command_code,
                            msg.header.hop_by_hop_id,
                            caps.origin_host
                        ),
                    },
                },
                Ok(msg) => match msg.header.command_code {
                    base_cmd::DEVICE_WATCHDOG => {
                        missed_watchdogs = 0;
                        let mut answer = DiameterMessage::new_answer(&msg);
                        let dwa = Dwa {
                            result_code: ResultCode::Success as u32,
                            origin_host: config.origin_host.clone(),
                            origin_realm: config.origin_realm.clone(),
                            error_message: None,
                            origin_state_id: config.origin_state_id,
                        };
                        if let Err(e) = marshal_and_send(&mut transport, &dict, &dwa, &mut answer).await {
                            break CloseReason::TransportError(e.to_string());
                        }
                    }
                    base_cmd::DISCONNECT_PEER => {
                        let cause = Dpr::parse(&msg, &dict)
                            .map(|dpr| dpr.disconnect_cause)
                            .unwrap_or(0);
                        let mut answer = DiameterMessage::new_answer(&msg);
                        let dpa = Dpa {
                            result_code: ResultCode::Success as u32,
                            origin_host: config.origin_host.clone(),
                            origin_realm: config.origin_realm.clone(),
                            error_message: None,
                        };
                        let _ = marshal_and_send(&mut transport, &dict, &dpa, &mut answer).await;
                        info!("peer {} disconnected with cause {cause}", caps.origin_host);
                        break CloseReason::DisconnectedByPeer(cause);
                    }
                    _ => {
                        let answer = dispatcher.handle(&msg, &caps, &dict).unwrap_or_else(|| {
                            failure_answer(
                                &msg,
                                ResultCode::CommandUnsupported,
                                &config.origin_host,
                                &config.origin_realm,
                                None,
                            )
                        });
                        if let Err(e) = transport.send(&answer).await {
                            break CloseReason::TransportError(e.to_string());
                        }
                    }
                },
            },

            _ = watchdog.tick(), if config.watchdog.enabled && state == PeerState::Open => {
                // Requests whose caller stopped waiting have a dead reply
                // channel; drop them so the pending table stays bounded.
                pending.retain(|_, reply| !reply.is_closed());
                let mut msg = DiameterMessage::new_request(base_cmd::DEVICE_WATCHDOG, 0);
                msg.header.flags = cmd_flags::REQUEST;
                msg.header.hop_by_hop_id = next_hop_by_hop;
                next_hop_by_hop = next_hop_by_hop.wrapping_add(1);
                let dwr = Dwr {
                    origin_host: config.origin_host.clone(),
                    origin_realm: config.origin_realm.clone(),
                    origin_state_id: config.origin_state_id,
                };
                match dwr.marshal(&mut msg, &dict) {
                    Ok(()) => {
                        if let Err(e) = transport.send(&msg).await {
                            break CloseReason::TransportError(e.to_string());
                        }
                        missed_watchdogs += 1;
                        if missed_watchdogs >= config.watchdog.max_missed {
                            warn!(
                                "peer {} missed {missed_watchdogs} watchdogs, closing",
                                caps.origin_host
                            );
                            break CloseReason::WatchdogExpired;
                        }
                    }
                    Err(e) => break CloseReason::TransportError(e.to_string()),
                }
            }

            _ = tokio::time::sleep_until(dpa_deadline.unwrap_or_else(Instant::now)),
                if dpa_deadline.is_some() =>
            {
                warn!("peer {} never answered the DPR, closing", caps.origin_host);
                break CloseReason::Disconnected;
            }
        }
    };

    debug!("connection to {} closed: {reason:?}", caps.origin_host);
    let _ = event_tx.send(ConnectionEvent::Closed(reason)).await;
}

async fn marshal_and_send<T: DiameterStruct>(
    transport: &mut DiameterTransport,
    dict: &Arc<Dictionary>,
    body: &T,
    msg: &mut DiameterMessage,
) -> DiameterResult<()> {
    body.marshal(msg, dict)?;
    transport.send(msg).await
}

/// Open connections indexed by the peer's Origin-Host
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<String, Connection>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Connection) -> Option<Connection> {
        let host = connection.capabilities().origin_host.to_string();
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host, connection)
    }

    pub fn get(&self, origin_host: &str) -> Option<Connection> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(origin_host)
            .cloned()
    }

    pub fn remove(&self, origin_host: &str) -> Option<Connection> {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(origin_host)
    }

    pub fn hosts(&self) -> Vec<String> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avp::Avp;
    use crate::datatype::AvpData;
    use crate::dict::avp_code;
    use crate::handshake::disconnect_cause;
    use crate::transport::DiameterListener;

    fn node(host: &str, apps: &[u32]) -> NodeConfig {
        let mut config = NodeConfig::new(host, "example.org");
        config.auth_application_ids = apps.to_vec();
        config.handshake_timeout = Duration::from_millis(200);
        config.request_timeout = Duration::from_millis(500);
        config
    }

    async fn transports() -> (DiameterTransport, DiameterTransport) {
        let dict = Arc::new(Dictionary::base().unwrap());
        let listener = DiameterListener::bind("127.0.0.1:0".parse().unwrap(), dict.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { DiameterTransport::connect(addr, dict).await });
        let (server, _) = listener.accept().await.unwrap();
        (client.await.unwrap().unwrap(), server)
    }

    async fn open_pair(
        client_cfg: &NodeConfig,
        server_cfg: &NodeConfig,
    ) -> (
        (DiameterTransport, PeerCapabilities),
        (DiameterTransport, PeerCapabilities),
    ) {
        let (client, server) = transports().await;
        let (client_res, server_res) =
            tokio::join!(establish(client, client_cfg), accept_peer(server, server_cfg));
        (client_res.unwrap(), server_res.unwrap())
    }

    struct EchoDispatcher;

    impl Dispatcher for EchoDispatcher {
        fn handle(
            &self,
            request: &DiameterMessage,
            _peer: &PeerCapabilities,
            _dict: &Dictionary,
        ) -> Option<DiameterMessage> {
            if request.header.command_code != base_cmd::ACCOUNTING {
                return None;
            }
            let mut answer = DiameterMessage::new_answer(request);
            answer.add_avp(Avp::mandatory(
                avp_code::RESULT_CODE,
                AvpData::Unsigned32(ResultCode::Success as u32),
            ));
            if let Some(user) = request.user_name() {
                answer.add_avp(Avp::mandatory(
                    avp_code::USER_NAME,
                    AvpData::Utf8String(user.to_string()),
                ));
            }
            Some(answer)
        }
    }

    #[tokio::test]
    async fn test_capabilities_exchange() {
        let client_cfg = node("client.example.org", &[0, 4]);
        let server_cfg = node("server.example.org", &[4]);
        let ((_, client_caps), (_, server_caps)) = open_pair(&client_cfg, &server_cfg).await;

        assert_eq!(client_caps.origin_host.as_str(), "server.example.org");
        assert_eq!(server_caps.origin_host.as_str(), "client.example.org");
        assert_eq!(client_caps.common_applications, vec![4]);
        assert_eq!(server_caps.common_applications, vec![4]);
        assert!(server_caps.supports(4));
        assert!(!server_caps.supports(7));
    }

    #[tokio::test]
    async fn test_no_common_application() {
        let client_cfg = node("client.example.org", &[4]);
        let server_cfg = node("server.example.org", &[7]);
        let (client, server) = transports().await;
        let (client_res, server_res) =
            tokio::join!(establish(client, &client_cfg), accept_peer(server, &server_cfg));

        match server_res.unwrap_err() {
            DiameterError::NoCommonApplication { failed_avp } => {
                let inner = failed_avp.as_grouped().unwrap();
                assert_eq!(inner[0].as_u32(), Some(4));
            }
            other => panic!("unexpected server error: {other}"),
        }
        // The client sees the failure CEA the server sent before bailing.
        assert!(matches!(
            client_res.unwrap_err(),
            DiameterError::FailedResultCode(5010)
        ));
    }

    #[tokio::test]
    async fn test_handshake_retransmits_then_times_out() {
        let (client, mut server) = transports().await;
        let mut config = node("client.example.org", &[0]);
        config.handshake_timeout = Duration::from_millis(40);
        config.max_retransmits = 2;

        let silent = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(msg) = server.recv().await {
                seen.push(msg);
            }
            seen
        });

        let err = establish(client, &config).await.unwrap_err();
        assert!(matches!(err, DiameterError::HandshakeTimeout(2)));

        let seen = silent.await.unwrap();
        assert_eq!(seen.len(), 3);
        assert!(!seen[0].header.is_retransmit());
        assert!(seen[1].header.is_retransmit());
        assert!(seen[2].header.is_retransmit());
    }

    #[tokio::test]
    async fn test_request_answer_routing() {
        let client_cfg = Arc::new(node("client.example.org", &[0]));
        let server_cfg = Arc::new(node("server.example.org", &[0]));
        let ((client_t, client_caps), (server_t, server_caps)) =
            open_pair(&client_cfg, &server_cfg).await;

        let (client, _client_events) = spawn_peer(
            client_t,
            client_cfg,
            client_caps,
            Arc::new(EchoDispatcher),
        );
        let (_server, _server_events) = spawn_peer(
            server_t,
            server_cfg,
            server_caps,
            Arc::new(EchoDispatcher),
        );

        let make = |user: &str, e2e: u32| {
            let mut msg = DiameterMessage::new_request(base_cmd::ACCOUNTING, 0);
            msg.header.end_to_end_id = e2e;
            msg.add_avp(Avp::mandatory(
                avp_code::USER_NAME,
                AvpData::Utf8String(user.to_string()),
            ));
            msg
        };

        let (a, b) = tokio::join!(
            client.request(make("alice", 111)),
            client.request(make("bob", 222)),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.result_code(), Some(2001));
        assert_eq!(a.user_name(), Some("alice"));
        assert_eq!(a.header.end_to_end_id, 111);
        assert_eq!(b.user_name(), Some("bob"));
        assert_eq!(b.header.end_to_end_id, 222);
    }

    #[tokio::test]
    async fn test_handler_registry_routes_by_command() {
        let client_cfg = Arc::new(node("client.example.org", &[0]));
        let server_cfg = Arc::new(node("server.example.org", &[0]));
        let ((client_t, client_caps), (server_t, server_caps)) =
            open_pair(&client_cfg, &server_cfg).await;

        let mut registry = HandlerRegistry::new();
        registry.register(base_cmd::ACCOUNTING, |request, _peer, _dict| {
            let mut answer = DiameterMessage::new_answer(request);
            answer.add_avp(Avp::mandatory(
                avp_code::RESULT_CODE,
                AvpData::Unsigned32(2001),
            ));
            Some(answer)
        });

        let (client, _ce) = spawn_peer(client_t, client_cfg, client_caps, Arc::new(EchoDispatcher));
        let (_server, _se) = spawn_peer(server_t, server_cfg, server_caps, Arc::new(registry));

        let answer = client
            .request(DiameterMessage::new_request(base_cmd::ACCOUNTING, 0))
            .await
            .unwrap();
        assert_eq!(answer.result_code(), Some(2001));

        // A command without a handler falls through to 3001.
        let answer = client
            .request(DiameterMessage::new_request(base_cmd::RE_AUTH, 0))
            .await
            .unwrap();
        assert_eq!(answer.result_code(), Some(3001));
    }

    #[tokio::test]
    async fn test_unsupported_command_answered() {
        let client_cfg = Arc::new(node("client.example.org", &[0]));
        let server_cfg = Arc::new(node("server.example.org", &[0]));
        let ((client_t, client_caps), (server_t, server_caps)) =
            open_pair(&client_cfg, &server_cfg).await;

        let (client, _ce) = spawn_peer(client_t, client_cfg, client_caps, Arc::new(EchoDispatcher));
        let (_server, _se) = spawn_peer(server_t, server_cfg, server_caps, Arc::new(EchoDispatcher));

        // Re-Auth is not handled by the echo dispatcher.
        let answer = client
            .request(DiameterMessage::new_request(base_cmd::RE_AUTH, 0))
            .await
            .unwrap();
        assert_eq!(answer.result_code(), Some(3001));
        assert!(answer.header.is_error());
    }

    #[tokio::test]
    async fn test_watchdog_closes_unresponsive_peer() {
        let mut cfg = node("client.example.org", &[0]);
        cfg.watchdog.interval = Duration::from_millis(100);
        cfg.watchdog.max_missed = 3;
        let client_cfg = Arc::new(cfg);
        let server_cfg = Arc::new(node("server.example.org", &[0]));
        let ((client_t, client_caps), (server_t, _server_caps)) =
            open_pair(&client_cfg, &server_cfg).await;

        // Keep the server transport alive but silent.
        let start = Instant::now();
        let (_client, mut events) = spawn_peer(
            client_t,
            client_cfg,
            client_caps,
            Arc::new(EchoDispatcher),
        );
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no close event before the deadline");
        assert_eq!(event, Some(ConnectionEvent::Closed(CloseReason::WatchdogExpired)));
        // Closed at the max_missed-th unanswered probe, not one tick later.
        assert!(
            start.elapsed() < Duration::from_millis(380),
            "close took {:?}",
            start.elapsed()
        );
        // The task reports exactly once and then ends.
        assert_eq!(events.recv().await, None);
        drop(server_t);
    }

    #[tokio::test]
    async fn test_watchdog_answered_keeps_connection_open() {
        let mut cfg = node("client.example.org", &[0]);
        cfg.watchdog.interval = Duration::from_millis(50);
        cfg.watchdog.max_missed = 3;
        let client_cfg = Arc::new(cfg);
        let mut server_cfg = node("server.example.org", &[0]);
        server_cfg.watchdog.enabled = false;
        let server_cfg = Arc::new(server_cfg);

        let ((client_t, client_caps), (server_t, server_caps)) =
            open_pair(&client_cfg, &server_cfg).await;
        let (_client, mut client_events) = spawn_peer(
            client_t,
            client_cfg,
            client_caps,
            Arc::new(EchoDispatcher),
        );
        let (_server, _server_events) = spawn_peer(
            server_t,
            server_cfg,
            server_caps,
            Arc::new(EchoDispatcher),
        );

        // Several watchdog rounds pass without the connection closing.
        let quiet = tokio::time::timeout(Duration::from_millis(400), client_events.recv()).await;
        assert!(quiet.is_err(), "connection closed unexpectedly: {quiet:?}");
    }

    #[tokio::test]
    async fn test_disconnect_handshake() {
        let client_cfg = Arc::new(node("client.example.org", &[0]));
        let server_cfg = Arc::new(node("server.example.org", &[0]));
        let ((client_t, client_caps), (server_t, server_caps)) =
            open_pair(&client_cfg, &server_cfg).await;

        let (client, mut client_events) = spawn_peer(
            client_t,
            client_cfg,
            client_caps,
            Arc::new(EchoDispatcher),
        );
        let (_server, mut server_events) = spawn_peer(
            server_t,
            server_cfg,
            server_caps,
            Arc::new(EchoDispatcher),
        );

        client.disconnect(disconnect_cause::REBOOTING).await.unwrap();

        assert_eq!(
            client_events.recv().await,
            Some(ConnectionEvent::Closed(CloseReason::Disconnected))
        );
        assert_eq!(
            server_events.recv().await,
            Some(ConnectionEvent::Closed(CloseReason::DisconnectedByPeer(
                disconnect_cause::REBOOTING
            )))
        );
    }

    #[tokio::test]
    async fn test_disconnect_unanswered_closes_after_timeout() {
        let client_cfg = Arc::new(node("client.example.org", &[0]));
        let server_cfg = Arc::new(node("server.example.org", &[0]));
        let ((client_t, client_caps), (server_t, _server_caps)) =
            open_pair(&client_cfg, &server_cfg).await;

        // The server stays connected but never answers the DPR.
        let (client, mut events) = spawn_peer(
            client_t,
            client_cfg,
            client_caps,
            Arc::new(EchoDispatcher),
        );
        client.disconnect(disconnect_cause::BUSY).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no close event before the deadline");
        assert_eq!(event, Some(ConnectionEvent::Closed(CloseReason::Disconnected)));
        assert_eq!(events.recv().await, None);
        drop(server_t);
    }

    #[tokio::test]
    async fn test_request_timeout_leaves_connection_usable() {
        let mut cfg = node("client.example.org", &[0]);
        cfg.watchdog.interval = Duration::from_millis(100);
        let client_cfg = Arc::new(cfg);
        let server_cfg = Arc::new(node("server.example.org", &[0]));
        let ((client_t, client_caps), (mut server_t, _server_caps)) =
            open_pair(&client_cfg, &server_cfg).await;

        // A hand-driven server: answers watchdogs, swallows the first
        // accounting request and answers every later one.
        let server = tokio::spawn(async move {
            let dict = server_t.dictionary().clone();
            let mut swallowed = false;
            loop {
                let msg = match server_t.recv().await {
                    Ok(msg) => msg,
                    Err(_) => return,
                };
                if !msg.header.is_request() {
                    continue;
                }
                match msg.header.command_code {
                    base_cmd::DEVICE_WATCHDOG => {
                        let mut answer = DiameterMessage::new_answer(&msg);
                        let dwa = Dwa {
                            result_code: ResultCode::Success as u32,
                            origin_host: Identity::from("server.example.org"),
                            origin_realm: Identity::from("example.org"),
                            error_message: None,
                            origin_state_id: None,
                        };
                        dwa.marshal(&mut answer, &dict).unwrap();
                        server_t.send(&answer).await.unwrap();
                    }
                    base_cmd::ACCOUNTING if !swallowed => {
                        swallowed = true;
                    }
                    base_cmd::ACCOUNTING => {
                        let mut answer = DiameterMessage::new_answer(&msg);
                        answer.add_avp(Avp::mandatory(
                            avp_code::RESULT_CODE,
                            AvpData::Unsigned32(2001),
                        ));
                        server_t.send(&answer).await.unwrap();
                    }
                    _ => {}
                }
            }
        });

        let (client, _events) = spawn_peer(
            client_t,
            client_cfg,
            client_caps,
            Arc::new(EchoDispatcher),
        );

        let err = client
            .request(DiameterMessage::new_request(base_cmd::ACCOUNTING, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, DiameterError::Protocol(_)));

        // The abandoned waiter is reaped on a watchdog tick and later
        // requests still route by their own hop-by-hop id.
        let answer = client
            .request(DiameterMessage::new_request(base_cmd::ACCOUNTING, 0))
            .await
            .unwrap();
        assert_eq!(answer.result_code(), Some(2001));
        server.abort();
    }

    #[tokio::test]
    async fn test_peer_table() {
        let client_cfg = Arc::new(node("client.example.org", &[0]));
        let server_cfg = Arc::new(node("server.example.org", &[0]));
        let ((client_t, client_caps), (_server_t, _server_caps)) =
            open_pair(&client_cfg, &server_cfg).await;
        let (client, _events) = spawn_peer(
            client_t,
            client_cfg,
            client_caps,
            Arc::new(EchoDispatcher),
        );

        let table = PeerTable::new();
        assert!(table.is_empty());
        table.insert(client);
        assert_eq!(table.len(), 1);
        let found = table.get("server.example.org").unwrap();
        assert_eq!(
            found.capabilities().origin_host.as_str(),
            "server.example.org"
        );
        assert!(table.get("nobody.example.org").is_none());
        assert!(table.remove("server.example.org").is_some());
        assert!(table.is_empty());
    }
}
