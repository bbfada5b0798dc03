//! Networked client endpoint: runs a `ClientSession` over the transport,
//! fed by a submission channel and reporting deliveries on another.

use std::net::SocketAddr;

use crate::client::session::{ClientSession, ResponseKey, SessionAction};
use crate::message::{check_payload, ClientId, PaxosMsg, ReplicaId, SeqNum};
use crate::transport::{InboundHub, LinkHub};
use crate::utils::{PaxosLogError, RetryTimer};

use rand::rngs::StdRng;
use rand::SeedableRng;

use serde::Deserialize;

use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Hello retransmission period in millisecs; the response retransmission
    /// period is three times this.
    pub hello_timeout_ms: u64,

    /// Probability in [0, 1) that an outgoing message is dropped.
    pub msg_loss_rate: f64,
}

#[allow(clippy::derivable_impls)]
impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            hello_timeout_ms: 10000,
            msg_loss_rate: 0.0,
        }
    }
}

/// Client endpoint.
pub struct PaxosLogClient {
    /// My client ID.
    id: ClientId,

    /// Logging prefix.
    me: String,

    /// Listening addresses of all replicas, indexed by ID.
    roster: Vec<SocketAddr>,

    /// Inbound listener for replica replies.
    inbound: InboundHub,

    /// Outbound links to replicas.
    links: LinkHub<ReplicaId>,

    /// Session state machine.
    session: ClientSession<StdRng>,

    /// Retransmission timers.
    hello_timer: RetryTimer<u64>,
    response_timer: RetryTimer<ResponseKey>,

    /// Receiver side of the submission channel.
    rx_submit: mpsc::UnboundedReceiver<String>,

    /// Sender side of the delivery channel.
    tx_deliver: mpsc::UnboundedSender<(SeqNum, String)>,
}

impl PaxosLogClient {
    /// Creates a new client with ID `id` listening for replies on `listen`.
    /// Returns it along with the sender side of its submission channel and
    /// the receiver side of its delivery channel.
    pub async fn new_and_setup(
        id: ClientId,
        listen: SocketAddr,
        roster: Vec<SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<
        (
            Self,
            mpsc::UnboundedSender<String>,
            mpsc::UnboundedReceiver<(SeqNum, String)>,
        ),
        PaxosLogError,
    > {
        let me = format!("c{}", id);
        let config = parsed_config!(config_str => ClientConfig;
                                    hello_timeout_ms, msg_loss_rate)?;
        if config.hello_timeout_ms == 0 {
            return logged_err!(me; "invalid hello_timeout_ms 0");
        }
        if id == 0 {
            return logged_err!(me; "client ID 0 is reserved");
        }
        if roster.is_empty() || roster.len() > u8::MAX as usize {
            return logged_err!(me; "invalid roster size {}", roster.len());
        }

        let session = ClientSession::new(
            id,
            roster.len() as u8,
            StdRng::from_entropy(),
        )?;
        let inbound = InboundHub::new_and_setup(&me, listen).await?;
        let links = LinkHub::new(&me, config.msg_loss_rate)?;
        let hello_period = Duration::from_millis(config.hello_timeout_ms);
        let hello_timer = RetryTimer::new(hello_period)?;
        let response_timer = RetryTimer::new(hello_period * 3)?;

        let (tx_submit, rx_submit) = mpsc::unbounded_channel();
        let (tx_deliver, rx_deliver) = mpsc::unbounded_channel();

        pf_info!(me; "client listening on {}", inbound.local_addr());
        Ok((
            PaxosLogClient {
                id,
                me,
                roster,
                inbound,
                links,
                session,
                hello_timer,
                response_timer,
                rx_submit,
                tx_deliver,
            },
            tx_submit,
            rx_deliver,
        ))
    }

    /// My client ID.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inbound.local_addr()
    }

    /// Main event loop. Returns `Ok(())` upon termination signal, or once the
    /// submission channel is closed and every submitted chat got delivered.
    /// A reply that breaks the protocol is returned as an error.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), PaxosLogError> {
        let mut submit_closed = false;

        loop {
            tokio::select! {
                // new chat submitted
                payload = self.rx_submit.recv(), if !submit_closed => {
                    match payload {
                        Some(payload) => {
                            if let Err(e) = check_payload(&payload) {
                                pf_warn!(self.me; "rejected submission: {}", e);
                                continue;
                            }
                            let (seq, actions) = self.session.enqueue(payload);
                            pf_debug!(self.me; "queued seq {}", seq);
                            self.apply_actions(actions)?;
                        }
                        None => submit_closed = true,
                    }
                },

                // reply from a replica
                msg = self.inbound.recv_msg() => {
                    let actions = match msg? {
                        PaxosMsg::Ack => self.session.on_ack(),
                        PaxosMsg::Nack { leader } => self.session.on_nack(leader)?,
                        PaxosMsg::Response { seq } => self.session.on_response(seq)?,
                        msg => {
                            pf_warn!(self.me; "unexpected {} received", msg.kind());
                            vec![]
                        }
                    };
                    self.apply_actions(actions)?;
                },

                // Hello retransmission
                hello_id = self.hello_timer.fired() => {
                    let actions = self.session.on_hello_timeout(hello_id);
                    self.hello_timer.reschedule_if(!actions.is_empty())?;
                    self.apply_actions(actions)?;
                },

                // response timeout
                key = self.response_timer.fired() => {
                    let actions = self.session.on_response_timeout(key);
                    if !actions.is_empty() {
                        pf_debug!(self.me; "no response for seq {}", key.seq);
                    }
                    self.response_timer.reschedule_if(false)?;
                    self.apply_actions(actions)?;
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.me; "client caught termination signal");
                    return Ok(());
                }
            }

            if submit_closed && self.session.is_drained() {
                pf_info!(self.me; "all chats delivered");
                return Ok(());
            }
        }
    }
}

// PaxosLogClient internal helpers
impl PaxosLogClient {
    fn apply_actions(
        &mut self,
        actions: Vec<SessionAction>,
    ) -> Result<(), PaxosLogError> {
        for action in actions {
            match action {
                SessionAction::SendHello { to } => {
                    pf_trace!(self.me; "hello -> {}", to);
                    let hello = PaxosMsg::Hello {
                        client: self.id,
                        addr: self.inbound.local_addr(),
                    };
                    self.send_to(to, &hello)?;
                }
                SessionAction::SendChat { to, seq, payload } => {
                    pf_trace!(self.me; "chat seq {} -> {}", seq, to);
                    let chat = PaxosMsg::Chat {
                        client: self.id,
                        seq,
                        payload,
                    };
                    self.send_to(to, &chat)?;
                }
                SessionAction::ArmHelloTimer { hello_id } => {
                    self.hello_timer.arm(hello_id)?;
                }
                SessionAction::ArmResponseTimer { key } => {
                    self.response_timer.arm(key)?;
                }
                SessionAction::Delivered { seq, payload } => {
                    pf_info!(self.me; "delivered seq {}", seq);
                    if self.tx_deliver.send((seq, payload)).is_err() {
                        pf_debug!(self.me; "delivery receiver gone");
                    }
                }
            }
        }
        Ok(())
    }

    fn send_to(
        &self,
        to: ReplicaId,
        msg: &PaxosMsg,
    ) -> Result<(), PaxosLogError> {
        let Some(&addr) = self.roster.get(to as usize) else {
            return logged_err!(self.me; "unknown replica {}", to);
        };
        self.links.send_lossy(to, addr, msg)?;
        Ok(())
    }
}
