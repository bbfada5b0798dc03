//! Line-framed TCP transport: lazily-connected outbound links cached by peer
//! key, and an inbound listener that decodes frames from every accepted
//! connection into one receive channel.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::message::PaxosMsg;
use crate::utils::{
    safe_tcp_read_line, tcp_bind_with_retry, tcp_connect_with_retry,
    tcp_write_line, PaxosLogError,
};

use bytes::BytesMut;

use rand::prelude::*;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One cached outbound link.
struct Link {
    /// Address the link writes to.
    addr: SocketAddr,

    /// Sender side of the link's send channel.
    tx_send: mpsc::UnboundedSender<String>,

    /// Join handle of the link writer thread.
    _writer_handle: JoinHandle<()>,
}

/// Outbound links to a set of peers identified by keys of type `K` (replica
/// IDs or client IDs). Each link owns a writer thread that connects on first
/// use and reconnects on the next send after a failure. Shareable across
/// tasks behind an `Arc`.
pub(crate) struct LinkHub<K> {
    /// Logging prefix of the owner.
    me: String,

    /// Probability that a lossy send is silently dropped.
    loss_rate: f64,

    /// Map from peer key -> cached link.
    links: Mutex<HashMap<K, Link>>,
}

// LinkHub public API implementation
impl<K> LinkHub<K>
where
    K: fmt::Display + Copy + Eq + Hash + Send + 'static,
{
    /// Creates a new link hub with no links yet.
    pub(crate) fn new(
        me: impl ToString,
        loss_rate: f64,
    ) -> Result<Self, PaxosLogError> {
        let me = me.to_string();
        if !(0.0..1.0).contains(&loss_rate) {
            return logged_err!(me; "invalid msg_loss_rate {}", loss_rate);
        }

        Ok(LinkHub {
            me,
            loss_rate,
            links: Mutex::new(HashMap::new()),
        })
    }

    /// Sends a message to given peer reliably (as reliable as the stream
    /// connection is).
    pub(crate) fn send_msg(
        &self,
        peer: K,
        addr: SocketAddr,
        msg: &PaxosMsg,
    ) -> Result<(), PaxosLogError> {
        let line = msg.encode()?;
        let mut links = self
            .links
            .lock()
            .map_err(|e| PaxosLogError::msg(e.to_string()))?;

        if let Some(link) = links.get(&peer) {
            if link.addr == addr && !link.tx_send.is_closed() {
                link.tx_send.send(line)?;
                return Ok(());
            }
        }

        // no usable link yet, create one
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let writer_handle = tokio::spawn(Self::link_writer_thread(
            self.me.clone(),
            peer,
            addr,
            rx_send,
        ));
        tx_send.send(line)?;
        links.insert(
            peer,
            Link {
                addr,
                tx_send,
                _writer_handle: writer_handle,
            },
        );
        Ok(())
    }

    /// Sends a message to given peer, subject to simulated message loss.
    /// Returns `Ok(false)` if the message got dropped.
    pub(crate) fn send_lossy(
        &self,
        peer: K,
        addr: SocketAddr,
        msg: &PaxosMsg,
    ) -> Result<bool, PaxosLogError> {
        if self.loss_rate > 0.0 && thread_rng().gen::<f64>() < self.loss_rate {
            pf_trace!(self.me; "dropped {} to {}", msg.kind(), peer);
            return Ok(false);
        }
        self.send_msg(peer, addr, msg)?;
        Ok(true)
    }

    /// Number of links created so far.
    pub(crate) fn num_links(&self) -> usize {
        self.links.lock().map_or(0, |links| links.len())
    }
}

// LinkHub link_writer thread implementation
impl<K> LinkHub<K>
where
    K: fmt::Display + Copy + Eq + Hash + Send + 'static,
{
    /// Link writer thread function.
    async fn link_writer_thread(
        me: String,
        peer: K,
        addr: SocketAddr,
        mut rx_send: mpsc::UnboundedReceiver<String>,
    ) {
        pf_debug!(me; "link_writer thread for {} ({}) spawned", peer, addr);

        let mut conn: Option<TcpStream> = None;
        while let Some(line) = rx_send.recv().await {
            if conn.is_none() {
                match tcp_connect_with_retry(addr, 0).await {
                    Ok(stream) => conn = Some(stream),
                    Err(e) => {
                        pf_debug!(me; "error connecting to {} ({}): {}", peer, addr, e);
                        continue; // retransmission covers dropped lines
                    }
                }
            }

            if let Some(ref mut stream) = conn {
                if let Err(e) = tcp_write_line(stream, &line).await {
                    pf_warn!(me; "error sending to {}: {}", peer, e);
                    conn = None;
                } else {
                    pf_trace!(me; "sent to {} '{}'", peer, line);
                }
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(me; "link_writer thread for {} ({}) exitted", peer, addr);
    }
}

/// Inbound side: a listener accepting any number of connections, each served
/// by a reader thread that decodes frames into the shared receive channel.
pub(crate) struct InboundHub {
    /// Logging prefix of the owner.
    me: String,

    /// Address actually bound.
    local_addr: SocketAddr,

    /// Receiver side of the recv channel. A frame that fails to decode is
    /// delivered as an `Err`.
    rx_recv: mpsc::UnboundedReceiver<Result<PaxosMsg, PaxosLogError>>,

    /// Join handle of the listener thread.
    listener_handle: JoinHandle<()>,
}

// InboundHub public API implementation
impl InboundHub {
    /// Binds the listening socket and spawns the listener thread.
    pub(crate) async fn new_and_setup(
        me: impl ToString,
        bind_addr: SocketAddr,
    ) -> Result<Self, PaxosLogError> {
        let me = me.to_string();
        let listener = tcp_bind_with_retry(bind_addr, 2).await?;
        let local_addr = listener.local_addr()?;
        pf_debug!(me; "listening on {}", local_addr);

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let listener_handle =
            tokio::spawn(Self::listener_thread(me.clone(), listener, tx_recv));

        Ok(InboundHub {
            me,
            local_addr,
            rx_recv,
            listener_handle,
        })
    }

    /// Gets the bound local address.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receives the next decoded message from any connection. A decode
    /// failure is returned as an error.
    pub(crate) async fn recv_msg(&mut self) -> Result<PaxosMsg, PaxosLogError> {
        match self.rx_recv.recv().await {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(e)) => logged_err!(self.me; "undecodable frame: {}", e),
            None => logged_err!(self.me; "recv channel has been closed"),
        }
    }
}

impl Drop for InboundHub {
    fn drop(&mut self) {
        // stop accepting so that the port gets released
        self.listener_handle.abort();
    }
}

// InboundHub listener and reader threads implementation
impl InboundHub {
    /// Listener thread function.
    async fn listener_thread(
        me: String,
        listener: TcpListener,
        tx_recv: mpsc::UnboundedSender<Result<PaxosMsg, PaxosLogError>>,
    ) {
        pf_debug!(me; "listener thread spawned");

        while !tx_recv.is_closed() {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    tokio::spawn(Self::reader_thread(
                        me.clone(),
                        stream,
                        peer_addr,
                        tx_recv.clone(),
                    ));
                }
                Err(e) => {
                    pf_warn!(me; "error accepting connection: {}", e);
                }
            }
        }

        pf_debug!(me; "listener thread exitted");
    }

    /// Per-connection reader thread function.
    async fn reader_thread(
        me: String,
        mut conn: TcpStream,
        peer_addr: SocketAddr,
        tx_recv: mpsc::UnboundedSender<Result<PaxosMsg, PaxosLogError>>,
    ) {
        pf_trace!(me; "reader thread for {} spawned", peer_addr);

        let mut read_buf = BytesMut::new();
        loop {
            match safe_tcp_read_line(&mut read_buf, &mut conn).await {
                Ok(Some(line)) => {
                    pf_trace!(me; "recv from {} '{}'", peer_addr, line);
                    if tx_recv.send(PaxosMsg::decode(&line)).is_err() {
                        break; // owner has gone
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    pf_debug!(me; "error reading from {}: {}", peer_addr, e);
                    break;
                }
            }
        }

        pf_trace!(me; "reader thread for {} exitted", peer_addr);
    }
}
