//! Byte-stream transport collaborator.
//!
//! The routing core never touches sockets; it talks to a [`Transport`] through
//! small `Copy` connection handles and receives completed reads and lifecycle
//! changes as [`TransportEvent`]s over a channel. [`TcpTransport`] is the
//! production implementation: a listener task accepting inbound connections and
//! a reader/writer task pair per connection.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::protocol::{Packet, PacketCodec};

/// Identifier of a live connection. Zero is never a valid handle.
pub type Handle = u64;

/// Direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// We initiated the connection.
    Outgoing,
    /// The peer connected to us.
    Incoming,
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDirection::Outgoing => write!(f, "outgoing"),
            ConnectionDirection::Incoming => write!(f, "incoming"),
        }
    }
}

/// Lifecycle and data events emitted by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection completed (either direction).
    Connected {
        handle: Handle,
        direction: ConnectionDirection,
        remote: SocketAddr,
    },
    /// A full packet arrived on a connection.
    Received { handle: Handle, packet: Packet },
    /// A connection closed or failed after being established.
    Disconnected { handle: Handle },
    /// An outbound dial never became a connection.
    ConnectFailed { addr: SocketAddr },
}

/// The transport collaborator interface consumed by the routing core.
pub trait Transport: Send + Sync {
    /// Begin dialing a remote endpoint; completion arrives as an event.
    fn connect(&self, addr: SocketAddr);

    /// Queue a packet for delivery on a connection.
    fn send(&self, handle: Handle, packet: &Packet) -> MeshResult<()>;

    /// Close a connection.
    fn close(&self, handle: Handle);
}

/// TCP transport with a reader/writer task pair per connection.
pub struct TcpTransport {
    config: Arc<MeshConfig>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    writers: Mutex<HashMap<Handle, mpsc::UnboundedSender<Packet>>>,
    next_handle: AtomicU64,
    self_ref: Mutex<Weak<TcpTransport>>,
}

impl TcpTransport {
    /// Create a transport and the receiving end of its event stream.
    pub fn new(config: Arc<MeshConfig>) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            config,
            event_tx,
            writers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            self_ref: Mutex::new(Weak::new()),
        });
        *transport.self_ref.lock().unwrap() = Arc::downgrade(&transport);
        (transport, event_rx)
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn listen(self: &Arc<Self>, bind_addr: SocketAddr) -> MeshResult<SocketAddr> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Mesh transport listening");

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tracing::debug!(addr = %remote, "Accepted inbound connection");
                        transport.spawn_connection(stream, remote, ConnectionDirection::Incoming);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                }
            }
        });

        Ok(local_addr)
    }

    fn spawn_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        direction: ConnectionDirection,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(addr = %remote, error = %e, "Failed to set TCP_NODELAY");
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Packet>();

        self.writers.lock().unwrap().insert(handle, writer_tx);

        let _ = self.event_tx.send(TransportEvent::Connected {
            handle,
            direction,
            remote,
        });

        let (read_half, write_half) = stream.into_split();
        let mut sink = FramedWrite::new(write_half, PacketCodec::new());
        let mut source = FramedRead::new(read_half, PacketCodec::new());

        // writer task: drain the outbound queue into the socket
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(packet) = writer_rx.recv().await {
                if let Err(e) = sink.send(packet).await {
                    tracing::debug!(handle, error = %e, "Write failed, closing connection");
                    break;
                }
            }
            transport.drop_connection(handle);
        });

        // reader task: turn completed frames into events
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(result) = source.next().await {
                match result {
                    Ok(packet) => {
                        if transport
                            .event_tx
                            .send(TransportEvent::Received { handle, packet })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(handle, error = %e, "Read failed, closing connection");
                        break;
                    }
                }
            }
            transport.drop_connection(handle);
        });
    }

    fn drop_connection(&self, handle: Handle) {
        // first of the reader/writer tasks to exit wins; the second is a no-op
        if self.writers.lock().unwrap().remove(&handle).is_some() {
            let _ = self.event_tx.send(TransportEvent::Disconnected { handle });
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&self, addr: SocketAddr) {
        let transport = match self.self_ref.lock().unwrap().upgrade() {
            Some(transport) => transport,
            None => return,
        };
        let connect_timeout = self.config.connect_timeout;
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            tracing::debug!(addr = %addr, "Dialing peer");
            match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    transport.spawn_connection(stream, addr, ConnectionDirection::Outgoing);
                }
                Ok(Err(e)) => {
                    tracing::debug!(addr = %addr, error = %e, "Dial failed");
                    let _ = event_tx.send(TransportEvent::ConnectFailed { addr });
                }
                Err(_) => {
                    tracing::debug!(addr = %addr, "Dial timed out");
                    let _ = event_tx.send(TransportEvent::ConnectFailed { addr });
                }
            }
        });
    }

    fn send(&self, handle: Handle, packet: &Packet) -> MeshResult<()> {
        let writers = self.writers.lock().unwrap();
        let writer = writers
            .get(&handle)
            .ok_or(MeshError::ConnectionClosed(handle))?;
        writer
            .send(packet.clone())
            .map_err(|_| MeshError::ConnectionClosed(handle))
    }

    fn close(&self, handle: Handle) {
        // dropping the writer sender ends the writer task, which closes the
        // socket; emit the event eagerly so state teardown is not delayed
        if self.writers.lock().unwrap().remove(&handle).is_some() {
            let _ = self.event_tx.send(TransportEvent::Disconnected { handle });
        }
    }
}
