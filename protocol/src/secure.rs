//! Secure-transport boundary
//!
//! The handshake runs over a confidential datagram channel with a fixed
//! maximum datagram size. This module defines that boundary, the cancellable
//! hand-off queue between a socket receive task and a handshake task, a plain
//! UDP peer for development and an in-memory pair for tests.

use crate::error::TransportError;
use crate::framing::{channel_datagram, Channel};
use log::{debug, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// A datagram channel with a fixed maximum datagram size.
pub trait SecureTransport: Send + Sync {
    fn max_datagram_size(&self) -> usize;

    fn send(&self, datagram: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Waits up to `timeout` for the next datagram. `Ok(None)` on timeout.
    fn receive(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;
}

/// Creates a bounded hand-off queue and the handle that cancels it.
pub fn handoff_queue(capacity: usize) -> (HandoffSender, HandoffReceiver, CancelHandle) {
    let (tx, rx) = mpsc::channel(capacity);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    (
        HandoffSender { tx },
        HandoffReceiver {
            rx,
            cancel: cancel_rx,
        },
        CancelHandle { tx: cancel_tx },
    )
}

/// Producer side, held by the socket receive task.
#[derive(Debug, Clone)]
pub struct HandoffSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl HandoffSender {
    /// Queues a datagram without waiting. A full queue drops it, as the
    /// network would.
    pub fn push(&self, datagram: Vec<u8>) -> Result<(), TransportError> {
        match self.tx.try_send(datagram) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Hand-off queue full, dropping datagram");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, held by the handshake task.
#[derive(Debug)]
pub struct HandoffReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
    cancel: watch::Receiver<bool>,
}

impl HandoffReceiver {
    /// Waits for the next datagram, the timeout, or cancellation.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        if *self.cancel.borrow() {
            return Err(TransportError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.changed() => Err(TransportError::Cancelled),
            datagram = self.rx.recv() => datagram.map(Some).ok_or(TransportError::Closed),
            _ = tokio::time::sleep(timeout) => Ok(None),
        }
    }
}

/// Cancels the hand-off queue. Dropping the handle cancels it too.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Handshake endpoint over a shared UDP socket, for development. Outgoing
/// datagrams are tagged with the handshake channel; incoming ones arrive
/// through a hand-off queue fed by the socket's receive task.
#[derive(Debug)]
pub struct DatagramPeer {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    incoming: HandoffReceiver,
    max_datagram_size: usize,
}

impl DatagramPeer {
    /// `max_datagram_size` excludes the channel byte.
    pub fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        incoming: HandoffReceiver,
        max_datagram_size: usize,
    ) -> Self {
        Self {
            socket,
            remote,
            incoming,
            max_datagram_size,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

impl SecureTransport for DatagramPeer {
    fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        if datagram.len() > self.max_datagram_size {
            return Err(TransportError::DatagramTooLarge {
                size: datagram.len(),
                max: self.max_datagram_size,
            });
        }
        let bytes = channel_datagram(Channel::Handshake, datagram);
        self.socket.send_to(&bytes, self.remote).await?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        self.incoming.recv_timeout(timeout).await
    }
}

/// Decides whether a datagram is lost in a [`MemoryTransport`].
pub type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// One end of an in-process datagram link.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    max_datagram_size: usize,
    drop_filter: Option<Mutex<DropFilter>>,
}

impl MemoryTransport {
    pub fn pair(max_datagram_size: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: a_tx,
                rx: b_rx,
                max_datagram_size,
                drop_filter: None,
            },
            Self {
                tx: b_tx,
                rx: a_rx,
                max_datagram_size,
                drop_filter: None,
            },
        )
    }

    /// Drops outgoing datagrams for which `filter` returns true.
    pub fn with_drop_filter(mut self, filter: impl FnMut(&[u8]) -> bool + Send + 'static) -> Self {
        self.drop_filter = Some(Mutex::new(Box::new(filter)));
        self
    }
}

impl SecureTransport for MemoryTransport {
    fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        if datagram.len() > self.max_datagram_size {
            return Err(TransportError::DatagramTooLarge {
                size: datagram.len(),
                max: self.max_datagram_size,
            });
        }
        if let Some(filter) = &self.drop_filter {
            let dropped = {
                let mut filter = filter.lock();
                (*filter)(datagram)
            };
            if dropped {
                debug!("Dropping {} byte datagram", datagram.len());
                return Ok(());
            }
        }
        self.tx
            .send(datagram.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(datagram)) => Ok(Some(datagram)),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }
}
