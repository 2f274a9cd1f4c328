//! Long-lived message ports between isolated contexts.
//!
//! A port is one end of a bidirectional, unbounded channel of owned
//! [`Envelope`]s. Contexts share nothing else. Dropping either end is the
//! disconnect signal: the peer's [`Port::recv`] returns `None` and further
//! sends fail with [`Error::Disconnected`].

use statescope_types::Envelope;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// One end of a bidirectional message channel.
#[derive(Debug)]
pub struct Port {
    sender: PortSender,
    receiver: mpsc::UnboundedReceiver<Envelope>,
}

impl Port {
    /// Create two connected ends.
    pub fn pair() -> (Port, Port) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Port {
                sender: PortSender { tx: a_tx },
                receiver: b_rx,
            },
            Port {
                sender: PortSender { tx: b_tx },
                receiver: a_rx,
            },
        )
    }

    /// Send an envelope to the peer. The envelope is dropped if the peer is gone.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.sender.send(envelope)
    }

    /// Receive the next envelope, or `None` once the peer has disconnected.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    /// Returns a cloneable handle for sending on this port.
    pub fn sender(&self) -> PortSender {
        self.sender.clone()
    }

    /// Split into the sending handle and the raw receiving half.
    pub fn split(self) -> (PortSender, mpsc::UnboundedReceiver<Envelope>) {
        (self.sender, self.receiver)
    }
}

/// Cloneable sending half of a [`Port`].
#[derive(Debug, Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl PortSender {
    /// Send an envelope to the peer.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx.send(envelope).map_err(|_| Error::Disconnected)
    }

    /// Check whether the peer has dropped its receiving half.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
