//! Message transports between a runtime and its workers.

use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use lode_runtime::{RuntimeError, RuntimeResult};

/// One inbound message: the sender's origin and the envelope text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub origin: Option<String>,
    pub body: String,
}

impl Message {
    pub fn new(origin: Option<&str>, body: impl Into<String>) -> Self {
        Self {
            origin: origin.map(str::to_string),
            body: body.into(),
        }
    }
}

/// A bidirectional message pipe. A closed peer is reported as a
/// `Transport` error.
pub trait Transport {
    /// Send envelope text, stamped with this end's origin.
    fn send(&self, body: String) -> RuntimeResult<()>;

    /// Next message if one is available.
    fn try_recv(&self) -> RuntimeResult<Option<Message>>;

    /// Wait for the next message.
    fn recv(&self) -> RuntimeResult<Message>;
}

impl<T: Transport + ?Sized> Transport for Rc<T> {
    fn send(&self, body: String) -> RuntimeResult<()> {
        (**self).send(body)
    }

    fn try_recv(&self) -> RuntimeResult<Option<Message>> {
        (**self).try_recv()
    }

    fn recv(&self) -> RuntimeResult<Message> {
        (**self).recv()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&self, body: String) -> RuntimeResult<()> {
        (**self).send(body)
    }

    fn try_recv(&self) -> RuntimeResult<Option<Message>> {
        (**self).try_recv()
    }

    fn recv(&self) -> RuntimeResult<Message> {
        (**self).recv()
    }
}

// =============================================================================
// ChannelTransport
// =============================================================================

/// One end of an in-process channel pair. Both ends are `Send`, so either
/// can move to another thread.
pub struct ChannelTransport {
    origin: Option<String>,
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

/// Create two connected ends; messages sent from `a` carry `a_origin`.
pub fn channel_pair(a_origin: Option<&str>, b_origin: Option<&str>) -> (ChannelTransport, ChannelTransport) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();
    (
        ChannelTransport {
            origin: a_origin.map(str::to_string),
            tx: a_tx,
            rx: a_rx,
        },
        ChannelTransport {
            origin: b_origin.map(str::to_string),
            tx: b_tx,
            rx: b_rx,
        },
    )
}

fn closed() -> RuntimeError {
    RuntimeError::Transport("channel closed".into())
}

impl ChannelTransport {
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, body: String) -> RuntimeResult<()> {
        self.tx
            .send(Message {
                origin: self.origin.clone(),
                body,
            })
            .map_err(|_| closed())
    }

    fn try_recv(&self) -> RuntimeResult<Option<Message>> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(closed()),
        }
    }

    fn recv(&self) -> RuntimeResult<Message> {
        self.rx.recv().map_err(|_| closed())
    }
}
