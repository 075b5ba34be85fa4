use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// signals drained by the per-peer socket writer task.
pub type Rx = UnboundedReceiver<ChannelSignal>;

/// inner channel signals.
///
/// Outbound traffic to a peer goes through its channel so that a slow socket
/// backpressures only that peer. `Close` asks the writer to shut the socket
/// down after flushing everything queued before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Body(String),
    Close,
}

/// peer outbound sender.
///
/// # Unit Test
///
/// ```
/// use openlink_server_service::channel::*;
///
/// let (tx, mut rx) = Tx::channel();
///
/// assert!(tx.send("hello".to_string()));
/// assert!(tx.close());
///
/// assert_eq!(rx.blocking_recv(), Some(ChannelSignal::Body("hello".to_string())));
/// assert_eq!(rx.blocking_recv(), Some(ChannelSignal::Close));
/// ```
#[derive(Clone)]
pub struct Tx(UnboundedSender<ChannelSignal>);

impl Tx {
    pub fn channel() -> (Self, Rx) {
        let (sender, receiver) = unbounded_channel();
        (Self(sender), receiver)
    }

    /// send a message body to the peer's writer.
    ///
    /// Returns false when the writer is gone, which the caller treats as a
    /// dead peer.
    pub fn send(&self, body: String) -> bool {
        self.0.send(ChannelSignal::Body(body)).is_ok()
    }

    /// ask the writer to close the underlying socket.
    pub fn close(&self) -> bool {
        self.0.send(ChannelSignal::Close).is_ok()
    }
}
