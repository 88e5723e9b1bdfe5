//! Seams between the engine and the outside world.

use std::rc::Rc;

use caprpc_protocol::Message;

use crate::Promise;
use crate::error::Result;

/// An ordered, message-oriented link to one peer vat.
pub trait Connection<VatId> {
    /// Identity of the vat on the other end.
    fn peer_vat_id(&self) -> VatId;

    /// Queue `message` for delivery. Messages are delivered in send order.
    fn send(&self, message: Message) -> Result<()>;

    /// Next message from the peer, or `None` once the peer has disconnected.
    fn receive_incoming_message(&self) -> Promise<Option<Message>>;

    /// Flush outstanding messages and close the outgoing direction.
    fn shutdown(&self) -> Promise<()>;
}

/// A set of vats this one can talk to.
pub trait VatNetwork<VatId> {
    /// Connection to `host`, or `None` if `host` is this vat.
    fn connect(&self, host: VatId) -> Option<Rc<dyn Connection<VatId>>>;

    /// Next connection initiated by another vat.
    fn accept(&self) -> Promise<Rc<dyn Connection<VatId>>>;
}

/// [`Connection`] with the vat id type erased, as held by the engine.
pub(crate) trait Transport {
    fn send(&self, message: Message) -> Result<()>;

    fn receive_incoming_message(&self) -> Promise<Option<Message>>;

    fn shutdown(&self) -> Promise<()>;
}

pub(crate) struct ConnectionIo<VatId> {
    inner: Rc<dyn Connection<VatId>>,
}

impl<VatId> ConnectionIo<VatId> {
    pub(crate) fn new(inner: Rc<dyn Connection<VatId>>) -> Self {
        Self { inner }
    }
}

impl<VatId> Transport for ConnectionIo<VatId> {
    fn send(&self, message: Message) -> Result<()> {
        self.inner.send(message)
    }

    fn receive_incoming_message(&self) -> Promise<Option<Message>> {
        self.inner.receive_incoming_message()
    }

    fn shutdown(&self) -> Promise<()> {
        self.inner.shutdown()
    }
}
