//! Ties a [`VatNetwork`] to the connection engine.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;
use std::rc::Weak;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::config::EngineConfig;
use crate::connection::ConnectionState;
use crate::connection::message_loop;
use crate::error::Error;
use crate::network::Connection;
use crate::network::ConnectionIo;
use crate::network::VatNetwork;

/// Builds the bootstrap capability handed to each new peer.
pub trait BootstrapFactory<VatId> {
    /// Called once per connection, with the peer's identity.
    fn create_for(&self, client_id: &VatId) -> Client;
}

enum Bootstrap<VatId> {
    None,
    Client(Client),
    Factory(Box<dyn BootstrapFactory<VatId>>),
}

struct Inner<VatId> {
    network: Box<dyn VatNetwork<VatId>>,
    bootstrap: Bootstrap<VatId>,
    connections: Rc<RefCell<HashMap<VatId, Rc<ConnectionState>>>>,
    /// Signalled whenever a connection ends.
    closed: Rc<Notify>,
    trace_messages: bool,
}

/// One vat's RPC endpoint: a connection per peer, created on demand or as
/// peers connect in.
///
/// Must be created inside a [`tokio::task::LocalSet`]; it starts a task that
/// accepts incoming connections for as long as the system lives.
pub struct RpcSystem<VatId>
where
    VatId: Clone + Eq + Hash + Debug + 'static,
{
    inner: Rc<RefCell<Inner<VatId>>>,
    accept_loop: Option<JoinHandle<()>>,
}

impl<VatId> RpcSystem<VatId>
where
    VatId: Clone + Eq + Hash + Debug + 'static,
{
    /// `bootstrap` is what peers get when they ask; `None` refuses them.
    pub fn new(network: Box<dyn VatNetwork<VatId>>, bootstrap: Option<Client>) -> Self {
        let bootstrap = match bootstrap {
            Some(client) => Bootstrap::Client(client),
            None => Bootstrap::None,
        };
        Self::with_bootstrap(network, bootstrap)
    }

    /// Like [`RpcSystem::new`], but each peer gets its own bootstrap
    /// capability from `factory`.
    pub fn with_bootstrap_factory(
        network: Box<dyn VatNetwork<VatId>>,
        factory: Box<dyn BootstrapFactory<VatId>>,
    ) -> Self {
        Self::with_bootstrap(network, Bootstrap::Factory(factory))
    }

    fn with_bootstrap(network: Box<dyn VatNetwork<VatId>>, bootstrap: Bootstrap<VatId>) -> Self {
        let inner = Rc::new(RefCell::new(Inner {
            network,
            bootstrap,
            connections: Rc::new(RefCell::new(HashMap::new())),
            closed: Rc::new(Notify::new()),
            trace_messages: false,
        }));
        let accept_loop = tokio::task::spawn_local(accept_loop(Rc::downgrade(&inner)));
        Self {
            inner,
            accept_loop: Some(accept_loop),
        }
    }

    /// Apply engine settings to connections created from now on.
    pub fn with_config(self, config: &EngineConfig) -> Self {
        self.inner.borrow_mut().trace_messages = config.trace_messages;
        self
    }

    /// The bootstrap capability of `vat`.
    ///
    /// Asking for our own vat returns the local bootstrap capability.
    pub fn bootstrap(&self, vat: VatId) -> Client {
        let connection = self.inner.borrow().network.connect(vat);
        match connection {
            Some(connection) => {
                let state = get_connection_state(&self.inner, connection);
                state.bootstrap()
            }
            None => match &self.inner.borrow().bootstrap {
                Bootstrap::Client(client) => client.clone(),
                Bootstrap::Factory(_) | Bootstrap::None => {
                    Client::broken(Error::failed("No bootstrap interface available"))
                }
            },
        }
    }

    /// Start serving a connection that was established outside the network's
    /// `accept`.
    pub fn accept(&self, connection: Rc<dyn Connection<VatId>>) {
        get_connection_state(&self.inner, connection);
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.borrow().connections.borrow().len()
    }

    /// Completes once no connection is live, letting each one finish its
    /// own disconnect first.
    pub async fn until_idle(&self) {
        let closed = self.inner.borrow().closed.clone();
        loop {
            let notified = closed.notified();
            if self.connection_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl<VatId> Drop for RpcSystem<VatId>
where
    VatId: Clone + Eq + Hash + Debug + 'static,
{
    fn drop(&mut self) {
        if let Some(accept_loop) = self.accept_loop.take() {
            accept_loop.abort();
        }
        let connections: Vec<_> = {
            let inner = self.inner.borrow();
            let mut connections = inner.connections.borrow_mut();
            connections.drain().map(|(_, state)| state).collect()
        };
        for state in connections {
            state.disconnect(Error::disconnected("RpcSystem was destroyed."));
        }
    }
}

async fn accept_loop<VatId>(inner: Weak<RefCell<Inner<VatId>>>)
where
    VatId: Clone + Eq + Hash + Debug + 'static,
{
    loop {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let accepted = strong.borrow().network.accept();
        drop(strong);
        let connection = match accepted.await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::debug!("accept loop ended: {e}");
                return;
            }
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        get_connection_state(&inner, connection);
    }
}

/// Find the engine for `connection`'s peer, creating it (and starting its
/// message loop) on first contact.
fn get_connection_state<VatId>(
    inner: &Rc<RefCell<Inner<VatId>>>,
    connection: Rc<dyn Connection<VatId>>,
) -> Rc<ConnectionState>
where
    VatId: Clone + Eq + Hash + Debug + 'static,
{
    let vat_id = connection.peer_vat_id();
    let (connections, closed, existing) = {
        let inner = inner.borrow();
        let existing = inner.connections.borrow().get(&vat_id).cloned();
        (inner.connections.clone(), inner.closed.clone(), existing)
    };
    if let Some(existing) = existing {
        return existing;
    }

    let (bootstrap_cap, trace_messages) = {
        let inner = inner.borrow();
        let cap = match &inner.bootstrap {
            Bootstrap::Client(client) => client.clone(),
            Bootstrap::Factory(factory) => factory.create_for(&vat_id),
            Bootstrap::None => Client::broken(Error::failed(
                "This vat does not expose any public/bootstrap interfaces.",
            )),
        };
        (cap, inner.trace_messages)
    };

    tracing::debug!("new connection to {vat_id:?}");
    let state = ConnectionState::new(
        Rc::new(ConnectionIo::new(connection)),
        bootstrap_cap,
        trace_messages,
    );

    let connection_id = state.id();
    let weak_connections = Rc::downgrade(&connections);
    let key = vat_id.clone();
    state.set_on_disconnect(Box::new(move |_| {
        let Some(connections) = weak_connections.upgrade() else {
            return;
        };
        let removed = {
            let mut connections = connections.borrow_mut();
            match connections.get(&key) {
                Some(state) if state.id() == connection_id => connections.remove(&key),
                _ => None,
            }
        };
        if removed.is_some() {
            closed.notify_waiters();
        }
        drop(removed);
    }));

    connections.borrow_mut().insert(vat_id, state.clone());
    tokio::task::spawn_local(message_loop(state.clone()));
    state
}
