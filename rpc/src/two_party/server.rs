use std::cell::Cell;
use std::rc::Rc;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use super::Side;
use super::TwoPartyVatNetwork;
use crate::Promise;
use crate::client::Client;
use crate::config::RpcConfig;
use crate::system::RpcSystem;

/// Serves one bootstrap capability to every stream it is given.
pub struct TwoPartyServer {
    bootstrap: Client,
    config: Rc<RpcConfig>,
    live: Rc<LiveConnections>,
}

#[derive(Default)]
struct LiveConnections {
    count: Cell<usize>,
    idle: Notify,
}

/// Counts one served connection for as long as it is alive.
struct LiveGuard(Rc<LiveConnections>);

impl LiveGuard {
    fn new(live: &Rc<LiveConnections>) -> Self {
        live.count.set(live.count.get() + 1);
        Self(live.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let remaining = self.0.count.get().saturating_sub(1);
        self.0.count.set(remaining);
        if remaining == 0 {
            self.0.idle.notify_waiters();
        }
    }
}

impl TwoPartyServer {
    pub fn new(bootstrap: Client) -> Self {
        Self::with_config(bootstrap, RpcConfig::default())
    }

    pub fn with_config(bootstrap: Client, config: RpcConfig) -> Self {
        Self {
            bootstrap,
            config: Rc::new(config),
            live: Rc::new(LiveConnections::default()),
        }
    }

    /// Serve one peer over `reader`/`writer`. The returned promise completes
    /// when the peer goes away; dropping it closes the connection.
    pub fn accept<R, W>(&self, reader: R, writer: W) -> Promise<()>
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin + 'static,
    {
        let network = TwoPartyVatNetwork::new(reader, writer, Side::Server, &self.config.transport);
        let disconnected = network.on_disconnect();
        let system = RpcSystem::new(Box::new(network), Some(self.bootstrap.clone()))
            .with_config(&self.config.rpc);
        let guard = LiveGuard::new(&self.live);
        Box::pin(async move {
            disconnected.await?;
            // The connection sends its own Abort before the system goes.
            system.until_idle().await;
            drop(system);
            drop(guard);
            Ok(())
        })
    }

    /// Number of peers currently being served.
    pub fn connection_count(&self) -> usize {
        self.live.count.get()
    }

    /// Completes once every served peer has disconnected.
    pub async fn drain(&self) {
        loop {
            let idle = self.live.idle.notified();
            if self.live.count.get() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Accept TCP connections forever, serving each on its own local task.
    pub async fn listen(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("set_nodelay failed for {addr}: {e}");
            }
            tracing::info!("accepted connection from {addr}");
            let (reader, writer) = stream.into_split();
            let served = self.accept(reader, writer);
            tokio::task::spawn_local(async move {
                match served.await {
                    Ok(()) => tracing::info!("connection from {addr} closed"),
                    Err(e) => tracing::warn!("connection from {addr} failed: {e}"),
                }
            });
        }
    }
}

/// The client end of a two-party network.
pub struct TwoPartyClient {
    system: RpcSystem<Side>,
    disconnected: Option<Promise<()>>,
}

impl TwoPartyClient {
    pub fn new<R, W>(reader: R, writer: W, config: &RpcConfig) -> Self
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin + 'static,
    {
        let network = TwoPartyVatNetwork::new(reader, writer, Side::Client, &config.transport);
        let disconnected = network.on_disconnect();
        let system = RpcSystem::new(Box::new(network), None).with_config(&config.rpc);
        Self {
            system,
            disconnected: Some(disconnected),
        }
    }

    /// The server's bootstrap capability.
    pub fn bootstrap(&self) -> Client {
        self.system.bootstrap(Side::Server)
    }

    /// Completes when the stream closes. Can be taken once.
    pub fn on_disconnect(&mut self) -> Option<Promise<()>> {
        self.disconnected.take()
    }
}
