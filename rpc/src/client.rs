//! Capability references.
//!
//! A [`Client`] is a cheap, clonable handle to something that can be called.
//! What it points at is one of a closed set of variants: a server in this vat,
//! a queue waiting for its target, an object imported from a peer, a promise
//! for such an object, a pipelined answer, a broken reference, or a blocker
//! that delays loopback calls until an embargo lifts.

use std::fmt;
use std::rc::Rc;

use crate::Promise;
use crate::connection::clients::ImportClient;
use crate::connection::clients::PipelineClient;
use crate::connection::clients::PromiseClient;
use crate::error::Error;
use crate::local::LocalClient;
use crate::local::local_send;
use crate::payload::Payload;
use crate::pipeline::BrokenPipeline;
use crate::pipeline::PipelineHook;
use crate::queued::QueuedClient;
use crate::request::RemotePromise;
use crate::request::Request;
use crate::server::CallContextHook;
use crate::server::Server;

/// Which implementation family a client belongs to.
///
/// Two clients share a brand when the same connection can address both
/// directly, which is what decides whether a resolution loops back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Brand {
    Local,
    Broken,
    Blocker,
    Connection(u64),
}

#[derive(Clone)]
pub struct Client {
    pub(crate) hook: Hook,
}

#[derive(Clone)]
pub(crate) enum Hook {
    Local(Rc<LocalClient>),
    Queued(Rc<QueuedClient>),
    Import(Rc<ImportClient>),
    Promise(Rc<PromiseClient>),
    Pipeline(Rc<PipelineClient>),
    Broken(Rc<BrokenClient>),
    Blocker(Rc<TribbleRaceBlocker>),
}

pub(crate) struct BrokenClient {
    error: Error,
    is_null: bool,
}

/// Wraps a capability that was handed back to the connection that hosts it.
///
/// Calls are forwarded to `inner`, but the blocker reports itself as fully
/// resolved and unbranded so it is never shortened to the underlying import.
/// Shortening it would let new calls overtake calls still in flight on the
/// peer.
pub(crate) struct TribbleRaceBlocker {
    inner: Client,
}

impl TribbleRaceBlocker {
    pub(crate) fn wrap(inner: Client) -> Client {
        Client::from_hook(Hook::Blocker(Rc::new(TribbleRaceBlocker { inner })))
    }
}

impl Client {
    pub(crate) fn from_hook(hook: Hook) -> Self {
        Self { hook }
    }

    /// Wrap a local server.
    pub fn new<S: Server + 'static>(server: S) -> Self {
        Self::from_server(Rc::new(server))
    }

    pub fn from_server(server: Rc<dyn Server>) -> Self {
        Self::from_hook(Hook::Local(Rc::new(LocalClient::new(server))))
    }

    /// A client whose every call fails with `error`.
    pub fn broken(error: Error) -> Self {
        Self::from_hook(Hook::Broken(Rc::new(BrokenClient {
            error,
            is_null: false,
        })))
    }

    /// The null capability. Calling it fails, but it is not a promise and is
    /// transmitted as `none`.
    pub fn null() -> Self {
        Self::from_hook(Hook::Broken(Rc::new(BrokenClient {
            error: Error::failed("Called null capability."),
            is_null: true,
        })))
    }

    pub fn is_null(&self) -> bool {
        matches!(&self.hook, Hook::Broken(broken) if broken.is_null)
    }

    /// The error every call on this client fails with, if it is broken.
    pub fn broken_error(&self) -> Option<&Error> {
        match &self.hook {
            Hook::Broken(broken) => Some(&broken.error),
            _ => None,
        }
    }

    pub fn new_call(&self, interface_id: u64, method_id: u16) -> Request {
        Request::new(self.clone(), interface_id, method_id)
    }

    /// The client this one has already resolved to, if it is a settled promise.
    pub fn resolved(&self) -> Option<Client> {
        match &self.hook {
            Hook::Queued(queued) => queued.resolved(),
            Hook::Promise(promise) => promise.resolved(),
            _ => None,
        }
    }

    /// Completes when this client resolves to something more specific.
    ///
    /// `None` means the client is already as resolved as it will get.
    pub fn when_more_resolved(&self) -> Option<Promise<Client>> {
        match &self.hook {
            Hook::Queued(queued) => Some(queued.when_more_resolved()),
            Hook::Promise(promise) => Some(promise.when_more_resolved()),
            Hook::Broken(broken) if !broken.is_null => {
                let error = broken.error.clone();
                Some(Box::pin(async move { Err(error) }))
            }
            _ => None,
        }
    }

    /// Completes once the whole resolution chain has settled, failing if it
    /// settled on a broken reference.
    pub fn when_resolved(&self) -> Promise<()> {
        let mut current = self.clone();
        Box::pin(async move {
            while let Some(more) = current.when_more_resolved() {
                current = more.await?;
            }
            Ok(())
        })
    }

    pub(crate) fn brand(&self) -> Brand {
        match &self.hook {
            Hook::Local(_) | Hook::Queued(_) => Brand::Local,
            Hook::Import(import) => Brand::Connection(import.connection().id()),
            Hook::Promise(promise) => Brand::Connection(promise.connection().id()),
            Hook::Pipeline(pipeline) => Brand::Connection(pipeline.connection().id()),
            Hook::Broken(_) => Brand::Broken,
            Hook::Blocker(_) => Brand::Blocker,
        }
    }

    /// Follow already-known resolutions to the end of the chain.
    pub(crate) fn innermost(&self) -> Client {
        let mut current = self.clone();
        while let Some(next) = current.resolved() {
            current = next;
        }
        current
    }

    /// Pointer identity, used to key export lookups.
    pub(crate) fn identity(&self) -> usize {
        match &self.hook {
            Hook::Local(c) => Rc::as_ptr(c) as *const () as usize,
            Hook::Queued(c) => Rc::as_ptr(c) as *const () as usize,
            Hook::Import(c) => Rc::as_ptr(c) as *const () as usize,
            Hook::Promise(c) => Rc::as_ptr(c) as *const () as usize,
            Hook::Pipeline(c) => Rc::as_ptr(c) as *const () as usize,
            Hook::Broken(c) => Rc::as_ptr(c) as *const () as usize,
            Hook::Blocker(c) => Rc::as_ptr(c) as *const () as usize,
        }
    }

    /// Deliver a call whose parameters and results are owned by `context`.
    pub(crate) fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        context: Rc<dyn CallContextHook>,
    ) -> (Promise<()>, Rc<dyn PipelineHook>) {
        match &self.hook {
            Hook::Local(local) => local.call(interface_id, method_id, context),
            Hook::Queued(queued) => queued.call(interface_id, method_id, context),
            Hook::Import(_) | Hook::Pipeline(_) => {
                forward_call(self, interface_id, method_id, context)
            }
            Hook::Promise(promise) => {
                promise.mark_received_call();
                promise.cap().call(interface_id, method_id, context)
            }
            Hook::Broken(broken) => broken_call(broken.error.clone()),
            Hook::Blocker(blocker) => blocker.inner.call(interface_id, method_id, context),
        }
    }

    /// Start a call with freshly built parameters.
    pub(crate) fn send(&self, interface_id: u64, method_id: u16, params: Payload) -> RemotePromise {
        match &self.hook {
            Hook::Import(import) => {
                let connection = import.connection().clone();
                connection.send_request(self.clone(), interface_id, method_id, params)
            }
            Hook::Pipeline(pipeline) => {
                let connection = pipeline.connection().clone();
                connection.send_request(self.clone(), interface_id, method_id, params)
            }
            Hook::Promise(promise) => {
                promise.mark_received_call();
                promise.cap().send(interface_id, method_id, params)
            }
            Hook::Blocker(blocker) => blocker.inner.send(interface_id, method_id, params),
            Hook::Broken(broken) => RemotePromise::broken(broken.error.clone()),
            Hook::Local(_) | Hook::Queued(_) => {
                local_send(self, interface_id, method_id, params)
            }
        }
    }
}

pub(crate) fn broken_call(error: Error) -> (Promise<()>, Rc<dyn PipelineHook>) {
    let pipeline: Rc<dyn PipelineHook> = Rc::new(BrokenPipeline::new(error.clone()));
    (Box::pin(async move { Err(error) }), pipeline)
}

/// Re-issue a call that arrived through a context as an outgoing request on
/// the target's connection.
fn forward_call(
    target: &Client,
    interface_id: u64,
    method_id: u16,
    context: Rc<dyn CallContextHook>,
) -> (Promise<()>, Rc<dyn PipelineHook>) {
    let params = match context.params() {
        Ok(params) => Payload::clone(&params),
        Err(e) => return broken_call(e),
    };
    context.release_params();
    let request = target
        .new_call(interface_id, method_id)
        .with_params(params);
    context.direct_tail_call(request)
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hook {
            Hook::Local(_) => f.write_str("Client(local)"),
            Hook::Queued(_) => f.write_str("Client(queued)"),
            Hook::Import(import) => write!(f, "Client(import#{})", import.import_id()),
            Hook::Promise(promise) => match promise.import_id() {
                Some(id) => write!(f, "Client(promise#{id})"),
                None => f.write_str("Client(promise)"),
            },
            Hook::Pipeline(_) => f.write_str("Client(pipeline)"),
            Hook::Broken(broken) if broken.is_null => f.write_str("Client(null)"),
            Hook::Broken(broken) => write!(f, "Client(broken: {})", broken.error),
            Hook::Blocker(_) => f.write_str("Client(blocker)"),
        }
    }
}
