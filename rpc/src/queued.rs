//! Placeholders for capabilities and pipelines that are not known yet.
//!
//! Calls made on a [`QueuedClient`] before it resolves are held in arrival
//! order and replayed on the resolution synchronously, so nothing sent later
//! can overtake them.

use std::cell::RefCell;
use std::rc::Rc;

use caprpc_protocol::PipelineOp;
use tokio::sync::oneshot;

use crate::Promise;
use crate::client::Client;
use crate::client::Hook;
use crate::error::Error;
use crate::error::Result;
use crate::pipeline::PipelineHook;
use crate::server::CallContextHook;

type QueuedCall = Box<dyn FnOnce(&Client)>;

pub(crate) struct QueuedClient {
    redirect: RefCell<Option<Client>>,
    queued: RefCell<Vec<QueuedCall>>,
    waiters: RefCell<Vec<oneshot::Sender<Client>>>,
}

impl QueuedClient {
    pub(crate) fn new() -> (Client, ClientResolver) {
        let queued = Rc::new(QueuedClient {
            redirect: RefCell::new(None),
            queued: RefCell::new(Vec::new()),
            waiters: RefCell::new(Vec::new()),
        });
        let resolver = ClientResolver {
            target: Some(queued.clone()),
        };
        (Client::from_hook(Hook::Queued(queued)), resolver)
    }

    fn resolve(&self, result: Result<Client>) {
        if self.redirect.borrow().is_some() {
            return;
        }
        let client = result.unwrap_or_else(Client::broken);
        *self.redirect.borrow_mut() = Some(client.clone());

        let queued = std::mem::take(&mut *self.queued.borrow_mut());
        for call in queued {
            call(&client);
        }
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waiter in waiters {
            let _ = waiter.send(client.clone());
        }
    }

    pub(crate) fn resolved(&self) -> Option<Client> {
        self.redirect.borrow().clone()
    }

    pub(crate) fn when_more_resolved(&self) -> Promise<Client> {
        if let Some(client) = self.resolved() {
            return Box::pin(async move { Ok(client) });
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.borrow_mut().push(tx);
        Box::pin(async move {
            rx.await
                .map_err(|_| Error::failed("Promise was dropped without being resolved."))
        })
    }

    pub(crate) fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        context: Rc<dyn CallContextHook>,
    ) -> (Promise<()>, Rc<dyn PipelineHook>) {
        if let Some(client) = self.resolved() {
            return client.call(interface_id, method_id, context);
        }

        let (pipeline, pipeline_resolver) = QueuedPipeline::new();
        let (tx, rx) = oneshot::channel::<Promise<()>>();
        self.queued.borrow_mut().push(Box::new(move |client: &Client| {
            let (promise, forwarded) = client.call(interface_id, method_id, context);
            pipeline_resolver.resolve(Ok(forwarded));
            let _ = tx.send(promise);
        }));

        let promise = Box::pin(async move {
            match rx.await {
                Ok(promise) => promise.await,
                Err(_) => Err(Error::failed(
                    "Queued call was dropped before its target resolved.",
                )),
            }
        });
        let pipeline: Rc<dyn PipelineHook> = pipeline;
        (promise, pipeline)
    }
}

/// Settles a [`QueuedClient`]. Dropping it unused breaks the client.
pub(crate) struct ClientResolver {
    target: Option<Rc<QueuedClient>>,
}

impl ClientResolver {
    pub(crate) fn resolve(mut self, result: Result<Client>) {
        if let Some(target) = self.target.take() {
            target.resolve(result);
        }
    }
}

impl Drop for ClientResolver {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            target.resolve(Err(Error::failed(
                "Promise was dropped without being resolved.",
            )));
        }
    }
}

struct Waiting {
    ops: Vec<PipelineOp>,
    client: Client,
    resolver: ClientResolver,
}

/// Pipeline for a call whose real pipeline is not available yet.
pub(crate) struct QueuedPipeline {
    redirect: RefCell<Option<Result<Rc<dyn PipelineHook>>>>,
    waiting: RefCell<Vec<Waiting>>,
}

impl QueuedPipeline {
    pub(crate) fn new() -> (Rc<Self>, PipelineResolver) {
        let pipeline = Rc::new(QueuedPipeline {
            redirect: RefCell::new(None),
            waiting: RefCell::new(Vec::new()),
        });
        let resolver = PipelineResolver {
            target: Some(pipeline.clone()),
        };
        (pipeline, resolver)
    }

    /// Later calls are ignored; the first resolution wins.
    pub(crate) fn resolve(&self, result: Result<Rc<dyn PipelineHook>>) {
        if self.redirect.borrow().is_some() {
            return;
        }
        *self.redirect.borrow_mut() = Some(result.clone());

        let waiting = std::mem::take(&mut *self.waiting.borrow_mut());
        for Waiting {
            ops,
            client,
            resolver,
        } in waiting
        {
            let target = match &result {
                Ok(pipeline) => Ok(pipeline.get_pipelined_cap(&ops)),
                Err(e) => Err(e.clone()),
            };
            resolver.resolve(target);
            drop(client);
        }
    }
}

impl PipelineHook for QueuedPipeline {
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Client {
        let redirect = self.redirect.borrow().clone();
        match redirect {
            Some(Ok(pipeline)) => pipeline.get_pipelined_cap(ops),
            Some(Err(e)) => Client::broken(e),
            None => {
                let mut waiting = self.waiting.borrow_mut();
                if let Some(existing) = waiting.iter().find(|w| w.ops == ops) {
                    return existing.client.clone();
                }
                let (client, resolver) = QueuedClient::new();
                waiting.push(Waiting {
                    ops: ops.to_vec(),
                    client: client.clone(),
                    resolver,
                });
                client
            }
        }
    }
}

/// Settles a [`QueuedPipeline`]. Dropping it unused breaks the pipeline.
pub(crate) struct PipelineResolver {
    target: Option<Rc<QueuedPipeline>>,
}

impl PipelineResolver {
    pub(crate) fn resolve(mut self, result: Result<Rc<dyn PipelineHook>>) {
        if let Some(target) = self.target.take() {
            target.resolve(result);
        }
    }
}

impl Drop for PipelineResolver {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            target.resolve(Err(Error::failed(
                "Pipeline was dropped before the call completed.",
            )));
        }
    }
}
