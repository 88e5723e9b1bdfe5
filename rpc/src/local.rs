//! Calls on servers hosted in this vat.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use tokio::sync::oneshot;

use crate::Promise;
use crate::client::Client;
use crate::error::Error;
use crate::error::Result;
use crate::payload::Payload;
use crate::pipeline::LocalPipeline;
use crate::pipeline::PipelineHook;
use crate::queued::QueuedPipeline;
use crate::request::Pipeline;
use crate::request::RemotePromise;
use crate::request::Request;
use crate::request::Response;
use crate::server::CallContext;
use crate::server::CallContextHook;
use crate::server::Server;

pub(crate) struct LocalClient {
    server: Rc<dyn Server>,
}

impl LocalClient {
    pub(crate) fn new(server: Rc<dyn Server>) -> Self {
        Self { server }
    }

    pub(crate) fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        context: Rc<dyn CallContextHook>,
    ) -> (Promise<()>, Rc<dyn PipelineHook>) {
        let (pipeline, resolver) = QueuedPipeline::new();
        context.set_pipeline(Rc::downgrade(&pipeline));

        let dispatched =
            self.server
                .dispatch_call(interface_id, method_id, CallContext::new(context.clone()));

        let promise = Box::pin(async move {
            let result = dispatched.await;
            context.release_params();
            match &result {
                Ok(()) => {
                    let results: Rc<dyn PipelineHook> =
                        Rc::new(LocalPipeline::new(context.results()));
                    resolver.resolve(Ok(results));
                }
                Err(e) => resolver.resolve(Err(e.clone())),
            }
            result
        });
        let pipeline: Rc<dyn PipelineHook> = pipeline;
        (promise, pipeline)
    }
}

/// Context for a call made from this vat.
pub(crate) struct LocalCallContext {
    params: RefCell<Option<Rc<Payload>>>,
    results: Rc<RefCell<Payload>>,
    pipeline: RefCell<Weak<QueuedPipeline>>,
}

impl LocalCallContext {
    pub(crate) fn new(params: Payload) -> Self {
        Self {
            params: RefCell::new(Some(Rc::new(params))),
            results: Rc::new(RefCell::new(Payload::default())),
            pipeline: RefCell::new(Weak::new()),
        }
    }
}

impl CallContextHook for LocalCallContext {
    fn params(&self) -> Result<Rc<Payload>> {
        self.params
            .borrow()
            .clone()
            .ok_or_else(|| Error::failed("Can't get params after release_params()."))
    }

    fn release_params(&self) {
        let params = self.params.borrow_mut().take();
        drop(params);
    }

    fn results(&self) -> Rc<RefCell<Payload>> {
        self.results.clone()
    }

    fn pipeline(&self) -> Weak<QueuedPipeline> {
        self.pipeline.borrow().clone()
    }

    fn set_pipeline(&self, pipeline: Weak<QueuedPipeline>) {
        *self.pipeline.borrow_mut() = pipeline;
    }

    // Local calls always run to completion.
    fn allow_cancellation(&self) {}

    fn direct_tail_call(&self, request: Request) -> (Promise<()>, Rc<dyn PipelineHook>) {
        forward_results(self.results.clone(), request)
    }
}

/// Send `request` and copy its response into `results` when it arrives.
pub(crate) fn forward_results(
    results: Rc<RefCell<Payload>>,
    request: Request,
) -> (Promise<()>, Rc<dyn PipelineHook>) {
    let RemotePromise { promise, pipeline } = request.send();
    let copied = Box::pin(async move {
        let response = promise.await?;
        let payload = response.get().clone();
        let previous = std::mem::replace(&mut *results.borrow_mut(), payload);
        drop(previous);
        Ok(())
    });
    (copied, pipeline.into_hook())
}

/// Call a client in this vat.
///
/// The server is invoked right away and its promise is driven by a local
/// task, so the call proceeds even if the caller drops the returned promise.
pub(crate) fn local_send(
    target: &Client,
    interface_id: u64,
    method_id: u16,
    params: Payload,
) -> RemotePromise {
    let context = Rc::new(LocalCallContext::new(params));
    let results = context.results();
    let (promise, pipeline) = target.call(interface_id, method_id, context);

    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_local(async move {
        let outcome = promise.await.map(|()| Response::local(results));
        let _ = tx.send(outcome);
    });

    RemotePromise {
        promise: Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(Error::failed("Call was dropped before it completed.")))
        }),
        pipeline: Pipeline::new(pipeline),
    }
}
