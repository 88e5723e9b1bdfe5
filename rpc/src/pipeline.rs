use std::cell::RefCell;
use std::rc::Rc;

use caprpc_protocol::PipelineOp;

use crate::client::Client;
use crate::error::Error;
use crate::payload::Payload;

/// Source of capabilities for a call whose results may not have arrived yet.
pub(crate) trait PipelineHook {
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Client;
}

/// Pipeline over results that live in this vat.
pub(crate) struct LocalPipeline {
    results: Rc<RefCell<Payload>>,
}

impl LocalPipeline {
    pub(crate) fn new(results: Rc<RefCell<Payload>>) -> Self {
        Self { results }
    }
}

impl PipelineHook for LocalPipeline {
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Client {
        self.results.borrow().get_pipelined_cap(ops)
    }
}

pub(crate) struct BrokenPipeline {
    error: Error,
}

impl BrokenPipeline {
    pub(crate) fn new(error: Error) -> Self {
        Self { error }
    }
}

impl PipelineHook for BrokenPipeline {
    fn get_pipelined_cap(&self, _ops: &[PipelineOp]) -> Client {
        Client::broken(self.error.clone())
    }
}
