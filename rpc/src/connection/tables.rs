//! Per-connection bookkeeping tables.
//!
//! Questions, exports and embargoes use ids chosen by this side, allocated
//! from an [`ExportTable`] that hands out the lowest free id. Answers and
//! imports use ids chosen by the peer and live in an [`ImportTable`].

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::rc::Rc;
use std::rc::Weak;

use caprpc_protocol::ExportId;
use futures::future::Shared;
use tokio::task::JoinHandle;

use crate::Promise;
use crate::client::Client;
use crate::connection::call_context::RpcCallContext;
use crate::connection::clients::ImportClient;
use crate::connection::clients::PromiseClient;
use crate::connection::clients::QuestionRef;
use crate::pipeline::PipelineHook;
use crate::queued::ClientResolver;
use crate::request::Response;

pub(crate) struct ExportTable<T> {
    slots: Vec<Option<T>>,
    free: BinaryHeap<Reverse<u32>>,
}

impl<T> Default for ExportTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: BinaryHeap::new(),
        }
    }
}

impl<T> ExportTable<T> {
    /// Store `value` under the lowest id not currently in use.
    pub(crate) fn next(&mut self, value: T) -> u32 {
        if let Some(Reverse(id)) = self.free.pop() {
            self.slots[id as usize] = Some(value);
            return id;
        }
        let id = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Some(value));
        id
    }

    pub(crate) fn find(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    pub(crate) fn find_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Remove the entry and make its id available again.
    pub(crate) fn erase(&mut self, id: u32) -> Option<T> {
        let value = self.slots.get_mut(id as usize).and_then(Option::take);
        if value.is_some() {
            self.free.push(Reverse(id));
        }
        value
    }

    /// Empty the table, returning every live entry.
    pub(crate) fn take_all(&mut self) -> Vec<(u32, T)> {
        let slots = std::mem::take(&mut self.slots);
        self.free.clear();
        slots
            .into_iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.map(|value| (id as u32, value)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

pub(crate) struct ImportTable<T> {
    slots: HashMap<u32, T>,
}

impl<T> Default for ImportTable<T> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<T> ImportTable<T> {
    pub(crate) fn find(&self, id: u32) -> Option<&T> {
        self.slots.get(&id)
    }

    pub(crate) fn find_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(&id)
    }

    pub(crate) fn insert(&mut self, id: u32, value: T) -> Option<T> {
        self.slots.insert(id, value)
    }

    pub(crate) fn erase(&mut self, id: u32) -> Option<T> {
        self.slots.remove(&id)
    }

    pub(crate) fn take_all(&mut self) -> Vec<(u32, T)> {
        std::mem::take(&mut self.slots).into_iter().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

impl<T: Default> ImportTable<T> {
    pub(crate) fn get_or_default(&mut self, id: u32) -> &mut T {
        self.slots.entry(id).or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entries
// ─────────────────────────────────────────────────────────────────────────────

/// A call this side made and has not finished with.
pub(crate) struct Question {
    pub(crate) is_awaiting_return: bool,
    /// Exports created while writing the call's parameters.
    pub(crate) param_exports: Vec<ExportId>,
    pub(crate) is_tail_call: bool,
    /// Cleared when the application drops every handle on the question.
    pub(crate) self_ref: Option<Weak<QuestionRef>>,
    /// Set once the Return's result capabilities were taken into the import
    /// table, which makes them our responsibility to release.
    pub(crate) result_caps_imported: bool,
}

impl Default for Question {
    fn default() -> Self {
        Self {
            is_awaiting_return: true,
            param_exports: Vec::new(),
            is_tail_call: false,
            self_ref: None,
            result_caps_imported: false,
        }
    }
}

/// A call the peer made to this side.
#[derive(Default)]
pub(crate) struct Answer {
    /// False once Finish arrived.
    pub(crate) active: bool,
    pub(crate) pipeline: Option<Rc<dyn PipelineHook>>,
    /// Results of a call made with `sendResultsTo = yourself`.
    pub(crate) redirected_results: Option<Shared<Promise<Response>>>,
    /// Present while the call is still running.
    pub(crate) call_context: Option<Rc<RpcCallContext>>,
    pub(crate) result_exports: Vec<ExportId>,
}

pub(crate) struct Export {
    pub(crate) refcount: u32,
    pub(crate) client: Client,
    /// Task that sends `Resolve` once an exported promise settles.
    pub(crate) resolve_op: Option<JoinHandle<()>>,
}

impl Drop for Export {
    fn drop(&mut self) {
        if let Some(op) = self.resolve_op.take() {
            op.abort();
        }
    }
}

#[derive(Default)]
pub(crate) struct Import {
    pub(crate) import_client: Option<Weak<ImportClient>>,
    /// The promise wrapper handed to the application for a promise import.
    pub(crate) app_client: Option<Weak<PromiseClient>>,
}

pub(crate) struct Embargo {
    /// What the promise resolved to; calls queue until the loopback returns.
    pub(crate) target: Client,
    pub(crate) resolver: ClientResolver,
}
