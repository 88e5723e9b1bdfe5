//! Call parameters and results as seen by application code.

use std::fmt;

use caprpc_protocol::PipelineOp;
use caprpc_protocol::Value;

use crate::client::Client;
use crate::error::Error;

/// A [`Value`] document plus the live capabilities its `Capability(i)` leaves
/// point at.
#[derive(Clone, Default)]
pub struct Payload {
    pub content: Value,
    pub cap_table: Vec<Client>,
}

impl Payload {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            cap_table: Vec::new(),
        }
    }

    pub fn with_caps(content: Value, cap_table: Vec<Client>) -> Self {
        Self { content, cap_table }
    }

    /// Append a capability and return the value that refers to it.
    pub fn add_cap(&mut self, client: Client) -> Value {
        let index = u32::try_from(self.cap_table.len()).unwrap_or(u32::MAX);
        self.cap_table.push(client);
        Value::Capability(index)
    }

    /// The capability at `index`, or a null capability if the table is shorter.
    pub fn get_cap(&self, index: u32) -> Client {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.cap_table.get(i))
            .cloned()
            .unwrap_or_else(Client::null)
    }

    /// Resolve a pipeline path against the content.
    ///
    /// A null pointer yields the null capability. Any other non-capability
    /// value yields a broken capability, so calls through it fail rather than
    /// the whole connection.
    pub fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Client {
        match self.content.follow(ops) {
            Ok(Value::Capability(index)) => self.get_cap(*index),
            Ok(Value::Null) => Client::null(),
            Ok(_) => Client::broken(Error::failed(
                "Pipeline path does not point to a capability.",
            )),
            Err(e) => Client::broken(Error::failed(e.to_string())),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("content", &self.content)
            .field("cap_table", &self.cap_table)
            .finish()
    }
}
