//! Demo service served by `caprpc serve`.

use std::cell::Cell;

use caprpc::CallContext;
use caprpc::Client;
use caprpc::Error;
use caprpc::Payload;
use caprpc::Promise;
use caprpc::Request;
use caprpc::Server;
use caprpc::Value;
use caprpc::unimplemented_method;

pub const ECHO_INTERFACE_ID: u64 = 0xc6a0_d1f3_5e4b_9a27;

pub mod method {
    /// `echo(text) -> (text, count)`
    pub const ECHO: u16 = 0;
    /// `reverse(text) -> (text, count)`
    pub const REVERSE: u16 = 1;
}

/// Echoes text back, counting the calls it has served.
#[derive(Default)]
pub struct Echo {
    served: Cell<u64>,
}

impl Server for Echo {
    fn dispatch_call(
        &self,
        interface_id: u64,
        method_id: u16,
        context: CallContext,
    ) -> Promise<()> {
        if interface_id != ECHO_INTERFACE_ID
            || !matches!(method_id, method::ECHO | method::REVERSE)
        {
            return unimplemented_method(interface_id, method_id);
        }

        let text = match context.params().and_then(|params| {
            params
                .content
                .get("text")
                .and_then(Value::as_text)
                .map(str::to_string)
                .ok_or_else(|| Error::failed("echo: missing 'text' parameter"))
        }) {
            Ok(text) => text,
            Err(e) => return Box::pin(futures::future::ready(Err(e))),
        };
        let text = if method_id == method::REVERSE {
            text.chars().rev().collect()
        } else {
            text
        };

        let count = self.served.get() + 1;
        self.served.set(count);
        tracing::debug!(count, "echo served");
        context.set_results(Payload::new(Value::structure([
            ("text", Value::text(text)),
            ("count", Value::UInt(count)),
        ])));
        Box::pin(futures::future::ready(Ok(())))
    }
}

pub fn echo_request(echo: &Client, method_id: u16, text: &str) -> Request {
    echo.new_call(ECHO_INTERFACE_ID, method_id)
        .with_content(Value::structure([("text", Value::text(text))]))
}
