//! Cooperative cancellation for in-flight calls.
//!
//! A call is cancelled only when the caller asked for it (by sending `Finish`)
//! *and* the callee opted in through `CallContext::allow_cancellation`.

use std::cell::Cell;
use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq, Eq)]
pub enum CancelErr {
    Cancelled,
}

/// Race a future against a `CancellationToken`.
#[async_trait(?Send)]
pub trait OrCancelExt: Sized {
    type Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr>;
}

#[async_trait(?Send)]
impl<F> OrCancelExt for F
where
    F: Future,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr> {
        tokio::select! {
            biased;
            res = self => Ok(res),
            _ = token.cancelled() => Err(CancelErr::Cancelled),
        }
    }
}

/// Two-key cancellation switch.
#[derive(Debug, Default)]
pub(crate) struct CancelGate {
    requested: Cell<bool>,
    allowed: Cell<bool>,
    token: CancellationToken,
}

impl CancelGate {
    pub(crate) fn request(&self) {
        self.requested.set(true);
        self.maybe_fire();
    }

    pub(crate) fn allow(&self) {
        self.allowed.set(true);
        self.maybe_fire();
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.get()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn maybe_fire(&self) {
        if self.requested.get() && self.allowed.get() {
            self.token.cancel();
        }
    }
}
