//! Work handler contract.
//!
//! Every worker runs one [`WorkHandler`]: an async function from a
//! [`WorkRequest`] to a [`WorkResult`]. Plain async closures implement it
//! directly. [`callback`] adapts completion-callback style code onto the
//! same contract.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::model::{WorkRequest, WorkResult};

/// Async function that performs the actual work for a request.
pub trait WorkHandler: Send + Sync + 'static {
    fn call(&self, request: WorkRequest) -> BoxFuture<'static, WorkResult>;
}

impl<F, Fut> WorkHandler for F
where
    F: Fn(WorkRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
{
    fn call(&self, request: WorkRequest) -> BoxFuture<'static, WorkResult> {
        Box::pin(self(request))
    }
}

/// Shared, type-erased handler as stored by workers.
pub type SharedHandler = Arc<dyn WorkHandler>;

/// A running request handed to a callback-style handler.
///
/// Report the outcome with [`complete`](Self::complete),
/// [`fail`](Self::fail) or [`fatal`](Self::fatal). Dropping the task
/// without reporting counts as a failure.
#[derive(Debug)]
pub struct WorkTask {
    request: WorkRequest,
    done: Option<oneshot::Sender<WorkResult>>,
}

impl WorkTask {
    pub fn request(&self) -> &WorkRequest {
        &self.request
    }

    pub fn complete(self) {
        self.finish(WorkResult::Success);
    }

    pub fn fail(self) {
        self.finish(WorkResult::Failure);
    }

    pub fn fatal(self) {
        self.finish(WorkResult::Fatal);
    }

    fn finish(mut self, result: WorkResult) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

/// Adapt a callback-style launcher into a [`WorkHandler`].
pub fn callback<F>(launch: F) -> impl WorkHandler
where
    F: Fn(WorkTask) + Send + Sync + 'static,
{
    move |request: WorkRequest| {
        let (tx, rx) = oneshot::channel();
        launch(WorkTask {
            request,
            done: Some(tx),
        });
        async move { rx.await.unwrap_or(WorkResult::Failure) }
    }
}
