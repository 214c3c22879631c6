//! Structured group of blocking per-host workers.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::HostFailure;

/// Reports per-host failures as they occur.
///
/// Every report is logged immediately and forwarded to the owning
/// [`TaskGroup`], which hands the collected list back from
/// [`TaskGroup::join`].
#[derive(Clone, Debug)]
pub struct FailureSender {
    tx: UnboundedSender<HostFailure>,
}

impl FailureSender {
    /// Logs `failure` and forwards it to the group.
    pub fn report(&self, failure: HostFailure) {
        error!(node = failure.node().unwrap_or("-"), error = %failure, "host failure");
        if self.tx.send(failure).is_err() {
            debug!("failure receiver dropped before report");
        }
    }
}

/// Results of a joined [`TaskGroup`].
#[derive(Debug)]
pub struct JoinedGroup<T> {
    /// Values returned by workers that ran to completion.
    pub outputs: Vec<T>,
    /// Every failure reported while the group ran, in arrival order.
    pub failures: Vec<HostFailure>,
}

/// One blocking worker per host, launched together and joined together.
///
/// A worker that panics is reported as [`HostFailure::WorkerLost`]; its
/// captured state is dropped during unwinding and it yields no output.
#[derive(Debug)]
pub struct TaskGroup<T> {
    tasks: JoinSet<(String, Option<T>)>,
    pending: BTreeSet<String>,
    failures: FailureSender,
    receiver: UnboundedReceiver<HostFailure>,
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Creates an empty group with its failure channel.
    #[must_use]
    pub fn new() -> Self {
        let (tx, receiver) = mpsc::unbounded_channel();
        Self {
            tasks: JoinSet::new(),
            pending: BTreeSet::new(),
            failures: FailureSender { tx },
            receiver,
        }
    }

    /// Number of workers spawned and not yet joined.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` when no worker is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Runs `work` for `node` on the blocking thread pool.
    pub fn spawn_blocking<F>(&mut self, node: impl Into<String>, work: F)
    where
        F: FnOnce(&FailureSender) -> T + Send + 'static,
    {
        let node = node.into();
        let failures = self.failures.clone();
        self.pending.insert(node.clone());
        self.tasks.spawn_blocking(move || {
            match panic::catch_unwind(AssertUnwindSafe(|| work(&failures))) {
                Ok(value) => (node, Some(value)),
                Err(payload) => {
                    failures.report(HostFailure::WorkerLost {
                        node: node.clone(),
                        message: panic_message(payload.as_ref()),
                    });
                    (node, None)
                }
            }
        });
    }

    /// Waits for every worker, then drains the failure channel.
    ///
    /// Workers whose task never reported back are listed as
    /// [`HostFailure::WorkerLost`].
    pub async fn join(self) -> JoinedGroup<T> {
        let Self {
            mut tasks,
            mut pending,
            failures,
            mut receiver,
        } = self;

        let mut outputs = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((node, value)) => {
                    pending.remove(&node);
                    outputs.extend(value);
                }
                Err(err) => warn!(error = %err, "worker task failed to join"),
            }
        }
        for node in pending {
            failures.report(HostFailure::WorkerLost {
                node,
                message: String::from("worker task did not complete"),
            });
        }
        drop(failures);

        let mut collected = Vec::new();
        while let Some(failure) = receiver.recv().await {
            collected.push(failure);
        }
        JoinedGroup {
            outputs,
            failures: collected,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|text| (*text).to_owned()))
        .unwrap_or_else(|| String::from("worker panicked"))
}
