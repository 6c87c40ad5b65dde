//! Outstanding tool calls waiting for their result.
//!
//! A subscription is keyed by tool and holds the trigger values the call
//! emitted. An inbound value resolves the first subscription whose triggers
//! are all ancestors of it, and that subscription is removed, so each one
//! resolves exactly once.

use crate::error::{Result, RuntimeError};
use crate::provenance::ProvenanceTracker;
use blockflow_core::{FlowValue, InputValue};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A callback to run once the tool result is known.
#[derive(Debug, Clone, PartialEq)]
pub struct Resumption {
    pub callback: String,
    pub result_param: String,
    /// Literal parameters bound when the call was made.
    pub inputs: Vec<InputValue>,
}

/// Callbacks registered by one tool call, plus the state buckets that were
/// current when it was made.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingCallbacks {
    pub resumptions: Vec<Resumption>,
    pub state_keys: IndexMap<String, String>,
}

#[derive(Debug)]
enum Pending {
    Callbacks(PendingCallbacks),
    Waiter(oneshot::Sender<Arc<FlowValue>>),
}

#[derive(Debug)]
struct Subscription {
    triggers: Vec<Arc<FlowValue>>,
    pending: Pending,
}

/// What resolving a subscription produced.
#[derive(Debug)]
pub enum Resolution {
    /// Callbacks the caller must now run.
    Callbacks(PendingCallbacks),
    /// The value was handed to a waiter.
    Delivered,
}

#[derive(Debug, Default)]
pub struct ToolSubscriptions {
    by_tool: IndexMap<String, Vec<Subscription>>,
    max_pending: Option<usize>,
}

impl ToolSubscriptions {
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            by_tool: IndexMap::new(),
            max_pending,
        }
    }

    pub fn subscribe(
        &mut self,
        tool: &str,
        triggers: Vec<Arc<FlowValue>>,
        callbacks: PendingCallbacks,
    ) -> Result<()> {
        self.push(tool, triggers, Pending::Callbacks(callbacks))
    }

    /// Wait for the response to the call that emitted `triggers`.
    pub fn wait(
        &mut self,
        tool: &str,
        triggers: Vec<Arc<FlowValue>>,
    ) -> Result<oneshot::Receiver<Arc<FlowValue>>> {
        let (tx, rx) = oneshot::channel();
        self.push(tool, triggers, Pending::Waiter(tx))?;
        Ok(rx)
    }

    fn push(&mut self, tool: &str, triggers: Vec<Arc<FlowValue>>, pending: Pending) -> Result<()> {
        let subscriptions = self.by_tool.entry(tool.to_string()).or_default();
        if let Some(limit) = self.max_pending {
            if subscriptions.len() >= limit {
                return Err(RuntimeError::TooManyPending {
                    tool: tool.to_string(),
                    pending: subscriptions.len(),
                    limit,
                });
            }
        }
        subscriptions.push(Subscription { triggers, pending });
        tracing::debug!(tool, pending = subscriptions.len(), "subscribed to tool result");
        Ok(())
    }

    /// Match `inbound` against the outstanding calls of `tool`.
    pub fn check_value(
        &mut self,
        tool: &str,
        inbound: &Arc<FlowValue>,
        tracker: &ProvenanceTracker,
    ) -> Result<Option<Resolution>> {
        let Some(subscriptions) = self.by_tool.get_mut(tool) else {
            return Ok(None);
        };

        let mut matched = None;
        for (position, subscription) in subscriptions.iter().enumerate() {
            if tracker.descends_from_all(inbound, &subscription.triggers)? {
                matched = Some(position);
                break;
            }
        }
        let Some(position) = matched else {
            return Ok(None);
        };

        let subscription = subscriptions.remove(position);
        tracing::debug!(tool, value = %inbound.id, "tool result matched");
        match subscription.pending {
            Pending::Callbacks(callbacks) => Ok(Some(Resolution::Callbacks(callbacks))),
            Pending::Waiter(tx) => {
                if tx.send(Arc::clone(inbound)).is_err() {
                    tracing::debug!(tool, "tool result waiter was dropped");
                }
                Ok(Some(Resolution::Delivered))
            }
        }
    }

    pub fn pending(&self, tool: &str) -> usize {
        self.by_tool.get(tool).map(Vec::len).unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.by_tool.values().map(Vec::len).sum()
    }

    /// Drop the outstanding calls of `tool`; waiters see their channel close.
    pub fn cancel(&mut self, tool: &str) -> usize {
        self.by_tool
            .swap_remove(tool)
            .map(|subscriptions| subscriptions.len())
            .unwrap_or(0)
    }

    pub fn cancel_all(&mut self) -> usize {
        let dropped = self.total_pending();
        self.by_tool.clear();
        dropped
    }
}
