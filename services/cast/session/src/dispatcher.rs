//! Namespace routing and request/reply correlation.
//!
//! The dispatcher is owned by the worker loop and never shared. Handlers are
//! held weakly: the registering party owns them, and a handler whose owner
//! went away is pruned the next time its namespace sees traffic.
//!
//! Pending requests are keyed by `(namespace, requestId)` and stamped with the
//! session generation that carried them. A reply only completes a record of
//! the current generation.

use crate::error::RequestError;
use cast_wire::Message;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

/// What a caller awaiting a reply eventually receives
pub type RequestOutcome = Result<Value, RequestError>;

/// Whether a handler acted on a message. Used for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The handler consumed the message
    Handled,
    /// The handler saw the message but had no use for it
    Ignored,
}

/// Receives every message on the namespace it is registered for.
///
/// Called from the worker loop: implementations must not block.
pub trait NamespaceHandler: Send + Sync {
    /// `data` is the JSON body, or `Value::Null` for binary messages
    fn on_message(&self, message: &Message, data: &Value) -> HandlerOutcome;
}

/// Key of a pending request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    /// Namespace the request was sent on
    pub namespace: String,
    /// Value of `requestId`
    pub request_id: u64,
}

/// Where an inbound message ended up after correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A live handler consumed it
    Handled,
    /// A live handler declined it
    Ignored,
    /// No live handler for the namespace
    Unrouted,
}

/// Result of dispatching one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// A pending request was completed with this message
    pub correlated: bool,
    /// Handler delivery
    pub delivery: Delivery,
}

struct RequestRecord {
    submitted_at: Instant,
    deadline: Instant,
    generation: u64,
    slot: oneshot::Sender<RequestOutcome>,
}

impl RequestRecord {
    fn complete(self, outcome: RequestOutcome) {
        // The caller may have stopped waiting
        let _ = self.slot.send(outcome);
    }
}

/// Handler registry and pending-request table
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Weak<dyn NamespaceHandler>>,
    pending: HashMap<RequestKey, RequestRecord>,
}

impl Dispatcher {
    /// Empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `namespace`, replacing any previous one
    pub fn register(&mut self, namespace: impl Into<String>, handler: Weak<dyn NamespaceHandler>) {
        let namespace = namespace.into();
        if self.handlers.insert(namespace.clone(), handler).is_some() {
            debug!("Replaced handler for {}", namespace);
        } else {
            debug!("Registered handler for {}", namespace);
        }
    }

    /// Remove the handler for `namespace`
    pub fn unregister(&mut self, namespace: &str) -> bool {
        self.handlers.remove(namespace).is_some()
    }

    /// Namespaces with a live handler
    pub fn registered_namespaces(&self) -> Vec<String> {
        self.handlers
            .iter()
            .filter(|(_, handler)| handler.strong_count() > 0)
            .map(|(namespace, _)| namespace.clone())
            .collect()
    }

    /// Number of pending requests
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record an outbound request before its frame is written.
    ///
    /// A record is only created when a reply is awaited and the JSON body
    /// carries a `requestId`. Otherwise `slot` is dropped and `None` returned.
    /// A key that is already pending is refused with
    /// [`RequestError::Duplicate`].
    pub fn submit(
        &mut self,
        message: &Message,
        awaits_reply: bool,
        slot: oneshot::Sender<RequestOutcome>,
        deadline: Instant,
        generation: u64,
    ) -> Option<RequestKey> {
        if !awaits_reply {
            return None;
        }
        let request_id = message.request_id()?;
        let key = RequestKey {
            namespace: message.namespace.clone(),
            request_id,
        };

        if self.pending.contains_key(&key) {
            let _ = slot.send(Err(RequestError::Duplicate(request_id)));
            return None;
        }

        trace!(
            "Tracking request {} on {} (generation {})",
            request_id,
            key.namespace,
            generation
        );
        self.pending.insert(
            key.clone(),
            RequestRecord {
                submitted_at: Instant::now(),
                deadline,
                generation,
                slot,
            },
        );
        Some(key)
    }

    /// Route an inbound message.
    ///
    /// A matching request of `generation` is completed first; the namespace
    /// handler is notified afterwards either way.
    pub fn on_frame_received(&mut self, message: &Message, generation: u64) -> DispatchReport {
        let data = message.data().cloned().unwrap_or(Value::Null);
        let correlated = self.correlate(message, &data, generation);

        let delivery = match self.live_handler(&message.namespace) {
            Some(handler) => match handler.on_message(message, &data) {
                HandlerOutcome::Handled => Delivery::Handled,
                HandlerOutcome::Ignored => Delivery::Ignored,
            },
            None => {
                if !correlated {
                    debug!(
                        "No handler for {}, dropping message from {}",
                        message.namespace, message.source_id
                    );
                }
                Delivery::Unrouted
            }
        };

        DispatchReport {
            correlated,
            delivery,
        }
    }

    fn correlate(&mut self, message: &Message, data: &Value, generation: u64) -> bool {
        let Some(request_id) = message.request_id() else {
            return false;
        };
        let key = RequestKey {
            namespace: message.namespace.clone(),
            request_id,
        };

        match self.pending.get(&key) {
            Some(record) if record.generation == generation => {}
            Some(record) => {
                debug!(
                    "Reply to request {} on {} crossed generations ({} != {}), not correlating",
                    request_id, key.namespace, record.generation, generation
                );
                return false;
            }
            None => return false,
        }

        match self.pending.remove(&key) {
            Some(record) => {
                trace!(
                    "Request {} on {} answered after {:?}",
                    request_id,
                    key.namespace,
                    record.submitted_at.elapsed()
                );
                record.complete(Ok(data.clone()));
                true
            }
            None => false,
        }
    }

    fn live_handler(&mut self, namespace: &str) -> Option<Arc<dyn NamespaceHandler>> {
        let handler = self.handlers.get(namespace)?.upgrade();
        if handler.is_none() {
            debug!("Handler for {} was dropped, pruning", namespace);
            self.handlers.remove(namespace);
        }
        handler
    }

    /// Complete every request whose deadline has passed with `Timeout`
    pub fn expire(&mut self, now: Instant) -> usize {
        self.complete_where(|record| record.deadline <= now, RequestError::Timeout)
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|record| record.deadline).min()
    }

    /// Complete every request older than `current_generation` with `Stale`
    pub fn invalidate(&mut self, current_generation: u64) -> usize {
        self.complete_where(
            |record| record.generation < current_generation,
            RequestError::Stale,
        )
    }

    /// Complete every pending request with `Cancelled`
    pub fn cancel_all(&mut self) -> usize {
        self.complete_where(|_| true, RequestError::Cancelled)
    }

    fn complete_where(
        &mut self,
        predicate: impl Fn(&RequestRecord) -> bool,
        error: RequestError,
    ) -> usize {
        let keys: Vec<RequestKey> = self
            .pending
            .iter()
            .filter(|(_, record)| predicate(record))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            if let Some(record) = self.pending.remove(key) {
                debug!(
                    "Request {} on {} completed with {}",
                    key.request_id, key.namespace, error
                );
                record.complete(Err(error.clone()));
            }
        }
        keys.len()
    }
}
