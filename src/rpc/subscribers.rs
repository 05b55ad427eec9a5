//! Notification subscriber registry.
//!
//! Maps function ids to an ordered list of handlers. Delivery walks the list
//! in subscription order, so every subscriber sees notifications in the same
//! order the connection received them.
//!
//! # Example
//!
//! ```
//! use sdl_proxy::rpc::{RpcEnvelope, SubscriberRegistry};
//!
//! let mut registry = SubscriberRegistry::new();
//! registry.subscribe(32768, |envelope: &RpcEnvelope| {
//!     println!("HMI status: {:?}", envelope.params.get("hmiLevel"));
//! });
//!
//! let handlers = registry.handlers_for(32768);
//! assert_eq!(handlers.len(), 1);
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::envelope::RpcEnvelope;
use crate::error::Result;

/// Trait for notification handlers.
pub trait Handler: Send + Sync + 'static {
    /// Handle one notification.
    fn call(&self, envelope: &RpcEnvelope) -> Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&RpcEnvelope) + Send + Sync + 'static,
{
    fn call(&self, envelope: &RpcEnvelope) -> Result<()> {
        self(envelope);
        Ok(())
    }
}

/// Wrapper that deserializes parameters before calling the handler.
pub struct TypedHandler<F, T>
where
    F: Fn(T) + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T)>,
}

impl<F, T> TypedHandler<F, T>
where
    F: Fn(T) + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T> Handler for TypedHandler<F, T>
where
    F: Fn(T) + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    fn call(&self, envelope: &RpcEnvelope) -> Result<()> {
        let parsed = envelope.params_as::<T>()?;
        (self.handler)(parsed);
        Ok(())
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Shared handler reference, cloned out of the registry for delivery.
pub type SharedHandler = Arc<dyn Handler>;

/// Registry mapping function ids to ordered handler lists.
#[derive(Default)]
pub struct SubscriberRegistry {
    by_function: HashMap<u32, Vec<(SubscriptionId, SharedHandler)>>,
    next_id: u64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler that receives the raw envelope.
    pub fn subscribe<H: Handler>(&mut self, function_id: u32, handler: H) -> SubscriptionId {
        self.insert(function_id, Arc::new(handler))
    }

    /// Subscribe a handler that receives deserialized parameters.
    ///
    /// Notifications whose parameters fail to deserialize are logged and
    /// skipped for this subscriber only.
    pub fn subscribe_typed<F, T>(&mut self, function_id: u32, handler: F) -> SubscriptionId
    where
        F: Fn(T) + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
    {
        self.insert(function_id, Arc::new(TypedHandler::new(handler)))
    }

    fn insert(&mut self, function_id: u32, handler: SharedHandler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.by_function
            .entry(function_id)
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.by_function.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(sid, _)| *sid != id);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    /// Snapshot of the handlers for a function id, in subscription order.
    pub fn handlers_for(&self, function_id: u32) -> Vec<SharedHandler> {
        self.by_function
            .get(&function_id)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    /// Total number of live subscriptions.
    pub fn len(&self) -> usize {
        self.by_function.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_function.is_empty()
    }
}

/// Deliver a notification to a handler snapshot, in order.
///
/// Returns the number of handlers that accepted it.
pub fn deliver(handlers: &[SharedHandler], envelope: &RpcEnvelope) -> usize {
    let mut delivered = 0;
    for handler in handlers {
        match handler.call(envelope) {
            Ok(()) => delivered += 1,
            Err(e) => tracing::warn!(
                function_id = envelope.function_id,
                error = %e,
                "notification handler rejected parameters"
            ),
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde::Deserialize;

    #[test]
    fn test_delivery_in_subscription_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriberRegistry::new();

        for tag in ["a", "b", "c"] {
            let log = log.clone();
            registry.subscribe(5, move |_: &RpcEnvelope| log.lock().push(tag));
        }

        let handlers = registry.handlers_for(5);
        assert_eq!(deliver(&handlers, &RpcEnvelope::notification(5)), 3);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unsubscribe() {
        let mut registry = SubscriberRegistry::new();
        let first = registry.subscribe(5, |_: &RpcEnvelope| {});
        let _second = registry.subscribe(5, |_: &RpcEnvelope| {});

        assert!(registry.unsubscribe(first));
        assert!(!registry.unsubscribe(first));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.handlers_for(5).len(), 1);
    }

    #[test]
    fn test_unknown_function_has_no_handlers() {
        let registry = SubscriberRegistry::new();
        assert!(registry.handlers_for(1).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_typed_handler() {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct HmiStatus {
            hmi_level: String,
        }

        let seen = Arc::new(Mutex::new(None));
        let mut registry = SubscriberRegistry::new();
        let sink = seen.clone();
        registry.subscribe_typed(32768, move |status: HmiStatus| {
            *sink.lock() = Some(status.hmi_level);
        });

        let good = RpcEnvelope::notification(32768).with_param("hmiLevel", "FULL");
        let bad = RpcEnvelope::notification(32768).with_param("other", 1);
        let handlers = registry.handlers_for(32768);

        assert_eq!(deliver(&handlers, &bad), 0);
        assert_eq!(deliver(&handlers, &good), 1);
        assert_eq!(seen.lock().as_deref(), Some("FULL"));
    }
}
