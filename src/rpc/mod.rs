//! RPC layer - envelopes, function vocabulary, correlation and subscribers.

mod correlation;
mod envelope;
mod function;
mod subscribers;

pub use correlation::{
    Completion, CorrelationEngine, CorrelationIds, PendingRequest, ResponseHandle,
    DEFAULT_MAX_CORRELATION_ID, DEFAULT_REQUEST_TIMEOUT, MAX_REQUEST_TIMEOUT,
};
pub use envelope::{MessageKind, Params, RpcEnvelope, MAX_FUNCTION_ID, RPC_HEADER_SIZE};
pub use function::{function_id, FunctionRegistry, FunctionSchema};
pub use subscribers::{
    deliver, Handler, SharedHandler, SubscriberRegistry, SubscriptionId, TypedHandler,
};
