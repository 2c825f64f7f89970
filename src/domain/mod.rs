//! Domain layer public interface.
//!
//! Broker-independent contracts (consumer, publisher, handler) and the two
//! adapter patterns every backend is built from: pull (the crate runs a
//! fetch loop) and push (the backend client calls back per message).
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod contract;
pub(crate) mod lifecycle;
mod publisher;
mod pull;
mod push;

// --- Contract re-exports ---

pub use contract::{
    //
    handler_fn,
    Consumer,
    ConsumerPtr,
    ConsumerState,
    HandlerPtr,
    MessageHandler,
    PayloadSender,
    Publisher,
    PublisherPtr,
};

// --- Adapter re-exports ---

pub use publisher::BusPublisher;

pub use pull::{
    //
    Delivery,
    Fetcher,
    PullConsumer,
};

pub use push::{
    //
    Acker,
    Dispatcher,
    ErrorCallback,
    MessageCallback,
    PushConsumer,
    PushDelivery,
};
