//! Signal registry and publisher.
//!
//! [`SignalRegistry`] holds the signal definitions, accepts fire requests
//! and fans each message out to every subscribed [`SignalHandler`](crate::traits::SignalHandler).
//! Delivery is asynchronous and at-least-once; see the registry docs for
//! ordering and isolation guarantees.

mod registry;

pub use registry::{
    DeliveryAck, DeliveryConfig, DeliveryOutcome, FireReport, SignalRegistry, SubscriptionId,
};
