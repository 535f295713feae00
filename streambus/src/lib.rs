//! streambus is a framework for broker-backed stream processing services.
//!
//! Each logical route consumes one or more topics through a group of consumer
//! instances. Every polled record is wrapped in an [`event::Envelope`],
//! dispatched through a middleware chain to the handler registered for its
//! route, and the resulting [`handler::ProcessStatus`] decides whether the
//! offset is committed outright or the record is first captured in the
//! dead-letter store for later replay. Delivery is at-least-once: a record may
//! be redelivered after a crash, but it is never silently dropped.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod event;
pub mod handler;
pub mod manager;
pub mod metrics;
pub mod middleware;
pub mod replay;
pub mod retry;
pub mod router;
pub mod test_utils;
pub mod worker;
