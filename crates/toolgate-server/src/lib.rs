//! The `toolgate-server` crate: HTTP surface, ingress gate, tool router,
//! chain executor, and the process-wide singletons (client pool, circuit
//! breaker, rate limiter, health tracker, tenant directory) that back them.
//! Split into a lib + thin binary the way the teacher's server crate does,
//! so `routes.rs`'s `tower::ServiceExt::oneshot()` tests don't need a bound
//! socket.

pub mod builtin;
pub mod chain;
pub mod circuit;
pub mod config;
pub mod health_tracker;
pub mod ingress;
pub mod meter_sink;
pub mod pool;
pub mod ratelimit;
pub mod response;
pub mod router;
pub mod routes;
pub mod tenants;
