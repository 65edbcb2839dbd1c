#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Domain model, stores, credential chain, session budgets and
//! metering/audit for the toolgate MCP gateway. Out-of-process
//! collaborators (the HTTP framework, the concrete outbound MCP transports,
//! the SQL migrations) live in `toolgate-server`; this crate only knows
//! about the datastore seam and the domain objects built on top of it.

pub mod audit;
pub mod credentials;
pub mod datastore;
pub mod error;
pub mod metering;
pub mod passport;
pub mod quota;
pub mod registry;
pub mod session;
pub mod tenant;
