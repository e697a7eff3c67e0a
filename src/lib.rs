//! Validator side-car that observes exchange rates from a set of
//! providers, aggregates them into canonical USD rates, and submits
//! commit-reveal vote messages to the on-chain price oracle.

pub mod chain;
pub mod config;
pub mod handlers;
pub mod oracle;
pub mod sources;
pub mod types;

pub use config::Config;
pub use oracle::Oracle;
