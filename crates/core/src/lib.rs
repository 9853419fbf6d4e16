//! # cm-core
//!
//! Shared configuration, logging and normalized market data types for the
//! CM streaming layer.
//!
//! This crate provides the ambient building blocks used by `cm-stream`:
//! layered configuration for connections, throttling and order book
//! reconciliation, the tracing subscriber setup, and the exchange-independent
//! ticker/trade structures that protocol strategies produce.

pub mod config;
pub mod logging;
pub mod types;
