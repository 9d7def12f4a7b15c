//! Outbound catalog sync pipeline for an external commerce connector.
//!
//! Changes enter through [`triggers`], get deduplicated and batched by
//! [`batcher`] onto a durable queue ([`queue`], [`db`]), and the worker
//! ([`consumer`], [`stock`]) drains them: reload fresh state, build outbound
//! records, deliver one HTTP call per store via [`delivery`].

pub mod batcher;
pub mod catalog;
pub mod config;
pub mod consumer;
pub mod db;
pub mod dedup;
pub mod delivery;
pub mod model;
pub mod queue;
pub mod stock;
pub mod topology;
pub mod triggers;
