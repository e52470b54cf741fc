//! Stalled support-conversation watcher.
//!
//! A periodic reconciliation pass finds open conversations whose last message
//! is old enough to need a staff alert, records the alert on the owning
//! organization, queues an email copy, and re-opens eligibility once a
//! conversation has been idle past the reset threshold.

pub mod config;
pub mod database;
pub mod notification;
pub mod reconcile;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod store;

#[cfg(test)]
mod testing;
