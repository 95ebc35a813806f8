//! Offline-first data layer for a marketplace client.
//!
//! Reads are served cache-first with background refresh, writes are queued
//! durably and submitted when the device is online.

pub mod app;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod fetch;
pub mod logging;
pub mod market;
pub mod notify;
pub mod queue;
pub mod remote;
pub mod sync;

#[cfg(test)]
mod testing;
