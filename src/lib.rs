//! Offline resilience for the ambulance dispatch client: response caching,
//! a durable outbox for writes made while offline, replay on reconnect and
//! map tile prefetch.

pub mod assignments;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod event;
pub mod locations;
pub mod logging;
pub mod message;
pub mod net;
pub mod outbox;
pub mod router;
pub mod sync;
pub mod tiles;

#[cfg(test)]
mod testing;
