//! Matching daemon internals: representation store, matching engine,
//! ingestion dispatcher and case lifecycle, plus the local collaborators
//! they run against.

pub mod blob;
pub mod cases;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod dbus_interface;
pub mod dispatcher;
pub mod engine;
pub mod lifecycle;
pub mod store;
