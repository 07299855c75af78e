//! # aerolink-station
//!
//! Ground-station runtime of the Aerolink video link. Wraps the pure
//! reliability engine from `aerolink-transport` with everything that
//! touches the outside world or runs on a clock.
//!
//! ## Crate structure
//!
//! - [`config`] — TOML configuration, `*Input` layer resolved into runtime config
//! - [`net`] — Radio interfaces, data rates, link output selector, UDP radio adapter
//! - [`adaptation`] — Video quality and keyframe interval controllers
//! - [`runtime`] — The single-threaded station loop
//! - [`snapshot`] — Versioned, checksummed state snapshots for readers
//! - [`metrics`] — Prometheus rendering and scrape server
//! - [`sink`] — Output of the recovered video stream
//! - [`sim`] — Seeded vehicle simulator

pub mod adaptation;
pub mod config;
pub mod metrics;
pub mod net;
pub mod runtime;
pub mod sim;
pub mod sink;
pub mod snapshot;
