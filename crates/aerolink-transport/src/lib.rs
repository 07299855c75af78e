//! # aerolink-transport
//!
//! Receive-side reliability engine of the Aerolink long-range video link.
//!
//! Turns a lossy, bandwidth-constrained radio channel into a usable video
//! stream: FEC block reassembly in a bounded reception window, selective
//! retransmission with RTT accounting, and the per-interval link telemetry
//! the station's adaptive controllers run on. Pure logic, no I/O and no
//! clock reads; the station loop owns the state and passes `now` in.
//!
//! ## Crate structure
//!
//! - [`wire`] — Video and control packet serialization
//! - [`queue`] — Fixed-capacity outbound packet queue with head injection
//! - [`codec`] — FEC primitive (Reed-Solomon) behind the `FecCodec` trait
//! - [`block`] — Video blocks and the pre-allocated reception window
//! - [`arq`] — Request pacing, pending requests, RTT statistics
//! - [`history`] — Adaptive interval history read by the controllers
//! - [`stats`] — Pipeline totals and sliced output history
//! - [`receiver`] — The reliability pipeline state machine

pub mod arq;
pub mod block;
pub mod codec;
pub mod history;
pub mod queue;
pub mod receiver;
pub mod stats;
pub mod wire;
