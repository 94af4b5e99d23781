//! Per-GPU quota scheduler.
//!
//! Arbitrates time-sliced and SM-partitioned access to one GPU among client
//! containers. Clients ask for execution tokens over a fixed-frame TCP
//! protocol; the scheduler daemon grants each a time quota and an SM share
//! so that live partitions stay under the device capacity and every client's
//! windowed usage stays inside its configured fraction band.

pub mod client;
pub mod clock;
pub mod config;
pub mod handler;
pub mod history;
pub mod logging;
pub mod protocol;
pub mod scheduler;
pub mod watcher;
