//! Sensor telemetry ingestion.
//!
//! Workers pull envelopes of sensor batches off a queue, store every reading
//! and keep daily, weekly and monthly sums per sensor.

pub mod api;
pub mod codec;
pub mod config;
pub mod pool;
pub mod queue;
pub mod rollup;
pub mod storage;
pub mod worker;
