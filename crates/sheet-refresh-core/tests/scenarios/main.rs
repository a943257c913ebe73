//! End-to-end scenarios for sheet-refresh-core.
//!
//! Every test drives the public API against an in-memory fake engine whose
//! per-file behavior is scripted up front, with a [`ManualClock`] standing in
//! for real time so stability windows and timeouts run instantly.
//!
//! [`ManualClock`]: sheet_refresh_core::ManualClock

mod batch;
mod common;
mod scheduling;

pub use common::*;
