//! Transaction Construction
//!
//! Builds unsigned transactions, hands out per-input sighashes for the
//! signing engine, and serializes the finalized result.

mod builder;

pub use builder::*;
