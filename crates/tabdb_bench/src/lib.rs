//! Shared helpers for the TabDB benchmarks.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod utils;
