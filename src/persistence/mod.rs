//! # Persistence Module
//!
//! Holds the on-disk mirror of the last exchange-rate data set. The file is read
//! on every page render and replaced wholesale on import; there is no partial
//! write protection.

pub mod rates_store;

pub use rates_store::{RatesSnapshot, RatesStore, StoreError};
