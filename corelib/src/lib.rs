//! Shared substrate used by every layer of the transport core: logging, time,
//! configuration, the status-code error model, cryptographic capability
//! interface, and the key-value parameter bag consumed by `ConnectionManager::open`.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod kvmap;
pub mod logging;
pub mod time;

pub use error::StatusCode;
