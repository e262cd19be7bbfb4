//! Autocount - automated sequential counting for channel-based chat services
//!
//! This library provides the counting control loop: reading recent channel
//! activity, detecting resets announced by counting bots, rotating between
//! identities, pacing sends around rate limits, and persisting progress so
//! counting survives restarts.

pub mod client;
pub mod config;
pub mod error;
pub mod governor;
pub mod identity;
pub mod logging;
pub mod reset;
pub mod rotator;
pub mod scanner;
pub mod store;
pub mod supervisor;
pub mod types;

// Re-export commonly used types
pub use client::{ClientFactory, IdentityClient};
pub use config::Config;
pub use error::{AutocountError, IdentityError, Result};
pub use store::{PersistedState, StateStore};
pub use supervisor::{SupervisorBuilder, SupervisorHandle};
pub use types::{CounterState, Phase, ScanResult, StatusSnapshot};
