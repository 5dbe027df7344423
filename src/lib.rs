//! Wakegate - A reverse proxy that wakes auto-sleeping backends
//!
//! This library provides a transparent edge proxy that:
//! - Forwards every request to a single origin unchanged
//! - Recognizes cold or unreachable origins from their status codes
//! - Serves browsers a self-refreshing waiting page during cold starts
//! - Pings the backend's wake URL in the background, authenticated with a
//!   Google identity token minted from a service-account key
//! - Passes API and bypass traffic through byte-for-byte

pub mod assertion;
pub mod classifier;
pub mod config;
pub mod cors;
pub mod credential;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod supervisor;
pub mod token;
pub mod waiting_page;
pub mod wake;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
