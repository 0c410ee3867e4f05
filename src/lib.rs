//! Rally work-item access for r9s.
//!
//! [`rally::RallyClient`] talks to the Rally WSAPI with bounded concurrency and
//! retries; [`rally::CachedRallyClient`] layers a local snapshot on top with
//! stale-while-revalidate reads and offline support.

pub mod cache;
pub mod config;
pub mod rally;
