//! Core types for the caching system.

use std::sync::Arc;

use crate::rally::types::Ticket;

/// Where the data currently on screen came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
  /// Fresh data from the network
  Live,
  /// Served from the local snapshot
  Cached,
  /// A network fetch is in progress
  Refreshing,
  /// The network is unreachable; data (if any) is from the snapshot
  Offline,
}

impl CacheStatus {
  /// Short label for a status line.
  pub fn label(self) -> &'static str {
    match self {
      Self::Live => "LIVE",
      Self::Cached => "CACHED",
      Self::Refreshing => "REFRESHING",
      Self::Offline => "OFFLINE",
    }
  }
}

impl std::fmt::Display for CacheStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.label())
  }
}

/// Notifications published by the cache layer.
#[derive(Debug, Clone)]
pub enum CacheEvent {
  StatusChanged {
    status: CacheStatus,
    /// Snapshot age in whole minutes, when a snapshot is involved
    age_minutes: Option<i64>,
  },
  /// A refresh produced a new ticket list
  TicketsRefreshed(Arc<Vec<Ticket>>),
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  pub status: CacheStatus,
  /// The snapshot is past its TTL and a refresh is warranted
  pub is_stale: bool,
  /// Age of the snapshot the data came from
  pub age_minutes: Option<i64>,
}

impl<T> CacheResult<T> {
  /// Fresh network data.
  pub fn live(data: T) -> Self {
    Self {
      data,
      status: CacheStatus::Live,
      is_stale: false,
      age_minutes: None,
    }
  }

  /// Data served from the snapshot.
  pub fn cached(data: T, is_stale: bool, age_minutes: Option<i64>) -> Self {
    Self {
      data,
      status: CacheStatus::Cached,
      is_stale,
      age_minutes,
    }
  }

  /// Network unavailable; `data` is whatever the snapshot held.
  pub fn offline(data: T, age_minutes: Option<i64>) -> Self {
    Self {
      data,
      status: CacheStatus::Offline,
      is_stale: true,
      age_minutes,
    }
  }
}
