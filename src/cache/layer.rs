//! Cache layer that orchestrates caching logic with network fetching.
//!
//! Reads follow stale-while-revalidate: an in-scope snapshot is served as-is
//! (flagged stale past its TTL) and the caller decides when to refresh. The
//! layer also owns the offline flag and publishes every status transition on
//! a broadcast channel.

use chrono::{Duration, Utc};
use color_eyre::Result;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::rally::error::ApiResult;
use crate::rally::types::Ticket;

use super::storage::{CacheMetadata, CacheStorage};
use super::traits::{CacheEvent, CacheResult, CacheStatus};

const EVENT_CAPACITY: usize = 32;

#[derive(Debug)]
struct LayerState {
  status: CacheStatus,
  offline: bool,
}

/// In-scope snapshot loaded from storage.
struct Snapshot {
  tickets: Vec<Ticket>,
  metadata: CacheMetadata,
}

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the application and the network client,
/// providing transparent caching with offline support.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  /// How long before cached data is considered stale
  ttl: Duration,
  enabled: bool,
  auto_refresh: bool,
  workspace: String,
  project: String,
  state: Arc<Mutex<LayerState>>,
  events: broadcast::Sender<CacheEvent>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a cache layer for one workspace/project.
  pub fn new(storage: S, config: &CacheConfig, workspace: &str, project: &str) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      storage: Arc::new(storage),
      ttl: Duration::minutes(config.ttl_minutes),
      enabled: config.enabled,
      auto_refresh: config.auto_refresh,
      workspace: workspace.to_string(),
      project: project.to_string(),
      state: Arc::new(Mutex::new(LayerState {
        status: CacheStatus::Live,
        offline: false,
      })),
      events,
    }
  }

  fn state(&self) -> MutexGuard<'_, LayerState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn status(&self) -> CacheStatus {
    self.state().status
  }

  pub fn is_offline(&self) -> bool {
    self.state().offline
  }

  /// Force offline mode on or off.
  ///
  /// Leaving offline mode reports `Cached` when an in-scope snapshot exists
  /// and `Live` otherwise.
  pub fn set_offline(&self, offline: bool) {
    self.state().offline = offline;
    let age = self.age_minutes();
    if offline {
      self.set_status(CacheStatus::Offline, age);
    } else if self.status() == CacheStatus::Offline {
      match age {
        Some(_) => self.set_status(CacheStatus::Cached, age),
        None => self.set_status(CacheStatus::Live, None),
      }
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Age of the in-scope snapshot.
  pub fn age_minutes(&self) -> Option<i64> {
    self
      .scoped_metadata()
      .and_then(|m| m.age_minutes_at(Utc::now()))
  }

  /// Whether a stale snapshot should prompt the caller to refresh.
  pub fn should_refresh(&self) -> bool {
    self.enabled
      && self.auto_refresh
      && self
        .scoped_metadata()
        .is_some_and(|m| !m.is_valid_at(Utc::now(), self.ttl))
  }

  fn set_status(&self, status: CacheStatus, age_minutes: Option<i64>) {
    let changed = {
      let mut state = self.state();
      let changed = state.status != status;
      state.status = status;
      changed
    };
    if changed {
      debug!("Cache status: {}", status);
      // No subscribers is fine
      let _ = self.events.send(CacheEvent::StatusChanged {
        status,
        age_minutes,
      });
    }
  }

  fn scoped_metadata(&self) -> Option<CacheMetadata> {
    if !self.enabled {
      return None;
    }
    match self.storage.metadata() {
      Ok(Some(meta)) if meta.is_for_project(&self.workspace, &self.project) => Some(meta),
      Ok(_) => None,
      Err(e) => {
        warn!("Failed to read cache metadata: {}", e);
        None
      }
    }
  }

  fn snapshot(&self) -> Option<Snapshot> {
    let metadata = self.scoped_metadata()?;
    match self.storage.load_tickets() {
      Ok(Some(tickets)) => Some(Snapshot { tickets, metadata }),
      Ok(None) => None,
      Err(e) => {
        warn!("Failed to read ticket cache: {}", e);
        None
      }
    }
  }

  /// Fetch the ticket list with stale-while-revalidate.
  ///
  /// An unfiltered read is answered from an in-scope snapshot without calling
  /// `fetcher`. A filtered read, or one with no snapshot, goes to the network.
  pub async fn fetch_list<F, Fut>(
    &self,
    filtered: bool,
    fetcher: F,
  ) -> ApiResult<CacheResult<Vec<Ticket>>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ApiResult<Vec<Ticket>>>,
  {
    if !filtered {
      if let Some(snapshot) = self.snapshot() {
        let now = Utc::now();
        let age = snapshot.metadata.age_minutes_at(now);
        let is_stale = !snapshot.metadata.is_valid_at(now, self.ttl);
        debug!(
          "Serving {} cached tickets (age {:?} min, stale: {})",
          snapshot.tickets.len(),
          age,
          is_stale
        );
        self.set_status(CacheStatus::Cached, age);
        return Ok(CacheResult::cached(snapshot.tickets, is_stale, age));
      }
    }

    self.revalidate(filtered, fetcher).await
  }

  /// Always fetch from the network and rewrite the snapshot on success.
  pub async fn refresh<F, Fut>(&self, fetcher: F) -> ApiResult<CacheResult<Vec<Ticket>>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ApiResult<Vec<Ticket>>>,
  {
    let result = self.revalidate(false, fetcher).await?;
    if result.status == CacheStatus::Live {
      info!("Refreshed {} tickets", result.data.len());
      let _ = self
        .events
        .send(CacheEvent::TicketsRefreshed(Arc::new(result.data.clone())));
    }
    Ok(result)
  }

  async fn revalidate<F, Fut>(
    &self,
    filtered: bool,
    fetcher: F,
  ) -> ApiResult<CacheResult<Vec<Ticket>>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ApiResult<Vec<Ticket>>>,
  {
    let previous = self.status();
    self.set_status(CacheStatus::Refreshing, None);

    match fetcher().await {
      Ok(tickets) => {
        if self.enabled && !filtered {
          if let Err(e) = self
            .storage
            .save_tickets(&tickets, &self.workspace, &self.project)
          {
            warn!("Failed to save ticket cache: {}", e);
          }
        }
        self.state().offline = false;
        self.set_status(CacheStatus::Live, None);
        Ok(CacheResult::live(tickets))
      }
      Err(e) if e.is_auth() => {
        self.set_status(previous, None);
        Err(e)
      }
      Err(e) => {
        warn!("Failed to fetch tickets, going offline: {}", e);
        self.state().offline = true;
        match self.snapshot() {
          Some(snapshot) => {
            let age = snapshot.metadata.age_minutes_at(Utc::now());
            self.set_status(CacheStatus::Offline, age);
            Ok(CacheResult::offline(snapshot.tickets, age))
          }
          None => {
            self.set_status(CacheStatus::Offline, None);
            Ok(CacheResult::offline(Vec::new(), None))
          }
        }
      }
    }
  }

  /// Replace matching snapshot entries with `tickets`.
  pub fn patch(&self, tickets: &[Ticket]) {
    if !self.enabled || tickets.is_empty() {
      return;
    }
    if self.scoped_metadata().is_none() {
      return;
    }
    if let Err(e) = self.storage.update_tickets(tickets) {
      warn!("Failed to update ticket cache: {}", e);
    }
  }

  /// A single ticket from the in-scope snapshot.
  pub fn lookup(&self, formatted_id: &str) -> Option<Ticket> {
    self
      .snapshot()?
      .tickets
      .into_iter()
      .find(|t| t.formatted_id.eq_ignore_ascii_case(formatted_id.trim()))
  }

  pub fn clear(&self) -> Result<()> {
    self.storage.clear()
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      ttl: self.ttl,
      enabled: self.enabled,
      auto_refresh: self.auto_refresh,
      workspace: self.workspace.clone(),
      project: self.project.clone(),
      state: Arc::clone(&self.state),
      events: self.events.clone(),
    }
  }
}
