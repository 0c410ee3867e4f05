//! Cache storage trait and JSON file implementation.
//!
//! The snapshot lives in two files inside the cache directory:
//! `tickets.json` holds the ticket list and `meta.json` records which
//! workspace/project it belongs to and when it was written. The metadata file
//! is the commit marker: it is removed before the snapshot is rewritten and
//! written back last, so a reader never pairs new tickets with an old
//! timestamp. If the ticket file cannot be replaced, the old metadata is put
//! back and the previous snapshot stays readable.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::rally::types::Ticket;

/// Current on-disk schema version.
pub const CACHE_VERSION: u32 = 1;

const META_FILE: &str = "meta.json";
const TICKETS_FILE: &str = "tickets.json";

/// Contents of `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheMetadata {
  pub version: u32,
  pub workspace: String,
  pub project: String,
  pub tickets_updated: Option<DateTime<Utc>>,
}

impl Default for CacheMetadata {
  fn default() -> Self {
    Self {
      version: CACHE_VERSION,
      workspace: String::new(),
      project: String::new(),
      tickets_updated: None,
    }
  }
}

impl CacheMetadata {
  pub fn new(workspace: &str, project: &str, tickets_updated: DateTime<Utc>) -> Self {
    Self {
      version: CACHE_VERSION,
      workspace: workspace.to_string(),
      project: project.to_string(),
      tickets_updated: Some(tickets_updated),
    }
  }

  /// Fresh iff `0 <= now - tickets_updated < ttl`.
  pub fn is_valid_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
    match self.tickets_updated {
      Some(updated) => {
        let age = now - updated;
        age >= Duration::zero() && age < ttl
      }
      None => false,
    }
  }

  /// Whole minutes since the snapshot was written.
  pub fn age_minutes_at(&self, now: DateTime<Utc>) -> Option<i64> {
    let age = now - self.tickets_updated?;
    (age >= Duration::zero()).then(|| age.num_minutes())
  }

  pub fn is_for_project(&self, workspace: &str, project: &str) -> bool {
    self.workspace == workspace && self.project == project
  }
}

#[derive(Serialize)]
struct TicketFileOut<'a> {
  tickets: &'a [Ticket],
}

#[derive(Deserialize)]
struct TicketFileIn {
  #[serde(default)]
  tickets: Vec<Value>,
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Metadata of the current snapshot. `None` when absent, unreadable, or
  /// written by a newer schema.
  fn metadata(&self) -> Result<Option<CacheMetadata>>;

  /// Cached tickets; `None` when there is no committed snapshot.
  fn load_tickets(&self) -> Result<Option<Vec<Ticket>>>;

  /// Replace the snapshot.
  fn save_tickets(&self, tickets: &[Ticket], workspace: &str, project: &str) -> Result<()>;

  /// Replace entries whose `formatted_id` matches; never inserts.
  /// Returns how many entries were replaced.
  fn update_tickets(&self, tickets: &[Ticket]) -> Result<usize>;

  /// Remove the snapshot. Succeeds when there is nothing to remove.
  fn clear(&self) -> Result<()>;

  fn is_valid(&self, ttl: Duration) -> bool {
    self
      .metadata()
      .ok()
      .flatten()
      .is_some_and(|m| m.is_valid_at(Utc::now(), ttl))
  }

  fn age_minutes(&self) -> Option<i64> {
    self.metadata().ok().flatten()?.age_minutes_at(Utc::now())
  }

  fn is_for_project(&self, workspace: &str, project: &str) -> bool {
    self
      .metadata()
      .ok()
      .flatten()
      .is_some_and(|m| m.is_for_project(workspace, project))
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn metadata(&self) -> Result<Option<CacheMetadata>> {
    Ok(None) // Always miss
  }

  fn load_tickets(&self) -> Result<Option<Vec<Ticket>>> {
    Ok(None)
  }

  fn save_tickets(&self, _tickets: &[Ticket], _workspace: &str, _project: &str) -> Result<()> {
    Ok(()) // Discard
  }

  fn update_tickets(&self, _tickets: &[Ticket]) -> Result<usize> {
    Ok(0)
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// JSON file storage in a single directory.
pub struct FileStorage {
  dir: PathBuf,
  /// Serializes writers within this process
  write_lock: Mutex<()>,
}

impl FileStorage {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: dir.into(),
      write_lock: Mutex::new(()),
    }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Write `tickets` and then `metadata`, removing the old metadata first.
  pub fn write_snapshot(&self, tickets: &[Ticket], metadata: &CacheMetadata) -> Result<()> {
    let _guard = self
      .write_lock
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    self.write_snapshot_locked(tickets, metadata)
  }

  fn write_snapshot_locked(&self, tickets: &[Ticket], metadata: &CacheMetadata) -> Result<()> {
    std::fs::create_dir_all(&self.dir).map_err(|e| {
      eyre!(
        "Failed to create cache directory {}: {}",
        self.dir.display(),
        e
      )
    })?;

    let tickets_json = serde_json::to_vec_pretty(&TicketFileOut { tickets })
      .map_err(|e| eyre!("Failed to serialize tickets: {}", e))?;

    let previous_meta = self.read_file(META_FILE).ok().flatten();
    remove_if_exists(&self.dir.join(META_FILE))?;

    if let Err(e) = self.write_atomic(TICKETS_FILE, &tickets_json) {
      // tickets.json is untouched, so the old marker still describes it
      if let Some(previous) = previous_meta {
        if let Err(restore) = self.write_atomic(META_FILE, previous.as_bytes()) {
          warn!("Failed to restore cache metadata: {}", restore);
        }
      }
      return Err(e);
    }

    let meta_json = serde_json::to_vec_pretty(metadata)
      .map_err(|e| eyre!("Failed to serialize cache metadata: {}", e))?;
    self.write_atomic(META_FILE, &meta_json)?;

    debug!(
      "Saved {} tickets to cache at {}",
      tickets.len(),
      self.dir.display()
    );
    Ok(())
  }

  /// Write to a temp file next to `name`, fsync, then rename over it.
  /// The temp file is deleted if anything fails.
  fn write_atomic(&self, name: &str, contents: &[u8]) -> Result<()> {
    let target = self.dir.join(name);
    let mut tmp = tempfile::Builder::new()
      .prefix(&format!(".{}.", name))
      .suffix(".tmp")
      .tempfile_in(&self.dir)
      .map_err(|e| eyre!("Failed to create temp file for {}: {}", target.display(), e))?;

    tmp
      .write_all(contents)
      .and_then(|_| tmp.as_file().sync_all())
      .map_err(|e| eyre!("Failed to write {}: {}", target.display(), e))?;

    tmp
      .persist(&target)
      .map_err(|e| eyre!("Failed to replace {}: {}", target.display(), e.error))?;
    Ok(())
  }

  fn read_file(&self, name: &str) -> Result<Option<String>> {
    let path = self.dir.join(name);
    match std::fs::read_to_string(&path) {
      Ok(contents) => Ok(Some(contents)),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(eyre!("Failed to read {}: {}", path.display(), e)),
    }
  }

  fn read_tickets_file(&self) -> Result<Option<Vec<Ticket>>> {
    let Some(contents) = self.read_file(TICKETS_FILE)? else {
      return Ok(None);
    };
    let file: TicketFileIn = match serde_json::from_str(&contents) {
      Ok(file) => file,
      Err(e) => {
        warn!("Ignoring corrupt ticket cache: {}", e);
        return Ok(None);
      }
    };

    let tickets = file
      .tickets
      .into_iter()
      .filter_map(|record| match serde_json::from_value::<Ticket>(record) {
        Ok(ticket) => Some(ticket),
        Err(e) => {
          debug!("Skipping malformed cached ticket: {}", e);
          None
        }
      })
      .collect();
    Ok(Some(tickets))
  }
}

fn remove_if_exists(path: &Path) -> Result<()> {
  match std::fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
    Err(e) => Err(eyre!("Failed to remove {}: {}", path.display(), e)),
  }
}

impl CacheStorage for FileStorage {
  fn metadata(&self) -> Result<Option<CacheMetadata>> {
    let Some(contents) = self.read_file(META_FILE)? else {
      return Ok(None);
    };
    match serde_json::from_str::<CacheMetadata>(&contents) {
      Ok(meta) if meta.version > CACHE_VERSION => {
        debug!(
          "Ignoring cache written by newer schema version {}",
          meta.version
        );
        Ok(None)
      }
      Ok(meta) => Ok(Some(meta)),
      Err(e) => {
        warn!("Ignoring corrupt cache metadata: {}", e);
        Ok(None)
      }
    }
  }

  fn load_tickets(&self) -> Result<Option<Vec<Ticket>>> {
    if self.metadata()?.is_none() {
      return Ok(None);
    }
    self.read_tickets_file()
  }

  fn save_tickets(&self, tickets: &[Ticket], workspace: &str, project: &str) -> Result<()> {
    self.write_snapshot(tickets, &CacheMetadata::new(workspace, project, Utc::now()))
  }

  fn update_tickets(&self, updated: &[Ticket]) -> Result<usize> {
    if updated.is_empty() {
      return Ok(0);
    }
    let _guard = self
      .write_lock
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let Some(metadata) = self.metadata()? else {
      return Ok(0);
    };
    let Some(mut tickets) = self.read_tickets_file()? else {
      return Ok(0);
    };

    let mut replaced = 0;
    for ticket in updated {
      if let Some(slot) = tickets
        .iter_mut()
        .find(|t| t.formatted_id == ticket.formatted_id)
      {
        *slot = ticket.clone();
        replaced += 1;
      }
    }

    if replaced > 0 {
      let metadata = CacheMetadata {
        tickets_updated: Some(Utc::now()),
        ..metadata
      };
      self.write_snapshot_locked(&tickets, &metadata)?;
      debug!("Patched {} cached ticket(s)", replaced);
    }
    Ok(replaced)
  }

  fn clear(&self) -> Result<()> {
    let _guard = self
      .write_lock
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    remove_if_exists(&self.dir.join(META_FILE))?;
    remove_if_exists(&self.dir.join(TICKETS_FILE))?;
    debug!("Cleared cache at {}", self.dir.display());
    Ok(())
  }
}
