//! Rally client with transparent caching support.
//!
//! Wraps any [`RallyApi`] and exposes the same interface. Unfiltered ticket
//! lists are served from the local snapshot when one exists; writes are
//! refused while offline and patched into the snapshot when they succeed.

use std::path::Path;
use std::slice;

use async_trait::async_trait;
use color_eyre::Result;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{
  CacheEvent, CacheLayer, CacheResult, CacheStatus, CacheStorage, FileStorage, NoopStorage,
};
use crate::config::CacheConfig;

use super::api::RallyApi;
use super::bulk::BulkResult;
use super::error::ApiResult;
use super::types::{Attachment, Discussion, Iteration, NewTicket, Owner, Tag, Ticket};

const OFFLINE_REASON: &str = "Offline: changes cannot be saved";

/// Rally client with transparent caching support.
pub struct CachedRallyClient<A: RallyApi, S: CacheStorage> {
  inner: A,
  cache: CacheLayer<S>,
}

impl<A: RallyApi> CachedRallyClient<A, FileStorage> {
  /// Cache in the configured directory.
  pub fn open(inner: A, config: &CacheConfig) -> Result<Self> {
    let dir = config.resolve_dir()?;
    Ok(Self::new(inner, FileStorage::new(dir), config))
  }

  pub fn cache_dir(&self) -> &Path {
    self.cache.storage().dir()
  }
}

impl<A: RallyApi> CachedRallyClient<A, NoopStorage> {
  /// Same interface with nothing persisted.
  pub fn uncached(inner: A) -> Self {
    let config = CacheConfig {
      enabled: false,
      ..CacheConfig::default()
    };
    Self::new(inner, NoopStorage, &config)
  }
}

impl<A: RallyApi, S: CacheStorage> CachedRallyClient<A, S> {
  pub fn new(inner: A, storage: S, config: &CacheConfig) -> Self {
    let cache = CacheLayer::new(storage, config, inner.workspace(), inner.project());
    Self { inner, cache }
  }

  pub fn inner(&self) -> &A {
    &self.inner
  }

  /// Tickets plus where they came from.
  ///
  /// With no `query` an in-scope snapshot is returned without contacting the
  /// server, even when stale. A `query` always goes to the server and its
  /// result is not written to the snapshot.
  pub async fn get_tickets_with_status(
    &self,
    query: Option<&str>,
  ) -> ApiResult<CacheResult<Vec<Ticket>>> {
    let query = query.filter(|q| !q.trim().is_empty());
    self
      .cache
      .fetch_list(query.is_some(), || self.inner.get_tickets(query))
      .await
  }

  /// Fetch the default ticket list from the server and rewrite the snapshot.
  pub async fn refresh_cache(&self) -> ApiResult<CacheResult<Vec<Ticket>>> {
    self.cache.refresh(|| self.inner.get_tickets(None)).await
  }

  pub fn clear_cache(&self) -> Result<()> {
    self.cache.clear()
  }

  /// The snapshot is stale and auto-refresh is enabled.
  pub fn should_refresh(&self) -> bool {
    self.cache.should_refresh()
  }

  pub fn set_offline(&self, offline: bool) {
    self.cache.set_offline(offline);
  }

  pub fn is_offline(&self) -> bool {
    self.cache.is_offline()
  }

  pub fn status(&self) -> CacheStatus {
    self.cache.status()
  }

  pub fn cache_age_minutes(&self) -> Option<i64> {
    self.cache.age_minutes()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.cache.subscribe()
  }

  fn refuse_offline(&self, action: &str, target: &str) -> bool {
    if self.cache.is_offline() {
      warn!("Offline: refusing to {} {}", action, target);
      return true;
    }
    false
  }

  fn write_through(&self, outcome: ApiResult<Option<Ticket>>) -> ApiResult<Option<Ticket>> {
    if let Ok(Some(ticket)) = &outcome {
      self.cache.patch(slice::from_ref(ticket));
    }
    outcome
  }

  fn bulk_write_through(&self, result: BulkResult) -> BulkResult {
    self.cache.patch(&result.updated_tickets);
    result
  }

  fn refuse_bulk(&self, action: &str, tickets: &[Ticket]) -> Option<BulkResult> {
    self
      .refuse_offline(action, &format!("{} ticket(s)", tickets.len()))
      .then(|| BulkResult::all_failed(tickets, OFFLINE_REASON))
  }
}

#[async_trait]
impl<A: RallyApi, S: CacheStorage> RallyApi for CachedRallyClient<A, S> {
  fn workspace(&self) -> &str {
    self.inner.workspace()
  }

  fn project(&self) -> &str {
    self.inner.project()
  }

  fn current_user(&self) -> Option<&str> {
    self.inner.current_user()
  }

  fn current_iteration(&self) -> Option<&str> {
    self.inner.current_iteration()
  }

  async fn get_tickets(&self, query: Option<&str>) -> ApiResult<Vec<Ticket>> {
    Ok(self.get_tickets_with_status(query).await?.data)
  }

  /// Falls back to the snapshot when offline or when the server is unreachable.
  async fn get_ticket(&self, formatted_id: &str) -> ApiResult<Option<Ticket>> {
    if self.cache.is_offline() {
      return Ok(self.cache.lookup(formatted_id));
    }
    match self.inner.get_ticket(formatted_id).await {
      Ok(ticket) => Ok(ticket),
      Err(e) if e.is_auth() => Err(e),
      Err(e) => match self.cache.lookup(formatted_id) {
        Some(cached) => {
          debug!("Serving {} from cache: {}", formatted_id, e);
          Ok(Some(cached))
        }
        None => Err(e),
      },
    }
  }

  async fn get_discussions(&self, ticket: &Ticket) -> ApiResult<Vec<Discussion>> {
    self.inner.get_discussions(ticket).await
  }

  async fn add_comment(&self, ticket: &Ticket, text: &str) -> ApiResult<Option<Discussion>> {
    if self.refuse_offline("comment on", &ticket.formatted_id) {
      return Ok(None);
    }
    self.inner.add_comment(ticket, text).await
  }

  async fn update_points(&self, ticket: &Ticket, points: f64) -> ApiResult<Option<Ticket>> {
    if self.refuse_offline("update points of", &ticket.formatted_id) {
      return Ok(None);
    }
    self.write_through(self.inner.update_points(ticket, points).await)
  }

  async fn update_state(&self, ticket: &Ticket, state: &str) -> ApiResult<Option<Ticket>> {
    if self.refuse_offline("update state of", &ticket.formatted_id) {
      return Ok(None);
    }
    self.write_through(self.inner.update_state(ticket, state).await)
  }

  async fn set_parent(&self, ticket: &Ticket, parent_id: &str) -> ApiResult<Option<Ticket>> {
    if self.refuse_offline("set parent of", &ticket.formatted_id) {
      return Ok(None);
    }
    self.write_through(self.inner.set_parent(ticket, parent_id).await)
  }

  async fn assign_owner(&self, ticket: &Ticket, owner: &Owner) -> ApiResult<Option<Ticket>> {
    if self.refuse_offline("assign owner of", &ticket.formatted_id) {
      return Ok(None);
    }
    self.write_through(self.inner.assign_owner(ticket, owner).await)
  }

  async fn assign_iteration(
    &self,
    ticket: &Ticket,
    iteration: Option<&Iteration>,
  ) -> ApiResult<Option<Ticket>> {
    if self.refuse_offline("set iteration of", &ticket.formatted_id) {
      return Ok(None);
    }
    self.write_through(self.inner.assign_iteration(ticket, iteration).await)
  }

  async fn set_iteration(&self, ticket: &Ticket, name: Option<&str>) -> ApiResult<Option<Ticket>> {
    if self.refuse_offline("set iteration of", &ticket.formatted_id) {
      return Ok(None);
    }
    self.write_through(self.inner.set_iteration(ticket, name).await)
  }

  /// New tickets are not added to the snapshot; the next refresh picks them up.
  async fn create_ticket(&self, new_ticket: &NewTicket) -> ApiResult<Option<Ticket>> {
    if self.refuse_offline("create", &new_ticket.name) {
      return Ok(None);
    }
    self.inner.create_ticket(new_ticket).await
  }

  async fn get_iterations(&self, count: usize) -> ApiResult<Vec<Iteration>> {
    self.inner.get_iterations(count).await
  }

  async fn find_iteration(&self, name: &str) -> ApiResult<Option<Iteration>> {
    self.inner.find_iteration(name).await
  }

  async fn find_user(&self, display_name: &str) -> ApiResult<Option<Owner>> {
    self.inner.find_user(display_name).await
  }

  async fn get_tags(&self) -> ApiResult<Vec<Tag>> {
    self.inner.get_tags().await
  }

  async fn create_tag(&self, name: &str) -> ApiResult<Option<Tag>> {
    if self.refuse_offline("create tag", name) {
      return Ok(None);
    }
    self.inner.create_tag(name).await
  }

  async fn add_tag(&self, ticket: &Ticket, tag: &Tag) -> ApiResult<bool> {
    if self.refuse_offline("tag", &ticket.formatted_id) {
      return Ok(false);
    }
    self.inner.add_tag(ticket, tag).await
  }

  async fn remove_tag(&self, ticket: &Ticket, tag: &Tag) -> ApiResult<bool> {
    if self.refuse_offline("untag", &ticket.formatted_id) {
      return Ok(false);
    }
    self.inner.remove_tag(ticket, tag).await
  }

  async fn get_attachments(&self, ticket: &Ticket) -> ApiResult<Vec<Attachment>> {
    self.inner.get_attachments(ticket).await
  }

  async fn download_attachment(&self, attachment: &Attachment) -> ApiResult<Option<Vec<u8>>> {
    self.inner.download_attachment(attachment).await
  }

  async fn upload_attachment(
    &self,
    ticket: &Ticket,
    file_name: &str,
    content_type: &str,
    content: &[u8],
  ) -> ApiResult<Option<Attachment>> {
    if self.refuse_offline("attach to", &ticket.formatted_id) {
      return Ok(None);
    }
    self
      .inner
      .upload_attachment(ticket, file_name, content_type, content)
      .await
  }

  async fn bulk_update_state(&self, tickets: &[Ticket], state: &str) -> BulkResult {
    if let Some(refused) = self.refuse_bulk("update state of", tickets) {
      return refused;
    }
    self.bulk_write_through(self.inner.bulk_update_state(tickets, state).await)
  }

  async fn bulk_set_parent(&self, tickets: &[Ticket], parent_id: &str) -> BulkResult {
    if let Some(refused) = self.refuse_bulk("set parent of", tickets) {
      return refused;
    }
    self.bulk_write_through(self.inner.bulk_set_parent(tickets, parent_id).await)
  }

  async fn bulk_set_iteration(&self, tickets: &[Ticket], name: Option<&str>) -> BulkResult {
    if let Some(refused) = self.refuse_bulk("set iteration of", tickets) {
      return refused;
    }
    self.bulk_write_through(self.inner.bulk_set_iteration(tickets, name).await)
  }

  async fn bulk_update_points(&self, tickets: &[Ticket], points: f64) -> BulkResult {
    if let Some(refused) = self.refuse_bulk("update points of", tickets) {
      return refused;
    }
    self.bulk_write_through(self.inner.bulk_update_points(tickets, points).await)
  }

  async fn bulk_assign_owner(&self, tickets: &[Ticket], owner: &Owner) -> BulkResult {
    if let Some(refused) = self.refuse_bulk("assign owner of", tickets) {
      return refused;
    }
    self.bulk_write_through(self.inner.bulk_assign_owner(tickets, owner).await)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheMetadata;
  use crate::rally::error::{ApiError, ErrorKind};
  use crate::rally::testing::MockRallyApi;
  use crate::rally::types::TicketType;
  use chrono::{Duration, Utc};
  use tempfile::TempDir;

  fn story(id: &str, oid: &str) -> Ticket {
    let mut ticket = Ticket::new(id, format!("Story {}", id), TicketType::Story).with_state("Defined");
    ticket.object_id = Some(oid.to_string());
    ticket
  }

  fn remote_tickets() -> Vec<Ticket> {
    vec![story("US1", "1"), story("US2", "2"), story("US3", "3")]
  }

  fn cached_tickets() -> Vec<Ticket> {
    vec![story("US1", "1").with_state("Completed")]
  }

  fn seed(dir: &TempDir, tickets: &[Ticket], project: &str, minutes_ago: i64) {
    let meta = CacheMetadata::new("Acme", project, Utc::now() - Duration::minutes(minutes_ago));
    FileStorage::new(dir.path()).write_snapshot(tickets, &meta).unwrap();
  }

  fn client(dir: &TempDir, api: MockRallyApi) -> CachedRallyClient<MockRallyApi, FileStorage> {
    CachedRallyClient::new(api, FileStorage::new(dir.path()), &CacheConfig::default())
  }

  fn snapshot(dir: &TempDir) -> Option<Vec<Ticket>> {
    FileStorage::new(dir.path()).load_tickets().unwrap()
  }

  #[tokio::test]
  async fn test_valid_cache_without_query_makes_no_remote_call() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &cached_tickets(), "Payments", 1);
    let client = client(&dir, MockRallyApi::new(remote_tickets()));

    let result = client.get_tickets_with_status(None).await.unwrap();

    assert_eq!(client.inner().reads(), 0);
    assert_eq!(result.status, CacheStatus::Cached);
    assert!(!result.is_stale);
    assert_eq!(result.age_minutes, Some(1));
    assert_eq!(result.data, cached_tickets());
    assert!(!client.should_refresh());
  }

  #[tokio::test]
  async fn test_stale_cache_is_served_and_flagged() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &cached_tickets(), "Payments", 30);
    let client = client(&dir, MockRallyApi::new(remote_tickets()));

    let result = client.get_tickets_with_status(None).await.unwrap();

    assert_eq!(client.inner().reads(), 0);
    assert_eq!(result.status, CacheStatus::Cached);
    assert!(result.is_stale);
    assert!(client.should_refresh());
  }

  #[tokio::test]
  async fn test_query_always_goes_remote_and_is_not_cached() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &cached_tickets(), "Payments", 1);
    let client = client(&dir, MockRallyApi::new(remote_tickets()));

    let query = "(ScheduleState = \"Defined\")";
    let result = client.get_tickets_with_status(Some(query)).await.unwrap();

    assert_eq!(client.inner().reads(), 1);
    assert_eq!(client.inner().queries(), vec![Some(query.to_string())]);
    assert_eq!(result.status, CacheStatus::Live);
    assert_eq!(result.data.len(), 3);
    assert_eq!(snapshot(&dir), Some(cached_tickets()));
  }

  #[tokio::test]
  async fn test_missing_cache_fetches_and_saves() {
    let dir = TempDir::new().unwrap();
    let client = client(&dir, MockRallyApi::new(remote_tickets()));

    let result = client.get_tickets_with_status(None).await.unwrap();

    assert_eq!(client.inner().queries(), vec![None]);
    assert_eq!(result.status, CacheStatus::Live);
    assert_eq!(snapshot(&dir), Some(remote_tickets()));
    assert_eq!(client.status(), CacheStatus::Live);
  }

  #[tokio::test]
  async fn test_other_project_cache_is_ignored() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &cached_tickets(), "Billing", 1);
    let client = client(&dir, MockRallyApi::new(remote_tickets()));

    let result = client.get_tickets_with_status(None).await.unwrap();

    assert_eq!(client.inner().reads(), 1);
    assert_eq!(result.data, remote_tickets());
    assert!(FileStorage::new(dir.path()).is_for_project("Acme", "Payments"));
  }

  #[tokio::test]
  async fn test_remote_failure_serves_snapshot_offline() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &cached_tickets(), "Payments", 5);
    let api = MockRallyApi::new(remote_tickets());
    api.set_read_error(Some(ApiError::transport("connection refused")));
    let client = client(&dir, api);

    let result = client
      .get_tickets_with_status(Some("(Name contains \"x\")"))
      .await
      .unwrap();

    assert_eq!(result.status, CacheStatus::Offline);
    assert_eq!(result.data, cached_tickets());
    assert!(client.is_offline());
  }

  #[tokio::test]
  async fn test_remote_failure_without_snapshot_is_empty_offline() {
    let dir = TempDir::new().unwrap();
    let api = MockRallyApi::new(remote_tickets());
    api.set_read_error(Some(ApiError::transport("connection refused")));
    let client = client(&dir, api);

    let result = client.get_tickets_with_status(None).await.unwrap();

    assert_eq!(result.status, CacheStatus::Offline);
    assert!(result.data.is_empty());
    assert_eq!(client.status(), CacheStatus::Offline);
  }

  #[tokio::test]
  async fn test_auth_failure_propagates() {
    let dir = TempDir::new().unwrap();
    let api = MockRallyApi::new(remote_tickets());
    api.set_read_error(Some(ApiError::auth("401 Unauthorized")));
    let client = client(&dir, api);

    let err = client.get_tickets(None).await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::AuthFailed);
    assert!(!client.is_offline());
  }

  #[tokio::test]
  async fn test_offline_refuses_every_write_without_calling_remote() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &remote_tickets(), "Payments", 1);
    let client = client(&dir, MockRallyApi::new(remote_tickets()));
    client.set_offline(true);
    let ticket = story("US1", "1");
    let tag = Tag {
      object_id: "5".into(),
      name: "ui".into(),
    };
    let owner = Owner {
      object_id: "1".into(),
      display_name: "Jane Doe".into(),
      user_name: "jane".into(),
    };

    assert_eq!(client.update_state(&ticket, "Completed").await.unwrap(), None);
    assert_eq!(client.update_points(&ticket, 3.0).await.unwrap(), None);
    assert_eq!(client.set_parent(&ticket, "F1").await.unwrap(), None);
    assert_eq!(client.assign_owner(&ticket, &owner).await.unwrap(), None);
    assert_eq!(client.set_iteration(&ticket, Some("Sprint 1")).await.unwrap(), None);
    assert_eq!(client.add_comment(&ticket, "hi").await.unwrap(), None);
    assert_eq!(
      client
        .create_ticket(&NewTicket::new(TicketType::Story, "New"))
        .await
        .unwrap(),
      None
    );
    assert!(!client.add_tag(&ticket, &tag).await.unwrap());
    assert!(!client.remove_tag(&ticket, &tag).await.unwrap());
    assert_eq!(client.create_tag("ui").await.unwrap(), None);
    assert_eq!(
      client
        .upload_attachment(&ticket, "a.txt", "text/plain", b"abc")
        .await
        .unwrap(),
      None
    );

    let bulk = client.bulk_update_state(&remote_tickets(), "Completed").await;
    assert_eq!(bulk.failed_count, 3);
    assert_eq!(bulk.success_count, 0);
    assert!(bulk.errors[0].starts_with("US1: "));

    let bulk = client.bulk_set_iteration(&remote_tickets(), Some("Sprint 1")).await;
    assert_eq!(bulk.failed_count, 3);

    assert_eq!(client.inner().mutations(), 0);
    assert_eq!(client.inner().reads(), 0);
  }

  #[tokio::test]
  async fn test_successful_fetch_clears_offline() {
    let dir = TempDir::new().unwrap();
    let client = client(&dir, MockRallyApi::new(remote_tickets()));
    client.set_offline(true);
    assert_eq!(client.status(), CacheStatus::Offline);

    client.refresh_cache().await.unwrap();

    assert!(!client.is_offline());
    assert_eq!(client.status(), CacheStatus::Live);
  }

  #[tokio::test]
  async fn test_mutation_patches_snapshot_without_inserting() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &remote_tickets(), "Payments", 1);
    let client = client(&dir, MockRallyApi::new(remote_tickets()));

    let updated = client
      .update_state(&story("US2", "2"), "Accepted")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(updated.state, "Accepted");

    client
      .create_ticket(&NewTicket::new(TicketType::Story, "Brand new"))
      .await
      .unwrap();

    let cached = snapshot(&dir).unwrap();
    assert_eq!(cached.len(), 3);
    assert_eq!(cached[1].state, "Accepted");
    assert!(cached.iter().all(|t| t.formatted_id != "US999"));
  }

  #[tokio::test]
  async fn test_bulk_results_are_patched() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &remote_tickets(), "Payments", 1);
    let client = client(&dir, MockRallyApi::new(remote_tickets()).failing_on("US2"));

    let result = client.bulk_update_points(&remote_tickets(), 5.0).await;

    assert_eq!(result.success_count, 2);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.errors, vec!["US2: connection reset".to_string()]);

    let cached = snapshot(&dir).unwrap();
    assert_eq!(cached[0].points, Some(5.0));
    assert_eq!(cached[1].points, None);
    assert_eq!(cached[2].points, Some(5.0));
  }

  #[tokio::test]
  async fn test_refresh_publishes_events() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &cached_tickets(), "Payments", 1);
    let client = client(&dir, MockRallyApi::new(remote_tickets()));
    let mut events = client.subscribe();

    let result = client.refresh_cache().await.unwrap();
    assert_eq!(client.inner().reads(), 1);
    assert_eq!(result.data, remote_tickets());
    assert_eq!(snapshot(&dir), Some(remote_tickets()));

    let mut statuses = Vec::new();
    let mut refreshed = None;
    while let Ok(event) = events.try_recv() {
      match event {
        CacheEvent::StatusChanged { status, .. } => statuses.push(status),
        CacheEvent::TicketsRefreshed(tickets) => refreshed = Some(tickets.len()),
      }
    }
    assert_eq!(statuses, vec![CacheStatus::Refreshing, CacheStatus::Live]);
    assert_eq!(refreshed, Some(3));
  }

  #[tokio::test]
  async fn test_get_ticket_falls_back_to_snapshot() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &cached_tickets(), "Payments", 1);
    let api = MockRallyApi::new(remote_tickets());
    api.set_read_error(Some(ApiError::transport("timed out")));
    let client = client(&dir, api);

    let ticket = client.get_ticket("US1").await.unwrap().unwrap();
    assert_eq!(ticket.state, "Completed");
    assert!(client.get_ticket("US2").await.is_err());

    client.set_offline(true);
    let reads = client.inner().reads();
    assert!(client.get_ticket("US1").await.unwrap().is_some());
    assert_eq!(client.inner().reads(), reads);
  }

  #[tokio::test]
  async fn test_uncached_client_always_goes_remote() {
    let client = CachedRallyClient::uncached(MockRallyApi::new(remote_tickets()));

    client.get_tickets(None).await.unwrap();
    client.get_tickets(None).await.unwrap();

    assert_eq!(client.inner().reads(), 2);
    assert_eq!(client.cache_age_minutes(), None);
    assert!(!client.should_refresh());
  }

  #[tokio::test]
  async fn test_clear_cache_forces_remote_fetch() {
    let dir = TempDir::new().unwrap();
    seed(&dir, &cached_tickets(), "Payments", 1);
    let client = client(&dir, MockRallyApi::new(remote_tickets()));

    client.clear_cache().unwrap();
    let result = client.get_tickets_with_status(None).await.unwrap();

    assert_eq!(client.inner().reads(), 1);
    assert_eq!(result.status, CacheStatus::Live);
  }
}
