//! In-memory [`RallyApi`] used by tests of the layers above the client.
//!
//! Reads come from a configurable ticket list; mutations return the updated
//! ticket without touching that list. Every call is counted so tests can
//! assert that no network work happened.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::api::RallyApi;
use super::error::{ApiError, ApiResult};
use super::types::{Attachment, Discussion, Iteration, NewTicket, Owner, Tag, Ticket};

pub struct MockRallyApi {
  pub workspace: String,
  pub project: String,
  tickets: Mutex<Vec<Ticket>>,
  iterations: Vec<Iteration>,
  /// Error returned by every read while set
  read_error: Mutex<Option<ApiError>>,
  /// Mutations on these formatted ids fail with a transport error
  failing_ids: HashSet<String>,
  reads: AtomicUsize,
  mutations: AtomicUsize,
  queries: Mutex<Vec<Option<String>>>,
}

impl MockRallyApi {
  pub fn new(tickets: Vec<Ticket>) -> Self {
    Self {
      workspace: "Acme".into(),
      project: "Payments".into(),
      tickets: Mutex::new(tickets),
      iterations: Vec::new(),
      read_error: Mutex::new(None),
      failing_ids: HashSet::new(),
      reads: AtomicUsize::new(0),
      mutations: AtomicUsize::new(0),
      queries: Mutex::new(Vec::new()),
    }
  }

  pub fn with_iterations(mut self, iterations: Vec<Iteration>) -> Self {
    self.iterations = iterations;
    self
  }

  pub fn failing_on(mut self, formatted_id: &str) -> Self {
    self.failing_ids.insert(formatted_id.to_string());
    self
  }

  /// Make every read fail with `error` until cleared with `None`.
  pub fn set_read_error(&self, error: Option<ApiError>) {
    *self.read_error.lock().unwrap() = error;
  }

  pub fn reads(&self) -> usize {
    self.reads.load(Ordering::SeqCst)
  }

  pub fn mutations(&self) -> usize {
    self.mutations.load(Ordering::SeqCst)
  }

  pub fn queries(&self) -> Vec<Option<String>> {
    self.queries.lock().unwrap().clone()
  }

  fn read(&self) -> ApiResult<()> {
    self.reads.fetch_add(1, Ordering::SeqCst);
    match self.read_error.lock().unwrap().clone() {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  fn mutate(&self, ticket: &Ticket, apply: impl FnOnce(&Ticket) -> Ticket) -> ApiResult<Option<Ticket>> {
    self.mutations.fetch_add(1, Ordering::SeqCst);
    if self.failing_ids.contains(&ticket.formatted_id) {
      return Err(ApiError::transport("connection reset"));
    }
    if ticket.object_id.is_none() {
      return Ok(None);
    }
    Ok(Some(apply(ticket)))
  }

  fn count_mutation(&self) {
    self.mutations.fetch_add(1, Ordering::SeqCst);
  }
}

#[async_trait]
impl RallyApi for MockRallyApi {
  fn workspace(&self) -> &str {
    &self.workspace
  }

  fn project(&self) -> &str {
    &self.project
  }

  fn current_user(&self) -> Option<&str> {
    Some("Jane Doe")
  }

  fn current_iteration(&self) -> Option<&str> {
    self.iterations.first().map(|i| i.name.as_str())
  }

  async fn get_tickets(&self, query: Option<&str>) -> ApiResult<Vec<Ticket>> {
    self.queries.lock().unwrap().push(query.map(String::from));
    self.read()?;
    Ok(self.tickets.lock().unwrap().clone())
  }

  async fn get_ticket(&self, formatted_id: &str) -> ApiResult<Option<Ticket>> {
    self.read()?;
    Ok(
      self
        .tickets
        .lock()
        .unwrap()
        .iter()
        .find(|t| t.formatted_id == formatted_id)
        .cloned(),
    )
  }

  async fn get_discussions(&self, _ticket: &Ticket) -> ApiResult<Vec<Discussion>> {
    self.read()?;
    Ok(Vec::new())
  }

  async fn add_comment(&self, ticket: &Ticket, text: &str) -> ApiResult<Option<Discussion>> {
    self.count_mutation();
    Ok(ticket.object_id.as_ref().map(|_| Discussion {
      object_id: "900".into(),
      author: "Jane Doe".into(),
      text: text.to_string(),
      created_at: None,
    }))
  }

  async fn update_points(&self, ticket: &Ticket, points: f64) -> ApiResult<Option<Ticket>> {
    self.mutate(ticket, |t| t.with_points(Some(points)))
  }

  async fn update_state(&self, ticket: &Ticket, state: &str) -> ApiResult<Option<Ticket>> {
    self.mutate(ticket, |t| t.with_state(state))
  }

  async fn set_parent(&self, ticket: &Ticket, parent_id: &str) -> ApiResult<Option<Ticket>> {
    self.mutate(ticket, |t| t.with_parent(Some(parent_id.to_string())))
  }

  async fn assign_owner(&self, ticket: &Ticket, owner: &Owner) -> ApiResult<Option<Ticket>> {
    self.mutate(ticket, |t| t.with_owner(Some(owner.display_name.clone())))
  }

  async fn assign_iteration(
    &self,
    ticket: &Ticket,
    iteration: Option<&Iteration>,
  ) -> ApiResult<Option<Ticket>> {
    self.mutate(ticket, |t| t.with_iteration(iteration.map(|i| i.name.clone())))
  }

  async fn create_ticket(&self, new_ticket: &NewTicket) -> ApiResult<Option<Ticket>> {
    self.count_mutation();
    let mut ticket = Ticket::new("US999", new_ticket.name.clone(), new_ticket.ticket_type);
    ticket.object_id = Some("999".into());
    Ok(Some(ticket))
  }

  async fn get_iterations(&self, count: usize) -> ApiResult<Vec<Iteration>> {
    self.read()?;
    Ok(self.iterations.iter().take(count).cloned().collect())
  }

  async fn find_iteration(&self, name: &str) -> ApiResult<Option<Iteration>> {
    self.read()?;
    Ok(self.iterations.iter().find(|i| i.name == name).cloned())
  }

  async fn find_user(&self, display_name: &str) -> ApiResult<Option<Owner>> {
    self.read()?;
    Ok(Some(Owner {
      object_id: "1".into(),
      display_name: display_name.to_string(),
      user_name: "user@example.com".into(),
    }))
  }

  async fn get_tags(&self) -> ApiResult<Vec<Tag>> {
    self.read()?;
    Ok(Vec::new())
  }

  async fn create_tag(&self, name: &str) -> ApiResult<Option<Tag>> {
    self.count_mutation();
    Ok(Some(Tag {
      object_id: "500".into(),
      name: name.to_string(),
    }))
  }

  async fn add_tag(&self, ticket: &Ticket, _tag: &Tag) -> ApiResult<bool> {
    self.count_mutation();
    Ok(ticket.object_id.is_some())
  }

  async fn remove_tag(&self, ticket: &Ticket, _tag: &Tag) -> ApiResult<bool> {
    self.count_mutation();
    Ok(ticket.object_id.is_some())
  }

  async fn get_attachments(&self, _ticket: &Ticket) -> ApiResult<Vec<Attachment>> {
    self.read()?;
    Ok(Vec::new())
  }

  async fn download_attachment(&self, _attachment: &Attachment) -> ApiResult<Option<Vec<u8>>> {
    self.read()?;
    Ok(None)
  }

  async fn upload_attachment(
    &self,
    ticket: &Ticket,
    file_name: &str,
    content_type: &str,
    content: &[u8],
  ) -> ApiResult<Option<Attachment>> {
    self.count_mutation();
    Ok(ticket.object_id.as_ref().map(|_| Attachment {
      object_id: "700".into(),
      name: file_name.to_string(),
      size: content.len() as u64,
      content_type: content_type.to_string(),
    }))
  }
}
