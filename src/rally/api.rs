//! The interface every Rally client implements.
//!
//! Callers depend on [`RallyApi`] only, so the live client, the caching
//! wrapper and test doubles are interchangeable. Bulk operations are provided
//! methods built on the single-item calls; they inherit whatever concurrency
//! limit the implementation applies to those calls.

use async_trait::async_trait;
use tracing::warn;

use super::bulk::{fan_out, BulkResult};
use super::error::ApiResult;
use super::types::{Attachment, Discussion, Iteration, NewTicket, Owner, Tag, Ticket};

#[async_trait]
pub trait RallyApi: Send + Sync {
  /// Workspace name requests are scoped to
  fn workspace(&self) -> &str;

  /// Project name requests are scoped to
  fn project(&self) -> &str;

  /// Display name of the user the API key belongs to, if known
  fn current_user(&self) -> Option<&str>;

  /// Name of the iteration covering today, if known
  fn current_iteration(&self) -> Option<&str>;

  /// Fetch stories, defects and tasks matching `query`, or the default
  /// query when `None`.
  async fn get_tickets(&self, query: Option<&str>) -> ApiResult<Vec<Ticket>>;

  async fn get_ticket(&self, formatted_id: &str) -> ApiResult<Option<Ticket>>;

  async fn get_discussions(&self, ticket: &Ticket) -> ApiResult<Vec<Discussion>>;

  async fn add_comment(&self, ticket: &Ticket, text: &str) -> ApiResult<Option<Discussion>>;

  async fn update_points(&self, ticket: &Ticket, points: f64) -> ApiResult<Option<Ticket>>;

  async fn update_state(&self, ticket: &Ticket, state: &str) -> ApiResult<Option<Ticket>>;

  async fn set_parent(&self, ticket: &Ticket, parent_id: &str) -> ApiResult<Option<Ticket>>;

  async fn assign_owner(&self, ticket: &Ticket, owner: &Owner) -> ApiResult<Option<Ticket>>;

  /// Move a ticket into `iteration`, or to the backlog when `None`.
  async fn assign_iteration(
    &self,
    ticket: &Ticket,
    iteration: Option<&Iteration>,
  ) -> ApiResult<Option<Ticket>>;

  async fn create_ticket(&self, new_ticket: &NewTicket) -> ApiResult<Option<Ticket>>;

  /// Most recent iterations first.
  async fn get_iterations(&self, count: usize) -> ApiResult<Vec<Iteration>>;

  async fn find_iteration(&self, name: &str) -> ApiResult<Option<Iteration>>;

  async fn find_user(&self, display_name: &str) -> ApiResult<Option<Owner>>;

  async fn get_tags(&self) -> ApiResult<Vec<Tag>>;

  async fn create_tag(&self, name: &str) -> ApiResult<Option<Tag>>;

  async fn add_tag(&self, ticket: &Ticket, tag: &Tag) -> ApiResult<bool>;

  async fn remove_tag(&self, ticket: &Ticket, tag: &Tag) -> ApiResult<bool>;

  async fn get_attachments(&self, ticket: &Ticket) -> ApiResult<Vec<Attachment>>;

  async fn download_attachment(&self, attachment: &Attachment) -> ApiResult<Option<Vec<u8>>>;

  async fn upload_attachment(
    &self,
    ticket: &Ticket,
    file_name: &str,
    content_type: &str,
    content: &[u8],
  ) -> ApiResult<Option<Attachment>>;

  /// Move a ticket to the named iteration, or to the backlog when `None`.
  /// An unknown iteration name yields `Ok(None)`.
  async fn set_iteration(&self, ticket: &Ticket, name: Option<&str>) -> ApiResult<Option<Ticket>> {
    let iteration = match name {
      Some(name) => match self.find_iteration(name).await? {
        Some(iteration) => Some(iteration),
        None => {
          warn!("Iteration not found: {}", name);
          return Ok(None);
        }
      },
      None => None,
    };
    self.assign_iteration(ticket, iteration.as_ref()).await
  }

  async fn bulk_update_state(&self, tickets: &[Ticket], state: &str) -> BulkResult {
    fan_out(tickets, "update state", |_| false, |ticket| {
      self.update_state(ticket, state)
    })
    .await
  }

  /// Tickets that already have a parent are left alone.
  async fn bulk_set_parent(&self, tickets: &[Ticket], parent_id: &str) -> BulkResult {
    fan_out(
      tickets,
      "set parent",
      |ticket| ticket.parent_id.is_some(),
      |ticket| self.set_parent(ticket, parent_id),
    )
    .await
  }

  /// The iteration is resolved once up front; an unknown name fails the
  /// whole call before any ticket is touched.
  async fn bulk_set_iteration(&self, tickets: &[Ticket], name: Option<&str>) -> BulkResult {
    let iteration = match name {
      Some(name) => match self.find_iteration(name).await {
        Ok(Some(iteration)) => Some(iteration),
        Ok(None) => {
          return BulkResult::precondition_failed(tickets, format!("Iteration not found: {}", name))
        }
        Err(e) => {
          return BulkResult::precondition_failed(
            tickets,
            format!("Failed to look up iteration {}: {}", name, e),
          )
        }
      },
      None => None,
    };
    let iteration = iteration.as_ref();

    fan_out(tickets, "set iteration", |_| false, |ticket| {
      self.assign_iteration(ticket, iteration)
    })
    .await
  }

  async fn bulk_update_points(&self, tickets: &[Ticket], points: f64) -> BulkResult {
    fan_out(tickets, "update points", |_| false, |ticket| {
      self.update_points(ticket, points)
    })
    .await
  }

  async fn bulk_assign_owner(&self, tickets: &[Ticket], owner: &Owner) -> BulkResult {
    fan_out(tickets, "assign owner", |_| false, |ticket| {
      self.assign_owner(ticket, owner)
    })
    .await
  }
}
