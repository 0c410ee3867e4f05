//! Fan-out of per-ticket mutations with isolated failures.

use std::future::Future;

use futures::future::join_all;
use tracing::{debug, info};

use super::error::ApiResult;
use super::types::Ticket;

/// Aggregate outcome of a bulk operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResult {
  pub success_count: usize,
  pub failed_count: usize,
  /// `"<formatted_id>: <message>"` per failed ticket
  pub errors: Vec<String>,
  pub updated_tickets: Vec<Ticket>,
}

impl BulkResult {
  /// Every ticket failed for the same reason without any call being made.
  pub fn all_failed(tickets: &[Ticket], reason: &str) -> Self {
    Self {
      success_count: 0,
      failed_count: tickets.len(),
      errors: tickets
        .iter()
        .map(|t| format!("{}: {}", t.formatted_id, reason))
        .collect(),
      updated_tickets: Vec::new(),
    }
  }

  /// The whole call failed on a shared precondition.
  pub fn precondition_failed(tickets: &[Ticket], message: impl Into<String>) -> Self {
    Self {
      success_count: 0,
      failed_count: tickets.len(),
      errors: vec![message.into()],
      updated_tickets: Vec::new(),
    }
  }

  pub fn is_complete_success(&self) -> bool {
    self.failed_count == 0
  }

  fn record(&mut self, ticket: &Ticket, action: &str, outcome: ApiResult<Option<Ticket>>) {
    match outcome {
      Ok(Some(updated)) => {
        self.success_count += 1;
        self.updated_tickets.push(updated);
      }
      Ok(None) => {
        self.failed_count += 1;
        self
          .errors
          .push(format!("{}: Failed to {}", ticket.formatted_id, action));
      }
      Err(e) => {
        self.failed_count += 1;
        self.errors.push(format!("{}: {}", ticket.formatted_id, e));
      }
    }
  }
}

/// Run `op` once per ticket concurrently and gather the outcomes.
///
/// Tickets for which `skip` returns true get no call and are counted neither
/// as success nor failure. Outcomes are recorded in input order.
pub async fn fan_out<'a, F, Fut>(
  tickets: &'a [Ticket],
  action: &str,
  skip: impl Fn(&Ticket) -> bool,
  op: F,
) -> BulkResult
where
  F: Fn(&'a Ticket) -> Fut,
  Fut: Future<Output = ApiResult<Option<Ticket>>>,
{
  let targets: Vec<&'a Ticket> = tickets.iter().filter(|t| !skip(t)).collect();
  let skipped = tickets.len() - targets.len();
  if skipped > 0 {
    debug!("Bulk {}: skipping {} ticket(s) with nothing to do", action, skipped);
  }

  let outcomes = join_all(targets.iter().map(|ticket| op(*ticket))).await;

  let mut result = BulkResult::default();
  for (ticket, outcome) in targets.into_iter().zip(outcomes) {
    result.record(ticket, action, outcome);
  }

  info!(
    "Bulk {}: {} succeeded, {} failed",
    action, result.success_count, result.failed_count
  );
  result
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::rally::error::ApiError;
  use crate::rally::types::TicketType;

  fn tickets() -> Vec<Ticket> {
    (1..=3)
      .map(|n| Ticket::new(format!("US{}", n), format!("Story {}", n), TicketType::Story))
      .collect()
  }

  #[tokio::test]
  async fn test_failures_are_isolated() {
    let tickets = tickets();
    let result = fan_out(&tickets, "update state", |_| false, |ticket| async move {
      match ticket.formatted_id.as_str() {
        "US2" => Err(ApiError::transport("connection reset")),
        _ => Ok(Some(ticket.with_state("Completed"))),
      }
    })
    .await;

    assert_eq!(result.success_count, 2);
    assert_eq!(result.failed_count, 1);
    assert_eq!(result.errors, vec!["US2: connection reset".to_string()]);
    let ids: Vec<_> = result.updated_tickets.iter().map(|t| t.formatted_id.as_str()).collect();
    assert_eq!(ids, vec!["US1", "US3"]);
  }

  #[tokio::test]
  async fn test_absent_result_counts_as_failure() {
    let tickets = tickets();
    let result = fan_out(&tickets[..1], "set parent", |_| false, |_| async { Ok(None) }).await;

    assert_eq!(result.failed_count, 1);
    assert_eq!(result.errors, vec!["US1: Failed to set parent".to_string()]);
  }

  #[tokio::test]
  async fn test_skipped_tickets_are_not_counted() {
    let tickets = tickets();
    let result = fan_out(
      &tickets,
      "set parent",
      |t| t.formatted_id == "US1",
      |ticket| async move { Ok(Some(ticket.with_parent(Some("F1".into())))) },
    )
    .await;

    assert_eq!(result.success_count, 2);
    assert_eq!(result.failed_count, 0);
    assert!(result.is_complete_success());
  }

  #[test]
  fn test_all_failed_lists_every_ticket() {
    let result = BulkResult::all_failed(&tickets(), "offline");
    assert_eq!(result.failed_count, 3);
    assert_eq!(result.errors[2], "US3: offline");
  }
}
