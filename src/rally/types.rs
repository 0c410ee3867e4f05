use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work item, derived from the formatted id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketType {
  Story,
  Defect,
  Task,
  TestCase,
}

impl TicketType {
  /// Ticket kinds returned by a list fetch, in fetch order.
  pub const LISTED: [TicketType; 3] = [TicketType::Story, TicketType::Defect, TicketType::Task];

  /// Infer the ticket type from a formatted id such as `US1234` or `TA77`.
  pub fn from_formatted_id(formatted_id: &str) -> Option<Self> {
    match id_prefix(formatted_id).as_str() {
      "US" | "S" => Some(Self::Story),
      "DE" | "D" => Some(Self::Defect),
      "TA" | "T" => Some(Self::Task),
      "TC" => Some(Self::TestCase),
      _ => None,
    }
  }

  /// WSAPI endpoint segment for this type.
  pub fn endpoint(self) -> &'static str {
    match self {
      Self::Story => "hierarchicalrequirement",
      Self::Defect => "defect",
      Self::Task => "task",
      Self::TestCase => "testcase",
    }
  }

  /// Name used as the JSON body key on create/update.
  pub fn type_name(self) -> &'static str {
    match self {
      Self::Story => "HierarchicalRequirement",
      Self::Defect => "Defect",
      Self::Task => "Task",
      Self::TestCase => "TestCase",
    }
  }

  /// Field holding the workflow state.
  pub fn state_field(self) -> &'static str {
    match self {
      Self::Story | Self::Defect => "ScheduleState",
      Self::Task => "State",
      Self::TestCase => "LastVerdict",
    }
  }

  /// Field holding the estimate.
  pub fn points_field(self) -> &'static str {
    match self {
      Self::Task => "Estimate",
      _ => "PlanEstimate",
    }
  }

  /// Field the parent reference is written to, given the parent's prefix.
  pub fn parent_field(self, parent_id: &str) -> Option<&'static str> {
    match (self, id_prefix(parent_id).as_str()) {
      (Self::Story, "F") => Some("PortfolioItem"),
      (Self::Story, "US" | "S") => Some("Parent"),
      (Self::Defect, "US" | "S") => Some("Requirement"),
      (Self::Task, "US" | "S" | "DE" | "D") => Some("WorkProduct"),
      (Self::TestCase, "US" | "S" | "DE" | "D") => Some("WorkProduct"),
      _ => None,
    }
  }
}

/// Uppercased alphabetic prefix of a formatted id.
pub(crate) fn id_prefix(formatted_id: &str) -> String {
  formatted_id
    .trim()
    .chars()
    .take_while(|c| c.is_ascii_alphabetic())
    .collect::<String>()
    .to_ascii_uppercase()
}

/// Endpoint for a parent reference, which may be a feature.
pub(crate) fn parent_endpoint(parent_id: &str) -> Option<&'static str> {
  if id_prefix(parent_id) == "F" {
    return Some("portfolioitem/feature");
  }
  TicketType::from_formatted_id(parent_id).map(TicketType::endpoint)
}

/// A work item.
///
/// Tickets are values: every update produces a new `Ticket` through one of the
/// `with_*` methods rather than mutating an existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
  pub formatted_id: String,
  pub name: String,
  pub ticket_type: TicketType,
  pub state: String,
  pub owner: Option<String>,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub notes: String,
  pub iteration: Option<String>,
  pub points: Option<f64>,
  #[serde(default)]
  pub object_id: Option<String>,
  #[serde(default)]
  pub parent_id: Option<String>,
}

impl Ticket {
  pub fn new(formatted_id: impl Into<String>, name: impl Into<String>, ticket_type: TicketType) -> Self {
    Self {
      formatted_id: formatted_id.into(),
      name: name.into(),
      ticket_type,
      state: String::new(),
      owner: None,
      description: String::new(),
      notes: String::new(),
      iteration: None,
      points: None,
      object_id: None,
      parent_id: None,
    }
  }

  /// Whether the ticket sits in the backlog (no iteration).
  pub fn is_backlog(&self) -> bool {
    self.iteration.is_none()
  }

  pub fn with_state(&self, state: impl Into<String>) -> Self {
    Self {
      state: state.into(),
      ..self.clone()
    }
  }

  pub fn with_points(&self, points: Option<f64>) -> Self {
    Self {
      points,
      ..self.clone()
    }
  }

  pub fn with_owner(&self, owner: Option<String>) -> Self {
    Self {
      owner,
      ..self.clone()
    }
  }

  pub fn with_iteration(&self, iteration: Option<String>) -> Self {
    Self {
      iteration,
      ..self.clone()
    }
  }

  pub fn with_parent(&self, parent_id: Option<String>) -> Self {
    Self {
      parent_id,
      ..self.clone()
    }
  }
}

/// A user that can own tickets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
  pub object_id: String,
  pub display_name: String,
  pub user_name: String,
}

/// Sprint / timebox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iteration {
  pub object_id: String,
  pub name: String,
  pub state: Option<String>,
  pub start_date: Option<NaiveDate>,
  pub end_date: Option<NaiveDate>,
}

impl Iteration {
  /// Whether `date` falls inside the iteration (inclusive).
  pub fn contains(&self, date: NaiveDate) -> bool {
    match (self.start_date, self.end_date) {
      (Some(start), Some(end)) => start <= date && date <= end,
      _ => false,
    }
  }
}

/// A discussion post on a ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discussion {
  pub object_id: String,
  pub author: String,
  pub text: String,
  pub created_at: Option<DateTime<Utc>>,
}

/// File attached to a ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
  pub object_id: String,
  pub name: String,
  pub size: u64,
  pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
  pub object_id: String,
  pub name: String,
}

/// Fields for creating a new ticket.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTicket {
  pub ticket_type: TicketType,
  pub name: String,
  pub description: String,
  pub points: Option<f64>,
  /// Iteration name; `None` creates the ticket in the backlog
  pub iteration: Option<String>,
  /// Assign the new ticket to the current user
  pub assign_to_me: bool,
}

impl NewTicket {
  pub fn new(ticket_type: TicketType, name: impl Into<String>) -> Self {
    Self {
      ticket_type,
      name: name.into(),
      description: String::new(),
      points: None,
      iteration: None,
      assign_to_me: false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_type_from_prefix() {
    assert_eq!(TicketType::from_formatted_id("US1234"), Some(TicketType::Story));
    assert_eq!(TicketType::from_formatted_id("s12"), Some(TicketType::Story));
    assert_eq!(TicketType::from_formatted_id("DE7"), Some(TicketType::Defect));
    assert_eq!(TicketType::from_formatted_id("TA3"), Some(TicketType::Task));
    assert_eq!(TicketType::from_formatted_id("TC99"), Some(TicketType::TestCase));
    assert_eq!(TicketType::from_formatted_id("F12"), None);
    assert_eq!(TicketType::from_formatted_id("1234"), None);
  }

  #[test]
  fn test_parent_field_depends_on_both_sides() {
    assert_eq!(TicketType::Story.parent_field("F5"), Some("PortfolioItem"));
    assert_eq!(TicketType::Story.parent_field("US5"), Some("Parent"));
    assert_eq!(TicketType::Task.parent_field("DE5"), Some("WorkProduct"));
    assert_eq!(TicketType::Defect.parent_field("F5"), None);
    assert_eq!(parent_endpoint("F5"), Some("portfolioitem/feature"));
  }

  #[test]
  fn test_with_methods_leave_original_untouched() {
    let original = Ticket::new("US1", "Login page", TicketType::Story).with_state("Defined");
    let updated = original.with_state("Completed").with_points(Some(2.5));

    assert_eq!(original.state, "Defined");
    assert_eq!(original.points, None);
    assert_eq!(updated.state, "Completed");
    assert_eq!(updated.points, Some(2.5));
    assert_eq!(updated.formatted_id, "US1");
  }

  #[test]
  fn test_iteration_contains() {
    let iteration = Iteration {
      object_id: "1".into(),
      name: "Sprint 1".into(),
      state: None,
      start_date: NaiveDate::from_ymd_opt(2026, 10, 12),
      end_date: NaiveDate::from_ymd_opt(2026, 10, 25),
    };
    assert!(iteration.contains(NaiveDate::from_ymd_opt(2026, 10, 12).unwrap()));
    assert!(iteration.contains(NaiveDate::from_ymd_opt(2026, 10, 25).unwrap()));
    assert!(!iteration.contains(NaiveDate::from_ymd_opt(2026, 10, 26).unwrap()));
  }
}
