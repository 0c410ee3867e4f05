//! WSAPI query string construction.
//!
//! Rally queries are parenthesised clauses combined pairwise:
//! `((A) AND (B))`, `(((A) AND (B)) AND (C))`, and so on.

use std::fmt;

/// Comparison operator of a single clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
  Eq,
  Ne,
  Lt,
  Lte,
  Gt,
  Gte,
  Contains,
}

impl Op {
  fn as_str(self) -> &'static str {
    match self {
      Op::Eq => "=",
      Op::Ne => "!=",
      Op::Lt => "<",
      Op::Lte => "<=",
      Op::Gt => ">",
      Op::Gte => ">=",
      Op::Contains => "contains",
    }
  }
}

/// A single `(Field op value)` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
  field: String,
  op: Op,
  /// `None` renders as the bare `null` keyword
  value: Option<String>,
}

impl Condition {
  pub fn new(field: impl Into<String>, op: Op, value: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      op,
      value: Some(value.into()),
    }
  }

  pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
    Self::new(field, Op::Eq, value)
  }

  pub fn is_null(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      op: Op::Eq,
      value: None,
    }
  }

  pub fn not_null(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      op: Op::Ne,
      value: None,
    }
  }
}

impl fmt::Display for Condition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.value {
      Some(value) => write!(f, "({} {} {})", self.field, self.op.as_str(), quote(value)),
      None => write!(f, "({} {} null)", self.field, self.op.as_str()),
    }
  }
}

fn quote(value: &str) -> String {
  format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Join rendered clauses into a left-associative nested AND.
pub fn and_all<I, S>(clauses: I) -> Option<String>
where
  I: IntoIterator<Item = S>,
  S: Into<String>,
{
  clauses
    .into_iter()
    .map(Into::into)
    .reduce(|acc, clause| format!("({} AND {})", acc, clause))
}

/// Builder for ticket list filters.
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
  conditions: Vec<Condition>,
  custom: Option<String>,
}

impl QueryBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn iteration(mut self, name: impl Into<String>) -> Self {
    self.conditions.push(Condition::eq("Iteration.Name", name));
    self
  }

  /// Only tickets without an iteration.
  pub fn backlog(mut self) -> Self {
    self.conditions.push(Condition::is_null("Iteration"));
    self
  }

  pub fn owner(mut self, display_name: impl Into<String>) -> Self {
    self.conditions.push(Condition::eq("Owner.DisplayName", display_name));
    self
  }

  pub fn state(mut self, state: impl Into<String>) -> Self {
    self.conditions.push(Condition::eq("ScheduleState", state));
    self
  }

  pub fn condition(mut self, condition: Condition) -> Self {
    self.conditions.push(condition);
    self
  }

  /// Raw query string used verbatim, ignoring every other condition.
  pub fn custom(mut self, query: impl Into<String>) -> Self {
    self.custom = Some(query.into());
    self
  }

  pub fn build(&self) -> Option<String> {
    if let Some(custom) = &self.custom {
      return Some(custom.clone());
    }
    and_all(self.conditions.iter().map(|c| c.to_string()))
  }
}

/// Query used when the caller supplies none: current iteration and current
/// user, whichever are known.
pub fn default_query(iteration: Option<&str>, user: Option<&str>) -> Option<String> {
  let mut builder = QueryBuilder::new();
  if let Some(iteration) = iteration {
    builder = builder.iteration(iteration);
  }
  if let Some(user) = user {
    builder = builder.owner(user);
  }
  builder.build()
}
