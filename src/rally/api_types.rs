//! Serde-deserializable types matching Rally WSAPI responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use super::error::{ApiError, ApiResult};
use super::types::{Attachment, Discussion, Iteration, Owner, Tag, Ticket, TicketType};

/// Path segment after which WSAPI object paths start.
const API_VERSION_SEGMENT: &str = "/v2.0";

// ============================================================================
// Envelopes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct QueryEnvelope {
  #[serde(rename = "QueryResult")]
  pub query_result: ApiQueryResult,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiQueryResult {
  #[serde(default)]
  pub errors: Vec<String>,
  #[serde(default)]
  pub warnings: Vec<String>,
  #[serde(default)]
  pub total_result_count: u64,
  #[serde(default)]
  pub start_index: u64,
  #[serde(default)]
  pub results: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct OperationEnvelope {
  #[serde(rename = "OperationResult")]
  pub operation_result: ApiOperationResult,
}

#[derive(Debug, Deserialize)]
pub struct CreateEnvelope {
  #[serde(rename = "CreateResult")]
  pub create_result: ApiOperationResult,
}

/// Body of both `OperationResult` and `CreateResult`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiOperationResult {
  #[serde(default)]
  pub errors: Vec<String>,
  #[serde(default)]
  pub warnings: Vec<String>,
  pub object: Option<Value>,
}

// ============================================================================
// Common nested field types
// ============================================================================

/// Reference to another object, as embedded in a parent record.
#[derive(Debug, Default, Deserialize)]
pub struct ApiRef {
  #[serde(rename = "_ref")]
  pub ref_url: Option<String>,
  #[serde(rename = "_refObjectName")]
  pub name: Option<String>,
  #[serde(rename = "FormattedID")]
  pub formatted_id: Option<String>,
  #[serde(rename = "ObjectID", default, deserialize_with = "deserialize_object_id")]
  pub object_id: Option<String>,
}

/// ObjectIDs arrive as JSON numbers, but older payloads carry strings.
fn deserialize_object_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  let value: Option<Value> = Option::deserialize(deserializer)?;
  Ok(match value {
    Some(Value::Number(n)) => Some(n.to_string()),
    Some(Value::String(s)) if !s.is_empty() => Some(s),
    _ => None,
  })
}

// ============================================================================
// Records
// ============================================================================

/// Any work item record (story, defect, task, test case).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiArtifact {
  #[serde(rename = "FormattedID")]
  pub formatted_id: String,
  #[serde(default)]
  pub name: String,
  #[serde(rename = "ObjectID", default, deserialize_with = "deserialize_object_id")]
  pub object_id: Option<String>,
  #[serde(rename = "_type")]
  pub type_name: Option<String>,
  pub schedule_state: Option<String>,
  pub state: Option<String>,
  pub last_verdict: Option<String>,
  pub owner: Option<ApiRef>,
  pub description: Option<String>,
  pub notes: Option<String>,
  pub iteration: Option<ApiRef>,
  pub plan_estimate: Option<f64>,
  pub estimate: Option<f64>,
  pub portfolio_item: Option<ApiRef>,
  pub parent: Option<ApiRef>,
  pub work_product: Option<ApiRef>,
  pub requirement: Option<ApiRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiUser {
  #[serde(rename = "ObjectID", default, deserialize_with = "deserialize_object_id")]
  pub object_id: Option<String>,
  pub display_name: Option<String>,
  #[serde(default)]
  pub user_name: String,
  pub user_profile: Option<ApiRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiUserProfile {
  pub default_workspace: Option<ApiRef>,
  pub default_project: Option<ApiRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiProject {
  #[serde(rename = "ObjectID", default, deserialize_with = "deserialize_object_id")]
  pub object_id: Option<String>,
  #[serde(default)]
  pub name: String,
  pub workspace: Option<ApiRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiIteration {
  #[serde(rename = "ObjectID", default, deserialize_with = "deserialize_object_id")]
  pub object_id: Option<String>,
  #[serde(default)]
  pub name: String,
  pub state: Option<String>,
  pub start_date: Option<String>,
  pub end_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiConversationPost {
  #[serde(rename = "ObjectID", default, deserialize_with = "deserialize_object_id")]
  pub object_id: Option<String>,
  pub user: Option<ApiRef>,
  #[serde(default)]
  pub text: String,
  pub creation_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiAttachment {
  #[serde(rename = "ObjectID", default, deserialize_with = "deserialize_object_id")]
  pub object_id: Option<String>,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub size: u64,
  pub content_type: Option<String>,
  pub content: Option<ApiRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiAttachmentContent {
  #[serde(default)]
  pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiTag {
  #[serde(rename = "ObjectID", default, deserialize_with = "deserialize_object_id")]
  pub object_id: Option<String>,
  #[serde(default)]
  pub name: String,
}

// ============================================================================
// Conversions to domain types
// ============================================================================

impl ApiArtifact {
  /// Convert to a domain ticket. Returns `None` when the type cannot be told
  /// from either the formatted id or the `_type` field.
  pub fn into_ticket(self) -> Option<Ticket> {
    let ticket_type = TicketType::from_formatted_id(&self.formatted_id)
      .or_else(|| self.type_name.as_deref().and_then(type_from_name))?;

    let state = match ticket_type {
      TicketType::Story | TicketType::Defect => self.schedule_state.or(self.state),
      TicketType::Task => self.state.or(self.schedule_state),
      TicketType::TestCase => self.last_verdict.or(self.state),
    };
    let points = match ticket_type {
      TicketType::Task => self.estimate.or(self.plan_estimate),
      _ => self.plan_estimate,
    };
    let parent_id = [
      self.portfolio_item,
      self.parent,
      self.work_product,
      self.requirement,
    ]
    .into_iter()
    .flatten()
    .find_map(|r| r.formatted_id);

    Some(Ticket {
      formatted_id: self.formatted_id,
      name: self.name,
      ticket_type,
      state: state.unwrap_or_default(),
      owner: self.owner.and_then(|o| o.name),
      description: self.description.unwrap_or_default(),
      notes: self.notes.unwrap_or_default(),
      iteration: self.iteration.and_then(|i| i.name),
      points,
      object_id: self.object_id,
      parent_id,
    })
  }
}

fn type_from_name(name: &str) -> Option<TicketType> {
  match name.to_ascii_lowercase().as_str() {
    "hierarchicalrequirement" | "userstory" => Some(TicketType::Story),
    "defect" => Some(TicketType::Defect),
    "task" => Some(TicketType::Task),
    "testcase" => Some(TicketType::TestCase),
    _ => None,
  }
}

impl ApiUser {
  pub fn into_owner(self) -> Option<Owner> {
    Some(Owner {
      object_id: self.object_id?,
      display_name: self
        .display_name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| self.user_name.clone()),
      user_name: self.user_name,
    })
  }
}

impl ApiIteration {
  pub fn into_iteration(self) -> Option<Iteration> {
    Some(Iteration {
      object_id: self.object_id?,
      name: self.name,
      state: self.state,
      start_date: self.start_date.as_deref().and_then(parse_date),
      end_date: self.end_date.as_deref().and_then(parse_date),
    })
  }
}

impl ApiConversationPost {
  pub fn into_discussion(self) -> Option<Discussion> {
    Some(Discussion {
      object_id: self.object_id?,
      author: self.user.and_then(|u| u.name).unwrap_or_default(),
      text: self.text,
      created_at: self.creation_date.as_deref().and_then(parse_timestamp),
    })
  }
}

impl ApiAttachment {
  pub fn into_attachment(self) -> Option<Attachment> {
    Some(Attachment {
      object_id: self.object_id?,
      name: self.name,
      size: self.size,
      content_type: self.content_type.unwrap_or_default(),
    })
  }
}

impl ApiTag {
  pub fn into_tag(self) -> Option<Tag> {
    Some(Tag {
      object_id: self.object_id?,
      name: self.name,
    })
  }
}

// ============================================================================
// Helpers
// ============================================================================

/// Deserialize every record that parses and maps; skip the rest.
pub fn map_records<R, T>(records: Vec<Value>, convert: impl Fn(R) -> Option<T>) -> Vec<T>
where
  R: serde::de::DeserializeOwned,
{
  records
    .into_iter()
    .filter_map(|record| match serde_json::from_value::<R>(record) {
      Ok(parsed) => convert(parsed),
      Err(e) => {
        debug!("Skipping malformed record: {}", e);
        None
      }
    })
    .collect()
}

/// Unwrap a single-object response such as `{"User": {...}}`.
pub fn unwrap_single(value: Value) -> ApiResult<Value> {
  let Value::Object(map) = value else {
    return Err(ApiError::decode("Expected a JSON object"));
  };

  if let Some(result) = map.get("OperationResult") {
    let errors: Vec<String> = result
      .get("Errors")
      .cloned()
      .map(serde_json::from_value)
      .transpose()?
      .unwrap_or_default();
    check_errors(&errors)?;
  }

  map
    .into_iter()
    .find(|(key, v)| !key.starts_with('_') && key != "OperationResult" && v.is_object())
    .map(|(_, v)| v)
    .ok_or_else(|| ApiError::decode("Response did not contain an object"))
}

/// Turn a WSAPI `Errors` array into an error.
pub fn check_errors(errors: &[String]) -> ApiResult<()> {
  if errors.is_empty() {
    return Ok(());
  }
  let message = errors.join("; ");
  let lower = message.to_lowercase();
  if super::error::is_auth_message(&message) || lower.contains("not authorized") {
    Err(ApiError::auth(message))
  } else if lower.contains("cannot find") || lower.contains("not found") {
    Err(ApiError::not_found(message))
  } else {
    Err(ApiError::validation(message))
  }
}

/// Reduce a `_ref` URL to its object path, e.g. `/workspace/123`.
pub fn ref_path(ref_url: &str) -> Option<String> {
  let path = match url::Url::parse(ref_url) {
    Ok(url) => url.path().to_string(),
    Err(_) => ref_url.to_string(),
  };
  let path = match path.find(API_VERSION_SEGMENT) {
    Some(idx) => path[idx + API_VERSION_SEGMENT.len()..].to_string(),
    None => path,
  };
  let path = path.trim_end_matches(".js");
  if path.starts_with('/') && path.len() > 1 {
    Some(path.to_string())
  } else {
    None
  }
}

/// Object path for an endpoint and object id.
pub fn object_ref(endpoint: &str, object_id: &str) -> String {
  format!("/{}/{}", endpoint, object_id)
}

fn parse_date(s: &str) -> Option<NaiveDate> {
  s.get(..10)
    .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}
