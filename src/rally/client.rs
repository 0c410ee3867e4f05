//! Rally WSAPI client.
//!
//! Every request goes through one [`RetryPolicy`] and acquires a permit from a
//! shared semaphore before it is sent, so the number of in-flight requests
//! never exceeds `api.max_concurrent_requests` across all callers.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::future::join_all;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{Config, RallyConfig};

use super::api::RallyApi;
use super::api_types::{
  check_errors, map_records, object_ref, ref_path, unwrap_single, ApiArtifact, ApiAttachment,
  ApiAttachmentContent, ApiConversationPost, ApiIteration, ApiProject, ApiQueryResult, ApiRef,
  ApiTag, ApiUser, ApiUserProfile, CreateEnvelope, OperationEnvelope, QueryEnvelope,
};
use super::error::{ApiError, ApiResult, ErrorKind};
use super::query::{and_all, default_query, Condition, Op};
use super::retry::RetryPolicy;
use super::types::{
  parent_endpoint, Attachment, Discussion, Iteration, NewTicket, Owner, Tag, Ticket, TicketType,
};

/// Path of the WSAPI below the server URL.
pub const API_PATH: &str = "/slm/webservice/v2.0";

const TICKET_FETCH: &str = "FormattedID,Name,ObjectID,ScheduleState,State,LastVerdict,Owner,\
Description,Notes,Iteration,PlanEstimate,Estimate,PortfolioItem,Parent,WorkProduct,Requirement";
const ITERATION_FETCH: &str = "ObjectID,Name,State,StartDate,EndDate";
const USER_FETCH: &str = "ObjectID,DisplayName,UserName,UserProfile";

/// Workspace/project the client is scoped to.
#[derive(Debug, Clone, Default)]
pub struct Scope {
  pub workspace: String,
  pub project: String,
  /// Object path such as `/workspace/123`
  pub workspace_ref: Option<String>,
  pub project_ref: Option<String>,
}

/// Rally API client
#[derive(Clone)]
pub struct RallyClient {
  http: reqwest::Client,
  api_base: String,
  limiter: Arc<Semaphore>,
  retry: RetryPolicy,
  page_size: usize,
  max_results: usize,
  scope: Scope,
  current_user: Option<Owner>,
  current_iteration: Option<Iteration>,
}

impl RallyClient {
  /// Build a client without contacting the server.
  pub fn new(config: &Config, api_key: &str) -> ApiResult<Self> {
    let mut key = HeaderValue::from_str(api_key)
      .map_err(|e| ApiError::validation(format!("Invalid API key header value: {}", e)))?;
    key.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert("ZSESSIONID", key);
    headers.insert("X-RallyIntegrationName", HeaderValue::from_static("r9s"));

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(config.api.request_timeout())
      .build()
      .map_err(|e| ApiError::transport(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      http,
      api_base: format!("{}{}", config.rally.server.trim_end_matches('/'), API_PATH),
      limiter: Arc::new(Semaphore::new(config.api.max_concurrent_requests.max(1))),
      retry: RetryPolicy::default(),
      page_size: config.api.page_size.max(1),
      max_results: config.api.max_results.max(1),
      scope: Scope {
        workspace: config.rally.workspace.clone().unwrap_or_default(),
        project: config.rally.project.clone().unwrap_or_default(),
        ..Scope::default()
      },
      current_user: None,
      current_iteration: None,
    })
  }

  /// Build a client and resolve scope, current user and current iteration.
  pub async fn connect(config: &Config, api_key: &str) -> ApiResult<Self> {
    let mut client = Self::new(config, api_key)?;
    client.initialize(&config.rally).await;
    Ok(client)
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn scope(&self) -> &Scope {
    &self.scope
  }

  pub fn current_owner(&self) -> Option<&Owner> {
    self.current_user.as_ref()
  }

  pub fn current_iteration_details(&self) -> Option<&Iteration> {
    self.current_iteration.as_ref()
  }

  /// Resolve workspace/project, then the current user and iteration in
  /// parallel. Lookups that fail leave the value unset.
  pub async fn initialize(&mut self, rally: &RallyConfig) {
    self.resolve_scope(rally).await;

    let (user, iteration) = tokio::join!(self.fetch_current_user(), self.fetch_current_iteration());

    self.current_user = user.unwrap_or_else(|e| {
      warn!("Failed to resolve current user: {}", e);
      None
    });
    self.current_iteration = iteration.unwrap_or_else(|e| {
      warn!("Failed to resolve current iteration: {}", e);
      None
    });

    info!(
      "Connected to Rally: workspace={:?} project={:?} user={:?} iteration={:?}",
      self.scope.workspace,
      self.scope.project,
      self.current_user(),
      self.current_iteration()
    );
  }

  async fn resolve_scope(&mut self, rally: &RallyConfig) {
    if rally.workspace.is_none() || rally.project.is_none() {
      match self.fetch_profile_defaults().await {
        Ok((workspace, project)) => {
          if rally.workspace.is_none() {
            if let Some(ws) = workspace {
              self.scope.workspace = ws.name.unwrap_or_default();
              self.scope.workspace_ref = ws.ref_url.as_deref().and_then(ref_path);
            }
          }
          if rally.project.is_none() {
            if let Some(proj) = project {
              self.scope.project = proj.name.unwrap_or_default();
              self.scope.project_ref = proj.ref_url.as_deref().and_then(ref_path);
            }
          }
        }
        Err(e) => warn!("Failed to load default workspace/project: {}", e),
      }
    }

    if let Some(project) = &rally.project {
      match self.find_project(project).await {
        Ok(Some(found)) => {
          self.scope.project_ref = found.object_id.as_deref().map(|oid| object_ref("project", oid));
          if self.scope.workspace_ref.is_none() {
            self.scope.workspace_ref = found
              .workspace
              .and_then(|ws| ws.ref_url)
              .as_deref()
              .and_then(ref_path);
          }
        }
        Ok(None) => warn!("Project not found: {}", project),
        Err(e) => warn!("Failed to resolve project {}: {}", project, e),
      }
    }
  }

  async fn fetch_profile_defaults(&self) -> ApiResult<(Option<ApiRef>, Option<ApiRef>)> {
    let user: ApiUser = serde_json::from_value(unwrap_single(
      self.get_json("get user", "/user", &[("fetch", USER_FETCH.to_string())]).await?,
    )?)?;

    let profile_path = user
      .user_profile
      .and_then(|p| p.ref_url)
      .as_deref()
      .and_then(ref_path)
      .ok_or_else(|| ApiError::not_found("User has no profile"))?;

    let profile: ApiUserProfile = serde_json::from_value(unwrap_single(
      self
        .get_json(
          "get user profile",
          &profile_path,
          &[("fetch", "DefaultWorkspace,DefaultProject".to_string())],
        )
        .await?,
    )?)?;

    Ok((profile.default_workspace, profile.default_project))
  }

  async fn find_project(&self, name: &str) -> ApiResult<Option<ApiProject>> {
    let page = self
      .query_page(
        "project",
        Some(&Condition::eq("Name", name).to_string()),
        "ObjectID,Name,Workspace",
        None,
        1,
        1,
      )
      .await?;
    Ok(map_records(page.results, Some).into_iter().next())
  }

  async fn fetch_current_user(&self) -> ApiResult<Option<Owner>> {
    let value = self
      .get_json("get current user", "/user", &[("fetch", USER_FETCH.to_string())])
      .await?;
    let user: ApiUser = serde_json::from_value(unwrap_single(value)?)?;
    Ok(user.into_owner())
  }

  async fn fetch_current_iteration(&self) -> ApiResult<Option<Iteration>> {
    let today = chrono::Local::now().date_naive();
    let day = today.format("%Y-%m-%d").to_string();
    let query = and_all([
      Condition::new("StartDate", Op::Lte, day.clone()).to_string(),
      Condition::new("EndDate", Op::Gte, day).to_string(),
    ]);

    let page = self
      .query_page(
        "iteration",
        query.as_deref(),
        ITERATION_FETCH,
        Some("StartDate desc"),
        1,
        5,
      )
      .await?;
    let iterations = map_records(page.results, ApiIteration::into_iteration);

    // Prefer one whose dates we can verify; fall back to what the server says
    let current = iterations
      .iter()
      .find(|i| i.contains(today))
      .cloned()
      .or_else(|| iterations.into_iter().next());
    Ok(current)
  }

  fn default_query(&self) -> Option<String> {
    default_query(self.current_iteration(), self.current_user())
  }

  fn scope_params(&self) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(workspace) = &self.scope.workspace_ref {
      params.push(("workspace", workspace.clone()));
    }
    if let Some(project) = &self.scope.project_ref {
      params.push(("project", project.clone()));
    }
    params
  }

  // ==========================================================================
  // Request plumbing
  // ==========================================================================

  /// Send one request with retries; each attempt holds a limiter permit.
  async fn send(
    &self,
    what: &str,
    method: Method,
    path: &str,
    params: &[(&str, String)],
    body: Option<&Value>,
  ) -> ApiResult<Value> {
    let url = format!("{}{}", self.api_base, path);
    let (url, method) = (&url, &method);

    self
      .retry
      .run(what, || async move {
        let _permit = self
          .limiter
          .acquire()
          .await
          .map_err(|_| ApiError::transport("Request limiter closed"))?;

        debug!("{} {}", method, url);
        let mut request = self.http.request(method.clone(), url).query(params);
        if let Some(body) = body {
          request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
          return Err(ApiError::from_status(status, &text));
        }
        Ok(serde_json::from_str::<Value>(&text)?)
      })
      .await
  }

  async fn get_json(&self, what: &str, path: &str, params: &[(&str, String)]) -> ApiResult<Value> {
    self.send(what, Method::GET, path, params, None).await
  }

  async fn query_page(
    &self,
    endpoint: &str,
    query: Option<&str>,
    fetch: &str,
    order: Option<&str>,
    start: usize,
    page_size: usize,
  ) -> ApiResult<ApiQueryResult> {
    let mut params = self.scope_params();
    if let Some(query) = query {
      params.push(("query", query.to_string()));
    }
    params.push(("fetch", fetch.to_string()));
    if let Some(order) = order {
      params.push(("order", order.to_string()));
    }
    params.push(("start", start.to_string()));
    params.push(("pagesize", page_size.to_string()));

    let value = self
      .get_json(&format!("query {}", endpoint), &format!("/{}", endpoint), &params)
      .await?;
    let envelope: QueryEnvelope = serde_json::from_value(value)?;
    check_errors(&envelope.query_result.errors)?;
    for warning in &envelope.query_result.warnings {
      debug!("Rally warning for {}: {}", endpoint, warning);
    }
    Ok(envelope.query_result)
  }

  /// Page through a query until the server runs out or `limit` is reached.
  async fn query_all(
    &self,
    endpoint: &str,
    query: Option<&str>,
    fetch: &str,
    order: Option<&str>,
    limit: usize,
  ) -> ApiResult<Vec<Value>> {
    let page_size = self.page_size.min(limit).max(1);
    let mut records = Vec::new();
    let mut start = 1;

    loop {
      let page = self
        .query_page(endpoint, query, fetch, order, start, page_size)
        .await?;
      let count = page.results.len();
      let total = page.total_result_count as usize;
      records.extend(page.results);

      if count == 0 || records.len() >= total || records.len() >= limit {
        break;
      }
      start += count;
    }

    records.truncate(limit);
    Ok(records)
  }

  /// POST field changes to an existing object.
  async fn post_update(
    &self,
    endpoint: &str,
    object_id: &str,
    type_name: &str,
    fields: Value,
  ) -> ApiResult<Option<Value>> {
    let body = json!({ type_name: fields });
    let value = self
      .send(
        &format!("update {}", endpoint),
        Method::POST,
        &object_ref(endpoint, object_id),
        &[],
        Some(&body),
      )
      .await?;
    let envelope: OperationEnvelope = serde_json::from_value(value)?;
    check_errors(&envelope.operation_result.errors)?;
    Ok(envelope.operation_result.object)
  }

  async fn post_create(&self, endpoint: &str, type_name: &str, fields: Value) -> ApiResult<Value> {
    let body = json!({ type_name: fields });
    let value = self
      .send(
        &format!("create {}", endpoint),
        Method::POST,
        &format!("/{}/create", endpoint),
        &self.scope_params(),
        Some(&body),
      )
      .await?;
    let envelope: CreateEnvelope = serde_json::from_value(value)?;
    check_errors(&envelope.create_result.errors)?;
    envelope
      .create_result
      .object
      .ok_or_else(|| ApiError::decode(format!("Create {} returned no object", endpoint)))
  }

  // ==========================================================================
  // Ticket helpers
  // ==========================================================================

  async fn fetch_kind(&self, kind: TicketType, query: Option<&str>) -> ApiResult<Vec<Ticket>> {
    let records = self
      .query_all(
        kind.endpoint(),
        query,
        TICKET_FETCH,
        Some("FormattedID"),
        self.max_results,
      )
      .await?;
    Ok(map_records(records, ApiArtifact::into_ticket))
  }

  /// Object id of the entity with `formatted_id` at `endpoint`.
  async fn lookup_object_id(&self, endpoint: &str, formatted_id: &str) -> ApiResult<Option<String>> {
    let query = Condition::eq("FormattedID", formatted_id).to_string();
    let page = self
      .query_page(endpoint, Some(&query), "FormattedID,ObjectID", None, 1, 1)
      .await?;
    Ok(
      map_records(page.results, |r: ApiRef| r.object_id)
        .into_iter()
        .next(),
    )
  }

  /// Apply `fields` to a ticket. `false` when the ticket cannot be mutated.
  async fn update_fields(&self, ticket: &Ticket, action: &str, fields: Value) -> ApiResult<bool> {
    let Some(object_id) = ticket.object_id.as_deref() else {
      warn!("Cannot {} {}: no object id", action, ticket.formatted_id);
      return Ok(false);
    };
    let kind = ticket.ticket_type;
    self
      .post_update(kind.endpoint(), object_id, kind.type_name(), fields)
      .await?;
    debug!("{} {}", action, ticket.formatted_id);
    Ok(true)
  }

  async fn edit_tags(&self, ticket: &Ticket, tag: &Tag, op: &str) -> ApiResult<bool> {
    let Some(object_id) = ticket.object_id.as_deref() else {
      warn!("Cannot {} tag on {}: no object id", op, ticket.formatted_id);
      return Ok(false);
    };
    let path = format!(
      "{}/tags/{}",
      object_ref(ticket.ticket_type.endpoint(), object_id),
      op
    );
    let body = json!({ "CollectionItems": [{ "_ref": object_ref("tag", &tag.object_id) }] });
    let value = self
      .send(&format!("{} tag", op), Method::POST, &path, &[], Some(&body))
      .await?;
    let envelope: OperationEnvelope = serde_json::from_value(value)?;
    check_errors(&envelope.operation_result.errors)?;
    Ok(true)
  }
}

#[async_trait]
impl RallyApi for RallyClient {
  fn workspace(&self) -> &str {
    &self.scope.workspace
  }

  fn project(&self) -> &str {
    &self.scope.project
  }

  fn current_user(&self) -> Option<&str> {
    self.current_user.as_ref().map(|u| u.display_name.as_str())
  }

  fn current_iteration(&self) -> Option<&str> {
    self.current_iteration.as_ref().map(|i| i.name.as_str())
  }

  async fn get_tickets(&self, query: Option<&str>) -> ApiResult<Vec<Ticket>> {
    let query = match query.filter(|q| !q.trim().is_empty()) {
      Some(q) => Some(q.to_string()),
      None => self.default_query(),
    };
    let query = query.as_deref();
    debug!("Fetching tickets with query {:?}", query);

    let results = join_all(TicketType::LISTED.map(|kind| self.fetch_kind(kind, query))).await;

    let mut tickets = Vec::new();
    let mut last_error = None;
    let mut succeeded = 0;
    for (kind, result) in TicketType::LISTED.iter().zip(results) {
      match result {
        Ok(batch) => {
          succeeded += 1;
          tickets.extend(batch);
        }
        Err(e) => {
          warn!("Failed to fetch {:?} tickets: {}", kind, e);
          last_error = Some(e);
        }
      }
    }

    match last_error {
      Some(e) if succeeded == 0 => Err(e),
      _ => Ok(tickets),
    }
  }

  async fn get_ticket(&self, formatted_id: &str) -> ApiResult<Option<Ticket>> {
    let Some(kind) = TicketType::from_formatted_id(formatted_id) else {
      debug!("Unknown ticket prefix: {}", formatted_id);
      return Ok(None);
    };
    let query = Condition::eq("FormattedID", formatted_id.trim()).to_string();
    let page = self
      .query_page(kind.endpoint(), Some(&query), TICKET_FETCH, None, 1, 1)
      .await?;
    Ok(
      map_records(page.results, ApiArtifact::into_ticket)
        .into_iter()
        .next(),
    )
  }

  async fn get_discussions(&self, ticket: &Ticket) -> ApiResult<Vec<Discussion>> {
    let query = Condition::eq("Artifact.FormattedID", &ticket.formatted_id).to_string();
    let records = self
      .query_all(
        "conversationpost",
        Some(&query),
        "ObjectID,User,Text,CreationDate",
        Some("CreationDate"),
        self.max_results,
      )
      .await?;
    Ok(map_records(records, ApiConversationPost::into_discussion))
  }

  async fn add_comment(&self, ticket: &Ticket, text: &str) -> ApiResult<Option<Discussion>> {
    let Some(object_id) = ticket.object_id.as_deref() else {
      warn!("Cannot comment on {}: no object id", ticket.formatted_id);
      return Ok(None);
    };
    let fields = json!({
      "Artifact": object_ref(ticket.ticket_type.endpoint(), object_id),
      "Text": text,
    });
    let object = self
      .post_create("conversationpost", "ConversationPost", fields)
      .await?;
    let post: ApiConversationPost = serde_json::from_value(object)?;
    Ok(post.into_discussion())
  }

  async fn update_points(&self, ticket: &Ticket, points: f64) -> ApiResult<Option<Ticket>> {
    let fields = json!({ ticket.ticket_type.points_field(): points });
    let updated = self.update_fields(ticket, "update points of", fields).await?;
    Ok(updated.then(|| ticket.with_points(Some(points))))
  }

  async fn update_state(&self, ticket: &Ticket, state: &str) -> ApiResult<Option<Ticket>> {
    let fields = json!({ ticket.ticket_type.state_field(): state });
    let updated = self.update_fields(ticket, "update state of", fields).await?;
    Ok(updated.then(|| ticket.with_state(state)))
  }

  async fn set_parent(&self, ticket: &Ticket, parent_id: &str) -> ApiResult<Option<Ticket>> {
    let parent_id = parent_id.trim().to_ascii_uppercase();
    let (Some(field), Some(endpoint)) = (
      ticket.ticket_type.parent_field(&parent_id),
      parent_endpoint(&parent_id),
    ) else {
      warn!("{} cannot be a parent of {}", parent_id, ticket.formatted_id);
      return Ok(None);
    };
    if ticket.object_id.is_none() {
      warn!("Cannot set parent of {}: no object id", ticket.formatted_id);
      return Ok(None);
    }

    let Some(parent_oid) = self.lookup_object_id(endpoint, &parent_id).await? else {
      warn!("Parent not found: {}", parent_id);
      return Ok(None);
    };

    let fields = json!({ field: object_ref(endpoint, &parent_oid) });
    let updated = self.update_fields(ticket, "set parent of", fields).await?;
    Ok(updated.then(|| ticket.with_parent(Some(parent_id))))
  }

  async fn assign_owner(&self, ticket: &Ticket, owner: &Owner) -> ApiResult<Option<Ticket>> {
    let fields = json!({ "Owner": object_ref("user", &owner.object_id) });
    let updated = self.update_fields(ticket, "assign owner of", fields).await?;
    Ok(updated.then(|| ticket.with_owner(Some(owner.display_name.clone()))))
  }

  async fn assign_iteration(
    &self,
    ticket: &Ticket,
    iteration: Option<&Iteration>,
  ) -> ApiResult<Option<Ticket>> {
    let iteration_ref = match iteration {
      Some(i) => Value::String(object_ref("iteration", &i.object_id)),
      None => Value::Null,
    };
    let fields = json!({ "Iteration": iteration_ref });
    let updated = self
      .update_fields(ticket, "set iteration of", fields)
      .await?;
    Ok(updated.then(|| ticket.with_iteration(iteration.map(|i| i.name.clone()))))
  }

  async fn create_ticket(&self, new_ticket: &NewTicket) -> ApiResult<Option<Ticket>> {
    let kind = new_ticket.ticket_type;
    let mut fields = json!({
      "Name": new_ticket.name,
      "Description": new_ticket.description,
    });

    if let Some(points) = new_ticket.points {
      fields[kind.points_field()] = json!(points);
    }
    if let Some(name) = &new_ticket.iteration {
      match self.find_iteration(name).await? {
        Some(iteration) => fields["Iteration"] = json!(object_ref("iteration", &iteration.object_id)),
        None => {
          warn!("Cannot create ticket: iteration not found: {}", name);
          return Ok(None);
        }
      }
    }
    if new_ticket.assign_to_me {
      if let Some(user) = &self.current_user {
        fields["Owner"] = json!(object_ref("user", &user.object_id));
      }
    }
    if let Some(project) = &self.scope.project_ref {
      fields["Project"] = json!(project);
    }

    let object = self.post_create(kind.endpoint(), kind.type_name(), fields).await?;
    let artifact: ApiArtifact = serde_json::from_value(object)?;
    let ticket = artifact.into_ticket();
    if let Some(ticket) = &ticket {
      info!("Created {}", ticket.formatted_id);
    }
    Ok(ticket)
  }

  async fn get_iterations(&self, count: usize) -> ApiResult<Vec<Iteration>> {
    let records = self
      .query_all(
        "iteration",
        None,
        ITERATION_FETCH,
        Some("StartDate desc"),
        count.max(1),
      )
      .await?;
    Ok(map_records(records, ApiIteration::into_iteration))
  }

  async fn find_iteration(&self, name: &str) -> ApiResult<Option<Iteration>> {
    let query = Condition::eq("Name", name).to_string();
    let page = self
      .query_page("iteration", Some(&query), ITERATION_FETCH, None, 1, 1)
      .await?;
    Ok(
      map_records(page.results, ApiIteration::into_iteration)
        .into_iter()
        .next(),
    )
  }

  async fn find_user(&self, display_name: &str) -> ApiResult<Option<Owner>> {
    let query = Condition::eq("DisplayName", display_name).to_string();
    let page = self
      .query_page("user", Some(&query), USER_FETCH, None, 1, 1)
      .await?;
    Ok(map_records(page.results, ApiUser::into_owner).into_iter().next())
  }

  async fn get_tags(&self) -> ApiResult<Vec<Tag>> {
    let records = self
      .query_all("tag", None, "ObjectID,Name", Some("Name"), self.max_results)
      .await?;
    Ok(map_records(records, ApiTag::into_tag))
  }

  async fn create_tag(&self, name: &str) -> ApiResult<Option<Tag>> {
    let object = self.post_create("tag", "Tag", json!({ "Name": name })).await?;
    let tag: ApiTag = serde_json::from_value(object)?;
    Ok(tag.into_tag())
  }

  async fn add_tag(&self, ticket: &Ticket, tag: &Tag) -> ApiResult<bool> {
    self.edit_tags(ticket, tag, "add").await
  }

  async fn remove_tag(&self, ticket: &Ticket, tag: &Tag) -> ApiResult<bool> {
    self.edit_tags(ticket, tag, "remove").await
  }

  async fn get_attachments(&self, ticket: &Ticket) -> ApiResult<Vec<Attachment>> {
    let query = Condition::eq("Artifact.FormattedID", &ticket.formatted_id).to_string();
    let records = self
      .query_all(
        "attachment",
        Some(&query),
        "ObjectID,Name,Size,ContentType",
        Some("Name"),
        self.max_results,
      )
      .await?;
    Ok(map_records(records, ApiAttachment::into_attachment))
  }

  async fn download_attachment(&self, attachment: &Attachment) -> ApiResult<Option<Vec<u8>>> {
    let value = match self
      .get_json(
        "get attachment",
        &object_ref("attachment", &attachment.object_id),
        &[("fetch", "ObjectID,Name,Content".to_string())],
      )
      .await
      .and_then(unwrap_single)
    {
      Ok(value) => value,
      Err(e) if e.kind == ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(e),
    };
    let record: ApiAttachment = serde_json::from_value(value)?;

    let Some(content_path) = record
      .content
      .and_then(|c| c.ref_url)
      .as_deref()
      .and_then(ref_path)
    else {
      warn!("Attachment {} has no content", attachment.name);
      return Ok(None);
    };

    let value = self
      .get_json("get attachment content", &content_path, &[("fetch", "Content".to_string())])
      .await?;
    let content: ApiAttachmentContent = serde_json::from_value(unwrap_single(value)?)?;
    let bytes = BASE64
      .decode(content.content.trim())
      .map_err(|e| ApiError::decode(format!("Invalid attachment content: {}", e)))?;
    Ok(Some(bytes))
  }

  async fn upload_attachment(
    &self,
    ticket: &Ticket,
    file_name: &str,
    content_type: &str,
    content: &[u8],
  ) -> ApiResult<Option<Attachment>> {
    let Some(object_id) = ticket.object_id.as_deref() else {
      warn!("Cannot attach to {}: no object id", ticket.formatted_id);
      return Ok(None);
    };

    let stored = self
      .post_create(
        "attachmentcontent",
        "AttachmentContent",
        json!({ "Content": BASE64.encode(content) }),
      )
      .await?;
    let stored: ApiRef = serde_json::from_value(stored)?;
    let Some(content_oid) = stored.object_id else {
      return Err(ApiError::decode("Attachment content has no object id"));
    };

    let fields = json!({
      "Artifact": object_ref(ticket.ticket_type.endpoint(), object_id),
      "Content": object_ref("attachmentcontent", &content_oid),
      "Name": file_name,
      "ContentType": content_type,
      "Size": content.len(),
    });
    let object = self.post_create("attachment", "Attachment", fields).await?;
    let attachment: ApiAttachment = serde_json::from_value(object)?;
    Ok(attachment.into_attachment())
  }
}
