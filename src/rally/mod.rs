//! Rally WSAPI access: the [`RallyApi`] interface, the HTTP client, the
//! caching wrapper, and bulk operations built on them.

pub mod api;
mod api_types;
pub mod bulk;
pub mod cached_client;
pub mod client;
pub mod error;
pub mod query;
pub mod retry;
#[cfg(test)]
pub mod testing;
pub mod types;

pub use api::RallyApi;
pub use bulk::BulkResult;
pub use cached_client::CachedRallyClient;
pub use client::RallyClient;
pub use error::{ApiError, ApiResult, ErrorKind};
pub use query::{Condition, Op, QueryBuilder};
pub use retry::RetryPolicy;
pub use types::{Attachment, Discussion, Iteration, NewTicket, Owner, Tag, Ticket, TicketType};
