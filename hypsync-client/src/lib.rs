//! Client-side synchronization engine for the Hypothes.is annotation
//! service.
//!
//! Keeps a local replica of one group's annotations consistent with the
//! service over two transports: the paginated search API for bulk backfill
//! and gap repair, and a websocket subscription for near-real-time
//! create/update/delete events. On top of the replica sits an in-memory
//! index with thread, tag, and address lookups, mutated by a pipeline of
//! stream handlers.
//!
//! Credentials and the group binding are passed in by the caller; nothing
//! in this crate reads the environment.

#![forbid(unsafe_code)]

pub mod annotation;
pub mod api;
pub mod cache;
pub mod error;
pub mod handler;
pub mod index;
mod lock;
pub mod paginate;
pub mod stream;

pub use annotation::{Annotation, Kind};
pub use api::HypApi;
pub use cache::Memoizer;
pub use error::{Error, Result};
pub use handler::{Action, Event, FilterHandler, Pipeline, PrintHandler, SyncHandler};
pub use index::AnnotationIndex;
pub use paginate::{AnnoFetcher, FetchOptions};
pub use stream::{Prefilter, Subscriber};

/// Identity of one synchronization session: credentials, group, domain.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// API bearer token.
    pub api_token: String,
    /// Username the token belongs to.
    pub username: String,
    /// Group to synchronize.
    pub group: String,
    /// Service domain.
    pub domain: String,
}

impl SyncConfig {
    /// Domain used when none is configured.
    pub const DEFAULT_DOMAIN: &str = "hypothes.is";

    /// A session against the default domain.
    pub fn new(
        api_token: impl Into<String>,
        username: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            api_token: api_token.into(),
            username: username.into(),
            group: group.into(),
            domain: Self::DEFAULT_DOMAIN.to_owned(),
        }
    }

    /// Overrides the service domain.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }
}
