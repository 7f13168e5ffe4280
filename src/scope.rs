//! Scope routing: which visibility partition a chunk or query belongs to.
//!
//! Pure decision logic, no I/O. Every vector record carries an explicit
//! scope tag — `public` for shared knowledge, `session:<id>` for chunks
//! private to one conversation — so public queries filter exactly instead
//! of relying on the absence of a session tag.

use thiserror::Error;

/// Visibility partition of a chunk or query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Public,
    Session(String),
}

impl Scope {
    /// Route an ingestion or query request: a session id means private
    /// scope, its absence means public.
    pub fn route(session_id: Option<&str>) -> Self {
        match session_id {
            Some(id) => Scope::Session(id.to_string()),
            None => Scope::Public,
        }
    }

    /// The tag stored on every vector record.
    pub fn tag(&self) -> String {
        match self {
            Scope::Public => "public".to_string(),
            Scope::Session(id) => format!("session:{}", id),
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, Scope::Public)
    }
}

/// Violation of the chunk-link exclusivity invariant.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OwnerError {
    #[error("chunk links both a knowledge batch and a conversation scope")]
    BothLinks,
    #[error("chunk links neither a knowledge batch nor a conversation scope")]
    NoLink,
}

/// The owning side of a chunk: exactly one of a knowledge upload batch or
/// a conversation scope. Both-or-neither is unrepresentable here; the
/// fallible constructor is the enforcement point for untyped inputs
/// (rows, request payloads).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOwner {
    Batch(String),
    Session(String),
}

impl ChunkOwner {
    /// Validate a (batch_id, session_id) pair, e.g. decoded from a row.
    pub fn try_from_links(
        batch_id: Option<String>,
        session_id: Option<String>,
    ) -> Result<Self, OwnerError> {
        match (batch_id, session_id) {
            (Some(_), Some(_)) => Err(OwnerError::BothLinks),
            (None, None) => Err(OwnerError::NoLink),
            (Some(b), None) => Ok(ChunkOwner::Batch(b)),
            (None, Some(s)) => Ok(ChunkOwner::Session(s)),
        }
    }

    /// Column values for the relational row.
    pub fn links(&self) -> (Option<&str>, Option<&str>) {
        match self {
            ChunkOwner::Batch(id) => (Some(id.as_str()), None),
            ChunkOwner::Session(id) => (None, Some(id.as_str())),
        }
    }

    /// The scope a chunk with this owner is visible under.
    pub fn scope(&self) -> Scope {
        match self {
            ChunkOwner::Batch(_) => Scope::Public,
            ChunkOwner::Session(id) => Scope::Session(id.clone()),
        }
    }
}
