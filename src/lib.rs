//! Blackbox: embedded, crash-durable audit trail with write-behind batching
//!
//! # Overview
//!
//! Blackbox records every security-relevant mutation in a multi-tenant
//! diagram service (who did what, to which resource, when) without ever
//! blocking the request path. Producers fire immutable entries at the
//! engine; a background persister batches them into single SQLite
//! transactions; compliance tooling queries the durable history through
//! indexed, parameterized filters.
//!
//! # Features
//!
//! - **Fire-and-forget recording**: `record()` is synchronous, infallible,
//!   and touches only in-memory structures
//! - **Write-behind batching**: a background task drains the write queue in
//!   all-or-nothing transactions
//! - **Bounded memory**: a fixed-capacity hot cache answers recent-activity
//!   queries without touching disk
//! - **Crash durability**: entries survive restarts; the cache re-hydrates
//!   from the newest durable rows on startup
//! - **Retention sweeping**: rows past a configurable horizon are deleted
//!   periodically
//!
//! # Example
//!
//! ```no_run
//! use blackbox::{AuditAction, AuditDetails, AuditEngine, AuditEvent, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> blackbox::Result<()> {
//!     let engine = AuditEngine::open("audit.db", EngineConfig::default()).await?;
//!
//!     // Request handlers record without awaiting or error handling
//!     engine.record(
//!         AuditEvent::new(AuditAction::DiagramUpdate, "dgm-42")
//!             .with_actor("user-7")
//!             .with_role("editor")
//!             .with_details(AuditDetails::new().with("field", "title"))
//!             .with_ip_address("203.0.113.9"),
//!     );
//!
//!     // Tooling can force a flush and inspect the durable history
//!     let written = engine.flush_now().await?;
//!     println!("persisted {} entries", written);
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub mod backends;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod query;
pub mod queue;

pub use backends::sqlite::SqliteAuditStore;
pub use config::EngineConfig;
pub use engine::{AuditEngine, EngineStats};
pub use error::{AuditError, Result};
pub use query::{ActorSelector, AuditQuery};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum serialized size of a `details` payload, in bytes
///
/// Oversized payloads are dropped at record time (with a warning) so rows
/// stay bounded and recording stays infallible.
pub const MAX_DETAILS_BYTES: usize = 4096;

/// The closed set of auditable actions
///
/// Wire names are the dotted `resource.verb` identifiers used by the rest of
/// the service. The set is closed on purpose: every action has an explicit
/// resource type (see [`AuditAction::resource_type`]) and unknown strings
/// fail to parse rather than falling through to a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "diagram.create")]
    DiagramCreate,
    #[serde(rename = "diagram.update")]
    DiagramUpdate,
    #[serde(rename = "diagram.delete")]
    DiagramDelete,
    #[serde(rename = "diagram.restore")]
    DiagramRestore,
    #[serde(rename = "diagram.export")]
    DiagramExport,
    #[serde(rename = "visibility.change")]
    VisibilityChange,
    #[serde(rename = "share.create")]
    ShareCreate,
    #[serde(rename = "share.update")]
    ShareUpdate,
    #[serde(rename = "share.revoke")]
    ShareRevoke,
    #[serde(rename = "ownership.transfer")]
    OwnershipTransfer,
}

/// Kind of resource an action mutates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Diagram,
    Share,
    Ownership,
}

impl AuditAction {
    /// The resource type this action mutates
    ///
    /// Total over the enum; `VisibilityChange` toggles a diagram-level
    /// attribute and maps to `Diagram`.
    pub fn resource_type(&self) -> ResourceType {
        match self {
            AuditAction::DiagramCreate
            | AuditAction::DiagramUpdate
            | AuditAction::DiagramDelete
            | AuditAction::DiagramRestore
            | AuditAction::DiagramExport
            | AuditAction::VisibilityChange => ResourceType::Diagram,
            AuditAction::ShareCreate | AuditAction::ShareUpdate | AuditAction::ShareRevoke => {
                ResourceType::Share
            }
            AuditAction::OwnershipTransfer => ResourceType::Ownership,
        }
    }

    /// All actions, in declaration order
    pub const ALL: [AuditAction; 10] = [
        AuditAction::DiagramCreate,
        AuditAction::DiagramUpdate,
        AuditAction::DiagramDelete,
        AuditAction::DiagramRestore,
        AuditAction::DiagramExport,
        AuditAction::VisibilityChange,
        AuditAction::ShareCreate,
        AuditAction::ShareUpdate,
        AuditAction::ShareRevoke,
        AuditAction::OwnershipTransfer,
    ];

    /// The dotted wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::DiagramCreate => "diagram.create",
            AuditAction::DiagramUpdate => "diagram.update",
            AuditAction::DiagramDelete => "diagram.delete",
            AuditAction::DiagramRestore => "diagram.restore",
            AuditAction::DiagramExport => "diagram.export",
            AuditAction::VisibilityChange => "visibility.change",
            AuditAction::ShareCreate => "share.create",
            AuditAction::ShareUpdate => "share.update",
            AuditAction::ShareRevoke => "share.revoke",
            AuditAction::OwnershipTransfer => "ownership.transfer",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditAction {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        AuditAction::ALL
            .iter()
            .find(|a| a.as_str() == s)
            .copied()
            .ok_or_else(|| AuditError::Decode(format!("unknown audit action: {}", s)))
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Diagram => write!(f, "diagram"),
            ResourceType::Share => write!(f, "share"),
            ResourceType::Ownership => write!(f, "ownership"),
        }
    }
}

/// Structured key-value payload attached to an entry
///
/// Backed by a `BTreeMap` so the canonical JSON encoding is deterministic:
/// the same map always serializes to the same string, which makes stored
/// payloads structurally comparable after a round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditDetails(BTreeMap<String, serde_json::Value>);

impl AuditDetails {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key-value pair (builder style)
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize to the canonical JSON encoding
    pub fn to_canonical_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }

    /// Parse a stored canonical JSON blob
    pub fn from_canonical_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

impl FromIterator<(String, serde_json::Value)> for AuditDetails {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One immutable audit record
///
/// Created once by a producer, copied into the hot cache and the write
/// queue, flushed to a durable row, and deleted only by the retention
/// sweeper. The timestamp is an RFC 3339 UTC string with fixed microsecond
/// precision, so lexicographic order equals chronological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// RFC 3339 UTC timestamp, non-decreasing within one process
    pub timestamp: String,

    /// What happened
    pub action: AuditAction,

    /// Who did it; `None` for anonymous actions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,

    /// Role the actor held at the time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_role: Option<String>,

    /// The resource that was mutated
    pub resource_id: String,

    /// Optional bounded payload with action-specific context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<AuditDetails>,

    /// Request origin address, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Request user agent, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl AuditEntry {
    /// Resource type, derived from the action (never stored independently)
    pub fn resource_type(&self) -> ResourceType {
        self.action.resource_type()
    }

    /// Format an instant as a stored timestamp string
    pub fn format_timestamp(at: DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// Producer-side draft of an audit entry
///
/// Carries everything except the timestamp, which the engine assigns at
/// record time so append order and timestamp order agree.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub resource_id: String,
    pub actor_id: Option<String>,
    pub actor_role: Option<String>,
    pub details: Option<AuditDetails>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditEvent {
    /// Create a draft with the required fields
    pub fn new(action: AuditAction, resource_id: impl Into<String>) -> Self {
        Self {
            action,
            resource_id: resource_id.into(),
            actor_id: None,
            actor_role: None,
            details: None,
            ip_address: None,
            user_agent: None,
        }
    }

    /// Set the acting user (omit for anonymous actions)
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Set the role the actor held
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.actor_role = Some(role.into());
        self
    }

    /// Attach a structured payload
    pub fn with_details(mut self, details: AuditDetails) -> Self {
        self.details = Some(details);
        self
    }

    /// Set the request origin address
    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    /// Set the request user agent
    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }
}

/// Aggregate counters over the durable store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_entries: u64,
    pub oldest_entry: Option<String>,
    pub newest_entry: Option<String>,
}

/// Core trait for durable audit storage backends
///
/// Implementations must make `insert_batch` atomic: a batch becomes visible
/// to `query` entirely or not at all, across crashes.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert a batch of entries in one transaction
    async fn insert_batch(&self, entries: &[AuditEntry]) -> Result<()>;

    /// Run a filtered scan, newest first (ties: most recently inserted first)
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>>;

    /// Load the newest `limit` entries, returned oldest-first
    ///
    /// Used to hydrate the hot cache on startup.
    async fn load_recent(&self, limit: usize) -> Result<Vec<AuditEntry>>;

    /// Delete all entries strictly older than `cutoff`, returning the count
    async fn delete_before(&self, cutoff: &str) -> Result<u64>;

    /// Aggregate counters over the whole table
    async fn stats(&self) -> Result<StoreStats>;
}
