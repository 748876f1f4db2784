//! Parameterized filters over the audit history
//!
//! One filter type serves both read paths: the engine applies it in memory
//! over the hot cache snapshot, and the SQLite backend compiles it into a
//! conjunctive (AND-only) indexed scan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AuditAction, AuditEntry};

/// Default result limit when a query does not set one
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// How to filter on the acting user
///
/// Distinct from "no actor filter": a query may explicitly target anonymous
/// entries (`actor_id` absent) without also matching named actors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorSelector {
    /// Match only entries recorded without an actor
    Anonymous,
    /// Match only entries recorded by this actor
    Id(String),
}

/// Filter, ordering, and limit for one audit lookup
///
/// All filters are optional and combine conjunctively. Results are always
/// newest first, ties broken by most recently inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditQuery {
    /// Actor filter; `None` applies no actor constraint
    pub actor: Option<ActorSelector>,

    /// Match a single action
    pub action: Option<AuditAction>,

    /// Match a single resource
    pub resource_id: Option<String>,

    /// Inclusive lower timestamp bound
    pub since: Option<DateTime<Utc>>,

    /// Exclusive upper timestamp bound
    pub until: Option<DateTime<Utc>>,

    /// Maximum results returned
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            actor: None,
            action: None,
            resource_id: None,
            since: None,
            until: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actor(mut self, actor: ActorSelector) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn since(mut self, at: DateTime<Utc>) -> Self {
        self.since = Some(at);
        self
    }

    pub fn until(mut self, at: DateTime<Utc>) -> Self {
        self.until = Some(at);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Whether an entry satisfies every set filter (limit not applied here)
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(selector) = &self.actor {
            let ok = match selector {
                ActorSelector::Anonymous => entry.actor_id.is_none(),
                ActorSelector::Id(id) => entry.actor_id.as_deref() == Some(id.as_str()),
            };
            if !ok {
                return false;
            }
        }
        if let Some(action) = self.action {
            if entry.action != action {
                return false;
            }
        }
        if let Some(resource_id) = &self.resource_id {
            if &entry.resource_id != resource_id {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < AuditEntry::format_timestamp(since) {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp >= AuditEntry::format_timestamp(until) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(actor: Option<&str>, resource: &str, ts: &str) -> AuditEntry {
        AuditEntry {
            timestamp: ts.to_string(),
            action: AuditAction::DiagramUpdate,
            actor_id: actor.map(String::from),
            actor_role: None,
            resource_id: resource.to_string(),
            details: None,
            ip_address: None,
            user_agent: None,
        }
    }

    #[test]
    fn test_default_matches_everything() {
        let query = AuditQuery::new();
        assert_eq!(query.limit, DEFAULT_QUERY_LIMIT);
        assert!(query.matches(&entry(Some("u1"), "dgm-1", "2026-01-01T00:00:00.000000Z")));
        assert!(query.matches(&entry(None, "dgm-2", "2026-01-01T00:00:00.000000Z")));
    }

    #[test]
    fn test_anonymous_selector_excludes_named_actors() {
        let query = AuditQuery::new().with_actor(ActorSelector::Anonymous);
        assert!(query.matches(&entry(None, "dgm-1", "2026-01-01T00:00:00.000000Z")));
        assert!(!query.matches(&entry(Some("u1"), "dgm-1", "2026-01-01T00:00:00.000000Z")));
    }

    #[test]
    fn test_actor_id_selector_excludes_anonymous() {
        let query = AuditQuery::new().with_actor(ActorSelector::Id("u1".to_string()));
        assert!(query.matches(&entry(Some("u1"), "dgm-1", "2026-01-01T00:00:00.000000Z")));
        assert!(!query.matches(&entry(Some("u2"), "dgm-1", "2026-01-01T00:00:00.000000Z")));
        assert!(!query.matches(&entry(None, "dgm-1", "2026-01-01T00:00:00.000000Z")));
    }

    #[test]
    fn test_resource_filter() {
        let query = AuditQuery::new().with_resource("dgm-7");
        assert!(query.matches(&entry(None, "dgm-7", "2026-01-01T00:00:00.000000Z")));
        assert!(!query.matches(&entry(None, "dgm-70", "2026-01-01T00:00:00.000000Z")));
    }

    #[test]
    fn test_time_window_inclusive_exclusive() {
        let since = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap();
        let query = AuditQuery::new().since(since).until(until);

        assert!(query.matches(&entry(None, "d", "2026-01-01T10:00:00.000000Z")));
        assert!(query.matches(&entry(None, "d", "2026-01-01T10:59:59.999999Z")));
        assert!(!query.matches(&entry(None, "d", "2026-01-01T09:59:59.999999Z")));
        assert!(!query.matches(&entry(None, "d", "2026-01-01T11:00:00.000000Z")));
    }

    #[test]
    fn test_filters_combine_conjunctively() {
        let query = AuditQuery::new()
            .with_actor(ActorSelector::Id("u1".to_string()))
            .with_resource("dgm-1");
        assert!(query.matches(&entry(Some("u1"), "dgm-1", "2026-01-01T00:00:00.000000Z")));
        assert!(!query.matches(&entry(Some("u1"), "dgm-2", "2026-01-01T00:00:00.000000Z")));
        assert!(!query.matches(&entry(Some("u2"), "dgm-1", "2026-01-01T00:00:00.000000Z")));
    }
}
