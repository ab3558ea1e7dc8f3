//! Append-only record of lifecycle transitions.

use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::db::PeerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Rename,
    Disable,
    Enable,
    Delete,
    Expire,
    QuotaExceeded,
    UpdateLimits,
    Schedule,
    Adopt,
    KeyMigrated,
    SubnetChanged,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Rename => "rename",
            Self::Disable => "disable",
            Self::Enable => "enable",
            Self::Delete => "delete",
            Self::Expire => "expire",
            Self::QuotaExceeded => "quota_exceeded",
            Self::UpdateLimits => "update_limits",
            Self::Schedule => "schedule",
            Self::Adopt => "adopt",
            Self::KeyMigrated => "key_migrated",
            Self::SubnetChanged => "subnet_changed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditRecord<'a> {
    pub peer: Option<&'a str>,
    pub action: Action,
    pub detail: String,
}

impl<'a> AuditRecord<'a> {
    pub fn peer(name: &'a str, action: Action, detail: impl Into<String>) -> Self {
        Self {
            peer: Some(name),
            action,
            detail: detail.into(),
        }
    }

    pub fn system(action: Action, detail: impl Into<String>) -> Self {
        Self {
            peer: None,
            action,
            detail: detail.into(),
        }
    }
}

/// Recording never fails the caller; sinks log their own errors.
pub trait AuditSink: Send + Sync {
    fn record<'a>(&'a self, record: AuditRecord<'a>) -> BoxFuture<'a, ()>;
}

/// Writes records to the `audit_events` table.
#[derive(Debug, Clone)]
pub struct StoreAuditSink {
    store: PeerStore,
}

impl StoreAuditSink {
    pub fn new(store: PeerStore) -> Self {
        Self { store }
    }
}

impl AuditSink for StoreAuditSink {
    fn record<'a>(&'a self, record: AuditRecord<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            info!(
                peer = record.peer,
                action = record.action.as_str(),
                detail = %record.detail,
                "audit"
            );
            if let Err(e) = self
                .store
                .insert_event(record.peer, record.action.as_str(), &record.detail)
                .await
            {
                warn!(error = %e, action = record.action.as_str(), "failed to write audit event");
            }
        })
    }
}
