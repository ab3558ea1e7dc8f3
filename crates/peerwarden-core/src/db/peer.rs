// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use peerwarden_types::{DisableCause, PeerStatus, PeerSummary};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use uuid::Uuid;

use crate::address;
use crate::keys::EXTERNAL_KEY;
use crate::schedule::Schedule;

const GIB: i64 = 1 << 30;

// ---------------------------------------------------------------------------
// Model types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Peer {
    pub id: Uuid,
    pub name: String,
    pub public_key: String,
    pub encrypted_private_key: String,
    /// Server view, `host/32`, unless a legacy row still holds the client view.
    pub allowed_ips: String,
    pub disabled: bool,
    pub disabled_cause: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub data_limit_gb: i64,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
    pub total_rx_bytes: i64,
    pub total_tx_bytes: i64,
    pub last_handshake_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Peer {
    pub fn cause(&self) -> Option<DisableCause> {
        self.disabled_cause.as_deref().and_then(|c| c.parse().ok())
    }

    pub fn host(&self) -> Option<Ipv4Addr> {
        address::parse_host(&self.allowed_ips).map(|(a, _)| a)
    }

    /// The `/32` routing form, re-derived from whatever the row holds.
    pub fn server_view(&self) -> Option<String> {
        self.host().map(address::server_view)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn status(&self, now: DateTime<Utc>) -> PeerStatus {
        if self.is_expired(now) {
            PeerStatus::Expired
        } else if !self.disabled {
            PeerStatus::Active
        } else if self.cause() == Some(DisableCause::Quota) {
            PeerStatus::QuotaExceeded
        } else {
            PeerStatus::Disabled
        }
    }

    /// Received bytes across all sessions, including the current one.
    pub fn lifetime_rx(&self) -> i64 {
        self.total_rx_bytes + self.rx_bytes
    }

    pub fn lifetime_tx(&self) -> i64 {
        self.total_tx_bytes + self.tx_bytes
    }

    pub fn limit_bytes(&self) -> Option<i64> {
        (self.data_limit_gb > 0).then(|| self.data_limit_gb.saturating_mul(GIB))
    }

    pub fn summary(&self, now: DateTime<Utc>) -> PeerSummary {
        PeerSummary {
            id: self.id,
            name: self.name.clone(),
            public_key: self.public_key.clone(),
            allowed_ips: self.allowed_ips.clone(),
            status: self.status(now),
            expires_at: self.expires_at,
            data_limit_gb: self.data_limit_gb,
            rx_bytes: self.lifetime_rx(),
            tx_bytes: self.lifetime_tx(),
            externally_managed: self.encrypted_private_key == EXTERNAL_KEY,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPeer<'a> {
    pub name: &'a str,
    pub public_key: &'a str,
    pub encrypted_private_key: &'a str,
    pub allowed_ips: &'a str,
    pub disabled: bool,
    pub disabled_cause: Option<DisableCause>,
    pub expires_at: Option<DateTime<Utc>>,
    pub data_limit_gb: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UsageSample {
    pub peer_id: Uuid,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArchivedUsage {
    pub peer_name: String,
    pub public_key: String,
    pub total_rx_bytes: i64,
    pub total_tx_bytes: i64,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditEvent {
    pub peer_name: Option<String>,
    pub action: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct ScheduleRow {
    peer_id: Uuid,
    days: String,
    start_hour: i64,
    end_hour: i64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("name already taken")]
    DuplicateName,

    #[error("public key already registered")]
    DuplicateKey,

    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

type Result<T> = std::result::Result<T, StoreError>;

fn map_unique(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            let msg = db_err.message();
            if msg.contains("peers.name") {
                StoreError::DuplicateName
            } else if msg.contains("peers.public_key") {
                StoreError::DuplicateKey
            } else {
                StoreError::Database(e)
            }
        }
        _ => StoreError::Database(e),
    }
}

// ---------------------------------------------------------------------------
// Connection-level queries
//
// These run on whatever connection the caller holds, so the allocator can use
// them inside the same transaction as the insert.
// ---------------------------------------------------------------------------

pub async fn peer_addresses(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT allowed_ips FROM peers")
        .fetch_all(conn)
        .await?;
    Ok(rows.into_iter().map(|(a,)| a).collect())
}

pub async fn count_peers(conn: &mut SqliteConnection) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM peers")
        .fetch_one(conn)
        .await?;
    Ok(count)
}

pub async fn insert_peer(conn: &mut SqliteConnection, new: &NewPeer<'_>) -> Result<Peer> {
    let now = Utc::now();
    sqlx::query_as::<_, Peer>(
        "INSERT INTO peers (id, name, public_key, encrypted_private_key, allowed_ips,
                            disabled, disabled_cause, expires_at, data_limit_gb,
                            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(new.name)
    .bind(new.public_key)
    .bind(new.encrypted_private_key)
    .bind(new.allowed_ips)
    .bind(new.disabled)
    .bind(new.disabled_cause.map(DisableCause::as_str))
    .bind(new.expires_at)
    .bind(new.data_limit_gb)
    .bind(now)
    .fetch_one(conn)
    .await
    .map_err(map_unique)
}

// ---------------------------------------------------------------------------
// PeerStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PeerStore {
    pool: SqlitePool,
}

impl PeerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.map_err(Into::into)
    }

    // -- Peer CRUD -----------------------------------------------------------

    #[tracing::instrument(skip(self, new), fields(name = new.name))]
    pub async fn insert_peer(&self, new: &NewPeer<'_>) -> Result<Peer> {
        let mut conn = self.pool.acquire().await?;
        insert_peer(&mut conn, new).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_peer(&self, id: Uuid) -> Result<Option<Peer>> {
        sqlx::query_as::<_, Peer>("SELECT * FROM peers WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_peer_by_name(&self, name: &str) -> Result<Option<Peer>> {
        sqlx::query_as::<_, Peer>("SELECT * FROM peers WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_peer_by_public_key(&self, public_key: &str) -> Result<Option<Peer>> {
        sqlx::query_as::<_, Peer>("SELECT * FROM peers WHERE public_key = ?1")
            .bind(public_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        sqlx::query_as::<_, Peer>("SELECT * FROM peers ORDER BY created_at, name")
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn rename_peer(&self, id: Uuid, name: &str) -> Result<Option<Peer>> {
        sqlx::query_as::<_, Peer>(
            "UPDATE peers SET name = ?2, updated_at = ?3 WHERE id = ?1 RETURNING *",
        )
        .bind(id)
        .bind(name)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_unique)
    }

    #[tracing::instrument(skip(self, value))]
    pub async fn set_encrypted_key(&self, id: Uuid, value: &str) -> Result<()> {
        sqlx::query("UPDATE peers SET encrypted_private_key = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(value)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_allowed_ips(&self, id: Uuid, allowed_ips: &str) -> Result<()> {
        sqlx::query("UPDATE peers SET allowed_ips = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(allowed_ips)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark an active peer disabled, folding its session counters into the
    /// totals. Returns `None` if the peer is missing or already disabled.
    #[tracing::instrument(skip(self))]
    pub async fn mark_disabled(&self, id: Uuid, cause: DisableCause) -> Result<Option<Peer>> {
        sqlx::query_as::<_, Peer>(
            "UPDATE peers
             SET disabled = TRUE,
                 disabled_cause = ?2,
                 total_rx_bytes = total_rx_bytes + rx_bytes,
                 total_tx_bytes = total_tx_bytes + tx_bytes,
                 rx_bytes = 0,
                 tx_bytes = 0,
                 updated_at = ?3
             WHERE id = ?1 AND disabled = FALSE
             RETURNING *",
        )
        .bind(id)
        .bind(cause.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Clear the disabled flag and store the re-derived server view.
    #[tracing::instrument(skip(self))]
    pub async fn mark_enabled(&self, id: Uuid, allowed_ips: &str) -> Result<Option<Peer>> {
        sqlx::query_as::<_, Peer>(
            "UPDATE peers
             SET disabled = FALSE, disabled_cause = NULL, allowed_ips = ?2, updated_at = ?3
             WHERE id = ?1 AND disabled = TRUE
             RETURNING *",
        )
        .bind(id)
        .bind(allowed_ips)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn update_limits(
        &self,
        id: Uuid,
        data_limit_gb: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Peer>> {
        sqlx::query_as::<_, Peer>(
            "UPDATE peers SET data_limit_gb = ?2, expires_at = ?3, updated_at = ?4
             WHERE id = ?1 RETURNING *",
        )
        .bind(id)
        .bind(data_limit_gb)
        .bind(expires_at)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Overwrite the usage counters with values computed by the caller.
    #[tracing::instrument(skip(self))]
    pub async fn set_usage(
        &self,
        id: Uuid,
        rx_bytes: i64,
        tx_bytes: i64,
        total_rx_bytes: i64,
        total_tx_bytes: i64,
        last_handshake_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE peers
             SET rx_bytes = ?2, tx_bytes = ?3, total_rx_bytes = ?4, total_tx_bytes = ?5,
                 last_handshake_at = COALESCE(?6, last_handshake_at), updated_at = ?7
             WHERE id = ?1",
        )
        .bind(id)
        .bind(rx_bytes)
        .bind(tx_bytes)
        .bind(total_rx_bytes)
        .bind(total_tx_bytes)
        .bind(last_handshake_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns whether a row was deleted.
    #[tracing::instrument(skip(self))]
    pub async fn delete_peer(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM peers WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Usage history -------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub async fn insert_usage_sample(&self, id: Uuid, rx_bytes: i64, tx_bytes: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_history (peer_id, rx_bytes, tx_bytes, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(rx_bytes)
        .bind(tx_bytes)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_usage_history(&self, id: Uuid) -> Result<Vec<UsageSample>> {
        sqlx::query_as::<_, UsageSample>(
            "SELECT peer_id, rx_bytes, tx_bytes, recorded_at FROM usage_history
             WHERE peer_id = ?1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_usage_history(&self, id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM usage_history WHERE peer_id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete the row and archive its lifetime usage atomically. Returns
    /// false, archiving nothing, when the row is already gone.
    #[tracing::instrument(skip(self, peer), fields(name = %peer.name))]
    pub async fn archive_and_delete(&self, peer: &Peer) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM peers WHERE id = ?1")
            .bind(peer.id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query(
            "INSERT INTO usage_archive (peer_name, public_key, total_rx_bytes, total_tx_bytes, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&peer.name)
        .bind(&peer.public_key)
        .bind(peer.lifetime_rx())
        .bind(peer.lifetime_tx())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_archived_usage(&self) -> Result<Vec<ArchivedUsage>> {
        sqlx::query_as::<_, ArchivedUsage>(
            "SELECT peer_name, public_key, total_rx_bytes, total_tx_bytes, deleted_at
             FROM usage_archive ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    // -- Settings ------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    #[tracing::instrument(skip(self))]
    pub async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- Schedules -----------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub async fn set_schedule(&self, id: Uuid, schedule: &Schedule) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO peer_schedules (peer_id, days, start_hour, end_hour)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(schedule.days_string())
        .bind(i64::from(schedule.start_hour))
        .bind(i64::from(schedule.end_hour))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn clear_schedule(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM peer_schedules WHERE peer_id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_schedules(&self) -> Result<Vec<(Uuid, Schedule)>> {
        let rows = sqlx::query_as::<_, ScheduleRow>("SELECT * FROM peer_schedules")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let start = u8::try_from(row.start_hour)
                    .map_err(|_| StoreError::Corrupt(format!("start_hour {}", row.start_hour)))?;
                let end = u8::try_from(row.end_hour)
                    .map_err(|_| StoreError::Corrupt(format!("end_hour {}", row.end_hour)))?;
                let schedule = Schedule::from_parts(&row.days, start, end)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok((row.peer_id, schedule))
            })
            .collect()
    }

    // -- Audit ---------------------------------------------------------------

    pub async fn insert_event(
        &self,
        peer_name: Option<&str>,
        action: &str,
        detail: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_events (peer_name, action, detail, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(peer_name)
        .bind(action)
        .bind(detail)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_events(&self) -> Result<Vec<AuditEvent>> {
        sqlx::query_as::<_, AuditEvent>(
            "SELECT peer_name, action, detail, created_at FROM audit_events ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn store() -> (tempfile::TempDir, PeerStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        let pool = db::create_pool(&url).await.unwrap();
        db::migrate(&pool).await.unwrap();
        (dir, PeerStore::new(pool))
    }

    fn new_peer<'a>(name: &'a str, key: &'a str, ip: &'a str) -> NewPeer<'a> {
        NewPeer {
            name,
            public_key: key,
            encrypted_private_key: "",
            allowed_ips: ip,
            disabled: false,
            disabled_cause: None,
            expires_at: None,
            data_limit_gb: 0,
        }
    }

    #[tokio::test]
    async fn duplicate_name_and_key_are_distinguished() {
        let (_dir, store) = store().await;
        store.insert_peer(&new_peer("a", "k1", "10.100.0.2/32")).await.unwrap();

        let dup_name = store.insert_peer(&new_peer("a", "k2", "10.100.0.3/32")).await;
        assert!(matches!(dup_name, Err(StoreError::DuplicateName)));

        let dup_key = store.insert_peer(&new_peer("b", "k1", "10.100.0.3/32")).await;
        assert!(matches!(dup_key, Err(StoreError::DuplicateKey)));
    }

    #[tokio::test]
    async fn disable_folds_session_into_totals() {
        let (_dir, store) = store().await;
        let peer = store.insert_peer(&new_peer("a", "k1", "10.100.0.2/32")).await.unwrap();
        store.set_usage(peer.id, 100, 50, 1000, 500, None).await.unwrap();

        let disabled = store
            .mark_disabled(peer.id, DisableCause::User)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((disabled.rx_bytes, disabled.tx_bytes), (0, 0));
        assert_eq!((disabled.total_rx_bytes, disabled.total_tx_bytes), (1100, 550));
        assert_eq!(disabled.cause(), Some(DisableCause::User));

        // Already disabled: no second fold.
        assert!(store.mark_disabled(peer.id, DisableCause::User).await.unwrap().is_none());

        let enabled = store
            .mark_enabled(peer.id, "10.100.0.2/32")
            .await
            .unwrap()
            .unwrap();
        assert!(!enabled.disabled);
        assert_eq!(enabled.cause(), None);
        assert_eq!((enabled.total_rx_bytes, enabled.total_tx_bytes), (1100, 550));
    }

    #[tokio::test]
    async fn settings_upsert() {
        let (_dir, store) = store().await;
        assert_eq!(store.get_setting("subnet_cidr").await.unwrap(), None);
        store.put_setting("subnet_cidr", "10.100.0.0/24").await.unwrap();
        store.put_setting("subnet_cidr", "10.100.0.0/22").await.unwrap();
        assert_eq!(
            store.get_setting("subnet_cidr").await.unwrap().as_deref(),
            Some("10.100.0.0/22")
        );
    }

    #[tokio::test]
    async fn delete_reports_absence() {
        let (_dir, store) = store().await;
        let peer = store.insert_peer(&new_peer("a", "k1", "10.100.0.2/32")).await.unwrap();
        assert!(store.delete_peer(peer.id).await.unwrap());
        assert!(!store.delete_peer(peer.id).await.unwrap());
    }

    #[tokio::test]
    async fn archive_and_delete_archives_once() {
        let (_dir, store) = store().await;
        let peer = store.insert_peer(&new_peer("a", "k1", "10.100.0.2/32")).await.unwrap();
        store.set_usage(peer.id, 10, 20, 1000, 2000, None).await.unwrap();
        let peer = store.get_peer(peer.id).await.unwrap().unwrap();

        assert!(store.archive_and_delete(&peer).await.unwrap());
        assert!(!store.archive_and_delete(&peer).await.unwrap());

        let archived = store.list_archived_usage().await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!((archived[0].total_rx_bytes, archived[0].total_tx_bytes), (1010, 2020));
        assert!(store.get_peer(peer.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn schedules_round_trip_and_cascade() {
        let (_dir, store) = store().await;
        let peer = store.insert_peer(&new_peer("a", "k1", "10.100.0.2/32")).await.unwrap();
        let schedule = Schedule::from_parts("mon,tue", 8, 18).unwrap();
        store.set_schedule(peer.id, &schedule).await.unwrap();
        assert_eq!(store.list_schedules().await.unwrap(), vec![(peer.id, schedule)]);

        store.delete_peer(peer.id).await.unwrap();
        assert!(store.list_schedules().await.unwrap().is_empty());
    }

    #[test]
    fn status_precedence() {
        let now = Utc::now();
        let mut peer = Peer {
            id: Uuid::nil(),
            name: "a".into(),
            public_key: "k".into(),
            encrypted_private_key: String::new(),
            allowed_ips: "10.100.0.2/32".into(),
            disabled: false,
            disabled_cause: None,
            expires_at: None,
            data_limit_gb: 1,
            rx_bytes: 0,
            tx_bytes: 0,
            total_rx_bytes: 0,
            total_tx_bytes: 0,
            last_handshake_at: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(peer.status(now), PeerStatus::Active);
        assert_eq!(peer.limit_bytes(), Some(1 << 30));

        peer.disabled = true;
        peer.disabled_cause = Some("quota".into());
        assert_eq!(peer.status(now), PeerStatus::QuotaExceeded);

        peer.expires_at = Some(now - chrono::Duration::seconds(1));
        assert_eq!(peer.status(now), PeerStatus::Expired);
    }
}
