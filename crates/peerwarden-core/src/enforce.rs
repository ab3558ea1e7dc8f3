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

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use peerwarden_types::usage::{PeerDump, PeerTransfer};
use peerwarden_types::{DisableCause, Outcome};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::db::Peer;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::live::{LiveError, LiveInterface};

/// Session counters after folding in one live sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageUpdate {
    pub rx_bytes: i64,
    pub tx_bytes: i64,
    pub total_rx_bytes: i64,
    pub total_tx_bytes: i64,
    /// Bytes moved since the stored session values.
    pub delta_rx: i64,
    pub delta_tx: i64,
}

impl UsageUpdate {
    pub fn moved(&self) -> bool {
        self.delta_rx != 0 || self.delta_tx != 0
    }

    pub fn lifetime_bytes(&self) -> i64 {
        self.total_rx_bytes + self.rx_bytes + self.total_tx_bytes + self.tx_bytes
    }
}

fn clamp(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Fold a live counter reading into the stored counters.
///
/// A live value below the stored session means the interface counters were
/// reset (peer re-added or interface restarted), so the stored session is
/// carried into the totals before the new session starts.
pub fn fold_usage(peer: &Peer, live_rx: u64, live_tx: u64) -> UsageUpdate {
    let (live_rx, live_tx) = (clamp(live_rx), clamp(live_tx));
    let reset = live_rx < peer.rx_bytes || live_tx < peer.tx_bytes;
    if reset {
        UsageUpdate {
            rx_bytes: live_rx,
            tx_bytes: live_tx,
            total_rx_bytes: peer.total_rx_bytes + peer.rx_bytes,
            total_tx_bytes: peer.total_tx_bytes + peer.tx_bytes,
            delta_rx: live_rx,
            delta_tx: live_tx,
        }
    } else {
        UsageUpdate {
            rx_bytes: live_rx,
            tx_bytes: live_tx,
            total_rx_bytes: peer.total_rx_bytes,
            total_tx_bytes: peer.total_tx_bytes,
            delta_rx: live_rx - peer.rx_bytes,
            delta_tx: live_tx - peer.tx_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub disabled: usize,
    pub enabled: usize,
}

impl<L: LiveInterface> Gateway<L> {
    /// Remove every peer past its expiry. Raises the trigger once per batch.
    #[tracing::instrument(skip(self))]
    pub async fn expiry_pass(&self) -> Result<usize, GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        let now = Utc::now();
        let expired: Vec<Peer> = self
            .store
            .list_peers()
            .await?
            .into_iter()
            .filter(|p| p.is_expired(now))
            .collect();

        let mut removed = 0;
        for peer in &expired {
            if self.expire_locked(peer).await? != Outcome::Unchanged {
                removed += 1;
            }
        }
        if removed > 0 {
            self.raise_trigger();
            info!(removed, "expired peers removed");
        }
        Ok(removed)
    }

    /// Pull live counters, fold them into the store, and disable peers that
    /// went over their limit. Returns how many were disabled.
    #[tracing::instrument(skip(self))]
    pub async fn quota_pass(&self) -> Result<usize, GatewayError> {
        let dumps = match self.live.dump_all_peers().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "could not read live counters, retrying next pass");
                return Ok(0);
            }
        };
        let by_key: HashMap<&str, &PeerDump> =
            dumps.iter().map(|d| (d.public_key.as_str(), d)).collect();

        let _lifecycle = self.lifecycle.lock().await;
        let mut disabled = 0;
        for peer in self.store.list_peers().await? {
            if peer.disabled {
                continue;
            }
            // A peer absent from the dump is still held to its stored totals.
            let used = match by_key.get(peer.public_key.as_str()) {
                Some(dump) => self.record_usage(&peer, dump).await?,
                None => peer.lifetime_rx() + peer.lifetime_tx(),
            };

            let Some(limit) = peer.limit_bytes() else {
                continue;
            };
            if used > limit {
                info!(name = %peer.name, used, limit, "data limit exceeded");
                let Some(current) = self.store.get_peer(peer.id).await? else {
                    continue;
                };
                self.disable_locked(&current, DisableCause::Quota).await?;
                disabled += 1;
            }
        }
        if disabled > 0 {
            self.raise_trigger();
        }
        debug!(disabled, "quota pass complete");
        Ok(disabled)
    }

    /// Fold a dump entry into the stored counters. Returns lifetime bytes.
    async fn record_usage(&self, peer: &Peer, dump: &PeerDump) -> Result<i64, GatewayError> {
        let update = fold_usage(peer, dump.rx_bytes, dump.tx_bytes);
        let handshake_moved =
            dump.last_handshake.is_some() && dump.last_handshake != peer.last_handshake_at;
        let counters_changed = (
            update.rx_bytes,
            update.tx_bytes,
            update.total_rx_bytes,
            update.total_tx_bytes,
        ) != (peer.rx_bytes, peer.tx_bytes, peer.total_rx_bytes, peer.total_tx_bytes);
        if counters_changed || handshake_moved {
            self.store
                .set_usage(
                    peer.id,
                    update.rx_bytes,
                    update.tx_bytes,
                    update.total_rx_bytes,
                    update.total_tx_bytes,
                    dump.last_handshake,
                )
                .await?;
        }
        if update.moved() {
            self.store
                .insert_usage_sample(peer.id, update.delta_rx, update.delta_tx)
                .await?;
        }
        Ok(update.lifetime_bytes())
    }

    /// Transfer counters for every live peer.
    pub async fn live_transfer(&self) -> Result<Vec<PeerTransfer>, LiveError> {
        self.live.dump_transfer().await
    }

    /// Apply schedule windows at the given local time.
    ///
    /// Only peers the schedule itself disabled are re-enabled.
    #[tracing::instrument(skip(self))]
    pub async fn schedule_pass(&self, now: NaiveDateTime) -> Result<ScheduleReport, GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut report = ScheduleReport::default();
        for (id, schedule) in self.store.list_schedules().await? {
            let Some(peer) = self.store.get_peer(id).await? else {
                continue;
            };
            let allowed = schedule.allows(now);
            if !allowed && !peer.disabled {
                self.disable_locked(&peer, DisableCause::Schedule).await?;
                report.disabled += 1;
            } else if allowed && peer.disabled && peer.cause() == Some(DisableCause::Schedule) {
                self.enable_locked(&peer).await?;
                report.enabled += 1;
            }
        }
        if report.disabled + report.enabled > 0 {
            self.raise_trigger();
            info!(?report, "schedule pass changed peers");
        }
        Ok(report)
    }
}

/// Local wall-clock time, which schedule windows are written in.
pub fn local_now() -> NaiveDateTime {
    let now: DateTime<Utc> = Utc::now();
    now.with_timezone(&chrono::Local).naive_local()
}

/// Call `tick` every `period` until `shutdown` flips.
pub async fn run_every<F, Fut>(
    task: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(task, period_secs = period.as_secs(), "starting periodic task");
    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(task, "stopping periodic task");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn peer(rx: i64, tx: i64, total_rx: i64, total_tx: i64) -> Peer {
        let now = Utc::now();
        Peer {
            id: Uuid::nil(),
            name: "a".into(),
            public_key: "k".into(),
            encrypted_private_key: String::new(),
            allowed_ips: "10.100.0.2/32".into(),
            disabled: false,
            disabled_cause: None,
            expires_at: None,
            data_limit_gb: 0,
            rx_bytes: rx,
            tx_bytes: tx,
            total_rx_bytes: total_rx,
            total_tx_bytes: total_tx,
            last_handshake_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn counters_advance() {
        let update = fold_usage(&peer(100, 50, 1000, 500), 150, 80);
        assert_eq!((update.rx_bytes, update.tx_bytes), (150, 80));
        assert_eq!((update.total_rx_bytes, update.total_tx_bytes), (1000, 500));
        assert_eq!((update.delta_rx, update.delta_tx), (50, 30));
        assert_eq!(update.lifetime_bytes(), 1730);
    }

    #[test]
    fn counter_reset_folds_session() {
        let update = fold_usage(&peer(100, 50, 1000, 500), 10, 5);
        assert_eq!((update.rx_bytes, update.tx_bytes), (10, 5));
        assert_eq!((update.total_rx_bytes, update.total_tx_bytes), (1100, 550));
        assert_eq!((update.delta_rx, update.delta_tx), (10, 5));
    }

    #[test]
    fn unchanged_counters_do_not_move() {
        assert!(!fold_usage(&peer(100, 50, 0, 0), 100, 50).moved());
    }

    #[tokio::test]
    async fn periodic_task_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();
        let handle = tokio::spawn(run_every("test", Duration::from_millis(10), rx, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(counter.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }
}
