// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Migration orchestrator.
//!
//! Moves a set of tables from a source keyspace to a destination keyspace
//! through reversible phases:
//!
//! 1. **Clone**: replication streams copy and tail the tables; base routing
//!    rules keep every class on the source; the destination primary refuses
//!    writes to the tables.
//! 2. **CutoverReadOnly**, **CutoverReplica**: class-qualified rules send that
//!    class to the destination; the source blacklists the tables for it.
//! 3. **CutoverPrimary**: the source primary stops taking writes, streams drain
//!    to the source head and stop, the base rules flip, the destination
//!    primary starts taking writes. Optionally reverse streams replicate new
//!    destination writes back to the source.
//!
//! `reverse()` undoes the latest committed phase from its stored inverse,
//! `finalize()` ends a completed migration and `cancel()` abandons one that
//! has only cloned.
//!
//! # Crash Safety
//!
//! ```text
//! plan delta ──► record.pending = intent ──► blacklists/rules/streams ──► commit (pending → committed)
//!                     (CAS on record)             (unconditional)            (CAS on record)
//! ```
//!
//! A retry that finds its own pending intent re-applies the stored delta, so
//! a crash between external writes heals on the next attempt. Shared state
//! lives in the topology store under CAS; a concurrent writer surfaces as a
//! `Conflict` error that the operator re-runs.

pub mod phase;
pub mod types;

pub use types::{
    CommittedPhase, Direction, IntentKind, MigrationKey, MigrationRecord, PendingIntent, Phase,
    PhaseDelta, RuleChange,
};

use crate::blacklist::{BlacklistAction, BlacklistStore};
use crate::config::OrchestratorSettings;
use crate::error::{MigrationError, Result};
use crate::filter::{Filter, FilterSpec, KeyRange};
use crate::metrics;
use crate::partition::{PartitionBackend, PartitionError, PartitionRef, PartitionResolver, TrafficClass};
use crate::position::Position;
use crate::routing::{RoutingRuleStore, RoutingRules};
use crate::stream::{StreamEngine, StreamId, StreamRecord, StreamState, StreamStatus};
use crate::topo::{KeyspaceRecord, ShardRecord, Topology};
use phase::PlanInput;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// A migration record with the live status of its streams.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub record: MigrationRecord,
    pub streams: Vec<StreamStatus>,
}

/// Drives migrations through their phases.
pub struct Orchestrator {
    topo: Topology,
    rules: RoutingRuleStore,
    blacklists: BlacklistStore,
    engine: Arc<StreamEngine>,
    resolver: Arc<dyn PartitionResolver>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        topo: Topology,
        engine: Arc<StreamEngine>,
        resolver: Arc<dyn PartitionResolver>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            rules: RoutingRuleStore::new(topo.clone()),
            blacklists: BlacklistStore::new(topo.clone()),
            topo,
            engine,
            resolver,
            settings,
        }
    }

    pub fn engine(&self) -> &Arc<StreamEngine> {
        &self.engine
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    // =========================================================================
    // Topology pass-throughs
    // =========================================================================

    pub async fn create_keyspace(&self, name: &str, sharding_column: Option<&str>) -> Result<()> {
        self.topo.create_keyspace(name, sharding_column).await
    }

    pub async fn create_shard(&self, partition: &PartitionRef, key_range: Option<KeyRange>) -> Result<()> {
        self.topo.create_shard(partition, key_range).await
    }

    /// Current routing rule set.
    pub async fn routing_rules(&self) -> Result<RoutingRules> {
        Ok(self.rules.read().await?.0)
    }

    // =========================================================================
    // Phases
    // =========================================================================

    /// Start (or resume) cloning `tables` from the source to the destination.
    ///
    /// Returns once every stream is Running within the lag threshold.
    pub async fn clone_tables(&self, key: &MigrationKey, tables: &[String]) -> Result<MigrationRecord> {
        self.observe(key, Phase::Clone, "apply", self.clone_inner(key, tables))
            .await
    }

    /// Move one traffic class to the destination.
    ///
    /// `reverse_replication` only matters for the primary class: it starts
    /// destination → source streams so the source stays current.
    pub async fn cutover(
        &self,
        key: &MigrationKey,
        class: TrafficClass,
        reverse_replication: bool,
    ) -> Result<MigrationRecord> {
        let phase = Phase::cutover(class);
        self.observe(key, phase, "apply", self.cutover_inner(key, phase, reverse_replication))
            .await
    }

    /// Undo the latest committed phase, which must be `phase`.
    pub async fn reverse(&self, key: &MigrationKey, phase: Phase) -> Result<MigrationRecord> {
        self.observe(key, phase, "reverse", self.reverse_inner(key, phase))
            .await
    }

    /// Finish a migration whose primary cutover committed. Irreversible.
    pub async fn finalize(&self, key: &MigrationKey) -> Result<()> {
        self.observe(key, Phase::CutoverPrimary, "finalize", self.finalize_inner(key))
            .await
    }

    /// Abandon a migration that has not cut over any traffic.
    pub async fn cancel(&self, key: &MigrationKey) -> Result<()> {
        self.observe(key, Phase::Clone, "cancel", self.cancel_inner(key))
            .await
    }

    /// Record plus live stream status.
    pub async fn status(&self, key: &MigrationKey) -> Result<MigrationStatus> {
        let (record, _) = self.load(key).await?;
        let mut streams = Vec::new();
        for id in record.all_streams() {
            match self.engine.status(id).await {
                Ok(s) => streams.push(s),
                Err(MigrationError::NotFound(_)) => {
                    debug!(stream_id = %id, "Migration stream not registered");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(MigrationStatus { record, streams })
    }

    /// Every migration record, ordered by key.
    pub async fn list(&self) -> Result<Vec<MigrationRecord>> {
        let mut records = Vec::new();
        for key in self.topo.list(MigrationKey::prefix()).await? {
            if let Some((record, _)) = self.topo.get_json::<MigrationRecord>(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn observe<T>(
        &self,
        key: &MigrationKey,
        phase: Phase,
        action: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        let span = info_span!("migration", migration = %key, phase = %phase, action);
        let result = fut.instrument(span).await;
        metrics::record_phase_transition(&key.to_string(), phase.as_str(), action, result.is_ok());
        match &result {
            Ok(_) => {
                metrics::record_phase_duration(phase.as_str(), started.elapsed());
                info!(
                    migration = %key,
                    phase = %phase,
                    action,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Migration phase complete"
                );
            }
            Err(e) => {
                warn!(migration = %key, phase = %phase, action, error = %e, "Migration phase failed");
            }
        }
        result
    }

    async fn clone_inner(&self, key: &MigrationKey, tables: &[String]) -> Result<MigrationRecord> {
        if key.source_keyspace == key.destination_keyspace {
            return Err(MigrationError::precondition(
                "source and destination keyspace are the same",
            ));
        }
        let filter = Filter::compile(&FilterSpec::new(&key.source_keyspace, tables.iter().cloned()))?;
        let tables = filter.tables().to_vec();
        let layout = self.layout(key).await?;

        let record_key = key.record_key();
        let (mut record, mut version) = match self.topo.get_json::<MigrationRecord>(&record_key).await? {
            Some((existing, version)) => {
                check_same_migration(&existing, key, &tables)?;
                (existing, version)
            }
            None => {
                let record = MigrationRecord::new(key, tables.clone());
                let version = self.topo.create_json(&record_key, &record).await?;
                info!(tables = ?tables, "Migration created");
                (record, version)
            }
        };

        let delta = match (record.pending.clone(), record.latest().cloned()) {
            (Some(p), _) if p.kind == IntentKind::Apply && p.delta.phase == Phase::Clone => p.delta,
            (Some(p), _) => return Err(pending_conflict(&p)),
            (None, Some(committed)) if committed.phase() == Phase::Clone => {
                // Re-invoked after commit: re-apply and confirm streams.
                self.apply_delta(&committed.delta).await?;
                self.ensure_forward_streams(&layout, &mut record, version).await?;
                self.wait_caught_up(&record).await?;
                return Ok(record);
            }
            (None, Some(committed)) => {
                return Err(MigrationError::precondition(format!(
                    "migration is past clone (latest phase {})",
                    committed.phase()
                )));
            }
            (None, None) => self.plan(&record, Phase::Clone).await?,
        };

        if record.pending.is_none() {
            record.pending = Some(PendingIntent {
                kind: IntentKind::Apply,
                delta: delta.clone(),
                reverse_replication: false,
            });
            version = self.save(&mut record, version).await?;
        }

        version = self.ensure_forward_streams(&layout, &mut record, version).await?;

        self.apply_delta(&delta).await?;
        self.wait_caught_up(&record).await?;
        self.commit(&mut record, version, delta).await?;
        Ok(record)
    }

    async fn cutover_inner(
        &self,
        key: &MigrationKey,
        phase: Phase,
        reverse_replication: bool,
    ) -> Result<MigrationRecord> {
        let (mut record, mut version) = self.load(key).await?;

        let resumed = match &record.pending {
            Some(p) if p.kind == IntentKind::Apply && p.delta.phase == phase => Some(p.clone()),
            Some(p) => return Err(pending_conflict(p)),
            None => None,
        };
        if resumed.is_none() {
            let latest = record.latest_phase();
            if latest == Some(phase) {
                if let Some(committed) = record.latest() {
                    self.apply_delta(&committed.delta).await?;
                }
                return Ok(record);
            }
            if latest != phase.previous() {
                return Err(MigrationError::precondition(format!(
                    "{} requires {} committed (latest is {})",
                    phase,
                    phase.previous().map_or("nothing".to_string(), |p| p.to_string()),
                    latest.map_or("nothing".to_string(), |p| p.to_string())
                )));
            }
        }

        let (delta, reverse_replication) = match resumed {
            // Streams may already be drained and stopped by the interrupted attempt.
            Some(p) => (p.delta, p.reverse_replication || reverse_replication),
            None => {
                self.wait_caught_up(&record).await?;
                let delta = self.plan(&record, phase).await?;
                record.pending = Some(PendingIntent {
                    kind: IntentKind::Apply,
                    delta: delta.clone(),
                    reverse_replication,
                });
                version = self.save(&mut record, version).await?;
                (delta, reverse_replication)
            }
        };

        if phase != Phase::CutoverPrimary {
            self.apply_delta(&delta).await?;
            self.commit(&mut record, version, delta).await?;
            return Ok(record);
        }

        // Source primary stops taking writes for the tables.
        self.write_blacklists(&delta, BlacklistAction::Install).await?;

        if let Err(e) = self.drain_forward(&record).await {
            warn!(error = %e, "Forward streams did not catch up, restoring source writes");
            self.restart_drained(&record.forward_streams).await;
            self.undo_installs(&delta).await;
            record.pending = None;
            if let Err(save_err) = self.save(&mut record, version).await {
                warn!(error = %save_err, "Failed to clear pending primary cutover");
            }
            return Err(e);
        }

        if reverse_replication {
            version = self.ensure_reverse_streams(key, &mut record, version).await?;
        }

        self.write_rules(&delta).await?;
        self.write_blacklists(&delta, BlacklistAction::Remove).await?;
        self.commit(&mut record, version, delta).await?;
        Ok(record)
    }

    async fn reverse_inner(&self, key: &MigrationKey, phase: Phase) -> Result<MigrationRecord> {
        let (mut record, mut version) = self.load(key).await?;

        let inverse = match (record.pending.clone(), record.latest()) {
            (Some(p), _) if p.kind == IntentKind::Reverse && p.delta.phase == phase => p.delta,
            (Some(p), _) => return Err(pending_conflict(&p)),
            (None, Some(latest)) if latest.phase() == phase => {
                if phase == Phase::Clone {
                    return Err(MigrationError::precondition(
                        "clone cannot be reversed, cancel the migration instead",
                    ));
                }
                latest.delta.inverse()
            }
            (None, latest) => {
                return Err(MigrationError::precondition(format!(
                    "can only reverse the latest committed phase ({}), not {}",
                    latest.map_or("none".to_string(), |c| c.phase().to_string()),
                    phase
                )));
            }
        };

        if record.pending.is_none() {
            record.pending = Some(PendingIntent {
                kind: IntentKind::Reverse,
                delta: inverse.clone(),
                reverse_replication: false,
            });
            version = self.save(&mut record, version).await?;
        }

        if phase == Phase::CutoverPrimary {
            // Destination primary stops taking writes again.
            self.write_blacklists(&inverse, BlacklistAction::Install).await?;

            if !record.reverse_streams.is_empty() {
                self.drain_reverse(&record).await?;
                for id in record.reverse_streams.clone() {
                    self.remove_stream(id).await?;
                }
                record.reverse_streams.clear();
            }
            record.direction = Direction::Forward;
            version = self.save(&mut record, version).await?;

            self.resume_streams(&record.forward_streams).await?;
            self.write_rules(&inverse).await?;
            self.write_blacklists(&inverse, BlacklistAction::Remove).await?;
        } else {
            self.apply_delta(&inverse).await?;
        }

        record.committed.pop();
        record.pending = None;
        self.save(&mut record, version).await?;
        Ok(record)
    }

    async fn finalize_inner(&self, key: &MigrationKey) -> Result<()> {
        let (record, version) = self.load(key).await?;
        if let Some(p) = &record.pending {
            return Err(pending_conflict(p));
        }
        if record.latest_phase() != Some(Phase::CutoverPrimary) {
            return Err(MigrationError::precondition(format!(
                "finalize requires {} committed",
                Phase::CutoverPrimary
            )));
        }

        for id in record.all_streams() {
            self.remove_stream(id).await?;
        }
        self.topo.delete(&key.record_key(), version).await?;
        info!(streams = record.all_streams().count(), "Migration finalized");
        Ok(())
    }

    async fn cancel_inner(&self, key: &MigrationKey) -> Result<()> {
        let (record, version) = self.load(key).await?;
        let clone_delta = match (&record.pending, record.latest()) {
            (Some(p), None) if p.kind == IntentKind::Apply && p.delta.phase == Phase::Clone => {
                Some(p.delta.clone())
            }
            (Some(p), _) => return Err(pending_conflict(p)),
            (None, Some(c)) if c.phase() == Phase::Clone => Some(c.delta.clone()),
            (None, None) => None,
            (None, Some(c)) => {
                return Err(MigrationError::precondition(format!(
                    "cannot cancel after {}, reverse it first",
                    c.phase()
                )));
            }
        };

        for id in record.all_streams() {
            self.remove_stream(id).await?;
        }
        if let Some(delta) = clone_delta {
            self.apply_delta(&delta.inverse()).await?;
        }
        self.topo.delete(&key.record_key(), version).await?;
        info!("Migration cancelled");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn load(&self, key: &MigrationKey) -> Result<(MigrationRecord, u64)> {
        let (record, version) = self
            .topo
            .get_json::<MigrationRecord>(&key.record_key())
            .await?
            .ok_or_else(|| MigrationError::NotFound(format!("migration {}", key)))?;
        if record.source_keyspace != key.source_keyspace {
            return Err(MigrationError::precondition(format!(
                "migration runs {}, not {}",
                record.key(),
                key
            )));
        }
        Ok((record, version))
    }

    async fn save(&self, record: &mut MigrationRecord, version: u64) -> Result<u64> {
        record.touch();
        let key = record.key().record_key();
        self.topo.update_json(&key, record, version).await.map_err(|e| {
            if e.is_conflict() {
                metrics::record_cas_conflict(&key);
            }
            e
        })
    }

    async fn commit(&self, record: &mut MigrationRecord, version: u64, delta: PhaseDelta) -> Result<u64> {
        let phase = delta.phase;
        record.committed.push(CommittedPhase {
            delta,
            committed_at: chrono::Utc::now().timestamp_millis(),
        });
        record.pending = None;
        let version = self.save(record, version).await?;
        info!(phase = %phase, "Phase committed");
        Ok(version)
    }

    async fn layout(&self, key: &MigrationKey) -> Result<Layout> {
        let source_ks = self.keyspace(&key.source_keyspace).await?;
        let destination_ks = self.keyspace(&key.destination_keyspace).await?;
        let source = self.shards(&source_ks.name).await?;
        let destination = self.shards(&destination_ks.name).await?;

        if source.len() != 1 {
            return Err(MigrationError::precondition(format!(
                "source keyspace {} must have exactly one shard, has {}",
                source_ks.name,
                source.len()
            )));
        }
        if destination.is_empty() {
            return Err(MigrationError::precondition(format!(
                "destination keyspace {} has no shards",
                destination_ks.name
            )));
        }
        if destination.len() > 1 && destination_ks.sharding_column.is_none() {
            return Err(MigrationError::precondition(format!(
                "destination keyspace {} has {} shards but no sharding column",
                destination_ks.name,
                destination.len()
            )));
        }
        Ok(Layout {
            source,
            destination,
            destination_keyspace: destination_ks,
        })
    }

    async fn keyspace(&self, name: &str) -> Result<KeyspaceRecord> {
        self.topo
            .get_keyspace(name)
            .await?
            .ok_or_else(|| MigrationError::precondition(format!("keyspace {} does not exist", name)))
    }

    async fn shards(&self, keyspace: &str) -> Result<BTreeMap<PartitionRef, ShardRecord>> {
        let mut shards = BTreeMap::new();
        for partition in self.topo.list_shards(keyspace).await? {
            let (record, _) = self.topo.get_shard(&partition).await?;
            shards.insert(partition, record);
        }
        Ok(shards)
    }

    async fn plan(&self, record: &MigrationRecord, phase: Phase) -> Result<PhaseDelta> {
        let source_shards = self.shards(&record.source_keyspace).await?;
        let destination_shards = self.shards(&record.destination_keyspace).await?;
        let (rules, _) = self.rules.read().await?;
        let delta = phase::plan(
            phase,
            &PlanInput {
                source_keyspace: &record.source_keyspace,
                destination_keyspace: &record.destination_keyspace,
                tables: &record.tables,
                source_shards: &source_shards,
                destination_shards: &destination_shards,
                rules: &rules,
            },
        );
        debug!(
            phase = %phase,
            rules = delta.rules.len(),
            blacklists = delta.blacklists.len(),
            "Phase planned"
        );
        Ok(delta)
    }

    /// Installs, then the routing CAS, then removals.
    async fn apply_delta(&self, delta: &PhaseDelta) -> Result<()> {
        self.write_blacklists(delta, BlacklistAction::Install).await?;
        self.write_rules(delta).await?;
        self.write_blacklists(delta, BlacklistAction::Remove).await
    }

    async fn write_rules(&self, delta: &PhaseDelta) -> Result<()> {
        let (mut rules, version) = self.rules.read().await?;
        if delta.apply_rules(&mut rules) {
            self.rules.compare_and_swap(version, &rules).await?;
            metrics::set_routing_rules(rules.len());
            info!(rules = rules.len(), "Routing rules written");
        }
        Ok(())
    }

    async fn write_blacklists(&self, delta: &PhaseDelta, action: BlacklistAction) -> Result<()> {
        for change in delta.blacklists.iter().filter(|c| c.action == action) {
            self.blacklists.apply(change).await?;
        }
        Ok(())
    }

    /// Best-effort removal of the blacklists a failed primary cutover installed.
    async fn undo_installs(&self, delta: &PhaseDelta) {
        for change in delta
            .blacklists
            .iter()
            .rev()
            .filter(|c| c.action == BlacklistAction::Install)
        {
            if let Err(e) = self.blacklists.apply(&change.inverse()).await {
                warn!(change = %change, error = %e, "Failed to roll back blacklist");
            }
        }
    }

    /// Resume the forward streams and start one into every destination
    /// shard that has none yet. An earlier attempt may have stopped after
    /// starting only some of them.
    async fn ensure_forward_streams(
        &self,
        layout: &Layout,
        record: &mut MigrationRecord,
        mut version: u64,
    ) -> Result<u64> {
        let known = record.forward_streams.len();
        let served = self
            .served_shards(&mut record.forward_streams, |stream| stream.destination)
            .await?;
        if record.forward_streams.len() != known {
            version = self.save(record, version).await?;
        }
        self.resume_streams(&record.forward_streams).await?;

        let source = layout.single_source()?;
        for (destination, shard) in &layout.destination {
            if served.contains(destination) {
                continue;
            }
            let spec = shard_filter(&record.source_keyspace, &record.tables, &layout.destination_keyspace, shard);
            let id = self.engine.start(source.clone(), destination.clone(), spec, None).await?;
            record.forward_streams.push(id);
            version = self.save(record, version).await?;
        }
        Ok(version)
    }

    /// Start a destination → source stream from every destination shard
    /// that is not replicating back yet.
    async fn ensure_reverse_streams(
        &self,
        key: &MigrationKey,
        record: &mut MigrationRecord,
        mut version: u64,
    ) -> Result<u64> {
        let layout = self.layout(key).await?;
        let served = self
            .served_shards(&mut record.reverse_streams, |stream| stream.source)
            .await?;

        let source = layout.single_source()?;
        let mut started = 0;
        for (destination, shard) in &layout.destination {
            if served.contains(destination) {
                continue;
            }
            let spec = shard_filter(
                &key.destination_keyspace,
                &record.tables,
                &layout.destination_keyspace,
                shard,
            );
            let head = self.head(destination).await?;
            let id = self
                .engine
                .start(destination.clone(), source.clone(), spec, Some(head))
                .await?;
            record.reverse_streams.push(id);
            record.direction = Direction::Reversed;
            version = self.save(record, version).await?;
            started += 1;
        }
        if started > 0 {
            info!(started, streams = record.reverse_streams.len(), "Reverse replication started");
        }
        Ok(version)
    }

    /// Destination-keyspace shards the streams in `ids` already cover, where
    /// `endpoint` picks that shard from a stream record. Ids the engine no
    /// longer knows are dropped from `ids`.
    async fn served_shards(
        &self,
        ids: &mut Vec<StreamId>,
        endpoint: fn(StreamRecord) -> PartitionRef,
    ) -> Result<BTreeSet<PartitionRef>> {
        let mut served = BTreeSet::new();
        let mut live = Vec::with_capacity(ids.len());
        for id in ids.iter() {
            match self.engine.record(*id).await {
                Ok(stream) => {
                    served.insert(endpoint(stream));
                    live.push(*id);
                }
                Err(MigrationError::NotFound(_)) => {
                    warn!(stream_id = %id, "Migration stream no longer exists, replacing it");
                }
                Err(e) => return Err(e),
            }
        }
        *ids = live;
        Ok(served)
    }

    async fn wait_caught_up(&self, record: &MigrationRecord) -> Result<()> {
        self.engine
            .wait_for_running(
                &record.forward_streams,
                self.settings.max_lag_duration(),
                self.settings.wait_timeout_duration(),
            )
            .await
    }

    /// Wait for every forward stream to reach its source head, then stop it.
    async fn drain_forward(&self, record: &MigrationRecord) -> Result<()> {
        for id in &record.forward_streams {
            if self.engine.status(*id).await?.state == StreamState::Stopped {
                continue;
            }
            self.drain(*id).await?;
            self.engine.stop(*id).await?;
        }
        info!(streams = record.forward_streams.len(), "Forward streams drained and stopped");
        Ok(())
    }

    async fn drain_reverse(&self, record: &MigrationRecord) -> Result<()> {
        for id in &record.reverse_streams {
            match self.engine.status(*id).await {
                Ok(status) if status.state.is_active() => self.drain(*id).await?,
                Ok(_) | Err(MigrationError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn drain(&self, id: StreamId) -> Result<()> {
        let stream = self.engine.record(id).await?;
        let head = self.head(&stream.source).await?;
        debug!(stream_id = %id, head = %head, "Waiting for stream to reach source head");
        self.engine
            .wait_for_position(id, head, self.settings.wait_timeout_duration())
            .await
    }

    async fn head(&self, partition: &PartitionRef) -> Result<Position> {
        let backend: Arc<dyn PartitionBackend> = self.resolver.resolve(partition).ok_or_else(|| {
            MigrationError::partition(partition, PartitionError::Lost("no backend registered".to_string()))
        })?;
        backend
            .head()
            .await
            .map_err(|e| MigrationError::partition(partition, e))
    }

    /// Best-effort resume of streams a failed drain left Stopped. Streams in
    /// Error stay there until the operator resumes them.
    async fn restart_drained(&self, ids: &[StreamId]) {
        for id in ids {
            match self.engine.status(*id).await {
                Ok(status) if status.state == StreamState::Stopped => {
                    if let Err(e) = self.engine.resume(*id).await {
                        warn!(stream_id = %id, error = %e, "Failed to restart drained stream");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(stream_id = %id, error = %e, "Failed to read drained stream"),
            }
        }
    }

    async fn resume_streams(&self, ids: &[StreamId]) -> Result<()> {
        for id in ids {
            self.engine.resume(*id).await?;
        }
        Ok(())
    }

    async fn remove_stream(&self, id: StreamId) -> Result<()> {
        match self.engine.remove(id).await {
            Ok(()) | Err(MigrationError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Shards involved in a migration.
struct Layout {
    source: BTreeMap<PartitionRef, ShardRecord>,
    destination: BTreeMap<PartitionRef, ShardRecord>,
    destination_keyspace: KeyspaceRecord,
}

impl Layout {
    fn single_source(&self) -> Result<&PartitionRef> {
        self.source
            .keys()
            .next()
            .ok_or_else(|| MigrationError::Internal("source keyspace has no shards".to_string()))
    }
}

/// Filter for one destination shard: the moved tables, restricted to the
/// shard's key range when the destination is sharded.
fn shard_filter(
    keyspace: &str,
    tables: &[String],
    destination: &KeyspaceRecord,
    shard: &ShardRecord,
) -> FilterSpec {
    let spec = FilterSpec::new(keyspace, tables.iter().cloned());
    match (&destination.sharding_column, &shard.key_range) {
        (Some(column), Some(range)) if !range.is_full() => spec.with_predicate(column, *range),
        _ => spec,
    }
}

fn check_same_migration(existing: &MigrationRecord, key: &MigrationKey, tables: &[String]) -> Result<()> {
    let same_tables = existing.tables.iter().collect::<BTreeSet<_>>() == tables.iter().collect::<BTreeSet<_>>();
    if existing.source_keyspace != key.source_keyspace
        || existing.destination_keyspace != key.destination_keyspace
        || !same_tables
    {
        return Err(MigrationError::precondition(format!(
            "migration {} for [{}] is already active between these keyspaces",
            existing.key(),
            existing.tables.join(",")
        )));
    }
    Ok(())
}

fn pending_conflict(pending: &PendingIntent) -> MigrationError {
    let action = match pending.kind {
        IntentKind::Apply => "cutover",
        IntentKind::Reverse => "reverse",
    };
    MigrationError::precondition(format!(
        "{} of {} is pending, retry it first",
        action, pending.delta.phase
    ))
}
