//! One reconciliation run: collect, reconcile, diff, guard, commit, audit.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fscr_adapters::{MediaCatalog, RecordSource, SeedStall, StaticMediaCatalog};
use fscr_core::{
    CanonicalStall, MediaRecord, RunStatus, RunSummary, SourceRecord, SyncMode, SyncRun,
    SyncTrigger,
};
use fscr_storage::{CatalogStore, CommitPlan, StoreError};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::assemble::{assemble_stall, retain_persisted_media, seed_to_stall};
use crate::associate::{associate, MatchConfig};
use crate::diff::{classify, evaluate_guardrail, resolve_slugs};
use crate::group::{group_records, select_representative};
use crate::tags::TimeCategoryRules;
use crate::SyncConfig;

/// Receives every finished run summary. Failures only become warnings.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &RunSummary) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, summary: &RunSummary) -> anyhow::Result<()> {
        match summary.status {
            RunStatus::Success => info!(
                run_id = %summary.run_id,
                new = summary.new,
                updated = summary.updated,
                closed = summary.closed,
                "sync run succeeded"
            ),
            RunStatus::Guarded => warn!(
                run_id = %summary.run_id,
                closure_ratio = summary.closure_ratio,
                closed = summary.closed,
                "sync run guarded; nothing written"
            ),
            RunStatus::Failed => error!(
                run_id = %summary.run_id,
                error = summary.error.as_deref().unwrap_or_default(),
                "sync run failed"
            ),
        }
        Ok(())
    }
}

/// Canonical stalls for one batch of raw rows, plus what could not be used.
#[derive(Debug, Clone, Default)]
pub struct Reconciled {
    pub stalls: Vec<CanonicalStall>,
    /// Row keys with a blank name.
    pub skipped_rows: Vec<String>,
    /// Source keys of groups with no usable address.
    pub dropped_groups: Vec<String>,
}

/// Group, pick representatives, associate media and assemble. No I/O.
pub fn reconcile_records(
    records: Vec<SourceRecord>,
    catalog: &[MediaRecord],
    match_config: &MatchConfig,
    rules: &TimeCategoryRules,
    synced_at: DateTime<Utc>,
) -> Reconciled {
    let grouping = group_records(records);
    let mut reconciled = Reconciled {
        skipped_rows: grouping.skipped_rows,
        ..Reconciled::default()
    };

    for group in &grouping.groups {
        let Some((representative, completeness)) = select_representative(&group.records) else {
            continue;
        };
        let association = associate(&group.records, &representative.name, catalog, match_config);
        match assemble_stall(
            group,
            representative,
            completeness,
            association.as_ref(),
            rules,
            synced_at,
        ) {
            Some(stall) => reconciled.stalls.push(stall),
            None => reconciled.dropped_groups.push(group.source_key.clone()),
        }
    }
    reconciled
}

pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn CatalogStore>,
    record_sources: Vec<Box<dyn RecordSource>>,
    media_catalog: Box<dyn MediaCatalog>,
    seed: Vec<SeedStall>,
    match_config: MatchConfig,
    time_rules: TimeCategoryRules,
    notifier: Box<dyn Notifier>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, store: Arc<dyn CatalogStore>) -> Self {
        Self {
            config,
            store,
            record_sources: Vec::new(),
            media_catalog: Box::<StaticMediaCatalog>::default(),
            seed: Vec::new(),
            match_config: MatchConfig::default(),
            time_rules: TimeCategoryRules::builtin(),
            notifier: Box::new(LogNotifier),
        }
    }

    pub fn with_record_source(mut self, source: Box<dyn RecordSource>) -> Self {
        self.record_sources.push(source);
        self
    }

    pub fn with_media_catalog(mut self, catalog: Box<dyn MediaCatalog>) -> Self {
        self.media_catalog = catalog;
        self
    }

    pub fn with_seed(mut self, seed: Vec<SeedStall>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_match_config(mut self, match_config: MatchConfig) -> Self {
        self.match_config = match_config;
        self
    }

    pub fn with_time_rules(mut self, time_rules: TimeCategoryRules) -> Self {
        self.time_rules = time_rules;
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs one pass. Never errors: the outcome is the summary's status.
    pub async fn run_once(&self, trigger: SyncTrigger) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "sync_run",
            %run_id,
            mode = self.config.mode.as_str(),
            trigger = trigger.as_str()
        );
        self.run_in_span(run_id, trigger).instrument(span).await
    }

    async fn run_in_span(&self, run_id: Uuid, trigger: SyncTrigger) -> RunSummary {
        let started_at = Utc::now();
        let mut summary = RunSummary {
            run_id,
            trigger,
            mode: self.config.mode,
            status: RunStatus::Success,
            started_at,
            finished_at: started_at,
            previous_active: 0,
            fresh_total: 0,
            new: 0,
            updated: 0,
            unchanged: 0,
            closed: 0,
            closure_ratio: 0.0,
            guardrail_tripped: false,
            forced: false,
            seeded: false,
            slug_adjustments: 0,
            closed_keys: Vec::new(),
            warnings: Vec::new(),
            error: None,
        };

        if let Err(err) = self.reconcile_and_commit(&mut summary).await {
            error!(error = %err, "persistence failure; run aborted");
            summary.status = RunStatus::Failed;
            summary.error = Some(err.to_string());
        }
        summary.finished_at = Utc::now();

        let audit = match SyncRun::from_summary(&summary) {
            Ok(run) => self.store.record_run(&run).await,
            Err(err) => Err(StoreError::from(err)),
        };
        if let Err(err) = audit {
            error!(error = %err, "writing sync run audit row failed");
            let message = format!("audit write failed: {err}");
            summary.status = RunStatus::Failed;
            summary.error = Some(match summary.error.take() {
                Some(first) => format!("{first}; {message}"),
                None => message,
            });
        }

        if let Err(err) = self.notifier.notify(&summary).await {
            warn!(error = %err, "run notification failed");
            summary.warnings.push(format!("notification failed: {err}"));
        }

        info!(
            status = summary.status.as_str(),
            new = summary.new,
            updated = summary.updated,
            unchanged = summary.unchanged,
            closed = summary.closed,
            warnings = summary.warnings.len(),
            "sync run finished"
        );
        summary
    }

    async fn reconcile_and_commit(&self, summary: &mut RunSummary) -> Result<(), StoreError> {
        let synced_at = summary.started_at;
        let records = self.collect_records(&mut summary.warnings).await;
        let catalog = self.collect_catalog(&mut summary.warnings).await;

        let mut reconciled = reconcile_records(
            records,
            catalog.as_deref().unwrap_or_default(),
            &self.match_config,
            &self.time_rules,
            synced_at,
        );
        if !reconciled.skipped_rows.is_empty() {
            warn!(
                rows = reconciled.skipped_rows.len(),
                "rows with a blank name skipped"
            );
            summary.warnings.push(format!(
                "skipped {} row(s) with a blank name",
                reconciled.skipped_rows.len()
            ));
        }
        for key in &reconciled.dropped_groups {
            warn!(source_key = %key, "group has no usable address; dropped");
            summary
                .warnings
                .push(format!("dropped {key}: no usable address"));
        }

        if catalog.is_none() {
            let retained = self.retain_media(&mut reconciled.stalls).await?;
            if retained > 0 {
                info!(
                    stalls = retained,
                    "media catalog unavailable; persisted media kept"
                );
                summary.warnings.push(format!(
                    "media catalog unavailable; kept persisted media for {retained} stall(s)"
                ));
            }
        }

        let mut fresh = reconciled.stalls;
        if fresh.is_empty() && !self.seed.is_empty() {
            fresh = self
                .seed
                .iter()
                .filter_map(|seed| seed_to_stall(seed, &self.time_rules, synced_at))
                .collect();
            warn!(
                stalls = fresh.len(),
                "no live stalls assembled; using static seed"
            );
            summary.seeded = true;
            summary.warnings.push(format!(
                "live sources yielded no stalls; static seed used ({} stalls)",
                fresh.len()
            ));
        }

        let active = self.store.load_active_index().await?;
        summary.previous_active = active.len();
        let mut changes = classify(&active, fresh);

        let retention = Duration::days(i64::from(self.config.slug_retention_days));
        let slugs = self.store.load_slug_index(synced_at - retention).await?;
        for adjustment in resolve_slugs(&mut changes, &slugs) {
            warn!(
                source_key = %adjustment.source_key,
                base = %adjustment.base,
                assigned = %adjustment.assigned,
                "slug collision resolved"
            );
            summary.slug_adjustments += 1;
            summary.warnings.push(format!(
                "slug {} taken; {} assigned {}",
                adjustment.base, adjustment.source_key, adjustment.assigned
            ));
        }

        summary.fresh_total = changes.fresh_total();
        summary.new = changes.new.len();
        summary.updated = changes.updated.len();
        summary.unchanged = changes.unchanged.len();
        summary.closed = changes.closed.len();
        summary.closed_keys = changes.closed.clone();

        let guardrail = evaluate_guardrail(
            changes.closed.len(),
            active.len(),
            self.config.max_closure_ratio,
            self.config.force_apply,
        );
        summary.closure_ratio = guardrail.ratio;
        summary.guardrail_tripped = guardrail.tripped;
        summary.forced = guardrail.bypassed;

        if self.config.mode == SyncMode::DryRun {
            info!(
                new = summary.new,
                updated = summary.updated,
                closed = summary.closed,
                guardrail_tripped = guardrail.tripped,
                "dry run; nothing written"
            );
            return Ok(());
        }

        if guardrail.blocks_commit() {
            warn!(
                closure_ratio = guardrail.ratio,
                max_closure_ratio = self.config.max_closure_ratio,
                closed = changes.closed.len(),
                previous_active = active.len(),
                "closure guardrail tripped; refusing to write"
            );
            summary.status = RunStatus::Guarded;
            return Ok(());
        }
        if guardrail.bypassed {
            warn!(
                closure_ratio = guardrail.ratio,
                "closure guardrail bypassed by force flag"
            );
        }

        let plan = CommitPlan {
            upserts: changes.new.into_iter().chain(changes.updated).collect(),
            closures: changes.closed,
            synced_at,
        };
        if plan.is_empty() {
            debug!("no changes to commit");
            return Ok(());
        }
        let outcome = self.store.commit(&plan).await?;
        info!(
            stalls_written = outcome.stalls_written,
            locations_written = outcome.locations_written,
            locations_deactivated = outcome.locations_deactivated,
            stalls_closed = outcome.stalls_closed,
            "catalog committed"
        );
        Ok(())
    }

    async fn collect_records(&self, warnings: &mut Vec<String>) -> Vec<SourceRecord> {
        let mut records = Vec::new();
        for source in &self.record_sources {
            match source.fetch_records().await {
                Ok(batch) => {
                    debug!(
                        source_id = source.source_id(),
                        records = batch.len(),
                        "source fetched"
                    );
                    records.extend(batch);
                }
                Err(err) => {
                    warn!(source_id = source.source_id(), error = %err, "source fetch failed");
                    warnings.push(format!("source {} unavailable: {err}", source.source_id()));
                }
            }
        }
        records
    }

    /// `None` when the catalog could not be fetched, as opposed to an empty catalog.
    async fn collect_catalog(&self, warnings: &mut Vec<String>) -> Option<Vec<MediaRecord>> {
        let catalog_id = self.media_catalog.catalog_id();
        match self.media_catalog.fetch_catalog().await {
            Ok(items) => {
                debug!(catalog_id, items = items.len(), "media catalog fetched");
                Some(items)
            }
            Err(err) => {
                warn!(catalog_id, error = %err, "media catalog fetch failed");
                warnings.push(format!("media catalog {catalog_id} unavailable: {err}"));
                None
            }
        }
    }

    /// Keeps stored media on stalls that could not be matched against a catalog.
    async fn retain_media(&self, stalls: &mut [CanonicalStall]) -> Result<usize, StoreError> {
        let mut retained = 0;
        for stall in stalls.iter_mut() {
            if let Some(persisted) = self.store.fetch_stall(&stall.source_key).await? {
                if retain_persisted_media(stall, &persisted) {
                    retained += 1;
                }
            }
        }
        Ok(retained)
    }
}
