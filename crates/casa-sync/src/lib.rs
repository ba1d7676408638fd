//! Snapshot reconciliation: merges a fresh scrape into the persisted store, one platform at a time.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use casa_core::{keyed_listing_id, unkeyed_listing_id, Listing, ListingStatus, RawListing, Timestamp};
use casa_storage::{
    dedup_by_id, decode_rows, load_json_array, CiEnvExporter, PlatformCounters, SnapshotStore,
};
use chrono::{DateTime, Utc};
use indexmap::map::Entry;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "casa-sync";

pub const DEFAULT_MISS_THRESHOLD: u32 = 3;
pub const DEFAULT_RETENTION_DAYS: u32 = 5;
pub const CRITICAL_INVALID_RATIO: f64 = 0.3;

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformRegistry {
    pub platforms: Vec<PlatformConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    pub platform_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub link_must_contain: Option<String>,
    #[serde(default)]
    pub require_description: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl PlatformConfig {
    /// Config for a platform named on the command line but absent from the registry.
    pub fn plain(platform_id: &str) -> Self {
        Self {
            platform_id: platform_id.to_string(),
            display_name: platform_id.to_string(),
            enabled: true,
            link_must_contain: None,
            require_description: false,
        }
    }
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self {
            platforms: vec![
                PlatformConfig {
                    platform_id: "olx".into(),
                    display_name: "OLX".into(),
                    enabled: true,
                    link_must_contain: Some("olx.com.br".into()),
                    require_description: false,
                },
                PlatformConfig {
                    platform_id: "zap".into(),
                    display_name: "ZAP Imóveis".into(),
                    enabled: true,
                    link_must_contain: None,
                    require_description: true,
                },
            ],
        }
    }
}

impl PlatformRegistry {
    /// Reads `platforms.yaml` from the workspace root, falling back to the built-in registry.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("platforms.yaml");
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            debug!(path = %path.display(), "no platform registry file; using built-in platforms");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for platform in &self.platforms {
            let id = platform.platform_id.trim();
            if id.is_empty() {
                return Err(ConfigError::BlankPlatformId);
            }
            if !seen.insert(id) {
                return Err(ConfigError::DuplicatePlatform(id.to_string()));
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &PlatformConfig> {
        self.platforms.iter().filter(|p| p.enabled)
    }

    pub fn resolve(&self, platform_id: &str) -> PlatformConfig {
        self.platforms
            .iter()
            .find(|p| p.platform_id == platform_id)
            .cloned()
            .unwrap_or_else(|| PlatformConfig::plain(platform_id))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("miss threshold must be at least 1")]
    ZeroMissThreshold,
    #[error("platform registry contains a blank platform_id")]
    BlankPlatformId,
    #[error("platform `{0}` is registered more than once")]
    DuplicatePlatform(String),
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub old_results_dir: PathBuf,
    pub new_results_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub miss_threshold: u32,
    pub retention_days: u32,
    pub ci_env_file: Option<PathBuf>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            old_results_dir: PathBuf::from("./data/results"),
            new_results_dir: PathBuf::from("../data/results_new"),
            workspace_root: PathBuf::from("."),
            miss_threshold: DEFAULT_MISS_THRESHOLD,
            retention_days: DEFAULT_RETENTION_DAYS,
            ci_env_file: None,
        }
    }
}

impl MergeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            old_results_dir: std::env::var("CASA_OLD_RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.old_results_dir),
            new_results_dir: std::env::var("CASA_NEW_RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.new_results_dir),
            workspace_root: std::env::var("CASA_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            miss_threshold: std::env::var("CASA_MISS_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.miss_threshold),
            retention_days: std::env::var("CASA_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retention_days),
            ci_env_file: std::env::var("GITHUB_ENV")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn with_paths(self, old_results_dir: impl Into<PathBuf>, new_results_dir: impl Into<PathBuf>) -> Self {
        Self {
            old_results_dir: old_results_dir.into(),
            new_results_dir: new_results_dir.into(),
            ..self
        }
    }

    pub fn policy(&self) -> MergePolicy {
        MergePolicy {
            miss_threshold: self.miss_threshold,
            retention_days: self.retention_days,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.miss_threshold == 0 {
            return Err(ConfigError::ZeroMissThreshold);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    pub miss_threshold: u32,
    pub retention_days: u32,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            miss_threshold: DEFAULT_MISS_THRESHOLD,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub reactivated: usize,
    pub still_missing: usize,
    pub preserved_unkeyed: usize,
    pub purged: usize,
    pub skipped_records: usize,
    pub duplicate_keys: usize,
}

/// Platform-scoped identity used to pair records across two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JoinKey {
    pub platform: String,
    pub match_key: String,
}

/// Rows that can be paired across snapshots. `run_platform` stands in for a
/// missing or blank platform on the row.
pub trait MatchKeyed {
    fn join_key(&self, run_platform: &str) -> Option<JoinKey>;
}

impl MatchKeyed for Listing {
    fn join_key(&self, run_platform: &str) -> Option<JoinKey> {
        let platform = Some(self.platform.as_str())
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(run_platform);
        self.match_key().map(|key| JoinKey {
            platform: platform.to_string(),
            match_key: key.to_string(),
        })
    }
}

impl MatchKeyed for RawListing {
    fn join_key(&self, run_platform: &str) -> Option<JoinKey> {
        let platform = self
            .platform
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(run_platform);
        self.match_key().map(|key| JoinKey {
            platform: platform.to_string(),
            match_key: key.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct Partition<T> {
    pub keyed: Vec<(JoinKey, T)>,
    pub unkeyed: Vec<T>,
}

pub fn partition<T: MatchKeyed>(rows: Vec<T>, run_platform: &str) -> Partition<T> {
    let mut keyed = Vec::new();
    let mut unkeyed = Vec::new();
    for row in rows {
        match row.join_key(run_platform) {
            Some(key) => keyed.push((key, row)),
            None => unkeyed.push(row),
        }
    }
    Partition { keyed, unkeyed }
}

#[derive(Debug)]
pub enum Pairing<O, N> {
    Added { key: JoinKey, new: N },
    Missing(O),
    Updated { old: O, new: N },
}

#[derive(Debug)]
pub struct JoinOutcome<O, N> {
    pub pairings: Vec<Pairing<O, N>>,
    pub duplicate_keys: usize,
}

/// Map-based full outer join. Old keys come out in old order, then new-only keys in new
/// order. The first record seen for a key on either side wins.
pub fn full_outer_join<O, N>(old: Vec<(JoinKey, O)>, new: Vec<(JoinKey, N)>) -> JoinOutcome<O, N> {
    let mut slots: IndexMap<JoinKey, (Option<O>, Option<N>)> = IndexMap::with_capacity(old.len());
    let mut duplicate_keys = 0usize;

    for (key, record) in old {
        match slots.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert((Some(record), None));
            }
            Entry::Occupied(slot) => {
                warn!(match_key = %slot.key().match_key, "dropping duplicate persisted listing");
                duplicate_keys += 1;
            }
        }
    }

    for (key, record) in new {
        match slots.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert((None, Some(record)));
            }
            Entry::Occupied(mut slot) => {
                if slot.get().1.is_some() {
                    warn!(match_key = %slot.key().match_key, "ignoring duplicate scraped listing");
                    duplicate_keys += 1;
                } else {
                    slot.get_mut().1 = Some(record);
                }
            }
        }
    }

    let pairings = slots
        .into_iter()
        .filter_map(|(key, pair)| match pair {
            (Some(old), Some(new)) => Some(Pairing::Updated { old, new }),
            (Some(old), None) => Some(Pairing::Missing(old)),
            (None, Some(new)) => Some(Pairing::Added { key, new }),
            (None, None) => None,
        })
        .collect();

    JoinOutcome {
        pairings,
        duplicate_keys,
    }
}

/// Applies the per-classification state transitions for one run.
pub struct LifecycleUpdater {
    platform: String,
    policy: MergePolicy,
    now: Timestamp,
    taken_ids: HashSet<String>,
    stats: MergeStats,
}

impl LifecycleUpdater {
    pub fn new(platform: &str, policy: MergePolicy, now: DateTime<Utc>) -> Self {
        Self {
            platform: platform.to_string(),
            policy,
            now: Timestamp::from_datetime(now),
            taken_ids: HashSet::new(),
            stats: MergeStats::default(),
        }
    }

    /// Ids already owned by persisted records; a created record never reuses one.
    pub fn reserve_ids<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        self.taken_ids.extend(ids.into_iter().map(str::to_string));
    }

    pub fn apply(&mut self, pairing: Pairing<Listing, RawListing>) -> Listing {
        match pairing {
            Pairing::Added { key, new } => {
                let id = keyed_listing_id(&key.platform, &key.match_key);
                self.create(new, id)
            }
            Pairing::Updated { old, new } => self.refresh(old, new),
            Pairing::Missing(old) => self.carry_missing(old),
        }
    }

    pub fn create(&mut self, raw: RawListing, id: String) -> Listing {
        let id = self.claim_id(id);
        self.stats.added += 1;
        Listing::first_observation(raw, id, &self.platform, &self.now)
    }

    pub fn create_unkeyed(&mut self, raw: RawListing, index: usize) -> Listing {
        let id = self.unkeyed_id(&raw, index);
        self.create(raw, id)
    }

    pub fn refresh(&mut self, mut old: Listing, new: RawListing) -> Listing {
        if old.status == ListingStatus::Removed {
            self.stats.reactivated += 1;
            info!(id = %old.id, link = ?old.link, "listing reappeared; reactivating");
        }
        self.stats.updated += 1;
        old.overlay(new);
        old.last_seen_at = Some(self.now.clone());
        old.consecutive_misses = 0;
        old.status = ListingStatus::Updated;
        old
    }

    pub fn carry_missing(&mut self, mut old: Listing) -> Listing {
        old.consecutive_misses = old.consecutive_misses.saturating_add(1);
        if old.status != ListingStatus::Removed {
            if old.consecutive_misses >= self.policy.miss_threshold {
                old.status = ListingStatus::Removed;
                self.stats.removed += 1;
                info!(
                    id = %old.id,
                    link = ?old.link,
                    misses = old.consecutive_misses,
                    "listing marked removed"
                );
            } else {
                self.stats.still_missing += 1;
                debug!(
                    id = %old.id,
                    misses = old.consecutive_misses,
                    threshold = self.policy.miss_threshold,
                    "listing still missing"
                );
            }
        }
        old
    }

    pub fn into_stats(self) -> MergeStats {
        self.stats
    }

    /// Returns `id` if it is free, otherwise the first free `id#n` derivative.
    fn claim_id(&mut self, id: String) -> String {
        if self.taken_ids.insert(id.clone()) {
            return id;
        }
        let mut attempt = 1usize;
        loop {
            let candidate = keyed_listing_id(&self.platform, &format!("{id}#{attempt}"));
            if self.taken_ids.insert(candidate.clone()) {
                warn!(clashing = %id, id = %candidate, "new listing id already in use; minted another");
                return candidate;
            }
            attempt += 1;
        }
    }

    fn unkeyed_id(&self, raw: &RawListing, index: usize) -> String {
        let fingerprint = serde_json::to_string(raw).unwrap_or_default();
        unkeyed_listing_id(&self.platform, &self.now, index, &fingerprint)
    }
}

/// Whole days since `then`, rounded up.
fn elapsed_days_ceil(now: DateTime<Utc>, then: DateTime<Utc>) -> i64 {
    let millis = (now - then).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        (millis + DAY_MILLIS - 1) / DAY_MILLIS
    }
}

/// True for a `removed` listing last seen more than `retention_days` ago.
/// Listings without a readable `lastSeenAt` never expire.
pub fn is_expired(listing: &Listing, now: DateTime<Utc>, retention_days: u32) -> bool {
    if listing.status != ListingStatus::Removed {
        return false;
    }
    let Some(last_seen) = listing.last_seen_at.as_ref().and_then(Timestamp::to_datetime) else {
        return false;
    };
    elapsed_days_ceil(now, last_seen) > i64::from(retention_days)
}

pub fn purge_removed(
    listings: Vec<Listing>,
    now: DateTime<Utc>,
    retention_days: u32,
) -> (Vec<Listing>, usize) {
    let before = listings.len();
    let kept: Vec<Listing> = listings
        .into_iter()
        .filter(|listing| {
            let expired = is_expired(listing, now, retention_days);
            if expired {
                debug!(id = %listing.id, "purging expired removed listing");
            }
            !expired
        })
        .collect();
    let purged = before - kept.len();
    (kept, purged)
}

#[derive(Debug)]
pub struct Reconciled {
    pub listings: Vec<Listing>,
    pub stats: MergeStats,
}

/// The full reconcile step for one platform: partition, join, lifecycle, purge.
pub fn reconcile(
    platform: &str,
    old: Vec<Listing>,
    new: Vec<RawListing>,
    policy: MergePolicy,
    now: DateTime<Utc>,
) -> Reconciled {
    let mut updater = LifecycleUpdater::new(platform, policy, now);
    updater.reserve_ids(old.iter().map(|listing| listing.id.as_str()));

    let old = partition(old, platform);
    let new = partition(new, platform);

    let mut merged = Vec::with_capacity(old.keyed.len() + old.unkeyed.len() + new.keyed.len() + new.unkeyed.len());
    let preserved_unkeyed = old.unkeyed.len();
    merged.extend(old.unkeyed);

    for (index, raw) in new.unkeyed.into_iter().enumerate() {
        merged.push(updater.create_unkeyed(raw, index));
    }

    if new.keyed.is_empty() && !old.keyed.is_empty() {
        warn!(
            platform,
            persisted = old.keyed.len(),
            "scrape returned no keyed listings; every persisted listing counts as a miss"
        );
    }

    let joined = full_outer_join(old.keyed, new.keyed);
    for pairing in joined.pairings {
        merged.push(updater.apply(pairing));
    }

    let mut stats = updater.into_stats();
    stats.preserved_unkeyed = preserved_unkeyed;
    stats.duplicate_keys = joined.duplicate_keys;

    let (listings, purged) = purge_removed(merged, now, policy.retention_days);
    stats.purged = purged;

    Reconciled { listings, stats }
}

/// Lifts persisted rows, minting an id for legacy rows written without one.
pub fn lift_persisted(rows: Vec<RawListing>, platform: &str, now: DateTime<Utc>) -> Vec<Listing> {
    let seen_at = Timestamp::from_datetime(now);
    rows.into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let needs_id = raw.id.as_deref().map_or(true, |id| id.trim().is_empty());
            let fallback = needs_id.then(|| {
                let row_platform = raw
                    .platform
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or(platform);
                match raw.match_key() {
                    Some(key) => keyed_listing_id(row_platform, key),
                    None => unkeyed_listing_id(
                        row_platform,
                        &seen_at,
                        index,
                        &serde_json::to_string(&raw).unwrap_or_default(),
                    ),
                }
            });
            if let Some(id) = &fallback {
                warn!(platform, index, id = %id, "persisted listing had no id; assigned one");
            }
            Listing::from_persisted(raw, platform, || fallback.unwrap_or_default())
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformSummary {
    pub platform: String,
    pub loaded_old: usize,
    pub loaded_new: usize,
    pub total: usize,
    pub stats: MergeStats,
    pub snapshot_path: String,
}

impl PlatformSummary {
    pub fn counters(&self) -> PlatformCounters {
        PlatformCounters {
            added: self.stats.added,
            updated: self.stats.updated,
            removed: self.stats.removed,
            total: self.total,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub platforms: Vec<PlatformSummary>,
}

pub struct MergePipeline {
    config: MergeConfig,
    registry: PlatformRegistry,
    old_store: SnapshotStore,
    new_store: SnapshotStore,
    ci_env: Option<CiEnvExporter>,
}

impl MergePipeline {
    pub fn new(config: MergeConfig, registry: PlatformRegistry) -> Result<Self> {
        config.validate().context("validating merge config")?;
        registry.validate().context("validating platform registry")?;
        let old_store = SnapshotStore::new(config.old_results_dir.clone());
        let new_store = SnapshotStore::new(config.new_results_dir.clone());
        let ci_env = config.ci_env_file.clone().map(CiEnvExporter::new);
        Ok(Self {
            config,
            registry,
            old_store,
            new_store,
            ci_env,
        })
    }

    pub async fn run_once(&self) -> Result<MergeRunSummary> {
        let ids: Vec<String> = self.registry.enabled().map(|p| p.platform_id.clone()).collect();
        self.run_platforms(&ids).await
    }

    /// Merges each named platform in order; the first write failure aborts the run.
    pub async fn run_platforms(&self, platform_ids: &[String]) -> Result<MergeRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, platforms = platform_ids.len(), "starting merge run");

        let mut platforms = Vec::with_capacity(platform_ids.len());
        for platform in platform_ids {
            platforms.push(self.run_platform(platform).await?);
        }

        Ok(MergeRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            platforms,
        })
    }

    pub async fn run_platform(&self, platform: &str) -> Result<PlatformSummary> {
        self.run_platform_at(platform, Utc::now()).await
    }

    pub async fn run_platform_at(&self, platform: &str, now: DateTime<Utc>) -> Result<PlatformSummary> {
        self.merge_platform(platform, now)
            .instrument(info_span!("merge", platform))
            .await
    }

    async fn merge_platform(&self, platform: &str, now: DateTime<Utc>) -> Result<PlatformSummary> {
        info!(path = %self.old_store.path_for(platform).display(), "loading persisted listings");
        let old = self.old_store.load(platform).await;
        info!(path = %self.new_store.path_for(platform).display(), "loading scraped listings");
        let new = self.new_store.load(platform).await;

        let loaded_old = old.rows.len();
        let loaded_new = new.rows.len();
        let skipped_records = old.skipped + new.skipped;
        info!(loaded_old, loaded_new, skipped_records, "snapshots loaded");

        let old_listings = lift_persisted(old.rows, platform, now);
        let Reconciled { listings, mut stats } =
            reconcile(platform, old_listings, new.rows, self.config.policy(), now);
        stats.skipped_records = skipped_records;

        let listings = dedup_by_id(listings);
        let stored = self
            .old_store
            .write_snapshot(platform, &listings)
            .await
            .with_context(|| format!("writing merged snapshot for {platform}"))?;

        let summary = PlatformSummary {
            platform: platform.to_string(),
            loaded_old,
            loaded_new,
            total: listings.len(),
            stats,
            snapshot_path: stored.path.display().to_string(),
        };

        info!(
            added = summary.stats.added,
            updated = summary.stats.updated,
            removed = summary.stats.removed,
            reactivated = summary.stats.reactivated,
            still_missing = summary.stats.still_missing,
            preserved_unkeyed = summary.stats.preserved_unkeyed,
            purged = summary.stats.purged,
            total = summary.total,
            "merge complete"
        );

        if let Some(exporter) = &self.ci_env {
            if let Err(err) = exporter.append(platform, summary.counters()).await {
                warn!(path = %exporter.path().display(), error = %err, "CI counter export failed");
            }
        }

        Ok(summary)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidListing {
    pub id: String,
    pub address: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub timestamp: Timestamp,
    pub platform: String,
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub error_summary: BTreeMap<String, usize>,
    pub invalid_properties: Vec<InvalidListing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub platform: String,
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub error_summary: BTreeMap<String, usize>,
    pub report_path: String,
}

impl ValidationSummary {
    pub fn invalid_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.invalid as f64 / self.total as f64
        }
    }

    pub fn is_critical(&self) -> bool {
        self.total > 0 && self.invalid_ratio() > CRITICAL_INVALID_RATIO
    }
}

pub fn validate_listing(row: &RawListing, platform: &PlatformConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if row.address.as_deref().map_or(true, |a| a.trim().is_empty()) {
        errors.push("missing or blank address".to_string());
    }
    if row.price.as_deref().map_or(true, str::is_empty) {
        errors.push("missing or invalid price".to_string());
    }
    if let Some(needle) = &platform.link_must_contain {
        if !row.link.as_deref().is_some_and(|link| link.contains(needle.as_str())) {
            errors.push(format!("invalid {} link", platform.platform_id));
        }
    }
    if platform.require_description && row.description.is_none() {
        errors.push("invalid description".to_string());
    }

    match &row.images {
        None => errors.push("invalid image list".to_string()),
        Some(images) if images.is_empty() => errors.push("no images found".to_string()),
        Some(images) => {
            for (index, image) in images.iter().enumerate() {
                if !image.starts_with("http") {
                    errors.push(format!("image {} has an invalid URL", index + 1));
                }
            }
        }
    }

    errors
}

/// Validates the scraper output for one platform and writes `<platform>ValidationReport.json`
/// next to it.
pub async fn validate_platform(
    config: &MergeConfig,
    platform: &PlatformConfig,
    now: DateTime<Utc>,
) -> Result<ValidationSummary> {
    let store = SnapshotStore::new(config.new_results_dir.clone());
    let path = store.path_for(&platform.platform_id);
    let rows = load_json_array(&path).await;

    let mut report = ValidationReport {
        timestamp: Timestamp::from_datetime(now),
        platform: platform.platform_id.clone(),
        total: rows.len(),
        valid: 0,
        invalid: 0,
        error_summary: BTreeMap::new(),
        invalid_properties: Vec::new(),
    };

    for row in rows {
        let decoded = decode_rows(&path, vec![row]);
        let (errors, id, address) = match decoded.rows.into_iter().next() {
            Some(raw) => (
                validate_listing(&raw, platform),
                raw.id.clone().unwrap_or_else(|| "unknown".into()),
                raw.address.clone().unwrap_or_else(|| "unknown".into()),
            ),
            None => (
                vec!["malformed listing row".to_string()],
                "unknown".to_string(),
                "unknown".to_string(),
            ),
        };

        if errors.is_empty() {
            report.valid += 1;
            continue;
        }
        report.invalid += 1;
        for error in &errors {
            *report.error_summary.entry(error.clone()).or_default() += 1;
        }
        report.invalid_properties.push(InvalidListing { id, address, errors });
    }

    fs::create_dir_all(store.root())
        .await
        .with_context(|| format!("creating {}", store.root().display()))?;
    let report_path = store
        .root()
        .join(format!("{}ValidationReport.json", platform.platform_id));
    let bytes = serde_json::to_vec_pretty(&report).context("serializing validation report")?;
    fs::write(&report_path, bytes)
        .await
        .with_context(|| format!("writing {}", report_path.display()))?;

    info!(
        platform = %platform.platform_id,
        total = report.total,
        valid = report.valid,
        invalid = report.invalid,
        "validation complete"
    );

    Ok(ValidationSummary {
        platform: report.platform,
        total: report.total,
        valid: report.valid,
        invalid: report.invalid,
        error_summary: report.error_summary,
        report_path: report_path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single().expect("ts")
    }

    fn raw(value: serde_json::Value) -> RawListing {
        serde_json::from_value(value).expect("raw listing")
    }

    fn persisted(value: serde_json::Value) -> Listing {
        Listing::from_persisted(raw(value), "olx", || "prop_fallback".to_string())
    }

    fn find<'a>(listings: &'a [Listing], id: &str) -> Option<&'a Listing> {
        listings.iter().find(|l| l.id == id)
    }

    #[test]
    fn matched_listing_keeps_identity_and_refreshes_fields() {
        let now = at(2025, 4, 15);
        let old = vec![persisted(json!({
            "id": "p1",
            "link": "L1",
            "price": "250000",
            "firstSeenAt": "2023-01-01",
            "scrapedAt": "T0",
            "description": [{"area": "90m2"}]
        }))];
        let new = vec![raw(json!({"id": "bogus", "link": "L1", "price": "300000", "scrapedAt": "T1"}))];

        let out = reconcile("olx", old, new, MergePolicy::default(), now);
        assert_eq!(out.listings.len(), 1);
        let listing = &out.listings[0];
        assert_eq!(listing.id, "p1");
        assert_eq!(listing.price.as_deref(), Some("300000"));
        assert_eq!(listing.first_seen_at, Some(Timestamp::new("2023-01-01")));
        assert_eq!(listing.scraped_at, Some(Timestamp::new("T0")));
        assert_eq!(listing.last_seen_at, Some(Timestamp::from_datetime(now)));
        assert_eq!(listing.status, ListingStatus::Updated);
        assert_eq!(listing.consecutive_misses, 0);
        assert_eq!(listing.description, vec![json!({"area": "90m2"})]);
        assert_eq!(out.stats.updated, 1);
    }

    #[test]
    fn third_consecutive_miss_marks_removed() {
        let old = vec![
            persisted(json!({"id": "p1", "link": "L1", "status": "updated", "consecutiveMisses": 0})),
            persisted(json!({"id": "p2", "link": "L2", "status": "updated", "consecutiveMisses": 2})),
        ];
        let new = vec![raw(json!({"link": "L1", "price": "300000"}))];

        let out = reconcile("olx", old, new, MergePolicy::default(), at(2025, 4, 15));
        let gone = find(&out.listings, "p2").expect("p2 kept");
        assert_eq!(gone.consecutive_misses, 3);
        assert_eq!(gone.status, ListingStatus::Removed);
        let kept = find(&out.listings, "p1").expect("p1 kept");
        assert_eq!(kept.status, ListingStatus::Updated);
        assert_eq!(out.stats.removed, 1);
    }

    #[test]
    fn misses_below_threshold_keep_prior_status() {
        let old = vec![persisted(json!({"id": "p1", "link": "L1", "status": "added", "consecutiveMisses": 1}))];
        let out = reconcile("olx", old, vec![], MergePolicy::default(), at(2025, 4, 15));
        assert_eq!(out.listings[0].status, ListingStatus::Added);
        assert_eq!(out.listings[0].consecutive_misses, 2);
        assert_eq!(out.stats.still_missing, 1);
    }

    #[test]
    fn missing_listing_keeps_last_seen() {
        let old = vec![persisted(json!({"id": "p1", "link": "L1", "lastSeenAt": "2025-04-10T00:00:00.000Z"}))];
        let out = reconcile("olx", old, vec![], MergePolicy::default(), at(2025, 4, 15));
        assert_eq!(
            out.listings[0].last_seen_at,
            Some(Timestamp::new("2025-04-10T00:00:00.000Z"))
        );
    }

    #[test]
    fn removed_listing_reactivates_on_reappearance() {
        let old = vec![persisted(json!({
            "id": "p1",
            "link": "L1",
            "status": "removed",
            "consecutiveMisses": 4,
            "lastSeenAt": "2025-04-12T00:00:00.000Z"
        }))];
        let out = reconcile("olx", old, vec![raw(json!({"link": "L1"}))], MergePolicy::default(), at(2025, 4, 15));
        assert_eq!(out.listings[0].status, ListingStatus::Updated);
        assert_eq!(out.listings[0].consecutive_misses, 0);
        assert_eq!(out.stats.reactivated, 1);
        assert_eq!(out.stats.updated, 1);
    }

    #[test]
    fn removed_listing_stays_removed_while_missing() {
        let old = vec![persisted(json!({
            "id": "p1",
            "link": "L1",
            "status": "removed",
            "consecutiveMisses": 3,
            "lastSeenAt": "2025-04-14T00:00:00.000Z"
        }))];
        let out = reconcile("olx", old, vec![], MergePolicy::default(), at(2025, 4, 15));
        assert_eq!(out.listings[0].status, ListingStatus::Removed);
        assert_eq!(out.listings[0].consecutive_misses, 4);
        assert_eq!(out.stats.removed, 0);
    }

    #[test]
    fn retention_boundary_is_inclusive() {
        let now = at(2025, 5, 30);
        let listing = |last_seen: &str| {
            persisted(json!({"id": "p", "link": "L", "status": "removed", "lastSeenAt": last_seen}))
        };
        assert!(!is_expired(&listing("2025-05-25T00:00:00.000Z"), now, 5));
        assert!(is_expired(&listing("2025-05-24T00:00:00.000Z"), now, 5));
        assert!(is_expired(&listing("2025-05-24T23:00:00.000Z"), now, 5));
        assert!(!is_expired(&listing("not a date"), now, 5));

        let active = persisted(json!({"id": "a", "link": "A", "status": "updated", "lastSeenAt": "2020-01-01"}));
        assert!(!is_expired(&active, now, 5));
    }

    #[test]
    fn purge_is_idempotent() {
        let now = at(2025, 5, 30);
        let listings = vec![
            persisted(json!({"id": "keep", "link": "K", "status": "removed", "lastSeenAt": "2025-05-26"})),
            persisted(json!({"id": "drop", "link": "D", "status": "removed", "lastSeenAt": "2025-05-20"})),
            persisted(json!({"id": "unknown", "link": "U", "status": "removed"})),
        ];
        let (once, purged) = purge_removed(listings, now, 5);
        assert_eq!(purged, 1);
        let (twice, purged_again) = purge_removed(once.clone(), now, 5);
        assert_eq!(purged_again, 0);
        assert_eq!(once, twice);
        assert!(find(&twice, "drop").is_none());
        assert!(find(&twice, "unknown").is_some());
    }

    #[test]
    fn unkeyed_listings_are_never_matched() {
        let now = at(2025, 4, 15);
        let old = vec![persisted(json!({"id": "u1", "price": "450000", "consecutiveMisses": 0}))];
        let new = vec![raw(json!({"price": "450000"}))];

        let out = reconcile("olx", old, new, MergePolicy::default(), now);
        assert_eq!(out.listings.len(), 2);
        let carried = find(&out.listings, "u1").expect("carried");
        assert_eq!(carried.consecutive_misses, 0);
        let fresh = out.listings.iter().find(|l| l.id != "u1").expect("fresh");
        assert_eq!(fresh.status, ListingStatus::Added);
        assert_eq!(out.stats.preserved_unkeyed, 1);
        assert_eq!(out.stats.added, 1);
    }

    #[test]
    fn image_url_is_the_fallback_match_key() {
        let old = vec![persisted(json!({"id": "p1", "images": ["https://img/1.jpg"], "price": "1"}))];
        let new = vec![raw(json!({"link": "", "images": ["https://img/1.jpg"], "price": "2"}))];
        let out = reconcile("olx", old, new, MergePolicy::default(), at(2025, 4, 15));
        assert_eq!(out.listings.len(), 1);
        assert_eq!(out.listings[0].id, "p1");
        assert_eq!(out.listings[0].price.as_deref(), Some("2"));
    }

    #[test]
    fn duplicate_keys_keep_first_occurrence() {
        let old = vec![
            persisted(json!({"id": "p1", "link": "L1", "price": "1"})),
            persisted(json!({"id": "p1-dup", "link": "L1", "price": "9"})),
        ];
        let new = vec![
            raw(json!({"link": "L1", "price": "2"})),
            raw(json!({"link": "L1", "price": "3"})),
        ];
        let out = reconcile("olx", old, new, MergePolicy::default(), at(2025, 4, 15));
        assert_eq!(out.listings.len(), 1);
        assert_eq!(out.listings[0].id, "p1");
        assert_eq!(out.listings[0].price.as_deref(), Some("2"));
        assert_eq!(out.stats.duplicate_keys, 2);
    }

    #[test]
    fn join_orders_old_keys_then_new_only_keys() {
        let key = |k: &str| JoinKey {
            platform: "olx".into(),
            match_key: k.into(),
        };
        let joined = full_outer_join(
            vec![(key("b"), "old-b"), (key("a"), "old-a")],
            vec![(key("c"), "new-c"), (key("a"), "new-a")],
        );
        let shape: Vec<String> = joined
            .pairings
            .iter()
            .map(|p| match p {
                Pairing::Added { new, .. } => format!("added:{new}"),
                Pairing::Missing(o) => format!("missing:{o}"),
                Pairing::Updated { old, new } => format!("updated:{old}/{new}"),
            })
            .collect();
        assert_eq!(shape, vec!["missing:old-b", "updated:old-a/new-a", "added:new-c"]);
    }

    #[test]
    fn added_ids_are_stable_for_retries() {
        let now = at(2025, 4, 15);
        let new = vec![raw(json!({"link": "L1"})), raw(json!({"price": "1"}))];
        let first = reconcile("olx", vec![], new.clone(), MergePolicy::default(), now);
        let second = reconcile("olx", vec![], new, MergePolicy::default(), now);
        assert_eq!(first.listings, second.listings);
        assert_eq!(first.listings.len(), 2);
        assert_ne!(first.listings[0].id, first.listings[1].id);
    }

    #[test]
    fn added_listing_with_foreign_platform_spelling_leaves_persisted_record_alone() {
        let persisted_id = keyed_listing_id("olx", "L1");
        let old = vec![persisted(json!({
            "id": persisted_id,
            "link": "L1",
            "platform": "olx",
            "firstSeenAt": "2023-01-01"
        }))];
        let new = vec![raw(json!({"link": "L1", "platform": "OLX"}))];

        let out = reconcile("olx", old, new, MergePolicy::default(), at(2025, 4, 15));
        assert_eq!(out.listings.len(), 2);
        let kept = find(&out.listings, &persisted_id).expect("persisted record kept");
        assert_eq!(kept.first_seen_at, Some(Timestamp::new("2023-01-01")));
        assert_eq!(kept.consecutive_misses, 1);
        let added = out
            .listings
            .iter()
            .find(|l| l.status == ListingStatus::Added)
            .expect("added");
        assert_eq!(added.id, keyed_listing_id("OLX", "L1"));
    }

    #[test]
    fn added_id_clashing_with_persisted_id_is_reminted() {
        let clashing = keyed_listing_id("olx", "L2");
        let old = vec![persisted(json!({
            "id": clashing,
            "link": "L9",
            "firstSeenAt": "2023-01-01"
        }))];
        let new = vec![raw(json!({"link": "L2"}))];

        let first = reconcile("olx", old.clone(), new.clone(), MergePolicy::default(), at(2025, 4, 15));
        assert_eq!(first.listings.len(), 2);
        let kept = find(&first.listings, &clashing).expect("persisted record kept");
        assert_eq!(kept.link.as_deref(), Some("L9"));
        assert_eq!(kept.first_seen_at, Some(Timestamp::new("2023-01-01")));
        let added = first
            .listings
            .iter()
            .find(|l| l.link.as_deref() == Some("L2"))
            .expect("added");
        assert_ne!(added.id, clashing);

        let retried = reconcile("olx", old, new, MergePolicy::default(), at(2025, 4, 15));
        assert_eq!(first.listings, retried.listings);
    }

    #[test]
    fn rows_without_platform_are_keyed_under_the_run_platform() {
        let parts = partition(vec![raw(json!({"link": "L1"})), raw(json!({"price": "1"}))], "zap");
        assert_eq!(parts.keyed.len(), 1);
        assert_eq!(parts.keyed[0].0.platform, "zap");
        assert_eq!(parts.keyed[0].0.match_key, "L1");
        assert_eq!(parts.unkeyed.len(), 1);
    }

    #[test]
    fn empty_coords_survive_miss_and_match() {
        let now = at(2025, 4, 15);
        let old = vec![
            persisted(json!({"id": "p1", "link": "L1", "coords": {}, "firstSeenAt": "2023-01-01"})),
            persisted(json!({"id": "p2", "link": "L2", "coords": {}})),
        ];
        let new = vec![raw(json!({"link": "L1", "price": "9"}))];

        let out = reconcile("olx", old, new, MergePolicy::default(), now);
        let matched = find(&out.listings, "p1").expect("matched");
        assert_eq!(matched.status, ListingStatus::Updated);
        assert_eq!(matched.first_seen_at, Some(Timestamp::new("2023-01-01")));
        assert_eq!(matched.extra.get("coords"), Some(&json!({})));
        let missed = find(&out.listings, "p2").expect("missed");
        assert_eq!(missed.consecutive_misses, 1);
        assert_eq!(missed.extra.get("coords"), Some(&json!({})));
    }

    #[test]
    fn legacy_rows_without_id_are_assigned_one() {
        let rows = vec![raw(json!({"link": "L1"})), raw(json!({"id": "p2", "link": "L2"}))];
        let lifted = lift_persisted(rows, "olx", at(2025, 4, 15));
        assert_eq!(lifted[0].id, keyed_listing_id("olx", "L1"));
        assert_eq!(lifted[1].id, "p2");
    }

    #[test]
    fn config_rejects_zero_threshold() {
        let config = MergeConfig {
            miss_threshold: 0,
            ..MergeConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroMissThreshold));
    }

    #[test]
    fn with_paths_overrides_only_directories() {
        let config = MergeConfig {
            retention_days: 9,
            ..MergeConfig::default()
        }
        .with_paths("/tmp/old", "/tmp/new");
        assert_eq!(config.old_results_dir, PathBuf::from("/tmp/old"));
        assert_eq!(config.new_results_dir, PathBuf::from("/tmp/new"));
        assert_eq!(config.retention_days, 9);
    }

    #[test]
    fn registry_rejects_duplicates_and_resolves_unknown_platforms() {
        let registry: PlatformRegistry = serde_yaml::from_str(
            "platforms:\n  - platform_id: olx\n  - platform_id: olx\n",
        )
        .expect("yaml");
        assert_eq!(
            registry.validate(),
            Err(ConfigError::DuplicatePlatform("olx".into()))
        );

        let defaults = PlatformRegistry::default();
        assert_eq!(defaults.enabled().count(), 2);
        assert_eq!(
            defaults.resolve("olx").link_must_contain.as_deref(),
            Some("olx.com.br")
        );
        assert!(defaults.resolve("vivareal").link_must_contain.is_none());
    }

    #[test]
    fn validation_rules_follow_platform_config() {
        let registry = PlatformRegistry::default();
        let olx = registry.resolve("olx");
        let zap = registry.resolve("zap");

        let good = raw(json!({
            "address": "Rua A, 1",
            "price": "R$ 1.000",
            "link": "https://sp.olx.com.br/item/1",
            "images": ["https://img/1.jpg"]
        }));
        assert!(validate_listing(&good, &olx).is_empty());
        assert_eq!(validate_listing(&good, &zap), vec!["invalid description".to_string()]);

        let bad = raw(json!({"address": " ", "link": "https://other.test", "images": ["ftp://x", "https://y"]}));
        assert_eq!(
            validate_listing(&bad, &olx),
            vec![
                "missing or blank address".to_string(),
                "missing or invalid price".to_string(),
                "invalid olx link".to_string(),
                "image 1 has an invalid URL".to_string(),
            ]
        );
    }
}
