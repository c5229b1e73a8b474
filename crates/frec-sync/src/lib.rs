//! Finding reconciliation engine: matcher, sync partitioning, and the
//! bounded-concurrency history enrichment that must run before matching.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use frec_core::{Finding, ProjectScope};
use frec_source::{parse_findings, FindingSource, RecordShape};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "frec-sync";

/// Minimum similarity score for an approximate match. Need at least 7 / 9.
pub const APPROX_MATCH_THRESHOLD: u8 = 7;

/// Rules whose findings shift lines easily; for these, matching also compares
/// the text-range start offset when both sides carry one.
const OFFSET_SENSITIVE_RULES: &[&str] = &["python:S6540"];

/// Waivers for individual match dimensions. All off by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOptions {
    pub ignore_component: bool,
    pub ignore_message: bool,
    pub ignore_line: bool,
    pub ignore_author: bool,
    pub ignore_type: bool,
    pub ignore_severity: bool,
}

/// Strict identity between two findings.
///
/// An identical key short-circuits to true. Otherwise rule, hash, message
/// and file path must all match, and the raw component too unless waived.
pub fn strictly_identical(a: &Finding, b: &Finding, options: &MatchOptions) -> bool {
    if a.key == b.key {
        return true;
    }
    let mut offset_check = true;
    if a.rule
        .as_deref()
        .is_some_and(|rule| OFFSET_SENSITIVE_RULES.contains(&rule))
    {
        if let (Some(range_a), Some(range_b)) = (&a.text_range, &b.text_range) {
            offset_check = range_a.start_offset == range_b.start_offset;
        }
    }
    a.rule == b.rule
        && a.hash == b.hash
        && a.message == b.message
        && a.file() == b.file()
        && (a.component == b.component || options.ignore_component)
        && offset_check
}

/// Weighted similarity between two findings, out of 9 points.
///
/// Rule and hash equality is a hard gate: any pair differing in either
/// scores 0 regardless of the other dimensions. Waivers award the points
/// of their dimension unconditionally, so they can only raise the score.
pub fn similarity_score(a: &Finding, b: &Finding, options: &MatchOptions) -> u8 {
    if a.rule != b.rule || a.hash != b.hash {
        return 0;
    }
    let mut score = 0u8;
    if a.message == b.message || options.ignore_message {
        score += 2;
    }
    if a.file() == b.file() {
        score += 2;
    }
    if a.line == b.line || options.ignore_line {
        score += 1;
    }
    if a.component == b.component || options.ignore_component {
        score += 1;
    }
    if a.author == b.author || options.ignore_author {
        score += 1;
    }
    if a.finding_type == b.finding_type || options.ignore_type {
        score += 1;
    }
    if a.severity == b.severity || options.ignore_severity {
        score += 1;
    }
    score
}

pub fn almost_identical(a: &Finding, b: &Finding, options: &MatchOptions) -> bool {
    similarity_score(a, b, options) >= APPROX_MATCH_THRESHOLD
}

/// Why a structural match cannot be synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictReason {
    /// The target carries manual history and no sync allowlist was given.
    ManualHistory,
    /// The target was modified by accounts outside the sync allowlist.
    UnknownModifiers(Vec<String>),
}

#[derive(Debug)]
pub struct ApproxMatch<'a> {
    pub finding: &'a Finding,
    pub score: u8,
}

#[derive(Debug)]
pub struct ConflictedMatch<'a> {
    pub finding: &'a Finding,
    pub reason: ConflictReason,
}

/// Outcome of one sibling search, partitioned by match kind and sync
/// eligibility. Ordering inside each list follows scan order.
#[derive(Debug, Default)]
pub struct SiblingSearch<'a> {
    pub exact: Vec<&'a Finding>,
    pub approximate: Vec<ApproxMatch<'a>>,
    pub conflicting: Vec<ConflictedMatch<'a>>,
}

fn conflict_reason(finding: &Finding, allowed_users: Option<&[String]>) -> ConflictReason {
    match allowed_users {
        None | Some([]) => ConflictReason::ManualHistory,
        Some(users) => ConflictReason::UnknownModifiers(
            finding
                .modifiers()
                .into_iter()
                .filter(|modifier| !users.contains(modifier))
                .collect(),
        ),
    }
}

/// Search a candidate population for siblings of `finding`.
///
/// The exact pass returns on the first strictly identical candidate, so at
/// most one exact match is ever reported and the approximate pass only runs
/// when none was found. The population must already be enriched: an
/// un-enriched candidate looks untouched and is silently classified as
/// synchronizable.
pub fn search_siblings<'a>(
    finding: &Finding,
    population: &'a [Finding],
    allowed_users: Option<&[String]>,
    options: &MatchOptions,
) -> SiblingSearch<'a> {
    let mut search = SiblingSearch::default();

    debug!(key = %finding.key, "searching for an exact match");
    for candidate in population {
        if candidate.key == finding.key {
            continue;
        }
        if strictly_identical(candidate, finding, options) {
            if candidate.can_be_synced(allowed_users) {
                info!(source = %finding.key, target = %candidate.key, "strictly identical, can be synced");
                search.exact.push(candidate);
            } else {
                info!(source = %finding.key, target = %candidate.key, "strictly identical but target already has changes");
                search.conflicting.push(ConflictedMatch {
                    finding: candidate,
                    reason: conflict_reason(candidate, allowed_users),
                });
            }
            return search;
        }
    }

    debug!(key = %finding.key, "no exact match, searching for an approximate match");
    for candidate in population {
        let score = similarity_score(candidate, finding, options);
        if score >= APPROX_MATCH_THRESHOLD {
            if candidate.can_be_synced(allowed_users) {
                info!(source = %finding.key, target = %candidate.key, score, "almost identical, could be synced");
                search.approximate.push(ApproxMatch {
                    finding: candidate,
                    score,
                });
            } else {
                info!(source = %finding.key, target = %candidate.key, score, "almost identical but target already has changes");
                search.conflicting.push(ConflictedMatch {
                    finding: candidate,
                    reason: conflict_reason(candidate, allowed_users),
                });
            }
        } else {
            debug!(source = %finding.key, target = %candidate.key, "not siblings");
        }
    }
    search
}

/// Settings for one history enrichment batch.
#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub workers: usize,
    pub added_after: Option<DateTime<Utc>>,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            added_after: None,
        }
    }
}

impl EnrichConfig {
    pub fn from_env() -> Self {
        Self {
            workers: std::env::var("FREC_ENRICH_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            added_after: std::env::var("FREC_ADDED_AFTER")
                .ok()
                .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

/// Summary of one enrichment batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichReport {
    pub total: usize,
    pub already_enriched: usize,
    pub changelog_skipped: usize,
    pub fetch_failures: usize,
}

async fn enrich_one(
    source: &dyn FindingSource,
    finding: &mut Finding,
    added_after: Option<DateTime<Utc>>,
    report: &mut EnrichReport,
) {
    if finding.changelog.is_some() && finding.comments.is_some() {
        report.already_enriched += 1;
        return;
    }

    if finding.changelog.is_none() {
        // A cutoff later than the modification date means nothing relevant
        // can be in the changelog; skip the remote call entirely.
        let skip = added_after.is_some_and(|cutoff| cutoff > finding.modification_date);
        if skip {
            finding.changelog = Some(Vec::new());
            report.changelog_skipped += 1;
        } else {
            match source.fetch_changelog(&finding.key).await {
                Ok(entries) => finding.changelog = Some(entries),
                Err(err) => {
                    warn!(key = %finding.key, %err, "changelog fetch failed, treating as empty history");
                    finding.changelog = Some(Vec::new());
                    report.fetch_failures += 1;
                }
            }
        }
    }

    if finding.comments.is_none() {
        match source.fetch_comments(&finding.key).await {
            Ok(comments) => finding.comments = Some(comments),
            Err(err) => {
                warn!(key = %finding.key, %err, "comments fetch failed, treating as empty history");
                finding.comments = Some(Vec::new());
                report.fetch_failures += 1;
            }
        }
    }
}

/// Mass history collection: one changelog call and one comments call per
/// finding, fanned out over a fixed pool of workers.
///
/// Each finding is owned by exactly one worker while its fetches run; the
/// call returns only once the whole queue has drained, with the population
/// reassembled in input order. A per-finding fetch failure degrades that
/// finding to empty history and never aborts the batch. Findings already
/// enriched are left untouched, so a second pass issues no calls.
pub async fn enrich(
    source: Arc<dyn FindingSource>,
    findings: Vec<Finding>,
    config: &EnrichConfig,
) -> (Vec<Finding>, EnrichReport) {
    let total = findings.len();
    let mut report = EnrichReport {
        total,
        ..EnrichReport::default()
    };
    if total == 0 {
        return (findings, report);
    }

    let workers = config.workers.max(1).min(total);
    info!(total, workers, "mass history collection");
    let queue: Arc<Mutex<VecDeque<(usize, Finding)>>> =
        Arc::new(Mutex::new(findings.into_iter().enumerate().collect()));
    let done: Arc<Mutex<Vec<(usize, Finding)>>> = Arc::new(Mutex::new(Vec::with_capacity(total)));

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let queue = Arc::clone(&queue);
        let done = Arc::clone(&done);
        let source = Arc::clone(&source);
        let added_after = config.added_after;
        handles.push(tokio::spawn(async move {
            let mut partial = EnrichReport::default();
            loop {
                let next = queue.lock().await.pop_front();
                let Some((index, mut finding)) = next else {
                    debug!(worker, "queue empty, exiting worker");
                    break;
                };
                enrich_one(source.as_ref(), &mut finding, added_after, &mut partial).await;
                done.lock().await.push((index, finding));
            }
            partial
        }));
    }

    for handle in handles {
        let partial = handle.await.expect("enrichment worker panicked");
        report.already_enriched += partial.already_enriched;
        report.changelog_skipped += partial.changelog_skipped;
        report.fetch_failures += partial.fetch_failures;
    }

    let mut done = Arc::try_unwrap(done)
        .expect("all workers joined")
        .into_inner();
    done.sort_by_key(|(index, _)| *index);
    let findings = done.into_iter().map(|(_, finding)| finding).collect();
    (findings, report)
}

/// Post-search filter: creation-date window plus an optional language list.
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub languages: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

/// Caller-owned rule-to-language map, scoped to one reconciliation run.
/// Each distinct rule is resolved remotely at most once; failed lookups are
/// cached as unresolvable.
#[derive(Debug, Default)]
pub struct RuleLanguageCache {
    languages: BTreeMap<String, Option<String>>,
}

impl RuleLanguageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(&mut self, source: &dyn FindingSource, rule: &str) -> Option<String> {
        if let Some(cached) = self.languages.get(rule) {
            return cached.clone();
        }
        let resolved = match source.resolve_rule_language(rule).await {
            Ok(language) => Some(language),
            Err(err) => {
                warn!(rule, %err, "rule language lookup failed");
                None
            }
        };
        self.languages.insert(rule.to_string(), resolved.clone());
        resolved
    }
}

/// Retain findings inside the creation-date window and, when a language list
/// is given, findings whose rule resolves to one of the listed languages.
/// Findings with no resolvable language are dropped by an active language
/// filter.
pub async fn post_search_filter(
    findings: Vec<Finding>,
    filter: &PostFilter,
    source: &dyn FindingSource,
    cache: &mut RuleLanguageCache,
) -> Vec<Finding> {
    info!(languages = ?filter.languages, "post filtering findings");
    let mut kept = Vec::with_capacity(findings.len());
    for finding in findings {
        if let Some(min) = filter.created_after {
            if finding.creation_date < min {
                continue;
            }
        }
        if let Some(max) = filter.created_before {
            if finding.creation_date > max {
                continue;
            }
        }
        if !filter.languages.is_empty() {
            let language = match &finding.rule {
                Some(rule) => cache.resolve(source, rule).await,
                None => None,
            };
            match language {
                Some(language) if filter.languages.contains(&language) => {}
                _ => continue,
            }
        }
        kept.push(finding);
    }
    kept
}

/// One platform instance with the wire shape its raw records use.
#[derive(Clone)]
pub struct InstanceHandle {
    pub source: Arc<dyn FindingSource>,
    pub shape: RecordShape,
}

impl InstanceHandle {
    pub fn new(source: Arc<dyn FindingSource>, shape: RecordShape) -> Self {
        Self { source, shape }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileSettings {
    pub allowed_users: Option<Vec<String>>,
    pub options: MatchOptions,
    pub enrich: EnrichConfig,
    pub filter: Option<PostFilter>,
}

impl ReconcileSettings {
    pub fn from_env() -> Self {
        let allowed_users = std::env::var("FREC_ALLOWED_USERS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|users| !users.is_empty());
        Self {
            allowed_users,
            options: MatchOptions::default(),
            enrich: EnrichConfig::from_env(),
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredKey {
    pub key: String,
    pub score: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictedKey {
    pub key: String,
    pub reason: ConflictReason,
}

/// Sibling-search outcome for one source finding, by target key.
#[derive(Debug, Clone, Serialize)]
pub struct FindingOutcome {
    pub key: String,
    pub exact: Vec<String>,
    pub approximate: Vec<ScoredKey>,
    pub conflicting: Vec<ConflictedKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_count: usize,
    pub target_count: usize,
    pub source_records_skipped: usize,
    pub target_records_skipped: usize,
    pub source_enrichment: EnrichReport,
    pub target_enrichment: EnrichReport,
    pub outcomes: Vec<FindingOutcome>,
}

/// One end-to-end reconciliation pass: fetch, construct, filter, enrich,
/// then drive the sibling search for every source finding against the
/// target population.
pub struct Reconciler {
    source: InstanceHandle,
    target: InstanceHandle,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(source: InstanceHandle, target: InstanceHandle, settings: ReconcileSettings) -> Self {
        Self {
            source,
            target,
            settings,
        }
    }

    async fn load_population(
        &self,
        instance: &InstanceHandle,
        scope: &ProjectScope,
    ) -> Result<(Vec<Finding>, usize)> {
        let records = instance
            .source
            .fetch_raw_findings(scope)
            .await
            .with_context(|| format!("listing findings for project {}", scope.project))?;
        let (mut findings, skipped) = parse_findings(&records, instance.shape);
        if let Some(filter) = &self.settings.filter {
            let mut cache = RuleLanguageCache::new();
            findings =
                post_search_filter(findings, filter, instance.source.as_ref(), &mut cache).await;
        }
        Ok((findings, skipped))
    }

    pub async fn run(
        &self,
        source_scope: &ProjectScope,
        target_scope: &ProjectScope,
    ) -> Result<ReconcileReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile_run", %run_id, project = %source_scope.project);
        let _guard = span.enter();

        let (source_findings, source_records_skipped) =
            self.load_population(&self.source, source_scope).await?;
        let (target_findings, target_records_skipped) =
            self.load_population(&self.target, target_scope).await?;

        let (source_findings, source_enrichment) = enrich(
            Arc::clone(&self.source.source),
            source_findings,
            &self.settings.enrich,
        )
        .await;
        let (target_findings, target_enrichment) = enrich(
            Arc::clone(&self.target.source),
            target_findings,
            &self.settings.enrich,
        )
        .await;

        let allowed_users = self.settings.allowed_users.as_deref();
        let outcomes = source_findings
            .iter()
            .map(|finding| {
                let search = search_siblings(
                    finding,
                    &target_findings,
                    allowed_users,
                    &self.settings.options,
                );
                FindingOutcome {
                    key: finding.key.clone(),
                    exact: search.exact.iter().map(|f| f.key.clone()).collect(),
                    approximate: search
                        .approximate
                        .iter()
                        .map(|m| ScoredKey {
                            key: m.finding.key.clone(),
                            score: m.score,
                        })
                        .collect(),
                    conflicting: search
                        .conflicting
                        .iter()
                        .map(|m| ConflictedKey {
                            key: m.finding.key.clone(),
                            reason: m.reason.clone(),
                        })
                        .collect(),
                }
            })
            .collect::<Vec<_>>();

        let matched = outcomes
            .iter()
            .filter(|o| !o.exact.is_empty() || !o.approximate.is_empty())
            .count();
        info!(
            source_count = source_findings.len(),
            target_count = target_findings.len(),
            matched,
            "reconciliation pass complete"
        );

        Ok(ReconcileReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source_count: source_findings.len(),
            target_count: target_findings.len(),
            source_records_skipped,
            target_records_skipped,
            source_enrichment,
            target_enrichment,
            outcomes,
        })
    }
}
