//! Finding source contracts + raw record parsing for the two wire shapes.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use frec_core::{ChangelogEntry, Comment, Finding, FindingType, ProjectScope, ScopeTarget, TextRange};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "frec-source";

/// Platform timestamp format ("2024-03-01T09:00:00+0000").
const PLATFORM_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// Which of the two raw record shapes a payload uses: the live `Search` API
/// or the bulk `Export` dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordShape {
    Search,
    Export,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("raw record is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("raw record field `{field}` holds unparseable timestamp `{value}`")]
    BadTimestamp { field: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// The remote analysis platform, seen from the engine.
///
/// Pagination, authentication and retry live behind this seam; the engine
/// only needs raw finding records for a scope and per-finding history.
#[async_trait]
pub trait FindingSource: Send + Sync {
    async fn fetch_raw_findings(&self, scope: &ProjectScope)
        -> Result<Vec<JsonValue>, SourceError>;

    async fn fetch_changelog(&self, finding_key: &str)
        -> Result<Vec<ChangelogEntry>, SourceError>;

    async fn fetch_comments(&self, finding_key: &str) -> Result<Vec<Comment>, SourceError>;

    async fn resolve_rule_language(&self, rule_id: &str) -> Result<String, SourceError>;
}

fn str_field(record: &JsonValue, name: &str) -> Option<String> {
    record.get(name).and_then(|v| v.as_str()).map(str::to_string)
}

fn required_str(record: &JsonValue, name: &'static str) -> Result<String, RecordError> {
    str_field(record, name).ok_or(RecordError::MissingField(name))
}

fn parse_timestamp(record: &JsonValue, name: &'static str) -> Result<DateTime<Utc>, RecordError> {
    let raw = required_str(record, name)?;
    DateTime::parse_from_str(&raw, PLATFORM_DATETIME_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(&raw))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| RecordError::BadTimestamp {
            field: name,
            value: raw,
        })
}

/// Line numbers arrive as JSON numbers, numeric strings, or the literal
/// string "null". The field is advisory: anything unparseable becomes `None`.
fn normalize_line(record: &JsonValue) -> Option<u32> {
    let value = record.get("line").or_else(|| record.get("lineNumber"))?;
    match value {
        JsonValue::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        JsonValue::String(s) if s == "null" => None,
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Build one normalized [`Finding`] from a raw platform record.
///
/// Tolerant of everything except the structurally required fields: `status`,
/// the project key, and the two timestamps. Unknown finding types parse to
/// `None` rather than failing the record.
pub fn parse_finding(record: &JsonValue, shape: RecordShape) -> Result<Finding, RecordError> {
    let status = required_str(record, "status")?;

    let (project_key, creation_date, modification_date) = match shape {
        RecordShape::Search => (
            required_str(record, "project")?,
            parse_timestamp(record, "creationDate")?,
            parse_timestamp(record, "updateDate")?,
        ),
        RecordShape::Export => (
            required_str(record, "projectKey")?,
            parse_timestamp(record, "createdAt")?,
            parse_timestamp(record, "updatedAt")?,
        ),
    };

    let key = required_str(record, "key")?;
    let branch = str_field(record, "branch")
        .map(|b| b.strip_prefix("BRANCH:").map(str::to_string).unwrap_or(b));
    let finding_type = str_field(record, "type").and_then(|t| t.parse::<FindingType>().ok());
    let rule = str_field(record, "rule").or_else(|| str_field(record, "ruleReference"));
    let text_range = record
        .get("textRange")
        .and_then(|v| serde_json::from_value::<TextRange>(v.clone()).ok());

    let finding = Finding {
        key,
        project_key,
        branch,
        pull_request: str_field(record, "pullRequest"),
        finding_type,
        severity: str_field(record, "severity"),
        rule,
        status,
        resolution: str_field(record, "resolution"),
        component: str_field(record, "component"),
        line: normalize_line(record),
        message: str_field(record, "message"),
        hash: str_field(record, "hash"),
        text_range,
        path: str_field(record, "path"),
        author: str_field(record, "author"),
        assignee: str_field(record, "assignee"),
        creation_date,
        modification_date,
        changelog: None,
        comments: None,
    };

    if finding.component.is_none() && finding.path.is_none() {
        warn!(key = %finding.key, "cannot determine file path for finding");
    }
    Ok(finding)
}

/// Construct a batch of findings, isolating failures per record.
///
/// Returns the findings that parsed plus the count of records skipped; a
/// malformed record is warned and never aborts the batch.
pub fn parse_findings(records: &[JsonValue], shape: RecordShape) -> (Vec<Finding>, usize) {
    let mut findings = Vec::with_capacity(records.len());
    let mut skipped = 0usize;
    for record in records {
        match parse_finding(record, shape) {
            Ok(finding) => findings.push(finding),
            Err(err) => {
                warn!(%err, "skipping malformed finding record");
                skipped += 1;
            }
        }
    }
    (findings, skipped)
}

/// Checked-in snapshot of one platform instance, for tests and offline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub instance: String,
    pub shape: RecordShape,
    pub findings: Vec<JsonValue>,
    #[serde(default)]
    pub changelogs: BTreeMap<String, Vec<ChangelogEntry>>,
    #[serde(default)]
    pub comments: BTreeMap<String, Vec<Comment>>,
    #[serde(default)]
    pub rule_languages: BTreeMap<String, String>,
}

/// [`FindingSource`] backed by a [`FixtureBundle`] on disk.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    bundle: FixtureBundle,
}

impl FixtureSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let bundle: FixtureBundle =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(bundle))
    }

    pub fn shape(&self) -> RecordShape {
        self.bundle.shape
    }

    fn record_in_scope(&self, record: &JsonValue, scope: &ProjectScope) -> bool {
        let project_field = match self.bundle.shape {
            RecordShape::Search => "project",
            RecordShape::Export => "projectKey",
        };
        if str_field(record, project_field).as_deref() != Some(scope.project.as_str()) {
            return false;
        }
        let branch = str_field(record, "branch")
            .map(|b| b.strip_prefix("BRANCH:").map(str::to_string).unwrap_or(b));
        let pull_request = str_field(record, "pullRequest");
        match &scope.target {
            ScopeTarget::Main => branch.is_none() && pull_request.is_none(),
            ScopeTarget::Branch(name) => branch.as_deref() == Some(name.as_str()),
            ScopeTarget::PullRequest(id) => pull_request.as_deref() == Some(id.as_str()),
        }
    }
}

#[async_trait]
impl FindingSource for FixtureSource {
    async fn fetch_raw_findings(
        &self,
        scope: &ProjectScope,
    ) -> Result<Vec<JsonValue>, SourceError> {
        Ok(self
            .bundle
            .findings
            .iter()
            .filter(|record| self.record_in_scope(record, scope))
            .cloned()
            .collect())
    }

    async fn fetch_changelog(&self, finding_key: &str) -> Result<Vec<ChangelogEntry>, SourceError> {
        Ok(self
            .bundle
            .changelogs
            .get(finding_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_comments(&self, finding_key: &str) -> Result<Vec<Comment>, SourceError> {
        Ok(self
            .bundle
            .comments
            .get(finding_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn resolve_rule_language(&self, rule_id: &str) -> Result<String, SourceError> {
        self.bundle
            .rule_languages
            .get(rule_id)
            .cloned()
            .ok_or_else(|| SourceError::Message(format!("no language known for rule {rule_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_record() -> JsonValue {
        json!({
            "key": "AYhSN1",
            "project": "proj",
            "rule": "python:S100",
            "type": "CODE_SMELL",
            "severity": "MINOR",
            "status": "OPEN",
            "message": "Rename this method",
            "component": "proj:src/app.py:BRANCH:feature-x",
            "branch": "BRANCH:feature-x",
            "line": 42,
            "hash": "d41d8cd9",
            "author": "alice@corp",
            "textRange": {"startLine": 42, "startOffset": 4, "endLine": 42, "endOffset": 20},
            "creationDate": "2024-03-01T09:00:00+0000",
            "updateDate": "2024-03-02T10:30:00+0000"
        })
    }

    #[test]
    fn parses_search_shape_record() {
        let finding = parse_finding(&search_record(), RecordShape::Search).unwrap();
        assert_eq!(finding.key, "AYhSN1");
        assert_eq!(finding.project_key, "proj");
        assert_eq!(finding.branch.as_deref(), Some("feature-x"));
        assert_eq!(finding.pull_request, None);
        assert_eq!(finding.finding_type, Some(FindingType::CodeSmell));
        assert_eq!(finding.line, Some(42));
        assert_eq!(finding.file().as_deref(), Some("src/app.py"));
        assert_eq!(finding.text_range.map(|r| r.start_offset), Some(4));
        assert_eq!(
            finding.creation_date.to_rfc3339(),
            "2024-03-01T09:00:00+00:00"
        );
        assert!(finding.changelog.is_none());
        assert!(finding.comments.is_none());
    }

    #[test]
    fn parses_export_shape_with_field_fallbacks() {
        let record = json!({
            "key": "exp-1",
            "projectKey": "proj",
            "ruleReference": "java:S2095",
            "lineNumber": "17",
            "status": "TO_REVIEW",
            "type": "SECURITY_HOTSPOT",
            "path": "src/main/java/App.java",
            "createdAt": "2024-01-10T08:00:00+0000",
            "updatedAt": "2024-01-11T08:00:00+0000"
        });
        let finding = parse_finding(&record, RecordShape::Export).unwrap();
        assert_eq!(finding.rule.as_deref(), Some("java:S2095"));
        assert_eq!(finding.line, Some(17));
        assert!(finding.is_hotspot());
        assert_eq!(finding.file().as_deref(), Some("src/main/java/App.java"));
    }

    #[test]
    fn missing_status_fails_the_record() {
        let mut record = search_record();
        record.as_object_mut().unwrap().remove("status");
        let err = parse_finding(&record, RecordShape::Search).unwrap_err();
        assert!(matches!(err, RecordError::MissingField("status")));
    }

    #[test]
    fn bad_timestamp_fails_the_record() {
        let mut record = search_record();
        record["creationDate"] = json!("not-a-date");
        let err = parse_finding(&record, RecordShape::Search).unwrap_err();
        assert!(matches!(
            err,
            RecordError::BadTimestamp {
                field: "creationDate",
                ..
            }
        ));
    }

    #[test]
    fn line_normalization_is_tolerant() {
        for (raw, expected) in [
            (json!(42), Some(42)),
            (json!("42"), Some(42)),
            (json!("null"), None),
            (json!("not-a-number"), None),
        ] {
            let mut record = search_record();
            record["line"] = raw;
            let finding = parse_finding(&record, RecordShape::Search).unwrap();
            assert_eq!(finding.line, expected);
        }
        let mut record = search_record();
        record.as_object_mut().unwrap().remove("line");
        let finding = parse_finding(&record, RecordShape::Search).unwrap();
        assert_eq!(finding.line, None);
    }

    #[test]
    fn unknown_type_parses_to_none() {
        let mut record = search_record();
        record["type"] = json!("SOMETHING_NEW");
        let finding = parse_finding(&record, RecordShape::Search).unwrap();
        assert_eq!(finding.finding_type, None);
    }

    #[test]
    fn batch_isolates_malformed_records() {
        let mut broken = search_record();
        broken.as_object_mut().unwrap().remove("status");
        let records = vec![search_record(), broken, search_record()];
        let (findings, skipped) = parse_findings(&records, RecordShape::Search);
        assert_eq!(findings.len(), 2);
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn fixture_source_filters_by_scope() {
        let main_record = {
            let mut r = search_record();
            let obj = r.as_object_mut().unwrap();
            obj.insert("key".into(), json!("main-1"));
            obj.remove("branch");
            obj.insert("component".into(), json!("proj:src/app.py"));
            r
        };
        let pr_record = {
            let mut r = search_record();
            let obj = r.as_object_mut().unwrap();
            obj.insert("key".into(), json!("pr-1"));
            obj.remove("branch");
            obj.insert("pullRequest".into(), json!("42"));
            r
        };
        let source = FixtureSource::new(FixtureBundle {
            instance: "test".to_string(),
            shape: RecordShape::Search,
            findings: vec![search_record(), main_record, pr_record],
            changelogs: BTreeMap::new(),
            comments: BTreeMap::new(),
            rule_languages: BTreeMap::new(),
        });

        let on_branch = source
            .fetch_raw_findings(&ProjectScope::branch("proj", "feature-x"))
            .await
            .unwrap();
        assert_eq!(on_branch.len(), 1);
        assert_eq!(on_branch[0]["key"], "AYhSN1");

        let on_main = source
            .fetch_raw_findings(&ProjectScope::main("proj"))
            .await
            .unwrap();
        assert_eq!(on_main.len(), 1);
        assert_eq!(on_main[0]["key"], "main-1");

        let on_pr = source
            .fetch_raw_findings(&ProjectScope::pull_request("proj", "42"))
            .await
            .unwrap();
        assert_eq!(on_pr.len(), 1);
        assert_eq!(on_pr[0]["key"], "pr-1");

        let other_project = source
            .fetch_raw_findings(&ProjectScope::main("other"))
            .await
            .unwrap();
        assert!(other_project.is_empty());
    }

    #[test]
    fn bundle_round_trips_through_from_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bundle.json");
        let bundle = FixtureBundle {
            instance: "test".to_string(),
            shape: RecordShape::Export,
            findings: vec![search_record()],
            changelogs: BTreeMap::new(),
            comments: BTreeMap::new(),
            rule_languages: BTreeMap::new(),
        };
        fs::write(&path, serde_json::to_vec_pretty(&bundle).unwrap()).unwrap();

        let source = FixtureSource::from_path(&path).unwrap();
        assert_eq!(source.shape(), RecordShape::Export);

        assert!(FixtureSource::from_path(dir.path().join("missing.json")).is_err());
    }

    #[tokio::test]
    async fn fixture_source_history_defaults_to_empty() {
        let source = FixtureSource::new(FixtureBundle {
            instance: "test".to_string(),
            shape: RecordShape::Search,
            findings: vec![],
            changelogs: BTreeMap::new(),
            comments: BTreeMap::new(),
            rule_languages: BTreeMap::new(),
        });
        assert!(source.fetch_changelog("nope").await.unwrap().is_empty());
        assert!(source.fetch_comments("nope").await.unwrap().is_empty());
        assert!(source.resolve_rule_language("nope:rule").await.is_err());
    }
}
