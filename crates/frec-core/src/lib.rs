//! Core domain model for FREC: findings, their history, and the sync policy.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "frec-core";

/// Finding classification as reported by the analysis platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingType {
    Bug,
    Vulnerability,
    CodeSmell,
    SecurityHotspot,
}

impl FromStr for FindingType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUG" => Ok(Self::Bug),
            "VULNERABILITY" => Ok(Self::Vulnerability),
            "CODE_SMELL" => Ok(Self::CodeSmell),
            "SECURITY_HOTSPOT" => Ok(Self::SecurityHotspot),
            _ => Err(()),
        }
    }
}

impl fmt::Display for FindingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bug => "BUG",
            Self::Vulnerability => "VULNERABILITY",
            Self::CodeSmell => "CODE_SMELL",
            Self::SecurityHotspot => "SECURITY_HOTSPOT",
        };
        f.write_str(s)
    }
}

/// Position of the flagged code in its file, as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextRange {
    pub start_line: u32,
    pub start_offset: u32,
    pub end_line: u32,
    pub end_offset: u32,
}

/// One field-level change inside a changelog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDiff {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// One triage event on a finding: who changed what, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub user: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub diffs: Vec<ChangeDiff>,
}

/// A comment left on a finding. Bulk exports may omit the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub user: Option<String>,
    pub date: DateTime<Utc>,
    pub text: String,
}

/// Branch / pull-request selector for a findings query. Mutually exclusive
/// by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeTarget {
    Main,
    Branch(String),
    PullRequest(String),
}

/// Query scope handed to a finding source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectScope {
    pub project: String,
    pub target: ScopeTarget,
}

impl ProjectScope {
    pub fn main(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            target: ScopeTarget::Main,
        }
    }

    pub fn branch(project: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            target: ScopeTarget::Branch(branch.into()),
        }
    }

    pub fn pull_request(project: impl Into<String>, pr: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            target: ScopeTarget::PullRequest(pr.into()),
        }
    }
}

/// Normalized issue / security hotspot record.
///
/// Constructed once from a raw platform record, optionally enriched exactly
/// once with its changelog and comments, then read-only for the matcher and
/// the sync policy. `changelog` and `comments` stay `None` until enrichment
/// runs; `Some(vec![])` means "fetched, nothing there".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub key: String,
    pub project_key: String,
    pub branch: Option<String>,
    pub pull_request: Option<String>,
    pub finding_type: Option<FindingType>,
    pub severity: Option<String>,
    pub rule: Option<String>,
    pub status: String,
    pub resolution: Option<String>,
    pub component: Option<String>,
    pub line: Option<u32>,
    pub message: Option<String>,
    pub hash: Option<String>,
    pub text_range: Option<TextRange>,
    pub path: Option<String>,
    pub author: Option<String>,
    pub assignee: Option<String>,
    pub creation_date: DateTime<Utc>,
    pub modification_date: DateTime<Utc>,
    pub changelog: Option<Vec<ChangelogEntry>>,
    pub comments: Option<Vec<Comment>>,
}

impl Finding {
    /// File path of the finding, relative to the project root.
    ///
    /// Component identifiers on branches and pull requests carry an ugly
    /// suffix ("src:sonar/hot.py:BRANCH:somebranch"); strip it before taking
    /// the last `:`-separated segment. Falls back to the raw `path` field
    /// when no component is present.
    pub fn file(&self) -> Option<String> {
        if let Some(component) = &self.component {
            let mut comp = component.as_str();
            if let Some(idx) = comp.rfind(":BRANCH:") {
                comp = &comp[..idx];
            }
            if let Some(idx) = comp.rfind(":PULL_REQUEST:") {
                comp = &comp[..idx];
            }
            return comp.rsplit(':').next().map(str::to_string);
        }
        self.path.clone()
    }

    /// Status as rendered at export time: the resolution replaces the status
    /// when present, then legacy spellings are mapped to current ones.
    pub fn effective_status(&self) -> String {
        let status = self
            .resolution
            .as_deref()
            .unwrap_or(self.status.as_str());
        match status {
            "WONTFIX" => "ACCEPTED".to_string(),
            "REOPENED" => "OPEN".to_string(),
            "REMOVED" => "FIXED".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_bug(&self) -> bool {
        self.finding_type == Some(FindingType::Bug)
    }

    pub fn is_vulnerability(&self) -> bool {
        self.finding_type == Some(FindingType::Vulnerability)
    }

    pub fn is_code_smell(&self) -> bool {
        self.finding_type == Some(FindingType::CodeSmell)
    }

    pub fn is_hotspot(&self) -> bool {
        self.finding_type == Some(FindingType::SecurityHotspot)
    }

    pub fn is_security_issue(&self) -> bool {
        self.is_vulnerability() || self.is_hotspot()
    }

    pub fn is_closed(&self) -> bool {
        self.status == "CLOSED"
    }

    /// Whether the finding carries any changelog entry.
    ///
    /// When `added_after` is later than the modification date the answer is
    /// `false` without consulting the entries; callers use this to skip the
    /// remote changelog fetch for findings untouched since the cutoff. The
    /// boundary is inclusive: a finding modified exactly at the cutoff is
    /// consulted normally.
    pub fn has_changelog(&self, added_after: Option<DateTime<Utc>>) -> bool {
        if let Some(cutoff) = added_after {
            if cutoff > self.modification_date {
                return false;
            }
        }
        self.changelog.as_deref().is_some_and(|c| !c.is_empty())
    }

    pub fn has_comments(&self) -> bool {
        self.comments.as_deref().is_some_and(|c| !c.is_empty())
    }

    /// Distinct users that modified the finding.
    pub fn modifiers(&self) -> BTreeSet<String> {
        self.changelog
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|entry| entry.user.clone())
            .collect()
    }

    /// Distinct users that commented the finding.
    pub fn commenters(&self) -> BTreeSet<String> {
        self.comments
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|comment| comment.user.clone())
            .collect()
    }

    /// Whether a match on this finding may be applied without losing a
    /// human triage decision.
    ///
    /// With no allowlist of sync accounts, any changelog entry disqualifies
    /// the finding. With an allowlist, every modifier must be one of the
    /// listed accounts (vacuously true for an empty changelog).
    pub fn can_be_synced(&self, allowed_users: Option<&[String]>) -> bool {
        match allowed_users {
            None | Some([]) => !self.has_changelog(None),
            Some(users) => self
                .modifiers()
                .iter()
                .all(|modifier| users.contains(modifier)),
        }
    }
}
