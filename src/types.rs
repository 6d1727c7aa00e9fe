//! Core domain types shared across the API edge, broker and worker.

use serde::{Deserialize, Serialize};

/// Output format of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Zip,
    Txt,
    PromptPack,
}

impl ExportFormat {
    /// Parse a user-supplied format string. `md` is accepted as a legacy
    /// alias for `promptpack`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zip" => Some(Self::Zip),
            "txt" => Some(Self::Txt),
            "promptpack" | "md" => Some(Self::PromptPack),
            _ => None,
        }
    }

    /// Base filename of the artifact produced for this format.
    #[must_use]
    pub const fn artifact_name(self) -> &'static str {
        match self {
            Self::Zip => "bundle.zip",
            Self::Txt => "concat.txt",
            Self::PromptPack => "promptpack.zip",
        }
    }

    /// Artifact kind recorded in the manifest (`zip` or `txt`).
    #[must_use]
    pub const fn artifact_kind(self) -> &'static str {
        match self {
            Self::Zip | Self::PromptPack => "zip",
            Self::Txt => "txt",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Txt => "txt",
            Self::PromptPack => "promptpack",
        }
    }
}

/// Prompt pack rendering profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptProfile {
    #[default]
    Short,
    Full,
    Rag,
}

impl PromptProfile {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Self::Full,
            "rag" => Self::Rag,
            _ => Self::Short,
        }
    }

    /// Capitalized label used in rendered documents and the main filename.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Short => "Short",
            Self::Full => "Full",
            Self::Rag => "RAG",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Full => "full",
            Self::Rag => "rag",
        }
    }
}

/// Masking strategy applied to lines with secret findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretStrategy {
    #[default]
    Redacted,
    Strip,
    Mark,
}

impl SecretStrategy {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "strip" => Self::Strip,
            "mark" => Self::Mark,
            _ => Self::Redacted,
        }
    }
}

/// Export job status. Transitions form a DAG rooted at `Queued` with
/// `Running` in the middle and `Done`/`Error`/`Cancelled` as sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Queued,
    Running,
    Done,
    Error,
    Cancelled,
}

impl ExportStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Options captured on the export record at creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOptions {
    pub format: ExportFormat,
    pub profile: PromptProfile,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub secret_scan: bool,
    #[serde(default)]
    pub secret_strategy: SecretStrategy,
    #[serde(default)]
    pub token_model: String,
    #[serde(default)]
    pub max_binary_size_mb: u32,
    #[serde(default)]
    pub ttl_hours: u32,
    #[serde(default)]
    pub idempotency_key: String,
}

impl Default for ExportFormat {
    fn default() -> Self {
        Self::Zip
    }
}

/// Artifact reference recorded on the export once finalized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub size: u64,
    /// Storage-relative path (`<exportId>/<name>`).
    pub path: String,
    pub content_type: String,
}

/// Payload of an `export:run` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTaskPayload {
    pub export_id: String,
    pub owner: String,
    pub repo: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub format: ExportFormat,
    #[serde(default)]
    pub profile: PromptProfile,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub secret_scan: bool,
    #[serde(default)]
    pub secret_strategy: SecretStrategy,
    #[serde(default)]
    pub token_model: String,
    #[serde(default)]
    pub max_binary_size_mb: u32,
    #[serde(default)]
    pub ttl_hours: u32,
    #[serde(default)]
    pub idempotency_key: String,
}

/// Normalize a user-supplied git reference: strip `refs/heads/` / `heads/`
/// prefixes; empty, `default` and `latest` resolve to `HEAD`.
#[must_use]
pub fn normalize_ref(reference: &str) -> String {
    let r = reference.trim();
    if r.is_empty() || r.eq_ignore_ascii_case("default") || r.eq_ignore_ascii_case("latest") {
        return "HEAD".to_string();
    }
    let r = r.strip_prefix("refs/heads/").unwrap_or(r);
    let r = r.strip_prefix("heads/").unwrap_or(r);
    r.to_string()
}
