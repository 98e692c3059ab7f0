use std::fmt;
use std::str::FromStr;

use sandbox::GuestLanguage;
use serde::{Serialize, Serializer};
use storage::Origin;
use uuid::Uuid;

use crate::classifier::ErrorKind;

/// Points at one object the script wants to read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileReference {
    pub origin: Origin,
    /// `None` for uploaded files means the configured uploads bucket.
    pub bucket: Option<String>,
    pub key: String,
}

impl FileReference {
    pub fn uploaded(key: impl Into<String>) -> Self {
        Self {
            origin: Origin::Uploaded,
            bucket: None,
            key: key.into(),
        }
    }

    pub fn public(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            origin: Origin::Public,
            bucket: Some(bucket.into()),
            key: key.into(),
        }
    }

    /// Bucket to fetch from, falling back to `default_bucket`.
    pub fn bucket_or<'a>(&'a self, default_bucket: &'a str) -> &'a str {
        self.bucket.as_deref().unwrap_or(default_bucket)
    }
}

impl fmt::Display for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bucket {
            Some(bucket) => write!(f, "{}:{bucket}/{}", self.origin, self.key),
            None => write!(f, "{}:{}", self.origin, self.key),
        }
    }
}

/// Parses `uploaded:<key>` and `public:<bucket>/<key>`.
impl FromStr for FileReference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (origin, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("file reference {s:?} is missing an origin prefix"))?;
        let origin: Origin = origin.parse()?;
        match origin {
            Origin::Uploaded if !rest.is_empty() => Ok(Self::uploaded(rest)),
            Origin::Public => match rest.split_once('/') {
                Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                    Ok(Self::public(bucket, key))
                }
                _ => Err(format!("public reference {s:?} must be public:<bucket>/<key>")),
            },
            Origin::Uploaded => Err(format!("uploaded reference {s:?} has an empty key")),
        }
    }
}

/// An accepted execution request. Immutable once built.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub script: String,
    pub language: GuestLanguage,
    pub files: Vec<FileReference>,
    /// Opaque caller identity, for audit only.
    pub caller: Option<String>,
}

impl ExecutionRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            script: script.into(),
            language: GuestLanguage::default(),
            files: Vec::new(),
            caller: None,
        }
    }

    pub fn with_language(mut self, language: GuestLanguage) -> Self {
        self.language = language;
        self
    }

    pub fn with_files(mut self, files: Vec<FileReference>) -> Self {
        self.files = files;
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }
}

/// One typed table cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Cell {
    Null,
    Text(String),
    Integer(i64),
    #[serde(serialize_with = "serialize_float")]
    Float(f64),
    Boolean(bool),
    /// RFC 3339 timestamp.
    Timestamp(String),
}

/// JSON has no NaN or infinities; carry them as strings.
fn serialize_float<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_nan() {
        serializer.serialize_str("NaN")
    } else if value.is_infinite() && value.is_sign_positive() {
        serializer.serialize_str("Infinity")
    } else if value.is_infinite() {
        serializer.serialize_str("-Infinity")
    } else {
        serializer.serialize_f64(*value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextFallback {
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Table(ResultTable),
    Text(TextFallback),
}

impl Payload {
    pub fn truncated(&self) -> bool {
        match self {
            Self::Table(t) => t.truncated,
            Self::Text(t) => t.truncated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Success(Payload),
    Failure(Failure),
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failure(f) => Some(f),
            Self::Success(_) => None,
        }
    }
}

/// Uniform response returned to the calling layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub request_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<ResultTable>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

impl Envelope {
    pub fn new(request_id: Uuid, result: ExecutionResult) -> Self {
        let mut envelope = Self {
            request_id,
            success: result.is_success(),
            table: None,
            text: None,
            truncated: None,
            error: None,
        };
        match result {
            ExecutionResult::Success(payload) => {
                envelope.truncated = Some(payload.truncated());
                match payload {
                    Payload::Table(table) => envelope.table = Some(table),
                    Payload::Text(fallback) => envelope.text = Some(fallback.text),
                }
            }
            ExecutionResult::Failure(failure) => envelope.error = Some(failure),
        }
        envelope
    }
}
