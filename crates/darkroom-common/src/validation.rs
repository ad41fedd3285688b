//! Admission-time defaulting and validation
//!
//! Defaulting fills in the version before anything else looks at the spec.
//! Validation is pure: it reports field errors in the API server's own format
//! so a rejected create reads the same whether it came through the webhook or
//! the API server façade.

use std::fmt;

use kube::ResourceExt;
use thiserror::Error;

use crate::crd::{
    Darkroom, DarkroomSpec, GoogleCloudStorageSource, S3Source, Source, WebFolderSource,
};
use crate::{API_GROUP, DEFAULT_VERSION};

// =============================================================================
// Field errors
// =============================================================================

/// Dotted path to a field inside an object, e.g. `spec.source.baseUrl`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Start a path at a top-level field
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            segments: vec![root.into()],
        }
    }

    /// Path to a child field of this one
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.into());
        Self { segments }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// Category of a field error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldErrorKind {
    /// A required field is missing or empty
    Required,
    /// A field is present but its value is unusable
    Invalid,
}

/// A single problem with a single field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    /// What kind of problem this is
    pub kind: FieldErrorKind,
    /// Rendered path of the offending field
    pub field: String,
    /// The rejected value, for `Invalid` errors
    pub bad_value: Option<String>,
    /// Human readable reason
    pub detail: String,
}

impl FieldError {
    /// A required field is missing
    pub fn required(path: &FieldPath, detail: impl Into<String>) -> Self {
        Self {
            kind: FieldErrorKind::Required,
            field: path.to_string(),
            bad_value: None,
            detail: detail.into(),
        }
    }

    /// A field holds an unusable value
    pub fn invalid(path: &FieldPath, value: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: FieldErrorKind::Invalid,
            field: path.to_string(),
            bad_value: Some(value.into()),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FieldErrorKind::Required => write!(f, "{}: Required value", self.field)?,
            FieldErrorKind::Invalid => write!(
                f,
                "{}: Invalid value: {:?}",
                self.field,
                self.bad_value.as_deref().unwrap_or_default()
            )?,
        }
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

/// Ordered collection of field errors
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorList(Vec<FieldError>);

impl ErrorList {
    /// Append an error
    pub fn push(&mut self, error: FieldError) {
        self.0.push(error);
    }

    /// True when nothing has been reported
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of errors reported
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the errors in report order
    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// `Ok` when empty, otherwise the list itself as the error
    pub fn into_result(self) -> Result<(), ErrorList> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl Extend<FieldError> for ErrorList {
    fn extend<T: IntoIterator<Item = FieldError>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        match rendered.as_slice() {
            [single] => write!(f, "{single}"),
            _ => write!(f, "[{}]", rendered.join(", ")),
        }
    }
}

/// A Darkroom rejected at admission, with every failing field
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("Darkroom.{} {:?} is invalid: {}", API_GROUP, .name, .errors)]
pub struct InvalidError {
    /// Name of the rejected object
    pub name: String,
    /// Everything that was wrong with it
    pub errors: ErrorList,
}

// =============================================================================
// Defaulting
// =============================================================================

impl DarkroomSpec {
    /// Fill in defaults, returning whether anything changed
    ///
    /// Running it again on its own output is a no-op.
    pub fn apply_defaults(&mut self) -> bool {
        if self.version.is_empty() {
            self.version = DEFAULT_VERSION.to_string();
            return true;
        }
        false
    }

    /// Validate the spec, collecting every field error
    pub fn validate(&self) -> Result<(), ErrorList> {
        let source_path = FieldPath::new("spec").child("source");
        let mut errors = ErrorList::default();
        errors.extend(self.source.validate(&source_path));
        errors.into_result()
    }
}

impl Darkroom {
    /// Validate for create or update admission
    pub fn validate_admission(&self) -> Result<(), InvalidError> {
        self.spec.validate().map_err(|errors| InvalidError {
            name: self.name_any(),
            errors,
        })
    }
}

// =============================================================================
// Source validation
//
// Each backend reports at most one error: the first missing or broken field.
// =============================================================================

impl Source {
    /// Validate the selected backend against its required fields
    pub fn validate(&self, path: &FieldPath) -> Option<FieldError> {
        match self {
            Source::WebFolder(web) => web.validate(path),
            Source::S3(s3) => s3.validate(path),
            Source::GoogleCloudStorage(gcs) => gcs.validate(path),
        }
    }
}

impl WebFolderSource {
    fn validate(&self, path: &FieldPath) -> Option<FieldError> {
        url::Url::parse(&self.base_url).err().map(|e| {
            FieldError::invalid(&path.child("baseUrl"), &self.base_url, e.to_string())
        })
    }
}

impl S3Source {
    fn validate(&self, path: &FieldPath) -> Option<FieldError> {
        let bucket_path = path.child("bucket");
        let Some(bucket) = &self.bucket else {
            return Some(FieldError::required(
                &bucket_path,
                "field required with Type S3",
            ));
        };
        if bucket.access_key.is_empty() {
            return Some(FieldError::required(
                &bucket_path.child("accessKey"),
                "field required",
            ));
        }
        if bucket.secret_key.is_empty() {
            return Some(FieldError::required(
                &bucket_path.child("secretKey"),
                "field required",
            ));
        }
        None
    }
}

impl GoogleCloudStorageSource {
    fn validate(&self, path: &FieldPath) -> Option<FieldError> {
        let bucket_path = path.child("bucket");
        let Some(bucket) = &self.bucket else {
            return Some(FieldError::required(
                &bucket_path,
                "field required with Type GoogleCloudStorage",
            ));
        };
        let credentials_path = bucket_path.child("credentialsJson");
        if bucket.credentials_json.is_empty() {
            return Some(FieldError::required(&credentials_path, "field required"));
        }
        serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(
            &bucket.credentials_json,
        )
        .err()
        .map(|e| FieldError::invalid(&credentials_path, &bucket.credentials_json, e.to_string()))
    }
}
