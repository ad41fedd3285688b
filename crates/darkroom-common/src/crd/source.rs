//! Image source backends
//!
//! On the wire a source is a flat object tagged by `type`, carrying whichever of
//! `baseUrl` / `bucket` the backend needs. In memory it is the closed [`Source`]
//! enum, so every consumer has to match all backends explicitly.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Wire form
// =============================================================================

/// Backend kind of a Darkroom source
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum SourceType {
    /// Images served from a plain HTTP(S) folder
    WebFolder,
    /// Images served from an AWS S3 bucket
    S3,
    /// Images served from a Google Cloud Storage bucket
    GoogleCloudStorage,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebFolder => write!(f, "WebFolder"),
            Self::S3 => write!(f, "S3"),
            Self::GoogleCloudStorage => write!(f, "GoogleCloudStorage"),
        }
    }
}

/// Bucket coordinates as they appear on the wire
///
/// The credential fields are shared between S3 and GCS; only the ones that
/// belong to the selected backend are kept when converting to [`Source`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    /// Bucket name
    #[schemars(length(min = 3))]
    pub name: String,

    /// GCS service account key, as a JSON document
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credentials_json: String,

    /// S3 access key id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key: String,

    /// S3 secret access key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_key: String,
}

/// Flat wire representation of [`Source`]
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// Which backend the remaining fields describe
    #[serde(rename = "type")]
    pub type_: SourceType,

    /// Base URL for `WebFolder` sources
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_url: String,

    /// Bucket for `S3` and `GoogleCloudStorage` sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<Bucket>,
}

// =============================================================================
// In-memory form
// =============================================================================

/// Where a Darkroom fetches its original images from
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(from = "SourceSpec", into = "SourceSpec")]
pub enum Source {
    /// Plain HTTP(S) folder
    WebFolder(WebFolderSource),
    /// AWS S3 bucket
    S3(S3Source),
    /// Google Cloud Storage bucket
    GoogleCloudStorage(GoogleCloudStorageSource),
}

/// `WebFolder` backend
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WebFolderSource {
    /// Absolute URL images are resolved against
    pub base_url: String,
}

/// `S3` backend
#[derive(Clone, Debug, Default, PartialEq)]
pub struct S3Source {
    /// Bucket to read from, required
    pub bucket: Option<S3Bucket>,
}

/// S3 bucket with static credentials
#[derive(Clone, Debug, Default, PartialEq)]
pub struct S3Bucket {
    /// Bucket name
    pub name: String,
    /// Access key id
    pub access_key: String,
    /// Secret access key
    pub secret_key: String,
}

/// `GoogleCloudStorage` backend
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GoogleCloudStorageSource {
    /// Bucket to read from, required
    pub bucket: Option<GcsBucket>,
}

/// GCS bucket with a service account key
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GcsBucket {
    /// Bucket name
    pub name: String,
    /// Service account key as a JSON document
    pub credentials_json: String,
}

impl Source {
    /// Backend kind of this source
    pub fn source_type(&self) -> SourceType {
        match self {
            Self::WebFolder(_) => SourceType::WebFolder,
            Self::S3(_) => SourceType::S3,
            Self::GoogleCloudStorage(_) => SourceType::GoogleCloudStorage,
        }
    }

    /// Base URL of a `WebFolder` source, empty for bucket backends
    pub fn base_url(&self) -> &str {
        match self {
            Self::WebFolder(web) => &web.base_url,
            Self::S3(_) | Self::GoogleCloudStorage(_) => "",
        }
    }
}

impl From<SourceSpec> for Source {
    fn from(spec: SourceSpec) -> Self {
        match spec.type_ {
            SourceType::WebFolder => Self::WebFolder(WebFolderSource {
                base_url: spec.base_url,
            }),
            SourceType::S3 => Self::S3(S3Source {
                bucket: spec.bucket.map(|b| S3Bucket {
                    name: b.name,
                    access_key: b.access_key,
                    secret_key: b.secret_key,
                }),
            }),
            SourceType::GoogleCloudStorage => Self::GoogleCloudStorage(GoogleCloudStorageSource {
                bucket: spec.bucket.map(|b| GcsBucket {
                    name: b.name,
                    credentials_json: b.credentials_json,
                }),
            }),
        }
    }
}

impl From<Source> for SourceSpec {
    fn from(source: Source) -> Self {
        let type_ = source.source_type();
        match source {
            Source::WebFolder(web) => Self {
                type_,
                base_url: web.base_url,
                bucket: None,
            },
            Source::S3(s3) => Self {
                type_,
                base_url: String::new(),
                bucket: s3.bucket.map(|b| Bucket {
                    name: b.name,
                    access_key: b.access_key,
                    secret_key: b.secret_key,
                    ..Default::default()
                }),
            },
            Source::GoogleCloudStorage(gcs) => Self {
                type_,
                base_url: String::new(),
                bucket: gcs.bucket.map(|b| Bucket {
                    name: b.name,
                    credentials_json: b.credentials_json,
                    ..Default::default()
                }),
            },
        }
    }
}
