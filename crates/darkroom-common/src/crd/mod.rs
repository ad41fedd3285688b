//! Custom Resource Definitions for Darkroom
//!
//! The `Darkroom` resource and the source backends it can serve images from.

mod darkroom;
mod source;

pub use darkroom::{Darkroom, DarkroomSpec, DarkroomStatus, DeployState};
pub use source::{
    Bucket, GcsBucket, GoogleCloudStorageSource, S3Bucket, S3Source, Source, SourceSpec,
    SourceType, WebFolderSource,
};
