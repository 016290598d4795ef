// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Kubernetes admission webhook admitting workloads only when their
//! container images are trusted, pinning every image to its signed digest.

pub mod admission;
pub mod config;
pub mod error;
pub mod kube;
pub mod pipeline;
pub mod router;
pub mod timing;

pub use error::{Error, Result};
pub use pipeline::{AdmissionPipeline, PipelineSettings};
