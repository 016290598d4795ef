// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Admission of one workload: every container image is checked against the
//! policy and its validator, and trusted digests are patched into the object.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use image_trust::notary::client::NOTARY_REQ_TIMEOUT_SEC;
use image_trust::{ImageReference, PolicyMatcher, Validators};
use log::{debug, error, info};
use serde_json::Value;

use crate::admission::{AdmissionRequest, AdmissionReview, Container, JsonPatch, Operation};
use crate::kube::KubeApi;
use crate::timing::Timings;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineSettings {
    pub detection_mode: bool,
    pub automatic_child_approval: bool,
    pub automatic_unchanged_approval: bool,
    pub request_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            detection_mode: false,
            automatic_child_approval: true,
            automatic_unchanged_approval: false,
            request_timeout: Duration::from_secs(NOTARY_REQ_TIMEOUT_SEC),
        }
    }
}

pub struct AdmissionPipeline {
    policy: PolicyMatcher,
    validators: Validators,
    kube: Arc<dyn KubeApi>,
    settings: PipelineSettings,
}

impl AdmissionPipeline {
    pub fn new(
        policy: PolicyMatcher,
        validators: Validators,
        kube: Arc<dyn KubeApi>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            policy,
            validators,
            kube,
            settings,
        }
    }

    /// Answer a raw AdmissionReview.
    ///
    /// Only a body that is not JSON at all is an error; every other failure
    /// becomes a denial.
    pub async fn review(&self, body: &[u8]) -> Result<AdmissionReview> {
        let review: Value = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidRequest(format!("undecodable body: {e}")))?;
        let uid = review
            .pointer("/request/uid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let timings = Timings::default();
        let admitted = match AdmissionRequest::from_review(review) {
            Ok(request) => {
                let admission = self.admit(&request, &timings);
                let admitted =
                    match tokio::time::timeout(self.settings.request_timeout, admission).await {
                        Ok(admitted) => admitted,
                        Err(_) => Err(Error::DeadlineExceeded),
                    };
                if let Err(e) = &admitted {
                    error!("{} ({})", describe(e), request.context());
                }
                admitted
            }
            Err(e) => {
                error!("{}", describe(&e));
                Err(e)
            }
        };
        timings.log(&uid);

        match admitted {
            Ok(patches) => {
                AdmissionReview::new(&uid, true, &patches, None, self.settings.detection_mode)
            }
            Err(e) => AdmissionReview::new(
                &uid,
                false,
                &[],
                Some(e.to_string()),
                self.settings.detection_mode,
            ),
        }
    }

    /// Validate all containers of the request concurrently and collect the
    /// patches pinning their digests. The first failing container in array
    /// order decides the error.
    pub async fn admit(
        &self,
        request: &AdmissionRequest,
        timings: &Timings,
    ) -> Result<Vec<JsonPatch>> {
        let containers = request.object.containers()?;

        let parent_images = match self.settings.automatic_child_approval
            && !request.object.owners().is_empty()
        {
            true => {
                timings
                    .time(
                        "parent lookup",
                        request.object.parent_containers(self.kube.as_ref()),
                    )
                    .await?
            }
            false => Vec::new(),
        };

        let previous_images = match (
            self.settings.automatic_unchanged_approval,
            request.operation,
            &request.old_object,
        ) {
            (true, Operation::Update, Some(old_object)) => old_object
                .containers()?
                .into_iter()
                .map(|c| c.image)
                .collect(),
            _ => Vec::new(),
        };

        let results = join_all(containers.iter().map(|container| {
            self.validate_container(request, container, &parent_images, &previous_images, timings)
        }))
        .await;

        let mut patches = Vec::new();
        for patch in results {
            if let Some(patch) = patch? {
                patches.push(patch);
            }
        }
        Ok(patches)
    }

    async fn validate_container(
        &self,
        request: &AdmissionRequest,
        container: &Container,
        parent_images: &[ImageReference],
        previous_images: &[ImageReference],
        timings: &Timings,
    ) -> Result<Option<JsonPatch>> {
        let image = &container.image;
        let context = format!("{} image={image}", request.context());

        // images of child resources were already pinned when their parent was
        // admitted and would not match the rules the parent matched
        if parent_images.contains(image) {
            info!("automatic child approval for {image} ({context})");
            return Ok(None);
        }
        if previous_images.contains(image) {
            info!("automatic approval of unchanged image {image} ({context})");
            return Ok(None);
        }

        let with_context = |source| Error::Admission {
            context: context.clone(),
            source,
        };
        let rule = self.policy.matching_rule(image).map_err(with_context)?;
        let validator = self
            .validators
            .get(rule.validator.as_deref())
            .map_err(with_context)?;

        debug!(
            "starting verification of image {image} using rule {} with arguments {:?} and validator {} ({context})",
            rule.pattern,
            rule.arguments,
            validator.name()
        );
        let digest = timings
            .time(
                format!("{}[{}] {image}", container.container_type, container.index),
                validator.validate(image, &rule.arguments),
            )
            .await
            .map_err(with_context)?;
        info!("successful verification of image {image} ({context})");

        Ok(digest.map(|digest| {
            let mut pinned = image.clone();
            pinned.set_digest(&digest);
            request.object.json_patch(container, &pinned)
        }))
    }

    /// Ready when every validator reports healthy.
    pub async fn ready(&self) -> bool {
        self.validators.healthy().await
    }
}

/// The full error chain, for the log only.
fn describe(e: &Error) -> String {
    let (mut description, mut source) = match e {
        Error::Admission { context, source } => (
            format!("{e} [{context}]"),
            std::error::Error::source(source),
        ),
        _ => (e.to_string(), std::error::Error::source(e)),
    };
    while let Some(cause) = source {
        description.push_str(&format!(": {cause}"));
        source = cause.source();
    }
    description
}
