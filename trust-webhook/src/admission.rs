// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The admission webhook envelope and the workload objects it carries.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine};
use image_trust::ImageReference;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};

use crate::kube::KubeApi;
use crate::{Error, Result};

pub const ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";
pub const ADMISSION_KIND: &str = "AdmissionReview";

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, Display, AsRefStr)]
pub enum WorkloadKind {
    Pod,
    Deployment,
    ReplicationController,
    ReplicaSet,
    DaemonSet,
    StatefulSet,
    Job,
    CronJob,
}

impl WorkloadKind {
    pub fn api_versions(&self) -> &'static [&'static str] {
        match self {
            Self::Pod | Self::ReplicationController => &["v1"],
            Self::Deployment | Self::ReplicaSet | Self::DaemonSet | Self::StatefulSet => {
                &["apps/v1", "apps/v1beta1", "apps/v1beta2"]
            }
            Self::Job => &["batch/v1"],
            Self::CronJob => &["batch/v1", "batch/v1beta1", "batch/v2alpha1"],
        }
    }

    pub fn supports(&self, api_version: &str) -> bool {
        self.api_versions().contains(&api_version)
    }

    /// JSON pointer from `spec` to the pod spec.
    fn pod_spec(&self) -> &'static str {
        match self {
            Self::Pod => "",
            Self::CronJob => "/jobTemplate/spec/template/spec",
            _ => "/template/spec",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
pub enum ContainerType {
    #[strum(serialize = "containers")]
    Containers,

    #[strum(serialize = "initContainers")]
    InitContainers,

    #[strum(serialize = "ephemeralContainers")]
    EphemeralContainers,
}

impl ContainerType {
    pub const ALL: [ContainerType; 3] = [
        Self::Containers,
        Self::InitContainers,
        Self::EphemeralContainers,
    ];
}

/// One container image of a workload, addressed by its array and index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
    pub container_type: ContainerType,
    pub index: usize,
    pub image: ImageReference,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct JsonPatch {
    pub op: String,
    pub path: String,
    pub value: String,
}

impl JsonPatch {
    pub fn replace(path: String, value: String) -> Self {
        Self {
            op: "replace".into(),
            path,
            value,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    name: Option<String>,
    generate_name: Option<String>,
    uid: Option<String>,
    #[serde(default)]
    owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawObject {
    kind: String,
    api_version: String,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    spec: Value,
}

/// A workload resource whose pod spec lists container images.
#[derive(Clone, Debug)]
pub struct WorkloadObject {
    kind: WorkloadKind,
    api_version: String,
    namespace: String,
    name: String,
    uid: Option<String>,
    spec: Value,
    owners: Vec<OwnerReference>,
}

impl WorkloadObject {
    pub fn new(object: Value, namespace: &str) -> Result<Self> {
        let raw: RawObject = serde_json::from_value(object)
            .map_err(|e| Error::InvalidRequest(format!("workload object: {e}")))?;
        let kind = WorkloadKind::from_str(&raw.kind)
            .map_err(|_| Error::UnsupportedKind(raw.kind.clone()))?;
        let name = raw
            .metadata
            .name
            .or(raw.metadata.generate_name)
            .unwrap_or_default();

        if !kind.supports(&raw.api_version) {
            return Err(Error::UnknownApiVersion {
                api_version: raw.api_version,
                kind: kind.to_string(),
                name,
            });
        }

        Ok(Self {
            kind,
            api_version: raw.api_version,
            namespace: namespace.to_string(),
            name,
            uid: raw.metadata.uid,
            spec: raw.spec,
            owners: raw.metadata.owner_references,
        })
    }

    pub fn kind(&self) -> WorkloadKind {
        self.kind
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn owners(&self) -> &[OwnerReference] {
        &self.owners
    }

    /// All container images of the pod spec, in array and index order.
    pub fn containers(&self) -> Result<Vec<Container>> {
        let pod_spec = self.spec.pointer(self.kind.pod_spec()).ok_or_else(|| {
            Error::InvalidRequest(format!("{} {} has no pod spec", self.kind, self.name))
        })?;

        let mut containers = Vec::new();
        for container_type in ContainerType::ALL {
            let Some(entries) = pod_spec.get(container_type.as_ref()).and_then(Value::as_array)
            else {
                continue;
            };
            for (index, entry) in entries.iter().enumerate() {
                let image = entry.get("image").and_then(Value::as_str).ok_or_else(|| {
                    Error::InvalidRequest(format!("{container_type}[{index}] has no image"))
                })?;
                containers.push(Container {
                    container_type,
                    index,
                    image: ImageReference::parse(image)?,
                });
            }
        }
        Ok(containers)
    }

    /// Container images of the objects owning this one.
    ///
    /// Any owner of a kind or API version outside the supported set means no
    /// parent images at all.
    pub async fn parent_containers(&self, kube: &dyn KubeApi) -> Result<Vec<ImageReference>> {
        let mut images = Vec::new();
        for owner in &self.owners {
            let supported = WorkloadKind::from_str(&owner.kind)
                .map(|kind| kind.supports(&owner.api_version))
                .unwrap_or(false);
            if !supported {
                debug!(
                    "owner {} {} of {} is not a supported workload",
                    owner.kind, owner.name, self.name
                );
                return Ok(Vec::new());
            }

            // the core group lives under /api, named groups under /apis
            let rest_path = match owner.api_version.as_str() {
                "v1" => "api",
                _ => "apis",
            };
            let kinds = format!("{}s", owner.kind.to_lowercase());
            let path = format!(
                "{rest_path}/{}/namespaces/{}/{kinds}/{}",
                owner.api_version, self.namespace, owner.name
            );

            let parent = WorkloadObject::new(kube.get(&path).await?, &self.namespace)?;
            if parent.uid() != Some(owner.uid.as_str()) {
                return Err(Error::ParentNotFound {
                    kind: kinds,
                    name: owner.name.clone(),
                    uid: owner.uid.clone(),
                });
            }
            images.extend(parent.containers()?.into_iter().map(|c| c.image));
        }
        Ok(images)
    }

    pub fn json_patch(&self, container: &Container, image: &ImageReference) -> JsonPatch {
        JsonPatch::replace(
            format!(
                "/spec{}/{}/{}/image",
                self.kind.pod_spec(),
                container.container_type,
                container.index
            ),
            image.to_string(),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

#[derive(Debug, Deserialize)]
struct RawReview {
    request: RawRequest,
}

#[derive(Debug, Deserialize)]
struct RequestKind {
    kind: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequest {
    uid: String,
    kind: RequestKind,
    #[serde(default)]
    namespace: String,
    operation: String,
    user_info: UserInfo,
    object: Value,
    #[serde(default)]
    old_object: Option<Value>,
}

/// The `request` part of an incoming AdmissionReview.
#[derive(Clone, Debug)]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: String,
    pub namespace: String,
    pub operation: Operation,
    pub user: String,
    pub object: WorkloadObject,
    pub old_object: Option<WorkloadObject>,
}

impl AdmissionRequest {
    pub fn from_review(review: Value) -> Result<Self> {
        let review: RawReview = serde_json::from_value(review)
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        let request = review.request;

        let operation = Operation::from_str(&request.operation).map_err(|_| {
            Error::InvalidRequest(format!("unknown operation {}", request.operation))
        })?;
        let object = WorkloadObject::new(request.object, &request.namespace)?;
        let old_object = request
            .old_object
            .filter(|old| !old.is_null())
            .map(|old| WorkloadObject::new(old, &request.namespace))
            .transpose()?;

        Ok(Self {
            uid: request.uid,
            kind: request.kind.kind,
            namespace: request.namespace,
            operation,
            user: request.user_info.username,
            object,
            old_object,
        })
    }

    pub fn context(&self) -> RequestContext<'_> {
        RequestContext { request: self }
    }
}

/// Request details attached to every log line and error of one admission.
pub struct RequestContext<'a> {
    request: &'a AdmissionRequest,
}

impl fmt::Display for RequestContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.request;
        write!(
            f,
            "user={} operation={} kind={} name={} namespace={}",
            r.user,
            r.operation,
            r.kind,
            r.object.name(),
            r.namespace
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Status {
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

/// The AdmissionReview sent back to the API server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

impl AdmissionReview {
    /// In detection mode a denial is turned into an admission that carries
    /// the message as a warning.
    pub fn new(
        uid: &str,
        allowed: bool,
        patches: &[JsonPatch],
        message: Option<String>,
        detection_mode: bool,
    ) -> Result<Self> {
        let admitted = allowed || detection_mode;
        let warnings = match (&message, detection_mode && !allowed) {
            (Some(message), true) => Some(vec![message.clone()]),
            _ => None,
        };

        let (patch_type, patch) = match patches.is_empty() {
            true => (None, None),
            false => {
                let encoded = serde_json::to_vec(patches)
                    .map_err(|e| Error::InvalidRequest(format!("json patch: {e}")))?;
                (Some("JSONPatch".to_string()), Some(STANDARD.encode(encoded)))
            }
        };

        Ok(Self {
            api_version: ADMISSION_API_VERSION.into(),
            kind: ADMISSION_KIND.into(),
            response: AdmissionResponse {
                uid: uid.to_string(),
                allowed: admitted,
                status: Status {
                    code: if admitted { 202 } else { 403 },
                    message,
                },
                warnings,
                patch_type,
                patch,
            },
        })
    }
}
