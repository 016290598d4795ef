// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A verification failure of one image. Only the source is shown to the
    /// requester, the context ends up in the log.
    #[error("{source}")]
    Admission {
        context: String,
        #[source]
        source: image_trust::Error,
    },

    #[error("invalid admission request: {0}")]
    InvalidRequest(String),

    #[error("{0} is not a supported kind")]
    UnsupportedKind(String),

    #[error("{api_version} is not in the supported API version list for {kind} {name}")]
    UnknownApiVersion {
        api_version: String,
        kind: String,
        name: String,
    },

    #[error("couldn't find the right parent resource {kind} {name}")]
    ParentNotFound {
        kind: String,
        name: String,
        uid: String,
    },

    #[error("request to the kubernetes API at {path} failed")]
    KubeApi {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid validation config: {0}")]
    Config(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Trust(#[from] image_trust::Error),
}
