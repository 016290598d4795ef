// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} is not a valid image reference")]
    InvalidImageFormat(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("{0}")]
    NotFound(String),

    #[error("no matching policy rule could be found for image {0}")]
    NoMatchingPolicyRule(String),

    #[error("trust root of type {0} is not supported for this operation")]
    WrongKey(String),

    #[error("{0} is an unsupported authentication type")]
    UnknownType(String),

    #[error("potential path traversal in authentication url {0}")]
    PathTraversal(String),

    #[error("found multiple signed digests for image {0}")]
    AmbiguousDigest(String),

    #[error("not all required delegations have trust data for image {0}")]
    InsufficientTrustData(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("{0} is not a supported validator type")]
    UnsupportedValidator(String),

    #[error("http request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl Error {
    /// `true` for the variant a missing resource maps to. Delegation files that
    /// were declared but never signed surface this way.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
