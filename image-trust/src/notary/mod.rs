// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Notary v1 backend.
//!
//! The trust data of a repository is a set of TUF roles (`root`,
//! `timestamp`, `snapshot`, `targets` and delegations of `targets`) that are
//! fetched together and verified against a pinned root key.

pub mod client;
pub mod key_store;
pub mod trust_data;
pub mod tuf_role;
pub mod validator;

#[cfg(test)]
mod fixtures;

pub use client::{Notary, NotaryConfig, TrustDataFetcher};
pub use key_store::KeyStore;
pub use trust_data::TrustData;
pub use tuf_role::TufRole;
pub use validator::{NotaryV1Validator, TrustChainValidator};
