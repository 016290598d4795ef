// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Trust verification for container images.
//!
//! An [`reference::ImageReference`] is matched against the configured policy by
//! [`policy::PolicyMatcher`], and the selected [`validator::Validator`] resolves
//! the digest the image is signed for. The notary backend walks the TUF trust
//! chain served next to a registry.

pub mod error;
pub mod notary;
pub mod policy;
pub mod reference;
pub mod trust_root;
pub mod validator;

pub use error::{Error, Result};
pub use policy::{PolicyMatcher, PolicyRule};
pub use reference::ImageReference;
pub use trust_root::TrustRoot;
pub use validator::{Validator, ValidatorConfig, Validators};
