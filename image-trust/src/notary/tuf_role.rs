// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

use crate::{Error, Result};

lazy_static! {
    static ref ROLE_REGEX: Regex = Regex::new(r"^(root|(targets(/[^/\s]+)?)|snapshot|timestamp)$")
        .expect("role regex is valid");
}

pub const DELEGATION_PREFIX: &str = "targets/";

/// The fixed set of TUF roles, plus named delegations below `targets`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TufRole {
    Root,
    Snapshot,
    Timestamp,
    Targets,
    /// `targets/<name>`, holding the full role name.
    Delegation(String),
}

impl TufRole {
    /// Prefix `targets/` onto a short delegation name.
    pub fn delegation(name: &str) -> Result<Self> {
        match name.starts_with(DELEGATION_PREFIX) {
            true => name.parse(),
            false => format!("{DELEGATION_PREFIX}{name}").parse(),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TufRole::Root => "root",
            TufRole::Snapshot => "snapshot",
            TufRole::Timestamp => "timestamp",
            TufRole::Targets => "targets",
            TufRole::Delegation(name) => name,
        }
    }
}

impl FromStr for TufRole {
    type Err = Error;

    fn from_str(role: &str) -> Result<Self> {
        if !ROLE_REGEX.is_match(role) {
            return Err(Error::InvalidFormat(format!("{role} is not a valid TUF role")));
        }
        Ok(match role {
            "root" => TufRole::Root,
            "snapshot" => TufRole::Snapshot,
            "timestamp" => TufRole::Timestamp,
            "targets" => TufRole::Targets,
            delegation => TufRole::Delegation(delegation.to_string()),
        })
    }
}

impl fmt::Display for TufRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("root", TufRole::Root)]
    #[case("snapshot", TufRole::Snapshot)]
    #[case("timestamp", TufRole::Timestamp)]
    #[case("targets", TufRole::Targets)]
    #[case("targets/releases", TufRole::Delegation("targets/releases".into()))]
    fn parse_role(#[case] role: &str, #[case] expected: TufRole) {
        let parsed: TufRole = role.parse().expect("valid role");
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), role);
    }

    #[rstest]
    #[case("")]
    #[case("root/")]
    #[case("targets/")]
    #[case("targets/a/b")]
    #[case("targets/with space")]
    #[case("delegation")]
    fn parse_invalid_role(#[case] role: &str) {
        assert!(matches!(role.parse::<TufRole>(), Err(Error::InvalidFormat(_))));
    }

    #[rstest]
    #[case("phbelitz", "targets/phbelitz")]
    #[case("targets/chamsen", "targets/chamsen")]
    fn normalize_delegation(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(TufRole::delegation(name).expect("valid name").as_str(), expected);
    }
}
