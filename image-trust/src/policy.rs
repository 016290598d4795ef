// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Image policy rules and selection of the most specific matching rule.
//!
//! Patterns are shell style globs matched against the whole canonical image
//! reference, so `*` may cross `/` boundaries. A pattern without a `:` gets
//! `:*` appended to cover any tag.

use std::cmp::Ordering;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, ImageReference, Result};

/// Validator name used when a rule does not name one.
pub const DEFAULT_VALIDATOR: &str = "default";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PolicyRule {
    pub pattern: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,

    /// Free form arguments handed to the validator, e.g. `delegations` or
    /// `trustRoot`.
    #[serde(default, rename = "with", skip_serializing_if = "Map::is_empty")]
    pub arguments: Map<String, Value>,
}

impl PolicyRule {
    pub fn validator_name(&self) -> &str {
        self.validator.as_deref().unwrap_or(DEFAULT_VALIDATOR)
    }
}

/// Policy rules with their glob patterns compiled once.
#[derive(Debug)]
pub struct PolicyMatcher {
    rules: Vec<(PolicyRule, Regex)>,
}

impl PolicyMatcher {
    pub fn new(rules: Vec<PolicyRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let glob = glob_to_regex(&with_tag_wildcard(&rule.pattern))?;
                Ok((rule, glob))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> impl Iterator<Item = &PolicyRule> {
        self.rules.iter().map(|(rule, _)| rule)
    }

    /// Return the most specific rule whose pattern matches `image`.
    pub fn matching_rule(&self, image: &ImageReference) -> Result<&PolicyRule> {
        let image_str = image.to_string();

        let mut best: Option<(Match, &PolicyRule)> = None;
        for (rule, glob) in &self.rules {
            if !glob.is_match(&image_str) {
                continue;
            }
            let candidate = Match::new(&rule.pattern, &image_str);
            best = match best {
                Some((current, current_rule)) => match candidate.compare(&current) {
                    Ordering::Greater => Some((candidate, rule)),
                    _ => Some((current, current_rule)),
                },
                None => Some((candidate, rule)),
            };
        }

        best.map(|(_, rule)| rule)
            .ok_or_else(|| Error::NoMatchingPolicyRule(image_str))
    }
}

fn with_tag_wildcard(pattern: &str) -> String {
    match pattern.contains(':') {
        true => pattern.to_string(),
        false => format!("{pattern}:*"),
    }
}

/// Translate a shell glob into an anchored regex. Supports `*`, `?`, `[seq]`
/// and `[!seq]`; an unterminated `[` is taken literally.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("(?s)^");
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut j = i;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    out.push_str(r"\[");
                    continue;
                }
                let mut class: String = chars[i..j].iter().collect();
                if let Some(negated) = class.strip_prefix('!') {
                    class = format!("^{}", negated.replace('\\', r"\\").replace('[', r"\["));
                } else {
                    class = class.replace('\\', r"\\").replace('[', r"\[");
                }
                out.push('[');
                out.push_str(&class);
                out.push(']');
                i = j + 1;
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| Error::InvalidFormat(format!("policy pattern {pattern}: {e}")))
}

/// Specificity of a rule pattern relative to one image.
#[derive(Debug, PartialEq, Eq)]
struct Match {
    component_count: usize,
    component_lengths: Vec<usize>,
    prefix_lengths: Vec<usize>,
}

impl Match {
    fn new(rule: &str, image: &str) -> Self {
        let pattern = with_tag_wildcard(rule);
        let components: Vec<&str> = pattern.split('/').collect();
        let image_components: Vec<&str> = image.split('/').collect();

        let component_lengths = components.iter().map(|c| c.chars().count()).collect();
        let prefix_lengths = components
            .iter()
            .enumerate()
            .map(|(i, component)| {
                image_components
                    .get(i)
                    .map(|image_component| common_prefix_len(component, image_component))
                    .unwrap_or_default()
            })
            .collect();

        Self {
            component_count: components.len(),
            component_lengths,
            prefix_lengths,
        }
    }

    /// `Greater` if `self` is more specific than `other`.
    ///
    /// The final comparison of raw component lengths only ever looks at the
    /// first component: a longer first component wins, anything else keeps
    /// `other`.
    fn compare(&self, other: &Match) -> Ordering {
        match self.component_count.cmp(&other.component_count) {
            Ordering::Equal => {}
            decided => return decided,
        }

        for (own, theirs) in self.prefix_lengths.iter().zip(&other.prefix_lengths) {
            match own.cmp(theirs) {
                Ordering::Equal => continue,
                decided => return decided,
            }
        }

        match (self.component_lengths.first(), other.component_lengths.first()) {
            (Some(own), Some(theirs)) if own > theirs => Ordering::Greater,
            _ => Ordering::Less,
        }
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}
