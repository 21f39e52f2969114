//! Per-topic authorization: who may publish, subscribe, or listen, and with
//! which entitlements.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use bitflags::bitflags;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::BrokerError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct Role: u8 {
        const Subscriber = 1;
        const Publisher = 2;
        const Notifier = 4;
        const All = 7;
    }
}

/// One authorization rule. Patterns are compiled anchored so a spec matches
/// whole user and topic strings only.
#[derive(Debug, Clone)]
pub struct AuthorizationSpec {
    user_pattern: Regex,
    topic_pattern: Regex,
    roles: Role,
    entitlements: HashSet<i32>,
}

impl AuthorizationSpec {
    pub fn new(
        user_pattern: &str,
        topic_pattern: &str,
        roles: Role,
        entitlements: HashSet<i32>,
    ) -> Result<Self, BrokerError> {
        Ok(AuthorizationSpec {
            user_pattern: anchored(user_pattern)?,
            topic_pattern: anchored(topic_pattern)?,
            roles,
            entitlements,
        })
    }

    fn matches(&self, user: &str, topic: &str, role: Role) -> bool {
        self.roles.contains(role)
            && self.user_pattern.is_match(user)
            && self.topic_pattern.is_match(topic)
    }
}

fn anchored(pattern: &str) -> Result<Regex, BrokerError> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| BrokerError::Config(format!("invalid pattern {pattern:?}: {e}")))
}

/// Parses `<user-pattern>:<topic-pattern>:<entitlements>:<roles>`, e.g.
/// `joe:.*\.LSE:1,2:Subscriber|Notifier`.
impl FromStr for AuthorizationSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 {
            return Err(format!("expected 4 parts, found {}", parts.len()));
        }

        let entitlements = parts[2]
            .split(',')
            .map(|x| x.trim().parse().map_err(|e| format!("invalid entitlement: {e}")))
            .collect::<Result<HashSet<i32>, String>>()?;
        let roles: Role =
            bitflags::parser::from_str(parts[3]).map_err(|e| format!("invalid roles: {e}"))?;

        AuthorizationSpec::new(parts[0], parts[1], roles, entitlements).map_err(|e| e.to_string())
    }
}

/// YAML rule value: `{ role: <All|Subscriber|...>, entitlements: [int, ...] }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Authorization {
    pub role: Role,
    pub entitlements: Vec<i32>,
}

/// The ordered rule list plus a memo cache keyed by `(user, topic, role)`.
/// First matching spec wins; a miss against every spec yields the empty set.
/// Entries are never evicted; the cache is bounded by the live working set.
pub struct AuthorizationRepository {
    specs: Vec<AuthorizationSpec>,
    cache: HashMap<(String, String, Role), Arc<HashSet<i32>>>,
}

impl AuthorizationRepository {
    pub fn new(specs: Vec<AuthorizationSpec>) -> Self {
        AuthorizationRepository {
            specs,
            cache: HashMap::new(),
        }
    }

    /// Load rules from a YAML file, or fall back to the command-line specs.
    /// With neither, a single permissive rule grants every user every role on
    /// every topic for public (entitlement 0) packets only.
    pub fn make(
        path: Option<&Path>,
        cmd_line_specs: &[AuthorizationSpec],
    ) -> Result<Self, BrokerError> {
        if let Some(path) = path {
            return Self::load(path);
        }

        let mut specs = cmd_line_specs.to_vec();
        if specs.is_empty() {
            tracing::info!("using default authorizations");
            specs.push(AuthorizationSpec::new(
                ".*",
                ".*",
                Role::All,
                HashSet::from([0]),
            )?);
        }

        Ok(Self::new(specs))
    }

    fn load(path: &Path) -> Result<Self, BrokerError> {
        tracing::info!("loading authorizations from {}", path.display());

        let file = fs::File::open(path)?;
        let config: BTreeMap<String, BTreeMap<String, Authorization>> =
            serde_yaml::from_reader(file)
                .map_err(|e| BrokerError::Config(format!("invalid authorizations file: {e}")))?;

        let mut specs = Vec::new();
        for (user_pattern, topic_authorizations) in &config {
            for (topic_pattern, authorization) in topic_authorizations {
                specs.push(AuthorizationSpec::new(
                    user_pattern,
                    topic_pattern,
                    authorization.role,
                    authorization.entitlements.iter().copied().collect(),
                )?);
            }
        }

        Ok(Self::new(specs))
    }

    pub fn entitlements(&mut self, user: &str, topic: &str, role: Role) -> Arc<HashSet<i32>> {
        let key = (user.to_string(), topic.to_string(), role);
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }

        let entitlements = self
            .specs
            .iter()
            .find(|spec| spec.matches(user, topic, role))
            .map(|spec| spec.entitlements.clone())
            .unwrap_or_default();

        let entitlements = Arc::new(entitlements);
        self.cache.insert(key, entitlements.clone());
        entitlements
    }
}
