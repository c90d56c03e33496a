//! Replica-set topology of the metadata store
//!
//! Membership changes follow a compare-and-increment protocol: read the
//! current config, submit a copy with `version + 1`, and start over from a
//! fresh read when the stored version moved in between.

use crate::error::{MetaStoreError, MetaStoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One member of the replica set
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMember {
    pub id: u32,
    pub host: String,
}

/// Stored replica-set configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetConfig {
    pub name: String,
    pub version: u64,
    pub members: Vec<ReplicaMember>,
    /// Host currently acting as primary
    pub primary: Option<String>,
}

impl ReplicaSetConfig {
    /// First config of a new set, version 1 with the first member as primary
    #[must_use]
    pub fn initial(name: impl Into<String>, hosts: &[String]) -> Self {
        Self {
            name: name.into(),
            version: 1,
            members: members_from_hosts(hosts),
            primary: hosts.first().cloned(),
        }
    }

    /// Next version of this config with a new member list. The primary is
    /// kept when it is still a member.
    #[must_use]
    pub fn with_members(&self, hosts: &[String]) -> Self {
        let primary = self
            .primary
            .clone()
            .filter(|p| hosts.contains(p))
            .or_else(|| hosts.first().cloned());
        Self {
            name: self.name.clone(),
            version: self.version + 1,
            members: members_from_hosts(hosts),
            primary,
        }
    }

    /// Next version of this config with the primary role handed to the
    /// member after the current primary, skipping `unhealthy` hosts
    #[must_use]
    pub fn with_next_primary(&self, unhealthy: &HashSet<String>) -> Self {
        let hosts = self.hosts();
        let current = self
            .primary
            .as_deref()
            .and_then(|p| hosts.iter().position(|h| *h == p))
            .unwrap_or(0);
        let primary = (1..=hosts.len())
            .map(|offset| hosts[(current + offset) % hosts.len()])
            .find(|h| !unhealthy.contains(*h))
            .map(ToString::to_string);
        Self {
            name: self.name.clone(),
            version: self.version + 1,
            members: self.members.clone(),
            primary,
        }
    }

    #[must_use]
    pub fn hosts(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.host.as_str()).collect()
    }
}

fn members_from_hosts(hosts: &[String]) -> Vec<ReplicaMember> {
    hosts
        .iter()
        .zip(0u32..)
        .map(|(host, id)| ReplicaMember {
            id,
            host: host.clone(),
        })
        .collect()
}

/// Observed state of a member
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberState {
    Primary,
    Secondary,
    Startup,
    Recovering,
    Down,
}

impl MemberState {
    /// Whether the member takes part in replication
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Primary | Self::Secondary)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub host: String,
    pub state: MemberState,
}

/// Result of a replica-set status command
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetStatus {
    pub set: String,
    pub version: u64,
    pub members: Vec<MemberStatus>,
}

impl ReplicaSetStatus {
    #[must_use]
    pub fn primary(&self) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.state == MemberState::Primary)
            .map(|m| m.host.as_str())
    }

    #[must_use]
    pub fn all_healthy(&self) -> bool {
        self.members.iter().all(|m| m.state.is_healthy())
    }
}

/// Replica-set record shared by the backends
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct ReplicaState {
    pub config: Option<ReplicaSetConfig>,
    pub feature_version: Option<String>,
    /// Member states reported by the store; unlisted members are healthy
    #[serde(default)]
    pub member_states: HashMap<String, MemberState>,
}

impl ReplicaState {
    pub fn initiate(&mut self, config: ReplicaSetConfig) -> MetaStoreResult<()> {
        if let Some(existing) = &self.config {
            return Err(MetaStoreError::ReplicaSetAlreadyInitiated(existing.name.clone()));
        }
        self.config = Some(config);
        Ok(())
    }

    pub fn reconfigure(&mut self, config: ReplicaSetConfig) -> MetaStoreResult<()> {
        let current = self.config.as_ref().ok_or(MetaStoreError::ReplicaSetNotInitiated)?;
        let expected = config.version.saturating_sub(1);
        if current.version != expected {
            return Err(MetaStoreError::VersionMismatch {
                expected,
                actual: current.version,
            });
        }
        self.config = Some(config);
        Ok(())
    }

    pub fn status(&self) -> MetaStoreResult<ReplicaSetStatus> {
        let config = self.config.as_ref().ok_or(MetaStoreError::ReplicaSetNotInitiated)?;
        let members = config
            .members
            .iter()
            .map(|m| {
                let reported = self.member_states.get(&m.host).copied();
                let state = match reported {
                    Some(state) if !state.is_healthy() => state,
                    _ if config.primary.as_deref() == Some(m.host.as_str()) => MemberState::Primary,
                    _ => MemberState::Secondary,
                };
                MemberStatus {
                    host: m.host.clone(),
                    state,
                }
            })
            .collect();
        Ok(ReplicaSetStatus {
            set: config.name.clone(),
            version: config.version,
            members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_reconfigure_requires_next_version() {
        let mut state = ReplicaState::default();
        let initial = ReplicaSetConfig::initial("rs0", &hosts(&["a:1", "b:1"]));
        state.initiate(initial.clone()).unwrap();

        let next = initial.with_members(&hosts(&["a:1", "b:1", "c:1"]));
        assert_eq!(next.version, 2);
        state.reconfigure(next.clone()).unwrap();

        let stale = initial.with_members(&hosts(&["a:1"]));
        let err = state.reconfigure(stale).unwrap_err();
        assert!(matches!(err, MetaStoreError::VersionMismatch { expected: 1, actual: 2 }));
    }

    #[test]
    fn test_initiate_twice_fails() {
        let mut state = ReplicaState::default();
        state.initiate(ReplicaSetConfig::initial("rs0", &hosts(&["a:1"]))).unwrap();
        assert!(state.initiate(ReplicaSetConfig::initial("rs0", &hosts(&["a:1"]))).is_err());
    }

    #[test]
    fn test_step_down_skips_unhealthy_members() {
        let mut state = ReplicaState::default();
        let initial = ReplicaSetConfig::initial("rs0", &hosts(&["a:1", "b:1", "c:1"]));
        state.initiate(initial.clone()).unwrap();
        state.member_states.insert("b:1".to_string(), MemberState::Down);

        let unhealthy: HashSet<String> = ["b:1".to_string()].into();
        let next = initial.with_next_primary(&unhealthy);
        assert_eq!(next.version, 2);
        assert_eq!(next.members, initial.members);
        state.reconfigure(next).unwrap();

        let status = state.status().unwrap();
        assert_eq!(status.primary(), Some("c:1"));
        assert_eq!(status.version, 2);
        assert!(!status.all_healthy());
    }
}
