//! Host roles, host specs and pool topologies.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use hostpool_remote::Shell;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// What a host does in the pool. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Single-node install of the whole service.
    Standalone,
    /// Message broker cluster member.
    Broker,
    /// Database cluster member.
    Database,
    /// Application tier; joins an existing broker and database quorum.
    Manager,
    /// Bare compute target, never bootstrapped.
    PlainCompute,
}

impl Role {
    /// Dependency tier. Every host of a lower tier is ready before any host
    /// of a higher tier starts bootstrapping.
    pub fn tier(&self) -> u8 {
        match self {
            Role::Broker | Role::Database | Role::PlainCompute => 0,
            Role::Manager | Role::Standalone => 1,
        }
    }

    pub fn needs_bootstrap(&self) -> bool {
        !matches!(self, Role::PlainCompute)
    }

    /// Member of a broker/database/manager cluster.
    pub fn is_clustered(&self) -> bool {
        matches!(self, Role::Broker | Role::Database | Role::Manager)
    }

    /// Services that must report healthy before a host of this role is
    /// usable.
    pub fn required_services(&self) -> &'static [&'static str] {
        match self {
            Role::Broker => &["queue"],
            Role::Database => &["postgres"],
            Role::Manager => &["api", "cluster"],
            Role::Standalone => &["api"],
            Role::PlainCompute => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Standalone => "standalone",
            Role::Broker => "broker",
            Role::Database => "database",
            Role::Manager => "manager",
            Role::PlainCompute => "plain_compute",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating system of a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    #[default]
    Linux,
    Windows,
}

impl OsFamily {
    pub fn shell(&self) -> Shell {
        match self {
            OsFamily::Linux => Shell::Posix,
            OsFamily::Windows => Shell::PowerShell,
        }
    }
}

/// A host requested from the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    /// Unique within the pool; also the deployment id and the job prefix.
    pub name: String,
    pub role: Role,
    pub os: OsFamily,

    /// Run health verification once bootstrap completes.
    pub finalize: bool,
}

impl HostSpec {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            os: OsFamily::Linux,
            finalize: role.needs_bootstrap(),
        }
    }

    pub fn standalone(name: impl Into<String>) -> Self {
        Self::new(name, Role::Standalone)
    }

    pub fn broker(name: impl Into<String>) -> Self {
        Self::new(name, Role::Broker)
    }

    pub fn database(name: impl Into<String>) -> Self {
        Self::new(name, Role::Database)
    }

    pub fn manager(name: impl Into<String>) -> Self {
        Self::new(name, Role::Manager)
    }

    pub fn compute(name: impl Into<String>) -> Self {
        Self::new(name, Role::PlainCompute)
    }

    /// A Windows compute target.
    pub fn windows(name: impl Into<String>) -> Self {
        Self::new(name, Role::PlainCompute).with_os(OsFamily::Windows)
    }

    pub fn with_os(mut self, os: OsFamily) -> Self {
        self.os = os;
        self
    }

    pub fn with_finalize(mut self, finalize: bool) -> Self {
        self.finalize = finalize;
        self
    }
}

/// Shape of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// One standalone node.
    Single,
    /// One broker, one database, one manager.
    ThreeNode,
    /// Three of each clustered role.
    Full,
    Custom(Vec<HostSpec>),
}

impl Topology {
    pub fn specs(&self) -> Vec<HostSpec> {
        match self {
            Topology::Single => vec![HostSpec::standalone("standalone-0")],
            Topology::ThreeNode => vec![
                HostSpec::broker("broker-0"),
                HostSpec::database("database-0"),
                HostSpec::manager("manager-0"),
            ],
            Topology::Full => (0..3)
                .map(|i| HostSpec::broker(format!("broker-{i}")))
                .chain((0..3).map(|i| HostSpec::database(format!("database-{i}"))))
                .chain((0..3).map(|i| HostSpec::manager(format!("manager-{i}"))))
                .collect(),
            Topology::Custom(specs) => specs.clone(),
        }
    }

    /// Reject topologies that cannot be provisioned or bootstrapped.
    pub fn validate(&self) -> Result<()> {
        validate_specs(&self.specs())
    }
}

impl FromStr for Topology {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "single" => Ok(Topology::Single),
            "three-node" => Ok(Topology::ThreeNode),
            "full" => Ok(Topology::Full),
            other => Err(HarnessError::Configuration(format!(
                "unknown topology '{other}' (expected single, three-node or full)"
            ))),
        }
    }
}

fn validate_specs(specs: &[HostSpec]) -> Result<()> {
    if specs.is_empty() {
        return Err(HarnessError::Configuration("pool has no hosts".into()));
    }

    let mut names = HashSet::new();
    for spec in specs {
        let valid_name = !spec.name.is_empty()
            && spec
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid_name {
            return Err(HarnessError::Configuration(format!(
                "host name '{}' must be non-empty [a-z0-9_-]",
                spec.name
            )));
        }
        if !names.insert(spec.name.as_str()) {
            return Err(HarnessError::Configuration(format!(
                "duplicate host name '{}'",
                spec.name
            )));
        }
        if spec.os == OsFamily::Windows && spec.role != Role::PlainCompute {
            return Err(HarnessError::Configuration(format!(
                "{} host '{}' must run Linux",
                spec.role, spec.name
            )));
        }
    }

    let has = |role: Role| specs.iter().any(|s| s.role == role);

    if has(Role::Standalone) && specs.iter().any(|s| s.role.is_clustered()) {
        return Err(HarnessError::Configuration(
            "standalone hosts cannot be mixed with cluster roles".into(),
        ));
    }
    if has(Role::Manager) && !(has(Role::Broker) && has(Role::Database)) {
        return Err(HarnessError::Configuration(
            "managers need at least one broker and one database".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_preset_topologies_are_valid() {
        for topology in [Topology::Single, Topology::ThreeNode, Topology::Full] {
            topology.validate().unwrap();
        }
        assert_eq!(Topology::Full.specs().len(), 9);
    }

    #[test]
    fn test_tiers() {
        assert!(Role::Broker.tier() < Role::Manager.tier());
        assert!(Role::Database.tier() < Role::Manager.tier());
        assert!(!Role::PlainCompute.needs_bootstrap());
        assert!(!HostSpec::compute("c").finalize);
    }

    #[rstest]
    #[case(Role::Broker, &["queue"])]
    #[case(Role::Database, &["postgres"])]
    #[case(Role::Manager, &["api", "cluster"])]
    #[case(Role::Standalone, &["api"])]
    #[case(Role::PlainCompute, &[])]
    fn test_required_services(#[case] role: Role, #[case] expected: &[&str]) {
        assert_eq!(role.required_services(), expected);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::duplicate(vec![HostSpec::compute("a"), HostSpec::compute("a")])]
    #[case::manager_without_database(vec![HostSpec::broker("b"), HostSpec::manager("m")])]
    #[case::standalone_in_cluster(vec![
        HostSpec::standalone("s"),
        HostSpec::broker("b"),
        HostSpec::database("d"),
    ])]
    #[case::windows_manager(vec![
        HostSpec::broker("b"),
        HostSpec::database("d"),
        HostSpec::manager("m").with_os(OsFamily::Windows),
    ])]
    #[case::bad_name(vec![HostSpec::compute("Web 1")])]
    fn test_invalid_topologies(#[case] specs: Vec<HostSpec>) {
        let err = Topology::Custom(specs).validate().unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn test_windows_compute_is_valid() {
        Topology::Custom(vec![HostSpec::standalone("s"), HostSpec::windows("win-0")])
            .validate()
            .unwrap();
        assert_eq!(OsFamily::Windows.shell(), Shell::PowerShell);
    }

    #[test]
    fn test_parse_topology() {
        assert_eq!("three-node".parse::<Topology>().unwrap(), Topology::ThreeNode);
        assert!("five".parse::<Topology>().is_err());
    }
}
