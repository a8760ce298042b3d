use crate::ring::types::{default_host, MaskDisclosure, NodeId, NodeIdentity, PkiPaths, RingMember};
use crate::secure_sum::{MaskRange, Modulus, SumError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Arithmetic(#[from] SumError),
    #[error("ring has no members")]
    EmptyRing,
    #[error("node {0} appears more than once")]
    DuplicateNode(NodeId),
    #[error("node {node} names unknown successor {successor}")]
    UnknownSuccessor { node: NodeId, successor: NodeId },
    #[error("successors do not form a single cycle through all {0} nodes")]
    NotARing(usize),
    #[error("node {0} is not in the ring")]
    UnknownNode(NodeId),
    #[error("value {value} must be below modulus {modulus}")]
    ValueOutOfRange { value: u64, modulus: u64 },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RingConfig {
    #[serde(default = "default_modulus")]
    pub modulus: u64,
    /// Defaults to every residue `[0, modulus - 1]`.
    #[serde(default)]
    pub mask: Option<MaskConfig>,
    #[serde(default)]
    pub mask_disclosure: MaskDisclosure,
    #[serde(default = "default_nodes")]
    pub nodes: Vec<RingMember>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub pki: PkiConfig,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaskConfig {
    pub min: u64,
    pub max: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TimingConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_result_timeout")]
    pub result_timeout_ms: u64,
    #[serde(default = "default_drain")]
    pub drain_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PkiConfig {
    #[serde(default = "default_pki_dir")]
    pub dir: PathBuf,
    /// Name every server certificate is checked against.
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_modulus() -> u64 {
    1500
}

fn default_nodes() -> Vec<RingMember> {
    vec![
        RingMember {
            id: 1,
            host: default_host(),
            port: 8441,
            successor: 2,
        },
        RingMember {
            id: 2,
            host: default_host(),
            port: 8442,
            successor: 3,
        },
        RingMember {
            id: 3,
            host: default_host(),
            port: 8443,
            successor: 1,
        },
    ]
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_io_timeout() -> u64 {
    30_000
}

fn default_result_timeout() -> u64 {
    30_000
}

fn default_drain() -> u64 {
    2_000
}

fn default_pki_dir() -> PathBuf {
    PathBuf::from("pki")
}

fn default_server_name() -> String {
    "localhost".to_string()
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            io_timeout_ms: default_io_timeout(),
            result_timeout_ms: default_result_timeout(),
            drain_ms: default_drain(),
        }
    }
}

impl TimingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms.max(1))
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            dir: default_pki_dir(),
            server_name: default_server_name(),
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            modulus: default_modulus(),
            mask: None,
            mask_disclosure: MaskDisclosure::default(),
            nodes: default_nodes(),
            timing: TimingConfig::default(),
            pki: PkiConfig::default(),
        }
    }
}

impl RingConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: RingConfig = serde_json::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn modulus(&self) -> Result<Modulus, ConfigError> {
        Ok(Modulus::new(self.modulus)?)
    }

    pub fn mask_range(&self) -> Result<MaskRange, ConfigError> {
        let modulus = self.modulus()?;
        match self.mask {
            Some(m) => Ok(MaskRange::new(m.min, m.max, modulus)?),
            None => Ok(MaskRange::full(modulus)),
        }
    }

    pub fn check_value(&self, value: u64) -> Result<(), ConfigError> {
        if value >= self.modulus {
            return Err(ConfigError::ValueOutOfRange {
                value,
                modulus: self.modulus,
            });
        }
        Ok(())
    }

    /// Checks arithmetic parameters and that the successor links form one
    /// cycle visiting every node exactly once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mask_range()?;
        if self.nodes.is_empty() {
            return Err(ConfigError::EmptyRing);
        }
        let mut by_id: HashMap<NodeId, &RingMember> = HashMap::new();
        for m in &self.nodes {
            if by_id.insert(m.id, m).is_some() {
                return Err(ConfigError::DuplicateNode(m.id));
            }
        }
        for m in &self.nodes {
            if !by_id.contains_key(&m.successor) {
                return Err(ConfigError::UnknownSuccessor {
                    node: m.id,
                    successor: m.successor,
                });
            }
        }

        let start = self.nodes[0].id;
        let mut seen = HashSet::new();
        let mut cur = start;
        loop {
            if !seen.insert(cur) {
                break;
            }
            cur = by_id[&cur].successor;
        }
        if cur != start || seen.len() != self.nodes.len() {
            return Err(ConfigError::NotARing(self.nodes.len()));
        }
        Ok(())
    }

    pub fn member(&self, id: NodeId) -> Result<&RingMember, ConfigError> {
        self.nodes
            .iter()
            .find(|m| m.id == id)
            .ok_or(ConfigError::UnknownNode(id))
    }

    pub fn identity(&self, id: NodeId) -> Result<NodeIdentity, ConfigError> {
        let member = self.member(id)?.clone();
        let successor = self.member(member.successor)?.clone();
        Ok(NodeIdentity {
            member,
            successor,
            pki: PkiPaths::for_node(&self.pki.dir, id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn member(id: NodeId, successor: NodeId) -> RingMember {
        RingMember {
            id,
            host: default_host(),
            port: 9000 + id as u16,
            successor,
        }
    }

    #[test]
    fn default_is_three_node_ring() {
        let cfg = RingConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.modulus, 1500);
        let id = cfg.identity(3).unwrap();
        assert_eq!(id.member.port, 8443);
        assert_eq!(id.successor.id, 1);
        assert_eq!(id.pki.server_cert, PathBuf::from("pki/server/server3.crt"));
        assert_eq!(id.pki.client_key, PathBuf::from("pki/client/client3.key"));
        assert_eq!(cfg.mask_range().unwrap(), MaskRange::full(cfg.modulus().unwrap()));
    }

    #[test]
    fn rejects_broken_topologies() {
        let mut cfg = RingConfig::default();

        cfg.nodes = vec![member(1, 2), member(2, 7)];
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownSuccessor { node: 2, successor: 7 })
        ));

        cfg.nodes = vec![member(1, 2), member(1, 2)];
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateNode(1))));

        // two disjoint cycles
        cfg.nodes = vec![member(1, 2), member(2, 1), member(3, 4), member(4, 3)];
        assert!(matches!(cfg.validate(), Err(ConfigError::NotARing(4))));

        // tail leading into a cycle
        cfg.nodes = vec![member(1, 2), member(2, 3), member(3, 2)];
        assert!(matches!(cfg.validate(), Err(ConfigError::NotARing(3))));

        cfg.nodes = Vec::new();
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyRing)));
    }

    #[test]
    fn single_node_ring_is_valid() {
        let cfg = RingConfig {
            nodes: vec![member(5, 5)],
            ..RingConfig::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_wide_mask_range() {
        let cfg = RingConfig {
            modulus: 1500,
            mask: Some(MaskConfig { min: 1, max: 2000 }),
            ..RingConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Arithmetic(SumError::MaskRangeTooWide { .. }))
        ));
    }

    #[test]
    fn value_must_be_below_modulus() {
        let cfg = RingConfig::default();
        assert!(cfg.check_value(1499).is_ok());
        assert!(matches!(
            cfg.check_value(1500),
            Err(ConfigError::ValueOutOfRange { value: 1500, modulus: 1500 })
        ));
    }

    #[test]
    fn loads_json_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "modulus": 1000,
                "mask_disclosure": "in_message",
                "nodes": [
                    {{"id": 1, "port": 7001, "successor": 2}},
                    {{"id": 2, "host": "localhost", "port": 7002, "successor": 1}}
                ],
                "timing": {{"drain_ms": 50}}
            }}"#
        )
        .unwrap();

        let cfg = RingConfig::load(file.path()).unwrap();
        assert_eq!(cfg.modulus, 1000);
        assert_eq!(cfg.mask_disclosure, MaskDisclosure::InMessage);
        assert_eq!(cfg.nodes[0].host, "127.0.0.1");
        assert_eq!(cfg.nodes[1].address(), "localhost:7002");
        assert_eq!(cfg.timing.drain(), Duration::from_millis(50));
        assert_eq!(cfg.timing.result_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.pki.server_name, "localhost");
    }

    #[test]
    fn load_reports_missing_file_and_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("ring.json");
        assert!(matches!(RingConfig::load(&missing), Err(ConfigError::Read { .. })));

        fs::write(&missing, "{ not json").unwrap();
        assert!(matches!(RingConfig::load(&missing), Err(ConfigError::Parse(_))));
    }
}
