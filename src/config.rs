//! YAML configuration.
//!
//! Parsed with serde and patched with defaults afterwards, so a partial
//! document (or none of the optional sections at all) yields a fully
//! runnable configuration. Duplicate agent addresses are fatal.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::database::{AgentSpec, DatabaseSettings};
use crate::error::ConfigError;

const DFLT_AGGREGATION_PERIOD: i64 = 60;
const DFLT_SNMP_COMMUNITY: &str = "public";
const DFLT_COMPRESSION_LEVEL: u32 = 6;
const DFLT_DATA_DIR: &str = "data";
const DFLT_CACHE_TIME: i64 = 1800;

const DFLT_NETFLOW_V9_LISTEN: &str = ":2055";
const DFLT_IPFIX_LISTEN: &str = ":4739";
const DFLT_SFLOW_LISTEN: &str = ":6343";
const DFLT_FRONTEND_LISTEN: &str = ":4444";

const DFLT_BIRD_SOCKET: &str = "/var/run/bird/bird.ctl";
const DFLT_BIRD6_SOCKET: &str = "/var/run/bird/bird6.ctl";

/// One listener section (`netflow_v9`, `ipfix`, `sflow`, `frontend`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Server {
    pub enabled: Option<bool>,
    pub listen: String,
}

impl Server {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// BGP augmentation section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BgpAugmentation {
    pub enabled: bool,
    pub bird_socket: String,
    pub bird6_socket: String,
}

/// One flow-exporting agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Agent {
    pub name: String,
    pub ip_address: IpAddr,
    #[serde(default)]
    pub snmp_community: String,
    /// Sample-rate override for this agent; 0 keeps the rate the exporter
    /// reports on the wire.
    #[serde(default)]
    pub sample_rate: u64,
}

/// External annotator hook.
#[derive(Debug, Clone, Deserialize)]
pub struct Annotator {
    pub name: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub aggregation_period: i64,
    pub default_snmp_community: String,
    pub debug: i32,
    pub compression_level: Option<u32>,
    pub data_dir: String,
    pub anonymize: bool,
    pub cache_time: Option<i64>,

    pub netflow_v9: Server,
    pub ipfix: Server,
    pub sflow: Server,
    pub frontend: Server,
    pub bgp_augmentation: BgpAugmentation,
    pub agents: Vec<Agent>,
    pub annotators: Vec<Annotator>,

    #[serde(skip)]
    pub agents_name_by_ip: HashMap<IpAddr, String>,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &str) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Config::parse(&raw)
    }

    /// Parse a configuration document.
    pub fn parse(raw: &str) -> Result<Config, ConfigError> {
        let mut cfg: Config = serde_yaml::from_str(raw)?;
        cfg.defaults();

        cfg.agents_name_by_ip = HashMap::new();
        for agent in &cfg.agents {
            if cfg.agents_name_by_ip.contains_key(&agent.ip_address) {
                return Err(ConfigError::DuplicateAgent(agent.name.clone()));
            }
            cfg.agents_name_by_ip
                .insert(agent.ip_address, agent.name.clone());
        }

        Ok(cfg)
    }

    fn defaults(&mut self) {
        if self.aggregation_period == 0 {
            self.aggregation_period = DFLT_AGGREGATION_PERIOD;
        }
        if self.default_snmp_community.is_empty() {
            self.default_snmp_community = DFLT_SNMP_COMMUNITY.to_string();
        }
        if self.compression_level.is_none() {
            self.compression_level = Some(DFLT_COMPRESSION_LEVEL);
        }
        if self.data_dir.is_empty() {
            self.data_dir = DFLT_DATA_DIR.to_string();
        }
        if self.cache_time.is_none() {
            self.cache_time = Some(DFLT_CACHE_TIME);
        }

        for (server, listen) in [
            (&mut self.netflow_v9, DFLT_NETFLOW_V9_LISTEN),
            (&mut self.ipfix, DFLT_IPFIX_LISTEN),
            (&mut self.sflow, DFLT_SFLOW_LISTEN),
            (&mut self.frontend, DFLT_FRONTEND_LISTEN),
        ] {
            if server.listen.is_empty() {
                server.listen = listen.to_string();
            }
            if server.enabled.is_none() {
                server.enabled = Some(true);
            }
        }

        if self.bgp_augmentation.bird_socket.is_empty() {
            self.bgp_augmentation.bird_socket = DFLT_BIRD_SOCKET.to_string();
        }
        if self.bgp_augmentation.bird6_socket.is_empty() {
            self.bgp_augmentation.bird6_socket = DFLT_BIRD6_SOCKET.to_string();
        }

        for agent in &mut self.agents {
            if agent.snmp_community.is_empty() {
                agent.snmp_community = self.default_snmp_community.clone();
            }
        }
    }

    /// The database construction parameters this configuration describes.
    pub fn database_settings(&self) -> DatabaseSettings {
        DatabaseSettings {
            aggregation_period: self.aggregation_period,
            cache_time: self.cache_time.unwrap_or(DFLT_CACHE_TIME),
            sample_rate: 1,
            compression_level: self.compression_level.unwrap_or(DFLT_COMPRESSION_LEVEL),
            storage: PathBuf::from(&self.data_dir),
            anonymize: self.anonymize,
            bgp_augmentation: self.bgp_augmentation.enabled,
            agents: self
                .agents
                .iter()
                .map(|a| AgentSpec {
                    name: a.name.clone(),
                    ip_address: a.ip_address,
                    sample_rate: a.sample_rate,
                })
                .collect(),
        }
    }
}

/// Turn a Go-style `:port` listen string into a bindable address.
pub fn listen_addr(listen: &str) -> String {
    if let Some(port) = listen.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        listen.to_string()
    }
}
