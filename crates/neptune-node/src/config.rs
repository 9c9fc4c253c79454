//! Node configuration: TOML file, then `NEPTUNE_*` environment, then CLI.
//!
//! ```toml
//! node_name = "node1"
//! shared_key = "change-me"
//! bus_url = "rabbitmq://broker.lan:5672/neptune.relay"
//! log_level = "info"
//! max_hops = 5
//!
//! [[transports]]
//! kind = "udp"
//! id = "udp-lan"
//! options = { port = 32002, broadcast = true }
//!
//! [[users]]
//! username = "bob"
//! public_key = "<64 hex chars>"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use neptune_protocol::{BusEndpoint, DispatcherConfig, NodeCrypto, DEFAULT_DEDUP_CAPACITY};
use neptune_transport::{TransportOptions, UdpTransportConfig, DEFAULT_MAX_HOPS};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub node_name: String,
    /// Per-deployment transit key shared by every node on the bus.
    pub shared_key: String,
    /// Defaults to `internal://<node_name>`.
    pub bus_url: Option<String>,
    pub log_level: String,
    pub max_hops: u32,
    pub dedup_capacity: usize,
    /// Hex Ed25519 seed. A fresh identity is generated when absent.
    pub identity_seed: Option<String>,
    pub transports: Vec<TransportEntry>,
    /// Users hosted on this node, loaded into the in-memory store.
    pub users: Vec<UserEntry>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            shared_key: String::new(),
            bus_url: None,
            log_level: "info".into(),
            max_hops: DEFAULT_MAX_HOPS,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            identity_seed: None,
            transports: Vec::new(),
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum TransportEntry {
    Udp {
        id: String,
        #[serde(default)]
        options: BTreeMap<String, toml::Value>,
    },
}

impl TransportEntry {
    pub fn id(&self) -> &str {
        match self {
            TransportEntry::Udp { id, .. } => id,
        }
    }

    /// Scalar TOML values flattened to the string form transports read.
    pub fn options(&self) -> Result<TransportOptions> {
        let TransportEntry::Udp { id, options } = self;
        options.iter().try_fold(TransportOptions::new(), |acc, (key, value)| {
            let text = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Float(f) => f.to_string(),
                other => bail!(
                    "transport {id}: option {key} must be a scalar, got {}",
                    other.type_str()
                ),
            };
            Ok(acc.set(key.as_str(), text))
        })
    }

    pub fn udp_config(&self) -> Result<UdpTransportConfig> {
        let options = self.options()?;
        UdpTransportConfig::from_options(self.id(), &options)
            .with_context(|| format!("transport {}", self.id()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserEntry {
    pub username: String,
    pub public_key: String,
}

impl NodeConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn merge_with_env(&mut self) -> Result<()> {
        self.merge_vars(std::env::vars())
    }

    /// Apply `NEPTUNE_*` overrides from `vars`.
    pub fn merge_vars(&mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<()> {
        for (key, value) in vars {
            match key.as_str() {
                "NEPTUNE_NODE_NAME" => self.node_name = value,
                "NEPTUNE_SHARED_KEY" => self.shared_key = value,
                "NEPTUNE_BUS_URL" => self.bus_url = Some(value),
                "NEPTUNE_LOG_LEVEL" => self.log_level = value,
                "NEPTUNE_MAX_HOPS" => {
                    self.max_hops = value.parse().with_context(|| {
                        format!("NEPTUNE_MAX_HOPS: expected an integer, got {value:?}")
                    })?
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn bus_url(&self) -> String {
        self.bus_url
            .clone()
            .unwrap_or_else(|| format!("internal://{}", self.node_name))
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::new(self.node_name.clone(), self.shared_key.clone())
            .with_max_hops(self.max_hops)
            .with_dedup_capacity(self.dedup_capacity)
    }

    pub fn crypto(&self) -> Result<NodeCrypto> {
        match &self.identity_seed {
            Some(seed) => Ok(NodeCrypto::from_hex_seed(seed)?),
            None => Ok(NodeCrypto::generate()),
        }
    }

    /// Everything that would otherwise fail halfway through startup.
    pub fn validate(&self) -> Result<()> {
        self.dispatcher_config().validate()?;
        BusEndpoint::parse(&self.bus_url())?;
        tracing_subscriber::EnvFilter::try_new(&self.log_level)
            .with_context(|| format!("log_level {:?}", self.log_level))?;
        if let Some(seed) = &self.identity_seed {
            NodeCrypto::from_hex_seed(seed)?;
        }

        let mut ids = HashSet::new();
        for entry in &self.transports {
            if entry.id().is_empty() {
                bail!("transport with empty id");
            }
            if !ids.insert(entry.id()) {
                bail!("duplicate transport id {:?}", entry.id());
            }
            entry.udp_config()?;
        }

        let mut users = HashSet::new();
        for user in &self.users {
            if user.username.is_empty() || user.username.contains('@') {
                bail!("invalid username {:?}", user.username);
            }
            if !users.insert(user.username.as_str()) {
                bail!("duplicate user {:?}", user.username);
            }
            let key_ok = user.public_key.len() == 64
                && user.public_key.chars().all(|c| c.is_ascii_hexdigit());
            if !key_ok {
                bail!("user {}: public_key must be 64 hex characters", user.username);
            }
        }
        Ok(())
    }
}
