//! Job Data Model
//!
//! Submitted job descriptors and their planned form: access bitsets,
//! typed channels, node descriptors and materialized workers.

mod channel;

pub use channel::classify_channel;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path::{has_control_chars, parse_location, Location};

/// Channel access bits
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Access(pub u32);

impl Access {
    /// No access resolved yet (unknown device)
    pub const NONE: Access = Access(0);
    /// Sequential read
    pub const READ: Access = Access(1);
    /// Sequential write
    pub const WRITE: Access = Access(2);
    /// Random access
    pub const RANDOM: Access = Access(4);
    /// Inter-node network channel
    pub const NETWORK: Access = Access(8);
    /// Append, cdr-style read-then-write
    pub const CDR: Access = Access(16);

    /// Union of two access sets
    pub const fn union(self, other: Access) -> Access {
        Access(self.0 | other.0)
    }

    /// True when all bits of `other` are present
    pub fn contains(self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Access::READ)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Access::WRITE)
    }

    pub fn is_cdr(self) -> bool {
        self.contains(Access::CDR)
    }

    pub fn is_network(self) -> bool {
        self.contains(Access::NETWORK)
    }

    /// True when the channel reads data in any form
    pub fn reads_data(self) -> bool {
        self.is_readable() || self.is_cdr()
    }

    /// True when no access was resolved
    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }
}

/// Standard stream devices every sandbox carries
pub const STD_DEVICES: [&str; 3] = ["stdin", "stdout", "stderr"];

/// Access set for a known logical device name; `None` for devices the
/// middleware does not know (possibly a configured system image)
pub fn device_access(device: &str) -> Option<Access> {
    match device {
        "stdin" => Some(Access::READ),
        "stdout" | "stderr" => Some(Access::WRITE),
        "input" => Some(Access::READ.union(Access::RANDOM)),
        "output" => Some(Access::WRITE.union(Access::RANDOM)),
        "debug" => Some(Access::NETWORK),
        "image" => Some(Access::CDR),
        "sysimage" => Some(Access::READ.union(Access::RANDOM)),
        _ => None,
    }
}

/// Manifest channel type for a device: 0 sequential, 1 cdr, 3 random
pub fn channel_type(device: &str, is_sysimage: bool) -> Option<u8> {
    match device {
        "stdin" | "stdout" | "stderr" | "debug" => Some(0),
        "image" => Some(1),
        "input" | "output" | "sysimage" => Some(3),
        _ if is_sysimage => Some(3),
        _ => None,
    }
}

// ---------- submitted job ----------

/// Executable stanza of a node descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecDef {
    pub path: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

/// One file entry in a node descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileDef {
    pub device: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub meta: Option<HashMap<String, String>>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// One node descriptor as submitted by the client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: Option<String>,
    #[serde(rename = "exec")]
    pub exec: Option<ExecDef>,
    #[serde(default)]
    pub file_list: Option<Vec<FileDef>>,
    // kept loose so a bad count surfaces as a planner error, not a
    // deserialization failure
    #[serde(default)]
    pub count: Option<serde_json::Value>,
    #[serde(default)]
    pub replicate: Option<u32>,
    #[serde(default)]
    pub connect: Option<Vec<String>>,
}

/// A whole submitted job: a list of node descriptors
pub type JobConfig = Vec<NodeDef>;

/// Parse a job config from JSON bytes
pub fn job_from_json(data: &[u8]) -> Result<JobConfig> {
    serde_json::from_slice(data).map_err(|e| Error::Unprocessable(e.to_string()))
}

// ---------- planned job ----------

/// A typed I/O endpoint bound to a device name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub device: String,
    pub access: Access,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Location>,
    pub content_type: String,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default = "default_removable")]
    pub removable: String,
}

fn default_removable() -> String {
    "no".to_string()
}

impl Channel {
    /// Clone with a different path
    pub fn with_path(&self, path: Option<Location>) -> Channel {
        let mut ch = self.clone();
        ch.path = path;
        ch
    }
}

/// Validated node descriptor, pre-expansion
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub exe: Location,
    pub args: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub replicate: u32,
}

impl NodeSpec {
    /// Validate and build a spec from a submitted descriptor
    pub fn from_def(def: &NodeDef) -> Result<Self> {
        let name = def
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::ConfigParse("Must specify node name".to_string()))?;
        if has_control_chars(name) {
            return Err(Error::ConfigParse("Invalid node name".to_string()));
        }
        let exec = def
            .exec
            .as_ref()
            .ok_or_else(|| Error::ConfigParse(format!("Must specify exec stanza for {}", name)))?;
        let exe = parse_location(exec.path.as_deref())?.ok_or_else(|| {
            Error::ConfigParse(format!("Must specify executable path for {}", name))
        })?;
        if exe.is_endpoint() {
            return Err(Error::ConfigParse(format!(
                "Executable path cannot be a node endpoint in {}",
                name
            )));
        }
        let args = exec.args.clone();
        let env = exec.env.clone();
        let mut all = exe.url();
        if let Some(args) = &args {
            all.push_str(args);
        }
        if let Some(env) = &env {
            for (k, v) in env {
                all.push_str(k);
                all.push_str(v);
            }
        }
        if has_control_chars(&all) {
            return Err(Error::ConfigParse(format!(
                "Invalid exec property for {}",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            exe,
            args,
            env,
            replicate: def.replicate.unwrap_or(1),
        })
    }
}

/// One materialized worker invocation
#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub id: u32,
    pub name: String,
    #[serde(serialize_with = "serialize_exe")]
    pub exe: Location,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    pub replicate: u32,
    pub channels: Vec<Channel>,
    /// Rendered bind connect-strings, one per incoming peer
    pub bind: Vec<String>,
    /// Rendered dial connect-strings, one per outgoing peer
    pub connect: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_service: Option<String>,

    /// Substrings captured from a read wildcard, projected into writes
    #[serde(skip)]
    pub wildcards: Vec<String>,
    /// Incoming peers as (peer name, local device path)
    #[serde(skip)]
    pub bind_peers: Vec<(String, String)>,
    /// Outgoing peers as (peer name, remote device path)
    #[serde(skip)]
    pub connect_peers: Vec<(String, String)>,
    /// Storage path used as a locality hint during placement
    #[serde(skip)]
    pub path_info: Option<String>,
    /// Executable prevalidation recorded by the storage layer
    #[serde(skip)]
    pub skip_validation: bool,
    /// Sibling workers sharing identity across storage replicas
    #[serde(skip)]
    pub replicas: Vec<Worker>,
}

fn serialize_exe<S: serde::Serializer>(exe: &Location, ser: S) -> std::result::Result<S::Ok, S::Error> {
    ser.serialize_str(&exe.url())
}

impl Worker {
    /// Build an empty worker from a spec, with a fresh dense id
    pub fn from_spec(spec: &NodeSpec, id: u32, name: String) -> Self {
        Self {
            id,
            name,
            exe: spec.exe.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            replicate: spec.replicate,
            channels: Vec::new(),
            bind: Vec::new(),
            connect: Vec::new(),
            name_service: None,
            wildcards: Vec::new(),
            bind_peers: Vec::new(),
            connect_peers: Vec::new(),
            path_info: None,
            skip_validation: false,
            replicas: Vec::new(),
        }
    }

    /// Find a channel by device name
    pub fn channel(&self, device: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.device == device)
    }

    /// Find a channel by device name, mutably
    pub fn channel_mut(&mut self, device: &str) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.device == device)
    }

    /// Render the per-worker sysmap JSON document
    pub fn sysmap_json(&self) -> Vec<u8> {
        // serialization of a fully-built worker cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Apply channel updates returned by the worker host in its sysmap
    pub fn apply_sysmap_update(&mut self, data: &[u8]) -> Result<()> {
        #[derive(Deserialize)]
        struct ChannelUpdate {
            device: String,
            #[serde(default)]
            content_type: Option<String>,
            #[serde(default)]
            meta: Option<HashMap<String, String>>,
        }
        #[derive(Deserialize)]
        struct SysmapUpdate {
            #[serde(default)]
            channels: Vec<ChannelUpdate>,
        }
        let update: SysmapUpdate = serde_json::from_slice(data)
            .map_err(|e| Error::Unprocessable(format!("bad sysmap from worker: {}", e)))?;
        for new_ch in update.channels {
            if let Some(old) = self.channel_mut(&new_ch.device) {
                if let Some(ct) = new_ch.content_type {
                    old.content_type = ct;
                }
                if let Some(meta) = new_ch.meta {
                    for (k, v) in meta {
                        old.meta.insert(k, v);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_bits() {
        let access = Access::READ.union(Access::RANDOM);
        assert!(access.is_readable());
        assert!(!access.is_writable());
        assert!(access.reads_data());
        assert!(Access::CDR.reads_data());
        assert!(Access::NONE.is_unknown());
    }

    #[test]
    fn test_device_map() {
        assert_eq!(device_access("stdin"), Some(Access::READ));
        assert_eq!(device_access("stdout"), Some(Access::WRITE));
        assert_eq!(
            device_access("input"),
            Some(Access::READ.union(Access::RANDOM))
        );
        assert_eq!(device_access("image"), Some(Access::CDR));
        assert_eq!(device_access("debug"), Some(Access::NETWORK));
        assert_eq!(device_access("custom-img"), None);
    }

    #[test]
    fn test_channel_types() {
        assert_eq!(channel_type("stdout", false), Some(0));
        assert_eq!(channel_type("image", false), Some(1));
        assert_eq!(channel_type("input", false), Some(3));
        assert_eq!(channel_type("python", true), Some(3));
        assert_eq!(channel_type("python", false), None);
    }

    #[test]
    fn test_node_spec_validation() {
        let def: NodeDef = serde_json::from_str(
            r#"{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe","args":"-v"}}"#,
        )
        .unwrap();
        let spec = NodeSpec::from_def(&def).unwrap();
        assert_eq!(spec.name, "a");
        assert_eq!(spec.args.as_deref(), Some("-v"));
        assert_eq!(spec.replicate, 1);
    }

    #[test]
    fn test_node_spec_rejects_endpoint_exe() {
        let def: NodeDef =
            serde_json::from_str(r#"{"name":"a","exec":{"path":"zvm://b/in"}}"#).unwrap();
        assert!(NodeSpec::from_def(&def).is_err());
    }

    #[test]
    fn test_node_spec_rejects_missing_name() {
        let def: NodeDef =
            serde_json::from_str(r#"{"exec":{"path":"swift://a/c/o"}}"#).unwrap();
        assert!(NodeSpec::from_def(&def).is_err());
    }

    #[test]
    fn test_sysmap_update_applies_content_type_and_meta() {
        let spec = NodeSpec {
            name: "a".into(),
            exe: parse_location(Some("swift://acc/bin/x.nexe")).unwrap().unwrap(),
            args: None,
            env: None,
            replicate: 1,
        };
        let mut worker = Worker::from_spec(&spec, 1, "a".into());
        worker.channels.push(Channel {
            device: "stdout".into(),
            access: Access::WRITE,
            path: None,
            content_type: "text/html".into(),
            meta: HashMap::new(),
            mode: None,
            removable: "no".into(),
        });
        let update = br#"{"channels":[{"device":"stdout","content_type":"application/json","meta":{"key":"val"}}]}"#;
        worker.apply_sysmap_update(update).unwrap();
        let ch = worker.channel("stdout").unwrap();
        assert_eq!(ch.content_type, "application/json");
        assert_eq!(ch.meta.get("key").unwrap(), "val");
    }
}
