// Environment and session configuration messages
//
// EnvConfig describes the cluster: the machines, the control port and how
// many devices of each type every machine has. SessionConfig optionally
// narrows that resource and carries session-level mode flags. Both are
// builder-style structs with sensible defaults and are also structured-text
// messages, so they can be passed across the boundary or read from files:
//
//   machine { id: 0 addr: "127.0.0.1" }
//   ctrl_port: 9527
//   gpu_device_num: 2
//
// `EnvConfig::from_env()` overlays OXFLOW_* environment variables on the
// defaults for single-process use.

use crate::error::{Error, Result};
use crate::placement::DeviceType;
use crate::text_format::{TextMessage, TextNode};

pub const ENV_MACHINE_NUM: &str = "OXFLOW_MACHINE_NUM";
pub const ENV_GPU_DEVICE_NUM: &str = "OXFLOW_GPU_DEVICE_NUM";
pub const ENV_CPU_DEVICE_NUM: &str = "OXFLOW_CPU_DEVICE_NUM";
pub const ENV_CTRL_PORT: &str = "OXFLOW_CTRL_PORT";

/// Device resource of a cluster or a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    pub machine_num: i64,
    pub gpu_device_num: i64,
    pub cpu_device_num: i64,
}

impl Default for Resource {
    fn default() -> Self {
        Self {
            machine_num: 1,
            gpu_device_num: 0,
            cpu_device_num: 1,
        }
    }
}

impl Resource {
    /// Devices of the given type on each machine.
    pub fn device_num(&self, device: DeviceType) -> i64 {
        match device {
            DeviceType::Cpu => self.cpu_device_num,
            DeviceType::Gpu => self.gpu_device_num,
        }
    }

    /// True when every count of `self` is within `limit`.
    pub fn fits_in(&self, limit: &Resource) -> bool {
        self.machine_num <= limit.machine_num
            && self.gpu_device_num <= limit.gpu_device_num
            && self.cpu_device_num <= limit.cpu_device_num
    }
}

impl TextMessage for Resource {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.int("machine_num", self.machine_num)
            .int("gpu_device_num", self.gpu_device_num)
            .int("cpu_device_num", self.cpu_device_num);
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        let d = Resource::default();
        Ok(Self {
            machine_num: node.int_or("machine_num", d.machine_num)?,
            gpu_device_num: node.int_or("gpu_device_num", d.gpu_device_num)?,
            cpu_device_num: node.int_or("cpu_device_num", d.cpu_device_num)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub id: i64,
    pub addr: String,
}

impl Machine {
    pub fn local(id: i64) -> Self {
        Self {
            id,
            addr: "127.0.0.1".to_string(),
        }
    }
}

/// Cluster-wide configuration consumed by `InitEnv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub machines: Vec<Machine>,
    pub ctrl_port: i64,
    /// Id of the machine this process runs on.
    pub current_machine_id: i64,
    pub gpu_device_num: i64,
    pub cpu_device_num: i64,
    pub enable_eager_execution: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            machines: vec![Machine::local(0)],
            ctrl_port: 9527,
            current_machine_id: 0,
            gpu_device_num: 0,
            cpu_device_num: 1,
            enable_eager_execution: false,
        }
    }
}

impl EnvConfig {
    /// `n` local machines with ids `0..n`.
    pub fn with_machine_num(mut self, n: usize) -> Self {
        self.machines = (0..n as i64).map(Machine::local).collect();
        self
    }

    pub fn with_ctrl_port(mut self, port: i64) -> Self {
        self.ctrl_port = port;
        self
    }

    pub fn with_current_machine_id(mut self, id: i64) -> Self {
        self.current_machine_id = id;
        self
    }

    pub fn with_gpu_device_num(mut self, n: i64) -> Self {
        self.gpu_device_num = n;
        self
    }

    pub fn with_cpu_device_num(mut self, n: i64) -> Self {
        self.cpu_device_num = n;
        self
    }

    pub fn with_eager_execution(mut self, enabled: bool) -> Self {
        self.enable_eager_execution = enabled;
        self
    }

    pub fn resource(&self) -> Resource {
        Resource {
            machine_num: self.machines.len() as i64,
            gpu_device_num: self.gpu_device_num,
            cpu_device_num: self.cpu_device_num,
        }
    }

    /// Defaults overlaid with the `OXFLOW_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EnvConfig::from_env`] with an explicit variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read = |key: &str| -> Result<Option<i64>> {
            match lookup(key) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|_| Error::schema(key, format!("expected an integer, got '{raw}'"))),
            }
        };
        let mut config = EnvConfig::default();
        if let Some(n) = read(ENV_MACHINE_NUM)? {
            if n < 1 {
                return Err(Error::schema(ENV_MACHINE_NUM, "must be at least 1"));
            }
            config = config.with_machine_num(n as usize);
        }
        if let Some(n) = read(ENV_GPU_DEVICE_NUM)? {
            config.gpu_device_num = n;
        }
        if let Some(n) = read(ENV_CPU_DEVICE_NUM)? {
            config.cpu_device_num = n;
        }
        if let Some(port) = read(ENV_CTRL_PORT)? {
            config.ctrl_port = port;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.machines.is_empty() {
            return Err(Error::schema("machine", "at least one machine is required"));
        }
        if self.gpu_device_num < 0 || self.cpu_device_num < 0 {
            return Err(Error::schema("device_num", "device counts must be non-negative"));
        }
        if !self.machines.iter().any(|m| m.id == self.current_machine_id) {
            return Err(Error::schema(
                "current_machine_id",
                format!("machine {} is not part of the cluster", self.current_machine_id),
            ));
        }
        Ok(())
    }
}

impl TextMessage for EnvConfig {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        for m in &self.machines {
            let mut entry = TextNode::new();
            entry.int("id", m.id).str("addr", &m.addr);
            node.message("machine", entry);
        }
        node.int("ctrl_port", self.ctrl_port)
            .int("current_machine_id", self.current_machine_id)
            .int("gpu_device_num", self.gpu_device_num)
            .int("cpu_device_num", self.cpu_device_num)
            .bool("enable_eager_execution", self.enable_eager_execution);
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        let d = EnvConfig::default();
        let machines = node
            .messages("machine")?
            .into_iter()
            .map(|m| {
                Ok(Machine {
                    id: m.req_int("id")?,
                    addr: m.str_or("addr", "127.0.0.1")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            machines: if machines.is_empty() { d.machines } else { machines },
            ctrl_port: node.int_or("ctrl_port", d.ctrl_port)?,
            current_machine_id: node.int_or("current_machine_id", d.current_machine_id)?,
            gpu_device_num: node.int_or("gpu_device_num", d.gpu_device_num)?,
            cpu_device_num: node.int_or("cpu_device_num", d.cpu_device_num)?,
            enable_eager_execution: node.bool_or("enable_eager_execution", false)?,
        })
    }
}

/// Session-level configuration consumed by `InitGlobalSession`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub session_id: i64,
    /// Narrows the environment resource; `None` uses all of it.
    pub resource: Option<Resource>,
    /// Overrides the environment eager toggle when set.
    pub enable_eager_execution: Option<bool>,
}

impl SessionConfig {
    pub fn with_session_id(mut self, id: i64) -> Self {
        self.session_id = id;
        self
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_eager_execution(mut self, enabled: bool) -> Self {
        self.enable_eager_execution = Some(enabled);
        self
    }
}

impl TextMessage for SessionConfig {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.int("session_id", self.session_id);
        if let Some(r) = &self.resource {
            node.message("resource", r.to_node());
        }
        if let Some(eager) = self.enable_eager_execution {
            node.bool("enable_eager_execution", eager);
        }
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self {
            session_id: node.int_or("session_id", 0)?,
            resource: node.get_message("resource")?.map(Resource::from_node).transpose()?,
            enable_eager_execution: if node.has("enable_eager_execution") {
                Some(node.bool_or("enable_eager_execution", false)?)
            } else {
                None
            },
        })
    }
}
