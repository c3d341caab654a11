// Placement - where a blob's data physically lives
//
// A ParallelConf names a device tag and a list of device names. Each device
// name is either `"machine:device"` or `"machine:lo-hi"` (an inclusive range
// of device ids on one machine). The expanded, ordered list of
// (machine, device) pairs defines the ranks of the placement: rank i is the
// i-th pair. Mirrored blobs have one sub-blob per rank.
//
//   device_tag: "gpu"
//   device_name: "0:0-1"
//   device_name: "1:0"
//
// expands to ranks [(0,0), (0,1), (1,0)], parallel_num = 3.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::Resource;
use crate::error::{Error, Result};
use crate::text_format::{TextMessage, TextNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

impl DeviceType {
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "cpu" => Ok(DeviceType::Cpu),
            "gpu" => Ok(DeviceType::Gpu),
            other => Err(Error::InvalidPlacement(format!("unknown device tag '{other}'"))),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Device tag plus the device names it spans.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParallelConf {
    pub device_tag: String,
    pub device_names: Vec<String>,
}

impl Default for ParallelConf {
    fn default() -> Self {
        Self::single(DeviceType::Cpu, 0, 0)
    }
}

impl ParallelConf {
    pub fn new(device_tag: impl Into<String>, device_names: Vec<String>) -> Self {
        Self {
            device_tag: device_tag.into(),
            device_names,
        }
    }

    /// One device on one machine.
    pub fn single(device: DeviceType, machine: i64, device_id: i64) -> Self {
        Self::new(device.tag(), vec![format!("{machine}:{device_id}")])
    }

    pub fn device_type(&self) -> Result<DeviceType> {
        DeviceType::from_tag(&self.device_tag)
    }

    /// Expanded ranks in declaration order.
    pub fn devices(&self) -> Result<Vec<(i64, i64)>> {
        let mut out = Vec::new();
        for name in &self.device_names {
            let (machine, lo, hi) = parse_device_name(name)?;
            out.extend((lo..=hi).map(|d| (machine, d)));
        }
        Ok(out)
    }

    /// Machine id to sorted device ids.
    pub fn machine_to_device_ids(&self) -> Result<BTreeMap<i64, Vec<i64>>> {
        let mut map: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
        for (m, d) in self.devices()? {
            map.entry(m).or_default().insert(d);
        }
        Ok(map
            .into_iter()
            .map(|(m, ids)| (m, ids.into_iter().collect()))
            .collect())
    }

    pub fn parallel_num(&self) -> Result<usize> {
        Ok(self.devices()?.len())
    }

    /// Placement consisting of only the `index`-th rank of this one.
    pub fn device_at(&self, index: usize) -> Result<ParallelConf> {
        let devices = self.devices()?;
        let &(m, d) = devices.get(index).ok_or_else(|| {
            Error::InvalidPlacement(format!(
                "rank {index} out of range for placement with {} devices",
                devices.len()
            ))
        })?;
        Ok(Self::new(self.device_tag.clone(), vec![format!("{m}:{d}")]))
    }

    /// Same device tag and same set of ranks, regardless of how they are spelled.
    pub fn same_placement(&self, other: &ParallelConf) -> bool {
        self.device_tag == other.device_tag
            && matches!(
                (self.devices(), other.devices()),
                (Ok(a), Ok(b)) if a == b
            )
    }

    /// Check syntax, duplicates and bounds against the available resource.
    pub fn validate(&self, resource: &Resource) -> Result<()> {
        let device = self.device_type()?;
        let devices = self.devices()?;
        if devices.is_empty() {
            return Err(Error::InvalidPlacement("placement has no devices".into()));
        }
        let per_machine = resource.device_num(device);
        let mut seen = BTreeSet::new();
        for &(m, d) in &devices {
            if m >= resource.machine_num {
                return Err(Error::InvalidPlacement(format!(
                    "machine {m} out of range, only {} machines",
                    resource.machine_num
                )));
            }
            if d >= per_machine {
                return Err(Error::InvalidPlacement(format!(
                    "{device} device {d} out of range, only {per_machine} per machine"
                )));
            }
            if !seen.insert((m, d)) {
                return Err(Error::InvalidPlacement(format!("device {m}:{d} listed twice")));
            }
        }
        Ok(())
    }
}

fn parse_device_name(name: &str) -> Result<(i64, i64, i64)> {
    let bad = || Error::InvalidPlacement(format!("invalid device name '{name}'"));
    let (machine, devices) = name.split_once(':').ok_or_else(bad)?;
    let machine: i64 = machine.trim().parse().map_err(|_| bad())?;
    let (lo, hi) = match devices.split_once('-') {
        Some((lo, hi)) => (
            lo.trim().parse::<i64>().map_err(|_| bad())?,
            hi.trim().parse::<i64>().map_err(|_| bad())?,
        ),
        None => {
            let d = devices.trim().parse::<i64>().map_err(|_| bad())?;
            (d, d)
        }
    };
    if machine < 0 || lo < 0 || hi < lo {
        return Err(bad());
    }
    Ok((machine, lo, hi))
}

impl TextMessage for ParallelConf {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        node.str("device_tag", &self.device_tag);
        for name in &self.device_names {
            node.str("device_name", name);
        }
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        Ok(Self {
            device_tag: node.req_str("device_tag")?,
            device_names: node.strs("device_name")?,
        })
    }
}

/// Machine id to device ids, the expanded form of a [`ParallelConf`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineDeviceIds(pub BTreeMap<i64, Vec<i64>>);

impl TextMessage for MachineDeviceIds {
    fn to_node(&self) -> TextNode {
        let mut node = TextNode::new();
        for (machine, ids) in &self.0 {
            let mut entry = TextNode::new();
            entry.int("machine_id", *machine).set_ints("device_id", ids.iter().copied());
            node.message("machine_device_ids", entry);
        }
        node
    }

    fn from_node(node: &TextNode) -> Result<Self> {
        let mut map = BTreeMap::new();
        for entry in node.messages("machine_device_ids")? {
            map.insert(entry.req_int("machine_id")?, entry.ints("device_id")?);
        }
        Ok(Self(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(names: &[&str]) -> ParallelConf {
        ParallelConf::new("gpu", names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_expand_ranges() {
        let pc = gpu(&["0:0-1", "1:0"]);
        assert_eq!(pc.devices().unwrap(), vec![(0, 0), (0, 1), (1, 0)]);
        assert_eq!(pc.parallel_num().unwrap(), 3);
        let map = pc.machine_to_device_ids().unwrap();
        assert_eq!(map[&0], vec![0, 1]);
        assert_eq!(map[&1], vec![0]);
        assert_eq!(pc.device_at(1).unwrap(), gpu(&["0:1"]));
        assert!(pc.device_at(3).is_err());
    }

    #[test]
    fn test_bad_names() {
        for bad in ["0", "a:0", "0:3-1", "0:-1", "-1:0"] {
            assert!(gpu(&[bad]).devices().is_err(), "{bad}");
        }
        assert!(DeviceType::from_tag("tpu").is_err());
    }

    #[test]
    fn test_same_placement_ignores_spelling() {
        assert!(gpu(&["0:0-1"]).same_placement(&gpu(&["0:0", "0:1"])));
        assert!(!gpu(&["0:0"]).same_placement(&ParallelConf::single(DeviceType::Cpu, 0, 0)));
    }

    #[test]
    fn test_validate_against_resource() {
        let resource = Resource {
            machine_num: 1,
            gpu_device_num: 2,
            cpu_device_num: 1,
        };
        assert!(gpu(&["0:0-1"]).validate(&resource).is_ok());
        assert!(gpu(&["0:0-2"]).validate(&resource).is_err());
        assert!(gpu(&["1:0"]).validate(&resource).is_err());
        assert!(gpu(&["0:0", "0:0"]).validate(&resource).is_err());
    }

    #[test]
    fn test_text() {
        let pc = gpu(&["0:0-3"]);
        assert_eq!(ParallelConf::from_text(&pc.to_text()).unwrap(), pc);
        let ids = MachineDeviceIds(pc.machine_to_device_ids().unwrap());
        assert_eq!(MachineDeviceIds::from_text(&ids.to_text()).unwrap(), ids);
    }
}
