use crate::CommandCatalog;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Identity of a connected device: the port it is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(port: impl Into<String>) -> Self {
        Self(port.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Whether a device supplies or draws power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Provider,
    Consumer,
}

/// Hardware module kind, inferred from the display name.
///
/// This is a heuristic: renaming a device changes its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Generator,
    SolarTracker,
    WindTurbine,
    HouseLoad,
    Fan,
    Storage,
    Unknown,
}

impl DeviceKind {
    /// Case-insensitive substring match on the display name.
    pub fn from_name(name: &str) -> Self {
        let n = name.to_ascii_lowercase();
        let has = |keys: &[&str]| keys.iter().any(|k| n.contains(k));
        if has(&["generator", "genset"]) {
            DeviceKind::Generator
        } else if has(&["solar", "tracker", "pv"]) {
            DeviceKind::SolarTracker
        } else if has(&["wind", "turbine"]) {
            DeviceKind::WindTurbine
        } else if has(&["storage", "battery"]) {
            DeviceKind::Storage
        } else if has(&["fan"]) {
            DeviceKind::Fan
        } else if has(&["house", "home", "load"]) {
            DeviceKind::HouseLoad
        } else {
            DeviceKind::Unknown
        }
    }

    pub fn default_role(self) -> DeviceRole {
        match self {
            DeviceKind::Generator
            | DeviceKind::SolarTracker
            | DeviceKind::WindTurbine
            | DeviceKind::Storage => DeviceRole::Provider,
            DeviceKind::HouseLoad | DeviceKind::Fan | DeviceKind::Unknown => DeviceRole::Consumer,
        }
    }

    /// Firmware whose enumeration handshake is known to drop lines.
    pub fn unreliable_discovery(self) -> bool {
        matches!(self, DeviceKind::WindTurbine)
    }
}

/// Name heuristic used wherever "the generator" has to be picked out.
pub fn is_generator_name(name: &str) -> bool {
    DeviceKind::from_name(name) == DeviceKind::Generator
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    /// The link reported closed; the record stays until an explicit disconnect.
    Lost,
}

/// Outcome of the most recent command on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    Idle,
    Ok,
    Error,
    Timeout,
    Blocked,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastInvocation {
    pub command: String,
    pub status: DeviceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Which well-known commands a device exposes, resolved to its own spelling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub read_voltage: Option<String>,
    pub read_power: Option<String>,
    pub read_all: Option<String>,
    pub set_load: Option<String>,
}

const VOLTAGE_READS: &[&str] = &["getvoltage", "readvoltage", "voltage"];
const POWER_READS: &[&str] = &["getpower", "readpower", "power"];
const COMPOSITE_READS: &[&str] = &["readall", "getall", "status"];
const LOAD_SETTERS: &[&str] = &["setload", "setpower", "setoutput"];

impl Capabilities {
    pub fn from_catalog(catalog: &CommandCatalog) -> Self {
        let find = |names: &[&str], read: bool| {
            catalog
                .iter()
                .filter(|c| {
                    if read {
                        c.is_read_only()
                    } else {
                        c.input_arity == 1
                    }
                })
                .find(|c| names.contains(&c.name.to_ascii_lowercase().as_str()))
                .map(|c| c.name.clone())
        };
        Self {
            read_voltage: find(VOLTAGE_READS, true),
            read_power: find(POWER_READS, true),
            read_all: find(COMPOSITE_READS, true)
                .filter(|name| catalog.get(name).is_some_and(|c| c.output_arity >= 2)),
            set_load: find(LOAD_SETTERS, false),
        }
    }

    pub fn has_telemetry(&self) -> bool {
        self.read_voltage.is_some() || self.read_power.is_some() || self.read_all.is_some()
    }
}

/// Registry entry for one connected device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: String,
    pub role: DeviceRole,
    pub kind: DeviceKind,
    pub catalog: CommandCatalog,
    pub capabilities: Capabilities,
    pub state: ConnectionState,
    pub status: DeviceStatus,
    pub last: Option<LastInvocation>,
}

impl DeviceRecord {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

fn default_baud() -> u32 {
    line_transport::DEFAULT_BAUD
}

/// Operator configuration for one port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct DeviceDescriptor {
    pub port: String,
    pub name: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Overrides the role inferred from the name.
    #[serde(default)]
    pub role: Option<DeviceRole>,
    /// Fixed signatures installed instead of running discovery.
    #[serde(default)]
    pub catalog: Option<Vec<String>>,
}

impl DeviceDescriptor {
    pub fn id(&self) -> DeviceId {
        DeviceId::new(&self.port)
    }

    pub fn kind(&self) -> DeviceKind {
        DeviceKind::from_name(&self.name)
    }

    pub fn role(&self) -> DeviceRole {
        self.role.unwrap_or_else(|| self.kind().default_role())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_signature;

    fn catalog(sigs: &[&str]) -> CommandCatalog {
        let mut c = CommandCatalog::default();
        for s in sigs {
            c.insert(parse_signature(s).unwrap());
        }
        c
    }

    #[test]
    fn kind_from_name_is_case_insensitive() {
        assert_eq!(DeviceKind::from_name("Main GENERATOR"), DeviceKind::Generator);
        assert_eq!(DeviceKind::from_name("solar tracker"), DeviceKind::SolarTracker);
        assert_eq!(DeviceKind::from_name("Wind Turbine"), DeviceKind::WindTurbine);
        assert_eq!(DeviceKind::from_name("House load"), DeviceKind::HouseLoad);
        assert_eq!(DeviceKind::from_name("Ceiling Fan"), DeviceKind::Fan);
        assert_eq!(DeviceKind::from_name("Battery Storage"), DeviceKind::Storage);
        assert_eq!(DeviceKind::from_name("widget"), DeviceKind::Unknown);
    }

    #[test]
    fn roles_follow_kind_unless_overridden() {
        let mut desc = DeviceDescriptor {
            port: "/dev/ttyUSB0".into(),
            name: "Fan".into(),
            baud: default_baud(),
            role: None,
            catalog: None,
        };
        assert_eq!(desc.role(), DeviceRole::Consumer);
        desc.role = Some(DeviceRole::Provider);
        assert_eq!(desc.role(), DeviceRole::Provider);
        assert_eq!(desc.id().as_str(), "/dev/ttyUSB0");
    }

    #[test]
    fn capabilities_resolve_device_spelling() {
        let caps = Capabilities::from_catalog(&catalog(&[
            "GetVoltage>1",
            "readAll>2",
            "setLoad<1",
            "power<1",
        ]));
        assert_eq!(caps.read_voltage.as_deref(), Some("GetVoltage"));
        // `power<1` takes an argument, so it is not a read
        assert_eq!(caps.read_power, None);
        assert_eq!(caps.read_all.as_deref(), Some("readAll"));
        assert_eq!(caps.set_load.as_deref(), Some("setLoad"));
        assert!(caps.has_telemetry());
    }

    #[test]
    fn composite_read_needs_two_lines() {
        let caps = Capabilities::from_catalog(&catalog(&["status>1"]));
        assert_eq!(caps.read_all, None);
        assert!(!caps.has_telemetry());
    }
}
