use crate::{CommandCatalog, DeviceKind};

/// Signatures shipped with each stock firmware image.
pub fn builtin_signatures(kind: DeviceKind) -> &'static [&'static str] {
    match kind {
        DeviceKind::Generator => &["getVoltage>1", "getPower>1", "readAll>2", "setLoad<1", "stop"],
        DeviceKind::SolarTracker => &["getVoltage>1", "getPower>1", "readAll>2", "setAngle<1", "track"],
        DeviceKind::WindTurbine => &["getVoltage>1", "getPower>1", "readAll>2", "setBrake<1"],
        DeviceKind::HouseLoad => &["getPower>1", "readAll>2", "setLights<1"],
        DeviceKind::Fan => &["getPower>1", "setSpeed<1"],
        DeviceKind::Storage => &["getVoltage>1", "getPower>1", "readAll>2", "setCharge<1"],
        DeviceKind::Unknown => &["readAll>2"],
    }
}

/// Catalog installed without a handshake for kinds whose enumeration is
/// unreliable. `None` for everything else.
pub fn builtin_catalog(kind: DeviceKind) -> Option<CommandCatalog> {
    if !kind.unreliable_discovery() {
        return None;
    }
    match CommandCatalog::from_signatures(builtin_signatures(kind).iter().copied()) {
        Ok(catalog) => Some(catalog),
        Err(e) => {
            tracing::error!(?kind, error = %e, "built-in catalog does not parse");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Capabilities;

    const ALL: [DeviceKind; 7] = [
        DeviceKind::Generator,
        DeviceKind::SolarTracker,
        DeviceKind::WindTurbine,
        DeviceKind::HouseLoad,
        DeviceKind::Fan,
        DeviceKind::Storage,
        DeviceKind::Unknown,
    ];

    #[test]
    fn every_builtin_signature_parses() {
        for kind in ALL {
            let sigs = builtin_signatures(kind);
            let catalog = CommandCatalog::from_signatures(sigs.iter().copied()).unwrap();
            assert_eq!(catalog.len(), sigs.len(), "{kind:?}");
        }
    }

    #[test]
    fn only_wind_turbines_get_a_seeded_catalog() {
        for kind in ALL {
            assert_eq!(builtin_catalog(kind).is_some(), kind == DeviceKind::WindTurbine);
        }
    }

    #[test]
    fn generator_firmware_exposes_a_load_setter() {
        let catalog =
            CommandCatalog::from_signatures(builtin_signatures(DeviceKind::Generator).iter().copied()).unwrap();
        let caps = Capabilities::from_catalog(&catalog);
        assert_eq!(caps.set_load.as_deref(), Some("setLoad"));
        assert_eq!(caps.read_all.as_deref(), Some("readAll"));
    }
}
