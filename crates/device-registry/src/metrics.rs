use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct DeviceMetrics {
    pub commands: IntCounter,
    pub timeouts: IntCounter,
    pub blocked: IntCounter,
    pub devices_connected: IntGauge,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub dev: DeviceMetrics,
}

impl MetricsHub {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| {
            IntCounter::new(name, help).map_err(|e| format!("metrics init error: {e}"))
        };
        let commands = counter("tb_commands_total", "Commands executed or attempted")?;
        let timeouts = counter("tb_command_timeouts_total", "Commands that hit their deadline")?;
        let blocked = counter("tb_commands_blocked_total", "Commands stopped by the safe-mode interlock")?;
        let devices_connected = IntGauge::new("tb_devices_connected", "Devices with an open link")
            .map_err(|e| format!("metrics init error: {e}"))?;
        let dev = DeviceMetrics {
            commands,
            timeouts,
            blocked,
            devices_connected,
        };
        let _ = registry.register(Box::new(dev.commands.clone()));
        let _ = registry.register(Box::new(dev.timeouts.clone()));
        let _ = registry.register(Box::new(dev.blocked.clone()));
        let _ = registry.register(Box::new(dev.devices_connected.clone()));
        Ok(Self { registry, dev })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
