use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use device_registry as devreg;
use devreg::{DeviceDescriptor, DeviceHub, DeviceId, DeviceKind, ExecutionRequest};
use energy_balance::{
    BalanceController, InferenceTuning, JsonFileStore, KeyValueStore, PowerEstimate, TelemetryPoller, Testbed,
    TestbedSettings,
};
use line_transport::{LineTransport, MockFirmware, MockLine, PortLister, SerialLine};
use safety_guard::SafetyInterlock;

mod config;
use config::ConsoleConfig;

#[derive(Parser, Debug)]
#[command(
    name = "tb",
    version,
    about = "Renewable-energy testbed console",
    disable_help_subcommand = true
)]
struct Cli {
    /// Use simulated device firmware instead of serial ports
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    mock: bool,

    /// Console config (YAML); missing file means defaults
    #[arg(long, global = true, default_value = "testbed.yaml")]
    config: PathBuf,

    /// Override the config's safe mode (true blocks every `set*` command)
    #[arg(long, global = true)]
    safe_mode: Option<bool>,

    /// Override the config's state file
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports
    Ports,
    /// Run the discovery handshake on one port and print its catalog
    Discover {
        port: String,
        /// Display name (drives role and kind)
        #[arg(long)]
        name: Option<String>,
        /// Print the catalog as JSON
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Run one command on one device
    Call {
        port: String,
        command: String,
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
        /// Per-operation deadline override
        #[arg(long)]
        deadline_ms: Option<u64>,
    },
    /// Connect every configured device and run the poll and balance loops until Ctrl-C
    Run {
        /// Print prometheus metrics on shutdown
        #[arg(long, action = ArgAction::SetTrue)]
        metrics: bool,
    },
    /// Poll once and run a single balance pass
    Balance,
    /// Connection graph
    #[command(subcommand)]
    Edge(EdgeCmd),
    /// Operator power estimates
    #[command(subcommand)]
    Estimate(EstimateCmd),
    /// Mode 2 (automatic generator balancing)
    Mode2 {
        #[arg(value_parser = parse_switch, action = ArgAction::Set)]
        state: bool,
    },
    /// Demand inference from aggregate supply
    AutoEstimate {
        #[arg(value_parser = parse_switch, action = ArgAction::Set)]
        state: bool,
        #[arg(long)]
        alpha: Option<f64>,
        #[arg(long)]
        max_step_kw: Option<f64>,
    },
}

#[derive(Subcommand, Debug)]
enum EdgeCmd {
    /// Declare provider -> consumer (sized from current estimates)
    Add { from: String, to: String },
    /// Set an edge's kW
    Edit { from: String, to: String, kw: f64 },
    Remove { from: String, to: String },
    List,
    /// Connect every consumer without a supplier
    Auto,
}

#[derive(Subcommand, Debug)]
enum EstimateCmd {
    SetConsumer {
        name: String,
        rated_w: f64,
        #[arg(long)]
        utilization: Option<f64>,
    },
    SetProvider {
        name: String,
        capacity_kw: f64,
        #[arg(long)]
        availability: Option<f64>,
    },
    List,
}

fn parse_switch(s: &str) -> std::result::Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(format!("expected on|off, got `{other}`")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let mut cfg = ConsoleConfig::load(&cli.config)?;
    if let Some(safe) = cli.safe_mode {
        cfg.safe_mode = safe;
    }
    if let Some(store) = &cli.store {
        cfg.store = store.clone();
    }

    match &cli.command {
        Commands::Ports => list_ports(cli.mock),
        Commands::Discover { port, name, json } => discover(&cli, &cfg, port, name.as_deref(), *json).await,
        Commands::Call {
            port,
            command,
            args,
            deadline_ms,
        } => call(&cli, &cfg, port, command, args, *deadline_ms).await,
        Commands::Run { metrics } => run(&cli, &cfg, *metrics).await,
        Commands::Balance => balance(&cli, &cfg).await,
        Commands::Edge(cmd) => edge(&cli, &cfg, cmd).await,
        Commands::Estimate(cmd) => estimate(&cfg, cmd),
        Commands::Mode2 { state } => {
            let tb = build_testbed(&cfg)?;
            tb.set_mode2(*state)?;
            println!("mode 2: {}", if *state { "on" } else { "off" });
            Ok(())
        }
        Commands::AutoEstimate {
            state,
            alpha,
            max_step_kw,
        } => {
            let tb = build_testbed(&cfg)?;
            tb.set_auto_estimate(*state)?;
            if alpha.is_some() || max_step_kw.is_some() {
                let current = tb.inference_tuning();
                let tuning = tb.set_inference_tuning(InferenceTuning {
                    alpha: alpha.unwrap_or(current.alpha),
                    max_step_kw: max_step_kw.unwrap_or(current.max_step_kw),
                })?;
                println!("tuning: alpha={} max_step_kw={}", tuning.alpha, tuning.max_step_kw);
            }
            println!("auto-estimate: {}", if *state { "on" } else { "off" });
            Ok(())
        }
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn list_ports(mock: bool) -> Result<()> {
    let ports = if mock { MockLine::list()? } else { SerialLine::list()? };
    for p in ports {
        println!("{}\t{}", p.name, p.driver);
    }
    Ok(())
}

/// Devices to use: the configured ones, or a demo set under `--mock`.
fn descriptors(cli: &Cli, cfg: &ConsoleConfig) -> Result<Vec<DeviceDescriptor>> {
    let descs = cfg.descriptors()?;
    if descs.is_empty() && cli.mock {
        return Ok(demo_devices());
    }
    Ok(descs)
}

fn demo_devices() -> Vec<DeviceDescriptor> {
    [
        ("mock-gen", "Generator"),
        ("mock-pv", "Solar Tracker"),
        ("mock-wind", "Wind Turbine"),
        ("mock-house", "House Load"),
        ("mock-fan", "Fan"),
    ]
    .into_iter()
    .map(|(port, name)| DeviceDescriptor {
        port: port.to_string(),
        name: name.to_string(),
        baud: line_transport::DEFAULT_BAUD,
        role: None,
        catalog: None,
    })
    .collect()
}

fn descriptor_for(cli: &Cli, cfg: &ConsoleConfig, port: &str, name: Option<&str>) -> Result<DeviceDescriptor> {
    let mut desc = descriptors(cli, cfg)?
        .into_iter()
        .find(|d| d.port == port)
        .unwrap_or_else(|| DeviceDescriptor {
            port: port.to_string(),
            name: port.to_string(),
            baud: line_transport::DEFAULT_BAUD,
            role: None,
            catalog: None,
        });
    if let Some(name) = name {
        desc.name = name.to_string();
    }
    Ok(desc)
}

/// Simulated firmware answering like the stock image for this kind.
fn mock_firmware(desc: &DeviceDescriptor) -> MockFirmware {
    let kind = desc.kind();
    let (volts, watts) = match kind {
        DeviceKind::Generator => ("230.0", "0"),
        DeviceKind::SolarTracker => ("48.6", "420"),
        DeviceKind::WindTurbine => ("52.3", "310"),
        DeviceKind::HouseLoad => ("229.4", "380"),
        DeviceKind::Fan => ("12.1", "60"),
        DeviceKind::Storage => ("51.2", "150"),
        DeviceKind::Unknown => ("0", "0"),
    };
    MockFirmware::new(devreg::builtin_signatures(kind).iter().copied())
        .respond("getVoltage", [volts])
        .respond("getPower", [watts])
        .respond("readAll", [volts, watts])
}

fn open_line(mock: bool, desc: &DeviceDescriptor) -> Result<Box<dyn LineTransport>> {
    if mock {
        let (line, _handle) = MockLine::with_firmware(&desc.port, mock_firmware(desc));
        return Ok(Box::new(line));
    }
    let line = SerialLine::open_with(&desc.port, desc.baud).with_context(|| format!("opening {}", desc.port))?;
    Ok(Box::new(line))
}

fn build_testbed(cfg: &ConsoleConfig) -> Result<Arc<Testbed>> {
    let interlock = Arc::new(SafetyInterlock::new(cfg.safe_mode));
    interlock.set_event_callback(|event| {
        info!("Safety Event: {} - {}", event.event_type, event.message);
    });
    let hub = DeviceHub::new(cfg.hub_config(), interlock)?;
    let store: Arc<dyn KeyValueStore> =
        Arc::new(JsonFileStore::open(&cfg.store).with_context(|| format!("opening {}", cfg.store.display()))?);
    let settings = TestbedSettings {
        prefer_manual: cfg.prefer_manual,
        outlier_filter: cfg.outlier_filter,
    };
    let tb = Testbed::new(Arc::new(hub), store, settings)?;
    tb.set_topology(cfg.descriptors()?);
    Ok(Arc::new(tb))
}

/// Connect every descriptor; failures are reported and skipped.
async fn connect_all(cli: &Cli, cfg: &ConsoleConfig, tb: &Testbed) -> Result<usize> {
    let descs = descriptors(cli, cfg)?;
    tb.set_topology(descs.clone());
    let mut connected = 0;
    for desc in &descs {
        let line = match open_line(cli.mock, desc) {
            Ok(line) => line,
            Err(e) => {
                warn!(port = %desc.port, error = %format!("{e:#}"), "could not open port");
                continue;
            }
        };
        match tb.connect(desc, line).await {
            Ok(record) => {
                connected += 1;
                println!(
                    "connected {} ({}, {:?}, {} commands)",
                    record.id,
                    record.name,
                    record.role,
                    record.catalog.len()
                );
            }
            Err(e) => warn!(port = %desc.port, error = %e, "connect failed"),
        }
    }
    Ok(connected)
}

async fn discover(cli: &Cli, cfg: &ConsoleConfig, port: &str, name: Option<&str>, json: bool) -> Result<()> {
    let desc = descriptor_for(cli, cfg, port, name)?;
    let tb = build_testbed(cfg)?;
    let record = tb.connect(&desc, open_line(cli.mock, &desc)?).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&record.catalog)?);
        return Ok(());
    }
    println!("{} ({}, {:?}, {:?})", record.id, record.name, record.role, record.kind);
    for cmd in record.catalog.iter() {
        println!("  {}\tin={}\tout={}", cmd.signature, cmd.input_arity, cmd.output_arity);
    }
    Ok(())
}

async fn call(
    cli: &Cli,
    cfg: &ConsoleConfig,
    port: &str,
    command: &str,
    args: &[String],
    deadline_ms: Option<u64>,
) -> Result<()> {
    let desc = descriptor_for(cli, cfg, port, None)?;
    let tb = build_testbed(cfg)?;
    let record = tb.connect(&desc, open_line(cli.mock, &desc)?).await?;
    let mut req = ExecutionRequest::new(record.id.clone(), command).with_args(args.iter().cloned());
    if let Some(ms) = deadline_ms {
        req = req.with_deadline(Duration::from_millis(ms));
    }
    let result = tb.hub().execute(req).await;
    for rec in tb.hub().recent_executions(1) {
        println!("{}", rec.summary());
    }
    result?;
    Ok(())
}

async fn run(cli: &Cli, cfg: &ConsoleConfig, print_metrics: bool) -> Result<()> {
    let tb = build_testbed(cfg)?;
    let n = connect_all(cli, cfg, &tb).await?;
    info!(devices = n, safe_mode = cfg.safe_mode, mode2 = tb.mode2_enabled(), "console running; Ctrl-C to stop");

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let poller = Arc::new(TelemetryPoller::new(cfg.poll_interval(), cfg.command_gap()));
    let controller = Arc::new(BalanceController::new(cfg.balance_interval()));
    let poll_task = {
        let (poller, tb, rx) = (poller.clone(), tb.clone(), stop_rx.clone());
        tokio::spawn(async move { poller.run(tb, rx).await })
    };
    let balance_task = {
        let (controller, tb, rx) = (controller.clone(), tb.clone(), stop_rx);
        tokio::spawn(async move { controller.run(tb, rx).await })
    };

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    let _ = stop_tx.send(true);
    let _ = tokio::join!(poll_task, balance_task);

    if print_metrics {
        print!("{}", tb.hub().metrics().encode_text());
    }
    Ok(())
}

async fn balance(cli: &Cli, cfg: &ConsoleConfig) -> Result<()> {
    let tb = build_testbed(cfg)?;
    connect_all(cli, cfg, &tb).await?;
    TelemetryPoller::new(cfg.poll_interval(), cfg.command_gap()).sweep(&tb).await;
    let report = BalanceController::new(cfg.balance_interval()).balance_once(&tb).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn edge(cli: &Cli, cfg: &ConsoleConfig, cmd: &EdgeCmd) -> Result<()> {
    let tb = build_testbed(cfg)?;
    match cmd {
        EdgeCmd::Add { from, to } => {
            connect_all(cli, cfg, &tb).await?;
            TelemetryPoller::new(cfg.poll_interval(), cfg.command_gap()).sweep(&tb).await;
            let e = tb.add_edge(&DeviceId::new(from), &DeviceId::new(to))?;
            println!("{} -> {}\t{:.2} kW", e.from, e.to, e.kw);
        }
        EdgeCmd::Edit { from, to, kw } => {
            tb.edit_edge(&DeviceId::new(from), &DeviceId::new(to), *kw)?;
            println!("{from} -> {to}\t{kw:.2} kW");
        }
        EdgeCmd::Remove { from, to } => {
            let e = tb.remove_edge(&DeviceId::new(from), &DeviceId::new(to))?;
            println!("removed {} -> {}", e.from, e.to);
        }
        EdgeCmd::List => {
            for e in tb.edges()? {
                println!("{} -> {}\t{:.2} kW", e.from, e.to, e.kw);
            }
        }
        EdgeCmd::Auto => {
            connect_all(cli, cfg, &tb).await?;
            TelemetryPoller::new(cfg.poll_interval(), cfg.command_gap()).sweep(&tb).await;
            for e in tb.auto_connect()? {
                println!("{} -> {}\t{:.2} kW", e.from, e.to, e.kw);
            }
        }
    }
    Ok(())
}

fn estimate(cfg: &ConsoleConfig, cmd: &EstimateCmd) -> Result<()> {
    let tb = build_testbed(cfg)?;
    match cmd {
        EstimateCmd::SetConsumer {
            name,
            rated_w,
            utilization,
        } => {
            let est = PowerEstimate::consumer(*rated_w, *utilization)?;
            tb.set_estimate(name, est)?;
            println!("{name}: {:.3} kW", est.kw());
        }
        EstimateCmd::SetProvider {
            name,
            capacity_kw,
            availability,
        } => {
            let est = PowerEstimate::provider(*capacity_kw, *availability)?;
            tb.set_estimate(name, est)?;
            println!("{name}: {:.3} kW", est.kw());
        }
        EstimateCmd::List => {
            for (name, est) in tb.estimates() {
                println!("{name}\t{}\t{:.3} kW", serde_json::to_string(&est)?, est.kw());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn switches_accept_on_off() {
        assert_eq!(parse_switch("ON"), Ok(true));
        assert_eq!(parse_switch("off"), Ok(false));
        assert!(parse_switch("maybe").is_err());
        let cli = Cli::try_parse_from(["tb", "mode2", "on"]).unwrap();
        assert!(matches!(cli.command, Commands::Mode2 { state: true }));
    }

    #[test]
    fn call_accepts_negative_arguments() {
        let cli = Cli::try_parse_from(["tb", "--mock", "call", "mock-gen", "setLoad", "-1.5"]).unwrap();
        match cli.command {
            Commands::Call { args, .. } => assert_eq!(args, ["-1.5"]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(cli.mock);
    }

    #[tokio::test]
    async fn mock_firmware_matches_stock_catalog() {
        let desc = demo_devices().remove(1);
        let dir = tempfile::tempdir().unwrap();
        let tb = build_testbed(&ConsoleConfig {
            store: dir.path().join("state.json"),
            ..ConsoleConfig::default()
        })
        .unwrap();
        let record = tb.connect(&desc, open_line(true, &desc).unwrap()).await.unwrap();
        assert_eq!(record.kind, DeviceKind::SolarTracker);
        let out = tb
            .hub()
            .execute(ExecutionRequest::new(record.id, "readAll"))
            .await
            .unwrap();
        assert_eq!(out, Some(vec!["48.6".to_string(), "420".to_string()]));
    }
}
