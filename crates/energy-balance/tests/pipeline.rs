use device_registry::{DeviceDescriptor, DeviceHub, DeviceId, HubConfig};
use energy_balance::{
    BalanceController, BalanceOutcome, KwSource, LastApplied, MemoryStore, PowerEstimate, TelemetryPoller, Testbed,
    TestbedSettings,
};
use line_transport::{MockFirmware, MockHandle, MockLine};
use safety_guard::SafetyInterlock;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;

fn descriptor(port: &str, name: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        port: port.to_string(),
        name: name.to_string(),
        baud: line_transport::DEFAULT_BAUD,
        role: None,
        catalog: None,
    }
}

fn testbed(safe_mode: bool, prefer_manual: bool) -> Arc<Testbed> {
    let hub = DeviceHub::new(HubConfig::default(), Arc::new(SafetyInterlock::new(safe_mode))).unwrap();
    let settings = TestbedSettings {
        prefer_manual,
        outlier_filter: false,
    };
    Arc::new(Testbed::new(Arc::new(hub), Arc::new(MemoryStore::new()), settings).unwrap())
}

async fn attach(tb: &Testbed, port: &str, name: &str, firmware: MockFirmware) -> (DeviceId, MockHandle) {
    let (line, handle) = MockLine::with_firmware(port, firmware);
    let record = tb.connect(&descriptor(port, name), Box::new(line)).await.unwrap();
    (record.id, handle)
}

fn generator_fw() -> MockFirmware {
    MockFirmware::new(["readAll>2", "setLoad<1", "stop"]).respond("readAll", ["230.1", "0"])
}

fn solar_fw() -> MockFirmware {
    MockFirmware::new(["getVoltage>1", "getPower>1", "setAngle<1"])
        .respond("getVoltage", ["V=48.2"])
        .respond("getPower", ["P=400W"])
}

fn house_fw() -> MockFirmware {
    MockFirmware::new(["readAll>2", "setLights<1"]).respond("readAll", ["229.9", "-350"])
}

#[tokio::test]
async fn poll_then_balance_the_generator() {
    let tb = testbed(false, true);
    let (gen, gen_handle) = attach(&tb, "gen0", "Generator", generator_fw()).await;
    let (pv, _) = attach(&tb, "pv0", "Solar Tracker", solar_fw()).await;
    let (house, _) = attach(&tb, "house0", "House Load", house_fw()).await;

    // Telemetry sweep reaches every device through the hub.
    let poller = TelemetryPoller::new(Duration::from_secs(5), Duration::from_millis(1));
    assert_eq!(poller.sweep(&tb).await, 3);
    let pv_sample = tb.sample(&pv).unwrap();
    assert_eq!(pv_sample.voltage, Some(48.2));
    assert_eq!(pv_sample.power_w, Some(400.0));
    assert_eq!(tb.sample(&house).unwrap().power_w, Some(-350.0));
    assert_eq!(tb.sample(&gen).unwrap().voltage, Some(230.1));

    // Operator plan: the solar array promises 4 kW, the house needs 10.
    tb.set_estimate("Solar Tracker", PowerEstimate::provider(4.0, None).unwrap()).unwrap();
    tb.set_estimate("House Load", PowerEstimate::consumer(10_000.0, None).unwrap()).unwrap();
    let edge = tb.add_edge(&pv, &house).unwrap();
    assert_eq!(edge.kw, 4.0);
    tb.edit_edge(&pv, &house, 10.0).unwrap();
    let pv_record = tb.hub().device(&pv).unwrap();
    assert_eq!(tb.kw_of(&pv_record).source, KwSource::Estimate);

    let controller = BalanceController::new(Duration::from_secs(2));
    let report = controller.balance_once(&tb).await;
    assert_eq!(report.outcome, BalanceOutcome::Dispatched);
    assert_eq!(report.demand_kw, 10.0);
    assert_eq!(report.other_supply_kw, 4.0);
    assert_eq!(report.target_kw, Some(6.0));
    assert_eq!(gen_handle.args_for("setLoad"), vec![vec!["6.00".to_string()]]);
    assert_eq!(tb.last_applied().map(|l| l.target_kw), Some(6.0));

    // Same numbers again: nothing is sent.
    let report = controller.balance_once(&tb).await;
    assert_eq!(report.outcome, BalanceOutcome::Suppressed);
    assert_eq!(gen_handle.args_for("setLoad").len(), 1);

    // A nameplate cap on the generator limits the setpoint.
    tb.set_estimate("Generator", PowerEstimate::provider(3.0, None).unwrap()).unwrap();
    let report = controller.balance_once(&tb).await;
    assert_eq!(report.cap_kw, Some(3.0));
    assert_eq!(report.target_kw, Some(3.0));
    assert_eq!(gen_handle.args_for("setLoad").last(), Some(&vec!["3.00".to_string()]));

    // Every command left one log entry.
    let log = tb.hub().recent_executions(100);
    assert!(log.iter().any(|r| r.command == "setLoad" && r.args == ["3.00"]));
}

#[tokio::test]
async fn safe_mode_computes_but_does_not_dispatch() {
    let tb = testbed(true, true);
    let (_gen, gen_handle) = attach(&tb, "gen0", "Generator", generator_fw()).await;
    let (pv, _) = attach(&tb, "pv0", "Solar Tracker", solar_fw()).await;
    let (house, _) = attach(&tb, "house0", "House Load", house_fw()).await;
    tb.set_estimate("Solar Tracker", PowerEstimate::provider(1.0, None).unwrap()).unwrap();
    tb.add_edge(&pv, &house).unwrap();
    tb.edit_edge(&pv, &house, 2.5).unwrap();

    let report = BalanceController::new(Duration::from_secs(2)).balance_once(&tb).await;
    assert_eq!(report.outcome, BalanceOutcome::SafeMode);
    assert_eq!(report.target_kw, Some(1.5));
    assert!(gen_handle.args_for("setLoad").is_empty());
    assert!(tb.last_applied().is_none());
}

#[tokio::test]
async fn overlapping_passes_report_busy() {
    let tb = testbed(false, true);
    attach(&tb, "gen0", "Generator", generator_fw()).await;
    let (pv, _) = attach(&tb, "pv0", "Solar Tracker", solar_fw()).await;
    let (house, _) = attach(&tb, "house0", "House Load", house_fw()).await;
    tb.add_edge(&pv, &house).unwrap();
    tb.edit_edge(&pv, &house, 2.0).unwrap();

    let controller = BalanceController::new(Duration::from_secs(2));
    let (a, b) = tokio::join!(controller.balance_once(&tb), controller.balance_once(&tb));
    let outcomes = [a.outcome, b.outcome];
    assert!(outcomes.contains(&BalanceOutcome::Dispatched));
    assert!(outcomes.contains(&BalanceOutcome::Busy));
}

#[tokio::test]
async fn missing_generator_is_reported_not_raised() {
    let tb = testbed(false, false);
    let report = BalanceController::new(Duration::from_secs(2)).balance_once(&tb).await;
    assert_eq!(report.outcome, BalanceOutcome::NoGenerator { configured_but_offline: false });

    tb.set_topology(vec![descriptor("gen0", "Generator")]);
    let report = BalanceController::new(Duration::from_secs(2)).balance_once(&tb).await;
    assert_eq!(report.outcome, BalanceOutcome::NoGenerator { configured_but_offline: true });
}

#[tokio::test]
async fn first_generator_wins_when_several_are_connected() {
    let tb = testbed(false, false);
    let (_a, a_handle) = attach(&tb, "gen0", "Generator A", generator_fw()).await;
    let (b, b_handle) = attach(&tb, "gen1", "Generator B", generator_fw()).await;
    let (house, _) = attach(&tb, "house0", "House Load", house_fw()).await;
    tb.set_estimate("Generator B", PowerEstimate::provider(5.0, None).unwrap()).unwrap();
    tb.set_estimate("House Load", PowerEstimate::consumer(2000.0, None).unwrap()).unwrap();
    tb.add_edge(&b, &house).unwrap();

    let report = BalanceController::new(Duration::from_secs(2)).balance_once(&tb).await;
    assert!(report.is_ambiguous());
    assert_eq!(report.generator, Some(DeviceId::from("gen0")));
    assert_eq!(report.ignored_generators, vec![b]);
    assert_eq!(report.outcome, BalanceOutcome::Dispatched);
    assert_eq!(report.target_kw, Some(2.0));
    assert_eq!(a_handle.args_for("setLoad"), vec![vec!["2.00".to_string()]]);
    assert!(b_handle.args_for("setLoad").is_empty());
}

#[tokio::test]
async fn disconnect_keeps_other_devices_polling() {
    let tb = testbed(false, false);
    let (gen, gen_handle) = attach(&tb, "gen0", "Generator", generator_fw()).await;
    let (pv, _) = attach(&tb, "pv0", "Solar Tracker", solar_fw()).await;
    gen_handle.close();

    let poller = TelemetryPoller::new(Duration::from_secs(5), Duration::ZERO);
    poller.sweep(&tb).await;
    assert_eq!(tb.sample(&pv).unwrap().power_w, Some(400.0));
    assert!(!tb.hub().device(&gen).unwrap().is_connected());

    tb.disconnect(&gen).unwrap();
    assert!(tb.sample(&gen).is_none());
    assert_eq!(poller.sweep(&tb).await, 1);
}

#[tokio::test]
async fn a_one_cent_change_is_not_resent() {
    let tb = testbed(false, true);
    let (gen, gen_handle) = attach(&tb, "gen0", "Generator", generator_fw()).await;
    let (pv, _) = attach(&tb, "pv0", "Solar Tracker", solar_fw()).await;
    let (house, _) = attach(&tb, "house0", "House Load", house_fw()).await;
    tb.set_estimate("Solar Tracker", PowerEstimate::provider(4.0, None).unwrap()).unwrap();
    tb.add_edge(&pv, &house).unwrap();
    tb.edit_edge(&pv, &house, 10.0).unwrap();
    let controller = BalanceController::new(Duration::from_secs(2));

    let applied = |kw: f64| LastApplied {
        generator: gen.clone(),
        target_kw: kw,
        at: OffsetDateTime::now_utc(),
    };
    tb.set_last_applied(&applied(5.99)).unwrap();
    let report = controller.balance_once(&tb).await;
    assert_eq!(report.target_kw, Some(6.0));
    assert_eq!(report.outcome, BalanceOutcome::Suppressed);
    assert!(gen_handle.args_for("setLoad").is_empty());

    tb.set_last_applied(&applied(5.98)).unwrap();
    let report = controller.balance_once(&tb).await;
    assert_eq!(report.outcome, BalanceOutcome::Dispatched);
    assert_eq!(gen_handle.args_for("setLoad"), vec![vec!["6.00".to_string()]]);
}

#[tokio::test]
async fn connected_generator_without_setter_is_not_reported_offline() {
    let tb = testbed(false, false);
    let (gen, gen_handle) = attach(&tb, "gen0", "Generator", MockFirmware::new(["readAll>2"])).await;
    let report = BalanceController::new(Duration::from_secs(2)).balance_once(&tb).await;
    assert_eq!(report.outcome, BalanceOutcome::NoLoadSetter);
    assert_eq!(report.generator, Some(gen));
    assert!(!report.is_ambiguous());
    assert!(gen_handle.args_for("readAll").is_empty());
}

#[tokio::test]
async fn generator_without_setter_still_makes_the_choice_ambiguous() {
    let tb = testbed(false, false);
    let (a, a_handle) = attach(&tb, "gen0", "Generator A", generator_fw()).await;
    let (b, _) = attach(&tb, "gen1", "Generator B", MockFirmware::new(["readAll>2"])).await;
    let (pv, _) = attach(&tb, "pv0", "Solar Tracker", solar_fw()).await;
    let (house, _) = attach(&tb, "house0", "House Load", house_fw()).await;
    tb.add_edge(&pv, &house).unwrap();
    tb.edit_edge(&pv, &house, 1.0).unwrap();

    let report = BalanceController::new(Duration::from_secs(2)).balance_once(&tb).await;
    assert!(report.is_ambiguous());
    assert_eq!(report.generator, Some(a));
    assert_eq!(report.ignored_generators, vec![b]);
    assert_eq!(report.outcome, BalanceOutcome::Dispatched);
    assert_eq!(a_handle.args_for("setLoad").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn poller_loop_honours_pause_and_shutdown() {
    let tb = testbed(false, false);
    let (pv, _) = attach(&tb, "pv0", "Solar Tracker", solar_fw()).await;
    let poller = Arc::new(TelemetryPoller::new(Duration::from_secs(5), Duration::ZERO));
    poller.pause();

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = {
        let (poller, tb) = (poller.clone(), tb.clone());
        tokio::spawn(async move { poller.run(tb, stop_rx).await })
    };

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(tb.sample(&pv).is_none());
    assert!(tb.hub().recent_executions(10).is_empty());

    poller.resume();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(tb.sample(&pv).unwrap().power_w, Some(400.0));

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn balance_loop_dispatches_only_while_mode2_is_on() {
    let tb = testbed(false, true);
    let (_gen, gen_handle) = attach(&tb, "gen0", "Generator", generator_fw()).await;
    let (pv, _) = attach(&tb, "pv0", "Solar Tracker", solar_fw()).await;
    let (house, _) = attach(&tb, "house0", "House Load", house_fw()).await;
    tb.set_estimate("Solar Tracker", PowerEstimate::provider(1.0, None).unwrap()).unwrap();
    tb.add_edge(&pv, &house).unwrap();
    tb.edit_edge(&pv, &house, 3.0).unwrap();

    let controller = Arc::new(BalanceController::new(Duration::from_secs(2)));
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = {
        let (controller, tb) = (controller.clone(), tb.clone());
        tokio::spawn(async move { controller.run(tb, stop_rx).await })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(gen_handle.args_for("setLoad").is_empty());

    tb.set_mode2(true).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(gen_handle.args_for("setLoad"), vec![vec!["2.00".to_string()]]);

    // Later ticks see the same target and stay quiet.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(gen_handle.args_for("setLoad").len(), 1);

    tb.set_mode2(false).unwrap();
    tb.edit_edge(&pv, &house, 5.0).unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(gen_handle.args_for("setLoad").len(), 1);

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
}
