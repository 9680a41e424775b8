use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thermal_cycle_control as tcc;
use tcc::{
    CancelToken, ChamberConfig, ConfigError, ControlContext, ControlError, CycleConfig,
    CycleScheduler, Event, Phase, RunOutcome, Scenario, SimChamber, TickRecord, TickSink,
    TripCause,
};

#[derive(Clone, Default)]
struct Alerts(Arc<Mutex<Vec<String>>>);

impl Alerts {
    fn raised(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl tcc::Alert for Alerts {
    fn raise_alert(&mut self, cause: &str) {
        self.0.lock().unwrap().push(cause.to_string());
    }
}

/// Asks for an orderly abort once `left` more ticks have been logged.
struct AbortAfter {
    left: usize,
    cancel: CancelToken,
}

impl TickSink for AbortAfter {
    fn record(&mut self, _: &TickRecord) -> io::Result<()> {
        match self.left.checked_sub(1) {
            Some(left) => self.left = left,
            None => {
                self.cancel.request();
            }
        }
        Ok(())
    }
}

/// Opens the lid as soon as a humidity rise shows up in the tick log.
struct LidOpensOnHumidity {
    chamber: SimChamber,
    armed: bool,
}

impl TickSink for LidOpensOnHumidity {
    fn record(&mut self, rec: &TickRecord) -> io::Result<()> {
        if self.armed && rec.humidity_pct > 1.0 {
            self.armed = false;
            let now = self.chamber.inspect(|m| m.elapsed);
            self.chamber
                .schedule(tcc::Trigger::At(now), tcc::Disturbance::OpenLid);
        }
        Ok(())
    }
}

fn lid_opens_on_humidity(chamber: &SimChamber) -> Box<dyn TickSink> {
    Box::new(LidOpensOnHumidity {
        chamber: chamber.clone(),
        armed: true,
    })
}

struct Run {
    chamber: SimChamber,
    scheduler: CycleScheduler,
    alerts: Alerts,
    ticks: tcc::MemorySink,
}

struct Setup {
    cycle: CycleConfig,
    cfg: ChamberConfig,
    scenario: Scenario,
    cancel: CancelToken,
    extra_sink: Option<Box<dyn TickSink>>,
    chamber_sink: Option<fn(&SimChamber) -> Box<dyn TickSink>>,
}

impl Setup {
    fn new(min: f64, max: f64, cycles: u32, modules: &[u8]) -> Self {
        Self {
            cycle: CycleConfig::new(min, max, cycles, modules.iter().copied()).unwrap(),
            cfg: ChamberConfig::default(),
            scenario: Scenario::Nominal,
            cancel: CancelToken::new(),
            extra_sink: None,
            chamber_sink: None,
        }
    }

    fn scenario(mut self, scenario: Scenario) -> Self {
        self.scenario = scenario;
        self
    }

    fn build(self) -> Run {
        let chamber = SimChamber::new(
            self.cycle.modules().iter().copied(),
            tcc::PlantParams::default(),
            7,
        );
        self.scenario.apply(&chamber);

        let alerts = Alerts::default();
        let ticks = tcc::MemorySink::default();
        let mut sinks: Vec<Box<dyn TickSink>> = vec![Box::new(ticks.clone())];
        sinks.extend(self.extra_sink);
        sinks.extend(self.chamber_sink.map(|make| make(&chamber)));

        let ctx = ControlContext::new(
            chamber.instruments(),
            &self.cfg,
            Arc::new(chamber.clock()),
            self.cancel,
            Box::new(tcc::Fanout(sinks)),
            Box::new(alerts.clone()),
        )
        .unwrap();
        Run {
            scheduler: CycleScheduler::new(self.cycle, self.cfg, ctx).unwrap(),
            chamber,
            alerts,
            ticks,
        }
    }
}

fn journal(chamber: &SimChamber) -> Vec<String> {
    chamber.journal().into_iter().map(|e| e.what).collect()
}

fn position(lines: &[String], what: &str) -> usize {
    lines
        .iter()
        .position(|l| l == what)
        .unwrap_or_else(|| panic!("{what:?} not in journal"))
}

fn entered(events: &[Event], pred: impl Fn(&Phase) -> bool) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, Event::Entered(p) if pred(p)))
        .count()
}

/// Every actuator is safe after a shutdown.
fn assert_parked(chamber: &SimChamber) {
    chamber.inspect(|m| {
        assert!(m.base_running);
        assert_eq!(m.base_setpoint_c, 20.0);
        assert!(m.modules.iter().all(|module| !module.peltier_on));
        assert!(!m.hv.output);
        assert_eq!(m.hv.voltage, 0.0);
        assert!(!m.pelt_supply.output);
        assert_eq!(m.pelt_supply.current_limit, 0.0);
        assert!(m.lv.iter().all(|lv| !lv.output));
    });
}

#[test]
fn nominal_cycle_completes_and_returns_to_hold() {
    let mut run = Setup::new(-30.0, 40.0, 1, &[1, 2]).build();
    let report = run.scheduler.run().unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.cycles_completed, 1);
    assert!(run.alerts.raised().is_empty());

    let events = run.scheduler.ramp().events();
    assert_eq!(
        entered(events, |p| matches!(p, Phase::RampingDown { .. })),
        2
    );
    assert_eq!(entered(events, |p| matches!(p, Phase::RampingUp { .. })), 1);
    assert!(!events.iter().any(|e| matches!(e, Event::Tripped(_))));

    let lines = journal(&run.chamber);
    assert_eq!(lines.first().map(String::as_str), Some("base running=true"));
    assert_eq!(lines.last().map(String::as_str), Some("base running=false"));
    assert!(lines.contains(&"base setpoint=-30".to_string()));
    assert!(lines.contains(&"base setpoint=50".to_string()));
    assert!(lines.contains(&"peltier2 setpoint=-30".to_string()));

    let mean = run.chamber.inspect(|m| m.mean_temp_c());
    assert!((mean - 20.0).abs() < 1.5, "ended at {mean}");

    let ticks = run.ticks.records();
    assert!(ticks.len() > 100);
    assert!(ticks.windows(2).all(|w| w[0].time <= w[1].time));
}

#[test]
fn deep_ramp_pauses_once_before_any_peltier_enable() {
    let mut run = Setup::new(-45.0, 30.0, 1, &[3]).build();
    let report = run.scheduler.run().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);

    let long = ChamberConfig::default().timing.long_precool();
    let pauses = run
        .scheduler
        .ramp()
        .events()
        .iter()
        .filter(|e| **e == Event::PreCool(long))
        .count();
    assert_eq!(pauses, 1);

    let entries = run.chamber.journal();
    let first_enable = entries
        .iter()
        .find(|e| e.what == "peltier3 enabled=true")
        .unwrap();
    assert!(first_enable.at >= long, "enabled at {:?}", first_enable.at);
}

#[test]
fn dewpoint_excursion_backs_off_and_resumes() {
    let mut setup = Setup::new(-30.0, 30.0, 1, &[1, 2]);
    setup.cfg.interlock.dewpoint_soft_margin_c = 8.0;
    let mut run = setup.build();
    run.chamber.schedule(
        tcc::Trigger::NtcBelow(-20.5),
        tcc::Disturbance::HumidityPulse {
            pct: tcc::humidity_for_dewpoint(-26.0, 20.0),
            hold: Duration::from_secs(60),
        },
    );

    let report = run.scheduler.run().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(run.alerts.raised().is_empty());

    let events = run.scheduler.ramp().events();
    assert_eq!(
        entered(events, |p| matches!(p, Phase::MiniRampUp { .. })),
        1
    );
    let mini = events
        .iter()
        .position(|e| matches!(e, Event::Entered(Phase::MiniRampUp { .. })))
        .unwrap();
    let up = events
        .iter()
        .position(|e| matches!(e, Event::Entered(Phase::RampingUp { .. })))
        .unwrap();
    assert!(mini < up);
    assert!(!run.scheduler.ramp().interlock().mini_ramp_up);
}

#[test]
fn trip_during_dewpoint_excursion_abandons_it() {
    let mut setup = Setup::new(-30.0, 30.0, 1, &[1, 2]);
    setup.cfg.interlock.dewpoint_soft_margin_c = 8.0;
    setup.chamber_sink = Some(lid_opens_on_humidity);
    let mut run = setup.build();
    run.chamber.schedule(
        tcc::Trigger::NtcBelow(-20.5),
        tcc::Disturbance::HumidityPulse {
            pct: tcc::humidity_for_dewpoint(-26.0, 20.0),
            hold: Duration::from_secs(60),
        },
    );

    let report = run.scheduler.run().unwrap();
    assert_eq!(report.outcome, RunOutcome::Tripped(TripCause::OpenLid));
    assert_eq!(run.alerts.raised(), vec!["Open Lid".to_string()]);

    let events = run.scheduler.ramp().events();
    let mini = events
        .iter()
        .position(|e| matches!(e, Event::Entered(Phase::MiniRampUp { .. })))
        .unwrap();
    let trip = events
        .iter()
        .position(|e| *e == Event::Tripped(TripCause::OpenLid))
        .unwrap();
    assert!(mini < trip);
    assert!(!events[mini + 1..trip]
        .iter()
        .any(|e| matches!(e, Event::Entered(_))));
    assert_eq!(
        entered(events, |p| matches!(p, Phase::RampingUp { .. })),
        0
    );
    assert_eq!(run.scheduler.ramp().phase(), Phase::SafeShutdown);

    // the stages were enabled once for the ramp-down and never again
    let lines = journal(&run.chamber);
    for stage in ["peltier1", "peltier2"] {
        let enables = lines
            .iter()
            .filter(|l| **l == format!("{stage} enabled=true"))
            .count();
        assert_eq!(enables, 1, "{stage}");
    }
    assert_parked(&run.chamber);
}

#[test]
fn module_runaway_trips_on_temperature() {
    let mut run = Setup::new(-20.0, 45.0, 2, &[1, 2])
        .scenario(Scenario::Runaway)
        .build();
    let report = run.scheduler.run().unwrap();

    assert_eq!(
        report.outcome,
        RunOutcome::Tripped(TripCause::OverTemperature)
    );
    assert_eq!(report.cycles_completed, 0);
    assert_eq!(run.alerts.raised(), vec!["Temperature".to_string()]);
    assert_parked(&run.chamber);

    let lines = journal(&run.chamber);
    let sweep_start = position(&lines, "hv voltage=-95");
    let sweep_end = position(&lines, "hv voltage=0");
    let hv_off = position(&lines, "hv output=false");
    let pelt_off = position(&lines, "pelt output=false");
    let lv_off = position(&lines, "lv2 output=false");
    assert!(sweep_start < sweep_end && sweep_end < hv_off);
    assert!(hv_off < pelt_off && pelt_off < lv_off);
}

#[test]
fn humidity_leak_trips_on_dewpoint() {
    let mut run = Setup::new(-30.0, 40.0, 1, &[1])
        .scenario(Scenario::HumidityLeak)
        .build();
    let report = run.scheduler.run().unwrap();

    assert_eq!(report.outcome, RunOutcome::Tripped(TripCause::Dewpoint));
    assert_eq!(run.alerts.raised(), vec!["Dewpoint".to_string()]);
    assert_parked(&run.chamber);
}

#[test]
fn open_lid_and_relay_trip_shut_down() {
    for (scenario, cause, text) in [
        (Scenario::OpenLid, TripCause::OpenLid, "Open Lid"),
        (
            Scenario::RelayTrip,
            TripCause::HardwareInterlock,
            "HW Interlock",
        ),
        (Scenario::NtcStuck, TripCause::OverTemperature, "Temperature"),
    ] {
        let mut run = Setup::new(-30.0, 40.0, 1, &[1, 4])
            .scenario(scenario)
            .build();
        let report = run.scheduler.run().unwrap();

        assert_eq!(report.outcome, RunOutcome::Tripped(cause), "{scenario}");
        assert_eq!(run.alerts.raised(), vec![text.to_string()]);
        assert_parked(&run.chamber);
    }
}

#[test]
fn second_shutdown_changes_nothing() {
    let mut run = Setup::new(-30.0, 40.0, 1, &[1])
        .scenario(Scenario::OpenLid)
        .build();
    run.scheduler.run().unwrap();

    let before = run.chamber.journal().len();
    run.scheduler.safe_shutdown("again").unwrap();
    assert_eq!(run.chamber.journal().len(), before);
    assert_eq!(run.alerts.raised().len(), 1);
}

#[test]
fn operator_abort_parks_the_chamber() {
    let mut setup = Setup::new(-30.0, 40.0, 1, &[1, 2, 3, 4]);
    setup.extra_sink = Some(Box::new(AbortAfter {
        left: 50,
        cancel: setup.cancel.clone(),
    }));
    let mut run = setup.build();

    let report = run.scheduler.run().unwrap();
    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(run.alerts.raised(), vec![tcc::OPERATOR_ABORT.to_string()]);
    assert_parked(&run.chamber);
    assert!(run.scheduler.ramp().is_shut_down());
}

#[test]
fn sensor_dropouts_are_retried() {
    let mut run = Setup::new(-20.0, 30.0, 1, &[2])
        .scenario(Scenario::NtcDropout)
        .build();
    let report = run.scheduler.run().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
}

#[test]
fn transient_write_failures_are_retried() {
    let mut run = Setup::new(-20.0, 30.0, 1, &[1]).build();
    run.chamber.fail_next_writes(2);

    let report = run.scheduler.run().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);

    let entries = run.chamber.journal();
    let first = &entries[0];
    assert_eq!(first.what, "base running=true");
    // Two backoffs: 10 s then 11 s.
    assert!(first.at >= Duration::from_secs(21), "{:?}", first.at);
}

#[test]
fn persistent_write_failure_parks_the_chamber_and_reports_it() {
    let mut run = Setup::new(-20.0, 30.0, 1, &[1]).build();
    // one more than the first write's retry budget
    run.chamber.fail_next_writes(4);

    let err = run.scheduler.run().unwrap_err();
    assert!(matches!(err, ControlError::Actuator(_)), "{err:?}");

    let alerts = run.alerts.raised();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].starts_with("Actuator failure"), "{}", alerts[0]);
    assert!(run.scheduler.ramp().is_shut_down());
    assert_parked(&run.chamber);
}

#[test]
fn maximum_below_hold_climbs_back_to_hold() {
    let mut run = Setup::new(-10.0, 10.0, 1, &[2]).build();
    let report = run.scheduler.run().unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.cycles_completed, 1);

    let events = run.scheduler.ramp().events();
    assert_eq!(entered(events, |p| matches!(p, Phase::RampingUp { .. })), 2);
    assert_eq!(
        events.last(),
        Some(&Event::Entered(Phase::RampingUp { target: 20.0 }))
    );

    let lines = journal(&run.chamber);
    assert!(lines.contains(&"base setpoint=30".to_string()));
    assert_eq!(lines.last().map(String::as_str), Some("base running=false"));

    let mean = run.chamber.inspect(|m| m.mean_temp_c());
    assert!((mean - 20.0).abs() < 1.5, "ended at {mean}");
}

#[test]
fn invalid_tuning_is_rejected_before_any_write() {
    let chamber = SimChamber::new([1], tcc::PlantParams::default(), 7);
    let mut cfg = ChamberConfig::default();
    cfg.interlock.excursion_c = -100.0;

    let ctx = ControlContext::new(
        chamber.instruments(),
        &cfg,
        Arc::new(chamber.clock()),
        CancelToken::new(),
        Box::new(tcc::MemorySink::default()),
        Box::new(Alerts::default()),
    )
    .unwrap();
    let cycle = CycleConfig::new(-30.0, 40.0, 1, [1]).unwrap();
    let err = CycleScheduler::new(cycle, cfg, ctx).err().unwrap();
    assert!(
        matches!(
            err,
            ConfigError::Invalid {
                field: "interlock.excursion_c",
                ..
            }
        ),
        "{err:?}"
    );
    assert!(chamber.journal().is_empty());
}

#[test]
fn tick_log_file_has_header_and_one_line_per_tick() {
    let dir = tempfile::tempdir().unwrap();
    let csv = tcc::CsvLog::create(dir.path(), chrono::Local::now()).unwrap();
    let path = csv.path().to_path_buf();

    let mut setup = Setup::new(-20.0, 30.0, 1, &[1]);
    setup.extra_sink = Some(Box::new(csv));
    let mut run = setup.build();
    run.scheduler.run().unwrap();
    let ticks = run.ticks.records().len();
    drop(run);

    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some(tcc::CSV_HEADER));
    assert_eq!(lines.count(), ticks);
    assert!(path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .ends_with("_Interlock_log.csv"));
}

#[test]
fn sample_chamber_file_matches_defaults() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("chamber.toml");
    let cfg = ChamberConfig::load_from(&path).unwrap();
    assert_eq!(cfg, ChamberConfig::default());
}
