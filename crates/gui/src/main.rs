use std::fs;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use controller::{
    alert_text, Alert, CancelToken, ChamberConfig, ControlContext, CycleConfig, CycleScheduler,
    RunOutcome, RunReport, TickRecord, TickSink,
};
use eframe::egui;
use egui_plot::{Line, Plot, PlotPoints};
use sim::{PlantParams, Scenario, SimChamber};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// What the control thread reports back to the window.
enum Msg {
    Tick(TickRecord),
    Alert(String),
    Done(Result<RunReport, String>),
}

struct ChannelSink(Sender<Msg>);

impl TickSink for ChannelSink {
    fn record(&mut self, rec: &TickRecord) -> io::Result<()> {
        self.0
            .send(Msg::Tick(rec.clone()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "monitor window closed"))
    }
}

struct ChannelAlert(Sender<Msg>);

impl Alert for ChannelAlert {
    fn raise_alert(&mut self, cause: &str) {
        let _ = self.0.send(Msg::Alert(cause.to_string()));
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Status {
    Idle,
    Running,
    Finished(RunOutcome),
    Failed,
}

struct Settings {
    scenario: Scenario,
    min_c: f64,
    max_c: f64,
    cycles: u32,
    modules: [bool; 4],
    speedup: f64,
    seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scenario: Scenario::Nominal,
            min_c: -40.0,
            max_c: 45.0,
            cycles: 1,
            modules: [true; 4],
            speedup: 600.0,
            seed: 12345,
        }
    }
}

impl Settings {
    fn selected_modules(&self) -> Vec<u8> {
        (1u8..=4)
            .zip(self.modules)
            .filter_map(|(id, on)| on.then_some(id))
            .collect()
    }
}

struct App {
    settings: Settings,
    status: Status,
    cancel: Option<CancelToken>,
    rx: Option<Receiver<Msg>>,

    samples: Vec<TickRecord>,
    alert: Option<String>,
    trip_minute: Option<f64>,

    replay_loaded: bool,
    replay_path: String,
    replay_all: Vec<TickRecord>,
    replay_pos: usize,
    replay_playing: bool,
    replay_speed: usize,
    last_error: Option<String>,
}

impl Default for App {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            status: Status::Idle,
            cancel: None,
            rx: None,
            samples: Vec::new(),
            alert: None,
            trip_minute: None,
            replay_loaded: false,
            replay_path: "out/run.jsonl".to_string(),
            replay_all: Vec::new(),
            replay_pos: 0,
            replay_playing: false,
            replay_speed: 20,
            last_error: None,
        }
    }
}

impl App {
    fn start_live(&mut self, ctx: &egui::Context) {
        self.clear_replay();
        self.samples.clear();
        self.alert = None;
        self.trip_minute = None;
        self.last_error = None;

        let s = &self.settings;
        let cycle = match CycleConfig::new(s.min_c, s.max_c, s.cycles, s.selected_modules()) {
            Ok(c) => c,
            Err(e) => {
                self.last_error = Some(e.to_string());
                return;
            }
        };
        let chamber = SimChamber::new(cycle.modules().iter().copied(), PlantParams::default(), s.seed);
        s.scenario.apply(&chamber);
        let clock = chamber.clock().paced(s.speedup);

        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let repaint = ctx.clone();
        let spawned = thread::Builder::new()
            .name("control".into())
            .spawn(move || {
                let cfg = ChamberConfig::default();
                let report = ControlContext::new(
                    chamber.instruments(),
                    &cfg,
                    Arc::new(clock),
                    worker_cancel,
                    Box::new(ChannelSink(tx.clone())),
                    Box::new(ChannelAlert(tx.clone())),
                )
                .and_then(|control| Ok(CycleScheduler::new(cycle, cfg, control)?.run()?))
                .map_err(|e| e.to_string());
                let _ = tx.send(Msg::Done(report));
                repaint.request_repaint();
            });

        match spawned {
            Ok(_) => {
                info!(scenario = %self.settings.scenario, "live run started");
                self.cancel = Some(cancel);
                self.rx = Some(rx);
                self.status = Status::Running;
            }
            Err(e) => self.last_error = Some(format!("could not start the control thread: {e}")),
        }
    }

    fn abort(&mut self) {
        if let Some(cancel) = &self.cancel {
            let level = cancel.request();
            warn!(?level, "operator abort");
        }
    }

    fn drain(&mut self) {
        let Some(rx) = &self.rx else {
            return;
        };
        let mut done = false;
        for msg in rx.try_iter() {
            match msg {
                Msg::Tick(rec) => self.samples.push(rec),
                Msg::Alert(cause) => {
                    self.trip_minute = self.samples.last().map(|r| minutes(&self.samples, r));
                    self.alert = Some(alert_text(&cause));
                }
                Msg::Done(Ok(report)) => {
                    self.status = Status::Finished(report.outcome);
                    done = true;
                }
                Msg::Done(Err(e)) => {
                    self.status = Status::Failed;
                    self.last_error = Some(e);
                    done = true;
                }
            }
        }
        if done {
            self.rx = None;
            self.cancel = None;
        }
    }

    fn clear_replay(&mut self) {
        self.replay_loaded = false;
        self.replay_all.clear();
        self.replay_pos = 0;
        self.replay_playing = false;
    }

    /// Load a JSON-lines trace written by `tacc --trace`.
    fn load_jsonl(&mut self, path: &str) {
        self.last_error = None;

        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                self.last_error = Some(format!("Failed to read {path}: {e}"));
                return;
            }
        };

        let mut loaded = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TickRecord>(line) {
                Ok(rec) => loaded.push(rec),
                Err(e) => {
                    self.last_error = Some(format!("JSON parse error at line {}: {}", i + 1, e));
                    return;
                }
            }
        }
        if loaded.is_empty() {
            self.last_error = Some(format!("No records found in {path}"));
            return;
        }

        self.clear_replay();
        self.replay_loaded = true;
        self.replay_all = loaded;
        self.status = Status::Idle;
        self.alert = None;
        self.trip_minute = None;

        self.samples.clear();
        let initial = self.replay_speed.min(self.replay_all.len()).max(1);
        self.samples.extend_from_slice(&self.replay_all[..initial]);
        self.replay_pos = initial;
    }

    fn replay_step(&mut self, n: usize) {
        if !self.replay_loaded || self.replay_pos >= self.replay_all.len() {
            self.replay_playing = false;
            return;
        }
        let end = (self.replay_pos + n.max(1)).min(self.replay_all.len());
        self.samples
            .extend_from_slice(&self.replay_all[self.replay_pos..end]);
        self.replay_pos = end;
    }

    fn status_label(&self) -> (String, egui::Color32) {
        match self.status {
            Status::Idle => ("IDLE".into(), egui::Color32::GRAY),
            Status::Running => ("RUNNING".into(), egui::Color32::GREEN),
            Status::Finished(RunOutcome::Completed) => ("COMPLETED".into(), egui::Color32::GREEN),
            Status::Finished(RunOutcome::Tripped(cause)) => {
                (format!("TRIPPED: {cause}"), egui::Color32::RED)
            }
            Status::Finished(RunOutcome::Aborted) => ("ABORTED".into(), egui::Color32::YELLOW),
            Status::Failed => ("ACTUATOR FAILURE".into(), egui::Color32::RED),
        }
    }

    fn settings_panel(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        let idle = self.status != Status::Running;
        let s = &mut self.settings;

        ui.label("Scenario");
        egui::ComboBox::from_id_salt("scenario")
            .selected_text(s.scenario.name())
            .show_ui(ui, |ui| {
                for sc in Scenario::ALL {
                    ui.selectable_value(&mut s.scenario, sc, sc.name());
                }
            });

        ui.separator();
        ui.label("Cycle");
        ui.add_enabled(
            idle,
            egui::Slider::new(&mut s.min_c, -50.0..=10.0).text("min (°C)"),
        );
        ui.add_enabled(
            idle,
            egui::Slider::new(&mut s.max_c, 20.0..=60.0).text("max (°C)"),
        );
        ui.add_enabled(idle, egui::Slider::new(&mut s.cycles, 1..=20).text("cycles"));
        ui.horizontal(|ui| {
            for (i, on) in s.modules.iter_mut().enumerate() {
                ui.add_enabled(idle, egui::Checkbox::new(on, format!("M{}", i + 1)));
            }
        });
        ui.add_enabled(
            idle,
            egui::Slider::new(&mut s.speedup, 1.0..=5000.0)
                .logarithmic(true)
                .text("speed-up"),
        );
        ui.add_enabled(idle, egui::DragValue::new(&mut s.seed).prefix("seed: "));

        ui.separator();
        ui.horizontal(|ui| {
            if ui.add_enabled(idle, egui::Button::new("Run")).clicked() {
                self.start_live(ctx);
            }
            if ui
                .add_enabled(!idle, egui::Button::new("Abort"))
                .on_hover_text("First press stops at the next tick, second press skips waits")
                .clicked()
            {
                self.abort();
            }
        });

        ui.separator();
        ui.label("Replay (JSONL)");
        ui.horizontal(|ui| {
            ui.label("path:");
            ui.text_edit_singleline(&mut self.replay_path);
        });
        ui.horizontal(|ui| {
            if ui.add_enabled(idle, egui::Button::new("Load")).clicked() {
                let p = self.replay_path.clone();
                self.load_jsonl(&p);
            }
            let label = if self.replay_playing { "Pause" } else { "Play" };
            if ui.button(label).clicked() && self.replay_loaded {
                self.replay_playing = !self.replay_playing;
            }
            if ui.button("Step").clicked() {
                self.replay_step(1);
            }
        });
        ui.add(egui::Slider::new(&mut self.replay_speed, 1..=500).text("records/frame"));
        if self.replay_loaded {
            ui.small(format!(
                "Loaded: {}/{} records",
                self.samples.len(),
                self.replay_all.len()
            ));
        }

        if let Some(err) = &self.last_error {
            ui.separator();
            ui.colored_label(egui::Color32::RED, err);
        }
    }
}

/// Minutes since the first record.
fn minutes(samples: &[TickRecord], rec: &TickRecord) -> f64 {
    samples
        .first()
        .map(|first| (rec.time - first.time).num_milliseconds() as f64 / 60_000.0)
        .unwrap_or(0.0)
}

fn series(samples: &[TickRecord], f: impl Fn(&TickRecord) -> f64) -> PlotPoints {
    samples
        .iter()
        .map(|r| [minutes(samples, r), f(r)])
        .filter(|p| p[1].is_finite())
        .collect()
}

impl eframe::App for App {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain();
        if self.replay_playing {
            self.replay_step(self.replay_speed);
        }
        if self.status == Status::Running || self.replay_playing {
            ctx.request_repaint();
        }

        let (status, color) = self.status_label();
        egui::TopBottomPanel::top("top").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.heading("Thermal cycle monitor");
                ui.separator();
                ui.label(if self.replay_loaded { "MODE: REPLAY" } else { "MODE: LIVE" });
                ui.separator();
                ui.colored_label(color, status);
                if let Some(last) = self.samples.last() {
                    ui.separator();
                    ui.label(format!(
                        "NTC {:.2} °C  chuck {:.2} °C  dewpoint {:.2} °C  RH {:.2} %",
                        last.ntc_avg, last.chuck_avg, last.dewpoint_c, last.humidity_pct
                    ));
                }
            });
        });

        egui::SidePanel::left("left")
            .resizable(false)
            .show(ctx, |ui| self.settings_panel(ui, ctx));

        if let Some(text) = self.alert.clone() {
            let mut open = true;
            egui::Window::new("Interlock")
                .collapsible(false)
                .open(&mut open)
                .show(ctx, |ui| {
                    ui.colored_label(egui::Color32::RED, text);
                });
            if !open {
                self.alert = None;
            }
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            if self.samples.is_empty() {
                ui.label("No data yet. Run LIVE or Load a REPLAY file.");
                return;
            }

            let samples = &self.samples;
            ui.heading("Temperatures (°C) over minutes");
            Plot::new("temp_plot").height(280.0).show(ui, |plot_ui| {
                plot_ui.line(Line::new(series(samples, |r| r.ntc_avg)).name("NTC avg"));
                plot_ui.line(Line::new(series(samples, |r| r.chuck_avg)).name("Chuck avg"));
                plot_ui.line(Line::new(series(samples, |r| r.dewpoint_c)).name("Dewpoint"));
                if let Some(t) = self.trip_minute {
                    let vline: PlotPoints = vec![[t, -60.0], [t, 80.0]].into();
                    plot_ui.line(Line::new(vline).name("Shutdown"));
                }
            });

            Plot::new("power_plot").height(160.0).show(ui, |plot_ui| {
                plot_ui.line(Line::new(series(samples, |r| r.pelt_current)).name("Peltier I (A)"));
                plot_ui.line(Line::new(series(samples, |r| r.lv_current)).name("LV I (A)"));
                plot_ui.line(
                    Line::new(series(samples, |r| r.hv_voltage / 10.0)).name("HV (V/10)"),
                );
            });
        });
    }
}

fn main() -> eframe::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let native_options = eframe::NativeOptions::default();
    eframe::run_native(
        "Thermal cycle monitor",
        native_options,
        Box::new(|_cc| Ok(Box::new(App::default()))),
    )
}
