//! CLI for the `operantd` daemon, plus offline plan tools.
//!
//! Examples:
//!   operant-cli status
//!   operant-cli start Jubilee choice 42 video
//!   operant-cli begin
//!   operant-cli peck left
//!   operant-cli abort
//!   operant-cli plan Hendrix autoshaping 7
//!   operant-cli simulate TEST choice 7 out.csv
//!
//! Daemon commands talk to 127.0.0.1:9877; override with `--addr host:port`.
//! Offline commands read `--config path` (defaults otherwise).

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use operant::config::KeyLayout;
use operant::io::{NullHopper, NullRenderer};
use operant::log::{session_file_name, NullSink};
use operant::prelude::*;
use operant::stats::SessionStats;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    GetStatus,
    ListSubjects,
    StartSession {
        subject: String,
        phase: String,
        #[serde(default)]
        seed: Option<u64>,
        #[serde(default)]
        record_video: Option<bool>,
    },
    BeginTrials,
    Touch {
        target: Target,
        x: f64,
        y: f64,
    },
    Abort,
    PreviewPlan {
        subject: String,
        phase: String,
        #[serde(default)]
        seed: Option<u64>,
    },
    Subscribe,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Response {
    Status(Box<DaemonStatus>),
    Subjects { subjects: Vec<SubjectEntry> },
    Plan { plan: TrialPlan },
    Screen { screen: Screen },
    Success { message: String },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DaemonStatus {
    #[serde(default)]
    session: Option<SessionSnapshot>,
    #[serde(default)]
    substage: Option<Substage>,
    #[serde(default)]
    data_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubjectEntry {
    name: String,
    group: u8,
    #[serde(default)]
    test: bool,
}

fn usage() -> ! {
    eprintln!("Usage: operant-cli [--addr host:port] [--config path] <command> [args]\n");
    eprintln!("Daemon commands:");
    eprintln!("  status                              Current session snapshot");
    eprintln!("  subjects                            Registered subjects");
    eprintln!("  start <subject> <phase> [seed] [video]");
    eprintln!("                                      Prepare a session (phase: 0|1|2 or name)");
    eprintln!("  preview <subject> <phase> [seed]    Trial plan the daemon would run");
    eprintln!("  begin                               Subject is in the box; start the clock");
    eprintln!("  peck <target> [x y]                 Inject a touch (stimulus|left|right|terminal|background)");
    eprintln!("  abort                               End the running session");
    eprintln!("  watch                               Stream screen updates");
    eprintln!("  shutdown                            Stop the daemon");
    eprintln!();
    eprintln!("Offline commands:");
    eprintln!("  plan <subject> <phase> [seed]       Print the trial plan as JSON");
    eprintln!("  simulate <subject> <phase> [seed] [csv]");
    eprintln!("                                      Run a session with a virtual subject");
    process::exit(1);
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" | "video" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

struct Args {
    addr: String,
    config: Option<PathBuf>,
    rest: Vec<String>,
}

fn parse_args() -> Args {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut addr = "127.0.0.1:9877".to_string();
    let mut config = None;

    loop {
        match args.first().map(String::as_str) {
            Some("--addr") if args.len() >= 2 => {
                addr = args[1].clone();
                args.drain(0..2);
            }
            Some("--config") if args.len() >= 2 => {
                config = Some(PathBuf::from(&args[1]));
                args.drain(0..2);
            }
            _ => break,
        }
    }

    if args.is_empty() {
        usage();
    }
    Args {
        addr,
        config,
        rest: args,
    }
}

fn send_request(addr: &str, req: &Request) -> Result<Response, String> {
    let mut stream = TcpStream::connect(addr).map_err(|e| format!("connect: {e}"))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .map_err(|e| format!("set_read_timeout: {e}"))?;
    let mut reader = BufReader::new(stream.try_clone().map_err(|e| format!("clone: {e}"))?);

    let line = serde_json::to_string(req).map_err(|e| format!("serialize: {e}"))?;
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(|e| format!("send: {e}"))?;

    let mut resp_line = String::new();
    reader
        .read_line(&mut resp_line)
        .map_err(|e| format!("recv: {e}"))?;
    serde_json::from_str(&resp_line).map_err(|e| format!("parse response: {e}"))
}

/// Subscribe and print every screen until the daemon closes the stream.
fn watch(addr: &str) -> Result<(), String> {
    let mut stream = TcpStream::connect(addr).map_err(|e| format!("connect: {e}"))?;
    let reader = BufReader::new(stream.try_clone().map_err(|e| format!("clone: {e}"))?);
    let line = serde_json::to_string(&Request::Subscribe).map_err(|e| format!("serialize: {e}"))?;
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(|e| format!("send: {e}"))?;

    for line in reader.lines() {
        let line = line.map_err(|e| format!("recv: {e}"))?;
        match serde_json::from_str::<Response>(&line) {
            Ok(Response::Screen { screen }) => print_screen(&screen),
            Ok(Response::Success { message }) => println!("{message}"),
            Ok(Response::Error { message }) => return Err(message),
            Ok(other) => println!("{other:?}"),
            Err(e) => return Err(format!("parse response: {e}")),
        }
    }
    Ok(())
}

fn print_screen(screen: &Screen) {
    match screen {
        Screen::AwaitingSubject { subject, phase } => {
            println!("[screen] place {subject} in the box ({phase})")
        }
        Screen::Iti { ms } => println!("[screen] ITI {:.1}s", *ms as f64 / 1000.0),
        Screen::Blank => println!("[screen] blank"),
        Screen::Stimulus { trial, payload } => {
            let what = match payload {
                Payload::None => "key".to_string(),
                Payload::Single { stimulus } => stimulus.label().to_string(),
                Payload::Pair { left, right } => format!("{} | {}", left.label(), right.label()),
                Payload::Colors { left, right } => format!("{left} | {right}"),
            };
            println!("[screen] trial {trial}: {what}");
        }
        Screen::TerminalLink { trial } => println!("[screen] trial {trial}: terminal link"),
        Screen::Reinforcement { auto, hopper_ms } => {
            println!("[screen] hopper up {hopper_ms}ms{}", if *auto { " (auto)" } else { "" })
        }
        Screen::CorrectionTimeout { ms } => println!("[screen] correction timeout {ms}ms"),
        Screen::SessionEnded { reason } => println!("[screen] session ended: {}", reason.label()),
    }
}

fn print_stats(stats: &SessionStats) {
    println!(
        "itis={} presented={} reinforced={} auto={} corrections={} sbe_acc={:.1}% free L/R={}/{} bias={:+.2} pecks={}",
        stats.itis,
        stats.trials_presented,
        stats.reinforcements,
        stats.auto_reinforcements,
        stats.corrections,
        stats.sbe_accuracy() * 100.0,
        stats.free_choice_left,
        stats.free_choice_right,
        stats.side_bias(),
        stats.pecks,
    );
}

fn print_status(s: DaemonStatus) {
    let Some(snap) = s.session else {
        println!("idle (no session prepared)");
        return;
    };
    println!(
        "subject={} phase={} seed={} stage={} trial={}/{} (plan {}) time={:.1}s correction={}",
        snap.subject,
        snap.phase,
        snap.seed,
        snap.stage,
        snap.trial_num,
        snap.max_trials,
        snap.planned_trials,
        snap.session_time_ms as f64 / 1000.0,
        snap.correction,
    );
    if let Some(substage) = s.substage {
        println!("substage={substage:?}");
    }
    if let Some(reason) = snap.end_reason {
        println!("ended: {}", reason.label());
    }
    if let Some(file) = s.data_file {
        println!("data file: {file}");
    }
    print_stats(&snap.stats);
}

fn touch_point(target: Target) -> [f64; 2] {
    let layout = KeyLayout::default();
    match target {
        Target::Stimulus => layout.center,
        Target::Left => layout.left,
        Target::Right => layout.right,
        Target::TerminalLink => layout.terminal_link,
        Target::Background => [0.0, 0.0],
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Offline tools
// ─────────────────────────────────────────────────────────────────────────────

fn load_offline(config: Option<&PathBuf>) -> Result<(ExperimentConfig, Catalog), String> {
    let cfg = match config {
        Some(path) => ExperimentConfig::load(path).map_err(|e| e.to_string())?,
        None => ExperimentConfig::default(),
    };
    let catalog = if cfg.stimuli_path.exists() {
        Catalog::load(&cfg.stimuli_path).map_err(|e| e.to_string())?
    } else {
        eprintln!(
            "note: {} not found, using the built-in stimulus set",
            cfg.stimuli_path.display()
        );
        Catalog::builtin_gradient_set()
    };
    Ok((cfg, catalog))
}

fn plan(config: Option<&PathBuf>, subject: &str, phase: Phase, seed: u64) -> Result<(), String> {
    let (cfg, catalog) = load_offline(config)?;
    cfg.validate().map_err(|e| e.to_string())?;
    let (group, _) = cfg.subjects.resolve(subject).map_err(|e| e.to_string())?;
    let plan = SequenceGenerator::new(&cfg, phase, seed)
        .generate(&catalog, group)
        .map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&plan).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}

/// A pigeon that pecks at random latencies, is right on most side-bias
/// trials and leans slightly left on free choices.
struct VirtualSubject {
    rng: StdRng,
    accuracy: f64,
    left_preference: f64,
    engagement: f64,
}

impl VirtualSubject {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
            accuracy: 0.85,
            left_preference: 0.55,
            engagement: 0.95,
        }
    }

    fn latency(&mut self) -> Millis {
        self.rng.gen_range(250..=1500)
    }

    fn choose(&mut self, session: &SessionController) -> Option<Target> {
        let substage = session.current_substage()?;
        let trial = session.plan().get(session.trial_num())?;
        match substage {
            Substage::Blank => None,
            Substage::TerminalLink => Some(Target::TerminalLink),
            Substage::StimulusActive if !trial.kind.is_two_alternative() => {
                self.rng.gen_bool(self.engagement).then_some(Target::Stimulus)
            }
            Substage::StimulusActive => {
                let side = match trial.correct_side {
                    Some(correct) if self.rng.gen_bool(self.accuracy) => correct,
                    Some(correct) => correct.opposite(),
                    None if self.rng.gen_bool(self.left_preference) => Side::Left,
                    None => Side::Right,
                };
                Some(match side {
                    Side::Left => Target::Left,
                    Side::Right => Target::Right,
                })
            }
        }
    }
}

fn simulate(
    config: Option<&PathBuf>,
    subject: &str,
    phase: Phase,
    seed: u64,
    csv: Option<PathBuf>,
) -> Result<(), String> {
    let (cfg, catalog) = load_offline(config)?;
    let setup = SessionSetup {
        subject: subject.to_string(),
        phase,
        seed,
        started_at: chrono::Local::now().naive_local(),
        record_video: false,
    };

    let ctx = match &csv {
        Some(path) => {
            let path = if path.is_dir() {
                path.join(session_file_name(subject, setup.started_at, phase))
            } else {
                path.clone()
            };
            let sink = CsvFileSink::create(&path).map_err(|e| format!("{}: {e}", path.display()))?;
            println!("writing {}", path.display());
            SessionContext::new(NullRenderer, NullHopper, sink)
        }
        None => SessionContext::new(NullRenderer, NullHopper, NullSink),
    };

    let mut session =
        SessionController::prepare(&cfg, &catalog, setup, ctx).map_err(|e| e.to_string())?;
    let mut pigeon = VirtualSubject::new(seed);

    session.begin(0);
    while let Some(deadline) = session.next_deadline() {
        match pigeon.choose(&session) {
            Some(target) => {
                let [x, y] = touch_point(target);
                let now = session.now() + pigeon.latency();
                session.handle_response(operant::schedule::Response::new(target, x, y), now);
            }
            None => session.advance_to(deadline),
        }
    }

    let snap = session.snapshot();
    println!(
        "subject={} phase={} seed={} trials={} ended={} time={:.1}min records={}",
        snap.subject,
        snap.phase,
        snap.seed,
        snap.trial_num,
        snap.end_reason.map(EndReason::label).unwrap_or("-"),
        snap.session_time_ms as f64 / 60_000.0,
        session.log().len(),
    );
    print_stats(&snap.stats);
    Ok(())
}

fn main() {
    let Args { addr, config, rest } = parse_args();
    let cmd = rest[0].as_str();

    let make_error = |msg: &str| -> ! {
        eprintln!("{}", msg);
        process::exit(1);
    };

    let phase_arg = |i: usize| -> Phase {
        rest.get(i)
            .unwrap_or_else(|| usage())
            .parse()
            .unwrap_or_else(|e: ConfigError| make_error(&e.to_string()))
    };
    let seed_arg = |i: usize| -> Option<u64> {
        rest.get(i).map(|s| {
            s.parse()
                .unwrap_or_else(|_| make_error("seed must be a non-negative integer"))
        })
    };

    let req = match cmd {
        "status" => Request::GetStatus,
        "subjects" => Request::ListSubjects,
        "start" => {
            if rest.len() < 3 {
                usage();
            }
            let phase = phase_arg(2);
            Request::StartSession {
                subject: rest[1].clone(),
                phase: phase.as_str().to_string(),
                seed: seed_arg(3),
                record_video: rest.get(4).map(|s| {
                    parse_bool(s).unwrap_or_else(|| make_error("video must be true|false"))
                }),
            }
        }
        "preview" => {
            if rest.len() < 3 {
                usage();
            }
            let phase = phase_arg(2);
            Request::PreviewPlan {
                subject: rest[1].clone(),
                phase: phase.as_str().to_string(),
                seed: seed_arg(3),
            }
        }
        "begin" => Request::BeginTrials,
        "peck" => {
            if rest.len() < 2 {
                usage();
            }
            let target = Target::parse(&rest[1]).unwrap_or_else(|| {
                make_error("target must be stimulus|left|right|terminal|background")
            });
            let [mut x, mut y] = touch_point(target);
            if rest.len() >= 4 {
                x = rest[2]
                    .parse()
                    .unwrap_or_else(|_| make_error("x must be a number"));
                y = rest[3]
                    .parse()
                    .unwrap_or_else(|_| make_error("y must be a number"));
            }
            Request::Touch { target, x, y }
        }
        "abort" => Request::Abort,
        "shutdown" => Request::Shutdown,
        "watch" => {
            if let Err(e) = watch(&addr) {
                eprintln!("Failed: {e}");
                process::exit(1);
            }
            process::exit(0);
        }
        "plan" | "simulate" => {
            if rest.len() < 3 {
                usage();
            }
            let subject = rest[1].as_str();
            let phase = phase_arg(2);
            let seed = seed_arg(3).unwrap_or_else(rand::random::<u64>);
            let result = if cmd == "plan" {
                plan(config.as_ref(), subject, phase, seed)
            } else {
                simulate(config.as_ref(), subject, phase, seed, rest.get(4).map(PathBuf::from))
            };
            if let Err(e) = result {
                eprintln!("Error: {e}");
                process::exit(1);
            }
            process::exit(0);
        }
        _ => usage(),
    };

    match send_request(&addr, &req) {
        Ok(Response::Status(s)) => print_status(*s),
        Ok(Response::Subjects { subjects }) => {
            for s in subjects {
                println!(
                    "{:<12} group={}{}",
                    s.name,
                    s.group,
                    if s.test { " (test)" } else { "" }
                );
            }
        }
        Ok(Response::Plan { plan }) => match serde_json::to_string_pretty(&plan) {
            Ok(json) => println!("{json}"),
            Err(e) => make_error(&format!("serialize plan: {e}")),
        },
        Ok(Response::Screen { screen }) => print_screen(&screen),
        Ok(Response::Success { message }) => println!("{message}"),
        Ok(Response::Error { message }) => {
            eprintln!("Error: {message}");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed: {e}");
            process::exit(1);
        }
    }
}
