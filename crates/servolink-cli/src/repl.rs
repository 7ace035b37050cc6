//! REPL – Read-Eval-Print Loop for the servolink operator shell.
//!
//! Supported slash-commands:
//!   /init bms|motor|all|off – battery / motor initialisation
//!   /torque on|off          – motor torque
//!   /mode low|high          – hand control to or from the command stream
//!   /state                  – latest telemetry
//!   /target <joint> <rad>   – set one joint target
//!   /stats                  – channel and loop counters
//!   /log                    – recent service outcomes
//!   /help                   – show this list
//!   /quit | /exit           – gracefully exit the CLI

use colored::Colorize;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use servolink_types::{BmsInitType, ControlMode, LinkError, ServiceResponse, TorqueType, joint};

use crate::station::Station;

/// Number of service outcomes kept for `/log`.
pub const LOG_CAPACITY: usize = 50;

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Init(BmsInitType),
    Torque(TorqueType),
    Mode(ControlMode),
    State,
    Target { joint: usize, q: f32 },
    Stats,
    Log,
    Help,
    Quit,
}

/// Parse one input line. Errors carry the message shown to the operator.
pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let head = words.next().ok_or_else(|| "empty command".to_string())?;
    let args: Vec<&str> = words.collect();

    let cmd = match (head, args.as_slice()) {
        ("/init", [which]) => Command::Init(match *which {
            "bms" => BmsInitType::Bms,
            "motor" => BmsInitType::Motor,
            "all" => BmsInitType::BmsAndMotor,
            "off" => BmsInitType::None,
            other => return Err(format!("unknown init target '{other}' (bms|motor|all|off)")),
        }),
        ("/torque", [state]) => Command::Torque(match *state {
            "on" => TorqueType::On,
            "off" => TorqueType::Off,
            other => return Err(format!("unknown torque state '{other}' (on|off)")),
        }),
        ("/mode", [mode]) => Command::Mode(match *mode {
            "low" => ControlMode::LowLevel,
            "high" => ControlMode::HighLevel,
            other => return Err(format!("unknown mode '{other}' (low|high)")),
        }),
        ("/target", [name, value]) => {
            let joint = joint::lookup(name).ok_or_else(|| format!("unknown joint '{name}'"))?;
            let q = value
                .parse::<f32>()
                .map_err(|_| format!("'{value}' is not a position in radians"))?;
            if !q.is_finite() {
                return Err(format!("'{value}' is not a finite position"));
            }
            Command::Target { joint, q }
        }
        ("/state", []) => Command::State,
        ("/stats", []) => Command::Stats,
        ("/log", []) => Command::Log,
        ("/help", []) => Command::Help,
        ("/quit" | "/exit", []) => Command::Quit,
        ("/init" | "/torque" | "/mode" | "/target", _) => {
            return Err(format!("wrong arguments for {head}; see /help"));
        }
        (other, _) => return Err(format!("unknown command '{other}'")),
    };
    Ok(cmd)
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcome log
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded history of timestamped service outcomes; the oldest line is
/// dropped once the capacity is reached.
#[derive(Debug)]
pub struct OutcomeLog {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for OutcomeLog {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

impl OutcomeLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `result` under `label` and return the line as stored.
    pub fn record(&mut self, label: &str, result: &Result<ServiceResponse, LinkError>) -> String {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        let line = format!("[{stamp}] {label}: {}", outcome_text(result));
        self.push(line.clone());
        line
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// `SUCCESS`, or `FAILED - <reason>`.
pub fn outcome_text(result: &Result<ServiceResponse, LinkError>) -> String {
    match result {
        Ok(response) if response.success => "SUCCESS".to_string(),
        Ok(response) if response.message.is_empty() => "FAILED - refused by robot".to_string(),
        Ok(response) => format!("FAILED - {}", response.message),
        Err(e) => format!("FAILED - {e}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(station: &Station, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut log = OutcomeLog::default();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "servolink>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match parse(input) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(cmd) => execute(station, &mut log, cmd),
            Err(msg) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                msg.yellow(),
                "/help".bold()
            ),
        }
    }
}

/// Run one parsed command against `station`.
pub fn execute(station: &Station, log: &mut OutcomeLog, cmd: Command) {
    match cmd {
        Command::Init(init) => {
            let result = station.client.init_bms(init, station.timeout);
            print_outcome(log.record(&format!("init {init:?}"), &result), &result);
        }
        Command::Torque(torque) => {
            let result = station.client.set_torque(torque, station.timeout);
            print_outcome(log.record(&format!("torque {torque:?}"), &result), &result);
        }
        Command::Mode(mode) => {
            let result = station.session.set_mode(mode, station.timeout);
            print_outcome(log.record(&format!("mode {mode:?}"), &result), &result);
        }
        Command::State => cmd_state(station),
        Command::Target { joint, q } => match station.session.set_target(joint, q) {
            Ok(()) => println!(
                "  {} {} = {:.3} rad",
                "target".green(),
                joint::name(joint).unwrap_or("?").bold(),
                q
            ),
            Err(e) => println!("{}: {}", "Error".red(), e),
        },
        Command::Stats => cmd_stats(station),
        Command::Log => {
            if log.is_empty() {
                println!("  {}", "no service calls yet".dimmed());
                return;
            }
            println!("{} ({})", "Service Log".bold().underline(), log.len());
            for line in log.lines() {
                println!("  {line}");
            }
        }
        Command::Help => cmd_help(),
        Command::Quit => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn print_outcome(line: String, result: &Result<ServiceResponse, LinkError>) {
    match result {
        Ok(response) if response.success => println!("  {}", line.green()),
        _ => println!("  {}", line.red()),
    }
}

fn cmd_help() {
    println!();
    println!("{}", "servolink Commands".bold().underline());
    println!("  {}  – initialise battery and/or motors", "/init bms|motor|all|off".bold().cyan());
    println!("  {}           – motor torque", "/torque on|off".bold().cyan());
    println!("  {}           – low-level (streamed) or high-level control", "/mode low|high".bold().cyan());
    println!("  {}                   – latest telemetry", "/state".bold().cyan());
    println!("  {}    – set a joint target (name or index)", "/target <joint> <rad>".bold().cyan());
    println!("  {}                   – channel and loop counters", "/stats".bold().cyan());
    println!("  {}                     – recent service outcomes", "/log".bold().cyan());
    println!("  {}             – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_state(station: &Station) {
    let Some(state) = station.low_state.latest() else {
        println!("  {}", "no telemetry received yet".yellow());
        return;
    };
    let mode = station
        .mode_state
        .latest()
        .map(|m| format!("{:?}", m.mode))
        .unwrap_or_else(|| "unknown".to_string());

    println!("{}", "Robot State".bold().underline());
    println!("  tick          : {}", state.tick);
    println!("  control mode  : {}", mode.yellow());
    println!(
        "  streaming     : {}",
        if station.session.is_low_level() { "on".green() } else { "off".dimmed() }
    );
    let rpy = state.imu_state.rpy;
    println!(
        "  imu rpy (deg) : {:.1} {:.1} {:.1}",
        rpy[0].to_degrees(),
        rpy[1].to_degrees(),
        rpy[2].to_degrees()
    );
    for m in &state.motor_state {
        println!(
            "    {:<17} q={:+.3} dq={:+.3} T={:.0}°C",
            joint::name(usize::from(m.id)).unwrap_or("?"),
            m.q,
            m.dq,
            m.temperature
        );
    }
    let faulted = state.faulted_motors();
    if faulted.is_empty() {
        println!("  faults        : {}", "none".green());
    }
    for (id, fault) in faulted {
        println!(
            "  {} motor {} ({}): {}",
            "FAULT".red().bold(),
            id,
            joint::name(usize::from(id)).unwrap_or("?"),
            fault.names().join(", ")
        );
    }
}

fn cmd_stats(station: &Station) {
    println!("{}", "Statistics".bold().underline());
    for (kind, s) in station.client.stats() {
        println!(
            "  {:<13} issued={} completed={} timeouts={} busy={} send_failures={} late={} pending={}",
            kind, s.issued, s.completed, s.timed_out, s.rejected_busy, s.send_failures,
            s.late_responses, s.pending
        );
    }
    let l = station.control.stats();
    println!(
        "  {:<13} state={:?} ticks={} published={} failures={} overruns={}",
        "control loop",
        station.control.state(),
        l.ticks,
        l.published,
        l.publish_failures,
        l.overruns
    );
    println!(
        "  {:<13} lowstate={} controlmode={}",
        "telemetry",
        station.low_state.received(),
        station.mode_state.received()
    );
    if let Some(sim) = &station.sim {
        let s = sim.stats();
        println!(
            "  {:<13} requests={} commands={} crc_rejects={} states={}",
            "sim", s.requests, s.commands, s.crc_rejects, s.states_published
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;

    #[test]
    fn parse_service_commands() {
        assert_eq!(parse("/init all"), Ok(Command::Init(BmsInitType::BmsAndMotor)));
        assert_eq!(parse("/init off"), Ok(Command::Init(BmsInitType::None)));
        assert_eq!(parse("/torque on"), Ok(Command::Torque(TorqueType::On)));
        assert_eq!(parse("/mode low"), Ok(Command::Mode(ControlMode::LowLevel)));
        assert_eq!(parse("  /mode   high "), Ok(Command::Mode(ControlMode::HighLevel)));
        assert_eq!(parse("/exit"), Ok(Command::Quit));
    }

    #[test]
    fn parse_target_by_name_and_index() {
        assert_eq!(
            parse("/target l_knee 0.5"),
            Ok(Command::Target { joint: joint::L_KNEE, q: 0.5 })
        );
        assert_eq!(
            parse("/target 26 -1.25"),
            Ok(Command::Target { joint: joint::R_ELBOW, q: -1.25 })
        );
        assert!(parse("/target tail 0.1").is_err());
        assert!(parse("/target l_knee fast").is_err());
        assert!(parse("/target l_knee NaN").is_err());
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(parse("/torque maybe").is_err());
        assert!(parse("/init").unwrap_err().contains("wrong arguments"));
        assert!(parse("/state now").is_err());
        assert!(parse("/dance").unwrap_err().contains("unknown command"));
    }

    #[test]
    fn outcome_text_formats() {
        let ok = Ok(ServiceResponse::ok("req-1"));
        assert_eq!(outcome_text(&ok), "SUCCESS");

        let refused = Ok(ServiceResponse::failed("req-2", "battery low"));
        assert_eq!(outcome_text(&refused), "FAILED - battery low");

        let busy = Err(LinkError::Busy("torque".to_string()));
        assert!(outcome_text(&busy).starts_with("FAILED - Busy"));
    }

    #[test]
    fn outcome_log_is_bounded() {
        let mut log = OutcomeLog::default();
        for i in 0..LOG_CAPACITY + 7 {
            log.push(format!("line {i}"));
        }
        assert_eq!(log.len(), LOG_CAPACITY);
        assert_eq!(log.lines().next(), Some("line 7"));
        assert_eq!(log.lines().last(), Some(format!("line {}", LOG_CAPACITY + 6).as_str()));
    }

    #[test]
    fn recorded_line_carries_timestamp() {
        let mut log = OutcomeLog::with_capacity(2);
        let line = log.record("torque On", &Ok(ServiceResponse::ok("req-3")));
        assert!(line.starts_with('['));
        assert_eq!(line.find(']'), Some(9));
        assert!(line.ends_with("torque On: SUCCESS"));
    }

    #[test]
    fn execute_against_simulated_robot() -> Result<(), Box<dyn std::error::Error>> {
        let cfg = Config {
            period_us: 5_000,
            service_timeout_ms: 2_000,
            ..Config::default()
        };
        let station = Station::bring_up(&cfg, true)?;
        assert!(station.low_state.wait_for_first_state(Duration::from_secs(2)).is_some());
        let mut log = OutcomeLog::default();

        execute(&station, &mut log, Command::Torque(TorqueType::On));
        execute(&station, &mut log, Command::Mode(ControlMode::LowLevel));
        execute(&station, &mut log, Command::Target { joint: joint::L_KNEE, q: 0.3 });

        assert_eq!(log.len(), 2);
        assert!(log.lines().all(|l| l.ends_with("SUCCESS")));
        assert!(station.session.is_low_level());
        assert!((station.session.targets().q[joint::L_KNEE] - 0.3).abs() < f32::EPSILON);

        let sim = station.sim.as_ref().ok_or("sim missing")?;
        assert_eq!(sim.torque(), TorqueType::On);
        Ok(())
    }
}
