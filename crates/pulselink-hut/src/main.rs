//! Pulselink Hut - terminal metronome
//!
//! Joins pulselink sessions on the local network and ticks along with them.
//! A simulated audio thread reads the session through the real-time handle
//! and prints every beat; the main thread takes commands from stdin.
//!
//! ## Command line flags
//!
//! - `--tempo <bpm>`: initial tempo (default 120)
//! - `--quantum <beats>`: beats per bar for phase display and launch (default 4)
//! - `--config <path>`: config file (default `~/.config/pulselink/config.yaml`)
//!
//! ## Commands
//!
//! `space` or `s` start/stop, `+`/`-` tempo, `a` toggle active, `q` quit.
//! Each command is confirmed with Enter.

use anyhow::{bail, Context, Result};
use pulselink_core::config::{default_config_path, load_config};
use pulselink_core::{Clock, Link, LinkConfig, LoopbackHub, RealtimeHandle};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Simulated audio buffer period
const BUFFER_PERIOD: Duration = Duration::from_millis(5);

/// How often the main thread polls session events while idle
const EVENT_POLL: Duration = Duration::from_millis(100);

const TEMPO_STEP: f64 = 1.0;

struct Args {
    tempo: f64,
    quantum: f64,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        tempo: 120.0,
        quantum: 4.0,
        config: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--tempo" => {
                let value = iter.next().context("--tempo needs a value")?;
                args.tempo = value.parse().with_context(|| format!("Invalid tempo: {value}"))?;
            }
            "--quantum" => {
                let value = iter.next().context("--quantum needs a value")?;
                args.quantum = value.parse().with_context(|| format!("Invalid quantum: {value}"))?;
            }
            "--config" => {
                args.config = Some(iter.next().context("--config needs a path")?.into());
            }
            "-h" | "--help" => {
                println!("usage: pulselink-hut [--tempo <bpm>] [--quantum <beats>] [--config <path>]");
                std::process::exit(0);
            }
            other => bail!("Unknown argument: {other}"),
        }
    }
    if !(args.quantum.is_finite() && args.quantum > 0.0) {
        bail!("Quantum must be positive");
    }
    Ok(args)
}

fn main() -> Result<()> {
    // Set RUST_LOG=debug for protocol traffic
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = parse_args()?;
    let config_path = args.config.clone().unwrap_or_else(|| default_config_path("config.yaml"));
    let mut config: LinkConfig = load_config(&config_path);
    config.session.quantum = args.quantum;

    let link = match pulselink_net::udp_link(args.tempo, config.clone()) {
        Ok(link) => link,
        Err(e) => {
            log::warn!("Network unavailable ({}), running solo", e);
            let transport = Arc::new(LoopbackHub::new().endpoint());
            Link::with_transport(args.tempo, config, transport)?
        }
    };

    println!("pulselink-hut: peer {}", link.id());
    println!("  space/s: start/stop   +/-: tempo   a: toggle active   q: quit");
    println!();

    let running = Arc::new(AtomicBool::new(true));
    let realtime = link
        .take_realtime_handle()
        .context("Real-time handle already taken")?;
    let audio = spawn_audio(realtime, link.clock(), args.quantum, running.clone())?;
    let commands = spawn_stdin()?;

    link.on_tempo_changed(|bpm| println!("tempo: {:.2} bpm", bpm));
    link.on_num_peers_changed(|n| println!("peers: {}", n));
    link.on_start_stop_changed(|playing| println!("{}", if playing { "playing" } else { "stopped" }));
    link.on_enabled_changed(|enabled| println!("link {}", if enabled { "enabled" } else { "disabled" }));
    link.on_start_stop_sync_enabled_changed(|on| println!("start/stop sync {}", if on { "on" } else { "off" }));

    loop {
        match commands.recv_timeout(EVENT_POLL) {
            Ok(line) => {
                if !handle_command(&link, &line, args.quantum) {
                    break;
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => {}
            // stdin closed
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
        link.poll_events();
    }

    running.store(false, Ordering::Release);
    if audio.join().is_err() {
        log::error!("Audio thread panicked");
    }
    Ok(())
}

/// Apply one stdin command on the control path; false means quit
fn handle_command(link: &Link, line: &str, quantum: f64) -> bool {
    // A line of blanks is the space command
    let command = if !line.is_empty() && line.trim().is_empty() { " " } else { line.trim() };
    match command {
        " " | "s" => {
            let mut state = link.capture_app_session_state();
            let now = link.now();
            if state.is_playing() {
                state.set_is_playing(false, now);
            } else if let Err(e) = state.set_is_playing_and_request_beat_at_time(true, now, 0.0, quantum) {
                log::warn!("Failed to start: {}", e);
                return true;
            }
            link.commit_app_session_state(state);
        }
        "+" | "-" => {
            let mut state = link.capture_app_session_state();
            let step = if command == "+" { TEMPO_STEP } else { -TEMPO_STEP };
            let tempo = (state.tempo() + step).max(TEMPO_STEP);
            match state.set_tempo(tempo, link.now()) {
                Ok(()) => link.commit_app_session_state(state),
                Err(e) => log::warn!("Failed to set tempo: {}", e),
            }
        }
        "a" => {
            let active = !link.is_active();
            link.set_active(active);
            println!("{}", if active { "active" } else { "inactive" });
        }
        "q" => return false,
        "" => {}
        other => println!("unknown command: {other:?}"),
    }
    true
}

/// Stand-in for an audio callback, running once per buffer period
fn spawn_audio(
    mut realtime: RealtimeHandle,
    clock: Arc<dyn Clock>,
    quantum: f64,
    running: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("hut-audio".into())
        .spawn(move || {
            let mut was_playing = false;
            let mut last_beat: Option<i64> = None;

            while running.load(Ordering::Acquire) {
                let now = clock.now();
                let mut state = realtime.capture();

                // A start from a peer arrives without a beat mapping; anchor beat 0 to it
                if state.is_playing() && !was_playing {
                    if state.request_beat_at_start_playing_time(0.0, quantum).is_ok() {
                        realtime.commit(state);
                    }
                    last_beat = None;
                }
                was_playing = state.is_playing();

                if state.is_playing() && now >= state.time_for_is_playing() {
                    if let (Ok(beat), Ok(phase)) = (state.beat_at_time(now, quantum), state.phase_at_time(now, quantum)) {
                        let whole = beat.floor() as i64;
                        // Count-in until beat 0 reaches the next bar of the session
                        if beat >= 0.0 && last_beat != Some(whole) {
                            last_beat = Some(whole);
                            let marker = if phase < 1.0 { "TICK" } else { "tick" };
                            println!(
                                "{marker} beat {:>6.2}  phase {:.2}/{}  {:.1} bpm  {} peers",
                                beat,
                                phase,
                                quantum,
                                state.tempo(),
                                state.num_peers()
                            );
                        }
                    }
                }

                thread::sleep(BUFFER_PERIOD);
            }
        })
        .context("Failed to spawn audio thread")?;
    Ok(handle)
}

/// Forward stdin lines to the main thread
fn spawn_stdin() -> Result<flume::Receiver<String>> {
    let (tx, rx) = flume::unbounded();
    thread::Builder::new()
        .name("hut-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("Failed to spawn stdin thread")?;
    Ok(rx)
}
