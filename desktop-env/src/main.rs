// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! desktop-env CLI entry point
//!
//! Runs the configured component fleet until Ctrl+C, or replays a
//! recording of input events.

use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{debug, error, info, trace, warn, LevelFilter};
use simple_logger::SimpleLogger;

use desktop_env::actor::forward_requests;
use desktop_env::buffer::StaleDiscardChannel;
use desktop_env::callback::{chain, from_fn};
use desktop_env::event::replay_all;
use desktop_env::platform::{self, Framerate, PlatformBackend};
use desktop_env::recorder::load_input_file;
use desktop_env::{
    now_ns, Action, Callbacks, Desktop, DesktopConfig, InputEvent, JsonlRecorder, LatestValueSlot, Lifecycle, LifecycleState,
    TimestampedFrame, WindowInfo,
};

/// Interval between two throughput reports
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let matches = Command::new("desktop-env")
        .version(env!("CARGO_PKG_VERSION"))
        .author("desktop-env Authors")
        .about("Capture the desktop, track the active window and hook input")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("JSON component configuration"),
        )
        .arg(
            Arg::new("window-name")
                .short('w')
                .long("window-name")
                .value_name("TITLE")
                .help("Capture the first window whose title contains TITLE"),
        )
        .arg(
            Arg::new("monitor")
                .short('m')
                .long("monitor")
                .value_name("INDEX")
                .value_parser(value_parser!(u32))
                .help("Monitor to capture when no window is named"),
        )
        .arg(
            Arg::new("framerate")
                .long("framerate")
                .value_name("NUM/DEN")
                .value_parser(|s: &str| s.parse::<Framerate>())
                .help("Maximum capture framerate, e.g. 30/1"),
        )
        .arg(
            Arg::new("fps")
                .short('f')
                .long("fps")
                .value_name("FPS")
                .value_parser(value_parser!(u32))
                .help("Active window polls per second"),
        )
        .arg(
            Arg::new("record")
                .short('r')
                .long("record")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Record window and input events as JSON Lines"),
        )
        .arg(
            Arg::new("target-window")
                .short('t')
                .long("target-window")
                .value_name("TITLE")
                .help("Add an actor, fed Action JSON lines on stdin, that only injects into windows titled TITLE"),
        )
        .arg(
            Arg::new("replay")
                .long("replay")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .conflicts_with_all(["config", "record"])
                .help("Re-inject the input events of a recording and exit"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new().with_level(log_level).init()?;

    let backend = platform::detect();

    if let Some(path) = matches.get_one::<PathBuf>("replay") {
        return replay(path, backend.as_ref());
    }

    let config = build_config(&matches)?;
    run(&config, backend.as_ref(), matches.get_one::<PathBuf>("record"))
}

/// Load the configuration file, or the default fleet, and apply CLI overrides.
fn build_config(matches: &ArgMatches) -> anyhow::Result<DesktopConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => DesktopConfig::from_file(path)?,
        None => DesktopConfig::default(),
    };

    if let Some(name) = matches.get_one::<String>("window-name") {
        config.update_capture(|c| c.window_name = Some(name.clone()));
    }
    if let Some(&monitor) = matches.get_one::<u32>("monitor") {
        config.update_capture(|c| c.monitor_index = Some(monitor));
    }
    if let Some(&framerate) = matches.get_one::<Framerate>("framerate") {
        config.update_capture(|c| c.framerate = framerate);
    }
    if let Some(&fps) = matches.get_one::<u32>("fps") {
        config.update_window_publisher(|w| w.fps = fps);
    }
    if matches.get_flag("verbose") {
        config.update_window_publisher(|w| w.verbose = true);
    }
    if let Some(title) = matches.get_one::<String>("target-window") {
        config.update_actor(|a| a.target_window_title = Some(title.clone()));
    }

    config.validate()?;
    Ok(config)
}

fn callbacks(frames: &LatestValueSlot<TimestampedFrame>, record: Option<&PathBuf>) -> anyhow::Result<Callbacks> {
    let mut callbacks = Callbacks {
        on_frame: frames.sink(),
        on_window: from_fn(|window: WindowInfo| info!("Active window: {}", window.title)),
        on_keyboard: from_fn(|event: InputEvent| debug!("{event:?}")),
        on_mouse: from_fn(|event: InputEvent| trace!("{event:?}")),
    };

    if let Some(path) = record {
        let recorder = JsonlRecorder::create(path)?;
        callbacks.on_window = chain(callbacks.on_window, recorder.window_sink());
        callbacks.on_keyboard = chain(callbacks.on_keyboard, recorder.input_sink("keyboard"));
        callbacks.on_mouse = chain(callbacks.on_mouse, recorder.input_sink("mouse"));
    }
    Ok(callbacks)
}

fn run(config: &DesktopConfig, platform: &dyn PlatformBackend, record: Option<&PathBuf>) -> anyhow::Result<()> {
    let frames = LatestValueSlot::new();
    let mut desktop = Desktop::from_config(config, platform, callbacks(&frames, record)?)?;

    let stop = desktop.stop_handle();
    ctrlc::set_handler(move || stop.stop())?;

    if let Err(e) = desktop.start_detached() {
        error!("Desktop failed to start: {e}");
        return Err(e.into());
    }
    info!("desktop-env running, press Ctrl+C to stop");

    if let Some(requests) = desktop.actor_requests() {
        spawn_request_reader(requests)?;
    }

    let mut consumed: u64 = 0;
    let mut window_start = (Instant::now(), 0);
    while desktop.state() == LifecycleState::Running {
        if let Ok(frame) = frames.take(Duration::from_millis(200)) {
            consumed += 1;
            trace!("Frame {}x{}, {} ns old", frame.width, frame.height, frame.age_ns(now_ns()));
        }

        let (since, at) = window_start;
        if since.elapsed() >= REPORT_INTERVAL {
            let rate = (consumed - at) as f64 / since.elapsed().as_secs_f64();
            debug!("Consuming {rate:.1} frames/s");
            window_start = (Instant::now(), consumed);
        }
    }

    info!("Stopping desktop-env...");
    desktop.stop();
    desktop.join()?;
    desktop.close()?;
    for failure in desktop.failures() {
        warn!("Shutdown failure: {failure}");
    }

    info!(
        "desktop-env stopped: {consumed} frames consumed, {} replaced unseen",
        frames.evicted()
    );
    Ok(())
}

/// Feed the actor from stdin. The thread is left to exit with the process.
fn spawn_request_reader(requests: StaleDiscardChannel<Action>) -> anyhow::Result<()> {
    thread::Builder::new().name("actor_stdin".to_string()).spawn(move || {
        match forward_requests(io::stdin().lock(), &requests) {
            Ok(sent) => info!("stdin closed after {sent} actor requests"),
            Err(e) => warn!("Reading actor requests failed: {e}"),
        }
    })?;
    info!("Reading actor requests from stdin");
    Ok(())
}

fn replay(path: &Path, platform: &dyn PlatformBackend) -> anyhow::Result<()> {
    let events = load_input_file(path)?;
    info!("Replaying {} input events from {}", events.len(), path.display());

    let failures = replay_all(events, platform.injector().as_ref(), true);
    if failures > 0 {
        warn!("{failures} events could not be injected");
    }
    Ok(())
}
