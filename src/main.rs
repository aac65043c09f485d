#[macro_use]
extern crate tracing;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use calloop::timer::{TimeoutAction, Timer};
use calloop::EventLoop;
use clap::{Parser, Subcommand};
use scrim::backend::{Backend, GpuBackend, SoftwareBackend};
use scrim::buffer::{BufferSource, Fourcc, ShmBuffer};
use scrim::output::{Mode, Output};
use scrim::utils::geometry::{Rect, Size};
use scrim::utils::region::Region;
use scrim::State;
use scrim_config::{Config, RenderBackend};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "A compositing window manager core")]
struct Cli {
    /// Path to the config file (default: $XDG_CONFIG_HOME/scrim/config.kdl).
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Render backend to use, overriding the config (gpu or software).
    #[arg(long)]
    backend: Option<String>,
    #[command(subcommand)]
    subcommand: Option<Sub>,
}

#[derive(Subcommand)]
enum Sub {
    /// Validate the config file and exit.
    Validate,
    /// Run with a synthetic animated client, for testing the pipeline
    /// without a protocol layer.
    Demo,
}

fn main() -> anyhow::Result<()> {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| "scrim=debug".to_owned());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();

    let _tracy = tracy_client::Client::start();

    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(default_config_path);

    if matches!(cli.subcommand, Some(Sub::Validate)) {
        load_config(&path)?;
        println!("{path:?} is valid");
        return Ok(());
    }

    let config = if path.exists() {
        load_config(&path)?
    } else {
        debug!("no config at {path:?}, using defaults");
        Config::default()
    };

    let backend_kind = match cli.backend.as_deref() {
        Some("gpu") => RenderBackend::Gpu,
        Some("software") => RenderBackend::Software,
        Some(other) => anyhow::bail!("unknown backend `{other}`; expected gpu or software"),
        None => config.renderer.backend,
    };

    let backend = match backend_kind {
        RenderBackend::Gpu => match GpuBackend::new() {
            Ok(gpu) => Backend::Gpu(gpu),
            Err(err) => {
                warn!("error creating the GPU backend, falling back to software: {err:?}");
                Backend::Software(SoftwareBackend::new())
            }
        },
        RenderBackend::Software => Backend::Software(SoftwareBackend::new()),
    };
    info!("using the {} backend", backend.name());

    let mut event_loop = EventLoop::<State>::try_new().context("error creating the event loop")?;
    let mut state = State::new(config, backend, event_loop.handle());

    let fail_submissions = state.scrim.config.borrow().debug.fail_frame_submissions;
    state.backend.set_fail_frame_submissions(fail_submissions);

    // Bring up the configured outputs; with none configured, a single
    // virtual output keeps the session usable headless.
    let entries = state.scrim.config.borrow().outputs.clone();
    let mut any = false;
    for entry in &entries {
        if entry.off {
            continue;
        }
        let (size, refresh) = entry
            .mode
            .map(|mode| {
                (
                    Size::new(i32::from(mode.width), i32::from(mode.height)),
                    mode.refresh.or(Some(60.)),
                )
            })
            .unwrap_or((Size::new(1920, 1080), Some(60.)));
        let output = Output::new(&entry.name, Mode::new(size, refresh));
        state.add_output(&output);
        any = true;
    }
    if !any {
        let output = Output::new("virtual-1", Mode::new(Size::new(1920, 1080), Some(60.)));
        state.add_output(&output);
    }

    if matches!(cli.subcommand, Some(Sub::Demo)) {
        spawn_demo_client(&mut state, &event_loop.handle())?;
    }

    event_loop
        .run(None, &mut state, |state| state.refresh_and_redraw())
        .context("error running the event loop")?;

    Ok(())
}

fn load_config(path: &std::path::Path) -> anyhow::Result<Config> {
    match Config::load(path) {
        Ok(config) => Ok(config),
        Err(err) => {
            // The miette report carries the span diagnostics.
            eprintln!("{err:?}");
            anyhow::bail!("error loading config from {path:?}");
        }
    }
}

fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "scrim")
        .map(|dirs| dirs.config_dir().join("config.kdl"))
        .unwrap_or_else(|| PathBuf::from("config.kdl"))
}

/// A stand-in client: one window with a checkerboard buffer that commits a
/// small damage region and wanders around the first output.
fn spawn_demo_client(
    state: &mut State,
    handle: &calloop::LoopHandle<'static, State>,
) -> anyhow::Result<()> {
    let size = Size::new(256, 256);
    let window = state.scrim.map_window(Rect::from_loc_and_size((64., 64.), (256., 256.)));

    let buffer = BufferSource::Shm(
        ShmBuffer::from_pixels(size, size.w * 4, Fourcc::Xrgb8888, &checkerboard(size))
            .context("error building the demo buffer")?,
    );
    let full = Region::from_rect(Rect::from_loc_and_size((0, 0), (size.w, size.h)));
    if let Err(err) = state.surface_commit(window, &buffer, &full) {
        warn!("demo commit failed: {err}");
    }

    let mut step = 0u32;
    let timer = Timer::from_duration(Duration::from_millis(50));
    handle
        .insert_source(timer, move |_, _, state| {
            step = step.wrapping_add(1);
            let angle = f64::from(step) * 0.1;
            let x = 400. + angle.cos() * 300.;
            let y = 300. + angle.sin() * 200.;
            state
                .scrim
                .move_window(window, Rect::from_loc_and_size((x, y), (256., 256.)));
            TimeoutAction::ToDuration(Duration::from_millis(50))
        })
        .map_err(|err| anyhow::anyhow!("error scheduling the demo timer: {err}"))?;

    Ok(())
}

fn checkerboard(size: Size<i32, scrim::utils::geometry::Buffer>) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(size.w as usize * size.h as usize * 4);
    for y in 0..size.h {
        for x in 0..size.w {
            let light = ((x / 32) + (y / 32)) % 2 == 0;
            let value = if light { 0xe0 } else { 0x40 };
            pixels.extend_from_slice(&[value, value, value, 0xff]);
        }
    }
    pixels
}
