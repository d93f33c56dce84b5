//! vrtracer CLI - headless renders and configuration inspection.

use std::env;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};

use vrtracer::gpu::{GpuBackend, SoftwareBackend, SoftwareOptions};
use vrtracer::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendKind {
    Software,
    Gpu,
}

#[derive(Debug)]
struct RenderArgs {
    backend: BackendKind,
    width: Option<u32>,
    height: Option<u32>,
    frames: u32,
    yaw_per_frame: f32,
    config: Option<PathBuf>,
    out: PathBuf,
}

impl Default for RenderArgs {
    fn default() -> Self {
        Self {
            backend: BackendKind::Software,
            width: None,
            height: None,
            frames: 1,
            yaw_per_frame: 0.0,
            config: None,
            out: PathBuf::from("render.png"),
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let prog = args.first().map(String::as_str).unwrap_or("vrtracer");

    // Global flags
    let mut level = "info";
    let mut rest: Vec<&str> = Vec::new();
    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "-v" | "--verbose" => level = "debug",
            "-vv" | "--trace" => level = "trace",
            "-q" | "--quiet" => level = "warn",
            "-V" | "--version" => {
                println!(
                    "vrtracer {} (built {} {})",
                    env!("CARGO_PKG_VERSION"),
                    env!("VRTRACER_BUILD_DATE"),
                    env!("VRTRACER_BUILD_TIME")
                );
                return;
            }
            _ => rest.push(arg),
        }
    }
    let _log = vrtracer::logging::init(level);

    let result = match rest.first().copied() {
        Some("render" | "r") => parse_render(&rest[1..]).and_then(cmd_render),
        Some("info" | "i") => parse_config_flag(&rest[1..]).and_then(cmd_info),
        Some("help" | "h" | "-h" | "--help") | None => {
            print_usage(prog);
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            print_usage(prog);
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage(prog: &str) {
    println!("vrtracer - interactive ray tracer (headless front end)");
    println!();
    println!("Usage: {prog} [options] <command> [args]");
    println!();
    println!("Commands:");
    println!("  r, render  Render the cube scene to an image");
    println!("             --backend software|gpu  --width W  --height H  --frames N");
    println!("             --yaw DEG_PER_FRAME  --config FILE  --out FILE (.png or .exr)");
    println!("  i, info    Show resolved configuration and scene statistics");
    println!("             --config FILE");
    println!("  h, help    Show this help");
    println!();
    println!("Options:");
    println!("  -v, --verbose  Debug output");
    println!("  -vv, --trace   Trace output (very verbose)");
    println!("  -q, --quiet    Warnings only");
    println!("  -V, --version  Print version and build date");
    println!();
    println!("Set VRTRACER_TRACE=1 to write a Chrome trace to trace.json.");
}

fn value<'a>(args: &[&'a str], i: &mut usize, flag: &str) -> anyhow::Result<&'a str> {
    *i += 1;
    args.get(*i).copied().with_context(|| format!("{flag} needs a value"))
}

fn parse_render(args: &[&str]) -> anyhow::Result<RenderArgs> {
    let mut out = RenderArgs::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i];
        match flag {
            "--backend" => {
                out.backend = match value(args, &mut i, flag)? {
                    "software" | "cpu" => BackendKind::Software,
                    "gpu" | "wgpu" => BackendKind::Gpu,
                    other => bail!("unknown backend '{other}' (expected software or gpu)"),
                }
            }
            "--width" => out.width = Some(value(args, &mut i, flag)?.parse().context("--width")?),
            "--height" => out.height = Some(value(args, &mut i, flag)?.parse().context("--height")?),
            "--frames" => out.frames = value(args, &mut i, flag)?.parse().context("--frames")?,
            "--yaw" => out.yaw_per_frame = value(args, &mut i, flag)?.parse().context("--yaw")?,
            "--config" => out.config = Some(PathBuf::from(value(args, &mut i, flag)?)),
            "--out" | "-o" => out.out = PathBuf::from(value(args, &mut i, flag)?),
            other => bail!("unknown render option '{other}'"),
        }
        i += 1;
    }
    if out.frames == 0 {
        bail!("--frames must be at least 1");
    }
    Ok(out)
}

fn parse_config_flag(args: &[&str]) -> anyhow::Result<Option<PathBuf>> {
    match args {
        [] => Ok(None),
        ["--config", path] => Ok(Some(PathBuf::from(*path))),
        _ => bail!("usage: info [--config FILE]"),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RendererConfig> {
    match path {
        Some(p) => RendererConfig::load_from(p).with_context(|| format!("reading {}", p.display())),
        None => Ok(RendererConfig::load()),
    }
}

fn cmd_info(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path.as_ref())?;
    let scene = Scene::cube_scene()?;

    match RendererConfig::path() {
        Some(p) => println!("Config file: {} ({})", p.display(), if p.exists() { "found" } else { "defaults" }),
        None => println!("Config file: <no config dir>"),
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!();
    println!("Scene:");
    println!("  Geometries: {}", scene.geometries().len());
    println!("  Instances:  {}", scene.instances().len());
    println!("  Triangles:  {}", scene.triangle_count());
    let b = scene.bounds();
    println!("  Bounds:     {:?} .. {:?}", b.min.to_array(), b.max.to_array());
    println!();
    println!("GPU backend: {}", if cfg!(feature = "gpu") { "available" } else { "not built" });
    Ok(())
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(w) = args.width {
        config.width = w;
    }
    if let Some(h) = args.height {
        config.height = h;
    }
    let size = config.output_size();

    match args.backend {
        BackendKind::Software => {
            let backend = SoftwareBackend::new(SoftwareOptions {
                surface_size: size,
                ..Default::default()
            });
            render_with(backend, config, &args)
        }
        #[cfg(feature = "gpu")]
        BackendKind::Gpu => {
            let backend = WgpuBackend::new(WgpuOptions {
                surface_size: size,
                ..Default::default()
            })
            .context("creating wgpu backend")?;
            render_with(backend, config, &args)
        }
        #[cfg(not(feature = "gpu"))]
        BackendKind::Gpu => bail!("built without the gpu feature"),
    }
}

fn render_with<B: GpuBackend>(backend: B, config: RendererConfig, args: &RenderArgs) -> anyhow::Result<()> {
    let name = backend.name();
    let deg_per_point = config.fly.degrees_per_cursor_point;
    let mut renderer = Renderer::new(backend, Scene::cube_scene()?, config).context("renderer setup")?;

    // Yaw is -dx * degrees_per_cursor_point
    let input = FrameInput {
        dt: 1.0 / 60.0,
        pointer_delta: Vec2::new(-args.yaw_per_frame / deg_per_point, 0.0),
        ..Default::default()
    };

    let start = Instant::now();
    for _ in 0..args.frames {
        renderer.render_frame(&input)?;
    }
    let image = renderer.read_output()?;
    let elapsed = start.elapsed();

    let stats = renderer.stats();
    tracing::info!(
        backend = name,
        frames = args.frames,
        submitted = stats.frames_submitted,
        skipped = stats.frames_skipped,
        max_in_flight = stats.max_in_flight,
        ms_per_frame = elapsed.as_secs_f64() * 1000.0 / args.frames as f64,
        "render finished"
    );

    image
        .save(&args.out)
        .with_context(|| format!("writing {}", args.out.display()))?;
    println!(
        "{}: {}x{}, {} of {} pixels hit",
        args.out.display(),
        image.size.x,
        image.size.y,
        image.hit_count(),
        image.pixels.len()
    );
    renderer.shutdown()?;
    Ok(())
}
