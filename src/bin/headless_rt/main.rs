//! headless-rt CLI - render animated demo scenes or OBJ files to PNG frames.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use headless_rt::device::RenderBackend;
use headless_rt::loader::{self, LoaderConfig, ModelSource, Primitive};
use headless_rt::model::Material;
use headless_rt::scene::{AnimationWorker, Animator, InstanceId};
use headless_rt::{Renderer, RendererConfig};
use glam::{Mat4, Vec3};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Extra copies of the main model placed on the circle.
const EXTRA_INSTANCES: usize = 5;
/// Simulated seconds per frame.
const FRAME_TIME: f32 = 1.0 / 24.0;

struct RenderArgs {
    config: Option<PathBuf>,
    frames: Option<u32>,
    out: Option<PathBuf>,
    size: Option<(u32, u32)>,
    gpu: bool,
    models: Vec<PathBuf>,
}

fn main() {
    let args: Vec<String> = env::args().collect();

    // Parse global flags
    let mut level = "info";
    let mut filtered_args: Vec<&str> = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "-v" | "--verbose" => level = "debug",
            "-vv" | "--trace" => level = "trace",
            "-q" | "--quiet" => level = "error",
            _ => filtered_args.push(arg),
        }
    }
    let _guard = init_tracing(level);

    if filtered_args.is_empty() {
        print_help();
        return;
    }

    let result = match filtered_args[0] {
        "render" | "r" => parse_render(&filtered_args[1..]).and_then(cmd_render),
        "info" | "i" => match filtered_args.get(1) {
            Some(path) => cmd_info(Path::new(path)),
            None => {
                eprintln!("Error: missing file argument");
                eprintln!("Usage: headless-rt info <model.obj>");
                std::process::exit(1);
            }
        },
        "version" | "-V" | "--version" => {
            print_version();
            Ok(())
        }
        "help" | "h" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_help();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Console logging filtered by `level` (`RUST_LOG` wins), plus a Chrome
/// trace file when `HEADLESS_RT_TRACE=1`.
fn init_tracing(level: &str) -> Option<tracing_chrome::FlushGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);

    if env::var("HEADLESS_RT_TRACE").ok().as_deref() == Some("1") {
        let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
            .file("trace.json")
            .build();
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .with(chrome_layer);
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            return None;
        }
        return Some(guard);
    }

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
    None
}

fn print_help() {
    println!("headless-rt - headless ray-tracing renderer");
    println!();
    println!("Usage: headless-rt [options] <command> [args]");
    println!();
    println!("Commands:");
    println!("  r, render [model.obj ...]   Render animated frames to PNG");
    println!("      --config <file.json>    Renderer config (default: user config dir)");
    println!("      --frames <n>            Number of frames");
    println!("      --size <w>x<h>          Initial output size");
    println!("      --out <dir>             Output directory");
    println!("      --gpu                   Trace with the wgpu compute kernel");
    println!("  i, info <model.obj>         Show mesh statistics");
    println!("  version                     Show version");
    println!("  h, help                     Show this help");
    println!();
    println!("Options:");
    println!("  -v, --verbose  Debug output");
    println!("  -vv, --trace   Trace output (very verbose)");
    println!("  -q, --quiet    Errors only");
    println!();
    println!("Environment:");
    println!("  RUST_LOG             Log filter, overrides -v/-q");
    println!("  HEADLESS_RT_TRACE=1  Write a Chrome trace to trace.json");
}

fn print_version() {
    println!("headless-rt {}", env!("CARGO_PKG_VERSION"));
    println!(
        "built {} ({})",
        option_env!("HEADLESS_RT_BUILD_STAMP").unwrap_or("unknown"),
        option_env!("HEADLESS_RT_BACKENDS").unwrap_or("software")
    );
}

fn parse_render(args: &[&str]) -> Result<RenderArgs> {
    let mut out = RenderArgs {
        config: None,
        frames: None,
        out: None,
        size: None,
        gpu: false,
        models: Vec::new(),
    };
    let mut it = args.iter();
    while let Some(&arg) = it.next() {
        match arg {
            "--config" | "-c" => out.config = Some(PathBuf::from(next_value(&mut it, arg)?)),
            "--frames" | "-n" => {
                let v = next_value(&mut it, arg)?;
                out.frames = Some(v.parse().with_context(|| format!("invalid frame count '{}'", v))?);
            }
            "--out" | "-o" => out.out = Some(PathBuf::from(next_value(&mut it, arg)?)),
            "--size" | "-s" => out.size = Some(parse_size(next_value(&mut it, arg)?)?),
            "--gpu" => out.gpu = true,
            flag if flag.starts_with('-') => bail!("unknown render option '{}'", flag),
            path => out.models.push(PathBuf::from(path)),
        }
    }
    Ok(out)
}

fn next_value<'a>(it: &mut std::slice::Iter<'_, &'a str>, flag: &str) -> Result<&'a str> {
    it.next().copied().with_context(|| format!("{} needs a value", flag))
}

fn parse_size(s: &str) -> Result<(u32, u32)> {
    let (w, h) = s.split_once('x').with_context(|| format!("size '{}' is not <w>x<h>", s))?;
    Ok((
        w.parse().with_context(|| format!("invalid width '{}'", w))?,
        h.parse().with_context(|| format!("invalid height '{}'", h))?,
    ))
}

fn cmd_render(args: RenderArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => RendererConfig::from_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => RendererConfig::load_or_default(),
    };
    if let Some(frames) = args.frames {
        config.frames = frames;
    }
    if let Some(dir) = args.out {
        config.output_dir = dir;
    }
    if let Some((w, h)) = args.size {
        config.width = w;
        config.height = h;
    }

    if args.gpu {
        #[cfg(feature = "gpu")]
        {
            let device = headless_rt::device::GpuDevice::new().context("failed to create GPU device")?;
            return run(Renderer::new(config, device)?, &args.models);
        }
        #[cfg(not(feature = "gpu"))]
        bail!("GPU tracing not available. Rebuild with: cargo build --features gpu");
    }

    run(
        Renderer::new(config, headless_rt::device::SoftwareDevice::new())?,
        &args.models,
    )
}

/// Build the demo scene: a waving floor, the main model (a cube unless OBJ
/// files are given) with extra copies on a spinning circle.
fn build_scene<B: RenderBackend>(renderer: &mut Renderer<B>, models: &[PathBuf]) -> Result<Animator> {
    let floor = renderer.load_model(
        &ModelSource::Procedural {
            primitive: Primitive::Plane {
                size: 2.0,
                subdivisions: 48,
            },
            material: Some(Material::with_diffuse([0.55, 0.6, 0.7])),
        },
        Mat4::from_translation(Vec3::new(0.0, -1.0, 0.0)) * Mat4::from_scale(Vec3::new(4.0, 1.0, 4.0)),
    )?;

    let sources: Vec<(ModelSource, Mat4)> = if models.is_empty() {
        vec![(
            ModelSource::Procedural {
                primitive: Primitive::Cube { size: 1.0 },
                material: Some(Material::with_diffuse([0.8, 0.35, 0.2])),
            },
            Mat4::IDENTITY,
        )]
    } else {
        models
            .iter()
            .map(|p| (ModelSource::obj_file(p), Mat4::IDENTITY))
            .collect()
    };
    let placed = renderer.load_scene(&sources)?;
    let Some(&main) = placed.first() else {
        bail!("none of the {} model(s) could be loaded", sources.len());
    };

    let main_model = renderer.model_of(main)?;
    let mut circle: Vec<InstanceId> = vec![main];
    for _ in 0..EXTRA_INSTANCES {
        circle.push(renderer.add_instance(main_model, Mat4::IDENTITY)?);
    }

    let floor_model = renderer.model_of(floor)?;
    let animator = Animator::new()
        .with_circle(renderer.registry(), &circle)?
        .with_wave(renderer.registry(), floor_model)?;
    Ok(animator)
}

fn run<B: RenderBackend>(mut renderer: Renderer<B>, models: &[PathBuf]) -> Result<()> {
    let animator = build_scene(&mut renderer, models)?;
    let mut worker = AnimationWorker::spawn(animator, renderer.edit_queue());
    let config = renderer.config().clone();
    let out_dir = config.output_dir.clone();
    tracing::info!(
        models = renderer.registry().model_count(),
        instances = renderer.registry().instance_count(),
        frames = config.frames,
        out = %out_dir.display(),
        "rendering"
    );

    let mut resizes = 0;
    for frame in 0..config.frames {
        if frame > 0 && config.resize_every > 0 && frame % config.resize_every == 0 {
            resizes += 1;
            let (w, h) = config.scaled_size(resizes);
            renderer.resize(w, h)?;
        }

        worker.request(frame as f32 * FRAME_TIME, frame as u64);
        if worker.wait().is_none() {
            bail!("animation worker exited");
        }

        let report = renderer.render().with_context(|| format!("frame {} failed", frame))?;
        let path = out_dir.join(format!("frame_{:04}.png", frame));
        renderer
            .save_frame(&path)
            .with_context(|| format!("failed to save {}", path.display()))?;

        let (w, h) = renderer.size();
        tracing::info!(frame, width = w, height = h, submissions = report.submissions, "frame rendered");
        tracing::debug!(steps = ?report.steps);
    }
    worker.stop();
    Ok(())
}

fn cmd_info(path: &Path) -> Result<()> {
    let config = RendererConfig::load_or_default();
    let loader_config: LoaderConfig = config.loader();
    let mesh = loader::load(&ModelSource::obj_file(path), &loader_config)
        .with_context(|| format!("failed to load {}", path.display()))?;

    let bounds = mesh.bounds();
    println!("Model: {}", mesh.name());
    println!("  Vertices:  {}", mesh.vertex_count());
    println!("  Triangles: {}", mesh.triangle_count());
    println!(
        "  Normals:   {}",
        if mesh.has_generated_normals() { "generated (flat)" } else { "from source" }
    );
    println!("  Bounds:    {:?} .. {:?}", bounds.min.to_array(), bounds.max.to_array());
    println!("  Materials: {}", mesh.materials().len());
    for (i, m) in mesh.materials().iter().enumerate() {
        let used = mesh.material_indices().iter().filter(|&&mi| mi as usize == i).count();
        println!("    [{}] diffuse {:?}, {} triangles", i, m.diffuse, used);
    }
    if !mesh.textures().is_empty() {
        println!("  Textures:");
        for t in mesh.textures() {
            println!("    {}", t);
        }
    }
    Ok(())
}
