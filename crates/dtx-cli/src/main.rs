use anyhow::{Context, Result};
use clap::Parser;
use dtx::{DtxConfig, GeometryRecord, MeshParams, SceneModel, StreamCapacityPlanner};
use log::{info, warn};
use rayon::prelude::*;
use serde::Deserialize;
use std::{
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
    time::Instant,
};
use walkdir::WalkDir;

#[derive(Parser, Debug, Clone)]
#[command(name = "dtxpack", version)]
struct Args {
    /// Directory searched recursively for scene `.json` files.
    #[arg(long, default_value = "scenes")]
    input_dir: String,

    #[arg(long, default_value = "packed")]
    output_dir: String,

    /// JSON file deserialised into the engine configuration.
    #[arg(long, env = "DTX_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `capacity.max_vertices`.
    #[arg(long, env = "DTX_MAX_VERTICES")]
    max_vertices: Option<u32>,

    /// Overrides `capacity.max_meshes`.
    #[arg(long, env = "DTX_MAX_MESHES")]
    max_meshes: Option<u32>,

    /// Overrides `rtc_cell_size`.
    #[arg(long)]
    rtc_cell_size: Option<f64>,

    /// Deflate container bodies.
    #[arg(long, default_value_t = true)]
    deflate: bool,

    /// Only write the stream manifest.
    #[arg(long, default_value_t = false)]
    manifest_only: bool,

    #[arg(long, default_value_t = false)]
    overwrite: bool,
}

/// On-disk scene description.
#[derive(Debug, Deserialize)]
struct SceneFile {
    id: Option<String>,
    geometries: Vec<GeometryRecord>,
    meshes: Vec<MeshParams>,
}

fn load_config(args: &Args) -> Result<DtxConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("open config {}", path.display()))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("parse config {}", path.display()))?
        }
        None => DtxConfig::default(),
    };

    if let Some(v) = args.max_vertices {
        config.capacity.max_vertices = v;
    }
    if let Some(m) = args.max_meshes {
        config.capacity.max_meshes = m;
    }
    if let Some(c) = args.rtc_cell_size {
        config.rtc_cell_size = c;
    }
    Ok(config)
}

fn find_scenes(dir: &str) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|x| x.eq_ignore_ascii_case("json")))
        .collect();
    out.sort();
    out
}

fn process_one_scene(path: &Path, args: &Args, config: &DtxConfig) -> Result<()> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .context("scene file name is not UTF-8")?;
    let out_dir = Path::new(&args.output_dir);
    let container = out_dir.join(format!("{stem}.dtxb"));
    let manifest_path = out_dir.join(format!("{stem}.manifest.json"));

    if !args.overwrite && manifest_path.exists() && (args.manifest_only || container.exists()) {
        info!("{stem}: up to date, skipping");
        return Ok(());
    }

    let t0 = Instant::now();
    let scene: SceneFile = serde_json::from_reader(BufReader::new(File::open(path)?))
        .with_context(|| format!("parse {}", path.display()))?;
    let model_id = scene.id.unwrap_or_else(|| stem.to_owned());

    let mut model = SceneModel::new(model_id.clone(), config.clone());
    model
        .create_geometries(&scene.geometries)
        .context("compress geometries")?;

    let manifest = StreamCapacityPlanner::plan(config, &model_id, &scene.meshes, |id| {
        model.geometry(id).map(|g| g.as_ref())
    })
    .context("plan layers")?;
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;

    if !args.manifest_only {
        for mesh in &scene.meshes {
            model
                .create_mesh(mesh)
                .with_context(|| format!("place mesh `{}`", mesh.id))?;
        }
        dtx::persist::save(&model, &container, args.deflate)
            .with_context(|| format!("write {}", container.display()))?;
    }

    info!(
        "{stem}: {} geometries, {} meshes, {} layer(s), {} vertices in {:.2?}",
        scene.geometries.len(),
        manifest.num_meshes(),
        manifest.layers.len(),
        manifest.num_vertices(),
        t0.elapsed()
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;
    fs::create_dir_all(&args.output_dir)?;

    let scenes = find_scenes(&args.input_dir);
    info!("Processing {} scene(s)...", scenes.len());

    scenes.par_iter().for_each(|path| {
        if let Err(err) = process_one_scene(path, &args, &config) {
            warn!("Error processing {}: {:#}", path.display(), err);
        }
    });

    Ok(())
}
