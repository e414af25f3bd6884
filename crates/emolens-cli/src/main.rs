mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use emolens_core::gallery;
use emolens_core::{
    AnalysisResult, Analyzer, EmotionDistribution, EmotionScorer, FaceLocator, FaceRegion,
    IdentityMatcher, NoiseLevel, OnnxEmotionClassifier, ScrfdDetector, Session,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "emolens", about = "Face identity and emotion analysis for still images")]
struct Cli {
    /// TOML file overriding EMOLENS_* settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every image under the gallery directory
    Images {
        /// Directory to list (default: the configured gallery)
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Apply effects to an image and save the displayed result
    Process {
        image: PathBuf,
        /// Effect to apply, in order: pixelate[=N], noise[=SIGMA], noise-level=L, restore
        #[arg(short = 'e', long = "effect", value_parser = parse_op)]
        ops: Vec<Op>,
        /// Output file (.jpg, .jpeg or .png)
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Identify the person and score emotions
    Analyze {
        image: PathBuf,
        /// Effects applied before analysis
        #[arg(short = 'e', long = "effect", value_parser = parse_op)]
        ops: Vec<Op>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Locate faces in an image
    Detect {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Crop detected faces out of every gallery sample
    Clip {
        /// Output directory
        #[arg(long, default_value = "clipped")]
        out: PathBuf,
        /// Side length of the written faces (default: configured clip size)
        #[arg(long)]
        size: Option<u32>,
        /// Also score emotions on every written face
        #[arg(long)]
        emotions: bool,
    },
}

/// One step of an effect sequence; `None` takes the configured default.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Pixelate(Option<u32>),
    Noise(Option<NoiseLevel>),
    Restore,
}

fn parse_op(s: &str) -> Result<Op, String> {
    let (name, value) = match s.split_once('=') {
        Some((n, v)) => (n.trim(), Some(v.trim())),
        None => (s.trim(), None),
    };
    let number = |v: &str| v.parse::<f32>().map_err(|e| format!("invalid value '{v}' for {name}: {e}"));

    match (name, value) {
        ("pixelate", None) => Ok(Op::Pixelate(None)),
        ("pixelate", Some(v)) => v
            .parse()
            .map(|b| Op::Pixelate(Some(b)))
            .map_err(|e| format!("invalid block size '{v}': {e}")),
        ("noise", None) => Ok(Op::Noise(None)),
        ("noise", Some(v)) => Ok(Op::Noise(Some(NoiseLevel::Sigma(number(v)?)))),
        ("noise-level", Some(v)) => Ok(Op::Noise(Some(NoiseLevel::Level(number(v)?)))),
        ("restore", None) => Ok(Op::Restore),
        _ => Err(format!(
            "unknown effect '{s}' (expected pixelate[=N], noise[=SIGMA], noise-level=L or restore)"
        )),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    tracing::debug!(
        gallery = %config.gallery_dir.display(),
        models = %config.model_dir.display(),
        "configuration loaded"
    );

    match cli.command {
        Commands::Images { root } => {
            let root = root.unwrap_or_else(|| config.gallery_dir.clone());
            let images = gallery::list_images(&root)?;
            for path in &images {
                println!("{}", path.display());
            }
            tracing::info!(root = %root.display(), count = images.len(), "gallery listed");
        }
        Commands::Process { image, ops, output } => {
            let session = load_session(&image, &ops, &config)?;
            session.save_current(&output)?;
            println!("saved {}", output.display());
        }
        Commands::Analyze { image, ops, json } => {
            let session = load_session(&image, &ops, &config)?;
            let mut analyzer = build_analyzer(&config)?;
            let result = analyzer.analyze(&session)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_analysis(&result);
            }
        }
        Commands::Detect { image, json } => {
            let session = load_session(&image, &[], &config)?;
            let mut locator = build_locator(&config)?;
            let faces = locator
                .detect_in(&session)?
                .context("no image loaded")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&faces)?);
            } else {
                print_faces(&faces);
            }
        }
        Commands::Clip { out, size, emotions } => {
            let size = size.unwrap_or(config.clip_size);
            if size == 0 {
                bail!("clip size must be positive");
            }
            let mut locator = build_locator(&config)?;
            let mut scorer = if emotions { Some(build_scorer(&config)?) } else { None };
            let written = gallery::clip_faces(&config.gallery_dir, &out, &mut locator, size, scorer.as_mut())?;
            for clip in &written {
                println!("{}: {}", clip.person, clip.path.display());
                if let Some(dist) = &clip.emotions {
                    print_emotions(dist);
                }
            }
            println!("wrote {} face(s) to {}", written.len(), out.display());
        }
    }

    Ok(())
}

/// Load `image` and replay `ops` on it, as a viewer would between clicks.
fn load_session(image: &Path, ops: &[Op], config: &Config) -> Result<Session> {
    let mut session = Session::new();
    session.load(image)?;
    for op in ops {
        match *op {
            Op::Pixelate(block) => session.pixelate(block.unwrap_or(config.block_size))?,
            Op::Noise(level) => session.add_noise(level.unwrap_or(config.noise))?,
            Op::Restore => session.restore()?,
        };
    }
    Ok(session)
}

fn build_locator(config: &Config) -> Result<FaceLocator> {
    let detector = ScrfdDetector::load(&config.scrfd_model_path())?;
    Ok(FaceLocator::new(Box::new(detector), config.detection))
}

/// The analyzer crops faces before scoring, so the classifier runs without
/// a locator of its own.
fn build_scorer(config: &Config) -> Result<EmotionScorer> {
    let classifier = OnnxEmotionClassifier::load(&config.emotion_model_path())?;
    Ok(EmotionScorer::new(Box::new(classifier))
        .with_policy(config.failure_policy)
        .with_normalize(config.normalize))
}

fn build_analyzer(config: &Config) -> Result<Analyzer> {
    let scorer = build_scorer(config)?;
    let matcher = IdentityMatcher::new(config.gallery_dir.clone(), config.matcher.clone())?;

    Ok(Analyzer::new(build_locator(config)?, matcher, scorer).with_probe_region(config.probe_region))
}

fn print_faces(faces: &[FaceRegion]) {
    if faces.is_empty() {
        println!("no faces found");
        return;
    }
    for (i, f) in faces.iter().enumerate() {
        println!("face {i}: x={} y={} {}x{}", f.x, f.y, f.width, f.height);
    }
}

fn print_analysis(result: &AnalysisResult) {
    let id = &result.identity;
    println!("identity: {} (label {}, distance {:.2})", id.name, id.label, id.distance);
    print_faces(&result.faces);

    print_emotions(&result.emotions);
}

fn print_emotions(emotions: &EmotionDistribution) {
    if emotions.is_empty() {
        println!("emotions: unavailable");
        return;
    }
    let mut scores: Vec<_> = emotions.iter().collect();
    scores.sort_by(|a, b| b.1.total_cmp(&a.1));
    println!("emotions:");
    for (emotion, score) in scores {
        println!("  {:<9} {:>7.2}", emotion.name(), score);
    }
}
