use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tracing::{info, warn};

use common::error::InferError;
use common::{AggregatedPrediction, ConfidenceBand};
use image_recognizer::{load_frame, Recognizer};
use inference_engine::{Frame, PrototypeModelSource};
use model_manager::FakeRemoteRegistry;
use recognition_core::{FrameOutcome, RecognitionEvent, RecognitionPipeline};
use settings::{BackendKind, RecognitionSettings, SettingsManager};

#[derive(Parser)]
#[command(name = "image-recognizer", version, about = "Classify images against an on-device model")]
struct Cli {
    /// Settings file (TOML, JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Serve the remote labeler from an in-process registry with these
    /// canned labels, e.g. `Sparrow=0.9,Robin=0.4`
    #[arg(long, global = true)]
    demo_labels: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify still images one at a time
    Classify {
        /// Images to classify
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Feed a directory of images to a live session, in name order
    Stream {
        /// Directory holding the frames
        dir: PathBuf,
        /// Delay between frames in milliseconds
        #[arg(long, default_value_t = 100)]
        delay_ms: u64,
    },
    /// Build a prototype model source from labelled example images
    BuildModel {
        /// Model name
        #[arg(long)]
        name: String,
        /// Histogram bins per channel
        #[arg(long, default_value_t = 4)]
        bins: usize,
        /// Output path; a `.pmc` extension writes the compiled form
        #[arg(long)]
        output: PathBuf,
        /// Examples as `label=directory`
        #[arg(required = true)]
        examples: Vec<String>,
    },
    /// Compile a prototype model source
    Compile {
        /// Source artifact
        source: PathBuf,
        /// Compiled artifact to write
        output: PathBuf,
    },
    /// Drop the cached artifacts of the configured model
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = SettingsManager::load(cli.config.as_deref()).context("failed to load settings")?;
    logging::init_logging(&settings.logging)?;

    match cli.command {
        Commands::Classify { images } => {
            let recognizer = build_recognizer(settings, cli.demo_labels.as_deref()).await?;
            recognizer.load().await.context("failed to load model")?;

            for path in images {
                let results = recognizer.classify_path(&path).await?;
                println!("{}", path.display());
                print_results(&results);
            }
        }
        Commands::Stream { dir, delay_ms } => {
            let recognizer = build_recognizer(settings, cli.demo_labels.as_deref()).await?;
            recognizer.load().await.context("failed to load model")?;
            stream(&recognizer, &dir, Duration::from_millis(delay_ms)).await?;
        }
        Commands::BuildModel {
            name,
            bins,
            output,
            examples,
        } => build_model(&name, bins, &output, &examples)?,
        Commands::Compile { source, output } => {
            let bytes = tokio::fs::read(&source)
                .await
                .with_context(|| format!("failed to read {:?}", source))?;
            let compiled = PrototypeModelSource::from_json(&bytes)?.compile()?;
            tokio::fs::write(&output, compiled)
                .await
                .with_context(|| format!("failed to write {:?}", output))?;
            println!("Compiled {} -> {}", source.display(), output.display());
        }
        Commands::Purge => {
            let recognizer = build_recognizer(settings, cli.demo_labels.as_deref()).await?;
            recognizer.invalidate(true).await?;
            println!("Purged cached artifacts of {}", recognizer.pipeline().model_id());
        }
    }

    Ok(())
}

async fn build_recognizer(settings: RecognitionSettings, demo_labels: Option<&str>) -> Result<Recognizer> {
    match demo_labels {
        Some(labels) => {
            if settings.model.backend != BackendKind::RemoteLabeler {
                warn!("--demo-labels only applies to the remote labeler backend");
            }
            let registry = Arc::new(FakeRemoteRegistry::new());
            registry.publish(&settings.model.identifier, parse_labels(labels)?);
            registry.set_complete_on_request(true);
            Recognizer::with_registry(settings, registry).await
        }
        None => Recognizer::new(settings).await,
    }
}

fn parse_labels(list: &str) -> Result<Vec<(String, f32)>> {
    list.split(',')
        .filter(|item| !item.trim().is_empty())
        .map(|item| {
            let (label, confidence) = item
                .split_once('=')
                .with_context(|| format!("expected `label=confidence`, got {:?}", item))?;
            let confidence: f32 = confidence
                .trim()
                .parse()
                .with_context(|| format!("invalid confidence in {:?}", item))?;
            Ok((label.trim().to_string(), confidence))
        })
        .collect()
}

async fn stream(recognizer: &Recognizer, dir: &Path, delay: Duration) -> Result<()> {
    let frames = image_files(dir)?;
    if frames.is_empty() {
        bail!("no images found in {:?}", dir);
    }

    let pipeline = recognizer.pipeline();
    let mut events = pipeline.subscribe();
    let (done_tx, mut done_rx) = oneshot::channel::<()>();

    // Events are queued before on_frame returns, so draining before `done`
    // prints everything the session produced
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(RecognitionEvent::ResultsChanged(results)) => print_results(&results),
                    Ok(RecognitionEvent::AutoStopRequested) => println!("Confident match; stopping"),
                    Ok(RecognitionEvent::LoadStateChanged(state)) => info!("Model {}", state),
                    Err(RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
                    Err(RecvError::Closed) => break,
                },
                _ = &mut done_rx => break,
            }
        }
    });

    pipeline.start_session();
    let fed = feed_frames(&pipeline, &frames, delay).await;
    pipeline.stop_session();

    let _ = done_tx.send(());
    printer.await.context("event printer failed")?;
    fed?;

    println!("Final results");
    print_results(&pipeline.snapshot());
    Ok(())
}

/// Feeds frames to the running session until it stops or the frames run out
///
/// A frame that cannot be decoded or classified is dropped; only a model that
/// is not ready ends the stream with an error.
async fn feed_frames(pipeline: &RecognitionPipeline, frames: &[PathBuf], delay: Duration) -> Result<Vec<FrameOutcome>> {
    let mut outcomes = Vec::with_capacity(frames.len());
    let mut interval = tokio::time::interval(delay.max(Duration::from_millis(1)));

    for path in frames {
        interval.tick().await;
        let frame = match load_frame(path) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Skipping {}: {:#}", path.display(), e);
                continue;
            }
        };
        match pipeline.on_frame(&frame).await {
            Ok(FrameOutcome::NotRunning) => break,
            Ok(outcome) => {
                info!("{}: {:?}", path.display(), outcome);
                outcomes.push(outcome);
            }
            Err(InferError::ModelNotReady) => bail!("model {} is not ready", pipeline.model_id()),
            Err(e) => warn!("Dropping result for {}: {}", path.display(), e),
        }
    }

    Ok(outcomes)
}

fn build_model(name: &str, bins: usize, output: &Path, examples: &[String]) -> Result<()> {
    let mut frames: Vec<(String, Frame)> = Vec::new();

    for example in examples {
        let (label, dir) = example
            .split_once('=')
            .with_context(|| format!("expected `label=directory`, got {:?}", example))?;
        for path in image_files(Path::new(dir))? {
            frames.push((label.to_string(), load_frame(&path)?));
        }
    }

    let source = PrototypeModelSource::from_examples(
        name,
        bins,
        frames.iter().map(|(label, frame)| (label.as_str(), frame)),
    );
    source.validate()?;

    let bytes = if output.extension().and_then(|e| e.to_str()) == Some("pmc") {
        source.compile()?
    } else {
        source.to_json()?
    };
    std::fs::write(output, bytes).with_context(|| format!("failed to write {:?}", output))?;

    println!(
        "Built {} from {} examples ({} labels) -> {}",
        name,
        frames.len(),
        source.labels.len(),
        output.display()
    );
    Ok(())
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
                Some("png" | "jpg" | "jpeg" | "bmp" | "gif")
            )
        })
        .collect();
    files.sort();
    Ok(files)
}

fn print_results(results: &[AggregatedPrediction]) {
    if results.is_empty() {
        println!("  (no labels)");
    }
    for prediction in results {
        println!(
            "  {:<24} {:>5.1}%  {}",
            prediction.label,
            prediction.confidence * 100.0,
            ConfidenceBand::from_confidence(prediction.confidence)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use image::{Rgb, RgbImage};

    async fn recognizer(dir: &Path) -> Recognizer {
        let red = Frame::solid(4, 4, [255, 0, 0]);
        let blue = Frame::solid(4, 4, [0, 0, 255]);
        let model = dir.join("colors.json");
        let source = PrototypeModelSource::from_examples("colors", 4, [("red", &red), ("blue", &blue)]);
        std::fs::write(&model, source.to_json().unwrap()).unwrap();

        let mut settings = RecognitionSettings::default();
        settings.model.identifier = "colors".to_string();
        settings.model.bundled_path = Some(model);
        settings.storage.cache_dir = dir.join("cache");
        settings.cadence.frame_interval_secs = 0.0;
        settings.aggregation.auto_stop_threshold = 1.0;

        Recognizer::new(settings).await.unwrap()
    }

    fn frames(dir: &Path) -> Vec<PathBuf> {
        let frames = dir.join("frames");
        std::fs::create_dir(&frames).unwrap();
        std::fs::write(frames.join("a_broken.png"), b"not an image").unwrap();
        RgbImage::from_pixel(4, 4, Rgb([10, 10, 240])).save(frames.join("b_blue.png")).unwrap();
        image_files(&frames).unwrap()
    }

    #[tokio::test]
    async fn test_undecodable_frame_does_not_end_stream() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = recognizer(dir.path()).await;
        recognizer.load().await.unwrap();

        let pipeline = recognizer.pipeline();
        pipeline.start_session();
        let outcomes = feed_frames(&pipeline, &frames(dir.path()), Duration::from_millis(1))
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], FrameOutcome::Processed { .. }));
        assert_eq!(pipeline.snapshot()[0].label, "blue");
    }

    #[tokio::test]
    async fn test_unloaded_model_ends_stream() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = recognizer(dir.path()).await;

        let pipeline = recognizer.pipeline();
        pipeline.start_session();
        assert!(feed_frames(&pipeline, &frames(dir.path()), Duration::from_millis(1))
            .await
            .is_err());
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels("Sparrow=0.9, Robin = 0.4,").unwrap();
        assert_eq!(labels, vec![("Sparrow".to_string(), 0.9), ("Robin".to_string(), 0.4)]);
        assert!(parse_labels("Sparrow").is_err());
        assert!(parse_labels("Sparrow=high").is_err());
    }
}
