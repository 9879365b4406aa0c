#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use clap::Parser;

use candle::{DType, IndexOp, D};
use candle_video::checkpoint;
use candle_video::models::s3d;
use candle_video::pretrained::{load_labels, S3dWeights};
use candle_video_examples::video;

#[derive(Parser)]
struct Args {
    /// Local checkpoint, either safetensors or a pickled PyTorch state dict.
    #[arg(long)]
    model: Option<String>,

    /// Hub repository to fetch the checkpoint from when --model is not set.
    #[arg(long)]
    model_id: Option<String>,

    #[arg(long, default_value = "model.safetensors")]
    weights_file: String,

    /// Model config as json, for checkpoints that were not trained on Kinetics-400.
    #[arg(long)]
    config: Option<String>,

    /// Directory holding the decoded frames of the video.
    #[arg(long)]
    frames: String,

    #[arg(long, default_value_t = 64)]
    num_frames: usize,

    /// Category names, one per line.
    #[arg(long)]
    labels: Option<String>,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

pub fn main() -> anyhow::Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };

    let device = candle_video_examples::device(args.cpu)?;
    let weights = S3dWeights::DEFAULT;

    let frames = video::list_frames(&args.frames)?;
    println!("found {} frames in {}", frames.len(), args.frames);
    let clip = video::load_clip(&frames, args.num_frames, &weights.transforms)?
        .unsqueeze(0)?
        .to_device(&device)?;
    println!("loaded clip {clip:?}");
    if let Err(err) = weights.check_input(clip.dims()) {
        println!("warning: {err}");
    }

    let model_file = match args.model {
        None => {
            let Some(model_id) = args.model_id else {
                anyhow::bail!("either --model or --model-id has to be set")
            };
            tracing::info!(model_id = %model_id, file = %args.weights_file, "fetching checkpoint");
            let api = hf_hub::api::sync::Api::new()?;
            let api = api.model(model_id);
            api.get(&args.weights_file)?
        }
        Some(model) => model.into(),
    };

    let start = std::time::Instant::now();
    let model = match args.config {
        None => checkpoint::s3d(
            &s3d::Config::kinetics400(),
            Some((&weights, model_file.as_path())),
            DType::F32,
            &device,
        )?,
        Some(config) => {
            let cfg: s3d::Config = serde_json::from_str(&std::fs::read_to_string(config)?)?;
            checkpoint::load_model(&cfg, &model_file, DType::F32, &device)?
        }
    };
    tracing::info!(
        path = %model_file.display(),
        elapsed = ?start.elapsed(),
        "model built"
    );
    println!("model built");
    let num_classes = model.config().num_classes;

    let labels = match args.labels {
        None => None,
        Some(labels) => Some(load_labels(labels, num_classes)?),
    };

    let start = std::time::Instant::now();
    let logits = model.forward(&clip)?;
    tracing::info!(elapsed = ?start.elapsed(), "forward pass done");
    let prs = candle_nn::ops::softmax(&logits, D::Minus1)?
        .i(0)?
        .to_vec1::<f32>()?;
    let mut prs = prs.iter().enumerate().collect::<Vec<_>>();
    prs.sort_by(|(_, p1), (_, p2)| p2.total_cmp(p1));
    for &(category_idx, pr) in prs.iter().take(5) {
        let category = match &labels {
            Some(labels) => labels[category_idx].clone(),
            None => format!("class {category_idx}"),
        };
        println!("{category:24}: {:.2}%", 100. * pr);
    }
    Ok(())
}
