use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    convert::TryFrom,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;

mod checkpoint;
mod collect;
mod dataset;
mod detector;
mod device;
mod draw;
mod error;
mod filter;
mod infer;
mod loss;
mod model;
mod optim;
mod pose;
mod store;
mod train;
mod video;

#[derive(structopt::StructOpt)]
struct CollectOpt {
    /// Source video to read frames from.
    #[structopt(long)]
    video: PathBuf,

    /// JSON-lines pose detections for the video, one line per frame.
    #[structopt(long)]
    detections: PathBuf,

    /// Corpus root; samples land in a subdirectory named after the label.
    #[structopt(long)]
    corpus: PathBuf,

    /// Class directory to file samples under, e.g. `1` or `walk`.
    #[structopt(long)]
    label: store::Label,

    /// Re-encoded video path. Defaults to `<stem>.processed.<format>`
    /// beside the source.
    #[structopt(short, long)]
    output: Option<PathBuf>,

    /// Person detection score threshold.
    #[structopt(long, default_value = filter::DEFAULT_DETECTION_THRESHOLD)]
    detection_threshold: f32,

    /// Per-joint score threshold.
    #[structopt(long, default_value = filter::DEFAULT_JOINT_THRESHOLD)]
    joint_threshold: f32,

    /// Draw skeletons and show a preview window; `q` stops. Needs the `gui`
    /// feature.
    #[structopt(long)]
    preview: bool,

    #[structopt(short = "-W", long, default_value = collect::DEFAULT_WAIT_KEY_MS)]
    wait_key_ms: i32,
}

#[derive(structopt::StructOpt)]
struct TrainOpt {
    /// Corpus root with one subdirectory per class.
    #[structopt(long)]
    corpus: PathBuf,

    /// Where the best model is kept.
    #[structopt(long, default_value = checkpoint::DEFAULT_CHECKPOINT)]
    checkpoint: PathBuf,

    #[structopt(short, long, default_value = train::DEFAULT_EPOCHS)]
    epochs: usize,

    #[structopt(short, long, default_value = dataset::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    #[structopt(long, default_value = optim::DEFAULT_LEARNING_RATE)]
    learning_rate: f32,

    #[structopt(long, default_value = dataset::DEFAULT_TEST_FRACTION)]
    test_fraction: f64,

    /// Seeds the split, weight initialisation, and batch shuffling.
    #[structopt(long, default_value = dataset::DEFAULT_SEED)]
    seed: u64,

    #[structopt(long, default_value = model::DEFAULT_HIDDEN_SIZE)]
    hidden_size: usize,

    #[structopt(long, default_value = model::DEFAULT_NUM_CLASSES)]
    num_classes: usize,

    /// Every coordinate is divided by this before it reaches the model.
    #[structopt(long, default_value = dataset::DEFAULT_FEATURE_SCALE)]
    feature_scale: f32,

    /// Leading train samples dropped after the split.
    #[structopt(long, default_value = dataset::DEFAULT_TRIM_TRAIN)]
    trim_train: usize,

    /// Leading test samples dropped after the split.
    #[structopt(long, default_value = dataset::DEFAULT_TRIM_TEST)]
    trim_test: usize,

    /// Trim each partition to a multiple of the batch size; overrides the
    /// fixed trim counts.
    #[structopt(long)]
    align_to_batch: bool,

    #[structopt(short, long, default_value = device::DEFAULT_DEVICE)]
    device: device::Device,

    /// Write per-epoch loss and accuracy as JSON.
    #[structopt(long)]
    history: Option<PathBuf>,

    /// Stop on the first non-finite loss instead of logging it.
    #[structopt(long)]
    halt_on_divergence: bool,
}

#[derive(structopt::StructOpt)]
struct PredictOpt {
    #[structopt(long, default_value = checkpoint::DEFAULT_CHECKPOINT)]
    checkpoint: PathBuf,

    /// Classify every gated person in a JSON-lines detections file.
    #[structopt(long, required_unless = "samples")]
    detections: Option<PathBuf>,

    #[structopt(long, default_value = filter::DEFAULT_DETECTION_THRESHOLD)]
    detection_threshold: f32,

    #[structopt(long, default_value = filter::DEFAULT_JOINT_THRESHOLD)]
    joint_threshold: f32,

    /// Stored `.npy` samples to classify.
    samples: Vec<PathBuf>,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Harvest gated pose samples from a video into the corpus.
    Collect(CollectOpt),

    /// Train a classifier on the corpus, keeping the best checkpoint.
    Train(TrainOpt),

    /// Classify samples with a trained checkpoint.
    Predict(PredictOpt),
}

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long, default_value = "info", env = "RUST_LOG")]
    log_level: tracing_subscriber::filter::EnvFilter,

    #[structopt(short, long)]
    show_progress: bool,

    #[structopt(subcommand)]
    command: Command,
}

fn spinner(show: bool) -> Option<ProgressBar> {
    if show {
        Some(
            ProgressBar::new_spinner().with_style(
                ProgressStyle::default_spinner()
                    .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
                    .template("{prefix:.bold.dim} {spinner} {wide_msg}"),
            ),
        )
    } else {
        None
    }
}

fn run_collect(opt: CollectOpt, running: &AtomicBool, show_progress: bool) -> Result<()> {
    let info = video::probe(&opt.video).context("failed probing source video")?;
    let mut reader =
        video::FrameReader::open(&opt.video, &info).context("failed starting decoder")?;
    let mut detector = detector::RecordedDetections::open(&opt.detections)
        .context("failed loading detections")?;
    let mut store = store::FeatureStore::open(&opt.corpus).context("failed opening corpus")?;
    let filter = filter::KeypointFilter::new(opt.detection_threshold, opt.joint_threshold);

    let output = opt
        .output
        .clone()
        .unwrap_or_else(|| info.processed_path(&opt.video));
    let mut writer = video::Writer::new(output, &info).context("failed starting encoder")?;
    info!(
        message = "collecting samples",
        label = %opt.label,
        corpus = %store.root().display(),
        output = %writer.output().display(),
        frame_rate_hz = ?info.frame_rate_hz(),
        frames_with_detections = detector.len()
    );

    let progress = spinner(show_progress);
    let summary = collect::collect(
        &mut reader,
        &mut detector,
        &filter,
        &mut store,
        &opt.label,
        collect::Outputs {
            sink: Some(&mut writer),
            preview: draw::preview_enabled(opt.preview),
            wait_key_ms: opt.wait_key_ms,
            progress: progress.as_ref(),
        },
        running,
    )
    .context("failed collecting samples")?;
    writer.close().context("failed finalizing output video")?;

    if let Some(progress) = progress {
        progress.finish_and_clear();
    }
    info!(
        message = "collection finished",
        frames = summary.frames,
        samples = summary.samples,
        detection_failures = summary.detection_failures
    );
    Ok(())
}

fn run_train(opt: TrainOpt, running: &AtomicBool, show_progress: bool) -> Result<()> {
    info!(message = "compute device", device = %opt.device);

    let store::LoadedCorpus { corpus, skipped } =
        store::load_corpus(&opt.corpus).context("failed loading corpus")?;
    if skipped > 0 {
        warn!(message = "skipped unreadable samples", skipped);
    }
    if corpus.is_empty() {
        return Err(anyhow!("no samples under {:?}", opt.corpus));
    }

    let encoder = dataset::LabelEncoder::fit(&corpus);
    if encoder.len() > opt.num_classes {
        return Err(anyhow!(
            "corpus has {} labels but the model has {} classes",
            encoder.len(),
            opt.num_classes
        ));
    }

    let data = dataset::Dataset::from_corpus(&corpus, &encoder, opt.feature_scale)?;
    let trim = if opt.align_to_batch {
        dataset::Trim::AlignTo(opt.batch_size)
    } else {
        dataset::Trim::Fixed {
            train: opt.trim_train,
            test: opt.trim_test,
        }
    };
    let split = data
        .split(opt.test_fraction, opt.seed, trim)
        .context("failed splitting corpus")?;
    info!(
        message = "split corpus",
        samples = data.len(),
        classes = encoder.len(),
        train = split.train.len(),
        test = split.test.len(),
        trimmed_train = split.trimmed.0,
        trimmed_test = split.trimmed.1
    );

    let train_loader = dataset::DataLoader::new(split.train, opt.batch_size, true)?;
    let test_loader = dataset::DataLoader::new(split.test, opt.batch_size, true)?;

    let mut rng = StdRng::seed_from_u64(opt.seed);
    let config = model::ModelConfig {
        input_size: filter::FEATURE_WIDTH,
        hidden_size: opt.hidden_size,
        num_classes: opt.num_classes,
    };
    let classifier = model::LstmClassifier::new(config, &mut rng)?;
    let mut training = train::TrainingLoop::new(
        classifier,
        loss::CrossEntropyLoss,
        optim::Adam::new(opt.learning_rate),
    )
    .halt_on_divergence(opt.halt_on_divergence);
    let mut sink =
        checkpoint::FileCheckpoint::new(&opt.checkpoint, opt.feature_scale, encoder.labels());

    let progress = if show_progress {
        Some(
            ProgressBar::new(u64::try_from(opt.epochs)?).with_style(
                ProgressStyle::default_bar()
                    .template("{prefix:.bold.dim} [{bar:40}] {pos}/{len} {wide_msg}"),
            ),
        )
    } else {
        None
    };

    let history = training
        .run(
            opt.epochs,
            &train_loader,
            &test_loader,
            &mut sink,
            &mut rng,
            running,
            progress.as_ref(),
        )
        .context("training failed")?;

    if let Some(progress) = progress {
        progress.finish();
    }
    if history.is_empty() {
        warn!(message = "no epochs completed", checkpoint = %sink.path().display());
    }
    if let Some(path) = opt.history.as_ref() {
        history
            .write_json(path)
            .context("failed writing training history")?;
    }

    info!(
        message = "training finished",
        epochs = history.len(),
        best_accuracy = training.best_accuracy().get(),
        checkpoint = %sink.path().display()
    );
    Ok(())
}

fn print_prediction(runner: &infer::InferenceRunner, source: &str, class: usize) {
    match runner.label_of(class) {
        Some(label) => println!("{}\t{}\t{}", source, class, label),
        None => println!("{}\t{}", source, class),
    }
}

fn run_predict(opt: PredictOpt) -> Result<()> {
    let runner =
        infer::InferenceRunner::load(&opt.checkpoint).context("failed loading checkpoint")?;

    if let Some(path) = opt.detections.as_ref() {
        let detections =
            detector::RecordedDetections::open(path).context("failed loading detections")?;
        let filter = filter::KeypointFilter::new(opt.detection_threshold, opt.joint_threshold);

        for frame in detections.frame_indices() {
            let features = filter.filter(detections.people(frame));
            for (person, class) in runner.predict_batch(&features)?.into_iter().enumerate() {
                print_prediction(&runner, &format!("frame {} person {}", frame, person), class);
            }
        }
    }

    for path in &opt.samples {
        let feature = store::read_sample(path)
            .with_context(|| format!("failed reading sample {:?}", path))?;
        let class = runner.predict(&feature)?;
        print_prediction(&runner, &path.display().to_string(), class);
    }

    Ok(())
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(opt.log_level),
    )?;

    let running = Arc::new(AtomicBool::new(true));
    let running_ctrl_c = running.clone();

    ctrlc::set_handler(move || {
        running_ctrl_c.store(false, Ordering::SeqCst);
    })
    .context("failed setting Ctrl-C handler")?;

    match opt.command {
        Command::Collect(collect_opt) => run_collect(collect_opt, &running, opt.show_progress),
        Command::Train(train_opt) => run_train(train_opt, &running, opt.show_progress),
        Command::Predict(predict_opt) => run_predict(predict_opt),
    }
}
