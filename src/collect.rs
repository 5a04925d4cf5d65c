use crate::{
    detector::PoseDetector,
    draw,
    error::Error,
    filter::KeypointFilter,
    store::{FeatureStore, Label, LabeledSample},
    video::{FrameSink, FrameSource},
};
use indicatif::ProgressBar;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

pub(crate) const DEFAULT_WAIT_KEY_MS: &str = "1";

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct CollectSummary {
    pub(crate) frames: usize,
    pub(crate) samples: usize,
    pub(crate) detection_failures: usize,
}

/// Everything the frame loop writes to, besides the store.
pub(crate) struct Outputs<'a, W> {
    pub(crate) sink: Option<&'a mut W>,
    pub(crate) preview: bool,
    pub(crate) wait_key_ms: i32,
    pub(crate) progress: Option<&'a ProgressBar>,
}

/// Pull frames until the source ends or `running` is cleared, saving every
/// gated person under `label` and forwarding each frame to the sink.
///
/// A frame whose detection fails still reaches the sink, unannotated.
pub(crate) fn collect<S, D, W>(
    source: &mut S,
    detector: &mut D,
    filter: &KeypointFilter,
    store: &mut FeatureStore,
    label: &Label,
    mut outputs: Outputs<'_, W>,
    running: &AtomicBool,
) -> Result<CollectSummary, Error>
where
    S: FrameSource,
    D: PoseDetector,
    W: FrameSink,
{
    let mut summary = CollectSummary::default();

    while running.load(Ordering::SeqCst) {
        let mut frame = match source.next_frame()? {
            Some(frame) => frame,
            None => break,
        };
        summary.frames += 1;

        let people = match detector.detect(&frame) {
            Ok(people) => people,
            Err(e) => {
                warn!(message = "pose detection failed", frame = frame.index, error = %e);
                summary.detection_failures += 1;
                Vec::new()
            }
        };

        for feature in filter.filter(&people) {
            let sentinels = feature.sentinel_count();
            let path = store.append(&LabeledSample {
                feature,
                label: label.clone(),
            })?;
            trace!(
                message = "saved sample",
                frame = frame.index,
                sentinels,
                path = %path.display()
            );
            summary.samples += 1;
        }

        if outputs.preview {
            draw::draw_poses(&mut frame, &people, filter.joint_threshold)?;
        }
        if let Some(sink) = outputs.sink.as_mut() {
            sink.write(&frame)?;
        }
        if let Some(progress) = outputs.progress {
            progress.set_message(format!(
                "frame {} samples {}",
                frame.index, summary.samples
            ));
            progress.inc(1);
        }

        if outputs.preview && !draw::wait_q(outputs.wait_key_ms)? {
            debug!(message = "preview closed", frame = frame.index);
            break;
        }
    }

    Ok(summary)
}
