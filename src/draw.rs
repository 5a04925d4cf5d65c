use crate::{error::Error, pose::PersonDetection, video::Frame};
use tracing::warn;

/// Whether a requested preview window can actually be shown.
pub(crate) fn preview_enabled(requested: bool) -> bool {
    if requested && !cfg!(feature = "gui") {
        warn!(message = "preview needs the gui feature; continuing without it");
        return false;
    }
    requested
}

/// Overlay joints and skeleton edges above `threshold` on `frame` and show it.
#[cfg(feature = "gui")]
pub(crate) fn draw_poses(
    frame: &mut Frame,
    poses: &[PersonDetection],
    threshold: f32,
) -> Result<(), Error> {
    use crate::pose::{constants::KEYPOINT_EDGES, NUM_KEYPOINTS};
    use num_traits::ToPrimitive;
    use opencv::{
        core::{Mat, Mat_AUTO_STEP, Point2i, Scalar, CV_8UC3},
        imgproc::{FONT_HERSHEY_SIMPLEX, LINE_8, LINE_AA},
    };
    use std::convert::TryFrom;

    const GREEN: (f64, f64, f64) = (0.0, 255.0, 0.0);
    const YELLOW: (f64, f64, f64) = (0.0, 255.0, 255.0);
    const WHITE: (f64, f64, f64) = (255.0, 255.0, 255.0);

    let rows = i32::try_from(frame.height).map_err(Error::ConvertDimToI32)?;
    let cols = i32::try_from(frame.width).map_err(Error::ConvertDimToI32)?;
    let width = frame.width.to_f32().ok_or(Error::ConvertToF32)?;
    let height = frame.height.to_f32().ok_or(Error::ConvertToF32)?;

    // the Mat borrows the frame's bytes, so drawing lands in the frame itself
    let mut mat = unsafe {
        Mat::new_rows_cols_with_data(
            rows,
            cols,
            CV_8UC3,
            frame.data.as_mut_ptr().cast(),
            Mat_AUTO_STEP,
        )
    }
    .map_err(Error::WrapFrame)?;

    for pose in poses {
        let mut xys = [None; NUM_KEYPOINTS];

        for keypoint in pose.keypoints.iter().filter(|kp| kp.score >= threshold) {
            let point = Point2i::new(
                (keypoint.x * width).round().to_i32().ok_or(Error::ConvertToI32)?,
                (keypoint.y * height).round().to_i32().ok_or(Error::ConvertToI32)?,
            );
            xys[keypoint.kind.idx()?] = Some(point);
            opencv::imgproc::circle(
                &mut mat,
                point,
                6,
                Scalar::from(GREEN),
                1,      // thickness
                LINE_8, // line_type
                0,      // shift
            )
            .map_err(Error::DrawCircle)?;
        }

        for &(a, b) in KEYPOINT_EDGES.iter() {
            if let (Some(a_point), Some(b_point)) = (xys[a.idx()?], xys[b.idx()?]) {
                opencv::imgproc::line(
                    &mut mat,
                    a_point,
                    b_point,
                    Scalar::from(YELLOW),
                    2,      // thickness
                    LINE_8, // line_type
                    0,      // shift
                )
                .map_err(Error::DrawLine)?;
            }
        }
    }

    opencv::imgproc::put_text(
        &mut mat,
        &format!("frame {} people {}", frame.index, poses.len()),
        Point2i::new(0, 15),
        FONT_HERSHEY_SIMPLEX,
        0.5,
        Scalar::from(WHITE),
        1,       // thickness
        LINE_AA, // line_type
        false,   // bottom_left_origin
    )
    .map_err(Error::PutText)?;
    opencv::highgui::imshow("poses", &mat).map_err(Error::ImShow)
}

#[cfg(not(feature = "gui"))]
pub(crate) fn draw_poses(
    _frame: &mut Frame,
    _poses: &[PersonDetection],
    _threshold: f32,
) -> Result<(), Error> {
    Ok(())
}

/// `false` once `q` has been pressed in the preview window.
#[cfg(feature = "gui")]
pub(crate) fn wait_q(delay_ms: i32) -> Result<bool, Error> {
    const Q_KEY: u8 = b'q';
    Ok(opencv::highgui::wait_key(delay_ms).map_err(Error::WaitKey)? != i32::from(Q_KEY))
}

#[cfg(not(feature = "gui"))]
pub(crate) fn wait_q(_delay_ms: i32) -> Result<bool, Error> {
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_follows_the_gui_feature() {
        assert!(!preview_enabled(false));
        assert_eq!(preview_enabled(true), cfg!(feature = "gui"));
    }
}
