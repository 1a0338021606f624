use anyhow::{Context, Result, bail};
use image::RgbImage;
use light_curtain::core_modules::contour_analyzer::Annotation;
use light_curtain::core_modules::vision_ops::Point;
use light_curtain::{Frame, Interlock, ProcessState, SafetyConfig, SafetyModule};
use opencv::{
    core::{self, Mat, Scalar, Vector},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use std::env;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // --- 1. Argument Parsing & Setup ---
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        println!("Usage: curtain_tester <input_video_path> <output_video_path> [config.toml]");
        return Ok(());
    }
    let input_path = &args[1];
    let output_path = &args[2];
    let config = match args.get(3) {
        Some(path) => SafetyConfig::load(Path::new(path))?,
        None => SafetyConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    // --- 2. Video I/O Initialization ---
    let mut cap = VideoCapture::from_file(input_path, videoio::CAP_ANY)?;
    if !cap.is_opened()? {
        bail!("error opening video file {input_path}");
    }

    let frame_width = cap.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
    let frame_height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
    let fps = cap.get(videoio::CAP_PROP_FPS)?;

    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
    let mut writer = VideoWriter::new(
        output_path,
        fourcc,
        fps,
        core::Size::new(frame_width, frame_height),
        true,
    )?;

    // --- 3. Safety Session ---
    let mut session = SafetyModule::new(&config, Interlock::new());

    // --- 4. Main Processing Loop ---
    let mut frame = Mat::default();
    let mut frame_index = 0u64;
    let mut unsafe_frames = 0u64;
    while cap.read(&mut frame)? {
        if frame.empty() {
            break;
        }
        frame_index += 1;

        // OpenCV hands out BGR; the session expects RGB.
        let pixels = to_rgb_image(&frame).with_context(|| format!("converting frame {frame_index}"))?;
        let report = match session.process_frame(Frame::new(pixels)) {
            Ok(report) => report,
            Err(err) => {
                warn!(frame_index, %err, "frame skipped");
                continue;
            }
        };
        if !report.is_safe {
            unsafe_frames += 1;
        }

        // --- 5. Visualization ---
        let mut output_frame = frame.clone();
        if let Some(annotation) = report.detection.as_ref().and_then(|d| d.annotation()) {
            draw_annotation(&mut output_frame, annotation)?;
        }
        draw_verdict(&mut output_frame, report.is_safe, report.state_after)?;

        writer.write(&output_frame)?;
    }

    info!(
        frames = frame_index,
        unsafe_frames,
        refreshes = session.refresh_count(),
        cached_backgrounds = session.cache_len(),
        "processing complete, output saved to {output_path}"
    );
    Ok(())
}

fn to_rgb_image(bgr: &Mat) -> Result<RgbImage> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(bgr, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
    let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
    RgbImage::from_raw(width, height, rgb.data_bytes()?.to_vec())
        .context("frame buffer does not match its dimensions")
}

fn to_cv_points(points: &[Point]) -> Vector<core::Point> {
    points.iter().map(|p| core::Point::new(p.x, p.y)).collect()
}

/// Draws the blob polygon, its hull and the centre of its bounding rectangle.
fn draw_annotation(frame: &mut Mat, annotation: &Annotation) -> Result<()> {
    let lime = Scalar::new(0.0, 255.0, 0.0, 0.0);
    let hull_color = Scalar::new(200.0, 125.0, 75.0, 0.0);

    let polygon: Vector<Vector<core::Point>> = Vector::from_iter([to_cv_points(&annotation.polygon)]);
    imgproc::polylines(frame, &polygon, true, lime, 2, imgproc::LINE_8, 0)?;

    let hull: Vector<Vector<core::Point>> = Vector::from_iter([to_cv_points(&annotation.hull)]);
    imgproc::polylines(frame, &hull, true, hull_color, 2, imgproc::LINE_8, 0)?;

    let (cx, cy) = annotation.center();
    imgproc::circle(
        frame,
        core::Point::new(cx.round() as i32, cy.round() as i32),
        3,
        lime,
        -1,
        imgproc::LINE_8,
        0,
    )?;
    Ok(())
}

fn draw_verdict(frame: &mut Mat, is_safe: bool, state: ProcessState) -> Result<()> {
    let (label, color) = if is_safe {
        ("SAFE", Scalar::new(0.0, 255.0, 0.0, 0.0))
    } else {
        ("NOT SAFE", Scalar::new(0.0, 0.0, 255.0, 0.0))
    };
    imgproc::put_text(
        frame,
        &format!("{label} ({state})"),
        core::Point::new(10, 30),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.8,
        color,
        2,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}
