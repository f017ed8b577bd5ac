//! Mask and cutout image operations
//!
//! Pure functions over `image` buffers. Nothing here knows about sessions
//! or requests, which keeps the executor's decisions testable without a model.
use std::io::Cursor;

use anyhow::{anyhow, Context};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgba, RgbaImage};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology;

const MASK_THRESHOLD: u8 = 127;
const POST_PROCESS_SIGMA: f32 = 2.0;

pub const TRIMAP_FOREGROUND: u8 = 255;
pub const TRIMAP_UNKNOWN: u8 = 128;
pub const TRIMAP_BACKGROUND: u8 = 0;

/// Min-max normalize raw model output into an 8-bit mask.
pub fn mask_from_prediction(values: &[f32], width: u32, height: u32) -> anyhow::Result<GrayImage> {
    let expected = width as usize * height as usize;
    if values.len() != expected {
        return Err(anyhow!(
            "prediction has {} values, expected {}x{}",
            values.len(),
            width,
            height
        ));
    }

    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;

    let pixels = values
        .iter()
        .map(|&v| {
            if range > f32::EPSILON {
                (((v - min) / range) * 255.0).round().clamp(0.0, 255.0) as u8
            } else {
                0
            }
        })
        .collect();

    GrayImage::from_raw(width, height, pixels).context("mask buffer size mismatch")
}

fn threshold(mask: &GrayImage, at: u8) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        if mask.get_pixel(x, y)[0] > at {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Remove speckles and smooth edges: binarize, open with a 3x3 kernel,
/// blur, binarize again.
pub fn post_process_mask(mask: &GrayImage) -> GrayImage {
    let binary = threshold(mask, MASK_THRESHOLD);
    let opened = morphology::open(&binary, Norm::LInf, 1);
    let blurred = gaussian_blur_f32(&opened, POST_PROCESS_SIGMA);
    threshold(&blurred, MASK_THRESHOLD)
}

/// RGBA copy of `image` whose alpha channel is `mask`.
pub fn naive_cutout(image: &DynamicImage, mask: &GrayImage) -> anyhow::Result<RgbaImage> {
    ensure_same_size(image, mask)?;
    let rgb = image.to_rgb8();
    Ok(RgbaImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        Rgba([r, g, b, mask.get_pixel(x, y)[0]])
    }))
}

/// Three-level map: eroded confident foreground, eroded confident
/// background, everything else unknown.
pub fn trimap(mask: &GrayImage, fg_threshold: u8, bg_threshold: u8, erode_size: u8) -> GrayImage {
    let foreground = GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        Luma([if mask.get_pixel(x, y)[0] > fg_threshold { 255 } else { 0 }])
    });
    let background = GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        Luma([if mask.get_pixel(x, y)[0] < bg_threshold { 255 } else { 0 }])
    });

    let (foreground, background) = if erode_size > 0 {
        (
            morphology::erode(&foreground, Norm::LInf, erode_size),
            morphology::erode(&background, Norm::LInf, erode_size),
        )
    } else {
        (foreground, background)
    };

    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        if foreground.get_pixel(x, y)[0] == 255 {
            Luma([TRIMAP_FOREGROUND])
        } else if background.get_pixel(x, y)[0] == 255 {
            Luma([TRIMAP_BACKGROUND])
        } else {
            Luma([TRIMAP_UNKNOWN])
        }
    })
}

/// Cutout whose alpha is refined inside the trimap's unknown band.
///
/// Definite regions keep full or zero opacity; the band takes a blurred
/// copy of the predicted mask so hair and soft edges fade instead of
/// stepping.
pub fn alpha_matting_cutout(
    image: &DynamicImage,
    mask: &GrayImage,
    fg_threshold: u8,
    bg_threshold: u8,
    erode_size: u8,
) -> anyhow::Result<RgbaImage> {
    ensure_same_size(image, mask)?;
    if fg_threshold <= bg_threshold {
        return Err(anyhow!(
            "foreground threshold {} must exceed background threshold {}",
            fg_threshold,
            bg_threshold
        ));
    }

    let trimap = trimap(mask, fg_threshold, bg_threshold, erode_size);
    let sigma = (erode_size as f32 / 2.0).max(1.0);
    let soft = gaussian_blur_f32(mask, sigma);

    let alpha = GrayImage::from_fn(mask.width(), mask.height(), |x, y| match trimap.get_pixel(x, y)[0] {
        TRIMAP_FOREGROUND => Luma([255]),
        TRIMAP_BACKGROUND => Luma([0]),
        _ => *soft.get_pixel(x, y),
    });

    naive_cutout(image, &alpha)
}

pub fn encode_png(image: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .context("PNG encoding failed")?;
    Ok(buffer)
}

fn ensure_same_size(image: &DynamicImage, mask: &GrayImage) -> anyhow::Result<()> {
    if image.width() != mask.width() || image.height() != mask.height() {
        return Err(anyhow!(
            "mask is {}x{} but image is {}x{}",
            mask.width(),
            mask.height(),
            image.width(),
            image.height()
        ));
    }
    Ok(())
}
