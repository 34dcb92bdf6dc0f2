//! Deterministic canvas normalization for room imagery.
//!
//! Both entry points are infallible from the caller's side: decode or encode
//! problems come back as [`CanvasOutcome::Degraded`] carrying the untouched
//! input path, and the caller decides whether that is acceptable.

use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, Rgb, RgbImage};
use serde::Serialize;
use stager_contracts::canvas::CanonicalCanvas;
use tracing::{debug, warn};

/// Backdrop for transparent pixels. Mid grey keeps both light and dark
/// foreground content distinguishable; never pure white or black.
pub const FLATTEN_BACKDROP: [u8; 3] = [210, 210, 210];
pub const WHITE_STRIP_FRACTION: f64 = 0.22;
pub const WHITE_STRIP_SAMPLE_WIDTH: u32 = 256;
pub const NEAR_WHITE_LUMA: u8 = 245;
pub const MOSTLY_WHITE_SHARE: f64 = 0.35;
/// Relative aspect difference treated as "same ratio".
pub const RATIO_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StandardizeOptions {
    pub force_landscape: bool,
    /// Skip crop and resample; only orientation and flattening apply.
    pub keep_ratio: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    fn is_full(&self, width: u32, height: u32) -> bool {
        self.x == 0 && self.y == 0 && self.width == width && self.height == height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CropAnchor {
    Center,
    Top,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanvasReport {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub canvas: Option<CanonicalCanvas>,
    pub crop: Option<CropRect>,
    pub anchor: Option<CropAnchor>,
    pub resampled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CanvasOutcome {
    Normalized(CanvasReport),
    Degraded { original: PathBuf, reason: String },
}

impl CanvasOutcome {
    /// Normalized output, or the untouched input when normalization failed.
    pub fn path(&self) -> &Path {
        match self {
            Self::Normalized(report) => &report.path,
            Self::Degraded { original, .. } => original,
        }
    }

    pub fn report(&self) -> Option<&CanvasReport> {
        match self {
            Self::Normalized(report) => Some(report),
            Self::Degraded { .. } => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    pub fn into_result(self) -> anyhow::Result<CanvasReport> {
        match self {
            Self::Normalized(report) => Ok(report),
            Self::Degraded { original, reason } => Err(anyhow::anyhow!(
                "canvas normalization failed for {}: {reason}",
                original.display()
            )),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CanvasError {
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Normalizes `input` onto one of the two canonical canvases and writes a
/// PNG next to it (same stem, `.png` extension).
pub fn standardize(input: &Path, options: StandardizeOptions) -> CanvasOutcome {
    into_outcome(input, "standardize", standardize_image(input, options))
}

/// Crops and resamples `image` onto the exact pixel canvas of `reference`.
/// Only the reference's header is read.
pub fn fit_to_reference_canvas(image: &Path, reference: &Path) -> CanvasOutcome {
    into_outcome(image, "fit_to_reference", fit_image(image, reference))
}

pub fn output_path_for(input: &Path) -> PathBuf {
    input.with_extension("png")
}

fn into_outcome(
    input: &Path,
    operation: &str,
    result: Result<CanvasReport, CanvasError>,
) -> CanvasOutcome {
    match result {
        Ok(report) => {
            debug!(
                operation,
                path = %report.path.display(),
                width = report.width,
                height = report.height,
                resampled = report.resampled,
                "canvas normalized"
            );
            CanvasOutcome::Normalized(report)
        }
        Err(err) => {
            warn!(
                operation,
                path = %input.display(),
                error = %err,
                "canvas normalization degraded"
            );
            CanvasOutcome::Degraded {
                original: input.to_path_buf(),
                reason: err.to_string(),
            }
        }
    }
}

fn standardize_image(
    input: &Path,
    options: StandardizeOptions,
) -> Result<CanvasReport, CanvasError> {
    let rgb = flatten_onto_backdrop(open_oriented(input)?);
    let (width, height) = rgb.dimensions();
    let canvas = CanonicalCanvas::for_dimensions(width, height, options.force_landscape);
    let output = output_path_for(input);

    if options.keep_ratio {
        rgb.save_with_format(&output, ImageFormat::Png)?;
        return Ok(CanvasReport {
            path: output,
            width,
            height,
            canvas: Some(canvas),
            crop: None,
            anchor: None,
            resampled: false,
        });
    }

    let (target_width, target_height) = canvas.dimensions();
    let crop = crop_to_aspect(width, height, canvas.aspect(), CropAnchor::Center);
    let cropped = apply_crop(rgb, crop);
    let (resized, resampled) = resample_exact(cropped, target_width, target_height);
    resized.save_with_format(&output, ImageFormat::Png)?;

    Ok(CanvasReport {
        path: output,
        width: target_width,
        height: target_height,
        canvas: Some(canvas),
        crop: (!crop.is_full(width, height)).then_some(crop),
        anchor: None,
        resampled,
    })
}

fn fit_image(input: &Path, reference: &Path) -> Result<CanvasReport, CanvasError> {
    let (ref_width, ref_height) = image::image_dimensions(reference)?;
    if ref_width == 0 || ref_height == 0 {
        return Err(CanvasError::Invalid(format!(
            "reference {} has zero dimensions",
            reference.display()
        )));
    }
    let rgb = flatten_onto_backdrop(open_oriented(input)?);
    let (width, height) = rgb.dimensions();
    let target = ref_width as f64 / ref_height as f64;
    let output = output_path_for(input);

    if same_ratio(width, height, target) && (width, height) == (ref_width, ref_height) {
        rgb.save_with_format(&output, ImageFormat::Png)?;
        return Ok(CanvasReport {
            path: output,
            width,
            height,
            canvas: None,
            crop: None,
            anchor: None,
            resampled: false,
        });
    }

    let too_tall = (width as f64 / height as f64) < target && !same_ratio(width, height, target);
    let anchor = if too_tall && target >= 1.0 && bottom_strip_is_mostly_white(&rgb) {
        CropAnchor::Top
    } else {
        CropAnchor::Center
    };
    let crop = crop_to_aspect(width, height, target, anchor);
    let cropped = apply_crop(rgb, crop);
    let (resized, resampled) = resample_exact(cropped, ref_width, ref_height);
    resized.save_with_format(&output, ImageFormat::Png)?;

    let cropped_any = !crop.is_full(width, height);
    Ok(CanvasReport {
        path: output,
        width: ref_width,
        height: ref_height,
        canvas: None,
        crop: cropped_any.then_some(crop),
        anchor: cropped_any.then_some(anchor),
        resampled,
    })
}

/// True when the bottom ~22% of `image` is mostly near-white. Degenerate
/// inputs count as not white.
pub fn bottom_strip_is_mostly_white(image: &RgbImage) -> bool {
    bottom_strip_white_share(image)
        .map(|share| share >= MOSTLY_WHITE_SHARE)
        .unwrap_or(false)
}

/// Share of near-white pixels in a downsampled copy of the bottom strip.
pub fn bottom_strip_white_share(image: &RgbImage) -> Option<f64> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    let strip_height = ((height as f64 * WHITE_STRIP_FRACTION) as u32).clamp(1, height);
    let strip = imageops::crop_imm(image, 0, height - strip_height, width, strip_height).to_image();

    // Bilinear is enough here; the sample only bounds the scan cost.
    let sample_height = ((strip_height as f64 * WHITE_STRIP_SAMPLE_WIDTH as f64 / width as f64)
        .round() as u32)
        .max(1);
    let sample = imageops::resize(
        &strip,
        WHITE_STRIP_SAMPLE_WIDTH,
        sample_height,
        FilterType::Triangle,
    );
    let luma = DynamicImage::ImageRgb8(sample).into_luma8();
    let total = luma.pixels().len();
    if total == 0 {
        return None;
    }
    let white = luma
        .pixels()
        .filter(|pixel| pixel[0] >= NEAR_WHITE_LUMA)
        .count();
    Some(white as f64 / total as f64)
}

fn open_oriented(path: &Path) -> Result<DynamicImage, CanvasError> {
    let mut decoder = ImageReader::open(path)?
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image)
}

fn flatten_onto_backdrop(image: DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.into_rgb8();
    }
    let rgba = image.into_rgba8();
    let (width, height) = rgba.dimensions();
    let mut out = RgbImage::new(width, height);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = pixel[3] as u32;
        let mut blended = [0u8; 3];
        for (channel, slot) in blended.iter_mut().enumerate() {
            let fg = pixel[channel] as u32;
            let bg = FLATTEN_BACKDROP[channel] as u32;
            *slot = ((fg * alpha + bg * (255 - alpha) + 127) / 255) as u8;
        }
        out.put_pixel(x, y, Rgb(blended));
    }
    out
}

fn same_ratio(width: u32, height: u32, target: f64) -> bool {
    if height == 0 || target <= 0.0 {
        return false;
    }
    let current = width as f64 / height as f64;
    ((current - target) / target).abs() < RATIO_TOLERANCE
}

/// Largest window of `target` aspect inside `width`x`height`. Excess width
/// is always trimmed symmetrically; excess height follows `anchor`.
fn crop_to_aspect(width: u32, height: u32, target: f64, anchor: CropAnchor) -> CropRect {
    if width == 0 || height == 0 || same_ratio(width, height, target) {
        return CropRect::full(width, height);
    }
    let current = width as f64 / height as f64;
    if current > target {
        let new_width = ((height as f64 * target).round() as u32).clamp(1, width);
        CropRect {
            x: (width - new_width) / 2,
            y: 0,
            width: new_width,
            height,
        }
    } else {
        let new_height = ((width as f64 / target).round() as u32).clamp(1, height);
        let y = match anchor {
            CropAnchor::Top => 0,
            CropAnchor::Center => (height - new_height) / 2,
        };
        CropRect {
            x: 0,
            y,
            width,
            height: new_height,
        }
    }
}

fn apply_crop(image: RgbImage, crop: CropRect) -> RgbImage {
    let (width, height) = image.dimensions();
    if crop.is_full(width, height) {
        return image;
    }
    imageops::crop_imm(&image, crop.x, crop.y, crop.width, crop.height).to_image()
}

fn resample_exact(image: RgbImage, width: u32, height: u32) -> (RgbImage, bool) {
    if image.dimensions() == (width, height) {
        return (image, false);
    }
    (
        imageops::resize(&image, width, height, FilterType::Lanczos3),
        true,
    )
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use image::{ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
    use stager_contracts::canvas::CanonicalCanvas;

    use super::{
        bottom_strip_is_mostly_white, bottom_strip_white_share, crop_to_aspect,
        fit_to_reference_canvas, standardize, CanvasOutcome, CropAnchor, CropRect,
        StandardizeOptions, FLATTEN_BACKDROP,
    };

    const LIGHT: Rgb<u8> = Rgb([250, 250, 250]);
    const DARK: Rgb<u8> = Rgb([20, 20, 20]);

    /// `bottom` fills the last 22% of rows, `top` the rest.
    fn banded(width: u32, height: u32, top: Rgb<u8>, bottom: Rgb<u8>) -> RgbImage {
        let boundary = height - (height as f64 * 0.22) as u32;
        RgbImage::from_fn(width, height, |_, y| if y >= boundary { bottom } else { top })
    }

    fn save(image: &RgbImage, path: &Path) -> anyhow::Result<()> {
        image.save_with_format(path, ImageFormat::Png)?;
        Ok(())
    }

    fn normalized(outcome: CanvasOutcome) -> anyhow::Result<super::CanvasReport> {
        outcome.into_result()
    }

    #[test]
    fn white_bottom_strip_is_detected() {
        assert!(bottom_strip_is_mostly_white(&banded(400, 1000, DARK, LIGHT)));
        assert!(!bottom_strip_is_mostly_white(&banded(400, 1000, LIGHT, DARK)));
    }

    #[test]
    fn white_share_threshold_is_inclusive_of_partial_strips() {
        // Left 40% of the strip white, rest dark.
        let image = RgbImage::from_fn(1000, 500, |x, _| if x < 400 { LIGHT } else { DARK });
        let share = bottom_strip_white_share(&image).unwrap_or_default();
        assert!(share > 0.35 && share < 0.45, "share={share}");
        assert!(bottom_strip_is_mostly_white(&image));

        let mostly_dark = RgbImage::from_fn(1000, 500, |x, _| if x < 200 { LIGHT } else { DARK });
        assert!(!bottom_strip_is_mostly_white(&mostly_dark));
    }

    #[test]
    fn degenerate_strip_is_not_white() {
        assert!(!bottom_strip_is_mostly_white(&RgbImage::new(0, 0)));
        assert!(bottom_strip_white_share(&RgbImage::new(10, 0)).is_none());
    }

    #[test]
    fn crop_math_trims_wide_symmetrically_and_tall_by_anchor() {
        assert_eq!(
            crop_to_aspect(2000, 900, 16.0 / 9.0, CropAnchor::Top),
            CropRect {
                x: 200,
                y: 0,
                width: 1600,
                height: 900
            }
        );
        assert_eq!(
            crop_to_aspect(900, 1200, 16.0 / 9.0, CropAnchor::Center),
            CropRect {
                x: 0,
                y: 347,
                width: 900,
                height: 506
            }
        );
        assert_eq!(
            crop_to_aspect(900, 1200, 16.0 / 9.0, CropAnchor::Top).y,
            0
        );
        assert_eq!(
            crop_to_aspect(1920, 1080, 16.0 / 9.0, CropAnchor::Center),
            CropRect {
                x: 0,
                y: 0,
                width: 1920,
                height: 1080
            }
        );
    }

    #[test]
    fn standardize_is_idempotent_on_canonical_landscape() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("room.png");
        let original = RgbImage::from_fn(1920, 1080, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        save(&original, &path)?;

        let first = normalized(standardize(&path, StandardizeOptions::default()))?;
        assert_eq!(first.path, path);
        assert_eq!((first.width, first.height), (1920, 1080));
        assert!(!first.resampled);
        assert!(first.crop.is_none());
        let first_bytes = fs::read(&first.path)?;
        assert_eq!(image::open(&first.path)?.into_rgb8(), original);

        let second = normalized(standardize(&path, StandardizeOptions::default()))?;
        assert_eq!(fs::read(&second.path)?, first_bytes);
        Ok(())
    }

    #[test]
    fn standardize_crops_and_resamples_portrait_input() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("room.jpg");
        RgbImage::from_pixel(600, 900, Rgb([90, 120, 150]))
            .save_with_format(&path, ImageFormat::Jpeg)?;

        let report = normalized(standardize(&path, StandardizeOptions::default()))?;
        assert_eq!(report.path, temp.path().join("room.png"));
        assert_eq!(report.canvas, Some(CanonicalCanvas::Portrait));
        assert_eq!(
            report.crop,
            Some(CropRect {
                x: 0,
                y: 75,
                width: 600,
                height: 750
            })
        );
        assert!(report.resampled);
        assert_eq!(image::image_dimensions(&report.path)?, (1080, 1350));
        Ok(())
    }

    #[test]
    fn standardize_force_landscape_overrides_orientation() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("tall.png");
        save(&RgbImage::from_pixel(600, 900, DARK), &path)?;

        let options = StandardizeOptions {
            force_landscape: true,
            keep_ratio: false,
        };
        let report = normalized(standardize(&path, options))?;
        assert_eq!(report.canvas, Some(CanonicalCanvas::Landscape));
        assert_eq!(image::image_dimensions(&report.path)?, (1920, 1080));
        Ok(())
    }

    #[test]
    fn standardize_keep_ratio_only_normalizes_format() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("wide.jpeg");
        RgbImage::from_pixel(1000, 500, LIGHT).save_with_format(&path, ImageFormat::Jpeg)?;

        let options = StandardizeOptions {
            force_landscape: false,
            keep_ratio: true,
        };
        let report = normalized(standardize(&path, options))?;
        assert_eq!(report.path.extension().and_then(|ext| ext.to_str()), Some("png"));
        assert!(!report.resampled);
        assert_eq!(image::image_dimensions(&report.path)?, (1000, 500));
        Ok(())
    }

    #[test]
    fn standardize_flattens_transparency_onto_grey() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cutout.png");
        let mut rgba = RgbaImage::from_pixel(400, 300, Rgba([0, 0, 0, 0]));
        rgba.put_pixel(200, 150, Rgba([0, 0, 0, 255]));
        rgba.save_with_format(&path, ImageFormat::Png)?;

        let report = normalized(standardize(&path, StandardizeOptions::default()))?;
        let out = image::open(&report.path)?;
        assert!(!out.color().has_alpha());
        let corner = out.into_rgb8().get_pixel(0, 0).0;
        for (channel, expected) in corner.iter().zip(FLATTEN_BACKDROP) {
            assert!(channel.abs_diff(expected) <= 1, "corner={corner:?}");
        }
        Ok(())
    }

    #[test]
    fn unreadable_input_degrades_to_original_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("broken.jpg");
        fs::write(&path, b"not an image at all")?;

        let outcome = standardize(&path, StandardizeOptions::default());
        assert!(outcome.is_degraded());
        assert_eq!(outcome.path(), path.as_path());
        assert!(!temp.path().join("broken.png").exists());

        let missing = temp.path().join("missing.png");
        let fitted = fit_to_reference_canvas(&path, &missing);
        assert!(fitted.is_degraded());
        assert_eq!(fitted.path(), path.as_path());
        Ok(())
    }

    #[test]
    fn fit_takes_fast_path_on_exact_match() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let generated = temp.path().join("furnished.jpg");
        let reference = temp.path().join("empty.png");
        RgbImage::from_pixel(1600, 900, DARK).save_with_format(&generated, ImageFormat::Jpeg)?;
        save(&RgbImage::from_pixel(1600, 900, LIGHT), &reference)?;

        let report = normalized(fit_to_reference_canvas(&generated, &reference))?;
        assert!(!report.resampled);
        assert!(report.crop.is_none());
        assert_eq!(report.path, temp.path().join("furnished.png"));
        assert_eq!(image::image_dimensions(&report.path)?, (1600, 900));
        Ok(())
    }

    #[test]
    fn fit_anchors_top_when_landscape_target_has_white_bottom() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let generated = temp.path().join("furnished.png");
        let reference = temp.path().join("empty.png");
        save(&banded(900, 1200, DARK, LIGHT), &generated)?;
        save(&RgbImage::from_pixel(1600, 900, LIGHT), &reference)?;

        let report = normalized(fit_to_reference_canvas(&generated, &reference))?;
        assert_eq!(report.anchor, Some(CropAnchor::Top));
        assert_eq!(
            report.crop,
            Some(CropRect {
                x: 0,
                y: 0,
                width: 900,
                height: 506
            })
        );
        assert!(report.resampled);

        let out = image::open(&report.path)?.into_rgb8();
        assert_eq!(out.dimensions(), (1600, 900));
        // The white strip lived below row 936; the crop stops at row 506.
        let bottom = out.get_pixel(800, 899).0;
        assert!(bottom.iter().all(|channel| *channel < 100), "bottom={bottom:?}");
        Ok(())
    }

    #[test]
    fn fit_centers_tall_crop_without_white_strip() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let generated = temp.path().join("furnished.png");
        let reference = temp.path().join("empty.png");
        save(&banded(900, 1200, LIGHT, DARK), &generated)?;
        save(&RgbImage::from_pixel(1600, 900, LIGHT), &reference)?;

        let report = normalized(fit_to_reference_canvas(&generated, &reference))?;
        assert_eq!(report.anchor, Some(CropAnchor::Center));
        assert_eq!(report.crop.map(|crop| crop.y), Some(347));
        Ok(())
    }

    #[test]
    fn fit_centers_tall_crop_for_portrait_target_even_with_white_strip() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let generated = temp.path().join("furnished.png");
        let reference = temp.path().join("empty.png");
        save(&banded(1000, 2000, DARK, LIGHT), &generated)?;
        save(&RgbImage::from_pixel(1080, 1350, LIGHT), &reference)?;

        let report = normalized(fit_to_reference_canvas(&generated, &reference))?;
        assert_eq!(report.anchor, Some(CropAnchor::Center));
        assert_eq!(
            report.crop,
            Some(CropRect {
                x: 0,
                y: 375,
                width: 1000,
                height: 1250
            })
        );
        assert_eq!(image::image_dimensions(&report.path)?, (1080, 1350));
        Ok(())
    }

    #[test]
    fn fit_trims_wide_images_symmetrically() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let generated = temp.path().join("wide.png");
        let reference = temp.path().join("empty.png");
        save(&RgbImage::from_pixel(2000, 900, DARK), &generated)?;
        save(&RgbImage::from_pixel(1920, 1080, LIGHT), &reference)?;

        let report = normalized(fit_to_reference_canvas(&generated, &reference))?;
        assert_eq!(
            report.crop,
            Some(CropRect {
                x: 200,
                y: 0,
                width: 1600,
                height: 900
            })
        );
        assert_eq!(image::image_dimensions(&report.path)?, (1920, 1080));
        Ok(())
    }
}
