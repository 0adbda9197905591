//! Turning generated batches into a viewable grayscale image.

use image::{GrayImage, Luma};
use ndarray::{Array2, ArrayD, Axis, Ix4};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("expected a [N, H, W, 1] image batch, got shape {0:?}")]
    BadShape(Vec<usize>),
    #[error("image is too large to encode: {0}x{1}")]
    TooLarge(usize, usize),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Stacks a `[N, H, W, 1]` batch vertically into one `[N·H, W]` image.
pub fn tile_vertically(images: &ArrayD<f32>) -> Result<Array2<f32>, RenderError> {
    let batch = images
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| RenderError::BadShape(images.shape().to_vec()))?;
    let (n, h, w, c) = batch.dim();
    if c != 1 || n == 0 {
        return Err(RenderError::BadShape(images.shape().to_vec()));
    }

    let mut tiled = Array2::zeros((n * h, w));
    for (i, image) in batch.axis_iter(Axis(0)).enumerate() {
        tiled
            .slice_mut(ndarray::s![i * h..(i + 1) * h, ..])
            .assign(&image.index_axis(Axis(2), 0));
    }
    Ok(tiled)
}

/// Converts intensities in `[0, 1]` to 8-bit gray. Values outside are clamped.
pub fn to_gray_image(pixels: &Array2<f32>) -> Result<GrayImage, RenderError> {
    let (h, w) = pixels.dim();
    let (Ok(height), Ok(width)) = (u32::try_from(h), u32::try_from(w)) else {
        return Err(RenderError::TooLarge(w, h));
    };
    Ok(GrayImage::from_fn(width, height, |x, y| {
        let v = pixels[[y as usize, x as usize]];
        Luma([(v.clamp(0.0, 1.0) * 255.0).round() as u8])
    }))
}

/// Writes `pixels` as a PNG file.
pub fn save_png<P: AsRef<Path>>(pixels: &Array2<f32>, path: P) -> Result<(), RenderError> {
    to_gray_image(pixels)?.save(path.as_ref())?;
    Ok(())
}
