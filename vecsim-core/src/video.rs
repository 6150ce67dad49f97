//! Frame logging of rollouts.
use anyhow::{bail, Result};
use image::{imageops::replace, RgbImage};
use log::info;
use ndarray::ArrayView3;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Configuration of [`VideoRecorder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Directory under which frames are written.
    pub base_dir: PathBuf,
}

impl VideoConfig {
    /// Creates a configuration writing under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

/// Arranges equally sized images into a grid with `nrows` rows.
///
/// Images fill the grid column by column.
pub fn tile_images(images: &[RgbImage], nrows: usize) -> Result<RgbImage> {
    let first = match images.first() {
        Some(img) => img,
        None => bail!("no images to tile"),
    };
    let (w, h) = first.dimensions();
    if images.iter().any(|img| img.dimensions() != (w, h)) {
        bail!("tiled images must have the same size");
    }
    let nrows = nrows.clamp(1, images.len());
    let ncols = (images.len() + nrows - 1) / nrows;

    let mut out = RgbImage::new(w * ncols as u32, h * nrows as u32);
    for (i, img) in images.iter().enumerate() {
        let (col, row) = (i / nrows, i % nrows);
        replace(&mut out, img, col as u32 * w, row as u32 * h);
    }
    Ok(out)
}

/// Converts a channel-first `[3, H, W]` array into an image.
pub fn to_rgb_image(chw: ArrayView3<u8>) -> RgbImage {
    let (h, w) = (chw.shape()[1], chw.shape()[2]);
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        image::Rgb([chw[[0, y, x]], chw[[1, y, x]], chw[[2, y, x]]])
    })
}

/// Buffers frames and writes them as numbered PNG sequences.
pub struct VideoRecorder {
    config: VideoConfig,
    frames: Vec<RgbImage>,
    count: usize,
}

impl VideoRecorder {
    /// Creates a recorder.
    pub fn new(config: VideoConfig) -> Self {
        Self {
            config,
            frames: vec![],
            count: 0,
        }
    }

    /// Buffers a frame.
    pub fn add_frame(&mut self, frame: RgbImage) {
        self.frames.push(frame);
    }

    /// Number of buffered frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Writes the buffered frames to
    /// `{base_dir}/seed_{seed}/{sub_dir}/{count}/frame_{:05}.png` and returns the directory.
    pub fn flush(&mut self, seed: u64, sub_dir: Option<&str>) -> Result<PathBuf> {
        let mut dir = self.config.base_dir.join(format!("seed_{}", seed));
        if let Some(sub_dir) = sub_dir {
            dir = dir.join(sub_dir);
        }
        let dir = dir.join(self.count.to_string());
        write_frames(&dir, &self.frames)?;
        info!("wrote {} frames to {:?}", self.frames.len(), dir);

        self.count += 1;
        self.frames.clear();
        Ok(dir)
    }
}

fn write_frames(dir: &Path, frames: &[RgbImage]) -> Result<()> {
    fs::create_dir_all(dir)?;
    for (i, frame) in frames.iter().enumerate() {
        frame.save(dir.join(format!("frame_{:05}.png", i)))?;
    }
    Ok(())
}
