//! Post-processing of the images of result records.
use crate::{
    codec::{RecordShape, CHANNELS},
    error::PoolError,
};
use anyhow::{anyhow, Result};
use image::{
    codecs::jpeg::JpegEncoder,
    imageops::{resize, FilterType::Triangle},
    ColorType, ImageBuffer, ImageFormat, Rgb, RgbImage,
};
use ndarray::{Array4, ArrayViewMut3, ArrayViewMut4, Axis};

/// Resizes images to the output size and recodes them as JPEG.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageProcessor {
    shape: RecordShape,
    out_height: usize,
    out_width: usize,
    jpeg_quality: Option<u8>,
}

impl ImageProcessor {
    /// Creates a processor of the images of records with `shape`.
    pub fn new(shape: RecordShape, image_size: (usize, usize), jpeg_quality: Option<u8>) -> Self {
        Self {
            shape,
            out_height: image_size.0,
            out_width: image_size.1,
            jpeg_quality,
        }
    }

    /// Shape `[num_images, 3, height, width]` of processed images of one record.
    pub fn output_shape(&self) -> [usize; 4] {
        [
            self.shape.num_images,
            CHANNELS,
            self.out_height,
            self.out_width,
        ]
    }

    /// Processes the image field of a record into channel-first images.
    pub fn process(&self, images: &[u8]) -> Result<Array4<u8>> {
        let mut out = Array4::zeros(self.output_shape());
        self.process_into(images, out.view_mut())?;
        Ok(out)
    }

    /// Like [`ImageProcessor::process`], writing into `out`.
    pub fn process_into(&self, images: &[u8], mut out: ArrayViewMut4<u8>) -> Result<()> {
        let n = self.shape.image_bytes();
        if images.len() != n * self.shape.num_images {
            return Err(PoolError::LayoutMismatch(format!(
                "{} image bytes, expected {}",
                images.len(),
                n * self.shape.num_images
            ))
            .into());
        }
        if out.shape() != self.output_shape() {
            return Err(PoolError::ShapeMismatch {
                expected: self.output_shape().to_vec(),
                actual: out.shape().to_vec(),
            }
            .into());
        }

        for (i, raw) in images.chunks_exact(n).enumerate() {
            let img = self.transform(raw)?;
            write_channel_first(&img, out.index_axis_mut(Axis(0), i));
        }
        Ok(())
    }

    /// Resizes one `H x W x 3` image and recodes it.
    pub fn transform(&self, raw: &[u8]) -> Result<RgbImage> {
        let (h, w) = (self.shape.image_height as u32, self.shape.image_width as u32);
        let img = ImageBuffer::<Rgb<u8>, _>::from_vec(w, h, raw.to_vec())
            .ok_or_else(|| anyhow!("image buffer does not hold {}x{} pixels", w, h))?;
        let (oh, ow) = (self.out_height as u32, self.out_width as u32);
        let img = if (oh, ow) == (h, w) {
            img
        } else {
            resize(&img, ow, oh, Triangle)
        };
        match self.jpeg_quality {
            Some(quality) => jpeg_round_trip(&img, quality),
            None => Ok(img),
        }
    }
}

/// Encodes an image as JPEG and decodes it again.
pub fn jpeg_round_trip(img: &RgbImage, quality: u8) -> Result<RgbImage> {
    let mut buf = vec![];
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        img.as_raw(),
        img.width(),
        img.height(),
        ColorType::Rgb8,
    )?;
    Ok(image::load_from_memory_with_format(&buf, ImageFormat::Jpeg)?.to_rgb8())
}

fn write_channel_first(img: &RgbImage, mut out: ArrayViewMut3<u8>) {
    for (x, y, px) in img.enumerate_pixels() {
        for c in 0..CHANNELS {
            out[[c, y as usize, x as usize]] = px[c];
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn shape() -> RecordShape {
        RecordShape {
            num_images: 2,
            image_height: 4,
            image_width: 6,
            state_dim: 1,
            horizon: 1,
            trajectory_dim: 1,
        }
    }

    fn images(shape: &RecordShape) -> Vec<u8> {
        // First image: red, second image: blue
        let mut v = vec![];
        for color in [[200u8, 0, 0], [0, 0, 200]] {
            for _ in 0..shape.image_height * shape.image_width {
                v.extend_from_slice(&color);
            }
        }
        v
    }

    #[test]
    fn test_channel_first_without_resize() -> Result<()> {
        let processor = ImageProcessor::new(shape(), (4, 6), None);
        let out = processor.process(&images(&shape()))?;
        assert_eq!(out.shape(), &[2, 3, 4, 6]);
        assert!(out.slice(ndarray::s![0, 0, .., ..]).iter().all(|&v| v == 200));
        assert!(out.slice(ndarray::s![0, 2, .., ..]).iter().all(|&v| v == 0));
        assert!(out.slice(ndarray::s![1, 2, .., ..]).iter().all(|&v| v == 200));
        Ok(())
    }

    #[test]
    fn test_resize_and_jpeg() -> Result<()> {
        let processor = ImageProcessor::new(shape(), (8, 8), Some(95));
        let out = processor.process(&images(&shape()))?;
        assert_eq!(out.shape(), &[2, 3, 8, 8]);
        // Uniform images stay close to their color after recoding
        let red = out.slice(ndarray::s![0, 0, .., ..]);
        assert!(red.iter().all(|&v| v > 180));
        let blue = out.slice(ndarray::s![1, 0, .., ..]);
        assert!(blue.iter().all(|&v| v < 30));
        Ok(())
    }

    #[test]
    fn test_wrong_length() {
        let processor = ImageProcessor::new(shape(), (4, 6), None);
        assert!(processor.process(&[0; 10]).is_err());
    }
}
