//! Fixed-size binary layout of a worker's result record.
//!
//! A record is a flat byte sequence with the fields below, in this order:
//!
//! | field        | type | length                                   |
//! |--------------|------|------------------------------------------|
//! | `images`     | u8   | `num_images * image_height * image_width * 3` |
//! | `state`      | f64  | `state_dim`                              |
//! | `reward`     | f64  | 1                                        |
//! | `terminated` | u8   | 1                                        |
//! | `truncated`  | u8   | 1                                        |
//! | `trajectory` | f64  | `horizon * trajectory_dim`               |
//!
//! Floats are little-endian. Offsets are computed once by [`ResultLayout::new`]
//! and used by both [`ResultLayout::encode`] and [`ResultLayout::decode`].
use crate::{error::PoolError, sim::Frame};
use anyhow::Result;

const F64: usize = std::mem::size_of::<f64>();

/// Number of channels of an image in a record.
pub const CHANNELS: usize = 3;

/// Shape parameters that determine the record size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordShape {
    /// Number of images, before and after images of every camera.
    pub num_images: usize,

    /// Height of an image.
    pub image_height: usize,

    /// Width of an image.
    pub image_width: usize,

    /// Dimension of the state vector.
    pub state_dim: usize,

    /// Number of poses in the auxiliary trajectory.
    pub horizon: usize,

    /// Dimension of a pose.
    pub trajectory_dim: usize,
}

impl RecordShape {
    /// Number of bytes of one image.
    pub fn image_bytes(&self) -> usize {
        self.image_height * self.image_width * CHANNELS
    }
}

/// A named byte range inside a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Byte offset from the start of the record.
    pub offset: usize,

    /// Length in bytes.
    pub len: usize,
}

impl Field {
    fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Logical view of one result record.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    /// Images, `num_images` concatenated `H x W x 3` arrays.
    pub images: Vec<u8>,

    /// State vector at the end of the chunk.
    pub state: Vec<f64>,

    /// Reward of the last step.
    pub reward: f64,

    /// The episode ended with success.
    pub terminated: bool,

    /// The episode hit the step ceiling, or the record was produced by a reset.
    pub truncated: bool,

    /// Auxiliary trajectory, `horizon` poses concatenated.
    pub trajectory: Vec<f64>,
}

impl ResultRecord {
    /// Builds a record whose images are the `before` frames followed by the `after` frames.
    pub fn from_frames(
        before: &[Frame],
        after: &[Frame],
        state: Vec<f64>,
        reward: f64,
        terminated: bool,
        truncated: bool,
        trajectory: Vec<f64>,
    ) -> Self {
        let images = before
            .iter()
            .chain(after.iter())
            .flat_map(|f| f.data.iter().copied())
            .collect();
        Self {
            images,
            state,
            reward,
            terminated,
            truncated,
            trajectory,
        }
    }
}

/// Offsets of every field of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultLayout {
    shape: RecordShape,
    images: Field,
    state: Field,
    reward: Field,
    terminated: Field,
    truncated: Field,
    trajectory: Field,
    record_size: usize,
}

impl ResultLayout {
    /// Computes the layout of a record.
    pub fn new(shape: RecordShape) -> Self {
        let mut offset = 0;
        let mut next = |len: usize| {
            let field = Field { offset, len };
            offset += len;
            field
        };
        let images = next(shape.num_images * shape.image_bytes());
        let state = next(shape.state_dim * F64);
        let reward = next(F64);
        let terminated = next(1);
        let truncated = next(1);
        let trajectory = next(shape.horizon * shape.trajectory_dim * F64);
        let record_size = trajectory.offset + trajectory.len;

        Self {
            shape,
            images,
            state,
            reward,
            terminated,
            truncated,
            trajectory,
            record_size,
        }
    }

    /// Size of a record in bytes.
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Shape this layout was computed from.
    pub fn shape(&self) -> &RecordShape {
        &self.shape
    }

    /// Fields in record order.
    pub fn fields(&self) -> [(&'static str, Field); 6] {
        [
            ("images", self.images),
            ("state", self.state),
            ("reward", self.reward),
            ("terminated", self.terminated),
            ("truncated", self.truncated),
            ("trajectory", self.trajectory),
        ]
    }

    /// Writes `record` into `out`, which must be exactly one record long.
    pub fn encode(&self, record: &ResultRecord, out: &mut [u8]) -> Result<()> {
        self.check_len("buffer", out.len(), self.record_size)?;
        self.check_len("images", record.images.len(), self.images.len)?;
        self.check_len("state", record.state.len() * F64, self.state.len)?;
        self.check_len(
            "trajectory",
            record.trajectory.len() * F64,
            self.trajectory.len,
        )?;

        out[self.images.range()].copy_from_slice(&record.images);
        write_f64s(&mut out[self.state.range()], &record.state);
        write_f64s(&mut out[self.reward.range()], &[record.reward]);
        out[self.terminated.offset] = record.terminated as u8;
        out[self.truncated.offset] = record.truncated as u8;
        write_f64s(&mut out[self.trajectory.range()], &record.trajectory);
        Ok(())
    }

    /// Reads a record from `buf`, which must be exactly one record long.
    pub fn decode(&self, buf: &[u8]) -> Result<ResultRecord> {
        self.check_len("buffer", buf.len(), self.record_size)?;

        Ok(ResultRecord {
            images: buf[self.images.range()].to_vec(),
            state: read_f64s(&buf[self.state.range()]),
            reward: read_f64s(&buf[self.reward.range()])[0],
            terminated: buf[self.terminated.offset] != 0,
            truncated: buf[self.truncated.offset] != 0,
            trajectory: read_f64s(&buf[self.trajectory.range()]),
        })
    }

    fn check_len(&self, what: &str, actual: usize, expected: usize) -> Result<()> {
        if actual != expected {
            return Err(PoolError::LayoutMismatch(format!(
                "{} has {} bytes, layout expects {}",
                what, actual, expected
            ))
            .into());
        }
        Ok(())
    }
}

fn write_f64s(out: &mut [u8], values: &[f64]) {
    for (chunk, v) in out.chunks_exact_mut(F64).zip(values) {
        chunk.copy_from_slice(&v.to_le_bytes());
    }
}

fn read_f64s(buf: &[u8]) -> Vec<f64> {
    buf.chunks_exact(F64)
        .map(|chunk| {
            let mut bytes = [0u8; F64];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect()
}

/// Extends `poses` to `horizon` poses by repeating the last one.
///
/// `poses` holds whole poses of `dim` values. An empty input yields zeros.
pub fn fill_trajectory(mut poses: Vec<f64>, horizon: usize, dim: usize) -> Vec<f64> {
    let n = poses.len() / dim;
    if n >= horizon {
        poses.truncate(horizon * dim);
        return poses;
    }
    let last = if n == 0 {
        vec![0.0; dim]
    } else {
        poses[(n - 1) * dim..n * dim].to_vec()
    };
    for _ in n..horizon {
        poses.extend_from_slice(&last);
    }
    poses
}
