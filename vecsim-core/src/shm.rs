//! Shared region mapped by the controller and every worker.
//!
//! The region is one file, mapped with [`memmap2`] by each party:
//!
//! ```text
//! | header (64 bytes) | reset flags (N bytes, padded to 8) | actions (N*H*A f64) | results (N*R bytes) |
//! ```
//!
//! # Safety
//!
//! * The header is `#[repr(C)]` and made of atomics only. The mapping is page
//!   aligned, so casting its start to `&RegionHeader` is valid, and the
//!   reset flags are `AtomicU8`s which have alignment 1.
//! * The action and result areas are plain bytes without any lock. They are
//!   only accessed under the two-phase barrier of [`crate::signal`]: the
//!   controller writes actions while no worker holds a go signal, a worker
//!   writes only its own result slot between go and done, and the controller
//!   reads results only after every done signal of the cycle.
use crate::error::PoolError;
use anyhow::{Context, Result};
use log::debug;
use memmap2::MmapMut;
use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, AtomicU8, Ordering},
};

const MAGIC: u64 = 0x7665_6373_696d_0001;
const HEADER_SIZE: usize = std::mem::size_of::<RegionHeader>();
const F64: usize = std::mem::size_of::<f64>();

/// Number of distinct seeds handed out by the seed cursor.
pub const SEED_POOL_SIZE: u64 = 30;

/// Persisted seed values above this are reset to 0.
pub const SEED_PERSIST_CAP: u64 = 3000;

#[repr(C)]
struct RegionHeader {
    magic: AtomicU64,
    n_envs: AtomicU64,
    horizon: AtomicU64,
    action_dim: AtomicU64,
    record_size: AtomicU64,
    seed_cursor: AtomicU64,
    _reserved: [AtomicU64; 2],
}

/// Dimensions of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionShape {
    /// Number of slots.
    pub n_envs: usize,

    /// Steps per action row.
    pub horizon: usize,

    /// Dimension of an action.
    pub action_dim: usize,

    /// Bytes per result record.
    pub record_size: usize,
}

impl RegionShape {
    fn flags_size(&self) -> usize {
        (self.n_envs + 7) / 8 * 8
    }

    fn action_row_len(&self) -> usize {
        self.horizon * self.action_dim
    }

    fn actions_offset(&self) -> usize {
        HEADER_SIZE + self.flags_size()
    }

    fn results_offset(&self) -> usize {
        self.actions_offset() + self.n_envs * self.action_row_len() * F64
    }

    /// Total size of the region in bytes.
    pub fn size(&self) -> usize {
        self.results_offset() + self.n_envs * self.record_size
    }
}

/// A mapping of the shared region.
pub struct SharedRegion {
    mmap: MmapMut,
    shape: RegionShape,
    path: PathBuf,
}

impl SharedRegion {
    /// Creates the region file at `path`, zeroed, with the seed cursor set to `seed`.
    pub fn create(path: impl AsRef<Path>, shape: RegionShape, seed: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("creating shared region {:?}", path))?;
        file.set_len(shape.size() as u64)?;

        // SAFETY: the file is open read/write and sized to the region.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let region = Self { mmap, shape, path };

        let header = region.header();
        header.n_envs.store(shape.n_envs as u64, Ordering::Relaxed);
        header.horizon.store(shape.horizon as u64, Ordering::Relaxed);
        header
            .action_dim
            .store(shape.action_dim as u64, Ordering::Relaxed);
        header
            .record_size
            .store(shape.record_size as u64, Ordering::Relaxed);
        header.seed_cursor.store(seed, Ordering::Relaxed);
        header.magic.store(MAGIC, Ordering::Release);
        debug!("created shared region {:?} ({} bytes)", region.path, shape.size());

        Ok(region)
    }

    /// Maps an existing region and checks that it has the expected shape.
    pub fn open(path: impl AsRef<Path>, shape: RegionShape) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening shared region {:?}", path))?;
        let len = file.metadata()?.len() as usize;
        if len != shape.size() {
            return Err(PoolError::LayoutMismatch(format!(
                "region {:?} has {} bytes, expected {}",
                path,
                len,
                shape.size()
            ))
            .into());
        }

        // SAFETY: the file is open read/write and its length was checked above.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let region = Self { mmap, shape, path };

        let header = region.header();
        let found = RegionShape {
            n_envs: header.n_envs.load(Ordering::Relaxed) as usize,
            horizon: header.horizon.load(Ordering::Relaxed) as usize,
            action_dim: header.action_dim.load(Ordering::Relaxed) as usize,
            record_size: header.record_size.load(Ordering::Relaxed) as usize,
        };
        if header.magic.load(Ordering::Acquire) != MAGIC || found != shape {
            return Err(PoolError::LayoutMismatch(format!(
                "region {:?} has shape {:?}, expected {:?}",
                region.path, found, shape
            ))
            .into());
        }
        Ok(region)
    }

    fn header(&self) -> &RegionHeader {
        // SAFETY: see the module documentation.
        unsafe { &*(self.mmap.as_ptr() as *const RegionHeader) }
    }

    fn reset_flags(&self) -> &[AtomicU8] {
        // SAFETY: the flags follow the header and are within the mapping.
        unsafe {
            std::slice::from_raw_parts(
                self.mmap.as_ptr().add(HEADER_SIZE) as *const AtomicU8,
                self.shape.n_envs,
            )
        }
    }

    /// Shape of the region.
    pub fn shape(&self) -> RegionShape {
        self.shape
    }

    /// Path of the region file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Claims the next seed and advances the cursor, wrapping at [`SEED_POOL_SIZE`].
    pub fn claim_seed(&self) -> u64 {
        let prev = self
            .header()
            .seed_cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some((v % SEED_POOL_SIZE + 1) % SEED_POOL_SIZE)
            })
            .unwrap_or_else(|v| v);
        prev % SEED_POOL_SIZE
    }

    /// Current value of the seed cursor.
    pub fn seed_cursor(&self) -> u64 {
        self.header().seed_cursor.load(Ordering::Acquire)
    }

    /// Sets or clears the reset flag of a slot.
    pub fn set_reset(&self, index: usize, on: bool) {
        self.reset_flags()[index].store(on as u8, Ordering::Release);
    }

    /// Whether the reset flag of a slot is set.
    pub fn reset_requested(&self, index: usize) -> bool {
        self.reset_flags()[index].load(Ordering::Acquire) != 0
    }

    /// Writes the whole action buffer, `N * H * A` values in (env, step, component) order.
    pub fn write_actions(&mut self, actions: &[f64]) -> Result<()> {
        let expected = self.shape.n_envs * self.shape.action_row_len();
        if actions.len() != expected {
            return Err(PoolError::LayoutMismatch(format!(
                "{} actions given, buffer holds {}",
                actions.len(),
                expected
            ))
            .into());
        }
        let start = self.shape.actions_offset();
        let area = &mut self.mmap[start..start + expected * F64];
        for (chunk, v) in area.chunks_exact_mut(F64).zip(actions) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    /// Reads the action row of a slot, `H * A` values.
    pub fn read_actions(&self, index: usize) -> Vec<f64> {
        let row = self.shape.action_row_len() * F64;
        let start = self.shape.actions_offset() + index * row;
        self.mmap[start..start + row]
            .chunks_exact(F64)
            .map(|chunk| {
                let mut bytes = [0u8; F64];
                bytes.copy_from_slice(chunk);
                f64::from_le_bytes(bytes)
            })
            .collect()
    }

    /// Mutable result slot of a worker.
    pub fn result_slot_mut(&mut self, index: usize) -> &mut [u8] {
        let r = self.shape.record_size;
        let start = self.shape.results_offset() + index * r;
        &mut self.mmap[start..start + r]
    }

    /// Result slot of a worker.
    pub fn result_slot(&self, index: usize) -> &[u8] {
        let r = self.shape.record_size;
        let start = self.shape.results_offset() + index * r;
        &self.mmap[start..start + r]
    }

    /// Unmaps the region and deletes its file.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(&path).with_context(|| format!("removing shared region {:?}", path))
    }
}

/// Seed to carry over to the next pool, capped at [`SEED_PERSIST_CAP`].
pub fn persisted_seed(cursor: u64) -> u64 {
    if cursor > SEED_PERSIST_CAP {
        0
    } else {
        cursor
    }
}
