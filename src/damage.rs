//! Tile-granular damage detection.
//!
//! The output is divided into 32x32 tiles. [`DamageRefinery`] keeps one
//! content hash per tile in a [`TileHashStore`] and, for each captured
//! frame, reports the tiles whose hash changed since the previous call.
//!
//! The store starts zeroed, so the first refine reports the whole frame.

use rayon::prelude::*;
use tracing::trace;

use crate::error::{CaptureError, CaptureResult};
use crate::frame::Frame;
use crate::hash::chained_rows_hash;
use crate::parallel::{install_refine_pool, should_parallelize_refine};
use crate::region::{DirtyRect, Region, RegionBuilder};

/// Edge length of a damage tile in pixels.
pub const TILE_SIZE: u32 = 32;

/// One content hash per tile, sized for a fixed output resolution.
#[derive(Clone, Debug)]
pub struct TileHashStore {
    width: u32,
    height: u32,
    tiles_x: u32,
    tiles_y: u32,
    hashes: Vec<u32>,
}

impl TileHashStore {
    pub fn new(width: u32, height: u32) -> CaptureResult<Self> {
        if width == 0 || height == 0 {
            return Err(CaptureError::InvalidConfig(format!(
                "tile hash store needs a non-empty output, got {width}x{height}"
            )));
        }
        let tiles_x = width.div_ceil(TILE_SIZE);
        let tiles_y = height.div_ceil(TILE_SIZE);
        let count = (tiles_x as usize)
            .checked_mul(tiles_y as usize)
            .ok_or(CaptureError::BufferOverflow)?;

        let mut hashes = Vec::new();
        hashes
            .try_reserve_exact(count)
            .map_err(|_| CaptureError::BufferOverflow)?;
        hashes.resize(count, 0);

        Ok(Self {
            width,
            height,
            tiles_x,
            tiles_y,
            hashes,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Tile grid size as (columns, rows).
    pub fn grid(&self) -> (u32, u32) {
        (self.tiles_x, self.tiles_y)
    }

    pub fn tile_count(&self) -> usize {
        self.hashes.len()
    }

    pub fn hash(&self, tx: u32, ty: u32) -> u32 {
        self.hashes[self.index(tx, ty)]
    }

    /// Store `hash` for a tile, returning whether it differed from the
    /// previous value.
    fn replace(&mut self, tx: u32, ty: u32, hash: u32) -> bool {
        let index = self.index(tx, ty);
        let slot = &mut self.hashes[index];
        if *slot == hash {
            return false;
        }
        *slot = hash;
        true
    }

    /// Zero every hash so the next refine reports the whole output.
    pub fn reset(&mut self) {
        self.hashes.fill(0);
    }

    fn index(&self, tx: u32, ty: u32) -> usize {
        assert!(
            tx < self.tiles_x && ty < self.tiles_y,
            "tile ({tx}, {ty}) outside {}x{} grid",
            self.tiles_x,
            self.tiles_y
        );
        tx as usize + ty as usize * self.tiles_x as usize
    }
}

/// Grid-aligned rectangle of tile `(tx, ty)`, not clamped to the output.
pub fn tile_rect(tx: u32, ty: u32) -> DirtyRect {
    DirtyRect::new(
        tx.saturating_mul(TILE_SIZE),
        ty.saturating_mul(TILE_SIZE),
        TILE_SIZE,
        TILE_SIZE,
    )
}

fn hash_tile(frame: &Frame, tx: u32, ty: u32) -> u32 {
    let bpp = frame.format().bytes_per_pixel() as usize;
    let x_start = tx * TILE_SIZE;
    let x_stop = x_start.saturating_add(TILE_SIZE).min(frame.width());
    let y_start = ty * TILE_SIZE;
    let y_stop = y_start.saturating_add(TILE_SIZE).min(frame.height());
    let (lo, hi) = (x_start as usize * bpp, x_stop as usize * bpp);

    chained_rows_hash((y_start..y_stop).map(|y| &frame.row(y)[lo..hi]))
}

/// Hash every tile in row `ty`, leaving `None` for tiles the hint rules out.
fn hash_tile_row(frame: &Frame, ty: u32, hint: Option<&Region>, out: &mut [Option<u32>]) {
    for (tx, slot) in out.iter_mut().enumerate() {
        let tx = tx as u32;
        *slot = match hint {
            Some(hint) if !hint.intersects_rect(&tile_rect(tx, ty)) => None,
            _ => Some(hash_tile(frame, tx, ty)),
        };
    }
}

/// Turns captured frames into damaged regions.
///
/// A refinery is bound to one output resolution. When the output is
/// resized, drop it and create a new one.
#[derive(Debug)]
pub struct DamageRefinery {
    store: TileHashStore,
    scratch: Vec<Option<u32>>,
}

impl DamageRefinery {
    pub fn new(width: u32, height: u32) -> CaptureResult<Self> {
        let store = TileHashStore::new(width, height)?;
        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(store.tile_count())
            .map_err(|_| CaptureError::BufferOverflow)?;
        Ok(Self { store, scratch })
    }

    pub fn width(&self) -> u32 {
        self.store.width
    }

    pub fn height(&self) -> u32 {
        self.store.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.store.width, self.store.height)
    }

    pub fn hash_store(&self) -> &TileHashStore {
        &self.store
    }

    /// Forget all stored hashes. The next refine reports the full frame.
    pub fn invalidate(&mut self) {
        self.store.reset();
    }

    /// Union the tiles of `frame` that changed since the previous call into
    /// `damage`, then clip `damage` to the frame bounds. Returns the number
    /// of tiles that changed.
    ///
    /// `hint` is an optional damage region that must contain every changed
    /// pixel (see [`FrameMetadata::damage_hint`]). Tiles that do not touch it
    /// are assumed unchanged and are neither hashed nor updated. Pass `None`
    /// when no such guarantee exists.
    ///
    /// [`FrameMetadata::damage_hint`]: crate::frame::FrameMetadata::damage_hint
    ///
    /// # Panics
    ///
    /// Panics if the frame's dimensions differ from the refinery's.
    pub fn refine(&mut self, damage: &mut Region, hint: Option<&Region>, frame: &Frame) -> usize {
        let (tiles_x, tiles_y) = self.store.grid();
        let parallel = should_parallelize_refine(tiles_y as usize, tiles_x as usize);
        self.refine_with(damage, hint, frame, parallel)
    }

    fn refine_with(
        &mut self,
        damage: &mut Region,
        hint: Option<&Region>,
        frame: &Frame,
        parallel: bool,
    ) -> usize {
        assert!(
            frame.width() == self.store.width && frame.height() == self.store.height,
            "damage refinery is {}x{} but frame is {}x{}; re-create it on resize",
            self.store.width,
            self.store.height,
            frame.width(),
            frame.height()
        );

        let (tiles_x, tiles_y) = self.store.grid();
        let row_len = tiles_x as usize;
        self.scratch.clear();
        self.scratch.resize(self.store.tile_count(), None);

        if parallel {
            let scratch = &mut self.scratch;
            install_refine_pool(|| {
                scratch
                    .par_chunks_mut(row_len)
                    .enumerate()
                    .for_each(|(ty, row)| hash_tile_row(frame, ty as u32, hint, row));
            });
        } else {
            for (ty, row) in self.scratch.chunks_mut(row_len).enumerate() {
                hash_tile_row(frame, ty as u32, hint, row);
            }
        }

        let mut builder = RegionBuilder::new();
        let mut changed = 0usize;
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let Some(hash) = self.scratch[tx as usize + ty as usize * row_len] else {
                    continue;
                };
                if self.store.replace(tx, ty, hash) {
                    let left = tx * TILE_SIZE;
                    builder.push_span(left, left.saturating_add(TILE_SIZE));
                    changed += 1;
                }
            }
            let top = ty * TILE_SIZE;
            builder.finish_row(top, top.saturating_add(TILE_SIZE));
        }

        damage.union(&builder.build());
        damage.intersect_rect(frame.bounds());

        trace!(
            width = frame.width(),
            height = frame.height(),
            changed_tiles = changed,
            total_tiles = self.store.tile_count(),
            parallel,
            "refined frame damage"
        );
        changed
    }
}
