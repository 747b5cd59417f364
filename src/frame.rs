use std::time::{Duration, Instant};

use crate::error::{CaptureError, CaptureResult};
use crate::region::{DirtyRect, Region};

/// Packed pixel layout of a frame buffer. Every format the damage path
/// understands is 4 bytes per pixel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    #[default]
    Xrgb8888,
    Argb8888,
    Xbgr8888,
    Abgr8888,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        4
    }
}

/// Metadata attached to each captured frame.
#[derive(Clone, Debug, Default)]
pub struct FrameMetadata {
    /// Monotonic timestamp taken when the backend finished producing
    /// the frame.
    pub capture_time: Option<Instant>,
    /// Time the backend spent producing the frame.
    pub capture_duration: Option<Duration>,
    /// Monotonic sequence number assigned by the producing backend.
    pub sequence: u64,
    /// Damage reported by the backend, if it has any. Passed to the damage
    /// refinery as a hint.
    ///
    /// The hint may over-report but must never miss a changed pixel: the
    /// refinery does not look at tiles outside it, so a change there stays
    /// unreported until a later hint or an unhinted refine covers it. Leave
    /// this `None` when the backend cannot guarantee a superset.
    pub damage_hint: Option<Region>,
}

/// A captured frame buffer.
///
/// Rows are `stride` bytes apart. When `y_inverted` is set the rows are
/// stored bottom to top, so logical row 0 is the last physical row.
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    y_inverted: bool,
    pub metadata: FrameMetadata,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> CaptureResult<Self> {
        let min_stride = row_len(width, format)?;
        if (stride as usize) < min_stride {
            return Err(CaptureError::InvalidConfig(format!(
                "stride {stride} is smaller than {min_stride} bytes needed for width {width}"
            )));
        }
        let expected = buffer_len(stride, height)?;
        if data.len() < expected {
            return Err(CaptureError::InvalidConfig(format!(
                "frame data length mismatch: got {}, expected at least {} for {}x{} stride {}",
                data.len(),
                expected,
                width,
                height,
                stride
            )));
        }

        Ok(Self {
            data,
            width,
            height,
            stride,
            format,
            y_inverted: false,
            metadata: FrameMetadata::default(),
        })
    }

    /// Tightly packed frame (`stride == width * 4`).
    pub fn from_packed(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> CaptureResult<Self> {
        let stride = u32::try_from(row_len(width, format)?)
            .map_err(|_| CaptureError::BufferOverflow)?;
        Self::new(width, height, stride, format, data)
    }

    /// Frame with every byte zeroed.
    pub fn zeroed(
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
    ) -> CaptureResult<Self> {
        let len = buffer_len(stride, height)?;
        Self::new(width, height, stride, format, vec![0; len])
    }

    pub fn with_y_inverted(mut self, y_inverted: bool) -> Self {
        self.y_inverted = y_inverted;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn is_y_inverted(&self) -> bool {
        self.y_inverted
    }

    pub fn bounds(&self) -> DirtyRect {
        DirtyRect::new(0, 0, self.width, self.height)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn physical_row(&self, y: u32) -> usize {
        if self.y_inverted {
            (self.height - 1 - y) as usize
        } else {
            y as usize
        }
    }

    /// Pixel bytes of logical row `y` (top to bottom), without the stride
    /// padding.
    ///
    /// Panics if `y >= height`.
    pub fn row(&self, y: u32) -> &[u8] {
        assert!(y < self.height, "row {y} out of range for height {}", self.height);
        let start = self.physical_row(y) * self.stride as usize;
        let len = self.width as usize * self.format.bytes_per_pixel() as usize;
        &self.data[start..start + len]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        assert!(y < self.height, "row {y} out of range for height {}", self.height);
        let start = self.physical_row(y) * self.stride as usize;
        let len = self.width as usize * self.format.bytes_per_pixel() as usize;
        &mut self.data[start..start + len]
    }

    /// Fill a rectangle given in logical coordinates with one packed pixel
    /// value. The rectangle is clamped to the frame.
    pub fn fill_rect(&mut self, rect: DirtyRect, pixel: u32) {
        let Some(rect) = rect.clamp(self.width, self.height) else {
            return;
        };
        let bpp = self.format.bytes_per_pixel() as usize;
        let bytes = pixel.to_le_bytes();
        for y in rect.y..rect.bottom() {
            let row = self.row_mut(y);
            for px in row[rect.x as usize * bpp..rect.right() as usize * bpp].chunks_exact_mut(bpp)
            {
                px.copy_from_slice(&bytes);
            }
        }
    }
}

fn row_len(width: u32, format: PixelFormat) -> CaptureResult<usize> {
    usize::try_from(width)
        .ok()
        .and_then(|w| w.checked_mul(format.bytes_per_pixel() as usize))
        .ok_or(CaptureError::BufferOverflow)
}

fn buffer_len(stride: u32, height: u32) -> CaptureResult<usize> {
    let s = usize::try_from(stride).map_err(|_| CaptureError::BufferOverflow)?;
    let h = usize::try_from(height).map_err(|_| CaptureError::BufferOverflow)?;
    s.checked_mul(h).ok_or(CaptureError::BufferOverflow)
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("y_inverted", &self.y_inverted)
            .field("data_len", &self.data.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}
