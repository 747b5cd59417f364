//! Rectangle-set geometry for damage tracking.
//!
//! [`DirtyRect`] is a single axis-aligned rectangle in output pixel
//! coordinates. [`Region`] is a set of non-overlapping rectangles kept in
//! canonical banded form: horizontal bands sorted top to bottom, each
//! holding x-sorted disjoint spans, with vertically adjacent bands that
//! have identical spans coalesced. Two regions that cover the same pixels
//! therefore compare equal.

use std::fmt;

/// A rectangle describing a dirty (changed) area of an output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DirtyRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DirtyRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Right edge (exclusive).
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Bottom edge (exclusive).
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn intersection(&self, other: &DirtyRect) -> Option<DirtyRect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if x >= right || y >= bottom {
            return None;
        }
        Some(DirtyRect {
            x,
            y,
            width: right - x,
            height: bottom - y,
        })
    }

    /// Clamp to an output of `width`x`height`, returning `None` when
    /// nothing remains.
    pub fn clamp(&self, width: u32, height: u32) -> Option<DirtyRect> {
        self.intersection(&DirtyRect::new(0, 0, width, height))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Span {
    left: u32,
    right: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Band {
    top: u32,
    bottom: u32,
    spans: Vec<Span>,
}

#[derive(Clone, Copy)]
enum RegionOp {
    Union,
    Intersect,
}

impl RegionOp {
    #[inline(always)]
    fn apply(self, in_a: bool, in_b: bool) -> bool {
        match self {
            Self::Union => in_a || in_b,
            Self::Intersect => in_a && in_b,
        }
    }
}

/// A set of non-overlapping rectangles.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Region {
    bands: Vec<Band>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: DirtyRect) -> Self {
        let mut region = Self::new();
        region.union_rect(rect);
        region
    }

    pub fn from_rects<I>(rects: I) -> Self
    where
        I: IntoIterator<Item = DirtyRect>,
    {
        let mut region = Self::new();
        for rect in rects {
            region.union_rect(rect);
        }
        region
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn clear(&mut self) {
        self.bands.clear();
    }

    pub fn union_rect(&mut self, rect: DirtyRect) {
        if rect.is_empty() {
            return;
        }
        let other = Self::single(rect);
        self.bands = combine(&self.bands, &other.bands, RegionOp::Union);
    }

    pub fn union(&mut self, other: &Region) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.bands = other.bands.clone();
            return;
        }
        self.bands = combine(&self.bands, &other.bands, RegionOp::Union);
    }

    pub fn intersect_rect(&mut self, rect: DirtyRect) {
        if rect.is_empty() {
            self.clear();
            return;
        }
        let other = Self::single(rect);
        self.bands = combine(&self.bands, &other.bands, RegionOp::Intersect);
    }

    pub fn intersect(&mut self, other: &Region) {
        self.bands = combine(&self.bands, &other.bands, RegionOp::Intersect);
    }

    /// Whether any pixel of `rect` is covered by this region.
    pub fn intersects_rect(&self, rect: &DirtyRect) -> bool {
        if rect.is_empty() {
            return false;
        }
        let (top, bottom) = (rect.y, rect.bottom());
        let (left, right) = (rect.x, rect.right());
        self.bands
            .iter()
            .skip_while(|band| band.bottom <= top)
            .take_while(|band| band.top < bottom)
            .any(|band| {
                band.spans
                    .iter()
                    .any(|span| span.left < right && left < span.right)
            })
    }

    pub fn contains_point(&self, x: u32, y: u32) -> bool {
        self.intersects_rect(&DirtyRect::new(x, y, 1, 1))
    }

    /// Bounding box of the region.
    pub fn extents(&self) -> Option<DirtyRect> {
        let first = self.bands.first()?;
        let last = self.bands.last()?;
        let left = self
            .bands
            .iter()
            .filter_map(|band| band.spans.first())
            .map(|span| span.left)
            .min()?;
        let right = self
            .bands
            .iter()
            .filter_map(|band| band.spans.last())
            .map(|span| span.right)
            .max()?;
        Some(DirtyRect::new(
            left,
            first.top,
            right - left,
            last.bottom - first.top,
        ))
    }

    /// Number of pixels covered.
    pub fn area(&self) -> u64 {
        self.bands
            .iter()
            .map(|band| {
                let height = u64::from(band.bottom - band.top);
                band.spans
                    .iter()
                    .map(|span| u64::from(span.right - span.left) * height)
                    .sum::<u64>()
            })
            .sum()
    }

    /// The region's rectangles, one per span per band, sorted by y then x.
    pub fn rects(&self) -> impl Iterator<Item = DirtyRect> + '_ {
        self.bands.iter().flat_map(|band| {
            band.spans.iter().map(move |span| {
                DirtyRect::new(
                    span.left,
                    band.top,
                    span.right - span.left,
                    band.bottom - band.top,
                )
            })
        })
    }

    pub fn rect_count(&self) -> usize {
        self.bands.iter().map(|band| band.spans.len()).sum()
    }

    fn single(rect: DirtyRect) -> Self {
        Self {
            bands: vec![Band {
                top: rect.y,
                bottom: rect.bottom(),
                spans: vec![Span {
                    left: rect.x,
                    right: rect.right(),
                }],
            }],
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.rects()).finish()
    }
}

/// Builds a [`Region`] from rows of spans pushed in ascending `top` order.
///
/// Rows must not overlap vertically. Used by the damage refinery to emit a
/// whole tile grid without re-running the general combine per tile.
#[derive(Default)]
pub(crate) struct RegionBuilder {
    bands: Vec<Band>,
    row: Vec<Span>,
}

impl RegionBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Extend the pending row with `[left, right)`, merging with the
    /// previous span when they touch. Spans must arrive left to right.
    pub(crate) fn push_span(&mut self, left: u32, right: u32) {
        if left >= right {
            return;
        }
        match self.row.last_mut() {
            Some(last) if last.right >= left => last.right = last.right.max(right),
            _ => self.row.push(Span { left, right }),
        }
    }

    /// Close the pending row as a band spanning `[top, bottom)`.
    pub(crate) fn finish_row(&mut self, top: u32, bottom: u32) {
        if self.row.is_empty() || top >= bottom {
            self.row.clear();
            return;
        }
        let spans = std::mem::take(&mut self.row);
        push_band(&mut self.bands, top, bottom, spans);
    }

    pub(crate) fn build(self) -> Region {
        Region { bands: self.bands }
    }
}

fn push_band(bands: &mut Vec<Band>, top: u32, bottom: u32, spans: Vec<Span>) {
    match bands.last_mut() {
        Some(last) if last.bottom == top && last.spans == spans => last.bottom = bottom,
        _ => bands.push(Band { top, bottom, spans }),
    }
}

fn combine(a: &[Band], b: &[Band], op: RegionOp) -> Vec<Band> {
    let mut edges: Vec<u32> = a
        .iter()
        .chain(b)
        .flat_map(|band| [band.top, band.bottom])
        .collect();
    edges.sort_unstable();
    edges.dedup();

    let mut out = Vec::new();
    let (mut ia, mut ib) = (0usize, 0usize);
    for pair in edges.windows(2) {
        let (top, bottom) = (pair[0], pair[1]);
        while ia < a.len() && a[ia].bottom <= top {
            ia += 1;
        }
        while ib < b.len() && b[ib].bottom <= top {
            ib += 1;
        }
        let spans_a = a
            .get(ia)
            .filter(|band| band.top <= top)
            .map_or(&[][..], |band| band.spans.as_slice());
        let spans_b = b
            .get(ib)
            .filter(|band| band.top <= top)
            .map_or(&[][..], |band| band.spans.as_slice());

        let spans = combine_spans(spans_a, spans_b, op);
        if !spans.is_empty() {
            push_band(&mut out, top, bottom, spans);
        }
    }
    out
}

fn combine_spans(a: &[Span], b: &[Span], op: RegionOp) -> Vec<Span> {
    if a.is_empty() && b.is_empty() {
        return Vec::new();
    }
    let mut edges: Vec<u32> = a
        .iter()
        .chain(b)
        .flat_map(|span| [span.left, span.right])
        .collect();
    edges.sort_unstable();
    edges.dedup();

    let mut out: Vec<Span> = Vec::new();
    let (mut ia, mut ib) = (0usize, 0usize);
    for pair in edges.windows(2) {
        let (left, right) = (pair[0], pair[1]);
        while ia < a.len() && a[ia].right <= left {
            ia += 1;
        }
        while ib < b.len() && b[ib].right <= left {
            ib += 1;
        }
        let in_a = a.get(ia).is_some_and(|span| span.left <= left);
        let in_b = b.get(ib).is_some_and(|span| span.left <= left);
        if !op.apply(in_a, in_b) {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.right == left => last.right = right,
            _ => out.push(Span { left, right }),
        }
    }
    out
}
