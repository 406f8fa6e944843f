//! CPU mirror of one data texture.
//!
//! Layout: `TEXTURE_ROW_WIDTH` texels per row, rows appended as records
//! grow. A record is `texels_per_record` consecutive texels; record `i`
//! starts at texel `i * texels_per_record`, i.e. at
//! `(t % ROW_WIDTH, t / ROW_WIDTH)`. The backing store is always whole rows,
//! so any dirty region is a contiguous byte slice.

use crate::config::{TEXTURE_MAX_ROWS, TEXTURE_ROW_WIDTH};
use crate::error::{DtxError, Resource, Result};
use crate::sink::{TableKind, TexelFormat, TexelRegion, TextureDesc};
use bytemuck::Pod;
use std::ops::Range;

const W: u32 = TEXTURE_ROW_WIDTH;

/// Pending texel ranges of a built table.
#[derive(Debug, Default)]
struct DirtyTracker {
    tracking: bool,
    deferred: bool,
    ranges: Vec<Range<u32>>,
}

impl DirtyTracker {
    fn mark(&mut self, r: Range<u32>) {
        if !self.tracking || r.is_empty() {
            return;
        }

        if self.deferred {
            // One bounding range per table until commit.
            let start = self.ranges.iter().map(|x| x.start).fold(r.start, u32::min);
            let end = self.ranges.iter().map(|x| x.end).fold(r.end, u32::max);
            self.ranges.clear();
            self.ranges.push(start..end);
            return;
        }

        if let Some(last) = self.ranges.last_mut() {
            if r.start <= last.end && last.start <= r.end {
                last.start = last.start.min(r.start);
                last.end = last.end.max(r.end);
                return;
            }
        }
        self.ranges.push(r);
    }
}

/// Smallest rectangle covering texels `r`: a span of one row, or whole rows.
fn region_of(r: &Range<u32>) -> TexelRegion {
    let (first, last) = (r.start / W, (r.end - 1) / W);
    if first == last {
        TexelRegion {
            x: r.start % W,
            y: first,
            width: r.end - r.start,
            height: 1,
        }
    } else {
        TexelRegion {
            x: 0,
            y: first,
            width: W,
            height: last - first + 1,
        }
    }
}

#[derive(Debug)]
pub struct DataTexture {
    kind: TableKind,
    format: TexelFormat,
    texels_per_record: u32,
    /// Word-backed so typed views of any scalar stay aligned.
    words: Vec<u32>,
    records: u32,
    dirty: DirtyTracker,
}

impl DataTexture {
    pub fn new(kind: TableKind, format: TexelFormat, texels_per_record: u32) -> Self {
        debug_assert!(matches!(format.channels, 1 | 2 | 4));
        Self {
            kind,
            format,
            texels_per_record,
            words: Vec::new(),
            records: 0,
            dirty: DirtyTracker::default(),
        }
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn format(&self) -> TexelFormat {
        self.format
    }

    pub fn texels_per_record(&self) -> u32 {
        self.texels_per_record
    }

    /// Records appended so far.
    pub fn len(&self) -> u32 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn rows(&self) -> u32 {
        let row_words = self.row_bytes() / 4;
        (self.words.len() / row_words) as u32
    }

    /// Records the table can hold at `TEXTURE_MAX_ROWS`.
    pub fn max_records(&self) -> u64 {
        (W as u64 * TEXTURE_MAX_ROWS as u64) / self.texels_per_record as u64
    }

    fn row_bytes(&self) -> usize {
        W as usize * self.format.bytes_per_texel() as usize
    }

    fn record_bytes(&self) -> usize {
        self.texels_per_record as usize * self.format.bytes_per_texel() as usize
    }

    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words)
    }

    fn check_scalar<T: Pod>(&self) {
        debug_assert_eq!(
            std::mem::size_of::<T>(),
            self.format.scalar.size() as usize,
            "{}: scalar size mismatch",
            self.kind
        );
    }

    /// Grows the backing store to hold `records` records.
    fn ensure(&mut self, records: u64) -> Result<()> {
        let texels = records * self.texels_per_record as u64;
        let rows = texels.div_ceil(W as u64);
        if rows > TEXTURE_MAX_ROWS as u64 {
            return Err(DtxError::capacity(
                Resource::TableRows,
                rows,
                TEXTURE_MAX_ROWS as u64,
            ));
        }

        let words = rows as usize * self.row_bytes() / 4;
        if words > self.words.len() {
            self.words.resize(words, 0);
        }
        Ok(())
    }

    /// Appends whole records; returns the index of the first one.
    pub fn append<T: Pod>(&mut self, values: &[T]) -> Result<u32> {
        self.check_scalar::<T>();
        let src: &[u8] = bytemuck::cast_slice(values);
        let record_bytes = self.record_bytes();
        debug_assert_eq!(src.len() % record_bytes, 0, "{}: partial record", self.kind);

        let first = self.records;
        let added = (src.len() / record_bytes) as u64;
        self.ensure(first as u64 + added)?;

        let start = first as usize * record_bytes;
        self.bytes_mut()[start..start + src.len()].copy_from_slice(src);
        self.records += added as u32;
        Ok(first)
    }

    /// Appends `n` zero records.
    pub fn append_zeroed(&mut self, n: u32) -> Result<u32> {
        let first = self.records;
        self.ensure(first as u64 + n as u64)?;
        self.records += n;
        Ok(first)
    }

    /// Overwrites texels starting at texel `texel` of record `record`.
    pub fn write<T: Pod>(&mut self, record: u32, texel: u32, values: &[T]) -> Result<()> {
        self.check_scalar::<T>();
        let src: &[u8] = bytemuck::cast_slice(values);
        let bpt = self.format.bytes_per_texel() as usize;
        let texels = src.len().div_ceil(bpt) as u32;

        if record >= self.records || texel + texels > self.texels_per_record {
            return Err(DtxError::state(format!(
                "{}: write outside record {record} (len {})",
                self.kind, self.records
            )));
        }

        let first = record * self.texels_per_record + texel;
        let start = first as usize * bpt;
        self.bytes_mut()[start..start + src.len()].copy_from_slice(src);
        self.dirty.mark(first..first + texels);
        Ok(())
    }

    /// Typed view of `texels` texels of record `record`, from texel `texel`.
    pub fn read<T: Pod>(&self, record: u32, texel: u32, texels: u32) -> &[T] {
        self.check_scalar::<T>();
        let bpt = self.format.bytes_per_texel() as usize;
        let start = (record * self.texels_per_record + texel) as usize * bpt;
        bytemuck::cast_slice(&self.bytes()[start..start + texels as usize * bpt])
    }

    pub fn desc(&self, layer_label: &str) -> TextureDesc {
        TextureDesc {
            kind: self.kind,
            label: format!("{layer_label}/{}", self.kind),
            format: self.format,
            width: W,
            height: self.rows().max(1),
        }
    }

    /// Switches on dirty tracking; called once the table has been uploaded.
    pub fn start_tracking(&mut self) {
        self.dirty.tracking = true;
        self.dirty.ranges.clear();
    }

    pub fn set_deferred(&mut self, deferred: bool) {
        self.dirty.deferred = deferred;
    }

    pub fn has_pending(&self) -> bool {
        !self.dirty.ranges.is_empty()
    }

    /// Drains pending regions.
    pub fn take_regions(&mut self) -> Vec<TexelRegion> {
        self.dirty.ranges.drain(..).map(|r| region_of(&r)).collect()
    }

    /// Pending regions, oldest first, left in place until `complete`.
    pub fn pending_regions(&self) -> Vec<TexelRegion> {
        self.dirty.ranges.iter().map(region_of).collect()
    }

    /// Drops the first `n` pending regions once they have been written.
    pub fn complete(&mut self, n: usize) {
        let n = n.min(self.dirty.ranges.len());
        self.dirty.ranges.drain(..n);
    }

    /// Bytes of `region`, tightly packed.
    pub fn region_bytes(&self, region: &TexelRegion) -> &[u8] {
        let bpt = self.format.bytes_per_texel() as usize;
        let start = (region.y as usize * W as usize + region.x as usize) * bpt;
        let len = region.width as usize * region.height as usize * bpt;
        &self.bytes()[start..start + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Scalar;

    fn attributes() -> DataTexture {
        DataTexture::new(TableKind::Attributes, TexelFormat::new(Scalar::U8, 4), 8)
    }

    #[test]
    fn append_pads_to_whole_rows() {
        let mut t = DataTexture::new(TableKind::Positions, TexelFormat::new(Scalar::U16, 4), 1);
        let first = t.append(&[1u16, 2, 3, 0, 4, 5, 6, 0]).unwrap();

        assert_eq!(first, 0);
        assert_eq!(t.len(), 2);
        assert_eq!(t.rows(), 1);
        assert_eq!(t.bytes().len(), 1024 * 8);
        assert_eq!(t.read::<u16>(1, 0, 1), &[4, 5, 6, 0]);

        t.append_zeroed(1023).unwrap();
        assert_eq!(t.rows(), 2);
    }

    #[test]
    fn overflow_is_a_capacity_error() {
        let mut t = attributes();
        let max = t.max_records() as u32;
        t.append_zeroed(max).unwrap();

        let err = t.append_zeroed(1).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::CapacityExceeded);
        assert_eq!(t.len(), max);
    }

    #[test]
    fn writes_before_build_are_not_tracked() {
        let mut t = attributes();
        t.append_zeroed(4).unwrap();
        t.write(1, 2, &[1u8, 2, 3, 4]).unwrap();
        assert!(!t.has_pending());
        assert_eq!(t.read::<u8>(1, 2, 1), &[1, 2, 3, 4]);
    }

    #[test]
    fn each_write_is_its_own_region() {
        let mut t = attributes();
        t.append_zeroed(300).unwrap();
        t.start_tracking();

        t.write(0, 2, &[1u8; 4]).unwrap();
        t.write(200, 2, &[1u8; 4]).unwrap();

        let regions = t.take_regions();
        assert_eq!(
            regions,
            vec![
                TexelRegion { x: 2, y: 0, width: 1, height: 1 },
                TexelRegion { x: 578, y: 1, width: 1, height: 1 },
            ]
        );
        assert!(!t.has_pending());
        assert_eq!(t.region_bytes(&regions[1]), &[1, 1, 1, 1]);
    }

    #[test]
    fn deferred_writes_coalesce() {
        let mut t = attributes();
        t.append_zeroed(300).unwrap();
        t.start_tracking();
        t.set_deferred(true);

        for row in [3, 250, 17, 140] {
            t.write(row, 2, &[9u8; 4]).unwrap();
        }

        let regions = t.take_regions();
        assert_eq!(regions.len(), 1);
        // Texels 26..2003 span rows 0 and 1.
        assert_eq!(regions[0], TexelRegion { x: 0, y: 0, width: 1024, height: 2 });
        assert_eq!(t.region_bytes(&regions[0]).len(), 2 * 1024 * 4);
    }

    #[test]
    fn write_outside_records_fails() {
        let mut t = attributes();
        t.append_zeroed(1).unwrap();
        assert!(t.write(1, 0, &[0u8; 4]).is_err());
        assert!(t.write(0, 7, &[0u8; 8]).is_err());
    }
}
