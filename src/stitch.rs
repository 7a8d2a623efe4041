//! Stitch buffer.
//!
//! A 16-byte scratch region that holds the start of a scalar straddling a
//! medium-refill boundary, so BFCR can decode it once the rest of its bits
//! have arrived. 16 bytes comfortably covers the widest supported scalar
//! (a 64-bit integer or float) plus slack for its sub-byte starting
//! alignment.

use crate::bitbuffer::{copy_bits, read_bits_at};
use crate::fieldclass::ByteOrder;

const STITCH_BYTES: usize = 16;

#[derive(Clone, Debug)]
pub struct StitchBuffer {
    bytes: [u8; STITCH_BYTES],
    /// Bit offset within `bytes` where the scalar's first bit lives —
    /// chosen to match the field's alignment so the eventual decode sees
    /// the same sub-byte position it would have in the original buffer.
    offset_bits: u64,
    /// How many bits of the target scalar have been copied in so far.
    accumulated_bits: u64,
    /// Total width of the scalar being stitched.
    target_bits: u64,
}

impl Default for StitchBuffer {
    fn default() -> Self {
        Self {
            bytes: [0; STITCH_BYTES],
            offset_bits: 0,
            accumulated_bits: 0,
            target_bits: 0,
        }
    }
}

impl StitchBuffer {
    /// Begins stitching a scalar of `target_bits` width whose first bit
    /// will land at `offset_bits` within the scratch buffer.
    pub fn begin(&mut self, offset_bits: u64, target_bits: u64) {
        debug_assert!(offset_bits + target_bits <= (STITCH_BYTES as u64) * 8);
        self.bytes = [0; STITCH_BYTES];
        self.offset_bits = offset_bits;
        self.accumulated_bits = 0;
        self.target_bits = target_bits;
    }

    /// Copies `count` more raw bits from `src` (starting at `src_start`)
    /// into the scratch buffer, continuing where the last copy left off.
    pub fn append_from(&mut self, src: &[u8], src_start: u64, count: u64) {
        let dst_start = self.offset_bits + self.accumulated_bits;
        copy_bits(src, src_start, &mut self.bytes, dst_start, count);
        self.accumulated_bits += count;
    }

    pub fn is_complete(&self) -> bool {
        self.accumulated_bits >= self.target_bits
    }

    pub fn bits_remaining(&self) -> u64 {
        self.target_bits.saturating_sub(self.accumulated_bits)
    }

    /// Decodes the assembled scalar once [`is_complete`] is true.
    pub fn decode(&self, byte_order: ByteOrder) -> u64 {
        debug_assert!(self.is_complete());
        read_bits_at(&self.bytes, self.offset_bits, self.target_bits as u8, byte_order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stitches_a_scalar_split_across_two_refills() {
        // 32-bit LE value 0xDEADBEEF split 12 bits / 20 bits across two buffers.
        let whole = 0xDEAD_BEEFu32.to_le_bytes();
        let mut stitch = StitchBuffer::default();
        stitch.begin(0, 32);
        stitch.append_from(&whole, 0, 12);
        stitch.append_from(&whole, 12, 20);
        assert!(stitch.is_complete());
        assert_eq!(stitch.decode(ByteOrder::LittleEndian), 0xDEAD_BEEF);
    }

    #[test]
    fn stitches_with_nonzero_start_offset() {
        // Field starts at bit 4 of the source byte stream.
        let mut src = vec![0u8; 5];
        crate::bitbuffer::copy_bits(&0xABCDu16.to_le_bytes(), 0, &mut src, 4, 16);

        let mut stitch = StitchBuffer::default();
        stitch.begin(4, 16);
        stitch.append_from(&src, 4, 8);
        stitch.append_from(&src, 12, 8);
        assert!(stitch.is_complete());
        assert_eq!(stitch.decode(ByteOrder::LittleEndian), 0xABCD);
    }
}
