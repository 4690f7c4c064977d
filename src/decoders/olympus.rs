//! Olympus predictive RAW decompressor.
//!
//! Based on RawSpeed's OlympusDecompressor.cpp by:
//!   Klaus Post, Pedro Côrte-Real, Roman Lebedev
//! Licensed under LGPL-2.1+

use lazy_static::lazy_static;

use crate::decoders::basics::{BitPumpMSB, ByteStream, Endian};
use crate::decoders::image::{RawImage, View2DMut};
use crate::decoders::{DecompressError, Result};

const MAX_WIDTH: usize = 10400;
const MAX_HEIGHT: usize = 7792;

lazy_static! {
    // For a 12-bit index, the position of the first set bit of the 11-bit
    // window starting at the MSB; 12 when the window is all zero.
    static ref BITTABLE: [i8; 4096] = {
        let mut table = [12i8; 4096];
        for (i, entry) in table.iter_mut().enumerate() {
            for high in 0..12 {
                if (i >> (11 - high)) & 1 != 0 {
                    *entry = high as i8;
                    break;
                }
            }
        }
        table
    };
}

#[inline(always)]
fn num_active_bits(val: u16) -> u32 {
    16 - val.leading_zeros().min(16)
}

/// Decode one sample and update the carry triple for its column parity.
/// Returns the prediction residual.
#[inline(always)]
fn parse_carry(bits: &mut BitPumpMSB, carry: &mut [i32; 3]) -> Result<i32> {
    bits.fill();

    let nbits_bias: i32 = if carry[2] < 3 { 2 } else { 0 };
    let mut nbits = num_active_bits(carry[0] as u16) as i32 - nbits_bias;
    nbits = nbits.max(2 + nbits_bias);
    // A carry that survives three samples fits in 5 bits, so nbits stays
    // within [2, 14] for any stream a real encoder can emit.
    if nbits > 14 {
        return Err(DecompressError::InputRange(
            "predictor carry out of range".to_string(),
        ));
    }

    let b = bits.peek_bits_no_fill(15) as i32;
    let sign = -(b >> 14);
    let low = (b >> 12) & 3;
    let mut high = BITTABLE[(b & 0xfff) as usize] as i32;

    // Skip the bits matched above, or read the escape form.
    if high == 12 {
        bits.consume_bits_no_fill(15);
        high = (bits.get_bits_no_fill((16 - nbits) as u32) >> 1) as i32;
    } else {
        bits.consume_bits_no_fill((high + 1 + 3) as u32);
    }

    carry[0] = (high << nbits) | bits.get_bits_no_fill(nbits as u32) as i32;
    let diff = (carry[0] ^ sign) + carry[1];
    carry[1] = (diff * 3 + carry[1]) >> 5;
    carry[2] = if carry[0] > 16 { 0 } else { carry[2] + 1 };

    Ok((diff << 2) | low)
}

/// Predict a sample from neighbours two columns and two rows back, which
/// keeps the prediction within one CFA colour plane.
#[inline]
fn get_pred(out: &View2DMut<'_>, row: usize, col: usize) -> i32 {
    if row < 2 && col < 2 {
        return 0;
    }
    if row < 2 {
        return out.at(row, col - 2) as i32;
    }
    if col < 2 {
        return out.at(row - 2, col) as i32;
    }

    let left = out.at(row, col - 2) as i32;
    let up = out.at(row - 2, col) as i32;
    let left_up = out.at(row - 2, col - 2) as i32;

    let left_minus_nw = left - left_up;
    let up_minus_nw = up - left_up;

    // Gradients point in different directions and are both non-zero
    if (left_minus_nw < 0) != (up_minus_nw < 0) && left_minus_nw != 0 && up_minus_nw != 0 {
        if left_minus_nw.abs() > 32 || up_minus_nw.abs() > 32 {
            left + up_minus_nw
        } else {
            (left + up) >> 1
        }
    } else if left_minus_nw.abs() > up_minus_nw.abs() {
        left
    } else {
        up
    }
}

fn decompress_row(bits: &mut BitPumpMSB, out: &mut View2DMut<'_>, row: usize) -> Result<()> {
    let mut acarry = [[0i32; 3]; 2];

    let num_groups = out.width() / 2;
    for group in 0..num_groups {
        for c in 0..2 {
            let col = 2 * group + c;
            let diff = parse_carry(bits, &mut acarry[c])?;
            let pred = get_pred(out, row, col);
            out.set(row, col, (pred + diff) as u16);
        }
    }
    Ok(())
}

/// Decompress an Olympus payload into a pre-sized single-component image.
/// The payload carries 7 opaque prefix bytes followed by the bit stream.
///
/// The predictor consumes the previous two rows and columns of its own
/// output, so rows decode strictly in order and no parallelism is
/// possible.
pub fn decompress_olympus(img: &mut RawImage, input: &[u8]) -> Result<()> {
    if img.cpp() != 1 {
        return Err(DecompressError::Config(
            "expected a single component per pixel".to_string(),
        ));
    }
    let w = img.width();
    let h = img.height();
    if w % 2 != 0 || h % 2 != 0 || w > MAX_WIDTH || h > MAX_HEIGHT {
        return Err(DecompressError::InputRange(format!(
            "unexpected image dimensions ({}; {})", w, h
        )));
    }

    log::debug!("olympus: {}x{} image, {} payload bytes", w, h, input.len());

    let mut stream = ByteStream::new(input, Endian::Big);
    stream.skip_bytes(7)?;
    let mut bits = BitPumpMSB::new(stream.peek_remaining_buffer());

    let mut out = img.view_mut();
    for row in 0..h {
        decompress_row(&mut bits, &mut out, row)?;
        if bits.is_exhausted() {
            return Err(DecompressError::TruncatedBitstream);
        }
    }
    Ok(())
}
