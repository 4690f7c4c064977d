//! Fuji compressed RAF decompressor.
//!
//! Based on RawSpeed's FujiDecompressor.cpp by:
//!   Alexey Danilchenko, Alex Tutubalin, Uwe Müssel, Roman Lebedev
//! Licensed under LGPL-2.1+

use rayon::prelude::*;

use crate::decoders::basics::{BitPumpMSB, ByteStream, Endian};
use crate::decoders::image::RawImage;
use crate::decoders::{DecompressError, Result};

// Line buffer row indices (18 total = 5R + 8G + 5B)
const R0: usize = 0;
const R2: usize = 2;
const R4: usize = 4;
const G0: usize = 5;
const G2: usize = 7;
const G7: usize = 12;
const B0: usize = 13;
const B2: usize = 15;
const B4: usize = 17;
const LTOTAL: usize = 18;

// Per-row color assignments (RGGB CFA applied to 6 rows):
// Row 0: R→R2, G→G2 | Row 1: G→G3, B→B2 | Row 2: R→R3, G→G4
// Row 3: G→G5, B→B3 | Row 4: R→R4, G→G6 | Row 5: G→G7, B→B4
const ROW_LINES: [(usize, usize); 6] = [
    (R2, G2), (G2+1, B2), (R2+1, G2+2),
    (G2+3, B2+1), (R2+2, G2+4), (G2+5, B2+2),
];

// After each row: which colors to extend (0=R, 1=G, 2=B)
const ROW_EXTENDS: [(usize, usize); 6] = [
    (0, 1), (1, 2), (0, 1), (1, 2), (0, 1), (1, 2),
];

// X-Trans CFA at phase (0,0) — must match the sensor layout.
// 0=R, 1=G, 2=B
const XTRANS_CFA: [[u8; 6]; 6] = [
    [1, 1, 0, 1, 1, 2],  // G G R G G B
    [1, 1, 2, 1, 1, 0],  // G G B G G R
    [2, 0, 1, 0, 2, 1],  // B R G R B G
    [1, 1, 2, 1, 1, 0],  // G G B G G R
    [1, 1, 0, 1, 1, 2],  // G G R G G B
    [0, 2, 1, 2, 0, 1],  // R B G B R G
];

// Bayer CFA, RGGB phase
const BAYER_CFA: [[u8; 2]; 2] = [
    [0, 1],
    [1, 2],
];

// Color line ranges: (start, count) for R, G, B
const COLOR_RANGES: [(usize, usize); 3] = [(R0, 5), (G0, 8), (B0, 5)];

const FUJI_SIGNATURE: u16 = 0x4953;

// ---------------------------------------------------------------------------
// Fuji header
// ---------------------------------------------------------------------------
#[derive(Clone, Debug)]
struct FujiHeader {
    signature: u16,
    version: u8,
    raw_type: u8,
    raw_bits: u32,
    raw_height: usize,
    raw_rounded_width: usize,
    raw_width: usize,
    block_size: usize,
    blocks_in_row: usize,
    total_lines: usize,
    // minimum coded unit, (x, y)
    mcu: (usize, usize),
}

impl FujiHeader {
    fn parse(stream: &mut ByteStream<'_>) -> Result<FujiHeader> {
        let signature = stream.get_u16()?;
        let version = stream.get_u8()?;
        let raw_type = stream.get_u8()?;
        let raw_bits = stream.get_u8()? as u32;
        let raw_height = stream.get_u16()? as usize;
        let raw_rounded_width = stream.get_u16()? as usize;
        let raw_width = stream.get_u16()? as usize;
        let block_size = stream.get_u16()? as usize;
        let blocks_in_row = stream.get_u8()? as usize;
        let total_lines = stream.get_u16()? as usize;
        let mcu = if raw_type == 0 { (2, 6) } else { (1, 6) };
        Ok(FujiHeader {
            signature, version, raw_type, raw_bits, raw_height,
            raw_rounded_width, raw_width, block_size, blocks_in_row,
            total_lines, mcu,
        })
    }

    fn is_valid(&self) -> bool {
        self.signature == FUJI_SIGNATURE
            && self.version <= 1
            && (self.raw_bits == 12 || self.raw_bits == 14 || self.raw_bits == 16)
            && self.raw_height > 0
            && self.raw_width > 0
            && self.block_size > 0
            && self.total_lines > 0
            && self.raw_height <= 6 * self.total_lines
            && self.raw_rounded_width >= self.raw_width
            && self.raw_rounded_width % self.block_size == 0
            && self.raw_rounded_width - self.raw_width < self.block_size
            && self.blocks_in_row == (self.raw_rounded_width + self.block_size - 1) / self.block_size
            && self.block_size % self.mcu.0 == 0
    }

    fn lossless(&self) -> bool {
        self.version == 1
    }

    fn is_xtrans(&self) -> bool {
        self.raw_type == 16
    }
}

// ---------------------------------------------------------------------------
// Quantization table (one per gradient level)
// ---------------------------------------------------------------------------
#[derive(Clone)]
struct FujiQTable {
    q_table: Vec<i8>,
    q_base: i32,
    raw_bits: i32,
    total_values: i32,
    max_grad: i32,
    q_grad_mult: i32,
}

// ---------------------------------------------------------------------------
// Fuji params
// ---------------------------------------------------------------------------
#[derive(Clone)]
struct FujiParams {
    qt: [FujiQTable; 4],  // qt[0] = main, qt[1..3] = lossy sub-tables
    max_bits: i32,
    min_value: i32,
    max_value: i32,
    line_width: usize,
    lossless: bool,
}

fn log2ceil(mut val: i32) -> i32 {
    let mut result = 0;
    val -= 1;
    if val > 0 {
        loop {
            result += 1;
            val >>= 1;
            if val == 0 { break; }
        }
    }
    result
}

fn setup_qlut(max_value: i32, qp: &[i32; 5]) -> Vec<i8> {
    let n = (2 * max_value + 1) as usize;
    let mut qt = vec![0i8; n];
    for (i, entry) in qt.iter_mut().enumerate() {
        let cur_val = i as i32 - max_value;
        *entry = if cur_val <= -qp[3] { -4 }
        else if cur_val <= -qp[2] { -3 }
        else if cur_val <= -qp[1] { -2 }
        else if cur_val < -qp[0] { -1 }
        else if cur_val <= qp[0] { 0 }
        else if cur_val < qp[1] { 1 }
        else if cur_val < qp[2] { 2 }
        else if cur_val < qp[3] { 3 }
        else { 4 };
    }
    qt
}

fn make_main_qtable(max_value: i32, q_base: i32) -> (FujiQTable, i32) {
    let max_val_p1 = max_value + 1;
    let mut qp = [0i32; 5];
    qp[0] = q_base;
    qp[1] = 3 * q_base + 0x12;
    qp[2] = 5 * q_base + 0x43;
    qp[3] = 7 * q_base + 0x114;
    qp[4] = max_value;
    if qp[1] >= max_val_p1 || qp[1] < q_base + 1 { qp[1] = q_base + 1; }
    if qp[2] < qp[1] || qp[2] >= max_val_p1 { qp[2] = qp[1]; }
    if qp[3] < qp[2] || qp[3] >= max_val_p1 { qp[3] = qp[2]; }

    let total_values = (qp[4] + 2 * q_base) / (2 * q_base + 1) + 1;
    let raw_bits = log2ceil(total_values);
    let max_bits = 4 * log2ceil(qp[4] + 1);
    let q_table = setup_qlut(max_value, &qp);

    (FujiQTable {
        q_table,
        q_base,
        raw_bits,
        total_values,
        max_grad: 0,
        q_grad_mult: 9,
    }, max_bits)
}

fn empty_qtable() -> FujiQTable {
    FujiQTable { q_table: Vec::new(), q_base: 0, raw_bits: 0, total_values: 0, max_grad: 0, q_grad_mult: 0 }
}

impl FujiParams {
    fn new(header: &FujiHeader) -> FujiParams {
        let line_width = (header.block_size * 2) / 3;
        let min_value = 0x40i32;
        let max_value = (1i32 << header.raw_bits) - 1;

        if header.lossless() {
            let (qt0, max_bits) = make_main_qtable(max_value, 0);
            FujiParams {
                qt: [qt0, empty_qtable(), empty_qtable(), empty_qtable()],
                max_bits, min_value, max_value, line_width, lossless: true,
            }
        } else {
            // Lossy: qt[0] is the main table (re-initialized per line),
            // qt[1..3] are fixed sub-tables for small gradients.
            let (_, max_bits) = make_main_qtable(max_value, 0);

            // Sub-table 1: q_base=0
            let mut qp = [0i32; 5];
            qp[0] = 0; qp[4] = max_value;
            qp[1] = if max_value >= 0x12 { 0x12 } else { 1 };
            qp[2] = if max_value >= 0x43 { 0x43 } else { qp[1] };
            qp[3] = if max_value >= 0x114 { 0x114 } else { qp[2] };
            let qt1 = FujiQTable {
                q_table: setup_qlut(max_value, &qp),
                q_base: 0, max_grad: 5, q_grad_mult: 3,
                total_values: max_value + 1,
                raw_bits: log2ceil(max_value + 1),
            };

            // Sub-table 2: q_base=1
            qp[0] = 1;
            qp[1] = if max_value >= 0x15 { 0x15 } else { 2 };
            qp[2] = if max_value >= 0x48 { 0x48 } else { qp[1] };
            qp[3] = if max_value >= 0x11B { 0x11B } else { qp[2] };
            let tv2 = (max_value + 2) / 3 + 1;
            let qt2 = FujiQTable {
                q_table: setup_qlut(max_value, &qp),
                q_base: 1, max_grad: 6, q_grad_mult: 3,
                total_values: tv2,
                raw_bits: log2ceil(tv2),
            };

            // Sub-table 3: q_base=2
            qp[0] = 2;
            qp[1] = if max_value >= 0x18 { 0x18 } else { 3 };
            qp[2] = if max_value >= 0x4D { 0x4D } else { qp[1] };
            qp[3] = if max_value >= 0x122 { 0x122 } else { qp[2] };
            let tv3 = (max_value + 4) / 5 + 1;
            let qt3 = FujiQTable {
                q_table: setup_qlut(max_value, &qp),
                q_base: 2, max_grad: 7, q_grad_mult: 3,
                total_values: tv3,
                raw_bits: log2ceil(tv3),
            };

            FujiParams {
                qt: [empty_qtable(), qt1, qt2, qt3],
                max_bits, min_value, max_value, line_width, lossless: false,
            }
        }
    }

    fn reinit_main_qtable(&mut self, q_base: i32) {
        let (qt0, max_bits) = make_main_qtable(self.max_value, q_base);
        self.qt[0] = qt0;
        self.max_bits = max_bits;
    }

    #[inline(always)]
    fn quant_gradient(&self, qt: &FujiQTable, v1: i32, v2: i32) -> i32 {
        let idx1 = (self.max_value + v1) as usize;
        let idx2 = (self.max_value + v2) as usize;
        qt.q_grad_mult * (qt.q_table[idx1] as i32) + (qt.q_table[idx2] as i32)
    }
}

// ---------------------------------------------------------------------------
// Gradient pair (adaptive statistics)
// ---------------------------------------------------------------------------
#[derive(Clone, Copy)]
struct GradPair {
    value1: i32,
    value2: i32,
}

// Gradient arrays for one row-group: main grads + 3 lossy sub-grad arrays
#[derive(Clone, Copy)]
struct FujiGrads {
    grads: [GradPair; 41],
    lossy_grads: [[GradPair; 5]; 3],
}

// ---------------------------------------------------------------------------
// Bitstream
// ---------------------------------------------------------------------------
#[inline(always)]
fn fuji_zerobits(pump: &mut BitPumpMSB) -> i64 {
    let mut count: i64 = 0;
    loop {
        let batch = pump.peek_bits(32);
        let zeros = batch.leading_zeros() as i64;
        count += zeros;
        if zeros < 32 {
            pump.consume_bits((zeros + 1) as u32);
            break;
        }
        pump.consume_bits(32);
        // A run continuing past the end of the strip is truncated input;
        // the per-line exhaustion check turns it into an error.
        if pump.is_exhausted() {
            break;
        }
    }
    count
}

#[inline(always)]
fn bit_diff(value1: i32, value2: i32) -> i32 {
    if value1 <= 0 { return 0; }
    if value2 <= 0 { return 15; }
    let lz1 = (value1 as u32).leading_zeros() as i32;
    let lz2 = (value2 as u32).leading_zeros() as i32;
    let mut dec_bits = (lz2 - lz1).max(0);
    if (value2 << dec_bits) < value1 {
        dec_bits += 1;
    }
    dec_bits.min(15)
}

// Pick the q-table and gradient array for a sample. Lossy streams route
// small-difference neighborhoods through the fixed sub-tables.
#[inline(always)]
fn select_qtable<'a, 'b>(
    params: &'a FujiParams,
    fg: &'b mut FujiGrads,
    diff_sum: i32,
) -> (&'a FujiQTable, &'b mut [GradPair]) {
    for i in 1..4 {
        if params.qt[0].q_base >= i as i32 && diff_sum <= params.qt[i].max_grad {
            return (&params.qt[i], &mut fg.lossy_grads[i - 1]);
        }
    }
    (&params.qt[0], &mut fg.grads)
}

#[inline(always)]
fn fuji_decode_sample(
    pump: &mut BitPumpMSB,
    params: &FujiParams,
    qt: &FujiQTable,
    grad: i32,
    interp_val: i32,
    grads: &mut [GradPair],
) -> u16 {
    let gradient = grad.unsigned_abs() as usize;
    let sample_bits = fuji_zerobits(pump);

    let (code_bits, code_delta): (i32, i32);
    if sample_bits < (params.max_bits - qt.raw_bits - 1) as i64 {
        code_bits = bit_diff(grads[gradient].value1, grads[gradient].value2);
        code_delta = (sample_bits as i32) << code_bits;
    } else {
        code_bits = qt.raw_bits;
        code_delta = 1;
    }

    let mut code = if code_bits > 0 { pump.get_bits(code_bits as u32) as i32 } else { 0 };
    code += code_delta;

    // Zigzag decode
    code = if code & 1 != 0 { -1 - code / 2 } else { code / 2 };

    // Update gradient statistics
    grads[gradient].value1 += code.abs();
    if grads[gradient].value2 == params.min_value {
        grads[gradient].value1 >>= 1;
        grads[gradient].value2 >>= 1;
    }
    grads[gradient].value2 += 1;

    let q_mult = 2 * qt.q_base + 1;

    // Apply code to interpolation value
    let mut result = if grad < 0 { interp_val - code * q_mult } else { interp_val + code * q_mult };

    if result < -qt.q_base {
        result += qt.total_values * q_mult;
    } else if result > qt.q_base + params.max_value {
        result -= qt.total_values * q_mult;
    }

    let clamped = result.clamp(0, params.max_value);
    if clamped != result {
        log::trace!("sample {} outside [0, {}], clamped", result, params.max_value);
    }
    clamped as u16
}

// ---------------------------------------------------------------------------
// Line buffer access
// ---------------------------------------------------------------------------
#[inline(always)]
fn l(lines: &[i32], stride: usize, row: usize, col: usize) -> i32 {
    lines[row * stride + col]
}

#[inline(always)]
fn set_l(lines: &mut [i32], stride: usize, row: usize, col: usize, val: u16) {
    lines[row * stride + col] = val as i32;
}

// ---------------------------------------------------------------------------
// Interpolation (prediction from neighbors)
// ---------------------------------------------------------------------------
// Even pixel neighbors. Returns (interp_val, v1, v2, |Rf-Rb|, |Rc-Rb|)
#[inline(always)]
fn even_neighbors(
    lines: &[i32], stride: usize, c: usize, col: usize,
) -> (i32, i32, i32, i32, i32) {
    let rb = l(lines, stride, c - 1, 1 + 2 * col);
    let rc = l(lines, stride, c - 1, 2 * col);
    let rd = l(lines, stride, c - 1, 2 * col + 2);
    let rf = l(lines, stride, c - 2, 1 + 2 * col);

    let d_rc_rb = (rc - rb).abs();
    let d_rf_rb = (rf - rb).abs();
    let d_rd_rb = (rd - rb).abs();

    let (term1, term2);
    if d_rc_rb > d_rf_rb.max(d_rd_rb) {
        term1 = rf; term2 = rd;
    } else {
        term1 = if d_rd_rb > d_rc_rb.max(d_rf_rb) { rf } else { rd };
        term2 = rc;
    }

    let interp_val = (2 * rb + term1 + term2) >> 2;
    (interp_val, rb - rf, rc - rb, d_rf_rb, d_rc_rb)
}

// Odd pixel neighbors. Returns (interp_val, v1, v2, diff_sum)
#[inline(always)]
fn odd_neighbors(
    lines: &[i32], stride: usize, c: usize, col: usize,
) -> (i32, i32, i32, i32) {
    let ra = l(lines, stride, c, 1 + 2 * col);
    let rb = l(lines, stride, c - 1, 1 + 2 * col + 1);
    let rc = l(lines, stride, c - 1, 1 + 2 * col);
    let rd = l(lines, stride, c - 1, 1 + 2 * (col + 1));
    let rg = l(lines, stride, c, 1 + 2 * (col + 1));

    let mut interp_val = ra + rg;
    if rb < rc.min(rd) || rb > rc.max(rd) {
        interp_val += 2 * rb;
        interp_val >>= 1;
    }
    interp_val >>= 1;

    let diff_rb_rc = (rb - rc).abs();
    let diff_rc_ra = (rc - ra).abs();
    (interp_val, rb - rc, rc - ra, diff_rb_rc + diff_rc_ra)
}

// ---------------------------------------------------------------------------
// X-Trans interpolation pattern
// ---------------------------------------------------------------------------
#[inline(always)]
fn is_interpolation(row: usize, comp: usize, i: usize) -> bool {
    if comp == 0 {
        row == 0 || row == 5 || (row == 2 && i % 2 == 0) || (row == 4 && i % 2 != 0)
    } else {
        row == 1 || row == 2 || (row == 3 && i % 2 != 0) || (row == 5 && i % 2 == 0)
    }
}

// ---------------------------------------------------------------------------
// Extend helper columns
// ---------------------------------------------------------------------------
fn extend_generic(lines: &mut [i32], stride: usize, start: usize, end: usize) {
    for i in start..=end {
        lines[i * stride] = lines[(i - 1) * stride + 1];
        lines[i * stride + stride - 1] = lines[(i - 1) * stride + stride - 2];
    }
}

#[inline(always)]
fn extend_color(lines: &mut [i32], stride: usize, color: usize) {
    match color {
        0 => extend_generic(lines, stride, R2, R4),
        1 => extend_generic(lines, stride, G2, G7),
        2 => extend_generic(lines, stride, B2, B4),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Block decode (6 rows of one MCU line)
// ---------------------------------------------------------------------------
// X-Trans skips the entropy code for positions the CFA interpolates;
// Bayer codes every sample.
fn fuji_decode_block(
    pump: &mut BitPumpMSB,
    params: &FujiParams,
    lines: &mut [i32],
    stride: usize,
    grad_even: &mut [FujiGrads; 3],
    grad_odd: &mut [FujiGrads; 3],
    xtrans: bool,
) {
    let half_lw = params.line_width / 2;

    for row in 0..6usize {
        let (c0, c1) = ROW_LINES[row];
        let grad_idx = row % 3;

        let mut col_even = [0usize; 2];
        let mut col_odd = [0usize; 2];

        for i in 0..(half_lw + 4) {
            // Decode even pixels
            if i < half_lw {
                for comp in 0..2usize {
                    let c = if comp == 0 { c0 } else { c1 };
                    let col = col_even[comp];

                    let (interp_val, v1, v2, d_rf_rb, d_rc_rb) = even_neighbors(lines, stride, c, col);
                    let sample = if xtrans && is_interpolation(row, comp, i) {
                        interp_val.clamp(0, params.max_value) as u16
                    } else {
                        let (qt, grads) = select_qtable(params, &mut grad_even[grad_idx], d_rf_rb + d_rc_rb);
                        let grad = params.quant_gradient(qt, v1, v2);
                        fuji_decode_sample(pump, params, qt, grad, interp_val, grads)
                    };

                    set_l(lines, stride, c, 1 + 2 * col, sample);
                    col_even[comp] += 1;
                }
            }

            // Decode odd pixels (start 4 positions behind even)
            if i >= 4 {
                for comp in 0..2usize {
                    let c = if comp == 0 { c0 } else { c1 };
                    let col = col_odd[comp];

                    let (interp_val, v1, v2, diff_sum) = odd_neighbors(lines, stride, c, col);
                    let (qt, grads) = select_qtable(params, &mut grad_odd[grad_idx], diff_sum);
                    let grad = params.quant_gradient(qt, v1, v2);
                    let sample = fuji_decode_sample(pump, params, qt, grad, interp_val, grads);

                    set_l(lines, stride, c, 1 + 2 * col + 1, sample);
                    col_odd[comp] += 1;
                }
            }
        }

        // Extend helper columns
        let (ext0, ext1) = ROW_EXTENDS[row];
        extend_color(lines, stride, ext0);
        extend_color(lines, stride, ext1);
    }
}

// ---------------------------------------------------------------------------
// Copy decoded lines to the strip's output band
// ---------------------------------------------------------------------------
#[inline(always)]
fn xtrans_col_index(img_col: usize) -> usize {
    (((img_col * 2 / 3) & 0x7FFFFFFE) | ((img_col % 3) & 1)) + ((img_col % 3) >> 1)
}

fn copy_line<C, F>(
    lines: &[i32],
    stride: usize,
    strip_width: usize,
    cur_line: usize,
    band: &mut [u16],
    band_height: usize,
    cfa_color: C,
    index: F,
) where
    C: Fn(usize, usize) -> u8,
    F: Fn(usize) -> usize,
{
    for row_count in 0..6usize {
        let out_y = 6 * cur_line + row_count;
        if out_y >= band_height { continue; }

        for pix in 0..strip_width {
            let row = match cfa_color(row_count, pix) {
                0 => R2 + (row_count >> 1),      // RED
                1 => G2 + row_count,             // GREEN
                _ => B2 + (row_count >> 1),      // BLUE
            };
            let val = lines[row * stride + 1 + index(pix)];
            band[out_y * strip_width + pix] = val as u16;
        }
    }
}

fn copy_line_to_xtrans(
    lines: &[i32], stride: usize, strip_width: usize, cur_line: usize,
    band: &mut [u16], band_height: usize,
) {
    copy_line(
        lines, stride, strip_width, cur_line, band, band_height,
        |row, pix| XTRANS_CFA[row][pix % 6],
        xtrans_col_index,
    );
}

fn copy_line_to_bayer(
    lines: &[i32], stride: usize, strip_width: usize, cur_line: usize,
    band: &mut [u16], band_height: usize,
) {
    copy_line(
        lines, stride, strip_width, cur_line, band, band_height,
        |row, pix| BAYER_CFA[row % 2][pix % 2],
        |pix| pix >> 1,
    );
}

// ---------------------------------------------------------------------------
// Gradient initialization
// ---------------------------------------------------------------------------
fn init_main_grads(params: &FujiParams, grad_even: &mut [FujiGrads; 3], grad_odd: &mut [FujiGrads; 3]) {
    let max_diff = 2.max((params.qt[0].total_values + 0x20) >> 6);
    let init = GradPair { value1: max_diff, value2: 1 };
    for j in 0..3 {
        grad_even[j].grads = [init; 41];
        grad_odd[j].grads = [init; 41];
    }
}

fn init_lossy_grads(params: &FujiParams, grad_even: &mut [FujiGrads; 3], grad_odd: &mut [FujiGrads; 3]) {
    for k in 0..3 {
        let max_diff = 2.max((params.qt[k + 1].total_values + 0x20) >> 6);
        let init = GradPair { value1: max_diff, value2: 1 };
        for j in 0..3 {
            grad_even[j].lossy_grads[k] = [init; 5];
            grad_odd[j].lossy_grads[k] = [init; 5];
        }
    }
}

// ---------------------------------------------------------------------------
// Strip decoder
// ---------------------------------------------------------------------------
// A vertical band of the image, decoded independently of its siblings.
struct FujiStrip<'a> {
    n: usize,
    width: usize,
    offset_x: usize,
    data: &'a [u8],
    // per-line quantiser bases, lossy payloads only
    q_bases: Option<&'a [u8]>,
}

fn decode_strip(
    strip: &FujiStrip<'_>,
    header: &FujiHeader,
    params: &FujiParams,
    out_height: usize,
) -> Result<Vec<u16>> {
    let stride = params.line_width + 2;
    let mut lines = vec![0i32; LTOTAL * stride];
    let mut band = vec![0u16; strip.width * out_height];

    // The lossy main table is rebuilt per line, so each strip mutates its
    // own copy of the parameters.
    let mut params = params.clone();

    let init_gp = GradPair { value1: 0, value2: 0 };
    let init_fg = FujiGrads { grads: [init_gp; 41], lossy_grads: [[init_gp; 5]; 3] };
    let mut grad_even = [init_fg; 3];
    let mut grad_odd = [init_fg; 3];

    if params.lossless {
        init_main_grads(&params, &mut grad_even, &mut grad_odd);
    } else {
        init_lossy_grads(&params, &mut grad_even, &mut grad_odd);
    }

    let mut pump = BitPumpMSB::new(strip.data);

    for cur_line in 0..header.total_lines {
        // Lossy: re-init main qtable and grads when q_base changes
        if !params.lossless {
            let q_base = strip.q_bases.map_or(0, |qb| qb[cur_line] as i32);
            if cur_line == 0 || q_base != params.qt[0].q_base {
                params.reinit_main_qtable(q_base);
                init_main_grads(&params, &mut grad_even, &mut grad_odd);
            }
        }

        if cur_line > 0 {
            // Rotate: last 2 lines of each color → first 2
            for &(start, count) in &COLOR_RANGES {
                let src_off = (start + count - 2) * stride;
                let dst_off = start * stride;
                for i in 0..(2 * stride) {
                    lines[dst_off + i] = lines[src_off + i];
                }
            }
            // Set helper column for first decoded line
            for &(start, _) in &COLOR_RANGES {
                let row = start + 2;
                let prev = start + 1;
                lines[row * stride + stride - 1] = lines[prev * stride + stride - 2];
            }
        }

        fuji_decode_block(
            &mut pump, &params, &mut lines, stride,
            &mut grad_even, &mut grad_odd, header.is_xtrans(),
        );

        if pump.is_exhausted() {
            return Err(DecompressError::TruncatedBitstream);
        }

        if header.is_xtrans() {
            copy_line_to_xtrans(&lines, stride, strip.width, cur_line, &mut band, out_height);
        } else {
            copy_line_to_bayer(&lines, stride, strip.width, cur_line, &mut band, out_height);
        }
    }

    Ok(band)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------
/// Decompress a Fuji compressed payload (16-byte header, strip length
/// table, strip data) into a pre-sized single-component image matching
/// the header dimensions.
///
/// Strips share only the read-only parameters and write disjoint column
/// bands, so they decode in parallel into strip-local buffers that are
/// stitched after the join.
pub fn decompress_fuji(img: &mut RawImage, input: &[u8]) -> Result<()> {
    let mut stream = ByteStream::new(input, Endian::Big);
    let header = FujiHeader::parse(&mut stream)?;
    log::debug!("fuji header: {:?}", header);

    if !header.is_valid() {
        return Err(DecompressError::CorruptHeader(format!(
            "invalid field combination, signature 0x{:04x}", header.signature
        )));
    }
    if header.raw_type != 0 && header.raw_type != 16 {
        return Err(DecompressError::InputRange(format!(
            "unsupported raw_type {}", header.raw_type
        )));
    }
    if img.cpp() != 1 || img.width() != header.raw_width || img.height() != header.raw_height {
        return Err(DecompressError::Config(format!(
            "image shape {}x{} (cpp {}) does not match header {}x{}",
            img.width(), img.height(), img.cpp(), header.raw_width, header.raw_height
        )));
    }

    let params = FujiParams::new(&header);

    // Strip lengths, padded up to an 8-byte boundary
    let mut strip_sizes = Vec::with_capacity(header.blocks_in_row);
    for _ in 0..header.blocks_in_row {
        strip_sizes.push(stream.get_u32()? as usize);
    }
    let table_bytes = 4 * header.blocks_in_row;
    stream.skip_bytes((8 - (table_bytes & 7)) & 7).map_err(|_| {
        DecompressError::CorruptHeader("payload ends inside the length table padding".to_string())
    })?;

    // Per-line quantiser bases, lossy payloads only
    let line_step = (header.total_lines + 0xf) & !0xf;
    let q_bases: Option<&[u8]> = if header.lossless() {
        None
    } else {
        Some(
            stream
                .get_bytes(header.blocks_in_row * line_step)
                .map_err(|_| DecompressError::CorruptHeader(
                    "payload too short for quantiser bases".to_string(),
                ))?,
        )
    };

    let mut strips = Vec::with_capacity(header.blocks_in_row);
    for (n, &size) in strip_sizes.iter().enumerate() {
        let data = stream.get_bytes(size).map_err(|_| {
            DecompressError::CorruptHeader(format!("strip {} extends beyond the payload", n))
        })?;
        let width = if n + 1 < header.blocks_in_row {
            header.block_size
        } else {
            header.raw_width - header.block_size * n
        };
        strips.push(FujiStrip {
            n,
            width,
            offset_x: header.block_size * n,
            data,
            q_bases: q_bases.map(|qb| &qb[n * line_step..]),
        });
    }

    let out_height = header.raw_height;
    let bands = strips
        .par_iter()
        .map(|strip| decode_strip(strip, &header, &params, out_height))
        .collect::<Result<Vec<_>>>()?;

    for (strip, band) in strips.iter().zip(bands.iter()) {
        log::debug!("fuji strip {}: {} pixels wide at x {}", strip.n, strip.width, strip.offset_x);
        for row in 0..out_height {
            let dst = &mut img.row_mut(row)[strip.offset_x..strip.offset_x + strip.width];
            dst.copy_from_slice(&band[row * strip.width..(row + 1) * strip.width]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // MSB-first bit accumulator for handcrafting strip payloads.
    struct BitWriter {
        bytes: Vec<u8>,
        acc: u8,
        filled: u8,
    }

    impl BitWriter {
        fn new() -> BitWriter {
            BitWriter { bytes: Vec::new(), acc: 0, filled: 0 }
        }

        fn push_bit(&mut self, bit: u8) {
            self.acc = (self.acc << 1) | bit;
            self.filled += 1;
            if self.filled == 8 {
                self.bytes.push(self.acc);
                self.acc = 0;
                self.filled = 0;
            }
        }

        // A zero-valued sample code: terminator bit plus `zeros` empty
        // refinement bits.
        fn code_zero(&mut self, zeros: u32) {
            self.push_bit(1);
            for _ in 0..zeros {
                self.push_bit(0);
            }
        }

        fn finish(mut self) -> Vec<u8> {
            while self.filled != 0 {
                self.push_bit(0);
            }
            self.bytes
        }
    }

    // bit_diff(256, j) for the j-th sample of a fresh gradient when every
    // decoded code is zero.
    const DEC: [u32; 16] = [8, 7, 7, 6, 6, 6, 6, 5, 5, 5, 5, 5, 5, 5, 5, 4];

    fn make_header(raw_type: u8, version: u8) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(&FUJI_SIGNATURE.to_be_bytes());
        h.push(version);
        h.push(raw_type);
        h.push(14);                                // raw_bits
        h.extend_from_slice(&6u16.to_be_bytes());  // raw_height
        h.extend_from_slice(&6u16.to_be_bytes());  // raw_rounded_width
        h.extend_from_slice(&6u16.to_be_bytes());  // raw_width
        h.extend_from_slice(&6u16.to_be_bytes());  // block_size
        h.push(1);                                 // blocks_in_row
        h.extend_from_slice(&1u16.to_be_bytes());  // total_lines
        h
    }

    fn make_payload(raw_type: u8, strip: &[u8]) -> Vec<u8> {
        let mut payload = make_header(raw_type, 1);
        payload.extend_from_slice(&(strip.len() as u32).to_be_bytes());
        payload.extend_from_slice(&[0u8; 4]); // pad length table to 8 bytes
        payload.extend_from_slice(strip);
        payload
    }

    // Zero-valued codes for `total_lines` super-rows. Each row feeds the
    // even and odd gradient set of its row group in decode order: coded
    // even samples first, then the four odd samples. The gradient
    // counters run on across super-rows.
    fn zero_code_strip(coded_evens: &[usize; 6], total_lines: usize) -> Vec<u8> {
        let mut w = BitWriter::new();
        let mut even_count = [0usize; 3];
        let mut odd_count = [0usize; 3];
        for _ in 0..total_lines {
            for row in 0..6 {
                let g = row % 3;
                for _ in 0..coded_evens[row] {
                    w.code_zero(DEC[even_count[g]]);
                    even_count[g] += 1;
                }
                for _ in 0..4 {
                    w.code_zero(DEC[odd_count[g]]);
                    odd_count[g] += 1;
                }
            }
        }
        w.finish()
    }

    fn sentinel_image(width: usize, height: usize) -> RawImage {
        let mut img = RawImage::new(width, height, 1).unwrap();
        for row in 0..height {
            for v in img.row_mut(row) {
                *v = 0xbeef;
            }
        }
        img
    }

    fn parse(bytes: &[u8]) -> Result<FujiHeader> {
        FujiHeader::parse(&mut ByteStream::new(bytes, Endian::Big))
    }

    #[test]
    fn header_parses_and_validates() {
        let h = parse(&make_header(0, 1)).unwrap();
        assert!(h.is_valid());
        assert!(h.lossless());
        assert!(!h.is_xtrans());
        assert_eq!(h.mcu, (2, 6));
        assert_eq!(h.raw_bits, 14);
        assert_eq!(h.blocks_in_row, 1);

        let h = parse(&make_header(16, 1)).unwrap();
        assert!(h.is_valid());
        assert!(h.is_xtrans());
        assert_eq!(h.mcu, (1, 6));
    }

    #[test]
    fn header_rejects_bad_fields() {
        let mut bad = make_header(0, 1);
        bad[0] = 0; // signature
        assert!(!parse(&bad).unwrap().is_valid());

        let mut bad = make_header(0, 1);
        bad[4] = 9; // raw_bits
        assert!(!parse(&bad).unwrap().is_valid());

        let mut bad = make_header(0, 1);
        bad[13] = 3; // blocks_in_row disagrees with rounded width
        assert!(!parse(&bad).unwrap().is_valid());

        let mut bad = make_header(0, 1);
        bad[11] = 0;
        bad[12] = 0; // block_size
        assert!(!parse(&bad).unwrap().is_valid());

        let mut bad = make_header(0, 1);
        bad[14] = 0;
        bad[15] = 0; // total_lines
        assert!(!parse(&bad).unwrap().is_valid());
    }

    #[test]
    fn bit_diff_matches_gradient_shapes() {
        assert_eq!(bit_diff(256, 1), 8);
        assert_eq!(bit_diff(256, 3), 7);
        assert_eq!(bit_diff(256, 8), 5);
        assert_eq!(bit_diff(0, 5), 0);
        assert_eq!(bit_diff(5, 0), 15);
        assert_eq!(bit_diff(i32::MAX, 1), 15);
    }

    #[test]
    fn zerobits_counts_leading_zeros() {
        let data = [0b0000_0001, 0xff];
        let mut pump = BitPumpMSB::new(&data);
        assert_eq!(fuji_zerobits(&mut pump), 7);
        assert_eq!(fuji_zerobits(&mut pump), 0);
    }

    #[test]
    fn quant_gradient_is_zero_for_flat_neighborhood() {
        let h = parse(&make_header(16, 1)).unwrap();
        let params = FujiParams::new(&h);
        assert_eq!(params.quant_gradient(&params.qt[0], 0, 0), 0);
        assert_eq!(params.quant_gradient(&params.qt[0], 0, -64), -2);
        assert_eq!(params.quant_gradient(&params.qt[0], 0x114, 0), 36);
    }

    #[test]
    fn decode_sample_applies_coded_delta() {
        let h = parse(&make_header(16, 1)).unwrap();
        let params = FujiParams::new(&h);
        assert_eq!(params.max_bits, 56);
        assert_eq!(params.qt[0].raw_bits, 14);
        assert_eq!(params.qt[0].total_values, 0x4000);

        // terminator bit, then the 8 refinement bits 1000_0000
        let data = [0b1100_0000, 0b0000_0000, 0, 0, 0, 0];
        let mut pump = BitPumpMSB::new(&data);
        let mut grads = [GradPair { value1: 256, value2: 1 }; 41];
        let sample = fuji_decode_sample(&mut pump, &params, &params.qt[0], 0, 0, &mut grads);
        assert_eq!(sample, 64);
        assert_eq!(grads[0].value1, 320);
        assert_eq!(grads[0].value2, 2);
    }

    #[test]
    fn decode_sample_wraps_negative_results() {
        let h = parse(&make_header(16, 1)).unwrap();
        let params = FujiParams::new(&h);

        // refinement bits 1000_0001 make an odd code, so the delta is -65
        let data = [0b1100_0000, 0b1000_0000, 0, 0, 0, 0];
        let mut pump = BitPumpMSB::new(&data);
        let mut grads = [GradPair { value1: 256, value2: 1 }; 41];
        let sample = fuji_decode_sample(&mut pump, &params, &params.qt[0], 0, 0, &mut grads);
        assert_eq!(sample, 0x4000 - 65);
    }

    #[test]
    fn xtrans_col_index_folds_six_pixels_to_four() {
        let idx: Vec<usize> = (0..6).map(xtrans_col_index).collect();
        assert_eq!(idx, vec![0, 1, 1, 2, 3, 3]);
        let idx: Vec<usize> = (6..12).map(xtrans_col_index).collect();
        assert_eq!(idx, vec![4, 5, 5, 6, 7, 7]);
    }

    #[test]
    fn bayer_zero_codes_decode_to_zero_image() {
        let strip = zero_code_strip(&[4, 4, 4, 4, 4, 4], 1);
        let payload = make_payload(0, &strip);

        let mut img = sentinel_image(6, 6);
        decompress_fuji(&mut img, &payload).unwrap();
        for row in 0..6 {
            assert_eq!(img.row(row), &[0u16; 6], "row {}", row);
        }
    }

    #[test]
    fn xtrans_zero_codes_decode_to_zero_image() {
        // Coded even samples per row, the rest are interpolated positions
        let strip = zero_code_strip(&[2, 2, 1, 3, 3, 1], 1);
        let payload = make_payload(16, &strip);

        let mut img = sentinel_image(6, 6);
        decompress_fuji(&mut img, &payload).unwrap();
        for row in 0..6 {
            assert_eq!(img.row(row), &[0u16; 6], "row {}", row);
        }
    }

    // Decode a two-strip frame through the public entry point, then strip
    // by strip in reverse order, and require identical output.
    fn assert_strip_order_independent(raw_type: u8, coded_evens: &[usize; 6]) {
        // Two identical strips over a 12-pixel-wide frame
        let strip = zero_code_strip(coded_evens, 1);

        let mut payload = Vec::new();
        payload.extend_from_slice(&FUJI_SIGNATURE.to_be_bytes());
        payload.push(1);                                  // version
        payload.push(raw_type);
        payload.push(14);                                 // raw_bits
        payload.extend_from_slice(&6u16.to_be_bytes());   // raw_height
        payload.extend_from_slice(&12u16.to_be_bytes());  // raw_rounded_width
        payload.extend_from_slice(&12u16.to_be_bytes());  // raw_width
        payload.extend_from_slice(&6u16.to_be_bytes());   // block_size
        payload.push(2);                                  // blocks_in_row
        payload.extend_from_slice(&1u16.to_be_bytes());   // total_lines
        payload.extend_from_slice(&(strip.len() as u32).to_be_bytes());
        payload.extend_from_slice(&(strip.len() as u32).to_be_bytes());
        payload.extend_from_slice(strip.as_slice());
        payload.extend_from_slice(strip.as_slice());

        let mut via_api = sentinel_image(12, 6);
        decompress_fuji(&mut via_api, &payload).unwrap();

        // Decode the strips by hand in reverse order
        let header = parse(&payload).unwrap();
        assert!(header.is_valid());
        let params = FujiParams::new(&header);
        let strips = [
            FujiStrip { n: 0, width: 6, offset_x: 0, data: &strip, q_bases: None },
            FujiStrip { n: 1, width: 6, offset_x: 6, data: &strip, q_bases: None },
        ];
        let mut manual = sentinel_image(12, 6);
        for s in strips.iter().rev() {
            let band = decode_strip(s, &header, &params, 6).unwrap();
            for row in 0..6 {
                manual.row_mut(row)[s.offset_x..s.offset_x + s.width]
                    .copy_from_slice(&band[row * s.width..(row + 1) * s.width]);
            }
        }

        for row in 0..6 {
            assert_eq!(via_api.row(row), manual.row(row), "row {}", row);
        }
    }

    #[test]
    fn bayer_strip_decode_order_does_not_matter() {
        assert_strip_order_independent(0, &[4, 4, 4, 4, 4, 4]);
    }

    #[test]
    fn xtrans_strip_decode_order_does_not_matter() {
        assert_strip_order_independent(16, &[2, 2, 1, 3, 3, 1]);
    }

    #[test]
    fn lossy_quantiser_bases_drive_the_sub_tables() {
        // Two super-rows with q_base 1 then 2. Flat neighborhoods keep the
        // difference sum at zero, so every sample routes through the first
        // sub-table and its 5-entry gradient list, whose counters run on
        // across the per-line main-table rebuilds.
        let strip = zero_code_strip(&[4, 4, 4, 4, 4, 4], 2);

        let mut payload = Vec::new();
        payload.extend_from_slice(&FUJI_SIGNATURE.to_be_bytes());
        payload.push(0);                                  // version, lossy
        payload.push(0);                                  // raw_type
        payload.push(14);                                 // raw_bits
        payload.extend_from_slice(&12u16.to_be_bytes());  // raw_height
        payload.extend_from_slice(&6u16.to_be_bytes());   // raw_rounded_width
        payload.extend_from_slice(&6u16.to_be_bytes());   // raw_width
        payload.extend_from_slice(&6u16.to_be_bytes());   // block_size
        payload.push(1);                                  // blocks_in_row
        payload.extend_from_slice(&2u16.to_be_bytes());   // total_lines
        payload.extend_from_slice(&(strip.len() as u32).to_be_bytes());
        payload.extend_from_slice(&[0u8; 4]);             // pad length table
        let mut q_bases = [0u8; 16];                      // one padded line_step
        q_bases[0] = 1;
        q_bases[1] = 2;
        payload.extend_from_slice(&q_bases);
        payload.extend_from_slice(&strip);

        let header = parse(&payload).unwrap();
        assert!(header.is_valid());
        assert!(!header.lossless());

        let mut img = sentinel_image(6, 12);
        decompress_fuji(&mut img, &payload).unwrap();
        for row in 0..12 {
            assert_eq!(img.row(row), &[0u16; 6], "row {}", row);
        }
    }

    #[test]
    fn lossy_payload_without_quantiser_bases_is_corrupt() {
        let mut payload = make_header(0, 0);
        payload.extend_from_slice(&64u32.to_be_bytes());
        payload.extend_from_slice(&[0u8; 4]);
        payload.extend_from_slice(&[0u8; 8]); // shorter than one line_step
        let mut img = RawImage::new(6, 6, 1).unwrap();
        assert!(matches!(
            decompress_fuji(&mut img, &payload),
            Err(DecompressError::CorruptHeader(_))
        ));
    }

    #[test]
    fn truncated_strip_is_terminal() {
        // The declared strip is present but holds only zero bits, so the
        // zero-run never terminates within the data.
        let payload = make_payload(0, &[0u8; 4]);
        let mut img = RawImage::new(6, 6, 1).unwrap();
        assert_eq!(
            decompress_fuji(&mut img, &payload),
            Err(DecompressError::TruncatedBitstream)
        );
    }

    #[test]
    fn strip_length_beyond_payload_is_corrupt() {
        let mut payload = make_header(0, 1);
        payload.extend_from_slice(&64u32.to_be_bytes());
        payload.extend_from_slice(&[0u8; 4]);
        payload.extend_from_slice(&[0u8; 8]); // much less than the declared 64
        let mut img = RawImage::new(6, 6, 1).unwrap();
        assert!(matches!(
            decompress_fuji(&mut img, &payload),
            Err(DecompressError::CorruptHeader(_))
        ));
    }

    #[test]
    fn image_shape_must_match_header() {
        let strip = zero_code_strip(&[4, 4, 4, 4, 4, 4], 1);
        let payload = make_payload(0, &strip);
        let mut img = RawImage::new(12, 6, 1).unwrap();
        assert!(matches!(
            decompress_fuji(&mut img, &payload),
            Err(DecompressError::Config(_))
        ));
    }
}
