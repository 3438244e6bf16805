//! Quantization operators.
//!
//! Every operator maps a weight matrix to a same-shaped matrix whose values are
//! drawn from a small set of levels, then dequantizes back to `f32` so the
//! rest of the pipeline keeps working on ordinary floating weights.
//!
//! | operator | levels | used by |
//! |----------|--------|---------|
//! | [`quantize_uniform`] | `2^bits` evenly spaced in `[min, max]` | `4bit`, `8bit`, `quip` |
//! | [`quantize_rows`] | `2^bits` per row | `aqlm` |
//! | [`binarize_two_level`] | 2 (sign-partition means) | `onebit` |
//! | [`salience_quantize`] | high-bit salient subset + binarized rest | `ptq1_61`, `mixed` |
//! | [`sketch_quantize`] | 2 (low/high quantile) | `ultrasketch` |

use nanoquant_core::{Error, Result, WeightMatrix};

use super::stats::{check_input, quantile, quantiles};

/// Bit widths accepted by [`quantize_uniform`].
pub const SUPPORTED_BITS: [u8; 4] = [1, 2, 4, 8];

/// Map `bits` to the number of quantization steps, `2^bits - 1`.
fn steps_for(bits: u8) -> Result<u32> {
    if !SUPPORTED_BITS.contains(&bits) {
        return Err(Error::operator(
            "quantize_uniform",
            format!("unsupported bit width {bits}, expected one of {SUPPORTED_BITS:?}"),
        ));
    }
    Ok((1u32 << bits) - 1)
}

/// Quantize a single value into `steps + 1` levels over `[min, max]`.
///
/// Dequantization interpolates between the endpoints so that level 0 is
/// exactly `min` and the top level is exactly `max`; re-quantizing a
/// dequantized value therefore lands on the same level.
#[inline]
fn quantize_value(x: f32, min: f32, max: f32, steps: u32) -> f32 {
    let (lo, hi) = (min as f64, max as f64);
    let normalized = ((x as f64).clamp(lo, hi) - lo) / (hi - lo);
    let level = (normalized * steps as f64).round();
    let t = level / steps as f64;
    (lo * (1.0 - t) + hi * t) as f32
}

fn quantize_slice(values: &mut [f32], bits: u8, min: f32, max: f32) -> Result<()> {
    let steps = steps_for(bits)?;
    if !min.is_finite() || !max.is_finite() || min > max {
        return Err(Error::operator(
            "quantize_uniform",
            format!("invalid range [{min}, {max}]"),
        ));
    }
    if min == max {
        values.iter_mut().for_each(|v| *v = min);
        return Ok(());
    }
    for v in values.iter_mut() {
        *v = quantize_value(*v, min, max, steps);
    }
    Ok(())
}

fn range_of(values: &[f32]) -> (f32, f32) {
    values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

/// Uniform quantization into `2^bits` levels within `[min, max]`.
///
/// Values outside the range are clamped. A degenerate range (`min == max`)
/// maps every element to `min`.
pub fn quantize_uniform(tensor: &WeightMatrix, bits: u8, min: f32, max: f32) -> Result<WeightMatrix> {
    check_input(tensor.as_slice(), "quantize_uniform")?;
    let mut out = tensor.clone();
    quantize_slice(out.as_mut_slice(), bits, min, max)?;
    Ok(out)
}

/// Uniform quantization over the tensor's own value range.
pub fn quantize_to_bits(tensor: &WeightMatrix, bits: u8) -> Result<WeightMatrix> {
    check_input(tensor.as_slice(), "quantize_uniform")?;
    let (min, max) = range_of(tensor.as_slice());
    quantize_uniform(tensor, bits, min, max)
}

/// Uniform quantization with a separate range per output row.
pub fn quantize_rows(tensor: &WeightMatrix, bits: u8) -> Result<WeightMatrix> {
    check_input(tensor.as_slice(), "quantize_rows")?;
    let mut out = tensor.clone();
    for r in 0..out.rows() {
        let row = out.row_mut(r);
        let (min, max) = range_of(row);
        quantize_slice(row, bits, min, max)?;
    }
    Ok(out)
}

/// Mean of the non-negative entries (`alpha`) and of the negative entries (`beta`).
///
/// An empty partition yields 0.
pub fn two_level_means<'a>(values: impl IntoIterator<Item = &'a f32>) -> (f32, f32) {
    let (mut pos_sum, mut pos_n, mut neg_sum, mut neg_n) = (0.0f64, 0usize, 0.0f64, 0usize);
    for &v in values {
        if v >= 0.0 {
            pos_sum += v as f64;
            pos_n += 1;
        } else {
            neg_sum += v as f64;
            neg_n += 1;
        }
    }
    let alpha = if pos_n > 0 { pos_sum / pos_n as f64 } else { 0.0 };
    let beta = if neg_n > 0 { neg_sum / neg_n as f64 } else { 0.0 };
    (alpha as f32, beta as f32)
}

/// One-bit binarization: non-negative entries become `alpha`, negative become `beta`.
pub fn binarize_two_level(tensor: &WeightMatrix) -> Result<WeightMatrix> {
    check_input(tensor.as_slice(), "binarize_two_level")?;
    let (alpha, beta) = two_level_means(tensor.as_slice());
    let mut out = tensor.clone();
    for v in out.as_mut_slice() {
        *v = if *v >= 0.0 { alpha } else { beta };
    }
    Ok(out)
}

/// Salience-split quantization.
///
/// Entries whose magnitude is at or above the `(1 - salient_fraction)`
/// quantile of `|w|` are quantized to `salient_bits` over the salient
/// subset's own range; the remaining entries are binarized with the means of
/// their own sign partitions.
pub fn salience_quantize(tensor: &WeightMatrix, salient_fraction: f32, salient_bits: u8) -> Result<WeightMatrix> {
    salience_split(tensor, salient_fraction, salient_bits, Rest::Binarize)
}

/// Mixed precision: top 10% by magnitude at 8 bits, the rest at 4 bits.
pub fn mixed_precision_quantize(tensor: &WeightMatrix) -> Result<WeightMatrix> {
    salience_split(tensor, 0.1, 8, Rest::Uniform(4))
}

enum Rest {
    Binarize,
    Uniform(u8),
}

fn salience_split(tensor: &WeightMatrix, salient_fraction: f32, salient_bits: u8, rest: Rest) -> Result<WeightMatrix> {
    check_input(tensor.as_slice(), "salience_quantize")?;
    if !(0.0..=1.0).contains(&salient_fraction) {
        return Err(Error::operator(
            "salience_quantize",
            format!("salient fraction {salient_fraction} outside [0, 1]"),
        ));
    }
    steps_for(salient_bits)?;

    let magnitudes: Vec<f32> = tensor.as_slice().iter().map(|v| v.abs()).collect();
    let threshold = quantile(&magnitudes, 1.0 - salient_fraction)?;
    let salient: Vec<bool> = magnitudes.iter().map(|&m| m >= threshold).collect();

    let mut high: Vec<f32> = Vec::new();
    let mut low: Vec<f32> = Vec::new();
    for (&v, &s) in tensor.as_slice().iter().zip(&salient) {
        if s {
            high.push(v);
        } else {
            low.push(v);
        }
    }

    if !high.is_empty() {
        let (min, max) = range_of(&high);
        quantize_slice(&mut high, salient_bits, min, max)?;
    }
    match rest {
        Rest::Binarize => {
            let (alpha, beta) = two_level_means(&low);
            for v in low.iter_mut() {
                *v = if *v >= 0.0 { alpha } else { beta };
            }
        }
        Rest::Uniform(bits) if !low.is_empty() => {
            let (min, max) = range_of(&low);
            quantize_slice(&mut low, bits, min, max)?;
        }
        Rest::Uniform(_) => {}
    }

    let mut out = tensor.clone();
    let (mut hi_iter, mut lo_iter) = (high.into_iter(), low.into_iter());
    for (v, &s) in out.as_mut_slice().iter_mut().zip(&salient) {
        let next = if s { hi_iter.next() } else { lo_iter.next() };
        if let Some(q) = next {
            *v = q;
        }
    }
    Ok(out)
}

/// Two-level sketch: entries at or below the median become the minimum,
/// entries above it become the maximum.
pub fn sketch_quantize(tensor: &WeightMatrix) -> Result<WeightMatrix> {
    check_input(tensor.as_slice(), "sketch_quantize")?;
    let q = quantiles(tensor.as_slice(), &[0.0, 0.5, 1.0])?;
    let (low, median, high) = (q[0], q[1], q[2]);
    let mut out = tensor.clone();
    for v in out.as_mut_slice() {
        *v = if *v <= median { low } else { high };
    }
    Ok(out)
}
