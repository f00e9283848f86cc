//! Canonical FLOP counts for the operations whose cost is more than a per-element constant.

use crate::ir::{ConvolutionAttributes, DotDimensionNumbers, WindowDimension};
use crate::shape::Shape;

/// An FMA counts as two floating point operations.
pub const FMA_FLOPS: i64 = 2;

/// FMAs needed for one complex multiplication.
const FMA_PER_COMPLEX_MUL: i64 = 4;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct DimensionError(String);

fn dim(shape: &Shape, dim: usize, what: &str) -> Result<i64, DimensionError> {
    match shape.dim(dim) {
        Some(size) if size >= 0 => Ok(size),
        Some(size) => Err(DimensionError(format!("{} dimension {} has size {}", what, dim, size))),
        None => Err(DimensionError(format!(
            "{} dimension {} is out of range for rank {}",
            what,
            dim,
            shape.rank()
        ))),
    }
}

fn overflow(what: &str) -> DimensionError {
    DimensionError(format!("{} overflows a 64-bit count", what))
}

/// Multiplies `factors`, failing if the product does not fit in an `i64`.
fn checked_product(
    factors: impl IntoIterator<Item = i64>,
    what: &str,
) -> Result<i64, DimensionError> {
    factors
        .into_iter()
        .try_fold(1i64, |product, factor| product.checked_mul(factor))
        .ok_or_else(|| overflow(what))
}

fn free_dims_product(shape: &Shape, bound: &[usize], what: &str) -> Result<i64, DimensionError> {
    let free = shape
        .dims()
        .iter()
        .enumerate()
        .filter(|(i, _)| !bound.contains(i))
        .map(|(_, &size)| size);
    checked_product(free, what)
}

fn check_distinct(dims: &[usize], what: &str) -> Result<(), DimensionError> {
    for (i, d) in dims.iter().enumerate() {
        if dims[..i].contains(d) {
            return Err(DimensionError(format!("{} dimension {} is used twice", what, d)));
        }
    }
    Ok(())
}

/// FLOPs of a dot product: two per FMA, with one FMA for every combination of batch index,
/// contracted index, and free index of each side.
pub fn dot_flops(
    lhs: &Shape,
    rhs: &Shape,
    dnums: &DotDimensionNumbers,
) -> Result<i64, DimensionError> {
    if dnums.lhs_batch.len() != dnums.rhs_batch.len() {
        return Err(DimensionError(
            "lhs and rhs have different numbers of batch dimensions".into(),
        ));
    }
    if dnums.lhs_contracting.len() != dnums.rhs_contracting.len() {
        return Err(DimensionError(
            "lhs and rhs have different numbers of contracting dimensions".into(),
        ));
    }

    let lhs_bound: Vec<usize> = dnums
        .lhs_batch
        .iter()
        .chain(&dnums.lhs_contracting)
        .copied()
        .collect();
    let rhs_bound: Vec<usize> = dnums
        .rhs_batch
        .iter()
        .chain(&dnums.rhs_contracting)
        .copied()
        .collect();
    check_distinct(&lhs_bound, "lhs")?;
    check_distinct(&rhs_bound, "rhs")?;

    let mut batch = 1i64;
    for (&l, &r) in dnums.lhs_batch.iter().zip(&dnums.rhs_batch) {
        let size = dim(lhs, l, "lhs batch")?;
        if size != dim(rhs, r, "rhs batch")? {
            return Err(DimensionError(format!(
                "batch dimensions {} and {} differ in size",
                l, r
            )));
        }
        batch = batch.checked_mul(size).ok_or_else(|| overflow("batch size"))?;
    }

    let mut contracted = 1i64;
    for (&l, &r) in dnums.lhs_contracting.iter().zip(&dnums.rhs_contracting) {
        let size = dim(lhs, l, "lhs contracting")?;
        if size != dim(rhs, r, "rhs contracting")? {
            return Err(DimensionError(format!(
                "contracting dimensions {} and {} differ in size",
                l, r
            )));
        }
        contracted = contracted
            .checked_mul(size)
            .ok_or_else(|| overflow("contracted size"))?;
    }

    let lhs_free = free_dims_product(lhs, &lhs_bound, "lhs free size")?;
    let rhs_free = free_dims_product(rhs, &rhs_bound, "rhs free size")?;
    checked_product([FMA_FLOPS, batch, contracted, lhs_free, rhs_free], "dot FLOP count")
}

/// Number of (kernel position, output position) pairs along one spatial dimension that read an
/// input element rather than padding or a hole introduced by base dilation.
fn valid_positions(
    input_limit: i64,
    kernel_limit: i64,
    output_limit: i64,
    window: &WindowDimension,
) -> i64 {
    let mut count = 0;
    for kernel_idx in 0..kernel_limit {
        for output_idx in 0..output_limit {
            let undilated = output_idx * window.stride - window.padding_low
                + kernel_idx * window.window_dilation;
            if undilated.rem_euclid(window.base_dilation) != 0 {
                continue;
            }
            let input_idx = undilated.div_euclid(window.base_dilation);
            if (0..input_limit).contains(&input_idx) {
                count += 1;
            }
        }
    }
    count
}

/// FLOPs of a convolution: two per FMA, with one FMA for every output feature, batch element,
/// input feature of the group, and valid pairing of kernel and output position. Without padding
/// this is the output element count times the kernel's spatial size times the input features per
/// group.
pub fn convolution_flops(
    lhs: &Shape,
    rhs: &Shape,
    result: &Shape,
    conv: &ConvolutionAttributes,
) -> Result<i64, DimensionError> {
    let dnums = &conv.dimension_numbers;
    let spatial = conv.window.0.len();
    if dnums.input_spatial.len() != spatial
        || dnums.kernel_spatial.len() != spatial
        || dnums.output_spatial.len() != spatial
    {
        return Err(DimensionError(format!(
            "window has {} dimensions but the dimension numbers name {}/{}/{} spatial dimensions",
            spatial,
            dnums.input_spatial.len(),
            dnums.kernel_spatial.len(),
            dnums.output_spatial.len()
        )));
    }
    if conv.feature_group_count < 1 || conv.batch_group_count < 1 {
        return Err(DimensionError("group counts must be positive".into()));
    }

    let input_feature = dim(lhs, dnums.input_feature, "input feature")?;
    let output_feature = dim(result, dnums.output_feature, "output feature")?;
    let batch = dim(lhs, dnums.input_batch, "input batch")?;

    let mut positions = 1i64;
    for (i, window) in conv.window.0.iter().enumerate() {
        if window.stride < 1 || window.window_dilation < 1 || window.base_dilation < 1 {
            return Err(DimensionError(format!(
                "window dimension {} has a non-positive stride or dilation",
                i
            )));
        }
        let kernel_limit = dim(rhs, dnums.kernel_spatial[i], "kernel spatial")?;
        let output_limit = dim(result, dnums.output_spatial[i], "output spatial")?;
        let input_limit = dim(lhs, dnums.input_spatial[i], "input spatial")?;
        positions = positions
            .checked_mul(valid_positions(input_limit, kernel_limit, output_limit, window))
            .ok_or_else(|| overflow("spatial positions"))?;
    }

    checked_product(
        [
            input_feature / conv.feature_group_count,
            output_feature,
            batch / conv.batch_group_count,
            positions,
            FMA_FLOPS,
        ],
        "convolution FLOP count",
    )
}

pub fn floor_log2(n: i64) -> i64 {
    if n <= 1 {
        0
    } else {
        63 - n.leading_zeros() as i64
    }
}

pub fn ceil_log2(n: i64) -> i64 {
    if n <= 1 {
        0
    } else {
        64 - (n - 1).leading_zeros() as i64
    }
}

/// FLOPs of an FFT over `real_input`, with a complex multiplication per element for each factor
/// of two in each transformed length.
pub fn fft_flops(real_input: &Shape, fft_length: &[i64]) -> Result<i64, DimensionError> {
    let elements = real_input
        .checked_element_count()
        .ok_or_else(|| overflow("input element count"))?;
    let log_factors = fft_length.iter().map(|&len| floor_log2(len));
    checked_product(
        [FMA_FLOPS, FMA_PER_COMPLEX_MUL, elements]
            .into_iter()
            .chain(log_factors),
        "FFT FLOP count",
    )
}

/// Comparison sorts take about n log n steps.
pub fn sort_flops(elements: i64) -> Result<i64, DimensionError> {
    checked_product([elements, ceil_log2(elements)], "sort FLOP count")
}
