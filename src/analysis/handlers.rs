//! The default cost of each kind of instruction.
//!
//! Every handler starts from the record preprocessing built: no arithmetic, and each operand and
//! the result touched once in full. A handler only states where its instruction differs.

use std::collections::HashMap;

use super::{Visit, VisitContext};
use crate::error::Result;
use crate::formulas::{self, FMA_FLOPS};
use crate::ir::{InstrId, Opcode};
use crate::properties::{KeyRule, KeySchema, BYTES_ACCESSED, FLOPS, TRANSCENDENTALS};
use crate::shape::{Shape, ShapeIndex};

pub type Handler = fn(&Visit<'_>, &mut VisitContext) -> Result<()>;

/// FLOPs of a convolution from its input, kernel, and result shapes.
pub type ConvolutionFlops = fn(&Visit<'_>, &Shape, &Shape, &Shape) -> Result<i64>;

/// Fills in per-operand utilization of a fusion once its memory traffic is known.
pub type FusionUtilizations = fn(&Visit<'_>, &mut VisitContext) -> Result<()>;

/// The rules which turn an instruction into properties. Backends tune the defaults through the
/// builder methods; nested analyses of called computations reuse the same model.
#[derive(Clone)]
pub struct CostModel {
    overrides: HashMap<Opcode, Handler>,
    convolution_flops: ConvolutionFlops,
    fusion_utilizations: FusionUtilizations,
    input_reuse_is_inefficient: bool,
    schema: KeySchema,
}

impl Default for CostModel {
    fn default() -> Self {
        CostModel {
            overrides: HashMap::new(),
            convolution_flops: default_convolution_flops,
            fusion_utilizations: default_fusion_utilizations,
            input_reuse_is_inefficient: false,
            schema: KeySchema::default(),
        }
    }
}

impl std::fmt::Debug for CostModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut overridden: Vec<&Opcode> = self.overrides.keys().collect();
        overridden.sort();
        f.debug_struct("CostModel")
            .field("overrides", &overridden)
            .field("input_reuse_is_inefficient", &self.input_reuse_is_inefficient)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl CostModel {
    /// Replaces the handler for one opcode. `default_handler` gives access to the one replaced.
    pub fn with_handler(mut self, opcode: Opcode, handler: Handler) -> Self {
        self.overrides.insert(opcode, handler);
        self
    }

    pub fn with_convolution_flops(self, convolution_flops: ConvolutionFlops) -> Self {
        Self {
            convolution_flops,
            ..self
        }
    }

    pub fn with_fusion_utilizations(self, fusion_utilizations: FusionUtilizations) -> Self {
        Self {
            fusion_utilizations,
            ..self
        }
    }

    /// Whether reading the same input element more than once costs extra, so that broadcasts
    /// report the reuse factor as their operand's utilization.
    pub fn with_input_reuse_inefficient(self, input_reuse_is_inefficient: bool) -> Self {
        Self {
            input_reuse_is_inefficient,
            ..self
        }
    }

    pub fn with_key_rule(mut self, rule: KeyRule) -> Self {
        self.schema = self.schema.with_rule(rule);
        self
    }

    pub fn handler(&self, opcode: Opcode) -> Handler {
        self.overrides
            .get(&opcode)
            .copied()
            .unwrap_or_else(|| default_handler(opcode))
    }

    pub fn schema(&self) -> &KeySchema {
        &self.schema
    }

    pub fn input_reuse_is_inefficient(&self) -> bool {
        self.input_reuse_is_inefficient
    }

    pub fn convolution_flops(
        &self,
        visit: &Visit<'_>,
        lhs: &Shape,
        rhs: &Shape,
        result: &Shape,
    ) -> Result<i64> {
        (self.convolution_flops)(visit, lhs, rhs, result)
    }
}

pub fn default_handler(opcode: Opcode) -> Handler {
    use Opcode::*;
    match opcode {
        op if op.is_elementwise_unary() || op.is_elementwise_binary() => handle_elementwise,
        Clamp | Compare | Convert | ReducePrecision | Select => handle_elementwise,

        Parameter | Constant | GetTupleElement | Bitcast | Domain | AddDependency | AfterAll
        | SetDimensionSize => handle_free,

        Broadcast => handle_broadcast,
        Tuple => handle_tuple,
        Slice => handle_slice,
        DynamicSlice => handle_dynamic_slice,
        DynamicUpdateSlice => handle_dynamic_update_slice,
        Gather => handle_gather,
        Scatter => handle_scatter,

        Dot => handle_dot,
        Convolution => handle_convolution,
        Fft => handle_fft,
        TriangularSolve => handle_triangular_solve,
        Cholesky => handle_cholesky,
        Sort => handle_sort,
        Rng | RngBitGenerator => handle_rng,

        Reduce => handle_reduce,
        ReduceWindow => handle_reduce_window,
        SelectAndScatter => handle_select_and_scatter,
        Map => handle_map,

        While => handle_while,
        Conditional => handle_conditional,
        Call => handle_call,
        CustomCall => handle_custom_call,
        AsyncStart => handle_async_start,
        Fusion => handle_fusion,

        AllGather | AllGatherStart | AllGatherDone | AllReduce | AllReduceStart | AllReduceDone
        | AllToAll | CollectivePermute | CollectivePermuteStart | CollectivePermuteDone
        | ReduceScatter => handle_collective,

        _ => handle_default,
    }
}

fn ratio(numerator: i64, denominator: i64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Element count of `shape`, failing on shapes too large to count.
fn elements(visit: &Visit<'_>, shape: &Shape) -> Result<i64> {
    shape
        .checked_element_count()
        .ok_or_else(|| visit.malformed(format!("{} has too many elements to count", shape)))
}

/// Multiplies counts, failing if the product does not fit in an `i64`.
fn product(visit: &Visit<'_>, factors: &[i64]) -> Result<i64> {
    factors
        .iter()
        .try_fold(1i64, |product, &factor| product.checked_mul(factor))
        .ok_or_else(|| visit.malformed(format!("product of {:?} overflows", factors)))
}

fn window_size(visit: &Visit<'_>) -> Result<i64> {
    visit
        .instruction
        .window()?
        .element_count()
        .ok_or_else(|| visit.malformed("window has too many elements to count"))
}

/// The first element of a variadic result, or the result itself.
fn first_result(shape: &Shape) -> &Shape {
    shape.tuple_element(0).unwrap_or(shape)
}

fn handle_default(_: &Visit<'_>, _: &mut VisitContext) -> Result<()> {
    Ok(())
}

fn handle_elementwise(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let count = elements(visit, visit.instruction.shape())? as f64;
    if visit.instruction.opcode().is_transcendental() {
        cx.properties.set(TRANSCENDENTALS, count);
    } else {
        cx.properties.set(FLOPS, count);
    }
    Ok(())
}

/// Instructions which only name or rearrange values without touching memory.
fn handle_free(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let root = ShapeIndex::default();
    cx.properties.set(BYTES_ACCESSED, 0.0);
    cx.set_output_bytes_accessed(&root, 0.0);
    for operand_num in 0..visit.operand_count() {
        cx.set_operand_bytes_accessed(operand_num, &root, 0.0);
        cx.set_operand_utilization(operand_num, &root, 0.0);
    }
    cx.set_bytes_complete();
    cx.set_optimal_seconds(0.0);
    Ok(())
}

fn handle_broadcast(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    if visit.model().input_reuse_is_inefficient() {
        let reuse = ratio(
            elements(visit, visit.instruction.shape())?,
            elements(visit, visit.operand(0)?.shape())?,
        );
        cx.set_operand_utilization(0, &ShapeIndex::default(), reuse);
    }
    Ok(())
}

/// A tuple only writes its table of element pointers.
fn handle_tuple(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let root = ShapeIndex::default();
    cx.set_bytes_complete();
    let table = visit.shape_size(visit.instruction.shape(), cx)?;
    cx.properties.set(BYTES_ACCESSED, table);
    cx.set_output_bytes_accessed(&root, table);
    for operand_num in 0..visit.operand_count() {
        cx.set_operand_bytes_accessed(operand_num, &root, 0.0);
        cx.set_operand_utilization(operand_num, &root, 0.0);
    }
    Ok(())
}

/// Slicing reads as many bytes of its input as it writes.
fn handle_slice(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let root = ShapeIndex::default();
    // The input's size no longer matters.
    cx.set_bytes_complete();
    let shape = visit.instruction.shape();
    let output = visit.shape_size(shape, cx)?;
    cx.properties.set(BYTES_ACCESSED, 2.0 * output);
    cx.set_output_bytes_accessed(&root, output);
    cx.set_operand_bytes_accessed(0, &root, output);
    let input = visit.operand(0)?.shape();
    let utilization = ratio(elements(visit, shape)?, elements(visit, input)?);
    cx.set_operand_utilization(0, &root, utilization);
    Ok(())
}

/// Bytes of the operands from `first` on, which are read in full.
fn trailing_operand_bytes(visit: &Visit<'_>, first: usize, cx: &mut VisitContext) -> Result<f64> {
    let mut bytes = 0.0;
    for operand_num in first..visit.operand_count() {
        bytes += visit.shape_size(visit.operand(operand_num)?.shape(), cx)?;
    }
    Ok(bytes)
}

fn handle_dynamic_slice(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    handle_slice(visit, cx)?;
    let indices = trailing_operand_bytes(visit, 1, cx)?;
    cx.properties.add(BYTES_ACCESSED, indices);
    Ok(())
}

/// The buffer being updated is aliased to the result, so only the update region is written.
fn handle_dynamic_update_slice(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let root = ShapeIndex::default();
    cx.set_bytes_complete();
    let update = visit.shape_size(visit.operand(1)?.shape(), cx)?;
    let indices = trailing_operand_bytes(visit, 2, cx)?;
    cx.properties.set(BYTES_ACCESSED, 2.0 * update + indices);
    cx.set_output_bytes_accessed(&root, update);
    cx.set_operand_bytes_accessed(0, &root, 0.0);
    cx.set_operand_utilization(0, &root, 0.0);
    Ok(())
}

fn handle_gather(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let root = ShapeIndex::default();
    cx.set_bytes_complete();
    let shape = visit.instruction.shape();
    let output = visit.shape_size(shape, cx)?;
    let indices = visit.shape_size(visit.operand(1)?.shape(), cx)?;
    cx.properties.set(BYTES_ACCESSED, 2.0 * output + indices);
    cx.set_output_bytes_accessed(&root, output);
    cx.set_operand_bytes_accessed(0, &root, output);
    let input = visit.operand(0)?.shape();
    let utilization = ratio(elements(visit, shape)?, elements(visit, input)?);
    cx.set_operand_utilization(0, &root, utilization);
    Ok(())
}

/// Operands are `inputs..., indices, updates...`. Each updated element is read from the input and
/// the updates, combined, and written back.
fn handle_scatter(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let count = visit.operand_count();
    if count < 3 || count % 2 == 0 {
        return Err(visit.malformed(format!("scatter with {} operands", count)));
    }
    let inputs = (count - 1) / 2;
    let root = ShapeIndex::default();

    let mut bytes = visit.shape_size(visit.operand(inputs)?.shape(), cx)?;
    let mut output = 0.0;
    for input_num in 0..inputs {
        let update_num = inputs + 1 + input_num;
        let update_shape = visit.operand(update_num)?.shape();
        let update = visit.shape_size(update_shape, cx)?;
        bytes += 3.0 * update;
        output += update;
        cx.set_operand_bytes_accessed(input_num, &root, update);
        cx.set_operand_bytes_accessed(update_num, &root, update);
        let input = visit.operand(input_num)?.shape();
        let utilization = ratio(elements(visit, update_shape)?, elements(visit, input)?);
        cx.set_operand_utilization(input_num, &root, utilization);
    }
    cx.properties.set(BYTES_ACCESSED, bytes);
    cx.set_output_bytes_accessed(&root, output);

    let combiner = visit.process_subcomputation(visit.instruction.called(0)?, cx)?;
    let updated = elements(visit, visit.operand(inputs + 1)?.shape())?;
    cx.add_scaled(&combiner, updated as f64);
    Ok(())
}

fn handle_dot(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let flops = formulas::dot_flops(
        visit.operand(0)?.shape(),
        visit.operand(1)?.shape(),
        visit.instruction.dot_dimension_numbers()?,
    )
    .map_err(|err| visit.malformed(err))?;
    cx.properties.set(FLOPS, flops as f64);
    Ok(())
}

pub fn default_convolution_flops(
    visit: &Visit<'_>,
    lhs: &Shape,
    rhs: &Shape,
    result: &Shape,
) -> Result<i64> {
    formulas::convolution_flops(lhs, rhs, result, visit.instruction.convolution()?)
        .map_err(|err| visit.malformed(err))
}

fn handle_convolution(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let flops = visit.model().convolution_flops(
        visit,
        visit.operand(0)?.shape(),
        visit.operand(1)?.shape(),
        visit.instruction.shape(),
    )?;
    cx.properties.set(FLOPS, flops as f64);
    Ok(())
}

fn handle_fft(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let input = first_result(visit.operand(0)?.shape());
    let flops = formulas::fft_flops(input, visit.instruction.fft_length()?)
        .map_err(|err| visit.malformed(err))?;
    cx.properties.set(FLOPS, flops as f64);
    Ok(())
}

/// Size of the minor dimension of a matrix operand.
fn minor_dim(visit: &Visit<'_>, shape: &Shape) -> Result<i64> {
    shape
        .dims()
        .last()
        .copied()
        .ok_or_else(|| visit.malformed("expected a matrix operand, not a scalar"))
}

/// Only the triangle of `a` holding the factor is read.
fn handle_triangular_solve(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let root = ShapeIndex::default();
    let a = visit.operand(0)?.shape();
    let b = visit.operand(1)?.shape();
    let half_a = visit.shape_size(a, cx)? / 2.0;
    let b_bytes = visit.shape_size(b, cx)?;
    let output = visit.shape_size(visit.instruction.shape(), cx)?;
    cx.properties.set(BYTES_ACCESSED, output + half_a + b_bytes);
    cx.set_operand_bytes_accessed(0, &root, half_a);

    let flops = product(visit, &[FMA_FLOPS, minor_dim(visit, a)?, elements(visit, b)?])?;
    cx.properties.set(FLOPS, flops as f64);
    Ok(())
}

fn handle_cholesky(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let root = ShapeIndex::default();
    let a = visit.operand(0)?.shape();
    let half_a = visit.shape_size(a, cx)? / 2.0;
    cx.properties.set(BYTES_ACCESSED, 2.0 * half_a);
    cx.set_output_bytes_accessed(&root, half_a);
    cx.set_operand_bytes_accessed(0, &root, half_a);

    let elems = product(visit, &[minor_dim(visit, a)?, elements(visit, a)?])?;
    cx.properties.set(FLOPS, (elems / 3) as f64);
    Ok(())
}

fn handle_sort(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let count = elements(visit, visit.operand(0)?.shape())?;
    let flops = formulas::sort_flops(count).map_err(|err| visit.malformed(err))?;
    cx.properties.set(FLOPS, flops as f64);
    Ok(())
}

/// Generating a random number is priced like a transcendental function.
fn handle_rng(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let mut count = 0.0;
    for (_, leaf) in visit.instruction.shape().leaf_shapes() {
        count += elements(visit, leaf)? as f64;
    }
    cx.properties.set(TRANSCENDENTALS, count);
    Ok(())
}

/// The reducer runs once per input element that does not start a reduction.
fn handle_reduce(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let reducer = visit.process_subcomputation(visit.instruction.called(0)?, cx)?;
    let input = elements(visit, visit.operand(0)?.shape())?;
    let output = elements(visit, first_result(visit.instruction.shape()))?;
    cx.add_scaled(&reducer, (input - output).max(0) as f64);
    Ok(())
}

fn handle_reduce_window(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let reducer = visit.process_subcomputation(visit.instruction.called(0)?, cx)?;
    let window = window_size(visit)?;
    let output = elements(visit, first_result(visit.instruction.shape()))?;
    let steps = product(visit, &[(window - 1).max(0), output])?;
    cx.add_scaled(&reducer, steps as f64);
    Ok(())
}

fn handle_select_and_scatter(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let select = visit.process_subcomputation(visit.instruction.called(0)?, cx)?;
    let scatter = visit.process_subcomputation(visit.instruction.called(1)?, cx)?;
    let window = window_size(visit)?;
    let source = elements(visit, visit.operand(1)?.shape())?;
    let comparisons = product(visit, &[source, (window - 1).max(0)])?;
    cx.add_scaled(&select, comparisons as f64);
    cx.add_scaled(&scatter, source as f64);
    Ok(())
}

fn handle_map(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let mapper = visit.process_subcomputation(visit.instruction.called(0)?, cx)?;
    let count = elements(visit, visit.instruction.shape())?;
    cx.add_scaled(&mapper, count as f64);
    Ok(())
}

/// Costs one trip through the loop, since the trip count is unknown.
fn handle_while(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let condition = visit.process_subcomputation(visit.instruction.called(0)?, cx)?;
    let body = visit.process_subcomputation(visit.instruction.called(1)?, cx)?;
    let trip = body.then(&condition);
    cx.replace_with(&trip);
    cx.set_optimal_seconds(trip.optimal_seconds);
    Ok(())
}

/// Costs the most expensive branch, key by key.
fn handle_conditional(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let (&first, rest) = visit
        .instruction
        .called_computations()
        .split_first()
        .ok_or_else(|| visit.malformed("conditional without branches"))?;
    let mut worst = visit.process_subcomputation(first, cx)?;
    for &branch in rest {
        let sub = visit.process_subcomputation(branch, cx)?;
        worst = worst.max_with(&sub);
    }
    cx.replace_with(&worst);
    cx.set_optimal_seconds(worst.optimal_seconds);
    Ok(())
}

fn handle_call(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let callee = visit.process_subcomputation(visit.instruction.called(0)?, cx)?;
    cx.replace_with(&callee);
    cx.set_optimal_seconds(callee.optimal_seconds);
    Ok(())
}

/// An opaque target. Whatever computations it names are assumed to run once each, on top of the
/// target reading its operands and writing its result.
fn handle_custom_call(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    for &called in visit.instruction.called_computations() {
        let sub = visit.process_subcomputation(called, cx)?;
        cx.add_all(&sub);
    }
    Ok(())
}

fn handle_async_start(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let wrapped = visit.process_subcomputation(visit.instruction.called(0)?, cx)?;
    cx.add_all(&wrapped);
    Ok(())
}

/// Collectives move data rather than compute on it.
fn handle_collective(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let root = ShapeIndex::default();
    let mut output = 0.0;
    for (_, leaf) in visit.instruction.shape().leaf_shapes() {
        if leaf.is_array() {
            output += visit.shape_size(leaf, cx)?;
        }
    }
    cx.set_output_bytes_accessed(&root, output);

    let mut bytes = output;
    for operand_num in 0..visit.operand_count() {
        let mut operand_bytes = 0.0;
        for (_, leaf) in visit.operand(operand_num)?.shape().leaf_shapes() {
            if leaf.is_array() {
                operand_bytes += visit.shape_size(leaf, cx)?;
            }
        }
        cx.set_operand_bytes_accessed(operand_num, &root, operand_bytes);
        bytes += operand_bytes;
    }
    cx.properties.set(BYTES_ACCESSED, bytes);
    cx.properties.set(FLOPS, 0.0);
    Ok(())
}

pub fn default_fusion_utilizations(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    for operand_num in 0..visit.operand_count() {
        cx.set_operand_utilization(operand_num, &ShapeIndex::default(), 1.0);
    }
    Ok(())
}

/// If the output at `index` is produced by an in-place update of a buffer, the shape of the update.
fn in_place_update<'a>(
    visit: &Visit<'a>,
    root: InstrId,
    index: &ShapeIndex,
) -> Result<Option<&'a Shape>> {
    let module = visit.module;
    let producer = match index.iter().next() {
        None => Some(root),
        Some(&element)
            if index.len() == 1 && module.instruction(root)?.opcode() == Opcode::Tuple =>
        {
            module.operands(root)?.get(element).copied()
        }
        Some(_) => None,
    };
    match producer {
        Some(producer) if module.instruction(producer)?.opcode() == Opcode::DynamicUpdateSlice => {
            Ok(Some(module.operand(producer, 1)?.shape()))
        }
        _ => Ok(None),
    }
}

/// A fusion does the work of its fused region, but values inside the region never touch memory:
/// only the fusion's own inputs and outputs count as bytes accessed.
fn handle_fusion(visit: &Visit<'_>, cx: &mut VisitContext) -> Result<()> {
    let module = visit.module;
    let fused = visit.instruction.called(0)?;
    let region = visit.process_subcomputation(fused, cx)?;
    for (key, value) in region.properties.iter() {
        if key != BYTES_ACCESSED {
            cx.properties.set(key, value);
        }
    }

    let fused_root = module.root(fused)?;
    let shape = visit.instruction.shape();
    // Every byte count below is recomputed from what the region actually touches.
    cx.set_bytes_complete();
    let mut bytes = 0.0;
    for (index, leaf) in shape.leaf_shapes() {
        if !leaf.is_array() {
            continue;
        }
        let written = in_place_update(visit, fused_root, &index)?.unwrap_or(leaf);
        let size = visit.shape_size(written, cx)?;
        cx.set_output_bytes_accessed(&index, size);
        bytes += size;
    }
    if shape.is_tuple() {
        cx.set_output_bytes_accessed(&ShapeIndex::default(), bytes);
    }

    (visit.model().fusion_utilizations)(visit, cx)?;

    let computation = module.computation(fused)?;
    for operand_num in 0..visit.operand_count() {
        let node = computation.parameter(operand_num).ok_or_else(|| {
            visit.malformed(format!(
                "fused computation has no parameter {}",
                operand_num
            ))
        })?;
        let parameter = InstrId {
            computation: fused,
            node,
        };
        let parameter_shape = module.instruction(parameter)?.shape();

        let read = if parameter_shape.is_tuple() {
            let mut read = 0.0;
            for (index, _) in parameter_shape.leaf_shapes() {
                let path: Vec<usize> = index.iter().copied().collect();
                if let Some(element) = visit.fused_tuple_element(parameter, &path)? {
                    let size = visit.fusion_parameter_read_bytes(element, cx)?;
                    cx.set_operand_bytes_accessed(operand_num, &index, size);
                    read += size;
                }
            }
            read
        } else {
            visit.fusion_parameter_read_bytes(parameter, cx)?
        };
        cx.set_operand_bytes_accessed(operand_num, &ShapeIndex::default(), read);
        bytes += read;
    }
    cx.properties.set(BYTES_ACCESSED, bytes);
    Ok(())
}
