use bitvec::vec::BitVec;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, instrument, warn};

use crate::error::{CostError, Result};
use crate::ir::{ComputationId, InstrId, Instruction, InstructionVisitor, Module, Operands};
use crate::options::Options;
use crate::properties::{
    operand_bytes_accessed_key, operand_utilization_key, output_bytes_accessed_key, Properties,
    BYTES_ACCESSED, FLOPS, OPTIMAL_SECONDS, TRANSCENDENTALS,
};
use crate::shape::{Shape, ShapeIndex};

pub mod handlers;
pub mod subcomputation;

pub use handlers::{default_handler, CostModel, Handler};
pub use subcomputation::Subcomputation;

/// The committed cost of one instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct InstructionCost {
    pub properties: Properties,
    /// False if some shape this instruction's byte counts depend on had no layout, so those counts
    /// are lower bounds rather than estimates.
    pub bytes_complete: bool,
}

#[derive(Clone, Debug)]
struct Record {
    cost: InstructionCost,
    // Instructions of called computations whose records were committed along with this one.
    nested: Vec<InstrId>,
}

/// The record under construction for the instruction being visited. Preprocessing fills in the
/// defaults, the instruction's handler adjusts them, and postprocessing commits the result.
#[derive(Clone, Debug)]
pub struct VisitContext {
    pub properties: Properties,
    /// Derive optimal seconds from the per-second rates, rather than keeping whatever the handler
    /// set directly.
    pub compute_bottleneck_time: bool,
    bytes_complete: bool,
    nested: Vec<(InstrId, InstructionCost)>,
}

impl VisitContext {
    fn new() -> Self {
        VisitContext {
            properties: Properties::new(),
            compute_bottleneck_time: true,
            bytes_complete: true,
            nested: Vec::new(),
        }
    }

    pub fn set_operand_bytes_accessed(
        &mut self,
        operand_num: usize,
        index: &ShapeIndex,
        value: f64,
    ) {
        self.properties
            .set(operand_bytes_accessed_key(operand_num, index), value);
    }

    pub fn set_operand_utilization(&mut self, operand_num: usize, index: &ShapeIndex, value: f64) {
        self.properties
            .set(operand_utilization_key(operand_num, index), value);
    }

    pub fn set_output_bytes_accessed(&mut self, index: &ShapeIndex, value: f64) {
        self.properties.set(output_bytes_accessed_key(index), value);
    }

    /// Overrides the derived execution time.
    pub fn set_optimal_seconds(&mut self, seconds: f64) {
        self.compute_bottleneck_time = false;
        self.properties.set(OPTIMAL_SECONDS, seconds);
    }

    pub fn bytes_complete(&self) -> bool {
        self.bytes_complete
    }

    /// Declares the byte counts exact, for handlers which replace every default byte count.
    /// Shapes sized afterwards through `Visit::shape_size` still mark the record incomplete if
    /// they lack a layout.
    pub fn set_bytes_complete(&mut self) {
        self.bytes_complete = true;
    }

    /// Adds a called computation's cost `times` times over. Memory traffic stays the caller's
    /// own: a function applied per element works on values already in registers.
    pub fn add_scaled(&mut self, sub: &Subcomputation, times: f64) {
        for (key, value) in sub.properties.iter() {
            if key != BYTES_ACCESSED {
                self.properties.add(key, value * times);
            }
        }
    }

    /// Adds a called computation's cost, memory traffic included, on top of the current record.
    pub fn add_all(&mut self, sub: &Subcomputation) {
        for (key, value) in sub.properties.iter() {
            self.properties.add(key, value);
        }
        self.bytes_complete &= sub.bytes_complete;
    }

    /// Makes a called computation's cost the whole cost of this instruction.
    pub fn replace_with(&mut self, sub: &Subcomputation) {
        for key in [FLOPS, TRANSCENDENTALS, BYTES_ACCESSED] {
            self.properties.set(key, 0.0);
        }
        self.bytes_complete = true;
        self.add_all(sub);
    }
}

/// Everything a handler may look at while costing one instruction.
pub struct Visit<'a> {
    pub analysis: &'a CostAnalysis,
    pub module: &'a Module,
    pub id: InstrId,
    pub instruction: &'a Instruction,
    pub operands: Operands,
}

impl<'a> Visit<'a> {
    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    pub fn operand(&self, operand_num: usize) -> Result<&'a Instruction> {
        match self.operands.get(operand_num) {
            Some(&operand) => self.module.instruction(operand),
            None => Err(self.malformed(format!("missing operand #{}", operand_num))),
        }
    }

    pub fn model(&self) -> &'a CostModel {
        &self.analysis.model
    }

    /// Byte size of `shape` as this instruction sees it; see `CostAnalysis::bytes_of`.
    pub fn shape_size(&self, shape: &Shape, cx: &mut VisitContext) -> Result<f64> {
        self.analysis.bytes_of(self.instruction, shape, cx)
    }

    pub fn process_subcomputation(
        &self,
        computation: ComputationId,
        cx: &mut VisitContext,
    ) -> Result<Subcomputation> {
        self.analysis
            .process_subcomputation(self.module, computation, cx)
    }

    pub fn malformed(&self, reason: impl std::fmt::Display) -> CostError {
        CostError::malformed(self.instruction.name(), reason.to_string())
    }
}

/// Computes and aggregates the cost of every instruction in a computation.
///
/// A full traversal is driven through `analyze` (or any driver speaking `InstructionVisitor`).
/// Afterwards single instructions can be taken out with `remove_instruction` or recomputed with
/// `revisit_instruction` while the running totals stay equal to the sum of the committed records.
#[derive(Clone, Debug)]
pub struct CostAnalysis {
    options: Options,
    model: CostModel,
    records: HashMap<InstrId, Record>,
    // Records from called computations, with how many top-level records own each.
    nested: HashMap<InstrId, (InstructionCost, usize)>,
    properties_sum: Properties,
    // Computations being analyzed by this instance or one of its callers.
    call_stack: BitVec,
}

impl CostAnalysis {
    pub fn new(options: Options) -> Self {
        Self::with_model(options, CostModel::default())
    }

    pub fn with_model(options: Options, model: CostModel) -> Self {
        CostAnalysis {
            options,
            model,
            records: HashMap::new(),
            nested: HashMap::new(),
            properties_sum: Properties::new(),
            call_stack: BitVec::new(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn model(&self) -> &CostModel {
        &self.model
    }

    fn on_call_stack(&self, computation: ComputationId) -> bool {
        self.call_stack
            .get(computation.index())
            .map_or(false, |bit| *bit)
    }

    fn set_on_call_stack(&mut self, computation: ComputationId, value: bool) {
        let idx = computation.index();
        if self.call_stack.len() <= idx {
            self.call_stack.resize(idx + 1, false);
        }
        self.call_stack.set(idx, value);
    }

    /// Runs a full traversal over `computation`. On failure nothing from this traversal is kept.
    #[instrument(level = "debug", skip(self, module))]
    pub fn analyze(&mut self, module: &Module, computation: ComputationId) -> Result<()> {
        if self.on_call_stack(computation) {
            let name = module.computation(computation)?.name().to_owned();
            return Err(CostError::RecursiveComputation(name));
        }

        let saved = (
            self.records.clone(),
            self.nested.clone(),
            self.properties_sum.clone(),
        );
        self.set_on_call_stack(computation, true);
        let result = module.accept(computation, self);
        self.set_on_call_stack(computation, false);

        if let Err(err) = result {
            (self.records, self.nested, self.properties_sum) = saved;
            return Err(err);
        }
        Ok(())
    }

    pub fn analyze_entry(&mut self, module: &Module) -> Result<()> {
        let entry = module
            .entry()
            .ok_or_else(|| CostError::malformed("module", "no entry computation"))?;
        self.analyze(module, entry)
    }

    /// Byte size of a shape for aggregation. Without a shape-size function every size is zero
    /// (byte queries report the missing function instead). A shape without a layout is also zero,
    /// and taints the record under construction, unless layouts are required.
    pub(crate) fn bytes_of(
        &self,
        instruction: &Instruction,
        shape: &Shape,
        cx: &mut VisitContext,
    ) -> Result<f64> {
        if !self.options.has_shape_size() {
            return Ok(0.0);
        }
        if !shape.has_layout() {
            if self.options.strict_layouts() {
                return Err(CostError::MissingLayout {
                    instruction: instruction.name().to_owned(),
                });
            }
            warn!(
                instruction = instruction.name(),
                %shape,
                "shape has no layout, counting it as zero bytes"
            );
            cx.bytes_complete = false;
            return Ok(0.0);
        }
        Ok(self.options.shape_size(shape).unwrap_or(0) as f64)
    }

    /// Byte size of a shape, failing if it cannot be known.
    pub fn shape_size(&self, shape: &Shape) -> Result<i64> {
        if !shape.has_layout() {
            return Err(CostError::MissingLayout {
                instruction: shape.to_string(),
            });
        }
        self.options
            .shape_size(shape)
            .ok_or(CostError::MissingShapeSize)
    }

    /// Starts the record for `id`: its operands and result are each touched once in full, and it
    /// performs no arithmetic.
    pub fn preprocess(&self, module: &Module, id: InstrId) -> Result<VisitContext> {
        let instruction = module.instruction(id)?;
        let mut cx = VisitContext::new();
        cx.properties.set(FLOPS, 0.0);
        cx.properties.set(TRANSCENDENTALS, 0.0);

        let root = ShapeIndex::default();
        let output = self.bytes_of(instruction, instruction.shape(), &mut cx)?;
        cx.set_output_bytes_accessed(&root, output);
        let mut bytes = output;
        for (operand_num, operand) in module.operands(id)?.into_iter().enumerate() {
            let size = self.bytes_of(instruction, module.instruction(operand)?.shape(), &mut cx)?;
            bytes += size;
            cx.set_operand_bytes_accessed(operand_num, &root, size);
            cx.set_operand_utilization(operand_num, &root, 1.0);
        }
        cx.properties.set(BYTES_ACCESSED, bytes);
        Ok(cx)
    }

    /// Applies the cost model's handler for the instruction's opcode.
    pub fn handle(&self, module: &Module, id: InstrId, cx: &mut VisitContext) -> Result<()> {
        let instruction = module.instruction(id)?;
        let visit = Visit {
            analysis: self,
            module,
            id,
            instruction,
            operands: module.operands(id)?,
        };
        let handler = self.model.handler(instruction.opcode());
        handler(&visit, cx)
    }

    /// Finishes the record for `id` and commits it, along with the records of any computations
    /// it called, adding its summable properties to the running totals.
    pub fn postprocess(&mut self, id: InstrId, mut cx: VisitContext) -> Result<()> {
        if self.records.contains_key(&id) {
            return Err(CostError::AlreadyAnalyzed(id.to_string()));
        }

        if cx.compute_bottleneck_time {
            // The slowest resource bounds the execution time.
            let optimal_seconds = cx
                .properties
                .iter()
                .filter(|&(key, _)| key != OPTIMAL_SECONDS)
                .filter_map(|(key, value)| self.options.rate(key).map(|rate| value / rate))
                .fold(0.0, f64::max);
            cx.properties.set(OPTIMAL_SECONDS, optimal_seconds);
        }

        let mut owned = BTreeSet::new();
        for (nested_id, cost) in cx.nested {
            if owned.insert(nested_id) {
                // The newest record wins for every owner sharing the computation.
                match self.nested.entry(nested_id) {
                    Entry::Occupied(mut entry) => {
                        let owners = entry.get().1;
                        entry.insert((cost, owners + 1));
                    }
                    Entry::Vacant(entry) => {
                        entry.insert((cost, 1));
                    }
                }
            }
        }

        self.properties_sum
            .accumulate(&cx.properties, self.model.schema());
        debug!(
            instruction = %id,
            flops = cx.properties.get(FLOPS),
            transcendentals = cx.properties.get(TRANSCENDENTALS),
            bytes_accessed = cx.properties.get(BYTES_ACCESSED),
            "committed cost record"
        );
        let cost = InstructionCost {
            properties: cx.properties,
            bytes_complete: cx.bytes_complete,
        };
        self.records.insert(
            id,
            Record {
                cost,
                nested: owned.into_iter().collect(),
            },
        );
        Ok(())
    }

    fn visit_instruction(&mut self, module: &Module, id: InstrId) -> Result<()> {
        let mut cx = self.preprocess(module, id)?;
        self.handle(module, id, &mut cx)?;
        self.postprocess(id, cx)
    }

    /// Takes the committed record of `id` out of the analysis, together with the records of the
    /// computations it called.
    #[instrument(level = "debug", skip(self))]
    pub fn remove_instruction(&mut self, id: InstrId) -> Result<()> {
        let record = match self.records.remove(&id) {
            Some(record) => record,
            None if self.nested.contains_key(&id) => {
                return Err(CostError::NestedInstruction(id.to_string()))
            }
            None => return Err(CostError::NotAnalyzed(id.to_string())),
        };

        self.properties_sum
            .subtract(&record.cost.properties, self.model.schema());
        for nested_id in record.nested {
            if let Entry::Occupied(mut entry) = self.nested.entry(nested_id) {
                entry.get_mut().1 -= 1;
                if entry.get().1 == 0 {
                    entry.remove();
                }
            }
        }

        if self.records.is_empty() {
            // Nothing is left to sum, so drop any rounding residue.
            self.properties_sum.clear();
        }
        Ok(())
    }

    /// Recomputes the record of `id` from the current state of the graph. An instruction without
    /// a record yet, such as one just added to the graph, is simply analyzed.
    #[instrument(level = "debug", skip(self, module))]
    pub fn revisit_instruction(&mut self, module: &Module, id: InstrId) -> Result<()> {
        match self.remove_instruction(id) {
            Ok(()) | Err(CostError::NotAnalyzed(_)) => {}
            Err(err) => return Err(err),
        }
        self.visit_instruction(module, id)
    }

    fn require_shape_size(&self) -> Result<()> {
        if self.options.has_shape_size() {
            Ok(())
        } else {
            Err(CostError::MissingShapeSize)
        }
    }

    pub fn properties(&self) -> &Properties {
        &self.properties_sum
    }

    pub fn property(&self, key: &str) -> f64 {
        self.properties_sum.get(key)
    }

    pub fn per_second_rate(&self, key: &str) -> f64 {
        self.options.per_second_rate(key)
    }

    pub fn flop_count(&self) -> f64 {
        self.property(FLOPS)
    }

    pub fn transcendental_count(&self) -> f64 {
        self.property(TRANSCENDENTALS)
    }

    pub fn bytes_accessed(&self) -> Result<f64> {
        self.require_shape_size()?;
        Ok(self.property(BYTES_ACCESSED))
    }

    pub fn optimal_seconds(&self) -> f64 {
        self.property(OPTIMAL_SECONDS)
    }

    /// The record of an instruction, whether it was visited directly or as part of a computation
    /// some other instruction calls.
    pub fn cost_of(&self, id: InstrId) -> Option<&InstructionCost> {
        self.records
            .get(&id)
            .map(|record| &record.cost)
            .or_else(|| self.nested.get(&id).map(|(cost, _)| cost))
    }

    pub fn properties_of(&self, id: InstrId) -> Option<&Properties> {
        self.cost_of(id).map(|cost| &cost.properties)
    }

    fn property_of(&self, id: InstrId, key: &str) -> f64 {
        self.properties_of(id).map_or(0.0, |props| props.get(key))
    }

    fn byte_property_of(&self, id: InstrId, key: &str) -> Result<f64> {
        self.require_shape_size()?;
        match self.cost_of(id) {
            Some(cost) if !cost.bytes_complete => Err(CostError::MissingLayout {
                instruction: id.to_string(),
            }),
            Some(cost) => Ok(cost.properties.get(key)),
            None => Ok(0.0),
        }
    }

    pub fn flop_count_of(&self, id: InstrId) -> f64 {
        self.property_of(id, FLOPS)
    }

    pub fn transcendental_count_of(&self, id: InstrId) -> f64 {
        self.property_of(id, TRANSCENDENTALS)
    }

    pub fn bytes_accessed_of(&self, id: InstrId) -> Result<f64> {
        self.byte_property_of(id, BYTES_ACCESSED)
    }

    pub fn optimal_seconds_of(&self, id: InstrId) -> f64 {
        self.property_of(id, OPTIMAL_SECONDS)
    }

    pub fn operand_bytes_accessed(
        &self,
        id: InstrId,
        operand_num: usize,
        index: &ShapeIndex,
    ) -> Result<f64> {
        self.byte_property_of(id, &operand_bytes_accessed_key(operand_num, index))
    }

    /// How much of an operand the instruction uses, assuming its own output is fully used: 1 for
    /// most instructions, less when slicing, more when an input is reused.
    pub fn operand_utilization(&self, id: InstrId, operand_num: usize, index: &ShapeIndex) -> f64 {
        self.property_of(id, &operand_utilization_key(operand_num, index))
    }

    pub fn output_bytes_accessed(&self, id: InstrId, index: &ShapeIndex) -> Result<f64> {
        self.byte_property_of(id, &output_bytes_accessed_key(index))
    }

    /// Bytes the instruction reads from its operands, optionally only from one memory space.
    pub fn bytes_read(
        &self,
        module: &Module,
        id: InstrId,
        memory_space: Option<i64>,
    ) -> Result<f64> {
        let mut bytes = 0.0;
        for (operand_num, operand) in module.operands(id)?.into_iter().enumerate() {
            for (index, shape) in module.instruction(operand)?.shape().leaf_shapes() {
                if memory_space.map_or(true, |space| shape.memory_space() == Some(space)) {
                    bytes += self.operand_bytes_accessed(id, operand_num, &index)?;
                }
            }
        }
        Ok(bytes)
    }

    /// Bytes the instruction writes to its output, optionally only to one memory space.
    pub fn bytes_written(
        &self,
        module: &Module,
        id: InstrId,
        memory_space: Option<i64>,
    ) -> Result<f64> {
        let mut bytes = 0.0;
        for (index, shape) in module.instruction(id)?.shape().leaf_shapes() {
            if memory_space.map_or(true, |space| shape.memory_space() == Some(space)) {
                bytes += self.output_bytes_accessed(id, &index)?;
            }
        }
        Ok(bytes)
    }
}

impl InstructionVisitor for CostAnalysis {
    type Error = CostError;

    fn visit(&mut self, module: &Module, id: InstrId) -> Result<()> {
        self.visit_instruction(module, id)
    }

    fn finish_visit(&mut self, _module: &Module, root: InstrId) -> Result<()> {
        debug!(
            root = %root,
            flops = self.flop_count(),
            transcendentals = self.transcendental_count(),
            bytes_accessed = self.property(BYTES_ACCESSED),
            optimal_seconds = self.optimal_seconds(),
            "finished computation"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Attributes, Computation, Opcode};
    use crate::shape::{byte_size_fn, ElementType};

    fn f32s(dims: &[i64]) -> Shape {
        Shape::array(ElementType::F32, dims)
    }

    #[test]
    fn preprocess_defaults() {
        let mut comp = Computation::new("entry");
        let p = comp.add_instruction(
            Instruction::new("p", Opcode::Parameter, f32s(&[3]))
                .with_attributes(Attributes::ParameterNumber(0)),
            &[],
        );
        let node = comp.add_instruction(
            Instruction::new("sub", Opcode::Subtract, f32s(&[3])),
            &[p, p],
        );
        let mut module = Module::new();
        let computation = module.add_entry_computation(comp);

        let analysis = CostAnalysis::new(Options::new(byte_size_fn(8)));
        let cx = analysis
            .preprocess(&module, InstrId { computation, node })
            .unwrap();
        let root = ShapeIndex::default();
        assert!(cx.compute_bottleneck_time);
        assert!(cx.bytes_complete());
        assert_eq!(cx.properties.get(FLOPS), 0.0);
        assert_eq!(cx.properties.get(BYTES_ACCESSED), 36.0);
        assert_eq!(cx.properties.get(&output_bytes_accessed_key(&root)), 12.0);
        assert_eq!(cx.properties.get(&operand_bytes_accessed_key(1, &root)), 12.0);
        assert_eq!(cx.properties.get(&operand_utilization_key(1, &root)), 1.0);
    }

    #[test]
    fn folding() {
        let sub = Subcomputation {
            properties: [(FLOPS, 2.0), (BYTES_ACCESSED, 8.0)].into_iter().collect(),
            optimal_seconds: 1.0,
            bytes_complete: false,
        };

        let mut cx = VisitContext::new();
        cx.properties.set(BYTES_ACCESSED, 100.0);
        cx.add_scaled(&sub, 10.0);
        assert_eq!(cx.properties.get(FLOPS), 20.0);
        assert_eq!(cx.properties.get(BYTES_ACCESSED), 100.0);
        assert!(cx.bytes_complete());

        cx.replace_with(&sub);
        assert_eq!(cx.properties.get(FLOPS), 2.0);
        assert_eq!(cx.properties.get(BYTES_ACCESSED), 8.0);
        assert!(!cx.bytes_complete());

        cx.set_optimal_seconds(sub.optimal_seconds);
        assert!(!cx.compute_bottleneck_time);
        assert_eq!(cx.properties.get(OPTIMAL_SECONDS), 1.0);
    }

    #[test]
    fn unrated_keys_do_not_bound_time() {
        let mut options = Options::new(byte_size_fn(8));
        options.set_transcendentals_per_second(2.0);
        let mut analysis = CostAnalysis::new(options);

        let mut cx = VisitContext::new();
        cx.properties.set(FLOPS, 1e9);
        cx.properties.set(TRANSCENDENTALS, 8.0);
        let id = InstrId {
            computation: Module::new().add_computation(Computation::new("c")),
            node: petgraph::stable_graph::NodeIndex::new(0),
        };
        analysis.postprocess(id, cx).unwrap();
        assert_eq!(analysis.optimal_seconds_of(id), 4.0);
        assert_eq!(analysis.optimal_seconds(), 4.0);
        assert_eq!(analysis.flop_count(), 1e9);
    }
}
