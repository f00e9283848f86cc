use tracing::{instrument, trace};

use super::{CostAnalysis, Visit, VisitContext};
use crate::error::{CostError, Result};
use crate::ir::{ComputationId, InstrId, Module, Opcode};
use crate::properties::{Properties, FLOPS, OPTIMAL_SECONDS};

/// Total cost of a called computation, as its caller sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct Subcomputation {
    /// The keys of the computation's totals which propagate to callers.
    pub properties: Properties,
    pub optimal_seconds: f64,
    pub bytes_complete: bool,
}

impl Default for Subcomputation {
    fn default() -> Self {
        Subcomputation {
            properties: Properties::new(),
            optimal_seconds: 0.0,
            bytes_complete: true,
        }
    }
}

impl Subcomputation {
    /// The cost of running `self` and then `other`.
    pub fn then(mut self, other: &Subcomputation) -> Self {
        for (key, value) in other.properties.iter() {
            self.properties.add(key, value);
        }
        self.optimal_seconds += other.optimal_seconds;
        self.bytes_complete &= other.bytes_complete;
        self
    }

    /// The key-wise worst case of `self` and `other`, when only one of them runs.
    pub fn max_with(mut self, other: &Subcomputation) -> Self {
        self.properties.max_with(&other.properties);
        self.optimal_seconds = self.optimal_seconds.max(other.optimal_seconds);
        self.bytes_complete &= other.bytes_complete;
        self
    }
}

impl CostAnalysis {
    fn nested_analysis(&self, computation: ComputationId) -> CostAnalysis {
        let mut nested = CostAnalysis::with_model(self.options.clone(), self.model.clone());
        nested.call_stack = self.call_stack.clone();
        nested.set_on_call_stack(computation, true);
        nested
    }

    /// Analyzes a computation called by the instruction under construction in `cx`, using the same
    /// options and cost model. The records of the called instructions travel with `cx` and are
    /// committed alongside the caller's, but never count towards the running totals themselves.
    #[instrument(level = "trace", skip(self, module, cx))]
    pub fn process_subcomputation(
        &self,
        module: &Module,
        computation: ComputationId,
        cx: &mut VisitContext,
    ) -> Result<Subcomputation> {
        let name = module.computation(computation)?.name();
        if self.on_call_stack(computation) {
            return Err(CostError::RecursiveComputation(name.to_owned()));
        }

        let mut nested = self.nested_analysis(computation);
        module.accept(computation, &mut nested)?;

        let mut bytes_complete = true;
        for (id, record) in nested.records {
            bytes_complete &= record.cost.bytes_complete;
            cx.nested.push((id, record.cost));
        }
        for (id, (cost, _)) in nested.nested {
            cx.nested.push((id, cost));
        }

        let totals = nested.properties_sum;
        trace!(
            computation = name,
            flops = totals.get(FLOPS),
            "folding called computation"
        );
        Ok(Subcomputation {
            properties: totals.propagated(self.model.schema()),
            optimal_seconds: totals.get(OPTIMAL_SECONDS),
            bytes_complete,
        })
    }
}

/// The instruction which extracts element `index` of the tuple-shaped `value`, if any.
fn tuple_element_user(module: &Module, value: InstrId, index: usize) -> Result<Option<InstrId>> {
    for (user, _) in module.users(value)? {
        let instr = module.instruction(user)?;
        if instr.opcode() == Opcode::GetTupleElement && instr.tuple_index() == Some(index) {
            return Ok(Some(user));
        }
    }
    Ok(None)
}

impl<'a> Visit<'a> {
    /// Follows get-tuple-element users from a tuple-shaped fused parameter down to the value at
    /// `index`, if the fused region ever extracts it.
    pub fn fused_tuple_element(
        &self,
        parameter: InstrId,
        index: &[usize],
    ) -> Result<Option<InstrId>> {
        let mut value = parameter;
        for &i in index {
            match tuple_element_user(self.module, value, i)? {
                Some(element) => value = element,
                None => return Ok(None),
            }
        }
        Ok(Some(value))
    }

    /// Bytes of `value`, a fused parameter or an element of one, which the fused region reads.
    /// Slicing users only read what they extract; every other use reads the whole value once.
    pub fn fusion_parameter_read_bytes(
        &self,
        value: InstrId,
        cx: &mut VisitContext,
    ) -> Result<f64> {
        let module = self.module;
        let full = self.shape_size(module.instruction(value)?.shape(), cx)?;
        let mut bytes = 0.0;
        let mut reads_whole_value = false;

        for (user, operand_num) in module.users(value)? {
            let instr = module.instruction(user)?;
            match instr.opcode() {
                Opcode::Slice => bytes += self.shape_size(instr.shape(), cx)?,
                Opcode::DynamicSlice if operand_num == 0 => {
                    bytes += self.shape_size(instr.shape(), cx)?
                }
                Opcode::DynamicUpdateSlice if operand_num == 0 => {
                    // Updated in place: only the region being overwritten is touched.
                    bytes += self.shape_size(module.operand(user, 1)?.shape(), cx)?
                }
                Opcode::DynamicSlice | Opcode::DynamicUpdateSlice => bytes += full,
                Opcode::Broadcast | Opcode::Reshape => bytes += full,
                Opcode::Fusion => {
                    let fused = instr.called(0)?;
                    let computation = module.computation(fused)?;
                    let node = computation.parameter(operand_num).ok_or_else(|| {
                        CostError::malformed(
                            instr.name(),
                            format!("fused computation has no parameter {}", operand_num),
                        )
                    })?;
                    let parameter = InstrId {
                        computation: fused,
                        node,
                    };
                    bytes += self.fusion_parameter_read_bytes(parameter, cx)?;
                }
                _ => reads_whole_value = true,
            }
        }

        if reads_whole_value {
            bytes += full;
        }
        Ok(bytes)
    }
}
