use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use smallvec::SmallVec;

use crate::error::{CostError, Result};
use crate::shape::Shape;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ComputationId(u32);

impl ComputationId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identity of one instruction: the computation that owns it and its node in that computation's
/// graph. Identities stay valid while other instructions are added or removed.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InstrId {
    pub computation: ComputationId,
    pub node: NodeIndex,
}

impl std::fmt::Display for InstrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}.{}", self.computation.0, self.node.index())
    }
}

pub type DimList = SmallVec<[usize; 2]>;
pub type Operands = SmallVec<[InstrId; 4]>;
pub type CalledComputations = SmallVec<[ComputationId; 2]>;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Opcode {
    // Elementwise unary.
    Abs,
    Ceil,
    Cbrt,
    Cos,
    Erf,
    Exp,
    Expm1,
    Floor,
    Imag,
    IsFinite,
    Log,
    Log1p,
    Logistic,
    Negate,
    Not,
    PopulationCount,
    Real,
    RoundNearestAfz,
    Rsqrt,
    Sign,
    Sin,
    Sqrt,
    Tan,
    Tanh,

    // Elementwise binary.
    Add,
    And,
    Atan2,
    Complex,
    Divide,
    Maximum,
    Minimum,
    Multiply,
    Or,
    Power,
    Remainder,
    ShiftLeft,
    ShiftRightArithmetic,
    ShiftRightLogical,
    Subtract,
    Xor,

    Clamp,
    Compare,
    Convert,
    ReducePrecision,
    Select,

    Constant,
    Iota,
    Parameter,

    Bitcast,
    Broadcast,
    Concatenate,
    Copy,
    DynamicReshape,
    DynamicSlice,
    DynamicUpdateSlice,
    GetTupleElement,
    Pad,
    Reshape,
    Reverse,
    Slice,
    Transpose,
    Tuple,

    Cholesky,
    Convolution,
    Dot,
    Fft,
    TriangularSolve,

    Gather,
    Map,
    Reduce,
    ReduceWindow,
    Scatter,
    SelectAndScatter,
    Sort,

    BatchNormGrad,
    BatchNormInference,
    BatchNormTraining,

    Call,
    Conditional,
    CustomCall,
    Fusion,
    While,

    AllGather,
    AllGatherDone,
    AllGatherStart,
    AllReduce,
    AllReduceDone,
    AllReduceStart,
    AllToAll,
    CollectivePermute,
    CollectivePermuteDone,
    CollectivePermuteStart,
    PartitionId,
    ReduceScatter,
    ReplicaId,

    AsyncDone,
    AsyncStart,
    AsyncUpdate,
    CopyDone,
    CopyStart,

    Infeed,
    Outfeed,
    Recv,
    RecvDone,
    Send,
    SendDone,

    Rng,
    RngBitGenerator,
    RngGetAndUpdateState,

    AddDependency,
    AfterAll,
    Domain,
    GetDimensionSize,
    OptimizationBarrier,
    SetDimensionSize,
}

impl Opcode {
    pub fn is_elementwise_unary(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Abs | Ceil
                | Cbrt
                | Cos
                | Erf
                | Exp
                | Expm1
                | Floor
                | Imag
                | IsFinite
                | Log
                | Log1p
                | Logistic
                | Negate
                | Not
                | PopulationCount
                | Real
                | RoundNearestAfz
                | Rsqrt
                | Sign
                | Sin
                | Sqrt
                | Tan
                | Tanh
        )
    }

    pub fn is_elementwise_binary(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Add | And
                | Atan2
                | Complex
                | Divide
                | Maximum
                | Minimum
                | Multiply
                | Or
                | Power
                | Remainder
                | ShiftLeft
                | ShiftRightArithmetic
                | ShiftRightLogical
                | Subtract
                | Xor
        )
    }

    /// Elementwise operations which are priced as transcendental functions rather than FLOPs.
    pub fn is_transcendental(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Atan2
                | Cbrt
                | Cos
                | Erf
                | Exp
                | Expm1
                | Log
                | Log1p
                | Logistic
                | Power
                | Rsqrt
                | Sin
                | Sqrt
                | Tan
                | Tanh
        )
    }
}

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct DotDimensionNumbers {
    pub lhs_batch: DimList,
    pub lhs_contracting: DimList,
    pub rhs_batch: DimList,
    pub rhs_contracting: DimList,
}

impl DotDimensionNumbers {
    /// Plain matrix multiplication: contract the last dimension of the lhs with the first
    /// dimension of the rhs.
    pub fn matmul(lhs_rank: usize) -> Self {
        DotDimensionNumbers {
            lhs_contracting: DimList::from_slice(&[lhs_rank.saturating_sub(1)]),
            rhs_contracting: DimList::from_slice(&[0]),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct WindowDimension {
    pub size: i64,
    pub stride: i64,
    pub padding_low: i64,
    pub padding_high: i64,
    pub window_dilation: i64,
    pub base_dilation: i64,
}

impl WindowDimension {
    pub fn new(size: i64) -> Self {
        WindowDimension {
            size,
            stride: 1,
            padding_low: 0,
            padding_high: 0,
            window_dilation: 1,
            base_dilation: 1,
        }
    }

    pub fn with_stride(self, stride: i64) -> Self {
        WindowDimension { stride, ..self }
    }

    pub fn with_padding(self, padding_low: i64, padding_high: i64) -> Self {
        WindowDimension {
            padding_low,
            padding_high,
            ..self
        }
    }

    pub fn with_dilation(self, window_dilation: i64, base_dilation: i64) -> Self {
        WindowDimension {
            window_dilation,
            base_dilation,
            ..self
        }
    }
}

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Window(pub Vec<WindowDimension>);

impl Window {
    pub fn of_sizes(sizes: &[i64]) -> Self {
        Window(sizes.iter().copied().map(WindowDimension::new).collect())
    }

    /// Number of elements covered by one placement of the window, or `None` on overflow.
    pub fn element_count(&self) -> Option<i64> {
        self.0
            .iter()
            .try_fold(1i64, |count, dim| count.checked_mul(dim.size))
    }
}

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct ConvolutionDimensionNumbers {
    pub input_batch: usize,
    pub input_feature: usize,
    pub input_spatial: DimList,
    pub kernel_input_feature: usize,
    pub kernel_output_feature: usize,
    pub kernel_spatial: DimList,
    pub output_batch: usize,
    pub output_feature: usize,
    pub output_spatial: DimList,
}

impl ConvolutionDimensionNumbers {
    /// Batch, feature, then spatial dimensions for input and output; output feature, input
    /// feature, then spatial dimensions for the kernel.
    pub fn nchw(spatial_dims: usize) -> Self {
        let spatial: DimList = (2..2 + spatial_dims).collect();
        ConvolutionDimensionNumbers {
            input_batch: 0,
            input_feature: 1,
            input_spatial: spatial.clone(),
            kernel_output_feature: 0,
            kernel_input_feature: 1,
            kernel_spatial: spatial.clone(),
            output_batch: 0,
            output_feature: 1,
            output_spatial: spatial,
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConvolutionAttributes {
    pub window: Window,
    pub dimension_numbers: ConvolutionDimensionNumbers,
    pub feature_group_count: i64,
    pub batch_group_count: i64,
}

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub enum Attributes {
    #[default]
    None,
    Dot(DotDimensionNumbers),
    Convolution(ConvolutionAttributes),
    Window(Window),
    FftLength(SmallVec<[i64; 3]>),
    TupleIndex(usize),
    ParameterNumber(usize),
    CustomCallTarget(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instruction {
    name: String,
    opcode: Opcode,
    shape: Shape,
    attributes: Attributes,
    called: CalledComputations,
}

impl Instruction {
    pub fn new(name: &str, opcode: Opcode, shape: Shape) -> Self {
        Instruction {
            name: name.to_owned(),
            opcode,
            shape,
            attributes: Attributes::None,
            called: CalledComputations::new(),
        }
    }

    pub fn with_attributes(self, attributes: Attributes) -> Self {
        Self { attributes, ..self }
    }

    /// The computations this instruction calls. Their meaning depends on the opcode: `[condition,
    /// body]` for while, `[select, scatter]` for select-and-scatter, one entry per branch for
    /// conditional, and the applied function or fused region otherwise.
    pub fn with_called(self, called: &[ComputationId]) -> Self {
        Self {
            called: CalledComputations::from_slice(called),
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn set_shape(&mut self, shape: Shape) {
        self.shape = shape;
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn called_computations(&self) -> &[ComputationId] {
        &self.called
    }

    pub fn called(&self, idx: usize) -> Result<ComputationId> {
        self.called.get(idx).copied().ok_or_else(|| {
            CostError::malformed(&self.name, format!("missing called computation #{}", idx))
        })
    }

    pub fn dot_dimension_numbers(&self) -> Result<&DotDimensionNumbers> {
        match &self.attributes {
            Attributes::Dot(dnums) => Ok(dnums),
            _ => Err(self.missing("dot dimension numbers")),
        }
    }

    pub fn convolution(&self) -> Result<&ConvolutionAttributes> {
        match &self.attributes {
            Attributes::Convolution(conv) => Ok(conv),
            _ => Err(self.missing("convolution attributes")),
        }
    }

    pub fn window(&self) -> Result<&Window> {
        match &self.attributes {
            Attributes::Window(window) => Ok(window),
            Attributes::Convolution(conv) => Ok(&conv.window),
            _ => Err(self.missing("window")),
        }
    }

    pub fn fft_length(&self) -> Result<&[i64]> {
        match &self.attributes {
            Attributes::FftLength(lengths) => Ok(lengths),
            _ => Err(self.missing("fft length")),
        }
    }

    pub fn tuple_index(&self) -> Option<usize> {
        match self.attributes {
            Attributes::TupleIndex(idx) => Some(idx),
            _ => None,
        }
    }

    pub fn parameter_number(&self) -> Option<usize> {
        match self.attributes {
            Attributes::ParameterNumber(idx) => Some(idx),
            _ => None,
        }
    }

    fn missing(&self, what: &str) -> CostError {
        CostError::malformed(&self.name, format!("{:?} has no {}", self.opcode, what))
    }
}

/// Instructions are nodes; an edge runs from each operand to its user, labelled with the operand
/// number.
pub type InstructionGraph = StableDiGraph<Instruction, usize>;

#[derive(Clone, Debug)]
pub struct Computation {
    name: String,
    graph: InstructionGraph,
    root: Option<NodeIndex>,
}

impl Computation {
    pub fn new(name: &str) -> Self {
        Computation {
            name: name.to_owned(),
            graph: InstructionGraph::default(),
            root: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds an instruction whose operands, in order, are the given nodes. The most recently added
    /// instruction is the root until `set_root` says otherwise.
    pub fn add_instruction(
        &mut self,
        instruction: Instruction,
        operands: &[NodeIndex],
    ) -> NodeIndex {
        let node = self.graph.add_node(instruction);
        for (operand_num, &operand) in operands.iter().enumerate() {
            self.graph.add_edge(operand, node, operand_num);
        }
        self.root = Some(node);
        node
    }

    pub fn set_root(&mut self, root: NodeIndex) {
        self.root = Some(root);
    }

    pub fn root(&self) -> Option<NodeIndex> {
        self.root
    }

    pub fn instruction(&self, node: NodeIndex) -> Option<&Instruction> {
        self.graph.node_weight(node)
    }

    pub fn instruction_mut(&mut self, node: NodeIndex) -> Option<&mut Instruction> {
        self.graph.node_weight_mut(node)
    }

    /// Removes an instruction and every edge touching it. Users of the removed instruction are
    /// left with fewer operands.
    pub fn remove_instruction(&mut self, node: NodeIndex) -> Option<Instruction> {
        if self.root == Some(node) {
            self.root = None;
        }
        self.graph.remove_node(node)
    }

    pub fn instruction_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn operands(&self, node: NodeIndex) -> SmallVec<[NodeIndex; 4]> {
        let mut edges: SmallVec<[(usize, NodeIndex); 4]> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .map(|e| (*e.weight(), e.source()))
            .collect();
        edges.sort_unstable();
        edges.into_iter().map(|(_, operand)| operand).collect()
    }

    /// Every `(user, operand number)` pair through which `node` is consumed.
    pub fn users(&self, node: NodeIndex) -> impl Iterator<Item = (NodeIndex, usize)> + '_ {
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .map(|e| (e.target(), *e.weight()))
    }

    pub fn parameter(&self, number: usize) -> Option<NodeIndex> {
        self.graph.node_indices().find(|&node| {
            let instr = &self.graph[node];
            instr.opcode() == Opcode::Parameter && instr.parameter_number() == Some(number)
        })
    }

    /// All instructions, each one after all of its operands.
    pub fn post_order(&self) -> Result<Vec<NodeIndex>> {
        petgraph::algo::toposort(&self.graph, None).map_err(|_| CostError::Cycle(self.name.clone()))
    }
}

/// The protocol a traversal driver uses to hand instructions to an analysis.
pub trait InstructionVisitor {
    type Error;

    fn visit(&mut self, module: &Module, id: InstrId) -> Result<(), Self::Error>;

    fn finish_visit(&mut self, _module: &Module, _root: InstrId) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Module {
    computations: Vec<Computation>,
    entry: Option<ComputationId>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_computation(&mut self, computation: Computation) -> ComputationId {
        let id = ComputationId(self.computations.len() as u32);
        self.computations.push(computation);
        id
    }

    /// Adds a computation and makes it the one `entry` returns.
    pub fn add_entry_computation(&mut self, computation: Computation) -> ComputationId {
        let id = self.add_computation(computation);
        self.entry = Some(id);
        id
    }

    pub fn entry(&self) -> Option<ComputationId> {
        self.entry
    }

    pub fn computation_count(&self) -> usize {
        self.computations.len()
    }

    pub fn computation(&self, id: ComputationId) -> Result<&Computation> {
        self.computations
            .get(id.index())
            .ok_or(CostError::UnknownComputation(id.index()))
    }

    pub fn computation_mut(&mut self, id: ComputationId) -> Result<&mut Computation> {
        self.computations
            .get_mut(id.index())
            .ok_or(CostError::UnknownComputation(id.index()))
    }

    pub fn instruction(&self, id: InstrId) -> Result<&Instruction> {
        self.computation(id.computation)?
            .instruction(id.node)
            .ok_or_else(|| CostError::UnknownInstruction(id.to_string()))
    }

    pub fn instruction_mut(&mut self, id: InstrId) -> Result<&mut Instruction> {
        self.computation_mut(id.computation)?
            .instruction_mut(id.node)
            .ok_or_else(|| CostError::UnknownInstruction(id.to_string()))
    }

    pub fn operands(&self, id: InstrId) -> Result<Operands> {
        let computation = self.computation(id.computation)?;
        Ok(computation
            .operands(id.node)
            .into_iter()
            .map(|node| InstrId {
                computation: id.computation,
                node,
            })
            .collect())
    }

    pub fn operand(&self, id: InstrId, operand_num: usize) -> Result<&Instruction> {
        let operands = self.operands(id)?;
        match operands.get(operand_num) {
            Some(&operand) => self.instruction(operand),
            None => Err(CostError::malformed(
                self.instruction(id)?.name(),
                format!("missing operand #{}", operand_num),
            )),
        }
    }

    pub fn users(&self, id: InstrId) -> Result<Vec<(InstrId, usize)>> {
        let computation = self.computation(id.computation)?;
        Ok(computation
            .users(id.node)
            .map(|(node, operand_num)| {
                let user = InstrId {
                    computation: id.computation,
                    node,
                };
                (user, operand_num)
            })
            .collect())
    }

    pub fn root(&self, computation: ComputationId) -> Result<InstrId> {
        let comp = self.computation(computation)?;
        let node = comp
            .root()
            .ok_or_else(|| CostError::malformed(comp.name(), "computation has no root"))?;
        Ok(InstrId { computation, node })
    }

    /// Visits every instruction of `computation` in dependency order, then finishes at the root.
    pub fn accept<V>(&self, computation: ComputationId, visitor: &mut V) -> Result<(), V::Error>
    where
        V: InstructionVisitor,
        V::Error: From<CostError>,
    {
        let root = self.root(computation)?;
        for node in self.computation(computation)?.post_order()? {
            visitor.visit(self, InstrId { computation, node })?;
        }
        visitor.finish_visit(self, root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ElementType;

    fn f32s(dims: &[i64]) -> Shape {
        Shape::array(ElementType::F32, dims)
    }

    #[test]
    fn operands_keep_their_order() {
        let mut comp = Computation::new("entry");
        let a = comp.add_instruction(
            Instruction::new("a", Opcode::Parameter, f32s(&[2]))
                .with_attributes(Attributes::ParameterNumber(0)),
            &[],
        );
        let b = comp.add_instruction(
            Instruction::new("b", Opcode::Parameter, f32s(&[2]))
                .with_attributes(Attributes::ParameterNumber(1)),
            &[],
        );
        let sub = comp.add_instruction(
            Instruction::new("sub", Opcode::Subtract, f32s(&[2])),
            &[b, a],
        );
        assert_eq!(comp.operands(sub).as_slice(), &[b, a]);
        assert_eq!(comp.root(), Some(sub));
        assert_eq!(comp.parameter(1), Some(b));
        let users: Vec<_> = comp.users(a).collect();
        assert_eq!(users, [(sub, 1)]);
    }

    #[derive(Default)]
    struct Order(Vec<String>, Option<String>);

    impl InstructionVisitor for Order {
        type Error = CostError;

        fn visit(&mut self, module: &Module, id: InstrId) -> Result<()> {
            self.0.push(module.instruction(id)?.name().to_owned());
            Ok(())
        }

        fn finish_visit(&mut self, module: &Module, root: InstrId) -> Result<()> {
            self.1 = Some(module.instruction(root)?.name().to_owned());
            Ok(())
        }
    }

    #[test]
    fn accept_visits_operands_first() {
        let mut comp = Computation::new("entry");
        let c = comp.add_instruction(Instruction::new("c", Opcode::Constant, f32s(&[4])), &[]);
        let neg = comp.add_instruction(Instruction::new("neg", Opcode::Negate, f32s(&[4])), &[c]);
        let exp = comp.add_instruction(Instruction::new("exp", Opcode::Exp, f32s(&[4])), &[neg]);
        comp.add_instruction(Instruction::new("add", Opcode::Add, f32s(&[4])), &[exp, c]);

        let mut module = Module::new();
        let entry = module.add_entry_computation(comp);
        let mut order = Order::default();
        module.accept(entry, &mut order).unwrap();

        let pos = |name: &str| order.0.iter().position(|n| n == name).unwrap();
        assert!(pos("c") < pos("neg"));
        assert!(pos("neg") < pos("exp"));
        assert!(pos("exp") < pos("add"));
        assert_eq!(order.1.as_deref(), Some("add"));
    }

    #[test]
    fn missing_attributes_are_malformed() {
        let dot = Instruction::new("dot", Opcode::Dot, f32s(&[2, 2]));
        assert!(matches!(
            dot.dot_dimension_numbers(),
            Err(CostError::Malformed { .. })
        ));
        assert!(matches!(dot.called(0), Err(CostError::Malformed { .. })));
    }
}
