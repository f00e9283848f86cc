use opcost::ir::{
    Attributes, Computation, DotDimensionNumbers, InstrId, Instruction, Module, Opcode,
};
use opcost::shape::{byte_size_fn, ElementType, Shape, ShapeIndex};
use opcost::{CostAnalysis, CostError, Options};
use petgraph::stable_graph::NodeIndex;

fn f32s(dims: &[i64]) -> Shape {
    Shape::array(ElementType::F32, dims)
}

fn param(comp: &mut Computation, number: usize, shape: Shape) -> NodeIndex {
    comp.add_instruction(
        Instruction::new(&format!("p{}", number), Opcode::Parameter, shape)
            .with_attributes(Attributes::ParameterNumber(number)),
        &[],
    )
}

fn options() -> Options {
    Options::new(byte_size_fn(8))
}

fn analyze(module: &Module) -> CostAnalysis {
    let mut analysis = CostAnalysis::new(options());
    analysis.analyze_entry(module).unwrap();
    analysis
}

/// A module whose entry computation is `neg(constant)` over `elements` floats.
fn negate_constant(elements: i64) -> Module {
    let mut comp = Computation::new("entry");
    let c = comp.add_instruction(Instruction::new("c", Opcode::Constant, f32s(&[elements])), &[]);
    comp.add_instruction(Instruction::new("neg", Opcode::Negate, f32s(&[elements])), &[c]);
    let mut module = Module::new();
    module.add_entry_computation(comp);
    module
}

#[test]
fn constant_feeding_negate() {
    let analysis = analyze(&negate_constant(100));
    assert_eq!(analysis.flop_count(), 100.0);
    assert_eq!(analysis.transcendental_count(), 0.0);
    assert_eq!(analysis.bytes_accessed(), Ok(800.0));
}

#[test]
fn matmul() {
    let mut comp = Computation::new("entry");
    let a = param(&mut comp, 0, f32s(&[2, 3]));
    let b = param(&mut comp, 1, f32s(&[3, 4]));
    comp.add_instruction(
        Instruction::new("dot", Opcode::Dot, f32s(&[2, 4]))
            .with_attributes(Attributes::Dot(DotDimensionNumbers::matmul(2))),
        &[a, b],
    );
    let mut module = Module::new();
    module.add_entry_computation(comp);
    assert_eq!(analyze(&module).flop_count(), 48.0);
}

#[test]
fn fusion_matches_unfused_work() {
    let mut module = Module::new();
    let mut fused = Computation::new("fused");
    let p = param(&mut fused, 0, f32s(&[50]));
    let inner = fused.add_instruction(Instruction::new("neg", Opcode::Negate, f32s(&[50])), &[p]);
    let fused = module.add_computation(fused);

    let mut comp = Computation::new("entry");
    let x = param(&mut comp, 0, f32s(&[50]));
    let fusion = comp.add_instruction(
        Instruction::new("fusion", Opcode::Fusion, f32s(&[50])).with_called(&[fused]),
        &[x],
    );
    let entry = module.add_entry_computation(comp);

    let analysis = analyze(&module);
    let fusion = InstrId { computation: entry, node: fusion };
    assert_eq!(analysis.flop_count_of(fusion), 50.0);
    assert_eq!(analysis.flop_count(), 50.0);
    assert_eq!(analysis.bytes_accessed_of(fusion), Ok(400.0));
    assert_eq!(analysis.operand_bytes_accessed(fusion, 0, &ShapeIndex::default()), Ok(200.0));
    assert_eq!(analysis.operand_utilization(fusion, 0, &ShapeIndex::default()), 1.0);

    // The fused negate keeps its own record, but only the fusion counts towards the totals.
    let inner = InstrId { computation: fused, node: inner };
    assert_eq!(analysis.flop_count_of(inner), 50.0);
    assert_eq!(analysis.bytes_accessed_of(inner), Ok(400.0));
}

#[test]
fn fused_slice_reads_only_the_slice() {
    let mut module = Module::new();
    let mut fused = Computation::new("fused");
    let p = param(&mut fused, 0, f32s(&[100]));
    fused.add_instruction(Instruction::new("slice", Opcode::Slice, f32s(&[10])), &[p]);
    let fused = module.add_computation(fused);

    let mut comp = Computation::new("entry");
    let x = param(&mut comp, 0, f32s(&[100]));
    let fusion = comp.add_instruction(
        Instruction::new("fusion", Opcode::Fusion, f32s(&[10])).with_called(&[fused]),
        &[x],
    );
    let entry = module.add_entry_computation(comp);

    let analysis = analyze(&module);
    let fusion = InstrId { computation: entry, node: fusion };
    assert_eq!(analysis.operand_bytes_accessed(fusion, 0, &ShapeIndex::default()), Ok(40.0));
    assert_eq!(analysis.bytes_accessed_of(fusion), Ok(80.0));
}

#[test]
fn fused_in_place_update_writes_only_the_update() {
    let mut module = Module::new();
    let mut fused = Computation::new("fused");
    let buffer = param(&mut fused, 0, f32s(&[100]));
    let update = param(&mut fused, 1, f32s(&[10]));
    let index = param(&mut fused, 2, Shape::scalar(ElementType::S32));
    fused.add_instruction(
        Instruction::new("dus", Opcode::DynamicUpdateSlice, f32s(&[100])),
        &[buffer, update, index],
    );
    let fused = module.add_computation(fused);

    let mut comp = Computation::new("entry");
    let buffer = param(&mut comp, 0, f32s(&[100]));
    let update = param(&mut comp, 1, f32s(&[10]));
    let index = param(&mut comp, 2, Shape::scalar(ElementType::S32));
    let fusion = comp.add_instruction(
        Instruction::new("fusion", Opcode::Fusion, f32s(&[100])).with_called(&[fused]),
        &[buffer, update, index],
    );
    let entry = module.add_entry_computation(comp);

    let analysis = analyze(&module);
    let fusion = InstrId { computation: entry, node: fusion };
    let root = ShapeIndex::default();
    assert_eq!(analysis.output_bytes_accessed(fusion, &root), Ok(40.0));
    assert_eq!(analysis.operand_bytes_accessed(fusion, 0, &root), Ok(40.0));
    assert_eq!(analysis.operand_bytes_accessed(fusion, 1, &root), Ok(40.0));
    assert_eq!(analysis.operand_bytes_accessed(fusion, 2, &root), Ok(4.0));
    assert_eq!(analysis.bytes_accessed_of(fusion), Ok(124.0));
}

#[test]
fn fused_tuple_parameter_counts_extracted_elements() {
    let tuple = Shape::tuple([f32s(&[10]), f32s(&[20])]);
    let mut module = Module::new();
    let mut fused = Computation::new("fused");
    let p = param(&mut fused, 0, tuple.clone());
    let first = fused.add_instruction(
        Instruction::new("gte", Opcode::GetTupleElement, f32s(&[10]))
            .with_attributes(Attributes::TupleIndex(0)),
        &[p],
    );
    fused.add_instruction(Instruction::new("neg", Opcode::Negate, f32s(&[10])), &[first]);
    let fused = module.add_computation(fused);

    let mut comp = Computation::new("entry");
    let x = param(&mut comp, 0, tuple);
    let fusion = comp.add_instruction(
        Instruction::new("fusion", Opcode::Fusion, f32s(&[10])).with_called(&[fused]),
        &[x],
    );
    let entry = module.add_entry_computation(comp);

    let analysis = analyze(&module);
    let fusion = InstrId { computation: entry, node: fusion };
    assert_eq!(analysis.operand_bytes_accessed(fusion, 0, &ShapeIndex::new(&[0])), Ok(40.0));
    assert_eq!(analysis.operand_bytes_accessed(fusion, 0, &ShapeIndex::new(&[1])), Ok(0.0));
    assert_eq!(analysis.bytes_accessed_of(fusion), Ok(80.0));
    assert_eq!(analysis.flop_count(), 10.0);
}

#[test]
fn token_producer_is_free() {
    let mut comp = Computation::new("entry");
    let token = comp.add_instruction(
        Instruction::new("token", Opcode::AfterAll, Shape::Token),
        &[],
    );
    let mut module = Module::new();
    let entry = module.add_entry_computation(comp);
    let analysis = analyze(&module);
    let token = InstrId { computation: entry, node: token };
    assert_eq!(analysis.flop_count_of(token), 0.0);
    assert_eq!(analysis.transcendental_count_of(token), 0.0);
    assert_eq!(analysis.bytes_accessed_of(token), Ok(0.0));
}

#[test]
fn custom_call_without_computations_touches_its_buffers() {
    let mut comp = Computation::new("entry");
    let x = param(&mut comp, 0, f32s(&[8]));
    comp.add_instruction(
        Instruction::new("cc", Opcode::CustomCall, f32s(&[4]))
            .with_attributes(Attributes::CustomCallTarget("opaque".into())),
        &[x],
    );
    let mut module = Module::new();
    module.add_entry_computation(comp);
    let analysis = analyze(&module);
    assert_eq!(analysis.flop_count(), 0.0);
    assert_eq!(analysis.bytes_accessed(), Ok(48.0));
}

#[test]
fn byte_queries_need_a_shape_size_function() {
    let module = negate_constant(100);
    let mut analysis = CostAnalysis::new(Options::default());
    analysis.analyze_entry(&module).unwrap();
    assert_eq!(analysis.flop_count(), 100.0);
    assert_eq!(analysis.bytes_accessed(), Err(CostError::MissingShapeSize));
    let neg = module.root(module.entry().unwrap()).unwrap();
    assert_eq!(analysis.bytes_accessed_of(neg), Err(CostError::MissingShapeSize));
}

fn negate_unlaid_parameter() -> Module {
    let mut comp = Computation::new("entry");
    let p = param(&mut comp, 0, Shape::array_without_layout(ElementType::F32, &[50]));
    comp.add_instruction(Instruction::new("neg", Opcode::Negate, f32s(&[50])), &[p]);
    let mut module = Module::new();
    module.add_entry_computation(comp);
    module
}

#[test]
fn missing_layouts_are_counted_as_zero() {
    let module = negate_unlaid_parameter();
    let analysis = analyze(&module);
    assert_eq!(analysis.flop_count(), 50.0);
    // Only the negate's output has a known size.
    assert_eq!(analysis.bytes_accessed(), Ok(200.0));
    let neg = module.root(module.entry().unwrap()).unwrap();
    assert!(matches!(
        analysis.bytes_accessed_of(neg),
        Err(CostError::MissingLayout { .. })
    ));
}

#[test]
fn strict_layouts_fail_the_analysis() {
    let module = negate_unlaid_parameter();
    let mut analysis = CostAnalysis::new(options().with_strict_layouts(true));
    assert!(matches!(
        analysis.analyze_entry(&module),
        Err(CostError::MissingLayout { .. })
    ));
    assert!(analysis.properties().is_empty());
}

#[test]
fn optimal_seconds_is_the_bottleneck() {
    let module = negate_constant(100);
    let mut options = options();
    options.set_flops_per_second(10.0);
    options.set_bytes_per_second(400.0);
    let mut analysis = CostAnalysis::new(options);
    analysis.analyze_entry(&module).unwrap();
    // 100 flops take 10s, 800 bytes take 2s.
    assert_eq!(analysis.optimal_seconds(), 10.0);
    assert_eq!(analysis.per_second_rate("flops"), 10.0);

    let mut options = self::options();
    options.set_flops_per_second(100.0);
    options.set_bytes_per_second(100.0);
    let mut analysis = CostAnalysis::new(options);
    analysis.analyze_entry(&module).unwrap();
    assert_eq!(analysis.optimal_seconds(), 8.0);
}

#[test]
fn custom_rates_apply_to_backend_keys() {
    fn cycles(visit: &opcost::Visit<'_>, cx: &mut opcost::VisitContext) -> opcost::Result<()> {
        cx.properties
            .set("cycles", visit.instruction.shape().element_count() as f64 * 3.0);
        Ok(())
    }

    let module = negate_constant(100);
    let model = opcost::CostModel::default().with_handler(Opcode::Negate, cycles);
    let options = options().with_per_second_rate("cycles", 1.0);
    let mut analysis = CostAnalysis::with_model(options, model);
    analysis.analyze_entry(&module).unwrap();
    assert_eq!(analysis.property("cycles"), 300.0);
    assert_eq!(analysis.optimal_seconds(), 300.0);
}

#[test]
fn reads_and_writes_by_memory_space() {
    let mut comp = Computation::new("entry");
    let near = param(&mut comp, 0, f32s(&[10]).with_memory_space(1));
    let far = param(&mut comp, 1, f32s(&[10]));
    let sum = comp.add_instruction(Instruction::new("sum", Opcode::Add, f32s(&[10])), &[near, far]);
    let mut module = Module::new();
    let entry = module.add_entry_computation(comp);
    let analysis = analyze(&module);

    let sum = InstrId { computation: entry, node: sum };
    assert_eq!(analysis.bytes_read(&module, sum, None), Ok(80.0));
    assert_eq!(analysis.bytes_read(&module, sum, Some(1)), Ok(40.0));
    assert_eq!(analysis.bytes_read(&module, sum, Some(0)), Ok(40.0));
    assert_eq!(analysis.bytes_written(&module, sum, Some(0)), Ok(40.0));
    assert_eq!(analysis.bytes_written(&module, sum, Some(1)), Ok(0.0));
}
