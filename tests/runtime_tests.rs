use briny_dist::access::Phase;
use briny_dist::config::{ComputationMode, Config};
use briny_dist::exec::Runtime;
use briny_dist::graph::{Model, ParallelTensorBuilder};
use briny_dist::tensors::{MachineView, ParallelDim};
use briny_dist::{BinaryKind, DataType, OpError};

fn config() -> Config {
    Config::default()
        .with_computation_mode(ComputationMode::Training)
        .with_workers(2)
}

fn iota(n: usize, start: f32) -> Vec<f32> {
    (0..n).map(|i| start + i as f32).collect()
}

#[test]
fn test_add_forward_and_backward() {
    let mut model = Model::new(config());
    let x = model.create_input(&[4, 2], DataType::Float);
    let y = model.create_input(&[4, 2], DataType::Float);
    let z = model.add(&x, &y, false, None).unwrap();
    let compiled = model.compile().unwrap();
    let rt = Runtime::new(model.config()).unwrap();

    compiled.init(&rt).unwrap();
    compiled.write_input(&rt, &x, &iota(8, 0.0)).unwrap();
    compiled.write_input(&rt, &y, &iota(8, 10.0)).unwrap();
    compiled.forward(&rt).unwrap();
    rt.wait_all().unwrap();
    let expected: Vec<f32> = (0..8).map(|i| 10.0 + 2.0 * i as f32).collect();
    assert_eq!(compiled.read_output(&rt, &z).unwrap(), expected);

    compiled.write_grad(&rt, &z, &[1.0; 8]).unwrap();
    compiled.backward(&rt).unwrap();
    rt.wait_all().unwrap();
    assert_eq!(compiled.read_grad(&rt, &x).unwrap(), vec![1.0; 8]);
    assert_eq!(compiled.read_grad(&rt, &y).unwrap(), vec![1.0; 8]);

    rt.zero_gradients();
    assert_eq!(compiled.read_grad(&rt, &x).unwrap(), vec![0.0; 8]);
}

#[test]
fn test_multiply_gradients_swap_operands() {
    let mut model = Model::new(config());
    let x = model.create_input(&[4], DataType::Float);
    let y = model.create_input(&[4], DataType::Float);
    let z = model.multiply(&x, &y, false, None).unwrap();
    let compiled = model.compile().unwrap();
    let rt = Runtime::new(model.config()).unwrap();

    compiled.init(&rt).unwrap();
    compiled.write_input(&rt, &x, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    compiled.write_input(&rt, &y, &[5.0, 6.0, 7.0, 8.0]).unwrap();
    compiled.forward(&rt).unwrap();
    compiled.write_grad(&rt, &z, &[1.0; 4]).unwrap();
    compiled.backward(&rt).unwrap();
    rt.wait_all().unwrap();

    assert_eq!(compiled.read_output(&rt, &z).unwrap(), vec![5.0, 12.0, 21.0, 32.0]);
    assert_eq!(compiled.read_grad(&rt, &x).unwrap(), vec![5.0, 6.0, 7.0, 8.0]);
    assert_eq!(compiled.read_grad(&rt, &y).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_same_operand_gradient_gets_both_contributions() {
    let mut model = Model::new(config());
    let x = model.create_input(&[4], DataType::Float);
    let z = model.multiply(&x, &x, false, None).unwrap();
    let compiled = model.compile().unwrap();
    assert!(compiled.operators()[0].has_same_operands());

    let rt = Runtime::new(model.config()).unwrap();
    compiled.init(&rt).unwrap();
    compiled.write_input(&rt, &x, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    compiled.forward(&rt).unwrap();
    compiled.write_grad(&rt, &z, &[1.0; 4]).unwrap();
    compiled.backward(&rt).unwrap();
    rt.wait_all().unwrap();

    assert_eq!(compiled.read_output(&rt, &z).unwrap(), vec![1.0, 4.0, 9.0, 16.0]);
    assert_eq!(compiled.read_grad(&rt, &x).unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
}

#[test]
fn test_inplace_add_reuses_operand_region() {
    let mut model = Model::new(config());
    let x = model.create_input(&[4], DataType::Float);
    let y = model.create_input(&[4], DataType::Float);
    let w = model.create_input(&[4], DataType::Float);
    let t = model.multiply(&x, &y, false, None).unwrap();
    let u = model.add(&t, &w, true, None).unwrap();
    let compiled = model.compile().unwrap();

    let ops = compiled.operators();
    assert!(!ops[0].inplace_a());
    assert!(ops[1].inplace_a());
    assert_eq!(ops[1].output().region, ops[0].output().region);
    assert_eq!(
        compiled.parallel_tensor(&u).unwrap().region,
        compiled.parallel_tensor(&t).unwrap().region
    );

    let rt = Runtime::new(model.config()).unwrap();
    compiled.init(&rt).unwrap();
    compiled.write_input(&rt, &x, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    compiled.write_input(&rt, &y, &[2.0, 2.0, 2.0, 2.0]).unwrap();
    compiled.write_input(&rt, &w, &[0.5, 0.5, 0.5, 0.5]).unwrap();
    compiled.forward(&rt).unwrap();
    rt.wait_all().unwrap();
    assert_eq!(compiled.read_output(&rt, &u).unwrap(), vec![2.5, 4.5, 6.5, 8.5]);

    compiled.write_grad(&rt, &u, &[1.0; 4]).unwrap();
    compiled.backward(&rt).unwrap();
    rt.wait_all().unwrap();
    assert_eq!(compiled.read_grad(&rt, &w).unwrap(), vec![1.0; 4]);
    assert_eq!(compiled.read_grad(&rt, &x).unwrap(), vec![2.0; 4]);
    assert_eq!(compiled.read_grad(&rt, &y).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_inplace_same_operand_doubles() {
    let mut model = Model::new(config());
    let x = model.create_parallel_input(&[3], DataType::Float);
    let op = model
        .propose_binary(BinaryKind::Add, &x, &x, true, None)
        .unwrap()
        .finalize(&mut model);
    let rt = Runtime::new(model.config()).unwrap();
    op.init(&rt).unwrap();
    rt.write_region(&x, &[1.0, 2.0, 3.0]).unwrap();
    op.forward(&rt).unwrap();
    rt.wait_all().unwrap();
    assert_eq!(rt.read_region(&x).unwrap(), vec![2.0, 4.0, 6.0]);

    rt.write_grad(&x, &[1.0; 3]).unwrap();
    op.backward(&rt).unwrap();
    rt.wait_all().unwrap();
    assert_eq!(rt.read_grad(&x).unwrap(), vec![2.0; 3]);
}

#[test]
fn test_inplace_over_cast_views_of_one_region() {
    let mut model = Model::new(config());
    let a = model.create_input(&[4], DataType::Half);
    let b = model.cast(&a, DataType::Float, None).unwrap();
    // operand-1 becomes a second cast of `a`, so both operands view one region
    let z = model.add(&a, &b, true, None).unwrap();
    let compiled = model.compile().unwrap();

    let op = &compiled.operators()[0];
    assert!(op.inplace_a());
    assert!(!op.has_same_operands());
    assert!(op.same_operand_regions());
    assert_eq!(op.forward_plan().unwrap().len(), 1);
    assert_eq!(
        compiled.parallel_tensor(&z).unwrap().region,
        compiled.parallel_tensor(&a).unwrap().region
    );

    let rt = Runtime::new(model.config()).unwrap();
    compiled.init(&rt).unwrap();
    compiled.write_input(&rt, &a, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    compiled.forward(&rt).unwrap();
    rt.wait_all().unwrap();
    assert_eq!(compiled.read_output(&rt, &z).unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
    // the result lands in the source region
    assert_eq!(compiled.read_output(&rt, &a).unwrap(), vec![2.0, 4.0, 6.0, 8.0]);

    compiled.write_grad(&rt, &z, &[1.0; 4]).unwrap();
    compiled.backward(&rt).unwrap();
    rt.wait_all().unwrap();
    assert_eq!(compiled.read_grad(&rt, &a).unwrap(), vec![2.0; 4]);
}

#[test]
fn test_cast_view_operands_out_of_place() {
    let mut model = Model::new(config());
    let a = model.create_input(&[4], DataType::Half);
    let b = model.cast(&a, DataType::Float, None).unwrap();
    let z = model.multiply(&a, &b, false, None).unwrap();
    let compiled = model.compile().unwrap();
    assert_eq!(compiled.operators()[0].forward_plan().unwrap().len(), 2);

    let rt = Runtime::new(model.config()).unwrap();
    compiled.init(&rt).unwrap();
    compiled.write_input(&rt, &a, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    compiled.forward(&rt).unwrap();
    compiled.write_grad(&rt, &z, &[1.0; 4]).unwrap();
    compiled.backward(&rt).unwrap();
    rt.wait_all().unwrap();
    assert_eq!(compiled.read_output(&rt, &z).unwrap(), vec![1.0, 4.0, 9.0, 16.0]);
    assert_eq!(compiled.read_grad(&rt, &a).unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
}

#[test]
fn test_broadcast_subtract_reduces_gradient() {
    let mut model = Model::new(config());
    let a = model.create_parallel_input(&[3, 2], DataType::Float);
    let b = model.create_parallel_input(&[3, 1], DataType::Float);
    let op = model
        .propose_binary(BinaryKind::Subtract, &a, &b, false, None)
        .unwrap()
        .finalize(&mut model);
    assert_eq!(op.output().shape(), vec![3, 2]);

    let rt = Runtime::new(model.config()).unwrap();
    op.init(&rt).unwrap();
    rt.write_region(&a, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    rt.write_region(&b, &[10.0, 20.0, 30.0]).unwrap();
    op.forward(&rt).unwrap();
    rt.wait_all().unwrap();
    assert_eq!(
        rt.read_region(op.output()).unwrap(),
        vec![-9.0, -18.0, -27.0, -6.0, -15.0, -24.0]
    );

    rt.write_grad(op.output(), &[1.0; 6]).unwrap();
    op.backward(&rt).unwrap();
    rt.wait_all().unwrap();
    assert_eq!(rt.read_grad(&a).unwrap(), vec![1.0; 6]);
    assert_eq!(rt.read_grad(&b).unwrap(), vec![-2.0, -2.0, -2.0]);
}

#[test]
fn test_data_parallel_shards() {
    let mut model = Model::new(config().with_data_parallelism(2));
    let x = model.create_input(&[3, 4], DataType::Float);
    let y = model.create_input(&[3, 4], DataType::Float);
    let z = model.divide(&x, &y, false, None).unwrap();
    let compiled = model.compile().unwrap();

    let pz = compiled.parallel_tensor(&z).unwrap();
    assert_eq!(pz.degrees(), vec![1, 2]);
    assert_eq!(pz.num_shards(), 2);

    let rt = Runtime::new(model.config()).unwrap();
    compiled.init(&rt).unwrap();
    let op = &compiled.operators()[0];
    let state = rt.runtime_state(op.guid()).unwrap();
    assert_eq!(state.len(), 2);
    assert_eq!(state[1].output_domain.lo, vec![0, 2]);
    assert_eq!(state[1].output_domain.extents, vec![3, 2]);

    let xs = iota(12, 1.0);
    compiled.write_input(&rt, &x, &xs).unwrap();
    compiled.write_input(&rt, &y, &[2.0; 12]).unwrap();
    compiled.forward(&rt).unwrap();
    compiled.write_grad(&rt, &z, &[1.0; 12]).unwrap();
    compiled.backward(&rt).unwrap();
    rt.wait_all().unwrap();

    let halves: Vec<f32> = xs.iter().map(|v| v / 2.0).collect();
    assert_eq!(compiled.read_output(&rt, &z).unwrap(), halves);
    assert_eq!(compiled.read_grad(&rt, &x).unwrap(), vec![0.5; 12]);
    let dy: Vec<f32> = xs.iter().map(|v| -v / 4.0).collect();
    assert_eq!(compiled.read_grad(&rt, &y).unwrap(), dy);
}

#[test]
fn test_shared_broadcast_gradient_accumulates_across_shards() {
    let mut model = Model::new(config().with_workers(4));
    let a = model.create_partitioned_input(&[ParallelDim::new(4, 1), ParallelDim::new(4, 4)], DataType::Float)
        .unwrap();
    let b = model.create_parallel_input(&[4, 1], DataType::Float);
    let op = model
        .propose_binary(BinaryKind::Add, &a, &b, false, None)
        .unwrap()
        .finalize(&mut model);
    assert_eq!(op.output().degrees(), vec![1, 4]);

    let rt = Runtime::new(model.config()).unwrap();
    op.init(&rt).unwrap();
    rt.write_region(&a, &iota(16, 0.0)).unwrap();
    rt.write_region(&b, &[100.0, 200.0, 300.0, 400.0]).unwrap();
    op.forward(&rt).unwrap();
    rt.write_grad(op.output(), &[1.0; 16]).unwrap();
    op.backward(&rt).unwrap();
    rt.wait_all().unwrap();

    let expected: Vec<f32> = (0..16).map(|k| k as f32 + 100.0 * (k % 4 + 1) as f32).collect();
    assert_eq!(rt.read_region(op.output()).unwrap(), expected);
    assert_eq!(rt.read_grad(&b).unwrap(), vec![4.0; 4]);
    assert_eq!(rt.read_grad(&a).unwrap(), vec![1.0; 16]);
}

#[test]
fn test_init_rejects_incompatible_partitions() {
    let mut model = Model::new(config());
    let a = model.create_partitioned_input(&[ParallelDim::new(4, 1), ParallelDim::new(4, 2)], DataType::Float)
        .unwrap();
    let b = model.create_parallel_input(&[4, 4], DataType::Float);
    let op = model
        .propose_binary(BinaryKind::Add, &a, &b, false, None)
        .unwrap()
        .finalize(&mut model);
    let rt = Runtime::new(model.config()).unwrap();
    assert!(matches!(op.init(&rt), Err(OpError::PartitionMismatch { .. })));
    assert!(!rt.is_initialized(op.guid()));
}

#[test]
fn test_partitions_must_split_evenly() {
    let mut model = Model::new(config());
    assert_eq!(
        model
            .create_partitioned_input(&[ParallelDim::new(5, 2)], DataType::Float)
            .unwrap_err(),
        OpError::InvalidPartition { size: 5, degree: 2 }
    );
    assert!(matches!(
        model.create_partitioned_input(&[ParallelDim::new(4, 0)], DataType::Float),
        Err(OpError::InvalidPartition { size: 4, degree: 0 })
    ));

    let bad = model.create_parallel_tensor(
        &[ParallelDim::new(4, 0)],
        DataType::Float,
        MachineView::default(),
        true,
    );
    let good = model.create_parallel_input(&[4], DataType::Float);
    let rt = Runtime::new(model.config()).unwrap();
    assert!(matches!(rt.materialize(&bad), Err(OpError::InvalidPartition { .. })));
    assert!(!rt.is_materialized(bad.region));
    assert!(matches!(
        model.propose_binary(BinaryKind::Add, &good, &bad, false, None),
        Err(OpError::InvalidPartition { .. })
    ));

    let even = model
        .create_partitioned_input(&[ParallelDim::new(6, 3)], DataType::Float)
        .unwrap();
    rt.materialize(&even).unwrap();
    rt.write_region(&even, &iota(6, 1.0)).unwrap();
    assert_eq!(rt.read_region(&even).unwrap(), iota(6, 1.0));
}

#[test]
fn test_forward_requires_init() {
    let mut model = Model::new(config());
    let a = model.create_parallel_input(&[2], DataType::Float);
    let op = model
        .propose_binary(BinaryKind::Add, &a, &a, false, None)
        .unwrap()
        .finalize(&mut model);
    let rt = Runtime::new(model.config()).unwrap();
    assert_eq!(op.forward(&rt), Err(OpError::NotInitialized(op.guid().0)));
    assert_eq!(op.backward(&rt), Err(OpError::NotInitialized(op.guid().0)));
    assert!(rt.history().is_empty());
}

#[test]
fn test_scheduler_orders_by_declared_access() {
    let mut model = Model::new(config());
    let x = model.create_input(&[4], DataType::Float);
    let y = model.create_input(&[4], DataType::Float);
    let w = model.create_input(&[4], DataType::Float);
    let t = model.multiply(&x, &y, false, None).unwrap();
    let u = model.add(&t, &w, false, None).unwrap();
    let compiled = model.compile().unwrap();
    let rt = Runtime::new(model.config()).unwrap();
    compiled.init(&rt).unwrap();

    let fwd = compiled.forward(&rt).unwrap();
    // read after write of t
    assert_eq!(rt.dependencies(fwd[1]).unwrap(), vec![fwd[0]]);

    compiled.write_grad(&rt, &u, &[1.0; 4]).unwrap();
    let bwd = compiled.backward(&rt).unwrap();
    // backward of the add runs first and writes t's gradient
    assert!(rt.dependencies(bwd[1]).unwrap().contains(&bwd[0]));

    let again = compiled.forward(&rt).unwrap();
    let deps = rt.dependencies(again[0]).unwrap();
    assert!(deps.contains(&fwd[0]));
    assert!(deps.contains(&bwd[0]));

    let history = rt.history();
    assert_eq!(history.len(), 6);
    assert_eq!(history[0].phase, Phase::Forward);
    assert_eq!(history[2].phase, Phase::Backward);
    assert_eq!(history[2].op, compiled.operators()[1].guid());

    rt.wait_all().unwrap();
}

#[test]
fn test_launch_history_is_bounded_across_steps() {
    let mut model = Model::new(config());
    let x = model.create_input(&[4], DataType::Float);
    let y = model.create_input(&[4], DataType::Float);
    let t = model.multiply(&x, &y, false, None).unwrap();
    let u = model.add(&t, &y, false, None).unwrap();
    let compiled = model.compile().unwrap();
    let rt = Runtime::new(model.config()).unwrap();
    compiled.init(&rt).unwrap();

    for _ in 0..8 {
        rt.zero_gradients();
        let fwd = compiled.forward(&rt).unwrap();
        compiled.write_grad(&rt, &u, &[1.0; 4]).unwrap();
        compiled.backward(&rt).unwrap();
        assert_eq!(rt.history().len(), 4);
        assert_eq!(rt.dependencies(fwd[1]).unwrap(), vec![fwd[0]]);
        rt.wait_all().unwrap();
        assert!(rt.history().is_empty());
        assert_eq!(rt.dependencies(fwd[0]), None);
    }
}

#[test]
fn test_auto_inplace_follows_mode_and_consumers() {
    let build = |mode: ComputationMode, kind: BinaryKind| {
        let mut model = Model::new(
            config()
                .with_computation_mode(mode)
                .with_inplace_optimizations(true),
        );
        let x = model.create_input(&[4], DataType::Float);
        let y = model.create_input(&[4], DataType::Float);
        let t = model.multiply(&x, &y, false, None).unwrap();
        model.binary(kind, &t, &y, false, None).unwrap();
        let compiled = model.compile().unwrap();
        compiled
            .operators()
            .iter()
            .map(|op| op.inplace_a())
            .collect::<Vec<_>>()
    };
    assert_eq!(build(ComputationMode::Training, BinaryKind::Add), vec![false, true]);
    assert_eq!(build(ComputationMode::Training, BinaryKind::Multiply), vec![false, false]);
    assert_eq!(build(ComputationMode::Inference, BinaryKind::Multiply), vec![false, true]);
    assert_eq!(build(ComputationMode::Inference, BinaryKind::Subtract), vec![false, false]);

    // operand-1 consumed twice stays out of place
    let mut model = Model::new(config().with_inplace_optimizations(true));
    let x = model.create_input(&[4], DataType::Float);
    let t = model.multiply(&x, &x, false, None).unwrap();
    model.add(&t, &x, false, None).unwrap();
    model.add(&t, &x, false, None).unwrap();
    let compiled = model.compile().unwrap();
    assert!(compiled.operators().iter().all(|op| !op.inplace_a()));
}

#[test]
fn test_region_writes_check_length() {
    let mut model = Model::new(config());
    let a = model.create_parallel_input(&[4], DataType::Float);
    let rt = Runtime::new(model.config()).unwrap();
    assert_eq!(
        rt.write_region(&a, &[1.0; 4]),
        Err(OpError::UnknownRegion(a.region))
    );
    rt.materialize(&a).unwrap();
    assert!(matches!(
        rt.write_region(&a, &[1.0; 3]),
        Err(OpError::ShapeMismatch { .. })
    ));
}
