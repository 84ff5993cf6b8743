//! Model graph: logical layers, compilation to partitioned operators, and
//! the node cache used by graph search.
//!
//! # Building
//!
//! [`Model::binary`] (and `add`, `subtract`, `multiply`, `divide`) appends
//! one elementwise-binary layer. Operand dtypes are unified first by
//! [`plan_binary`], which returns the rewrite to apply: at most one cast
//! layer ahead of the lower-typed operand. The caller's in-place request is
//! stored on the layer as the integer property `inplace_a`.
//!
//! # Compiling
//!
//! [`Model::compile`] walks the layers in order and realizes every logical
//! tensor as a [`ParallelTensor`]:
//!
//! - a tensor's outermost dimension is split `data_parallelism_degree` ways
//!   when the degree divides it
//! - a cast shares its source's regions; kernels compute in f32 whatever the
//!   declared dtype, so a cast only retypes the view
//! - binary layers go through [`Model::create_operator_from_layer`], the
//!   aliasing policy, then [`ProposedBinary::finalize`]
//!
//! With `enable_inplace_optimizations`, an eligible operator aliases its
//! output onto operand-1 when operand-1 is an intermediate binary result
//! consumed by nothing else. In training mode this is limited to additions,
//! whose gradients never read the overwritten operand.
//!
//! # Example
//!
//! ```rust
//! use briny_dist::graph::Model;
//! use briny_dist::{config::Config, exec::Runtime, DataType};
//!
//! let mut model = Model::new(Config::default());
//! let x = model.create_input(&[4, 2], DataType::Float);
//! let y = model.create_input(&[4, 2], DataType::Float);
//! let z = model.add(&x, &y, false, Some("sum")).unwrap();
//! let compiled = model.compile().unwrap();
//!
//! let rt = Runtime::new(model.config()).unwrap();
//! compiled.init(&rt).unwrap();
//! compiled.write_input(&rt, &x, &[1.0; 8]).unwrap();
//! compiled.write_input(&rt, &y, &[2.0; 8]).unwrap();
//! compiled.forward(&rt).unwrap();
//! rt.wait_all().unwrap();
//! assert_eq!(compiled.read_output(&rt, &z).unwrap(), vec![3.0; 8]);
//! ```

use crate::cache::{next_node_guid, params_hash, Lookup, Node, NodeCache, NodeKey};
use crate::config::{ComputationMode, Config};
use crate::dtype::DataType;
use crate::error::{OpError, Result};
use crate::exec::{LaunchId, Runtime};
use crate::kind::BinaryKind;
use crate::operator::{ElementBinary, InplaceOutput, OpId, ProposedBinary};
use crate::tensors::{
    validate_partitioning, LayerId, LogicalTensor, MachineView, ParallelDim, ParallelTensor,
    ParallelTensorId, RegionId, TensorId,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Creates logical tensors and cast layers.
pub trait TensorBuilder {
    /// A graph input with the given extents (innermost first).
    fn create_logical_tensor(&mut self, dims: &[usize], dtype: DataType, create_grad: bool)
    -> Arc<LogicalTensor>;

    /// Appends a cast layer and returns its output.
    ///
    /// # Errors
    /// `UnknownLayer` if `tensor` does not belong to the builder.
    fn create_cast(
        &mut self,
        tensor: &Arc<LogicalTensor>,
        dtype: DataType,
        name: &str,
    ) -> Result<Arc<LogicalTensor>>;
}

/// Creates partitioned tensors with fresh regions.
pub trait ParallelTensorBuilder {
    fn create_parallel_tensor(
        &mut self,
        dims: &[ParallelDim],
        dtype: DataType,
        view: MachineView,
        create_grad: bool,
    ) -> Arc<ParallelTensor>;
}

/// What a layer computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerOp {
    Cast(DataType),
    Binary(BinaryKind),
}

/// A logical operator node.
#[derive(Debug, Clone)]
pub struct Layer {
    pub id: LayerId,
    pub op: LayerOp,
    pub name: Option<String>,
    pub inputs: Vec<Arc<LogicalTensor>>,
    pub outputs: Vec<Arc<LogicalTensor>>,
    properties: HashMap<String, i64>,
}

impl Layer {
    pub fn add_int_property(&mut self, key: &str, value: i64) {
        self.properties.insert(key.to_owned(), value);
    }

    pub fn get_int_property(&self, key: &str) -> Option<i64> {
        self.properties.get(key).copied()
    }
}

/// A cast to insert ahead of one operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastStep {
    /// 0 or 1.
    pub operand: usize,
    pub to: DataType,
    pub name: String,
}

/// How to build a binary layer from two operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRewrite {
    pub cast: Option<CastStep>,
    /// Output dtype.
    pub dtype: DataType,
}

/// Checks operand shapes and decides dtype unification.
///
/// The cast is named `<name>input1_pre_cast` or `<name>input2_pre_cast`,
/// where `<name>` is the layer name or, failing that, the kind.
///
/// # Errors
/// `ShapeMismatch` if ranks or extents differ.
pub fn plan_binary(
    kind: BinaryKind,
    in1: &LogicalTensor,
    in2: &LogicalTensor,
    name: Option<&str>,
) -> Result<BinaryRewrite> {
    if in1.dims != in2.dims {
        return Err(OpError::ShapeMismatch {
            context: "binary operands",
            lhs: in1.dims.clone(),
            rhs: in2.dims.clone(),
        });
    }
    let prefix = name.map_or_else(|| kind.to_string(), str::to_owned);
    let cast = match in1.dtype.cmp(&in2.dtype) {
        core::cmp::Ordering::Less => Some(CastStep {
            operand: 0,
            to: in2.dtype,
            name: format!("{prefix}input1_pre_cast"),
        }),
        core::cmp::Ordering::Greater => Some(CastStep {
            operand: 1,
            to: in1.dtype,
            name: format!("{prefix}input2_pre_cast"),
        }),
        core::cmp::Ordering::Equal => None,
    };
    Ok(BinaryRewrite {
        cast,
        dtype: in1.dtype.promote(in2.dtype),
    })
}

/// A graph under construction.
#[derive(Debug)]
pub struct Model {
    config: Config,
    layers: Vec<Layer>,
    tensors: HashMap<TensorId, Arc<LogicalTensor>>,
    next_tensor: u64,
    next_parallel_tensor: u64,
    next_region: u64,
    next_op: u64,
    node_cache: NodeCache,
}

impl Model {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            layers: Vec::new(),
            tensors: HashMap::new(),
            next_tensor: 0,
            next_parallel_tensor: 0,
            next_region: 0,
            next_op: 0,
            node_cache: NodeCache::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(id.0)
    }

    /// The layer that produced `tensor`, if any.
    pub fn producer(&self, tensor: &LogicalTensor) -> Option<&Layer> {
        tensor.owner.and_then(|(id, _)| self.layer(id))
    }

    /// A graph input that requires a gradient.
    pub fn create_input(&mut self, dims: &[usize], dtype: DataType) -> Arc<LogicalTensor> {
        self.create_logical_tensor(dims, dtype, true)
    }

    fn new_tensor(
        &mut self,
        dims: &[usize],
        dtype: DataType,
        owner: Option<(LayerId, usize)>,
        create_grad: bool,
    ) -> Arc<LogicalTensor> {
        let tensor = Arc::new(LogicalTensor {
            id: TensorId(self.next_tensor),
            dims: dims.to_vec(),
            dtype,
            owner,
            create_grad,
        });
        self.next_tensor += 1;
        self.tensors.insert(tensor.id, Arc::clone(&tensor));
        tensor
    }

    fn ensure_known(&self, tensor: &LogicalTensor) -> Result<()> {
        if self.tensors.contains_key(&tensor.id) {
            Ok(())
        } else {
            Err(OpError::UnknownLayer(format!("tensor {}", tensor.id.0)))
        }
    }

    fn push_layer(
        &mut self,
        op: LayerOp,
        name: Option<&str>,
        inputs: Vec<Arc<LogicalTensor>>,
        output_dims: &[usize],
        output_dtype: DataType,
    ) -> (LayerId, Arc<LogicalTensor>) {
        let id = LayerId(self.layers.len());
        let output = self.new_tensor(output_dims, output_dtype, Some((id, 0)), true);
        self.layers.push(Layer {
            id,
            op,
            name: name.map(str::to_owned),
            inputs,
            outputs: vec![Arc::clone(&output)],
            properties: HashMap::new(),
        });
        (id, output)
    }

    /// Appends an elementwise-binary layer, casting the lower-typed operand
    /// up when dtypes differ.
    ///
    /// # Errors
    /// `ShapeMismatch` for differently shaped operands, `UnknownLayer` for
    /// tensors from another model.
    pub fn binary(
        &mut self,
        kind: BinaryKind,
        in1: &Arc<LogicalTensor>,
        in2: &Arc<LogicalTensor>,
        inplace_a: bool,
        name: Option<&str>,
    ) -> Result<Arc<LogicalTensor>> {
        self.ensure_known(in1)?;
        self.ensure_known(in2)?;
        let rewrite = plan_binary(kind, in1, in2, name)?;
        let (mut a, mut b) = (Arc::clone(in1), Arc::clone(in2));
        if let Some(step) = &rewrite.cast {
            let source = if step.operand == 0 { &mut a } else { &mut b };
            *source = self.create_cast(source, step.to, &step.name)?;
        }
        let dims = a.dims.clone();
        let (id, output) = self.push_layer(LayerOp::Binary(kind), name, vec![a, b], &dims, rewrite.dtype);
        self.layers[id.0].add_int_property("inplace_a", i64::from(inplace_a));
        log::trace!("layer {:?}: {kind} -> tensor {:?} {:?}", id, output.id, output.dtype);
        Ok(output)
    }

    /// `in1 + in2`.
    ///
    /// # Errors
    /// See [`Model::binary`].
    pub fn add(
        &mut self,
        in1: &Arc<LogicalTensor>,
        in2: &Arc<LogicalTensor>,
        inplace_a: bool,
        name: Option<&str>,
    ) -> Result<Arc<LogicalTensor>> {
        self.binary(BinaryKind::Add, in1, in2, inplace_a, name)
    }

    /// `in1 - in2`.
    ///
    /// # Errors
    /// See [`Model::binary`].
    pub fn subtract(
        &mut self,
        in1: &Arc<LogicalTensor>,
        in2: &Arc<LogicalTensor>,
        inplace_a: bool,
        name: Option<&str>,
    ) -> Result<Arc<LogicalTensor>> {
        self.binary(BinaryKind::Subtract, in1, in2, inplace_a, name)
    }

    /// `in1 * in2`.
    ///
    /// # Errors
    /// See [`Model::binary`].
    pub fn multiply(
        &mut self,
        in1: &Arc<LogicalTensor>,
        in2: &Arc<LogicalTensor>,
        inplace_a: bool,
        name: Option<&str>,
    ) -> Result<Arc<LogicalTensor>> {
        self.binary(BinaryKind::Multiply, in1, in2, inplace_a, name)
    }

    /// `in1 / in2`.
    ///
    /// # Errors
    /// See [`Model::binary`].
    pub fn divide(
        &mut self,
        in1: &Arc<LogicalTensor>,
        in2: &Arc<LogicalTensor>,
        inplace_a: bool,
        name: Option<&str>,
    ) -> Result<Arc<LogicalTensor>> {
        self.binary(BinaryKind::Divide, in1, in2, inplace_a, name)
    }

    /// Appends an explicit cast layer.
    ///
    /// # Errors
    /// `UnknownLayer` for tensors from another model.
    pub fn cast(
        &mut self,
        tensor: &Arc<LogicalTensor>,
        dtype: DataType,
        name: Option<&str>,
    ) -> Result<Arc<LogicalTensor>> {
        self.create_cast(tensor, dtype, name.unwrap_or("cast"))
    }

    fn next_op_guid(&mut self) -> OpId {
        let id = OpId(self.next_op);
        self.next_op += 1;
        id
    }

    fn next_region(&mut self) -> RegionId {
        let id = RegionId(self.next_region);
        self.next_region += 1;
        id
    }

    /// An unpartitioned tensor outside any layer, with fresh regions.
    pub fn create_parallel_input(&mut self, dims: &[usize], dtype: DataType) -> Arc<ParallelTensor> {
        let dims: Vec<ParallelDim> = dims.iter().map(|&s| ParallelDim::new(s, 1)).collect();
        let view = MachineView::contiguous(0, &vec![1; dims.len()]);
        self.create_parallel_tensor(&dims, dtype, view, true)
    }

    /// A partitioned tensor with explicit per-dimension degrees.
    ///
    /// # Errors
    /// `InvalidPartition` if a degree is zero or does not divide its extent.
    pub fn create_partitioned_input(
        &mut self,
        dims: &[ParallelDim],
        dtype: DataType,
    ) -> Result<Arc<ParallelTensor>> {
        validate_partitioning(dims)?;
        let degrees: Vec<usize> = dims.iter().map(|d| d.degree).collect();
        let view = MachineView::contiguous(0, &degrees);
        Ok(self.create_parallel_tensor(dims, dtype, view, true))
    }

    /// Proposes an operator over partitioned operands with a fresh id.
    ///
    /// # Errors
    /// See [`ProposedBinary::new`].
    pub fn propose_binary(
        &mut self,
        kind: BinaryKind,
        in1: &Arc<ParallelTensor>,
        in2: &Arc<ParallelTensor>,
        inplace_a: bool,
        name: Option<&str>,
    ) -> Result<ProposedBinary> {
        let guid = self.next_op_guid();
        Ok(ProposedBinary::new(
            guid,
            kind,
            Arc::clone(in1),
            Arc::clone(in2),
            inplace_a,
            name.map(str::to_owned),
        )?
        .with_profiling(self.config.profiling))
    }

    /// Rebuilds the operator of a binary layer over partitioned operands,
    /// honouring the layer's stored `inplace_a` request.
    ///
    /// # Errors
    /// `UnknownLayer` if `layer` is missing or not binary; see also
    /// [`ProposedBinary::new`].
    pub fn create_operator_from_layer(
        &mut self,
        layer: LayerId,
        inputs: &[Arc<ParallelTensor>; 2],
    ) -> Result<ProposedBinary> {
        let l = self
            .layer(layer)
            .ok_or_else(|| OpError::UnknownLayer(format!("layer {}", layer.0)))?;
        let LayerOp::Binary(kind) = l.op else {
            return Err(OpError::UnknownLayer(format!("layer {} is not binary", layer.0)));
        };
        let inplace_a = l.get_int_property("inplace_a").unwrap_or(0) != 0;
        let name = l.name.clone();
        self.propose_binary(kind, &inputs[0], &inputs[1], inplace_a, name.as_deref())
    }

    /// A graph-search node for `kind` over the given operands.
    ///
    /// Structurally identical requests share one operator object; every call
    /// gets a fresh node id. Cached operators are never in-place.
    ///
    /// # Errors
    /// See [`ProposedBinary::new`].
    pub fn get_or_create_node(
        &mut self,
        in1: &Arc<ParallelTensor>,
        in2: &Arc<ParallelTensor>,
        kind: BinaryKind,
    ) -> Result<Node> {
        let hash = params_hash(in1, in2, kind);
        let key = NodeKey::new(in1, in2, kind);
        let op = match self.node_cache.lookup(hash, &key) {
            Lookup::Hit(op) => op,
            Lookup::Vacant => {
                let op = self.propose_binary(kind, in1, in2, false, None)?.finalize(self);
                self.node_cache.insert(hash, key, Arc::clone(&op));
                op
            }
            Lookup::Collision => {
                log::warn!("node cache: hash {hash:#x} collides with a different {kind} key, not caching");
                self.propose_binary(kind, in1, in2, false, None)?.finalize(self)
            }
        };
        Ok(Node {
            guid: next_node_guid(),
            op,
        })
    }

    /// Number of operators held by the node cache.
    pub fn cached_nodes(&self) -> usize {
        self.node_cache.len()
    }

    fn parallelize(&mut self, tensor: &LogicalTensor) -> Arc<ParallelTensor> {
        let degree = self.config.data_parallelism_degree;
        let outer = tensor.dims.len().saturating_sub(1);
        let dims: Vec<ParallelDim> = tensor
            .dims
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let split = i == outer && degree > 1 && size % degree == 0;
                ParallelDim::new(size, if split { degree } else { 1 })
            })
            .collect();
        let degrees: Vec<usize> = dims.iter().map(|d| d.degree).collect();
        self.create_parallel_tensor(
            &dims,
            tensor.dtype,
            MachineView::contiguous(0, &degrees),
            tensor.create_grad,
        )
    }

    fn auto_inplace(&self, kind: BinaryKind, in1: &LogicalTensor, consumers: &HashMap<TensorId, usize>) -> bool {
        if !self.config.enable_inplace_optimizations {
            return false;
        }
        if self.config.computation_mode == ComputationMode::Training && kind != BinaryKind::Add {
            return false;
        }
        let intermediate = matches!(
            self.producer(in1).map(|l| l.op),
            Some(LayerOp::Binary(_))
        );
        intermediate && consumers.get(&in1.id).copied() == Some(1)
    }

    /// Realizes every layer as partitioned tensors and operators.
    ///
    /// # Errors
    /// Any operator construction failure.
    pub fn compile(&mut self) -> Result<CompiledModel> {
        let mut consumers: HashMap<TensorId, usize> = HashMap::new();
        for layer in &self.layers {
            for input in &layer.inputs {
                *consumers.entry(input.id).or_default() += 1;
            }
        }

        let mut tensors: HashMap<TensorId, Arc<ParallelTensor>> = HashMap::new();
        let mut operators = Vec::new();
        let layers = self.layers.clone();
        for layer in &layers {
            let mut inputs = Vec::with_capacity(layer.inputs.len());
            for input in &layer.inputs {
                let p = match tensors.get(&input.id) {
                    Some(p) => Arc::clone(p),
                    None => {
                        let p = self.parallelize(input);
                        tensors.insert(input.id, Arc::clone(&p));
                        p
                    }
                };
                inputs.push(p);
            }
            let output = &layer.outputs[0];
            match layer.op {
                LayerOp::Cast(dtype) => {
                    let source = &inputs[0];
                    let view = Arc::new(ParallelTensor {
                        id: ParallelTensorId(self.next_parallel_tensor),
                        dims: source.dims.clone(),
                        dtype,
                        region: source.region,
                        region_grad: source.region_grad,
                        machine_view: source.machine_view.clone(),
                    });
                    self.next_parallel_tensor += 1;
                    tensors.insert(output.id, view);
                }
                LayerOp::Binary(kind) => {
                    let pair = [Arc::clone(&inputs[0]), Arc::clone(&inputs[1])];
                    let mut proposal = self.create_operator_from_layer(layer.id, &pair)?;
                    if !proposal.has_inplace_output()
                        && proposal.can_inplace_output()
                        && self.auto_inplace(kind, &layer.inputs[0], &consumers)
                    {
                        proposal.do_inplace_output();
                    }
                    let op = proposal.finalize(self);
                    tensors.insert(output.id, Arc::clone(op.output()));
                    operators.push(op);
                }
            }
        }
        log::debug!(
            "compiled {} layers into {} operators ({} in-place)",
            layers.len(),
            operators.len(),
            operators.iter().filter(|op| op.inplace_a()).count()
        );
        Ok(CompiledModel { operators, tensors })
    }
}

impl TensorBuilder for Model {
    fn create_logical_tensor(
        &mut self,
        dims: &[usize],
        dtype: DataType,
        create_grad: bool,
    ) -> Arc<LogicalTensor> {
        self.new_tensor(dims, dtype, None, create_grad)
    }

    fn create_cast(
        &mut self,
        tensor: &Arc<LogicalTensor>,
        dtype: DataType,
        name: &str,
    ) -> Result<Arc<LogicalTensor>> {
        self.ensure_known(tensor)?;
        let dims = tensor.dims.clone();
        let (_, output) = self.push_layer(
            LayerOp::Cast(dtype),
            Some(name),
            vec![Arc::clone(tensor)],
            &dims,
            dtype,
        );
        Ok(output)
    }
}

impl ParallelTensorBuilder for Model {
    fn create_parallel_tensor(
        &mut self,
        dims: &[ParallelDim],
        dtype: DataType,
        view: MachineView,
        create_grad: bool,
    ) -> Arc<ParallelTensor> {
        let id = ParallelTensorId(self.next_parallel_tensor);
        self.next_parallel_tensor += 1;
        let region = self.next_region();
        let region_grad = create_grad.then(|| self.next_region());
        Arc::new(ParallelTensor {
            id,
            dims: dims.to_vec(),
            dtype,
            region,
            region_grad,
            machine_view: view,
        })
    }
}

/// A compiled graph: operators in layer order and the partitioned tensor
/// behind every logical tensor.
#[derive(Debug)]
pub struct CompiledModel {
    operators: Vec<Arc<ElementBinary>>,
    tensors: HashMap<TensorId, Arc<ParallelTensor>>,
}

impl CompiledModel {
    pub fn operators(&self) -> &[Arc<ElementBinary>] {
        &self.operators
    }

    /// The partitioned tensor realizing `tensor`.
    pub fn parallel_tensor(&self, tensor: &LogicalTensor) -> Option<&Arc<ParallelTensor>> {
        self.tensors.get(&tensor.id)
    }

    fn resolve(&self, tensor: &LogicalTensor) -> Result<&Arc<ParallelTensor>> {
        self.parallel_tensor(tensor)
            .ok_or_else(|| OpError::UnknownLayer(format!("tensor {}", tensor.id.0)))
    }

    /// Initializes every operator, blocking until all shards are ready.
    ///
    /// # Errors
    /// The first init failure.
    pub fn init(&self, rt: &Runtime) -> Result<()> {
        for t in self.tensors.values() {
            rt.materialize(t)?;
        }
        self.operators.iter().try_for_each(|op| op.init(rt))
    }

    /// Enqueues forward of every operator in layer order.
    ///
    /// # Errors
    /// The first submission failure.
    pub fn forward(&self, rt: &Runtime) -> Result<Vec<LaunchId>> {
        self.operators.iter().map(|op| op.forward(rt)).collect()
    }

    /// Enqueues backward of every operator in reverse layer order.
    ///
    /// # Errors
    /// The first submission failure.
    pub fn backward(&self, rt: &Runtime) -> Result<Vec<LaunchId>> {
        self.operators.iter().rev().map(|op| op.backward(rt)).collect()
    }

    /// Fills the data region behind a logical tensor.
    ///
    /// # Errors
    /// `UnknownLayer`, `UnknownRegion` or `ShapeMismatch`.
    pub fn write_input(&self, rt: &Runtime, tensor: &LogicalTensor, data: &[f32]) -> Result<()> {
        rt.write_region(self.resolve(tensor)?, data)
    }

    /// Reads the data region behind a logical tensor.
    ///
    /// # Errors
    /// `UnknownLayer` or `UnknownRegion`.
    pub fn read_output(&self, rt: &Runtime, tensor: &LogicalTensor) -> Result<Vec<f32>> {
        rt.read_region(self.resolve(tensor)?)
    }

    /// Seeds the gradient region behind a logical tensor.
    ///
    /// # Errors
    /// `UnknownLayer`, `MissingGradient`, `UnknownRegion` or `ShapeMismatch`.
    pub fn write_grad(&self, rt: &Runtime, tensor: &LogicalTensor, data: &[f32]) -> Result<()> {
        rt.write_grad(self.resolve(tensor)?, data)
    }

    /// Reads the gradient region behind a logical tensor.
    ///
    /// # Errors
    /// `UnknownLayer`, `MissingGradient` or `UnknownRegion`.
    pub fn read_grad(&self, rt: &Runtime, tensor: &LogicalTensor) -> Result<Vec<f32>> {
        rt.read_grad(self.resolve(tensor)?)
    }
}
