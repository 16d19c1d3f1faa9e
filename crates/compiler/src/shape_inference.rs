//! Shape binding
//!
//! Propagates element types and shapes through the graph using each
//! operator's inference rule, with symbolic arithmetic for dimensions that
//! are not bound to integers.
//!
//! ## Algorithm
//!
//! 1. Substitute the caller's axis bindings (`batch`, `height`, `width`) into
//!    the graph input shapes; in static mode every input axis must be bound
//! 2. Visit nodes in order (the IR keeps them topologically sorted)
//! 3. Infer output types and shapes from input shapes and attributes;
//!    int64 tensors whose values are knowable at bind time (Shape outputs and
//!    slices, gathers and concats of them, small int64 initializers) carry
//!    their values along so that Reshape and ConstantOfShape resolve
//! 4. Canonicalize every shape through the symbol table
//!
//! In static mode an unresolvable dimension is a `ShapeResolution` error
//! naming the tensor. In dynamic mode it becomes an opaque symbol, and equal
//! computations over the same symbols intern to the same dimension so uses
//! stay consistent. Data-dependent counts (NonMaxSuppression) are symbolic in
//! both modes.

use crate::graph::{
    AttrValue, DataType, Dim, Graph, Node, OpKind, Shape, SymExpr, SymbolOrigin, SymbolTable, TensorData, TensorInfo,
};
use crate::runtime::{normalize_axis, slice_bounds, split_sizes, transpose_perm};
use crate::{ExportError, Result};
use ahash::AHashMap;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Slice ends at or beyond this value mean "to the end of the axis"
const OPEN_END: i64 = i64::MAX / 2;

/// Largest int64 initializer whose values are tracked
const MAX_TRACKED_VALUES: usize = 64;

/// Shape binding engine
#[derive(Debug, Clone, Default)]
pub struct ShapeBinder {
    dynamic: bool,
    bindings: BTreeMap<String, i64>,
}

impl ShapeBinder {
    pub fn new(dynamic: bool) -> Self {
        Self {
            dynamic,
            bindings: BTreeMap::new(),
        }
    }

    /// Bind a named input axis to a concrete size
    pub fn with_axis(mut self, name: &str, value: i64) -> Self {
        self.bindings.insert(name.to_string(), value);
        self
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Bind input axes and propagate shapes through the whole graph
    pub fn bind(&self, mut graph: Graph) -> Result<Graph> {
        for (axis, &value) in &self.bindings {
            if value <= 0 {
                return Err(ExportError::InvalidOptions(format!("axis '{}' must be positive, got {}", axis, value)));
            }
        }

        let inputs: Vec<String> = graph.inputs().to_vec();
        for input in &inputs {
            let info = graph
                .tensor(input)
                .cloned()
                .ok_or_else(|| ExportError::shape(input.as_str(), "graph input has no metadata"))?;
            let shape = info
                .shape
                .ok_or_else(|| ExportError::shape(input.as_str(), "graph input has no shape"))?;
            let mut bound = Vec::with_capacity(shape.len());
            for dim in shape {
                let dim = graph.symbols.resolve(dim);
                let axis = match dim {
                    Dim::Symbolic(id) => match graph.symbols.expr(id) {
                        SymExpr::Axis(name) => Some(name.clone()),
                        _ => None,
                    },
                    Dim::Fixed(_) => None,
                };
                bound.push(match axis {
                    Some(name) => match self.bindings.get(&name) {
                        Some(&value) => Dim::Fixed(value),
                        None if self.dynamic => dim,
                        None => {
                            return Err(ExportError::shape(
                                input.as_str(),
                                format!("axis '{}' must be bound for a static export", name),
                            ))
                        }
                    },
                    None => dim,
                });
            }
            debug!("Bound input {}: {}", input, graph.symbols.render_shape(&bound));
            graph.set_tensor_info(
                input,
                TensorInfo {
                    dtype: info.dtype,
                    shape: Some(bound),
                },
            );
        }

        self.propagate(&mut graph)?;
        Ok(graph)
    }

    /// Re-infer every node output from the current input shapes
    pub fn propagate(&self, graph: &mut Graph) -> Result<()> {
        let mut state = BindState {
            dynamic: self.dynamic,
            symbols: std::mem::take(&mut graph.symbols),
            values: AHashMap::new(),
        };
        let result = state.run(graph);
        graph.symbols = state.symbols;
        result?;
        self.canonicalize(graph);
        if !self.dynamic {
            self.check_static(graph)?;
        }
        Ok(())
    }

    fn canonicalize(&self, graph: &mut Graph) {
        let resolved: Vec<(String, TensorInfo)> = graph
            .tensors()
            .iter()
            .map(|(name, info)| {
                let shape = info.shape.as_ref().map(|s| graph.symbols.resolve_shape(s));
                (name.clone(), TensorInfo { dtype: info.dtype, shape })
            })
            .collect();
        for (name, info) in resolved {
            graph.set_tensor_info(&name, info);
        }
    }

    fn check_static(&self, graph: &Graph) -> Result<()> {
        let mut names: Vec<&String> = graph.tensors().keys().collect();
        names.sort();
        for name in names {
            let Some(shape) = graph.tensor_shape(name) else {
                continue;
            };
            for &dim in shape {
                if let Dim::Symbolic(id) = dim {
                    if graph.symbols.origin(id) != SymbolOrigin::DataDependent {
                        return Err(ExportError::shape(
                            name.as_str(),
                            format!("dimension '{}' is not static", graph.symbols.render(id)),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

struct BindState {
    dynamic: bool,
    symbols: SymbolTable,
    values: AHashMap<String, Vec<Dim>>,
}

fn first_output(node: &Node) -> &str {
    node.outputs.first().map(String::as_str).unwrap_or(&node.name)
}

fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1).div_euclid(b)
}

impl BindState {
    fn run(&mut self, graph: &mut Graph) -> Result<()> {
        let nodes = graph.nodes().to_vec();
        for node in &nodes {
            let infos = self.infer(graph, node)?;
            if infos.len() != node.outputs.len() {
                return Err(ExportError::shape(
                    first_output(node),
                    format!("{} produced {} shapes for {} outputs", node.op, infos.len(), node.outputs.len()),
                ));
            }
            for (name, info) in node.outputs.iter().zip(infos) {
                if let Some(shape) = &info.shape {
                    trace!("{} {} -> {}", node.op, name, self.symbols.render_shape(shape));
                }
                graph.set_tensor_info(name, info);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn unresolved(&mut self, tensor: &str, reason: impl Into<String>) -> Result<Dim> {
        if self.dynamic {
            Ok(self.symbols.opaque("unk"))
        } else {
            Err(ExportError::shape(tensor, reason))
        }
    }

    fn unify(&mut self, tensor: &str, a: Dim, b: Dim) -> Result<Dim> {
        self.symbols
            .unify(a, b)
            .map_err(|reason| ExportError::shape(tensor, format!("incompatible dimensions: {}", reason)))
    }

    fn input(&self, graph: &Graph, node: &Node, slot: usize) -> Result<(DataType, Shape)> {
        let name = node
            .input(slot)
            .ok_or_else(|| ExportError::shape(first_output(node), format!("{} is missing input {}", node.name, slot)))?;
        let info = graph
            .tensor(name)
            .ok_or_else(|| ExportError::shape(name, "tensor is not defined"))?;
        match (info.dtype, &info.shape) {
            (Some(dtype), Some(shape)) => Ok((dtype, self.symbols.resolve_shape(shape))),
            _ => Err(ExportError::shape(name, "shape is not known")),
        }
    }

    /// Bind-time values of an int64 input
    fn known_values(&self, graph: &Graph, node: &Node, slot: usize) -> Option<Vec<Dim>> {
        let name = node.input(slot)?;
        if let Some(values) = self.values.get(name) {
            return Some(values.iter().map(|&d| self.symbols.resolve(d)).collect());
        }
        let data = graph.initializer(name)?;
        if data.shape().len() > 1 || data.len() > MAX_TRACKED_VALUES {
            return None;
        }
        data.to_i64_vec().map(|v| v.into_iter().map(Dim::Fixed).collect())
    }

    fn fixed_values(&self, graph: &Graph, node: &Node, slot: usize) -> Option<Vec<i64>> {
        self.known_values(graph, node, slot)?.into_iter().map(Dim::fixed).collect()
    }

    fn axis(&self, node: &Node, axis: i64, rank: usize) -> Result<usize> {
        normalize_axis(axis, rank).ok_or_else(|| {
            ExportError::shape(first_output(node), format!("axis {} out of range for rank {}", axis, rank))
        })
    }

    fn broadcast(&mut self, tensor: &str, a: &[Dim], b: &[Dim]) -> Result<Shape> {
        let rank = a.len().max(b.len());
        let mut out = Vec::with_capacity(rank);
        for i in 0..rank {
            let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { Dim::Fixed(1) };
            let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { Dim::Fixed(1) };
            out.push(match (da, db) {
                (Dim::Fixed(1), d) | (d, Dim::Fixed(1)) => d,
                (x, y) => self.unify(tensor, x, y)?,
            });
        }
        Ok(out)
    }

    /// Output size of a convolution or pooling window along one axis
    fn window(&mut self, node: &Node, size: Dim, kernel: i64, index: usize, rank: usize) -> Result<Dim> {
        let attr = |name: &str, default: i64| {
            node.attr_ints(name)
                .and_then(|v| v.get(index).copied())
                .unwrap_or(default)
        };
        let stride = attr("strides", 1).max(1);
        let dilation = attr("dilations", 1).max(1);
        match node.attr_string("auto_pad").unwrap_or("NOTSET") {
            "SAME_UPPER" | "SAME_LOWER" => return Ok(self.symbols.affine(size, 1, stride - 1, stride)),
            "VALID" => return Ok(self.symbols.affine(size, 1, stride - dilation * (kernel - 1) - 1, stride)),
            _ => {}
        }
        let pads = node.attr_ints("pads").unwrap_or(&[]);
        let begin = pads.get(index).copied().unwrap_or(0);
        let end = pads.get(index + rank).copied().unwrap_or(0);
        let out = self
            .symbols
            .affine(size, 1, begin + end - dilation * (kernel - 1) - 1 + stride, stride);
        if let Dim::Fixed(v) = out {
            if v <= 0 {
                return Err(ExportError::shape(
                    first_output(node),
                    format!("window of {} leaves no output positions", node.name),
                ));
            }
        }
        Ok(out)
    }

    fn slice_dim(&mut self, tensor: &str, dim: Dim, start: i64, end: i64, step: i64) -> Result<Dim> {
        if let Dim::Fixed(n) = dim {
            let (s, e) = slice_bounds(start, end, n);
            return Ok(Dim::Fixed(ceil_div(e - s, step)));
        }
        let lower = self.symbols.lower_bound(dim);
        let upper = self.symbols.upper_bound(dim);
        if start >= 0 && end >= OPEN_END && lower >= start {
            return Ok(self.symbols.affine(dim, 1, step - 1 - start, step));
        }
        if start >= 0 && (0..OPEN_END).contains(&end) && lower >= end {
            return Ok(Dim::Fixed(ceil_div((end - start).max(0), step)));
        }
        if start < 0 && end >= OPEN_END && lower >= -start {
            return Ok(Dim::Fixed(ceil_div(-start, step)));
        }
        if start >= 0 && upper.is_some_and(|u| u <= start) {
            return Ok(Dim::Fixed(0));
        }
        if let Dim::Symbolic(id) = dim {
            if self.symbols.origin(id) == SymbolOrigin::DataDependent {
                let width = (start >= 0 && (0..OPEN_END).contains(&end)).then(|| (end - start).max(0));
                let bound = match (upper, width) {
                    (Some(u), Some(w)) => Some(u.min(w)),
                    (u, w) => u.or(w),
                };
                return Ok(self.symbols.data_dependent("slice", bound.map(|b| ceil_div(b, step))));
            }
        }
        self.unresolved(
            tensor,
            format!("slice [{}:{}:{}] of '{}'", start, end, step, self.symbols.render_dim(dim)),
        )
    }

    // ------------------------------------------------------------------
    // Per-operator rules
    // ------------------------------------------------------------------

    fn infer(&mut self, graph: &Graph, node: &Node) -> Result<Vec<TensorInfo>> {
        let out = first_output(node).to_string();
        let single = |dtype: DataType, shape: Shape| -> Result<Vec<TensorInfo>> { Ok(vec![TensorInfo::new(dtype, shape)]) };

        match node.op {
            OpKind::Conv => {
                let (dtype, x) = self.input(graph, node, 0)?;
                let (_, w) = self.input(graph, node, 1)?;
                if x.len() != 4 || w.len() != 4 {
                    return Err(ExportError::shape(out, "Conv expects rank-4 input and weight"));
                }
                let group = node.attr_int_or("group", 1).max(1);
                let weight_channels = self.symbols.mul(&[w[1], Dim::Fixed(group)]);
                self.unify(&out, x[1], weight_channels)?;
                let mut shape = vec![x[0], w[0]];
                for i in 0..2 {
                    let kernel = match w[2 + i] {
                        Dim::Fixed(k) => k,
                        Dim::Symbolic(_) => return Err(ExportError::shape(out, "kernel size must be static")),
                    };
                    shape.push(self.window(node, x[2 + i], kernel, i, 2)?);
                }
                single(dtype, shape)
            }
            OpKind::MaxPool => {
                let (dtype, x) = self.input(graph, node, 0)?;
                let kernel = node.attr_ints("kernel_shape").unwrap_or(&[]).to_vec();
                if x.len() != 4 || kernel.len() != 2 {
                    return Err(ExportError::shape(out, "MaxPool expects rank-4 input and a 2-D kernel"));
                }
                let mut shape = vec![x[0], x[1]];
                for (i, &k) in kernel.iter().enumerate() {
                    shape.push(self.window(node, x[2 + i], k, i, 2)?);
                }
                single(dtype, shape)
            }
            OpKind::BatchNormalization | OpKind::Sigmoid | OpKind::Softmax | OpKind::CumSum => {
                let (dtype, x) = self.input(graph, node, 0)?;
                single(dtype, x)
            }
            OpKind::Identity => {
                let (dtype, x) = self.input(graph, node, 0)?;
                if let Some(values) = self.known_values(graph, node, 0) {
                    self.values.insert(out.clone(), values);
                }
                single(dtype, x)
            }
            OpKind::Cast => {
                let (dtype, x) = self.input(graph, node, 0)?;
                let to = node
                    .attr_int("to")
                    .and_then(|code| DataType::from_onnx_code(code as i32))
                    .ok_or_else(|| ExportError::shape(out.as_str(), "Cast target type is not supported"))?;
                if dtype == DataType::Int64 && to == DataType::Int64 {
                    if let Some(values) = self.known_values(graph, node, 0) {
                        self.values.insert(out.clone(), values);
                    }
                }
                single(to, x)
            }
            OpKind::Resize => self.infer_resize(graph, node, &out),
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
                let (da, a) = self.input(graph, node, 0)?;
                let (db, b) = self.input(graph, node, 1)?;
                if da != db {
                    return Err(ExportError::shape(out, format!("{} mixes {} and {}", node.op, da, db)));
                }
                let shape = self.broadcast(&out, &a, &b)?;
                if da == DataType::Int64 && shape.len() <= 1 {
                    self.elementwise_values(graph, node, &out);
                }
                single(da, shape)
            }
            OpKind::Concat => {
                let (dtype, first) = self.input(graph, node, 0)?;
                let axis = self.axis(node, node.attr_int_or("axis", 0), first.len())?;
                let mut shape = first;
                let mut along = vec![shape[axis]];
                for slot in 1..node.inputs.len() {
                    let (_, other) = self.input(graph, node, slot)?;
                    if other.len() != shape.len() {
                        return Err(ExportError::shape(out, "Concat inputs differ in rank"));
                    }
                    for i in 0..shape.len() {
                        if i == axis {
                            along.push(other[i]);
                        } else {
                            shape[i] = self.unify(&out, shape[i], other[i])?;
                        }
                    }
                }
                shape[axis] = self.symbols.add(&along);
                if shape.len() == 1 {
                    let parts: Option<Vec<Vec<Dim>>> =
                        (0..node.inputs.len()).map(|slot| self.known_values(graph, node, slot)).collect();
                    if let Some(parts) = parts {
                        self.values.insert(out.clone(), parts.concat());
                    }
                }
                single(dtype, shape)
            }
            OpKind::Split => {
                let (dtype, x) = self.input(graph, node, 0)?;
                let axis = self.axis(node, node.attr_int_or("axis", 0), x.len())?;
                let explicit = self.fixed_values(graph, node, 1);
                let sizes: Vec<Dim> = match x[axis] {
                    Dim::Fixed(d) => split_sizes(node, explicit.as_deref(), d)
                        .ok_or_else(|| ExportError::shape(out.as_str(), format!("cannot split {} into {} parts", d, node.outputs.len())))?
                        .into_iter()
                        .map(Dim::Fixed)
                        .collect(),
                    dim => match explicit.or_else(|| node.attr_ints("split").map(<[i64]>::to_vec)) {
                        Some(sizes) => sizes.into_iter().map(Dim::Fixed).collect(),
                        None => {
                            let parts = node.outputs.len().max(1) as i64;
                            vec![self.symbols.affine(dim, 1, 0, parts); node.outputs.len()]
                        }
                    },
                };
                Ok(sizes
                    .into_iter()
                    .map(|size| {
                        let mut shape = x.clone();
                        shape[axis] = size;
                        TensorInfo::new(dtype, shape)
                    })
                    .collect())
            }
            OpKind::Reshape => self.infer_reshape(graph, node, &out),
            OpKind::Transpose => {
                let (dtype, x) = self.input(graph, node, 0)?;
                let perm = transpose_perm(node, x.len())
                    .ok_or_else(|| ExportError::shape(out.as_str(), "invalid Transpose permutation"))?;
                single(dtype, perm.iter().map(|&p| x[p]).collect())
            }
            OpKind::Slice => self.infer_slice(graph, node, &out),
            OpKind::Gather => {
                let (dtype, x) = self.input(graph, node, 0)?;
                let (_, indices) = self.input(graph, node, 1)?;
                let axis = self.axis(node, node.attr_int_or("axis", 0), x.len())?;
                let mut shape: Shape = x[..axis].to_vec();
                shape.extend_from_slice(&indices);
                shape.extend_from_slice(&x[axis + 1..]);
                if x.len() == 1 {
                    if let (Some(values), Some(idx)) =
                        (self.known_values(graph, node, 0), self.fixed_values(graph, node, 1))
                    {
                        let len = values.len() as i64;
                        let picked: Option<Vec<Dim>> = idx
                            .iter()
                            .map(|&i| values.get((if i < 0 { i + len } else { i }) as usize).copied())
                            .collect();
                        if let Some(picked) = picked {
                            self.values.insert(out.clone(), picked);
                        }
                    }
                }
                single(dtype, shape)
            }
            OpKind::Unsqueeze => {
                let (dtype, x) = self.input(graph, node, 0)?;
                let axes = match node.input(1) {
                    Some(_) => self
                        .fixed_values(graph, node, 1)
                        .ok_or_else(|| ExportError::shape(out.as_str(), "Unsqueeze axes must be constant"))?,
                    None => node.attr_ints("axes").unwrap_or(&[]).to_vec(),
                };
                let rank = x.len() + axes.len();
                let mut inserted = vec![false; rank];
                for &a in &axes {
                    inserted[self.axis(node, a, rank)?] = true;
                }
                let mut source = x.iter();
                let shape = inserted
                    .iter()
                    .map(|&ins| if ins { Dim::Fixed(1) } else { source.next().copied().unwrap_or(Dim::Fixed(1)) })
                    .collect();
                if x.len() <= 1 {
                    if let Some(values) = self.known_values(graph, node, 0) {
                        self.values.insert(out.clone(), values);
                    }
                }
                single(dtype, shape)
            }
            OpKind::Shape => {
                let (_, x) = self.input(graph, node, 0)?;
                let rank = x.len() as i64;
                let start = node.attr_int("start").unwrap_or(0);
                let end = node.attr_int("end").unwrap_or(rank);
                let (s, e) = slice_bounds(start, end, rank);
                let dims = x[s as usize..e as usize].to_vec();
                let len = dims.len() as i64;
                self.values.insert(out.clone(), dims);
                single(DataType::Int64, vec![Dim::Fixed(len)])
            }
            OpKind::ConstantOfShape => {
                let dtype = match node.attr("value") {
                    Some(AttrValue::Tensor(t)) => t.dtype(),
                    _ => DataType::Float,
                };
                let shape = match self.known_values(graph, node, 0) {
                    Some(values) => values,
                    None => {
                        let (_, s) = self.input(graph, node, 0)?;
                        let rank = s.first().and_then(|d| d.fixed()).unwrap_or(0);
                        let mut dims = Vec::new();
                        for _ in 0..rank {
                            dims.push(self.unresolved(&out, "ConstantOfShape shape is not known at bind time")?);
                        }
                        dims
                    }
                };
                single(dtype, shape)
            }
            OpKind::ReduceMax => {
                let (dtype, x) = self.input(graph, node, 0)?;
                let axes = match node.input(1) {
                    Some(_) => self
                        .fixed_values(graph, node, 1)
                        .ok_or_else(|| ExportError::shape(out.as_str(), "ReduceMax axes must be constant"))?,
                    None => node.attr_ints("axes").unwrap_or(&[]).to_vec(),
                };
                let reduced: Vec<usize> = if axes.is_empty() {
                    (0..x.len()).collect()
                } else {
                    axes.iter().map(|&a| self.axis(node, a, x.len())).collect::<Result<_>>()?
                };
                let keep = node.attr_int_or("keepdims", 1) != 0;
                let shape = x
                    .iter()
                    .enumerate()
                    .filter_map(|(i, &d)| match (reduced.contains(&i), keep) {
                        (false, _) => Some(d),
                        (true, true) => Some(Dim::Fixed(1)),
                        (true, false) => None,
                    })
                    .collect();
                single(dtype, shape)
            }
            OpKind::ArgMax => {
                let (_, x) = self.input(graph, node, 0)?;
                let axis = self.axis(node, node.attr_int_or("axis", 0), x.len())?;
                let mut shape = x;
                if node.attr_int_or("keepdims", 1) != 0 {
                    shape[axis] = Dim::Fixed(1);
                } else {
                    shape.remove(axis);
                }
                single(DataType::Int64, shape)
            }
            OpKind::NonMaxSuppression => {
                let (_, boxes) = self.input(graph, node, 0)?;
                let (_, scores) = self.input(graph, node, 1)?;
                if boxes.len() != 3 || scores.len() != 3 {
                    return Err(ExportError::shape(out, "NonMaxSuppression expects rank-3 boxes and scores"));
                }
                self.unify(&out, boxes[0], scores[0])?;
                self.unify(&out, boxes[1], scores[2])?;
                let per_class = self
                    .fixed_values(graph, node, 2)
                    .and_then(|v| v.first().copied())
                    .unwrap_or(0)
                    .max(0);
                let candidates = self.symbols.upper_bound(boxes[1]).map(|n| n.min(per_class));
                let bound = match (
                    self.symbols.upper_bound(boxes[0]),
                    self.symbols.upper_bound(scores[1]),
                    candidates,
                ) {
                    (Some(b), Some(c), Some(n)) => b.checked_mul(c).and_then(|bc| bc.checked_mul(n)),
                    _ => None,
                };
                let count = self.symbols.data_dependent("nms", bound);
                single(DataType::Int64, vec![count, Dim::Fixed(3)])
            }
        }
    }

    fn infer_resize(&mut self, graph: &Graph, node: &Node, out: &str) -> Result<Vec<TensorInfo>> {
        let (dtype, x) = self.input(graph, node, 0)?;
        let scales = node
            .input(2)
            .and_then(|name| graph.initializer(name))
            .and_then(TensorData::to_f32_vec)
            .filter(|s| !s.is_empty());
        let shape = match (scales, self.known_values(graph, node, 3)) {
            (Some(scales), _) if scales.len() == x.len() => {
                let mut shape = Vec::with_capacity(x.len());
                for (&d, &s) in x.iter().zip(&scales) {
                    shape.push(if s > 0.0 && s.fract() == 0.0 {
                        self.symbols.affine(d, s as i64, 0, 1)
                    } else if let Dim::Fixed(v) = d {
                        Dim::Fixed((v as f32 * s).floor() as i64)
                    } else if s > 0.0 && (1.0 / s).fract() == 0.0 {
                        self.symbols.affine(d, 1, 0, (1.0 / s) as i64)
                    } else {
                        self.unresolved(out, format!("resize by {} of a symbolic dimension", s))?
                    });
                }
                shape
            }
            (None, Some(sizes)) if sizes.len() == x.len() => sizes,
            _ => {
                let mut shape = Vec::with_capacity(x.len());
                for _ in 0..x.len() {
                    shape.push(self.unresolved(out, "Resize scales and sizes are not constant")?);
                }
                shape
            }
        };
        Ok(vec![TensorInfo::new(dtype, shape)])
    }

    fn infer_reshape(&mut self, graph: &Graph, node: &Node, out: &str) -> Result<Vec<TensorInfo>> {
        let (dtype, x) = self.input(graph, node, 0)?;
        let allow_zero = node.attr_int_or("allowzero", 0) != 0;
        let Some(target) = self.known_values(graph, node, 1) else {
            let (_, target_shape) = self.input(graph, node, 1)?;
            let rank = target_shape.first().and_then(|d| d.fixed()).unwrap_or(0);
            let mut shape = Vec::new();
            for _ in 0..rank {
                shape.push(self.unresolved(out, "Reshape target is not known at bind time")?);
            }
            return Ok(vec![TensorInfo::new(dtype, shape)]);
        };

        let mut shape = Vec::with_capacity(target.len());
        let mut infer_at = None;
        for (i, &t) in target.iter().enumerate() {
            match t {
                Dim::Fixed(-1) if infer_at.is_none() => {
                    infer_at = Some(i);
                    shape.push(Dim::Fixed(1));
                }
                Dim::Fixed(0) if !allow_zero => shape.push(
                    *x.get(i)
                        .ok_or_else(|| ExportError::shape(out, "Reshape 0 refers past the input rank"))?,
                ),
                Dim::Fixed(v) if v < 0 => {
                    return Err(ExportError::shape(out, format!("invalid Reshape target {}", v)));
                }
                dim => shape.push(dim),
            }
        }
        match infer_at {
            Some(i) => {
                let known: Vec<Dim> = shape
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != i)
                    .map(|(_, &d)| d)
                    .collect();
                shape[i] = match self.symbols.div_exact(&x, &known) {
                    Some(dim) => dim,
                    None => self.unresolved(
                        out,
                        format!(
                            "cannot infer -1 reshaping {} to {}",
                            self.symbols.render_shape(&x),
                            self.symbols.render_shape(&target)
                        ),
                    )?,
                };
            }
            None => {
                let total_in = self.symbols.mul(&x);
                let total_out = self.symbols.mul(&shape);
                self.unify(out, total_in, total_out)?;
            }
        }
        if shape.len() <= 1 && x.len() <= 1 {
            if let Some(values) = self.known_values(graph, node, 0) {
                self.values.insert(out.to_string(), values);
            }
        }
        Ok(vec![TensorInfo::new(dtype, shape)])
    }

    fn infer_slice(&mut self, graph: &Graph, node: &Node, out: &str) -> Result<Vec<TensorInfo>> {
        let (dtype, x) = self.input(graph, node, 0)?;
        let param = |state: &Self, slot: usize| -> Result<Option<Vec<i64>>> {
            match node.input(slot) {
                None => Ok(None),
                Some(name) => state
                    .fixed_values(graph, node, slot)
                    .map(Some)
                    .ok_or_else(|| ExportError::shape(out, format!("Slice parameter '{}' must be constant", name))),
            }
        };
        let (Some(starts), Some(ends)) = (param(self, 1)?, param(self, 2)?) else {
            return Err(ExportError::shape(out, "Slice needs starts and ends"));
        };
        let axes = param(self, 3)?;
        let steps = param(self, 4)?;
        let plan = crate::runtime::slice_plan(node, x.len(), &starts, &ends, axes.as_deref(), steps.as_deref())
            .map_err(|reason| ExportError::shape(out, reason))?;

        let mut shape = x.clone();
        for &(axis, start, end, step) in &plan {
            shape[axis] = self.slice_dim(out, shape[axis], start, end, step)?;
        }

        if x.len() == 1 {
            if let Some(values) = self.known_values(graph, node, 0) {
                let mut selected = values;
                for &(_, start, end, step) in &plan {
                    let (s, e) = slice_bounds(start, end, selected.len() as i64);
                    selected = selected[s as usize..e as usize].iter().step_by(step as usize).copied().collect();
                }
                self.values.insert(out.to_string(), selected);
            }
        }
        Ok(vec![TensorInfo::new(dtype, shape)])
    }

    /// Track values of small int64 arithmetic (shape computations)
    fn elementwise_values(&mut self, graph: &Graph, node: &Node, out: &str) {
        let (Some(a), Some(b)) = (self.known_values(graph, node, 0), self.known_values(graph, node, 1)) else {
            return;
        };
        let len = a.len().max(b.len());
        if (a.len() != len && a.len() != 1) || (b.len() != len && b.len() != 1) {
            return;
        }
        let mut values = Vec::with_capacity(len);
        for i in 0..len {
            let x = a[if a.len() == 1 { 0 } else { i }];
            let y = b[if b.len() == 1 { 0 } else { i }];
            let v = match (node.op, y) {
                (OpKind::Add, _) => self.symbols.add(&[x, y]),
                (OpKind::Mul, _) => self.symbols.mul(&[x, y]),
                (OpKind::Sub, Dim::Fixed(k)) => self.symbols.offset(x, -k),
                (OpKind::Div, Dim::Fixed(k)) if k > 0 => self.symbols.affine(x, 1, 0, k),
                _ => return,
            };
            values.push(v);
        }
        self.values.insert(out.to_string(), values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::fixed_shape;

    fn conv_graph(graph: &mut Graph) {
        let b = Dim::Symbolic(graph.symbols.axis("batch"));
        let h = Dim::Symbolic(graph.symbols.axis("height"));
        let w = Dim::Symbolic(graph.symbols.axis("width"));
        graph.add_input("images", DataType::Float, vec![b, Dim::Fixed(3), h, w]).unwrap();
        graph
            .add_initializer("w", TensorData::from_f32(&[8, 3, 3, 3], vec![0.0; 216]).unwrap())
            .unwrap();
        graph
            .add_node(
                Node::new("conv", OpKind::Conv)
                    .with_inputs(&["images", "w"])
                    .with_outputs(&["c"])
                    .with_attr("strides", AttrValue::Ints(vec![2, 2]))
                    .with_attr("pads", AttrValue::Ints(vec![1, 1, 1, 1])),
            )
            .unwrap();
        graph
            .add_node(Node::new("shape", OpKind::Shape).with_inputs(&["c"]).with_outputs(&["s"]))
            .unwrap();
        graph.add_initializer("target", TensorData::i64_vec(&[0, 8, -1])).unwrap();
        graph
            .add_node(Node::new("flat", OpKind::Reshape).with_inputs(&["c", "target"]).with_outputs(&["f"]))
            .unwrap();
        graph.add_output("f").unwrap();
    }

    #[test]
    fn test_static_binding() {
        let mut graph = Graph::new("t");
        conv_graph(&mut graph);
        let binder = ShapeBinder::new(false)
            .with_axis("batch", 1)
            .with_axis("height", 640)
            .with_axis("width", 480);
        let graph = binder.bind(graph).unwrap();
        assert_eq!(graph.concrete_shape("c"), Some(vec![1, 8, 320, 240]));
        assert_eq!(graph.concrete_shape("f"), Some(vec![1, 8, 76800]));
        assert_eq!(graph.concrete_shape("s"), Some(vec![4]));
    }

    #[test]
    fn test_static_requires_bound_axes() {
        let mut graph = Graph::new("t");
        conv_graph(&mut graph);
        let err = ShapeBinder::new(false).with_axis("batch", 1).bind(graph).unwrap_err();
        assert_eq!(err.kind(), "ShapeResolutionError");
        assert!(err.to_string().contains("images"));
    }

    #[test]
    fn test_dynamic_binding_keeps_symbols() {
        let mut graph = Graph::new("t");
        conv_graph(&mut graph);
        let graph = ShapeBinder::new(true).bind(graph).unwrap();
        let shape = graph.tensor_shape("f").unwrap();
        assert_eq!(shape[1], Dim::Fixed(8));
        assert_eq!(graph.symbols.render_dim(shape[0]), "batch");
        assert_eq!(
            graph.symbols.render_dim(shape[2]),
            "(floor((height + 1)/2))*(floor((width + 1)/2))"
        );
    }

    #[test]
    fn test_nms_count_is_data_dependent_and_slice_pins_it() {
        let mut graph = Graph::new("t");
        graph.add_input("boxes", DataType::Float, fixed_shape(&[1, 100, 4])).unwrap();
        graph.add_input("scores", DataType::Float, fixed_shape(&[1, 1, 100])).unwrap();
        graph.add_initializer("k", TensorData::i64_vec(&[10])).unwrap();
        graph
            .add_node(
                Node::new("nms", OpKind::NonMaxSuppression)
                    .with_inputs(&["boxes", "scores", "k"])
                    .with_outputs(&["sel"]),
            )
            .unwrap();
        graph
            .add_initializer("pad", TensorData::from_i64(&[10, 3], vec![0; 30]).unwrap())
            .unwrap();
        graph
            .add_node(Node::new("cat", OpKind::Concat).with_inputs(&["sel", "pad"]).with_outputs(&["padded"]))
            .unwrap();
        graph.add_initializer("zero", TensorData::i64_vec(&[0])).unwrap();
        graph
            .add_node(
                Node::new("top", OpKind::Slice)
                    .with_inputs(&["padded", "zero", "k"])
                    .with_outputs(&["out"]),
            )
            .unwrap();
        graph.add_output("out").unwrap();

        let graph = ShapeBinder::new(false).bind(graph).unwrap();
        let sel = graph.tensor_shape("sel").unwrap();
        let Dim::Symbolic(id) = sel[0] else {
            panic!("expected a data-dependent count");
        };
        assert_eq!(graph.symbols.origin(id), SymbolOrigin::DataDependent);
        assert_eq!(graph.symbols.upper_bound(sel[0]), Some(10));
        assert_eq!(graph.concrete_shape("out"), Some(vec![10, 3]));
    }

    #[test]
    fn test_broadcast_mismatch_is_reported() {
        let mut graph = Graph::new("t");
        graph.add_input("a", DataType::Float, fixed_shape(&[2, 3])).unwrap();
        graph.add_input("b", DataType::Float, fixed_shape(&[4, 3])).unwrap();
        graph
            .add_node(Node::new("add", OpKind::Add).with_inputs(&["a", "b"]).with_outputs(&["y"]))
            .unwrap();
        graph.add_output("y").unwrap();
        let err = ShapeBinder::new(false).bind(graph).unwrap_err();
        assert!(matches!(err, ExportError::ShapeResolution { ref tensor, .. } if tensor == "y"));
    }
}
