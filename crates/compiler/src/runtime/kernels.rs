// CPU kernels for every operator kind
//
// Kernels favour obvious correctness over speed: the runtime only executes
// constant subgraphs, fusion probes and equivalence checks.

use crate::graph::{Node, TensorData};
use crate::{ExportError, Result};
use ndarray::{concatenate, ArrayD, ArrayViewD, Axis, IxDyn, Slice, Zip};
use std::cmp::Ordering;

/// Apply `$body` to the array inside a `TensorData`, keeping its dtype
macro_rules! map_tensor {
    ($data:expr, |$a:ident| $body:expr) => {
        match $data {
            TensorData::Float($a) => TensorData::Float($body),
            TensorData::Int64($a) => TensorData::Int64($body),
        }
    };
}

fn err(node: &Node, reason: impl Into<String>) -> ExportError {
    ExportError::eval(node.name.clone(), reason)
}

pub(super) fn float<'a>(node: &Node, data: &'a TensorData) -> Result<&'a ArrayD<f32>> {
    data.as_f32()
        .ok_or_else(|| err(node, format!("{} expects float32 input", node.op)))
}

pub(super) fn int64<'a>(node: &Node, data: &'a TensorData) -> Result<&'a ArrayD<i64>> {
    data.as_i64()
        .ok_or_else(|| err(node, format!("{} expects int64 input", node.op)))
}

/// Normalize a possibly negative axis against `rank`
pub(crate) fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank = rank as i64;
    let axis = if axis < 0 { axis + rank } else { axis };
    (0..rank).contains(&axis).then_some(axis as usize)
}

fn axis_of(node: &Node, axis: i64, rank: usize) -> Result<usize> {
    normalize_axis(axis, rank).ok_or_else(|| err(node, format!("axis {} out of range for rank {}", axis, rank)))
}

/// Numpy-style broadcast of two shapes
pub(crate) fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

fn reshape_array<T: Clone>(node: &Node, a: &ArrayD<T>, dims: &[usize]) -> Result<ArrayD<T>> {
    ArrayD::from_shape_vec(IxDyn(dims), a.iter().cloned().collect())
        .map_err(|e| err(node, format!("cannot reshape {:?} to {:?}: {}", a.shape(), dims, e)))
}

fn attr_pair(node: &Node, name: &str, default: usize) -> Result<[usize; 2]> {
    match node.attr_ints(name) {
        None => Ok([default, default]),
        Some([a, b]) if *a > 0 && *b > 0 => Ok([*a as usize, *b as usize]),
        Some(other) => Err(err(node, format!("unsupported {} {:?}", name, other))),
    }
}

/// `pads` as `[top, left, bottom, right]`
fn attr_pads(node: &Node) -> Result<[usize; 4]> {
    if let Some(auto_pad) = node.attr_string("auto_pad") {
        if auto_pad != "NOTSET" && auto_pad != "VALID" {
            return Err(err(node, format!("unsupported auto_pad {}", auto_pad)));
        }
    }
    match node.attr_ints("pads") {
        None => Ok([0; 4]),
        Some([t, l, b, r]) if [*t, *l, *b, *r].iter().all(|&p| p >= 0) => {
            Ok([*t as usize, *l as usize, *b as usize, *r as usize])
        }
        Some(other) => Err(err(node, format!("unsupported pads {:?}", other))),
    }
}

fn window_out(node: &Node, size: usize, kernel: usize, stride: usize, dilation: usize, pads: (usize, usize)) -> Result<usize> {
    let span = dilation * (kernel.max(1) - 1) + 1;
    let padded = size + pads.0 + pads.1;
    if padded < span {
        return Err(err(node, format!("window {} larger than padded input {}", span, padded)));
    }
    Ok((padded - span) / stride + 1)
}

// ----------------------------------------------------------------------
// Convolution and pooling
// ----------------------------------------------------------------------

pub(super) fn conv(node: &Node, x: &ArrayD<f32>, w: &ArrayD<f32>, bias: Option<&ArrayD<f32>>) -> Result<ArrayD<f32>> {
    if x.ndim() != 4 || w.ndim() != 4 {
        return Err(err(node, "only 2-D convolution is supported"));
    }
    let (n, c, h, wd) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
    let (m, cg, kh, kw) = (w.shape()[0], w.shape()[1], w.shape()[2], w.shape()[3]);
    let group = node.attr_int_or("group", 1).max(1) as usize;
    if c != cg * group || m % group != 0 {
        return Err(err(
            node,
            format!("weight {:?} does not match input {:?} with group {}", w.shape(), x.shape(), group),
        ));
    }
    let [sh, sw] = attr_pair(node, "strides", 1)?;
    let [dh, dw] = attr_pair(node, "dilations", 1)?;
    let [pt, pl, pb, pr] = attr_pads(node)?;
    let oh = window_out(node, h, kh, sh, dh, (pt, pb))?;
    let ow = window_out(node, wd, kw, sw, dw, (pl, pr))?;

    let bias: Vec<f32> = match bias {
        Some(b) if b.len() == m => b.iter().copied().collect(),
        Some(b) => return Err(err(node, format!("bias has {} elements, expected {}", b.len(), m))),
        None => vec![0.0; m],
    };
    let x = x.as_standard_layout();
    let w = w.as_standard_layout();
    let xs = x.as_slice().ok_or_else(|| err(node, "input is not contiguous"))?;
    let ws = w.as_slice().ok_or_else(|| err(node, "weight is not contiguous"))?;

    let m_per_group = m / group;
    let mut out = vec![0f32; n * m * oh * ow];
    for b in 0..n {
        for oc in 0..m {
            let g = oc / m_per_group;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = bias[oc];
                    for ci in 0..cg {
                        let x_base = (b * c + g * cg + ci) * h * wd;
                        let w_base = (oc * cg + ci) * kh * kw;
                        for ky in 0..kh {
                            let iy = (oy * sh + ky * dh) as isize - pt as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (ox * sw + kx * dw) as isize - pl as isize;
                                if ix < 0 || ix >= wd as isize {
                                    continue;
                                }
                                acc += xs[x_base + iy as usize * wd + ix as usize] * ws[w_base + ky * kw + kx];
                            }
                        }
                    }
                    out[((b * m + oc) * oh + oy) * ow + ox] = acc;
                }
            }
        }
    }
    ArrayD::from_shape_vec(IxDyn(&[n, m, oh, ow]), out).map_err(|e| err(node, e.to_string()))
}

pub(super) fn max_pool(node: &Node, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if x.ndim() != 4 {
        return Err(err(node, "only 2-D pooling is supported"));
    }
    if node.attr_int_or("ceil_mode", 0) != 0 {
        return Err(err(node, "ceil_mode is not supported"));
    }
    let [kh, kw] = match node.attr_ints("kernel_shape") {
        Some([a, b]) if *a > 0 && *b > 0 => [*a as usize, *b as usize],
        _ => return Err(err(node, "kernel_shape must hold two positive values")),
    };
    let [sh, sw] = attr_pair(node, "strides", 1)?;
    let [dh, dw] = attr_pair(node, "dilations", 1)?;
    let [pt, pl, pb, pr] = attr_pads(node)?;
    let (n, c, h, wd) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
    let oh = window_out(node, h, kh, sh, dh, (pt, pb))?;
    let ow = window_out(node, wd, kw, sw, dw, (pl, pr))?;

    let x = x.as_standard_layout();
    let xs = x.as_slice().ok_or_else(|| err(node, "input is not contiguous"))?;
    let mut out = vec![f32::NEG_INFINITY; n * c * oh * ow];
    for plane in 0..n * c {
        let base = plane * h * wd;
        for oy in 0..oh {
            for ox in 0..ow {
                let mut best = f32::NEG_INFINITY;
                for ky in 0..kh {
                    let iy = (oy * sh + ky * dh) as isize - pt as isize;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for kx in 0..kw {
                        let ix = (ox * sw + kx * dw) as isize - pl as isize;
                        if ix < 0 || ix >= wd as isize {
                            continue;
                        }
                        best = best.max(xs[base + iy as usize * wd + ix as usize]);
                    }
                }
                out[(plane * oh + oy) * ow + ox] = best;
            }
        }
    }
    ArrayD::from_shape_vec(IxDyn(&[n, c, oh, ow]), out).map_err(|e| err(node, e.to_string()))
}

/// Per-channel affine form `(scale, shift)` of an inference BatchNormalization
pub(crate) fn batch_norm_affine(
    scale: &ArrayD<f32>,
    bias: &ArrayD<f32>,
    mean: &ArrayD<f32>,
    var: &ArrayD<f32>,
    epsilon: f32,
) -> (Vec<f32>, Vec<f32>) {
    let factors: Vec<f32> = scale
        .iter()
        .zip(var.iter())
        .map(|(&s, &v)| s / (v + epsilon).sqrt())
        .collect();
    let shifts = bias
        .iter()
        .zip(mean.iter())
        .zip(&factors)
        .map(|((&b, &m), &f)| b - m * f)
        .collect();
    (factors, shifts)
}

pub(super) fn batch_norm(node: &Node, x: &ArrayD<f32>, params: [&ArrayD<f32>; 4]) -> Result<ArrayD<f32>> {
    if x.ndim() < 2 {
        return Err(err(node, "input must have a channel axis"));
    }
    let channels = x.shape()[1];
    if params.iter().any(|p| p.len() != channels) {
        return Err(err(node, format!("parameters do not match {} channels", channels)));
    }
    let epsilon = node.attr_float("epsilon").unwrap_or(1e-5);
    let [scale, bias, mean, var] = params;
    let (factors, shifts) = batch_norm_affine(scale, bias, mean, var, epsilon);
    let mut per_channel = vec![1usize; x.ndim()];
    per_channel[1] = channels;
    let factors = ArrayD::from_shape_vec(IxDyn(&per_channel), factors).map_err(|e| err(node, e.to_string()))?;
    let shifts = ArrayD::from_shape_vec(IxDyn(&per_channel), shifts).map_err(|e| err(node, e.to_string()))?;
    Ok(x * &factors + &shifts)
}

pub(super) fn resize(node: &Node, x: &ArrayD<f32>, scales: Option<&ArrayD<f32>>, sizes: Option<&ArrayD<i64>>) -> Result<ArrayD<f32>> {
    let mode = node.attr_string("mode").unwrap_or("nearest");
    let transform = node.attr_string("coordinate_transformation_mode").unwrap_or("half_pixel");
    let nearest = node.attr_string("nearest_mode").unwrap_or("round_prefer_floor");
    if mode != "nearest" || transform != "asymmetric" || nearest != "floor" {
        return Err(err(
            node,
            format!("unsupported resize mode {}/{}/{}", mode, transform, nearest),
        ));
    }
    let rank = x.ndim();
    let (out_shape, factors): (Vec<usize>, Vec<f32>) = match (scales.filter(|s| !s.is_empty()), sizes) {
        (Some(s), _) if s.len() == rank => {
            let factors: Vec<f32> = s.iter().copied().collect();
            let dims = x
                .shape()
                .iter()
                .zip(&factors)
                .map(|(&d, &f)| (d as f32 * f).floor() as usize)
                .collect();
            (dims, factors)
        }
        (None, Some(sz)) if sz.len() == rank => {
            let dims: Vec<usize> = sz.iter().map(|&d| d.max(0) as usize).collect();
            let factors = x
                .shape()
                .iter()
                .zip(&dims)
                .map(|(&i, &o)| if i == 0 { 1.0 } else { o as f32 / i as f32 })
                .collect();
            (dims, factors)
        }
        _ => return Err(err(node, "resize needs scales or sizes matching the input rank")),
    };
    let in_shape = x.shape().to_vec();
    Ok(ArrayD::from_shape_fn(IxDyn(&out_shape), |idx| {
        let src: Vec<usize> = (0..rank)
            .map(|a| {
                let pos = (idx[a] as f32 / factors[a]).floor() as usize;
                pos.min(in_shape[a].saturating_sub(1))
            })
            .collect();
        x[IxDyn(&src)]
    }))
}

// ----------------------------------------------------------------------
// Elementwise
// ----------------------------------------------------------------------

fn broadcast_zip<T: Copy, U>(node: &Node, a: &ArrayD<T>, b: &ArrayD<T>, f: impl Fn(T, T) -> U) -> Result<ArrayD<U>> {
    let shape = broadcast_shape(a.shape(), b.shape())
        .ok_or_else(|| err(node, format!("cannot broadcast {:?} with {:?}", a.shape(), b.shape())))?;
    let av = a
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| err(node, "broadcast failed"))?;
    let bv = b
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| err(node, "broadcast failed"))?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

pub(super) fn binary(node: &Node, a: &TensorData, b: &TensorData) -> Result<TensorData> {
    use crate::graph::OpKind;
    match (a, b) {
        (TensorData::Float(a), TensorData::Float(b)) => {
            let f: fn(f32, f32) -> f32 = match node.op {
                OpKind::Add => |x, y| x + y,
                OpKind::Sub => |x, y| x - y,
                OpKind::Mul => |x, y| x * y,
                OpKind::Div => |x, y| x / y,
                other => return Err(err(node, format!("{} is not binary", other))),
            };
            broadcast_zip(node, a, b, f).map(TensorData::Float)
        }
        (TensorData::Int64(a), TensorData::Int64(b)) => {
            let f: fn(i64, i64) -> i64 = match node.op {
                OpKind::Add => i64::wrapping_add,
                OpKind::Sub => i64::wrapping_sub,
                OpKind::Mul => i64::wrapping_mul,
                OpKind::Div => {
                    if b.iter().any(|&v| v == 0) {
                        return Err(err(node, "integer division by zero"));
                    }
                    i64::wrapping_div
                }
                other => return Err(err(node, format!("{} is not binary", other))),
            };
            broadcast_zip(node, a, b, f).map(TensorData::Int64)
        }
        _ => Err(err(node, "operands have different element types")),
    }
}

pub(super) fn sigmoid(x: &ArrayD<f32>) -> ArrayD<f32> {
    x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

pub(super) fn cast(node: &Node, x: &TensorData) -> Result<TensorData> {
    match (node.attr_int("to"), x) {
        (Some(1), TensorData::Float(a)) => Ok(TensorData::Float(a.clone())),
        (Some(1), TensorData::Int64(a)) => Ok(TensorData::Float(a.mapv(|v| v as f32))),
        (Some(7), TensorData::Float(a)) => Ok(TensorData::Int64(a.mapv(|v| v as i64))),
        (Some(7), TensorData::Int64(a)) => Ok(TensorData::Int64(a.clone())),
        (to, _) => Err(err(node, format!("unsupported cast target {:?}", to))),
    }
}

// ----------------------------------------------------------------------
// Tensor manipulation
// ----------------------------------------------------------------------

fn concat_arrays<T: Clone>(node: &Node, arrays: &[&ArrayD<T>], axis: usize) -> Result<ArrayD<T>> {
    let views: Vec<ArrayViewD<'_, T>> = arrays.iter().map(|a| a.view()).collect();
    concatenate(Axis(axis), &views).map_err(|e| err(node, format!("concat failed: {}", e)))
}

pub(super) fn concat(node: &Node, inputs: &[&TensorData]) -> Result<TensorData> {
    let first = inputs.first().ok_or_else(|| err(node, "Concat needs at least one input"))?;
    let axis = axis_of(node, node.attr_int_or("axis", 0), first.shape().len())?;
    match first {
        TensorData::Float(_) => {
            let arrays = inputs.iter().map(|t| float(node, t)).collect::<Result<Vec<_>>>()?;
            concat_arrays(node, &arrays, axis).map(TensorData::Float)
        }
        TensorData::Int64(_) => {
            let arrays = inputs.iter().map(|t| int64(node, t)).collect::<Result<Vec<_>>>()?;
            concat_arrays(node, &arrays, axis).map(TensorData::Int64)
        }
    }
}

/// Chunk sizes of a Split along an axis of length `dim`
pub(crate) fn split_sizes(node: &Node, split: Option<&[i64]>, dim: i64) -> Option<Vec<i64>> {
    let parts = node.outputs.len() as i64;
    match split.or_else(|| node.attr_ints("split")) {
        Some(sizes) if sizes.iter().sum::<i64>() == dim && sizes.len() as i64 == parts => Some(sizes.to_vec()),
        Some(_) => None,
        None if parts > 0 && dim % parts == 0 => Some(vec![dim / parts; parts as usize]),
        None => None,
    }
}

pub(super) fn split(node: &Node, x: &TensorData, split: Option<&ArrayD<i64>>) -> Result<Vec<TensorData>> {
    let rank = x.shape().len();
    let axis = axis_of(node, node.attr_int_or("axis", 0), rank)?;
    let explicit: Option<Vec<i64>> = split.map(|s| s.iter().copied().collect());
    let dim = x.shape()[axis] as i64;
    let sizes = split_sizes(node, explicit.as_deref(), dim)
        .ok_or_else(|| err(node, format!("cannot split axis of length {} into {} parts", dim, node.outputs.len())))?;
    let mut start = 0isize;
    let mut outputs = Vec::with_capacity(sizes.len());
    for size in sizes {
        let end = start + size as isize;
        let part = map_tensor!(x, |a| a.slice_axis(Axis(axis), Slice::from(start..end)).to_owned());
        outputs.push(part);
        start = end;
    }
    Ok(outputs)
}

/// Resolve a Reshape target (with `0` and `-1`) against a concrete input shape
pub(crate) fn reshape_target(input: &[usize], target: &[i64], allow_zero: bool) -> std::result::Result<Vec<usize>, String> {
    let total: usize = input.iter().product();
    let mut dims = Vec::with_capacity(target.len());
    let mut infer = None;
    for (i, &t) in target.iter().enumerate() {
        match t {
            -1 if infer.is_none() => {
                infer = Some(i);
                dims.push(1);
            }
            -1 => return Err("more than one -1 in reshape target".to_string()),
            0 if !allow_zero => dims.push(*input.get(i).ok_or("0 refers past the input rank")?),
            t if t >= 0 => dims.push(t as usize),
            t => return Err(format!("invalid reshape dimension {}", t)),
        }
    }
    if let Some(i) = infer {
        let known: usize = dims.iter().product();
        if known == 0 || total % known != 0 {
            return Err(format!("cannot infer -1 reshaping {:?} to {:?}", input, target));
        }
        dims[i] = total / known;
    }
    if dims.iter().product::<usize>() != total {
        return Err(format!("cannot reshape {:?} to {:?}", input, target));
    }
    Ok(dims)
}

pub(super) fn reshape(node: &Node, x: &TensorData, target: &ArrayD<i64>) -> Result<TensorData> {
    let target: Vec<i64> = target.iter().copied().collect();
    let allow_zero = node.attr_int_or("allowzero", 0) != 0;
    let dims = reshape_target(x.shape(), &target, allow_zero).map_err(|reason| err(node, reason))?;
    Ok(map_tensor!(x, |a| reshape_array(node, a, &dims)?))
}

/// Permutation of a Transpose (default reverses the axes)
pub(crate) fn transpose_perm(node: &Node, rank: usize) -> Option<Vec<usize>> {
    match node.attr_ints("perm") {
        None => Some((0..rank).rev().collect()),
        Some(perm) => {
            let perm: Vec<usize> = perm.iter().map(|&p| normalize_axis(p, rank)).collect::<Option<_>>()?;
            let mut seen = vec![false; rank];
            for &p in &perm {
                if std::mem::replace(&mut seen[p], true) {
                    return None;
                }
            }
            (perm.len() == rank).then_some(perm)
        }
    }
}

pub(super) fn transpose(node: &Node, x: &TensorData) -> Result<TensorData> {
    let rank = x.shape().len();
    let perm = transpose_perm(node, rank).ok_or_else(|| err(node, "invalid perm"))?;
    Ok(map_tensor!(x, |a| a
        .view()
        .permuted_axes(perm.as_slice())
        .as_standard_layout()
        .into_owned()))
}

/// Clamped `[start, end)` of a positive-step slice over an axis of length `dim`
pub(crate) fn slice_bounds(start: i64, end: i64, dim: i64) -> (i64, i64) {
    let clamp = |v: i64| {
        let v = if v < 0 { v.saturating_add(dim) } else { v };
        v.clamp(0, dim)
    };
    let (s, e) = (clamp(start), clamp(end));
    (s, e.max(s))
}

/// Per-axis `(axis, start, end, step)` of a Slice
pub(crate) fn slice_plan(
    node: &Node,
    shape_rank: usize,
    starts: &[i64],
    ends: &[i64],
    axes: Option<&[i64]>,
    steps: Option<&[i64]>,
) -> std::result::Result<Vec<(usize, i64, i64, i64)>, String> {
    if starts.len() != ends.len() {
        return Err("starts and ends differ in length".to_string());
    }
    let axes: Vec<i64> = axes.map(<[i64]>::to_vec).unwrap_or_else(|| (0..starts.len() as i64).collect());
    let steps: Vec<i64> = steps.map(<[i64]>::to_vec).unwrap_or_else(|| vec![1; starts.len()]);
    if axes.len() != starts.len() || steps.len() != starts.len() {
        return Err(format!("{}: axes/steps length mismatch", node.name));
    }
    let mut plan = Vec::with_capacity(starts.len());
    for i in 0..starts.len() {
        let axis = normalize_axis(axes[i], shape_rank).ok_or_else(|| format!("axis {} out of range", axes[i]))?;
        if steps[i] <= 0 {
            return Err(format!("step {} is not supported", steps[i]));
        }
        plan.push((axis, starts[i], ends[i], steps[i]));
    }
    Ok(plan)
}

pub(super) fn slice(node: &Node, x: &TensorData, params: [Option<&ArrayD<i64>>; 4]) -> Result<TensorData> {
    let to_vec = |a: Option<&ArrayD<i64>>| a.map(|a| a.iter().copied().collect::<Vec<i64>>());
    let [starts, ends, axes, steps] = params.map(to_vec);
    let (starts, ends) = match (starts, ends) {
        (Some(s), Some(e)) => (s, e),
        _ => return Err(err(node, "Slice needs starts and ends")),
    };
    let plan = slice_plan(node, x.shape().len(), &starts, &ends, axes.as_deref(), steps.as_deref())
        .map_err(|reason| err(node, reason))?;
    Ok(map_tensor!(x, |a| {
        let mut view = a.view();
        for &(axis, start, end, step) in &plan {
            let (s, e) = slice_bounds(start, end, view.shape()[axis] as i64);
            view.slice_axis_inplace(Axis(axis), Slice::new(s as isize, Some(e as isize), step as isize));
        }
        view.to_owned()
    }))
}

pub(super) fn gather(node: &Node, x: &TensorData, indices: &ArrayD<i64>) -> Result<TensorData> {
    let rank = x.shape().len();
    let axis = axis_of(node, node.attr_int_or("axis", 0), rank)?;
    let dim = x.shape()[axis] as i64;
    let flat: Vec<usize> = indices
        .iter()
        .map(|&i| {
            let i = if i < 0 { i + dim } else { i };
            (0..dim)
                .contains(&i)
                .then_some(i as usize)
                .ok_or_else(|| err(node, format!("index {} out of range for axis of length {}", i, dim)))
        })
        .collect::<Result<_>>()?;
    let mut out_shape: Vec<usize> = x.shape()[..axis].to_vec();
    out_shape.extend_from_slice(indices.shape());
    out_shape.extend_from_slice(&x.shape()[axis + 1..]);
    Ok(map_tensor!(x, |a| reshape_array(node, &a.select(Axis(axis), &flat), &out_shape)?))
}

pub(super) fn unsqueeze(node: &Node, x: &TensorData, axes: Option<&ArrayD<i64>>) -> Result<TensorData> {
    let axes: Vec<i64> = match axes {
        Some(a) => a.iter().copied().collect(),
        None => node
            .attr_ints("axes")
            .map(<[i64]>::to_vec)
            .ok_or_else(|| err(node, "Unsqueeze needs axes"))?,
    };
    let out_rank = x.shape().len() + axes.len();
    let mut inserted = vec![false; out_rank];
    for &a in &axes {
        let a = axis_of(node, a, out_rank)?;
        if std::mem::replace(&mut inserted[a], true) {
            return Err(err(node, "duplicate unsqueeze axis"));
        }
    }
    let mut source = x.shape().iter();
    let dims: Vec<usize> = inserted
        .iter()
        .map(|&ins| if ins { 1 } else { source.next().copied().unwrap_or(1) })
        .collect();
    Ok(map_tensor!(x, |a| reshape_array(node, a, &dims)?))
}

pub(super) fn constant_of_shape(node: &Node, shape: &ArrayD<i64>) -> Result<TensorData> {
    let dims: Vec<usize> = shape
        .iter()
        .map(|&d| usize::try_from(d).map_err(|_| err(node, format!("negative dimension {}", d))))
        .collect::<Result<_>>()?;
    match node.attr_tensor("value") {
        None => Ok(TensorData::Float(ArrayD::zeros(IxDyn(&dims)))),
        Some(TensorData::Float(v)) if v.len() == 1 => Ok(TensorData::Float(ArrayD::from_elem(
            IxDyn(&dims),
            v.iter().next().copied().unwrap_or(0.0),
        ))),
        Some(TensorData::Int64(v)) if v.len() == 1 => Ok(TensorData::Int64(ArrayD::from_elem(
            IxDyn(&dims),
            v.iter().next().copied().unwrap_or(0),
        ))),
        Some(_) => Err(err(node, "value must hold exactly one element")),
    }
}

pub(super) fn cum_sum(node: &Node, x: &TensorData, axis: &ArrayD<i64>) -> Result<TensorData> {
    let axis = match axis.iter().next() {
        Some(&a) if axis.len() == 1 => axis_of(node, a, x.shape().len())?,
        _ => return Err(err(node, "axis must be a single value")),
    };
    let exclusive = node.attr_int_or("exclusive", 0) != 0;
    let reverse = node.attr_int_or("reverse", 0) != 0;
    Ok(map_tensor!(x, |a| {
        let mut out = a.clone();
        if reverse {
            out.invert_axis(Axis(axis));
        }
        out.accumulate_axis_inplace(Axis(axis), |&prev, curr| *curr = *curr + prev);
        if reverse {
            out.invert_axis(Axis(axis));
        }
        if exclusive {
            out = out - a;
        }
        out.as_standard_layout().into_owned()
    }))
}

// ----------------------------------------------------------------------
// Reductions
// ----------------------------------------------------------------------

pub(super) fn softmax(node: &Node, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let axis = axis_of(node, node.attr_int_or("axis", -1), x.ndim())?;
    let mut out = x.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    Ok(out)
}

pub(super) fn reduce_max(node: &Node, x: &ArrayD<f32>, axes_input: Option<&ArrayD<i64>>) -> Result<ArrayD<f32>> {
    let rank = x.ndim();
    let axes: Vec<i64> = match axes_input {
        Some(a) => a.iter().copied().collect(),
        None => node.attr_ints("axes").map(<[i64]>::to_vec).unwrap_or_default(),
    };
    let mut axes: Vec<usize> = if axes.is_empty() {
        (0..rank).collect()
    } else {
        axes.iter().map(|&a| axis_of(node, a, rank)).collect::<Result<_>>()?
    };
    axes.sort_unstable();
    axes.dedup();
    let keep = node.attr_int_or("keepdims", 1) != 0;
    let mut out = x.clone();
    for &axis in axes.iter().rev() {
        out = out.fold_axis(Axis(axis), f32::NEG_INFINITY, |&m, &v| m.max(v));
        if keep {
            out = out.insert_axis(Axis(axis));
        }
    }
    Ok(out)
}

pub(super) fn arg_max(node: &Node, x: &ArrayD<f32>) -> Result<ArrayD<i64>> {
    let axis = axis_of(node, node.attr_int_or("axis", 0), x.ndim())?;
    let last = node.attr_int_or("select_last_index", 0) != 0;
    let out = x.map_axis(Axis(axis), |lane| {
        let mut best = 0usize;
        for (i, &v) in lane.iter().enumerate() {
            let better = if last { v >= lane[best] } else { v > lane[best] };
            if better {
                best = i;
            }
        }
        best as i64
    });
    Ok(if node.attr_int_or("keepdims", 1) != 0 {
        out.insert_axis(Axis(axis))
    } else {
        out
    })
}

// ----------------------------------------------------------------------
// Non-max suppression
// ----------------------------------------------------------------------

/// Intersection-over-union of two boxes given by opposite corners
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let (ax1, ax2) = (a[0].min(a[2]), a[0].max(a[2]));
    let (ay1, ay2) = (a[1].min(a[3]), a[1].max(a[3]));
    let (bx1, bx2) = (b[0].min(b[2]), b[0].max(b[2]));
    let (by1, by2) = (b[1].min(b[3]), b[1].max(b[3]));
    let iw = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
    let ih = (ay2.min(by2) - ay1.max(by1)).max(0.0);
    let inter = iw * ih;
    let union = (ax2 - ax1) * (ay2 - ay1) + (bx2 - bx1) * (by2 - by1) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy IoU suppression over one class
///
/// Keeps candidates with `score > score_threshold`, visits them by
/// descending score (lower index first on ties) and selects a box unless its
/// IoU with an already selected box exceeds `iou_threshold`. Returns the
/// selected indices in selection order.
pub fn greedy_nms(
    boxes: &[[f32; 4]],
    scores: &[f32],
    iou_threshold: f32,
    score_threshold: f32,
    max_output: usize,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len().min(boxes.len()))
        .filter(|&i| scores[i] > score_threshold)
        .collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    let mut selected: Vec<usize> = Vec::new();
    for i in order {
        if selected.len() >= max_output {
            break;
        }
        if selected.iter().all(|&j| iou(&boxes[i], &boxes[j]) <= iou_threshold) {
            selected.push(i);
        }
    }
    selected
}

fn scalar_param<T: Copy>(a: Option<&ArrayD<T>>, default: T) -> T {
    a.and_then(|a| a.iter().next().copied()).unwrap_or(default)
}

pub(super) fn non_max_suppression(
    node: &Node,
    boxes: &ArrayD<f32>,
    scores: &ArrayD<f32>,
    max_output: Option<&ArrayD<i64>>,
    iou_threshold: Option<&ArrayD<f32>>,
    score_threshold: Option<&ArrayD<f32>>,
) -> Result<ArrayD<i64>> {
    if boxes.ndim() != 3 || boxes.shape()[2] != 4 || scores.ndim() != 3 {
        return Err(err(node, format!("bad box/score shapes {:?} {:?}", boxes.shape(), scores.shape())));
    }
    let (batches, count) = (boxes.shape()[0], boxes.shape()[1]);
    let classes = scores.shape()[1];
    if scores.shape()[0] != batches || scores.shape()[2] != count {
        return Err(err(node, "scores do not match boxes"));
    }
    let max_output = scalar_param(max_output, 0).max(0) as usize;
    let iou_threshold = scalar_param(iou_threshold, 0.0);
    let score_threshold = scalar_param(score_threshold, f32::NEG_INFINITY);
    let center = node.attr_int_or("center_point_box", 0) != 0;

    let mut rows: Vec<i64> = Vec::new();
    for b in 0..batches {
        let corners: Vec<[f32; 4]> = (0..count)
            .map(|i| {
                let v = [boxes[[b, i, 0]], boxes[[b, i, 1]], boxes[[b, i, 2]], boxes[[b, i, 3]]];
                if center {
                    [v[0] - v[2] / 2.0, v[1] - v[3] / 2.0, v[0] + v[2] / 2.0, v[1] + v[3] / 2.0]
                } else {
                    v
                }
            })
            .collect();
        for c in 0..classes {
            let class_scores: Vec<f32> = (0..count).map(|i| scores[[b, c, i]]).collect();
            for i in greedy_nms(&corners, &class_scores, iou_threshold, score_threshold, max_output) {
                rows.extend_from_slice(&[b as i64, c as i64, i as i64]);
            }
        }
    }
    let selected = rows.len() / 3;
    ArrayD::from_shape_vec(IxDyn(&[selected, 3]), rows).map_err(|e| err(node, e.to_string()))
}
