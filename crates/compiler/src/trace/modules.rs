// Module lowerings
//
// Each function lowers one layer of the layer table into graph operators and
// returns the layer's output tensor and stride. Weight names follow the
// module tree (`model.{i}.cv1.conv.weight`, `model.{i}.m.{j}.cv2.bn.bias`).

use super::{GraphBuilder, LayerOutput, OUTPUT_NAME};
use crate::graph::{AttrValue, OpKind, TensorData};
use crate::model::{Checkpoint, LayerSpec};
use crate::{ExportError, Result};

/// BatchNorm epsilon used by the detection family
const BN_EPSILON: f32 = 1e-3;

pub(super) struct LayerContext<'a> {
    pub checkpoint: &'a Checkpoint,
    pub layer: &'a LayerSpec,
    pub prefix: &'a str,
}

/// `model.2.m.0.cv1` -> `/model.2/m.0/cv1`
pub(super) fn scope_of(prefix: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for segment in prefix.split('.') {
        let numeric = segment.chars().all(|c| c.is_ascii_digit());
        match parts.last_mut() {
            Some(last) if numeric && !last.chars().any(|c| c == '.') => {
                last.push('.');
                last.push_str(segment);
            }
            _ => parts.push(segment.to_string()),
        }
    }
    format!("/{}", parts.join("/"))
}

fn single_source<'s>(ctx: &LayerContext<'_>, sources: &'s [LayerOutput]) -> Result<&'s LayerOutput> {
    match sources {
        [source] => Ok(source),
        _ => Err(ExportError::InvalidModel(format!(
            "{} ({}) takes one input, got {}",
            ctx.prefix,
            ctx.layer.module,
            sources.len()
        ))),
    }
}

fn weight_dims(checkpoint: &Checkpoint, name: &str, rank: usize) -> Result<Vec<usize>> {
    let dims = checkpoint.weight(name)?.shape().to_vec();
    if dims.len() != rank {
        return Err(ExportError::InvalidModel(format!(
            "weight '{}' has rank {}, expected {}",
            name,
            dims.len(),
            rank
        )));
    }
    Ok(dims)
}

fn conv_attrs(kernel: i64, stride: i64) -> Vec<(&'static str, AttrValue)> {
    let pad = kernel / 2;
    vec![
        ("dilations", AttrValue::Ints(vec![1, 1])),
        ("group", AttrValue::Int(1)),
        ("kernel_shape", AttrValue::Ints(vec![kernel, kernel])),
        ("pads", AttrValue::Ints(vec![pad; 4])),
        ("strides", AttrValue::Ints(vec![stride, stride])),
    ]
}

/// Output channels of the conv block at `prefix`
fn block_channels(checkpoint: &Checkpoint, prefix: &str) -> Result<usize> {
    Ok(weight_dims(checkpoint, &format!("{}.conv.weight", prefix), 4)?[0])
}

/// Conv -> BatchNorm -> SiLU
///
/// A block without BatchNorm weights but with a conv bias (a checkpoint
/// whose norms were already folded) lowers to a biased Conv.
pub(super) fn conv_block(
    b: &mut GraphBuilder,
    checkpoint: &Checkpoint,
    prefix: &str,
    x: &str,
    stride: i64,
) -> Result<String> {
    let scope = scope_of(prefix);
    let weight_name = format!("{}.conv.weight", prefix);
    let dims = weight_dims(checkpoint, &weight_name, 4)?;
    let kernel = dims[2] as i64;
    let weight = b.weight(checkpoint, &weight_name)?;

    let bn = |field: &str| format!("{}.bn.{}", prefix, field);
    let has_bn = checkpoint.has_weight(&bn("weight"));
    let bias_name = format!("{}.conv.bias", prefix);

    let y = if !has_bn && checkpoint.has_weight(&bias_name) {
        let bias = b.weight(checkpoint, &bias_name)?;
        b.op(
            &format!("{}/conv", scope),
            OpKind::Conv,
            &[x, &weight, &bias],
            conv_attrs(kernel, stride),
        )?
    } else {
        b.op(&format!("{}/conv", scope), OpKind::Conv, &[x, &weight], conv_attrs(kernel, stride))?
    };

    let y = if has_bn {
        let params = ["weight", "bias", "running_mean", "running_var"]
            .iter()
            .map(|field| b.weight(checkpoint, &bn(field)))
            .collect::<Result<Vec<String>>>()?;
        b.op(
            &format!("{}/bn", scope),
            OpKind::BatchNormalization,
            &[&y, &params[0], &params[1], &params[2], &params[3]],
            vec![("epsilon", AttrValue::Float(BN_EPSILON)), ("momentum", AttrValue::Float(0.97))],
        )?
    } else {
        y
    };

    silu(b, &format!("{}/act", scope), &y)
}

/// `x * sigmoid(x)`
fn silu(b: &mut GraphBuilder, scope: &str, x: &str) -> Result<String> {
    let sig = b.op(scope, OpKind::Sigmoid, &[x], vec![])?;
    b.op(scope, OpKind::Mul, &[x, &sig], vec![])
}

/// Plain 1x1 Conv with bias (detection head output projections)
fn projection(b: &mut GraphBuilder, checkpoint: &Checkpoint, prefix: &str, x: &str) -> Result<String> {
    let weight_name = format!("{}.weight", prefix);
    let dims = weight_dims(checkpoint, &weight_name, 4)?;
    let weight = b.weight(checkpoint, &weight_name)?;
    let bias = b.weight(checkpoint, &format!("{}.bias", prefix))?;
    b.op(
        &scope_of(prefix),
        OpKind::Conv,
        &[x, &weight, &bias],
        conv_attrs(dims[2] as i64, 1),
    )
}

pub(super) fn conv_layer(b: &mut GraphBuilder, ctx: &LayerContext<'_>, sources: &[LayerOutput]) -> Result<LayerOutput> {
    let source = single_source(ctx, sources)?;
    let stride = ctx.layer.arg_i64(2).unwrap_or(1).max(1);
    let tensor = conv_block(b, ctx.checkpoint, ctx.prefix, &source.tensor, stride)?;
    Ok(LayerOutput {
        tensor,
        stride: source.stride * stride,
    })
}

/// CSP bottleneck with two convolutions: cv1 -> split -> n bottlenecks -> concat -> cv2
pub(super) fn c2f(b: &mut GraphBuilder, ctx: &LayerContext<'_>, sources: &[LayerOutput]) -> Result<LayerOutput> {
    let source = single_source(ctx, sources)?;
    let prefix = ctx.prefix;
    let scope = scope_of(prefix);
    let shortcut = ctx.layer.arg_bool(1).unwrap_or(false);

    let cv1_prefix = format!("{}.cv1", prefix);
    let hidden2 = block_channels(ctx.checkpoint, &cv1_prefix)?;
    if hidden2 % 2 != 0 {
        return Err(ExportError::InvalidModel(format!(
            "{}: cv1 produces {} channels, which do not split in two",
            prefix, hidden2
        )));
    }
    let hidden = (hidden2 / 2) as i64;

    let y = conv_block(b, ctx.checkpoint, &cv1_prefix, &source.tensor, 1)?;
    let split = b.constant_i64(&format!("{}/split", scope), &[hidden, hidden])?;
    let halves = b.op_multi(&scope, OpKind::Split, &[&y, &split], vec![("axis", AttrValue::Int(1))], 2)?;

    let mut parts = halves;
    for j in 0..ctx.layer.repeats {
        let m = format!("{}.m.{}", prefix, j);
        let last = parts.last().cloned().unwrap_or_default();
        let h = conv_block(b, ctx.checkpoint, &format!("{}.cv1", m), &last, 1)?;
        let h = conv_block(b, ctx.checkpoint, &format!("{}.cv2", m), &h, 1)?;
        let out_channels = block_channels(ctx.checkpoint, &format!("{}.cv2", m))?;
        let h = if shortcut && out_channels as i64 == hidden {
            b.op(&scope_of(&m), OpKind::Add, &[&last, &h], vec![])?
        } else {
            h
        };
        parts.push(h);
    }

    let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    let cat = b.op(&scope, OpKind::Concat, &refs, vec![("axis", AttrValue::Int(1))])?;
    let tensor = conv_block(b, ctx.checkpoint, &format!("{}.cv2", prefix), &cat, 1)?;
    Ok(LayerOutput {
        tensor,
        stride: source.stride,
    })
}

/// Spatial pyramid pooling (fast): cv1 -> 3 chained MaxPools -> concat -> cv2
pub(super) fn sppf(b: &mut GraphBuilder, ctx: &LayerContext<'_>, sources: &[LayerOutput]) -> Result<LayerOutput> {
    let source = single_source(ctx, sources)?;
    let prefix = ctx.prefix;
    let scope = scope_of(prefix);
    let k = ctx.layer.arg_i64(1).unwrap_or(5);
    if k <= 0 || k % 2 == 0 {
        return Err(ExportError::InvalidModel(format!("{}: SPPF kernel must be odd, got {}", prefix, k)));
    }

    let x = conv_block(b, ctx.checkpoint, &format!("{}.cv1", prefix), &source.tensor, 1)?;
    let mut pooled = vec![x];
    for _ in 0..3 {
        let last = pooled.last().cloned().unwrap_or_default();
        let y = b.op(
            &format!("{}/m", scope),
            OpKind::MaxPool,
            &[&last],
            vec![
                ("ceil_mode", AttrValue::Int(0)),
                ("dilations", AttrValue::Ints(vec![1, 1])),
                ("kernel_shape", AttrValue::Ints(vec![k, k])),
                ("pads", AttrValue::Ints(vec![k / 2; 4])),
                ("strides", AttrValue::Ints(vec![1, 1])),
            ],
        )?;
        pooled.push(y);
    }
    let refs: Vec<&str> = pooled.iter().map(String::as_str).collect();
    let cat = b.op(&scope, OpKind::Concat, &refs, vec![("axis", AttrValue::Int(1))])?;
    let tensor = conv_block(b, ctx.checkpoint, &format!("{}.cv2", prefix), &cat, 1)?;
    Ok(LayerOutput {
        tensor,
        stride: source.stride,
    })
}

/// Nearest-neighbour upsampling by an integer factor
pub(super) fn upsample(b: &mut GraphBuilder, ctx: &LayerContext<'_>, sources: &[LayerOutput]) -> Result<LayerOutput> {
    let source = single_source(ctx, sources)?;
    let scope = scope_of(ctx.prefix);
    let scale = ctx.layer.arg_f64(1).unwrap_or(2.0);
    if let Some(mode) = ctx.layer.arg_str(2) {
        if mode != "nearest" {
            return Err(ExportError::unsupported(format!("Upsample({})", mode), ctx.prefix));
        }
    }
    if scale < 1.0 || scale.fract() != 0.0 {
        return Err(ExportError::InvalidModel(format!(
            "{}: upsample scale must be a positive integer, got {}",
            ctx.prefix, scale
        )));
    }
    let s = scale as f32;
    let scales = b.constant(&format!("{}/scales", scope), TensorData::f32_vec(&[1.0, 1.0, s, s]))?;
    let tensor = b.op(
        &scope,
        OpKind::Resize,
        &[&source.tensor, "", &scales],
        vec![
            ("coordinate_transformation_mode", AttrValue::String("asymmetric".to_string())),
            ("mode", AttrValue::String("nearest".to_string())),
            ("nearest_mode", AttrValue::String("floor".to_string())),
        ],
    )?;
    Ok(LayerOutput {
        tensor,
        stride: (source.stride / scale as i64).max(1),
    })
}

pub(super) fn concat(b: &mut GraphBuilder, ctx: &LayerContext<'_>, sources: &[LayerOutput]) -> Result<LayerOutput> {
    let first = sources
        .first()
        .ok_or_else(|| ExportError::InvalidModel(format!("{}: Concat without inputs", ctx.prefix)))?;
    if let Some(other) = sources.iter().find(|s| s.stride != first.stride) {
        return Err(ExportError::InvalidModel(format!(
            "{}: Concat joins strides {} and {}",
            ctx.prefix, first.stride, other.stride
        )));
    }
    let axis = ctx.layer.arg_i64(0).unwrap_or(1);
    let refs: Vec<&str> = sources.iter().map(|s| s.tensor.as_str()).collect();
    let tensor = b.op(&scope_of(ctx.prefix), OpKind::Concat, &refs, vec![("axis", AttrValue::Int(axis))])?;
    Ok(LayerOutput {
        tensor,
        stride: first.stride,
    })
}

/// Anchor points `[2, h*w]` and strides `[1, h*w]` of one feature level
///
/// Derived from the feature map's runtime shape so the same graph works
/// for every input size: `ConstantOfShape(h, w)` of ones, cumulative sums
/// along each axis minus one half give the cell centers.
fn level_anchors(b: &mut GraphBuilder, scope: &str, feature: &str, stride: i64) -> Result<(String, String)> {
    let shape = b.op(scope, OpKind::Shape, &[feature], vec![])?;
    let start = b.constant_i64(&format!("{}/hw_start", scope), &[2])?;
    let end = b.constant_i64(&format!("{}/hw_end", scope), &[4])?;
    let hw = b.op(scope, OpKind::Slice, &[&shape, &start, &end], vec![])?;
    let ones = b.op(
        scope,
        OpKind::ConstantOfShape,
        &[&hw],
        vec![("value", AttrValue::Tensor(TensorData::f32_vec(&[1.0])))],
    )?;

    let half = b.constant_f32(&format!("{}/half", scope), 0.5)?;
    let flat = b.constant_i64(&format!("{}/flat", scope), &[1, -1])?;
    let mut coords = Vec::with_capacity(2);
    // x varies along width (axis 1), y along height (axis 0)
    for axis in [1, 0] {
        let axis = b.constant(&format!("{}/axis", scope), TensorData::scalar_i64(axis))?;
        let count = b.op(scope, OpKind::CumSum, &[&ones, &axis], vec![])?;
        let center = b.op(scope, OpKind::Sub, &[&count, &half], vec![])?;
        coords.push(b.op(scope, OpKind::Reshape, &[&center, &flat], vec![])?);
    }
    let points = b.op(scope, OpKind::Concat, &[&coords[0], &coords[1]], vec![("axis", AttrValue::Int(0))])?;

    let ones_flat = b.op(scope, OpKind::Reshape, &[&ones, &flat], vec![])?;
    let stride = b.constant_f32(&format!("{}/stride", scope), stride as f32)?;
    let strides = b.op(scope, OpKind::Mul, &[&ones_flat, &stride], vec![])?;
    Ok((points, strides))
}

/// Detection head: per-level box/class branches, DFL decoding, dist2bbox
pub(super) fn detect(b: &mut GraphBuilder, ctx: &LayerContext<'_>, sources: &[LayerOutput]) -> Result<LayerOutput> {
    let checkpoint = ctx.checkpoint;
    let prefix = ctx.prefix;
    let scope = scope_of(prefix);
    let nc = checkpoint.architecture.nc;
    let reg_max = checkpoint.architecture.reg_max;
    if let Some(declared) = ctx.layer.arg_i64(0) {
        if declared as usize != nc {
            return Err(ExportError::InvalidModel(format!(
                "{}: Detect declares {} classes, architecture has {}",
                prefix, declared, nc
            )));
        }
    }
    if sources.is_empty() {
        return Err(ExportError::InvalidModel(format!("{}: Detect without feature levels", prefix)));
    }
    let box_channels = 4 * reg_max;
    let outputs = (box_channels + nc) as i64;

    let head_flat = b.constant_i64(&format!("{}/head_flat", scope), &[0, outputs, -1])?;
    let mut flattened = Vec::with_capacity(sources.len());
    let mut points = Vec::with_capacity(sources.len());
    let mut strides = Vec::with_capacity(sources.len());
    for (level, source) in sources.iter().enumerate() {
        let mut branches = Vec::with_capacity(2);
        for (branch, channels) in [("cv2", box_channels), ("cv3", nc)] {
            let base = format!("{}.{}.{}", prefix, branch, level);
            let h = conv_block(b, checkpoint, &format!("{}.0", base), &source.tensor, 1)?;
            let h = conv_block(b, checkpoint, &format!("{}.1", base), &h, 1)?;
            let projected = weight_dims(checkpoint, &format!("{}.2.weight", base), 4)?[0];
            if projected != channels {
                return Err(ExportError::InvalidModel(format!(
                    "{}.2 projects to {} channels, expected {}",
                    base, projected, channels
                )));
            }
            branches.push(projection(b, checkpoint, &format!("{}.2", base), &h)?);
        }
        let cat = b.op(&scope, OpKind::Concat, &[&branches[0], &branches[1]], vec![("axis", AttrValue::Int(1))])?;
        flattened.push(b.op(&scope, OpKind::Reshape, &[&cat, &head_flat], vec![])?);

        let (p, s) = level_anchors(b, &format!("{}/anchors", scope), &source.tensor, source.stride)?;
        points.push(p);
        strides.push(s);
    }

    let refs: Vec<&str> = flattened.iter().map(String::as_str).collect();
    let x = b.op(&scope, OpKind::Concat, &refs, vec![("axis", AttrValue::Int(2))])?;
    let split = b.constant_i64(&format!("{}/split", scope), &[box_channels as i64, nc as i64])?;
    let parts = b.op_multi(&scope, OpKind::Split, &[&x, &split], vec![("axis", AttrValue::Int(1))], 2)?;
    let (dist, cls) = (&parts[0], &parts[1]);

    // DFL: expectation over reg_max bins per box side
    let dfl_scope = format!("{}/dfl", scope);
    let bins = b.constant_i64(&format!("{}/bins", dfl_scope), &[0, 4, reg_max as i64, -1])?;
    let d = b.op(&dfl_scope, OpKind::Reshape, &[dist, &bins], vec![])?;
    let d = b.op(
        &dfl_scope,
        OpKind::Transpose,
        &[&d],
        vec![("perm", AttrValue::Ints(vec![0, 2, 1, 3]))],
    )?;
    let d = b.op(&dfl_scope, OpKind::Softmax, &[&d], vec![("axis", AttrValue::Int(1))])?;
    let dfl_weight = format!("{}.dfl.conv.weight", prefix);
    let dfl_dims = weight_dims(checkpoint, &dfl_weight, 4)?;
    if dfl_dims[1] != reg_max {
        return Err(ExportError::InvalidModel(format!(
            "{} has {} bins, expected {}",
            dfl_weight, dfl_dims[1], reg_max
        )));
    }
    let w = b.weight(checkpoint, &dfl_weight)?;
    let d = b.op(&format!("{}/conv", dfl_scope), OpKind::Conv, &[&d, &w], conv_attrs(1, 1))?;
    let sides = b.constant_i64(&format!("{}/sides", dfl_scope), &[0, 4, -1])?;
    let distances = b.op(&dfl_scope, OpKind::Reshape, &[&d, &sides], vec![])?;

    // dist2bbox in center/size form, scaled to input pixels
    let refs: Vec<&str> = points.iter().map(String::as_str).collect();
    let anchors = b.op(&scope, OpKind::Concat, &refs, vec![("axis", AttrValue::Int(1))])?;
    let refs: Vec<&str> = strides.iter().map(String::as_str).collect();
    let stride_row = b.op(&scope, OpKind::Concat, &refs, vec![("axis", AttrValue::Int(1))])?;

    let pair = b.constant_i64(&format!("{}/pair", scope), &[2, 2])?;
    let sides = b.op_multi(
        &scope,
        OpKind::Split,
        &[&distances, &pair],
        vec![("axis", AttrValue::Int(1))],
        2,
    )?;
    let x1y1 = b.op(&scope, OpKind::Sub, &[&anchors, &sides[0]], vec![])?;
    let x2y2 = b.op(&scope, OpKind::Add, &[&anchors, &sides[1]], vec![])?;
    let sum = b.op(&scope, OpKind::Add, &[&x1y1, &x2y2], vec![])?;
    let two = b.constant_f32(&format!("{}/two", scope), 2.0)?;
    let center = b.op(&scope, OpKind::Div, &[&sum, &two], vec![])?;
    let size = b.op(&scope, OpKind::Sub, &[&x2y2, &x1y1], vec![])?;
    let boxes = b.op(&scope, OpKind::Concat, &[&center, &size], vec![("axis", AttrValue::Int(1))])?;
    let boxes = b.op(&scope, OpKind::Mul, &[&boxes, &stride_row], vec![])?;

    let scores = b.op(&scope, OpKind::Sigmoid, &[cls], vec![])?;
    let tensor = b.op_into(
        &scope,
        OpKind::Concat,
        &[&boxes, &scores],
        vec![("axis", AttrValue::Int(1))],
        OUTPUT_NAME,
    )?;
    let stride = sources.iter().map(|s| s.stride).max().unwrap_or(1);
    Ok(LayerOutput { tensor, stride })
}
