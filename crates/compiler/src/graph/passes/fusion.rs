// Operator fusion
//
// Two rewrite rules, both folding a per-channel affine map into the
// producer's constants:
//
//   Conv → BatchNormalization           =>  Conv (scaled weights, shifted bias)
//   BatchNormalization → Mul/Add/Sub c  =>  BatchNormalization (adjusted scale/bias)
//
// Every candidate is evaluated on a seeded random probe input before and
// after the rewrite; it only fires when the results agree within
// PROBE_TOLERANCE.

use super::OptimizationPass;
use crate::graph::{Graph, Node, OpKind, TensorData};
use crate::runtime::{batch_norm_affine, eval_node};
use crate::Result;
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

const PROBE_TOLERANCE: f32 = 1e-4;
const PROBE_SEED: u64 = 0x5eed_f00d;

/// A rewrite of `producer` that absorbs its single consumer
struct Rewrite {
    producer: usize,
    consumer: usize,
    node: Node,
    initializers: Vec<(String, TensorData)>,
}

pub struct OperatorFusion {
    tolerance: f32,
}

impl OperatorFusion {
    pub fn new() -> Self {
        Self {
            tolerance: PROBE_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Index of the only consumer of the node's single output
    fn sole_consumer(graph: &Graph, node: &Node) -> Option<usize> {
        let [output] = node.outputs.as_slice() else {
            return None;
        };
        if graph.is_graph_output(output) || graph.use_count(output) != 1 {
            return None;
        }
        graph.consumers(output).first().copied()
    }

    fn float_initializer<'a>(graph: &'a Graph, name: Option<&str>) -> Option<&'a ArrayD<f32>> {
        graph.initializer(name?)?.as_f32()
    }

    fn bn_params<'a>(graph: &'a Graph, bn: &Node) -> Option<[&'a ArrayD<f32>; 4]> {
        if bn.outputs.len() != 1 {
            return None;
        }
        Some([
            Self::float_initializer(graph, bn.input(1))?,
            Self::float_initializer(graph, bn.input(2))?,
            Self::float_initializer(graph, bn.input(3))?,
            Self::float_initializer(graph, bn.input(4))?,
        ])
    }

    fn conv_bn(&self, graph: &Graph, producer: usize) -> Option<Rewrite> {
        let conv = graph.node(producer)?;
        if conv.op != OpKind::Conv {
            return None;
        }
        let consumer = Self::sole_consumer(graph, conv)?;
        let bn = graph.node(consumer)?;
        if bn.op != OpKind::BatchNormalization || bn.input(0) != conv.outputs.first().map(String::as_str) {
            return None;
        }
        let weight_name = conv.input(1)?;
        let weight = Self::float_initializer(graph, Some(weight_name))?;
        let out_channels = *weight.shape().first()?;
        let bias: Vec<f32> = match conv.input(2) {
            Some(name) => Self::float_initializer(graph, Some(name))?.iter().copied().collect(),
            None => vec![0.0; out_channels],
        };
        let [scale, shift, mean, var] = Self::bn_params(graph, bn)?;
        if weight.ndim() != 4 || bias.len() != out_channels || scale.len() != out_channels {
            return None;
        }
        let epsilon = bn.attr_float("epsilon").unwrap_or(1e-5);
        let (factors, shifts) = batch_norm_affine(scale, shift, mean, var, epsilon);

        let per_out = weight.len() / out_channels;
        let fused_weight: Vec<f32> = weight
            .iter()
            .enumerate()
            .map(|(i, &w)| w * factors[i / per_out])
            .collect();
        let fused_bias: Vec<f32> = bias
            .iter()
            .zip(factors.iter().zip(&shifts))
            .map(|(&b, (&f, &s))| b * f + s)
            .collect();

        let prefix = weight_name.strip_suffix(".weight").unwrap_or(weight_name);
        let weight_out = graph.unique_name(&format!("{}.fused_weight", prefix));
        let bias_out = graph.unique_name(&format!("{}.fused_bias", prefix));
        let mut node = conv.clone();
        node.inputs = vec![conv.inputs[0].clone(), weight_out.clone(), bias_out.clone()];
        node.outputs = bn.outputs.clone();

        Some(Rewrite {
            producer,
            consumer,
            node,
            initializers: vec![
                (weight_out, TensorData::from_f32(weight.shape(), fused_weight).ok()?),
                (bias_out, TensorData::f32_vec(&fused_bias)),
            ],
        })
    }

    fn bn_affine(&self, graph: &Graph, producer: usize) -> Option<Rewrite> {
        let bn = graph.node(producer)?;
        if bn.op != OpKind::BatchNormalization {
            return None;
        }
        let consumer = Self::sole_consumer(graph, bn)?;
        let op = graph.node(consumer)?;
        let bn_out = bn.outputs.first()?.as_str();
        let constant = match (op.op, op.input(0)?, op.input(1)?) {
            (OpKind::Mul | OpKind::Add | OpKind::Sub, x, c) if x == bn_out => c,
            (OpKind::Mul | OpKind::Add, c, x) if x == bn_out => c,
            _ => return None,
        };
        let constant = Self::float_initializer(graph, Some(constant))?;
        let [scale, shift, ..] = Self::bn_params(graph, bn)?;
        let channels = scale.len();
        let rank = graph.tensor_shape(bn_out)?.len();
        if rank < 2 || constant.ndim() > rank {
            return None;
        }

        // Constant must be a scalar or vary along the channel axis only
        let mut aligned = vec![1usize; rank - constant.ndim()];
        aligned.extend_from_slice(constant.shape());
        let per_channel = aligned.iter().enumerate().all(|(axis, &d)| d == 1 || (axis == 1 && d == channels));
        if !per_channel {
            return None;
        }
        let values: Vec<f32> = if constant.len() == channels {
            constant.iter().copied().collect()
        } else {
            vec![*constant.iter().next()?; channels]
        };

        let (new_scale, new_shift): (Vec<f32>, Vec<f32>) = match op.op {
            OpKind::Mul => (
                scale.iter().zip(&values).map(|(&s, &c)| s * c).collect(),
                shift.iter().zip(&values).map(|(&b, &c)| b * c).collect(),
            ),
            OpKind::Add => (
                scale.iter().copied().collect(),
                shift.iter().zip(&values).map(|(&b, &c)| b + c).collect(),
            ),
            _ => (
                scale.iter().copied().collect(),
                shift.iter().zip(&values).map(|(&b, &c)| b - c).collect(),
            ),
        };

        let scale_out = graph.unique_name(&format!("{}.fused_scale", bn.name));
        let shift_out = graph.unique_name(&format!("{}.fused_bias", bn.name));
        let mut node = bn.clone();
        node.inputs = vec![
            bn.inputs[0].clone(),
            scale_out.clone(),
            shift_out.clone(),
            bn.inputs[3].clone(),
            bn.inputs[4].clone(),
        ];
        node.outputs = op.outputs.clone();

        Some(Rewrite {
            producer,
            consumer,
            node,
            initializers: vec![
                (scale_out, TensorData::f32_vec(&new_scale)),
                (shift_out, TensorData::f32_vec(&new_shift)),
            ],
        })
    }

    /// Random input for the producer's data operand
    fn probe_input(graph: &Graph, producer: &Node, rng: &mut StdRng) -> Option<TensorData> {
        let channels = match producer.op {
            OpKind::Conv => {
                let w = Self::float_initializer(graph, producer.input(1))?;
                let groups = producer.attr_int_or("group", 1).max(1) as usize;
                w.shape()[1] * groups
            }
            _ => Self::float_initializer(graph, producer.input(1))?.len(),
        };
        let spatial = match producer.op {
            OpKind::Conv => {
                let w = Self::float_initializer(graph, producer.input(1))?;
                let kernel = w.shape()[2].max(w.shape()[3]);
                let dilation = producer.attr_ints("dilations").and_then(|d| d.iter().copied().max()).unwrap_or(1);
                (kernel - 1) * dilation.max(1) as usize + 3
            }
            _ => 3,
        };
        let rank = graph.tensor_shape(producer.input(0)?).map_or(4, Vec::len).max(2);
        let mut dims = vec![1, channels];
        dims.resize(rank, spatial);
        let len: usize = dims.iter().product();
        let values = (0..len).map(|_| rng.gen_range(-2.0f32..2.0)).collect();
        Some(TensorData::Float(ArrayD::from_shape_vec(IxDyn(&dims), values).ok()?))
    }

    /// Evaluate a node chain on the probe, resolving constants from
    /// `extra` first and then from the graph
    fn run_chain(graph: &Graph, extra: &FxHashMap<String, TensorData>, chain: &[&Node], probe: (&str, &TensorData)) -> Option<TensorData> {
        let mut values: FxHashMap<String, TensorData> = FxHashMap::default();
        values.insert(probe.0.to_string(), probe.1.clone());
        let mut last = None;
        for node in chain {
            let inputs: Vec<Option<&TensorData>> = node
                .inputs
                .iter()
                .map(|name| {
                    if name.is_empty() {
                        return Some(None);
                    }
                    values
                        .get(name)
                        .or_else(|| extra.get(name))
                        .or_else(|| graph.initializer(name))
                        .map(Some)
                })
                .collect::<Option<_>>()?;
            let mut outputs = eval_node(node, &inputs).ok()?;
            if outputs.len() != 1 {
                return None;
            }
            let output = outputs.pop()?;
            values.insert(node.outputs[0].clone(), output.clone());
            last = Some(output);
        }
        last
    }

    fn agrees(&self, graph: &Graph, rewrite: &Rewrite, rng: &mut StdRng) -> bool {
        let (Some(producer), Some(consumer)) = (graph.node(rewrite.producer), graph.node(rewrite.consumer)) else {
            return false;
        };
        let Some(data_input) = producer.input(0) else {
            return false;
        };
        let Some(probe) = Self::probe_input(graph, producer, rng) else {
            return false;
        };
        let extra: FxHashMap<String, TensorData> = rewrite.initializers.iter().cloned().collect();
        let before = Self::run_chain(graph, &extra, &[producer, consumer], (data_input, &probe));
        let after = Self::run_chain(graph, &extra, &[&rewrite.node], (data_input, &probe));
        match (before, after) {
            (Some(TensorData::Float(a)), Some(TensorData::Float(b))) if a.shape() == b.shape() => a
                .iter()
                .zip(b.iter())
                .all(|(&x, &y)| (x - y).abs() <= self.tolerance * (1.0 + x.abs())),
            _ => false,
        }
    }
}

impl Default for OperatorFusion {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationPass for OperatorFusion {
    fn name(&self) -> &str {
        "OperatorFusion"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        let mut rng = StdRng::seed_from_u64(PROBE_SEED);
        let mut touched: FxHashSet<usize> = FxHashSet::default();
        let mut absorbed: FxHashSet<usize> = FxHashSet::default();

        for producer in 0..graph.node_count() {
            if touched.contains(&producer) {
                continue;
            }
            let Some(rewrite) = self
                .conv_bn(graph, producer)
                .or_else(|| self.bn_affine(graph, producer))
            else {
                continue;
            };
            if touched.contains(&rewrite.consumer) {
                continue;
            }
            if !self.agrees(graph, &rewrite, &mut rng) {
                debug!(
                    "Skipping fusion at {}: probe mismatch",
                    graph.nodes()[rewrite.producer].name
                );
                continue;
            }
            debug!(
                "Fused {} into {}",
                graph.nodes()[rewrite.consumer].name,
                graph.nodes()[rewrite.producer].name
            );
            for (name, data) in rewrite.initializers {
                graph.set_initializer(&name, data);
            }
            // The absorbed node goes first so its outputs can move to the producer
            absorbed.insert(rewrite.consumer);
            touched.insert(rewrite.producer);
            touched.insert(rewrite.consumer);
            let mut consumer = graph.nodes()[rewrite.consumer].clone();
            consumer.outputs.clear();
            graph.replace_node(rewrite.consumer, consumer);
            graph.replace_node(rewrite.producer, rewrite.node);
        }

        if absorbed.is_empty() {
            return Ok(false);
        }
        graph.remove_nodes(&absorbed);
        Ok(true)
    }
}
