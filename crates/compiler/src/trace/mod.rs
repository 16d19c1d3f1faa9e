//! Checkpoint tracing
//!
//! Lowers a [`Checkpoint`]'s layer table into graph IR. Each supported module
//! expands into ONNX opset-17 operators (see [`modules`]); the traced graph
//! has one input `images` `[batch, 3, height, width]` with symbolic axes and
//! one output `output0` `[batch, 4 + nc, anchors]`. Binding the axes is the
//! shape binder's job, so the same traced graph serves static and dynamic
//! exports.

mod modules;

use crate::graph::{AttrValue, DataType, Dim, Graph, Node, OpKind, TensorData};
use crate::model::Checkpoint;
use crate::{ExportError, Result};
use rustc_hash::FxHashSet;
use tracing::{debug, info};

/// Name of the traced graph input
pub const INPUT_NAME: &str = "images";

/// Name of the raw detection head output
pub const OUTPUT_NAME: &str = "output0";

/// Modules the tracer can lower
pub const SUPPORTED_MODULES: &[&str] = &["Conv", "C2f", "SPPF", "Upsample", "nn.Upsample", "Concat", "Detect"];

/// Incremental graph construction with exporter-style naming
///
/// Nodes are named `{scope}/{OpType}` and produce `{name}_output_0`, the
/// layout PyTorch's exporter uses, so artifacts read naturally in viewers.
pub(crate) struct GraphBuilder {
    graph: Graph,
    node_names: FxHashSet<String>,
}

impl GraphBuilder {
    pub(crate) fn new(graph: Graph) -> Self {
        let node_names = graph.nodes().iter().map(|n| n.name.clone()).collect();
        Self { graph, node_names }
    }

    pub(crate) fn finish(self) -> Graph {
        self.graph
    }

    fn node_name(&mut self, scope: &str, op: OpKind) -> String {
        let base = format!("{}/{}", scope, op);
        let mut name = base.clone();
        let mut i = 0;
        while self.node_names.contains(&name) || self.graph.tensor(&format!("{}_output_0", name)).is_some() {
            i += 1;
            name = format!("{}_{}", base, i);
        }
        self.node_names.insert(name.clone());
        name
    }

    /// Append a single-output node and return its output name
    pub(crate) fn op(
        &mut self,
        scope: &str,
        op: OpKind,
        inputs: &[&str],
        attrs: Vec<(&str, AttrValue)>,
    ) -> Result<String> {
        let name = self.node_name(scope, op);
        let output = format!("{}_output_0", name);
        self.push(name, op, inputs, attrs, vec![output.clone()])?;
        Ok(output)
    }

    /// Append a node whose single output has a fixed name
    pub(crate) fn op_into(
        &mut self,
        scope: &str,
        op: OpKind,
        inputs: &[&str],
        attrs: Vec<(&str, AttrValue)>,
        output: &str,
    ) -> Result<String> {
        let name = self.node_name(scope, op);
        self.push(name, op, inputs, attrs, vec![output.to_string()])?;
        Ok(output.to_string())
    }

    /// Append a node with `count` outputs
    pub(crate) fn op_multi(
        &mut self,
        scope: &str,
        op: OpKind,
        inputs: &[&str],
        attrs: Vec<(&str, AttrValue)>,
        count: usize,
    ) -> Result<Vec<String>> {
        let name = self.node_name(scope, op);
        let outputs: Vec<String> = (0..count).map(|i| format!("{}_output_{}", name, i)).collect();
        self.push(name, op, inputs, attrs, outputs.clone())?;
        Ok(outputs)
    }

    fn push(
        &mut self,
        name: String,
        op: OpKind,
        inputs: &[&str],
        attrs: Vec<(&str, AttrValue)>,
        outputs: Vec<String>,
    ) -> Result<()> {
        let mut node = Node::new(name, op).with_inputs(inputs).with_outputs(&outputs);
        for (key, value) in attrs {
            node = node.with_attr(key, value);
        }
        self.graph.add_node(node)
    }

    /// Add a named constant, uniquified if the name is taken
    pub(crate) fn constant(&mut self, name: &str, data: TensorData) -> Result<String> {
        let name = self.graph.unique_name(name);
        self.graph.add_initializer(&name, data)
    }

    pub(crate) fn constant_i64(&mut self, name: &str, values: &[i64]) -> Result<String> {
        self.constant(name, TensorData::i64_vec(values))
    }

    pub(crate) fn constant_f32(&mut self, name: &str, value: f32) -> Result<String> {
        self.constant(name, TensorData::scalar_f32(value))
    }

    /// Register a checkpoint weight under its own name (once)
    pub(crate) fn weight(&mut self, checkpoint: &Checkpoint, name: &str) -> Result<String> {
        if self.graph.is_initializer(name) {
            return Ok(name.to_string());
        }
        let data = checkpoint.weight(name)?.clone();
        self.graph.add_initializer(name, data)
    }
}

/// Output of one traced layer
#[derive(Debug, Clone)]
pub(crate) struct LayerOutput {
    pub tensor: String,
    /// Input pixels per feature cell
    pub stride: i64,
}

/// Converts checkpoints into graph IR
#[derive(Debug, Clone, Default)]
pub struct Tracer {
    verbose: bool,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every traced layer at info level instead of debug
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Trace the checkpoint's forward computation
    pub fn trace(&self, checkpoint: &Checkpoint) -> Result<Graph> {
        let arch = &checkpoint.architecture;
        if arch.nc == 0 {
            return Err(ExportError::InvalidModel("architecture declares no classes".to_string()));
        }
        if arch.layers.is_empty() {
            return Err(ExportError::InvalidModel("architecture has no layers".to_string()));
        }

        let mut graph = Graph::new(arch.name.clone());
        let batch = Dim::Symbolic(graph.symbols.axis("batch"));
        let height = Dim::Symbolic(graph.symbols.axis("height"));
        let width = Dim::Symbolic(graph.symbols.axis("width"));
        graph.add_input(INPUT_NAME, DataType::Float, vec![batch, Dim::Fixed(3), height, width])?;

        let mut builder = GraphBuilder::new(graph);
        let mut layers: Vec<LayerOutput> = Vec::with_capacity(arch.layers.len());
        let mut detect_stride = None;

        for (index, layer) in arch.layers.iter().enumerate() {
            let prefix = format!("model.{}", index);
            if !SUPPORTED_MODULES.contains(&layer.module.as_str()) {
                return Err(ExportError::unsupported(layer.module.as_str(), prefix));
            }
            let sources: Vec<LayerOutput> = if index == 0 {
                vec![LayerOutput {
                    tensor: INPUT_NAME.to_string(),
                    stride: 1,
                }]
            } else {
                layer
                    .from
                    .resolve(index)
                    .ok_or_else(|| ExportError::InvalidModel(format!("{} refers to a later layer", prefix)))?
                    .into_iter()
                    .map(|i| layers[i].clone())
                    .collect()
            };
            if layer.module == "Detect" && index + 1 != arch.layers.len() {
                return Err(ExportError::InvalidModel(format!("{}: Detect must be the last layer", prefix)));
            }

            let ctx = modules::LayerContext {
                checkpoint,
                layer,
                prefix: &prefix,
            };
            let output = match layer.module.as_str() {
                "Conv" => modules::conv_layer(&mut builder, &ctx, &sources)?,
                "C2f" => modules::c2f(&mut builder, &ctx, &sources)?,
                "SPPF" => modules::sppf(&mut builder, &ctx, &sources)?,
                "Upsample" | "nn.Upsample" => modules::upsample(&mut builder, &ctx, &sources)?,
                "Concat" => modules::concat(&mut builder, &ctx, &sources)?,
                "Detect" => {
                    detect_stride = sources.iter().map(|s| s.stride).max();
                    modules::detect(&mut builder, &ctx, &sources)?
                }
                other => return Err(ExportError::unsupported(other, prefix)),
            };
            if self.verbose {
                info!("Traced {} {} (stride {})", prefix, layer.module, output.stride);
            } else {
                debug!("Traced {} {} (stride {})", prefix, layer.module, output.stride);
            }
            layers.push(output);
        }

        let stride = detect_stride
            .ok_or_else(|| ExportError::InvalidModel("architecture has no Detect layer".to_string()))?;

        let mut graph = builder.finish();
        graph.add_output(OUTPUT_NAME)?;
        let names: Vec<String> = (0..arch.nc)
            .map(|i| format!("{}: '{}'", i, arch.class_name(i)))
            .collect();
        graph.metadata.insert("description".to_string(), format!("{} detection model", arch.name));
        graph.metadata.insert("task".to_string(), "detect".to_string());
        graph.metadata.insert("stride".to_string(), stride.to_string());
        graph.metadata.insert("names".to_string(), format!("{{{}}}", names.join(", ")));

        info!(
            "Traced {}: {} layers -> {} nodes, {} initializers",
            arch.name,
            arch.layers.len(),
            graph.node_count(),
            graph.initializers().len()
        );
        Ok(graph)
    }
}
