//! NMS embedding
//!
//! Appends post-processing to a traced detection graph so the artifact
//! returns final detections instead of raw head predictions:
//!
//! 1. Split `output0` `[1, 4 + nc, A]` into center/size boxes and class
//!    confidences, decode boxes to corners
//! 2. Best class and its confidence per candidate
//! 3. Offset boxes by `class * 7680` so one NonMaxSuppression call performs
//!    per-class greedy suppression; its score threshold keeps only
//!    candidates strictly above the confidence threshold
//! 4. Gather the survivors (descending confidence), pad with sentinels and
//!    slice to exactly `max_det` rows
//!
//! Outputs: `boxes` `[k, 4]` xyxy, `scores` `[k]`, `classes` `[k]` (int64,
//! `-1` marks padding).

use crate::graph::{AttrValue, DataType, Dim, Graph, OpKind, TensorData};
use crate::shape_inference::ShapeBinder;
use crate::trace::GraphBuilder;
use crate::{ExportError, Result};
use tracing::info;

/// Box coordinate offset separating classes in the suppression call
pub const CLASS_OFFSET: f32 = 7680.0;

pub const BOXES_OUTPUT: &str = "boxes";
pub const SCORES_OUTPUT: &str = "scores";
pub const CLASSES_OUTPUT: &str = "classes";

/// Post-processing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct NmsConfig {
    /// Suppress a box when its IoU with a kept box exceeds this
    pub iou_threshold: f32,
    /// Drop candidates whose best class confidence is below this
    pub score_threshold: f32,
    /// Output rows (k)
    pub max_detections: usize,
}

impl Default for NmsConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.7,
            score_threshold: 0.25,
            max_detections: 300,
        }
    }
}

/// Appends NMS post-processing to a detection graph
#[derive(Debug, Clone)]
pub struct NmsEmbedder {
    num_classes: usize,
    config: NmsConfig,
}

impl NmsEmbedder {
    pub fn new(num_classes: usize, config: NmsConfig) -> Self {
        Self { num_classes, config }
    }

    /// Check that the graph ends in a single `[1, 4 + nc, A]` head output
    fn head(&self, graph: &Graph) -> Result<(String, Dim)> {
        let [output] = graph.outputs() else {
            return Err(ExportError::nms(
                graph.outputs().join(", "),
                format!("expected exactly one head output, found {}", graph.outputs().len()),
            ));
        };
        if self.num_classes == 0 {
            return Err(ExportError::nms(output.as_str(), "class count must be positive"));
        }
        let info = graph
            .tensor(output)
            .ok_or_else(|| ExportError::nms(output.as_str(), "head output has no metadata"))?;
        if info.dtype != Some(DataType::Float) {
            return Err(ExportError::nms(output.as_str(), "head output must be float32"));
        }
        let shape = info
            .shape
            .as_ref()
            .map(|s| graph.symbols.resolve_shape(s))
            .ok_or_else(|| ExportError::nms(output.as_str(), "head output shape is unknown"))?;
        if shape.len() != 3 {
            return Err(ExportError::nms(
                output.as_str(),
                format!("expected rank 3, got {}", graph.symbols.render_shape(&shape)),
            ));
        }
        if shape[0] != Dim::Fixed(1) {
            return Err(ExportError::nms(
                output.as_str(),
                format!("batch must be 1, got {}", graph.symbols.render_dim(shape[0])),
            ));
        }
        let expected = 4 + self.num_classes as i64;
        if shape[1] != Dim::Fixed(expected) {
            return Err(ExportError::nms(
                output.as_str(),
                format!(
                    "expected {} channels (4 + {} classes), got {}",
                    expected,
                    self.num_classes,
                    graph.symbols.render_dim(shape[1])
                ),
            ));
        }
        Ok((output.clone(), shape[2]))
    }

    /// Append the NMS subgraph and re-bind shapes
    pub fn embed(&self, graph: Graph, binder: &ShapeBinder) -> Result<Graph> {
        let NmsConfig {
            iou_threshold,
            score_threshold,
            max_detections,
        } = self.config;
        if max_detections == 0 {
            return Err(ExportError::InvalidOptions("max_det must be positive".to_string()));
        }
        let (head, anchors) = self.head(&graph)?;
        let nc = self.num_classes as i64;
        let k = max_detections as i64;

        let mut b = GraphBuilder::new(graph);
        let scope = "/nms";

        let pred = b.op(scope, OpKind::Transpose, &[&head], vec![("perm", AttrValue::Ints(vec![0, 2, 1]))])?;
        let split = b.constant_i64("/nms/split", &[4, nc])?;
        let parts = b.op_multi(scope, OpKind::Split, &[&pred, &split], vec![("axis", AttrValue::Int(2))], 2)?;
        let (xywh, confidences) = (&parts[0], &parts[1]);

        // center/size -> corners
        let pair = b.constant_i64("/nms/pair", &[2, 2])?;
        let halves = b.op_multi(scope, OpKind::Split, &[xywh, &pair], vec![("axis", AttrValue::Int(2))], 2)?;
        let half = b.constant_f32("/nms/half", 0.5)?;
        let half_size = b.op(scope, OpKind::Mul, &[&halves[1], &half], vec![])?;
        let top_left = b.op(scope, OpKind::Sub, &[&halves[0], &half_size], vec![])?;
        let bottom_right = b.op(scope, OpKind::Add, &[&halves[0], &half_size], vec![])?;
        let corners = b.op(
            scope,
            OpKind::Concat,
            &[&top_left, &bottom_right],
            vec![("axis", AttrValue::Int(2))],
        )?;

        let best = b.op(
            scope,
            OpKind::ReduceMax,
            &[confidences],
            vec![("axes", AttrValue::Ints(vec![2])), ("keepdims", AttrValue::Int(0))],
        )?;
        let class = b.op(
            scope,
            OpKind::ArgMax,
            &[confidences],
            vec![("axis", AttrValue::Int(2)), ("keepdims", AttrValue::Int(0))],
        )?;

        // per-class suppression via disjoint coordinate ranges
        let class_f = b.op(scope, OpKind::Cast, &[&class], vec![("to", AttrValue::Int(1))])?;
        let offset_scale = b.constant_f32("/nms/class_offset", CLASS_OFFSET)?;
        let offset = b.op(scope, OpKind::Mul, &[&class_f, &offset_scale], vec![])?;
        let last_axis = b.constant_i64("/nms/last_axis", &[2])?;
        let offset = b.op(scope, OpKind::Unsqueeze, &[&offset, &last_axis], vec![])?;
        let shifted = b.op(scope, OpKind::Add, &[&corners, &offset], vec![])?;
        let class_axis = b.constant_i64("/nms/class_axis", &[1])?;
        let nms_scores = b.op(scope, OpKind::Unsqueeze, &[&best, &class_axis], vec![])?;

        let max_out = b.constant_i64("/nms/max_output_boxes_per_class", &[k])?;
        let iou = b.constant("/nms/iou_threshold", TensorData::f32_vec(&[iou_threshold]))?;
        let conf = b.constant("/nms/score_threshold", TensorData::f32_vec(&[score_threshold]))?;
        let selected = b.op(
            scope,
            OpKind::NonMaxSuppression,
            &[&shifted, &nms_scores, &max_out, &iou, &conf],
            vec![("center_point_box", AttrValue::Int(0))],
        )?;

        // selected rows are (batch, class, box); keep the box index
        let col_start = b.constant_i64("/nms/col_start", &[2])?;
        let col_end = b.constant_i64("/nms/col_end", &[3])?;
        let col_axis = b.constant_i64("/nms/col_axis", &[1])?;
        let column = b.op(scope, OpKind::Slice, &[&selected, &col_start, &col_end, &col_axis], vec![])?;
        let flat = b.constant_i64("/nms/flat", &[-1])?;
        let indices = b.op(scope, OpKind::Reshape, &[&column, &flat], vec![])?;

        let rows = b.constant_i64("/nms/rows", &[-1, 4])?;
        let all_boxes = b.op(scope, OpKind::Reshape, &[&corners, &rows], vec![])?;
        let all_scores = b.op(scope, OpKind::Reshape, &[&best, &flat], vec![])?;
        let all_classes = b.op(scope, OpKind::Reshape, &[&class, &flat], vec![])?;

        let zero = b.constant_i64("/nms/top_start", &[0])?;
        let top = b.constant_i64("/nms/top_end", &[k])?;
        let k_usize = max_detections;
        let outputs = [
            (all_boxes, TensorData::from_f32(&[k_usize, 4], vec![0.0; k_usize * 4])?, BOXES_OUTPUT),
            (all_scores, TensorData::from_f32(&[k_usize], vec![0.0; k_usize])?, SCORES_OUTPUT),
            (all_classes, TensorData::from_i64(&[k_usize], vec![-1; k_usize])?, CLASSES_OUTPUT),
        ];
        for (source, sentinel, name) in outputs {
            let picked = b.op(scope, OpKind::Gather, &[&source, &indices], vec![("axis", AttrValue::Int(0))])?;
            let pad = b.constant(&format!("/nms/{}_pad", name), sentinel)?;
            let padded = b.op(scope, OpKind::Concat, &[&picked, &pad], vec![("axis", AttrValue::Int(0))])?;
            b.op_into(scope, OpKind::Slice, &[&padded, &zero, &top, &zero], vec![], name)?;
        }

        let mut graph = b.finish();
        graph.set_outputs(vec![
            BOXES_OUTPUT.to_string(),
            SCORES_OUTPUT.to_string(),
            CLASSES_OUTPUT.to_string(),
        ])?;
        binder.propagate(&mut graph)?;

        for (name, expected) in [
            (BOXES_OUTPUT, vec![k, 4]),
            (SCORES_OUTPUT, vec![k]),
            (CLASSES_OUTPUT, vec![k]),
        ] {
            if graph.concrete_shape(name) != Some(expected.clone()) {
                return Err(ExportError::nms(
                    name,
                    format!("output did not resolve to {:?}", expected),
                ));
            }
        }

        graph.metadata.insert("nms".to_string(), "true".to_string());
        graph.metadata.insert("iou".to_string(), iou_threshold.to_string());
        graph.metadata.insert("conf".to_string(), score_threshold.to_string());
        graph.metadata.insert("max_det".to_string(), max_detections.to_string());
        info!(
            "Embedded NMS over {} candidates: iou {}, conf {}, k {}",
            graph.symbols.render_dim(anchors),
            iou_threshold,
            score_threshold,
            max_detections
        );
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::fixed_shape;
    use crate::runtime::evaluate;
    use std::collections::BTreeMap;

    fn head_graph(nc: usize, anchors: i64) -> Graph {
        let mut graph = Graph::new("head");
        graph
            .add_input("output0", DataType::Float, fixed_shape(&[1, 4 + nc as i64, anchors]))
            .unwrap();
        graph.add_output("output0").unwrap();
        graph
    }

    fn embedder(k: usize) -> NmsEmbedder {
        NmsEmbedder::new(
            2,
            NmsConfig {
                iou_threshold: 0.5,
                score_threshold: 0.25,
                max_detections: k,
            },
        )
    }

    #[test]
    fn test_output_shapes_are_exactly_k() {
        let graph = embedder(7).embed(head_graph(2, 8), &ShapeBinder::new(false)).unwrap();
        assert_eq!(graph.outputs(), &["boxes", "scores", "classes"]);
        assert_eq!(graph.concrete_shape("boxes"), Some(vec![7, 4]));
        assert_eq!(graph.concrete_shape("scores"), Some(vec![7]));
        assert_eq!(graph.concrete_shape("classes"), Some(vec![7]));
        assert_eq!(graph.tensor("classes").and_then(|t| t.dtype), Some(DataType::Int64));
        assert!(graph.validate_dag().is_ok());
    }

    #[test]
    fn test_suppression_is_per_class_and_padded() {
        let graph = embedder(5).embed(head_graph(2, 4), &ShapeBinder::new(false)).unwrap();
        // channel-major head: cx, cy, w, h, p(class0), p(class1) for 4 anchors
        #[rustfmt::skip]
        let head = vec![
            10.0, 11.0, 10.0, 50.0,  // cx
            10.0, 10.0, 10.0, 50.0,  // cy
            8.0,  8.0,  8.0,  8.0,   // w
            8.0,  8.0,  8.0,  8.0,   // h
            0.9,  0.8,  0.1,  0.1,   // class 0
            0.0,  0.0,  0.7,  0.05,  // class 1
        ];
        let mut feeds = BTreeMap::new();
        feeds.insert("output0".to_string(), TensorData::from_f32(&[1, 6, 4], head).unwrap());
        let out = evaluate(&graph, &feeds).unwrap();

        let scores = out["scores"].to_f32_vec().unwrap();
        let classes = out["classes"].to_i64_vec().unwrap();
        assert_eq!(classes, vec![0, 1, -1, -1, -1]);
        assert!((scores[0] - 0.9).abs() < 1e-6);
        assert!((scores[1] - 0.7).abs() < 1e-6);
        assert_eq!(&scores[2..], &[0.0, 0.0, 0.0]);

        let boxes = out["boxes"].to_f32_vec().unwrap();
        assert_eq!(&boxes[..4], &[6.0, 6.0, 14.0, 14.0]);
        assert_eq!(&boxes[8..], &[0.0; 12]);
    }

    #[test]
    fn test_rejects_unexpected_head_layouts() {
        let err = embedder(5).embed(head_graph(3, 4), &ShapeBinder::new(false)).unwrap_err();
        assert_eq!(err.kind(), "NMSEmbeddingError");

        let mut graph = head_graph(2, 4);
        graph.add_input("extra", DataType::Float, fixed_shape(&[1])).unwrap();
        graph.add_output("extra").unwrap();
        let err = embedder(5).embed(graph, &ShapeBinder::new(false)).unwrap_err();
        assert_eq!(err.kind(), "NMSEmbeddingError");

        let mut graph = Graph::new("batched");
        graph.add_input("output0", DataType::Float, fixed_shape(&[2, 6, 4])).unwrap();
        graph.add_output("output0").unwrap();
        let err = embedder(5).embed(graph, &ShapeBinder::new(false)).unwrap_err();
        assert!(err.to_string().contains("batch must be 1"));
    }
}
