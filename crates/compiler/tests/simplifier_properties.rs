//! Simplifier properties over randomly generated graphs

use detexport_compiler::graph::{fixed_shape, AttrValue, DataType, Graph, GraphOptimizer, Node, OpKind, TensorData};
use detexport_compiler::runtime::evaluate;
use detexport_compiler::ShapeBinder;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Float initializers usable as a second operand
const CONSTANTS: [&str; 4] = ["zero", "one", "two", "row"];

/// One generated node: operator selector and two operand selectors
type Step = (u8, usize, usize);

fn build_graph(steps: &[Step], extra_output: usize) -> Graph {
    let mut graph = Graph::new("random");
    graph.add_input("x", DataType::Float, fixed_shape(&[2, 4])).unwrap();
    graph.add_initializer("zero", TensorData::scalar_f32(0.0)).unwrap();
    graph.add_initializer("one", TensorData::scalar_f32(1.0)).unwrap();
    graph.add_initializer("two", TensorData::scalar_f32(2.0)).unwrap();
    graph
        .add_initializer("row", TensorData::f32_vec(&[0.5, -1.0, 2.0, 0.25]))
        .unwrap();
    graph.add_initializer("same_shape", TensorData::i64_vec(&[2, 4])).unwrap();

    // every generated tensor is [2, 4] float
    let mut values = vec!["x".to_string()];
    for (i, &(op, a, b)) in steps.iter().enumerate() {
        let lhs = values[a % values.len()].clone();
        let rhs = if b % 3 == 0 {
            CONSTANTS[(b / 3) % CONSTANTS.len()].to_string()
        } else {
            values[b % values.len()].clone()
        };
        let out = format!("t{}", i);
        let name = format!("n{}", i);
        let node = match op % 9 {
            0 => Node::new(name, OpKind::Add).with_inputs(&[lhs, rhs]),
            1 => Node::new(name, OpKind::Sub).with_inputs(&[lhs, rhs]),
            2 => Node::new(name, OpKind::Mul).with_inputs(&[lhs, rhs]),
            3 => Node::new(name, OpKind::Div).with_inputs(&[lhs.as_str(), "two"]),
            4 => Node::new(name, OpKind::Sigmoid).with_inputs(&[lhs]),
            5 => Node::new(name, OpKind::Identity).with_inputs(&[lhs]),
            6 => Node::new(name, OpKind::Reshape).with_inputs(&[lhs.as_str(), "same_shape"]),
            7 => Node::new(name, OpKind::Transpose)
                .with_inputs(&[lhs])
                .with_attr("perm", AttrValue::Ints(vec![0, 1])),
            _ => {
                // constant subexpression feeding a runtime one
                let folded = format!("t{}_c", i);
                graph
                    .add_node(
                        Node::new(format!("n{}_c", i), OpKind::Add)
                            .with_inputs(&["row", "one"])
                            .with_outputs(&[folded.as_str()]),
                    )
                    .unwrap();
                Node::new(name, OpKind::Mul).with_inputs(&[lhs, folded])
            }
        };
        graph.add_node(node.with_outputs(&[out.as_str()])).unwrap();
        values.push(out);
    }

    let last = values.last().cloned().unwrap();
    graph.add_output(&last).unwrap();
    let extra = &values[extra_output % values.len()];
    if extra != &last && extra != "x" {
        graph.add_output(extra).unwrap();
    }
    ShapeBinder::new(false).propagate(&mut graph).unwrap();
    graph
}

fn run(graph: &Graph, x: &[f32]) -> BTreeMap<String, TensorData> {
    let mut feeds = BTreeMap::new();
    feeds.insert("x".to_string(), TensorData::from_f32(&[2, 4], x.to_vec()).unwrap());
    evaluate(graph, &feeds).unwrap()
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec((any::<u8>(), 0usize..64, 0usize..64), 1..14)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn simplify_never_adds_nodes(steps in steps(), extra in 0usize..16) {
        let mut graph = build_graph(&steps, extra);
        let before = graph.node_count();
        let stats = GraphOptimizer::new().optimize(&mut graph).unwrap();
        prop_assert!(graph.node_count() <= before);
        prop_assert_eq!(stats.original_nodes, before);
        prop_assert!(graph.validate_dag().is_ok());
    }

    #[test]
    fn simplify_is_idempotent(steps in steps(), extra in 0usize..16) {
        let mut once = build_graph(&steps, extra);
        let stats = GraphOptimizer::new().optimize(&mut once).unwrap();
        prop_assert!(stats.converged);

        let mut twice = once.clone();
        let again = GraphOptimizer::new().optimize(&mut twice).unwrap();
        prop_assert_eq!(again.iterations, 1);
        prop_assert_eq!(again.nodes_removed(), 0);
        prop_assert_eq!(&twice, &once);
    }

    #[test]
    fn simplify_preserves_outputs(
        steps in steps(),
        extra in 0usize..16,
        x in prop::collection::vec(-4.0f32..4.0, 8),
    ) {
        let original = build_graph(&steps, extra);
        let mut simplified = original.clone();
        GraphOptimizer::new().optimize(&mut simplified).unwrap();
        prop_assert_eq!(simplified.outputs(), original.outputs());

        let expected = run(&original, &x);
        let actual = run(&simplified, &x);
        for (name, want) in &expected {
            let got = &actual[name];
            prop_assert_eq!(got.shape(), want.shape());
            let (got, want) = (got.to_f32_vec().unwrap(), want.to_f32_vec().unwrap());
            for (g, w) in got.iter().zip(&want) {
                prop_assert!((g - w).abs() <= 1e-5 * (1.0 + w.abs()), "{}: {} vs {}", name, g, w);
            }
        }
    }
}
