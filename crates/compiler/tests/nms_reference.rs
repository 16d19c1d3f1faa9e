//! Embedded NMS against the reference greedy suppression

use detexport_compiler::graph::{fixed_shape, DataType, Graph, TensorData};
use detexport_compiler::runtime::evaluate;
use detexport_compiler::{NmsConfig, NmsEmbedder, ShapeBinder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

const NC: usize = 3;
const ANCHORS: usize = 160;

/// Channel-major head `[1, 4 + nc, A]` with clustered boxes so suppression fires
fn random_head(seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut head = vec![0.0f32; (4 + NC) * ANCHORS];
    let clusters: Vec<(f32, f32)> = (0..8)
        .map(|_| (rng.gen_range(40.0..600.0), rng.gen_range(40.0..600.0)))
        .collect();
    for a in 0..ANCHORS {
        let (cx, cy) = clusters[a % clusters.len()];
        head[a] = cx + rng.gen_range(-12.0..12.0);
        head[ANCHORS + a] = cy + rng.gen_range(-12.0..12.0);
        head[2 * ANCHORS + a] = rng.gen_range(20.0..60.0);
        head[3 * ANCHORS + a] = rng.gen_range(20.0..60.0);
        for c in 0..NC {
            head[(4 + c) * ANCHORS + a] = rng.gen_range(0.0..1.0);
        }
    }
    head
}

/// Overlap ratio of two xyxy boxes
fn box_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    let union = (a[2] - a[0]) * (a[3] - a[1]) + (b[2] - b[0]) * (b[3] - b[1]) - inter;
    inter / union
}

/// Plain greedy suppression: highest score first, drop anything overlapping
/// a kept box by more than `iou_threshold`
fn greedy(boxes: &[[f32; 4]], scores: &[f32], iou_threshold: f32, score_threshold: f32) -> Vec<usize> {
    let mut remaining: Vec<usize> = (0..boxes.len()).filter(|&i| scores[i] > score_threshold).collect();
    remaining.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap().then(a.cmp(&b)));
    let mut kept = Vec::new();
    while !remaining.is_empty() {
        let top = remaining.remove(0);
        kept.push(top);
        remaining.retain(|&i| box_iou(&boxes[top], &boxes[i]) <= iou_threshold);
    }
    kept
}

#[derive(Debug)]
struct Detections {
    boxes: Vec<[f32; 4]>,
    scores: Vec<f32>,
    classes: Vec<i64>,
}

/// Best class per anchor, greedy NMS per class, merged by descending score
fn reference(head: &[f32], config: &NmsConfig) -> Detections {
    let mut boxes = Vec::with_capacity(ANCHORS);
    let mut best = Vec::with_capacity(ANCHORS);
    for a in 0..ANCHORS {
        let (cx, cy, w, h) = (head[a], head[ANCHORS + a], head[2 * ANCHORS + a], head[3 * ANCHORS + a]);
        boxes.push([cx - w * 0.5, cy - h * 0.5, cx + w * 0.5, cy + h * 0.5]);
        let (class, score) = (0..NC)
            .map(|c| (c, head[(4 + c) * ANCHORS + a]))
            .fold((0, f32::MIN), |acc, x| if x.1 > acc.1 { x } else { acc });
        best.push((class, score));
    }

    let mut kept: Vec<usize> = Vec::new();
    for class in 0..NC {
        let members: Vec<usize> = (0..ANCHORS).filter(|&a| best[a].0 == class).collect();
        let class_boxes: Vec<[f32; 4]> = members.iter().map(|&a| boxes[a]).collect();
        let class_scores: Vec<f32> = members.iter().map(|&a| best[a].1).collect();
        let selected = greedy(&class_boxes, &class_scores, config.iou_threshold, config.score_threshold);
        kept.extend(selected.into_iter().map(|i| members[i]));
    }
    kept.sort_by(|&a, &b| best[b].1.partial_cmp(&best[a].1).unwrap().then(a.cmp(&b)));
    kept.truncate(config.max_detections);

    Detections {
        boxes: kept.iter().map(|&a| boxes[a]).collect(),
        scores: kept.iter().map(|&a| best[a].1).collect(),
        classes: kept.iter().map(|&a| best[a].0 as i64).collect(),
    }
}

fn run_embedded(head: Vec<f32>, config: &NmsConfig) -> Detections {
    run_embedded_with(head, ANCHORS, config)
}

fn run_embedded_with(head: Vec<f32>, anchors: usize, config: &NmsConfig) -> Detections {
    let mut graph = Graph::new("head");
    graph
        .add_input("output0", DataType::Float, fixed_shape(&[1, 4 + NC as i64, anchors as i64]))
        .unwrap();
    graph.add_output("output0").unwrap();
    let graph = NmsEmbedder::new(NC, config.clone())
        .embed(graph, &ShapeBinder::new(false))
        .unwrap();

    let mut feeds = BTreeMap::new();
    feeds.insert(
        "output0".to_string(),
        TensorData::from_f32(&[1, 4 + NC, anchors], head).unwrap(),
    );
    let out = evaluate(&graph, &feeds).unwrap();
    let flat = out["boxes"].to_f32_vec().unwrap();
    Detections {
        boxes: flat.chunks_exact(4).map(|c| [c[0], c[1], c[2], c[3]]).collect(),
        scores: out["scores"].to_f32_vec().unwrap(),
        classes: out["classes"].to_i64_vec().unwrap(),
    }
}

fn check_against_reference(iou_threshold: f32, max_detections: usize, seed: u64) {
    let config = NmsConfig {
        iou_threshold,
        score_threshold: 0.25,
        max_detections,
    };
    let head = random_head(seed);
    let expected = reference(&head, &config);
    let actual = run_embedded(head, &config);

    assert_eq!(actual.classes.len(), max_detections);
    assert_eq!(actual.scores.len(), max_detections);
    assert_eq!(actual.boxes.len(), max_detections);

    let n = expected.classes.len();
    assert!(n > 0, "no detections survived at iou {}", iou_threshold);
    assert_eq!(&actual.classes[..n], expected.classes.as_slice(), "iou {}", iou_threshold);
    assert_eq!(&actual.scores[..n], expected.scores.as_slice());
    for (got, want) in actual.boxes[..n].iter().zip(&expected.boxes) {
        for (g, w) in got.iter().zip(want) {
            assert!((g - w).abs() < 1e-3, "{:?} vs {:?}", got, want);
        }
    }

    // padding rows
    assert!(actual.classes[n..].iter().all(|&c| c == -1));
    assert!(actual.scores[n..].iter().all(|&s| s == 0.0));
    assert!(actual.boxes[n..].iter().all(|b| *b == [0.0; 4]));
}

#[test]
fn test_matches_reference_at_iou_0_3() {
    check_against_reference(0.3, 300, 3);
}

#[test]
fn test_matches_reference_at_iou_0_5() {
    check_against_reference(0.5, 300, 5);
}

#[test]
fn test_matches_reference_at_iou_0_7() {
    check_against_reference(0.7, 300, 7);
}

#[test]
fn test_truncates_to_max_detections() {
    let config = NmsConfig {
        iou_threshold: 0.7,
        score_threshold: 0.25,
        max_detections: 5,
    };
    let head = random_head(11);
    let expected = reference(&head, &config);
    assert_eq!(expected.classes.len(), 5);
    let actual = run_embedded(head, &config);
    assert_eq!(actual.classes, expected.classes);
    assert_eq!(actual.scores, expected.scores);
}

#[test]
fn test_lower_iou_threshold_keeps_fewer_boxes() {
    let head = random_head(13);
    let kept = |iou_threshold| {
        let config = NmsConfig {
            iou_threshold,
            score_threshold: 0.25,
            max_detections: 300,
        };
        reference(&head, &config).classes.len()
    };
    assert!(kept(0.3) <= kept(0.5));
    assert!(kept(0.5) <= kept(0.7));
}

/// Four class-0 boxes of size 10 around a top box at (5, 5). Their IoU with
/// the top box is 0.818 (b), 0.667 (c) and 0.429 (d); among themselves at
/// most 0.538 (b, c), 0.370 (b, d) and 0.316 (c, d).
fn overlap_fixture() -> (Vec<f32>, Vec<[f32; 4]>) {
    let centers = [(5.0, 5.0), (6.0, 5.0), (3.0, 5.0), (5.0, 9.0)];
    let scores = [0.9, 0.8, 0.7, 0.6];
    let n = centers.len();
    let mut head = vec![0.0f32; (4 + NC) * n];
    for (a, &(cx, cy)) in centers.iter().enumerate() {
        head[a] = cx;
        head[n + a] = cy;
        head[2 * n + a] = 10.0;
        head[3 * n + a] = 10.0;
        head[4 * n + a] = scores[a];
        for c in 1..NC {
            head[(4 + c) * n + a] = 0.1;
        }
    }
    let corners = centers
        .iter()
        .map(|&(cx, cy)| [cx - 5.0, cy - 5.0, cx + 5.0, cy + 5.0])
        .collect();
    (head, corners)
}

#[test]
fn test_fixture_overlaps() {
    let (_, boxes) = overlap_fixture();
    let pairs = [((0, 1), 0.818), ((0, 2), 0.667), ((0, 3), 0.429), ((1, 2), 0.538), ((1, 3), 0.370), ((2, 3), 0.316)];
    for ((a, b), want) in pairs {
        let got = box_iou(&boxes[a], &boxes[b]);
        assert!((got - want).abs() < 1e-3, "iou({}, {}) = {}", a, b, got);
    }
}

#[test]
fn test_known_overlaps_keep_expected_boxes() {
    // kept anchors per IoU threshold, in score order
    let cases: [(f32, &[usize]); 3] = [(0.3, &[0]), (0.5, &[0, 3]), (0.7, &[0, 2, 3])];
    for (iou_threshold, kept) in cases {
        let (head, boxes) = overlap_fixture();
        let config = NmsConfig {
            iou_threshold,
            score_threshold: 0.25,
            max_detections: 6,
        };
        let actual = run_embedded_with(head, 4, &config);

        let n = kept.len();
        let expected_scores: Vec<f32> = kept.iter().map(|&a| [0.9, 0.8, 0.7, 0.6][a]).collect();
        assert_eq!(&actual.scores[..n], expected_scores.as_slice(), "iou {}", iou_threshold);
        assert_eq!(&actual.classes[..n], vec![0; n].as_slice());
        for (got, &a) in actual.boxes[..n].iter().zip(kept) {
            for (g, w) in got.iter().zip(&boxes[a]) {
                assert!((g - w).abs() < 1e-4, "iou {}: {:?} vs {:?}", iou_threshold, got, boxes[a]);
            }
        }
        assert!(actual.classes[n..].iter().all(|&c| c == -1), "iou {}: {:?}", iou_threshold, actual);
        assert!(actual.scores[n..].iter().all(|&s| s == 0.0));
    }
}

#[test]
fn test_score_equal_to_threshold_is_dropped() {
    let (mut head, _) = overlap_fixture();
    let n = 4;
    // lower every score so that only the top box clears 0.5, the next sits on it
    for (a, score) in [0.9f32, 0.5, 0.4, 0.3].into_iter().enumerate() {
        head[4 * n + a] = score;
    }
    let config = NmsConfig {
        iou_threshold: 0.9,
        score_threshold: 0.5,
        max_detections: 4,
    };
    let actual = run_embedded_with(head, n, &config);
    assert_eq!(actual.classes, vec![0, -1, -1, -1]);
    assert_eq!(actual.scores[0], 0.9);
}
