//! Single-linkage face clustering over a minimum spanning tree.
//!
//! The MST of the complete embedding graph is built with Prim's algorithm,
//! computing one distance row per step so memory stays linear in the number
//! of faces. Cutting every edge heavier than the distance threshold leaves
//! components that are exactly the single-linkage clusters at that
//! threshold; components smaller than `min_cluster_size` are reported as
//! noise.

use crate::config::{ClusterConfig, DistanceMetric};
use crate::recognizer::l2_normalize;
use crate::types::{ClusterResult, Embedding, FaceRef, MergeNode, MergeTree};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ClusterError {
    #[error("embedding for {face} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        face: FaceRef,
        expected: usize,
        actual: usize,
    },
}

/// One MST edge between point indices.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Edge {
    a: usize,
    b: usize,
    weight: f32,
}

pub struct ClusterEngine {
    config: ClusterConfig,
}

impl ClusterEngine {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Cluster all embeddings. The partition depends only on the set of
    /// embeddings, never on their order.
    pub fn cluster(&self, embeddings: &[Embedding]) -> Result<ClusterResult, ClusterError> {
        if embeddings.is_empty() {
            return Ok(ClusterResult::default());
        }

        // Canonical order: everything below is index-based, ties included.
        let mut order: Vec<usize> = (0..embeddings.len()).collect();
        order.sort_by(|&a, &b| embeddings[a].face.cmp(&embeddings[b].face));
        let faces: Vec<FaceRef> = order.iter().map(|&i| embeddings[i].face.clone()).collect();

        let dim = embeddings[order[0]].values.len();
        for &i in &order {
            let actual = embeddings[i].values.len();
            if actual != dim {
                return Err(ClusterError::DimensionMismatch {
                    face: embeddings[i].face.clone(),
                    expected: dim,
                    actual,
                });
            }
        }

        let points: Vec<Vec<f32>> = order
            .iter()
            .map(|&i| match self.config.metric {
                DistanceMetric::Cosine => l2_normalize(embeddings[i].values.clone()),
                DistanceMetric::Euclidean => embeddings[i].values.clone(),
            })
            .collect();

        let mst = minimum_spanning_tree(&points, self.config.metric);
        let (clusters, noise) = cut(&mst, points.len(), self.config.distance_threshold, self.config.min_cluster_size);

        let debug_tree = self.config.keep_debug_tree.then(|| merge_tree(&mst, &faces));

        let result = ClusterResult {
            clusters: clusters
                .into_iter()
                .map(|members| members.into_iter().map(|i| faces[i].clone()).collect())
                .collect(),
            noise: noise.into_iter().map(|i| faces[i].clone()).collect(),
            debug_tree,
        };

        tracing::info!(
            faces = faces.len(),
            clusters = result.clusters.len(),
            noise = result.noise.len(),
            threshold = self.config.distance_threshold,
            "clustered faces"
        );

        Ok(result)
    }
}

/// Cluster with the cosine metric and no merge tree.
pub fn cluster(
    embeddings: &[Embedding],
    distance_threshold: f32,
    min_cluster_size: usize,
) -> Result<ClusterResult, ClusterError> {
    ClusterEngine::new(ClusterConfig {
        distance_threshold,
        min_cluster_size,
        ..ClusterConfig::default()
    })
    .cluster(embeddings)
}

/// Distance between two points; cosine inputs are already unit-length.
fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            (1.0 - dot).clamp(0.0, 2.0)
        }
        DistanceMetric::Euclidean => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f32>()
            .sqrt(),
    }
}

/// Prim's algorithm over the implicit complete graph, starting at point 0.
///
/// Each step relaxes the remaining vertices against the vertex added last,
/// in parallel, then picks the cheapest remaining vertex; equal weights go
/// to the lowest index. Edges are returned in insertion order.
fn minimum_spanning_tree(points: &[Vec<f32>], metric: DistanceMetric) -> Vec<Edge> {
    let n = points.len();
    let mut in_tree = vec![false; n];
    let mut best = vec![f32::INFINITY; n];
    let mut parent = vec![0usize; n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));

    let mut last = 0;
    in_tree[0] = true;

    for _ in 1..n {
        let from = &points[last];
        best.par_iter_mut()
            .zip(parent.par_iter_mut())
            .zip(in_tree.par_iter())
            .enumerate()
            .for_each(|(v, ((b, p), &done))| {
                if done {
                    return;
                }
                let d = distance(metric, from, &points[v]);
                if d < *b {
                    *b = d;
                    *p = last;
                }
            });

        let mut next: Option<usize> = None;
        for v in (0..n).filter(|&v| !in_tree[v]) {
            match next {
                Some(u) if !(best[v] < best[u]) => {}
                _ => next = Some(v),
            }
        }
        let Some(v) = next else { break };

        in_tree[v] = true;
        edges.push(Edge {
            a: parent[v],
            b: v,
            weight: best[v],
        });
        last = v;
    }

    edges
}

struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merge the sets of `a` and `b`; returns the new root.
    fn union(&mut self, a: usize, b: usize) -> usize {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return ra;
        }
        let (big, small) = if self.size[ra] >= self.size[rb] { (ra, rb) } else { (rb, ra) };
        self.parent[small] = big;
        self.size[big] += self.size[small];
        big
    }
}

/// Cut MST edges heavier than `threshold`. Returns clusters (members
/// ascending, clusters ordered by first member) and noise (ascending).
fn cut(mst: &[Edge], n: usize, threshold: f32, min_cluster_size: usize) -> (Vec<Vec<usize>>, Vec<usize>) {
    let mut uf = UnionFind::new(n);
    for edge in mst.iter().filter(|e| e.weight <= threshold) {
        uf.union(edge.a, edge.b);
    }

    // Visiting points in ascending order keeps members sorted and orders
    // components by their smallest member.
    let mut component_of_root = vec![usize::MAX; n];
    let mut components: Vec<Vec<usize>> = Vec::new();
    for i in 0..n {
        let root = uf.find(i);
        if component_of_root[root] == usize::MAX {
            component_of_root[root] = components.len();
            components.push(Vec::new());
        }
        components[component_of_root[root]].push(i);
    }

    let min_size = min_cluster_size.max(1);
    let mut noise = Vec::new();
    let mut clusters = Vec::new();
    for component in components {
        if component.len() >= min_size {
            clusters.push(component);
        } else {
            noise.extend(component);
        }
    }
    noise.sort_unstable();

    (clusters, noise)
}

/// Replay MST edges by ascending weight into a single-linkage dendrogram.
fn merge_tree(mst: &[Edge], faces: &[FaceRef]) -> MergeTree {
    let n = faces.len();
    let mut edges = mst.to_vec();
    edges.sort_by(|a, b| a.weight.total_cmp(&b.weight));

    let mut uf = UnionFind::new(n);
    let mut node_of_root: Vec<usize> = (0..n).collect();
    let mut nodes = Vec::with_capacity(edges.len());

    for edge in edges {
        let (ra, rb) = (uf.find(edge.a), uf.find(edge.b));
        let (left, right) = (node_of_root[ra], node_of_root[rb]);
        let root = uf.union(ra, rb);
        nodes.push(MergeNode {
            left: left.min(right),
            right: left.max(right),
            distance: edge.weight,
            size: uf.size[root],
        });
        node_of_root[root] = n + nodes.len() - 1;
    }

    MergeTree {
        leaves: faces.to_vec(),
        nodes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileId;

    fn emb(file: &str, index: u32, values: Vec<f32>) -> Embedding {
        Embedding {
            face: FaceRef::new(FileId::new(file), index),
            values,
            model_version: None,
        }
    }

    /// Three well separated groups of sizes 4, 3 and 2.
    fn groups() -> Vec<Embedding> {
        let mut out = Vec::new();
        for i in 0..4 {
            out.push(emb("a.jpg", i, vec![1.0, 0.02 * i as f32, 0.0, 0.0]));
        }
        for i in 0..3 {
            out.push(emb("b.jpg", i, vec![0.0, 1.0, 0.03 * i as f32, 0.0]));
        }
        for i in 0..2 {
            out.push(emb("c.jpg", i, vec![0.0, 0.0, 0.01 * i as f32, 1.0]));
        }
        out
    }

    fn refs(file: &str, range: std::ops::Range<u32>) -> Vec<FaceRef> {
        range.map(|i| FaceRef::new(FileId::new(file), i)).collect()
    }

    #[test]
    fn test_empty_input() {
        let result = cluster(&[], 0.4, 3).unwrap();
        assert!(result.clusters.is_empty());
        assert!(result.noise.is_empty());
    }

    #[test]
    fn test_near_identical_plus_outlier() {
        let mut embeddings: Vec<Embedding> = (0..10)
            .map(|i| emb("same.jpg", i, vec![1.0, 0.001 * i as f32, 0.0]))
            .collect();
        embeddings.push(emb("other.jpg", 0, vec![0.0, 0.0, 1.0]));

        let result = cluster(&embeddings, 0.4, 2).unwrap();
        assert_eq!(result.clusters, vec![refs("same.jpg", 0..10)]);
        assert_eq!(result.noise, refs("other.jpg", 0..1));
    }

    #[test]
    fn test_min_cluster_size_enforced() {
        let result = cluster(&groups(), 0.4, 3).unwrap();
        assert_eq!(result.clusters, vec![refs("a.jpg", 0..4), refs("b.jpg", 0..3)]);
        assert_eq!(result.noise, refs("c.jpg", 0..2));
        for c in &result.clusters {
            assert!(c.len() >= 3);
        }
    }

    #[test]
    fn test_every_face_reported_exactly_once() {
        let embeddings = groups();
        let result = cluster(&embeddings, 0.4, 3).unwrap();
        let mut seen: Vec<FaceRef> = result.clusters.concat();
        seen.extend(result.noise.clone());
        seen.sort();
        let mut expected: Vec<FaceRef> = embeddings.iter().map(|e| e.face.clone()).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_independent_of_input_order() {
        let embeddings = groups();
        let baseline = cluster(&embeddings, 0.4, 2).unwrap();

        let mut reversed = embeddings.clone();
        reversed.reverse();
        assert_eq!(cluster(&reversed, 0.4, 2).unwrap(), baseline);

        let mut rotated = embeddings.clone();
        rotated.rotate_left(4);
        rotated.swap(0, 5);
        assert_eq!(cluster(&rotated, 0.4, 2).unwrap(), baseline);
    }

    #[test]
    fn test_threshold_monotonicity() {
        // a chain with growing gaps: raising the threshold only merges
        let embeddings: Vec<Embedding> = (0..8)
            .map(|i| {
                let angle = (i * i) as f32 * 0.04;
                emb("chain.jpg", i, vec![angle.cos(), angle.sin()])
            })
            .collect();

        let thresholds = [0.0, 0.01, 0.05, 0.1, 0.3, 0.6, 1.0];
        for pair in thresholds.windows(2) {
            let low = cluster(&embeddings, pair[0], 1).unwrap();
            let high = cluster(&embeddings, pair[1], 1).unwrap();
            assert!(high.clusters.len() <= low.clusters.len());
            for c in &low.clusters {
                assert!(
                    high.clusters.iter().any(|h| c.iter().all(|f| h.contains(f))),
                    "cluster {c:?} split when raising threshold to {}",
                    pair[1]
                );
            }
        }
    }

    #[test]
    fn test_single_embedding() {
        let embeddings = vec![emb("one.jpg", 0, vec![1.0, 0.0])];
        assert_eq!(cluster(&embeddings, 0.4, 3).unwrap().noise.len(), 1);
        assert_eq!(cluster(&embeddings, 0.4, 1).unwrap().clusters.len(), 1);
    }

    #[test]
    fn test_dimension_mismatch() {
        let embeddings = vec![emb("a.jpg", 0, vec![1.0, 0.0]), emb("b.jpg", 0, vec![1.0, 0.0, 0.0])];
        let err = cluster(&embeddings, 0.4, 1).unwrap_err();
        assert_eq!(
            err,
            ClusterError::DimensionMismatch {
                face: FaceRef::new(FileId::new("b.jpg"), 0),
                expected: 2,
                actual: 3,
            }
        );
    }

    #[test]
    fn test_cosine_ignores_magnitude() {
        let embeddings = vec![
            emb("a.jpg", 0, vec![1.0, 0.0]),
            emb("a.jpg", 1, vec![10.0, 0.1]),
            emb("a.jpg", 2, vec![0.5, 0.01]),
        ];
        assert_eq!(cluster(&embeddings, 0.1, 3).unwrap().clusters.len(), 1);
    }

    #[test]
    fn test_euclidean_metric() {
        let engine = ClusterEngine::new(ClusterConfig {
            distance_threshold: 0.5,
            min_cluster_size: 2,
            metric: DistanceMetric::Euclidean,
            keep_debug_tree: false,
        });
        let embeddings = vec![
            emb("a.jpg", 0, vec![0.0, 0.0]),
            emb("a.jpg", 1, vec![0.3, 0.0]),
            emb("a.jpg", 2, vec![5.0, 5.0]),
            emb("a.jpg", 3, vec![5.0, 5.4]),
            // same direction as a.jpg#1, far in euclidean terms
            emb("a.jpg", 4, vec![3.0, 0.0]),
        ];
        let result = engine.cluster(&embeddings).unwrap();
        assert_eq!(result.clusters.len(), 2);
        assert_eq!(result.noise, vec![FaceRef::new(FileId::new("a.jpg"), 4)]);
    }

    #[test]
    fn test_debug_tree() {
        let engine = ClusterEngine::new(ClusterConfig {
            keep_debug_tree: true,
            ..ClusterConfig::default()
        });
        let embeddings = groups();
        let result = engine.cluster(&embeddings).unwrap();
        let tree = result.debug_tree.unwrap();

        let n = embeddings.len();
        assert_eq!(tree.leaves.len(), n);
        assert_eq!(tree.nodes.len(), n - 1);
        assert_eq!(tree.nodes.last().map(|m| m.size), Some(n));
        for pair in tree.nodes.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
        for (k, node) in tree.nodes.iter().enumerate() {
            // children always exist before their parent
            assert!(node.left < n + k && node.right < n + k);
        }
    }

    #[test]
    fn test_debug_tree_off_by_default() {
        assert!(cluster(&groups(), 0.4, 3).unwrap().debug_tree.is_none());
    }

    #[test]
    fn test_mst_has_n_minus_one_edges() {
        let points: Vec<Vec<f32>> = (0..6).map(|i| vec![i as f32, (i % 2) as f32]).collect();
        let mst = minimum_spanning_tree(&points, DistanceMetric::Euclidean);
        assert_eq!(mst.len(), 5);
        let total: f32 = mst.iter().map(|e| e.weight).sum();
        // consecutive points are sqrt(2) apart, anything else is farther
        assert!((total - 5.0 * 2f32.sqrt()).abs() < 1e-4);
    }
}
