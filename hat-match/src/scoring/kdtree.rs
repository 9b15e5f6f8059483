//! Static 3-D k-d tree for nearest-neighbour queries
//!
//! Built once over a point cloud (median split, implicit layout in a
//! permutation array) and queried many times from parallel scoring loops.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone)]
pub struct KdTree {
    points: Vec<[f64; 3]>,
    order: Vec<usize>,
}

/// Neighbour found by a query: index into the original point slice and
/// Euclidean distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbour {
    pub index: usize,
    pub distance: f64,
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    dist2: f64,
    index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist2
            .total_cmp(&other.dist2)
            .then(self.index.cmp(&other.index))
    }
}

impl KdTree {
    pub fn build(points: Vec<[f64; 3]>) -> Self {
        let mut order: Vec<usize> = (0..points.len()).collect();
        split(&points, &mut order, 0);
        Self { points, order }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, index: usize) -> [f64; 3] {
        self.points[index]
    }

    pub fn nearest(&self, query: [f64; 3]) -> Option<Neighbour> {
        self.k_nearest(query, 1).into_iter().next()
    }

    /// Up to `k` nearest points, closest first
    pub fn k_nearest(&self, query: [f64; 3], k: usize) -> Vec<Neighbour> {
        if k == 0 || self.points.is_empty() {
            return Vec::new();
        }
        let mut heap = BinaryHeap::with_capacity(k + 1);
        self.search(0, self.order.len(), 0, query, k, &mut heap);
        heap.into_sorted_vec()
            .into_iter()
            .map(|e| Neighbour {
                index: e.index,
                distance: e.dist2.sqrt(),
            })
            .collect()
    }

    fn search(
        &self,
        lo: usize,
        hi: usize,
        depth: usize,
        query: [f64; 3],
        k: usize,
        heap: &mut BinaryHeap<HeapEntry>,
    ) {
        if lo >= hi {
            return;
        }
        let mid = lo + (hi - lo) / 2;
        let index = self.order[mid];
        let p = self.points[index];
        let entry = HeapEntry {
            dist2: squared_distance(p, query),
            index,
        };
        if heap.len() < k {
            heap.push(entry);
        } else if heap.peek().is_some_and(|worst| entry < *worst) {
            heap.pop();
            heap.push(entry);
        }

        let axis = depth % 3;
        let delta = query[axis] - p[axis];
        let (near, far) = if delta < 0.0 {
            ((lo, mid), (mid + 1, hi))
        } else {
            ((mid + 1, hi), (lo, mid))
        };
        self.search(near.0, near.1, depth + 1, query, k, heap);
        let worst = heap.peek().map(|e| e.dist2).unwrap_or(f64::INFINITY);
        if heap.len() < k || delta * delta <= worst {
            self.search(far.0, far.1, depth + 1, query, k, heap);
        }
    }
}

fn split(points: &[[f64; 3]], order: &mut [usize], depth: usize) {
    if order.len() <= 1 {
        return;
    }
    let axis = depth % 3;
    let mid = order.len() / 2;
    order.select_nth_unstable_by(mid, |&a, &b| points[a][axis].total_cmp(&points[b][axis]));
    let (left, right) = order.split_at_mut(mid);
    split(points, left, depth + 1);
    split(points, &mut right[1..], depth + 1);
}

pub fn squared_distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dz = a[0] - b[0];
    let dy = a[1] - b[1];
    let dx = a[2] - b[2];
    dz * dz + dy * dy + dx * dx
}
