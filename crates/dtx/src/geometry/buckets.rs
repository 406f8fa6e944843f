//! Splits a geometry's primitives into buckets with a bounded local vertex count.

use hashbrown::HashMap;

/// One bucket under construction, in terms of source vertex ids.
#[derive(Debug, Default)]
pub(crate) struct BucketBuild {
    /// Source vertex id of each local vertex.
    pub vertices: Vec<u32>,
    /// Local primitive indices.
    pub indices: Vec<u32>,
    /// Local edge index pairs.
    pub edges: Vec<u32>,
    local: HashMap<u32, u32>,
}

impl BucketBuild {
    fn contains(&self, v: u32) -> bool {
        self.local.contains_key(&v)
    }

    fn missing(&self, vs: &[u32]) -> usize {
        // Primitives may repeat a vertex (degenerate triangles); count each once.
        let mut n = 0;
        for (i, v) in vs.iter().enumerate() {
            if !self.contains(*v) && !vs[..i].contains(v) {
                n += 1;
            }
        }
        n
    }

    fn local_of(&mut self, v: u32) -> u32 {
        let next = self.vertices.len() as u32;
        *self.local.entry(v).or_insert_with(|| {
            self.vertices.push(v);
            next
        })
    }
}

/// Greedy bucketing.
pub(crate) struct Bucketer {
    max_vertices: usize,
    buckets: Vec<BucketBuild>,
    /// Bucket of each primitive, in input order.
    primitive_bucket: Vec<usize>,
}

impl Bucketer {
    pub fn new(max_vertices: u32) -> Self {
        Self {
            // A triangle needs at least three slots.
            max_vertices: (max_vertices as usize).max(3),
            buckets: vec![BucketBuild::default()],
            primitive_bucket: Vec::new(),
        }
    }

    /// Appends primitives of `arity` indices. A primitive whose vertices do
    /// not all fit in the current bucket opens a new one; vertices already in
    /// an earlier bucket are duplicated into the new one.
    pub fn add_primitives(&mut self, indices: &[u32], arity: usize) {
        for prim in indices.chunks_exact(arity) {
            let current = self.buckets.len() - 1;
            let fits = {
                let bucket = &self.buckets[current];
                bucket.vertices.len() + bucket.missing(prim) <= self.max_vertices
            };

            if !fits {
                self.buckets.push(BucketBuild::default());
            }

            let b = self.buckets.len() - 1;
            let bucket = &mut self.buckets[b];
            for &v in prim {
                let local = bucket.local_of(v);
                bucket.indices.push(local);
            }
            self.primitive_bucket.push(b);
        }
    }

    /// Places an edge in the bucket of the primitive that produced it.
    pub fn add_edge_of_primitive(&mut self, primitive: usize, a: u32, b: u32) {
        let bucket = &mut self.buckets[self.primitive_bucket[primitive]];
        let la = bucket.local_of(a);
        let lb = bucket.local_of(b);
        bucket.edges.extend_from_slice(&[la, lb]);
    }

    /// Places a caller-supplied edge in the first bucket that holds both
    /// vertices, else in the last bucket (growing or opening one as needed).
    pub fn add_edge(&mut self, a: u32, b: u32) {
        let target = self
            .buckets
            .iter()
            .position(|bucket| bucket.contains(a) && bucket.contains(b))
            .unwrap_or_else(|| {
                let last = self.buckets.len() - 1;
                let bucket = &self.buckets[last];
                if bucket.vertices.len() + bucket.missing(&[a, b]) <= self.max_vertices {
                    last
                } else {
                    self.buckets.push(BucketBuild::default());
                    last + 1
                }
            });

        let bucket = &mut self.buckets[target];
        let la = bucket.local_of(a);
        let lb = bucket.local_of(b);
        bucket.edges.extend_from_slice(&[la, lb]);
    }

    pub fn finish(self) -> Vec<BucketBuild> {
        self.buckets
            .into_iter()
            .filter(|b| !b.vertices.is_empty())
            .collect()
    }
}
