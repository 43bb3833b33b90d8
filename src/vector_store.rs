//! ID-mapped flat vector index with exact inner-product or L2 search.
//!
//! Vectors are stored row-major in one contiguous buffer with a parallel
//! id list. For the `ip` metric vectors are L2-normalized at add and at
//! query time, making inner-product scores cosine-equivalent. Scores are
//! higher-is-better for both metrics; L2 scores are negated squared
//! distances.
//!
//! The on-disk artifact is little-endian: a magic tag, format version,
//! metric, dimension, count, the id list, then the vector rows. Saves are
//! atomic (temp file + rename).

use std::fs;
use std::path::Path;

use thiserror::Error;

const MAGIC: &[u8; 4] = b"LVEC";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("vector store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt vector index: {0}")]
    Corrupt(String),
    #[error("vector index dimension mismatch: stored {stored}, configured {configured}")]
    DimensionMismatch { stored: usize, configured: usize },
    #[error("ids and vectors must match: {ids} ids, {vectors} vectors")]
    CountMismatch { ids: usize, vectors: usize },
    #[error("duplicate id in batch: {0}")]
    DuplicateId(i64),
    #[error("vector has dimension {got}, index expects {expected}")]
    WrongDimension { got: usize, expected: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    InnerProduct,
    L2,
}

impl Metric {
    pub fn parse(s: &str) -> Option<Metric> {
        match s {
            "ip" => Some(Metric::InnerProduct),
            "l2" => Some(Metric::L2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::InnerProduct => "ip",
            Metric::L2 => "l2",
        }
    }

    fn code(&self) -> u32 {
        match self {
            Metric::InnerProduct => 0,
            Metric::L2 => 1,
        }
    }

    fn from_code(code: u32) -> Option<Metric> {
        match code {
            0 => Some(Metric::InnerProduct),
            1 => Some(Metric::L2),
            _ => None,
        }
    }
}

pub struct VectorStore {
    dimension: usize,
    metric: Metric,
    ids: Vec<i64>,
    vectors: Vec<f32>,
}

impl VectorStore {
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            dimension,
            metric,
            ids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    pub fn ntotal(&self) -> usize {
        self.ids.len()
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Upsert: existing ids are removed first, then the batch is appended,
    /// so no id appears twice afterwards.
    pub fn add_or_replace(
        &mut self,
        ids: &[i64],
        vectors: &[Vec<f32>],
    ) -> Result<(), VectorStoreError> {
        if ids.len() != vectors.len() {
            return Err(VectorStoreError::CountMismatch {
                ids: ids.len(),
                vectors: vectors.len(),
            });
        }
        for (pos, id) in ids.iter().enumerate() {
            if ids[..pos].contains(id) {
                return Err(VectorStoreError::DuplicateId(*id));
            }
        }
        for vector in vectors {
            if vector.len() != self.dimension {
                return Err(VectorStoreError::WrongDimension {
                    got: vector.len(),
                    expected: self.dimension,
                });
            }
        }

        self.remove(ids);
        for (id, vector) in ids.iter().zip(vectors) {
            self.ids.push(*id);
            let start = self.vectors.len();
            self.vectors.extend_from_slice(vector);
            if self.metric == Metric::InnerProduct {
                normalize_in_place(&mut self.vectors[start..start + self.dimension]);
            }
        }
        Ok(())
    }

    /// Drop the given ids, keeping row order of the rest. Returns how many
    /// were present.
    pub fn remove(&mut self, ids: &[i64]) -> usize {
        if ids.is_empty() || self.ids.is_empty() {
            return 0;
        }
        let dim = self.dimension;
        let mut removed = 0usize;
        let mut kept_ids = Vec::with_capacity(self.ids.len());
        let mut kept_vectors = Vec::with_capacity(self.vectors.len());
        for (row, id) in self.ids.iter().enumerate() {
            if ids.contains(id) {
                removed += 1;
            } else {
                kept_ids.push(*id);
                kept_vectors.extend_from_slice(&self.vectors[row * dim..(row + 1) * dim]);
            }
        }
        self.ids = kept_ids;
        self.vectors = kept_vectors;
        removed
    }

    /// Best-first (vector_id, score) pairs, at most `min(top_k, ntotal)`.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(i64, f32)>, VectorStoreError> {
        if query.len() != self.dimension {
            return Err(VectorStoreError::WrongDimension {
                got: query.len(),
                expected: self.dimension,
            });
        }
        if self.ids.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let mut normalized;
        let query = if self.metric == Metric::InnerProduct {
            normalized = query.to_vec();
            normalize_in_place(&mut normalized);
            normalized.as_slice()
        } else {
            query
        };

        let dim = self.dimension;
        let mut scored: Vec<(i64, f32)> = self
            .ids
            .iter()
            .enumerate()
            .map(|(row, &id)| {
                let vector = &self.vectors[row * dim..(row + 1) * dim];
                let score = match self.metric {
                    Metric::InnerProduct => dot(query, vector),
                    Metric::L2 => -squared_distance(query, vector),
                };
                (id, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Atomic save: write to a temp path next to the target, then rename.
    pub fn save(&self, path: &Path) -> Result<(), VectorStoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut buf = Vec::with_capacity(
            MAGIC.len() + 4 + 4 + 8 + 8 + self.ids.len() * 8 + self.vectors.len() * 4,
        );
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.metric.code().to_le_bytes());
        buf.extend_from_slice(&(self.dimension as u64).to_le_bytes());
        buf.extend_from_slice(&(self.ids.len() as u64).to_le_bytes());
        for id in &self.ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        for value in &self.vectors {
            buf.extend_from_slice(&value.to_le_bytes());
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load an artifact, failing when its dimension differs from the
    /// configured one.
    pub fn load(path: &Path, configured_dimension: usize) -> Result<Self, VectorStoreError> {
        let raw = fs::read(path)?;
        let mut cursor = Cursor::new(&raw);

        if cursor.take(MAGIC.len())? != MAGIC.as_slice() {
            return Err(VectorStoreError::Corrupt("bad magic".to_string()));
        }
        let version = cursor.u32()?;
        if version != FORMAT_VERSION {
            return Err(VectorStoreError::Corrupt(format!(
                "unsupported format version {version}"
            )));
        }
        let metric = Metric::from_code(cursor.u32()?)
            .ok_or_else(|| VectorStoreError::Corrupt("unknown metric".to_string()))?;
        let dimension = cursor.u64()? as usize;
        let count = cursor.u64()? as usize;
        if dimension != configured_dimension {
            return Err(VectorStoreError::DimensionMismatch {
                stored: dimension,
                configured: configured_dimension,
            });
        }

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(cursor.i64()?);
        }
        let mut vectors = Vec::with_capacity(count * dimension);
        for _ in 0..count * dimension {
            vectors.push(cursor.f32()?);
        }

        Ok(Self {
            dimension,
            metric,
            ids,
            vectors,
        })
    }

    /// Load the artifact when it exists, otherwise start empty.
    pub fn load_or_new(
        path: &Path,
        dimension: usize,
        metric: Metric,
    ) -> Result<Self, VectorStoreError> {
        if path.exists() {
            Self::load(path, dimension)
        } else {
            Ok(Self::new(dimension, metric))
        }
    }
}

fn normalize_in_place(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

struct Cursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self { raw, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], VectorStoreError> {
        if self.pos + n > self.raw.len() {
            return Err(VectorStoreError::Corrupt("truncated file".to_string()));
        }
        let slice = &self.raw[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, VectorStoreError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, VectorStoreError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i64(&mut self) -> Result<i64, VectorStoreError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn f32(&mut self) -> Result<f32, VectorStoreError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
