//! Embedding clusterer: groups near-duplicate questions within a verse.
//!
//! # Algorithm
//!
//! 1. [`bucketize`] groups [`QaRecord`]s by `(chapter, verse)`. Buckets are
//!    ordered by chapter then verse; records inside a bucket are ordered
//!    by [`PrecedenceOrder`].
//! 2. Each bucket's normalized question texts are embedded by an injected
//!    function. Buckets of one record are never embedded.
//! 3. [`cluster_bucket`] adds an edge between every pair whose cosine
//!    similarity is `>= threshold` and returns the connected components
//!    ([`UnionFind`]). Connectivity, not mutual similarity, defines a
//!    cluster: `a~b` and `b~c` put `a`, `b`, `c` together.
//! 4. [`assemble`] turns components into [`ClusterRecord`]s. Members keep
//!    bucket (precedence) order, so the representative is simply the
//!    first member. Clusters are ordered by their representative and get
//!    ids from a [`ClusterIdAllocator`] in bucket order.
//!
//! A bucket whose embeddings are unavailable or malformed passes through
//! as singleton clusters marked `unclustered`.
//!
//! Comparisons are bounded to `O(k²)` per bucket of size `k`.

use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::embedding::cosine_similarity;
use crate::error::{CanonError, Rejection};
use crate::ids::{ClusterIdAllocator, PrecedenceOrder};
use crate::models::{ClusterRecord, QaRecord};
use crate::normalize::normalize;

/// Disjoint-set forest with path compression and union by rank.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Returns `true` if `x` and `y` were in different sets.
    pub fn union(&mut self, x: usize, y: usize) -> bool {
        let root_x = self.find(x);
        let root_y = self.find(y);
        if root_x == root_y {
            return false;
        }
        match self.rank[root_x].cmp(&self.rank[root_y]) {
            std::cmp::Ordering::Less => self.parent[root_x] = root_y,
            std::cmp::Ordering::Greater => self.parent[root_y] = root_x,
            std::cmp::Ordering::Equal => {
                self.parent[root_y] = root_x;
                self.rank[root_x] += 1;
            }
        }
        true
    }

    /// Components as ascending index lists, ordered by their smallest index.
    pub fn components(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..self.parent.len() {
            let root = self.find(i);
            by_root.entry(root).or_default().push(i);
        }
        let mut components: Vec<Vec<usize>> = by_root.into_values().collect();
        components.sort_by_key(|c| c[0]);
        components
    }
}

/// All questions attached to one verse, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub chapter: u32,
    pub verse: u32,
    pub verse_id: String,
    pub records: Vec<QaRecord>,
}

impl Bucket {
    /// Normalized question texts, index-aligned with `records`.
    pub fn texts(&self) -> Vec<String> {
        self.records.iter().map(|r| normalize(&r.question)).collect()
    }

    pub fn needs_embedding(&self) -> bool {
        self.records.len() > 1
    }

    pub fn sources(&self) -> BTreeSet<String> {
        self.records.iter().map(|r| r.source.clone()).collect()
    }
}

/// Embedding result for one bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketEmbeddings {
    /// One vector per record, index-aligned with [`Bucket::records`].
    /// Empty for buckets that did not need embedding.
    Vectors(Vec<Vec<f32>>),
    /// The embedding dependency failed after all retries.
    Unavailable,
}

#[derive(Debug, Default)]
pub struct ClusterOutcome {
    /// Q&A records in bucket order, precedence order within a bucket.
    pub records: Vec<QaRecord>,
    pub clusters: Vec<ClusterRecord>,
    pub rejections: Vec<Rejection>,
}

pub fn bucketize(records: Vec<QaRecord>, order: &PrecedenceOrder) -> Vec<Bucket> {
    let mut groups: BTreeMap<(u32, u32), Vec<QaRecord>> = BTreeMap::new();
    for record in records {
        groups.entry((record.chapter, record.verse)).or_default().push(record);
    }
    groups
        .into_iter()
        .map(|((chapter, verse), mut records)| {
            records.sort_by_cached_key(|r| order.record_key(r));
            Bucket {
                chapter,
                verse,
                verse_id: crate::ids::verse_id(chapter, verse),
                records,
            }
        })
        .collect()
}

/// Whether `vectors` can be compared pairwise for `bucket`.
fn usable(bucket: &Bucket, vectors: &[Vec<f32>]) -> bool {
    vectors.len() == bucket.records.len()
        && vectors
            .first()
            .map(|v| !v.is_empty() && vectors.iter().all(|w| w.len() == v.len()))
            .unwrap_or(false)
}

fn singletons(n: usize) -> Vec<Vec<usize>> {
    (0..n).map(|i| vec![i]).collect()
}

/// Connected components of the `>= threshold` similarity graph.
///
/// Indices refer to `bucket.records`. Returns singletons when the bucket
/// has one record or the embeddings are unavailable or malformed.
pub fn cluster_bucket(bucket: &Bucket, embeddings: &BucketEmbeddings, threshold: f32) -> Vec<Vec<usize>> {
    let n = bucket.records.len();
    let vectors = match embeddings {
        BucketEmbeddings::Vectors(v) if n > 1 && usable(bucket, v) => v,
        _ => return singletons(n),
    };

    let mut uf = UnionFind::new(n);
    for i in 0..n {
        for j in (i + 1)..n {
            if cosine_similarity(&vectors[i], &vectors[j]) >= threshold {
                uf.union(i, j);
            }
        }
    }
    uf.components()
}

/// Whether a bucket's clusters should carry the `unclustered` marker.
pub fn is_unclustered(bucket: &Bucket, embeddings: &BucketEmbeddings) -> bool {
    if !bucket.needs_embedding() {
        return false;
    }
    match embeddings {
        BucketEmbeddings::Vectors(v) => !usable(bucket, v),
        BucketEmbeddings::Unavailable => true,
    }
}

pub fn assemble(
    bucket: &Bucket,
    components: &[Vec<usize>],
    unclustered: bool,
    ids: &mut ClusterIdAllocator,
) -> Vec<ClusterRecord> {
    components
        .iter()
        .filter(|c| !c.is_empty())
        .map(|component| {
            let mut members: Vec<usize> = component.clone();
            members.sort_unstable();
            let representative = &bucket.records[members[0]];
            ClusterRecord {
                cluster_id: ids.next_id(),
                member_qids: members.iter().map(|&i| bucket.records[i].qid.clone()).collect(),
                member_count: members.len(),
                representative_qid: representative.qid.clone(),
                representative_question: representative.question.clone(),
                representative_answer: representative.answer.clone(),
                chapter: bucket.chapter,
                verse_id: bucket.verse_id.clone(),
                sources: members.iter().map(|&i| bucket.records[i].source.clone()).collect(),
                unclustered,
            }
        })
        .collect()
}

/// Rejection entry for a bucket that could not be embedded.
pub fn embedding_rejection(bucket: &Bucket, error: &CanonError) -> Rejection {
    let sources: Vec<String> = bucket.sources().into_iter().collect();
    Rejection::new(error, sources.join(","), format!("verse {}", bucket.verse_id), None)
}

/// Cluster already-embedded buckets, allocating ids in bucket order.
///
/// `embeddings` is index-aligned with `buckets`.
pub fn cluster_embedded(
    buckets: &[Bucket],
    embeddings: &[BucketEmbeddings],
    threshold: f32,
) -> Vec<ClusterRecord> {
    let mut ids = ClusterIdAllocator::new();
    let mut clusters = Vec::new();
    for (bucket, emb) in buckets.iter().zip(embeddings) {
        let components = cluster_bucket(bucket, emb, threshold);
        clusters.extend(assemble(bucket, &components, is_unclustered(bucket, emb), &mut ids));
    }
    clusters
}

/// Cluster `questions` with an injected embedding function.
///
/// `embed_fn` receives one bucket's normalized texts at a time and must
/// return one vector per text. An `Err`, or a wrong number of vectors,
/// marks that bucket unclustered and records an `EmbeddingUnavailable`
/// rejection; other buckets are unaffected.
pub fn cluster<F>(
    questions: Vec<QaRecord>,
    threshold: f32,
    order: &PrecedenceOrder,
    mut embed_fn: F,
) -> ClusterOutcome
where
    F: FnMut(&[String]) -> Result<Vec<Vec<f32>>, CanonError>,
{
    let buckets = bucketize(questions, order);
    let mut rejections = Vec::new();
    let embeddings: Vec<BucketEmbeddings> = buckets
        .iter()
        .map(|bucket| {
            if !bucket.needs_embedding() {
                return BucketEmbeddings::Vectors(Vec::new());
            }
            let result = embed_fn(&bucket.texts()).and_then(|vectors| {
                if usable(bucket, &vectors) {
                    Ok(vectors)
                } else {
                    Err(CanonError::embedding(format!(
                        "expected {} vectors of equal non-zero length, got {}",
                        bucket.records.len(),
                        vectors.len()
                    )))
                }
            });
            match result {
                Ok(vectors) => BucketEmbeddings::Vectors(vectors),
                Err(err) => {
                    warn!(bucket = %bucket.verse_id, "embedding unavailable, passing through unclustered: {}", err);
                    rejections.push(embedding_rejection(bucket, &err));
                    BucketEmbeddings::Unavailable
                }
            }
        })
        .collect();

    let clusters = cluster_embedded(&buckets, &embeddings, threshold);
    ClusterOutcome {
        records: buckets.into_iter().flat_map(|b| b.records).collect(),
        clusters,
        rejections,
    }
}
