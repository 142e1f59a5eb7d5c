//! HNSW graph over the vectors of active records.

use chrono::{DateTime, Utc};
use hnsw::{Hnsw, Searcher};
use rand::rngs::StdRng;
use space::{Metric, Neighbor};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::instrument;

use crate::embedding::cosine_similarity;
use crate::models::{RankedResult, RecordMetadata, RecordSource, SearchFilters};

/// Lower bound for the HNSW `ef` parameter. Scaled up with the candidate
/// window so the graph returns at least as many neighbors as requested.
const MIN_EF_SEARCH: usize = 50;

/// Factor the candidate window grows by when filters reject too many
/// neighbors.
const WINDOW_GROWTH: usize = 4;

/// `1 - cos`, scaled from `[0, 2]` onto `u32`.
pub(crate) struct CosineDistance;

impl Metric<Box<[f32]>> for CosineDistance {
    type Unit = u32;

    fn distance(&self, a: &Box<[f32]>, b: &Box<[f32]>) -> u32 {
        let a: &[f32] = a;
        let b: &[f32] = b;
        let mag_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let mag_b = b.iter().map(|y| y * y).sum::<f32>().sqrt();
        if mag_a == 0.0 || mag_b == 0.0 {
            return u32::MAX;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let distance = (1.0 - dot / (mag_a * mag_b)).clamp(0.0, 2.0);
        (distance * (u32::MAX as f32 / 2.0)) as u32
    }
}

/// Per-node bookkeeping kept beside the graph. Position in `slots` equals
/// the node index returned by the HNSW insert.
struct Slot {
    id: String,
    source: RecordSource,
    metadata: Arc<RecordMetadata>,
    ingested_at: DateTime<Utc>,
    superseded: bool,
}

/// In-memory ANN structure. Owned by [`VectorIndex`](super::VectorIndex)
/// behind an `RwLock`: searches share the read lock, inserts hold the write
/// lock only while linking one node.
pub(crate) struct AnnGraph {
    /// M = 16 links per node, M0 = 32 at layer 0. The seeded RNG makes graph
    /// construction reproducible for a given insertion order.
    hnsw: Hnsw<CosineDistance, Box<[f32]>, StdRng, 16, 32>,
    slots: Vec<Slot>,
    by_id: HashMap<String, usize>,
    /// Lowercased entity names and tickers seen in active records.
    entities: HashSet<String>,
    superseded: usize,
    exact_scan_threshold: usize,
}

impl AnnGraph {
    pub(crate) fn new(exact_scan_threshold: usize) -> Self {
        Self {
            hnsw: Hnsw::new(CosineDistance),
            slots: Vec::new(),
            by_id: HashMap::new(),
            entities: HashSet::new(),
            superseded: 0,
            exact_scan_threshold,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn active_len(&self) -> usize {
        self.slots.len() - self.superseded
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Link one record into the graph. Inserting a known id is a no-op.
    pub(crate) fn insert(
        &mut self,
        id: &str,
        source: RecordSource,
        metadata: RecordMetadata,
        ingested_at: DateTime<Utc>,
        vector: Vec<f32>,
    ) {
        if self.by_id.contains_key(id) {
            return;
        }
        for name in [&metadata.entity, &metadata.ticker].into_iter().flatten() {
            self.entities.insert(name.trim().to_lowercase());
        }

        let mut searcher = Searcher::default();
        let pos = self.hnsw.insert(vector.into_boxed_slice(), &mut searcher);
        debug_assert_eq!(pos, self.slots.len());

        self.by_id.insert(id.to_string(), pos);
        self.slots.push(Slot {
            id: id.to_string(),
            source,
            metadata: Arc::new(metadata),
            ingested_at,
            superseded: false,
        });
    }

    /// Tombstone a node. The node stays in the graph for navigation but is
    /// never returned.
    pub(crate) fn mark_superseded(&mut self, id: &str) -> bool {
        match self.by_id.get(id) {
            Some(&pos) if !self.slots[pos].superseded => {
                self.slots[pos].superseded = true;
                self.superseded += 1;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn knows_entity(&self, name: &str) -> bool {
        self.entities.contains(&name.trim().to_lowercase())
    }

    /// Ranked entry for an active record, scored against `query`.
    pub(crate) fn ranked(&self, id: &str, query: &[f32]) -> Option<RankedResult> {
        let &pos = self.by_id.get(id)?;
        if self.slots[pos].superseded {
            return None;
        }
        Some(self.result_at(pos, self.score_at(pos, query)))
    }

    fn score_at(&self, pos: usize, query: &[f32]) -> f32 {
        cosine_similarity(query, self.hnsw.feature(pos)).clamp(0.0, 1.0)
    }

    fn eligible(&self, pos: usize, filters: &SearchFilters) -> bool {
        let slot = &self.slots[pos];
        !slot.superseded && filters.matches(slot.source, &slot.metadata)
    }

    fn result_at(&self, pos: usize, score: f32) -> RankedResult {
        let slot = &self.slots[pos];
        RankedResult {
            id: slot.id.clone(),
            score,
            source: slot.source,
            ingested_at: slot.ingested_at,
            metadata: (*slot.metadata).clone(),
        }
    }

    /// Top `k` active records passing `filters`, ranked by clamped cosine.
    ///
    /// Filters are applied while collecting candidates. When fewer than `k`
    /// graph neighbors pass, the window widens until `k` are found or the
    /// window covers the whole graph, at which point an exact scan finishes
    /// the job.
    #[instrument(skip_all, fields(k = k, graph_size = self.slots.len()))]
    pub(crate) fn search(&self, query: &[f32], k: usize, filters: &SearchFilters) -> Vec<RankedResult> {
        if k == 0 || self.active_len() == 0 {
            return Vec::new();
        }

        let total = self.slots.len();
        if total <= self.exact_scan_threshold {
            return self.exact_scan(query, k, filters);
        }

        let query_box: Box<[f32]> = query.to_vec().into_boxed_slice();
        let mut window = (k * WINDOW_GROWTH).max(MIN_EF_SEARCH);

        loop {
            if window >= total {
                tracing::debug!(window, total, "candidate window covers index, exact scan");
                return self.exact_scan(query, k, filters);
            }

            let mut searcher = Searcher::default();
            let mut neighbors = vec![
                Neighbor {
                    index: !0,
                    distance: !0
                };
                window
            ];
            let found = self.hnsw.nearest(&query_box, window, &mut searcher, &mut neighbors);

            let mut hits: Vec<RankedResult> = found
                .iter()
                .filter(|n| n.index != !0 && self.eligible(n.index, filters))
                .map(|n| self.result_at(n.index, self.score_at(n.index, query)))
                .collect();

            if hits.len() >= k {
                hits.sort_by(|a, b| a.rank_cmp(b));
                hits.truncate(k);
                return hits;
            }

            tracing::debug!(window, hits = hits.len(), "widening candidate window");
            window = window.saturating_mul(WINDOW_GROWTH);
        }
    }

    fn exact_scan(&self, query: &[f32], k: usize, filters: &SearchFilters) -> Vec<RankedResult> {
        let mut scored: Vec<(usize, f32)> = (0..self.slots.len())
            .filter(|&pos| self.eligible(pos, filters))
            .map(|pos| (pos, self.score_at(pos, query)))
            .collect();
        scored.sort_by(|&(pa, sa), &(pb, sb)| {
            let (a, b) = (&self.slots[pa], &self.slots[pb]);
            crate::models::rank_order((sa, a.ingested_at, a.id.as_str()), (sb, b.ingested_at, b.id.as_str()))
        });
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(pos, score)| self.result_at(pos, score))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn meta(entity: &str, doc_type: &str) -> RecordMetadata {
        RecordMetadata {
            entity: Some(entity.into()),
            doc_type: Some(doc_type.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_exact_scan_ranks_by_cosine() {
        let mut g = AnnGraph::new(100);
        g.insert("a", RecordSource::Historical, meta("x", "Lease"), at(1), vec![1.0, 0.0, 0.0]);
        g.insert("b", RecordSource::Historical, meta("x", "Lease"), at(2), vec![0.0, 1.0, 0.0]);
        g.insert("c", RecordSource::Historical, meta("x", "Lease"), at(3), vec![1.0, 0.1, 0.0]);

        let hits = g.search(&[1.0, 0.0, 0.0], 2, &SearchFilters::default());
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_negative_cosine_clamped_to_zero() {
        let mut g = AnnGraph::new(100);
        g.insert("a", RecordSource::Historical, meta("x", "Lease"), at(1), vec![-1.0, 0.0]);
        let hits = g.search(&[1.0, 0.0], 1, &SearchFilters::default());
        assert_eq!(hits[0].score, 0.0);
    }

    #[test]
    fn test_superseded_nodes_hidden() {
        let mut g = AnnGraph::new(100);
        g.insert("old", RecordSource::Historical, meta("x", "Lease"), at(1), vec![1.0, 0.0]);
        g.insert("new", RecordSource::Historical, meta("x", "Lease"), at(2), vec![0.9, 0.1]);
        assert!(g.mark_superseded("old"));
        assert!(!g.mark_superseded("old"));

        let hits = g.search(&[1.0, 0.0], 5, &SearchFilters::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "new");
        assert_eq!(g.active_len(), 1);
        assert!(g.ranked("old", &[1.0, 0.0]).is_none());
        assert!(g.ranked("new", &[1.0, 0.0]).is_some());
    }

    #[test]
    fn test_graph_search_widens_until_filter_satisfied() {
        // Threshold 0 forces the HNSW path.
        let mut g = AnnGraph::new(0);
        for i in 0..400 {
            let angle = i as f32 / 400.0;
            let doc_type = if i % 97 == 0 { "Employment" } else { "Lease" };
            g.insert(
                &format!("r{:03}", i),
                RecordSource::Historical,
                meta("acme", doc_type),
                at(i),
                vec![1.0 - angle, angle, 0.1],
            );
        }

        let filters = SearchFilters {
            doc_type: Some("employment".into()),
            ..Default::default()
        };
        let hits = g.search(&[1.0, 0.0, 0.1], 5, &filters);
        // Positions 0, 97, 194, 291 and 388 are the only Employment records.
        assert_eq!(hits.len(), 5);
        assert!(hits.iter().all(|h| h.metadata.doc_type.as_deref() == Some("Employment")));
        for pair in hits.windows(2) {
            assert!(pair[0].rank_cmp(&pair[1]).is_le());
        }
    }

    #[test]
    fn test_ties_break_on_recency_then_id() {
        let mut g = AnnGraph::new(100);
        g.insert("b", RecordSource::Historical, meta("x", "Lease"), at(5), vec![1.0, 0.0]);
        g.insert("a", RecordSource::Historical, meta("x", "Lease"), at(5), vec![1.0, 0.0]);
        g.insert("c", RecordSource::Live, meta("x", "Lease"), at(9), vec![1.0, 0.0]);

        let ids: Vec<_> = g
            .search(&[1.0, 0.0], 3, &SearchFilters::default())
            .into_iter()
            .map(|h| h.id)
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_entities_tracked_case_insensitively() {
        let mut g = AnnGraph::new(100);
        let mut m = meta("Apple Inc.", "Services");
        m.ticker = Some("AAPL".into());
        g.insert("a", RecordSource::Live, m, at(1), vec![1.0]);
        assert!(g.knows_entity("aapl"));
        assert!(g.knows_entity(" apple inc. "));
        assert!(!g.knows_entity("MSFT"));
    }
}
