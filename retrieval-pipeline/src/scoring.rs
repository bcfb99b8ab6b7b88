use std::cmp::Ordering;
use std::collections::HashSet;

/// The three retrieval sources a search call fuses, in the priority order
/// ties and backfill both respect: SQL exact/contains first, vector cosine
/// second, trigram similarity last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Sql,
    Vector,
    Trigram,
}

const PRIORITY: [Source; 3] = [Source::Sql, Source::Vector, Source::Trigram];

/// Caller-supplied weights, not required to already sum to 1 — normalized
/// internally.
#[derive(Debug, Clone, Copy)]
pub struct SourceWeights {
    pub sql: f32,
    pub vector: f32,
    pub trigram: f32,
}

impl Default for SourceWeights {
    fn default() -> Self {
        Self {
            sql: 1.0,
            vector: 1.0,
            trigram: 1.0,
        }
    }
}

impl SourceWeights {
    fn get(&self, source: Source) -> f32 {
        match source {
            Source::Sql => self.sql,
            Source::Vector => self.vector,
            Source::Trigram => self.trigram,
        }
    }
}

/// One candidate row from a single source, before fusion.
#[derive(Debug, Clone)]
pub struct SourceRow<T> {
    pub id: String,
    pub item: T,
    pub score: f32,
}

/// Fusion rule for `search_nodes`/`search_edges`:
/// normalize weights to sum 1; redistribute an empty source's share evenly
/// among the remaining non-empty sources (or return nothing if every
/// source is empty); take `floor(limit * wi)` from each source in
/// `Sql, Vector, Trigram` priority order; dedup by id keeping first
/// occurrence; backfill unused rows in the same priority order until
/// `limit` is reached or every pool is exhausted.
pub fn fuse<T: Clone>(
    sources: [Vec<SourceRow<T>>; 3],
    weights: SourceWeights,
    limit: usize,
) -> Vec<T> {
    if limit == 0 {
        return Vec::new();
    }

    let mut pools: [Vec<SourceRow<T>>; 3] = sources;
    for pool in &mut pools {
        pool.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    }

    let non_empty: Vec<Source> = PRIORITY
        .into_iter()
        .filter(|s| !pools[pool_index(*s)].is_empty())
        .collect();
    if non_empty.is_empty() {
        return Vec::new();
    }

    let raw_total = weights.sql + weights.vector + weights.trigram;
    let effective_weight = |source: Source| -> f32 {
        if raw_total <= 0.0 {
            return 1.0 / non_empty.len() as f32;
        }
        let normalized = weights.get(source) / raw_total;
        if pools[pool_index(source)].is_empty() {
            0.0
        } else {
            normalized
        }
    };

    let empty_share: f32 = PRIORITY
        .into_iter()
        .filter(|s| pools[pool_index(*s)].is_empty())
        .map(|s| weights.get(s) / raw_total.max(f32::EPSILON))
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let redistribution = if non_empty.is_empty() {
        0.0
    } else {
        empty_share / non_empty.len() as f32
    };

    let mut seen = HashSet::new();
    let mut out: Vec<T> = Vec::with_capacity(limit);

    for source in PRIORITY {
        let idx = pool_index(source);
        if pools[idx].is_empty() {
            continue;
        }
        let share = effective_weight(source) + redistribution;
        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let take = ((limit as f32) * share).floor() as usize;
        for row in pools[idx].iter().take(take) {
            if seen.insert(row.id.clone()) {
                out.push(row.item.clone());
            }
        }
    }

    if out.len() < limit {
        'backfill: for source in PRIORITY {
            let idx = pool_index(source);
            for row in &pools[idx] {
                if out.len() >= limit {
                    break 'backfill;
                }
                if seen.insert(row.id.clone()) {
                    out.push(row.item.clone());
                }
            }
        }
    }

    out.truncate(limit);
    out
}

const fn pool_index(source: Source) -> usize {
    match source {
        Source::Sql => 0,
        Source::Vector => 1,
        Source::Trigram => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, score: f32) -> SourceRow<String> {
        SourceRow {
            id: id.to_string(),
            item: id.to_string(),
            score,
        }
    }

    #[test]
    fn all_empty_sources_return_nothing() {
        let result = fuse::<String>([vec![], vec![], vec![]], SourceWeights::default(), 10);
        assert!(result.is_empty());
    }

    #[test]
    fn dedup_preserves_first_occurrence_priority_order() {
        let sql = vec![row("a", 0.9)];
        let vector = vec![row("a", 0.5), row("b", 0.4)];
        let result = fuse([sql, vector, vec![]], SourceWeights::default(), 10);
        assert_eq!(result, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn redistributes_empty_source_share_and_respects_limit() {
        let sql = vec![row("a", 1.0), row("b", 0.9), row("c", 0.8), row("d", 0.7)];
        let result = fuse([sql, vec![], vec![]], SourceWeights::default(), 2);
        assert_eq!(result.len(), 2);
        assert_eq!(result, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn backfills_from_non_empty_sources_up_to_limit() {
        let sql = vec![row("a", 1.0)];
        let vector = vec![row("b", 1.0), row("c", 0.5)];
        let result = fuse([sql, vector, vec![]], SourceWeights::default(), 3);
        assert_eq!(result.len(), 3);
        assert_eq!(result[0], "a");
    }
}
