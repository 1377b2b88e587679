//! Cross-project, cross-backend search aggregation.
//!
//! Each backend returns candidates scored on its own scale (bm25 vs cosine),
//! so scores are min-max normalized per backend before merging. A document
//! found by both backends keeps its best normalized score.

use std::time::Instant;

use sqlx::SqlitePool;
use tracing::warn;

use crate::config::SearchConfig;
use crate::error::HarnessError;
use crate::index::{BackendHit, BackendKind, IndexManager};
use crate::models::{Project, SearchResponse, SearchResult};

pub async fn search(
    pool: &SqlitePool,
    manager: &IndexManager,
    config: &SearchConfig,
    query: &str,
    scope: Option<&str>,
    limit: Option<i64>,
) -> Result<SearchResponse, HarnessError> {
    let started = Instant::now();
    let limit = limit.unwrap_or(config.default_limit).clamp(1, config.max_limit);

    let query = query.trim();
    if query.is_empty() {
        return Ok(SearchResponse {
            results: Vec::new(),
            total: 0,
            query_time_ms: started.elapsed().as_millis() as u64,
        });
    }

    let projects: Vec<Project> = match scope {
        Some(id) => vec![crate::store::get_project(pool, id).await?],
        None => crate::store::list_projects(pool).await?,
    };

    let mut merged: Vec<SearchResult> = Vec::new();
    for project in &projects {
        for backend in manager.backends() {
            if backend.kind() == BackendKind::Vector && !project.config.vector_index {
                continue;
            }
            match backend
                .search(pool, &project.id, query, config.candidate_k)
                .await
            {
                Ok(hits) => {
                    merge_hits(&mut merged, &project.id, normalize(hits));
                }
                Err(e) => {
                    // One backend failing (an embedding API down, say) must
                    // not take the whole query with it.
                    warn!(project = %project.id, backend = backend.kind().as_str(), error = %e, "backend search failed");
                }
            }
        }
    }

    merged.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.title.cmp(&b.title))
            .then_with(|| a.path.cmp(&b.path))
    });
    let total = merged.len();
    merged.truncate(limit as usize);

    Ok(SearchResponse {
        results: merged,
        total,
        query_time_ms: started.elapsed().as_millis() as u64,
    })
}

/// Min-max normalize one backend's candidate list to [0, 1]. A single hit,
/// or a list where every score ties, normalizes to 1.0.
fn normalize(hits: Vec<BackendHit>) -> Vec<(BackendHit, f64)> {
    if hits.is_empty() {
        return Vec::new();
    }
    let min = hits.iter().map(|h| h.raw_score).fold(f64::INFINITY, f64::min);
    let max = hits.iter().map(|h| h.raw_score).fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    hits.into_iter()
        .map(|h| {
            let score = if range > 0.0 { (h.raw_score - min) / range } else { 1.0 };
            (h, score)
        })
        .collect()
}

/// Fold normalized hits into the cross-backend result set, keeping the
/// best score per (project, path).
fn merge_hits(merged: &mut Vec<SearchResult>, project_id: &str, hits: Vec<(BackendHit, f64)>) {
    for (hit, score) in hits {
        if let Some(existing) = merged
            .iter_mut()
            .find(|r| r.project == project_id && r.path == hit.path)
        {
            if score > existing.score {
                existing.score = score;
                existing.snippet = hit.snippet;
            }
        } else {
            merged.push(SearchResult {
                project: project_id.to_string(),
                path: hit.path,
                title: hit.title,
                url: hit.url,
                snippet: hit.snippet,
                score,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(path: &str, raw: f64) -> BackendHit {
        BackendHit {
            path: path.to_string(),
            title: path.to_string(),
            url: format!("https://docs.test/{}", path),
            snippet: String::new(),
            raw_score: raw,
        }
    }

    #[test]
    fn normalize_spreads_to_unit_range() {
        let out = normalize(vec![hit("a", 2.0), hit("b", 6.0), hit("c", 4.0)]);
        let scores: Vec<f64> = out.iter().map(|(_, s)| *s).collect();
        assert_eq!(scores, vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn normalize_single_and_tied_hits() {
        let out = normalize(vec![hit("a", -3.7)]);
        assert_eq!(out[0].1, 1.0);

        let out = normalize(vec![hit("a", 5.0), hit("b", 5.0)]);
        assert!(out.iter().all(|(_, s)| *s == 1.0));
    }

    #[test]
    fn merge_keeps_best_score_per_path() {
        let mut merged = Vec::new();
        merge_hits(&mut merged, "p", vec![(hit("a", 0.0), 0.4), (hit("b", 0.0), 0.9)]);
        merge_hits(&mut merged, "p", vec![(hit("a", 0.0), 0.8)]);
        merge_hits(&mut merged, "q", vec![(hit("a", 0.0), 0.1)]);

        assert_eq!(merged.len(), 3);
        let pa = merged
            .iter()
            .find(|r| r.project == "p" && r.path == "a")
            .unwrap();
        assert_eq!(pa.score, 0.8);
    }
}
