use std::collections::HashSet;

use crate::types::SearchResult;

/// Merge per-partition k-NN lists.
///
/// Labels are deduplicated keeping the first occurrence in partition order,
/// the union is stably sorted by ascending distance, and the output is
/// truncated to the longest input list.
pub fn merge_results(lists: Vec<Vec<SearchResult>>) -> Vec<SearchResult> {
    let limit = lists.iter().map(Vec::len).max().unwrap_or(0);
    let mut seen = HashSet::new();
    let mut merged: Vec<SearchResult> = lists
        .into_iter()
        .flatten()
        .filter(|r| seen.insert(r.label.clone()))
        .collect();
    merged.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    merged.truncate(limit);
    merged
}
