//! Percent ranks across a channel's viewer population.

/// Computes a percent rank for each `(id, value)` pair.
///
/// Rank is the zero-based position in the `(value, id)` ascending sort,
/// scaled to `[0, 100)`. The identity tie-break makes repeated runs over
/// unchanged data produce identical results.
#[must_use]
#[expect(
    clippy::cast_precision_loss,
    reason = "population sizes are far below f64 precision limits"
)]
pub fn percent_ranks<K>(rows: &[(K, i64)]) -> Vec<(K, f64)>
where
    K: Ord + Clone,
{
    let total = rows.len();
    if total == 0 {
        return Vec::new();
    }
    let mut sorted: Vec<&(K, i64)> = rows.iter().collect();
    sorted.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    sorted
        .into_iter()
        .enumerate()
        .map(|(position, (id, _))| (id.clone(), position as f64 * 100.0 / total as f64))
        .collect()
}
