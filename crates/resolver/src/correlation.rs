//! Correlation fallback: match a candidate's symbol set against entities the
//! state map already tracks.

use tinymem_store::EntityRow;

use crate::StateLookup;

#[derive(Debug)]
pub enum CorrelationOutcome {
    /// Exactly one entity overlaps above the threshold.
    Match(EntityRow),
    /// Two or more entities tie at the best overlap.
    Ambiguous,
    None,
}

/// Overlap fraction of the candidate's symbols covered by the row's
/// recorded symbol set (detected symbols plus the row's own symbol).
fn overlap(candidate: &[String], row: &EntityRow) -> f32 {
    if candidate.is_empty() {
        return 0.0;
    }
    let mut row_symbols = row.detected_symbols();
    if !row_symbols.contains(&row.symbol) {
        row_symbols.push(row.symbol.clone());
    }
    let hits = candidate
        .iter()
        .filter(|symbol| row_symbols.contains(symbol))
        .count();
    hits as f32 / candidate.len() as f32
}

pub fn correlate(
    state: &dyn StateLookup,
    candidate_symbols: &[String],
    threshold: f32,
) -> CorrelationOutcome {
    let mut rows: Vec<EntityRow> = Vec::new();
    for symbol in candidate_symbols {
        for row in state.lookup_by_symbol(symbol) {
            if !rows.iter().any(|existing| existing.entity_key == row.entity_key) {
                rows.push(row);
            }
        }
    }

    let mut scored: Vec<(f32, EntityRow)> = rows
        .into_iter()
        .map(|row| (overlap(candidate_symbols, &row), row))
        .filter(|(score, _)| *score >= threshold)
        .collect();
    scored.sort_by(|(left, _), (right, _)| right.total_cmp(left));

    match scored.len() {
        0 => CorrelationOutcome::None,
        1 => CorrelationOutcome::Match(scored.remove(0).1),
        _ => {
            if (scored[0].0 - scored[1].0).abs() < f32::EPSILON {
                CorrelationOutcome::Ambiguous
            } else {
                CorrelationOutcome::Match(scored.remove(0).1)
            }
        }
    }
}
