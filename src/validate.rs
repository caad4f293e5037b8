//! Near-miss suggestions for operator-facing validation errors.
//!
//! When a document references a priority key or parent epic that doesn't
//! exist, the error names the closest valid values so the operator can fix
//! the file in one pass.

/// Maximum edit distance for a value to count as a suggestion.
const MAX_DISTANCE: usize = 3;

// ── Levenshtein distance ─────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
#[must_use]
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    // Single-row optimization (O(min(m,n)) space)
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1) // deletion
                .min(curr[j] + 1) // insertion
                .min(prev[j] + cost); // substitution
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Find candidates similar to `input`.
///
/// Comparison is case-insensitive. Returns up to `max` suggestions with edit
/// distance ≤ 3, sorted by distance then alphabetically.
#[must_use]
pub fn find_similar<'a, I>(input: &str, candidates: I, max: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let needle = input.to_lowercase();
    let mut scored: Vec<(usize, &str)> = candidates
        .into_iter()
        .map(|c| (levenshtein_distance(&needle, &c.to_lowercase()), c))
        .filter(|(dist, _)| *dist <= MAX_DISTANCE)
        .collect();

    scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    scored.dedup_by(|a, b| a.1 == b.1);

    scored
        .into_iter()
        .take(max)
        .map(|(_, c)| c.to_string())
        .collect()
}
