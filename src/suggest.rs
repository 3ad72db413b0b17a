//! "Did you mean" ranking for unresolved commands.

use strsim::normalized_levenshtein;

/// Default minimum similarity for a name to be suggested.
pub const DEFAULT_THRESHOLD: f64 = 0.6;
/// Default width of the relevance window below the best score.
pub const DEFAULT_WINDOW: f64 = 0.1;

/// Rank `candidates` against `input` by normalized edit distance.
///
/// Only names scoring at least `threshold`, and no more than `window` below
/// the best score, are returned, best first. Comparison is case-insensitive;
/// duplicates are collapsed.
pub fn rank<'a, I>(input: &str, candidates: I, threshold: f64, window: f64) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let needle = input.to_lowercase();
    let mut scored: Vec<(f64, &str)> = candidates
        .into_iter()
        .map(|c| (normalized_levenshtein(&needle, &c.to_lowercase()), c))
        .filter(|&(score, _)| score >= threshold)
        .collect();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    let Some(&(best, _)) = scored.first() else {
        return Vec::new();
    };

    let mut out: Vec<String> = Vec::new();
    for (score, name) in scored {
        if best - score > window {
            break;
        }
        if !out.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            out.push(name.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMES: [&str; 5] = ["StartRecording", "StopRecording", "SetTimeZone", "GetState", "Snap"];

    #[test]
    fn typo_finds_intended_name() {
        let hits = rank("StartRecordin", NAMES, DEFAULT_THRESHOLD, DEFAULT_WINDOW);
        assert_eq!(hits.first().map(String::as_str), Some("StartRecording"));
    }

    #[test]
    fn case_is_ignored() {
        let hits = rank("settimezone", NAMES, DEFAULT_THRESHOLD, DEFAULT_WINDOW);
        assert_eq!(hits, vec!["SetTimeZone"]);
    }

    #[test]
    fn window_keeps_close_contenders() {
        // Equidistant from both recording commands.
        let hits = rank("StaxRecording", NAMES, DEFAULT_THRESHOLD, 0.2);
        assert!(hits.contains(&"StartRecording".to_string()));
        assert!(hits.contains(&"StopRecording".to_string()));
    }

    #[test]
    fn unrelated_input_yields_nothing() {
        assert!(rank("Frobnicate", NAMES, DEFAULT_THRESHOLD, DEFAULT_WINDOW).is_empty());
    }
}
