/// Returns the candidate closest to `target` by edit distance, if any is close
/// enough to be a plausible misspelling.
pub fn find_best_match(target: &str, candidates: impl Iterator<Item = String>) -> Option<String> {
    let mut best_candidate = None;
    let mut min_distance = usize::MAX;

    for candidate in candidates {
        if candidate == target {
            continue;
        }
        let distance = levenshtein_distance(target, &candidate);
        let threshold = if target.chars().count() < 3 { 1 } else { 3 };

        if distance <= threshold && distance < min_distance {
            min_distance = distance;
            best_candidate = Some(candidate);
        }
    }

    best_candidate
}

fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s2_chars: Vec<char> = s2.chars().collect();
    let mut previous: Vec<usize> = (0..=s2_chars.len()).collect();
    let mut current = vec![0; s2_chars.len() + 1];

    for (i, char1) in s1.chars().enumerate() {
        current[0] = i + 1;
        for (j, char2) in s2_chars.iter().enumerate() {
            let cost = usize::from(char1 != *char2);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[s2_chars.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggests_close_spelling() {
        let candidates = ["color", "size", "width"].map(String::from);
        assert_eq!(
            find_best_match("colr", candidates.into_iter()),
            Some("color".to_string())
        );
    }

    #[test]
    fn ignores_distant_names() {
        let candidates = ["color", "size"].map(String::from);
        assert_eq!(find_best_match("verbose", candidates.into_iter()), None);
    }

    #[test]
    fn distance_counts_edits() {
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("same", "same"), 0);
    }
}
