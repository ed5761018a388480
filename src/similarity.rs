//! Text similarity used to decide whether two recognitions are the same cue.
//!
//! Ratcliff/Obershelp: find the longest common substring, recurse on the
//! pieces to its left and right, and score `2·M / (|a| + |b|)` where `M` is
//! the number of matched characters. Works on Unicode scalar values, so CJK
//! text compares per character.

/// Similarity in `[0, 1]`. Two empty strings are identical (1.0).
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matched = matching_chars(&a, &b);
    2.0 * matched as f64 / total as f64
}

/// `true` when `similarity(a, b) >= threshold`. The boundary value merges.
pub fn is_similar(a: &str, b: &str, threshold: f64) -> bool {
    similarity(a, b) >= threshold
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, size) = longest_match(a, b, alo, ahi, blo, bhi);
        if size == 0 {
            continue;
        }
        matched += size;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + size < ahi && j + size < bhi {
            pending.push((i + size, ahi, j + size, bhi));
        }
    }
    matched
}

/// Longest common run of `a[alo..ahi]` and `b[blo..bhi]`. Ties go to the
/// earliest start in `a`, then in `b`.
fn longest_match(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0);
    // previous[j - blo + 1]: common run ending at a[i - 1], b[j]
    let mut previous = vec![0usize; bhi - blo + 1];
    for i in alo..ahi {
        let mut current = vec![0usize; bhi - blo + 1];
        for j in blo..bhi {
            if a[i] == b[j] {
                let k = previous[j - blo] + 1;
                current[j - blo + 1] = k;
                if k > best_size {
                    best_i = i + 1 - k;
                    best_j = j + 1 - k;
                    best_size = k;
                }
            }
        }
        previous = current;
    }
    (best_i, best_j, best_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn known_ratios() {
        assert!(close(similarity("这漫天的星辰之中", "竟然还蕴含着星辰之力"), 1.0 / 3.0));
        assert!(close(
            similarity("竟然还蕴含着星辰之力", "竟竞然还蕴含着星辰之力"),
            20.0 / 21.0
        ));
        assert!(close(similarity("此机会多吸取一点", "大胆人类"), 0.0));
        assert!(close(similarity("abcd", "bcde"), 0.75));
    }

    #[test]
    fn empty_and_identical() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("", "Hello"), 0.0);
        assert_eq!(similarity("Hello", "Hello"), 1.0);
    }

    #[test]
    fn threshold_boundary_merges() {
        // 2·3 / 8 = 0.75 exactly
        assert!(close(similarity("abcd", "bcde"), 0.75));
        assert!(is_similar("abcd", "bcde", 0.75));
        assert!(!is_similar("abcd", "bcde", 0.76));
    }
}
