// SPDX-License-Identifier: Apache-2.0

//! Byte-oriented Boyer-Moore substring search that never matches inside an
//! escape sequence.
//!
//! Separators from a log format template have to be located in raw log
//! lines without being fooled by escaped bytes: looking for `"` in
//! `"some \" text"` must skip the `\"`. The caller locates the escape
//! spans once per line and every search consumes them left to right.

/// Half-open byte range covering one escape sequence in a line.
pub type EscapeSpan = (usize, usize);

/// A successful separator search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchMatch {
    /// Byte offset of the first matched byte.
    pub begin: usize,
    /// Byte offset one past the last matched byte.
    pub end: usize,
    /// How many of the supplied escape spans lie entirely before the match.
    /// The caller slices its span list past these once the match is taken.
    pub escapes_used: usize,
}

/// Precompiled Boyer-Moore state for one fixed byte pattern: the 256-entry
/// bad-character table and the pattern-length good-suffix table. Immutable
/// after construction and shared between segments via `Arc`.
#[derive(Debug)]
pub struct Searcher {
    pattern: Vec<u8>,
    bad_chars: [usize; 256],
    good_suffixes: Vec<usize>,
}

impl Searcher {
    /// Compile a searcher for `pattern`. Returns None for an empty pattern,
    /// which the template compiler rejects at compile time.
    pub fn new(pattern: &[u8]) -> Option<Searcher> {
        if pattern.is_empty() {
            return None;
        }

        let length = pattern.len();
        let last = length - 1;

        // Bad character rule
        let mut bad_chars = [length; 256];
        for (i, &b) in pattern.iter().enumerate() {
            bad_chars[b as usize] = last - i;
        }

        // Good suffix rule - http://www-igm.univ-mlv.fr/~lecroq/string/node14.html
        let mut suffixes = vec![0usize; length];
        suffixes[last] = length;

        let mut good = last as isize;
        let mut f = last as isize - 1;

        for i in (0..last).rev() {
            let ii = i as isize;
            if ii > good && suffixes[(ii + last as isize - f) as usize] < (ii - good) as usize {
                suffixes[i] = suffixes[(ii + last as isize - f) as usize];
            } else {
                if ii < good {
                    good = ii;
                }
                f = ii;
                while good >= 0
                    && pattern[good as usize] == pattern[(good + last as isize - f) as usize]
                {
                    good -= 1;
                }
                suffixes[i] = (f - good) as usize;
            }
        }

        let mut good_suffixes = vec![length; length];

        let mut j = 0;
        for i in (0..=last).rev() {
            if suffixes[i] == i + 1 {
                while j < last - i {
                    if good_suffixes[j] == length {
                        good_suffixes[j] = last - i;
                    }
                    j += 1;
                }
            }
        }

        for i in 0..last {
            good_suffixes[last - suffixes[i]] = last - i;
        }

        Some(Searcher {
            pattern: pattern.to_vec(),
            bad_chars,
            good_suffixes,
        })
    }

    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// Find the first occurrence of the pattern in `line[start..]` that does
    /// not overlap any of the (sorted, disjoint) escape spans.
    pub fn search(
        &self,
        line: &[u8],
        start: usize,
        escapes: &[EscapeSpan],
    ) -> Option<SearchMatch> {
        let plen = self.pattern.len();
        let mut escidx = 0;
        let mut i = start;

        while i + plen <= line.len() {
            // Skip over escapes we've already passed
            while escidx < escapes.len() && escapes[escidx].1 <= i {
                escidx += 1;
            }

            // If the alignment window overlaps the next escape, jump past it
            if escidx < escapes.len() && escapes[escidx].0 < i + plen {
                i = escapes[escidx].1;
                continue;
            }

            // Compare right to left
            let mut j = plen - 1;
            loop {
                if self.pattern[j] != line[i + j] {
                    break;
                }
                if j == 0 {
                    return Some(SearchMatch {
                        begin: i,
                        end: i + plen,
                        escapes_used: escidx,
                    });
                }
                j -= 1;
            }

            let bc = self.bad_chars[line[i + j] as usize] as isize - plen as isize + 1 + j as isize;
            let gs = self.good_suffixes[j] as isize;

            // The good-suffix shift wins ties and is always >= 1, so the
            // alignment makes progress even when bc is non-positive.
            let shift = if bc > gs { bc } else { gs };
            i = (i as isize + shift) as usize;
        }

        None
    }
}
