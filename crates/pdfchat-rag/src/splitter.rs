use std::collections::VecDeque;
use tracing::warn;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Splits text on a ladder of separators, coarsest first, then packs the
/// pieces into overlapping chunks of at most `chunk_size` characters.
///
/// Pieces that are still too long after splitting on one separator are split
/// again on the next. The final separator is the empty string, which splits
/// into single characters, so no chunk exceeds `chunk_size` unless a single
/// character does.
#[derive(Debug, Clone)]
pub struct RecursiveCharacterSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl Default for RecursiveCharacterSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

impl RecursiveCharacterSplitter {
    /// `chunk_overlap` is clamped below `chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
            separators: ["\n\n", "\n", " ", ""].iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &self.separators)
    }

    fn split_recursive(&self, text: &str, separators: &[String]) -> Vec<String> {
        let mut separator = separators.last().map(String::as_str).unwrap_or("");
        let mut rest: &[String] = &[];
        for (i, sep) in separators.iter().enumerate() {
            if sep.is_empty() {
                separator = "";
                break;
            }
            if text.contains(sep.as_str()) {
                separator = sep;
                rest = &separators[i + 1..];
                break;
            }
        }

        let splits: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|s| !s.is_empty()).collect()
        };

        let mut chunks = Vec::new();
        let mut good: Vec<&str> = Vec::new();
        for split in splits {
            if char_len(split) < self.chunk_size {
                good.push(split);
                continue;
            }
            if !good.is_empty() {
                chunks.extend(self.merge_splits(&good, separator));
                good.clear();
            }
            if rest.is_empty() {
                chunks.push(split.to_string());
            } else {
                chunks.extend(self.split_recursive(split, rest));
            }
        }
        if !good.is_empty() {
            chunks.extend(self.merge_splits(&good, separator));
        }
        chunks
    }

    fn merge_splits(&self, splits: &[&str], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut docs = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for split in splits {
            let len = char_len(split);
            let joiner = if current.is_empty() { 0 } else { sep_len };
            if total + len + joiner > self.chunk_size {
                if total > self.chunk_size {
                    warn!(
                        total,
                        chunk_size = self.chunk_size,
                        "created a chunk longer than the configured size"
                    );
                }
                if !current.is_empty() {
                    if let Some(doc) = join(&current, separator) {
                        docs.push(doc);
                    }
                    // drop from the front until the window fits the overlap
                    while total > self.chunk_overlap
                        || (total > 0
                            && total + len + if current.is_empty() { 0 } else { sep_len }
                                > self.chunk_size)
                    {
                        let Some(front) = current.pop_front() else {
                            break;
                        };
                        let removed = char_len(front) + if current.is_empty() { 0 } else { sep_len };
                        total = total.saturating_sub(removed);
                    }
                }
            }
            current.push_back(split);
            total += len + if current.len() > 1 { sep_len } else { 0 };
        }
        if let Some(doc) = join(&current, separator) {
            docs.push(doc);
        }
        docs
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn join(parts: &VecDeque<&str>, separator: &str) -> Option<String> {
    let joined = parts.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_blank_text_yield_nothing() {
        let splitter = RecursiveCharacterSplitter::default();
        assert!(splitter.split_text("").is_empty());
        assert!(splitter.split_text("   \n\n  \n ").is_empty());
    }

    #[test]
    fn test_short_text_is_one_trimmed_chunk() {
        let splitter = RecursiveCharacterSplitter::default();
        assert_eq!(splitter.split_text("  hello world \n"), vec!["hello world"]);
    }

    #[test]
    fn test_packs_words_without_overlap() {
        let splitter = RecursiveCharacterSplitter::new(10, 0);
        assert_eq!(
            splitter.split_text("aaaa bbbb cccc"),
            vec!["aaaa bbbb", "cccc"]
        );
    }

    #[test]
    fn test_overlap_carries_trailing_split() {
        let splitter = RecursiveCharacterSplitter::new(10, 4);
        assert_eq!(
            splitter.split_text("aaaa bbbb cccc"),
            vec!["aaaa bbbb", "bbbb cccc"]
        );
    }

    #[test]
    fn test_recurses_into_long_paragraphs() {
        let splitter = RecursiveCharacterSplitter::new(10, 0);
        let chunks = splitter.split_text("para one\n\npara two is longer than ten");
        assert_eq!(
            chunks,
            vec!["para one", "para two", "is longer", "than ten"]
        );
    }

    #[test]
    fn test_unbroken_text_falls_back_to_characters() {
        let splitter = RecursiveCharacterSplitter::new(10, 0);
        assert_eq!(
            splitter.split_text("abcdefghijklmno"),
            vec!["abcdefghij", "klmno"]
        );
    }

    #[test]
    fn test_chunks_respect_size_on_long_input() {
        let splitter = RecursiveCharacterSplitter::new(120, 30);
        let text = (0..200)
            .map(|i| format!("Sentence number {} talks about ünïcode.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let text = format!("{}\n\n{}", text, text);
        let chunks = splitter.split_text(&text);
        assert!(chunks.len() > 10);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 120, "{} chars", chunk.chars().count());
            assert!(!chunk.is_empty());
        }
    }

    #[test]
    fn test_overlap_is_clamped() {
        let splitter = RecursiveCharacterSplitter::new(5, 50);
        assert_eq!(splitter.chunk_overlap, 4);
    }
}
