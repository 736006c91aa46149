#![forbid(unsafe_code)]

pub(crate) const ELLIPSIS: &str = "...";

/// Truncate `text` to `max_chars` (marking the cut with `...`) and split the
/// result into chunks of at most `chunk_chars`, preferring whitespace breaks.
pub(crate) fn prepare_chunks(text: &str, max_chars: usize, chunk_chars: usize) -> Vec<String> {
	let text = text.trim();
	if text.is_empty() || chunk_chars == 0 {
		return Vec::new();
	}

	let truncated = truncate_with_ellipsis(text, max_chars.max(ELLIPSIS.len() + 1));
	let mut rest = truncated.as_str();
	let mut out = Vec::new();

	while rest.chars().count() > chunk_chars {
		let hard_cut = byte_index_of_char(rest, chunk_chars);
		// Whitespace right at the limit is still a valid break.
		let window = byte_index_of_char(rest, chunk_chars + 1);
		let cut = rest[..window]
			.rfind(char::is_whitespace)
			.filter(|&i| i > 0)
			.unwrap_or(hard_cut);

		let (head, tail) = rest.split_at(cut);
		let head = head.trim_end();
		if !head.is_empty() {
			out.push(head.to_string());
		}
		rest = tail.trim_start();
	}

	if !rest.is_empty() {
		out.push(rest.to_string());
	}
	out
}

fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
	if text.chars().count() <= max_chars {
		return text.to_string();
	}
	let keep = max_chars - ELLIPSIS.len();
	let mut out: String = text.chars().take(keep).collect();
	out.truncate(out.trim_end().len());
	out.push_str(ELLIPSIS);
	out
}

/// Byte offset of the `n`th char (or `s.len()` when shorter).
fn byte_index_of_char(s: &str, n: usize) -> usize {
	s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn short_text_is_one_chunk() {
		assert_eq!(prepare_chunks("  hello chat  ", 100, 50), vec!["hello chat"]);
		assert!(prepare_chunks("   ", 100, 50).is_empty());
	}

	#[test]
	fn splits_on_whitespace() {
		let chunks = prepare_chunks("aaaa bbbb cccc", 100, 10);
		assert_eq!(chunks, vec!["aaaa bbbb", "cccc"]);
	}

	#[test]
	fn hard_splits_long_words() {
		let chunks = prepare_chunks("abcdefghij", 100, 4);
		assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
	}

	#[test]
	fn truncates_with_marker() {
		let text = "x".repeat(50);
		let chunks = prepare_chunks(&text, 20, 100);
		assert_eq!(chunks.len(), 1);
		assert_eq!(chunks[0].chars().count(), 20);
		assert!(chunks[0].ends_with(ELLIPSIS));
	}

	#[test]
	fn multibyte_text_is_split_on_char_boundaries() {
		let chunks = prepare_chunks("ééééé ééééé", 100, 6);
		assert_eq!(chunks, vec!["ééééé", "ééééé"]);
	}

	proptest! {
		#[test]
		fn chunks_respect_limits(text in "[a-z ]{0,400}", max in 10usize..300, chunk in 1usize..80) {
			let chunks = prepare_chunks(&text, max, chunk);
			let total: usize = chunks.iter().map(|c| c.chars().count()).sum();
			prop_assert!(total <= max);
			for c in &chunks {
				prop_assert!(!c.is_empty());
				prop_assert!(c.chars().count() <= chunk);
			}
		}
	}
}
