//! Incremental UTF-8 decoding for output that arrives in arbitrary chunks.
//!
//! A pipe read can end in the middle of a multi-byte sequence. The decoder
//! keeps the incomplete tail (at most three bytes) and completes it with the
//! next chunk, so every byte is emitted exactly once.

const REPLACEMENT: char = '\u{FFFD}';

#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
	seq: [u8; 4],
	len: usize,
	need: usize,
}

impl Utf8StreamDecoder {
	pub fn new() -> Self {
		Self::default()
	}

	/// True while an incomplete multi-byte sequence is buffered.
	pub fn has_pending_bytes(&self) -> bool {
		self.len > 0
	}

	/// Decode the next chunk of the stream.
	///
	/// Malformed input never fails: a continuation byte that does not fit
	/// produces one U+FFFD for every byte seen so far in the broken sequence
	/// (including itself), after which that byte is decoded again on its own.
	pub fn append_bytes(&mut self, bytes: &[u8]) -> String {
		let mut out = String::with_capacity(bytes.len());
		for &b in bytes {
			self.push(b, &mut out);
		}
		out
	}

	/// End of stream: anything still buffered can never be completed.
	pub fn finish(&mut self) -> String {
		let out = std::iter::repeat(REPLACEMENT).take(self.len).collect();
		self.len = 0;
		self.need = 0;
		out
	}

	fn push(&mut self, b: u8, out: &mut String) {
		if self.len > 0 {
			if b & 0xC0 == 0x80 {
				self.seq[self.len] = b;
				self.len += 1;
				if self.len == self.need {
					out.push(self.assemble());
					self.len = 0;
				}
				return;
			}
			for _ in 0..=self.len {
				out.push(REPLACEMENT);
			}
			self.len = 0;
		}

		self.need = match b {
			0x00..=0x7F => {
				out.push(b as char);
				return;
			}
			0xC0..=0xDF => 2,
			0xE0..=0xEF => 3,
			0xF0..=0xF7 => 4,
			_ => {
				out.push(REPLACEMENT);
				return;
			}
		};
		self.seq[0] = b;
		self.len = 1;
	}

	fn assemble(&self) -> char {
		let s = &self.seq;
		let cp = match self.need {
			2 => (u32::from(s[0] & 0x1F) << 6) | u32::from(s[1] & 0x3F),
			3 => {
				(u32::from(s[0] & 0x0F) << 12)
					| (u32::from(s[1] & 0x3F) << 6)
					| u32::from(s[2] & 0x3F)
			}
			_ => {
				(u32::from(s[0] & 0x07) << 18)
					| (u32::from(s[1] & 0x3F) << 12)
					| (u32::from(s[2] & 0x3F) << 6)
					| u32::from(s[3] & 0x3F)
			}
		};
		char::from_u32(cp).unwrap_or(REPLACEMENT)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn compositions(n: usize) -> Vec<Vec<usize>> {
		if n == 0 {
			return vec![vec![]];
		}
		let mut all = Vec::new();
		for first in 1..=n {
			for mut rest in compositions(n - first) {
				rest.insert(0, first);
				all.push(rest);
			}
		}
		all
	}

	fn check_all_splits(text: &str) {
		let bytes = text.as_bytes();
		for parts in compositions(bytes.len()) {
			let mut dec = Utf8StreamDecoder::new();
			let mut got = String::new();
			let mut start = 0;
			for len in &parts {
				got.push_str(&dec.append_bytes(&bytes[start..start + len]));
				start += len;
			}
			assert_eq!(got, text, "split {:?}", parts);
			assert!(!dec.has_pending_bytes(), "split {:?}", parts);
		}
	}

	#[test]
	fn every_split_round_trips() {
		check_all_splits("test");
		check_all_splits("тест");
		check_all_splits("-\u{1D11E}-");
		check_all_splits("a€b");
	}

	#[test]
	fn split_mid_codepoint() {
		let mut dec = Utf8StreamDecoder::new();
		assert_eq!(dec.append_bytes(b"caf\xC3"), "caf");
		assert!(dec.has_pending_bytes());
		assert_eq!(dec.append_bytes(b"\xA9"), "é");
		assert!(!dec.has_pending_bytes());
	}

	#[test]
	fn bad_continuation_emits_one_replacement_per_byte() {
		let mut dec = Utf8StreamDecoder::new();
		assert_eq!(dec.append_bytes(&[0xC0, 0x20]), "\u{FFFD}\u{FFFD} ");

		let mut dec = Utf8StreamDecoder::new();
		assert_eq!(dec.append_bytes(&[0xE2, 0x41]), "\u{FFFD}\u{FFFD}A");

		let mut dec = Utf8StreamDecoder::new();
		assert_eq!(dec.append_bytes(&[0xE2, 0x82, 0x41]), "\u{FFFD}\u{FFFD}\u{FFFD}A");
	}

	#[test]
	fn bad_continuation_across_chunks() {
		let mut dec = Utf8StreamDecoder::new();
		assert_eq!(dec.append_bytes(&[0xF0, 0x9D]), "");
		assert_eq!(dec.append_bytes(b"x"), "\u{FFFD}\u{FFFD}\u{FFFD}x");
		assert!(!dec.has_pending_bytes());
	}

	#[test]
	fn stray_bytes_emit_single_replacement() {
		let mut dec = Utf8StreamDecoder::new();
		assert_eq!(dec.append_bytes(&[0x80]), "\u{FFFD}");
		assert_eq!(dec.append_bytes(&[0xFF, b'z']), "\u{FFFD}z");
	}

	#[test]
	fn bad_continuation_followed_by_new_lead() {
		let mut dec = Utf8StreamDecoder::new();
		assert_eq!(dec.append_bytes(&[0xC3, 0xC3, 0xA9]), "\u{FFFD}\u{FFFD}é");
	}

	#[test]
	fn finish_flushes_truncated_tail() {
		let mut dec = Utf8StreamDecoder::new();
		assert_eq!(dec.append_bytes(&[b'a', 0xE2, 0x82]), "a");
		assert_eq!(dec.finish(), "\u{FFFD}\u{FFFD}");
		assert!(!dec.has_pending_bytes());
		assert_eq!(dec.finish(), "");
	}
}
