//! Sentence splitting for streamed model output
//!
//! Model tokens are regrouped into sentences so synthesis can start before
//! the reply is complete. Segments keep their original whitespace and a
//! whitespace-only segment is carried into the next sentence, so
//! concatenating every sentence and the final flush reproduces the model
//! output. Only whitespace after the last sentence is dropped.

const TERMINATORS: [char; 6] = ['.', '!', '?', '।', '॥', '\n'];
const CLOSERS: [char; 5] = ['"', '\'', ')', ']', '\u{201D}'];

/// Incremental sentence splitter
#[derive(Debug, Clone)]
pub struct SentenceSplitter {
    buffer: String,
    /// Force a split at a word boundary once the buffer grows past this
    max_chars: usize,
}

impl Default for SentenceSplitter {
    fn default() -> Self {
        Self::new(300)
    }
}

impl SentenceSplitter {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_chars: max_chars.max(1),
        }
    }

    /// Add a chunk and return every sentence it completes
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut segments = Vec::new();

        while let Some(end) = self.sentence_end() {
            let rest = self.buffer.split_off(end);
            segments.push(std::mem::replace(&mut self.buffer, rest));
        }

        if self.buffer.chars().count() > self.max_chars {
            if let Some(pos) = self.buffer.rfind(char::is_whitespace) {
                let split = pos + self.buffer[pos..].chars().next().map_or(1, char::len_utf8);
                let rest = self.buffer.split_off(split);
                segments.push(std::mem::replace(&mut self.buffer, rest));
            }
        }

        let mut sentences = Vec::with_capacity(segments.len());
        let mut carry = String::new();
        for segment in segments {
            if segment.trim().is_empty() {
                carry.push_str(&segment);
            } else {
                sentences.push(std::mem::take(&mut carry) + &segment);
            }
        }
        self.buffer.insert_str(0, &carry);

        sentences
    }

    /// Return whatever is left, if it carries any text
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Byte offset just past the first confirmed sentence
    ///
    /// A terminator only counts once the following character is known to be
    /// whitespace, so "3.14" and "e.g." mid-stream do not split.
    fn sentence_end(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();

        while let Some((_, c)) = chars.next() {
            if !TERMINATORS.contains(&c) {
                continue;
            }
            if c == '\n' {
                return Some(chars.peek().map_or(self.buffer.len(), |(i, _)| *i));
            }

            while let Some((_, next)) = chars.peek() {
                if CLOSERS.contains(next) {
                    chars.next();
                } else {
                    break;
                }
            }

            match chars.peek() {
                Some((_, next)) if next.is_whitespace() => {
                    while let Some((_, next)) = chars.peek() {
                        if next.is_whitespace() {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    return Some(chars.peek().map_or(self.buffer.len(), |(i, _)| *i));
                }
                Some(_) => continue,
                None => return None,
            }
        }

        None
    }
}
