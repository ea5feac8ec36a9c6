//! Sentence segmentation for streamed assistant text.
//!
//! Tokens accumulate until a boundary, then the complete sentence goes to the
//! TTS worker. Boundaries: terminal punctuation followed by whitespace (or
//! end of the accumulated text), a newline, or the max-length cap. To cut
//! first-speech latency, the first flush of a turn may also happen at a word
//! boundary once enough characters have accumulated.

/// Segmentation tunables.
#[derive(Clone, Debug)]
pub struct SegmenterConfig {
    /// Hard flush once the accumulator reaches this many characters.
    pub max_chars: usize,
    /// The first sentence of a turn may flush at a word boundary after this
    /// many characters, without waiting for punctuation.
    pub first_flush_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_chars: std::env::var("PARLEY_MAX_SENTENCE_CHARS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(200),
            first_flush_chars: std::env::var("PARLEY_FIRST_FLUSH_CHARS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

const TERMINALS: &[char] = &['.', '!', '?', '…', '。', '！', '？'];

/// Accumulates streamed text and emits complete sentences.
pub struct SentenceSplitter {
    cfg: SegmenterConfig,
    buf: String,
    emitted_any: bool,
}

impl SentenceSplitter {
    pub fn new(cfg: SegmenterConfig) -> Self {
        Self {
            cfg,
            buf: String::new(),
            emitted_any: false,
        }
    }

    /// Append streamed text; returns the sentences completed by it, in order.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut out = Vec::new();
        loop {
            match self.next_boundary() {
                Some(end) => {
                    let sentence: String = self.buf.drain(..end).collect();
                    let sentence = sentence.trim().to_string();
                    // Swallow leading whitespace left behind by the cut.
                    let skip = self
                        .buf
                        .char_indices()
                        .find(|(_, c)| !c.is_whitespace())
                        .map(|(i, _)| i)
                        .unwrap_or(self.buf.len());
                    self.buf.drain(..skip);
                    if !sentence.is_empty() {
                        self.emitted_any = true;
                        out.push(sentence);
                    }
                }
                None => break,
            }
        }
        out
    }

    /// Flush whatever remains (end of stream). Cancelled turns drop the
    /// accumulator instead of calling this.
    pub fn flush_remaining(&mut self) -> Option<String> {
        let rest = self.buf.trim().to_string();
        self.buf.clear();
        if rest.is_empty() {
            None
        } else {
            self.emitted_any = true;
            Some(rest)
        }
    }

    /// Forget buffered text and first-flush state for a new turn.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.emitted_any = false;
    }

    /// Byte offset one past the end of the first complete sentence, if any.
    fn next_boundary(&self) -> Option<usize> {
        let chars: Vec<(usize, char)> = self.buf.char_indices().collect();

        for (pos, &(idx, c)) in chars.iter().enumerate() {
            if c == '\n' {
                if idx > 0 {
                    return Some(idx);
                }
                continue;
            }
            if TERMINALS.contains(&c) {
                let next = chars.get(pos + 1).map(|&(_, n)| n);
                match next {
                    // Numbers like "3.5" keep streaming.
                    Some(n) if n.is_whitespace() => return Some(idx + c.len_utf8()),
                    Some(_) => continue,
                    None => return Some(idx + c.len_utf8()),
                }
            }
        }

        // Word-boundary cuts stay inside the max-length window.
        let window_end = self
            .buf
            .char_indices()
            .nth(self.cfg.max_chars.saturating_sub(1))
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(self.buf.len());

        // First-flush shortcut: cut at the last word boundary past the
        // threshold before any sentence has been emitted this turn.
        if !self.emitted_any && self.buf.chars().count() >= self.cfg.first_flush_chars {
            if let Some(cut) = self.buf[..window_end].rfind(char::is_whitespace) {
                if cut > 0 {
                    return Some(cut);
                }
            }
        }

        // Hard cap regardless of boundaries.
        if self.buf.chars().count() >= self.cfg.max_chars {
            let cut = self.buf[..window_end]
                .rfind(char::is_whitespace)
                .filter(|&i| i > 0)
                .unwrap_or(window_end);
            return Some(cut);
        }

        None
    }
}
