//! Bounded rolling window of generated text.
//!
//! Positions are global character offsets: `local index + start_offset`,
//! where `start_offset` counts characters already pruned off the front. The
//! pipeline only prunes characters it has already emitted (emission lags the
//! buffer by far less than `PRUNE_TO`), so pruning never loses unemitted
//! text.

/// Prune threshold.
pub const MAX_BUFFER: usize = 60_000;
/// Size the buffer is cut back to when it exceeds [`MAX_BUFFER`].
pub const PRUNE_TO: usize = 40_000;

#[derive(Debug, Default)]
pub struct RollingBuffer {
    text: String,
    /// Characters currently held in `text`.
    char_len: usize,
    /// Characters dropped from the front since the stream began.
    start_offset: usize,
}

impl RollingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a token, pruning the front if the window grows past
    /// [`MAX_BUFFER`] characters.
    pub fn push(&mut self, token: &str) {
        self.text.push_str(token);
        self.char_len += token.chars().count();

        if self.char_len > MAX_BUFFER {
            let drop = self.char_len - PRUNE_TO;
            let byte = self.byte_of_char(drop);
            self.text.drain(..byte);
            self.start_offset += drop;
            self.char_len = PRUNE_TO;
        }
    }

    /// Global offset one past the last character ever appended.
    pub fn total_chars(&self) -> usize {
        self.start_offset + self.char_len
    }

    /// Global offset of the first character still in the window.
    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    pub fn len_chars(&self) -> usize {
        self.char_len
    }

    /// The last `chars` characters of the window (or the whole window), with
    /// the global offset of the returned slice's first character.
    pub fn tail_window(&self, chars: usize) -> (&str, usize) {
        if chars >= self.char_len {
            (&self.text, self.start_offset)
        } else {
            let skip = self.char_len - chars;
            let byte = self.byte_of_char(skip);
            (&self.text[byte..], self.start_offset + skip)
        }
    }

    /// The text in global range `[from, to)`, clipped to what the window
    /// still holds. Pre-pruned characters are silently absent.
    pub fn slice_global(&self, from: usize, to: usize) -> &str {
        let from = from.max(self.start_offset);
        let to = to.min(self.total_chars());
        if from >= to {
            return "";
        }
        let lf = self.byte_of_char(from - self.start_offset);
        let lt = self.byte_of_char(to - self.start_offset);
        &self.text[lf..lt]
    }

    fn byte_of_char(&self, n: usize) -> usize {
        self.text
            .char_indices()
            .nth(n)
            .map(|(i, _)| i)
            .unwrap_or(self.text.len())
    }
}
