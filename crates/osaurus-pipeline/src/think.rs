//! Demultiplexes `<think>…</think>` spans out of a text stream.
//!
//! Consumers that render reasoning separately (the chat overlay, not the
//! wire APIs) wrap their content stream in a [`ThinkTagFilter`]. Tags match
//! case-insensitively and may arrive split across chunk boundaries; every
//! character is routed to exactly one channel, none are dropped.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// Which output stream a piece of text belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Content,
    Thinking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedText {
    pub route: Route,
    pub text: String,
}

/// Stateful splitter with partial-tag carry-over.
#[derive(Debug, Default)]
pub struct ThinkTagFilter {
    in_think: bool,
    /// Unrouted tail: either empty or a prefix of the tag we are waiting
    /// for, kept until the next chunk settles whether it completes the tag.
    pending: String,
}

impl ThinkTagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the text that can be routed now.
    pub fn push(&mut self, chunk: &str) -> Vec<RoutedText> {
        self.pending.push_str(chunk);
        let mut routed: Vec<RoutedText> = Vec::new();

        loop {
            let tag = if self.in_think { CLOSE_TAG } else { OPEN_TAG };
            match find_ci(&self.pending, tag) {
                Some(pos) => {
                    if pos > 0 {
                        push_routed(&mut routed, self.route(), &self.pending[..pos]);
                    }
                    self.pending.drain(..pos + tag.len());
                    self.in_think = !self.in_think;
                }
                None => {
                    // Keep the longest suffix that could still become the
                    // expected tag; everything before it is settled.
                    let keep = partial_suffix_len(&self.pending, tag);
                    let settled_end = self.pending.len() - keep;
                    if settled_end > 0 {
                        push_routed(&mut routed, self.route(), &self.pending[..settled_end]);
                        self.pending.drain(..settled_end);
                    }
                    break;
                }
            }
        }

        routed
    }

    /// Flush whatever is still held, including a dangling partial tag. Call
    /// once when the stream ends.
    pub fn finish(&mut self) -> Option<RoutedText> {
        if self.pending.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.pending);
        Some(RoutedText {
            route: self.route(),
            text,
        })
    }

    fn route(&self) -> Route {
        if self.in_think {
            Route::Thinking
        } else {
            Route::Content
        }
    }
}

fn push_routed(routed: &mut Vec<RoutedText>, route: Route, text: &str) {
    // Coalesce with the previous piece when the route is unchanged.
    if let Some(last) = routed.last_mut() {
        if last.route == route {
            last.text.push_str(text);
            return;
        }
    }
    routed.push(RoutedText {
        route,
        text: text.to_string(),
    });
}

/// Case-insensitive find for ASCII tags.
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| {
        haystack[i..i + needle.len()]
            .iter()
            .zip(needle)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

/// Length of the longest strict suffix of `text` that is a prefix of `tag`
/// (case-insensitively). Such a suffix may complete into the tag on the
/// next chunk and must not be routed yet.
fn partial_suffix_len(text: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(text.len());
    for len in (1..=max).rev() {
        // Suffixes that split a UTF-8 character cannot be a tag prefix.
        if !text.is_char_boundary(text.len() - len) {
            continue;
        }
        let suffix = &text.as_bytes()[text.len() - len..];
        if suffix
            .iter()
            .zip(tag.as_bytes())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
        {
            return len;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(filter: &mut ThinkTagFilter, chunks: &[&str]) -> Vec<RoutedText> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(filter.push(chunk));
        }
        out.extend(filter.finish());
        out
    }

    fn channel_text(routed: &[RoutedText], route: Route) -> String {
        routed
            .iter()
            .filter(|r| r.route == route)
            .map(|r| r.text.as_str())
            .collect()
    }

    #[test]
    fn splits_single_think_span() {
        let mut f = ThinkTagFilter::new();
        let routed = collect(&mut f, &["before<think>hidden</think>after"]);
        assert_eq!(channel_text(&routed, Route::Content), "beforeafter");
        assert_eq!(channel_text(&routed, Route::Thinking), "hidden");
    }

    #[test]
    fn tags_split_across_chunks() {
        let mut f = ThinkTagFilter::new();
        let routed = collect(&mut f, &["abc<th", "ink>xy", "z</thi", "nk>def"]);
        assert_eq!(channel_text(&routed, Route::Content), "abcdef");
        assert_eq!(channel_text(&routed, Route::Thinking), "xyz");
    }

    #[test]
    fn matching_is_case_insensitive() {
        let mut f = ThinkTagFilter::new();
        let routed = collect(&mut f, &["a<THINK>b</Think>c"]);
        assert_eq!(channel_text(&routed, Route::Content), "ac");
        assert_eq!(channel_text(&routed, Route::Thinking), "b");
    }

    #[test]
    fn lone_angle_bracket_is_not_swallowed() {
        let mut f = ThinkTagFilter::new();
        let routed = collect(&mut f, &["a < b and a<tag>"]);
        assert_eq!(channel_text(&routed, Route::Content), "a < b and a<tag>");
    }

    #[test]
    fn dangling_partial_tag_is_flushed_on_finish() {
        let mut f = ThinkTagFilter::new();
        let routed = collect(&mut f, &["text<thi"]);
        // No character may be dropped, even an incomplete tag.
        assert_eq!(channel_text(&routed, Route::Content), "text<thi");
    }

    #[test]
    fn unterminated_think_routes_rest_to_thinking() {
        let mut f = ThinkTagFilter::new();
        let routed = collect(&mut f, &["a<think>never closed"]);
        assert_eq!(channel_text(&routed, Route::Content), "a");
        assert_eq!(channel_text(&routed, Route::Thinking), "never closed");
    }

    #[test]
    fn every_character_routed_exactly_once() {
        let input = ["x<think>y</think>z<think>w", "</think>", "tail"];
        let mut f = ThinkTagFilter::new();
        let routed = collect(&mut f, &input);
        let total: usize = routed.iter().map(|r| r.text.len()).sum();
        let tags_len = 2 * OPEN_TAG.len() + 2 * CLOSE_TAG.len();
        let input_len: usize = input.iter().map(|s| s.len()).sum();
        assert_eq!(total, input_len - tags_len);
    }

    #[test]
    fn consecutive_spans_toggle_correctly() {
        let mut f = ThinkTagFilter::new();
        let routed = collect(&mut f, &["<think>a</think><think>b</think>c"]);
        assert_eq!(channel_text(&routed, Route::Thinking), "ab");
        assert_eq!(channel_text(&routed, Route::Content), "c");
    }
}
