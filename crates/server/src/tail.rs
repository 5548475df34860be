//! Rolling response tail and code-block extraction.
//!
//! Long responses are never buffered whole: the tail window keeps the last
//! N bytes, which is where the state-relevant code block sits in practice.

/// Bounded rolling window over streamed text.
#[derive(Debug)]
pub struct TailBuffer {
    cap: usize,
    buf: String,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            buf: String::new(),
        }
    }

    pub fn push(&mut self, text: &str) {
        self.buf.push_str(text);
        if self.buf.len() > self.cap {
            let mut cut = self.buf.len() - self.cap;
            // Trim forward to a char boundary so the window never splits a
            // multi-byte character.
            while cut < self.buf.len() && !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }

    pub fn contents(&self) -> &str {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// The last fenced code block in `text`, plus a filepath hint when the
/// fence info string names a file (e.g. ```` ```go add.go ```` or
/// ```` ```src/math/add.go ````).
pub fn extract_code_block(text: &str) -> Option<(String, Option<String>)> {
    let mut search_end = text.len();
    loop {
        let open = text[..search_end].rfind("```")?;
        // `open` may be a closing fence; the block is the last OPENING
        // fence with a matching close after it.
        let after_open = &text[open + 3..];
        let newline = after_open.find('\n')?;
        let info = after_open[..newline].trim();
        let body_start = newline + 1;
        if let Some(close) = after_open[body_start..].find("```") {
            let code = after_open[body_start..body_start + close]
                .trim_end_matches('\n')
                .to_string();
            if code.trim().is_empty() {
                return None;
            }
            return Some((code, filepath_from_info(info)));
        }
        // No closing fence after this marker: it was itself a closer.
        if open == 0 {
            return None;
        }
        search_end = open;
    }
}

/// A fence info token that looks like a filename becomes the filepath hint.
fn filepath_from_info(info: &str) -> Option<String> {
    for token in info.split([' ', ':', '\t']) {
        let token = token.trim();
        if token.len() < 3 || !token.contains('.') {
            continue;
        }
        if token
            .rsplit('.')
            .next()
            .map(|ext| {
                matches!(
                    ext,
                    "go" | "rs" | "py" | "pyi" | "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx"
                        | "mts"
                )
            })
            .unwrap_or(false)
        {
            return Some(token.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_only_the_last_bytes() {
        let mut tail = TailBuffer::new(8);
        tail.push("0123456789");
        assert_eq!(tail.contents(), "23456789");
        tail.push("ab");
        assert_eq!(tail.contents(), "456789ab");
    }

    #[test]
    fn tail_never_splits_multibyte_chars() {
        let mut tail = TailBuffer::new(4);
        tail.push("aéé");
        // é is two bytes; the window trims forward to a boundary.
        assert!(tail.contents().len() <= 4);
        assert!(tail.contents().is_char_boundary(0));
        assert!(tail.contents().ends_with('é'));
    }

    #[test]
    fn extracts_the_last_fenced_block() {
        let text = "First:\n```go\nfunc A() {}\n```\nThen:\n```go\nfunc B() {}\n```\ndone";
        let (code, hint) = extract_code_block(text).unwrap();
        assert_eq!(code, "func B() {}");
        assert_eq!(hint, None);
    }

    #[test]
    fn fence_info_filename_becomes_the_hint() {
        let text = "```go add.go\nfunc Add() {}\n```";
        let (code, hint) = extract_code_block(text).unwrap();
        assert_eq!(code, "func Add() {}");
        assert_eq!(hint.as_deref(), Some("add.go"));
    }

    #[test]
    fn language_only_info_gives_no_hint() {
        let text = "```python\ndef add(a, b):\n    return a + b\n```";
        let (_, hint) = extract_code_block(text).unwrap();
        assert_eq!(hint, None);
    }

    #[test]
    fn no_fence_means_no_block() {
        assert!(extract_code_block("just prose, no code").is_none());
        assert!(extract_code_block("``` \n```").is_none());
    }

    #[test]
    fn unterminated_fence_is_ignored() {
        assert!(extract_code_block("```go\nfunc A() {").is_none());
    }
}
