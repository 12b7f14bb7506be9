//! Scrolling display for titles wider than the now-playing field.

/// Width of the now-playing field, in characters.
pub const MAX_CHARS: usize = 28;

/// The `MAX_CHARS`-wide window of `title` at scroll position `offset`.
/// Short titles are returned whole; the window wraps back to the start once
/// it reaches the end of the title.
pub fn scroll_title(title: &str, offset: usize) -> String {
    let chars: Vec<char> = title.chars().collect();
    if chars.len() <= MAX_CHARS {
        return title.to_string();
    }
    let positions = chars.len() - MAX_CHARS + 1;
    let start = offset % positions;
    chars[start..start + MAX_CHARS].iter().collect()
}

/// Advances one character per tick through the current title.
#[derive(Debug, Default)]
pub struct TitleTicker {
    title: Option<String>,
    offset: usize,
}

impl TitleTicker {
    pub fn set_title(&mut self, title: Option<String>) {
        self.title = title;
        self.offset = 0;
    }

    pub fn current(&self) -> Option<String> {
        self.title.as_deref().map(|t| scroll_title(t, self.offset))
    }

    /// Next frame, or `None` when there is nothing to scroll.
    pub fn tick(&mut self) -> Option<String> {
        let title = self.title.as_deref()?;
        if title.chars().count() <= MAX_CHARS {
            return None;
        }
        self.offset += 1;
        Some(scroll_title(title, self.offset))
    }
}
