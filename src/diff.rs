use similar::{Algorithm, ChangeTag};
use std::borrow::Cow;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DiffLine {
    Same(String),
    Removed(String),
    Added(String),
}

/// Line level difference between two texts.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TextDiff {
    pub lines: Vec<DiffLine>,
}

impl TextDiff {
    pub fn compute(old: &str, new: &str) -> Self {
        let old = with_final_newline(old);
        let new = with_final_newline(new);
        let diff = similar::TextDiff::configure()
            .algorithm(Algorithm::Myers)
            .diff_lines(&*old, &*new);

        let lines = diff
            .iter_all_changes()
            .map(|change| {
                let text = change.value().trim_end_matches(['\n', '\r']).to_string();
                match change.tag() {
                    ChangeTag::Equal => DiffLine::Same(text),
                    ChangeTag::Delete => DiffLine::Removed(text),
                    ChangeTag::Insert => DiffLine::Added(text),
                }
            })
            .collect();

        Self { lines }
    }

    pub fn has_changes(&self) -> bool {
        self.lines
            .iter()
            .any(|line| !matches!(line, DiffLine::Same(_)))
    }

    pub fn removed(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                DiffLine::Removed(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn added(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                DiffLine::Added(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Display for TextDiff {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for line in &self.lines {
            match line {
                DiffLine::Same(text) => writeln!(f, " {text}")?,
                DiffLine::Removed(text) => writeln!(f, "-{text}")?,
                DiffLine::Added(text) => writeln!(f, "+{text}")?,
            }
        }
        Ok(())
    }
}

// A missing newline at the end is not a change.
fn with_final_newline(text: &str) -> Cow<'_, str> {
    if text.is_empty() || text.ends_with('\n') {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(format!("{text}\n"))
    }
}
