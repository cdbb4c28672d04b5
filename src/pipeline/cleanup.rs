//! Deterministic cleanup of extracted slide text.
//!
//! Applied to every raw extraction before verification, so the verifier
//! and the fallback both see the text that would actually be stored.
//! None of these passes changes wording; they only undo formatting quirks
//! vision models produce despite the prompt.

use once_cell::sync::Lazy;
use regex::Regex;

/// Run every cleanup pass, in order:
///
/// 1. CRLF / CR → LF
/// 2. drop a fence wrapping the whole output (```` ``` ````, ```` ```markdown ````, ```` ```text ````)
/// 3. strip zero-width and other invisible characters
/// 4. replace image embeds with their alt text
/// 5. insert a missing header separator in pipe tables
/// 6. trim trailing whitespace per line
/// 7. collapse runs of blank lines to one
/// 8. trim the whole page
pub fn clean_page_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_outer_fence(&s);
    let s = remove_invisible_chars(&s);
    let s = replace_image_embeds(&s);
    let s = add_missing_table_separator(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim().to_string()
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

static RE_OUTER_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\n(.*?)\n?```$").expect("static regex")
});

fn strip_outer_fence(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{00AD}',
        ],
        "",
    )
}

static RE_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").expect("static regex"));

/// A slide image has no addressable sub-images; keep the description only.
fn replace_image_embeds(input: &str) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let alt = caps[1].trim();
            if alt.is_empty() {
                String::new()
            } else {
                format!("[Image: {alt}]")
            }
        })
        .into_owned()
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|')
        && t.contains('-')
        && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Insert `| --- |…` after a table's first row when the model left it out.
fn add_missing_table_separator(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 2);
    let mut prev_is_row = false;

    for (i, line) in lines.iter().enumerate() {
        out.push((*line).to_string());
        let row = is_table_row(line);
        let starts_table = row && !prev_is_row && !is_separator_row(line);
        if starts_table {
            let next = lines.get(i + 1).copied().unwrap_or("");
            if is_table_row(next) && !is_separator_row(next) {
                let cols = line.trim().matches('|').count().saturating_sub(1).max(1);
                out.push(format!("|{}", " --- |".repeat(cols)));
            }
        }
        prev_is_row = row;
    }
    out.join("\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("static regex"));

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_RUN.replace_all(input, "\n\n").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_outer_fence_with_language() {
        assert_eq!(clean_page_text("```markdown\n# Team\nAda\n```"), "# Team\nAda");
        assert_eq!(clean_page_text("```\nTraction\n```\n"), "Traction");
        assert_eq!(clean_page_text("```text\nTAM $4B\n```"), "TAM $4B");
    }

    #[test]
    fn inner_code_blocks_survive() {
        let input = "Intro\n```\ncode\n```\nOutro";
        assert_eq!(clean_page_text(input), input);
    }

    #[test]
    fn normalises_whitespace() {
        let input = "\r\nTitle   \r\n\r\n\r\n\r\nBody\t\n\n";
        assert_eq!(clean_page_text(input), "Title\n\nBody");
    }

    #[test]
    fn removes_invisible_characters() {
        assert_eq!(clean_page_text("Se\u{200B}ries\u{FEFF} A"), "Series A");
    }

    #[test]
    fn image_embeds_become_descriptions() {
        assert_eq!(
            clean_page_text("![Revenue chart, up and to the right](chart.png)\n![](x)"),
            "[Image: Revenue chart, up and to the right]"
        );
    }

    #[test]
    fn missing_table_separator_inserted_once() {
        let cleaned = clean_page_text("| Year | ARR |\n| 2023 | $1M |\n| 2024 | $3M |");
        let lines: Vec<&str> = cleaned.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "| --- | --- |");

        let proper = "| Year | ARR |\n| --- | --- |\n| 2023 | $1M |";
        assert_eq!(clean_page_text(proper), proper);
    }

    #[test]
    fn refusal_text_is_left_alone() {
        let refusal = "I'm sorry, I can't read this image.";
        assert_eq!(clean_page_text(refusal), refusal);
    }
}
