//! Clean generated replies before they are recorded or spoken.

use regex::Regex;

/// Reasoning/internal tags stripped together with their content.
const TAGS_TO_STRIP: &[&str] = &[
    "thinking",
    "think",
    "reflection",
    "reflect",
    "internal",
    "reasoning",
    "thought",
    "scratch",
    "scratchpad",
    "plan",
    "analysis",
];

/// Strip reasoning tags, stray markup and markdown emphasis.
///
/// Line breaks survive (poems keep their lines); runs of spaces collapse
/// and blank lines are limited to one.
pub fn sanitize_reply(reply: &str) -> String {
    let mut result = reply.replace("\r\n", "\n");

    for tag in TAGS_TO_STRIP {
        let pattern = format!(r"(?is)<{tag}[^>]*>.*?</{tag}>", tag = tag);
        if let Ok(re) = Regex::new(&pattern) {
            result = re.replace_all(&result, "").to_string();
        }
    }

    if let Ok(orphan_re) = Regex::new(r"</?[A-Za-z][\w-]*[^>]*>") {
        result = orphan_re.replace_all(&result, "").to_string();
    }

    result = result.replace('*', "");

    if let Ok(space_re) = Regex::new(r"[ \t]+") {
        result = space_re.replace_all(&result, " ").to_string();
    }

    let lines: Vec<&str> = result.lines().map(str::trim).collect();
    let mut cleaned = String::with_capacity(result.len());
    let mut blank_run = 0;
    for line in lines {
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 || cleaned.is_empty() {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !cleaned.is_empty() {
            cleaned.push('\n');
        }
        cleaned.push_str(line);
    }

    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_thinking_tags() {
        let input = "<thinking>Let me think about this...</thinking>The answer is 42.";
        assert_eq!(sanitize_reply(input), "The answer is 42.");
    }

    #[test]
    fn test_sanitize_multiline_tags() {
        let input = "<think>\nMultiple\nlines\nof\nthought\n</think>Final answer here.";
        assert_eq!(sanitize_reply(input), "Final answer here.");
    }

    #[test]
    fn test_sanitize_keeps_poem_lines() {
        let input = "Roses are  red,\n  violets are blue.\n\n\n\nSecond   verse.";
        assert_eq!(
            sanitize_reply(input),
            "Roses are red,\nviolets are blue.\n\nSecond verse."
        );
    }

    #[test]
    fn test_sanitize_markdown_emphasis() {
        assert_eq!(sanitize_reply("I **truly** mean it."), "I truly mean it.");
    }

    #[test]
    fn test_sanitize_nested_content() {
        let output = sanitize_reply("Start <think>nested <inner>tags</inner> content</think> end");
        assert!(!output.contains('<'));
        assert!(!output.contains('>'));
    }

    #[test]
    fn test_sanitize_keeps_comparisons() {
        assert_eq!(sanitize_reply("3 < 5 and 7 > 2"), "3 < 5 and 7 > 2");
    }

    #[test]
    fn test_sanitize_only_tags_is_empty() {
        assert_eq!(sanitize_reply("<reasoning>all hidden</reasoning>"), "");
    }
}
