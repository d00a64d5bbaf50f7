//! Output heuristics for worker sessions.

/// Returns the prompt line when the tail of `output` looks like the
/// process is waiting for keyboard input.
pub fn detect_input_prompt(output: &str) -> Option<String> {
    let last = output.lines().rev().find(|line| !line.trim().is_empty())?;
    let trimmed = last.trim();
    let lower = trimmed.to_ascii_lowercase();

    let choice_prompt = ["(y/n)", "[y/n]", "(yes/no)", "[yes/no]"]
        .iter()
        .any(|marker| lower.contains(marker));
    let keyword_prompt = lower.contains("press enter")
        || lower.contains("press any key")
        || lower.contains("waiting for input")
        || lower.contains("needs_human")
        || lower.contains("[need_human]");
    let question = trimmed.ends_with('?') && trimmed.split_whitespace().count() > 1;
    let bare_caret = trimmed == ">" || trimmed == "?";

    if choice_prompt || keyword_prompt || question || bare_caret {
        Some(trimmed.to_string())
    } else {
        None
    }
}

/// Stable fingerprint of captured output, used to notice activity without
/// keeping whole snapshots around.
pub fn output_fingerprint(output: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    output.hash(&mut hasher);
    hasher.finish()
}
