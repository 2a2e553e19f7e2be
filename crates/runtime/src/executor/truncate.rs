//! Head-and-tail output capping.

/// Cap `output` at `max_chars` characters.
///
/// Oversized output keeps `floor(max_chars / 2)` leading characters and the
/// remaining budget from the end, joined by an omission marker. Returns the
/// capped text and whether anything was removed.
pub fn cap_output(output: &str, max_chars: usize) -> (String, bool) {
    let total = output.chars().count();
    if total <= max_chars {
        return (output.to_string(), false);
    }

    let head_len = max_chars / 2;
    let tail_len = max_chars - head_len;
    let omitted = total - max_chars;

    let head: String = output.chars().take(head_len).collect();
    let tail: String = output.chars().skip(total - tail_len).collect();
    (
        format!("{head}\n\n[... {omitted} characters omitted ...]\n\n{tail}"),
        true,
    )
}
