//! VM name sanitization for safe on-disk layout.

const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
const FALLBACK: &str = "unnamed-vm";
const MAX_BYTES: usize = 255;

/// Sanitize a VM inventory name for use as a filesystem path component.
///
/// Replaces each forbidden character, the substring `..`, and NUL with `-`,
/// trims leading `.`/`-`, falls back to `unnamed-vm` if the result is empty,
/// and truncates to 255 bytes on a UTF-8 boundary. Idempotent: applying it
/// twice yields the same result as applying it once.
pub fn sanitize_vm_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch == '\0' || FORBIDDEN.contains(&ch) {
            out.push('-');
        } else {
            out.push(ch);
        }
    }

    // Collapse any remaining ".." sequences (including ones newly adjacent
    // after NUL/forbidden-char replacement did not itself create them, but a
    // literal ".." in the input must still be neutralized).
    while let Some(idx) = out.find("..") {
        out.replace_range(idx..idx + 2, "--");
    }

    let trimmed = out.trim_start_matches(['.', '-']);
    let mut result = trimmed.to_string();

    if result.is_empty() {
        result = FALLBACK.to_string();
    }

    if result.len() > MAX_BYTES {
        let mut end = MAX_BYTES;
        while !result.is_char_boundary(end) {
            end -= 1;
        }
        result.truncate(end);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_forbidden_characters() {
        let s = sanitize_vm_name("a/b\\c:d*e?f\"g<h>i|j");
        assert!(!s.chars().any(|c| FORBIDDEN.contains(&c)));
    }

    #[test]
    fn neutralizes_path_traversal() {
        let s = sanitize_vm_name("../etc/passwd");
        assert!(!s.contains(".."));
        assert!(!s.is_empty());
    }

    #[test]
    fn falls_back_when_empty() {
        assert_eq!(sanitize_vm_name("..."), FALLBACK);
        assert_eq!(sanitize_vm_name(""), FALLBACK);
        assert_eq!(sanitize_vm_name("---"), FALLBACK);
    }

    #[test]
    fn truncates_to_255_bytes() {
        let long = "a".repeat(400);
        let s = sanitize_vm_name(&long);
        assert!(s.len() <= MAX_BYTES);
    }

    #[test]
    fn is_idempotent() {
        let inputs = ["../etc/passwd", "demo-vm", "a/b:c*d", "...", ""];
        for input in inputs {
            let once = sanitize_vm_name(input);
            let twice = sanitize_vm_name(&once);
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn rejects_nul() {
        let s = sanitize_vm_name("vm\0name");
        assert!(!s.contains('\0'));
    }

    #[test]
    fn preserves_reasonable_names() {
        assert_eq!(sanitize_vm_name("demo"), "demo");
        assert_eq!(sanitize_vm_name("my-vm-01"), "my-vm-01");
    }
}
