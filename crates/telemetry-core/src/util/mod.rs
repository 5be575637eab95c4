//! Small cross-cutting helpers.

/// Normalizes a process executable name for matching against the monitored
/// set: strips any file extension and lowercases (spec.md §4.2 — "compared
/// case-insensitively, with file extensions stripped").
pub fn normalize_process_name(name: &str) -> String {
    let base = match name.rsplit_once('.') {
        Some((stem, _ext)) => stem,
        None => name,
    };
    base.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_extension_and_lowercases() {
        assert_eq!(normalize_process_name("SqlServr.EXE"), "sqlservr");
        assert_eq!(normalize_process_name("w3wp.exe"), "w3wp");
        assert_eq!(normalize_process_name("noext"), "noext");
    }
}
