//! Archive-path helpers.

/// Collapse `.`, `..` and empty segments in a `/`-separated archive path.
///
/// `..` above the archive root is dropped rather than preserved, so the
/// result always names an entry inside the archive.
pub fn normalise_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Directory part of `path` including the trailing slash, or `""`.
pub fn base_dir(path: &str) -> &str {
    path.rfind('/').map(|i| &path[..i + 1]).unwrap_or("")
}

/// Split an href into `(path, fragment)` at the first `#`.
pub fn split_fragment(href: &str) -> (&str, &str) {
    match href.find('#') {
        Some(pos) => (&href[..pos], &href[pos + 1..]),
        None => (href, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_parent_segments() {
        assert_eq!(normalise_path("OEBPS/text/../images/cover.jpg"), "OEBPS/images/cover.jpg");
        assert_eq!(normalise_path("OEBPS/./ch1.xhtml"), "OEBPS/ch1.xhtml");
        assert_eq!(normalise_path("/OEBPS//ch1.xhtml"), "OEBPS/ch1.xhtml");
        assert_eq!(normalise_path("../../etc/passwd"), "etc/passwd");
    }

    #[test]
    fn test_base_dir() {
        assert_eq!(base_dir("OEBPS/content.opf"), "OEBPS/");
        assert_eq!(base_dir("content.opf"), "");
        assert_eq!(base_dir("a/b/nav.xhtml"), "a/b/");
    }

    #[test]
    fn test_split_fragment() {
        assert_eq!(split_fragment("ch1.xhtml#s2"), ("ch1.xhtml", "s2"));
        assert_eq!(split_fragment("ch1.xhtml"), ("ch1.xhtml", ""));
        assert_eq!(split_fragment("ch1.xhtml#"), ("ch1.xhtml", ""));
    }
}
