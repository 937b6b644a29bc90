//! `META-INF/container.xml`: locates the OPF package document.

use std::io;

use crate::error::ParseError;
use crate::xml::{Attrs, SaxHandler, XmlPushParser};

#[derive(Debug, Default)]
struct RootfileFinder {
    full_path: String,
}

impl SaxHandler for RootfileFinder {
    fn start_element(&mut self, name: &str, attrs: &Attrs) {
        if !self.full_path.is_empty() {
            return;
        }
        if name == "rootfile" || name.ends_with(":rootfile") {
            if let Some(path) = attrs.get("full-path") {
                self.full_path = path.to_string();
            }
        }
    }

    fn end_element(&mut self, _name: &str) {}

    fn characters(&mut self, _text: &str) {}
}

/// Extracts the first `<rootfile full-path>`. An empty `full_path` after the
/// whole document was written means the container names no package.
pub struct ContainerParser {
    inner: XmlPushParser<RootfileFinder>,
}

impl ContainerParser {
    pub fn new(total_size: usize) -> Self {
        Self {
            inner: XmlPushParser::new("container.xml", RootfileFinder::default(), total_size),
        }
    }

    pub fn setup(&mut self) -> Result<(), ParseError> {
        self.inner.setup()
    }

    pub fn is_failed(&self) -> bool {
        self.inner.is_failed()
    }

    pub fn full_path(&self) -> &str {
        &self.inner.handler().full_path
    }

    pub fn into_full_path(self) -> String {
        self.inner.into_handler().full_path
    }
}

impl io::Write for ContainerParser {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.inner.feed(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONTAINER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
    <rootfile full-path="OEBPS/other.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

    #[test]
    fn test_first_rootfile_wins() {
        let mut parser = ContainerParser::new(CONTAINER.len());
        parser.setup().unwrap();
        for chunk in CONTAINER.as_bytes().chunks(13) {
            assert_eq!(parser.write(chunk).unwrap(), chunk.len());
        }
        assert_eq!(parser.full_path(), "OEBPS/content.opf");
    }

    #[test]
    fn test_missing_rootfile_leaves_path_empty() {
        let doc = "<container><rootfiles/></container>";
        let mut parser = ContainerParser::new(doc.len());
        parser.setup().unwrap();
        assert_eq!(parser.write(doc.as_bytes()).unwrap(), doc.len());
        assert_eq!(parser.into_full_path(), "");
    }

    #[test]
    fn test_malformed_container_consumes_nothing() {
        let doc = "<container><rootfile full-path=\"x.opf\"";
        let mut parser = ContainerParser::new(doc.len());
        parser.setup().unwrap();
        assert_eq!(parser.write(doc.as_bytes()).unwrap(), 0);
    }
}
