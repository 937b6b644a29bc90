//! Basic CLI integration tests.

#![allow(deprecated)] // Command::cargo_bin deprecated for custom build-dir; still works for default

use std::fs::File;
use std::io::Write;
use std::path::Path;

use assert_cmd::Command;
use pretty_assertions::assert_eq;
use zip::write::SimpleFileOptions;

fn write_sample_epub(path: &Path) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    let opts = SimpleFileOptions::default();

    zip.start_file("mimetype", opts).unwrap();
    zip.write_all(b"application/epub+zip").unwrap();

    zip.start_file("META-INF/container.xml", opts).unwrap();
    zip.write_all(
        br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#,
    )
    .unwrap();

    zip.start_file("OEBPS/content.opf", opts).unwrap();
    zip.write_all(
        br#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Sample Book</dc:title><dc:creator>Sample Author</dc:creator>
  </metadata>
  <manifest>
    <item id="ch1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="ch2" href="ch2.xhtml" media-type="application/xhtml+xml"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
  </manifest>
  <spine toc="ncx"><itemref idref="ch1"/><itemref idref="ch2"/></spine>
</package>"#,
    )
    .unwrap();

    zip.start_file("OEBPS/toc.ncx", opts).unwrap();
    zip.write_all(
        br#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1"><navMap>
  <navPoint id="p1"><navLabel><text>Opening</text></navLabel><content src="ch1.xhtml"/></navPoint>
  <navPoint id="p2"><navLabel><text>Closing</text></navLabel><content src="ch2.xhtml#end"/></navPoint>
</navMap></ncx>"#,
    )
    .unwrap();

    for (name, text) in [("OEBPS/ch1.xhtml", "It was a quiet morning."), ("OEBPS/ch2.xhtml", "The end.")] {
        zip.start_file(name, opts).unwrap();
        write!(
            zip,
            r#"<?xml version="1.0"?><html xmlns="http://www.w3.org/1999/xhtml"><body><p>{text}</p></body></html>"#
        )
        .unwrap();
    }
    zip.finish().unwrap();
}

fn epub_index(cache: &Path) -> Command {
    let mut cmd = Command::cargo_bin("epub-index").unwrap();
    cmd.arg("--cache-dir").arg(cache);
    cmd
}

#[test]
fn help_prints_and_exits_success() {
    Command::cargo_bin("epub-index")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn config_show_runs() {
    Command::cargo_bin("epub-index")
        .unwrap()
        .args(["config", "show"])
        .assert()
        .success();
}

#[test]
fn config_show_json_valid() {
    let out = Command::cargo_bin("epub-index")
        .unwrap()
        .args(["config", "show", "--json"])
        .assert()
        .success();
    let stdout = std::str::from_utf8(&out.get_output().stdout).unwrap();
    let v: serde_json::Value = serde_json::from_str(stdout).expect("config show --json should output valid JSON");
    assert!(v["layout"]["viewport_width"].is_number());
}

#[test]
fn index_nonexistent_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = epub_index(dir.path())
        .args(["index", "/nonexistent/file.epub"])
        .assert()
        .failure();
    let stderr = std::str::from_utf8(&out.get_output().stderr).unwrap();
    assert!(stderr.contains("not found"));
}

#[test]
fn index_reports_metadata_json() {
    let dir = tempfile::tempdir().unwrap();
    let book = dir.path().join("sample.epub");
    write_sample_epub(&book);

    let out = epub_index(&dir.path().join("cache"))
        .args(["index", "--json"])
        .arg(&book)
        .assert()
        .success();
    let stdout = std::str::from_utf8(&out.get_output().stdout).unwrap();
    let v: serde_json::Value = serde_json::from_str(stdout).unwrap();
    assert_eq!(v["metadata"]["title"], "Sample Book");
    assert_eq!(v["metadata"]["author"], "Sample Author");
    assert_eq!(v["spine_count"], 2);
    assert_eq!(v["toc_count"], 2);
}

#[test]
fn toc_lists_entries_with_anchors() {
    let dir = tempfile::tempdir().unwrap();
    let book = dir.path().join("sample.epub");
    write_sample_epub(&book);

    let out = epub_index(&dir.path().join("cache"))
        .arg("toc")
        .arg(&book)
        .assert()
        .success();
    let stdout = std::str::from_utf8(&out.get_output().stdout).unwrap();
    assert!(stdout.contains("Opening -> OEBPS/ch1.xhtml (spine 0)"));
    assert!(stdout.contains("Closing -> OEBPS/ch2.xhtml#end (spine 1)"));
}

#[test]
fn page_prints_text_and_saves_position() {
    let dir = tempfile::tempdir().unwrap();
    let book = dir.path().join("sample.epub");
    let cache = dir.path().join("cache");
    write_sample_epub(&book);

    let out = epub_index(&cache)
        .args(["page", "--spine", "1", "--page", "0"])
        .arg(&book)
        .assert()
        .success();
    let stdout = std::str::from_utf8(&out.get_output().stdout).unwrap();
    assert!(stdout.contains("The end."));

    // No --spine: resumes where the last call left off.
    let out = epub_index(&cache)
        .args(["page", "--json"])
        .arg(&book)
        .assert()
        .success();
    let v: serde_json::Value = serde_json::from_str(std::str::from_utf8(&out.get_output().stdout).unwrap()).unwrap();
    assert_eq!(v["spine_index"], 1);
    assert_eq!(v["progress_percent"], 100);
}

#[test]
fn clear_removes_cache() {
    let dir = tempfile::tempdir().unwrap();
    let book = dir.path().join("sample.epub");
    let cache = dir.path().join("cache");
    write_sample_epub(&book);

    epub_index(&cache).arg("index").arg(&book).assert().success();
    assert_eq!(std::fs::read_dir(&cache).unwrap().count(), 1);

    epub_index(&cache).arg("clear").arg(&book).assert().success();
    assert_eq!(std::fs::read_dir(&cache).unwrap().count(), 0);
}
