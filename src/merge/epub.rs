//! EPUB 3 deliverable: mimetype, container, OPF, nav.xhtml, toc.ncx, a visible contents page
//! and one XHTML chapter per merged item.

use super::MergedItem;
use crate::render::html_escape;
use std::io::{Seek, Write};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const MIMETYPE: &[u8] = b"application/epub+zip";
const OEBPS_PREFIX: &str = "OEBPS/";
const CONTAINER_XML: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n  <rootfiles>\n    <rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/>\n  </rootfiles>\n</container>";

const CHAPTER_CSS: &str = "body { font-family: serif; line-height: 1.6; }\n\
pre { white-space: pre-wrap; word-wrap: break-word; font-size: 0.85em; }\n\
img { max-width: 100%; height: auto; }\n\
table { border-collapse: collapse; }\n\
th, td { border: 1px solid #999; padding: 0.2em 0.4em; }\n";

#[derive(Debug, Error)]
pub enum EpubError {
    #[error("Cannot write EPUB: collection title is empty.")]
    EmptyTitle,

    #[error("Cannot write EPUB: no items to package.")]
    NoChapters,

    #[error("Failed to write EPUB archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl From<std::io::Error> for EpubError {
    fn from(e: std::io::Error) -> Self {
        EpubError::Zip(zip::result::ZipError::Io(e))
    }
}

/// Package `items` as an EPUB 3 archive into `out`. Output is byte-stable for the same input.
pub fn write_epub<W: Write + Seek>(
    title: &str,
    identifier: &str,
    items: &[MergedItem],
    out: W,
) -> Result<W, EpubError> {
    if title.trim().is_empty() {
        return Err(EpubError::EmptyTitle);
    }
    if items.is_empty() {
        return Err(EpubError::NoChapters);
    }

    let mut zip = ZipWriter::new(out);
    let options_stored = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    // Must be the first entry and uncompressed.
    zip.start_file("mimetype", options_stored)?;
    zip.write_all(MIMETYPE)?;

    zip.start_file("META-INF/container.xml", options)?;
    zip.write_all(CONTAINER_XML)?;

    put(&mut zip, options, "content.opf", &opf(title, identifier, items))?;
    put(&mut zip, options, "nav.xhtml", &nav_xhtml(items))?;
    put(&mut zip, options, "toc.ncx", &ncx(title, identifier, items))?;
    put(&mut zip, options, "style.css", CHAPTER_CSS)?;
    put(&mut zip, options, "toc.xhtml", &toc_page(title, items))?;
    for (i, item) in items.iter().enumerate() {
        put(&mut zip, options, &chapter_name(i), &chapter_xhtml(item))?;
    }

    Ok(zip.finish()?)
}

fn put<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    options: SimpleFileOptions,
    name: &str,
    content: &str,
) -> Result<(), EpubError> {
    zip.start_file(format!("{}{}", OEBPS_PREFIX, name), options)?;
    zip.write_all(content.as_bytes())?;
    Ok(())
}

fn chapter_name(i: usize) -> String {
    format!("chapter-{}.xhtml", i + 1)
}

/// Chapters pointing at remote images need the `remote-resources` manifest property.
fn references_remote_images(body: &str) -> bool {
    body.contains("<img") && (body.contains("src=\"http://") || body.contains("src=\"https://"))
}

fn opf(title: &str, identifier: &str, items: &[MergedItem]) -> String {
    let mut manifest = String::from(
        "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\"/>\n\
         \x20   <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\"/>\n\
         \x20   <item id=\"css\" href=\"style.css\" media-type=\"text/css\"/>\n\
         \x20   <item id=\"toc-page\" href=\"toc.xhtml\" media-type=\"application/xhtml+xml\"/>\n",
    );
    let mut spine = String::from("    <itemref idref=\"toc-page\"/>\n");
    for (i, item) in items.iter().enumerate() {
        let properties = if references_remote_images(&item.body) {
            " properties=\"remote-resources\""
        } else {
            ""
        };
        manifest.push_str(&format!(
            "    <item id=\"chapter-{n}\" href=\"{href}\" media-type=\"application/xhtml+xml\"{properties}/>\n",
            n = i + 1,
            href = chapter_name(i),
        ));
        spine.push_str(&format!("    <itemref idref=\"chapter-{}\"/>\n", i + 1));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="book-id" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="book-id">{id}</dc:identifier>
    <dc:title>{title}</dc:title>
    <dc:language>und</dc:language>
    <meta property="dcterms:modified">2000-01-01T00:00:00Z</meta>
  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine toc="ncx">
{spine}  </spine>
</package>
"#,
        id = xml_escape(identifier),
        title = xml_escape(title),
        manifest = manifest,
        spine = spine,
    )
}

fn nav_xhtml(items: &[MergedItem]) -> String {
    let mut links = String::new();
    for (i, item) in items.iter().enumerate() {
        links.push_str(&format!(
            "      <li><a href=\"{}\">{}</a></li>\n",
            chapter_name(i),
            html_escape(&item.title)
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head>
  <meta charset="UTF-8"/>
  <title>Contents</title>
</head>
<body>
  <nav epub:type="toc">
    <h1>Contents</h1>
    <ol>
{links}    </ol>
  </nav>
</body>
</html>
"#
    )
}

fn toc_page(title: &str, items: &[MergedItem]) -> String {
    let mut entries = String::new();
    let mut current_section: Option<&str> = None;
    for (i, item) in items.iter().enumerate() {
        let section = item.section_label.as_deref();
        if section.is_some() && section != current_section {
            entries.push_str(&format!(
                "    <li class=\"section\">{}</li>\n",
                html_escape(section.unwrap_or_default())
            ));
        }
        current_section = section;
        entries.push_str(&format!(
            "    <li><a href=\"{}\">{}</a></li>\n",
            chapter_name(i),
            html_escape(&item.title)
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
  <meta charset="UTF-8"/>
  <title>{title}</title>
  <link rel="stylesheet" type="text/css" href="style.css"/>
</head>
<body>
  <h1>{title}</h1>
  <ol>
{entries}  </ol>
</body>
</html>
"#,
        title = html_escape(title),
    )
}

fn ncx(title: &str, identifier: &str, items: &[MergedItem]) -> String {
    let mut nav_points = String::new();
    for (i, item) in items.iter().enumerate() {
        nav_points.push_str(&format!(
            r#"    <navPoint id="navpoint-{n}" playOrder="{n}">
      <navLabel><text>{label}</text></navLabel>
      <content src="{src}"/>
    </navPoint>
"#,
            n = i + 1,
            label = xml_escape(&item.title),
            src = chapter_name(i),
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:uid" content="{id}"/>
  </head>
  <docTitle>
    <text>{title}</text>
  </docTitle>
  <navMap>
{nav_points}  </navMap>
</ncx>
"#,
        id = xml_escape(identifier),
        title = xml_escape(title),
    )
}

fn chapter_xhtml(item: &MergedItem) -> String {
    let title = html_escape(&item.title);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
  <meta charset="UTF-8"/>
  <title>{title}</title>
  <link rel="stylesheet" type="text/css" href="style.css"/>
</head>
<body>
<h1>{title}</h1>
{body}
</body>
</html>
"#,
        body = item.body,
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};
    use zip::read::ZipArchive;

    fn items() -> Vec<MergedItem> {
        vec![
            MergedItem {
                original_index: 0,
                title: "One & only".to_string(),
                section_label: Some("Basics".to_string()),
                body: "<p>First.</p>".to_string(),
            },
            MergedItem {
                original_index: 2,
                title: "Three".to_string(),
                section_label: Some("Basics".to_string()),
                body: "<p><img src=\"https://cdn.example.com/a.png\"/></p>".to_string(),
            },
        ]
    }

    fn build() -> Vec<u8> {
        write_epub("Course", "urn:collate:test", &items(), Cursor::new(Vec::new()))
            .unwrap()
            .into_inner()
    }

    fn read_entry(bytes: &[u8], name: &str) -> String {
        let mut zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut entry = zip.by_name(name).unwrap();
        let mut s = String::new();
        entry.read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn archive_has_expected_layout() {
        let bytes = build();
        let mut zip = ZipArchive::new(Cursor::new(&bytes)).unwrap();
        assert_eq!(zip.by_index(0).unwrap().name(), "mimetype");
        let names: Vec<String> = zip.file_names().map(String::from).collect();
        for expected in [
            "META-INF/container.xml",
            "OEBPS/content.opf",
            "OEBPS/nav.xhtml",
            "OEBPS/toc.ncx",
            "OEBPS/toc.xhtml",
            "OEBPS/chapter-1.xhtml",
            "OEBPS/chapter-2.xhtml",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn remote_images_are_declared() {
        let opf = read_entry(&build(), "OEBPS/content.opf");
        assert!(opf.contains(
            "<item id=\"chapter-2\" href=\"chapter-2.xhtml\" media-type=\"application/xhtml+xml\" properties=\"remote-resources\"/>"
        ));
        assert!(opf.contains(
            "<item id=\"chapter-1\" href=\"chapter-1.xhtml\" media-type=\"application/xhtml+xml\"/>"
        ));
    }

    #[test]
    fn titles_are_escaped_and_sections_listed_once() {
        let bytes = build();
        let nav = read_entry(&bytes, "OEBPS/nav.xhtml");
        assert!(nav.contains("One &amp; only"));
        let toc = read_entry(&bytes, "OEBPS/toc.xhtml");
        assert_eq!(toc.matches("class=\"section\"").count(), 1);
    }

    #[test]
    fn output_is_byte_stable() {
        assert_eq!(build(), build());
    }

    #[test]
    fn rejects_empty_input() {
        let err = write_epub("T", "id", &[], Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, EpubError::NoChapters));
        let err = write_epub(" ", "id", &items(), Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, EpubError::EmptyTitle));
    }
}
