//! FB2 adapter: section-ordered traversal of FictionBook documents,
//! raw or zip-wrapped (.fb2, .fbz, .fb2.zip).
//!
//! Sections are numbered in document order (`section-N`, 1-based) and the
//! innermost titled section provides the chapter label. Character offsets
//! are cumulative across the whole document and advance by block length
//! with no separator gap.

use std::borrow::Cow;
use std::io::Cursor;
use std::path::Path;

use encoding_rs::{UTF_8, WINDOWS_1251};
use quick_xml::events::{BytesText, Event};
use quick_xml::Reader;

use crate::extract::{extension_of, read_zip_entry, title_from_stem, DocumentAdapter, ExtractionError};
use crate::models::{DocumentBlock, ExtractedDocument, ExtractedMetadata, SourceRef};

pub struct Fb2Adapter;

impl DocumentAdapter for Fb2Adapter {
    fn format(&self) -> &'static str {
        "fb2"
    }

    fn supports(&self, path: &Path, sniff: &[u8]) -> bool {
        match extension_of(path).as_deref() {
            Some("fb2" | "fbz") => return true,
            _ => {}
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".fb2.zip") {
            return true;
        }
        sniff
            .windows(b"<FictionBook".len())
            .any(|w| w == b"<FictionBook")
    }

    fn extract(&self, path: &Path, raw: &[u8]) -> Result<ExtractedDocument, ExtractionError> {
        let parse = |detail: String| ExtractionError::parse("fb2", path, detail);

        let xml_bytes = unwrap_container(raw).map_err(parse)?;
        let xml = decode_xml(&xml_bytes);
        let parsed = parse_fiction_book(xml.as_bytes()).map_err(parse)?;
        if parsed.blocks.is_empty() {
            return Err(parse("no extractable text".to_string()));
        }

        Ok(ExtractedDocument {
            source_path: crate::extract::path_string(path),
            metadata: ExtractedMetadata {
                title: parsed.title.or_else(|| Some(title_from_stem(path))),
                author: parsed.author,
                language: parsed.language,
                format: "fb2".to_string(),
            },
            blocks: parsed.blocks,
        })
    }
}

/// Pull the FB2 XML out of a zip wrapper: first `*.fb2` member, else the
/// first file.
fn unwrap_container(raw: &[u8]) -> Result<Cow<'_, [u8]>, String> {
    if !raw.starts_with(b"PK\x03\x04") {
        return Ok(Cow::Borrowed(raw));
    }
    let mut archive = zip::ZipArchive::new(Cursor::new(raw)).map_err(|e| e.to_string())?;
    let member = archive
        .file_names()
        .find(|n| n.to_lowercase().ends_with(".fb2"))
        .or_else(|| archive.file_names().next())
        .ok_or_else(|| "empty archive".to_string())?
        .to_string();
    read_zip_entry(&mut archive, &member).map(Cow::Owned)
}

/// FB2 files predate UTF-8 ubiquity; honor a cp1251 declaration and fall
/// back to cp1251 when the bytes are not valid UTF-8.
fn decode_xml(raw: &[u8]) -> String {
    let head = String::from_utf8_lossy(&raw[..raw.len().min(200)]).to_lowercase();
    let declared = if head.contains("windows-1251") || head.contains("cp1251") {
        WINDOWS_1251
    } else {
        UTF_8
    };
    let (text, _, had_errors) = declared.decode(raw);
    if had_errors && declared == UTF_8 {
        let (retry, _, _) = WINDOWS_1251.decode(raw);
        return retry.into_owned();
    }
    text.into_owned()
}

fn text_of(t: &BytesText) -> String {
    t.unescape()
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(t.as_ref()).into_owned())
}

#[derive(Default)]
struct ParsedBook {
    title: Option<String>,
    author: Option<String>,
    language: Option<String>,
    blocks: Vec<DocumentBlock>,
}

struct Section {
    n: i64,
    title: Option<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum MetaTarget {
    BookTitle,
    Lang,
    AuthorPart,
}

fn is_paragraph_tag(name: &[u8]) -> bool {
    matches!(name, b"p" | b"subtitle" | b"v")
}

fn is_skipped_tag(name: &[u8]) -> bool {
    matches!(name, b"binary" | b"stylesheet" | b"coverpage")
}

fn parse_fiction_book(xml: &[u8]) -> Result<ParsedBook, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut book = ParsedBook::default();
    let mut authors: Vec<String> = Vec::new();
    let mut author_parts: Vec<String> = Vec::new();
    let mut in_title_info = false;
    let mut in_author = false;
    let mut target: Option<MetaTarget> = None;

    let mut in_body = 0usize;
    let mut skip_depth = 0usize;
    let mut section_counter = 0i64;
    let mut stack: Vec<Section> = Vec::new();
    let mut in_title = false;
    let mut title_buf = String::new();
    let mut para_buf: Option<String> = None;
    let mut running = 0i64;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if is_skipped_tag(name) {
                    skip_depth += 1;
                } else if skip_depth > 0 {
                    // inside a skipped subtree
                } else {
                    match name {
                        b"title-info" => in_title_info = true,
                        b"book-title" if in_title_info => target = Some(MetaTarget::BookTitle),
                        b"lang" if in_title_info => target = Some(MetaTarget::Lang),
                        b"author" if in_title_info => {
                            in_author = true;
                            author_parts.clear();
                        }
                        b"first-name" | b"middle-name" | b"last-name" if in_author => {
                            target = Some(MetaTarget::AuthorPart)
                        }
                        b"body" => in_body += 1,
                        b"section" if in_body > 0 => {
                            section_counter += 1;
                            stack.push(Section {
                                n: section_counter,
                                title: None,
                            });
                        }
                        b"title" if in_body > 0 => {
                            in_title = true;
                            title_buf.clear();
                        }
                        _ if is_paragraph_tag(name) && in_body > 0 => {
                            para_buf = Some(String::new());
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(t)) if skip_depth == 0 => {
                let text = text_of(&t);
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if let Some(kind) = target {
                        match kind {
                            MetaTarget::BookTitle if book.title.is_none() => {
                                book.title = Some(trimmed.to_string())
                            }
                            MetaTarget::Lang if book.language.is_none() => {
                                book.language = Some(trimmed.to_string())
                            }
                            MetaTarget::AuthorPart => author_parts.push(trimmed.to_string()),
                            _ => {}
                        }
                    } else if let Some(p) = para_buf.as_mut() {
                        if !p.is_empty() {
                            p.push(' ');
                        }
                        p.push_str(trimmed);
                    } else if in_title {
                        if !title_buf.is_empty() {
                            title_buf.push(' ');
                        }
                        title_buf.push_str(trimmed);
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if is_skipped_tag(name) {
                    skip_depth = skip_depth.saturating_sub(1);
                } else if skip_depth > 0 {
                    // still skipping
                } else {
                    match name {
                        b"title-info" => in_title_info = false,
                        b"book-title" | b"lang" | b"first-name" | b"middle-name"
                        | b"last-name" => target = None,
                        b"author" if in_author => {
                            in_author = false;
                            if !author_parts.is_empty() {
                                authors.push(author_parts.join(" "));
                            }
                        }
                        b"body" => in_body = in_body.saturating_sub(1),
                        b"section" => {
                            stack.pop();
                        }
                        b"title" if in_body > 0 => {
                            in_title = false;
                            if !title_buf.is_empty() {
                                if let Some(top) = stack.last_mut() {
                                    if top.title.is_none() {
                                        top.title = Some(title_buf.trim().to_string());
                                    }
                                }
                            }
                        }
                        _ if is_paragraph_tag(name) => {
                            if let Some(text) = para_buf.take() {
                                let trimmed = text.trim().to_string();
                                if in_title && !trimmed.is_empty() {
                                    if !title_buf.is_empty() {
                                        title_buf.push(' ');
                                    }
                                    title_buf.push_str(&trimmed);
                                } else if in_body > 0 && !trimmed.is_empty() {
                                    let len = trimmed.chars().count() as i64;
                                    let chapter = stack
                                        .iter()
                                        .rev()
                                        .find_map(|s| s.title.clone());
                                    let item_id =
                                        stack.last().map(|s| format!("section-{}", s.n));
                                    book.blocks.push(DocumentBlock {
                                        text: trimmed,
                                        source: SourceRef {
                                            page: None,
                                            chapter,
                                            item_id,
                                            char_start: Some(running),
                                            char_end: Some(running + len),
                                        },
                                    });
                                    running += len;
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }

    if !authors.is_empty() {
        book.author = Some(authors.join(", "));
    }
    Ok(book)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<FictionBook xmlns="http://www.gribuser.ru/xml/fictionbook/2.0">
  <description>
    <title-info>
      <author><first-name>Иван</first-name><last-name>Петров</last-name></author>
      <author><first-name>Анна</first-name><last-name>Сидорова</last-name></author>
      <book-title>Степная повесть</book-title>
      <annotation><p>Аннотация не входит в текст.</p></annotation>
      <lang>ru</lang>
    </title-info>
  </description>
  <body>
    <section>
      <title><p>Глава первая</p></title>
      <p>Первый абзац.</p>
      <p>Второй абзац.</p>
      <section>
        <title><p>Вложенная часть</p></title>
        <p>Текст вложенной части.</p>
      </section>
      <p>Возврат в первую главу.</p>
    </section>
    <section>
      <p>Абзац без заголовка.</p>
    </section>
  </body>
  <binary id="cover.jpg" content-type="image/jpeg">QkFTRTY0R0FSQkFHRQ==</binary>
</FictionBook>"#;

    #[test]
    fn parses_sections_titles_and_authors() {
        let doc = Fb2Adapter.extract(Path::new("tale.fb2"), SAMPLE.as_bytes()).unwrap();

        assert_eq!(doc.metadata.title.as_deref(), Some("Степная повесть"));
        assert_eq!(doc.metadata.author.as_deref(), Some("Иван Петров, Анна Сидорова"));
        assert_eq!(doc.metadata.language.as_deref(), Some("ru"));

        let texts: Vec<&str> = doc.blocks.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "Первый абзац.",
                "Второй абзац.",
                "Текст вложенной части.",
                "Возврат в первую главу.",
                "Абзац без заголовка.",
            ]
        );

        assert_eq!(doc.blocks[0].source.item_id.as_deref(), Some("section-1"));
        assert_eq!(doc.blocks[0].source.chapter.as_deref(), Some("Глава первая"));
        assert_eq!(doc.blocks[2].source.item_id.as_deref(), Some("section-2"));
        assert_eq!(doc.blocks[2].source.chapter.as_deref(), Some("Вложенная часть"));
        // After the nested section closes, blocks revert to the outer one.
        assert_eq!(doc.blocks[3].source.item_id.as_deref(), Some("section-1"));
        assert_eq!(doc.blocks[4].source.item_id.as_deref(), Some("section-3"));
        assert_eq!(doc.blocks[4].source.chapter, None);
    }

    #[test]
    fn offsets_are_cumulative_without_gaps() {
        let doc = Fb2Adapter.extract(Path::new("tale.fb2"), SAMPLE.as_bytes()).unwrap();
        let mut expected_start = 0i64;
        for block in &doc.blocks {
            assert_eq!(block.source.char_start, Some(expected_start));
            expected_start += block.text.chars().count() as i64;
            assert_eq!(block.source.char_end, Some(expected_start));
        }
    }

    #[test]
    fn annotation_and_binary_are_excluded() {
        let doc = Fb2Adapter.extract(Path::new("tale.fb2"), SAMPLE.as_bytes()).unwrap();
        for block in &doc.blocks {
            assert!(!block.text.contains("Аннотация"));
            assert!(!block.text.contains("QkFTRTY0"));
        }
    }

    #[test]
    fn reads_zip_wrapped_fb2() {
        let mut zw = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zw.start_file("tale.fb2", SimpleFileOptions::default()).unwrap();
        zw.write_all(SAMPLE.as_bytes()).unwrap();
        let raw = zw.finish().unwrap().into_inner();

        let doc = Fb2Adapter.extract(Path::new("tale.fb2.zip"), &raw).unwrap();
        assert_eq!(doc.metadata.title.as_deref(), Some("Степная повесть"));
        assert!(!doc.blocks.is_empty());
    }

    #[test]
    fn decodes_cp1251_declared_xml() {
        let xml = r#"<?xml version="1.0" encoding="windows-1251"?>
<FictionBook><description><title-info>
<book-title>Кодировка</book-title><lang>ru</lang>
</title-info></description>
<body><section><p>Текст в старой кодировке.</p></section></body></FictionBook>"#;
        let (encoded, _, _) = WINDOWS_1251.encode(xml);

        let doc = Fb2Adapter.extract(Path::new("old.fb2"), &encoded).unwrap();
        assert_eq!(doc.metadata.title.as_deref(), Some("Кодировка"));
        assert_eq!(doc.blocks[0].text, "Текст в старой кодировке.");
    }

    #[test]
    fn title_falls_back_to_stem() {
        let xml = r#"<FictionBook><body><section><p>Только текст.</p></section></body></FictionBook>"#;
        let doc = Fb2Adapter
            .extract(Path::new("bezymyannaya_kniga.fb2"), xml.as_bytes())
            .unwrap();
        assert_eq!(doc.metadata.title.as_deref(), Some("Bezymyannaya Kniga"));
    }

    #[test]
    fn supports_extensions_and_magic() {
        let adapter = Fb2Adapter;
        assert!(adapter.supports(Path::new("a.fb2"), b""));
        assert!(adapter.supports(Path::new("a.fbz"), b"PK\x03\x04"));
        assert!(adapter.supports(Path::new("a.fb2.zip"), b"PK\x03\x04"));
        assert!(adapter.supports(Path::new("a.xml"), b"<?xml?><FictionBook>"));
        assert!(!adapter.supports(Path::new("a.xml"), b"<?xml?><other/>"));
    }
}
