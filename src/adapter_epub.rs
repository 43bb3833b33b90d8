//! EPUB adapter: OPF-driven spine traversal with NCX chapter labels.
//!
//! The container is resolved the standard way: `META-INF/container.xml`
//! names the OPF package, the OPF manifest maps ids to hrefs, and the spine
//! fixes reading order. Blocks come from heading/paragraph/list/blockquote
//! elements of each XHTML content document; an item without block-level
//! markup contributes its whole body text as one block.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;

use quick_xml::events::{BytesText, Event};
use quick_xml::Reader;
use tracing::warn;

use crate::extract::{extension_of, read_zip_entry, DocumentAdapter, ExtractionError};
use crate::models::{DocumentBlock, ExtractedDocument, ExtractedMetadata, SourceRef};

pub struct EpubAdapter;

impl DocumentAdapter for EpubAdapter {
    fn format(&self) -> &'static str {
        "epub"
    }

    fn supports(&self, path: &Path, sniff: &[u8]) -> bool {
        if extension_of(path).as_deref() == Some("epub") {
            return true;
        }
        sniff.starts_with(b"PK\x03\x04") && contains(sniff, b"mimetypeapplication/epub+zip")
    }

    fn extract(&self, path: &Path, raw: &[u8]) -> Result<ExtractedDocument, ExtractionError> {
        let parse = |detail: String| ExtractionError::parse("epub", path, detail);

        let mut archive =
            zip::ZipArchive::new(Cursor::new(raw)).map_err(|e| parse(e.to_string()))?;

        let container = read_zip_entry(&mut archive, "META-INF/container.xml").map_err(parse)?;
        let opf_path = rootfile_path(&container).ok_or_else(|| {
            parse("container.xml names no rootfile".to_string())
        })?;
        let opf_dir = parent_dir(&opf_path);

        let opf_xml = read_zip_entry(&mut archive, &opf_path).map_err(parse)?;
        let package = parse_opf(&opf_xml).map_err(parse)?;

        let chapter_titles = package
            .ncx_href
            .as_ref()
            .and_then(|href| read_zip_entry(&mut archive, &join_href(&opf_dir, href)).ok())
            .map(|xml| parse_ncx_titles(&xml))
            .unwrap_or_default();

        let mut blocks = Vec::new();
        for idref in &package.spine {
            let Some(item) = package.manifest.get(idref) else {
                warn!(item = %idref, "spine references missing manifest item");
                continue;
            };
            if !item.media_type.contains("html") {
                continue;
            }
            let entry_name = join_href(&opf_dir, &item.href);
            let xml = match read_zip_entry(&mut archive, &entry_name) {
                Ok(xml) => xml,
                Err(detail) => {
                    warn!(item = %idref, %detail, "skipping unreadable spine item");
                    continue;
                }
            };
            let texts = match xhtml_blocks(&xml) {
                Ok(texts) => texts,
                Err(detail) => {
                    warn!(item = %idref, %detail, "skipping malformed spine item");
                    continue;
                }
            };
            let chapter = chapter_titles
                .get(item.href.as_str())
                .cloned()
                .or_else(|| first_line(&texts))
                .unwrap_or_else(|| idref.clone());
            append_item_blocks(&mut blocks, idref, &chapter, &texts);
        }

        if blocks.is_empty() {
            return Err(parse("no extractable text".to_string()));
        }

        let author = package.authors_joined();
        Ok(ExtractedDocument {
            source_path: crate::extract::path_string(path),
            metadata: ExtractedMetadata {
                title: package.title,
                author,
                language: package.language,
                format: "epub".to_string(),
            },
            blocks,
        })
    }
}

/// Per-item offsets restart at 0 and advance by block length + 1.
fn append_item_blocks(blocks: &mut Vec<DocumentBlock>, item_id: &str, chapter: &str, texts: &[String]) {
    let mut offset = 0i64;
    for text in texts {
        let len = text.chars().count() as i64;
        blocks.push(DocumentBlock {
            text: text.clone(),
            source: SourceRef {
                page: None,
                chapter: Some(chapter.to_string()),
                item_id: Some(item_id.to_string()),
                char_start: Some(offset),
                char_end: Some(offset + len),
            },
        });
        offset += len + 1;
    }
}

fn first_line(texts: &[String]) -> Option<String> {
    texts
        .first()
        .and_then(|t| t.lines().next())
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

fn join_href(dir: &str, href: &str) -> String {
    let href = href.trim_start_matches("./");
    if dir.is_empty() {
        href.to_string()
    } else {
        format!("{dir}/{href}")
    }
}

fn text_of(t: &BytesText) -> String {
    t.unescape()
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(t.as_ref()).into_owned())
}

fn attribute(e: &quick_xml::events::BytesStart, key: &[u8]) -> Option<String> {
    e.attributes().filter_map(|a| a.ok()).find_map(|a| {
        (a.key.as_ref() == key).then(|| String::from_utf8_lossy(&a.value).into_owned())
    })
}

/// `full-path` of the first rootfile in container.xml.
fn rootfile_path(xml: &[u8]) -> Option<String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"rootfile" {
                    if let Some(path) = attribute(&e, b"full-path") {
                        return Some(path);
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

struct ManifestItem {
    href: String,
    media_type: String,
}

struct OpfPackage {
    title: Option<String>,
    creators: Vec<String>,
    language: Option<String>,
    manifest: HashMap<String, ManifestItem>,
    spine: Vec<String>,
    ncx_href: Option<String>,
}

impl OpfPackage {
    fn authors_joined(&self) -> Option<String> {
        if self.creators.is_empty() {
            None
        } else {
            Some(self.creators.join(", "))
        }
    }
}

fn parse_opf(xml: &[u8]) -> Result<OpfPackage, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut package = OpfPackage {
        title: None,
        creators: Vec::new(),
        language: None,
        manifest: HashMap::new(),
        spine: Vec::new(),
        ncx_href: None,
    };
    let mut in_metadata = false;
    let mut pending_dc: Option<&'static str> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"metadata" => in_metadata = true,
                b"title" if in_metadata => pending_dc = Some("title"),
                b"creator" if in_metadata => pending_dc = Some("creator"),
                b"language" if in_metadata => pending_dc = Some("language"),
                b"item" => {
                    let id = attribute(&e, b"id");
                    let href = attribute(&e, b"href");
                    let media_type = attribute(&e, b"media-type").unwrap_or_default();
                    if let (Some(id), Some(href)) = (id, href) {
                        if media_type == "application/x-dtbncx+xml" {
                            package.ncx_href = Some(href.clone());
                        }
                        package.manifest.insert(id, ManifestItem { href, media_type });
                    }
                }
                b"itemref" => {
                    if let Some(idref) = attribute(&e, b"idref") {
                        package.spine.push(idref);
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if let Some(kind) = pending_dc.take() {
                    let value = text_of(&t).trim().to_string();
                    if !value.is_empty() {
                        match kind {
                            "title" if package.title.is_none() => package.title = Some(value),
                            "creator" => package.creators.push(value),
                            "language" if package.language.is_none() => {
                                package.language = Some(value)
                            }
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"metadata" => in_metadata = false,
                b"title" | b"creator" | b"language" => pending_dc = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }

    if package.spine.is_empty() {
        return Err("OPF spine is empty".to_string());
    }
    Ok(package)
}

/// navPoint labels keyed by content src (fragment stripped).
fn parse_ncx_titles(xml: &[u8]) -> HashMap<String, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut titles = HashMap::new();
    let mut in_label_text = false;
    let mut pending_label: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"text" => in_label_text = true,
                b"content" => {
                    if let (Some(label), Some(src)) = (pending_label.take(), attribute(&e, b"src"))
                    {
                        let key = src.split('#').next().unwrap_or(&src).to_string();
                        titles.entry(key).or_insert(label);
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) if in_label_text => {
                let label = text_of(&t).trim().to_string();
                if !label.is_empty() {
                    pending_label = Some(label);
                }
                in_label_text = false;
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"text" {
                    in_label_text = false;
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    titles
}

const BLOCK_TAGS: [&[u8]; 9] = [
    b"h1", b"h2", b"h3", b"h4", b"h5", b"h6", b"p", b"li", b"blockquote",
];

fn is_block_tag(name: &[u8]) -> bool {
    BLOCK_TAGS.contains(&name)
}

fn is_skipped_tag(name: &[u8]) -> bool {
    matches!(name, b"head" | b"script" | b"style")
}

/// Text blocks of one XHTML document. Block-level tags flush the running
/// buffer; a document without block markup yields its whole body text.
fn xhtml_blocks(xml: &[u8]) -> Result<Vec<String>, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut skip_depth = 0usize;

    let flush = |current: &mut String, blocks: &mut Vec<String>| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            blocks.push(trimmed.to_string());
        }
        current.clear();
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                if is_skipped_tag(name.as_ref()) {
                    skip_depth += 1;
                } else if is_block_tag(name.as_ref()) {
                    flush(&mut current, &mut blocks);
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if is_skipped_tag(name.as_ref()) {
                    skip_depth = skip_depth.saturating_sub(1);
                } else if is_block_tag(name.as_ref()) {
                    flush(&mut current, &mut blocks);
                }
            }
            Ok(Event::Text(t)) if skip_depth == 0 => {
                let text = text_of(&t);
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if !current.is_empty() {
                        current.push(' ');
                    }
                    current.push_str(trimmed);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    flush(&mut current, &mut blocks);
    Ok(blocks)
}
