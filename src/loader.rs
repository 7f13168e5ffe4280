//! Multi-format document loading.
//!
//! Converts uploaded file bytes into a sequence of [`RawDocument`]s with
//! provenance metadata. Granularity depends on the format: one document per
//! row (csv, xlsx), per block element (md, docx), or per file (pdf, txt).
//!
//! Loading sits inside background ingestion with no waiting caller, so
//! extraction failures degrade to an empty sequence after logging instead
//! of propagating. The one exception is format dispatch: an unknown type
//! tag fails up front with [`LoadError::UnsupportedFormat`].

use std::io::Read;

use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::models::RawDocument;

/// Closed set of supported upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Spreadsheet,
    DelimitedText,
    Pdf,
    PlainText,
    Markup,
    WordDocument,
}

impl FileKind {
    /// Parse a declared type tag (`"pdf"`, `".csv"`, …).
    pub fn from_tag(tag: &str) -> Result<Self, LoadError> {
        match tag.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "xlsx" => Ok(FileKind::Spreadsheet),
            "csv" => Ok(FileKind::DelimitedText),
            "pdf" => Ok(FileKind::Pdf),
            "txt" => Ok(FileKind::PlainText),
            "md" => Ok(FileKind::Markup),
            "docx" => Ok(FileKind::WordDocument),
            other => Err(LoadError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Infer the kind from a filename extension.
    pub fn from_filename(filename: &str) -> Result<Self, LoadError> {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, e)| e)
            .ok_or_else(|| LoadError::UnsupportedFormat(filename.to_string()))?;
        Self::from_tag(ext)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            FileKind::Spreadsheet => "xlsx",
            FileKind::DelimitedText => "csv",
            FileKind::Pdf => "pdf",
            FileKind::PlainText => "txt",
            FileKind::Markup => "md",
            FileKind::WordDocument => "docx",
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("delimited-text parsing failed: {0}")]
    Csv(String),
    #[error("text decoding failed: {0}")]
    Decode(String),
}

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Cap on sheets processed per workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Cap on cells processed per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;

/// Load `bytes` as `kind`, degrading to an empty sequence on extraction
/// failure. Whitespace-only content yields no documents.
pub fn load_documents(bytes: &[u8], filename: &str, kind: FileKind) -> Vec<RawDocument> {
    match extract(bytes, filename, kind) {
        Ok(docs) => docs,
        Err(e) => {
            warn!(file = filename, kind = kind.tag(), error = %e, "document load failed, yielding no documents");
            Vec::new()
        }
    }
}

fn extract(bytes: &[u8], filename: &str, kind: FileKind) -> Result<Vec<RawDocument>, LoadError> {
    match kind {
        FileKind::Pdf => extract_pdf(bytes, filename),
        FileKind::PlainText => extract_plain_text(bytes, filename),
        FileKind::DelimitedText => extract_csv(bytes, filename),
        FileKind::Markup => extract_markup(bytes, filename),
        FileKind::WordDocument => extract_docx(bytes, filename),
        FileKind::Spreadsheet => extract_xlsx(bytes, filename),
    }
}

// ============ Encoding fallback ============

/// Decode encoding-sensitive content: strict UTF-8 first, then BOM-sniffed
/// UTF-16, then Latin-1 as the terminal fallback. Returns the text and the
/// name of the winning encoding.
fn decode_text(bytes: &[u8]) -> (String, &'static str) {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return (s.to_string(), "utf-8");
    }

    if bytes.len() >= 2 {
        let le = bytes[0] == 0xFF && bytes[1] == 0xFE;
        let be = bytes[0] == 0xFE && bytes[1] == 0xFF;
        if (le || be) && bytes.len() % 2 == 0 {
            let units: Vec<u16> = bytes[2..]
                .chunks_exact(2)
                .map(|pair| {
                    if le {
                        u16::from_le_bytes([pair[0], pair[1]])
                    } else {
                        u16::from_be_bytes([pair[0], pair[1]])
                    }
                })
                .collect();
            if let Ok(s) = String::from_utf16(&units) {
                return (s, if le { "utf-16le" } else { "utf-16be" });
            }
        }
    }

    // Latin-1 maps every byte to a char, so the ladder always terminates.
    let s: String = bytes.iter().map(|&b| b as char).collect();
    (s, "latin-1")
}

// ============ Plain text ============

fn extract_plain_text(bytes: &[u8], filename: &str) -> Result<Vec<RawDocument>, LoadError> {
    let (text, encoding) = decode_text(bytes);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![
        RawDocument::new(text, filename).with_meta("encoding", json!(encoding)),
    ])
}

// ============ Delimited text ============

/// One document per data row: the first record is treated as a header and
/// each row renders as `header: value` lines.
fn extract_csv(bytes: &[u8], filename: &str) -> Result<Vec<RawDocument>, LoadError> {
    let (text, encoding) = decode_text(bytes);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| LoadError::Csv(e.to_string()))?
        .clone();

    let mut docs = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| LoadError::Csv(e.to_string()))?;
        let body = record
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let header = headers.get(i).unwrap_or("");
                format!("{}: {}", header, value)
            })
            .collect::<Vec<_>>()
            .join("\n");
        if body.trim().is_empty() {
            continue;
        }
        docs.push(
            RawDocument::new(body, filename)
                .with_meta("row", json!(row))
                .with_meta("encoding", json!(encoding)),
        );
    }
    Ok(docs)
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8], filename: &str) -> Result<Vec<RawDocument>, LoadError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| LoadError::Pdf(e.to_string()))?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![RawDocument::new(text.trim().to_string(), filename)])
}

// ============ Markup ============

/// One document per block element (heading, paragraph, code block, list
/// item), preserving the element kind in metadata.
fn extract_markup(bytes: &[u8], filename: &str) -> Result<Vec<RawDocument>, LoadError> {
    use pulldown_cmark::{Event, Parser, Tag, TagEnd};

    let text = String::from_utf8_lossy(bytes);
    let mut docs = Vec::new();
    let mut buf = String::new();
    let mut element = "paragraph";

    let flush = |buf: &mut String, element: &str, docs: &mut Vec<RawDocument>| {
        let trimmed = buf.trim();
        if !trimmed.is_empty() {
            docs.push(
                RawDocument::new(trimmed.to_string(), filename)
                    .with_meta("element", json!(element)),
            );
        }
        buf.clear();
    };

    for event in Parser::new(&text) {
        match event {
            Event::Start(Tag::Heading { .. }) => {
                flush(&mut buf, element, &mut docs);
                element = "heading";
            }
            Event::Start(Tag::Paragraph) => {
                flush(&mut buf, element, &mut docs);
                element = "paragraph";
            }
            Event::Start(Tag::CodeBlock(_)) => {
                flush(&mut buf, element, &mut docs);
                element = "code";
            }
            Event::Start(Tag::Item) => {
                flush(&mut buf, element, &mut docs);
                element = "list_item";
            }
            Event::Text(t) | Event::Code(t) => buf.push_str(&t),
            Event::SoftBreak | Event::HardBreak => buf.push(' '),
            Event::End(TagEnd::Heading(_))
            | Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::CodeBlock)
            | Event::End(TagEnd::Item) => {
                flush(&mut buf, element, &mut docs);
            }
            _ => {}
        }
    }
    flush(&mut buf, element, &mut docs);
    Ok(docs)
}

// ============ Word documents ============

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, LoadError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| LoadError::Ooxml(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| LoadError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(LoadError::Ooxml(format!(
            "ZIP entry {} exceeds size limit",
            name
        )));
    }
    Ok(out)
}

/// One document per non-empty `w:p` paragraph of `word/document.xml`.
fn extract_docx(bytes: &[u8], filename: &str) -> Result<Vec<RawDocument>, LoadError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| LoadError::Ooxml(e.to_string()))?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;

    let mut reader = quick_xml::Reader::from_reader(doc_xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_text = false;
    let mut paragraph = String::new();
    let mut docs = Vec::new();
    let mut paragraph_no: usize = 0;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"p" => paragraph.clear(),
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_text => {
                paragraph.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let trimmed = paragraph.trim();
                    if !trimmed.is_empty() {
                        docs.push(
                            RawDocument::new(trimmed.to_string(), filename)
                                .with_meta("paragraph", json!(paragraph_no)),
                        );
                        paragraph_no += 1;
                    }
                    paragraph.clear();
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(LoadError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(docs)
}

// ============ Spreadsheets ============

/// One document per non-empty worksheet row, cells joined with `, `.
fn extract_xlsx(bytes: &[u8], filename: &str) -> Result<Vec<RawDocument>, LoadError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| LoadError::Ooxml(e.to_string()))?;

    let shared_strings = read_shared_strings(&mut archive)?;

    let mut sheet_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    sheet_names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut docs = Vec::new();
    for name in sheet_names.into_iter().take(XLSX_MAX_SHEETS) {
        let sheet = name
            .trim_start_matches("xl/worksheets/")
            .trim_end_matches(".xml")
            .to_string();
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name)?;
        extract_sheet_rows(&sheet_xml, &shared_strings, &sheet, filename, &mut docs)?;
    }
    Ok(docs)
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, LoadError> {
    // A workbook without shared strings is legal (all-numeric cells).
    if !archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;

    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut current = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(LoadError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn extract_sheet_rows(
    xml: &[u8],
    shared_strings: &[String],
    sheet: &str,
    filename: &str,
    docs: &mut Vec<RawDocument>,
) -> Result<(), LoadError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut cell_is_shared = false;
    let mut cells: Vec<String> = Vec::new();
    let mut row_no: usize = 0;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => cells.clear(),
                b"c" => {
                    cell_is_shared = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" => in_value = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_value => {
                let value = te.unescape().unwrap_or_default();
                let value = value.trim();
                if !value.is_empty() {
                    let text = if cell_is_shared {
                        value
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i))
                            .cloned()
                    } else {
                        Some(value.to_string())
                    };
                    if let Some(text) = text {
                        cells.push(text);
                        cell_count += 1;
                    }
                }
                in_value = false;
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"c" => cell_is_shared = false,
                b"row" => {
                    if !cells.is_empty() {
                        docs.push(
                            RawDocument::new(cells.join(", "), filename)
                                .with_meta("sheet", json!(sheet))
                                .with_meta("row", json!(row_no)),
                        );
                    }
                    row_no += 1;
                    cells.clear();
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(LoadError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}
