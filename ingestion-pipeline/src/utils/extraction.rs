//! File-type specific text extraction.
//!
//! PDF pages are joined with blank lines so the splitter sees page breaks
//! as paragraph boundaries; TXT/MD decode UTF-8 with a GBK fallback for
//! legacy Chinese exports; DOCX pulls non-empty paragraphs out of
//! `word/document.xml`.

use std::io::{Cursor, Read};

use common::error::AppError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, warn};

use crate::failure::{self, tagged};

#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub text: String,
    pub page_count: Option<u32>,
}

/// Extract text from raw bytes by file type (lowercase extension, no dot).
pub fn extract_text(bytes: &[u8], file_type: &str) -> Result<ExtractedText, AppError> {
    match file_type {
        "pdf" => extract_pdf(bytes),
        "txt" | "md" => extract_plain(bytes),
        "docx" => extract_docx(bytes),
        other => Err(tagged(failure::UNSUPPORTED_FILE_TYPE, other)),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedText, AppError> {
    match lopdf::Document::load_mem(bytes) {
        Ok(document) => {
            let pages = document.get_pages();
            let page_count = u32::try_from(pages.len()).ok();

            let mut page_texts = Vec::with_capacity(pages.len());
            for page_number in pages.keys() {
                match document.extract_text(&[*page_number]) {
                    Ok(text) => {
                        let trimmed = text.trim().to_string();
                        if !trimmed.is_empty() {
                            page_texts.push(trimmed);
                        }
                    }
                    Err(err) => {
                        debug!(page = page_number, error = %err, "Page text extraction failed");
                    }
                }
            }

            if page_texts.is_empty() {
                // Scanned or oddly encoded PDFs: try the whole-document path
                let fallback = whole_document_fallback(bytes)?;
                return Ok(ExtractedText {
                    text: fallback,
                    page_count,
                });
            }

            Ok(ExtractedText {
                text: page_texts.join("\n\n"),
                page_count,
            })
        }
        Err(err) => {
            warn!(error = %err, "lopdf failed to parse document, trying pdf-extract");
            let fallback = whole_document_fallback(bytes)?;
            Ok(ExtractedText {
                text: fallback,
                page_count: None,
            })
        }
    }
}

fn whole_document_fallback(bytes: &[u8]) -> Result<String, AppError> {
    pdf_extract::extract_text_from_mem(bytes)
        .map(|text| text.trim().to_string())
        .map_err(|err| tagged(failure::PARSE_FAILED, err))
}

fn extract_plain(bytes: &[u8]) -> Result<ExtractedText, AppError> {
    let text = match std::str::from_utf8(bytes) {
        Ok(utf8) => utf8.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::GBK.decode(bytes);
            debug!("UTF-8 decode failed, used GBK fallback");
            decoded.into_owned()
        }
    };

    Ok(ExtractedText {
        text,
        page_count: None,
    })
}

fn extract_docx(bytes: &[u8]) -> Result<ExtractedText, AppError> {
    let cursor = Cursor::new(bytes);
    let mut archive =
        zip::ZipArchive::new(cursor).map_err(|err| tagged(failure::PARSE_FAILED, err))?;

    let mut document_xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|err| tagged(failure::PARSE_FAILED, err))?
        .read_to_string(&mut document_xml)
        .map_err(|err| tagged(failure::PARSE_FAILED, err))?;

    let mut reader = Reader::from_str(&document_xml);
    reader.config_mut().trim_text(false);

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                if element.name().as_ref() == b"w:t" {
                    in_text_run = true;
                }
            }
            Ok(Event::End(element)) => match element.name().as_ref() {
                b"w:t" => in_text_run = false,
                b"w:p" => {
                    let paragraph = current.trim().to_string();
                    if !paragraph.is_empty() {
                        paragraphs.push(paragraph);
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Text(text)) => {
                if in_text_run {
                    let value = text
                        .unescape()
                        .map_err(|err| tagged(failure::PARSE_FAILED, err))?;
                    current.push_str(&value);
                }
            }
            Ok(Event::Empty(element)) => {
                // Tabs and breaks separate words inside a paragraph
                if matches!(element.name().as_ref(), b"w:tab" | b"w:br") {
                    current.push(' ');
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(tagged(failure::PARSE_FAILED, err)),
            Ok(_) => {}
        }
    }

    Ok(ExtractedText {
        text: paragraphs.join("\n\n"),
        page_count: None,
    })
}
