//! Word (.docx) text extraction.
//!
//! A .docx file is a ZIP archive; the body lives in `word/document.xml`.
//! Text runs are `<w:t>` elements inside `<w:p>` paragraphs.

use std::io::{Cursor, Read};

use zip::ZipArchive;

const BODY_PART: &str = "word/document.xml";

/// Extract plain text from a Word document, one line per paragraph.
pub fn extract_text(data: &[u8]) -> Result<String, String> {
    let mut archive =
        ZipArchive::new(Cursor::new(data)).map_err(|e| format!("not a Word archive: {e}"))?;

    let mut xml = String::new();
    archive
        .by_name(BODY_PART)
        .map_err(|_| format!("missing {BODY_PART}"))?
        .read_to_string(&mut xml)
        .map_err(|e| format!("failed to read {BODY_PART}: {e}"))?;

    Ok(body_text(&xml))
}

/// Walk the body XML tag by tag, keeping only run text.
fn body_text(xml: &str) -> String {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Option<String> = None;
    let mut in_run_text = false;
    let mut rest = xml;

    while !rest.is_empty() {
        let Some(lt) = rest.find('<') else {
            if in_run_text && let Some(p) = current.as_mut() {
                p.push_str(&decode_entities(rest));
            }
            break;
        };

        if in_run_text && let Some(p) = current.as_mut() {
            p.push_str(&decode_entities(&rest[..lt]));
        }

        let Some(gt) = rest[lt..].find('>') else {
            break;
        };
        let tag = &rest[lt + 1..lt + gt];
        rest = &rest[lt + gt + 1..];

        let closing = tag.starts_with('/');
        let self_closing = tag.ends_with('/');
        let name = tag
            .trim_start_matches('/')
            .trim_end_matches('/')
            .split_whitespace()
            .next()
            .unwrap_or("");

        match (name, closing) {
            ("w:p", false) => {
                current = Some(String::new());
                if self_closing {
                    current = None;
                }
            }
            ("w:p", true) => {
                if let Some(p) = current.take() {
                    let p = p.trim();
                    if !p.is_empty() {
                        paragraphs.push(p.to_string());
                    }
                }
            }
            ("w:t", false) => in_run_text = !self_closing,
            ("w:t", true) => in_run_text = false,
            ("w:br", false) | ("w:cr", false) => {
                if let Some(p) = current.as_mut() {
                    p.push('\n');
                }
            }
            ("w:tab", false) => {
                if let Some(p) = current.as_mut() {
                    p.push('\t');
                }
            }
            _ => {}
        }
    }

    if let Some(p) = current {
        let p = p.trim();
        if !p.is_empty() {
            paragraphs.push(p.to_string());
        }
    }

    paragraphs.join("\n")
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let decoded = after.find(';').and_then(|semi| {
            let entity = &after[..semi];
            let ch = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, semi))
        });

        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
pub(crate) fn build_docx(document_xml: &str) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file(BODY_PART, SimpleFileOptions::default()).unwrap();
    writer.write_all(document_xml.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_paragraph() {
        let xml = r#"<w:document><w:body><w:p><w:r><w:t>Hello World</w:t></w:r></w:p></w:body></w:document>"#;
        assert_eq!(body_text(xml), "Hello World");
    }

    #[test]
    fn test_paragraphs_become_lines() {
        let xml = r#"<w:body><w:p><w:r><w:t>First</w:t></w:r></w:p><w:p><w:r><w:t xml:space="preserve">Second </w:t><w:t>part</w:t></w:r></w:p></w:body>"#;
        assert_eq!(body_text(xml), "First\nSecond part");
    }

    #[test]
    fn test_entities_decoded() {
        let xml = r#"<w:p><w:r><w:t>A &lt; B &amp; C &#x41;&#66;</w:t></w:r></w:p>"#;
        assert_eq!(body_text(xml), "A < B & C AB");
    }

    #[test]
    fn test_ignores_non_run_text() {
        let xml = r#"<w:p><w:pPr><w:pStyle w:val="Title"/></w:pPr><w:r><w:instrText>PAGE</w:instrText><w:t>Kept</w:t></w:r></w:p>"#;
        assert_eq!(body_text(xml), "Kept");
    }

    #[test]
    fn test_breaks_and_tabs() {
        let xml = r#"<w:p><w:r><w:t>a</w:t><w:tab/><w:t>b</w:t><w:br/><w:t>c</w:t></w:r></w:p>"#;
        assert_eq!(body_text(xml), "a\tb\nc");
    }

    #[test]
    fn test_extract_from_archive() {
        let data = build_docx(r#"<w:document><w:body><w:p><w:r><w:t>From zip</w:t></w:r></w:p></w:body></w:document>"#);
        assert_eq!(extract_text(&data).unwrap(), "From zip");
    }

    #[test]
    fn test_rejects_non_zip() {
        assert!(extract_text(b"plain bytes").is_err());
    }
}
