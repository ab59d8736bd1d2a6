use crate::markup::escape_html;
use crate::model::{Document, FieldValue, Template};
use crate::rasterize::CANCELLED_BANNER_TEXT;
use std::fmt::Write as _;

const WORD_HEAD: &str = "<html xmlns:o=\"urn:schemas-microsoft-com:office:office\" \
xmlns:w=\"urn:schemas-microsoft-com:office:word\" \
xmlns=\"http://www.w3.org/TR/REC-html40\">";

/// Word-compatible HTML for a filled document. Saved with a `.doc`
/// extension, Word opens it as a regular document.
pub fn render_word_html(document: &Document, template: &Template) -> String {
    let mut out = String::new();
    out.push_str(WORD_HEAD);
    let _ = write!(
        out,
        "<head><meta charset=\"utf-8\"><title>{}</title>\
<!--[if gte mso 9]><xml><w:WordDocument><w:View>Print</w:View></w:WordDocument></xml><![endif]-->\
<style>body{{font-family:Arial,sans-serif;font-size:11pt}}\
table{{border-collapse:collapse;width:100%}}\
td{{border:1px solid #999;padding:4pt;vertical-align:top}}\
td.label{{font-weight:bold;width:35%}}\
.cancel-banner{{border:2pt solid #c00;color:#c00;text-align:center;padding:6pt;margin-bottom:12pt}}</style>\
</head><body>",
        escape_html(&document.title)
    );

    if document.cancelled {
        out.push_str("<div class=\"cancel-banner\">");
        let _ = write!(out, "<p><b>{}</b></p>", CANCELLED_BANNER_TEXT);
        if let Some(reason) = document.cancellation_reason.as_deref() {
            let _ = write!(out, "<p>Motivo: {}</p>", escape_html(reason));
        }
        out.push_str("</div>");
    }

    let _ = write!(out, "<h1>{}</h1>", escape_html(&document.title));
    for (section, fields) in template.ordered_sections() {
        let _ = write!(out, "<h2>{}</h2><table>", escape_html(&section.title));
        for field in fields {
            let value = match document.value(&field.id) {
                FieldValue::Image(src) if src.starts_with("data:image/") => {
                    format!("<img src=\"{}\" width=\"240\">", escape_html(src))
                }
                other => escape_html(&other.display_text()),
            };
            let _ = write!(
                out,
                "<tr><td class=\"label\">{}</td><td>{}</td></tr>",
                escape_html(&field.label),
                value
            );
        }
        out.push_str("</table>");
    }
    out.push_str("</body></html>");
    out
}

/// UTF-8 bytes with a BOM so Word picks the right encoding.
pub fn word_bytes(document: &Document, template: &Template) -> Vec<u8> {
    let html = render_word_html(document, template);
    let mut bytes = Vec::with_capacity(html.len() + 3);
    bytes.extend_from_slice(&[0xEF, 0xBB, 0xBF]);
    bytes.extend_from_slice(html.as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FieldKind};

    fn sample() -> (Template, Document) {
        let mut template = Template::new("Vistoria");
        let section = template.add_section("Dados");
        template
            .add_field(&section, Field::new("nome", FieldKind::Text, "Nome"))
            .unwrap();
        let mut document = template.instantiate("Vistoria <01>");
        document.set_value("nome", FieldValue::Text("Ana & Cia".into()));
        (template, document)
    }

    #[test]
    fn renders_office_namespaces_and_escaped_values() {
        let (template, document) = sample();
        let html = render_word_html(&document, &template);
        assert!(html.starts_with("<html xmlns:o=\"urn:schemas-microsoft-com:office:office\""));
        assert!(html.contains("<td>Ana &amp; Cia</td>"));
        assert!(html.contains("<h1>Vistoria &lt;01&gt;</h1>"));
        assert!(!html.contains(CANCELLED_BANNER_TEXT));
    }

    #[test]
    fn cancelled_documents_carry_the_banner() {
        let (template, mut document) = sample();
        document.cancel(Some("erro de preenchimento".into()));
        let bytes = word_bytes(&document, &template);
        assert_eq!(&bytes[..3], &[0xEF, 0xBB, 0xBF]);
        let html = String::from_utf8(bytes[3..].to_vec()).unwrap();
        assert!(html.contains(CANCELLED_BANNER_TEXT));
        assert!(html.contains("Motivo: erro de preenchimento"));
    }
}
