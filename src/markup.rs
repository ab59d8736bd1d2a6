use crate::model::{Document, Field, FieldValue, Section, Template};
use kuchiki::NodeRef;
use kuchiki::traits::TendrilSink;
use std::fmt::Write as _;

/// Renders a filled document as print markup: one `[data-document]` root,
/// `[data-section]` containers carrying layout hints and `[data-field]`
/// containers holding a label plus the value.
pub fn render_document_html(document: &Document, template: &Template) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "<div data-document=\"{}\" data-template=\"{}\">",
        escape_html(&document.id),
        escape_html(&template.id)
    );
    let _ = write!(out, "<h1>{}</h1>", escape_html(&document.title));
    for (section, fields) in template.ordered_sections() {
        write_section(&mut out, document, section, &fields);
    }
    out.push_str("</div>");
    out
}

/// Parses markup and returns the first `[data-document]` element, if any.
pub fn parse_document_root(html: &str) -> Option<NodeRef> {
    let parsed = kuchiki::parse_html().one(html);
    let root = parsed.select_first("[data-document]").ok()?;
    Some(root.as_node().clone())
}

fn write_section(out: &mut String, document: &Document, section: &Section, fields: &[&Field]) {
    let layout = section.layout;
    let _ = write!(
        out,
        "<section data-section=\"{}\" data-align=\"{}\" data-width=\"{}\" data-padding=\"{}\" data-margin=\"{}\" data-columns=\"{}\">",
        escape_html(&section.id),
        layout.align.as_css(),
        layout.width_percent,
        layout.padding,
        layout.margin,
        layout.columns.max(1)
    );
    let _ = write!(out, "<h2>{}</h2>", escape_html(&section.title));
    for field in fields {
        write_field(out, field, document.value(&field.id));
    }
    out.push_str("</section>");
}

fn write_field(out: &mut String, field: &Field, value: &FieldValue) {
    let kind = serde_json::to_value(field.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let _ = write!(
        out,
        "<div data-field=\"{}\" data-kind=\"{}\" data-width=\"{}\" data-align=\"{}\">",
        escape_html(&field.id),
        kind,
        field.layout.width_percent,
        field.layout.align.as_css()
    );
    let label = if field.required {
        format!("{} *", field.label)
    } else {
        field.label.clone()
    };
    let _ = write!(out, "<label>{}</label>", escape_html(&label));
    match value {
        FieldValue::Image(src) if src.starts_with("data:image/") => {
            let _ = write!(
                out,
                "<img data-value src=\"{}\" alt=\"{}\">",
                escape_html(src),
                escape_html(&field.label)
            );
        }
        other => {
            let _ = write!(
                out,
                "<p data-value>{}</p>",
                escape_html(&other.display_text())
            );
        }
    }
    out.push_str("</div>");
}

pub(crate) fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
