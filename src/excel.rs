use crate::error::FormPressError;
use crate::model::{Document, Template};
use crate::rasterize::CANCELLED_BANNER_TEXT;
use rust_xlsxwriter::{Color as XlsxColor, Format, Workbook};

pub const EXCEL_HEADER: [&str; 3] = ["Seção", "Campo", "Valor"];

/// One `[section, field label, value]` row per field, in template order.
pub fn sheet_rows(document: &Document, template: &Template) -> Vec<[String; 3]> {
    template
        .ordered_sections()
        .into_iter()
        .flat_map(|(section, fields)| {
            fields.into_iter().map(move |field| {
                [
                    section.title.clone(),
                    field.label.clone(),
                    document.value(&field.id).display_text(),
                ]
            })
        })
        .collect()
}

/// Single-sheet workbook: cancellation status first when applicable, then
/// the bold header and one row per field.
pub fn excel_bytes(document: &Document, template: &Template) -> Result<Vec<u8>, FormPressError> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let alert = Format::new().set_bold().set_font_color(XlsxColor::Red);

    let sheet = workbook.add_worksheet();
    sheet.set_name(sheet_name(&document.title))?;
    sheet.set_column_width(0, 24)?;
    sheet.set_column_width(1, 32)?;
    sheet.set_column_width(2, 48)?;

    let mut row: u32 = 0;
    if document.cancelled {
        sheet.write_string_with_format(row, 0, CANCELLED_BANNER_TEXT, &alert)?;
        if let Some(reason) = document.cancellation_reason.as_deref() {
            sheet.write_string(row, 1, "Motivo")?;
            sheet.write_string(row, 2, reason)?;
        }
        row += 2;
    }

    for (col, title) in EXCEL_HEADER.iter().enumerate() {
        sheet.write_string_with_format(row, col as u16, *title, &bold)?;
    }
    row += 1;

    for cells in sheet_rows(document, template) {
        for (col, cell) in cells.iter().enumerate() {
            sheet.write_string(row, col as u16, cell.as_str())?;
        }
        row += 1;
    }

    Ok(workbook.save_to_buffer()?)
}

// Worksheet names: at most 31 chars, none of []:*?/\ and non-empty.
fn sheet_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\'))
        .take(31)
        .collect();
    let cleaned = cleaned.trim().trim_matches('\'').to_string();
    if cleaned.is_empty() {
        "Documento".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FieldKind, FieldValue};

    #[test]
    fn rows_follow_template_order_with_display_values() {
        let mut template = Template::new("Checklist");
        let first = template.add_section("Equipamento");
        let second = template.add_section("Conclusão");
        template
            .add_field(&second, Field::new("ok", FieldKind::Radio, "Aprovado").with_options(["Sim"]))
            .unwrap();
        template
            .add_field(&first, Field::new("itens", FieldKind::CheckboxSet, "Itens").with_options(["A", "B"]))
            .unwrap();
        let mut document = template.instantiate("Checklist 7");
        document.set_value("itens", FieldValue::List(vec!["A".into(), "B".into()]));
        document.set_value("ok", FieldValue::Bool(true));

        let rows = sheet_rows(&document, &template);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], ["Equipamento".to_string(), "Itens".into(), "A, B".into()]);
        assert_eq!(rows[1][2], "Sim");
    }

    #[test]
    fn workbook_is_a_zip_package() {
        let template = Template::new("T");
        let mut document = template.instantiate("Relatório: [final]");
        document.cancel(Some("duplicado".into()));
        let bytes = excel_bytes(&document, &template).unwrap();
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn sheet_names_are_sanitised() {
        assert_eq!(sheet_name("Relatório: [final]"), "Relatório final");
        assert_eq!(sheet_name("???"), "Documento");
        assert_eq!(sheet_name(&"x".repeat(40)).chars().count(), 31);
    }
}
