use crate::error::FormPressError;
use crate::model::{
    Document, Field, FieldKind, FieldValue, Section, SectionLayout, Status, Template, new_id,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field_id: String,
    pub message: String,
}

impl FieldIssue {
    fn new(field_id: &str, message: impl Into<String>) -> Self {
        Self {
            field_id: field_id.to_string(),
            message: message.into(),
        }
    }
}

impl Template {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            title: title.into(),
            sections: Vec::new(),
            is_template: true,
            status: Status::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_section(&mut self, title: impl Into<String>) -> String {
        self.add_section_with_layout(title, SectionLayout::default())
    }

    pub fn add_section_with_layout(
        &mut self,
        title: impl Into<String>,
        layout: SectionLayout,
    ) -> String {
        let id = new_id();
        self.sections.push(Section {
            id: id.clone(),
            title: title.into(),
            order: self.sections.len() as u32,
            fields: Vec::new(),
            layout,
        });
        self.updated_at = Utc::now();
        id
    }

    pub fn section(&self, section_id: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == section_id)
    }

    pub fn add_field(&mut self, section_id: &str, mut field: Field) -> Result<(), FormPressError> {
        if field.id.trim().is_empty() {
            return Err(FormPressError::Validation("field id is empty".to_string()));
        }
        if self.fields().any(|f| f.id == field.id) {
            return Err(FormPressError::Validation(format!(
                "duplicate field id `{}`",
                field.id
            )));
        }
        let section = self
            .sections
            .iter_mut()
            .find(|s| s.id == section_id)
            .ok_or_else(|| FormPressError::NotFound(section_id.to_string()))?;
        field.order = section.fields.len() as u32;
        section.fields.push(field);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn remove_section(&mut self, section_id: &str) -> bool {
        let before = self.sections.len();
        self.sections.retain(|s| s.id != section_id);
        let removed = self.sections.len() != before;
        if removed {
            renumber_sections(&mut self.sections);
            self.updated_at = Utc::now();
        }
        removed
    }

    pub fn remove_field(&mut self, field_id: &str) -> bool {
        for section in &mut self.sections {
            if let Some(idx) = section.fields.iter().position(|f| f.id == field_id) {
                section.fields.remove(idx);
                renumber_fields(&mut section.fields);
                self.updated_at = Utc::now();
                return true;
            }
        }
        false
    }

    pub fn move_section(&mut self, section_id: &str, new_index: usize) -> Result<(), FormPressError> {
        let idx = self
            .sections
            .iter()
            .position(|s| s.id == section_id)
            .ok_or_else(|| FormPressError::NotFound(section_id.to_string()))?;
        let section = self.sections.remove(idx);
        let target = new_index.min(self.sections.len());
        self.sections.insert(target, section);
        renumber_sections(&mut self.sections);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn move_field(
        &mut self,
        section_id: &str,
        field_id: &str,
        new_index: usize,
    ) -> Result<(), FormPressError> {
        let section = self
            .sections
            .iter_mut()
            .find(|s| s.id == section_id)
            .ok_or_else(|| FormPressError::NotFound(section_id.to_string()))?;
        let idx = section
            .fields
            .iter()
            .position(|f| f.id == field_id)
            .ok_or_else(|| FormPressError::NotFound(field_id.to_string()))?;
        let field = section.fields.remove(idx);
        let target = new_index.min(section.fields.len());
        section.fields.insert(target, field);
        renumber_fields(&mut section.fields);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_deleted(&mut self) {
        self.status = Status::Deleted;
        self.updated_at = Utc::now();
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.sections.iter().flat_map(|s| s.fields.iter())
    }

    /// Sections and fields in persisted order, regardless of vector order.
    pub fn ordered_sections(&self) -> Vec<(&Section, Vec<&Field>)> {
        let mut sections: Vec<&Section> = self.sections.iter().collect();
        sections.sort_by_key(|s| s.order);
        sections
            .into_iter()
            .map(|s| {
                let mut fields: Vec<&Field> = s.fields.iter().collect();
                fields.sort_by_key(|f| f.order);
                (s, fields)
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), FormPressError> {
        let mut seen = HashSet::new();
        for field in self.fields() {
            if !seen.insert(field.id.as_str()) {
                return Err(FormPressError::Validation(format!(
                    "duplicate field id `{}`",
                    field.id
                )));
            }
            if field.kind.needs_options() && field.options.is_empty() {
                return Err(FormPressError::Validation(format!(
                    "field `{}` needs at least one option",
                    field.id
                )));
            }
        }
        if !is_strictly_increasing(self.sections.iter().map(|s| s.order)) {
            return Err(FormPressError::Validation(
                "section order numbers are not monotonic".to_string(),
            ));
        }
        for section in &self.sections {
            if !is_strictly_increasing(section.fields.iter().map(|f| f.order)) {
                return Err(FormPressError::Validation(format!(
                    "field order numbers in section `{}` are not monotonic",
                    section.title
                )));
            }
        }
        Ok(())
    }

    pub fn instantiate(&self, title: impl Into<String>) -> Document {
        let mut doc = Document::new(title);
        doc.template_id = Some(self.id.clone());
        doc.values = self
            .fields()
            .map(|f| (f.id.clone(), FieldValue::Empty))
            .collect::<BTreeMap<_, _>>();
        doc
    }

    pub fn validate_values(&self, document: &Document) -> Vec<FieldIssue> {
        let mut issues = Vec::new();
        for field in self.fields() {
            let value = document.value(&field.id);
            if value.is_empty() {
                if field.required {
                    issues.push(FieldIssue::new(&field.id, "campo obrigatório"));
                }
                continue;
            }
            if let Some(message) = check_value(field, value) {
                issues.push(FieldIssue::new(&field.id, message));
            }
        }
        issues
    }
}

fn renumber_sections(sections: &mut [Section]) {
    for (idx, section) in sections.iter_mut().enumerate() {
        section.order = idx as u32;
    }
}

fn renumber_fields(fields: &mut [Field]) {
    for (idx, field) in fields.iter_mut().enumerate() {
        field.order = idx as u32;
    }
}

fn is_strictly_increasing(mut orders: impl Iterator<Item = u32>) -> bool {
    let Some(mut prev) = orders.next() else {
        return true;
    };
    for order in orders {
        if order <= prev {
            return false;
        }
        prev = order;
    }
    true
}

fn check_value(field: &Field, value: &FieldValue) -> Option<String> {
    match (field.kind, value) {
        (FieldKind::Email, FieldValue::Text(text)) => {
            (!looks_like_email(text)).then(|| "e-mail inválido".to_string())
        }
        (FieldKind::Number, FieldValue::Number(n)) => {
            (!n.is_finite()).then(|| "número inválido".to_string())
        }
        (FieldKind::Number, FieldValue::Text(text)) => text
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .is_err()
            .then(|| "número inválido".to_string()),
        (FieldKind::Date, FieldValue::Text(text)) => {
            chrono::NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                .is_err()
                .then(|| "data inválida (AAAA-MM-DD)".to_string())
        }
        (FieldKind::Time, FieldValue::Text(text)) => {
            chrono::NaiveTime::parse_from_str(text.trim(), "%H:%M")
                .is_err()
                .then(|| "hora inválida (HH:MM)".to_string())
        }
        (FieldKind::Select | FieldKind::Radio, FieldValue::Text(text)) => (!field
            .options
            .iter()
            .any(|o| o == text))
        .then(|| format!("opção desconhecida `{}`", text)),
        (FieldKind::CheckboxSet, FieldValue::List(items)) => items
            .iter()
            .find(|item| !field.options.contains(item))
            .map(|item| format!("opção desconhecida `{}`", item)),
        (FieldKind::Signature | FieldKind::Photo, FieldValue::Image(data)) => (!data
            .starts_with("data:image/"))
        .then(|| "imagem deve ser um data URL".to_string()),
        (FieldKind::Location, FieldValue::Location(_)) => None,
        (FieldKind::Text | FieldKind::Textarea, FieldValue::Text(_)) => None,
        _ => Some("tipo de valor incompatível com o campo".to_string()),
    }
}

fn looks_like_email(raw: &str) -> bool {
    let raw = raw.trim();
    let Some((local, domain)) = raw.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain.contains('.')
        && !raw.chars().any(char::is_whitespace)
        && !domain.contains('@')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldKind;

    fn sample_template() -> (Template, String) {
        let mut template = Template::new("Vistoria");
        let section = template.add_section("Dados gerais");
        template
            .add_field(&section, Field::new("nome", FieldKind::Text, "Nome").required())
            .unwrap();
        template
            .add_field(&section, Field::new("email", FieldKind::Email, "E-mail"))
            .unwrap();
        template
            .add_field(
                &section,
                Field::new("itens", FieldKind::CheckboxSet, "Itens").with_options(["a", "b"]),
            )
            .unwrap();
        (template, section)
    }

    #[test]
    fn duplicate_field_ids_are_rejected_across_sections() {
        let (mut template, _) = sample_template();
        let other = template.add_section("Outra");
        let err = template
            .add_field(&other, Field::new("nome", FieldKind::Text, "Nome"))
            .unwrap_err();
        assert!(matches!(err, FormPressError::Validation(_)));
    }

    #[test]
    fn moves_renumber_orders_monotonically() {
        let (mut template, section) = sample_template();
        template.move_field(&section, "itens", 0).unwrap();
        let ids: Vec<&str> = template.sections[0].fields.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["itens", "nome", "email"]);
        let orders: Vec<u32> = template.sections[0].fields.iter().map(|f| f.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);

        let second = template.add_section("Segunda");
        template.move_section(&second, 0).unwrap();
        assert_eq!(template.sections[0].id, second);
        assert_eq!(template.sections[0].order, 0);
        assert_eq!(template.sections[1].order, 1);
        template.validate().unwrap();
    }

    #[test]
    fn validate_catches_missing_options_and_bad_order() {
        let (mut template, section) = sample_template();
        template.sections[0].fields[1].order = 0;
        assert!(template.validate().is_err());
        template.sections[0].fields[1].order = 1;
        template
            .add_field(&section, Field::new("tipo", FieldKind::Select, "Tipo"))
            .unwrap();
        assert!(template.validate().is_err());
    }

    #[test]
    fn instantiate_binds_template_and_empties_values() {
        let (template, _) = sample_template();
        let doc = template.instantiate("Vistoria 01");
        assert_eq!(doc.template_id.as_deref(), Some(template.id.as_str()));
        assert_eq!(doc.values.len(), 3);
        assert!(doc.values.values().all(FieldValue::is_empty));
    }

    #[test]
    fn validate_values_reports_required_and_format_issues() {
        let (template, _) = sample_template();
        let mut doc = template.instantiate("x");
        doc.set_value("email", FieldValue::Text("sem-arroba".into()));
        doc.set_value("itens", FieldValue::List(vec!["a".into(), "z".into()]));
        let issues = template.validate_values(&doc);
        let ids: Vec<&str> = issues.iter().map(|i| i.field_id.as_str()).collect();
        assert_eq!(ids, vec!["nome", "email", "itens"]);

        doc.set_value("nome", FieldValue::Text("Ana".into()));
        doc.set_value("email", FieldValue::Text("ana@example.com".into()));
        doc.set_value("itens", FieldValue::List(vec!["b".into()]));
        assert!(template.validate_values(&doc).is_empty());
    }

    #[test]
    fn date_and_time_formats_are_checked() {
        let mut template = Template::new("t");
        let s = template.add_section("s");
        template.add_field(&s, Field::new("d", FieldKind::Date, "Data")).unwrap();
        template.add_field(&s, Field::new("h", FieldKind::Time, "Hora")).unwrap();
        let mut doc = template.instantiate("x");
        doc.set_value("d", FieldValue::Text("2024-02-30".into()));
        doc.set_value("h", FieldValue::Text("25:00".into()));
        assert_eq!(template.validate_values(&doc).len(), 2);
        doc.set_value("d", FieldValue::Text("2024-02-29".into()));
        doc.set_value("h", FieldValue::Text("08:30".into()));
        assert!(template.validate_values(&doc).is_empty());
    }

    #[test]
    fn mark_deleted_sets_status_flag() {
        let (mut template, _) = sample_template();
        template.mark_deleted();
        assert_eq!(template.status, Status::Deleted);
    }
}
