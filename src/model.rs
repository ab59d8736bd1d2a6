use crate::geolocation::GeoPosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Pdf,
    Word,
    Excel,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Pdf => "pdf",
            ExportFormat::Word => "doc",
            ExportFormat::Excel => "xlsx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Active,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKind {
    Text,
    Email,
    Number,
    Date,
    Time,
    Textarea,
    Select,
    Radio,
    CheckboxSet,
    Signature,
    Photo,
    Location,
}

impl FieldKind {
    pub fn needs_options(self) -> bool {
        matches!(
            self,
            FieldKind::Select | FieldKind::Radio | FieldKind::CheckboxSet
        )
    }

    pub fn holds_image(self) -> bool {
        matches!(self, FieldKind::Signature | FieldKind::Photo)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    List(Vec<String>),
    // base64 data URL (signatures, photos)
    Image(String),
    Location(GeoPosition),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Empty => true,
            FieldValue::Text(text) | FieldValue::Image(text) => text.trim().is_empty(),
            FieldValue::List(items) => items.is_empty(),
            FieldValue::Number(_) | FieldValue::Bool(_) | FieldValue::Location(_) => false,
        }
    }

    /// Plain-text rendering used by the Word and Excel exports.
    pub fn display_text(&self) -> String {
        match self {
            FieldValue::Empty => String::new(),
            FieldValue::Text(text) => text.clone(),
            FieldValue::Number(value) => {
                if value.fract() == 0.0 && value.abs() < 1e15 {
                    format!("{}", *value as i64)
                } else {
                    format!("{}", value)
                }
            }
            FieldValue::Bool(true) => "Sim".to_string(),
            FieldValue::Bool(false) => "Não".to_string(),
            FieldValue::List(items) => items.join(", "),
            FieldValue::Image(_) => "[imagem]".to_string(),
            FieldValue::Location(pos) => pos.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    #[default]
    Left,
    Center,
    Right,
}

impl Align {
    pub fn as_css(self) -> &'static str {
        match self {
            Align::Left => "left",
            Align::Center => "center",
            Align::Right => "right",
        }
    }

    pub fn parse(raw: &str) -> Option<Align> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "left" | "start" => Some(Align::Left),
            "center" | "centre" => Some(Align::Center),
            "right" | "end" => Some(Align::Right),
            _ => None,
        }
    }
}

/// Layout hints a section carries into the print rendering. `padding` and
/// `margin` are multipliers of the base spacing unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionLayout {
    pub align: Align,
    pub width_percent: u8,
    pub padding: u8,
    pub margin: u8,
    pub columns: u8,
}

impl Default for SectionLayout {
    fn default() -> Self {
        Self {
            align: Align::Left,
            width_percent: 100,
            padding: 1,
            margin: 1,
            columns: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldLayout {
    pub align: Align,
    pub width_percent: u8,
}

impl Default for FieldLayout {
    fn default() -> Self {
        Self {
            align: Align::Left,
            width_percent: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: String,
    pub kind: FieldKind,
    pub label: String,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub layout: FieldLayout,
}

impl Field {
    pub fn new(id: impl Into<String>, kind: FieldKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            placeholder: None,
            options: Vec::new(),
            required: false,
            order: 0,
            layout: FieldLayout::default(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub layout: SectionLayout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default = "template_marker")]
    pub is_template: bool,
    #[serde(default)]
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn template_marker() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub values: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub export_format: ExportFormat,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
    #[serde(default)]
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            title: title.into(),
            template_id: None,
            is_template: false,
            values: BTreeMap::new(),
            export_format: ExportFormat::Pdf,
            cancelled: false,
            cancellation_reason: None,
            status: Status::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_value(&mut self, field_id: impl Into<String>, value: FieldValue) {
        self.values.insert(field_id.into(), value);
        self.updated_at = Utc::now();
    }

    pub fn value(&self, field_id: &str) -> &FieldValue {
        static EMPTY: FieldValue = FieldValue::Empty;
        self.values.get(field_id).unwrap_or(&EMPTY)
    }

    pub fn cancel(&mut self, reason: Option<String>) {
        self.cancelled = true;
        self.cancellation_reason = reason.filter(|r| !r.trim().is_empty());
        self.updated_at = Utc::now();
    }
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_value_serializes_with_type_tag() {
        let json = serde_json::to_string(&FieldValue::List(vec!["a".into(), "b".into()])).unwrap();
        assert_eq!(json, r#"{"type":"list","value":["a","b"]}"#);
        let back: FieldValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FieldValue::List(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn cancel_drops_blank_reason() {
        let mut doc = Document::new("Vistoria");
        doc.cancel(Some("   ".to_string()));
        assert!(doc.cancelled);
        assert_eq!(doc.cancellation_reason, None);
    }

    #[test]
    fn display_text_formats_scalars() {
        assert_eq!(FieldValue::Number(3.0).display_text(), "3");
        assert_eq!(FieldValue::Number(2.5).display_text(), "2.5");
        assert_eq!(FieldValue::Bool(true).display_text(), "Sim");
        assert_eq!(
            FieldValue::List(vec!["x".into(), "y".into()]).display_text(),
            "x, y"
        );
    }

    #[test]
    fn template_marker_defaults_to_true() {
        let json = r#"{"id":"t1","title":"T","created_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-01T00:00:00Z"}"#;
        let template: Template = serde_json::from_str(json).unwrap();
        assert!(template.is_template);
        assert_eq!(template.status, Status::Active);
    }
}
