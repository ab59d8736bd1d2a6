use std::fmt;

#[derive(Debug)]
pub enum FormPressError {
    MissingRoot,
    Raster(String),
    InvalidConfiguration(String),
    Asset(String),
    Encode(String),
    Validation(String),
    NotFound(String),
    Storage(String),
    Io(std::io::Error),
}

impl fmt::Display for FormPressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormPressError::MissingRoot => write!(f, "no root element to rasterize"),
            FormPressError::Raster(message) => write!(f, "rasterization failed: {}", message),
            FormPressError::InvalidConfiguration(message) => {
                write!(f, "invalid configuration: {}", message)
            }
            FormPressError::Asset(message) => write!(f, "asset error: {}", message),
            FormPressError::Encode(message) => write!(f, "encoding failed: {}", message),
            FormPressError::Validation(message) => write!(f, "validation failed: {}", message),
            FormPressError::NotFound(id) => write!(f, "record not found: {}", id),
            FormPressError::Storage(message) => write!(f, "storage error: {}", message),
            FormPressError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for FormPressError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FormPressError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FormPressError {
    fn from(value: std::io::Error) -> Self {
        FormPressError::Io(value)
    }
}

impl From<serde_json::Error> for FormPressError {
    fn from(value: serde_json::Error) -> Self {
        FormPressError::Storage(value.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for FormPressError {
    fn from(value: rust_xlsxwriter::XlsxError) -> Self {
        FormPressError::Encode(format!("xlsx: {}", value))
    }
}
