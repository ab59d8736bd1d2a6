use crate::error::FormPressError;
use crate::types::Pt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use ttf_parser::GlyphId;

// Average advance of Helvetica in em units; used when no outline font is available.
const FALLBACK_ADVANCE_EM: f32 = 0.52;
const FALLBACK_BOLD_ADVANCE_EM: f32 = 0.56;

// AFM advance widths (1/1000 em) for ASCII 32..=126 in the base-14 Helvetica faces.
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '../
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556, // 0..?
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778, // @..O
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556, // P.._
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556, // `..o
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584, // p..~
];

const HELVETICA_BOLD_WIDTHS: [u16; 95] = [
    278, 333, 474, 556, 556, 889, 722, 238, 333, 333, 389, 584, 278, 333, 278, 278, // ' '../
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 333, 333, 584, 584, 584, 611, // 0..?
    975, 722, 722, 722, 722, 667, 611, 778, 722, 278, 556, 722, 611, 833, 722, 778, // @..O
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 333, 278, 333, 584, 556, // P.._
    333, 556, 611, 556, 611, 556, 333, 611, 611, 278, 278, 556, 278, 889, 611, 611, // `..o
    556, 611, 389, 556, 333, 611, 556, 778, 556, 556, 500, 389, 280, 389, 584, // p..~
];
const COURIER_WIDTH: u16 = 600;

/// Fonts available to layout and rasterization. Registered files win; base-14
/// names otherwise resolve to a metric-compatible system face when present.
#[derive(Debug, Default)]
pub(crate) struct FontBook {
    fonts: HashMap<String, Arc<Vec<u8>>>,
    first: Option<Arc<Vec<u8>>>,
    system_fallback: bool,
}

impl FontBook {
    pub fn new(system_fallback: bool) -> Self {
        Self {
            fonts: HashMap::new(),
            first: None,
            system_fallback,
        }
    }

    pub fn register_file(&mut self, path: &Path) -> Result<String, FormPressError> {
        let data = std::fs::read(path)
            .map_err(|err| FormPressError::Asset(format!("{}: {}", path.display(), err)))?;
        self.register_bytes(data, path.file_stem().and_then(|s| s.to_str()))
    }

    pub fn register_bytes(
        &mut self,
        data: Vec<u8>,
        source_name: Option<&str>,
    ) -> Result<String, FormPressError> {
        let face = ttf_parser::Face::parse(&data, 0)
            .map_err(|err| FormPressError::Asset(format!("font parse failed: {}", err)))?;
        let (primary, aliases) = font_names(&face, source_name.unwrap_or("EmbeddedFont"));
        let font = Arc::new(data);
        for name in std::iter::once(&primary).chain(aliases.iter()) {
            self.fonts.insert(normalize_name(name), font.clone());
        }
        if self.first.is_none() {
            self.first = Some(font);
        }
        Ok(primary)
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(font) = self.fonts.get(&normalize_name(name)) {
            return Some(font.clone());
        }
        if let Some(font) = self.first.as_ref() {
            return Some(font.clone());
        }
        if self.system_fallback {
            return resolve_system_font_bytes(name);
        }
        None
    }

    pub fn measure_text_width(&self, font_name: &str, font_size: Pt, text: &str) -> Pt {
        let size = font_size.to_f32().max(0.0);
        if let Some(data) = self.resolve(font_name) {
            if let Some(width) = measure_with_face(&data, size, text) {
                return Pt::from_f32(width);
            }
        }
        let em = if is_bold(font_name) {
            FALLBACK_BOLD_ADVANCE_EM
        } else {
            FALLBACK_ADVANCE_EM
        };
        Pt::from_f32(size * em * text.chars().count() as f32)
    }
}

/// Width of `text` as a PDF viewer lays it out in the base-14 face that
/// `font_name` maps to. Accented Latin letters take their base letter's
/// advance; Times falls back to the Helvetica metrics.
pub(crate) fn base14_text_width(font_name: &str, font_size: Pt, text: &str) -> Pt {
    let lower = font_name.to_ascii_lowercase();
    let table = if is_bold(font_name) {
        &HELVETICA_BOLD_WIDTHS
    } else {
        &HELVETICA_WIDTHS
    };
    let units: u32 = text
        .chars()
        .map(|ch| {
            if lower.starts_with("courier") {
                return COURIER_WIDTH as u32;
            }
            let base = fold_latin1(ch);
            match base as u32 {
                code @ 32..=126 => table[(code - 32) as usize] as u32,
                _ => 556,
            }
        })
        .sum();
    Pt::from_f32(font_size.to_f32() * units as f32 / 1000.0)
}

fn fold_latin1(ch: char) -> char {
    match ch {
        'À'..='Å' => 'A',
        'Ç' => 'C',
        'È'..='Ë' => 'E',
        'Ì'..='Ï' => 'I',
        'Ñ' => 'N',
        'Ò'..='Ö' => 'O',
        'Ù'..='Ü' => 'U',
        'à'..='å' => 'a',
        'ç' => 'c',
        'è'..='ë' => 'e',
        'ì'..='ï' => 'i',
        'ñ' => 'n',
        'ò'..='ö' => 'o',
        'ù'..='ü' => 'u',
        other => other,
    }
}

fn measure_with_face(data: &[u8], size: f32, text: &str) -> Option<f32> {
    let face = ttf_parser::Face::parse(data, 0).ok()?;
    let units = face.units_per_em().max(1) as f32;
    let fallback = face
        .glyph_index(' ')
        .and_then(|id| face.glyph_hor_advance(id))
        .unwrap_or((units * 0.5) as u16) as f32;
    let mut total = 0.0f32;
    for ch in text.chars() {
        let advance = face
            .glyph_index(ch)
            .and_then(|id: GlyphId| face.glyph_hor_advance(id))
            .map(|v| v as f32)
            .unwrap_or(fallback);
        total += advance;
    }
    Some(total / units * size)
}

pub(crate) fn is_bold(font_name: &str) -> bool {
    let lower = font_name.to_ascii_lowercase();
    lower.contains("bold") || lower.contains("black") || lower.contains("heavy")
}

fn font_names(face: &ttf_parser::Face<'_>, source: &str) -> (String, Vec<String>) {
    use ttf_parser::name::name_id;

    let mut family = None;
    let mut full = None;
    let mut post = None;

    for entry in face.names() {
        let Some(name) = entry.to_string() else {
            continue;
        };
        match entry.name_id {
            name_id::TYPOGRAPHIC_FAMILY | name_id::FAMILY => {
                if family.is_none() {
                    family = Some(name);
                }
            }
            name_id::FULL_NAME => {
                if full.is_none() {
                    full = Some(name);
                }
            }
            name_id::POST_SCRIPT_NAME => {
                if post.is_none() {
                    post = Some(name);
                }
            }
            _ => {}
        }
    }

    let primary = post
        .clone()
        .or_else(|| full.clone())
        .or_else(|| family.clone())
        .unwrap_or_else(|| source.to_string());

    let aliases = [family, full, post, Some(source.to_string())]
        .into_iter()
        .flatten()
        .filter(|candidate| *candidate != primary)
        .collect();

    (primary, aliases)
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_ascii_lowercase()
}

static SYSTEM_FONT_CACHE: OnceLock<Mutex<HashMap<String, Option<Arc<Vec<u8>>>>>> = OnceLock::new();

fn resolve_system_font_bytes(font_name: &str) -> Option<Arc<Vec<u8>>> {
    let key = normalize_name(font_name);
    let cache = SYSTEM_FONT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(guard) = cache.lock() {
        if let Some(entry) = guard.get(&key) {
            return entry.clone();
        }
    }
    let loaded = load_system_font(&system_font_file_candidates(font_name));
    if let Ok(mut guard) = cache.lock() {
        guard.insert(key, loaded.clone());
    }
    loaded
}

fn load_system_font(candidates: &[&str]) -> Option<Arc<Vec<u8>>> {
    for dir in system_font_dirs() {
        for path in font_files_under(&dir, 3) {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !candidates.iter().any(|c| c.eq_ignore_ascii_case(file_name)) {
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            if ttf_parser::Face::parse(&bytes, 0).is_ok() {
                return Some(Arc::new(bytes));
            }
        }
    }
    None
}

fn font_files_under(dir: &Path, depth: usize) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if depth > 0 {
                out.extend(font_files_under(&path, depth - 1));
            }
        } else {
            out.push(path);
        }
    }
    out.sort();
    out
}

fn system_font_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    #[cfg(target_os = "windows")]
    {
        dirs.push(PathBuf::from(r"C:\Windows\Fonts"));
    }

    #[cfg(target_os = "linux")]
    {
        dirs.push(PathBuf::from("/usr/share/fonts"));
        dirs.push(PathBuf::from("/usr/local/share/fonts"));
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join(".fonts"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        dirs.push(PathBuf::from("/System/Library/Fonts"));
        dirs.push(PathBuf::from("/Library/Fonts"));
    }

    if let Ok(extra) = std::env::var("FORMPRESS_FONT_DIR") {
        for path in std::env::split_paths(&extra) {
            if !path.as_os_str().is_empty() {
                dirs.push(path);
            }
        }
    }

    dirs
}

fn system_font_file_candidates(font_name: &str) -> Vec<&'static str> {
    if is_bold(font_name) {
        vec![
            "arialbd.ttf",
            "LiberationSans-Bold.ttf",
            "DejaVuSans-Bold.ttf",
            "NotoSans-Bold.ttf",
            "Arial Bold.ttf",
        ]
    } else {
        vec![
            "arial.ttf",
            "LiberationSans-Regular.ttf",
            "DejaVuSans.ttf",
            "NotoSans-Regular.ttf",
            "Arial.ttf",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_metrics_scale_with_size_and_weight() {
        let book = FontBook::new(false);
        let regular = book.measure_text_width("Helvetica", Pt::from_f32(10.0), "abcd");
        let bold = book.measure_text_width("Helvetica-Bold", Pt::from_f32(10.0), "abcd");
        assert_eq!(regular.to_milli_i64(), 20_800);
        assert!(bold > regular);
        let doubled = book.measure_text_width("Helvetica", Pt::from_f32(20.0), "abcd");
        assert_eq!(doubled.to_milli_i64(), 41_600);
    }

    #[test]
    fn base14_widths_follow_afm_metrics() {
        let size = Pt::from_f32(72.0);
        // C A N C E L A D O in Helvetica-Bold: 722+722+722+722+667+611+722+722+778.
        let width = base14_text_width("Helvetica-Bold", size, "CANCELADO");
        assert_eq!(width, Pt::from_f32(72.0 * 6388.0 / 1000.0));
        assert!(base14_text_width("Helvetica", size, "CANCELADO") < width);
        assert_eq!(
            base14_text_width("Helvetica", size, "ação"),
            base14_text_width("Helvetica", size, "acao")
        );
        assert_eq!(
            base14_text_width("Courier", Pt::from_f32(10.0), "abc"),
            Pt::from_f32(18.0)
        );
    }

    #[test]
    fn invalid_font_bytes_are_rejected() {
        let mut book = FontBook::new(false);
        let err = book.register_bytes(vec![0, 1, 2, 3], Some("junk")).unwrap_err();
        assert!(matches!(err, FormPressError::Asset(_)));
        assert!(book.resolve("junk").is_none());
    }

    #[test]
    fn bold_candidates_differ_from_regular() {
        assert_ne!(
            system_font_file_candidates("Helvetica-Bold"),
            system_font_file_candidates("Helvetica")
        );
        assert!(is_bold("Helvetica-Bold"));
        assert!(!is_bold("Helvetica"));
    }
}
