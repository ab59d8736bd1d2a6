use crate::canvas::{Canvas, Page};
use crate::font::FontBook;
use crate::model::Align;
use crate::raster::parse_data_uri;
use crate::types::{Color, EdgeSizes, Pt, Rect, Size};
use image::GenericImageView;
use kuchiki::NodeRef;
use lightningcss::properties::Property;
use lightningcss::properties::align::GapValue;
use lightningcss::properties::custom::{CustomPropertyName, Token, TokenOrValue};
use lightningcss::properties::font::{AbsoluteFontSize, FontSize};
use lightningcss::properties::size::Size as CssSize;
use lightningcss::properties::text::TextAlign;
use lightningcss::stylesheet::{ParserOptions, PrinterOptions, StyleAttribute};
use lightningcss::traits::ToCss;
use lightningcss::values::color::{CssColor, SRGB};
use lightningcss::values::length::{LengthPercentage, LengthPercentageOrAuto, LengthValue};

const LINE_HEIGHT: f32 = 1.35;
const MAX_IMAGE_HEIGHT_PT: f32 = 240.0;

/// Viewport the snapshot is laid out into.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LayoutSettings {
    pub width: Pt,
    pub gutter: Pt,
    pub font_size: Pt,
}

/// One tall page of drawing commands and the size it covers.
#[derive(Debug, Clone)]
pub(crate) struct LaidOut {
    pub page: Page,
    pub size: Size,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Length {
    Abs(Pt),
    // Fraction of the containing width (0.5 == 50%).
    Percent(f32),
}

impl Length {
    fn resolve(self, container: Pt) -> Pt {
        match self {
            Length::Abs(value) => value,
            Length::Percent(fraction) => container * fraction,
        }
    }
}

#[derive(Debug, Clone)]
struct BoxStyle {
    font_size: Pt,
    bold: bool,
    color: Color,
    text_align: Align,
    background: Option<Color>,
    padding: EdgeSizes,
    margin_top: Pt,
    margin_bottom: Pt,
    // None means `auto`.
    margin_left: Option<Pt>,
    margin_right: Option<Pt>,
    width: Option<Length>,
    column_count: u32,
    column_gap: Pt,
    hidden: bool,
}

impl BoxStyle {
    fn root(font_size: Pt) -> Self {
        Self {
            font_size,
            bold: false,
            color: Color::BLACK,
            text_align: Align::Left,
            background: None,
            padding: EdgeSizes::zero(),
            margin_top: Pt::ZERO,
            margin_bottom: Pt::ZERO,
            margin_left: Some(Pt::ZERO),
            margin_right: Some(Pt::ZERO),
            width: None,
            column_count: 1,
            column_gap: Pt::from_px(16.0),
            hidden: false,
        }
    }

    fn inherit(&self) -> Self {
        Self {
            font_size: self.font_size,
            bold: self.bold,
            color: self.color,
            text_align: self.text_align,
            ..Self::root(self.font_size)
        }
    }

    fn font_name(&self, bold: bool) -> &'static str {
        if bold || self.bold {
            "Helvetica-Bold"
        } else {
            "Helvetica"
        }
    }
}

#[derive(Debug, Clone)]
enum Fragment {
    Fill(Rect, Color),
    Text {
        x: Pt,
        y: Pt,
        text: String,
        font: &'static str,
        size: Pt,
        color: Color,
    },
    Image(Rect, String),
}

#[derive(Debug, Clone)]
enum InlineItem {
    Word { text: String, bold: bool },
    Break,
}

/// Lays the element tree out top to bottom and records it as canvas commands.
pub(crate) fn layout_tree(root: &NodeRef, settings: &LayoutSettings, fonts: &FontBook) -> LaidOut {
    let mut engine = LayoutEngine {
        fonts,
        fragments: Vec::new(),
    };
    let base = BoxStyle::root(settings.font_size);
    let inner_width = (settings.width - settings.gutter - settings.gutter).max(Pt::from_f32(1.0));
    let content_height = engine.layout_block(root, &base, settings.gutter, settings.gutter, inner_width);
    let height = (content_height + settings.gutter + settings.gutter).max(Pt::from_f32(1.0));
    let size = Size {
        width: settings.width,
        height,
    };

    let mut canvas = Canvas::new(size);
    for fragment in engine.fragments.into_iter().flatten() {
        match fragment {
            Fragment::Fill(rect, color) => {
                canvas.set_fill_color(color);
                canvas.draw_rect(rect);
            }
            Fragment::Text {
                x,
                y,
                text,
                font,
                size,
                color,
            } => {
                canvas.set_fill_color(color);
                canvas.set_font_name(font);
                canvas.set_font_size(size);
                canvas.draw_string(x, y, text);
            }
            Fragment::Image(rect, source) => canvas.draw_image(rect, source),
        }
    }
    let mut document = canvas.finish();
    let page = document.pages.pop().unwrap_or_default();
    LaidOut { page, size }
}

struct LayoutEngine<'a> {
    fonts: &'a FontBook,
    // Slots are reserved before children so backgrounds paint underneath.
    fragments: Vec<Option<Fragment>>,
}

impl LayoutEngine<'_> {
    /// Returns the outer (margin box) height consumed at `y`.
    fn layout_block(&mut self, node: &NodeRef, parent: &BoxStyle, x: Pt, y: Pt, avail: Pt) -> Pt {
        let Some(element) = node.as_element() else {
            return Pt::ZERO;
        };
        let tag = element.name.local.as_ref().to_ascii_lowercase();
        let mut style = parent.inherit();
        apply_tag_defaults(&tag, &mut style);
        if let Some(inline) = element.attributes.borrow().get("style") {
            apply_inline_style(&mut style, inline);
        }
        if style.hidden {
            return Pt::ZERO;
        }

        let fixed_left = style.margin_left.unwrap_or(Pt::ZERO);
        let fixed_right = style.margin_right.unwrap_or(Pt::ZERO);
        let room = (avail - fixed_left - fixed_right).max(Pt::ZERO);
        let box_width = style
            .width
            .map(|w| w.resolve(avail).min(room))
            .unwrap_or(room);
        let slack = (room - box_width).max(Pt::ZERO);
        let box_x = match (style.margin_left, style.margin_right) {
            (None, None) => x + fixed_left + slack / 2,
            (None, Some(_)) => x + slack + fixed_left,
            _ => x + fixed_left,
        };

        let top = y + style.margin_top;
        let content_x = box_x + style.padding.left;
        let content_y = top + style.padding.top;
        let content_width = (box_width - style.padding.horizontal()).max(Pt::ZERO);

        let background_slot = self.fragments.len();
        self.fragments.push(None);

        let content_height = if tag == "img" {
            let src = element
                .attributes
                .borrow()
                .get("src")
                .map(str::to_string)
                .unwrap_or_default();
            self.layout_image(&src, &style, parent.text_align, content_x, content_y, content_width)
        } else {
            self.layout_children(node, &style, content_x, content_y, content_width)
        };

        let box_height = content_height + style.padding.vertical();
        if let Some(color) = style.background {
            self.fragments[background_slot] = Some(Fragment::Fill(
                Rect {
                    x: box_x,
                    y: top,
                    width: box_width,
                    height: box_height,
                },
                color,
            ));
        }
        style.margin_top + box_height + style.margin_bottom
    }

    fn layout_children(&mut self, node: &NodeRef, style: &BoxStyle, x: Pt, y: Pt, width: Pt) -> Pt {
        let mut cursor = y;
        let mut inline: Vec<InlineItem> = Vec::new();
        let mut cells: Vec<NodeRef> = Vec::new();
        let columns = style.column_count.max(1);

        for child in node.children() {
            if child.as_text().is_some() || is_inline(&child) {
                collect_inline(&child, false, &mut inline);
                continue;
            }
            if child.as_element().is_none() {
                continue;
            }
            cursor += self.flush_inline(&mut inline, style, x, cursor, width);
            if columns > 1 && !is_heading(&child) {
                cells.push(child);
                continue;
            }
            cursor += self.flush_cells(&mut cells, style, columns, x, cursor, width);
            cursor += self.layout_block(&child, style, x, cursor, width);
        }
        cursor += self.flush_inline(&mut inline, style, x, cursor, width);
        cursor += self.flush_cells(&mut cells, style, columns, x, cursor, width);
        cursor - y
    }

    /// Places cells left to right, `columns` per row; each row is as tall as
    /// its tallest cell.
    fn flush_cells(
        &mut self,
        cells: &mut Vec<NodeRef>,
        style: &BoxStyle,
        columns: u32,
        x: Pt,
        y: Pt,
        width: Pt,
    ) -> Pt {
        if cells.is_empty() {
            return Pt::ZERO;
        }
        let gap = style.column_gap;
        let gaps = gap * (columns - 1) as f32;
        let column_width = ((width - gaps) / columns as i32).max(Pt::ZERO);
        let mut cursor = y;
        for row in cells.chunks(columns as usize) {
            let mut row_height = Pt::ZERO;
            for (index, cell) in row.iter().enumerate() {
                let cell_x = x + (column_width + gap) * index as f32;
                let height = self.layout_block(cell, style, cell_x, cursor, column_width);
                row_height = row_height.max(height);
            }
            cursor += row_height;
        }
        cells.clear();
        cursor - y
    }

    fn flush_inline(
        &mut self,
        items: &mut Vec<InlineItem>,
        style: &BoxStyle,
        x: Pt,
        y: Pt,
        width: Pt,
    ) -> Pt {
        if items.is_empty() {
            return Pt::ZERO;
        }
        let lines = self.break_lines(items, style, width);
        items.clear();
        let line_height = style.font_size * LINE_HEIGHT;
        let space = self
            .fonts
            .measure_text_width(style.font_name(false), style.font_size, " ");
        let mut cursor = y;
        for line in lines {
            let runs = merge_runs(&line);
            let widths: Vec<Pt> = runs
                .iter()
                .map(|(text, bold)| {
                    self.fonts
                        .measure_text_width(style.font_name(*bold), style.font_size, text)
                })
                .collect();
            let mut line_width = widths.iter().fold(Pt::ZERO, |acc, w| acc + *w);
            if runs.len() > 1 {
                line_width += space * (runs.len() - 1) as f32;
            }
            let slack = (width - line_width).max(Pt::ZERO);
            let mut pen = match style.text_align {
                Align::Left => x,
                Align::Center => x + slack / 2,
                Align::Right => x + slack,
            };
            let text_top = cursor + (line_height - style.font_size) / 2 - style.font_size * 0.1;
            for ((text, bold), run_width) in runs.into_iter().zip(widths) {
                self.fragments.push(Some(Fragment::Text {
                    x: pen,
                    y: text_top,
                    text,
                    font: style.font_name(bold),
                    size: style.font_size,
                    color: style.color,
                }));
                pen += run_width + space;
            }
            cursor += line_height;
        }
        cursor - y
    }

    fn break_lines(
        &self,
        items: &[InlineItem],
        style: &BoxStyle,
        width: Pt,
    ) -> Vec<Vec<(String, bool)>> {
        let space = self
            .fonts
            .measure_text_width(style.font_name(false), style.font_size, " ");
        let mut lines: Vec<Vec<(String, bool)>> = Vec::new();
        let mut line: Vec<(String, bool)> = Vec::new();
        let mut line_width = Pt::ZERO;
        for item in items {
            match item {
                InlineItem::Break => {
                    lines.push(std::mem::take(&mut line));
                    line_width = Pt::ZERO;
                }
                InlineItem::Word { text, bold } => {
                    for piece in self.split_oversized(text, *bold, style, width) {
                        let piece_width =
                            self.fonts
                                .measure_text_width(style.font_name(*bold), style.font_size, &piece);
                        let needed = if line.is_empty() {
                            piece_width
                        } else {
                            line_width + space + piece_width
                        };
                        if !line.is_empty() && needed > width {
                            lines.push(std::mem::take(&mut line));
                            line_width = piece_width;
                        } else {
                            line_width = needed;
                        }
                        line.push((piece, *bold));
                    }
                }
            }
        }
        if !line.is_empty() {
            lines.push(line);
        }
        lines
    }

    fn split_oversized(&self, word: &str, bold: bool, style: &BoxStyle, width: Pt) -> Vec<String> {
        let font = style.font_name(bold);
        if self.fonts.measure_text_width(font, style.font_size, word) <= width {
            return vec![word.to_string()];
        }
        let mut pieces = Vec::new();
        let mut current = String::new();
        for ch in word.chars() {
            current.push(ch);
            if self.fonts.measure_text_width(font, style.font_size, &current) > width
                && current.chars().count() > 1
            {
                current.pop();
                pieces.push(std::mem::take(&mut current));
                current.push(ch);
            }
        }
        if !current.is_empty() {
            pieces.push(current);
        }
        pieces
    }

    fn layout_image(
        &mut self,
        src: &str,
        style: &BoxStyle,
        align: Align,
        x: Pt,
        y: Pt,
        width: Pt,
    ) -> Pt {
        let Some((px_width, px_height)) = image_dimensions(src) else {
            tracing::debug!("skipping image without decodable data URL");
            return Pt::ZERO;
        };
        if px_width == 0 || px_height == 0 {
            return Pt::ZERO;
        }
        let intrinsic = Pt::from_px(px_width as f32);
        let mut draw_width = style
            .width
            .map(|w| w.resolve(width))
            .unwrap_or(intrinsic)
            .min(width);
        let ratio = px_height as f32 / px_width as f32;
        let mut draw_height = draw_width * ratio;
        let cap = Pt::from_f32(MAX_IMAGE_HEIGHT_PT);
        if draw_height > cap {
            draw_height = cap;
            draw_width = cap * (1.0 / ratio);
        }
        let slack = (width - draw_width).max(Pt::ZERO);
        let draw_x = match align {
            Align::Left => x,
            Align::Center => x + slack / 2,
            Align::Right => x + slack,
        };
        self.fragments.push(Some(Fragment::Image(
            Rect {
                x: draw_x,
                y,
                width: draw_width,
                height: draw_height,
            },
            src.to_string(),
        )));
        draw_height
    }
}

fn image_dimensions(src: &str) -> Option<(u32, u32)> {
    let (_, data) = parse_data_uri(src)?;
    let decoded = image::load_from_memory(&data).ok()?;
    Some(decoded.dimensions())
}

fn merge_runs(line: &[(String, bool)]) -> Vec<(String, bool)> {
    let mut runs: Vec<(String, bool)> = Vec::new();
    for (word, bold) in line {
        match runs.last_mut() {
            Some((text, last_bold)) if *last_bold == *bold => {
                text.push(' ');
                text.push_str(word);
            }
            _ => runs.push((word.clone(), *bold)),
        }
    }
    runs
}

fn element_tag(node: &NodeRef) -> Option<String> {
    node.as_element()
        .map(|el| el.name.local.as_ref().to_ascii_lowercase())
}

fn is_inline(node: &NodeRef) -> bool {
    matches!(
        element_tag(node).as_deref(),
        Some("span" | "strong" | "b" | "em" | "i" | "u" | "small" | "a" | "br")
    )
}

fn is_heading(node: &NodeRef) -> bool {
    matches!(
        element_tag(node).as_deref(),
        Some("h1" | "h2" | "h3" | "h4" | "h5" | "h6")
    )
}

fn collect_inline(node: &NodeRef, bold: bool, out: &mut Vec<InlineItem>) {
    if let Some(text) = node.as_text() {
        for word in text.borrow().split_whitespace() {
            out.push(InlineItem::Word {
                text: word.to_string(),
                bold,
            });
        }
        return;
    }
    let Some(tag) = element_tag(node) else {
        return;
    };
    if tag == "br" {
        out.push(InlineItem::Break);
        return;
    }
    let bold = bold || matches!(tag.as_str(), "strong" | "b");
    for child in node.children() {
        collect_inline(&child, bold, out);
    }
}

fn apply_tag_defaults(tag: &str, style: &mut BoxStyle) {
    let base = style.font_size;
    match tag {
        "head" | "style" | "script" | "title" | "meta" | "link" | "template" => {
            style.hidden = true;
        }
        "h1" => {
            style.font_size = base * 1.7;
            style.bold = true;
            style.margin_bottom = Pt::from_px(12.0);
        }
        "h2" => {
            style.font_size = base * 1.3;
            style.bold = true;
            style.margin_top = Pt::from_px(4.0);
            style.margin_bottom = Pt::from_px(8.0);
        }
        "h3" | "h4" | "h5" | "h6" => {
            style.font_size = base * 1.1;
            style.bold = true;
            style.margin_bottom = Pt::from_px(6.0);
        }
        "label" => {
            style.bold = true;
            style.font_size = base * 0.9;
            style.margin_bottom = Pt::from_px(2.0);
        }
        "p" => {
            style.margin_bottom = Pt::from_px(6.0);
        }
        _ => {}
    }
}

fn apply_inline_style(style: &mut BoxStyle, raw: &str) {
    let Ok(attribute) = StyleAttribute::parse(raw, ParserOptions::default()) else {
        tracing::debug!(style = raw, "unparseable inline style ignored");
        return;
    };
    let block = &attribute.declarations;
    for property in block
        .declarations
        .iter()
        .chain(block.important_declarations.iter())
    {
        apply_property(style, property);
    }
}

fn apply_property(style: &mut BoxStyle, property: &Property) {
    match property {
        Property::FontSize(size) => {
            if let Some(pt) = font_size_pt(size, style.font_size) {
                style.font_size = pt;
            }
        }
        Property::FontWeight(weight) => {
            if let Ok(raw) = weight.to_css_string(PrinterOptions::default()) {
                style.bold = is_bold_weight(&raw);
            }
        }
        Property::Color(color) => {
            if let Some(color) = css_color_to_color(color) {
                style.color = color;
            }
        }
        Property::BackgroundColor(color) => {
            style.background = css_color_to_color(color);
        }
        Property::TextAlign(align) => {
            style.text_align = match align {
                TextAlign::Center => Align::Center,
                TextAlign::Right | TextAlign::End => Align::Right,
                _ => Align::Left,
            };
        }
        Property::Width(CssSize::LengthPercentage(length)) => {
            style.width = length_from_lp(length, style.font_size);
        }
        Property::Width(CssSize::Auto) => style.width = None,
        Property::Padding(value) => {
            style.padding = EdgeSizes {
                top: lpa_to_pt(&value.top, style.font_size).unwrap_or(Pt::ZERO),
                right: lpa_to_pt(&value.right, style.font_size).unwrap_or(Pt::ZERO),
                bottom: lpa_to_pt(&value.bottom, style.font_size).unwrap_or(Pt::ZERO),
                left: lpa_to_pt(&value.left, style.font_size).unwrap_or(Pt::ZERO),
            };
        }
        Property::PaddingTop(value) => {
            style.padding.top = lpa_to_pt(value, style.font_size).unwrap_or(Pt::ZERO);
        }
        Property::PaddingRight(value) => {
            style.padding.right = lpa_to_pt(value, style.font_size).unwrap_or(Pt::ZERO);
        }
        Property::PaddingBottom(value) => {
            style.padding.bottom = lpa_to_pt(value, style.font_size).unwrap_or(Pt::ZERO);
        }
        Property::PaddingLeft(value) => {
            style.padding.left = lpa_to_pt(value, style.font_size).unwrap_or(Pt::ZERO);
        }
        Property::Margin(value) => {
            style.margin_top = lpa_to_pt(&value.top, style.font_size).unwrap_or(Pt::ZERO);
            style.margin_bottom = lpa_to_pt(&value.bottom, style.font_size).unwrap_or(Pt::ZERO);
            style.margin_left = lpa_to_pt(&value.left, style.font_size);
            style.margin_right = lpa_to_pt(&value.right, style.font_size);
        }
        Property::MarginTop(value) => {
            style.margin_top = lpa_to_pt(value, style.font_size).unwrap_or(Pt::ZERO);
        }
        Property::MarginBottom(value) => {
            style.margin_bottom = lpa_to_pt(value, style.font_size).unwrap_or(Pt::ZERO);
        }
        Property::MarginLeft(value) => {
            style.margin_left = lpa_to_pt(value, style.font_size);
        }
        Property::MarginRight(value) => {
            style.margin_right = lpa_to_pt(value, style.font_size);
        }
        Property::ColumnGap(GapValue::LengthPercentage(length)) => {
            if let Some(Length::Abs(gap)) = length_from_lp(length, style.font_size) {
                style.column_gap = gap;
            }
        }
        Property::Custom(custom) => {
            let CustomPropertyName::Unknown(name) = &custom.name else {
                return;
            };
            if name.as_ref().eq_ignore_ascii_case("column-count") {
                if let Some(count) = first_number(&custom.value.0) {
                    style.column_count = (count.round() as i64).clamp(1, 12) as u32;
                }
            }
        }
        _ => {}
    }
}

fn first_number(tokens: &[TokenOrValue]) -> Option<f32> {
    tokens.iter().find_map(|token| match token {
        TokenOrValue::Token(Token::Number { value, .. }) => Some(*value),
        _ => None,
    })
}

fn is_bold_weight(raw: &str) -> bool {
    let raw = raw.trim().to_ascii_lowercase();
    match raw.as_str() {
        "bold" | "bolder" => true,
        other => other.parse::<f32>().map(|w| w >= 600.0).unwrap_or(false),
    }
}

fn font_size_pt(size: &FontSize, parent: Pt) -> Option<Pt> {
    match size {
        FontSize::Length(length) => match length_from_lp(length, parent)? {
            Length::Abs(value) => Some(value),
            Length::Percent(fraction) => Some(parent * fraction),
        },
        FontSize::Absolute(size) => Some(Pt::from_px(match size {
            AbsoluteFontSize::XXSmall => 9.0,
            AbsoluteFontSize::XSmall => 10.0,
            AbsoluteFontSize::Small => 13.0,
            AbsoluteFontSize::Medium => 16.0,
            AbsoluteFontSize::Large => 18.0,
            AbsoluteFontSize::XLarge => 24.0,
            AbsoluteFontSize::XXLarge => 32.0,
            AbsoluteFontSize::XXXLarge => 40.0,
        })),
        FontSize::Relative(_) => None,
    }
}

fn length_from_lp(value: &LengthPercentage, font_size: Pt) -> Option<Length> {
    match value {
        LengthPercentage::Percentage(pct) => Some(Length::Percent(pct.0)),
        LengthPercentage::Dimension(length) => match length {
            LengthValue::Em(val) => Some(Length::Abs(font_size * *val)),
            LengthValue::Rem(val) => Some(Length::Abs(Pt::from_px(val * 16.0))),
            _ => length.to_px().map(|px| Length::Abs(Pt::from_px(px))),
        },
        LengthPercentage::Calc(_) => None,
    }
}

fn lpa_to_pt(value: &LengthPercentageOrAuto, font_size: Pt) -> Option<Pt> {
    match value {
        LengthPercentageOrAuto::Auto => None,
        LengthPercentageOrAuto::LengthPercentage(length) => match length_from_lp(length, font_size)
        {
            Some(Length::Abs(value)) => Some(value),
            _ => Some(Pt::ZERO),
        },
    }
}

fn css_color_to_color(color: &CssColor) -> Option<Color> {
    if let CssColor::RGBA(rgba) = color {
        let alpha = rgba.alpha as f32 / 255.0;
        // Preblend over white; the snapshot has an opaque white ground.
        let r = (rgba.red as f32 / 255.0) * alpha + (1.0 - alpha);
        let g = (rgba.green as f32 / 255.0) * alpha + (1.0 - alpha);
        let b = (rgba.blue as f32 / 255.0) * alpha + (1.0 - alpha);
        return Some(Color::rgb(r, g, b));
    }
    if let Ok(srgb) = SRGB::try_from(color) {
        return Some(Color::rgb(srgb.r, srgb.g, srgb.b));
    }
    None
}
