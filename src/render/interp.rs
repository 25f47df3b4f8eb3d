//! Content-stream interpreter: operator dispatch over a graphics-state
//! stack, driving the rasterizer, glyph cache and compositor.

use std::collections::HashMap;
use std::rc::Rc;

use crate::backend::Backend;
use crate::content::Content;
use crate::enc;
use crate::error::*;
use crate::file::Storage;
use crate::font::Font;
use crate::jpeg::JpegImage;
use crate::jpx::JpxImage;
use crate::primitive::{Dictionary, Name, Primitive};
use crate::render::bitmap::{Bitmap, Color};
use crate::render::glyph::{GlyphCache, GlyphKey};
use crate::render::raster::{clip_from_path, fill_path};
use crate::render::stroke::{stroke_path, LineCap, LineJoin, StrokeStyle};
use crate::render::{ClipRegion, FillRule, IRect, Matrix, Path, PathCmd};

use super::page::RenderFlags;

const MAX_FORM_DEPTH: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColorSpaceKind {
    Gray,
    Rgb,
    Cmyk,
}

#[derive(Clone)]
struct TextState {
    font: Option<Rc<Font>>,
    size: f64,
    char_spacing: f64,
    word_spacing: f64,
    h_scale: f64,
    leading: f64,
    rise: f64,
    render_mode: i64,
}

impl Default for TextState {
    fn default() -> TextState {
        TextState {
            font: None,
            size: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            h_scale: 1.0,
            leading: 0.0,
            rise: 0.0,
            render_mode: 0,
        }
    }
}

#[derive(Clone)]
struct GraphicsState {
    ctm: Matrix,
    clip: ClipRegion,
    fill_color: Color,
    stroke_color: Color,
    fill_cs: ColorSpaceKind,
    stroke_cs: ColorSpaceKind,
    stroke: StrokeStyle,
    text: TextState,
}

pub struct Interpreter<'a, B: Backend> {
    storage: &'a Storage<B>,
    bitmap: &'a mut Bitmap,
    glyphs: &'a mut GlyphCache,
    flags: RenderFlags,
    state: GraphicsState,
    stack: Vec<GraphicsState>,
    path: Path,
    pending_clip: Option<FillRule>,
    // inside BT..ET
    text_matrix: Matrix,
    line_matrix: Matrix,
    text_clip: Option<Path>,
    font_cache: HashMap<Vec<u8>, Rc<Font>>,
    form_depth: u32,
}

type OpFn<'a, B> = fn(&mut Interpreter<'a, B>, &[Primitive], &Dictionary) -> Result<()>;

impl<'a, B: Backend> Interpreter<'a, B> {
    pub fn new(
        storage: &'a Storage<B>,
        bitmap: &'a mut Bitmap,
        glyphs: &'a mut GlyphCache,
        flags: RenderFlags,
        base_ctm: Matrix,
    ) -> Interpreter<'a, B> {
        let clip = ClipRegion::full(bitmap.width(), bitmap.height());
        Interpreter {
            storage,
            bitmap,
            glyphs,
            flags,
            state: GraphicsState {
                ctm: base_ctm,
                clip,
                fill_color: Color::BLACK,
                stroke_color: Color::BLACK,
                fill_cs: ColorSpaceKind::Gray,
                stroke_cs: ColorSpaceKind::Gray,
                stroke: StrokeStyle::default(),
                text: TextState::default(),
            },
            stack: Vec::new(),
            path: Path::new(),
            pending_clip: None,
            text_matrix: Matrix::IDENTITY,
            line_matrix: Matrix::IDENTITY,
            text_clip: None,
            font_cache: HashMap::new(),
            form_depth: 0,
        }
    }

    pub fn run(&mut self, content: &Content, resources: &Dictionary) -> Result<()> {
        // the operator table; a short linear scan keeps the whole dispatch
        // surface in one place
        let table: &[(&[u8], OpFn<'a, B>)] = &[
            (b"q", Self::op_save),
            (b"Q", Self::op_restore),
            (b"cm", Self::op_cm),
            (b"w", Self::op_line_width),
            (b"J", Self::op_line_cap),
            (b"j", Self::op_line_join),
            (b"M", Self::op_miter_limit),
            (b"d", Self::op_dash),
            (b"i", Self::op_nop),
            (b"ri", Self::op_nop),
            (b"gs", Self::op_ext_gstate),
            (b"m", Self::op_move),
            (b"l", Self::op_line),
            (b"c", Self::op_curve),
            (b"v", Self::op_curve_v),
            (b"y", Self::op_curve_y),
            (b"h", Self::op_close),
            (b"re", Self::op_rect),
            (b"S", Self::op_stroke),
            (b"s", Self::op_close_stroke),
            (b"f", Self::op_fill),
            (b"F", Self::op_fill),
            (b"f*", Self::op_fill_even_odd),
            (b"B", Self::op_fill_stroke),
            (b"B*", Self::op_fill_stroke_even_odd),
            (b"b", Self::op_close_fill_stroke),
            (b"b*", Self::op_close_fill_stroke_even_odd),
            (b"n", Self::op_end_path),
            (b"W", Self::op_clip),
            (b"W*", Self::op_clip_even_odd),
            (b"g", Self::op_fill_gray),
            (b"G", Self::op_stroke_gray),
            (b"rg", Self::op_fill_rgb),
            (b"RG", Self::op_stroke_rgb),
            (b"k", Self::op_fill_cmyk),
            (b"K", Self::op_stroke_cmyk),
            (b"cs", Self::op_fill_cs),
            (b"CS", Self::op_stroke_cs),
            (b"sc", Self::op_fill_sc),
            (b"scn", Self::op_fill_sc),
            (b"SC", Self::op_stroke_sc),
            (b"SCN", Self::op_stroke_sc),
            (b"BT", Self::op_begin_text),
            (b"ET", Self::op_end_text),
            (b"Tc", Self::op_char_spacing),
            (b"Tw", Self::op_word_spacing),
            (b"Tz", Self::op_h_scale),
            (b"TL", Self::op_leading),
            (b"Tf", Self::op_font),
            (b"Tr", Self::op_render_mode),
            (b"Ts", Self::op_rise),
            (b"Td", Self::op_td),
            (b"TD", Self::op_td_leading),
            (b"Tm", Self::op_tm),
            (b"T*", Self::op_next_line),
            (b"Tj", Self::op_show),
            (b"TJ", Self::op_show_adjusted),
            (b"'", Self::op_next_line_show),
            (b"\"", Self::op_spacing_show),
            (b"Do", Self::op_xobject),
            (b"BI", Self::op_inline_image),
            (b"sh", Self::op_shading),
        ];

        for op in &content.operations {
            let handler = table.iter().find(|(name, _)| *name == op.operator.as_bytes());
            match handler {
                Some((_, f)) => {
                    if let Err(e) = f(self, &op.operands, resources) {
                        // one failed operator never aborts the page
                        self.storage
                            .warnings
                            .push(format!("operator {} failed: {}", op.operator, e));
                    }
                }
                None => {
                    debug!("skipping unknown operator {}", op.operator);
                }
            }
        }
        Ok(())
    }

    fn num(args: &[Primitive], i: usize) -> Result<f64> {
        try_opt!(args.get(i)).as_number()
    }

    // --- graphics state ---

    fn op_nop(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        Ok(())
    }

    fn op_save(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.stack.push(self.state.clone());
        Ok(())
    }

    fn op_restore(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        match self.stack.pop() {
            Some(state) => self.state = state,
            None => self.storage.warnings.push("unbalanced Q ignored".into()),
        }
        Ok(())
    }

    fn op_cm(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        let m = Matrix::new(
            Self::num(args, 0)?,
            Self::num(args, 1)?,
            Self::num(args, 2)?,
            Self::num(args, 3)?,
            Self::num(args, 4)?,
            Self::num(args, 5)?,
        );
        self.state.ctm = m.concat(self.state.ctm);
        Ok(())
    }

    fn op_line_width(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.stroke.width = Self::num(args, 0)?;
        Ok(())
    }
    fn op_line_cap(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.stroke.cap = match args.first().and_then(|p| p.as_int().ok()) {
            Some(1) => LineCap::Round,
            Some(2) => LineCap::Square,
            _ => LineCap::Butt,
        };
        Ok(())
    }
    fn op_line_join(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.stroke.join = match args.first().and_then(|p| p.as_int().ok()) {
            Some(1) => LineJoin::Round,
            Some(2) => LineJoin::Bevel,
            _ => LineJoin::Miter,
        };
        Ok(())
    }
    fn op_miter_limit(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.stroke.miter_limit = Self::num(args, 0)?;
        Ok(())
    }
    fn op_dash(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        let arr = try_opt!(args.first()).as_array()?;
        self.state.stroke.dash = arr.iter().filter_map(|p| p.as_number().ok()).collect();
        self.state.stroke.dash_phase = Self::num(args, 1)?;
        Ok(())
    }

    fn op_ext_gstate(&mut self, args: &[Primitive], resources: &Dictionary) -> Result<()> {
        let name = try_opt!(args.first()).as_name()?;
        let gs = self
            .resource_entry(resources, "ExtGState", name)
            .ok_or_else(|| PdfError::NotFound { word: format!("ExtGState {}", name) })?;
        let gs = gs.as_dictionary()?.clone();
        if let Some(w) = gs.get("LW").and_then(|p| p.as_number().ok()) {
            self.state.stroke.width = w;
        }
        if let Some(c) = gs.get("LC").and_then(|p| p.as_int().ok()) {
            self.state.stroke.cap = match c {
                1 => LineCap::Round,
                2 => LineCap::Square,
                _ => LineCap::Butt,
            };
        }
        if let Some(j) = gs.get("LJ").and_then(|p| p.as_int().ok()) {
            self.state.stroke.join = match j {
                1 => LineJoin::Round,
                2 => LineJoin::Bevel,
                _ => LineJoin::Miter,
            };
        }
        if let Some(m) = gs.get("ML").and_then(|p| p.as_number().ok()) {
            self.state.stroke.miter_limit = m;
        }
        Ok(())
    }

    // --- path construction ---

    fn op_move(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.path.move_to(Self::num(args, 0)?, Self::num(args, 1)?);
        Ok(())
    }
    fn op_line(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.path.line_to(Self::num(args, 0)?, Self::num(args, 1)?);
        Ok(())
    }
    fn op_curve(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.path.curve_to(
            Self::num(args, 0)?,
            Self::num(args, 1)?,
            Self::num(args, 2)?,
            Self::num(args, 3)?,
            Self::num(args, 4)?,
            Self::num(args, 5)?,
        );
        Ok(())
    }
    fn op_curve_v(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        // first control point coincides with the current point
        let (x0, y0) = self.path.current_point().unwrap_or((0.0, 0.0));
        self.path.curve_to(
            x0,
            y0,
            Self::num(args, 0)?,
            Self::num(args, 1)?,
            Self::num(args, 2)?,
            Self::num(args, 3)?,
        );
        Ok(())
    }
    fn op_curve_y(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        // second control point coincides with the endpoint
        let (x3, y3) = (Self::num(args, 2)?, Self::num(args, 3)?);
        self.path
            .curve_to(Self::num(args, 0)?, Self::num(args, 1)?, x3, y3, x3, y3);
        Ok(())
    }
    fn op_close(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.path.close();
        Ok(())
    }
    fn op_rect(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.path.rect(
            Self::num(args, 0)?,
            Self::num(args, 1)?,
            Self::num(args, 2)?,
            Self::num(args, 3)?,
        );
        Ok(())
    }

    // --- path painting ---

    fn aa_paths(&self) -> bool {
        !self.flags.contains(RenderFlags::NO_SMOOTH_PATH)
    }

    fn fill_current(&mut self, rule: FillRule) {
        let color = self.state.fill_color;
        let bounds = self.state.clip.rect();
        let clip = self.state.clip.clone();
        let ctm = self.state.ctm;
        let aa = self.aa_paths();
        let bitmap = &mut *self.bitmap;
        fill_path(&self.path, &ctm, rule, bounds, aa, |y, x0, covers| {
            for (i, &c) in covers.iter().enumerate() {
                let x = x0 + i as i32;
                let c = c as u32 * clip.coverage_at(x, y) as u32 / 255;
                if c > 0 && x >= 0 && y >= 0 {
                    bitmap.blend_pixel(x as u32, y as u32, color, c as u8);
                }
            }
        });
    }

    fn stroke_current(&mut self) {
        let color = self.state.stroke_color;
        let bounds = self.state.clip.rect();
        let clip = self.state.clip.clone();
        let ctm = self.state.ctm;

        // hairline strokes: keep the device width around one pixel
        let mut style = self.state.stroke.clone();
        let scale = ctm.mean_scale().max(1e-9);
        if style.width * scale < 1.0 {
            style.width = 1.0 / scale;
        }

        let outline = stroke_path(&self.path, &style);
        let aa = self.aa_paths();
        let bitmap = &mut *self.bitmap;
        fill_path(&outline, &ctm, FillRule::NonZero, bounds, aa, |y, x0, covers| {
            for (i, &c) in covers.iter().enumerate() {
                let x = x0 + i as i32;
                let c = c as u32 * clip.coverage_at(x, y) as u32 / 255;
                if c > 0 && x >= 0 && y >= 0 {
                    bitmap.blend_pixel(x as u32, y as u32, color, c as u8);
                }
            }
        });
    }

    /// Applies a pending `W`/`W*` and clears the path.
    fn end_path(&mut self) {
        if let Some(rule) = self.pending_clip.take() {
            let mask = clip_from_path(
                &self.path,
                &self.state.ctm,
                rule,
                self.state.clip.rect(),
                self.aa_paths(),
            );
            self.state.clip = self.state.clip.intersect(&mask);
        }
        self.path = Path::new();
    }

    fn op_stroke(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.stroke_current();
        self.end_path();
        Ok(())
    }
    fn op_close_stroke(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.path.close();
        self.stroke_current();
        self.end_path();
        Ok(())
    }
    fn op_fill(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.fill_current(FillRule::NonZero);
        self.end_path();
        Ok(())
    }
    fn op_fill_even_odd(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.fill_current(FillRule::EvenOdd);
        self.end_path();
        Ok(())
    }
    fn op_fill_stroke(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.fill_current(FillRule::NonZero);
        self.stroke_current();
        self.end_path();
        Ok(())
    }
    fn op_fill_stroke_even_odd(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.fill_current(FillRule::EvenOdd);
        self.stroke_current();
        self.end_path();
        Ok(())
    }
    fn op_close_fill_stroke(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.path.close();
        self.fill_current(FillRule::NonZero);
        self.stroke_current();
        self.end_path();
        Ok(())
    }
    fn op_close_fill_stroke_even_odd(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.path.close();
        self.fill_current(FillRule::EvenOdd);
        self.stroke_current();
        self.end_path();
        Ok(())
    }
    fn op_end_path(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.end_path();
        Ok(())
    }
    fn op_clip(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.pending_clip = Some(FillRule::NonZero);
        Ok(())
    }
    fn op_clip_even_odd(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.pending_clip = Some(FillRule::EvenOdd);
        Ok(())
    }

    // --- color ---

    fn op_fill_gray(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        let g = (Self::num(args, 0)?.clamp(0.0, 1.0) * 255.0) as u8;
        self.state.fill_cs = ColorSpaceKind::Gray;
        self.state.fill_color = Color::rgb(g, g, g);
        Ok(())
    }
    fn op_stroke_gray(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        let g = (Self::num(args, 0)?.clamp(0.0, 1.0) * 255.0) as u8;
        self.state.stroke_cs = ColorSpaceKind::Gray;
        self.state.stroke_color = Color::rgb(g, g, g);
        Ok(())
    }
    fn op_fill_rgb(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.fill_cs = ColorSpaceKind::Rgb;
        self.state.fill_color = rgb_color(args)?;
        Ok(())
    }
    fn op_stroke_rgb(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.stroke_cs = ColorSpaceKind::Rgb;
        self.state.stroke_color = rgb_color(args)?;
        Ok(())
    }
    fn op_fill_cmyk(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.fill_cs = ColorSpaceKind::Cmyk;
        self.state.fill_color = cmyk_color(args)?;
        Ok(())
    }
    fn op_stroke_cmyk(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.stroke_cs = ColorSpaceKind::Cmyk;
        self.state.stroke_color = cmyk_color(args)?;
        Ok(())
    }
    fn op_fill_cs(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.fill_cs = cs_kind(args, self.storage);
        Ok(())
    }
    fn op_stroke_cs(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.stroke_cs = cs_kind(args, self.storage);
        Ok(())
    }
    fn op_fill_sc(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        if let Some(c) = sc_color(args, self.state.fill_cs) {
            self.state.fill_color = c;
        } else {
            self.storage.warnings.push("pattern fill color not supported".into());
        }
        Ok(())
    }
    fn op_stroke_sc(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        if let Some(c) = sc_color(args, self.state.stroke_cs) {
            self.state.stroke_color = c;
        } else {
            self.storage.warnings.push("pattern stroke color not supported".into());
        }
        Ok(())
    }

    // --- text ---

    fn op_begin_text(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.text_matrix = Matrix::IDENTITY;
        self.line_matrix = Matrix::IDENTITY;
        Ok(())
    }

    fn op_end_text(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        if let Some(clip_path) = self.text_clip.take() {
            let mask = clip_from_path(
                &clip_path,
                &Matrix::IDENTITY,
                FillRule::NonZero,
                self.state.clip.rect(),
                !self.flags.contains(RenderFlags::NO_SMOOTH_TEXT),
            );
            self.state.clip = self.state.clip.intersect(&mask);
        }
        Ok(())
    }

    fn op_char_spacing(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.text.char_spacing = Self::num(args, 0)?;
        Ok(())
    }
    fn op_word_spacing(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.text.word_spacing = Self::num(args, 0)?;
        Ok(())
    }
    fn op_h_scale(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.text.h_scale = Self::num(args, 0)? / 100.0;
        Ok(())
    }
    fn op_leading(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.text.leading = Self::num(args, 0)?;
        Ok(())
    }
    fn op_render_mode(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.text.render_mode = try_opt!(args.first()).as_int()?;
        Ok(())
    }
    fn op_rise(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.text.rise = Self::num(args, 0)?;
        Ok(())
    }

    fn op_font(&mut self, args: &[Primitive], resources: &Dictionary) -> Result<()> {
        let name = try_opt!(args.first()).as_name()?.clone();
        self.state.text.size = Self::num(args, 1)?;

        if let Some(font) = self.font_cache.get(&name.0) {
            self.state.text.font = Some(font.clone());
            return Ok(());
        }
        let font = match self.resource_entry(resources, "Font", &name) {
            Some(p) => {
                let dict = p.as_dictionary()?.clone();
                Rc::new(Font::load(&dict, self.storage))
            }
            None => {
                self.storage
                    .warnings
                    .push(format!("font {} not found in resources", name));
                // metrics-only fallback
                Rc::new(Font::load(&Dictionary::new(), self.storage))
            }
        };
        self.font_cache.insert(name.0.clone(), font.clone());
        self.state.text.font = Some(font);
        Ok(())
    }

    fn op_td(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        let (tx, ty) = (Self::num(args, 0)?, Self::num(args, 1)?);
        self.line_matrix = Matrix::translate(tx, ty).concat(self.line_matrix);
        self.text_matrix = self.line_matrix;
        Ok(())
    }
    fn op_td_leading(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        self.state.text.leading = -Self::num(args, 1)?;
        self.op_td(args, &Dictionary::new())
    }
    fn op_tm(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        let m = Matrix::new(
            Self::num(args, 0)?,
            Self::num(args, 1)?,
            Self::num(args, 2)?,
            Self::num(args, 3)?,
            Self::num(args, 4)?,
            Self::num(args, 5)?,
        );
        self.text_matrix = m;
        self.line_matrix = m;
        Ok(())
    }
    fn op_next_line(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        let leading = self.state.text.leading;
        self.line_matrix = Matrix::translate(0.0, -leading).concat(self.line_matrix);
        self.text_matrix = self.line_matrix;
        Ok(())
    }

    fn op_show(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        let s = try_opt!(args.first()).as_string()?.data.clone();
        self.show_text(&s);
        Ok(())
    }
    fn op_show_adjusted(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        let arr = try_opt!(args.first()).as_array()?.to_vec();
        for item in arr {
            match item {
                Primitive::String(s) => self.show_text(&s.data),
                Primitive::Int(_) | Primitive::Real(_) => {
                    let adj = item.as_number().unwrap_or(0.0);
                    let tx = -adj / 1000.0 * self.state.text.size * self.state.text.h_scale;
                    self.text_matrix = Matrix::translate(tx, 0.0).concat(self.text_matrix);
                }
                _ => {}
            }
        }
        Ok(())
    }
    fn op_next_line_show(&mut self, args: &[Primitive], res: &Dictionary) -> Result<()> {
        self.op_next_line(&[], res)?;
        self.op_show(args, res)
    }
    fn op_spacing_show(&mut self, args: &[Primitive], res: &Dictionary) -> Result<()> {
        self.state.text.word_spacing = Self::num(args, 0)?;
        self.state.text.char_spacing = Self::num(args, 1)?;
        self.op_next_line(&[], res)?;
        let s = try_opt!(args.get(2)).as_string()?.data.clone();
        self.show_text(&s);
        Ok(())
    }

    fn show_text(&mut self, bytes: &[u8]) {
        let Some(font) = self.state.text.font.clone() else {
            self.storage.warnings.push("text shown with no font selected".into());
            return;
        };
        let ts = self.state.text.clone();
        let no_text = self.flags.contains(RenderFlags::NO_NATIVE_TEXT);
        let aa = !self.flags.contains(RenderFlags::NO_SMOOTH_TEXT);

        for &code in bytes {
            // glyph space -> text space -> device
            let glyph_to_text = Matrix::new(
                ts.size * ts.h_scale,
                0.0,
                0.0,
                ts.size,
                0.0,
                ts.rise,
            );
            let trm = glyph_to_text.concat(self.text_matrix).concat(self.state.ctm);

            let visible = ts.render_mode != 3 && ts.render_mode != 7 && !no_text;
            if visible && font.is_renderable() {
                self.draw_glyph(&font, code, &trm, aa);
            }
            if ts.render_mode >= 4 {
                self.accumulate_text_clip(&font, code, &trm);
            }

            let mut adv = font.advance(code) * ts.size + ts.char_spacing;
            if code == b' ' {
                adv += ts.word_spacing;
            }
            let tx = adv * ts.h_scale;
            self.text_matrix = Matrix::translate(tx, 0.0).concat(self.text_matrix);
        }
    }

    fn draw_glyph(&mut self, font: &Font, code: u8, trm: &Matrix, aa: bool) {
        let key = GlyphKey::new(font.glyph_id(code), trm, aa);
        let Some(bmp) = self.glyphs.get(key, trm, || font.glyph_outline(code)) else {
            return;
        };
        let (ox, oy) = trm.apply(0.0, 0.0);
        let (ox, oy) = (ox.round() as i32, oy.round() as i32);
        let color = self.state.fill_color;
        for row in 0..bmp.rows as i32 {
            for col in 0..bmp.width as i32 {
                let c = bmp.coverage[(row * bmp.width as i32 + col) as usize];
                if c == 0 {
                    continue;
                }
                let x = ox + bmp.left + col;
                let y = oy + bmp.top + row;
                let c = c as u32 * self.state.clip.coverage_at(x, y) as u32 / 255;
                if c > 0 && x >= 0 && y >= 0 {
                    self.bitmap.blend_pixel(x as u32, y as u32, color, c as u8);
                }
            }
        }
    }

    fn accumulate_text_clip(&mut self, font: &Font, code: u8, trm: &Matrix) {
        let Some(outline) = font.glyph_outline(code) else { return };
        let clip = self.text_clip.get_or_insert_with(Path::new);
        // bake the transform into the accumulated path
        for cmd in &outline.cmds {
            match *cmd {
                PathCmd::MoveTo(x, y) => {
                    let (x, y) = trm.apply(x, y);
                    clip.move_to(x, y);
                }
                PathCmd::LineTo(x, y) => {
                    let (x, y) = trm.apply(x, y);
                    clip.line_to(x, y);
                }
                PathCmd::CurveTo(x1, y1, x2, y2, x3, y3) => {
                    let (x1, y1) = trm.apply(x1, y1);
                    let (x2, y2) = trm.apply(x2, y2);
                    let (x3, y3) = trm.apply(x3, y3);
                    clip.curve_to(x1, y1, x2, y2, x3, y3);
                }
                PathCmd::Close => clip.close(),
            }
        }
    }

    // --- XObjects and images ---

    fn resource_entry(&self, resources: &Dictionary, category: &str, name: &Name) -> Option<Primitive> {
        let cat = self.storage.get_entry(resources, category)?;
        let cat = cat.as_dictionary().ok()?.clone();
        let entry = cat.get_name(name)?;
        self.storage.deref(entry).ok()
    }

    fn op_xobject(&mut self, args: &[Primitive], resources: &Dictionary) -> Result<()> {
        let name = try_opt!(args.first()).as_name()?.clone();
        let xobj = self
            .resource_entry(resources, "XObject", &name)
            .ok_or_else(|| PdfError::NotFound { word: format!("XObject {}", name) })?;
        let stream = xobj.as_stream()?;
        let subtype = stream.info.get("Subtype").and_then(|p| p.as_name().ok());
        match subtype {
            Some(n) if *n == "Image" => self.draw_image_stream(stream.clone()),
            Some(n) if *n == "Form" => self.run_form(stream.clone(), resources),
            other => {
                self.storage
                    .warnings
                    .push(format!("XObject subtype {:?} skipped", other));
                Ok(())
            }
        }
    }

    fn run_form(&mut self, form: crate::primitive::PdfStream, parent_resources: &Dictionary) -> Result<()> {
        if self.form_depth >= MAX_FORM_DEPTH {
            return Err(PdfError::ResourceLimit { msg: "form XObject nesting".into() });
        }
        let content = Content::parse_from(t!(form.decoded_data()))?;

        let resources = match self.storage.get_entry(&form.info, "Resources") {
            Some(Primitive::Dictionary(d)) => d,
            _ => parent_resources.clone(),
        };

        let stack_depth = self.stack.len();
        self.stack.push(self.state.clone());
        self.form_depth += 1;

        if let Some(arr) = form.info.get("Matrix").and_then(|p| p.as_array().ok()) {
            if arr.len() == 6 {
                let v: Vec<f64> = arr.iter().filter_map(|p| p.as_number().ok()).collect();
                if v.len() == 6 {
                    let m = Matrix::new(v[0], v[1], v[2], v[3], v[4], v[5]);
                    self.state.ctm = m.concat(self.state.ctm);
                }
            }
        }
        if let Some(arr) = form.info.get("BBox").and_then(|p| p.as_array().ok()) {
            let v: Vec<f64> = arr.iter().filter_map(|p| p.as_number().ok()).collect();
            if v.len() == 4 {
                let mut bbox = Path::new();
                bbox.rect(v[0].min(v[2]), v[1].min(v[3]), (v[2] - v[0]).abs(), (v[3] - v[1]).abs());
                let mask = clip_from_path(
                    &bbox,
                    &self.state.ctm,
                    FillRule::NonZero,
                    self.state.clip.rect(),
                    true,
                );
                self.state.clip = self.state.clip.intersect(&mask);
            }
        }

        let result = self.run(&content, &resources);

        self.form_depth -= 1;
        // unbalanced saves inside the form must not leak out
        self.stack.truncate(stack_depth + 1);
        if let Some(state) = self.stack.pop() {
            self.state = state;
        }
        result
    }

    fn op_inline_image(&mut self, args: &[Primitive], _: &Dictionary) -> Result<()> {
        let dict = try_opt!(args.first()).as_dictionary()?.clone();
        let data = try_opt!(args.get(1)).as_string()?.data.clone();
        let stream = crate::primitive::PdfStream::new(dict, data);
        self.draw_image_stream(stream)
    }

    fn draw_image_stream(&mut self, stream: crate::primitive::PdfStream) -> Result<()> {
        match decode_image(&stream, self.storage) {
            Ok(image) => {
                self.blit_image(&image);
                Ok(())
            }
            Err(e) => {
                // a broken image never kills the page; leave its area blank
                self.storage.warnings.push(format!("image decode failed: {}", e));
                Ok(())
            }
        }
    }

    /// Draws a decoded image onto the CTM-mapped unit square by inverse
    /// sampling every covered device pixel.
    fn blit_image(&mut self, image: &SampledImage) {
        let ctm = self.state.ctm;
        let Some(inv) = ctm.invert() else { return };

        // device bounding box of the unit square
        let corners = [
            ctm.apply(0.0, 0.0),
            ctm.apply(1.0, 0.0),
            ctm.apply(0.0, 1.0),
            ctm.apply(1.0, 1.0),
        ];
        let min_x = corners.iter().map(|c| c.0).fold(f64::MAX, f64::min).floor() as i32;
        let max_x = corners.iter().map(|c| c.0).fold(f64::MIN, f64::max).ceil() as i32;
        let min_y = corners.iter().map(|c| c.1).fold(f64::MAX, f64::min).floor() as i32;
        let max_y = corners.iter().map(|c| c.1).fold(f64::MIN, f64::max).ceil() as i32;

        let clip_rect = self.state.clip.rect();
        let x0 = min_x.max(clip_rect.x0);
        let x1 = max_x.min(clip_rect.x1);
        let y0 = min_y.max(clip_rect.y0);
        let y1 = max_y.min(clip_rect.y1);

        let fill = self.state.fill_color;
        for y in y0..y1 {
            for x in x0..x1 {
                // sample at the pixel centre
                let (u, v) = inv.apply(x as f64 + 0.5, y as f64 + 0.5);
                if !(0.0..1.0).contains(&u) || !(0.0..1.0).contains(&v) {
                    continue;
                }
                // image rows run top-down while the unit square's v axis
                // points up
                let ix = (u * image.width as f64) as u32;
                let iy = ((1.0 - v) * image.height as f64) as u32;
                let Some((color, alpha)) = image.sample(ix, iy, fill) else { continue };
                let a = alpha as u32 * self.state.clip.coverage_at(x, y) as u32 / 255;
                if a > 0 {
                    self.bitmap.blend_pixel(x as u32, y as u32, color, a as u8);
                }
            }
        }
    }

    fn op_shading(&mut self, _: &[Primitive], _: &Dictionary) -> Result<()> {
        self.storage.warnings.push("shading operator skipped".into());
        Ok(())
    }
}

fn rgb_color(args: &[Primitive]) -> Result<Color> {
    let f = |i: usize| -> Result<u8> {
        Ok((try_opt!(args.get(i)).as_number()?.clamp(0.0, 1.0) * 255.0) as u8)
    };
    Ok(Color::rgb(f(0)?, f(1)?, f(2)?))
}

fn cmyk_color(args: &[Primitive]) -> Result<Color> {
    let f = |i: usize| -> Result<f64> { Ok(try_opt!(args.get(i)).as_number()?.clamp(0.0, 1.0)) };
    let (c, m, y, k) = (f(0)?, f(1)?, f(2)?, f(3)?);
    Ok(Color::rgb(
        ((1.0 - c) * (1.0 - k) * 255.0) as u8,
        ((1.0 - m) * (1.0 - k) * 255.0) as u8,
        ((1.0 - y) * (1.0 - k) * 255.0) as u8,
    ))
}

fn cs_kind<B: Backend>(args: &[Primitive], storage: &Storage<B>) -> ColorSpaceKind {
    match args.first() {
        Some(Primitive::Name(n)) if *n == "DeviceRGB" || *n == "CalRGB" => ColorSpaceKind::Rgb,
        Some(Primitive::Name(n)) if *n == "DeviceCMYK" => ColorSpaceKind::Cmyk,
        Some(Primitive::Name(n)) if *n == "DeviceGray" || *n == "CalGray" => ColorSpaceKind::Gray,
        other => {
            storage
                .warnings
                .push(format!("colorspace {:?} treated as DeviceGray", other));
            ColorSpaceKind::Gray
        }
    }
}

fn sc_color(args: &[Primitive], kind: ColorSpaceKind) -> Option<Color> {
    if args.iter().any(|p| matches!(p, Primitive::Name(_))) {
        return None; // pattern
    }
    let nums: Vec<f64> = args
        .iter()
        .filter_map(|p| p.as_number().ok())
        .map(|v| v.clamp(0.0, 1.0))
        .collect();
    match (kind, nums.len()) {
        (ColorSpaceKind::Gray, 1) => {
            let g = (nums[0] * 255.0) as u8;
            Some(Color::rgb(g, g, g))
        }
        (ColorSpaceKind::Rgb, 3) => Some(Color::rgb(
            (nums[0] * 255.0) as u8,
            (nums[1] * 255.0) as u8,
            (nums[2] * 255.0) as u8,
        )),
        (ColorSpaceKind::Cmyk, 4) => Some(Color::rgb(
            ((1.0 - nums[0]) * (1.0 - nums[3]) * 255.0) as u8,
            ((1.0 - nums[1]) * (1.0 - nums[3]) * 255.0) as u8,
            ((1.0 - nums[2]) * (1.0 - nums[3]) * 255.0) as u8,
        )),
        _ => None,
    }
}

/// A decoded, directly sampleable image.
struct SampledImage {
    width: u32,
    height: u32,
    kind: SampledKind,
}

enum SampledKind {
    /// packed rgb triplets
    Rgb(Vec<u8>),
    /// rgb plus per-pixel alpha
    Rgba(Vec<u8>),
    /// 1-bit stencil; set bits are painted with the fill color
    Stencil { data: Vec<u8>, row_bytes: usize, paint_zero: bool },
}

impl SampledImage {
    fn sample(&self, x: u32, y: u32, fill: Color) -> Option<(Color, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y * self.width + x) as usize;
        match &self.kind {
            SampledKind::Rgb(data) => {
                let p = &data[i * 3..i * 3 + 3];
                Some((Color::rgb(p[0], p[1], p[2]), 255))
            }
            SampledKind::Rgba(data) => {
                let p = &data[i * 4..i * 4 + 4];
                Some((Color::rgb(p[0], p[1], p[2]), p[3]))
            }
            SampledKind::Stencil { data, row_bytes, paint_zero } => {
                let byte = data.get(y as usize * row_bytes + (x / 8) as usize)?;
                let bit = byte >> (7 - (x % 8)) & 1;
                let painted = (bit == 0) == *paint_zero;
                if painted {
                    Some((fill, 255))
                } else {
                    None
                }
            }
        }
    }
}

/// Turns an image stream (XObject or inline) into sampleable pixels.
fn decode_image<B: Backend>(stream: &crate::primitive::PdfStream, storage: &Storage<B>) -> Result<SampledImage> {
    let info = &stream.info;
    let get = |a: &str, b: &str| info.get(a).or_else(|| info.get(b)).cloned();

    let width = try_opt!(get("Width", "W")).as_u32()?;
    let height = try_opt!(get("Height", "H")).as_u32()?;
    if width == 0 || height == 0 || width.saturating_mul(height) > 1 << 28 {
        err!(PdfError::MalformedImage { msg: format!("image {}x{}", width, height) });
    }

    // image codecs terminate the filter chain
    let filters = enc::stream_filters(info)?;
    if let Some(codec) = filters.iter().find(|f| f.is_image_codec()) {
        let payload = t!(stream.decoded_data());
        return match codec {
            enc::StreamFilter::Dct => {
                let img = JpegImage::decode(payload)?;
                Ok(SampledImage {
                    width: img.width,
                    height: img.height,
                    kind: SampledKind::Rgb(img.to_rgb()),
                })
            }
            _ => {
                let img = JpxImage::decode(payload)?;
                Ok(SampledImage {
                    width: img.width(),
                    height: img.height(),
                    kind: SampledKind::Rgb(img.to_rgb()),
                })
            }
        };
    }

    let data = t!(stream.decoded_data());
    let bpc = get("BitsPerComponent", "BPC").map(|p| p.as_int()).transpose()?.unwrap_or(8);

    let image_mask = get("ImageMask", "IM")
        .map(|p| p.as_bool())
        .transpose()?
        .unwrap_or(false);
    if image_mask {
        if bpc != 1 {
            err!(PdfError::MalformedImage { msg: "image mask with BPC != 1".into() });
        }
        let row_bytes = ((width as usize) + 7) / 8;
        // /Decode [1 0] inverts the stencil sense
        let paint_zero = match get("Decode", "D") {
            Some(Primitive::Array(arr)) if !arr.is_empty() => {
                arr[0].as_number().unwrap_or(0.0) == 0.0
            }
            _ => true,
        };
        return Ok(SampledImage {
            width,
            height,
            kind: SampledKind::Stencil { data: data.to_vec(), row_bytes, paint_zero },
        });
    }

    let cs = get("ColorSpace", "CS");
    let rgb = raw_samples_to_rgb(data, width, height, bpc as u32, cs.as_ref(), storage)?;
    Ok(SampledImage { width, height, kind: SampledKind::Rgb(rgb) })
}

/// Unpacks raw (post-filter) samples into packed RGB.
fn raw_samples_to_rgb<B: Backend>(
    data: &[u8],
    width: u32,
    height: u32,
    bpc: u32,
    cs: Option<&Primitive>,
    storage: &Storage<B>,
) -> Result<Vec<u8>> {
    if !matches!(bpc, 1 | 2 | 4 | 8 | 16) {
        err!(PdfError::MalformedImage { msg: format!("{} bits per component", bpc) });
    }

    // resolve the colorspace to a component count and optional palette
    enum Space {
        Gray,
        Rgb,
        Cmyk,
        Indexed { base_components: usize, lookup: Vec<u8> },
    }
    let resolved = match cs {
        None => Space::Gray,
        Some(p) => {
            let p = storage.deref(p).unwrap_or(Primitive::Null);
            match &p {
                Primitive::Name(n) if *n == "DeviceGray" || *n == "G" || *n == "CalGray" => Space::Gray,
                Primitive::Name(n) if *n == "DeviceRGB" || *n == "RGB" || *n == "CalRGB" => Space::Rgb,
                Primitive::Name(n) if *n == "DeviceCMYK" || *n == "CMYK" => Space::Cmyk,
                Primitive::Array(arr) if !arr.is_empty() => {
                    let head = arr[0].as_name().map(|n| n.0.clone()).unwrap_or_default();
                    match head.as_slice() {
                        b"Indexed" | b"I" => {
                            if arr.len() < 4 {
                                err!(PdfError::MalformedImage { msg: "short Indexed colorspace".into() });
                            }
                            let base = storage.deref(&arr[1])?;
                            let base_components = match &base {
                                Primitive::Name(n) if *n == "DeviceRGB" || *n == "RGB" => 3,
                                Primitive::Name(n) if *n == "DeviceGray" || *n == "G" => 1,
                                Primitive::Name(n) if *n == "DeviceCMYK" || *n == "CMYK" => 4,
                                _ => {
                                    storage.warnings.push("Indexed base treated as DeviceRGB".into());
                                    3
                                }
                            };
                            let lookup = match storage.deref(&arr[3])? {
                                Primitive::String(s) => s.data,
                                p @ Primitive::Stream(_) => p.as_stream()?.decoded_data()?.to_vec(),
                                p => {
                                    err!(PdfError::MalformedImage {
                                        msg: format!("Indexed lookup is {}", p.get_debug_name())
                                    });
                                }
                            };
                            Space::Indexed { base_components, lookup }
                        }
                        b"ICCBased" => {
                            let n = storage
                                .deref(&arr[1])
                                .ok()
                                .and_then(|p| p.as_stream().ok().and_then(|s| s.info.get("N").cloned()))
                                .and_then(|p| p.as_int().ok())
                                .unwrap_or(3);
                            storage
                                .warnings
                                .push("ICC profile ignored; using component count only".into());
                            match n {
                                1 => Space::Gray,
                                4 => Space::Cmyk,
                                _ => Space::Rgb,
                            }
                        }
                        other => {
                            err!(PdfError::UnsupportedImage {
                                msg: format!("colorspace /{}", String::from_utf8_lossy(other))
                            });
                        }
                    }
                }
                _ => Space::Gray,
            }
        }
    };

    let n_components = match &resolved {
        Space::Gray => 1,
        Space::Rgb => 3,
        Space::Cmyk => 4,
        Space::Indexed { .. } => 1,
    };

    let row_bits = width as usize * bpc as usize * n_components;
    let row_bytes = (row_bits + 7) / 8;
    if data.len() < row_bytes * height as usize {
        err!(PdfError::MalformedImage { msg: "image data shorter than geometry".into() });
    }

    let max_val = ((1u32 << bpc.min(16)) - 1).max(1);
    let get_component = |x: u32, y: u32, c: usize| -> u32 {
        let bit_off = y as usize * row_bytes * 8 + (x as usize * n_components + c) * bpc as usize;
        match bpc {
            8 => data[bit_off / 8] as u32,
            16 => {
                let i = bit_off / 8;
                (data[i] as u32) << 8 | data[i + 1] as u32
            }
            _ => {
                let byte = data[bit_off / 8];
                let shift = 8 - bpc - (bit_off % 8) as u32;
                (byte >> shift) as u32 & max_val
            }
        }
    };
    let to8 = |v: u32| -> u8 { (v * 255 / max_val) as u8 };

    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            match &resolved {
                Space::Gray => {
                    let g = to8(get_component(x, y, 0));
                    out.extend_from_slice(&[g, g, g]);
                }
                Space::Rgb => {
                    out.push(to8(get_component(x, y, 0)));
                    out.push(to8(get_component(x, y, 1)));
                    out.push(to8(get_component(x, y, 2)));
                }
                Space::Cmyk => {
                    let px = crate::jpeg::cmyk_to_rgb(
                        to8(get_component(x, y, 0)),
                        to8(get_component(x, y, 1)),
                        to8(get_component(x, y, 2)),
                        to8(get_component(x, y, 3)),
                    );
                    out.extend_from_slice(&px);
                }
                Space::Indexed { base_components, lookup } => {
                    let idx = get_component(x, y, 0) as usize * base_components;
                    match base_components {
                        1 => {
                            let g = lookup.get(idx).copied().unwrap_or(0);
                            out.extend_from_slice(&[g, g, g]);
                        }
                        4 => {
                            let c = lookup.get(idx).copied().unwrap_or(0);
                            let m = lookup.get(idx + 1).copied().unwrap_or(0);
                            let yy = lookup.get(idx + 2).copied().unwrap_or(0);
                            let k = lookup.get(idx + 3).copied().unwrap_or(0);
                            out.extend_from_slice(&crate::jpeg::cmyk_to_rgb(c, m, yy, k));
                        }
                        _ => {
                            out.push(lookup.get(idx).copied().unwrap_or(0));
                            out.push(lookup.get(idx + 1).copied().unwrap_or(0));
                            out.push(lookup.get(idx + 2).copied().unwrap_or(0));
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sc_colors() {
        let args = [Primitive::Real(1.0), Primitive::Real(0.0), Primitive::Real(0.0)];
        let c = sc_color(&args, ColorSpaceKind::Rgb).unwrap();
        assert_eq!((c.r, c.g, c.b), (255, 0, 0));
        assert!(sc_color(&[Primitive::Name(Name::from("P0"))], ColorSpaceKind::Rgb).is_none());
    }

    #[test]
    fn stencil_sampling() {
        let img = SampledImage {
            width: 10,
            height: 1,
            kind: SampledKind::Stencil {
                data: vec![0b1010_0000, 0b0100_0000],
                row_bytes: 2,
                paint_zero: false,
            },
        };
        let fill = Color::rgb(9, 9, 9);
        assert!(img.sample(0, 0, fill).is_some()); // bit 1 painted
        assert!(img.sample(1, 0, fill).is_none());
        assert!(img.sample(9, 0, fill).is_some());
    }
}
