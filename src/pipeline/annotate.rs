// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 帧标注 (zone 多边形、检测框、标签、洪水横幅)

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_polygon_mut,
    draw_text_mut, text_size,
};
use imageproc::point::Point as PixelPoint;
use imageproc::rect::Rect;

use crate::detection::{id_to_color, Detection, Identity};
use crate::geometry::Point;

const ZONE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BANNER_BG: Rgb<u8> = Rgb([0, 0, 0]);
const BANNER_FG: Rgb<u8> = Rgb([255, 255, 0]);
const BANNER_SIZE: (u32, u32) = (350, 30);
const LABEL_SCALE: f32 = 16.0;

/// 标注器; 字体缺失时只画几何图形
#[derive(Clone, Default)]
pub struct Annotator {
    font: Option<FontArc>,
    zone_alpha: f32,
}

impl Annotator {
    pub fn new(font: Option<FontArc>, zone_alpha: f32) -> Self {
        Self {
            font,
            zone_alpha: zone_alpha.clamp(0.0, 1.0),
        }
    }

    /// 从 TTF/OTF 文件加载字体, 失败时降级为无文字标注
    pub fn load(font_path: Option<&Path>, zone_alpha: f32) -> Self {
        let font = font_path.and_then(|path| match std::fs::read(path) {
            Ok(bytes) => match FontArc::try_from_vec(bytes) {
                Ok(font) => {
                    tracing::info!("🔤 标注字体已加载: {}", path.display());
                    Some(font)
                }
                Err(e) => {
                    tracing::warn!("⚠️  字体解析失败 {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("⚠️  字体读取失败 {}: {}", path.display(), e);
                None
            }
        });
        if font.is_none() {
            tracing::info!("标注不含文字 (未配置字体)");
        }
        Self::new(font, zone_alpha)
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// 半透明填充 + 实线轮廓
    pub fn draw_zone(&self, image: &mut RgbImage, polygon: &[Point]) {
        let mut vertices: Vec<PixelPoint<i32>> = polygon
            .iter()
            .map(|p| PixelPoint::new(p[0].round() as i32, p[1].round() as i32))
            .collect();
        vertices.dedup();
        if vertices.len() > 1 && vertices.first() == vertices.last() {
            vertices.pop();
        }
        if vertices.len() < 3 {
            return;
        }

        if self.zone_alpha > 0.0 {
            let mut overlay = image.clone();
            draw_polygon_mut(&mut overlay, &vertices, ZONE_COLOR);
            let a = self.zone_alpha;
            for (dst, src) in image.pixels_mut().zip(overlay.pixels()) {
                for c in 0..3 {
                    dst.0[c] = (src.0[c] as f32 * a + dst.0[c] as f32 * (1.0 - a)).round() as u8;
                }
            }
        }

        for i in 0..vertices.len() {
            let a = vertices[i];
            let b = vertices[(i + 1) % vertices.len()];
            for d in [0.0f32, 1.0] {
                draw_line_segment_mut(
                    image,
                    (a.x as f32 + d, a.y as f32),
                    (b.x as f32 + d, b.y as f32),
                    ZONE_COLOR,
                );
            }
        }
    }

    /// 检测框 + 标签, 颜色由身份决定
    pub fn draw_detection(&self, image: &mut RgbImage, det: &Detection, label: &str) {
        let color = Rgb(match det.identity {
            Some(Identity::Tracked(id)) => id_to_color(id),
            Some(Identity::Synthetic(idx)) => id_to_color(idx as u32 + 1000),
            None => [255, 255, 255],
        });

        let Some(rect) = clamp_rect(
            image,
            det.bbox.x1,
            det.bbox.y1,
            det.bbox.width(),
            det.bbox.height(),
        ) else {
            return;
        };
        draw_hollow_rect_mut(image, rect, color);
        if rect.width() > 2 && rect.height() > 2 {
            let inner = Rect::at(rect.left() + 1, rect.top() + 1)
                .of_size(rect.width() - 2, rect.height() - 2);
            draw_hollow_rect_mut(image, inner, color);
        }

        let Some(font) = &self.font else {
            return;
        };
        if label.is_empty() {
            return;
        }
        let scale = PxScale::from(LABEL_SCALE);
        let (tw, th) = text_size(scale, font, label);
        let y = (rect.top() - th as i32 - 4).max(0);
        if let Some(bg) = clamp_rect(image, rect.left() as f32, y as f32, tw as f32 + 4.0, th as f32 + 4.0) {
            draw_filled_rect_mut(image, bg, color);
        }
        draw_text_mut(image, TEXT_COLOR, rect.left() + 2, y + 2, scale, font, label);
    }

    /// 左上角黑底横幅: `Flood: <bool> (<score>)`
    pub fn draw_flood_banner(&self, image: &mut RgbImage, is_flood: bool, score: f32) {
        if let Some(bg) = clamp_rect(image, 0.0, 0.0, BANNER_SIZE.0 as f32, BANNER_SIZE.1 as f32) {
            draw_filled_rect_mut(image, bg, BANNER_BG);
        }
        if let Some(font) = &self.font {
            let text = flood_banner_text(is_flood, score);
            draw_text_mut(image, BANNER_FG, 8, 6, PxScale::from(18.0), font, &text);
        }
    }
}

pub fn flood_banner_text(is_flood: bool, score: f32) -> String {
    let flag = if is_flood { "True" } else { "False" };
    format!("Flood: {} ({:.2})", flag, score)
}

/// 标签文本: `#<id> <类别> <速度> km/h`, 无速度时省略速度
pub fn detection_label(det: &Detection, class_name: &str) -> String {
    let id = det
        .identity
        .map(|i| i.to_string())
        .unwrap_or_else(|| "#-".to_string());
    if det.speed > 0.0 {
        format!("{} {} {:.0} km/h", id, class_name, det.speed)
    } else {
        format!("{} {}", id, class_name)
    }
}

/// 裁剪到图像范围内; 完全在图外或退化时返回 None
fn clamp_rect(image: &RgbImage, x: f32, y: f32, w: f32, h: f32) -> Option<Rect> {
    let (iw, ih) = (image.width() as f32, image.height() as f32);
    if !(x.is_finite() && y.is_finite() && w.is_finite() && h.is_finite()) {
        return None;
    }
    let x1 = x.max(0.0);
    let y1 = y.max(0.0);
    let x2 = (x + w).min(iw - 1.0);
    let y2 = (y + h).min(ih - 1.0);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(
        Rect::at(x1 as i32, y1 as i32)
            .of_size(((x2 - x1) as u32).max(1), ((y2 - y1) as u32).max(1)),
    )
}
