//! Overlay rendering
//!
//! Draws annotated bounding boxes and labels onto a transparent canvas
//! sized to the source image, for display compositing over the original
//! X-ray. Output is byte-deterministic for identical input: no timestamps,
//! no randomness.

pub mod font;

use crate::models::{Finding, FindingType};
use crate::{Result, WorkerError};
use image::{ImageOutputFormat, Rgba, RgbaImage};
use std::io::Cursor;
use tracing::debug;

const OUTLINE_THICKNESS: u32 = 2;
const FILL_ALPHA: u8 = 90;
const LABEL_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
/// Gap between the label baseline and the box's top edge.
const LABEL_GAP: u32 = 2;

/// Fixed palette keyed by finding type; unknown types render gray.
fn color_for(finding_type: &FindingType) -> [u8; 3] {
    match finding_type {
        FindingType::Caries => [255, 0, 0],
        FindingType::BoneLoss => [255, 165, 0],
        FindingType::RestorationDefect => [255, 255, 0],
        FindingType::PeriapicalRadiolucency => [138, 43, 226],
        FindingType::Calculus => [50, 205, 50],
        FindingType::RootCanalIssue => [30, 144, 255],
        FindingType::ImageAssessment | FindingType::Other(_) => [128, 128, 128],
    }
}

/// Render the annotation overlay as an RGBA PNG. Findings without a
/// complete bounding box are skipped silently; they still exist in the
/// persisted finding set.
pub fn render(width: u32, height: u32, findings: &[Finding]) -> Result<Vec<u8>> {
    if width == 0 || height == 0 {
        return Err(WorkerError::Image(
            "Overlay canvas must have nonzero dimensions".to_string(),
        ));
    }

    let mut canvas = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]));
    let mut drawn = 0usize;

    for finding in findings {
        let Some(bbox) = finding.bounding_box else {
            continue;
        };

        let [r, g, b] = color_for(&finding.finding_type);
        let x0 = bbox.x.max(0.0) as u32;
        let y0 = bbox.y.max(0.0) as u32;
        let x1 = ((bbox.x + bbox.width).max(0.0) as u32).min(width.saturating_sub(1));
        let y1 = ((bbox.y + bbox.height).max(0.0) as u32).min(height.saturating_sub(1));
        if x0 > x1 || y0 > y1 {
            continue;
        }

        // Semi-transparent fill
        for y in y0..=y1 {
            for x in x0..=x1 {
                canvas.put_pixel(x, y, Rgba([r, g, b, FILL_ALPHA]));
            }
        }

        // Solid outline
        for t in 0..OUTLINE_THICKNESS {
            let (ox0, oy0) = (x0 + t, y0 + t);
            let (ox1, oy1) = (x1.saturating_sub(t), y1.saturating_sub(t));
            if ox0 > ox1 || oy0 > oy1 {
                break;
            }
            for x in ox0..=ox1 {
                canvas.put_pixel(x, oy0, Rgba([r, g, b, 255]));
                canvas.put_pixel(x, oy1, Rgba([r, g, b, 255]));
            }
            for y in oy0..=oy1 {
                canvas.put_pixel(ox0, y, Rgba([r, g, b, 255]));
                canvas.put_pixel(ox1, y, Rgba([r, g, b, 255]));
            }
        }

        // Label just above the box, clamped onto the canvas
        let label = label_for(finding);
        let label_y = y0.saturating_sub(font::GLYPH_HEIGHT + LABEL_GAP);
        draw_text(&mut canvas, x0, label_y, &label);
        drawn += 1;
    }

    debug!(drawn, total = findings.len(), "Overlay rendered");

    let mut buf = Vec::new();
    let mut cursor = Cursor::new(&mut buf);
    image::DynamicImage::ImageRgba8(canvas)
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| WorkerError::Image(format!("Failed to encode overlay PNG: {e}")))?;
    Ok(buf)
}

/// Async wrapper; rendering and PNG encoding are CPU-bound.
pub async fn render_async(width: u32, height: u32, findings: Vec<Finding>) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || render(width, height, &findings))
        .await
        .map_err(|e| WorkerError::Internal(format!("Overlay task panicked: {e}")))?
}

fn label_for(finding: &Finding) -> String {
    let base = format!("{} {}", finding.tooth_number, finding.finding_type);
    if finding.confidence > 0.0 {
        format!("{base} {:.0}%", finding.confidence * 100.0)
    } else {
        base
    }
}

fn draw_text(canvas: &mut RgbaImage, x: u32, y: u32, text: &str) {
    let (width, height) = canvas.dimensions();
    let mut cursor_x = x;

    for c in text.chars() {
        let columns = font::glyph(c).unwrap_or([0; 5]);
        for (col_idx, col) in columns.iter().enumerate() {
            let px = cursor_x + col_idx as u32;
            if px >= width {
                return;
            }
            for row in 0..font::GLYPH_HEIGHT {
                if col & (1 << row) != 0 {
                    let py = y + row;
                    if py < height {
                        canvas.put_pixel(px, py, LABEL_COLOR);
                    }
                }
            }
        }
        cursor_x += font::ADVANCE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, Severity};
    use chrono::Utc;

    fn boxed_finding(finding_type: FindingType, bbox: Option<BoundingBox>) -> Finding {
        Finding {
            tooth_number: "14".to_string(),
            finding_type,
            severity: Severity::Moderate,
            confidence: 0.85,
            bounding_box: bbox,
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    fn full_box() -> Option<BoundingBox> {
        Some(BoundingBox {
            x: 50.0,
            y: 60.0,
            width: 40.0,
            height: 30.0,
        })
    }

    #[test]
    fn test_deterministic_output() {
        let findings = vec![
            boxed_finding(FindingType::Caries, full_box()),
            boxed_finding(FindingType::BoneLoss, full_box()),
        ];
        let a = render(320, 240, &findings).unwrap();
        let b = render(320, 240, &findings).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_boxless_finding_draws_nothing() {
        let blank = render(320, 240, &[]).unwrap();
        let skipped = render(320, 240, &[boxed_finding(FindingType::Caries, None)]).unwrap();
        assert_eq!(blank, skipped);
    }

    #[test]
    fn test_boxed_finding_changes_canvas() {
        let blank = render(320, 240, &[]).unwrap();
        let drawn = render(320, 240, &[boxed_finding(FindingType::Caries, full_box())]).unwrap();
        assert_ne!(blank, drawn);
    }

    #[test]
    fn test_fill_and_outline_colors() {
        let png = render(320, 240, &[boxed_finding(FindingType::Caries, full_box())]).unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_rgba8();

        // Outline pixel at the box corner is solid red
        assert_eq!(decoded.get_pixel(50, 60), &Rgba([255, 0, 0, 255]));
        // Interior pixel carries the translucent fill
        assert_eq!(decoded.get_pixel(70, 75), &Rgba([255, 0, 0, FILL_ALPHA]));
        // Far corner stays fully transparent
        assert_eq!(decoded.get_pixel(319, 239)[3], 0);
    }

    #[test]
    fn test_unknown_type_renders_gray() {
        let finding = boxed_finding(FindingType::Other("mystery".to_string()), full_box());
        let png = render(320, 240, &[finding]).unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(decoded.get_pixel(50, 60), &Rgba([128, 128, 128, 255]));
    }

    #[test]
    fn test_box_clamped_to_canvas() {
        let finding = boxed_finding(
            FindingType::Caries,
            Some(BoundingBox {
                x: 300.0,
                y: 230.0,
                width: 100.0,
                height: 100.0,
            }),
        );
        // Must not panic on out-of-bounds coordinates
        render(320, 240, &[finding]).unwrap();
    }

    #[test]
    fn test_zero_canvas_rejected() {
        assert!(render(0, 240, &[]).is_err());
    }
}
