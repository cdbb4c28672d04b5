//! Rasterisation against a real pdfium library.
//!
//! Gated behind `PDFIUM_E2E` because it needs `libpdfium` on the loader path
//! (or `PDFIUM_LIB_PATH` pointing at it).
//!
//! Run with:
//!   PDFIUM_E2E=1 PDFIUM_LIB_PATH=/opt/pdfium/lib cargo test --test rasterize -- --nocapture

use deck_ingest::{IngestError, PdfiumRasterizer, Rasterizer, ResolutionTier};
use std::path::PathBuf;

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

macro_rules! skip_unless_pdfium {
    () => {{
        if std::env::var("PDFIUM_E2E").is_err() {
            println!("SKIP — set PDFIUM_E2E=1 to run pdfium tests");
            return;
        }
        PdfiumRasterizer::new(std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from))
    }};
}

/// Build a blank PDF with one page per `(width, height)` MediaBox, with a
/// correct cross-reference table.
fn blank_pdf(page_sizes: &[(u32, u32)]) -> Vec<u8> {
    let n = page_sizes.len();
    let kids: Vec<String> = (0..n).map(|i| format!("{} 0 R", i + 3)).collect();

    let mut objects = vec![
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        format!("<< /Type /Pages /Kids [{}] /Count {n} >>", kids.join(" ")),
    ];
    for (w, h) in page_sizes {
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {w} {h}] /Resources << >> >>"
        ));
    }

    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{body}\nendobj\n", i + 1).as_bytes());
    }

    let xref_at = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for off in offsets {
        out.extend_from_slice(format!("{off:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_at}\n%%EOF\n",
            objects.len() + 1
        )
        .as_bytes(),
    );
    out
}

#[tokio::test]
async fn pages_render_in_order_at_their_tier() {
    let rasterizer = skip_unless_pdfium!();
    let pdf = blank_pdf(&[(500, 300), (900, 600), (1920, 1080)]);

    let pages = rasterizer.rasterize(pdf).await.expect("rasterize");

    assert_eq!(pages.len(), 3);
    let numbers: Vec<usize> = pages.iter().map(|p| p.page_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    let tiers: Vec<ResolutionTier> = pages.iter().map(|p| p.resolution_tier).collect();
    assert_eq!(
        tiers,
        vec![ResolutionTier::Low, ResolutionTier::Medium, ResolutionTier::High]
    );
    for page in &pages {
        assert!(
            page.image_bytes.starts_with(PNG_MAGIC),
            "page {} is not a PNG",
            page.page_number
        );
    }
}

#[tokio::test]
async fn garbage_is_a_corrupt_document() {
    let rasterizer = skip_unless_pdfium!();

    let err = rasterizer
        .rasterize(b"%PDF-1.4\nthis is not really a pdf".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::CorruptDocument { .. }), "{err:?}");
}
