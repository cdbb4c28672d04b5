//! PDF rasterisation: one PNG [`RasterPage`] per page via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! pdfium keeps thread-local state and rendering is CPU-bound. The whole
//! document is processed inside `tokio::task::spawn_blocking` so the async
//! workers that drive downloads and model calls never stall.
//!
//! ## Resolution tiers
//!
//! Each page's scale comes from its area in points ([`ResolutionTier`]):
//! small pages carry little detail per point and are rendered at 216 DPI,
//! typical slides at 144 DPI, large canvases at their native 72 DPI.

use crate::error::IngestError;
use crate::output::{ImageFormat, RasterPage, ResolutionTier};
use crate::pipeline::encode::encode_png;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info};

/// Turns PDF bytes into ordered page images.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Render every page, in document order, numbered from 1.
    ///
    /// Fails with [`IngestError::CorruptDocument`] when the bytes cannot be
    /// opened as a PDF.
    async fn rasterize(&self, pdf: Vec<u8>) -> Result<Vec<RasterPage>, IngestError>;
}

/// [`Rasterizer`] backed by the pdfium library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRasterizer {
    lib_path: Option<PathBuf>,
}

impl PdfiumRasterizer {
    /// Bind to `libpdfium` at `lib_path` (a file or the directory holding
    /// it), or to the system library when `None`.
    pub fn new(lib_path: Option<PathBuf>) -> Self {
        Self { lib_path }
    }

    fn bind(&self) -> Result<Pdfium, IngestError> {
        let bindings = match &self.lib_path {
            Some(path) if path.is_dir() => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))
            }
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| {
            IngestError::Internal(format!(
                "pdfium library could not be loaded ({}): {e:?}",
                self.lib_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "system library".into())
            ))
        })?;
        Ok(Pdfium::new(bindings))
    }
}

#[async_trait]
impl Rasterizer for PdfiumRasterizer {
    async fn rasterize(&self, pdf: Vec<u8>) -> Result<Vec<RasterPage>, IngestError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.rasterize_blocking(&pdf))
            .await
            .map_err(|e| IngestError::Internal(format!("Render task panicked: {e}")))?
    }
}

impl PdfiumRasterizer {
    fn rasterize_blocking(&self, pdf: &[u8]) -> Result<Vec<RasterPage>, IngestError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| IngestError::CorruptDocument {
                detail: format!("{e:?}"),
            })?;

        let pages = document.pages();
        let total = pages.len() as usize;
        if total == 0 {
            return Err(IngestError::CorruptDocument {
                detail: "document has no pages".into(),
            });
        }
        info!(pages = total, bytes = pdf.len(), "PDF loaded");

        let mut out = Vec::with_capacity(total);
        for (idx, page) in pages.iter().enumerate() {
            let page_number = idx + 1;
            let failed = |detail: String| IngestError::RasterisationFailed {
                page: page_number,
                detail,
            };

            let tier = ResolutionTier::for_page(
                f64::from(page.width().value),
                f64::from(page.height().value),
            );
            let render_config = PdfRenderConfig::new().scale_page_by_factor(tier.scale());
            let image = page
                .render_with_config(&render_config)
                .map_err(|e| failed(format!("{e:?}")))?
                .as_image();
            let image_bytes = encode_png(&image).map_err(|e| failed(e.to_string()))?;

            debug!(
                page = page_number,
                dpi = tier.dpi(),
                width = image.width(),
                height = image.height(),
                "page rendered"
            );
            out.push(RasterPage {
                page_number,
                image_bytes,
                format: ImageFormat::Png,
                resolution_tier: tier,
            });
        }
        Ok(out)
    }
}
