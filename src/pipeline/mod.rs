//! Pipeline stages for deck ingestion.
//!
//! Each submodule implements one transformation step and is testable on
//! its own.
//!
//! ## Data Flow
//!
//! ```text
//! fetch ──▶ render ──▶ encode ──▶ transcribe ──▶ cleanup ──▶ assemble
//! (source)  (pdfium)   (PNG)      (model pool)   (per page)  (page order)
//! ```
//!
//! 1. [`fetch`]:      resolve a `PdfSource` to PDF bytes (DocSend, Drive,
//!    generic links, direct URLs, stored objects)
//! 2. [`render`]:     rasterise every page in `spawn_blocking` with a
//!    per-page resolution tier
//! 3. [`encode`]:     PNG-encode pages and wrap them for multimodal calls
//! 4. [`transcribe`]: extract, verify, retry, and fall back per page
//! 5. [`cleanup`]:    deterministic fixes for model formatting quirks
//! 6. [`assemble`]:   bounded concurrent fan-out and ordered reassembly

pub mod assemble;
pub mod cleanup;
pub mod encode;
pub mod fetch;
pub mod render;
pub mod transcribe;
