//! Pipeline stages for receipt-photo-to-JSON extraction.
//!
//! Each submodule implements exactly one transformation step, so each is
//! independently testable and every external capability (mask model, line
//! recogniser, language model) sits behind a trait that tests can replace.
//!
//! ## Data Flow
//!
//! ```text
//!                          ┌─▶ encode ──────────────────▶ fields (vision)
//! input ──▶ mask ──▶ geometry
//! (bytes)  (provider) (crop)└─▶ text ──▶ fields (ocr)
//!                              (lines)   (LLM + repair)
//! ```
//!
//! 1. [`input`]   : read a local path or download a URL into bytes
//! 2. [`mask`]    : obtain a foreground mask for the photograph
//! 3. [`geometry`]: isolate, deskew and upright the receipt; pure and
//!    CPU-bound, so callers run it in `spawn_blocking`
//! 4. [`encode`]  : PNG-encode and base64-wrap an image for model requests
//! 5. [`text`]    : recognise lines and drop noise lines
//! 6. [`llm`]     : one bounded, retried model call; the only stage that
//!    talks to the language model
//! 7. [`fields`]  : locate and parse JSON with a single repair attempt

pub mod encode;
pub mod fields;
pub mod geometry;
pub mod input;
pub mod llm;
pub mod mask;
pub mod text;
