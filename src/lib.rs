//! wincast — paced window capture to a media file.
//!
//! # Architecture
//!
//! Two long-lived threads decoupled by a fixed-capacity slot pool and a
//! bounded-wait FIFO:
//!
//! ```text
//! CaptureSource ──slots──▶ HandoffQueue ──units──▶ WriterPipeline
//!   (X11/composite grab)                    (scale → encode → mux)
//! ```
//!
//! The capture side owns the whole external resource chain (display,
//! composite redirection, GPU pixmap/texture, optional transfer buffers)
//! and tears it down in exact reverse order from any failure point.  The
//! writer side never issues a GPU call.
//!
//! # Module layout
//!
//! - [`core`] — frame types, slot pool, buffer backends, handoff queue
//! - [`capture`] — session lifecycle, pacing loop, X11 backend
//! - [`io`] — scaler/encoder/sink contracts and implementations
//! - [`engine`] — writer loop and two-thread session orchestration
//! - [`error`] — typed error hierarchy

pub mod capture;
pub mod core;
pub mod engine;
pub mod error;
pub mod io;
