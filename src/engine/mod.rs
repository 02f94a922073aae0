//! Pipeline orchestration: the writer loop and the two-thread recorder.

pub mod recorder;
pub mod writer;

pub use recorder::{record, RecorderConfig, SessionReport, WriterParts};
pub use writer::WriterPipeline;
