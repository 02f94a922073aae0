//! Stub backend used when the crate is built without the `x11-grab`
//! feature.  `open` always fails; the session type is uninhabited so no
//! capture path exists at all.

use crate::capture::{CaptureBackend, CaptureSession, SessionConfig};
use crate::core::buffers::GpuTransfer;
use crate::core::types::Geometry;
use crate::error::{CastError, Result};

#[derive(Default)]
pub struct X11Backend;

/// Uninhabited: a session can never be constructed without the feature.
pub enum NullSession {}

impl CaptureSession for NullSession {
    fn geometry(&self) -> Geometry {
        match *self {}
    }

    fn grab_into(&mut self, _dst: &mut [u8]) -> Result<()> {
        match *self {}
    }

    fn transfer(&mut self) -> Option<&mut dyn GpuTransfer> {
        match *self {}
    }

    fn close(&mut self) {
        match *self {}
    }
}

pub type X11Session = NullSession;

impl CaptureBackend for X11Backend {
    type Session = NullSession;

    fn open(&mut self, _config: &SessionConfig) -> Result<NullSession> {
        Err(CastError::Capture(
            "this build does not include the X11 capture backend (enable the `x11-grab` feature)"
                .into(),
        ))
    }
}
