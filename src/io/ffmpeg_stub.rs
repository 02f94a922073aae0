//! Stubs compiled when the `ffmpeg-runtime` feature is disabled.  The
//! types exist so callers type-check unchanged, but every constructor
//! fails and the types are uninhabited.

use std::path::Path;

use crate::core::types::{Geometry, Rational};
use crate::error::{CastError, Result};
use crate::io::{EncodedPacket, PacketSink, Scaler, VideoEncoder};

fn unavailable(what: &str) -> CastError {
    CastError::Pipeline(format!(
        "{what} requires the `ffmpeg-runtime` feature, which this build does not include"
    ))
}

pub enum SwsScaler {}

impl SwsScaler {
    pub fn new(_src: Geometry, _dst_width: u32, _dst_height: u32) -> Result<Self> {
        Err(unavailable("pixel conversion"))
    }
}

impl Scaler for SwsScaler {
    fn convert<'a>(&'a mut self, _src: &'a [u8]) -> Result<&'a [u8]> {
        match *self {}
    }
}

pub enum Mpeg4Encoder {}

impl Mpeg4Encoder {
    pub fn new(_width: u32, _height: u32, _fps: u32, _bit_rate: i64) -> Result<Self> {
        Err(unavailable("MPEG-4 encoding"))
    }

    pub fn extradata(&self) -> Vec<u8> {
        match *self {}
    }
}

impl VideoEncoder for Mpeg4Encoder {
    fn time_base(&self) -> Rational {
        match *self {}
    }

    fn submit(&mut self, _frame: &[u8], _pts: i64) -> Result<Vec<EncodedPacket>> {
        match *self {}
    }

    fn finish(&mut self) -> Result<Vec<EncodedPacket>> {
        match *self {}
    }
}

pub enum ContainerSink {}

impl ContainerSink {
    pub fn new(
        _path: &Path,
        _width: u32,
        _height: u32,
        _fps: u32,
        _extradata: &[u8],
    ) -> Result<Self> {
        Err(unavailable("container muxing"))
    }
}

impl PacketSink for ContainerSink {
    fn time_base(&self) -> Rational {
        match *self {}
    }

    fn write_packet(&mut self, _packet: &EncodedPacket) -> Result<()> {
        match *self {}
    }

    fn finalize(&mut self) -> Result<u64> {
        match *self {}
    }
}
