//! FFmpeg-backed output path: swscale pixel conversion, MPEG-4 encoding
//! and container muxing.  Compiled with the `ffmpeg-runtime` feature.

use std::ffi::CString;
use std::os::raw::c_int;
use std::path::Path;
use std::ptr;

use ffmpeg_sys_next::*;

use crate::core::types::{rescale, Geometry, PixelFormat, Rational};
use crate::error::{CastError, Result};
use crate::io::{EncodedPacket, PacketSink, Scaler, VideoEncoder};

fn to_cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| CastError::Mux("path contains NUL".into()))
}

/// Human-readable form of an FFmpeg error code.
fn av_err(ret: c_int) -> String {
    let mut buf = [0u8; 64];
    unsafe {
        av_strerror(ret, buf.as_mut_ptr() as *mut _, buf.len());
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    format!("{} ({ret})", String::from_utf8_lossy(&buf[..end]))
}

fn check(ret: c_int, ctx: &str) -> Result<c_int> {
    if ret >= 0 {
        Ok(ret)
    } else {
        Err(CastError::Encode(format!("{ctx}: {}", av_err(ret))))
    }
}

// ─── swscale conversion ─────────────────────────────────────────────────────

/// RGBA → planar YUV 4:2:0 converter, one swscale context per session.
pub struct SwsScaler {
    ctx: *mut SwsContext,
    src: Geometry,
    dst_width: u32,
    dst_height: u32,
    out: Vec<u8>,
}

// SAFETY: the context is only touched from the writer thread.
unsafe impl Send for SwsScaler {}

impl SwsScaler {
    pub fn new(src: Geometry, dst_width: u32, dst_height: u32) -> Result<Self> {
        let ctx = unsafe {
            sws_getContext(
                src.width as c_int,
                src.height as c_int,
                AVPixelFormat::AV_PIX_FMT_RGBA,
                dst_width as c_int,
                dst_height as c_int,
                AVPixelFormat::AV_PIX_FMT_YUV420P,
                SWS_BILINEAR,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null(),
            )
        };
        if ctx.is_null() {
            return Err(CastError::Scale(format!(
                "no conversion path {}x{} RGBA -> {}x{} YUV420P",
                src.width, src.height, dst_width, dst_height
            )));
        }
        let out = vec![0u8; PixelFormat::Yuv420p.frame_len(dst_width, dst_height)];
        Ok(Self {
            ctx,
            src,
            dst_width,
            dst_height,
            out,
        })
    }
}

impl Scaler for SwsScaler {
    fn convert<'a>(&'a mut self, src: &'a [u8]) -> Result<&'a [u8]> {
        debug_assert_eq!(src.len(), self.src.frame_len());
        let (w, h) = (self.dst_width as usize, self.dst_height as usize);
        let (y, uv) = self.out.split_at_mut(w * h);
        let (u, v) = uv.split_at_mut(w * h / 4);

        let src_planes = [src.as_ptr(), ptr::null(), ptr::null(), ptr::null()];
        let src_strides = [self.src.stride as c_int, 0, 0, 0];
        let dst_planes = [
            y.as_mut_ptr(),
            u.as_mut_ptr(),
            v.as_mut_ptr(),
            ptr::null_mut(),
        ];
        let dst_strides = [w as c_int, (w / 2) as c_int, (w / 2) as c_int, 0];

        let rows = unsafe {
            sws_scale(
                self.ctx,
                src_planes.as_ptr(),
                src_strides.as_ptr(),
                0,
                self.src.height as c_int,
                dst_planes.as_ptr(),
                dst_strides.as_ptr(),
            )
        };
        if rows != self.dst_height as c_int {
            return Err(CastError::Scale(format!(
                "swscale produced {rows} rows, expected {}",
                self.dst_height
            )));
        }
        Ok(&self.out)
    }
}

impl Drop for SwsScaler {
    fn drop(&mut self) {
        unsafe { sws_freeContext(self.ctx) };
    }
}

// ─── MPEG-4 encoder ─────────────────────────────────────────────────────────

/// MPEG-4 Part 2 encoder over planar YUV 4:2:0 input.
pub struct Mpeg4Encoder {
    ctx: *mut AVCodecContext,
    frame: *mut AVFrame,
    pkt: *mut AVPacket,
    time_base: Rational,
    width: u32,
    height: u32,
}

// SAFETY: all codec operations happen on the writer thread.
unsafe impl Send for Mpeg4Encoder {}

impl Mpeg4Encoder {
    pub fn new(width: u32, height: u32, fps: u32, bit_rate: i64) -> Result<Self> {
        let codec = unsafe { avcodec_find_encoder(AVCodecID::AV_CODEC_ID_MPEG4) };
        if codec.is_null() {
            return Err(CastError::Encode("MPEG-4 encoder not available".into()));
        }
        let ctx = unsafe { avcodec_alloc_context3(codec) };
        if ctx.is_null() {
            return Err(CastError::Encode("allocating codec context failed".into()));
        }

        unsafe {
            (*ctx).bit_rate = bit_rate;
            (*ctx).width = width as c_int;
            (*ctx).height = height as c_int;
            (*ctx).time_base = AVRational {
                num: 1,
                den: fps as c_int,
            };
            (*ctx).framerate = AVRational {
                num: fps as c_int,
                den: 1,
            };
            (*ctx).gop_size = 12;
            (*ctx).max_b_frames = 1;
            (*ctx).pix_fmt = AVPixelFormat::AV_PIX_FMT_YUV420P;
        }

        let mut encoder = Self {
            ctx,
            frame: ptr::null_mut(),
            pkt: ptr::null_mut(),
            time_base: Rational::per_frame(fps),
            width,
            height,
        };

        check(
            unsafe { avcodec_open2(ctx, codec, ptr::null_mut()) },
            "avcodec_open2",
        )?;

        encoder.frame = unsafe { av_frame_alloc() };
        encoder.pkt = unsafe { av_packet_alloc() };
        if encoder.frame.is_null() || encoder.pkt.is_null() {
            return Err(CastError::Encode("allocating frame/packet failed".into()));
        }
        unsafe {
            (*encoder.frame).format = AVPixelFormat::AV_PIX_FMT_YUV420P as c_int;
            (*encoder.frame).width = width as c_int;
            (*encoder.frame).height = height as c_int;
        }
        check(
            unsafe { av_frame_get_buffer(encoder.frame, 0) },
            "av_frame_get_buffer",
        )?;

        tracing::info!(width, height, fps, bit_rate, "MPEG-4 encoder opened");
        Ok(encoder)
    }

    /// Codec extradata for container global headers, if the codec set any.
    pub fn extradata(&self) -> Vec<u8> {
        unsafe {
            let size = (*self.ctx).extradata_size;
            if size <= 0 || (*self.ctx).extradata.is_null() {
                return Vec::new();
            }
            std::slice::from_raw_parts((*self.ctx).extradata, size as usize).to_vec()
        }
    }

    /// Receive every packet the codec has ready.  "Needs more input" and
    /// "fully drained" both end the loop normally.
    fn drain(&mut self) -> Result<Vec<EncodedPacket>> {
        let mut packets = Vec::new();
        loop {
            let ret = unsafe { avcodec_receive_packet(self.ctx, self.pkt) };
            if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
                break;
            }
            check(ret, "avcodec_receive_packet")?;
            unsafe {
                packets.push(EncodedPacket {
                    data: std::slice::from_raw_parts((*self.pkt).data, (*self.pkt).size as usize)
                        .to_vec(),
                    pts: (*self.pkt).pts,
                    dts: (*self.pkt).dts,
                    keyframe: (*self.pkt).flags & AV_PKT_FLAG_KEY != 0,
                });
                av_packet_unref(self.pkt);
            }
        }
        Ok(packets)
    }

    fn fill_frame(&mut self, src: &[u8]) -> Result<()> {
        check(
            unsafe { av_frame_make_writable(self.frame) },
            "av_frame_make_writable",
        )?;
        let (w, h) = (self.width as usize, self.height as usize);
        debug_assert_eq!(src.len(), w * h + w * h / 2);

        let (y, uv) = src.split_at(w * h);
        let (u, v) = uv.split_at(w * h / 4);
        // The codec's linesize may exceed the plane width; copy row-wise.
        unsafe {
            for (plane, data, width, rows) in [
                (0usize, y, w, h),
                (1, u, w / 2, h / 2),
                (2, v, w / 2, h / 2),
            ] {
                let stride = (*self.frame).linesize[plane] as usize;
                let dst = (*self.frame).data[plane];
                for row in 0..rows {
                    ptr::copy_nonoverlapping(
                        data.as_ptr().add(row * width),
                        dst.add(row * stride),
                        width,
                    );
                }
            }
        }
        Ok(())
    }
}

impl VideoEncoder for Mpeg4Encoder {
    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn submit(&mut self, frame: &[u8], pts: i64) -> Result<Vec<EncodedPacket>> {
        self.fill_frame(frame)?;
        unsafe { (*self.frame).pts = pts };
        check(
            unsafe { avcodec_send_frame(self.ctx, self.frame) },
            "avcodec_send_frame",
        )?;
        self.drain()
    }

    fn finish(&mut self) -> Result<Vec<EncodedPacket>> {
        // End-of-stream marker is a null frame.
        let ret = unsafe { avcodec_send_frame(self.ctx, ptr::null()) };
        if ret != AVERROR_EOF {
            check(ret, "avcodec_send_frame (flush)")?;
        }
        self.drain()
    }
}

impl Drop for Mpeg4Encoder {
    fn drop(&mut self) {
        unsafe {
            av_packet_free(&mut self.pkt);
            av_frame_free(&mut self.frame);
            avcodec_free_context(&mut self.ctx);
        }
    }
}

// ─── Container sink ─────────────────────────────────────────────────────────

/// Muxes encoded packets into a container file; the format is auto-detected
/// from the extension.  The header is written lazily on the first packet
/// and packets are rescaled from the declared time base to whatever the
/// muxer settles on.
pub struct ContainerSink {
    fmt_ctx: *mut AVFormatContext,
    stream: *mut AVStream,
    pkt: *mut AVPacket,
    /// Time base packets are declared in (1/fps).
    declared_tb: Rational,
    /// Actual stream time base after avformat_write_header.
    stream_tb: Rational,
    header_written: bool,
    packets_written: u64,
}

// SAFETY: all muxer operations happen on the writer thread.
unsafe impl Send for ContainerSink {}

impl ContainerSink {
    pub fn new(
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
        extradata: &[u8],
    ) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| CastError::Mux("Non-UTF8 path".into()))?;
        let c_path = to_cstring(path_str)?;

        let mut fmt_ctx: *mut AVFormatContext = ptr::null_mut();
        let ret = unsafe {
            avformat_alloc_output_context2(&mut fmt_ctx, ptr::null(), ptr::null(), c_path.as_ptr())
        };
        if ret < 0 || fmt_ctx.is_null() {
            return Err(CastError::Mux(format!(
                "Failed to create output context for {}",
                path.display()
            )));
        }

        let stream = unsafe { avformat_new_stream(fmt_ctx, ptr::null()) };
        if stream.is_null() {
            unsafe { avformat_free_context(fmt_ctx) };
            return Err(CastError::Mux("Failed to create output stream".into()));
        }

        unsafe {
            let par = (*stream).codecpar;
            (*par).codec_type = AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*par).codec_id = AVCodecID::AV_CODEC_ID_MPEG4;
            (*par).width = width as c_int;
            (*par).height = height as c_int;
            if !extradata.is_empty() {
                let buf =
                    av_mallocz(extradata.len() + AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
                ptr::copy_nonoverlapping(extradata.as_ptr(), buf, extradata.len());
                (*par).extradata = buf;
                (*par).extradata_size = extradata.len() as c_int;
            }
            (*stream).time_base = AVRational {
                num: 1,
                den: fps as c_int,
            };
        }

        let needs_file = unsafe { (*(*fmt_ctx).oformat).flags & AVFMT_NOFILE == 0 };
        if needs_file {
            let ret = unsafe { avio_open(&mut (*fmt_ctx).pb, c_path.as_ptr(), AVIO_FLAG_WRITE) };
            if ret < 0 {
                unsafe { avformat_free_context(fmt_ctx) };
                return Err(CastError::Mux(format!("avio_open: {}", av_err(ret))));
            }
        }

        let pkt = unsafe { av_packet_alloc() };
        if pkt.is_null() {
            unsafe {
                if needs_file {
                    avio_closep(&mut (*fmt_ctx).pb);
                }
                avformat_free_context(fmt_ctx);
            }
            return Err(CastError::Mux("Failed to allocate AVPacket".into()));
        }

        tracing::info!(
            path = %path.display(),
            width,
            height,
            fps,
            "Container sink opened"
        );

        Ok(Self {
            fmt_ctx,
            stream,
            pkt,
            declared_tb: Rational::per_frame(fps),
            stream_tb: Rational::new(1, fps as i32),
            header_written: false,
            packets_written: 0,
        })
    }

    fn write_header_if_needed(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        check(
            unsafe { avformat_write_header(self.fmt_ctx, ptr::null_mut()) },
            "avformat_write_header",
        )
        .map_err(|e| CastError::Mux(e.to_string()))?;

        // The muxer may adjust the stream time base.
        let tb = unsafe { (*self.stream).time_base };
        self.stream_tb = Rational::new(tb.num, tb.den);
        tracing::debug!(
            time_base_num = tb.num,
            time_base_den = tb.den,
            "Container header written"
        );
        self.header_written = true;
        Ok(())
    }
}

impl PacketSink for ContainerSink {
    fn time_base(&self) -> Rational {
        self.declared_tb
    }

    fn write_packet(&mut self, packet: &EncodedPacket) -> Result<()> {
        self.write_header_if_needed()?;

        unsafe {
            check(
                av_new_packet(self.pkt, packet.data.len() as c_int),
                "av_new_packet",
            )
            .map_err(|e| CastError::Mux(e.to_string()))?;
            ptr::copy_nonoverlapping(packet.data.as_ptr(), (*self.pkt).data, packet.data.len());

            (*self.pkt).pts = rescale(packet.pts, self.declared_tb, self.stream_tb);
            (*self.pkt).dts = rescale(packet.dts, self.declared_tb, self.stream_tb);
            (*self.pkt).duration = rescale(1, self.declared_tb, self.stream_tb);
            (*self.pkt).stream_index = 0;
            if packet.keyframe {
                (*self.pkt).flags |= AV_PKT_FLAG_KEY;
            }

            // Takes ownership and unrefs internally.
            check(
                av_interleaved_write_frame(self.fmt_ctx, self.pkt),
                "av_interleaved_write_frame",
            )
            .map_err(|e| CastError::Mux(e.to_string()))?;
        }

        self.packets_written += 1;
        if self.packets_written % 100 == 0 {
            tracing::debug!(packets = self.packets_written, "Muxer progress");
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<u64> {
        if self.header_written {
            check(
                unsafe { av_write_trailer(self.fmt_ctx) },
                "av_write_trailer",
            )
            .map_err(|e| CastError::Mux(e.to_string()))?;
        }
        tracing::info!(packets = self.packets_written, "Container finalized");
        Ok(self.packets_written)
    }
}

impl Drop for ContainerSink {
    fn drop(&mut self) {
        unsafe {
            av_packet_free(&mut self.pkt);
            if !(*self.fmt_ctx).oformat.is_null()
                && (*(*self.fmt_ctx).oformat).flags & AVFMT_NOFILE == 0
                && !(*self.fmt_ctx).pb.is_null()
            {
                avio_closep(&mut (*self.fmt_ctx).pb);
            }
            avformat_free_context(self.fmt_ctx);
            self.fmt_ctx = ptr::null_mut();
        }
    }
}
