//! X11 composite-redirect capture backend.
//!
//! Resource chain, acquired strictly in this order and released in reverse:
//! display connection → composite redirection of the target window → named
//! window pixmap → GLX pixmap → GL context → GL texture → optional
//! pixel-pack buffers.  Every acquisition registers its release on a
//! [`TeardownStack`], so a failure at any step unwinds exactly the partial
//! chain and `close` is idempotent.
//!
//! X reports many failures asynchronously through the error handler rather
//! than return codes; after each sensitive request the session syncs the
//! connection and drains [`error_channel`], converting anything pending
//! into a hard open failure.
//!
//! The GL context is made current on the opening thread and never migrates;
//! the session is not `Send` on purpose.

pub mod sys;

use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int, c_long, c_ulong};
use std::ptr::{self, NonNull};
use std::sync::Once;

use crate::capture::{error_channel, CaptureBackend, CaptureSession, SessionConfig, TeardownStack};
use crate::core::buffers::{BufferStrategy, GpuTransfer};
use crate::core::types::Geometry;
use crate::error::{CastError, Result};

use sys::*;

const NEED_COMPOSITE_MAJOR: c_int = 0;
const NEED_COMPOSITE_MINOR: c_int = 2;

static ERROR_HANDLER: Once = Once::new();

unsafe extern "C" fn forward_x_error(display: *mut Display, event: *mut XErrorEvent) -> c_int {
    let mut text = [0 as c_char; 192];
    XGetErrorText(
        display,
        (*event).error_code as c_int,
        text.as_mut_ptr(),
        text.len() as c_int,
    );
    let text = CStr::from_ptr(text.as_ptr()).to_string_lossy();
    error_channel::record(&format!(
        "request {} failed: {}",
        (*event).request_code, text
    ));
    0
}

/// Flush the connection and surface any error the handler captured since
/// the last check.
unsafe fn sync_check(display: *mut Display, step: &'static str) -> Result<()> {
    XSync(display, FALSE);
    if let Some(msg) = error_channel::take() {
        tracing::error!(step, error = %msg, "capture environment rejected a request");
        return Err(CastError::Environment(format!("{step}: {msg}")));
    }
    Ok(())
}

// ─── Window lookup ──────────────────────────────────────────────────────────

unsafe fn read_property(
    display: *mut Display,
    window: Window,
    property: Atom,
    req_type: Atom,
) -> Option<(Vec<u8>, c_int, usize)> {
    let mut actual_type: Atom = 0;
    let mut actual_format: c_int = 0;
    let mut nitems: c_ulong = 0;
    let mut bytes_after: c_ulong = 0;
    let mut prop: *mut u8 = ptr::null_mut();
    let status = XGetWindowProperty(
        display,
        window,
        property,
        0,
        4096,
        FALSE,
        req_type,
        &mut actual_type,
        &mut actual_format,
        &mut nitems,
        &mut bytes_after,
        &mut prop,
    );
    if status != SUCCESS || prop.is_null() {
        return None;
    }
    let item_bytes = match actual_format {
        // Format 32 properties are delivered as native longs.
        32 => std::mem::size_of::<c_long>(),
        16 => 2,
        _ => 1,
    };
    let data = std::slice::from_raw_parts(prop, nitems as usize * item_bytes).to_vec();
    XFree(prop as *mut c_void);
    Some((data, actual_format, nitems as usize))
}

unsafe fn atom(display: *mut Display, name: &str) -> Atom {
    let name = CString::new(name).expect("atom name has no NUL");
    XInternAtom(display, name.as_ptr(), FALSE)
}

unsafe fn client_list(display: *mut Display) -> Vec<Window> {
    let root = XDefaultRootWindow(display);
    let prop = atom(display, "_NET_CLIENT_LIST");
    let Some((data, format, nitems)) = read_property(display, root, prop, ANY_PROPERTY_TYPE)
    else {
        return Vec::new();
    };
    if format != 32 {
        return Vec::new();
    }
    // Format-32 items arrive as native longs; the property bytes are not
    // guaranteed to be long-aligned.
    let mut windows = Vec::with_capacity(nitems);
    for i in 0..nitems {
        let w = ptr::read_unaligned((data.as_ptr() as *const c_ulong).add(i));
        windows.push(w as Window);
    }
    windows
}

unsafe fn window_name(display: *mut Display, window: Window) -> Option<String> {
    let utf8 = atom(display, "UTF8_STRING");
    let named = [
        (atom(display, "_NET_WM_NAME"), utf8),
        (atom(display, "WM_NAME"), ANY_PROPERTY_TYPE),
    ];
    for (prop, req) in named {
        if let Some((data, _format, _n)) = read_property(display, window, prop, req) {
            if !data.is_empty() {
                return Some(String::from_utf8_lossy(&data).into_owned());
            }
        }
    }
    None
}

/// First window whose name contains `pattern`; first match wins.
unsafe fn find_target(display: *mut Display, pattern: &str) -> Result<Window> {
    for window in client_list(display) {
        if let Some(name) = window_name(display, window) {
            if name.contains(pattern) {
                tracing::info!(window, name = %name, "capture target resolved");
                return Ok(window);
            }
        }
    }
    Err(CastError::TargetNotFound(pattern.to_string()))
}

// ─── Pixel-pack buffer transfers ────────────────────────────────────────────

/// Pixel-pack buffer ring for the GPU-mapped strategy.  One buffer per
/// transfer slice; `begin_read` queues the texture readback into the
/// buffer, `map` blocks until it lands.
struct PboTransfer {
    display: *mut Display,
    glx_pixmap: GLXPixmap,
    texture: GLuint,
    bind_tex: PFNGLXBINDTEXIMAGEEXTPROC,
    release_tex: PFNGLXRELEASETEXIMAGEEXTPROC,
    buffers: Vec<GLuint>,
    frame_len: usize,
}

impl PboTransfer {
    unsafe fn rebind_texture(&self) {
        (self.release_tex)(self.display, self.glx_pixmap, GLX_FRONT_LEFT_EXT);
        (self.bind_tex)(self.display, self.glx_pixmap, GLX_FRONT_LEFT_EXT, ptr::null());
        glBindTexture(GL_TEXTURE_2D, self.texture);
    }
}

impl GpuTransfer for PboTransfer {
    fn begin_read(&mut self, index: usize) -> Result<()> {
        unsafe {
            self.rebind_texture();
            glBindBuffer(GL_PIXEL_PACK_BUFFER, self.buffers[index]);
            // With a pack buffer bound the pixels argument is an offset and
            // the readback is queued, not performed.
            glGetTexImage(GL_TEXTURE_2D, 0, GL_RGBA, GL_UNSIGNED_BYTE, ptr::null_mut());
            let err = glGetError();
            glBindBuffer(GL_PIXEL_PACK_BUFFER, 0);
            if err != 0 {
                return Err(CastError::Capture(format!(
                    "async texture readback failed, gl error {err:#x}"
                )));
            }
        }
        Ok(())
    }

    fn map(&mut self, index: usize) -> Result<(NonNull<u8>, usize)> {
        unsafe {
            glBindBuffer(GL_PIXEL_PACK_BUFFER, self.buffers[index]);
            let ptr = glMapBuffer(GL_PIXEL_PACK_BUFFER, GL_READ_ONLY);
            glBindBuffer(GL_PIXEL_PACK_BUFFER, 0);
            NonNull::new(ptr as *mut u8)
                .map(|p| (p, self.frame_len))
                .ok_or_else(|| {
                    CastError::ResourceAlloc(format!("mapping transfer buffer {index} failed"))
                })
        }
    }

    fn unmap(&mut self, index: usize) {
        unsafe {
            glBindBuffer(GL_PIXEL_PACK_BUFFER, self.buffers[index]);
            glUnmapBuffer(GL_PIXEL_PACK_BUFFER);
            glBindBuffer(GL_PIXEL_PACK_BUFFER, 0);
        }
    }
}

// ─── Session ────────────────────────────────────────────────────────────────

pub struct X11Session {
    display: *mut Display,
    glx_pixmap: GLXPixmap,
    texture: GLuint,
    bind_tex: PFNGLXBINDTEXIMAGEEXTPROC,
    release_tex: PFNGLXRELEASETEXIMAGEEXTPROC,
    geometry: Geometry,
    pbo: Option<PboTransfer>,
    teardown: TeardownStack,
}

impl X11Session {
    fn open(config: &SessionConfig) -> Result<Self> {
        ERROR_HANDLER.call_once(|| unsafe {
            XSetErrorHandler(Some(forward_x_error));
        });

        let mut teardown = TeardownStack::new();

        // Display connection.
        let display = unsafe { XOpenDisplay(ptr::null()) };
        if display.is_null() {
            return Err(CastError::Capture(
                "cannot open display; is DISPLAY set?".into(),
            ));
        }
        teardown.defer("display connection", move || unsafe {
            XCloseDisplay(display);
        });

        // Composite extension, with a version floor.
        let mut event_base = 0;
        let mut error_base = 0;
        if unsafe { XCompositeQueryExtension(display, &mut event_base, &mut error_base) } == FALSE
        {
            return Err(CastError::ExtensionMissing("XComposite".into()));
        }
        let (mut major, mut minor) = (0, 0);
        unsafe { XCompositeQueryVersion(display, &mut major, &mut minor) };
        if major < NEED_COMPOSITE_MAJOR
            || (major == NEED_COMPOSITE_MAJOR && minor < NEED_COMPOSITE_MINOR)
        {
            return Err(CastError::ExtensionTooOld {
                major,
                minor,
                need_major: NEED_COMPOSITE_MAJOR,
                need_minor: NEED_COMPOSITE_MINOR,
            });
        }

        // Target window, then composite hand-off.
        let window = unsafe { find_target(display, &config.target.pattern)? };
        unsafe {
            XCompositeRedirectWindow(display, window, COMPOSITE_REDIRECT_AUTOMATIC);
            sync_check(display, "composite redirect")?;
        }
        teardown.defer("composite redirection", move || unsafe {
            XCompositeUnredirectWindow(display, window, COMPOSITE_REDIRECT_AUTOMATIC);
        });

        // Geometry is read once and fixed for the session.
        let mut attrs: XWindowAttributes = unsafe { std::mem::zeroed() };
        if unsafe { XGetWindowAttributes(display, window, &mut attrs) } == 0 {
            return Err(CastError::Capture("reading window attributes failed".into()));
        }
        let geometry = Geometry::new(attrs.width as u32, attrs.height as u32, attrs.depth);

        // First FBConfig whose visual depth matches the target.
        let config_attribs = [
            GLX_BIND_TO_TEXTURE_RGBA_EXT,
            TRUE,
            GLX_DRAWABLE_TYPE,
            GLX_PIXMAP_BIT,
            GLX_BIND_TO_TEXTURE_TARGETS_EXT,
            GLX_TEXTURE_2D_BIT_EXT,
            GLX_DOUBLEBUFFER,
            FALSE,
            0,
        ];
        let mut nconfigs = 0;
        let configs =
            unsafe { glXChooseFBConfig(display, 0, config_attribs.as_ptr(), &mut nconfigs) };
        if configs.is_null() || nconfigs == 0 {
            return Err(CastError::NoCompatibleConfig {
                depth: geometry.depth,
            });
        }
        let mut chosen: GLXFBConfig = ptr::null_mut();
        for i in 0..nconfigs as usize {
            let fbc = unsafe { *configs.add(i) };
            let vi = unsafe { glXGetVisualFromFBConfig(display, fbc) };
            if vi.is_null() {
                continue;
            }
            let depth = unsafe { (*vi).depth };
            unsafe { XFree(vi as *mut c_void) };
            if depth == geometry.depth {
                chosen = fbc;
                break;
            }
        }
        unsafe { XFree(configs as *mut c_void) };
        if chosen.is_null() {
            return Err(CastError::NoCompatibleConfig {
                depth: geometry.depth,
            });
        }

        // Window pixmap → GLX pixmap.
        let pixmap = unsafe { XCompositeNameWindowPixmap(display, window) };
        unsafe { sync_check(display, "name window pixmap")? };
        teardown.defer("window pixmap", move || unsafe {
            XFreePixmap(display, pixmap);
        });

        let pixmap_attribs = [
            GLX_TEXTURE_TARGET_EXT,
            GLX_TEXTURE_2D_EXT,
            GLX_TEXTURE_FORMAT_EXT,
            GLX_TEXTURE_FORMAT_RGBA_EXT,
            0,
        ];
        let glx_pixmap =
            unsafe { glXCreatePixmap(display, chosen, pixmap, pixmap_attribs.as_ptr()) };
        unsafe { sync_check(display, "glx pixmap")? };
        teardown.defer("glx pixmap", move || unsafe {
            glXDestroyPixmap(display, glx_pixmap);
        });

        // GL context, current on this thread for the session's lifetime.
        let context =
            unsafe { glXCreateNewContext(display, chosen, GLX_RGBA_TYPE, ptr::null_mut(), TRUE) };
        if context.is_null() {
            return Err(CastError::ResourceAlloc("creating GL context failed".into()));
        }
        teardown.defer("gl context", move || unsafe {
            glXMakeCurrent(display, NONE, ptr::null_mut());
            glXDestroyContext(display, context);
        });
        if unsafe { glXMakeCurrent(display, glx_pixmap, context) } == FALSE {
            return Err(CastError::ResourceAlloc(
                "making GL context current failed".into(),
            ));
        }

        // Texture backing the redirected window contents.
        let mut texture: GLuint = 0;
        unsafe {
            glGenTextures(1, &mut texture);
            glBindTexture(GL_TEXTURE_2D, texture);
            glTexParameteri(GL_TEXTURE_2D, GL_TEXTURE_MIN_FILTER, GL_NEAREST);
            glTexParameteri(GL_TEXTURE_2D, GL_TEXTURE_MAG_FILTER, GL_NEAREST);
        }
        teardown.defer("gl texture", move || unsafe {
            glDeleteTextures(1, &texture);
        });

        // Extension entry points for texture-from-pixmap.
        let bind_tex = unsafe { glXGetProcAddressARB(b"glXBindTexImageEXT\0".as_ptr()) }
            .ok_or_else(|| CastError::ExtensionMissing("GLX_EXT_texture_from_pixmap".into()))?;
        let release_tex = unsafe { glXGetProcAddressARB(b"glXReleaseTexImageEXT\0".as_ptr()) }
            .ok_or_else(|| CastError::ExtensionMissing("GLX_EXT_texture_from_pixmap".into()))?;
        // SAFETY: entry points resolved by name; signatures per the
        // GLX_EXT_texture_from_pixmap specification.
        let bind_tex: PFNGLXBINDTEXIMAGEEXTPROC = unsafe { std::mem::transmute(bind_tex) };
        let release_tex: PFNGLXRELEASETEXIMAGEEXTPROC =
            unsafe { std::mem::transmute(release_tex) };
        unsafe { (bind_tex)(display, glx_pixmap, GLX_FRONT_LEFT_EXT, ptr::null()) };
        unsafe { sync_check(display, "bind tex image")? };

        // Transfer buffers for the GPU-mapped strategy.
        let pbo = if config.strategy == BufferStrategy::GpuMapped {
            let count = config.transfer_slices.max(1);
            let mut buffers = vec![0 as GLuint; count];
            unsafe {
                glGenBuffers(count as GLsizei, buffers.as_mut_ptr());
                for &id in &buffers {
                    glBindBuffer(GL_PIXEL_PACK_BUFFER, id);
                    glBufferData(
                        GL_PIXEL_PACK_BUFFER,
                        geometry.frame_len() as GLsizeiptr,
                        ptr::null(),
                        GL_STREAM_READ,
                    );
                }
                glBindBuffer(GL_PIXEL_PACK_BUFFER, 0);
            }
            {
                let ids = buffers.clone();
                teardown.defer("pixel-pack buffers", move || unsafe {
                    glDeleteBuffers(ids.len() as GLsizei, ids.as_ptr());
                });
            }
            Some(PboTransfer {
                display,
                glx_pixmap,
                texture,
                bind_tex,
                release_tex,
                buffers,
                frame_len: geometry.frame_len(),
            })
        } else {
            None
        };

        Ok(Self {
            display,
            glx_pixmap,
            texture,
            bind_tex,
            release_tex,
            geometry,
            pbo,
            teardown,
        })
    }
}

impl CaptureSession for X11Session {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn grab_into(&mut self, dst: &mut [u8]) -> Result<()> {
        debug_assert_eq!(dst.len(), self.geometry.frame_len());
        unsafe {
            (self.release_tex)(self.display, self.glx_pixmap, GLX_FRONT_LEFT_EXT);
            (self.bind_tex)(self.display, self.glx_pixmap, GLX_FRONT_LEFT_EXT, ptr::null());
            glBindTexture(GL_TEXTURE_2D, self.texture);
            glGetTexImage(
                GL_TEXTURE_2D,
                0,
                GL_RGBA,
                GL_UNSIGNED_BYTE,
                dst.as_mut_ptr() as *mut c_void,
            );
            let err = glGetError();
            if err != 0 {
                return Err(CastError::Capture(format!(
                    "texture readback failed, gl error {err:#x}"
                )));
            }
        }
        Ok(())
    }

    fn transfer(&mut self) -> Option<&mut dyn GpuTransfer> {
        self.pbo.as_mut().map(|p| p as &mut dyn GpuTransfer)
    }

    fn close(&mut self) {
        self.teardown.teardown();
    }
}

impl Drop for X11Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Backend factory for composite-redirect sessions.
#[derive(Default)]
pub struct X11Backend;

impl CaptureBackend for X11Backend {
    type Session = X11Session;

    fn open(&mut self, config: &SessionConfig) -> Result<X11Session> {
        X11Session::open(config)
    }
}
