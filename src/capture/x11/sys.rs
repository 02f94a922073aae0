//! Raw FFI bindings to Xlib, XComposite and GLX/GL.
//!
//! Covers the minimal subset required by the composite-redirect capture
//! session in [`super`]: window enumeration, composite redirection,
//! FBConfig selection, pixmap-backed GL textures and pixel-pack buffer
//! readback.
//!
//! # Linking
//!
//! `build.rs` emits `-l X11`, `-l Xcomposite` and `-l GL` when the
//! `x11-grab` feature is enabled.  `X11_LIB_DIR` adds a search path.
//!
//! # Safety
//!
//! Everything here is `unsafe extern "C"`.  The safe wrapper in the parent
//! module enforces the acquisition/teardown ordering and the thread
//! affinity of the GL context.

#![allow(non_camel_case_types, non_snake_case, dead_code)]

use std::ffi::c_void;
use std::os::raw::{c_char, c_int, c_long, c_uchar, c_uint, c_ulong};

// ═══════════════════════════════════════════════════════════════════════════
//  XLIB
// ═══════════════════════════════════════════════════════════════════════════

pub enum Display {}
pub enum Visual {}
pub enum Screen {}

pub type XID = c_ulong;
pub type Window = XID;
pub type Pixmap = XID;
pub type Colormap = XID;
pub type VisualID = XID;
pub type Atom = c_ulong;
pub type Bool = c_int;
pub type Status = c_int;

pub const FALSE: Bool = 0;
pub const TRUE: Bool = 1;
pub const SUCCESS: c_int = 0;
pub const NONE: XID = 0;
pub const ANY_PROPERTY_TYPE: Atom = 0;

#[repr(C)]
pub struct XWindowAttributes {
    pub x: c_int,
    pub y: c_int,
    pub width: c_int,
    pub height: c_int,
    pub border_width: c_int,
    pub depth: c_int,
    pub visual: *mut Visual,
    pub root: Window,
    pub class: c_int,
    pub bit_gravity: c_int,
    pub win_gravity: c_int,
    pub backing_store: c_int,
    pub backing_planes: c_ulong,
    pub backing_pixel: c_ulong,
    pub save_under: Bool,
    pub colormap: Colormap,
    pub map_installed: Bool,
    pub map_state: c_int,
    pub all_event_masks: c_long,
    pub your_event_mask: c_long,
    pub do_not_propagate_mask: c_long,
    pub override_redirect: Bool,
    pub screen: *mut Screen,
}

#[repr(C)]
pub struct XVisualInfo {
    pub visual: *mut Visual,
    pub visualid: VisualID,
    pub screen: c_int,
    pub depth: c_int,
    pub class: c_int,
    pub red_mask: c_ulong,
    pub green_mask: c_ulong,
    pub blue_mask: c_ulong,
    pub colormap_size: c_int,
    pub bits_per_rgb: c_int,
}

#[repr(C)]
pub struct XErrorEvent {
    pub type_: c_int,
    pub display: *mut Display,
    pub resourceid: XID,
    pub serial: c_ulong,
    pub error_code: c_uchar,
    pub request_code: c_uchar,
    pub minor_code: c_uchar,
}

pub type XErrorHandler =
    Option<unsafe extern "C" fn(display: *mut Display, event: *mut XErrorEvent) -> c_int>;

#[link(name = "X11")]
extern "C" {
    pub fn XOpenDisplay(display_name: *const c_char) -> *mut Display;
    pub fn XCloseDisplay(display: *mut Display) -> c_int;
    pub fn XDefaultRootWindow(display: *mut Display) -> Window;
    pub fn XInternAtom(display: *mut Display, name: *const c_char, only_if_exists: Bool) -> Atom;
    pub fn XGetWindowProperty(
        display: *mut Display,
        window: Window,
        property: Atom,
        long_offset: c_long,
        long_length: c_long,
        delete: Bool,
        req_type: Atom,
        actual_type: *mut Atom,
        actual_format: *mut c_int,
        nitems: *mut c_ulong,
        bytes_after: *mut c_ulong,
        prop: *mut *mut c_uchar,
    ) -> c_int;
    pub fn XGetWindowAttributes(
        display: *mut Display,
        window: Window,
        attributes: *mut XWindowAttributes,
    ) -> Status;
    pub fn XFree(data: *mut c_void) -> c_int;
    pub fn XFreePixmap(display: *mut Display, pixmap: Pixmap) -> c_int;
    pub fn XSync(display: *mut Display, discard: Bool) -> c_int;
    pub fn XSetErrorHandler(handler: XErrorHandler) -> XErrorHandler;
    pub fn XGetErrorText(
        display: *mut Display,
        code: c_int,
        buffer: *mut c_char,
        length: c_int,
    ) -> c_int;
}

// ═══════════════════════════════════════════════════════════════════════════
//  XCOMPOSITE
// ═══════════════════════════════════════════════════════════════════════════

pub const COMPOSITE_REDIRECT_AUTOMATIC: c_int = 0;
pub const COMPOSITE_REDIRECT_MANUAL: c_int = 1;

#[link(name = "Xcomposite")]
extern "C" {
    pub fn XCompositeQueryExtension(
        display: *mut Display,
        event_base: *mut c_int,
        error_base: *mut c_int,
    ) -> Bool;
    pub fn XCompositeQueryVersion(
        display: *mut Display,
        major: *mut c_int,
        minor: *mut c_int,
    ) -> Status;
    pub fn XCompositeRedirectWindow(display: *mut Display, window: Window, update: c_int);
    pub fn XCompositeUnredirectWindow(display: *mut Display, window: Window, update: c_int);
    pub fn XCompositeNameWindowPixmap(display: *mut Display, window: Window) -> Pixmap;
}

// ═══════════════════════════════════════════════════════════════════════════
//  GLX — texture-from-pixmap
// ═══════════════════════════════════════════════════════════════════════════

pub enum GLXFBConfigRec {}
pub type GLXFBConfig = *mut GLXFBConfigRec;
pub enum GLXContextRec {}
pub type GLXContext = *mut GLXContextRec;
pub type GLXPixmap = XID;
pub type GLXDrawable = XID;

pub const GLX_DOUBLEBUFFER: c_int = 5;
pub const GLX_DRAWABLE_TYPE: c_int = 0x8010;
pub const GLX_PIXMAP_BIT: c_int = 0x0000_0002;
pub const GLX_RGBA_TYPE: c_int = 0x8014;

pub const GLX_BIND_TO_TEXTURE_RGBA_EXT: c_int = 0x20D1;
pub const GLX_BIND_TO_TEXTURE_TARGETS_EXT: c_int = 0x20D3;
pub const GLX_TEXTURE_2D_BIT_EXT: c_int = 0x0000_0002;
pub const GLX_Y_INVERTED_EXT: c_int = 0x20D4;
pub const GLX_TEXTURE_FORMAT_EXT: c_int = 0x20D5;
pub const GLX_TEXTURE_TARGET_EXT: c_int = 0x20D6;
pub const GLX_TEXTURE_FORMAT_RGBA_EXT: c_int = 0x20DA;
pub const GLX_TEXTURE_2D_EXT: c_int = 0x20DC;
pub const GLX_FRONT_LEFT_EXT: c_int = 0x20DE;

/// `glXBindTexImageEXT` / `glXReleaseTexImageEXT`, resolved at runtime via
/// `glXGetProcAddressARB` (they are extension entry points, not exported).
pub type PFNGLXBINDTEXIMAGEEXTPROC = unsafe extern "C" fn(
    display: *mut Display,
    drawable: GLXDrawable,
    buffer: c_int,
    attrib_list: *const c_int,
);
pub type PFNGLXRELEASETEXIMAGEEXTPROC =
    unsafe extern "C" fn(display: *mut Display, drawable: GLXDrawable, buffer: c_int);

#[link(name = "GL")]
extern "C" {
    pub fn glXChooseFBConfig(
        display: *mut Display,
        screen: c_int,
        attrib_list: *const c_int,
        nelements: *mut c_int,
    ) -> *mut GLXFBConfig;
    pub fn glXGetVisualFromFBConfig(
        display: *mut Display,
        config: GLXFBConfig,
    ) -> *mut XVisualInfo;
    pub fn glXCreatePixmap(
        display: *mut Display,
        config: GLXFBConfig,
        pixmap: Pixmap,
        attrib_list: *const c_int,
    ) -> GLXPixmap;
    pub fn glXDestroyPixmap(display: *mut Display, pixmap: GLXPixmap);
    pub fn glXCreateNewContext(
        display: *mut Display,
        config: GLXFBConfig,
        render_type: c_int,
        share_list: GLXContext,
        direct: Bool,
    ) -> GLXContext;
    pub fn glXDestroyContext(display: *mut Display, context: GLXContext);
    pub fn glXMakeCurrent(
        display: *mut Display,
        drawable: GLXDrawable,
        context: GLXContext,
    ) -> Bool;
    pub fn glXGetProcAddressARB(
        name: *const c_uchar,
    ) -> Option<unsafe extern "C" fn()>;
}

// ═══════════════════════════════════════════════════════════════════════════
//  GL — texture readback + pixel-pack buffers
// ═══════════════════════════════════════════════════════════════════════════

pub type GLenum = c_uint;
pub type GLint = c_int;
pub type GLuint = c_uint;
pub type GLsizei = c_int;
pub type GLsizeiptr = isize;
pub type GLboolean = c_uchar;

pub const GL_TEXTURE_2D: GLenum = 0x0DE1;
pub const GL_RGBA: GLenum = 0x1908;
pub const GL_UNSIGNED_BYTE: GLenum = 0x1401;
pub const GL_TEXTURE_MAG_FILTER: GLenum = 0x2800;
pub const GL_TEXTURE_MIN_FILTER: GLenum = 0x2801;
pub const GL_NEAREST: GLint = 0x2600;

pub const GL_PIXEL_PACK_BUFFER: GLenum = 0x88EB;
pub const GL_STREAM_READ: GLenum = 0x88E1;
pub const GL_READ_ONLY: GLenum = 0x88B8;

#[link(name = "GL")]
extern "C" {
    pub fn glGenTextures(n: GLsizei, textures: *mut GLuint);
    pub fn glDeleteTextures(n: GLsizei, textures: *const GLuint);
    pub fn glBindTexture(target: GLenum, texture: GLuint);
    pub fn glTexParameteri(target: GLenum, pname: GLenum, param: GLint);
    pub fn glGetTexImage(
        target: GLenum,
        level: GLint,
        format: GLenum,
        type_: GLenum,
        pixels: *mut c_void,
    );
    pub fn glGetError() -> GLenum;

    pub fn glGenBuffers(n: GLsizei, buffers: *mut GLuint);
    pub fn glDeleteBuffers(n: GLsizei, buffers: *const GLuint);
    pub fn glBindBuffer(target: GLenum, buffer: GLuint);
    pub fn glBufferData(
        target: GLenum,
        size: GLsizeiptr,
        data: *const c_void,
        usage: GLenum,
    );
    pub fn glMapBuffer(target: GLenum, access: GLenum) -> *mut c_void;
    pub fn glUnmapBuffer(target: GLenum) -> GLboolean;
}
