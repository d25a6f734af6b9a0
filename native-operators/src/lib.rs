//! Reference implementation of the native operator library ABI.
//!
//! Every symbol is exported unmangled with the C calling convention, so the
//! `cdylib` build of this crate can be loaded by `expr-engine` (in process or
//! through the worker) like any third-party math library.

use std::ffi::c_void;

use libc::c_char;

pub const FLAG_SSE: u32 = 1 << 0;
pub const FLAG_SSE2: u32 = 1 << 1;
pub const FLAG_AVX: u32 = 1 << 2;
pub const FLAG_AVX2: u32 = 1 << 3;

/// Metadata returned by `get_extension_info`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExtensionInfo {
    pub library_name: *const c_char,
    pub version_major: u16,
    pub version_minor: u16,
    pub version_build: u16,
    pub flags: u32,
}

const LIBRARY_NAME: &[u8] = b"Rust libm\0";

const fn parse_version(s: &str) -> u16 {
    let bytes = s.as_bytes();
    let mut value = 0u16;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u16;
        i += 1;
    }
    value
}

const fn compiled_flags() -> u32 {
    let mut flags = 0;
    if cfg!(target_feature = "sse") {
        flags |= FLAG_SSE;
    }
    if cfg!(target_feature = "sse2") {
        flags |= FLAG_SSE2;
    }
    if cfg!(target_feature = "avx") {
        flags |= FLAG_AVX;
    }
    if cfg!(target_feature = "avx2") {
        flags |= FLAG_AVX2;
    }
    flags
}

#[no_mangle]
pub extern "C" fn get_extension_info() -> ExtensionInfo {
    ExtensionInfo {
        library_name: LIBRARY_NAME.as_ptr() as *const c_char,
        version_major: parse_version(env!("CARGO_PKG_VERSION_MAJOR")),
        version_minor: parse_version(env!("CARGO_PKG_VERSION_MINOR")),
        version_build: parse_version(env!("CARGO_PKG_VERSION_PATCH")),
        flags: compiled_flags(),
    }
}

#[no_mangle]
pub extern "C" fn constant_e() -> f64 {
    std::f64::consts::E
}

#[no_mangle]
pub extern "C" fn constant_pi() -> f64 {
    std::f64::consts::PI
}

#[no_mangle]
pub extern "C" fn operator_add(x: f64, y: f64) -> f64 {
    x + y
}

#[no_mangle]
pub extern "C" fn operator_subtract(x: f64, y: f64) -> f64 {
    x - y
}

#[no_mangle]
pub extern "C" fn operator_multiply(x: f64, y: f64) -> f64 {
    x * y
}

#[no_mangle]
pub extern "C" fn operator_divide(x: f64, y: f64) -> f64 {
    x / y
}

#[no_mangle]
pub extern "C" fn operator_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

#[no_mangle]
pub extern "C" fn operator_remainder(x: f64, y: f64) -> f64 {
    x % y
}

#[no_mangle]
pub extern "C" fn operator_abs(x: f64) -> f64 {
    x.abs()
}

#[no_mangle]
pub extern "C" fn operator_sqrt(x: f64) -> f64 {
    x.sqrt()
}

#[no_mangle]
pub extern "C" fn operator_exp(x: f64) -> f64 {
    x.exp()
}

#[no_mangle]
pub extern "C" fn operator_ln(x: f64) -> f64 {
    x.ln()
}

#[no_mangle]
pub extern "C" fn operator_log(x: f64) -> f64 {
    x.log10()
}

#[no_mangle]
pub extern "C" fn operator_sin(x: f64) -> f64 {
    x.sin()
}

#[no_mangle]
pub extern "C" fn operator_cos(x: f64) -> f64 {
    x.cos()
}

#[no_mangle]
pub extern "C" fn operator_tan(x: f64) -> f64 {
    x.tan()
}

#[no_mangle]
pub extern "C" fn operator_asin(x: f64) -> f64 {
    x.asin()
}

#[no_mangle]
pub extern "C" fn operator_acos(x: f64) -> f64 {
    x.acos()
}

#[no_mangle]
pub extern "C" fn operator_atan(x: f64) -> f64 {
    x.atan()
}

#[no_mangle]
pub extern "C" fn operator_sinh(x: f64) -> f64 {
    x.sinh()
}

#[no_mangle]
pub extern "C" fn operator_cosh(x: f64) -> f64 {
    x.cosh()
}

#[no_mangle]
pub extern "C" fn operator_tanh(x: f64) -> f64 {
    x.tanh()
}

/// Rounds half away from zero, like C `round`.
#[no_mangle]
pub extern "C" fn operator_round(x: f64) -> f64 {
    x.round()
}

#[no_mangle]
pub extern "C" fn operator_floor(x: f64) -> f64 {
    x.floor()
}

#[no_mangle]
pub extern "C" fn operator_ceil(x: f64) -> f64 {
    x.ceil()
}

/// Name and address of every exported symbol.
///
/// Lets Rust callers that link this crate as an `rlib` hand out the same
/// C-ABI function pointers a loaded `cdylib` would.
pub fn exported_symbols() -> [(&'static str, *const c_void); 26] {
    [
        ("get_extension_info", get_extension_info as *const c_void),
        ("constant_e", constant_e as *const c_void),
        ("constant_pi", constant_pi as *const c_void),
        ("operator_add", operator_add as *const c_void),
        ("operator_subtract", operator_subtract as *const c_void),
        ("operator_multiply", operator_multiply as *const c_void),
        ("operator_divide", operator_divide as *const c_void),
        ("operator_pow", operator_pow as *const c_void),
        ("operator_remainder", operator_remainder as *const c_void),
        ("operator_abs", operator_abs as *const c_void),
        ("operator_sqrt", operator_sqrt as *const c_void),
        ("operator_exp", operator_exp as *const c_void),
        ("operator_ln", operator_ln as *const c_void),
        ("operator_log", operator_log as *const c_void),
        ("operator_sin", operator_sin as *const c_void),
        ("operator_cos", operator_cos as *const c_void),
        ("operator_tan", operator_tan as *const c_void),
        ("operator_asin", operator_asin as *const c_void),
        ("operator_acos", operator_acos as *const c_void),
        ("operator_atan", operator_atan as *const c_void),
        ("operator_sinh", operator_sinh as *const c_void),
        ("operator_cosh", operator_cosh as *const c_void),
        ("operator_tanh", operator_tanh as *const c_void),
        ("operator_round", operator_round as *const c_void),
        ("operator_floor", operator_floor as *const c_void),
        ("operator_ceil", operator_ceil as *const c_void),
    ]
}
