//! Structured clone codec: serialize a JavaScript value graph into a
//! self-describing byte sequence and rebuild it inside another engine
//! instance.
//!
//! This is the only way values cross a worker boundary: engine handles are
//! thread-affine, bytes are not. The format is a tag-dispatched binary
//! layout, little-endian throughout, with `u32` counts and length-prefixed
//! UTF-8 strings:
//!
//! ```text
//! value      := tag:u8 payload
//!
//! Undefined / Null / BoolTrue / BoolFalse
//!            := (no payload)
//! Int32      := i32 LE
//! Double     := f64 LE (IEEE-754)
//! String     := len:u32 utf8-bytes
//! Object     := count:u32 (key:string value)*
//! Array      := len:u32 value*            (holes materialize as Undefined)
//! Date       := millis:f64
//! RegExp     := source:string flags:string
//! Map        := count:u32 (key:value value:value)*   (iteration order)
//! Set        := count:u32 value*                     (iteration order)
//! Error..URIError
//!            := name:string message:string
//! ArrayBuffer
//!            := len:u32 raw-bytes
//! DataView / typed arrays
//!            := buf_len:u32 raw-bytes offset:u32 length:u32
//! ObjectRef  := id:u32     (back-reference to an already-decoded container)
//! ```
//!
//! Object, Array, Map and Set are registered in a reference table before
//! their children are walked, so cyclic graphs serialize as a tree plus
//! `ObjectRef` back-edges. Date, RegExp, errors and binary views cannot
//! participate in cycles and are not registered.

use thiserror::Error;

mod buffer;
mod reader;
mod writer;

pub use buffer::{ReadBuffer, WriteBuffer};
pub use reader::decode_value;
pub use writer::encode_value;

/// Maximum nesting depth accepted by the encoder.
pub const MAX_DEPTH: usize = 1000;

/// Maximum serialized payload size accepted by the encoder (100 MiB).
pub const MAX_SIZE: usize = 100 * 1024 * 1024;

/// Type tags of the wire format. The numeric values are stable; new kinds
/// get new tags, existing tags never change meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloneTag {
    // Primitives (0x00-0x0F)
    Undefined = 0x00,
    Null = 0x01,
    BoolTrue = 0x02,
    BoolFalse = 0x03,
    Int32 = 0x04,
    Double = 0x05,
    /// Reserved; the encoder rejects BigInt values.
    BigInt = 0x06,
    String = 0x07,

    // Containers and built-ins (0x10-0x15)
    Object = 0x10,
    Array = 0x11,
    Date = 0x12,
    RegExp = 0x13,
    Map = 0x14,
    Set = 0x15,

    // Error kinds (0x16-0x1C)
    Error = 0x16,
    EvalError = 0x17,
    RangeError = 0x18,
    ReferenceError = 0x19,
    SyntaxError = 0x1A,
    TypeError = 0x1B,
    UriError = 0x1C,

    // Binary data (0x20-0x2C)
    ArrayBuffer = 0x20,
    DataView = 0x21,
    Int8Array = 0x22,
    Uint8Array = 0x23,
    Uint8ClampedArray = 0x24,
    Int16Array = 0x25,
    Uint16Array = 0x26,
    Int32Array = 0x27,
    Uint32Array = 0x28,
    Float32Array = 0x29,
    Float64Array = 0x2A,
    BigInt64Array = 0x2B,
    BigUint64Array = 0x2C,

    // Back-references (0xF0+)
    ObjectRef = 0xF0,
}

impl CloneTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0x00 => Self::Undefined,
            0x01 => Self::Null,
            0x02 => Self::BoolTrue,
            0x03 => Self::BoolFalse,
            0x04 => Self::Int32,
            0x05 => Self::Double,
            0x06 => Self::BigInt,
            0x07 => Self::String,
            0x10 => Self::Object,
            0x11 => Self::Array,
            0x12 => Self::Date,
            0x13 => Self::RegExp,
            0x14 => Self::Map,
            0x15 => Self::Set,
            0x16 => Self::Error,
            0x17 => Self::EvalError,
            0x18 => Self::RangeError,
            0x19 => Self::ReferenceError,
            0x1A => Self::SyntaxError,
            0x1B => Self::TypeError,
            0x1C => Self::UriError,
            0x20 => Self::ArrayBuffer,
            0x21 => Self::DataView,
            0x22 => Self::Int8Array,
            0x23 => Self::Uint8Array,
            0x24 => Self::Uint8ClampedArray,
            0x25 => Self::Int16Array,
            0x26 => Self::Uint16Array,
            0x27 => Self::Int32Array,
            0x28 => Self::Uint32Array,
            0x29 => Self::Float32Array,
            0x2A => Self::Float64Array,
            0x2B => Self::BigInt64Array,
            0x2C => Self::BigUint64Array,
            0xF0 => Self::ObjectRef,
            _ => return None,
        })
    }
}

/// Errors raised by the clone codec.
///
/// Encode-side failures carry the `DataCloneError:` prefix in their display
/// form and surface into worker scripts as catchable errors at the
/// `postMessage` call site. Decode-side failures are host-facing only and
/// route through the error callback.
#[derive(Debug, Error)]
pub enum CloneError {
    #[error("DataCloneError: {0} cannot be cloned")]
    NotCloneable(&'static str),

    #[error("DataCloneError: maximum recursion depth exceeded")]
    DepthExceeded,

    #[error("DataCloneError: maximum serialization size exceeded")]
    SizeExceeded,

    #[error("invalid clone data: unexpected end of buffer")]
    UnexpectedEof,

    #[error("invalid clone data: unknown type tag 0x{0:02X}")]
    UnknownTag(u8),

    #[error("invalid clone data: dangling object reference {0}")]
    DanglingRef(u32),

    #[error("invalid clone data: malformed UTF-8 string")]
    InvalidUtf8,

    /// The engine itself failed while walking or rebuilding the graph
    /// (a throwing getter, an out-of-memory constructor, ...).
    #[error("engine error during clone: {0}")]
    Engine(String),
}

impl From<boa_engine::JsError> for CloneError {
    fn from(err: boa_engine::JsError) -> Self {
        CloneError::Engine(err.to_string())
    }
}
