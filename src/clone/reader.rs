//! Deserialization half of the structured clone codec.
//!
//! Reads a tagged byte sequence and rebuilds the value graph inside the
//! target engine. Containers are registered in a positional reference
//! table *before* their children are read, mirroring the encoder's
//! registration order, so `ObjectRef` back-edges resolve to the container
//! currently under construction and cycles come out as true identity.

use boa_engine::object::builtins::JsArrayBuffer;
use boa_engine::object::ObjectInitializer;
use boa_engine::{js_string, Context, JsObject, JsValue};

use crate::clone::{CloneError, CloneTag, ReadBuffer};

/// Rebuild a value from `bytes` inside `context`.
pub fn decode_value(bytes: &[u8], context: &mut Context) -> Result<JsValue, CloneError> {
    let mut reader = ReadBuffer::new(bytes);
    let mut decoder = ValueDecoder { refs: Vec::new() };
    decoder.read_value(&mut reader, context)
}

struct ValueDecoder {
    // Positional reference table: index is the reference id.
    refs: Vec<JsObject>,
}

impl ValueDecoder {
    fn read_value(
        &mut self,
        reader: &mut ReadBuffer<'_>,
        context: &mut Context,
    ) -> Result<JsValue, CloneError> {
        let tag_byte = reader.read_u8()?;
        let tag = CloneTag::from_u8(tag_byte).ok_or(CloneError::UnknownTag(tag_byte))?;

        match tag {
            CloneTag::Undefined => Ok(JsValue::undefined()),
            CloneTag::Null => Ok(JsValue::null()),
            CloneTag::BoolTrue => Ok(JsValue::from(true)),
            CloneTag::BoolFalse => Ok(JsValue::from(false)),
            CloneTag::Int32 => Ok(JsValue::from(reader.read_i32()?)),
            CloneTag::Double => Ok(JsValue::from(reader.read_f64()?)),
            // Reserved tag: nothing ever encodes it.
            CloneTag::BigInt => Err(CloneError::UnknownTag(tag_byte)),
            CloneTag::String => {
                let string = reader.read_string()?;
                Ok(JsValue::from(js_string!(string)))
            }
            CloneTag::Object => self.read_plain_object(reader, context),
            CloneTag::Array => self.read_array(reader, context),
            CloneTag::Date => {
                let millis = reader.read_f64()?;
                let date = construct_global("Date", &[JsValue::from(millis)], context)?;
                Ok(JsValue::from(date))
            }
            CloneTag::RegExp => {
                let source = reader.read_string()?;
                let flags = reader.read_string()?;
                let regexp = construct_global(
                    "RegExp",
                    &[
                        JsValue::from(js_string!(source)),
                        JsValue::from(js_string!(flags)),
                    ],
                    context,
                )?;
                Ok(JsValue::from(regexp))
            }
            CloneTag::Map => self.read_map(reader, context),
            CloneTag::Set => self.read_set(reader, context),
            CloneTag::Error
            | CloneTag::EvalError
            | CloneTag::RangeError
            | CloneTag::ReferenceError
            | CloneTag::SyntaxError
            | CloneTag::TypeError
            | CloneTag::UriError => read_error(tag, reader, context),
            CloneTag::ArrayBuffer => {
                let byte_length = reader.read_u32()? as usize;
                let bytes = reader.read_bytes(byte_length)?.to_vec();
                let buffer = JsArrayBuffer::from_byte_block(bytes, context)?;
                Ok(JsValue::from(buffer))
            }
            CloneTag::DataView
            | CloneTag::Int8Array
            | CloneTag::Uint8Array
            | CloneTag::Uint8ClampedArray
            | CloneTag::Int16Array
            | CloneTag::Uint16Array
            | CloneTag::Int32Array
            | CloneTag::Uint32Array
            | CloneTag::Float32Array
            | CloneTag::Float64Array
            | CloneTag::BigInt64Array
            | CloneTag::BigUint64Array => read_view(tag, reader, context),
            CloneTag::ObjectRef => {
                let id = reader.read_u32()?;
                self.refs
                    .get(id as usize)
                    .cloned()
                    .map(JsValue::from)
                    .ok_or(CloneError::DanglingRef(id))
            }
        }
    }

    fn read_plain_object(
        &mut self,
        reader: &mut ReadBuffer<'_>,
        context: &mut Context,
    ) -> Result<JsValue, CloneError> {
        let count = reader.read_u32()?;
        let object = ObjectInitializer::new(context).build();
        // Register before children so back-references into this object
        // resolve while it is still being populated.
        self.refs.push(object.clone());

        for _ in 0..count {
            let key = reader.read_string()?;
            let value = self.read_value(reader, context)?;
            object.set(js_string!(key), value, true, context)?;
        }
        Ok(JsValue::from(object))
    }

    fn read_array(
        &mut self,
        reader: &mut ReadBuffer<'_>,
        context: &mut Context,
    ) -> Result<JsValue, CloneError> {
        let length = reader.read_u32()?;
        let array = construct_global("Array", &[JsValue::from(length)], context)?;
        self.refs.push(array.clone());

        for index in 0..length {
            let element = self.read_value(reader, context)?;
            array.set(index, element, true, context)?;
        }
        Ok(JsValue::from(array))
    }

    fn read_map(
        &mut self,
        reader: &mut ReadBuffer<'_>,
        context: &mut Context,
    ) -> Result<JsValue, CloneError> {
        let count = reader.read_u32()?;
        let map = construct_global("Map", &[], context)?;
        self.refs.push(map.clone());

        let set_fn = map.get(js_string!("set"), context)?;
        let set_fn = set_fn
            .as_callable()
            .ok_or_else(|| CloneError::Engine("Map.prototype.set missing".into()))?
            .clone();
        for _ in 0..count {
            let key = self.read_value(reader, context)?;
            let value = self.read_value(reader, context)?;
            set_fn.call(&JsValue::from(map.clone()), &[key, value], context)?;
        }
        Ok(JsValue::from(map))
    }

    fn read_set(
        &mut self,
        reader: &mut ReadBuffer<'_>,
        context: &mut Context,
    ) -> Result<JsValue, CloneError> {
        let count = reader.read_u32()?;
        let set = construct_global("Set", &[], context)?;
        self.refs.push(set.clone());

        let add_fn = set.get(js_string!("add"), context)?;
        let add_fn = add_fn
            .as_callable()
            .ok_or_else(|| CloneError::Engine("Set.prototype.add missing".into()))?
            .clone();
        for _ in 0..count {
            let value = self.read_value(reader, context)?;
            add_fn.call(&JsValue::from(set.clone()), &[value], context)?;
        }
        Ok(JsValue::from(set))
    }
}

fn read_error(
    tag: CloneTag,
    reader: &mut ReadBuffer<'_>,
    context: &mut Context,
) -> Result<JsValue, CloneError> {
    let name = reader.read_string()?;
    let message = reader.read_string()?;

    let ctor_name = match tag {
        CloneTag::EvalError => "EvalError",
        CloneTag::RangeError => "RangeError",
        CloneTag::ReferenceError => "ReferenceError",
        CloneTag::SyntaxError => "SyntaxError",
        CloneTag::TypeError => "TypeError",
        CloneTag::UriError => "URIError",
        _ => "Error",
    };

    let error = construct_global(
        ctor_name,
        &[JsValue::from(js_string!(message))],
        context,
    )?;
    // Keeps a custom name alive through the generic Error tag.
    error.set(js_string!("name"), JsValue::from(js_string!(name)), true, context)?;
    Ok(JsValue::from(error))
}

fn read_view(
    tag: CloneTag,
    reader: &mut ReadBuffer<'_>,
    context: &mut Context,
) -> Result<JsValue, CloneError> {
    let buffer_byte_length = reader.read_u32()? as usize;
    let bytes = reader.read_bytes(buffer_byte_length)?.to_vec();
    let byte_offset = reader.read_u32()?;
    let length = reader.read_u32()?;

    let buffer = JsArrayBuffer::from_byte_block(bytes, context)?;
    let ctor_name = match tag {
        CloneTag::DataView => "DataView",
        CloneTag::Int8Array => "Int8Array",
        CloneTag::Uint8Array => "Uint8Array",
        CloneTag::Uint8ClampedArray => "Uint8ClampedArray",
        CloneTag::Int16Array => "Int16Array",
        CloneTag::Uint16Array => "Uint16Array",
        CloneTag::Int32Array => "Int32Array",
        CloneTag::Uint32Array => "Uint32Array",
        CloneTag::Float32Array => "Float32Array",
        CloneTag::Float64Array => "Float64Array",
        CloneTag::BigInt64Array => "BigInt64Array",
        _ => "BigUint64Array",
    };

    let view = construct_global(
        ctor_name,
        &[
            JsValue::from(buffer),
            JsValue::from(byte_offset),
            JsValue::from(length),
        ],
        context,
    )?;
    Ok(JsValue::from(view))
}

fn construct_global(
    name: &str,
    args: &[JsValue],
    context: &mut Context,
) -> Result<JsObject, CloneError> {
    let ctor = context.global_object().get(js_string!(name), context)?;
    ctor.as_constructor()
        .ok_or_else(|| CloneError::Engine(format!("{name} constructor missing")))?
        .construct(args, None, context)
        .map_err(CloneError::from)
}
