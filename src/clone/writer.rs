//! Serialization half of the structured clone codec.
//!
//! Walks a JavaScript value graph inside its owning engine and appends a
//! self-describing byte sequence to a [`WriteBuffer`]. Cycle-capable
//! containers (plain objects, arrays, Map, Set) are registered in an
//! identity-keyed reference table before their children are visited; a
//! second sighting of the same object emits an `ObjectRef` back-edge
//! instead of re-walking it.

use boa_engine::{js_string, Context, JsObject, JsValue};

use crate::clone::{CloneError, CloneTag, WriteBuffer, MAX_DEPTH, MAX_SIZE};

/// Serialize `value` into a fresh byte buffer.
///
/// On failure nothing is returned, so a partially written payload is never
/// observable by the caller.
pub fn encode_value(value: &JsValue, context: &mut Context) -> Result<Vec<u8>, CloneError> {
    let mut encoder = ValueEncoder::new();
    encoder.write_value(value, context)?;
    Ok(encoder.buffer.take())
}

struct ValueEncoder {
    buffer: WriteBuffer,
    depth: usize,
    // Identity-keyed reference table. Keys on engine object identity
    // (handle pointer equality), scanned linearly: clone graphs are small
    // and a hashable identity is not part of the engine's public surface.
    refs: Vec<(JsObject, u32)>,
}

impl ValueEncoder {
    fn new() -> Self {
        Self {
            buffer: WriteBuffer::new(),
            depth: 0,
            refs: Vec::new(),
        }
    }

    fn write_value(&mut self, value: &JsValue, context: &mut Context) -> Result<(), CloneError> {
        if self.depth >= MAX_DEPTH {
            return Err(CloneError::DepthExceeded);
        }
        if self.buffer.len() >= MAX_SIZE {
            return Err(CloneError::SizeExceeded);
        }

        if value.is_undefined() {
            self.buffer.write_u8(CloneTag::Undefined as u8);
            return Ok(());
        }
        if value.is_null() {
            self.buffer.write_u8(CloneTag::Null as u8);
            return Ok(());
        }
        if let Some(boolean) = value.as_boolean() {
            self.buffer.write_u8(if boolean {
                CloneTag::BoolTrue as u8
            } else {
                CloneTag::BoolFalse as u8
            });
            return Ok(());
        }
        if let Some(number) = value.as_number() {
            self.write_number(number);
            return Ok(());
        }
        if let Some(string) = value.as_string() {
            self.buffer.write_u8(CloneTag::String as u8);
            self.buffer.write_string(&string.to_std_string_escaped());
            return Ok(());
        }
        if value.is_symbol() {
            return Err(CloneError::NotCloneable("Symbol"));
        }
        if value.is_bigint() {
            // Tag 0x06 is reserved for a future format revision.
            return Err(CloneError::NotCloneable("BigInt"));
        }

        let Some(object) = value.as_object() else {
            return Err(CloneError::NotCloneable("value"));
        };
        // Callables never reach brand dispatch.
        if value.as_callable().is_some() {
            return Err(CloneError::NotCloneable("Function"));
        }
        let object = object.clone();
        self.write_object(&object, context)
    }

    fn write_object(&mut self, object: &JsObject, context: &mut Context) -> Result<(), CloneError> {
        let brand = class_brand(object, context)?;
        match brand.as_str() {
            "Date" => self.write_date(object, context),
            "RegExp" => self.write_regexp(object, context),
            "ArrayBuffer" => self.write_array_buffer(object, context),
            "DataView" => self.write_view(object, CloneTag::DataView, context),
            "Int8Array" => self.write_view(object, CloneTag::Int8Array, context),
            "Uint8Array" => self.write_view(object, CloneTag::Uint8Array, context),
            "Uint8ClampedArray" => self.write_view(object, CloneTag::Uint8ClampedArray, context),
            "Int16Array" => self.write_view(object, CloneTag::Int16Array, context),
            "Uint16Array" => self.write_view(object, CloneTag::Uint16Array, context),
            "Int32Array" => self.write_view(object, CloneTag::Int32Array, context),
            "Uint32Array" => self.write_view(object, CloneTag::Uint32Array, context),
            "Float32Array" => self.write_view(object, CloneTag::Float32Array, context),
            "Float64Array" => self.write_view(object, CloneTag::Float64Array, context),
            "BigInt64Array" => self.write_view(object, CloneTag::BigInt64Array, context),
            "BigUint64Array" => self.write_view(object, CloneTag::BigUint64Array, context),
            "Error" | "EvalError" | "RangeError" | "ReferenceError" | "SyntaxError"
            | "TypeError" | "URIError" => self.write_error(object, &brand, context),
            "WeakMap" => Err(CloneError::NotCloneable("WeakMap")),
            "WeakSet" => Err(CloneError::NotCloneable("WeakSet")),
            "WeakRef" => Err(CloneError::NotCloneable("WeakRef")),
            "Promise" => Err(CloneError::NotCloneable("Promise")),
            "Array" => {
                if self.try_write_reference(object) {
                    return Ok(());
                }
                self.register(object);
                self.write_array(object, context)
            }
            "Map" => {
                if self.try_write_reference(object) {
                    return Ok(());
                }
                self.register(object);
                self.write_map(object, context)
            }
            "Set" => {
                if self.try_write_reference(object) {
                    return Ok(());
                }
                self.register(object);
                self.write_set(object, context)
            }
            // "Object" plus anything with a custom brand: serialize the
            // own-enumerable properties, which is what survives a clone.
            _ => {
                if self.try_write_reference(object) {
                    return Ok(());
                }
                self.register(object);
                self.write_plain_object(object, context)
            }
        }
    }

    fn write_number(&mut self, number: f64) {
        let as_i32 = number as i32;
        // -0.0 must not take the Int32 path or the sign is lost.
        if number.is_finite()
            && f64::from(as_i32) == number
            && !(number == 0.0 && number.is_sign_negative())
        {
            self.buffer.write_u8(CloneTag::Int32 as u8);
            self.buffer.write_i32(as_i32);
        } else {
            self.buffer.write_u8(CloneTag::Double as u8);
            self.buffer.write_f64(number);
        }
    }

    fn write_plain_object(
        &mut self,
        object: &JsObject,
        context: &mut Context,
    ) -> Result<(), CloneError> {
        self.buffer.write_u8(CloneTag::Object as u8);

        let keys = own_enumerable_keys(object, context)?;
        self.buffer.write_u32(keys.len() as u32);

        self.depth += 1;
        for key in keys {
            self.buffer.write_string(&key);
            let value = object.get(js_string!(key), context)?;
            self.write_value(&value, context)?;
        }
        self.depth -= 1;
        Ok(())
    }

    fn write_array(&mut self, object: &JsObject, context: &mut Context) -> Result<(), CloneError> {
        self.buffer.write_u8(CloneTag::Array as u8);

        let length = object
            .get(js_string!("length"), context)?
            .to_u32(context)
            .map_err(CloneError::from)?;
        self.buffer.write_u32(length);

        self.depth += 1;
        for index in 0..length {
            // Holes read as undefined and are materialized as such.
            let element = object.get(index, context)?;
            self.write_value(&element, context)?;
        }
        self.depth -= 1;
        Ok(())
    }

    fn write_date(&mut self, object: &JsObject, context: &mut Context) -> Result<(), CloneError> {
        self.buffer.write_u8(CloneTag::Date as u8);
        let time = call_method(object, "getTime", &[], context)?;
        self.buffer.write_f64(time.as_number().unwrap_or(f64::NAN));
        Ok(())
    }

    fn write_regexp(&mut self, object: &JsObject, context: &mut Context) -> Result<(), CloneError> {
        self.buffer.write_u8(CloneTag::RegExp as u8);
        let source = string_property(object, "source", context)?;
        let flags = string_property(object, "flags", context)?;
        self.buffer.write_string(&source);
        self.buffer.write_string(&flags);
        Ok(())
    }

    fn write_map(&mut self, object: &JsObject, context: &mut Context) -> Result<(), CloneError> {
        self.buffer.write_u8(CloneTag::Map as u8);

        let size = object
            .get(js_string!("size"), context)?
            .to_u32(context)
            .map_err(CloneError::from)?;
        self.buffer.write_u32(size);

        let iterator = call_method(object, "entries", &[], context)?;
        let iterator = iterator
            .as_object()
            .ok_or_else(|| CloneError::Engine("Map entries() returned a non-object".into()))?
            .clone();

        self.depth += 1;
        for _ in 0..size {
            let step = call_method(&iterator, "next", &[], context)?;
            let step = step
                .as_object()
                .ok_or_else(|| CloneError::Engine("Map iterator result is not an object".into()))?
                .clone();
            if step.get(js_string!("done"), context)?.to_boolean() {
                break;
            }
            let entry = step.get(js_string!("value"), context)?;
            let entry = entry
                .as_object()
                .ok_or_else(|| CloneError::Engine("Map entry is not an object".into()))?
                .clone();
            let key = entry.get(0u32, context)?;
            let value = entry.get(1u32, context)?;
            self.write_value(&key, context)?;
            self.write_value(&value, context)?;
        }
        self.depth -= 1;
        Ok(())
    }

    fn write_set(&mut self, object: &JsObject, context: &mut Context) -> Result<(), CloneError> {
        self.buffer.write_u8(CloneTag::Set as u8);

        let size = object
            .get(js_string!("size"), context)?
            .to_u32(context)
            .map_err(CloneError::from)?;
        self.buffer.write_u32(size);

        let iterator = call_method(object, "values", &[], context)?;
        let iterator = iterator
            .as_object()
            .ok_or_else(|| CloneError::Engine("Set values() returned a non-object".into()))?
            .clone();

        self.depth += 1;
        for _ in 0..size {
            let step = call_method(&iterator, "next", &[], context)?;
            let step = step
                .as_object()
                .ok_or_else(|| CloneError::Engine("Set iterator result is not an object".into()))?
                .clone();
            if step.get(js_string!("done"), context)?.to_boolean() {
                break;
            }
            let value = step.get(js_string!("value"), context)?;
            self.write_value(&value, context)?;
        }
        self.depth -= 1;
        Ok(())
    }

    fn write_error(
        &mut self,
        object: &JsObject,
        brand: &str,
        context: &mut Context,
    ) -> Result<(), CloneError> {
        let mut name = string_property(object, "name", context)?;
        if name.is_empty() {
            name = "Error".to_string();
        }
        let message = string_property(object, "message", context)?;

        // Modern engines brand every error kind "[object Error]"; the
        // `name` property carries the subclass in that case.
        let kind = if brand == "Error" { name.as_str() } else { brand };
        let tag = match kind {
            "EvalError" => CloneTag::EvalError,
            "RangeError" => CloneTag::RangeError,
            "ReferenceError" => CloneTag::ReferenceError,
            "SyntaxError" => CloneTag::SyntaxError,
            "TypeError" => CloneTag::TypeError,
            "URIError" => CloneTag::UriError,
            _ => CloneTag::Error,
        };

        self.buffer.write_u8(tag as u8);
        self.buffer.write_string(&name);
        self.buffer.write_string(&message);
        Ok(())
    }

    fn write_array_buffer(
        &mut self,
        object: &JsObject,
        context: &mut Context,
    ) -> Result<(), CloneError> {
        self.buffer.write_u8(CloneTag::ArrayBuffer as u8);
        let byte_length = object
            .get(js_string!("byteLength"), context)?
            .to_u32(context)
            .map_err(CloneError::from)?;
        self.buffer.write_u32(byte_length);
        let bytes = raw_buffer_bytes(&JsValue::from(object.clone()), byte_length, context)?;
        self.buffer.write_bytes(&bytes);
        Ok(())
    }

    /// Typed arrays and DataViews: the whole underlying buffer is written,
    /// then the view's offset and (element or byte) length. Aliasing
    /// between views over one buffer is not preserved.
    fn write_view(
        &mut self,
        object: &JsObject,
        tag: CloneTag,
        context: &mut Context,
    ) -> Result<(), CloneError> {
        self.buffer.write_u8(tag as u8);

        let buffer = object.get(js_string!("buffer"), context)?;
        let byte_offset = object
            .get(js_string!("byteOffset"), context)?
            .to_u32(context)
            .map_err(CloneError::from)?;
        let length_prop = if tag == CloneTag::DataView {
            "byteLength"
        } else {
            "length"
        };
        let length = object
            .get(js_string!(length_prop), context)?
            .to_u32(context)
            .map_err(CloneError::from)?;

        let buffer_obj = buffer
            .as_object()
            .ok_or_else(|| CloneError::Engine("view has no backing buffer".into()))?
            .clone();
        let buffer_byte_length = buffer_obj
            .get(js_string!("byteLength"), context)?
            .to_u32(context)
            .map_err(CloneError::from)?;

        self.buffer.write_u32(buffer_byte_length);
        let bytes = raw_buffer_bytes(&buffer, buffer_byte_length, context)?;
        self.buffer.write_bytes(&bytes);
        self.buffer.write_u32(byte_offset);
        self.buffer.write_u32(length);
        Ok(())
    }

    fn try_write_reference(&mut self, object: &JsObject) -> bool {
        if let Some(id) = self
            .refs
            .iter()
            .find(|(seen, _)| seen == object)
            .map(|(_, id)| *id)
        {
            self.buffer.write_u8(CloneTag::ObjectRef as u8);
            self.buffer.write_u32(id);
            return true;
        }
        false
    }

    fn register(&mut self, object: &JsObject) {
        let id = self.refs.len() as u32;
        self.refs.push((object.clone(), id));
    }
}

/// `Object.prototype.toString.call(obj)` without the `"[object "` wrapper.
fn class_brand(object: &JsObject, context: &mut Context) -> Result<String, CloneError> {
    let object_ctor = context.global_object().get(js_string!("Object"), context)?;
    let prototype = object_ctor
        .as_object()
        .ok_or_else(|| CloneError::Engine("Object constructor missing".into()))?
        .get(js_string!("prototype"), context)?;
    let to_string = prototype
        .as_object()
        .ok_or_else(|| CloneError::Engine("Object.prototype missing".into()))?
        .get(js_string!("toString"), context)?;
    let brand = to_string
        .as_callable()
        .ok_or_else(|| CloneError::Engine("Object.prototype.toString missing".into()))?
        .call(&JsValue::from(object.clone()), &[], context)?;
    let brand = brand
        .to_string(context)
        .map_err(CloneError::from)?
        .to_std_string_escaped();
    Ok(brand
        .strip_prefix("[object ")
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(&brand)
        .to_string())
}

/// Own enumerable string keys in the engine's enumeration order.
fn own_enumerable_keys(
    object: &JsObject,
    context: &mut Context,
) -> Result<Vec<String>, CloneError> {
    let object_ctor = context.global_object().get(js_string!("Object"), context)?;
    let keys_fn = object_ctor
        .as_object()
        .ok_or_else(|| CloneError::Engine("Object constructor missing".into()))?
        .get(js_string!("keys"), context)?;
    let keys = keys_fn
        .as_callable()
        .ok_or_else(|| CloneError::Engine("Object.keys missing".into()))?
        .call(
            &JsValue::undefined(),
            &[JsValue::from(object.clone())],
            context,
        )?;
    let keys = keys
        .as_object()
        .ok_or_else(|| CloneError::Engine("Object.keys returned a non-object".into()))?
        .clone();
    let length = keys
        .get(js_string!("length"), context)?
        .to_u32(context)
        .map_err(CloneError::from)?;

    let mut out = Vec::with_capacity(length as usize);
    for index in 0..length {
        let key = keys.get(index, context)?;
        out.push(
            key.to_string(context)
                .map_err(CloneError::from)?
                .to_std_string_escaped(),
        );
    }
    Ok(out)
}

fn call_method(
    object: &JsObject,
    name: &str,
    args: &[JsValue],
    context: &mut Context,
) -> Result<JsValue, CloneError> {
    let method = object.get(js_string!(name), context)?;
    method
        .as_callable()
        .ok_or_else(|| CloneError::Engine(format!("{name} is not callable")))?
        .call(&JsValue::from(object.clone()), args, context)
        .map_err(CloneError::from)
}

fn string_property(
    object: &JsObject,
    name: &str,
    context: &mut Context,
) -> Result<String, CloneError> {
    let value = object.get(js_string!(name), context)?;
    Ok(value
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_default())
}

/// Copy the raw bytes of an ArrayBuffer by reading through a fresh
/// `Uint8Array` view over it.
fn raw_buffer_bytes(
    buffer: &JsValue,
    byte_length: u32,
    context: &mut Context,
) -> Result<Vec<u8>, CloneError> {
    if byte_length == 0 {
        return Ok(Vec::new());
    }
    let ctor = context
        .global_object()
        .get(js_string!("Uint8Array"), context)?;
    let view = ctor
        .as_constructor()
        .ok_or_else(|| CloneError::Engine("Uint8Array constructor missing".into()))?
        .construct(&[buffer.clone()], None, context)?;

    let mut bytes = Vec::with_capacity(byte_length as usize);
    for index in 0..byte_length {
        let byte = view.get(index, context)?;
        bytes.push(byte.to_u32(context).map_err(CloneError::from)? as u8);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::Source;

    fn eval(context: &mut Context, code: &str) -> JsValue {
        context
            .eval(Source::from_bytes(code.as_bytes()))
            .expect("eval failed")
    }

    #[test]
    fn primitive_wire_bytes_are_exact() {
        let mut context = Context::default();

        let cases: Vec<(&str, Vec<u8>)> = vec![
            ("undefined", vec![0x00]),
            ("null", vec![0x01]),
            ("true", vec![0x02]),
            ("false", vec![0x03]),
            ("1", vec![0x04, 1, 0, 0, 0]),
            ("-1", vec![0x04, 0xFF, 0xFF, 0xFF, 0xFF]),
            (
                "1.5",
                vec![0x05, 0, 0, 0, 0, 0, 0, 0xF8, 0x3F],
            ),
            ("'hi'", vec![0x07, 2, 0, 0, 0, b'h', b'i']),
        ];

        for (code, expected) in cases {
            let value = eval(&mut context, code);
            let bytes = encode_value(&value, &mut context).expect(code);
            assert_eq!(bytes, expected, "wire bytes for {code}");
        }
    }

    #[test]
    fn negative_zero_takes_the_double_path() {
        let mut context = Context::default();
        let value = eval(&mut context, "-0");
        let bytes = encode_value(&value, &mut context).unwrap();
        assert_eq!(bytes[0], CloneTag::Double as u8);
        // Sign bit of the IEEE-754 payload survives.
        assert_eq!(bytes[8], 0x80);
    }

    #[test]
    fn plain_object_layout() {
        let mut context = Context::default();
        let value = eval(&mut context, "({ a: 1 })");
        let bytes = encode_value(&value, &mut context).unwrap();
        assert_eq!(
            bytes,
            vec![
                0x10, // Object
                1, 0, 0, 0, // one entry
                1, 0, 0, 0, b'a', // key "a"
                0x04, 1, 0, 0, 0, // Int32 1
            ]
        );
    }

    #[test]
    fn array_layout_and_holes() {
        let mut context = Context::default();
        let value = eval(&mut context, "[true, , 'x']");
        let bytes = encode_value(&value, &mut context).unwrap();
        assert_eq!(
            bytes,
            vec![
                0x11, // Array
                3, 0, 0, 0, // length 3
                0x02, // true
                0x00, // hole -> Undefined
                0x07, 1, 0, 0, 0, b'x',
            ]
        );
    }

    #[test]
    fn self_reference_emits_object_ref() {
        let mut context = Context::default();
        let value = eval(&mut context, "(function() { var o = {}; o.me = o; return o; })()");
        let bytes = encode_value(&value, &mut context).unwrap();
        assert_eq!(
            bytes,
            vec![
                0x10, // Object, registered as ref 0
                1, 0, 0, 0, // one entry
                2, 0, 0, 0, b'm', b'e',
                0xF0, 0, 0, 0, 0, // ObjectRef(0)
            ]
        );
    }

    #[test]
    fn shared_child_is_written_once() {
        let mut context = Context::default();
        let value = eval(
            &mut context,
            "(function() { var shared = { v: 1 }; return [shared, shared]; })()",
        );
        let bytes = encode_value(&value, &mut context).unwrap();
        // The array registers as ref 0, the shared object as ref 1; the
        // second element is a back-reference instead of a second copy.
        assert_eq!(
            bytes,
            vec![
                0x11, 2, 0, 0, 0, // Array of 2
                0x10, 1, 0, 0, 0, // Object with one entry
                1, 0, 0, 0, b'v', // key "v"
                0x04, 1, 0, 0, 0, // Int32 1
                0xF0, 1, 0, 0, 0, // ObjectRef(1)
            ]
        );
    }

    #[test]
    fn non_cloneable_kinds_are_rejected() {
        let mut context = Context::default();
        for (code, what) in [
            ("(function() {})", "Function"),
            ("Symbol('tag')", "Symbol"),
            ("10n", "BigInt"),
            ("new WeakMap()", "WeakMap"),
            ("new WeakSet()", "WeakSet"),
            ("Promise.resolve(1)", "Promise"),
        ] {
            let value = eval(&mut context, code);
            let err = encode_value(&value, &mut context).unwrap_err();
            match err {
                CloneError::NotCloneable(kind) => assert_eq!(kind, what, "for {code}"),
                other => panic!("expected NotCloneable for {code}, got {other:?}"),
            }
        }
    }

    #[test]
    fn function_nested_in_object_is_rejected() {
        let mut context = Context::default();
        let value = eval(&mut context, "({ cb: function() {} })");
        assert!(matches!(
            encode_value(&value, &mut context),
            Err(CloneError::NotCloneable("Function"))
        ));
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut context = Context::default();
        let value = eval(
            &mut context,
            "(function() {
                var root = [];
                var cursor = root;
                for (var i = 0; i < 1200; i++) {
                    var next = [];
                    cursor.push(next);
                    cursor = next;
                }
                return root;
            })()",
        );
        assert!(matches!(
            encode_value(&value, &mut context),
            Err(CloneError::DepthExceeded)
        ));
    }

    #[test]
    fn date_payload_is_the_millisecond_value() {
        let mut context = Context::default();
        let value = eval(&mut context, "new Date(0)");
        let bytes = encode_value(&value, &mut context).unwrap();
        assert_eq!(bytes[0], CloneTag::Date as u8);
        assert_eq!(&bytes[1..], 0f64.to_le_bytes());
    }

    #[test]
    fn error_subclass_gets_its_own_tag() {
        let mut context = Context::default();
        let value = eval(&mut context, "new TypeError('boom')");
        let bytes = encode_value(&value, &mut context).unwrap();
        assert_eq!(bytes[0], CloneTag::TypeError as u8);

        let value = eval(&mut context, "new Error('plain')");
        let bytes = encode_value(&value, &mut context).unwrap();
        assert_eq!(bytes[0], CloneTag::Error as u8);
    }

    #[test]
    fn typed_array_carries_its_whole_buffer() {
        let mut context = Context::default();
        let value = eval(&mut context, "new Uint8Array([0, 127, 255])");
        let bytes = encode_value(&value, &mut context).unwrap();
        assert_eq!(
            bytes,
            vec![
                0x23, // Uint8Array
                3, 0, 0, 0, // buffer byte length
                0, 127, 255, // raw bytes
                0, 0, 0, 0, // byte offset
                3, 0, 0, 0, // element length
            ]
        );
    }
}
