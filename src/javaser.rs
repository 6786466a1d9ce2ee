//! A narrow reader for the Java Object Serialization Stream Protocol,
//! scoped to exactly the class graph of `javax.crypto.SealedObjectForKeyProtector`
//! and `java.security.KeyRep` — not a general parser.
//!
//! Fields are located by name after walking the full class-descriptor
//! hierarchy (superclass fields are read before subclass fields, as the
//! real protocol requires, then flattened into one field list), so the
//! exact superclass shape the JDK emits does not need to be hardcoded
//! here: only the field names this crate actually consumes matter.

use std::io::{Cursor, Read};
use std::rc::Rc;

use crate::codec::framed::decode_mod_utf;
use crate::error::{KeystoreError, Result};

const STREAM_MAGIC: u16 = 0xACED;
const STREAM_VERSION: u16 = 0x0005;

const TC_NULL: u8 = 0x70;
const TC_REFERENCE: u8 = 0x71;
const TC_CLASSDESC: u8 = 0x72;
const TC_OBJECT: u8 = 0x73;
const TC_STRING: u8 = 0x74;
const TC_ARRAY: u8 = 0x75;
const TC_CLASS: u8 = 0x76;
const TC_BLOCKDATA: u8 = 0x77;
const TC_ENDBLOCKDATA: u8 = 0x78;
const TC_BLOCKDATALONG: u8 = 0x7A;
const TC_LONGSTRING: u8 = 0x7C;
const TC_ENUM: u8 = 0x7E;

const SC_WRITE_METHOD: u8 = 0x01;

const BASE_HANDLE: i32 = 0x7E_0000;

/// A deserialized value. Only the variants this crate's two target
/// classes actually use are interpreted; everything else is consumed
/// correctly (so the stream stays in sync) but collapsed to `Other`.
#[derive(Debug, Clone)]
pub enum JavaValue {
    Null,
    Bool(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    ByteArray(Vec<u8>),
    Other,
    Object(JavaObject),
}

/// A deserialized object: its declared class name and its fields,
/// flattened from the root superclass down to the most-derived class.
#[derive(Debug, Clone)]
pub struct JavaObject {
    pub class_name: String,
    pub fields: Vec<(String, JavaValue)>,
}

struct FieldDesc {
    type_code: u8,
    name: String,
}

struct ClassDesc {
    name: String,
    flags: u8,
    fields: Vec<FieldDesc>,
    super_class: Option<Rc<ClassDesc>>,
}

enum HandleEntry {
    Pending,
    Class(Rc<ClassDesc>),
    Value(JavaValue),
}

struct Parser<R: Read> {
    reader: R,
    handles: Vec<HandleEntry>,
}

fn format_error(cause: impl Into<String>) -> KeystoreError {
    KeystoreError::FormatError {
        field: "java serialization",
        cause: cause.into(),
    }
}

impl<R: Read> Parser<R> {
    fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.reader
            .read_exact(&mut buf)
            .map_err(|e| format_error(e.to_string()))?;
        Ok(buf)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes::<1>()?[0])
    }
    fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_bytes::<1>()?[0] as i8)
    }
    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_bytes::<2>()?))
    }
    fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.read_bytes::<2>()?))
    }
    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_bytes::<4>()?))
    }
    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.read_bytes::<8>()?))
    }
    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_be_bytes(self.read_bytes::<4>()?))
    }
    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.read_bytes::<8>()?))
    }

    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.reader
            .read_exact(&mut buf)
            .map_err(|e| format_error(e.to_string()))?;
        Ok(buf)
    }

    fn read_utf(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        decode_mod_utf(&self.read_vec(len)?)
    }

    fn reserve_handle(&mut self) -> usize {
        self.handles.push(HandleEntry::Pending);
        self.handles.len() - 1
    }

    fn resolve_handle(&self, handle: i32) -> Result<&HandleEntry> {
        let index = usize::try_from(handle - BASE_HANDLE)
            .map_err(|_| format_error("negative back-reference handle"))?;
        self.handles
            .get(index)
            .ok_or_else(|| format_error("dangling back-reference handle"))
    }

    fn resolve_value_handle(&self, handle: i32) -> Result<JavaValue> {
        match self.resolve_handle(handle)? {
            HandleEntry::Value(v) => Ok(v.clone()),
            _ => Err(format_error("handle does not refer to a value")),
        }
    }

    fn resolve_class_handle(&self, handle: i32) -> Result<Rc<ClassDesc>> {
        match self.resolve_handle(handle)? {
            HandleEntry::Class(cd) => Ok(cd.clone()),
            _ => Err(format_error("handle does not refer to a class descriptor")),
        }
    }

    fn read_class_desc_ref(&mut self) -> Result<Option<Rc<ClassDesc>>> {
        let tc = self.read_u8()?;
        match tc {
            TC_NULL => Ok(None),
            TC_REFERENCE => {
                let handle = self.read_i32()?;
                Ok(Some(self.resolve_class_handle(handle)?))
            }
            TC_CLASSDESC => {
                let idx = self.reserve_handle();
                let cd = Rc::new(self.read_class_desc_body()?);
                self.handles[idx] = HandleEntry::Class(cd.clone());
                Ok(Some(cd))
            }
            _ => Err(format_error(format!(
                "expected classDesc, got tag {tc:#04x}"
            ))),
        }
    }

    fn read_class_desc_body(&mut self) -> Result<ClassDesc> {
        let name = self.read_utf()?;
        let _serial_version_uid = self.read_i64()?;
        let flags = self.read_u8()?;
        let field_count = self.read_u16()?;

        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let type_code = self.read_u8()?;
            let field_name = self.read_utf()?;
            if type_code == b'L' || type_code == b'[' {
                // fieldTypeString: object content naming the field's
                // declared type. We don't need the type name itself.
                self.read_content()?;
            }
            fields.push(FieldDesc {
                type_code,
                name: field_name,
            });
        }

        self.skip_annotation()?;
        let super_class = self.read_class_desc_ref()?;

        Ok(ClassDesc {
            name,
            flags,
            fields,
            super_class,
        })
    }

    /// Consumes a `classAnnotation` or `objectAnnotation`: zero or more
    /// contents terminated by `TC_ENDBLOCKDATA`.
    fn skip_annotation(&mut self) -> Result<()> {
        loop {
            let tc = self.read_u8()?;
            match tc {
                TC_ENDBLOCKDATA => return Ok(()),
                TC_BLOCKDATA => {
                    let len = self.read_u8()? as usize;
                    self.read_vec(len)?;
                }
                TC_BLOCKDATALONG => {
                    let len = self.read_i32()? as usize;
                    self.read_vec(len)?;
                }
                other => {
                    self.read_content_with_tag(other)?;
                }
            }
        }
    }

    fn read_content(&mut self) -> Result<JavaValue> {
        let tc = self.read_u8()?;
        self.read_content_with_tag(tc)
    }

    fn read_content_with_tag(&mut self, tc: u8) -> Result<JavaValue> {
        match tc {
            TC_NULL => Ok(JavaValue::Null),
            TC_REFERENCE => {
                let handle = self.read_i32()?;
                self.resolve_value_handle(handle)
            }
            TC_STRING => Ok(JavaValue::Str(self.read_new_string(false)?)),
            TC_LONGSTRING => Ok(JavaValue::Str(self.read_new_string(true)?)),
            TC_ARRAY => self.read_new_array(),
            TC_OBJECT => self.read_new_object(),
            TC_ENUM => self.read_new_enum(),
            TC_CLASS => {
                let cd = self
                    .read_class_desc_ref()?
                    .ok_or_else(|| format_error("null class in TC_CLASS"))?;
                Ok(JavaValue::Str(cd.name.clone()))
            }
            other => Err(format_error(format!(
                "unsupported content tag {other:#04x}"
            ))),
        }
    }

    fn read_new_string(&mut self, long: bool) -> Result<String> {
        let idx = self.reserve_handle();
        let len = if long {
            self.read_i64()? as usize
        } else {
            self.read_u16()? as usize
        };
        let s = decode_mod_utf(&self.read_vec(len)?)?;
        self.handles[idx] = HandleEntry::Value(JavaValue::Str(s.clone()));
        Ok(s)
    }

    fn read_new_array(&mut self) -> Result<JavaValue> {
        let idx = self.reserve_handle();
        let class_desc = self
            .read_class_desc_ref()?
            .ok_or_else(|| format_error("array missing class descriptor"))?;
        let size = self.read_i32()? as usize;
        let component = class_desc.name.trim_start_matches('[').chars().next();

        let value = match component {
            Some('B') => JavaValue::ByteArray(self.read_vec(size)?),
            Some('C') => {
                for _ in 0..size {
                    self.read_u16()?;
                }
                JavaValue::Other
            }
            Some('Z') => {
                for _ in 0..size {
                    self.read_u8()?;
                }
                JavaValue::Other
            }
            Some('S') => {
                for _ in 0..size {
                    self.read_i16()?;
                }
                JavaValue::Other
            }
            Some('I') => {
                for _ in 0..size {
                    self.read_i32()?;
                }
                JavaValue::Other
            }
            Some('J') => {
                for _ in 0..size {
                    self.read_i64()?;
                }
                JavaValue::Other
            }
            Some('F') => {
                for _ in 0..size {
                    self.read_f32()?;
                }
                JavaValue::Other
            }
            Some('D') => {
                for _ in 0..size {
                    self.read_f64()?;
                }
                JavaValue::Other
            }
            _ => {
                for _ in 0..size {
                    self.read_content()?;
                }
                JavaValue::Other
            }
        };

        self.handles[idx] = HandleEntry::Value(value.clone());
        Ok(value)
    }

    fn read_new_enum(&mut self) -> Result<JavaValue> {
        let idx = self.reserve_handle();
        let class_desc = self
            .read_class_desc_ref()?
            .ok_or_else(|| format_error("enum missing class descriptor"))?;
        let constant = match self.read_content()? {
            JavaValue::Str(s) => s,
            _ => String::new(),
        };
        let value = JavaValue::Str(format!("{}::{}", class_desc.name, constant));
        self.handles[idx] = HandleEntry::Value(value.clone());
        Ok(value)
    }

    fn read_new_object(&mut self) -> Result<JavaValue> {
        let idx = self.reserve_handle();
        let class_desc = self
            .read_class_desc_ref()?
            .ok_or_else(|| format_error("object missing class descriptor"))?;
        let fields = self.read_class_data(&class_desc)?;
        let value = JavaValue::Object(JavaObject {
            class_name: class_desc.name.clone(),
            fields,
        });
        self.handles[idx] = HandleEntry::Value(value.clone());
        Ok(value)
    }

    fn read_class_data(&mut self, class_desc: &Rc<ClassDesc>) -> Result<Vec<(String, JavaValue)>> {
        let mut chain = vec![class_desc.clone()];
        let mut cur = class_desc.clone();
        while let Some(sup) = cur.super_class.clone() {
            chain.push(sup.clone());
            cur = sup;
        }
        chain.reverse();

        let mut fields = Vec::new();
        for level in &chain {
            for field_desc in &level.fields {
                let value = match field_desc.type_code {
                    b'B' => JavaValue::Byte(self.read_i8()?),
                    b'C' => JavaValue::Char(self.read_u16()?),
                    b'D' => JavaValue::Double(self.read_f64()?),
                    b'F' => JavaValue::Float(self.read_f32()?),
                    b'I' => JavaValue::Int(self.read_i32()?),
                    b'J' => JavaValue::Long(self.read_i64()?),
                    b'S' => JavaValue::Short(self.read_i16()?),
                    b'Z' => JavaValue::Bool(self.read_u8()? != 0),
                    b'L' | b'[' => self.read_content()?,
                    other => {
                        return Err(format_error(format!("unknown field type code '{other}'")));
                    }
                };
                fields.push((field_desc.name.clone(), value));
            }
            if level.flags & SC_WRITE_METHOD != 0 {
                self.skip_annotation()?;
            }
        }
        Ok(fields)
    }
}

const SC_SERIALIZABLE: u8 = 0x02;

fn write_utf(out: &mut Vec<u8>, s: &str) {
    let bytes = crate::codec::framed::encode_mod_utf(s);
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(&bytes);
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.push(TC_STRING);
    write_utf(out, s);
}

fn write_byte_array(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(TC_ARRAY);
    out.push(TC_CLASSDESC);
    write_utf(out, "[B");
    out.extend_from_slice(&0i64.to_be_bytes());
    out.push(SC_SERIALIZABLE);
    out.extend_from_slice(&0u16.to_be_bytes());
    out.push(TC_ENDBLOCKDATA);
    out.push(TC_NULL);
    out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn write_object_header(out: &mut Vec<u8>, class_name: &str, field_count: usize) {
    out.extend_from_slice(&STREAM_MAGIC.to_be_bytes());
    out.extend_from_slice(&STREAM_VERSION.to_be_bytes());
    out.push(TC_OBJECT);
    out.push(TC_CLASSDESC);
    write_utf(out, class_name);
    out.extend_from_slice(&0i64.to_be_bytes());
    out.push(SC_SERIALIZABLE);
    out.extend_from_slice(&(field_count as u16).to_be_bytes());
}

/// Encodes a `java.security.KeyRep` as a Java-serialized object stream,
/// consisting of exactly the fields this crate round-trips.
#[must_use]
pub(crate) fn encode_key_rep(algorithm: &str, format: &str, encoded: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    write_object_header(&mut out, "java.security.KeyRep", 3);
    out.push(b'L');
    write_utf(&mut out, "algorithm");
    write_string(&mut out, "Ljava/lang/String;");
    out.push(b'L');
    write_utf(&mut out, "format");
    write_string(&mut out, "Ljava/lang/String;");
    out.push(b'[');
    write_utf(&mut out, "encoded");
    write_string(&mut out, "[B");
    out.push(TC_ENDBLOCKDATA);
    out.push(TC_NULL);

    write_string(&mut out, algorithm);
    write_string(&mut out, format);
    write_byte_array(&mut out, encoded);
    out
}

/// Encodes a `javax.crypto.SealedObjectForKeyProtector` as a
/// Java-serialized object stream.
#[must_use]
pub(crate) fn encode_sealed_object(
    encrypted_content: &[u8],
    encoded_params: &[u8],
    params_alg: &str,
    seal_alg: &str,
) -> Vec<u8> {
    let mut out = Vec::new();
    write_object_header(&mut out, "javax.crypto.SealedObjectForKeyProtector", 4);
    out.push(b'[');
    write_utf(&mut out, "encodedParams");
    write_string(&mut out, "[B");
    out.push(b'[');
    write_utf(&mut out, "encryptedContent");
    write_string(&mut out, "[B");
    out.push(b'L');
    write_utf(&mut out, "paramsAlg");
    write_string(&mut out, "Ljava/lang/String;");
    out.push(b'L');
    write_utf(&mut out, "sealAlg");
    write_string(&mut out, "Ljava/lang/String;");
    out.push(TC_ENDBLOCKDATA);
    out.push(TC_NULL);

    write_byte_array(&mut out, encoded_params);
    write_byte_array(&mut out, encrypted_content);
    write_string(&mut out, params_alg);
    write_string(&mut out, seal_alg);
    out
}

/// Parses a single top-level serialized object, consuming exactly the
/// bytes the stream header and object grammar call for — no external
/// framing or length prefix is required.
///
/// # Errors
///
/// Errors with `FormatError` if the stream header is wrong or the
/// content does not encode a single object.
pub fn read_object_from<R: Read>(reader: R) -> Result<JavaObject> {
    let mut parser = Parser {
        reader,
        handles: Vec::new(),
    };

    let magic = parser.read_u16()?;
    let version = parser.read_u16()?;
    if magic != STREAM_MAGIC || version != STREAM_VERSION {
        return Err(format_error("bad stream header"));
    }

    match parser.read_content()? {
        JavaValue::Object(obj) => Ok(obj),
        _ => Err(format_error("expected a single serialized object")),
    }
}

/// Parses a single top-level serialized object from `bytes`.
///
/// # Errors
///
/// Errors with `FormatError` if the stream header is wrong or the
/// content does not encode a single object.
pub fn read_object(bytes: &[u8]) -> Result<JavaObject> {
    read_object_from(Cursor::new(bytes))
}

/// A [`Read`] wrapper that records every byte it yields, so the exact
/// span a self-delimiting format consumed from a larger stream (with no
/// external length prefix) can be recovered afterwards.
struct TeeReader<'a, R: Read> {
    inner: R,
    recorded: &'a mut Vec<u8>,
}

impl<R: Read> Read for TeeReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.recorded.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// Reads exactly one Java-serialized object from `reader` (consuming
/// only the bytes the stream grammar requires) and returns the raw
/// bytes it spanned, so the object can be re-decoded later by field
/// name without keeping a live borrow on `reader`.
///
/// # Errors
///
/// Errors with `FormatError` if the stream header is wrong or the
/// content does not encode a single object.
pub(crate) fn read_raw_object<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut recorded = Vec::new();
    {
        let tee = TeeReader {
            inner: &mut *reader,
            recorded: &mut recorded,
        };
        read_object_from(tee)?;
    }
    Ok(recorded)
}

fn field_bytes(obj: &JavaObject, field: &'static str) -> Result<Vec<u8>> {
    obj.fields
        .iter()
        .find_map(|(name, value)| {
            if name == field {
                if let JavaValue::ByteArray(bytes) = value {
                    Some(bytes.clone())
                } else {
                    None
                }
            } else {
                None
            }
        })
        .ok_or(KeystoreError::MalformedSealedObject { field })
}

fn field_string(obj: &JavaObject, field: &'static str) -> Result<String> {
    obj.fields
        .iter()
        .find_map(|(name, value)| {
            if name == field {
                if let JavaValue::Str(s) = value {
                    Some(s.clone())
                } else {
                    None
                }
            } else {
                None
            }
        })
        .ok_or(KeystoreError::MalformedSealedObject { field })
}

/// JCEKS's `javax.crypto.SealedObjectForKeyProtector`, after
/// deserialization — still PBE-encrypted.
#[derive(Debug, Clone)]
pub struct SealedObjectForKeyProtector {
    pub encrypted_content: Vec<u8>,
    pub encoded_params: Vec<u8>,
    pub params_alg: String,
    pub seal_alg: String,
}

impl SealedObjectForKeyProtector {
    /// Decodes from a raw Java-serialized byte stream.
    ///
    /// # Errors
    ///
    /// Errors with `FormatError` on a malformed stream, or
    /// `MalformedSealedObject` if a required field is missing.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let obj = read_object(bytes)?;
        Ok(Self {
            encrypted_content: field_bytes(&obj, "encryptedContent")?,
            encoded_params: field_bytes(&obj, "encodedParams")?,
            params_alg: field_string(&obj, "paramsAlg")?,
            seal_alg: field_string(&obj, "sealAlg")?,
        })
    }
}

/// `java.security.KeyRep`, after deserialization (the plaintext produced
/// by decrypting a [`SealedObjectForKeyProtector`]).
#[derive(Debug, Clone)]
pub struct KeyRep {
    pub algorithm: String,
    pub format: String,
    pub encoded: Vec<u8>,
}

impl KeyRep {
    /// Decodes from a raw Java-serialized byte stream.
    ///
    /// # Errors
    ///
    /// Errors with `FormatError` on a malformed stream, or
    /// `MalformedSealedObject` if a required field is missing.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let obj = read_object(bytes)?;
        Ok(Self {
            algorithm: field_string(&obj, "algorithm")?,
            format: field_string(&obj, "format")?,
            encoded: field_bytes(&obj, "encoded")?,
        })
    }
}
