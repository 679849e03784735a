//! Wire encoding of descriptors and value trees.
//!
//! Everything crossing a connection is written through a [`Writer`] and read
//! back through a [`Reader`]. The writer owns a bounded staging buffer and a
//! [`FlushSink`]: when a write would overflow the buffer it flushes to the
//! sink and carries on, so serializing a large array never grows memory
//! without bound. The reader walks a received byte slice and reports
//! [`WireError::UnexpectedEnd`] when asked for more than arrived; the
//! transport resumes the call once more data is buffered.
//!
//! ## Layout
//!
//! Sizes are one byte for values below 254, or `0xFE` followed by a
//! big-endian `u32`; `0xFF` encodes a null/absent size. Strings are a size
//! plus UTF-8 bytes. A field description starts with a tag byte whose high
//! nibble is the kind (scalar, scalar array, structure, union, variant
//! union, structure array, union array, bounded string) and whose low nibble
//! is the [`ScalarType`] where one applies; structures and unions follow
//! with their id, member count and named member descriptions. Multi-byte
//! primitive *values* are big-endian and aligned to their own size from the
//! start of the serialized unit, with zero padding; descriptions and sizes
//! are packed. The tag values `0xFF`/`0xFE`/`0xFD`/`0xFC` are reserved as
//! cache escapes, described below.
//!
//! ## Schema caching
//!
//! A [`FieldRegistry`] keeps the per-connection cache that lets a schema be
//! described once and referenced by a small id afterwards: the first send
//! writes `0xFD`, the assigned id, and the full description; repeats write
//! `0xFE` and the id alone. Both peers must mutate their registries in
//! lockstep, so a registry is reset exactly when its connection resets, and
//! an id that was never registered is a protocol error that tears the
//! connection down. The registry is bounded (`PVARS_FIELD_CACHE_LIMIT` in
//! the environment, default 1024); once full, further schemas travel in
//! full form with the `0xFC` escape and are not cached on either side.

use std::{collections::HashMap, io, sync::Arc};

use nom::{
    IResult, Parser,
    bytes::complete::take,
    multi::count,
    number::complete::{
        be_f32, be_f64, be_i8, be_i16, be_i32, be_i64, be_u8, be_u16, be_u32, be_u64,
    },
};
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for the big-endian nom number parsers; pins the otherwise
/// ambiguous `ParseError` parameter to the borrowed-slice variant.
type NomError<'a> = nom::error::Error<&'a [u8]>;

use crate::bitset::BitSet;
use crate::types::{Field, FieldRef, ScalarType, Structure, Type, Union};
use crate::utils;
use crate::value::{ArrayValue, PVField, PVValue, ScalarValue, UnionValue, element_field};

// Field description tag bytes: kind in the high nibble
const TAG_SCALAR: u8 = 0x00;
const TAG_SCALAR_ARRAY: u8 = 0x10;
const TAG_STRUCTURE: u8 = 0x20;
const TAG_UNION: u8 = 0x30;
const TAG_VARIANT_UNION: u8 = 0x40;
const TAG_STRUCTURE_ARRAY: u8 = 0x50;
const TAG_UNION_ARRAY: u8 = 0x60;
const TAG_BOUNDED_STRING: u8 = 0x70;

// Cache escapes, disjoint from every description tag
const CACHE_NULL: u8 = 0xFF;
const CACHE_ONLY_ID: u8 = 0xFE;
const CACHE_FULL_WITH_ID: u8 = 0xFD;
const CACHE_FULL_UNCACHED: u8 = 0xFC;

/// Largest size encodable in a single byte
const SIZE_INLINE_MAX: usize = 253;
const SIZE_EXTENDED: u8 = 0xFE;
const SIZE_NULL: u8 = 0xFF;

const DEFAULT_BUFFER_SIZE: usize = 8192;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("not enough data in buffer")]
    UnexpectedEnd,
    #[error("invalid type tag: {0:#04x}")]
    InvalidTag(u8),
    #[error("a required size was null")]
    NullSize,
    #[error("schema id was never registered: {0}")]
    UnknownFieldId(u16),
    #[error("array slice out of range")]
    SliceOutOfRange,
    #[error("an error occured parsing a description")]
    ParsingError(#[from] nom::Err<nom::error::Error<Vec<u8>>>),
    #[error("IO error flushing the serialization buffer")]
    Io(#[from] io::Error),
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for WireError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        WireError::ParsingError(err.to_owned())
    }
}

/// Destination for buffer flushes; the backpressure seam of serialization
///
/// A transport implementation typically writes to a socket here, blocking
/// until the data is accepted.
pub trait FlushSink {
    fn flush(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Collect everything in memory; useful for tests and message assembly
impl FlushSink for Vec<u8> {
    fn flush(&mut self, data: &[u8]) -> io::Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// Bounded staging buffer in front of a [`FlushSink`]
pub struct Writer<S: FlushSink> {
    buf: Vec<u8>,
    limit: usize,
    flushed: usize,
    sink: S,
}

impl<S: FlushSink> Writer<S> {
    pub fn new(sink: S) -> Self {
        Self::with_buffer_size(sink, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(sink: S, limit: usize) -> Self {
        // Room for at least one aligned 8 byte primitive per put
        let limit = limit.max(16);
        Writer {
            buf: Vec::with_capacity(limit),
            limit,
            flushed: 0,
            sink,
        }
    }

    /// Bytes emitted so far, flushed or still buffered
    pub fn position(&self) -> usize {
        self.flushed + self.buf.len()
    }

    fn flush_buffer(&mut self) -> Result<(), WireError> {
        if !self.buf.is_empty() {
            self.sink.flush(&self.buf)?;
            self.flushed += self.buf.len();
            self.buf.clear();
        }
        Ok(())
    }

    /// Flush everything staged to the sink
    pub fn flush(&mut self) -> Result<(), WireError> {
        self.flush_buffer()
    }

    pub fn into_sink(mut self) -> Result<S, WireError> {
        self.flush_buffer()?;
        Ok(self.sink)
    }

    /// Append bytes, flushing to the sink when the buffer would overflow
    pub fn put(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        if self.buf.len() + bytes.len() > self.limit {
            self.flush_buffer()?;
        }
        if bytes.len() > self.limit {
            // Oversized writes bypass the staging buffer entirely
            self.sink.flush(bytes)?;
            self.flushed += bytes.len();
        } else {
            self.buf.extend_from_slice(bytes);
        }
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), WireError> {
        self.put(&[value])
    }

    /// Zero-pad until the next write lands on an `alignment` byte boundary
    pub fn align_buffer(&mut self, alignment: usize) -> Result<(), WireError> {
        while self.position() % alignment != 0 {
            self.put(&[0])?;
        }
        Ok(())
    }

    pub fn put_size(&mut self, size: usize) -> Result<(), WireError> {
        if size <= SIZE_INLINE_MAX {
            self.put_u8(size as u8)
        } else {
            self.put_u8(SIZE_EXTENDED)?;
            self.put(&(size as u32).to_be_bytes())
        }
    }

    pub fn put_opt_size(&mut self, size: Option<usize>) -> Result<(), WireError> {
        match size {
            Some(size) => self.put_size(size),
            None => self.put_u8(SIZE_NULL),
        }
    }

    pub fn put_string(&mut self, value: &str) -> Result<(), WireError> {
        self.put_size(value.len())?;
        self.put(value.as_bytes())
    }
}

/// Aligned big-endian writes for multi-byte primitive values
macro_rules! impl_writer_primitives {
    ($($name:ident: $typ:ty),* $(,)?) => {
        impl<S: FlushSink> Writer<S> {
            $(
                pub fn $name(&mut self, value: $typ) -> Result<(), WireError> {
                    self.align_buffer(std::mem::size_of::<$typ>())?;
                    self.put(&value.to_be_bytes())
                }
            )*
        }
    };
}
impl_writer_primitives!(
    put_i16: i16,
    put_i32: i32,
    put_i64: i64,
    put_u16: u16,
    put_u32: u32,
    put_u64: u64,
);

impl<S: FlushSink> Writer<S> {
    pub fn put_i8(&mut self, value: i8) -> Result<(), WireError> {
        self.put(&value.to_be_bytes())
    }

    pub fn put_f32(&mut self, value: f32) -> Result<(), WireError> {
        self.align_buffer(4)?;
        self.put(&value.to_be_bytes())
    }

    pub fn put_f64(&mut self, value: f64) -> Result<(), WireError> {
        self.align_buffer(8)?;
        self.put(&value.to_be_bytes())
    }
}

/// Positional reader over a received byte slice
///
/// The position persists across calls, so a partially transferred payload
/// can be resumed by retrying once the transport has buffered more data.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Check that `size` bytes are available without consuming them
    pub fn ensure(&self, size: usize) -> Result<(), WireError> {
        if self.remaining() < size {
            return Err(WireError::UnexpectedEnd);
        }
        Ok(())
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.ensure(len)?;
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn peek_u8(&self) -> Result<u8, WireError> {
        self.ensure(1)?;
        Ok(self.data[self.pos])
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Skip the zero padding the writer emitted for alignment
    pub fn align_data(&mut self, alignment: usize) -> Result<(), WireError> {
        while self.pos % alignment != 0 {
            self.take(1)?;
        }
        Ok(())
    }

    pub fn get_size(&mut self) -> Result<usize, WireError> {
        self.get_opt_size()?.ok_or(WireError::NullSize)
    }

    pub fn get_opt_size(&mut self) -> Result<Option<usize>, WireError> {
        match self.get_u8()? {
            SIZE_NULL => Ok(None),
            SIZE_EXTENDED => {
                let bytes = self.take(4)?;
                let (_, value) = be_u32::<&[u8], nom::error::Error<&[u8]>>(bytes)?;
                Ok(Some(value as usize))
            }
            n => Ok(Some(n as usize)),
        }
    }

    pub fn get_string(&mut self) -> Result<String, WireError> {
        let len = self.get_size()?;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Parse a full field description at the current position
    pub fn get_field(&mut self) -> Result<Field, WireError> {
        let rest = &self.data[self.pos..];
        let (remaining, field) = Field::parse(rest)?;
        self.pos += rest.len() - remaining.len();
        Ok(field)
    }
}

/// Aligned big-endian reads matching the writer's primitive layout
macro_rules! impl_reader_primitives {
    ($($name:ident: $typ:ty = $parser:ident),* $(,)?) => {
        impl<'a> Reader<'a> {
            $(
                pub fn $name(&mut self) -> Result<$typ, WireError> {
                    self.align_data(std::mem::size_of::<$typ>())?;
                    let bytes = self.take(std::mem::size_of::<$typ>())?;
                    let (_, value) = $parser::<&[u8], nom::error::Error<&[u8]>>(bytes)?;
                    Ok(value)
                }
            )*
        }
    };
}
impl_reader_primitives!(
    get_i16: i16 = be_i16,
    get_i32: i32 = be_i32,
    get_i64: i64 = be_i64,
    get_u16: u16 = be_u16,
    get_u32: u32 = be_u32,
    get_u64: u64 = be_u64,
    get_f32: f32 = be_f32,
    get_f64: f64 = be_f64,
);

impl Reader<'_> {
    pub fn get_i8(&mut self) -> Result<i8, WireError> {
        Ok(self.take(1)?[0] as i8)
    }
}

// --- field descriptions ----------------------------------------------------

fn parse_size(input: &[u8]) -> IResult<&[u8], usize> {
    let (input, first) = be_u8(input)?;
    match first {
        SIZE_NULL => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        ))),
        SIZE_EXTENDED => {
            let (input, value) = be_u32(input)?;
            Ok((input, value as usize))
        }
        n => Ok((input, n as usize)),
    }
}

fn parse_string(input: &[u8]) -> IResult<&[u8], String> {
    let (input, len) = parse_size(input)?;
    let (input, raw) = take(len)(input)?;
    Ok((input, String::from_utf8_lossy(raw).into_owned()))
}

fn parse_members(input: &[u8]) -> IResult<&[u8], (String, Vec<(String, FieldRef)>)> {
    let (input, id) = parse_string(input)?;
    let (mut input, n) = parse_size(input)?;
    let mut members = Vec::with_capacity(n);
    for _ in 0..n {
        let (rest, name) = parse_string(input)?;
        let (rest, field) = Field::parse(rest)?;
        members.push((name, Arc::new(field)));
        input = rest;
    }
    Ok((input, (id, members)))
}

fn build_error<T>(input: &[u8]) -> IResult<&[u8], T> {
    Err(nom::Err::Failure(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Verify,
    )))
}

impl Field {
    /// Write the full self-describing form of this descriptor
    pub fn serialize<S: FlushSink>(&self, writer: &mut Writer<S>) -> Result<(), WireError> {
        match self {
            Field::Scalar { scalar_type } => writer.put_u8(TAG_SCALAR | *scalar_type as u8),
            Field::BoundedString { max_length } => {
                writer.put_u8(TAG_BOUNDED_STRING)?;
                writer.put_size(*max_length)
            }
            Field::ScalarArray { element_type } => {
                writer.put_u8(TAG_SCALAR_ARRAY | *element_type as u8)
            }
            Field::Structure(s) => {
                writer.put_u8(TAG_STRUCTURE)?;
                serialize_members(writer, s.id(), s.members())
            }
            Field::Union(u) => {
                if u.is_variant() {
                    writer.put_u8(TAG_VARIANT_UNION)
                } else {
                    writer.put_u8(TAG_UNION)?;
                    serialize_members(writer, u.id(), u.members())
                }
            }
            Field::StructureArray(s) => {
                writer.put_u8(TAG_STRUCTURE_ARRAY)?;
                Field::Structure(s.as_ref().clone()).serialize(writer)
            }
            Field::UnionArray(u) => {
                writer.put_u8(TAG_UNION_ARRAY)?;
                Field::Union(u.as_ref().clone()).serialize(writer)
            }
        }
    }

    /// Parse a full field description
    pub fn parse(input: &[u8]) -> IResult<&[u8], Field> {
        let (input, tag) = be_u8(input)?;
        match tag & 0xF0 {
            TAG_SCALAR => match ScalarType::try_from(tag & 0x0F) {
                Ok(scalar_type) => Ok((input, Field::Scalar { scalar_type })),
                Err(_) => build_error(input),
            },
            TAG_SCALAR_ARRAY => match ScalarType::try_from(tag & 0x0F) {
                Ok(element_type) => Ok((input, Field::ScalarArray { element_type })),
                Err(_) => build_error(input),
            },
            TAG_BOUNDED_STRING => {
                let (input, max_length) = parse_size(input)?;
                Ok((input, Field::BoundedString { max_length }))
            }
            TAG_STRUCTURE => {
                let (input, (id, members)) = parse_members(input)?;
                match Structure::new(id, members) {
                    Ok(s) => Ok((input, Field::Structure(s))),
                    Err(_) => build_error(input),
                }
            }
            TAG_UNION => {
                let (input, (id, members)) = parse_members(input)?;
                match Union::new(id, members) {
                    Ok(u) => Ok((input, Field::Union(u))),
                    Err(_) => build_error(input),
                }
            }
            TAG_VARIANT_UNION => Ok((input, Field::Union(Union::variant()))),
            TAG_STRUCTURE_ARRAY => {
                let (input, element) = Field::parse(input)?;
                match element {
                    Field::Structure(s) => Ok((input, Field::StructureArray(Arc::new(s)))),
                    _ => build_error(input),
                }
            }
            TAG_UNION_ARRAY => {
                let (input, element) = Field::parse(input)?;
                match element {
                    Field::Union(u) => Ok((input, Field::UnionArray(Arc::new(u)))),
                    _ => build_error(input),
                }
            }
            _ => build_error(input),
        }
    }
}

fn serialize_members<'m, S: FlushSink>(
    writer: &mut Writer<S>,
    id: &str,
    members: impl Iterator<Item = (&'m str, &'m FieldRef)>,
) -> Result<(), WireError> {
    writer.put_string(id)?;
    let members: Vec<_> = members.collect();
    writer.put_size(members.len())?;
    for (name, field) in members {
        writer.put_string(name)?;
        field.serialize(writer)?;
    }
    Ok(())
}

// --- values ----------------------------------------------------------------

fn serialize_scalar<S: FlushSink>(
    value: &ScalarValue,
    writer: &mut Writer<S>,
) -> Result<(), WireError> {
    match value {
        ScalarValue::Boolean(v) => writer.put_u8(*v as u8),
        ScalarValue::Byte(v) => writer.put_i8(*v),
        ScalarValue::Short(v) => writer.put_i16(*v),
        ScalarValue::Int(v) => writer.put_i32(*v),
        ScalarValue::Long(v) => writer.put_i64(*v),
        ScalarValue::UByte(v) => writer.put_u8(*v),
        ScalarValue::UShort(v) => writer.put_u16(*v),
        ScalarValue::UInt(v) => writer.put_u32(*v),
        ScalarValue::ULong(v) => writer.put_u64(*v),
        ScalarValue::Float(v) => writer.put_f32(*v),
        ScalarValue::Double(v) => writer.put_f64(*v),
        ScalarValue::String(v) => writer.put_string(v),
    }
}

fn deserialize_scalar_into(
    value: &mut ScalarValue,
    reader: &mut Reader<'_>,
) -> Result<(), WireError> {
    match value {
        ScalarValue::Boolean(v) => *v = reader.get_u8()? != 0,
        ScalarValue::Byte(v) => *v = reader.get_i8()?,
        ScalarValue::Short(v) => *v = reader.get_i16()?,
        ScalarValue::Int(v) => *v = reader.get_i32()?,
        ScalarValue::Long(v) => *v = reader.get_i64()?,
        ScalarValue::UByte(v) => *v = reader.get_u8()?,
        ScalarValue::UShort(v) => *v = reader.get_u16()?,
        ScalarValue::UInt(v) => *v = reader.get_u32()?,
        ScalarValue::ULong(v) => *v = reader.get_u64()?,
        ScalarValue::Float(v) => *v = reader.get_f32()?,
        ScalarValue::Double(v) => *v = reader.get_f64()?,
        ScalarValue::String(v) => *v = reader.get_string()?,
    }
    Ok(())
}

fn serialize_array_elements<S: FlushSink>(
    value: &ArrayValue,
    range: std::ops::Range<usize>,
    writer: &mut Writer<S>,
) -> Result<(), WireError> {
    if range.end > value.len() {
        return Err(WireError::SliceOutOfRange);
    }
    match value {
        ArrayValue::Boolean(v) => {
            for x in &v[range] {
                writer.put_u8(*x as u8)?;
            }
        }
        ArrayValue::Byte(v) => {
            for x in &v[range] {
                writer.put_i8(*x)?;
            }
        }
        ArrayValue::Short(v) => {
            for x in &v[range] {
                writer.put_i16(*x)?;
            }
        }
        ArrayValue::Int(v) => {
            for x in &v[range] {
                writer.put_i32(*x)?;
            }
        }
        ArrayValue::Long(v) => {
            for x in &v[range] {
                writer.put_i64(*x)?;
            }
        }
        ArrayValue::UByte(v) => {
            for x in &v[range] {
                writer.put_u8(*x)?;
            }
        }
        ArrayValue::UShort(v) => {
            for x in &v[range] {
                writer.put_u16(*x)?;
            }
        }
        ArrayValue::UInt(v) => {
            for x in &v[range] {
                writer.put_u32(*x)?;
            }
        }
        ArrayValue::ULong(v) => {
            for x in &v[range] {
                writer.put_u64(*x)?;
            }
        }
        ArrayValue::Float(v) => {
            for x in &v[range] {
                writer.put_f32(*x)?;
            }
        }
        ArrayValue::Double(v) => {
            for x in &v[range] {
                writer.put_f64(*x)?;
            }
        }
        ArrayValue::String(v) => {
            for x in &v[range] {
                writer.put_string(x)?;
            }
        }
    }
    Ok(())
}

/// Decode `n` array elements of the given type at the reader's position
fn read_array_elements(
    element_type: ScalarType,
    n: usize,
    reader: &mut Reader<'_>,
) -> Result<ArrayValue, WireError> {
    if let Some(width) = element_type.wire_size() {
        if width > 1 {
            reader.align_data(width)?;
        }
    }
    Ok(match element_type {
        ScalarType::Boolean => {
            let bytes = reader.take(n)?;
            ArrayValue::Boolean(bytes.iter().map(|&b| b != 0).collect())
        }
        ScalarType::Byte => {
            ArrayValue::Byte(count(be_i8::<_, NomError<'_>>, n).parse(reader.take(n)?)?.1)
        }
        ScalarType::UByte => ArrayValue::UByte(reader.take(n)?.to_vec()),
        ScalarType::Short => {
            ArrayValue::Short(count(be_i16::<_, NomError<'_>>, n).parse(reader.take(n * 2)?)?.1)
        }
        ScalarType::UShort => {
            ArrayValue::UShort(count(be_u16::<_, NomError<'_>>, n).parse(reader.take(n * 2)?)?.1)
        }
        ScalarType::Int => {
            ArrayValue::Int(count(be_i32::<_, NomError<'_>>, n).parse(reader.take(n * 4)?)?.1)
        }
        ScalarType::UInt => {
            ArrayValue::UInt(count(be_u32::<_, NomError<'_>>, n).parse(reader.take(n * 4)?)?.1)
        }
        ScalarType::Long => {
            ArrayValue::Long(count(be_i64::<_, NomError<'_>>, n).parse(reader.take(n * 8)?)?.1)
        }
        ScalarType::ULong => {
            ArrayValue::ULong(count(be_u64::<_, NomError<'_>>, n).parse(reader.take(n * 8)?)?.1)
        }
        ScalarType::Float => {
            ArrayValue::Float(count(be_f32::<_, NomError<'_>>, n).parse(reader.take(n * 4)?)?.1)
        }
        ScalarType::Double => {
            ArrayValue::Double(count(be_f64::<_, NomError<'_>>, n).parse(reader.take(n * 8)?)?.1)
        }
        ScalarType::String => {
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(reader.get_string()?);
            }
            ArrayValue::String(items)
        }
    })
}

impl PVField {
    /// Write this value tree; the receiver must already know the schema
    pub fn serialize<S: FlushSink>(&self, writer: &mut Writer<S>) -> Result<(), WireError> {
        match self.value() {
            PVValue::Scalar(v) => serialize_scalar(v, writer),
            PVValue::ScalarArray(a) => {
                writer.put_size(a.len())?;
                serialize_array_elements(a, 0..a.len(), writer)
            }
            PVValue::Structure(children) => {
                for child in children {
                    child.serialize(writer)?;
                }
                Ok(())
            }
            PVValue::StructureArray(elements) | PVValue::UnionArray(elements) => {
                writer.put_size(elements.len())?;
                for element in elements {
                    match element {
                        None => writer.put_u8(0)?,
                        Some(pv) => {
                            writer.put_u8(1)?;
                            pv.serialize(writer)?;
                        }
                    }
                }
                Ok(())
            }
            PVValue::Union(u) => self.serialize_union(u, writer),
        }
    }

    fn serialize_union<S: FlushSink>(
        &self,
        value: &UnionValue,
        writer: &mut Writer<S>,
    ) -> Result<(), WireError> {
        let Field::Union(descriptor) = self.field().as_ref() else {
            return Err(WireError::InvalidTag(TAG_UNION));
        };
        if descriptor.is_variant() {
            match value.get() {
                None => writer.put_u8(CACHE_NULL),
                Some(pv) => {
                    pv.field().serialize(writer)?;
                    pv.serialize(writer)
                }
            }
        } else {
            writer.put_opt_size(value.selector())?;
            match value.get() {
                Some(pv) => pv.serialize(writer),
                None => Ok(()),
            }
        }
    }

    /// Read this value tree in place against its own schema
    pub fn deserialize(&mut self, reader: &mut Reader<'_>) -> Result<(), WireError> {
        let field = self.field().clone();
        match self.value_mut() {
            PVValue::Scalar(v) => deserialize_scalar_into(v, reader),
            PVValue::ScalarArray(a) => {
                let n = reader.get_size()?;
                *a = read_array_elements(a.element_type(), n, reader)?;
                Ok(())
            }
            PVValue::Structure(children) => {
                for child in children {
                    child.deserialize(reader)?;
                }
                Ok(())
            }
            PVValue::StructureArray(elements) | PVValue::UnionArray(elements) => {
                let n = reader.get_size()?;
                let element_descriptor =
                    element_field(&field).ok_or(WireError::InvalidTag(TAG_STRUCTURE_ARRAY))?;
                let mut incoming = Vec::with_capacity(n);
                for _ in 0..n {
                    if reader.get_u8()? == 0 {
                        incoming.push(None);
                    } else {
                        let mut pv = PVField::new(element_descriptor.clone());
                        pv.deserialize(reader)?;
                        incoming.push(Some(pv));
                    }
                }
                *elements = incoming;
                Ok(())
            }
            PVValue::Union(u) => {
                let Field::Union(descriptor) = field.as_ref() else {
                    return Err(WireError::InvalidTag(TAG_UNION));
                };
                if descriptor.is_variant() {
                    if reader.peek_u8()? == CACHE_NULL {
                        reader.get_u8()?;
                        u.selector = None;
                        u.value = None;
                        return Ok(());
                    }
                    let inner_field = Arc::new(reader.get_field()?);
                    let mut pv = PVField::new(inner_field);
                    pv.deserialize(reader)?;
                    u.selector = None;
                    u.value = Some(Box::new(pv));
                    Ok(())
                } else {
                    match reader.get_opt_size()? {
                        None => {
                            u.selector = None;
                            u.value = None;
                            Ok(())
                        }
                        Some(index) => {
                            let member = descriptor
                                .get_fields()
                                .get(index)
                                .ok_or(WireError::InvalidTag(TAG_UNION))?
                                .clone();
                            let mut pv = PVField::new(member);
                            pv.deserialize(reader)?;
                            u.selector = Some(index);
                            u.value = Some(Box::new(pv));
                            Ok(())
                        }
                    }
                }
            }
        }
    }

    /// Write a chunk of a scalar array, for transfers split across flushes
    pub fn serialize_array_slice<S: FlushSink>(
        &self,
        writer: &mut Writer<S>,
        offset: usize,
        count: usize,
    ) -> Result<(), WireError> {
        let array = self
            .get_array()
            .ok_or(WireError::InvalidTag(TAG_SCALAR_ARRAY))?;
        let end = offset
            .checked_add(count)
            .filter(|&end| end <= array.len())
            .ok_or(WireError::SliceOutOfRange)?;
        writer.put_size(count)?;
        serialize_array_elements(array, offset..end, writer)
    }

    /// Apply one chunk of a scalar array at the given element offset
    ///
    /// The array grows to fit; chunks may arrive over repeated calls.
    pub fn deserialize_array_slice(
        &mut self,
        reader: &mut Reader<'_>,
        offset: usize,
    ) -> Result<(), WireError> {
        let element_type = self
            .get_array()
            .ok_or(WireError::InvalidTag(TAG_SCALAR_ARRAY))?
            .element_type();
        let n = reader.get_size()?;
        let chunk = read_array_elements(element_type, n, reader)?;
        let result = match (&chunk, self) {
            (ArrayValue::Boolean(data), pv) => pv.put_boolean_slice(offset, data),
            (ArrayValue::Byte(data), pv) => pv.put_byte_slice(offset, data),
            (ArrayValue::Short(data), pv) => pv.put_short_slice(offset, data),
            (ArrayValue::Int(data), pv) => pv.put_int_slice(offset, data),
            (ArrayValue::Long(data), pv) => pv.put_long_slice(offset, data),
            (ArrayValue::UByte(data), pv) => pv.put_ubyte_slice(offset, data),
            (ArrayValue::UShort(data), pv) => pv.put_ushort_slice(offset, data),
            (ArrayValue::UInt(data), pv) => pv.put_uint_slice(offset, data),
            (ArrayValue::ULong(data), pv) => pv.put_ulong_slice(offset, data),
            (ArrayValue::Float(data), pv) => pv.put_float_slice(offset, data),
            (ArrayValue::Double(data), pv) => pv.put_double_slice(offset, data),
            (ArrayValue::String(data), pv) => pv.put_string_slice(offset, data),
        };
        result.map_err(|_| WireError::SliceOutOfRange)
    }

    /// Write only the fields whose offset bit is set, in ascending order
    ///
    /// A structure whose own bit is set writes its entire subtree; a subtree
    /// containing no set bits writes nothing.
    pub fn serialize_with_bitset<S: FlushSink>(
        &self,
        writer: &mut Writer<S>,
        bits: &BitSet,
    ) -> Result<(), WireError> {
        if self.type_of() == Type::Structure {
            if bits.get(self.offset()) {
                return self.serialize(writer);
            }
            if !bits.any_in_range(self.offset(), self.next_offset()) {
                return Ok(());
            }
            if let Some(children) = self.children() {
                for child in children {
                    child.serialize_with_bitset(writer, bits)?;
                }
            }
            Ok(())
        } else if bits.get(self.offset()) {
            self.serialize(writer)
        } else {
            Ok(())
        }
    }

    /// Apply a partial update produced by [`PVField::serialize_with_bitset`]
    ///
    /// Fields whose bit is clear keep their current value.
    pub fn deserialize_with_bitset(
        &mut self,
        reader: &mut Reader<'_>,
        bits: &BitSet,
    ) -> Result<(), WireError> {
        if self.type_of() == Type::Structure {
            if bits.get(self.offset()) {
                return self.deserialize(reader);
            }
            if !bits.any_in_range(self.offset(), self.next_offset()) {
                return Ok(());
            }
            if let Some(children) = self.children_mut() {
                for child in children {
                    child.deserialize_with_bitset(reader, bits)?;
                }
            }
            Ok(())
        } else if bits.get(self.offset()) {
            self.deserialize(reader)
        } else {
            Ok(())
        }
    }
}

// --- per-connection schema cache -------------------------------------------

/// Two-way schema cache; one per connection, per direction of use
///
/// Both peers must keep their registries in lockstep and reset them
/// together with the connection.
pub struct FieldRegistry {
    limit: usize,
    outgoing: HashMap<FieldRef, u16>,
    incoming: HashMap<u16, FieldRef>,
    next_id: u16,
    warned_full: bool,
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::with_limit(utils::get_default_field_cache_limit())
    }

    pub fn with_limit(limit: usize) -> Self {
        FieldRegistry {
            limit: limit.min(u16::MAX as usize),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            next_id: 0,
            warned_full: false,
        }
    }

    /// Number of schemas this registry has assigned or learned
    pub fn len(&self) -> usize {
        self.outgoing.len().max(self.incoming.len())
    }

    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.incoming.is_empty()
    }

    /// Forget everything; must coincide with a connection reset
    pub fn reset(&mut self) {
        debug!("resetting field cache ({} entries)", self.len());
        self.outgoing.clear();
        self.incoming.clear();
        self.next_id = 0;
        self.warned_full = false;
    }

    /// Write a schema, as a cache reference when it was sent before
    pub fn serialize_field<S: FlushSink>(
        &mut self,
        field: &FieldRef,
        writer: &mut Writer<S>,
    ) -> Result<(), WireError> {
        if let Some(&id) = self.outgoing.get(field) {
            writer.put_u8(CACHE_ONLY_ID)?;
            return writer.put(&id.to_be_bytes());
        }
        if self.outgoing.len() < self.limit {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            self.outgoing.insert(field.clone(), id);
            writer.put_u8(CACHE_FULL_WITH_ID)?;
            writer.put(&id.to_be_bytes())?;
            field.serialize(writer)
        } else {
            if !self.warned_full {
                warn!(
                    "field cache limit of {} reached; further schemas are sent uncached",
                    self.limit
                );
                self.warned_full = true;
            }
            writer.put_u8(CACHE_FULL_UNCACHED)?;
            field.serialize(writer)
        }
    }

    /// Write the marker for an absent field
    pub fn serialize_null_field<S: FlushSink>(writer: &mut Writer<S>) -> Result<(), WireError> {
        writer.put_u8(CACHE_NULL)
    }

    /// Read a schema, resolving cache references against earlier messages
    pub fn deserialize_field(
        &mut self,
        reader: &mut Reader<'_>,
    ) -> Result<Option<FieldRef>, WireError> {
        match reader.peek_u8()? {
            CACHE_NULL => {
                reader.get_u8()?;
                Ok(None)
            }
            CACHE_ONLY_ID => {
                reader.get_u8()?;
                let bytes = reader.take(2)?;
                let id = u16::from_be_bytes([bytes[0], bytes[1]]);
                self.incoming
                    .get(&id)
                    .cloned()
                    .map(Some)
                    .ok_or(WireError::UnknownFieldId(id))
            }
            CACHE_FULL_WITH_ID => {
                reader.get_u8()?;
                let bytes = reader.take(2)?;
                let id = u16::from_be_bytes([bytes[0], bytes[1]]);
                let field = Arc::new(reader.get_field()?);
                self.incoming.insert(id, field.clone());
                Ok(Some(field))
            }
            CACHE_FULL_UNCACHED => {
                reader.get_u8()?;
                Ok(Some(Arc::new(reader.get_field()?)))
            }
            _ => Ok(Some(Arc::new(reader.get_field()?))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldBuilder;

    fn to_bytes(f: impl FnOnce(&mut Writer<Vec<u8>>)) -> Vec<u8> {
        let mut w = Writer::new(Vec::new());
        f(&mut w);
        w.into_sink().unwrap()
    }

    fn sample_field() -> FieldRef {
        let mut b = FieldBuilder::new();
        b.set_id("record")
            .add("value", ScalarType::Double)
            .unwrap()
            .add_array("history", ScalarType::Float)
            .unwrap()
            .add_nested_structure("alarm")
            .set_id("alarm_t")
            .add("severity", ScalarType::Int)
            .unwrap()
            .add("message", ScalarType::String)
            .unwrap()
            .end_nested()
            .unwrap()
            .add_bounded_string("device", 20)
            .unwrap()
            .create_structure()
            .unwrap()
            .into_field()
    }

    #[test]
    fn size_encoding_boundaries() {
        let bytes = to_bytes(|w| {
            w.put_size(0).unwrap();
            w.put_size(253).unwrap();
            w.put_size(254).unwrap();
            w.put_opt_size(None).unwrap();
        });
        assert_eq!(
            bytes,
            vec![0x00, 0xFD, 0xFE, 0x00, 0x00, 0x00, 0xFE, 0xFF]
        );
        let mut r = Reader::new(&bytes);
        assert_eq!(r.get_size().unwrap(), 0);
        assert_eq!(r.get_size().unwrap(), 253);
        assert_eq!(r.get_size().unwrap(), 254);
        assert_eq!(r.get_opt_size().unwrap(), None);
        assert!(matches!(r.get_size(), Err(WireError::UnexpectedEnd)));
    }

    #[test]
    fn alignment_pads_to_primitive_size() {
        let bytes = to_bytes(|w| {
            w.put_u8(1).unwrap();
            w.put_f64(2.0).unwrap();
            w.put_u8(3).unwrap();
            w.put_i16(4).unwrap();
        });
        // 1 byte, 7 pad, 8 data, 1 byte, 1 pad, 2 data
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[1..8], &[0u8; 7]);
        let mut r = Reader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 1);
        assert_eq!(r.get_f64().unwrap(), 2.0);
        assert_eq!(r.get_u8().unwrap(), 3);
        assert_eq!(r.get_i16().unwrap(), 4);
    }

    #[test]
    fn writer_flushes_at_capacity() {
        struct CountingSink {
            flushes: usize,
            bytes: Vec<u8>,
        }
        impl FlushSink for CountingSink {
            fn flush(&mut self, data: &[u8]) -> io::Result<()> {
                self.flushes += 1;
                self.bytes.extend_from_slice(data);
                Ok(())
            }
        }

        let mut w = Writer::with_buffer_size(
            CountingSink {
                flushes: 0,
                bytes: Vec::new(),
            },
            16,
        );
        let mut pv = PVField::new(Arc::new(Field::ScalarArray {
            element_type: ScalarType::Long,
        }));
        let data: Vec<i64> = (0..32).collect();
        pv.put_long_slice(0, &data).unwrap();
        pv.serialize(&mut w).unwrap();
        let sink = w.into_sink().unwrap();
        assert!(sink.flushes > 4, "expected chunked flushing");
        // And the chunked stream still decodes in one pass
        let mut fresh = PVField::new(Arc::new(Field::ScalarArray {
            element_type: ScalarType::Long,
        }));
        fresh.deserialize(&mut Reader::new(&sink.bytes)).unwrap();
        assert_eq!(fresh.get_long_slice(0, 32).unwrap(), data.as_slice());
    }

    #[test]
    fn field_description_roundtrip() {
        let field = sample_field();
        let bytes = to_bytes(|w| field.serialize(w).unwrap());
        let (rest, parsed) = Field::parse(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(&parsed, field.as_ref());
    }

    #[test]
    fn union_descriptions_roundtrip() {
        let mut b = FieldBuilder::new();
        let u = b
            .set_id("choice")
            .add("i", ScalarType::Int)
            .unwrap()
            .add("names", ScalarType::String)
            .unwrap()
            .create_union()
            .unwrap();
        let field: FieldRef = Arc::new(Field::UnionArray(Arc::new(u)));
        let bytes = to_bytes(|w| field.serialize(w).unwrap());
        let (_, parsed) = Field::parse(&bytes).unwrap();
        assert_eq!(&parsed, field.as_ref());

        let variant = Union::variant().into_field();
        let bytes = to_bytes(|w| variant.serialize(w).unwrap());
        let (_, parsed) = Field::parse(&bytes).unwrap();
        assert_eq!(&parsed, variant.as_ref());
    }

    #[test]
    fn invalid_tags_are_rejected() {
        assert!(Field::parse(&[0x0C]).is_err());
        assert!(Field::parse(&[0x90]).is_err());
        // A structure array whose element is not a structure
        assert!(Field::parse(&[TAG_STRUCTURE_ARRAY, TAG_SCALAR]).is_err());
    }

    #[test]
    fn value_roundtrip_covers_each_kind() {
        let field = sample_field();
        let mut pv = PVField::new(field.clone());
        pv.get_sub_field_mut("value").unwrap().put_double(-2.5);
        pv.get_sub_field_mut("history")
            .unwrap()
            .put_float_slice(0, &[1.0, 2.5])
            .unwrap();
        pv.get_sub_field_path_mut("alarm.severity")
            .unwrap()
            .put_int(3);
        pv.get_sub_field_path_mut("alarm.message")
            .unwrap()
            .put_string("MINOR".into());
        pv.get_sub_field_mut("device")
            .unwrap()
            .put_string("TS-01".into());

        let bytes = to_bytes(|w| pv.serialize(w).unwrap());
        let mut decoded = PVField::new(field);
        decoded.deserialize(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(decoded, pv);
    }

    #[test]
    fn union_value_roundtrip() {
        let mut b = FieldBuilder::new();
        let u = b
            .add("i", ScalarType::Int)
            .unwrap()
            .add("s", ScalarType::String)
            .unwrap()
            .create_union()
            .unwrap();
        let field = u.into_field();
        let mut pv = PVField::new(field.clone());
        pv.select(1).unwrap().put_string("picked".into());

        let bytes = to_bytes(|w| pv.serialize(w).unwrap());
        let mut decoded = PVField::new(field.clone());
        decoded.deserialize(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(decoded, pv);

        // Unselected unions travel as a null marker
        let empty = PVField::new(field.clone());
        let bytes = to_bytes(|w| empty.serialize(w).unwrap());
        let mut decoded = PVField::new(field);
        decoded.select(0).unwrap().put_int(9);
        decoded.deserialize(&mut Reader::new(&bytes)).unwrap();
        assert!(decoded.union_value().unwrap().get().is_none());
    }

    #[test]
    fn variant_union_value_roundtrip() {
        let field = Union::variant().into_field();
        let mut pv = PVField::new(field.clone());
        let mut inner = PVField::new(Arc::new(Field::ScalarArray {
            element_type: ScalarType::Int,
        }));
        inner.put_int_slice(0, &[5, 6]).unwrap();
        pv.set_variant(inner).unwrap();

        let bytes = to_bytes(|w| pv.serialize(w).unwrap());
        let mut decoded = PVField::new(field);
        decoded.deserialize(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(decoded, pv);
    }

    #[test]
    fn structure_array_value_roundtrip() {
        let mut b = FieldBuilder::new();
        let point = b
            .set_id("point")
            .add("x", ScalarType::Double)
            .unwrap()
            .create_structure()
            .unwrap();
        let s = b
            .add_structure_array("points", point.clone())
            .unwrap()
            .create_structure()
            .unwrap();
        let field = s.into_field();
        let mut pv = PVField::new(field.clone());
        let arr = pv.get_sub_field_mut("points").unwrap();
        arr.resize_elements(3).unwrap();
        let mut element = PVField::new(point.into_field());
        element.get_sub_field_mut("x").unwrap().put_double(7.5);
        arr.set_element(1, Some(element)).unwrap();

        let bytes = to_bytes(|w| pv.serialize(w).unwrap());
        let mut decoded = PVField::new(field);
        decoded.deserialize(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(decoded, pv);
        let elements = decoded.get_sub_field("points").unwrap().array_elements();
        assert!(elements.unwrap()[0].is_none());
    }

    #[test]
    fn bitset_filtered_delta_updates_only_marked_offsets() {
        let mut b = FieldBuilder::new();
        let s = b
            .add("f1", ScalarType::Int)
            .unwrap()
            .add("f2", ScalarType::Int)
            .unwrap()
            .add("f3", ScalarType::Int)
            .unwrap()
            .add("f4", ScalarType::Int)
            .unwrap()
            .add("f5", ScalarType::Int)
            .unwrap()
            .create_structure()
            .unwrap();
        let field = s.into_field();
        let mut source = PVField::new(field.clone());
        for (i, name) in ["f1", "f2", "f3", "f4", "f5"].iter().enumerate() {
            source
                .get_sub_field_mut(name)
                .unwrap()
                .put_int(10 * (i as i32 + 1));
        }

        let changed: BitSet = [2usize, 4].into_iter().collect();
        let bytes = to_bytes(|w| {
            changed.serialize(w).unwrap();
            source.serialize_with_bitset(w, &changed).unwrap();
        });

        let mut target = PVField::new(field);
        let mut r = Reader::new(&bytes);
        let mask = BitSet::deserialize(&mut r).unwrap();
        assert_eq!(mask, changed);
        target.deserialize_with_bitset(&mut r, &mask).unwrap();
        assert_eq!(r.remaining(), 0);

        assert_eq!(target.get_sub_field("f1").unwrap().get_int(), Some(0));
        assert_eq!(target.get_sub_field("f2").unwrap().get_int(), Some(20));
        assert_eq!(target.get_sub_field("f3").unwrap().get_int(), Some(0));
        assert_eq!(target.get_sub_field("f4").unwrap().get_int(), Some(40));
        assert_eq!(target.get_sub_field("f5").unwrap().get_int(), Some(0));
    }

    #[test]
    fn bitset_on_structure_bit_sends_whole_subtree() {
        let field = sample_field();
        let mut source = PVField::new(field.clone());
        source
            .get_sub_field_path_mut("alarm.severity")
            .unwrap()
            .put_int(2);
        source
            .get_sub_field_path_mut("alarm.message")
            .unwrap()
            .put_string("MAJOR".into());
        let alarm_offset = source.get_sub_field("alarm").unwrap().offset();

        let changed: BitSet = [alarm_offset].into_iter().collect();
        let bytes = to_bytes(|w| source.serialize_with_bitset(w, &changed).unwrap());

        let mut target = PVField::new(field);
        target
            .deserialize_with_bitset(&mut Reader::new(&bytes), &changed)
            .unwrap();
        assert_eq!(
            target.get_sub_field_path("alarm.message").unwrap(),
            source.get_sub_field_path("alarm.message").unwrap()
        );
        assert_eq!(target.get_sub_field("value").unwrap().get_double(), Some(0.0));
    }

    #[test]
    fn array_slices_transfer_in_chunks() {
        let field: FieldRef = Arc::new(Field::ScalarArray {
            element_type: ScalarType::Double,
        });
        let mut source = PVField::new(field.clone());
        let data: Vec<f64> = (0..10).map(|i| i as f64 / 2.0).collect();
        source.put_double_slice(0, &data).unwrap();

        let first = to_bytes(|w| source.serialize_array_slice(w, 0, 6).unwrap());
        let second = to_bytes(|w| source.serialize_array_slice(w, 6, 4).unwrap());
        assert!(matches!(
            source.serialize_array_slice(&mut Writer::new(Vec::new()), 6, 5),
            Err(WireError::SliceOutOfRange)
        ));

        let mut target = PVField::new(field);
        target
            .deserialize_array_slice(&mut Reader::new(&first), 0)
            .unwrap();
        target
            .deserialize_array_slice(&mut Reader::new(&second), 6)
            .unwrap();
        assert_eq!(target.get_double_slice(0, 10).unwrap(), data.as_slice());
    }

    #[test]
    fn registry_caches_after_first_description() {
        let field = sample_field();
        let mut sender = FieldRegistry::with_limit(16);
        let mut receiver = FieldRegistry::with_limit(16);

        let first = to_bytes(|w| sender.serialize_field(&field, w).unwrap());
        let second = to_bytes(|w| sender.serialize_field(&field, w).unwrap());
        assert_eq!(first[0], CACHE_FULL_WITH_ID);
        assert_eq!(second, vec![CACHE_ONLY_ID, 0x00, 0x00]);
        assert!(second.len() < first.len());

        let decoded_first = receiver
            .deserialize_field(&mut Reader::new(&first))
            .unwrap()
            .unwrap();
        let decoded_second = receiver
            .deserialize_field(&mut Reader::new(&second))
            .unwrap()
            .unwrap();
        assert_eq!(decoded_first, field);
        assert_eq!(decoded_second, field);
        assert_eq!(receiver.len(), 1);
    }

    #[test]
    fn registry_miss_is_a_protocol_error() {
        let mut receiver = FieldRegistry::with_limit(16);
        let bytes = vec![CACHE_ONLY_ID, 0x00, 0x07];
        assert!(matches!(
            receiver.deserialize_field(&mut Reader::new(&bytes)),
            Err(WireError::UnknownFieldId(7))
        ));
    }

    #[test]
    fn registry_over_limit_degrades_to_uncached() {
        let mut sender = FieldRegistry::with_limit(1);
        let f1: FieldRef = Arc::new(Field::Scalar {
            scalar_type: ScalarType::Int,
        });
        let f2: FieldRef = Arc::new(Field::Scalar {
            scalar_type: ScalarType::Double,
        });
        let first = to_bytes(|w| sender.serialize_field(&f1, w).unwrap());
        assert_eq!(first[0], CACHE_FULL_WITH_ID);
        let second = to_bytes(|w| sender.serialize_field(&f2, w).unwrap());
        assert_eq!(second[0], CACHE_FULL_UNCACHED);
        // The cached schema still goes by id
        let again = to_bytes(|w| sender.serialize_field(&f1, w).unwrap());
        assert_eq!(again[0], CACHE_ONLY_ID);

        let mut receiver = FieldRegistry::with_limit(1);
        assert_eq!(
            receiver
                .deserialize_field(&mut Reader::new(&first))
                .unwrap()
                .unwrap(),
            f1
        );
        assert_eq!(
            receiver
                .deserialize_field(&mut Reader::new(&second))
                .unwrap()
                .unwrap(),
            f2
        );
        assert_eq!(receiver.len(), 1);
    }

    #[test]
    fn registry_reset_forgets_ids() {
        let field = sample_field();
        let mut sender = FieldRegistry::with_limit(16);
        let mut receiver = FieldRegistry::with_limit(16);
        let first = to_bytes(|w| sender.serialize_field(&field, w).unwrap());
        receiver
            .deserialize_field(&mut Reader::new(&first))
            .unwrap();

        sender.reset();
        receiver.reset();
        assert!(receiver.is_empty());
        // After the reset the id reference would be a protocol error
        let reference = vec![CACHE_ONLY_ID, 0x00, 0x00];
        assert!(matches!(
            receiver.deserialize_field(&mut Reader::new(&reference)),
            Err(WireError::UnknownFieldId(0))
        ));
        // And a fresh full description re-registers cleanly
        let full = to_bytes(|w| sender.serialize_field(&field, w).unwrap());
        assert_eq!(full[0], CACHE_FULL_WITH_ID);
        assert_eq!(
            receiver
                .deserialize_field(&mut Reader::new(&full))
                .unwrap()
                .unwrap(),
            field
        );
    }

    #[test]
    fn null_field_marker() {
        let bytes = to_bytes(|w| FieldRegistry::serialize_null_field(w).unwrap());
        assert_eq!(bytes, vec![CACHE_NULL]);
        let mut receiver = FieldRegistry::with_limit(16);
        assert!(
            receiver
                .deserialize_field(&mut Reader::new(&bytes))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn truncated_value_reports_unexpected_end() {
        let field = sample_field();
        let mut pv = PVField::new(field.clone());
        pv.get_sub_field_mut("device")
            .unwrap()
            .put_string("0123456789".into());
        let bytes = to_bytes(|w| pv.serialize(w).unwrap());
        let mut decoded = PVField::new(field);
        assert!(matches!(
            decoded.deserialize(&mut Reader::new(&bytes[..bytes.len() - 4])),
            Err(WireError::UnexpectedEnd)
        ));
    }
}
