// #![warn(missing_docs)]

//! Typed process-variable data model with self-describing introspection and
//! compact wire serialization.
//!
//! This crate implements the data layer of an instrument-control system: a
//! reflection type system describing recursively nested records (structures,
//! unions, arrays, twelve scalar encodings including unsigned widths), the
//! mutable value trees that shadow those descriptions at runtime, a
//! structural-compatibility conversion engine, and a wire encoding with
//! per-connection schema caching and bitset-driven partial updates. It is
//! the in-process core a channel-access style network protocol builds on;
//! the transport itself lives outside this crate and calls in through the
//! [`serialize`] module.
//!
//! The pieces, bottom up:
//!
//! - [`types`]: [`ScalarType`]/[`Type`] taxonomies and the immutable
//!   [`Field`] descriptor tree ([`Structure`], [`Union`], arrays, bounded
//!   strings).
//! - [`builder`]: [`FieldBuilder`], incremental construction of nested
//!   descriptors with push/pop frames.
//! - [`value`]: [`PVField`] value trees with pre-order field offsets,
//!   one-way immutability and typed accessors.
//! - [`convert`]: structural compatibility checks, best-effort structure
//!   copying, and numeric/string conversion across all scalar encodings.
//! - [`bitset`]: [`BitSet`] change masks addressing fields by offset.
//! - [`serialize`]: the wire format, flush-driven [`serialize::Writer`] and
//!   resumable [`serialize::Reader`], and the [`FieldRegistry`] schema
//!   cache.
//!
//! ## Example
//!
//! Build a record description, fill in a value tree, and ship a delta
//! update the way a monitor would:
//!
//! ```
//! use pvars::{BitSet, FieldBuilder, PVField, types::ScalarType};
//! use pvars::serialize::{Reader, Writer};
//!
//! let mut builder = FieldBuilder::new();
//! let make_record = |builder: &mut FieldBuilder| {
//!     builder
//!         .set_id("epics:nt/NTScalar:1.0")
//!         .add("value", ScalarType::Double)
//!         .unwrap()
//!         .add("units", ScalarType::String)
//!         .unwrap()
//!         .create_structure()
//!         .unwrap()
//! };
//!
//! let mut pv = PVField::new(make_record(&mut builder).into_field());
//! pv.get_sub_field_mut("value").unwrap().put_double(17.25);
//!
//! // Only the "value" field (offset 1) changed since the last update
//! let mut changed = BitSet::new();
//! changed.set(pv.get_sub_field("value").unwrap().offset());
//!
//! let mut writer = Writer::new(Vec::new());
//! changed.serialize(&mut writer).unwrap();
//! pv.serialize_with_bitset(&mut writer, &changed).unwrap();
//! let message = writer.into_sink().unwrap();
//!
//! // The receiving side applies it to its own copy of the record
//! let mut reader = Reader::new(&message);
//! let mask = BitSet::deserialize(&mut reader).unwrap();
//! let mut replica = PVField::new(make_record(&mut builder).into_field());
//! replica.deserialize_with_bitset(&mut reader, &mask).unwrap();
//! assert_eq!(replica.get_sub_field("value").unwrap().get_double(), Some(17.25));
//! ```

pub mod bitset;
pub mod builder;
pub mod convert;
pub mod serialize;
pub mod types;
pub mod value;

mod utils;

pub use crate::bitset::BitSet;
pub use crate::builder::{BuildError, FieldBuilder};
pub use crate::serialize::FieldRegistry;
pub use crate::types::{Field, FieldRef, ScalarType, Structure, Type, Union};
pub use crate::value::{AccessError, PVField};
