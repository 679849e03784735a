//! Structural compatibility checks and value conversion.
//!
//! Copying between two value trees is decided by shape, not provenance: any
//! two numeric scalars convert in either direction (including lossy
//! narrowing), anything converts to and from string, and composite kinds
//! require recursively identical schemas. The one deliberate exception is
//! [`copy_structure`], which copies the name-matched, pairwise-compatible
//! subset of subfields and silently skips the rest, so copying between
//! superset- and subset-shaped records yields partial results instead of an
//! error.
//!
//! Numeric conversions keep the semantics the wire peers expect: converting
//! a floating value to an integer truncates toward zero and saturates at the
//! target's range, integer narrowing wraps two's complement, and unsigned
//! sources widen by value, so a `ubyte` bit pattern of `0xFF` reads as `255`
//! and never `-1`.

use std::str::FromStr;

use num::cast::AsPrimitive;
use thiserror::Error;

use crate::types::{Field, ScalarType, Type};
use crate::value::{AccessError, ArrayValue, PVField, PVValue, ScalarValue, UnionValue};

#[derive(Error, Debug, PartialEq)]
pub enum ConvertError {
    #[error("source and destination are not copy compatible")]
    Incompatible,
    #[error("cannot parse {0:?} as the requested type")]
    Unparseable(String),
    #[error("no conversion between boolean and numeric types")]
    Unsupported,
    #[error(transparent)]
    Access(#[from] AccessError),
}

// --- compatibility predicates ----------------------------------------------

/// Scalar copy compatibility: numeric to numeric always, string with
/// anything, boolean only with boolean or string.
pub fn is_copy_scalar_compatible(from: ScalarType, to: ScalarType) -> bool {
    from == to
        || (from.is_numeric() && to.is_numeric())
        || from == ScalarType::String
        || to == ScalarType::String
}

/// The scalar rule applied to array element types
pub fn is_copy_scalar_array_compatible(from: ScalarType, to: ScalarType) -> bool {
    is_copy_scalar_compatible(from, to)
}

/// Structures copy only into the identical schema
pub fn is_copy_structure_compatible(from: &Field, to: &Field) -> bool {
    matches!((from, to), (Field::Structure(a), Field::Structure(b)) if a == b)
}

pub fn is_copy_structure_array_compatible(from: &Field, to: &Field) -> bool {
    matches!((from, to), (Field::StructureArray(a), Field::StructureArray(b)) if a == b)
}

pub fn is_copy_union_compatible(from: &Field, to: &Field) -> bool {
    matches!((from, to), (Field::Union(a), Field::Union(b)) if a == b)
}

pub fn is_copy_union_array_compatible(from: &Field, to: &Field) -> bool {
    matches!((from, to), (Field::UnionArray(a), Field::UnionArray(b)) if a == b)
}

/// Dispatch on kind, then to the kind-specific predicate
pub fn is_copy_compatible(from: &Field, to: &Field) -> bool {
    if from.get_type() != to.get_type() {
        return false;
    }
    match from.get_type() {
        Type::Scalar => match (from.scalar_type(), to.scalar_type()) {
            (Some(a), Some(b)) => is_copy_scalar_compatible(a, b),
            _ => false,
        },
        Type::ScalarArray => match (from.scalar_type(), to.scalar_type()) {
            (Some(a), Some(b)) => is_copy_scalar_array_compatible(a, b),
            _ => false,
        },
        Type::Structure => is_copy_structure_compatible(from, to),
        Type::StructureArray => is_copy_structure_array_compatible(from, to),
        Type::Union => is_copy_union_compatible(from, to),
        Type::UnionArray => is_copy_union_array_compatible(from, to),
    }
}

// --- scalar conversion core ------------------------------------------------

/// Convert any numeric or string scalar to a primitive numeric type
///
/// Cast semantics are those of `as`: float to integer truncates toward zero
/// and saturates, integer narrowing wraps, unsigned sources widen by value.
pub fn to_numeric<T>(value: &ScalarValue) -> Result<T, ConvertError>
where
    T: Copy + 'static + FromStr,
    i8: AsPrimitive<T>,
    i16: AsPrimitive<T>,
    i32: AsPrimitive<T>,
    i64: AsPrimitive<T>,
    u8: AsPrimitive<T>,
    u16: AsPrimitive<T>,
    u32: AsPrimitive<T>,
    u64: AsPrimitive<T>,
    f32: AsPrimitive<T>,
    f64: AsPrimitive<T>,
{
    Ok(match value {
        ScalarValue::Boolean(_) => return Err(ConvertError::Unsupported),
        ScalarValue::Byte(v) => v.as_(),
        ScalarValue::Short(v) => v.as_(),
        ScalarValue::Int(v) => v.as_(),
        ScalarValue::Long(v) => v.as_(),
        ScalarValue::UByte(v) => v.as_(),
        ScalarValue::UShort(v) => v.as_(),
        ScalarValue::UInt(v) => v.as_(),
        ScalarValue::ULong(v) => v.as_(),
        ScalarValue::Float(v) => v.as_(),
        ScalarValue::Double(v) => v.as_(),
        ScalarValue::String(s) => s
            .trim()
            .parse::<T>()
            .map_err(|_| ConvertError::Unparseable(s.clone()))?,
    })
}

/// Convert a scalar value to the given target type
pub fn convert_scalar(value: &ScalarValue, to: ScalarType) -> Result<ScalarValue, ConvertError> {
    Ok(match to {
        ScalarType::Boolean => match value {
            ScalarValue::Boolean(b) => ScalarValue::Boolean(*b),
            ScalarValue::String(s) => ScalarValue::Boolean(
                s.trim()
                    .parse::<bool>()
                    .map_err(|_| ConvertError::Unparseable(s.clone()))?,
            ),
            _ => return Err(ConvertError::Unsupported),
        },
        ScalarType::Byte => ScalarValue::Byte(to_numeric::<i8>(value)?),
        ScalarType::Short => ScalarValue::Short(to_numeric::<i16>(value)?),
        ScalarType::Int => ScalarValue::Int(to_numeric::<i32>(value)?),
        ScalarType::Long => ScalarValue::Long(to_numeric::<i64>(value)?),
        ScalarType::UByte => ScalarValue::UByte(to_numeric::<u8>(value)?),
        ScalarType::UShort => ScalarValue::UShort(to_numeric::<u16>(value)?),
        ScalarType::UInt => ScalarValue::UInt(to_numeric::<u32>(value)?),
        ScalarType::ULong => ScalarValue::ULong(to_numeric::<u64>(value)?),
        ScalarType::Float => ScalarValue::Float(to_numeric::<f32>(value)?),
        ScalarType::Double => ScalarValue::Double(to_numeric::<f64>(value)?),
        ScalarType::String => ScalarValue::String(value.to_string()),
    })
}

fn array_to_numeric<T>(value: &ArrayValue) -> Result<Vec<T>, ConvertError>
where
    T: Copy + 'static + FromStr,
    i8: AsPrimitive<T>,
    i16: AsPrimitive<T>,
    i32: AsPrimitive<T>,
    i64: AsPrimitive<T>,
    u8: AsPrimitive<T>,
    u16: AsPrimitive<T>,
    u32: AsPrimitive<T>,
    u64: AsPrimitive<T>,
    f32: AsPrimitive<T>,
    f64: AsPrimitive<T>,
{
    Ok(match value {
        ArrayValue::Boolean(_) => return Err(ConvertError::Unsupported),
        ArrayValue::Byte(v) => v.iter().map(|x| x.as_()).collect(),
        ArrayValue::Short(v) => v.iter().map(|x| x.as_()).collect(),
        ArrayValue::Int(v) => v.iter().map(|x| x.as_()).collect(),
        ArrayValue::Long(v) => v.iter().map(|x| x.as_()).collect(),
        ArrayValue::UByte(v) => v.iter().map(|x| x.as_()).collect(),
        ArrayValue::UShort(v) => v.iter().map(|x| x.as_()).collect(),
        ArrayValue::UInt(v) => v.iter().map(|x| x.as_()).collect(),
        ArrayValue::ULong(v) => v.iter().map(|x| x.as_()).collect(),
        ArrayValue::Float(v) => v.iter().map(|x| x.as_()).collect(),
        ArrayValue::Double(v) => v.iter().map(|x| x.as_()).collect(),
        ArrayValue::String(v) => v
            .iter()
            .map(|s| {
                s.trim()
                    .parse::<T>()
                    .map_err(|_| ConvertError::Unparseable(s.clone()))
            })
            .collect::<Result<_, _>>()?,
    })
}

fn array_to_strings(value: &ArrayValue) -> Vec<String> {
    match value {
        ArrayValue::Boolean(v) => v.iter().map(|x| x.to_string()).collect(),
        ArrayValue::Byte(v) => v.iter().map(|x| x.to_string()).collect(),
        ArrayValue::Short(v) => v.iter().map(|x| x.to_string()).collect(),
        ArrayValue::Int(v) => v.iter().map(|x| x.to_string()).collect(),
        ArrayValue::Long(v) => v.iter().map(|x| x.to_string()).collect(),
        ArrayValue::UByte(v) => v.iter().map(|x| x.to_string()).collect(),
        ArrayValue::UShort(v) => v.iter().map(|x| x.to_string()).collect(),
        ArrayValue::UInt(v) => v.iter().map(|x| x.to_string()).collect(),
        ArrayValue::ULong(v) => v.iter().map(|x| x.to_string()).collect(),
        ArrayValue::Float(v) => v.iter().map(|x| x.to_string()).collect(),
        ArrayValue::Double(v) => v.iter().map(|x| x.to_string()).collect(),
        ArrayValue::String(v) => v.clone(),
    }
}

/// Convert a whole array to the given element type
pub fn convert_array(value: &ArrayValue, to: ScalarType) -> Result<ArrayValue, ConvertError> {
    Ok(match to {
        ScalarType::Boolean => match value {
            ArrayValue::Boolean(v) => ArrayValue::Boolean(v.clone()),
            ArrayValue::String(v) => ArrayValue::Boolean(
                v.iter()
                    .map(|s| {
                        s.trim()
                            .parse::<bool>()
                            .map_err(|_| ConvertError::Unparseable(s.clone()))
                    })
                    .collect::<Result<_, _>>()?,
            ),
            _ => return Err(ConvertError::Unsupported),
        },
        ScalarType::Byte => ArrayValue::Byte(array_to_numeric::<i8>(value)?),
        ScalarType::Short => ArrayValue::Short(array_to_numeric::<i16>(value)?),
        ScalarType::Int => ArrayValue::Int(array_to_numeric::<i32>(value)?),
        ScalarType::Long => ArrayValue::Long(array_to_numeric::<i64>(value)?),
        ScalarType::UByte => ArrayValue::UByte(array_to_numeric::<u8>(value)?),
        ScalarType::UShort => ArrayValue::UShort(array_to_numeric::<u16>(value)?),
        ScalarType::UInt => ArrayValue::UInt(array_to_numeric::<u32>(value)?),
        ScalarType::ULong => ArrayValue::ULong(array_to_numeric::<u64>(value)?),
        ScalarType::Float => ArrayValue::Float(array_to_numeric::<f32>(value)?),
        ScalarType::Double => ArrayValue::Double(array_to_numeric::<f64>(value)?),
        ScalarType::String => ArrayValue::String(array_to_strings(value)),
    })
}

// --- copying ---------------------------------------------------------------

/// Copy a value tree into another, converting where the shapes allow it
///
/// Fails on incompatible shapes, with the documented exception of structure
/// targets, which take the best-effort subset copy of [`copy_structure`].
pub fn copy(from: &PVField, to: &mut PVField) -> Result<(), ConvertError> {
    match (from.type_of(), to.type_of()) {
        (Type::Scalar, Type::Scalar) => copy_scalar(from, to),
        (Type::ScalarArray, Type::ScalarArray) => copy_scalar_array(from, to),
        (Type::Structure, Type::Structure) => copy_structure(from, to),
        (Type::StructureArray, Type::StructureArray) => copy_elements(from, to),
        (Type::Union, Type::Union) => copy_union(from, to),
        (Type::UnionArray, Type::UnionArray) => copy_elements(from, to),
        _ => Err(ConvertError::Incompatible),
    }
}

pub fn copy_scalar(from: &PVField, to: &mut PVField) -> Result<(), ConvertError> {
    let source = from.get_scalar().ok_or(ConvertError::Incompatible)?;
    let target_type = to
        .get_scalar()
        .ok_or(ConvertError::Incompatible)?
        .scalar_type();
    if !is_copy_scalar_compatible(source.scalar_type(), target_type) {
        return Err(ConvertError::Incompatible);
    }
    let converted = convert_scalar(source, target_type)?;
    to.try_put_scalar(converted)?;
    Ok(())
}

pub fn copy_scalar_array(from: &PVField, to: &mut PVField) -> Result<(), ConvertError> {
    let source = from.get_array().ok_or(ConvertError::Incompatible)?;
    let target_type = to
        .get_array()
        .ok_or(ConvertError::Incompatible)?
        .element_type();
    if !is_copy_scalar_array_compatible(source.element_type(), target_type) {
        return Err(ConvertError::Incompatible);
    }
    let converted = convert_array(source, target_type)?;
    to.try_put_array(converted)?;
    Ok(())
}

/// Best-effort subset copy between structures
///
/// Each target subfield takes the value of the same-named, pairwise
/// compatible source subfield; unmatched or incompatible subfields are left
/// untouched. Never fails on shape differences alone.
pub fn copy_structure(from: &PVField, to: &mut PVField) -> Result<(), ConvertError> {
    if to.is_immutable() {
        return Err(AccessError::Immutable.into());
    }
    if from.type_of() != Type::Structure || to.type_of() != Type::Structure {
        return Err(ConvertError::Incompatible);
    }
    let names: Vec<String> = match to.field().as_ref() {
        Field::Structure(s) => s.get_field_names().to_vec(),
        _ => return Err(ConvertError::Incompatible),
    };
    for name in names {
        let Some(source) = from.get_sub_field(&name) else {
            continue;
        };
        let Some(target) = to.get_sub_field_mut(&name) else {
            continue;
        };
        if !is_copy_compatible(source.field(), target.field()) {
            continue;
        }
        copy(source, target)?;
    }
    Ok(())
}

pub fn copy_union(from: &PVField, to: &mut PVField) -> Result<(), ConvertError> {
    if to.is_immutable() {
        return Err(AccessError::Immutable.into());
    }
    if !is_copy_union_compatible(from.field(), to.field()) {
        return Err(ConvertError::Incompatible);
    }
    let source = from.union_value().ok_or(ConvertError::Incompatible)?;
    let replacement = UnionValue {
        selector: source.selector(),
        value: source.get().map(|pv| Box::new(pv.clone_detached())),
    };
    *to.value_mut() = PVValue::Union(replacement);
    Ok(())
}

/// Whole-array copy for structure and union arrays with identical schemas
fn copy_elements(from: &PVField, to: &mut PVField) -> Result<(), ConvertError> {
    if to.is_immutable() {
        return Err(AccessError::Immutable.into());
    }
    if from.field() != to.field() {
        return Err(ConvertError::Incompatible);
    }
    let elements: Vec<Option<PVField>> = from
        .array_elements()
        .ok_or(ConvertError::Incompatible)?
        .iter()
        .map(|e| e.as_ref().map(PVField::clone_detached))
        .collect();
    *to.value_mut() = match to.type_of() {
        Type::StructureArray => PVValue::StructureArray(elements),
        Type::UnionArray => PVValue::UnionArray(elements),
        _ => return Err(ConvertError::Incompatible),
    };
    Ok(())
}

// --- string exchange -------------------------------------------------------

/// Render any node as its human-readable form
///
/// Scalars render as their bare value; composites render as the indented
/// tree of the node's `Display` implementation.
pub fn get_string(pv: &PVField) -> String {
    match pv.get_scalar() {
        Some(v) => v.to_string(),
        None => pv.to_string(),
    }
}

/// Parse a string into a scalar node, converting to the node's type
pub fn from_string(pv: &mut PVField, value: &str) -> Result<(), ConvertError> {
    let target_type = pv
        .get_scalar()
        .ok_or(ConvertError::Incompatible)?
        .scalar_type();
    let converted = convert_scalar(&ScalarValue::String(value.to_string()), target_type)?;
    pv.try_put_scalar(converted)?;
    Ok(())
}

/// Parse strings element-wise into a scalar array node
pub fn from_string_array(pv: &mut PVField, values: &[String]) -> Result<(), ConvertError> {
    let target_type = pv
        .get_array()
        .ok_or(ConvertError::Incompatible)?
        .element_type();
    let converted = convert_array(&ArrayValue::String(values.to_vec()), target_type)?;
    pv.try_put_array(converted)?;
    Ok(())
}

// --- typed numeric exchange ------------------------------------------------

/// Read or write a scalar node through a fixed primitive type, converting
/// to or from the node's own scalar type on the way
macro_rules! impl_numeric_exchange {
    ($to:ident, $from:ident, $typ:ty) => {
        pub fn $to(pv: &PVField) -> Result<$typ, ConvertError> {
            let source = pv.get_scalar().ok_or(ConvertError::Incompatible)?;
            to_numeric::<$typ>(source)
        }

        pub fn $from(pv: &mut PVField, value: $typ) -> Result<(), ConvertError> {
            let target_type = pv
                .get_scalar()
                .ok_or(ConvertError::Incompatible)?
                .scalar_type();
            let converted = convert_scalar(&ScalarValue::from(value), target_type)?;
            pv.try_put_scalar(converted)?;
            Ok(())
        }
    };
}
impl_numeric_exchange!(to_byte, from_byte, i8);
impl_numeric_exchange!(to_short, from_short, i16);
impl_numeric_exchange!(to_int, from_int, i32);
impl_numeric_exchange!(to_long, from_long, i64);
impl_numeric_exchange!(to_ubyte, from_ubyte, u8);
impl_numeric_exchange!(to_ushort, from_ushort, u16);
impl_numeric_exchange!(to_uint, from_uint, u32);
impl_numeric_exchange!(to_ulong, from_ulong, u64);
impl_numeric_exchange!(to_float, from_float, f32);
impl_numeric_exchange!(to_double, from_double, f64);
