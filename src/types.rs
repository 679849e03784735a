//! Introspection descriptors for process-variable data.
//!
//! Every value exchanged through this crate is described by an immutable
//! [`Field`] tree built from two closed taxonomies: [`ScalarType`] enumerates
//! the twelve leaf encodings (eight integer widths including unsigned
//! variants, two floating point widths, boolean and string), and [`Type`]
//! enumerates the six container kinds a [`Field`] node can take.
//!
//! A [`Structure`] is an ordered list of uniquely named child fields; the
//! order is load-bearing, because it determines both the wire layout and the
//! pre-order offset every runtime value gets inside its top-level structure.
//! A [`Union`] is the same shape plus a discriminator: at most one member is
//! active at a time. A *variant* union has no fixed member list at all and
//! accepts any field type per value.
//!
//! `Field` trees compare structurally: two independently built descriptors
//! are equal (and hash alike) whenever their recursive shape matches. That
//! property is what the copy/convert engine in [`crate::convert`] and the
//! schema cache in [`crate::serialize`] key on.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use crate::builder::BuildError;

/// Shared handle to an immutable field descriptor.
pub type FieldRef = Arc<Field>;

pub const DEFAULT_STRUCTURE_ID: &str = "structure";
pub const DEFAULT_UNION_ID: &str = "union";
pub const VARIANT_UNION_ID: &str = "any";

/// Leaf data encodings.
///
/// Unsigned widths are distinct tags, not a flag on the signed ones;
/// converting between the signed and unsigned form of the same width
/// reinterprets the two's-complement bit pattern.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Boolean = 0,
    Byte = 1,
    Short = 2,
    Int = 3,
    Long = 4,
    UByte = 5,
    UShort = 6,
    UInt = 7,
    ULong = 8,
    Float = 9,
    Double = 10,
    String = 11,
}

impl TryFrom<u8> for ScalarType {
    type Error = ();
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::Boolean as u8 => Ok(Self::Boolean),
            x if x == Self::Byte as u8 => Ok(Self::Byte),
            x if x == Self::Short as u8 => Ok(Self::Short),
            x if x == Self::Int as u8 => Ok(Self::Int),
            x if x == Self::Long as u8 => Ok(Self::Long),
            x if x == Self::UByte as u8 => Ok(Self::UByte),
            x if x == Self::UShort as u8 => Ok(Self::UShort),
            x if x == Self::UInt as u8 => Ok(Self::UInt),
            x if x == Self::ULong as u8 => Ok(Self::ULong),
            x if x == Self::Float as u8 => Ok(Self::Float),
            x if x == Self::Double as u8 => Ok(Self::Double),
            x if x == Self::String as u8 => Ok(Self::String),
            _ => Err(()),
        }
    }
}

impl ScalarType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::UByte => "ubyte",
            Self::UShort => "ushort",
            Self::UInt => "uint",
            Self::ULong => "ulong",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
        }
    }

    /// True for every type a lossy numeric conversion is defined between
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::Boolean | Self::String)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::Byte
                | Self::Short
                | Self::Int
                | Self::Long
                | Self::UByte
                | Self::UShort
                | Self::UInt
                | Self::ULong
        )
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, Self::UByte | Self::UShort | Self::UInt | Self::ULong)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// Width in bytes of the wire representation, where fixed
    pub fn wire_size(&self) -> Option<usize> {
        match self {
            Self::Boolean | Self::Byte | Self::UByte => Some(1),
            Self::Short | Self::UShort => Some(2),
            Self::Int | Self::UInt | Self::Float => Some(4),
            Self::Long | Self::ULong | Self::Double => Some(8),
            Self::String => None,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScalarType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boolean" => Ok(Self::Boolean),
            "byte" => Ok(Self::Byte),
            "short" => Ok(Self::Short),
            "int" => Ok(Self::Int),
            "long" => Ok(Self::Long),
            "ubyte" => Ok(Self::UByte),
            "ushort" => Ok(Self::UShort),
            "uint" => Ok(Self::UInt),
            "ulong" => Ok(Self::ULong),
            "float" => Ok(Self::Float),
            "double" => Ok(Self::Double),
            "string" => Ok(Self::String),
            _ => Err(()),
        }
    }
}

/// Container kinds a [`Field`] node can take
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Scalar = 0,
    ScalarArray = 1,
    Structure = 2,
    StructureArray = 3,
    Union = 4,
    UnionArray = 5,
}

impl TryFrom<u8> for Type {
    type Error = ();
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::Scalar as u8 => Ok(Self::Scalar),
            x if x == Self::ScalarArray as u8 => Ok(Self::ScalarArray),
            x if x == Self::Structure as u8 => Ok(Self::Structure),
            x if x == Self::StructureArray as u8 => Ok(Self::StructureArray),
            x if x == Self::Union as u8 => Ok(Self::Union),
            x if x == Self::UnionArray as u8 => Ok(Self::UnionArray),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scalar => "scalar",
            Self::ScalarArray => "scalarArray",
            Self::Structure => "structure",
            Self::StructureArray => "structureArray",
            Self::Union => "union",
            Self::UnionArray => "unionArray",
        })
    }
}

/// Immutable schema descriptor for one node of a value tree
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Scalar {
        scalar_type: ScalarType,
    },
    /// A string scalar whose values may not exceed a fixed length
    BoundedString {
        max_length: usize,
    },
    ScalarArray {
        element_type: ScalarType,
    },
    Structure(Structure),
    StructureArray(Arc<Structure>),
    Union(Union),
    UnionArray(Arc<Union>),
}

impl Field {
    pub fn get_type(&self) -> Type {
        match self {
            Field::Scalar { .. } | Field::BoundedString { .. } => Type::Scalar,
            Field::ScalarArray { .. } => Type::ScalarArray,
            Field::Structure(_) => Type::Structure,
            Field::StructureArray(_) => Type::StructureArray,
            Field::Union(_) => Type::Union,
            Field::UnionArray(_) => Type::UnionArray,
        }
    }

    /// The identification string of this descriptor
    ///
    /// Scalar and array kinds identify as their type name; structures and
    /// unions carry the id they were built with.
    pub fn id(&self) -> String {
        match self {
            Field::Scalar { scalar_type } => scalar_type.name().to_string(),
            Field::BoundedString { max_length } => format!("string({max_length})"),
            Field::ScalarArray { element_type } => format!("{}[]", element_type.name()),
            Field::Structure(s) => s.id().to_string(),
            Field::StructureArray(s) => format!("{}[]", s.id()),
            Field::Union(u) => u.id().to_string(),
            Field::UnionArray(u) => format!("{}[]", u.id()),
        }
    }

    /// Scalar type of this node, if it is a scalar or scalar array
    pub fn scalar_type(&self) -> Option<ScalarType> {
        match self {
            Field::Scalar { scalar_type } => Some(*scalar_type),
            Field::BoundedString { .. } => Some(ScalarType::String),
            Field::ScalarArray { element_type } => Some(*element_type),
            _ => None,
        }
    }

    fn fmt_indented(&self, out: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        match self {
            Field::Structure(s) => {
                writeln!(out, "{}", s.id())?;
                for (name, field) in s.members() {
                    write!(out, "{:indent$}", "", indent = (indent + 1) * 4)?;
                    match field.get_type() {
                        Type::Structure | Type::Union => {
                            write!(out, "{name} ")?;
                            field.fmt_indented(out, indent + 1)?;
                        }
                        _ => writeln!(out, "{} {name}", field.id())?,
                    }
                }
                Ok(())
            }
            Field::Union(u) => {
                writeln!(out, "{}", u.id())?;
                for (name, field) in u.members() {
                    write!(out, "{:indent$}", "", indent = (indent + 1) * 4)?;
                    match field.get_type() {
                        Type::Structure | Type::Union => {
                            write!(out, "{name} ")?;
                            field.fmt_indented(out, indent + 1)?;
                        }
                        _ => writeln!(out, "{} {name}", field.id())?,
                    }
                }
                Ok(())
            }
            other => writeln!(out, "{}", other.id()),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

/// Ordered, uniquely named collection of child fields
///
/// Name lookup is O(1); iteration order is exactly build order.
#[derive(Debug, Clone)]
pub struct Structure {
    id: String,
    names: Vec<String>,
    fields: Vec<FieldRef>,
    index: HashMap<String, usize>,
}

impl Structure {
    pub fn new(
        id: impl Into<String>,
        members: Vec<(String, FieldRef)>,
    ) -> Result<Self, BuildError> {
        let id = id.into();
        let id = if id.is_empty() {
            DEFAULT_STRUCTURE_ID.to_string()
        } else {
            id
        };
        let mut names = Vec::with_capacity(members.len());
        let mut fields = Vec::with_capacity(members.len());
        let mut index = HashMap::with_capacity(members.len());
        for (name, field) in members {
            if index.insert(name.clone(), names.len()).is_some() {
                return Err(BuildError::DuplicateField(name));
            }
            names.push(name);
            fields.push(field);
        }
        Ok(Structure {
            id,
            names,
            fields,
            index,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldRef> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn get_field_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn get_fields(&self) -> &[FieldRef] {
        &self.fields
    }

    pub fn get_field_names(&self) -> &[String] {
        &self.names
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &FieldRef)> {
        self.names.iter().map(String::as_str).zip(self.fields.iter())
    }

    pub fn into_field(self) -> FieldRef {
        Arc::new(Field::Structure(self))
    }
}

impl PartialEq for Structure {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.names == other.names && self.fields == other.fields
    }
}
impl Eq for Structure {}

impl std::hash::Hash for Structure {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.names.hash(state);
        self.fields.hash(state);
    }
}

/// Discriminated collection of child fields, at most one active per value
#[derive(Debug, Clone)]
pub struct Union {
    id: String,
    names: Vec<String>,
    fields: Vec<FieldRef>,
    index: HashMap<String, usize>,
    variant: bool,
}

impl Union {
    pub fn new(id: impl Into<String>, members: Vec<(String, FieldRef)>) -> Result<Self, BuildError> {
        let id = id.into();
        let id = if id.is_empty() {
            DEFAULT_UNION_ID.to_string()
        } else {
            id
        };
        let mut names = Vec::with_capacity(members.len());
        let mut fields = Vec::with_capacity(members.len());
        let mut index = HashMap::with_capacity(members.len());
        for (name, field) in members {
            if index.insert(name.clone(), names.len()).is_some() {
                return Err(BuildError::DuplicateField(name));
            }
            names.push(name);
            fields.push(field);
        }
        Ok(Union {
            id,
            names,
            fields,
            index,
            variant: false,
        })
    }

    /// The "any" union: no fixed member list, each value picks its own type
    pub fn variant() -> Self {
        Union {
            id: VARIANT_UNION_ID.to_string(),
            names: Vec::new(),
            fields: Vec::new(),
            index: HashMap::new(),
            variant: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_variant(&self) -> bool {
        self.variant
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldRef> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn get_field_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn get_fields(&self) -> &[FieldRef] {
        &self.fields
    }

    pub fn get_field_names(&self) -> &[String] {
        &self.names
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &FieldRef)> {
        self.names.iter().map(String::as_str).zip(self.fields.iter())
    }

    pub fn into_field(self) -> FieldRef {
        Arc::new(Field::Union(self))
    }
}

impl PartialEq for Union {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.variant == other.variant
            && self.names == other.names
            && self.fields == other.fields
    }
}
impl Eq for Union {}

impl std::hash::Hash for Union {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.names.hash(state);
        self.fields.hash(state);
        self.variant.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(st: ScalarType) -> FieldRef {
        Arc::new(Field::Scalar { scalar_type: st })
    }

    #[test]
    fn scalar_type_tags_roundtrip() {
        for tag in 0u8..12 {
            let st = ScalarType::try_from(tag).unwrap();
            assert_eq!(st as u8, tag);
            assert_eq!(st.name().parse::<ScalarType>().unwrap(), st);
        }
        assert!(ScalarType::try_from(12).is_err());
        assert!("flaot".parse::<ScalarType>().is_err());
    }

    #[test]
    fn scalar_type_predicates() {
        assert!(ScalarType::UInt.is_numeric());
        assert!(ScalarType::UInt.is_integer());
        assert!(ScalarType::UInt.is_unsigned());
        assert!(!ScalarType::Int.is_unsigned());
        assert!(ScalarType::Double.is_float());
        assert!(!ScalarType::Boolean.is_numeric());
        assert!(!ScalarType::String.is_numeric());
        assert_eq!(ScalarType::Double.wire_size(), Some(8));
        assert_eq!(ScalarType::String.wire_size(), None);
    }

    #[test]
    fn structure_lookup_preserves_order() {
        let s = Structure::new(
            "point",
            vec![
                ("x".to_string(), scalar(ScalarType::Double)),
                ("y".to_string(), scalar(ScalarType::Double)),
                ("label".to_string(), scalar(ScalarType::String)),
            ],
        )
        .unwrap();
        assert_eq!(s.get_field_names(), ["x", "y", "label"]);
        assert_eq!(s.get_field_index("label"), Some(2));
        assert!(s.get_field("z").is_none());
        assert_eq!(
            s.get_field("x"),
            Some(&scalar(ScalarType::Double))
        );
    }

    #[test]
    fn structure_rejects_duplicate_names() {
        let err = Structure::new(
            "s",
            vec![
                ("a".to_string(), scalar(ScalarType::Int)),
                ("a".to_string(), scalar(ScalarType::Double)),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::DuplicateField(name) if name == "a"));
    }

    #[test]
    fn structural_equality_ignores_provenance() {
        let build = || {
            Structure::new(
                "s",
                vec![
                    ("a".to_string(), scalar(ScalarType::Int)),
                    (
                        "inner".to_string(),
                        Structure::new(
                            "inner",
                            vec![("b".to_string(), scalar(ScalarType::String))],
                        )
                        .unwrap()
                        .into_field(),
                    ),
                ],
            )
            .unwrap()
        };
        assert_eq!(build(), build());
        let different = Structure::new("s", vec![("a".to_string(), scalar(ScalarType::Long))]);
        assert_ne!(build(), different.unwrap());
    }

    #[test]
    fn variant_union_has_no_members() {
        let u = Union::variant();
        assert!(u.is_variant());
        assert!(u.is_empty());
        assert_eq!(u.id(), VARIANT_UNION_ID);
        let named = Union::new("choice", vec![("i".to_string(), scalar(ScalarType::Int))]).unwrap();
        assert!(!named.is_variant());
        assert_eq!(named.len(), 1);
    }

    #[test]
    fn field_ids() {
        assert_eq!(scalar(ScalarType::Double).id(), "double");
        assert_eq!(
            Field::ScalarArray {
                element_type: ScalarType::UByte
            }
            .id(),
            "ubyte[]"
        );
        assert_eq!(Field::BoundedString { max_length: 16 }.id(), "string(16)");
        let s = Structure::new("epics:nt/NTScalar:1.0", vec![]).unwrap();
        assert_eq!(Field::Structure(s).id(), "epics:nt/NTScalar:1.0");
    }

    #[test]
    fn display_renders_nested_tree() {
        let inner = Structure::new("alarm_t", vec![("severity".to_string(), scalar(ScalarType::Int))])
            .unwrap();
        let s = Structure::new(
            "record",
            vec![
                ("value".to_string(), scalar(ScalarType::Double)),
                ("alarm".to_string(), inner.into_field()),
            ],
        )
        .unwrap();
        let rendered = format!("{}", Field::Structure(s));
        assert!(rendered.contains("record"));
        assert!(rendered.contains("double value"));
        assert!(rendered.contains("alarm alarm_t"));
        assert!(rendered.contains("int severity"));
    }
}
