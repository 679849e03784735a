//! Runtime value trees shadowing [`Field`] descriptors.
//!
//! A [`PVField`] node pairs a shared [`FieldRef`] descriptor with a mutable
//! payload. Creating a tree from a descriptor initializes every leaf to its
//! default (zero, empty, unselected) and assigns each node its *offset*: the
//! pre-order position inside the enclosing top-level structure. Offsets are
//! contiguous and unique across the whole tree, which is what lets a change
//! mask address any field at any depth with a single bit; see
//! [`crate::bitset`] and the partial serialization in [`crate::serialize`].
//!
//! Only structure nodes span more than one offset: for every other node
//! `next_offset() == offset() + 1`, while a structure covers itself plus all
//! of its descendants.
//!
//! Mutation happens through typed accessors. The infallible `put_*` scalar
//! setters deliberately log and leave the value untouched when the node is
//! immutable or the type does not match, matching how producers in control
//! systems are expected to shrug off late writes; every structural mutator
//! and the `try_*` variants report [`AccessError`] instead. Immutability is
//! one way: after [`PVField::set_immutable`] the whole subtree is permanently
//! read only.

use std::{collections::BTreeMap, fmt, sync::Arc};

use thiserror::Error;
use tracing::warn;

use crate::types::{Field, FieldRef, ScalarType, Structure, Type};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AccessError {
    #[error("field is immutable")]
    Immutable,
    #[error("operation does not apply to this field type")]
    TypeMismatch,
    #[error("offset or count out of range")]
    OutOfBounds,
    #[error("no such field: {0}")]
    NoSuchField(String),
    #[error("field name already present: {0}")]
    DuplicateField(String),
    #[error("string of {length} characters exceeds bound of {max}")]
    StringTooLong { length: usize, max: usize },
    #[error("element does not match the array's schema")]
    IncompatibleElement,
}

/// A single scalar value, one variant per [`ScalarType`]
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarValue {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    UByte(u8),
    UShort(u16),
    UInt(u32),
    ULong(u64),
    Float(f32),
    Double(f64),
    String(String),
}

impl ScalarValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarValue::Boolean(_) => ScalarType::Boolean,
            ScalarValue::Byte(_) => ScalarType::Byte,
            ScalarValue::Short(_) => ScalarType::Short,
            ScalarValue::Int(_) => ScalarType::Int,
            ScalarValue::Long(_) => ScalarType::Long,
            ScalarValue::UByte(_) => ScalarType::UByte,
            ScalarValue::UShort(_) => ScalarType::UShort,
            ScalarValue::UInt(_) => ScalarType::UInt,
            ScalarValue::ULong(_) => ScalarType::ULong,
            ScalarValue::Float(_) => ScalarType::Float,
            ScalarValue::Double(_) => ScalarType::Double,
            ScalarValue::String(_) => ScalarType::String,
        }
    }

    pub fn default_for(scalar_type: ScalarType) -> ScalarValue {
        match scalar_type {
            ScalarType::Boolean => ScalarValue::Boolean(false),
            ScalarType::Byte => ScalarValue::Byte(0),
            ScalarType::Short => ScalarValue::Short(0),
            ScalarType::Int => ScalarValue::Int(0),
            ScalarType::Long => ScalarValue::Long(0),
            ScalarType::UByte => ScalarValue::UByte(0),
            ScalarType::UShort => ScalarValue::UShort(0),
            ScalarType::UInt => ScalarValue::UInt(0),
            ScalarType::ULong => ScalarValue::ULong(0),
            ScalarType::Float => ScalarValue::Float(0.0),
            ScalarType::Double => ScalarValue::Double(0.0),
            ScalarType::String => ScalarValue::String(String::new()),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Boolean(v) => write!(f, "{v}"),
            ScalarValue::Byte(v) => write!(f, "{v}"),
            ScalarValue::Short(v) => write!(f, "{v}"),
            ScalarValue::Int(v) => write!(f, "{v}"),
            ScalarValue::Long(v) => write!(f, "{v}"),
            ScalarValue::UByte(v) => write!(f, "{v}"),
            ScalarValue::UShort(v) => write!(f, "{v}"),
            ScalarValue::UInt(v) => write!(f, "{v}"),
            ScalarValue::ULong(v) => write!(f, "{v}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::Double(v) => write!(f, "{v}"),
            ScalarValue::String(v) => write!(f, "{v}"),
        }
    }
}

/// Implement From<primitive> for the matching ScalarValue variant
macro_rules! impl_scalarvalue_from {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for ScalarValue {
            fn from(value: $typ) -> Self {
                ScalarValue::$variant(value)
            }
        }
    };
}
impl_scalarvalue_from!(Boolean, bool);
impl_scalarvalue_from!(Byte, i8);
impl_scalarvalue_from!(Short, i16);
impl_scalarvalue_from!(Int, i32);
impl_scalarvalue_from!(Long, i64);
impl_scalarvalue_from!(UByte, u8);
impl_scalarvalue_from!(UShort, u16);
impl_scalarvalue_from!(UInt, u32);
impl_scalarvalue_from!(ULong, u64);
impl_scalarvalue_from!(Float, f32);
impl_scalarvalue_from!(Double, f64);
impl_scalarvalue_from!(String, String);

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::String(value.to_string())
    }
}

/// A homogeneous array of scalar values, one variant per element type
#[derive(Clone, Debug, PartialEq)]
pub enum ArrayValue {
    Boolean(Vec<bool>),
    Byte(Vec<i8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    UByte(Vec<u8>),
    UShort(Vec<u16>),
    UInt(Vec<u32>),
    ULong(Vec<u64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    String(Vec<String>),
}

impl ArrayValue {
    pub fn element_type(&self) -> ScalarType {
        match self {
            ArrayValue::Boolean(_) => ScalarType::Boolean,
            ArrayValue::Byte(_) => ScalarType::Byte,
            ArrayValue::Short(_) => ScalarType::Short,
            ArrayValue::Int(_) => ScalarType::Int,
            ArrayValue::Long(_) => ScalarType::Long,
            ArrayValue::UByte(_) => ScalarType::UByte,
            ArrayValue::UShort(_) => ScalarType::UShort,
            ArrayValue::UInt(_) => ScalarType::UInt,
            ArrayValue::ULong(_) => ScalarType::ULong,
            ArrayValue::Float(_) => ScalarType::Float,
            ArrayValue::Double(_) => ScalarType::Double,
            ArrayValue::String(_) => ScalarType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayValue::Boolean(v) => v.len(),
            ArrayValue::Byte(v) => v.len(),
            ArrayValue::Short(v) => v.len(),
            ArrayValue::Int(v) => v.len(),
            ArrayValue::Long(v) => v.len(),
            ArrayValue::UByte(v) => v.len(),
            ArrayValue::UShort(v) => v.len(),
            ArrayValue::UInt(v) => v.len(),
            ArrayValue::ULong(v) => v.len(),
            ArrayValue::Float(v) => v.len(),
            ArrayValue::Double(v) => v.len(),
            ArrayValue::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn empty_for(element_type: ScalarType) -> ArrayValue {
        match element_type {
            ScalarType::Boolean => ArrayValue::Boolean(Vec::new()),
            ScalarType::Byte => ArrayValue::Byte(Vec::new()),
            ScalarType::Short => ArrayValue::Short(Vec::new()),
            ScalarType::Int => ArrayValue::Int(Vec::new()),
            ScalarType::Long => ArrayValue::Long(Vec::new()),
            ScalarType::UByte => ArrayValue::UByte(Vec::new()),
            ScalarType::UShort => ArrayValue::UShort(Vec::new()),
            ScalarType::UInt => ArrayValue::UInt(Vec::new()),
            ScalarType::ULong => ArrayValue::ULong(Vec::new()),
            ScalarType::Float => ArrayValue::Float(Vec::new()),
            ScalarType::Double => ArrayValue::Double(Vec::new()),
            ScalarType::String => ArrayValue::String(Vec::new()),
        }
    }
}

/// Implement From<Vec<primitive>> for the matching ArrayValue variant
macro_rules! impl_arrayvalue_from {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for ArrayValue {
            fn from(value: Vec<$typ>) -> Self {
                ArrayValue::$variant(value)
            }
        }
    };
}
impl_arrayvalue_from!(Boolean, bool);
impl_arrayvalue_from!(Byte, i8);
impl_arrayvalue_from!(Short, i16);
impl_arrayvalue_from!(Int, i32);
impl_arrayvalue_from!(Long, i64);
impl_arrayvalue_from!(UByte, u8);
impl_arrayvalue_from!(UShort, u16);
impl_arrayvalue_from!(UInt, u32);
impl_arrayvalue_from!(ULong, u64);
impl_arrayvalue_from!(Float, f32);
impl_arrayvalue_from!(Double, f64);
impl_arrayvalue_from!(String, String);

/// The active member of a union value, if one has been selected
#[derive(Clone, Debug, PartialEq, Default)]
pub struct UnionValue {
    pub(crate) selector: Option<usize>,
    pub(crate) value: Option<Box<PVField>>,
}

impl UnionValue {
    pub fn selector(&self) -> Option<usize> {
        self.selector
    }

    pub fn get(&self) -> Option<&PVField> {
        self.value.as_deref()
    }
}

/// Payload of a [`PVField`] node
#[derive(Clone, Debug, PartialEq)]
pub enum PVValue {
    Scalar(ScalarValue),
    ScalarArray(ArrayValue),
    Structure(Vec<PVField>),
    /// Elements are nullable; each present element is a standalone
    /// structure value with its own offsets
    StructureArray(Vec<Option<PVField>>),
    Union(UnionValue),
    UnionArray(Vec<Option<PVField>>),
}

/// Mutable runtime value node shadowing a [`Field`] descriptor
#[derive(Clone, Debug)]
pub struct PVField {
    field: FieldRef,
    offset: usize,
    next_offset: usize,
    immutable: bool,
    aux_info: BTreeMap<String, ScalarValue>,
    value: PVValue,
}

impl PartialEq for PVField {
    /// Descriptor and value equality; offsets and aux info are positional
    /// bookkeeping and do not affect it
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field && self.value == other.value
    }
}

impl PVField {
    /// Build a default-initialized value tree for a descriptor
    pub fn new(field: FieldRef) -> PVField {
        let value = default_value(&field);
        let mut pv = PVField {
            field,
            offset: 0,
            next_offset: 0,
            immutable: false,
            aux_info: BTreeMap::new(),
            value,
        };
        pv.assign_offsets(0);
        pv
    }

    pub fn field(&self) -> &FieldRef {
        &self.field
    }

    pub fn type_of(&self) -> Type {
        self.field.get_type()
    }

    /// Pre-order position of this node within its top-level structure
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Offset one past this node's subtree
    pub fn next_offset(&self) -> usize {
        self.next_offset
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    pub fn value(&self) -> &PVValue {
        &self.value
    }

    /// Permanently mark this node and every descendant read only
    pub fn set_immutable(&mut self) {
        self.immutable = true;
        match &mut self.value {
            PVValue::Structure(children) => {
                for child in children {
                    child.set_immutable();
                }
            }
            PVValue::StructureArray(elements) | PVValue::UnionArray(elements) => {
                for element in elements.iter_mut().flatten() {
                    element.set_immutable();
                }
            }
            PVValue::Union(u) => {
                if let Some(value) = u.value.as_deref_mut() {
                    value.set_immutable();
                }
            }
            PVValue::Scalar(_) | PVValue::ScalarArray(_) => {}
        }
    }

    /// Recompute offsets treating this node as a new top-level root
    ///
    /// Needed after lifting a cloned subtree out of its original tree.
    pub fn detach(&mut self) {
        self.assign_offsets(0);
    }

    /// Deep copy of values and aux info, detached from this tree
    ///
    /// The clone is mutable regardless of the source's immutability, and its
    /// offsets are recomputed as a standalone root.
    pub fn clone_detached(&self) -> PVField {
        let mut copy = self.clone();
        copy.clear_immutable();
        copy.assign_offsets(0);
        copy
    }

    fn clear_immutable(&mut self) {
        self.immutable = false;
        match &mut self.value {
            PVValue::Structure(children) => {
                for child in children {
                    child.clear_immutable();
                }
            }
            PVValue::StructureArray(elements) | PVValue::UnionArray(elements) => {
                for element in elements.iter_mut().flatten() {
                    element.clear_immutable();
                }
            }
            PVValue::Union(u) => {
                if let Some(value) = u.value.as_deref_mut() {
                    value.clear_immutable();
                }
            }
            PVValue::Scalar(_) | PVValue::ScalarArray(_) => {}
        }
    }

    pub(crate) fn assign_offsets(&mut self, start: usize) -> usize {
        self.offset = start;
        self.next_offset = match &mut self.value {
            PVValue::Structure(children) => {
                let mut next = start + 1;
                for child in children {
                    next = child.assign_offsets(next);
                }
                next
            }
            _ => start + 1,
        };
        self.next_offset
    }

    // --- auxiliary metadata ------------------------------------------------

    pub fn get_aux_info(&self, key: &str) -> Option<&ScalarValue> {
        self.aux_info.get(key)
    }

    pub fn aux_info(&self) -> &BTreeMap<String, ScalarValue> {
        &self.aux_info
    }

    pub fn put_aux_info(
        &mut self,
        key: impl Into<String>,
        value: impl Into<ScalarValue>,
    ) -> Result<(), AccessError> {
        if self.immutable {
            return Err(AccessError::Immutable);
        }
        self.aux_info.insert(key.into(), value.into());
        Ok(())
    }

    // --- scalar access -----------------------------------------------------

    pub fn get_scalar(&self) -> Option<&ScalarValue> {
        match &self.value {
            PVValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Replace this scalar's value; the variant must match exactly
    pub fn try_put_scalar(&mut self, value: ScalarValue) -> Result<(), AccessError> {
        if self.immutable {
            return Err(AccessError::Immutable);
        }
        let PVValue::Scalar(current) = &mut self.value else {
            return Err(AccessError::TypeMismatch);
        };
        if current.scalar_type() != value.scalar_type() {
            return Err(AccessError::TypeMismatch);
        }
        if let (Field::BoundedString { max_length }, ScalarValue::String(s)) =
            (self.field.as_ref(), &value)
        {
            let length = s.chars().count();
            if length > *max_length {
                return Err(AccessError::StringTooLong {
                    length,
                    max: *max_length,
                });
            }
        }
        *current = value;
        Ok(())
    }

    // --- array access ------------------------------------------------------

    pub fn get_array(&self) -> Option<&ArrayValue> {
        match &self.value {
            PVValue::ScalarArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn array_len(&self) -> Option<usize> {
        match &self.value {
            PVValue::ScalarArray(v) => Some(v.len()),
            PVValue::StructureArray(v) | PVValue::UnionArray(v) => Some(v.len()),
            _ => None,
        }
    }

    /// Replace the whole array; the element type must match exactly
    pub fn try_put_array(&mut self, value: ArrayValue) -> Result<(), AccessError> {
        if self.immutable {
            return Err(AccessError::Immutable);
        }
        let PVValue::ScalarArray(current) = &mut self.value else {
            return Err(AccessError::TypeMismatch);
        };
        if current.element_type() != value.element_type() {
            return Err(AccessError::TypeMismatch);
        }
        *current = value;
        Ok(())
    }

    pub(crate) fn value_mut(&mut self) -> &mut PVValue {
        &mut self.value
    }

    // --- structure access --------------------------------------------------

    pub fn get_sub_field(&self, name: &str) -> Option<&PVField> {
        let PVValue::Structure(children) = &self.value else {
            return None;
        };
        let Field::Structure(s) = self.field.as_ref() else {
            return None;
        };
        s.get_field_index(name).map(|i| &children[i])
    }

    pub fn get_sub_field_mut(&mut self, name: &str) -> Option<&mut PVField> {
        let Field::Structure(s) = self.field.as_ref() else {
            return None;
        };
        let index = s.get_field_index(name)?;
        let PVValue::Structure(children) = &mut self.value else {
            return None;
        };
        Some(&mut children[index])
    }

    /// Look up a nested field by a dotted path such as `"alarm.severity"`
    pub fn get_sub_field_path(&self, path: &str) -> Option<&PVField> {
        let mut node = self;
        for part in path.split('.') {
            node = node.get_sub_field(part)?;
        }
        Some(node)
    }

    pub fn get_sub_field_path_mut(&mut self, path: &str) -> Option<&mut PVField> {
        let mut node = self;
        for part in path.split('.') {
            node = node.get_sub_field_mut(part)?;
        }
        Some(node)
    }

    /// Find the node with the given global offset within this subtree
    pub fn get_sub_field_at(&self, offset: usize) -> Option<&PVField> {
        if offset == self.offset {
            return Some(self);
        }
        if offset < self.offset || offset >= self.next_offset {
            return None;
        }
        let PVValue::Structure(children) = &self.value else {
            return None;
        };
        children
            .iter()
            .find(|c| offset < c.next_offset)
            .and_then(|c| c.get_sub_field_at(offset))
    }

    /// All nodes of this subtree in pre-order, i.e. ascending offset
    pub fn flatten(&self) -> Vec<&PVField> {
        let mut out = Vec::with_capacity(self.next_offset - self.offset);
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a PVField>) {
        out.push(self);
        if let PVValue::Structure(children) = &self.value {
            for child in children {
                child.collect(out);
            }
        }
    }

    pub fn children(&self) -> Option<&[PVField]> {
        match &self.value {
            PVValue::Structure(children) => Some(children),
            _ => None,
        }
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut [PVField]> {
        match &mut self.value {
            PVValue::Structure(children) => Some(children),
            _ => None,
        }
    }

    /// Append a field to a top-level structure, rebuilding its descriptor
    ///
    /// Only the root of a tree can grow: offsets of every node in the tree
    /// are recomputed, and nothing outside the tree refers to them.
    pub fn append(&mut self, name: &str, child: PVField) -> Result<(), AccessError> {
        if self.immutable {
            return Err(AccessError::Immutable);
        }
        if self.offset != 0 {
            return Err(AccessError::TypeMismatch);
        }
        let Field::Structure(s) = self.field.as_ref() else {
            return Err(AccessError::TypeMismatch);
        };
        if s.get_field(name).is_some() {
            return Err(AccessError::DuplicateField(name.to_string()));
        }
        let mut members: Vec<(String, FieldRef)> = s
            .get_field_names()
            .iter()
            .cloned()
            .zip(s.get_fields().iter().cloned())
            .collect();
        members.push((name.to_string(), child.field.clone()));
        let rebuilt = Structure::new(s.id(), members)
            .map_err(|_| AccessError::DuplicateField(name.to_string()))?;
        self.field = Arc::new(Field::Structure(rebuilt));
        let PVValue::Structure(children) = &mut self.value else {
            return Err(AccessError::TypeMismatch);
        };
        children.push(child);
        self.assign_offsets(0);
        Ok(())
    }

    /// Remove a named field from a top-level structure
    pub fn remove(&mut self, name: &str) -> Result<PVField, AccessError> {
        if self.immutable {
            return Err(AccessError::Immutable);
        }
        if self.offset != 0 {
            return Err(AccessError::TypeMismatch);
        }
        let Field::Structure(s) = self.field.as_ref() else {
            return Err(AccessError::TypeMismatch);
        };
        let index = s
            .get_field_index(name)
            .ok_or_else(|| AccessError::NoSuchField(name.to_string()))?;
        let members: Vec<(String, FieldRef)> = s
            .members()
            .filter(|(n, _)| *n != name)
            .map(|(n, f)| (n.to_string(), f.clone()))
            .collect();
        let rebuilt =
            Structure::new(s.id(), members).map_err(|_| AccessError::NoSuchField(name.to_string()))?;
        self.field = Arc::new(Field::Structure(rebuilt));
        let PVValue::Structure(children) = &mut self.value else {
            return Err(AccessError::TypeMismatch);
        };
        let mut removed = children.remove(index);
        removed.detach();
        self.assign_offsets(0);
        Ok(removed)
    }

    // --- union access ------------------------------------------------------

    pub fn union_value(&self) -> Option<&UnionValue> {
        match &self.value {
            PVValue::Union(u) => Some(u),
            _ => None,
        }
    }

    /// Select a member of a non-variant union, initializing it to defaults
    pub fn select(&mut self, index: usize) -> Result<&mut PVField, AccessError> {
        if self.immutable {
            return Err(AccessError::Immutable);
        }
        let Field::Union(u) = self.field.as_ref() else {
            return Err(AccessError::TypeMismatch);
        };
        if u.is_variant() {
            return Err(AccessError::TypeMismatch);
        }
        let member = u.get_fields().get(index).ok_or(AccessError::OutOfBounds)?;
        let fresh = PVField::new(member.clone());
        let PVValue::Union(value) = &mut self.value else {
            return Err(AccessError::TypeMismatch);
        };
        value.selector = Some(index);
        value.value = Some(Box::new(fresh));
        Ok(value
            .value
            .as_deref_mut()
            .expect("selected value just stored"))
    }

    pub fn select_by_name(&mut self, name: &str) -> Result<&mut PVField, AccessError> {
        let Field::Union(u) = self.field.as_ref() else {
            return Err(AccessError::TypeMismatch);
        };
        let index = u
            .get_field_index(name)
            .ok_or_else(|| AccessError::NoSuchField(name.to_string()))?;
        self.select(index)
    }

    /// Clear the selection, leaving the union holding nothing
    pub fn select_none(&mut self) -> Result<(), AccessError> {
        if self.immutable {
            return Err(AccessError::Immutable);
        }
        let PVValue::Union(value) = &mut self.value else {
            return Err(AccessError::TypeMismatch);
        };
        value.selector = None;
        value.value = None;
        Ok(())
    }

    /// Store a value into a non-variant union member
    pub fn set_selected(&mut self, index: usize, pv: PVField) -> Result<(), AccessError> {
        if self.immutable {
            return Err(AccessError::Immutable);
        }
        let Field::Union(u) = self.field.as_ref() else {
            return Err(AccessError::TypeMismatch);
        };
        if u.is_variant() {
            return Err(AccessError::TypeMismatch);
        }
        let member = u.get_fields().get(index).ok_or(AccessError::OutOfBounds)?;
        if member != &pv.field {
            return Err(AccessError::IncompatibleElement);
        }
        let mut pv = pv;
        pv.detach();
        let PVValue::Union(value) = &mut self.value else {
            return Err(AccessError::TypeMismatch);
        };
        value.selector = Some(index);
        value.value = Some(Box::new(pv));
        Ok(())
    }

    /// Store a value of any type into a variant union
    pub fn set_variant(&mut self, pv: PVField) -> Result<(), AccessError> {
        if self.immutable {
            return Err(AccessError::Immutable);
        }
        let Field::Union(u) = self.field.as_ref() else {
            return Err(AccessError::TypeMismatch);
        };
        if !u.is_variant() {
            return Err(AccessError::TypeMismatch);
        }
        let mut pv = pv;
        pv.detach();
        let PVValue::Union(value) = &mut self.value else {
            return Err(AccessError::TypeMismatch);
        };
        value.selector = None;
        value.value = Some(Box::new(pv));
        Ok(())
    }

    // --- structure/union array access -------------------------------------

    pub fn array_elements(&self) -> Option<&[Option<PVField>]> {
        match &self.value {
            PVValue::StructureArray(v) | PVValue::UnionArray(v) => Some(v),
            _ => None,
        }
    }

    /// Grow or shrink a structure/union array; new elements are null
    pub fn resize_elements(&mut self, len: usize) -> Result<(), AccessError> {
        if self.immutable {
            return Err(AccessError::Immutable);
        }
        match &mut self.value {
            PVValue::StructureArray(v) | PVValue::UnionArray(v) => {
                v.resize(len, None);
                Ok(())
            }
            _ => Err(AccessError::TypeMismatch),
        }
    }

    /// Store an element of a structure or union array
    ///
    /// The element's descriptor must be exactly the array's element schema.
    pub fn set_element(&mut self, index: usize, element: Option<PVField>) -> Result<(), AccessError> {
        if self.immutable {
            return Err(AccessError::Immutable);
        }
        let expected = element_field(&self.field).ok_or(AccessError::TypeMismatch)?;
        if let Some(pv) = &element {
            if pv.field != expected {
                return Err(AccessError::IncompatibleElement);
            }
        }
        let slot = match &mut self.value {
            PVValue::StructureArray(v) | PVValue::UnionArray(v) => {
                v.get_mut(index).ok_or(AccessError::OutOfBounds)?
            }
            _ => return Err(AccessError::TypeMismatch),
        };
        *slot = element.map(|mut pv| {
            pv.detach();
            pv
        });
        Ok(())
    }
}

/// Descriptor of one element of a structure or union array
pub(crate) fn element_field(field: &FieldRef) -> Option<FieldRef> {
    match field.as_ref() {
        Field::StructureArray(s) => Some(Arc::new(Field::Structure(s.as_ref().clone()))),
        Field::UnionArray(u) => Some(Arc::new(Field::Union(u.as_ref().clone()))),
        _ => None,
    }
}

fn default_value(field: &FieldRef) -> PVValue {
    match field.as_ref() {
        Field::Scalar { scalar_type } => PVValue::Scalar(ScalarValue::default_for(*scalar_type)),
        Field::BoundedString { .. } => PVValue::Scalar(ScalarValue::String(String::new())),
        Field::ScalarArray { element_type } => {
            PVValue::ScalarArray(ArrayValue::empty_for(*element_type))
        }
        Field::Structure(s) => {
            // Offsets are recomputed for the whole tree by the caller
            PVValue::Structure(s.get_fields().iter().map(|f| PVField::new(f.clone())).collect())
        }
        Field::StructureArray(_) => PVValue::StructureArray(Vec::new()),
        Field::Union(_) => PVValue::Union(UnionValue::default()),
        Field::UnionArray(_) => PVValue::UnionArray(Vec::new()),
    }
}

/// Typed get/put pairs for every scalar kind
///
/// The `put` form is deliberately lenient: writing to an immutable or
/// mismatched field logs a warning and leaves the stored value unchanged.
macro_rules! impl_scalar_accessors {
    ($get:ident, $put:ident, $variant:ident, $typ:ty) => {
        impl PVField {
            pub fn $get(&self) -> Option<$typ> {
                match &self.value {
                    PVValue::Scalar(ScalarValue::$variant(v)) => Some(v.clone()),
                    _ => None,
                }
            }

            pub fn $put(&mut self, value: $typ) {
                if let Err(e) = self.try_put_scalar(ScalarValue::$variant(value)) {
                    warn!("discarding write to {} field: {e}", self.field.id());
                }
            }
        }
    };
}
impl_scalar_accessors!(get_boolean, put_boolean, Boolean, bool);
impl_scalar_accessors!(get_byte, put_byte, Byte, i8);
impl_scalar_accessors!(get_short, put_short, Short, i16);
impl_scalar_accessors!(get_int, put_int, Int, i32);
impl_scalar_accessors!(get_long, put_long, Long, i64);
impl_scalar_accessors!(get_ubyte, put_ubyte, UByte, u8);
impl_scalar_accessors!(get_ushort, put_ushort, UShort, u16);
impl_scalar_accessors!(get_uint, put_uint, UInt, u32);
impl_scalar_accessors!(get_ulong, put_ulong, ULong, u64);
impl_scalar_accessors!(get_float, put_float, Float, f32);
impl_scalar_accessors!(get_double, put_double, Double, f64);
impl_scalar_accessors!(get_string, put_string, String, String);

/// Bounds-checked slice get/put pairs for every array element kind
///
/// `put` grows the array when writing past the current end, as long as the
/// write starts at or before it; `get` never grows.
macro_rules! impl_array_accessors {
    ($get:ident, $put:ident, $variant:ident, $typ:ty) => {
        impl PVField {
            pub fn $get(&self, offset: usize, count: usize) -> Result<&[$typ], AccessError> {
                let PVValue::ScalarArray(ArrayValue::$variant(items)) = &self.value else {
                    return Err(AccessError::TypeMismatch);
                };
                let end = offset.checked_add(count).ok_or(AccessError::OutOfBounds)?;
                items.get(offset..end).ok_or(AccessError::OutOfBounds)
            }

            pub fn $put(&mut self, offset: usize, data: &[$typ]) -> Result<(), AccessError> {
                if self.immutable {
                    return Err(AccessError::Immutable);
                }
                let PVValue::ScalarArray(ArrayValue::$variant(items)) = &mut self.value else {
                    return Err(AccessError::TypeMismatch);
                };
                if offset > items.len() {
                    return Err(AccessError::OutOfBounds);
                }
                let end = offset.checked_add(data.len()).ok_or(AccessError::OutOfBounds)?;
                if end > items.len() {
                    items.resize(end, Default::default());
                }
                items[offset..end].clone_from_slice(data);
                Ok(())
            }
        }
    };
}
impl_array_accessors!(get_boolean_slice, put_boolean_slice, Boolean, bool);
impl_array_accessors!(get_byte_slice, put_byte_slice, Byte, i8);
impl_array_accessors!(get_short_slice, put_short_slice, Short, i16);
impl_array_accessors!(get_int_slice, put_int_slice, Int, i32);
impl_array_accessors!(get_long_slice, put_long_slice, Long, i64);
impl_array_accessors!(get_ubyte_slice, put_ubyte_slice, UByte, u8);
impl_array_accessors!(get_ushort_slice, put_ushort_slice, UShort, u16);
impl_array_accessors!(get_uint_slice, put_uint_slice, UInt, u32);
impl_array_accessors!(get_ulong_slice, put_ulong_slice, ULong, u64);
impl_array_accessors!(get_float_slice, put_float_slice, Float, f32);
impl_array_accessors!(get_double_slice, put_double_slice, Double, f64);
impl_array_accessors!(get_string_slice, put_string_slice, String, String);

impl PVField {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize, name: &str) -> fmt::Result {
        write!(f, "{:width$}", "", width = indent * 4)?;
        let label = if name.is_empty() {
            self.field.id()
        } else {
            format!("{} {name}", self.field.id())
        };
        match &self.value {
            PVValue::Scalar(ScalarValue::String(s)) => writeln!(f, "{label} \"{s}\""),
            PVValue::Scalar(v) => writeln!(f, "{label} {v}"),
            PVValue::ScalarArray(a) => {
                write!(f, "{label} [")?;
                for i in 0..a.len() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match a {
                        ArrayValue::Boolean(v) => write!(f, "{}", v[i])?,
                        ArrayValue::Byte(v) => write!(f, "{}", v[i])?,
                        ArrayValue::Short(v) => write!(f, "{}", v[i])?,
                        ArrayValue::Int(v) => write!(f, "{}", v[i])?,
                        ArrayValue::Long(v) => write!(f, "{}", v[i])?,
                        ArrayValue::UByte(v) => write!(f, "{}", v[i])?,
                        ArrayValue::UShort(v) => write!(f, "{}", v[i])?,
                        ArrayValue::UInt(v) => write!(f, "{}", v[i])?,
                        ArrayValue::ULong(v) => write!(f, "{}", v[i])?,
                        ArrayValue::Float(v) => write!(f, "{}", v[i])?,
                        ArrayValue::Double(v) => write!(f, "{}", v[i])?,
                        ArrayValue::String(v) => write!(f, "\"{}\"", v[i])?,
                    }
                }
                writeln!(f, "]")
            }
            PVValue::Structure(children) => {
                writeln!(f, "{label}")?;
                let Field::Structure(s) = self.field.as_ref() else {
                    return Ok(());
                };
                for (child_name, child) in s.get_field_names().iter().zip(children.iter()) {
                    child.fmt_indented(f, indent + 1, child_name)?;
                }
                Ok(())
            }
            PVValue::StructureArray(elements) | PVValue::UnionArray(elements) => {
                writeln!(f, "{label} ({} elements)", elements.len())?;
                for element in elements {
                    match element {
                        Some(pv) => pv.fmt_indented(f, indent + 1, "")?,
                        None => writeln!(f, "{:width$}(none)", "", width = (indent + 1) * 4)?,
                    }
                }
                Ok(())
            }
            PVValue::Union(u) => {
                writeln!(f, "{label}")?;
                match u.value.as_deref() {
                    Some(pv) => pv.fmt_indented(f, indent + 1, ""),
                    None => writeln!(f, "{:width$}(none)", "", width = (indent + 1) * 4),
                }
            }
        }
    }
}

impl fmt::Display for PVField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0, "")
    }
}
