//! Incremental construction of [`Field`] trees.
//!
//! [`FieldBuilder`] accumulates `(name, field)` pairs and finalizes them into
//! an immutable [`Structure`] or [`Union`]. Nested composites are opened with
//! the `add_nested_*` methods and closed with [`FieldBuilder::end_nested`];
//! the in-progress frames live on an explicit stack inside the builder, so a
//! frame's lifetime is independent of the call that opened it.
//!
//! Finalizing resets the builder, so one instance can produce any number of
//! independent descriptors:
//!
//! ```
//! use pvars::{FieldBuilder, types::ScalarType};
//!
//! let mut builder = FieldBuilder::new();
//! let structure = builder
//!     .set_id("epics:nt/NTScalar:1.0")
//!     .add("value", ScalarType::Double)
//!     .unwrap()
//!     .add_nested_structure("alarm")
//!     .add("severity", ScalarType::Int)
//!     .unwrap()
//!     .end_nested()
//!     .unwrap()
//!     .create_structure()
//!     .unwrap();
//! assert_eq!(structure.get_field_names(), ["value", "alarm"]);
//! ```

use std::sync::Arc;

use thiserror::Error;

use crate::types::{Field, FieldRef, ScalarType, Structure, Union};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BuildError {
    #[error("field name already used in this structure or union: {0}")]
    DuplicateField(String),
    #[error("end_nested called with no open nested frame")]
    NoOpenFrame,
    #[error("{0} nested frame(s) left open at finalization")]
    UnterminatedNested(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Top,
    Structure,
    Union,
    StructureArray,
    UnionArray,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    /// Name this frame will take in its parent; empty for the top frame
    name: String,
    id: Option<String>,
    members: Vec<(String, FieldRef)>,
}

impl Frame {
    fn new(kind: FrameKind, name: String) -> Self {
        Frame {
            kind,
            name,
            id: None,
            members: Vec::new(),
        }
    }

    fn push_member(&mut self, name: &str, field: FieldRef) -> Result<(), BuildError> {
        if self.members.iter().any(|(n, _)| n == name) {
            return Err(BuildError::DuplicateField(name.to_string()));
        }
        self.members.push((name.to_string(), field));
        Ok(())
    }
}

/// Stateful builder for [`Structure`] and [`Union`] descriptors
///
/// Single use at a time: interleaving two builds through one instance is not
/// supported, but the instance is reusable after each `create_*` call.
#[derive(Debug)]
pub struct FieldBuilder {
    frames: Vec<Frame>,
}

impl Default for FieldBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldBuilder {
    pub fn new() -> Self {
        FieldBuilder {
            frames: vec![Frame::new(FrameKind::Top, String::new())],
        }
    }

    fn top(&mut self) -> &mut Frame {
        // Invariant: frames is never empty between public calls
        self.frames
            .last_mut()
            .expect("builder frame stack exhausted")
    }

    /// Set the identification string of the descriptor under construction
    pub fn set_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.top().id = Some(id.into());
        self
    }

    /// Append a scalar field
    pub fn add(&mut self, name: &str, scalar_type: ScalarType) -> Result<&mut Self, BuildError> {
        self.top()
            .push_member(name, Arc::new(Field::Scalar { scalar_type }))?;
        Ok(self)
    }

    /// Append a string scalar with a maximum length
    pub fn add_bounded_string(
        &mut self,
        name: &str,
        max_length: usize,
    ) -> Result<&mut Self, BuildError> {
        self.top()
            .push_member(name, Arc::new(Field::BoundedString { max_length }))?;
        Ok(self)
    }

    /// Append an already-built field, composing previously created descriptors
    pub fn add_field(&mut self, name: &str, field: FieldRef) -> Result<&mut Self, BuildError> {
        self.top().push_member(name, field)?;
        Ok(self)
    }

    /// Append a variable-size scalar array field
    pub fn add_array(&mut self, name: &str, element_type: ScalarType) -> Result<&mut Self, BuildError> {
        self.top()
            .push_member(name, Arc::new(Field::ScalarArray { element_type }))?;
        Ok(self)
    }

    /// Append an array of a previously built structure
    pub fn add_structure_array(
        &mut self,
        name: &str,
        element: Structure,
    ) -> Result<&mut Self, BuildError> {
        self.top()
            .push_member(name, Arc::new(Field::StructureArray(Arc::new(element))))?;
        Ok(self)
    }

    /// Append an array of a previously built union
    pub fn add_union_array(&mut self, name: &str, element: Union) -> Result<&mut Self, BuildError> {
        self.top()
            .push_member(name, Arc::new(Field::UnionArray(Arc::new(element))))?;
        Ok(self)
    }

    /// Open a nested structure; close it with [`FieldBuilder::end_nested`]
    pub fn add_nested_structure(&mut self, name: &str) -> &mut Self {
        self.frames
            .push(Frame::new(FrameKind::Structure, name.to_string()));
        self
    }

    /// Open a nested union; close it with [`FieldBuilder::end_nested`]
    pub fn add_nested_union(&mut self, name: &str) -> &mut Self {
        self.frames
            .push(Frame::new(FrameKind::Union, name.to_string()));
        self
    }

    /// Open a nested structure array; close it with [`FieldBuilder::end_nested`]
    pub fn add_nested_structure_array(&mut self, name: &str) -> &mut Self {
        self.frames
            .push(Frame::new(FrameKind::StructureArray, name.to_string()));
        self
    }

    /// Open a nested union array; close it with [`FieldBuilder::end_nested`]
    pub fn add_nested_union_array(&mut self, name: &str) -> &mut Self {
        self.frames
            .push(Frame::new(FrameKind::UnionArray, name.to_string()));
        self
    }

    /// Complete the innermost nested frame and append it to its parent
    pub fn end_nested(&mut self) -> Result<&mut Self, BuildError> {
        if self.frames.len() < 2 {
            return Err(BuildError::NoOpenFrame);
        }
        let frame = self.frames.pop().expect("length checked above");
        let id = frame.id.unwrap_or_default();
        let field: FieldRef = match frame.kind {
            FrameKind::Top => unreachable!("top frame is never popped by end_nested"),
            FrameKind::Structure => Arc::new(Field::Structure(Structure::new(id, frame.members)?)),
            FrameKind::Union => Arc::new(Field::Union(Union::new(id, frame.members)?)),
            FrameKind::StructureArray => Arc::new(Field::StructureArray(Arc::new(Structure::new(
                id,
                frame.members,
            )?))),
            FrameKind::UnionArray => {
                Arc::new(Field::UnionArray(Arc::new(Union::new(id, frame.members)?)))
            }
        };
        let name = frame.name;
        self.top().push_member(&name, field)?;
        Ok(self)
    }

    fn take_top(&mut self) -> Result<Frame, BuildError> {
        if self.frames.len() > 1 {
            let open = self.frames.len() - 1;
            // Leave the builder untouched so the caller can close the frames
            return Err(BuildError::UnterminatedNested(open));
        }
        let frame = self.frames.pop().expect("top frame always present");
        self.frames.push(Frame::new(FrameKind::Top, String::new()));
        Ok(frame)
    }

    /// Finalize the accumulated fields into a [`Structure`] and reset
    pub fn create_structure(&mut self) -> Result<Structure, BuildError> {
        let frame = self.take_top()?;
        Structure::new(frame.id.unwrap_or_default(), frame.members)
    }

    /// Finalize the accumulated fields into a [`Union`] and reset
    pub fn create_union(&mut self) -> Result<Union, BuildError> {
        let frame = self.take_top()?;
        Union::new(frame.id.unwrap_or_default(), frame.members)
    }
}
