use crate::{BufferDescriptor, RVec, TensorDescriptor, TensorHandle, TensorPool};
use half::f16;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ArgumentError {
    #[error("Argument `{name}` is not declared")]
    Missing { name: String },
    #[error("Argument `{name}` is a {actual}, expected a {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Tensor argument `{name}` has no tensor bound")]
    Unbound { name: String },
    #[error("Tensor argument `{name}` refers to {handle:?}, which is no longer in the pool")]
    StaleTensor { name: String, handle: TensorHandle },
    #[error("Tensor bound to `{name}` is {actual:?}, kernel was generated for {expected:?}")]
    IncompatibleTensor {
        name: String,
        expected: TensorDescriptor,
        actual: TensorDescriptor,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
}

/// A tensor slot of an argument set.
///
/// The descriptor is fixed at declaration; the handle is (re)bound whenever
/// the operation's inputs or outputs change.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorArgument {
    pub descriptor: TensorDescriptor,
    pub access: AccessType,
    pub handle: Option<TensorHandle>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Int(i32),
    Float(f32),
    Half(f16),
    Buffer(BufferDescriptor),
    Tensor(TensorArgument),
}

impl Argument {
    pub fn kind(&self) -> &'static str {
        match self {
            Argument::Int(_) => "int",
            Argument::Float(_) => "float",
            Argument::Half(_) => "half",
            Argument::Buffer(_) => "buffer",
            Argument::Tensor(_) => "tensor",
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Argument::Int(_) | Argument::Float(_) | Argument::Half(_))
    }
}

/// Named kernel arguments, in declaration order.
///
/// Declaration order is preserved through renaming and merging, so identical
/// operation chains always produce identical argument tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    entries: RVec<(String, Argument)>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    /// Declares `name`, replacing any previous declaration with that name.
    pub fn insert(&mut self, name: impl Into<String>, argument: Argument) {
        let name = name.into();
        match self.position(&name) {
            Some(idx) => self.entries[idx].1 = argument,
            None => self.entries.push((name, argument)),
        }
    }

    pub fn add_int(&mut self, name: impl Into<String>, value: i32) {
        self.insert(name, Argument::Int(value));
    }

    pub fn add_float(&mut self, name: impl Into<String>, value: f32) {
        self.insert(name, Argument::Float(value));
    }

    pub fn add_half(&mut self, name: impl Into<String>, value: f16) {
        self.insert(name, Argument::Half(value));
    }

    pub fn add_buffer(&mut self, name: impl Into<String>, descriptor: BufferDescriptor) {
        self.insert(name, Argument::Buffer(descriptor));
    }

    pub fn add_tensor(
        &mut self,
        name: impl Into<String>,
        descriptor: TensorDescriptor,
        access: AccessType,
    ) {
        self.insert(
            name,
            Argument::Tensor(TensorArgument {
                descriptor,
                access,
                handle: None,
            }),
        );
    }

    pub fn get(&self, name: &str) -> Option<&Argument> {
        self.position(name).map(|idx| &self.entries[idx].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Argument> {
        self.position(name).map(|idx| self.entries.remove(idx).1)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Argument)> {
        self.entries.iter().map(|(n, a)| (n.as_str(), a))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut Argument, ArgumentError> {
        match self.position(name) {
            Some(idx) => Ok(&mut self.entries[idx].1),
            None => Err(ArgumentError::Missing {
                name: name.to_string(),
            }),
        }
    }

    pub fn set_int(&mut self, name: &str, value: i32) -> Result<(), ArgumentError> {
        match self.get_mut(name)? {
            Argument::Int(v) => {
                *v = value;
                Ok(())
            }
            other => Err(mismatch(name, "int", other)),
        }
    }

    /// Updates a float argument. Half arguments accept the value rounded.
    pub fn set_float(&mut self, name: &str, value: f32) -> Result<(), ArgumentError> {
        match self.get_mut(name)? {
            Argument::Float(v) => *v = value,
            Argument::Half(v) => *v = f16::from_f32(value),
            other => return Err(mismatch(name, "float", other)),
        }
        Ok(())
    }

    pub fn set_tensor(&mut self, name: &str, handle: TensorHandle) -> Result<(), ArgumentError> {
        match self.get_mut(name)? {
            Argument::Tensor(t) => {
                t.handle = Some(handle);
                Ok(())
            }
            other => Err(mismatch(name, "tensor", other)),
        }
    }

    /// Checks that `name` is declared with the given kind.
    pub fn expect(&self, name: &str, kind: &'static str) -> Result<&Argument, ArgumentError> {
        let argument = self.get(name).ok_or_else(|| ArgumentError::Missing {
            name: name.to_string(),
        })?;
        let matches = match kind {
            "scalar" => argument.is_scalar(),
            k => argument.kind() == k,
        };
        if matches {
            Ok(argument)
        } else {
            Err(mismatch(name, kind, argument))
        }
    }

    /// Returns a copy with `postfix` appended to every name.
    pub fn with_postfix(&self, postfix: &str) -> Arguments {
        Arguments {
            entries: self
                .entries
                .iter()
                .map(|(n, a)| (format!("{n}{postfix}"), a.clone()))
                .collect(),
        }
    }

    /// Appends all of `other`, failing on the first name declared by both.
    ///
    /// On failure `self` is left unchanged and the colliding name is returned.
    pub fn merge(&mut self, other: Arguments) -> Result<(), String> {
        if let Some((name, _)) = other.entries.iter().find(|(n, _)| self.contains(n)) {
            return Err(name.clone());
        }
        self.entries.extend(other.entries);
        Ok(())
    }

    /// Resolves every entry to a concrete value.
    ///
    /// Tensor slots must be bound to a live tensor whose descriptor matches the
    /// one the kernel was generated for.
    pub fn bind(&self, tensors: &TensorPool) -> Result<BoundArguments, ArgumentError> {
        let mut entries = RVec::with_capacity(self.entries.len());
        for (name, argument) in self.entries.iter() {
            let value = match argument {
                Argument::Int(v) => BoundValue::Int(*v),
                Argument::Float(v) => BoundValue::Float(*v),
                Argument::Half(v) => BoundValue::Float(v.to_f32()),
                Argument::Buffer(b) => BoundValue::Buffer(b.data.clone()),
                Argument::Tensor(t) => {
                    let handle = t.handle.ok_or_else(|| ArgumentError::Unbound {
                        name: name.clone(),
                    })?;
                    let tensor = tensors
                        .get(handle)
                        .map_err(|_| ArgumentError::StaleTensor {
                            name: name.clone(),
                            handle,
                        })?;
                    if tensor.descriptor() != &t.descriptor {
                        return Err(ArgumentError::IncompatibleTensor {
                            name: name.clone(),
                            expected: t.descriptor,
                            actual: *tensor.descriptor(),
                        });
                    }
                    BoundValue::Tensor(handle, t.access)
                }
            };
            entries.push((name.clone(), value));
        }
        log::trace!("Bound {} arguments", entries.len());
        Ok(BoundArguments { entries })
    }
}

fn mismatch(name: &str, expected: &'static str, actual: &Argument) -> ArgumentError {
    ArgumentError::TypeMismatch {
        name: name.to_string(),
        expected,
        actual: actual.kind(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    Int(i32),
    Float(f32),
    Buffer(Arc<[f32]>),
    Tensor(TensorHandle, AccessType),
}

/// Argument values resolved for one dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArguments {
    entries: RVec<(String, BoundValue)>,
}

impl BoundArguments {
    pub fn get(&self, name: &str) -> Option<&BoundValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BoundValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
