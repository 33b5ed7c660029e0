//! Resolved symbols handed to the engine by the type system.
//!
//! The engine never parses metadata itself: tokens embedded in the instruction stream are
//! resolved through [`crate::resolve::SymbolResolver`] into the symbols defined here.
use crate::{value::ValueKind, vm::exceptions::ExceptionHandlerRegion};
use std::{
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
};

/// A metadata token: the table id in the high byte, the 1-based row in the low 24 bits.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u32);

impl Token {
    pub const TYPE_REF: u8 = 0x01;
    pub const TYPE_DEF: u8 = 0x02;
    pub const FIELD: u8 = 0x04;
    pub const METHOD_DEF: u8 = 0x06;
    pub const MEMBER_REF: u8 = 0x0A;
    pub const STAND_ALONE_SIG: u8 = 0x11;
    pub const TYPE_SPEC: u8 = 0x1B;
    pub const METHOD_SPEC: u8 = 0x2B;
    pub const USER_STRING: u8 = 0x70;

    pub fn new(table: u8, row: u32) -> Self {
        Token(((table as u32) << 24) | (row & 0x00FF_FFFF))
    }

    pub fn table(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn row(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    pub fn is_type(self) -> bool {
        matches!(self.table(), Self::TYPE_REF | Self::TYPE_DEF | Self::TYPE_SPEC)
    }

    pub fn is_method(self) -> bool {
        matches!(self.table(), Self::METHOD_DEF | Self::METHOD_SPEC)
            || self.table() == Self::MEMBER_REF
    }
}

impl Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:#010x})", self.0)
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

macro_rules! handle {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);
        )+
    };
}

handle! {
    /// Opaque identity of a loaded type, assigned by the type system.
    TypeHandle,
    MethodHandle,
    FieldHandle,
    ModuleId,
}

/// The context a token is resolved in: the owning module plus generic instantiation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResolutionScope {
    pub module: ModuleId,
    pub type_args: Vec<TypeHandle>,
    pub method_args: Vec<TypeHandle>,
}

impl Default for ModuleId {
    fn default() -> Self {
        ModuleId(0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeSymbol {
    pub handle: TypeHandle,
    pub name: String,
    /// How a value of this type is stored; `Struct` for user value types, `Object` for classes.
    pub kind: ValueKind,
    pub is_value_type: bool,
}

impl TypeSymbol {
    pub fn stack_type(&self) -> crate::value::StackType {
        self.kind.stack_type()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldSymbol {
    pub handle: FieldHandle,
    pub name: String,
    pub declaring_type: TypeHandle,
    pub field_type: TypeHandle,
    pub kind: ValueKind,
    pub is_static: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodSignature {
    /// Kind of the implicit `this` argument; `None` for static methods.
    pub this_kind: Option<ValueKind>,
    pub parameters: Vec<ValueKind>,
    pub return_type: Option<ValueKind>,
}

impl MethodSignature {
    pub fn new_static(parameters: Vec<ValueKind>, return_type: Option<ValueKind>) -> Self {
        Self {
            this_kind: None,
            parameters,
            return_type,
        }
    }

    pub fn new_instance(parameters: Vec<ValueKind>, return_type: Option<ValueKind>) -> Self {
        Self {
            this_kind: Some(ValueKind::Object),
            parameters,
            return_type,
        }
    }

    pub fn has_this(&self) -> bool {
        self.this_kind.is_some()
    }

    pub fn has_return_value(&self) -> bool {
        self.return_type.is_some()
    }

    pub fn parameter_count_including_instance(&self) -> usize {
        self.parameters.len() + usize::from(self.has_this())
    }

    /// The kinds of every argument slot, `this` first.
    pub fn argument_kinds(&self) -> impl Iterator<Item = ValueKind> + '_ {
        self.this_kind.iter().copied().chain(self.parameters.iter().copied())
    }
}

/// A method body as read by the metadata layer.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodBody {
    pub il: Arc<[u8]>,
    pub max_stack: u16,
    pub locals: Vec<ValueKind>,
    pub init_locals: bool,
    pub exception_regions: Vec<ExceptionHandlerRegion>,
}

impl MethodBody {
    pub fn new(il: impl Into<Arc<[u8]>>, max_stack: u16) -> Self {
        Self {
            il: il.into(),
            max_stack,
            locals: vec![],
            init_locals: true,
            exception_regions: vec![],
        }
    }

    pub fn with_locals(mut self, locals: Vec<ValueKind>) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_regions(mut self, regions: Vec<ExceptionHandlerRegion>) -> Self {
        self.exception_regions = regions;
        self
    }
}

#[derive(Clone, PartialEq)]
pub struct MethodSymbol {
    pub handle: MethodHandle,
    pub name: String,
    pub declaring_type: TypeHandle,
    pub signature: MethodSignature,
    pub is_virtual: bool,
    /// Methods without a body are runtime-provided and dispatched to the object model.
    pub body: Option<MethodBody>,
    pub scope: ResolutionScope,
}

impl Debug for MethodSymbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.name, self.handle)
    }
}

impl MethodSymbol {
    pub fn has_return_value(&self) -> bool {
        self.signature.has_return_value()
    }
}

/// The result of resolving an `ldtoken` operand.
#[derive(Clone, Debug, PartialEq)]
pub enum TokenSymbol {
    Type(Arc<TypeSymbol>),
    Method(Arc<MethodSymbol>),
    Field(Arc<FieldSymbol>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_parts() {
        let t = Token::new(Token::METHOD_DEF, 3);
        assert_eq!(t.0, 0x0600_0003);
        assert_eq!(t.table(), Token::METHOD_DEF);
        assert_eq!(t.row(), 3);
        assert!(t.is_method());
        assert!(!t.is_type());
    }

    #[test]
    fn test_argument_kinds_put_this_first() {
        let sig = MethodSignature::new_instance(vec![ValueKind::I4, ValueKind::R8], None);
        let kinds: Vec<_> = sig.argument_kinds().collect();
        assert_eq!(kinds, vec![ValueKind::Object, ValueKind::I4, ValueKind::R8]);
        assert_eq!(sig.parameter_count_including_instance(), 3);
    }
}
