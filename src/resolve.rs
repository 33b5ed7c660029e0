//! Symbol resolution.
//!
//! The engine consumes metadata only through [`SymbolResolver`] and [`Metadata`]. This module
//! also provides [`Assemblies`], an in-memory module that hosts programs built with the IL
//! assembler, used by the CLI and the test suite.
use crate::{
    types::{
        FieldHandle, FieldSymbol, MethodBody, MethodHandle, MethodSignature, MethodSymbol,
        ResolutionScope, Token, TokenSymbol, TypeHandle, TypeSymbol,
    },
    utils::sync::{AtomicU64, Ordering, RwLock},
    value::ValueKind,
    vm::error::{FaultKind, ResolutionError},
};
use std::{collections::HashMap, sync::Arc};

/// Resolves tokens found in the instruction stream to loaded symbols.
pub trait SymbolResolver: Send + Sync {
    fn resolve_type(
        &self,
        token: Token,
        scope: &ResolutionScope,
    ) -> Result<Arc<TypeSymbol>, ResolutionError>;

    fn resolve_method(
        &self,
        token: Token,
        scope: &ResolutionScope,
    ) -> Result<Arc<MethodSymbol>, ResolutionError>;

    fn resolve_field(
        &self,
        token: Token,
        scope: &ResolutionScope,
    ) -> Result<Arc<FieldSymbol>, ResolutionError>;

    /// Resolves an `ldtoken` operand, which may name a type, a method or a field.
    fn resolve_token(
        &self,
        token: Token,
        scope: &ResolutionScope,
    ) -> Result<TokenSymbol, ResolutionError>;

    /// The implementation of `method` selected by a receiver of runtime type `this_type`.
    fn resolve_virtual(
        &self,
        method: &MethodSymbol,
        this_type: TypeHandle,
    ) -> Result<Arc<MethodSymbol>, ResolutionError>;

    fn is_assignable(&self, from: TypeHandle, to: TypeHandle) -> bool;

    /// The loaded type behind `handle`, e.g. the declaring type of a constructor.
    fn type_of(&self, handle: TypeHandle) -> Result<Arc<TypeSymbol>, ResolutionError>;

    /// The standalone signature named by a `calli` operand.
    fn resolve_signature(
        &self,
        token: Token,
        _scope: &ResolutionScope,
    ) -> Result<MethodSignature, ResolutionError> {
        Err(ResolutionError::NotFound(token))
    }
}

pub trait Metadata: Send + Sync {
    fn user_string(&self, scope: &ResolutionScope, token: Token) -> Result<String, ResolutionError>;
}

#[derive(Debug, Default)]
struct Tables {
    types: Vec<Arc<TypeSymbol>>,
    bases: HashMap<TypeHandle, TypeHandle>,
    methods: Vec<Arc<MethodSymbol>>,
    fields: Vec<Arc<FieldSymbol>>,
    strings: Vec<String>,
    signatures: Vec<MethodSignature>,
    overrides: HashMap<(MethodHandle, TypeHandle), MethodHandle>,
}

impl Tables {
    fn row<T: Clone>(table: &[T], token: Token, expected: u8, name: &'static str) -> Result<T, ResolutionError> {
        if token.table() != expected {
            return Err(ResolutionError::WrongTable {
                token,
                expected: name,
            });
        }
        (token.row() as usize)
            .checked_sub(1)
            .and_then(|i| table.get(i))
            .cloned()
            .ok_or(ResolutionError::NotFound(token))
    }

    fn ty(&self, handle: TypeHandle) -> Option<&Arc<TypeSymbol>> {
        (handle.0 as usize).checked_sub(1).and_then(|i| self.types.get(i))
    }
}

/// Types every program can reference by name.
#[derive(Copy, Clone, Debug)]
pub struct CoreTypes {
    pub object: Token,
    pub value_type: Token,
    pub string: Token,
    pub array: Token,
    pub exception: Token,
    pub runtime_handle: Token,
    pub exception_ctor: Token,
    pub object_ctor: Token,
}

/// An in-memory module: types, methods, fields, user strings and standalone signatures
/// are appended through the `define_*` methods and addressed by ordinary metadata tokens.
#[derive(Debug)]
pub struct Assemblies {
    tables: RwLock<Tables>,
    core: CoreTypes,
    method_lookups: AtomicU64,
}

impl Default for Assemblies {
    fn default() -> Self {
        Self::new()
    }
}

const PRIMITIVES: &[(&str, ValueKind)] = &[
    ("System.Boolean", ValueKind::Boolean),
    ("System.Char", ValueKind::Char),
    ("System.SByte", ValueKind::I1),
    ("System.Byte", ValueKind::U1),
    ("System.Int16", ValueKind::I2),
    ("System.UInt16", ValueKind::U2),
    ("System.Int32", ValueKind::I4),
    ("System.UInt32", ValueKind::U4),
    ("System.Int64", ValueKind::I8),
    ("System.UInt64", ValueKind::U8),
    ("System.IntPtr", ValueKind::I),
    ("System.UIntPtr", ValueKind::U),
    ("System.Single", ValueKind::R4),
    ("System.Double", ValueKind::R8),
];

impl Assemblies {
    pub fn new() -> Self {
        let mut tables = Tables::default();
        let mut add = |name: &str, kind: ValueKind, is_value_type: bool, base: Option<Token>| {
            let handle = TypeHandle(tables.types.len() as u32 + 1);
            tables.types.push(Arc::new(TypeSymbol {
                handle,
                name: name.to_string(),
                kind,
                is_value_type,
            }));
            if let Some(base) = base {
                tables.bases.insert(handle, TypeHandle(base.row()));
            }
            Token::new(Token::TYPE_DEF, handle.0)
        };

        let object = add("System.Object", ValueKind::Object, false, None);
        let value_type = add("System.ValueType", ValueKind::Object, false, Some(object));
        let string = add("System.String", ValueKind::Object, false, Some(object));
        let array = add("System.Array", ValueKind::Object, false, Some(object));
        let runtime_handle = add("System.RuntimeTypeHandle", ValueKind::Object, false, Some(object));
        let exception = add("System.Exception", ValueKind::Object, false, Some(object));
        let system = add("System.SystemException", ValueKind::Object, false, Some(exception));
        let arithmetic = add("System.ArithmeticException", ValueKind::Object, false, Some(system));
        for kind in FaultKind::ALL {
            let base = match kind {
                FaultKind::Overflow | FaultKind::DivideByZero => arithmetic,
                _ => system,
            };
            add(&kind.to_string(), ValueKind::Object, false, Some(base));
        }
        for (name, kind) in PRIMITIVES {
            add(name, *kind, true, Some(value_type));
        }

        let mut ctor = |declaring: Token| {
            let handle = MethodHandle(tables.methods.len() as u32 + 1);
            tables.methods.push(Arc::new(MethodSymbol {
                handle,
                name: ".ctor".to_string(),
                declaring_type: TypeHandle(declaring.row()),
                signature: MethodSignature::new_instance(vec![], None),
                is_virtual: false,
                body: None,
                scope: ResolutionScope::default(),
            }));
            Token::new(Token::METHOD_DEF, handle.0)
        };
        let object_ctor = ctor(object);
        let exception_ctor = ctor(exception);

        Self {
            tables: RwLock::new(tables),
            core: CoreTypes {
                object,
                value_type,
                string,
                array,
                exception,
                runtime_handle,
                exception_ctor,
                object_ctor,
            },
            method_lookups: AtomicU64::new(0),
        }
    }

    pub fn core(&self) -> &CoreTypes {
        &self.core
    }

    pub fn exception_token(&self) -> Token {
        self.core.exception
    }

    /// The type token of the exception raised for `kind`.
    pub fn fault_token(&self, kind: FaultKind) -> Token {
        self.type_token(&kind.to_string())
            .unwrap_or(self.core.exception)
    }

    pub fn type_token(&self, name: &str) -> Option<Token> {
        self.tables
            .read()
            .types
            .iter()
            .find(|t| t.name == name)
            .map(|t| Token::new(Token::TYPE_DEF, t.handle.0))
    }

    pub fn type_symbol(&self, handle: TypeHandle) -> Option<Arc<TypeSymbol>> {
        self.tables.read().ty(handle).cloned()
    }

    pub fn method_token(&self, type_name: &str, name: &str) -> Option<Token> {
        let tables = self.tables.read();
        let declaring = tables.types.iter().find(|t| t.name == type_name)?.handle;
        tables
            .methods
            .iter()
            .find(|m| m.declaring_type == declaring && m.name == name)
            .map(|m| Token::new(Token::METHOD_DEF, m.handle.0))
    }

    pub fn field_token(&self, type_name: &str, name: &str) -> Option<Token> {
        let tables = self.tables.read();
        let declaring = tables.types.iter().find(|t| t.name == type_name)?.handle;
        tables
            .fields
            .iter()
            .find(|f| f.declaring_type == declaring && f.name == name)
            .map(|f| Token::new(Token::FIELD, f.handle.0))
    }

    /// Instance fields of `ty`, including inherited ones.
    pub fn instance_fields(&self, ty: TypeHandle) -> Vec<Arc<FieldSymbol>> {
        let tables = self.tables.read();
        let mut chain = vec![ty];
        while let Some(base) = chain.last().and_then(|t| tables.bases.get(t)) {
            chain.push(*base);
        }
        tables
            .fields
            .iter()
            .filter(|f| !f.is_static && chain.contains(&f.declaring_type))
            .cloned()
            .collect()
    }

    /// Number of method resolutions served so far.
    pub fn method_lookups(&self) -> u64 {
        self.method_lookups.load(Ordering::Relaxed)
    }

    pub fn define_type(
        &self,
        name: impl Into<String>,
        kind: ValueKind,
        base: Option<Token>,
    ) -> Token {
        let mut tables = self.tables.write();
        let handle = TypeHandle(tables.types.len() as u32 + 1);
        let is_value_type = kind != ValueKind::Object;
        tables.types.push(Arc::new(TypeSymbol {
            handle,
            name: name.into(),
            kind,
            is_value_type,
        }));
        let base = match base {
            Some(base) => base,
            None if is_value_type => self.core.value_type,
            None => self.core.object,
        };
        tables.bases.insert(handle, TypeHandle(base.row()));
        Token::new(Token::TYPE_DEF, handle.0)
    }

    pub fn define_field(
        &self,
        declaring: Token,
        name: impl Into<String>,
        field_type: Token,
        is_static: bool,
    ) -> Result<Token, ResolutionError> {
        let mut tables = self.tables.write();
        let declaring = Tables::row(&tables.types, declaring, Token::TYPE_DEF, "type")?;
        let field_type = Tables::row(&tables.types, field_type, Token::TYPE_DEF, "type")?;
        let handle = FieldHandle(tables.fields.len() as u32 + 1);
        tables.fields.push(Arc::new(FieldSymbol {
            handle,
            name: name.into(),
            declaring_type: declaring.handle,
            field_type: field_type.handle,
            kind: field_type.kind,
            is_static,
        }));
        Ok(Token::new(Token::FIELD, handle.0))
    }

    pub fn define_string(&self, value: impl Into<String>) -> Token {
        let mut tables = self.tables.write();
        tables.strings.push(value.into());
        Token::new(Token::USER_STRING, tables.strings.len() as u32)
    }

    pub fn define_signature(&self, signature: MethodSignature) -> Token {
        let mut tables = self.tables.write();
        tables.signatures.push(signature);
        Token::new(Token::STAND_ALONE_SIG, tables.signatures.len() as u32)
    }

    /// Adds a method without a body. A body can be attached later with
    /// [`Assemblies::define_body`], which allows recursive and mutually recursive methods.
    pub fn declare_method(
        &self,
        declaring: Token,
        name: impl Into<String>,
        signature: MethodSignature,
        is_virtual: bool,
    ) -> Token {
        let mut tables = self.tables.write();
        let handle = MethodHandle(tables.methods.len() as u32 + 1);
        tables.methods.push(Arc::new(MethodSymbol {
            handle,
            name: name.into(),
            declaring_type: TypeHandle(declaring.row()),
            signature,
            is_virtual,
            body: None,
            scope: ResolutionScope::default(),
        }));
        Token::new(Token::METHOD_DEF, handle.0)
    }

    pub fn define_body(&self, method: Token, body: MethodBody) -> Result<(), ResolutionError> {
        let mut tables = self.tables.write();
        let existing = Tables::row(&tables.methods, method, Token::METHOD_DEF, "method")?;
        let mut updated = (*existing).clone();
        updated.body = Some(body);
        tables.methods[method.row() as usize - 1] = Arc::new(updated);
        Ok(())
    }

    /// Declares a static method on `System.Object` with the given body.
    pub fn define_method(
        &self,
        name: impl Into<String>,
        signature: MethodSignature,
        body: MethodBody,
    ) -> Result<Token, ResolutionError> {
        let token = self.declare_method(self.core.object, name, signature, false);
        self.define_body(token, body)?;
        Ok(token)
    }

    /// Registers `implementation` as the override of virtual `base` on type `ty`.
    pub fn override_method(
        &self,
        base: Token,
        ty: Token,
        implementation: Token,
    ) -> Result<(), ResolutionError> {
        let mut tables = self.tables.write();
        let base = Tables::row(&tables.methods, base, Token::METHOD_DEF, "method")?;
        let implementation = Tables::row(&tables.methods, implementation, Token::METHOD_DEF, "method")?;
        let ty = Tables::row(&tables.types, ty, Token::TYPE_DEF, "type")?;
        tables
            .overrides
            .insert((base.handle, ty.handle), implementation.handle);
        Ok(())
    }

    pub fn method(&self, token: Token) -> Result<Arc<MethodSymbol>, ResolutionError> {
        self.resolve_method(token, &ResolutionScope::default())
    }
}

impl SymbolResolver for Assemblies {
    fn resolve_type(
        &self,
        token: Token,
        _scope: &ResolutionScope,
    ) -> Result<Arc<TypeSymbol>, ResolutionError> {
        Tables::row(&self.tables.read().types, token, Token::TYPE_DEF, "type")
    }

    fn resolve_method(
        &self,
        token: Token,
        _scope: &ResolutionScope,
    ) -> Result<Arc<MethodSymbol>, ResolutionError> {
        self.method_lookups.fetch_add(1, Ordering::Relaxed);
        Tables::row(&self.tables.read().methods, token, Token::METHOD_DEF, "method")
    }

    fn resolve_field(
        &self,
        token: Token,
        _scope: &ResolutionScope,
    ) -> Result<Arc<FieldSymbol>, ResolutionError> {
        Tables::row(&self.tables.read().fields, token, Token::FIELD, "field")
    }

    fn resolve_token(
        &self,
        token: Token,
        scope: &ResolutionScope,
    ) -> Result<TokenSymbol, ResolutionError> {
        match token.table() {
            Token::TYPE_DEF => self.resolve_type(token, scope).map(TokenSymbol::Type),
            Token::METHOD_DEF => self.resolve_method(token, scope).map(TokenSymbol::Method),
            Token::FIELD => self.resolve_field(token, scope).map(TokenSymbol::Field),
            _ => Err(ResolutionError::WrongTable {
                token,
                expected: "type, method or field",
            }),
        }
    }

    fn resolve_virtual(
        &self,
        method: &MethodSymbol,
        this_type: TypeHandle,
    ) -> Result<Arc<MethodSymbol>, ResolutionError> {
        let tables = self.tables.read();
        let lookup = |handle: MethodHandle| {
            (handle.0 as usize)
                .checked_sub(1)
                .and_then(|i| tables.methods.get(i))
                .cloned()
        };
        if tables.ty(this_type).is_none() {
            return Err(ResolutionError::NoVirtualTarget {
                method: method.name.clone(),
                type_name: format!("{:?}", this_type),
            });
        }
        let mut current = Some(this_type);
        while let Some(ty) = current {
            if let Some(implementation) = tables.overrides.get(&(method.handle, ty)) {
                return lookup(*implementation).ok_or(ResolutionError::NotFound(Token::new(
                    Token::METHOD_DEF,
                    implementation.0,
                )));
            }
            current = tables.bases.get(&ty).copied();
        }
        lookup(method.handle).ok_or(ResolutionError::NotFound(Token::new(
            Token::METHOD_DEF,
            method.handle.0,
        )))
    }

    fn type_of(&self, handle: TypeHandle) -> Result<Arc<TypeSymbol>, ResolutionError> {
        self.type_symbol(handle)
            .ok_or(ResolutionError::UnknownType(handle))
    }

    fn is_assignable(&self, from: TypeHandle, to: TypeHandle) -> bool {
        let tables = self.tables.read();
        let mut current = Some(from);
        while let Some(ty) = current {
            if ty == to {
                return true;
            }
            current = tables.bases.get(&ty).copied();
        }
        false
    }

    fn resolve_signature(
        &self,
        token: Token,
        _scope: &ResolutionScope,
    ) -> Result<MethodSignature, ResolutionError> {
        Tables::row(
            &self.tables.read().signatures,
            token,
            Token::STAND_ALONE_SIG,
            "standalone signature",
        )
    }
}

impl Metadata for Assemblies {
    fn user_string(&self, _scope: &ResolutionScope, token: Token) -> Result<String, ResolutionError> {
        Tables::row(&self.tables.read().strings, token, Token::USER_STRING, "user string")
            .map_err(|_| ResolutionError::MissingString(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_types_derive_from_exception() {
        let a = Assemblies::new();
        let overflow = a.resolve_type(a.fault_token(FaultKind::Overflow), &Default::default()).unwrap();
        let exception = a.resolve_type(a.exception_token(), &Default::default()).unwrap();
        assert_eq!(overflow.name, "System.OverflowException");
        assert!(a.is_assignable(overflow.handle, exception.handle));
        assert!(!a.is_assignable(exception.handle, overflow.handle));
    }

    #[test]
    fn test_wrong_table() {
        let a = Assemblies::new();
        let s = a.define_string("hi");
        assert!(matches!(
            a.resolve_method(s, &Default::default()),
            Err(ResolutionError::WrongTable { .. })
        ));
        assert_eq!(a.user_string(&Default::default(), s).unwrap(), "hi");
    }

    #[test]
    fn test_virtual_override_walks_bases() {
        let a = Assemblies::new();
        let base = a.define_type("Animal", ValueKind::Object, None);
        let derived = a.define_type("Dog", ValueKind::Object, Some(base));
        let puppy = a.define_type("Puppy", ValueKind::Object, Some(derived));
        let speak = a.declare_method(base, "Speak", MethodSignature::new_instance(vec![], Some(ValueKind::I4)), true);
        let bark = a.declare_method(derived, "Speak", MethodSignature::new_instance(vec![], Some(ValueKind::I4)), true);
        a.override_method(speak, derived, bark).unwrap();

        let speak = a.method(speak).unwrap();
        let puppy = a.resolve_type(puppy, &Default::default()).unwrap();
        let target = a.resolve_virtual(&speak, puppy.handle).unwrap();
        assert_eq!(Token::new(Token::METHOD_DEF, target.handle.0), bark);
    }

    #[test]
    fn test_method_lookups_are_counted() {
        let a = Assemblies::new();
        let before = a.method_lookups();
        a.method(a.core().object_ctor).unwrap();
        assert_eq!(a.method_lookups(), before + 1);
    }
}
