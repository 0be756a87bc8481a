//! Approximate JVM value types.
//!
//! Bytecode only tells us a little about the types of the values it manipulates: `iload` reads
//! *something* that fits in an `int` slot, `aload` reads *some* reference, and `iconst_1` may well
//! be a `boolean`. Instead of guessing early, every value carries a range of possible types that
//! gets narrowed as more uses are discovered. A range is written `<bottom, top>`:
//!
//! - `bottom` is the most general type the value may be declared as,
//! - `top` is the most specific type the value is known to have.
//!
//! `unknown` in either position means the bound is absent. So `<int, unknown>` is "anything that
//! can be assigned to `int`", `<unknown, String>` is "a `String`, possibly declared as one of its
//! supertypes", and `<unknown, unknown>` carries no information at all.
//!
//! Two ranges describing the same value are combined with [`Type::intersect`], which narrows the
//! bottom via [`specialize`] (the most general common subtype) and widens the top via
//! [`generalize`] (the least general common supertype). If the resulting top is not assignable to
//! the resulting bottom, the value has no consistent type and the result is the absorbing `error`
//! type.
//!
//! The integral family has two pseudo-types that do not exist in the source language: "boolean or
//! int" and "boolean or byte". The JVM treats `boolean` as a kind of `int` (and `boolean[]` shares
//! `baload` with `byte[]`), so the constants `0` and `1` and the elements of such arrays start out
//! typed by these pseudo-types and get resolved when a use pins them down.

mod descriptor;
mod hierarchy;
mod lattice;

pub use self::descriptor::{
    DescriptorError, MethodTypes, parse_class_operand, parse_field_descriptor,
    parse_method_descriptor,
};
pub use self::hierarchy::{
    BasicHierarchy, CLONEABLE, ClassHierarchy, ClassInfo, FlatHierarchy, OBJECT, SERIALIZABLE,
    STRING, THROWABLE, interface_closure, is_subclass, superclass_chain,
};
pub use self::lattice::{generalize, is_assignable, specialize};
use core::fmt::{self, Display};

/// A single point of the type hierarchy.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SimpleType {
    Unknown,
    Error,
    Void,
    Null,
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    /// Either `boolean` or any of `byte`, `char`, `short`, `int`.
    BoolInt,
    /// Either `boolean` or `byte`.
    BoolByte,
    Long,
    Float,
    Double,
    Array(Box<SimpleType>),
    Class(ClassType),
}

/// A reference to an object of `class` (or a subclass) that additionally implements all of
/// `interfaces`.
///
/// Interfaces are never stored in `class`: an interface type `I` is `{Object, [I]}`. The interface
/// list is kept sorted and minimal, i.e. it contains neither interfaces `class` already implements
/// nor superinterfaces of other list members, so that structurally equal values denote equal
/// types.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassType {
    pub class: String,
    pub interfaces: Vec<String>,
}

impl ClassType {
    pub fn object() -> Self {
        Self {
            class: OBJECT.to_string(),
            interfaces: Vec::new(),
        }
    }

    /// The type of a class or interface given by its internal name.
    pub fn named(name: &str, hierarchy: &dyn ClassHierarchy) -> Self {
        if hierarchy.is_interface(name) {
            Self {
                class: OBJECT.to_string(),
                interfaces: vec![name.to_string()],
            }
        } else {
            Self {
                class: name.to_string(),
                interfaces: Vec::new(),
            }
        }
    }

    /// The internal name that best represents this type in a declaration.
    pub fn declared_name(&self) -> &str {
        if self.class == OBJECT
            && let Some(interface) = self.interfaces.first()
        {
            interface
        } else {
            &self.class
        }
    }
}

impl SimpleType {
    pub fn class(name: &str, hierarchy: &dyn ClassHierarchy) -> Self {
        Self::Class(ClassType::named(name, hierarchy))
    }

    pub fn object() -> Self {
        Self::Class(ClassType::object())
    }

    pub fn array(element: SimpleType) -> Self {
        Self::Array(Box::new(element))
    }

    /// The number of operand stack slots a value of this type occupies.
    pub fn stack_size(&self) -> usize {
        match self {
            Self::Void | Self::Error => 0,
            Self::Long | Self::Double => 2,
            _ => 1,
        }
    }

    pub fn is_integral(&self) -> bool {
        integral_mask(self).is_some()
    }

    /// Whether this is a reference type (including `null`).
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Null | Self::Array(_) | Self::Class(_))
    }

    pub fn is_pseudo(&self) -> bool {
        matches!(self, Self::BoolInt | Self::BoolByte)
    }

    /// Whether a variable can be declared with this type in source code.
    pub fn is_declarable(&self) -> bool {
        match self {
            Self::Unknown | Self::Error | Self::Void | Self::Null => false,
            Self::BoolInt | Self::BoolByte => false,
            Self::Array(element) => element.is_declarable(),
            _ => true,
        }
    }
}

// Each integral type is identified with the set of real integral types assignable to it. Subtyping
// is then set inclusion, and specialization is set intersection.
pub(crate) const Z: u8 = 1;
pub(crate) const B: u8 = 2;
pub(crate) const C: u8 = 4;
pub(crate) const S: u8 = 8;
pub(crate) const I: u8 = 16;

pub(crate) fn integral_mask(ty: &SimpleType) -> Option<u8> {
    Some(match ty {
        SimpleType::Boolean => Z,
        SimpleType::Byte => B,
        SimpleType::Char => C,
        SimpleType::Short => B | S,
        SimpleType::Int => B | C | S | I,
        SimpleType::BoolByte => Z | B,
        SimpleType::BoolInt => Z | B | C | S | I,
        _ => return None,
    })
}

pub(crate) const INTEGRAL_TYPES: [SimpleType; 7] = [
    SimpleType::Boolean,
    SimpleType::Byte,
    SimpleType::Char,
    SimpleType::Short,
    SimpleType::BoolByte,
    SimpleType::Int,
    SimpleType::BoolInt,
];

pub(crate) fn integral_from_mask(mask: u8) -> Option<SimpleType> {
    INTEGRAL_TYPES
        .iter()
        .find(|ty| integral_mask(ty) == Some(mask))
        .cloned()
}

impl Display for SimpleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "<unknown>"),
            Self::Error => write!(f, "<error>"),
            Self::Void => write!(f, "void"),
            Self::Null => write!(f, "null"),
            Self::Boolean => write!(f, "boolean"),
            Self::Byte => write!(f, "byte"),
            Self::Char => write!(f, "char"),
            Self::Short => write!(f, "short"),
            Self::Int => write!(f, "int"),
            Self::BoolInt => write!(f, "<boolean or int>"),
            Self::BoolByte => write!(f, "<boolean or byte>"),
            Self::Long => write!(f, "long"),
            Self::Float => write!(f, "float"),
            Self::Double => write!(f, "double"),
            Self::Array(element) => write!(f, "{element}[]"),
            Self::Class(class) => {
                write!(f, "{}", class.class.replace('/', "."))?;
                for interface in &class.interfaces {
                    write!(f, " & {}", interface.replace('/', "."))?;
                }
                Ok(())
            }
        }
    }
}

/// A range of possible types of a value, see the module documentation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Type {
    bottom: SimpleType,
    top: SimpleType,
}

impl Type {
    pub const ERROR: Type = Type {
        bottom: SimpleType::Error,
        top: SimpleType::Error,
    };

    pub const UNKNOWN: Type = Type {
        bottom: SimpleType::Unknown,
        top: SimpleType::Unknown,
    };

    pub const VOID: Type = Type {
        bottom: SimpleType::Void,
        top: SimpleType::Void,
    };

    /// The exact type `ty`.
    pub fn simple(ty: SimpleType) -> Self {
        Self {
            bottom: ty.clone(),
            top: ty,
        }
    }

    /// All values assignable to `ty`.
    pub fn subtypes_of(ty: SimpleType) -> Self {
        Self {
            bottom: ty,
            top: SimpleType::Unknown,
        }
    }

    /// A value of type `ty`, declared as `ty` or any of its supertypes.
    pub fn supertypes_of(ty: SimpleType) -> Self {
        Self {
            bottom: SimpleType::Unknown,
            top: ty,
        }
    }

    /// Something stored in an `int` slot: `boolean`, `byte`, `char`, `short` or `int`.
    pub fn int_slot() -> Self {
        Self::subtypes_of(SimpleType::BoolInt)
    }

    /// Any reference, including arrays and `null`.
    pub fn any_reference() -> Self {
        Self::subtypes_of(SimpleType::object())
    }

    pub fn null() -> Self {
        Self {
            bottom: SimpleType::object(),
            top: SimpleType::Null,
        }
    }

    /// The type of an integer literal.
    pub fn int_constant(value: i32) -> Self {
        match value {
            0 | 1 => Self::int_slot(),
            _ => Self::subtypes_of(SimpleType::Int),
        }
    }

    /// Builds `<bottom, top>`, or `error` if no type fits the range.
    pub fn range(bottom: SimpleType, top: SimpleType, hierarchy: &dyn ClassHierarchy) -> Self {
        if bottom == SimpleType::Error || top == SimpleType::Error {
            return Self::ERROR;
        }
        if !is_assignable(&top, &bottom, hierarchy) {
            return Self::ERROR;
        }
        Self { bottom, top }.normalized()
    }

    fn normalized(self) -> Self {
        if self.bottom == self.top {
            return self;
        }

        // Ranges with a single possible member collapse to that member.
        for ty in [&self.bottom, &self.top] {
            if matches!(
                ty,
                SimpleType::Long | SimpleType::Float | SimpleType::Double | SimpleType::Void
            ) {
                return Self::simple(ty.clone());
            }
        }

        let (bottom_mask, top_mask) = (integral_mask(&self.bottom), integral_mask(&self.top));
        if bottom_mask.is_some() || top_mask.is_some() {
            let bottom_mask = bottom_mask.unwrap_or(Z | B | C | S | I);
            let members: Vec<&SimpleType> = [
                SimpleType::Boolean,
                SimpleType::Byte,
                SimpleType::Char,
                SimpleType::Short,
                SimpleType::Int,
            ]
            .iter()
            .filter(|ty| {
                let mask = integral_mask(ty).unwrap_or(0);
                mask & !bottom_mask == 0 && top_mask.is_none_or(|top| top & !mask == 0)
            })
            .collect();
            if let [single] = members[..] {
                return Self::simple(single.clone());
            }
        }

        self
    }

    pub fn bottom(&self) -> &SimpleType {
        &self.bottom
    }

    pub fn top(&self) -> &SimpleType {
        &self.top
    }

    pub fn is_error(&self) -> bool {
        self.bottom == SimpleType::Error
    }

    pub fn is_void(&self) -> bool {
        self.bottom == SimpleType::Void
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }

    /// Whether the value may be a `boolean`.
    pub fn admits_boolean(&self, hierarchy: &dyn ClassHierarchy) -> bool {
        !self
            .intersect_quietly(&Type::simple(SimpleType::Boolean), hierarchy)
            .is_error()
    }

    /// The stack size of values of this type, assuming at least one bound is concrete.
    pub fn stack_size(&self) -> usize {
        match (&self.bottom, &self.top) {
            (SimpleType::Unknown, top) => top.stack_size(),
            (bottom, _) => bottom.stack_size(),
        }
    }

    /// Intersects two ranges describing the same value.
    ///
    /// Conflicts are not fatal: they are logged, and the caller is expected to fall back to a wider
    /// type of its choosing.
    #[must_use]
    pub fn intersect(&self, other: &Type, hierarchy: &dyn ClassHierarchy) -> Type {
        let result = self.intersect_quietly(other, hierarchy);
        if result.is_error() && !self.is_error() && !other.is_error() {
            log::debug!("type conflict: intersecting {self} and {other} yields <error>");
        }
        result
    }

    fn intersect_quietly(&self, other: &Type, hierarchy: &dyn ClassHierarchy) -> Type {
        if self.is_error() || other.is_error() {
            return Self::ERROR;
        }
        let bottom = specialize(&self.bottom, &other.bottom, hierarchy);
        let top = generalize(&self.top, &other.top, hierarchy);
        Self::range(bottom, top, hierarchy)
    }

    /// Intersects, degrading to the wider of the two operands on conflict.
    #[must_use]
    pub fn intersect_or_widen(&self, other: &Type, hierarchy: &dyn ClassHierarchy) -> Type {
        let result = self.intersect(other, hierarchy);
        if result.is_error() {
            self.widest(other, hierarchy)
        } else {
            result
        }
    }

    /// The smallest range containing both operands, `unknown` if there is none.
    #[must_use]
    pub fn widest(&self, other: &Type, hierarchy: &dyn ClassHierarchy) -> Type {
        let bottom = generalize(&self.bottom, &other.bottom, hierarchy);
        let top = specialize(&self.top, &other.top, hierarchy);
        // A widened bound that doesn't exist means the corresponding constraint is dropped.
        let bottom = if bottom == SimpleType::Error {
            SimpleType::Unknown
        } else {
            bottom
        };
        let top = if top == SimpleType::Error {
            SimpleType::Unknown
        } else {
            top
        };
        let result = Self::range(bottom, top, hierarchy);
        if result.is_error() {
            Self::UNKNOWN
        } else {
            result
        }
    }

    /// The most specific type implied by this range, used when the value has to be declared.
    pub fn hint(&self) -> SimpleType {
        if self.is_error() {
            return SimpleType::Error;
        }
        match &self.top {
            SimpleType::Null | SimpleType::Unknown => {}
            top if top.is_declarable() => return top.clone(),
            _ => {}
        }
        match &self.bottom {
            SimpleType::BoolInt => SimpleType::Int,
            SimpleType::BoolByte => SimpleType::Byte,
            SimpleType::Unknown | SimpleType::Null => SimpleType::object(),
            bottom => bottom.clone(),
        }
    }
}

impl From<SimpleType> for Type {
    fn from(ty: SimpleType) -> Self {
        Self::simple(ty)
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bottom == self.top {
            write!(f, "{}", self.bottom)
        } else {
            write!(f, "<{}, {}>", self.bottom, self.top)
        }
    }
}
