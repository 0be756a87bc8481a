use rustc_hash::{FxHashMap, FxHashSet};

pub const OBJECT: &str = "java/lang/Object";
pub const CLONEABLE: &str = "java/lang/Cloneable";
pub const SERIALIZABLE: &str = "java/io/Serializable";
pub const STRING: &str = "java/lang/String";
pub const THROWABLE: &str = "java/lang/Throwable";

// Malformed or adversarial class files can describe cyclic hierarchies. Every walk is capped so
// that a cycle degrades to "unrelated" instead of hanging.
const MAX_HIERARCHY_DEPTH: usize = 256;

/// Read-only class metadata consulted by the type lattice.
///
/// Classes the implementation knows nothing about are treated as direct subclasses of
/// `java/lang/Object` implementing no interfaces.
pub trait ClassHierarchy {
    /// The direct superclass of `class`, `None` for `java/lang/Object` and for interfaces.
    fn superclass(&self, class: &str) -> Option<&str>;

    /// The interfaces `class` directly implements (or extends, if `class` is an interface).
    fn interfaces(&self, class: &str) -> &[String];

    fn is_interface(&self, class: &str) -> bool;
}

#[derive(Clone, Debug, Default)]
pub struct ClassInfo {
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
    pub is_interface: bool,
}

/// A hierarchy backed by a hash map, prepopulated with the handful of core classes whose
/// relationships show up in virtually every method body.
#[derive(Clone, Debug)]
pub struct BasicHierarchy {
    classes: FxHashMap<String, ClassInfo>,
}

impl BasicHierarchy {
    pub fn new() -> Self {
        let mut hierarchy = Self::empty();

        for interface in [
            CLONEABLE,
            SERIALIZABLE,
            "java/lang/Comparable",
            "java/lang/CharSequence",
            "java/lang/Runnable",
            "java/lang/Iterable",
            "java/lang/AutoCloseable",
        ] {
            hierarchy.add_interface(interface, &[]);
        }
        hierarchy.add_interface("java/io/Closeable", &["java/lang/AutoCloseable"]);
        hierarchy.add_interface("java/util/Collection", &["java/lang/Iterable"]);
        hierarchy.add_interface("java/util/List", &["java/util/Collection"]);
        hierarchy.add_interface("java/util/Set", &["java/util/Collection"]);
        hierarchy.add_interface("java/util/Map", &[]);

        hierarchy.add_class(
            STRING,
            OBJECT,
            &[
                SERIALIZABLE,
                "java/lang/Comparable",
                "java/lang/CharSequence",
            ],
        );
        hierarchy.add_class(
            "java/lang/AbstractStringBuilder",
            OBJECT,
            &["java/lang/CharSequence"],
        );
        hierarchy.add_class(
            "java/lang/StringBuilder",
            "java/lang/AbstractStringBuilder",
            &[SERIALIZABLE],
        );
        hierarchy.add_class(
            "java/lang/StringBuffer",
            "java/lang/AbstractStringBuilder",
            &[SERIALIZABLE],
        );
        hierarchy.add_class("java/lang/Class", OBJECT, &[SERIALIZABLE]);
        hierarchy.add_class(THROWABLE, OBJECT, &[SERIALIZABLE]);
        hierarchy.add_class("java/lang/Exception", THROWABLE, &[]);
        hierarchy.add_class("java/lang/Error", THROWABLE, &[]);
        hierarchy.add_class("java/lang/RuntimeException", "java/lang/Exception", &[]);
        hierarchy.add_class(
            "java/lang/NullPointerException",
            "java/lang/RuntimeException",
            &[],
        );
        hierarchy.add_class(
            "java/lang/IllegalArgumentException",
            "java/lang/RuntimeException",
            &[],
        );
        hierarchy.add_class(
            "java/lang/IllegalStateException",
            "java/lang/RuntimeException",
            &[],
        );
        hierarchy.add_class("java/io/IOException", "java/lang/Exception", &[]);
        hierarchy.add_class("java/lang/Number", OBJECT, &[SERIALIZABLE]);
        for boxed in [
            "java/lang/Byte",
            "java/lang/Short",
            "java/lang/Integer",
            "java/lang/Long",
            "java/lang/Float",
            "java/lang/Double",
        ] {
            hierarchy.add_class(boxed, "java/lang/Number", &["java/lang/Comparable"]);
        }
        hierarchy.add_class(
            "java/lang/Boolean",
            OBJECT,
            &[SERIALIZABLE, "java/lang/Comparable"],
        );
        hierarchy.add_class(
            "java/lang/Character",
            OBJECT,
            &[SERIALIZABLE, "java/lang/Comparable"],
        );
        hierarchy.add_class("java/util/AbstractCollection", OBJECT, &["java/util/Collection"]);
        hierarchy.add_class(
            "java/util/AbstractList",
            "java/util/AbstractCollection",
            &["java/util/List"],
        );
        hierarchy.add_class(
            "java/util/ArrayList",
            "java/util/AbstractList",
            &["java/util/List", CLONEABLE, SERIALIZABLE],
        );

        hierarchy
    }

    /// A hierarchy that only knows `java/lang/Object`.
    pub fn empty() -> Self {
        let mut classes = FxHashMap::default();
        classes.insert(OBJECT.to_string(), ClassInfo::default());
        Self { classes }
    }

    pub fn add_class(&mut self, name: &str, superclass: &str, interfaces: &[&str]) {
        self.insert(
            name,
            ClassInfo {
                superclass: Some(superclass.to_string()),
                interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
                is_interface: false,
            },
        );
    }

    pub fn add_interface(&mut self, name: &str, superinterfaces: &[&str]) {
        self.insert(
            name,
            ClassInfo {
                superclass: None,
                interfaces: superinterfaces.iter().map(|s| s.to_string()).collect(),
                is_interface: true,
            },
        );
    }

    pub fn insert(&mut self, name: &str, info: ClassInfo) {
        self.classes.insert(name.to_string(), info);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }
}

impl Default for BasicHierarchy {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassHierarchy for BasicHierarchy {
    fn superclass(&self, class: &str) -> Option<&str> {
        if class == OBJECT {
            return None;
        }
        match self.classes.get(class) {
            Some(info) if info.is_interface => None,
            Some(info) => Some(info.superclass.as_deref().unwrap_or(OBJECT)),
            None => Some(OBJECT),
        }
    }

    fn interfaces(&self, class: &str) -> &[String] {
        self.classes
            .get(class)
            .map(|info| info.interfaces.as_slice())
            .unwrap_or(&[])
    }

    fn is_interface(&self, class: &str) -> bool {
        self.classes
            .get(class)
            .is_some_and(|info| info.is_interface)
    }
}

/// A hierarchy that knows no classes at all. Enough for anything that only cares about the shape
/// of types, such as operand stack sizes.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlatHierarchy;

impl ClassHierarchy for FlatHierarchy {
    fn superclass(&self, class: &str) -> Option<&str> {
        (class != OBJECT).then_some(OBJECT)
    }

    fn interfaces(&self, _class: &str) -> &[String] {
        &[]
    }

    fn is_interface(&self, _class: &str) -> bool {
        false
    }
}

/// The superclass chain of `class`, starting with `class` itself and ending with
/// `java/lang/Object`.
pub fn superclass_chain<'a>(hierarchy: &'a dyn ClassHierarchy, class: &'a str) -> Vec<&'a str> {
    let mut chain = vec![class];
    let mut current = class;
    while let Some(superclass) = hierarchy.superclass(current) {
        if chain.len() >= MAX_HIERARCHY_DEPTH || chain.contains(&superclass) {
            log::debug!("class hierarchy of {class} is cyclic or too deep");
            break;
        }
        chain.push(superclass);
        current = superclass;
    }
    if *chain.last().unwrap_or(&OBJECT) != OBJECT {
        chain.push(OBJECT);
    }
    chain
}

pub fn is_subclass(hierarchy: &dyn ClassHierarchy, sub: &str, sup: &str) -> bool {
    sup == OBJECT || superclass_chain(hierarchy, sub).contains(&sup)
}

/// All interfaces implemented by `class` or by any of `extra`, including superinterfaces and
/// interfaces inherited from superclasses.
pub fn interface_closure(
    hierarchy: &dyn ClassHierarchy,
    class: &str,
    extra: &[String],
) -> FxHashSet<String> {
    let mut result = FxHashSet::default();
    let mut stack: Vec<String> = extra.to_vec();
    for ancestor in superclass_chain(hierarchy, class) {
        stack.extend(hierarchy.interfaces(ancestor).iter().cloned());
    }
    while let Some(interface) = stack.pop() {
        if result.len() >= MAX_HIERARCHY_DEPTH {
            break;
        }
        if result.insert(interface.clone()) {
            stack.extend(hierarchy.interfaces(&interface).iter().cloned());
        }
    }
    result
}
