use super::hierarchy::{
    CLONEABLE, ClassHierarchy, OBJECT, SERIALIZABLE, interface_closure, is_subclass,
    superclass_chain,
};
use super::{ClassType, SimpleType, integral_from_mask, integral_mask, INTEGRAL_TYPES};

// Arrays implement exactly these two interfaces.
const ARRAY_INTERFACES: [&str; 2] = [CLONEABLE, SERIALIZABLE];

/// Whether a value of type `sub` can be stored in a variable of type `sup`.
///
/// `unknown` is compatible with everything and `error` with nothing.
pub fn is_assignable(sub: &SimpleType, sup: &SimpleType, hierarchy: &dyn ClassHierarchy) -> bool {
    use SimpleType::*;
    match (sub, sup) {
        (Error, _) | (_, Error) => false,
        (Unknown, _) | (_, Unknown) => true,
        _ if sub == sup => true,
        (Null, Array(_) | Class(_)) => true,
        (Array(sub_element), Array(sup_element)) => {
            if sub_element.is_reference() && sup_element.is_reference() {
                is_assignable(sub_element, sup_element, hierarchy)
            } else {
                sub_element == sup_element
            }
        }
        (Array(_), Class(sup)) => {
            sup.class == OBJECT
                && sup
                    .interfaces
                    .iter()
                    .all(|interface| ARRAY_INTERFACES.contains(&interface.as_str()))
        }
        (Class(sub), Class(sup)) => {
            if !is_subclass(hierarchy, &sub.class, &sup.class) {
                return false;
            }
            if sup.interfaces.is_empty() {
                return true;
            }
            let implemented = interface_closure(hierarchy, &sub.class, &sub.interfaces);
            sup.interfaces
                .iter()
                .all(|interface| implemented.contains(interface))
        }
        _ => match (integral_mask(sub), integral_mask(sup)) {
            (Some(sub), Some(sup)) => sub & !sup == 0,
            _ => false,
        },
    }
}

/// The most general type that is a subtype of both `a` and `b`.
///
/// Two unrelated reference types still share `null` as a common subtype. This keeps the operation
/// associative; a conflict then surfaces once a range gets a concrete top.
pub fn specialize(a: &SimpleType, b: &SimpleType, hierarchy: &dyn ClassHierarchy) -> SimpleType {
    use SimpleType::*;
    match (a, b) {
        (Error, _) | (_, Error) => Error,
        (Unknown, other) | (other, Unknown) => other.clone(),
        _ if a == b => a.clone(),
        (Null, other) | (other, Null) => {
            if other.is_reference() {
                Null
            } else {
                Error
            }
        }
        (Class(a), Class(b)) => {
            let class = if is_subclass(hierarchy, &a.class, &b.class) {
                &a.class
            } else if is_subclass(hierarchy, &b.class, &a.class) {
                &b.class
            } else {
                return Null;
            };
            let interfaces: Vec<String> =
                a.interfaces.iter().chain(&b.interfaces).cloned().collect();
            Class(minimize(class, interfaces, hierarchy))
        }
        (Array(a_element), Array(b_element)) => {
            if a_element.is_reference() && b_element.is_reference() {
                match specialize(a_element, b_element, hierarchy) {
                    Null => Null,
                    element => SimpleType::array(element),
                }
            } else {
                Null
            }
        }
        (array @ Array(_), class @ Class(_)) | (class @ Class(_), array @ Array(_)) => {
            if is_assignable(array, class, hierarchy) {
                array.clone()
            } else {
                Null
            }
        }
        _ => match (integral_mask(a), integral_mask(b)) {
            (Some(a), Some(b)) => integral_from_mask(a & b).unwrap_or(Error),
            _ => Error,
        },
    }
}

/// The least general type that is a supertype of both `a` and `b`.
///
/// Two unrelated interfaces generalize to the set of interfaces implemented by both, which is not
/// necessarily a single named type.
pub fn generalize(a: &SimpleType, b: &SimpleType, hierarchy: &dyn ClassHierarchy) -> SimpleType {
    use SimpleType::*;
    match (a, b) {
        (Error, _) | (_, Error) => Error,
        (Unknown, other) | (other, Unknown) => other.clone(),
        _ if a == b => a.clone(),
        (Null, other) | (other, Null) => {
            if other.is_reference() {
                other.clone()
            } else {
                Error
            }
        }
        (Class(a), Class(b)) => {
            let b_chain = superclass_chain(hierarchy, &b.class);
            let class = superclass_chain(hierarchy, &a.class)
                .into_iter()
                .find(|ancestor| b_chain.contains(ancestor))
                .unwrap_or(OBJECT);
            let a_interfaces = interface_closure(hierarchy, &a.class, &a.interfaces);
            let b_interfaces = interface_closure(hierarchy, &b.class, &b.interfaces);
            let common = a_interfaces
                .into_iter()
                .filter(|interface| b_interfaces.contains(interface))
                .collect();
            Class(minimize(class, common, hierarchy))
        }
        (Array(a_element), Array(b_element)) => {
            if a_element.is_reference() && b_element.is_reference() {
                SimpleType::array(generalize(a_element, b_element, hierarchy))
            } else {
                array_supertype(&ARRAY_INTERFACES.map(String::from))
            }
        }
        (Array(_), Class(class)) | (Class(class), Array(_)) => {
            let interfaces: Vec<String> =
                interface_closure(hierarchy, &class.class, &class.interfaces)
                    .into_iter()
                    .collect();
            array_supertype(&interfaces)
        }
        _ => match (integral_mask(a), integral_mask(b)) {
            (Some(a), Some(b)) => {
                let union = a | b;
                // The candidates are ordered by increasing size, so the first superset is the
                // least one.
                INTEGRAL_TYPES
                    .iter()
                    .find(|ty| integral_mask(ty).is_some_and(|mask| mask & union == union))
                    .cloned()
                    .unwrap_or(Error)
            }
            _ => Error,
        },
    }
}

// `Object` plus whichever of the array interfaces appear in `interfaces`.
fn array_supertype(interfaces: &[String]) -> SimpleType {
    let mut result: Vec<String> = ARRAY_INTERFACES
        .iter()
        .filter(|interface| interfaces.iter().any(|other| other == *interface))
        .map(|interface| interface.to_string())
        .collect();
    result.sort();
    SimpleType::Class(ClassType {
        class: OBJECT.to_string(),
        interfaces: result,
    })
}

// Drops interfaces implied by `class` or by other interfaces in the list, and sorts the rest.
fn minimize(class: &str, interfaces: Vec<String>, hierarchy: &dyn ClassHierarchy) -> ClassType {
    let implied_by_class = interface_closure(hierarchy, class, &[]);
    let mut result: Vec<String> = interfaces
        .iter()
        .filter(|interface| !implied_by_class.contains(*interface))
        .filter(|interface| {
            !interfaces.iter().any(|other| {
                other != *interface
                    && interface_closure(hierarchy, OBJECT, core::slice::from_ref(other))
                        .contains(*interface)
            })
        })
        .cloned()
        .collect();
    result.sort();
    result.dedup();
    ClassType {
        class: class.to_string(),
        interfaces: result,
    }
}
