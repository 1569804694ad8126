// object.rs - Object model
//
// Values, classes, methods and the object memory they live in. Methods are
// shared as `Arc<Method>` and compared by identity (`MethodId`), never by
// content: two methods with identical bytecode are distinct.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// A Smalltalk value
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Value {
    #[default]
    Nil,
    True,
    False,
    SmallInteger(i32),
    Symbol(Arc<str>),
    Object(ObjectId),
}

impl Value {
    pub fn boolean(value: bool) -> Value {
        if value {
            Value::True
        } else {
            Value::False
        }
    }

    pub fn symbol(name: &str) -> Value {
        Value::Symbol(Arc::from(name))
    }

    pub fn as_small_integer(&self) -> Option<i32> {
        match self {
            Value::SmallInteger(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::True => write!(f, "true"),
            Value::False => write!(f, "false"),
            Value::SmallInteger(v) => write!(f, "{v}"),
            Value::Symbol(s) => write!(f, "#{s}"),
            Value::Object(id) => write!(f, "object@{}", id.0),
        }
    }
}

/// Index of a heap object in the object memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u32);

/// Index of a class in the object memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

/// Identity of a method, unique for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(u64);

impl MethodId {
    fn next() -> MethodId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        MethodId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Method header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodHeader {
    pub num_args: u8,
    pub num_temps: u8,
}

/// A compiled method: immutable bytecode, literals and header, plus the
/// index of its compiled routine in the method table (0 = none)
#[derive(Debug)]
pub struct Method {
    id: MethodId,
    selector: String,
    header: MethodHeader,
    bytecodes: Vec<u8>,
    literals: Vec<Value>,
    compiled_slot: AtomicU32,
}

pub type MethodRef = Arc<Method>;

impl Method {
    pub fn new(
        selector: &str,
        header: MethodHeader,
        bytecodes: Vec<u8>,
        literals: Vec<Value>,
    ) -> MethodRef {
        Arc::new(Method {
            id: MethodId::next(),
            selector: selector.to_string(),
            header,
            bytecodes,
            literals,
            compiled_slot: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn header(&self) -> MethodHeader {
        self.header
    }

    pub fn bytecodes(&self) -> &[u8] {
        &self.bytecodes
    }

    pub fn literals(&self) -> &[Value] {
        &self.literals
    }

    /// Slot of the compiled routine, 0 if the method is interpreted
    pub fn compiled_slot(&self) -> u32 {
        self.compiled_slot.load(Ordering::Acquire)
    }

    /// Only the method table writes this field
    pub(crate) fn set_compiled_slot(&self, slot: u32) {
        self.compiled_slot.store(slot, Ordering::Release);
    }
}

/// A class: name, optional superclass, instance size and method dictionary
#[derive(Debug, Clone)]
pub struct Class {
    pub name: String,
    pub superclass: Option<ClassId>,
    pub inst_size: usize,
    pub methods: HashMap<String, MethodRef>,
}

/// A heap object with named fields
#[derive(Debug, Clone)]
pub struct Object {
    pub class: ClassId,
    pub fields: Vec<Value>,
}

/// Well-known classes created by every object memory
#[derive(Debug, Clone, Copy)]
pub struct KnownClasses {
    pub object: ClassId,
    pub undefined_object: ClassId,
    pub true_class: ClassId,
    pub false_class: ClassId,
    pub small_integer: ClassId,
    pub symbol: ClassId,
}

/// Classes and heap objects
#[derive(Debug, Clone)]
pub struct ObjectMemory {
    classes: Vec<Class>,
    objects: Vec<Object>,
    known: KnownClasses,
}

impl Default for ObjectMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectMemory {
    pub fn new() -> Self {
        let mut memory = ObjectMemory {
            classes: Vec::new(),
            objects: Vec::new(),
            known: KnownClasses {
                object: ClassId(0),
                undefined_object: ClassId(0),
                true_class: ClassId(0),
                false_class: ClassId(0),
                small_integer: ClassId(0),
                symbol: ClassId(0),
            },
        };

        let object = memory.define_class("Object", None, 0);
        memory.known = KnownClasses {
            object,
            undefined_object: memory.define_class("UndefinedObject", Some(object), 0),
            true_class: memory.define_class("True", Some(object), 0),
            false_class: memory.define_class("False", Some(object), 0),
            small_integer: memory.define_class("SmallInteger", Some(object), 0),
            symbol: memory.define_class("Symbol", Some(object), 0),
        };
        memory
    }

    pub fn known(&self) -> KnownClasses {
        self.known
    }

    pub fn define_class(&mut self, name: &str, superclass: Option<ClassId>, inst_size: usize) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(Class {
            name: name.to_string(),
            superclass,
            inst_size,
            methods: HashMap::new(),
        });
        id
    }

    pub fn class(&self, id: ClassId) -> &Class {
        &self.classes[id.0 as usize]
    }

    pub fn class_named(&self, name: &str) -> Option<ClassId> {
        self.classes
            .iter()
            .position(|c| c.name == name)
            .map(|i| ClassId(i as u32))
    }

    /// Install `method` in the class's method dictionary under its selector
    pub fn add_method(&mut self, class: ClassId, method: MethodRef) {
        let selector = method.selector().to_string();
        self.classes[class.0 as usize].methods.insert(selector, method);
    }

    /// Allocate an instance with the given field values
    pub fn instantiate(&mut self, class: ClassId, fields: Vec<Value>) -> Value {
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(Object { class, fields });
        Value::Object(id)
    }

    pub fn object(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(id.0 as usize)
    }

    /// Field values of a heap object; empty for immediates
    pub fn fields_of(&self, value: &Value) -> Vec<Value> {
        match value {
            Value::Object(id) => self
                .object(*id)
                .map(|o| o.fields.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub fn class_of(&self, value: &Value) -> ClassId {
        match value {
            Value::Nil => self.known.undefined_object,
            Value::True => self.known.true_class,
            Value::False => self.known.false_class,
            Value::SmallInteger(_) => self.known.small_integer,
            Value::Symbol(_) => self.known.symbol,
            Value::Object(id) => self
                .object(*id)
                .map(|o| o.class)
                .unwrap_or(self.known.object),
        }
    }

    /// Look `selector` up along the class chain of `value`
    pub fn lookup(&self, value: &Value, selector: &str) -> Option<MethodRef> {
        let mut class = Some(self.class_of(value));
        while let Some(id) = class {
            let c = self.class(id);
            if let Some(method) = c.methods.get(selector) {
                return Some(method.clone());
            }
            class = c.superclass;
        }
        None
    }

    /// Find a method by class name and selector
    pub fn method(&self, class_name: &str, selector: &str) -> Option<MethodRef> {
        let class = self.class_named(class_name)?;
        self.class(class).methods.get(selector).cloned()
    }

    /// All methods, in class order
    pub fn methods(&self) -> Vec<(String, MethodRef)> {
        let mut all = Vec::new();
        for class in &self.classes {
            let mut selectors: Vec<&String> = class.methods.keys().collect();
            selectors.sort();
            for selector in selectors {
                all.push((class.name.clone(), class.methods[selector].clone()));
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_identity() {
        let a = Method::new("squared", MethodHeader::default(), vec![0x70, 0x70, 0xb8, 0x7c], vec![]);
        let b = Method::new("squared", MethodHeader::default(), vec![0x70, 0x70, 0xb8, 0x7c], vec![]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.compiled_slot(), 0);
    }

    #[test]
    fn test_lookup_walks_superclasses() {
        let mut memory = ObjectMemory::new();
        let object = memory.known().object;
        let method = Method::new("yourself", MethodHeader::default(), vec![0x7d], vec![]);
        memory.add_method(object, method.clone());

        let found = memory.lookup(&Value::SmallInteger(3), "yourself").unwrap();
        assert_eq!(found.id(), method.id());
        assert!(memory.lookup(&Value::Nil, "missing").is_none());
    }

    #[test]
    fn test_instances_and_fields() {
        let mut memory = ObjectMemory::new();
        let object = memory.known().object;
        let point = memory.define_class("Point", Some(object), 2);
        let p = memory.instantiate(point, vec![Value::SmallInteger(3), Value::SmallInteger(4)]);

        assert_eq!(memory.class_of(&p), point);
        assert_eq!(memory.fields_of(&p).len(), 2);
        assert!(memory.fields_of(&Value::SmallInteger(1)).is_empty());
    }
}
