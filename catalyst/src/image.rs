// image.rs - Bootstrap image
//
// A minimal object memory with a handful of demo methods, enough to drive
// the interpreter, the hotness trigger and the translation pipeline from
// the CLI and the integration tests.

use crate::object::{Method, MethodHeader, ObjectMemory, Value};

/// Demo methods installed on SmallInteger, as (selector, bytecodes, literals)
fn small_integer_methods() -> Vec<(&'static str, Vec<u8>, Vec<Value>)> {
    let int = Value::SmallInteger;
    vec![
        // ^self * self
        ("squared", vec![0x70, 0x70, 0xb8, 0x7c], vec![]),
        // ^self + 42
        ("plusFortyTwo", vec![0x70, 0x20, 0xb0, 0x7c], vec![int(42)]),
        // ^self * self + (3 * self) + 7
        (
            "polynomial",
            vec![0x70, 0x70, 0xb8, 0x20, 0x70, 0xb8, 0xb0, 0x21, 0xb0, 0x7c],
            vec![int(3), int(7)],
        ),
        // ^self > 1000
        ("isLarge", vec![0x70, 0x20, 0xb3, 0x7c], vec![int(1000)]),
        // ^self \\ 7
        ("mod7", vec![0x70, 0x20, 0xba, 0x7c], vec![int(7)]),
        // ^self squared squared
        (
            "fourth",
            vec![0x70, 0xd0, 0xd0, 0x7c],
            vec![Value::symbol("squared")],
        ),
    ]
}

/// Build the bootstrap object memory
pub fn boot() -> ObjectMemory {
    let mut memory = ObjectMemory::new();
    let known = memory.known();

    for (selector, bytecodes, literals) in small_integer_methods() {
        let method = Method::new(selector, MethodHeader::default(), bytecodes, literals);
        memory.add_method(known.small_integer, method);
    }

    let point = memory.define_class("Point", Some(known.object), 2);
    // Field readers: the reference result runs on a SmallInteger receiver,
    // so these only exercise the OracleUnavailable path
    // ^x + y
    memory.add_method(
        point,
        Method::new("sum", MethodHeader::default(), vec![0x00, 0x01, 0xb0, 0x7c], vec![]),
    );
    // ^x
    memory.add_method(
        point,
        Method::new("x", MethodHeader::default(), vec![0x00, 0x7c], vec![]),
    );

    memory
}

/// Allocate a Point
pub fn point(memory: &mut ObjectMemory, x: i32, y: i32) -> Option<Value> {
    let class = memory.class_named("Point")?;
    Some(memory.instantiate(class, vec![Value::SmallInteger(x), Value::SmallInteger(y)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, Limits};
    use crate::interpreter::{Vm, VmConfig};
    use crate::table::MethodTable;
    use std::sync::Arc;

    #[test]
    fn test_boot_methods_run() {
        let vm = Vm::new(boot(), Arc::new(MethodTable::new()), VmConfig::default());
        let int = Value::SmallInteger;
        assert_eq!(vm.send(int(100), "squared", vec![]).unwrap(), int(10000));
        assert_eq!(vm.send(int(100), "polynomial", vec![]).unwrap(), int(10307));
        assert_eq!(vm.send(int(100), "isLarge", vec![]).unwrap(), Value::False);
        assert_eq!(vm.send(int(100), "mod7", vec![]).unwrap(), int(2));
        assert_eq!(vm.send(int(3), "fourth", vec![]).unwrap(), int(81));

        let p = vm.with_memory(|m| point(m, 3, 4)).unwrap();
        assert_eq!(vm.send(p, "sum", vec![]).unwrap(), int(7));
    }

    #[test]
    fn test_only_leaf_methods_are_eligible() {
        let memory = boot();
        let limits = Limits::default();
        for (class, method) in memory.methods() {
            let eligible = classify(method.bytecodes(), &limits).eligible;
            let expected = method.selector() != "fourth";
            assert_eq!(eligible, expected, "{class}>>{}", method.selector());
        }
    }
}
