//! End-to-end scenarios run against hand-assembled module bytes, covering
//! the engine's externally observable behavior: decode, link, execute to
//! completion or trap.

mod support;

use support::{const_i32_expr, sig, ModuleBuilder, I32};

use wasm_vm::binary::decode_module;
use wasm_vm::engine::Engine;
use wasm_vm::error::{LoadError, TrapKind};
use wasm_vm::linker::link;
use wasm_vm::runner::Runner;
use wasm_vm::value::TaggedValue;

#[test]
fn adds_two_ints() {
    let mut m = ModuleBuilder::new();
    let t = m.add_type(sig(&[], Some(I32)));
    // i32.const 2; i32.const 3; i32.add; end
    let f = m.add_function(t, &[], vec![0x41, 2, 0x41, 3, 0x6a, 0x0b]);
    m.export_function("add", f);

    let bytes = m.build();
    let program = Engine::load_and_link(&[&bytes]).unwrap();
    let func = program.export_function(0, "add").unwrap();
    let mut runner = Runner::new(&program);
    assert_eq!(runner.call(func, &[]).unwrap(), Some(TaggedValue::I32(5)));
}

#[test]
fn signed_division_by_zero_traps() {
    let mut m = ModuleBuilder::new();
    let t = m.add_type(sig(&[], Some(I32)));
    // i32.const 7; i32.const 0; i32.div_s; end
    let f = m.add_function(t, &[], vec![0x41, 7, 0x41, 0, 0x6d, 0x0b]);
    m.export_function("run", f);

    let bytes = m.build();
    let program = Engine::load_and_link(&[&bytes]).unwrap();
    let func = program.export_function(0, "run").unwrap();
    let mut runner = Runner::new(&program);
    let trap = runner.call(func, &[]).unwrap_err();
    assert_eq!(*trap.kind(), TrapKind::IntegerDivideByZero);
    assert_eq!(trap.func_index, func);
}

#[test]
fn indirect_call_signature_mismatch_traps() {
    let mut m = ModuleBuilder::new();
    let int_to_int = m.add_type(sig(&[I32], Some(I32)));
    let void_to_void = m.add_type(sig(&[], None));

    // Installed at table index 0: (i32) -> i32, just returns its argument.
    // get_local 0; end
    let callee = m.add_function(int_to_int, &[], vec![0x20, 0, 0x0b]);

    // The call site: () -> (). i32.const 0; call_indirect $void_to_void; end.
    let caller = m.add_function(
        void_to_void,
        &[],
        vec![0x41, 0, 0x11, void_to_void as u8, 0x00, 0x0b],
    );

    m.set_table(1, None);
    m.add_element(0, const_i32_expr(0), vec![callee]);
    m.export_function("run", caller);

    let bytes = m.build();
    let program = Engine::load_and_link(&[&bytes]).unwrap();
    let func = program.export_function(0, "run").unwrap();
    let mut runner = Runner::new(&program);
    let trap = runner.call(func, &[]).unwrap_err();
    assert_eq!(*trap.kind(), TrapKind::IndirectCallSignatureMismatch);
}

#[test]
fn memory_load_past_the_end_of_the_last_page_traps() {
    let mut m = ModuleBuilder::new();
    let t = m.add_type(sig(&[], Some(I32)));
    // i32.const 65534; i32.load align=2 offset=0; end. 4 bytes starting at
    // 65534 run past the single page's 65536-byte bound.
    let f = m.add_function(t, &[], vec![0x41, 0xfe, 0xff, 0x03, 0x28, 0x02, 0x00, 0x0b]);
    m.export_function("run", f);
    m.set_memory(1, None);

    let bytes = m.build();
    let program = Engine::load_and_link(&[&bytes]).unwrap();
    let func = program.export_function(0, "run").unwrap();
    let mut runner = Runner::new(&program);
    let trap = runner.call(func, &[]).unwrap_err();
    assert_eq!(*trap.kind(), TrapKind::OutOfBoundsMemoryAccess);
}

#[test]
fn loop_with_br_if_counts_down_to_a_block_result() {
    let mut m = ModuleBuilder::new();
    let t = m.add_type(sig(&[], Some(I32)));
    let body = vec![
        0x41, 10, // i32.const 10
        0x21, 0, // set_local 0
        0x02, I32, // block i32
        0x03, 0x40, // loop void
        0x20, 0, // get_local 0
        0x41, 1, // i32.const 1
        0x6b, // i32.sub
        0x22, 0, // tee_local 0
        0x0d, 0, // br_if 0 (to loop header)
        0x41, 42, // i32.const 42
        0x0b, // end (loop)
        0x0b, // end (block)
        0x0b, // end (function)
    ];
    let f = m.add_function(t, &[I32], body);
    m.export_function("run", f);

    let bytes = m.build();
    let program = Engine::load_and_link(&[&bytes]).unwrap();
    let func = program.export_function(0, "run").unwrap();
    let mut runner = Runner::new(&program);
    assert_eq!(runner.call(func, &[]).unwrap(), Some(TaggedValue::I32(42)));
}

#[test]
fn cyclic_global_initializers_fail_to_link() {
    // Module A's global `g` (index 0) is initialized from module B's global
    // `b`; module B's global `b` is initialized from module A's `g`.
    fn one_sided(export_name: &str, import_name: &str) -> Vec<u8> {
        let mut v = support::MAGIC.to_vec();
        v.extend_from_slice(&support::VERSION);
        // Import section: one global import, i32, immutable.
        let mut imp = support::leb_u32(1);
        imp.extend(support::leb_u32(3));
        imp.extend(b"mod");
        imp.extend(support::leb_u32(import_name.len() as u32));
        imp.extend(import_name.as_bytes());
        imp.push(3); // external kind Global
        imp.push(0x7f); // i32
        imp.push(0); // immutable
        v.push(2);
        v.extend(support::leb_u32(imp.len() as u32));
        v.extend(imp);
        // Global section: one own global (local index 1), init = get_global 0.
        let mut glob = support::leb_u32(1);
        glob.push(0x7f);
        glob.push(0);
        glob.push(0x23);
        glob.extend(support::leb_u32(0));
        glob.push(0x0b);
        v.push(6);
        v.extend(support::leb_u32(glob.len() as u32));
        v.extend(glob);
        // Export section: export the own global (local index 1).
        let mut exp = support::leb_u32(1);
        exp.extend(support::leb_u32(export_name.len() as u32));
        exp.extend(export_name.as_bytes());
        exp.push(3);
        exp.extend(support::leb_u32(1));
        v.push(7);
        v.extend(support::leb_u32(exp.len() as u32));
        v.extend(exp);
        v
    }

    let a = decode_module(&one_sided("g", "b")).unwrap();
    let b = decode_module(&one_sided("b", "g")).unwrap();
    let err = link(&[a, b]).unwrap_err();
    assert!(matches!(err, LoadError::InitializerCycle));
}
