use cranelift_codegen::ir::{types, InstBuilder};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::JITModule;
use cranelift_module::{Linkage, Module};
use lumen_bridge::abi::{self, JitError};
use lumen_vm::opcode::Insn;
use lumen_vm::proto::{NativeEntry, Proto};
use lumen_vm::vm::Vm;

use super::helpers::*;

/// Compile `entry(vm, base) = lumen_rt_exit(vm, lumen_rt_fallback(vm, 0, base))`:
/// run the first instruction through its fallback, then leave the rest of
/// the frame to the interpreter.
fn compile_first_fallback(module: &mut JITModule) -> Result<NativeEntry, JitError> {
    let imports = abi::declare_imports(module)?;
    let fallback = abi::import(&imports, "lumen_rt_fallback")?;
    let exit = abi::import(&imports, "lumen_rt_exit")?;

    let sig = abi::entry_signature(module.isa().default_call_conv());
    let id = module.declare_function("first_fallback", Linkage::Local, &sig)?;
    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    let mut fctx = FunctionBuilderContext::new();
    {
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fctx);
        let block = b.create_block();
        b.append_block_params_for_function_params(block);
        b.switch_to_block(block);
        b.seal_block(block);
        let vm = b.block_params(block)[0];
        let base = b.block_params(block)[1];

        let fallback = module.declare_func_in_func(fallback, b.func);
        let exit = module.declare_func_in_func(exit, b.func);
        let pc = b.ins().iconst(types::I64, 0);
        let call = b.ins().call(fallback, &[vm, pc, base]);
        let next = b.inst_results(call)[0];
        let call = b.ins().call(exit, &[vm, next]);
        let code = b.inst_results(call)[0];
        b.ins().return_(&[code]);
        b.finalize();
    }
    module.define_function(id, &mut ctx)?;
    module.clear_context(&mut ctx);
    module.finalize_definitions()?;
    Ok(unsafe { abi::finalized_entry(module, id) })
}

#[test]
fn test_jit_entry_calls_fallback_then_exits() {
    let mut module = abi::new_module().unwrap();
    let entry = compile_first_fallback(&mut module).unwrap();

    let mut vm = Vm::new();
    vm.set_global("answer", num(42.0));
    let k = kstr(&mut vm, "answer");
    let proto = Proto::new(
        vec![Insn::GetGlobal { a: 0, k: 0 }, Insn::Return { a: 0, count: 1 }],
        vec![k],
    )
    .with_native(entry);
    let out = run(&mut vm, proto, &[]);
    assert_eq!(out[0].as_number(), Some(42.0));
}

#[test]
fn test_jit_entry_reports_fallback_error() {
    let mut module = abi::new_module().unwrap();
    let entry = compile_first_fallback(&mut module).unwrap();

    let mut vm = Vm::new();
    let k = kstr(&mut vm, "x");
    let proto = Proto::new(
        vec![Insn::GetTableKs { a: 1, b: 0, k: 0 }, Insn::Return { a: 1, count: 1 }],
        vec![k],
    )
    .with_params(1, false)
    .with_native(entry);
    let msg = run_err(&mut vm, proto, &[num(1.0)]);
    assert_eq!(msg, "attempt to index number with 'x'");
    assert!(vm.pending_error.is_none());
}
