//! Cranelift view of the native ABI.
//!
//! Generated code is entered through [`NativeEntry`] and talks to the VM
//! only through the `lumen_rt_*` shims in [`crate::runtime`]. Every operand
//! crosses the boundary as an `i64`.

use std::collections::HashMap;

use cranelift_codegen::ir::{types, AbiParam, Signature};
use cranelift_codegen::isa::CallConv;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module, ModuleError};
use lumen_vm::proto::NativeEntry;
use thiserror::Error;

use crate::runtime;

#[derive(Debug, Error)]
pub enum JitError {
    #[error("JIT module error: {0}")]
    Module(#[from] ModuleError),
    #[error("JIT init error: {0}")]
    Init(String),
    #[error("unknown runtime function '{0}'")]
    UnknownSymbol(String),
}

/// Signature of a [`NativeEntry`]: `(vm, base) -> code`.
pub fn entry_signature(call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(types::I64)); // vm: *mut Vm
    sig.params.push(AbiParam::new(types::I64)); // base: usize
    sig.returns.push(AbiParam::new(types::I64));
    sig
}

/// A shim generated code may import.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeFn {
    pub name: &'static str,
    pub addr: *const u8,
    /// Number of `i64` parameters, the VM pointer included.
    pub params: u8,
    pub returns: bool,
}

impl RuntimeFn {
    pub fn signature(&self, call_conv: CallConv) -> Signature {
        let mut sig = Signature::new(call_conv);
        for _ in 0..self.params {
            sig.params.push(AbiParam::new(types::I64));
        }
        if self.returns {
            sig.returns.push(AbiParam::new(types::I64));
        }
        sig
    }
}

macro_rules! runtime_table {
    (@ret i64) => { true };
    (@ret) => { false };
    ($($name:ident($params:expr) $(-> $ret:tt)?;)*) => {
        /// Every shim exported to generated code.
        pub fn runtime_functions() -> Vec<RuntimeFn> {
            vec![$(
                RuntimeFn {
                    name: stringify!($name),
                    addr: runtime::$name as *const u8,
                    params: $params,
                    returns: runtime_table!(@ret $($ret)?),
                },
            )*]
        }
    };
}

runtime_table! {
    lumen_rt_exit(2) -> i64;
    lumen_rt_fallback(3) -> i64;
    lumen_rt_get_global(3) -> i64;
    lumen_rt_set_global(3) -> i64;
    lumen_rt_get_table_ks(3) -> i64;
    lumen_rt_set_table_ks(3) -> i64;
    lumen_rt_namecall(3) -> i64;
    lumen_rt_new_closure(3) -> i64;
    lumen_rt_dup_closure(3) -> i64;
    lumen_rt_set_list(3) -> i64;
    lumen_rt_get_varargs(3) -> i64;
    lumen_rt_prep_varargs(3) -> i64;
    lumen_rt_forg_prep(3) -> i64;
    lumen_rt_forg_prep_next(3) -> i64;
    lumen_rt_forg_prep_inext(3) -> i64;
    lumen_rt_forg_loop(3) -> i64;
    lumen_rt_forg_loop_table_iter(4) -> i64;
    lumen_rt_forg_loop_node_iter(4) -> i64;
    lumen_rt_forg_loop_non_table(3) -> i64;
    lumen_rt_forg_prep_xnext(3) -> i64;
    lumen_rt_call_prolog(4) -> i64;
    lumen_rt_call_epilog_c(3);
    lumen_rt_call_fallback(3) -> i64;
    lumen_rt_return_fallback(3) -> i64;
    lumen_rt_save_pc(2);
    lumen_rt_frame_base(1) -> i64;
    lumen_rt_get_slot(2) -> i64;
    lumen_rt_set_slot(3);
    lumen_rt_gc_check(1);
}

/// Make every shim resolvable by name in modules built from `builder`.
pub fn register_symbols(builder: &mut JITBuilder) {
    for f in runtime_functions() {
        builder.symbol(f.name, f.addr);
    }
}

/// A JIT module for the host with the shims registered.
pub fn new_module() -> Result<JITModule, JitError> {
    let mut builder =
        JITBuilder::new(default_libcall_names()).map_err(|e| JitError::Init(e.to_string()))?;
    register_symbols(&mut builder);
    Ok(JITModule::new(builder))
}

/// Declare every shim as an import of `module`, keyed by name.
pub fn declare_imports<M: Module>(module: &mut M) -> Result<HashMap<&'static str, FuncId>, JitError> {
    let call_conv = module.isa().default_call_conv();
    let mut ids = HashMap::new();
    for f in runtime_functions() {
        let id = module.declare_function(f.name, Linkage::Import, &f.signature(call_conv))?;
        ids.insert(f.name, id);
    }
    Ok(ids)
}

/// Look up an import declared by [`declare_imports`].
pub fn import(ids: &HashMap<&'static str, FuncId>, name: &str) -> Result<FuncId, JitError> {
    ids.get(name)
        .copied()
        .ok_or_else(|| JitError::UnknownSymbol(name.to_string()))
}

/// The finalized code of `id` as an entry point.
///
/// # Safety
/// `id` must be a finalized function of `module` defined with
/// [`entry_signature`], and `module` must outlive every use of the result.
pub unsafe fn finalized_entry(module: &JITModule, id: FuncId) -> NativeEntry {
    let code = module.get_finalized_function(id);
    std::mem::transmute::<*const u8, NativeEntry>(code)
}
