pub mod baselib;
pub mod call;
pub mod callinfo;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod index;
pub mod limits;
pub mod metamethod;
pub mod opcode;
pub mod proto;
pub mod vm;
