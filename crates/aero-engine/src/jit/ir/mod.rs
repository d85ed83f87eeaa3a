//! SSA-form intermediate representation for the JIT tiers

pub mod builder;
pub mod display;
pub mod instr;
pub mod types;

pub use instr::{
    BinOp, Block, BlockId, CmpOp, DeoptFrame, DeoptId, DeoptLocals, DeoptReason, DeoptState,
    Instr, IrFunction, Reg, Terminator,
};
pub use types::{JsType, NumRange, TypeInfo};
