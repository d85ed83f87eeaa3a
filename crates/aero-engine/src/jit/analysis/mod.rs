//! Bytecode and IR analyses feeding the compilation pipeline

pub mod cfg;
pub mod decoder;
pub mod dominators;
pub mod loops;

pub use cfg::{build_cfg, BytecodeCfg, CfgBlockId, CfgTerminator};
pub use decoder::{decode_function, DecodedInstr, Operands};
pub use dominators::Dominators;
pub use loops::{find_loops, NaturalLoop};
