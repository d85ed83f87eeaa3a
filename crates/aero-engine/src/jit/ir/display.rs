//! Textual form of the IR, for debugging and pass tests

use std::fmt;

use super::instr::{Instr, IrFunction, Terminator};

impl fmt::Display for IrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "fn {} (#{}, params={}, locals={}, regs={})",
            self.name,
            self.function_id.0,
            self.param_count,
            self.local_count,
            self.reg_count()
        )?;
        for block in &self.blocks {
            writeln!(
                f,
                "{} (offset={}, depth={}, preds={:?}):",
                block.id,
                block.bytecode_offset,
                block.loop_depth,
                block.preds.iter().map(|p| p.0).collect::<Vec<_>>()
            )?;
            for instr in &block.instrs {
                writeln!(f, "  {}", format_instr(instr))?;
            }
            writeln!(f, "  {}", format_term(&block.terminator))?;
        }
        Ok(())
    }
}

fn format_instr(i: &Instr) -> String {
    match i.dest() {
        Some(d) => format!("{d} = {i:?}"),
        None => format!("{i:?}"),
    }
}

fn format_term(t: &Terminator) -> String {
    match t {
        Terminator::Jump(b) => format!("jump {b}"),
        Terminator::Branch {
            cond,
            then_block,
            else_block,
        } => format!("branch {cond} ? {then_block} : {else_block}"),
        Terminator::Return(r) => format!("return {r}"),
        Terminator::Deopt(d) => format!("deopt #{}", d.0),
        Terminator::None => "<no terminator>".to_string(),
    }
}
