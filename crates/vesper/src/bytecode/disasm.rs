//! Chunk disassembly for debugging.
//!
//! Prints one instruction per line: offset, source line, mnemonic,
//! operands, and constant previews. Walks code with
//! `Chunk::instruction_len`, the same width table the compiler's break
//! rewrite uses.

use std::fmt::Write as _;

use crate::heap::Heap;
use crate::value::repr_string;

use super::chunk::Chunk;
use super::op::Opcode;

/// Renders a whole chunk.
#[must_use]
pub fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset, heap, &mut out);
    }
    out
}

/// Renders one instruction, returning the offset of the next.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap, out: &mut String) -> usize {
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.line(offset) == chunk.line(offset - 1) {
        out.push_str("   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.line(offset));
    }

    let Some(op) = Opcode::from_repr(chunk.byte(offset)) else {
        let _ = writeln!(out, "<bad opcode {:#04x}>", chunk.byte(offset));
        return offset + 1;
    };
    let _ = write!(out, "{:<18}", op.mnemonic());

    match op {
        Opcode::Call | Opcode::GetIndex | Opcode::GetRangedIndex | Opcode::SuperInvokeSelf => {
            let _ = write!(out, " {}", chunk.byte(offset + 1));
        }
        Opcode::Constant
        | Opcode::DefineGlobal
        | Opcode::GetGlobal
        | Opcode::SetGlobal
        | Opcode::GetProperty
        | Opcode::GetSelfProperty
        | Opcode::SetProperty
        | Opcode::Class
        | Opcode::Method
        | Opcode::Switch
        | Opcode::CallImport
        | Opcode::NativeModule
        | Opcode::SelectImport
        | Opcode::SelectNativeImport
        | Opcode::EjectImport
        | Opcode::EjectNativeImport => {
            let index = chunk.read_u16(offset + 1);
            let preview = repr_string(chunk.constant(index), heap);
            let _ = write!(out, " {index} ({preview})");
        }
        Opcode::GetLocal
        | Opcode::SetLocal
        | Opcode::GetUpvalue
        | Opcode::SetUpvalue
        | Opcode::PopN
        | Opcode::List
        | Opcode::Dict => {
            let _ = write!(out, " {}", chunk.read_u16(offset + 1));
        }
        Opcode::Jump | Opcode::JumpIfFalse | Opcode::BreakPlaceholder => {
            let jump = usize::from(chunk.read_u16(offset + 1));
            let _ = write!(out, " -> {}", offset + 3 + jump);
        }
        Opcode::Loop => {
            let jump = usize::from(chunk.read_u16(offset + 1));
            let _ = write!(out, " -> {}", offset + 3 - jump);
        }
        Opcode::Invoke | Opcode::InvokeSelf | Opcode::SuperInvoke => {
            let index = chunk.read_u16(offset + 1);
            let argc = chunk.byte(offset + 3);
            let preview = repr_string(chunk.constant(index), heap);
            let _ = write!(out, " {index} ({preview}) argc {argc}");
        }
        Opcode::ClassProperty => {
            let index = chunk.read_u16(offset + 1);
            let is_static = chunk.byte(offset + 3) != 0;
            let preview = repr_string(chunk.constant(index), heap);
            let _ = write!(out, " {index} ({preview}) static {is_static}");
        }
        Opcode::Try => {
            let type_const = chunk.read_u16(offset + 1);
            let catch_addr = chunk.read_u16(offset + 3);
            let finally_addr = chunk.read_u16(offset + 5);
            let _ = write!(out, " type {type_const} catch {catch_addr:04} finally {finally_addr:04}");
        }
        Opcode::Closure => {
            let index = chunk.read_u16(offset + 1);
            let preview = repr_string(chunk.constant(index), heap);
            let _ = write!(out, " {index} ({preview})");
            let len = chunk.instruction_len(offset, heap);
            let mut at = offset + 3;
            while at < offset + len {
                let is_local = chunk.byte(at) != 0;
                let slot = chunk.read_u16(at + 1);
                let kind = if is_local { "local" } else { "upvalue" };
                let _ = write!(out, " [{kind} {slot}]");
                at += 3;
            }
        }
        _ => {}
    }
    out.push('\n');
    offset + chunk.instruction_len(offset, heap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn dumps_offsets_and_mnemonics() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let c = chunk.add_constant(Value::Number(7.0));
        chunk.write_op(Opcode::Constant, 1);
        chunk.write_u16(c, 1);
        chunk.write_op(Opcode::Echo, 1);

        let text = disassemble_chunk(&chunk, "main", &heap);
        assert!(text.contains("== main =="));
        assert!(text.contains("Constant"));
        assert!(text.contains("(7)"));
        assert!(text.contains("Echo"));
    }

    #[test]
    fn jump_targets_are_resolved() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_op(Opcode::Jump, 1);
        chunk.write_u16(2, 1);
        chunk.write_op(Opcode::Nil, 1);
        chunk.write_op(Opcode::Pop, 1);
        chunk.write_op(Opcode::Return, 1);

        let text = disassemble_chunk(&chunk, "j", &heap);
        assert!(text.contains("Jump"));
        assert!(text.contains("-> 5"));
    }
}
