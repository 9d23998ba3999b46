//! The closed opcode set.
//!
//! Shared by the compiler, the VM and the disassembler. Operand widths
//! come from [`Opcode::arg_bytes`]; the compiler's break-placeholder
//! rewrite and the disassembler both walk code with it, so a divergence
//! here would corrupt loop patching - there is exactly one table.

use strum::{FromRepr, IntoStaticStr};

/// One bytecode operation. All multi-byte operands are big-endian u16
/// unless noted.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
pub enum Opcode {
    // Literal loads.
    Nil,
    True,
    False,
    Empty,
    /// u16 constant-pool index.
    Constant,

    // Arithmetic.
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Pow,
    FloorDivide,
    Negate,

    // Bitwise.
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    LShift,
    RShift,

    // Comparison and logic.
    Equal,
    Greater,
    Less,
    Not,

    // Stack shuffling.
    Pop,
    /// u16 count of values to pop.
    PopN,
    Dup,

    // Variables. Operands are u16 constant indices (globals) or u16
    // slot/upvalue indices.
    DefineGlobal,
    GetGlobal,
    SetGlobal,
    GetLocal,
    SetLocal,
    GetUpvalue,
    SetUpvalue,

    // Control flow. Offsets are u16; `Jump`/`JumpIfFalse` add, `Loop`
    // subtracts. `BreakPlaceholder` never reaches the VM: the compiler
    // rewrites it to `Jump` when the enclosing loop's end is known.
    Jump,
    JumpIfFalse,
    Loop,
    BreakPlaceholder,

    // Functions and calls.
    /// u8 argument count.
    Call,
    /// u16 function constant + per-upvalue (is-local byte, u16 index).
    Closure,
    CloseUpvalue,
    Return,

    // Properties. u16 name constant; `Invoke` forms add a u8 argc.
    GetProperty,
    GetSelfProperty,
    SetProperty,
    /// u16 name constant + u8 argc.
    Invoke,
    InvokeSelf,
    SuperInvoke,
    /// u8 argc; re-invokes the running method's name on the superclass.
    SuperInvokeSelf,

    // Classes.
    /// u16 name constant.
    Class,
    /// u16 name constant; pops a closure and installs it as a method.
    Method,
    /// u16 name constant + u8 is-static flag; pops the default value.
    ClassProperty,
    Inherit,

    // Containers.
    /// u16 element count.
    List,
    /// u16 pair count.
    Dict,
    Range,
    /// u8 flag: 1 keeps receiver and index under the result (compound
    /// assignment reuses them for the following `SetIndex`).
    GetIndex,
    /// u8 flag, as `GetIndex`.
    GetRangedIndex,
    SetIndex,

    // Exceptions. `Try`'s payload is three u16s: catch-type name
    // constant, catch address, finally address; 0xFFFF marks an absent
    // arm. Addresses are absolute chunk offsets.
    Try,
    PopTry,
    PublishTry,
    Die,
    Assert,

    // Switch. u16 constant index of a Switch object.
    Switch,

    // Imports. Name/function operands are u16 constant indices.
    CallImport,
    NativeModule,
    SelectImport,
    SelectNativeImport,
    ImportAll,
    ImportAllNative,
    EjectImport,
    EjectNativeImport,

    // Output.
    Echo,
    Stringify,
}

impl Opcode {
    /// Operand width in bytes past the opcode itself.
    ///
    /// `Closure` is the one variable-width instruction; callers walking
    /// raw code resolve its width from the function constant (see
    /// `Chunk::instruction_len`).
    #[must_use]
    pub fn arg_bytes(self) -> Option<usize> {
        Some(match self {
            Self::Closure => return None,
            Self::Call | Self::GetIndex | Self::GetRangedIndex | Self::SuperInvokeSelf => 1,
            Self::Constant
            | Self::PopN
            | Self::DefineGlobal
            | Self::GetGlobal
            | Self::SetGlobal
            | Self::GetLocal
            | Self::SetLocal
            | Self::GetUpvalue
            | Self::SetUpvalue
            | Self::Jump
            | Self::JumpIfFalse
            | Self::Loop
            | Self::BreakPlaceholder
            | Self::GetProperty
            | Self::GetSelfProperty
            | Self::SetProperty
            | Self::Class
            | Self::Method
            | Self::List
            | Self::Dict
            | Self::Switch
            | Self::CallImport
            | Self::NativeModule
            | Self::SelectImport
            | Self::SelectNativeImport
            | Self::EjectImport
            | Self::EjectNativeImport => 2,
            Self::Invoke | Self::InvokeSelf | Self::SuperInvoke | Self::ClassProperty => 3,
            Self::Try => 6,
            _ => 0,
        })
    }

    /// The disassembly mnemonic.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_repr() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::from_repr(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Opcode::from_repr(Opcode::Echo as u8), Some(Opcode::Echo));
    }

    #[test]
    fn operand_width_groups() {
        assert_eq!(Opcode::Add.arg_bytes(), Some(0));
        assert_eq!(Opcode::Call.arg_bytes(), Some(1));
        assert_eq!(Opcode::GetLocal.arg_bytes(), Some(2));
        assert_eq!(Opcode::Invoke.arg_bytes(), Some(3));
        assert_eq!(Opcode::Try.arg_bytes(), Some(6));
        assert_eq!(Opcode::Closure.arg_bytes(), None);
    }
}
