//! Declarative opcode lists for the script dialect ([`Op`]) and the numeric dialect ([`NumOp`]).
//!
//! Each list expands into the instruction enum, a fieldless opcode enum, the opcode metadata
//! table, and the encode/decode glue. Handler variants of the dispatch loop are generated from
//! these same lists, so adding an opcode here is the only registration step.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use super::encoding::{ByteReader, Instruction, OpInfo, Operand, OperandKind};
use crate::error::{VmResult, fatal};

macro_rules! operand_ty {
    (Reg) => { u32 };
    (Count) => { u32 };
    (Target) => { u32 };
    (Imm) => { i32 };
}

macro_rules! read_operand {
    ($reader:ident, Reg) => {
        $reader.read_sized()?
    };
    ($reader:ident, Count) => {
        $reader.read_sized()?
    };
    ($reader:ident, Target) => {
        $reader.read_u32()?
    };
    ($reader:ident, Imm) => {
        $reader.read_i32()?
    };
}

macro_rules! push_target {
    ($out:ident, $field:ident, Target) => {
        $out.push($field);
    };
    ($out:ident, $field:ident, $other:ident) => {};
}

macro_rules! instruction_set {
    (
        $(#[$meta:meta])*
        pub enum $op:ident / $code:ident / $table:ident {
            $( $(#[$doc:meta])* $name:ident { $($field:ident : $kind:ident),* $(,)? } ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $op {
            $( $(#[$doc])* $name { $($field: operand_ty!($kind)),* } ),*
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum $code {
            $($name),*
        }

        static $table: Lazy<Vec<OpInfo>> = Lazy::new(|| {
            vec![ $( OpInfo { name: stringify!($name), operands: &[$(OperandKind::$kind),*] } ),* ]
        });

        impl $code {
            const ALL: &'static [$code] = &[$($code::$name),*];

            #[inline]
            pub fn from_byte(byte: u8) -> Option<Self> {
                Self::ALL.get(byte as usize).copied()
            }

            pub fn name(self) -> &'static str {
                $table[self as usize].name
            }

            pub fn operand_kinds(self) -> &'static [OperandKind] {
                $table[self as usize].operands
            }

            pub fn count() -> usize {
                Self::ALL.len()
            }
        }

        impl $op {
            #[inline]
            pub fn code(&self) -> $code {
                match self {
                    $( $op::$name { .. } => $code::$name ),*
                }
            }
        }

        impl Instruction for $op {
            fn table() -> &'static [OpInfo] {
                &$table
            }

            #[inline]
            fn opcode(&self) -> u8 {
                self.code() as u8
            }

            fn operands(&self) -> Vec<Operand> {
                match *self {
                    $( $op::$name { $($field),* } => vec![$(Operand::$kind($field)),*] ),*
                }
            }

            #[inline]
            fn decode(opcode: u8, reader: &mut ByteReader<'_>) -> VmResult<Self> {
                let Some(code) = $code::from_byte(opcode) else {
                    return Err(fatal(format!(
                        concat!("malformed bytecode: unknown ", stringify!($op), " opcode {:#04x}"),
                        opcode
                    )));
                };
                Ok(match code {
                    $( $code::$name => $op::$name { $($field: read_operand!(reader, $kind)),* } ),*
                })
            }

            #[allow(unused_variables)]
            fn targets_mut(&mut self) -> Vec<&mut u32> {
                let mut out: Vec<&mut u32> = Vec::new();
                match self {
                    $( $op::$name { $($field),* } => { $( push_target!(out, $field, $kind); )* } ),*
                }
                out
            }
        }
    };
}

instruction_set! {
    /// Script-dialect instruction. Register operands address the boxed-value namespace.
    pub enum Op / OpCode / OP_TABLE {
        /// Return the value in slot 0.
        Ret {},
        /// Suspend a generator with `src`; on resumption the sent value lands in `dst`.
        Yield { dst: Reg, src: Reg },
        Ld { dst: Reg, src: Reg },
        LdUndef { dst: Reg },
        LdNull { dst: Reg },
        LdTrue { dst: Reg },
        LdFalse { dst: Reg },
        LdInt { dst: Reg, value: Imm },
        Add { dst: Reg, lhs: Reg, rhs: Reg },
        Sub { dst: Reg, lhs: Reg, rhs: Reg },
        Mul { dst: Reg, lhs: Reg, rhs: Reg },
        Div { dst: Reg, lhs: Reg, rhs: Reg },
        Rem { dst: Reg, lhs: Reg, rhs: Reg },
        Incr { dst: Reg, src: Reg },
        Decr { dst: Reg, src: Reg },
        Neg { dst: Reg, src: Reg },
        Not { dst: Reg, src: Reg },
        TypeOf { dst: Reg, src: Reg },
        Eq { dst: Reg, lhs: Reg, rhs: Reg },
        NotEq { dst: Reg, lhs: Reg, rhs: Reg },
        StrictEq { dst: Reg, lhs: Reg, rhs: Reg },
        StrictNotEq { dst: Reg, lhs: Reg, rhs: Reg },
        Lt { dst: Reg, lhs: Reg, rhs: Reg },
        Le { dst: Reg, lhs: Reg, rhs: Reg },
        Gt { dst: Reg, lhs: Reg, rhs: Reg },
        Ge { dst: Reg, lhs: Reg, rhs: Reg },
        Br { target: Target },
        BrTrue { src: Reg, target: Target },
        BrFalse { src: Reg, target: Target },
        /// Top of a loop body, executed once per iteration.
        LoopBodyStart { loop_num: Count },
        ProfiledLoopStart { loop_num: Count },
        ProfiledLoopEnd { loop_num: Count },
        /// Reserve `argc` out-argument slots for the next call.
        StartCall { argc: Count },
        ArgOut { index: Count, src: Reg },
        /// Call `callee` with the `argc` staged out-arguments and release them.
        Call { dst: Reg, callee: Reg, argc: Count },
        NewObject { dst: Reg },
        NewArray { dst: Reg, len: Count },
        LdFld { dst: Reg, obj: Reg, name: Count },
        StFld { obj: Reg, name: Count, src: Reg },
        LdElem { dst: Reg, obj: Reg, index: Reg },
        StElem { obj: Reg, index: Reg, src: Reg },
        LdLen { dst: Reg, src: Reg },
        LdRoot { dst: Reg, name: Count },
        StRoot { name: Count, src: Reg },
        LdArguments { dst: Reg },
        NewClosure { dst: Reg, func: Count },
        /// Closure proven not to escape the current call.
        NewStackClosure { dst: Reg, func: Count },
        LdEnvSlot { dst: Reg, depth: Count, slot: Count },
        StEnvSlot { depth: Count, slot: Count, src: Reg },
        LdEnvFld { dst: Reg, depth: Count, name: Count },
        StEnvFld { depth: Count, name: Count, src: Reg },
        LdLocalSlot { dst: Reg, slot: Count },
        StLocalSlot { slot: Count, src: Reg },
        LdLocalFld { dst: Reg, name: Count },
        StLocalFld { name: Count, src: Reg },
        LdParamSlot { dst: Reg, slot: Count },
        StParamSlot { slot: Count, src: Reg },
        /// Parameter initialization finished; nested functions now capture the body scope.
        ParamScopeDone {},
        NewInnerScope { index: Count, size: Count },
        LdInnerSlot { dst: Reg, index: Count, slot: Count },
        StInnerSlot { index: Count, slot: Count, src: Reg },
        InitForIn { enumerator: Count, src: Reg },
        /// Next key into `dst`, or branch to `target` once exhausted.
        ForInNext { dst: Reg, enumerator: Count, target: Target },
        Throw { src: Reg },
        TryCatch { catch_target: Target },
        TryFinally { finally_target: Target },
        /// Bind the caught exception; first instruction of a catch body.
        Catch { dst: Reg },
        /// Complete the innermost handler region and continue at `target`.
        Leave { target: Target },
        /// End of a finally body that completed without a transfer.
        LeaveNull {},
        ResumeGenerator { dst: Reg, generator: Reg, value: Reg },
        /// Debugger breakpoint probe.
        Break {},
        EndOfBlock {},
    }
}

instruction_set! {
    /// Numeric-dialect instruction. The opcode fixes which typed namespace each register uses.
    pub enum NumOp / NumOpCode / NUM_OP_TABLE {
        RetVoid {},
        RetI32 { src: Reg },
        RetI64 { src: Reg },
        RetF32 { src: Reg },
        RetF64 { src: Reg },
        RetSimd { src: Reg },
        LdI32 { dst: Reg, value: Imm },
        MovI32 { dst: Reg, src: Reg },
        MovI64 { dst: Reg, src: Reg },
        MovF32 { dst: Reg, src: Reg },
        MovF64 { dst: Reg, src: Reg },
        MovSimd { dst: Reg, src: Reg },
        AddI32 { dst: Reg, lhs: Reg, rhs: Reg },
        SubI32 { dst: Reg, lhs: Reg, rhs: Reg },
        MulI32 { dst: Reg, lhs: Reg, rhs: Reg },
        DivI32 { dst: Reg, lhs: Reg, rhs: Reg },
        RemI32 { dst: Reg, lhs: Reg, rhs: Reg },
        AndI32 { dst: Reg, lhs: Reg, rhs: Reg },
        OrI32 { dst: Reg, lhs: Reg, rhs: Reg },
        XorI32 { dst: Reg, lhs: Reg, rhs: Reg },
        ShlI32 { dst: Reg, lhs: Reg, rhs: Reg },
        ShrI32 { dst: Reg, lhs: Reg, rhs: Reg },
        AddI64 { dst: Reg, lhs: Reg, rhs: Reg },
        SubI64 { dst: Reg, lhs: Reg, rhs: Reg },
        MulI64 { dst: Reg, lhs: Reg, rhs: Reg },
        DivI64 { dst: Reg, lhs: Reg, rhs: Reg },
        AddF32 { dst: Reg, lhs: Reg, rhs: Reg },
        SubF32 { dst: Reg, lhs: Reg, rhs: Reg },
        MulF32 { dst: Reg, lhs: Reg, rhs: Reg },
        DivF32 { dst: Reg, lhs: Reg, rhs: Reg },
        AddF64 { dst: Reg, lhs: Reg, rhs: Reg },
        SubF64 { dst: Reg, lhs: Reg, rhs: Reg },
        MulF64 { dst: Reg, lhs: Reg, rhs: Reg },
        DivF64 { dst: Reg, lhs: Reg, rhs: Reg },
        LtI32 { dst: Reg, lhs: Reg, rhs: Reg },
        LeI32 { dst: Reg, lhs: Reg, rhs: Reg },
        EqI32 { dst: Reg, lhs: Reg, rhs: Reg },
        LtF64 { dst: Reg, lhs: Reg, rhs: Reg },
        LeF64 { dst: Reg, lhs: Reg, rhs: Reg },
        EqF64 { dst: Reg, lhs: Reg, rhs: Reg },
        I32ToF64 { dst: Reg, src: Reg },
        F64ToI32 { dst: Reg, src: Reg },
        I32ToI64 { dst: Reg, src: Reg },
        I64ToI32 { dst: Reg, src: Reg },
        I64ToF64 { dst: Reg, src: Reg },
        F32ToF64 { dst: Reg, src: Reg },
        F64ToF32 { dst: Reg, src: Reg },
        Br { target: Target },
        BrTrueI32 { src: Reg, target: Target },
        BrFalseI32 { src: Reg, target: Target },
        LoopBodyStart { loop_num: Count },
        I32x4Splat { dst: Reg, src: Reg },
        I32x4Add { dst: Reg, lhs: Reg, rhs: Reg },
        I32x4ExtractLane { dst: Reg, src: Reg, lane: Count },
        F32x4Splat { dst: Reg, src: Reg },
        F32x4Add { dst: Reg, lhs: Reg, rhs: Reg },
        F32x4Mul { dst: Reg, lhs: Reg, rhs: Reg },
        F32x4ExtractLane { dst: Reg, src: Reg, lane: Count },
        EndOfBlock {},
    }
}

/// Force construction of both opcode tables.
pub fn init_opcode_tables() {
    Lazy::force(&OP_TABLE);
    Lazy::force(&NUM_OP_TABLE);
}
