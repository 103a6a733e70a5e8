//! Byte-level instruction encoding shared by the script and numeric dialects.
//!
//! Every instruction is `[prefix] opcode operands...`. Register and count operands are
//! size-classed: one byte in the small layout, two bytes after `MEDIUM_LAYOUT_PREFIX`, four
//! bytes after `LARGE_LAYOUT_PREFIX`. The encoder picks the smallest layout that fits every
//! sized operand of the instruction. Immediates and branch targets are always four bytes
//! (little-endian), so label patching never changes instruction sizes. Branch targets are
//! absolute byte offsets into the function's stream.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{VmResult, fatal};

pub const MEDIUM_LAYOUT_PREFIX: u8 = 0xFE;
pub const LARGE_LAYOUT_PREFIX: u8 = 0xFF;

/// Addressing width of the sized operands of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum LayoutSize {
    #[default]
    Small,
    Medium,
    Large,
}

impl LayoutSize {
    #[inline]
    pub const fn operand_bytes(self) -> usize {
        match self {
            LayoutSize::Small => 1,
            LayoutSize::Medium => 2,
            LayoutSize::Large => 4,
        }
    }

    #[inline]
    pub const fn for_value(value: u32) -> Self {
        if value <= u8::MAX as u32 {
            LayoutSize::Small
        } else if value <= u16::MAX as u32 {
            LayoutSize::Medium
        } else {
            LayoutSize::Large
        }
    }

    #[inline]
    pub const fn prefix(self) -> Option<u8> {
        match self {
            LayoutSize::Small => None,
            LayoutSize::Medium => Some(MEDIUM_LAYOUT_PREFIX),
            LayoutSize::Large => Some(LARGE_LAYOUT_PREFIX),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Slot index in the namespace the opcode implies.
    Reg,
    /// Unsigned table index or count (loop number, name index, argument count).
    Count,
    /// Signed 32-bit immediate.
    Imm,
    /// Absolute byte offset of a branch target.
    Target,
}

impl OperandKind {
    #[inline]
    pub const fn is_sized(self) -> bool {
        matches!(self, OperandKind::Reg | OperandKind::Count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(u32),
    Count(u32),
    Imm(i32),
    Target(u32),
}

/// Static metadata for one opcode.
#[derive(Debug)]
pub struct OpInfo {
    pub name: &'static str,
    pub operands: &'static [OperandKind],
}

/// An instruction dialect with a statically known operand layout per opcode.
pub trait Instruction: Sized + Copy + fmt::Debug {
    /// Opcode metadata indexed by opcode byte.
    fn table() -> &'static [OpInfo];
    fn opcode(&self) -> u8;
    fn operands(&self) -> Vec<Operand>;
    fn decode(opcode: u8, reader: &mut ByteReader<'_>) -> VmResult<Self>;

    fn name(&self) -> &'static str {
        Self::table()
            .get(self.opcode() as usize)
            .map(|info| info.name)
            .unwrap_or("<unknown>")
    }

    /// Mutable access to the branch-target operands, in encoding order.
    fn targets_mut(&mut self) -> Vec<&mut u32>;
}

/// Cursor over an instruction stream for one instruction's operands.
pub struct ByteReader<'a> {
    code: &'a [u8],
    pos: usize,
    size: LayoutSize,
}

impl<'a> ByteReader<'a> {
    #[inline]
    fn byte(&mut self) -> VmResult<u8> {
        let byte = *self
            .code
            .get(self.pos)
            .ok_or_else(|| fatal(format!("malformed bytecode: truncated at offset {}", self.pos)))?;
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    fn bytes<const N: usize>(&mut self) -> VmResult<[u8; N]> {
        let end = self.pos + N;
        let slice = self
            .code
            .get(self.pos..end)
            .ok_or_else(|| fatal(format!("malformed bytecode: truncated operand at offset {}", self.pos)))?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    #[inline]
    pub fn read_sized(&mut self) -> VmResult<u32> {
        match self.size {
            LayoutSize::Small => self.byte().map(u32::from),
            LayoutSize::Medium => self.bytes::<2>().map(|b| u16::from_le_bytes(b) as u32),
            LayoutSize::Large => self.bytes::<4>().map(u32::from_le_bytes),
        }
    }

    #[inline]
    pub fn read_u32(&mut self) -> VmResult<u32> {
        self.bytes::<4>().map(u32::from_le_bytes)
    }

    #[inline]
    pub fn read_i32(&mut self) -> VmResult<i32> {
        self.bytes::<4>().map(i32::from_le_bytes)
    }

    #[inline]
    pub fn layout(&self) -> LayoutSize {
        self.size
    }
}

/// Decode the instruction at `*ip` and advance `*ip` past it.
#[inline]
pub fn decode_at<I: Instruction>(code: &[u8], ip: &mut u32) -> VmResult<I> {
    let mut reader = ByteReader {
        code,
        pos: *ip as usize,
        size: LayoutSize::Small,
    };
    let mut opcode = reader.byte()?;
    match opcode {
        MEDIUM_LAYOUT_PREFIX => {
            reader.size = LayoutSize::Medium;
            opcode = reader.byte()?;
        }
        LARGE_LAYOUT_PREFIX => {
            reader.size = LayoutSize::Large;
            opcode = reader.byte()?;
        }
        _ => {}
    }
    let instr = I::decode(opcode, &mut reader)?;
    *ip = reader.pos as u32;
    Ok(instr)
}

/// Layout the encoder would choose for `instr`.
pub fn layout_of<I: Instruction>(instr: &I) -> LayoutSize {
    instr
        .operands()
        .iter()
        .filter_map(|operand| match operand {
            Operand::Reg(v) | Operand::Count(v) => Some(LayoutSize::for_value(*v)),
            Operand::Imm(_) | Operand::Target(_) => None,
        })
        .max()
        .unwrap_or_default()
}

/// Append `instr` to `out`, returning the byte positions of its branch-target operands.
pub fn encode_into<I: Instruction>(out: &mut Vec<u8>, instr: &I) -> Vec<usize> {
    let size = layout_of(instr);
    if let Some(prefix) = size.prefix() {
        out.push(prefix);
    }
    out.push(instr.opcode());
    let mut targets = Vec::new();
    for operand in instr.operands() {
        match operand {
            Operand::Reg(v) | Operand::Count(v) => match size {
                LayoutSize::Small => out.push(v as u8),
                LayoutSize::Medium => out.extend_from_slice(&(v as u16).to_le_bytes()),
                LayoutSize::Large => out.extend_from_slice(&v.to_le_bytes()),
            },
            Operand::Imm(v) => out.extend_from_slice(&v.to_le_bytes()),
            Operand::Target(v) => {
                targets.push(out.len());
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
    targets
}

/// Overwrite a branch-target operand previously reported by [`encode_into`].
pub fn patch_target(code: &mut [u8], pos: usize, target: u32) -> VmResult<()> {
    let slot = code
        .get_mut(pos..pos + 4)
        .ok_or_else(|| fatal(format!("branch patch position {pos} out of range")))?;
    slot.copy_from_slice(&target.to_le_bytes());
    Ok(())
}

/// One decoded instruction in a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DisasmLine {
    pub offset: u32,
    pub layout: LayoutSize,
    pub text: String,
}

impl fmt::Display for DisasmLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.layout {
            LayoutSize::Small => "",
            LayoutSize::Medium => " [M]",
            LayoutSize::Large => " [L]",
        };
        write!(f, "{:>6}{}  {}", self.offset, tag, self.text)
    }
}

/// Decode a whole stream sequentially.
pub fn disassemble<I: Instruction>(code: &[u8]) -> VmResult<Vec<DisasmLine>> {
    let mut lines = Vec::new();
    let mut ip = 0u32;
    while (ip as usize) < code.len() {
        let offset = ip;
        let layout = match code[ip as usize] {
            MEDIUM_LAYOUT_PREFIX => LayoutSize::Medium,
            LARGE_LAYOUT_PREFIX => LayoutSize::Large,
            _ => LayoutSize::Small,
        };
        let instr: I = decode_at(code, &mut ip)?;
        lines.push(DisasmLine {
            offset,
            layout,
            text: format!("{instr:?}"),
        });
    }
    Ok(lines)
}
