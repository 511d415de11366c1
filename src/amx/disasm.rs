//! A stream decoder for AMX bytecode.
//!
//! [`AmxDisassembler`] walks the code section front to back and yields one
//! [`AmxInstruction`] per call. The stream ends with `None`; whether that was
//! the end of the section or malformed input is reported by [`had_error`].
//!
//! [`had_error`]: AmxDisassembler::had_error

use super::opcode::{Opcode, Operands};
use super::{AmxPtr, Cell, CELL_SIZE};

/// One decoded instruction: its code-relative address, opcode and operand
/// cells, taken verbatim from the code section.
#[derive(Debug, Clone)]
pub struct AmxInstruction {
    address: Cell,
    opcode: Opcode,
    operands: Vec<Cell>,
}

impl AmxInstruction {
    /// Code-relative address of the opcode cell.
    pub fn address(&self) -> Cell {
        self.address
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// The first operand. Only meaningful for opcodes that have one.
    pub fn operand(&self) -> Cell {
        self.operands[0]
    }

    pub fn operand_at(&self, index: usize) -> Cell {
        self.operands[index]
    }

    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    /// Encoded size in bytes, opcode cell included.
    pub fn size(&self) -> Cell {
        ((1 + self.operands.len()) * CELL_SIZE) as Cell
    }
}

impl std::fmt::Display for AmxInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}  {:?}", self.address, self.opcode)?;
        for operand in &self.operands {
            write!(f, " {:#x}", operand)?;
        }
        Ok(())
    }
}

/// Decoder state over one program's code section.
pub struct AmxDisassembler {
    amx: AmxPtr,
    ip: usize,
    error: bool,
}

impl AmxDisassembler {
    pub fn new(amx: AmxPtr) -> AmxDisassembler {
        AmxDisassembler {
            amx,
            ip: 0,
            error: false,
        }
    }

    /// Whether a previous [`decode`] stopped on malformed bytecode rather
    /// than the end of the section.
    ///
    /// [`decode`]: AmxDisassembler::decode
    pub fn had_error(&self) -> bool {
        self.error
    }

    fn next_cell(&mut self) -> Option<Cell> {
        let cell = self.amx.read_code_cell(self.ip as Cell);
        if cell.is_some() {
            self.ip += CELL_SIZE;
        }
        cell
    }

    /// Decode the instruction at the current position. Returns `None` at the
    /// end of the section, and on malformed input after setting the error
    /// flag.
    pub fn decode(&mut self) -> Option<AmxInstruction> {
        if self.error || self.ip >= self.amx.code_size() {
            return None;
        }

        let address = self.ip as Cell;
        let opcode = match self.next_cell().and_then(Opcode::from_cell) {
            Some(opcode) => opcode,
            None => {
                self.error = true;
                return None;
            }
        };

        let mut operands = Vec::new();
        let fixed = match opcode.operands() {
            Operands::Fixed(n) => n,
            Operands::CaseTable => {
                let num = match self.next_cell() {
                    Some(num) if num >= 0 => num,
                    _ => {
                        self.error = true;
                        return None;
                    }
                };
                operands.push(num);
                // default address plus one (value, address) pair per record
                1 + 2 * num as usize
            }
            Operands::Debug => {
                self.error = true;
                return None;
            }
        };

        for _ in 0..fixed {
            match self.next_cell() {
                Some(cell) => operands.push(cell),
                None => {
                    self.error = true;
                    return None;
                }
            }
        }

        Some(AmxInstruction {
            address,
            opcode,
            operands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amx::image::AmxImageBuilder;
    use crate::amx::opcode::Opcode as Op;

    fn ops(code: &[Cell]) -> (Vec<(Cell, Op, usize)>, bool) {
        let mut image = AmxImageBuilder::new().code(code).build();
        let mut disas = AmxDisassembler::new(image.ptr());
        let mut out = Vec::new();
        while let Some(instr) = disas.decode() {
            out.push((instr.address(), instr.opcode(), instr.num_operands()));
        }
        (out, disas.had_error())
    }

    #[test]
    fn test_decode_simple() {
        let (decoded, error) = ops(&[46, 11, 7, 48]); // PROC; CONST.pri 7; RETN
        assert!(!error);
        assert_eq!(
            decoded,
            vec![(0, Op::Proc, 0), (4, Op::ConstPri, 1), (12, Op::Retn, 0)]
        );
    }

    #[test]
    fn test_decode_casetbl() {
        // SWITCH +8; CASETBL 1 case, default +0, (10 -> +0)
        let (decoded, error) = ops(&[129, 8, 130, 1, 0, 10, 0]);
        assert!(!error);
        assert_eq!(decoded[0].1, Op::Switch);
        assert_eq!(decoded[1], (8, Op::Casetbl, 4));
    }

    #[test]
    fn test_decode_bad_opcode() {
        let (decoded, error) = ops(&[46, 9999]);
        assert!(error);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_decode_truncated_operand() {
        let (decoded, error) = ops(&[46, 11]); // CONST.pri missing its operand
        assert!(error);
        assert_eq!(decoded.len(), 1);
    }
}
