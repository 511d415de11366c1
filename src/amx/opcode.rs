//! AMX opcode identities and metadata.
//!
//! Every instruction in the code section starts with a full cell holding the
//! opcode id, followed by its operand cells. The operand shape is fixed per
//! opcode except for `CASETBL`, whose length is encoded in its first operand.

use super::Cell;

/// Operand shape of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    /// A fixed number of operand cells (0, 1 or 2).
    Fixed(usize),
    /// A case table: a count cell, a default address, then `count`
    /// (value, address) pairs.
    CaseTable,
    /// Inline debug data of unpredictable length. Never emitted by current
    /// compilers; the disassembler treats it as malformed input.
    Debug,
}

macro_rules! opcodes {
    ($($name:ident = $id:literal, $ops:expr;)*) => {
        /// An AMX opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum Opcode {
            $($name = $id,)*
        }

        impl Opcode {
            /// Decode an opcode from a raw code cell.
            pub fn from_cell(cell: Cell) -> Option<Opcode> {
                match cell {
                    $($id => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            /// Operand shape of this opcode.
            pub fn operands(self) -> Operands {
                match self {
                    $(Opcode::$name => $ops,)*
                }
            }
        }
    };
}

use Operands::{CaseTable, Debug as Dbg, Fixed};

opcodes! {
    None = 0, Fixed(0);
    LoadPri = 1, Fixed(1);
    LoadAlt = 2, Fixed(1);
    LoadSPri = 3, Fixed(1);
    LoadSAlt = 4, Fixed(1);
    LrefPri = 5, Fixed(1);
    LrefAlt = 6, Fixed(1);
    LrefSPri = 7, Fixed(1);
    LrefSAlt = 8, Fixed(1);
    LoadI = 9, Fixed(0);
    LodbI = 10, Fixed(1);
    ConstPri = 11, Fixed(1);
    ConstAlt = 12, Fixed(1);
    AddrPri = 13, Fixed(1);
    AddrAlt = 14, Fixed(1);
    StorPri = 15, Fixed(1);
    StorAlt = 16, Fixed(1);
    StorSPri = 17, Fixed(1);
    StorSAlt = 18, Fixed(1);
    SrefPri = 19, Fixed(1);
    SrefAlt = 20, Fixed(1);
    SrefSPri = 21, Fixed(1);
    SrefSAlt = 22, Fixed(1);
    StorI = 23, Fixed(0);
    StrbI = 24, Fixed(1);
    Lidx = 25, Fixed(0);
    LidxB = 26, Fixed(1);
    Idxaddr = 27, Fixed(0);
    IdxaddrB = 28, Fixed(1);
    AlignPri = 29, Fixed(1);
    AlignAlt = 30, Fixed(1);
    Lctrl = 31, Fixed(1);
    Sctrl = 32, Fixed(1);
    MovePri = 33, Fixed(0);
    MoveAlt = 34, Fixed(0);
    Xchg = 35, Fixed(0);
    PushPri = 36, Fixed(0);
    PushAlt = 37, Fixed(0);
    PushR = 38, Fixed(1);
    PushC = 39, Fixed(1);
    Push = 40, Fixed(1);
    PushS = 41, Fixed(1);
    PopPri = 42, Fixed(0);
    PopAlt = 43, Fixed(0);
    Stack = 44, Fixed(1);
    Heap = 45, Fixed(1);
    Proc = 46, Fixed(0);
    Ret = 47, Fixed(0);
    Retn = 48, Fixed(0);
    Call = 49, Fixed(1);
    CallPri = 50, Fixed(0);
    Jump = 51, Fixed(1);
    Jrel = 52, Fixed(1);
    Jzer = 53, Fixed(1);
    Jnz = 54, Fixed(1);
    Jeq = 55, Fixed(1);
    Jneq = 56, Fixed(1);
    Jless = 57, Fixed(1);
    Jleq = 58, Fixed(1);
    Jgrtr = 59, Fixed(1);
    Jgeq = 60, Fixed(1);
    Jsless = 61, Fixed(1);
    Jsleq = 62, Fixed(1);
    Jsgrtr = 63, Fixed(1);
    Jsgeq = 64, Fixed(1);
    Shl = 65, Fixed(0);
    Shr = 66, Fixed(0);
    Sshr = 67, Fixed(0);
    ShlCPri = 68, Fixed(1);
    ShlCAlt = 69, Fixed(1);
    ShrCPri = 70, Fixed(1);
    ShrCAlt = 71, Fixed(1);
    Smul = 72, Fixed(0);
    Sdiv = 73, Fixed(0);
    SdivAlt = 74, Fixed(0);
    Umul = 75, Fixed(0);
    Udiv = 76, Fixed(0);
    UdivAlt = 77, Fixed(0);
    Add = 78, Fixed(0);
    Sub = 79, Fixed(0);
    SubAlt = 80, Fixed(0);
    And = 81, Fixed(0);
    Or = 82, Fixed(0);
    Xor = 83, Fixed(0);
    Not = 84, Fixed(0);
    Neg = 85, Fixed(0);
    Invert = 86, Fixed(0);
    AddC = 87, Fixed(1);
    SmulC = 88, Fixed(1);
    ZeroPri = 89, Fixed(0);
    ZeroAlt = 90, Fixed(0);
    Zero = 91, Fixed(1);
    ZeroS = 92, Fixed(1);
    SignPri = 93, Fixed(0);
    SignAlt = 94, Fixed(0);
    Eq = 95, Fixed(0);
    Neq = 96, Fixed(0);
    Less = 97, Fixed(0);
    Leq = 98, Fixed(0);
    Grtr = 99, Fixed(0);
    Geq = 100, Fixed(0);
    Sless = 101, Fixed(0);
    Sleq = 102, Fixed(0);
    Sgrtr = 103, Fixed(0);
    Sgeq = 104, Fixed(0);
    EqCPri = 105, Fixed(1);
    EqCAlt = 106, Fixed(1);
    IncPri = 107, Fixed(0);
    IncAlt = 108, Fixed(0);
    Inc = 109, Fixed(1);
    IncS = 110, Fixed(1);
    IncI = 111, Fixed(0);
    DecPri = 112, Fixed(0);
    DecAlt = 113, Fixed(0);
    Dec = 114, Fixed(1);
    DecS = 115, Fixed(1);
    DecI = 116, Fixed(0);
    Movs = 117, Fixed(1);
    Cmps = 118, Fixed(1);
    Fill = 119, Fixed(1);
    Halt = 120, Fixed(1);
    Bounds = 121, Fixed(1);
    SysreqPri = 122, Fixed(0);
    SysreqC = 123, Fixed(1);
    File = 124, Dbg;
    Line = 125, Fixed(2);
    Symbol = 126, Dbg;
    Srange = 127, Fixed(2);
    JumpPri = 128, Fixed(0);
    Switch = 129, Fixed(1);
    Casetbl = 130, CaseTable;
    SwapPri = 131, Fixed(0);
    SwapAlt = 132, Fixed(0);
    PushAdr = 133, Fixed(1);
    Nop = 134, Fixed(0);
    SysreqD = 135, Fixed(1);
    Symtag = 136, Fixed(1);
    Break = 137, Fixed(0);
}

impl Opcode {
    /// Whether this opcode calls a function through a one-operand code
    /// address.
    pub fn is_call(self) -> bool {
        self == Opcode::Call
    }

    /// Whether this opcode transfers control to a code address. Only the
    /// one-operand forms carry a target in the instruction itself.
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jump
                | Opcode::Jzer
                | Opcode::Jnz
                | Opcode::Jeq
                | Opcode::Jneq
                | Opcode::Jless
                | Opcode::Jleq
                | Opcode::Jgrtr
                | Opcode::Jgeq
                | Opcode::Jsless
                | Opcode::Jsleq
                | Opcode::Jsgrtr
                | Opcode::Jsgeq
                | Opcode::JumpPri
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_cell_bounds() {
        assert_eq!(Opcode::from_cell(0), Some(Opcode::None));
        assert_eq!(Opcode::from_cell(1), Some(Opcode::LoadPri));
        assert_eq!(Opcode::from_cell(137), Some(Opcode::Break));
        assert_eq!(Opcode::from_cell(138), None);
        assert_eq!(Opcode::from_cell(-1), None);
    }

    #[test]
    fn test_operand_shapes() {
        assert_eq!(Opcode::LoadPri.operands(), Operands::Fixed(1));
        assert_eq!(Opcode::Proc.operands(), Operands::Fixed(0));
        assert_eq!(Opcode::Line.operands(), Operands::Fixed(2));
        assert_eq!(Opcode::Casetbl.operands(), Operands::CaseTable);
        assert_eq!(Opcode::File.operands(), Operands::Debug);
    }

    #[test]
    fn test_jump_classification() {
        assert!(Opcode::Call.is_call());
        assert!(Opcode::Jump.is_jump());
        assert!(Opcode::Jsgeq.is_jump());
        assert!(Opcode::JumpPri.is_jump());
        assert!(!Opcode::Jrel.is_jump());
        assert!(!Opcode::Switch.is_jump());
        assert!(!Opcode::Proc.is_jump());
    }
}
