// ── Instruction word layout ──────────────────────────────────────────
//
// One instruction is a little-endian u64:
//
//   bits  0..16   opcode
//   bits 16..32   operand A
//   bits 32..48   operand B
//   bits 48..64   operand C
//
// Whether an operand is a register or an immediate is fixed per opcode by
// its `OperandSig`.

use std::fmt::Write as _;

pub type Instruction = u64;
pub type Operand = u16;

/// Operand shape: `R` is a register index, `I` an immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSig {
    None,
    R,
    RR,
    RRR,
    RI,
    RRI,
    IRR,
    IIR,
    I,
}

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $sig:ident, $mnemonic:literal;)*) => {
        #[allow(clippy::upper_case_acronyms)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($(#[$doc])* $name,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            pub fn signature(self) -> OperandSig {
                match self {
                    $(Opcode::$name => OperandSig::$sig,)*
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }
        }
    };
}

opcodes! {
    NOP = None, "NOP";

    // control
    /// exit with A as the handler result
    EXIT = I, "EXIT";
    /// pc = A
    JMP = I, "JMP";
    /// if [A] != 0 then pc = B
    JN = RI, "JN";
    /// if [A] == 0 then pc = B
    JZ = RI, "JZ";
    /// run handler A; exit true if it returns true
    HCALL = I, "HCALL";

    MOV = RR, "MOV";

    // array constants: A = pool index B
    ITCONST = RI, "ITCONST";
    STCONST = RI, "STCONST";
    PTCONST = RI, "PTCONST";
    CTCONST = RI, "CTCONST";

    // numbers
    /// A = B as signed 16-bit immediate
    IMOV = RI, "IMOV";
    /// A = numbers[B]
    NCONST = RI, "NCONST";
    NNEG = RR, "NNEG";
    NNOT = RR, "NNOT";
    NADD = RRR, "NADD";
    NSUB = RRR, "NSUB";
    NMUL = RRR, "NMUL";
    NDIV = RRR, "NDIV";
    NREM = RRR, "NREM";
    NSHL = RRR, "NSHL";
    NSHR = RRR, "NSHR";
    NPOW = RRR, "NPOW";
    NAND = RRR, "NAND";
    NOR = RRR, "NOR";
    NXOR = RRR, "NXOR";
    /// A = [B] == 0
    NCMPZ = RR, "NCMPZ";
    NCMPEQ = RRR, "NCMPEQ";
    NCMPNE = RRR, "NCMPNE";
    NCMPLE = RRR, "NCMPLE";
    NCMPGE = RRR, "NCMPGE";
    NCMPLT = RRR, "NCMPLT";
    NCMPGT = RRR, "NCMPGT";

    // numbers, right operand a signed 16-bit immediate
    NIADD = RRI, "NIADD";
    NISUB = RRI, "NISUB";
    NIMUL = RRI, "NIMUL";
    NIDIV = RRI, "NIDIV";
    NIREM = RRI, "NIREM";
    NISHL = RRI, "NISHL";
    NISHR = RRI, "NISHR";
    NIPOW = RRI, "NIPOW";
    NIAND = RRI, "NIAND";
    NIOR = RRI, "NIOR";
    NIXOR = RRI, "NIXOR";
    NICMPEQ = RRI, "NICMPEQ";
    NICMPNE = RRI, "NICMPNE";
    NICMPLE = RRI, "NICMPLE";
    NICMPGE = RRI, "NICMPGE";
    NICMPLT = RRI, "NICMPLT";
    NICMPGT = RRI, "NICMPGT";

    // booleans
    BNOT = RR, "BNOT";
    BAND = RRR, "BAND";
    BOR = RRR, "BOR";
    BXOR = RRR, "BXOR";

    // strings
    SCONST = RI, "SCONST";
    SADD = RRR, "SADD";
    /// A = substr([B], offset [C], count [C+1])
    SSUBSTR = RRR, "SSUBSTR";
    SCMPEQ = RRR, "SCMPEQ";
    SCMPNE = RRR, "SCMPNE";
    SCMPLE = RRR, "SCMPLE";
    SCMPGE = RRR, "SCMPGE";
    SCMPLT = RRR, "SCMPLT";
    SCMPGT = RRR, "SCMPGT";
    SCMPBEG = RRR, "SCMPBEG";
    SCMPEND = RRR, "SCMPEND";
    /// A = [B] contains [C]
    SCONTAINS = RRR, "SCONTAINS";
    SLEN = RR, "SLEN";
    SISEMPTY = RR, "SISEMPTY";
    /// pc = match_defs[B].evaluate([A])
    SMATCHEQ = RI, "SMATCHEQ";
    SMATCHBEG = RI, "SMATCHBEG";
    SMATCHEND = RI, "SMATCHEND";
    SMATCHR = RI, "SMATCHR";

    // ip and cidr
    PCONST = RI, "PCONST";
    PCMPEQ = RRR, "PCMPEQ";
    PCMPNE = RRR, "PCMPNE";
    /// A = [B] in cidr [C]
    PINCIDR = RRR, "PINCIDR";
    CCONST = RI, "CCONST";

    // regex
    RCONST = RI, "RCONST";
    /// A = [B] =~ regex [C]; a match replaces the capture groups
    SREGMATCH = RRR, "SREGMATCH";
    /// A = capture group [B] of the last successful match
    SREGGROUP = RR, "SREGGROUP";

    // conversion
    N2S = RR, "N2S";
    P2S = RR, "P2S";
    C2S = RR, "C2S";
    R2S = RR, "R2S";
    S2N = RR, "S2N";

    // invocation
    /// native function A, B args at [C+1..], result in [C]
    CALL = IIR, "CALL";
    /// native handler A, B args at [C+1..]; exit true if [C] is true
    HANDLER = IIR, "HANDLER";
}

impl Opcode {
    /// Decodes a raw opcode field.
    pub fn from_raw(raw: u16) -> Option<Opcode> {
        Opcode::ALL.get(raw as usize).copied()
    }

    /// True when the immediate operand is a signed 16-bit value.
    pub fn has_signed_immediate(self) -> bool {
        matches!(self.signature(), OperandSig::RRI) || self == Opcode::IMOV
    }
}

// ── Packing ──────────────────────────────────────────────────────────

#[inline]
pub fn make(op: Opcode, a: Operand, b: Operand, c: Operand) -> Instruction {
    op as u64 | (a as u64) << 16 | (b as u64) << 32 | (c as u64) << 48
}

#[inline]
pub fn opcode(instr: Instruction) -> u16 {
    (instr & 0xFFFF) as u16
}

#[inline]
pub fn operand_a(instr: Instruction) -> Operand {
    (instr >> 16) as u16
}

#[inline]
pub fn operand_b(instr: Instruction) -> Operand {
    (instr >> 32) as u16
}

#[inline]
pub fn operand_c(instr: Instruction) -> Operand {
    (instr >> 48) as u16
}

// ── Disassembly ──────────────────────────────────────────────────────

/// Renders one instruction as
/// `  MNEMONIC   operands             ;  pc | raw bytes`.
pub fn disassemble(instr: Instruction, pc: usize) -> String {
    let (a, b, c) = (operand_a(instr), operand_b(instr), operand_c(instr));
    let mut line = String::new();

    let Some(op) = Opcode::from_raw(opcode(instr)) else {
        let _ = write!(line, "  {:<10} {}", "<invalid>", opcode(instr));
        return finish_line(line, instr, pc);
    };

    let imm = |v: Operand| if op.has_signed_immediate() { (v as i16).to_string() } else { v.to_string() };
    let _ = write!(line, "  {:<10}", op.mnemonic());
    let operands = match op.signature() {
        OperandSig::None => String::new(),
        OperandSig::R => format!(" r{a}"),
        OperandSig::RR => format!(" r{a}, r{b}"),
        OperandSig::RRR => format!(" r{a}, r{b}, r{c}"),
        OperandSig::RI => format!(" r{a}, {}", imm(b)),
        OperandSig::RRI => format!(" r{a}, r{b}, {}", imm(c)),
        OperandSig::IRR => format!(" {a}, r{b}, r{c}"),
        OperandSig::IIR => format!(" {a}, {b}, r{c}"),
        OperandSig::I => format!(" {a}"),
    };
    line.push_str(&operands);
    finish_line(line, instr, pc)
}

fn finish_line(mut line: String, instr: Instruction, pc: usize) -> String {
    while line.len() < 30 {
        line.push(' ');
    }
    let _ = write!(line, ";{pc:>4} |");
    for byte in instr.to_le_bytes() {
        let _ = write!(line, " {byte:02x}");
    }
    line
}

/// One disassembled line per instruction.
pub fn disassemble_all(code: &[Instruction]) -> String {
    let mut out = String::new();
    for (pc, instr) in code.iter().enumerate() {
        out.push_str(&disassemble(*instr, pc));
        out.push('\n');
    }
    out
}

// ── Register frame sizing ────────────────────────────────────────────

/// Highest register referenced by `instr` plus one, or 0 if it uses none.
pub fn register_span(instr: Instruction) -> usize {
    let (a, b, c) = (operand_a(instr) as usize, operand_b(instr) as usize, operand_c(instr) as usize);
    let Some(op) = Opcode::from_raw(opcode(instr)) else { return 0 };
    let highest = match op.signature() {
        OperandSig::None | OperandSig::I => return 0,
        OperandSig::R | OperandSig::RI => a,
        OperandSig::RR | OperandSig::RRI => a.max(b),
        OperandSig::RRR if op == Opcode::SSUBSTR => a.max(b).max(c + 1),
        OperandSig::RRR => a.max(b).max(c),
        OperandSig::IRR => b.max(c),
        // result at C, B arguments after it
        OperandSig::IIR => c + b,
    };
    highest + 1
}

/// Frame size needed to run `code`: zero for an empty stream.
pub fn compute_register_count(code: &[Instruction]) -> usize {
    code.iter().map(|i| register_span(*i)).max().unwrap_or(0)
}
