use crate::{AtomIndex, FunIndex, ImportIndex, Label, LiteralIndex, Register};

/// A decoded instruction.
///
/// The code section is a flat sequence of these; labels are instruction
/// indices into that sequence. Registers address the frame declared by the
/// enclosing `FuncInfo`; calls copy a contiguous argument window from the
/// caller's frame into registers `0..arity` of the callee's fresh frame.
///
/// Branch-on-failure tests (`Is*`, `IsEq`…) jump to `fail` when the test
/// does not hold and fall through otherwise. `Brt`/`Brf` branch on the
/// atoms `true`/`false` exactly; anything else is a `badarg` at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    Nop,
    /// Function header: declares name, arity and frame size. Executing it
    /// raises `function_clause`; control normally enters at `offset + 1`.
    FuncInfo { function: AtomIndex, arity: u8, frame_size: u16 },

    Mov { dst: Register, src: Register },
    LoadAtom { dst: Register, atom: AtomIndex },
    LoadInt { dst: Register, value: i64 },
    LoadNil { dst: Register },
    LoadLiteral { dst: Register, literal: LiteralIndex },

    Br { label: Label },
    Brt { label: Label, src: Register },
    Brf { label: Label, src: Register },
    Ret { src: Register },
    Halt { src: Register },
    /// A reduction bump: the compiler inserts one per loop iteration so
    /// cooperative preemption has a bounded horizon.
    Reduce,

    Call { dst: Register, offset: Label, arity: u8, args: Register },
    CallStatic { dst: Register, import: ImportIndex, args: Register },
    CallClosure { dst: Register, fun: Register, arity: u8, args: Register },
    Enter { offset: Label, arity: u8, args: Register },
    EnterStatic { import: ImportIndex, args: Register },
    EnterClosure { fun: Register, arity: u8, args: Register },

    IsAtom { fail: Label, src: Register },
    IsNil { fail: Label, src: Register },
    IsInt { fail: Label, src: Register },
    IsFloat { fail: Label, src: Register },
    IsNumber { fail: Label, src: Register },
    IsTuple { fail: Label, src: Register },
    IsTaggedTuple { fail: Label, src: Register, arity: u16, atom: AtomIndex },
    IsCons { fail: Label, src: Register },
    IsList { fail: Label, src: Register },
    IsMap { fail: Label, src: Register },
    IsBinary { fail: Label, src: Register },
    IsPid { fail: Label, src: Register },
    IsRef { fail: Label, src: Register },
    IsFunction { fail: Label, src: Register },

    IsEq { fail: Label, a: Register, b: Register },
    IsNe { fail: Label, a: Register, b: Register },
    IsEqExact { fail: Label, a: Register, b: Register },
    IsNeExact { fail: Label, a: Register, b: Register },
    IsLt { fail: Label, a: Register, b: Register },
    IsGe { fail: Label, a: Register, b: Register },

    MakeTuple { dst: Register, base: Register, arity: u16 },
    GetElement { dst: Register, src: Register, index: u16 },
    SetElement { dst: Register, src: Register, index: u16, value: Register },
    GetArity { dst: Register, src: Register },
    Cons { dst: Register, head: Register, tail: Register },
    Head { dst: Register, src: Register },
    Tail { dst: Register, src: Register },
    MakeMap { dst: Register, base: Register, pairs: u16 },
    MapGet { fail: Label, dst: Register, map: Register, key: Register },
    MapPut { dst: Register, map: Register, key: Register, value: Register },
    MakeClosure { dst: Register, fun: FunIndex, base: Register, env_len: u8 },
    UnpackEnv { dst: Register, closure: Register, index: u16 },

    Add { dst: Register, a: Register, b: Register },
    Sub { dst: Register, a: Register, b: Register },
    Mul { dst: Register, a: Register, b: Register },
    Divide { dst: Register, a: Register, b: Register },
    DivInt { dst: Register, a: Register, b: Register },
    Rem { dst: Register, a: Register, b: Register },
    Neg { dst: Register, src: Register },
    Band { dst: Register, a: Register, b: Register },
    Bor { dst: Register, a: Register, b: Register },
    Bxor { dst: Register, a: Register, b: Register },
    Bnot { dst: Register, src: Register },
    Bsl { dst: Register, a: Register, b: Register },
    Bsr { dst: Register, a: Register, b: Register },
    Not { dst: Register, src: Register },
    And { dst: Register, a: Register, b: Register },
    Or { dst: Register, a: Register, b: Register },

    Catch { handler: Label },
    EndCatch,
    Raise { class: Register, reason: Register },
    StackTrace { dst: Register },

    Send { to: Register, msg: Register },
    RecvPeek { dst: Register, empty: Label },
    RecvNext,
    RecvPop,
    RecvWait { peek: Label, timeout: Register },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of code section")]
    Eof,
    #[error("unknown opcode {0}")]
    BadOpcode(u8),
}

/// Byte-level cursor over an encoded code section.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::Eof)?;
        if end > self.buf.len() {
            return Err(DecodeError::Eof);
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
}

macro_rules! opcodes {
    ($( $code:literal = $name:ident $( { $( $field:ident : $ty:tt ),+ $(,)? } )? ),+ $(,)?) => {
        impl Opcode {
            pub fn encode(&self, buf: &mut Vec<u8>) {
                match self {
                    $( Opcode::$name $( { $( $field ),+ } )? => {
                        buf.push($code);
                        $( $( opcodes!(@emit buf, $field, $ty); )+ )?
                    } )+
                }
            }

            pub(crate) fn decode(cursor: &mut Cursor<'_>) -> Result<Self, DecodeError> {
                let code = cursor.read_u8()?;
                match code {
                    $( $code => Ok(Opcode::$name $( { $( $field: opcodes!(@read cursor, $ty) ),+ } )? ), )+
                    other => Err(DecodeError::BadOpcode(other)),
                }
            }
        }
    };
    (@emit $buf:ident, $field:ident, u8) => { $buf.push(*$field) };
    (@emit $buf:ident, $field:ident, u16) => { $buf.extend_from_slice(&$field.to_be_bytes()) };
    (@emit $buf:ident, $field:ident, u32) => { $buf.extend_from_slice(&$field.to_be_bytes()) };
    (@emit $buf:ident, $field:ident, i64) => { $buf.extend_from_slice(&$field.to_be_bytes()) };
    (@read $cursor:ident, u8) => { $cursor.read_u8()? };
    (@read $cursor:ident, u16) => { $cursor.read_u16()? };
    (@read $cursor:ident, u32) => { $cursor.read_u32()? };
    (@read $cursor:ident, i64) => { $cursor.read_i64()? };
}

opcodes! {
    0 = Nop,
    1 = FuncInfo { function: u32, arity: u8, frame_size: u16 },
    2 = Mov { dst: u16, src: u16 },
    3 = LoadAtom { dst: u16, atom: u32 },
    4 = LoadInt { dst: u16, value: i64 },
    5 = LoadNil { dst: u16 },
    6 = LoadLiteral { dst: u16, literal: u32 },
    7 = Br { label: u32 },
    8 = Brt { label: u32, src: u16 },
    9 = Brf { label: u32, src: u16 },
    10 = Ret { src: u16 },
    11 = Halt { src: u16 },
    12 = Reduce,
    13 = Call { dst: u16, offset: u32, arity: u8, args: u16 },
    14 = CallStatic { dst: u16, import: u32, args: u16 },
    15 = CallClosure { dst: u16, fun: u16, arity: u8, args: u16 },
    16 = Enter { offset: u32, arity: u8, args: u16 },
    17 = EnterStatic { import: u32, args: u16 },
    18 = EnterClosure { fun: u16, arity: u8, args: u16 },
    19 = IsAtom { fail: u32, src: u16 },
    20 = IsNil { fail: u32, src: u16 },
    21 = IsInt { fail: u32, src: u16 },
    22 = IsFloat { fail: u32, src: u16 },
    23 = IsNumber { fail: u32, src: u16 },
    24 = IsTuple { fail: u32, src: u16 },
    25 = IsTaggedTuple { fail: u32, src: u16, arity: u16, atom: u32 },
    26 = IsCons { fail: u32, src: u16 },
    27 = IsList { fail: u32, src: u16 },
    28 = IsMap { fail: u32, src: u16 },
    29 = IsBinary { fail: u32, src: u16 },
    30 = IsPid { fail: u32, src: u16 },
    31 = IsRef { fail: u32, src: u16 },
    32 = IsFunction { fail: u32, src: u16 },
    33 = IsEq { fail: u32, a: u16, b: u16 },
    34 = IsNe { fail: u32, a: u16, b: u16 },
    35 = IsEqExact { fail: u32, a: u16, b: u16 },
    36 = IsNeExact { fail: u32, a: u16, b: u16 },
    37 = IsLt { fail: u32, a: u16, b: u16 },
    38 = IsGe { fail: u32, a: u16, b: u16 },
    39 = MakeTuple { dst: u16, base: u16, arity: u16 },
    40 = GetElement { dst: u16, src: u16, index: u16 },
    41 = SetElement { dst: u16, src: u16, index: u16, value: u16 },
    42 = GetArity { dst: u16, src: u16 },
    43 = Cons { dst: u16, head: u16, tail: u16 },
    44 = Head { dst: u16, src: u16 },
    45 = Tail { dst: u16, src: u16 },
    46 = MakeMap { dst: u16, base: u16, pairs: u16 },
    47 = MapGet { fail: u32, dst: u16, map: u16, key: u16 },
    48 = MapPut { dst: u16, map: u16, key: u16, value: u16 },
    49 = MakeClosure { dst: u16, fun: u32, base: u16, env_len: u8 },
    50 = UnpackEnv { dst: u16, closure: u16, index: u16 },
    51 = Add { dst: u16, a: u16, b: u16 },
    52 = Sub { dst: u16, a: u16, b: u16 },
    53 = Mul { dst: u16, a: u16, b: u16 },
    54 = Divide { dst: u16, a: u16, b: u16 },
    55 = DivInt { dst: u16, a: u16, b: u16 },
    56 = Rem { dst: u16, a: u16, b: u16 },
    57 = Neg { dst: u16, src: u16 },
    58 = Band { dst: u16, a: u16, b: u16 },
    59 = Bor { dst: u16, a: u16, b: u16 },
    60 = Bxor { dst: u16, a: u16, b: u16 },
    61 = Bnot { dst: u16, src: u16 },
    62 = Bsl { dst: u16, a: u16, b: u16 },
    63 = Bsr { dst: u16, a: u16, b: u16 },
    64 = Not { dst: u16, src: u16 },
    65 = And { dst: u16, a: u16, b: u16 },
    66 = Or { dst: u16, a: u16, b: u16 },
    67 = Catch { handler: u32 },
    68 = EndCatch,
    69 = Raise { class: u16, reason: u16 },
    70 = StackTrace { dst: u16 },
    71 = Send { to: u16, msg: u16 },
    72 = RecvPeek { dst: u16, empty: u32 },
    73 = RecvNext,
    74 = RecvPop,
    75 = RecvWait { peek: u32, timeout: u16 },
}

impl Opcode {
    /// All individually-addressed register operands.
    pub fn registers(&self) -> Vec<Register> {
        use Opcode::*;
        match *self {
            Nop | FuncInfo { .. } | Br { .. } | Reduce | EndCatch | Catch { .. } | RecvNext
            | RecvPop | Enter { .. } | EnterStatic { .. } => vec![],
            Mov { dst, src }
            | GetElement { dst, src, .. }
            | GetArity { dst, src }
            | Head { dst, src }
            | Tail { dst, src }
            | Neg { dst, src }
            | Bnot { dst, src }
            | Not { dst, src }
            | UnpackEnv { dst, closure: src, .. } => vec![dst, src],
            LoadAtom { dst, .. }
            | LoadInt { dst, .. }
            | LoadNil { dst }
            | LoadLiteral { dst, .. }
            | StackTrace { dst } => vec![dst],
            Brt { src, .. } | Brf { src, .. } | Ret { src } | Halt { src } => vec![src],
            Call { dst, .. } | CallStatic { dst, .. } => vec![dst],
            CallClosure { dst, fun, .. } => vec![dst, fun],
            EnterClosure { fun, .. } => vec![fun],
            IsAtom { src, .. }
            | IsNil { src, .. }
            | IsInt { src, .. }
            | IsFloat { src, .. }
            | IsNumber { src, .. }
            | IsTuple { src, .. }
            | IsTaggedTuple { src, .. }
            | IsCons { src, .. }
            | IsList { src, .. }
            | IsMap { src, .. }
            | IsBinary { src, .. }
            | IsPid { src, .. }
            | IsRef { src, .. }
            | IsFunction { src, .. } => vec![src],
            IsEq { a, b, .. }
            | IsNe { a, b, .. }
            | IsEqExact { a, b, .. }
            | IsNeExact { a, b, .. }
            | IsLt { a, b, .. }
            | IsGe { a, b, .. } => vec![a, b],
            MakeTuple { dst, .. } | MakeMap { dst, .. } | MakeClosure { dst, .. } => vec![dst],
            SetElement { dst, src, value, .. } => vec![dst, src, value],
            Cons { dst, head, tail } => vec![dst, head, tail],
            MapGet { dst, map, key, .. } => vec![dst, map, key],
            MapPut { dst, map, key, value } => vec![dst, map, key, value],
            Add { dst, a, b }
            | Sub { dst, a, b }
            | Mul { dst, a, b }
            | Divide { dst, a, b }
            | DivInt { dst, a, b }
            | Rem { dst, a, b }
            | Band { dst, a, b }
            | Bor { dst, a, b }
            | Bxor { dst, a, b }
            | Bsl { dst, a, b }
            | Bsr { dst, a, b }
            | And { dst, a, b }
            | Or { dst, a, b } => vec![dst, a, b],
            Raise { class, reason } => vec![class, reason],
            Send { to, msg } => vec![to, msg],
            RecvPeek { dst, .. } => vec![dst],
            RecvWait { timeout, .. } => vec![timeout],
        }
    }

    /// Contiguous register windows addressed by this op, as `(base, len)`.
    ///
    /// Windows for qualified calls depend on the import table and are
    /// checked by `Image::validate` instead.
    pub fn register_window(&self) -> Option<(Register, u16)> {
        use Opcode::*;
        match *self {
            Call { args, arity, .. }
            | CallClosure { args, arity, .. }
            | Enter { args, arity, .. }
            | EnterClosure { args, arity, .. } => Some((args, arity as u16)),
            MakeTuple { base, arity, .. } => Some((base, arity)),
            MakeMap { base, pairs, .. } => Some((base, pairs.saturating_mul(2))),
            MakeClosure { base, env_len, .. } => Some((base, env_len as u16)),
            _ => None,
        }
    }

    /// All branch-target operands.
    pub fn labels(&self) -> Vec<Label> {
        use Opcode::*;
        match *self {
            Br { label } | Brt { label, .. } | Brf { label, .. } => vec![label],
            IsAtom { fail, .. }
            | IsNil { fail, .. }
            | IsInt { fail, .. }
            | IsFloat { fail, .. }
            | IsNumber { fail, .. }
            | IsTuple { fail, .. }
            | IsTaggedTuple { fail, .. }
            | IsCons { fail, .. }
            | IsList { fail, .. }
            | IsMap { fail, .. }
            | IsBinary { fail, .. }
            | IsPid { fail, .. }
            | IsRef { fail, .. }
            | IsFunction { fail, .. }
            | IsEq { fail, .. }
            | IsNe { fail, .. }
            | IsEqExact { fail, .. }
            | IsNeExact { fail, .. }
            | IsLt { fail, .. }
            | IsGe { fail, .. }
            | MapGet { fail, .. } => vec![fail],
            Call { offset, .. } | Enter { offset, .. } => vec![offset],
            Catch { handler } => vec![handler],
            RecvPeek { empty, .. } => vec![empty],
            RecvWait { peek, .. } => vec![peek],
            _ => vec![],
        }
    }

    /// Visits every label operand mutably; used by the builder to patch
    /// symbolic labels to instruction indices.
    pub(crate) fn for_each_label_mut(&mut self, f: &mut impl FnMut(&mut Label)) {
        use Opcode::*;
        match self {
            Br { label } | Brt { label, .. } | Brf { label, .. } => f(label),
            IsAtom { fail, .. }
            | IsNil { fail, .. }
            | IsInt { fail, .. }
            | IsFloat { fail, .. }
            | IsNumber { fail, .. }
            | IsTuple { fail, .. }
            | IsTaggedTuple { fail, .. }
            | IsCons { fail, .. }
            | IsList { fail, .. }
            | IsMap { fail, .. }
            | IsBinary { fail, .. }
            | IsPid { fail, .. }
            | IsRef { fail, .. }
            | IsFunction { fail, .. }
            | IsEq { fail, .. }
            | IsNe { fail, .. }
            | IsEqExact { fail, .. }
            | IsNeExact { fail, .. }
            | IsLt { fail, .. }
            | IsGe { fail, .. }
            | MapGet { fail, .. } => f(fail),
            Call { offset, .. } | Enter { offset, .. } => f(offset),
            Catch { handler } => f(handler),
            RecvPeek { empty, .. } => f(empty),
            RecvWait { peek, .. } => f(peek),
            _ => {}
        }
    }

    pub fn atom_index(&self) -> Option<AtomIndex> {
        match *self {
            Opcode::FuncInfo { function, .. } => Some(function),
            Opcode::LoadAtom { atom, .. } => Some(atom),
            Opcode::IsTaggedTuple { atom, .. } => Some(atom),
            _ => None,
        }
    }

    pub fn literal_index(&self) -> Option<LiteralIndex> {
        match *self {
            Opcode::LoadLiteral { literal, .. } => Some(literal),
            _ => None,
        }
    }

    pub fn import_index(&self) -> Option<ImportIndex> {
        match *self {
            Opcode::CallStatic { import, .. } | Opcode::EnterStatic { import, .. } => Some(import),
            _ => None,
        }
    }

    pub fn fun_index(&self) -> Option<FunIndex> {
        match *self {
            Opcode::MakeClosure { fun, .. } => Some(fun),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(ops: &[Opcode]) -> Vec<Opcode> {
        let mut buf = Vec::new();
        for op in ops {
            op.encode(&mut buf);
        }
        let mut cursor = Cursor::new(&buf);
        let mut decoded = Vec::new();
        while !cursor.is_empty() {
            decoded.push(Opcode::decode(&mut cursor).unwrap());
        }
        decoded
    }

    #[test]
    fn encode_decode_roundtrip() {
        let ops = vec![
            Opcode::FuncInfo { function: 1, arity: 2, frame_size: 6 },
            Opcode::Mov { dst: 3, src: 0 },
            Opcode::LoadInt { dst: 4, value: -1 },
            Opcode::LoadInt { dst: 4, value: i64::MAX },
            Opcode::IsTaggedTuple { fail: 9, src: 0, arity: 2, atom: 17 },
            Opcode::Call { dst: 0, offset: 12, arity: 2, args: 3 },
            Opcode::RecvWait { peek: 4, timeout: 5 },
            Opcode::Ret { src: 0 },
        ];
        assert_eq!(ops, roundtrip(&ops));
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        let mut cursor = Cursor::new(&[0xff]);
        assert_eq!(Opcode::decode(&mut cursor), Err(DecodeError::BadOpcode(0xff)));
    }

    #[test]
    fn decode_rejects_truncated_operands() {
        // Mov with a missing src operand
        let mut cursor = Cursor::new(&[2, 0, 1]);
        assert_eq!(Opcode::decode(&mut cursor), Err(DecodeError::Eof));
    }

    proptest::proptest! {
        #[test]
        fn any_operand_values_roundtrip(
            value in proptest::prelude::any::<i64>(),
            dst in proptest::prelude::any::<u16>(),
            label in proptest::prelude::any::<u32>(),
            atom in proptest::prelude::any::<u32>(),
            arity in proptest::prelude::any::<u8>(),
        ) {
            let ops = vec![
                Opcode::LoadInt { dst, value },
                Opcode::Br { label },
                Opcode::LoadAtom { dst, atom },
                Opcode::Call { dst, offset: label, arity, args: dst },
                Opcode::IsTaggedTuple { fail: label, src: dst, arity: arity as u16, atom },
            ];
            proptest::prop_assert_eq!(&ops, &roundtrip(&ops));
        }
    }
}
