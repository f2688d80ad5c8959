use std::collections::HashMap;

use crate::{
    Arity, AtomIndex, Export, FunIndex, Image, Import, ImportIndex, Label, Lambda, LiteralIndex,
    Opcode, Register, ValidateError, VERSION,
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("label {0} was never bound")]
    UnboundLabel(Label),
    #[error("atom name {0:?} exceeds 255 bytes")]
    AtomTooLong(String),
    #[error(transparent)]
    Validate(#[from] ValidateError),
}

/// Assembles a module image in memory.
///
/// Labels are symbolic until [`build`](ModuleBuilder::build): allocate them
/// with [`new_label`](ModuleBuilder::new_label), reference them from any
/// label operand, and bind them to the next instruction with
/// [`bind`](ModuleBuilder::bind). `begin_function` binds a label at the
/// emitted `FuncInfo` header and returns it for use as a call offset.
pub struct ModuleBuilder {
    atoms: Vec<String>,
    atom_ids: HashMap<String, AtomIndex>,
    imports: Vec<Import>,
    import_ids: HashMap<(AtomIndex, AtomIndex, Arity), ImportIndex>,
    exports: Vec<(AtomIndex, Arity, Label)>,
    literals: Vec<Vec<u8>>,
    strings: Vec<u8>,
    funs: Vec<(AtomIndex, Arity, u8, Label)>,
    code: Vec<Opcode>,
    labels: Vec<Option<Label>>,
}

impl ModuleBuilder {
    pub fn new(module: &str) -> Self {
        let mut builder = Self {
            atoms: Vec::new(),
            atom_ids: HashMap::new(),
            imports: Vec::new(),
            import_ids: HashMap::new(),
            exports: Vec::new(),
            literals: Vec::new(),
            strings: Vec::new(),
            funs: Vec::new(),
            code: Vec::new(),
            labels: Vec::new(),
        };
        builder.atom(module);
        builder
    }

    /// Interns an atom, returning its index. Atom 0 is the module name.
    pub fn atom(&mut self, name: &str) -> AtomIndex {
        if let Some(id) = self.atom_ids.get(name) {
            return *id;
        }
        let id = self.atoms.len() as AtomIndex;
        self.atoms.push(name.to_string());
        self.atom_ids.insert(name.to_string(), id);
        id
    }

    pub fn import(&mut self, module: &str, function: &str, arity: Arity) -> ImportIndex {
        let module = self.atom(module);
        let function = self.atom(function);
        if let Some(id) = self.import_ids.get(&(module, function, arity)) {
            return *id;
        }
        let id = self.imports.len() as ImportIndex;
        self.imports.push(Import { module, function, arity });
        self.import_ids.insert((module, function, arity), id);
        id
    }

    /// Adds an externally-encoded literal blob to the literal table.
    pub fn literal(&mut self, encoded: Vec<u8>) -> LiteralIndex {
        let id = self.literals.len() as LiteralIndex;
        self.literals.push(encoded);
        id
    }

    pub fn strings(&mut self, bytes: &[u8]) -> u32 {
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(bytes);
        offset
    }

    /// Allocates a fresh, unbound label.
    pub fn new_label(&mut self) -> Label {
        let id = self.labels.len() as Label;
        self.labels.push(None);
        id
    }

    /// Binds `label` to the next instruction to be pushed.
    pub fn bind(&mut self, label: Label) {
        let at = self.code.len() as Label;
        self.labels[label as usize] = Some(at);
    }

    /// Starts a function: emits its `FuncInfo` header and returns a label
    /// bound to it, usable as a local call offset. When `exported` the
    /// function is added to the export table.
    pub fn begin_function(
        &mut self,
        name: &str,
        arity: Arity,
        frame_size: Register,
        exported: bool,
    ) -> Label {
        let function = self.atom(name);
        let label = self.new_label();
        self.bind(label);
        self.code.push(Opcode::FuncInfo { function, arity, frame_size });
        if exported {
            self.exports.push((function, arity, label));
        }
        label
    }

    /// Starts a lambda body and registers it in the lambda table. The body's
    /// declared arity is `arity + env_len`; captured values arrive after the
    /// call arguments.
    pub fn begin_lambda(
        &mut self,
        name: &str,
        arity: Arity,
        env_len: u8,
        frame_size: Register,
    ) -> FunIndex {
        let function = self.atom(name);
        let label = self.new_label();
        self.bind(label);
        let total = arity
            .checked_add(env_len)
            .expect("lambda arity plus captures exceeds 255");
        self.code.push(Opcode::FuncInfo { function, arity: total, frame_size });
        let id = self.funs.len() as FunIndex;
        self.funs.push((function, arity, env_len, label));
        id
    }

    pub fn push(&mut self, op: Opcode) {
        self.code.push(op);
    }

    pub fn build(mut self) -> Result<Image, BuildError> {
        for atom in &self.atoms {
            if atom.len() > u8::MAX as usize {
                return Err(BuildError::AtomTooLong(atom.clone()));
            }
        }

        // Resolve symbolic labels to instruction indices
        let labels = &self.labels;
        let resolve = |label: Label| -> Result<Label, BuildError> {
            labels
                .get(label as usize)
                .copied()
                .flatten()
                .ok_or(BuildError::UnboundLabel(label))
        };

        let mut failure = None;
        for op in self.code.iter_mut() {
            op.for_each_label_mut(&mut |label| match resolve(*label) {
                Ok(bound) => *label = bound,
                Err(err) => failure = Some(err),
            });
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let mut exports = Vec::with_capacity(self.exports.len());
        for (function, arity, label) in &self.exports {
            exports.push(Export { function: *function, arity: *arity, offset: resolve(*label)? });
        }
        let mut funs = Vec::with_capacity(self.funs.len());
        for (function, arity, env_len, label) in &self.funs {
            funs.push(Lambda {
                function: *function,
                arity: *arity,
                env_len: *env_len,
                offset: resolve(*label)?,
            });
        }

        let image = Image {
            version: VERSION,
            atoms: self.atoms,
            imports: self.imports,
            exports,
            literals: self.literals,
            strings: self.strings,
            funs,
            code: self.code,
            lines: None,
            attributes: None,
        };
        image.validate()?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_minimal_module() {
        let mut m = ModuleBuilder::new("arith");
        m.begin_function("double", 1, 2, true);
        m.push(Opcode::Mov { dst: 1, src: 0 });
        m.push(Opcode::Add { dst: 0, a: 0, b: 1 });
        m.push(Opcode::Ret { src: 0 });
        let image = m.build().unwrap();
        assert_eq!(image.module_name(), Some("arith"));
        assert_eq!(image.exports.len(), 1);
        assert_eq!(image.exports[0].offset, 0);
    }

    #[test]
    fn branch_labels_are_patched() {
        let mut m = ModuleBuilder::new("branchy");
        m.begin_function("choose", 1, 2, true);
        let else_label = m.new_label();
        m.push(Opcode::Brf { label: else_label, src: 0 });
        m.push(Opcode::LoadInt { dst: 0, value: 1 });
        m.push(Opcode::Ret { src: 0 });
        m.bind(else_label);
        m.push(Opcode::LoadInt { dst: 0, value: 2 });
        m.push(Opcode::Ret { src: 0 });
        let image = m.build().unwrap();
        match image.code[1] {
            Opcode::Brf { label, .. } => assert_eq!(label, 4),
            ref other => panic!("expected Brf, got {:?}", other),
        }
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut m = ModuleBuilder::new("broken");
        m.begin_function("f", 0, 1, true);
        let never = m.new_label();
        m.push(Opcode::Br { label: never });
        assert!(matches!(m.build(), Err(BuildError::UnboundLabel(_))));
    }

    #[test]
    fn out_of_frame_register_is_rejected() {
        let mut m = ModuleBuilder::new("narrow");
        m.begin_function("f", 0, 1, true);
        m.push(Opcode::Mov { dst: 5, src: 0 });
        m.push(Opcode::Ret { src: 0 });
        assert!(matches!(
            m.build(),
            Err(BuildError::Validate(ValidateError::RegisterOutOfFrame { .. }))
        ));
    }
}
