//! In-memory representation of one class artifact.
//!
//! The model is label-based: branch targets, exception-range boundaries and
//! debug-table anchors are logical [`Label`]s, never byte offsets. Offsets
//! exist only inside the encoder, so mutators can insert and delete
//! instructions freely without renumbering anything.

use crate::constpool::{ConstEntry, ConstPool};
use crate::opcode;
use classcloak_utils::errors::WriterError;
use indexmap::IndexMap;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;

/// A logical marker inside one method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// One instruction, grouped by operand shape rather than by opcode.
///
/// `wide`-prefixed and `_0`..`_3` short forms are normalized into
/// [`Insn::Local`]/[`Insn::Iinc`] at decode time; the encoder picks the
/// shortest valid encoding when laying the method out again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    /// Operand-free opcode (`nop`, `iadd`, `areturn`, `iconst_0`, ...).
    Plain(u8),
    /// `bipush`
    Push8(i8),
    /// `sipush`
    Push16(i16),
    /// `ldc`/`ldc_w`; narrow vs wide form is an encoding detail.
    Ldc(u16),
    /// `ldc2_w`
    Ldc2(u16),
    /// Local-variable access (`iload` .. `astore`, `ret`).
    Local { op: u8, slot: u16 },
    Iinc { slot: u16, delta: i16 },
    /// Any branch (`ifeq` .. `if_acmpne`, `ifnull`/`ifnonnull`, `goto`, `jsr`).
    Branch { op: u8, target: Label },
    /// Constant-pool operand (`getfield`, `invokevirtual`, `new`, ...).
    Cp { op: u8, index: u16 },
    InvokeInterface { index: u16, count: u8 },
    InvokeDynamic { index: u16 },
    NewArray(u8),
    MultiNewArray { index: u16, dims: u8 },
    TableSwitch {
        default: Label,
        low: i32,
        high: i32,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
    /// Label definition pseudo-instruction; occupies no bytes.
    Mark(Label),
}

impl Insn {
    /// Visits every label this instruction references.
    pub fn for_each_target(&self, mut f: impl FnMut(Label)) {
        match self {
            Self::Branch { target, .. } => f(*target),
            Self::TableSwitch {
                default, targets, ..
            } => {
                f(*default);
                targets.iter().copied().for_each(f);
            }
            Self::LookupSwitch { default, pairs } => {
                f(*default);
                pairs.iter().for_each(|(_, l)| f(*l));
            }
            _ => {}
        }
    }
}

/// One entry of a method's exception table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRange {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// `None` catches everything (`finally` ranges).
    pub catch_type: Option<u16>,
}

/// Local-variable-slot metadata from a `LocalVariableTable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVar {
    pub start: Label,
    pub end: Label,
    pub name: u16,
    pub descriptor: u16,
    pub slot: u16,
}

/// The editable body of a concrete method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodBody {
    /// Advisory only; recomputed by abstract interpretation at encode time.
    pub max_stack: u16,
    /// Advisory only; recomputed at encode time.
    pub max_locals: u16,
    pub code: Vec<Insn>,
    pub exceptions: Vec<ExceptionRange>,
    pub line_numbers: Vec<(Label, u16)>,
    pub local_vars: Vec<LocalVar>,
    pub(crate) next_label: u32,
}

impl MethodBody {
    /// Allocates a label unused anywhere in this body.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub(crate) fn reserve_labels(&mut self, count: u32) {
        self.next_label = self.next_label.max(count);
    }

    /// Number of real (non-mark) instructions.
    pub fn insn_count(&self) -> usize {
        self.code
            .iter()
            .filter(|i| !matches!(i, Insn::Mark(_)))
            .count()
    }
}

/// Extension metadata retained verbatim. Only attributes whose payload holds
/// no constant-pool indices survive decoding, so pool compaction cannot
/// invalidate them.
pub type AttrMap = IndexMap<String, Vec<u8>>;

/// One field or method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub access: u16,
    pub name: u16,
    pub descriptor: u16,
    pub signature: Option<u16>,
    /// `ConstantValue` of a static field.
    pub constant_value: Option<u16>,
    /// Declared thrown exceptions of a method (`Class` indices).
    pub throws: Vec<u16>,
    /// Absent for abstract and native methods, and for all fields.
    pub body: Option<MethodBody>,
    pub attrs: AttrMap,
}

impl Member {
    pub fn new(access: u16, name: u16, descriptor: u16) -> Self {
        Self {
            access,
            name,
            descriptor,
            signature: None,
            constant_value: None,
            throws: Vec::new(),
            body: None,
            attrs: AttrMap::new(),
        }
    }
}

/// One bootstrap method from the `BootstrapMethods` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapMethod {
    /// `MethodHandle` pool index.
    pub method_ref: u16,
    /// Loadable pool indices.
    pub args: Vec<u16>,
}

/// One row of the `InnerClasses` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerClass {
    /// `Class` index of the nested class itself.
    pub inner: u16,
    /// Declaring class; `None` for local and anonymous classes.
    pub outer: Option<u16>,
    /// Simple name; `None` for anonymous classes.
    pub name: Option<u16>,
    pub access: u16,
}

/// The structural model of one decoded class artifact.
#[derive(Debug, Clone)]
pub struct ClassModel {
    pub minor: u16,
    pub major: u16,
    pub access: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<Member>,
    pub methods: Vec<Member>,
    pub pool: ConstPool,
    pub source_file: Option<u16>,
    pub signature: Option<u16>,
    pub bootstrap_methods: Vec<BootstrapMethod>,
    /// `NestHost`: the class whose nest this class belongs to.
    pub nest_host: Option<u16>,
    /// `NestMembers`: classes allowed private access to this one.
    pub nest_members: Vec<u16>,
    pub inner_classes: Vec<InnerClass>,
    /// `EnclosingMethod`: immediately enclosing class plus the enclosing
    /// method's `NameAndType`, absent when the class sits in an initializer.
    pub enclosing_method: Option<(u16, Option<u16>)>,
    pub attrs: AttrMap,
}

impl ClassModel {
    pub fn this_class_name(&self) -> Option<&str> {
        self.pool.class_name(self.this_class)
    }

    pub fn member_name(&self, member: &Member) -> &str {
        self.pool.utf8(member.name).unwrap_or("<unknown>")
    }

    /// True when a method with the given name and descriptor already exists.
    pub fn has_method(&self, name: &str, descriptor: &str) -> bool {
        self.methods.iter().any(|m| {
            self.pool.utf8(m.name) == Some(name) && self.pool.utf8(m.descriptor) == Some(descriptor)
        })
    }

    /// Structural invariant closure, enforced by the framework after every
    /// mutator pass and again before encoding: every referenced label is
    /// defined exactly once in its owning body, and every constant-pool index
    /// in use resolves to an entry with a compatible tag.
    pub fn verify(&self) -> Result<(), WriterError> {
        self.check_class_refs()?;
        for member in self.fields.iter().chain(&self.methods) {
            self.check_member(member)?;
        }
        Ok(())
    }

    fn check_class_refs(&self) -> Result<(), WriterError> {
        self.expect_class(self.this_class, "this_class")?;
        if self.super_class != 0 {
            self.expect_class(self.super_class, "super_class")?;
        }
        for &iface in &self.interfaces {
            self.expect_class(iface, "interfaces")?;
        }
        if let Some(idx) = self.source_file {
            self.expect_utf8(idx, "SourceFile")?;
        }
        if let Some(idx) = self.signature {
            self.expect_utf8(idx, "Signature")?;
        }
        if let Some(idx) = self.nest_host {
            self.expect_class(idx, "NestHost")?;
        }
        for &member in &self.nest_members {
            self.expect_class(member, "NestMembers")?;
        }
        for inner in &self.inner_classes {
            self.expect_class(inner.inner, "InnerClasses")?;
            if let Some(outer) = inner.outer {
                self.expect_class(outer, "InnerClasses outer")?;
            }
            if let Some(name) = inner.name {
                self.expect_utf8(name, "InnerClasses name")?;
            }
        }
        if let Some((owner, method)) = self.enclosing_method {
            self.expect_class(owner, "EnclosingMethod class")?;
            if let Some(nat) = method {
                match self.pool.get(nat) {
                    Some(ConstEntry::NameAndType { .. }) => {}
                    Some(_) => {
                        return Err(WriterError::TagMismatch {
                            index: nat,
                            context: "EnclosingMethod method",
                        })
                    }
                    None => {
                        return Err(WriterError::DanglingIndex {
                            index: nat,
                            context: "EnclosingMethod method",
                        })
                    }
                }
            }
        }
        for bsm in &self.bootstrap_methods {
            match self.pool.get(bsm.method_ref) {
                Some(ConstEntry::MethodHandle { .. }) => {}
                Some(_) => {
                    return Err(WriterError::TagMismatch {
                        index: bsm.method_ref,
                        context: "BootstrapMethods handle",
                    })
                }
                None => {
                    return Err(WriterError::DanglingIndex {
                        index: bsm.method_ref,
                        context: "BootstrapMethods handle",
                    })
                }
            }
            for &arg in &bsm.args {
                if self.pool.get(arg).is_none() {
                    return Err(WriterError::DanglingIndex {
                        index: arg,
                        context: "BootstrapMethods argument",
                    });
                }
            }
        }
        Ok(())
    }

    fn check_member(&self, member: &Member) -> Result<(), WriterError> {
        self.expect_utf8(member.name, "member name")?;
        self.expect_utf8(member.descriptor, "member descriptor")?;
        if let Some(idx) = member.signature {
            self.expect_utf8(idx, "Signature")?;
        }
        if let Some(idx) = member.constant_value {
            match self.pool.get(idx) {
                Some(e) if e.is_loadable_narrow() || e.is_loadable_wide() => {}
                Some(_) => {
                    return Err(WriterError::TagMismatch {
                        index: idx,
                        context: "ConstantValue",
                    })
                }
                None => {
                    return Err(WriterError::DanglingIndex {
                        index: idx,
                        context: "ConstantValue",
                    })
                }
            }
        }
        for &thrown in &member.throws {
            self.expect_class(thrown, "Exceptions")?;
        }
        if let Some(body) = &member.body {
            self.check_body(body)?;
        }
        Ok(())
    }

    fn check_body(&self, body: &MethodBody) -> Result<(), WriterError> {
        let mut defined = std::collections::HashSet::new();
        for insn in &body.code {
            if let Insn::Mark(label) = insn {
                if !defined.insert(*label) {
                    return Err(WriterError::DuplicateLabel(label.0));
                }
            }
        }
        let mut check_label = |label: Label| {
            if defined.contains(&label) {
                Ok(())
            } else {
                Err(WriterError::UnresolvedLabel(label.0))
            }
        };
        for insn in &body.code {
            let mut bad = None;
            insn.for_each_target(|l| {
                if bad.is_none() && !defined.contains(&l) {
                    bad = Some(l);
                }
            });
            if let Some(l) = bad {
                return Err(WriterError::UnresolvedLabel(l.0));
            }
            self.check_insn_refs(insn)?;
        }
        for range in &body.exceptions {
            check_label(range.start)?;
            check_label(range.end)?;
            check_label(range.handler)?;
            if let Some(catch) = range.catch_type {
                self.expect_class(catch, "exception catch_type")?;
            }
        }
        for &(label, _) in &body.line_numbers {
            check_label(label)?;
        }
        for var in &body.local_vars {
            check_label(var.start)?;
            check_label(var.end)?;
            self.expect_utf8(var.name, "LocalVariableTable name")?;
            self.expect_utf8(var.descriptor, "LocalVariableTable descriptor")?;
        }
        Ok(())
    }

    fn check_insn_refs(&self, insn: &Insn) -> Result<(), WriterError> {
        match insn {
            Insn::Ldc(index) => match self.pool.get(*index) {
                Some(e) if e.is_loadable_narrow() => Ok(()),
                Some(_) => Err(WriterError::TagMismatch {
                    index: *index,
                    context: "ldc",
                }),
                None => Err(WriterError::DanglingIndex {
                    index: *index,
                    context: "ldc",
                }),
            },
            Insn::Ldc2(index) => match self.pool.get(*index) {
                Some(e) if e.is_loadable_wide() => Ok(()),
                Some(_) => Err(WriterError::TagMismatch {
                    index: *index,
                    context: "ldc2_w",
                }),
                None => Err(WriterError::DanglingIndex {
                    index: *index,
                    context: "ldc2_w",
                }),
            },
            Insn::Cp { op, index } => {
                let entry = self.pool.get(*index).ok_or(WriterError::DanglingIndex {
                    index: *index,
                    context: "instruction operand",
                })?;
                let ok = match *op {
                    opcode::GETSTATIC..=opcode::PUTFIELD => {
                        matches!(entry, ConstEntry::FieldRef { .. })
                    }
                    opcode::INVOKEVIRTUAL..=opcode::INVOKESTATIC => matches!(
                        entry,
                        ConstEntry::MethodRef { .. } | ConstEntry::InterfaceMethodRef { .. }
                    ),
                    opcode::NEW
                    | opcode::ANEWARRAY
                    | opcode::CHECKCAST
                    | opcode::INSTANCEOF => {
                        matches!(entry, ConstEntry::Class { .. })
                    }
                    _ => true,
                };
                if ok {
                    Ok(())
                } else {
                    Err(WriterError::TagMismatch {
                        index: *index,
                        context: "instruction operand",
                    })
                }
            }
            Insn::InvokeInterface { index, .. } => match self.pool.get(*index) {
                Some(ConstEntry::InterfaceMethodRef { .. }) => Ok(()),
                Some(_) => Err(WriterError::TagMismatch {
                    index: *index,
                    context: "invokeinterface",
                }),
                None => Err(WriterError::DanglingIndex {
                    index: *index,
                    context: "invokeinterface",
                }),
            },
            Insn::InvokeDynamic { index } => match self.pool.get(*index) {
                Some(ConstEntry::InvokeDynamic { bootstrap, .. }) => {
                    if (*bootstrap as usize) < self.bootstrap_methods.len() {
                        Ok(())
                    } else {
                        Err(WriterError::DanglingIndex {
                            index: *bootstrap,
                            context: "invokedynamic bootstrap",
                        })
                    }
                }
                Some(_) => Err(WriterError::TagMismatch {
                    index: *index,
                    context: "invokedynamic",
                }),
                None => Err(WriterError::DanglingIndex {
                    index: *index,
                    context: "invokedynamic",
                }),
            },
            Insn::MultiNewArray { index, .. } => self.expect_class(*index, "multianewarray"),
            _ => Ok(()),
        }
    }

    fn expect_class(&self, index: u16, context: &'static str) -> Result<(), WriterError> {
        match self.pool.get(index) {
            Some(ConstEntry::Class { .. }) => Ok(()),
            Some(_) => Err(WriterError::TagMismatch { index, context }),
            None => Err(WriterError::DanglingIndex { index, context }),
        }
    }

    fn expect_utf8(&self, index: u16, context: &'static str) -> Result<(), WriterError> {
        match self.pool.get(index) {
            Some(ConstEntry::Utf8(_)) => Ok(()),
            Some(_) => Err(WriterError::TagMismatch { index, context }),
            None => Err(WriterError::DanglingIndex { index, context }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_class() -> ClassModel {
        let mut pool = ConstPool::new();
        let this_class = pool.intern_class("Sample");
        let super_class = pool.intern_class("java/lang/Object");
        ClassModel {
            minor: 0,
            major: 52,
            access: ACC_PUBLIC | ACC_SUPER,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            pool,
            source_file: None,
            signature: None,
            bootstrap_methods: Vec::new(),
            nest_host: None,
            nest_members: Vec::new(),
            inner_classes: Vec::new(),
            enclosing_method: None,
            attrs: AttrMap::new(),
        }
    }

    #[test]
    fn verify_accepts_minimal_class() {
        empty_class().verify().unwrap();
    }

    #[test]
    fn body_built_by_struct_update_allocates_fresh_labels() {
        let mut body = MethodBody {
            max_stack: 2,
            max_locals: 1,
            ..MethodBody::default()
        };
        assert_eq!(body.new_label(), Label(0));
        assert_eq!(body.new_label(), Label(1));
    }

    #[test]
    fn verify_rejects_unresolved_label() {
        let mut class = empty_class();
        let name = class.pool.intern_utf8("m");
        let desc = class.pool.intern_utf8("()V");
        let mut member = Member::new(ACC_STATIC, name, desc);
        let mut body = MethodBody::default();
        let nowhere = body.new_label();
        body.code.push(Insn::Branch {
            op: opcode::GOTO,
            target: nowhere,
        });
        member.body = Some(body);
        class.methods.push(member);
        assert!(matches!(
            class.verify(),
            Err(WriterError::UnresolvedLabel(_))
        ));
    }

    #[test]
    fn verify_rejects_dangling_pool_index() {
        let mut class = empty_class();
        let name = class.pool.intern_utf8("m");
        let desc = class.pool.intern_utf8("()V");
        let mut member = Member::new(ACC_STATIC, name, desc);
        let mut body = MethodBody::default();
        body.code.push(Insn::Ldc(999));
        body.code.push(Insn::Plain(opcode::RETURN));
        member.body = Some(body);
        class.methods.push(member);
        assert!(matches!(
            class.verify(),
            Err(WriterError::DanglingIndex { .. })
        ));
    }
}
