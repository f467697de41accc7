//! Turns raw class bytes into the label-based structural model.
//!
//! Decoding is strict: every length field is bounds-checked, every pool index
//! is validated against its use site, and any malformed input surfaces as a
//! [`ParseError`] rather than a partially built model. The constant table is
//! built first since everything downstream references it.

use crate::constpool::{ConstEntry, ConstPool};
use crate::model::{
    AttrMap, BootstrapMethod, ClassModel, ExceptionRange, InnerClass, Insn, Label, LocalVar,
    Member, MethodBody, ACC_ABSTRACT, ACC_NATIVE,
};
use crate::opcode as op;
use classcloak_utils::errors::ParseError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const MAGIC: u32 = 0xCAFE_BABE;
const MIN_MAJOR: u16 = 45;
const MAX_MAJOR: u16 = 65;

/// Decodes one class artifact into a [`ClassModel`].
pub fn decode(bytes: &[u8]) -> Result<ClassModel, ParseError> {
    let mut r = Reader::new(bytes);

    let magic = r.u4()?;
    if magic != MAGIC {
        return Err(ParseError::BadMagic(magic));
    }
    let minor = r.u2()?;
    let major = r.u2()?;
    if !(MIN_MAJOR..=MAX_MAJOR).contains(&major) {
        return Err(ParseError::UnsupportedVersion { major, minor });
    }

    let pool = read_pool(&mut r)?;

    let access = r.u2()?;
    let this_class = expect_tag(&pool, r.u2()?, 7, "this_class")?;
    let super_idx = r.u2()?;
    let super_class = if super_idx == 0 {
        0
    } else {
        expect_tag(&pool, super_idx, 7, "super_class")?
    };

    let iface_count = r.u2()? as usize;
    let mut interfaces = Vec::with_capacity(iface_count);
    for _ in 0..iface_count {
        interfaces.push(expect_tag(&pool, r.u2()?, 7, "interfaces")?);
    }

    let fields = read_members(&mut r, &pool, false)?;
    let methods = read_members(&mut r, &pool, true)?;

    let mut model = ClassModel {
        minor,
        major,
        access,
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        pool,
        source_file: None,
        signature: None,
        bootstrap_methods: Vec::new(),
        nest_host: None,
        nest_members: Vec::new(),
        inner_classes: Vec::new(),
        enclosing_method: None,
        attrs: AttrMap::new(),
    };
    read_class_attributes(&mut r, &mut model)?;

    if r.remaining() != 0 {
        return Err(ParseError::TrailingBytes(r.remaining()));
    }
    debug!(
        class = model.this_class_name().unwrap_or("<unnamed>"),
        methods = model.methods.len(),
        fields = model.fields.len(),
        pool_slots = model.pool.slot_count(),
        "decoded class"
    );
    Ok(model)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.bytes.len())
            .ok_or(ParseError::UnexpectedEof(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u1(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn u2(&mut self) -> Result<u16, ParseError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u4(&mut self) -> Result<u32, ParseError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i1(&mut self) -> Result<i8, ParseError> {
        Ok(self.u1()? as i8)
    }

    fn i2(&mut self) -> Result<i16, ParseError> {
        Ok(self.u2()? as i16)
    }

    fn i4(&mut self) -> Result<i32, ParseError> {
        Ok(self.u4()? as i32)
    }
}

// ---------------------------------------------------------------- constant pool

fn read_pool(r: &mut Reader<'_>) -> Result<ConstPool, ParseError> {
    let count = r.u2()? as usize;
    let mut slots: Vec<Option<ConstEntry>> = Vec::with_capacity(count.max(1));
    slots.push(None);

    while slots.len() < count {
        let index = slots.len() as u16;
        let tag = r.u1()?;
        let entry = match tag {
            1 => {
                let len = r.u2()? as usize;
                let raw = r.take(len)?;
                ConstEntry::Utf8(decode_mutf8(raw).ok_or(ParseError::BadUtf8(index))?)
            }
            3 => ConstEntry::Integer(r.i4()?),
            4 => ConstEntry::Float(r.u4()?),
            5 => ConstEntry::Long(((r.u4()? as i64) << 32) | r.u4()? as i64),
            6 => ConstEntry::Double(((r.u4()? as u64) << 32) | r.u4()? as u64),
            7 => ConstEntry::Class { name: r.u2()? },
            8 => ConstEntry::Str { utf8: r.u2()? },
            9 => ConstEntry::FieldRef {
                class: r.u2()?,
                name_and_type: r.u2()?,
            },
            10 => ConstEntry::MethodRef {
                class: r.u2()?,
                name_and_type: r.u2()?,
            },
            11 => ConstEntry::InterfaceMethodRef {
                class: r.u2()?,
                name_and_type: r.u2()?,
            },
            12 => ConstEntry::NameAndType {
                name: r.u2()?,
                descriptor: r.u2()?,
            },
            15 => ConstEntry::MethodHandle {
                kind: r.u1()?,
                reference: r.u2()?,
            },
            16 => ConstEntry::MethodType { descriptor: r.u2()? },
            17 => ConstEntry::Dynamic {
                bootstrap: r.u2()?,
                name_and_type: r.u2()?,
            },
            18 => ConstEntry::InvokeDynamic {
                bootstrap: r.u2()?,
                name_and_type: r.u2()?,
            },
            19 => ConstEntry::Module { name: r.u2()? },
            20 => ConstEntry::Package { name: r.u2()? },
            _ => return Err(ParseError::BadConstantTag { tag, index }),
        };
        let wide = entry.is_wide();
        slots.push(Some(entry));
        if wide {
            slots.push(None);
        }
    }
    if slots.len() != count && count > 0 {
        // A wide entry in the final slot overran the declared count.
        return Err(ParseError::IndexOutOfRange {
            index: count as u16,
            context: "constant pool count",
        });
    }

    validate_pool(&slots)?;
    Ok(ConstPool::from_slots(slots))
}

/// Checks that every intra-pool reference resolves to a compatible tag.
fn validate_pool(slots: &[Option<ConstEntry>]) -> Result<(), ParseError> {
    let check = |idx: u16, want: &[u8], context: &'static str| -> Result<(), ParseError> {
        match slots.get(idx as usize).and_then(|s| s.as_ref()) {
            Some(e) if want.contains(&e.tag()) => Ok(()),
            Some(_) => Err(ParseError::TagMismatch {
                index: idx,
                context,
            }),
            None => Err(ParseError::IndexOutOfRange {
                index: idx,
                context,
            }),
        }
    };
    for entry in slots.iter().flatten() {
        match entry {
            ConstEntry::Class { name }
            | ConstEntry::Module { name }
            | ConstEntry::Package { name } => check(*name, &[1], "name reference")?,
            ConstEntry::Str { utf8 } => check(*utf8, &[1], "string value")?,
            ConstEntry::MethodType { descriptor } => check(*descriptor, &[1], "method type")?,
            ConstEntry::FieldRef {
                class,
                name_and_type,
            }
            | ConstEntry::MethodRef {
                class,
                name_and_type,
            }
            | ConstEntry::InterfaceMethodRef {
                class,
                name_and_type,
            } => {
                check(*class, &[7], "member owner")?;
                check(*name_and_type, &[12], "member name and type")?;
            }
            ConstEntry::NameAndType { name, descriptor } => {
                check(*name, &[1], "name")?;
                check(*descriptor, &[1], "descriptor")?;
            }
            ConstEntry::MethodHandle { reference, .. } => {
                check(*reference, &[9, 10, 11], "method handle")?
            }
            ConstEntry::Dynamic { name_and_type, .. }
            | ConstEntry::InvokeDynamic { name_and_type, .. } => {
                check(*name_and_type, &[12], "dynamic call site")?
            }
            _ => {}
        }
    }
    Ok(())
}

fn expect_tag(
    pool: &ConstPool,
    index: u16,
    tag: u8,
    context: &'static str,
) -> Result<u16, ParseError> {
    match pool.get(index) {
        Some(e) if e.tag() == tag => Ok(index),
        Some(_) => Err(ParseError::TagMismatch { index, context }),
        None => Err(ParseError::IndexOutOfRange { index, context }),
    }
}

// ---------------------------------------------------------------------- members

fn read_members(
    r: &mut Reader<'_>,
    pool: &ConstPool,
    methods: bool,
) -> Result<Vec<Member>, ParseError> {
    let count = r.u2()? as usize;
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        let access = r.u2()?;
        let name = expect_tag(pool, r.u2()?, 1, "member name")?;
        let descriptor = expect_tag(pool, r.u2()?, 1, "member descriptor")?;
        let mut member = Member::new(access, name, descriptor);

        let attr_count = r.u2()? as usize;
        for _ in 0..attr_count {
            let attr_name_idx = expect_tag(pool, r.u2()?, 1, "attribute name")?;
            let attr_len = r.u4()? as usize;
            let payload = r.take(attr_len)?;
            let attr_name = pool.utf8(attr_name_idx).unwrap_or_default();
            match attr_name {
                "Code" if methods => {
                    member.body = Some(read_code(payload, pool)?);
                }
                "ConstantValue" if !methods => {
                    let mut pr = Reader::new(payload);
                    member.constant_value = Some(pr.u2()?);
                }
                "Exceptions" if methods => {
                    let mut pr = Reader::new(payload);
                    let n = pr.u2()? as usize;
                    for _ in 0..n {
                        member
                            .throws
                            .push(expect_tag(pool, pr.u2()?, 7, "Exceptions")?);
                    }
                }
                "Signature" => {
                    let mut pr = Reader::new(payload);
                    member.signature = Some(expect_tag(pool, pr.u2()?, 1, "Signature")?);
                }
                "Deprecated" | "Synthetic" => {
                    member.attrs.insert(attr_name.to_owned(), payload.to_vec());
                }
                other => {
                    // Payload may embed pool indices that compaction would
                    // invalidate, so it cannot be carried opaquely.
                    debug!(attribute = other, "dropping unmodeled member attribute");
                }
            }
        }
        if methods && member.access & (ACC_ABSTRACT | ACC_NATIVE) == 0 && member.body.is_none() {
            debug!(
                member = pool.utf8(member.name).unwrap_or_default(),
                "concrete method without Code attribute"
            );
        }
        members.push(member);
    }
    Ok(members)
}

fn read_class_attributes(r: &mut Reader<'_>, model: &mut ClassModel) -> Result<(), ParseError> {
    let attr_count = r.u2()? as usize;
    for _ in 0..attr_count {
        let attr_name_idx = expect_tag(&model.pool, r.u2()?, 1, "attribute name")?;
        let attr_len = r.u4()? as usize;
        let payload = r.take(attr_len)?;
        let attr_name = model.pool.utf8(attr_name_idx).unwrap_or_default().to_owned();
        match attr_name.as_str() {
            "SourceFile" => {
                let mut pr = Reader::new(payload);
                model.source_file = Some(expect_tag(&model.pool, pr.u2()?, 1, "SourceFile")?);
            }
            "Signature" => {
                let mut pr = Reader::new(payload);
                model.signature = Some(expect_tag(&model.pool, pr.u2()?, 1, "Signature")?);
            }
            "BootstrapMethods" => {
                let mut pr = Reader::new(payload);
                let n = pr.u2()? as usize;
                for _ in 0..n {
                    let method_ref =
                        expect_tag(&model.pool, pr.u2()?, 15, "BootstrapMethods handle")?;
                    let argc = pr.u2()? as usize;
                    let mut args = Vec::with_capacity(argc);
                    for _ in 0..argc {
                        let arg = pr.u2()?;
                        if model.pool.get(arg).is_none() {
                            return Err(ParseError::IndexOutOfRange {
                                index: arg,
                                context: "BootstrapMethods argument",
                            });
                        }
                        args.push(arg);
                    }
                    model
                        .bootstrap_methods
                        .push(BootstrapMethod { method_ref, args });
                }
            }
            "NestHost" => {
                let mut pr = Reader::new(payload);
                model.nest_host = Some(expect_tag(&model.pool, pr.u2()?, 7, "NestHost")?);
            }
            "NestMembers" => {
                let mut pr = Reader::new(payload);
                let n = pr.u2()? as usize;
                for _ in 0..n {
                    model
                        .nest_members
                        .push(expect_tag(&model.pool, pr.u2()?, 7, "NestMembers")?);
                }
            }
            "InnerClasses" => {
                let mut pr = Reader::new(payload);
                let n = pr.u2()? as usize;
                for _ in 0..n {
                    let inner = expect_tag(&model.pool, pr.u2()?, 7, "InnerClasses")?;
                    let outer = pr.u2()?;
                    let outer = (outer != 0)
                        .then(|| expect_tag(&model.pool, outer, 7, "InnerClasses outer"))
                        .transpose()?;
                    let name = pr.u2()?;
                    let name = (name != 0)
                        .then(|| expect_tag(&model.pool, name, 1, "InnerClasses name"))
                        .transpose()?;
                    let access = pr.u2()?;
                    model.inner_classes.push(InnerClass {
                        inner,
                        outer,
                        name,
                        access,
                    });
                }
            }
            "EnclosingMethod" => {
                let mut pr = Reader::new(payload);
                let owner = expect_tag(&model.pool, pr.u2()?, 7, "EnclosingMethod class")?;
                let method = pr.u2()?;
                let method = (method != 0)
                    .then(|| expect_tag(&model.pool, method, 12, "EnclosingMethod method"))
                    .transpose()?;
                model.enclosing_method = Some((owner, method));
            }
            "Deprecated" | "Synthetic" => {
                model.attrs.insert(attr_name, payload.to_vec());
            }
            other => {
                debug!(attribute = other, "dropping unmodeled class attribute");
            }
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------- code

struct RawCode<'a> {
    max_stack: u16,
    max_locals: u16,
    code: &'a [u8],
    exceptions: Vec<(u16, u16, u16, u16)>,
    lines: Vec<(u16, u16)>,
    vars: Vec<(u16, u16, u16, u16, u16)>,
}

fn read_code(payload: &[u8], pool: &ConstPool) -> Result<MethodBody, ParseError> {
    let mut r = Reader::new(payload);
    let max_stack = r.u2()?;
    let max_locals = r.u2()?;
    let code_len = r.u4()? as usize;
    let code = r.take(code_len)?;

    let exc_count = r.u2()? as usize;
    let mut exceptions = Vec::with_capacity(exc_count);
    for _ in 0..exc_count {
        let start = r.u2()?;
        let end = r.u2()?;
        let handler = r.u2()?;
        let catch_type = r.u2()?;
        if catch_type != 0 {
            expect_tag(pool, catch_type, 7, "exception catch_type")?;
        }
        exceptions.push((start, end, handler, catch_type));
    }

    let mut lines = Vec::new();
    let mut vars = Vec::new();
    let attr_count = r.u2()? as usize;
    for _ in 0..attr_count {
        let attr_name_idx = expect_tag(pool, r.u2()?, 1, "attribute name")?;
        let attr_len = r.u4()? as usize;
        let sub = r.take(attr_len)?;
        match pool.utf8(attr_name_idx).unwrap_or_default() {
            "LineNumberTable" => {
                let mut pr = Reader::new(sub);
                let n = pr.u2()? as usize;
                for _ in 0..n {
                    lines.push((pr.u2()?, pr.u2()?));
                }
            }
            "LocalVariableTable" => {
                let mut pr = Reader::new(sub);
                let n = pr.u2()? as usize;
                for _ in 0..n {
                    let start = pr.u2()?;
                    let length = pr.u2()?;
                    let name = expect_tag(pool, pr.u2()?, 1, "LocalVariableTable name")?;
                    let descriptor = expect_tag(pool, pr.u2()?, 1, "LocalVariableTable descriptor")?;
                    let slot = pr.u2()?;
                    vars.push((start, length, name, descriptor, slot));
                }
            }
            // Frame data is derived state; the encoder regenerates it after
            // mutation, so the stale table is discarded here.
            "StackMapTable" => {}
            other => {
                debug!(attribute = other, "dropping unmodeled code attribute");
            }
        }
    }

    translate_code(RawCode {
        max_stack,
        max_locals,
        code,
        exceptions,
        lines,
        vars,
    })
}

/// Translates a raw bytecode stream into the label-based instruction
/// sequence. Pass one finds instruction boundaries and every offset that
/// needs a label; pass two emits `Insn`s with `Mark`s interleaved.
fn translate_code(raw: RawCode<'_>) -> Result<MethodBody, ParseError> {
    let code = raw.code;
    let mut boundaries = BTreeSet::new();
    let mut targets: Vec<(usize, i64)> = Vec::new();
    let mut needed: BTreeSet<usize> = BTreeSet::new();

    let mut pos = 0usize;
    while pos < code.len() {
        boundaries.insert(pos);
        let (len, insn_targets) = scan_insn(code, pos)?;
        if pos + len > code.len() {
            return Err(ParseError::UnexpectedEof(pos));
        }
        for t in insn_targets {
            targets.push((pos, t));
            if t >= 0 {
                needed.insert(t as usize);
            }
        }
        pos += len;
    }
    boundaries.insert(code.len());

    for (offset, target) in &targets {
        if *target < 0 || !boundaries.contains(&(*target as usize)) || *target as usize == code.len()
        {
            return Err(ParseError::BadBranchTarget {
                offset: *offset,
                target: *target,
            });
        }
    }
    let end_label_guard = |off: u16, ctx: usize| -> Result<usize, ParseError> {
        let off = off as usize;
        if boundaries.contains(&off) {
            Ok(off)
        } else {
            Err(ParseError::BadBranchTarget {
                offset: ctx,
                target: off as i64,
            })
        }
    };
    for &(start, end, handler, _) in &raw.exceptions {
        needed.insert(end_label_guard(start, 0)?);
        needed.insert(end_label_guard(end, 0)?);
        let h = end_label_guard(handler, 0)?;
        if h == code.len() {
            return Err(ParseError::BadBranchTarget {
                offset: 0,
                target: h as i64,
            });
        }
        needed.insert(h);
    }
    for &(off, _) in &raw.lines {
        needed.insert(end_label_guard(off, 0)?);
    }
    for &(start, length, ..) in &raw.vars {
        needed.insert(end_label_guard(start, 0)?);
        needed.insert(end_label_guard(start.saturating_add(length), 0)?);
    }

    let labels: BTreeMap<usize, Label> = needed
        .iter()
        .enumerate()
        .map(|(i, &off)| (off, Label(i as u32)))
        .collect();

    let mut body = MethodBody {
        max_stack: raw.max_stack,
        max_locals: raw.max_locals,
        ..MethodBody::default()
    };
    body.reserve_labels(labels.len() as u32);

    let mut pos = 0usize;
    while pos < code.len() {
        if let Some(label) = labels.get(&pos) {
            body.code.push(Insn::Mark(*label));
        }
        let (insn, len) = build_insn(code, pos, &labels)?;
        body.code.push(insn);
        pos += len;
    }
    if let Some(label) = labels.get(&code.len()) {
        body.code.push(Insn::Mark(*label));
    }

    for (start, end, handler, catch_type) in raw.exceptions {
        body.exceptions.push(ExceptionRange {
            start: labels[&(start as usize)],
            end: labels[&(end as usize)],
            handler: labels[&(handler as usize)],
            catch_type: (catch_type != 0).then_some(catch_type),
        });
    }
    for (off, line) in raw.lines {
        body.line_numbers.push((labels[&(off as usize)], line));
    }
    for (start, length, name, descriptor, slot) in raw.vars {
        body.local_vars.push(LocalVar {
            start: labels[&(start as usize)],
            end: labels[&(start.saturating_add(length) as usize)],
            name,
            descriptor,
            slot,
        });
    }
    Ok(body)
}

/// Returns (instruction length, absolute branch targets) at `pos`.
fn scan_insn(code: &[u8], pos: usize) -> Result<(usize, Vec<i64>), ParseError> {
    let mut r = Reader::new(&code[pos..]);
    let opcode = r.u1().map_err(|_| ParseError::UnexpectedEof(pos))?;
    let eof = |_: ParseError| ParseError::UnexpectedEof(pos);
    let base = pos as i64;
    Ok(match opcode {
        0x00..=0x0f | 0x1a..=0x35 | 0x3b..=0x83 | 0x85..=0x98 | op::IRETURN..=op::RETURN => {
            (1, Vec::new())
        }
        op::ARRAYLENGTH | op::ATHROW | op::MONITORENTER | op::MONITOREXIT => (1, Vec::new()),
        op::BIPUSH | op::LDC | op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE | op::RET
        | op::NEWARRAY => (2, Vec::new()),
        op::SIPUSH | op::LDC_W | op::LDC2_W | op::IINC | op::GETSTATIC..=op::INVOKESTATIC
        | op::NEW | op::ANEWARRAY | op::CHECKCAST | op::INSTANCEOF => (3, Vec::new()),
        op::IFEQ..=op::JSR | op::IFNULL | op::IFNONNULL => {
            let delta = r.i2().map_err(eof)?;
            (3, vec![base + delta as i64])
        }
        op::GOTO_W | op::JSR_W => {
            let delta = r.i4().map_err(eof)?;
            (5, vec![base + delta as i64])
        }
        op::MULTIANEWARRAY => (4, Vec::new()),
        op::INVOKEINTERFACE | op::INVOKEDYNAMIC => (5, Vec::new()),
        op::WIDE => {
            let sub = *code.get(pos + 1).ok_or(ParseError::UnexpectedEof(pos))?;
            match sub {
                op::IINC => (6, Vec::new()),
                op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE | op::RET => (4, Vec::new()),
                _ => {
                    return Err(ParseError::BadOpcode {
                        opcode: sub,
                        offset: pos + 1,
                    })
                }
            }
        }
        op::TABLESWITCH => {
            let pad = 3 - (pos % 4);
            let mut rr =
                Reader::new(code.get(pos + 1 + pad..).ok_or(ParseError::UnexpectedEof(pos))?);
            let default = rr.i4().map_err(eof)?;
            let low = rr.i4().map_err(eof)?;
            let high = rr.i4().map_err(eof)?;
            if high < low {
                return Err(ParseError::BadOpcode {
                    opcode,
                    offset: pos,
                });
            }
            let n = (high - low + 1) as usize;
            let mut ts = Vec::with_capacity(n + 1);
            ts.push(base + default as i64);
            for _ in 0..n {
                ts.push(base + rr.i4().map_err(eof)? as i64);
            }
            (1 + pad + 12 + 4 * n, ts)
        }
        op::LOOKUPSWITCH => {
            let pad = 3 - (pos % 4);
            let mut rr =
                Reader::new(code.get(pos + 1 + pad..).ok_or(ParseError::UnexpectedEof(pos))?);
            let default = rr.i4().map_err(eof)?;
            let npairs = rr.i4().map_err(eof)?;
            if npairs < 0 {
                return Err(ParseError::BadOpcode {
                    opcode,
                    offset: pos,
                });
            }
            let n = npairs as usize;
            let mut ts = Vec::with_capacity(n + 1);
            ts.push(base + default as i64);
            for _ in 0..n {
                rr.i4().map_err(eof)?;
                ts.push(base + rr.i4().map_err(eof)? as i64);
            }
            (1 + pad + 8 + 8 * n, ts)
        }
        _ => {
            return Err(ParseError::BadOpcode {
                opcode,
                offset: pos,
            })
        }
    })
}

/// Builds the model instruction at `pos`; lengths were validated by
/// [`scan_insn`], so reads here cannot overrun.
fn build_insn(
    code: &[u8],
    pos: usize,
    labels: &BTreeMap<usize, Label>,
) -> Result<(Insn, usize), ParseError> {
    let mut r = Reader::new(&code[pos..]);
    let opcode = r.u1()?;
    let base = pos as i64;
    let label_at = |target: i64, offset: usize| -> Result<Label, ParseError> {
        labels
            .get(&(target as usize))
            .copied()
            .ok_or(ParseError::BadBranchTarget { offset, target })
    };
    Ok(match opcode {
        op::BIPUSH => (Insn::Push8(r.i1()?), 2),
        op::SIPUSH => (Insn::Push16(r.i2()?), 3),
        op::LDC => (Insn::Ldc(r.u1()? as u16), 2),
        op::LDC_W => (Insn::Ldc(r.u2()?), 3),
        op::LDC2_W => (Insn::Ldc2(r.u2()?), 3),
        op::ILOAD..=op::ALOAD => (
            Insn::Local {
                op: opcode,
                slot: r.u1()? as u16,
            },
            2,
        ),
        0x1a..=0x2d => (
            Insn::Local {
                op: op::ILOAD + (opcode - 0x1a) / 4,
                slot: ((opcode - 0x1a) % 4) as u16,
            },
            1,
        ),
        op::ISTORE..=op::ASTORE => (
            Insn::Local {
                op: opcode,
                slot: r.u1()? as u16,
            },
            2,
        ),
        0x3b..=0x4e => (
            Insn::Local {
                op: op::ISTORE + (opcode - 0x3b) / 4,
                slot: ((opcode - 0x3b) % 4) as u16,
            },
            1,
        ),
        op::RET => (
            Insn::Local {
                op: op::RET,
                slot: r.u1()? as u16,
            },
            2,
        ),
        op::IINC => (
            Insn::Iinc {
                slot: r.u1()? as u16,
                delta: r.i1()? as i16,
            },
            3,
        ),
        op::IFEQ..=op::JSR | op::IFNULL | op::IFNONNULL => {
            let delta = r.i2()?;
            (
                Insn::Branch {
                    op: opcode,
                    target: label_at(base + delta as i64, pos)?,
                },
                3,
            )
        }
        op::GOTO_W | op::JSR_W => {
            let delta = r.i4()?;
            let narrow = if opcode == op::GOTO_W { op::GOTO } else { op::JSR };
            (
                Insn::Branch {
                    op: narrow,
                    target: label_at(base + delta as i64, pos)?,
                },
                5,
            )
        }
        op::GETSTATIC..=op::INVOKESTATIC | op::NEW | op::ANEWARRAY | op::CHECKCAST
        | op::INSTANCEOF => (
            Insn::Cp {
                op: opcode,
                index: r.u2()?,
            },
            3,
        ),
        op::INVOKEINTERFACE => {
            let index = r.u2()?;
            let count = r.u1()?;
            r.u1()?;
            (Insn::InvokeInterface { index, count }, 5)
        }
        op::INVOKEDYNAMIC => {
            let index = r.u2()?;
            r.u2()?;
            (Insn::InvokeDynamic { index }, 5)
        }
        op::NEWARRAY => (Insn::NewArray(r.u1()?), 2),
        op::MULTIANEWARRAY => (
            Insn::MultiNewArray {
                index: r.u2()?,
                dims: r.u1()?,
            },
            4,
        ),
        op::WIDE => {
            let sub = r.u1()?;
            match sub {
                op::IINC => (
                    Insn::Iinc {
                        slot: r.u2()?,
                        delta: r.i2()?,
                    },
                    6,
                ),
                _ => (
                    Insn::Local {
                        op: sub,
                        slot: r.u2()?,
                    },
                    4,
                ),
            }
        }
        op::TABLESWITCH => {
            let pad = 3 - (pos % 4);
            let mut rr = Reader::new(&code[pos + 1 + pad..]);
            let default = label_at(base + rr.i4()? as i64, pos)?;
            let low = rr.i4()?;
            let high = rr.i4()?;
            let n = (high - low + 1) as usize;
            let mut targets = Vec::with_capacity(n);
            for _ in 0..n {
                targets.push(label_at(base + rr.i4()? as i64, pos)?);
            }
            (
                Insn::TableSwitch {
                    default,
                    low,
                    high,
                    targets,
                },
                1 + pad + 12 + 4 * n,
            )
        }
        op::LOOKUPSWITCH => {
            let pad = 3 - (pos % 4);
            let mut rr = Reader::new(&code[pos + 1 + pad..]);
            let default = label_at(base + rr.i4()? as i64, pos)?;
            let npairs = rr.i4()? as usize;
            let mut pairs = Vec::with_capacity(npairs);
            for _ in 0..npairs {
                let key = rr.i4()?;
                pairs.push((key, label_at(base + rr.i4()? as i64, pos)?));
            }
            (
                Insn::LookupSwitch { default, pairs },
                1 + pad + 8 + 8 * npairs,
            )
        }
        _ => (Insn::Plain(opcode), 1),
    })
}

// ------------------------------------------------------------------------ mutf8

/// Decodes JVM modified UTF-8 (CESU-8 with two-byte NUL). Returns `None` on
/// malformed sequences or unpaired surrogates.
pub(crate) fn decode_mutf8(bytes: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(bytes.len());
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let a = bytes[i];
        if a == 0 {
            return None;
        } else if a < 0x80 {
            units.push(a as u16);
            i += 1;
        } else if a & 0xe0 == 0xc0 {
            let b = *bytes.get(i + 1)?;
            if b & 0xc0 != 0x80 {
                return None;
            }
            units.push((((a & 0x1f) as u16) << 6) | (b & 0x3f) as u16);
            i += 2;
        } else if a & 0xf0 == 0xe0 {
            let b = *bytes.get(i + 1)?;
            let c = *bytes.get(i + 2)?;
            if b & 0xc0 != 0x80 || c & 0xc0 != 0x80 {
                return None;
            }
            units.push((((a & 0x0f) as u16) << 12) | (((b & 0x3f) as u16) << 6) | (c & 0x3f) as u16);
            i += 3;
        } else {
            return None;
        }
    }
    for ch in char::decode_utf16(units) {
        out.push(ch.ok()?);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutf8_basic_ascii() {
        assert_eq!(decode_mutf8(b"hello").as_deref(), Some("hello"));
    }

    #[test]
    fn mutf8_two_byte_nul() {
        assert_eq!(decode_mutf8(&[0xc0, 0x80]).as_deref(), Some("\0"));
    }

    #[test]
    fn mutf8_rejects_raw_nul() {
        assert!(decode_mutf8(&[0x00]).is_none());
    }

    #[test]
    fn mutf8_surrogate_pair() {
        // U+1F600 as CESU-8: D83D DE00.
        let bytes = [0xed, 0xa0, 0xbd, 0xed, 0xb8, 0x80];
        assert_eq!(decode_mutf8(&bytes).as_deref(), Some("\u{1f600}"));
    }

    #[test]
    fn rejects_bad_magic() {
        let err = decode(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 52]).unwrap_err();
        assert!(matches!(err, ParseError::BadMagic(0xdeadbeef)));
    }

    #[test]
    fn rejects_future_version() {
        let mut bytes = vec![0xca, 0xfe, 0xba, 0xbe, 0x00, 0x00, 0x01, 0x00];
        bytes.extend_from_slice(&[0x00, 0x01]);
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedVersion { .. }));
    }

    #[test]
    fn rejects_truncated_header() {
        let err = decode(&[0xca, 0xfe]).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof(_)));
    }
}
