//! Deduplicated constant table for one class artifact.
//!
//! Entries live in slot representation, matching the on-disk numbering: slot
//! zero is unused and `Long`/`Double` entries shadow the slot after them.
//! Everything else in the model refers to entries by slot index; the encoder
//! renumbers densely after dropping entries nothing references anymore.

use indexmap::IndexMap;

/// One constant pool entry.
///
/// `Float` and `Double` store raw bits so entries stay `Eq + Hash` and can be
/// deduplicated through the intern cache without NaN headaches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstEntry {
    Utf8(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class { name: u16 },
    Str { utf8: u16 },
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType { descriptor: u16 },
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module { name: u16 },
    Package { name: u16 },
}

impl ConstEntry {
    /// The on-disk tag byte for this entry.
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Utf8(_) => 1,
            Self::Integer(_) => 3,
            Self::Float(_) => 4,
            Self::Long(_) => 5,
            Self::Double(_) => 6,
            Self::Class { .. } => 7,
            Self::Str { .. } => 8,
            Self::FieldRef { .. } => 9,
            Self::MethodRef { .. } => 10,
            Self::InterfaceMethodRef { .. } => 11,
            Self::NameAndType { .. } => 12,
            Self::MethodHandle { .. } => 15,
            Self::MethodType { .. } => 16,
            Self::Dynamic { .. } => 17,
            Self::InvokeDynamic { .. } => 18,
            Self::Module { .. } => 19,
            Self::Package { .. } => 20,
        }
    }

    /// Long and Double occupy two pool slots.
    pub const fn is_wide(&self) -> bool {
        matches!(self, Self::Long(_) | Self::Double(_))
    }

    /// True when the entry may be the operand of a single-slot `ldc`.
    pub const fn is_loadable_narrow(&self) -> bool {
        matches!(
            self,
            Self::Integer(_)
                | Self::Float(_)
                | Self::Str { .. }
                | Self::Class { .. }
                | Self::MethodType { .. }
                | Self::MethodHandle { .. }
                | Self::Dynamic { .. }
        )
    }

    /// True when the entry may be the operand of `ldc2_w`.
    pub const fn is_loadable_wide(&self) -> bool {
        matches!(self, Self::Long(_) | Self::Double(_) | Self::Dynamic { .. })
    }
}

/// The constant table of one class, with an intern cache for deduplication.
#[derive(Debug, Clone, Default)]
pub struct ConstPool {
    slots: Vec<Option<ConstEntry>>,
    cache: IndexMap<ConstEntry, u16>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self {
            slots: vec![None],
            cache: IndexMap::new(),
        }
    }

    /// Rebuilds a pool from decoded slots, priming the intern cache with the
    /// first occurrence of each entry.
    pub fn from_slots(slots: Vec<Option<ConstEntry>>) -> Self {
        let mut cache = IndexMap::new();
        for (idx, slot) in slots.iter().enumerate() {
            if let Some(entry) = slot {
                cache.entry(entry.clone()).or_insert(idx as u16);
            }
        }
        Self { slots, cache }
    }

    /// Number of slots, including slot zero and wide shadows. This is the
    /// value written to the `constant_pool_count` field.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[Option<ConstEntry>] {
        &self.slots
    }

    pub fn get(&self, index: u16) -> Option<&ConstEntry> {
        self.slots.get(index as usize).and_then(|s| s.as_ref())
    }

    pub fn utf8(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            ConstEntry::Utf8(s) => Some(s),
            _ => None,
        }
    }

    /// Resolves a `Class` entry to its internal binary name.
    pub fn class_name(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            ConstEntry::Class { name } => self.utf8(*name),
            _ => None,
        }
    }

    pub fn name_and_type(&self, index: u16) -> Option<(&str, &str)> {
        match self.get(index)? {
            ConstEntry::NameAndType { name, descriptor } => {
                Some((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            _ => None,
        }
    }

    /// Resolves any of the three member-ref tags to (owner, name, descriptor).
    pub fn member_ref(&self, index: u16) -> Option<(&str, &str, &str)> {
        let (class, nat) = match self.get(index)? {
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
            } => (*class, *name_and_type),
            _ => return None,
        };
        let owner = self.class_name(class)?;
        let (name, descriptor) = self.name_and_type(nat)?;
        Some((owner, name, descriptor))
    }

    /// Descriptor of the call site named by a `Dynamic`/`InvokeDynamic` entry.
    pub fn dynamic_descriptor(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            ConstEntry::Dynamic { name_and_type, .. }
            | ConstEntry::InvokeDynamic { name_and_type, .. } => {
                Some(self.name_and_type(*name_and_type)?.1)
            }
            _ => None,
        }
    }

    /// Interns an entry, returning the existing slot when an identical entry
    /// is already present. Pool-size limits are enforced by the encoder.
    pub fn intern(&mut self, entry: ConstEntry) -> u16 {
        if let Some(&idx) = self.cache.get(&entry) {
            return idx;
        }
        let idx = self.slots.len() as u16;
        let wide = entry.is_wide();
        self.cache.insert(entry.clone(), idx);
        self.slots.push(Some(entry));
        if wide {
            self.slots.push(None);
        }
        idx
    }

    pub fn intern_utf8(&mut self, value: &str) -> u16 {
        self.intern(ConstEntry::Utf8(value.to_owned()))
    }

    pub fn intern_class(&mut self, name: &str) -> u16 {
        let name = self.intern_utf8(name);
        self.intern(ConstEntry::Class { name })
    }

    pub fn intern_string(&mut self, value: &str) -> u16 {
        let utf8 = self.intern_utf8(value);
        self.intern(ConstEntry::Str { utf8 })
    }

    pub fn intern_integer(&mut self, value: i32) -> u16 {
        self.intern(ConstEntry::Integer(value))
    }

    pub fn intern_long(&mut self, value: i64) -> u16 {
        self.intern(ConstEntry::Long(value))
    }

    pub fn intern_name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name = self.intern_utf8(name);
        let descriptor = self.intern_utf8(descriptor);
        self.intern(ConstEntry::NameAndType { name, descriptor })
    }

    pub fn intern_method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.intern_class(owner);
        let name_and_type = self.intern_name_and_type(name, descriptor);
        self.intern(ConstEntry::MethodRef {
            class,
            name_and_type,
        })
    }

    /// Interface members must be referenced through tag 11, not tag 10.
    pub fn intern_interface_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> u16 {
        let class = self.intern_class(owner);
        let name_and_type = self.intern_name_and_type(name, descriptor);
        self.intern(ConstEntry::InterfaceMethodRef {
            class,
            name_and_type,
        })
    }

    pub fn intern_field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.intern_class(owner);
        let name_and_type = self.intern_name_and_type(name, descriptor);
        self.intern(ConstEntry::FieldRef {
            class,
            name_and_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_deduplicates() {
        let mut pool = ConstPool::new();
        let a = pool.intern_string("hello");
        let b = pool.intern_string("hello");
        assert_eq!(a, b);
        // Str + its Utf8, plus slot zero.
        assert_eq!(pool.slot_count(), 3);
    }

    #[test]
    fn wide_entries_shadow_a_slot() {
        let mut pool = ConstPool::new();
        let long = pool.intern_long(7);
        let after = pool.intern_integer(1);
        assert_eq!(long, 1);
        assert_eq!(after, 3);
        assert!(pool.get(2).is_none());
    }

    #[test]
    fn member_ref_resolution() {
        let mut pool = ConstPool::new();
        let idx = pool.intern_method_ref("java/lang/String", "length", "()I");
        assert_eq!(
            pool.member_ref(idx),
            Some(("java/lang/String", "length", "()I"))
        );
    }
}
