//! Class definitions, the class registry, and the layout "cook" step.
//!
//! Classes arrive from CLASS_DUMP records with only their own fields and a
//! superclass heap id. Cooking resolves the superclass and computes the
//! full instance layout span plus the payload offsets that hold object
//! references, in payload scan order (HPROF lays instances out leaf class
//! first, then each superclass in turn).

use std::collections::HashMap;
use std::sync::Arc;

use getset::{CopyGetters, Getters};
use once_cell::sync::OnceCell;

use crate::error::HeapError;
use crate::util::{demangle, BitSet};
use crate::{ClassId, HeapId, IdSize};

/// Packages searched, in order, to resolve unqualified class names.
pub const AUTO_PREFIXES: &[&str] = &["java.lang.", "java.util.", "java.util.concurrent."];

/// A java value type, "basic type" as defined by the HPROF spec.
#[derive(Debug, Clone, Copy)]
pub struct JType {
    /// JVM short class name for an array of this type, e.g. "[I".
    pub array_class: &'static str,
    /// True for object references, false for primitives.
    pub is_obj: bool,
    /// Value size in bytes.
    pub size: u32,
    /// The matching primitive-array class, filled in when its CLASS_DUMP
    /// is seen. 0 until then.
    pub class: ClassId,
}

/// Basic-type descriptors indexed by the tag byte found in CLASS_DUMP and
/// PRIMITIVE_ARRAY records. The object descriptor (tag 2) is unnamed since
/// its concrete type varies, and its size is the native id size.
pub fn jtype_table(id_size: IdSize) -> Vec<Option<JType>> {
    let jt = |array_class, is_obj, size| {
        Some(JType {
            array_class,
            is_obj,
            size,
            class: 0,
        })
    };
    vec![
        None,
        None,
        jt("", true, id_size.in_bytes()),
        None,
        jt("[Z", false, 1),
        jt("[C", false, 2),
        jt("[F", false, 4),
        jt("[D", false, 8),
        jt("[B", false, 1),
        jt("[S", false, 2),
        jt("[I", false, 4),
        jt("[J", false, 8),
    ]
}

/// One non-static member of a class definition.
#[derive(Debug, Clone, CopyGetters, Getters)]
pub struct Field {
    #[get = "pub"]
    name: String,
    #[get_copy = "pub"]
    is_obj: bool,
    #[get_copy = "pub"]
    size: u32,
    /// Offset from the start of this class's own fields (pre-cook).
    #[get_copy = "pub"]
    offset: u32,
}

impl Field {
    pub fn new(name: String, is_obj: bool, size: u32, offset: u32) -> Field {
        Field {
            name,
            is_obj,
            size,
            offset,
        }
    }
}

/// The cooked portion of a class definition, computed once after the
/// class hierarchy is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Full instance layout span in bytes, superclasses included.
    pub span: u32,
    /// Resolved superclass, 0 for root classes.
    pub super_cid: ClassId,
    /// Payload offsets holding object references, ascending in scan order:
    /// this class's own object fields first, then the superclass run
    /// shifted past them.
    pub ref_offsets: Vec<u32>,
}

/// One of these per class found in the heap dump.
#[derive(CopyGetters, Getters)]
pub struct ClassDef {
    /// Demangled name, e.g. `java.util.HashMap` or `int[][]`.
    #[get = "pub"]
    name: String,
    #[get_copy = "pub"]
    cid: ClassId,
    #[get_copy = "pub"]
    hid: HeapId,
    #[get_copy = "pub"]
    super_hid: HeapId,
    #[get = "pub"]
    fields: Vec<Field>,
    /// Nonzero heap ids referenced by this class's static fields.
    #[get = "pub"]
    static_refs: Vec<HeapId>,
    /// True when this class terminates the inheritance chain (superclass
    /// heap id 0, which in HPROF denotes java.lang.Object).
    #[get_copy = "pub"]
    is_root: bool,
    /// Byte span of this class's own fields only.
    #[get_copy = "pub"]
    own_span: u32,
    cooked: OnceCell<Layout>,
}

impl ClassDef {
    fn new(
        name: String,
        cid: ClassId,
        hid: HeapId,
        super_hid: HeapId,
        fields: Vec<Field>,
        static_refs: Vec<HeapId>,
    ) -> ClassDef {
        let own_span = fields.iter().map(|f| f.size()).sum();
        ClassDef {
            name,
            cid,
            hid,
            super_hid,
            fields,
            static_refs,
            is_root: super_hid == 0,
            own_span,
            cooked: OnceCell::new(),
        }
    }

    /// The cooked layout, if [`ClassRegistry::cook`] has run for this class.
    pub fn layout(&self) -> Option<&Layout> {
        self.cooked.get()
    }

    /// The cooked layout. Panics on a raw def; the reader cooks every
    /// class before its instances are decoded.
    pub fn cooked_layout(&self) -> &Layout {
        match self.cooked.get() {
            Some(layout) => layout,
            None => panic!("class {} used before cook", self.name),
        }
    }

    fn own_ref_offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.fields.iter().filter(|f| f.is_obj()).map(|f| f.offset())
    }
}

impl std::fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassDef")
            .field("name", &self.name)
            .field("cid", &self.cid)
            .field("hid", &self.hid)
            .field("super_hid", &self.super_hid)
            .field("fields", &self.fields.len())
            .finish()
    }
}

/// Owns every class definition, keyed by class id, heap id, and demangled
/// name. Written only by the reader thread; decode workers hold `Arc`s to
/// individual definitions.
#[derive(Debug)]
pub struct ClassRegistry {
    // index 0 reserved
    classes: Vec<Option<Arc<ClassDef>>>,
    by_name: HashMap<String, ClassId>,
    by_hid: HashMap<HeapId, ClassId>,
    /// Direct subclasses per cid; rebuilt by `cook_all`.
    children: Vec<Vec<ClassId>>,
    instance_counts: Vec<u32>,
    instance_bytes: Vec<u64>,
}

impl ClassRegistry {
    pub fn new() -> ClassRegistry {
        ClassRegistry {
            classes: vec![None],
            by_name: HashMap::new(),
            by_hid: HashMap::new(),
            children: Vec::new(),
            instance_counts: vec![0],
            instance_bytes: vec![0],
        }
    }

    /// Highest assigned class id.
    pub fn max_cid(&self) -> ClassId {
        (self.classes.len() - 1) as ClassId
    }

    /// Register a new class. Takes the name as read from the heap and
    /// demangles it for indexing.
    pub fn add(
        &mut self,
        name: &str,
        hid: HeapId,
        super_hid: HeapId,
        fields: Vec<Field>,
        static_refs: Vec<HeapId>,
    ) -> Result<Arc<ClassDef>, HeapError> {
        let dname = demangle(name)?;
        if self.by_name.contains_key(&dname) {
            return Err(HeapError::DuplicateClass(dname));
        }
        if self.by_hid.contains_key(&hid) {
            return Err(HeapError::DuplicateClass(format!(
                "{} (heap id {:#x} already bound)",
                dname, hid
            )));
        }
        let cid = self.classes.len() as ClassId;
        let def = Arc::new(ClassDef::new(
            dname.clone(),
            cid,
            hid,
            super_hid,
            fields,
            static_refs,
        ));
        self.classes.push(Some(Arc::clone(&def)));
        self.instance_counts.push(0);
        self.instance_bytes.push(0);
        self.by_name.insert(dname, cid);
        self.by_hid.insert(hid, cid);
        Ok(def)
    }

    pub fn get(&self, cid: ClassId) -> Option<&Arc<ClassDef>> {
        self.classes.get(cid as usize).and_then(|c| c.as_ref())
    }

    pub fn by_hid(&self, hid: HeapId) -> Option<&Arc<ClassDef>> {
        self.by_hid.get(&hid).and_then(|&cid| self.get(cid))
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<ClassDef>> {
        self.by_name.get(name).and_then(|&cid| self.get(cid))
    }

    /// Look up a class by user-supplied name, trying the auto-prefix list
    /// for unqualified names.
    pub fn class_named(&self, name: &str) -> Option<&Arc<ClassDef>> {
        if name.contains('.') {
            return self.by_name(name);
        }
        AUTO_PREFIXES
            .iter()
            .find_map(|prefix| self.by_name(&format!("{}{}", prefix, name)))
    }

    /// All registered classes in cid order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClassDef>> {
        self.classes.iter().flatten()
    }

    pub fn note_instance(&mut self, cid: ClassId, size: u32) {
        self.instance_counts[cid as usize] += 1;
        self.instance_bytes[cid as usize] += size as u64;
    }

    pub fn instance_count(&self, cid: ClassId) -> u32 {
        self.instance_counts[cid as usize]
    }

    pub fn instance_bytes(&self, cid: ClassId) -> u64 {
        self.instance_bytes[cid as usize]
    }

    /// Resolve the superclass and compute layout span and reference
    /// offsets. Idempotent, recursive on the superclass; requires every
    /// class on the inheritance chain to be registered.
    pub fn cook<'c>(&self, class: &'c ClassDef) -> Result<&'c Layout, HeapError> {
        class.cooked.get_or_try_init(|| {
            if class.is_root() {
                return Ok(Layout {
                    span: class.own_span(),
                    super_cid: 0,
                    ref_offsets: class.own_ref_offsets().collect(),
                });
            }
            let super_def = self.by_hid(class.super_hid()).ok_or_else(|| {
                HeapError::malformed(
                    0,
                    format!(
                        "class {} has unresolvable superclass {:#x}",
                        class.name(),
                        class.super_hid()
                    ),
                )
            })?;
            if super_def.hid() == class.hid() {
                return Err(HeapError::malformed(
                    0,
                    format!("class {} is its own superclass", class.name()),
                ));
            }
            let super_layout = self.cook(super_def)?;
            let mut ref_offsets: Vec<u32> = class.own_ref_offsets().collect();
            ref_offsets.extend(
                super_layout
                    .ref_offsets
                    .iter()
                    .map(|o| o + class.own_span()),
            );
            Ok(Layout {
                span: class.own_span() + super_layout.span,
                super_cid: super_def.cid(),
                ref_offsets,
            })
        })
    }

    /// Cook every registered class and rebuild the subclass lists. Run
    /// once parsing is complete; later cook calls are no-ops.
    pub fn cook_all(&mut self) -> Result<(), HeapError> {
        let mut edges = Vec::new();
        for class in self.iter() {
            let layout = self.cook(class)?;
            if !class.is_root() {
                edges.push((layout.super_cid, class.cid()));
            }
        }
        self.children = vec![Vec::new(); self.classes.len()];
        for (parent, child) in edges {
            self.children[parent as usize].push(child);
        }
        Ok(())
    }

    /// Mark (or unmark) classes matching a pattern, plus their subclasses.
    /// Patterns are exact names (auto-prefixed when unqualified) or a
    /// prefix with a trailing `*`. Returns whether anything matched.
    pub fn match_classes(&self, bits: &mut BitSet, pattern: &str, include: bool) -> bool {
        let mut matched = false;
        self.with_classes_matching(pattern, |class| {
            matched = true;
            self.mark_class(class.cid(), bits, include);
        });
        matched
    }

    /// A fresh bit set with the class ids matching a pattern (and their
    /// subclasses) turned on.
    pub fn cids_matching(&self, pattern: &str) -> BitSet {
        let mut bits = BitSet::new(self.classes.len());
        self.match_classes(&mut bits, pattern, true);
        bits
    }

    fn with_classes_matching(&self, pattern: &str, mut f: impl FnMut(&Arc<ClassDef>)) {
        if let Some(prefix) = pattern.strip_suffix('*') {
            for class in self.iter() {
                if class.name().starts_with(prefix) {
                    f(class);
                }
            }
        } else if let Some(class) = self.class_named(pattern) {
            f(class);
        }
    }

    fn mark_class(&self, cid: ClassId, bits: &mut BitSet, include: bool) {
        if include {
            bits.set(cid as usize);
        } else {
            bits.clear(cid as usize);
        }
        if let Some(children) = self.children.get(cid as usize) {
            for &child in children {
                self.mark_class(child, bits, include);
            }
        }
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        ClassRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj_field(name: &str, offset: u32) -> Field {
        Field::new(name.to_owned(), true, 8, offset)
    }

    fn int_field(name: &str, offset: u32) -> Field {
        Field::new(name.to_owned(), false, 4, offset)
    }

    /// Object(hid 2) <- String(3), Number(4) <- Integer(5), Long(6);
    /// Object <- List(7), Map(8).
    fn sample_registry() -> ClassRegistry {
        let mut reg = ClassRegistry::new();
        let mut add = |name: &str, hid: HeapId, super_hid: HeapId| {
            reg.add(name, hid, super_hid, vec![], vec![]).unwrap();
        };
        add("java/lang/Object", 2, 0);
        add("java/lang/String", 3, 2);
        add("java/lang/Number", 4, 2);
        add("java/lang/Integer", 5, 4);
        add("java/lang/Long", 6, 4);
        add("java/util/List", 7, 2);
        add("java/util/Map", 8, 2);
        reg.cook_all().unwrap();
        reg
    }

    #[test]
    fn class_matching() {
        let reg = sample_registry();
        let mut bits = BitSet::new(10);

        let cid = |name: &str| reg.by_name(name).unwrap().cid() as usize;
        let verify = |bits: &BitSet, names: &[&str]| {
            for class in reg.iter() {
                let wanted = names.contains(&class.name().as_str());
                assert_eq!(
                    wanted,
                    bits.has(class.cid() as usize),
                    "class {}",
                    class.name()
                );
            }
        };
        assert!(cid("java.lang.Object") > 0);

        assert!(reg.match_classes(&mut bits, "java.lang.Object", true));
        verify(
            &bits,
            &[
                "java.lang.Object",
                "java.lang.String",
                "java.lang.Number",
                "java.lang.Integer",
                "java.lang.Long",
                "java.util.List",
                "java.util.Map",
            ],
        );

        assert!(reg.match_classes(&mut bits, "java.lang.Number", false));
        verify(
            &bits,
            &[
                "java.lang.Object",
                "java.lang.String",
                "java.util.List",
                "java.util.Map",
            ],
        );

        assert!(reg.match_classes(&mut bits, "java.util.*", false));
        verify(&bits, &["java.lang.Object", "java.lang.String"]);
    }

    #[test]
    fn auto_prefix_lookup() {
        let reg = sample_registry();
        assert_eq!("java.lang.Integer", reg.class_named("Integer").unwrap().name().as_str());
        assert_eq!("java.util.Map", reg.class_named("Map").unwrap().name().as_str());
        assert!(reg.class_named("NoSuchThing").is_none());
        // qualified names are never auto-prefixed
        assert!(reg.class_named("java.lang.NoSuchThing").is_none());
    }

    #[test]
    fn duplicate_class_rejected() {
        let mut reg = ClassRegistry::new();
        reg.add("java/lang/Object", 2, 0, vec![], vec![]).unwrap();
        assert!(matches!(
            reg.add("java/lang/Object", 9, 0, vec![], vec![]),
            Err(HeapError::DuplicateClass(_))
        ));
        assert!(matches!(
            reg.add("java/lang/Other", 2, 0, vec![], vec![]),
            Err(HeapError::DuplicateClass(_))
        ));
    }

    #[test]
    fn cook_layout_scan_order() {
        let mut reg = ClassRegistry::new();
        // Object: one object field at 0, one int at 8
        reg.add(
            "java/lang/Object",
            2,
            0,
            vec![obj_field("top", 0), int_field("flags", 8)],
            vec![],
        )
        .unwrap();
        // Middle extends Object: int at 0, object at 4
        reg.add(
            "com/acme/Middle",
            3,
            2,
            vec![int_field("count", 0), obj_field("next", 4)],
            vec![],
        )
        .unwrap();
        // Leaf extends Middle: object at 0
        reg.add("com/acme/Leaf", 4, 3, vec![obj_field("head", 0)], vec![])
            .unwrap();
        reg.cook_all().unwrap();

        let leaf = reg.by_name("com.acme.Leaf").unwrap();
        let layout = leaf.layout().unwrap();
        // leaf fields (8) + middle (12) + object (12)
        assert_eq!(32, layout.span);
        // own ref at 0; middle's ref 4 shifted by 8; object's ref 0
        // shifted by middle's cooked run (8 + 12)
        assert_eq!(vec![0, 12, 20], layout.ref_offsets);
        assert_eq!(reg.by_name("com.acme.Middle").unwrap().cid(), layout.super_cid);
        // offsets must ascend so payload scans never backtrack
        assert!(layout.ref_offsets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn cook_is_idempotent() {
        let reg = sample_registry();
        let integer = reg.by_name("java.lang.Integer").unwrap();
        let first = reg.cook(integer).unwrap().clone();
        let second = reg.cook(integer).unwrap().clone();
        assert_eq!(first, second);
    }

    #[test]
    fn cook_fails_on_missing_super() {
        let mut reg = ClassRegistry::new();
        let orphan = reg
            .add("com/acme/Orphan", 5, 99, vec![], vec![])
            .unwrap();
        assert!(reg.cook(&orphan).is_err());
    }
}
