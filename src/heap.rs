//! The in-memory heap model: everything read from a dump, plus the
//! post-parse synthesis that turns it into a rooted reference graph.

use std::sync::Arc;

use log::info;

use crate::class::{jtype_table, ClassDef, ClassRegistry, Field, JType};
use crate::error::HeapError;
use crate::gcroots::{GcRoots, Visibility};
use crate::graph::ObjectGraph;
use crate::objectmap::ObjectMap;
use crate::refbag::{merge_bags, RefBag};
use crate::util::BitSet;
use crate::{ClassId, HeapId, IdSize, ObjectId};

use std::collections::HashMap;

/// Information read from a binary heap dump.
#[derive(Debug)]
pub struct Heap {
    pub id_size: IdSize,
    /// Class definitions and their indexes.
    pub classes: ClassRegistry,
    /// GC roots and (after post-processing) liveness.
    pub roots: GcRoots,
    /// Static strings from UTF8 records (class and field names, not
    /// user-defined strings).
    strings: HashMap<HeapId, String>,
    /// Class heap id -> name heap id. LOAD_CLASS and CLASS_DUMP are
    /// different records, so the binding is remembered until needed.
    class_names: HashMap<HeapId, HeapId>,
    /// Basic-type descriptors indexed by tag.
    jtypes: Vec<Option<JType>>,
    /// Object class ids indexed by object id; entry 0 unused.
    object_cids: Vec<ClassId>,
    /// Object sizes indexed by object id; entry 0 unused.
    object_sizes: Vec<u32>,
    /// Heap id -> object id, dropped once post-processing completes.
    object_map: Option<ObjectMap>,
    /// Highest heap id seen; fabricated ids are allocated past it.
    max_hid: HeapId,
    /// Classes skipped during graph searches, by cid.
    skip: BitSet,
    graph: Option<ObjectGraph>,
}

impl Heap {
    /// Create an empty heap. Registers the synthetic `root` class and the
    /// master root instance, so class id 1 and object id 1 are always the
    /// master root.
    pub fn new(id_size: IdSize) -> Result<Heap, HeapError> {
        let mut heap = Heap {
            id_size,
            classes: ClassRegistry::new(),
            roots: GcRoots::new(),
            strings: HashMap::new(),
            class_names: HashMap::new(),
            jtypes: jtype_table(id_size),
            object_cids: vec![0],
            object_sizes: vec![0],
            object_map: Some(ObjectMap::new()),
            max_hid: 0,
            skip: BitSet::new(0),
            graph: None,
        };
        let root = heap.add_class("root", 1, 0, vec![], vec![])?;
        heap.add_instance(1, &root, 0)?;
        Ok(heap)
    }

    pub fn add_string(&mut self, hid: HeapId, value: String) {
        self.strings.insert(hid, value);
    }

    pub fn string_with_id(&self, hid: HeapId) -> Option<&str> {
        self.strings.get(&hid).map(|s| s.as_str())
    }

    pub fn add_class_name(&mut self, class_hid: HeapId, name_hid: HeapId) {
        self.class_names.insert(class_hid, name_hid);
    }

    pub fn class_name_id(&self, class_hid: HeapId) -> Option<HeapId> {
        self.class_names.get(&class_hid).copied()
    }

    /// The basic-type descriptor for a tag byte, if the tag is valid.
    pub fn jtype(&self, tag: u8) -> Option<&JType> {
        self.jtypes.get(tag as usize).and_then(|j| j.as_ref())
    }

    /// Register a class definition. `name` is the heap-format name; if it
    /// names a primitive array type the matching basic-type descriptor
    /// gains its class back-reference.
    pub fn add_class(
        &mut self,
        name: &str,
        hid: HeapId,
        super_hid: HeapId,
        fields: Vec<Field>,
        static_refs: Vec<HeapId>,
    ) -> Result<Arc<ClassDef>, HeapError> {
        self.max_hid = self.max_hid.max(hid);
        let def = self.classes.add(name, hid, super_hid, fields, static_refs)?;
        if name.len() == 2 && name.starts_with('[') {
            for jtype in self.jtypes.iter_mut().flatten() {
                if jtype.array_class == name {
                    jtype.class = def.cid();
                }
            }
        }
        Ok(def)
    }

    /// Note a class instance: assign the next object id and bind it to its
    /// class. Nothing about the instance data is recorded here.
    pub fn add_instance(
        &mut self,
        hid: HeapId,
        class: &Arc<ClassDef>,
        size: u32,
    ) -> Result<ObjectId, HeapError> {
        self.max_hid = self.max_hid.max(hid);
        let oid = self.object_cids.len() as ObjectId;
        self.object_cids.push(class.cid());
        self.object_sizes.push(size);
        self.classes.note_instance(class.cid(), size);
        match &mut self.object_map {
            Some(map) => map.add(hid, oid)?,
            None => panic!("instance added after post-processing"),
        }
        Ok(oid)
    }

    /// Highest assigned object id.
    pub fn max_oid(&self) -> ObjectId {
        (self.object_cids.len() - 1) as ObjectId
    }

    pub fn cid_of(&self, oid: ObjectId) -> ClassId {
        self.object_cids[oid as usize]
    }

    /// The class of an object id. Panics on an unassigned id.
    pub fn class_of(&self, oid: ObjectId) -> &Arc<ClassDef> {
        let cid = self.cid_of(oid);
        match self.classes.get(cid) {
            Some(class) => class,
            None => panic!("oid {} cid {} has no class def", oid, cid),
        }
    }

    pub fn size_of(&self, oid: ObjectId) -> u32 {
        self.object_sizes[oid as usize]
    }

    pub fn graph(&self) -> Option<&ObjectGraph> {
        self.graph.as_ref()
    }

    pub fn can_see(&self, oid: ObjectId) -> bool {
        self.roots.can_see(oid)
    }

    /// Cook a class so its layout is usable by decode workers. Called by
    /// the reader before the first instance of the class is enqueued.
    pub fn cook_for_decode(&self, class: &Arc<ClassDef>) -> Result<(), HeapError> {
        self.classes.cook(class)?;
        Ok(())
    }

    /// A fabricated heap id higher than any real one, for placeholder
    /// classes and objects.
    fn fabricate_hid(&mut self) -> HeapId {
        self.max_hid += self.id_size.in_bytes() as HeapId;
        self.max_hid
    }

    /// Post-process the heap after the parse: fabricate per-class static
    /// reference holders, link the master root, resolve heap ids, build
    /// the reference graph, and mark live objects.
    ///
    /// `worker_bags` carries the segment decoders' output; `None` means
    /// references were not extracted (`--histo` mode), in which case only
    /// the synthesis and cook passes run and every object stays visible.
    pub fn post_process(&mut self, worker_bags: Option<Vec<RefBag>>) -> Result<(), HeapError> {
        // Fabricate a class object to hold each class's static references.
        // Done after the read completes so the fabricated ids are
        // guaranteed unique. The fabricated classes themselves are not
        // revisited.
        let jlo_hid = self
            .classes
            .by_name("java.lang.Object")
            .map(|c| c.hid())
            .unwrap_or(0);
        let real_cids: Vec<ClassId> = (1..=self.classes.max_cid()).collect();

        let mut static_bag = RefBag::new();
        for cid in real_cids {
            let (fake_name, static_refs) = {
                let class = match self.classes.get(cid) {
                    Some(class) => class,
                    None => continue,
                };
                (format!("{}.class", class.name()), class.static_refs().clone())
            };
            let fake_class_hid = self.fabricate_hid();
            let fake_instance_hid = self.fabricate_hid();
            let fake_class = self.add_class(&fake_name, fake_class_hid, jlo_hid, vec![], vec![])?;
            let fake_oid = self.add_instance(fake_instance_hid, &fake_class, 0)?;

            // Each class object is a GC root owning its static targets.
            self.roots.add(fake_instance_hid);
            for hid in static_refs {
                static_bag.add(fake_oid, hid);
            }
        }

        // Give the graph a unique source: the master root points at every
        // declared GC root, real or synthetic.
        for &root in self.roots.hids() {
            static_bag.add(1, root);
        }

        self.skip = BitSet::new(self.classes.max_cid() as usize + 1);

        let mut object_map = match self.object_map.take() {
            Some(map) => map,
            None => panic!("heap already post-processed"),
        };

        let max_oid = self.max_oid();
        match worker_bags {
            Some(mut bags) => {
                object_map.finalize();
                bags.push(static_bag);
                let (from, to) = merge_bags(bags, &object_map);
                info!("{} references", from.len());
                let graph = ObjectGraph::with_max(from, to, max_oid);
                self.roots
                    .find_live_objects(&graph, |hid| object_map.get(hid), max_oid);
                self.graph = Some(graph);
            }
            None => {
                // No reference extraction: liveness is unknowable, so
                // leave everything visible.
                self.roots.set_visibility(Visibility::All);
            }
        }
        drop(object_map);

        self.classes.cook_all()
    }

    /// Mark or clear the skip flag on classes matching a (possibly
    /// wildcard) pattern, and their subclasses. The pattern `none` clears
    /// all flags when skipping and sets all when unskipping. Returns
    /// whether anything matched.
    pub fn do_skip(&mut self, pattern: &str, skip: bool) -> bool {
        if pattern == "none" {
            if skip {
                self.skip.clear_all();
            } else {
                self.skip.set_all();
            }
            return true;
        }
        self.classes.match_classes(&mut self.skip, pattern, skip)
    }

    pub fn is_skipped(&self, cid: ClassId) -> bool {
        self.skip.has(cid as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    /// Two classes; Thing has a static reference to one of its instances.
    /// Instance 0x200 holds 0x201; 0x202 is unreferenced.
    fn build_heap() -> Heap {
        let mut heap = Heap::new(IdSize::U64).unwrap();
        heap.add_class("java/lang/Object", 0x100, 0, vec![], vec![])
            .unwrap();
        let thing = heap
            .add_class(
                "com/acme/Thing",
                0x101,
                0x100,
                vec![Field::new("next".into(), true, 8, 0)],
                vec![0x201],
            )
            .unwrap();
        for hid in [0x200, 0x201, 0x202] {
            heap.add_instance(hid, &thing, 16).unwrap();
        }

        let mut bag = RefBag::new();
        bag.add(2, 0x201); // 0x200 -> 0x201
        heap.post_process(Some(vec![bag])).unwrap();
        heap
    }

    #[test]
    fn static_synthesis_creates_class_objects() {
        let heap = build_heap();
        let fake = heap.classes.by_name("com.acme.Thing.class").unwrap();
        assert!(heap.classes.by_name("root.class").is_some());
        assert_eq!(1, heap.classes.instance_count(fake.cid()));
    }

    #[test]
    fn static_references_root_their_targets() {
        let heap = build_heap();
        // 0x201 (oid 3) is held by Thing's static reference, so it is
        // live; 0x200 and 0x202 are not referenced by any root.
        assert!(heap.roots.is_live(3));
        assert!(!heap.roots.is_live(2));
        assert!(!heap.roots.is_live(4));
    }

    #[test]
    fn master_root_links_every_root() {
        let heap = build_heap();
        let graph = heap.graph().unwrap();
        // one edge per fabricated class object (root, Object, Thing)
        let from_master = graph.out_edges(1).count();
        assert_eq!(3, from_master);
        assert!(heap.roots.is_live(1));
    }

    #[test]
    fn instance_bookkeeping() {
        let heap = build_heap();
        let thing = heap.classes.by_name("com.acme.Thing").unwrap();
        assert_eq!(3, heap.classes.instance_count(thing.cid()));
        assert_eq!(48, heap.classes.instance_bytes(thing.cid()));
        assert_eq!(16, heap.size_of(2));
        assert_eq!(thing.cid(), heap.cid_of(2));
    }

    #[test]
    fn skip_patterns() {
        let mut heap = build_heap();
        let thing_cid = heap.classes.by_name("com.acme.Thing").unwrap().cid();
        assert!(!heap.is_skipped(thing_cid));

        assert!(heap.do_skip("com.acme.*", true));
        assert!(heap.is_skipped(thing_cid));

        assert!(heap.do_skip("com.acme.Thing", false));
        assert!(!heap.is_skipped(thing_cid));

        heap.do_skip("none", false); // noskip none == skip everything
        assert!(heap.is_skipped(thing_cid));
        heap.do_skip("none", true); // skip none == clear
        assert!(!heap.is_skipped(thing_cid));
    }

    #[test]
    fn fabricated_hids_do_not_collide() {
        let heap = build_heap();
        let hids = heap
            .classes
            .iter()
            .map(|c| c.hid())
            .collect_vec();
        assert_eq!(hids.len(), hids.iter().unique().count());
    }
}
