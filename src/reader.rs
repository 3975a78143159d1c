//! The HPROF reader: top-level record state machine, the heap-dump
//! segment sub-machine, and CLASS_DUMP extraction.
//!
//! The reader runs single-threaded and is the sole advancer of the input
//! cursor and the sole writer of the heap model. Instance and object-array
//! payloads are not decoded here: their file offsets are recorded (before
//! the tag byte, so a worker can re-locate the record independently) and
//! queued for the segment decoder pool.

use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::class::{Field, JType};
use crate::error::HeapError;
use crate::heap::Heap;
use crate::mapped::{MappedFile, MappedSection};
use crate::segments::SegReader;
use crate::{HeapId, IdSize};

/// Processing options.
pub struct Options {
    /// Whether the reference graph is needed; `--histo` runs without it.
    pub need_refs: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options { need_refs: true }
    }
}

/// Tag, elapsed time, length.
const RECORD_HEADER: u64 = 9;

/// Complete heap read in one call: parse the dump at `path`, then
/// post-process (static synthesis, reference resolution, graph, liveness).
pub fn read_heap_dump(path: &Path, options: &Options) -> Result<Heap, HeapError> {
    let file = MappedFile::open(path)?;
    info!(
        "reading {} ({} MB)",
        path.display(),
        file.len() / 1_048_576
    );
    let mut input = MappedFile::map_at(&file, 0)?;

    // 19-byte version string (with trailing NUL), id size, timestamp
    if !input.demand(31)? {
        return Err(HeapError::malformed(0, "truncated header"));
    }
    let version_ok = {
        let magic = input.get_raw(19);
        magic == b"JAVA PROFILE 1.0.1\0" || magic == b"JAVA PROFILE 1.0.2\0"
    };
    if !version_ok {
        return Err(HeapError::malformed(0, "not a JAVA PROFILE 1.0.1/1.0.2 heap dump"));
    }
    let id_size = IdSize::from_header(input.get_u32())?;
    input.skip(8); // timestamp

    let mut reader = HprofReader {
        input,
        heap: Heap::new(id_size)?,
        seg: options.need_refs.then(|| SegReader::new(&file, id_size)),
    };
    reader.read_records()?;

    let bags = match reader.seg.take() {
        Some(seg) => Some(seg.close()?),
        None => None,
    };
    reader.heap.post_process(bags)?;
    Ok(reader.heap)
}

struct HprofReader {
    input: MappedSection,
    heap: Heap,
    seg: Option<SegReader>,
}

impl HprofReader {
    fn read_records(&mut self) -> Result<(), HeapError> {
        let id = self.id_bytes();
        while self.input.demand(RECORD_HEADER)? {
            let record_offset = self.input.offset();
            let tag = self.input.get_u8();
            self.input.skip(4); // elapsed time
            let length = self.input.get_u32();

            match tag {
                // UTF8
                0x01 => {
                    if (length as u64) < id || !self.input.demand(length as u64)? {
                        return Err(HeapError::malformed(record_offset, "truncated UTF8 record"));
                    }
                    let hid = self.input.read_id(self.heap.id_size);
                    let text = self.input.get_string(length as usize - id as usize);
                    self.heap.add_string(hid, text);
                }
                // LOAD_CLASS
                0x02 => {
                    if !self.input.demand(2 * id + 8)? {
                        return Err(HeapError::malformed(record_offset, "truncated LOAD_CLASS"));
                    }
                    self.input.skip(4); // class serial
                    let class_hid = self.input.read_id(self.heap.id_size);
                    self.input.skip(4); // stack trace serial
                    let name_hid = self.input.read_id(self.heap.id_size);
                    self.heap.add_class_name(class_hid, name_hid);
                }
                // HEAP_DUMP, HEAP_DUMP_SEGMENT
                0x0c | 0x1c => {
                    info!("heap dump or segment of {} MB", length / 1_048_576);
                    self.read_segment(length)?;
                }
                // UNLOAD_CLASS, STACK_FRAME, STACK_TRACE, ALLOC_SITES,
                // HEAP_SUMMARY, START_THREAD, END_THREAD,
                // CONTROL_SETTINGS, HEAP_DUMP_END
                0x03 | 0x04 | 0x05 | 0x06 | 0x07 | 0x0a | 0x0b | 0x0e | 0x2c => {
                    self.input.skip(length as u64);
                }
                other => {
                    return Err(HeapError::malformed(
                        record_offset,
                        format!("unknown HPROF record type {:#04x}", other),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Handle a HEAP_DUMP or HEAP_DUMP_SEGMENT body: un-length-prefixed
    /// sub-records selected by a tag byte.
    fn read_segment(&mut self, length: u32) -> Result<(), HeapError> {
        let end = self.input.offset() + length as u64;
        while self.input.offset() < end {
            let record_offset = self.input.offset();
            if !self.input.demand(1)? {
                return Err(HeapError::malformed(record_offset, "truncated heap segment"));
            }
            let tag = self.input.get_u8();
            match tag {
                0x20 => self.read_class_dump(record_offset)?,
                0x21 => self.read_instance(record_offset)?,
                0x22 => self.read_array(record_offset, true)?,
                0x23 => self.read_array(record_offset, false)?,
                0x01 => self.read_gc_root("JNI global", self.id_bytes())?,
                0x02 => self.read_gc_root("JNI local", 8)?,
                0x03 => self.read_gc_root("java frame", 8)?,
                0x04 => self.read_gc_root("native stack", 4)?,
                0x05 => self.read_gc_root("sticky class", 0)?,
                0x06 => self.read_gc_root("thread block", 4)?,
                0x07 => self.read_gc_root("monitor used", 0)?,
                0x08 => self.read_gc_root("thread object", 8)?,
                0xff => self.read_gc_root("unknown root", 0)?,
                other => {
                    return Err(HeapError::malformed(
                        record_offset,
                        format!("unknown record type {:#04x} in heap dump segment", other),
                    ));
                }
            }
        }
        if self.input.offset() != end {
            return Err(HeapError::malformed(end, "heap segment overran its length"));
        }
        Ok(())
    }

    /// A GC root: the heap id, then per-kind trailer data we don't use.
    fn read_gc_root(&mut self, kind: &str, trailer: u64) -> Result<(), HeapError> {
        if !self.input.demand(self.id_bytes() + trailer)? {
            return Err(HeapError::malformed(self.input.offset(), "truncated GC root"));
        }
        let hid = self.input.read_id(self.heap.id_size);
        log::debug!("gc root ({}) {:#x}", kind, hid);
        self.heap.roots.add(hid);
        self.input.skip(trailer);
        Ok(())
    }

    /// An INSTANCE_DUMP. Assigns the object id, queues the payload for the
    /// decode workers, and skips over it.
    fn read_instance(&mut self, record_offset: u64) -> Result<(), HeapError> {
        let id = self.id_bytes();
        if !self.input.demand(2 * id + 8)? {
            return Err(HeapError::malformed(record_offset, "truncated instance"));
        }
        let hid = self.input.read_id(self.heap.id_size);
        self.input.skip(4); // stack trace serial
        let class_hid = self.input.read_id(self.heap.id_size);
        let length = self.input.get_u32();

        let class = match self.heap.classes.by_hid(class_hid) {
            Some(class) => Arc::clone(class),
            None => {
                return Err(HeapError::malformed(
                    record_offset,
                    format!("instance of unregistered class {:#x}", class_hid),
                ));
            }
        };
        // header overhead: one id for the monitor
        let size = clamp_size(length as u64 + id);
        let oid = self.heap.add_instance(hid, &class, size)?;
        if self.seg.is_some() {
            // settle the layout before any worker can observe the class
            self.heap.cook_for_decode(&class)?;
        }
        if let Some(seg) = &mut self.seg {
            seg.add_work(record_offset, oid, &class);
        }
        self.input.skip(length as u64);
        Ok(())
    }

    /// An OBJECT_ARRAY or PRIMITIVE_ARRAY. Assigns the object id (under
    /// the element type's array class for primitives), queues object
    /// arrays for decoding, and skips the elements.
    fn read_array(&mut self, record_offset: u64, is_objects: bool) -> Result<(), HeapError> {
        let id = self.id_bytes();
        if !self.input.demand(id + 8)? {
            return Err(HeapError::malformed(record_offset, "truncated array"));
        }
        let hid = self.input.read_id(self.heap.id_size);
        self.input.skip(4); // stack trace serial
        let count = self.input.get_u32();

        if is_objects {
            if !self.input.demand(id)? {
                return Err(HeapError::malformed(record_offset, "truncated array"));
            }
            let class_hid = self.input.read_id(self.heap.id_size);
            let class = match self.heap.classes.by_hid(class_hid) {
                Some(class) => Arc::clone(class),
                None => {
                    return Err(HeapError::malformed(
                        record_offset,
                        format!("object array of unregistered class {:#x}", class_hid),
                    ));
                }
            };
            // header overhead: two ids
            let size = clamp_size((count as u64 + 2) * id);
            let oid = self.heap.add_instance(hid, &class, size)?;
            if let Some(seg) = &mut self.seg {
                seg.add_work(record_offset, oid, &class);
            }
            self.input.skip(count as u64 * id);
        } else {
            let jtype = self.read_jtype()?;
            let class = match self.heap.classes.get(jtype.class) {
                Some(class) if jtype.class != 0 => Arc::clone(class),
                _ => {
                    return Err(HeapError::malformed(
                        record_offset,
                        format!(
                            "primitive array {} before its class dump",
                            jtype.array_class
                        ),
                    ));
                }
            };
            let size = clamp_size(count as u64 * jtype.size as u64 + 2 * id);
            self.heap.add_instance(hid, &class, size)?;
            self.input.skip(count as u64 * jtype.size as u64);
        }
        Ok(())
    }

    /// A CLASS_DUMP: extract the superclass, static reference targets,
    /// and instance field descriptors; discard the rest.
    fn read_class_dump(&mut self, record_offset: u64) -> Result<(), HeapError> {
        let id = self.id_bytes();
        if !self.input.demand(7 * id + 8)? {
            return Err(HeapError::malformed(record_offset, "truncated class dump"));
        }
        let hid = self.input.read_id(self.heap.id_size);
        self.input.skip(4); // stack trace serial
        let super_hid = self.input.read_id(self.heap.id_size);
        // class loader, signer, protection domain, 2 reserved, instance size
        self.input.skip(5 * id + 4);

        let name = self
            .heap
            .class_name_id(hid)
            .and_then(|name_hid| self.heap.string_with_id(name_hid))
            .map(|s| s.to_owned())
            .ok_or_else(|| {
                HeapError::malformed(
                    record_offset,
                    format!("class {:#x} has no LOAD_CLASS name binding", hid),
                )
            })?;

        // constant pool: discarded
        if !self.input.demand(2)? {
            return Err(HeapError::malformed(record_offset, "truncated class dump"));
        }
        let num_constants = self.input.get_u16();
        for _ in 0..num_constants {
            if !self.input.demand(3)? {
                return Err(HeapError::malformed(record_offset, "truncated constant pool"));
            }
            self.input.skip(2); // pool index
            let jtype = self.read_jtype()?;
            if !self.input.demand(jtype.size as u64)? {
                return Err(HeapError::malformed(record_offset, "truncated constant pool"));
            }
            self.input.skip(jtype.size as u64);
        }

        // static fields: object-typed nonzero values become edges from the
        // synthetic class object, everything else is discarded
        if !self.input.demand(2)? {
            return Err(HeapError::malformed(record_offset, "truncated class dump"));
        }
        let num_statics = self.input.get_u16();
        let mut static_refs = Vec::new();
        for _ in 0..num_statics {
            if !self.input.demand(id + 1)? {
                return Err(HeapError::malformed(record_offset, "truncated static fields"));
            }
            self.input.skip(id); // field name id
            let jtype = self.read_jtype()?;
            if !self.input.demand(jtype.size as u64)? {
                return Err(HeapError::malformed(record_offset, "truncated static fields"));
            }
            if jtype.is_obj {
                let target = self.input.read_id(self.heap.id_size);
                if target != 0 {
                    static_refs.push(target);
                }
            } else {
                self.input.skip(jtype.size as u64);
            }
        }

        // instance fields, with in-class offsets as a running sum
        if !self.input.demand(2)? {
            return Err(HeapError::malformed(record_offset, "truncated class dump"));
        }
        let num_fields = self.input.get_u16();
        let mut fields = Vec::with_capacity(num_fields as usize);
        let mut offset = 0_u32;
        for i in 0..num_fields {
            if !self.input.demand(id + 1)? {
                return Err(HeapError::malformed(record_offset, "truncated field list"));
            }
            let name_hid = self.input.read_id(self.heap.id_size);
            let jtype = self.read_jtype()?;
            let field_name = self
                .heap
                .string_with_id(name_hid)
                .map(|s| s.to_owned())
                .ok_or_else(|| {
                    HeapError::malformed(
                        record_offset,
                        format!("no name for field {} of class {:#x}", i, hid),
                    )
                })?;
            fields.push(Field::new(field_name, jtype.is_obj, jtype.size, offset));
            offset += jtype.size;
        }

        self.heap
            .add_class(&name, hid, super_hid, fields, static_refs)?;
        Ok(())
    }

    /// Read a basic-type tag and return its descriptor.
    fn read_jtype(&mut self) -> Result<JType, HeapError> {
        let pos = self.input.offset();
        let tag = self.input.get_u8();
        self.heap
            .jtype(tag)
            .copied()
            .ok_or_else(|| HeapError::malformed(pos, format!("unknown basic type {}", tag)))
    }

    fn id_bytes(&self) -> u64 {
        self.heap.id_size.in_bytes() as u64
    }
}

/// Object sizes are stored as u32; pathological arrays saturate.
fn clamp_size(size: u64) -> u32 {
    size.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcroots::Visibility;
    use crate::histo::Histo;
    use crate::query::{Query, Step};
    use crate::search::search_heap;
    use itertools::Itertools;
    use std::fs;
    use std::path::PathBuf;

    /// Builds a syntactically valid HPROF image in memory.
    struct DumpBuilder {
        buf: Vec<u8>,
    }

    impl DumpBuilder {
        fn new() -> DumpBuilder {
            let mut buf = Vec::new();
            buf.extend_from_slice(b"JAVA PROFILE 1.0.2\0");
            buf.extend_from_slice(&8_u32.to_be_bytes());
            buf.extend_from_slice(&0_u64.to_be_bytes());
            DumpBuilder { buf }
        }

        fn record(&mut self, tag: u8, body: &[u8]) {
            self.buf.push(tag);
            self.buf.extend_from_slice(&0_u32.to_be_bytes());
            self.buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
            self.buf.extend_from_slice(body);
        }

        fn utf8(&mut self, hid: HeapId, text: &str) {
            let mut body = Vec::new();
            body.extend_from_slice(&hid.to_be_bytes());
            body.extend_from_slice(text.as_bytes());
            self.record(0x01, &body);
        }

        fn load_class(&mut self, class_hid: HeapId, name_hid: HeapId) {
            let mut body = Vec::new();
            body.extend_from_slice(&1_u32.to_be_bytes());
            body.extend_from_slice(&class_hid.to_be_bytes());
            body.extend_from_slice(&1_u32.to_be_bytes());
            body.extend_from_slice(&name_hid.to_be_bytes());
            self.record(0x02, &body);
        }

        fn heap_dump(&mut self, segment: &SegmentBuilder) {
            self.record(0x0c, &segment.buf);
        }

        fn write(self, name: &str) -> PathBuf {
            let path = std::env::temp_dir()
                .join(format!("heaplens-reader-{}-{}", std::process::id(), name));
            fs::write(&path, &self.buf).unwrap();
            path
        }
    }

    #[derive(Default)]
    struct SegmentBuilder {
        buf: Vec<u8>,
    }

    impl SegmentBuilder {
        fn id(&mut self, hid: HeapId) -> &mut Self {
            self.buf.extend_from_slice(&hid.to_be_bytes());
            self
        }

        fn u32(&mut self, v: u32) -> &mut Self {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        fn u16(&mut self, v: u16) -> &mut Self {
            self.buf.extend_from_slice(&v.to_be_bytes());
            self
        }

        /// Minimal CLASS_DUMP: no constants; statics as (name, target)
        /// object entries; fields as (name hid, basic type tag).
        fn class_dump(
            &mut self,
            hid: HeapId,
            super_hid: HeapId,
            statics: &[(HeapId, HeapId)],
            fields: &[(HeapId, u8)],
        ) {
            self.buf.push(0x20);
            self.id(hid).u32(0).id(super_hid);
            for _ in 0..5 {
                self.id(0);
            }
            self.u32(0); // instance size
            self.u16(0); // constant pool
            self.u16(statics.len() as u16);
            for &(name, target) in statics {
                self.id(name);
                self.buf.push(2);
                self.id(target);
            }
            self.u16(fields.len() as u16);
            for &(name, tag) in fields {
                self.id(name);
                self.buf.push(tag);
            }
        }

        fn instance(&mut self, hid: HeapId, class_hid: HeapId, payload: &[u8]) {
            self.buf.push(0x21);
            self.id(hid).u32(0).id(class_hid).u32(payload.len() as u32);
            self.buf.extend_from_slice(payload);
        }

        fn object_array(&mut self, hid: HeapId, class_hid: HeapId, elements: &[HeapId]) {
            self.buf.push(0x22);
            self.id(hid).u32(0).u32(elements.len() as u32).id(class_hid);
            for &e in elements {
                self.id(e);
            }
        }

        fn primitive_array(&mut self, hid: HeapId, type_tag: u8, elem_size: usize, count: u32) {
            self.buf.push(0x23);
            self.id(hid).u32(0).u32(count);
            self.buf.push(type_tag);
            self.buf.extend(std::iter::repeat(0_u8).take(elem_size * count as usize));
        }

        fn root_unknown(&mut self, hid: HeapId) {
            self.buf.push(0xff);
            self.id(hid);
        }
    }

    /// Object <- Integer, Holder { Integer ref }, Integer[], int[].
    ///
    /// Instances: Integers 0x301..0x305, Holder 0x306 -> 0x301,
    /// Integer[2] 0x307 -> {0x304, 0, 0x305}, int[3] 0x308.
    /// Roots: holder 0x306 plus Integers 0x302 and 0x303; Holder has a
    /// static reference to 0x301.
    fn scenario_dump(name: &str) -> PathBuf {
        let mut dump = DumpBuilder::new();
        dump.utf8(100, "java/lang/Object");
        dump.utf8(101, "java/lang/Integer");
        dump.utf8(102, "value");
        dump.utf8(103, "com/acme/Holder");
        dump.utf8(104, "[Ljava/lang/Integer;");
        dump.utf8(105, "[I");
        dump.utf8(106, "ref");
        dump.utf8(107, "INSTANCE");
        dump.load_class(0x200, 100);
        dump.load_class(0x201, 101);
        dump.load_class(0x202, 103);
        dump.load_class(0x203, 104);
        dump.load_class(0x204, 105);

        // classes and roots in the first segment
        let mut seg = SegmentBuilder::default();
        seg.class_dump(0x200, 0, &[], &[]);
        seg.class_dump(0x201, 0x200, &[], &[(102, 0x0A)]);
        seg.class_dump(0x202, 0x200, &[(107, 0x301)], &[(106, 2)]);
        seg.class_dump(0x203, 0x200, &[], &[]);
        seg.class_dump(0x204, 0x200, &[], &[]);
        seg.root_unknown(0x306);
        seg.root_unknown(0x302);
        seg.root_unknown(0x303);
        dump.heap_dump(&seg);

        // objects in a second segment
        let mut seg = SegmentBuilder::default();
        for hid in [0x301_u64, 0x302, 0x303, 0x304, 0x305] {
            seg.instance(hid, 0x201, &7_u32.to_be_bytes());
        }
        seg.instance(0x306, 0x202, &0x301_u64.to_be_bytes());
        seg.object_array(0x307, 0x203, &[0x304, 0, 0x305]);
        seg.primitive_array(0x308, 0x0A, 4, 3);
        dump.heap_dump(&seg);

        dump.write(name)
    }

    fn read(path: &PathBuf, need_refs: bool) -> Heap {
        let heap = read_heap_dump(path, &Options { need_refs }).unwrap();
        fs::remove_file(path).unwrap();
        heap
    }

    fn oid_of(heap: &Heap, hid: HeapId) -> crate::ObjectId {
        // instance oids were assigned in dump order starting at 2
        (hid - 0x301 + 2) as crate::ObjectId
    }

    #[test]
    fn scenario_model() {
        let heap = read(&scenario_dump("model"), true);

        // 6 real classes (root included) plus one synthetic per class
        assert_eq!(12, heap.classes.max_cid());
        assert_eq!(15, heap.max_oid());

        let integer = heap.classes.by_name("java.lang.Integer").unwrap();
        assert_eq!(5, heap.classes.instance_count(integer.cid()));
        // payload (4) + monitor id (8)
        assert_eq!(12, heap.size_of(oid_of(&heap, 0x301)));
        // (3 + 2 header) ids
        assert_eq!(40, heap.size_of(oid_of(&heap, 0x307)));
        // 3 ints + 2 header ids
        assert_eq!(28, heap.size_of(oid_of(&heap, 0x308)));
        assert_eq!(
            "java.lang.Integer[]",
            heap.class_of(oid_of(&heap, 0x307)).name().as_str()
        );
        assert_eq!("int[]", heap.class_of(oid_of(&heap, 0x308)).name().as_str());
    }

    #[test]
    fn scenario_graph_and_liveness() {
        let heap = read(&scenario_dump("graph"), true);
        let graph = heap.graph().unwrap();

        // holder -> 0x301
        let holder = oid_of(&heap, 0x306);
        assert_eq!(vec![oid_of(&heap, 0x301)], graph.out_edges(holder).collect_vec());
        // array -> {0x304, 0x305}; the null element vanishes
        let array = oid_of(&heap, 0x307);
        assert_eq!(
            vec![oid_of(&heap, 0x304), oid_of(&heap, 0x305)],
            graph.out_edges(array).sorted().collect_vec()
        );
        // 0x301 is held by the holder and by Holder's static reference
        let holds_301 = graph.in_edges(oid_of(&heap, 0x301)).sorted().collect_vec();
        assert_eq!(2, holds_301.len());
        assert_eq!(holder, holds_301[0]);

        // live: roots 0x306/0x302/0x303, 0x301 through the holder
        for hid in [0x301_u64, 0x302, 0x303, 0x306] {
            assert!(heap.roots.is_live(oid_of(&heap, hid)), "{:#x}", hid);
        }
        // garbage: 0x304, 0x305, the array, the primitive array
        for hid in [0x304_u64, 0x305, 0x307, 0x308] {
            assert!(!heap.roots.is_live(oid_of(&heap, hid)), "{:#x}", hid);
        }
    }

    fn integer_count(heap: &Heap) -> Option<(u32, u64)> {
        let mut histo = Histo::new(heap);
        let query = Query::new(
            vec!["x".into()],
            vec![Step::new("Integer".into(), "x".into(), true, false)],
        )
        .unwrap();
        search_heap(heap, &query, &mut histo);
        histo.row("java.lang.Integer")
    }

    #[test]
    fn garbage_visibility_filters_matches() {
        let mut heap = read(&scenario_dump("garbage"), true);

        // default: live only
        assert_eq!(Some((3, 36)), integer_count(&heap));

        heap.roots.set_visibility(Visibility::NonLive);
        assert_eq!(Some((2, 24)), integer_count(&heap));

        heap.roots.set_visibility(Visibility::All);
        assert_eq!(Some((5, 60)), integer_count(&heap));
    }

    #[test]
    fn histo_mode_counts_every_object() {
        let mut dump = DumpBuilder::new();
        dump.utf8(100, "java/lang/Object");
        dump.utf8(101, "com/acme/Thing");
        dump.load_class(0x200, 100);
        dump.load_class(0x201, 101);
        let mut seg = SegmentBuilder::default();
        seg.class_dump(0x200, 0, &[], &[]);
        seg.class_dump(0x201, 0x200, &[], &[]);
        for i in 0..10_000_u64 {
            seg.instance(0x1000 + i * 8, 0x201, &[]);
        }
        dump.heap_dump(&seg);
        let heap = read(&dump.write("histo-mode"), false);
        assert!(heap.graph().is_none());
        let mut histo = Histo::new(&heap);
        for oid in 1..=heap.max_oid() {
            histo.add(oid);
        }
        assert_eq!(Some((10_000, 80_000)), histo.row("com.acme.Thing"));
    }

    #[test]
    fn histogram_is_idempotent_across_paths() {
        // two holders reference the same Integer; a two-step query
        // reaches it twice but it must be counted once
        let mut dump = DumpBuilder::new();
        dump.utf8(100, "java/lang/Object");
        dump.utf8(101, "java/lang/Integer");
        dump.utf8(103, "com/acme/Holder");
        dump.utf8(106, "ref");
        dump.load_class(0x200, 100);
        dump.load_class(0x201, 101);
        dump.load_class(0x202, 103);
        let mut seg = SegmentBuilder::default();
        seg.class_dump(0x200, 0, &[], &[]);
        seg.class_dump(0x201, 0x200, &[], &[]);
        seg.class_dump(0x202, 0x200, &[], &[(106, 2)]);
        seg.instance(0x301, 0x201, &[]);
        seg.instance(0x302, 0x202, &0x301_u64.to_be_bytes());
        seg.instance(0x303, 0x202, &0x301_u64.to_be_bytes());
        seg.root_unknown(0x302);
        seg.root_unknown(0x303);
        dump.heap_dump(&seg);
        let heap = read(&dump.write("idempotent"), true);

        let mut histo = Histo::new(&heap);
        let query = Query::new(
            vec!["y".into()],
            vec![
                Step::new("com.acme.Holder".into(), "x".into(), true, false),
                Step::new("Integer".into(), "y".into(), true, false),
            ],
        )
        .unwrap();
        search_heap(&heap, &query, &mut histo);
        assert_eq!(Some((1, 8)), histo.row("java.lang.Integer"));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"JAVA PROFILE 9.9.9\0");
        buf.extend_from_slice(&8_u32.to_be_bytes());
        buf.extend_from_slice(&0_u64.to_be_bytes());
        let path = std::env::temp_dir()
            .join(format!("heaplens-reader-{}-magic", std::process::id()));
        fs::write(&path, &buf).unwrap();
        let err = read_heap_dump(&path, &Options::default()).unwrap_err();
        fs::remove_file(&path).unwrap();
        assert!(matches!(err, HeapError::MalformedInput { offset: 0, .. }));
    }

    #[test]
    fn rejects_bad_id_size() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"JAVA PROFILE 1.0.2\0");
        buf.extend_from_slice(&16_u32.to_be_bytes());
        buf.extend_from_slice(&0_u64.to_be_bytes());
        let path = std::env::temp_dir()
            .join(format!("heaplens-reader-{}-idsize", std::process::id()));
        fs::write(&path, &buf).unwrap();
        let err = read_heap_dump(&path, &Options::default()).unwrap_err();
        fs::remove_file(&path).unwrap();
        assert!(matches!(err, HeapError::UnsupportedIdSize(16)));
    }

    #[test]
    fn rejects_unknown_record_tag() {
        let mut dump = DumpBuilder::new();
        dump.record(0x42, &[]);
        let path = dump.write("unknown-tag");
        let err = read_heap_dump(&path, &Options::default()).unwrap_err();
        fs::remove_file(&path).unwrap();
        match err {
            HeapError::MalformedInput { offset, .. } => assert_eq!(31, offset),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
