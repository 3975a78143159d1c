//! Concurrent decoding of instance and array payloads.
//!
//! The reader thread is the sole advancer of the input cursor, so it only
//! notes where each INSTANCE_DUMP / OBJECT_ARRAY record lives and hands
//! batches of (file offset, object id, class) tuples to a pool of workers.
//! Each worker maps its own view of the file, re-reads the payloads, and
//! banks the references it finds in a private [`RefBag`] — no
//! synchronization in the hot loop. The work channel is bounded at the
//! worker count, which is what makes the reader wait when no worker is
//! idle.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;

use crate::class::ClassDef;
use crate::error::HeapError;
use crate::mapped::{MappedFile, MappedSection};
use crate::refbag::RefBag;
use crate::{IdSize, ObjectId};

/// Rough record count per GiB of heap segment, from observation. Most
/// segments are 1 GiB, so the batch size partitions one into about 100
/// work cycles.
const RECORDS_PER_GB: usize = 10_000_000;

const BATCH_SIZE: usize = RECORDS_PER_GB / 100;

/// Elements demanded per step when scanning large object arrays, keeping
/// single demands well under the window limit.
const ARRAY_RUN: u32 = 1 << 16;

/// One unit of worker input. Object ids within a batch are contiguous and
/// ascending; reference emission order across workers is undefined.
struct Batch {
    offsets: Vec<u64>,
    oids: Vec<ObjectId>,
    classes: Vec<Arc<ClassDef>>,
}

impl Batch {
    fn new() -> Batch {
        Batch {
            offsets: Vec::with_capacity(BATCH_SIZE),
            oids: Vec::with_capacity(BATCH_SIZE),
            classes: Vec::with_capacity(BATCH_SIZE),
        }
    }

    fn len(&self) -> usize {
        self.offsets.len()
    }

    fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Manages the worker pool and the batch being filled.
pub struct SegReader {
    active: Batch,
    tx: Sender<Batch>,
    handles: Vec<JoinHandle<Result<RefBag, HeapError>>>,
}

impl SegReader {
    /// Create a segment reader with one worker per CPU.
    pub fn new(file: &Arc<MappedFile>, id_size: IdSize) -> SegReader {
        let workers = num_cpus::get().max(1);
        let (tx, rx) = bounded::<Batch>(workers);
        let handles = (0..workers)
            .map(|id| {
                let rx = rx.clone();
                let file = Arc::clone(file);
                thread::spawn(move || run_worker(id, file, id_size, rx))
            })
            .collect();
        SegReader {
            active: Batch::new(),
            tx,
            handles,
        }
    }

    /// Queue one record location for decoding. When the active batch is
    /// full it is handed off, waiting for an idle worker if necessary.
    pub fn add_work(&mut self, offset: u64, oid: ObjectId, class: &Arc<ClassDef>) {
        self.active.offsets.push(offset);
        self.active.oids.push(oid);
        self.active.classes.push(Arc::clone(class));
        if self.active.len() == BATCH_SIZE {
            let batch = std::mem::replace(&mut self.active, Batch::new());
            // A send error means every worker is gone; the failure that
            // killed them is reported by close().
            let _ = self.tx.send(batch);
        }
    }

    /// Flush the last batch, drain the pool, and collect each worker's
    /// reference bag. The first decode failure, if any, surfaces here.
    pub fn close(self) -> Result<Vec<RefBag>, HeapError> {
        let SegReader {
            active,
            tx,
            handles,
        } = self;
        if !active.is_empty() {
            let _ = tx.send(active);
        }
        drop(tx);
        let mut bags = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.join() {
                Ok(bag) => bags.push(bag?),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        Ok(bags)
    }
}

/// Worker main loop. After a decode failure the worker keeps draining its
/// queue (so the reader never blocks on a full channel) and reports the
/// first error when the pool is closed.
fn run_worker(
    id: usize,
    file: Arc<MappedFile>,
    id_size: IdSize,
    rx: Receiver<Batch>,
) -> Result<RefBag, HeapError> {
    let mut bag = RefBag::new();
    let mut failure: Option<HeapError> = None;
    let mut batches = 0_usize;
    for batch in rx {
        if failure.is_none() {
            batches += 1;
            if let Err(e) = decode_batch(&file, id_size, &batch, &mut bag) {
                failure = Some(e);
            }
        }
    }
    debug!(
        "segment worker {} decoded {} batches, {} references",
        id,
        batches,
        bag.len()
    );
    match failure {
        Some(e) => Err(e),
        None => Ok(bag),
    }
}

fn decode_batch(
    file: &Arc<MappedFile>,
    id_size: IdSize,
    batch: &Batch,
    bag: &mut RefBag,
) -> Result<(), HeapError> {
    if batch.is_empty() {
        return Ok(());
    }
    let mut input = MappedFile::map_at(file, batch.offsets[0])?;
    for i in 0..batch.len() {
        let offset = batch.offsets[i];
        input.skip(offset - input.offset());
        if !input.demand(1)? {
            return Err(HeapError::malformed(offset, "truncated heap record"));
        }
        match input.get_u8() {
            0x21 => decode_instance(&mut input, id_size, batch.oids[i], &batch.classes[i], bag)?,
            0x22 => decode_object_array(&mut input, id_size, batch.oids[i], bag)?,
            other => {
                return Err(HeapError::malformed(
                    offset,
                    format!("unexpected record type {:#04x} in decode worker", other),
                ))
            }
        }
    }
    Ok(())
}

/// Re-read an INSTANCE_DUMP payload, emitting a reference for each
/// nonzero value at the class's cooked reference offsets.
fn decode_instance(
    input: &mut MappedSection,
    id_size: IdSize,
    oid: ObjectId,
    class: &ClassDef,
    bag: &mut RefBag,
) -> Result<(), HeapError> {
    let id = id_size.in_bytes();
    // instance hid, stack serial, and class hid are known from the reader
    // pass
    input.skip(2 * id as u64 + 4);
    if !input.demand(4)? {
        return Err(HeapError::malformed(input.offset(), "truncated instance"));
    }
    let len = input.get_u32();
    if !input.demand(len as u64)? {
        return Err(HeapError::malformed(input.offset(), "truncated instance"));
    }
    let layout = class.cooked_layout();
    if let Some(&last) = layout.ref_offsets.last() {
        if last + id > len {
            return Err(HeapError::malformed(
                input.offset(),
                format!("instance of {} shorter than its layout", class.name()),
            ));
        }
    }
    let mut cursor = 0_u32;
    for &offset in &layout.ref_offsets {
        input.skip((offset - cursor) as u64);
        let hid = input.read_id(id_size);
        if hid != 0 {
            bag.add(oid, hid);
        }
        cursor = offset + id;
    }
    Ok(())
}

/// Re-read an OBJECT_ARRAY's elements, emitting a reference for each
/// nonzero entry.
fn decode_object_array(
    input: &mut MappedSection,
    id_size: IdSize,
    oid: ObjectId,
    bag: &mut RefBag,
) -> Result<(), HeapError> {
    let id = id_size.in_bytes() as u64;
    if !input.demand(2 * id + 8)? {
        return Err(HeapError::malformed(input.offset(), "truncated array"));
    }
    input.skip(id + 4); // array hid, stack serial
    let count = input.get_u32();
    input.skip(id); // element class hid, known from the reader pass

    let mut remaining = count;
    while remaining > 0 {
        let run = remaining.min(ARRAY_RUN);
        if !input.demand(run as u64 * id)? {
            return Err(HeapError::malformed(input.offset(), "truncated array"));
        }
        for _ in 0..run {
            let hid = input.read_id(id_size);
            if hid != 0 {
                bag.add(oid, hid);
            }
        }
        remaining -= run;
    }
    Ok(())
}
