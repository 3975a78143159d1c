//! Small support types: bit sets, chunked append-only lists, and JVM type
//! name demangling.

use crate::error::HeapError;

/// A plain fixed-size bit set. No dynamic sizing; indexes past the
/// constructed size panic.
#[derive(Clone, Debug)]
pub struct BitSet {
    words: Vec<u64>,
    size: usize,
}

impl BitSet {
    pub fn new(size: usize) -> BitSet {
        BitSet {
            words: vec![0; size.div_ceil(64)],
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set(&mut self, i: usize) {
        self.words[i / 64] |= 1 << (i % 64);
    }

    pub fn clear(&mut self, i: usize) {
        self.words[i / 64] &= !(1 << (i % 64));
    }

    pub fn has(&self, i: usize) -> bool {
        self.words[i / 64] & (1 << (i % 64)) != 0
    }

    pub fn set_all(&mut self) {
        self.words.fill(!0);
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }
}

/// A bit set whose writes can be rolled back to a saved watermark. Each
/// newly set bit is appended to a log, so undoing a region of work costs
/// only the bits it actually set. Used by the query engine to reset the
/// per-pass "touched" state cheaply.
pub struct UndoableBitSet {
    bits: BitSet,
    log: Vec<u32>,
}

impl UndoableBitSet {
    pub fn new(size: usize) -> UndoableBitSet {
        UndoableBitSet {
            bits: BitSet::new(size),
            log: Vec::new(),
        }
    }

    pub fn set(&mut self, i: u32) {
        if !self.bits.has(i as usize) {
            self.bits.set(i as usize);
            self.log.push(i);
        }
    }

    pub fn has(&self, i: u32) -> bool {
        self.bits.has(i as usize)
    }

    /// Watermark for a later [`UndoableBitSet::undo_to`].
    pub fn mark(&self) -> usize {
        self.log.len()
    }

    /// Clear every bit set since `mark` was taken.
    pub fn undo_to(&mut self, mark: usize) {
        for &i in &self.log[mark..] {
            self.bits.clear(i as usize);
        }
        self.log.truncate(mark);
    }

    /// Clear every bit ever set.
    pub fn undo(&mut self) {
        self.undo_to(0);
    }
}

/// Default chunk capacity for [`ChunkedVec`]: large enough to amortize
/// allocation, small enough that abandoned tail space is cheap.
const CHUNK_CAPACITY: usize = 1 << 16;

/// An append-only list stored as fixed-capacity chunks. Appending never
/// moves previously written elements, so building lists of hundreds of
/// millions of entries avoids the reallocation copies (and transient 2x
/// memory) of a flat `Vec`.
#[derive(Debug)]
pub struct ChunkedVec<T> {
    chunks: Vec<Vec<T>>,
    len: usize,
}

impl<T: Copy> ChunkedVec<T> {
    pub fn new() -> ChunkedVec<T> {
        ChunkedVec {
            chunks: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: T) {
        match self.chunks.last_mut() {
            Some(chunk) if chunk.len() < chunk.capacity() => chunk.push(value),
            _ => {
                let mut chunk = Vec::with_capacity(CHUNK_CAPACITY);
                chunk.push(value);
                self.chunks.push(chunk);
            }
        }
        self.len += 1;
    }

    pub fn chunks(&self) -> impl Iterator<Item = &[T]> {
        self.chunks.iter().map(|c| c.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.chunks.iter().flatten()
    }
}

impl<T: Copy> Default for ChunkedVec<T> {
    fn default() -> Self {
        ChunkedVec::new()
    }
}

/// Demangle a JVM internal type name, e.g.
///
/// ```text
/// [[I            -> int[][]
/// [Lcom/foo/Bar; -> com.foo.Bar[]
/// com/foo/Bar    -> com.foo.Bar
/// ```
pub fn demangle(name: &str) -> Result<String, HeapError> {
    let stripped = name.trim_start_matches('[');
    let dimen = name.len() - stripped.len();
    if stripped.is_empty() {
        return Err(HeapError::BadTypeName(name.to_owned()));
    }
    if stripped.starts_with('L') && stripped.ends_with(';') {
        let inner = demangle(&stripped[1..stripped.len() - 1])?;
        return Ok(inner + &"[]".repeat(dimen));
    }
    if dimen > 0 {
        let prim = match stripped {
            "Z" => "boolean",
            "C" => "char",
            "F" => "float",
            "D" => "double",
            "B" => "byte",
            "S" => "short",
            "I" => "int",
            "J" => "long",
            _ => return Err(HeapError::BadTypeName(name.to_owned())),
        };
        return Ok(prim.to_owned() + &"[]".repeat(dimen));
    }
    Ok(stripped.replace('/', "."))
}
