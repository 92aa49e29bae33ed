//! Slab Allocator
//!
//! Items live in fixed-size chunks handed out by this allocator. Chunk sizes
//! form power-of-two classes starting at `min_chunk` and ending at the page
//! size, so every item is rounded up into the smallest class that fits it.
//!
//! ## Memory Accounting
//!
//! ```text
//!  class 1 (64 B)    [page][page]        free: ▢▢▢
//!  class 2 (128 B)   [page]              free: ▢
//!  class 3 (256 B)   [page][page][page]  free:
//!  ...
//!                    └──── mem_malloced ≤ mem_limit ────┘
//! ```
//!
//! Memory is granted to a class one page at a time. A page is only carved
//! into chunks on demand, and a freed chunk goes back onto its class's free
//! list, never to another class. The first page of every class is granted
//! even past the limit so that each class can hold at least a page worth of
//! items and eviction always has something to work with.

use std::fmt::{self, Write};

/// Largest number of size classes the allocator will create.
pub const MAX_CLASSES: usize = 32;

/// Default page size (1 MiB), which is also the largest chunk size.
pub const DEFAULT_PAGE_SIZE: usize = 1024 * 1024;

/// Default smallest chunk size.
pub const DEFAULT_MIN_CHUNK: usize = 64;

/// Default memory limit (64 MiB).
pub const DEFAULT_MEM_LIMIT: usize = 64 * 1024 * 1024;

/// Identifies a size class. Ids start at 1.
///
/// Ids can only be obtained from [`SlabAllocator::classify`] or
/// [`SlabAllocator::class_id`], so an id is always valid for the allocator
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u8);

impl ClassId {
    /// Returns the numeric id as shown in stats output.
    pub fn get(self) -> u8 {
        self.0
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize - 1
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Geometry and limits of the allocator.
#[derive(Debug, Clone)]
pub struct SlabConfig {
    /// Total bytes of pages the allocator may grant (0 = unlimited)
    pub mem_limit: usize,
    /// Size of one page; also the largest chunk size
    pub page_size: usize,
    /// Chunk size of the first class
    pub min_chunk: usize,
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self {
            mem_limit: DEFAULT_MEM_LIMIT,
            page_size: DEFAULT_PAGE_SIZE,
            min_chunk: DEFAULT_MIN_CHUNK,
        }
    }
}

#[derive(Debug)]
struct SlabClass {
    chunk_size: usize,
    per_page: usize,
    pages: usize,
    /// Chunks returned by `release`, ready for reuse
    free: Vec<Box<[u8]>>,
    /// Chunks granted by a page but not carved yet
    uncarved: usize,
}

impl SlabClass {
    fn new(chunk_size: usize, page_size: usize) -> Self {
        Self {
            chunk_size,
            per_page: page_size / chunk_size,
            pages: 0,
            free: Vec::new(),
            uncarved: 0,
        }
    }

    fn total_chunks(&self) -> usize {
        self.pages * self.per_page
    }

    fn used_chunks(&self) -> usize {
        self.total_chunks() - self.free.len() - self.uncarved
    }
}

/// Power-of-two slab allocator.
#[derive(Debug)]
pub struct SlabAllocator {
    classes: Vec<SlabClass>,
    mem_limit: usize,
    mem_malloced: usize,
    page_size: usize,
}

impl SlabAllocator {
    /// Creates an allocator. No memory is reserved until the first allocation.
    pub fn new(config: SlabConfig) -> Self {
        let mut classes = Vec::new();
        let mut size = config.min_chunk.max(1);
        while size <= config.page_size && classes.len() < MAX_CLASSES {
            classes.push(SlabClass::new(size, config.page_size));
            size *= 2;
        }

        Self {
            classes,
            mem_limit: config.mem_limit,
            mem_malloced: 0,
            page_size: config.page_size,
        }
    }

    /// Returns the smallest class whose chunks can hold `size` bytes, or
    /// `None` if the object is larger than the largest class.
    pub fn classify(&self, size: usize) -> Option<ClassId> {
        self.classes
            .iter()
            .position(|class| class.chunk_size >= size)
            .map(|idx| ClassId(idx as u8 + 1))
    }

    /// Validates a raw class number, e.g. one supplied by a client.
    pub fn class_id(&self, raw: u32) -> Option<ClassId> {
        if raw >= 1 && (raw as usize) <= self.classes.len() {
            Some(ClassId(raw as u8))
        } else {
            None
        }
    }

    /// Number of classes.
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Iterates over every class id.
    pub fn class_ids(&self) -> impl Iterator<Item = ClassId> {
        (1..=self.classes.len()).map(|id| ClassId(id as u8))
    }

    /// Chunk size of a class.
    pub fn chunk_size(&self, id: ClassId) -> usize {
        self.classes[id.index()].chunk_size
    }

    /// Total bytes of pages granted so far.
    pub fn mem_malloced(&self) -> usize {
        self.mem_malloced
    }

    /// Hands out one chunk of the given class, or `None` if the class has no
    /// free chunk and no further page may be granted.
    pub fn allocate(&mut self, id: ClassId) -> Option<Box<[u8]>> {
        let class = &mut self.classes[id.index()];

        if let Some(chunk) = class.free.pop() {
            return Some(chunk);
        }

        if class.uncarved == 0 {
            let over_limit =
                self.mem_limit != 0 && self.mem_malloced + self.page_size > self.mem_limit;
            if over_limit && class.pages > 0 {
                return None;
            }
            class.pages += 1;
            class.uncarved = class.per_page;
            self.mem_malloced += self.page_size;
        }

        class.uncarved -= 1;
        Some(vec![0u8; class.chunk_size].into_boxed_slice())
    }

    /// Returns a chunk to its class.
    pub fn release(&mut self, id: ClassId, chunk: Box<[u8]>) {
        let class = &mut self.classes[id.index()];
        debug_assert_eq!(chunk.len(), class.chunk_size);
        class.free.push(chunk);
    }

    /// Renders the `stats slabs` report.
    pub fn render_stats(&self) -> String {
        let mut out = String::new();
        let mut active = 0;

        for (idx, class) in self.classes.iter().enumerate() {
            if class.pages == 0 {
                continue;
            }
            active += 1;
            let id = idx + 1;
            let _ = write!(
                out,
                "STAT {id}:chunk_size {}\r\n\
                 STAT {id}:chunks_per_page {}\r\n\
                 STAT {id}:total_pages {}\r\n\
                 STAT {id}:total_chunks {}\r\n\
                 STAT {id}:used_chunks {}\r\n\
                 STAT {id}:free_chunks {}\r\n",
                class.chunk_size,
                class.per_page,
                class.pages,
                class.total_chunks(),
                class.used_chunks(),
                class.free.len() + class.uncarved,
            );
        }

        let _ = write!(
            out,
            "STAT active_slabs {active}\r\nSTAT total_malloced {}\r\nEND\r\n",
            self.mem_malloced
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_allocator(mem_limit: usize) -> SlabAllocator {
        SlabAllocator::new(SlabConfig {
            mem_limit,
            page_size: 1024,
            min_chunk: 64,
        })
    }

    #[test]
    fn test_class_geometry() {
        let slabs = small_allocator(0);

        // 64, 128, 256, 512, 1024
        assert_eq!(slabs.num_classes(), 5);
        assert_eq!(slabs.classify(1).map(ClassId::get), Some(1));
        assert_eq!(slabs.classify(64).map(ClassId::get), Some(1));
        assert_eq!(slabs.classify(65).map(ClassId::get), Some(2));
        assert_eq!(slabs.classify(1024).map(ClassId::get), Some(5));
        assert_eq!(slabs.classify(1025), None);
    }

    #[test]
    fn test_default_geometry_fits_class_limit() {
        let slabs = SlabAllocator::new(SlabConfig::default());
        assert!(slabs.num_classes() <= MAX_CLASSES);
        let largest = slabs.class_ids().last().unwrap();
        assert_eq!(slabs.chunk_size(largest), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_class_id_validation() {
        let slabs = small_allocator(0);
        assert!(slabs.class_id(0).is_none());
        assert_eq!(slabs.class_id(3).map(ClassId::get), Some(3));
        assert!(slabs.class_id(6).is_none());
    }

    #[test]
    fn test_allocate_respects_limit() {
        // Two pages of budget
        let mut slabs = small_allocator(2048);
        let class = slabs.classify(512).unwrap();

        // 2 chunks per page, 2 pages
        let chunks: Vec<_> = (0..4).map(|_| slabs.allocate(class)).collect();
        assert!(chunks.iter().all(Option::is_some));
        assert!(slabs.allocate(class).is_none());
        assert_eq!(slabs.mem_malloced(), 2048);
    }

    #[test]
    fn test_first_page_always_granted() {
        let mut slabs = small_allocator(1024);
        let small = slabs.classify(64).unwrap();
        let large = slabs.classify(1024).unwrap();

        assert!(slabs.allocate(small).is_some());
        // Budget is spent, but the large class has no page yet
        assert!(slabs.allocate(large).is_some());
        assert!(slabs.allocate(large).is_none());
    }

    #[test]
    fn test_release_recycles_chunk() {
        let mut slabs = small_allocator(1024);
        let class = slabs.classify(1024).unwrap();

        let chunk = slabs.allocate(class).unwrap();
        assert_eq!(chunk.len(), 1024);
        assert!(slabs.allocate(class).is_none());

        slabs.release(class, chunk);
        assert!(slabs.allocate(class).is_some());
        assert_eq!(slabs.mem_malloced(), 1024);
    }

    #[test]
    fn test_render_stats() {
        let mut slabs = small_allocator(0);
        let class = slabs.classify(100).unwrap();
        let _chunk = slabs.allocate(class).unwrap();

        let report = slabs.render_stats();
        assert!(report.contains("STAT 2:chunk_size 128\r\n"));
        assert!(report.contains("STAT 2:used_chunks 1\r\n"));
        assert!(report.contains("STAT 2:free_chunks 7\r\n"));
        assert!(report.contains("STAT active_slabs 1\r\n"));
        assert!(report.ends_with("END\r\n"));
    }
}
