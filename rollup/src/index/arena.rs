//! Arena of the buffer mode states
//!
//! Each group owns one slot in the arena, the slot is split into one span per metric.
//! Spans never overlap and the arena only hands out spans of exactly
//! `max_intermediate_size` bytes, the buffer aggregators can not touch the bytes of
//! other groups or other metrics

use std::ops::Range;
use std::sync::Arc;

use crate::aggregate::AggregatorFactory;
use crate::common::utils::memory::next_multiple_of_align;

/// Slots are aligned to the word, the spans inside a slot are packed
const SLOT_ALIGN: usize = 8;

/// Number of bytes of a page, a page holds at least one slot
const PAGE_SIZE: usize = 64 * 1024;

/// Offsets of the spans inside the slot
#[derive(Debug, Clone)]
pub(crate) struct SlotLayout {
    spans: Vec<Range<usize>>,
    size: usize,
}

impl SlotLayout {
    pub(crate) fn new(factories: &[Arc<dyn AggregatorFactory>]) -> Self {
        let mut offset = 0;
        let spans = factories
            .iter()
            .map(|factory| {
                let start = offset;
                offset += factory.max_intermediate_size();
                start..offset
            })
            .collect();
        Self {
            spans,
            size: next_multiple_of_align(offset, SLOT_ALIGN),
        }
    }

    /// Number of bytes of the slot
    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

/// Index of the slot in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotId(usize);

/// Paged storage of the slots. Pages are never reallocated, allocating a slot never
/// moves the existing slots
#[derive(Debug)]
pub(crate) struct SpanArena {
    layout: SlotLayout,
    slots_per_page: usize,
    pages: Vec<Box<[u8]>>,
    len: usize,
}

impl SpanArena {
    pub(crate) fn new(layout: SlotLayout) -> Self {
        let slots_per_page = if layout.size == 0 {
            usize::MAX
        } else {
            (PAGE_SIZE / layout.size).max(1)
        };
        Self {
            layout,
            slots_per_page,
            pages: Vec::new(),
            len: 0,
        }
    }

    /// Allocate a zeroed slot
    pub(crate) fn alloc(&mut self) -> SlotId {
        let id = SlotId(self.len);
        if self.layout.size > 0 && self.len % self.slots_per_page == 0 {
            self.pages
                .push(vec![0; self.slots_per_page * self.layout.size].into_boxed_slice());
        }
        self.len += 1;
        id
    }

    /// Give back the last allocated slot, the next allocation reuses it zeroed
    pub(crate) fn release_last(&mut self, slot: SlotId) {
        debug_assert_eq!(slot.0 + 1, self.len);
        if self.layout.size > 0 {
            let (page, range) = self.slot_range(slot);
            self.pages[page][range].fill(0);
            if slot.0 % self.slots_per_page == 0 {
                self.pages.pop();
            }
        }
        self.len -= 1;
    }

    /// Number of the allocated slots
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Bytes reserved by the pages
    pub(crate) fn reserved_bytes(&self) -> usize {
        self.pages.iter().map(|page| page.len()).sum()
    }

    fn slot_range(&self, slot: SlotId) -> (usize, Range<usize>) {
        debug_assert!(slot.0 < self.len);
        let page = slot.0 / self.slots_per_page;
        let start = (slot.0 % self.slots_per_page) * self.layout.size;
        (page, start..start + self.layout.size)
    }

    /// Span of the metric in the slot
    pub(crate) fn span(&self, slot: SlotId, metric: usize) -> &[u8] {
        if self.layout.size == 0 {
            return &[];
        }
        let (page, range) = self.slot_range(slot);
        let span = &self.layout.spans[metric];
        &self.pages[page][range][span.clone()]
    }

    /// Mutable spans of all of the metrics in the slot
    pub(crate) fn spans_mut(&mut self, slot: SlotId) -> SlotSpans<'_> {
        if self.layout.size == 0 {
            return SlotSpans {
                slot: &mut [],
                spans: &self.layout.spans,
            };
        }
        let (page, range) = self.slot_range(slot);
        SlotSpans {
            slot: &mut self.pages[page][range],
            spans: &self.layout.spans,
        }
    }
}

/// Mutable view of a slot, split into the spans of the metrics
#[derive(Debug)]
pub(crate) struct SlotSpans<'a> {
    slot: &'a mut [u8],
    spans: &'a [Range<usize>],
}

impl SlotSpans<'_> {
    /// Span of the metric
    #[inline]
    pub(crate) fn get_mut(&mut self, metric: usize) -> &mut [u8] {
        let span = self.spans[metric].clone();
        &mut self.slot[span]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::count::CountAggregatorFactory;
    use crate::aggregate::first_last::LongFirstAggregatorFactory;

    #[test]
    fn test_spans_are_disjoint() {
        let factories: Vec<Arc<dyn AggregatorFactory>> = vec![
            Arc::new(CountAggregatorFactory::try_new("rows", None).unwrap()),
            Arc::new(LongFirstAggregatorFactory::with_field("first", "value").unwrap()),
        ];
        let layout = SlotLayout::new(&factories);
        assert_eq!(layout.size(), 32);

        let mut arena = SpanArena::new(layout);
        let slots = (0..5000).map(|_| arena.alloc()).collect::<Vec<_>>();
        assert_eq!(arena.len(), 5000);
        assert_eq!(arena.pages.len(), 3);

        for (i, &slot) in slots.iter().enumerate() {
            let mut spans = arena.spans_mut(slot);
            spans.get_mut(0).fill(i as u8);
            spans.get_mut(1).fill(!(i as u8));
        }
        for (i, &slot) in slots.iter().enumerate() {
            assert_eq!(arena.span(slot, 0), &[i as u8; 8]);
            assert_eq!(arena.span(slot, 1), &[!(i as u8); 17]);
        }
    }

    #[test]
    fn test_release_last_slot() {
        let factories: Vec<Arc<dyn AggregatorFactory>> =
            vec![Arc::new(CountAggregatorFactory::try_new("rows", None).unwrap())];
        let mut arena = SpanArena::new(SlotLayout::new(&factories));
        let slots_per_page = arena.slots_per_page;
        for _ in 0..slots_per_page {
            arena.alloc();
        }
        assert_eq!(arena.pages.len(), 1);

        // The released slot opened the second page
        let slot = arena.alloc();
        arena.spans_mut(slot).get_mut(0).fill(7);
        arena.release_last(slot);
        assert_eq!(arena.len(), slots_per_page);
        assert_eq!(arena.pages.len(), 1);

        let slot = arena.alloc();
        assert_eq!(arena.pages.len(), 2);
        assert_eq!(arena.span(slot, 0), &[0; 8]);
        arena.spans_mut(slot).get_mut(0).fill(7);
        let last = arena.alloc();
        arena.release_last(last);
        assert_eq!(arena.pages.len(), 2);
        assert_eq!(arena.span(slot, 0), &[7; 8]);
    }
}
