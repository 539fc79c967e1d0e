use crate::cache::piece::PieceEntry;

/// Arena of piece entries addressed by stable indices.
pub type PieceArena = Vec<Option<PieceEntry>>;

/// Doubly linked list of arena indices, oldest at the front.
///
/// The linkage itself lives in the `prev`/`next` fields of the entries so a
/// piece can be unlinked in constant time from whichever list holds it.
#[derive(Default)]
pub struct LruList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl LruList {
    pub fn new() -> LruList {
        LruList::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Oldest entry of the list.
    pub fn front(&self) -> Option<usize> {
        self.head
    }

    /// Most recently used entry of the list.
    pub fn back(&self) -> Option<usize> {
        self.tail
    }

    /// Link the given entry at the tail, the most recently used end.
    pub fn push_back(&mut self, arena: &mut PieceArena, index: usize) {
        let old_tail = self.tail;

        {
            let entry = arena[index].as_mut().expect("bep_disk: LruList::push_back Missing Arena Entry");
            debug_assert!(entry.prev.is_none() && entry.next.is_none());

            entry.prev = old_tail;
            entry.next = None;
        }

        if let Some(old_tail) = old_tail {
            arena[old_tail]
                .as_mut()
                .expect("bep_disk: LruList::push_back Missing Tail Entry")
                .next = Some(index);
        } else {
            self.head = Some(index);
        }

        self.tail = Some(index);
        self.len += 1;
    }

    /// Link the given entry at the head, the oldest end.
    pub fn push_front(&mut self, arena: &mut PieceArena, index: usize) {
        let old_head = self.head;

        {
            let entry = arena[index].as_mut().expect("bep_disk: LruList::push_front Missing Arena Entry");
            debug_assert!(entry.prev.is_none() && entry.next.is_none());

            entry.prev = None;
            entry.next = old_head;
        }

        if let Some(old_head) = old_head {
            arena[old_head]
                .as_mut()
                .expect("bep_disk: LruList::push_front Missing Head Entry")
                .prev = Some(index);
        } else {
            self.tail = Some(index);
        }

        self.head = Some(index);
        self.len += 1;
    }

    /// Unlink the given entry from wherever it sits in the list.
    pub fn remove(&mut self, arena: &mut PieceArena, index: usize) {
        let (prev, next) = {
            let entry = arena[index].as_mut().expect("bep_disk: LruList::remove Missing Arena Entry");
            let linkage = (entry.prev.take(), entry.next.take());

            linkage
        };

        match prev {
            Some(prev) => {
                arena[prev].as_mut().expect("bep_disk: LruList::remove Missing Prev Entry").next = next;
            }
            None => self.head = next,
        }

        match next {
            Some(next) => {
                arena[next].as_mut().expect("bep_disk: LruList::remove Missing Next Entry").prev = prev;
            }
            None => self.tail = prev,
        }

        self.len -= 1;
    }

    /// Collect the indices of the list from oldest to newest.
    pub fn indices(&self, arena: &PieceArena) -> Vec<usize> {
        let mut indices = Vec::with_capacity(self.len);

        let mut cursor = self.head;
        while let Some(index) = cursor {
            indices.push(index);
            cursor = arena[index].as_ref().expect("bep_disk: LruList::indices Missing Arena Entry").next;
        }

        indices
    }
}
