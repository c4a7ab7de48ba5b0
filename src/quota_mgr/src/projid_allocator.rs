use hostpath_lib::HostPathError;
use log::{debug, warn};
use thiserror::Error;

const WORD_BITS: u32 = u64::BITS;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectIdError {
    #[error("project id {id} is not in valid range [{start}, {end})")]
    NotInRange { id: u32, start: u32, end: u64 },
    #[error("provided project id {0} is already allocated")]
    AlreadyAllocated(u32),
    #[error("range is full")]
    Full,
    #[error("project id range [{start}, {start}+{count}) exceeds u32")]
    RangeOverflow { start: u32, count: u32 },
}

impl From<ProjectIdError> for HostPathError {
    fn from(err: ProjectIdError) -> Self {
        match err {
            ProjectIdError::NotInRange { .. } => HostPathError::InvalidArgument(err.to_string()),
            ProjectIdError::AlreadyAllocated(_) => HostPathError::AlreadyExists(err.to_string()),
            ProjectIdError::Full => HostPathError::ResourceExhausted(err.to_string()),
            ProjectIdError::RangeOverflow { .. } => {
                HostPathError::InvalidArgument(err.to_string())
            }
        }
    }
}

/// Fixed range `[start, start+count)` of project ids backed by a bitset.
///
/// Padding bits past `count` in the last word are kept set so a word with
/// any zero bit always holds a free id. `next_free_word` never points past
/// a word with a free bit, which keeps `allocate_next` amortized O(1).
#[derive(Debug, Clone)]
pub struct ProjectIdAllocator {
    start: u32,
    count: u32,
    words: Vec<u64>,
    allocated: u32,
    next_free_word: usize,
}

impl ProjectIdAllocator {
    pub fn new(start: u32, count: u32) -> Result<Self, ProjectIdError> {
        if start.checked_add(count).is_none() {
            return Err(ProjectIdError::RangeOverflow { start, count });
        }
        let word_count = count.div_ceil(WORD_BITS) as usize;
        let mut words = vec![0u64; word_count];
        let tail = count % WORD_BITS;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = !0u64 << tail;
            }
        }

        Ok(Self {
            start,
            count,
            words,
            allocated: 0,
            next_free_word: 0,
        })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn free(&self) -> u32 {
        self.count - self.allocated
    }

    fn offset(&self, id: u32) -> Option<u32> {
        id.checked_sub(self.start).filter(|off| *off < self.count)
    }

    fn not_in_range(&self, id: u32) -> ProjectIdError {
        ProjectIdError::NotInRange {
            id,
            start: self.start,
            end: self.start as u64 + self.count as u64,
        }
    }

    fn locate(offset: u32) -> (usize, u64) {
        ((offset / WORD_BITS) as usize, 1u64 << (offset % WORD_BITS))
    }

    pub fn allocate(&mut self, id: u32) -> Result<(), ProjectIdError> {
        let offset = self.offset(id).ok_or_else(|| self.not_in_range(id))?;
        let (word, mask) = Self::locate(offset);
        if self.words[word] & mask != 0 {
            return Err(ProjectIdError::AlreadyAllocated(id));
        }
        self.words[word] |= mask;
        self.allocated += 1;
        debug!("project id allocate: id={}", id);
        Ok(())
    }

    /// Takes the lowest free id.
    pub fn allocate_next(&mut self) -> Result<u32, ProjectIdError> {
        while self.next_free_word < self.words.len() {
            let word = self.words[self.next_free_word];
            if word != !0u64 {
                let bit = word.trailing_ones();
                self.words[self.next_free_word] |= 1u64 << bit;
                self.allocated += 1;
                let id = self.start + self.next_free_word as u32 * WORD_BITS + bit;
                debug!("project id allocate next: id={}", id);
                return Ok(id);
            }
            self.next_free_word += 1;
        }
        Err(ProjectIdError::Full)
    }

    pub fn release(&mut self, id: u32) {
        let offset = match self.offset(id) {
            Some(v) => v,
            None => {
                warn!("project id release out of range: {}", self.not_in_range(id));
                return;
            }
        };
        let (word, mask) = Self::locate(offset);
        if self.words[word] & mask == 0 {
            return;
        }
        self.words[word] &= !mask;
        self.allocated -= 1;
        if word < self.next_free_word {
            self.next_free_word = word;
        }
        debug!("project id release: id={}", id);
    }

    pub fn has(&self, id: u32) -> bool {
        match self.offset(id) {
            Some(offset) => {
                let (word, mask) = Self::locate(offset);
                self.words[word] & mask != 0
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_specific() {
        let mut alloc = ProjectIdAllocator::new(1000, 10).unwrap();
        alloc.allocate(1003).unwrap();
        assert!(alloc.has(1003));
        assert_eq!(
            alloc.allocate(1003),
            Err(ProjectIdError::AlreadyAllocated(1003))
        );
        assert!(matches!(
            alloc.allocate(999),
            Err(ProjectIdError::NotInRange { .. })
        ));
        assert!(matches!(
            alloc.allocate(1010),
            Err(ProjectIdError::NotInRange { .. })
        ));
        assert!(!alloc.has(1010));
        assert_eq!(alloc.allocated(), 1);
    }

    #[test]
    fn test_allocate_next_lowest_free() {
        let mut alloc = ProjectIdAllocator::new(1000, 200).unwrap();
        alloc.allocate(1000).unwrap();
        alloc.allocate(1002).unwrap();
        assert_eq!(alloc.allocate_next().unwrap(), 1001);
        assert_eq!(alloc.allocate_next().unwrap(), 1003);

        alloc.release(1001);
        assert_eq!(alloc.allocate_next().unwrap(), 1001);

        for expect in 1004..1200 {
            assert_eq!(alloc.allocate_next().unwrap(), expect);
        }
        assert_eq!(alloc.allocate_next(), Err(ProjectIdError::Full));
        assert_eq!(alloc.free(), 0);

        alloc.release(1130);
        assert_eq!(alloc.allocate_next().unwrap(), 1130);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut alloc = ProjectIdAllocator::new(1, 3).unwrap();
        let id = alloc.allocate_next().unwrap();
        alloc.release(id);
        alloc.release(id);
        alloc.release(100);
        assert_eq!(alloc.allocated(), 0);
        assert!(!alloc.has(id));
    }

    #[test]
    fn test_partial_last_word() {
        let mut alloc = ProjectIdAllocator::new(0, 65).unwrap();
        for expect in 0..65 {
            assert_eq!(alloc.allocate_next().unwrap(), expect);
        }
        assert_eq!(alloc.allocate_next(), Err(ProjectIdError::Full));
        assert!(matches!(
            alloc.allocate(65),
            Err(ProjectIdError::NotInRange { .. })
        ));

        let mut empty = ProjectIdAllocator::new(10, 0).unwrap();
        assert_eq!(empty.allocate_next(), Err(ProjectIdError::Full));
    }

    #[test]
    fn test_reject_range_past_u32() {
        assert_eq!(
            ProjectIdAllocator::new(u32::MAX - 10, 11).unwrap_err(),
            ProjectIdError::RangeOverflow {
                start: u32::MAX - 10,
                count: 11
            }
        );
        let err: HostPathError = ProjectIdAllocator::new(u32::MAX, 1).unwrap_err().into();
        assert!(matches!(err, HostPathError::InvalidArgument(_)));

        // the last id below u32::MAX is still usable
        let mut alloc = ProjectIdAllocator::new(u32::MAX - 10, 10).unwrap();
        for _ in 0..9 {
            alloc.allocate_next().unwrap();
        }
        assert_eq!(alloc.allocate_next().unwrap(), u32::MAX - 1);
        assert_eq!(alloc.allocate_next(), Err(ProjectIdError::Full));
    }

    #[test]
    fn test_error_mapping() {
        let err: HostPathError = ProjectIdError::Full.into();
        assert!(matches!(err, HostPathError::ResourceExhausted(_)));
        let err: HostPathError = ProjectIdError::AlreadyAllocated(7).into();
        assert!(matches!(err, HostPathError::AlreadyExists(_)));
    }
}
