use std::collections::VecDeque;

use crate::device::DeviceError;
use crate::sync::RetireStamp;

/// Arena of pooled pages addressed by index.
///
/// Pages are created on demand and never dropped before the pool. An index is
/// either in use by some allocator, parked in `available`, or parked in `retired`
/// until its stamp completes.
pub(crate) struct PagePool<P> {
    pages: Vec<P>,
    available: VecDeque<usize>,
    retired: VecDeque<(RetireStamp, usize)>,
}

impl<P> PagePool<P> {
    pub(crate) fn new() -> Self {
        Self {
            pages: Vec::new(),
            available: VecDeque::new(),
            retired: VecDeque::new(),
        }
    }

    /// Returns a reusable page index, creating a page with `create` if none is free.
    pub(crate) fn request(
        &mut self,
        create: impl FnOnce() -> Result<P, DeviceError>,
    ) -> Result<usize, DeviceError> {
        self.promote_retired();
        if let Some(index) = self.available.pop_front() {
            return Ok(index);
        }

        self.pages.push(create()?);
        Ok(self.pages.len() - 1)
    }

    /// Makes pages available again immediately.
    ///
    /// The caller guarantees the GPU no longer reads them.
    pub(crate) fn release(&mut self, indices: impl IntoIterator<Item = usize>) {
        self.available.extend(indices);
    }

    /// Parks pages until `stamp` completes.
    pub(crate) fn retire(&mut self, indices: impl IntoIterator<Item = usize>, stamp: RetireStamp) {
        self.retired
            .extend(indices.into_iter().map(|index| (stamp.clone(), index)));
    }

    /// Moves every retired page whose stamp has completed to `available`.
    ///
    /// Stamps may come from different queues, so every entry is checked rather
    /// than only the oldest.
    fn promote_retired(&mut self) {
        let mut i = 0;
        while i < self.retired.len() {
            if self.retired[i].0.is_complete() {
                if let Some((_, index)) = self.retired.remove(i) {
                    self.available.push_back(index);
                }
            } else {
                i += 1;
            }
        }
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> &P {
        &self.pages[index]
    }

    /// Total pages ever created.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub(crate) fn available_len(&self) -> usize {
        self.available.len()
    }

    #[inline]
    pub(crate) fn retired_len(&self) -> usize {
        self.retired.len()
    }
}
