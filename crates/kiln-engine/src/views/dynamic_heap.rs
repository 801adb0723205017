use std::sync::{Arc, Mutex};

use super::signature::{BindingMask, TableLayout};
use super::{PipelineStage, ShaderSignature, ViewSlotAllocator, MAX_BINDINGS};
use crate::command::CommandBuffer;
use crate::device::{Backend, DeviceError, ViewKind, ViewPageId, ViewSlot, ViewVisibility};
use crate::memory::PagePool;
use crate::sync::{lock, RetireStamp};

/// Slots per shader-visible page unless configured otherwise.
pub const DEFAULT_DYNAMIC_PAGE_CAPACITY: u32 = 1024;

/// Something that can be bound through a view table.
pub trait ShaderResource: Send + Sync {
    /// Slot holding this resource's view of `kind`, if it has one.
    fn view_slot(&self, kind: ViewKind) -> Option<ViewSlot>;
}

/// One null view per [`ViewKind`], used for unassigned table entries.
pub struct NullViews {
    slots: [ViewSlot; 3],
}

impl NullViews {
    /// Reserves the null slots. Fresh slots already hold null views.
    pub fn new(allocator: &ViewSlotAllocator) -> Result<Self, DeviceError> {
        let range = allocator.allocate(ViewKind::ALL.len() as u32)?;
        Ok(Self {
            slots: [range.slot(0), range.slot(1), range.slot(2)],
        })
    }

    #[inline]
    pub fn slot(&self, kind: ViewKind) -> ViewSlot {
        match kind {
            ViewKind::ReadOnly => self.slots[0],
            ViewKind::ReadWrite => self.slots[1],
            ViewKind::Constant => self.slots[2],
        }
    }
}

/// Shared pool of shader-visible view pages for [`DynamicViewHeap`]s.
pub struct DynamicPagePool {
    backend: Arc<dyn Backend>,
    page_capacity: u32,
    pool: Mutex<PagePool<ViewPageId>>,
}

impl DynamicPagePool {
    pub fn new(backend: Arc<dyn Backend>, page_capacity: u32) -> Self {
        assert!(page_capacity > 0, "view pages need at least one slot");
        Self {
            backend,
            page_capacity,
            pool: Mutex::new(PagePool::new()),
        }
    }

    #[inline]
    pub fn page_capacity(&self) -> u32 {
        self.page_capacity
    }

    pub fn page_count(&self) -> usize {
        lock(&self.pool).len()
    }

    pub fn available_count(&self) -> usize {
        lock(&self.pool).available_len()
    }

    pub fn retired_count(&self) -> usize {
        lock(&self.pool).retired_len()
    }

    fn request_page(&self) -> Result<(usize, ViewPageId), DeviceError> {
        let mut pool = lock(&self.pool);
        let index = pool.request(|| {
            let page = self
                .backend
                .create_view_page(self.page_capacity, ViewVisibility::ShaderVisible)?;
            log::debug!(
                "dynamic view pages: created page {page:?} ({} slots)",
                self.page_capacity
            );
            Ok(page)
        })?;
        Ok((index, *pool.get(index)))
    }

    fn release_pages(&self, indices: impl IntoIterator<Item = usize>) {
        lock(&self.pool).release(indices);
    }

    fn retire_pages(&self, indices: impl IntoIterator<Item = usize>, stamp: RetireStamp) {
        lock(&self.pool).retire(indices, stamp);
    }
}

/// Counters returned by [`DynamicViewHeap::commit_bindings`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CommitStats {
    pub tables_bound: u32,
    pub views_copied: u32,
    pub pages_requested: u32,
}

/// Staged tables of one pipeline stage.
#[derive(Default)]
struct StageCache {
    layouts: Vec<Option<TableLayout>>,
    /// Every table's entries, back to back. `None` means never assigned.
    slots: Vec<Option<ViewSlot>>,
    /// One past the highest staged entry, per binding.
    high_water: [u32; MAX_BINDINGS],
    stale: BindingMask,
}

impl StageCache {
    fn layout(&self, binding: u32) -> Option<&TableLayout> {
        self.layouts.get(binding as usize).and_then(Option::as_ref)
    }

    /// Views a commit of the stale bindings would copy.
    fn pending(&self) -> u32 {
        self.stale
            .iter()
            .map(|binding| self.high_water[binding as usize])
            .sum()
    }

    /// Marks every binding that has staged views.
    fn mark_all_assigned(&mut self) {
        for (binding, &count) in self.high_water.iter().enumerate() {
            if count > 0 {
                self.stale.set(binding as u32);
            }
        }
    }

    fn reset(&mut self) {
        self.slots.fill(None);
        self.high_water = [0; MAX_BINDINGS];
        self.stale.clear();
    }
}

/// Per-context, per-frame view tables.
///
/// Views are staged into a CPU-side cache per binding. [`commit_bindings`] copies
/// only the tables that changed into the current shader-visible page and records
/// the bind commands. Pages come from a shared [`DynamicPagePool`] and go back to
/// it in bulk on [`free`] / [`free_after`].
///
/// All tables committed together land on the same page. When they do not fit in
/// what is left of it, the heap moves to a fresh page and re-commits every
/// assigned table there.
///
/// [`commit_bindings`]: DynamicViewHeap::commit_bindings
/// [`free`]: DynamicViewHeap::free
/// [`free_after`]: DynamicViewHeap::free_after
pub struct DynamicViewHeap {
    pool: Arc<DynamicPagePool>,
    nulls: Arc<NullViews>,
    stages: [StageCache; PipelineStage::COUNT],
    /// Resources referenced by staged tables since they were last handed to a
    /// command buffer; dropped on free.
    retained: Vec<Arc<dyn ShaderResource>>,
    current: Option<(usize, ViewPageId)>,
    cursor: u32,
    /// Pages filled since the last free, excluding `current`.
    used: Vec<usize>,
}

impl DynamicViewHeap {
    pub fn new(pool: Arc<DynamicPagePool>, nulls: Arc<NullViews>) -> Self {
        Self {
            pool,
            nulls,
            stages: Default::default(),
            retained: Vec::new(),
            current: None,
            cursor: 0,
            used: Vec::new(),
        }
    }

    /// Installs the binding layout for `stage`, dropping everything staged for it.
    pub fn set_signature(&mut self, stage: PipelineStage, signature: &ShaderSignature) {
        let (layouts, total) = TableLayout::for_signature(signature);
        let cache = &mut self.stages[stage.index()];
        cache.layouts = layouts;
        cache.slots = vec![None; total as usize];
        cache.high_water = [0; MAX_BINDINGS];
        cache.stale.clear();
    }

    /// Stages `resources` into table `binding` of `stage`, starting at `offset`.
    ///
    /// Each resource contributes its view of the kind the table expects at that
    /// position, or a null view when it has none. The binding is marked stale only
    /// when the staged slots differ from what is cached.
    ///
    /// # Panics
    /// Panics if `binding` is not a table of the current signature or the range
    /// runs past the table or past one page.
    pub fn stage_view_bindings(
        &mut self,
        stage: PipelineStage,
        binding: u32,
        offset: u32,
        resources: &[Arc<dyn ShaderResource>],
    ) {
        assert!(
            (binding as usize) < MAX_BINDINGS,
            "binding index {binding} exceeds {MAX_BINDINGS}"
        );
        let page_capacity = self.pool.page_capacity;
        let cache = &mut self.stages[stage.index()];
        let Some(layout) = cache.layouts.get(binding as usize).and_then(Option::as_ref) else {
            panic!("binding {binding} is not a view table in the current {stage:?} signature");
        };
        let count = resources.len() as u32;
        assert!(
            offset + count <= layout.size,
            "staging {count} views at offset {offset} overflows a {}-view table",
            layout.size
        );
        assert!(
            offset + count <= page_capacity,
            "staging {count} views at offset {offset} exceeds page capacity of {page_capacity}"
        );

        let start = (layout.start + offset) as usize;
        let mut changed = false;
        for (i, resource) in resources.iter().enumerate() {
            let kind = layout
                .kind_at(offset + i as u32)
                .unwrap_or(ViewKind::ReadOnly);
            let slot = resource
                .view_slot(kind)
                .unwrap_or_else(|| self.nulls.slot(kind));
            let entry = &mut cache.slots[start + i];
            if *entry != Some(slot) {
                *entry = Some(slot);
                changed = true;
            }
        }

        let high_water = &mut cache.high_water[binding as usize];
        *high_water = (*high_water).max(offset + count);

        if changed {
            cache.stale.set(binding);
            self.retained.extend(resources.iter().cloned());
        }
    }

    /// Copies every stale table of `stage` into the current page and records its
    /// bind command into `cmd`.
    ///
    /// # Panics
    /// Panics if the stale tables together need more than one page.
    pub fn commit_bindings(
        &mut self,
        stage: PipelineStage,
        cmd: &mut CommandBuffer,
    ) -> Result<CommitStats, DeviceError> {
        let mut stats = CommitStats::default();
        let page_capacity = self.pool.page_capacity;

        let mut pending = self.stages[stage.index()].pending();
        if pending == 0 {
            self.stages[stage.index()].stale.clear();
            return Ok(stats);
        }
        assert!(
            pending <= page_capacity,
            "{pending} pending views exceed page capacity of {page_capacity}"
        );

        if self.current.is_none() || self.cursor + pending > page_capacity {
            let had_page = self.current.is_some();
            self.next_page()?;
            stats.pages_requested += 1;
            if had_page {
                // Tables bound on the previous page are re-committed next to the
                // stale ones.
                let cache = &mut self.stages[stage.index()];
                cache.mark_all_assigned();
                pending = cache.pending();
                assert!(
                    pending <= page_capacity,
                    "{pending} assigned views exceed page capacity of {page_capacity}"
                );
            }
        }
        let Some((_, page)) = self.current else {
            unreachable!("current page set above");
        };

        let views = self.pool.backend.view_pages();
        let cache = &mut self.stages[stage.index()];
        let mut sources = Vec::new();
        for binding in cache.stale.iter() {
            let count = cache.high_water[binding as usize];
            let Some(layout) = cache.layout(binding) else {
                continue;
            };
            if count == 0 {
                continue;
            }

            sources.clear();
            let start = layout.start as usize;
            sources.extend((0..count).map(|i| {
                cache.slots[start + i as usize].unwrap_or_else(|| {
                    self.nulls
                        .slot(layout.kind_at(i).unwrap_or(ViewKind::ReadOnly))
                })
            }));

            let dst = ViewSlot::new(page, self.cursor);
            views.copy(dst, &sources);
            cmd.bind_view_table(stage, binding, dst, count);
            self.cursor += count;
            stats.tables_bound += 1;
            stats.views_copied += count;
        }
        cache.stale.clear();

        log::trace!(
            "{stage:?} commit: {} tables, {} views, cursor {}",
            stats.tables_bound,
            stats.views_copied,
            self.cursor
        );
        Ok(stats)
    }

    /// Moves the references held for staged tables into `cmd`, so they live until
    /// its batch has executed rather than until the next free.
    pub fn retain_into(&mut self, cmd: &mut CommandBuffer) {
        if self.retained.is_empty() {
            return;
        }
        let retained = std::mem::take(&mut self.retained);
        cmd.retain(Arc::new(retained));
    }

    fn next_page(&mut self) -> Result<(), DeviceError> {
        if let Some((index, _)) = self.current.take() {
            self.used.push(index);
        }
        let page = self
            .pool
            .request_page()
            .inspect_err(|err| log::error!("dynamic view heap: page request failed: {err}"))?;
        self.current = Some(page);
        self.cursor = 0;
        Ok(())
    }

    /// Returns every page used since the last free and drops all staged state.
    ///
    /// The caller guarantees the GPU has finished with the recorded tables.
    /// Signatures stay installed.
    pub fn free(&mut self) {
        let pages = self.take_pages();
        self.pool.release_pages(pages);
    }

    /// Like [`DynamicViewHeap::free`], but the pages are only reused once `stamp`
    /// completes.
    ///
    /// Resources still held by the heap are dropped here; pass them to the
    /// submitted buffer with [`DynamicViewHeap::retain_into`] first.
    pub fn free_after(&mut self, stamp: RetireStamp) {
        let pages = self.take_pages();
        self.pool.retire_pages(pages, stamp);
    }

    fn take_pages(&mut self) -> Vec<usize> {
        let mut pages = std::mem::take(&mut self.used);
        if let Some((index, _)) = self.current.take() {
            pages.push(index);
        }
        self.cursor = 0;
        self.retained.clear();
        for cache in &mut self.stages {
            cache.reset();
        }
        pages
    }

    /// Next free slot on the current page.
    #[inline]
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn current_page(&self) -> Option<ViewPageId> {
        self.current.map(|(_, page)| page)
    }

    pub fn pages_in_use(&self) -> usize {
        self.used.len() + usize::from(self.current.is_some())
    }

    pub fn is_stale(&self, stage: PipelineStage, binding: u32) -> bool {
        self.stages[stage.index()].stale.contains(binding)
    }

    /// Bitmask of stale bindings of `stage`.
    pub fn stale_bits(&self, stage: PipelineStage) -> u32 {
        self.stages[stage.index()].stale.bits()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::device::{GpuAddress, QueueKind, SoftDevice, ViewDesc};
    use crate::views::ViewRange;

    struct Fixture {
        device: Arc<SoftDevice>,
        statics: ViewSlotAllocator,
        heap: DynamicViewHeap,
        cmd: CommandBuffer,
    }

    fn fixture(page_capacity: u32) -> Fixture {
        let device = Arc::new(SoftDevice::default());
        let statics = ViewSlotAllocator::new(device.clone(), 64);
        let nulls = Arc::new(NullViews::new(&statics).unwrap());
        let pool = Arc::new(DynamicPagePool::new(device.clone(), page_capacity));
        Fixture {
            device,
            statics,
            heap: DynamicViewHeap::new(pool, nulls),
            cmd: CommandBuffer::new(QueueKind::Graphics, 0),
        }
    }

    struct Texture {
        read: ViewSlot,
    }

    impl ShaderResource for Texture {
        fn view_slot(&self, kind: ViewKind) -> Option<ViewSlot> {
            (kind == ViewKind::ReadOnly).then_some(self.read)
        }
    }

    fn texture(f: &Fixture, address: u64) -> Arc<dyn ShaderResource> {
        let slot = f.statics.allocate(1).unwrap().first();
        f.statics.write(slot, read_only(address));
        Arc::new(Texture { read: slot })
    }

    fn read_only(address: u64) -> ViewDesc {
        ViewDesc::ReadOnly {
            address: GpuAddress(address),
            size: 256,
            stride: 4,
        }
    }

    fn textures_signature(count: u32) -> ShaderSignature {
        ShaderSignature::new()
            .with_inline()
            .with_table([ViewRange::new(ViewKind::ReadOnly, count)])
    }

    // ── staging & commit ──────────────────────────────────────────────────

    #[test]
    fn commit_copies_staged_views_and_binds_table() {
        let mut f = fixture(16);
        f.heap.set_signature(PipelineStage::Graphics, &textures_signature(4));
        let res = [texture(&f, 0x1000), texture(&f, 0x2000)];

        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 0, &res);
        assert!(f.heap.is_stale(PipelineStage::Graphics, 1));

        let stats = f.heap.commit_bindings(PipelineStage::Graphics, &mut f.cmd).unwrap();
        assert_eq!(
            stats,
            CommitStats { tables_bound: 1, views_copied: 2, pages_requested: 1 }
        );
        assert_eq!(f.heap.stale_bits(PipelineStage::Graphics), 0);
        assert_eq!(f.heap.cursor(), 2);

        let page = f.heap.current_page().unwrap();
        let Command::BindViewTable { binding, first, count, .. } = &f.cmd.commands()[0] else {
            panic!("expected a table bind");
        };
        assert_eq!((*binding, *first, *count), (1, ViewSlot::new(page, 0), 2));
        assert_eq!(
            f.device.view_pages().read_range(*first, 2).unwrap(),
            vec![read_only(0x1000), read_only(0x2000)]
        );
    }

    #[test]
    fn identical_bindings_copy_nothing_on_second_commit() {
        let mut f = fixture(16);
        f.heap.set_signature(PipelineStage::Graphics, &textures_signature(4));
        let res = [texture(&f, 0x1000)];

        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 0, &res);
        f.heap.commit_bindings(PipelineStage::Graphics, &mut f.cmd).unwrap();
        f.cmd.draw(3, 1);

        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 0, &res);
        assert!(!f.heap.is_stale(PipelineStage::Graphics, 1));
        let stats = f.heap.commit_bindings(PipelineStage::Graphics, &mut f.cmd).unwrap();
        assert_eq!(stats.views_copied, 0);
        assert_eq!(stats.tables_bound, 0);
        assert_eq!(f.heap.cursor(), 1);
    }

    #[test]
    fn only_changed_tables_are_recommitted() {
        let mut f = fixture(32);
        let sig = ShaderSignature::new()
            .with_table([ViewRange::new(ViewKind::ReadOnly, 2)])
            .with_table([ViewRange::new(ViewKind::ReadOnly, 2)]);
        f.heap.set_signature(PipelineStage::Compute, &sig);
        let (a, b) = (texture(&f, 0x1000), texture(&f, 0x2000));

        f.heap.stage_view_bindings(PipelineStage::Compute, 0, 0, &[a.clone()]);
        f.heap.stage_view_bindings(PipelineStage::Compute, 1, 0, &[a.clone()]);
        let first = f.heap.commit_bindings(PipelineStage::Compute, &mut f.cmd).unwrap();
        assert_eq!(first.tables_bound, 2);

        f.heap.stage_view_bindings(PipelineStage::Compute, 1, 0, &[b]);
        assert_eq!(f.heap.stale_bits(PipelineStage::Compute), 0b10);
        let second = f.heap.commit_bindings(PipelineStage::Compute, &mut f.cmd).unwrap();
        assert_eq!(second.tables_bound, 1);
        assert_eq!(second.views_copied, 1);
    }

    #[test]
    fn gaps_and_missing_kinds_become_null_views() {
        let mut f = fixture(16);
        let sig = ShaderSignature::new().with_table([
            ViewRange::new(ViewKind::ReadOnly, 2),
            ViewRange::new(ViewKind::ReadWrite, 2),
        ]);
        f.heap.set_signature(PipelineStage::Compute, &sig);
        let tex = texture(&f, 0x3000);

        // Offset 1 leaves entry 0 unassigned; entry 2 expects a read-write view.
        f.heap
            .stage_view_bindings(PipelineStage::Compute, 0, 1, &[tex.clone(), tex]);
        f.heap.commit_bindings(PipelineStage::Compute, &mut f.cmd).unwrap();

        let page = f.heap.current_page().unwrap();
        assert_eq!(
            f.device.view_pages().read_range(ViewSlot::new(page, 0), 3).unwrap(),
            vec![ViewDesc::Null, read_only(0x3000), ViewDesc::Null]
        );
    }

    #[test]
    fn stages_track_separate_signatures() {
        let mut f = fixture(16);
        f.heap.set_signature(PipelineStage::Graphics, &textures_signature(2));
        f.heap.set_signature(PipelineStage::Compute, &textures_signature(2));
        let tex = texture(&f, 0x1000);

        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 0, &[tex]);
        assert!(f.heap.is_stale(PipelineStage::Graphics, 1));
        assert!(!f.heap.is_stale(PipelineStage::Compute, 1));
    }

    #[test]
    fn set_signature_clears_staged_state() {
        let mut f = fixture(16);
        f.heap.set_signature(PipelineStage::Graphics, &textures_signature(2));
        let tex = texture(&f, 0x1000);
        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 0, &[tex]);

        f.heap.set_signature(PipelineStage::Graphics, &textures_signature(2));
        assert_eq!(f.heap.stale_bits(PipelineStage::Graphics), 0);
        let stats = f.heap.commit_bindings(PipelineStage::Graphics, &mut f.cmd).unwrap();
        assert_eq!(stats, CommitStats::default());
    }

    // ── capacity ──────────────────────────────────────────────────────────

    #[test]
    #[should_panic(expected = "exceeds page capacity of 256")]
    fn staging_more_than_a_page_panics() {
        let mut f = fixture(256);
        f.heap.set_signature(PipelineStage::Graphics, &textures_signature(300));
        let tex = texture(&f, 0x1000);
        let res = vec![tex; 300];
        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 0, &res);
    }

    #[test]
    #[should_panic(expected = "overflows a 2-view table")]
    fn staging_past_table_end_panics() {
        let mut f = fixture(16);
        f.heap.set_signature(PipelineStage::Graphics, &textures_signature(2));
        let tex = texture(&f, 0x1000);
        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 1, &[tex.clone(), tex]);
    }

    #[test]
    #[should_panic(expected = "is not a view table")]
    fn staging_into_inline_binding_panics() {
        let mut f = fixture(16);
        f.heap.set_signature(PipelineStage::Graphics, &textures_signature(2));
        let tex = texture(&f, 0x1000);
        f.heap.stage_view_bindings(PipelineStage::Graphics, 0, 0, &[tex]);
    }

    #[test]
    fn full_page_moves_every_assigned_table_to_fresh_page() {
        let mut f = fixture(8);
        let sig = ShaderSignature::new()
            .with_table([ViewRange::new(ViewKind::ReadOnly, 3)])
            .with_table([ViewRange::new(ViewKind::ReadOnly, 3)]);
        f.heap.set_signature(PipelineStage::Compute, &sig);
        let (a, b) = (texture(&f, 0x1000), texture(&f, 0x2000));
        let three_a = [a.clone(), a.clone(), a];
        let three_b = [b.clone(), b.clone(), b];

        f.heap.stage_view_bindings(PipelineStage::Compute, 0, 0, &three_a);
        f.heap.stage_view_bindings(PipelineStage::Compute, 1, 0, &three_a);
        f.heap.commit_bindings(PipelineStage::Compute, &mut f.cmd).unwrap();
        let first_page = f.heap.current_page().unwrap();
        assert_eq!(f.heap.cursor(), 6);

        f.heap.stage_view_bindings(PipelineStage::Compute, 1, 0, &three_b);
        let stats = f.heap.commit_bindings(PipelineStage::Compute, &mut f.cmd).unwrap();
        assert_eq!(stats.pages_requested, 1);
        assert_eq!(stats.tables_bound, 2);
        assert_ne!(f.heap.current_page().unwrap(), first_page);
        assert_eq!(f.heap.cursor(), 6);
        assert_eq!(f.heap.pages_in_use(), 2);
    }

    // ── reset ─────────────────────────────────────────────────────────────

    #[test]
    fn free_restarts_from_cursor_zero_with_clean_mask() {
        let mut f = fixture(16);
        f.heap.set_signature(PipelineStage::Graphics, &textures_signature(4));
        let tex = texture(&f, 0x1000);
        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 0, &[tex.clone()]);
        f.heap.commit_bindings(PipelineStage::Graphics, &mut f.cmd).unwrap();
        let page = f.heap.current_page();
        assert_eq!(f.heap.retained_count(), 1);

        f.heap.free();
        assert_eq!(f.heap.cursor(), 0);
        assert_eq!(f.heap.stale_bits(PipelineStage::Graphics), 0);
        assert_eq!(f.heap.retained_count(), 0);

        // Same resource again counts as a change after a free.
        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 0, &[tex]);
        let stats = f.heap.commit_bindings(PipelineStage::Graphics, &mut f.cmd).unwrap();
        assert_eq!(stats.views_copied, 1);
        assert_eq!(f.heap.current_page(), page);
        assert_eq!(f.heap.cursor(), 1);
    }

    #[test]
    fn retained_resources_live_until_free() {
        let mut f = fixture(16);
        f.heap.set_signature(PipelineStage::Graphics, &textures_signature(1));
        let tex = texture(&f, 0x1000);
        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 0, &[tex.clone()]);
        assert_eq!(Arc::strong_count(&tex), 2);
        f.heap.free();
        assert_eq!(Arc::strong_count(&tex), 1);
    }

    #[test]
    fn retain_into_hands_references_to_command_buffer() {
        let mut f = fixture(16);
        f.heap.set_signature(PipelineStage::Graphics, &textures_signature(2));
        let a = texture(&f, 0x1000);
        let b = texture(&f, 0x2000);
        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 0, &[a.clone(), b.clone()]);
        f.heap.commit_bindings(PipelineStage::Graphics, &mut f.cmd).unwrap();

        f.heap.retain_into(&mut f.cmd);
        assert_eq!(f.heap.retained_count(), 0);
        assert_eq!(f.cmd.retained_count(), 1);

        f.heap.free();
        assert_eq!(Arc::strong_count(&a), 2);
        assert_eq!(f.cmd.release_retained(), 1);
        assert_eq!(Arc::strong_count(&a), 1);
        assert_eq!(Arc::strong_count(&b), 1);

        f.heap.retain_into(&mut f.cmd);
        assert_eq!(f.cmd.retained_count(), 0);
    }

    #[test]
    fn free_after_waits_for_stamp_before_reuse() {
        let mut f = fixture(16);
        f.heap.set_signature(PipelineStage::Graphics, &textures_signature(1));
        let tex = texture(&f, 0x1000);
        let fence = Arc::new(crate::sync::Fence::new("test", 0));

        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 0, &[tex.clone()]);
        f.heap.commit_bindings(PipelineStage::Graphics, &mut f.cmd).unwrap();
        let first = f.heap.current_page();
        f.heap.free_after(RetireStamp::new(fence.clone(), 1));

        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 0, &[tex.clone()]);
        f.heap.commit_bindings(PipelineStage::Graphics, &mut f.cmd).unwrap();
        assert_ne!(f.heap.current_page(), first);
        f.heap.free();

        fence.signal(1);
        f.heap.stage_view_bindings(PipelineStage::Graphics, 1, 0, &[tex]);
        f.heap.commit_bindings(PipelineStage::Graphics, &mut f.cmd).unwrap();
        assert_eq!(f.heap.pages_in_use(), 1);
        assert_eq!(f.heap.pool.page_count(), 2);
    }
}
