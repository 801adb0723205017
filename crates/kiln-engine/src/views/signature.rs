use crate::device::ViewKind;

/// Number of binding indices a signature may declare.
///
/// Tied to the width of the per-stage stale bitmask (`u32`).
pub const MAX_BINDINGS: usize = 32;

/// Pipeline a binding layout applies to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PipelineStage {
    Graphics,
    Compute,
}

impl PipelineStage {
    pub const COUNT: usize = 2;
    pub const ALL: [PipelineStage; PipelineStage::COUNT] =
        [PipelineStage::Graphics, PipelineStage::Compute];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            PipelineStage::Graphics => 0,
            PipelineStage::Compute => 1,
        }
    }
}

/// Run of `count` views of one kind inside a table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ViewRange {
    pub kind: ViewKind,
    pub count: u32,
}

impl ViewRange {
    #[inline]
    pub const fn new(kind: ViewKind, count: u32) -> Self {
        Self { kind, count }
    }
}

/// One binding index of a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingParam {
    /// Table of views; the ranges are laid out back to back.
    Table(Vec<ViewRange>),
    /// Bound directly by the caller (inline constants, single views). The dynamic
    /// heap ignores it.
    Inline,
}

/// Binding layout of a pipeline: one parameter per binding index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderSignature {
    params: Vec<BindingParam>,
}

impl ShaderSignature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a table parameter at the next binding index.
    pub fn with_table(mut self, ranges: impl Into<Vec<ViewRange>>) -> Self {
        self.push(BindingParam::Table(ranges.into()));
        self
    }

    /// Appends a parameter the heap does not manage.
    pub fn with_inline(mut self) -> Self {
        self.push(BindingParam::Inline);
        self
    }

    fn push(&mut self, param: BindingParam) {
        assert!(
            self.params.len() < MAX_BINDINGS,
            "signatures are limited to {MAX_BINDINGS} binding indices"
        );
        self.params.push(param);
    }

    #[inline]
    pub fn params(&self) -> &[BindingParam] {
        &self.params
    }

    /// Bit `i` is set when binding `i` is a table.
    pub fn table_mask(&self) -> u32 {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p, BindingParam::Table(_)))
            .fold(0, |mask, (i, _)| mask | (1 << i))
    }
}

/// Placement of one table inside a stage's staging cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableLayout {
    /// First cache entry of the table.
    pub start: u32,
    /// Number of views the table declares.
    pub size: u32,
    ranges: Vec<ViewRange>,
}

impl TableLayout {
    /// Lays out every table of `signature` back to back.
    ///
    /// Returns the per-binding layouts and the total number of cache entries.
    pub(crate) fn for_signature(
        signature: &ShaderSignature,
    ) -> (Vec<Option<TableLayout>>, u32) {
        let mut start = 0u32;
        let layouts = signature
            .params()
            .iter()
            .map(|param| match param {
                BindingParam::Table(ranges) => {
                    let size = ranges.iter().map(|r| r.count).sum();
                    let layout = TableLayout {
                        start,
                        size,
                        ranges: ranges.clone(),
                    };
                    start += size;
                    Some(layout)
                }
                BindingParam::Inline => None,
            })
            .collect();
        (layouts, start)
    }

    /// View kind expected at `offset` within the table.
    pub(crate) fn kind_at(&self, offset: u32) -> Option<ViewKind> {
        let mut end = 0;
        for range in &self.ranges {
            end += range.count;
            if offset < end {
                return Some(range.kind);
            }
        }
        None
    }
}

/// One bit per binding index.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub(crate) struct BindingMask(u32);

impl BindingMask {
    #[inline]
    pub(crate) fn set(&mut self, binding: u32) {
        self.0 |= 1 << binding;
    }

    #[inline]
    pub(crate) fn contains(self, binding: u32) -> bool {
        self.0 & (1 << binding) != 0
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.0 = 0;
    }

    #[inline]
    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub(crate) fn bits(self) -> u32 {
        self.0
    }

    /// Set binding indices, ascending.
    pub(crate) fn iter(self) -> impl Iterator<Item = u32> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let i = bits.trailing_zeros();
            bits &= bits - 1;
            Some(i)
        })
    }
}
