/// Viewport anchoring for a scrollable message list
use serde::Serialize;

/// How a window update should move the view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// New selection; jump to the newest message
    Reset,
    /// Older messages prepended; keep the visible content still
    TopInsert,
    /// Newer messages appended; follow them if the user was at the bottom
    BottomInsert,
}

/// The parts of a scroll container the anchor needs
pub trait ScrollContainer {
    /// Total content height
    fn scroll_height(&self) -> f64;
    /// Current offset from the top
    fn scroll_top(&self) -> f64;
    /// Visible height
    fn client_height(&self) -> f64;
    fn set_scroll_top(&mut self, offset: f64);
}

/// Offset that keeps previously visible content stationary after a prepend
pub fn restored_offset(old_height: f64, new_height: f64, previous_offset: f64) -> f64 {
    (new_height - old_height + previous_offset).max(0.0)
}

/// Measurements taken just before a prepend is applied
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorSnapshot {
    pub height: f64,
    pub offset: f64,
}

/// Keeps the reader's place when history is prepended.
///
/// `capture` must run before the new content is laid out and `restore` after
/// layout has been recomputed; restoring earlier reads the old height.
#[derive(Debug, Default)]
pub struct ViewportAnchor {
    pending: Option<AnchorSnapshot>,
}

impl ViewportAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture<C: ScrollContainer + ?Sized>(&mut self, container: &C) -> AnchorSnapshot {
        let snapshot = AnchorSnapshot {
            height: container.scroll_height(),
            offset: container.scroll_top(),
        };
        self.pending = Some(snapshot);
        snapshot
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Apply the pending snapshot, if any. Returns the offset that was set.
    pub fn restore<C: ScrollContainer + ?Sized>(&mut self, container: &mut C) -> Option<f64> {
        let snapshot = self.pending.take()?;
        let offset = restored_offset(snapshot.height, container.scroll_height(), snapshot.offset);
        container.set_scroll_top(offset);
        Some(offset)
    }

    /// Drop a pending snapshot, e.g. when the conversation changed before layout
    pub fn discard(&mut self) {
        self.pending = None;
    }
}

pub fn is_near_bottom<C: ScrollContainer + ?Sized>(container: &C, threshold: f64) -> bool {
    container.scroll_height() - container.scroll_top() - container.client_height() <= threshold
}

pub fn scroll_to_bottom<C: ScrollContainer + ?Sized>(container: &mut C) {
    let bottom = (container.scroll_height() - container.client_height()).max(0.0);
    container.set_scroll_top(bottom);
}

/// Scroll decision for an update that has already been laid out.
///
/// Top inserts restore the anchor; bottom inserts follow only when the view
/// was near the bottom before the update (`was_near_bottom`).
pub fn apply_update<C: ScrollContainer + ?Sized>(
    anchor: &mut ViewportAnchor,
    container: &mut C,
    kind: UpdateKind,
    was_near_bottom: bool,
) {
    match kind {
        UpdateKind::TopInsert => {
            anchor.restore(container);
        }
        UpdateKind::Reset => {
            anchor.discard();
            scroll_to_bottom(container);
        }
        UpdateKind::BottomInsert => {
            if was_near_bottom {
                scroll_to_bottom(container);
            }
        }
    }
}
