/// Message stream controller: keeps one conversation's window loaded and ordered
///
/// Every async result is tagged with the selection generation it was issued
/// under. A result is applied only if that generation is still current, and
/// the check happens under the same write lock as the mutation, so a
/// superseded fetch can never touch the window of a newer selection.
use crate::config::Config;
use crate::error::Result;
use crate::message_types::Message;
use crate::source::{LoadPurpose, LoadRequest, MessageSource};
use crate::utils::event_emitter::{EventEmitter, WindowEvent};
use crate::viewport::UpdateKind;
use crate::window::ConversationWindow;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of the current selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing selected
    Idle,
    /// Phase 1 in flight
    InitialLoading,
    /// Window populated; older pages and live messages may be merged
    Ready,
    /// Phase 1 failed; `retry()` re-issues it
    Failed,
}

/// Result of a load operation that did not raise an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The page was merged; `added` counts previously unseen ids
    Loaded { added: usize },
    /// The fetch returned no messages
    Empty,
    /// Older history already came back empty for this selection
    Exhausted,
    /// Not started: nothing selected, window empty, or a load of the same kind in flight
    Skipped,
    /// Superseded by a newer selection; the result was dropped
    Cancelled,
    /// Background fetch failed; logged and dropped
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct Paging {
    initial: usize,
    backfill: usize,
    backfill_threshold: usize,
    older: usize,
}

struct Selection {
    generation: u64,
    state: StreamState,
    window: Option<ConversationWindow>,
    loading_older: bool,
    backfilling: bool,
    exhausted: bool,
}

impl Selection {
    fn idle() -> Self {
        Self {
            generation: 0,
            state: StreamState::Idle,
            window: None,
            loading_older: false,
            backfilling: false,
            exhausted: false,
        }
    }

    /// Move to a new generation; anything issued under the old one becomes stale
    fn reset(&mut self, state: StreamState, window: Option<ConversationWindow>) -> u64 {
        self.generation += 1;
        self.state = state;
        self.window = window;
        self.loading_older = false;
        self.backfilling = false;
        self.exhausted = false;
        self.generation
    }
}

/// Controller for the message pane of the selected conversation
#[derive(Clone)]
pub struct MessageStreamController {
    source: Arc<dyn MessageSource>,
    paging: Paging,
    emitter: EventEmitter,
    selection: Arc<RwLock<Selection>>,
    backfill_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MessageStreamController {
    pub fn new(source: Arc<dyn MessageSource>, config: &Config, emitter: EventEmitter) -> Self {
        Self {
            source,
            paging: Paging {
                initial: config.initial_page_size,
                backfill: config.backfill_page_size,
                backfill_threshold: config.backfill_threshold,
                older: config.older_page_size,
            },
            emitter,
            selection: Arc::new(RwLock::new(Selection::idle())),
            backfill_task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Select a conversation: drop the old window, load the newest page,
    /// then backfill in the background if the page suggests more history.
    ///
    /// Phase-1 failures are returned; a superseded load returns `Cancelled`.
    pub async fn select_conversation(&self, conversation_id: i64) -> Result<LoadOutcome> {
        let generation = self.selection.write().await.reset(
            StreamState::InitialLoading,
            Some(ConversationWindow::new(conversation_id)),
        );
        info!("Selected conversation {} (generation {})", conversation_id, generation);
        self.load_initial(generation, conversation_id).await
    }

    /// Phase 1 for `generation`, then the optional background backfill
    async fn load_initial(&self, generation: u64, conversation_id: i64) -> Result<LoadOutcome> {
        let request = LoadRequest::initial(conversation_id, self.paging.initial);
        let result = self.source.fetch_messages(&request).await;

        let mut selection = self.selection.write().await;
        if selection.generation != generation {
            debug!("Discarding initial page for {} (selection changed)", conversation_id);
            return Ok(LoadOutcome::Cancelled);
        }

        let batch = match result {
            Ok(batch) => batch,
            Err(e) => {
                selection.state = StreamState::Failed;
                warn!("Failed to load conversation {}: {}", conversation_id, e);
                self.emitter.emit(WindowEvent::LoadFailed {
                    conversation_id,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let Some(window) = selection.window.as_mut() else {
            return Ok(LoadOutcome::Cancelled);
        };
        let ids = window.merge_new_ids(&batch);
        let added = ids.len();
        let len = window.len();
        let cursor = window.oldest_id();
        selection.state = StreamState::Ready;

        self.emitter.emit(WindowEvent::Updated {
            conversation_id,
            kind: UpdateKind::Reset,
            added,
            ids,
            len,
        });
        debug!("Initial page for {}: {} fetched, {} in window", conversation_id, batch.len(), len);

        if batch.len() >= self.paging.backfill_threshold {
            if let Some(cursor) = cursor {
                selection.backfilling = true;
                drop(selection);
                self.spawn_backfill(generation, conversation_id, cursor).await;
            }
        }

        Ok(if batch.is_empty() {
            LoadOutcome::Empty
        } else {
            LoadOutcome::Loaded { added }
        })
    }

    async fn spawn_backfill(&self, generation: u64, conversation_id: i64, cursor: i64) {
        let controller = self.clone();
        let handle = tokio::spawn(async move {
            controller.run_backfill(generation, conversation_id, cursor).await;
        });
        *self.backfill_task.lock().await = Some(handle);
    }

    async fn run_backfill(&self, generation: u64, conversation_id: i64, cursor: i64) {
        let request = LoadRequest::older_than(
            conversation_id,
            cursor,
            self.paging.backfill,
            LoadPurpose::Backfill,
        );
        let result = self.source.fetch_messages(&request).await;

        let mut selection = self.selection.write().await;
        if selection.generation != generation {
            debug!("Discarding backfill for {} (selection changed)", conversation_id);
            return;
        }
        selection.backfilling = false;

        match result {
            Ok(batch) if batch.is_empty() => {
                selection.exhausted = true;
                debug!("Backfill for {} found no older history", conversation_id);
            }
            Ok(batch) => {
                if let Some(window) = selection.window.as_mut() {
                    let ids = window.merge_new_ids(&batch);
                    let added = ids.len();
                    let len = window.len();
                    if added > 0 {
                        self.emitter.emit(WindowEvent::Updated {
                            conversation_id,
                            kind: UpdateKind::TopInsert,
                            added,
                            ids,
                            len,
                        });
                    }
                    debug!("Backfill for {} added {} messages", conversation_id, added);
                }
            }
            Err(e) => warn!("Backfill for {} failed: {}", conversation_id, e),
        }
    }

    /// Wait for the background backfill of the current selection, if one was spawned
    pub async fn wait_for_backfill(&self) {
        let handle = self.backfill_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Fetch the page before the oldest held message. Failures are logged and
    /// reported as `Failed`; re-entrant calls while one is in flight are skipped.
    pub async fn load_older(&self) -> LoadOutcome {
        let (generation, conversation_id, cursor) = {
            let mut selection = self.selection.write().await;
            if selection.state != StreamState::Ready {
                return LoadOutcome::Skipped;
            }
            let Some((conversation_id, cursor)) = selection
                .window
                .as_ref()
                .and_then(|w| w.oldest_id().map(|oldest| (w.conversation_id(), oldest)))
            else {
                return LoadOutcome::Skipped;
            };
            if selection.loading_older {
                return LoadOutcome::Skipped;
            }
            if selection.exhausted {
                return LoadOutcome::Exhausted;
            }
            selection.loading_older = true;
            (selection.generation, conversation_id, cursor)
        };

        let request =
            LoadRequest::older_than(conversation_id, cursor, self.paging.older, LoadPurpose::Older);
        let result = self.source.fetch_messages(&request).await;

        let mut selection = self.selection.write().await;
        if selection.generation != generation {
            debug!("Discarding older page for {} (selection changed)", conversation_id);
            return LoadOutcome::Cancelled;
        }
        selection.loading_older = false;

        match result {
            Ok(batch) if batch.is_empty() => {
                selection.exhausted = true;
                info!("Reached the start of conversation {}", conversation_id);
                LoadOutcome::Empty
            }
            Ok(batch) => {
                let Some(window) = selection.window.as_mut() else {
                    return LoadOutcome::Cancelled;
                };
                let ids = window.merge_new_ids(&batch);
                let added = ids.len();
                let len = window.len();
                if added > 0 {
                    self.emitter.emit(WindowEvent::Updated {
                        conversation_id,
                        kind: UpdateKind::TopInsert,
                        added,
                        ids,
                        len,
                    });
                }
                LoadOutcome::Loaded { added }
            }
            Err(e) => {
                warn!("Loading older messages for {} failed: {}", conversation_id, e);
                LoadOutcome::Failed
            }
        }
    }

    /// Merge one pushed message. Returns false for other conversations and
    /// for ids already in the window.
    pub async fn append_live(&self, message: Message) -> bool {
        let mut selection = self.selection.write().await;
        if selection.state == StreamState::Idle {
            return false;
        }
        let Some(window) = selection.window.as_mut() else {
            return false;
        };
        if window.conversation_id() != message.conversation_id || window.contains(message.id) {
            return false;
        }

        let conversation_id = window.conversation_id();
        let ids = window.merge_new_ids(std::slice::from_ref(&message));
        if ids.is_empty() {
            return false;
        }
        let len = window.len();
        self.emitter.emit(WindowEvent::Updated {
            conversation_id,
            kind: UpdateKind::BottomInsert,
            added: ids.len(),
            ids,
            len,
        });
        true
    }

    /// Re-run phase 1 after a failure. No-op in any other state.
    ///
    /// The window is kept, so live messages accepted while failed survive.
    pub async fn retry(&self) -> Result<LoadOutcome> {
        let (generation, conversation_id) = {
            let mut selection = self.selection.write().await;
            if selection.state != StreamState::Failed {
                return Ok(LoadOutcome::Skipped);
            }
            let Some(window) = selection.window.take() else {
                return Ok(LoadOutcome::Skipped);
            };
            let conversation_id = window.conversation_id();
            (selection.reset(StreamState::InitialLoading, Some(window)), conversation_id)
        };
        info!("Retrying conversation {} (generation {})", conversation_id, generation);
        self.load_initial(generation, conversation_id).await
    }

    /// Drop the selection; in-flight results for it will be discarded
    pub async fn deselect(&self) {
        let generation = self.selection.write().await.reset(StreamState::Idle, None);
        debug!("Deselected conversation (generation {})", generation);
    }

    pub async fn state(&self) -> StreamState {
        self.selection.read().await.state
    }

    pub async fn selected_conversation(&self) -> Option<i64> {
        let selection = self.selection.read().await;
        match selection.state {
            StreamState::Idle => None,
            _ => selection.window.as_ref().map(|w| w.conversation_id()),
        }
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.selection
            .read()
            .await
            .window
            .as_ref()
            .map(|w| w.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn is_loading_older(&self) -> bool {
        self.selection.read().await.loading_older
    }

    pub async fn is_backfilling(&self) -> bool {
        self.selection.read().await.backfilling
    }

    pub async fn is_exhausted(&self) -> bool {
        self.selection.read().await.exhausted
    }
}
