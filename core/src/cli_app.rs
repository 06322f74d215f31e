/// Terminal front-end: shows one conversation, follows live updates, pages back on request
use crate::config::Config;
use crate::connection::{ConnectionManager, WsTransport};
use crate::controller::{LoadOutcome, MessageStreamController};
use crate::message_types::Message;
use crate::source::HttpMessageSource;
use crate::utils::event_emitter::{EventEmitter, WindowEvent};
use crate::viewport::{
    apply_update, is_near_bottom, scroll_to_bottom, ScrollContainer, UpdateKind, ViewportAnchor,
};
use colored::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Height of one printed message in pane units
const ROW_HEIGHT: f64 = 20.0;
/// Messages visible at once
const PAGE_ROWS: usize = 30;

/// Scroll model of the printed message list: one message per row
struct TerminalPane {
    height: f64,
    top: f64,
    client: f64,
}

impl TerminalPane {
    fn new() -> Self {
        Self {
            height: 0.0,
            top: 0.0,
            client: PAGE_ROWS as f64 * ROW_HEIGHT,
        }
    }

    fn set_rows(&mut self, rows: usize) {
        self.height = rows as f64 * ROW_HEIGHT;
    }

    /// Index of the first visible message
    fn first_row(&self) -> usize {
        (self.top / ROW_HEIGHT).round() as usize
    }
}

impl ScrollContainer for TerminalPane {
    fn scroll_height(&self) -> f64 {
        self.height
    }

    fn scroll_top(&self) -> f64 {
        self.top
    }

    fn client_height(&self) -> f64 {
        self.client
    }

    fn set_scroll_top(&mut self, offset: f64) {
        self.top = offset.clamp(0.0, (self.height - self.client).max(0.0));
    }
}

/// Run until `quit`, end of input or Ctrl+C
pub async fn run(config: Config) -> anyhow::Result<()> {
    let source = Arc::new(HttpMessageSource::new(&config)?);
    let emitter = EventEmitter::new();
    let controller = MessageStreamController::new(source, &config, emitter.clone());

    let manager = ConnectionManager::new(
        Arc::new(WsTransport::new(&config)),
        Arc::new(controller.clone()),
        &config,
    );
    manager.connect().await;

    let pane = Arc::new(Mutex::new(TerminalPane::new()));
    let renderer = {
        let controller = controller.clone();
        let pane = pane.clone();
        let events = emitter.subscribe();
        let threshold = config.near_bottom_threshold;
        tokio::spawn(async move { render_events(controller, pane, events, threshold).await })
    };

    if let Some(conversation_id) = config.conversation_id {
        open(&controller, conversation_id).await;
    }
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (None, _) => continue,
            (Some("older"), _) => match controller.load_older().await {
                LoadOutcome::Empty | LoadOutcome::Exhausted => {
                    println!("{}", "-- start of conversation --".dimmed())
                }
                LoadOutcome::Skipped => println!("{}", "nothing to page yet".yellow()),
                LoadOutcome::Failed => println!("{}", "could not load older messages".yellow()),
                _ => {}
            },
            (Some("up"), _) => {
                let mut pane = pane.lock().await;
                let top = pane.scroll_top() - pane.client_height();
                pane.set_scroll_top(top);
                print_page(&controller.snapshot().await, &pane);
            }
            (Some("down"), _) => {
                let mut pane = pane.lock().await;
                scroll_to_bottom(&mut *pane);
                print_page(&controller.snapshot().await, &pane);
            }
            (Some("open"), Some(raw)) => match raw.parse::<i64>() {
                Ok(id) => open(&controller, id).await,
                Err(_) => eprintln!("{} not a conversation id: {}", "✗".red().bold(), raw),
            },
            (Some("retry"), _) => {
                if let Err(e) = controller.retry().await {
                    eprintln!("{} {}", "✗".red().bold(), e);
                }
            }
            (Some("status"), _) => {
                let first_row = pane.lock().await.first_row();
                println!(
                    "conversation: {:?}  state: {:?}  messages: {}  row: {}  live: {:?}",
                    controller.selected_conversation().await,
                    controller.state().await,
                    controller.snapshot().await.len(),
                    first_row,
                    manager.state().await,
                );
            }
            (Some("help"), _) => print_help(),
            (Some("quit"), _) | (Some("exit"), _) => break,
            (Some(other), _) => {
                eprintln!("{} Unknown command: {}", "✗".red().bold(), other.red());
            }
        }
    }

    manager.shutdown().await;
    controller.deselect().await;
    renderer.abort();
    Ok(())
}

async fn open(controller: &MessageStreamController, conversation_id: i64) {
    println!("{}", format!("⇢ conversation {}", conversation_id).bright_cyan().bold());
    if let Err(e) = controller.select_conversation(conversation_id).await {
        eprintln!("{} failed to load: {} (type {} to try again)", "✗".red().bold(), e, "retry".cyan());
    }
}

async fn render_events(
    controller: MessageStreamController,
    pane: Arc<Mutex<TerminalPane>>,
    mut events: tokio::sync::broadcast::Receiver<WindowEvent>,
    near_bottom_threshold: f64,
) {
    let mut anchor = ViewportAnchor::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("Renderer lagged {} window events", n);
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        match event {
            WindowEvent::Updated { kind, added, ids, len, .. } => {
                let window = controller.snapshot().await;
                let mut pane = pane.lock().await;
                match kind {
                    UpdateKind::Reset => {
                        pane.set_rows(len);
                        apply_update(&mut anchor, &mut *pane, kind, true);
                        if window.is_empty() {
                            println!("{}", "(no messages)".dimmed());
                        }
                        window.iter().for_each(print_message);
                    }
                    UpdateKind::TopInsert => {
                        pane.set_rows(len.saturating_sub(added));
                        anchor.capture(&*pane);
                        pane.set_rows(len);
                        apply_update(&mut anchor, &mut *pane, kind, false);
                        debug!("Anchored pane at row {} after prepend", pane.first_row());
                        println!("{}", format!("↑ {} older messages ({} loaded)", added, len).dimmed());
                        print_ids(&window, &ids);
                    }
                    UpdateKind::BottomInsert => {
                        pane.set_rows(len.saturating_sub(added));
                        let following = is_near_bottom(&*pane, near_bottom_threshold);
                        pane.set_rows(len);
                        apply_update(&mut anchor, &mut *pane, kind, following);
                        if following {
                            print_ids(&window, &ids);
                        } else {
                            println!(
                                "{}",
                                format!("↓ {} new below (type down)", added).bright_yellow()
                            );
                        }
                    }
                }
            }
            WindowEvent::LoadFailed { conversation_id, error } => {
                anchor.discard();
                eprintln!("{} conversation {}: {}", "✗".red().bold(), conversation_id, error);
            }
        }
    }
}

/// Print the listed messages in window order, wherever they landed
fn print_ids(window: &[Message], ids: &[i64]) {
    select_ids(window, ids).into_iter().for_each(print_message);
}

/// `ids` must be ascending, as carried by `WindowEvent::Updated`
fn select_ids<'a>(window: &'a [Message], ids: &[i64]) -> Vec<&'a Message> {
    window
        .iter()
        .filter(|m| ids.binary_search(&m.id).is_ok())
        .collect()
}

fn print_page(window: &[Message], pane: &TerminalPane) {
    window.iter().skip(pane.first_row()).take(PAGE_ROWS).for_each(print_message);
}

fn print_message(message: &Message) {
    let time = message.timestamp.format("%Y-%m-%d %H:%M:%S").to_string();
    let who = if message.is_outgoing() {
        "me".green().bold()
    } else {
        message.sender_name.as_deref().unwrap_or("unknown").cyan().bold()
    };
    let media = message
        .attachment
        .as_ref()
        .map(|a| format!(" [{}]", a.kind.as_deref().unwrap_or("media")).yellow().to_string())
        .unwrap_or_default();

    println!("{} {} {}{}  {}", time.dimmed(), who, message.body, media, format!("#{}", message.id).dimmed());
}

fn print_help() {
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}          load an older page", "older".cyan());
    println!("  {}             scroll back one page", "up".cyan());
    println!("  {}           jump to the newest messages", "down".cyan());
    println!("  {} <id>      switch conversation", "open".cyan());
    println!("  {}          reload after a failed open", "retry".cyan());
    println!("  {}         show stream and connection state", "status".cyan());
    println!("  {}           leave", "quit".cyan());
}
