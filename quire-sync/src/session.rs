//! One displayed page: debounced saves, broadcast of saved snapshots and
//! last-writer-wins application of remote updates.
//!
//! Each session runs as its own task. The handle talks to it over a command
//! channel, so the editor state is only ever touched by the task itself.
//!
//! ```text
//! edit ──► Debouncer ──(quiet)──► PersistenceGateway ──ok──► Publisher
//!                                                    └─err─► Notice
//! Subscription ──► ReconciliationPolicy ──► EditorState (cancels pending save)
//! ```
//!
//! At most one save is in flight per session. A snapshot that comes due while
//! a save is running is held and written once it completes; a newer one
//! replaces it.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use uuid::Uuid;

use quire_core::{Content, PageId};

use crate::channel::{BroadcastChannel, Subscription};
use crate::debounce::{Debouncer, DEFAULT_QUIET_PERIOD};
use crate::gateway::{ContentStore, EditEvent, GatewayError, Notice, PageWrite, PersistenceGateway};
use crate::protocol::BroadcastMessage;
use crate::reconcile::{EditorState, LastWriterWins, Reconciliation, ReconciliationPolicy};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period between the last edit and the save
    pub quiet_period: Duration,
    pub command_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            quiet_period: DEFAULT_QUIET_PERIOD,
            command_capacity: 64,
        }
    }
}

/// Things the UI may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A snapshot was stored (and broadcast if a connection existed).
    Saved(PageWrite),
    /// A save failed; the snapshot is not retried.
    SaveFailed { error: GatewayError, notice: Notice },
    /// A remote update replaced the local document.
    RemoteApplied {
        origin: Uuid,
        discarded_local_edits: bool,
    },
    /// The document was re-read from the store.
    Reloaded,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

enum Command {
    Edit(Content),
    Flush(oneshot::Sender<Result<Option<PageWrite>, GatewayError>>),
    Reload(oneshot::Sender<Result<Content, GatewayError>>),
    Close(oneshot::Sender<()>),
}

/// Handle to a running page session.
///
/// Dropping the handle closes the session the same way [`close`](Self::close)
/// does, without waiting for it.
pub struct PageSession {
    page_id: PageId,
    origin: Uuid,
    commands: mpsc::Sender<Command>,
    content: watch::Receiver<Content>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: Option<JoinHandle<()>>,
}

impl PageSession {
    /// Load `page_id` through `gateway`, subscribe to its topic and start the
    /// session with last-writer-wins reconciliation.
    pub async fn open<B, S>(
        page_id: PageId,
        channel: B,
        gateway: PersistenceGateway<S>,
        config: SessionConfig,
    ) -> Result<Self, GatewayError>
    where
        B: BroadcastChannel,
        S: ContentStore,
    {
        Self::open_with_policy(page_id, channel, gateway, LastWriterWins, config).await
    }

    pub async fn open_with_policy<B, S, P>(
        page_id: PageId,
        channel: B,
        gateway: PersistenceGateway<S>,
        policy: P,
        config: SessionConfig,
    ) -> Result<Self, GatewayError>
    where
        B: BroadcastChannel,
        S: ContentStore,
        P: ReconciliationPolicy,
    {
        // Subscribe before loading so nothing published meanwhile is missed.
        let subscription = channel.subscribe(page_id);
        let content = gateway.load(page_id).await?;
        let origin = channel.origin();

        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let (content_tx, content_rx) = watch::channel(content.clone());
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            state: EditorState::new(page_id, origin, content),
            channel,
            gateway,
            policy,
            debouncer: Debouncer::new(config.quiet_period),
            subscription: Some(subscription),
            saves: JoinSet::new(),
            held: None,
            commands: command_rx,
            content_tx,
            events: event_tx,
        };
        let task = tokio::spawn(actor.run());
        log::info!("Opened session for page {page_id}");

        Ok(Self {
            page_id,
            origin,
            commands: command_tx,
            content: content_rx,
            events: event_rx,
            task: Some(task),
        })
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Origin marker this session publishes under.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Current document, including unsaved local edits.
    pub fn content(&self) -> Content {
        self.content.borrow().clone()
    }

    pub fn watch_content(&self) -> watch::Receiver<Content> {
        self.content.clone()
    }

    /// Apply a local edit and restart the quiet period.
    pub async fn edit(&self, content: impl Into<Content>) -> Result<(), SessionError> {
        self.send(Command::Edit(content.into())).await
    }

    /// Save the pending snapshot now instead of waiting for the quiet period.
    ///
    /// Returns `None` when there was nothing to save.
    pub async fn flush(&self) -> Result<Option<PageWrite>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush(tx)).await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    /// Drop local edits and re-read the page from the store.
    pub async fn reload(&self) -> Result<Content, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Reload(tx)).await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    /// Every event that is already queued.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }

    /// Leave the page. A pending snapshot that has not come due is discarded;
    /// a save already in flight still completes but is not broadcast.
    pub async fn close(mut self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Session task for page {} failed: {e}", self.page_id);
            }
        }
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).await.map_err(|_| SessionError::Closed)
    }
}

impl std::fmt::Debug for PageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSession")
            .field("page_id", &self.page_id)
            .field("origin", &self.origin)
            .finish()
    }
}

struct SessionActor<B, S, P> {
    state: EditorState,
    channel: B,
    gateway: PersistenceGateway<S>,
    policy: P,
    debouncer: Debouncer<Content>,
    subscription: Option<Subscription>,
    saves: JoinSet<Result<PageWrite, GatewayError>>,
    /// Snapshot waiting for the in-flight save
    held: Option<Content>,
    commands: mpsc::Receiver<Command>,
    content_tx: watch::Sender<Content>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

async fn next_update(subscription: &mut Option<Subscription>) -> Option<BroadcastMessage> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

impl<B, S, P> SessionActor<B, S, P>
where
    B: BroadcastChannel,
    S: ContentStore,
    P: ReconciliationPolicy,
{
    fn page_id(&self) -> PageId {
        self.state.page_id()
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Edit(content)) => self.on_edit(content),
                    Some(Command::Flush(reply)) => {
                        let result = self.flush().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Reload(reply)) => {
                        let result = self.reload().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Close(reply)) => {
                        self.close();
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.close();
                        break;
                    }
                },

                update = next_update(&mut self.subscription) => match update {
                    Some(update) => self.on_remote(update),
                    None => {
                        log::warn!("Broadcast channel for page {} went away", self.page_id());
                        self.subscription = None;
                    }
                },

                _ = self.debouncer.expired() => self.on_quiet(),

                Some(joined) = self.saves.join_next() => self.on_save_joined(joined),
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // The handle may be gone already; nobody to tell.
        let _ = self.events.send(event);
    }

    fn on_edit(&mut self, content: Content) {
        self.state.edit(content.clone());
        self.content_tx.send_replace(content.clone());
        self.debouncer.push(content);
    }

    fn on_remote(&mut self, update: BroadcastMessage) {
        match self.policy.reconcile(&mut self.state, &update) {
            Reconciliation::Applied { discarded_local_edits } => {
                if self.debouncer.cancel() {
                    log::debug!("Pending save for page {} superseded by remote update", self.page_id());
                }
                self.content_tx.send_replace(self.state.content().clone());
                self.emit(SessionEvent::RemoteApplied {
                    origin: update.origin,
                    discarded_local_edits,
                });
            }
            Reconciliation::OwnEcho => log::trace!("Ignoring own update for page {}", self.page_id()),
            Reconciliation::StaleTopic => {}
        }
    }

    fn on_quiet(&mut self) {
        if let Some(snapshot) = self.debouncer.fire_at(Instant::now()) {
            self.state.mark_saved();
            self.start_save(snapshot);
        }
    }

    fn start_save(&mut self, content: Content) {
        if !self.saves.is_empty() {
            log::debug!("Save for page {} in flight, holding newer snapshot", self.page_id());
            self.held = Some(content);
            return;
        }
        let gateway = self.gateway.clone();
        let edit = EditEvent::new(self.page_id(), content);
        self.saves.spawn(async move { gateway.persist(edit).await });
    }

    fn on_save_joined(&mut self, joined: Result<Result<PageWrite, GatewayError>, JoinError>) {
        match joined {
            Ok(result) => self.finish_save(result),
            Err(e) => log::error!("Save task for page {} failed: {e}", self.page_id()),
        }
        if let Some(next) = self.held.take() {
            self.start_save(next);
        }
    }

    /// Broadcast a stored snapshot, or surface the failure.
    fn finish_save(&mut self, result: Result<PageWrite, GatewayError>) {
        match result {
            Ok(write) => {
                match self.channel.publisher() {
                    Some(publisher) => {
                        publisher.publish(write.page_id, &write.content);
                    }
                    None => log::debug!("Offline, page {} saved without broadcast", write.page_id),
                }
                self.emit(SessionEvent::Saved(write));
            }
            Err(error) => {
                let notice = Notice::from_error(&error);
                log::warn!("Save for page {} failed: {error}", self.page_id());
                self.emit(SessionEvent::SaveFailed { error, notice });
            }
        }
    }

    async fn flush(&mut self) -> Result<Option<PageWrite>, GatewayError> {
        let snapshot = self.debouncer.take().or_else(|| self.held.take());
        self.held = None;

        while let Some(joined) = self.saves.join_next().await {
            match joined {
                Ok(result) => self.finish_save(result),
                Err(e) => log::error!("Save task for page {} failed: {e}", self.page_id()),
            }
        }

        let Some(content) = snapshot else {
            return Ok(None);
        };
        self.state.mark_saved();
        let result = self.gateway.persist(EditEvent::new(self.page_id(), content)).await;
        self.finish_save(result.clone());
        result.map(Some)
    }

    async fn reload(&mut self) -> Result<Content, GatewayError> {
        let content = self.gateway.load(self.page_id()).await?;
        self.debouncer.cancel();
        self.held = None;
        self.state.overwrite(content.clone());
        self.content_tx.send_replace(content.clone());
        self.emit(SessionEvent::Reloaded);
        Ok(content)
    }

    fn close(&mut self) {
        self.subscription = None;
        if self.debouncer.cancel() || self.held.take().is_some() {
            log::debug!("Discarding unsaved edits on page {}", self.page_id());
        }
        self.saves.detach_all();
        log::info!("Closed session for page {}", self.page_id());
    }
}
