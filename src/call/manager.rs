//! Call Manager
//!
//! Besitzt den aktiven Anruf und führt die Effekte der State Machine aus.
//! Alle Zustandsänderungen laufen durch eine einzige Event-Loop-Task:
//! - Befehle der API kommen über `mpsc` mit `oneshot`-Antwort; die Antwort
//!   geht raus, sobald die State Machine den Befehl angenommen hat
//! - Effekte stehen in einer Warteschlange und laufen einzeln nacheinander;
//!   während ein Effekt auf Signaling oder Media wartet, nimmt die Loop
//!   weiter Befehle und Eingaben an
//! - Snapshots, Media-Callbacks und Timer kommen als `CallInput`,
//!   markiert mit der Generation des Anrufs
//! - Beobachter sehen den Zustand über `watch` und `broadcast`

use super::alert::{IncomingCallAlert, LogAlert};
use super::error::CallError;
use super::machine::{CallInput, CallStateMachine, Command, Effect, Timer};
use super::state::{CallSnapshot, CallState, MediaControls};
use crate::config::CallConfig;
use crate::history::CallHistory;
use crate::media_engine::{MediaEngine, MediaError, MediaEvent, MediaSession};
use crate::signaling::{
    CallStatus, ChannelEvent, ClaimOutcome, RecordPatch, SignalingChannel, SignalingError,
    Subscription,
};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

const REQUEST_QUEUE_SIZE: usize = 32;
const EVENT_CHANNEL_SIZE: usize = 100;

// ============================================================================
// LOOP MESSAGES
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Toggle {
    Audio,
    Video,
    Speaker,
    Camera,
}

impl Toggle {
    fn operation(&self) -> &'static str {
        match self {
            Toggle::Audio => "toggle audio",
            Toggle::Video => "toggle video",
            Toggle::Speaker => "toggle speaker",
            Toggle::Camera => "switch camera",
        }
    }
}

enum Request {
    Command {
        command: Command,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Toggle {
        toggle: Toggle,
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Eingabe aus einer Hintergrund-Task
struct Tagged {
    generation: u64,
    /// Nur für Media-Callbacks gesetzt
    media_epoch: Option<u64>,
    input: CallInput,
}

fn operation(command: &Command) -> &'static str {
    match command {
        Command::Place { .. } => "place call",
        Command::Incoming { .. } => "receive call",
        Command::Answer { .. } => "answer call",
        Command::Decline { .. } => "decline call",
        Command::End => "end call",
    }
}

/// Effekte, die auch nach `Ended` noch ausgeführt werden
fn is_cleanup(effect: &Effect) -> bool {
    matches!(
        effect,
        Effect::UpdateRecord { .. }
            | Effect::StopAlert
            | Effect::ReleaseMedia
            | Effect::Unsubscribe
            | Effect::ReleaseSession { .. }
    )
}

struct Hooks {
    alert: Arc<dyn IncomingCallAlert>,
    history: Option<Arc<CallHistory>>,
}

// ============================================================================
// EFFECT QUEUE
// ============================================================================

/// Effekt, der auf seine Ausführung wartet
struct Queued {
    generation: u64,
    effect: Effect,
}

/// Ergebnis eines Effekts mit I/O
enum Outcome {
    Done,
    Input(CallInput),
    MediaOpened {
        session: Arc<dyn MediaSession>,
        events: mpsc::UnboundedReceiver<MediaEvent>,
        is_video: bool,
    },
    Subscribed(Subscription),
}

type EffectFuture = BoxFuture<'static, Result<Outcome, CallError>>;

/// Laufender Effekt; höchstens einer zur Zeit
struct InFlight {
    generation: u64,
    name: &'static str,
    future: EffectFuture,
}

struct Finished {
    generation: u64,
    name: &'static str,
    result: Result<Outcome, CallError>,
}

/// Wartet auf den laufenden Effekt; ohne laufenden Effekt nie fertig
async fn next_finished(slot: &mut Option<InFlight>) -> Finished {
    let Some(current) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let result = current.future.as_mut().await;
    let finished = Finished {
        generation: current.generation,
        name: current.name,
        result,
    };
    *slot = None;
    finished
}

// ============================================================================
// CALL MANAGER
// ============================================================================

/// Öffentliche Schnittstelle; die Arbeit macht die Event-Loop-Task
pub struct CallManager {
    local_user_id: String,
    requests: mpsc::Sender<Request>,
    state_rx: watch::Receiver<CallSnapshot>,
    event_tx: broadcast::Sender<CallSnapshot>,
    hooks: Arc<RwLock<Hooks>>,
}

impl CallManager {
    /// Startet die Event-Loop; braucht eine laufende Tokio Runtime
    pub fn new(
        local_user_id: impl Into<String>,
        channel: SignalingChannel,
        engine: Arc<dyn MediaEngine>,
        config: CallConfig,
    ) -> Self {
        let local_user_id = local_user_id.into();
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallSnapshot::default());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let hooks = Arc::new(RwLock::new(Hooks {
            alert: Arc::new(LogAlert),
            history: None,
        }));

        let event_loop = EventLoop {
            local_id: local_user_id.clone(),
            channel,
            engine,
            config,
            hooks: Arc::clone(&hooks),
            inputs_tx,
            state_tx,
            event_tx: event_tx.clone(),
            active: None,
            generation: 0,
            queue: VecDeque::new(),
            in_flight: None,
        };
        tokio::spawn(event_loop.run(requests_rx, inputs_rx));

        tracing::info!("Call manager started for {}", local_user_id);
        Self {
            local_user_id,
            requests: requests_tx,
            state_rx,
            event_tx,
            hooks,
        }
    }

    pub fn with_alert(self, alert: Arc<dyn IncomingCallAlert>) -> Self {
        self.hooks.write().alert = alert;
        self
    }

    /// Beendete Anrufe werden in `history` archiviert
    pub fn with_history(self, history: Arc<CallHistory>) -> Self {
        self.hooks.write().history = Some(history);
        self
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Startet einen ausgehenden Anruf.
    ///
    /// Kehrt zurück sobald der Anruf angenommen wurde; Verhandlung und
    /// Glare-Auflösung laufen im Hintergrund weiter.
    pub async fn place_call(
        &self,
        chat_room_id: &str,
        recipient_id: &str,
        is_video: bool,
    ) -> Result<watch::Receiver<CallSnapshot>, CallError> {
        self.command(Command::Place {
            call_id: Uuid::new_v4().to_string(),
            chat_room_id: chat_room_id.to_string(),
            peer_id: recipient_id.to_string(),
            is_video,
        })
        .await?;
        Ok(self.watch())
    }

    /// Übergibt die ID eines eingehenden Anrufs (Push, Inbox)
    pub async fn receive_call(&self, call_id: &str) -> Result<(), CallError> {
        self.command(Command::Incoming {
            call_id: call_id.to_string(),
        })
        .await
    }

    pub async fn answer_call(
        &self,
        call_id: &str,
    ) -> Result<watch::Receiver<CallSnapshot>, CallError> {
        self.command(Command::Answer {
            call_id: call_id.to_string(),
        })
        .await?;
        Ok(self.watch())
    }

    pub async fn decline_call(&self, call_id: &str) -> Result<(), CallError> {
        self.command(Command::Decline {
            call_id: call_id.to_string(),
        })
        .await
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        self.command(Command::End).await
    }

    /// Gibt den neuen Mute-Status zurück
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.toggle(Toggle::Audio).await
    }

    /// Gibt zurück ob Video jetzt an ist
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.toggle(Toggle::Video).await
    }

    /// Gibt zurück ob der Lautsprecher jetzt an ist
    pub async fn toggle_speaker(&self) -> Result<bool, CallError> {
        self.toggle(Toggle::Speaker).await
    }

    pub async fn switch_camera(&self) -> Result<(), CallError> {
        self.toggle(Toggle::Camera).await.map(|_| ())
    }

    pub fn state(&self) -> CallSnapshot {
        self.state_rx.borrow().clone()
    }

    /// Aktueller Zustand und alle folgenden Änderungen
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.state_rx.clone()
    }

    /// Jeder veröffentlichte Snapshot ab jetzt
    pub fn subscribe(&self) -> broadcast::Receiver<CallSnapshot> {
        self.event_tx.subscribe()
    }

    /// Beendet einen laufenden Anruf und stoppt die Event-Loop
    pub async fn shutdown(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Shutdown { reply })
            .await
            .map_err(|_| CallError::ManagerClosed)?;
        rx.await.map_err(|_| CallError::ManagerClosed)
    }

    async fn command(&self, command: Command) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Command { command, reply })
            .await
            .map_err(|_| CallError::ManagerClosed)?;
        rx.await.map_err(|_| CallError::ManagerClosed)?
    }

    async fn toggle(&self, toggle: Toggle) -> Result<bool, CallError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Toggle { toggle, reply })
            .await
            .map_err(|_| CallError::ManagerClosed)?;
        rx.await.map_err(|_| CallError::ManagerClosed)?
    }
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("local_user_id", &self.local_user_id)
            .field("state", &self.state_rx.borrow().state)
            .finish()
    }
}

// ============================================================================
// ACTIVE CALL
// ============================================================================

struct ActiveCall {
    generation: u64,
    machine: CallStateMachine,
    media: Option<Arc<dyn MediaSession>>,
    /// Neue Session oder Freigabe: alte Callbacks werden verworfen
    media_epoch: u64,
    media_task: Option<JoinHandle<()>>,
    subscription_task: Option<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
    /// Ende protokolliert, Tasks gestoppt
    closed: bool,
    archived: bool,
}

impl ActiveCall {
    fn new(generation: u64, machine: CallStateMachine) -> Self {
        Self {
            generation,
            machine,
            media: None,
            media_epoch: 0,
            media_task: None,
            subscription_task: None,
            timers: Vec::new(),
            closed: false,
            archived: false,
        }
    }

    fn is_live(&self, generation: u64) -> bool {
        self.generation == generation && self.machine.state() != CallState::Ended
    }

    /// Löst die Session vom Anruf; schließen muss der Aufrufer
    fn detach_media(&mut self) -> Option<Arc<dyn MediaSession>> {
        self.media_epoch += 1;
        if let Some(task) = self.media_task.take() {
            task.abort();
        }
        self.media.take()
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.media_task.take() {
            task.abort();
        }
        if let Some(task) = self.subscription_task.take() {
            task.abort();
        }
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

struct EventLoop {
    local_id: String,
    channel: SignalingChannel,
    engine: Arc<dyn MediaEngine>,
    config: CallConfig,
    hooks: Arc<RwLock<Hooks>>,
    inputs_tx: mpsc::UnboundedSender<Tagged>,
    state_tx: watch::Sender<CallSnapshot>,
    event_tx: broadcast::Sender<CallSnapshot>,
    active: Option<ActiveCall>,
    generation: u64,
    queue: VecDeque<Queued>,
    in_flight: Option<InFlight>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut inputs: mpsc::UnboundedReceiver<Tagged>,
    ) {
        loop {
            self.pump();

            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Command { command, reply }) => {
                        let result = self.on_command(command);
                        let _ = reply.send(result);
                    }
                    Some(Request::Toggle { toggle, reply }) => {
                        let result = self.on_toggle(toggle).await;
                        let _ = reply.send(result);
                    }
                    Some(Request::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(tagged) = inputs.recv() => self.on_input(tagged),
                finished = next_finished(&mut self.in_flight) => self.on_finished(finished).await,
            }
        }
        tracing::info!("Call manager for {} stopped", self.local_id);
    }

    fn on_command(&mut self, command: Command) -> Result<(), CallError> {
        if matches!(command, Command::Place { .. } | Command::Incoming { .. }) {
            if self.active.as_ref().is_some_and(|a| a.machine.has_call()) {
                return Err(CallError::AlreadyInCall);
            }
            self.generation += 1;
            let machine = CallStateMachine::new(self.local_id.clone(), self.config.session_policy());
            if let Some(old) = self.active.replace(ActiveCall::new(self.generation, machine)) {
                self.retire(old);
            }
        }

        let active = self.active.as_mut().ok_or(CallError::InvalidState {
            operation: operation(&command),
            state: CallState::Idle,
        })?;

        let analytics = command.clone();
        let effects = active.machine.command(command, Utc::now())?;
        log_command(&analytics, active.machine.call_id());

        let generation = active.generation;
        self.enqueue(generation, effects);
        self.after_change();
        Ok(())
    }

    async fn on_toggle(&mut self, toggle: Toggle) -> Result<bool, CallError> {
        let active = self.active.as_mut().ok_or(CallError::InvalidState {
            operation: toggle.operation(),
            state: CallState::Idle,
        })?;
        let media = active.media.clone();

        let value = match toggle {
            Toggle::Audio => {
                let muted = active.machine.toggle_audio()?;
                if let Some(media) = &media {
                    if let Err(e) = media.set_audio_enabled(!muted).await {
                        active.machine.toggle_audio()?;
                        return Err(e.into());
                    }
                }
                muted
            }
            Toggle::Video => {
                let enabled = active.machine.toggle_video()?;
                if let Some(media) = &media {
                    if let Err(e) = media.set_video_enabled(enabled).await {
                        active.machine.toggle_video()?;
                        return Err(e.into());
                    }
                }
                enabled
            }
            Toggle::Speaker => {
                let on = active.machine.toggle_speaker()?;
                if let Some(media) = &media {
                    media.set_speaker_enabled(on);
                }
                on
            }
            Toggle::Camera => {
                active.machine.check_switch_camera()?;
                if let Some(media) = &media {
                    media.switch_camera().await?;
                }
                true
            }
        };

        tracing::info!(
            event = "call_control_changed",
            control = toggle.operation(),
            value,
            "Call control changed"
        );
        self.publish();
        Ok(value)
    }

    fn on_input(&mut self, tagged: Tagged) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if tagged.generation != active.generation {
            tracing::trace!("Dropping input from call generation {}", tagged.generation);
            return;
        }
        if tagged.media_epoch.is_some_and(|epoch| epoch != active.media_epoch) {
            tracing::trace!("Dropping callback from a released media session");
            return;
        }

        self.feed(tagged.generation, tagged.input);
        self.after_change();
    }

    /// Gibt eine Eingabe an die State Machine und reiht ihre Effekte ein
    fn feed(&mut self, generation: u64, input: CallInput) {
        let Some(active) = self
            .active
            .as_mut()
            .filter(|a| a.generation == generation)
        else {
            tracing::trace!("Dropping result for call generation {}", generation);
            return;
        };
        let effects = active.machine.handle(input, Utc::now());
        self.enqueue(generation, effects);
    }

    /// Timer starten sofort, alles andere wartet in der Reihenfolge
    fn enqueue(&mut self, generation: u64, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartTimer { timer, after, seq } => {
                    self.start_timer(generation, timer, after, seq)
                }
                effect => self.queue.push_back(Queued { generation, effect }),
            }
        }
    }

    /// Startet Effekte, bis einer auf I/O wartet oder nichts mehr ansteht
    fn pump(&mut self) {
        let mut progressed = false;
        while self.in_flight.is_none() {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            progressed = true;
            self.in_flight = self.start(queued);
        }
        if progressed {
            self.after_change();
        }
    }

    fn has_pending(&self, generation: u64) -> bool {
        self.queue.iter().any(|q| q.generation == generation)
            || self
                .in_flight
                .as_ref()
                .is_some_and(|f| f.generation == generation)
    }

    /// Lokale Effekte laufen direkt, I/O wird zum laufenden Effekt
    fn start(&mut self, queued: Queued) -> Option<InFlight> {
        let Queued { generation, effect } = queued;
        let name = effect_name(&effect);
        let current = self
            .active
            .as_ref()
            .is_some_and(|a| a.generation == generation);
        let live = self.active.as_ref().is_some_and(|a| a.is_live(generation));
        if !live && !is_cleanup(&effect) {
            tracing::debug!("Call ended, skipping effect {}", name);
            return None;
        }

        let work: EffectFuture = match effect {
            Effect::ClaimSession { peer_id, call_id } => {
                let channel = self.channel.clone();
                let local_id = self.local_id.clone();
                let tie_break = self.config.tie_break;
                async move {
                    let outcome = channel
                        .claim_session(&local_id, &peer_id, &call_id, tie_break)
                        .await?;
                    let input = match outcome {
                        ClaimOutcome::Granted => CallInput::SessionGranted,
                        ClaimOutcome::Yield { call_id } => CallInput::SessionYielded { call_id },
                    };
                    Ok::<_, CallError>(Outcome::Input(input))
                }
                .boxed()
            }

            Effect::ReleaseSession { peer_id, call_id } => {
                let channel = self.channel.clone();
                let local_id = self.local_id.clone();
                async move {
                    if let Err(e) = channel.release_session(&local_id, &peer_id, &call_id).await {
                        tracing::warn!("Failed to release call slot for {}: {}", call_id, e);
                    }
                    Ok::<_, CallError>(Outcome::Done)
                }
                .boxed()
            }

            Effect::OpenMedia { is_video } => {
                let engine = Arc::clone(&self.engine);
                async move {
                    let (events_tx, events) = mpsc::unbounded_channel();
                    let session = engine.open_session(is_video, events_tx).await?;
                    Ok::<_, CallError>(Outcome::MediaOpened {
                        session,
                        events,
                        is_video,
                    })
                }
                .boxed()
            }

            Effect::CreateOffer => {
                let media = self.media_or_fail(generation)?;
                async move {
                    let offer = media.create_offer().await?;
                    Ok::<_, CallError>(Outcome::Input(CallInput::OfferCreated(offer)))
                }
                .boxed()
            }

            Effect::CreateAnswer { offer } => {
                let media = self.media_or_fail(generation)?;
                async move {
                    let answer = media.create_answer(&offer).await?;
                    Ok::<_, CallError>(Outcome::Input(CallInput::AnswerCreated(answer)))
                }
                .boxed()
            }

            Effect::ApplyRemoteAnswer { answer } => {
                let media = self.media_or_fail(generation)?;
                async move {
                    media.set_remote_description(&answer).await?;
                    Ok::<_, CallError>(Outcome::Input(CallInput::RemoteDescriptionApplied))
                }
                .boxed()
            }

            Effect::AddRemoteCandidates(candidates) => {
                let media = self.media_or_fail(generation)?;
                async move {
                    for candidate in candidates {
                        if let Err(e) = media.add_ice_candidate(&candidate).await {
                            tracing::warn!("Ignoring remote candidate: {}", e);
                        }
                    }
                    Ok::<_, CallError>(Outcome::Done)
                }
                .boxed()
            }

            Effect::CreateRecord(record) => {
                let channel = self.channel.clone();
                async move {
                    let input = match channel.create_call(&record).await {
                        Ok(()) => CallInput::RecordCreated(record),
                        Err(SignalingError::Preempted { by }) => CallInput::RecordPreempted { by },
                        Err(e) => return Err(CallError::from(e)),
                    };
                    Ok::<_, CallError>(Outcome::Input(input))
                }
                .boxed()
            }

            Effect::UpdateRecord { call_id, patch } => {
                let channel = self.channel.clone();
                async move {
                    let merged = channel.update_call(&call_id, patch).await?;
                    Ok::<_, CallError>(Outcome::Input(CallInput::Snapshot(merged)))
                }
                .boxed()
            }

            Effect::PublishCandidates {
                call_id,
                side,
                candidates,
            } => {
                let channel = self.channel.clone();
                async move {
                    for candidate in candidates {
                        channel.append_candidate(&call_id, side, candidate).await?;
                    }
                    Ok::<_, CallError>(Outcome::Done)
                }
                .boxed()
            }

            Effect::Subscribe { call_id } => {
                let channel = self.channel.clone();
                async move {
                    let subscription = channel.subscribe(&call_id).await?;
                    Ok::<_, CallError>(Outcome::Subscribed(subscription))
                }
                .boxed()
            }

            Effect::Unsubscribe => {
                if let Some(task) = self
                    .active
                    .as_mut()
                    .filter(|_| current)
                    .and_then(|a| a.subscription_task.take())
                {
                    task.abort();
                }
                return None;
            }

            Effect::StartTimer { timer, after, seq } => {
                self.start_timer(generation, timer, after, seq);
                return None;
            }

            Effect::AlertIncoming(record) => {
                if current {
                    let alert = Arc::clone(&self.hooks.read().alert);
                    alert.incoming(&record);
                }
                return None;
            }

            Effect::StopAlert => {
                if current {
                    let alert = Arc::clone(&self.hooks.read().alert);
                    alert.stop();
                }
                return None;
            }

            Effect::ReleaseMedia => {
                let media = self
                    .active
                    .as_mut()
                    .filter(|_| current)
                    .and_then(|a| a.detach_media())?;
                async move {
                    media.close().await;
                    Ok::<_, CallError>(Outcome::Done)
                }
                .boxed()
            }
        };

        let limit = self.config.connect_timeout;
        Some(InFlight {
            generation,
            name,
            future: async move {
                tokio::time::timeout(limit, work)
                    .await
                    .unwrap_or_else(|_| Err(CallError::Timeout))
            }
            .boxed(),
        })
    }

    async fn on_finished(&mut self, finished: Finished) {
        let Finished {
            generation,
            name,
            result,
        } = finished;
        let live = self.active.as_ref().is_some_and(|a| a.is_live(generation));

        match result {
            Ok(Outcome::Done) => {}
            Ok(Outcome::Input(input)) => self.feed(generation, input),
            Ok(Outcome::MediaOpened {
                session,
                events,
                is_video,
            }) => {
                if live {
                    self.install_media(generation, session, events, is_video)
                        .await;
                } else {
                    tracing::debug!("Call ended, closing late media session");
                    session.close().await;
                }
            }
            Ok(Outcome::Subscribed(subscription)) => {
                if live {
                    self.install_subscription(generation, subscription);
                } else {
                    tracing::debug!("Call ended, dropping late subscription");
                }
            }
            Err(err) => {
                tracing::debug!("Effect {} failed: {}", name, err);
                self.feed(generation, CallInput::EffectFailed(err));
            }
        }
        self.after_change();
    }

    fn media(&self) -> Result<Arc<dyn MediaSession>, CallError> {
        self.active
            .as_ref()
            .and_then(|a| a.media.clone())
            .ok_or_else(|| CallError::MediaEngine("no media session".to_string()))
    }

    fn media_or_fail(&mut self, generation: u64) -> Option<Arc<dyn MediaSession>> {
        match self.media() {
            Ok(media) => Some(media),
            Err(err) => {
                self.feed(generation, CallInput::EffectFailed(err));
                None
            }
        }
    }

    async fn install_media(
        &mut self,
        generation: u64,
        session: Arc<dyn MediaSession>,
        events: mpsc::UnboundedReceiver<MediaEvent>,
        is_video: bool,
    ) {
        let inputs = self.inputs_tx.clone();
        let Some(active) = self.active.as_mut() else {
            session.close().await;
            return;
        };
        active.media_epoch += 1;
        let task = tokio::spawn(forward_media(events, inputs, generation, active.media_epoch));
        if let Some(old) = active.media_task.replace(task) {
            old.abort();
        }
        let previous = active.media.replace(Arc::clone(&session));
        let controls = active.machine.controls();
        if let Some(previous) = previous {
            previous.close().await;
        }

        // Schalter gelten auch für Sessions, die nach dem Umschalten entstehen
        if let Err(err) = apply_controls(session.as_ref(), controls, is_video).await {
            self.feed(generation, CallInput::EffectFailed(err.into()));
            return;
        }
        tracing::debug!("Media session opened (video: {})", is_video);
    }

    fn install_subscription(&mut self, generation: u64, subscription: Subscription) {
        let task = tokio::spawn(forward_snapshots(
            self.channel.clone(),
            subscription,
            self.config.channel_retry_limit,
            self.inputs_tx.clone(),
            generation,
        ));
        match self.active.as_mut() {
            Some(active) => {
                if let Some(old) = active.subscription_task.replace(task) {
                    old.abort();
                }
            }
            None => task.abort(),
        }
    }

    fn start_timer(&mut self, generation: u64, timer: Timer, after: Duration, seq: u64) {
        let Some(active) = self
            .active
            .as_mut()
            .filter(|a| a.generation == generation)
        else {
            return;
        };
        let inputs = self.inputs_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inputs.send(Tagged {
                generation,
                media_epoch: None,
                input: CallInput::TimerFired { timer, seq },
            });
        });
        active.timers.retain(|t| !t.is_finished());
        active.timers.push(handle);
    }

    /// Beim ersten `Ended` Tasks stoppen; archiviert wird, sobald die
    /// Abschluss-Effekte durch sind
    fn after_change(&mut self) {
        let history = self.hooks.read().history.clone();
        let pending = self
            .active
            .as_ref()
            .is_some_and(|a| self.has_pending(a.generation));

        if let Some(active) = self.active.as_mut() {
            if active.machine.state() == CallState::Ended {
                if !active.closed {
                    active.closed = true;
                    active.abort_tasks();
                    log_call_ended(&active.machine.snapshot());
                }
                if !active.archived && !pending {
                    active.archived = true;
                    if let Some(history) = history {
                        archive(&history, &active.machine.snapshot());
                    }
                }
            }
        }
        self.publish();
    }

    /// Ein beendeter Anruf macht Platz für den nächsten
    fn retire(&self, mut old: ActiveCall) {
        if !old.archived && old.machine.state() == CallState::Ended {
            old.archived = true;
            if let Some(history) = self.hooks.read().history.clone() {
                archive(&history, &old.machine.snapshot());
            }
        }
        if let Some(media) = old.detach_media() {
            tokio::spawn(async move { media.close().await });
        }
    }

    fn publish(&self) {
        let snapshot = self
            .active
            .as_ref()
            .map(|a| a.machine.snapshot())
            .unwrap_or_default();

        let mut previous = None;
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            previous = Some(current.state);
            *current = snapshot.clone();
            true
        });

        if changed {
            if let Some(previous) = previous.filter(|p| *p != snapshot.state) {
                tracing::info!("Call state: {} -> {}", previous, snapshot.state);
            }
            let _ = self.event_tx.send(snapshot);
        }
    }

    /// Legt auf und wartet die Abschluss-Effekte noch ab
    async fn shutdown(&mut self) {
        let in_call = self
            .active
            .as_ref()
            .is_some_and(|a| a.machine.state().is_active());
        if in_call {
            if let Err(e) = self.on_command(Command::End) {
                tracing::warn!("Failed to end call on shutdown: {}", e);
            }
        }

        loop {
            self.pump();
            let Some(InFlight {
                generation,
                name,
                future,
            }) = self.in_flight.take()
            else {
                break;
            };
            let result = future.await;
            self.on_finished(Finished {
                generation,
                name,
                result,
            })
            .await;
        }

        if let Some(active) = self.active.as_mut() {
            if let Some(media) = active.detach_media() {
                media.close().await;
            }
            active.abort_tasks();
        }
    }
}

async fn apply_controls(
    session: &dyn MediaSession,
    controls: MediaControls,
    is_video: bool,
) -> Result<(), MediaError> {
    if controls.audio_muted {
        session.set_audio_enabled(false).await?;
    }
    if is_video && !controls.video_enabled {
        session.set_video_enabled(false).await?;
    }
    session.set_speaker_enabled(controls.speaker_on);
    Ok(())
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Leitet Snapshots weiter; nach einem Kanalfehler wird bis zu
/// `retry_limit` Mal neu abonniert
async fn forward_snapshots(
    channel: SignalingChannel,
    mut subscription: Subscription,
    retry_limit: u32,
    inputs: mpsc::UnboundedSender<Tagged>,
    generation: u64,
) {
    let call_id = subscription.call_id().to_string();
    let send = |input: CallInput| {
        inputs
            .send(Tagged {
                generation,
                media_epoch: None,
                input,
            })
            .is_ok()
    };
    let mut retries = 0;

    loop {
        let reason = match subscription.next().await {
            Some(ChannelEvent::Snapshot(record)) => {
                if !send(CallInput::Snapshot(record)) {
                    return;
                }
                continue;
            }
            Some(ChannelEvent::Error(err)) => err.to_string(),
            None => "subscription closed".to_string(),
        };

        if retries >= retry_limit {
            tracing::warn!("Subscription to call {} failed: {}", call_id, reason);
            send(CallInput::ChannelFailed(reason));
            return;
        }
        retries += 1;
        tracing::warn!(
            "Subscription to call {} lost ({}), resubscribing",
            call_id,
            reason
        );

        subscription.unsubscribe();
        match channel.subscribe(&call_id).await {
            Ok(fresh) => subscription = fresh,
            Err(err) => {
                send(CallInput::ChannelFailed(err.to_string()));
                return;
            }
        }
    }
}

async fn forward_media(
    mut events: mpsc::UnboundedReceiver<MediaEvent>,
    inputs: mpsc::UnboundedSender<Tagged>,
    generation: u64,
    media_epoch: u64,
) {
    while let Some(event) = events.recv().await {
        let input = match event {
            MediaEvent::LocalCandidate(candidate) => CallInput::LocalCandidate(candidate),
            MediaEvent::Connected => CallInput::MediaConnected,
            MediaEvent::Disconnected => CallInput::MediaDisconnected,
            MediaEvent::Failed(reason) => CallInput::MediaFailed(reason),
            MediaEvent::RemoteTrack { kind } => CallInput::RemoteTrack(kind),
        };
        let tagged = Tagged {
            generation,
            media_epoch: Some(media_epoch),
            input,
        };
        if inputs.send(tagged).is_err() {
            break;
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn effect_name(effect: &Effect) -> &'static str {
    match effect {
        Effect::ClaimSession { .. } => "claim_session",
        Effect::ReleaseSession { .. } => "release_session",
        Effect::OpenMedia { .. } => "open_media",
        Effect::CreateOffer => "create_offer",
        Effect::CreateAnswer { .. } => "create_answer",
        Effect::ApplyRemoteAnswer { .. } => "apply_remote_answer",
        Effect::AddRemoteCandidates(_) => "add_remote_candidates",
        Effect::CreateRecord(_) => "create_record",
        Effect::UpdateRecord { .. } => "update_record",
        Effect::PublishCandidates { .. } => "publish_candidates",
        Effect::Subscribe { .. } => "subscribe",
        Effect::Unsubscribe => "unsubscribe",
        Effect::StartTimer { .. } => "start_timer",
        Effect::AlertIncoming(_) => "alert_incoming",
        Effect::StopAlert => "stop_alert",
        Effect::ReleaseMedia => "release_media",
    }
}

fn log_command(command: &Command, call_id: Option<&str>) {
    let call_id = call_id.unwrap_or_default();
    match command {
        Command::Place {
            peer_id, is_video, ..
        } => tracing::info!(
            event = "call_started",
            call_id,
            recipient_id = %peer_id,
            is_video,
            "Placing call to {}",
            peer_id
        ),
        Command::Answer { .. } => tracing::info!(event = "call_answered", call_id, "Call answered"),
        Command::Decline { .. } => {
            tracing::info!(event = "call_declined", call_id, "Call declined")
        }
        Command::Incoming { .. } | Command::End => {}
    }
}

fn log_call_ended(snapshot: &CallSnapshot) {
    let outcome = snapshot.outcome.map(|o| o.as_str()).unwrap_or("unknown");
    let duration_ms = snapshot
        .record
        .as_ref()
        .and_then(|r| r.duration)
        .unwrap_or(0);
    tracing::info!(
        event = "call_ended",
        call_id = snapshot.call_id.as_deref().unwrap_or_default(),
        outcome,
        duration_ms,
        "Call ended ({})",
        outcome
    );
    if let Some(error) = &snapshot.error {
        tracing::warn!("Call ended with error: {}", error);
    }
}

fn archive(history: &CallHistory, snapshot: &CallSnapshot) {
    let Some(mut record) = snapshot.record.clone() else {
        return;
    };
    if !record.is_terminal() {
        // Abschluss-Schreiben ist nicht angekommen: lokalen Endstand sichern
        let status = snapshot.outcome.unwrap_or(CallStatus::Error);
        if let Err(e) = record.apply_patch(&RecordPatch::status(status).with_end_time(Utc::now())) {
            tracing::warn!("Cannot close record {} locally: {}", record.call_id, e);
        }
    }

    match history.archive(&record) {
        Ok(entry) => tracing::debug!("Archived call {}: {}", entry.call_id, entry.summary()),
        Err(e) => tracing::warn!("Failed to archive call {}: {}", record.call_id, e),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_engine::fake::{FakeCall, FakeMediaEngine, FakeScript};
    use crate::media_engine::TrackKind;
    use crate::signaling::store::Watch;
    use crate::signaling::{
        CallRecord, CandidateSide, DocumentStore, MemoryDocumentStore, PairClaim,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    struct Peer {
        manager: CallManager,
        engine: Arc<FakeMediaEngine>,
    }

    fn script(id: &str) -> FakeScript {
        FakeScript {
            candidates: vec![format!("{}-c1", id), format!("{}-c2", id)],
            auto_connect: true,
            fail_offer: false,
        }
    }

    fn peer_with(
        id: &str,
        store: &Arc<MemoryDocumentStore>,
        config: &CallConfig,
        script: FakeScript,
    ) -> Peer {
        let engine = FakeMediaEngine::new(id, script);
        let channel = SignalingChannel::new(store.clone(), config);
        let manager = CallManager::new(id, channel, engine.clone(), config.clone());
        Peer { manager, engine }
    }

    fn peer(id: &str, store: &Arc<MemoryDocumentStore>) -> Peer {
        peer_with(id, store, &CallConfig::default(), script(id))
    }

    async fn wait_for(
        manager: &CallManager,
        predicate: impl FnMut(&CallSnapshot) -> bool,
    ) -> CallSnapshot {
        let mut rx = manager.watch();
        let snapshot = tokio::time::timeout(Duration::from_secs(120), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for call state")
            .expect("call manager stopped")
            .clone();
        snapshot
    }

    /// Lässt alle Hintergrund-Tasks zur Ruhe kommen
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    async fn stored(store: &MemoryDocumentStore, call_id: &str) -> CallRecord {
        store.get(call_id).await.unwrap().expect("record missing")
    }

    /// Store, dessen `create` lange braucht
    struct SlowStore {
        inner: Arc<MemoryDocumentStore>,
        create_delay: Duration,
    }

    #[async_trait]
    impl DocumentStore for SlowStore {
        async fn create(&self, record: CallRecord) -> Result<(), SignalingError> {
            tokio::time::sleep(self.create_delay).await;
            self.inner.create(record).await
        }

        async fn merge(&self, call_id: &str, patch: RecordPatch) -> Result<CallRecord, SignalingError> {
            self.inner.merge(call_id, patch).await
        }

        async fn append_candidate(
            &self,
            call_id: &str,
            side: CandidateSide,
            candidate: String,
        ) -> Result<(), SignalingError> {
            self.inner.append_candidate(call_id, side, candidate).await
        }

        async fn get(&self, call_id: &str) -> Result<Option<CallRecord>, SignalingError> {
            self.inner.get(call_id).await
        }

        async fn delete(&self, call_id: &str) -> Result<(), SignalingError> {
            self.inner.delete(call_id).await
        }

        async fn watch(&self, call_id: &str) -> Result<Watch, SignalingError> {
            self.inner.watch(call_id).await
        }

        fn unwatch(&self, call_id: &str, watch_id: u64) {
            self.inner.unwatch(call_id, watch_id)
        }

        async fn claim_pair(&self, claim: PairClaim) -> Result<Option<PairClaim>, SignalingError> {
            self.inner.claim_pair(claim).await
        }

        async fn swap_pair(
            &self,
            expected_call_id: &str,
            claim: PairClaim,
        ) -> Result<bool, SignalingError> {
            self.inner.swap_pair(expected_call_id, claim).await
        }

        async fn release_pair(&self, pair_key: &str, call_id: &str) -> Result<(), SignalingError> {
            self.inner.release_pair(pair_key, call_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_call_happy_path() {
        let store = Arc::new(MemoryDocumentStore::new());
        let alice = peer("alice", &store);
        let bob = peer("bob", &store);
        let history = Arc::new(CallHistory::open_in_memory().unwrap());
        let bob_manager = bob.manager.with_history(history.clone());

        let rx = alice.manager.place_call("room-1", "bob", false).await.unwrap();
        let call_id = rx.borrow().call_id.clone().unwrap();
        assert_eq!(rx.borrow().state, CallState::Calling);

        bob_manager.receive_call(&call_id).await.unwrap();
        let ringing = wait_for(&bob_manager, |s| s.state == CallState::Ringing).await;
        assert_eq!(ringing.record.unwrap().caller_id, "alice");
        assert!(!ringing.controls.speaker_on);

        bob_manager.answer_call(&call_id).await.unwrap();
        wait_for(&alice.manager, |s| s.state == CallState::Connected).await;
        wait_for(&bob_manager, |s| s.state == CallState::Connected).await;
        settle().await;

        let record = stored(&store, &call_id).await;
        assert_eq!(record.status, CallStatus::InProgress);
        assert!(record.answer_time.is_some());

        // Candidates kommen vollständig und in Reihenfolge an
        let alice_session = alice.engine.last_session().unwrap();
        let bob_session = bob.engine.last_session().unwrap();
        assert_eq!(bob_session.added_candidates(), vec!["alice-c1", "alice-c2"]);
        assert_eq!(alice_session.added_candidates(), vec!["bob-c1", "bob-c2"]);
        assert!(bob_session
            .calls()
            .contains(&FakeCall::CreateAnswer("offer:alice".to_string())));
        assert!(alice_session
            .calls()
            .contains(&FakeCall::SetRemote("answer:bob".to_string())));

        alice_session.emit(MediaEvent::RemoteTrack {
            kind: TrackKind::Audio,
        });
        alice_session.emit(MediaEvent::RemoteTrack {
            kind: TrackKind::Audio,
        });
        settle().await;
        let connected = alice.manager.state();
        assert_eq!(connected.remote_tracks, vec![TrackKind::Audio]);
        assert!(!connected.has_remote_video());

        alice.manager.end_call().await.unwrap();
        let alice_end = alice.manager.state();
        assert_eq!(alice_end.state, CallState::Ended);
        assert_eq!(alice_end.outcome, Some(CallStatus::Completed));

        let bob_end = wait_for(&bob_manager, |s| s.state == CallState::Ended).await;
        assert_eq!(bob_end.outcome, Some(CallStatus::Completed));
        assert!(bob_end.error.is_none());
        settle().await;

        let record = stored(&store, &call_id).await;
        assert_eq!(record.status, CallStatus::Completed);
        assert!(record.end_time.is_some());
        assert!(record.duration.is_some());
        assert!(alice_session.is_closed());
        assert!(bob_session.is_closed());

        let entry = history.get(&call_id).unwrap().expect("call not archived");
        assert_eq!(entry.status, CallStatus::Completed);
        assert_eq!(entry.peer_of("bob"), "alice");
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_call_controls() {
        let store = Arc::new(MemoryDocumentStore::new());
        let alice = peer("alice", &store);

        let rx = alice.manager.place_call("room", "bob", true).await.unwrap();
        settle().await;
        let controls = rx.borrow().controls;
        assert!(controls.video_enabled);
        assert!(controls.speaker_on);
        assert!(!controls.audio_muted);

        assert!(alice.manager.toggle_audio().await.unwrap());
        assert!(!alice.manager.toggle_video().await.unwrap());
        assert!(!alice.manager.toggle_speaker().await.unwrap());
        alice.manager.switch_camera().await.unwrap();
        assert!(!alice.manager.toggle_audio().await.unwrap());

        let calls = alice.engine.last_session().unwrap().calls();
        for expected in [
            FakeCall::Audio(false),
            FakeCall::Video(false),
            FakeCall::Speaker(false),
            FakeCall::SwitchCamera,
            FakeCall::Audio(true),
        ] {
            assert!(calls.contains(&expected), "missing {:?}", expected);
        }
        assert!(!alice.manager.state().controls.speaker_on);

        alice.manager.end_call().await.unwrap();
        assert_eq!(alice.manager.state().outcome, Some(CallStatus::Missed));
        assert!(matches!(
            alice.manager.toggle_audio().await,
            Err(CallError::InvalidState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_call_has_no_video_controls() {
        let store = Arc::new(MemoryDocumentStore::new());
        let alice = peer("alice", &store);
        alice.manager.place_call("room", "bob", false).await.unwrap();

        assert!(matches!(
            alice.manager.toggle_video().await,
            Err(CallError::InvalidState { .. })
        ));
        assert!(matches!(
            alice.manager.switch_camera().await,
            Err(CallError::InvalidState { .. })
        ));
        assert!(alice.manager.toggle_speaker().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decline() {
        let store = Arc::new(MemoryDocumentStore::new());
        let alice = peer("alice", &store);
        let bob = peer("bob", &store);

        let rx = alice.manager.place_call("room", "bob", true).await.unwrap();
        let call_id = rx.borrow().call_id.clone().unwrap();
        bob.manager.receive_call(&call_id).await.unwrap();
        wait_for(&bob.manager, |s| s.state == CallState::Ringing).await;

        bob.manager.decline_call(&call_id).await.unwrap();
        assert_eq!(bob.manager.state().outcome, Some(CallStatus::Declined));

        let alice_end = wait_for(&alice.manager, |s| s.state == CallState::Ended).await;
        assert_eq!(alice_end.outcome, Some(CallStatus::Declined));
        settle().await;

        let record = stored(&store, &call_id).await;
        assert_eq!(record.status, CallStatus::Declined);
        assert!(record.answer_time.is_none());
        assert!(record.end_time.is_some());
        assert!(alice.engine.last_session().unwrap().is_closed());
        assert_eq!(bob.engine.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ringing_timeout() {
        let store = Arc::new(MemoryDocumentStore::new());
        let alice = peer("alice", &store);

        let rx = alice.manager.place_call("room", "bob", false).await.unwrap();
        let call_id = rx.borrow().call_id.clone().unwrap();

        let ended = wait_for(&alice.manager, |s| s.state == CallState::Ended).await;
        assert_eq!(ended.outcome, Some(CallStatus::Missed));
        assert_eq!(ended.error, Some(CallError::Timeout));
        settle().await;
        assert_eq!(stored(&store, &call_id).await.status, CallStatus::Missed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_glare_produces_one_record() {
        let store = Arc::new(MemoryDocumentStore::new());
        let alice = peer("alice", &store);
        let bob = peer("bob", &store);

        // bob ist nicht kanonisch und wartet das Glare-Fenster ab
        bob.manager.place_call("room", "alice", false).await.unwrap();
        settle().await;
        let rx = alice.manager.place_call("room", "bob", false).await.unwrap();
        let alice_call = rx.borrow().call_id.clone().unwrap();

        let ringing = wait_for(&bob.manager, |s| s.state == CallState::Ringing).await;
        assert_eq!(ringing.call_id.as_deref(), Some(alice_call.as_str()));
        assert_eq!(store.record_count(), 1);
        assert_eq!(alice.manager.state().state, CallState::Calling);
        assert!(bob.engine.last_session().unwrap().is_closed());

        bob.manager.answer_call(&alice_call).await.unwrap();
        wait_for(&alice.manager, |s| s.state == CallState::Connected).await;
        wait_for(&bob.manager, |s| s.state == CallState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_caller_yields_to_committed_call() {
        let store = Arc::new(MemoryDocumentStore::new());
        let alice = peer("alice", &store);
        let bob = peer("bob", &store);

        let rx = bob.manager.place_call("room", "alice", false).await.unwrap();
        // Glare-Fenster abwarten
        tokio::time::sleep(Duration::from_secs(1)).await;
        let bob_call = rx.borrow().call_id.clone().unwrap();
        assert_eq!(store.record_count(), 1);

        // alice wäre kanonisch, aber der Datensatz steht schon
        alice.manager.place_call("room", "bob", false).await.unwrap();
        let ringing = wait_for(&alice.manager, |s| s.state == CallState::Ringing).await;
        assert_eq!(ringing.call_id.as_deref(), Some(bob_call.as_str()));
        assert_eq!(store.record_count(), 1);
        assert_eq!(alice.engine.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_illegal_operations() {
        let store = Arc::new(MemoryDocumentStore::new());
        let alice = peer("alice", &store);

        assert!(matches!(
            alice.manager.end_call().await,
            Err(CallError::InvalidState {
                state: CallState::Idle,
                ..
            })
        ));
        assert!(matches!(
            alice.manager.answer_call("nope").await,
            Err(CallError::InvalidState { .. })
        ));
        assert!(matches!(
            alice.manager.place_call("room", "alice", false).await,
            Err(CallError::InvalidTransition(_))
        ));

        let rx = alice.manager.place_call("room", "bob", false).await.unwrap();
        let first = rx.borrow().call_id.clone().unwrap();
        assert_eq!(
            alice.manager.place_call("room", "carol", false).await.unwrap_err(),
            CallError::AlreadyInCall
        );
        assert_eq!(
            alice.manager.receive_call("other").await.unwrap_err(),
            CallError::AlreadyInCall
        );

        alice.manager.end_call().await.unwrap();
        assert!(matches!(
            alice.manager.end_call().await,
            Err(CallError::InvalidState {
                state: CallState::Ended,
                ..
            })
        ));

        // Nach dem Ende ist ein neuer Anruf möglich
        let rx = alice.manager.place_call("room", "carol", false).await.unwrap();
        let second = rx.borrow().call_id.clone().unwrap();
        assert_ne!(first, second);
        assert_eq!(rx.borrow().state, CallState::Calling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_ends_call() {
        let store = Arc::new(MemoryDocumentStore::new());
        let config = CallConfig {
            channel_retry_limit: 0,
            ..CallConfig::default()
        };
        let alice = peer("alice", &store);
        let bob = peer_with("bob", &store, &config, script("bob"));

        let rx = alice.manager.place_call("room", "bob", false).await.unwrap();
        let call_id = rx.borrow().call_id.clone().unwrap();
        bob.manager.receive_call(&call_id).await.unwrap();
        wait_for(&bob.manager, |s| s.state == CallState::Ringing).await;

        store.interrupt_watchers("network down");
        let ended = wait_for(&bob.manager, |s| s.state == CallState::Ended).await;
        assert_eq!(ended.outcome, Some(CallStatus::Error));
        assert!(matches!(ended.error, Some(CallError::Channel(_))));

        // alice darf einmal neu abonnieren und sieht dann das Ende
        let alice_end = wait_for(&alice.manager, |s| s.state == CallState::Ended).await;
        assert_eq!(alice_end.outcome, Some(CallStatus::Error));
        assert!(alice_end.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_after_channel_error() {
        let store = Arc::new(MemoryDocumentStore::new());
        let alice = peer("alice", &store);
        let bob = peer("bob", &store);

        let rx = alice.manager.place_call("room", "bob", false).await.unwrap();
        let call_id = rx.borrow().call_id.clone().unwrap();
        bob.manager.receive_call(&call_id).await.unwrap();
        wait_for(&bob.manager, |s| s.state == CallState::Ringing).await;

        store.interrupt_watchers("blip");
        settle().await;
        assert_eq!(bob.manager.state().state, CallState::Ringing);

        bob.manager.answer_call(&call_id).await.unwrap();
        wait_for(&alice.manager, |s| s.state == CallState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_failure_ends_call() {
        let store = Arc::new(MemoryDocumentStore::new());
        let alice = peer_with(
            "alice",
            &store,
            &CallConfig::default(),
            FakeScript {
                fail_offer: true,
                ..FakeScript::default()
            },
        );

        alice.manager.place_call("room", "bob", false).await.unwrap();
        let ended = wait_for(&alice.manager, |s| s.state == CallState::Ended).await;
        assert_eq!(ended.outcome, Some(CallStatus::Error));
        assert!(matches!(ended.error, Some(CallError::MediaEngine(_))));
        settle().await;
        assert!(alice.engine.last_session().unwrap().is_closed());
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_sees_every_snapshot() {
        let store = Arc::new(MemoryDocumentStore::new());
        let alice = peer("alice", &store);
        let mut events = alice.manager.subscribe();

        alice.manager.place_call("room", "bob", false).await.unwrap();
        alice.manager.end_call().await.unwrap();

        let mut states = Vec::new();
        while let Ok(snapshot) = events.try_recv() {
            if states.last() != Some(&snapshot.state) {
                states.push(snapshot.state);
            }
        }
        assert_eq!(states, vec![CallState::Calling, CallState::Ended]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_active_call() {
        let store = Arc::new(MemoryDocumentStore::new());
        let alice = peer("alice", &store);

        let rx = alice.manager.place_call("room", "bob", false).await.unwrap();
        let call_id = rx.borrow().call_id.clone().unwrap();
        settle().await;
        alice.manager.shutdown().await.unwrap();

        assert_eq!(stored(&store, &call_id).await.status, CallStatus::Missed);
        assert_eq!(alice.manager.state().state, CallState::Ended);
        assert_eq!(
            alice.manager.place_call("room", "bob", false).await.unwrap_err(),
            CallError::ManagerClosed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_place_call_returns_before_record_is_written() {
        let store = Arc::new(MemoryDocumentStore::new());
        let config = CallConfig::default();
        let slow: Arc<dyn DocumentStore> = Arc::new(SlowStore {
            inner: store.clone(),
            create_delay: Duration::from_secs(5),
        });
        let engine = FakeMediaEngine::new("alice", script("alice"));
        let manager = CallManager::new(
            "alice",
            SignalingChannel::new(slow, &config),
            engine.clone(),
            config,
        );

        let started = tokio::time::Instant::now();
        let rx = manager.place_call("room", "bob", false).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(rx.borrow().state, CallState::Calling);
        let call_id = rx.borrow().call_id.clone().unwrap();

        settle().await;
        assert_eq!(store.record_count(), 0);

        // Auflegen wartet nicht auf das laufende Schreiben
        let started = tokio::time::Instant::now();
        manager.end_call().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        let ended = manager.state();
        assert_eq!(ended.state, CallState::Ended);
        assert_eq!(ended.outcome, Some(CallStatus::Missed));

        // Der verspätete Datensatz wird nachträglich geschlossen
        tokio::time::sleep(Duration::from_secs(10)).await;
        let record = stored(&store, &call_id).await;
        assert_eq!(record.status, CallStatus::Missed);
        assert!(record.end_time.is_some());
        assert!(engine.last_session().unwrap().is_closed());
        assert_eq!(manager.state().state, CallState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_completes_call() {
        let store = Arc::new(MemoryDocumentStore::new());
        let config = CallConfig {
            max_call_duration: Duration::from_secs(60),
            ..CallConfig::default()
        };
        let alice = peer_with("alice", &store, &config, script("alice"));
        let bob = peer("bob", &store);

        let rx = alice.manager.place_call("room", "bob", false).await.unwrap();
        let call_id = rx.borrow().call_id.clone().unwrap();
        bob.manager.receive_call(&call_id).await.unwrap();
        wait_for(&bob.manager, |s| s.state == CallState::Ringing).await;
        bob.manager.answer_call(&call_id).await.unwrap();
        wait_for(&alice.manager, |s| s.state == CallState::Connected).await;

        let ended = wait_for(&alice.manager, |s| s.state == CallState::Ended).await;
        assert_eq!(ended.outcome, Some(CallStatus::Completed));
        assert!(ended.error.is_none());

        let bob_end = wait_for(&bob.manager, |s| s.state == CallState::Ended).await;
        assert_eq!(bob_end.outcome, Some(CallStatus::Completed));
        settle().await;
        let record = stored(&store, &call_id).await;
        assert_eq!(record.status, CallStatus::Completed);
        assert!(record.duration.is_some());
    }
}
