//! Call Session Controller - die Zustandsmaschine des Clients
//!
//! Besitzt Session-Identität, Turn-Taking zwischen lokaler Aufnahme und
//! entfernter Wiedergabe und überführt Events von SignalingChannel und
//! PeerLink in beobachtbaren Anruf-Zustand. Beide Betriebsarten teilen
//! sich dieselbe Form:
//!
//! - Peer-Modus: Offer über den Relay, `callAccepted`/`callEnded`
//! - Agent-Modus: `init_session` bis `session_ended`, mit strikter
//!   Stop/Play/Rearm-Sequenz um jede Agent-Antwort herum
//!
//! Alle Handler laufen auf einer logischen Event-Schleife und sind
//! deshalb frei von Lock-Bedarf; entscheidend ist die REIHENFOLGE:
//! der Recorder muss gestoppt sein, bevor Wiedergabe beginnt.

use super::{generate_session_id, CallDetails, CallStatus, Session, SessionEvent, TurnState};
use crate::media::{CaptureMode, CaptureSource, PlaybackSink, Recorder, StreamHandle};
use crate::peer::{PeerError, PeerEvent, PeerFactory, PeerLink, PeerRole};
use crate::signaling::{
    AgentMessage, ClientCommand, CommandSink, EndSessionPayload, InitSessionPayload, PeerMessage,
    ServerMessage, SignalPayload, StartConversationPayload, StartInterviewPayload,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active session")]
    NoActiveSession,

    #[error("No pending incoming call")]
    NoIncomingCall,

    #[error("Media error: {0}")]
    Media(#[from] crate::media::MediaError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Die Zustandsmaschine für Anruf- und Agent-Sessions
///
/// Sämtlicher veränderlicher Zustand liegt als explizites Feld hier;
/// externe Callbacks mutieren nie direkt, sondern liefern Events, die
/// über die `handle_*`-Methoden einlaufen.
pub struct CallSessionController {
    user_id: String,
    session: Option<Session>,
    call_details: Option<CallDetails>,
    turn: TurnState,
    target_peer: Option<String>,
    local_stream: Option<StreamHandle>,
    remote_stream: Option<StreamHandle>,
    capture_mode: CaptureMode,

    capture: Arc<Mutex<dyn CaptureSource>>,
    recorder: Box<dyn Recorder>,
    playback: Box<dyn PlaybackSink>,
    sink: Arc<dyn CommandSink>,
    peer_factory: Arc<dyn PeerFactory>,
    peer: Option<Box<dyn PeerLink>>,
    peer_events_tx: mpsc::Sender<PeerEvent>,

    event_tx: broadcast::Sender<SessionEvent>,
}

impl CallSessionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: String,
        capture: Arc<Mutex<dyn CaptureSource>>,
        recorder: Box<dyn Recorder>,
        playback: Box<dyn PlaybackSink>,
        sink: Arc<dyn CommandSink>,
        peer_factory: Arc<dyn PeerFactory>,
        peer_events_tx: mpsc::Sender<PeerEvent>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            user_id,
            session: None,
            call_details: None,
            turn: TurnState::Idle,
            target_peer: None,
            local_stream: None,
            remote_stream: None,
            capture_mode: CaptureMode::Audio,
            capture,
            recorder,
            playback,
            sink,
            peer_factory,
            peer: None,
            peer_events_tx,
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver für die Präsentationsschicht zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Aktueller Session-Status (`Idle` wenn keine Session existiert)
    pub fn status(&self) -> CallStatus {
        self.session
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(CallStatus::Idle)
    }

    /// Aktueller Turn-Taking-Zustand
    pub fn turn_state(&self) -> TurnState {
        self.turn
    }

    /// Die laufende Session (falls vorhanden)
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Der anstehende eingehende Anruf (falls vorhanden)
    pub fn call_details(&self) -> Option<&CallDetails> {
        self.call_details.as_ref()
    }

    /// Handle auf den lokalen Stream (falls akquiriert)
    pub fn local_stream(&self) -> Option<StreamHandle> {
        self.local_stream
    }

    /// Handle auf den entfernten Stream (falls eingetroffen)
    pub fn remote_stream(&self) -> Option<StreamHandle> {
        self.remote_stream
    }

    // ========================================================================
    // MODE A — PEER-TO-PEER CALL
    // ========================================================================

    /// Startet einen ausgehenden Anruf zur angegebenen Gegenstelle
    pub fn start_call(&mut self, target_id: &str) -> Result<(), SessionError> {
        if self.status() != CallStatus::Idle {
            return Err(SessionError::AlreadyInCall);
        }

        // Gerät zuerst: schlägt die Akquise fehl, kann der Anruf gar
        // nicht erst beginnen
        let local = self.ensure_local_stream()?;

        self.session = Some(Session {
            id: generate_session_id(),
            user_id: self.user_id.clone(),
            status: CallStatus::Calling,
        });
        self.emit(SessionEvent::StatusChanged(CallStatus::Calling));
        self.target_peer = Some(target_id.to_string());

        tracing::info!("Starting call to {}", target_id);

        match self.peer_factory.create(
            PeerRole::Initiator,
            Some(local),
            self.peer_events_tx.clone(),
        ) {
            Ok(link) => {
                self.peer = Some(link);
                Ok(())
            }
            Err(e) => {
                // Verhandlungsfehler an der Anruf-Grenze ist terminal
                tracing::error!("Error starting call: {}", e);
                self.teardown_call();
                Err(e.into())
            }
        }
    }

    /// Nimmt den anstehenden eingehenden Anruf an
    pub fn accept_call(&mut self) -> Result<(), SessionError> {
        // Ein laufender Anruf bleibt unangetastet; das zweite Offer
        // wartet in den CallDetails, bis wieder Platz ist
        if self.status() != CallStatus::Idle {
            return Err(SessionError::AlreadyInCall);
        }

        let details = self.call_details.take().ok_or(SessionError::NoIncomingCall)?;

        let local = self.ensure_local_stream()?;

        self.session = Some(Session {
            id: generate_session_id(),
            user_id: self.user_id.clone(),
            status: CallStatus::Calling,
        });
        self.target_peer = Some(details.identifier.clone());

        tracing::info!("Accepting call from {}", details.identifier);

        let mut link = self.peer_factory.create(
            PeerRole::Responder,
            Some(local),
            self.peer_events_tx.clone(),
        )?;

        if let Some(signal) = details.signal {
            link.signal(signal);
        }
        self.peer = Some(link);
        self.set_status(CallStatus::Connected);

        Ok(())
    }

    /// Lehnt den anstehenden eingehenden Anruf ab
    pub fn reject_call(&mut self) {
        if self.call_details.take().is_some() {
            tracing::info!("Rejected incoming call");
        }
    }

    /// Beendet den Anruf clientseitig: Teardown plus Reset
    pub fn leave_call(&mut self) {
        tracing::info!("Leaving call");
        self.teardown_call();
    }

    /// Wechselt die Capture-Art (Video↔Audio)
    ///
    /// Gerät wird freigegeben und neu akquiriert; der Session-Status
    /// bleibt unberührt (abhängiger Effekt, keine Transition).
    pub fn set_capture_mode(&mut self, mode: CaptureMode) -> Result<StreamHandle, SessionError> {
        tracing::info!("Switching capture mode to {:?}", mode);

        self.capture_mode = mode;
        let handle = {
            let mut capture = self.capture.lock();
            capture.release();
            capture.acquire(mode)?
        };
        self.local_stream = Some(handle);
        self.emit(SessionEvent::LocalStream(handle));

        Ok(handle)
    }

    /// Setzt die bevorzugte Capture-Art für die nächste Geräte-Akquise,
    /// ohne das Gerät jetzt schon zu berühren
    pub fn set_preferred_capture_mode(&mut self, mode: CaptureMode) {
        self.capture_mode = mode;
    }

    /// Setzt den Mute-Status der Capture Source
    pub fn set_muted(&self, muted: bool) {
        self.capture.lock().set_muted(muted);
    }

    /// Gibt den Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        self.capture.lock().is_muted()
    }

    // ========================================================================
    // MODE B — AGENT SESSION
    // ========================================================================

    /// Startet eine Agent-Session
    pub fn init_session(&mut self) -> Result<(), SessionError> {
        if self.status() != CallStatus::Idle {
            return Err(SessionError::AlreadyInCall);
        }

        // Mikrofon vorab akquirieren, damit der Recorder beim ersten
        // Rearm ein bereites Gerät vorfindet
        self.ensure_local_stream()?;

        let session = Session {
            id: generate_session_id(),
            user_id: self.user_id.clone(),
            status: CallStatus::Calling,
        };

        tracing::info!("Initializing agent session {}", session.id);

        self.sink
            .send(ClientCommand::InitSession(InitSessionPayload::new(
                session.id.clone(),
                session.user_id.clone(),
            )));

        self.session = Some(session);
        self.emit(SessionEvent::StatusChanged(CallStatus::Calling));

        Ok(())
    }

    /// Bittet den Server, die Session zu beenden
    ///
    /// Ändert lokal bewusst nichts: aufgeräumt wird erst mit der
    /// Bestätigung `session_ended`, damit der Status immer eine vom
    /// Server quittierte Transition widerspiegelt.
    pub fn end_conversation(&self) -> Result<(), SessionError> {
        let session = self.session.as_ref().ok_or(SessionError::NoActiveSession)?;

        tracing::info!("Requesting end of session {}", session.id);

        self.sink
            .send(ClientCommand::EndSession(EndSessionPayload::new(
                session.id.clone(),
                session.user_id.clone(),
            )));

        Ok(())
    }

    // ========================================================================
    // INBOUND EVENTS
    // ========================================================================

    /// Verarbeitet eine eingehende Server-Nachricht
    pub fn handle_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Agent(msg) => self.handle_agent_message(msg),
            ServerMessage::Peer(msg) => self.handle_peer_message(msg),
        }
    }

    /// Verarbeitet ein Event des PeerLinks
    pub fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalSignal(signal) => {
                // Lokales Signal ist fertig: Offer/Answer an die
                // Gegenstelle relayen
                match &self.target_peer {
                    Some(to) => {
                        self.sink.send(ClientCommand::StartInterview(
                            StartInterviewPayload::new(signal, to.clone()),
                        ));
                    }
                    None => {
                        tracing::warn!("Local signal ready but no target peer");
                    }
                }
            }

            PeerEvent::RemoteStream(handle) => {
                tracing::info!("Remote stream attached");
                self.remote_stream = Some(handle);
                self.emit(SessionEvent::RemoteStream(handle));
            }

            PeerEvent::Failed(reason) => {
                tracing::error!("Peer connection failed: {}", reason);
                self.emit(SessionEvent::Error(reason));
                self.teardown_call();
            }

            PeerEvent::Closed => {
                tracing::debug!("Peer link closed");
            }
        }
    }

    fn handle_agent_message(&mut self, msg: AgentMessage) {
        match msg {
            AgentMessage::SessionInitialized { session_id } => {
                // Nur in Calling gültig; alles andere wäre ein Duplikat
                // oder eine fremde Session
                if self.status() != CallStatus::Calling {
                    tracing::warn!(
                        "Ignoring session_initialized in status {:?}",
                        self.status()
                    );
                    return;
                }

                tracing::info!("Session {} initialized", session_id);

                if let Some(session) = &self.session {
                    self.sink.send(ClientCommand::StartConversation(
                        StartConversationPayload::new(
                            session.id.clone(),
                            session.user_id.clone(),
                        ),
                    ));
                }

                self.set_status(CallStatus::Connected);
                self.set_turn(TurnState::AwaitingResponse);
            }

            AgentMessage::Transcript { text } => {
                // Rein informativ, keine Zustandsänderung
                self.emit(SessionEvent::Transcript(text));
            }

            AgentMessage::AiAudio { audio, is_greeting } => {
                self.handle_ai_audio(&audio, is_greeting);
            }

            AgentMessage::SessionEnded { session_id } => {
                tracing::info!("Session {} ended by server", session_id);
                self.cleanup_session();
            }

            AgentMessage::Error { message } => {
                // Wird nur angezeigt; beendet die Session nicht von sich aus
                tracing::error!("Server error: {}", message);
                self.emit(SessionEvent::Error(message));
            }
        }
    }

    /// Die kritische Turn-Taking-Transition
    ///
    /// Reihenfolge ist hier alles: erst den Recorder stoppen, dann die
    /// Wiedergabe übergeben, dann wieder scharf machen. Das Mikrofon
    /// nimmt nie auf, während die Antwort übergeben wird.
    fn handle_ai_audio(&mut self, audio: &str, is_greeting: bool) {
        // Ohne verbundene Session gibt es nichts abzuspielen; eine
        // verspätete Antwort nach `session_ended` verfällt
        if self.status() != CallStatus::Connected {
            tracing::warn!("Ignoring ai_audio in status {:?}", self.status());
            return;
        }

        if is_greeting {
            tracing::debug!("Playing greeting audio");
        }

        // 1. Aufnahme sicher verlassen
        if self.recorder.is_active() {
            self.recorder.stop();
        }

        // 2. Dekodieren und abspielen
        self.set_turn(TurnState::Playing);
        match BASE64.decode(audio) {
            Ok(pcm) => {
                if let Err(e) = self.playback.play(&pcm) {
                    tracing::error!("Playback failed: {}", e);
                    self.emit(SessionEvent::Error(e.to_string()));
                }
            }
            Err(e) => {
                tracing::warn!("Undecodable audio payload: {}", e);
                self.emit(SessionEvent::Error(e.to_string()));
            }
        }

        // 3. Recorder wieder scharf machen, damit die nächste Äußerung
        //    ohne Nutzeraktion aufgenommen wird
        if let Some(session) = &self.session {
            self.recorder.start(&session.id, &session.user_id);
        }
        if self.recorder.is_active() {
            self.set_turn(TurnState::Capturing);
        } else {
            self.set_turn(TurnState::AwaitingResponse);
        }
    }

    fn handle_peer_message(&mut self, msg: PeerMessage) {
        match msg {
            PeerMessage::CallUser { from, signal } => {
                // Nur die Details befüllen; angenommen wird explizit
                tracing::info!("Incoming call from {}", from);
                let details = CallDetails {
                    identifier: from,
                    signal: Some(signal),
                };
                self.call_details = Some(details.clone());
                self.emit(SessionEvent::IncomingCall(details));
            }

            PeerMessage::CallAccepted { signal } => {
                tracing::info!("Call accepted by remote peer");
                match self.peer.as_mut() {
                    Some(link) => {
                        link.signal(signal);
                        self.set_status(CallStatus::Connected);
                    }
                    None => {
                        tracing::warn!("callAccepted without active peer link");
                    }
                }
            }

            PeerMessage::CallEnded => {
                // Explizite terminale Nachricht: beide Seiten resetten
                // konsistent, unabhängig vom ICE-Zustand
                tracing::info!("Call ended by remote peer");
                self.teardown_call();
            }
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Akquiriert den lokalen Stream, falls noch nicht geschehen
    fn ensure_local_stream(&mut self) -> Result<StreamHandle, SessionError> {
        if let Some(handle) = self.local_stream {
            return Ok(handle);
        }

        let mode = self.capture_mode;
        let handle = self.capture.lock().acquire(mode)?;
        self.local_stream = Some(handle);
        self.emit(SessionEvent::LocalStream(handle));

        Ok(handle)
    }

    /// Gibt das Gerät frei, falls akquiriert
    fn release_local_stream(&mut self) {
        if self.local_stream.take().is_some() {
            self.capture.lock().release();
        }
    }

    /// Gemeinsamer Teardown-Pfad für `leaveCall`, `callEnded` und
    /// Peer-Fehler: Link zerstören, Status terminal, Reset signalisieren
    fn teardown_call(&mut self) {
        if let Some(mut link) = self.peer.take() {
            link.destroy();
        }
        self.recorder.stop();
        self.release_local_stream();
        self.target_peer = None;
        self.remote_stream = None;
        self.set_turn(TurnState::Idle);

        // Nur eine real existierende Session endet terminal; auf einem
        // leeren Controller gibt es nichts zu resetten
        if self.session.is_some() {
            self.set_status(CallStatus::Ended);
            self.emit(SessionEvent::Reset);
        }
    }

    /// Idempotentes Aufräumen nach `session_ended`
    fn cleanup_session(&mut self) {
        self.recorder.stop();
        self.release_local_stream();

        if self.session.take().is_some() {
            self.emit(SessionEvent::StatusChanged(CallStatus::Idle));
        }
        if self.turn != TurnState::Idle {
            self.set_turn(TurnState::Idle);
        }
    }

    /// Aktualisiert den Status und sendet Event
    ///
    /// Ohne Session gibt es keinen Status zu ändern; Event und
    /// abfragbarer Zustand bleiben so immer deckungsgleich.
    fn set_status(&mut self, status: CallStatus) {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };
        if session.status == status {
            return;
        }
        session.status = status;
        self.emit(SessionEvent::StatusChanged(status));
    }

    /// Aktualisiert den Turn-Zustand und sendet Event
    fn set_turn(&mut self, turn: TurnState) {
        if self.turn == turn {
            return;
        }
        self.turn = turn;
        self.emit(SessionEvent::TurnChanged(turn));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionController")
            .field("status", &self.status())
            .field("turn", &self.turn)
            .field("session", &self.session)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Trace = Arc<Mutex<Vec<&'static str>>>;

    // ------------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------------

    struct FakeCapture {
        ready: bool,
        handle: Option<StreamHandle>,
        acquires: usize,
        releases: usize,
    }

    impl FakeCapture {
        fn new() -> Self {
            Self {
                ready: false,
                handle: None,
                acquires: 0,
                releases: 0,
            }
        }
    }

    impl CaptureSource for FakeCapture {
        fn acquire(&mut self, mode: CaptureMode) -> Result<StreamHandle, MediaError> {
            self.acquires += 1;
            self.ready = true;
            let handle = StreamHandle::new(mode);
            self.handle = Some(handle);
            Ok(handle)
        }

        fn release(&mut self) {
            self.releases += 1;
            self.ready = false;
            self.handle = None;
        }

        fn is_ready(&self) -> bool {
            self.ready
        }

        fn stream(&self) -> Option<StreamHandle> {
            self.handle
        }

        fn drain(&mut self) -> Vec<u8> {
            Vec::new()
        }

        fn set_muted(&self, _muted: bool) {}

        fn is_muted(&self) -> bool {
            false
        }

        fn input_level(&self) -> f32 {
            0.0
        }
    }

    struct BrokenCapture;

    impl CaptureSource for BrokenCapture {
        fn acquire(&mut self, _mode: CaptureMode) -> Result<StreamHandle, MediaError> {
            Err(MediaError::NoInputDevice)
        }

        fn release(&mut self) {}

        fn is_ready(&self) -> bool {
            false
        }

        fn stream(&self) -> Option<StreamHandle> {
            None
        }

        fn drain(&mut self) -> Vec<u8> {
            Vec::new()
        }

        fn set_muted(&self, _muted: bool) {}

        fn is_muted(&self) -> bool {
            false
        }

        fn input_level(&self) -> f32 {
            0.0
        }
    }

    /// Recorder, der Start/Stop in die gemeinsame Ereignisspur schreibt
    struct TraceRecorder {
        active: bool,
        trace: Trace,
    }

    impl Recorder for TraceRecorder {
        fn start(&mut self, _session_id: &str, _user_id: &str) {
            if self.active {
                return;
            }
            self.active = true;
            self.trace.lock().push("recorder_start");
        }

        fn stop(&mut self) {
            if !self.active {
                return;
            }
            self.active = false;
            self.trace.lock().push("recorder_stop");
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    /// Playback, das jede Übergabe in die Ereignisspur schreibt
    struct TracePlayback {
        trace: Trace,
        played: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl PlaybackSink for TracePlayback {
        fn play(&mut self, pcm: &[u8]) -> Result<(), MediaError> {
            self.trace.lock().push("play");
            self.played.lock().push(pcm.to_vec());
            Ok(())
        }
    }

    /// Sink, der alle Kommandos als JSON aufzeichnet
    struct VecSink {
        commands: Mutex<Vec<serde_json::Value>>,
    }

    impl VecSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
            })
        }

        fn of_type(&self, discriminator: &str) -> Vec<serde_json::Value> {
            self.commands
                .lock()
                .iter()
                .filter(|c| c["type"] == discriminator || c["event"] == discriminator)
                .cloned()
                .collect()
        }
    }

    impl CommandSink for VecSink {
        fn send(&self, cmd: ClientCommand) {
            let json = serde_json::to_value(&cmd).unwrap();
            self.commands.lock().push(json);
        }
    }

    struct FakePeerLink {
        destroy_count: Arc<AtomicUsize>,
        signals: Arc<Mutex<Vec<SignalPayload>>>,
        destroyed: bool,
    }

    impl PeerLink for FakePeerLink {
        fn signal(&mut self, payload: SignalPayload) {
            self.signals.lock().push(payload);
        }

        fn destroy(&mut self) {
            if self.destroyed {
                return;
            }
            self.destroyed = true;
            self.destroy_count.fetch_add(1, Ordering::SeqCst);
        }

        fn is_destroyed(&self) -> bool {
            self.destroyed
        }
    }

    impl Drop for FakePeerLink {
        fn drop(&mut self) {
            // Drop zählt nicht als destroy; der Test prüft explizite Aufrufe
        }
    }

    struct FakePeerFactory {
        roles: Mutex<Vec<PeerRole>>,
        destroy_count: Arc<AtomicUsize>,
        signals: Arc<Mutex<Vec<SignalPayload>>>,
    }

    impl FakePeerFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                roles: Mutex::new(Vec::new()),
                destroy_count: Arc::new(AtomicUsize::new(0)),
                signals: Arc::new(Mutex::new(Vec::new())),
            })
        }
    }

    impl PeerFactory for FakePeerFactory {
        fn create(
            &self,
            role: PeerRole,
            _local_stream: Option<StreamHandle>,
            _events: mpsc::Sender<PeerEvent>,
        ) -> Result<Box<dyn PeerLink>, PeerError> {
            self.roles.lock().push(role);
            Ok(Box::new(FakePeerLink {
                destroy_count: Arc::clone(&self.destroy_count),
                signals: Arc::clone(&self.signals),
                destroyed: false,
            }))
        }
    }

    // ------------------------------------------------------------------------
    // Aufbau
    // ------------------------------------------------------------------------

    struct Harness {
        controller: CallSessionController,
        trace: Trace,
        sink: Arc<VecSink>,
        factory: Arc<FakePeerFactory>,
        played: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    fn harness() -> Harness {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let sink = VecSink::new();
        let factory = FakePeerFactory::new();
        let played = Arc::new(Mutex::new(Vec::new()));
        let (peer_tx, _peer_rx) = mpsc::channel(8);

        let controller = CallSessionController::new(
            "alice".to_string(),
            Arc::new(Mutex::new(FakeCapture::new())),
            Box::new(TraceRecorder {
                active: false,
                trace: Arc::clone(&trace),
            }),
            Box::new(TracePlayback {
                trace: Arc::clone(&trace),
                played: Arc::clone(&played),
            }),
            Arc::clone(&sink) as Arc<dyn CommandSink>,
            Arc::clone(&factory) as Arc<dyn PeerFactory>,
            peer_tx,
        );

        Harness {
            controller,
            trace,
            sink,
            factory,
            played,
        }
    }

    fn agent(msg: AgentMessage) -> ServerMessage {
        ServerMessage::Agent(msg)
    }

    fn peer(msg: PeerMessage) -> ServerMessage {
        ServerMessage::Peer(msg)
    }

    fn ai_audio(bytes: &[u8]) -> ServerMessage {
        agent(AgentMessage::AiAudio {
            audio: BASE64.encode(bytes),
            is_greeting: false,
        })
    }

    /// Prüft die Kerninvariante über eine Ereignisspur: während einer
    /// aktiven Aufnahme darf keine Wiedergabe übergeben werden
    fn assert_never_capturing_while_playing(trace: &Trace) {
        let mut capturing = false;
        for entry in trace.lock().iter() {
            match *entry {
                "recorder_start" => capturing = true,
                "recorder_stop" => capturing = false,
                "play" => assert!(!capturing, "playback while recorder active"),
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------------
    // Mode B — Agent Session
    // ------------------------------------------------------------------------

    #[test]
    fn test_init_session_sends_exactly_one_start_conversation() {
        let mut h = harness();

        h.controller.init_session().unwrap();
        assert_eq!(h.controller.status(), CallStatus::Calling);
        assert_eq!(h.sink.of_type("init_session").len(), 1);

        let session_id = h.controller.session().unwrap().id.clone();
        h.controller.handle_message(agent(AgentMessage::SessionInitialized {
            session_id: session_id.clone(),
        }));

        assert_eq!(h.controller.status(), CallStatus::Connected);
        let starts = h.sink.of_type("start_conversation");
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0]["session_id"], session_id.as_str());

        // Ein Duplikat löst keinen zweiten Send aus
        h.controller.handle_message(agent(AgentMessage::SessionInitialized {
            session_id,
        }));
        assert_eq!(h.sink.of_type("start_conversation").len(), 1);
        assert_eq!(h.controller.status(), CallStatus::Connected);
    }

    #[test]
    fn test_init_session_twice_fails() {
        let mut h = harness();
        h.controller.init_session().unwrap();
        assert!(matches!(
            h.controller.init_session(),
            Err(SessionError::AlreadyInCall)
        ));
    }

    #[test]
    fn test_greeting_stops_plays_and_rearms() {
        let mut h = harness();
        h.controller.init_session().unwrap();
        let session_id = h.controller.session().unwrap().id.clone();
        h.controller
            .handle_message(agent(AgentMessage::SessionInitialized { session_id }));
        assert_eq!(h.controller.turn_state(), TurnState::AwaitingResponse);

        h.controller.handle_message(agent(AgentMessage::AiAudio {
            audio: BASE64.encode(b"hello"),
            is_greeting: true,
        }));

        // genau eine Wiedergabe, danach läuft der Recorder wieder
        let trace = h.trace.lock().clone();
        assert_eq!(
            trace.iter().filter(|e| **e == "play").count(),
            1,
            "trace: {:?}",
            trace
        );
        assert_eq!(*trace.last().unwrap(), "recorder_start");
        assert_eq!(*h.played.lock(), vec![b"hello".to_vec()]);
        assert_eq!(h.controller.turn_state(), TurnState::Capturing);
        assert_eq!(h.controller.status(), CallStatus::Connected);
        assert_never_capturing_while_playing(&h.trace);
    }

    #[test]
    fn test_ai_audio_sequence_stop_play_rearm() {
        let mut h = harness();
        h.controller.init_session().unwrap();
        let session_id = h.controller.session().unwrap().id.clone();
        h.controller
            .handle_message(agent(AgentMessage::SessionInitialized { session_id }));

        // Erste Antwort armiert den Recorder
        h.controller.handle_message(ai_audio(b"first"));
        h.trace.lock().clear();

        // Zweite Antwort muss die volle Stop/Play/Rearm-Sequenz fahren
        h.controller.handle_message(ai_audio(b"second"));

        assert_eq!(
            *h.trace.lock(),
            vec!["recorder_stop", "play", "recorder_start"]
        );
        assert_eq!(h.controller.turn_state(), TurnState::Capturing);
        assert_eq!(h.controller.status(), CallStatus::Connected);
    }

    #[test]
    fn test_turn_invariant_over_long_sequence() {
        let mut h = harness();
        h.controller.init_session().unwrap();
        let session_id = h.controller.session().unwrap().id.clone();
        h.controller
            .handle_message(agent(AgentMessage::SessionInitialized { session_id }));

        for _ in 0..5 {
            h.controller.handle_message(ai_audio(b"turn"));
            h.controller.handle_message(agent(AgentMessage::Transcript {
                text: "...".to_string(),
            }));
        }

        assert_never_capturing_while_playing(&h.trace);
    }

    #[test]
    fn test_undecodable_audio_still_rearms() {
        let mut h = harness();
        h.controller.init_session().unwrap();
        let session_id = h.controller.session().unwrap().id.clone();
        h.controller
            .handle_message(agent(AgentMessage::SessionInitialized { session_id }));

        h.controller.handle_message(agent(AgentMessage::AiAudio {
            audio: "kein base64!".to_string(),
            is_greeting: false,
        }));

        // keine Wiedergabe, aber die Session bleibt handlungsfähig
        assert_eq!(h.trace.lock().iter().filter(|e| **e == "play").count(), 0);
        assert_eq!(h.controller.status(), CallStatus::Connected);
        assert_eq!(h.controller.turn_state(), TurnState::Capturing);
    }

    #[test]
    fn test_session_ended_cleans_up_from_any_state() {
        let mut h = harness();
        h.controller.init_session().unwrap();
        let session_id = h.controller.session().unwrap().id.clone();
        h.controller
            .handle_message(agent(AgentMessage::SessionInitialized {
                session_id: session_id.clone(),
            }));
        h.controller.handle_message(ai_audio(b"turn"));

        h.controller.handle_message(agent(AgentMessage::SessionEnded {
            session_id: session_id.clone(),
        }));

        assert_eq!(h.controller.status(), CallStatus::Idle);
        assert_eq!(h.controller.turn_state(), TurnState::Idle);
        assert_eq!(*h.trace.lock().last().unwrap(), "recorder_stop");

        // Aufräumen ist idempotent
        h.controller
            .handle_message(agent(AgentMessage::SessionEnded { session_id }));
        assert_eq!(h.controller.status(), CallStatus::Idle);
    }

    #[test]
    fn test_late_ai_audio_after_session_end_is_dropped() {
        let mut h = harness();
        h.controller.init_session().unwrap();
        let session_id = h.controller.session().unwrap().id.clone();
        h.controller
            .handle_message(agent(AgentMessage::SessionInitialized {
                session_id: session_id.clone(),
            }));
        h.controller
            .handle_message(agent(AgentMessage::SessionEnded { session_id }));
        h.trace.lock().clear();

        // Eine verspätete Antwort nach dem bestätigten Ende verfällt
        h.controller.handle_message(ai_audio(b"too late"));

        assert!(h.trace.lock().is_empty());
        assert!(h.played.lock().is_empty());
        assert_eq!(h.controller.status(), CallStatus::Idle);
        assert_eq!(h.controller.turn_state(), TurnState::Idle);
    }

    #[test]
    fn test_session_ended_while_idle_is_harmless() {
        let mut h = harness();
        h.controller.handle_message(agent(AgentMessage::SessionEnded {
            session_id: "unknown".to_string(),
        }));
        assert_eq!(h.controller.status(), CallStatus::Idle);
    }

    #[test]
    fn test_error_message_does_not_change_status() {
        let mut h = harness();
        h.controller.init_session().unwrap();
        let session_id = h.controller.session().unwrap().id.clone();
        h.controller
            .handle_message(agent(AgentMessage::SessionInitialized { session_id }));

        let mut events = h.controller.subscribe();
        h.controller.handle_message(agent(AgentMessage::Error {
            message: "agent overloaded".to_string(),
        }));

        assert_eq!(h.controller.status(), CallStatus::Connected);
        match events.try_recv() {
            Ok(SessionEvent::Error(message)) => assert_eq!(message, "agent overloaded"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_end_conversation_is_not_optimistic() {
        let mut h = harness();
        h.controller.init_session().unwrap();
        let session_id = h.controller.session().unwrap().id.clone();
        h.controller
            .handle_message(agent(AgentMessage::SessionInitialized { session_id }));

        h.controller.end_conversation().unwrap();

        // Status bleibt, bis der Server bestätigt
        assert_eq!(h.controller.status(), CallStatus::Connected);
        assert_eq!(h.sink.of_type("end_session").len(), 1);
    }

    #[test]
    fn test_end_conversation_without_session_fails() {
        let h = harness();
        assert!(matches!(
            h.controller.end_conversation(),
            Err(SessionError::NoActiveSession)
        ));
    }

    // ------------------------------------------------------------------------
    // Mode A — Peer Call
    // ------------------------------------------------------------------------

    #[test]
    fn test_start_call_creates_initiator_link() {
        let mut h = harness();

        h.controller.start_call("peer-42").unwrap();

        assert_eq!(h.controller.status(), CallStatus::Calling);
        assert_eq!(*h.factory.roles.lock(), vec![PeerRole::Initiator]);
    }

    #[test]
    fn test_local_signal_is_relayed_to_target() {
        let mut h = harness();
        h.controller.start_call("peer-42").unwrap();

        let signal = SignalPayload::new(serde_json::json!({ "type": "offer", "sdp": "v=0" }));
        h.controller.handle_peer_event(PeerEvent::LocalSignal(signal));

        let sent = h.sink.of_type("startInterview");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["to"], "peer-42");
        assert_eq!(sent[0]["signalData"]["sdp"], "v=0");
    }

    #[test]
    fn test_call_accepted_connects_and_feeds_link() {
        let mut h = harness();
        h.controller.start_call("peer-42").unwrap();

        let signal = SignalPayload::new(serde_json::json!({ "type": "answer", "sdp": "v=0" }));
        h.controller
            .handle_message(peer(PeerMessage::CallAccepted { signal }));

        assert_eq!(h.controller.status(), CallStatus::Connected);
        assert_eq!(h.factory.signals.lock().len(), 1);
    }

    #[test]
    fn test_call_user_populates_details_without_transition() {
        let mut h = harness();

        let signal = SignalPayload::new(serde_json::json!({ "type": "offer", "sdp": "v=0" }));
        h.controller
            .handle_message(peer(PeerMessage::CallUser {
                from: "peer-7".to_string(),
                signal,
            }));

        assert_eq!(h.controller.status(), CallStatus::Idle);
        let details = h.controller.call_details().unwrap();
        assert_eq!(details.identifier, "peer-7");
        assert!(details.signal.is_some());
    }

    #[test]
    fn test_call_user_replaces_previous_offer() {
        let mut h = harness();

        for from in ["peer-1", "peer-2"] {
            h.controller.handle_message(peer(PeerMessage::CallUser {
                from: from.to_string(),
                signal: SignalPayload::new(serde_json::json!({ "sdp": "v=0" })),
            }));
        }

        assert_eq!(h.controller.call_details().unwrap().identifier, "peer-2");
    }

    #[test]
    fn test_call_ended_destroys_link_exactly_once() {
        let mut h = harness();
        h.controller.start_call("peer-42").unwrap();
        h.controller.handle_message(peer(PeerMessage::CallAccepted {
            signal: SignalPayload::new(serde_json::json!({ "sdp": "v=0" })),
        }));
        assert_eq!(h.controller.status(), CallStatus::Connected);

        let mut events = h.controller.subscribe();
        h.controller.handle_message(peer(PeerMessage::CallEnded));

        assert_eq!(h.controller.status(), CallStatus::Ended);
        assert_eq!(h.factory.destroy_count.load(Ordering::SeqCst), 1);

        // terminal: Reset wird signalisiert
        let mut saw_reset = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Reset) {
                saw_reset = true;
            }
        }
        assert!(saw_reset);
    }

    #[test]
    fn test_leave_call_mirrors_call_ended() {
        let mut h = harness();
        h.controller.start_call("peer-42").unwrap();

        h.controller.leave_call();

        assert_eq!(h.controller.status(), CallStatus::Ended);
        assert_eq!(h.factory.destroy_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_accept_call_clears_details() {
        let mut h = harness();
        h.controller.handle_message(peer(PeerMessage::CallUser {
            from: "peer-7".to_string(),
            signal: SignalPayload::new(serde_json::json!({ "type": "offer", "sdp": "v=0" })),
        }));

        h.controller.accept_call().unwrap();

        assert!(h.controller.call_details().is_none());
        assert_eq!(h.controller.status(), CallStatus::Connected);
        assert_eq!(*h.factory.roles.lock(), vec![PeerRole::Responder]);
        // das gespeicherte Offer wurde in den Link gespeist
        assert_eq!(h.factory.signals.lock().len(), 1);
    }

    #[test]
    fn test_accept_call_while_connected_fails() {
        let mut h = harness();
        h.controller.start_call("peer-42").unwrap();
        h.controller.handle_message(peer(PeerMessage::CallAccepted {
            signal: SignalPayload::new(serde_json::json!({ "sdp": "v=0" })),
        }));
        assert_eq!(h.controller.status(), CallStatus::Connected);

        // Zweites Offer mitten im Anruf
        h.controller.handle_message(peer(PeerMessage::CallUser {
            from: "peer-7".to_string(),
            signal: SignalPayload::new(serde_json::json!({ "type": "offer", "sdp": "v=0" })),
        }));

        // Annahme scheitert, der laufende Link bleibt unangetastet
        assert!(matches!(
            h.controller.accept_call(),
            Err(SessionError::AlreadyInCall)
        ));
        assert_eq!(h.controller.status(), CallStatus::Connected);
        assert_eq!(h.factory.destroy_count.load(Ordering::SeqCst), 0);
        assert_eq!(*h.factory.roles.lock(), vec![PeerRole::Initiator]);
        assert!(h.controller.call_details().is_some());
    }

    #[test]
    fn test_teardown_on_idle_controller_emits_nothing() {
        let mut h = harness();
        let mut events = h.controller.subscribe();

        h.controller.leave_call();
        h.controller.handle_message(peer(PeerMessage::CallEnded));

        // abfragbarer Zustand und Event-Strom bleiben deckungsgleich
        assert_eq!(h.controller.status(), CallStatus::Idle);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_reject_call_clears_details() {
        let mut h = harness();
        h.controller.handle_message(peer(PeerMessage::CallUser {
            from: "peer-7".to_string(),
            signal: SignalPayload::new(serde_json::json!({ "sdp": "v=0" })),
        }));

        h.controller.reject_call();

        assert!(h.controller.call_details().is_none());
        assert_eq!(h.controller.status(), CallStatus::Idle);
    }

    #[test]
    fn test_start_call_fails_without_device() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let sink = VecSink::new();
        let factory = FakePeerFactory::new();
        let (peer_tx, _peer_rx) = mpsc::channel(8);

        let mut controller = CallSessionController::new(
            "alice".to_string(),
            Arc::new(Mutex::new(BrokenCapture)),
            Box::new(TraceRecorder {
                active: false,
                trace: Arc::clone(&trace),
            }),
            Box::new(TracePlayback {
                trace,
                played: Arc::new(Mutex::new(Vec::new())),
            }),
            sink as Arc<dyn CommandSink>,
            factory as Arc<dyn PeerFactory>,
            peer_tx,
        );

        // Geräte-Fehler: kein Anruf, kein Zustandswechsel
        assert!(matches!(
            controller.start_call("peer-42"),
            Err(SessionError::Media(_))
        ));
        assert_eq!(controller.status(), CallStatus::Idle);
    }

    #[test]
    fn test_peer_failure_ends_session() {
        let mut h = harness();
        h.controller.start_call("peer-42").unwrap();

        h.controller
            .handle_peer_event(PeerEvent::Failed("ice failed".to_string()));

        assert_eq!(h.controller.status(), CallStatus::Ended);
        assert_eq!(h.factory.destroy_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capture_mode_switch_reacquires_device() {
        let capture = Arc::new(Mutex::new(FakeCapture::new()));
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let sink = VecSink::new();
        let factory = FakePeerFactory::new();
        let (peer_tx, _peer_rx) = mpsc::channel(8);

        let mut controller = CallSessionController::new(
            "alice".to_string(),
            Arc::clone(&capture) as Arc<Mutex<dyn CaptureSource>>,
            Box::new(TraceRecorder {
                active: false,
                trace: Arc::clone(&trace),
            }),
            Box::new(TracePlayback {
                trace,
                played: Arc::new(Mutex::new(Vec::new())),
            }),
            sink as Arc<dyn CommandSink>,
            factory as Arc<dyn PeerFactory>,
            peer_tx,
        );

        controller.start_call("peer-42").unwrap();
        let first = controller.local_stream().unwrap();

        let second = controller.set_capture_mode(CaptureMode::Audio).unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(capture.lock().releases, 1);
        assert_eq!(capture.lock().acquires, 2);
        // abhängiger Effekt, keine Status-Transition
        assert_eq!(controller.status(), CallStatus::Calling);
    }

    #[test]
    fn test_remote_stream_is_exposed() {
        let mut h = harness();
        h.controller.start_call("peer-42").unwrap();

        let handle = StreamHandle::new(CaptureMode::Audio);
        h.controller
            .handle_peer_event(PeerEvent::RemoteStream(handle));

        assert_eq!(h.controller.remote_stream(), Some(handle));
    }
}
