//! Implementaciones falsas del transporte para tests: transiciones
//! guionadas desde el test y contadores de operaciones.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::music::transport::{
    AudioResource, GatewayEvent, GatewaySnapshot, GatewayStatus, PlayerEvent, PlayerHandle,
    PlayerSnapshot, PlayerStatus, VoiceGateway,
};

pub(crate) struct FakePlayer {
    status: Mutex<PlayerStatus>,
    current: Mutex<Option<AudioResource>>,
    tx: broadcast::Sender<PlayerEvent>,
    played: Mutex<Vec<AudioResource>>,
    pauses: AtomicUsize,
    unpauses: AtomicUsize,
    stops: AtomicUsize,
}

impl FakePlayer {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            status: Mutex::new(PlayerStatus::Idle),
            current: Mutex::new(None),
            tx,
            played: Mutex::new(Vec::new()),
            pauses: AtomicUsize::new(0),
            unpauses: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn set_status(&self, status: PlayerStatus) {
        *self.status.lock() = status;
    }

    fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            status: *self.status.lock(),
            resource: self.current.lock().clone(),
        }
    }

    /// Termina la pista en curso, como haría el driver al agotarse el
    /// audio.
    pub fn finish_current(&self) {
        let old = self.snapshot();
        *self.status.lock() = PlayerStatus::Idle;
        *self.current.lock() = None;
        let _ = self.tx.send(PlayerEvent::StateChange {
            old,
            new: PlayerSnapshot::idle(),
        });
    }

    /// Reporta un error del reproductor sobre el recurso en curso.
    pub fn fail_current(&self, message: &str) {
        if let Some(resource) = self.current.lock().take() {
            *self.status.lock() = PlayerStatus::Idle;
            let _ = self.tx.send(PlayerEvent::Error {
                resource,
                message: message.to_string(),
            });
        }
    }

    pub fn played_titles(&self) -> Vec<String> {
        self.played
            .lock()
            .iter()
            .filter_map(|r| r.track())
            .map(|t| t.metadata().title().to_string())
            .collect()
    }

    pub fn last_played(&self) -> Option<AudioResource> {
        self.played.lock().last().cloned()
    }

    pub fn pause_count(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn unpause_count(&self) -> usize {
        self.unpauses.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlayerHandle for FakePlayer {
    fn status(&self) -> PlayerStatus {
        *self.status.lock()
    }

    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    async fn play(&self, resource: AudioResource) {
        let old = self.snapshot();
        self.played.lock().push(resource.clone());
        *self.current.lock() = Some(resource.clone());
        *self.status.lock() = PlayerStatus::Playing;
        let _ = self.tx.send(PlayerEvent::StateChange {
            old,
            new: PlayerSnapshot {
                status: PlayerStatus::Playing,
                resource: Some(resource),
            },
        });
    }

    async fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        *self.status.lock() = PlayerStatus::Paused;
    }

    async fn unpause(&self) {
        self.unpauses.fetch_add(1, Ordering::SeqCst);
        *self.status.lock() = PlayerStatus::Playing;
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.status.lock() = PlayerStatus::Idle;
        *self.current.lock() = None;
    }
}

pub(crate) struct FakeGateway {
    status: Mutex<GatewayStatus>,
    attempts: AtomicU32,
    tx: broadcast::Sender<GatewayEvent>,
    rejoins: AtomicUsize,
    disconnects: AtomicUsize,
    destroys: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            status: Mutex::new(GatewayStatus::Ready),
            attempts: AtomicU32::new(0),
            tx,
            rejoins: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        })
    }

    /// Transiciona al estado dado emitiendo el evento correspondiente.
    pub fn transition(&self, new: GatewaySnapshot) {
        let old = std::mem::replace(&mut *self.status.lock(), new.status);
        let _ = self.tx.send(GatewayEvent::StateChange { old, new });
    }

    pub fn set_attempts(&self, attempts: u32) {
        self.attempts.store(attempts, Ordering::SeqCst);
    }

    pub fn rejoin_count(&self) -> usize {
        self.rejoins.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn destroy_count(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceGateway for FakeGateway {
    fn status(&self) -> GatewayStatus {
        *self.status.lock()
    }

    fn rejoin_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    async fn rejoin(&self) {
        self.rejoins.fetch_add(1, Ordering::SeqCst);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self.status.lock() = GatewayStatus::Connecting;
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        *self.status.lock() = GatewayStatus::Disconnected;
    }

    async fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.transition(GatewaySnapshot::of(GatewayStatus::Destroyed));
    }
}
