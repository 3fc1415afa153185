//! Adaptador de producción del transporte sobre songbird.
//!
//! [`SongbirdGateway`] y [`SongbirdPlayer`] traducen los eventos del
//! driver de voz a las transiciones tipadas que consume la suscripción.
//! El resto del crate nunca toca songbird directamente.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use songbird::events::context_data::DisconnectReason;
use songbird::input::{AudioStream, Input, LiveInput};
use songbird::model::CloseCode;
use songbird::tracks::{PlayMode, TrackHandle};
use songbird::{
    Call, CoreEvent, Event as DriverEvent, EventContext, EventHandler as DriverEventHandler,
    Songbird, TrackEvent,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use symphonia::core::io::{MediaSource, ReadOnlySource};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::music::transport::{
    logarithmic_to_amplitude, AudioResource, GatewayEvent, GatewaySnapshot, GatewayStatus,
    PlayerEvent, PlayerHandle, PlayerSnapshot, PlayerStatus, VoiceGateway, WS_CLOSE_DISCONNECTED,
};
use crate::sources::StreamGuard;

/// Une el canal de voz y devuelve el par conexión/reproductor ya
/// cableado a los eventos del driver.
pub async fn connect(
    manager: Arc<Songbird>,
    guild_id: GuildId,
    channel_id: ChannelId,
) -> anyhow::Result<(Arc<SongbirdGateway>, Arc<SongbirdPlayer>)> {
    let gateway_shared = Arc::new(GatewayShared::new());
    gateway_shared.transition(GatewaySnapshot::of(GatewayStatus::Signalling));

    let call = manager.join(guild_id, channel_id).await?;
    gateway_shared.transition(GatewaySnapshot::of(GatewayStatus::Connecting));

    let relay = ConnectionRelay {
        shared: gateway_shared.clone(),
    };
    {
        let mut call_guard = call.lock().await;
        call_guard.add_global_event(DriverEvent::Core(CoreEvent::DriverConnect), relay.clone());
        call_guard.add_global_event(DriverEvent::Core(CoreEvent::DriverReconnect), relay.clone());
        call_guard.add_global_event(DriverEvent::Core(CoreEvent::DriverDisconnect), relay);
    }

    let gateway = Arc::new(SongbirdGateway {
        manager,
        guild_id,
        channel_id,
        shared: gateway_shared,
    });
    let player = Arc::new(SongbirdPlayer {
        call,
        shared: Arc::new(PlayerShared::new()),
    });
    Ok((gateway, player))
}

struct GatewayShared {
    status: Mutex<GatewayStatus>,
    attempts: AtomicU32,
    tx: broadcast::Sender<GatewayEvent>,
}

impl GatewayShared {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            status: Mutex::new(GatewayStatus::Signalling),
            attempts: AtomicU32::new(0),
            tx,
        }
    }

    fn transition(&self, new: GatewaySnapshot) {
        let old = std::mem::replace(&mut *self.status.lock(), new.status);
        let _ = self.tx.send(GatewayEvent::StateChange { old, new });
    }
}

/// Conexión de voz de un guild respaldada por songbird.
pub struct SongbirdGateway {
    manager: Arc<Songbird>,
    guild_id: GuildId,
    channel_id: ChannelId,
    shared: Arc<GatewayShared>,
}

#[async_trait]
impl VoiceGateway for SongbirdGateway {
    fn status(&self) -> GatewayStatus {
        *self.shared.status.lock()
    }

    fn rejoin_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.shared.tx.subscribe()
    }

    async fn rejoin(&self) {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        self.shared
            .transition(GatewaySnapshot::of(GatewayStatus::Connecting));
        if let Err(error) = self.manager.join(self.guild_id, self.channel_id).await {
            warn!("🔌 Reconexión de voz falló: {error}");
            let _ = self.shared.tx.send(GatewayEvent::Error {
                message: error.to_string(),
            });
        }
    }

    async fn disconnect(&self) {
        // Silencioso a propósito: la limpieza final no debe re-disparar
        // la lógica de reconexión.
        *self.shared.status.lock() = GatewayStatus::Disconnected;
        if let Err(error) = self.manager.remove(self.guild_id).await {
            debug!("🔌 Remove al desconectar: {error}");
        }
    }

    async fn destroy(&self) {
        if let Err(error) = self.manager.remove(self.guild_id).await {
            debug!("🔌 Remove al destruir: {error}");
        }
        self.shared
            .transition(GatewaySnapshot::of(GatewayStatus::Destroyed));
    }
}

#[derive(Clone)]
struct ConnectionRelay {
    shared: Arc<GatewayShared>,
}

#[async_trait]
impl DriverEventHandler for ConnectionRelay {
    async fn act(&self, context: &EventContext<'_>) -> Option<DriverEvent> {
        match context {
            EventContext::DriverConnect(_) | EventContext::DriverReconnect(_) => {
                self.shared.attempts.store(0, Ordering::SeqCst);
                self.shared.transition(GatewaySnapshot::of(GatewayStatus::Ready));
            }
            EventContext::DriverDisconnect(data) => {
                // Solo el cierre 4014 es significativo aguas arriba; el
                // resto de los motivos se tratan igual.
                let close_code = match &data.reason {
                    Some(DisconnectReason::WsClosed(Some(CloseCode::Disconnected))) => {
                        Some(WS_CLOSE_DISCONNECTED)
                    }
                    Some(reason) => {
                        let _ = self.shared.tx.send(GatewayEvent::Error {
                            message: format!("{reason:?}"),
                        });
                        None
                    }
                    None => None,
                };
                self.shared.transition(GatewaySnapshot {
                    status: GatewayStatus::Disconnected,
                    close_code,
                });
            }
            _ => {}
        }
        None
    }
}

struct CurrentTrack {
    handle: TrackHandle,
    resource: AudioResource,
    generation: u64,
    /// Mantiene vivo el proceso productor hasta que la pista termina.
    _guard: Option<StreamGuard>,
}

struct PlayerShared {
    status: Mutex<PlayerStatus>,
    current: Mutex<Option<CurrentTrack>>,
    generation: AtomicU64,
    tx: broadcast::Sender<PlayerEvent>,
}

impl PlayerShared {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            status: Mutex::new(PlayerStatus::Idle),
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            tx,
        }
    }

    fn current_generation(&self) -> u64 {
        self.current
            .lock()
            .as_ref()
            .map(|current| current.generation)
            .unwrap_or(0)
    }

    fn set_status(&self, status: PlayerStatus) -> PlayerStatus {
        std::mem::replace(&mut *self.status.lock(), status)
    }

    /// Publica el arranque de una pista nueva. La confirmación `Play`
    /// del driver llega después, con el estado ya en `Playing`, y no se
    /// duplica.
    fn begin_playback(&self, old_resource: Option<AudioResource>, resource: &AudioResource) {
        let old_status = self.set_status(PlayerStatus::Playing);
        let _ = self.tx.send(PlayerEvent::StateChange {
            old: PlayerSnapshot {
                status: old_status,
                resource: old_resource,
            },
            new: PlayerSnapshot {
                status: PlayerStatus::Playing,
                resource: Some(resource.clone()),
            },
        });
    }

    /// Confirmación `Play` del driver: emite solo si hubo transición
    /// real (una des-pausa), nunca como eco del arranque.
    fn confirm_playing(&self, resource: &AudioResource) {
        let old_status = self.set_status(PlayerStatus::Playing);
        if old_status != PlayerStatus::Playing {
            let _ = self.tx.send(PlayerEvent::StateChange {
                old: PlayerSnapshot {
                    status: old_status,
                    resource: Some(resource.clone()),
                },
                new: PlayerSnapshot {
                    status: PlayerStatus::Playing,
                    resource: Some(resource.clone()),
                },
            });
        }
    }
}

/// Reproductor de un guild respaldado por el driver de songbird.
pub struct SongbirdPlayer {
    call: Arc<tokio::sync::Mutex<Call>>,
    shared: Arc<PlayerShared>,
}

#[async_trait]
impl PlayerHandle for SongbirdPlayer {
    fn status(&self) -> PlayerStatus {
        *self.shared.status.lock()
    }

    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.shared.tx.subscribe()
    }

    async fn play(&self, resource: AudioResource) {
        let Some(stream) = resource.take_stream() else {
            warn!("🎵 El recurso ya no tiene stream, se ignora");
            return;
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Reemplazo: la pista saliente se detiene con su generación ya
        // obsoleta, así su evento End no se confunde con un fin real.
        let previous = self.shared.current.lock().take();
        if let Some(previous) = &previous {
            let _ = previous.handle.stop();
        }

        let media: Box<dyn MediaSource> = Box::new(ReadOnlySource::new(stream.reader));
        let input = Input::Live(
            LiveInput::Raw(AudioStream {
                input: media,
                hint: None,
            }),
            None,
        );
        let handle = self.call.lock().await.play_input(input);

        let volume_handle = handle.clone();
        resource.volume().attach_sink(Box::new(move |raw| {
            let _ = volume_handle.set_volume(logarithmic_to_amplitude(raw));
        }));

        let relay = TrackRelay {
            shared: self.shared.clone(),
            resource: resource.clone(),
            generation,
        };
        for event in [TrackEvent::Play, TrackEvent::Pause, TrackEvent::End, TrackEvent::Error] {
            let _ = handle.add_event(DriverEvent::Track(event), relay.clone());
        }

        *self.shared.current.lock() = Some(CurrentTrack {
            handle,
            resource: resource.clone(),
            generation,
            _guard: stream.guard,
        });
        self.shared
            .begin_playback(previous.map(|p| p.resource), &resource);
    }

    async fn pause(&self) {
        if let Some(current) = self.shared.current.lock().as_ref() {
            let _ = current.handle.pause();
            self.shared.set_status(PlayerStatus::Paused);
        }
    }

    async fn unpause(&self) {
        if let Some(current) = self.shared.current.lock().as_ref() {
            let _ = current.handle.play();
            self.shared.set_status(PlayerStatus::Playing);
        }
    }

    async fn stop(&self) {
        // Bump de generación para que el End del stop no se propague
        // como fin de pista.
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(current) = self.shared.current.lock().take() {
            let _ = current.handle.stop();
        }
        self.shared.set_status(PlayerStatus::Idle);
    }
}

#[derive(Clone)]
struct TrackRelay {
    shared: Arc<PlayerShared>,
    resource: AudioResource,
    generation: u64,
}

impl TrackRelay {
    fn is_current(&self) -> bool {
        self.generation == self.shared.current_generation()
    }
}

#[async_trait]
impl DriverEventHandler for TrackRelay {
    async fn act(&self, context: &EventContext<'_>) -> Option<DriverEvent> {
        let EventContext::Track(tracks) = context else {
            return None;
        };
        let Some((state, _)) = tracks.first() else {
            return None;
        };

        match &state.playing {
            PlayMode::Play if self.is_current() => {
                self.shared.confirm_playing(&self.resource);
            }
            PlayMode::Pause if self.is_current() => {
                let old_status = self.shared.set_status(PlayerStatus::Paused);
                let _ = self.shared.tx.send(PlayerEvent::StateChange {
                    old: PlayerSnapshot {
                        status: old_status,
                        resource: Some(self.resource.clone()),
                    },
                    new: PlayerSnapshot {
                        status: PlayerStatus::Paused,
                        resource: Some(self.resource.clone()),
                    },
                });
            }
            PlayMode::Stop | PlayMode::End if self.is_current() => {
                self.shared.current.lock().take();
                let old_status = self.shared.set_status(PlayerStatus::Idle);
                let _ = self.shared.tx.send(PlayerEvent::StateChange {
                    old: PlayerSnapshot {
                        status: old_status,
                        resource: Some(self.resource.clone()),
                    },
                    new: PlayerSnapshot::idle(),
                });
            }
            PlayMode::Errored(error) if self.is_current() => {
                let _ = self.shared.tx.send(PlayerEvent::Error {
                    resource: self.resource.clone(),
                    message: error.to_string(),
                });
            }
            _ => {}
        }
        None
    }
}
