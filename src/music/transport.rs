//! Abstracción tipada sobre el transporte de voz.
//!
//! El núcleo de reproducción no habla con songbird directamente: consume
//! dos máquinas de estado externas (conexión de voz y reproductor de
//! audio) a través de los traits [`VoiceGateway`] y [`PlayerHandle`],
//! con eventos de transición como uniones etiquetadas en lugar de
//! nombres de evento ad-hoc. Eso permite probar la suscripción completa
//! contra implementaciones falsas.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::io::{Cursor, Read};
use std::sync::{Arc, Weak};
use std::time::Duration;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::music::track::Track;
use crate::sources::{ByteStream, StreamGuard};

/// Código de cierre del websocket de voz cuando el bot fue movido de
/// canal o expulsado (ambiguo desde la señal sola).
pub const WS_CLOSE_DISCONNECTED: u16 = 4014;

/// Exponente de la curva logarítmica de volumen, idéntico al del
/// transformador de volumen upstream para que "ganancia logarítmica"
/// signifique lo mismo en ambos lados.
pub const LOGARITHMIC_EXPONENT: f32 = 1.660_964;

/// Convierte una ganancia logarítmica cruda en amplitud lineal.
pub fn logarithmic_to_amplitude(raw: f32) -> f32 {
    raw.max(0.0).powf(LOGARITHMIC_EXPONENT)
}

/// Fallos de reproducción contenidos dentro del núcleo.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("el productor de stream falló: {0}")]
    StreamCreation(String),
    #[error("el productor devolvió un stream vacío")]
    EmptyStream,
    #[error("formato de audio no reconocido: {0}")]
    UnsupportedFormat(String),
    #[error("error del reproductor: {0}")]
    Player(String),
    #[error("no se pudo generar pista relacionada: {0}")]
    Autoplay(String),
}

//------------------------------------------------------------//
// Conexión de voz
//------------------------------------------------------------//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Signalling,
    Connecting,
    Ready,
    Disconnected,
    Destroyed,
}

/// Estado observado de la conexión en el momento de una transición.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySnapshot {
    pub status: GatewayStatus,
    /// Código de cierre del websocket, si la transición vino de ahí.
    pub close_code: Option<u16>,
}

impl GatewaySnapshot {
    pub fn of(status: GatewayStatus) -> Self {
        Self {
            status,
            close_code: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    StateChange {
        old: GatewayStatus,
        new: GatewaySnapshot,
    },
    /// Error de transporte que no altera el estado por sí solo.
    Error { message: String },
}

/// Conexión de voz de un guild, propiedad exclusiva de una suscripción.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    fn status(&self) -> GatewayStatus;

    /// Reintentos de reconexión acumulados desde la última conexión sana.
    fn rejoin_attempts(&self) -> u32;

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent>;

    async fn rejoin(&self);

    async fn disconnect(&self);

    async fn destroy(&self);
}

/// Espera a que la conexión alcance `target`, con fecha límite dura.
///
/// Equivalente al `entersState` del transporte original: devuelve
/// `false` si el plazo vence sin observar el estado pedido.
pub async fn enters_state(
    gateway: &dyn VoiceGateway,
    target: GatewayStatus,
    deadline: Duration,
) -> bool {
    let mut rx = gateway.subscribe();
    if gateway.status() == target {
        return true;
    }

    tokio::time::timeout(deadline, async move {
        loop {
            match rx.recv().await {
                Ok(GatewayEvent::StateChange { new, .. }) if new.status == target => return,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if gateway.status() == target {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // El emisor murió: agotar el plazo en lugar de afirmar nada.
                    std::future::pending::<()>().await;
                }
            }
        }
    })
    .await
    .is_ok()
}

//------------------------------------------------------------//
// Reproductor de audio
//------------------------------------------------------------//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Idle,
    Playing,
    Paused,
    Buffering,
}

/// Estado del reproductor junto con el recurso involucrado, para poder
/// recuperar la pista dueña desde un evento.
#[derive(Debug, Clone)]
pub struct PlayerSnapshot {
    pub status: PlayerStatus,
    pub resource: Option<AudioResource>,
}

impl PlayerSnapshot {
    pub fn idle() -> Self {
        Self {
            status: PlayerStatus::Idle,
            resource: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PlayerEvent {
    StateChange {
        old: PlayerSnapshot,
        new: PlayerSnapshot,
    },
    Error {
        resource: AudioResource,
        message: String,
    },
}

/// Reproductor de audio de un guild, propiedad exclusiva de una
/// suscripción.
#[async_trait]
pub trait PlayerHandle: Send + Sync {
    fn status(&self) -> PlayerStatus;

    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent>;

    async fn play(&self, resource: AudioResource);

    async fn pause(&self);

    async fn unpause(&self);

    async fn stop(&self);
}

//------------------------------------------------------------//
// Recursos reproducibles
//------------------------------------------------------------//

/// Control de volumen en línea de un recurso activo.
///
/// Guarda la ganancia logarítmica tal como se fijó; el driver instala
/// un sumidero que la traduce a amplitud sobre el track real.
#[derive(Clone)]
pub struct VolumeHandle {
    inner: Arc<VolumeInner>,
}

struct VolumeInner {
    raw: Mutex<f32>,
    sink: Mutex<Option<Box<dyn Fn(f32) + Send + Sync>>>,
}

impl VolumeHandle {
    fn new(initial: f32) -> Self {
        Self {
            inner: Arc::new(VolumeInner {
                raw: Mutex::new(initial),
                sink: Mutex::new(None),
            }),
        }
    }

    pub fn logarithmic(&self) -> f32 {
        *self.inner.raw.lock()
    }

    pub fn set_logarithmic(&self, raw: f32) {
        *self.inner.raw.lock() = raw;
        if let Some(sink) = self.inner.sink.lock().as_ref() {
            sink(raw);
        }
    }

    /// Instala el aplicador real de ganancia y le empuja el valor actual.
    pub fn attach_sink(&self, sink: Box<dyn Fn(f32) + Send + Sync>) {
        sink(self.logarithmic());
        *self.inner.sink.lock() = Some(sink);
    }
}

/// Stream ya sondeado, listo para entregarse al reproductor.
pub struct ProbedStream {
    pub reader: Box<dyn Read + Send + Sync>,
    pub guard: Option<StreamGuard>,
}

/// Recurso reproducible: stream sondeado + volumen en línea + referencia
/// débil a la pista dueña.
#[derive(Clone)]
pub struct AudioResource {
    inner: Arc<ResourceInner>,
}

struct ResourceInner {
    stream: Mutex<Option<ProbedStream>>,
    volume: VolumeHandle,
    track: Weak<Track>,
}

impl AudioResource {
    /// El volumen arranca en ganancia cero; la suscripción lo fija al
    /// valor real cuando el reproductor entra en `Playing`.
    pub fn new(stream: ProbedStream, track: Weak<Track>) -> Self {
        Self {
            inner: Arc::new(ResourceInner {
                stream: Mutex::new(Some(stream)),
                volume: VolumeHandle::new(0.0),
                track,
            }),
        }
    }

    pub fn volume(&self) -> &VolumeHandle {
        &self.inner.volume
    }

    pub fn track(&self) -> Option<Arc<Track>> {
        self.inner.track.upgrade()
    }

    /// Extrae el stream subyacente. Solo el driver debería llamarlo, una
    /// vez, al iniciar la reproducción.
    pub fn take_stream(&self) -> Option<ProbedStream> {
        self.inner.stream.lock().take()
    }

    /// Suelta el stream sin reproducirlo, terminando cualquier proceso
    /// productor que siga vivo.
    pub fn release_stream(&self) {
        self.inner.stream.lock().take();
    }
}

impl fmt::Debug for AudioResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let title = self
            .track()
            .map(|t| t.metadata().title().to_string())
            .unwrap_or_else(|| "<sin pista>".to_string());
        f.debug_struct("AudioResource")
            .field("track", &title)
            .field("volume", &self.inner.volume.logarithmic())
            .finish()
    }
}

/// Cuántos bytes iniciales se leen para detectar contenedor/códec.
const PROBE_PREFIX_LEN: u64 = 64 * 1024;

/// Sondea el inicio de un stream para confirmar que es un contenedor de
/// audio reconocible, sin consumirlo para la reproducción.
///
/// Lee un prefijo acotado a memoria, lo pasa por el probe de symphonia y
/// devuelve el prefijo encadenado con el resto del stream. Operación
/// bloqueante: llamarla desde `spawn_blocking`.
pub fn demux_probe(stream: ByteStream) -> Result<ProbedStream, PlaybackError> {
    let (mut reader, guard) = stream.into_parts();

    let mut prefix = Vec::new();
    reader
        .by_ref()
        .take(PROBE_PREFIX_LEN)
        .read_to_end(&mut prefix)
        .map_err(|e| PlaybackError::StreamCreation(e.to_string()))?;

    if prefix.is_empty() {
        return Err(PlaybackError::EmptyStream);
    }

    let source = ReadOnlySource::new(Cursor::new(prefix.clone()));
    let mss = MediaSourceStream::new(Box::new(source), Default::default());

    symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| PlaybackError::UnsupportedFormat(e.to_string()))?;

    Ok(ProbedStream {
        reader: Box::new(Cursor::new(prefix).chain(reader)),
        guard,
    })
}
