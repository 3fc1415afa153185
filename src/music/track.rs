//! Unidad de reproducción: metadatos + productor de stream perezoso.
//!
//! Una pista no descarga nada al encolarse; su audio se materializa
//! recién al reproducirla, y el productor es re-invocable para que los
//! modos de repetición vuelvan a crear el recurso sin re-encolar.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::music::recon::MusicReconnaissance;
use crate::music::transport::{demux_probe, AudioResource, PlaybackError};
use crate::sources::{tts, ytdlp, ByteStream};

/// Multiplicador por defecto para pistas TTS: la voz sintetizada llega
/// mucho más baja que la música, así que se empareja aquí y no con el
/// volumen global.
const TTS_VOLUME_MULTIPLIER: f32 = 5.0;

/// Función productora del stream crudo. Se invoca perezosamente, una vez
/// por reproducción.
pub type StreamCreator =
    Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<ByteStream>> + Send + Sync>;

/// Generador de sucesoras para autoplay. Si una pista no trae uno, se
/// usa la búsqueda de relacionados de `MusicReconnaissance`.
pub type RelatedGenerator =
    Arc<dyn Fn(&Arc<Track>) -> BoxFuture<'static, Result<Arc<Track>, PlaybackError>> + Send + Sync>;

/// Metadatos inmutables, etiquetados por origen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackMetadata {
    Remote {
        title: String,
        url: String,
    },
    /// Origen YouTube: único origen capaz de generar una sucesora
    /// relacionada para autoplay.
    YouTube {
        title: String,
        url: String,
    },
    TextToSpeech {
        title: String,
        text: String,
        provider: String,
        voice: String,
    },
}

impl TrackMetadata {
    pub fn title(&self) -> &str {
        match self {
            Self::Remote { title, .. }
            | Self::YouTube { title, .. }
            | Self::TextToSpeech { title, .. } => title,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Remote { url, .. } | Self::YouTube { url, .. } => Some(url),
            Self::TextToSpeech { .. } => None,
        }
    }
}

/// Notificaciones de ciclo de vida aportadas por el llamador.
///
/// Compartidas por `Arc` para que las sucesoras generadas por autoplay
/// hereden el comportamiento de su progenitora.
#[derive(Clone)]
pub struct TrackCallbacks {
    pub on_start: Arc<dyn Fn(&Track) + Send + Sync>,
    pub on_finish: Arc<dyn Fn(&Track) + Send + Sync>,
    pub on_error: Arc<dyn Fn(&Track, &PlaybackError) + Send + Sync>,
}

impl Default for TrackCallbacks {
    fn default() -> Self {
        Self {
            on_start: Arc::new(|_| {}),
            on_finish: Arc::new(|_| {}),
            on_error: Arc::new(|track, error| {
                warn!("❌ Error en pista '{}': {error}", track.metadata().title());
            }),
        }
    }
}

/// Una pista encolable. Retiene como máximo un recurso activo a la vez.
pub struct Track {
    metadata: TrackMetadata,
    stream_creator: StreamCreator,
    callbacks: TrackCallbacks,
    resource: Mutex<Option<AudioResource>>,
    related_generator: Mutex<Option<RelatedGenerator>>,
    pub volume_multiplier: f32,
}

impl Track {
    pub fn new(
        metadata: TrackMetadata,
        stream_creator: StreamCreator,
        callbacks: TrackCallbacks,
    ) -> Arc<Self> {
        let volume_multiplier = match metadata {
            TrackMetadata::TextToSpeech { .. } => TTS_VOLUME_MULTIPLIER,
            _ => 1.0,
        };

        Arc::new(Self {
            metadata,
            stream_creator,
            callbacks,
            resource: Mutex::new(None),
            related_generator: Mutex::new(None),
            volume_multiplier,
        })
    }

    /// Pista remota genérica servida vía yt-dlp.
    pub fn remote(title: String, url: String, callbacks: TrackCallbacks) -> Arc<Self> {
        let stream_url = url.clone();
        Self::new(
            TrackMetadata::Remote { title, url },
            Box::new(move || {
                let url = stream_url.clone();
                Box::pin(async move { ytdlp::stream(&url) })
            }),
            callbacks,
        )
    }

    /// Pista de origen YouTube (capaz de autoplay).
    pub fn youtube(title: String, url: String, callbacks: TrackCallbacks) -> Arc<Self> {
        let stream_url = url.clone();
        Self::new(
            TrackMetadata::YouTube { title, url },
            Box::new(move || {
                let url = stream_url.clone();
                Box::pin(async move { ytdlp::stream(&url) })
            }),
            callbacks,
        )
    }

    /// Construye la variante correcta según la URL del resultado.
    pub fn from_search_result(hit: &ytdlp::SearchHit, callbacks: TrackCallbacks) -> Arc<Self> {
        if MusicReconnaissance::extract_video_id(&hit.url).is_some() {
            Self::youtube(hit.title.clone(), hit.url.clone(), callbacks)
        } else {
            Self::remote(hit.title.clone(), hit.url.clone(), callbacks)
        }
    }

    /// Pista de texto-a-voz.
    pub fn text_to_speech(
        http: reqwest::Client,
        text: String,
        provider: String,
        voice: String,
        callbacks: TrackCallbacks,
    ) -> Arc<Self> {
        let title = if text.chars().count() > 64 {
            format!("TTS: {}…", text.chars().take(64).collect::<String>())
        } else {
            format!("TTS: {text}")
        };

        let stream_args = (text.clone(), provider.clone(), voice.clone());
        Self::new(
            TrackMetadata::TextToSpeech {
                title,
                text,
                provider,
                voice,
            },
            Box::new(move || {
                let http = http.clone();
                let (text, provider, voice) = stream_args.clone();
                Box::pin(async move { tts::stream(&http, &provider, &voice, &text).await })
            }),
            callbacks,
        )
    }

    pub fn metadata(&self) -> &TrackMetadata {
        &self.metadata
    }

    pub fn callbacks(&self) -> &TrackCallbacks {
        &self.callbacks
    }

    /// Reemplaza el mecanismo de generación de sucesoras de esta pista.
    pub fn set_related_generator(&self, generator: RelatedGenerator) {
        *self.related_generator.lock() = Some(generator);
    }

    /// Recurso activo, si la pista está (por) reproducirse.
    pub fn resource(&self) -> Option<AudioResource> {
        self.resource.lock().clone()
    }

    /// Materializa un recurso reproducible nuevo.
    ///
    /// Destruye cualquier recurso previo, invoca el productor, sondea el
    /// stream y lo envuelve con volumen en línea inicializado a ganancia
    /// cero. Todo fallo se reporta por `on_error` y devuelve `None` en
    /// lugar de propagarse.
    pub async fn initialize_resource(self: &Arc<Self>) -> Option<AudioResource> {
        self.destroy_resource();

        let stream = match (self.stream_creator)().await {
            Ok(stream) => stream,
            Err(error) => {
                self.on_error(&PlaybackError::StreamCreation(error.to_string()));
                return None;
            }
        };

        // El sondeo lee de un pipe bloqueante.
        let probed = match tokio::task::spawn_blocking(move || demux_probe(stream)).await {
            Ok(Ok(probed)) => probed,
            Ok(Err(error)) => {
                self.on_error(&error);
                return None;
            }
            Err(join_error) => {
                self.on_error(&PlaybackError::StreamCreation(join_error.to_string()));
                return None;
            }
        };

        let resource = AudioResource::new(probed, Arc::downgrade(self));
        *self.resource.lock() = Some(resource.clone());

        debug!("🎼 Recurso inicializado para: {}", self.metadata.title());
        Some(resource)
    }

    /// Idempotente; también termina el stream productor si nadie llegó a
    /// reproducirlo.
    pub fn destroy_resource(&self) {
        if let Some(resource) = self.resource.lock().take() {
            resource.release_stream();
        }
    }

    pub fn on_start(&self) {
        (self.callbacks.on_start)(self);
    }

    /// Destruye el recurso antes de notificar: el callback del llamador
    /// nunca observa un recurso colgante.
    pub fn on_finish(&self) {
        self.destroy_resource();
        (self.callbacks.on_finish)(self);
    }

    pub fn on_error(&self, error: &PlaybackError) {
        self.destroy_resource();
        (self.callbacks.on_error)(self, error);
    }

    /// ¿Puede esta pista generar una sucesora para autoplay?
    pub fn can_autoplay(&self) -> bool {
        matches!(self.metadata, TrackMetadata::YouTube { .. })
    }

    /// Genera una pista relacionada a partir de esta (solo YouTube).
    ///
    /// La sucesora hereda callbacks y multiplicador de volumen.
    pub async fn generate_related(self: &Arc<Self>) -> Result<Arc<Track>, PlaybackError> {
        let generator = self.related_generator.lock().clone();
        if let Some(generator) = generator {
            return generator(self).await;
        }

        let TrackMetadata::YouTube { url, .. } = &self.metadata else {
            return Err(PlaybackError::Autoplay(
                "la pista no es de origen YouTube".into(),
            ));
        };

        let video_id = MusicReconnaissance::extract_video_id(url)
            .ok_or_else(|| PlaybackError::Autoplay("URL sin id de video".into()))?;

        let related_id = MusicReconnaissance::related_video_id(&video_id)
            .await
            .ok_or_else(|| PlaybackError::Autoplay("sin videos relacionados".into()))?;

        let results = MusicReconnaissance::search(&format!(
            "https://www.youtube.com/watch?v={related_id}"
        ))
        .await
        .map_err(|e| PlaybackError::Autoplay(e.to_string()))?;

        let hit = results
            .first()
            .ok_or_else(|| PlaybackError::Autoplay("búsqueda relacionada vacía".into()))?;

        let related = Track::from_search_result(hit, self.callbacks.clone());
        debug!(
            "🔮 Autoplay: '{}' generó '{}'",
            self.metadata.title(),
            related.metadata().title()
        );
        Ok(related)
    }
}
