//! Reconocimiento musical: resolución de consultas a pistas concretas y
//! descubrimiento de videos relacionados para autoplay.
//!
//! Es un servicio de proceso con inicialización explícita: usarlo antes
//! de [`MusicReconnaissance::initialize`] es un error de programación y
//! entra en pánico en vez de degradarse en silencio.

use rand::seq::SliceRandom;
use serde::Deserialize;
use std::sync::OnceLock;
use tracing::{debug, warn};
use url::Url;

use crate::sources::ytdlp;

const YOUTUBE_SEARCH_ENDPOINT: &str = "https://youtube.googleapis.com/youtube/v3/search";

/// Cuántos resultados devuelve una búsqueda de texto.
const SEARCH_LIMIT: usize = 5;

/// Dependencias compartidas del servicio, fijadas una vez al arrancar.
pub struct ReconContext {
    pub http: reqwest::Client,
    /// Sin clave de API no hay videos relacionados; la búsqueda normal
    /// funciona igual.
    pub youtube_api_key: Option<String>,
}

static CONTEXT: OnceLock<ReconContext> = OnceLock::new();

pub struct MusicReconnaissance;

impl MusicReconnaissance {
    /// Fija las dependencias del servicio. Llamadas repetidas se ignoran
    /// con aviso.
    pub fn initialize(context: ReconContext) {
        if CONTEXT.set(context).is_err() {
            warn!("🔭 MusicReconnaissance ya estaba inicializado");
        }
    }

    fn context() -> &'static ReconContext {
        CONTEXT
            .get()
            .expect("MusicReconnaissance usado antes de initialize()")
    }

    /// Resuelve una consulta (texto libre o URL) a candidatas concretas.
    pub async fn search(query: &str) -> anyhow::Result<Vec<ytdlp::SearchHit>> {
        Self::context();

        let query = Self::normalize_query(query);
        debug!("🔎 Buscando: {query}");
        ytdlp::search(&query, SEARCH_LIMIT).await
    }

    /// Canonicaliza URLs de YouTube (youtu.be, shorts, parámetros de
    /// rastreo) a la forma `watch?v=`. Todo lo demás pasa intacto.
    pub fn normalize_query(query: &str) -> String {
        match Self::extract_video_id(query) {
            Some(id) => format!("https://www.youtube.com/watch?v={id}"),
            None => query.to_string(),
        }
    }

    /// Id de video de una URL de YouTube, o `None` si no es una.
    pub fn extract_video_id(url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;

        let id = match parsed.host_str()? {
            "youtu.be" => parsed
                .path_segments()
                .and_then(|mut segments| segments.next())
                .map(str::to_string),
            "youtube.com" | "www.youtube.com" | "m.youtube.com" | "music.youtube.com" => {
                match parsed.path() {
                    "/watch" => parsed
                        .query_pairs()
                        .find(|(key, _)| key == "v")
                        .map(|(_, value)| value.into_owned()),
                    path => path
                        .strip_prefix("/shorts/")
                        .or_else(|| path.strip_prefix("/embed/"))
                        .map(|rest| rest.trim_end_matches('/').to_string()),
                }
            }
            _ => None,
        }?;

        (!id.is_empty()).then_some(id)
    }

    /// Un video relacionado al dado, elegido al azar entre los resultados
    /// de la API de YouTube descartando el primero (suele ser el mismo
    /// video). `None` ante cualquier fallo: el autoplay termina la cola
    /// en vez de romperla.
    pub async fn related_video_id(video_id: &str) -> Option<String> {
        let context = Self::context();
        let Some(api_key) = context.youtube_api_key.as_deref() else {
            warn!("🔭 Sin clave de API de YouTube: autoplay deshabilitado");
            return None;
        };

        let endpoint = Url::parse_with_params(
            YOUTUBE_SEARCH_ENDPOINT,
            &[
                ("part", "id"),
                ("type", "video"),
                ("maxResults", "10"),
                ("relatedToVideoId", video_id),
                ("key", api_key),
            ],
        )
        .ok()?;

        let response = match context.http.get(endpoint).send().await {
            Ok(response) => response,
            Err(error) => {
                warn!("🔭 Búsqueda de relacionados falló: {error}");
                return None;
            }
        };
        let listing: RelatedListing = match response.error_for_status() {
            Ok(response) => response.json().await.ok()?,
            Err(error) => {
                warn!("🔭 La API de YouTube respondió error: {error}");
                return None;
            }
        };

        let candidates: Vec<String> = listing
            .items
            .into_iter()
            .skip(1)
            .filter_map(|item| item.id.video_id)
            .filter(|candidate| candidate != video_id)
            .collect();

        candidates.choose(&mut rand::thread_rng()).cloned()
    }
}

#[derive(Deserialize)]
struct RelatedListing {
    #[serde(default)]
    items: Vec<RelatedItem>,
}

#[derive(Deserialize)]
struct RelatedItem {
    id: RelatedId,
}

#[derive(Deserialize)]
struct RelatedId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}
