//! Productor de audio de texto-a-voz.
//!
//! Los clips de voz son cortos, así que se descargan completos y se
//! sirven desde memoria en lugar de mantener la conexión abierta.

use anyhow::Result;
use std::io::Cursor;
use tracing::debug;
use url::Url;

use super::ByteStream;

const GOOGLE_TTS_ENDPOINT: &str = "https://translate.google.com/translate_tts";

/// Construye la URL de síntesis para el proveedor indicado.
///
/// Solo se soporta el proveedor `google`; otros valores caen al mismo
/// endpoint con la voz como código de idioma.
pub fn synthesis_url(provider: &str, voice: &str, text: &str) -> Result<Url> {
    if provider != "google" {
        debug!("🗣️ Proveedor TTS desconocido '{provider}', usando google");
    }

    let mut url = Url::parse(GOOGLE_TTS_ENDPOINT)?;
    url.query_pairs_mut()
        .append_pair("ie", "UTF-8")
        .append_pair("client", "tw-ob")
        .append_pair("tl", voice)
        .append_pair("q", text);

    Ok(url)
}

/// Descarga el clip sintetizado y lo expone como [`ByteStream`].
pub async fn stream(http: &reqwest::Client, provider: &str, voice: &str, text: &str) -> Result<ByteStream> {
    let url = synthesis_url(provider, voice, text)?;

    let response = http.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;

    if bytes.is_empty() {
        anyhow::bail!("el proveedor TTS devolvió un clip vacío");
    }

    debug!("🗣️ Clip TTS descargado: {} bytes", bytes.len());
    Ok(ByteStream::new(Box::new(Cursor::new(bytes.to_vec()))))
}
