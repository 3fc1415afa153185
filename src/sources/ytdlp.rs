//! Integración con yt-dlp: streaming de audio por subproceso y búsqueda.

use anyhow::Result;
use std::process::{Command, Stdio};
use tracing::{info, warn};

use super::ByteStream;

/// Resultado crudo de una búsqueda con yt-dlp.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
}

/// Verifica que yt-dlp esté disponible en el sistema.
pub async fn verify_dependencies() -> Result<()> {
    let check = tokio::process::Command::new("yt-dlp")
        .arg("--version")
        .output()
        .await;

    match check {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            info!("✅ yt-dlp versión: {}", version.trim());
            Ok(())
        }
        _ => {
            warn!("❌ yt-dlp no encontrado. Instala con: pip install yt-dlp");
            anyhow::bail!("yt-dlp no disponible")
        }
    }
}

/// Abre un stream de audio para la URL dada.
///
/// El subproceso escribe el mejor formato de solo-audio a stdout; el
/// [`ByteStream`] resultante mata al hijo si nadie llega a reproducirlo.
pub fn stream(url: &str) -> Result<ByteStream> {
    let mut child = Command::new("yt-dlp")
        .args([
            "--quiet",
            "--no-warnings",
            "--no-playlist",
            "-f",
            "bestaudio/best",
            "--socket-timeout",
            "30",
            "--retries",
            "3",
            "-o",
            "-",
        ])
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("yt-dlp no entregó stdout"))?;

    Ok(ByteStream::with_child(Box::new(stdout), child))
}

/// Busca pistas con yt-dlp. Acepta tanto URLs como texto libre
/// (`--default-search ytsearch`).
pub async fn search(query: &str, limit: usize) -> Result<Vec<SearchHit>> {
    let search_target = if query.starts_with("http://") || query.starts_with("https://") {
        query.to_string()
    } else {
        format!("ytsearch{limit}:{query}")
    };

    let output = tokio::process::Command::new("yt-dlp")
        .args([
            "--quiet",
            "--no-warnings",
            "--flat-playlist",
            "--print",
            "%(title)s|%(webpage_url)s",
            "--socket-timeout",
            "30",
        ])
        .arg(&search_target)
        .output()
        .await?;

    if !output.status.success() {
        let error = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("yt-dlp search failed: {}", error);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let hits = stdout
        .lines()
        .filter_map(|line| {
            let (title, url) = line.split_once('|')?;
            if url.is_empty() || url == "NA" {
                return None;
            }
            Some(SearchHit {
                title: title.to_string(),
                url: url.to_string(),
            })
        })
        .take(limit)
        .collect();

    Ok(hits)
}
