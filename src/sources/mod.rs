//! Productores de streams de audio.
//!
//! Cada pista obtiene su audio de una función productora perezosa que
//! devuelve un [`ByteStream`]: un lector crudo más, opcionalmente, un
//! guardián que termina el proceso hijo (yt-dlp) cuando el stream se
//! abandona sin reproducirse.

pub mod tts;
pub mod ytdlp;

use std::io::Read;
use std::process::Child;

use tracing::debug;

/// Stream de bytes sin demultiplexar, tal como lo entrega el productor.
pub struct ByteStream {
    pub reader: Box<dyn Read + Send + Sync>,
    guard: Option<StreamGuard>,
}

impl ByteStream {
    pub fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            guard: None,
        }
    }

    /// Asocia el proceso hijo cuyo stdout es este stream; se mata al
    /// soltar el guardián para no dejar subprocesos colgados.
    pub fn with_child(reader: Box<dyn Read + Send + Sync>, child: Child) -> Self {
        Self {
            reader,
            guard: Some(StreamGuard { child: Some(child) }),
        }
    }

    /// Separa el lector de su guardián. Quien reproduce el stream debe
    /// retener el guardián hasta que la reproducción termine.
    pub fn into_parts(self) -> (Box<dyn Read + Send + Sync>, Option<StreamGuard>) {
        (self.reader, self.guard)
    }
}

/// Mata el proceso productor cuando el stream deja de usarse.
pub struct StreamGuard {
    child: Option<Child>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!("🔪 Terminando proceso productor de stream");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
