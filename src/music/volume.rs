//! Volumen y pausa de la cola.
//!
//! El volumen humano (0–200, por defecto 50) se traduce a la ganancia
//! logarítmica del transporte con un factor de escala configurable. La
//! fuente de verdad mientras algo suena es el recurso vivo, no el estado
//! cacheado: así lo que se muestra nunca deriva de lo que se oye.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::music::queue::QueueState;
use crate::music::transport::{PlayerHandle, PlayerStatus};

/// Política numérica del volumen. El mapeo humano↔crudo es convención,
/// no física; vive acá como constante configurable.
#[derive(Debug, Clone, Copy)]
pub struct VolumePolicy {
    /// Factor de conversión de volumen humano (sobre 100) a ganancia cruda.
    pub scale_factor: f32,
    /// Tope humano aplicado uniformemente en el setter.
    pub max_human: u8,
    /// Volumen inicial.
    pub default_human: u8,
}

impl Default for VolumePolicy {
    fn default() -> Self {
        Self {
            scale_factor: 0.40,
            max_human: 200,
            default_human: 50,
        }
    }
}

struct VolumeState {
    raw: f32,
    last_human: u8,
    muted: bool,
    muted_previous_raw: f32,
}

/// Volumen de la cola: porcentaje humano, silencio y multiplicador por
/// pista aplicado al arrancar cada recurso.
pub struct QueueVolumeManager {
    queue_state: Arc<Mutex<QueueState>>,
    policy: VolumePolicy,
    state: Mutex<VolumeState>,
}

impl QueueVolumeManager {
    pub(crate) fn new(queue_state: Arc<Mutex<QueueState>>, policy: VolumePolicy) -> Self {
        let raw = Self::human_to_raw(policy.default_human, policy.scale_factor);
        Self {
            queue_state,
            policy,
            state: Mutex::new(VolumeState {
                raw,
                last_human: policy.default_human,
                muted: false,
                muted_previous_raw: 0.0,
            }),
        }
    }

    fn human_to_raw(human: u8, scale_factor: f32) -> f32 {
        f32::from(human) / 100.0 * scale_factor
    }

    fn raw_to_human(raw: f32, scale_factor: f32) -> u8 {
        (raw / scale_factor * 100.0).round().clamp(0.0, 255.0) as u8
    }

    /// Volumen mostrado al usuario. Con recurso vivo se deriva de su
    /// ganancia real; si no, del último valor fijado.
    pub fn volume(&self) -> u8 {
        let live = self.queue_state.lock().active_resource();
        match live {
            Some(resource) => {
                Self::raw_to_human(resource.volume().logarithmic(), self.policy.scale_factor)
            }
            None => self.state.lock().last_human,
        }
    }

    /// Fija el volumen humano, recortado al tope de la política, y lo
    /// aplica de inmediato si hay un recurso activo.
    pub fn set_volume(&self, human: u8) {
        let human = human.min(self.policy.max_human);
        let raw = Self::human_to_raw(human, self.policy.scale_factor);

        {
            let mut st = self.state.lock();
            st.last_human = human;
            st.raw = raw;
        }

        info!("🔊 Volumen fijado a {human}%");
        if let Some(resource) = self.queue_state.lock().active_resource() {
            resource.volume().set_logarithmic(raw);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    /// Alterna el silencio recordando la ganancia previa exacta. Sin
    /// recurso activo no hace nada.
    pub fn toggle_mute(&self) {
        let Some(resource) = self.queue_state.lock().active_resource() else {
            return;
        };

        let mut st = self.state.lock();
        if st.muted {
            resource.volume().set_logarithmic(st.muted_previous_raw);
        } else {
            st.muted_previous_raw = resource.volume().logarithmic();
            resource.volume().set_logarithmic(0.0);
        }
        st.muted = !st.muted;
        info!(
            "{} Silencio: {}",
            if st.muted { "🔇" } else { "🔊" },
            st.muted
        );
    }

    /// Aplica `ganancia cruda × multiplicador de la pista` al recurso
    /// recién activo. La suscripción lo llama exactamente una vez por
    /// arranque de pista; es lo que deja a las pistas TTS sonar más
    /// fuerte sin mover el volumen global.
    pub fn initialize(&self) {
        let (resource, multiplier) = {
            let qs = self.queue_state.lock();
            let Some(track) = qs.current_track() else {
                return;
            };
            let Some(resource) = qs.active_resource() else {
                return;
            };
            (resource, track.volume_multiplier)
        };

        let raw = self.state.lock().raw;
        debug!("🎚️ Ganancia inicial: {raw} × {multiplier}");
        resource.volume().set_logarithmic(raw * multiplier);
    }
}

/// Pausa y reanudación sobre el reproductor activo. Idempotentes: en el
/// estado destino no hacen nada.
pub struct QueueStateManager {
    player: Arc<dyn PlayerHandle>,
}

impl QueueStateManager {
    pub(crate) fn new(player: Arc<dyn PlayerHandle>) -> Self {
        Self { player }
    }

    pub async fn pause(&self) {
        if self.player.status() == PlayerStatus::Playing {
            info!("⏸️ Reproducción pausada");
            self.player.pause().await;
        }
    }

    pub async fn resume(&self) {
        if self.player.status() == PlayerStatus::Paused {
            info!("▶️ Reproducción reanudada");
            self.player.unpause().await;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.player.status() == PlayerStatus::Paused
    }
}
