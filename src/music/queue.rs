//! Cola de reproducción por guild: historial, pista actual y futuras.
//!
//! El avance (`process_next_track`) es el único mutador de la pista
//! actual y está serializado por la bandera `locked`: los eventos del
//! reproductor, el skip explícito y el autoplay llegan todos por acá sin
//! poder solaparse.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::music::track::Track;
use crate::music::transport::{AudioResource, PlayerHandle};
use crate::music::volume::{QueueStateManager, QueueVolumeManager, VolumePolicy};

/// Modo de repetición de la cola. Cambiarlo surte efecto en el próximo
/// avance, nunca retroactivamente.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopingMode {
    Off,
    Track,
    Queue,
    Autoplay,
}

impl LoopingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Track => "track",
            Self::Queue => "queue",
            Self::Autoplay => "autoplay",
        }
    }
}

pub(crate) struct QueueState {
    looping_mode: LoopingMode,
    /// Más reciente primero.
    previous_tracks: Vec<Arc<Track>>,
    current_track: Option<Arc<Track>>,
    future_tracks: VecDeque<Arc<Track>>,
    locked: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            looping_mode: LoopingMode::Off,
            previous_tracks: Vec::new(),
            current_track: None,
            future_tracks: VecDeque::new(),
            locked: false,
        }
    }

    /// Recurso vivo de la pista actual, si existe.
    pub(crate) fn active_resource(&self) -> Option<AudioResource> {
        self.current_track.as_ref().and_then(|track| track.resource())
    }

    pub(crate) fn current_track(&self) -> Option<Arc<Track>> {
        self.current_track.clone()
    }
}

enum Selection {
    Done(Option<Arc<Track>>),
    NeedsAutoplay(Arc<Track>),
}

/// Cola de un guild, propiedad exclusiva de una `MusicSubscription`.
pub struct Queue {
    state: Arc<Mutex<QueueState>>,
    pub volume_manager: QueueVolumeManager,
    pub state_manager: QueueStateManager,
}

impl Queue {
    pub fn new(player: Arc<dyn PlayerHandle>, volume_policy: VolumePolicy) -> Self {
        let state = Arc::new(Mutex::new(QueueState::new()));
        Self {
            volume_manager: QueueVolumeManager::new(state.clone(), volume_policy),
            state_manager: QueueStateManager::new(player),
            state,
        }
    }

    pub fn looping_mode(&self) -> LoopingMode {
        self.state.lock().looping_mode
    }

    pub fn set_looping_mode(&self, mode: LoopingMode) {
        info!("🔁 Modo de repetición: {}", mode.as_str());
        self.state.lock().looping_mode = mode;
    }

    pub fn current_track(&self) -> Option<Arc<Track>> {
        self.state.lock().current_track.clone()
    }

    pub fn previous_tracks(&self) -> Vec<Arc<Track>> {
        self.state.lock().previous_tracks.clone()
    }

    pub fn future_tracks(&self) -> Vec<Arc<Track>> {
        self.state.lock().future_tracks.iter().cloned().collect()
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Inserta en `position` (0-indexada) o al final si se omite o
    /// excede el largo.
    pub fn add_track(&self, track: Arc<Track>, position: Option<usize>) {
        let mut st = self.state.lock();
        let index = position
            .unwrap_or(st.future_tracks.len())
            .min(st.future_tracks.len());
        info!(
            "➕ Agregada a la cola (posición {index}): {}",
            track.metadata().title()
        );
        st.future_tracks.insert(index, track);
    }

    /// Remueve la pista futura en `position`; fuera de rango devuelve
    /// `None` en lugar de fallar.
    pub fn remove_track(&self, position: usize) -> Option<Arc<Track>> {
        let removed = self.state.lock().future_tracks.remove(position);
        if let Some(track) = &removed {
            info!("❌ Removida de la cola: {}", track.metadata().title());
        }
        removed
    }

    pub fn clear_future_tracks(&self) {
        let mut st = self.state.lock();
        let count = st.future_tracks.len();
        st.future_tracks.clear();
        info!("🗑️ Cola limpiada ({count} pistas)");
    }

    /// Reordena solo las pistas futuras; ni la actual ni el historial.
    pub fn shuffle_tracks(&self) {
        let mut st = self.state.lock();
        st.future_tracks
            .make_contiguous()
            .shuffle(&mut rand::thread_rng());
        info!("🔀 Cola mezclada");
    }

    /// Avanza la cola y devuelve la nueva pista actual.
    ///
    /// Si otro avance está en curso (`locked`) devuelve `None` de
    /// inmediato. El algoritmo: pista actual al frente del historial,
    /// selección según el modo de repetición, asignación y desbloqueo.
    pub async fn process_next_track(&self) -> Option<Arc<Track>> {
        {
            let mut st = self.state.lock();
            if st.locked {
                debug!("⏳ Avance ya en curso, ignorando");
                return None;
            }
            st.locked = true;
        }

        let next = self.advance().await;

        self.state.lock().locked = false;
        next
    }

    async fn advance(&self) -> Option<Arc<Track>> {
        let selection = {
            let mut st = self.state.lock();

            let previous = st.current_track.take();
            if let Some(prev) = &previous {
                st.previous_tracks.insert(0, prev.clone());
            }

            match st.looping_mode {
                LoopingMode::Off => Selection::Done(st.future_tracks.pop_front()),
                // Repite la recién terminada tal cual, sin tocar las futuras.
                LoopingMode::Track => Selection::Done(previous),
                // Rotación: la terminada vuelve al final y sale la del frente.
                LoopingMode::Queue => {
                    if let Some(prev) = previous {
                        st.future_tracks.push_back(prev);
                    }
                    Selection::Done(st.future_tracks.pop_front())
                }
                LoopingMode::Autoplay => {
                    if st.future_tracks.is_empty() {
                        // El historial va de más a menos reciente: el primer
                        // candidato capaz es el correcto.
                        match st
                            .previous_tracks
                            .iter()
                            .find(|track| track.can_autoplay())
                            .cloned()
                        {
                            Some(candidate) => Selection::NeedsAutoplay(candidate),
                            None => Selection::Done(None),
                        }
                    } else {
                        Selection::Done(st.future_tracks.pop_front())
                    }
                }
            }
        };

        let next = match selection {
            Selection::Done(next) => next,
            // Generación con red, fuera del candado de estado; la bandera
            // `locked` sigue excluyendo avances re-entrantes.
            Selection::NeedsAutoplay(candidate) => match candidate.generate_related().await {
                Ok(related) => {
                    let mut st = self.state.lock();
                    st.future_tracks.push_back(related);
                    st.future_tracks.pop_front()
                }
                Err(error) => {
                    warn!("🔮 Autoplay falló, la cola termina: {error}");
                    None
                }
            },
        };

        self.state.lock().current_track = next.clone();

        match &next {
            Some(track) => info!("➡️ Siguiente pista: {}", track.metadata().title()),
            None => info!("📭 Cola agotada"),
        }
        next
    }

    /// Vuelve la cola a su estado inicial. Seguro desde cualquier estado;
    /// fuerza el desbloqueo aunque un avance quedara a medias.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        st.future_tracks.clear();
        st.current_track = None;
        st.previous_tracks.clear();
        st.looping_mode = LoopingMode::Off;
        st.locked = false;
    }

    #[cfg(test)]
    pub(crate) fn engage_lock_for_test(&self) {
        self.state.lock().locked = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::music::fakes::FakePlayer;
    use crate::music::track::test_support::playable_track;
    use crate::music::track::TrackCallbacks;
    use pretty_assertions::assert_eq;

    fn queue() -> Queue {
        Queue::new(FakePlayer::new(), VolumePolicy::default())
    }

    fn track(title: &str) -> Arc<Track> {
        playable_track(title, TrackCallbacks::default())
    }

    fn titles(tracks: &[Arc<Track>]) -> Vec<String> {
        tracks
            .iter()
            .map(|t| t.metadata().title().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_off_mode_exhausts_queue() {
        let queue = queue();
        queue.add_track(track("a"), None);
        queue.add_track(track("b"), None);

        assert_eq!(
            queue.process_next_track().await.unwrap().metadata().title(),
            "a"
        );
        assert_eq!(
            queue.process_next_track().await.unwrap().metadata().title(),
            "b"
        );
        assert!(queue.process_next_track().await.is_none());
        assert!(queue.current_track().is_none());
        assert!(queue.future_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_queue_mode_rotates() {
        let queue = queue();
        for title in ["a", "b", "c"] {
            queue.add_track(track(title), None);
        }
        queue.set_looping_mode(LoopingMode::Queue);

        let mut seen = Vec::new();
        for _ in 0..5 {
            let current = queue.process_next_track().await.unwrap();
            seen.push(current.metadata().title().to_string());
        }
        assert_eq!(seen, vec!["a", "b", "c", "a", "b"]);

        // El historial crece con cada rotación, más reciente primero.
        assert_eq!(titles(&queue.previous_tracks()), vec!["a", "c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_track_mode_repeats_without_touching_future() {
        let queue = queue();
        queue.add_track(track("a"), None);
        queue.add_track(track("b"), None);
        queue.set_looping_mode(LoopingMode::Track);

        let first = queue.process_next_track().await.unwrap();
        for _ in 0..3 {
            let again = queue.process_next_track().await.unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }
        assert_eq!(titles(&queue.future_tracks()), vec!["b"]);
    }

    #[tokio::test]
    async fn test_track_mode_without_history_yields_nothing() {
        let queue = queue();
        queue.set_looping_mode(LoopingMode::Track);
        assert!(queue.process_next_track().await.is_none());
    }

    #[tokio::test]
    async fn test_autoplay_without_eligible_history_ends_quietly() {
        let queue = queue();
        queue.set_looping_mode(LoopingMode::Autoplay);
        assert!(queue.process_next_track().await.is_none());

        // Con historial no-YouTube tampoco hay candidata.
        queue.add_track(track("normal"), None);
        queue.process_next_track().await;
        assert!(queue.process_next_track().await.is_none());
        assert!(queue.current_track().is_none());
    }

    #[tokio::test]
    async fn test_autoplay_generated_successor_becomes_current() {
        use crate::music::track::RelatedGenerator;
        use futures::future::BoxFuture;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let queue = queue();
        let finishes = Arc::new(AtomicUsize::new(0));
        let counter = finishes.clone();
        let seed = Track::youtube(
            "semilla".into(),
            "https://www.youtube.com/watch?v=abc123def45".into(),
            TrackCallbacks {
                on_finish: Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                ..TrackCallbacks::default()
            },
        );
        // Sucesoras construidas con los callbacks de la progenitora, como
        // hace la generación respaldada por la búsqueda de relacionados.
        let generator: RelatedGenerator = Arc::new(
            |parent| -> BoxFuture<'static, Result<Arc<Track>, crate::music::transport::PlaybackError>> {
                let callbacks = parent.callbacks().clone();
                Box::pin(async move {
                    Ok(Track::youtube(
                        "sucesora".into(),
                        "https://www.youtube.com/watch?v=zzz987wvu65".into(),
                        callbacks,
                    ))
                })
            },
        );
        seed.set_related_generator(generator);

        queue.add_track(seed, None);
        queue.set_looping_mode(LoopingMode::Autoplay);

        assert_eq!(
            queue.process_next_track().await.unwrap().metadata().title(),
            "semilla"
        );
        let generated = queue.process_next_track().await.unwrap();
        assert_eq!(generated.metadata().title(), "sucesora");
        assert!(Arc::ptr_eq(&generated, &queue.current_track().unwrap()));
        assert!(queue.future_tracks().is_empty());
        assert!(!queue.is_locked());

        // Y hereda el comportamiento de ciclo de vida.
        generated.on_finish();
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_autoplay_generation_failure_ends_queue() {
        let queue = queue();
        // Origen YouTube pero sin id de video extraíble: la generación
        // falla antes de tocar la red.
        let bad = Track::youtube(
            "lista".into(),
            "https://www.youtube.com/playlist?list=PL123".into(),
            TrackCallbacks::default(),
        );
        queue.add_track(bad, None);
        queue.set_looping_mode(LoopingMode::Autoplay);

        assert!(queue.process_next_track().await.is_some());
        assert!(queue.process_next_track().await.is_none());
        assert!(!queue.is_locked());
    }

    #[tokio::test]
    async fn test_locked_queue_refuses_reentrant_advance() {
        let queue = queue();
        queue.add_track(track("a"), None);
        queue.engage_lock_for_test();

        assert!(queue.process_next_track().await.is_none());
        // El estado no se corrompió: la pista sigue en la cola.
        assert_eq!(titles(&queue.future_tracks()), vec!["a"]);
        assert!(queue.previous_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_everything_including_lock() {
        let queue = queue();
        queue.add_track(track("a"), None);
        queue.add_track(track("b"), None);
        queue.set_looping_mode(LoopingMode::Queue);
        queue.process_next_track().await;
        queue.engage_lock_for_test();

        queue.reset();

        assert!(queue.current_track().is_none());
        assert!(queue.previous_tracks().is_empty());
        assert!(queue.future_tracks().is_empty());
        assert_eq!(queue.looping_mode(), LoopingMode::Off);
        assert!(!queue.is_locked());

        // Y la cola sigue usable tras el reset.
        queue.add_track(track("c"), None);
        assert!(queue.process_next_track().await.is_some());
    }

    #[tokio::test]
    async fn test_positional_add_and_remove() {
        let queue = queue();
        queue.add_track(track("a"), None);
        queue.add_track(track("c"), None);
        queue.add_track(track("b"), Some(1));
        assert_eq!(titles(&queue.future_tracks()), vec!["a", "b", "c"]);

        // Posición fuera de rango: inserta al final.
        queue.add_track(track("d"), Some(99));
        assert_eq!(titles(&queue.future_tracks()), vec!["a", "b", "c", "d"]);

        assert_eq!(
            queue.remove_track(1).unwrap().metadata().title(),
            "b"
        );
        assert!(queue.remove_track(99).is_none());
        assert_eq!(titles(&queue.future_tracks()), vec!["a", "c", "d"]);
    }

    #[tokio::test]
    async fn test_shuffle_only_touches_future_tracks() {
        let queue = queue();
        for title in ["a", "b", "c", "d", "e"] {
            queue.add_track(track(title), None);
        }
        let current = queue.process_next_track().await.unwrap();

        queue.shuffle_tracks();

        assert!(Arc::ptr_eq(&current, &queue.current_track().unwrap()));
        let mut after = titles(&queue.future_tracks());
        after.sort();
        assert_eq!(after, vec!["b", "c", "d", "e"]);
    }
}
