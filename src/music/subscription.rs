//! Suscripción musical de un guild: une conexión de voz, reproductor y
//! cola, y reacciona a las transiciones de ambas máquinas de estado.
//!
//! La política de reconexión replica la del transporte: un cierre 4014
//! es ambiguo (mudanza de canal o expulsión) y se desambigua observando
//! si la conexión re-entra en `Connecting` dentro del plazo corto; las
//! desconexiones recuperables se reintentan con espera creciente hasta
//! un tope, y toda conexión que empieza a negociar tiene un plazo duro
//! para llegar a `Ready`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::music::queue::Queue;
use crate::music::transport::{
    enters_state, GatewayEvent, GatewayStatus, PlaybackError, PlayerEvent, PlayerHandle,
    PlayerStatus, VoiceGateway, WS_CLOSE_DISCONNECTED,
};
use crate::music::volume::VolumePolicy;

/// Plazos y topes de la reconexión automática.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Reintentos de `rejoin` antes de rendirse y destruir la conexión.
    pub rejoin_attempt_limit: u32,
    /// Espera base entre reintentos; se multiplica por el número de
    /// intento para el retroceso creciente.
    pub rejoin_backoff: Duration,
    /// Plazo para que una conexión que negocia llegue a `Ready`.
    pub ready_deadline: Duration,
    /// Plazo corto para distinguir mudanza de canal de expulsión tras un
    /// cierre 4014.
    pub kick_probe: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            rejoin_attempt_limit: 5,
            rejoin_backoff: Duration::from_secs(5),
            ready_deadline: Duration::from_secs(20),
            kick_probe: Duration::from_secs(5),
        }
    }
}

/// Estado musical completo de un guild. Una por guild, registrada en el
/// [`SubscriptionRegistry`](crate::music::SubscriptionRegistry).
pub struct MusicSubscription {
    gateway: Arc<dyn VoiceGateway>,
    player: Arc<dyn PlayerHandle>,
    pub queue: Queue,
    reconnect: ReconnectPolicy,
    /// Evita apilar vigilantes de `Ready` cuando `Connecting` y
    /// `Signalling` llegan en ráfaga.
    readiness_watch: AtomicBool,
    /// Queda en `true` tras `kill()`: los reintentos de reconexión
    /// pendientes lo consultan antes de revivir la conexión.
    terminated: AtomicBool,
}

impl MusicSubscription {
    pub fn new(
        gateway: Arc<dyn VoiceGateway>,
        player: Arc<dyn PlayerHandle>,
        volume: VolumePolicy,
        reconnect: ReconnectPolicy,
    ) -> Arc<Self> {
        let subscription = Arc::new(Self {
            queue: Queue::new(player.clone(), volume),
            gateway,
            player,
            reconnect,
            readiness_watch: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });
        subscription.spawn_event_tasks();
        subscription
    }

    /// Las tareas de eventos retienen solo un `Weak`: cuando el registro
    /// suelta la última referencia fuerte, ambas terminan solas.
    fn spawn_event_tasks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut gateway_rx = self.gateway.subscribe();
        tokio::spawn(async move {
            while let Some(event) = next_event(&mut gateway_rx).await {
                let Some(subscription) = weak.upgrade() else {
                    break;
                };
                subscription.handle_gateway_event(event).await;
            }
        });

        let weak = Arc::downgrade(self);
        let mut player_rx = self.player.subscribe();
        tokio::spawn(async move {
            while let Some(event) = next_event(&mut player_rx).await {
                let Some(subscription) = weak.upgrade() else {
                    break;
                };
                subscription.handle_player_event(event).await;
            }
        });
    }

    async fn handle_gateway_event(self: &Arc<Self>, event: GatewayEvent) {
        let new = match event {
            GatewayEvent::StateChange { new, .. } => new,
            GatewayEvent::Error { message } => {
                warn!("📡 Error de la conexión de voz: {message}");
                return;
            }
        };
        match new.status {
            GatewayStatus::Disconnected => {
                if new.close_code == Some(WS_CLOSE_DISCONNECTED) {
                    // Mudanza de canal o expulsión: si la conexión vuelve a
                    // negociar dentro del plazo, fue mudanza.
                    if enters_state(
                        &*self.gateway,
                        GatewayStatus::Connecting,
                        self.reconnect.kick_probe,
                    )
                    .await
                    {
                        debug!("🔁 Movido de canal de voz, la conexión se recupera sola");
                    } else {
                        info!("👢 Expulsado del canal de voz");
                        self.gateway.destroy().await;
                    }
                } else if self.gateway.rejoin_attempts() < self.reconnect.rejoin_attempt_limit {
                    let attempt = self.gateway.rejoin_attempts() + 1;
                    let wait = self.reconnect.rejoin_backoff * attempt;
                    warn!("🔌 Desconexión recuperable, reintento {attempt} en {wait:?}");
                    // La espera corre aparte: la tarea de eventos sigue
                    // libre para procesar una destrucción mientras tanto.
                    let weak = Arc::downgrade(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(wait).await;
                        let Some(subscription) = weak.upgrade() else {
                            return;
                        };
                        if subscription.terminated.load(Ordering::SeqCst) {
                            return;
                        }
                        subscription.gateway.rejoin().await;
                    });
                } else {
                    warn!("🔌 Reintentos de reconexión agotados");
                    self.gateway.destroy().await;
                }
            }
            GatewayStatus::Destroyed => {
                self.kill().await;
            }
            GatewayStatus::Connecting | GatewayStatus::Signalling => {
                if !self.readiness_watch.swap(true, Ordering::SeqCst) {
                    let ready = enters_state(
                        &*self.gateway,
                        GatewayStatus::Ready,
                        self.reconnect.ready_deadline,
                    )
                    .await;
                    self.readiness_watch.store(false, Ordering::SeqCst);

                    if !ready && self.gateway.status() != GatewayStatus::Destroyed {
                        warn!("⏱️ La conexión de voz nunca llegó a Ready");
                        self.gateway.destroy().await;
                    }
                }
            }
            GatewayStatus::Ready => {
                debug!("🟢 Conexión de voz lista");
            }
        }
    }

    async fn handle_player_event(&self, event: PlayerEvent) {
        match event {
            PlayerEvent::StateChange { old, new } => {
                if new.status == PlayerStatus::Idle && old.status != PlayerStatus::Idle {
                    // Terminó la pista saliente; su recurso viaja en el
                    // estado viejo.
                    if let Some(track) = old.resource.as_ref().and_then(|r| r.track()) {
                        track.on_finish();
                    }
                    self.process_queue(false).await;
                } else if new.status == PlayerStatus::Playing && old.status != PlayerStatus::Playing
                {
                    if let Some(track) = new.resource.as_ref().and_then(|r| r.track()) {
                        track.on_start();
                    }
                    self.queue.volume_manager.initialize();
                }
            }
            PlayerEvent::Error { resource, message } => {
                if let Some(track) = resource.track() {
                    track.on_error(&PlaybackError::Player(message));
                }
            }
        }
    }

    /// Avanza la cola y reproduce la siguiente pista.
    ///
    /// Sin `force` solo actúa con el reproductor ocioso (el camino de los
    /// eventos `Idle`); con `force` pausa primero para que el salto no
    /// dispare un avance fantasma al detener la pista actual.
    pub async fn process_queue(&self, force: bool) {
        if !force && self.player.status() != PlayerStatus::Idle {
            return;
        }
        if force {
            self.player.pause().await;
        }

        let Some(next) = self.queue.process_next_track().await else {
            return;
        };
        // Nunca debería seguir trabada tras un avance; chequeo barato.
        if self.queue.is_locked() {
            return;
        }
        let Some(resource) = next.initialize_resource().await else {
            return;
        };
        self.player.play(resource).await;
    }

    /// Apaga todo: cola a cero, reproductor detenido, conexión cerrada.
    /// Seguro de llamar más de una vez.
    pub async fn kill(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        info!("💀 Suscripción terminada");
        self.queue.reset();
        self.player.stop().await;
        self.gateway.disconnect().await;
    }
}

/// Drena un receptor broadcast tolerando rezagos; `None` al cerrarse.
async fn next_event<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Option<T> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("📨 Se perdieron {skipped} eventos de transición");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::music::fakes::{FakeGateway, FakePlayer};
    use crate::music::queue::LoopingMode;
    use crate::music::track::test_support::playable_track;
    use crate::music::track::TrackCallbacks;
    use crate::music::transport::GatewaySnapshot;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn subscription() -> (Arc<MusicSubscription>, Arc<FakeGateway>, Arc<FakePlayer>) {
        let gateway = FakeGateway::new();
        let player = FakePlayer::new();
        let subscription = MusicSubscription::new(
            gateway.clone(),
            player.clone(),
            VolumePolicy::default(),
            ReconnectPolicy::default(),
        );
        (subscription, gateway, player)
    }

    /// Cede el turno a las tareas de eventos sin avanzar los plazos
    /// largos (con el reloj pausado el sleep corto resuelve primero).
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[derive(Default)]
    struct Lifecycle {
        starts: AtomicUsize,
        finishes: AtomicUsize,
        errors: AtomicUsize,
    }

    fn counting_callbacks(lifecycle: Arc<Lifecycle>) -> TrackCallbacks {
        let starts = lifecycle.clone();
        let finishes = lifecycle.clone();
        let errors = lifecycle;
        TrackCallbacks {
            on_start: Arc::new(move |_| {
                starts.starts.fetch_add(1, Ordering::SeqCst);
            }),
            on_finish: Arc::new(move |_| {
                finishes.finishes.fetch_add(1, Ordering::SeqCst);
            }),
            on_error: Arc::new(move |_, _| {
                errors.errors.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    fn disconnected_with(close_code: Option<u16>) -> GatewaySnapshot {
        GatewaySnapshot {
            status: GatewayStatus::Disconnected,
            close_code,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_move_leaves_connection_alone() {
        let (_subscription, gateway, _player) = subscription();

        gateway.transition(disconnected_with(Some(WS_CLOSE_DISCONNECTED)));
        settle().await;

        // La conexión re-negocia dentro del plazo: era una mudanza.
        gateway.transition(GatewaySnapshot::of(GatewayStatus::Connecting));
        settle().await;
        gateway.transition(GatewaySnapshot::of(GatewayStatus::Ready));
        settle().await;

        assert_eq!(gateway.destroy_count(), 0);
        assert_eq!(gateway.status(), GatewayStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kick_destroys_connection_after_probe_deadline() {
        let (_subscription, gateway, player) = subscription();

        gateway.transition(disconnected_with(Some(WS_CLOSE_DISCONNECTED)));
        settle().await;

        // Nadie re-negocia: al vencer el plazo corto se destruye, y la
        // destrucción arrastra la limpieza completa.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(gateway.destroy_count(), 1);
        assert_eq!(player.stop_count(), 1);
        assert_eq!(gateway.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recoverable_disconnect_rejoins_with_backoff() {
        let (_subscription, gateway, _player) = subscription();

        gateway.transition(disconnected_with(None));
        settle().await;

        // Primer intento: espera (0 + 1) × 5 s antes de reconectar.
        assert_eq!(gateway.rejoin_count(), 0);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(gateway.rejoin_count(), 1);
        assert_eq!(gateway.destroy_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_during_backoff_runs_immediately_and_cancels_rejoin() {
        let (_subscription, gateway, player) = subscription();

        gateway.transition(disconnected_with(None));
        settle().await;

        // Con el reintento aún en espera, la destrucción no queda
        // bloqueada detrás de la espera: la limpieza corre ya.
        gateway.transition(GatewaySnapshot::of(GatewayStatus::Destroyed));
        settle().await;
        assert_eq!(player.stop_count(), 1);
        assert_eq!(gateway.disconnect_count(), 1);

        // Y al vencer la espera, el reintento pendiente se descarta.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(gateway.rejoin_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_at_attempt_ceiling_destroys() {
        let (_subscription, gateway, _player) = subscription();

        gateway.set_attempts(5);
        gateway.transition(disconnected_with(None));
        settle().await;

        assert_eq!(gateway.rejoin_count(), 0);
        assert_eq!(gateway.destroy_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_that_never_readies_is_destroyed() {
        let (_subscription, gateway, _player) = subscription();

        gateway.transition(GatewaySnapshot::of(GatewayStatus::Connecting));
        settle().await;

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(gateway.destroy_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_reaching_ready_in_time_survives() {
        let (_subscription, gateway, _player) = subscription();

        gateway.transition(GatewaySnapshot::of(GatewayStatus::Signalling));
        settle().await;
        gateway.transition(GatewaySnapshot::of(GatewayStatus::Ready));
        settle().await;

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(gateway.destroy_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_event_advances_queue_and_fires_callbacks() {
        let (subscription, _gateway, player) = subscription();
        let lifecycle = Arc::new(Lifecycle::default());

        subscription.queue.add_track(
            playable_track("a", counting_callbacks(lifecycle.clone())),
            None,
        );
        subscription.queue.add_track(
            playable_track("b", counting_callbacks(lifecycle.clone())),
            None,
        );

        subscription.process_queue(false).await;
        settle().await;
        assert_eq!(player.played_titles(), vec!["a"]);
        assert_eq!(lifecycle.starts.load(Ordering::SeqCst), 1);

        // Termina "a": el evento Idle dispara on_finish y el avance a "b".
        player.finish_current();
        settle().await;
        assert_eq!(player.played_titles(), vec!["a", "b"]);
        assert_eq!(lifecycle.finishes.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playing_transition_applies_queue_volume() {
        let (subscription, _gateway, player) = subscription();

        subscription
            .queue
            .add_track(playable_track("a", TrackCallbacks::default()), None);
        subscription.queue.volume_manager.set_volume(50);

        subscription.process_queue(false).await;
        settle().await;

        // 50 / 100 × 0.40 × multiplicador 1.0
        let resource = player.last_played().expect("recurso sonando");
        assert!((resource.volume().logarithmic() - 0.20).abs() < f32::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_queue_without_force_ignores_busy_player() {
        let (subscription, _gateway, player) = subscription();

        subscription
            .queue
            .add_track(playable_track("a", TrackCallbacks::default()), None);
        subscription
            .queue
            .add_track(playable_track("b", TrackCallbacks::default()), None);

        subscription.process_queue(false).await;
        settle().await;

        // Con algo sonando, el avance sin fuerza es un no-op.
        subscription.process_queue(false).await;
        settle().await;
        assert_eq!(player.played_titles(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_advance_pauses_then_skips() {
        let (subscription, _gateway, player) = subscription();

        subscription
            .queue
            .add_track(playable_track("a", TrackCallbacks::default()), None);
        subscription
            .queue
            .add_track(playable_track("b", TrackCallbacks::default()), None);

        subscription.process_queue(false).await;
        settle().await;
        subscription.process_queue(true).await;
        settle().await;

        assert_eq!(player.pause_count(), 1);
        assert_eq!(player.played_titles(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_error_reaches_track_callback() {
        let (subscription, _gateway, player) = subscription();
        let lifecycle = Arc::new(Lifecycle::default());

        subscription.queue.add_track(
            playable_track("a", counting_callbacks(lifecycle.clone())),
            None,
        );
        subscription.process_queue(false).await;
        settle().await;

        player.fail_current("códec explotó");
        settle().await;
        assert_eq!(lifecycle.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_is_idempotent() {
        let (subscription, gateway, player) = subscription();

        subscription
            .queue
            .add_track(playable_track("a", TrackCallbacks::default()), None);
        subscription.queue.set_looping_mode(LoopingMode::Queue);

        subscription.kill().await;
        subscription.kill().await;

        assert!(subscription.queue.current_track().is_none());
        assert!(subscription.queue.future_tracks().is_empty());
        assert_eq!(subscription.queue.looping_mode(), LoopingMode::Off);
        assert_eq!(player.stop_count(), 2);
        assert_eq!(gateway.disconnect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_initialization_does_not_reach_player() {
        let (subscription, _gateway, player) = subscription();
        let errors = Arc::new(AtomicUsize::new(0));

        subscription
            .queue
            .add_track(crate::music::track::test_support::failing_track(errors.clone()), None);
        subscription.process_queue(false).await;
        settle().await;

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(player.played_titles().is_empty());
        assert_eq!(player.status(), PlayerStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_loop_replays_same_track_on_finish() {
        let (subscription, _gateway, player) = subscription();

        subscription
            .queue
            .add_track(playable_track("a", TrackCallbacks::default()), None);
        subscription.queue.set_looping_mode(LoopingMode::Track);

        subscription.process_queue(false).await;
        settle().await;
        player.finish_current();
        settle().await;

        assert_eq!(player.played_titles(), vec!["a", "a"]);
        assert_eq!(subscription.queue.previous_tracks().len(), 1);
    }
}
