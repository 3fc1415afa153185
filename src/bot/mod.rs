//! Capa Discord: registro de comandos, despacho de interacciones y
//! ciclo de vida de las suscripciones por guild.

use anyhow::Result;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tracing::{error, info, warn};

pub mod commands;

use crate::config::Config;
use crate::music::driver;
use crate::music::subscription::MusicSubscription;
use crate::music::SubscriptionRegistry;
use crate::storage::JsonStorage;

/// Handler principal del bot. Implementa [`EventHandler`] de serenity y
/// es dueño del registro de suscripciones.
pub struct CoralBot {
    config: Arc<Config>,
    pub storage: Arc<tokio::sync::Mutex<JsonStorage>>,
    pub registry: Arc<SubscriptionRegistry>,
    /// Cliente HTTP compartido (TTS y API de YouTube).
    pub http: reqwest::Client,
}

impl CoralBot {
    pub fn new(
        config: Config,
        storage: Arc<tokio::sync::Mutex<JsonStorage>>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config: Arc::new(config),
            storage,
            registry: Arc::new(SubscriptionRegistry::new()),
            http,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::from(guild_id);
                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {guild_id}");
                    return Ok(());
                }
                commands::register_guild_commands(ctx, guild_id).await?;
                info!("✅ Comandos de guild registrados para: {guild_id}");
            }
            None => {
                commands::register_global_commands(ctx).await?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }

    /// Suscripción del guild, creándola (y uniéndose al canal de voz) si
    /// no existe. El volumen inicial sale de la configuración persistida
    /// del servidor.
    pub async fn ensure_subscription(
        &self,
        ctx: &Context,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<MusicSubscription>> {
        if let Some(subscription) = self.registry.get(guild_id) {
            return Ok(subscription);
        }

        let manager = songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Songbird no inicializado"))?;

        let (gateway, player) = driver::connect(manager, guild_id, channel_id).await?;
        let subscription = MusicSubscription::new(
            gateway,
            player,
            self.config.volume_policy(),
            self.config.reconnect_policy(),
        );

        let stored = self
            .storage
            .lock()
            .await
            .get_server_config(guild_id.get())
            .await?;
        subscription
            .queue
            .volume_manager
            .set_volume(stored.default_volume);

        self.registry.insert(guild_id, subscription.clone());
        info!("🔊 Conectado al canal de voz en guild {guild_id}");
        Ok(subscription)
    }

    /// Termina y des-registra la suscripción del guild, si existe.
    pub async fn drop_subscription(&self, guild_id: GuildId) {
        if let Some(subscription) = self.registry.remove(guild_id) {
            subscription.kill().await;
        }
    }
}

#[async_trait]
impl EventHandler for CoralBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(error) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {error:?}");
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            if let Err(error) = commands::handle_command(&ctx, command, self).await {
                error!("Error manejando comando: {error:?}");
            }
        }
    }

    /// Si alguien desconecta al bot a mano, la suscripción del guild se
    /// limpia acá.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id {
            return;
        }

        if old.is_some() && new.channel_id.is_none() {
            if let Some(guild_id) = new.guild_id {
                info!("🔌 Bot desconectado en guild {guild_id}");
                self.drop_subscription(guild_id).await;
            }
        }
    }
}
