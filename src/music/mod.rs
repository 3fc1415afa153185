//! Núcleo de reproducción musical por guild.

pub mod driver;
pub mod queue;
pub mod recon;
pub mod subscription;
pub mod track;
pub mod transport;
pub mod volume;

#[cfg(test)]
pub(crate) mod fakes;

use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::sync::Arc;
use tracing::info;

use crate::music::subscription::MusicSubscription;

/// Suscripciones activas, una por guild. Registro explícito: quien crea
/// la suscripción la inserta y quien la mata la remueve.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: DashMap<GuildId, Arc<MusicSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<MusicSubscription>> {
        self.subscriptions
            .get(&guild_id)
            .map(|entry| entry.value().clone())
    }

    pub fn insert(&self, guild_id: GuildId, subscription: Arc<MusicSubscription>) {
        info!("🎧 Suscripción registrada para guild {guild_id}");
        self.subscriptions.insert(guild_id, subscription);
    }

    /// Remueve y devuelve la suscripción del guild, si existía. Soltar
    /// la última referencia fuerte termina sus tareas de eventos.
    pub fn remove(&self, guild_id: GuildId) -> Option<Arc<MusicSubscription>> {
        self.subscriptions
            .remove(&guild_id)
            .map(|(_, subscription)| {
                info!("🎧 Suscripción removida para guild {guild_id}");
                subscription
            })
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
