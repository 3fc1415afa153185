use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::SerenityInit;
use std::sync::Arc;
use tracing::{error, info, warn};

mod bot;
mod config;
mod music;
mod sources;
mod storage;

use crate::bot::CoralBot;
use crate::config::Config;
use crate::music::recon::{MusicReconnaissance, ReconContext};
use crate::storage::JsonStorage;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coral_music=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Coral Music v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    // Verificar dependencias externas
    if let Err(error) = sources::ytdlp::verify_dependencies().await {
        warn!("⚠️ yt-dlp no disponible: {error}");
    }

    // Inicializar almacenamiento JSON
    let storage = Arc::new(tokio::sync::Mutex::new(
        JsonStorage::new(config.data_dir.clone()).await?,
    ));

    // Cliente HTTP compartido (TTS, API de YouTube)
    let http = reqwest::Client::new();

    // Inicializar el servicio de reconocimiento musical
    MusicReconnaissance::initialize(ReconContext {
        http: http.clone(),
        youtube_api_key: config.youtube_api_key.clone(),
    });

    // Intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = CoralBot::new(config.clone(), storage, http);

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird()
        .await?;

    // Shutdown graceful
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Error al registrar Ctrl+C");
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        std::process::exit(0);
    });

    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {why:?}");
    }

    Ok(())
}
