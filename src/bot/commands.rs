use anyhow::Result;
use serenity::{
    builder::{
        CreateCommand, CreateCommandOption, CreateInteractionResponse,
        CreateInteractionResponseMessage, EditInteractionResponse,
    },
    model::application::{CommandInteraction, CommandOptionType, ResolvedValue},
    model::id::{ChannelId, GuildId, UserId},
    prelude::Context,
};
use std::sync::Arc;
use tracing::info;

use crate::bot::CoralBot;
use crate::music::queue::LoopingMode;
use crate::music::recon::MusicReconnaissance;
use crate::music::subscription::MusicSubscription;
use crate::music::track::{Track, TrackCallbacks};

fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        tts_command(),
        pause_command(),
        resume_command(),
        skip_command(),
        stop_command(),
        queue_command(),
        nowplaying_command(),
        shuffle_command(),
        loop_command(),
        remove_command(),
        clear_command(),
        volume_command(),
        mute_command(),
    ]
}

/// Registra comandos globales
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }
    Ok(())
}

/// Registra comandos para una guild específica (desarrollo)
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;
    Ok(())
}

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Reproduce una canción")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "query",
                "URL o término de búsqueda",
            )
            .required(true),
        )
}

fn tts_command() -> CreateCommand {
    CreateCommand::new("tts")
        .description("Lee un texto en voz alta en el canal")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "texto", "Texto a leer")
                .required(true),
        )
}

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pausa la reproducción actual")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Reanuda la reproducción pausada")
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Salta a la siguiente pista")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Detiene todo y desconecta el bot")
}

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue").description("Muestra la cola de reproducción")
}

fn nowplaying_command() -> CreateCommand {
    CreateCommand::new("nowplaying").description("Muestra la pista actual")
}

fn shuffle_command() -> CreateCommand {
    CreateCommand::new("shuffle").description("Mezcla las pistas pendientes")
}

fn loop_command() -> CreateCommand {
    CreateCommand::new("loop")
        .description("Cambia el modo de repetición")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "modo", "Modo de repetición")
                .required(true)
                .add_string_choice("Apagado", "off")
                .add_string_choice("Pista", "track")
                .add_string_choice("Cola", "queue")
                .add_string_choice("Autoplay", "autoplay"),
        )
}

fn remove_command() -> CreateCommand {
    CreateCommand::new("remove")
        .description("Remueve una pista pendiente")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::Integer,
                "posicion",
                "Posición en la cola (1 = próxima)",
            )
            .required(true)
            .min_int_value(1),
        )
}

fn clear_command() -> CreateCommand {
    CreateCommand::new("clear").description("Vacía las pistas pendientes")
}

fn volume_command() -> CreateCommand {
    CreateCommand::new("volume")
        .description("Muestra o cambia el volumen")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::Integer,
                "nivel",
                "Volumen entre 0 y 200",
            )
            .min_int_value(0)
            .max_int_value(200),
        )
}

fn mute_command() -> CreateCommand {
    CreateCommand::new("mute").description("Alterna el silencio")
}

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {guild_id}",
        command.data.name, command.user.name
    );

    match command.data.name.as_str() {
        "play" => handle_play(ctx, command, bot, guild_id).await?,
        "tts" => handle_tts(ctx, command, bot, guild_id).await?,
        "pause" => handle_pause(ctx, command, bot, guild_id).await?,
        "resume" => handle_resume(ctx, command, bot, guild_id).await?,
        "skip" => handle_skip(ctx, command, bot, guild_id).await?,
        "stop" => handle_stop(ctx, command, bot, guild_id).await?,
        "queue" => handle_queue(ctx, command, bot, guild_id).await?,
        "nowplaying" => handle_nowplaying(ctx, command, bot, guild_id).await?,
        "shuffle" => handle_shuffle(ctx, command, bot, guild_id).await?,
        "loop" => handle_loop(ctx, command, bot, guild_id).await?,
        "remove" => handle_remove(ctx, command, bot, guild_id).await?,
        "clear" => handle_clear(ctx, command, bot, guild_id).await?,
        "volume" => handle_volume(ctx, command, bot, guild_id).await?,
        "mute" => handle_mute(ctx, command, bot, guild_id).await?,
        _ => respond(ctx, &command, "❌ Comando no reconocido").await?,
    }

    Ok(())
}

async fn respond(ctx: &Context, command: &CommandInteraction, content: &str) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().content(content),
            ),
        )
        .await?;
    Ok(())
}

fn string_option(command: &CommandInteraction, name: &str) -> Option<String> {
    command.data.options().into_iter().find_map(|option| {
        if option.name != name {
            return None;
        }
        match option.value {
            ResolvedValue::String(value) => Some(value.to_string()),
            _ => None,
        }
    })
}

fn integer_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    command.data.options().into_iter().find_map(|option| {
        if option.name != name {
            return None;
        }
        match option.value {
            ResolvedValue::Integer(value) => Some(value),
            _ => None,
        }
    })
}

/// Canal de voz donde está el usuario, según el caché del gateway.
fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    ctx.cache
        .guild(guild_id)?
        .voice_states
        .get(&user_id)?
        .channel_id
}

/// Suscripción existente del guild, o una respuesta amable si no hay.
async fn active_subscription(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<Option<Arc<MusicSubscription>>> {
    match bot.registry.get(guild_id) {
        Some(subscription) => Ok(Some(subscription)),
        None => {
            respond(ctx, command, "🔇 No hay nada sonando en este servidor").await?;
            Ok(None)
        }
    }
}

async fn handle_play(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(query) = string_option(&command, "query") else {
        return respond(ctx, &command, "❌ Falta el término de búsqueda").await;
    };

    let Some(channel_id) = user_voice_channel(ctx, guild_id, command.user.id) else {
        return respond(ctx, &command, "🔇 Tenés que estar en un canal de voz").await;
    };

    // La resolución puede tardar más que la ventana de respuesta.
    command.defer(&ctx.http).await?;

    let subscription = bot.ensure_subscription(ctx, guild_id, channel_id).await?;

    let hits = MusicReconnaissance::search(&query).await?;
    let Some(hit) = hits.first() else {
        command
            .edit_response(
                &ctx.http,
                EditInteractionResponse::new().content("🔍 Sin resultados para esa búsqueda"),
            )
            .await?;
        return Ok(());
    };

    let track = Track::from_search_result(hit, TrackCallbacks::default());
    let title = track.metadata().title().to_string();
    subscription.queue.add_track(track, None);
    subscription.process_queue(false).await;

    command
        .edit_response(
            &ctx.http,
            EditInteractionResponse::new().content(format!("🎵 Encolada: **{title}**")),
        )
        .await?;
    Ok(())
}

async fn handle_tts(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(text) = string_option(&command, "texto") else {
        return respond(ctx, &command, "❌ Falta el texto a leer").await;
    };

    let Some(channel_id) = user_voice_channel(ctx, guild_id, command.user.id) else {
        return respond(ctx, &command, "🔇 Tenés que estar en un canal de voz").await;
    };

    command.defer(&ctx.http).await?;

    let subscription = bot.ensure_subscription(ctx, guild_id, channel_id).await?;

    let voice = bot
        .storage
        .lock()
        .await
        .get_server_config(guild_id.get())
        .await?
        .tts_voice
        .unwrap_or_else(|| bot.config().tts_voice.clone());

    let track = Track::text_to_speech(
        bot.http.clone(),
        text,
        bot.config().tts_provider.clone(),
        voice,
        TrackCallbacks::default(),
    );
    // El TTS se cuela al frente: es un anuncio, no una canción más.
    subscription.queue.add_track(track, Some(0));
    subscription.process_queue(false).await;

    command
        .edit_response(
            &ctx.http,
            EditInteractionResponse::new().content("🗣️ Mensaje encolado"),
        )
        .await?;
    Ok(())
}

async fn handle_pause(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(subscription) = active_subscription(ctx, &command, bot, guild_id).await? else {
        return Ok(());
    };
    subscription.queue.state_manager.pause().await;
    respond(ctx, &command, "⏸️ Pausado").await
}

async fn handle_resume(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(subscription) = active_subscription(ctx, &command, bot, guild_id).await? else {
        return Ok(());
    };
    subscription.queue.state_manager.resume().await;
    respond(ctx, &command, "▶️ Reanudado").await
}

async fn handle_skip(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(subscription) = active_subscription(ctx, &command, bot, guild_id).await? else {
        return Ok(());
    };
    subscription.process_queue(true).await;
    respond(ctx, &command, "⏭️ Saltado").await
}

async fn handle_stop(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    bot.drop_subscription(guild_id).await;
    respond(ctx, &command, "⏹️ Reproducción detenida, ¡hasta la próxima!").await
}

async fn handle_queue(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(subscription) = active_subscription(ctx, &command, bot, guild_id).await? else {
        return Ok(());
    };

    let mut lines = Vec::new();
    match subscription.queue.current_track() {
        Some(track) => lines.push(format!("🎵 Ahora: **{}**", track.metadata().title())),
        None => lines.push("🎵 Nada sonando".to_string()),
    }

    let future = subscription.queue.future_tracks();
    for (index, track) in future.iter().take(10).enumerate() {
        lines.push(format!("{}. {}", index + 1, track.metadata().title()));
    }
    if future.len() > 10 {
        lines.push(format!("… y {} más", future.len() - 10));
    }
    lines.push(format!(
        "🔁 Modo: {}",
        subscription.queue.looping_mode().as_str()
    ));

    respond(ctx, &command, &lines.join("\n")).await
}

async fn handle_nowplaying(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(subscription) = active_subscription(ctx, &command, bot, guild_id).await? else {
        return Ok(());
    };

    let content = match subscription.queue.current_track() {
        Some(track) => match track.metadata().url() {
            Some(url) => format!("🎵 **{}**\n{url}", track.metadata().title()),
            None => format!("🎵 **{}**", track.metadata().title()),
        },
        None => "🔇 Nada sonando".to_string(),
    };
    respond(ctx, &command, &content).await
}

async fn handle_shuffle(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(subscription) = active_subscription(ctx, &command, bot, guild_id).await? else {
        return Ok(());
    };
    subscription.queue.shuffle_tracks();
    respond(ctx, &command, "🔀 Cola mezclada").await
}

async fn handle_loop(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(subscription) = active_subscription(ctx, &command, bot, guild_id).await? else {
        return Ok(());
    };

    let mode = match string_option(&command, "modo").as_deref() {
        Some("track") => LoopingMode::Track,
        Some("queue") => LoopingMode::Queue,
        Some("autoplay") => LoopingMode::Autoplay,
        _ => LoopingMode::Off,
    };
    subscription.queue.set_looping_mode(mode);
    respond(ctx, &command, &format!("🔁 Modo de repetición: {}", mode.as_str())).await
}

async fn handle_remove(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(subscription) = active_subscription(ctx, &command, bot, guild_id).await? else {
        return Ok(());
    };

    // Para el usuario la cola arranca en 1.
    let position = integer_option(&command, "posicion").unwrap_or(1).max(1) as usize;
    let content = match subscription.queue.remove_track(position - 1) {
        Some(track) => format!("❌ Removida: **{}**", track.metadata().title()),
        None => "❓ No hay pista en esa posición".to_string(),
    };
    respond(ctx, &command, &content).await
}

async fn handle_clear(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(subscription) = active_subscription(ctx, &command, bot, guild_id).await? else {
        return Ok(());
    };
    subscription.queue.clear_future_tracks();
    respond(ctx, &command, "🗑️ Cola vaciada").await
}

async fn handle_volume(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(subscription) = active_subscription(ctx, &command, bot, guild_id).await? else {
        return Ok(());
    };

    match integer_option(&command, "nivel") {
        Some(level) => {
            let level = level.clamp(0, 255) as u8;
            subscription.queue.volume_manager.set_volume(level);
            // El nuevo volumen queda como default del servidor.
            bot.storage
                .lock()
                .await
                .set_default_volume(guild_id.get(), level)
                .await?;
            respond(ctx, &command, &format!("🔊 Volumen: {level}%")).await
        }
        None => {
            let current = subscription.queue.volume_manager.volume();
            respond(ctx, &command, &format!("🔊 Volumen actual: {current}%")).await
        }
    }
}

async fn handle_mute(
    ctx: &Context,
    command: CommandInteraction,
    bot: &CoralBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(subscription) = active_subscription(ctx, &command, bot, guild_id).await? else {
        return Ok(());
    };
    subscription.queue.volume_manager.toggle_mute();
    let content = if subscription.queue.volume_manager.is_muted() {
        "🔇 Silenciado"
    } else {
        "🔊 Silencio quitado"
    };
    respond(ctx, &command, content).await
}
