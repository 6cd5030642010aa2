use sqlx::sqlite::SqlitePoolOptions;
use teloxide::{prelude::*, utils::command::BotCommands};

/// Chat-facing subscription management, kept to the minimum that exercises
/// the engine's interface: registering and removing a `user_subscriptions`
/// row through the same sqlite schema the engine reads. Account creation,
/// captcha, and notification delivery are handled elsewhere.
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    #[command(description = "show available commands")]
    Help,
    #[command(description = "subscribe: /watch <venue_id> <party_size> <start HH:MM> <end HH:MM>")]
    Watch(String),
    #[command(description = "unsubscribe: /unwatch <venue_id> <party_size>")]
    Unwatch(String),
    #[command(description = "list your active subscriptions")]
    List,
}

#[derive(Clone)]
struct BotState {
    pool: sqlx::SqlitePool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let bot_token = std::env::var("BOT_TOKEN").expect("BOT_TOKEN must be set");
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:sniper.db?mode=rwc".into());

    let pool = SqlitePoolOptions::new()
        .max_connections(3)
        .connect(&database_url)
        .await?;

    let bot = Bot::new(&bot_token);
    let state = BotState { pool };

    tracing::info!("subscription bot starting");

    Command::repl(bot, move |bot: Bot, msg: Message, cmd: Command| {
        let state = state.clone();
        async move {
            if let Err(e) = handle_command(&bot, &msg, cmd, &state).await {
                tracing::warn!(error = %e, "command handler failed");
                bot.send_message(msg.chat.id, format!("error: {e}")).await.ok();
            }
            Ok(())
        }
    })
    .await;

    Ok(())
}

async fn handle_command(bot: &Bot, msg: &Message, cmd: Command, state: &BotState) -> anyhow::Result<()> {
    let chat_id = msg.chat.id.0;
    match cmd {
        Command::Help => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string()).await?;
        }
        Command::Watch(args) => {
            let parts: Vec<&str> = args.split_whitespace().collect();
            let [venue_id, party_size, start, end] = parts[..] else {
                bot.send_message(msg.chat.id, "usage: /watch <venue_id> <party_size> <start HH:MM> <end HH:MM>").await?;
                return Ok(());
            };
            let party_size: i64 = party_size.parse()?;

            let user_id = upsert_user_by_chat_id(&state.pool, chat_id).await?;
            let restaurant_id = restaurant_id_for_venue(&state.pool, venue_id).await?;
            let Some(restaurant_id) = restaurant_id else {
                bot.send_message(msg.chat.id, format!("unknown venue_id {venue_id}")).await?;
                return Ok(());
            };

            sqlx::query(
                "INSERT INTO user_subscriptions
                    (user_id, restaurant_id, party_size, window_start, window_end, enabled)
                 VALUES (?, ?, ?, ?, ?, 1)
                 ON CONFLICT(user_id, restaurant_id, party_size) DO UPDATE SET
                    window_start = excluded.window_start,
                    window_end = excluded.window_end,
                    enabled = 1",
            )
            .bind(user_id)
            .bind(restaurant_id)
            .bind(party_size)
            .bind(start)
            .bind(end)
            .execute(&state.pool)
            .await?;

            bot.send_message(msg.chat.id, format!("watching {venue_id} for party of {party_size}, {start}-{end}")).await?;
        }
        Command::Unwatch(args) => {
            let parts: Vec<&str> = args.split_whitespace().collect();
            let [venue_id, party_size] = parts[..] else {
                bot.send_message(msg.chat.id, "usage: /unwatch <venue_id> <party_size>").await?;
                return Ok(());
            };
            let party_size: i64 = party_size.parse()?;

            let Some(restaurant_id) = restaurant_id_for_venue(&state.pool, venue_id).await? else {
                bot.send_message(msg.chat.id, format!("unknown venue_id {venue_id}")).await?;
                return Ok(());
            };

            sqlx::query(
                "UPDATE user_subscriptions SET enabled = 0
                 WHERE user_id = (SELECT id FROM users WHERE chat_id = ?)
                   AND restaurant_id = ? AND party_size = ?",
            )
            .bind(chat_id)
            .bind(restaurant_id)
            .bind(party_size)
            .execute(&state.pool)
            .await?;

            bot.send_message(msg.chat.id, format!("stopped watching {venue_id} for party of {party_size}")).await?;
        }
        Command::List => {
            let rows: Vec<(String, i64, String, String)> = sqlx::query_as(
                "SELECT r.name, s.party_size, s.window_start, s.window_end
                 FROM user_subscriptions s
                 JOIN restaurants r ON r.id = s.restaurant_id
                 JOIN users u ON u.id = s.user_id
                 WHERE u.chat_id = ? AND s.enabled = 1",
            )
            .bind(chat_id)
            .fetch_all(&state.pool)
            .await?;

            if rows.is_empty() {
                bot.send_message(msg.chat.id, "no active subscriptions").await?;
            } else {
                let text = rows
                    .into_iter()
                    .map(|(name, party_size, start, end)| format!("{name}: party of {party_size}, {start}-{end}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                bot.send_message(msg.chat.id, text).await?;
            }
        }
    }
    Ok(())
}

async fn upsert_user_by_chat_id(pool: &sqlx::SqlitePool, chat_id: i64) -> anyhow::Result<i64> {
    sqlx::query("INSERT INTO users (chat_id) VALUES (?) ON CONFLICT(chat_id) DO NOTHING")
        .bind(chat_id)
        .execute(pool)
        .await?;
    let id: i64 = sqlx::query_scalar("SELECT id FROM users WHERE chat_id = ?")
        .bind(chat_id)
        .fetch_one(pool)
        .await?;
    Ok(id)
}

async fn restaurant_id_for_venue(pool: &sqlx::SqlitePool, venue_id: &str) -> anyhow::Result<Option<i64>> {
    Ok(sqlx::query_scalar("SELECT id FROM restaurants WHERE venue_id = ?")
        .bind(venue_id)
        .fetch_optional(pool)
        .await?)
}
