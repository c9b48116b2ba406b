//! Command handlers and terminal output.

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tracing::warn;

use crmdesk_core::api::{ApiError, GatewayEvent};
use crmdesk_core::auth::LoginFailure;
use crmdesk_core::models::{Conversation, ConversationId, QueueFilters, QueuePage, TransferRequest};
use crmdesk_core::utils::{format_date, format_phone, truncate};
use crmdesk_core::{Config, SessionStore};

use crate::{Command, QueueArgs, TransferArgs};

/// Environment variable read instead of prompting for the password
const PASSWORD_ENV: &str = "CRMDESK_PASSWORD";

const NOT_SIGNED_IN: &str = "Not signed in. Run `crmdesk login` first.";
const SESSION_EXPIRED_HINT: &str = "Your session has expired. Run `crmdesk login` to sign in again.";

// Column widths of the queue listing
const NAME_WIDTH: usize = 24;
const PHONE_WIDTH: usize = 20;
const LABEL_WIDTH: usize = 12;
const MESSAGE_WIDTH: usize = 40;

pub async fn dispatch(command: Command, session: &SessionStore, config: &Config) -> Result<()> {
    match command {
        Command::Login { username } => login(session, config, username).await,
        Command::Logout => {
            session.logout();
            println!("Signed out.");
            Ok(())
        }
        Command::Whoami => whoami(session).await,
        Command::Queue(args) => queue(session, config, args).await,
        Command::Take { id } => {
            require_session(session).await?;
            let conversation = session
                .api()
                .take_conversation(id)
                .await
                .context("Could not take the conversation")?;
            print_action("Taken", &conversation);
            Ok(())
        }
        Command::Resolve { id } => {
            require_session(session).await?;
            let conversation = session
                .api()
                .resolve_conversation(id)
                .await
                .context("Could not mark the conversation as resolved")?;
            print_action("Resolved", &conversation);
            Ok(())
        }
        Command::Close { id } => {
            require_session(session).await?;
            let conversation = session
                .api()
                .close_conversation(id)
                .await
                .context("Could not close the conversation")?;
            print_action("Closed", &conversation);
            Ok(())
        }
        Command::Read { id } => {
            require_session(session).await?;
            let conversation = session
                .api()
                .mark_read(id)
                .await
                .context("Could not mark the conversation as read")?;
            print_action("Marked read", &conversation);
            Ok(())
        }
        Command::Unread { id } => {
            require_session(session).await?;
            let conversation = session
                .api()
                .mark_unread(id)
                .await
                .context("Could not mark the conversation as unread")?;
            print_action("Marked unread", &conversation);
            Ok(())
        }
        Command::Send { id, text } => send(session, id, &text).await,
        Command::Transfer(args) => transfer(session, args).await,
    }
}

// ============================================================================
// Session commands
// ============================================================================

async fn login(session: &SessionStore, config: &Config, username: Option<String>) -> Result<()> {
    let username = match username {
        Some(username) => username,
        None => prompt_username(config.last_username.as_deref())?,
    };
    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) if !password.is_empty() => password,
        _ => rpassword::prompt_password("Password: ").context("Failed to read password")?,
    };

    let user = session.login(&username, &password).await?;
    remember_username(&username);

    let name = user.display_name().unwrap_or(username);
    println!("Signed in as {}.", name);
    Ok(())
}

fn prompt_username(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Username [{}]: ", last),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let entered = line.trim();

    match (entered.is_empty(), last) {
        (false, _) => Ok(entered.to_string()),
        (true, Some(last)) => Ok(last.to_string()),
        (true, None) => bail!("A username is required"),
    }
}

/// Persist the username for the next prompt, leaving command line overrides out
fn remember_username(username: &str) {
    let mut stored = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Failed to reload config, username not saved");
            return;
        }
    };
    stored.last_username = Some(username.to_string());
    if let Err(e) = stored.save() {
        warn!(error = %e, "Failed to save config");
    }
}

async fn whoami(session: &SessionStore) -> Result<()> {
    require_session(session).await?;
    let state = session.state();
    let Some(user) = state.user else {
        bail!(NOT_SIGNED_IN);
    };

    println!("{}", user.display_name().unwrap_or_else(|| "(unnamed)".to_string()));
    if let Some(email) = user.email() {
        println!("  email: {}", email);
    }
    if let Some(id) = user.id() {
        println!("  id:    {}", id);
    }
    Ok(())
}

/// Validate the stored session; protected commands refuse to run without one.
async fn require_session(session: &SessionStore) -> Result<()> {
    if session.check_auth().await {
        Ok(())
    } else {
        bail!(NOT_SIGNED_IN)
    }
}

// ============================================================================
// Queue
// ============================================================================

async fn queue(session: &SessionStore, config: &Config, args: QueueArgs) -> Result<()> {
    require_session(session).await?;

    let filters = QueueFilters {
        status_atendimento: Some(args.status),
        modo_atendimento: args.mode,
        prioridade: args.priority,
        apenas_nao_lidas: args.unread,
        search: args.search,
        page: Some(args.page),
        page_size: args.page_size.or(config.page_size),
    };
    let page = session
        .api()
        .fetch_queue(&filters)
        .await
        .context("Could not load the service queue")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&page)?);
    } else {
        print_queue(&page, args.page);
    }
    Ok(())
}

fn print_queue(page: &QueuePage, current: u32) {
    if page.results.is_empty() {
        println!("No conversations match these filters.");
        return;
    }

    println!(
        "  {:>6}  {:<name$}  {:<phone$}  {:<label$}  {:<label$}  {:>7}  {}",
        "ID",
        "CONTACT",
        "PHONE",
        "STATUS",
        "PRIORITY",
        "WAIT",
        "LAST MESSAGE",
        name = NAME_WIDTH,
        phone = PHONE_WIDTH,
        label = LABEL_WIDTH,
    );
    for conversation in &page.results {
        println!("{}", queue_row(conversation));
    }
    println!();
    println!(
        "Page {} of {} ({} conversations){}{}",
        current.max(1),
        page.total_pages(),
        page.count,
        if page.has_previous() { "  [--page - 1]" } else { "" },
        if page.has_next() { "  [--page + 1]" } else { "" },
    );
}

fn queue_row(conversation: &Conversation) -> String {
    let marker = if conversation.is_unread() { '*' } else { ' ' };
    format!(
        "{} {:>6}  {:<name$}  {:<phone$}  {:<label$}  {:<label$}  {:>7}  {}",
        marker,
        conversation.id,
        truncate(conversation.contact_name().unwrap_or("-"), NAME_WIDTH),
        truncate(&conversation.contact_phone().map(format_phone).unwrap_or_else(|| "-".to_string()), PHONE_WIDTH),
        truncate(conversation.status_label().unwrap_or("-"), LABEL_WIDTH),
        truncate(conversation.priority_label().unwrap_or("-"), LABEL_WIDTH),
        conversation.wait_display().unwrap_or_default(),
        truncate(conversation.last_message_text().unwrap_or(""), MESSAGE_WIDTH),
        name = NAME_WIDTH,
        phone = PHONE_WIDTH,
        label = LABEL_WIDTH,
    )
}

// ============================================================================
// Conversation actions
// ============================================================================

async fn send(session: &SessionStore, id: ConversationId, text: &str) -> Result<()> {
    if text.trim().is_empty() {
        bail!("The message is empty");
    }
    require_session(session).await?;
    session
        .api()
        .send_message(id, text)
        .await
        .context("Could not send the message")?;
    println!("Message sent to conversation {}.", id);
    Ok(())
}

async fn transfer(session: &SessionStore, args: TransferArgs) -> Result<()> {
    if args.sector.is_none() && args.agent.is_none() {
        bail!("Choose a target with --sector or --agent");
    }
    require_session(session).await?;

    let request = TransferRequest {
        novo_setor_id: args.sector,
        novo_atendente_id: args.agent,
        motivo: args.reason,
    };
    let conversation = session
        .api()
        .transfer_conversation(args.id, &request)
        .await
        .context("Could not transfer the conversation")?;
    print_action("Transferred", &conversation);
    Ok(())
}

fn print_action(verb: &str, conversation: &Conversation) {
    let contact = conversation.contact_name().unwrap_or("-");
    match conversation.status_label() {
        Some(status) => println!("{} conversation {} ({}), now {}.", verb, conversation.id, contact, status),
        None => println!("{} conversation {} ({}).", verb, conversation.id, contact),
    }
    if let Some(started) = conversation.data_inicio.as_deref() {
        println!("  started {}", format_date(started));
    }
}

// ============================================================================
// Errors and events
// ============================================================================

/// The message shown to the user for a failed command.
///
/// API failures use the backend's own message when it sent one, then the
/// failure category's generic message, then the command's context.
pub fn describe_error(error: &anyhow::Error) -> String {
    if let Some(failure) = error.downcast_ref::<LoginFailure>() {
        return failure.message().to_string();
    }
    if let Some(api_error) = error.downcast_ref::<ApiError>() {
        return api_error.user_message(&error.to_string());
    }
    format!("{:#}", error)
}

/// Print a sign-in hint if the gateway gave up on the session.
pub fn report_session_events(events: &mut broadcast::Receiver<GatewayEvent>) {
    let mut expired = false;
    loop {
        match events.try_recv() {
            Ok(GatewayEvent::LoginRequired) => expired = true,
            Ok(GatewayEvent::CredentialRenewed) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    if expired {
        eprintln!("{}", SESSION_EXPIRED_HINT);
    }
}
