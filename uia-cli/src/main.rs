use anyhow::{Context, Result, bail};
use argh::FromArgs;
use serde_json::{Map, Value};

use crate::client::Client;

mod a11y;
mod client;
mod runner;
mod types;

const DEFAULT_PORT: u16 = 6790;

/// UiAutomator server CLI
#[derive(FromArgs)]
struct Cli {
    /// local port forwarded to the device server
    #[argh(option, default = "default_port()")]
    port: u16,

    /// session id (defaults to $UIA_SESSION)
    #[argh(option)]
    session: Option<String>,

    #[argh(subcommand)]
    command: Command,
}

fn default_port() -> u16 {
    std::env::var("UIA_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Start(StartCmd),
    Status(StatusCmd),
    Session(SessionCmd),
    Source(SourceCmd),
    Find(FindCmd),
    Attr(AttrCmd),
    Click(ClickCmd),
    Type(TypeCmd),
    Settings(SettingsCmd),
    Quit(QuitCmd),
    Version(VersionCmd),
}

/// forward the port and start the server instrumentation on device
#[derive(FromArgs)]
#[argh(subcommand, name = "start")]
struct StartCmd {
    /// port the server listens on inside the device
    #[argh(option, default = "DEFAULT_PORT")]
    device_port: u16,
}

/// show server status
#[derive(FromArgs)]
#[argh(subcommand, name = "status")]
struct StatusCmd {}

/// create a session and print its id
#[derive(FromArgs)]
#[argh(subcommand, name = "session")]
struct SessionCmd {
    /// capability as key=value (value parsed as JSON when possible)
    #[argh(positional)]
    capabilities: Vec<String>,
}

/// print the page source
#[derive(FromArgs)]
#[argh(subcommand, name = "source")]
struct SourceCmd {
    /// print a compact outline instead of raw XML
    #[argh(switch)]
    outline: bool,
}

/// find elements and print their ids
#[derive(FromArgs)]
#[argh(subcommand, name = "find")]
struct FindCmd {
    /// locator strategy, e.g. "xpath", "id", "-android uiautomator"
    #[argh(positional)]
    strategy: String,
    #[argh(positional)]
    selector: String,
    /// element id to search under
    #[argh(option)]
    context: Option<String>,
    /// return every match instead of the first
    #[argh(switch)]
    all: bool,
}

/// print an element attribute
#[derive(FromArgs)]
#[argh(subcommand, name = "attr")]
struct AttrCmd {
    #[argh(positional)]
    element: String,
    #[argh(positional)]
    name: String,
}

/// click an element
#[derive(FromArgs)]
#[argh(subcommand, name = "click")]
struct ClickCmd {
    #[argh(positional)]
    element: String,
}

/// replace the text of an element
#[derive(FromArgs)]
#[argh(subcommand, name = "type")]
struct TypeCmd {
    #[argh(positional)]
    element: String,
    #[argh(positional)]
    text: String,
}

/// show settings, or update them with key=value pairs
#[derive(FromArgs)]
#[argh(subcommand, name = "settings")]
struct SettingsCmd {
    #[argh(positional)]
    updates: Vec<String>,
}

/// end the current session
#[derive(FromArgs)]
#[argh(subcommand, name = "quit")]
struct QuitCmd {}

/// print version
#[derive(FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCmd {}

/// Parses `key=value` pairs; values that are valid JSON keep their type.
fn parse_pairs(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("expected key=value, got '{pair}'"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

fn session_id(session: Option<String>) -> Result<String> {
    session
        .or_else(|| std::env::var("UIA_SESSION").ok())
        .ok_or_else(|| anyhow::anyhow!("--session or UIA_SESSION required"))
}

/// Polls `/status` until the freshly started server answers.
async fn wait_ready(client: &Client) -> Result<()> {
    let mut delay_ms = 1u64;
    let mut total_ms = 0u64;
    loop {
        if let Ok(status) = client.status().await {
            if status.ready {
                eprintln!("debug: server ready after {total_ms}ms");
                return Ok(());
            }
        }
        if total_ms >= 30000 {
            bail!("server did not become ready after 30s");
        }
        delay_ms = (delay_ms * 2).min(1000);
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        total_ms += delay_ms;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    if let Command::Version(_) = &cli.command {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let client = Client::new(cli.port)?;

    match cli.command {
        Command::Start(cmd) => {
            runner::start(cli.port, cmd.device_port)?;
            wait_ready(&client).await?;
        }
        Command::Status(_) => {
            let status = client.status().await?;
            println!("{}", status.message);
            if !status.ready {
                bail!("server is not ready");
            }
        }
        Command::Session(cmd) => {
            let id = client.create_session(parse_pairs(&cmd.capabilities)?).await?;
            println!("{id}");
        }
        Command::Source(cmd) => {
            let xml = client.source(&session_id(cli.session)?).await?;
            if cmd.outline {
                println!("{}", a11y::render_outline(&xml)?);
            } else {
                println!("{xml}");
            }
        }
        Command::Find(cmd) => {
            let ids = client
                .find(
                    &session_id(cli.session)?,
                    cmd.context.as_deref(),
                    &cmd.strategy,
                    &cmd.selector,
                    cmd.all,
                )
                .await?;
            for id in ids {
                println!("{id}");
            }
        }
        Command::Attr(cmd) => {
            match client
                .attribute(&session_id(cli.session)?, &cmd.element, &cmd.name)
                .await?
            {
                Some(value) => println!("{value}"),
                None => eprintln!("note: attribute has no value"),
            }
        }
        Command::Click(cmd) => {
            client.click(&session_id(cli.session)?, &cmd.element).await?;
        }
        Command::Type(cmd) => {
            client
                .type_text(&session_id(cli.session)?, &cmd.element, &cmd.text)
                .await?;
        }
        Command::Settings(cmd) => {
            let session = session_id(cli.session)?;
            let settings = if cmd.updates.is_empty() {
                client.settings(&session).await?
            } else {
                client
                    .update_settings(&session, parse_pairs(&cmd.updates)?)
                    .await?
            };
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Command::Quit(_) => {
            client.delete_session(&session_id(cli.session)?).await?;
        }
        Command::Version(_) => unreachable!(),
    }

    Ok(())
}
