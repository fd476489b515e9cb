use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error};
use url::Url;

use crate::config::AuthMode;
use crate::envelope::{Envelope, MessageType};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Parser, Debug)]
#[command(name = "beach-signal")]
#[command(about = "Beach Signal relay server and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Listen port (overrides BEACH_SIGNAL_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Admission mode (overrides BEACH_SIGNAL_AUTH_MODE)
    #[arg(long, value_enum)]
    pub auth_mode: Option<AuthMode>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a relay as a client
    Debug {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Identity to register under
        #[arg(long = "as")]
        identity: String,

        /// Bearer token for relays that require one
        #[arg(long)]
        token: Option<String>,

        /// Where to present the token
        #[arg(long, value_enum, default_value_t = TokenCarrier::Query)]
        token_via: TokenCarrier,

        #[command(subcommand)]
        command: DebugCommands,
    },

    /// List identities currently bound on a relay
    Users {
        /// Relay HTTP URL (e.g., http://localhost:8080)
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum DebugCommands {
    /// Print every envelope delivered to this identity
    Listen {
        /// How long to listen
        #[arg(short, long, default_value_t = 30)]
        seconds: u64,
    },

    /// Send one envelope and print the replies
    Send {
        /// Destination identity
        #[arg(long)]
        to: String,

        /// Envelope type (offer, answer, candidate, initiate_call, ...)
        #[arg(long = "type")]
        kind: MessageType,

        #[arg(long)]
        sdp: Option<String>,

        #[arg(long)]
        candidate: Option<String>,

        #[arg(long)]
        call_id: Option<String>,

        #[arg(long)]
        message: Option<String>,

        /// Seconds to wait for replies
        #[arg(short, long, default_value_t = 3)]
        wait: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TokenCarrier {
    Header,
    Query,
}

impl From<TokenCarrier> for AuthMode {
    fn from(carrier: TokenCarrier) -> Self {
        match carrier {
            TokenCarrier::Header => AuthMode::Header,
            TokenCarrier::Query => AuthMode::Query,
        }
    }
}

pub async fn run_debug_client(
    url: String,
    identity: String,
    token: Option<String>,
    token_via: TokenCarrier,
    command: DebugCommands,
) -> Result<()> {
    let mut socket = connect(&url, token.as_deref(), token_via).await?;

    // A verified token already binds the subject; otherwise register explicitly
    if token.is_none() {
        send_envelope(&mut socket, &Envelope::new(MessageType::Register, identity.as_str())).await?;
        debug!("Registered as {}", identity);
    }

    let listen_for = match command {
        DebugCommands::Listen { seconds } => Duration::from_secs(seconds),
        DebugCommands::Send {
            to,
            kind,
            sdp,
            candidate,
            call_id,
            message,
            wait,
        } => {
            let mut envelope = Envelope::new(kind, identity.as_str())
                .to(to)
                .call_id(call_id.map(serde_json::Value::String));
            envelope.sdp = sdp.map(serde_json::Value::String);
            envelope.candidate = candidate.map(serde_json::Value::String);
            envelope.message = message;
            send_envelope(&mut socket, &envelope).await?;
            Duration::from_secs(wait)
        }
    };

    print_incoming(&mut socket, listen_for).await?;

    socket.send(Message::Close(None)).await?;
    Ok(())
}

pub async fn list_users(url: String) -> Result<()> {
    let endpoint = format!("{}/users", url.trim_end_matches('/'));
    let users: Vec<String> = reqwest::Client::new()
        .get(&endpoint)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if users.is_empty() {
        println!("(no identities bound)");
    }
    for user in users {
        println!("{}", user);
    }
    Ok(())
}

/// Relay URL as given, with the token appended to its query in query mode
fn websocket_url(url: &str, token: Option<&str>, token_via: TokenCarrier) -> Result<Url> {
    let mut ws_url =
        Url::parse(url).map_err(|err| anyhow::anyhow!("invalid relay url {}: {}", url, err))?;
    if let (Some(token), AuthMode::Query) = (token, AuthMode::from(token_via)) {
        ws_url.query_pairs_mut().append_pair("token", token);
    }
    Ok(ws_url)
}

async fn connect(url: &str, token: Option<&str>, token_via: TokenCarrier) -> Result<Socket> {
    let ws_url = websocket_url(url, token, token_via)?;
    let mut request = ws_url.as_str().into_client_request()?;
    if let (Some(token), AuthMode::Header) = (token, AuthMode::from(token_via)) {
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(&format!("access_token, {}", token))?,
        );
    }

    match timeout(Duration::from_secs(5), connect_async(request)).await {
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            Err(anyhow::anyhow!("Connection failed: {}", e))
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            Err(anyhow::anyhow!(
                "Connection timeout - is the relay running?"
            ))
        }
    }
}

async fn send_envelope(socket: &mut Socket, envelope: &Envelope) -> Result<()> {
    let text = serde_json::to_string(envelope)?;
    socket.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn print_incoming(socket: &mut Socket, window: Duration) -> Result<()> {
    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        let next = match timeout(remaining, socket.next()).await {
            Ok(next) => next,
            Err(_) => return Ok(()),
        };
        match next {
            Some(Ok(Message::Text(text))) => println!("{}", describe_frame(&text)),
            Some(Ok(Message::Close(frame))) => {
                match frame {
                    Some(frame) => println!(
                        "closed by relay: {} {}",
                        u16::from(frame.code),
                        frame.reason.as_str()
                    ),
                    None => println!("closed by relay"),
                }
                return Ok(());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(()),
        }
    }
}

/// One line per envelope: `<type> <from> -> <to>` plus the raw frame
fn describe_frame(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => {
            let field = |name: &str| {
                value
                    .get(name)
                    .and_then(|v| v.as_str())
                    .unwrap_or("?")
                    .to_string()
            };
            format!(
                "{} {} -> {}  {}",
                field("type"),
                field("from"),
                field("to"),
                text
            )
        }
        Err(_) => format!("(unparsed) {}", text),
    }
}
