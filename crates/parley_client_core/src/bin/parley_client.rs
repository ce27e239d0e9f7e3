#![forbid(unsafe_code)]

use parley_client_core::{ClientConfigV1, LedgerChange, MessageLedger, Session};
use parley_domain::{CorrelationId, RoomId};
use parley_protocol::{ClientEvent, OutgoingMessage, ServerEvent};
use parley_util::endpoint::DEFAULT_PORT;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_client [--connect quic://host:port] [--credential token] [--room id] [--send text]\n\
\n\
Options:\n\
	--connect     Server endpoint (default: quic://localhost:{DEFAULT_PORT})\n\
	--credential  Identity credential (default: $PARLEY_CLIENT_CREDENTIAL)\n\
	--room        Room to join before sending\n\
	--send        Text to send to --room\n\
	--help        Show this help\n\
\n\
Examples:\n\
	parley_client --connect quic://127.0.0.1:{DEFAULT_PORT} --room lobby\n\
	parley_client --room lobby --send 'hello there'\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	cfg: ClientConfigV1,
	room: Option<RoomId>,
	send: Option<String>,
}

fn non_empty(flag: &str, v: Option<String>) -> String {
	let v = v.unwrap_or_else(|| usage_and_exit());
	if v.trim().is_empty() {
		eprintln!("{flag} must be non-empty");
		usage_and_exit();
	}
	v
}

fn parse_args() -> Args {
	let mut endpoint = format!("quic://localhost:{DEFAULT_PORT}");
	let mut credential = std::env::var("PARLEY_CLIENT_CREDENTIAL")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let mut room: Option<RoomId> = None;
	let mut send: Option<String> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" => endpoint = non_empty("--connect", it.next()),
			"--credential" => credential = Some(non_empty("--credential", it.next())),
			"--room" => {
				let v = non_empty("--room", it.next());
				room = Some(RoomId::new(v).unwrap_or_else(|_| usage_and_exit()));
			}
			"--send" => send = Some(non_empty("--send", it.next())),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	if send.is_some() && room.is_none() {
		eprintln!("--send needs --room");
		usage_and_exit();
	}

	let mut cfg = ClientConfigV1::from_quic_endpoint(&endpoint).unwrap_or_else(|e| {
		eprintln!("Invalid --connect value: {endpoint}\n{e}");
		usage_and_exit();
	});
	cfg.client_name = format!("parley-client-cli/{}", env!("CARGO_PKG_VERSION"));
	cfg.client_instance_id = format!("cli-{}", std::process::id());
	cfg.credential = credential.unwrap_or_default();

	Args { cfg, room, send }
}

fn print_event(ev: &ServerEvent) {
	match ev {
		ServerEvent::NewMessage { message, .. } => {
			let place = message.room().map(|r| format!("#{r}")).unwrap_or_else(|| "dm".to_string());
			println!("[{place}] {}: {}", message.sender, message.text);
		}
		ServerEvent::UserOnline { user_id, .. } => println!("* {user_id} is online"),
		ServerEvent::UserOffline { user_id, .. } => println!("* {user_id} went offline"),
		ServerEvent::UserJoinedRoom { room_id, user_id, .. } => println!("* {user_id} joined #{room_id}"),
		ServerEvent::UserLeftRoom { room_id, user_id, .. } => println!("* {user_id} left #{room_id}"),
		other => println!("{} {}", other.name(), serde_json::to_string(other).unwrap_or_default()),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let resolved = args.cfg.server_addr.map(|a| a.to_string()).unwrap_or_else(|| "<dns>".to_string());
	info!(server = %resolved, sni = %args.cfg.server_host, "connecting");

	let (mut session, welcome) = Session::connect(args.cfg).await?;
	info!(
		user_id = %welcome.user_id,
		online = welcome.online_users.len(),
		"connected; entering events loop"
	);

	let mut ledger = MessageLedger::new(welcome.user_id.clone());

	if let Some(room_id) = args.room {
		session.send(ClientEvent::JoinRoom { room_id: room_id.clone() }).await?;
		if let Some(text) = args.send {
			let correlation_id = CorrelationId::new(uuid::Uuid::new_v4().to_string())?;
			session
				.send(ClientEvent::SendRoomMessage(OutgoingMessage {
					room_id: Some(room_id),
					text,
					correlation_id: Some(correlation_id),
					..OutgoingMessage::default()
				}))
				.await?;
		}
	}

	while let Some(ev) = session.next_event().await? {
		match ledger.apply(&ev) {
			// Copies of a message already shown stay quiet.
			LedgerChange::Replaced | LedgerChange::Reconciled | LedgerChange::Ignored
				if matches!(ev, ServerEvent::NewMessage { .. }) => {}
			LedgerChange::Failed => warn!(event = ev.name(), "message was not delivered"),
			_ => print_event(&ev),
		}
	}

	info!("server closed the session");
	Ok(())
}
