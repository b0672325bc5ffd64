use anyhow::Result;
use clap::Parser;
use demo::{describe, Command, HELP};
use simple_call::{
    generate_peer_id, Config, ConnectionState, Controller, InitArgs, MediaKind,
    RtcSessionFactory, WebSocketTransport,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// this client's id. a random one is generated if omitted
    #[arg(long)]
    id: Option<String>,
    /// base url of the relay. overrides the config file
    #[arg(long)]
    relay: Option<String>,
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} [{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%3f"),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(relay) = cli.relay {
        config.relay_url = relay;
    }
    let id = cli.id.unwrap_or_else(generate_peer_id);
    println!("your id is {}", id);

    // a media source must be added before negotiating or the SDP has no audio section
    let audio = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 1,
            ..Default::default()
        },
        "audio".to_owned(),
        "simple-call".to_owned(),
    ));
    let (remote_track_tx, remote_track_rx) = mpsc::unbounded_channel();
    let sessions = RtcSessionFactory::new(config.ice_servers.clone())?
        .with_local_track(MediaKind::Audio, audio)
        .with_remote_track_chan(remote_track_tx);

    let mut controller = Controller::init(InitArgs {
        id,
        config,
        transport: Box::new(WebSocketTransport::new()),
        sessions: Box::new(sessions),
    });

    tokio::select! {
        r = run(&controller, remote_track_rx) => {
            if let Err(e) = r {
                log::error!("demo terminated: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
        }
    }

    controller.deinit().await?;
    Ok(())
}

async fn run(
    controller: &Controller,
    mut remote_track_rx: mpsc::UnboundedReceiver<Arc<TrackRemote>>,
) -> Result<()> {
    let mut sub = controller.subscribe();
    println!("{}", describe(&simple_call::Update::State(sub.initial.clone())));
    controller.connect().await?;
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Ok(Command::Quit) => return Ok(()),
                    Ok(cmd) => handle_command(controller, cmd).await,
                    Err(e) => println!("{}\n{}", e, HELP),
                }
            }
            update = sub.next() => match update {
                Some(update) => println!("{}", describe(&update)),
                None => return Ok(()),
            },
            Some(track) = remote_track_rx.recv() => {
                tokio::spawn(drain_track(track));
            }
        }
    }
}

async fn handle_command(controller: &Controller, cmd: Command) {
    let accept = cmd == Command::Accept;
    let r = match cmd {
        Command::Call(target) => controller.place_call(&target).await,
        Command::Accept | Command::Reject => {
            let ConnectionState::ReceivedCall(peer) = controller.state() else {
                println!("nobody is calling");
                return;
            };
            if accept {
                controller.accept_incoming_call(&peer).await
            } else {
                controller.reject_incoming_call(&peer).await
            }
        }
        Command::HangUp => controller.hang_up().await,
        Command::Media(kind, enabled) => controller.set_media_enabled(kind, enabled).await,
        Command::Quit => return,
    };
    if let Err(e) = r {
        println!("{}", e);
    }
}

// nothing renders remote media here, so the packets are only counted
async fn drain_track(track: Arc<TrackRemote>) {
    log::info!("receiving a remote track");
    let mut b = [0u8; 4096];
    let mut total = 0usize;
    loop {
        match track.read(&mut b).await {
            Ok((siz, _attr)) => total += siz,
            Err(e) => {
                log::debug!("remote track closed after {} bytes: {}", total, e);
                break;
            }
        }
    }
}
