use std::{net::SocketAddr, path::PathBuf};
use anyhow::Context;
use clap::Parser;
use tokio::{io::AsyncWriteExt, sync::mpsc};
use tracing_subscriber::EnvFilter;
use fx_torrent::{
    AddTorrentOptions, Config, FileSelector, Session, StorageKind, StreamServer, TorrentEvent, TorrentHandle,
    TorrentMode, TorrentSource, TorrentState,
};

#[derive(Parser)]
#[command(about = "Download or stream a torrent")]
struct Args {

    #[arg(help = "Magnet link or path to a .torrent file")]
    source: String,

    #[arg(short, long, default_value = "downloads", help = "Directory to save data to")]
    dir: PathBuf,

    #[arg(short, long, help = "Stream the largest file, writing it to --output or stdout")]
    stream: bool,

    #[arg(short, long, help = "File to write streamed data to")]
    output: Option<PathBuf>,

    #[arg(long, help = "Serve the largest file over HTTP on this address instead of writing it")]
    serve: Option<SocketAddr>,

    #[arg(long = "file", help = "Index of a file to download, may be repeated")]
    files: Vec<usize>,

    #[arg(short, long = "peer", help = "Peer to connect to, may be repeated")]
    peers: Vec<SocketAddr>,

    #[arg(short, long, help = "Address to accept peers on")]
    listen: Option<SocketAddr>,

    #[arg(long, help = "Keep pieces in memory instead of on disk")]
    memory: bool,

    #[arg(long, default_value = "info", help = "Log level, overridden by RUST_LOG")]
    log_level: String,

}

#[tokio::main]
async fn main() -> anyhow::Result<()> {

    let args = Args::parse();

    // Set up logging, on stderr so streamed data can go to stdout.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config {
        dir: args.dir.clone(),
        listen_address: args.listen,
        ..Config::default()
    };
    let session = Session::new(config);

    let source = if args.source.starts_with("magnet:") {
        TorrentSource::Magnet(args.source.clone())
    } else {
        TorrentSource::File(PathBuf::from(&args.source))
    };
    let options = AddTorrentOptions {
        save_dir: Some(args.dir.clone()),
        wanted_files: (!args.files.is_empty()).then(|| args.files.clone()),
        mode: if args.stream || args.serve.is_some() { TorrentMode::Stream } else { TorrentMode::Download },
        peers: args.peers.clone(),
        storage: if args.memory { StorageKind::Memory } else { StorageKind::Disk },
    };
    let handle = session
        .add_torrent(source, options)
        .await
        .context("failed to add torrent")?;

    let result = if let Some(address) = args.serve {
        tokio::select! {
            result = serve(&session, handle, address) => result,
            _ = tokio::signal::ctrl_c() => Ok(()),
        }
    } else if args.stream {
        tokio::select! {
            result = stream(&session, handle, args.output) => result,
            _ = tokio::signal::ctrl_c() => Ok(()),
        }
    } else {
        tokio::select! {
            result = download(&session, handle) => result,
            _ = tokio::signal::ctrl_c() => Ok(()),
        }
    };

    session.shutdown().await;
    result
}

// Prints progress until every wanted file is downloaded.
async fn download(session: &Session, handle: TorrentHandle) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.subscribe(handle, move |event| { tx.send(event.clone()).ok(); })?;

    // The torrent may have finished before the listener was added.
    if session.state(handle)? == TorrentState::Completed {
        println!("torrent complete");
        return Ok(());
    }

    while let Some(event) = rx.recv().await {
        match event {
            TorrentEvent::DownloadStatus(status) => {
                eprintln!(
                    "{:>6.2}% | {} peers | down {}/s | up {}/s | {}",
                    status.progress * 100.0,
                    status.connections,
                    status.download_rate,
                    status.upload_rate,
                    status.state,
                );
            },
            TorrentEvent::StateChanged { new: TorrentState::Completed, .. } => {
                println!("torrent complete");
                return Ok(());
            },
            TorrentEvent::Error(e) => anyhow::bail!("torrent failed: {}", e),
            _ => {},
        }
    }
    Ok(())
}

async fn stream(session: &Session, handle: TorrentHandle, output: Option<PathBuf>) -> anyhow::Result<()> {
    const CHUNK_LEN: usize = 256 * 1024;

    let mut stream = session.start_stream(handle, FileSelector::Largest)?;
    let mut out: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match output {
        Some(path) => Box::new(tokio::fs::File::create(&path).await.with_context(|| format!("failed to create {:?}", path))?),
        None => Box::new(tokio::io::stdout()),
    };

    loop {
        let chunk = stream.read_next(CHUNK_LEN).await?;
        if chunk.is_empty() {
            break;
        }
        out.write_all(&chunk).await?;
    }
    out.flush().await?;
    tracing::info!("streamed {} bytes", stream.position());
    Ok(())
}

// Serves the largest file until interrupted.
async fn serve(session: &Session, handle: TorrentHandle, address: SocketAddr) -> anyhow::Result<()> {
    let server = StreamServer::bind(session.clone(), address)
        .await
        .with_context(|| format!("failed to listen on {}", address))?;
    let url = server.serve(handle, FileSelector::Largest)?;
    println!("serving at {}", url);
    std::future::pending::<()>().await;
    Ok(())
}
