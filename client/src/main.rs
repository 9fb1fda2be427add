use anyhow::Result;
use clap::{Parser, Subcommand};
use common::{Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "vwctl")]
#[command(about = "Video Wallpaper Daemon Control", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resume playback of the configured video
    Play,

    /// Pause playback
    Pause,

    /// Stop playback and release the pipeline
    Stop,

    /// Set the wallpaper video
    SetVideo {
        /// Video location (file:// URI or plain path)
        uri: String,
    },

    /// Set audio volume (clamped to 0.0-1.0)
    SetVolume {
        /// Volume level
        volume: f64,
    },

    /// Enable or disable looping at end of stream
    SetLoop {
        /// true to loop, false to stop at end of stream
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let request = match cli.command {
        Commands::Play => Request::new("play"),
        Commands::Pause => Request::new("pause"),
        Commands::Stop => Request::new("stop"),
        Commands::SetVideo { uri } => Request::with_arg("setVideo", to_uri(uri)),
        Commands::SetVolume { volume } => Request::with_arg("setVolume", volume),
        Commands::SetLoop { enabled } => Request::with_arg("setLoop", enabled),
    };

    match send_request(request).await {
        Ok(response) => {
            handle_response(response);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("\nIs the daemon running? Try starting it with: vidwalld");
            std::process::exit(1);
        }
    }
}

/// Plain paths are absolutized into file:// URIs; anything with a scheme
/// passes through untouched.
fn to_uri(input: String) -> String {
    if input.contains("://") {
        return input;
    }

    let path = std::path::Path::new(&input);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    format!("file://{}", absolute.display())
}

async fn send_request(request: Request) -> Result<Response> {
    let socket_path = common::get_socket_path();

    let stream = UnixStream::connect(&socket_path).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // Send request
    let request_json = serde_json::to_string(&request)?;
    writer.write_all(request_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    // Read response
    let mut response_line = String::new();
    reader.read_line(&mut response_line).await?;

    let response: Response = serde_json::from_str(&response_line)?;
    Ok(response)
}

fn handle_response(response: Response) {
    match response {
        Response::Ok => {
            println!("✓ Success");
        }
        Response::Error(e) => {
            eprintln!("✗ Error: {}", e);
            std::process::exit(1);
        }
    }
}
