use std::fs::File;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use rtpstream::media::extract_nal_units;
use rtpstream::{
    DecodeConfiguration, Listener, NalUnit, Role, SessionConfig, SessionDelegate, SessionHandle,
    SessionState,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rtpstream", about = "Send or receive H.264 over RTP/UDP")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept streams from any number of senders
    Listen {
        /// Bind address (host:port)
        #[arg(long, short, default_value = "0.0.0.0:5004")]
        bind: String,
        /// Append every received stream as Annex B to this file
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Seconds of silence before a peer's session fails
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Stream an Annex B file to a listener
    Send {
        /// Listener address (host:port)
        #[arg(long, short)]
        peer: SocketAddr,
        /// Annex B H.264 elementary stream
        #[arg(long, short)]
        input: PathBuf,
        /// Local bind address
        #[arg(long, default_value = "0.0.0.0:0")]
        bind: String,
        #[arg(long, default_value_t = 30)]
        fps: u32,
        /// Largest RTP payload in bytes
        #[arg(long, default_value_t = 1400)]
        mtu: usize,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let result = match Args::parse().command {
        Command::Listen {
            bind,
            output,
            timeout,
        } => listen(&bind, output, timeout),
        Command::Send {
            peer,
            input,
            bind,
            fps,
            mtu,
        } => send(&bind, peer, &input, fps, mtu),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

/// Logs what a peer sends and optionally dumps it to a file.
struct Dump {
    peer: SocketAddr,
    out: Option<File>,
    frames: u64,
}

impl Dump {
    fn write(&mut self, bytes: &[u8]) {
        if let Some(out) = &mut self.out {
            if let Err(e) = out.write_all(bytes) {
                tracing::warn!(peer = %self.peer, error = %e, "output write failed, disabling");
                self.out = None;
            }
        }
    }
}

impl SessionDelegate for Dump {
    fn on_state_changed(&mut self, state: SessionState) {
        tracing::info!(peer = %self.peer, ?state, frames = self.frames, "stream state");
    }

    fn on_decode_configuration_ready(&mut self, configuration: &DecodeConfiguration) {
        tracing::info!(
            peer = %self.peer,
            profile_level_id = configuration.profile_level_id().as_deref().unwrap_or("?"),
            sprop = %configuration.sprop_parameter_sets(),
            "decoder configured"
        );
        self.write(&configuration.to_annex_b());
    }

    fn on_access_unit_ready(&mut self, data: &[u8], presentation_time: Instant) {
        self.frames += 1;
        tracing::debug!(
            peer = %self.peer,
            size = data.len(),
            due_in_ms = presentation_time.saturating_duration_since(Instant::now()).as_millis() as u64,
            "picture"
        );
        self.write(&[0, 0, 0, 1]);
        self.write(data);
    }
}

fn listen(bind: &str, output: Option<PathBuf>, timeout: u64) -> rtpstream::Result<()> {
    let config = SessionConfig {
        receive_timeout: Duration::from_secs(timeout),
        ..Default::default()
    };
    let path = output;
    let mut listener = Listener::new(bind, config, move |peer: SocketAddr| {
        let out = path.as_ref().and_then(|p| {
            File::options()
                .create(true)
                .append(true)
                .open(p)
                .inspect_err(|e| tracing::warn!(path = %p.display(), error = %e, "cannot open output"))
                .ok()
        });
        Dump {
            peer,
            out,
            frames: 0,
        }
    });

    let addr = listener.start()?;
    println!("Listening on {addr}, press Enter to stop");
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    listener.stop();
    Ok(())
}

struct Quiet;

impl SessionDelegate for Quiet {
    fn on_state_changed(&mut self, state: SessionState) {
        tracing::info!(?state, "sender state");
    }

    fn on_access_unit_ready(&mut self, _data: &[u8], _presentation_time: Instant) {}
}

fn send(bind: &str, peer: SocketAddr, input: &Path, fps: u32, mtu: usize) -> rtpstream::Result<()> {
    let data = std::fs::read(input)?;
    let units = extract_nal_units(&data)
        .into_iter()
        .map(NalUnit::parse)
        .collect::<Result<Vec<_>, _>>()?;
    let access_units = group_access_units(units);
    tracing::info!(frames = access_units.len(), path = %input.display(), "stream loaded");

    let config = SessionConfig {
        max_packet_payload_size: mtu,
        ..Default::default()
    };
    let handle = SessionHandle::connect_udp(Role::Sender, bind, peer, config, Quiet)?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.state() == SessionState::Preparing || handle.state() == SessionState::Setup {
        if Instant::now() >= deadline {
            return Err(rtpstream::StreamError::NotConnected(handle.state()));
        }
        thread::sleep(Duration::from_millis(10));
    }

    let frame_interval = Duration::from_secs(1) / fps.max(1);
    let start = Instant::now();
    for (i, units) in access_units.into_iter().enumerate() {
        let pts = frame_interval * i as u32;
        handle.send_units(units, pts)?;
        if let Some(wait) = (start + pts + frame_interval).checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    handle.cancel();
    if let Some(stats) = handle.join() {
        tracing::info!(?stats, "stream finished");
    }
    Ok(())
}

/// Split a NAL unit sequence into access units.
///
/// A new access unit begins at an access unit delimiter, at a parameter
/// set following a picture, or at any picture following a picture.
fn group_access_units(units: Vec<NalUnit<'_>>) -> Vec<Vec<NalUnit<'static>>> {
    use rtpstream::NalUnitType::{AccessUnitDelimiter, Pps, Sps};

    let mut frames = Vec::new();
    let mut current: Vec<NalUnit<'static>> = Vec::new();
    let mut has_picture = false;

    for unit in units {
        let unit_type = unit.unit_type();
        let boundary = match unit_type {
            AccessUnitDelimiter => !current.is_empty(),
            Sps | Pps => has_picture,
            t => t.is_vcl() && has_picture,
        };
        if boundary {
            frames.push(std::mem::take(&mut current));
            has_picture = false;
        }
        has_picture |= unit_type.is_vcl();
        current.push(unit.into_owned());
    }
    if !current.is_empty() {
        frames.push(current);
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(frames: &[Vec<NalUnit<'static>>]) -> Vec<Vec<u8>> {
        frames
            .iter()
            .map(|f| f.iter().map(|u| u.unit_type().as_u8()).collect())
            .collect()
    }

    #[test]
    fn groups_by_picture() {
        let stream: [&[u8]; 9] = [
            &[0x09, 0x10],
            &[0x67, 0x42],
            &[0x68, 0xce],
            &[0x65, 0x88],
            &[0x41, 0x9a],
            &[0x06, 0x05],
            &[0x41, 0x9b],
            &[0x67, 0x42],
            &[0x65, 0x88],
        ];
        let units = stream
            .into_iter()
            .map(|b| NalUnit::parse(b).unwrap())
            .collect();
        assert_eq!(
            types(&group_access_units(units)),
            vec![vec![9, 7, 8, 5], vec![1, 6], vec![1], vec![7, 5]]
        );
    }
}
