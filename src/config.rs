//! `clap`-derived CLI configuration for the three binaries, mirroring the
//! teacher's CLI-args-only convention (no on-disk config file format).

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

/// Default strand batch size `B`.
pub const DEFAULT_BATCH_SIZE: usize = 3;
/// Default inter-chunk send delay.
pub const DEFAULT_INTER_CHUNK_DELAY_MICROS: u64 = 100;

#[derive(Debug, Clone, Parser)]
#[command(name = "coordinator", about = "StrandCast global admission coordinator")]
pub struct CoordinatorConfig {
    /// TCP port to accept subcoordinator and peer registrations on.
    #[arg(long, default_value_t = 9000)]
    pub port: u16,

    /// Host to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: IpAddr,

    /// Batch size `B`: how many peers a Subcoordinator's strand takes at once.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "subcoordinator", about = "StrandCast strand owner and streamer")]
pub struct SubcoordinatorConfig {
    /// TCP port this subcoordinator's control server listens on.
    #[arg(long)]
    pub port: u16,

    /// Host to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: IpAddr,

    /// Coordinator host:port to register with.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub coordinator_addr: String,

    /// Ordered list of source video frame directories, one per video.
    #[arg(long, value_delimiter = ',')]
    pub video_dirs: Vec<PathBuf>,

    /// Use N synthetic videos instead of real frame directories (test/demo mode).
    #[arg(long)]
    pub synthetic_videos: Option<usize>,

    /// Frames per synthetic video when `--synthetic-videos` is set.
    #[arg(long, default_value_t = 30)]
    pub synthetic_frame_count: usize,

    /// Microseconds to sleep between chunk sends.
    #[arg(long, default_value_t = DEFAULT_INTER_CHUNK_DELAY_MICROS)]
    pub inter_chunk_delay_micros: u64,

    /// JPEG quality used when encoding frames.
    #[arg(long, default_value_t = 40)]
    pub jpeg_quality: u8,

    /// Directory persisted logs and frame dumps are written under.
    #[arg(long, default_value = "videoOutput")]
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "peer", about = "StrandCast strand member")]
pub struct PeerConfig {
    /// This peer's unique name.
    #[arg(long)]
    pub name: String,

    /// UDP port to receive frame chunks on.
    #[arg(long)]
    pub data_port: u16,

    /// Host to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: IpAddr,

    /// Coordinator host:port to register with.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub coordinator_addr: String,

    /// Directory persisted logs and frame dumps are written under.
    #[arg(long, default_value = "videoOutput")]
    pub output_dir: PathBuf,

    /// Target playback frames-per-second (overridden once `video_end` metadata arrives).
    #[arg(long, default_value_t = 30.0)]
    pub playback_fps: f64,
}

impl PeerConfig {
    pub fn ctrl_port(&self) -> u16 {
        self.data_port + 10000
    }
}
