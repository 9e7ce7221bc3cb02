use std::net::SocketAddr;
use std::path::PathBuf;

/// Construction-time configuration, injected once at startup. Ports, data
/// directory, admin PIN/token and the BGM URL are all opaque configuration
/// as far as the core is concerned (spec §6); this struct is the single
/// place that reads the process environment, mirroring the teacher's
/// `STUDIOCOMMAND_BIND` lookup in `main`.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub admin_pin: Option<String>,
    pub admin_token: Option<String>,
    pub bgm_url: Option<String>,
    pub mpv_socket_name: String,
    pub countdown_secs: u32,
    pub admin_countdown_secs: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind = std::env::var("KARAHUB_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7300".to_string())
            .parse()?;
        let data_dir = std::env::var("KARAHUB_DATA_DIR")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let admin_pin = std::env::var("KARAHUB_ADMIN_PIN").ok();
        let admin_token = std::env::var("KARAHUB_ADMIN_TOKEN").ok();
        let bgm_url = std::env::var("KARAHUB_BGM_URL").ok();
        let mpv_socket_name =
            std::env::var("KARAHUB_MPV_SOCKET_NAME").unwrap_or_else(|_| "karahub-mpv".to_string());
        let countdown_secs = std::env::var("KARAHUB_COUNTDOWN_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(15);
        let admin_countdown_secs = std::env::var("KARAHUB_ADMIN_COUNTDOWN_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Ok(Self {
            bind,
            data_dir,
            admin_pin,
            admin_token,
            bgm_url,
            mpv_socket_name,
            countdown_secs,
            admin_countdown_secs,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("karahub.sqlite3")
    }

    /// Path to the mpv IPC endpoint (unix socket or Windows named pipe name),
    /// unique to this application per spec §4.3/§6.
    pub fn ipc_endpoint(&self) -> String {
        #[cfg(unix)]
        {
            self.data_dir
                .join(format!("{}.sock", self.mpv_socket_name))
                .to_string_lossy()
                .into_owned()
        }
        #[cfg(windows)]
        {
            format!(r"\\.\pipe\{}", self.mpv_socket_name)
        }
    }
}
