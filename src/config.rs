use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::game::constants::{limits, sim};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Maximum number of concurrent rooms
    pub max_rooms: usize,
    /// Maximum players per room
    pub max_players_per_room: usize,
    /// Path to TLS certificate file (if not using self-signed)
    pub tls_cert_path: Option<String>,
    /// Path to TLS key file (if not using self-signed)
    pub tls_key_path: Option<String>,
    /// Port for the metrics HTTP responder
    pub metrics_port: u16,
    /// JSON obstacle list loaded into every room
    pub geometry_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 4433,
            max_rooms: 100,
            max_players_per_room: 32,
            tls_cert_path: None,
            tls_key_path: None,
            metrics_port: 9090,
            geometry_path: None,
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load config from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        if let Some(port) = parse_var(&lookup, "PORT", |p: &u16| *p > 0, "must be > 0") {
            config.port = port;
        }
        if let Some(max_rooms) =
            parse_var(&lookup, "MAX_ROOMS", |n: &usize| (1..=10_000).contains(n), "must be 1-10000")
        {
            config.max_rooms = max_rooms;
        }
        if let Some(max_players) = parse_var(
            &lookup,
            "MAX_PLAYERS_PER_ROOM",
            |n: &usize| (1..=1_000).contains(n),
            "must be 1-1000",
        ) {
            config.max_players_per_room = max_players;
        }
        if let Some(port) = parse_var(&lookup, "METRICS_PORT", |p: &u16| *p > 0, "must be > 0") {
            config.metrics_port = port;
        }

        config.tls_cert_path = lookup("TLS_CERT_PATH");
        config.tls_key_path = lookup("TLS_KEY_PATH");
        config.geometry_path = lookup("WORLD_GEOMETRY_PATH").filter(|p| !p.trim().is_empty());

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.max_rooms == 0 {
            return Err("max_rooms must be at least 1".to_string());
        }
        if self.max_players_per_room == 0 {
            return Err("max_players_per_room must be at least 1".to_string());
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err("TLS_CERT_PATH and TLS_KEY_PATH must be set together".to_string());
        }
        if self.metrics_port == self.port {
            return Err("METRICS_PORT must differ from PORT".to_string());
        }
        Ok(())
    }
}

/// Synchronization tuning shared by server and client
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Client input sample rate (Hz)
    pub input_rate: u32,
    /// Simulation tick rate (Hz)
    pub tick_rate: u32,
    /// Snapshot broadcast rate (Hz)
    pub broadcast_rate: u32,
    /// How long unprocessed inputs are kept (ms)
    pub input_retention_ms: u64,
    /// Reconciliation error ignored below this (px)
    pub reconcile_ignore_px: f32,
    /// Reconciliation error snapped above this (px)
    pub reconcile_snap_px: f32,
    /// Snap threshold while dashing (px)
    pub reconcile_dash_snap_px: f32,
    /// Fraction of the pending correction applied per frame
    pub reconcile_blend_rate: f32,
    /// Blend rate while dashing
    pub reconcile_dash_blend_rate: f32,
    /// Remote sample history kept (ms)
    pub interp_window_ms: u64,
    /// Render delay behind the newest remote sample (ms)
    pub interp_delay_ms: u64,
    /// Bracketing samples farther apart than this snap (px)
    pub interp_snap_px: f32,
    /// Spatial grid cell size (px)
    pub grid_cell_size: f32,
    /// Half-size of the playable square (px)
    pub world_extent: f32,
    /// Live structures one player may own at a time
    pub max_structures_per_owner: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            input_rate: sim::INPUT_RATE,
            tick_rate: sim::TICK_RATE,
            broadcast_rate: sim::BROADCAST_RATE,
            input_retention_ms: 1000,
            reconcile_ignore_px: 5.0,
            reconcile_snap_px: 200.0,
            reconcile_dash_snap_px: 300.0,
            reconcile_blend_rate: 0.15,
            reconcile_dash_blend_rate: 0.25,
            interp_window_ms: 500,
            interp_delay_ms: 100,
            interp_snap_px: 250.0,
            grid_cell_size: 128.0,
            world_extent: 4096.0,
            max_structures_per_owner: limits::DEFAULT_STRUCTURES_PER_OWNER,
        }
    }
}

impl SyncConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load config from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut c = Self::default();
        let hz = |v: &u32| (1..=240).contains(v);
        let positive = |v: &f32| v.is_finite() && *v > 0.0;
        let rate = |v: &f32| v.is_finite() && *v > 0.0 && *v <= 1.0;

        if let Some(v) = parse_var(&lookup, "INPUT_RATE_HZ", hz, "must be 1-240") {
            c.input_rate = v;
        }
        if let Some(v) = parse_var(&lookup, "TICK_RATE_HZ", hz, "must be 1-240") {
            c.tick_rate = v;
        }
        if let Some(v) = parse_var(&lookup, "BROADCAST_RATE_HZ", hz, "must be 1-240") {
            c.broadcast_rate = v;
        }
        if let Some(v) = parse_var(&lookup, "INPUT_RETENTION_MS", |v: &u64| *v > 0, "must be > 0") {
            c.input_retention_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "RECONCILE_IGNORE_PX", positive, "must be > 0") {
            c.reconcile_ignore_px = v;
        }
        if let Some(v) = parse_var(&lookup, "RECONCILE_SNAP_PX", positive, "must be > 0") {
            c.reconcile_snap_px = v;
        }
        if let Some(v) = parse_var(&lookup, "RECONCILE_DASH_SNAP_PX", positive, "must be > 0") {
            c.reconcile_dash_snap_px = v;
        }
        if let Some(v) = parse_var(&lookup, "RECONCILE_BLEND_RATE", rate, "must be in (0, 1]") {
            c.reconcile_blend_rate = v;
        }
        if let Some(v) = parse_var(&lookup, "RECONCILE_DASH_BLEND_RATE", rate, "must be in (0, 1]") {
            c.reconcile_dash_blend_rate = v;
        }
        if let Some(v) = parse_var(&lookup, "INTERP_WINDOW_MS", |v: &u64| *v > 0, "must be > 0") {
            c.interp_window_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "INTERP_DELAY_MS", |_: &u64| true, "") {
            c.interp_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "INTERP_SNAP_PX", positive, "must be > 0") {
            c.interp_snap_px = v;
        }
        if let Some(v) = parse_var(&lookup, "GRID_CELL_SIZE", positive, "must be > 0") {
            c.grid_cell_size = v;
        }
        if let Some(v) = parse_var(&lookup, "WORLD_EXTENT", positive, "must be > 0") {
            c.world_extent = v;
        }
        if let Some(v) = parse_var(
            &lookup,
            "MAX_STRUCTURES_PER_OWNER",
            |n: &usize| (1..=1_000).contains(n),
            "must be 1-1000",
        ) {
            c.max_structures_per_owner = v;
        }

        c
    }

    /// Validate cross-field constraints after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.input_rate == 0 || self.tick_rate == 0 || self.broadcast_rate == 0 {
            return Err("rates must be at least 1 Hz".to_string());
        }
        if self.input_rate > self.tick_rate {
            return Err(format!(
                "input rate {} Hz exceeds tick rate {} Hz; inputs would queue without bound",
                self.input_rate, self.tick_rate
            ));
        }
        if self.reconcile_ignore_px >= self.reconcile_snap_px {
            return Err("RECONCILE_IGNORE_PX must be below RECONCILE_SNAP_PX".to_string());
        }
        if self.reconcile_ignore_px >= self.reconcile_dash_snap_px {
            return Err("RECONCILE_IGNORE_PX must be below RECONCILE_DASH_SNAP_PX".to_string());
        }
        for (name, rate) in [
            ("RECONCILE_BLEND_RATE", self.reconcile_blend_rate),
            ("RECONCILE_DASH_BLEND_RATE", self.reconcile_dash_blend_rate),
        ] {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(format!("{name} must be in (0, 1]"));
            }
        }
        if self.interp_delay_ms >= self.interp_window_ms {
            return Err("INTERP_DELAY_MS must be below INTERP_WINDOW_MS".to_string());
        }
        if !(self.grid_cell_size > 0.0) || !(self.world_extent > 0.0) {
            return Err("GRID_CELL_SIZE and WORLD_EXTENT must be positive".to_string());
        }
        let cols = self.grid_columns();
        if cols > limits::MAX_GRID_COLS as f64 {
            return Err(format!(
                "WORLD_EXTENT / GRID_CELL_SIZE gives a {cols}x{cols} grid; at most {} columns allowed",
                limits::MAX_GRID_COLS
            ));
        }
        if self.max_structures_per_owner == 0 {
            return Err("MAX_STRUCTURES_PER_OWNER must be at least 1".to_string());
        }
        Ok(())
    }

    /// Spatial grid columns per axis for this extent and cell size
    pub fn grid_columns(&self) -> f64 {
        (2.0 * self.world_extent as f64 / self.grid_cell_size as f64).ceil()
    }

    /// Seconds per simulation tick
    #[inline]
    pub fn tick_dt(&self) -> f32 {
        1.0 / self.tick_rate.max(1) as f32
    }

    pub fn input_retention(&self) -> Duration {
        Duration::from_millis(self.input_retention_ms)
    }

    pub fn interp_window(&self) -> Duration {
        Duration::from_millis(self.interp_window_ms)
    }

    pub fn interp_delay(&self) -> Duration {
        Duration::from_millis(self.interp_delay_ms)
    }
}

/// Parse one variable, logging and ignoring values that fail to parse or
/// fail `valid`
fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    valid: impl Fn(&T) -> bool,
    hint: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(parsed) if valid(&parsed) => Some(parsed),
        Ok(_) => {
            tracing::warn!("{} {}, using default", key, hint);
            None
        }
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 4433);
        assert_eq!(config.max_rooms, 100);
        assert_eq!(config.max_players_per_room, 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = ServerConfig::load_or_default();
        assert!(config.port > 0);
    }

    #[test]
    fn test_server_overrides_and_invalid_values() {
        let env = vars(&[
            ("PORT", "5000"),
            ("MAX_ROOMS", "0"),
            ("BIND_ADDRESS", "not-an-ip"),
            ("METRICS_PORT", "9191"),
        ]);
        let config = ServerConfig::from_lookup(|key| env.get(key).cloned());
        assert_eq!(config.port, 5000);
        assert_eq!(config.max_rooms, 100);
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        assert_eq!(config.metrics_port, 9191);
    }

    #[test]
    fn test_tls_paths_must_pair() {
        let env = vars(&[("TLS_CERT_PATH", "cert.pem")]);
        let config = ServerConfig::from_lookup(|key| env.get(key).cloned());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sync_defaults_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.broadcast_rate, 15);
        assert!((config.tick_dt() - 1.0 / 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_sync_overrides() {
        let env = vars(&[
            ("TICK_RATE_HZ", "60"),
            ("RECONCILE_BLEND_RATE", "0.3"),
            ("RECONCILE_DASH_BLEND_RATE", "1.5"),
            ("WORLD_EXTENT", "nope"),
        ]);
        let config = SyncConfig::from_lookup(|key| env.get(key).cloned());
        assert_eq!(config.tick_rate, 60);
        assert_eq!(config.reconcile_blend_rate, 0.3);
        assert_eq!(config.reconcile_dash_blend_rate, 0.25);
        assert_eq!(config.world_extent, 4096.0);
    }

    #[test]
    fn test_sync_validation_rules() {
        let mut config = SyncConfig {
            input_rate: 60,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config = SyncConfig {
            reconcile_ignore_px: 250.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config = SyncConfig {
            interp_delay_ms: 600,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_grid_rejected() {
        let config = SyncConfig {
            world_extent: 1_000_000.0,
            grid_cell_size: 1.0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("columns"));

        let config = SyncConfig {
            world_extent: 512.0 * 128.0,
            ..Default::default()
        };
        assert_eq!(config.grid_columns(), 1024.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_structure_cap_and_geometry_path() {
        let env = vars(&[
            ("MAX_STRUCTURES_PER_OWNER", "4"),
            ("WORLD_GEOMETRY_PATH", "maps/harbor.json"),
        ]);
        let sync = SyncConfig::from_lookup(|key| env.get(key).cloned());
        assert_eq!(sync.max_structures_per_owner, 4);
        let server = ServerConfig::from_lookup(|key| env.get(key).cloned());
        assert_eq!(server.geometry_path.as_deref(), Some("maps/harbor.json"));
    }
}
