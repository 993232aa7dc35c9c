use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub adapter: AdapterConfig,
    pub relay: RelayConfig,
    pub trade: TradeConfig,
    pub data: DataConfig,
}

#[derive(Debug, Deserialize)]
pub struct AdapterConfig {
    /// Character device of the USB link adapter, e.g. `/dev/ttyACM0`.
    pub device: String,
    /// "auto", "gb" (5V) or "gba" (3.3V).
    pub voltage: String,
}

#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    pub url: String,
    pub room: String,
    /// Trade against the server-side pool instead of a second player.
    pub pool: bool,
    pub join_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct TradeConfig {
    pub generation: u8,
    /// "synchronous" or "buffered"; the starting offer for negotiation.
    pub mode: String,
    pub japanese: bool,
}

#[derive(Debug, Deserialize)]
pub struct DataConfig {
    pub root: String,
    pub sanity_checks: bool,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
        [adapter]
        device = "/dev/ttyACM0"
        voltage = "auto"

        [relay]
        url = "wss://relay.example.com/link"
        room = "red-vs-blue"
        pool = false
        join_timeout_secs = 120
        poll_interval_ms = 50

        [trade]
        generation = 2
        mode = "synchronous"
        japanese = false

        [data]
        root = "/opt/cable-club/data"
        sanity_checks = true
    "#;

    #[test]
    fn test_config_loads_from_toml_string() {
        let config = Config::from_toml_str(SAMPLE_CONFIG).expect("config should parse");
        assert_eq!(config.adapter.device, "/dev/ttyACM0");
        assert_eq!(config.adapter.voltage, "auto");
        assert_eq!(config.relay.url, "wss://relay.example.com/link");
        assert_eq!(config.relay.room, "red-vs-blue");
    }

    #[test]
    fn test_config_trade_fields() {
        let config = Config::from_toml_str(SAMPLE_CONFIG).expect("config should parse");
        assert_eq!(config.trade.generation, 2);
        assert_eq!(config.trade.mode, "synchronous");
        assert!(!config.trade.japanese);
    }

    #[test]
    fn test_config_relay_timing_fields() {
        let config = Config::from_toml_str(SAMPLE_CONFIG).expect("config should parse");
        assert_eq!(config.relay.join_timeout_secs, 120);
        assert_eq!(config.relay.poll_interval_ms, 50);
        assert!(!config.relay.pool);
    }

    #[test]
    fn test_config_data_fields() {
        let config = Config::from_toml_str(SAMPLE_CONFIG).expect("config should parse");
        assert_eq!(config.data.root, "/opt/cable-club/data");
        assert!(config.data.sanity_checks);
    }

    #[test]
    fn test_config_rejects_missing_required_fields() {
        let bad = r#"
            [adapter]
            device = "/dev/ttyACM0"
        "#;
        assert!(Config::from_toml_str(bad).is_err());
    }
}
