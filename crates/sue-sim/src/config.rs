//! Simulation configuration.
//!
//! A flat key/value surface: every recognised option can come from the
//! command line (names match the original simulator exactly, mixed case and
//! all) or from a TOML profile passed with `--config`; explicit CLI flags
//! win over the profile, which wins over defaults.
//!
//! `SueSimConfig` holds the raw user-facing values; `Params` is the
//! validated, unit-resolved form the simulator actually runs on. Validation
//! failures abort before any simulation state is built.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use sue_common::{Nanos, Rate};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Traffic generator mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TrafficMode {
    /// Uniform rate with random destination and VC.
    Uniform,
    /// CSV of fine-grained per-flow rates.
    Flows,
    /// Timestamped operation trace.
    Trace,
}

macro_rules! options {
    ($(($field:ident, $name:literal, $ty:ty, $default:expr, $help:literal)),+ $(,)?) => {
        /// Raw configuration as the user supplies it.
        #[derive(Debug, Clone, Deserialize)]
        #[serde(default, deny_unknown_fields)]
        pub struct SueSimConfig {
            $(
                #[serde(rename = $name)]
                pub $field: $ty,
            )+
        }

        impl Default for SueSimConfig {
            fn default() -> Self {
                SueSimConfig {
                    $($field: $default,)+
                }
            }
        }

        /// Command-line surface: every option optional, so the TOML profile
        /// and the defaults show through where flags are omitted.
        #[derive(Debug, Parser)]
        #[command(name = "sue-sim", about = "Scale-Up Ethernet interconnect simulator")]
        pub struct Cli {
            /// TOML configuration profile; explicit flags override it.
            #[arg(long = "config")]
            pub config: Option<PathBuf>,

            $(
                #[arg(long = $name, help = $help)]
                pub $field: Option<$ty>,
            )+
        }

        impl SueSimConfig {
            fn apply_cli(&mut self, cli: Cli) {
                $(
                    if let Some(v) = cli.$field {
                        self.$field = v;
                    }
                )+
            }
        }
    };
}

options!(
    // ─── Timing ─────────────────────────────────────────────────────────
    (simulation_time, "simulationTime", f64, 10.0, "Total simulated time (s)"),
    (server_start, "serverStart", f64, 1.0, "Server application start (s)"),
    (client_start, "clientStart", f64, 2.0, "Client application start (s)"),
    (client_stop_offset, "clientStopOffset", f64, 1.0, "Client stop offset before sim end (s)"),
    (server_stop_offset, "serverStopOffset", f64, 0.5, "Server stop offset before sim end (s)"),
    (thread_start_interval, "threadStartInterval", f64, 0.0, "Stagger between per-XPU client starts (s)"),
    // ─── Topology ───────────────────────────────────────────────────────
    (n_xpus, "nXpus", u32, 2, "Number of XPU nodes"),
    (ports_per_xpu, "portsPerXpu", u32, 2, "Physical ports per XPU"),
    (ports_per_sue, "portsPerSue", u32, 2, "Ports owned by each SUE engine (1, 2 or 4)"),
    // ─── Traffic ────────────────────────────────────────────────────────
    (transaction_size, "transactionSize", u32, 256, "Transaction payload size (B)"),
    (max_burst_size, "maxBurstSize", u32, 2048, "Maximum packed burst size (B)"),
    (mtu, "Mtu", u32, 4096, "Maximum transmission unit (B)"),
    (vc_num, "vcNum", u8, 4, "Number of VCs traffic is spread across (1-4)"),
    (thread_rate, "threadRate", f64, 1000.0, "Per-XPU generation rate (Mbps)"),
    (total_bytes_to_send, "totalBytesToSend", u32, 1, "Bytes each XPU offers before stopping (MB)"),
    (traffic_mode, "trafficMode", TrafficMode, TrafficMode::Uniform, "Traffic generator mode"),
    (flow_file, "flowFile", String, String::new(), "CSV of fine-grained flows (flows mode)"),
    (trace_file, "traceFile", String, String::new(), "CSV operation trace (trace mode)"),
    (trace_operation, "traceOperation", String, "STORE".to_string(), "Trace rows to keep (operation filter)"),
    (trace_tile, "traceTile", u32, 3, "Trace rows to keep (tile filter)"),
    // ─── Link ───────────────────────────────────────────────────────────
    (error_rate, "errorRate", f64, 0.0, "Per-frame receive corruption probability"),
    (processing_delay, "processingDelay", String, "10ns".to_string(), "Fixed per-packet processing delay"),
    (num_vcs, "numVcs", u8, 4, "Number of link-layer virtual channels"),
    (link_data_rate, "LinkDataRate", String, "100Gbps".to_string(), "Link serialization rate"),
    (processing_rate, "ProcessingRate", String, "200Gbps".to_string(), "Receive-side processing rate"),
    (link_delay, "LinkDelay", String, "1us".to_string(), "Link propagation delay"),
    // ─── Queues ─────────────────────────────────────────────────────────
    (vc_queue_max_mb, "VcQueueMaxMB", f64, 2.0, "Per-VC queue capacity (MB)"),
    (processing_queue_max_mb, "ProcessingQueueMaxMB", f64, 2.0, "Processing queue capacity (MB)"),
    (dest_queue_max_mb, "DestQueueMaxMB", f64, 2.0, "Destination queue capacity (MB)"),
    // ─── CBFC ───────────────────────────────────────────────────────────
    (enable_link_cbfc, "EnableLinkCBFC", bool, true, "Enable link-level credit flow control"),
    (link_credits, "LinkCredits", u32, 20, "Initial credits per (peer, VC)"),
    (credit_batch_size, "CreditBatchSize", u32, 10, "Frames consumed before a credit update"),
    (switch_credits, "switchCredits", u32, 85, "Initial credits for switch-internal peers"),
    (credit_ceiling, "creditCeiling", u32, 1 << 20, "Credit balance above which accounting is broken"),
    // ─── LLR ────────────────────────────────────────────────────────────
    (enable_llr, "EnableLLR", bool, false, "Enable link-layer retransmission"),
    (llr_timeout, "LlrTimeout", String, "10us".to_string(), "Retransmit timer / ACK force interval"),
    (llr_window_size, "LlrWindowSize", u32, 10, "Nominal LLR window size"),
    (ack_add_header_delay, "AckAddHeaderDelay", String, "10ns".to_string(), "ACK/NACK header attach delay"),
    (ack_process_delay, "AckProcessDelay", String, "10ns".to_string(), "ACK/NACK processing delay"),
    // ─── Load balancing ─────────────────────────────────────────────────
    (load_balance_algorithm, "loadBalanceAlgorithm", u32, 0, "SUE selection algorithm (0-5)"),
    (hash_seed, "hashSeed", u32, 0, "Seed for the hash-based algorithms"),
    (prime1, "prime1", u32, 7919, "First prime for PRIME_HASH"),
    (prime2, "prime2", u32, 9973, "Second prime (reserved for enhanced hashing)"),
    (use_vc_in_hash, "useVcInHash", bool, true, "Mix the VC id into hash selection"),
    (enable_bit_operations, "enableBitOperations", bool, true, "Enable bit-mixing in hash selection"),
    // ─── Tracing ────────────────────────────────────────────────────────
    (stat_logging_enabled, "StatLoggingEnabled", bool, true, "Write CSV statistics sinks"),
    (client_stat_interval, "ClientStatInterval", String, "10us".to_string(), "Client statistics flush interval"),
    (link_stat_interval, "LinkStatInterval", String, "10us".to_string(), "Link statistics interval"),
    (output_dir, "outputDir", String, "performance-data/data".to_string(), "Directory for CSV sinks"),
    // ─── Delays ─────────────────────────────────────────────────────────
    (scheduling_interval, "SchedulingInterval", String, "100ns".to_string(), "SUE scheduler polling interval"),
    (packing_delay_per_packet, "PackingDelayPerPacket", String, "10ns".to_string(), "Per-burst packing delay"),
    (vc_scheduling_delay, "vcSchedulingDelay", String, "8ns".to_string(), "VC scheduler re-entry delay"),
    (data_add_head_delay, "DataAddHeadDelay", String, "5ns".to_string(), "Data header attach delay"),
    (credit_generate_delay, "creditGenerateDelay", String, "10ns".to_string(), "Credit update generation delay"),
    (cre_update_add_head_delay, "CreUpdateAddHeadDelay", String, "3ns".to_string(), "Credit update header attach delay"),
    (switch_forward_delay, "switchForwardDelay", String, "150ns".to_string(), "Switch ingress to egress handoff delay"),
    (additional_header_size, "AdditionalHeaderSize", u32, 46, "Header overhead added to VC reservations"),
    // ─── Reproducibility ────────────────────────────────────────────────
    (seed, "seed", u64, 1, "Master RNG seed"),
);

impl SueSimConfig {
    /// Load from CLI arguments, layering an optional TOML profile under
    /// explicit flags.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let mut cfg = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&text).map_err(|source| ConfigError::Toml {
                    path: path.clone(),
                    source,
                })?
            }
            None => SueSimConfig::default(),
        };
        cfg.apply_cli(cli);
        Ok(cfg)
    }

    /// Validate and resolve into runtime parameters.
    pub fn resolve(&self) -> Result<Params, ConfigError> {
        if !matches!(self.ports_per_sue, 1 | 2 | 4) {
            return Err(ConfigError::Invalid(format!(
                "portsPerSue must be 1, 2 or 4 (got {})",
                self.ports_per_sue
            )));
        }
        if self.ports_per_xpu == 0 || self.ports_per_xpu % self.ports_per_sue != 0 {
            return Err(ConfigError::Invalid(format!(
                "portsPerXpu ({}) must be a positive multiple of portsPerSue ({})",
                self.ports_per_xpu, self.ports_per_sue
            )));
        }
        if self.load_balance_algorithm > 5 {
            return Err(ConfigError::Invalid(format!(
                "loadBalanceAlgorithm must be in [0, 5] (got {})",
                self.load_balance_algorithm
            )));
        }
        if self.n_xpus < 2 {
            return Err(ConfigError::Invalid(format!(
                "nXpus must be at least 2 (got {})",
                self.n_xpus
            )));
        }
        // The 10.x.y.0/30 address plan caps both dimensions at one octet.
        if self.n_xpus > 250 || self.ports_per_xpu > 250 {
            return Err(ConfigError::Invalid(format!(
                "nXpus ({}) and portsPerXpu ({}) must each be at most 250",
                self.n_xpus, self.ports_per_xpu
            )));
        }
        if !(1..=4).contains(&self.vc_num) {
            return Err(ConfigError::Invalid(format!(
                "vcNum must be in [1, 4] (got {})",
                self.vc_num
            )));
        }
        if self.num_vcs == 0 || self.num_vcs > 4 {
            return Err(ConfigError::Invalid(format!(
                "numVcs must be in [1, 4] (got {})",
                self.num_vcs
            )));
        }
        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(ConfigError::Invalid(format!(
                "errorRate must be in [0, 1] (got {})",
                self.error_rate
            )));
        }
        if self.credit_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "CreditBatchSize must be at least 1".into(),
            ));
        }
        if matches!(self.traffic_mode, TrafficMode::Flows) && self.flow_file.is_empty() {
            return Err(ConfigError::Invalid(
                "flows traffic mode requires flowFile".into(),
            ));
        }
        if matches!(self.traffic_mode, TrafficMode::Trace) && self.trace_file.is_empty() {
            return Err(ConfigError::Invalid(
                "trace traffic mode requires traceFile".into(),
            ));
        }

        let dur = |s: &str| {
            Nanos::parse(s).map_err(|e| ConfigError::Invalid(e.to_string()))
        };
        let rate = |s: &str| {
            Rate::parse(s).map_err(|e| ConfigError::Invalid(e.to_string()))
        };
        let mb = |v: f64| (v * 1024.0 * 1024.0) as u32;

        let simulation_time = Nanos::from_secs_f64(self.simulation_time);
        Ok(Params {
            simulation_time,
            server_start: Nanos::from_secs_f64(self.server_start),
            client_start: Nanos::from_secs_f64(self.client_start),
            client_stop: simulation_time
                .saturating_sub(Nanos::from_secs_f64(self.client_stop_offset)),
            server_stop: simulation_time
                .saturating_sub(Nanos::from_secs_f64(self.server_stop_offset)),
            thread_start_interval: Nanos::from_secs_f64(self.thread_start_interval),

            n_xpus: self.n_xpus,
            ports_per_xpu: self.ports_per_xpu,
            ports_per_sue: self.ports_per_sue,
            sues_per_xpu: self.ports_per_xpu / self.ports_per_sue,

            transaction_size: self.transaction_size,
            max_burst_size: self.max_burst_size,
            mtu: self.mtu,
            vc_num: self.vc_num,
            thread_rate: Rate::from_mbps(self.thread_rate),
            total_bytes_to_send: u64::from(self.total_bytes_to_send) * 1024 * 1024,
            traffic_mode: self.traffic_mode,
            flow_file: self.flow_file.clone(),
            trace_file: self.trace_file.clone(),
            trace_operation: self.trace_operation.clone(),
            trace_tile: self.trace_tile,

            error_rate: self.error_rate,
            processing_delay: dur(&self.processing_delay)?,
            num_vcs: self.num_vcs,
            link_data_rate: rate(&self.link_data_rate)?,
            processing_rate: rate(&self.processing_rate)?,
            link_delay: dur(&self.link_delay)?,

            vc_queue_max_bytes: mb(self.vc_queue_max_mb),
            processing_queue_max_bytes: mb(self.processing_queue_max_mb),
            dest_queue_max_bytes: mb(self.dest_queue_max_mb),

            enable_link_cbfc: self.enable_link_cbfc,
            link_credits: self.link_credits,
            credit_batch_size: self.credit_batch_size,
            switch_credits: self.switch_credits,
            credit_ceiling: self.credit_ceiling,

            enable_llr: self.enable_llr,
            llr_timeout: dur(&self.llr_timeout)?,
            llr_window_size: self.llr_window_size,
            ack_add_header_delay: dur(&self.ack_add_header_delay)?,
            ack_process_delay: dur(&self.ack_process_delay)?,

            load_balance_algorithm: self.load_balance_algorithm,
            hash_seed: self.hash_seed,
            prime1: self.prime1,
            prime2: self.prime2,
            use_vc_in_hash: self.use_vc_in_hash,
            enable_bit_operations: self.enable_bit_operations,

            stat_logging_enabled: self.stat_logging_enabled,
            client_stat_interval: dur(&self.client_stat_interval)?,
            link_stat_interval: dur(&self.link_stat_interval)?,
            output_dir: PathBuf::from(&self.output_dir),

            scheduling_interval: dur(&self.scheduling_interval)?,
            packing_delay_per_packet: dur(&self.packing_delay_per_packet)?,
            vc_scheduling_delay: dur(&self.vc_scheduling_delay)?,
            data_add_head_delay: dur(&self.data_add_head_delay)?,
            credit_generate_delay: dur(&self.credit_generate_delay)?,
            cre_update_add_head_delay: dur(&self.cre_update_add_head_delay)?,
            switch_forward_delay: dur(&self.switch_forward_delay)?,
            additional_header_size: self.additional_header_size,

            seed: self.seed,
        })
    }
}

/// Validated, unit-resolved simulation parameters.
#[derive(Debug, Clone)]
pub struct Params {
    pub simulation_time: Nanos,
    pub server_start: Nanos,
    pub client_start: Nanos,
    pub client_stop: Nanos,
    pub server_stop: Nanos,
    pub thread_start_interval: Nanos,

    pub n_xpus: u32,
    pub ports_per_xpu: u32,
    pub ports_per_sue: u32,
    pub sues_per_xpu: u32,

    pub transaction_size: u32,
    pub max_burst_size: u32,
    pub mtu: u32,
    pub vc_num: u8,
    pub thread_rate: Rate,
    pub total_bytes_to_send: u64,
    pub traffic_mode: TrafficMode,
    pub flow_file: String,
    pub trace_file: String,
    pub trace_operation: String,
    pub trace_tile: u32,

    pub error_rate: f64,
    pub processing_delay: Nanos,
    pub num_vcs: u8,
    pub link_data_rate: Rate,
    pub processing_rate: Rate,
    pub link_delay: Nanos,

    pub vc_queue_max_bytes: u32,
    pub processing_queue_max_bytes: u32,
    pub dest_queue_max_bytes: u32,

    pub enable_link_cbfc: bool,
    pub link_credits: u32,
    pub credit_batch_size: u32,
    pub switch_credits: u32,
    pub credit_ceiling: u32,

    pub enable_llr: bool,
    pub llr_timeout: Nanos,
    pub llr_window_size: u32,
    pub ack_add_header_delay: Nanos,
    pub ack_process_delay: Nanos,

    pub load_balance_algorithm: u32,
    pub hash_seed: u32,
    pub prime1: u32,
    pub prime2: u32,
    pub use_vc_in_hash: bool,
    pub enable_bit_operations: bool,

    pub stat_logging_enabled: bool,
    pub client_stat_interval: Nanos,
    pub link_stat_interval: Nanos,
    pub output_dir: PathBuf,

    pub scheduling_interval: Nanos,
    pub packing_delay_per_packet: Nanos,
    pub vc_scheduling_delay: Nanos,
    pub data_add_head_delay: Nanos,
    pub credit_generate_delay: Nanos,
    pub cre_update_add_head_delay: Nanos,
    pub switch_forward_delay: Nanos,
    pub additional_header_size: u32,

    pub seed: u64,
}

impl Params {
    /// Total ports on the switch side (one per XPU port).
    pub fn switch_ports(&self) -> u32 {
        self.n_xpus * self.ports_per_xpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let p = SueSimConfig::default().resolve().unwrap();
        assert_eq!(p.sues_per_xpu, 1);
        assert_eq!(p.vc_queue_max_bytes, 2 * 1024 * 1024);
        assert_eq!(p.total_bytes_to_send, 1024 * 1024);
        assert_eq!(p.link_delay, Nanos(1_000));
    }

    #[test]
    fn rejects_bad_ports_per_sue() {
        let cfg = SueSimConfig {
            ports_per_xpu: 8,
            ports_per_sue: 3,
            ..Default::default()
        };
        let err = cfg.resolve().unwrap_err();
        assert!(err.to_string().contains("portsPerSue"));
    }

    #[test]
    fn rejects_indivisible_ports() {
        let cfg = SueSimConfig {
            ports_per_xpu: 6,
            ports_per_sue: 4,
            ..Default::default()
        };
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn rejects_out_of_range_algorithm() {
        let cfg = SueSimConfig {
            load_balance_algorithm: 6,
            ..Default::default()
        };
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn rejects_bad_duration_strings() {
        let cfg = SueSimConfig {
            llr_timeout: "soon".into(),
            ..Default::default()
        };
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn toml_profile_parses_spec_names() {
        let text = r#"
            nXpus = 4
            portsPerXpu = 4
            portsPerSue = 2
            EnableLLR = true
            LinkDataRate = "10Gbps"
            VcQueueMaxMB = 1.0
        "#;
        let cfg: SueSimConfig = toml::from_str(text).unwrap();
        let p = cfg.resolve().unwrap();
        assert_eq!(p.sues_per_xpu, 2);
        assert!(p.enable_llr);
        assert_eq!(p.link_data_rate, Rate(10_000_000_000));
    }

    #[test]
    fn cli_overrides_defaults() {
        let cli = Cli::parse_from(["sue-sim", "--nXpus", "3", "--EnableLinkCBFC", "false"]);
        let cfg = SueSimConfig::from_cli(cli).unwrap();
        assert_eq!(cfg.n_xpus, 3);
        assert!(!cfg.enable_link_cbfc);
    }
}
