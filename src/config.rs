use crate::skb::Tsi;

pub const MAX_TPDU_MIN: usize = 576;
pub const MAX_TPDU_MAX: usize = 65_535;
pub const MAX_TPDU_DEFAULT: usize = 1500;

pub const IPHDR_LEN_DEFAULT: usize = 28;

pub const WINDOW_SQNS_DEFAULT: u32 = 1024;

pub const NAK_BO_IVL_DEFAULT_US: u64 = 50_000;
pub const NAK_RPT_IVL_DEFAULT_US: u64 = 2_000_000;
pub const NAK_RDATA_IVL_DEFAULT_US: u64 = 2_000_000;
pub const NAK_DATA_RETRIES_DEFAULT: u32 = 50;
pub const NAK_NCF_RETRIES_DEFAULT: u32 = 50;

pub const SPM_AMBIENT_INTERVAL_DEFAULT_US: u64 = 8_192_000;
pub const SPM_HEARTBEAT_INTERVALS_DEFAULT_US: [u64; 9] = [
    100_000, 100_000, 100_000, 100_000, 1_300_000, 7_000_000, 16_000_000, 25_000_000, 30_000_000,
];

pub const PEER_EXPIRY_DEFAULT_US: u64 = 5 * SPM_AMBIENT_INTERVAL_DEFAULT_US;
pub const SPMR_EXPIRY_DEFAULT_US: u64 = 250_000;

pub const DPORT_DEFAULT: u16 = 7500;

/// Forward error correction parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FecConfig {
    /// Source plus parity packets per transmission group.
    ///
    /// Must be greater than `rs_k`.
    pub rs_n: u32,

    /// Source packets per transmission group.
    ///
    /// Must be a power of two no greater than 128.
    pub rs_k: u32,

    /// Parity packets sent unprompted after each transmission group. Zero disables proactive
    /// parity.
    ///
    /// Maximum value: `min(rs_n - rs_k, rs_k - 1)`
    pub proactive_h: u32,

    /// Whether receivers request parity rather than selective repairs.
    pub ondemand: bool,
}

impl FecConfig {
    fn validate(&self) {
        assert!(
            self.rs_k.is_power_of_two() && self.rs_k <= 128,
            "invalid configuration: fec.rs_k must be a power of two <= 128"
        );
        assert!(
            self.rs_n > self.rs_k && self.rs_n <= 255,
            "invalid configuration: fec.rs_n must be in (rs_k, 255]"
        );
        assert!(
            self.proactive_h <= self.rs_n - self.rs_k,
            "invalid configuration: fec.proactive_h > rs_n - rs_k"
        );
        assert!(
            self.proactive_h < self.rs_k,
            "invalid configuration: fec.proactive_h >= rs_k"
        );
    }
}

/// Session configuration. Intervals are in microseconds.
#[derive(Clone, Debug)]
pub struct Config {
    /// Identity of the local data source.
    pub tsi: Tsi,

    /// Data-destination port shared by every member of the session.
    ///
    /// Default value: 7500
    pub dport: u16,

    /// Whether the session publishes data. A session that does not send data emits no SPMs.
    ///
    /// Default value: true
    pub can_send_data: bool,

    /// Whether the session subscribes to remote sources.
    ///
    /// Default value: true
    pub can_recv_data: bool,

    /// Largest transport packet, header included.
    ///
    /// Minimum value: 576 \
    /// Maximum value: 65,535 \
    /// Default value: 1500
    pub max_tpdu: usize,

    /// Network header overhead charged against the rate limit for every packet.
    ///
    /// Default value: 28
    pub iphdr_len: usize,

    /// Transmit window capacity in packets. When zero, the capacity is derived from `txw_secs`
    /// and `txw_max_rte`.
    ///
    /// Default value: 1024
    pub txw_sqns: u32,
    pub txw_secs: u32,
    /// Bytes per second.
    pub txw_max_rte: u64,

    /// Receive window capacity in packets. When zero, the capacity is derived from `rxw_secs`
    /// and `rxw_max_rte`.
    ///
    /// Default value: 1024
    pub rxw_sqns: u32,
    pub rxw_secs: u32,
    /// Bytes per second.
    pub rxw_max_rte: u64,

    /// Upper bound of the random back-off before a NAK is sent.
    ///
    /// Minimum value: 1 \
    /// Default value: 50,000
    pub nak_bo_ivl: u64,

    /// Time to wait for an NCF before repeating a NAK.
    ///
    /// Default value: 2,000,000
    pub nak_rpt_ivl: u64,

    /// Time to wait for repair data after an NCF.
    ///
    /// Default value: 2,000,000
    pub nak_rdata_ivl: u64,

    /// Repair data timeouts tolerated before a packet is declared lost.
    ///
    /// Default value: 50
    pub nak_data_retries: u32,

    /// NCF timeouts tolerated before a packet is declared lost.
    ///
    /// Default value: 50
    pub nak_ncf_retries: u32,

    /// Time without an SPM or data after which a remote source is forgotten.
    ///
    /// Default value: 40,960,000
    pub peer_expiry: u64,

    /// Time a new receiver waits for an SPM before soliciting one.
    ///
    /// Default value: 250,000
    pub spmr_expiry: u64,

    /// Interval between SPMs while idle.
    ///
    /// Default value: 8,192,000
    pub spm_ambient_interval: u64,

    /// SPM intervals following each data packet, before reverting to the ambient interval.
    pub spm_heartbeat_intervals: Vec<u64>,

    /// Rate limit for all outbound traffic in bytes per second. Zero disables rate limiting.
    pub rate_per_sec: u64,

    /// Additional rate limit for repair traffic in bytes per second. Zero disables it.
    pub rdata_rate_per_sec: u64,

    /// Enables forward error correction.
    pub fec: Option<FecConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tsi: Tsi::default(),
            dport: DPORT_DEFAULT,
            can_send_data: true,
            can_recv_data: true,
            max_tpdu: MAX_TPDU_DEFAULT,
            iphdr_len: IPHDR_LEN_DEFAULT,
            txw_sqns: WINDOW_SQNS_DEFAULT,
            txw_secs: 0,
            txw_max_rte: 0,
            rxw_sqns: WINDOW_SQNS_DEFAULT,
            rxw_secs: 0,
            rxw_max_rte: 0,
            nak_bo_ivl: NAK_BO_IVL_DEFAULT_US,
            nak_rpt_ivl: NAK_RPT_IVL_DEFAULT_US,
            nak_rdata_ivl: NAK_RDATA_IVL_DEFAULT_US,
            nak_data_retries: NAK_DATA_RETRIES_DEFAULT,
            nak_ncf_retries: NAK_NCF_RETRIES_DEFAULT,
            peer_expiry: PEER_EXPIRY_DEFAULT_US,
            spmr_expiry: SPMR_EXPIRY_DEFAULT_US,
            spm_ambient_interval: SPM_AMBIENT_INTERVAL_DEFAULT_US,
            spm_heartbeat_intervals: SPM_HEARTBEAT_INTERVALS_DEFAULT_US.to_vec(),
            rate_per_sec: 0,
            rdata_rate_per_sec: 0,
            fec: None,
        }
    }
}

impl Config {
    /// Largest payload carried by a single data packet. With FEC enabled, room is left for the
    /// length trailer of variable-length parity.
    pub fn max_tsdu(&self) -> usize {
        let max_tsdu = self.max_tpdu - self.iphdr_len - crate::packet::serial::DATA_OFFSET;
        match self.fec {
            Some(_) => max_tsdu - 2,
            None => max_tsdu,
        }
    }

    pub(crate) fn validate(&self) {
        assert!(
            self.max_tpdu >= MAX_TPDU_MIN,
            "invalid configuration: max_tpdu < {}",
            MAX_TPDU_MIN
        );
        assert!(
            self.max_tpdu <= MAX_TPDU_MAX,
            "invalid configuration: max_tpdu > {}",
            MAX_TPDU_MAX
        );
        assert!(
            self.txw_sqns > 0 || (self.txw_secs > 0 && self.txw_max_rte > 0),
            "invalid configuration: txw_sqns == 0 requires txw_secs and txw_max_rte"
        );
        assert!(
            self.rxw_sqns > 0 || (self.rxw_secs > 0 && self.rxw_max_rte > 0),
            "invalid configuration: rxw_sqns == 0 requires rxw_secs and rxw_max_rte"
        );
        assert!(
            self.nak_bo_ivl > 0,
            "invalid configuration: nak_bo_ivl == 0"
        );
        assert!(
            self.nak_rpt_ivl > 0,
            "invalid configuration: nak_rpt_ivl == 0"
        );
        assert!(
            self.nak_rdata_ivl > 0,
            "invalid configuration: nak_rdata_ivl == 0"
        );
        assert!(
            self.nak_ncf_retries > 0,
            "invalid configuration: nak_ncf_retries == 0"
        );
        assert!(
            self.nak_data_retries > 0,
            "invalid configuration: nak_data_retries == 0"
        );
        assert!(
            self.spm_ambient_interval > 0,
            "invalid configuration: spm_ambient_interval == 0"
        );
        assert!(
            self.spm_heartbeat_intervals.iter().all(|&ivl| ivl > 0),
            "invalid configuration: spm_heartbeat_intervals contains zero"
        );
        assert!(
            self.peer_expiry >= 2 * self.spm_ambient_interval,
            "invalid configuration: peer_expiry < 2 * spm_ambient_interval"
        );

        if let Some(fec) = &self.fec {
            fec.validate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = Config::default();
        config.validate();

        assert_eq!(config.max_tsdu(), 1500 - 28 - 24);
        assert_eq!(config.peer_expiry, 40_960_000);
    }

    #[test]
    #[should_panic(expected = "invalid configuration: fec.rs_k")]
    fn fec_group_size() {
        let config = Config {
            fec: Some(FecConfig {
                rs_n: 8,
                rs_k: 6,
                proactive_h: 0,
                ondemand: true,
            }),
            ..Default::default()
        };
        config.validate();
    }

    #[test]
    #[should_panic(expected = "invalid configuration: rxw_sqns == 0")]
    fn window_sizing() {
        let config = Config {
            rxw_sqns: 0,
            rxw_secs: 10,
            ..Default::default()
        };
        config.validate();
    }
}
